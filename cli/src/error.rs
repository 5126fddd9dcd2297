use std::path::PathBuf;

use contrast_common::api::ErrorResponse;
use contrast_common::ContrastError;
use thiserror::Error;

use crate::verify::VerifyReport;

/// Process exit code for a Coordinator that failed verification.
pub const EXIT_UNTRUSTED: u8 = 1;
/// Process exit code for usage, I/O and network errors.
pub const EXIT_ERROR: u8 = 2;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Coordinator failed verification: {}", .0.errors.join("; "))]
    Untrusted(Box<VerifyReport>),

    #[error("Coordinator returned {status}: {} ({})", body.error, body.kind)]
    Api { status: u16, body: ErrorResponse },

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("descriptor {path}: {reason}")]
    Descriptor { path: PathBuf, reason: String },

    #[error(transparent)]
    Contrast(#[from] ContrastError),
}

impl CliError {
    pub fn exit_code(&self) -> u8 {
        match self {
            CliError::Untrusted(_) => EXIT_UNTRUSTED,
            _ => EXIT_ERROR,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CliError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn parse(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        CliError::Parse {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CliError>;
