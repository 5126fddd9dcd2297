//! Contrast command line: generate policies and a manifest from workload
//! descriptors, set it on the Coordinator, verify the Coordinator as a
//! relying party and recover it after a restart.

pub mod client;
pub mod error;
pub mod generate;
pub mod recover;
pub mod set;
pub mod ui;
pub mod verify;
pub mod workspace;

pub use client::CoordinatorClient;
pub use error::{CliError, Result, EXIT_ERROR, EXIT_UNTRUSTED};
pub use verify::{CheckStatus, VerifyReport};
pub use workspace::Workspace;
