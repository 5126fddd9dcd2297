use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use contrast_common::{AuditLogEntry, AuditSeverity};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Entries kept in memory for inspection; the file sink keeps everything.
const MEMORY_CAPACITY: usize = 10_000;

/// Append-only audit trail of security events.
pub struct AuditLog {
    recent: Mutex<VecDeque<AuditLogEntry>>,
    /// Held across a write so lines land in record order.
    sink: Option<Mutex<PathBuf>>,
    sink_failures: AtomicU64,
}

impl AuditLog {
    pub fn in_memory() -> Self {
        Self {
            recent: Mutex::new(VecDeque::new()),
            sink: None,
            sink_failures: AtomicU64::new(0),
        }
    }

    /// Also append every entry as a JSON line to `path`.
    pub fn with_file(path: PathBuf) -> Self {
        Self {
            recent: Mutex::new(VecDeque::new()),
            sink: Some(Mutex::new(path)),
            sink_failures: AtomicU64::new(0),
        }
    }

    pub async fn record(&self, entry: AuditLogEntry) {
        match entry.severity {
            AuditSeverity::Info => info!(
                event = "audit_log",
                event_type = ?entry.event_type,
                policy_digest = ?entry.policy_digest,
                manifest_hash = ?entry.manifest_hash,
                details = ?entry.details,
                "[AUDIT]"
            ),
            _ => warn!(
                event = "audit_log",
                event_type = ?entry.event_type,
                severity = ?entry.severity,
                policy_digest = ?entry.policy_digest,
                manifest_hash = ?entry.manifest_hash,
                details = ?entry.details,
                "[AUDIT]"
            ),
        }

        if let Some(sink) = &self.sink {
            let path = sink.lock().await;
            let line = entry.clone();
            let target = path.clone();
            let written = tokio::task::spawn_blocking(move || append_line(&target, &line))
                .await
                .unwrap_or_else(|e| Err(std::io::Error::other(e)));
            if let Err(e) = written {
                let failures = self.sink_failures.fetch_add(1, Ordering::Relaxed) + 1;
                error!(
                    event = "audit_sink_error",
                    path = %path.display(),
                    failures,
                    error = %e,
                    "audit entry not persisted"
                );
            }
        }

        let mut recent = self.recent.lock().await;
        if recent.len() == MEMORY_CAPACITY {
            recent.pop_front();
        }
        recent.push_back(entry);
    }

    /// Entries the file sink failed to persist since startup.
    pub fn sink_failures(&self) -> u64 {
        self.sink_failures.load(Ordering::Relaxed)
    }

    /// Snapshot of the most recent entries, oldest first.
    pub async fn entries(&self) -> Vec<AuditLogEntry> {
        self.recent.lock().await.iter().cloned().collect()
    }
}

fn append_line(path: &Path, entry: &AuditLogEntry) -> std::io::Result<()> {
    let line = serde_json::to_string(entry)? + "\n";
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use contrast_common::AuditEventType;

    #[tokio::test]
    async fn test_entries_are_appended_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::with_file(path.clone());

        log.record(AuditLogEntry::new(AuditEventType::ManifestSet, AuditSeverity::Info))
            .await;
        log.record(AuditLogEntry::new(
            AuditEventType::AttestationRejected,
            AuditSeverity::Warning,
        ))
        .await;

        let entries = log.entries().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(log.sink_failures(), 0);
        assert_eq!(entries[0].event_type, AuditEventType::ManifestSet);

        let written = std::fs::read_to_string(path).unwrap();
        assert_eq!(written.lines().count(), 2);
        let last: AuditLogEntry = serde_json::from_str(written.lines().last().unwrap()).unwrap();
        assert_eq!(last.event_type, AuditEventType::AttestationRejected);
    }

    #[tokio::test]
    async fn test_sink_failures_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened for appending.
        let log = AuditLog::with_file(dir.path().to_path_buf());

        log.record(AuditLogEntry::new(AuditEventType::ManifestSet, AuditSeverity::Info))
            .await;
        log.record(AuditLogEntry::new(AuditEventType::ManifestSet, AuditSeverity::Info))
            .await;

        assert_eq!(log.sink_failures(), 2);
        assert_eq!(log.entries().await.len(), 2);
        assert_eq!(AuditLog::in_memory().sink_failures(), 0);
    }
}
