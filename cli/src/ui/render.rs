use std::io::Write;

use super::config::UiConfig;
use crate::verify::{explain_check, CheckStatus, VerifyReport, CHECKS, HISTORY_CHECK};

const BOLD: &str = "\x1b[1m";
const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const DIM: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";

/// Structured CLI output renderer.
///
/// Holds a `UiConfig` and a writer (stdout by default, a buffer in tests).
/// Writes are best effort: a closed stdout must not turn a verdict into an
/// error.
pub struct Ui {
    config: UiConfig,
    writer: Box<dyn Write>,
}

impl Ui {
    pub fn stdout(config: UiConfig) -> Self {
        Self {
            config,
            writer: Box::new(std::io::stdout()),
        }
    }

    pub fn new(config: UiConfig, writer: Box<dyn Write>) -> Self {
        Self { config, writer }
    }

    pub fn config(&self) -> &UiConfig {
        &self.config
    }

    fn paint(&self, code: &str, text: &str) -> String {
        if self.config.color {
            format!("{code}{text}{RESET}")
        } else {
            text.to_string()
        }
    }

    pub fn blank(&mut self) {
        if self.config.text {
            let _ = writeln!(self.writer);
        }
    }

    fn line(&mut self, text: &str) {
        if self.config.text {
            let _ = writeln!(self.writer, "  {}", text);
        }
    }

    pub fn header(&mut self, title: &str) {
        let bar = self.paint(DIM, &"=".repeat(62));
        let title = self.paint(BOLD, title);
        self.line(&bar);
        self.line(&title);
        self.line(&bar);
    }

    pub fn section(&mut self, title: &str) {
        let thin = self.paint(DIM, &"-".repeat(62));
        let title = format!("{}:", self.paint(BOLD, title));
        self.line(&thin);
        self.line(&title);
        self.line(&thin);
    }

    pub fn kv(&mut self, key: &str, value: &str) {
        let text = format!("{:<15}{}", format!("{}:", key), value);
        self.line(&text);
    }

    /// Check line with a [PASS]/[FAIL]/[SKIP] badge.
    pub fn check(&mut self, label: &str, status: CheckStatus) {
        let badge = match status {
            CheckStatus::Pass => self.paint(GREEN, "[PASS]"),
            CheckStatus::Fail => self.paint(RED, "[FAIL]"),
            CheckStatus::Skip => self.paint(DIM, "[SKIP]"),
        };
        let text = format!("{:<28}{}", label, badge);
        self.line(&text);
    }

    /// Check line followed by why/fix when the check failed.
    pub fn check_explained(&mut self, label: &str, name: &str, status: CheckStatus) {
        self.check(label, status);
        if let Some(exp) = explain_check(name, status) {
            let why = self.paint(DIM, &format!("  Why: {}", exp.why));
            let fix = self.paint(DIM, &format!("  Fix: {}", exp.fix));
            self.line(&why);
            self.line(&fix);
        }
    }

    pub fn success(&mut self, msg: &str) {
        let text = self.paint(GREEN, &self.paint(BOLD, msg));
        self.line(&text);
    }

    pub fn failure(&mut self, msg: &str) {
        let text = self.paint(RED, &self.paint(BOLD, msg));
        self.line(&text);
    }

    pub fn warn(&mut self, msg: &str) {
        let text = self.paint(YELLOW, msg);
        self.line(&text);
    }

    pub fn bullet(&mut self, msg: &str) {
        let text = format!("  - {}", msg);
        self.line(&text);
    }

    pub fn info(&mut self, msg: &str) {
        self.line(msg);
    }

    /// Full report for one Coordinator verification.
    pub fn verify_report(&mut self, report: &VerifyReport) {
        self.blank();
        self.header("Contrast Coordinator Verification");
        self.blank();
        self.kv("Coordinator", &report.coordinator);
        self.kv("Phase", &report.phase);
        if let Some(hash) = &report.manifest_hash {
            self.kv("Manifest", hash);
        }
        self.kv("Transport key", &report.transport_key);
        self.blank();
        self.section("Checks");
        for (name, label) in CHECKS.iter().chain(std::iter::once(&HISTORY_CHECK)) {
            if report.checks.iter().any(|c| c.name == *name) {
                self.check_explained(label, name, report.status(name));
            }
        }
        if !report.errors.is_empty() {
            self.blank();
            self.warn("Errors:");
            for error in &report.errors {
                self.bullet(error);
            }
        }
        self.blank();
        if report.verified {
            self.success("VERIFIED");
        } else {
            self.failure("UNTRUSTED");
        }
        self.blank();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::Check;
    use std::sync::{Arc, Mutex};

    fn plain_config() -> UiConfig {
        UiConfig {
            color: false,
            text: true,
        }
    }

    struct CaptureBuf {
        inner: Arc<Mutex<Vec<u8>>>,
    }

    impl Write for CaptureBuf {
        fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
            self.inner.lock().unwrap().write(data)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn run_ui(config: UiConfig, f: impl FnOnce(&mut Ui)) -> String {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let mut ui = Ui::new(
            config,
            Box::new(CaptureBuf {
                inner: buf.clone(),
            }),
        );
        f(&mut ui);
        drop(ui);
        let locked = buf.lock().unwrap();
        String::from_utf8(locked.clone()).unwrap()
    }

    fn report(verified: bool) -> VerifyReport {
        let status = if verified {
            CheckStatus::Pass
        } else {
            CheckStatus::Fail
        };
        VerifyReport {
            verified,
            coordinator: "http://127.0.0.1:1313".to_string(),
            phase: "serving".to_string(),
            manifest_hash: Some("ab".repeat(32)),
            transport_key: "05".repeat(32),
            checks: vec![
                Check {
                    name: "vendor_chain".to_string(),
                    status: CheckStatus::Pass,
                    detail: None,
                },
                Check {
                    name: "manifest".to_string(),
                    status,
                    detail: None,
                },
            ],
            errors: if verified {
                vec![]
            } else {
                vec!["manifest: active manifest differs".to_string()]
            },
        }
    }

    #[test]
    fn header_produces_bar_lines() {
        let out = run_ui(plain_config(), |ui| ui.header("Title"));
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("===="));
        assert!(lines[1].contains("Title"));
    }

    #[test]
    fn check_badges() {
        let out = run_ui(plain_config(), |ui| {
            ui.check("Report signature", CheckStatus::Pass);
            ui.check("Reference values", CheckStatus::Fail);
            ui.check("Active manifest", CheckStatus::Skip);
        });
        assert!(out.contains("[PASS]"));
        assert!(out.contains("[FAIL]"));
        assert!(out.contains("[SKIP]"));
    }

    #[test]
    fn ansi_only_in_color_mode() {
        let colored = run_ui(
            UiConfig {
                color: true,
                text: true,
            },
            |ui| ui.check("Sig", CheckStatus::Pass),
        );
        assert!(colored.contains(GREEN));
        let plain = run_ui(plain_config(), |ui| ui.check("Sig", CheckStatus::Pass));
        assert!(!plain.contains("\x1b["));
    }

    #[test]
    fn json_mode_prints_nothing() {
        let out = run_ui(
            UiConfig {
                color: false,
                text: false,
            },
            |ui| ui.verify_report(&report(true)),
        );
        assert!(out.is_empty());
    }

    #[test]
    fn verified_report() {
        let out = run_ui(plain_config(), |ui| ui.verify_report(&report(true)));
        assert!(out.contains("Coordinator:"));
        assert!(out.contains("Vendor certificate chain"));
        assert!(out.contains("VERIFIED"));
        assert!(!out.contains("Why:"));
        // Checks absent from the report are not printed.
        assert!(!out.contains("Manifest history"));
    }

    #[test]
    fn untrusted_report_explains_failures() {
        let out = run_ui(plain_config(), |ui| ui.verify_report(&report(false)));
        assert!(out.contains("[FAIL]"));
        assert!(out.contains("Why:"));
        assert!(out.contains("Fix:"));
        assert!(out.contains("- manifest: active manifest differs"));
        assert!(out.contains("UNTRUSTED"));
    }
}
