//! Diagnostic reporting (SPEC_FULL.md §4.6).
//!
//! No global logging crate: a `Reporter` is threaded by reference (or
//! `Arc` across thread boundaries) into the scheduler, instruction
//! handler, and deliverable executor instead, mirroring `shipper-cli`'s
//! `Reporter` trait.

use chrono::Utc;

pub trait Reporter: Send + Sync {
    fn info(&self, msg: &str);
    fn warn(&self, msg: &str);
    fn error(&self, msg: &str);
}

/// Default reporter: structured `[level] message` lines to stderr with a
/// timestamp prefix, in the donor's `eprintln!`-based style.
///
/// `loglevel` follows `[server].loglevel` (§1.1): `0` shows only warnings
/// and errors, `1` (the default) adds info, `2` and above is unclamped and
/// behaves the same as `1` since this reporter has no separate debug tier.
#[derive(Debug, Clone, Copy)]
pub struct StderrReporter {
    loglevel: u8,
}

impl Default for StderrReporter {
    fn default() -> Self {
        Self::new(1)
    }
}

impl StderrReporter {
    pub fn new(loglevel: u8) -> Self {
        Self { loglevel }
    }
}

impl Reporter for StderrReporter {
    fn info(&self, msg: &str) {
        if self.loglevel >= 1 {
            eprintln!("{} [info] {msg}", Utc::now().to_rfc3339());
        }
    }

    fn warn(&self, msg: &str) {
        eprintln!("{} [warn] {msg}", Utc::now().to_rfc3339());
    }

    fn error(&self, msg: &str) {
        eprintln!("{} [error] {msg}", Utc::now().to_rfc3339());
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::RecordingReporter;
    use super::*;

    #[test]
    fn recording_reporter_captures_messages() {
        let reporter = RecordingReporter::new();
        reporter.info("hello");
        reporter.warn("careful");
        reporter.error("boom");
        assert!(reporter.contains("info", "hello"));
        assert!(reporter.contains("warn", "careful"));
        assert!(reporter.contains("error", "boom"));
    }

    #[test]
    fn stderr_reporter_does_not_panic() {
        let reporter = StderrReporter::default();
        reporter.info("test info line");
    }

    #[test]
    fn stderr_reporter_at_loglevel_zero_still_reports_warn_and_error() {
        let reporter = StderrReporter::new(0);
        reporter.info("suppressed");
        reporter.warn("still shown");
        reporter.error("still shown");
    }
}
