//! Maintainer failure notifications (SPEC_FULL.md §7, §7.1, §1.1 `[notify]`).
//!
//! Delivery is fire-and-forget: a failed send is logged by the caller, never
//! escalated, and never blocks the scheduler. Two transports are supported,
//! matching the distilled spec's "local sendmail or drop a timestamped text
//! file" wording and the donor's `mail()` subprocess pattern.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Payloads longer than this are truncated before delivery, per §7's
/// "≈100 KB to bound mail size" rule.
pub const DEFAULT_TRUNCATION_LIMIT: usize = 100_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "mode")]
pub enum NotifyMode {
    Sendmail { binary_path: String },
    FileDrop { drop_dir: PathBuf },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    pub enabled: bool,
    #[serde(flatten)]
    pub mode: NotifyMode,
    #[serde(default = "default_truncation_limit")]
    pub truncation_limit: usize,
}

fn default_truncation_limit() -> usize {
    DEFAULT_TRUNCATION_LIMIT
}

/// Truncate `text` to `limit` bytes at a char boundary, appending a marker
/// noting how much was cut.
pub fn truncate_payload(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut boundary = limit;
    while boundary > 0 && !text.is_char_boundary(boundary) {
        boundary -= 1;
    }
    let cut = text.len() - boundary;
    format!("{}\n... [truncated {cut} bytes]", &text[..boundary])
}

/// Compose and deliver a notification to `maintainers`. Blocking: callers
/// that want fire-and-forget semantics should run this on a spawned thread
/// (the scheduler does, per §4.4's failure-handling steps).
pub fn notify(
    config: &NotifyConfig,
    maintainers: &[String],
    subject: &str,
    body: &str,
) -> Result<()> {
    if !config.enabled || maintainers.is_empty() {
        return Ok(());
    }

    let truncated_body = truncate_payload(body, config.truncation_limit);

    match &config.mode {
        NotifyMode::Sendmail { binary_path } => {
            send_via_sendmail(binary_path, maintainers, subject, &truncated_body)
        }
        NotifyMode::FileDrop { drop_dir } => {
            drop_to_file(drop_dir, maintainers, subject, &truncated_body)
        }
    }
}

fn send_via_sendmail(
    binary_path: &str,
    maintainers: &[String],
    subject: &str,
    body: &str,
) -> Result<()> {
    let message = format!(
        "To: {}\nSubject: {}\n\n{}\n",
        maintainers.join(", "),
        subject,
        body
    );

    // sendmail -t -oi reads recipients from the To: header and ignores a
    // lone "." as end-of-input, matching the donor source's invocation.
    let mut child = Command::new(binary_path)
        .args(["-t", "-oi"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn sendmail binary {binary_path}"))?;

    child
        .stdin
        .take()
        .context("sendmail child has no stdin")?
        .write_all(message.as_bytes())
        .context("failed to write message to sendmail stdin")?;

    let output = child
        .wait_with_output()
        .with_context(|| format!("failed to wait for sendmail binary {binary_path}"))?;

    if !output.status.success() {
        anyhow::bail!(
            "sendmail exited non-zero: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

fn drop_to_file(drop_dir: &std::path::Path, maintainers: &[String], subject: &str, body: &str) -> Result<()> {
    std::fs::create_dir_all(drop_dir)
        .with_context(|| format!("failed to create notify drop dir {}", drop_dir.display()))?;

    let timestamp = Utc::now().format("%Y%m%dT%H%M%S%.fZ");
    let slug: String = subject
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .take(40)
        .collect();
    let path = drop_dir.join(format!("{timestamp}-{slug}.txt"));

    let content = format!("To: {}\nSubject: {}\n\n{}\n", maintainers.join(", "), subject, body);
    std::fs::write(&path, content)
        .with_context(|| format!("failed to write notification file {}", path.display()))
}
