//! Append-only event log for instruction and deliverable lifecycle
//! transitions (SPEC_FULL.md §4.7).
//!
//! Worker 0 flushes the in-memory log to `<cache>/<server-name>-events.jsonl`
//! alongside its state checkpoint. This is purely observability: nothing in
//! the scheduler reads the log back to make decisions.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use docbuild_types::{DeliverableStatus, InstructionStatus, LockKind};
use serde::{Deserialize, Serialize};

pub const EVENTS_FILE_SUFFIX: &str = "-events.jsonl";

pub fn events_path(cache_dir: &Path, server_name: &str) -> PathBuf {
    cache_dir.join(format!("{server_name}{EVENTS_FILE_SUFFIX}"))
}

/// One lifecycle transition, tagged by kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    InstructionScheduled,
    InstructionInitializing,
    InstructionActive,
    InstructionFinished { status: InstructionStatus },
    DeliverableQueued,
    DeliverableBuilding,
    DeliverableFinished { status: DeliverableStatus },
    LockAcquired { lock_type: LockKind, resource: String },
    LockReleased { lock_type: LockKind, resource: String },
}

/// A timestamped, instruction-scoped event record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub instruction_id: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// In-memory event log, periodically flushed to the JSONL file on disk.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<Event>,
}

impl EventLog {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn record(&mut self, instruction_id: impl Into<String>, kind: EventKind) {
        self.events.push(Event {
            timestamp: Utc::now(),
            instruction_id: instruction_id.into(),
            kind,
        });
    }

    /// Append all recorded-but-unflushed events to `path` in JSONL format,
    /// then clear the in-memory buffer.
    pub fn flush_to_file(&mut self, path: &Path) -> Result<()> {
        if self.events.is_empty() {
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create events dir {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;

        let mut writer = std::io::BufWriter::new(file);
        for event in &self.events {
            let line = serde_json::to_string(event).context("failed to serialize event")?;
            writeln!(writer, "{line}").context("failed to write event line")?;
        }
        writer.flush().context("failed to flush events file")?;

        self.events.clear();
        Ok(())
    }

    pub fn read_from_file(path: &Path) -> Result<Vec<Event>> {
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;
        let reader = BufReader::new(file);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line.with_context(|| {
                format!("failed to read line from events file {}", path.display())
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line)
                .with_context(|| format!("failed to parse event JSON from line: {line}"))?;
            events.push(event);
        }
        Ok(events)
    }

    pub fn events_for_instruction<'a>(&'a self, instruction_id: &str) -> Vec<&'a Event> {
        self.events
            .iter()
            .filter(|e| e.instruction_id == instruction_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
