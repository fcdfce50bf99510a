//! Crash-survivable checkpointing of the scheduler's instruction table
//! (SPEC_FULL.md §3.1, §4.2 worker-0 checkpointing responsibility).
//!
//! The on-disk file is a single JSON document, written atomically (tmp
//! file + `sync_all` + `rename`, then a best-effort fsync of the parent
//! directory) so a crash mid-write never leaves a half-written file where
//! a well-formed one used to be.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use docbuild_types::BuildInstruction;
use serde::{Deserialize, Serialize};

/// Current on-disk envelope version. Bumped whenever the instruction
/// schema changes in a way that isn't forward-compatible.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Location per SPEC_FULL.md §6 ("Persisted state file"): `<cache>/<server-name>.json`.
pub fn state_path(cache_dir: &Path, server_name: &str) -> PathBuf {
    cache_dir.join(format!("{server_name}.json"))
}

/// The on-disk shape: `{ "schema_version": 1, "instructions": [...] }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedState {
    schema_version: u32,
    instructions: Vec<BuildInstruction>,
}

/// Load the instruction table from `state_dir`. A missing file means a
/// fresh server start (`Ok(vec![])`). A corrupt file or an envelope whose
/// `schema_version` this build doesn't recognize is treated identically
/// per §3.1 error kind 7: the caller's reporter gets a warning and the
/// server starts from empty state rather than refusing to start.
pub fn load_state(cache_dir: &Path, server_name: &str, warn: impl Fn(&str)) -> Result<Vec<BuildInstruction>> {
    let path = state_path(cache_dir, server_name);
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(&path)
        .with_context(|| format!("failed to read state file {}", path.display()))?;

    let parsed: Result<PersistedState, _> = serde_json::from_str(&content);
    match parsed {
        Ok(state) if state.schema_version == CURRENT_SCHEMA_VERSION => Ok(state.instructions),
        Ok(state) => {
            warn(&format!(
                "state file {} has unrecognized schema_version {} (expected {}); starting from empty state",
                path.display(),
                state.schema_version,
                CURRENT_SCHEMA_VERSION
            ));
            Ok(Vec::new())
        }
        Err(e) => {
            warn(&format!(
                "state file {} is corrupt ({e}); starting from empty state",
                path.display()
            ));
            Ok(Vec::new())
        }
    }
}

/// Atomically checkpoint the instruction table to `<cache_dir>/<server_name>.json`.
pub fn save_state(cache_dir: &Path, server_name: &str, instructions: &[BuildInstruction]) -> Result<()> {
    fs::create_dir_all(cache_dir)
        .with_context(|| format!("failed to create cache dir {}", cache_dir.display()))?;

    let envelope = PersistedState {
        schema_version: CURRENT_SCHEMA_VERSION,
        instructions: instructions.to_vec(),
    };

    atomic_write_json(&state_path(cache_dir, server_name), &envelope)
}

fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let data = serde_json::to_vec_pretty(value).context("failed to serialize state JSON")?;

    {
        let mut f = fs::File::create(&tmp)
            .with_context(|| format!("failed to create tmp file {}", tmp.display()))?;
        f.write_all(&data)
            .with_context(|| format!("failed to write tmp file {}", tmp.display()))?;
        f.sync_all().ok();
    }

    fs::rename(&tmp, path).with_context(|| {
        format!(
            "failed to rename tmp file {} to {}",
            tmp.display(),
            path.display()
        )
    })?;

    fsync_parent_dir(path);
    Ok(())
}

fn fsync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent()
        && let Ok(dir) = fs::File::open(parent)
    {
        let _ = dir.sync_all();
    }
}
