//! Core data model for the documentation build server.
//!
//! This crate has no I/O and no process spawning: it only defines the
//! record shapes that flow between the control plane, the scheduler, the
//! instruction handler, and the deliverable executor, plus the
//! deterministic digest-id scheme used to identify instructions and
//! deliverables.
//!
//! # Key types
//!
//! - [`BuildInstruction`] — a request to (re)build one (target, product,
//!   docset, language) tuple.
//! - [`Deliverable`] — one (dc-file, output-format) unit within an
//!   instruction.
//! - [`LockKind`] — the two resource-lock types recognized by the
//!   lock registry.
//!
//! IDs are 9 hex digit digests (`digest9`) over the tuple's fields;
//! identical tuples always produce identical ids.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Truncated SHA-256 digest of the given parts, joined and hashed as one
/// string, rendered as 9 lowercase hex characters.
///
/// Collisions are treated as idempotent duplicates by callers (instruction
/// submission is a no-op if the id already exists), so 9 hex digits (36
/// bits) is ample for the expected cardinality of one build server's
/// instruction set.
pub fn digest9(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(b"\0");
    }
    let out = hasher.finalize();
    hex::encode(out)[..9].to_string()
}

/// Output format for a deliverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    Html,
    SingleHtml,
    Pdf,
    Epub,
}

impl OutputFormat {
    /// All formats in the order the stitched config's `<format>` attributes
    /// are conventionally listed.
    pub const ALL: [OutputFormat; 4] = [
        OutputFormat::Html,
        OutputFormat::SingleHtml,
        OutputFormat::Pdf,
        OutputFormat::Epub,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Html => "html",
            OutputFormat::SingleHtml => "single-html",
            OutputFormat::Pdf => "pdf",
            OutputFormat::Epub => "epub",
        }
    }

    /// Whether this format lays out its output under a dc-slug
    /// subdirectory (html/single-html) or directly under the format
    /// directory (pdf/epub). See §4.4 step 4.
    pub fn nests_under_dc_slug(self) -> bool {
        matches!(self, OutputFormat::Html | OutputFormat::SingleHtml)
    }
}

/// Publication lifecycle of a docset, read from the stitched config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Supported,
    Beta,
    Unsupported,
    Unpublished,
}

impl Lifecycle {
    /// Whether this lifecycle forces `--draft` on the DAPS invocation
    /// regardless of the target's own draft flag. Only `unpublished` does,
    /// per the latest source behavior (SPEC_FULL.md §9.1).
    pub fn forces_draft(self) -> bool {
        matches!(self, Lifecycle::Unpublished)
    }
}

/// Navigation page generation mode for a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NavigationMode {
    Linked,
    Hidden,
    Disabled,
}

impl NavigationMode {
    /// Whether finalize should invoke the navigation builder at all.
    pub fn builds_navigation(self) -> bool {
        matches!(self, NavigationMode::Linked | NavigationMode::Hidden)
    }
}

/// Lifecycle-stage status of a [`BuildInstruction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstructionStatus {
    Scheduled,
    Initializing,
    Building,
    Publishing,
    Done,
    Failed,
}

/// Terminal/in-flight status of a [`Deliverable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverableStatus {
    Queued,
    Building,
    Success,
    Fail,
}

impl DeliverableStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, DeliverableStatus::Success | DeliverableStatus::Fail)
    }
}

/// The two resource-lock types recognized by the lock registry (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockKind {
    GitRemote,
    BackupDir,
}

/// One (dc-file, output-format) unit of work within an instruction.
///
/// Field names match the wire shape in SPEC_FULL.md §6 ("Deliverable
/// record (JSON)") so that the control plane can serialize this struct
/// directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deliverable {
    pub id: String,
    #[serde(rename = "dc")]
    pub dc_file: String,
    pub build_format: OutputFormat,
    /// Root-ids of sub-deliverables nested within this dc-file.
    pub subdeliverables: Vec<String>,
    /// XSLT `<param>` name/value overrides from the stitched config.
    #[serde(default)]
    pub xslt_params: HashMap<String, String>,
    /// Per-deliverable container image override, if the stitched config
    /// specified one.
    #[serde(default)]
    pub container_image: Option<String>,
    pub status: DeliverableStatus,
    /// Title extracted from the bigfile after a successful build.
    #[serde(default)]
    pub title: Option<String>,
    /// Output path relative to the instruction's temp tree / backup path.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub last_build_attempt_commit: Option<String>,
    #[serde(default)]
    pub successful_build_commit: Option<String>,
    /// Content digest of the dc file (and root-id, for sub-deliverables),
    /// produced by the dc-hash tool.
    #[serde(default)]
    pub dc_hash: Option<String>,
}

impl Deliverable {
    /// Digest id over (target, product, docset, lang, dc_file, format),
    /// per SPEC_FULL.md §3.
    pub fn make_id(
        target: &str,
        product: &str,
        docset: &str,
        lang: &str,
        dc_file: &str,
        format: OutputFormat,
    ) -> String {
        digest9(&[target, product, docset, lang, dc_file, format.as_str()])
    }
}

/// A request to (re)build one (target, product, docset, language) tuple.
///
/// Field names again match SPEC_FULL.md §6's submitted-instruction wire
/// shape directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildInstruction {
    pub id: String,
    pub target: String,
    pub docset: String,
    pub lang: String,
    pub product: String,
    #[serde(default)]
    pub commit: Option<String>,
    pub status: InstructionStatus,
    /// Deliverable ids awaiting execution. LIFO: popped from the tail
    /// (§5 "Ordering guarantees").
    #[serde(default)]
    pub open: Vec<String>,
    /// Deliverable ids currently executing.
    #[serde(default)]
    pub building: Vec<String>,
    /// All deliverables belonging to this instruction, keyed by id.
    #[serde(default)]
    pub deliverables: HashMap<String, Deliverable>,
    pub created_at: DateTime<Utc>,
}

impl BuildInstruction {
    /// Digest id over (target, product, docset, lang), per SPEC_FULL.md §3.
    pub fn make_id(target: &str, product: &str, docset: &str, lang: &str) -> String {
        digest9(&[target, product, docset, lang])
    }

    /// Overall status per §4.3 finalize step 1: success iff every
    /// deliverable succeeded, or there were none and init succeeded.
    pub fn all_deliverables_succeeded(&self) -> bool {
        self.deliverables
            .values()
            .all(|d| d.status == DeliverableStatus::Success)
    }
}

/// A build request as submitted over the control plane's POST endpoint,
/// before it has been assigned an id or validated (§6).
#[derive(Debug, Clone, Deserialize)]
pub struct SubmittedInstruction {
    pub target: String,
    pub docset: String,
    pub lang: String,
    pub product: String,
}

impl SubmittedInstruction {
    pub fn instruction_id(&self) -> String {
        BuildInstruction::make_id(&self.target, &self.product, &self.docset, &self.lang)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest9_is_deterministic() {
        let a = digest9(&["main", "demo", "1.0", "en-us"]);
        let b = digest9(&["main", "demo", "1.0", "en-us"]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 9);
    }

    #[test]
    fn digest9_distinguishes_field_order_and_boundaries() {
        let a = digest9(&["ab", "c"]);
        let b = digest9(&["a", "bc"]);
        assert_ne!(a, b);
    }

    #[test]
    fn instruction_id_matches_deliverable_id_prefix_fields() {
        let iid = BuildInstruction::make_id("main", "demo", "1.0", "en-us");
        let did = Deliverable::make_id("main", "demo", "1.0", "en-us", "DC-demo", OutputFormat::Html);
        assert_ne!(iid, did);
    }

    #[test]
    fn deliverable_status_is_terminal_only_for_success_and_fail() {
        assert!(!DeliverableStatus::Queued.is_terminal());
        assert!(!DeliverableStatus::Building.is_terminal());
        assert!(DeliverableStatus::Success.is_terminal());
        assert!(DeliverableStatus::Fail.is_terminal());
    }

    #[test]
    fn lifecycle_forces_draft_only_for_unpublished() {
        assert!(Lifecycle::Unpublished.forces_draft());
        assert!(!Lifecycle::Beta.forces_draft());
        assert!(!Lifecycle::Supported.forces_draft());
        assert!(!Lifecycle::Unsupported.forces_draft());
    }

    #[test]
    fn output_format_serializes_single_html_with_hyphen() {
        let json = serde_json::to_string(&OutputFormat::SingleHtml).unwrap();
        assert_eq!(json, "\"single-html\"");
    }

    #[test]
    fn deliverable_round_trips_through_json() {
        let d = Deliverable {
            id: "abc123def".into(),
            dc_file: "DC-demo".into(),
            build_format: OutputFormat::Html,
            subdeliverables: vec!["root1".into()],
            xslt_params: HashMap::new(),
            container_image: None,
            status: DeliverableStatus::Queued,
            title: None,
            path: None,
            last_build_attempt_commit: None,
            successful_build_commit: None,
            dc_hash: None,
        };
        let json = serde_json::to_string(&d).unwrap();
        let parsed: Deliverable = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, d.id);
        assert_eq!(parsed.dc_file, d.dc_file);
    }

    #[test]
    fn deliverable_wire_shape_matches_snapshot() {
        let d = Deliverable {
            id: "abc123def".into(),
            dc_file: "DC-demo".into(),
            build_format: OutputFormat::SingleHtml,
            subdeliverables: vec!["root-overview".into()],
            xslt_params: HashMap::new(),
            container_image: None,
            status: DeliverableStatus::Success,
            title: Some("Demo Guide".into()),
            path: Some("demo/1.0/en-us/single-html/DC-demo".into()),
            last_build_attempt_commit: Some("deadbeef".into()),
            successful_build_commit: Some("deadbeef".into()),
            dc_hash: Some("feedface".into()),
        };
        insta::assert_json_snapshot!(d);
    }

    #[test]
    fn all_deliverables_succeeded_is_true_when_empty() {
        let bi = BuildInstruction {
            id: "x".into(),
            target: "main".into(),
            docset: "1.0".into(),
            lang: "en-us".into(),
            product: "demo".into(),
            commit: None,
            status: InstructionStatus::Building,
            open: vec![],
            building: vec![],
            deliverables: HashMap::new(),
            created_at: Utc::now(),
        };
        assert!(bi.all_deliverables_succeeded());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn digest9_always_nine_hex_chars(a in "[a-z0-9]{0,12}", b in "[a-z0-9]{0,12}") {
                let d = digest9(&[&a, &b]);
                prop_assert_eq!(d.len(), 9);
                prop_assert!(d.chars().all(|c| c.is_ascii_hexdigit()));
            }

            #[test]
            fn digest9_same_input_same_output(a in "[a-z0-9]{1,12}", b in "[a-z0-9]{1,12}", c in "[a-z0-9]{1,12}", d in "[a-z0-9]{1,12}") {
                let id1 = BuildInstruction::make_id(&a, &b, &c, &d);
                let id2 = BuildInstruction::make_id(&a, &b, &c, &d);
                prop_assert_eq!(id1, id2);
            }
        }
    }
}
