//! Build orchestrator core (SPEC_FULL.md §2-§6): the scheduler, the
//! instruction handler, the deliverable executor, the resource-lock
//! registry, and the HTTP control plane.
//!
//! This crate has no `main` of its own — `docbuild-server` wires a
//! [`Config`](docbuild_config::Config), a [`scheduler::Scheduler`], its
//! worker pool, and the [`control_plane`] accept loop together into a
//! running process. Splitting it this way keeps the orchestration logic
//! unit-testable without spawning real threads or binding real sockets.

pub mod collaborators;
pub mod control_plane;
pub mod deliverable;
pub mod handler;
pub mod lock;
pub mod reporter;
pub mod scheduler;
pub mod stitched;

pub use reporter::{Reporter, StderrReporter};
pub use scheduler::{Scheduler, SubmitOutcome, spawn_workers};
