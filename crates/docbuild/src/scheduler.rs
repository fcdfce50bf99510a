//! Scheduler (SPEC_FULL.md §4.2): the five shared collections, the
//! worker-pool loop, and worker-0 checkpointing. Grounded on
//! `original_source/src/docserv/docserv.py`'s `DocservState` and worker
//! loop, generalized per design note §9 ("from global mutable module
//! state to injected context").
//!
//! Each collection lives behind its own mutex and no two are ever held
//! simultaneously (§5 "Shared-resource policy"), mirroring the donor's
//! `shipper/src/engine_parallel.rs` pattern of one mutex per concern
//! rather than one coarse lock. A per-instruction's open/building/map
//! triple (§5: "three dedicated mutexes") is collapsed into the single
//! `Mutex<BuildInstruction>` each active instruction is stored behind —
//! a single mutex trivially satisfies "never deadlocks" and is recorded
//! as a deliberate simplification in DESIGN.md.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use docbuild_config::Config;
use docbuild_events::{EventKind, EventLog};
use docbuild_types::{
    BuildInstruction, Deliverable, DeliverableStatus, InstructionStatus, SubmittedInstruction,
};

use crate::deliverable::{self, DeliverableJob};
use crate::handler::{self, InstructionContext};
use crate::lock::LockRegistry;
use crate::reporter::Reporter;
use crate::stitched::StitchedConfig;

const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Outcome of submitting one instruction descriptor to the scheduler
/// (§4.1 "Enqueue semantics").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued,
    AlreadyPending,
    Reenqueued,
}

pub struct Scheduler {
    config: Config,
    scheduled: Mutex<HashMap<String, BuildInstruction>>,
    updating: Mutex<HashSet<String>>,
    active: Mutex<HashMap<String, Arc<Mutex<BuildInstruction>>>>,
    active_ids: Mutex<VecDeque<String>>,
    contexts: Mutex<HashMap<String, Arc<InstructionContext>>>,
    past: Mutex<HashMap<String, BuildInstruction>>,
    lock_registry: LockRegistry,
    events: Mutex<EventLog>,
    shutdown: AtomicBool,
}

impl Scheduler {
    /// Build a scheduler, bucketing any previously-persisted instructions
    /// per §6: records with non-empty `open` or `building` are re-queued
    /// as scheduled (deliverables still `building` are moved back to
    /// `open` since nothing is actually in flight after a restart); all
    /// others go straight to `past`.
    pub fn new(config: Config, loaded: Vec<BuildInstruction>, reporter: &dyn Reporter) -> Self {
        let mut scheduled = HashMap::new();
        let mut past = HashMap::new();

        for mut instruction in loaded {
            if !instruction.open.is_empty() || !instruction.building.is_empty() {
                for id in instruction.building.drain(..) {
                    instruction.open.push(id);
                }
                instruction.status = InstructionStatus::Scheduled;
                reporter.info(&format!("resuming instruction {} as scheduled", instruction.id));
                scheduled.insert(instruction.id.clone(), instruction);
            } else {
                past.insert(instruction.id.clone(), instruction);
            }
        }

        Self {
            config,
            scheduled: Mutex::new(scheduled),
            updating: Mutex::new(HashSet::new()),
            active: Mutex::new(HashMap::new()),
            active_ids: Mutex::new(VecDeque::new()),
            contexts: Mutex::new(HashMap::new()),
            past: Mutex::new(past),
            lock_registry: LockRegistry::new(),
            events: Mutex::new(EventLog::new()),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Whether shutdown has been requested, checked by the control plane's
    /// accept loop between polls (§4.2 "Cancellation").
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Submit one instruction descriptor (§4.1 enqueue semantics).
    pub fn submit(&self, submitted: &SubmittedInstruction, reporter: &dyn Reporter) -> SubmitOutcome {
        let id = submitted.instruction_id();

        if self.scheduled.lock().unwrap().contains_key(&id) || self.active.lock().unwrap().contains_key(&id) {
            reporter.info(&format!("instruction {id} already pending, ignoring resubmission"));
            return SubmitOutcome::AlreadyPending;
        }

        if let Some(mut instruction) = self.past.lock().unwrap().remove(&id) {
            instruction.status = InstructionStatus::Scheduled;
            instruction.open = instruction.deliverables.keys().cloned().collect();
            instruction.building.clear();
            self.scheduled.lock().unwrap().insert(id.clone(), instruction);
            self.events.lock().unwrap().record(id, EventKind::InstructionScheduled);
            return SubmitOutcome::Reenqueued;
        }

        let instruction = BuildInstruction {
            id: id.clone(),
            target: submitted.target.clone(),
            product: submitted.product.clone(),
            docset: submitted.docset.clone(),
            lang: submitted.lang.clone(),
            commit: None,
            status: InstructionStatus::Scheduled,
            open: Vec::new(),
            building: Vec::new(),
            deliverables: HashMap::new(),
            created_at: chrono::Utc::now(),
        };
        self.scheduled.lock().unwrap().insert(id.clone(), instruction);
        self.events.lock().unwrap().record(id, EventKind::InstructionScheduled);
        SubmitOutcome::Queued
    }

    /// All instructions (scheduled + active + past), for `GET
    /// /build_instructions/`.
    pub fn snapshot_all(&self) -> Vec<BuildInstruction> {
        let mut all: Vec<BuildInstruction> = self.scheduled.lock().unwrap().values().cloned().collect();
        all.extend(self.active.lock().unwrap().values().map(|i| i.lock().unwrap().clone()));
        all.extend(self.past.lock().unwrap().values().cloned());
        all
    }

    /// Deliverables map of all currently-active instructions, for `GET
    /// /deliverables/`.
    pub fn snapshot_active_deliverables(&self) -> HashMap<String, Deliverable> {
        let mut out = HashMap::new();
        for instruction in self.active.lock().unwrap().values() {
            let instruction = instruction.lock().unwrap();
            out.extend(instruction.deliverables.clone());
        }
        out
    }

    /// Run one worker loop iteration. Returns `true` if the worker did any
    /// work (used only to decide whether to skip the poll-interval sleep).
    fn tick(&self, reporter: &dyn Reporter) -> bool {
        let did_init = self.try_initialize_one(reporter);
        let did_dispense = self.try_dispense_one(reporter);
        did_init || did_dispense
    }

    fn try_initialize_one(&self, reporter: &dyn Reporter) -> bool {
        let claimed_id = {
            let scheduled = self.scheduled.lock().unwrap();
            let mut updating = self.updating.lock().unwrap();
            scheduled
                .keys()
                .find(|id| !updating.contains(*id))
                .cloned()
                .inspect(|id| {
                    updating.insert(id.clone());
                })
        };
        let Some(id) = claimed_id else {
            return false;
        };

        let mut instruction = self.scheduled.lock().unwrap().get(&id).cloned().expect("claimed id present");

        let target_name = instruction.target.clone();
        let Some(target) = self.config.target(&target_name).cloned() else {
            self.fail_instruction(id, instruction, reporter);
            return true;
        };

        match handler::initialize(
            &self.config.server,
            &target_name,
            &target,
            &mut instruction,
            &self.lock_registry,
            &self.events,
            &self.config.notify,
            reporter,
        ) {
            Ok(ctx) => {
                if let Ok(stitched) = StitchedConfig::load(&ctx.stitched_config_path) {
                    handler::enumerate_deliverables(&mut instruction, &stitched);
                }
                instruction.status = InstructionStatus::Building;

                let id = instruction.id.clone();
                self.scheduled.lock().unwrap().remove(&id);
                self.updating.lock().unwrap().remove(&id);
                self.contexts.lock().unwrap().insert(id.clone(), Arc::new(ctx));
                self.active.lock().unwrap().insert(id.clone(), Arc::new(Mutex::new(instruction)));
                self.active_ids.lock().unwrap().push_back(id.clone());
                self.events.lock().unwrap().record(id, EventKind::InstructionActive);
            }
            Err(e) => {
                reporter.error(&format!("initialization failed for instruction {id}: {e:#}"));
                self.updating.lock().unwrap().remove(&id);
                self.fail_instruction(id, instruction, reporter);
            }
        }
        true
    }

    fn fail_instruction(&self, id: String, mut instruction: BuildInstruction, reporter: &dyn Reporter) {
        instruction.status = InstructionStatus::Failed;
        self.scheduled.lock().unwrap().remove(&id);
        self.events
            .lock()
            .unwrap()
            .record(id.clone(), EventKind::InstructionFinished { status: InstructionStatus::Failed });
        reporter.warn(&format!("instruction {id} moved to past as failed"));
        self.past.lock().unwrap().insert(id, instruction);
    }

    fn try_dispense_one(&self, reporter: &dyn Reporter) -> bool {
        let Some(id) = self.active_ids.lock().unwrap().pop_front() else {
            return false;
        };

        let Some(handle) = self.active.lock().unwrap().get(&id).cloned() else {
            return true;
        };

        // Pop one open deliverable id (LIFO, per §5 ordering guarantees).
        let next_deliverable_id = {
            let mut instruction = handle.lock().unwrap();
            match instruction.open.pop() {
                Some(did) => {
                    instruction.building.push(did.clone());
                    Some(did)
                }
                None => None,
            }
        };

        match next_deliverable_id {
            Some(did) => {
                self.active_ids.lock().unwrap().push_back(id.clone());
                self.run_deliverable(&id, &handle, &did, reporter);
            }
            None => {
                let still_building = !handle.lock().unwrap().building.is_empty();
                if still_building {
                    self.active_ids.lock().unwrap().push_back(id.clone());
                } else {
                    self.finish_instruction(id, handle, reporter);
                }
            }
        }
        true
    }

    fn run_deliverable(
        &self,
        instruction_id: &str,
        handle: &Arc<Mutex<BuildInstruction>>,
        deliverable_id: &str,
        reporter: &dyn Reporter,
    ) {
        let Some(ctx) = self.contexts.lock().unwrap().get(instruction_id).cloned() else {
            return;
        };
        let target_name = handle.lock().unwrap().target.clone();
        let Some(target) = self.config.target(&target_name).cloned() else {
            return;
        };
        let default_params = deliverable::load_default_params(&target.default_xslt_params).unwrap_or_default();

        let (target_str, product, docset, lang, commit) = {
            let instruction = handle.lock().unwrap();
            (
                instruction.target.clone(),
                instruction.product.clone(),
                instruction.docset.clone(),
                instruction.lang.clone(),
                instruction.commit.clone().unwrap_or_default(),
            )
        };

        let mut deliverable = handle
            .lock()
            .unwrap()
            .deliverables
            .get(deliverable_id)
            .cloned()
            .expect("deliverable present in map while in building list");
        deliverable.status = DeliverableStatus::Building;

        let job = DeliverableJob {
            target: &target_str,
            product: &product,
            docset: &docset,
            lang: &lang,
            commit: &commit,
            build_source_dir: &ctx.build_source_dir,
            instruction_temp_tree: &ctx.instruction_temp_tree,
            cache_base_dir: &self.config.server.cache_dir,
            target_config: &target,
            docset_container_image: ctx.docset_container_image.as_deref(),
            lifecycle: ctx.lifecycle,
            default_xslt_params: &default_params,
            maintainers: &ctx.maintainers,
            notify_config: &self.config.notify,
        };

        let succeeded = deliverable::run_deliverable(&job, &mut deliverable, reporter);

        let mut instruction = handle.lock().unwrap();
        instruction.building.retain(|id| id != deliverable_id);
        instruction.deliverables.insert(deliverable_id.to_string(), deliverable);
        drop(instruction);

        self.events.lock().unwrap().record(
            instruction_id.to_string(),
            EventKind::DeliverableFinished {
                status: if succeeded { DeliverableStatus::Success } else { DeliverableStatus::Fail },
            },
        );
    }

    fn finish_instruction(&self, id: String, handle: Arc<Mutex<BuildInstruction>>, reporter: &dyn Reporter) {
        let instruction = handle.lock().unwrap().clone();
        let Some(ctx) = self.contexts.lock().unwrap().remove(&id) else {
            return;
        };
        let Some(target) = self.config.target(&instruction.target).cloned() else {
            return;
        };

        let mut finished = instruction;
        finished.status = if finished.all_deliverables_succeeded() {
            InstructionStatus::Done
        } else {
            InstructionStatus::Failed
        };

        if let Err(e) = handler::finalize(
            &self.config.server,
            &finished.target.clone(),
            &target,
            &finished,
            &ctx,
            &self.lock_registry,
            &self.events,
            &self.config.notify,
            reporter,
        ) {
            reporter.error(&format!("finalize failed for instruction {id}: {e:#}"));
        }

        self.active.lock().unwrap().remove(&id);
        self.events
            .lock()
            .unwrap()
            .record(id.clone(), EventKind::InstructionFinished { status: finished.status });
        self.past.lock().unwrap().insert(id, finished);
    }

    /// Checkpoint scheduled + active + past instructions and flush the
    /// event log, per worker-0's per-iteration responsibility.
    fn checkpoint(&self, reporter: &dyn Reporter) {
        let instructions = self.snapshot_all();
        if let Err(e) =
            docbuild_state::save_state(&self.config.server.cache_dir, &self.config.server.name, &instructions)
        {
            reporter.warn(&format!("failed to checkpoint state: {e:#}"));
        }
        let events_path = docbuild_events::events_path(&self.config.server.cache_dir, &self.config.server.name);
        if let Err(e) = self.events.lock().unwrap().flush_to_file(&events_path) {
            reporter.warn(&format!("failed to flush event log: {e:#}"));
        }
    }

    /// Run this scheduler's worker loop on the calling thread until
    /// shutdown is requested. `worker_id == 0` additionally checkpoints.
    pub fn run_worker(&self, worker_id: usize, reporter: &dyn Reporter) {
        loop {
            let did_work = self.tick(reporter);

            if worker_id == 0 {
                self.checkpoint(reporter);
            }

            if self.is_shutting_down() {
                reporter.info(&format!("worker {worker_id} shutting down"));
                return;
            }

            if !did_work {
                thread::sleep(WORKER_POLL_INTERVAL);
            }
        }
    }
}

/// Spawn `n` worker threads running `scheduler.run_worker` until
/// shutdown, returning their join handles.
pub fn spawn_workers(
    scheduler: Arc<Scheduler>,
    n: usize,
    reporter: Arc<dyn Reporter>,
) -> Vec<thread::JoinHandle<()>> {
    (0..n)
        .map(|worker_id| {
            let scheduler = scheduler.clone();
            let reporter = reporter.clone();
            thread::Builder::new()
                .name(format!("docbuild-worker-{worker_id}"))
                .spawn(move || scheduler.run_worker(worker_id, reporter.as_ref()))
                .expect("failed to spawn worker thread")
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::test_support::RecordingReporter;
    use docbuild_config::MaxThreads;
    use docbuild_notify::{NotifyConfig, NotifyMode};
    use std::collections::HashMap as StdHashMap;
    use tempfile::tempdir;

    fn minimal_config(tmp: &std::path::Path) -> Config {
        Config {
            server: docbuild_config::ServerConfig {
                name: "docserv".into(),
                host: "127.0.0.1".into(),
                port: 8080,
                max_threads: MaxThreads::Count(1),
                cache_dir: tmp.join("cache"),
                repo_dir: tmp.join("repos"),
                temp_repo_dir: tmp.join("tmp"),
                valid_languages: vec!["en-us".to_string()],
                loglevel: 1,
            },
            notify: NotifyConfig {
                enabled: false,
                mode: NotifyMode::FileDrop { drop_dir: tmp.join("notify") },
                truncation_limit: 100_000,
            },
            targets: StdHashMap::new(),
        }
    }

    fn sample_instruction(id: &str, open: Vec<String>, building: Vec<String>) -> BuildInstruction {
        BuildInstruction {
            id: id.to_string(),
            target: "main".into(),
            product: "demo".into(),
            docset: "1.0".into(),
            lang: "en-us".into(),
            commit: None,
            status: InstructionStatus::Done,
            open,
            building,
            deliverables: StdHashMap::new(),
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn new_buckets_unfinished_instructions_into_scheduled() {
        let td = tempdir().expect("tempdir");
        let config = minimal_config(td.path());
        let reporter = RecordingReporter::new();
        let loaded = vec![
            sample_instruction("open1", vec!["d1".to_string()], vec![]),
            sample_instruction("building1", vec![], vec!["d2".to_string()]),
            sample_instruction("done1", vec![], vec![]),
        ];

        let scheduler = Scheduler::new(config, loaded, &reporter);
        let snapshot = scheduler.snapshot_all();
        let ids: Vec<&str> = snapshot.iter().map(|i| i.id.as_str()).collect();
        assert!(ids.contains(&"open1"));
        assert!(ids.contains(&"building1"));
        assert!(ids.contains(&"done1"));

        let scheduled = scheduler.scheduled.lock().unwrap();
        assert!(scheduled.contains_key("open1"));
        assert!(scheduled.contains_key("building1"));
        // a resumed "building" deliverable becomes "open" again.
        assert!(scheduled.get("building1").unwrap().open.contains(&"d2".to_string()));
        assert!(scheduled.get("building1").unwrap().building.is_empty());
    }

    #[test]
    fn submit_is_idempotent_while_scheduled() {
        let td = tempdir().expect("tempdir");
        let config = minimal_config(td.path());
        let reporter = RecordingReporter::new();
        let scheduler = Scheduler::new(config, vec![], &reporter);

        let submitted = SubmittedInstruction {
            target: "main".into(),
            product: "demo".into(),
            docset: "1.0".into(),
            lang: "en-us".into(),
        };

        assert_eq!(scheduler.submit(&submitted, &reporter), SubmitOutcome::Queued);
        assert_eq!(scheduler.submit(&submitted, &reporter), SubmitOutcome::AlreadyPending);
        assert_eq!(scheduler.snapshot_all().len(), 1);
    }

    #[test]
    fn submit_reenqueues_from_past_and_preserves_deliverables() {
        let td = tempdir().expect("tempdir");
        let config = minimal_config(td.path());
        let reporter = RecordingReporter::new();
        let scheduler = Scheduler::new(config, vec![], &reporter);

        let submitted = SubmittedInstruction {
            target: "main".into(),
            product: "demo".into(),
            docset: "1.0".into(),
            lang: "en-us".into(),
        };
        let id = submitted.instruction_id();

        let mut past_instruction = sample_instruction(&id, vec![], vec![]);
        let mut deliverable = docbuild_types::Deliverable {
            id: "deliv1".into(),
            dc_file: "DC-demo".into(),
            build_format: docbuild_types::OutputFormat::Html,
            subdeliverables: vec![],
            xslt_params: StdHashMap::new(),
            container_image: None,
            status: DeliverableStatus::Success,
            title: None,
            path: None,
            last_build_attempt_commit: Some("abc".into()),
            successful_build_commit: Some("abc".into()),
            dc_hash: None,
        };
        deliverable.successful_build_commit = Some("abc".into());
        past_instruction.deliverables.insert("deliv1".to_string(), deliverable);
        scheduler.past.lock().unwrap().insert(id.clone(), past_instruction);

        assert_eq!(scheduler.submit(&submitted, &reporter), SubmitOutcome::Reenqueued);
        let scheduled = scheduler.scheduled.lock().unwrap();
        let reenqueued = scheduled.get(&id).expect("reenqueued");
        assert_eq!(
            reenqueued.deliverables.get("deliv1").unwrap().successful_build_commit.as_deref(),
            Some("abc")
        );
        assert!(reenqueued.open.contains(&"deliv1".to_string()));
    }
}
