//! Instruction handler (SPEC_FULL.md §4.3): initialization, deliverable
//! enumeration, and finalize for one build instruction across its entire
//! lifetime. Grounded on
//! `original_source/src/docserv/bih.py::BuildInstructionHandler`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use docbuild_config::{ServerConfig, TargetConfig};
use docbuild_events::{EventKind, EventLog};
use docbuild_notify::NotifyConfig;
use docbuild_types::{BuildInstruction, Deliverable, DeliverableStatus, Lifecycle, LockKind, NavigationMode};
use rand::Rng;

use crate::collaborators;
use crate::lock::LockRegistry;
use crate::reporter::Reporter;
use crate::stitched::StitchedConfig;

/// Ephemeral per-instruction state produced during initialization that
/// finalize needs but which isn't part of the persisted
/// [`BuildInstruction`] record (§9 "from dynamic objects to tagged
/// records" — kept out of the wire/persisted shape on purpose).
pub struct InstructionContext {
    pub maintainers: Vec<String>,
    pub lifecycle: Lifecycle,
    pub navigation_mode: NavigationMode,
    pub docset_container_image: Option<String>,
    pub ephemeral_dir: PathBuf,
    pub instruction_temp_tree: PathBuf,
    pub build_source_dir: PathBuf,
    pub stitched_config_path: PathBuf,
}

fn random_suffix() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..8)
        .map(|_| {
            let idx = rng.random_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

fn notify_failure(notify_config: &NotifyConfig, maintainers: &[String], subject: &str, body: &str) {
    let _ = docbuild_notify::notify(notify_config, maintainers, subject, body);
}

fn record_lock_event(events: &Mutex<EventLog>, instruction_id: &str, kind: LockKind, resource: &str, acquired: bool) {
    let event = if acquired {
        EventKind::LockAcquired { lock_type: kind, resource: resource.to_string() }
    } else {
        EventKind::LockReleased { lock_type: kind, resource: resource.to_string() }
    };
    events.lock().unwrap().record(instruction_id.to_string(), event);
}

/// Filesystem paths created partway through [`initialize`] before a
/// later step failed — the ephemeral git checkout and/or the
/// instruction's temp tree. §4.3 line 110 requires finalize-style
/// cleanup to run "when the instruction ... failed during init", so
/// `initialize` tracks these as it creates them and removes them itself
/// on the error path rather than leaking them to the caller.
#[derive(Default)]
struct PartialInit {
    ephemeral_dir: PathBuf,
    instruction_temp_tree: PathBuf,
}

fn remove_dir_if_present(path: &Path, reporter: &dyn Reporter) {
    if path.as_os_str().is_empty() {
        return;
    }
    if let Err(e) = fs::remove_dir_all(path)
        && path.exists()
    {
        reporter.warn(&format!("failed to remove {}: {e}", path.display()));
    }
}

/// Run initialization steps 1-6. On any rejection or failure, notifies
/// the maintainer list (when known), cleans up any ephemeral git
/// checkout / instruction temp tree already created, and returns `Err`;
/// the caller is responsible for moving the instruction to `past` with
/// status `failed`.
pub fn initialize(
    server: &ServerConfig,
    target_name: &str,
    target: &TargetConfig,
    instruction: &mut BuildInstruction,
    lock_registry: &LockRegistry,
    events: &Mutex<EventLog>,
    notify_config: &NotifyConfig,
    reporter: &dyn Reporter,
) -> Result<InstructionContext> {
    let mut partial = PartialInit::default();
    let result = initialize_inner(
        server,
        target_name,
        target,
        instruction,
        lock_registry,
        events,
        notify_config,
        reporter,
        &mut partial,
    );
    if result.is_err() {
        remove_dir_if_present(&partial.ephemeral_dir, reporter);
        remove_dir_if_present(&partial.instruction_temp_tree, reporter);
    }
    result
}

#[allow(clippy::too_many_arguments)]
fn initialize_inner(
    server: &ServerConfig,
    target_name: &str,
    target: &TargetConfig,
    instruction: &mut BuildInstruction,
    lock_registry: &LockRegistry,
    events: &Mutex<EventLog>,
    notify_config: &NotifyConfig,
    reporter: &dyn Reporter,
    partial: &mut PartialInit,
) -> Result<InstructionContext> {
    // Step 1: target must be active.
    if !target.active {
        bail!("target '{target_name}' is not active");
    }

    // Step 2: invoke the stitcher.
    let stitched_path = server.cache_dir.join(format!("{target_name}-stitched.xml"));
    let stitch_out = collaborators::stitch(
        &target.config_dir,
        &stitched_path,
        &server.valid_languages,
        &target.site_sections,
        false,
    )
    .context("failed to invoke stitcher")?;
    if !stitch_out.success() {
        let msg = format!(
            "stitcher failed for target '{target_name}' (exit {}): {}",
            stitch_out.exit_code,
            stitch_out.stderr.trim()
        );
        reporter.error(&msg);
        notify_failure(notify_config, &[], &format!("docbuild: stitch failed for {target_name}"), &msg);
        bail!(msg);
    }

    let stitched = StitchedConfig::load(&stitched_path).context("failed to load stitched config")?;

    // Step 3: read maintainers, lifecycle, navigation mode, branch/subdir,
    // remote, and optional container image override.
    let maintainers = stitched.maintainers(&instruction.product);
    let lifecycle = stitched
        .lifecycle(&instruction.product, &instruction.docset)
        .context("docset has an unrecognized lifecycle value")?;
    let navigation_mode = stitched.navigation_mode(&instruction.product, &instruction.docset);
    let docset_container_image = stitched.docset_container_image(&instruction.product, &instruction.docset);

    // Step 4: rejection checks.
    if !stitched.docset_exists(&instruction.product, &instruction.docset) {
        bail!(
            "docset '{}/{}' does not exist in the stitched config",
            instruction.product,
            instruction.docset
        );
    }
    if !server.valid_languages.iter().any(|l| l == &instruction.lang) {
        bail!("language '{}' is not in the valid language set", instruction.lang);
    }
    if lifecycle == Lifecycle::Unpublished && !target.internal {
        bail!(
            "docset '{}/{}' is unpublished and target '{target_name}' is not internal",
            instruction.product,
            instruction.docset
        );
    }

    let deliverables = stitched.deliverables(&instruction.product, &instruction.docset, &instruction.lang);

    let mut ephemeral_dir = PathBuf::new();
    let mut build_source_dir = PathBuf::new();
    let mut commit = None;

    // Step 5: git preparation, only when there is something to build.
    if !deliverables.is_empty() {
        let remote = stitched
            .remote(&instruction.product, &instruction.docset)
            .context("docset has no git remote in the stitched config")?;
        let branch = stitched
            .branch(&instruction.product, &instruction.docset, &instruction.lang)
            .context("language has no branch in the stitched config")?;
        let subdir = stitched
            .subdir(&instruction.product, &instruction.docset, &instruction.lang)
            .unwrap_or_default();

        let slug = docbuild_git::remote_slug(&remote);
        let permanent_dir = server.repo_dir.join(&slug);

        let mut git_lock = lock_registry.acquire(docbuild_types::LockKind::GitRemote, &slug);
        record_lock_event(events, &instruction.id, LockKind::GitRemote, &slug, true);
        let git_result = (|| -> Result<PathBuf> {
            docbuild_git::sync_cache(&remote, &branch, &permanent_dir)?;
            let ephemeral = server.temp_repo_dir.join(format!("{}-{}", instruction.id, random_suffix()));
            docbuild_git::checkout_ephemeral(&permanent_dir, &ephemeral, &branch)?;
            Ok(ephemeral)
        })();
        git_lock.release();
        record_lock_event(events, &instruction.id, LockKind::GitRemote, &slug, false);

        let ephemeral = match git_result {
            Ok(dir) => dir,
            Err(e) => {
                let msg = format!("git preparation failed for '{remote}': {e:#}");
                reporter.error(&msg);
                notify_failure(notify_config, &maintainers, "docbuild: git preparation failed", &msg);
                return Err(e);
            }
        };
        // The ephemeral checkout now exists on disk; track it so a later
        // failure in this function still gets it cleaned up.
        partial.ephemeral_dir = ephemeral.clone();

        commit = Some(docbuild_git::head_commit(&ephemeral).context("failed to read HEAD commit")?);
        build_source_dir = if subdir.is_empty() { ephemeral.clone() } else { ephemeral.join(&subdir) };
        ephemeral_dir = ephemeral;
    }
    instruction.commit = commit;

    // Step 6: create the instruction's temporary working tree, containing
    // the path <lang>/<product>/<docset>. `instruction_temp_tree` itself
    // is the instruction-unique root that finalize removes wholesale.
    let instruction_temp_tree = server
        .temp_repo_dir
        .join(format!("build-{}-{}", instruction.id, random_suffix()));
    let docset_dir = instruction_temp_tree
        .join(&instruction.lang)
        .join(&instruction.product)
        .join(&instruction.docset);
    fs::create_dir_all(&docset_dir)
        .with_context(|| format!("failed to create instruction temp tree {}", docset_dir.display()))?;
    partial.instruction_temp_tree = instruction_temp_tree.clone();

    Ok(InstructionContext {
        maintainers,
        lifecycle,
        navigation_mode,
        docset_container_image,
        ephemeral_dir,
        instruction_temp_tree,
        build_source_dir,
        stitched_config_path: stitched_path,
    })
}

/// Deliverable enumeration: expand every `<deliverable>` entry under the
/// instruction's language into one [`Deliverable`] per enabled format,
/// placed in the instruction's `open` list.
pub fn enumerate_deliverables(instruction: &mut BuildInstruction, stitched: &StitchedConfig) {
    let raws = stitched.deliverables(&instruction.product, &instruction.docset, &instruction.lang);
    for raw in raws {
        for format in raw.formats.iter().copied() {
            let id = Deliverable::make_id(
                &instruction.target,
                &instruction.product,
                &instruction.docset,
                &instruction.lang,
                &raw.dc_file,
                format,
            );
            let xslt_params: HashMap<String, String> = crate::stitched::xslt_params_map(&raw.xslt_params);
            let deliverable = Deliverable {
                id: id.clone(),
                dc_file: raw.dc_file.clone(),
                build_format: format,
                subdeliverables: raw.subdeliverables.clone(),
                xslt_params,
                container_image: raw.container_image.clone(),
                status: DeliverableStatus::Queued,
                title: None,
                path: None,
                last_build_attempt_commit: None,
                successful_build_commit: None,
                dc_hash: None,
            };
            instruction.deliverables.insert(id.clone(), deliverable);
            instruction.open.push(id);
        }
    }
}

/// Finalize (§4.3 "Finalize (cleanup)"). Idempotent in the sense that
/// callers must guard it with a non-reentrant per-instruction lock
/// (handled by the scheduler, which only calls this once per instruction).
pub fn finalize(
    server: &ServerConfig,
    target_name: &str,
    target: &TargetConfig,
    instruction: &BuildInstruction,
    ctx: &InstructionContext,
    lock_registry: &LockRegistry,
    events: &Mutex<EventLog>,
    notify_config: &NotifyConfig,
    reporter: &dyn Reporter,
) -> Result<()> {
    let overall_success = instruction.all_deliverables_succeeded();
    reporter.info(&format!(
        "finalizing instruction {} ({}/{}/{}/{}): {}",
        instruction.id,
        target_name,
        instruction.product,
        instruction.docset,
        instruction.lang,
        if overall_success { "success" } else { "fail" }
    ));

    if overall_success {
        if let Err(e) = publish(server, target_name, target, instruction, ctx, lock_registry, events, reporter) {
            let msg = format!("publication failed for instruction {}: {e:#}", instruction.id);
            reporter.error(&msg);
            notify_failure(notify_config, &ctx.maintainers, "docbuild: publication failed", &msg);
        }
    }

    // Step 3 (cleanup) always runs, even after a publication failure.
    cleanup_temp_dirs(ctx, reporter);

    Ok(())
}

fn publish(
    server: &ServerConfig,
    target_name: &str,
    target: &TargetConfig,
    instruction: &BuildInstruction,
    ctx: &InstructionContext,
    lock_registry: &LockRegistry,
    events: &Mutex<EventLog>,
    reporter: &dyn Reporter,
) -> Result<()> {
    let mut backup_lock = lock_registry.acquire(docbuild_types::LockKind::BackupDir, target_name);
    record_lock_event(events, &instruction.id, LockKind::BackupDir, target_name, true);

    let result = (|| -> Result<()> {
        let archive_path = ctx.instruction_temp_tree.join(format!("{}.zip", instruction.id));
        if ctx.lifecycle != Lifecycle::Unsupported {
            collaborators::run_archive(&collaborators::ArchiveRequest {
                input_dir: &ctx.instruction_temp_tree,
                output_zip: &archive_path,
                formats: &target.zip_formats,
                cache_dir: &server.cache_dir,
                target: target_name,
                product: &instruction.product,
                docset: &instruction.docset,
                lang: &instruction.lang,
            })?;
            let out = collaborators::run_rsync(&ctx.instruction_temp_tree, &target.backup_path, false, None)?;
            if !out.success() {
                bail!("rsync to backup path failed: {}", out.stderr.trim());
            }
        } else {
            // Unsupported docsets get no full tree in backup, only a
            // freshly emptied docset subdirectory holding the zip
            // (original `bih.py`'s unsupported-case `mkdir -p` +
            // `--output-path` inside the docset's backup subdir).
            let docset_backup_dir = target
                .backup_path
                .join(&instruction.lang)
                .join(&instruction.product)
                .join(&instruction.docset);
            if docset_backup_dir.exists() {
                fs::remove_dir_all(&docset_backup_dir)?;
            }
            fs::create_dir_all(&docset_backup_dir)?;
            let docset_archive_path = docset_backup_dir.join(format!("{}.zip", instruction.id));
            collaborators::run_archive(&collaborators::ArchiveRequest {
                input_dir: &ctx.instruction_temp_tree,
                output_zip: &docset_archive_path,
                formats: &target.zip_formats,
                cache_dir: &server.cache_dir,
                target: target_name,
                product: &instruction.product,
                docset: &instruction.docset,
                lang: &instruction.lang,
            })?;
        }

        if ctx.navigation_mode.builds_navigation() {
            let nav_dir = ctx.instruction_temp_tree.join("navigation");
            fs::create_dir_all(&nav_dir)?;
            let rsync_root = collaborators::run_rsync(&target.server_root_files, &nav_dir, false, None)?;
            if !rsync_root.success() {
                bail!("rsync of static root files failed: {}", rsync_root.stderr.trim());
            }
            collaborators::run_navbuild(&collaborators::NavBuildRequest {
                stitched_config: &ctx.stitched_config_path,
                target: target_name,
                product: &instruction.product,
                docset: &instruction.docset,
                ui_languages: &target.languages,
                default_site_section: &target.default_site_section,
                deliverable_cache_dir: &server.cache_dir,
                template_dir: &target.template_dir,
                output_dir: &nav_dir,
                base_url_path: &target.server_base_path,
            })?;
            let out = collaborators::run_rsync(&nav_dir, &target.backup_path, false, None)?;
            if !out.success() {
                bail!("rsync of navigation tree failed: {}", out.stderr.trim());
            }
        }

        if target.enable_target_sync {
            let live_path = target
                .target_path
                .as_ref()
                .context("enable_target_sync requires target_path")?;
            let out = collaborators::run_rsync(&target.backup_path, live_path, true, target.exclude_file.as_deref())?;
            if !out.success() {
                bail!("rsync to live target failed: {}", out.stderr.trim());
            }
        }

        Ok(())
    })();

    backup_lock.release();
    record_lock_event(events, &instruction.id, LockKind::BackupDir, target_name, false);
    reporter.info(&format!("publish phase finished for instruction {}", instruction.id));
    result
}

fn cleanup_temp_dirs(ctx: &InstructionContext, reporter: &dyn Reporter) {
    remove_dir_if_present(&ctx.ephemeral_dir, reporter);
    remove_dir_if_present(&ctx.instruction_temp_tree, reporter);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::test_support::RecordingReporter;
    use docbuild_notify::NotifyMode;
    use docbuild_types::{DeliverableStatus, InstructionStatus, OutputFormat};
    use serial_test::serial;
    use std::fs;
    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn server_config(tmp: &Path) -> ServerConfig {
        ServerConfig {
            name: "docserv".into(),
            host: "127.0.0.1".into(),
            port: 8080,
            max_threads: docbuild_config::MaxThreads::Count(2),
            cache_dir: tmp.join("cache"),
            repo_dir: tmp.join("repos"),
            temp_repo_dir: tmp.join("tmp"),
            valid_languages: vec!["en-us".to_string()],
            loglevel: 1,
        }
    }

    fn target_config(tmp: &Path) -> TargetConfig {
        TargetConfig {
            active: true,
            internal: true,
            config_dir: tmp.join("config"),
            backup_path: tmp.join("backup"),
            target_path: None,
            enable_target_sync: false,
            exclude_file: None,
            template_dir: tmp.join("templates"),
            server_root_files: tmp.join("root-files"),
            zip_formats: vec!["html".to_string()],
            languages: vec!["en-us".to_string()],
            default_lang: "en-us".to_string(),
            omit_default_lang_path: true,
            canonical_url_domain: "docs.example.com".to_string(),
            server_base_path: "/documentation".to_string(),
            site_sections: vec![],
            default_site_section: String::new(),
            draft: false,
            remarks: false,
            meta: false,
            default_xslt_params: tmp.join("xslt-defaults.txt"),
            container_image: None,
        }
    }

    fn sample_instruction() -> BuildInstruction {
        BuildInstruction {
            id: "instr0001".into(),
            target: "main".into(),
            product: "demo".into(),
            docset: "1.0".into(),
            lang: "en-us".into(),
            commit: None,
            status: InstructionStatus::Initializing,
            open: vec![],
            building: vec![],
            deliverables: HashMap::new(),
            created_at: chrono::Utc::now(),
        }
    }

    #[cfg(unix)]
    fn write_fake(path: &Path, body: &str) {
        fs::write(path, body).expect("write fake binary");
        let mut perms = fs::metadata(path).expect("meta").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms).expect("chmod");
    }

    #[test]
    fn initialize_rejects_inactive_target() {
        let td = tempdir().expect("tempdir");
        let server = server_config(td.path());
        let mut target = target_config(td.path());
        target.active = false;
        let mut instruction = sample_instruction();
        let lock_registry = LockRegistry::new();
        let events = Mutex::new(EventLog::new());
        let notify_config = NotifyConfig {
            enabled: false,
            mode: NotifyMode::FileDrop { drop_dir: td.path().to_path_buf() },
            truncation_limit: 100_000,
        };
        let reporter = RecordingReporter::new();

        let err = initialize(
            &server,
            "main",
            &target,
            &mut instruction,
            &lock_registry,
            &events,
            &notify_config,
            &reporter,
        )
        .expect_err("must fail");
        assert!(format!("{err:#}").contains("not active"));
    }

    #[cfg(unix)]
    #[test]
    #[serial]
    fn initialize_rejects_unknown_docset_after_successful_stitch() {
        let td = tempdir().expect("tempdir");
        let server = server_config(td.path());
        let target = target_config(td.path());
        let mut instruction = sample_instruction();
        instruction.docset = "9.9".to_string();
        let lock_registry = LockRegistry::new();
        let events = Mutex::new(EventLog::new());
        let notify_config = NotifyConfig {
            enabled: false,
            mode: NotifyMode::FileDrop { drop_dir: td.path().to_path_buf() },
            truncation_limit: 100_000,
        };
        let reporter = RecordingReporter::new();

        let fake = td.path().join("stitch.sh");
        write_fake(
            &fake,
            r#"#!/usr/bin/env sh
out=""
prev=""
for arg in "$@"; do prev="$arg"; done
out="$prev"
cat > "$out" <<'EOF'
<config>
  <product productid="demo">
    <maintainers><contact>a@example.com</contact></maintainers>
    <docset setid="1.0" lifecycle="supported">
      <builddocs>
        <git remote="https://example.invalid/demo.git"/>
        <language lang="en-us"><branch>main</branch></language>
      </builddocs>
    </docset>
  </product>
</config>
EOF
exit 0
"#,
        );
        let prev = std::env::var("DOCBUILD_STITCHER_BIN").ok();
        unsafe { std::env::set_var("DOCBUILD_STITCHER_BIN", fake.to_str().unwrap()) };

        let result = initialize(
            &server,
            "main",
            &target,
            &mut instruction,
            &lock_registry,
            &events,
            &notify_config,
            &reporter,
        );

        match prev {
            Some(v) => unsafe { std::env::set_var("DOCBUILD_STITCHER_BIN", v) },
            None => unsafe { std::env::remove_var("DOCBUILD_STITCHER_BIN") },
        }

        let err = result.expect_err("must fail");
        assert!(format!("{err:#}").contains("does not exist"));
    }

    #[cfg(unix)]
    #[test]
    #[serial]
    fn initialize_cleans_up_ephemeral_checkout_when_failing_after_git_step() {
        let td = tempdir().expect("tempdir");
        let server = server_config(td.path());
        let target = target_config(td.path());
        let mut instruction = sample_instruction();
        let lock_registry = LockRegistry::new();
        let events = Mutex::new(EventLog::new());
        let notify_config = NotifyConfig {
            enabled: false,
            mode: NotifyMode::FileDrop { drop_dir: td.path().to_path_buf() },
            truncation_limit: 100_000,
        };
        let reporter = RecordingReporter::new();

        let stitch_fake = td.path().join("stitch.sh");
        write_fake(
            &stitch_fake,
            r#"#!/usr/bin/env sh
out=""
prev=""
for arg in "$@"; do prev="$arg"; done
out="$prev"
cat > "$out" <<'EOF'
<config>
  <product productid="demo">
    <maintainers><contact>a@example.com</contact></maintainers>
    <docset setid="1.0" lifecycle="supported">
      <builddocs>
        <git remote="https://example.invalid/demo.git"/>
        <language lang="en-us">
          <branch>main</branch>
          <deliverable>
            <dc>DC-demo</dc>
            <format html="true"/>
          </deliverable>
        </language>
      </builddocs>
    </docset>
  </product>
</config>
EOF
exit 0
"#,
        );

        // Fake git: clone/checkout/reset/fetch all succeed (clone creates
        // the target directory so later steps see it on disk); rev-parse
        // fails, forcing `initialize` to error out after the ephemeral
        // checkout already exists.
        let git_fake = td.path().join("git.sh");
        write_fake(
            &git_fake,
            r#"#!/usr/bin/env sh
cmd="$1"
last=""
for arg in "$@"; do last="$arg"; done
case "$cmd" in
  clone)
    mkdir -p "$last"
    exit 0
    ;;
  fetch|checkout|reset)
    exit 0
    ;;
  rev-parse)
    echo "no HEAD in fake repo" >&2
    exit 1
    ;;
  *)
    exit 0
    ;;
esac
"#,
        );

        let prev_stitch = std::env::var("DOCBUILD_STITCHER_BIN").ok();
        let prev_git = std::env::var("DOCBUILD_GIT_BIN").ok();
        unsafe {
            std::env::set_var("DOCBUILD_STITCHER_BIN", stitch_fake.to_str().unwrap());
            std::env::set_var("DOCBUILD_GIT_BIN", git_fake.to_str().unwrap());
        }

        let result = initialize(
            &server,
            "main",
            &target,
            &mut instruction,
            &lock_registry,
            &events,
            &notify_config,
            &reporter,
        );

        match prev_stitch {
            Some(v) => unsafe { std::env::set_var("DOCBUILD_STITCHER_BIN", v) },
            None => unsafe { std::env::remove_var("DOCBUILD_STITCHER_BIN") },
        }
        match prev_git {
            Some(v) => unsafe { std::env::set_var("DOCBUILD_GIT_BIN", v) },
            None => unsafe { std::env::remove_var("DOCBUILD_GIT_BIN") },
        }

        result.expect_err("must fail at head_commit");

        // No ephemeral checkout directory should survive under temp_repo_dir.
        let leftover: Vec<_> = fs::read_dir(&server.temp_repo_dir)
            .map(|entries| entries.filter_map(|e| e.ok()).collect())
            .unwrap_or_default();
        assert!(
            leftover.is_empty(),
            "expected no leaked temp dirs, found {:?}",
            leftover.iter().map(|e| e.path()).collect::<Vec<_>>()
        );
    }

    #[cfg(unix)]
    #[test]
    #[serial]
    fn finalize_unsupported_lifecycle_empties_and_fills_docset_backup_subdir() {
        let td = tempdir().expect("tempdir");
        let server = server_config(td.path());
        let target = target_config(td.path());
        // Stale backup content from a prior publish that should be wiped.
        let docset_backup_dir = target.backup_path.join("en-us").join("demo").join("1.0");
        fs::create_dir_all(&docset_backup_dir).expect("mkdir stale backup");
        fs::write(docset_backup_dir.join("stale.txt"), "old").expect("write stale file");

        let bin_dir = td.path().join("bin");
        fs::create_dir_all(&bin_dir).expect("mkdir bin");
        let archive_fake = bin_dir.join("archive.sh");
        write_fake(
            &archive_fake,
            r#"#!/usr/bin/env sh
out=""
for arg in "$@"; do
  case "$arg" in
    --output=*) out="${arg#--output=}" ;;
  esac
done
echo "zip-contents" > "$out"
exit 0
"#,
        );
        let prev_archive = std::env::var("DOCBUILD_ARCHIVE_BIN").ok();
        unsafe { std::env::set_var("DOCBUILD_ARCHIVE_BIN", archive_fake.to_str().unwrap()) };

        let instruction_temp_tree = td.path().join("instr-temp");
        fs::create_dir_all(&instruction_temp_tree).expect("mkdir instr temp tree");
        let mut instruction = sample_instruction();
        instruction.status = InstructionStatus::Publishing;
        let ctx = InstructionContext {
            maintainers: vec![],
            lifecycle: Lifecycle::Unsupported,
            navigation_mode: NavigationMode::Disabled,
            docset_container_image: None,
            ephemeral_dir: PathBuf::new(),
            instruction_temp_tree: instruction_temp_tree.clone(),
            build_source_dir: PathBuf::new(),
            stitched_config_path: td.path().join("stitched.xml"),
        };
        let lock_registry = LockRegistry::new();
        let events = Mutex::new(EventLog::new());
        let notify_config = NotifyConfig {
            enabled: false,
            mode: NotifyMode::FileDrop { drop_dir: td.path().to_path_buf() },
            truncation_limit: 100_000,
        };
        let reporter = RecordingReporter::new();

        finalize(
            &server,
            "main",
            &target,
            &instruction,
            &ctx,
            &lock_registry,
            &events,
            &notify_config,
            &reporter,
        )
        .expect("finalize should succeed");

        match prev_archive {
            Some(v) => unsafe { std::env::set_var("DOCBUILD_ARCHIVE_BIN", v) },
            None => unsafe { std::env::remove_var("DOCBUILD_ARCHIVE_BIN") },
        }

        assert!(!docset_backup_dir.join("stale.txt").exists(), "stale backup content must be wiped");
        let zip_path = docset_backup_dir.join(format!("{}.zip", instruction.id));
        assert!(zip_path.exists(), "zip archive must land in the docset backup subdir");
        assert_eq!(fs::read_to_string(&zip_path).unwrap(), "zip-contents\n");

        // The instruction temp tree itself is still removed by cleanup.
        assert!(!instruction_temp_tree.exists());
    }

    #[test]
    fn enumerate_deliverables_populates_open_list_and_map() {
        let xml = r#"
<config>
  <product productid="demo">
    <docset setid="1.0" lifecycle="supported">
      <builddocs>
        <git remote="https://example.invalid/demo.git"/>
        <language lang="en-us">
          <branch>main</branch>
          <deliverable>
            <dc>DC-demo</dc>
            <format html="true" pdf="true"/>
          </deliverable>
        </language>
      </builddocs>
    </docset>
  </product>
</config>
"#;
        let stitched = StitchedConfig::from_xml(xml).expect("parse");
        let mut instruction = sample_instruction();

        enumerate_deliverables(&mut instruction, &stitched);

        assert_eq!(instruction.open.len(), 2);
        assert_eq!(instruction.deliverables.len(), 2);
        let formats: Vec<OutputFormat> = instruction
            .deliverables
            .values()
            .map(|d| d.build_format)
            .collect();
        assert!(formats.contains(&OutputFormat::Html));
        assert!(formats.contains(&OutputFormat::Pdf));
        for d in instruction.deliverables.values() {
            assert_eq!(d.status, DeliverableStatus::Queued);
        }
    }
}
