//! Git repository sync for the instruction handler's repo-preparation step
//! (SPEC_FULL.md §4.3 step 5).
//!
//! The instruction handler keeps one persistent clone per remote under a
//! shared cache directory ("the git cache"), brings it up to date, and then
//! carves out a disposable single-branch clone for the actual build ("the
//! ephemeral checkout"). Every call here is a thin wrapper around a single
//! `git` invocation; the caller is responsible for holding the `git-remote`
//! resource lock (§4.5) around the cache-directory operations.

use std::path::Path;

use anyhow::{Context, Result, bail};
use docbuild_process::run_command;
use sha2::{Digest, Sha256};

/// Deterministic, filesystem-safe directory name for a remote's permanent
/// clone, per SPEC_FULL.md §9.1 resolution 3: a 16-hex-char SHA-256 prefix
/// of the URL plus a human-readable suffix from its last path segment.
/// Collision-resistant (unlike the original source's raw character
/// substitution), since two URLs differing only in punctuation hash to
/// different digests.
pub fn remote_slug(remote_url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(remote_url.as_bytes());
    let digest = hex::encode(hasher.finalize());
    let digest = &digest[..16];

    let last_segment = remote_url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(remote_url);
    let suffix: String = last_segment
        .trim_end_matches(".git")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();

    if suffix.is_empty() {
        digest.to_string()
    } else {
        format!("{digest}_{suffix}")
    }
}

/// Name of the `git` binary to invoke, overridable for tests so a fake
/// script can stand in for the real executable.
pub fn git_program() -> String {
    std::env::var("DOCBUILD_GIT_BIN").unwrap_or_else(|_| "git".to_string())
}

fn git(args: &[&str], working_dir: &Path) -> Result<()> {
    let out = run_command(&git_program(), args, working_dir)
        .with_context(|| format!("failed to run git {}", args.join(" ")))?;
    if !out.success() {
        bail!(
            "git {} failed (exit {}): {}",
            args.join(" "),
            out.exit_code,
            out.stderr.trim()
        );
    }
    Ok(())
}

/// Clone `remote_url` into `cache_dir` if it doesn't already contain a
/// checkout, otherwise fetch and fast-forward the local copy to the remote
/// tip of `branch`. Mirrors `prepare_repo`'s clone-or-pull decision.
pub fn sync_cache(remote_url: &str, branch: &str, cache_dir: &Path) -> Result<()> {
    if !cache_dir.join(".git").exists() {
        if let Some(parent) = cache_dir.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let parent = cache_dir.parent().unwrap_or(Path::new("."));
        let name = cache_dir
            .file_name()
            .and_then(|n| n.to_str())
            .context("cache_dir has no file name component")?;
        git(&["clone", remote_url, name], parent)
            .with_context(|| format!("failed to clone {remote_url}"))?;
    } else {
        git(&["fetch", "--prune", "origin"], cache_dir)
            .with_context(|| format!("failed to fetch {remote_url}"))?;
    }

    git(&["checkout", branch], cache_dir)
        .with_context(|| format!("failed to checkout branch {branch}"))?;
    git(&["reset", "--hard", &format!("origin/{branch}")], cache_dir)
        .with_context(|| format!("failed to reset to origin/{branch}"))?;
    Ok(())
}

/// Carve out a disposable single-branch clone of `cache_dir` at
/// `ephemeral_dir` for one build. Done outside the `git-remote` lock since
/// it only reads the already-synced local cache.
pub fn checkout_ephemeral(cache_dir: &Path, ephemeral_dir: &Path, branch: &str) -> Result<()> {
    if ephemeral_dir.exists() {
        std::fs::remove_dir_all(ephemeral_dir)
            .with_context(|| format!("failed to clear stale {}", ephemeral_dir.display()))?;
    }
    if let Some(parent) = ephemeral_dir.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let cache_str = cache_dir
        .to_str()
        .context("cache_dir is not valid UTF-8")?;
    let dest_str = ephemeral_dir
        .to_str()
        .context("ephemeral_dir is not valid UTF-8")?;
    git(
        &["clone", "--single-branch", "--branch", branch, cache_str, dest_str],
        Path::new("."),
    )
    .with_context(|| format!("failed to clone ephemeral checkout from {}", cache_dir.display()))
}

/// Current `HEAD` commit hash of the checkout at `repo_dir`.
pub fn head_commit(repo_dir: &Path) -> Result<String> {
    let out = run_command(&git_program(), &["rev-parse", "HEAD"], repo_dir)
        .context("failed to run git rev-parse HEAD")?;
    if !out.success() {
        bail!("git rev-parse HEAD failed: {}", out.stderr.trim());
    }
    Ok(out.stdout.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn init_repo(dir: &Path) {
        std::process::Command::new("git")
            .args(["init", "--initial-branch=main"])
            .current_dir(dir)
            .output()
            .expect("git init");
        std::process::Command::new("git")
            .args(["config", "user.email", "test@example.com"])
            .current_dir(dir)
            .output()
            .expect("git config email");
        std::process::Command::new("git")
            .args(["config", "user.name", "Test"])
            .current_dir(dir)
            .output()
            .expect("git config name");
        fs::write(dir.join("README"), "hello\n").expect("write");
        std::process::Command::new("git")
            .args(["add", "."])
            .current_dir(dir)
            .output()
            .expect("git add");
        std::process::Command::new("git")
            .args(["commit", "-m", "init"])
            .current_dir(dir)
            .output()
            .expect("git commit");
    }

    #[test]
    fn remote_slug_is_deterministic() {
        let a = remote_slug("https://example.invalid/docs/doc-sle.git");
        let b = remote_slug("https://example.invalid/docs/doc-sle.git");
        assert_eq!(a, b);
    }

    #[test]
    fn remote_slug_differs_for_different_urls() {
        let a = remote_slug("https://example.invalid/docs/doc-sle.git");
        let b = remote_slug("https://example.invalid/docs/doc-other.git");
        assert_ne!(a, b);
    }

    #[test]
    fn remote_slug_is_filesystem_safe_and_human_readable() {
        let slug = remote_slug("https://example.invalid/docs/doc-sle.git");
        assert!(slug.ends_with("_doc-sle"));
        assert!(
            slug.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        );
    }

    #[test]
    #[serial]
    fn sync_cache_clones_when_missing_then_fetches_when_present() {
        let td = tempdir().expect("tempdir");
        let origin = td.path().join("origin");
        fs::create_dir_all(&origin).expect("mkdir origin");
        init_repo(&origin);

        let cache = td.path().join("cache");
        let origin_str = origin.to_str().unwrap();

        sync_cache(origin_str, "main", &cache).expect("first sync clones");
        assert!(cache.join(".git").exists());
        assert!(cache.join("README").exists());

        // second sync against the already-cloned cache exercises the fetch path
        sync_cache(origin_str, "main", &cache).expect("second sync fetches");
    }

    #[test]
    #[serial]
    fn checkout_ephemeral_produces_independent_single_branch_clone() {
        let td = tempdir().expect("tempdir");
        let origin = td.path().join("origin");
        fs::create_dir_all(&origin).expect("mkdir origin");
        init_repo(&origin);

        let cache = td.path().join("cache");
        sync_cache(origin.to_str().unwrap(), "main", &cache).expect("sync");

        let ephemeral = td.path().join("ephemeral");
        checkout_ephemeral(&cache, &ephemeral, "main").expect("ephemeral checkout");
        assert!(ephemeral.join("README").exists());
    }

    #[test]
    #[serial]
    fn head_commit_returns_forty_char_hash() {
        let td = tempdir().expect("tempdir");
        let origin = td.path().join("origin");
        fs::create_dir_all(&origin).expect("mkdir origin");
        init_repo(&origin);

        let commit = head_commit(&origin).expect("head commit");
        assert_eq!(commit.len(), 40);
        assert!(commit.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[cfg(unix)]
    #[test]
    #[serial]
    fn sync_cache_surfaces_git_failure_via_fake_binary() {
        let td = tempdir().expect("tempdir");
        let fake = td.path().join("git");
        fs::write(&fake, "#!/usr/bin/env sh\necho boom >&2\nexit 1\n").expect("write fake git");
        let mut perms = fs::metadata(&fake).expect("meta").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&fake, perms).expect("chmod");

        let prev = std::env::var("DOCBUILD_GIT_BIN").ok();
        unsafe {
            std::env::set_var("DOCBUILD_GIT_BIN", fake.to_str().unwrap());
        }

        let cache = td.path().join("cache");
        let err = sync_cache("https://example.invalid/repo.git", "main", &cache).unwrap_err();
        assert!(format!("{err:#}").contains("boom"));

        match prev {
            Some(v) => unsafe { std::env::set_var("DOCBUILD_GIT_BIN", v) },
            None => unsafe { std::env::remove_var("DOCBUILD_GIT_BIN") },
        }
    }
}
