//! Thin wrappers around the six external collaborators named in
//! SPEC_FULL.md §6: stitcher, dc-hash, the DAPS container runner, the
//! archive tool, the navigation builder, and rsync. Every call goes
//! through [`docbuild_process::run_command`] (§6.1), so the caller always
//! gets a structured [`CommandOutput`] back instead of interleaving
//! subprocess execution with notification decisions.
//!
//! Each tool's binary path is overridable via an env var, mirroring
//! `docbuild-git`'s `DOCBUILD_GIT_BIN` hook, so tests can substitute a fake
//! shell script (§8.1).

use std::path::Path;

use anyhow::Result;
use docbuild_process::{CommandOutput, run_command};

fn program(env_var: &str, default: &str) -> String {
    std::env::var(env_var).unwrap_or_else(|_| default.to_string())
}

pub fn stitcher_program() -> String {
    program("DOCBUILD_STITCHER_BIN", "docserv-stitch")
}

pub fn daps_program() -> String {
    program("DOCBUILD_DAPS_BIN", "d2d_runner")
}

pub fn dchash_program() -> String {
    program("DOCBUILD_DCHASH_BIN", "docserv-dc-hash")
}

pub fn archive_program() -> String {
    program("DOCBUILD_ARCHIVE_BIN", "docserv-create-archive")
}

pub fn navbuild_program() -> String {
    program("DOCBUILD_NAVBUILD_BIN", "docserv-build-navigation")
}

pub fn rsync_program() -> String {
    program("DOCBUILD_RSYNC_BIN", "rsync")
}

/// Invoke the stitcher: `--simplify [--revalidate-only]
/// --valid-languages="…" --valid-site-sections="…" <config-dir>
/// <out-file>`.
pub fn stitch(
    config_dir: &Path,
    out_file: &Path,
    valid_languages: &[String],
    valid_site_sections: &[String],
    revalidate_only: bool,
) -> Result<CommandOutput> {
    let languages = valid_languages.join(",");
    let site_sections = valid_site_sections.join(",");
    let mut args = vec!["--simplify".to_string()];
    if revalidate_only {
        args.push("--revalidate-only".to_string());
    }
    args.push(format!("--valid-languages={languages}"));
    args.push(format!("--valid-site-sections={site_sections}"));
    args.push(config_dir.display().to_string());
    args.push(out_file.display().to_string());

    let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();
    run_command(&stitcher_program(), &args_ref, Path::new("."))
}

/// Invoke the dc-hash tool: `<cmd> <dc-path> [<rootid>]` → stdout = digest.
pub fn dc_hash(dc_path: &Path, root_id: Option<&str>) -> Result<String> {
    let dc_path_str = dc_path.display().to_string();
    let mut args = vec![dc_path_str.as_str()];
    if let Some(root_id) = root_id {
        args.push(root_id);
    }
    let out = run_command(&dchash_program(), &args, Path::new("."))?;
    Ok(out.stdout.trim().to_string())
}

/// Parameters for one DAPS container build invocation (§4.4 step 3).
pub struct DapsBuildRequest<'a> {
    pub input_dir: &'a Path,
    pub output_dir: &'a Path,
    pub format: &'a str,
    pub dc_file: &'a str,
    pub xslt_params_file: &'a Path,
    pub daps_params_file: &'a Path,
    pub container_image: Option<&'a str>,
}

pub fn run_daps(req: &DapsBuildRequest) -> Result<CommandOutput> {
    let mut args = vec![
        "--bigfile".to_string(),
        "--json-filelist".to_string(),
        "--auto-validate".to_string(),
        "--container-update".to_string(),
        format!("--input-dir={}", req.input_dir.display()),
        format!("--output-dir={}", req.output_dir.display()),
        format!("--format={}", req.format),
        format!("--dc-file={}", req.dc_file),
        format!("--xslt-params-file={}", req.xslt_params_file.display()),
        format!("--daps-params-file={}", req.daps_params_file.display()),
    ];
    if let Some(image) = req.container_image {
        args.push(format!("--container-image={image}"));
    }
    let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();
    run_command(&daps_program(), &args_ref, Path::new("."))
}

/// Parameters for the archive tool (§6: "takes input and output paths,
/// format list, cache path, and identifying metadata").
pub struct ArchiveRequest<'a> {
    pub input_dir: &'a Path,
    pub output_zip: &'a Path,
    pub formats: &'a [String],
    pub cache_dir: &'a Path,
    pub target: &'a str,
    pub product: &'a str,
    pub docset: &'a str,
    pub lang: &'a str,
}

pub fn run_archive(req: &ArchiveRequest) -> Result<CommandOutput> {
    let args = vec![
        format!("--input-dir={}", req.input_dir.display()),
        format!("--output={}", req.output_zip.display()),
        format!("--formats={}", req.formats.join(",")),
        format!("--cache-dir={}", req.cache_dir.display()),
        format!("--target={}", req.target),
        format!("--product={}", req.product),
        format!("--docset={}", req.docset),
        format!("--lang={}", req.lang),
    ];
    let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();
    run_command(&archive_program(), &args_ref, Path::new("."))
}

/// Parameters for the navigation builder (§6).
pub struct NavBuildRequest<'a> {
    pub stitched_config: &'a Path,
    pub target: &'a str,
    pub product: &'a str,
    pub docset: &'a str,
    pub ui_languages: &'a [String],
    pub default_site_section: &'a str,
    pub deliverable_cache_dir: &'a Path,
    pub template_dir: &'a Path,
    pub output_dir: &'a Path,
    pub base_url_path: &'a str,
}

pub fn run_navbuild(req: &NavBuildRequest) -> Result<CommandOutput> {
    let args = vec![
        format!("--stitched-config={}", req.stitched_config.display()),
        format!("--target={}", req.target),
        format!("--product={}", req.product),
        format!("--docset={}", req.docset),
        format!("--ui-languages={}", req.ui_languages.join(",")),
        format!("--default-site-section={}", req.default_site_section),
        format!("--deliverable-cache={}", req.deliverable_cache_dir.display()),
        format!("--template-dir={}", req.template_dir.display()),
        format!("--output-dir={}", req.output_dir.display()),
        format!("--base-url-path={}", req.base_url_path),
    ];
    let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();
    run_command(&navbuild_program(), &args_ref, Path::new("."))
}

/// Invoke rsync with `-lr`, plus `--delete-after` and `--exclude-from`
/// when syncing to live (§6).
pub fn run_rsync(
    src: &Path,
    dest: &Path,
    delete_after: bool,
    exclude_from: Option<&Path>,
) -> Result<CommandOutput> {
    let mut args = vec!["-lr".to_string()];
    if delete_after {
        args.push("--delete-after".to_string());
    }
    if let Some(exclude_from) = exclude_from {
        args.push(format!("--exclude-from={}", exclude_from.display()));
    }
    args.push(format!("{}/", src.display()));
    args.push(dest.display().to_string());

    let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();
    run_command(&rsync_program(), &args_ref, Path::new("."))
}
