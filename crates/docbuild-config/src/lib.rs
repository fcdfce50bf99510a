//! Server-level TOML configuration (SPEC_FULL.md §1.1).
//!
//! This is *not* the per-target XML document configuration tree the
//! stitcher owns — the core never parses that. This crate only covers the
//! server's own `[server]`/`[notify]`/`[target.*]` sections: host/port,
//! thread count, working directories, and the set of targets the server is
//! allowed to build for.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use docbuild_notify::NotifyConfig;
use serde::{Deserialize, Serialize};

/// `max_threads` accepts either the literal `"max"` or an explicit count.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MaxThreads {
    Literal(String),
    Count(usize),
}

impl MaxThreads {
    /// Resolve against the host's core count, per §1.1 ("clamped to host
    /// core count").
    pub fn resolve(&self, host_cores: usize) -> Result<usize> {
        match self {
            MaxThreads::Count(n) => Ok((*n).min(host_cores).max(1)),
            MaxThreads::Literal(s) if s == "max" => Ok(host_cores.max(1)),
            MaxThreads::Literal(s) => {
                bail!("max_threads must be \"max\" or an integer, got {s:?}")
            }
        }
    }
}

fn default_loglevel() -> u8 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub max_threads: MaxThreads,
    pub cache_dir: PathBuf,
    pub repo_dir: PathBuf,
    pub temp_repo_dir: PathBuf,
    pub valid_languages: Vec<String>,
    #[serde(default = "default_loglevel")]
    pub loglevel: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub internal: bool,
    pub config_dir: PathBuf,
    pub backup_path: PathBuf,
    #[serde(default)]
    pub target_path: Option<PathBuf>,
    #[serde(default)]
    pub enable_target_sync: bool,
    #[serde(default)]
    pub exclude_file: Option<PathBuf>,
    pub template_dir: PathBuf,
    pub server_root_files: PathBuf,
    #[serde(default)]
    pub zip_formats: Vec<String>,
    pub languages: Vec<String>,
    pub default_lang: String,
    #[serde(default)]
    pub omit_default_lang_path: bool,
    pub canonical_url_domain: String,
    pub server_base_path: String,
    #[serde(default)]
    pub site_sections: Vec<String>,
    #[serde(default)]
    pub default_site_section: String,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub remarks: bool,
    #[serde(default)]
    pub meta: bool,
    pub default_xslt_params: PathBuf,
    #[serde(default)]
    pub container_image: Option<String>,
}

impl TargetConfig {
    /// Validate cross-field requirements that plain `#[serde(default)]`
    /// can't express (§1.1: "a target section missing a required key" is
    /// fatal at startup).
    fn validate(&self, name: &str) -> Result<()> {
        if self.enable_target_sync && self.target_path.is_none() {
            bail!("target {name:?} has enable_target_sync=true but no target_path");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub notify: NotifyConfig,
    #[serde(default, rename = "target")]
    pub targets: HashMap<String, TargetConfig>,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.server.valid_languages.is_empty() {
            bail!("server.valid_languages must not be empty");
        }
        for (name, target) in &self.targets {
            target.validate(name)?;
        }
        Ok(())
    }

    pub fn target(&self, name: &str) -> Option<&TargetConfig> {
        self.targets.get(name)
    }

    pub fn is_active_target(&self, name: &str) -> bool {
        self.targets.get(name).is_some_and(|t| t.active)
    }

    pub fn is_valid_language(&self, lang: &str) -> bool {
        self.server.valid_languages.iter().any(|l| l == lang)
    }
}

/// Load and validate the server configuration from a TOML file. Any error
/// here (missing section, unparseable value, a target missing a required
/// key) is fatal at startup per §1.1 and §7 error kind 2 — the caller
/// should log the diagnostic and exit non-zero.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&content)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn minimal_toml() -> &'static str {
        r#"
[server]
name = "docbuild"
host = "127.0.0.1"
port = 8080
max_threads = "max"
cache_dir = "/var/cache/docbuild"
repo_dir = "/var/cache/docbuild/repos"
temp_repo_dir = "/tmp/docbuild/repos"
valid_languages = ["en-us", "de-de"]

[notify]
enabled = true
mode = "file-drop"
drop_dir = "/var/cache/docbuild/notify"

[target.main]
active = true
internal = false
config_dir = "/etc/docbuild/main"
backup_path = "/srv/backup/main"
template_dir = "/etc/docbuild/templates"
server_root_files = "/etc/docbuild/root-files"
languages = ["en-us"]
default_lang = "en-us"
canonical_url_domain = "docs.example.com"
server_base_path = "/documentation"
default_xslt_params = "/etc/docbuild/main/xslt-defaults.txt"
"#
    }

    #[test]
    fn loads_minimal_config() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("docbuild.toml");
        fs::write(&path, minimal_toml()).expect("write");

        let config = load_config(&path).expect("load");
        assert_eq!(config.server.name, "docbuild");
        assert_eq!(config.server.valid_languages, vec!["en-us", "de-de"]);
        assert!(config.targets.contains_key("main"));
        assert!(config.is_active_target("main"));
        assert!(config.is_valid_language("en-us"));
        assert!(!config.is_valid_language("fr-fr"));
    }

    #[test]
    fn max_threads_literal_resolves_to_host_cores() {
        let max = MaxThreads::Literal("max".to_string());
        assert_eq!(max.resolve(4).unwrap(), 4);
    }

    #[test]
    fn max_threads_count_is_clamped_to_host_cores() {
        let max = MaxThreads::Count(99);
        assert_eq!(max.resolve(4).unwrap(), 4);
    }

    #[test]
    fn max_threads_count_below_cores_is_unchanged() {
        let max = MaxThreads::Count(2);
        assert_eq!(max.resolve(8).unwrap(), 2);
    }

    #[test]
    fn max_threads_invalid_literal_is_rejected() {
        let max = MaxThreads::Literal("lots".to_string());
        assert!(max.resolve(4).is_err());
    }

    #[test]
    fn missing_config_file_errors() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("missing.toml");
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn malformed_toml_errors() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("docbuild.toml");
        fs::write(&path, "not valid = [toml").expect("write");
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn missing_required_server_key_errors() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("docbuild.toml");
        fs::write(&path, "[server]\nname = \"docbuild\"\n").expect("write");
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn enable_target_sync_without_target_path_fails_validation() {
        let toml_str = minimal_toml().replace(
            "active = true\ninternal = false",
            "active = true\ninternal = false\nenable_target_sync = true",
        );
        let td = tempdir().expect("tempdir");
        let path = td.path().join("docbuild.toml");
        fs::write(&path, &toml_str).expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("enable_target_sync"));
    }
}
