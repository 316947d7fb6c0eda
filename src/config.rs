//! # Configuration Schema and Parsing
//!
//! The `modsync.yaml` file describes the federation: every repository that
//! can participate in a sync, the default branch specification, where
//! checkouts live, and where accumulated state is persisted. Parsed with
//! serde from YAML.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::repository::name_from_url;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "modsync.yaml";

/// One repository of the federation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    /// Remote URL.
    pub url: String,
    /// Explicit name; derived from the URL when omitted.
    #[serde(default)]
    pub name: Option<String>,
    /// Branch spec override; the global `branch` applies when omitted.
    #[serde(default)]
    pub branch: Option<String>,
    /// Loaded on every sync regardless of the dependency graph (e.g. CDN
    /// content repositories).
    #[serde(default)]
    pub always_load: bool,
    /// Pinned snapshot; never mutated.
    #[serde(default)]
    pub frozen: bool,
    /// Clone with depth 1.
    #[serde(default)]
    pub shallow: bool,
}

impl RepoConfig {
    /// Effective repository name.
    pub fn resolved_name(&self) -> String {
        self.name
            .clone()
            .or_else(|| name_from_url(&self.url))
            .unwrap_or_else(|| self.url.clone())
    }
}

/// The whole configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory the checkouts live under.
    #[serde(default = "default_parent_dir")]
    pub parent_dir: PathBuf,
    /// Persisted state location.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    /// Default branch specification for every repository.
    pub branch: String,
    #[serde(default)]
    pub repositories: Vec<RepoConfig>,
    /// Initial repository set for `sync`.
    #[serde(default)]
    pub roots: Vec<String>,
}

fn default_parent_dir() -> PathBuf {
    PathBuf::from("./repos")
}

fn default_state_file() -> PathBuf {
    PathBuf::from(".modsync/state.json")
}

impl Config {
    /// Parse configuration YAML and validate it.
    pub fn parse(text: &str) -> Result<Config> {
        let config: Config = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Config> {
        let text = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&text)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        for repo in &self.repositories {
            let name = repo.resolved_name();
            if !seen.insert(name.clone()) {
                return Err(Error::Config(format!(
                    "repository {name} is configured twice"
                )));
            }
        }
        for root in &self.roots {
            if !seen.contains(root) {
                return Err(Error::Config(format!(
                    "root {root} does not name a configured repository"
                )));
            }
        }
        Ok(())
    }

    /// Look a repository up by its effective name.
    pub fn repository(&self, name: &str) -> Option<&RepoConfig> {
        self.repositories
            .iter()
            .find(|r| r.resolved_name() == name)
    }

    /// Branch spec effective for one repository.
    pub fn branch_for<'a>(&'a self, repo: &'a RepoConfig) -> &'a str {
        repo.branch.as_deref().unwrap_or(&self.branch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
parent_dir: ./checkouts
branch: rc-24.1100
repositories:
  - url: https://example.com/platform/ws-core.git
  - url: https://example.com/platform/controls.git
    branch: "24.1000/grid:rc-24.2000"
    shallow: true
  - url: https://example.com/content/cdn.git
    name: cdn-content
    always_load: true
    frozen: true
roots: [ws-core]
"#;

    #[test]
    fn test_parse_example() {
        let config = Config::parse(EXAMPLE).unwrap();
        assert_eq!(config.parent_dir, PathBuf::from("./checkouts"));
        assert_eq!(config.state_file, PathBuf::from(".modsync/state.json"));
        assert_eq!(config.repositories.len(), 3);
        assert_eq!(config.roots, vec!["ws-core"]);

        let ws_core = config.repository("ws-core").unwrap();
        assert_eq!(config.branch_for(ws_core), "rc-24.1100");

        let controls = config.repository("controls").unwrap();
        assert_eq!(config.branch_for(controls), "24.1000/grid:rc-24.2000");
        assert!(controls.shallow);

        let cdn = config.repository("cdn-content").unwrap();
        assert!(cdn.always_load);
        assert!(cdn.frozen);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let yaml = r#"
branch: rc-24.1100
repositories:
  - url: https://example.com/a/x.git
  - url: https://example.com/b/x.git
"#;
        let err = Config::parse(yaml).unwrap_err();
        assert!(err.to_string().contains("configured twice"));
    }

    #[test]
    fn test_unknown_root_rejected() {
        let yaml = r#"
branch: rc-24.1100
repositories:
  - url: https://example.com/a/x.git
roots: [nope]
"#;
        let err = Config::parse(yaml).unwrap_err();
        assert!(err.to_string().contains("nope"));
    }
}
