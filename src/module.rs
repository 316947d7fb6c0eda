//! # Module Entity
//!
//! A [`Module`] is one named unit of source code discovered through its
//! manifest, together with its declared dependencies. Dependencies and the
//! owning repository are stored as *names*, weak references resolved through
//! the registries at traversal time, so no module ever structurally points
//! at another module or at a repository. That keeps the graph free of
//! ownership cycles even though the underlying dependency relation is not
//! acyclic.
//!
//! Modules come in four variants ([`ModuleKind`]). Business-logic modules
//! are recognized here but handled by a separate subsystem; the registry
//! drops them on insert.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::manifest::{Manifest, ManifestRoot};
use crate::registry::RepositoryRegistry;
use crate::repository::ChangedFiles;

/// Name suffix that marks a demo module.
const DEMO_SUFFIX: &str = "-demo";

/// The four module variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    Ui,
    Test,
    Demo,
    BusinessLogic,
}

/// One named unit of source code and its declared dependencies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub kind: ModuleKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Module directory.
    pub path: PathBuf,
    pub manifest_path: PathBuf,
    /// Names of the modules this one depends on, in manifest order.
    #[serde(default)]
    pub depends: Vec<String>,
    /// Name of the owning repository. Resolved through the repository
    /// registry; a module does not own its repository.
    #[serde(default)]
    pub repository: Option<String>,
    /// Revision this module was last built at, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_revision: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub for_cdn: bool,
    #[serde(default)]
    pub is_react: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kaizen_zone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kaizen_zone_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responsible: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responsible_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    /// Modules that must be emitted to downstream tooling before this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub load_after: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub features_provided: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub features_required: Vec<String>,
    /// Test environment, for test modules that declare one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    /// Changed-files results keyed by the revision they were computed
    /// against. Not persisted.
    #[serde(skip)]
    changed_cache: HashMap<String, ChangedFiles>,
}

impl Module {
    /// Build a module from a parsed manifest.
    ///
    /// Variant decision: a `bl_module` root is business logic; a
    /// `test`/`unit_test` block makes a test module; a `-demo` name suffix
    /// makes a demo module; everything else is a UI module. The self-name is
    /// filtered out of `depends`; a module never depends on itself.
    pub fn from_manifest(manifest: Manifest, manifest_path: &Path) -> Module {
        let kind = match manifest.root {
            ManifestRoot::BlModule => ModuleKind::BusinessLogic,
            ManifestRoot::UiModule => {
                if manifest.test.is_some() {
                    ModuleKind::Test
                } else if manifest.name.ends_with(DEMO_SUFFIX) {
                    ModuleKind::Demo
                } else {
                    ModuleKind::Ui
                }
            }
        };
        let path = manifest_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let depends = manifest
            .depends
            .into_iter()
            .filter(|d| *d != manifest.name)
            .collect();

        Module {
            name: manifest.name,
            kind,
            id: manifest.id,
            path,
            manifest_path: manifest_path.to_path_buf(),
            depends,
            repository: None,
            last_revision: None,
            required: manifest.required,
            for_cdn: manifest.for_cdn,
            is_react: manifest.is_react,
            kaizen_zone: manifest.kaizen_zone,
            kaizen_zone_uuid: manifest.kaizen_zone_uuid,
            responsible: manifest.responsible,
            responsible_uuid: manifest.responsible_uuid,
            package: manifest.package,
            load_after: manifest.load_after,
            features_provided: manifest.features_provided,
            features_required: manifest.features_required,
            environment: manifest.test.and_then(|t| t.environment),
            changed_cache: HashMap::new(),
        }
    }

    /// Files of this module changed or deleted between `revision` and the
    /// owning repository's current HEAD.
    ///
    /// Delegates to the repository's diff, keeps only paths under the module
    /// directory, and caches the answer per revision so repeated calls for
    /// the same revision do not re-invoke the diff.
    pub fn changed_files(
        &mut self,
        repositories: &RepositoryRegistry,
        revision: &str,
    ) -> Result<ChangedFiles> {
        if let Some(hit) = self.changed_cache.get(revision) {
            return Ok(hit.clone());
        }

        let repo_name = self.repository.as_deref().ok_or_else(|| {
            Error::Config(format!("module {} has no owning repository", self.name))
        })?;
        let repository = repositories.get(repo_name).ok_or_else(|| {
            Error::Config(format!(
                "module {} names unknown repository {}",
                self.name, repo_name
            ))
        })?;

        let all = repository.changed_files(revision)?;
        let filtered = ChangedFiles {
            changed: all
                .changed
                .into_iter()
                .filter(|p| p.starts_with(&self.path))
                .collect(),
            deleted: all
                .deleted
                .into_iter()
                .filter(|p| p.starts_with(&self.path))
                .collect(),
        };
        self.changed_cache
            .insert(revision.to_string(), filtered.clone());
        Ok(filtered)
    }

    /// Fold another description of the same module into this one.
    ///
    /// Used by the registry to keep one entry per name: descriptive fields
    /// take the newcomer's values (latest wins), optional provenance fields
    /// are only overwritten when the newcomer actually carries them. The
    /// changed-files cache is dropped since the module may have moved.
    pub fn merge_from(&mut self, other: Module) {
        debug_assert_eq!(self.name, other.name);
        self.kind = other.kind;
        self.path = other.path;
        self.manifest_path = other.manifest_path;
        self.depends = other.depends;
        self.required = other.required;
        self.for_cdn = other.for_cdn;
        self.is_react = other.is_react;
        self.load_after = other.load_after;
        self.features_provided = other.features_provided;
        self.features_required = other.features_required;
        self.environment = other.environment;
        if other.id.is_some() {
            self.id = other.id;
        }
        if other.repository.is_some() {
            self.repository = other.repository;
        }
        if other.last_revision.is_some() {
            self.last_revision = other.last_revision;
        }
        if other.kaizen_zone.is_some() {
            self.kaizen_zone = other.kaizen_zone;
            self.kaizen_zone_uuid = other.kaizen_zone_uuid;
        }
        if other.responsible.is_some() {
            self.responsible = other.responsible;
            self.responsible_uuid = other.responsible_uuid;
        }
        if other.package.is_some() {
            self.package = other.package;
        }
        self.changed_cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;

    fn parse(xml: &str) -> Manifest {
        Manifest::parse(xml).unwrap()
    }

    #[test]
    fn test_variant_ui_by_default() {
        let m = Module::from_manifest(
            parse(r#"<ui_module name="Controls"/>"#),
            Path::new("/repo/Controls/Controls.s3mod"),
        );
        assert_eq!(m.kind, ModuleKind::Ui);
        assert_eq!(m.path, Path::new("/repo/Controls"));
    }

    #[test]
    fn test_variant_test_from_unit_test_block() {
        let m = Module::from_manifest(
            parse(r#"<ui_module name="ControlsUnit"><unit_test environment="node"/></ui_module>"#),
            Path::new("/repo/ControlsUnit/ControlsUnit.s3mod"),
        );
        assert_eq!(m.kind, ModuleKind::Test);
        assert_eq!(m.environment.as_deref(), Some("node"));
    }

    #[test]
    fn test_variant_demo_from_name_suffix() {
        let m = Module::from_manifest(
            parse(r#"<ui_module name="Controls-demo"/>"#),
            Path::new("/repo/Controls-demo/Controls-demo.s3mod"),
        );
        assert_eq!(m.kind, ModuleKind::Demo);
    }

    #[test]
    fn test_variant_business_logic_from_root() {
        let m = Module::from_manifest(
            parse(r#"<bl_module name="Billing"/>"#),
            Path::new("/repo/Billing/Billing.s3mod"),
        );
        assert_eq!(m.kind, ModuleKind::BusinessLogic);
    }

    #[test]
    fn test_self_dependency_is_dropped() {
        let m = Module::from_manifest(
            parse(
                r#"<ui_module name="Controls"><depends><module name="Controls"/><module name="Types"/></depends></ui_module>"#,
            ),
            Path::new("/repo/Controls/Controls.s3mod"),
        );
        assert_eq!(m.depends, vec!["Types"]);
    }

    #[test]
    fn test_changed_files_stay_inside_the_module_directory() {
        use crate::git::{GitClient, GitOutput};
        use crate::repository::SourceRepository;
        use std::sync::Arc;

        #[derive(Debug)]
        struct DiffGit;
        impl GitClient for DiffGit {
            fn run(&self, _cwd: &Path, args: &[&str]) -> crate::error::Result<GitOutput> {
                if args.first() == Some(&"diff") {
                    Ok(GitOutput::ok(
                        "M\tControls/grid.ts\nD\tControls/list.ts\nM\tTypes/entity.ts\n",
                    ))
                } else {
                    Ok(GitOutput::ok(""))
                }
            }
        }

        let mut repos = RepositoryRegistry::default();
        repos.insert(
            SourceRepository::with_name(
                "ws-core",
                "https://example.com/ws-core.git",
                Path::new("/repos"),
                "rc-22.1000",
            )
            .with_git(Arc::new(DiffGit)),
        );

        let mut m = Module::from_manifest(
            parse(r#"<ui_module name="Controls"/>"#),
            Path::new("/repos/ws-core/Controls/Controls.s3mod"),
        );
        m.repository = Some("ws-core".to_string());

        let files = m.changed_files(&repos, "a1b2c3").unwrap();
        assert_eq!(
            files.changed,
            vec![PathBuf::from("/repos/ws-core/Controls/grid.ts")]
        );
        assert_eq!(
            files.deleted,
            vec![PathBuf::from("/repos/ws-core/Controls/list.ts")]
        );
        for path in files.changed.iter().chain(&files.deleted) {
            assert!(path.starts_with("/repos/ws-core/Controls"));
        }

        // Second call for the same revision is served from the cache.
        let again = m.changed_files(&repos, "a1b2c3").unwrap();
        assert_eq!(again, files);
    }

    #[test]
    fn test_changed_files_without_repository_is_a_config_error() {
        let mut m = Module::from_manifest(
            parse(r#"<ui_module name="Controls"/>"#),
            Path::new("/repo/Controls/Controls.s3mod"),
        );
        let repos = RepositoryRegistry::default();
        let err = m.changed_files(&repos, "a1b2c3").unwrap_err();
        assert_eq!(err.code(), "CONFIG");
    }

    #[test]
    fn test_merge_from_takes_latest_required() {
        let mut first = Module::from_manifest(
            parse(r#"<ui_module name="Controls" required="true"/>"#),
            Path::new("/repo/Controls/Controls.s3mod"),
        );
        let second = Module::from_manifest(
            parse(r#"<ui_module name="Controls"/>"#),
            Path::new("/repo/Controls/Controls.s3mod"),
        );
        first.merge_from(second);
        assert!(!first.required);
    }
}
