//! # Module and Repository Registries
//!
//! [`ModuleRegistry`] is the central name-keyed index of all retained
//! modules. Everything that resolves a dependency name does it through this
//! registry, which is passed explicitly to whatever needs it; there is no
//! ambient singleton. Partition indexes keep the ui/test/demo subsets
//! addressable without duplicating entries.
//!
//! Two pieces of fixed data live here:
//!
//! - [`IGNORED_MODULES`]: legacy module names silently dropped on insert.
//! - [`CYCLE_OVERRIDES`]: synthetic extra dependencies appended to a handful
//!   of foundational modules whose true circular relationship with their own
//!   dependents cannot be expressed in the manifest format. The data is
//!   normalized once per insert so every downstream graph algorithm can
//!   assume a representable graph instead of special-casing these names.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::module::{Module, ModuleKind};
use crate::repository::SourceRepository;

/// Legacy module names dropped on insert.
pub const IGNORED_MODULES: &[&str] = &["DemoStand", "Deprecated"];

/// Synthetic extra dependencies appended after parsing. The listed modules
/// have a real circular relationship with their own dependents that the
/// manifest format cannot express.
pub const CYCLE_OVERRIDES: &[(&str, &[&str])] =
    &[("WS.Core", &["Types", "Env"]), ("View", &["UI"])];

/// Name-keyed index of all known modules, partitioned by variant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, Module>", into = "BTreeMap<String, Module>")]
pub struct ModuleRegistry {
    modules: BTreeMap<String, Module>,
    ui: BTreeSet<String>,
    test: BTreeSet<String>,
    demo: BTreeSet<String>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a module, or fold it into the existing entry with the same
    /// name.
    ///
    /// Business-logic modules and ignore-listed names are silently dropped.
    /// A name collision merges field-by-field into the existing entry (same
    /// identity, updated attributes), so external holders of the name keep
    /// observing one module. Cycle overrides are applied afterwards, so they
    /// hold no matter what the manifest declared.
    pub fn add(&mut self, module: Module) {
        if module.kind == ModuleKind::BusinessLogic {
            debug!("dropping business-logic module {}", module.name);
            return;
        }
        if IGNORED_MODULES.contains(&module.name.as_str()) {
            debug!("dropping ignore-listed module {}", module.name);
            return;
        }

        let name = module.name.clone();
        match self.modules.get_mut(&name) {
            Some(existing) => {
                self.ui.remove(&name);
                self.test.remove(&name);
                self.demo.remove(&name);
                existing.merge_from(module);
            }
            None => {
                self.modules.insert(name.clone(), module);
            }
        }
        self.apply_cycle_overrides(&name);
        if let Some(module) = self.modules.get(&name) {
            match module.kind {
                ModuleKind::Ui => {
                    self.ui.insert(name);
                }
                ModuleKind::Test => {
                    self.test.insert(name);
                }
                ModuleKind::Demo => {
                    self.demo.insert(name);
                }
                ModuleKind::BusinessLogic => {}
            }
        }
    }

    fn apply_cycle_overrides(&mut self, name: &str) {
        let Some((_, extras)) = CYCLE_OVERRIDES.iter().find(|(n, _)| *n == name) else {
            return;
        };
        let Some(module) = self.modules.get_mut(name) else {
            return;
        };
        for extra in *extras {
            if *extra != module.name && !module.depends.iter().any(|d| d == extra) {
                module.depends.push((*extra).to_string());
            }
        }
    }

    /// Fold every module of `other` into this registry.
    pub fn merge(&mut self, other: ModuleRegistry) {
        for (_, module) in other.modules {
            self.add(module);
        }
    }

    pub fn get(&self, name: &str) -> Option<&Module> {
        self.modules.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Module> {
        self.modules.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Explicit deletion, e.g. when a manifest disappears between syncs.
    pub fn remove(&mut self, name: &str) -> Option<Module> {
        self.ui.remove(name);
        self.test.remove(name);
        self.demo.remove(name);
        self.modules.remove(name)
    }

    /// Matching modules. An omitted name filter returns all modules of the
    /// given (or any) variant.
    pub fn modules(&self, names: Option<&[String]>, kind: Option<ModuleKind>) -> Vec<&Module> {
        self.modules
            .values()
            .filter(|m| kind.map_or(true, |k| m.kind == k))
            .filter(|m| names.map_or(true, |ns| ns.iter().any(|n| *n == m.name)))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Module> {
        self.modules.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

// The registry serializes as its plain name -> module map; partition indexes
// are rebuilt through `add` on the way in.
impl From<BTreeMap<String, Module>> for ModuleRegistry {
    fn from(modules: BTreeMap<String, Module>) -> Self {
        let mut registry = ModuleRegistry::new();
        for (_, module) in modules {
            registry.add(module);
        }
        registry
    }
}

impl From<ModuleRegistry> for BTreeMap<String, Module> {
    fn from(registry: ModuleRegistry) -> Self {
        registry.modules
    }
}

/// Name-keyed index of all known source repositories.
#[derive(Debug, Default)]
pub struct RepositoryRegistry {
    repos: BTreeMap<String, SourceRepository>,
}

impl RepositoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, repository: SourceRepository) {
        self.repos.insert(repository.name.clone(), repository);
    }

    pub fn get(&self, name: &str) -> Option<&SourceRepository> {
        self.repos.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut SourceRepository> {
        self.repos.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.repos.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<SourceRepository> {
        self.repos.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SourceRepository> {
        self.repos.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SourceRepository> {
        self.repos.values_mut()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.repos.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.repos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repos.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;
    use std::path::PathBuf;

    fn module(name: &str, xml: &str) -> Module {
        let manifest = Manifest::parse(xml).unwrap();
        let manifest_path = PathBuf::from(format!("/repo/{name}/{name}.s3mod"));
        Module::from_manifest(manifest, &manifest_path)
    }

    #[test]
    fn test_add_drops_business_logic() {
        let mut registry = ModuleRegistry::new();
        registry.add(module("Billing", r#"<bl_module name="Billing"/>"#));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_add_drops_ignore_listed_names() {
        let mut registry = ModuleRegistry::new();
        registry.add(module("DemoStand", r#"<ui_module name="DemoStand"/>"#));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_add_keeps_one_entry_with_latest_required() {
        let mut registry = ModuleRegistry::new();
        registry.add(module("A", r#"<ui_module name="A" required="true"/>"#));
        registry.add(module("A", r#"<ui_module name="A"/>"#));
        assert_eq!(registry.len(), 1);
        assert!(!registry.get("A").unwrap().required);

        registry.add(module("A", r#"<ui_module name="A" required="1"/>"#));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("A").unwrap().required);
    }

    #[test]
    fn test_cycle_override_applies_regardless_of_manifest() {
        let mut registry = ModuleRegistry::new();
        registry.add(module("WS.Core", r#"<ui_module name="WS.Core"/>"#));
        let depends = &registry.get("WS.Core").unwrap().depends;
        assert!(depends.contains(&"Types".to_string()));
        assert!(depends.contains(&"Env".to_string()));

        // A later merge with manifest-declared depends keeps the overrides.
        registry.add(module(
            "WS.Core",
            r#"<ui_module name="WS.Core"><depends><module name="Types"/></depends></ui_module>"#,
        ));
        let depends = &registry.get("WS.Core").unwrap().depends;
        assert!(depends.contains(&"Types".to_string()));
        assert!(depends.contains(&"Env".to_string()));
        assert_eq!(
            depends.iter().filter(|d| *d == "Types").count(),
            1,
            "override must not duplicate a declared dependency"
        );
    }

    #[test]
    fn test_partition_indexes_follow_kind_changes() {
        let mut registry = ModuleRegistry::new();
        registry.add(module("X", r#"<ui_module name="X"/>"#));
        assert_eq!(registry.modules(None, Some(ModuleKind::Ui)).len(), 1);

        // Re-added with a test block: moves from the ui to the test partition.
        registry.add(module("X", r#"<ui_module name="X"><test/></ui_module>"#));
        assert!(registry.modules(None, Some(ModuleKind::Ui)).is_empty());
        assert_eq!(registry.modules(None, Some(ModuleKind::Test)).len(), 1);
    }

    #[test]
    fn test_modules_name_filter() {
        let mut registry = ModuleRegistry::new();
        registry.add(module("A", r#"<ui_module name="A"/>"#));
        registry.add(module("B", r#"<ui_module name="B"/>"#));
        let selected = registry.modules(Some(&["B".to_string()]), None);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name, "B");
    }

    #[test]
    fn test_merge_folds_other_registry() {
        let mut left = ModuleRegistry::new();
        left.add(module("A", r#"<ui_module name="A"/>"#));
        let mut right = ModuleRegistry::new();
        right.add(module("B", r#"<ui_module name="B"/>"#));
        right.add(module("A", r#"<ui_module name="A" required="true"/>"#));

        left.merge(right);
        assert_eq!(left.len(), 2);
        assert!(left.get("A").unwrap().required);
    }

    #[test]
    fn test_serde_roundtrip_rebuilds_partitions() {
        let mut registry = ModuleRegistry::new();
        registry.add(module("A", r#"<ui_module name="A"/>"#));
        registry.add(module("T", r#"<ui_module name="T"><unit_test/></ui_module>"#));

        let json = serde_json::to_string(&registry).unwrap();
        let back: ModuleRegistry = serde_json::from_str(&json).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back.modules(None, Some(ModuleKind::Test)).len(), 1);
    }
}
