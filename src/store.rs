//! # Sync Orchestrator
//!
//! [`Store`] drives repeated rounds of repository loading and module-graph
//! expansion to a fixpoint and persists the accumulated state between runs.
//!
//! ## Scheduling model
//!
//! A single orchestrating flow issues batches of I/O-bound work (subprocess
//! invocations, filesystem scans) through a bounded rayon pool. Each worker
//! owns exactly one repository for the duration of its unit of work; the
//! module registries are only ever mutated on the orchestrating flow, after
//! the workers have returned their results. Initialization of every
//! repository in a batch completes before any checkout strategy is computed:
//! strategy detection inspects remote branch lists that must reflect the
//! just-finished fetches, and computing strategies concurrently would read
//! inconsistent intermediate git state. A failure in any pooled unit fails
//! the whole batch; already-dispatched siblings are not cancelled, their
//! results are discarded.
//!
//! ## Fixpoint expansion
//!
//! Starting from the root repositories, each round selects the modules owned
//! by everything loaded so far, expands them to their transitive dependency
//! closure over the accumulated registry (which includes modules remembered
//! from previous runs), and loads whichever owning repositories are still
//! missing, plus everything flagged `always_load`. The repository universe
//! is finite and only ever grows, so the iteration terminates.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::git::{GitClient, SystemGit};
use crate::module::{Module, ModuleKind};
use crate::registry::{ModuleRegistry, RepositoryRegistry};
use crate::repository::{CheckoutStrategy, SourceRepository};

/// Environment override reducing the worker pool width, down to 1, for
/// hosts that cannot stand three concurrent clones.
pub const ENV_MAX_WORKERS: &str = "MODSYNC_MAX_WORKERS";

const DEFAULT_WORKERS: usize = 3;

fn worker_count() -> usize {
    std::env::var(ENV_MAX_WORKERS)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|n| *n >= 1)
        .map(|n| n.min(DEFAULT_WORKERS))
        .unwrap_or(DEFAULT_WORKERS)
}

/// Persisted shape of one repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryState {
    pub dir: PathBuf,
    pub name: String,
    pub url: String,
    pub path: PathBuf,
    #[serde(default)]
    pub initialized: bool,
    #[serde(rename = "HEAD", default)]
    pub head: Option<String>,
    #[serde(rename = "loadHistory", default)]
    pub load_history: Vec<String>,
}

impl RepositoryState {
    fn of(repository: &SourceRepository) -> RepositoryState {
        RepositoryState {
            dir: repository.parent_dir.clone(),
            name: repository.name.clone(),
            url: repository.url.clone(),
            path: repository.path.clone(),
            initialized: repository.initialized,
            head: repository.head.clone(),
            load_history: repository.load_history.clone(),
        }
    }

    fn into_repository(self, git: Arc<dyn GitClient>) -> SourceRepository {
        let mut repository =
            SourceRepository::with_name(&self.name, &self.url, &self.dir, "").with_git(git);
        repository.path = self.path;
        repository.initialized = self.initialized;
        repository.head = self.head;
        repository.load_history = self.load_history;
        repository
    }
}

/// On-disk state cache.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    #[serde(default)]
    repositories: BTreeMap<String, RepositoryState>,
    #[serde(default)]
    modules: BTreeMap<String, Module>,
}

/// The synchronization orchestrator.
pub struct Store {
    pub repositories: RepositoryRegistry,
    /// All modules ever seen, persisted between runs.
    pub modules: ModuleRegistry,
    /// Modules discovered during the current pass.
    pub new_modules: ModuleRegistry,
    /// Repositories synchronized during the current run.
    loaded: BTreeSet<String>,
    state_path: PathBuf,
    git: Arc<dyn GitClient>,
}

impl Store {
    /// Fresh store backed by the system git binary.
    pub fn new(state_path: &Path) -> Store {
        Self::with_git(state_path, Arc::new(SystemGit))
    }

    pub fn with_git(state_path: &Path, git: Arc<dyn GitClient>) -> Store {
        Store {
            repositories: RepositoryRegistry::new(),
            modules: ModuleRegistry::new(),
            new_modules: ModuleRegistry::new(),
            loaded: BTreeSet::new(),
            state_path: state_path.to_path_buf(),
            git,
        }
    }

    /// Load persisted state; a missing file is a fresh store.
    pub fn load(state_path: &Path) -> Result<Store> {
        Self::load_with_git(state_path, Arc::new(SystemGit))
    }

    pub fn load_with_git(state_path: &Path, git: Arc<dyn GitClient>) -> Result<Store> {
        let mut store = Store::with_git(state_path, git.clone());
        if state_path.exists() {
            let text = fs::read_to_string(state_path)?;
            let state: StoreState = serde_json::from_str(&text)?;
            for (_, repo_state) in state.repositories {
                store
                    .repositories
                    .insert(repo_state.into_repository(git.clone()));
            }
            store.modules = ModuleRegistry::from(state.modules);
            debug!(
                "loaded state: {} repositories, {} modules",
                store.repositories.len(),
                store.modules.len()
            );
        }
        Ok(store)
    }

    /// Persist accumulated state (temp file + rename).
    pub fn save(&self) -> Result<()> {
        let state = StoreState {
            repositories: self
                .repositories
                .iter()
                .map(|r| (r.name.clone(), RepositoryState::of(r)))
                .collect(),
            modules: self.modules.clone().into(),
        };
        if let Some(parent) = self.state_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(&state)?;
        let tmp = self.state_path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.state_path)?;
        Ok(())
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded.contains(name)
    }

    /// Register and synchronize a batch of repositories.
    ///
    /// Phases, in order: concurrent `init` (clone or update) on the bounded
    /// pool; sequential strategy detection; concurrent checkout and module
    /// discovery; registry merges and HEAD re-resolution on the
    /// orchestrating flow. Repositories already loaded this run are skipped.
    pub fn add_repositories(&mut self, specs: Vec<SourceRepository>) -> Result<()> {
        let mut fresh: Vec<String> = Vec::new();
        for spec in specs {
            if self.loaded.contains(&spec.name) || fresh.contains(&spec.name) {
                continue;
            }
            let name = spec.name.clone();
            match self.repositories.get_mut(&name) {
                Some(existing) => existing.refresh_from(&spec),
                None => self.repositories.insert(spec),
            }
            fresh.push(name);
        }
        if fresh.is_empty() {
            return Ok(());
        }
        info!("synchronizing {}: {}", fresh.len(), fresh.join(", "));

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(worker_count())
            .build()
            .map_err(|e| Error::Config(format!("cannot build worker pool: {e}")))?;

        // Initialize everything first; strategies depend on fetched state.
        {
            let mut targets: Vec<&mut SourceRepository> = self
                .repositories
                .iter_mut()
                .filter(|r| fresh.contains(&r.name))
                .collect();
            pool.install(|| {
                targets
                    .par_iter_mut()
                    .map(|repo| repo.init())
                    .collect::<Result<Vec<()>>>()
            })?;
        }

        let mut strategies: BTreeMap<String, CheckoutStrategy> = BTreeMap::new();
        for name in &fresh {
            if let Some(repo) = self.repositories.get(name) {
                strategies.insert(name.clone(), repo.detect_checkout_strategy()?);
            }
        }

        let discovered: Vec<Vec<Module>> = {
            let strategies = &strategies;
            let mut targets: Vec<&mut SourceRepository> = self
                .repositories
                .iter_mut()
                .filter(|r| fresh.contains(&r.name))
                .collect();
            pool.install(|| {
                targets
                    .par_iter_mut()
                    .map(|repo| {
                        if let Some(strategy) = strategies.get(&repo.name) {
                            repo.checkout_by_strategy(strategy)?;
                            repo.invalidate_modules();
                        }
                        Ok(repo.modules()?.to_vec())
                    })
                    .collect::<Result<Vec<_>>>()
            })?
        };

        for modules in discovered {
            for module in modules {
                self.modules.add(module.clone());
                self.new_modules.add(module);
            }
        }

        for name in &fresh {
            if let Some(repo) = self.repositories.get_mut(name) {
                repo.resolve_head()?;
                let spec = repo.required_branch.clone();
                repo.load_history.push(spec);
            }
            self.loaded.insert(name.clone());
        }
        Ok(())
    }

    /// Run the dependency-driven fixpoint sync from the given roots (or the
    /// configured ones when none are passed).
    pub fn sync(&mut self, config: &Config, roots: &[String]) -> Result<()> {
        let roots: Vec<String> = if roots.is_empty() {
            config.roots.clone()
        } else {
            roots.to_vec()
        };
        if roots.is_empty() {
            return Err(Error::Config("no root repositories given".to_string()));
        }

        let mut pending: Vec<SourceRepository> = Vec::new();
        for root in &roots {
            let spec = self.spec_for(root, config).ok_or_else(|| {
                Error::Config(format!("root {root} does not name a configured repository"))
            })?;
            pending.push(spec);
        }

        let mut rounds = 0usize;
        loop {
            self.add_repositories(pending)?;
            rounds += 1;

            let mut selected: BTreeMap<String, Module> = self
                .modules
                .iter()
                .filter(|m| {
                    m.repository
                        .as_deref()
                        .map_or(false, |r| self.loaded.contains(r))
                })
                .map(|m| (m.name.clone(), m.clone()))
                .collect();
            self.dependencies_closure(&mut selected);

            let mut wanted: BTreeSet<String> = selected
                .values()
                .filter_map(|m| m.repository.clone())
                .collect();
            for repo in &config.repositories {
                if repo.always_load {
                    wanted.insert(repo.resolved_name());
                }
            }

            pending = Vec::new();
            for name in wanted {
                if self.loaded.contains(&name) {
                    continue;
                }
                match self.spec_for(&name, config) {
                    Some(spec) => pending.push(spec),
                    None => warn!("repository {name} is required but not configured; skipping"),
                }
            }
            if pending.is_empty() {
                break;
            }
        }
        debug!("sync converged after {rounds} round(s)");
        self.prune_missing_modules();
        Ok(())
    }

    /// Build a repository spec for `name` from configuration, falling back
    /// to remembered state for repositories no longer configured.
    fn spec_for(&self, name: &str, config: &Config) -> Option<SourceRepository> {
        if let Some(rc) = config.repository(name) {
            let spec = SourceRepository::with_name(
                &rc.resolved_name(),
                &rc.url,
                &config.parent_dir,
                config.branch_for(rc),
            )
            .frozen(rc.frozen)
            .shallow(rc.shallow)
            .with_git(self.git.clone());
            return Some(spec);
        }
        self.repositories.get(name).map(|existing| {
            SourceRepository::with_name(name, &existing.url, &config.parent_dir, &config.branch)
                .with_git(self.git.clone())
        })
    }

    /// Drop modules whose manifests disappeared from a repository scanned
    /// this pass.
    fn prune_missing_modules(&mut self) {
        let stale: Vec<String> = self
            .modules
            .iter()
            .filter(|m| {
                m.repository
                    .as_deref()
                    .map_or(false, |r| self.loaded.contains(r))
            })
            .filter(|m| !self.new_modules.contains(&m.name))
            .map(|m| m.name.clone())
            .collect();
        for name in stale {
            info!("module {name} disappeared from its repository; dropping");
            self.modules.remove(&name);
        }
    }

    /// Expand a module set to its transitive dependency closure, in place.
    ///
    /// Dependency names are resolved through the accumulated registry; names
    /// the registry does not know are logged and skipped. Membership is
    /// checked before recursing, so the traversal terminates on the
    /// normalized cyclic graph and the operation is idempotent.
    pub fn dependencies_closure(&self, selected: &mut BTreeMap<String, Module>) {
        let mut queue: Vec<String> = selected
            .values()
            .flat_map(|m| m.depends.iter().cloned())
            .collect();
        while let Some(name) = queue.pop() {
            if selected.contains_key(&name) {
                continue;
            }
            match self.modules.get(&name) {
                Some(module) => {
                    queue.extend(module.depends.iter().cloned());
                    selected.insert(name, module.clone());
                }
                None => debug!("dependency {name} is not known to the registry"),
            }
        }
    }

    /// The reverse of the `depends` relation: every module of the given
    /// kind declaring a dependency on any name in `depends`. With
    /// `check_same_repository`, a dependent is only included when it is
    /// owned by the same repository as the module it depends on.
    pub fn dependent_modules(
        &self,
        depends: &[String],
        kind: Option<ModuleKind>,
        check_same_repository: bool,
    ) -> Vec<&Module> {
        self.modules
            .modules(None, kind)
            .into_iter()
            .filter(|m| {
                m.depends.iter().any(|d| {
                    if !depends.iter().any(|dep| dep == d) {
                        return false;
                    }
                    if !check_same_repository {
                        return true;
                    }
                    self.modules
                        .get(d)
                        .map_or(false, |target| target.repository == m.repository)
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;
    use proptest::prelude::*;

    fn module(name: &str, repository: &str, depends: &[&str]) -> Module {
        let depends_xml: String = depends
            .iter()
            .map(|d| format!(r#"<module name="{d}"/>"#))
            .collect();
        let xml = format!(r#"<ui_module name="{name}"><depends>{depends_xml}</depends></ui_module>"#);
        let manifest = Manifest::parse(&xml).unwrap();
        let manifest_path = PathBuf::from(format!("/repo/{name}/{name}.s3mod"));
        let mut module = Module::from_manifest(manifest, &manifest_path);
        module.repository = Some(repository.to_string());
        module
    }

    fn store_with(modules: Vec<Module>) -> Store {
        let mut store = Store::new(Path::new("/tmp/modsync-test-state.json"));
        for m in modules {
            store.modules.add(m);
        }
        store
    }

    #[test]
    fn test_closure_expands_transitively_and_terminates_on_cycles() {
        let store = store_with(vec![
            module("A", "r1", &["B"]),
            module("B", "r1", &["C", "A"]), // cycle back to A
            module("C", "r2", &[]),
            module("D", "r2", &[]), // unrelated
        ]);

        let mut selected: BTreeMap<String, Module> = BTreeMap::new();
        let a = store.modules.get("A").unwrap().clone();
        selected.insert(a.name.clone(), a);

        store.dependencies_closure(&mut selected);
        let mut names: Vec<&str> = selected.keys().map(String::as_str).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_closure_is_idempotent() {
        let store = store_with(vec![
            module("A", "r1", &["B"]),
            module("B", "r1", &["C"]),
            module("C", "r2", &[]),
        ]);
        let mut selected: BTreeMap<String, Module> = BTreeMap::new();
        let a = store.modules.get("A").unwrap().clone();
        selected.insert(a.name.clone(), a);

        store.dependencies_closure(&mut selected);
        let first: Vec<String> = selected.keys().cloned().collect();
        store.dependencies_closure(&mut selected);
        let second: Vec<String> = selected.keys().cloned().collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_dependent_modules_inverts_depends() {
        let store = store_with(vec![
            module("A", "r1", &["B"]),
            module("B", "r2", &[]),
            module("C", "r1", &[]),
        ]);

        let dependents = store.dependent_modules(&["B".to_string()], None, false);
        let names: Vec<&str> = dependents.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["A"]);

        // B in depends(A) <=> A in dependents({B})
        assert!(store
            .modules
            .get("A")
            .unwrap()
            .depends
            .contains(&"B".to_string()));
        assert!(store
            .dependent_modules(&["C".to_string()], None, false)
            .is_empty());
    }

    #[test]
    fn test_dependent_modules_same_repository_filter() {
        let store = store_with(vec![
            module("Base", "r2", &[]),
            module("Faraway", "r1", &["Base"]),
            module("Sibling", "r2", &["Base"]),
        ]);

        let all = store.dependent_modules(&["Base".to_string()], None, false);
        assert_eq!(all.len(), 2);

        let same = store.dependent_modules(&["Base".to_string()], None, true);
        let names: Vec<&str> = same.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["Sibling"]);
    }

    #[test]
    fn test_dependent_modules_kind_filter() {
        let mut store = store_with(vec![module("Base", "r1", &[])]);
        let xml = r#"<ui_module name="BaseTest"><unit_test/><depends><module name="Base"/></depends></ui_module>"#;
        let manifest = Manifest::parse(xml).unwrap();
        let manifest_path = PathBuf::from("/repo/BaseTest/BaseTest.s3mod");
        let mut test_module = Module::from_manifest(manifest, &manifest_path);
        test_module.repository = Some("r1".to_string());
        store.modules.add(test_module);

        let tests =
            store.dependent_modules(&["Base".to_string()], Some(ModuleKind::Test), false);
        let names: Vec<&str> = tests.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["BaseTest"]);
        assert!(store
            .dependent_modules(&["Base".to_string()], Some(ModuleKind::Demo), false)
            .is_empty());
    }

    #[test]
    fn test_state_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("state.json");

        let mut store = Store::new(&state_path);
        store.modules.add(module("A", "r1", &["B"]));
        store
            .repositories
            .insert(SourceRepository::with_name(
                "r1",
                "https://example.com/r1.git",
                dir.path(),
                "rc-24.1100",
            ));
        store.save().unwrap();

        let back = Store::load(&state_path).unwrap();
        assert!(back.modules.contains("A"));
        let repo = back.repositories.get("r1").unwrap();
        assert_eq!(repo.url, "https://example.com/r1.git");
        assert!(!back.is_loaded("r1"));
    }

    #[test]
    fn test_state_file_schema_keys() {
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("state.json");

        let mut store = Store::new(&state_path);
        let mut repo = SourceRepository::with_name(
            "r1",
            "https://example.com/r1.git",
            dir.path(),
            "rc-24.1100",
        );
        repo.head = Some("a1b2c3".to_string());
        repo.load_history.push("rc-24.1100".to_string());
        store.repositories.insert(repo);
        store.save().unwrap();

        let text = std::fs::read_to_string(&state_path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        let r1 = &value["repositories"]["r1"];
        assert_eq!(r1["HEAD"], "a1b2c3");
        assert_eq!(r1["loadHistory"][0], "rc-24.1100");
        assert!(r1["dir"].is_string());
        assert!(value["modules"].is_object());
    }

    proptest! {
        /// Closure of a closure is the closure itself, for arbitrary small
        /// dependency graphs (indices into a fixed module pool).
        #[test]
        fn prop_closure_idempotent(edges in proptest::collection::vec((0usize..8, 0usize..8), 0..24)) {
            let names: Vec<String> = (0..8).map(|i| format!("M{i}")).collect();
            let mut adjacency: Vec<Vec<&str>> = vec![Vec::new(); 8];
            for (from, to) in edges {
                if from != to {
                    let target = names[to].as_str();
                    if !adjacency[from].contains(&target) {
                        adjacency[from].push(target);
                    }
                }
            }
            let mut pool = Vec::new();
            for (i, deps) in adjacency.iter().enumerate() {
                pool.push(module(&names[i], "r1", deps));
            }
            let store = store_with(pool);

            let mut selected: BTreeMap<String, Module> = BTreeMap::new();
            if let Some(m) = store.modules.get("M0") {
                selected.insert(m.name.clone(), m.clone());
            }
            store.dependencies_closure(&mut selected);
            let first: Vec<String> = selected.keys().cloned().collect();
            store.dependencies_closure(&mut selected);
            let second: Vec<String> = selected.keys().cloned().collect();
            prop_assert_eq!(first, second);
        }
    }
}
