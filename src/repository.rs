//! # Source Repository Synchronization
//!
//! [`SourceRepository`] owns everything that touches one version-controlled
//! source tree: bringing the local checkout up to date (clone or update, with
//! delete-and-reclone recovery for corrupt state), deciding *how* a requested
//! branch specification must be applied, applying it, scanning the tree for
//! module manifests, and classifying what changed since a given revision.
//!
//! ## Branch specifications
//!
//! A `required_branch` string is `branch` or `branch:mergeTarget` and falls
//! into one of three classes:
//!
//! - **commit**: not a symbolic ref (no `/`, no `rc-` prefix): checked out
//!   directly, nothing pulled or merged.
//! - **release** (`rc-` prefix): the literal branch may not exist upstream;
//!   it is resolved to the nearest existing release branch of the same major
//!   line. A post-checkout pull is required because a just-created local
//!   tracking ref may be behind its remote counterpart.
//! - **feature** (any other symbolic branch): checked out and merged with
//!   its parent release branch (derived from the first path segment, unless
//!   an explicit merge target was given). If the working tree is already on
//!   the requested branch, or detached, checking out a fresh copy of that
//!   same ref is unsafe; the parent release branch is checked out first, the
//!   stale local ref is deleted, and a pre-checkout pull is flagged.
//!
//! A frozen repository represents a pinned snapshot: every branch class maps
//! to the universal no-op strategy and all mutating git operations return
//! without touching the tree.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use url::Url;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::git::{parse_ls_remote_heads, parse_remote_branches, GitClient, GitOutput, SystemGit};
use crate::manifest::{Manifest, MANIFEST_EXTENSION};
use crate::module::Module;

/// Prefix of release (rc-) branches.
pub const RELEASE_BRANCH_PREFIX: &str = "rc-";

/// Length of the canonical `major.minor` release token, e.g. `22.1000`.
const RELEASE_TOKEN_LEN: usize = 7;

/// Build/output directory names never scanned for manifests.
const SKIP_DIRS: &[&str] = &[".git", "node_modules", "build", "dist", "output"];

/// Marker files that identify a directory as a generated build or cache
/// root; such directories are not descended into.
const GENERATED_ROOT_MARKERS: &[&str] = &["builder-info.json", ".module-cache"];

/// How a required branch specification is applied to a checkout.
///
/// `checkout_by_strategy` applies the fields in a fixed order:
/// pull-before, checkout, pull-after, merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckoutStrategy {
    pub checkout: Option<String>,
    pub merge: Option<String>,
    pub pull_before: bool,
    pub pull_after: bool,
}

impl CheckoutStrategy {
    /// The universal no-op strategy, used for frozen repositories.
    pub fn noop() -> Self {
        Self::default()
    }

    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

/// Branch classification, from the specification string alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    Commit,
    Release,
    Feature,
}

pub fn classify_branch(branch: &str) -> BranchKind {
    if branch.starts_with(RELEASE_BRANCH_PREFIX) {
        BranchKind::Release
    } else if branch.contains('/') {
        BranchKind::Feature
    } else {
        BranchKind::Commit
    }
}

/// A `branch` or `branch:mergeTarget` specification string, split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchSpec {
    pub branch: String,
    pub merge_with: Option<String>,
}

impl BranchSpec {
    pub fn parse(spec: &str) -> BranchSpec {
        match spec.split_once(':') {
            Some((branch, merge)) => BranchSpec {
                branch: branch.to_string(),
                merge_with: Some(merge.to_string()),
            },
            None => BranchSpec {
                branch: spec.to_string(),
                merge_with: None,
            },
        }
    }
}

/// Parent release branch of a feature branch: the first path segment, when
/// it is a canonical `major.minor` token, prefixed with `rc-`.
pub fn parent_release_branch(branch: &str) -> Option<String> {
    let (first, _) = branch.split_once('/')?;
    if first.len() == RELEASE_TOKEN_LEN && first.contains('.') {
        Some(format!("{RELEASE_BRANCH_PREFIX}{first}"))
    } else {
        None
    }
}

/// `rc-22.1000` -> `(22, 1000)`.
fn release_version(branch: &str) -> Option<(u64, u64)> {
    let token = branch.strip_prefix(RELEASE_BRANCH_PREFIX)?;
    let (major, minor) = token.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// Resolve a requested release branch against the remote branch list.
///
/// An exact match wins. Otherwise the candidates are the remote release
/// branches of the same major line (release minors are hundreds-granularity
/// tokens), partitioned numerically above and below the requested trailing
/// number; the nearest candidate is chosen, and an equal distance resolves
/// to the next-higher candidate. Returns `None` when nothing matches.
pub fn nearest_release_branch(requested: &str, remotes: &[String]) -> Option<String> {
    if remotes.iter().any(|r| r == requested) {
        return Some(requested.to_string());
    }
    let (major, minor) = release_version(requested)?;

    let mut below: Option<u64> = None;
    let mut above: Option<u64> = None;
    for remote in remotes {
        let Some((m, n)) = release_version(remote) else {
            continue;
        };
        if m != major {
            continue;
        }
        if n < minor {
            below = Some(below.map_or(n, |b| b.max(n)));
        } else {
            above = Some(above.map_or(n, |a| a.min(n)));
        }
    }

    let pick = match (below, above) {
        (None, None) => return None,
        (Some(b), None) => b,
        (None, Some(a)) => a,
        (Some(b), Some(a)) => {
            if minor - b < a - minor {
                b
            } else {
                a
            }
        }
    };
    Some(format!("{RELEASE_BRANCH_PREFIX}{major}.{pick}"))
}

/// Outcome of deleting a local branch ref. The already-absent case is the
/// expected one during feature-branch cleanup and is not reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchDelete {
    Deleted,
    AlreadyAbsent,
}

/// Files changed and deleted between two revisions, as absolute paths rooted
/// at the repository directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangedFiles {
    pub changed: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
}

/// Classify `diff --name-status` records: a delete record marks the old path
/// deleted; a rename record marks the old path deleted and the new path
/// changed; any other record marks its path changed.
pub fn classify_name_status(root: &Path, text: &str) -> ChangedFiles {
    let mut files = ChangedFiles::default();
    for line in text.lines() {
        let mut parts = line.split('\t');
        let status = parts.next().unwrap_or("").trim();
        match status.chars().next() {
            Some('D') => {
                if let Some(old) = parts.next() {
                    files.deleted.push(root.join(old));
                }
            }
            Some('R') => {
                if let Some(old) = parts.next() {
                    files.deleted.push(root.join(old));
                }
                if let Some(new) = parts.next() {
                    files.changed.push(root.join(new));
                }
            }
            Some(_) => {
                if let Some(path) = parts.next() {
                    files.changed.push(root.join(path));
                }
            }
            None => {}
        }
    }
    files
}

/// Repository name derived from a remote URL: the last path segment with a
/// `.git` suffix stripped. Handles both proper URLs and scp-style remotes
/// (`git@host:org/repo.git`).
pub fn name_from_url(url: &str) -> Option<String> {
    let tail = match Url::parse(url) {
        Ok(parsed) => parsed
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
            .map(str::to_string)?,
        Err(_) => url
            .rsplit(|c| c == '/' || c == ':')
            .next()
            .map(str::to_string)?,
    };
    let name = tail.strip_suffix(".git").unwrap_or(&tail);
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// One version-controlled source tree.
#[derive(Debug)]
pub struct SourceRepository {
    pub name: String,
    pub url: String,
    pub parent_dir: PathBuf,
    /// Local checkout directory.
    pub path: PathBuf,
    /// `branch` or `branch:mergeTarget` specification.
    pub required_branch: String,
    /// Resolved revision; `None` until the first sync.
    pub head: Option<String>,
    /// Whether an on-disk clone exists.
    pub initialized: bool,
    /// Pinned snapshot: all mutating git operations are no-ops.
    pub frozen: bool,
    /// Clone with `--depth 1`.
    pub shallow: bool,
    /// Branch specs synchronized over this repository's lifetime.
    pub load_history: Vec<String>,
    git: Arc<dyn GitClient>,
    discovered: Option<Vec<Module>>,
}

impl SourceRepository {
    /// Repository with a name derived from the remote URL.
    pub fn new(url: &str, parent_dir: &Path, required_branch: &str) -> SourceRepository {
        let name = name_from_url(url).unwrap_or_else(|| url.to_string());
        Self::with_name(&name, url, parent_dir, required_branch)
    }

    pub fn with_name(
        name: &str,
        url: &str,
        parent_dir: &Path,
        required_branch: &str,
    ) -> SourceRepository {
        SourceRepository {
            name: name.to_string(),
            url: url.to_string(),
            parent_dir: parent_dir.to_path_buf(),
            path: parent_dir.join(name),
            required_branch: required_branch.to_string(),
            head: None,
            initialized: false,
            frozen: false,
            shallow: false,
            load_history: Vec::new(),
            git: Arc::new(SystemGit),
            discovered: None,
        }
    }

    pub fn frozen(mut self, frozen: bool) -> Self {
        self.frozen = frozen;
        self
    }

    pub fn shallow(mut self, shallow: bool) -> Self {
        self.shallow = shallow;
        self
    }

    /// Swap the git backend; used by tests to script subprocess answers.
    pub fn with_git(mut self, git: Arc<dyn GitClient>) -> Self {
        self.git = git;
        self
    }

    /// Take over the requested branch and flags from a newer spec for the
    /// same repository, keeping accumulated state (HEAD, load history).
    pub fn refresh_from(&mut self, spec: &SourceRepository) {
        self.required_branch = spec.required_branch.clone();
        self.frozen = spec.frozen;
        self.shallow = spec.shallow;
        self.parent_dir = spec.parent_dir.clone();
        self.path = spec.path.clone();
        if self.url.trim().is_empty() {
            self.url = spec.url.clone();
        }
    }

    fn run(&self, args: &[&str]) -> Result<GitOutput> {
        self.git.run(&self.path, args)
    }

    /// Run a git command and wrap a non-zero exit with repository and
    /// command context.
    fn run_ok(&self, args: &[&str]) -> Result<GitOutput> {
        let out = self.run(args)?;
        if out.success {
            Ok(out)
        } else {
            Err(Error::Git {
                name: self.name.clone(),
                command: args.join(" "),
                stderr: out.stderr.trim().to_string(),
            })
        }
    }

    /// Bring the local checkout into existence or up to date.
    ///
    /// An existing checkout is updated; a missing one is cloned. If the
    /// update fails for any reason other than a merge conflict or a missing
    /// remote, the local state is assumed corrupt: the directory is deleted
    /// and one full fresh clone is attempted, with no further retry.
    pub fn init(&mut self) -> Result<()> {
        if self.frozen {
            if !self.path.exists() {
                return Err(Error::Config(format!(
                    "frozen repository {} has no checkout at {}",
                    self.name,
                    self.path.display()
                )));
            }
            self.initialized = true;
            return Ok(());
        }

        if self.path.join(".git").exists() {
            if let Err(e) = self.update() {
                if e.is_merge_conflict() || matches!(e, Error::NoRemoteConfigured { .. }) {
                    return Err(e);
                }
                warn!("update of {} failed ({}); recloning", self.name, e);
                fs::remove_dir_all(&self.path)?;
                self.clone_fresh()?;
            }
        } else {
            self.clone_fresh()?;
        }
        self.initialized = true;
        Ok(())
    }

    /// Discard local damage and bring all remote refs up to date.
    pub fn update(&self) -> Result<()> {
        if self.frozen {
            return Ok(());
        }
        let status = self.run_ok(&["status", "--porcelain"])?;
        if !status.stdout.trim().is_empty() {
            info!("discarding local changes in {}", self.name);
            self.run_ok(&["reset", "--hard"])?;
            self.run_ok(&["clean", "-fdx"])?;
        }
        self.ensure_remote()?;
        let out = self.run(&["fetch", "--all", "--prune"])?;
        if !out.success {
            return Err(Error::Fetch {
                name: self.name.clone(),
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    fn clone_fresh(&self) -> Result<()> {
        if self.frozen {
            return Ok(());
        }
        if self.url.trim().is_empty() {
            return Err(Error::NoRemoteConfigured {
                name: self.name.clone(),
            });
        }
        fs::create_dir_all(&self.parent_dir)?;
        let dir_name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.name);
        let mut args: Vec<&str> = vec!["clone"];
        if self.shallow {
            args.extend(["--depth", "1"]);
        }
        args.push(&self.url);
        args.push(dir_name);

        info!("cloning {} from {}", self.name, self.url);
        let out = self.git.run(&self.parent_dir, &args)?;
        if !out.success {
            return Err(Error::Clone {
                name: self.name.clone(),
                url: self.url.clone(),
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    /// A mutating network operation needs either a configured URL or a
    /// checkout that already knows its remote.
    fn ensure_remote(&self) -> Result<()> {
        if !self.url.trim().is_empty() {
            return Ok(());
        }
        if self.path.join(".git").exists() {
            let out = self.run(&["config", "--get", "remote.origin.url"])?;
            if out.success && !out.line().is_empty() {
                return Ok(());
            }
        }
        Err(Error::NoRemoteConfigured {
            name: self.name.clone(),
        })
    }

    pub fn pull(&self) -> Result<()> {
        if self.frozen {
            return Ok(());
        }
        self.ensure_remote()?;
        let out = self.run(&["pull"])?;
        if !out.success {
            return Err(Error::Fetch {
                name: self.name.clone(),
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    pub fn checkout(&self, target: &str) -> Result<()> {
        if self.frozen {
            return Ok(());
        }
        let out = self.run(&["checkout", "-f", target])?;
        if !out.success {
            return Err(Error::Checkout {
                name: self.name.clone(),
                target: target.to_string(),
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    /// Merge `target` into the current branch. A failure aborts the merge
    /// before the error is raised, so the working tree is left clean
    /// whatever the caller decides to do next.
    pub fn merge(&self, target: &str) -> Result<()> {
        if self.frozen {
            return Ok(());
        }
        let out = self.run(&["merge", target])?;
        if out.success {
            return Ok(());
        }
        if let Err(abort) = self.run(&["merge", "--abort"]) {
            warn!("merge --abort failed in {}: {}", self.name, abort);
        }
        Err(Error::MergeConflict {
            name: self.name.clone(),
            target: target.to_string(),
        })
    }

    /// Delete a local branch ref. Tri-state: deleted, already absent
    /// (expected during cleanup), or a fatal git failure.
    pub fn delete_local_branch(&self, branch: &str) -> Result<BranchDelete> {
        if self.frozen {
            return Ok(BranchDelete::AlreadyAbsent);
        }
        let out = self.run(&["branch", "-D", branch])?;
        if out.success {
            return Ok(BranchDelete::Deleted);
        }
        if out.stderr.contains("not found") {
            return Ok(BranchDelete::AlreadyAbsent);
        }
        Err(Error::Git {
            name: self.name.clone(),
            command: format!("branch -D {branch}"),
            stderr: out.stderr.trim().to_string(),
        })
    }

    /// Current branch name, or `None` when HEAD is detached.
    pub fn current_branch(&self) -> Result<Option<String>> {
        let out = self.run_ok(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.line();
        if name.is_empty() || name == "HEAD" {
            Ok(None)
        } else {
            Ok(Some(name.to_string()))
        }
    }

    /// Remote branch names, as of the last fetch. Falls back to asking the
    /// remote directly when the checkout has no remote-tracking refs yet.
    pub fn remote_branches(&self) -> Result<Vec<String>> {
        let out = self.run_ok(&["branch", "-r"])?;
        let branches = parse_remote_branches(&out.stdout);
        if !branches.is_empty() || self.url.trim().is_empty() {
            return Ok(branches);
        }
        let out = self.run_ok(&["ls-remote", "--heads", &self.url])?;
        Ok(parse_ls_remote_heads(&out.stdout))
    }

    /// Re-resolve and store the current HEAD revision.
    pub fn resolve_head(&mut self) -> Result<()> {
        let out = self.run_ok(&["rev-parse", "HEAD"])?;
        self.head = Some(out.line().to_string());
        Ok(())
    }

    /// Decide how the required branch specification must be applied.
    ///
    /// Strategy detection inspects the remote branch list and the current
    /// branch, so it must run after the repository has been fetched and, across
    /// repositories, sequentially (see the orchestrator). For feature
    /// branches it also performs the detour-and-cleanup side effects
    /// described in the module docs.
    pub fn detect_checkout_strategy(&self) -> Result<CheckoutStrategy> {
        if self.frozen {
            return Ok(CheckoutStrategy::noop());
        }
        let spec = BranchSpec::parse(&self.required_branch);
        match classify_branch(&spec.branch) {
            BranchKind::Commit => Ok(CheckoutStrategy {
                checkout: Some(spec.branch),
                ..Default::default()
            }),
            BranchKind::Release => {
                let remotes = self.remote_branches()?;
                match nearest_release_branch(&spec.branch, &remotes) {
                    Some(resolved) => {
                        if resolved != spec.branch {
                            info!(
                                "{}: release branch {} resolved to {}",
                                self.name, spec.branch, resolved
                            );
                        }
                        // A just-created local tracking ref may be behind its
                        // remote counterpart.
                        Ok(CheckoutStrategy {
                            checkout: Some(resolved),
                            pull_after: true,
                            ..Default::default()
                        })
                    }
                    None => {
                        let mask = release_version(&spec.branch)
                            .map(|(major, _)| format!("{RELEASE_BRANCH_PREFIX}{major}."))
                            .unwrap_or_else(|| spec.branch.clone());
                        Err(Error::NoMatchingBranch {
                            name: self.name.clone(),
                            mask,
                        })
                    }
                }
            }
            BranchKind::Feature => {
                let merge = spec
                    .merge_with
                    .clone()
                    .or_else(|| parent_release_branch(&spec.branch));
                let current = self.current_branch()?;
                // Checking out a fresh copy of the ref we are already on (or
                // sitting detached on) is unsafe; detour through the parent
                // release branch and drop the stale local ref.
                let needs_detour = match &current {
                    None => true,
                    Some(c) => *c == spec.branch,
                };
                let mut pull_before = false;
                if needs_detour {
                    if let Some(parent) = &merge {
                        self.checkout(parent)?;
                    }
                    match self.delete_local_branch(&spec.branch)? {
                        BranchDelete::Deleted => {
                            debug!("{}: dropped stale local branch {}", self.name, spec.branch)
                        }
                        BranchDelete::AlreadyAbsent => {}
                    }
                    pull_before = true;
                }
                Ok(CheckoutStrategy {
                    checkout: Some(spec.branch),
                    merge,
                    pull_before,
                    pull_after: false,
                })
            }
        }
    }

    /// Apply a strategy in the fixed order: pull-before, checkout,
    /// pull-after, merge.
    pub fn checkout_by_strategy(&self, strategy: &CheckoutStrategy) -> Result<()> {
        if strategy.pull_before {
            self.pull()?;
        }
        if let Some(target) = &strategy.checkout {
            self.checkout(target)?;
        }
        if strategy.pull_after {
            self.pull()?;
        }
        if let Some(target) = &strategy.merge {
            self.merge(target)?;
        }
        Ok(())
    }

    /// Modules discovered in this repository's tree, cached for the
    /// repository's lifetime.
    pub fn modules(&mut self) -> Result<&[Module]> {
        if self.discovered.is_none() {
            self.discovered = Some(self.discover_modules()?);
        }
        Ok(self.discovered.as_deref().unwrap_or(&[]))
    }

    /// Drop the discovery cache, e.g. after the checkout moved.
    pub fn invalidate_modules(&mut self) {
        self.discovered = None;
    }

    fn discover_modules(&self) -> Result<Vec<Module>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut modules = Vec::new();
        let walker = WalkDir::new(&self.path).into_iter().filter_entry(|entry| {
            if !entry.file_type().is_dir() {
                return true;
            }
            if entry
                .file_name()
                .to_str()
                .map_or(false, |n| SKIP_DIRS.contains(&n))
            {
                return false;
            }
            !GENERATED_ROOT_MARKERS
                .iter()
                .any(|marker| entry.path().join(marker).exists())
        });
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(
                        "skipping unreadable entry under {}: {}",
                        self.path.display(),
                        e
                    );
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.path().extension().and_then(|x| x.to_str()) != Some(MANIFEST_EXTENSION) {
                continue;
            }
            let manifest = Manifest::from_file(entry.path())?;
            let mut module = Module::from_manifest(manifest, entry.path());
            module.repository = Some(self.name.clone());
            debug!("{}: discovered module {}", self.name, module.name);
            modules.push(module);
        }
        Ok(modules)
    }

    /// Name-status diff between `revision` and HEAD, classified.
    pub fn changed_files(&self, revision: &str) -> Result<ChangedFiles> {
        let out = self.run_ok(&["diff", "--name-status", revision, "HEAD"])?;
        Ok(classify_name_status(&self.path, &out.stdout))
    }
}
