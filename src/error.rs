//! # Error Handling
//!
//! Centralized error type for all synchronization operations, built with
//! `thiserror`. Every git subprocess failure is wrapped with the repository
//! name and the command that produced it before it propagates, so a failure
//! deep inside a pooled worker still reads as "which repository, doing what".
//!
//! Two variants deserve special mention:
//!
//! - [`Error::MergeConflict`] is distinguished from generic git failures so
//!   callers can react to it specifically (the repository has already run
//!   `merge --abort` by the time this error is raised, leaving the working
//!   tree clean).
//! - [`Error::NoMatchingBranch`] is raised when a release-branch mask matches
//!   zero remote branches, which usually means the requested release line
//!   simply does not exist upstream yet.
//!
//! [`Error::code`] exposes a stable marker string per variant for callers
//! that match on error classes across a process boundary (e.g. log scrapers).

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for modsync operations
#[derive(Error, Debug)]
pub enum Error {
    /// Cloning a repository from its remote failed.
    #[error("failed to clone {name} from {url}: {stderr}")]
    Clone {
        name: String,
        url: String,
        stderr: String,
    },

    /// Fetching or pulling new revisions for an existing checkout failed.
    #[error("failed to fetch {name}: {stderr}")]
    Fetch { name: String, stderr: String },

    /// Checking out a ref failed.
    #[error("checkout of {target} failed in {name}: {stderr}")]
    Checkout {
        name: String,
        target: String,
        stderr: String,
    },

    /// A merge hit conflicts. The merge has already been aborted; the
    /// working tree is clean.
    #[error("merge of {target} into {name} conflicted")]
    MergeConflict { name: String, target: String },

    /// A mutating network operation was attempted on a repository that has
    /// no usable remote.
    #[error("no remote configured for repository {name}")]
    NoRemoteConfigured { name: String },

    /// A release-branch mask matched zero remote branches.
    #[error("no remote branch matching {mask} in repository {name}")]
    NoMatchingBranch { name: String, mask: String },

    /// A module manifest could not be parsed.
    #[error("failed to parse manifest {path}: {message}")]
    ManifestParse { path: PathBuf, message: String },

    /// Any other git command failure, wrapped with repository and command
    /// context.
    #[error("git {command} failed in {name}: {stderr}")]
    Git {
        name: String,
        command: String,
        stderr: String,
    },

    /// A configuration problem: malformed config file, unknown repository
    /// name, a module without an owning repository.
    #[error("configuration error: {0}")]
    Config(String),

    /// An I/O error, wrapped from `std::io::Error`.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON (de)serialization error from the persisted state cache.
    #[error("state serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// A YAML parsing error from the configuration file.
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Stable marker code for each error class.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Clone { .. } => "CLONE_FAILED",
            Error::Fetch { .. } => "FETCH_FAILED",
            Error::Checkout { .. } => "CHECKOUT_FAILED",
            Error::MergeConflict { .. } => "MERGE_CONFLICT",
            Error::NoRemoteConfigured { .. } => "NO_REMOTE",
            Error::NoMatchingBranch { .. } => "NO_MATCHING_BRANCH",
            Error::ManifestParse { .. } => "MANIFEST_PARSE",
            Error::Git { .. } => "GIT_COMMAND",
            Error::Config(_) => "CONFIG",
            Error::Io(_) => "IO",
            Error::Json(_) => "JSON",
            Error::Yaml(_) => "YAML",
        }
    }

    /// True for the distinguished merge-conflict class.
    pub fn is_merge_conflict(&self) -> bool {
        matches!(self, Error::MergeConflict { .. })
    }
}

/// A convenient type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_repository_context() {
        let error = Error::Clone {
            name: "ws-core".to_string(),
            url: "git@example.com:platform/ws-core.git".to_string(),
            stderr: "Permission denied".to_string(),
        };
        let display = format!("{}", error);
        assert!(display.contains("ws-core"));
        assert!(display.contains("Permission denied"));
    }

    #[test]
    fn test_merge_conflict_is_distinguished() {
        let conflict = Error::MergeConflict {
            name: "ws-core".to_string(),
            target: "rc-22.2000".to_string(),
        };
        assert!(conflict.is_merge_conflict());
        assert_eq!(conflict.code(), "MERGE_CONFLICT");

        let generic = Error::Git {
            name: "ws-core".to_string(),
            command: "merge rc-22.2000".to_string(),
            stderr: "fatal: not a git repository".to_string(),
        };
        assert!(!generic.is_merge_conflict());
        assert_eq!(generic.code(), "GIT_COMMAND");
    }

    #[test]
    fn test_from_io_error() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let error: Error = io_error.into();
        assert_eq!(error.code(), "IO");
        assert!(error.to_string().contains("missing"));
    }

    #[test]
    fn test_no_matching_branch_names_the_mask() {
        let error = Error::NoMatchingBranch {
            name: "ws-core".to_string(),
            mask: "rc-22.".to_string(),
        };
        assert!(error.to_string().contains("rc-22."));
    }
}
