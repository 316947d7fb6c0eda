//! # Git Subprocess Layer
//!
//! All git access goes through the [`GitClient`] trait. The production
//! implementation, [`SystemGit`], shells out to the system `git` command,
//! which automatically handles:
//! - SSH keys from ~/.ssh/
//! - Git credential helpers
//! - Personal access tokens
//! - Any authentication configured in ~/.gitconfig
//!
//! The trait exists so the synchronization state machine can be exercised in
//! tests with a scripted implementation instead of a real working tree.
//!
//! Commands run with the working directory set to the repository's local
//! path; the one exception is `clone`, which the caller runs from the parent
//! directory. Output is line-oriented text; the parsing helpers in this
//! module deal with the formats that need interpretation (remote branch
//! listings, name-status diffs are handled by the repository module).

use std::path::Path;
use std::process::Command;

use log::debug;

use crate::error::Result;

/// Captured result of one git invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    /// Whether the process exited successfully.
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    /// Convenience constructor for successful output, used by tests.
    pub fn ok(stdout: &str) -> Self {
        Self {
            success: true,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    /// Convenience constructor for failed output, used by tests.
    pub fn err(stderr: &str) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    /// First line of stdout, trimmed. Git prints single-value answers
    /// (`rev-parse`, `config --get`) followed by a newline.
    pub fn line(&self) -> &str {
        self.stdout.lines().next().unwrap_or("").trim()
    }
}

/// Trait for git subprocess invocations - allows scripting in tests.
///
/// An `Err` from `run` means the process could not be spawned at all;
/// a command that ran and exited non-zero is an `Ok` with
/// `success == false`, so callers can inspect stderr before deciding how
/// to classify the failure.
pub trait GitClient: Send + Sync + std::fmt::Debug {
    fn run(&self, cwd: &Path, args: &[&str]) -> Result<GitOutput>;
}

/// The default [`GitClient`] backed by the system `git` binary.
#[derive(Debug, Default)]
pub struct SystemGit;

impl GitClient for SystemGit {
    fn run(&self, cwd: &Path, args: &[&str]) -> Result<GitOutput> {
        debug!("git {} (in {})", args.join(" "), cwd.display());
        let output = Command::new("git").args(args).current_dir(cwd).output()?;
        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Parse `git branch -r` output into plain branch names.
///
/// Lines look like `  origin/rc-22.1000`; the remote prefix is stripped and
/// symbolic entries (`origin/HEAD -> origin/main`) are skipped.
pub fn parse_remote_branches(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.contains("->"))
        .map(|line| match line.split_once('/') {
            Some((_remote, branch)) => branch.to_string(),
            None => line.to_string(),
        })
        .collect()
}

/// Parse `git ls-remote --heads` output into plain branch names.
///
/// Each line is `<hash>\trefs/heads/<branch>`.
pub fn parse_ls_remote_heads(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| line.split('\t').nth(1))
        .filter_map(|r| r.strip_prefix("refs/heads/"))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_remote_branches() {
        let text = "  origin/HEAD -> origin/main\n  origin/main\n  origin/rc-22.1000\n  origin/22.1000/feature\n";
        let branches = parse_remote_branches(text);
        assert_eq!(branches, vec!["main", "rc-22.1000", "22.1000/feature"]);
    }

    #[test]
    fn test_parse_remote_branches_empty() {
        assert!(parse_remote_branches("").is_empty());
    }

    #[test]
    fn test_parse_ls_remote_heads() {
        let text = "a1b2c3\trefs/heads/main\nd4e5f6\trefs/heads/rc-22.1100\n0000\trefs/pull/1/head\n";
        let heads = parse_ls_remote_heads(text);
        assert_eq!(heads, vec!["main", "rc-22.1100"]);
    }

    #[test]
    fn test_output_line() {
        let out = GitOutput::ok("a1b2c3d4\n");
        assert_eq!(out.line(), "a1b2c3d4");
        assert_eq!(GitOutput::ok("").line(), "");
    }
}
