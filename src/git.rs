//! Git checkpoint, diff and rollback against the target project.
//!
//! Every operation returns an explicit `Result`. Callers in the engine treat
//! errors as "no checkpoint available" and keep going.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use crate::error::{Error, Result};

/// Runs git commands in one repository.
#[derive(Debug, Clone)]
pub struct GitManager {
    repo_path: PathBuf,
}

impl GitManager {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
        }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    fn git(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .current_dir(&self.repo_path)
            .args(args)
            .output()
            .map_err(|e| Error::Git(format!("failed to run git {}: {}", args.join(" "), e)))
    }

    /// Runs git and fails on a non-zero exit, returning trimmed stdout.
    fn git_checked(&self, args: &[&str]) -> Result<String> {
        let output = self.git(args)?;
        if !output.status.success() {
            return Err(Error::Git(format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Whether the path is inside a git work tree.
    pub fn is_repo(&self) -> bool {
        self.git(&["rev-parse", "--is-inside-work-tree"])
            .map(|o| o.status.success() && String::from_utf8_lossy(&o.stdout).trim() == "true")
            .unwrap_or(false)
    }

    /// Current HEAD commit, or `None` in a repository without commits.
    pub fn head(&self) -> Result<Option<String>> {
        let output = self.git(&["rev-parse", "--verify", "-q", "HEAD"])?;
        if output.status.success() {
            Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
        } else if self.is_repo() {
            Ok(None)
        } else {
            Err(Error::Git(format!(
                "{} is not a git repository",
                self.repo_path.display()
            )))
        }
    }

    /// Commits all working-tree changes, if any, and returns HEAD.
    ///
    /// With a clean tree this is a no-op that returns the current HEAD.
    pub fn create_checkpoint(&self, label: &str) -> Result<Option<String>> {
        let status = self.git_checked(&["status", "--porcelain"])?;
        if status.is_empty() {
            tracing::debug!(label = %label, "working tree clean, reusing HEAD as checkpoint");
            return self.head();
        }

        self.git_checked(&["add", "-A"])?;
        let message = format!("autodev checkpoint: {}", label);
        self.git_checked(&["commit", "--no-verify", "-m", &message])?;

        let head = self.head()?;
        tracing::info!(label = %label, commit = ?head, "created git checkpoint");
        Ok(head)
    }

    /// Hard-resets to `commit_ref` and removes untracked files.
    pub fn rollback(&self, commit_ref: &str) -> Result<()> {
        self.git_checked(&["reset", "--hard", commit_ref])?;
        self.git_checked(&["clean", "-fd"])?;
        tracing::info!(commit = %commit_ref, "rolled back working tree");
        Ok(())
    }

    /// Diff between `from_ref` and HEAD, followed by uncommitted changes.
    pub fn get_diff(&self, from_ref: &str) -> Result<String> {
        let committed = self.git_checked(&["diff", from_ref, "HEAD"])?;
        let working = self.git_checked(&["diff", "HEAD"])?;

        Ok(match (committed.is_empty(), working.is_empty()) {
            (true, _) => working,
            (false, true) => committed,
            (false, false) => format!("{}\n{}", committed, working),
        })
    }

    /// Checks out `name`, creating it from the current HEAD when missing.
    pub fn ensure_branch(&self, name: &str) -> Result<()> {
        let current = self.git_checked(&["rev-parse", "--abbrev-ref", "HEAD"]).ok();
        if current.as_deref() == Some(name) {
            return Ok(());
        }

        let exists = self
            .git(&["rev-parse", "--verify", "-q", &format!("refs/heads/{}", name)])?
            .status
            .success();

        if exists {
            self.git_checked(&["checkout", name])?;
        } else {
            self.git_checked(&["checkout", "-b", name])?;
        }
        tracing::info!(branch = %name, created = !exists, "switched branch");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    /// Helper to create a temp git repo with one commit.
    fn create_temp_git_repo() -> TempDir {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let run = |args: &[&str]| {
            Command::new("git")
                .args(args)
                .current_dir(temp_dir.path())
                .output()
                .expect("failed to run git");
        };

        run(&["init"]);
        run(&["config", "user.email", "test@test.com"]);
        run(&["config", "user.name", "Test User"]);
        fs::write(temp_dir.path().join("README.md"), "# Test\n").expect("failed to write file");
        run(&["add", "."]);
        run(&["commit", "-m", "Initial commit"]);

        temp_dir
    }

    #[test]
    fn checkpoint_without_changes_returns_head() {
        let repo = create_temp_git_repo();
        let git = GitManager::new(repo.path());
        let head = git.head().unwrap();

        assert!(head.is_some());
        assert_eq!(git.create_checkpoint("noop").unwrap(), head);
    }

    #[test]
    fn checkpoint_commits_changes() {
        let repo = create_temp_git_repo();
        let git = GitManager::new(repo.path());
        let before = git.head().unwrap();

        fs::write(repo.path().join("new.txt"), "content").unwrap();
        let after = git.create_checkpoint("cycle 1").unwrap();

        assert!(after.is_some());
        assert_ne!(after, before);
        let diff = git.get_diff(before.as_deref().unwrap()).unwrap();
        assert!(diff.contains("new.txt"));
    }

    #[test]
    fn rollback_discards_changes_and_untracked_files() {
        let repo = create_temp_git_repo();
        let git = GitManager::new(repo.path());
        let checkpoint = git.create_checkpoint("before").unwrap().unwrap();

        fs::write(repo.path().join("README.md"), "changed").unwrap();
        fs::write(repo.path().join("stray.txt"), "x").unwrap();
        git.rollback(&checkpoint).unwrap();

        assert_eq!(fs::read_to_string(repo.path().join("README.md")).unwrap(), "# Test\n");
        assert!(!repo.path().join("stray.txt").exists());
    }

    #[test]
    fn diff_includes_uncommitted_changes() {
        let repo = create_temp_git_repo();
        let git = GitManager::new(repo.path());
        let head = git.head().unwrap().unwrap();

        fs::write(repo.path().join("README.md"), "# Edited\n").unwrap();
        let diff = git.get_diff(&head).unwrap();
        assert!(diff.contains("Edited"));
    }

    #[test]
    fn ensure_branch_creates_then_reuses() {
        let repo = create_temp_git_repo();
        let git = GitManager::new(repo.path());

        git.ensure_branch("autodev").unwrap();
        git.ensure_branch("autodev").unwrap();
        let branch = git.git_checked(&["rev-parse", "--abbrev-ref", "HEAD"]).unwrap();
        assert_eq!(branch, "autodev");
    }

    #[test]
    fn non_repo_reports_errors() {
        let dir = TempDir::new().unwrap();
        let git = GitManager::new(dir.path());

        assert!(!git.is_repo());
        assert!(git.head().is_err());
        assert!(git.create_checkpoint("x").is_err());
        assert!(git.rollback("HEAD").is_err());
    }

    #[test]
    fn bad_ref_rollback_fails() {
        let repo = create_temp_git_repo();
        let git = GitManager::new(repo.path());
        assert!(git.rollback("does-not-exist").is_err());
    }
}
