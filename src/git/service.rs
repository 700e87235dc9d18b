//! Thin wrapper over `git` invocations (§4.1).
//!
//! Every operation takes a worktree path and shells out through the shared
//! `CommandExecutor` seam so retry, logging, and test doubles can be applied
//! uniformly across the crate.

use std::sync::Arc;

use regex::Regex;

use crate::errors::GitError;
use crate::external::command::{CommandError, CommandExecutor};
use crate::types::GitStatus;

pub struct GitService {
    executor: Arc<dyn CommandExecutor>,
}

fn is_forty_hex(s: &str) -> bool {
    s.len() == 40 && s.chars().all(|c| c.is_ascii_hexdigit())
}

impl GitService {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    async fn run(&self, path: &str, args: &[&str]) -> Result<crate::external::command::CommandOutput, GitError> {
        self.executor
            .execute("git", args, Some(path))
            .await
            .map_err(GitError::from)
    }

    /// Returns the 40-hex SHA of `HEAD`, or `None` if `path` is not a valid
    /// repo or has no commits yet. Never errors on a missing repo.
    pub async fn get_current_commit(&self, path: &str) -> Option<String> {
        let output = self.run(path, &["rev-parse", "HEAD"]).await.ok()?;
        if !output.success() {
            return None;
        }
        let sha = output.stdout.trim().to_string();
        is_forty_hex(&sha).then_some(sha)
    }

    pub async fn has_uncommitted_changes(&self, path: &str) -> bool {
        match self.run(path, &["status", "--porcelain"]).await {
            Ok(output) => output.success() && !output.stdout.trim().is_empty(),
            Err(_) => false,
        }
    }

    /// Stages (if requested) and commits. Returns `None` without error if
    /// there is nothing to commit.
    pub async fn commit(
        &self,
        path: &str,
        message: &str,
        no_verify: bool,
        stage_all: bool,
    ) -> Result<Option<String>, GitError> {
        if stage_all {
            self.run(path, &["add", "-A"]).await?;
        }

        if !self.has_uncommitted_changes(path).await {
            return Ok(None);
        }

        let mut args = vec!["commit", "-m", message];
        if no_verify {
            args.push("--no-verify");
        }
        let output = self.run(path, &args).await?;
        if !output.success() {
            if output.stderr.contains("nothing to commit") {
                return Ok(None);
            }
            return Err(GitError::CommandFailed(output.stderr));
        }

        Ok(self.get_current_commit(path).await)
    }

    /// True iff the commit's subject or body contains `issue_id` as a
    /// case-insensitive substring.
    pub async fn verify_commit_message_contains_issue_id(
        &self,
        path: &str,
        sha: &str,
        issue_id: &str,
    ) -> bool {
        let Ok(output) = self.run(path, &["show", "-s", "--format=%B", sha]).await else {
            return false;
        };
        if !output.success() {
            return false;
        }
        output
            .stdout
            .to_lowercase()
            .contains(&issue_id.to_lowercase())
    }

    /// Fetch and fast-forward `branch` from `origin`; failure is logged and
    /// swallowed, never fatal to callers.
    pub async fn sync_to_remote(&self, path: &str, branch: &str) {
        if let Err(e) = self.run(path, &["fetch", "origin", branch]).await {
            tracing::warn!(error = %e, "git fetch failed during sync_to_remote");
            return;
        }
        let remote_ref = format!("origin/{branch}");
        if let Err(e) = self
            .run(path, &["merge", "--ff-only", &remote_ref])
            .await
        {
            tracing::warn!(error = %e, "git merge --ff-only failed during sync_to_remote");
        }
    }

    /// Push current HEAD to `origin/{branch}`. Failure is reported via the
    /// returned `Result` but never rolls back the local commit.
    pub async fn push_to_ref(&self, path: &str, branch: &str) -> Result<(), GitError> {
        let refspec = format!("HEAD:refs/heads/{branch}");
        let output = self.run(path, &["push", "origin", &refspec]).await?;
        if !output.success() {
            return Err(GitError::CommandFailed(output.stderr));
        }
        Ok(())
    }

    pub async fn get_status(&self, path: &str) -> Result<GitStatus, GitError> {
        let status_output = self.run(path, &["status", "--porcelain"]).await?;
        let branch_output = self.run(path, &["branch", "--show-current"]).await.ok();
        let commit = self.get_current_commit(path).await;

        let mut modified = Vec::new();
        let mut added = Vec::new();
        let mut deleted = Vec::new();
        let mut untracked = Vec::new();

        for line in status_output.stdout.lines() {
            if line.len() < 3 {
                continue;
            }
            let (index_status, worktree_status) = (line.as_bytes()[0], line.as_bytes()[1]);
            let filename = line[3..].to_string();
            match (index_status, worktree_status) {
                (b'?', b'?') => untracked.push(filename),
                (b'A', _) => added.push(filename),
                (b'D', _) | (_, b'D') => deleted.push(filename),
                _ => modified.push(filename),
            }
        }

        let is_clean = modified.is_empty() && added.is_empty() && deleted.is_empty() && untracked.is_empty();
        let branch = branch_output
            .filter(|o| o.success())
            .map(|o| o.stdout.trim().to_string())
            .filter(|b| !b.is_empty());

        Ok(GitStatus {
            is_clean,
            modified,
            added,
            deleted,
            untracked,
            branch,
            commit,
        })
    }

    /// Extract a 40-hex or 7-hex commit SHA from tool-call / bash output
    /// (§4.6 step 5).
    pub fn extract_sha_from_output(output: &str) -> Option<String> {
        let re = Regex::new(r"\b[0-9a-f]{40}\b|\b[0-9a-f]{7}\b").expect("static regex is valid");
        re.find(output).map(|m| m.as_str().to_string())
    }
}

impl From<CommandError> for GitError {
    fn from(e: CommandError) -> Self {
        match e {
            CommandError::CommandNotFound { command } => {
                GitError::CommandFailed(format!("command not found: {command}"))
            }
            CommandError::Timeout { timeout_ms } => {
                GitError::CommandFailed(format!("timed out after {timeout_ms}ms"))
            }
            CommandError::ExecutionFailed { message } | CommandError::Io { message } => {
                GitError::CommandFailed(message)
            }
        }
    }
}
