//! Parses agent events and runs post-execution verification checks (§4.10).

use std::collections::HashSet;

use crate::errors::VerificationError;
use crate::git::GitService;
use crate::providers::events::{AgentEvent, ToolCall};
use crate::types::{CheckStatus, GitCommit, VerificationCheck, VerificationReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedStatus {
    Success,
    Failure,
    Incomplete,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedEvents {
    pub commits: Vec<GitCommit>,
    pub files: Vec<String>,
    pub errors: Vec<String>,
}

impl ParsedEvents {
    pub fn status(&self) -> ParsedStatus {
        if !self.errors.is_empty() {
            ParsedStatus::Failure
        } else if !self.commits.is_empty() || !self.files.is_empty() {
            ParsedStatus::Success
        } else {
            ParsedStatus::Incomplete
        }
    }
}

const EXCLUDED_DIRS: &[&str] = &[".git", "node_modules", ".cache", ".tmp"];

pub struct ResultOrchestrator {
    git: GitService,
    excluded_patterns: Vec<String>,
}

impl ResultOrchestrator {
    pub fn new(git: GitService, excluded_patterns: Vec<String>) -> Self {
        Self { git, excluded_patterns }
    }

    /// Extracts git commits and touched files from a session's event log,
    /// deduplicating files by path (§4.10).
    pub fn parse_events(events: &[AgentEvent]) -> ParsedEvents {
        let mut commits = Vec::new();
        let mut seen_files = HashSet::new();
        let mut files = Vec::new();
        let mut errors = Vec::new();

        for event in events {
            match event {
                AgentEvent::ToolCall { call, .. } => match call {
                    ToolCall::GitCommit { message, output } => {
                        commits.push(GitCommit { sha: output.clone(), message: message.clone(), issue_id: None });
                    }
                    ToolCall::WriteFile { path } | ToolCall::EditFile { path } => {
                        if seen_files.insert(path.clone()) {
                            files.push(path.clone());
                        }
                    }
                    ToolCall::Bash { .. } => {}
                },
                AgentEvent::FileEdited { path, .. } => {
                    if seen_files.insert(path.clone()) {
                        files.push(path.clone());
                    }
                }
                AgentEvent::MessageUpdated { diff_files, .. } => {
                    for path in diff_files {
                        if seen_files.insert(path.clone()) {
                            files.push(path.clone());
                        }
                    }
                }
                AgentEvent::SessionError { message, .. } => errors.push(message.clone()),
                AgentEvent::SessionIdle { .. } | AgentEvent::SessionStatus { .. } => {}
            }
        }

        ParsedEvents { commits, files, errors }
    }

    /// Runs the git-commit and files-exist checks (§4.10); both must pass for
    /// `success=true`. Never errors itself — check failures are encoded as
    /// `CheckStatus::Fail` entries in the returned report, matching "the
    /// orchestrator attaches the report ... and returns it even on failure."
    pub async fn verify(
        &self,
        worktree_path: &str,
        baseline_commit: Option<&str>,
        issue_id: &str,
    ) -> Result<VerificationReport, VerificationError> {
        let current_commit = self.git.get_current_commit(worktree_path).await;

        let commit_check = self.check_git_commit(worktree_path, baseline_commit, &current_commit, issue_id).await;
        let (files_check, files_verified, files_missing) = self.check_files_exist(worktree_path).await;

        let success = commit_check.status == CheckStatus::Pass && files_check.status == CheckStatus::Pass;

        let report = VerificationReport {
            success,
            issue_id: issue_id.to_string(),
            baseline_commit: baseline_commit.map(|s| s.to_string()),
            current_commit: current_commit.clone(),
            checks: vec![commit_check, files_check],
            files_verified,
            files_missing,
            errors: Vec::new(),
        };

        if !success {
            return Err(VerificationError::Failed(Box::new(report)));
        }
        Ok(report)
    }

    async fn check_git_commit(
        &self,
        worktree_path: &str,
        baseline_commit: Option<&str>,
        current_commit: &Option<String>,
        issue_id: &str,
    ) -> VerificationCheck {
        let Some(current) = current_commit else {
            return VerificationCheck {
                name: "git_commit".into(),
                status: CheckStatus::Fail,
                message: Some("no HEAD commit found".into()),
                details: None,
            };
        };

        if current.len() != 40 || !current.chars().all(|c| c.is_ascii_hexdigit()) {
            return VerificationCheck {
                name: "git_commit".into(),
                status: CheckStatus::Fail,
                message: Some("HEAD is not a 40-hex commit SHA".into()),
                details: None,
            };
        }

        if let Some(baseline) = baseline_commit {
            if baseline == current {
                return VerificationCheck {
                    name: "git_commit".into(),
                    status: CheckStatus::Fail,
                    message: Some("HEAD unchanged from baseline".into()),
                    details: Some(serde_json::json!({ "baselineCommit": baseline, "currentCommit": current })),
                };
            }
        }

        if self.git.verify_commit_message_contains_issue_id(worktree_path, current, issue_id).await {
            VerificationCheck { name: "git_commit".into(), status: CheckStatus::Pass, message: None, details: None }
        } else {
            VerificationCheck {
                name: "git_commit".into(),
                status: CheckStatus::Fail,
                message: Some("commit subject does not reference the issue id".into()),
                details: Some(serde_json::json!({ "baselineCommit": baseline_commit, "currentCommit": current })),
            }
        }
    }

    async fn check_files_exist(&self, worktree_path: &str) -> (VerificationCheck, Vec<String>, Vec<String>) {
        let mut verified = Vec::new();
        let mut missing = Vec::new();
        let mut stack = vec![worktree_path.to_string()];

        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(_) => {
                    missing.push(dir);
                    continue;
                }
            };

            while let Ok(Some(entry)) = entries.next_entry().await {
                let name = entry.file_name().to_string_lossy().to_string();
                if EXCLUDED_DIRS.contains(&name.as_str()) || self.excluded_patterns.iter().any(|p| name.contains(p.as_str())) {
                    continue;
                }

                let path = entry.path();
                match entry.file_type().await {
                    Ok(ft) if ft.is_dir() => stack.push(path.to_string_lossy().to_string()),
                    Ok(ft) if ft.is_file() => verified.push(path.to_string_lossy().to_string()),
                    _ => missing.push(path.to_string_lossy().to_string()),
                }
            }
        }

        let status = if verified.is_empty() { CheckStatus::Fail } else { CheckStatus::Pass };
        let check = VerificationCheck {
            name: "files_exist".into(),
            status,
            message: if verified.is_empty() { Some("no files found in worktree".into()) } else { None },
            details: None,
        };
        (check, verified, missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::events::EventStatus;

    #[test]
    fn parse_events_extracts_commits_and_dedupes_files() {
        let events = vec![
            AgentEvent::ToolCall {
                session_id: "s1".into(),
                call: ToolCall::GitCommit { message: "ROM-1 fix".into(), output: "a".repeat(40) },
            },
            AgentEvent::ToolCall {
                session_id: "s1".into(),
                call: ToolCall::WriteFile { path: "src/lib.rs".into() },
            },
            AgentEvent::FileEdited { session_id: "s1".into(), path: "src/lib.rs".into() },
        ];

        let parsed = ResultOrchestrator::parse_events(&events);
        assert_eq!(parsed.commits.len(), 1);
        assert_eq!(parsed.files, vec!["src/lib.rs".to_string()]);
        assert_eq!(parsed.status(), ParsedStatus::Success);
    }

    #[test]
    fn parse_events_failure_status_when_error_present() {
        let events = vec![AgentEvent::SessionError { session_id: "s1".into(), message: "boom".into() }];
        let parsed = ResultOrchestrator::parse_events(&events);
        assert_eq!(parsed.status(), ParsedStatus::Failure);
    }

    #[test]
    fn parse_events_incomplete_when_nothing_happened() {
        let events = vec![AgentEvent::SessionStatus { session_id: "s1".into(), status: EventStatus::Idle }];
        let parsed = ResultOrchestrator::parse_events(&events);
        assert_eq!(parsed.status(), ParsedStatus::Incomplete);
    }
}
