//! Core data model shared across the orchestrator components (§3).

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

/// A source repository the orchestrator can route work items into.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: String,
    pub name: String,
    pub local_path: PathBuf,
    pub base_branch: String,
    #[serde(default)]
    pub routing_labels: HashSet<String>,
    #[serde(default)]
    pub project_keys: HashSet<String>,
    #[serde(default)]
    pub team_keys: HashSet<String>,
    pub linear_workspace_id: String,
    pub github_url: Option<String>,
}

impl Repository {
    /// A catch-all repository carries no routing metadata at all (§3, §4.8 step 6).
    pub fn is_catch_all(&self) -> bool {
        self.routing_labels.is_empty() && self.project_keys.is_empty() && self.team_keys.is_empty()
    }
}

/// A unit of work delivered by the issue tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub identifier: String,
    pub title: String,
    pub description: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    pub project: Option<String>,
    pub team_key: Option<String>,
    pub state: String,
}

/// How a `RouteResult::Selected` was reached (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteMethod {
    DescriptionTag,
    Label,
    Project,
    Team,
    TeamPrefix,
    CatchAll,
    WorkspaceFallback,
    Cached,
}

#[derive(Debug, Clone)]
pub enum RouteResult {
    Selected {
        repository: Repository,
        method: RouteMethod,
    },
    NeedsSelection {
        candidates: Vec<Repository>,
    },
    None,
}

/// Filesystem layout mode for a worktree (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorktreeMode {
    Main,
    Branch,
    Session,
}

#[derive(Debug, Clone)]
pub struct Worktree {
    pub issue_id: String,
    pub worktree_path: PathBuf,
    pub repository_path: PathBuf,
    pub branch_name: String,
    pub mode: WorktreeMode,
    pub base_commit: Option<String>,
    pub created_at: SystemTime,
    pub symlinks: Vec<PathBuf>,
}

/// Forward-only lifecycle of an orchestrated session (§3, §4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Started,
    InProgress,
    Done,
    Error,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Done | SessionState::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CleanupAction {
    Removed,
    Preserved,
}

/// On-disk, append-only session record (§6 filesystem layout).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub issue_id: String,
    pub repository_id: String,
    pub worktree_path: PathBuf,
    pub state: SessionState,
    pub pid: Option<u32>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completion_reason: Option<String>,
    pub commit_sha: Option<String>,
    pub error_message: Option<String>,
    pub cleanup_action: Option<CleanupAction>,
}

/// What the Scheduler actually owns per issue (§3 ownership table: "the set
/// of active+queued SessionConfigs"). Deliberately narrower than `WorkItem`:
/// the scheduler only needs enough to dedupe and to hand back to the
/// Orchestrator once admitted.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub issue_id: String,
    pub work_item: WorkItem,
    pub repository_id: String,
}

/// Configuration for one agent provider backend (§3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(rename = "type")]
    pub provider_type: String,
    pub name: String,
    pub priority: u32,
    pub enabled: bool,
    pub credentials: String,
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerStateKind {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct GitCommit {
    pub sha: String,
    pub message: String,
    pub issue_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub success: bool,
    pub files: Vec<String>,
    pub git_commits: Vec<GitCommit>,
    pub output: String,
    pub duration: Duration,
    pub error: Option<String>,
    pub verification: Option<VerificationReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Pass,
    Fail,
    Skip,
    Pending,
}

#[derive(Debug, Clone)]
pub struct VerificationCheck {
    pub name: String,
    pub status: CheckStatus,
    pub message: Option<String>,
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct VerificationReport {
    pub success: bool,
    pub issue_id: String,
    pub baseline_commit: Option<String>,
    pub current_commit: Option<String>,
    pub checks: Vec<VerificationCheck>,
    pub files_verified: Vec<String>,
    pub files_missing: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct GitStatus {
    pub is_clean: bool,
    pub modified: Vec<String>,
    pub added: Vec<String>,
    pub deleted: Vec<String>,
    pub untracked: Vec<String>,
    pub branch: Option<String>,
    pub commit: Option<String>,
}

/// Minimal identity of a team, as carried on most webhook payload shapes (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamRef {
    pub key: String,
}

/// One of the three inbound shapes the core recognizes (§6 "Inbound
/// webhooks"). The HTTP receiver that validates signatures and deserializes
/// the raw body is out of scope (§1); this crate only consumes the parsed
/// value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Webhook {
    /// An agent-session lifecycle event. `Response` variants carrying a
    /// selection value drive `RepositoryRouter::select_from_response`.
    AgentSession {
        action: AgentSessionAction,
        organization_id: String,
        agent_session_id: String,
        issue_id: String,
        issue_identifier: String,
        team: Option<TeamRef>,
        /// Present only for `action: Response`.
        response_value: Option<String>,
    },
    /// An issue entity event: full work-item payload.
    Entity { work_item: WorkItem },
    /// A lightweight notification carrying just enough to look the issue up.
    Notification { issue_id: String, issue_identifier: String, team: Option<TeamRef> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentSessionAction {
    Created,
    Prompted,
    Response,
}

/// Recorded when `RepositoryRouter` cannot resolve a single repository and
/// must ask a human to pick one (§4.8, §9 "Elicitation"). Keyed by
/// `agentSessionId`; removed when the response arrives or at shutdown.
#[derive(Debug, Clone)]
pub struct PendingElicitation {
    pub issue_id: String,
    pub candidates: Vec<Repository>,
}

/// Slugify an identifier for use in `linear/{issueId}-{slug}` branch names (§6).
pub fn slugify(input: &str) -> String {
    let slug: String = input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    if slug.is_empty() {
        "issue".to_string()
    } else {
        slug
    }
}

pub fn branch_name(issue_id: &str, title_slug: &str) -> String {
    let slug = slugify(title_slug);
    format!("linear/{issue_id}-{slug}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catch_all_repository_has_no_routing_metadata() {
        let repo = Repository {
            id: "r1".into(),
            name: "alpha".into(),
            local_path: "/tmp/alpha".into(),
            base_branch: "main".into(),
            routing_labels: HashSet::new(),
            project_keys: HashSet::new(),
            team_keys: HashSet::new(),
            linear_workspace_id: "ws".into(),
            github_url: None,
        };
        assert!(repo.is_catch_all());
    }

    #[test]
    fn slugify_replaces_non_alphanumeric_and_lowercases() {
        assert_eq!(slugify("Fix Login Bug!"), "fix-login-bug-");
        assert_eq!(slugify(""), "issue");
    }

    #[test]
    fn branch_name_matches_linear_prefix_convention() {
        assert_eq!(branch_name("ROM-1", "hello world"), "linear/ROM-1-hello-world");
    }

    #[test]
    fn session_state_terminal_states_are_done_and_error() {
        assert!(SessionState::Done.is_terminal());
        assert!(SessionState::Error.is_terminal());
        assert!(!SessionState::Started.is_terminal());
        assert!(!SessionState::InProgress.is_terminal());
    }
}
