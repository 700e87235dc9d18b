//! Error taxonomy for the orchestrator core.
//!
//! Each typed error below corresponds to one "kind" in the error taxonomy;
//! sub-kinds are enum variants rather than a parallel type, so severity and
//! retry classification can live next to the definition that needs them.

use thiserror::Error;

use crate::external::command::CommandError;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("insufficient disk space: {0}")]
    DiskSpace(String),
    #[error("worktree already exists: {0}")]
    WorktreeExists(String),
    #[error("repository not found: {0}")]
    RepoNotFound(String),
    #[error("invalid worktree mode: {0}")]
    InvalidMode(String),
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error(transparent)]
    Command(#[from] CommandError),
}

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("no repository configuration available")]
    NoConfig,
    #[error("no repository matched the work item")]
    NoMatch,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("network error: {0}")]
    Network(String),
    #[error("authentication error: {0}")]
    Auth(String),
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimit { retry_after_secs: u64 },
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },
    #[error("client error ({status}): {message}")]
    Client { status: u16, message: String },
    #[error("event stream disconnected: {0}")]
    StreamDisconnect(String),
    #[error("provider call timed out")]
    Timeout,
    #[error("circuit open for provider {0}")]
    CircuitOpen(String),
    #[error("no healthy provider available")]
    Unavailable,
}

impl ProviderError {
    /// Whether the per-call retry wrapper (§4.6 step 8, §7) should retry this
    /// error locally. Auth, payload, and semantic errors are not transient.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Network(_)
                | ProviderError::Timeout
                | ProviderError::StreamDisconnect(_)
                | ProviderError::Server { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("repository not found: {0}")]
    RepoNotFound(String),
    #[error("insufficient disk space: {0}")]
    DiskSpace(String),
    #[error("worktree already exists: {0}")]
    WorktreeExists(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("filesystem error: {0}")]
    Io(String),
    #[error(transparent)]
    Git(#[from] GitError),
}

#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("verification failed")]
    Failed(Box<crate::types::VerificationReport>),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("session for issue {0} is already active or queued")]
    Duplicate(String),
}

#[derive(Debug, Error)]
pub enum IssueTrackerError {
    #[error("network error: {0}")]
    Network(String),
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("request budget exhausted, retry after {retry_after_secs}s")]
    BudgetExhausted { retry_after_secs: u64 },
    #[error("request timed out")]
    Timeout,
    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("response could not be decoded: {0}")]
    Decode(String),
}

impl IssueTrackerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, IssueTrackerError::Network(_) | IssueTrackerError::Timeout)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration invalid: {0}")]
    Invalid(String),
}

/// Severity classification named in the error handling design: most kinds are
/// plain errors, `RateLimit` is a warning, `Auth`/`DiskSpace` are critical and
/// halt the pipeline for that issue immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

/// Top-level error enum used at orchestrator call sites; everything below
/// the typed boundary converts into this via `#[from]`.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Worktree(#[from] WorktreeError),
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Verification(#[from] VerificationError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    IssueTracker(#[from] IssueTrackerError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("processing failed: {0}")]
    ProcessingFailed(String),
    #[error("retry budget exhausted")]
    RetryExhausted,
    #[error("all configured providers failed")]
    FallbackFailed,
}

impl OrchestratorError {
    pub fn severity(&self) -> Severity {
        match self {
            OrchestratorError::Provider(ProviderError::RateLimit { .. }) => Severity::Warning,
            OrchestratorError::IssueTracker(IssueTrackerError::RateLimited { .. }) => Severity::Warning,
            OrchestratorError::IssueTracker(IssueTrackerError::BudgetExhausted { .. }) => Severity::Warning,
            OrchestratorError::Provider(ProviderError::Auth(_)) => Severity::Critical,
            OrchestratorError::Git(GitError::DiskSpace(_)) => Severity::Critical,
            OrchestratorError::Worktree(WorktreeError::DiskSpace(_))
            | OrchestratorError::Worktree(WorktreeError::PermissionDenied(_)) => Severity::Critical,
            _ => Severity::Error,
        }
    }
}
