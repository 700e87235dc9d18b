//! Autonomous coding-agent orchestrator core.
//!
//! A long-running process library: issue-tracker webhooks come in,
//! `Orchestrator::handle` routes each to a repository, runs it through a
//! worktree + provider-failover + verification pipeline, and reports the
//! outcome back to the issue tracker. See `SPEC_FULL.md` for the full
//! module map; `DESIGN.md` for what each piece is grounded on.

pub mod circuit_breaker;
pub mod config;
pub mod errors;
pub mod external;
pub mod fs;
pub mod git;
pub mod health;
pub mod issue_tracker;
pub mod orchestrator;
pub mod providers;
pub mod repository;
pub mod result_orchestrator;
pub mod scheduler;
pub mod session;
pub mod shutdown;
pub mod telemetry;
pub mod types;
pub mod worktree;

// Re-export key types for easy access
pub use circuit_breaker::{BreakerConfig, CircuitBreaker};
pub use config::{config, init_config, OrchestratorConfig};
pub use errors::OrchestratorError;
pub use issue_tracker::{IssueTrackerClient, IssueTrackerConfig};
pub use orchestrator::{Disposition, FailoverConfig, Orchestrator};
pub use repository::RepositoryRouter;
pub use result_orchestrator::ResultOrchestrator;
pub use scheduler::{Scheduler, SubmitDisposition};
pub use session::SessionStore;
pub use shutdown::ShutdownCoordinator;
pub use telemetry::{create_orchestration_span, generate_correlation_id, init_telemetry, shutdown_telemetry};
pub use worktree::{WorktreeManager, WorktreeManagerConfig};
