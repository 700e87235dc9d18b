use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use agent_orchestrator::config::{config, init_config, OrchestratorConfig};
use agent_orchestrator::external::{CommandExecutor, ProcessCommandExecutor};
use agent_orchestrator::fs::{FileSystemOperations, StandardFileSystem};
use agent_orchestrator::git::GitService;
use agent_orchestrator::health::HealthDaemon;
use agent_orchestrator::issue_tracker::IssueTrackerClient;
use agent_orchestrator::providers::{AgentExecutor, ProviderRouter};
use agent_orchestrator::repository::RepositoryRouter;
use agent_orchestrator::result_orchestrator::ResultOrchestrator;
use agent_orchestrator::scheduler::Scheduler;
use agent_orchestrator::session::SessionStore;
use agent_orchestrator::shutdown::ShutdownCoordinator;
use agent_orchestrator::types::Webhook;
use agent_orchestrator::worktree::WorktreeManager;
use agent_orchestrator::{init_telemetry, shutdown_telemetry, Disposition, FailoverConfig, Orchestrator};

const SESSION_ARCHIVE_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Parser)]
#[command(name = "agent-orchestrator")]
#[command(about = "Autonomous coding-agent orchestrator: webhook -> worktree -> agent -> verify -> report")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the long-running process: health probing and orphan-worktree
    /// sweeping in the background until SIGINT/SIGTERM. Inbound webhook
    /// receipt is out of scope for this crate (§1); an adapter process feeds
    /// parsed `Webhook` values to `Orchestrator::handle`.
    Serve,
    /// Debug entry point: read one webhook payload from a JSON file, route
    /// and run it through the pipeline, print the resulting disposition.
    Route {
        /// Path to a JSON file containing one `Webhook` payload.
        path: String,
    },
    /// Print scheduler occupancy (active/waiting counts).
    Status,
}

/// `~/.agent/sessions/`, a sibling of the configured worktree base directory
/// rather than a nested path under it (§6 filesystem layout).
fn sessions_dir(cfg: &OrchestratorConfig) -> std::path::PathBuf {
    cfg.worktree
        .base_dir
        .parent()
        .map(|parent| parent.join("sessions"))
        .unwrap_or_else(|| std::path::PathBuf::from("~/.agent/sessions"))
}

fn build_orchestrator(cfg: &OrchestratorConfig) -> Orchestrator {
    let executor: Arc<dyn CommandExecutor> = Arc::new(ProcessCommandExecutor);
    let fs_ops: Arc<dyn FileSystemOperations> = Arc::new(StandardFileSystem);

    let repository_router = Arc::new(RepositoryRouter::new(cfg.repository.repositories.clone()));
    let scheduler = Arc::new(Scheduler::new(cfg.scheduler.max_concurrency));
    let worktree_manager =
        Arc::new(WorktreeManager::new(executor.clone(), fs_ops.clone(), cfg.worktree.clone().into()));
    let provider_router = Arc::new(ProviderRouter::new(cfg.providers.clone(), cfg.breaker.clone().into()));

    // Concrete agent-provider SDK bindings are out of scope for this crate
    // (§1) — a deployment injects real `AgentExecutor`s here. None are wired
    // in by default, so every execution attempt fails over immediately.
    let executors: HashMap<String, Arc<dyn AgentExecutor>> = HashMap::new();

    let issue_tracker = Arc::new(IssueTrackerClient::new(cfg.issue_tracker.clone().into()));
    let result_orchestrator = Arc::new(ResultOrchestrator::new(GitService::new(executor.clone()), Vec::new()));
    let git = GitService::new(executor.clone());
    let session_store = Arc::new(SessionStore::new(sessions_dir(cfg)));

    Orchestrator::new(
        repository_router,
        scheduler,
        worktree_manager,
        provider_router,
        executors,
        issue_tracker,
        result_orchestrator,
        git,
        session_store,
        FailoverConfig::default(),
    )
}

async fn run_serve(cfg: &OrchestratorConfig) -> Result<()> {
    let executor: Arc<dyn CommandExecutor> = Arc::new(ProcessCommandExecutor);
    let fs_ops: Arc<dyn FileSystemOperations> = Arc::new(StandardFileSystem);
    let provider_router = Arc::new(ProviderRouter::new(cfg.providers.clone(), cfg.breaker.clone().into()));
    let executors: HashMap<String, Arc<dyn AgentExecutor>> = HashMap::new();
    let worktree_manager =
        Arc::new(WorktreeManager::new(executor.clone(), fs_ops, cfg.worktree.clone().into()));
    let session_store = Arc::new(SessionStore::new(sessions_dir(cfg)));
    let scheduler = Arc::new(Scheduler::new(cfg.scheduler.max_concurrency));

    let health_daemon = HealthDaemon::new(executors, provider_router)
        .with_probe_interval(Duration::from_millis(cfg.health_probe_interval_ms));
    let health_shutdown = health_daemon.shutdown_handle();

    let sweeper_shutdown = Arc::new(tokio::sync::Notify::new());
    let sweeper_signal = sweeper_shutdown.clone();
    let orphan_age = Duration::from_secs(cfg.worktree.orphan_hours * 60 * 60);
    let sweeper_worktrees = worktree_manager.clone();
    let sweeper_sessions = session_store.clone();
    let sweeper = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60 * 30));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let removed = sweeper_worktrees.cleanup_orphaned(orphan_age).await;
                    if removed > 0 {
                        tracing::info!(removed, "swept orphaned worktrees");
                    }
                    if let Err(e) = sweeper_sessions.rotate_archive(SESSION_ARCHIVE_RETENTION).await {
                        tracing::warn!(error = %e, "session archive rotation failed");
                    }
                }
                _ = sweeper_signal.notified() => break,
            }
        }
    });

    let health_task = tokio::spawn(health_daemon.run());

    let mut shutdown = ShutdownCoordinator::new(scheduler);
    shutdown.register_daemon(health_shutdown);
    shutdown.register_daemon(sweeper_shutdown);
    shutdown.wait_for_shutdown().await?;

    let _ = health_task.await;
    let _ = sweeper.await;
    Ok(())
}

async fn run_route(cfg: &OrchestratorConfig, path: &str) -> Result<()> {
    let body = tokio::fs::read_to_string(path).await?;
    let webhook: Webhook = serde_json::from_str(&body)?;
    let orchestrator = build_orchestrator(cfg);
    let disposition = orchestrator.handle(webhook).await?;
    println!("{}", describe(&disposition));
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = init_config() {
        eprintln!("Warning: failed to initialize configuration: {e}");
    }
    if let Err(e) = init_telemetry() {
        eprintln!("Warning: failed to initialize telemetry: {e}");
    }

    let cli = Cli::parse();
    let cfg = config().map(|c| c.clone()).unwrap_or_default();

    let result = match cli.command {
        None | Some(Commands::Serve) => run_serve(&cfg).await,
        Some(Commands::Route { path }) => run_route(&cfg, &path).await,
        Some(Commands::Status) => {
            let scheduler = Scheduler::new(cfg.scheduler.max_concurrency);
            let counts = scheduler.counts();
            println!(
                "active={} waiting={} max_concurrency={}",
                counts.active, counts.waiting, counts.max_concurrency
            );
            Ok(())
        }
    };

    shutdown_telemetry();
    result
}

fn describe(disposition: &Disposition) -> String {
    match disposition {
        Disposition::Started => "started".to_string(),
        Disposition::Queued => "queued".to_string(),
        Disposition::Duplicate => "duplicate".to_string(),
        Disposition::NeedsSelection => "needs-selection".to_string(),
        Disposition::RoutingFailed => "routing-failed".to_string(),
        Disposition::Ignored => "ignored".to_string(),
        Disposition::Done { commit_sha } => format!("done commit={}", commit_sha.as_deref().unwrap_or("none")),
        Disposition::Failed { reason } => format!("failed: {reason}"),
    }
}
