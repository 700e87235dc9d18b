//! Graceful shutdown coordination (§10.5 "Supplemental features").
//!
//! Installs a SIGINT/SIGTERM handler, signals the background daemons
//! (`HealthDaemon`, the orphan-worktree sweeper) to stop via their
//! `Notify` handles, and waits for in-flight orchestrations to drain up to a
//! grace period. The Scheduler never forcibly cancels a running
//! orchestration on shutdown (§5); this coordinator only waits.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::scheduler::Scheduler;

const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(30);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Coordinates an orderly stop of the long-running process.
pub struct ShutdownCoordinator {
    scheduler: Arc<Scheduler>,
    daemon_signals: Vec<Arc<Notify>>,
    drain_grace: Duration,
}

impl ShutdownCoordinator {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler, daemon_signals: Vec::new(), drain_grace: DEFAULT_DRAIN_GRACE }
    }

    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    /// Registers a background daemon's shutdown handle so it gets signalled
    /// when `shutdown()` runs (`HealthDaemon::shutdown_handle`, the orphan
    /// sweeper's own `Notify`).
    pub fn register_daemon(&mut self, signal: Arc<Notify>) {
        self.daemon_signals.push(signal);
    }

    /// Waits for SIGINT or SIGTERM, then runs `shutdown()`.
    pub async fn wait_for_shutdown(self) -> Result<()> {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
            tokio::select! {
                _ = ctrl_c => info!("received SIGINT"),
                _ = terminate.recv() => info!("received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await?;
            info!("received ctrl-c");
        }

        self.shutdown().await
    }

    /// Signals every registered daemon to stop, then polls the scheduler's
    /// active count until it drains to zero or `drain_grace` elapses.
    pub async fn shutdown(self) -> Result<()> {
        info!("initiating graceful shutdown");

        for signal in &self.daemon_signals {
            signal.notify_one();
        }

        let deadline = tokio::time::Instant::now() + self.drain_grace;
        loop {
            let active = self.scheduler.counts().active;
            if active == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(active, "shutdown grace period elapsed with orchestrations still running");
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        info!("graceful shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_returns_immediately_when_nothing_active() {
        let scheduler = Arc::new(Scheduler::new(4));
        let coordinator = ShutdownCoordinator::new(scheduler).with_drain_grace(Duration::from_millis(50));

        let result = tokio::time::timeout(Duration::from_secs(1), coordinator.shutdown()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn shutdown_notifies_registered_daemons() {
        let scheduler = Arc::new(Scheduler::new(4));
        let mut coordinator = ShutdownCoordinator::new(scheduler).with_drain_grace(Duration::from_millis(10));
        let signal = Arc::new(Notify::new());
        coordinator.register_daemon(signal.clone());

        let waiter = tokio::spawn(async move {
            signal.notified().await;
        });

        coordinator.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_gives_up_after_grace_period_when_work_stays_active() {
        use crate::types::{SessionConfig, WorkItem};

        let scheduler = Arc::new(Scheduler::new(1));
        scheduler.submit(SessionConfig {
            issue_id: "still-running".to_string(),
            work_item: WorkItem {
                id: "still-running".to_string(),
                identifier: "ROM-9".to_string(),
                title: "title".into(),
                description: None,
                labels: vec![],
                project: None,
                team_key: None,
                state: "in_progress".into(),
            },
            repository_id: "repo-1".into(),
        });
        let coordinator = ShutdownCoordinator::new(scheduler).with_drain_grace(Duration::from_millis(50));

        let started = tokio::time::Instant::now();
        coordinator.shutdown().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
    }
}
