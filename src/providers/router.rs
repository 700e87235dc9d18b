//! Provider selection and breaker bookkeeping (§4.4, §9).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::circuit_breaker::{BreakerConfig, CircuitBreaker};
use crate::providers::executor::HealthStatus;
use crate::types::{BreakerStateKind, ProviderConfig};

/// Narrow interface injected into executors so they can report outcomes back
/// to the router without holding a full `ProviderRouter` reference (§9).
#[async_trait]
pub trait RecordResult: Send + Sync {
    async fn record_success(&self, provider_id: &str);
    async fn record_failure(&self, provider_id: &str);
}

struct ProviderEntry {
    config: ProviderConfig,
    breaker: CircuitBreaker,
    last_health: std::sync::Mutex<Option<HealthStatus>>,
}

/// Owns `BreakerState` per provider (§3 ownership table) and exposes
/// priority-ordered selection with degraded-mode fallback.
pub struct ProviderRouter {
    entries: HashMap<String, ProviderEntry>,
    order: Vec<String>,
}

impl ProviderRouter {
    pub fn new(providers: Vec<ProviderConfig>, breaker_config: BreakerConfig) -> Self {
        let mut enabled: Vec<ProviderConfig> = providers.into_iter().filter(|p| p.enabled).collect();
        enabled.sort_by_key(|p| p.priority);

        let order: Vec<String> = enabled.iter().map(|p| p.name.clone()).collect();
        let entries = enabled
            .into_iter()
            .map(|config| {
                let breaker = CircuitBreaker::new(config.name.clone(), breaker_config);
                (
                    config.name.clone(),
                    ProviderEntry { config, breaker, last_health: std::sync::Mutex::new(None) },
                )
            })
            .collect();

        Self { entries, order }
    }

    /// Priority-ordered view of enabled providers.
    pub fn enabled_providers(&self) -> Vec<&ProviderConfig> {
        self.order.iter().filter_map(|name| self.entries.get(name).map(|e| &e.config)).collect()
    }

    pub fn record_health(&self, provider_id: &str, status: HealthStatus) {
        if let Some(entry) = self.entries.get(provider_id) {
            *entry.last_health.lock().unwrap() = Some(status);
        }
    }

    fn is_healthy(&self, entry: &ProviderEntry) -> bool {
        entry.last_health.lock().unwrap().as_ref().map(|h| h.healthy).unwrap_or(true)
    }

    /// Returns the first provider whose breaker is not Open and whose last
    /// health snapshot is healthy, in ascending priority order. Falls back to
    /// the highest-priority provider (marked degraded) when none qualify.
    pub fn select_provider(&self) -> Option<(ProviderConfig, bool)> {
        for name in &self.order {
            let entry = self.entries.get(name)?;
            if entry.breaker.state() != BreakerStateKind::Open && self.is_healthy(entry) {
                return Some((entry.config.clone(), false));
            }
        }
        let top = self.order.first()?;
        self.entries.get(top).map(|entry| (entry.config.clone(), true))
    }

    pub async fn execute_guarded<F, Fut, T>(&self, provider_id: &str, f: F) -> Result<T, crate::errors::ProviderError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, crate::errors::ProviderError>>,
    {
        match self.entries.get(provider_id) {
            Some(entry) => entry.breaker.execute(f).await,
            None => f().await,
        }
    }
}

#[async_trait]
impl RecordResult for ProviderRouter {
    async fn record_success(&self, provider_id: &str) {
        if let Some(entry) = self.entries.get(provider_id) {
            let _ = entry.breaker.execute(|| async { Ok::<(), crate::errors::ProviderError>(()) }).await;
        }
    }

    async fn record_failure(&self, provider_id: &str) {
        if let Some(entry) = self.entries.get(provider_id) {
            let _ = entry
                .breaker
                .execute(|| async { Err::<(), _>(crate::errors::ProviderError::Unavailable) })
                .await;
        }
    }
}

/// Thin adapter so an executor can be handed a `RecordResult` scoped to one
/// provider id, without exposing the rest of the router.
pub struct ScopedRecorder {
    router: Arc<ProviderRouter>,
    provider_id: String,
}

impl ScopedRecorder {
    pub fn new(router: Arc<ProviderRouter>, provider_id: impl Into<String>) -> Self {
        Self { router, provider_id: provider_id.into() }
    }
}

#[async_trait]
impl RecordResult for ScopedRecorder {
    async fn record_success(&self, _provider_id: &str) {
        self.router.record_success(&self.provider_id).await;
    }

    async fn record_failure(&self, _provider_id: &str) {
        self.router.record_failure(&self.provider_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(name: &str, priority: u32) -> ProviderConfig {
        ProviderConfig {
            provider_type: "event_stream".into(),
            name: name.into(),
            priority,
            enabled: true,
            credentials: "token".into(),
            endpoint: None,
        }
    }

    #[test]
    fn select_provider_picks_highest_priority_healthy_provider() {
        let router = ProviderRouter::new(vec![provider("b", 2), provider("a", 1)], BreakerConfig::default());
        let (selected, degraded) = router.select_provider().unwrap();
        assert_eq!(selected.name, "a");
        assert!(!degraded);
    }

    #[tokio::test]
    async fn select_provider_skips_open_breaker_and_falls_back_degraded_when_all_open() {
        let router = ProviderRouter::new(vec![provider("only", 1)], BreakerConfig { failure_threshold: 1, ..BreakerConfig::default() });
        router.record_failure("only").await;

        let (selected, degraded) = router.select_provider().unwrap();
        assert_eq!(selected.name, "only");
        assert!(degraded);
    }

    #[test]
    fn enabled_providers_excludes_disabled_entries() {
        let mut disabled = provider("c", 3);
        disabled.enabled = false;
        let router = ProviderRouter::new(vec![provider("a", 1), disabled], BreakerConfig::default());
        assert_eq!(router.enabled_providers().len(), 1);
    }
}
