//! Typed configuration tree (§10.1, §6 "Configuration").
//!
//! Layered the same way the original project's config loader worked: default
//! values, then an optional config file, then environment variables (prefix
//! `AGENT_ORCHESTRATOR_`), via the `config` crate's `Config::builder()`.
//! `.env` support via `dotenvy`. A process-wide `LazyLock` mirrors the same
//! once-loaded-then-shared shape used by the issue-tracker rate limiter.

use std::path::{Path, PathBuf};

use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::circuit_breaker::BreakerConfig as BreakerRuntimeConfig;
use crate::issue_tracker::IssueTrackerConfig as IssueTrackerRuntimeConfig;
use crate::types::{ProviderConfig, Repository};
use crate::worktree::WorktreeManagerConfig as WorktreeRuntimeConfig;

/// Top-level configuration tree for the orchestrator core.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub worktree: WorktreeConfig,
    #[serde(default)]
    pub issue_tracker: IssueTrackerConfig,
    #[serde(default)]
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default = "default_health_probe_interval_ms")]
    pub health_probe_interval_ms: u64,
}

fn default_health_probe_interval_ms() -> u64 {
    30_000
}

/// Scheduler parallelism cap (§6: `maxConcurrency`, default 27).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { max_concurrency: 27 }
    }
}

/// Circuit-breaker thresholds (§6 `breaker.*`). Plain-millisecond fields so
/// they deserialize straight out of env/file values; converted to
/// `Duration` when handed to `crate::circuit_breaker::BreakerConfig`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, reset_timeout_ms: 60_000, half_open_max_calls: 2 }
    }
}

impl From<BreakerConfig> for BreakerRuntimeConfig {
    fn from(value: BreakerConfig) -> Self {
        BreakerRuntimeConfig {
            failure_threshold: value.failure_threshold,
            reset_timeout: std::time::Duration::from_millis(value.reset_timeout_ms),
            half_open_max_calls: value.half_open_max_calls,
        }
    }
}

/// Agent execution defaults (§6 `agent.*`).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentConfig {
    pub timeout_ms: u64,
    pub max_reconnect: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self { timeout_ms: 300_000, max_reconnect: 3 }
    }
}

/// Worktree lifecycle limits (§6 `worktree.*`).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorktreeConfig {
    pub base_dir: PathBuf,
    pub min_free_mb: u64,
    pub orphan_hours: u64,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self { base_dir: PathBuf::from("~/.agent/worktrees"), min_free_mb: 100, orphan_hours: 24 }
    }
}

impl From<WorktreeConfig> for WorktreeRuntimeConfig {
    fn from(value: WorktreeConfig) -> Self {
        WorktreeRuntimeConfig { base_dir: value.base_dir, min_free_mb: value.min_free_mb }
    }
}

/// Issue-tracker client settings (§6 `issueTracker.*`).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IssueTrackerConfig {
    pub endpoint: String,
    pub api_token: String,
    pub request_budget: usize,
    pub max_retries: u32,
    pub timeout_ms: u64,
}

impl Default for IssueTrackerConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.linear.app/graphql".to_string(),
            api_token: String::new(),
            request_budget: 4500,
            max_retries: 3,
            timeout_ms: 30_000,
        }
    }
}

impl From<IssueTrackerConfig> for IssueTrackerRuntimeConfig {
    fn from(value: IssueTrackerConfig) -> Self {
        IssueTrackerRuntimeConfig {
            endpoint: value.endpoint,
            api_token: value.api_token,
            request_budget: value.request_budget,
            max_retries: value.max_retries,
            timeout: std::time::Duration::from_millis(value.timeout_ms),
        }
    }
}

/// Repository routing table (§6 `repositories[]`).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RepositoryConfig {
    #[serde(default)]
    pub repositories: Vec<Repository>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            breaker: BreakerConfig::default(),
            agent: AgentConfig::default(),
            worktree: WorktreeConfig::default(),
            issue_tracker: IssueTrackerConfig::default(),
            repository: RepositoryConfig::default(),
            providers: Vec::new(),
            health_probe_interval_ms: 30_000,
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration file (`agent-orchestrator.toml`, `.agent-orchestrator-rc`)
    /// 3. Environment variables (prefixed with `AGENT_ORCHESTRATOR_`)
    pub fn load() -> Result<Self> {
        let mut builder = Config::builder();

        if Path::new("agent-orchestrator.toml").exists() {
            builder = builder.add_source(File::with_name("agent-orchestrator"));
        }
        if Path::new(".agent-orchestrator-rc").exists() {
            builder = builder.add_source(File::with_name(".agent-orchestrator-rc"));
        }

        builder = builder.add_source(
            Environment::with_prefix("AGENT_ORCHESTRATOR").separator("__").try_parsing(true),
        );

        let config = builder.build()?;
        let mut loaded: OrchestratorConfig = match config.try_deserialize() {
            Ok(cfg) => cfg,
            Err(_) => OrchestratorConfig::default(),
        };

        if loaded.issue_tracker.api_token.is_empty() {
            if let Ok(token) = std::env::var("LINEAR_API_TOKEN") {
                loaded.issue_tracker.api_token = token;
            } else if let Ok(token) = std::env::var("AGENT_ORCHESTRATOR_ISSUE_TRACKER_API_TOKEN") {
                loaded.issue_tracker.api_token = token;
            }
        }

        Ok(loaded)
    }

    /// Save configuration to file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load `.env` file if it exists.
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("loaded environment variables from .env file");
        }
        Ok(())
    }
}

/// Global configuration instance, loaded once on first access.
static CONFIG: std::sync::LazyLock<Result<OrchestratorConfig, anyhow::Error>> = std::sync::LazyLock::new(|| {
    let _ = OrchestratorConfig::load_env_file();
    OrchestratorConfig::load()
});

/// Get the global configuration.
pub fn config() -> Result<&'static OrchestratorConfig> {
    CONFIG.as_ref().map_err(|e| anyhow::anyhow!("failed to load configuration: {e}"))
}

/// Initialize configuration (called at startup).
pub fn init_config() -> Result<()> {
    let _config = config()?;
    tracing::info!("configuration loaded successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.scheduler.max_concurrency, 27);
        assert_eq!(cfg.breaker.failure_threshold, 5);
        assert_eq!(cfg.breaker.reset_timeout_ms, 60_000);
        assert_eq!(cfg.agent.timeout_ms, 300_000);
        assert_eq!(cfg.worktree.min_free_mb, 100);
        assert_eq!(cfg.worktree.orphan_hours, 24);
        assert_eq!(cfg.issue_tracker.request_budget, 4500);
    }

    #[test]
    fn breaker_config_converts_ms_to_duration() {
        let runtime: BreakerRuntimeConfig = BreakerConfig::default().into();
        assert_eq!(runtime.reset_timeout, std::time::Duration::from_secs(60));
    }
}
