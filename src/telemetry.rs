//! Structured logging setup (§10.3). JSON output with an `EnvFilter` layer,
//! matching the corpus's `init_telemetry`/`shutdown_telemetry` shape.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

pub fn init_telemetry() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
        )
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    tracing::info!("telemetry initialized with structured logging");
    Ok(())
}

/// Generate a correlation ID for linking related operations.
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Span entered once at the top of the Orchestrator pipeline so every
/// downstream log line in that run is correlated by `issueId`/`repositoryId`
/// (§10.3).
pub fn create_orchestration_span(
    operation: &str,
    issue_id: Option<&str>,
    repository_id: Option<&str>,
    correlation_id: Option<&str>,
) -> tracing::Span {
    tracing::info_span!(
        "orchestration",
        operation = operation,
        issue.id = issue_id,
        repository.id = repository_id,
        correlation.id = correlation_id,
        otel.kind = "internal"
    )
}

/// Shutdown telemetry gracefully.
pub fn shutdown_telemetry() {
    tracing::info!("telemetry shutdown complete");
}