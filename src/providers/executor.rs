//! Agent executor abstraction (§4.6, §9).
//!
//! `AgentClient` is the narrow interface a concrete provider SDK must supply;
//! concrete SDKs are out of scope for this crate (§1) — callers inject an
//! implementation. `AgentExecutor` drives one session end to end: subscribe,
//! prompt, collect, parse, retry, reconnect.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::mpsc;

use crate::errors::ProviderError;
use crate::providers::events::AgentEvent;
use crate::types::ExecutionResult;

#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub worktree_path: String,
    pub prompt: String,
    pub model_override: Option<String>,
    pub timeout: Duration,
    pub max_reconnect: u32,
    pub poll_interval: Duration,
    pub poll_warmup: Duration,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            worktree_path: String::new(),
            prompt: String::new(),
            model_override: None,
            timeout: Duration::from_millis(300_000),
            max_reconnect: 3,
            poll_interval: Duration::from_secs(10),
            poll_warmup: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub healthy: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatusKind {
    Idle,
    Running,
    Absent,
}

pub type EventStream = mpsc::Receiver<Result<AgentEvent, ProviderError>>;

/// Narrow interface to a concrete agent provider SDK. Out of scope for this
/// crate to implement concretely (§1); callers inject a real SDK binding or a
/// test double.
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn create_session(&self, dir: &str) -> Result<String, ProviderError>;
    async fn prompt(&self, session_id: &str, model: Option<&str>, parts: &str) -> Result<(), ProviderError>;
    async fn abort(&self, session_id: &str) -> Result<(), ProviderError>;
    async fn status(&self, session_id: &str) -> Result<SessionStatusKind, ProviderError>;
    async fn subscribe(&self) -> Result<EventStream, ProviderError>;
    async fn health_check(&self) -> Result<HealthStatus, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct ExecutorMetadata {
    pub provider_type: String,
    pub name: String,
}

#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(&self, config: ExecutionConfig) -> Result<ExecutionResult, ProviderError>;
    async fn health_check(&self) -> Result<HealthStatus, ProviderError>;
    fn metadata(&self) -> ExecutorMetadata;
}

/// Retries transient errors with exponential backoff + jitter, bounded at
/// `max_attempts` total tries (§4.6 step 8, §7).
pub async fn retry_transient<F, Fut, T>(max_attempts: u32, mut f: F) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let backoff_ms = 2u64.pow(attempt.min(5)) * 100;
                let jitter_ms = rand::rng().random_range(0..100);
                tokio::time::sleep(Duration::from_millis(backoff_ms + jitter_ms)).await;
                continue;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Event-stream (SSE-style) provider executor: subscribes before prompting so
/// a terminal event emitted in the gap between create and subscribe can never
/// be missed (§4.6 step 1).
pub struct EventStreamExecutor {
    client: Arc<dyn AgentClient>,
    metadata: ExecutorMetadata,
}

impl EventStreamExecutor {
    pub fn new(client: Arc<dyn AgentClient>, metadata: ExecutorMetadata) -> Self {
        Self { client, metadata }
    }

    /// Drains `stream` until a terminal event, a terminal error, the
    /// timeout, or reconnect-budget exhaustion. `stream` must already be
    /// open (subscribed before the prompt was sent, §4.6 step 1); on a
    /// stream error this re-subscribes in place rather than requiring the
    /// caller to resend the prompt.
    async fn collect_until_terminal(
        &self,
        session_id: &str,
        config: &ExecutionConfig,
        mut stream: EventStream,
    ) -> Result<Vec<AgentEvent>, ProviderError> {
        let mut events = Vec::new();
        let mut reconnects = 0u32;
        let deadline = tokio::time::Instant::now() + config.timeout;
        let mut poll_due = tokio::time::Instant::now() + config.poll_warmup;

        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                let _ = self.client.abort(session_id).await;
                return Err(ProviderError::Timeout);
            }

            let sleep_for = poll_due.saturating_duration_since(now).min(deadline - now);
            tokio::select! {
                next = stream.recv() => {
                    match next {
                        Some(Ok(event)) => {
                            let terminal = event.is_terminal();
                            let is_error = event.is_error();
                            events.push(event);
                            if terminal {
                                if is_error {
                                    return Err(ProviderError::StreamDisconnect(
                                        "session reported a terminal error event".to_string(),
                                    ));
                                }
                                return Ok(events);
                            }
                        }
                        Some(Err(_stream_err)) => {
                            reconnects += 1;
                            if reconnects > config.max_reconnect {
                                return Err(ProviderError::StreamDisconnect(
                                    "reconnect budget exhausted".to_string(),
                                ));
                            }
                            match self.client.status(session_id).await {
                                Ok(SessionStatusKind::Idle) | Ok(SessionStatusKind::Absent) => {
                                    return Ok(events);
                                }
                                _ => {
                                    let backoff = Duration::from_millis(
                                        (500u64 * 2u64.pow(reconnects.min(6))).min(30_000),
                                    );
                                    tokio::time::sleep(backoff).await;
                                    stream = self.client.subscribe().await?;
                                    poll_due = tokio::time::Instant::now() + config.poll_warmup;
                                    continue;
                                }
                            }
                        }
                        None => return Ok(events),
                    }
                }
                _ = tokio::time::sleep(sleep_for) => {
                    if tokio::time::Instant::now() >= poll_due {
                        if let Ok(SessionStatusKind::Idle) = self.client.status(session_id).await {
                            return Ok(events);
                        }
                        poll_due = tokio::time::Instant::now() + config.poll_interval;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl AgentExecutor for EventStreamExecutor {
    async fn execute(&self, config: ExecutionConfig) -> Result<ExecutionResult, ProviderError> {
        let started = std::time::Instant::now();

        let session_id = self.client.create_session(&config.worktree_path).await?;

        let collected = retry_transient(3, || {
            let session_id = session_id.clone();
            let config = config.clone();
            async move {
                // Subscribe before prompting so the idle/done event cannot be
                // missed in the gap between sending the prompt and opening
                // the stream (§4.6 step 1).
                let stream = self.client.subscribe().await?;
                self.client
                    .prompt(&session_id, config.model_override.as_deref(), &config.prompt)
                    .await?;
                self.collect_until_terminal(&session_id, &config, stream).await
            }
        })
        .await?;

        let parsed = crate::result_orchestrator::ResultOrchestrator::parse_events(&collected);

        Ok(ExecutionResult {
            success: parsed.status() == crate::result_orchestrator::ParsedStatus::Success,
            files: parsed.files,
            git_commits: parsed.commits,
            output: String::new(),
            duration: started.elapsed(),
            error: parsed.errors.first().cloned(),
            verification: None,
        })
    }

    async fn health_check(&self) -> Result<HealthStatus, ProviderError> {
        self.client.health_check().await
    }

    fn metadata(&self) -> ExecutorMetadata {
        self.metadata.clone()
    }
}

/// Request/response (chat-completion-style) provider executor: no event
/// subscription, a single synchronous round trip per prompt. Events are
/// synthesized from the response body so the same parsing path (tool-call
/// extraction) applies uniformly (§9 "share code via small helpers").
pub struct RequestResponseExecutor {
    client: Arc<dyn AgentClient>,
    metadata: ExecutorMetadata,
}

impl RequestResponseExecutor {
    pub fn new(client: Arc<dyn AgentClient>, metadata: ExecutorMetadata) -> Self {
        Self { client, metadata }
    }
}

#[async_trait]
impl AgentExecutor for RequestResponseExecutor {
    async fn execute(&self, config: ExecutionConfig) -> Result<ExecutionResult, ProviderError> {
        let started = std::time::Instant::now();
        let session_id = self.client.create_session(&config.worktree_path).await?;

        retry_transient(3, || {
            let session_id = session_id.clone();
            let config = config.clone();
            async move {
                self.client
                    .prompt(&session_id, config.model_override.as_deref(), &config.prompt)
                    .await
            }
        })
        .await?;

        let status = self.client.status(&session_id).await?;
        if status != SessionStatusKind::Idle {
            return Err(ProviderError::StreamDisconnect(
                "request/response provider did not reach idle after prompt".to_string(),
            ));
        }

        Ok(ExecutionResult {
            success: true,
            files: Vec::new(),
            git_commits: Vec::new(),
            output: String::new(),
            duration: started.elapsed(),
            error: None,
            verification: None,
        })
    }

    async fn health_check(&self) -> Result<HealthStatus, ProviderError> {
        self.client.health_check().await
    }

    fn metadata(&self) -> ExecutorMetadata {
        self.metadata.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::events::{EventStatus, ToolCall};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedClient {
        events: Vec<AgentEvent>,
        statuses: Vec<SessionStatusKind>,
        status_calls: AtomicUsize,
    }

    #[async_trait]
    impl AgentClient for ScriptedClient {
        async fn create_session(&self, _dir: &str) -> Result<String, ProviderError> {
            Ok("sess-1".to_string())
        }

        async fn prompt(&self, _session_id: &str, _model: Option<&str>, _parts: &str) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn abort(&self, _session_id: &str) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn status(&self, _session_id: &str) -> Result<SessionStatusKind, ProviderError> {
            let idx = self.status_calls.fetch_add(1, Ordering::SeqCst);
            Ok(*self.statuses.get(idx).unwrap_or(&SessionStatusKind::Running))
        }

        async fn subscribe(&self) -> Result<EventStream, ProviderError> {
            let (tx, rx) = mpsc::channel(16);
            for event in self.events.clone() {
                tx.send(Ok(event)).await.ok();
            }
            Ok(rx)
        }

        async fn health_check(&self) -> Result<HealthStatus, ProviderError> {
            Ok(HealthStatus { healthy: true, latency_ms: Some(1), error: None })
        }
    }

    #[tokio::test]
    async fn event_stream_executor_reports_success_on_commit_event() {
        let client = ScriptedClient {
            events: vec![
                AgentEvent::ToolCall {
                    session_id: "sess-1".into(),
                    call: ToolCall::GitCommit { message: "ROM-1 fix".into(), output: "abcdef1".into() },
                },
                AgentEvent::SessionStatus { session_id: "sess-1".into(), status: EventStatus::Idle },
            ],
            statuses: vec![],
            status_calls: AtomicUsize::new(0),
        };

        let executor = EventStreamExecutor::new(
            Arc::new(client),
            ExecutorMetadata { provider_type: "test".into(), name: "test-provider".into() },
        );

        let result = executor
            .execute(ExecutionConfig {
                timeout: Duration::from_secs(2),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.git_commits.len(), 1);
    }

    #[tokio::test]
    async fn event_stream_executor_propagates_terminal_error() {
        let client = ScriptedClient {
            events: vec![AgentEvent::SessionError { session_id: "sess-1".into(), message: "boom".into() }],
            statuses: vec![],
            status_calls: AtomicUsize::new(0),
        };

        let executor = EventStreamExecutor::new(
            Arc::new(client),
            ExecutorMetadata { provider_type: "test".into(), name: "test-provider".into() },
        );

        let result = executor
            .execute(ExecutionConfig { timeout: Duration::from_secs(2), ..Default::default() })
            .await;

        assert!(result.is_err());
    }
}
