//! Top-level orchestration pipeline (§4.11).
//!
//! Wires every other module together: route → submit → worktree → agent
//! execution (with provider failover) → verify → commit enforcement → push
//! → issue-tracker status update → cleanup. One `Orchestrator::handle` call
//! per inbound webhook; one `Orchestrator::run_session` per admitted
//! `SessionConfig`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as SyncMutex};

use regex::Regex;
use tokio::sync::Mutex as AsyncMutex;

use crate::errors::{IssueTrackerError, OrchestratorError, VerificationError};
use crate::issue_tracker::IssueTrackerClient;
use crate::providers::executor::{AgentExecutor, ExecutionConfig};
use crate::providers::router::ProviderRouter;
use crate::repository::RepositoryRouter;
use crate::result_orchestrator::ResultOrchestrator;
use crate::scheduler::{Scheduler, SubmitDisposition};
use crate::session::{dedup_record_from_session, new_session_record, SessionStore};
use crate::types::{AgentSessionAction, Repository, RouteMethod, RouteResult, SessionConfig, Webhook, WorkItem, WorktreeMode};
use crate::worktree::{CreateOptions, WorktreeManager};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Started,
    Queued,
    Duplicate,
    NeedsSelection,
    RoutingFailed,
    Ignored,
    Done { commit_sha: Option<String> },
    Failed { reason: String },
}

#[derive(Debug, Clone)]
pub struct FailoverConfig {
    pub max_provider_retries: u32,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self { max_provider_retries: 2 }
    }
}

pub struct Orchestrator {
    repository_router: Arc<RepositoryRouter>,
    scheduler: Arc<Scheduler>,
    worktree_manager: Arc<WorktreeManager>,
    provider_router: Arc<ProviderRouter>,
    executors: HashMap<String, Arc<dyn AgentExecutor>>,
    issue_tracker: Arc<IssueTrackerClient>,
    result_orchestrator: Arc<ResultOrchestrator>,
    git: crate::git::GitService,
    session_store: Arc<SessionStore>,
    config: FailoverConfig,
    status_mutexes: SyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    finalized: SyncMutex<HashSet<String>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repository_router: Arc<RepositoryRouter>,
        scheduler: Arc<Scheduler>,
        worktree_manager: Arc<WorktreeManager>,
        provider_router: Arc<ProviderRouter>,
        executors: HashMap<String, Arc<dyn AgentExecutor>>,
        issue_tracker: Arc<IssueTrackerClient>,
        result_orchestrator: Arc<ResultOrchestrator>,
        git: crate::git::GitService,
        session_store: Arc<SessionStore>,
        config: FailoverConfig,
    ) -> Self {
        Self {
            repository_router,
            scheduler,
            worktree_manager,
            provider_router,
            executors,
            issue_tracker,
            result_orchestrator,
            git,
            session_store,
            config,
            status_mutexes: SyncMutex::new(HashMap::new()),
            finalized: SyncMutex::new(HashSet::new()),
        }
    }

    fn status_lock(&self, issue_id: &str) -> Arc<AsyncMutex<()>> {
        self.status_mutexes
            .lock()
            .unwrap()
            .entry(issue_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn is_finalized(&self, issue_id: &str) -> bool {
        self.finalized.lock().unwrap().contains(issue_id)
    }

    fn mark_finalized(&self, issue_id: &str) {
        self.finalized.lock().unwrap().insert(issue_id.to_string());
    }

    /// Resolves one inbound webhook into a `WorkItem` plus routing hints.
    /// Entity events already carry the full item; the lighter shapes fetch it
    /// from the tracker (§6 "Inbound webhooks").
    async fn resolve_work_item(
        &self,
        webhook: &Webhook,
    ) -> Result<Option<(WorkItem, Option<String>, Option<String>)>, IssueTrackerError> {
        match webhook {
            Webhook::Entity { work_item } => Ok(Some((work_item.clone(), work_item.team_key.clone(), None))),
            Webhook::Notification { issue_id, team, .. } => {
                let item = self.issue_tracker.get_issue(issue_id).await?;
                Ok(Some((item, team.as_ref().map(|t| t.key.clone()), None)))
            }
            Webhook::AgentSession { action, agent_session_id, issue_id, team, response_value, .. } => match action {
                AgentSessionAction::Response => {
                    let value = response_value.clone().unwrap_or_default();
                    if let Some(RouteResult::Selected { .. }) =
                        self.repository_router.select_from_response(agent_session_id, &value)
                    {
                        let item = self.issue_tracker.get_issue(issue_id).await?;
                        Ok(Some((item, team.as_ref().map(|t| t.key.clone()), Some(agent_session_id.clone()))))
                    } else {
                        Ok(None)
                    }
                }
                AgentSessionAction::Created | AgentSessionAction::Prompted => Ok(None),
            },
        }
    }

    /// Entry point for one inbound webhook (§4.11 steps 1-2).
    pub async fn handle(&self, webhook: Webhook) -> Result<Disposition, OrchestratorError> {
        let Some((work_item, team_key, agent_session_id)) = self.resolve_work_item(&webhook).await? else {
            return Ok(Disposition::Ignored);
        };

        if self.is_finalized(&work_item.id) {
            return Ok(Disposition::Duplicate);
        }

        let route = self.repository_router.route(&work_item, team_key.as_deref(), agent_session_id.as_deref());
        let (repository, method) = match route {
            RouteResult::None => {
                let _ = self
                    .issue_tracker
                    .post_comment(&work_item.id, "No repository matched this issue; orchestration could not start.")
                    .await;
                return Ok(Disposition::RoutingFailed);
            }
            RouteResult::NeedsSelection { candidates } => {
                let names: Vec<&str> = candidates.iter().map(|r| r.name.as_str()).collect();
                let _ = self
                    .issue_tracker
                    .post_comment(&work_item.id, &format!("Multiple repositories matched; please choose one: {}", names.join(", ")))
                    .await;
                return Ok(Disposition::NeedsSelection);
            }
            RouteResult::Selected { repository, method } => (repository, method),
        };

        let session_config =
            SessionConfig { issue_id: work_item.id.clone(), work_item: work_item.clone(), repository_id: repository.id.clone() };

        match self.scheduler.submit(session_config) {
            SubmitDisposition::Duplicate => Ok(Disposition::Duplicate),
            SubmitDisposition::Queued => Ok(Disposition::Queued),
            SubmitDisposition::Started => {
                let outcome = self.run_session(work_item, repository, method).await;
                Ok(self.finish_and_promote(outcome))
            }
        }
    }

    /// Converts a completed run's outcome into the caller-facing disposition
    /// and drives the scheduler's promotion of the next queued item, if any.
    /// The caller is responsible for actually running a promoted item (the
    /// Scheduler never runs anything itself); production wiring spawns
    /// `run_promoted` in the background.
    fn finish_and_promote(&self, outcome: (String, Result<Option<String>, String>)) -> Disposition {
        let (issue_id, result) = outcome;
        let promoted = match &result {
            Ok(_) => self.scheduler.complete(&issue_id),
            Err(_) => self.scheduler.fail(&issue_id),
        };
        if let Some(next) = promoted {
            tracing::info!(issue_id = %next.issue_id, "promoting queued session to active");
        }
        match result {
            Ok(commit_sha) => Disposition::Done { commit_sha },
            Err(reason) => Disposition::Failed { reason },
        }
    }

    /// Runs the full pipeline for one admitted `SessionConfig` (§4.11 steps
    /// 3-12). Returns `(issue_id, Ok(commit_sha))` on success or
    /// `(issue_id, Err(reason))` on terminal failure; never panics on a
    /// collaborator error, always reaches a terminal issue-tracker update.
    pub async fn run_session(
        &self,
        work_item: WorkItem,
        repository: Repository,
        method: RouteMethod,
    ) -> (String, Result<Option<String>, String>) {
        let issue_id = work_item.id.clone();
        let span = crate::telemetry::create_orchestration_span(
            "run_session",
            Some(&issue_id),
            Some(&repository.id),
            None,
        );
        let _entered = span.enter();
        tracing::info!(method = ?method, "routing resolved");

        let status_lock = self.status_lock(&issue_id);
        let _status_guard = status_lock.lock().await;

        let worktree = match self
            .worktree_manager
            .create(CreateOptions {
                issue_id: issue_id.clone(),
                repository_path: repository.local_path.clone(),
                base_branch: repository.base_branch.clone(),
                branch_name: crate::types::branch_name(&issue_id, &work_item.title),
                mode: WorktreeMode::Main,
                symlinks: Vec::new(),
            })
            .await
        {
            Ok(w) => w,
            Err(e) => {
                self.terminal_failure(&issue_id, work_item.team_key.as_deref(), None, &e.to_string(), false).await;
                return (issue_id, Err(e.to_string()));
            }
        };

        let worktree_path = worktree.worktree_path.to_string_lossy().to_string();
        self.git.sync_to_remote(&worktree_path, &repository.base_branch).await;
        let baseline_commit = worktree.base_commit.clone();

        let session_record = new_session_record(uuid::Uuid::new_v4().to_string(), issue_id.clone(), repository.id.clone(), &worktree.worktree_path);
        let _ = self.session_store.write_dedup(&dedup_record_from_session(&session_record)).await;
        let _ = self.session_store.write_detail(&session_record).await;

        if let Err(e) = self.issue_tracker.update_issue_state(&issue_id, "in_progress").await {
            tracing::warn!(error = %e, "issue tracker update to in_progress failed; continuing orchestration");
        }

        let model_override = parse_model_override(work_item.description.as_deref());
        let outcome = self.execute_with_failover(&work_item, &worktree_path, model_override.as_deref()).await;

        let result = match outcome {
            Some(execution) => self.verify_and_finalize(&issue_id, &repository, &worktree_path, baseline_commit.as_deref(), execution).await,
            None => Err("all configured providers failed".to_string()),
        };

        match &result {
            Ok(commit_sha) => self.terminal_success(&issue_id, work_item.team_key.as_deref(), commit_sha.clone()).await,
            Err(reason) => self.terminal_failure(&issue_id, work_item.team_key.as_deref(), Some(&worktree_path), reason, true).await,
        }

        (issue_id, result)
    }

    /// Loops over enabled, healthy providers in priority order; retries the
    /// whole provider step up to `max_provider_retries` times, prepending the
    /// previous failure to the prompt on each attempt, before moving to the
    /// next provider (§4.11 step 7, §7).
    async fn execute_with_failover(
        &self,
        work_item: &WorkItem,
        worktree_path: &str,
        model_override: Option<&str>,
    ) -> Option<crate::types::ExecutionResult> {
        let mut prompt = build_prompt(work_item, worktree_path);

        for provider in self.provider_router.enabled_providers() {
            let Some(executor) = self.executors.get(&provider.name) else {
                continue;
            };

            let mut attempt = 0;
            loop {
                attempt += 1;
                let config = ExecutionConfig { worktree_path: worktree_path.to_string(), prompt: prompt.clone(), model_override: model_override.map(str::to_string), ..Default::default() };

                let outcome = self
                    .provider_router
                    .execute_guarded(&provider.name, || {
                        let executor = executor.clone();
                        let config = config.clone();
                        async move { executor.execute(config).await }
                    })
                    .await;

                match outcome {
                    Ok(result) if result.success => return Some(result),
                    Ok(result) => {
                        let err = result.error.clone().unwrap_or_else(|| "execution did not report success".to_string());
                        tracing::warn!(provider = %provider.name, attempt, error = %err, "provider execution unsuccessful");
                        if attempt >= self.config.max_provider_retries {
                            break;
                        }
                        prompt = format!("[Previous attempt failed with: {err}]\n{}", build_prompt(work_item, worktree_path));
                    }
                    Err(e) => {
                        tracing::warn!(provider = %provider.name, attempt, error = %e, "provider execution errored");
                        if attempt >= self.config.max_provider_retries {
                            break;
                        }
                        prompt = format!("[Previous attempt failed with: {e}]\n{}", build_prompt(work_item, worktree_path));
                    }
                }
            }
        }

        None
    }

    async fn verify_and_finalize(
        &self,
        issue_id: &str,
        repository: &Repository,
        worktree_path: &str,
        baseline_commit: Option<&str>,
        _execution: crate::types::ExecutionResult,
    ) -> Result<Option<String>, String> {
        // Enforce commit before verifying: any uncommitted changes are
        // auto-committed with the issue-tagged message (§4.11 step 9).
        if self.git.has_uncommitted_changes(worktree_path).await {
            let message = format!("agent: {issue_id} - automated commit");
            if let Err(e) = self.git.commit(worktree_path, &message, true, true).await {
                return Err(format!("commit enforcement failed: {e}"));
            }
        }

        let verification = self.result_orchestrator.verify(worktree_path, baseline_commit, issue_id).await;
        let report = match verification {
            Ok(report) => report,
            Err(VerificationError::Failed(report)) => {
                return Err(format!("verification failed: {:?}", report.checks));
            }
        };

        if let Err(e) = self.git.push_to_ref(worktree_path, &repository.base_branch).await {
            tracing::warn!(error = %e, "push to remote failed; commit remains local");
        }

        Ok(report.current_commit)
    }

    async fn terminal_success(&self, issue_id: &str, team_key: Option<&str>, commit_sha: Option<String>) {
        if self.is_finalized(issue_id) {
            return;
        }
        if let Err(e) = self.issue_tracker.update_issue_state(issue_id, "done").await {
            tracing::warn!(error = %e, "issue tracker update to done failed");
        }
        let _ = self.issue_tracker.post_comment(
            issue_id,
            &format!("Agent completed this issue. Commit: {}", commit_sha.as_deref().unwrap_or("none")),
        ).await;
        if let Some(team_key) = team_key {
            if let Err(e) = self.issue_tracker.add_label(issue_id, team_key, "agent:executed").await {
                tracing::warn!(error = %e, "failed to add agent:executed label");
            }
        }
        let _ = self.worktree_manager.cleanup(issue_id, false).await;
        self.mark_finalized(issue_id);
    }

    async fn terminal_failure(&self, issue_id: &str, team_key: Option<&str>, worktree_path: Option<&str>, reason: &str, preserve: bool) {
        if self.is_finalized(issue_id) {
            return;
        }
        if let Err(e) = self.issue_tracker.update_issue_state(issue_id, "failed").await {
            tracing::warn!(error = %e, "issue tracker update to failed failed");
        }
        let body = match worktree_path {
            Some(path) => format!("Agent failed: {reason}\nWorktree preserved at {path}"),
            None => format!("Agent failed: {reason}"),
        };
        let _ = self.issue_tracker.post_comment(issue_id, &body).await;
        if let Some(team_key) = team_key {
            if let Err(e) = self.issue_tracker.add_label(issue_id, team_key, "agent:failed").await {
                tracing::warn!(error = %e, "failed to add agent:failed label");
            }
        }
        if preserve {
            let _ = self.worktree_manager.cleanup(issue_id, true).await;
        }
        self.mark_finalized(issue_id);
    }
}

/// Parses an optional `[model=...]` tag out of the issue description into a
/// model override for the execution config, mirroring the `[repo=...]` tag
/// convention `RepositoryRouter` uses for routing (§4.11 step 7b).
fn parse_model_override(description: Option<&str>) -> Option<String> {
    static MODEL_TAG: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = MODEL_TAG.get_or_init(|| Regex::new(r"\[model=([A-Za-z0-9_\-/.]+)\]").expect("static regex is valid"));
    re.captures(description?)?.get(1).map(|m| m.as_str().to_string())
}

fn build_prompt(work_item: &WorkItem, worktree_path: &str) -> String {
    format!(
        "Issue {} ({}): {}\n\nDescription:\n{}\n\nLabels: {}\nWorking directory: {worktree_path}\n\nMake the necessary code changes and commit them with a message referencing {}.",
        work_item.identifier,
        work_item.id,
        work_item.title,
        work_item.description.as_deref().unwrap_or("(none)"),
        work_item.labels.join(", "),
        work_item.identifier,
    )
}
