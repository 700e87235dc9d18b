//! GraphQL-over-HTTP client for the external issue tracker (§4.5).
//!
//! Layered the same way the provider-facing HTTP machinery is elsewhere in
//! the crate: a hand-rolled sliding-window request budget (an exact count
//! over a rolling hour, not a refill-rate approximation) plus `moka` TTL
//! caches for anything that rarely changes.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::errors::IssueTrackerError;
use crate::types::WorkItem;

const DEFAULT_REQUEST_BUDGET: usize = 4500;
const BUDGET_WINDOW: Duration = Duration::from_secs(60 * 60);
const CACHE_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone)]
pub struct IssueTrackerConfig {
    pub endpoint: String,
    pub api_token: String,
    pub request_budget: usize,
    pub max_retries: u32,
    pub timeout: Duration,
}

impl Default for IssueTrackerConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.linear.app/graphql".to_string(),
            api_token: String::new(),
            request_budget: DEFAULT_REQUEST_BUDGET,
            max_retries: 3,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Sliding 1-hour window over request timestamps, pruned on every check
/// (§4.5 "prune expired timestamps").
struct RequestBudget {
    window: Duration,
    limit: usize,
    timestamps: Mutex<std::collections::VecDeque<Instant>>,
}

impl RequestBudget {
    fn new(limit: usize, window: Duration) -> Self {
        Self { window, limit, timestamps: Mutex::new(std::collections::VecDeque::new()) }
    }

    fn try_acquire(&self) -> Result<(), IssueTrackerError> {
        let now = Instant::now();
        let mut timestamps = self.timestamps.lock().unwrap();
        while let Some(&front) = timestamps.front() {
            if now.duration_since(front) >= self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }

        if timestamps.len() >= self.limit {
            let oldest = *timestamps.front().expect("len >= limit > 0");
            let retry_after = self.window.saturating_sub(now.duration_since(oldest));
            return Err(IssueTrackerError::BudgetExhausted { retry_after_secs: retry_after.as_secs() });
        }

        timestamps.push_back(now);
        Ok(())
    }
}

/// Reactive rate-limit gate: a single shared deadline set by a 429 response,
/// consulted before every request (§4.5 "fail fast ... until it expires").
#[derive(Default)]
struct RateLimitGate {
    until: Mutex<Option<Instant>>,
}

impl RateLimitGate {
    fn check(&self) -> Result<(), IssueTrackerError> {
        let guard = self.until.lock().unwrap();
        if let Some(deadline) = *guard {
            let now = Instant::now();
            if now < deadline {
                return Err(IssueTrackerError::RateLimited { retry_after_secs: (deadline - now).as_secs() });
            }
        }
        Ok(())
    }

    fn trip(&self, retry_after: Duration) {
        *self.until.lock().unwrap() = Some(Instant::now() + retry_after);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WorkflowStateCacheEntry {
    id: String,
    name: String,
}

/// Thin GraphQL-over-HTTP wrapper; there is no official Rust SDK for the
/// target tracker, so requests are assembled and POSTed directly (§4.5).
pub struct IssueTrackerClient {
    http: Client,
    config: IssueTrackerConfig,
    budget: RequestBudget,
    rate_limit: RateLimitGate,
    workflow_states: moka::future::Cache<String, Arc<Vec<WorkflowStateCacheEntry>>>,
    team_labels: moka::future::Cache<String, Arc<Vec<(String, String)>>>,
}

impl IssueTrackerClient {
    pub fn new(config: IssueTrackerConfig) -> Self {
        let http = Client::builder().timeout(config.timeout).build().expect("reqwest client builds");
        Self {
            http,
            budget: RequestBudget::new(config.request_budget, BUDGET_WINDOW),
            rate_limit: RateLimitGate::default(),
            workflow_states: moka::future::Cache::builder().time_to_live(CACHE_TTL).max_capacity(256).build(),
            team_labels: moka::future::Cache::builder().time_to_live(CACHE_TTL).max_capacity(256).build(),
            config,
        }
    }

    fn check_gates(&self) -> Result<(), IssueTrackerError> {
        self.rate_limit.check()?;
        self.budget.try_acquire()
    }

    /// Sends one GraphQL request, retrying transient failures with linear
    /// backoff up to `max_retries`; rate-limit errors propagate immediately
    /// without retry (§4.5).
    async fn execute(&self, query: &str, variables: Value) -> Result<Value, IssueTrackerError> {
        let mut attempt = 0;
        loop {
            self.check_gates()?;
            attempt += 1;

            match self.send(query, &variables).await {
                Ok(value) => return Ok(value),
                Err(IssueTrackerError::RateLimited { retry_after_secs }) => {
                    self.rate_limit.trip(Duration::from_secs(retry_after_secs.max(1)));
                    return Err(IssueTrackerError::RateLimited { retry_after_secs });
                }
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    let delay = self.config.timeout.min(Duration::from_millis(500 * attempt as u64));
                    warn!(attempt, error = %e, "issue tracker request failed, retrying");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send(&self, query: &str, variables: &Value) -> Result<Value, IssueTrackerError> {
        let body = json!({ "query": query, "variables": variables });

        let response = tokio::time::timeout(
            self.config.timeout,
            self.http
                .post(&self.config.endpoint)
                .bearer_auth(&self.config.api_token)
                .json(&body)
                .send(),
        )
        .await
        .map_err(|_| IssueTrackerError::Timeout)?
        .map_err(|e| IssueTrackerError::Network(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(60);
            return Err(IssueTrackerError::RateLimited { retry_after_secs: retry_after });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(IssueTrackerError::Api { status: status.as_u16(), message });
        }

        let payload: Value = response.json().await.map_err(|e| IssueTrackerError::Decode(e.to_string()))?;

        if let Some(errors) = payload.get("errors").and_then(|e| e.as_array()) {
            if let Some(first) = errors.first() {
                let message = first.get("message").and_then(|m| m.as_str()).unwrap_or("unknown error").to_string();
                if message.to_uppercase().contains("RATELIMITED") {
                    return Err(IssueTrackerError::RateLimited { retry_after_secs: 60 });
                }
                return Err(IssueTrackerError::Api { status: status.as_u16(), message });
            }
        }

        Ok(payload.get("data").cloned().unwrap_or(Value::Null))
    }

    fn decode<T: DeserializeOwned>(value: Value, path: &str) -> Result<T, IssueTrackerError> {
        serde_json::from_value(value.clone())
            .map_err(|e| IssueTrackerError::Decode(format!("{path}: {e}")))
    }

    pub async fn update_issue_state(&self, issue_id: &str, state: &str) -> Result<(), IssueTrackerError> {
        let query = "mutation($id: String!, $stateId: String!) { issueUpdate(id: $id, input: { stateId: $stateId }) { success } }";
        self.execute(query, json!({ "id": issue_id, "stateId": state })).await?;
        debug!(issue_id, state, "issue state updated");
        Ok(())
    }

    pub async fn post_comment(&self, issue_id: &str, body: &str) -> Result<(), IssueTrackerError> {
        let query = "mutation($issueId: String!, $body: String!) { commentCreate(input: { issueId: $issueId, body: $body }) { success } }";
        self.execute(query, json!({ "issueId": issue_id, "body": body })).await?;
        Ok(())
    }

    /// Adds `label` to the issue, creating it first (scoped to the issue's
    /// team) if it isn't already in the team label cache (§4.5).
    pub async fn add_label(&self, issue_id: &str, team_key: &str, label: &str) -> Result<(), IssueTrackerError> {
        let label_id = self.resolve_or_create_label(team_key, label).await?;
        let query = "mutation($issueId: String!, $labelId: String!) { issueAddLabel(id: $issueId, labelId: $labelId) { success } }";
        self.execute(query, json!({ "issueId": issue_id, "labelId": label_id })).await?;
        Ok(())
    }

    async fn resolve_or_create_label(&self, team_key: &str, label: &str) -> Result<String, IssueTrackerError> {
        if let Some(labels) = self.team_labels.get(team_key).await {
            if let Some((_, id)) = labels.iter().find(|(name, _)| name == label) {
                return Ok(id.clone());
            }
        }

        let query = "query($team: String!) { team(id: $team) { labels { nodes { id name } } } }";
        let data = self.execute(query, json!({ "team": team_key })).await?;
        let nodes: Vec<Value> = data
            .pointer("/team/labels/nodes")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let mut pairs: Vec<(String, String)> = nodes
            .iter()
            .filter_map(|n| Some((n.get("name")?.as_str()?.to_string(), n.get("id")?.as_str()?.to_string())))
            .collect();

        if let Some((_, id)) = pairs.iter().find(|(name, _)| name == label) {
            let id = id.clone();
            self.team_labels.insert(team_key.to_string(), Arc::new(pairs)).await;
            return Ok(id);
        }

        let create_query = "mutation($team: String!, $name: String!) { labelCreate(input: { teamId: $team, name: $name }) { label { id } } }";
        let created = self.execute(create_query, json!({ "team": team_key, "name": label })).await?;
        let new_id: String = created
            .pointer("/labelCreate/label/id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| IssueTrackerError::Decode("labelCreate.label.id missing".to_string()))?
            .to_string();

        pairs.push((label.to_string(), new_id.clone()));
        self.team_labels.insert(team_key.to_string(), Arc::new(pairs)).await;
        Ok(new_id)
    }

    pub async fn get_issue(&self, issue_id: &str) -> Result<WorkItem, IssueTrackerError> {
        let query = "query($id: String!) { issue(id: $id) { id identifier title description state { name } labels { nodes { name } } project { id } team { key } } }";
        let data = self.execute(query, json!({ "id": issue_id })).await?;
        parse_work_item(data.get("issue").cloned().unwrap_or(Value::Null))
    }

    pub async fn list_issues(&self, filter: Value) -> Result<Vec<WorkItem>, IssueTrackerError> {
        let query = "query($filter: IssueFilter) { issues(filter: $filter) { nodes { id identifier title description state { name } labels { nodes { name } } project { id } team { key } } } }";
        let data = self.execute(query, json!({ "filter": filter })).await?;
        let nodes: Vec<Value> = data.pointer("/issues/nodes").and_then(|v| v.as_array()).cloned().unwrap_or_default();
        nodes.into_iter().map(parse_work_item).collect()
    }

    pub async fn fetch_issue_labels(&self, issue_id: &str) -> Result<Vec<String>, IssueTrackerError> {
        let item = self.get_issue(issue_id).await?;
        Ok(item.labels)
    }

    pub async fn fetch_issue_description(&self, issue_id: &str) -> Result<Option<String>, IssueTrackerError> {
        let item = self.get_issue(issue_id).await?;
        Ok(item.description)
    }

    /// Cached list of workflow states for a team, used to translate a
    /// human-readable status name into the id `update_issue_state` expects.
    pub async fn workflow_state_id(&self, team_key: &str, state_name: &str) -> Result<Option<String>, IssueTrackerError> {
        if let Some(states) = self.workflow_states.get(team_key).await {
            return Ok(states.iter().find(|s| s.name == state_name).map(|s| s.id.clone()));
        }

        let query = "query($team: String!) { team(id: $team) { states { nodes { id name } } } }";
        let data = self.execute(query, json!({ "team": team_key })).await?;
        let nodes: Vec<Value> = data.pointer("/team/states/nodes").and_then(|v| v.as_array()).cloned().unwrap_or_default();
        let states: Vec<WorkflowStateCacheEntry> = nodes
            .into_iter()
            .filter_map(|n| Self::decode::<WorkflowStateCacheEntry>(n, "team.states.nodes").ok())
            .collect();

        let found = states.iter().find(|s| s.name == state_name).map(|s| s.id.clone());
        self.workflow_states.insert(team_key.to_string(), Arc::new(states)).await;
        Ok(found)
    }

    pub async fn clear_caches(&self) {
        self.workflow_states.invalidate_all();
        self.team_labels.invalidate_all();
    }
}

fn parse_work_item(value: Value) -> Result<WorkItem, IssueTrackerError> {
    if value.is_null() {
        return Err(IssueTrackerError::Decode("issue not found".to_string()));
    }
    let labels = value
        .pointer("/labels/nodes")
        .and_then(|v| v.as_array())
        .map(|nodes| nodes.iter().filter_map(|n| n.get("name")?.as_str().map(str::to_string)).collect())
        .unwrap_or_default();

    Ok(WorkItem {
        id: value.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
        identifier: value.get("identifier").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
        title: value.get("title").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
        description: value.get("description").and_then(|v| v.as_str()).map(str::to_string),
        labels,
        project: value.pointer("/project/id").and_then(|v| v.as_str()).map(str::to_string),
        team_key: value.pointer("/team/key").and_then(|v| v.as_str()).map(str::to_string),
        state: value.pointer("/state/name").and_then(|v| v.as_str()).unwrap_or("unknown").to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_budget_fails_fast_once_limit_reached() {
        let budget = RequestBudget::new(2, Duration::from_secs(3600));
        assert!(budget.try_acquire().is_ok());
        assert!(budget.try_acquire().is_ok());
        let err = budget.try_acquire().unwrap_err();
        assert!(matches!(err, IssueTrackerError::BudgetExhausted { .. }));
    }

    #[test]
    fn request_budget_prunes_expired_timestamps() {
        let budget = RequestBudget::new(1, Duration::from_millis(1));
        assert!(budget.try_acquire().is_ok());
        std::thread::sleep(Duration::from_millis(5));
        assert!(budget.try_acquire().is_ok());
    }

    #[test]
    fn rate_limit_gate_blocks_until_deadline_passes() {
        let gate = RateLimitGate::default();
        assert!(gate.check().is_ok());
        gate.trip(Duration::from_millis(50));
        assert!(gate.check().is_err());
        std::thread::sleep(Duration::from_millis(60));
        assert!(gate.check().is_ok());
    }

    #[test]
    fn parse_work_item_extracts_nested_fields() {
        let raw = json!({
            "id": "abc",
            "identifier": "ROM-1",
            "title": "Fix bug",
            "description": "details",
            "state": { "name": "Todo" },
            "labels": { "nodes": [{ "name": "bug" }] },
            "project": { "id": "proj-1" },
            "team": { "key": "ROM" },
        });
        let item = parse_work_item(raw).unwrap();
        assert_eq!(item.identifier, "ROM-1");
        assert_eq!(item.labels, vec!["bug".to_string()]);
        assert_eq!(item.project, Some("proj-1".to_string()));
        assert_eq!(item.team_key, Some("ROM".to_string()));
        assert_eq!(item.state, "Todo");
    }

    #[test]
    fn parse_work_item_rejects_null() {
        assert!(parse_work_item(Value::Null).is_err());
    }

    #[tokio::test]
    async fn update_issue_state_succeeds_against_a_mock_server() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": { "issueUpdate": { "success": true } } })))
            .mount(&server)
            .await;

        let client = IssueTrackerClient::new(IssueTrackerConfig {
            endpoint: format!("{}/graphql", server.uri()),
            api_token: "token".to_string(),
            ..IssueTrackerConfig::default()
        });

        client.update_issue_state("issue-1", "done").await.unwrap();
    }

    #[tokio::test]
    async fn execute_surfaces_rate_limit_and_trips_the_gate_without_retrying() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "1"))
            .mount(&server)
            .await;

        let client = IssueTrackerClient::new(IssueTrackerConfig {
            endpoint: format!("{}/graphql", server.uri()),
            api_token: "token".to_string(),
            max_retries: 3,
            ..IssueTrackerConfig::default()
        });

        let err = client.post_comment("issue-1", "hi").await.unwrap_err();
        assert!(matches!(err, IssueTrackerError::RateLimited { retry_after_secs: 1 }));
        assert!(client.rate_limit.check().is_err());
    }
}
