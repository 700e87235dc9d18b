//! Multi-priority repository routing from a parsed webhook (§4.8).
//!
//! First match wins across a fixed priority ladder: cache hit, description
//! tag, routing label, project, team key, team prefix, catch-all, then a
//! single-repository workspace fallback. Ambiguity is reported upward as
//! `RouteResult::NeedsSelection` with a pending elicitation recorded for the
//! eventual human response (§9 "Elicitation / pending selections").

use std::collections::HashMap;
use std::sync::Mutex;

use regex::Regex;

use crate::types::{PendingElicitation, Repository, RouteMethod, RouteResult, WorkItem};

/// Owns the `issueId → repositoryId` cache and the pending-elicitation map
/// (§3 ownership table).
pub struct RepositoryRouter {
    repositories: Vec<Repository>,
    issue_repo_cache: Mutex<HashMap<String, String>>,
    pending: Mutex<HashMap<String, PendingElicitation>>,
    description_tag: Regex,
}

impl RepositoryRouter {
    pub fn new(repositories: Vec<Repository>) -> Self {
        let catch_alls = repositories.iter().filter(|r| r.is_catch_all()).count();
        if catch_alls > 1 {
            tracing::warn!(count = catch_alls, "more than one catch-all repository configured; only the first encountered will ever be selected by the catch-all step");
        }
        Self {
            repositories,
            issue_repo_cache: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            description_tag: Regex::new(r"\\?\[repo=([A-Za-z0-9_\-/.]+)\]").expect("static regex is valid"),
        }
    }

    fn repository_by_id(&self, id: &str) -> Option<&Repository> {
        self.repositories.iter().find(|r| r.id == id)
    }

    fn remember(&self, issue_id: &str, repository_id: &str) {
        self.issue_repo_cache.lock().unwrap().insert(issue_id.to_string(), repository_id.to_string());
    }

    fn cached(&self, issue_id: &str) -> Option<Repository> {
        let repo_id = {
            let cache = self.issue_repo_cache.lock().unwrap();
            cache.get(issue_id).cloned()
        };
        let repo_id = repo_id?;
        match self.repository_by_id(&repo_id) {
            Some(repo) => Some(repo.clone()),
            None => {
                // Stale entry: the repository it pointed at no longer exists.
                self.issue_repo_cache.lock().unwrap().remove(issue_id);
                None
            }
        }
    }

    fn by_description_tag(&self, description: &str) -> Option<&Repository> {
        let captures = self.description_tag.captures(description)?;
        let value = captures.get(1)?.as_str();
        self.repositories.iter().find(|r| {
            r.github_url.as_deref().is_some_and(|url| url.contains(value))
                || r.name.eq_ignore_ascii_case(value)
                || r.id == value
        })
    }

    fn by_routing_label(&self, labels: &[String]) -> Option<&Repository> {
        self.repositories.iter().find(|r| labels.iter().any(|l| r.routing_labels.contains(l)))
    }

    fn by_project(&self, project: &str) -> Option<&Repository> {
        self.repositories.iter().find(|r| r.project_keys.contains(project))
    }

    fn by_team_key(&self, team_key: &str) -> Option<&Repository> {
        self.repositories.iter().find(|r| r.team_keys.contains(team_key))
    }

    fn by_team_prefix(&self, identifier: &str) -> Option<&Repository> {
        let prefix = identifier.split('-').next()?;
        self.repositories.iter().find(|r| r.team_keys.contains(prefix))
    }

    fn catch_all(&self) -> Option<&Repository> {
        self.repositories.iter().find(|r| r.is_catch_all())
    }

    /// Runs the priority ladder (§4.8, steps 0-6) plus the single-repository
    /// workspace fallback. `team_key` is whatever the webhook carried
    /// directly (step 4); `agent_session_id` is only needed so an ambiguous
    /// result can be recorded for a later `select_from_response`.
    pub fn route(&self, work_item: &WorkItem, team_key: Option<&str>, agent_session_id: Option<&str>) -> RouteResult {
        if let Some(repo) = self.cached(&work_item.id) {
            return RouteResult::Selected { repository: repo, method: RouteMethod::Cached };
        }

        if let Some(repo) = work_item.description.as_deref().and_then(|d| self.by_description_tag(d)) {
            let repo = repo.clone();
            self.remember(&work_item.id, &repo.id);
            return RouteResult::Selected { repository: repo, method: RouteMethod::DescriptionTag };
        }

        if let Some(repo) = self.by_routing_label(&work_item.labels) {
            let repo = repo.clone();
            self.remember(&work_item.id, &repo.id);
            return RouteResult::Selected { repository: repo, method: RouteMethod::Label };
        }

        if let Some(repo) = work_item.project.as_deref().and_then(|p| self.by_project(p)) {
            let repo = repo.clone();
            self.remember(&work_item.id, &repo.id);
            return RouteResult::Selected { repository: repo, method: RouteMethod::Project };
        }

        if let Some(repo) = team_key.and_then(|t| self.by_team_key(t)) {
            let repo = repo.clone();
            self.remember(&work_item.id, &repo.id);
            return RouteResult::Selected { repository: repo, method: RouteMethod::Team };
        }

        if let Some(repo) = self.by_team_prefix(&work_item.identifier) {
            let repo = repo.clone();
            self.remember(&work_item.id, &repo.id);
            return RouteResult::Selected { repository: repo, method: RouteMethod::TeamPrefix };
        }

        if let Some(repo) = self.catch_all() {
            let repo = repo.clone();
            self.remember(&work_item.id, &repo.id);
            return RouteResult::Selected { repository: repo, method: RouteMethod::CatchAll };
        }

        if self.repositories.len() == 1 {
            let repo = self.repositories[0].clone();
            self.remember(&work_item.id, &repo.id);
            return RouteResult::Selected { repository: repo, method: RouteMethod::WorkspaceFallback };
        }

        if self.repositories.is_empty() {
            return RouteResult::None;
        }

        let candidates = self.repositories.clone();
        if let Some(session_id) = agent_session_id {
            self.pending.lock().unwrap().insert(
                session_id.to_string(),
                PendingElicitation { issue_id: work_item.id.clone(), candidates: candidates.clone() },
            );
        }
        RouteResult::NeedsSelection { candidates }
    }

    /// Resolves a pending elicitation once the human's answer arrives
    /// (§4.8). Matches `value` against `githubUrl` then `name`; an
    /// unrecognized value falls back to the first candidate rather than
    /// leaving the issue stuck unrouted. Clears the pending entry either way.
    pub fn select_from_response(&self, agent_session_id: &str, value: &str) -> Option<RouteResult> {
        let pending = self.pending.lock().unwrap().remove(agent_session_id)?;
        let chosen = pending
            .candidates
            .iter()
            .find(|r| r.github_url.as_deref().is_some_and(|url| url.contains(value)))
            .or_else(|| pending.candidates.iter().find(|r| r.name.eq_ignore_ascii_case(value)))
            .or_else(|| pending.candidates.first())?
            .clone();

        self.remember(&pending.issue_id, &chosen.id);
        Some(RouteResult::Selected { repository: chosen, method: RouteMethod::Cached })
    }

    /// Drops every pending elicitation. Called at process shutdown (§9: "no
    /// timers; stale entries are acceptable and cleaned at process
    /// shutdown").
    pub fn clear_pending_elicitations(&self) {
        self.pending.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn repo(id: &str, name: &str) -> Repository {
        Repository {
            id: id.to_string(),
            name: name.to_string(),
            local_path: format!("/repos/{id}").into(),
            base_branch: "main".to_string(),
            routing_labels: HashSet::new(),
            project_keys: HashSet::new(),
            team_keys: HashSet::new(),
            linear_workspace_id: "ws".to_string(),
            github_url: Some(format!("org/{id}")),
        }
    }

    fn work_item(id: &str, identifier: &str, description: Option<&str>) -> WorkItem {
        WorkItem {
            id: id.to_string(),
            identifier: identifier.to_string(),
            title: "title".to_string(),
            description: description.map(|d| d.to_string()),
            labels: vec![],
            project: None,
            team_key: None,
            state: "backlog".to_string(),
        }
    }

    #[test]
    fn description_tag_wins_over_catch_all() {
        let mut beta = repo("r2", "beta");
        beta.github_url = None;
        let router = RepositoryRouter::new(vec![repo("r1", "alpha"), beta]);

        let item = work_item("ROM-1", "ROM-1", Some("please fix this [repo=beta] thanks"));
        let result = router.route(&item, None, None);

        match result {
            RouteResult::Selected { repository, method } => {
                assert_eq!(repository.name, "beta");
                assert_eq!(method, RouteMethod::DescriptionTag);
            }
            other => panic!("expected Selected, got {other:?}"),
        }
    }

    #[test]
    fn escaped_description_tag_is_also_recognized() {
        let router = RepositoryRouter::new(vec![repo("r1", "alpha")]);
        let item = work_item("ROM-2", "ROM-2", Some(r"route me via \[repo=alpha\]"));
        let result = router.route(&item, None, None);
        assert!(matches!(result, RouteResult::Selected { method: RouteMethod::DescriptionTag, .. }));
    }

    #[test]
    fn catch_all_is_selected_when_nothing_else_matches() {
        let mut catch_all = repo("r1", "alpha");
        catch_all.github_url = None;
        let mut scoped = repo("r2", "beta");
        scoped.team_keys.insert("BETA".to_string());

        let router = RepositoryRouter::new(vec![scoped, catch_all]);
        let item = work_item("ROM-3", "ROM-3", None);
        let result = router.route(&item, None, None);
        assert!(matches!(result, RouteResult::Selected { method: RouteMethod::CatchAll, .. }));
    }

    #[test]
    fn single_repository_workspace_falls_back_without_any_routing_metadata() {
        let mut scoped = repo("r1", "alpha");
        scoped.team_keys.insert("ALPHA".to_string());
        let router = RepositoryRouter::new(vec![scoped]);
        let item = work_item("ROM-4", "ROM-4", None);
        let result = router.route(&item, None, None);
        assert!(matches!(result, RouteResult::Selected { method: RouteMethod::WorkspaceFallback, .. }));
    }

    #[test]
    fn ambiguous_multi_repo_with_no_match_needs_selection_and_records_pending() {
        let mut alpha = repo("r1", "alpha");
        alpha.team_keys.insert("ALPHA".to_string());
        let mut beta = repo("r2", "beta");
        beta.team_keys.insert("BETA".to_string());

        let router = RepositoryRouter::new(vec![alpha, beta]);
        let item = work_item("ROM-5", "ROM-5", None);
        let result = router.route(&item, None, Some("session-1"));
        assert!(matches!(result, RouteResult::NeedsSelection { .. }));

        let resolved = router.select_from_response("session-1", "beta").unwrap();
        match resolved {
            RouteResult::Selected { repository, .. } => assert_eq!(repository.name, "beta"),
            other => panic!("expected Selected, got {other:?}"),
        }
    }

    #[test]
    fn cache_hit_short_circuits_full_routing_and_stale_entries_are_evicted() {
        let catch_all = {
            let mut r = repo("r1", "alpha");
            r.github_url = None;
            r
        };
        let router = RepositoryRouter::new(vec![catch_all]);
        let item = work_item("ROM-6", "ROM-6", None);

        let first = router.route(&item, None, None);
        assert!(matches!(first, RouteResult::Selected { method: RouteMethod::CatchAll, .. }));

        let second = router.route(&item, None, None);
        assert!(matches!(second, RouteResult::Selected { method: RouteMethod::Cached, .. }));

        router.issue_repo_cache.lock().unwrap().insert("ROM-6".to_string(), "deleted-repo".to_string());
        let third = router.route(&item, None, None);
        assert!(matches!(third, RouteResult::Selected { method: RouteMethod::CatchAll, .. }));
    }

    #[test]
    fn team_prefix_matches_identifier_prefix() {
        let mut scoped = repo("r1", "alpha");
        scoped.team_keys.insert("ROM".to_string());
        let mut other = repo("r2", "beta");
        other.team_keys.insert("OTHER".to_string());

        let router = RepositoryRouter::new(vec![other, scoped]);
        let item = work_item("ROM-7", "ROM-7", None);
        let result = router.route(&item, None, None);
        assert!(matches!(result, RouteResult::Selected { method: RouteMethod::TeamPrefix, repository } if repository.name == "alpha"));
    }
}
