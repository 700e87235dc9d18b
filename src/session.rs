//! Session lifecycle state machine and on-disk persistence (§3 `Session`,
//! §5 "Persisted state", §6 filesystem layout).
//!
//! The forward-only `started → in_progress → (done | error)` lifecycle is
//! expressed with `statig`, a small state-machine crate chosen over a
//! hand-rolled enum-of-enums so illegal transitions are a compile error
//! rather than a runtime check.
//! Persistence is a thin JSON-to-disk layer: append-only per session, used
//! only for crash recovery and cross-process duplicate detection, never as
//! the runtime source of truth.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use statig::prelude::*;

use crate::types::{CleanupAction, SessionRecord, SessionState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Start,
    Progress,
    Complete { commit_sha: String },
    Fail { error_message: String },
}

/// Drives `SessionRecord.state` forward only; terminal states (`Done`,
/// `Error`) are idempotent sinks rather than dead ends, matching "once in a
/// terminal state, further updates are no-ops" (§8 property 5).
#[derive(Default)]
pub struct SessionLifecycle {
    pub record: Option<SessionRecord>,
}

#[state_machine(initial = "State::started()")]
impl SessionLifecycle {
    #[state]
    fn started(&mut self, event: &SessionEvent) -> Outcome<State> {
        match event {
            SessionEvent::Progress => {
                self.touch(SessionState::InProgress, None, None);
                Transition(State::in_progress())
            }
            SessionEvent::Complete { commit_sha } => {
                self.touch(SessionState::Done, Some(commit_sha.clone()), None);
                Transition(State::done())
            }
            SessionEvent::Fail { error_message } => {
                self.touch(SessionState::Error, None, Some(error_message.clone()));
                Transition(State::error())
            }
            SessionEvent::Start => Handled,
        }
    }

    #[state]
    fn in_progress(&mut self, event: &SessionEvent) -> Outcome<State> {
        match event {
            SessionEvent::Complete { commit_sha } => {
                self.touch(SessionState::Done, Some(commit_sha.clone()), None);
                Transition(State::done())
            }
            SessionEvent::Fail { error_message } => {
                self.touch(SessionState::Error, None, Some(error_message.clone()));
                Transition(State::error())
            }
            SessionEvent::Start | SessionEvent::Progress => Handled,
        }
    }

    #[state]
    fn done(&mut self, _event: &SessionEvent) -> Outcome<State> {
        Handled
    }

    #[state]
    fn error(&mut self, _event: &SessionEvent) -> Outcome<State> {
        Handled
    }
}

impl SessionLifecycle {
    pub fn new(record: SessionRecord) -> Self {
        Self { record: Some(record) }
    }

    fn touch(&mut self, state: SessionState, commit_sha: Option<String>, error_message: Option<String>) {
        let Some(record) = self.record.as_mut() else { return };
        record.state = state;
        record.updated_at = Utc::now();
        if state.is_terminal() {
            record.completed_at = Some(record.updated_at);
        }
        if commit_sha.is_some() {
            record.commit_sha = commit_sha;
        }
        if error_message.is_some() {
            record.error_message = error_message;
        }
    }
}

/// A lighter-weight duplicate-detection record, matching the shape named in
/// §6: `~/.agent/sessions/{issueId}.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupRecord {
    pub issue_id: String,
    pub status: SessionState,
    pub worktree_path: PathBuf,
    pub pid: Option<u32>,
    pub started_at: chrono::DateTime<Utc>,
    pub completed_at: Option<chrono::DateTime<Utc>>,
    pub error: Option<String>,
}

/// Append-only JSON file store under `~/.agent/sessions/` (§6). Crash
/// recovery and cross-process dedup only; never consulted as the live
/// source of truth while a process is running (§5).
pub struct SessionStore {
    base_dir: PathBuf,
}

impl SessionStore {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    fn dedup_path(&self, issue_id: &str) -> PathBuf {
        self.base_dir.join(format!("{issue_id}.json"))
    }

    fn detail_path(&self, session_id: &str) -> PathBuf {
        self.base_dir.join(format!("{session_id}.json"))
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.base_dir.join("archive")
    }

    pub async fn write_dedup(&self, record: &DedupRecord) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.base_dir).await?;
        let body = serde_json::to_vec_pretty(record).expect("DedupRecord serializes");
        tokio::fs::write(self.dedup_path(&record.issue_id), body).await
    }

    pub async fn read_dedup(&self, issue_id: &str) -> Option<DedupRecord> {
        let bytes = tokio::fs::read(self.dedup_path(issue_id)).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub async fn write_detail(&self, record: &SessionRecord) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.base_dir).await?;
        let body = serde_json::to_vec_pretty(record).expect("SessionRecord serializes");
        tokio::fs::write(self.detail_path(&record.id), body).await
    }

    /// Moves session detail files older than `retention` out of the base
    /// directory and into `archive/`, rather than deleting them (§6:
    /// "archived session files, retained ≥7 days").
    pub async fn rotate_archive(&self, retention: std::time::Duration) -> std::io::Result<usize> {
        let archive_dir = self.archive_dir();
        tokio::fs::create_dir_all(&archive_dir).await?;

        let mut moved = 0;
        let mut entries = tokio::fs::read_dir(&self.base_dir).await?;
        let now = std::time::SystemTime::now();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path == archive_dir || path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let metadata = entry.metadata().await?;
            let modified = metadata.modified().unwrap_or(now);
            let age = now.duration_since(modified).unwrap_or_default();
            if age < retention {
                continue;
            }
            let dest = archive_dir.join(entry.file_name());
            tokio::fs::rename(&path, &dest).await?;
            moved += 1;
        }

        Ok(moved)
    }
}

pub fn dedup_record_from_session(record: &SessionRecord) -> DedupRecord {
    DedupRecord {
        issue_id: record.issue_id.clone(),
        status: record.state,
        worktree_path: record.worktree_path.clone(),
        pid: record.pid,
        started_at: record.created_at,
        completed_at: record.completed_at,
        error: record.error_message.clone(),
    }
}

pub fn new_session_record(id: String, issue_id: String, repository_id: String, worktree_path: &Path) -> SessionRecord {
    let now = Utc::now();
    SessionRecord {
        id,
        issue_id,
        repository_id,
        worktree_path: worktree_path.to_path_buf(),
        state: SessionState::Started,
        pid: std::process::id().into(),
        created_at: now,
        updated_at: now,
        completed_at: None,
        completion_reason: None,
        commit_sha: None,
        error_message: None,
        cleanup_action: None,
    }
}

pub fn with_cleanup_action(mut record: SessionRecord, action: CleanupAction) -> SessionRecord {
    record.cleanup_action = Some(action);
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(issue_id: &str) -> SessionRecord {
        new_session_record("sess-1".to_string(), issue_id.to_string(), "repo-1".to_string(), Path::new("/tmp/w"))
    }

    #[test]
    fn lifecycle_moves_started_to_done_on_complete() {
        let mut machine = SessionLifecycle::new(record("ROM-1")).state_machine();
        machine.handle(&SessionEvent::Complete { commit_sha: "a".repeat(40) });
        let state = machine.context().record.as_ref().unwrap();
        assert_eq!(state.state, SessionState::Done);
        assert_eq!(state.commit_sha, Some("a".repeat(40)));
    }

    #[test]
    fn lifecycle_is_idempotent_once_terminal() {
        let mut machine = SessionLifecycle::new(record("ROM-2")).state_machine();
        machine.handle(&SessionEvent::Fail { error_message: "boom".into() });
        machine.handle(&SessionEvent::Progress);
        machine.handle(&SessionEvent::Complete { commit_sha: "ignored".into() });
        let state = machine.context().record.as_ref().unwrap();
        assert_eq!(state.state, SessionState::Error);
        assert_eq!(state.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn session_store_round_trips_dedup_record() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf());
        let record = dedup_record_from_session(&record("ROM-3"));

        store.write_dedup(&record).await.unwrap();
        let loaded = store.read_dedup("ROM-3").await.unwrap();
        assert_eq!(loaded.issue_id, "ROM-3");
    }

    #[tokio::test]
    async fn rotate_archive_moves_old_detail_files() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf());
        let detail = record("ROM-4");
        store.write_detail(&detail).await.unwrap();

        let moved = store.rotate_archive(std::time::Duration::from_secs(0)).await.unwrap();
        assert_eq!(moved, 1);
        assert!(store.archive_dir().join("sess-1.json").exists());
    }
}
