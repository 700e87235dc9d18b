//! Bounded-concurrency scheduler with FIFO overflow queue (§4.9).

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use crate::types::SessionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitDisposition {
    Started,
    Queued,
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct SchedulerCounts {
    pub active: usize,
    pub waiting: usize,
    pub max_concurrency: usize,
}

type CompletionCallback = Arc<dyn Fn(&str) + Send + Sync>;

struct Inner {
    active: HashMap<String, SessionConfig>,
    waiting: VecDeque<SessionConfig>,
    callbacks: HashMap<String, CompletionCallback>,
}

/// Owns the active+queued `SessionConfig` set (§3 ownership table).
pub struct Scheduler {
    max_concurrency: usize,
    inner: RwLock<Inner>,
}

impl Scheduler {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency,
            inner: RwLock::new(Inner { active: HashMap::new(), waiting: VecDeque::new(), callbacks: HashMap::new() }),
        }
    }

    pub fn submit(&self, item: SessionConfig) -> SubmitDisposition {
        let mut inner = self.inner.write().unwrap();

        if inner.active.contains_key(&item.issue_id) || inner.waiting.iter().any(|w| w.issue_id == item.issue_id) {
            return SubmitDisposition::Duplicate;
        }

        if inner.active.len() < self.max_concurrency {
            inner.active.insert(item.issue_id.clone(), item);
            SubmitDisposition::Started
        } else {
            inner.waiting.push_back(item);
            SubmitDisposition::Queued
        }
    }

    pub fn register_completion_callback(&self, issue_id: &str, callback: CompletionCallback) {
        self.inner.write().unwrap().callbacks.insert(issue_id.to_string(), callback);
    }

    /// Removes `issue_id` from `active`, invokes its registered completion
    /// callback exactly once, and promotes the oldest waiting item (if any)
    /// into `active`. The promoted item is handed back to the caller, since
    /// the Scheduler itself never runs anything — starting it is the
    /// caller's job (§4.9, §4.11 step 2).
    fn finish(&self, issue_id: &str) -> Option<SessionConfig> {
        let mut inner = self.inner.write().unwrap();
        inner.active.remove(issue_id);

        if let Some(callback) = inner.callbacks.remove(issue_id) {
            callback(issue_id);
        }

        if let Some(next) = inner.waiting.pop_front() {
            let next_id = next.issue_id.clone();
            inner.active.insert(next_id, next.clone());
            Some(next)
        } else {
            None
        }
    }

    pub fn complete(&self, issue_id: &str) -> Option<SessionConfig> {
        self.finish(issue_id)
    }

    pub fn fail(&self, issue_id: &str) -> Option<SessionConfig> {
        self.finish(issue_id)
    }

    pub fn counts(&self) -> SchedulerCounts {
        let inner = self.inner.read().unwrap();
        SchedulerCounts { active: inner.active.len(), waiting: inner.waiting.len(), max_concurrency: self.max_concurrency }
    }

    pub fn active_list(&self) -> Vec<String> {
        self.inner.read().unwrap().active.keys().cloned().collect()
    }

    pub fn queue_position(&self, issue_id: &str) -> Option<usize> {
        self.inner.read().unwrap().waiting.iter().position(|w| w.issue_id == issue_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn item(issue_id: &str) -> SessionConfig {
        SessionConfig {
            issue_id: issue_id.to_string(),
            work_item: crate::types::WorkItem {
                id: issue_id.to_string(),
                identifier: issue_id.to_string(),
                title: "title".into(),
                description: None,
                labels: vec![],
                project: None,
                team_key: None,
                state: "backlog".into(),
            },
            repository_id: "repo-1".into(),
        }
    }

    #[test]
    fn submit_starts_until_capacity_then_queues() {
        let scheduler = Scheduler::new(1);
        assert_eq!(scheduler.submit(item("a")), SubmitDisposition::Started);
        assert_eq!(scheduler.submit(item("b")), SubmitDisposition::Queued);
    }

    #[test]
    fn submit_rejects_duplicates_whether_active_or_queued() {
        let scheduler = Scheduler::new(1);
        scheduler.submit(item("a"));
        scheduler.submit(item("b"));
        assert_eq!(scheduler.submit(item("a")), SubmitDisposition::Duplicate);
        assert_eq!(scheduler.submit(item("b")), SubmitDisposition::Duplicate);
    }

    #[test]
    fn complete_promotes_the_oldest_queued_item() {
        let scheduler = Scheduler::new(1);
        scheduler.submit(item("a"));
        scheduler.submit(item("b"));
        scheduler.complete("a");

        assert_eq!(scheduler.active_list(), vec!["b".to_string()]);
        assert_eq!(scheduler.counts().waiting, 0);
    }

    #[test]
    fn zero_concurrency_queues_every_submission_forever() {
        let scheduler = Scheduler::new(0);
        assert_eq!(scheduler.submit(item("a")), SubmitDisposition::Queued);
        assert_eq!(scheduler.counts().active, 0);
    }

    proptest::proptest! {
        /// §8: "Scheduler never exceeds max_concurrency active sessions,
        /// regardless of submit/complete interleaving." Drives a random
        /// sequence of submits (new ids) and completions (of an already
        /// active id) against a small fixed cap and checks the invariant
        /// after every step rather than only at the end.
        #[test]
        fn active_never_exceeds_max_concurrency(
            max_concurrency in 0usize..5,
            ops in proptest::collection::vec(0usize..10_000, 1..200),
        ) {
            let scheduler = Scheduler::new(max_concurrency);
            let mut next_id = 0u32;

            for op in ops {
                if op % 3 == 0 {
                    if let Some(issue_id) = scheduler.active_list().first().cloned() {
                        scheduler.complete(&issue_id);
                    }
                } else {
                    next_id += 1;
                    scheduler.submit(item(&format!("issue-{next_id}")));
                }
                prop_assert!(scheduler.counts().active <= max_concurrency);
            }
        }
    }
}
