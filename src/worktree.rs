//! Worktree lifecycle management (§4.7).
//!
//! Invariant: at most one active worktree per `issueId`, enforced by a
//! per-issue mutex held for the whole `create`/`cleanup` critical section. A
//! separate base-directory mutex guards `cleanupOrphaned`'s filesystem scan.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as SyncMutex};
use std::time::{Duration, SystemTime};

use tokio::sync::Mutex as AsyncMutex;

use crate::errors::WorktreeError;
use crate::external::command::CommandExecutor;
use crate::fs::FileSystemOperations;
use crate::git::GitService;
use crate::types::{CleanupAction, Worktree, WorktreeMode};

#[derive(Debug, Clone)]
pub struct WorktreeManagerConfig {
    pub base_dir: PathBuf,
    pub min_free_mb: u64,
}

impl Default for WorktreeManagerConfig {
    fn default() -> Self {
        Self { base_dir: PathBuf::from("~/.agent/worktrees"), min_free_mb: 100 }
    }
}

#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub issue_id: String,
    pub repository_path: PathBuf,
    pub base_branch: String,
    pub branch_name: String,
    pub mode: WorktreeMode,
    pub symlinks: Vec<(PathBuf, PathBuf)>,
}

pub struct WorktreeManager {
    executor: Arc<dyn CommandExecutor>,
    fs: Arc<dyn FileSystemOperations>,
    git: GitService,
    config: WorktreeManagerConfig,
    active: SyncMutex<HashMap<String, Worktree>>,
    issue_locks: SyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    base_lock: AsyncMutex<()>,
}

impl WorktreeManager {
    pub fn new(executor: Arc<dyn CommandExecutor>, fs: Arc<dyn FileSystemOperations>, config: WorktreeManagerConfig) -> Self {
        let git = GitService::new(executor.clone());
        Self {
            executor,
            fs,
            git,
            config,
            active: SyncMutex::new(HashMap::new()),
            issue_locks: SyncMutex::new(HashMap::new()),
            base_lock: AsyncMutex::new(()),
        }
    }

    fn issue_lock(&self, issue_id: &str) -> Arc<AsyncMutex<()>> {
        self.issue_locks
            .lock()
            .unwrap()
            .entry(issue_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn worktree_path(&self, issue_id: &str, mode: WorktreeMode) -> PathBuf {
        let root = self.config.base_dir.join(issue_id);
        match mode {
            WorktreeMode::Main => root,
            WorktreeMode::Branch => root.join("branch"),
            WorktreeMode::Session => root.join(format!(
                "session-{}",
                SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default().as_millis()
            )),
        }
    }

    /// Shells out to `df` the way the corpus's environment diagnostics do,
    /// rather than pulling in a disk-space crate.
    async fn free_mb(&self, path: &str) -> Option<u64> {
        let output = self.executor.execute("df", &["-BM", path], None).await.ok()?;
        if !output.success() {
            return None;
        }
        let line = output.stdout.lines().nth(1)?;
        let fields: Vec<&str> = line.split_whitespace().collect();
        let available = fields.get(3)?;
        available.trim_end_matches('M').parse::<u64>().ok()
    }

    fn classify_git_failure(stderr: &str) -> WorktreeError {
        let lower = stderr.to_lowercase();
        if lower.contains("permission denied") {
            WorktreeError::PermissionDenied(stderr.to_string())
        } else if lower.contains("no space left") {
            WorktreeError::DiskSpace(stderr.to_string())
        } else if lower.contains("already exists") {
            WorktreeError::WorktreeExists(stderr.to_string())
        } else {
            WorktreeError::Git(crate::errors::GitError::CommandFailed(stderr.to_string()))
        }
    }

    pub async fn create(&self, opts: CreateOptions) -> Result<Worktree, WorktreeError> {
        let lock = self.issue_lock(&opts.issue_id);
        let _guard = lock.lock().await;

        let repo_path = opts.repository_path.to_string_lossy().to_string();
        if !self.fs.exists(&format!("{repo_path}/.git")) {
            return Err(WorktreeError::RepoNotFound(repo_path));
        }

        if let Some(free) = self.free_mb(&repo_path).await {
            if free < self.config.min_free_mb {
                return Err(WorktreeError::DiskSpace(format!(
                    "{free}MB free, need at least {}MB",
                    self.config.min_free_mb
                )));
            }
        }

        let worktree_path = self.worktree_path(&opts.issue_id, opts.mode);
        let worktree_path_str = worktree_path.to_string_lossy().to_string();
        let base_commit = self.git.get_current_commit(&repo_path).await;

        let worktree_exists = self.fs.exists(&worktree_path_str);
        let branch_exists_output = self
            .executor
            .execute("git", &["branch", "--list", &opts.branch_name], Some(&repo_path))
            .await
            .map_err(crate::errors::GitError::from)?;
        let branch_exists = !branch_exists_output.stdout.trim().is_empty();

        if worktree_exists && branch_exists {
            // Reuse: nothing to do, the worktree already tracks this branch.
        } else if worktree_exists {
            let output = self
                .executor
                .execute("git", &["checkout", &opts.branch_name], Some(&worktree_path_str))
                .await
                .map_err(crate::errors::GitError::from)?;
            if !output.success() {
                return Err(Self::classify_git_failure(&output.stderr));
            }
        } else {
            self.fs
                .create_dir_all(&worktree_path.parent().unwrap_or(&worktree_path).to_string_lossy())
                .await
                .map_err(|e| WorktreeError::Io(e.to_string()))?;

            let output = if branch_exists {
                self.executor
                    .execute("git", &["worktree", "add", "-f", &worktree_path_str, &opts.branch_name], Some(&repo_path))
                    .await
                    .map_err(crate::errors::GitError::from)?
            } else {
                self.executor
                    .execute(
                        "git",
                        &["worktree", "add", "-b", &opts.branch_name, &worktree_path_str, &opts.base_branch],
                        Some(&repo_path),
                    )
                    .await
                    .map_err(crate::errors::GitError::from)?
            };
            if !output.success() {
                return Err(Self::classify_git_failure(&output.stderr));
            }
        }

        let mut symlinks = Vec::new();
        for (original, link) in &opts.symlinks {
            match self.fs.symlink(&original.to_string_lossy(), &link.to_string_lossy()).await {
                Ok(()) => symlinks.push(link.clone()),
                Err(e) => tracing::warn!(error = %e, link = %link.display(), "symlink creation failed"),
            }
        }

        let worktree = Worktree {
            issue_id: opts.issue_id.clone(),
            worktree_path,
            repository_path: opts.repository_path,
            branch_name: opts.branch_name,
            mode: opts.mode,
            base_commit,
            created_at: SystemTime::now(),
            symlinks,
        };

        self.active.lock().unwrap().insert(opts.issue_id.clone(), worktree.clone());
        Ok(worktree)
    }

    pub async fn cleanup(&self, issue_id: &str, preserve: bool) -> Result<CleanupAction, WorktreeError> {
        let lock = self.issue_lock(issue_id);
        let _guard = lock.lock().await;

        if preserve {
            self.active.lock().unwrap().remove(issue_id);
            return Ok(CleanupAction::Preserved);
        }

        let worktree = match self.active.lock().unwrap().get(issue_id).cloned() {
            Some(w) => w,
            None => return Ok(CleanupAction::Removed),
        };
        let path = worktree.worktree_path.to_string_lossy().to_string();

        if self.git.has_uncommitted_changes(&path).await {
            let message = format!("agent: Session completion - {issue_id}");
            self.git.commit(&path, &message, true, true).await?;
        }

        let output = self
            .executor
            .execute("git", &["worktree", "remove", "--force", &path], Some(&worktree.repository_path.to_string_lossy()))
            .await
            .map_err(crate::errors::GitError::from)?;
        if !output.success() {
            if let Err(e) = self.fs.remove_dir_all(&path).await {
                tracing::warn!(error = %e, %path, "worktree directory removal failed after git worktree remove failed");
            }
        }

        self.active.lock().unwrap().remove(issue_id);
        Ok(CleanupAction::Removed)
    }

    /// Removes directories under the base dir whose `issueId` is not active
    /// and whose mtime is older than `max_age`. Active worktrees are never
    /// touched regardless of age.
    pub async fn cleanup_orphaned(&self, max_age: Duration) -> usize {
        let _guard = self.base_lock.lock().await;
        let base_dir = self.config.base_dir.to_string_lossy().to_string();

        let entries = match self.fs.read_dir_entries(&base_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "failed to scan worktree base directory for orphans");
                return 0;
            }
        };

        let now = SystemTime::now();
        let active_ids: std::collections::HashSet<String> = self.active.lock().unwrap().keys().cloned().collect();
        let mut removed = 0;

        for (name, modified) in entries {
            if active_ids.contains(&name) {
                continue;
            }
            let age = now.duration_since(modified).unwrap_or_default();
            if age < max_age {
                continue;
            }
            let path = format!("{base_dir}/{name}");
            match self.fs.remove_dir_all(&path).await {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(error = %e, %path, "failed to remove orphaned worktree"),
            }
        }

        removed
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::command::{CommandError, CommandOutput};
    use crate::fs::MockFileSystemOperations;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedExecutor {
        responses: Mutex<HashMap<String, Result<CommandOutput, CommandError>>>,
        default_ok: CommandOutput,
    }

    impl ScriptedExecutor {
        fn new() -> Self {
            Self {
                responses: Mutex::new(HashMap::new()),
                default_ok: CommandOutput { status_code: 0, stdout: String::new(), stderr: String::new() },
            }
        }

        fn on(self, args: &[&str], response: Result<CommandOutput, CommandError>) -> Self {
            self.responses.lock().unwrap().insert(args.join(" "), response);
            self
        }
    }

    #[async_trait]
    impl CommandExecutor for ScriptedExecutor {
        async fn execute(&self, _program: &str, args: &[&str], _cwd: Option<&str>) -> Result<CommandOutput, CommandError> {
            let key = args.join(" ");
            self.responses.lock().unwrap().get(&key).cloned().unwrap_or_else(|| Ok(self.default_ok.clone()))
        }
    }

    fn opts(issue_id: &str) -> CreateOptions {
        CreateOptions {
            issue_id: issue_id.to_string(),
            repository_path: PathBuf::from("/repo"),
            base_branch: "main".to_string(),
            branch_name: "linear/ROM-1-fix".to_string(),
            mode: WorktreeMode::Main,
            symlinks: Vec::new(),
        }
    }

    #[tokio::test]
    async fn create_fails_fast_when_repository_is_missing() {
        let executor = Arc::new(ScriptedExecutor::new());
        let mut fs_mock = MockFileSystemOperations::new();
        fs_mock.expect_exists().returning(|_| false);
        let manager = WorktreeManager::new(executor, Arc::new(fs_mock), WorktreeManagerConfig::default());

        let result = manager.create(opts("ROM-1")).await;
        assert!(matches!(result, Err(WorktreeError::RepoNotFound(_))));
    }

    #[tokio::test]
    async fn create_registers_worktree_in_active_map() {
        let executor = Arc::new(
            ScriptedExecutor::new()
                .on(&["df", "-BM", "/repo"], Ok(CommandOutput { status_code: 0, stdout: "Filesystem 1M-blocks Used Available Use% Mounted\n/dev/x 100000M 1000M 99000M 1% /\n".into(), stderr: String::new() }))
                .on(&["rev-parse", "HEAD"], Ok(CommandOutput { status_code: 0, stdout: "a".repeat(40), stderr: String::new() }))
                .on(&["branch", "--list", "linear/ROM-1-fix"], Ok(CommandOutput { status_code: 0, stdout: String::new(), stderr: String::new() }))
                .on(
                    &["worktree", "add", "-b", "linear/ROM-1-fix", "~/.agent/worktrees/ROM-1", "main"],
                    Ok(CommandOutput { status_code: 0, stdout: String::new(), stderr: String::new() }),
                ),
        );
        let mut fs_mock = MockFileSystemOperations::new();
        fs_mock.expect_exists().returning(|p| p.ends_with("/.git"));
        fs_mock.expect_create_dir_all().returning(|_| Ok(()));

        let manager = WorktreeManager::new(executor, Arc::new(fs_mock), WorktreeManagerConfig::default());
        let worktree = manager.create(opts("ROM-1")).await.unwrap();

        assert_eq!(worktree.issue_id, "ROM-1");
        assert_eq!(manager.active_count(), 1);
    }

    #[tokio::test]
    async fn cleanup_with_preserve_drops_from_active_map_without_removing_files() {
        let executor = Arc::new(ScriptedExecutor::new());
        let fs_mock = MockFileSystemOperations::new();
        let manager = WorktreeManager::new(executor, Arc::new(fs_mock), WorktreeManagerConfig::default());
        manager.active.lock().unwrap().insert(
            "ROM-1".to_string(),
            Worktree {
                issue_id: "ROM-1".into(),
                worktree_path: PathBuf::from("/tmp/w"),
                repository_path: PathBuf::from("/repo"),
                branch_name: "linear/ROM-1-fix".into(),
                mode: WorktreeMode::Main,
                base_commit: None,
                created_at: SystemTime::now(),
                symlinks: Vec::new(),
            },
        );

        let action = manager.cleanup("ROM-1", true).await.unwrap();
        assert_eq!(action, CleanupAction::Preserved);
        assert_eq!(manager.active_count(), 0);
    }
}
