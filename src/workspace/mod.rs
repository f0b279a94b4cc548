//! Per-room working trees.
//!
//! Each room owns one directory under the workspace root. Every mutating
//! operation on that directory happens while holding the room's
//! [`WorkspaceLease`], so a sweep and an execution pass can never
//! interleave destructive git operations.

pub mod git;
pub mod runner;
pub mod secrets;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::config::WorkspaceConfig;
use crate::core::task::RoomId;
use crate::store::{Store, WorkspaceRecord};
use crate::util::blocking_with_timeout;
use crate::{Error, Result};

pub use git::{GitAuthor, WorkspaceRepo};
pub use runner::{CommandOutput, CommandRunner, CommandSpec, TokioCommandRunner};
pub use secrets::SecretFinding;

/// Snapshot of a workspace's health.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkspaceStatus {
    pub ready: bool,
    pub branch: Option<String>,
    pub changed_files: Vec<String>,
    pub conflicts: Vec<String>,
    pub tracked_secret_files: Vec<String>,
    pub secret_findings: Vec<SecretFinding>,
    pub ahead: usize,
    pub behind: usize,
    pub has_remote: bool,
}

impl WorkspaceStatus {
    /// Number of files with uncommitted changes.
    pub fn diff_size(&self) -> usize {
        self.changed_files.len()
    }
}

pub struct WorkspaceManager {
    root: PathBuf,
    store: Arc<dyn Store>,
    runner: Arc<dyn CommandRunner>,
    config: WorkspaceConfig,
    locks: Mutex<HashMap<RoomId, Arc<AsyncMutex<()>>>>,
}

impl WorkspaceManager {
    pub fn new(
        root: &Path,
        store: Arc<dyn Store>,
        runner: Arc<dyn CommandRunner>,
        config: WorkspaceConfig,
    ) -> Self {
        Self {
            root: root.to_path_buf(),
            store,
            runner,
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    pub fn author(&self) -> GitAuthor {
        GitAuthor::new(&self.config.author_name, &self.config.author_email)
    }

    /// Deterministic working-tree path for `room`.
    pub fn path_for(&self, room: &RoomId) -> PathBuf {
        self.root.join(sanitize_room(room.as_str()))
    }

    fn room_lock(&self, room: &RoomId) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(room.clone()).or_default())
    }

    fn make_lease(&self, room: &RoomId, guard: OwnedMutexGuard<()>) -> WorkspaceLease {
        WorkspaceLease {
            room: room.clone(),
            path: self.path_for(room),
            runner: Arc::clone(&self.runner),
            author: self.author(),
            git_timeout: self.config.git_timeout(),
            _guard: guard,
        }
    }

    /// Wait for exclusive access to the room's working tree.
    pub async fn lease(&self, room: &RoomId) -> WorkspaceLease {
        let guard = self.room_lock(room).lock_owned().await;
        self.make_lease(room, guard)
    }

    /// Exclusive access if nobody else holds it right now.
    pub fn try_lease(&self, room: &RoomId) -> Option<WorkspaceLease> {
        let guard = self.room_lock(room).try_lock_owned().ok()?;
        Some(self.make_lease(room, guard))
    }

    /// Lease the room and make its working tree usable.
    pub async fn ensure_ready(
        &self,
        room: &RoomId,
        remote: Option<&str>,
    ) -> Result<WorkspaceRecord> {
        let lease = self.lease(room).await;
        self.prepare(&lease, remote).await
    }

    /// Make the leased working tree usable: clone or init, repoint
    /// `origin`, seed a first commit. The outcome is recorded in the
    /// room's [`WorkspaceRecord`].
    pub async fn prepare(
        &self,
        lease: &WorkspaceLease,
        remote: Option<&str>,
    ) -> Result<WorkspaceRecord> {
        let mut record = self
            .store
            .get_workspace(&lease.room)
            .await?
            .unwrap_or_else(|| {
                WorkspaceRecord::new(&lease.room, &lease.path, &self.config.default_branch)
            });
        record.path = lease.path.clone();
        if let Some(url) = remote {
            record.remote_url = Some(url.to_string());
        }

        match self.initialise(lease, record.remote_url.as_deref()).await {
            Ok(branch) => {
                record.ready = true;
                record.last_error = None;
                record.default_branch = branch;
                self.store.put_workspace(record.clone()).await?;
                debug!(room = %lease.room, path = %lease.path.display(), "workspace ready");
                Ok(record)
            }
            Err(e) => {
                warn!(room = %lease.room, error = %e, "workspace initialisation failed");
                record.ready = false;
                record.last_error = Some(e.to_string());
                self.store.put_workspace(record).await?;
                Err(Error::Workspace(e.to_string()))
            }
        }
    }

    async fn initialise(&self, lease: &WorkspaceLease, remote: Option<&str>) -> Result<String> {
        let path = lease.path.clone();
        if let Some(url) = remote {
            if is_empty_dir(&path)? {
                self.clone_into(&path, url).await?;
            }
        }

        let default_branch = self.config.default_branch.clone();
        let author = self.author();
        let title = format!("{} workspace", lease.room);
        let url = remote.map(String::from);
        blocking_with_timeout(self.config.git_timeout(), move || {
            let repo = WorkspaceRepo::open_or_init(&path, &default_branch)?;
            if let Some(url) = url {
                repo.set_origin(&url)?;
            }
            repo.seed_initial_commit(&title, &author)?;
            Ok(repo.current_branch()?.unwrap_or(default_branch))
        })
        .await
    }

    async fn clone_into(&self, path: &Path, url: &str) -> Result<()> {
        let parent = path.parent().unwrap_or(&self.root).to_path_buf();
        tokio::fs::create_dir_all(&parent).await?;
        info!(url, path = %path.display(), "cloning workspace");
        let spec = CommandSpec::git(
            &parent,
            [
                "clone".to_string(),
                "--depth".to_string(),
                "1".to_string(),
                url.to_string(),
                path.to_string_lossy().into_owned(),
            ],
            self.config.git_timeout(),
        );
        let output = self.runner.run(&spec).await?;
        if !output.success() {
            return Err(Error::Command(format!(
                "git clone failed: {}",
                output.describe_failure()
            )));
        }
        Ok(())
    }

    /// Fetch and fast-forward the room's branch from `origin`.
    pub async fn sync(&self, room: &RoomId) -> Result<()> {
        let lease = self.lease(room).await;
        let record = self.record(room).await?;
        if record.remote_url.is_none() {
            return Err(Error::Workspace(format!("room {} has no remote", room)));
        }
        lease.git_checked(["fetch", "origin"]).await?;
        lease
            .git_checked(["pull", "--ff-only", "origin", record.default_branch.as_str()])
            .await?;
        self.mark_synced(record).await
    }

    /// Fetch `origin` so ahead/behind counts are current. Requires the
    /// caller to hold the lease.
    pub async fn refresh_remote(&self, lease: &WorkspaceLease) -> Result<()> {
        let record = self.record(&lease.room).await?;
        if record.remote_url.is_none() {
            return Ok(());
        }
        lease.git_checked(["fetch", "origin"]).await?;
        self.mark_synced(record).await
    }

    /// [`refresh_remote`](Self::refresh_remote) when the last sync is
    /// older than the configured fetch interval. Returns whether a fetch
    /// happened.
    pub async fn refresh_remote_if_due(&self, lease: &WorkspaceLease) -> Result<bool> {
        let Some(record) = self.store.get_workspace(&lease.room).await? else {
            return Ok(false);
        };
        if record.remote_url.is_none() || !record.ready {
            return Ok(false);
        }
        let interval = chrono::Duration::from_std(self.config.fetch_interval())
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let due = record
            .last_synced_at
            .map_or(true, |at| Utc::now() - at >= interval);
        if !due {
            return Ok(false);
        }
        self.refresh_remote(lease).await?;
        Ok(true)
    }

    async fn record(&self, room: &RoomId) -> Result<WorkspaceRecord> {
        self.store
            .get_workspace(room)
            .await?
            .ok_or_else(|| Error::Workspace(format!("room {} has no workspace", room)))
    }

    async fn mark_synced(&self, mut record: WorkspaceRecord) -> Result<()> {
        record.last_synced_at = Some(Utc::now());
        self.store.put_workspace(record).await
    }

    /// Read-only health snapshot. Does not take the lease.
    pub async fn status(&self, room: &RoomId) -> Result<WorkspaceStatus> {
        let Some(record) = self.store.get_workspace(room).await? else {
            return Ok(WorkspaceStatus::default());
        };
        let path = self.path_for(room);
        blocking_with_timeout(self.config.git_timeout(), move || {
            collect_status(&path, record.ready, &record.default_branch)
        })
        .await
    }
}

/// Exclusive handle on one room's working tree. Dropping it releases the
/// room.
pub struct WorkspaceLease {
    room: RoomId,
    path: PathBuf,
    runner: Arc<dyn CommandRunner>,
    author: GitAuthor,
    git_timeout: Duration,
    _guard: OwnedMutexGuard<()>,
}

impl std::fmt::Debug for WorkspaceLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceLease")
            .field("room", &self.room)
            .field("path", &self.path)
            .finish()
    }
}

impl WorkspaceLease {
    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_repo<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(WorkspaceRepo) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.path.clone();
        blocking_with_timeout(self.git_timeout, move || f(WorkspaceRepo::open(&path)?)).await
    }

    pub async fn status(&self) -> Result<WorkspaceStatus> {
        let path = self.path.clone();
        blocking_with_timeout(self.git_timeout, move || {
            let branch = WorkspaceRepo::open(&path)?
                .current_branch()?
                .unwrap_or_default();
            collect_status(&path, true, &branch)
        })
        .await
    }

    pub async fn status_text(&self) -> Result<String> {
        self.with_repo(|repo| repo.status_text()).await
    }

    /// Paths with uncommitted changes, untracked files included.
    pub async fn changed_files(&self) -> Result<Vec<String>> {
        self.with_repo(|repo| repo.changed_files()).await
    }

    pub async fn discard(&self, paths: Vec<String>) -> Result<()> {
        self.with_repo(move |repo| repo.discard(&paths)).await
    }

    pub async fn has_changes(&self) -> Result<bool> {
        self.with_repo(|repo| Ok(!repo.changed_files()?.is_empty())).await
    }

    pub async fn current_branch(&self) -> Result<Option<String>> {
        self.with_repo(|repo| repo.current_branch()).await
    }

    pub async fn has_remote(&self) -> Result<bool> {
        self.with_repo(|repo| Ok(repo.origin_url()?.is_some())).await
    }

    /// Commit every change. `None` means there was nothing to commit.
    pub async fn commit_all(&self, message: &str) -> Result<Option<String>> {
        let message = message.to_string();
        let author = self.author.clone();
        self.with_repo(move |repo| repo.commit_all(&message, &author)).await
    }

    pub async fn push(&self, branch: &str) -> Result<CommandOutput> {
        let refspec = format!("HEAD:{}", branch);
        self.git(["push", "origin", refspec.as_str()]).await
    }

    /// Apply a unified diff with `git apply`. The output reports whether
    /// it applied; `git apply` leaves the tree untouched on failure.
    pub async fn apply_patch(&self, diff: &str) -> Result<CommandOutput> {
        let patch_path = self.path.join(".git").join("foreman.patch");
        let mut diff = diff.to_string();
        if !diff.ends_with('\n') {
            diff.push('\n');
        }
        tokio::fs::write(&patch_path, diff).await?;
        let patch_arg = patch_path.to_string_lossy().into_owned();
        let output = self
            .git(["apply", "--whitespace=nowarn", patch_arg.as_str()])
            .await;
        if let Err(e) = tokio::fs::remove_file(&patch_path).await {
            debug!(error = %e, "could not remove patch file");
        }
        output
    }

    /// Write `content` to a path relative to the working tree, creating
    /// parent directories.
    pub async fn write_file(&self, rel: &str, content: &str) -> Result<()> {
        let full = self.path.join(rel);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, content).await?;
        Ok(())
    }

    /// Read a text file relative to the working tree. Missing and
    /// non-UTF-8 files read as `None`.
    pub async fn read_file(&self, rel: &str) -> Result<Option<String>> {
        match tokio::fs::read(self.path.join(rel)).await {
            Ok(bytes) => Ok(String::from_utf8(bytes).ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Run a command in the working tree through the injected runner.
    pub async fn run(&self, argv: Vec<String>, timeout: Duration) -> Result<CommandOutput> {
        self.runner
            .run(&CommandSpec::new(&self.path, argv, timeout))
            .await
    }

    async fn git<I, S>(&self, args: I) -> Result<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.runner
            .run(&CommandSpec::git(&self.path, args, self.git_timeout))
            .await
    }

    async fn git_checked<I, S>(&self, args: I) -> Result<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = CommandSpec::git(&self.path, args, self.git_timeout);
        let output = self.runner.run(&spec).await?;
        if !output.success() {
            return Err(Error::Command(format!(
                "{} failed: {}",
                spec.display(),
                output.describe_failure()
            )));
        }
        Ok(output)
    }
}

fn collect_status(path: &Path, ready: bool, default_branch: &str) -> Result<WorkspaceStatus> {
    if !WorkspaceRepo::is_repository(path) {
        return Ok(WorkspaceStatus::default());
    }
    let repo = WorkspaceRepo::open(path)?;
    let branch = repo.current_branch()?;
    let tracked = repo.tracked_files()?;
    let tracked_secret_files = tracked
        .iter()
        .filter(|p| secrets::is_dotenv_file(p))
        .cloned()
        .collect();
    let secret_findings = secrets::scan_files(path, &tracked);
    let upstream = branch.as_deref().unwrap_or(default_branch);
    let (ahead, behind) = repo.ahead_behind(upstream)?.unwrap_or((0, 0));

    Ok(WorkspaceStatus {
        ready,
        changed_files: repo.changed_files()?,
        conflicts: repo.conflicted_files()?,
        tracked_secret_files,
        secret_findings,
        ahead,
        behind,
        has_remote: repo.origin_url()?.is_some(),
        branch,
    })
}

fn is_empty_dir(path: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(true);
    }
    Ok(std::fs::read_dir(path)?.next().is_none())
}

/// Map a room id onto a single safe directory name.
fn sanitize_room(room: &str) -> String {
    let name: String = room
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() {
        "_room".to_string()
    } else {
        name
    }
}
