//! Repository interface over the persistent entity store.
//!
//! The core never caches store records beyond one operation. Writes that
//! must be read-modify-write consistent (task updates, version appends) are
//! expressed as single store calls so implementations can make them atomic.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::core::contract::{
    Contract, ContractDependency, ContractId, ContractVersion, VersionDraft,
};
use crate::core::task::{RoomId, Task, TaskDependency, TaskId};
use crate::error::{Error, Result};

/// Closure applied atomically by [`Store::update_task`]. Returning `None`
/// leaves the task untouched.
pub type TaskUpdate<'a> = &'a (dyn Fn(&Task) -> Option<Task> + Send + Sync);

/// Decides whether a new version breaks the current one, which is passed
/// in (`None` for a first publish). Called under the append's lock.
pub type BreakingCheck<'a> = &'a (dyn Fn(Option<&ContractVersion>) -> bool + Send + Sync);

/// Result of [`Store::append_contract_version`].
#[derive(Debug, Clone, PartialEq)]
pub struct AppendedVersion {
    /// The version that was current when the append took the lock.
    pub previous: Option<ContractVersion>,
    pub version: ContractVersion,
}

/// Workspace metadata for a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceRecord {
    pub room: RoomId,
    pub path: PathBuf,
    pub remote_url: Option<String>,
    pub default_branch: String,
    pub ready: bool,
    pub last_error: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl WorkspaceRecord {
    pub fn new(room: &RoomId, path: &Path, default_branch: &str) -> Self {
        Self {
            room: room.clone(),
            path: path.to_path_buf(),
            remote_url: None,
            default_branch: default_branch.to_string(),
            ready: false,
            last_error: None,
            last_synced_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteKind {
    ExecutionSucceeded,
    ExecutionFailed,
    TaskBlocked,
    ContractImpact,
}

/// Audit/notebook record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteEntry {
    pub id: Uuid,
    pub room: RoomId,
    pub task_id: Option<TaskId>,
    pub kind: NoteKind,
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl NoteEntry {
    pub fn new(
        room: &RoomId,
        task_id: Option<TaskId>,
        kind: NoteKind,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            room: room.clone(),
            task_id,
            kind,
            title: title.into(),
            body: body.into(),
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn list_rooms(&self) -> Result<Vec<RoomId>>;

    async fn list_tasks(&self, room: &RoomId) -> Result<Vec<Task>>;
    async fn get_task(&self, room: &RoomId, id: TaskId) -> Result<Option<Task>>;
    async fn put_task(&self, room: &RoomId, task: Task) -> Result<()>;
    /// Apply `update` to the current task atomically. Returns the stored
    /// task when the update applied, `None` when it declined.
    async fn update_task(
        &self,
        room: &RoomId,
        id: TaskId,
        update: TaskUpdate<'_>,
    ) -> Result<Option<Task>>;

    async fn list_task_dependencies(&self, room: &RoomId) -> Result<Vec<TaskDependency>>;
    async fn add_task_dependency(&self, room: &RoomId, dependency: TaskDependency) -> Result<()>;

    async fn list_contracts(&self, room: &RoomId) -> Result<Vec<Contract>>;
    async fn get_contract(&self, room: &RoomId, id: ContractId) -> Result<Option<Contract>>;
    async fn put_contract(&self, room: &RoomId, contract: Contract) -> Result<()>;
    /// Append a version numbered `current + 1` and make it current.
    /// `breaking` sees the version being replaced within the same atomic
    /// step, so concurrent publishes each compare against their true
    /// predecessor.
    async fn append_contract_version(
        &self,
        room: &RoomId,
        id: ContractId,
        draft: &VersionDraft,
        breaking: BreakingCheck<'_>,
    ) -> Result<AppendedVersion>;
    async fn list_contract_versions(
        &self,
        room: &RoomId,
        id: ContractId,
    ) -> Result<Vec<ContractVersion>>;

    async fn list_contract_dependencies(&self, room: &RoomId) -> Result<Vec<ContractDependency>>;
    async fn add_contract_dependency(
        &self,
        room: &RoomId,
        dependency: ContractDependency,
    ) -> Result<()>;
    async fn remove_contract_dependency(
        &self,
        room: &RoomId,
        dependency: &ContractDependency,
    ) -> Result<bool>;

    async fn get_workspace(&self, room: &RoomId) -> Result<Option<WorkspaceRecord>>;
    async fn put_workspace(&self, record: WorkspaceRecord) -> Result<()>;

    async fn append_note(&self, note: NoteEntry) -> Result<()>;
    async fn list_notes(&self, room: &RoomId) -> Result<Vec<NoteEntry>>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RoomData {
    tasks: BTreeMap<TaskId, Task>,
    task_dependencies: Vec<TaskDependency>,
    contracts: BTreeMap<ContractId, Contract>,
    versions: HashMap<ContractId, Vec<ContractVersion>>,
    contract_dependencies: Vec<ContractDependency>,
    workspace: Option<WorkspaceRecord>,
    notes: Vec<NoteEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Snapshot {
    rooms: BTreeMap<RoomId, RoomData>,
}

/// In-process store. Every call takes one lock, so each call is atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Snapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a room with no records.
    pub async fn create_room(&self, room: &RoomId) {
        self.inner.write().await.rooms.entry(room.clone()).or_default();
    }

    /// Load a JSON snapshot written by [`MemoryStore::save`]. A missing file
    /// yields an empty store.
    pub fn load(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "MemoryStore::load");
        if !path.exists() {
            return Ok(Self::new());
        }
        let snapshot: Snapshot = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        Ok(Self {
            inner: RwLock::new(snapshot),
        })
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let json = {
            let snapshot = self.inner.read().await;
            serde_json::to_string_pretty(&*snapshot)?
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, json).await?;
        debug!(path = %path.display(), "MemoryStore saved");
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_rooms(&self) -> Result<Vec<RoomId>> {
        Ok(self.inner.read().await.rooms.keys().cloned().collect())
    }

    async fn list_tasks(&self, room: &RoomId) -> Result<Vec<Task>> {
        let snapshot = self.inner.read().await;
        Ok(snapshot
            .rooms
            .get(room)
            .map(|r| r.tasks.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_task(&self, room: &RoomId, id: TaskId) -> Result<Option<Task>> {
        let snapshot = self.inner.read().await;
        Ok(snapshot.rooms.get(room).and_then(|r| r.tasks.get(&id).cloned()))
    }

    async fn put_task(&self, room: &RoomId, task: Task) -> Result<()> {
        let mut snapshot = self.inner.write().await;
        snapshot
            .rooms
            .entry(room.clone())
            .or_default()
            .tasks
            .insert(task.id, task);
        Ok(())
    }

    async fn update_task(
        &self,
        room: &RoomId,
        id: TaskId,
        update: TaskUpdate<'_>,
    ) -> Result<Option<Task>> {
        let mut snapshot = self.inner.write().await;
        let task = snapshot
            .rooms
            .get_mut(room)
            .and_then(|r| r.tasks.get_mut(&id))
            .ok_or(Error::TaskNotFound(id))?;
        match update(&*task) {
            Some(next) => {
                *task = next;
                Ok(Some(task.clone()))
            }
            None => Ok(None),
        }
    }

    async fn list_task_dependencies(&self, room: &RoomId) -> Result<Vec<TaskDependency>> {
        let snapshot = self.inner.read().await;
        Ok(snapshot
            .rooms
            .get(room)
            .map(|r| r.task_dependencies.clone())
            .unwrap_or_default())
    }

    async fn add_task_dependency(&self, room: &RoomId, dependency: TaskDependency) -> Result<()> {
        let mut snapshot = self.inner.write().await;
        let data = snapshot.rooms.entry(room.clone()).or_default();
        if !data.task_dependencies.contains(&dependency) {
            data.task_dependencies.push(dependency);
        }
        Ok(())
    }

    async fn list_contracts(&self, room: &RoomId) -> Result<Vec<Contract>> {
        let snapshot = self.inner.read().await;
        Ok(snapshot
            .rooms
            .get(room)
            .map(|r| r.contracts.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_contract(&self, room: &RoomId, id: ContractId) -> Result<Option<Contract>> {
        let snapshot = self.inner.read().await;
        Ok(snapshot.rooms.get(room).and_then(|r| r.contracts.get(&id).cloned()))
    }

    async fn put_contract(&self, room: &RoomId, contract: Contract) -> Result<()> {
        let mut snapshot = self.inner.write().await;
        snapshot
            .rooms
            .entry(room.clone())
            .or_default()
            .contracts
            .insert(contract.id, contract);
        Ok(())
    }

    async fn append_contract_version(
        &self,
        room: &RoomId,
        id: ContractId,
        draft: &VersionDraft,
        breaking: BreakingCheck<'_>,
    ) -> Result<AppendedVersion> {
        let mut snapshot = self.inner.write().await;
        let data = snapshot
            .rooms
            .get_mut(room)
            .ok_or_else(|| Error::ContractNotFound(id.to_string()))?;
        let contract = data
            .contracts
            .get_mut(&id)
            .ok_or_else(|| Error::ContractNotFound(id.to_string()))?;

        let history = data.versions.entry(id).or_default();
        let previous = history
            .iter()
            .find(|v| v.version == contract.current_version)
            .cloned();
        let now = Utc::now();
        let version = ContractVersion {
            contract_id: id,
            version: contract.current_version + 1,
            content: draft.content.clone(),
            summary: draft.summary.clone(),
            breaking: breaking(previous.as_ref()),
            published_by: draft.published_by.clone(),
            created_at: now,
        };
        contract.current_version = version.version;
        contract.updated_at = now;
        history.push(version.clone());
        Ok(AppendedVersion { previous, version })
    }

    async fn list_contract_versions(
        &self,
        room: &RoomId,
        id: ContractId,
    ) -> Result<Vec<ContractVersion>> {
        let snapshot = self.inner.read().await;
        Ok(snapshot
            .rooms
            .get(room)
            .and_then(|r| r.versions.get(&id).cloned())
            .unwrap_or_default())
    }

    async fn list_contract_dependencies(&self, room: &RoomId) -> Result<Vec<ContractDependency>> {
        let snapshot = self.inner.read().await;
        Ok(snapshot
            .rooms
            .get(room)
            .map(|r| r.contract_dependencies.clone())
            .unwrap_or_default())
    }

    async fn add_contract_dependency(
        &self,
        room: &RoomId,
        dependency: ContractDependency,
    ) -> Result<()> {
        let mut snapshot = self.inner.write().await;
        let data = snapshot.rooms.entry(room.clone()).or_default();
        if !data.contract_dependencies.contains(&dependency) {
            data.contract_dependencies.push(dependency);
        }
        Ok(())
    }

    async fn remove_contract_dependency(
        &self,
        room: &RoomId,
        dependency: &ContractDependency,
    ) -> Result<bool> {
        let mut snapshot = self.inner.write().await;
        let Some(data) = snapshot.rooms.get_mut(room) else {
            return Ok(false);
        };
        let before = data.contract_dependencies.len();
        data.contract_dependencies.retain(|d| d != dependency);
        Ok(data.contract_dependencies.len() != before)
    }

    async fn get_workspace(&self, room: &RoomId) -> Result<Option<WorkspaceRecord>> {
        let snapshot = self.inner.read().await;
        Ok(snapshot.rooms.get(room).and_then(|r| r.workspace.clone()))
    }

    async fn put_workspace(&self, record: WorkspaceRecord) -> Result<()> {
        let mut snapshot = self.inner.write().await;
        let room = record.room.clone();
        snapshot.rooms.entry(room).or_default().workspace = Some(record);
        Ok(())
    }

    async fn append_note(&self, note: NoteEntry) -> Result<()> {
        let mut snapshot = self.inner.write().await;
        snapshot.rooms.entry(note.room.clone()).or_default().notes.push(note);
        Ok(())
    }

    async fn list_notes(&self, room: &RoomId) -> Result<Vec<NoteEntry>> {
        let snapshot = self.inner.read().await;
        Ok(snapshot
            .rooms
            .get(room)
            .map(|r| r.notes.clone())
            .unwrap_or_default())
    }
}
