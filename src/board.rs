//! Task board: validated status transitions and dependency resolution.
//!
//! Every transition is a compare-and-set through [`Store::update_task`],
//! so concurrent resolvers cannot lose an update or double-apply one.

use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::bus::{DomainEvent, EventBus, EventKind};
use crate::core::dag::TaskGraph;
use crate::core::task::{
    dependency_reason, RoomId, StatusKind, Task, TaskDependency, TaskId, TaskStatus,
};
use crate::error::{Error, Result};
use crate::store::Store;

#[derive(Clone)]
pub struct TaskBoard {
    store: Arc<dyn Store>,
    bus: EventBus,
}

impl TaskBoard {
    pub fn new(store: Arc<dyn Store>, bus: EventBus) -> Self {
        Self { store, bus }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Load the room's current task graph.
    pub async fn graph(&self, room: &RoomId) -> Result<TaskGraph> {
        let tasks = self.store.list_tasks(room).await?;
        let edges = self.store.list_task_dependencies(room).await?;
        Ok(TaskGraph::from_parts(tasks, &edges))
    }

    pub async fn task(&self, room: &RoomId, id: TaskId) -> Result<Task> {
        self.store
            .get_task(room, id)
            .await?
            .ok_or(Error::TaskNotFound(id))
    }

    pub async fn create_task(&self, room: &RoomId, task: Task) -> Result<Task> {
        debug!(room = %room, task = %task.id.short(), title = %task.title, "create_task");
        self.store.put_task(room, task.clone()).await?;
        Ok(task)
    }

    /// Whether every dependency of `id` is done. Missing dependencies
    /// count as not done.
    pub async fn is_ready(&self, room: &RoomId, id: TaskId) -> Result<bool> {
        Ok(self.graph(room).await?.is_ready(&id))
    }

    /// Add the edge "`to` requires `from`". Self edges and edges that
    /// would close a cycle are rejected.
    pub async fn link(&self, room: &RoomId, from: TaskId, to: TaskId) -> Result<()> {
        let graph = self.graph(room).await?;
        for id in [from, to] {
            if !graph.contains_task(&id) {
                return Err(Error::TaskNotFound(id));
            }
        }
        if graph.would_create_cycle(&from, &to) {
            return Err(Error::DependencyCycle { from, to });
        }
        self.store
            .add_task_dependency(room, TaskDependency::new(from, to))
            .await?;
        debug!(room = %room, from = %from.short(), to = %to.short(), "dependency linked");
        Ok(())
    }

    /// Transition `id` to `next` if the state machine allows it.
    ///
    /// Completing a task resolves its dependency-blocked dependents.
    pub async fn set_status(&self, room: &RoomId, id: TaskId, next: TaskStatus) -> Result<Task> {
        let to = next.kind();
        match self.transition(room, id, next, |_| true).await? {
            Some(task) => {
                if to == StatusKind::Done {
                    self.resolve_dependents(room, id).await?;
                }
                Ok(task)
            }
            None => {
                let current = self.task(room, id).await?;
                Err(Error::InvalidTransition {
                    from: current.kind(),
                    to,
                })
            }
        }
    }

    /// Set the assignee. A todo task that is ready starts immediately.
    pub async fn assign(&self, room: &RoomId, id: TaskId, assignee: &str) -> Result<Task> {
        let updated = self
            .store
            .update_task(room, id, &|task: &Task| {
                let mut next = task.clone();
                next.assignee = Some(assignee.to_string());
                next.touch();
                Some(next)
            })
            .await?
            .ok_or(Error::TaskNotFound(id))?;
        self.bus.publish(DomainEvent::room(
            room,
            EventKind::TaskAssigned {
                task_id: id,
                assignee: assignee.to_string(),
            },
        ));
        info!(room = %room, task = %id.short(), assignee, "task assigned");

        if updated.kind() == StatusKind::Todo && self.is_ready(room, id).await? {
            let started = self
                .transition(room, id, TaskStatus::InProgress, |t| t.kind() == StatusKind::Todo)
                .await?;
            if let Some(task) = started {
                return Ok(task);
            }
        }
        Ok(updated)
    }

    /// Unblock every dependent of `completed` that is blocked on a
    /// dependency and now ready. Returns the unblocked task ids.
    pub async fn resolve_dependents(
        &self,
        room: &RoomId,
        completed: TaskId,
    ) -> Result<Vec<TaskId>> {
        let graph = self.graph(room).await?;
        let candidates: Vec<TaskId> = graph
            .dependents_of(&completed)
            .into_iter()
            .filter(|t| t.is_dependency_blocked() && graph.is_ready(&t.id))
            .map(|t| t.id)
            .collect();
        self.unblock_all(room, candidates).await
    }

    /// Sweep safety net: unblock every dependency-blocked task in the
    /// room whose dependencies are all done.
    pub async fn resolve_blocked(&self, room: &RoomId) -> Result<Vec<TaskId>> {
        let graph = self.graph(room).await?;
        let candidates: Vec<TaskId> = self
            .store
            .list_tasks(room)
            .await?
            .into_iter()
            .filter(|t| t.is_dependency_blocked() && graph.is_ready(&t.id))
            .map(|t| t.id)
            .collect();
        self.unblock_all(room, candidates).await
    }

    async fn unblock_all(&self, room: &RoomId, candidates: Vec<TaskId>) -> Result<Vec<TaskId>> {
        let mut unblocked = Vec::new();
        for id in candidates {
            let applied = self
                .transition(room, id, TaskStatus::Todo, Task::is_dependency_blocked)
                .await?;
            if applied.is_some() {
                info!(room = %room, task = %id.short(), "dependencies resolved, task unblocked");
                unblocked.push(id);
            }
        }
        Ok(unblocked)
    }

    /// Block a not-ready task on its unfinished dependencies. Returns the
    /// blocked task, or `None` when it is ready, done or already blocked.
    pub async fn block_on_dependencies(&self, room: &RoomId, id: TaskId) -> Result<Option<Task>> {
        let graph = self.graph(room).await?;
        let task = graph.get_task(&id).ok_or(Error::TaskNotFound(id))?;
        if task.is_done() || task.kind() == StatusKind::Blocked || graph.is_ready(&id) {
            return Ok(None);
        }
        let mut titles: Vec<&str> = graph
            .pending_dependencies(&id)
            .into_iter()
            .map(|t| t.title.as_str())
            .collect();
        if titles.is_empty() {
            titles.push("unknown task");
        }
        let reason = dependency_reason(&titles.join(", "));
        self.transition(room, id, TaskStatus::blocked(reason), |_| true)
            .await
    }

    /// Compare-and-set transition. Applies only when `guard` accepts the
    /// current task and the state machine allows the move; publishes the
    /// status events on success.
    pub(crate) async fn transition<G>(
        &self,
        room: &RoomId,
        id: TaskId,
        next: TaskStatus,
        guard: G,
    ) -> Result<Option<Task>>
    where
        G: Fn(&Task) -> bool + Send + Sync,
    {
        let to = next.kind();
        let previous: Mutex<Option<StatusKind>> = Mutex::new(None);
        let updated = self
            .store
            .update_task(room, id, &|task: &Task| {
                let from = task.kind();
                if !guard(task) || !from.can_transition_to(to) {
                    return None;
                }
                *previous.lock().unwrap_or_else(|p| p.into_inner()) = Some(from);
                let mut next_task = task.clone();
                next_task.set_status(next.clone());
                Some(next_task)
            })
            .await?;

        let from = *previous.lock().unwrap_or_else(|p| p.into_inner());
        match (updated, from) {
            (Some(task), Some(from)) => {
                self.publish_transition(room, &task, from);
                Ok(Some(task))
            }
            _ => Ok(None),
        }
    }

    fn publish_transition(&self, room: &RoomId, task: &Task, from: StatusKind) {
        let to = task.kind();
        debug!(room = %room, task = %task.id.short(), %from, %to, "status changed");
        self.bus.status_changed(room, task.id, from, to);
        if let Some(reason) = task.blocked_reason() {
            self.bus.publish(DomainEvent::room(
                room,
                EventKind::TaskBlocked {
                    task_id: task.id,
                    reason: reason.to_string(),
                },
            ));
        }
        if from == StatusKind::Blocked {
            self.bus.publish(DomainEvent::room(
                room,
                EventKind::TaskUnblocked { task_id: task.id },
            ));
        }
    }
}
