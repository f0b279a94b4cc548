//! Periodic sweep over every room.

use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, info, warn};

use super::Monitor;
use crate::bus::Severity;
use crate::core::task::{RoomId, StatusKind, Task, TaskId};
use crate::signals::Signal;
use crate::Result;

/// Label used when batching stale tasks with no assignee.
const UNASSIGNED: &str = "unassigned";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub rooms: usize,
    pub stale_alerts: usize,
    pub unblocked: Vec<TaskId>,
    pub pruned_edges: usize,
    pub health_signals: usize,
    /// Rooms whose sweep hit an error.
    pub failed_rooms: Vec<RoomId>,
}

impl SweepReport {
    fn merge(&mut self, room: SweepReport) {
        self.stale_alerts += room.stale_alerts;
        self.unblocked.extend(room.unblocked);
        self.pruned_edges += room.pruned_edges;
        self.health_signals += room.health_signals;
    }
}

impl Monitor {
    /// Sweep every known room concurrently. A failing room is logged and
    /// skipped.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let rooms = self.board.store().list_rooms().await?;
        let outcomes = join_all(rooms.iter().map(|room| self.sweep_room(room))).await;

        let mut report = SweepReport {
            rooms: rooms.len(),
            ..Default::default()
        };
        for (room, outcome) in rooms.into_iter().zip(outcomes) {
            match outcome {
                Ok(partial) => report.merge(partial),
                Err(e) => {
                    warn!(room = %room, error = %e, "room sweep failed");
                    report.failed_rooms.push(room);
                }
            }
        }
        debug!(
            rooms = report.rooms,
            stale = report.stale_alerts,
            unblocked = report.unblocked.len(),
            pruned = report.pruned_edges,
            health = report.health_signals,
            "sweep finished"
        );
        Ok(report)
    }

    async fn sweep_room(&self, room: &RoomId) -> Result<SweepReport> {
        let mut report = SweepReport {
            stale_alerts: self.flag_stale(room).await?,
            unblocked: self.board.resolve_blocked(room).await?,
            pruned_edges: self.prune_contract_edges(room).await?,
            ..Default::default()
        };
        if let Some(lease) = self.workspaces.try_lease(room) {
            match self.workspaces.refresh_remote_if_due(&lease).await {
                Ok(true) => debug!(room = %room, "remote refreshed"),
                Ok(false) => {}
                Err(e) => warn!(room = %room, error = %e, "remote refresh failed"),
            }
        } else {
            debug!(room = %room, "workspace busy, skipping remote refresh");
        }
        report.health_signals = self.check_workspace(room).await?;
        Ok(report)
    }

    /// One low alert per assignee holding in_progress/review tasks that
    /// have not moved within the staleness threshold. Tasks with a pass in
    /// flight are not stale.
    async fn flag_stale(&self, room: &RoomId) -> Result<usize> {
        let cutoff = Utc::now() - self.config.stale_after();
        let mut by_assignee: BTreeMap<String, Vec<Task>> = BTreeMap::new();
        for task in self.board.store().list_tasks(room).await? {
            let active = matches!(task.kind(), StatusKind::InProgress | StatusKind::Review);
            if !active
                || task.updated_at >= cutoff
                || self.pipeline.locks().is_held(room, task.id)
            {
                continue;
            }
            let who = task.assignee.clone().unwrap_or_else(|| UNASSIGNED.to_string());
            by_assignee.entry(who).or_default().push(task);
        }

        let mut emitted = 0;
        for (assignee, tasks) in by_assignee {
            let titles: Vec<&str> = tasks.iter().map(|t| t.title.as_str()).collect();
            let signal = Signal::new(
                room,
                "stale_tasks",
                &assignee,
                Severity::Low,
                format!(
                    "{} task(s) for {} have not moved in {} minutes: {}",
                    tasks.len(),
                    assignee,
                    self.config.stale_after_mins,
                    titles.join(", ")
                ),
            )
            .with_cooldown(self.config.stale_cooldown())
            .with_tasks(tasks.iter().map(|t| t.id).collect());
            if self.signals.emit(room, signal) {
                emitted += 1;
            }
        }
        Ok(emitted)
    }

    /// Delete task-contract edges whose contract no longer exists.
    async fn prune_contract_edges(&self, room: &RoomId) -> Result<usize> {
        let store = self.board.store();
        let contracts: HashSet<_> = store
            .list_contracts(room)
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect();
        let mut pruned = 0;
        for edge in store.list_contract_dependencies(room).await? {
            if contracts.contains(&edge.contract_id) {
                continue;
            }
            if store.remove_contract_dependency(room, &edge).await? {
                info!(
                    room = %room,
                    task = %edge.task_id.short(),
                    contract = %edge.contract_id,
                    "removed dangling contract dependency"
                );
                pruned += 1;
            }
        }
        Ok(pruned)
    }
}
