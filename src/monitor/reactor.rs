//! Event reactor: one reaction per recognised domain event.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{health, Monitor};
use crate::bus::{DomainEvent, EventId, EventKind, Severity};
use crate::core::task::{RoomId, StatusKind, TaskId};
use crate::signals::Signal;
use crate::store::{NoteEntry, NoteKind};
use crate::Result;

/// Bounded set of handled event ids. When it grows past its cap the
/// oldest half is forgotten.
#[derive(Debug)]
pub struct ProcessedEvents {
    cap: usize,
    seen: HashSet<EventId>,
    order: VecDeque<EventId>,
}

impl ProcessedEvents {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(2),
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Record `id`. Returns false if it was already recorded.
    pub fn insert(&mut self, id: EventId) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.cap {
            let evict = self.order.len() / 2;
            for old in self.order.drain(..evict) {
                self.seen.remove(&old);
            }
            debug!(evicted = evict, remaining = self.order.len(), "processed event set trimmed");
        }
        true
    }

    pub fn contains(&self, id: &EventId) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// What the reactor did with an event.
#[derive(Debug)]
pub enum Reaction {
    /// Duplicate, outside the window, or not a type the reactor handles.
    Ignored,
    Resolved(Vec<TaskId>),
    BlockedAlert { alerted: bool, noted: bool },
    /// An execution pass was spawned for the assignee.
    Kickoff(JoinHandle<()>),
    HealthChecked { signals: usize },
    SecurityAlert { alerted: bool },
    Briefed { open_tasks: usize },
}

fn is_recognised(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::TaskStatusChanged {
            to: StatusKind::Done | StatusKind::Blocked,
            ..
        } | EventKind::TaskAssigned { .. }
            | EventKind::TaskUnblocked { .. }
            | EventKind::ContractPublished { .. }
            | EventKind::SecurityAlert { .. }
            | EventKind::MemberJoined { .. }
    )
}

impl Monitor {
    /// React to one event, at most once per event id.
    pub async fn handle(&self, event: &DomainEvent) -> Result<Reaction> {
        if !is_recognised(&event.kind) {
            return Ok(Reaction::Ignored);
        }
        if Utc::now() - event.created_at > self.config.event_window() {
            debug!(event = %event.id, kind = event.kind.name(), "event outside window");
            return Ok(Reaction::Ignored);
        }
        let fresh = self
            .processed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(event.id);
        if !fresh {
            return Ok(Reaction::Ignored);
        }

        let room = &event.room;
        debug!(room = %room, event = %event.id, kind = event.kind.name(), "reacting");
        match &event.kind {
            EventKind::TaskStatusChanged {
                task_id,
                to: StatusKind::Done,
                ..
            } => {
                let unblocked = self.board.resolve_dependents(room, *task_id).await?;
                Ok(Reaction::Resolved(unblocked))
            }
            EventKind::TaskStatusChanged { task_id, .. } => self.on_blocked(room, *task_id).await,
            EventKind::TaskAssigned { task_id, .. } | EventKind::TaskUnblocked { task_id } => {
                self.kickoff(room, *task_id).await
            }
            EventKind::ContractPublished { .. } => {
                let signals = self.check_workspace(room).await?;
                Ok(Reaction::HealthChecked { signals })
            }
            EventKind::SecurityAlert { message } => {
                let detail: String = message.chars().take(64).collect();
                let alerted = self.signals.emit(
                    room,
                    Signal::new(room, "security_alert", &detail, Severity::High, message.clone())
                        .with_cooldown(self.config.security_cooldown()),
                );
                Ok(Reaction::SecurityAlert { alerted })
            }
            EventKind::MemberJoined { user } => self.brief(room, user).await,
            _ => Ok(Reaction::Ignored),
        }
    }

    async fn on_blocked(&self, room: &RoomId, task_id: TaskId) -> Result<Reaction> {
        let task = self.board.task(room, task_id).await?;
        let Some(reason) = task.blocked_reason() else {
            return Ok(Reaction::Ignored);
        };

        let alerted = self.signals.emit(
            room,
            Signal::new(
                room,
                "task_blocked",
                &task_id.to_string(),
                Severity::Medium,
                format!("\"{}\" is blocked: {}", task.title, reason),
            )
            .with_cooldown(self.config.default_cooldown())
            .with_tasks(vec![task_id]),
        );

        let store = self.board.store();
        let exists = store.list_notes(room).await?.iter().any(|n| {
            n.kind == NoteKind::TaskBlocked && n.task_id == Some(task_id) && n.body == reason
        });
        if !exists {
            store
                .append_note(NoteEntry::new(
                    room,
                    Some(task_id),
                    NoteKind::TaskBlocked,
                    format!("Blocked: {}", task.title),
                    reason,
                ))
                .await?;
        }
        Ok(Reaction::BlockedAlert {
            alerted,
            noted: !exists,
        })
    }

    async fn kickoff(&self, room: &RoomId, task_id: TaskId) -> Result<Reaction> {
        let task = self.board.task(room, task_id).await?;
        let Some(assignee) = task.assignee.clone() else {
            return Ok(Reaction::Ignored);
        };
        if matches!(task.kind(), StatusKind::Done | StatusKind::Review) {
            return Ok(Reaction::Ignored);
        }
        if task.kind() == StatusKind::Blocked && !task.is_dependency_blocked() {
            // Failed passes stay blocked until someone retries them.
            return Ok(Reaction::Ignored);
        }

        self.board.bus().notify(
            room,
            &assignee,
            format!("Starting work on \"{}\".", task.title),
        );
        info!(room = %room, task = %task_id.short(), assignee = %assignee, "execution kickoff");

        let pipeline = Arc::clone(&self.pipeline);
        let room = room.clone();
        let handle = tokio::spawn(async move {
            match pipeline.run(&room, task_id).await {
                Ok(outcome) => debug!(
                    room = %room,
                    task = %task_id.short(),
                    ?outcome,
                    "execution pass finished"
                ),
                Err(e) => warn!(
                    room = %room,
                    task = %task_id.short(),
                    error = %e,
                    "execution pass errored"
                ),
            }
        });
        Ok(Reaction::Kickoff(handle))
    }

    async fn brief(&self, room: &RoomId, user: &str) -> Result<Reaction> {
        let open: Vec<_> = self
            .board
            .store()
            .list_tasks(room)
            .await?
            .into_iter()
            .filter(|t| t.assignee.as_deref() == Some(user) && !t.is_done())
            .collect();

        let message = if open.is_empty() {
            format!("Welcome to {}, {}. You have no open tasks.", room, user)
        } else {
            let lines: Vec<String> = open
                .iter()
                .map(|t| format!("- {} [{}]", t.title, t.status))
                .collect();
            format!(
                "Welcome to {}, {}. Your open tasks:\n{}",
                room,
                user,
                lines.join("\n")
            )
        };
        self.board.bus().notify(room, user, message);
        Ok(Reaction::Briefed {
            open_tasks: open.len(),
        })
    }

    /// Emit workspace health signals for a room that has a workspace.
    /// Returns the number of signals published.
    pub(crate) async fn check_workspace(&self, room: &RoomId) -> Result<usize> {
        if self.board.store().get_workspace(room).await?.is_none() {
            return Ok(0);
        }
        let status = self.workspaces.status(room).await?;
        let signals =
            health::workspace_signals(room, &status, self.workspaces.config(), &self.config);
        Ok(signals
            .into_iter()
            .filter(|signal| self.signals.emit(room, signal.clone()))
            .count())
    }
}
