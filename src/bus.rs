//! Notification and event bus.
//!
//! Every state change and alert the core produces is published here as a
//! [`DomainEvent`]. Outside subscribers (UI, audit) and the monitor's own
//! reactor consume the same stream. Delivery is at-least-once from the
//! consumer's point of view, so consumers deduplicate by event id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::core::contract::ContractId;
use crate::core::task::{RoomId, StatusKind, TaskId};

/// Default capacity of the broadcast ring.
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who may observe an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scope", content = "user")]
pub enum Visibility {
    /// Everyone in the room.
    Room,
    /// A single user's private channel.
    User(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        };
        f.write_str(s)
    }
}

/// A severity-tagged alert as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub severity: Severity,
    pub message: String,
    pub key: String,
    #[serde(default)]
    pub task_ids: Vec<TaskId>,
    #[serde(default)]
    pub contract_ids: Vec<ContractId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum EventKind {
    TaskStatusChanged {
        task_id: TaskId,
        from: StatusKind,
        to: StatusKind,
    },
    TaskAssigned {
        task_id: TaskId,
        assignee: String,
    },
    TaskBlocked {
        task_id: TaskId,
        reason: String,
    },
    TaskUnblocked {
        task_id: TaskId,
    },
    ContractPublished {
        contract_id: ContractId,
        version: u32,
        breaking: bool,
    },
    SecurityAlert {
        message: String,
    },
    MemberJoined {
        user: String,
    },
    Alert(Alert),
    /// Human-readable message, usually private to one user.
    Notification {
        message: String,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::TaskStatusChanged { .. } => "task_status_changed",
            EventKind::TaskAssigned { .. } => "task_assigned",
            EventKind::TaskBlocked { .. } => "task_blocked",
            EventKind::TaskUnblocked { .. } => "task_unblocked",
            EventKind::ContractPublished { .. } => "contract_published",
            EventKind::SecurityAlert { .. } => "security_alert",
            EventKind::MemberJoined { .. } => "member_joined",
            EventKind::Alert(_) => "alert",
            EventKind::Notification { .. } => "notification",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub id: EventId,
    pub room: RoomId,
    pub visibility: Visibility,
    pub kind: EventKind,
    pub created_at: DateTime<Utc>,
}

impl DomainEvent {
    pub fn room(room: &RoomId, kind: EventKind) -> Self {
        Self {
            id: EventId::new(),
            room: room.clone(),
            visibility: Visibility::Room,
            kind,
            created_at: Utc::now(),
        }
    }

    pub fn private(room: &RoomId, user: &str, kind: EventKind) -> Self {
        Self {
            id: EventId::new(),
            room: room.clone(),
            visibility: Visibility::User(user.to_string()),
            kind,
            created_at: Utc::now(),
        }
    }
}

/// Broadcast bus shared by every component. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: DomainEvent) -> EventId {
        let id = event.id;
        trace!(event = event.kind.name(), room = %event.room, "publish");
        let _ = self.tx.send(event);
        id
    }

    pub fn status_changed(&self, room: &RoomId, task_id: TaskId, from: StatusKind, to: StatusKind) {
        self.publish(DomainEvent::room(
            room,
            EventKind::TaskStatusChanged { task_id, from, to },
        ));
    }

    /// Send a private, human-readable message to one user.
    pub fn notify(&self, room: &RoomId, user: &str, message: impl Into<String>) {
        self.publish(DomainEvent::private(
            room,
            user,
            EventKind::Notification {
                message: message.into(),
            },
        ));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
