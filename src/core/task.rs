//! Task data model for the room task graph.
//!
//! Tasks are the units of engineering work tracked per room. Each task
//! carries its lifecycle status, an optional assignee, and timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix shared by every block reason caused by an unfinished dependency.
pub const DEPENDENCY_REASON_PREFIX: &str = "waiting on dependency";

/// Identifier of a collaboration room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for a task.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Field-less discriminant of [`TaskStatus`], used for transition guards
/// and event payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Todo,
    InProgress,
    Blocked,
    Review,
    Done,
}

impl StatusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusKind::Todo => "todo",
            StatusKind::InProgress => "in_progress",
            StatusKind::Blocked => "blocked",
            StatusKind::Review => "review",
            StatusKind::Done => "done",
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Happy path is todo -> in_progress -> review -> done. Any of
    /// todo/in_progress/review may block; blocked returns to todo when its
    /// dependencies resolve or to in_progress on retry. Done is terminal.
    pub fn can_transition_to(&self, next: StatusKind) -> bool {
        use StatusKind::*;
        matches!(
            (*self, next),
            (Todo, InProgress)
                | (InProgress, Review)
                | (Review, Done)
                | (Todo, Blocked)
                | (InProgress, Blocked)
                | (Review, Blocked)
                | (Blocked, Todo)
                | (Blocked, InProgress)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StatusKind::Done)
    }
}

impl std::fmt::Display for StatusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task status in its lifecycle.
///
/// The block reason lives inside the `Blocked` variant, so a task has a
/// reason exactly when it is blocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Task created, not started.
    Todo,
    /// Task is being worked on.
    InProgress,
    /// Task cannot proceed.
    Blocked {
        /// Reason why the task is blocked.
        reason: String,
    },
    /// Change produced and awaiting human review.
    Review,
    /// Task accepted. Terminal.
    Done,
}

impl TaskStatus {
    pub fn kind(&self) -> StatusKind {
        match self {
            TaskStatus::Todo => StatusKind::Todo,
            TaskStatus::InProgress => StatusKind::InProgress,
            TaskStatus::Blocked { .. } => StatusKind::Blocked,
            TaskStatus::Review => StatusKind::Review,
            TaskStatus::Done => StatusKind::Done,
        }
    }

    pub fn blocked(reason: impl Into<String>) -> Self {
        TaskStatus::Blocked {
            reason: reason.into(),
        }
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Todo
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Blocked { reason } => write!(f, "blocked: {}", reason),
            other => f.write_str(other.kind().as_str()),
        }
    }
}

/// Block reason used when a task waits on an unfinished dependency.
pub fn dependency_reason(dependency_title: &str) -> String {
    format!("{}: {}", DEPENDENCY_REASON_PREFIX, dependency_title)
}

/// Whether a block reason is attributable to an unresolved dependency.
pub fn is_dependency_reason(reason: &str) -> bool {
    reason.starts_with(DEPENDENCY_REASON_PREFIX)
}

/// A unit of engineering work inside a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: String,
    pub status: TaskStatus,
    pub assignee: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a new todo task with a generated ID and current timestamps.
    pub fn new(title: &str, description: &str) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            title: title.to_string(),
            description: description.to_string(),
            acceptance_criteria: String::new(),
            status: TaskStatus::Todo,
            assignee: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_acceptance(mut self, criteria: &str) -> Self {
        self.acceptance_criteria = criteria.to_string();
        self
    }

    pub fn with_assignee(mut self, assignee: &str) -> Self {
        self.assignee = Some(assignee.to_string());
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    pub fn kind(&self) -> StatusKind {
        self.status.kind()
    }

    pub fn is_done(&self) -> bool {
        self.kind() == StatusKind::Done
    }

    pub fn blocked_reason(&self) -> Option<&str> {
        match &self.status {
            TaskStatus::Blocked { reason } => Some(reason),
            _ => None,
        }
    }

    /// Whether the task is blocked on an unresolved dependency.
    pub fn is_dependency_blocked(&self) -> bool {
        self.blocked_reason().is_some_and(is_dependency_reason)
    }

    /// Set a new status and bump `updated_at`. No transition check.
    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Directed edge: `to` requires `from` to be done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskDependency {
    pub from: TaskId,
    pub to: TaskId,
}

impl TaskDependency {
    pub fn new(from: TaskId, to: TaskId) -> Self {
        Self { from, to }
    }
}
