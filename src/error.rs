use thiserror::Error;

use crate::core::task::{StatusKind, TaskId};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Contract not found: {0}")]
    ContractNotFound(String),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: StatusKind, to: StatusKind },

    #[error("Dependency from {from} to {to} would create a cycle")]
    DependencyCycle { from: TaskId, to: TaskId },

    #[error("Completion service error: {0}")]
    Completion(String),

    #[error("Command failed: {0}")]
    Command(String),

    #[error("Workspace error: {0}")]
    Workspace(String),
}

pub type Result<T> = std::result::Result<T, Error>;
