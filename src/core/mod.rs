//! Core domain models: tasks, contracts and the task dependency graph.

pub mod contract;
pub mod dag;
pub mod task;

pub use contract::{
    Contract, ContractDependency, ContractId, ContractKind, ContractVersion, DependencyKind,
    VersionDraft,
};
pub use dag::TaskGraph;
pub use task::{RoomId, StatusKind, Task, TaskDependency, TaskId, TaskStatus};
