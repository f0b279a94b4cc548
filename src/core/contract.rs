//! Contracts and their append-only version history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::task::TaskId;

/// Unique identifier for a contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContractId(pub Uuid);

impl ContractId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for ContractId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ContractId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ContractId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// The shape of a contract's content, which selects the breaking-change
/// heuristic applied on publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContractKind {
    OpenApi,
    JsonSchema,
    GraphQl,
    TypeScript,
    Protobuf,
    #[default]
    Other,
}

impl std::fmt::Display for ContractKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContractKind::OpenApi => "openapi",
            ContractKind::JsonSchema => "json_schema",
            ContractKind::GraphQl => "graphql",
            ContractKind::TypeScript => "typescript",
            ContractKind::Protobuf => "protobuf",
            ContractKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// A versioned interface or schema artifact shared by tasks in a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub id: ContractId,
    pub name: String,
    pub kind: ContractKind,
    /// Highest committed version number, 0 before the first publish.
    pub current_version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Contract {
    pub fn new(name: &str, kind: ContractKind) -> Self {
        let now = Utc::now();
        Self {
            id: ContractId::new(),
            name: name.to_string(),
            kind,
            current_version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One immutable entry in a contract's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractVersion {
    pub contract_id: ContractId,
    pub version: u32,
    pub content: String,
    pub summary: String,
    pub breaking: bool,
    pub published_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A version before the store has numbered it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VersionDraft {
    pub content: String,
    pub summary: String,
    /// Explicit publisher verdict; `None` defers to the heuristic.
    pub breaking: Option<bool>,
    pub published_by: Option<String>,
}

impl VersionDraft {
    pub fn new(content: &str, summary: &str) -> Self {
        Self {
            content: content.to_string(),
            summary: summary.to_string(),
            ..Default::default()
        }
    }

    pub fn breaking(mut self, breaking: bool) -> Self {
        self.breaking = Some(breaking);
        self
    }

    pub fn by(mut self, user: &str) -> Self {
        self.published_by = Some(user.to_string());
        self
    }
}

/// How a task relates to a contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    Consumes,
    Produces,
    Modifies,
}

impl DependencyKind {
    /// Whether a new version of the contract can break this task's work.
    pub fn is_dependent(&self) -> bool {
        matches!(self, DependencyKind::Consumes | DependencyKind::Modifies)
    }
}

/// Edge from a task to a contract it consumes, produces or modifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContractDependency {
    pub task_id: TaskId,
    pub contract_id: ContractId,
    pub kind: DependencyKind,
}

impl ContractDependency {
    pub fn new(task_id: TaskId, contract_id: ContractId, kind: DependencyKind) -> Self {
        Self {
            task_id,
            contract_id,
            kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_contract_has_no_version() {
        let contract = Contract::new("users-api", ContractKind::OpenApi);
        assert_eq!(contract.current_version, 0);
        assert_eq!(contract.kind.to_string(), "openapi");
    }

    #[test]
    fn test_dependency_kind_is_dependent() {
        assert!(DependencyKind::Consumes.is_dependent());
        assert!(DependencyKind::Modifies.is_dependent());
        assert!(!DependencyKind::Produces.is_dependent());
    }

    #[test]
    fn test_version_draft_builder() {
        let draft = VersionDraft::new("{}", "initial").breaking(true).by("ana");
        assert_eq!(draft.breaking, Some(true));
        assert_eq!(draft.published_by.as_deref(), Some("ana"));
    }

    #[test]
    fn test_contract_kind_serialization() {
        let json = serde_json::to_string(&ContractKind::TypeScript).unwrap();
        assert_eq!(json, "\"type_script\"");
        let parsed: ContractKind = serde_json::from_str("\"open_api\"").unwrap();
        assert_eq!(parsed, ContractKind::OpenApi);
    }
}
