//! Contract publication and downstream impact.
//!
//! Publishing a version blocks every dependent task that is still in
//! flight, so nobody keeps building against a contract that moved under
//! them. Breakingness only decides whether the room is alerted.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::board::TaskBoard;
use crate::bus::{DomainEvent, EventKind, Severity};
use crate::completion::{CompletionPurpose, CompletionRequest, CompletionService};
use crate::contracts::breaking::{self, BreakingAssessment};
use crate::core::contract::{
    Contract, ContractDependency, ContractId, ContractKind, ContractVersion, DependencyKind,
    VersionDraft,
};
use crate::core::task::{RoomId, StatusKind, Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::signals::{Signal, Signals};
use crate::store::{NoteEntry, NoteKind, Store};
use crate::util::truncate_chars;

const SUMMARY_SYSTEM: &str = "You review API contract changes for an engineering team. \
Given a contract's previous and new content, reply with JSON \
{\"summary\": string, \"actions\": [string]}: a two-sentence summary of what changed \
and up to five concrete follow-up actions for the owners of the affected tasks.";

const FALLBACK_ACTIONS: &[&str] = &[
    "Review the contract diff with the publisher",
    "Update affected tasks to the new contract version",
    "Move each blocked task back to in progress once it is compatible",
];

/// Contract content sent to the summariser, per side.
const SUMMARY_CONTENT_CAP: usize = 8_000;

#[derive(Debug, Clone, PartialEq)]
pub struct ImpactReport {
    pub contract_id: ContractId,
    pub contract_name: String,
    pub version: u32,
    pub assessment: BreakingAssessment,
    /// Tasks this publication moved to blocked.
    pub blocked_tasks: Vec<TaskId>,
    /// Dependent tasks left alone (done, already blocked, or raced).
    pub unaffected: Vec<TaskId>,
    pub summary: String,
    pub actions: Vec<String>,
    /// Whether a room alert went out.
    pub alerted: bool,
}

#[derive(Debug, Deserialize)]
struct SummaryResponse {
    summary: String,
    #[serde(default)]
    actions: Vec<String>,
}

pub struct ImpactAnalyzer {
    store: Arc<dyn Store>,
    board: TaskBoard,
    signals: Signals,
    completion: Arc<dyn CompletionService>,
}

impl ImpactAnalyzer {
    pub fn new(board: TaskBoard, signals: Signals, completion: Arc<dyn CompletionService>) -> Self {
        Self {
            store: Arc::clone(board.store()),
            board,
            signals,
            completion,
        }
    }

    pub async fn register_contract(
        &self,
        room: &RoomId,
        name: &str,
        kind: ContractKind,
    ) -> Result<Contract> {
        let contract = Contract::new(name, kind);
        self.store.put_contract(room, contract.clone()).await?;
        info!(room = %room, contract = %name, %kind, "contract registered");
        Ok(contract)
    }

    /// Record that `task` consumes, produces or modifies `contract`.
    pub async fn add_dependency(
        &self,
        room: &RoomId,
        task: TaskId,
        contract: ContractId,
        kind: DependencyKind,
    ) -> Result<()> {
        self.board.task(room, task).await?;
        if self.store.get_contract(room, contract).await?.is_none() {
            return Err(Error::ContractNotFound(contract.to_string()));
        }
        self.store
            .add_contract_dependency(room, ContractDependency::new(task, contract, kind))
            .await
    }

    /// Publish a new version of `contract_id` and block its dependents.
    pub async fn publish(
        &self,
        room: &RoomId,
        contract_id: ContractId,
        draft: VersionDraft,
    ) -> Result<ImpactReport> {
        let contract = self
            .store
            .get_contract(room, contract_id)
            .await?
            .ok_or_else(|| Error::ContractNotFound(contract_id.to_string()))?;
        let kind = contract.kind;
        let decide = |previous: Option<&ContractVersion>| {
            breaking::assess(
                kind,
                previous.map(|v| v.content.as_str()),
                &draft.content,
                draft.breaking,
            )
        };
        let appended = self
            .store
            .append_contract_version(room, contract_id, &draft, &|previous| {
                decide(previous).breaking
            })
            .await?;
        let previous = appended.previous;
        let version = appended.version;
        let assessment = decide(previous.as_ref());
        info!(
            room = %room,
            contract = %contract.name,
            version = version.version,
            breaking = assessment.breaking,
            strategy = ?assessment.strategy,
            "contract version published"
        );

        let (blocked_tasks, unaffected) = self.block_dependents(room, &contract, &version).await?;

        self.board.bus().publish(DomainEvent::room(
            room,
            EventKind::ContractPublished {
                contract_id,
                version: version.version,
                breaking: assessment.breaking,
            },
        ));

        let alerted = if assessment.breaking && !blocked_tasks.is_empty() {
            let message = format!(
                "Breaking change to contract {} v{}: {} task(s) blocked",
                contract.name,
                version.version,
                blocked_tasks.len()
            );
            // keyed per version so a later breaking version is not muted
            // by the cooldown of the one before it
            let detail = format!("{}:v{}", contract_id, version.version);
            let signal = Signal::new(room, "contract_breaking", &detail, Severity::High, message)
                .with_tasks(blocked_tasks.clone())
                .with_contracts(vec![contract_id]);
            self.signals.emit(room, signal)
        } else {
            false
        };

        let (summary, actions) = self
            .summarize(&contract, previous.as_ref(), &version, &assessment, blocked_tasks.len())
            .await;

        let report = ImpactReport {
            contract_id,
            contract_name: contract.name.clone(),
            version: version.version,
            assessment,
            blocked_tasks,
            unaffected,
            summary,
            actions,
            alerted,
        };
        self.store
            .append_note(NoteEntry::new(
                room,
                None,
                NoteKind::ContractImpact,
                format!("Contract {} v{}", report.contract_name, report.version),
                impact_note_body(&report),
            ))
            .await?;
        Ok(report)
    }

    async fn block_dependents(
        &self,
        room: &RoomId,
        contract: &Contract,
        version: &ContractVersion,
    ) -> Result<(Vec<TaskId>, Vec<TaskId>)> {
        let mut dependents: Vec<TaskId> = self
            .store
            .list_contract_dependencies(room)
            .await?
            .into_iter()
            .filter(|d| d.contract_id == contract.id && d.kind.is_dependent())
            .map(|d| d.task_id)
            .collect();
        dependents.sort();
        dependents.dedup();

        let reason = format!(
            "contract {} v{} changed: {}",
            contract.name, version.version, version.summary
        );
        let mut blocked = Vec::new();
        let mut unaffected = Vec::new();
        for task_id in dependents {
            let applied = match self
                .board
                .transition(room, task_id, TaskStatus::blocked(reason.clone()), |t: &Task| {
                    !t.is_done() && t.kind() != StatusKind::Blocked
                })
                .await
            {
                Ok(applied) => applied,
                Err(Error::TaskNotFound(_)) => {
                    debug!(task = %task_id.short(), "dependent task no longer exists");
                    None
                }
                Err(e) => return Err(e),
            };
            match applied {
                Some(_) => blocked.push(task_id),
                None => unaffected.push(task_id),
            }
        }
        Ok((blocked, unaffected))
    }

    async fn summarize(
        &self,
        contract: &Contract,
        previous: Option<&ContractVersion>,
        version: &ContractVersion,
        assessment: &BreakingAssessment,
        blocked: usize,
    ) -> (String, Vec<String>) {
        let prompt = format!(
            "Contract: {} ({})\nVersion: {}\nPublisher summary: {}\nBreaking: {}\nEvidence:\n{}\n\nPrevious content:\n{}\n\nNew content:\n{}",
            contract.name,
            contract.kind,
            version.version,
            version.summary,
            assessment.breaking,
            assessment.evidence.join("\n"),
            previous
                .map(|v| truncate_chars(&v.content, SUMMARY_CONTENT_CAP))
                .unwrap_or_else(|| "(none)".to_string()),
            truncate_chars(&version.content, SUMMARY_CONTENT_CAP),
        );
        let request =
            CompletionRequest::new(CompletionPurpose::ImpactSummary, SUMMARY_SYSTEM, prompt);
        match self.completion.complete(&request).await.and_then(parse_summary) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(
                    contract = %contract.name,
                    error = %e,
                    "impact summary unavailable, using fallback"
                );
                fallback_summary(contract, version, assessment, blocked)
            }
        }
    }
}

fn parse_summary(value: Value) -> Result<(String, Vec<String>)> {
    let parsed: SummaryResponse = serde_json::from_value(value)?;
    if parsed.summary.trim().is_empty() {
        return Err(Error::Completion("empty impact summary".to_string()));
    }
    Ok((parsed.summary, parsed.actions))
}

fn fallback_summary(
    contract: &Contract,
    version: &ContractVersion,
    assessment: &BreakingAssessment,
    blocked: usize,
) -> (String, Vec<String>) {
    let kind = if assessment.breaking { "breaking" } else { "non-breaking" };
    let summary = format!(
        "Contract {} v{} published as a {} change: {}. {} dependent task(s) blocked pending review.",
        contract.name, version.version, kind, version.summary, blocked
    );
    (summary, FALLBACK_ACTIONS.iter().map(|s| s.to_string()).collect())
}

fn impact_note_body(report: &ImpactReport) -> String {
    let mut body = format!("{}\n\nBreaking: {}", report.summary, report.assessment.breaking);
    if !report.assessment.evidence.is_empty() {
        body.push_str("\nEvidence:");
        for line in &report.assessment.evidence {
            body.push_str(&format!("\n- {}", line));
        }
    }
    if !report.actions.is_empty() {
        body.push_str("\n\nActions:");
        for action in &report.actions {
            body.push_str(&format!("\n- {}", action));
        }
    }
    if !report.blocked_tasks.is_empty() {
        body.push_str("\n\nBlocked tasks:");
        for id in &report.blocked_tasks {
            body.push_str(&format!("\n- {}", id));
        }
    }
    body
}
