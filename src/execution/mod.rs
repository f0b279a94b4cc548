//! Agentic execution pipeline.
//!
//! One pass takes a ready task through plan, patch, apply, verify and
//! commit inside the room's workspace. A pass either moves the task to
//! review or blocks it with a reason code; it never leaves a task
//! in_progress with nothing running.

pub mod context;
pub mod locks;
pub mod patch;
pub mod safety;
pub mod targets;
pub mod verify;

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::board::TaskBoard;
use crate::bus::Severity;
use crate::completion::{CompletionPurpose, CompletionRequest, CompletionService};
use crate::config::ExecutionConfig;
use crate::core::task::{RoomId, StatusKind, Task, TaskId, TaskStatus};
use crate::signals::{Signal, Signals};
use crate::store::{NoteEntry, NoteKind};
use crate::util::{tail_chars, truncate_chars};
use crate::workspace::{WorkspaceLease, WorkspaceManager};
use crate::Result;

pub use locks::{ExecutionGuard, ExecutionLocks};
use patch::PatchProposal;
use targets::{Plan, TargetSelection};
use verify::VerificationOutcome;

const PLAN_SYSTEM: &str = "You plan code changes for one engineering task. \
Reply with JSON {\"plan\": string, \"files\": [string], \"new_files\": [string]}: \
a short plan, existing repository files to edit, and files to create. \
Only list paths from the provided file list under \"files\".";

const PATCH_SYSTEM: &str = "You write code changes for one engineering task. \
Reply with JSON {\"summary\": string, \"diff\": string, \"files\": [{\"path\": string, \"content\": string}], \
\"verification\": [string], \"commit_message\": string}. \
\"diff\" is a unified diff against the given files; \"files\" holds complete new contents \
for every file you change. Only touch the listed target files. \"verification\" lists \
commands such as \"npm run test\"; shell syntax is not allowed.";

/// Reason codes recorded when a pass blocks its task.
pub mod reason {
    pub const WORKSPACE_UNAVAILABLE: &str = "workspace_unavailable";
    pub const PATCH_GENERATION_FAILED: &str = "patch_generation_failed";
    pub const PATCH_APPLY_FAILED: &str = "patch_apply_failed";
    pub const NO_EFFECTIVE_CHANGE: &str = "no_effective_change";
    pub const VERIFICATION_FAILED: &str = "verification_failed";
    pub const NOTHING_TO_COMMIT: &str = "nothing_to_commit";
    pub const COMMIT_FAILED: &str = "commit_failed";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyRunning,
    DependenciesPending,
    NotActionable,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PassOutcome {
    Completed {
        commit: String,
        changed_files: Vec<String>,
        pushed: bool,
    },
    Skipped(SkipReason),
    /// The task was blocked; `reason` starts with a reason code.
    Failed { reason: String },
}

/// Why a pass stopped early.
#[derive(Debug)]
struct Abort {
    code: &'static str,
    detail: String,
    output: Option<String>,
}

impl Abort {
    fn new(code: &'static str, detail: impl std::fmt::Display) -> Self {
        Self {
            code,
            detail: detail.to_string(),
            output: None,
        }
    }

    fn with_output(mut self, output: String) -> Self {
        self.output = Some(output);
        self
    }

    fn reason(&self) -> String {
        format!("{}: {}", self.code, self.detail)
    }
}

#[derive(Debug)]
struct Success {
    commit: String,
    changed_files: Vec<String>,
    summary: String,
    verified: Vec<String>,
    skipped: Vec<String>,
    pushed: bool,
}

pub struct Pipeline {
    board: TaskBoard,
    workspaces: Arc<WorkspaceManager>,
    completion: Arc<dyn CompletionService>,
    signals: Signals,
    locks: ExecutionLocks,
    config: ExecutionConfig,
}

impl Pipeline {
    pub fn new(
        board: TaskBoard,
        workspaces: Arc<WorkspaceManager>,
        completion: Arc<dyn CompletionService>,
        signals: Signals,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            board,
            workspaces,
            completion,
            signals,
            locks: ExecutionLocks::new(),
            config,
        }
    }

    pub fn locks(&self) -> &ExecutionLocks {
        &self.locks
    }

    /// Run one execution pass for `task_id`.
    ///
    /// `Err` is reserved for store failures; every pipeline failure blocks
    /// the task and returns [`PassOutcome::Failed`].
    pub async fn run(&self, room: &RoomId, task_id: TaskId) -> Result<PassOutcome> {
        let Some(_guard) = self.locks.try_acquire(room, task_id) else {
            debug!(room = %room, task = %task_id.short(), "execution already running");
            if let Ok(task) = self.board.task(room, task_id).await {
                let message = format!("Execution for \"{}\" is already running.", task.title);
                self.tell(room, &task, message);
            }
            return Ok(PassOutcome::Skipped(SkipReason::AlreadyRunning));
        };

        let task = self.board.task(room, task_id).await?;
        if matches!(task.kind(), StatusKind::Done | StatusKind::Review) {
            return Ok(PassOutcome::Skipped(SkipReason::NotActionable));
        }
        if !self.board.is_ready(room, task_id).await? {
            debug!(room = %room, task = %task_id.short(), "dependencies pending, not executing");
            self.board.block_on_dependencies(room, task_id).await?;
            return Ok(PassOutcome::Skipped(SkipReason::DependenciesPending));
        }

        let task = if task.kind() == StatusKind::InProgress {
            task
        } else {
            match self
                .board
                .transition(room, task_id, TaskStatus::InProgress, |t| {
                    matches!(t.kind(), StatusKind::Todo | StatusKind::Blocked)
                })
                .await?
            {
                Some(started) => started,
                None => return Ok(PassOutcome::Skipped(SkipReason::NotActionable)),
            }
        };
        info!(room = %room, task = %task_id.short(), title = %task.title, "execution pass started");

        match self.execute(room, &task).await {
            Ok(success) => self.succeed(room, &task, success).await,
            Err(abort) => self.fail(room, &task, abort).await,
        }
    }

    async fn execute(&self, room: &RoomId, task: &Task) -> std::result::Result<Success, Abort> {
        let lease = self.workspaces.lease(room).await;
        let record = self
            .workspaces
            .prepare(&lease, None)
            .await
            .map_err(|e| Abort::new(reason::WORKSPACE_UNAVAILABLE, e))?;
        let ctx = context::collect(&lease, self.config.max_context_files)
            .await
            .map_err(|e| Abort::new(reason::WORKSPACE_UNAVAILABLE, e))?;
        debug!(
            room = %room,
            files = ctx.files.len(),
            total = ctx.total_files,
            "workspace context collected"
        );

        let plan = self.plan(task, &ctx).await;
        let selection = targets::select(&plan, &ctx.files, task, &self.config);
        debug!(
            existing = ?selection.existing,
            new_files = ?selection.new_files,
            "targets selected"
        );
        if selection.is_empty() {
            return Err(Abort::new(
                reason::PATCH_GENERATION_FAILED,
                "no editable target files for this task",
            ));
        }

        let proposal = self.propose(&lease, task, &plan, &selection).await?;

        let root = lease.path().to_path_buf();
        let (edits, rejected) =
            patch::vet_files(&proposal.files, &root, &selection, &self.config.editable_extensions);
        for r in &rejected {
            warn!(room = %room, rejected = %r, "proposed file edit refused");
        }
        let extensions = &self.config.editable_extensions;
        let diff = proposal.diff.as_deref().and_then(|d| {
            match patch::vet_diff(d, &root, &selection, extensions) {
                Ok(_) => Some(d),
                Err(e) => {
                    warn!(room = %room, error = %e, "proposed diff refused");
                    None
                }
            }
        });

        let watched: Vec<String> = selection.all().cloned().collect();
        let dirty_before = lease
            .changed_files()
            .await
            .map_err(|e| Abort::new(reason::WORKSPACE_UNAVAILABLE, e))?;
        let before = patch::snapshot(&root, &watched);
        self.apply(&lease, diff, &edits).await?;
        self.check_scope(&lease, &selection, &dirty_before).await?;
        let after = patch::snapshot(&root, &watched);
        let changed_files = patch::changed_paths(&before, &after);
        if changed_files.is_empty() {
            return Err(Abort::new(
                reason::NO_EFFECTIVE_CHANGE,
                "applying the patch left every target unchanged",
            ));
        }

        let verification = verify::plan(&root, &proposal.verification);
        let (verified, skipped) = match verify::run(
            &lease,
            &verification,
            self.config.verify_timeout(),
            self.config.output_tail_chars,
        )
        .await
        .map_err(|e| Abort::new(reason::VERIFICATION_FAILED, e))?
        {
            VerificationOutcome::Passed { ran, skipped } => (ran, skipped),
            VerificationOutcome::Failed {
                command,
                cause,
                output,
            } => {
                return Err(Abort::new(
                    reason::VERIFICATION_FAILED,
                    format!("{} ({})", command, cause),
                )
                .with_output(output));
            }
        };

        let commit = self.commit(&lease, task, &proposal).await?;
        let branch = lease
            .current_branch()
            .await
            .ok()
            .flatten()
            .unwrap_or(record.default_branch);
        let pushed = self.push(&lease, task, &branch).await;

        Ok(Success {
            commit,
            changed_files,
            summary: proposal.summary,
            verified,
            skipped,
            pushed,
        })
    }

    async fn plan(&self, task: &Task, ctx: &context::WorkspaceContext) -> Plan {
        let prompt = format!(
            "{}\n\nWorkspace files ({} shown of {}):\n{}\n\nStatus:\n{}",
            task_brief(task),
            ctx.files.len(),
            ctx.total_files,
            ctx.files.join("\n"),
            if ctx.status_text.is_empty() { "(clean)" } else { ctx.status_text.as_str() },
        );
        let request = CompletionRequest::new(CompletionPurpose::Plan, PLAN_SYSTEM, prompt);
        match self.completion.complete(&request).await {
            Ok(value) => Plan::from_value(&value),
            Err(e) => {
                warn!(
                    task = %task.id.short(),
                    error = %e,
                    "plan request failed, ranking files instead"
                );
                Plan::default()
            }
        }
    }

    async fn propose(
        &self,
        lease: &WorkspaceLease,
        task: &Task,
        plan: &Plan,
        selection: &TargetSelection,
    ) -> std::result::Result<PatchProposal, Abort> {
        let mut contents = String::new();
        let mut budget = self.config.prompt_content_budget;
        for rel in &selection.existing {
            let Some(text) = lease
                .read_file(rel)
                .await
                .map_err(|e| Abort::new(reason::WORKSPACE_UNAVAILABLE, e))?
            else {
                continue;
            };
            let capped = truncate_chars(&text, self.config.file_content_cap.min(budget));
            budget = budget.saturating_sub(capped.chars().count());
            contents.push_str(&format!("=== {} ===\n{}\n\n", rel, capped));
            if budget == 0 {
                break;
            }
        }

        let prompt = format!(
            "{}\n\nPlan:\n{}\n\nTarget files:\n{}\nNew files you may create:\n{}\n\nFile contents:\n{}",
            task_brief(task),
            if plan.plan.is_empty() { "(none)" } else { plan.plan.as_str() },
            selection.existing.join("\n"),
            if selection.new_files.is_empty() {
                "(none)".to_string()
            } else {
                selection.new_files.join("\n")
            },
            contents,
        );
        let request = CompletionRequest::new(CompletionPurpose::Patch, PATCH_SYSTEM, prompt);
        self.completion
            .complete(&request)
            .await
            .and_then(PatchProposal::from_value)
            .map_err(|e| Abort::new(reason::PATCH_GENERATION_FAILED, e))
    }

    /// Prefer the diff; fall back to whole-file writes.
    async fn apply(
        &self,
        lease: &WorkspaceLease,
        diff: Option<&str>,
        edits: &[patch::FileEdit],
    ) -> std::result::Result<(), Abort> {
        let mut diff_error = None;
        if let Some(diff) = diff {
            match lease.apply_patch(diff).await {
                Ok(output) if output.success() => {
                    debug!(room = %lease.room(), "diff applied");
                    return Ok(());
                }
                Ok(output) => diff_error = Some(output.describe_failure()),
                Err(e) => diff_error = Some(e.to_string()),
            }
            debug!(
                room = %lease.room(),
                error = ?diff_error,
                "diff did not apply, trying file writes"
            );
        }

        if edits.is_empty() {
            let detail = diff_error.unwrap_or_else(|| "no usable diff or file edits".to_string());
            return Err(Abort::new(reason::PATCH_APPLY_FAILED, detail));
        }
        for edit in edits {
            lease
                .write_file(&edit.path, &edit.content)
                .await
                .map_err(|e| {
                    Abort::new(reason::PATCH_APPLY_FAILED, format!("{}: {}", edit.path, e))
                })?;
        }
        Ok(())
    }

    /// Every path the patch left changed must be a selected target.
    async fn check_scope(
        &self,
        lease: &WorkspaceLease,
        selection: &TargetSelection,
        dirty_before: &[String],
    ) -> std::result::Result<(), Abort> {
        let stray: Vec<String> = lease
            .changed_files()
            .await
            .map_err(|e| Abort::new(reason::PATCH_APPLY_FAILED, e))?
            .into_iter()
            .filter(|path| !selection.contains(path) && !dirty_before.contains(path))
            .collect();
        if stray.is_empty() {
            return Ok(());
        }
        warn!(room = %lease.room(), stray = ?stray, "patch changed files outside the targets");
        if let Err(e) = lease.discard(stray.clone()).await {
            warn!(room = %lease.room(), error = %e, "could not discard out-of-scope changes");
        }
        Err(Abort::new(
            reason::PATCH_APPLY_FAILED,
            format!("patch changed files outside the targets: {}", stray.join(", ")),
        ))
    }

    async fn commit(
        &self,
        lease: &WorkspaceLease,
        task: &Task,
        proposal: &PatchProposal,
    ) -> std::result::Result<String, Abort> {
        let has_changes = lease
            .has_changes()
            .await
            .map_err(|e| Abort::new(reason::COMMIT_FAILED, e))?;
        if !has_changes {
            return Err(Abort::new(reason::NOTHING_TO_COMMIT, "working tree is clean"));
        }
        let message = commit_message(task, proposal);
        match lease.commit_all(&message).await {
            Ok(Some(oid)) => Ok(oid),
            Ok(None) => Err(Abort::new(reason::NOTHING_TO_COMMIT, "tree unchanged after staging")),
            Err(e) => Err(Abort::new(reason::COMMIT_FAILED, e)),
        }
    }

    async fn push(&self, lease: &WorkspaceLease, task: &Task, branch: &str) -> bool {
        match lease.has_remote().await {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                debug!(error = %e, "could not read remote, skipping push");
                return false;
            }
        }
        let failure = match lease.push(branch).await {
            Ok(output) if output.success() => {
                info!(room = %lease.room(), branch, "pushed");
                return true;
            }
            Ok(output) => output.describe_failure(),
            Err(e) => e.to_string(),
        };
        warn!(room = %lease.room(), branch, error = %failure, "push failed");
        let signal = Signal::new(
            lease.room(),
            "push_failed",
            &task.id.to_string(),
            Severity::Medium,
            format!(
                "Committed \"{}\" but could not push to {}: {}",
                task.title, branch, failure
            ),
        )
        .with_tasks(vec![task.id]);
        self.signals.emit(lease.room(), signal);
        false
    }

    async fn succeed(&self, room: &RoomId, task: &Task, success: Success) -> Result<PassOutcome> {
        let moved = self
            .board
            .transition(room, task.id, TaskStatus::Review, |t| t.kind() == StatusKind::InProgress)
            .await?;
        if moved.is_none() {
            warn!(
                room = %room,
                task = %task.id.short(),
                "task changed during execution, not moving to review"
            );
        }

        let mut body = format!(
            "{}\n\nCommit: {}\nChanged files:\n{}",
            success.summary,
            success.commit,
            bullet_list(&success.changed_files)
        );
        if !success.verified.is_empty() {
            body.push_str(&format!("\nVerified with:\n{}", bullet_list(&success.verified)));
        }
        if !success.skipped.is_empty() {
            body.push_str(&format!("\nSkipped commands:\n{}", bullet_list(&success.skipped)));
        }
        if !success.pushed {
            body.push_str("\nNot pushed.");
        }
        self.board
            .store()
            .append_note(NoteEntry::new(
                room,
                Some(task.id),
                NoteKind::ExecutionSucceeded,
                format!("Executed: {}", task.title),
                body,
            ))
            .await?;

        info!(
            room = %room,
            task = %task.id.short(),
            commit = %success.commit,
            files = success.changed_files.len(),
            "execution pass succeeded"
        );
        self.tell(
            room,
            task,
            format!(
                "\"{}\" is ready for review: {} file(s) changed in {}.",
                task.title,
                success.changed_files.len(),
                short_oid(&success.commit)
            ),
        );
        Ok(PassOutcome::Completed {
            commit: success.commit,
            changed_files: success.changed_files,
            pushed: success.pushed,
        })
    }

    async fn fail(&self, room: &RoomId, task: &Task, abort: Abort) -> Result<PassOutcome> {
        let reason = abort.reason();
        warn!(room = %room, task = %task.id.short(), reason = %reason, "execution pass failed");
        self.board
            .transition(room, task.id, TaskStatus::blocked(reason.clone()), |t| {
                !matches!(t.kind(), StatusKind::Done | StatusKind::Blocked)
            })
            .await?;

        let mut body = reason.clone();
        if let Some(output) = &abort.output {
            body.push_str(&format!("\n\nOutput:\n{}", output));
        }
        self.board
            .store()
            .append_note(NoteEntry::new(
                room,
                Some(task.id),
                NoteKind::ExecutionFailed,
                format!("Execution failed: {}", task.title),
                body,
            ))
            .await?;

        let mut message = format!("Execution of \"{}\" stopped: {}", task.title, reason);
        if let Some(output) = &abort.output {
            message.push_str(&format!("\n{}", tail_chars(output, 1_000)));
        }
        self.tell(room, task, message);
        Ok(PassOutcome::Failed { reason })
    }

    /// Private message to the assignee. Unassigned tasks have nobody to
    /// tell.
    fn tell(&self, room: &RoomId, task: &Task, message: String) {
        match &task.assignee {
            Some(user) => self.board.bus().notify(room, user, message),
            None => debug!(room = %room, task = %task.id.short(), "no assignee to notify"),
        }
    }
}

fn task_brief(task: &Task) -> String {
    let mut brief = format!("Task: {}\n\n{}", task.title, task.description);
    if !task.acceptance_criteria.is_empty() {
        brief.push_str(&format!("\n\nAcceptance criteria:\n{}", task.acceptance_criteria));
    }
    brief
}

fn commit_message(task: &Task, proposal: &PatchProposal) -> String {
    let subject: String = task.title.chars().take(72).collect();
    let body = if proposal.commit_message.trim().is_empty() {
        proposal.summary.trim()
    } else {
        proposal.commit_message.trim()
    };
    if body.is_empty() {
        format!("{}\n\nTask: {}", subject, task.id)
    } else {
        format!("{}\n\n{}\n\nTask: {}", subject, body, task.id)
    }
}

fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|i| format!("- {}", i))
        .collect::<Vec<_>>()
        .join("\n")
}

fn short_oid(oid: &str) -> &str {
    oid.get(..8).unwrap_or(oid)
}
