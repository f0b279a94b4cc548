//! Monitor tests: reactor idempotence, kickoff, sweep duties and the
//! run loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

use foreman::bus::{DomainEvent, EventKind, Severity};
use foreman::completion::CompletionPurpose;
use foreman::config::MonitorConfig;
use foreman::core::task::dependency_reason;
use foreman::core::{
    Contract, ContractDependency, ContractKind, DependencyKind, StatusKind, Task, TaskStatus,
};
use foreman::monitor::Reaction;
use foreman::store::NoteKind;
use foreman::Store;

use crate::fixtures::{alerts, drain, exit_ok, notifications_for, Harness};

fn joined(h: &Harness, user: &str) -> DomainEvent {
    DomainEvent::room(
        &h.room,
        EventKind::MemberJoined {
            user: user.to_string(),
        },
    )
}

fn stale(title: &str, assignee: &str) -> Task {
    let mut task = Task::new(title, "")
        .with_assignee(assignee)
        .with_status(TaskStatus::InProgress);
    task.updated_at = Utc::now() - chrono::Duration::hours(2);
    task
}

#[tokio::test]
async fn test_replayed_event_reacts_once() {
    let h = Harness::new().await;
    let monitor = h.monitor(MonitorConfig::default());
    h.add_task(Task::new("Write docs", "").with_assignee("ana")).await;
    let mut rx = h.bus.subscribe();
    let event = joined(&h, "ana");

    let first = monitor.handle(&event).await.unwrap();
    let second = monitor.handle(&event).await.unwrap();

    assert!(matches!(first, Reaction::Briefed { open_tasks: 1 }));
    assert!(matches!(second, Reaction::Ignored));
    let messages = notifications_for(&drain(&mut rx), "ana");
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("Write docs"));
}

#[tokio::test]
async fn test_events_outside_window_are_ignored() {
    let h = Harness::new().await;
    let monitor = h.monitor(MonitorConfig::default());
    let mut rx = h.bus.subscribe();
    let mut event = joined(&h, "ana");
    event.created_at = Utc::now() - chrono::Duration::minutes(10);

    let reaction = monitor.handle(&event).await.unwrap();

    assert!(matches!(reaction, Reaction::Ignored));
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_completed_dependency_unblocks_dependents() {
    let h = Harness::new().await;
    let monitor = h.monitor(MonitorConfig::default());
    let api = h
        .add_task(Task::new("Build API", "").with_status(TaskStatus::Done))
        .await;
    let ui = h
        .add_task(
            Task::new("Build UI", "")
                .with_status(TaskStatus::blocked(dependency_reason("Build API"))),
        )
        .await;
    h.board.link(&h.room, api.id, ui.id).await.unwrap();
    let event = DomainEvent::room(
        &h.room,
        EventKind::TaskStatusChanged {
            task_id: api.id,
            from: StatusKind::Review,
            to: StatusKind::Done,
        },
    );

    let reaction = monitor.handle(&event).await.unwrap();

    match reaction {
        Reaction::Resolved(ids) => assert_eq!(ids, vec![ui.id]),
        other => panic!("expected resolution, got {:?}", other),
    }
    assert_eq!(h.task(&ui).await.kind(), StatusKind::Todo);
}

#[tokio::test]
async fn test_assignment_kicks_off_an_execution_pass() {
    let h = Harness::with_workspace(&[
        ("src/profile.ts", "export const avatar = null;\n"),
        ("package.json", r#"{"scripts": {"test": "vitest run"}}"#),
    ])
    .await;
    let monitor = h.monitor(MonitorConfig::default());
    let task = h.add_task(Task::new("Add avatar to profile", "")).await;
    h.completion
        .push(CompletionPurpose::Plan, json!({"files": ["src/profile.ts"]}));
    h.completion.push(
        CompletionPurpose::Patch,
        json!({
            "summary": "avatar",
            "files": [{"path": "src/profile.ts", "content": "export const avatar = '/a.png';\n"}]
        }),
    );
    h.runner.script("npm run test", exit_ok());
    let mut rx = h.bus.subscribe();

    h.board.assign(&h.room, task.id, "ana").await.unwrap();
    let assigned = drain(&mut rx)
        .into_iter()
        .find(|e| matches!(e.kind, EventKind::TaskAssigned { .. }))
        .unwrap();

    match monitor.handle(&assigned).await.unwrap() {
        Reaction::Kickoff(pass) => assert_ok!(pass.await),
        other => panic!("expected a kickoff, got {:?}", other),
    }

    assert_eq!(h.task(&task).await.kind(), StatusKind::Review);
    let messages = notifications_for(&drain(&mut rx), "ana");
    assert!(messages.iter().any(|m| m.starts_with("Starting work")));
    assert!(messages.iter().any(|m| m.contains("ready for review")));
}

#[tokio::test]
async fn test_failed_pass_is_not_retried_on_unblock_event() {
    let h = Harness::new().await;
    let monitor = h.monitor(MonitorConfig::default());
    let task = h
        .add_task(
            Task::new("Flaky", "")
                .with_assignee("ana")
                .with_status(TaskStatus::blocked("verification_failed: npm run test")),
        )
        .await;
    let event = DomainEvent::room(&h.room, EventKind::TaskUnblocked { task_id: task.id });

    let reaction = monitor.handle(&event).await.unwrap();

    assert!(matches!(reaction, Reaction::Ignored));
    assert!(h.completion.requests().is_empty());
}

#[tokio::test]
async fn test_blocked_task_gets_alert_and_single_note() {
    let h = Harness::new().await;
    let monitor = h.monitor(MonitorConfig::default());
    let task = h
        .add_task(Task::new("Ship login", "").with_status(TaskStatus::InProgress))
        .await;
    let mut rx = h.bus.subscribe();

    let blocked = h
        .board
        .set_status(&h.room, task.id, TaskStatus::blocked("waiting on design"))
        .await
        .unwrap();
    assert_eq!(blocked.kind(), StatusKind::Blocked);
    let status_event = drain(&mut rx)
        .into_iter()
        .find(|e| matches!(e.kind, EventKind::TaskStatusChanged { to: StatusKind::Blocked, .. }))
        .unwrap();

    let reaction = monitor.handle(&status_event).await.unwrap();
    assert!(matches!(reaction, Reaction::BlockedAlert { alerted: true, noted: true }));

    // a second event for the same block neither re-alerts nor re-notes
    let again = DomainEvent::room(&h.room, status_event.kind.clone());
    let reaction = monitor.handle(&again).await.unwrap();
    assert!(matches!(reaction, Reaction::BlockedAlert { alerted: false, noted: false }));

    let raised = alerts(&drain(&mut rx));
    assert_eq!(raised.len(), 1);
    assert_eq!(raised[0].severity, Severity::Medium);
    let notes = h.notes().await;
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].kind, NoteKind::TaskBlocked);
    assert_eq!(notes[0].body, "waiting on design");
}

#[tokio::test]
async fn test_sweep_flags_stale_work_once_per_assignee() {
    let h = Harness::new().await;
    let monitor = h.monitor(MonitorConfig::default());
    h.add_task(stale("Old one", "ana")).await;
    h.add_task(stale("Old two", "ana")).await;
    h.add_task(stale("Old three", "bo")).await;
    h.add_task(Task::new("Fresh", "").with_assignee("bo").with_status(TaskStatus::InProgress))
        .await;
    let mut rx = h.bus.subscribe();

    let report = monitor.sweep().await.unwrap();

    assert_eq!(report.rooms, 1);
    assert_eq!(report.stale_alerts, 2);
    assert!(report.failed_rooms.is_empty());
    let raised = alerts(&drain(&mut rx));
    assert_eq!(raised.len(), 2);
    assert!(raised.iter().all(|a| a.severity == Severity::Low));
    let ana = raised.iter().find(|a| a.key.ends_with(":ana")).unwrap();
    assert_eq!(ana.task_ids.len(), 2);
    assert!(!raised.iter().any(|a| a.message.contains("Fresh")));

    // still cooling down
    let report = monitor.sweep().await.unwrap();
    assert_eq!(report.stale_alerts, 0);
    assert!(alerts(&drain(&mut rx)).is_empty());
}

#[tokio::test]
async fn test_sweep_skips_tasks_with_pass_in_flight() {
    let h = Harness::new().await;
    let monitor = h.monitor(MonitorConfig::default());
    let task = h.add_task(stale("Long build", "ana")).await;
    let _guard = h.pipeline.locks().try_acquire(&h.room, task.id).unwrap();

    let report = monitor.sweep().await.unwrap();

    assert_eq!(report.stale_alerts, 0);
}

#[tokio::test]
async fn test_sweep_unblocks_and_prunes() {
    let h = Harness::new().await;
    let monitor = h.monitor(MonitorConfig::default());
    let api = h
        .add_task(Task::new("Build API", "").with_status(TaskStatus::Done))
        .await;
    let ui = h
        .add_task(
            Task::new("Build UI", "")
                .with_status(TaskStatus::blocked(dependency_reason("Build API"))),
        )
        .await;
    h.board.link(&h.room, api.id, ui.id).await.unwrap();

    let live = Contract::new("users-api", ContractKind::OpenApi);
    h.store.put_contract(&h.room, live.clone()).await.unwrap();
    let gone = Contract::new("legacy-api", ContractKind::Other);
    h.store
        .add_contract_dependency(
            &h.room,
            ContractDependency::new(ui.id, live.id, DependencyKind::Consumes),
        )
        .await
        .unwrap();
    h.store
        .add_contract_dependency(
            &h.room,
            ContractDependency::new(ui.id, gone.id, DependencyKind::Consumes),
        )
        .await
        .unwrap();

    let report = monitor.sweep().await.unwrap();

    assert_eq!(report.unblocked, vec![ui.id]);
    assert_eq!(report.pruned_edges, 1);
    assert_eq!(h.task(&ui).await.kind(), StatusKind::Todo);
    let edges = h.store.list_contract_dependencies(&h.room).await.unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].contract_id, live.id);
}

#[tokio::test]
async fn test_run_reacts_until_cancelled() {
    let h = Harness::new().await;
    let monitor = Arc::new(h.monitor(MonitorConfig::default()));
    let mut rx = h.bus.subscribe();
    let cancel = CancellationToken::new();
    let running = {
        let monitor = Arc::clone(&monitor);
        let cancel = cancel.clone();
        tokio::spawn(async move { monitor.run(cancel).await })
    };

    // the reactor subscribes asynchronously; keep announcing until it answers
    let briefed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            h.bus.publish(joined(&h, "ana"));
            tokio::time::sleep(Duration::from_millis(20)).await;
            if !notifications_for(&drain(&mut rx), "ana").is_empty() {
                break;
            }
        }
    })
    .await;
    assert!(briefed.is_ok(), "reactor never briefed the new member");

    cancel.cancel();
    let stopped = tokio::time::timeout(Duration::from_secs(5), running).await;
    assert!(matches!(stopped, Ok(Ok(()))));
}
