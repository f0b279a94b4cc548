//! Contract publication end to end: dependents block, the room is
//! alerted, and the reactor records why.

use serde_json::json;

use foreman::bus::{EventKind, Severity};
use foreman::completion::CompletionPurpose;
use foreman::config::MonitorConfig;
use foreman::contracts::ImpactAnalyzer;
use foreman::core::{ContractKind, DependencyKind, StatusKind, Task, TaskStatus, VersionDraft};
use foreman::monitor::Reaction;
use foreman::store::NoteKind;

use crate::fixtures::{alerts, drain, Harness};

const V1: &str = r#"{"paths": {"/users": {"get": {}}, "/users/{id}": {"get": {}}}}"#;
const V2: &str = r#"{"paths": {"/users": {"get": {}}}}"#;

#[tokio::test]
async fn test_breaking_publish_blocks_dependents_and_reactor_notes_them() {
    let h = Harness::new().await;
    let analyzer = ImpactAnalyzer::new(h.board.clone(), h.signals.clone(), h.completion.clone());
    let monitor = h.monitor(MonitorConfig::default());

    let consumer = h
        .add_task(Task::new("Profile page", "").with_status(TaskStatus::InProgress))
        .await;
    let producer = h
        .add_task(Task::new("Users service", "").with_status(TaskStatus::InProgress))
        .await;
    let finished = h
        .add_task(Task::new("Old client", "").with_status(TaskStatus::Done))
        .await;
    let contract = analyzer
        .register_contract(&h.room, "users-api", ContractKind::OpenApi)
        .await
        .unwrap();
    analyzer
        .add_dependency(&h.room, consumer.id, contract.id, DependencyKind::Consumes)
        .await
        .unwrap();
    analyzer
        .add_dependency(&h.room, producer.id, contract.id, DependencyKind::Produces)
        .await
        .unwrap();
    analyzer
        .add_dependency(&h.room, finished.id, contract.id, DependencyKind::Modifies)
        .await
        .unwrap();
    analyzer
        .publish(&h.room, contract.id, VersionDraft::new(V1, "initial"))
        .await
        .unwrap();
    // the first publish blocked the consumer; put it back to work
    h.board
        .set_status(&h.room, consumer.id, TaskStatus::InProgress)
        .await
        .unwrap();

    h.completion.push(
        CompletionPurpose::ImpactSummary,
        json!({
            "summary": "GET /users/{id} was removed.",
            "actions": ["Fetch users from the list"]
        }),
    );
    let mut rx = h.bus.subscribe();
    let report = analyzer
        .publish(&h.room, contract.id, VersionDraft::new(V2, "drop user lookup"))
        .await
        .unwrap();

    assert_eq!(report.version, 2);
    assert!(report.assessment.breaking);
    assert_eq!(report.blocked_tasks, vec![consumer.id]);
    assert!(report.unaffected.contains(&finished.id));
    assert!(report.alerted);
    assert_eq!(report.summary, "GET /users/{id} was removed.");

    let blocked = h.task(&consumer).await;
    assert!(blocked.blocked_reason().unwrap().contains("users-api v2"));
    assert_eq!(h.task(&producer).await.kind(), StatusKind::InProgress);

    let events = drain(&mut rx);
    let raised = alerts(&events);
    assert_eq!(raised.len(), 1);
    assert_eq!(raised[0].severity, Severity::High);

    let mut blocked_alerts = 0;
    for event in &events {
        match monitor.handle(event).await.unwrap() {
            Reaction::BlockedAlert { noted, .. } => {
                assert!(noted);
                blocked_alerts += 1;
            }
            Reaction::HealthChecked { signals } => assert_eq!(signals, 0),
            _ => {}
        }
    }
    assert_eq!(blocked_alerts, 1);
    assert!(events
        .iter()
        .any(|e| matches!(e.kind, EventKind::ContractPublished { version: 2, .. })));

    let notes = h.notes().await;
    assert!(notes
        .iter()
        .any(|n| n.kind == NoteKind::TaskBlocked && n.task_id == Some(consumer.id)));
    assert_eq!(
        notes.iter().filter(|n| n.kind == NoteKind::ContractImpact).count(),
        2
    );
}
