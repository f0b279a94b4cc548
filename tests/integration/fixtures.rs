//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A wired set of services over a temporary workspace root
//! - A scripted completion service
//! - A command runner that fakes package-manager commands and runs git

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::broadcast::Receiver;
use tokio::sync::Notify;

use foreman::bus::{Alert, DomainEvent, EventBus, EventKind, Visibility};
use foreman::completion::{CompletionPurpose, CompletionRequest, CompletionService};
use foreman::config::{ExecutionConfig, MonitorConfig, WorkspaceConfig};
use foreman::core::{RoomId, Task};
use foreman::signals::Signals;
use foreman::workspace::{
    CommandOutput, CommandRunner, CommandSpec, TokioCommandRunner, WorkspaceManager, WorkspaceRepo,
};
use foreman::{Error, MemoryStore, Monitor, Pipeline, Result, Store, TaskBoard};

/// Completion service answering from per-purpose queues.
#[derive(Default)]
pub struct ScriptedCompletion {
    responses: Mutex<HashMap<&'static str, VecDeque<Result<Value>>>>,
    requests: Mutex<Vec<CompletionRequest>>,
    plan_gate: Mutex<Option<Arc<Notify>>>,
}

impl ScriptedCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, purpose: CompletionPurpose, response: Value) {
        self.queue(purpose, Ok(response));
    }

    pub fn push_error(&self, purpose: CompletionPurpose, message: &str) {
        self.queue(purpose, Err(Error::Completion(message.to_string())));
    }

    fn queue(&self, purpose: CompletionPurpose, response: Result<Value>) {
        self.responses
            .lock()
            .unwrap()
            .entry(purpose.as_str())
            .or_default()
            .push_back(response);
    }

    /// Make plan requests wait until `gate` is notified.
    pub fn gate_plans(&self, gate: Arc<Notify>) {
        *self.plan_gate.lock().unwrap() = Some(gate);
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(&self, request: &CompletionRequest) -> Result<Value> {
        self.requests.lock().unwrap().push(request.clone());
        if request.purpose == CompletionPurpose::Plan {
            let gate = self.plan_gate.lock().unwrap().clone();
            if let Some(gate) = gate {
                gate.notified().await;
            }
        }
        self.responses
            .lock()
            .unwrap()
            .get_mut(request.purpose.as_str())
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Err(Error::Completion("no scripted response".to_string())))
    }
}

/// Runs git for real; answers package-manager and build tools from a
/// script so tests never need node or cargo on PATH.
#[derive(Default)]
pub struct RecordingRunner {
    real: TokioCommandRunner,
    scripted: Mutex<HashMap<String, CommandOutput>>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every command whose argv joins to `command` with `output`.
    pub fn script(&self, command: &str, output: CommandOutput) {
        self.scripted
            .lock()
            .unwrap()
            .insert(command.to_string(), output);
    }

    /// Every non-git argv run so far.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }
}

pub fn exit_ok() -> CommandOutput {
    CommandOutput {
        exit_code: Some(0),
        ..Default::default()
    }
}

pub fn exit_fail(code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        stderr: stderr.to_string(),
        exit_code: Some(code),
        ..Default::default()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        if spec.program() == "git" {
            return self.real.run(spec).await;
        }
        self.calls.lock().unwrap().push(spec.argv.clone());
        let scripted = self.scripted.lock().unwrap().get(&spec.argv.join(" ")).cloned();
        Ok(scripted.unwrap_or_else(|| exit_fail(127, "command not scripted")))
    }
}

/// A room with every service wired over temporary directories.
pub struct Harness {
    pub dir: TempDir,
    pub room: RoomId,
    pub store: Arc<MemoryStore>,
    pub bus: EventBus,
    pub board: TaskBoard,
    pub signals: Signals,
    pub runner: Arc<RecordingRunner>,
    pub completion: Arc<ScriptedCompletion>,
    pub workspaces: Arc<WorkspaceManager>,
    pub pipeline: Arc<Pipeline>,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let room = RoomId::from("room-1");
        let store = Arc::new(MemoryStore::new());
        store.create_room(&room).await;
        let bus = EventBus::new();
        let board = TaskBoard::new(store.clone(), bus.clone());
        let signals = Signals::new(bus.clone());
        let runner = Arc::new(RecordingRunner::new());
        let completion = Arc::new(ScriptedCompletion::new());
        let workspaces = Arc::new(WorkspaceManager::new(
            &dir.path().join("workspaces"),
            store.clone(),
            runner.clone(),
            WorkspaceConfig::default(),
        ));
        let pipeline = Arc::new(Pipeline::new(
            board.clone(),
            workspaces.clone(),
            completion.clone(),
            signals.clone(),
            ExecutionConfig::default(),
        ));
        Self {
            dir,
            room,
            store,
            bus,
            board,
            signals,
            runner,
            completion,
            workspaces,
            pipeline,
        }
    }

    /// A harness whose workspace is ready and holds `files`, committed.
    pub async fn with_workspace(files: &[(&str, &str)]) -> Self {
        let harness = Self::new().await;
        harness
            .workspaces
            .ensure_ready(&harness.room, None)
            .await
            .expect("Failed to prepare workspace");
        harness.commit_files(files, "Add fixtures");
        harness
    }

    pub fn workspace_path(&self) -> PathBuf {
        self.workspaces.path_for(&self.room)
    }

    pub fn commit_files(&self, files: &[(&str, &str)], message: &str) {
        let root = self.workspace_path();
        for (rel, content) in files {
            let full = root.join(rel);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(full, content).unwrap();
        }
        WorkspaceRepo::open(&root)
            .unwrap()
            .commit_all(message, &self.workspaces.author())
            .unwrap();
    }

    pub fn read(&self, rel: &str) -> String {
        std::fs::read_to_string(self.workspace_path().join(rel)).unwrap()
    }

    pub fn head_message(&self) -> String {
        let repo = git2::Repository::open(self.workspace_path()).unwrap();
        let commit = repo.head().unwrap().peel_to_commit().unwrap();
        commit.message().unwrap_or_default().to_string()
    }

    pub async fn add_task(&self, task: Task) -> Task {
        self.board.create_task(&self.room, task).await.unwrap()
    }

    pub async fn task(&self, task: &Task) -> Task {
        self.board.task(&self.room, task.id).await.unwrap()
    }

    pub async fn notes(&self) -> Vec<foreman::store::NoteEntry> {
        self.store.list_notes(&self.room).await.unwrap()
    }

    pub fn monitor(&self, config: MonitorConfig) -> Monitor {
        Monitor::new(
            self.board.clone(),
            self.workspaces.clone(),
            self.pipeline.clone(),
            self.signals.clone(),
            config,
        )
    }
}

/// Drain every event currently buffered in `rx`.
pub fn drain(rx: &mut Receiver<DomainEvent>) -> Vec<DomainEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn alerts(events: &[DomainEvent]) -> Vec<Alert> {
    events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::Alert(alert) => Some(alert.clone()),
            _ => None,
        })
        .collect()
}

/// Private notifications sent to `user`.
pub fn notifications_for(events: &[DomainEvent], user: &str) -> Vec<String> {
    events
        .iter()
        .filter(|e| e.visibility == Visibility::User(user.to_string()))
        .filter_map(|e| match &e.kind {
            EventKind::Notification { message } => Some(message.clone()),
            _ => None,
        })
        .collect()
}
