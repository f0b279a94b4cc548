use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use foreman::bus::{DomainEvent, EventKind, Visibility};
use foreman::completion::HeadlessCompletion;
use foreman::config::Config;
use foreman::contracts::ImpactAnalyzer;
use foreman::core::{
    ContractId, ContractKind, DependencyKind, RoomId, Task, TaskId, TaskStatus, VersionDraft,
};
use foreman::monitor::Reaction;
use foreman::signals::Signals;
use foreman::workspace::{CommandRunner, TokioCommandRunner, WorkspaceManager};
use foreman::{
    Error, EventBus, MemoryStore, Monitor, PassOutcome, Pipeline, Result, Store, TaskBoard,
};

/// Foreman - task graph, contract impact and execution monitor for
/// collaborative engineering rooms
#[derive(Parser, Debug)]
#[command(name = "foreman")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    FOREMAN_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.foreman/foreman.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// State snapshot file (default: ~/.foreman/state.json)
    #[arg(long, global = true)]
    pub state: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the monitor until Ctrl-C
    Run,

    /// Create or repair a room's workspace
    Init {
        #[arg(long)]
        room: String,

        /// Remote to clone from and push to
        #[arg(long)]
        remote: Option<String>,
    },

    /// Fast-forward a room's workspace from its remote
    Sync {
        #[arg(long)]
        room: String,
    },

    /// Show a room's tasks and workspace health
    Status {
        #[arg(long)]
        room: String,
    },

    /// Run one execution pass for a task
    Execute {
        #[arg(long)]
        room: String,

        #[arg(long)]
        task: String,
    },

    /// Create, link, assign and move tasks
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },

    /// Register contracts, record task dependencies and publish versions
    Contract {
        #[command(subcommand)]
        action: ContractAction,
    },

    /// Announce a member joining a room; they are briefed on open work
    Join {
        #[arg(long)]
        room: String,

        #[arg(long)]
        user: String,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum TaskAction {
    /// Create a task
    Add {
        #[arg(long)]
        room: String,

        title: String,

        #[arg(long, default_value = "")]
        description: String,

        #[arg(long)]
        acceptance: Option<String>,

        #[arg(long)]
        assignee: Option<String>,

        /// Tasks (id or prefix) that must finish first
        #[arg(long)]
        after: Vec<String>,
    },

    /// Make `to` depend on `from`
    Link {
        #[arg(long)]
        room: String,

        #[arg(long)]
        from: String,

        #[arg(long)]
        to: String,
    },

    /// Assign a task; a ready todo task starts work
    Assign {
        #[arg(long)]
        room: String,

        #[arg(long)]
        task: String,

        #[arg(long)]
        user: String,
    },

    /// Move a task to another status
    Move {
        #[arg(long)]
        room: String,

        #[arg(long)]
        task: String,

        #[arg(value_enum)]
        status: StatusArg,

        /// Required when blocking
        #[arg(long)]
        reason: Option<String>,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum ContractAction {
    /// Register a contract
    Register {
        #[arg(long)]
        room: String,

        name: String,

        #[arg(long, value_enum, default_value_t = KindArg::Other)]
        kind: KindArg,
    },

    /// Record that a task consumes, produces or modifies a contract
    Depend {
        #[arg(long)]
        room: String,

        #[arg(long)]
        task: String,

        /// Contract id, id prefix or name
        #[arg(long)]
        contract: String,

        #[arg(long, value_enum)]
        kind: DependencyArg,
    },

    /// Publish a new version from a file and block dependents
    Publish {
        #[arg(long)]
        room: String,

        /// Contract id, id prefix or name
        #[arg(long)]
        contract: String,

        #[arg(long)]
        file: PathBuf,

        #[arg(long)]
        summary: String,

        /// Override the breaking-change heuristic
        #[arg(long)]
        breaking: Option<bool>,

        #[arg(long)]
        by: Option<String>,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusArg {
    Todo,
    InProgress,
    Blocked,
    Review,
    Done,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindArg {
    Openapi,
    JsonSchema,
    Graphql,
    Typescript,
    Protobuf,
    Other,
}

impl From<KindArg> for ContractKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Openapi => ContractKind::OpenApi,
            KindArg::JsonSchema => ContractKind::JsonSchema,
            KindArg::Graphql => ContractKind::GraphQl,
            KindArg::Typescript => ContractKind::TypeScript,
            KindArg::Protobuf => ContractKind::Protobuf,
            KindArg::Other => ContractKind::Other,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyArg {
    Consumes,
    Produces,
    Modifies,
}

impl From<DependencyArg> for DependencyKind {
    fn from(kind: DependencyArg) -> Self {
        match kind {
            DependencyArg::Consumes => DependencyKind::Consumes,
            DependencyArg::Produces => DependencyKind::Produces,
            DependencyArg::Modifies => DependencyKind::Modifies,
        }
    }
}

/// Status for a `task move`. Blocking needs a reason.
fn target_status(status: StatusArg, reason: Option<String>) -> Result<TaskStatus> {
    Ok(match status {
        StatusArg::Todo => TaskStatus::Todo,
        StatusArg::InProgress => TaskStatus::InProgress,
        StatusArg::Review => TaskStatus::Review,
        StatusArg::Done => TaskStatus::Done,
        StatusArg::Blocked => match reason {
            Some(reason) if !reason.trim().is_empty() => TaskStatus::blocked(reason),
            _ => return Err(Error::Validation("blocking a task needs --reason".to_string())),
        },
    })
}

/// Everything a command needs, wired once.
struct Services {
    config: Config,
    store: Arc<MemoryStore>,
    state_path: PathBuf,
    board: TaskBoard,
    signals: Signals,
    runner: Arc<dyn CommandRunner>,
    workspaces: Arc<WorkspaceManager>,
}

impl Services {
    fn load(state: Option<PathBuf>) -> Result<Self> {
        let config = Config::load()?;
        config.ensure_dirs()?;
        let state_path = match state {
            Some(path) => path,
            None => Config::state_path()?,
        };
        let store = Arc::new(MemoryStore::load(&state_path)?);
        let bus = EventBus::new();
        let board = TaskBoard::new(store.clone(), bus.clone());
        let runner: Arc<dyn CommandRunner> = Arc::new(TokioCommandRunner::new());
        let workspaces = Arc::new(WorkspaceManager::new(
            &config.workspaces_dir()?,
            store.clone(),
            runner.clone(),
            config.workspace.clone(),
        ));
        Ok(Self {
            config,
            store,
            state_path,
            board,
            signals: Signals::new(bus),
            runner,
            workspaces,
        })
    }

    fn monitor(&self) -> Result<Monitor> {
        Ok(Monitor::new(
            self.board.clone(),
            self.workspaces.clone(),
            self.pipeline()?,
            self.signals.clone(),
            self.config.monitor.clone(),
        ))
    }

    /// Contract analyzer. Without a completion CLI on PATH, impact
    /// summaries use the built-in fallback text.
    fn analyzer(&self) -> ImpactAnalyzer {
        let completion = HeadlessCompletion::new(&self.config.completion, self.runner.clone())
            .unwrap_or_else(|e| {
                debug!(error = %e, "completion unavailable, summaries use fallback");
                HeadlessCompletion::with_binary(
                    PathBuf::from(&self.config.completion.command),
                    self.runner.clone(),
                )
            });
        ImpactAnalyzer::new(self.board.clone(), self.signals.clone(), Arc::new(completion))
    }

    fn pipeline(&self) -> Result<Arc<Pipeline>> {
        let completion = HeadlessCompletion::new(&self.config.completion, self.runner.clone())?;
        Ok(Arc::new(Pipeline::new(
            self.board.clone(),
            self.workspaces.clone(),
            Arc::new(completion),
            self.signals.clone(),
            self.config.execution.clone(),
        )))
    }

    async fn save(&self) -> Result<()> {
        self.store.save(&self.state_path).await
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    foreman::log::init_with_debug(cli.debug);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let services = Services::load(cli.state)?;
        match cli.command {
            Command::Run => run_monitor(&services).await,
            Command::Init { room, remote } => run_init(&services, &RoomId::new(room), remote).await,
            Command::Sync { room } => run_sync(&services, &RoomId::new(room)).await,
            Command::Status { room } => run_status(&services, &RoomId::new(room)).await,
            Command::Execute { room, task } => {
                run_execute(&services, &RoomId::new(room), &task).await
            }
            Command::Task { action } => run_task(&services, action).await,
            Command::Contract { action } => run_contract(&services, action).await,
            Command::Join { room, user } => run_join(&services, &RoomId::new(room), &user).await,
        }
    })
}

async fn run_monitor(services: &Services) -> Result<()> {
    let monitor = services.monitor()?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "could not listen for Ctrl-C");
            return;
        }
        info!("Ctrl-C received, shutting down");
        on_signal.cancel();
    });

    println!("Foreman monitoring (Ctrl-C to stop)");
    if let Some(path) = foreman::log::log_path() {
        println!("Log: {}", path.display());
    }
    monitor.run(cancel).await;
    services.save().await?;
    println!("State saved to {}", services.state_path.display());
    Ok(())
}

async fn run_init(services: &Services, room: &RoomId, remote: Option<String>) -> Result<()> {
    if !Config::config_path()?.exists() {
        services.config.save()?;
        info!("wrote default config");
    }
    services.store.create_room(room).await;
    let record = services.workspaces.ensure_ready(room, remote.as_deref()).await;
    services.save().await?;
    let record = record?;

    let json_output = serde_json::json!({
        "room": record.room,
        "path": record.path,
        "remote": record.remote_url,
        "branch": record.default_branch,
        "ready": record.ready,
    });
    println!("{}", serde_json::to_string_pretty(&json_output)?);
    Ok(())
}

async fn run_sync(services: &Services, room: &RoomId) -> Result<()> {
    let synced = services.workspaces.sync(room).await;
    services.save().await?;
    synced?;
    let status = services.workspaces.status(room).await?;
    println!(
        "Synced {} on {}",
        room,
        status.branch.as_deref().unwrap_or("-")
    );
    Ok(())
}

async fn run_status(services: &Services, room: &RoomId) -> Result<()> {
    let mut tasks = services.store.list_tasks(room).await?;
    tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    let status = services.workspaces.status(room).await?;

    println!("Room: {}", room);
    println!();
    if tasks.is_empty() {
        println!("  No tasks.");
    }
    for task in &tasks {
        println!(
            "  {}  {:<40} {:<12} {}",
            task.id.short(),
            task.title,
            task.kind().as_str(),
            task.assignee.as_deref().unwrap_or("-")
        );
        if let Some(reason) = task.blocked_reason() {
            println!("            reason: {}", reason);
        }
    }
    println!();
    println!("Workspace:");
    println!("  Ready:     {}", status.ready);
    println!("  Branch:    {}", status.branch.as_deref().unwrap_or("-"));
    println!("  Changed:   {}", status.changed_files.len());
    println!("  Conflicts: {}", status.conflicts.len());
    if status.has_remote {
        println!("  Remote:    {} ahead, {} behind", status.ahead, status.behind);
    }
    for file in &status.tracked_secret_files {
        println!("  WARNING: tracked environment file {}", file);
    }
    for finding in &status.secret_findings {
        println!("  WARNING: possible credential at {}", finding);
    }
    Ok(())
}

async fn run_execute(services: &Services, room: &RoomId, task: &str) -> Result<()> {
    let task_id = resolve_task(services.store.as_ref(), room, task).await?;
    let outcome = services.pipeline()?.run(room, task_id).await;
    services.save().await?;

    let json_output = match outcome? {
        PassOutcome::Completed {
            commit,
            changed_files,
            pushed,
        } => serde_json::json!({
            "task": task_id.to_string(),
            "status": "completed",
            "commit": commit,
            "changed_files": changed_files,
            "pushed": pushed,
        }),
        PassOutcome::Skipped(reason) => serde_json::json!({
            "task": task_id.to_string(),
            "status": "skipped",
            "reason": format!("{:?}", reason),
        }),
        PassOutcome::Failed { reason } => serde_json::json!({
            "task": task_id.to_string(),
            "status": "failed",
            "reason": reason,
        }),
    };
    println!("{}", serde_json::to_string_pretty(&json_output)?);
    Ok(())
}

async fn run_task(services: &Services, action: TaskAction) -> Result<()> {
    let events = services.board.bus().subscribe();
    let (room, task) = match action {
        TaskAction::Add {
            room,
            title,
            description,
            acceptance,
            assignee,
            after,
        } => {
            let room = RoomId::new(room);
            services.store.create_room(&room).await;
            let mut prerequisites = Vec::new();
            for raw in &after {
                prerequisites.push(resolve_task(services.store.as_ref(), &room, raw).await?);
            }
            let mut task = Task::new(&title, &description);
            if let Some(criteria) = acceptance {
                task = task.with_acceptance(&criteria);
            }
            let task = services.board.create_task(&room, task).await?;
            for from in prerequisites {
                services.board.link(&room, from, task.id).await?;
            }
            services.board.block_on_dependencies(&room, task.id).await?;
            let task = match assignee {
                Some(user) => services.board.assign(&room, task.id, &user).await?,
                None => services.board.task(&room, task.id).await?,
            };
            (room, task)
        }
        TaskAction::Link { room, from, to } => {
            let room = RoomId::new(room);
            let from = resolve_task(services.store.as_ref(), &room, &from).await?;
            let to = resolve_task(services.store.as_ref(), &room, &to).await?;
            services.board.link(&room, from, to).await?;
            services.board.block_on_dependencies(&room, to).await?;
            let task = services.board.task(&room, to).await?;
            (room, task)
        }
        TaskAction::Assign { room, task, user } => {
            let room = RoomId::new(room);
            let id = resolve_task(services.store.as_ref(), &room, &task).await?;
            let task = services.board.assign(&room, id, &user).await?;
            (room, task)
        }
        TaskAction::Move {
            room,
            task,
            status,
            reason,
        } => {
            let room = RoomId::new(room);
            let id = resolve_task(services.store.as_ref(), &room, &task).await?;
            let next = target_status(status, reason)?;
            let task = services.board.set_status(&room, id, next).await?;
            (room, task)
        }
    };
    react(services, events).await;
    services.save().await?;

    let task = services.board.task(&room, task.id).await.unwrap_or(task);
    let json_output = serde_json::json!({
        "task": task.id.to_string(),
        "title": task.title,
        "status": task.kind().as_str(),
        "reason": task.blocked_reason(),
        "assignee": task.assignee,
    });
    println!("{}", serde_json::to_string_pretty(&json_output)?);
    Ok(())
}

async fn run_contract(services: &Services, action: ContractAction) -> Result<()> {
    let events = services.board.bus().subscribe();
    let analyzer = services.analyzer();
    let json_output = match action {
        ContractAction::Register { room, name, kind } => {
            let room = RoomId::new(room);
            services.store.create_room(&room).await;
            let contract = analyzer.register_contract(&room, &name, kind.into()).await?;
            serde_json::json!({
                "contract": contract.id.to_string(),
                "name": contract.name,
                "kind": contract.kind.to_string(),
            })
        }
        ContractAction::Depend {
            room,
            task,
            contract,
            kind,
        } => {
            let room = RoomId::new(room);
            let task_id = resolve_task(services.store.as_ref(), &room, &task).await?;
            let contract_id = resolve_contract(services.store.as_ref(), &room, &contract).await?;
            analyzer
                .add_dependency(&room, task_id, contract_id, kind.into())
                .await?;
            serde_json::json!({
                "task": task_id.to_string(),
                "contract": contract_id.to_string(),
                "kind": format!("{:?}", DependencyKind::from(kind)).to_lowercase(),
            })
        }
        ContractAction::Publish {
            room,
            contract,
            file,
            summary,
            breaking,
            by,
        } => {
            let room = RoomId::new(room);
            let contract_id = resolve_contract(services.store.as_ref(), &room, &contract).await?;
            let content = std::fs::read_to_string(&file)?;
            let mut draft = VersionDraft::new(&content, &summary);
            if let Some(breaking) = breaking {
                draft = draft.breaking(breaking);
            }
            if let Some(user) = by {
                draft = draft.by(&user);
            }
            let report = analyzer.publish(&room, contract_id, draft).await?;
            serde_json::json!({
                "contract": report.contract_name,
                "version": report.version,
                "breaking": report.assessment.breaking,
                "blocked_tasks": report
                    .blocked_tasks
                    .iter()
                    .map(|t| t.to_string())
                    .collect::<Vec<_>>(),
                "alerted": report.alerted,
                "summary": report.summary,
                "actions": report.actions,
            })
        }
    };
    react(services, events).await;
    services.save().await?;
    println!("{}", serde_json::to_string_pretty(&json_output)?);
    Ok(())
}

async fn run_join(services: &Services, room: &RoomId, user: &str) -> Result<()> {
    let events = services.board.bus().subscribe();
    services.board.bus().publish(DomainEvent::room(
        room,
        EventKind::MemberJoined {
            user: user.to_string(),
        },
    ));
    react(services, events).await;
    services.save().await
}

/// Feed the events a command produced through the monitor's reactor, the
/// same way a running monitor would, and print what it said.
async fn react(services: &Services, mut events: broadcast::Receiver<DomainEvent>) {
    let monitor = match services.monitor() {
        Ok(monitor) => Some(monitor),
        Err(e) => {
            warn!(error = %e, "completion unavailable, events are not reacted to");
            None
        }
    };
    loop {
        let event = match events.try_recv() {
            Ok(event) => event,
            Err(TryRecvError::Lagged(skipped)) => {
                warn!(skipped, "reaction backlog overflowed");
                continue;
            }
            Err(_) => break,
        };
        print_event(&event);
        let Some(monitor) = &monitor else {
            continue;
        };
        match monitor.handle(&event).await {
            Ok(Reaction::Kickoff(pass)) => {
                if let Err(e) = pass.await {
                    warn!(error = %e, "execution pass panicked");
                }
            }
            Ok(reaction) => debug!(event = event.kind.name(), ?reaction, "reacted"),
            Err(e) => warn!(event = event.kind.name(), error = %e, "reaction failed"),
        }
    }
}

fn print_event(event: &DomainEvent) {
    match (&event.kind, &event.visibility) {
        (EventKind::Alert(alert), _) => {
            eprintln!("[{:?}] {}", alert.severity, alert.message);
        }
        (EventKind::Notification { message }, Visibility::User(user)) => {
            eprintln!("@{}: {}", user, message);
        }
        (EventKind::Notification { message }, Visibility::Room) => eprintln!("{}", message),
        _ => {}
    }
}

/// Accept a full contract id, a unique prefix of one, or a name.
async fn resolve_contract(store: &dyn Store, room: &RoomId, raw: &str) -> Result<ContractId> {
    if let Ok(id) = raw.parse::<ContractId>() {
        return Ok(id);
    }
    let contracts = store.list_contracts(room).await?;
    if let Some(contract) = contracts.iter().find(|c| c.name == raw) {
        return Ok(contract.id);
    }
    let matches: Vec<ContractId> = contracts
        .iter()
        .map(|c| c.id)
        .filter(|id| id.to_string().starts_with(raw))
        .collect();
    match matches.as_slice() {
        [id] => Ok(*id),
        [] => Err(Error::ContractNotFound(raw.to_string())),
        _ => Err(Error::Validation(format!("contract prefix '{}' is ambiguous", raw))),
    }
}

/// Accept a full task id or a unique prefix of one.
async fn resolve_task(store: &dyn Store, room: &RoomId, raw: &str) -> Result<TaskId> {
    if let Ok(id) = raw.parse::<TaskId>() {
        return Ok(id);
    }
    let matches: Vec<TaskId> = store
        .list_tasks(room)
        .await?
        .into_iter()
        .map(|t| t.id)
        .filter(|id| id.to_string().starts_with(raw))
        .collect();
    match matches.as_slice() {
        [id] => Ok(*id),
        [] => Err(Error::Validation(format!(
            "no task matching '{}' in room {}",
            raw, room
        ))),
        _ => Err(Error::Validation(format!("task prefix '{}' is ambiguous", raw))),
    }
}
