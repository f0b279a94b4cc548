//! Continuous monitor.
//!
//! Two independent loops share one [`Monitor`]:
//! - the sweep walks every room on a fixed interval (stale tasks,
//!   dependency safety net, contract edge integrity, workspace health)
//! - the reactor follows the event bus and reacts to each recognised
//!   event once
//!
//! Neither loop lets one room's failure stop the other rooms.

pub mod health;
pub mod reactor;
pub mod sweep;

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::board::TaskBoard;
use crate::config::MonitorConfig;
use crate::execution::Pipeline;
use crate::signals::Signals;
use crate::workspace::WorkspaceManager;

pub use reactor::{ProcessedEvents, Reaction};
pub use sweep::SweepReport;

pub struct Monitor {
    board: TaskBoard,
    workspaces: Arc<WorkspaceManager>,
    pipeline: Arc<Pipeline>,
    signals: Signals,
    config: MonitorConfig,
    processed: Mutex<ProcessedEvents>,
}

impl Monitor {
    pub fn new(
        board: TaskBoard,
        workspaces: Arc<WorkspaceManager>,
        pipeline: Arc<Pipeline>,
        signals: Signals,
        config: MonitorConfig,
    ) -> Self {
        let processed = Mutex::new(ProcessedEvents::new(config.processed_event_cap));
        Self {
            board,
            workspaces,
            pipeline,
            signals,
            config,
            processed,
        }
    }

    /// Run the sweep and the reactor until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            sweep_secs = self.config.sweep_interval_secs,
            window_secs = self.config.event_window_secs,
            "monitor started"
        );
        tokio::join!(self.sweep_loop(cancel.clone()), self.reactor_loop(cancel));
        info!("monitor stopped");
    }

    async fn sweep_loop(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.sweep_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("sweep loop cancelled");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "sweep failed");
                    }
                }
            }
        }
    }

    async fn reactor_loop(&self, cancel: CancellationToken) {
        let mut events = self.board.bus().subscribe();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("reactor loop cancelled");
                    break;
                }
                received = events.recv() => match received {
                    Ok(event) => {
                        if let Err(e) = self.handle(&event).await {
                            warn!(
                                room = %event.room,
                                event = %event.id,
                                kind = event.kind.name(),
                                error = %e,
                                "reaction failed"
                            );
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "reactor fell behind the event bus");
                    }
                    Err(RecvError::Closed) => {
                        debug!("event bus closed");
                        break;
                    }
                }
            }
        }
    }
}
