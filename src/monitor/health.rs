//! Workspace health signals.
//!
//! Each condition maps to its own signal key so one persistent problem
//! does not suppress another.

use crate::bus::Severity;
use crate::config::{MonitorConfig, WorkspaceConfig};
use crate::core::task::RoomId;
use crate::signals::Signal;
use crate::workspace::WorkspaceStatus;

/// Files named in a health message before "and N more".
const LISTED_FILES: usize = 5;

/// Signals describing what is wrong with a workspace. A workspace that is
/// not ready reports only that.
pub fn workspace_signals(
    room: &RoomId,
    status: &WorkspaceStatus,
    workspace: &WorkspaceConfig,
    monitor: &MonitorConfig,
) -> Vec<Signal> {
    if !status.ready {
        return vec![Signal::new(
            room,
            "workspace_not_ready",
            "workspace",
            Severity::High,
            format!("Workspace for room {} is not ready; execution is paused.", room),
        )
        .with_cooldown(monitor.default_cooldown())];
    }

    let mut signals = Vec::new();

    if !status.conflicts.is_empty() {
        signals.push(
            Signal::new(
                room,
                "workspace_conflicts",
                "conflicts",
                Severity::High,
                format!(
                    "Merge conflicts in {} file(s): {}",
                    status.conflicts.len(),
                    list(&status.conflicts)
                ),
            )
            .with_cooldown(monitor.default_cooldown()),
        );
    }

    if status.behind > 0 {
        signals.push(
            Signal::new(
                room,
                "workspace_behind",
                status.branch.as_deref().unwrap_or("HEAD"),
                Severity::Low,
                format!(
                    "Branch {} is {} commit(s) behind origin.",
                    status.branch.as_deref().unwrap_or("HEAD"),
                    status.behind
                ),
            )
            .with_cooldown(monitor.stale_cooldown()),
        );
    }

    if status.diff_size() > workspace.large_delta_threshold {
        signals.push(
            Signal::new(
                room,
                "workspace_large_delta",
                "uncommitted",
                Severity::Low,
                format!(
                    "{} uncommitted files in the workspace (threshold {}).",
                    status.diff_size(),
                    workspace.large_delta_threshold
                ),
            )
            .with_cooldown(monitor.stale_cooldown()),
        );
    }

    if !status.tracked_secret_files.is_empty() {
        signals.push(
            Signal::new(
                room,
                "security_dotenv",
                "tracked",
                Severity::High,
                format!(
                    "Environment files are tracked in git: {}",
                    list(&status.tracked_secret_files)
                ),
            )
            .with_cooldown(monitor.security_cooldown()),
        );
    }

    if let Some(first) = status.secret_findings.first() {
        let locations: Vec<String> = status.secret_findings.iter().map(|f| f.to_string()).collect();
        signals.push(
            Signal::new(
                room,
                "security_secret",
                &first.path,
                Severity::High,
                format!("Possible credentials in tracked files: {}", list(&locations)),
            )
            .with_cooldown(monitor.security_cooldown()),
        );
    }

    signals
}

fn list(items: &[String]) -> String {
    let shown = items
        .iter()
        .take(LISTED_FILES)
        .cloned()
        .collect::<Vec<_>>()
        .join(", ");
    if items.len() > LISTED_FILES {
        format!("{} and {} more", shown, items.len() - LISTED_FILES)
    } else {
        shown
    }
}
