//! Verification: choose allowed commands and run them in order.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::safety::{check_command, package_scripts, CommandVerdict, PackageManager};
use crate::util::tail_chars;
use crate::workspace::WorkspaceLease;
use crate::Result;

/// Scripts run when the patch proposes no commands, in this order.
pub const DEFAULT_SCRIPTS: &[&str] = &["typecheck", "lint", "test", "build"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationPlan {
    pub commands: Vec<Vec<String>>,
    /// Proposed commands refused by the safety check, with reasons.
    pub skipped: Vec<String>,
}

/// Build the command list.
///
/// When the patch proposes commands, only those passing the safety check
/// run. If none is proposed, or every proposal is refused, the declared
/// default scripts run through the detected package manager.
pub fn plan(root: &Path, proposed: &[String]) -> VerificationPlan {
    let scripts = package_scripts(root);
    let mut plan = from_proposed(proposed, &scripts);
    if plan.commands.is_empty() {
        if !plan.skipped.is_empty() {
            debug!(
                skipped = plan.skipped.len(),
                "no proposed command allowed, using default scripts"
            );
        }
        plan.commands = default_commands(root, &scripts);
    }
    plan
}

fn default_commands(root: &Path, scripts: &BTreeSet<String>) -> Vec<Vec<String>> {
    let pm = PackageManager::detect(root);
    DEFAULT_SCRIPTS
        .iter()
        .filter(|s| scripts.contains(**s))
        .map(|s| pm.run_argv(s))
        .collect()
}

fn from_proposed(proposed: &[String], scripts: &BTreeSet<String>) -> VerificationPlan {
    let mut plan = VerificationPlan::default();
    for raw in proposed.iter().filter(|c| !c.trim().is_empty()) {
        match check_command(raw, scripts) {
            CommandVerdict::Allowed(argv) => {
                if !plan.commands.contains(&argv) {
                    plan.commands.push(argv);
                }
            }
            CommandVerdict::Rejected(reason) => {
                warn!(command = %raw, reason = %reason, "verification command skipped");
                plan.skipped.push(format!("{} ({})", raw, reason));
            }
        }
    }
    plan
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    Passed {
        ran: Vec<String>,
        skipped: Vec<String>,
    },
    Failed {
        command: String,
        /// Failure description, e.g. "exit 1: ..." or "timed out".
        cause: String,
        /// Tail of the combined output.
        output: String,
    },
}

/// Run `plan` in order, stopping at the first failure.
pub async fn run(
    lease: &WorkspaceLease,
    plan: &VerificationPlan,
    timeout: Duration,
    tail: usize,
) -> Result<VerificationOutcome> {
    let mut ran = Vec::new();
    for argv in &plan.commands {
        let cmdline = argv.join(" ");
        debug!(room = %lease.room(), command = %cmdline, "verify");
        let output = lease.run(argv.clone(), timeout).await?;
        if !output.success() {
            info!(
                room = %lease.room(),
                command = %cmdline,
                cause = %output.describe_failure(),
                "verification failed"
            );
            return Ok(VerificationOutcome::Failed {
                command: cmdline,
                cause: output.describe_failure(),
                output: tail_chars(&output.combined(), tail).to_string(),
            });
        }
        ran.push(cmdline);
    }
    Ok(VerificationOutcome::Passed {
        ran,
        skipped: plan.skipped.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manifest(dir: &Path, scripts: &str) {
        std::fs::write(
            dir.join("package.json"),
            format!(r#"{{"name": "app", "scripts": {{{}}}}}"#, scripts),
        )
        .unwrap();
    }

    #[test]
    fn test_defaults_use_declared_scripts_in_order() {
        let dir = TempDir::new().unwrap();
        manifest(dir.path(), r#""build": "tsc", "test": "vitest", "start": "node .""#);
        std::fs::write(dir.path().join("pnpm-lock.yaml"), "").unwrap();

        let plan = plan(dir.path(), &[]);
        assert_eq!(
            plan.commands,
            vec![
                vec!["pnpm".to_string(), "run".into(), "test".into()],
                vec!["pnpm".to_string(), "run".into(), "build".into()],
            ]
        );
    }

    #[test]
    fn test_no_manifest_means_nothing_to_run() {
        let dir = TempDir::new().unwrap();
        assert_eq!(plan(dir.path(), &[]), VerificationPlan::default());
    }

    #[test]
    fn test_proposed_commands_replace_defaults() {
        let dir = TempDir::new().unwrap();
        manifest(dir.path(), r#""test": "vitest", "lint": "eslint .""#);

        let proposed = vec![
            "npm run lint".to_string(),
            "npm run lint".to_string(),
            "rm -rf /".to_string(),
        ];
        let plan = plan(dir.path(), &proposed);
        assert_eq!(
            plan.commands,
            vec![vec!["npm".to_string(), "run".into(), "lint".into()]]
        );
        assert_eq!(plan.skipped.len(), 1);
        assert!(plan.skipped[0].starts_with("rm -rf /"));
    }

    #[test]
    fn test_all_proposals_refused_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        manifest(dir.path(), r#""test": "vitest", "lint": "eslint .""#);

        let plan = plan(dir.path(), &["echo ok".to_string()]);
        assert_eq!(
            plan.commands,
            vec![
                vec!["npm".to_string(), "run".into(), "lint".into()],
                vec!["npm".to_string(), "run".into(), "test".into()],
            ]
        );
        assert_eq!(plan.skipped.len(), 1);
        assert!(plan.skipped[0].starts_with("echo ok"));
    }
}
