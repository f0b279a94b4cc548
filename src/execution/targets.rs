//! Target file selection from a plan plus lexical ranking.

use std::collections::{BTreeSet, HashSet};

use serde_json::Value;
use tracing::debug;

use super::safety::{is_editable, normalize_relative};
use crate::config::ExecutionConfig;
use crate::core::task::Task;
use crate::util::tokens;

/// What the planner proposed. Missing or malformed fields are empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub plan: String,
    pub files: Vec<String>,
    pub new_files: Vec<String>,
}

impl Plan {
    pub fn from_value(value: &Value) -> Self {
        let strings = |key: &str| -> Vec<String> {
            value
                .get(key)
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };
        let mut new_files = strings("new_files");
        if new_files.is_empty() {
            new_files = strings("newFiles");
        }
        Self {
            plan: value
                .get("plan")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            files: strings("files"),
            new_files,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetSelection {
    /// Existing files the patcher sees in full.
    pub existing: Vec<String>,
    /// Files the patcher may create.
    pub new_files: Vec<String>,
}

impl TargetSelection {
    pub fn is_empty(&self) -> bool {
        self.existing.is_empty() && self.new_files.is_empty()
    }

    pub fn contains(&self, rel: &str) -> bool {
        self.existing.iter().any(|f| f == rel) || self.new_files.iter().any(|f| f == rel)
    }

    pub fn all(&self) -> impl Iterator<Item = &String> {
        self.existing.iter().chain(self.new_files.iter())
    }
}

/// Choose files for the patcher.
///
/// Plan-proposed existing files come first, then the highest-scoring
/// files by token overlap with the task text until the cap is reached.
/// New files must not already exist. Every target passes path and
/// extension validation.
pub fn select(
    plan: &Plan,
    files: &[String],
    task: &Task,
    config: &ExecutionConfig,
) -> TargetSelection {
    let known: HashSet<&str> = files.iter().map(String::as_str).collect();
    let extensions = &config.editable_extensions;
    let mut selection = TargetSelection::default();

    for raw in &plan.files {
        if selection.existing.len() >= config.max_existing_targets {
            break;
        }
        match normalize_relative(raw) {
            Ok(rel) if known.contains(rel.as_str()) && is_editable(&rel, extensions) => {
                if !selection.existing.contains(&rel) {
                    selection.existing.push(rel);
                }
            }
            Ok(rel) => debug!(path = %rel, "plan file dropped: unknown or not editable"),
            Err(e) => debug!(path = %raw, error = %e, "plan file rejected"),
        }
    }

    for raw in &plan.new_files {
        if selection.new_files.len() >= config.max_new_targets {
            break;
        }
        match normalize_relative(raw) {
            Ok(rel) if !known.contains(rel.as_str()) && is_editable(&rel, extensions) => {
                if !selection.new_files.contains(&rel) {
                    selection.new_files.push(rel);
                }
            }
            Ok(rel) => debug!(path = %rel, "new file dropped: exists or not editable"),
            Err(e) => debug!(path = %raw, error = %e, "new file rejected"),
        }
    }

    if selection.existing.len() < config.max_existing_targets {
        let wanted = config.max_existing_targets - selection.existing.len();
        let ranked: Vec<String> = rank(files, task)
            .into_iter()
            .filter(|f| is_editable(f, extensions) && !selection.existing.contains(f))
            .take(wanted)
            .collect();
        selection.existing.extend(ranked);
    }

    selection
}

/// Files sharing at least one token with the task, best first. Ties go
/// to the lexically smaller path.
pub fn rank(files: &[String], task: &Task) -> Vec<String> {
    let text = format!("{} {} {}", task.title, task.description, task.acceptance_criteria);
    let wanted: BTreeSet<String> = tokens(&text).into_iter().collect();
    if wanted.is_empty() {
        return Vec::new();
    }

    let mut scored: Vec<(usize, &String)> = files
        .iter()
        .filter_map(|file| {
            let score = tokens(file)
                .into_iter()
                .collect::<BTreeSet<_>>()
                .intersection(&wanted)
                .count();
            (score > 0).then_some((score, file))
        })
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
    scored.into_iter().map(|(_, f)| f.clone()).collect()
}
