//! Path and command validation for model-proposed changes.
//!
//! Everything the patcher proposes is untrusted: file paths must stay
//! inside the working tree, and verification commands must be a known
//! test/build invocation with no shell syntax.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use serde_json::Value;

use crate::workspace::secrets::is_dotenv_file;
use crate::{Error, Result};

/// Characters that would let a command escape a plain argv.
const SHELL_METACHARACTERS: &[char] = &[
    '&', '|', ';', '>', '<', '`', '$', '(', ')', '\n', '\r', '"', '\'', '\\', '*', '?', '{', '}',
];

/// Normalize a proposed relative path to `a/b/c` form.
///
/// Rejects empty, absolute and drive-letter paths, parent traversal,
/// control characters and anything inside `.git`.
pub fn normalize_relative(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation("empty path".to_string()));
    }
    if trimmed.chars().any(|c| c.is_control()) {
        return Err(Error::Validation(format!(
            "path contains control character: {:?}",
            trimmed
        )));
    }
    let unified = trimmed.replace('\\', "/");
    if unified.starts_with('/') {
        return Err(Error::Validation(format!("path is absolute: {}", trimmed)));
    }
    let bytes = unified.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return Err(Error::Validation(format!(
            "path is absolute (drive letter): {}",
            trimmed
        )));
    }

    let mut parts = Vec::new();
    for component in Path::new(&unified).components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_str().ok_or_else(|| {
                    Error::Validation(format!("path is not valid UTF-8: {}", trimmed))
                })?;
                if part.eq_ignore_ascii_case(".git") {
                    return Err(Error::Validation(format!(
                        "path targets repository metadata: {}",
                        trimmed
                    )));
                }
                parts.push(part);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(Error::Validation(format!(
                    "path contains '..' traversal: {}",
                    trimmed
                )));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::Validation(format!("path is absolute: {}", trimmed)));
            }
        }
    }
    if parts.is_empty() {
        return Err(Error::Validation(format!("path names no file: {}", trimmed)));
    }
    Ok(parts.join("/"))
}

/// Whether a file may be edited: an allowed extension and not a dotenv
/// file.
pub fn is_editable(rel: &str, extensions: &[String]) -> bool {
    let name = rel.rsplit('/').next().unwrap_or(rel);
    if is_dotenv_file(name) {
        return false;
    }
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| extensions.iter().any(|allowed| allowed.eq_ignore_ascii_case(ext)))
}

/// Resolve `rel` under `root`, refusing symlinks that lead outside it.
/// The nearest existing ancestor is canonicalized, so new files are
/// checked too.
pub fn resolve_within(root: &Path, rel: &str) -> Result<PathBuf> {
    let rel = normalize_relative(rel)?;
    let canonical_root = root.canonicalize()?;
    let full = canonical_root.join(&rel);

    let mut probe = full.as_path();
    let resolved = loop {
        if probe.exists() {
            break probe.canonicalize()?;
        }
        match probe.parent() {
            Some(parent) => probe = parent,
            None => break canonical_root.clone(),
        }
    };
    if !resolved.starts_with(&canonical_root) {
        return Err(Error::Validation(format!(
            "path escapes workspace: {}",
            rel
        )));
    }
    Ok(full)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Npm,
    Pnpm,
    Yarn,
    Bun,
}

impl PackageManager {
    /// Detect from lockfiles, defaulting to npm.
    pub fn detect(root: &Path) -> Self {
        if root.join("pnpm-lock.yaml").exists() {
            PackageManager::Pnpm
        } else if root.join("yarn.lock").exists() {
            PackageManager::Yarn
        } else if root.join("bun.lockb").exists() || root.join("bun.lock").exists() {
            PackageManager::Bun
        } else {
            PackageManager::Npm
        }
    }

    pub fn program(&self) -> &'static str {
        match self {
            PackageManager::Npm => "npm",
            PackageManager::Pnpm => "pnpm",
            PackageManager::Yarn => "yarn",
            PackageManager::Bun => "bun",
        }
    }

    pub fn from_program(program: &str) -> Option<Self> {
        match program {
            "npm" => Some(PackageManager::Npm),
            "pnpm" => Some(PackageManager::Pnpm),
            "yarn" => Some(PackageManager::Yarn),
            "bun" => Some(PackageManager::Bun),
            _ => None,
        }
    }

    pub fn run_argv(&self, script: &str) -> Vec<String> {
        vec![
            self.program().to_string(),
            "run".to_string(),
            script.to_string(),
        ]
    }
}

/// Script names declared in `package.json`. Missing or unreadable
/// manifests declare nothing.
pub fn package_scripts(root: &Path) -> BTreeSet<String> {
    let Ok(raw) = std::fs::read_to_string(root.join("package.json")) else {
        return BTreeSet::new();
    };
    let Ok(manifest) = serde_json::from_str::<Value>(&raw) else {
        return BTreeSet::new();
    };
    manifest
        .get("scripts")
        .and_then(Value::as_object)
        .map(|scripts| scripts.keys().cloned().collect())
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandVerdict {
    Allowed(Vec<String>),
    Rejected(String),
}

/// Decide whether a proposed verification command may run.
///
/// Allowed forms:
/// - `<pm> run <script>` or `<pm> <script>` for a script declared in
///   `package.json`, where `<pm>` is npm, pnpm, yarn or bun
/// - `cargo test|check|build|clippy`, `go test|vet|build`
/// - `pytest`, `python -m pytest`, `python3 -m pytest`
/// - `npx tsc|vitest|jest|eslint`
pub fn check_command(raw: &str, scripts: &BTreeSet<String>) -> CommandVerdict {
    let raw = raw.trim();
    if raw.is_empty() {
        return CommandVerdict::Rejected("empty command".to_string());
    }
    if let Some(c) = raw.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
        return CommandVerdict::Rejected(format!("shell metacharacter {:?}", c));
    }
    let argv: Vec<String> = raw.split_whitespace().map(str::to_string).collect();
    let args: Vec<&str> = argv.iter().map(String::as_str).collect();

    if let Some(pm) = PackageManager::from_program(args[0]) {
        let script = match args.as_slice() {
            [_, "run", script, ..] => *script,
            [_, script, ..] => *script,
            _ => return CommandVerdict::Rejected(format!("{} needs a script name", args[0])),
        };
        if !scripts.contains(script) {
            return CommandVerdict::Rejected(format!(
                "script '{}' is not declared in package.json",
                script
            ));
        }
        let mut allowed = pm.run_argv(script);
        let rest = if args.get(1) == Some(&"run") { 3 } else { 2 };
        allowed.extend(argv.iter().skip(rest).cloned());
        return CommandVerdict::Allowed(allowed);
    }

    let known = match args.as_slice() {
        ["cargo", sub, ..] => matches!(*sub, "test" | "check" | "build" | "clippy"),
        ["go", sub, ..] => matches!(*sub, "test" | "vet" | "build"),
        ["pytest", ..] => true,
        ["python" | "python3", "-m", "pytest", ..] => true,
        ["npx", tool, ..] => matches!(*tool, "tsc" | "vitest" | "jest" | "eslint"),
        _ => false,
    };
    if known {
        CommandVerdict::Allowed(argv)
    } else {
        CommandVerdict::Rejected(format!("'{}' is not an allowed command", args[0]))
    }
}
