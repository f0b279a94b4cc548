//! Workspace context for planning: the file list and VCS status.

use std::path::Path;

use walkdir::{DirEntry, WalkDir};

use crate::util::blocking;
use crate::workspace::WorkspaceLease;
use crate::Result;

/// Directories never listed: VCS metadata, build output, dependencies.
pub const EXCLUDED_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "dist",
    "build",
    ".next",
    "vendor",
    "__pycache__",
    ".venv",
    "venv",
    "coverage",
];

pub const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "webp", "ico", "bmp", "svgz", "pdf", "zip", "gz", "tgz", "tar",
    "7z", "rar", "jar", "class", "exe", "dll", "so", "dylib", "a", "o", "wasm", "woff", "woff2",
    "ttf", "otf", "eot", "mp3", "mp4", "mov", "avi", "wav", "sqlite", "db", "lockb", "bin",
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkspaceContext {
    /// Relative, `/`-separated, sorted; at most the configured limit.
    pub files: Vec<String>,
    /// Files found before applying the limit.
    pub total_files: usize,
    pub status_text: String,
}

fn is_excluded_dir(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| EXCLUDED_DIRS.contains(&name))
}

fn is_binary(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| BINARY_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// Text files under `root`, relative and sorted.
pub fn list_files(root: &Path) -> Vec<String> {
    let mut files: Vec<String> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !is_excluded_dir(e))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && !is_binary(e.path()))
        .filter_map(|e| {
            let rel = e.path().strip_prefix(root).ok()?;
            let parts: Vec<&str> = rel
                .components()
                .filter_map(|c| c.as_os_str().to_str())
                .collect();
            Some(parts.join("/"))
        })
        .collect();
    files.sort();
    files
}

/// Collect the file list (capped at `limit`) and status text of a leased
/// workspace.
pub async fn collect(lease: &WorkspaceLease, limit: usize) -> Result<WorkspaceContext> {
    let root = lease.path().to_path_buf();
    let all = blocking(move || Ok(list_files(&root))).await?;
    let status_text = lease.status_text().await?;
    Ok(WorkspaceContext {
        total_files: all.len(),
        files: all.into_iter().take(limit).collect(),
        status_text,
    })
}
