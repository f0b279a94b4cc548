//! Patch proposals: parsing, path vetting, and before/after snapshots.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::safety::{is_editable, normalize_relative, resolve_within};
use super::targets::TargetSelection;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FileEdit {
    pub path: String,
    pub content: String,
}

/// A proposed change, as returned by the patcher.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PatchProposal {
    pub summary: String,
    /// Unified diff, applied first when present.
    pub diff: Option<String>,
    /// Whole-file replacements used when the diff does not apply.
    pub files: Vec<FileEdit>,
    /// Suggested verification commands.
    pub verification: Vec<String>,
    pub commit_message: String,
}

impl PatchProposal {
    /// Parse a patcher response. A response with neither a diff nor file
    /// edits is unusable.
    pub fn from_value(value: Value) -> Result<Self> {
        let mut proposal: PatchProposal = serde_json::from_value(value)?;
        proposal.diff = proposal.diff.filter(|d| !d.trim().is_empty());
        if proposal.diff.is_none() && proposal.files.is_empty() {
            return Err(Error::Completion(
                "patch response has neither a diff nor file edits".to_string(),
            ));
        }
        Ok(proposal)
    }
}

/// Only regular, non-executable files may be created by a diff.
const REGULAR_FILE_MODE: &str = "100644";

/// Strip the `a/`/`b/` prefix and any trailing timestamp from a header
/// path. `None` for `/dev/null`.
fn header_path(raw: &str) -> Option<String> {
    let path = raw.split('\t').next().unwrap_or(raw).trim();
    if path == "/dev/null" || path.is_empty() {
        return None;
    }
    let path = path
        .strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path);
    Some(path.to_string())
}

/// Paths named anywhere in a diff's headers: `diff --git`, `---`/`+++`,
/// and git's rename/copy lines. Prefixes are removed and `/dev/null` is
/// skipped.
pub fn diff_paths(diff: &str) -> Vec<String> {
    let mut paths = BTreeSet::new();
    for line in diff.lines() {
        if let Some(rest) = line.strip_prefix("diff --git ") {
            // "a/X b/Y"; paths with spaces are split at " b/"
            let (old, new) = match rest.find(" b/") {
                Some(at) => (&rest[..at], &rest[at + 1..]),
                None => (rest, ""),
            };
            paths.extend([old, new].into_iter().filter_map(header_path));
            continue;
        }
        let header = ["+++ ", "--- ", "rename from ", "rename to ", "copy from ", "copy to "]
            .iter()
            .find_map(|prefix| line.strip_prefix(prefix));
        if let Some(path) = header.and_then(header_path) {
            paths.insert(path);
        }
    }
    paths.into_iter().collect()
}

/// Extended headers that would change more than file contents.
fn forbidden_header(line: &str) -> Option<String> {
    if line.starts_with("GIT binary patch") || line.starts_with("Binary files ") {
        return Some("binary patches are not allowed".to_string());
    }
    if line.starts_with("old mode ") || line.starts_with("new mode ") {
        return Some("file mode changes are not allowed".to_string());
    }
    if let Some(mode) = line.strip_prefix("new file mode ") {
        if mode.trim() != REGULAR_FILE_MODE {
            return Some(format!("new file mode {} is not allowed", mode.trim()));
        }
    }
    if line.starts_with("deleted file mode ") {
        return Some("file deletions are not allowed".to_string());
    }
    None
}

/// Check every path a diff touches. `Ok` holds the normalized paths;
/// any unsafe, non-editable or out-of-target path, and any binary or
/// mode-changing header, rejects the whole diff.
pub fn vet_diff(
    diff: &str,
    root: &Path,
    targets: &TargetSelection,
    extensions: &[String],
) -> Result<Vec<String>> {
    if let Some(reason) = diff.lines().find_map(forbidden_header) {
        return Err(Error::Validation(reason));
    }
    let paths = diff_paths(diff);
    if paths.is_empty() {
        return Err(Error::Validation("diff names no files".to_string()));
    }
    paths
        .iter()
        .map(|raw| {
            let rel = normalize_relative(raw)?;
            if !targets.contains(&rel) {
                return Err(Error::Validation(format!(
                    "diff touches a file outside the selected targets: {}",
                    rel
                )));
            }
            if !is_editable(&rel, extensions) {
                return Err(Error::Validation(format!("{} is not an editable file", rel)));
            }
            resolve_within(root, &rel)?;
            Ok(rel)
        })
        .collect()
}

/// Split file edits into those that may be written and those rejected.
/// Accepted edits carry normalized paths.
pub fn vet_files(
    edits: &[FileEdit],
    root: &Path,
    targets: &TargetSelection,
    extensions: &[String],
) -> (Vec<FileEdit>, Vec<String>) {
    let mut accepted = Vec::new();
    let mut rejected = Vec::new();
    for edit in edits {
        let verdict = normalize_relative(&edit.path).and_then(|rel| {
            if !targets.contains(&rel) {
                return Err(Error::Validation(format!("{} is not a selected target", rel)));
            }
            if !is_editable(&rel, extensions) {
                return Err(Error::Validation(format!("{} is not an editable file", rel)));
            }
            resolve_within(root, &rel)?;
            Ok(rel)
        });
        match verdict {
            Ok(rel) => accepted.push(FileEdit {
                path: rel,
                content: edit.content.clone(),
            }),
            Err(e) => {
                debug!(path = %edit.path, error = %e, "file edit rejected");
                rejected.push(format!("{}: {}", edit.path, e));
            }
        }
    }
    (accepted, rejected)
}

/// Raw bytes of each path, `None` when absent.
pub type Snapshot = BTreeMap<String, Option<Vec<u8>>>;

pub fn snapshot<'a>(root: &Path, paths: impl IntoIterator<Item = &'a String>) -> Snapshot {
    paths
        .into_iter()
        .map(|rel| (rel.clone(), std::fs::read(root.join(rel)).ok()))
        .collect()
}

/// Paths whose bytes differ between two snapshots of the same set.
pub fn changed_paths(before: &Snapshot, after: &Snapshot) -> Vec<String> {
    after
        .iter()
        .filter(|(path, bytes)| before.get(*path) != Some(*bytes))
        .map(|(path, _)| path.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn targets(existing: &[&str], new_files: &[&str]) -> TargetSelection {
        TargetSelection {
            existing: existing.iter().map(|s| s.to_string()).collect(),
            new_files: new_files.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_from_value_requires_a_change() {
        let err =
            PatchProposal::from_value(json!({"summary": "nothing", "diff": "  "})).unwrap_err();
        assert!(matches!(err, Error::Completion(_)));

        let proposal = PatchProposal::from_value(json!({
            "summary": "add avatar",
            "files": [{"path": "src/a.ts", "content": "x"}],
            "verification": ["npm test"]
        }))
        .unwrap();
        assert_eq!(proposal.files.len(), 1);
        assert_eq!(proposal.verification, vec!["npm test"]);
        assert!(proposal.diff.is_none());
    }

    #[test]
    fn test_diff_paths() {
        let diff = concat!(
            "--- a/src/app.ts\n+++ b/src/app.ts\n@@ -1 +1 @@\n-a\n+b\n",
            "--- /dev/null\n+++ b/src/new.ts\t2024-01-01\n@@ -0,0 +1 @@\n+c\n"
        );
        assert_eq!(diff_paths(diff), vec!["src/app.ts", "src/new.ts"]);
    }

    fn ts() -> Vec<String> {
        vec!["ts".to_string()]
    }

    #[test]
    fn test_vet_diff_rejects_outside_targets() {
        let dir = TempDir::new().unwrap();
        let selected = targets(&["src/app.ts"], &[]);
        let ok = "--- a/src/app.ts\n+++ b/src/app.ts\n";
        assert_eq!(vet_diff(ok, dir.path(), &selected, &ts()).unwrap(), vec!["src/app.ts"]);

        let escape = "--- a/../etc/passwd\n+++ b/../etc/passwd\n";
        assert!(vet_diff(escape, dir.path(), &selected, &ts()).is_err());
        let other = "--- a/src/other.ts\n+++ b/src/other.ts\n";
        assert!(vet_diff(other, dir.path(), &selected, &ts()).is_err());
        assert!(vet_diff("not a diff", dir.path(), &selected, &ts()).is_err());
    }

    #[test]
    fn test_diff_paths_reads_git_extended_headers() {
        let diff = "diff --git a/src/old.ts b/src/moved.ts\nsimilarity index 90%\n\
                    rename from src/old.ts\nrename to src/moved.ts\n\
                    diff --git a/lib/x.ts b/lib/y.ts\ncopy from lib/x.ts\ncopy to lib/y.ts\n";
        assert_eq!(
            diff_paths(diff),
            vec!["lib/x.ts", "lib/y.ts", "src/moved.ts", "src/old.ts"]
        );
    }

    #[test]
    fn test_vet_diff_rejects_header_only_entries_outside_targets() {
        let dir = TempDir::new().unwrap();
        let selected = targets(&["src/app.ts"], &[]);
        let smuggled = "--- a/src/app.ts\n+++ b/src/app.ts\n@@ -1 +1 @@\n-a\n+b\n\
                        diff --git a/payload.exe b/payload.exe\n\
                        new file mode 100755\nindex 0000000..e69de29\n";
        assert!(vet_diff(smuggled, dir.path(), &selected, &ts()).is_err());

        // same entry, but named as a target: the executable mode alone refuses it
        let selected = targets(&["src/app.ts"], &["src/run.ts"]);
        let executable = "diff --git a/src/run.ts b/src/run.ts\nnew file mode 100755\n\
                          index 0000000..e69de29\n";
        let err = vet_diff(executable, dir.path(), &selected, &ts()).unwrap_err();
        assert!(err.to_string().contains("100755"));

        let regular = "diff --git a/src/run.ts b/src/run.ts\nnew file mode 100644\n\
                       --- /dev/null\n+++ b/src/run.ts\n@@ -0,0 +1 @@\n+x\n";
        assert_eq!(vet_diff(regular, dir.path(), &selected, &ts()).unwrap(), vec!["src/run.ts"]);
    }

    #[test]
    fn test_vet_diff_rejects_binary_and_mode_changes() {
        let dir = TempDir::new().unwrap();
        let selected = targets(&["src/app.ts"], &[]);
        let chmod = "diff --git a/src/app.ts b/src/app.ts\nold mode 100644\nnew mode 100755\n";
        assert!(vet_diff(chmod, dir.path(), &selected, &ts()).is_err());
        let binary = "diff --git a/src/app.ts b/src/app.ts\nGIT binary patch\nliteral 3\n";
        assert!(vet_diff(binary, dir.path(), &selected, &ts()).is_err());
        let deleted = "diff --git a/src/app.ts b/src/app.ts\ndeleted file mode 100644\n";
        assert!(vet_diff(deleted, dir.path(), &selected, &ts()).is_err());
    }

    #[test]
    fn test_vet_diff_rejects_non_editable_targets() {
        let dir = TempDir::new().unwrap();
        let selected = targets(&["src/app.ts"], &["tool.sh"]);
        let diff = "--- /dev/null\n+++ b/tool.sh\n@@ -0,0 +1 @@\n+x\n";
        assert!(vet_diff(diff, dir.path(), &selected, &ts()).is_err());
    }

    #[test]
    fn test_vet_files_splits_accepted_and_rejected() {
        let dir = TempDir::new().unwrap();
        let selected = targets(&["src/app.ts"], &["src/new.ts"]);
        let edits = vec![
            FileEdit { path: "./src/app.ts".into(), content: "a".into() },
            FileEdit { path: "src/new.ts".into(), content: "b".into() },
            FileEdit { path: "../escape.ts".into(), content: "c".into() },
            FileEdit { path: "src/unlisted.ts".into(), content: "d".into() },
        ];
        let (accepted, rejected) =
            vet_files(&edits, dir.path(), &selected, &["ts".to_string()]);
        let paths: Vec<&str> = accepted.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["src/app.ts", "src/new.ts"]);
        assert_eq!(rejected.len(), 2);
    }

    #[test]
    fn test_snapshot_detects_changes() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one").unwrap();
        let paths = vec!["a.txt".to_string(), "b.txt".to_string()];

        let before = snapshot(dir.path(), &paths);
        assert!(changed_paths(&before, &snapshot(dir.path(), &paths)).is_empty());

        std::fs::write(dir.path().join("b.txt"), "two").unwrap();
        assert_eq!(changed_paths(&before, &snapshot(dir.path(), &paths)), vec!["b.txt"]);
    }
}
