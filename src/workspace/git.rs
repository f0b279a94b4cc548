//! Local repository operations on a room's working tree, via git2.
//!
//! Everything here is synchronous; async callers go through
//! [`crate::util::blocking`].

use std::path::{Path, PathBuf};

use git2::{
    ErrorCode, IndexAddOption, Repository, RepositoryInitOptions, Signature, Status,
    StatusOptions,
};
use tracing::debug;

use crate::Result;

/// Commit identity used for workspace commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitAuthor {
    pub name: String,
    pub email: String,
}

impl GitAuthor {
    pub fn new(name: &str, email: &str) -> Self {
        Self {
            name: name.to_string(),
            email: email.to_string(),
        }
    }
}

pub struct WorkspaceRepo {
    path: PathBuf,
}

impl WorkspaceRepo {
    pub fn open(path: &Path) -> Result<Self> {
        let _ = Repository::open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Open the repository at `path`, initialising one on `branch` if
    /// the directory is not a repository yet.
    pub fn open_or_init(path: &Path, branch: &str) -> Result<Self> {
        if Repository::open(path).is_err() {
            debug!(path = %path.display(), branch, "initialising workspace repository");
            std::fs::create_dir_all(path)?;
            let mut opts = RepositoryInitOptions::new();
            opts.initial_head(branch);
            Repository::init_opts(path, &opts)?;
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn is_repository(path: &Path) -> bool {
        Repository::open(path).is_ok()
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::open(&self.path)?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn has_head(&self) -> Result<bool> {
        let repo = self.repo()?;
        let has = match repo.head() {
            Ok(_) => Ok(true),
            Err(e) if matches!(e.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        };
        has
    }

    pub fn head_commit(&self) -> Result<Option<String>> {
        let repo = self.repo()?;
        let head = match repo.head() {
            Ok(head) => head,
            Err(e) if matches!(e.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => {
                return Ok(None)
            }
            Err(e) => return Err(e.into()),
        };
        let id = head.peel_to_commit()?.id().to_string();
        Ok(Some(id))
    }

    /// Branch HEAD points at, including an unborn branch. `None` when
    /// HEAD is detached.
    pub fn current_branch(&self) -> Result<Option<String>> {
        let repo = self.repo()?;
        let head = repo.find_reference("HEAD")?;
        if let Some(target) = head.symbolic_target() {
            return Ok(target.strip_prefix("refs/heads/").map(String::from));
        }
        Ok(None)
    }

    /// Write a README and make the first commit when the repository has
    /// no HEAD yet. Returns the new commit id, if one was made.
    pub fn seed_initial_commit(&self, title: &str, author: &GitAuthor) -> Result<Option<String>> {
        if self.has_head()? {
            return Ok(None);
        }
        let readme = self.path.join("README.md");
        if !readme.exists() {
            std::fs::write(&readme, format!("# {}\n", title))?;
        }
        self.commit_all("Initial commit", author)
    }

    pub fn origin_url(&self) -> Result<Option<String>> {
        let repo = self.repo()?;
        let url = match repo.find_remote("origin") {
            Ok(remote) => remote.url().map(String::from),
            Err(e) if e.code() == ErrorCode::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(url)
    }

    /// Point `origin` at `url`, creating the remote when missing.
    pub fn set_origin(&self, url: &str) -> Result<()> {
        let repo = self.repo()?;
        match repo.find_remote("origin") {
            Ok(remote) if remote.url() == Some(url) => {}
            Ok(_) => repo.remote_set_url("origin", url)?,
            Err(e) if e.code() == ErrorCode::NotFound => {
                repo.remote("origin", url)?;
            }
            Err(e) => return Err(e.into()),
        }
        debug!(path = %self.path.display(), url, "origin configured");
        Ok(())
    }

    /// Paths with staged, unstaged or untracked changes. Ignored files
    /// are excluded.
    pub fn changed_files(&self) -> Result<Vec<String>> {
        Ok(self
            .status_entries()?
            .into_iter()
            .map(|(path, _)| path)
            .collect())
    }

    /// Restore `paths` to their committed state. Paths absent from HEAD
    /// are removed from the working tree.
    pub fn discard(&self, paths: &[String]) -> Result<()> {
        let repo = self.repo()?;
        let head_tree = match repo.head() {
            Ok(head) => Some(head.peel_to_tree()?),
            Err(_) => None,
        };
        let mut tracked = Vec::new();
        for rel in paths {
            let in_head = head_tree
                .as_ref()
                .is_some_and(|tree| tree.get_path(Path::new(rel)).is_ok());
            if in_head {
                tracked.push(rel.as_str());
                continue;
            }
            let full = self.path.join(rel);
            if full.is_file() || full.is_symlink() {
                std::fs::remove_file(&full)?;
            }
        }
        if !tracked.is_empty() {
            let mut checkout = git2::build::CheckoutBuilder::new();
            checkout.force();
            for rel in &tracked {
                checkout.path(*rel);
            }
            repo.checkout_head(Some(&mut checkout))?;
        }
        debug!(path = %self.path.display(), count = paths.len(), "discarded working tree changes");
        Ok(())
    }

    /// Porcelain-style status listing, one `XY path` line per entry.
    pub fn status_text(&self) -> Result<String> {
        let lines: Vec<String> = self
            .status_entries()?
            .into_iter()
            .map(|(path, status)| format!("{} {}", status_code(status), path))
            .collect();
        Ok(lines.join("\n"))
    }

    fn status_entries(&self) -> Result<Vec<(String, Status)>> {
        let repo = self.repo()?;
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);
        let statuses = repo.statuses(Some(&mut opts))?;
        Ok(statuses
            .iter()
            .filter(|entry| !entry.status().contains(Status::IGNORED))
            .filter_map(|entry| entry.path().map(|p| (p.to_string(), entry.status())))
            .collect())
    }

    /// Paths with unresolved merge conflicts in the index.
    pub fn conflicted_files(&self) -> Result<Vec<String>> {
        let repo = self.repo()?;
        let index = repo.index()?;
        if !index.has_conflicts() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        for conflict in index.conflicts()? {
            let conflict = conflict?;
            let path = conflict
                .our
                .as_ref()
                .or(conflict.their.as_ref())
                .or(conflict.ancestor.as_ref())
                .map(|e| String::from_utf8_lossy(&e.path).to_string());
            if let Some(path) = path {
                if !paths.contains(&path) {
                    paths.push(path);
                }
            }
        }
        Ok(paths)
    }

    /// Every path tracked in the index.
    pub fn tracked_files(&self) -> Result<Vec<String>> {
        let repo = self.repo()?;
        let index = repo.index()?;
        Ok(index
            .iter()
            .map(|entry| String::from_utf8_lossy(&entry.path).to_string())
            .collect())
    }

    /// Commits ahead of and behind `origin/<branch>`. `None` when either
    /// side does not exist locally.
    pub fn ahead_behind(&self, branch: &str) -> Result<Option<(usize, usize)>> {
        let repo = self.repo()?;
        let local = match repo.refname_to_id(&format!("refs/heads/{}", branch)) {
            Ok(oid) => oid,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let upstream = match repo.refname_to_id(&format!("refs/remotes/origin/{}", branch)) {
            Ok(oid) => oid,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(repo.graph_ahead_behind(local, upstream)?))
    }

    /// Stage every change (including deletions) and commit it.
    ///
    /// Returns `None` when the staged tree equals HEAD's tree, i.e. there
    /// was nothing to commit.
    pub fn commit_all(&self, message: &str, author: &GitAuthor) -> Result<Option<String>> {
        debug!(path = %self.path.display(), message, "commit_all");
        let repo = self.repo()?;
        let mut index = repo.index()?;
        index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["."].iter(), None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };

        let unchanged = match &parent {
            Some(commit) => commit.tree_id() == tree_id,
            None => index.is_empty(),
        };
        if unchanged {
            debug!(path = %self.path.display(), "nothing to commit");
            return Ok(None);
        }

        let tree = repo.find_tree(tree_id)?;
        let sig = Signature::now(&author.name, &author.email)?;
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        debug!(commit = %commit_id, "commit created");
        Ok(Some(commit_id.to_string()))
    }
}

fn status_code(status: Status) -> String {
    if status.contains(Status::WT_NEW) && !status.intersects(index_flags()) {
        return "??".to_string();
    }
    if status.contains(Status::CONFLICTED) {
        return "UU".to_string();
    }
    let x = if status.contains(Status::INDEX_NEW) {
        'A'
    } else if status.contains(Status::INDEX_MODIFIED) {
        'M'
    } else if status.contains(Status::INDEX_DELETED) {
        'D'
    } else if status.contains(Status::INDEX_RENAMED) {
        'R'
    } else if status.contains(Status::INDEX_TYPECHANGE) {
        'T'
    } else {
        ' '
    };
    let y = if status.contains(Status::WT_MODIFIED) {
        'M'
    } else if status.contains(Status::WT_DELETED) {
        'D'
    } else if status.contains(Status::WT_RENAMED) {
        'R'
    } else if status.contains(Status::WT_TYPECHANGE) {
        'T'
    } else {
        ' '
    };
    format!("{}{}", x, y)
}

fn index_flags() -> Status {
    Status::INDEX_NEW
        | Status::INDEX_MODIFIED
        | Status::INDEX_DELETED
        | Status::INDEX_RENAMED
        | Status::INDEX_TYPECHANGE
}
