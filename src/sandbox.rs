//! Sandbox boundary.
//!
//! The orchestrator never touches the filesystem itself; it asks a
//! [`Sandbox`] for a workspace, and for commits, merges and cleanup in it.
//! Isolation mechanics (worktrees, containers) live behind the trait. Two
//! thin adapters ship here: a plain directory and in-place git commits.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use git2::{IndexAddOption, Repository, Signature};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::CADENCE_DIR;
use crate::errors::SandboxError;

/// Where a task's work happens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceInfo {
    pub path: PathBuf,
    #[serde(default)]
    pub branch_ref: Option<String>,
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn ensure_isolated_workspace(&self, task_id: &str) -> Result<WorkspaceInfo, SandboxError>;

    /// Commit everything in `path`. Returns the commit id, or `None` when
    /// there was nothing to commit.
    async fn commit(&self, path: &Path, message: &str) -> Result<Option<String>, SandboxError>;

    async fn merge_to_primary(&self, task_id: &str, path: &Path) -> Result<(), SandboxError>;

    async fn cleanup(&self, task_id: &str, path: &Path) -> Result<(), SandboxError>;
}

/// Works directly in a directory with no version control.
#[derive(Debug, Clone)]
pub struct DirectorySandbox {
    root: PathBuf,
}

impl DirectorySandbox {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Sandbox for DirectorySandbox {
    async fn ensure_isolated_workspace(&self, task_id: &str) -> Result<WorkspaceInfo, SandboxError> {
        if !self.root.is_dir() {
            return Err(SandboxError::WorkspaceUnavailable {
                task_id: task_id.to_string(),
                message: format!("{} is not a directory", self.root.display()),
            });
        }
        Ok(WorkspaceInfo {
            path: self.root.clone(),
            branch_ref: None,
        })
    }

    async fn commit(&self, path: &Path, message: &str) -> Result<Option<String>, SandboxError> {
        debug!(path = %path.display(), message, "directory sandbox: nothing to commit");
        Ok(None)
    }

    async fn merge_to_primary(&self, _task_id: &str, _path: &Path) -> Result<(), SandboxError> {
        Ok(())
    }

    async fn cleanup(&self, _task_id: &str, _path: &Path) -> Result<(), SandboxError> {
        Ok(())
    }
}

/// Commits task work on the current branch of an existing repository.
///
/// The workspace is the repository's working tree, so merging is a no-op.
/// Files under `.cadence/` are never staged.
#[derive(Debug, Clone)]
pub struct InPlaceGitSandbox {
    repo_dir: PathBuf,
}

impl InPlaceGitSandbox {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
        }
    }
}

#[async_trait]
impl Sandbox for InPlaceGitSandbox {
    async fn ensure_isolated_workspace(&self, task_id: &str) -> Result<WorkspaceInfo, SandboxError> {
        let unavailable = |message: String| SandboxError::WorkspaceUnavailable {
            task_id: task_id.to_string(),
            message,
        };
        let repo = Repository::discover(&self.repo_dir).map_err(|e| unavailable(e.message().to_string()))?;
        let path = repo
            .workdir()
            .map(Path::to_path_buf)
            .ok_or_else(|| unavailable("bare repositories are not supported".to_string()))?;
        let branch_ref = repo
            .head()
            .ok()
            .and_then(|head| head.shorthand().map(str::to_string));
        Ok(WorkspaceInfo { path, branch_ref })
    }

    async fn commit(&self, path: &Path, message: &str) -> Result<Option<String>, SandboxError> {
        let path = path.to_path_buf();
        let message = message.to_string();
        let join_path = path.clone();
        tokio::task::spawn_blocking(move || commit_all(&path, &message))
            .await
            .map_err(|e| SandboxError::CommitFailed {
                path: join_path,
                message: e.to_string(),
            })?
    }

    async fn merge_to_primary(&self, task_id: &str, _path: &Path) -> Result<(), SandboxError> {
        debug!(task_id, "in-place sandbox: work is already on the primary tree");
        Ok(())
    }

    async fn cleanup(&self, _task_id: &str, _path: &Path) -> Result<(), SandboxError> {
        Ok(())
    }
}

/// Stage everything outside `.cadence/` and commit it on HEAD.
fn commit_all(path: &Path, message: &str) -> Result<Option<String>, SandboxError> {
    let failed = |e: git2::Error| SandboxError::CommitFailed {
        path: path.to_path_buf(),
        message: e.message().to_string(),
    };

    let repo = Repository::open(path).map_err(failed)?;
    let mut index = repo.index().map_err(failed)?;
    let mut skip_state = |entry: &Path, _spec: &[u8]| -> i32 {
        if entry.starts_with(CADENCE_DIR) { 1 } else { 0 }
    };
    index
        .add_all(
            ["*"].iter(),
            IndexAddOption::DEFAULT,
            Some(&mut skip_state as &mut git2::IndexMatchedPath),
        )
        .map_err(failed)?;
    index.write().map_err(failed)?;

    let tree_id = index.write_tree().map_err(failed)?;
    let tree = repo.find_tree(tree_id).map_err(failed)?;
    let parent = repo.head().ok().and_then(|head| head.peel_to_commit().ok());

    if let Some(parent) = &parent
        && parent.tree_id() == tree_id
    {
        debug!(path = %path.display(), "no changes to commit");
        return Ok(None);
    }

    let sig = repo
        .signature()
        .or_else(|_| Signature::now("cadence", "cadence@localhost"))
        .map_err(failed)?;
    let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
    let commit_id = repo
        .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
        .map_err(failed)?;

    info!(commit = %commit_id, "committed task work");
    Ok(Some(commit_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn init_repo() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
        dir
    }

    #[tokio::test]
    async fn directory_sandbox_uses_root() {
        let dir = tempdir().unwrap();
        let sandbox = DirectorySandbox::new(dir.path());
        let ws = sandbox.ensure_isolated_workspace("t-1").await.unwrap();
        assert_eq!(ws.path, dir.path());
        assert!(ws.branch_ref.is_none());
        assert_eq!(sandbox.commit(&ws.path, "msg").await.unwrap(), None);
    }

    #[tokio::test]
    async fn directory_sandbox_rejects_missing_root() {
        let sandbox = DirectorySandbox::new("/definitely/not/here/cadence");
        let err = sandbox.ensure_isolated_workspace("t-1").await.unwrap_err();
        assert!(matches!(err, SandboxError::WorkspaceUnavailable { .. }));
    }

    #[tokio::test]
    async fn git_sandbox_commits_on_unborn_head_then_skips_empty_commit() {
        let dir = init_repo();
        fs::write(dir.path().join("lib.rs"), "pub fn f() {}\n").unwrap();

        let sandbox = InPlaceGitSandbox::new(dir.path());
        let ws = sandbox.ensure_isolated_workspace("t-1").await.unwrap();

        let first = sandbox.commit(&ws.path, "[cadence] chunk 1").await.unwrap();
        assert_eq!(first.as_deref().map(str::len), Some(40));

        let second = sandbox.commit(&ws.path, "[cadence] chunk 2").await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn git_sandbox_never_stages_state_directory() {
        let dir = init_repo();
        fs::create_dir_all(dir.path().join(CADENCE_DIR).join("checkpoints")).unwrap();
        fs::write(dir.path().join(CADENCE_DIR).join("checkpoints/t.json"), "{}").unwrap();
        fs::write(dir.path().join("main.rs"), "fn main() {}\n").unwrap();

        let sandbox = InPlaceGitSandbox::new(dir.path());
        sandbox.commit(dir.path(), "work").await.unwrap();

        let repo = Repository::open(dir.path()).unwrap();
        let tree = repo.head().unwrap().peel_to_tree().unwrap();
        assert!(tree.get_name("main.rs").is_some());
        assert!(tree.get_name(CADENCE_DIR).is_none());
    }
}
