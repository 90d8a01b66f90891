#![allow(async_fn_in_trait)]

//! Applying a promotion's edits to a working tree and committing them.
//!
//! The edits are read against one ref and may be written to an unrelated
//! branch.  In that case the edited content is lifted out of the tree, the
//! write branch is checked out (or created with no history), and the content
//! is put back on top of it.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use anyhow::Context;
use anyhow::Result;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;
use tracing::info;
use tracing::warn;
use tracing::instrument;

use crate::clients::process::ProcessRunner;
use crate::git::error;
use crate::git::worktree::CommitOptions;
use crate::git::worktree::PushOptions;
use crate::git::worktree::WorkingTree;

const GIT_METADATA: &str = ".git";
const HOLDING_PREFIX: &str = "holding-";
pub const FALLBACK_COMMIT_MESSAGE: &str = "Applied changes";

// -----------------------------------------------------------------------------
// Types

/// Edits a promotion makes to a checked-out tree.
pub trait TreeMutation {
    /// Edit files under `dir` and describe each change, one entry per edit.
    async fn apply(&self, dir: &Path) -> Result<Vec<String>>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitChangesOptions {
    /// Ref to check out before mutating.  The current checkout when unset.
    pub read_ref: Option<String>,
    /// Branch that receives the commit.
    pub write_branch: String,
    /// `Name <email>`, overriding the configured identity.
    pub author: Option<String>,
}

/// Writes fixed contents to paths relative to the tree root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetFiles {
    pub files: Vec<FileUpdate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpdate {
    pub path: String,
    pub contents: Vec<u8>,
}

/// In-process locks serializing commits to the same remote branch.
#[derive(Debug, Default)]
pub struct BranchLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

// -----------------------------------------------------------------------------
// Commit algorithm

/// Apply `mutation` and commit the result to `opts.write_branch`.
///
/// Returns the write branch's latest commit ID, whether or not anything was
/// committed.  Pushing is the last side effect; any earlier failure leaves the
/// remote untouched.
#[instrument(skip_all, fields(read_ref = ?opts.read_ref, write_branch = %opts.write_branch))]
pub async fn commit_changes<R, M>(
    tree: &WorkingTree<R>,
    opts: &CommitChangesOptions,
    mutation: &M,
) -> Result<String>
where
    R: ProcessRunner,
    M: TreeMutation,
{
    let read_ref = match &opts.read_ref {
        Some(read_ref) => {
            tree.checkout(read_ref).await?;
            read_ref.clone()
        }
        None => tree.current_branch().await?,
    };

    let descriptions = mutation.apply(tree.dir()).await?;
    let message = build_commit_message(&descriptions);

    if read_ref != opts.write_branch {
        transplant(tree, &opts.write_branch).await?;
    }

    if tree.has_diffs().await? {
        tree.add_all().await?;
        tree.commit(
            &message,
            &CommitOptions {
                author: opts.author.clone(),
                ..Default::default()
            },
        )
        .await?;
        tree.push(&PushOptions {
            target_branch: Some(opts.write_branch.clone()),
            ..Default::default()
        })
        .await?;
        info!("pushed promotion commit");
    } else {
        debug!("no changes to commit");
    }

    tree.last_commit_id().await
}

/// [`commit_changes`], retried when another writer got to the remote first.
///
/// Before each retry the tree is reset and cleaned, remote branches are
/// refetched, and the read ref is checked out again at its remote tip when it
/// is a branch.  Up to `attempts` runs are made.
#[instrument(skip_all, fields(write_branch = %opts.write_branch))]
pub async fn commit_changes_with_retry<R, M>(
    tree: &WorkingTree<R>,
    opts: &CommitChangesOptions,
    mutation: &M,
    attempts: usize,
) -> Result<String>
where
    R: ProcessRunner,
    M: TreeMutation,
{
    let read_ref = match &opts.read_ref {
        Some(read_ref) => read_ref.clone(),
        None => tree.current_branch().await?,
    };
    let opts = CommitChangesOptions {
        read_ref: Some(read_ref.clone()),
        ..opts.clone()
    };

    let mut attempt = 1;
    loop {
        match commit_changes(tree, &opts, mutation).await {
            Err(e) if attempt < attempts && error::is_retryable(&e) => {
                warn!(attempt, "remote moved during promotion, retrying: {:#}", e);
                attempt += 1;
                tree.reset_hard().await?;
                tree.clean().await?;
                tree.fetch().await?;
                if tree.remote_branch_exists(&read_ref).await? {
                    tree.checkout_remote_branch(&read_ref).await?;
                }
            }
            result => return result,
        }
    }
}

/// One description verbatim, several as a bulleted summary, none as a
/// generic message.
pub fn build_commit_message(descriptions: &[String]) -> String {
    match descriptions {
        [] => FALLBACK_COMMIT_MESSAGE.to_string(),
        [only] => only.clone(),
        many => {
            let mut message = String::from("Applied multiple changes\n\nIncluding:\n");
            for description in many {
                message.push_str("\n- ");
                message.push_str(description);
            }
            message
        }
    }
}

/// Carry the tree's current content over onto `write_branch`.
async fn transplant<R: ProcessRunner>(tree: &WorkingTree<R>, write_branch: &str) -> Result<()> {
    let holding_parent = tree.dir().parent().unwrap_or(tree.home_dir());
    let holding = tempfile::Builder::new()
        .prefix(HOLDING_PREFIX)
        .tempdir_in(holding_parent)
        .context("Failed to create holding directory")?;

    move_entries(tree.dir(), holding.path()).await?;
    tree.reset_hard().await?;

    if tree.remote_branch_exists(write_branch).await? {
        tree.checkout_remote_branch(write_branch).await?;
    } else {
        if tree.local_branch_exists(write_branch).await? {
            tree.delete_branch(write_branch, true).await?;
        }
        tree.create_orphaned_branch(write_branch).await?;
    }

    for entry in tree_entries(tree.dir()).await? {
        remove_entry(&entry).await?;
    }
    move_entries(holding.path(), tree.dir()).await?;
    debug!(write_branch, "transplanted content");
    Ok(())
}

/// Entries of `dir`, repository metadata excluded.
async fn tree_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = Vec::new();
    let mut read_dir = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to read {}", dir.display()))?;
    while let Some(entry) = read_dir.next_entry().await? {
        if entry.file_name() != GIT_METADATA {
            entries.push(entry.path());
        }
    }
    Ok(entries)
}

async fn move_entries(from: &Path, to: &Path) -> Result<()> {
    for entry in tree_entries(from).await? {
        let Some(name) = entry.file_name() else {
            continue;
        };
        let target = to.join(name);
        tokio::fs::rename(&entry, &target).await.with_context(|| {
            format!("Failed to move {} to {}", entry.display(), target.display())
        })?;
    }
    Ok(())
}

async fn remove_entry(path: &Path) -> Result<()> {
    let metadata = tokio::fs::symlink_metadata(path).await?;
    let result = if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    result.with_context(|| format!("Failed to remove {}", path.display()))
}

// -----------------------------------------------------------------------------
// SetFiles impl

impl TreeMutation for SetFiles {
    async fn apply(&self, dir: &Path) -> Result<Vec<String>> {
        let mut descriptions = Vec::with_capacity(self.files.len());
        for file in &self.files {
            let relative = Path::new(&file.path);
            if relative.is_absolute()
                || relative
                    .components()
                    .any(|c| matches!(c, std::path::Component::ParentDir))
            {
                anyhow::bail!("Path must stay inside the working tree: {}", file.path);
            }
            let target = dir.join(relative);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            tokio::fs::write(&target, &file.contents)
                .await
                .with_context(|| format!("Failed to write {}", target.display()))?;
            descriptions.push(format!("Updated {}", file.path));
        }
        Ok(descriptions)
    }
}

// -----------------------------------------------------------------------------
// BranchLocks impl

impl BranchLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive use of `branch` in `repo_url`.  Released when the
    /// guard drops.
    ///
    /// Entries nobody holds or waits on are dropped here, so the map only
    /// tracks branches currently in use.
    pub async fn lock(&self, repo_url: &str, branch: &str) -> OwnedMutexGuard<()> {
        let key = format!("{}#{}", repo_url, branch);
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(key).or_default().clone()
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_commit_message_single() {
        assert_eq!(
            build_commit_message(&["Updated image to v2".to_string()]),
            "Updated image to v2"
        );
    }

    #[test]
    fn test_commit_message_multiple() {
        let message = build_commit_message(&["a".to_string(), "b".to_string()]);
        insta::assert_snapshot!(message, @r"
        Applied multiple changes

        Including:

        - a
        - b
        ");
    }

    #[test]
    fn test_commit_message_never_empty() {
        assert_eq!(build_commit_message(&[]), FALLBACK_COMMIT_MESSAGE);
    }

    #[tokio::test]
    async fn test_set_files_writes_nested_paths() {
        let dir = tempfile::tempdir().unwrap();
        let mutation = SetFiles {
            files: vec![FileUpdate {
                path: "env/prod/values.yaml".to_string(),
                contents: b"image: v2\n".to_vec(),
            }],
        };
        let descriptions = mutation.apply(dir.path()).await.unwrap();
        assert_eq!(descriptions, ["Updated env/prod/values.yaml"]);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("env/prod/values.yaml")).unwrap(),
            "image: v2\n"
        );
    }

    #[tokio::test]
    async fn test_set_files_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let mutation = SetFiles {
            files: vec![FileUpdate {
                path: "../outside".to_string(),
                contents: Vec::new(),
            }],
        };
        assert!(mutation.apply(dir.path()).await.is_err());
        assert!(!dir.path().parent().unwrap().join("outside").exists());
    }

    #[tokio::test]
    async fn test_move_entries_skips_git_metadata() {
        let from = tempfile::tempdir().unwrap();
        let to = tempfile::tempdir().unwrap();
        std::fs::create_dir(from.path().join(".git")).unwrap();
        std::fs::create_dir(from.path().join("charts")).unwrap();
        std::fs::write(from.path().join("charts/values.yaml"), "x").unwrap();
        std::fs::write(from.path().join("README.md"), "y").unwrap();

        move_entries(from.path(), to.path()).await.unwrap();

        assert!(from.path().join(".git").is_dir());
        assert!(!from.path().join("README.md").exists());
        assert!(to.path().join("charts/values.yaml").is_file());
        assert!(to.path().join("README.md").is_file());
        assert!(!to.path().join(".git").exists());
    }

    #[tokio::test]
    async fn test_branch_locks_serialize_same_branch() {
        let locks = Arc::new(BranchLocks::new());
        let guard = locks.lock("https://example.com/r.git", "main").await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("https://example.com/r.git", "main").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        // Other branches are independent.
        let _other = locks.lock("https://example.com/r.git", "stage").await;

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn test_branch_locks_forget_released_branches() {
        let locks = BranchLocks::new();
        drop(locks.lock("https://example.com/r.git", "main").await);

        let held = locks.lock("https://example.com/r.git", "stage").await;
        assert_eq!(locks.len(), 1);

        let _other = locks.lock("https://example.com/r.git", "prod").await;
        assert_eq!(locks.len(), 2);

        drop(held);
        drop(locks.lock("https://example.com/r.git", "main").await);
        assert_eq!(locks.len(), 2);
    }
}
