//! Checkpoint manager: makes every mutation reversible.
//!
//! Version-controlled workspaces get a "pre-flight" commit before a task's
//! first mutation whenever the tree is dirty, so the agent's changes are
//! never mixed with the user's uncommitted work. Unversioned workspaces
//! fall back to sibling file backups. Either way a mutation may only
//! proceed once its safety net exists; if the net cannot be established
//! the mutation is aborted.
//!
//! The manager also serializes mutations: one async lock guards the
//! workspace, shared by every task that targets it, because the dirty-tree
//! check would otherwise race.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use git2::{IndexAddOption, Repository, Signature, StatusOptions};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Label prefix on defensive pre-flight commits, distinguishing them from
/// semantic commits made after review acceptance.
pub const CHECKPOINT_PREFIX: &str = "crucible-checkpoint:";

/// Suffix for sibling backups in unversioned workspaces.
pub const BACKUP_SUFFIX: &str = ".crucible.bak";

/// Engine scratch space inside the workspace (artifact outputs live
/// under it). Never staged into the user's history, and never counted
/// when deciding whether the tree is dirty.
const INTERNAL_DIR: &str = ".crucible";

/// What the checkpoint actually is, for later rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointHandle {
    /// A commit in the workspace repository.
    Commit(String),
    /// A sibling copy of the file about to be overwritten.
    FileBackup(PathBuf),
}

/// A reversible snapshot taken immediately before a mutation.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub handle: CheckpointHandle,
}

/// Which safety-net strategy the workspace supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    Git,
    FileBackup,
}

pub struct CheckpointManager {
    root: PathBuf,
    backend: Backend,
    /// Workspace mutation lock. Only one mutation, from any task, may be
    /// in flight at a time.
    mutation_lock: Mutex<()>,
}

impl CheckpointManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let backend = if Repository::open(&root).is_ok() {
            Backend::Git
        } else {
            Backend::FileBackup
        };
        debug!(root = %root.display(), ?backend, "checkpoint manager ready");
        CheckpointManager {
            root,
            backend,
            mutation_lock: Mutex::new(()),
        }
    }

    pub fn is_version_controlled(&self) -> bool {
        self.backend == Backend::Git
    }

    /// Acquire the workspace mutation lock. Hold the guard across the
    /// entire checkpoint-then-persist sequence.
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.mutation_lock.lock().await
    }

    /// Whether the working tree has changes (staged, unstaged or untracked),
    /// ignoring engine scratch files.
    pub fn is_dirty(&self) -> Result<bool> {
        let repo = Repository::open(&self.root)?;
        let mut opts = StatusOptions::new();
        opts.include_untracked(true);
        opts.recurse_untracked_dirs(true);
        let statuses = repo.statuses(Some(&mut opts))?;
        Ok(statuses
            .iter()
            .any(|entry| entry.path().map_or(true, |p| !is_internal_path(p))))
    }

    /// Establish the safety net for a mutation, or fail before it runs.
    ///
    /// `target` is the file about to be overwritten, if the mutation has
    /// one. Returns `None` when no checkpoint was needed (clean tree, or a
    /// brand-new file) or when none was possible; the latter is logged as
    /// an explicit decision rather than silently skipped.
    pub fn checkpoint_before(&self, target: Option<&Path>, label: &str) -> Result<Option<Checkpoint>> {
        match self.backend {
            Backend::Git => {
                if !self.is_dirty()? {
                    debug!("working tree clean; existing HEAD is the checkpoint");
                    return Ok(None);
                }
                let message = format!("{CHECKPOINT_PREFIX} {label}");
                let oid = self
                    .stage_all_and_commit(&message)
                    .context("failed to create pre-flight checkpoint commit")?;
                Ok(Some(Checkpoint {
                    label: label.to_string(),
                    created_at: Utc::now(),
                    handle: CheckpointHandle::Commit(oid),
                }))
            }
            Backend::FileBackup => {
                let Some(target) = target else {
                    warn!(
                        label,
                        "no checkpoint possible: workspace is not version-controlled and the \
                         mutation has no single target file"
                    );
                    return Ok(None);
                };
                if !target.exists() {
                    debug!(target = %target.display(), "new file; no backup needed");
                    return Ok(None);
                }
                let backup = backup_path(target);
                fs::copy(target, &backup).with_context(|| {
                    format!(
                        "backup failed for {}; aborting mutation",
                        target.display()
                    )
                })?;
                Ok(Some(Checkpoint {
                    label: label.to_string(),
                    created_at: Utc::now(),
                    handle: CheckpointHandle::FileBackup(backup),
                }))
            }
        }
    }

    /// Commit an accepted change under a human-readable message, separate
    /// from the defensive pre-flight checkpoint. Returns the commit id, or
    /// `None` when there was nothing to commit.
    pub fn commit_semantic(&self, message: &str) -> Result<Option<String>> {
        match self.backend {
            Backend::Git => {
                if !self.is_dirty()? {
                    return Ok(None);
                }
                let oid = self.stage_all_and_commit(message)?;
                Ok(Some(oid))
            }
            Backend::FileBackup => Ok(None),
        }
    }

    /// Revert the most recent commit, restoring the tree it left behind.
    ///
    /// Refuses on a dirty tree: a hard reset there would destroy the
    /// user's uncommitted work. Unsupported in backup-file workspaces.
    pub fn undo(&self) -> Result<String> {
        match self.backend {
            Backend::Git => {
                if self.is_dirty()? {
                    return Err(anyhow!(
                        "refusing to undo: the working tree has uncommitted changes that a \
                         hard reset would destroy; commit or stash them first"
                    ));
                }
                let repo = Repository::open(&self.root)?;
                let head = repo.head()?.peel_to_commit()?;
                let undone_message = head.message().unwrap_or("").trim().to_string();
                let parent = head
                    .parent(0)
                    .context("nothing to undo: HEAD has no parent commit")?;
                repo.reset(parent.as_object(), git2::ResetType::Hard, None)?;
                Ok(undone_message)
            }
            Backend::FileBackup => Err(anyhow!(
                "undo is not supported without version control; restore manually from \
                 the {BACKUP_SUFFIX} backups next to each modified file"
            )),
        }
    }

    /// Message of the most recent commit.
    pub fn last_message(&self) -> Result<String> {
        let repo = Repository::open(&self.root)?;
        let head = repo.head()?.peel_to_commit()?;
        Ok(head.message().unwrap_or("").trim().to_string())
    }

    fn stage_all_and_commit(&self, message: &str) -> Result<String> {
        let repo = Repository::open(&self.root)?;
        let mut index = repo.index()?;
        let mut skip_internal = |path: &Path, _spec: &[u8]| -> i32 {
            if is_internal_path(&path.to_string_lossy()) {
                1
            } else {
                0
            }
        };
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, Some(&mut skip_internal))?;
        index.write()?;
        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;

        // Author from repo config, with a local fallback.
        let config = repo.config()?;
        let name = config
            .get_string("user.name")
            .unwrap_or_else(|_| "crucible".to_string());
        let email = config
            .get_string("user.email")
            .unwrap_or_else(|_| "crucible@local".to_string());
        let sig = Signature::now(&name, &email)?;

        // An unborn HEAD (fresh repo) gets a parentless commit.
        let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();

        let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        Ok(oid.to_string())
    }
}

fn is_internal_path(path: &str) -> bool {
    match path.strip_prefix(INTERNAL_DIR) {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => true,
        _ => path.ends_with(BACKUP_SUFFIX),
    }
}

fn backup_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    name.push_str(BACKUP_SUFFIX);
    target.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn git_fixture() -> (TempDir, CheckpointManager) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "tester").unwrap();
        config.set_str("user.email", "tester@local").unwrap();
        fs::write(dir.path().join("a.txt"), "one\n").unwrap();
        let manager = CheckpointManager::new(dir.path());
        // Initial commit so HEAD exists.
        manager.stage_all_and_commit("initial").unwrap();
        (dir, manager)
    }

    #[test]
    fn test_detects_git_backend() {
        let (dir, manager) = git_fixture();
        assert!(manager.is_version_controlled());
        drop(dir);
    }

    #[test]
    fn test_clean_tree_needs_no_checkpoint() {
        let (_dir, manager) = git_fixture();
        assert!(!manager.is_dirty().unwrap());
        let cp = manager.checkpoint_before(None, "noop").unwrap();
        assert!(cp.is_none());
    }

    #[test]
    fn test_scratch_files_neither_dirty_nor_staged() {
        let (dir, manager) = git_fixture();
        let artifacts = dir.path().join(".crucible/artifacts");
        fs::create_dir_all(&artifacts).unwrap();
        fs::write(artifacts.join("plot.png"), "png").unwrap();
        // Scratch output alone does not make the tree dirty.
        assert!(!manager.is_dirty().unwrap());

        fs::write(dir.path().join("a.txt"), "two\n").unwrap();
        let cp = manager.checkpoint_before(None, "before write").unwrap().unwrap();
        assert!(matches!(cp.handle, CheckpointHandle::Commit(_)));

        // The commit captured the user's file but none of the scratch dir.
        let repo = Repository::open(dir.path()).unwrap();
        let tree = repo.head().unwrap().peel_to_commit().unwrap().tree().unwrap();
        assert!(tree.get_name("a.txt").is_some());
        assert!(tree.get_name(".crucible").is_none());
        assert!(!manager.is_dirty().unwrap());
    }

    #[test]
    fn test_dirty_tree_gets_preflight_commit() {
        let (dir, manager) = git_fixture();
        fs::write(dir.path().join("a.txt"), "user edit\n").unwrap();
        assert!(manager.is_dirty().unwrap());

        let cp = manager.checkpoint_before(None, "before write").unwrap();
        assert!(matches!(
            cp.unwrap().handle,
            CheckpointHandle::Commit(_)
        ));
        assert!(!manager.is_dirty().unwrap());
        assert!(manager.last_message().unwrap().starts_with(CHECKPOINT_PREFIX));
    }

    #[test]
    fn test_undo_clean_tree_restores_content() {
        let (dir, manager) = git_fixture();
        fs::write(dir.path().join("a.txt"), "two\n").unwrap();
        manager.checkpoint_before(None, "agent change").unwrap();

        let undone = manager.undo().unwrap();
        assert!(undone.starts_with(CHECKPOINT_PREFIX));
        let restored = fs::read_to_string(dir.path().join("a.txt")).unwrap();
        assert_eq!(restored, "one\n");
    }

    #[test]
    fn test_undo_dirty_tree_refused() {
        let (dir, manager) = git_fixture();
        fs::write(dir.path().join("a.txt"), "uncommitted\n").unwrap();

        let err = manager.undo().unwrap_err();
        assert!(err.to_string().contains("refusing to undo"));
        // Tree left untouched.
        let content = fs::read_to_string(dir.path().join("a.txt")).unwrap();
        assert_eq!(content, "uncommitted\n");
    }

    #[test]
    fn test_commit_semantic_separate_from_checkpoint() {
        let (dir, manager) = git_fixture();
        fs::write(dir.path().join("b.txt"), "new feature\n").unwrap();
        let oid = manager.commit_semantic("add b.txt").unwrap();
        assert!(oid.is_some());
        assert_eq!(manager.last_message().unwrap(), "add b.txt");
        drop(dir);
    }

    #[test]
    fn test_backup_backend_copies_target() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("calc.py");
        fs::write(&target, "original").unwrap();
        let manager = CheckpointManager::new(dir.path());
        assert!(!manager.is_version_controlled());

        let cp = manager
            .checkpoint_before(Some(&target), "overwrite calc.py")
            .unwrap()
            .unwrap();
        match cp.handle {
            CheckpointHandle::FileBackup(backup) => {
                assert_eq!(fs::read_to_string(backup).unwrap(), "original");
            }
            other => panic!("unexpected handle: {:?}", other),
        }
    }

    #[test]
    fn test_backup_backend_new_file_needs_none() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(dir.path());
        let cp = manager
            .checkpoint_before(Some(&dir.path().join("fresh.txt")), "create")
            .unwrap();
        assert!(cp.is_none());
    }

    #[test]
    fn test_backup_backend_undo_unsupported() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(dir.path());
        let err = manager.undo().unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }
}
