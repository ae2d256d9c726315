//! Worktree domain model.
//!
//! Each worker owns one git worktree for the lifetime of its task. The
//! branch name and filesystem path are both derived from the task id, which
//! makes the one-worktree-per-task and one-worktree-per-branch invariants
//! the same invariant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Branch namespace for worker branches.
pub const BRANCH_PREFIX: &str = "undercity";

/// An isolated git working directory on its own branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worktree {
    /// Task this worktree belongs to
    pub task_id: String,
    pub path: PathBuf,
    pub branch: String,
    /// Main sha the branch was created from
    pub base_sha: String,
    /// Pid of the owning worker process, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_pid: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl Worktree {
    pub fn new(task_id: impl Into<String>, state_dir: &Path, base_sha: impl Into<String>) -> Self {
        let task_id = task_id.into();
        Self {
            path: path_for_task(state_dir, &task_id),
            branch: branch_for_task(&task_id),
            base_sha: base_sha.into(),
            worker_pid: Some(std::process::id()),
            created_at: Utc::now(),
            task_id,
        }
    }
}

/// Branch name for a task: `undercity/<task-id>`.
pub fn branch_for_task(task_id: &str) -> String {
    format!("{BRANCH_PREFIX}/{task_id}")
}

/// Worktree path for a task, under the state directory.
pub fn path_for_task(state_dir: &Path, task_id: &str) -> PathBuf {
    state_dir.join("worktrees").join(format!("task-{task_id}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_naming() {
        assert_eq!(branch_for_task("T1"), "undercity/T1");
    }

    #[test]
    fn test_path_derivation() {
        let path = path_for_task(Path::new(".undercity"), "T1");
        assert_eq!(path, PathBuf::from(".undercity/worktrees/task-T1"));
    }

    #[test]
    fn test_worktree_fields() {
        let wt = Worktree::new("T1", Path::new(".undercity"), "abc123");
        assert_eq!(wt.branch, "undercity/T1");
        assert_eq!(wt.base_sha, "abc123");
        assert!(wt.worker_pid.is_some());
    }
}
