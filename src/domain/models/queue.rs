//! Merge queue domain models.
//!
//! A merge item tracks one worker branch on its way onto the main branch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Status of a merge queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeItemStatus {
    /// Waiting in the FIFO queue
    Pending,
    /// Rebasing the branch onto current main
    Rebasing,
    /// Re-running verification inside the worktree
    Testing,
    /// Fast-forwarding main to the branch head
    Merging,
    /// Merged onto main
    Complete,
    /// Rebase hit conflicting paths
    Conflict,
    /// Verification failed after repair passes
    TestFailed,
    /// Conflict item re-queued after main advanced
    Retrying,
}

impl MergeItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Rebasing => "rebasing",
            Self::Testing => "testing",
            Self::Merging => "merging",
            Self::Complete => "complete",
            Self::Conflict => "conflict",
            Self::TestFailed => "test_failed",
            Self::Retrying => "retrying",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::TestFailed)
    }
}

/// One branch queued for serial merging onto main.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeItem {
    pub id: Uuid,
    /// Worker branch to merge
    pub branch: String,
    /// Task this branch belongs to
    pub task_id: String,
    /// Identifier of the worker that produced the branch
    pub agent_id: String,
    /// Paths the branch modifies, used for pre-merge conflict prediction
    pub modified_files: BTreeSet<String>,
    pub status: MergeItemStatus,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Main sha after a successful fast-forward
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_sha: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MergeItem {
    pub fn new(
        branch: impl Into<String>,
        task_id: impl Into<String>,
        agent_id: impl Into<String>,
        modified_files: impl IntoIterator<Item = String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            branch: branch.into(),
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            modified_files: modified_files.into_iter().collect(),
            status: MergeItemStatus::Pending,
            retry_count: 0,
            last_error: None,
            merged_sha: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: MergeItemStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    pub fn fail_with(&mut self, status: MergeItemStatus, error: impl Into<String>) {
        self.status = status;
        self.last_error = Some(error.into());
        self.updated_at = Utc::now();
    }

    /// Paths shared with another queued item.
    pub fn overlapping_files(&self, other: &MergeItem) -> Vec<String> {
        self.modified_files
            .intersection(&other.modified_files)
            .cloned()
            .collect()
    }
}

/// A predicted conflict between two queued branches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConflict {
    pub branch_a: String,
    pub branch_b: String,
    pub overlapping_files: Vec<String>,
}
