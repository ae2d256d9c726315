//! Merge queue ("the elevator").
//!
//! Serialises worker branches onto the main branch: rebase onto current
//! main inside the worker's worktree, re-run verification, then
//! fast-forward main. Strictly FIFO, one item merging at a time; the main
//! repository is mutated only here. Conflicted items wait until main
//! advances and retry up to a bounded count; verification failures are
//! terminal for the item.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::{path_for_task, MergeItem, MergeItemStatus, QueueConflict};
use crate::infrastructure::git::{validate_ref, GitClient, RebaseOutcome};
use crate::services::verify::Verifier;

/// Repairs a failing branch during merge testing. Implemented by the
/// worker's attempt loop.
#[async_trait]
pub trait MergeFixer: Send + Sync {
    /// Attempt one repair pass; returns whether anything was changed.
    async fn fix(&self, task_id: &str, worktree: &Path, feedback: &str) -> EngineResult<bool>;
}

/// Merge queue configuration.
#[derive(Debug, Clone)]
pub struct MergeQueueConfig {
    pub repo_path: PathBuf,
    pub state_dir: PathBuf,
    pub main_branch: String,
    /// Conflict retries after main advances
    pub max_retries: u32,
    /// Repair passes on verification failure
    pub max_merge_fix_attempts: u32,
}

impl Default for MergeQueueConfig {
    fn default() -> Self {
        Self {
            repo_path: PathBuf::from("."),
            state_dir: PathBuf::from(".undercity"),
            main_branch: "main".to_string(),
            max_retries: 3,
            max_merge_fix_attempts: 2,
        }
    }
}

/// Serial drainer from worker branches to main.
pub struct MergeQueue {
    git: Arc<GitClient>,
    verifier: Verifier,
    config: MergeQueueConfig,
    queue: RwLock<VecDeque<MergeItem>>,
    failed: RwLock<Vec<MergeItem>>,
    history: RwLock<Vec<MergeItem>>,
    fixer: RwLock<Option<Arc<dyn MergeFixer>>>,
    // One merging item at a time.
    drain_lock: Mutex<()>,
}

impl MergeQueue {
    pub fn new(git: Arc<GitClient>, verifier: Verifier, config: MergeQueueConfig) -> Self {
        Self {
            git,
            verifier,
            config,
            queue: RwLock::new(VecDeque::new()),
            failed: RwLock::new(Vec::new()),
            history: RwLock::new(Vec::new()),
            fixer: RwLock::new(None),
            drain_lock: Mutex::new(()),
        }
    }

    /// Install the repair hook used on verification failures.
    pub async fn set_fixer(&self, fixer: Arc<dyn MergeFixer>) {
        *self.fixer.write().await = Some(fixer);
    }

    /// Append a worker branch to the queue.
    pub async fn enqueue(
        &self,
        branch: &str,
        task_id: &str,
        agent_id: &str,
        modified_files: Vec<String>,
    ) -> EngineResult<Uuid> {
        validate_ref(branch)?;

        let mut queue = self.queue.write().await;
        if queue.iter().any(|item| item.branch == branch) {
            return Err(EngineError::ValidationFailed(format!(
                "branch {branch} is already queued"
            )));
        }

        let item = MergeItem::new(branch, task_id, agent_id, modified_files);
        let id = item.id;
        info!(branch, task_id, "merge enqueued");
        queue.push_back(item);
        Ok(id)
    }

    /// Pairwise intersection of modified-file sets across queued items.
    pub async fn detect_queue_conflicts(&self) -> Vec<QueueConflict> {
        let queue = self.queue.read().await;
        let items: Vec<&MergeItem> = queue.iter().collect();
        let mut conflicts = Vec::new();
        for (i, a) in items.iter().enumerate() {
            for b in items.iter().skip(i + 1) {
                let overlapping = a.overlapping_files(b);
                if !overlapping.is_empty() {
                    conflicts.push(QueueConflict {
                        branch_a: a.branch.clone(),
                        branch_b: b.branch.clone(),
                        overlapping_files: overlapping,
                    });
                }
            }
        }
        conflicts
    }

    /// Branches already queued that touch any of `files`. Consulted by the
    /// scheduler before dispatching a task into known-conflicting territory.
    pub async fn check_conflicts_before_add(&self, files: &[String]) -> Vec<String> {
        let queue = self.queue.read().await;
        queue
            .iter()
            .filter(|item| files.iter().any(|f| item.modified_files.contains(f)))
            .map(|item| item.branch.clone())
            .collect()
    }

    /// Drain one item. Returns `None` when nothing is ready to process.
    pub async fn process_next(&self) -> EngineResult<Option<MergeItem>> {
        let _serial = self.drain_lock.lock().await;

        // FIFO: the front-most pending or retrying item.
        let mut item = {
            let mut queue = self.queue.write().await;
            let Some(pos) = queue.iter().position(|i| {
                matches!(i.status, MergeItemStatus::Pending | MergeItemStatus::Retrying)
            }) else {
                return Ok(None);
            };
            let mut item = queue.remove(pos).expect("position just found");
            item.set_status(MergeItemStatus::Rebasing);
            item
        };

        let worktree = path_for_task(&self.config.state_dir, &item.task_id);
        if !worktree.is_dir() {
            // The worktree vanished between enqueue and merge. Fatal: the
            // engine cannot trust its own isolation any more.
            return Err(EngineError::Git(format!(
                "worktree for task {} vanished before merge ({}); consider lowering parallelism",
                item.task_id,
                worktree.display()
            )));
        }

        match self.process_item(&mut item, &worktree).await {
            Ok(()) => {}
            Err(e) => {
                // Subprocess errors are recorded on the item; draining
                // continues with the next one.
                error!(branch = %item.branch, error = %e, "merge item failed");
                item.fail_with(MergeItemStatus::TestFailed, e.to_string());
            }
        }

        self.file_item(item.clone()).await;
        if item.status == MergeItemStatus::Complete {
            self.requeue_conflicted().await;
        }
        Ok(Some(item))
    }

    async fn process_item(&self, item: &mut MergeItem, worktree: &Path) -> EngineResult<()> {
        // Rebase onto current main. The worktree shares the main repo's
        // object store, so fetching from it just refreshes the local ref.
        self.git
            .fetch(worktree, &self.config.repo_path, &self.config.main_branch)
            .await?;

        match self.git.rebase(worktree, &self.config.main_branch).await? {
            RebaseOutcome::Clean => {}
            RebaseOutcome::Conflict { files } => {
                item.retry_count += 1;
                item.fail_with(
                    MergeItemStatus::Conflict,
                    format!("Merge conflicts in: {}", files.join(", ")),
                );
                warn!(
                    branch = %item.branch,
                    retry = item.retry_count,
                    files = ?files,
                    "rebase conflict"
                );
                return Ok(());
            }
        }

        // Re-run verification on the rebased tree.
        item.set_status(MergeItemStatus::Testing);
        let mut verify = self.verifier.run(worktree).await?;
        if !verify.passed {
            let fixer = self.fixer.read().await.clone();
            if let Some(fixer) = fixer {
                for attempt in 1..=self.config.max_merge_fix_attempts {
                    info!(
                        branch = %item.branch,
                        attempt,
                        "verification failed post-rebase; attempting repair"
                    );
                    if !fixer.fix(&item.task_id, worktree, &verify.output).await? {
                        break;
                    }
                    verify = self.verifier.run(worktree).await?;
                    if verify.passed {
                        break;
                    }
                }
            }
        }
        if !verify.passed {
            item.fail_with(
                MergeItemStatus::TestFailed,
                format!("verification failed after rebase: {}", verify.output),
            );
            return Ok(());
        }

        // Fast-forward main. Any non-FF outcome is an invariant violation.
        item.set_status(MergeItemStatus::Merging);
        let sha = self.git.rev_parse_head(worktree).await?;

        let stashed = self.stash_non_state_changes().await?;
        let merge_result = async {
            self.git
                .switch(&self.config.repo_path, &self.config.main_branch)
                .await?;
            self.git.merge_ff_only(&self.config.repo_path, &sha).await
        }
        .await;
        if stashed {
            if let Err(e) = self.git.stash_pop(&self.config.repo_path).await {
                warn!(error = %e, "stash pop failed after merge");
            }
        }
        merge_result?;

        item.merged_sha = Some(sha.clone());
        item.set_status(MergeItemStatus::Complete);
        info!(branch = %item.branch, sha = %sha, "fast-forwarded main");
        Ok(())
    }

    /// Stash tracked modifications in the main repo, ignoring engine state
    /// under `.undercity/` (which is expected to be gitignored and is
    /// written continuously). Returns whether a stash was pushed.
    async fn stash_non_state_changes(&self) -> EngineResult<bool> {
        let entries = self.git.status_porcelain(&self.config.repo_path).await?;
        let dirty_tracked = entries.iter().any(|(code, path)| {
            code != "??" && !path.starts_with(".undercity")
        });
        if dirty_tracked {
            self.git
                .stash_push(&self.config.repo_path, "undercity merge queue")
                .await?;
        }
        Ok(dirty_tracked)
    }

    /// Move a processed item to its terminal shelf, or back into the queue
    /// when the conflict is still retryable.
    async fn file_item(&self, item: MergeItem) {
        match item.status {
            MergeItemStatus::Complete => self.history.write().await.push(item),
            MergeItemStatus::Conflict if item.retry_count <= self.config.max_retries => {
                self.queue.write().await.push_back(item);
            }
            MergeItemStatus::Conflict | MergeItemStatus::TestFailed => {
                self.failed.write().await.push(item);
            }
            _ => {
                // Defensive shelf for unexpected non-terminal statuses.
                self.failed.write().await.push(item);
            }
        }
    }

    /// After main advances, conflicted items become retryable.
    async fn requeue_conflicted(&self) {
        let mut queue = self.queue.write().await;
        for item in queue.iter_mut() {
            if item.status == MergeItemStatus::Conflict {
                item.set_status(MergeItemStatus::Retrying);
            }
        }
    }

    /// Give up on conflict items that can no longer make progress (no
    /// further merges will advance main). They move to the failed shelf.
    pub async fn fail_stalled_conflicts(&self) -> Vec<MergeItem> {
        let mut queue = self.queue.write().await;
        let mut failed = self.failed.write().await;
        let mut moved = Vec::new();

        let mut i = 0;
        while i < queue.len() {
            if queue[i].status == MergeItemStatus::Conflict {
                let item = queue.remove(i).expect("index in bounds");
                failed.push(item.clone());
                moved.push(item);
            } else {
                i += 1;
            }
        }
        moved
    }

    pub async fn len(&self) -> usize {
        self.queue.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queue.read().await.is_empty()
    }

    /// Whether anything is still pending or retryable.
    pub async fn has_processable(&self) -> bool {
        self.queue.read().await.iter().any(|i| {
            matches!(i.status, MergeItemStatus::Pending | MergeItemStatus::Retrying)
        })
    }

    pub async fn snapshot(&self) -> Vec<MergeItem> {
        self.queue.read().await.iter().cloned().collect()
    }

    pub async fn get_failed(&self) -> Vec<MergeItem> {
        self.failed.read().await.clone()
    }

    pub async fn clear_failed(&self) {
        self.failed.write().await.clear();
    }

    pub async fn history(&self) -> Vec<MergeItem> {
        self.history.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn queue_with_defaults() -> MergeQueue {
        MergeQueue::new(
            Arc::new(GitClient::default()),
            Verifier::new(vec![], Duration::from_secs(5)),
            MergeQueueConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_enqueue_validates_branch() {
        let queue = queue_with_defaults();
        assert!(queue
            .enqueue("--evil", "T1", "w1", vec![])
            .await
            .is_err());
        assert!(queue
            .enqueue("undercity/T1", "T1", "w1", vec![])
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_enqueue_rejects_duplicate_branch() {
        let queue = queue_with_defaults();
        queue
            .enqueue("undercity/T1", "T1", "w1", vec![])
            .await
            .unwrap();
        assert!(queue
            .enqueue("undercity/T1", "T1", "w2", vec![])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_detect_queue_conflicts() {
        let queue = queue_with_defaults();
        queue
            .enqueue(
                "undercity/T1",
                "T1",
                "w1",
                vec!["src/app.ts".to_string(), "src/util.ts".to_string()],
            )
            .await
            .unwrap();
        queue
            .enqueue(
                "undercity/T2",
                "T2",
                "w2",
                vec!["src/app.ts".to_string()],
            )
            .await
            .unwrap();
        queue
            .enqueue("undercity/T3", "T3", "w3", vec!["docs/x.md".to_string()])
            .await
            .unwrap();

        let conflicts = queue.detect_queue_conflicts().await;
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].branch_a, "undercity/T1");
        assert_eq!(conflicts[0].branch_b, "undercity/T2");
        assert_eq!(conflicts[0].overlapping_files, vec!["src/app.ts".to_string()]);
    }

    #[tokio::test]
    async fn test_check_conflicts_before_add() {
        let queue = queue_with_defaults();
        queue
            .enqueue(
                "undercity/T1",
                "T1",
                "w1",
                vec!["src/app.ts".to_string()],
            )
            .await
            .unwrap();

        let hits = queue
            .check_conflicts_before_add(&["src/app.ts".to_string()])
            .await;
        assert_eq!(hits, vec!["undercity/T1".to_string()]);

        let misses = queue
            .check_conflicts_before_add(&["src/other.ts".to_string()])
            .await;
        assert!(misses.is_empty());
    }

    #[tokio::test]
    async fn test_process_next_empty_queue() {
        let queue = queue_with_defaults();
        assert!(queue.process_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fail_stalled_conflicts_moves_items() {
        let queue = queue_with_defaults();
        queue
            .enqueue("undercity/T1", "T1", "w1", vec![])
            .await
            .unwrap();
        {
            let mut q = queue.queue.write().await;
            q[0].fail_with(MergeItemStatus::Conflict, "Merge conflicts in: a.ts");
        }

        let moved = queue.fail_stalled_conflicts().await;
        assert_eq!(moved.len(), 1);
        assert!(queue.is_empty().await);
        assert_eq!(queue.get_failed().await.len(), 1);
    }
}
