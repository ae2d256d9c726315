//! Persistent task store.
//!
//! An in-memory map keyed by task id, persisted to `tasks.json` via temp
//! file + atomic rename on every mutation. All mutations are serialised
//! through one async lock; readers get snapshots. Tasks are never deleted
//! — terminal states stay in place for analytics.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::{AttemptRecord, Task, TaskStatus};
use crate::infrastructure::git::GitClient;
use crate::infrastructure::state::{read_json, write_json_atomic};

/// On-disk shape of the task store file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct TaskFile {
    tasks: Vec<Task>,
}

/// The backlog of tasks, exclusively owned by this store.
pub struct TaskStore {
    inner: Mutex<HashMap<String, Task>>,
    path: PathBuf,
}

impl TaskStore {
    /// Load the store from `path`, creating an empty one if the file does
    /// not exist. Unknown status strings in the file are a load-time
    /// error.
    pub fn load(path: impl Into<PathBuf>) -> EngineResult<Self> {
        let path = path.into();
        let file: TaskFile = read_json(&path)?.unwrap_or_default();

        let mut map = HashMap::with_capacity(file.tasks.len());
        for task in file.tasks {
            task.validate().map_err(EngineError::ValidationFailed)?;
            if map.insert(task.id.clone(), task).is_some() {
                return Err(EngineError::State(format!(
                    "duplicate task id in {}",
                    path.display()
                )));
            }
        }

        info!(path = %path.display(), tasks = map.len(), "task store loaded");
        Ok(Self {
            inner: Mutex::new(map),
            path,
        })
    }

    /// Snapshot of all tasks, ordered by creation time then id.
    pub async fn list(&self) -> Vec<Task> {
        let map = self.inner.lock().await;
        let mut tasks: Vec<Task> = map.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        tasks
    }

    pub async fn get(&self, id: &str) -> Option<Task> {
        self.inner.lock().await.get(id).cloned()
    }

    /// Add a new task. Duplicate ids are rejected.
    pub async fn add(&self, task: Task) -> EngineResult<()> {
        task.validate().map_err(EngineError::ValidationFailed)?;
        let mut map = self.inner.lock().await;
        if map.contains_key(&task.id) {
            return Err(EngineError::ValidationFailed(format!(
                "task {} already exists",
                task.id
            )));
        }
        debug!(task_id = %task.id, "task added");
        map.insert(task.id.clone(), task);
        self.persist(&map)
    }

    /// Transition a task's status through the state machine.
    pub async fn update_status(&self, id: &str, status: TaskStatus) -> EngineResult<()> {
        let mut map = self.inner.lock().await;
        let task = map
            .get_mut(id)
            .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;
        let from = task.status;
        task.transition_to(status)
            .map_err(|_| EngineError::InvalidStatusTransition {
                from: from.as_str().to_string(),
                to: status.as_str().to_string(),
            })?;
        debug!(task_id = id, from = from.as_str(), to = status.as_str(), "status transition");
        self.persist(&map)
    }

    /// Claim a pending task for execution: the pending → in_progress
    /// transition, atomic under the store lock. A second claimant sees
    /// `in_progress` and fails, which is the at-most-one-execution fence.
    pub async fn claim(&self, id: &str) -> EngineResult<Task> {
        let mut map = self.inner.lock().await;
        let task = map
            .get_mut(id)
            .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;
        if task.status != TaskStatus::Pending {
            return Err(EngineError::InvalidStatusTransition {
                from: task.status.as_str().to_string(),
                to: TaskStatus::InProgress.as_str().to_string(),
            });
        }
        task.transition_to(TaskStatus::InProgress)
            .map_err(EngineError::ValidationFailed)?;
        let claimed = task.clone();
        self.persist(&map)?;
        Ok(claimed)
    }

    /// Apply arbitrary field updates under the store lock.
    pub async fn update_fields<F>(&self, id: &str, mutate: F) -> EngineResult<Task>
    where
        F: FnOnce(&mut Task),
    {
        let mut map = self.inner.lock().await;
        let task = map
            .get_mut(id)
            .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;
        mutate(task);
        let updated = task.clone();
        self.persist(&map)?;
        Ok(updated)
    }

    /// Append an attempt record to a task's history.
    pub async fn push_attempt(&self, id: &str, attempt: AttemptRecord) -> EngineResult<()> {
        self.update_fields(id, |task| task.push_attempt(attempt))
            .await?;
        Ok(())
    }

    pub async fn mark_complete(&self, id: &str, resolution: Option<String>) -> EngineResult<()> {
        let mut map = self.inner.lock().await;
        let task = map
            .get_mut(id)
            .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;
        let from = task.status;
        task.transition_to(TaskStatus::Complete)
            .map_err(|_| EngineError::InvalidStatusTransition {
                from: from.as_str().to_string(),
                to: "complete".to_string(),
            })?;
        task.error = None;
        if let Some(resolution) = resolution {
            task.ticket
                .get_or_insert_with(Default::default)
                .implementation_notes = resolution;
        }
        info!(task_id = id, "task complete");
        self.persist(&map)
    }

    pub async fn mark_failed(&self, id: &str, error: impl Into<String>) -> EngineResult<()> {
        let error = error.into();
        let mut map = self.inner.lock().await;
        let task = map
            .get_mut(id)
            .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;
        let from = task.status;
        task.transition_to(TaskStatus::Failed)
            .map_err(|_| EngineError::InvalidStatusTransition {
                from: from.as_str().to_string(),
                to: "failed".to_string(),
            })?;
        task.error = Some(error.clone());
        info!(task_id = id, error = %error, "task failed");
        self.persist(&map)
    }

    pub async fn set_parent(&self, id: &str, parent_id: &str) -> EngineResult<()> {
        self.update_fields(id, |task| {
            task.parent_task_id = Some(parent_id.to_string());
        })
        .await?;
        Ok(())
    }

    /// Mark a parent decomposed and insert its children in one mutation.
    pub async fn decompose(&self, parent_id: &str, children: Vec<Task>) -> EngineResult<()> {
        let mut map = self.inner.lock().await;
        let parent = map
            .get_mut(parent_id)
            .ok_or_else(|| EngineError::TaskNotFound(parent_id.to_string()))?;
        let from = parent.status;
        parent
            .transition_to(TaskStatus::Decomposed)
            .map_err(|_| EngineError::InvalidStatusTransition {
                from: from.as_str().to_string(),
                to: "decomposed".to_string(),
            })?;
        for mut child in children {
            child.parent_task_id = Some(parent_id.to_string());
            child.validate().map_err(EngineError::ValidationFailed)?;
            if map.contains_key(&child.id) {
                return Err(EngineError::ValidationFailed(format!(
                    "child task {} already exists",
                    child.id
                )));
            }
            map.insert(child.id.clone(), child);
        }
        info!(task_id = parent_id, "task decomposed");
        self.persist(&map)
    }

    /// Scan recent commit subjects for task ids and auto-complete matching
    /// tasks whose objective keywords appear in the subject. Returns the
    /// ids completed.
    pub async fn reconcile_with_git(
        &self,
        git: &GitClient,
        repo: &Path,
        lookback_commits: usize,
    ) -> EngineResult<Vec<String>> {
        let subjects = git.log_subjects(repo, lookback_commits).await?;
        let mut completed = Vec::new();

        let mut map = self.inner.lock().await;
        for task in map.values_mut() {
            if task.is_terminal() || task.status == TaskStatus::InProgress {
                continue;
            }
            let keywords = objective_keywords(&task.objective);
            let matched = subjects.iter().any(|subject| {
                subject.contains(&task.id)
                    && keywords
                        .iter()
                        .any(|kw| subject.to_lowercase().contains(kw))
            });
            if matched && task.transition_to(TaskStatus::Complete).is_ok() {
                info!(task_id = %task.id, "reconciled from git history");
                completed.push(task.id.clone());
            }
        }
        if !completed.is_empty() {
            self.persist(&map)?;
        }
        Ok(completed)
    }

    /// Reset tasks left `in_progress` by a previous crashed run.
    pub async fn recover_stale_in_progress(&self) -> EngineResult<Vec<String>> {
        let mut map = self.inner.lock().await;
        let mut recovered = Vec::new();
        for task in map.values_mut() {
            if task.status == TaskStatus::InProgress
                && task.transition_to(TaskStatus::Pending).is_ok()
            {
                recovered.push(task.id.clone());
            }
        }
        if !recovered.is_empty() {
            info!(count = recovered.len(), "recovered stale in-progress tasks");
            self.persist(&map)?;
        }
        Ok(recovered)
    }

    fn persist(&self, map: &HashMap<String, Task>) -> EngineResult<()> {
        let mut tasks: Vec<Task> = map.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        write_json_atomic(&self.path, &TaskFile { tasks })
    }
}

/// Lowercased objective words longer than three characters.
fn objective_keywords(objective: &str) -> Vec<String> {
    objective
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 3)
        .map(str::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> TaskStore {
        TaskStore::load(dir.path().join("tasks.json")).unwrap()
    }

    #[tokio::test]
    async fn test_add_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.add(Task::new("T1", "do something useful")).await.unwrap();

        let task = store.get("T1").await.unwrap();
        assert_eq!(task.objective, "do something useful");
        assert!(store.get("T9").await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.add(Task::new("T1", "a")).await.unwrap();
        assert!(store.add(Task::new("T1", "b")).await.is_err());
    }

    #[tokio::test]
    async fn test_persisted_file_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        let store = TaskStore::load(&path).unwrap();
        store.add(Task::new("T1", "objective one")).await.unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(raw.get("tasks").unwrap().is_array());
        assert_eq!(raw["tasks"][0]["id"], "T1");
        assert!(raw["tasks"][0].get("createdAt").is_some());
    }

    #[tokio::test]
    async fn test_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        {
            let store = TaskStore::load(&path).unwrap();
            store.add(Task::new("T1", "persist me")).await.unwrap();
            store.claim("T1").await.unwrap();
        }
        let store = TaskStore::load(&path).unwrap();
        let task = store.get("T1").await.unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.add(Task::new("T1", "exclusive")).await.unwrap();

        assert!(store.claim("T1").await.is_ok());
        // Second claimant must observe in_progress and fail.
        match store.claim("T1").await {
            Err(EngineError::InvalidStatusTransition { from, .. }) => {
                assert_eq!(from, "in_progress");
            }
            other => panic!("expected transition error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_mark_complete_and_failed() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.add(Task::new("T1", "a")).await.unwrap();
        store.add(Task::new("T2", "b")).await.unwrap();

        store.claim("T1").await.unwrap();
        store.mark_complete("T1", Some("done".to_string())).await.unwrap();
        let t1 = store.get("T1").await.unwrap();
        assert_eq!(t1.status, TaskStatus::Complete);
        assert!(t1.completed_at.is_some());

        store.claim("T2").await.unwrap();
        store.mark_failed("T2", "verification failed").await.unwrap();
        let t2 = store.get("T2").await.unwrap();
        assert_eq!(t2.status, TaskStatus::Failed);
        assert_eq!(t2.error.as_deref(), Some("verification failed"));
    }

    #[tokio::test]
    async fn test_decompose_inserts_children() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.add(Task::new("T1", "big one")).await.unwrap();
        store.claim("T1").await.unwrap();

        store
            .decompose(
                "T1",
                vec![Task::new("T1-c1", "part one"), Task::new("T1-c2", "part two")],
            )
            .await
            .unwrap();

        assert_eq!(store.get("T1").await.unwrap().status, TaskStatus::Decomposed);
        let child = store.get("T1-c1").await.unwrap();
        assert_eq!(child.parent_task_id.as_deref(), Some("T1"));
        assert_eq!(child.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_recover_stale_in_progress() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.add(Task::new("T1", "stale")).await.unwrap();
        store.claim("T1").await.unwrap();

        let recovered = store.recover_stale_in_progress().await.unwrap();
        assert_eq!(recovered, vec!["T1".to_string()]);
        assert_eq!(store.get("T1").await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_load_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        std::fs::write(&path, b"{\"tasks\": [{\"id\": \"T1\"").unwrap();
        assert!(TaskStore::load(&path).is_err());
    }

    #[tokio::test]
    async fn test_load_rejects_unknown_status() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        std::fs::write(
            &path,
            br#"{"tasks":[{"id":"T1","objective":"x","status":"weird","priority":500,"createdAt":"2025-01-01T00:00:00Z"}]}"#,
        )
        .unwrap();
        assert!(TaskStore::load(&path).is_err());
    }

    #[test]
    fn test_objective_keywords() {
        let kws = objective_keywords("Add helper in src/util.ts");
        assert!(kws.contains(&"helper".to_string()));
        assert!(kws.contains(&"util".to_string()));
        assert!(!kws.contains(&"in".to_string()));
    }
}
