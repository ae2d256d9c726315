//! The grind loop.
//!
//! Top-level session: repeatedly select a compatible batch, run workers
//! in parallel worktrees, and let the serial merge drainer advance main.
//! Workers enqueue asynchronously and never await merge completion; the
//! drainer runs on its own task for the whole session and updates the
//! task store as items reach terminal states.

use comfy_table::Table;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::domain::errors::EngineResult;
use crate::domain::models::{EngineConfig, MergeItemStatus, ModelTier, Task, TaskStatus};
use crate::domain::ports::{AgentClient, ResearchPolicy, SaturationPolicy};
use crate::infrastructure::git::GitClient;
use crate::infrastructure::index::{HashEmbedder, RetrievalIndex};
use crate::services::governor::RateLimitGovernor;
use crate::services::merge_queue::{MergeQueue, MergeQueueConfig};
use crate::services::metrics::MetricsSink;
use crate::services::scheduler::{OpusBudget, Scheduler, SchedulerConfig};
use crate::services::task_store::TaskStore;
use crate::services::verify::Verifier;
use crate::services::worker::{Worker, WorkerConfig, WorkerDeps, WorkerOutcome};

const IDLE_POLL: Duration = Duration::from_millis(500);
const CONTINUOUS_POLL: Duration = Duration::from_secs(5);
const GIT_RECONCILE_LOOKBACK: usize = 50;

/// End-of-session tallies.
#[derive(Debug, Default, Serialize)]
pub struct SessionSummary {
    pub executed: u64,
    pub merged: u64,
    pub failed: u64,
    pub decomposed: u64,
    pub merge_failed: u64,
    pub drained: u64,
    pub elapsed_secs: u64,
}

impl SessionSummary {
    /// Human-readable summary table for the exit report.
    pub fn render_table(&self) -> Table {
        let mut table = Table::new();
        table.set_header(vec!["Metric", "Count"]);
        table.add_row(vec!["Tasks executed".to_string(), self.executed.to_string()]);
        table.add_row(vec!["Merged".to_string(), self.merged.to_string()]);
        table.add_row(vec!["Failed".to_string(), self.failed.to_string()]);
        table.add_row(vec!["Decomposed".to_string(), self.decomposed.to_string()]);
        table.add_row(vec!["Merge failures".to_string(), self.merge_failed.to_string()]);
        table.add_row(vec!["Drained".to_string(), self.drained.to_string()]);
        table.add_row(vec!["Elapsed (s)".to_string(), self.elapsed_secs.to_string()]);
        table
    }
}

#[derive(Default)]
struct Counters {
    executed: AtomicU64,
    merged: AtomicU64,
    failed: AtomicU64,
    decomposed: AtomicU64,
    merge_failed: AtomicU64,
    drained: AtomicU64,
}

/// One engine session over a repository.
pub struct GrindSession {
    config: EngineConfig,
    store: Arc<TaskStore>,
    governor: Arc<RateLimitGovernor>,
    index: Arc<RetrievalIndex>,
    metrics: Arc<MetricsSink>,
    merge_queue: Arc<MergeQueue>,
    scheduler: Scheduler,
    opus_budget: Arc<OpusBudget>,
    worker: Arc<Worker>,
    git: Arc<GitClient>,
    drain: Arc<AtomicBool>,
}

impl GrindSession {
    /// Wire the full engine from configuration and an agent client.
    pub async fn bootstrap(
        config: EngineConfig,
        agent: Arc<dyn AgentClient>,
    ) -> EngineResult<Self> {
        Self::bootstrap_with_policy(config, agent, Arc::new(SaturationPolicy::new())).await
    }

    pub async fn bootstrap_with_policy(
        mut config: EngineConfig,
        agent: Arc<dyn AgentClient>,
        research_policy: Arc<dyn ResearchPolicy>,
    ) -> EngineResult<Self> {
        // Worktrees and the merge queue run git with varying working
        // directories; relative paths would re-resolve against each one.
        config.repo_path = std::fs::canonicalize(&config.repo_path)?;
        std::fs::create_dir_all(&config.state_dir)?;
        config.state_dir = std::fs::canonicalize(&config.state_dir)?;

        let state_dir = &config.state_dir;

        let git = Arc::new(GitClient::new(Duration::from_secs(config.timeouts.git_secs)));
        let store = Arc::new(TaskStore::load(state_dir.join("tasks.json"))?);
        let governor = Arc::new(
            RateLimitGovernor::new(config.governor.clone())
                .with_snapshot(state_dir.join("governor.json")),
        );
        let metrics = Arc::new(MetricsSink::new(
            state_dir.join("live-metrics.json"),
            state_dir.join("metrics.jsonl"),
        ));
        let index = Arc::new(
            RetrievalIndex::open(
                &state_dir.join(&config.index.db_file),
                Arc::new(HashEmbedder::default()),
                config.index.clone(),
            )
            .await?,
        );

        let verifier = Verifier::new(
            config.verify_command.clone(),
            Duration::from_secs(config.timeouts.verify_secs),
        );
        let merge_queue = Arc::new(MergeQueue::new(
            git.clone(),
            verifier.clone(),
            MergeQueueConfig {
                repo_path: config.repo_path.clone(),
                state_dir: config.state_dir.clone(),
                main_branch: config.main_branch.clone(),
                ..MergeQueueConfig::default()
            },
        ));

        let opus_budget = Arc::new(OpusBudget::new(config.grind.opus_budget_percent));
        let drain = Arc::new(AtomicBool::new(false));

        let worker = Arc::new(Worker::new(
            WorkerDeps {
                agent,
                governor: governor.clone(),
                index: index.clone(),
                store: store.clone(),
                metrics: metrics.clone(),
                git: git.clone(),
                merge_queue: merge_queue.clone(),
                research_policy,
                opus_budget: opus_budget.clone(),
                drain: drain.clone(),
            },
            WorkerConfig::from_engine(&config),
            verifier,
        ));
        merge_queue.set_fixer(worker.clone()).await;

        let scheduler = Scheduler::new(SchedulerConfig {
            max_concurrent: config.grind.parallelism,
            starting_tier: config.grind.starting_tier,
        });

        Ok(Self {
            config,
            store,
            governor,
            index,
            metrics,
            merge_queue,
            scheduler,
            opus_budget,
            worker,
            git,
            drain,
        })
    }

    /// Handle for signal handlers: raising the flag drains the session.
    pub fn drain_flag(&self) -> Arc<AtomicBool> {
        self.drain.clone()
    }

    pub fn store(&self) -> Arc<TaskStore> {
        self.store.clone()
    }

    /// Run the session to completion.
    #[allow(clippy::too_many_lines)]
    pub async fn run(&self) -> EngineResult<SessionSummary> {
        let started = Instant::now();
        let deadline = self
            .config
            .grind
            .duration
            .map(|secs| started + Duration::from_secs(secs));
        let counters = Arc::new(Counters::default());
        let mut dispatched_total: usize = 0;

        // Startup reconciliation.
        self.store.recover_stale_in_progress().await?;
        if let Err(e) = self
            .store
            .reconcile_with_git(&self.git, &self.config.repo_path, GIT_RECONCILE_LOOKBACK)
            .await
        {
            warn!(error = %e, "git reconciliation failed; continuing");
        }
        self.refresh_index().await;

        // Serial merge drainer, for the whole session.
        let drainer_stop = Arc::new(AtomicBool::new(false));
        let drainer = self.spawn_drainer(counters.clone(), drainer_stop.clone());

        loop {
            if self.drain.load(Ordering::SeqCst) {
                info!("drain flag raised; stopping scheduling");
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                info!("configured duration elapsed; draining");
                self.drain.store(true, Ordering::SeqCst);
                break;
            }
            if self
                .config
                .grind
                .max_count
                .is_some_and(|max| dispatched_total >= max)
            {
                info!("maxCount reached; draining");
                break;
            }

            let verdict = self.governor.check().await;
            let tasks = self.store.list().await;
            let batch = self
                .scheduler
                .select_batch(&tasks, &verdict, &self.opus_budget);

            if batch.is_empty() {
                let has_pending = tasks.iter().any(|t| t.status == TaskStatus::Pending);
                if verdict.is_paused() && has_pending {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
                if self.merge_queue.has_processable().await {
                    tokio::time::sleep(IDLE_POLL).await;
                    continue;
                }
                if self.config.grind.continuous {
                    tokio::time::sleep(CONTINUOUS_POLL).await;
                    continue;
                }
                break;
            }

            dispatched_total += self.run_batch(batch, &counters).await;

            // Refresh learnings between batches.
            self.refresh_index().await;
        }

        // Let the drainer finish everything still processable, then give
        // up on conflicts that can no longer advance.
        while self.merge_queue.has_processable().await {
            tokio::time::sleep(IDLE_POLL).await;
        }
        for item in self.merge_queue.fail_stalled_conflicts().await {
            let error = item
                .last_error
                .clone()
                .unwrap_or_else(|| "merge conflict".to_string());
            counters.merge_failed.fetch_add(1, Ordering::SeqCst);
            let _ = self.metrics.record_merge_failure().await;
            if let Err(e) = self.store.mark_failed(&item.task_id, &error).await {
                warn!(task_id = %item.task_id, error = %e, "could not fail conflicted task");
            }
        }
        drainer_stop.store(true, Ordering::SeqCst);
        let _ = drainer.await;

        let summary = SessionSummary {
            executed: counters.executed.load(Ordering::SeqCst),
            merged: counters.merged.load(Ordering::SeqCst),
            failed: counters.failed.load(Ordering::SeqCst),
            decomposed: counters.decomposed.load(Ordering::SeqCst),
            merge_failed: counters.merge_failed.load(Ordering::SeqCst),
            drained: counters.drained.load(Ordering::SeqCst),
            elapsed_secs: started.elapsed().as_secs(),
        };
        info!(?summary, "session complete");
        Ok(summary)
    }

    /// Dispatch one batch and wait for its workers. Returns how many
    /// tasks were actually claimed and run.
    async fn run_batch(&self, batch: Vec<(Task, ModelTier)>, counters: &Arc<Counters>) -> usize {
        let mut join_set = JoinSet::new();
        let mut claimed_count = 0;

        for (task, tier) in batch {
            // The claim fence: a task already grabbed elsewhere is skipped.
            let claimed = match self.store.claim(&task.id).await {
                Ok(task) => task,
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "claim failed; skipping");
                    continue;
                }
            };
            claimed_count += 1;
            self.opus_budget.record_dispatch(tier);

            let worker = self.worker.clone();
            join_set.spawn(async move {
                let outcome = worker.run(&claimed, tier).await;
                (claimed.id, outcome)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((task_id, outcome)) => {
                    counters.executed.fetch_add(1, Ordering::SeqCst);
                    match outcome {
                        WorkerOutcome::Merged { .. } => {
                            // Counted as merged once the drainer completes
                            // the item; nothing to do here.
                        }
                        WorkerOutcome::Failed { reason } => {
                            info!(task_id, reason, "worker failed");
                            counters.failed.fetch_add(1, Ordering::SeqCst);
                        }
                        WorkerOutcome::Decomposed { children } => {
                            info!(task_id, children, "worker decomposed task");
                            counters.decomposed.fetch_add(1, Ordering::SeqCst);
                        }
                        WorkerOutcome::Drained => {
                            counters.drained.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                }
                Err(e) => {
                    // A panicked worker is a bug, but the session carries on.
                    error!(error = %e, "worker task join failed");
                }
            }
        }
        claimed_count
    }

    fn spawn_drainer(
        &self,
        counters: Arc<Counters>,
        stop: Arc<AtomicBool>,
    ) -> tokio::task::JoinHandle<()> {
        let queue = self.merge_queue.clone();
        let store = self.store.clone();
        let metrics = self.metrics.clone();
        let git = self.git.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            loop {
                if stop.load(Ordering::SeqCst) && !queue.has_processable().await {
                    break;
                }
                match queue.process_next().await {
                    Ok(Some(item)) => match item.status {
                        MergeItemStatus::Complete => {
                            counters.merged.fetch_add(1, Ordering::SeqCst);
                            if let Err(e) = store.mark_complete(&item.task_id, None).await {
                                warn!(task_id = %item.task_id, error = %e, "mark complete failed");
                            }
                            if config.grind.push_on_success {
                                if let Err(e) = git
                                    .push(&config.repo_path, "origin", &config.main_branch)
                                    .await
                                {
                                    warn!(error = %e, "push after merge failed");
                                }
                            }
                        }
                        MergeItemStatus::TestFailed => {
                            counters.merge_failed.fetch_add(1, Ordering::SeqCst);
                            let _ = metrics.record_merge_failure().await;
                            let error = item
                                .last_error
                                .clone()
                                .unwrap_or_else(|| "merge verification failed".to_string());
                            if let Err(e) = store.mark_failed(&item.task_id, &error).await {
                                warn!(task_id = %item.task_id, error = %e, "mark failed failed");
                            }
                        }
                        // Retryable conflicts stay queued until main
                        // advances; nothing to record yet.
                        _ => {}
                    },
                    Ok(None) => tokio::time::sleep(IDLE_POLL).await,
                    Err(e) => {
                        // Fatal queue errors (worktree corruption, non-FF
                        // merge) stop the drainer; the session surfaces
                        // failures via task states.
                        error!(error = %e, "merge drainer stopped on fatal error");
                        break;
                    }
                }
            }
        })
    }

    /// Re-index learnings from completed tasks so later batches can
    /// retrieve them. Failures only cost context, never the session.
    async fn refresh_index(&self) {
        let tasks = self.store.list().await;
        for task in tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Complete)
        {
            let mut text = task.objective.clone();
            if let Some(ticket) = &task.ticket {
                if !ticket.implementation_notes.is_empty() {
                    text.push_str("\n\n");
                    text.push_str(&ticket.implementation_notes);
                }
            }
            let result = self
                .index
                .index_document(
                    &format!("task:{}", task.id),
                    "task-notes",
                    &task.objective,
                    &text,
                    std::collections::HashMap::new(),
                )
                .await;
            if let Err(e) = result {
                warn!(task_id = %task.id, error = %e, "indexing task notes failed");
            }
        }
    }
}
