//! Task scheduler.
//!
//! Each cycle the scheduler filters the backlog to dependency-ready
//! tasks, sorts them by priority and age, builds a pairwise blocking
//! graph from predicted file overlap plus explicit conflict lists, and
//! greedily selects a compatible batch bounded by the concurrency limit.
//! Tier assignment respects the session's opus budget; session counters
//! live here and reset per run.
//!
//! The scheduler never raises: an empty batch is a valid continuation
//! signal.

use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;
use tracing::debug;

use crate::domain::models::{ModelTier, Task, TaskStatus};
use crate::services::governor::GovernorVerdict;

/// Risk above which a task is treated as high-risk for batch damping.
pub const HIGH_RISK_THRESHOLD: f64 = 0.7;

/// Session-wide opus accounting, shared between the scheduler (initial
/// assignment) and workers (escalation).
#[derive(Debug, Default)]
pub struct OpusBudget {
    opus_used: AtomicU32,
    tasks_processed: AtomicU32,
    percent: f64,
}

impl OpusBudget {
    pub fn new(percent: f64) -> Self {
        Self {
            opus_used: AtomicU32::new(0),
            tasks_processed: AtomicU32::new(0),
            percent,
        }
    }

    /// Whether a T2 assignment is currently permitted: the first opus
    /// task is always allowed, after that the running share must stay
    /// under the configured percentage.
    pub fn allows_opus(&self) -> bool {
        let used = self.opus_used.load(Ordering::SeqCst);
        if used == 0 {
            return true;
        }
        let processed = self.tasks_processed.load(Ordering::SeqCst).max(1);
        f64::from(used) / f64::from(processed) < self.percent / 100.0
    }

    /// Record one dispatched task and its assigned tier.
    pub fn record_dispatch(&self, tier: ModelTier) {
        self.tasks_processed.fetch_add(1, Ordering::SeqCst);
        if tier == ModelTier::T2 {
            self.opus_used.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Record an escalation to T2 after dispatch.
    pub fn record_escalation_to_opus(&self) {
        self.opus_used.fetch_add(1, Ordering::SeqCst);
    }

    pub fn opus_used(&self) -> u32 {
        self.opus_used.load(Ordering::SeqCst)
    }

    pub fn tasks_processed(&self) -> u32 {
        self.tasks_processed.load(Ordering::SeqCst)
    }
}

/// Scheduler configuration for one session.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Batch size bound (max concurrent workers)
    pub max_concurrent: usize,
    pub starting_tier: ModelTier,
}

/// Batch selection over the backlog.
pub struct Scheduler {
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    /// Select a compatible batch of at most `max_concurrent` tasks.
    ///
    /// Returns an empty batch when the governor reports a pause, when no
    /// task is dependency-ready, or when the backlog is empty.
    pub fn select_batch(
        &self,
        tasks: &[Task],
        verdict: &GovernorVerdict,
        budget: &OpusBudget,
    ) -> Vec<(Task, ModelTier)> {
        if verdict.is_paused() {
            return Vec::new();
        }

        let complete: HashSet<&str> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Complete)
            .map(|t| t.id.as_str())
            .collect();
        let known: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();

        // Dependency filter. A dependency on an unknown id blocks forever.
        let mut candidates: Vec<&Task> = tasks
            .iter()
            .filter(|t| t.is_executable())
            .filter(|t| {
                t.depends_on.as_ref().is_none_or(|deps| {
                    deps.iter()
                        .all(|d| known.contains(d.as_str()) && complete.contains(d.as_str()))
                })
            })
            .collect();

        candidates.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
        });

        // Predicted file sets (declared files plus the package heuristic).
        let predicted: HashMap<&str, HashSet<String>> = candidates
            .iter()
            .map(|t| (t.id.as_str(), predicted_footprint(t)))
            .collect();

        let mut batch: Vec<(Task, ModelTier)> = Vec::new();
        let mut deferred_high_risk: Vec<&Task> = Vec::new();
        let mut batch_has_high_risk = false;

        for candidate in &candidates {
            if batch.len() >= self.config.max_concurrent {
                break;
            }
            if self.blocked_by_batch(candidate, &batch, &predicted) {
                continue;
            }

            let risk = risk_score(candidate);
            if risk > HIGH_RISK_THRESHOLD && batch_has_high_risk {
                // Two high-risk tasks only share a batch when nothing else
                // can fill the slot.
                deferred_high_risk.push(candidate);
                continue;
            }

            if risk > HIGH_RISK_THRESHOLD {
                batch_has_high_risk = true;
            }
            let tier = self.assign_tier(candidate, budget, &batch);
            batch.push(((*candidate).clone(), tier));
        }

        // Fill remaining slots with the deferred high-risk tasks.
        for candidate in deferred_high_risk {
            if batch.len() >= self.config.max_concurrent {
                break;
            }
            if self.blocked_by_batch(candidate, &batch, &predicted) {
                continue;
            }
            let tier = self.assign_tier(candidate, budget, &batch);
            batch.push((candidate.clone(), tier));
        }

        debug!(
            candidates = candidates.len(),
            selected = batch.len(),
            "batch selected"
        );
        batch
    }

    fn blocked_by_batch(
        &self,
        candidate: &Task,
        batch: &[(Task, ModelTier)],
        predicted: &HashMap<&str, HashSet<String>>,
    ) -> bool {
        let own_files = predicted.get(candidate.id.as_str());
        for (selected, _) in batch {
            // Explicit conflicts in either direction.
            if lists_conflict(candidate, selected) || lists_conflict(selected, candidate) {
                return true;
            }
            // Implicit file conflicts.
            if let (Some(a), Some(b)) = (own_files, predicted.get(selected.id.as_str())) {
                if !a.is_disjoint(b) {
                    return true;
                }
            }
        }
        false
    }

    /// Recommended model wins; otherwise the session's starting tier. T2
    /// assignments are downgraded when the opus budget is exhausted,
    /// counting T2 picks already in this batch.
    fn assign_tier(
        &self,
        task: &Task,
        budget: &OpusBudget,
        batch: &[(Task, ModelTier)],
    ) -> ModelTier {
        let wanted = task.recommended_model.unwrap_or(self.config.starting_tier);
        if wanted != ModelTier::T2 {
            return wanted;
        }
        let in_batch_t2 = batch.iter().filter(|(_, t)| *t == ModelTier::T2).count();
        if in_batch_t2 == 0 && budget.allows_opus() {
            ModelTier::T2
        } else {
            ModelTier::T1
        }
    }
}

fn lists_conflict(a: &Task, b: &Task) -> bool {
    a.conflicts
        .as_ref()
        .is_some_and(|list| list.iter().any(|id| *id == b.id))
}

/// Declared predicted files plus packages extracted from the objective.
pub fn predicted_footprint(task: &Task) -> HashSet<String> {
    let mut files: HashSet<String> = task
        .predicted_files
        .iter()
        .flatten()
        .cloned()
        .collect();
    files.extend(
        task.computed_packages
            .iter()
            .flatten()
            .cloned(),
    );
    files.extend(extract_packages(&task.objective));
    files
}

/// Path-like tokens in an objective, plus their leading package segment.
pub fn extract_packages(objective: &str) -> HashSet<String> {
    static PATH_RE: OnceLock<Regex> = OnceLock::new();
    let re = PATH_RE.get_or_init(|| {
        Regex::new(r"[A-Za-z0-9_@.-]+(?:/[A-Za-z0-9_@.-]+)+|[A-Za-z0-9_-]+\.[a-z]{1,4}\b")
            .unwrap()
    });

    let mut out = HashSet::new();
    for m in re.find_iter(objective) {
        let token = m.as_str().trim_end_matches(['.', ',']);
        out.insert(token.to_string());
        if let Some((package, _)) = token.split_once('/') {
            out.insert(format!("{package}/"));
        }
    }
    out
}

/// Weighted risk score in `[0, 1]`.
///
/// Inputs: breadth of the predicted footprint, sensitive tags, and the
/// presence of dependency or conflict lists.
pub fn risk_score(task: &Task) -> f64 {
    if let Some(score) = task.risk_score {
        return score.clamp(0.0, 1.0);
    }

    let packages = task
        .computed_packages
        .as_ref()
        .map_or_else(|| extract_packages(&task.objective).len(), Vec::len);
    let files = task.predicted_files.as_ref().map_or(0, Vec::len);

    #[allow(clippy::cast_precision_loss)]
    let mut score = 0.25 * (packages.min(4) as f64 / 4.0) + 0.25 * (files.min(10) as f64 / 10.0);

    if ["security", "migration", "payment"]
        .iter()
        .any(|tag| task.has_tag(tag))
    {
        score += 0.3;
    }
    if task.depends_on.as_ref().is_some_and(|d| !d.is_empty())
        || task.conflicts.as_ref().is_some_and(|c| !c.is_empty())
    {
        score += 0.2;
    }
    score.min(1.0)
}
