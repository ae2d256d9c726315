//! Session metrics.
//!
//! Two outputs: `live-metrics.json`, the current-session counters
//! rewritten atomically on every update, and `metrics.jsonl`, an
//! append-only stream of per-task records. Cost is estimated from a
//! per-tier pricing table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

use crate::domain::errors::EngineResult;
use crate::domain::models::ModelTier;
use crate::domain::ports::TokenUsage;
use crate::infrastructure::state::{append_jsonl, write_json_atomic};

/// USD per million tokens (input, output) for a tier.
fn tier_pricing(tier: ModelTier) -> (f64, f64) {
    match tier {
        ModelTier::T0 => (0.80, 4.00),
        ModelTier::T1 => (3.00, 15.00),
        ModelTier::T2 => (15.00, 75.00),
    }
}

/// Estimated cost in USD for one usage reading.
#[allow(clippy::cast_precision_loss)]
pub fn estimate_cost(tier: ModelTier, usage: TokenUsage) -> f64 {
    let (input_per_m, output_per_m) = tier_pricing(tier);
    usage.input_tokens as f64 / 1_000_000.0 * input_per_m
        + usage.output_tokens as f64 / 1_000_000.0 * output_per_m
}

/// Per-tier token tally.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierTokens {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub calls: u64,
}

/// Current-session counters, persisted as `live-metrics.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveMetrics {
    pub session_started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub tasks_executed: u64,
    pub tasks_merged: u64,
    pub tasks_failed: u64,
    pub tasks_decomposed: u64,
    pub merge_failures: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost_usd: f64,
    pub index_queries: u64,
    pub per_tier: BTreeMap<ModelTier, TierTokens>,
}

impl LiveMetrics {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            session_started_at: now,
            updated_at: now,
            tasks_executed: 0,
            tasks_merged: 0,
            tasks_failed: 0,
            tasks_decomposed: 0,
            merge_failures: 0,
            input_tokens: 0,
            output_tokens: 0,
            estimated_cost_usd: 0.0,
            index_queries: 0,
            per_tier: BTreeMap::new(),
        }
    }
}

/// Append-only per-task record in `metrics.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetricRecord {
    pub task_id: String,
    pub success: bool,
    pub total_tokens: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub final_model: ModelTier,
    pub was_escalated: bool,
    pub attempts: u32,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

/// Sink for all session metrics, shared across workers.
pub struct MetricsSink {
    live_path: PathBuf,
    jsonl_path: PathBuf,
    inner: Mutex<LiveMetrics>,
}

impl MetricsSink {
    pub fn new(live_path: impl Into<PathBuf>, jsonl_path: impl Into<PathBuf>) -> Self {
        Self {
            live_path: live_path.into(),
            jsonl_path: jsonl_path.into(),
            inner: Mutex::new(LiveMetrics::new()),
        }
    }

    /// Record token usage for one agent call.
    pub async fn record_usage(&self, tier: ModelTier, usage: TokenUsage) -> EngineResult<()> {
        let mut live = self.inner.lock().await;
        live.input_tokens += usage.input_tokens;
        live.output_tokens += usage.output_tokens;
        live.estimated_cost_usd += estimate_cost(tier, usage);
        let entry = live.per_tier.entry(tier).or_default();
        entry.input_tokens += usage.input_tokens;
        entry.output_tokens += usage.output_tokens;
        entry.calls += 1;
        self.flush(&mut live)
    }

    pub async fn record_index_query(&self) -> EngineResult<()> {
        let mut live = self.inner.lock().await;
        live.index_queries += 1;
        self.flush(&mut live)
    }

    /// Record a finished task: appends a jsonl record and bumps the
    /// session counters.
    pub async fn record_task(&self, record: &TaskMetricRecord) -> EngineResult<()> {
        append_jsonl(&self.jsonl_path, record)?;

        let mut live = self.inner.lock().await;
        live.tasks_executed += 1;
        if record.success {
            live.tasks_merged += 1;
        } else {
            live.tasks_failed += 1;
        }
        self.flush(&mut live)
    }

    pub async fn record_decomposed(&self) -> EngineResult<()> {
        let mut live = self.inner.lock().await;
        live.tasks_executed += 1;
        live.tasks_decomposed += 1;
        self.flush(&mut live)
    }

    pub async fn record_merge_failure(&self) -> EngineResult<()> {
        let mut live = self.inner.lock().await;
        live.merge_failures += 1;
        self.flush(&mut live)
    }

    pub async fn snapshot(&self) -> LiveMetrics {
        self.inner.lock().await.clone()
    }

    fn flush(&self, live: &mut LiveMetrics) -> EngineResult<()> {
        live.updated_at = Utc::now();
        write_json_atomic(&self.live_path, live)
    }
}
