//! Engine configuration.
//!
//! Loaded hierarchically (defaults ← `.undercity/config.yaml` ←
//! `.undercity/local.yaml` ← `UNDERCITY_*` env vars) by the
//! infrastructure config loader. The run knobs in [`GrindConfig`] keep
//! their stable camelCase names.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::task::ModelTier;

/// Default state directory name, relative to the repository root.
pub const STATE_DIR: &str = ".undercity";

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Repository the engine operates on
    pub repo_path: PathBuf,
    /// State directory (tasks.json, metrics, index, logs, lockfile)
    pub state_dir: PathBuf,
    /// Branch the merge queue drains into
    pub main_branch: String,
    /// Baseline verification command as an argv template; empty skips
    /// verification
    pub verify_command: Vec<String>,
    pub grind: GrindConfig,
    pub governor: GovernorConfig,
    pub index: IndexConfig,
    pub agent: AgentConfig,
    pub timeouts: TimeoutConfig,
    pub logging: LogConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            repo_path: PathBuf::from("."),
            state_dir: PathBuf::from(STATE_DIR),
            main_branch: "main".to_string(),
            verify_command: Vec::new(),
            grind: GrindConfig::default(),
            governor: GovernorConfig::default(),
            index: IndexConfig::default(),
            agent: AgentConfig::default(),
            timeouts: TimeoutConfig::default(),
            logging: LogConfig::default(),
        }
    }
}

/// Run knobs recognised by a grind session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GrindConfig {
    /// Max concurrent workers
    pub parallelism: usize,
    /// Initial tier for tasks without a recommended model
    pub starting_tier: ModelTier,
    /// Escalation ceiling
    pub max_tier: ModelTier,
    /// Hard cap on attempts per task, across all tiers
    pub max_attempts: u32,
    /// Retries on a tier before stepping up
    pub max_retries_per_tier: u32,
    /// Reviewer calls per successful execution
    pub review_passes: u32,
    /// Cap on reviewer calls before escalation
    pub max_review_passes_per_tier: u32,
    /// Cap on T2-tier reviewer usage
    pub max_opus_review_passes: u32,
    /// Target share of T2-tier tasks, in percent
    pub opus_budget_percent: f64,
    /// Whether the worker commits on success
    pub auto_commit: bool,
    /// Whether to push after merge
    pub push_on_success: bool,
    /// Re-enter the scheduling cycle when the backlog empties
    pub continuous: bool,
    /// Wall-clock auto-drain after this many seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    /// Stop after this many tasks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_count: Option<usize>,
}

impl Default for GrindConfig {
    fn default() -> Self {
        Self {
            parallelism: 3,
            starting_tier: ModelTier::T1,
            max_tier: ModelTier::T2,
            max_attempts: 6,
            max_retries_per_tier: 2,
            review_passes: 1,
            max_review_passes_per_tier: 2,
            max_opus_review_passes: 1,
            opus_budget_percent: 10.0,
            auto_commit: true,
            push_on_success: false,
            continuous: false,
            duration: None,
            max_count: None,
        }
    }
}

/// Token ceilings per tier for one accounting window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TierCeilings {
    pub t0: u64,
    pub t1: u64,
    pub t2: u64,
}

impl TierCeilings {
    pub fn for_tier(&self, tier: ModelTier) -> u64 {
        match tier {
            ModelTier::T0 => self.t0,
            ModelTier::T1 => self.t1,
            ModelTier::T2 => self.t2,
        }
    }
}

impl Default for TierCeilings {
    fn default() -> Self {
        Self {
            t0: 20_000_000,
            t1: 10_000_000,
            t2: 2_000_000,
        }
    }
}

/// Rate-limit governor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// Token ceilings for the rolling 5-hour window
    pub five_hour_ceilings: TierCeilings,
    /// Token ceilings for the rolling 7-day window
    pub seven_day_ceilings: TierCeilings,
    /// Five-hour consumption fraction that logs a warning
    pub five_hour_warn_pct: f64,
    /// Seven-day consumption fraction that logs a warning
    pub seven_day_warn_pct: f64,
    /// Back-off when a 429 carries no usable reset header, in seconds
    pub default_backoff_secs: u64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            five_hour_ceilings: TierCeilings::default(),
            seven_day_ceilings: TierCeilings {
                t0: 120_000_000,
                t1: 60_000_000,
                t2: 12_000_000,
            },
            five_hour_warn_pct: 0.80,
            seven_day_warn_pct: 0.90,
            default_backoff_secs: 300,
        }
    }
}

/// Retrieval index configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Database filename inside the state directory
    pub db_file: String,
    /// Target chunk size in tokens
    pub chunk_target_tokens: usize,
    /// Minimum chunk size in tokens
    pub chunk_min_tokens: usize,
    /// Learnings injected per task prompt
    pub learnings_per_task: usize,
    pub vector_weight: f64,
    pub fts_weight: f64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            db_file: "rag.sqlite".to_string(),
            chunk_target_tokens: 500,
            chunk_min_tokens: 50,
            learnings_per_task: 5,
            vector_weight: 0.7,
            fts_weight: 0.3,
        }
    }
}

/// LLM agent CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Path to the agent CLI binary
    pub binary_path: String,
    pub max_turns: u32,
    pub permission_mode: String,
    /// Extra CLI flags appended to every invocation
    pub extra_flags: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary_path: "claude".to_string(),
            max_turns: 25,
            permission_mode: "acceptEdits".to_string(),
            extra_flags: Vec::new(),
        }
    }
}

/// Timeouts for external processes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Wall-clock cap per LLM call, in seconds
    pub agent_call_secs: u64,
    /// Cap per git subprocess, in seconds
    pub git_secs: u64,
    /// Cap per verification run, in seconds
    pub verify_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            agent_call_secs: 600,
            git_secs: 30,
            verify_secs: 300,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// One of: trace, debug, info, warn, error
    pub level: String,
    /// One of: json, pretty (stdout layer only; the file layer is always
    /// JSON)
    pub format: String,
    pub enable_stdout: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            enable_stdout: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.main_branch, "main");
        assert_eq!(config.grind.parallelism, 3);
        assert_eq!(config.grind.starting_tier, ModelTier::T1);
        assert!((config.grind.opus_budget_percent - 10.0).abs() < f64::EPSILON);
        assert_eq!(config.index.chunk_target_tokens, 500);
        assert_eq!(config.governor.default_backoff_secs, 300);
    }

    #[test]
    fn test_grind_knobs_use_stable_names() {
        let yaml = "parallelism: 5\nstartingTier: T0\nmaxAttempts: 4\nopusBudgetPercent: 20\n";
        let grind: GrindConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(grind.parallelism, 5);
        assert_eq!(grind.starting_tier, ModelTier::T0);
        assert_eq!(grind.max_attempts, 4);
        assert!((grind.opus_budget_percent - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_tier_ceilings_lookup() {
        let ceilings = TierCeilings {
            t0: 1,
            t1: 2,
            t2: 3,
        };
        assert_eq!(ceilings.for_tier(ModelTier::T0), 1);
        assert_eq!(ceilings.for_tier(ModelTier::T2), 3);
    }
}
