//! Command-line interface for the engine.
//!
//! Deliberately thin: `grind` runs a session with the recognised knobs,
//! `task` offers minimal backlog intake, `status` prints usage. The rest
//! of the product surface (analytics, TUI, importers) lives elsewhere.

use clap::{Args, Parser, Subcommand};

use crate::domain::models::ModelTier;
use crate::infrastructure::config::parse_tier;

#[derive(Debug, Parser)]
#[command(name = "undercity", version, about = "Autonomous backlog grinder")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Load configuration from a specific file instead of .undercity/
    #[arg(long, global = true)]
    pub config: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the engine over the backlog until drained
    Grind(GrindArgs),
    /// Backlog intake
    Task(TaskArgs),
    /// Print current token usage and pause state
    Status,
}

#[derive(Debug, Args)]
pub struct GrindArgs {
    /// Max concurrent workers
    #[arg(long)]
    pub parallelism: Option<usize>,

    /// Initial model tier (T0/T1/T2)
    #[arg(long, value_parser = parse_tier)]
    pub starting_tier: Option<ModelTier>,

    /// Escalation ceiling (T0/T1/T2)
    #[arg(long, value_parser = parse_tier)]
    pub max_tier: Option<ModelTier>,

    /// Hard cap on attempts per task
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Retries on a tier before stepping up
    #[arg(long)]
    pub max_retries_per_tier: Option<u32>,

    /// Reviewer calls per successful execution
    #[arg(long)]
    pub review_passes: Option<u32>,

    /// Target share of T2-tier tasks, in percent
    #[arg(long)]
    pub opus_budget_percent: Option<f64>,

    /// Re-enter the scheduling cycle when the backlog empties
    #[arg(long)]
    pub continuous: bool,

    /// Auto-drain after this many seconds
    #[arg(long)]
    pub duration: Option<u64>,

    /// Stop after this many tasks
    #[arg(long)]
    pub max_count: Option<usize>,

    /// Push main after each successful merge
    #[arg(long)]
    pub push_on_success: bool,
}

#[derive(Debug, Args)]
pub struct TaskArgs {
    #[command(subcommand)]
    pub command: TaskCommands,
}

#[derive(Debug, Subcommand)]
pub enum TaskCommands {
    /// Add a task to the backlog
    Add {
        /// Stable task id
        id: String,
        /// What the task should accomplish
        objective: String,
        /// 1–1000, lower is higher priority
        #[arg(long, default_value_t = 500)]
        priority: u32,
        /// Ids that must complete first (repeatable)
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,
        /// Tags (repeatable)
        #[arg(long)]
        tag: Vec<String>,
    },
    /// List backlog tasks
    List,
}

impl GrindArgs {
    /// Overlay CLI knobs onto a loaded configuration.
    pub fn apply(&self, config: &mut crate::domain::models::EngineConfig) {
        let grind = &mut config.grind;
        if let Some(v) = self.parallelism {
            grind.parallelism = v;
        }
        if let Some(v) = self.starting_tier {
            grind.starting_tier = v;
        }
        if let Some(v) = self.max_tier {
            grind.max_tier = v;
        }
        if let Some(v) = self.max_attempts {
            grind.max_attempts = v;
        }
        if let Some(v) = self.max_retries_per_tier {
            grind.max_retries_per_tier = v;
        }
        if let Some(v) = self.review_passes {
            grind.review_passes = v;
        }
        if let Some(v) = self.opus_budget_percent {
            grind.opus_budget_percent = v;
        }
        if self.continuous {
            grind.continuous = true;
        }
        if let Some(v) = self.duration {
            grind.duration = Some(v);
        }
        if let Some(v) = self.max_count {
            grind.max_count = Some(v);
        }
        if self.push_on_success {
            grind.push_on_success = true;
        }
    }
}
