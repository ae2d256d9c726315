//! Undercity — autonomous backlog grinder.
//!
//! The execution engine drives a backlog of coding tasks to completion by
//! dispatching each to an external LLM agent, isolating its work in a
//! per-task git worktree, verifying the result, and serialising merges
//! onto the main branch under conflict and rate-limit constraints:
//! - Task scheduler with dependency, conflict, and opus-budget awareness
//! - Worker state machine with tier escalation and review passes
//! - Serial merge queue with rebase, re-verification, and FF-only merges
//! - Rate-limit governor over rolling 5-hour / 7-day token windows
//! - Hybrid (vector + FTS) retrieval index for prior learnings

pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

pub use domain::errors::{EngineError, EngineResult};
pub use domain::models::{EngineConfig, ModelTier, Task, TaskStatus};
pub use services::grind::{GrindSession, SessionSummary};
