//! Domain models for the undercity engine.

pub mod config;
pub mod queue;
pub mod retrieval;
pub mod task;
pub mod worktree;

pub use config::{
    AgentConfig, EngineConfig, GovernorConfig, GrindConfig, IndexConfig, LogConfig,
    TierCeilings, TimeoutConfig, STATE_DIR,
};
pub use queue::{MergeItem, MergeItemStatus, QueueConflict};
pub use retrieval::{Chunk, Document, SearchHit, EMBEDDING_DIM};
pub use task::{
    AttemptOutcome, AttemptRecord, Complexity, ModelTier, Task, TaskStatus, Ticket,
};
pub use worktree::{branch_for_task, path_for_task, Worktree, BRANCH_PREFIX};
