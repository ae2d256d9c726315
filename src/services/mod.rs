//! Engine services: the scheduler, worker pool, merge queue, governor,
//! task store, and their supporting pieces.

pub mod governor;
pub mod grind;
pub mod merge_queue;
pub mod metrics;
pub mod sanitizer;
pub mod scheduler;
pub mod task_store;
pub mod verify;
pub mod worker;

pub use governor::{GovernorVerdict, RateLimitGovernor, UsageSummary};
pub use grind::{GrindSession, SessionSummary};
pub use merge_queue::{MergeFixer, MergeQueue, MergeQueueConfig};
pub use metrics::{LiveMetrics, MetricsSink, TaskMetricRecord};
pub use sanitizer::{ContentSanitizer, SanitizedContent};
pub use scheduler::{OpusBudget, Scheduler, SchedulerConfig};
pub use task_store::TaskStore;
pub use verify::{Verifier, VerifyResult};
pub use worker::{Worker, WorkerConfig, WorkerDeps, WorkerOutcome};
