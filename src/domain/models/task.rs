//! Task domain model.
//!
//! Tasks are the unit of work the engine drives to completion. They carry
//! a priority, optional dependency and conflict lists, and an append-only
//! attempt history. The persisted field names are stable (camelCase) and
//! shared with the on-disk task store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a task in the backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task is waiting to be scheduled
    Pending,
    /// Task has exactly one active worker
    InProgress,
    /// Task completed and its branch merged
    Complete,
    /// Task failed after exhausting attempts
    Failed,
    /// Task cannot run (unmet or unknown dependency)
    Blocked,
    /// Task was canceled externally
    Canceled,
    /// Task is no longer relevant
    Obsolete,
    /// Task was split into child tasks; the parent never executes
    Decomposed,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Canceled => "canceled",
            Self::Obsolete => "obsolete",
            Self::Decomposed => "decomposed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "complete" | "completed" => Some(Self::Complete),
            "failed" => Some(Self::Failed),
            "blocked" => Some(Self::Blocked),
            "canceled" | "cancelled" => Some(Self::Canceled),
            "obsolete" => Some(Self::Obsolete),
            "decomposed" => Some(Self::Decomposed),
        _ => None,
        }
    }

    /// Terminal states stay in the store for analytics; the engine never
    /// schedules them again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete | Self::Canceled | Self::Obsolete | Self::Decomposed
        )
    }

    /// Valid transitions from this status.
    pub fn valid_transitions(&self) -> &'static [TaskStatus] {
        match self {
            Self::Pending => &[
                Self::InProgress,
                Self::Blocked,
                Self::Canceled,
                Self::Obsolete,
                Self::Decomposed,
                Self::Complete, // git reconciliation can complete unstarted tasks
            ],
            Self::InProgress => &[
                Self::Complete,
                Self::Failed,
                Self::Canceled,
                Self::Decomposed,
                Self::Pending, // drain or crash recovery
            ],
            Self::Blocked => &[Self::Pending, Self::Canceled, Self::Obsolete],
            Self::Failed => &[Self::Pending], // re-schedule after main advances
            Self::Complete | Self::Canceled | Self::Obsolete | Self::Decomposed => &[],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

/// Categorical capacity label for LLM models.
///
/// T0 is the small/cheap tier, T2 the large/expensive one. Ordering is
/// meaningful: escalation steps strictly upward.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum ModelTier {
    T0,
    T1,
    T2,
}

impl Default for ModelTier {
    fn default() -> Self {
        Self::T1
    }
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::T0 => "T0",
            Self::T1 => "T1",
            Self::T2 => "T2",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "T0" => Some(Self::T0),
            "T1" => Some(Self::T1),
            "T2" => Some(Self::T2),
            _ => None,
        }
    }

    /// Model alias handed to the agent CLI for this tier.
    pub fn model_alias(&self) -> &'static str {
        match self {
            Self::T0 => "haiku",
            Self::T1 => "sonnet",
            Self::T2 => "opus",
        }
    }

    /// The next tier up, if any.
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::T0 => Some(Self::T1),
            Self::T1 => Some(Self::T2),
            Self::T2 => None,
        }
    }

    pub fn all() -> [Self; 3] {
        [Self::T0, Self::T1, Self::T2]
    }
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single attempt (one LLM call plus its verification/review).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    VerificationFailed,
    ReviewFailed,
    RateLimited,
    Error,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::VerificationFailed => "verification_failed",
            Self::ReviewFailed => "review_failed",
            Self::RateLimited => "rate_limited",
            Self::Error => "error",
        }
    }
}

/// One entry in a task's append-only attempt history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    /// 1-based sequence number within the task
    pub sequence: u32,
    /// Model tier used for this attempt
    pub tier: ModelTier,
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration of the attempt in milliseconds
    pub duration_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub outcome: AttemptOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set when this attempt triggered a step up to the next tier
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub escalated: bool,
}

/// Complexity classification computed during the analyzing phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Trivial,
    Simple,
    Standard,
    Complex,
    Critical,
}

impl Default for Complexity {
    fn default() -> Self {
        Self::Standard
    }
}

/// Rich ticket content attached to a task by an external intake path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub test_plan: String,
    #[serde(default)]
    pub implementation_notes: String,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub source: String,
}

/// A unit of work in the backlog.
///
/// Created by an external intake path and mutated only through the task
/// store's typed operations. Never deleted by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Stable identifier
    pub id: String,
    /// What the task should accomplish
    pub objective: String,
    #[serde(default)]
    pub status: TaskStatus,
    /// 1–1000, lower is higher priority
    pub priority: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Ids that must be complete before this task runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Vec<String>>,
    /// Ids that must not run concurrently with this task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflicts: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicted_files: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computed_packages: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended_model: Option<ModelTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<Vec<AttemptRecord>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket: Option<Ticket>,
}

impl Task {
    pub const DEFAULT_PRIORITY: u32 = 500;

    /// Create a new pending task.
    pub fn new(id: impl Into<String>, objective: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            objective: objective.into(),
            status: TaskStatus::Pending,
            priority: Self::DEFAULT_PRIORITY,
            created_at: Utc::now(),
            completed_at: None,
            depends_on: None,
            conflicts: None,
            tags: None,
            predicted_files: None,
            computed_packages: None,
            risk_score: None,
            error: None,
            parent_task_id: None,
            recommended_model: None,
            attempts: None,
            ticket: None,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependency(mut self, task_id: impl Into<String>) -> Self {
        let task_id = task_id.into();
        if task_id != self.id {
            let deps = self.depends_on.get_or_insert_with(Vec::new);
            if !deps.contains(&task_id) {
                deps.push(task_id);
            }
        }
        self
    }

    pub fn with_conflict(mut self, task_id: impl Into<String>) -> Self {
        self.conflicts
            .get_or_insert_with(Vec::new)
            .push(task_id.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.get_or_insert_with(Vec::new).push(tag.into());
        self
    }

    pub fn with_predicted_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.predicted_files = Some(files.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_recommended_model(mut self, tier: ModelTier) -> Self {
        self.recommended_model = Some(tier);
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_task_id = Some(parent_id.into());
        self
    }

    pub fn with_ticket(mut self, ticket: Ticket) -> Self {
        self.ticket = Some(ticket);
        self
    }

    pub fn can_transition_to(&self, new_status: TaskStatus) -> bool {
        self.status.can_transition_to(new_status)
    }

    /// Transition to a new status, updating the completion timestamp on
    /// terminal-ish outcomes.
    pub fn transition_to(&mut self, new_status: TaskStatus) -> Result<(), String> {
        if !self.can_transition_to(new_status) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.status.as_str(),
                new_status.as_str()
            ));
        }

        self.status = new_status;
        match new_status {
            TaskStatus::Complete
            | TaskStatus::Failed
            | TaskStatus::Canceled
            | TaskStatus::Decomposed => {
                self.completed_at = Some(Utc::now());
            }
            _ => {}
        }
        Ok(())
    }

    /// Append an attempt to the history.
    pub fn push_attempt(&mut self, attempt: AttemptRecord) {
        self.attempts.get_or_insert_with(Vec::new).push(attempt);
    }

    /// Number of attempts made so far.
    pub fn attempt_count(&self) -> usize {
        self.attempts.as_ref().map_or(0, Vec::len)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// A task with a parent is a child of a decomposition; a parent in
    /// `decomposed` status must never itself be executed.
    pub fn is_executable(&self) -> bool {
        self.status == TaskStatus::Pending
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags
            .as_ref()
            .is_some_and(|tags| tags.iter().any(|t| t.eq_ignore_ascii_case(tag)))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("Task id cannot be empty".to_string());
        }
        if self.objective.trim().is_empty() {
            return Err("Task objective cannot be empty".to_string());
        }
        if !(1..=1000).contains(&self.priority) {
            return Err(format!(
                "Task priority must be in 1..=1000, got {}",
                self.priority
            ));
        }
        if self
            .depends_on
            .as_ref()
            .is_some_and(|deps| deps.contains(&self.id))
        {
            return Err("Task cannot depend on itself".to_string());
        }
        Ok(())
    }
}
