//! Research ROI policy port.
//!
//! Whether a research-flavoured task is still worth another research
//! cycle is an external judgement. The engine only consumes one of four
//! enumerated outcomes; it never re-derives the decision itself.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::domain::models::Task;

/// Enumerated verdicts a research policy may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResearchOutcome {
    /// Run the task as-is
    Proceed,
    /// Research on this topic has saturated; convert to an implementation
    /// child task
    Implement,
    /// Split into narrower research tasks
    Decompose,
    /// Drop the task entirely
    Skip,
}

/// External policy deciding the fate of research tasks.
pub trait ResearchPolicy: Send + Sync {
    fn evaluate(&self, task: &Task) -> ResearchOutcome;

    /// Record the yield of a finished research cycle for a topic.
    fn record_cycle(&self, topic: &str, proposals: u32);
}

/// Default policy: a topic saturates after three consecutive low-yield
/// cycles (fewer than two proposals each).
#[derive(Default)]
pub struct SaturationPolicy {
    low_yield_streaks: Mutex<HashMap<String, u32>>,
}

impl SaturationPolicy {
    pub const SATURATION_CYCLES: u32 = 3;
    pub const LOW_YIELD_PROPOSALS: u32 = 2;

    pub fn new() -> Self {
        Self::default()
    }

    fn topic_of(task: &Task) -> String {
        // Topic key is the first few objective keywords, lowercased.
        task.objective
            .split_whitespace()
            .filter(|w| w.len() > 3)
            .take(4)
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl ResearchPolicy for SaturationPolicy {
    fn evaluate(&self, task: &Task) -> ResearchOutcome {
        if !task.has_tag("research") {
            return ResearchOutcome::Proceed;
        }
        let streaks = self.low_yield_streaks.lock().unwrap_or_else(|e| e.into_inner());
        let streak = streaks.get(&Self::topic_of(task)).copied().unwrap_or(0);
        if streak >= Self::SATURATION_CYCLES {
            ResearchOutcome::Implement
        } else {
            ResearchOutcome::Proceed
        }
    }

    fn record_cycle(&self, topic: &str, proposals: u32) {
        let mut streaks = self.low_yield_streaks.lock().unwrap_or_else(|e| e.into_inner());
        let entry = streaks.entry(topic.to_lowercase()).or_insert(0);
        if proposals < Self::LOW_YIELD_PROPOSALS {
            *entry += 1;
        } else {
            *entry = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_research_task_proceeds() {
        let policy = SaturationPolicy::new();
        let task = Task::new("T1", "add helper in src/util.ts");
        assert_eq!(policy.evaluate(&task), ResearchOutcome::Proceed);
    }

    #[test]
    fn test_research_saturates_after_three_low_yield_cycles() {
        let policy = SaturationPolicy::new();
        let task = Task::new("T1", "investigate flaky websocket reconnects").with_tag("research");
        let topic = SaturationPolicy::topic_of(&task);

        assert_eq!(policy.evaluate(&task), ResearchOutcome::Proceed);
        for _ in 0..3 {
            policy.record_cycle(&topic, 0);
        }
        assert_eq!(policy.evaluate(&task), ResearchOutcome::Implement);
    }

    #[test]
    fn test_productive_cycle_resets_streak() {
        let policy = SaturationPolicy::new();
        let task = Task::new("T1", "investigate flaky websocket reconnects").with_tag("research");
        let topic = SaturationPolicy::topic_of(&task);

        policy.record_cycle(&topic, 0);
        policy.record_cycle(&topic, 0);
        policy.record_cycle(&topic, 5); // productive, resets
        policy.record_cycle(&topic, 0);
        assert_eq!(policy.evaluate(&task), ResearchOutcome::Proceed);
    }
}
