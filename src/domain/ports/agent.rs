//! LLM agent client port.
//!
//! The engine never talks to a model directly; it invokes an external
//! agent process and consumes a typed event stream. Implementations live
//! in `infrastructure::agent`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::mpsc;

use crate::domain::errors::EngineResult;
use crate::domain::models::ModelTier;

/// One agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub task_id: String,
    pub tier: ModelTier,
    pub prompt: String,
    /// Working directory the agent operates in (the task's worktree)
    pub workdir: PathBuf,
    pub max_turns: u32,
    pub permission_mode: String,
}

impl AgentRequest {
    pub fn new(
        task_id: impl Into<String>,
        tier: ModelTier,
        prompt: impl Into<String>,
        workdir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            tier,
            prompt: prompt.into(),
            workdir: workdir.into(),
            max_turns: 25,
            permission_mode: "acceptEdits".to_string(),
        }
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_permission_mode(mut self, mode: impl Into<String>) -> Self {
        self.permission_mode = mode.into();
        self
    }
}

/// Token usage reported by the agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_creation_tokens += other.cache_creation_tokens;
    }
}

/// Events yielded by an agent invocation, in stream order.
///
/// The stream always ends with exactly one of `Completed`, `RateLimited`,
/// or `Error`.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// Incremental assistant text for streaming display
    Text { content: String },
    /// Interim token usage for one turn
    Usage { usage: TokenUsage },
    /// Terminal: the agent finished and produced a result
    Completed { result: String, usage: TokenUsage },
    /// Terminal: a 429-like rate-limit signal, with any reset headers the
    /// transport exposed
    RateLimited {
        message: String,
        headers: HashMap<String, String>,
    },
    /// Terminal: any other failure
    Error { message: String },
}

/// Client for an external LLM agent process.
#[async_trait]
pub trait AgentClient: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start an invocation and return its event stream.
    ///
    /// The returned receiver yields [`AgentEvent`]s until a terminal event;
    /// dropping it abandons the invocation.
    async fn invoke(&self, request: AgentRequest) -> EngineResult<mpsc::Receiver<AgentEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_accumulation() {
        let mut total = TokenUsage::default();
        total.add(TokenUsage {
            input_tokens: 100,
            output_tokens: 50,
            ..Default::default()
        });
        total.add(TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
            ..Default::default()
        });
        assert_eq!(total.input_tokens, 110);
        assert_eq!(total.output_tokens, 55);
        assert_eq!(total.total(), 165);
    }

    #[test]
    fn test_request_builder() {
        let req = AgentRequest::new("T1", ModelTier::T1, "do it", "/tmp/wt")
            .with_max_turns(10)
            .with_permission_mode("plan");
        assert_eq!(req.max_turns, 10);
        assert_eq!(req.permission_mode, "plan");
    }
}
