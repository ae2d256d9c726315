//! Mock agent client for tests.
//!
//! Scripts a sequence of invocation outcomes per task id; each invocation
//! consumes the next scripted response. Unscripted invocations succeed
//! with a canned result.

use async_trait::async_trait;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::domain::errors::EngineResult;
use crate::domain::ports::{AgentClient, AgentEvent, AgentRequest, TokenUsage};

/// One scripted invocation outcome.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    /// Write the given files into the request's workdir, stream usage,
    /// then complete with this result text
    Success {
        result: String,
        writes: Vec<(String, String)>,
    },
    /// Stream a 429 with these headers
    RateLimited { headers: HashMap<String, String> },
    /// Stream a terminal error
    Error { message: String },
}

impl MockOutcome {
    pub fn success(result: impl Into<String>) -> Self {
        Self::Success {
            result: result.into(),
            writes: Vec::new(),
        }
    }

    /// Success that also edits a file, the way a real agent would.
    pub fn success_with_write(
        result: impl Into<String>,
        path: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::Success {
            result: result.into(),
            writes: vec![(path.into(), content.into())],
        }
    }

    pub fn rate_limited_retry_after(seconds: u64) -> Self {
        let mut headers = HashMap::new();
        headers.insert("retry-after".to_string(), seconds.to_string());
        Self::RateLimited { headers }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Mock agent with per-task scripted outcomes.
pub struct MockAgentClient {
    scripts: Arc<Mutex<HashMap<String, VecDeque<MockOutcome>>>>,
    /// Prompts seen, for assertions on prompt construction
    prompts: Arc<Mutex<Vec<String>>>,
    usage_per_call: TokenUsage,
}

impl Default for MockAgentClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAgentClient {
    pub fn new() -> Self {
        Self {
            scripts: Arc::new(Mutex::new(HashMap::new())),
            prompts: Arc::new(Mutex::new(Vec::new())),
            usage_per_call: TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
                ..Default::default()
            },
        }
    }

    /// Queue outcomes for a task, consumed one per invocation.
    pub async fn script(&self, task_id: &str, outcomes: impl IntoIterator<Item = MockOutcome>) {
        let mut scripts = self.scripts.lock().await;
        scripts
            .entry(task_id.to_string())
            .or_default()
            .extend(outcomes);
    }

    /// All prompts the mock has received, in order.
    pub async fn seen_prompts(&self) -> Vec<String> {
        self.prompts.lock().await.clone()
    }

    pub async fn invocation_count(&self) -> usize {
        self.prompts.lock().await.len()
    }
}

#[async_trait]
impl AgentClient for MockAgentClient {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn invoke(&self, request: AgentRequest) -> EngineResult<mpsc::Receiver<AgentEvent>> {
        self.prompts.lock().await.push(request.prompt.clone());

        let outcome = {
            let mut scripts = self.scripts.lock().await;
            scripts
                .get_mut(&request.task_id)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| MockOutcome::success("Mock task completed."))
        };

        let usage = self.usage_per_call;
        let workdir = request.workdir.clone();
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            match outcome {
                MockOutcome::Success { result, writes } => {
                    for (path, content) in writes {
                        let full = workdir.join(&path);
                        if let Some(parent) = full.parent() {
                            let _ = std::fs::create_dir_all(parent);
                        }
                        let _ = std::fs::write(full, content);
                    }
                    let _ = tx.send(AgentEvent::Usage { usage }).await;
                    let _ = tx
                        .send(AgentEvent::Text {
                            content: result.clone(),
                        })
                        .await;
                    let _ = tx.send(AgentEvent::Completed { result, usage }).await;
                }
                MockOutcome::RateLimited { headers } => {
                    let _ = tx
                        .send(AgentEvent::RateLimited {
                            message: "429 rate limit exceeded".to_string(),
                            headers,
                        })
                        .await;
                }
                MockOutcome::Error { message } => {
                    let _ = tx.send(AgentEvent::Error { message }).await;
                }
            }
        });

        Ok(rx)
    }
}
