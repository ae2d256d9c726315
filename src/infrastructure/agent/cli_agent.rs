//! External agent CLI client.
//!
//! Spawns the agent binary as a subprocess in the task's worktree and
//! translates its newline-delimited JSON event stream into typed
//! [`AgentEvent`]s. Rate-limit errors are recognised here so the worker
//! can hand reset headers to the governor.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::AgentConfig;
use crate::domain::ports::{AgentClient, AgentEvent, AgentRequest, TokenUsage};

/// Agent client backed by a Claude-Code-style CLI binary.
pub struct CliAgentClient {
    config: AgentConfig,
}

impl CliAgentClient {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    fn build_args(&self, request: &AgentRequest) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--max-turns".to_string(),
            request.max_turns.to_string(),
            "--model".to_string(),
            request.tier.model_alias().to_string(),
            "--permission-mode".to_string(),
            request.permission_mode.clone(),
        ];
        args.extend(self.config.extra_flags.clone());
        args.push("-p".to_string());
        args.push(request.prompt.clone());
        args
    }

    /// Map one stream line to an event. Unparseable non-empty lines are
    /// surfaced as plain text.
    fn parse_line(line: &str) -> Option<AgentEvent> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }

        let Ok(json) = serde_json::from_str::<Value>(trimmed) else {
            return Some(AgentEvent::Text {
                content: trimmed.to_string(),
            });
        };

        match json.get("type").and_then(Value::as_str) {
            Some("assistant") => extract_text(&json).map(|content| AgentEvent::Text { content }),
            Some("usage") => Some(AgentEvent::Usage {
                usage: extract_usage(&json),
            }),
            Some("result") => {
                let usage = json.get("usage").map(extract_usage).unwrap_or_default();
                let result = json
                    .get("result")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if json
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
                {
                    let message = if result.is_empty() {
                        "agent reported an error result".to_string()
                    } else {
                        result
                    };
                    Some(classify_error(&message, &json))
                } else {
                    Some(AgentEvent::Completed { result, usage })
                }
            }
            Some("error") => {
                let message = json
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown agent error")
                    .to_string();
                Some(classify_error(&message, &json))
            }
            _ => None,
        }
    }
}

fn extract_text(json: &Value) -> Option<String> {
    // Either a flat {"content": "..."} or the nested message/content form.
    if let Some(content) = json.get("content").and_then(Value::as_str) {
        return Some(content.to_string());
    }
    let blocks = json.get("message")?.get("content")?.as_array()?;
    let text: String = blocks
        .iter()
        .filter_map(|b| b.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("");
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn extract_usage(json: &Value) -> TokenUsage {
    let source = json.get("usage").unwrap_or(json);
    let get = |key: &str| source.get(key).and_then(Value::as_u64).unwrap_or(0);
    TokenUsage {
        input_tokens: get("input_tokens"),
        output_tokens: get("output_tokens"),
        cache_read_tokens: get("cache_read_input_tokens"),
        cache_creation_tokens: get("cache_creation_input_tokens"),
    }
}

/// Distinguish 429-like rate-limit signals from other errors, carrying any
/// reset headers along.
fn classify_error(message: &str, json: &Value) -> AgentEvent {
    let lower = message.to_lowercase();
    let is_rate_limit = lower.contains("429")
        || lower.contains("rate limit")
        || lower.contains("rate_limit")
        || lower.contains("overloaded");

    if is_rate_limit {
        let mut headers = HashMap::new();
        if let Some(map) = json.get("headers").and_then(Value::as_object) {
            for (k, v) in map {
                if let Some(v) = v.as_str() {
                    headers.insert(k.to_lowercase(), v.to_string());
                }
            }
        }
        AgentEvent::RateLimited {
            message: message.to_string(),
            headers,
        }
    } else {
        AgentEvent::Error {
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl AgentClient for CliAgentClient {
    fn name(&self) -> &'static str {
        "cli"
    }

    async fn invoke(&self, request: AgentRequest) -> EngineResult<mpsc::Receiver<AgentEvent>> {
        let args = self.build_args(&request);

        debug!(
            task_id = %request.task_id,
            tier = %request.tier,
            workdir = %request.workdir.display(),
            "spawning agent"
        );

        let mut child = Command::new(&self.config.binary_path)
            .args(&args)
            .current_dir(&request.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Agent(format!("failed to spawn agent: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Agent("failed to capture agent stdout".to_string()))?;

        let (tx, rx) = mpsc::channel(100);
        let task_id = request.task_id.clone();

        tokio::spawn(async move {
            let reader = BufReader::new(stdout);
            let mut lines = reader.lines();
            let mut accumulated = String::new();
            let mut usage = TokenUsage::default();
            let mut terminal_sent = false;

            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(event) = CliAgentClient::parse_line(&line) {
                    match &event {
                        AgentEvent::Text { content } => {
                            accumulated.push_str(content);
                            accumulated.push('\n');
                        }
                        AgentEvent::Usage { usage: turn } => usage.add(*turn),
                        AgentEvent::Completed { .. }
                        | AgentEvent::RateLimited { .. }
                        | AgentEvent::Error { .. } => terminal_sent = true,
                    }
                    if tx.send(event).await.is_err() {
                        // Receiver dropped; abandon the invocation.
                        return;
                    }
                    if terminal_sent {
                        break;
                    }
                }
            }

            let status = child.wait().await;

            if !terminal_sent {
                // Stream ended without a result line. Exit status decides.
                let event = match status {
                    Ok(s) if s.success() => AgentEvent::Completed {
                        result: accumulated.trim().to_string(),
                        usage,
                    },
                    Ok(s) => AgentEvent::Error {
                        message: format!("agent exited with status {s}"),
                    },
                    Err(e) => AgentEvent::Error {
                        message: format!("agent wait failed: {e}"),
                    },
                };
                if tx.send(event).await.is_err() {
                    warn!(task_id = %task_id, "agent result dropped: receiver gone");
                }
            }
        });

        Ok(rx)
    }
}
