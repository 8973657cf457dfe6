use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::audit::AuditLog;
use crate::error::WorkflowError;
use crate::tools::ToolDescriptor;

/// Synthetic tool-name prefix used to advertise handoff targets.
pub const HANDOFF_TOOL_PREFIX: &str = "transfer_to_";

pub fn handoff_tool_name(agent: &str) -> String {
    format!("{HANDOFF_TOOL_PREFIX}{agent}")
}

pub fn handoff_target(tool_name: &str) -> Option<&str> {
    tool_name
        .strip_prefix(HANDOFF_TOOL_PREFIX)
        .filter(|target| !target.is_empty())
}

// ---------------------------------------------------------------------------
// Conversation model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    User {
        content: String,
    },
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCallRequest>,
    },
    Tool {
        call_id: String,
        name: String,
        success: bool,
        content: Value,
    },
    Handoff {
        from: String,
        to: String,
        payload: Value,
    },
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Message::User {
            content: content.into(),
        }
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Message::Assistant {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn is_tool_traffic(&self) -> bool {
        match self {
            Message::Tool { .. } => true,
            Message::Assistant {
                content,
                tool_calls,
            } => content.is_none() && !tool_calls.is_empty(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReasoningRequest {
    pub agent: String,
    pub model: Option<String>,
    pub instructions: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReasoningResponse {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRequest>,
}

impl ReasoningResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_calls(calls: Vec<ToolCallRequest>) -> Self {
        Self {
            text: None,
            tool_calls: calls,
        }
    }

    pub fn tool_call(id: &str, name: &str, arguments: Value) -> Self {
        Self::tool_calls(vec![ToolCallRequest::new(id, name, arguments)])
    }

    pub fn handoff(target: &str, payload: Value) -> Self {
        Self::tool_call(
            &format!("handoff-{target}"),
            &handoff_tool_name(target),
            payload,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ReasoningError {
    pub message: String,
    pub retryable: bool,
}

impl ReasoningError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Single-call adapter to a language-model completion service.
#[async_trait]
pub trait ReasoningClient: Send + Sync {
    async fn complete(&self, request: &ReasoningRequest)
    -> Result<ReasoningResponse, ReasoningError>;
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per reasoning call, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let scaled = self.initial_backoff.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        Duration::from_secs_f64(scaled.min(self.max_backoff.as_secs_f64()))
    }
}

/// Reasoning client wrapped with bounded retry, cancellation and audit.
#[derive(Clone)]
pub struct ReasoningCaller {
    client: Arc<dyn ReasoningClient>,
    retry: RetryPolicy,
    audit: AuditLog,
}

impl ReasoningCaller {
    pub fn new(client: Arc<dyn ReasoningClient>, retry: RetryPolicy, audit: AuditLog) -> Self {
        Self {
            client,
            retry,
            audit,
        }
    }

    pub async fn call(
        &self,
        run_id: &str,
        request: &ReasoningRequest,
        cancel: &CancellationToken,
    ) -> Result<ReasoningResponse, WorkflowError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(WorkflowError::Cancelled),
                result = self.client.complete(request) => result,
            };

            let err = match result {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };

            if !err.retryable || attempt >= max_attempts {
                tracing::warn!(
                    agent = %request.agent,
                    attempt = attempt,
                    error = %err.message,
                    "Reasoning call failed"
                );
                self.audit.record(
                    run_id,
                    "reasoning.failed",
                    json!({
                        "agent": request.agent,
                        "attempt": attempt,
                        "retryable": err.retryable,
                        "error": err.message
                    }),
                );
                return Err(WorkflowError::ReasoningService {
                    message: format!("{} (after {attempt} attempt(s))", err.message),
                    retryable: err.retryable,
                });
            }

            let backoff = self.retry.backoff_for(attempt);
            tracing::warn!(
                agent = %request.agent,
                attempt = attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %err.message,
                "Retrying reasoning call"
            );
            self.audit.record(
                run_id,
                "reasoning.retry",
                json!({
                    "agent": request.agent,
                    "attempt": attempt,
                    "backoff_ms": backoff.as_millis() as u64,
                    "error": err.message
                }),
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(WorkflowError::Cancelled),
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Scripted client
// ---------------------------------------------------------------------------

type Scripted = Result<ReasoningResponse, ReasoningError>;

#[derive(Debug, Default)]
struct Script {
    shared: VecDeque<Scripted>,
    per_agent: HashMap<String, VecDeque<Scripted>>,
    requests: Vec<ReasoningRequest>,
}

/// Deterministic client that replays queued responses. Per-agent queues take
/// precedence over the shared queue; an exhausted script fails fatally.
#[derive(Debug, Default, Clone)]
pub struct ScriptedReasoningClient {
    script: Arc<Mutex<Script>>,
}

impl ScriptedReasoningClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, response: ReasoningResponse) -> &Self {
        self.lock().shared.push_back(Ok(response));
        self
    }

    pub fn push_error(&self, error: ReasoningError) -> &Self {
        self.lock().shared.push_back(Err(error));
        self
    }

    pub fn push_for(&self, agent: &str, response: ReasoningResponse) -> &Self {
        self.lock()
            .per_agent
            .entry(agent.to_string())
            .or_default()
            .push_back(Ok(response));
        self
    }

    pub fn calls(&self) -> usize {
        self.lock().requests.len()
    }

    pub fn requests(&self) -> Vec<ReasoningRequest> {
        self.lock().requests.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ReasoningClient for ScriptedReasoningClient {
    async fn complete(
        &self,
        request: &ReasoningRequest,
    ) -> Result<ReasoningResponse, ReasoningError> {
        let mut script = self.lock();
        script.requests.push(request.clone());
        let next = match script.per_agent.get_mut(&request.agent) {
            Some(queue) if !queue.is_empty() => queue.pop_front(),
            _ => script.shared.pop_front(),
        };
        next.unwrap_or_else(|| {
            Err(ReasoningError::fatal(format!(
                "no scripted response left for agent '{}'",
                request.agent
            )))
        })
    }
}
