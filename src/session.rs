use std::fmt;

use serde::Serialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::context::ResolvedAgentConfig;
use crate::error::WorkflowError;
use crate::handoff::{CONTEXT_FILTER_ARG, HandoffRequest};
use crate::reasoning::{
    Message, ReasoningCaller, ReasoningRequest, ToolCallRequest, handoff_target,
    handoff_tool_name,
};
use crate::tools::{ToolCall, ToolDescriptor, ToolRegistry, ToolResult};

// ---------------------------------------------------------------------------
// Status state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Active,
    AwaitingToolResults,
    AwaitingApproval,
    HandedOff,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::HandedOff | SessionStatus::Completed | SessionStatus::Failed
        )
    }

    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Failed) => true,
            (Pending, Active) => true,
            (Active, AwaitingToolResults | AwaitingApproval | HandedOff | Completed) => true,
            (AwaitingToolResults, Active | AwaitingApproval) => true,
            (AwaitingApproval, Active | AwaitingToolResults) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Active => "active",
            SessionStatus::AwaitingToolResults => "awaiting_tool_results",
            SessionStatus::AwaitingApproval => "awaiting_approval",
            SessionStatus::HandedOff => "handed_off",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        };
        write!(f, "{label}")
    }
}

// ---------------------------------------------------------------------------
// Step outcome
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StepOutcome {
    FinalOutput(String),
    ToolCallsPending(Vec<ToolCall>),
    HandoffRequested(HandoffRequest),
    Error(WorkflowError),
}

/// Per-session entry of a run trace.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionTrace {
    pub session_id: String,
    pub agent: String,
    pub status: SessionStatus,
    pub turns: u32,
    pub messages: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handed_off_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One agent's live execution context within a run.
#[derive(Debug, Clone)]
pub struct AgentSession {
    pub id: String,
    pub config: ResolvedAgentConfig,
    pub history: Vec<Message>,
    turns: u32,
    status: SessionStatus,
    output: Option<String>,
    handed_off_to: Option<String>,
    failure: Option<String>,
}

impl AgentSession {
    pub fn new(id: impl Into<String>, config: ResolvedAgentConfig, history: Vec<Message>) -> Self {
        Self {
            id: id.into(),
            config,
            history,
            turns: 0,
            status: SessionStatus::Pending,
            output: None,
            handed_off_to: None,
            failure: None,
        }
    }

    pub fn agent(&self) -> &str {
        &self.config.name
    }

    pub fn turns(&self) -> u32 {
        self.turns
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn output(&self) -> Option<&str> {
        self.output.as_deref()
    }

    fn transition(&mut self, next: SessionStatus) -> Result<(), WorkflowError> {
        if !self.status.can_transition_to(next) {
            return Err(WorkflowError::InvalidTransition {
                session_id: self.id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        tracing::debug!(
            session_id = %self.id,
            agent = %self.config.name,
            from = %self.status,
            to = %next,
            "Session transition"
        );
        self.status = next;
        Ok(())
    }

    /// Catalog sent with each reasoning call: registered tools first, then one
    /// synthetic transfer tool per declared handoff.
    pub fn tool_catalog(&self, registry: &ToolRegistry) -> Vec<ToolDescriptor> {
        let mut catalog = registry.catalog(&self.config.tools);
        for target in &self.config.handoffs {
            catalog.push(ToolDescriptor {
                name: handoff_tool_name(target),
                description: format!(
                    "Transfer control of the conversation to agent '{target}'. \
                     Arguments are forwarded as the handoff payload."
                ),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        CONTEXT_FILTER_ARG: {
                            "description": "Optional override of forwarded history: \"all\", \"none\", \"strip_tool_messages\" or {\"last_n\": N}"
                        }
                    }
                }),
            });
        }
        catalog
    }

    /// Fails once the agent's own turn cap is used up.
    pub fn check_turn_limit(&self) -> Result<(), WorkflowError> {
        match self.config.max_turns {
            Some(limit) if self.turns >= limit => Err(WorkflowError::MaxTurnsExceeded {
                limit,
                scope: format!("turns for agent '{}'", self.config.name),
            }),
            _ => Ok(()),
        }
    }

    /// Performs one reasoning call and classifies the response.
    pub async fn step(
        &mut self,
        caller: &ReasoningCaller,
        registry: &ToolRegistry,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        match self.status {
            SessionStatus::Pending => {
                if let Err(err) = self.transition(SessionStatus::Active) {
                    return StepOutcome::Error(err);
                }
            }
            SessionStatus::Active => {}
            other => {
                return StepOutcome::Error(WorkflowError::InvalidTransition {
                    session_id: self.id.clone(),
                    from: other.to_string(),
                    to: SessionStatus::Active.to_string(),
                });
            }
        }

        if let Err(err) = self.check_turn_limit() {
            return StepOutcome::Error(err);
        }
        self.turns += 1;

        let request = ReasoningRequest {
            agent: self.config.name.clone(),
            model: self.config.model.clone(),
            instructions: self.config.instructions.clone(),
            messages: self.history.clone(),
            tools: self.tool_catalog(registry),
        };
        let response = match caller.call(run_id, &request, cancel).await {
            Ok(response) => response,
            Err(err) => return StepOutcome::Error(err),
        };

        if let Some(handoff) = response
            .tool_calls
            .iter()
            .find(|call| handoff_target(&call.name).is_some())
            .cloned()
        {
            return self.classify_handoff(response.text, response.tool_calls.len(), handoff);
        }

        if !response.tool_calls.is_empty() {
            let calls = response
                .tool_calls
                .iter()
                .map(|request| ToolCall {
                    id: request.id.clone(),
                    tool: request.name.clone(),
                    parameters: request.arguments.clone(),
                    session_id: self.id.clone(),
                    needs_approval: registry
                        .get(&request.name)
                        .is_some_and(|tool| tool.needs_approval(&request.arguments)),
                })
                .collect::<Vec<ToolCall>>();
            self.history.push(Message::Assistant {
                content: response.text,
                tool_calls: response.tool_calls,
            });
            if let Err(err) = self.transition(SessionStatus::AwaitingToolResults) {
                return StepOutcome::Error(err);
            }
            return StepOutcome::ToolCallsPending(calls);
        }

        let text = response.text.unwrap_or_default();
        self.history.push(Message::assistant_text(text.clone()));
        StepOutcome::FinalOutput(text)
    }

    fn classify_handoff(
        &mut self,
        text: Option<String>,
        call_count: usize,
        call: ToolCallRequest,
    ) -> StepOutcome {
        let target = handoff_target(&call.name).unwrap_or_default().to_string();
        if call_count > 1 {
            tracing::warn!(
                session_id = %self.id,
                agent = %self.config.name,
                target_agent = %target,
                dropped = call_count - 1,
                "Handoff requested alongside other tool calls; dropping the others"
            );
        }

        let request = HandoffRequest::from_call(&self.id, &self.config.name, &target, &call.arguments);
        self.history.push(Message::Assistant {
            content: text,
            tool_calls: vec![call.clone()],
        });
        self.history.push(Message::Tool {
            call_id: call.id,
            name: call.name,
            success: true,
            content: json!({ "handoff": target }),
        });
        StepOutcome::HandoffRequested(request)
    }

    pub fn await_approval(&mut self) -> Result<(), WorkflowError> {
        self.transition(SessionStatus::AwaitingApproval)
    }

    /// Appends one tool message per result, in call order, and hands control
    /// back to the session.
    pub fn record_tool_results(&mut self, results: &[ToolResult]) -> Result<(), WorkflowError> {
        for result in results {
            let content: Value = result.to_payload();
            self.history.push(Message::Tool {
                call_id: result.call_id.clone(),
                name: result.tool.clone(),
                success: result.success,
                content,
            });
        }
        self.transition(SessionStatus::Active)
    }

    pub fn mark_handed_off(&mut self, target: &str) -> Result<(), WorkflowError> {
        self.transition(SessionStatus::HandedOff)?;
        self.handed_off_to = Some(target.to_string());
        Ok(())
    }

    pub fn complete(&mut self, output: String) -> Result<(), WorkflowError> {
        self.transition(SessionStatus::Completed)?;
        self.output = Some(output);
        Ok(())
    }

    /// Marks the session failed unless it already reached a terminal state.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = SessionStatus::Failed;
        self.failure = Some(reason.into());
    }

    pub fn trace(&self) -> SessionTrace {
        SessionTrace {
            session_id: self.id.clone(),
            agent: self.config.name.clone(),
            status: self.status,
            turns: self.turns,
            messages: self.history.len(),
            output: self.output.clone(),
            handed_off_to: self.handed_off_to.clone(),
            failure: self.failure.clone(),
        }
    }
}
