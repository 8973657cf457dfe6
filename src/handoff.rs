use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::audit::AuditLog;
use crate::context::{ResolvedAgentConfig, RuntimeContext, resolve};
use crate::definition::WorkflowDefinition;
use crate::error::WorkflowError;
use crate::reasoning::Message;
use crate::schema::validate_against_schema;
use crate::session::AgentSession;
use crate::tools::ToolRegistry;

/// Argument key a reasoning service may set on a handoff call to override
/// the origin agent's configured filter.
pub const CONTEXT_FILTER_ARG: &str = "context_filter";

// ---------------------------------------------------------------------------
// Context filters
// ---------------------------------------------------------------------------

/// Decides which part of the origin history is forwarded to the target.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextFilter {
    #[default]
    All,
    None,
    LastN(usize),
    StripToolMessages,
}

impl ContextFilter {
    pub fn apply(&self, history: &[Message]) -> Vec<Message> {
        match self {
            ContextFilter::All => history.to_vec(),
            ContextFilter::None => Vec::new(),
            ContextFilter::LastN(n) => {
                let tail = &history[history.len().saturating_sub(*n)..];
                // A tool result must not lead the window once its call was cut off.
                let start = tail
                    .iter()
                    .position(|message| !matches!(message, Message::Tool { .. }))
                    .unwrap_or(tail.len());
                tail[start..].to_vec()
            }
            ContextFilter::StripToolMessages => history
                .iter()
                .filter(|message| !message.is_tool_traffic())
                .map(|message| match message {
                    Message::Assistant { content, .. } => Message::Assistant {
                        content: content.clone(),
                        tool_calls: Vec::new(),
                    },
                    other => other.clone(),
                })
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Requests and hooks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandoffRequest {
    pub origin_session: String,
    pub from_agent: String,
    pub target: String,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<ContextFilter>,
}

impl HandoffRequest {
    /// Splits the filter override out of the call arguments; the rest is payload.
    pub fn from_call(origin_session: &str, from_agent: &str, target: &str, args: &Value) -> Self {
        let mut payload = match args {
            Value::Object(_) => args.clone(),
            Value::Null => json!({}),
            other => json!({ "value": other }),
        };
        let filter = payload
            .as_object_mut()
            .and_then(|map| map.remove(CONTEXT_FILTER_ARG))
            .and_then(|raw| match serde_json::from_value::<ContextFilter>(raw) {
                Ok(filter) => Some(filter),
                Err(err) => {
                    tracing::warn!(
                        target_agent = %target,
                        error = %err,
                        "Ignoring malformed context_filter on handoff"
                    );
                    None
                }
            });

        Self {
            origin_session: origin_session.to_string(),
            from_agent: from_agent.to_string(),
            target: target.to_string(),
            payload,
            filter,
        }
    }
}

/// Side effect invoked after a handoff is validated and before the target
/// session is activated.
#[async_trait]
pub trait HandoffHook: Send + Sync {
    async fn before_activation(
        &self,
        run_id: &str,
        request: &HandoffRequest,
        target: &ResolvedAgentConfig,
    );
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct HandoffRouter {
    hooks: Vec<Arc<dyn HandoffHook>>,
    /// Filters forced for specific targets, taking precedence over everything else.
    target_filters: HashMap<String, ContextFilter>,
    audit: AuditLog,
}

impl HandoffRouter {
    pub fn new(audit: AuditLog) -> Self {
        Self {
            hooks: Vec::new(),
            target_filters: HashMap::new(),
            audit,
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn HandoffHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn with_target_filter(mut self, target: impl Into<String>, filter: ContextFilter) -> Self {
        self.target_filters.insert(target.into(), filter);
        self
    }

    /// Validates the transition and builds the target session. The origin
    /// session is left untouched; the caller marks it handed off.
    #[allow(clippy::too_many_arguments)]
    pub async fn route(
        &self,
        run_id: &str,
        definition: &WorkflowDefinition,
        origin: &AgentSession,
        request: &HandoffRequest,
        ctx: &RuntimeContext,
        registry: &ToolRegistry,
        new_session_id: String,
    ) -> Result<AgentSession, WorkflowError> {
        if let Err(err) = self.validate(definition, request) {
            tracing::warn!(
                run_id = %run_id,
                from = %request.from_agent,
                to = %request.target,
                error = %err,
                "Handoff rejected"
            );
            self.audit.record(
                run_id,
                "handoff.rejected",
                json!({
                    "from": request.from_agent,
                    "to": request.target,
                    "origin_session": request.origin_session,
                    "reason": err.to_string()
                }),
            );
            return Err(err);
        }

        let filter = self
            .target_filters
            .get(&request.target)
            .cloned()
            .or_else(|| request.filter.clone())
            .unwrap_or_else(|| origin.config.handoff_filter.clone());
        let mut history = filter.apply(&origin.history);
        history.push(Message::Handoff {
            from: request.from_agent.clone(),
            to: request.target.clone(),
            payload: request.payload.clone(),
        });

        let Some(target) = definition.agent(&request.target) else {
            return Err(WorkflowError::Routing(format!(
                "handoff target '{}' is not a defined agent",
                request.target
            )));
        };
        let config = resolve(target, ctx, registry);

        for hook in &self.hooks {
            hook.before_activation(run_id, request, &config).await;
        }

        tracing::info!(
            run_id = %run_id,
            from = %request.from_agent,
            to = %request.target,
            forwarded = history.len(),
            "Handoff routed"
        );
        self.audit.record(
            run_id,
            "handoff.routed",
            json!({
                "from": request.from_agent,
                "to": request.target,
                "origin_session": request.origin_session,
                "new_session": new_session_id,
                "forwarded_messages": history.len(),
                "payload": request.payload
            }),
        );

        Ok(AgentSession::new(new_session_id, config, history))
    }

    fn validate(
        &self,
        definition: &WorkflowDefinition,
        request: &HandoffRequest,
    ) -> Result<(), WorkflowError> {
        let Some(target) = definition.agent(&request.target) else {
            return Err(WorkflowError::Routing(format!(
                "handoff target '{}' is not a defined agent",
                request.target
            )));
        };

        let declared = definition
            .agent(&request.from_agent)
            .is_some_and(|origin| origin.declares_handoff(&request.target));
        if !declared {
            return Err(WorkflowError::Routing(format!(
                "agent '{}' does not declare a handoff to '{}'",
                request.from_agent, request.target
            )));
        }

        if let Some(schema) = &target.handoff_input_schema
            && let Err(errors) = validate_against_schema(schema, &request.payload)
        {
            return Err(WorkflowError::Routing(format!(
                "handoff payload for '{}' failed schema validation: {}",
                request.target,
                errors.join("; ")
            )));
        }

        Ok(())
    }
}
