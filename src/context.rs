//! Per-activation resolution of an agent definition against runtime state.
//!
//! `resolve` is pure: the same definition, context and registry always yield
//! the same `ResolvedAgentConfig`.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::definition::AgentDefinition;
use crate::handoff::ContextFilter;
use crate::tools::ToolRegistry;

/// Values known only when a run starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeContext {
    /// Substituted into `{{key}}` placeholders in agent instructions.
    pub vars: BTreeMap<String, String>,
    /// Tool patterns denied for every agent of the run.
    pub deny_tools: Vec<String>,
    /// Used when an agent names no model.
    pub default_model: Option<String>,
}

impl RuntimeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    pub fn with_deny_tools(mut self, patterns: Vec<String>) -> Self {
        self.deny_tools = patterns;
        self
    }

    pub fn with_default_model(mut self, model: Option<String>) -> Self {
        self.default_model = model;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedAgentConfig {
    pub name: String,
    pub instructions: String,
    pub model: Option<String>,
    /// Concrete registered tool names, in declaration order.
    pub tools: Vec<String>,
    pub handoffs: Vec<String>,
    pub guardrails: Vec<String>,
    pub max_turns: Option<u32>,
    pub handoff_filter: ContextFilter,
}

pub fn resolve(
    agent: &AgentDefinition,
    ctx: &RuntimeContext,
    registry: &ToolRegistry,
) -> ResolvedAgentConfig {
    let mut deny = agent.deny_tools.clone();
    deny.extend(ctx.deny_tools.iter().cloned());

    ResolvedAgentConfig {
        name: agent.name.clone(),
        instructions: render_template(&agent.instructions, &ctx.vars),
        model: agent.model.clone().or_else(|| ctx.default_model.clone()),
        tools: registry.resolve_entries(&agent.tools, &deny),
        handoffs: agent.handoffs.clone(),
        guardrails: agent.guardrails.clone(),
        max_turns: agent.max_turns,
        handoff_filter: agent.handoff_filter.clone().unwrap_or_default(),
    }
}

/// Replaces `{{key}}` placeholders; unknown keys are left untouched.
pub fn render_template(template: &str, vars: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        let key = rest[start + 2..start + 2 + len].trim();
        out.push_str(&rest[..start]);
        match vars.get(key) {
            Some(value) => out.push_str(value),
            None => out.push_str(&rest[start..start + len + 4]),
        }
        rest = &rest[start + len + 4..];
    }

    out.push_str(rest);
    out
}
