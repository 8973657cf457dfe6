use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WorkflowError;
use crate::guardrail::GuardrailRegistry;
use crate::handoff::ContextFilter;
use crate::schema::check_schema;
use crate::tool_policy::{is_pattern, matches_wildcard};
use crate::tools::{Tool, ToolRegistry};

pub const DEFAULT_MAX_TURNS: u32 = 10;
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPattern {
    #[default]
    HandoffChain,
    Parallel,
    Sequential,
}

impl WorkflowPattern {
    pub fn label(self) -> &'static str {
        match self {
            WorkflowPattern::HandoffChain => "handoff_chain",
            WorkflowPattern::Parallel => "parallel",
            WorkflowPattern::Sequential => "sequential",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub instructions: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Tool names; `*` wildcards expand against the registry.
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deny_tools: Vec<String>,
    #[serde(default)]
    pub guardrails: Vec<String>,
    /// Declared handoff targets by agent name.
    #[serde(default)]
    pub handoffs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
    /// Schema that handoff payloads targeting this agent must satisfy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handoff_input_schema: Option<Value>,
    /// What this agent forwards when it hands off.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handoff_filter: Option<ContextFilter>,
}

impl AgentDefinition {
    pub fn new(name: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instructions: instructions.into(),
            ..Self::default()
        }
    }

    pub fn with_tools(mut self, tools: &[&str]) -> Self {
        self.tools = tools.iter().map(|tool| tool.to_string()).collect();
        self
    }

    pub fn with_handoffs(mut self, targets: &[&str]) -> Self {
        self.handoffs = targets.iter().map(|target| target.to_string()).collect();
        self
    }

    pub fn with_guardrails(mut self, guardrails: &[&str]) -> Self {
        self.guardrails = guardrails.iter().map(|name| name.to_string()).collect();
        self
    }

    pub fn declares_handoff(&self, target: &str) -> bool {
        self.handoffs.iter().any(|declared| declared == target)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowSettings {
    pub entry_point: String,
    #[serde(default)]
    pub pattern: WorkflowPattern,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Agent order for sequential and parallel patterns.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sequence: Vec<String>,
}

fn default_max_turns() -> u32 {
    DEFAULT_MAX_TURNS
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

/// Immutable description of one workflow. Handoffs form an adjacency list
/// keyed by agent name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowDefinition {
    pub agents: BTreeMap<String, AgentDefinition>,
    pub workflow: WorkflowSettings,
}

impl WorkflowDefinition {
    pub fn new(entry_point: impl Into<String>, agents: Vec<AgentDefinition>) -> Self {
        Self {
            agents: agents
                .into_iter()
                .map(|agent| (agent.name.clone(), agent))
                .collect(),
            workflow: WorkflowSettings {
                entry_point: entry_point.into(),
                pattern: WorkflowPattern::HandoffChain,
                max_turns: DEFAULT_MAX_TURNS,
                timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
                sequence: Vec::new(),
            },
        }
    }

    pub fn with_pattern(mut self, pattern: WorkflowPattern, sequence: &[&str]) -> Self {
        self.workflow.pattern = pattern;
        self.workflow.sequence = sequence.iter().map(|name| name.to_string()).collect();
        self
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.workflow.max_turns = max_turns;
        self
    }

    pub fn with_timeout_seconds(mut self, timeout_seconds: u64) -> Self {
        self.workflow.timeout_seconds = timeout_seconds;
        self
    }

    pub fn entry_point(&self) -> &str {
        &self.workflow.entry_point
    }

    pub fn agent(&self, name: &str) -> Option<&AgentDefinition> {
        self.agents.get(name)
    }

    pub fn handoff_targets(&self, name: &str) -> &[String] {
        self.agents
            .get(name)
            .map(|agent| agent.handoffs.as_slice())
            .unwrap_or_default()
    }

    /// Root agents of the run's lanes, in execution order.
    pub fn lane_roots(&self) -> Vec<String> {
        match self.workflow.pattern {
            WorkflowPattern::HandoffChain => vec![self.workflow.entry_point.clone()],
            WorkflowPattern::Sequential if self.workflow.sequence.is_empty() => {
                vec![self.workflow.entry_point.clone()]
            }
            WorkflowPattern::Parallel if self.workflow.sequence.is_empty() => {
                self.agents.keys().cloned().collect()
            }
            WorkflowPattern::Sequential | WorkflowPattern::Parallel => {
                self.workflow.sequence.clone()
            }
        }
    }

    // -----------------------------------------------------------------------
    // Loading
    // -----------------------------------------------------------------------

    pub fn from_path(path: &Path) -> Result<Self, WorkflowError> {
        let content = std::fs::read_to_string(path).map_err(|err| {
            WorkflowError::Configuration(format!(
                "failed to read workflow definition '{}': {err}",
                path.display()
            ))
        })?;
        let format = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match format.as_str() {
            "yaml" | "yml" => Self::from_yaml_str(&content),
            "json" => Self::from_json_str(&content),
            _ => Self::from_toml_str(&content),
        }
        .map_err(|err| match err {
            WorkflowError::Configuration(message) => {
                WorkflowError::Configuration(format!("{} ({})", message, path.display()))
            }
            other => other,
        })
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, WorkflowError> {
        let parsed = serde_yaml::from_str::<Self>(content).map_err(|err| {
            WorkflowError::Configuration(format!("invalid workflow definition: {err}"))
        })?;
        parsed.normalized()
    }

    pub fn from_toml_str(content: &str) -> Result<Self, WorkflowError> {
        let parsed = toml::from_str::<Self>(content).map_err(|err| {
            WorkflowError::Configuration(format!("invalid workflow definition: {err}"))
        })?;
        parsed.normalized()
    }

    pub fn from_json_str(content: &str) -> Result<Self, WorkflowError> {
        let parsed = serde_json::from_str::<Self>(content).map_err(|err| {
            WorkflowError::Configuration(format!("invalid workflow definition: {err}"))
        })?;
        parsed.normalized()
    }

    /// Fills agent names from their map keys and rejects mismatches.
    fn normalized(mut self) -> Result<Self, WorkflowError> {
        for (key, agent) in self.agents.iter_mut() {
            let name = agent.name.trim();
            if name.is_empty() {
                agent.name = key.clone();
            } else if name != key {
                return Err(WorkflowError::Configuration(format!(
                    "invalid workflow definition: agent key '{key}' does not match its name '{name}'"
                )));
            }
        }
        Ok(self)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    /// Definition-only checks; running them twice yields the same report.
    pub fn validate(&self, tools: &ToolRegistry, guardrails: &GuardrailRegistry) -> ValidationReport {
        let mut issues = Vec::<ValidationIssue>::new();
        let settings = &self.workflow;

        if self.agents.is_empty() {
            issues.push(ValidationIssue::workflow("no agents are defined"));
        }
        if !self.agents.contains_key(&settings.entry_point) {
            issues.push(ValidationIssue::workflow(format!(
                "entry point '{}' is not a defined agent",
                settings.entry_point
            )));
        }
        if settings.max_turns == 0 {
            issues.push(ValidationIssue::workflow("max_turns must be at least 1"));
        }
        if settings.timeout_seconds == 0 {
            issues.push(ValidationIssue::workflow(
                "timeout_seconds must be at least 1",
            ));
        }

        let mut seen_in_sequence = BTreeSet::<&str>::new();
        for name in &settings.sequence {
            if !self.agents.contains_key(name) {
                issues.push(ValidationIssue::workflow(format!(
                    "sequence references unknown agent '{name}'"
                )));
            }
            if !seen_in_sequence.insert(name.as_str()) {
                issues.push(ValidationIssue::workflow(format!(
                    "sequence lists agent '{name}' more than once"
                )));
            }
        }
        if settings.pattern == WorkflowPattern::HandoffChain && !settings.sequence.is_empty() {
            issues.push(ValidationIssue::workflow(
                "sequence is only used by the sequential and parallel patterns",
            ));
        }

        let registered = tools.names();
        for (name, agent) in &self.agents {
            if agent.max_turns == Some(0) {
                issues.push(ValidationIssue::agent(name, "max_turns must be at least 1"));
            }

            let mut seen_targets = BTreeSet::<&str>::new();
            for target in &agent.handoffs {
                if target == name {
                    issues.push(ValidationIssue::agent(name, "cannot hand off to itself"));
                } else if !self.agents.contains_key(target) {
                    issues.push(ValidationIssue::agent(
                        name,
                        format!("handoff target '{target}' is not a defined agent"),
                    ));
                }
                if !seen_targets.insert(target.as_str()) {
                    issues.push(ValidationIssue::agent(
                        name,
                        format!("handoff target '{target}' is declared more than once"),
                    ));
                }
            }

            for entry in &agent.tools {
                if is_pattern(entry) {
                    if !registered.iter().any(|tool| matches_wildcard(entry, tool)) {
                        issues.push(ValidationIssue::agent(
                            name,
                            format!("tool pattern '{entry}' matches no registered tool"),
                        ));
                    }
                    continue;
                }
                match tools.get(entry) {
                    None => issues.push(ValidationIssue::agent(
                        name,
                        format!("tool '{entry}' is not registered"),
                    )),
                    Some(Tool::Agent { agent: target, .. })
                        if !self.agents.contains_key(target) =>
                    {
                        issues.push(ValidationIssue::agent(
                            name,
                            format!("agent tool '{entry}' targets unknown agent '{target}'"),
                        ));
                    }
                    Some(_) => {}
                }
            }

            for guardrail in &agent.guardrails {
                if !guardrails.contains(guardrail) {
                    issues.push(ValidationIssue::agent(
                        name,
                        format!("guardrail '{guardrail}' is not registered"),
                    ));
                }
            }

            if let Some(schema) = &agent.handoff_input_schema
                && let Err(err) = check_schema(schema)
            {
                issues.push(ValidationIssue::agent(
                    name,
                    format!("handoff_input_schema: {err}"),
                ));
            }
        }

        ValidationReport { issues }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub message: String,
}

impl ValidationIssue {
    fn workflow(message: impl Into<String>) -> Self {
        Self {
            agent: None,
            message: message.into(),
        }
    }

    fn agent(agent: &str, message: impl Into<String>) -> Self {
        Self {
            agent: Some(agent.to_string()),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.agent {
            Some(agent) => write!(f, "agent '{agent}': {}", self.message),
            None => write!(f, "workflow: {}", self.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ValidationReport {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn into_result(self) -> Result<(), WorkflowError> {
        if self.is_valid() {
            return Ok(());
        }
        let rendered = self
            .issues
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<String>>()
            .join("; ");
        Err(WorkflowError::Configuration(format!(
            "invalid workflow definition: {rendered}"
        )))
    }
}
