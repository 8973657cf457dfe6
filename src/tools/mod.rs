pub mod execute_bash;
pub mod fs_read;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};

use crate::error::{ToolError, WorkflowError};
use crate::tool_policy::{expand_tool_entries, filter_tool_names_by_policy};

pub const CURRENT_TIME_TOOL_NAME: &str = "current_unix_time";
pub const FS_READ_TOOL_NAME: &str = "fs_read";
pub const EXECUTE_BASH_TOOL_NAME: &str = "execute_bash";

// ---------------------------------------------------------------------------
// Calls and results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCall {
    pub id: String,
    pub tool: String,
    pub parameters: Value,
    pub session_id: String,
    pub needs_approval: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResult {
    pub call_id: String,
    pub tool: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
}

impl ToolResult {
    pub fn ok(call: &ToolCall, data: Value) -> Self {
        Self {
            call_id: call.id.clone(),
            tool: call.tool.clone(),
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(call: &ToolCall, error: ToolError) -> Self {
        Self {
            call_id: call.id.clone(),
            tool: call.tool.clone(),
            success: false,
            data: None,
            error: Some(error),
        }
    }

    pub fn is_rejection(&self) -> bool {
        self.error.as_ref().is_some_and(ToolError::is_rejection)
    }

    /// Shape handed back to the reasoning service: `{call_id, success, data|error}`.
    pub fn to_payload(&self) -> Value {
        match (&self.data, &self.error) {
            (_, Some(error)) => json!({
                "call_id": self.call_id,
                "success": false,
                "error": { "code": error.code, "message": error.message }
            }),
            (data, None) => json!({
                "call_id": self.call_id,
                "success": self.success,
                "data": data.clone().unwrap_or(Value::Null)
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tool model
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: Value) -> Result<Value, ToolError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ToolError>> + Send,
{
    async fn call(&self, args: Value) -> Result<Value, ToolError> {
        (self.0)(args).await
    }
}

pub type ApprovalPredicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

#[derive(Clone, Default)]
pub enum ApprovalRule {
    #[default]
    Never,
    Always,
    When(ApprovalPredicate),
}

impl ApprovalRule {
    pub fn when(predicate: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        ApprovalRule::When(Arc::new(predicate))
    }

    pub fn requires_approval(&self, args: &Value) -> bool {
        match self {
            ApprovalRule::Never => false,
            ApprovalRule::Always => true,
            ApprovalRule::When(predicate) => predicate(args),
        }
    }
}

impl fmt::Debug for ApprovalRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApprovalRule::Never => write!(f, "Never"),
            ApprovalRule::Always => write!(f, "Always"),
            ApprovalRule::When(_) => write!(f, "When(<predicate>)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub approval: ApprovalRule,
}

/// Entry of the per-call catalog sent to the reasoning service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Every capability an agent can call, dispatched by variant.
#[derive(Clone)]
pub enum Tool {
    /// Local async function.
    Function {
        spec: ToolSpec,
        handler: Arc<dyn ToolHandler>,
    },
    /// Capability executed by the reasoning provider's hosted backend.
    Hosted { spec: ToolSpec, capability: String },
    /// Another agent of the same workflow, run as an isolated sub-run.
    Agent { spec: ToolSpec, agent: String },
    /// Remote tool reached through an external protocol endpoint.
    ExternalProtocol {
        spec: ToolSpec,
        endpoint: String,
        remote_name: String,
    },
}

fn open_object_schema() -> Value {
    json!({ "type": "object" })
}

impl Tool {
    pub fn function<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        Tool::Function {
            spec: ToolSpec {
                name: name.into(),
                description: description.into(),
                parameters,
                approval: ApprovalRule::Never,
            },
            handler: Arc::new(FnHandler(handler)),
        }
    }

    pub fn with_handler(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        Tool::Function {
            spec: ToolSpec {
                name: name.into(),
                description: description.into(),
                parameters,
                approval: ApprovalRule::Never,
            },
            handler,
        }
    }

    pub fn hosted(
        name: impl Into<String>,
        description: impl Into<String>,
        capability: impl Into<String>,
    ) -> Self {
        Tool::Hosted {
            spec: ToolSpec {
                name: name.into(),
                description: description.into(),
                parameters: open_object_schema(),
                approval: ApprovalRule::Never,
            },
            capability: capability.into(),
        }
    }

    pub fn agent(
        name: impl Into<String>,
        description: impl Into<String>,
        agent: impl Into<String>,
    ) -> Self {
        Tool::Agent {
            spec: ToolSpec {
                name: name.into(),
                description: description.into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "input": { "type": "string", "description": "Task for the agent" }
                    },
                    "required": ["input"]
                }),
                approval: ApprovalRule::Never,
            },
            agent: agent.into(),
        }
    }

    pub fn external(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        endpoint: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Tool::ExternalProtocol {
            spec: ToolSpec {
                name: name.clone(),
                description: description.into(),
                parameters,
                approval: ApprovalRule::Never,
            },
            endpoint: endpoint.into(),
            remote_name: name,
        }
    }

    pub fn with_approval(mut self, rule: ApprovalRule) -> Self {
        self.spec_mut().approval = rule;
        self
    }

    pub fn spec(&self) -> &ToolSpec {
        match self {
            Tool::Function { spec, .. }
            | Tool::Hosted { spec, .. }
            | Tool::Agent { spec, .. }
            | Tool::ExternalProtocol { spec, .. } => spec,
        }
    }

    fn spec_mut(&mut self) -> &mut ToolSpec {
        match self {
            Tool::Function { spec, .. }
            | Tool::Hosted { spec, .. }
            | Tool::Agent { spec, .. }
            | Tool::ExternalProtocol { spec, .. } => spec,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec().name
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Tool::Function { .. } => "function",
            Tool::Hosted { .. } => "hosted",
            Tool::Agent { .. } => "agent",
            Tool::ExternalProtocol { .. } => "external_protocol",
        }
    }

    pub fn needs_approval(&self, args: &Value) -> bool {
        self.spec().approval.requires_approval(args)
    }

    pub fn descriptor(&self) -> ToolDescriptor {
        let spec = self.spec();
        ToolDescriptor {
            name: spec.name.clone(),
            description: spec.description.clone(),
            parameters: spec.parameters.clone(),
        }
    }
}

impl fmt::Debug for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tool")
            .field("kind", &self.kind())
            .field("name", &self.name())
            .field("approval", &self.spec().approval)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Name-keyed tool catalog. Built once, then shared read-only across runs.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Tool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins(workspace_root: &Path) -> Self {
        let mut registry = Self::new();
        for tool in build_builtin_tools(workspace_root) {
            registry.tools.insert(tool.name().to_string(), tool);
        }
        registry
    }

    pub fn register(&mut self, tool: Tool) -> Result<(), WorkflowError> {
        let name = tool.name().trim().to_string();
        if name.is_empty() {
            return Err(WorkflowError::Configuration(
                "tool name cannot be empty".to_string(),
            ));
        }
        if self.tools.contains_key(&name) {
            return Err(WorkflowError::Configuration(format!(
                "tool '{name}' is already registered"
            )));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names = self.tools.keys().cloned().collect::<Vec<String>>();
        names.sort();
        names
    }

    /// Concrete tool names for an agent's entries, with deny patterns applied.
    pub fn resolve_entries(&self, entries: &[String], deny: &[String]) -> Vec<String> {
        let expanded = expand_tool_entries(entries, &self.names());
        filter_tool_names_by_policy(expanded, &[], deny)
    }

    /// Ordered catalog for the given names; unknown names are skipped.
    pub fn catalog(&self, names: &[String]) -> Vec<ToolDescriptor> {
        names
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(Tool::descriptor)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Built-in tools
// ---------------------------------------------------------------------------

pub fn build_builtin_tools(workspace_root: &Path) -> Vec<Tool> {
    let current_time = Tool::function(
        CURRENT_TIME_TOOL_NAME,
        "Returns the current UTC timestamp in unix seconds.",
        json!({ "type": "object", "properties": {} }),
        |_args| async move {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            Ok(json!({ "unix_utc_seconds": now }))
        },
    );

    let root = workspace_root.to_path_buf();
    let fs_read = Tool::function(
        FS_READ_TOOL_NAME,
        "Reads file content or directory entries within the workspace using path policy checks. \
         Args: path (required), start_line, max_lines, max_bytes, max_entries.",
        fs_read::fs_read_parameters(),
        move |args| {
            let root = root.clone();
            async move { fs_read::fs_read(&root, &args) }
        },
    );

    let execute_bash = Tool::function(
        EXECUTE_BASH_TOOL_NAME,
        "Executes a shell command. Read-only commands run directly; anything else waits for approval. \
         Args: command (required), timeout_secs, max_output_chars.",
        execute_bash::execute_bash_parameters(),
        |args| async move { execute_bash::execute_bash(&args).await },
    )
    .with_approval(ApprovalRule::when(|args| {
        let command = args.get("command").and_then(Value::as_str).unwrap_or("");
        !execute_bash::is_read_only_command(command)
    }));

    vec![current_time, fs_read, execute_bash]
}
