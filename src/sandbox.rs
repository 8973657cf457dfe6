use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::audit::AuditLog;
use crate::error::ToolError;
use crate::hooks::{HookEvent, HookExecutor, HookPoint};
use crate::schema::validate_against_schema;
use crate::tool_policy::{any_pattern_matches, matches_wildcard};
use crate::tools::{Tool, ToolCall, ToolRegistry, ToolResult};

pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 256 * 1024;

/// Parameter keys checked against `allowed_paths`.
pub const PATH_PARAMETER_KEYS: &[&str] = &["path", "file", "dir", "directory", "cwd"];
/// Parameter keys checked against `allowed_hosts`.
pub const HOST_PARAMETER_KEYS: &[&str] = &["url", "endpoint", "host"];

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Immutable access policy shared by every run of an engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxPolicy {
    /// Base for relative path parameters.
    pub workspace_root: PathBuf,
    /// Roots path parameters must stay under. Empty leaves paths unrestricted.
    pub allowed_paths: Vec<PathBuf>,
    /// Host patterns (`*` wildcards) network targets must match. Empty denies all.
    pub allowed_hosts: Vec<String>,
    /// Ceiling on serialized parameters and results.
    pub max_payload_bytes: usize,
    pub tool_timeout: Duration,
    /// How long a cancelled call may keep running before it is recorded failed.
    pub cancel_grace: Duration,
    /// Tool patterns that never suspend for approval.
    pub pre_approved_tools: Vec<String>,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            allowed_paths: Vec::new(),
            allowed_hosts: Vec::new(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            cancel_grace: DEFAULT_CANCEL_GRACE,
            pre_approved_tools: Vec::new(),
        }
    }
}

/// Resolves `.` and `..` without touching the filesystem.
pub fn normalize_path(base: &Path, requested: &Path) -> PathBuf {
    let joined = if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        base.join(requested)
    };
    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

pub fn host_of(target: &str) -> Option<String> {
    if target.contains("://") {
        return reqwest::Url::parse(target)
            .ok()
            .and_then(|url| url.host_str().map(str::to_ascii_lowercase));
    }
    let host = target.split(['/', ':']).next().unwrap_or_default().trim();
    (!host.is_empty()).then(|| host.to_ascii_lowercase())
}

impl SandboxPolicy {
    pub fn check_path(&self, requested: &str) -> Result<(), ToolError> {
        if self.allowed_paths.is_empty() {
            return Ok(());
        }
        let resolved = normalize_path(&self.workspace_root, Path::new(requested));
        let allowed = self
            .allowed_paths
            .iter()
            .map(|root| normalize_path(&self.workspace_root, root))
            .any(|root| resolved.starts_with(&root));
        if allowed {
            Ok(())
        } else {
            Err(ToolError::new(
                "denied_path",
                format!("path '{requested}' is outside the allowed paths"),
            ))
        }
    }

    pub fn check_host(&self, target: &str) -> Result<(), ToolError> {
        let Some(host) = host_of(target) else {
            return Err(ToolError::new(
                "denied_host",
                format!("cannot determine host of '{target}'"),
            ));
        };
        if self
            .allowed_hosts
            .iter()
            .any(|pattern| matches_wildcard(&pattern.to_ascii_lowercase(), &host))
        {
            Ok(())
        } else {
            Err(ToolError::new(
                "denied_host",
                format!("host '{host}' is not in the allowed hosts"),
            ))
        }
    }

    pub fn check_payload(&self, label: &str, value: &Value) -> Result<(), ToolError> {
        let size = serde_json::to_vec(value).map(|bytes| bytes.len()).unwrap_or(0);
        if self.max_payload_bytes > 0 && size > self.max_payload_bytes {
            return Err(ToolError::new(
                "resource_limit",
                format!(
                    "{label} is {size} bytes, above the {} byte limit",
                    self.max_payload_bytes
                ),
            ));
        }
        Ok(())
    }

    /// Path and host checks over the top-level string parameters.
    pub fn check_parameters(&self, parameters: &Value) -> Result<(), ToolError> {
        let Some(map) = parameters.as_object() else {
            return Ok(());
        };
        for (key, value) in map {
            let Some(text) = value.as_str() else {
                continue;
            };
            let key = key.to_ascii_lowercase();
            if PATH_PARAMETER_KEYS.contains(&key.as_str()) {
                self.check_path(text)?;
            } else if HOST_PARAMETER_KEYS.contains(&key.as_str()) {
                self.check_host(text)?;
            }
        }
        Ok(())
    }

    pub fn is_pre_approved(&self, tool: &str) -> bool {
        any_pattern_matches(&self.pre_approved_tools, tool)
    }
}

// ---------------------------------------------------------------------------
// Backends for non-local tools
// ---------------------------------------------------------------------------

#[async_trait]
pub trait HostedToolBackend: Send + Sync {
    async fn execute(&self, capability: &str, parameters: &Value) -> Result<Value, ToolError>;
}

#[async_trait]
pub trait ExternalToolTransport: Send + Sync {
    async fn invoke(
        &self,
        endpoint: &str,
        remote_name: &str,
        parameters: &Value,
    ) -> Result<Value, ToolError>;
}

/// Runs an agent of the current workflow as an isolated sub-run.
#[async_trait]
pub trait NestedAgentRunner: Send + Sync {
    async fn run_agent(&self, agent: &str, input: String) -> Result<String, ToolError>;
}

// ---------------------------------------------------------------------------
// Interruptions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Interruption {
    pub call_id: String,
    pub tool: String,
    pub parameters: Value,
    pub session_id: String,
    pub agent: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    Reject { reason: String },
}

/// A batch with at least one call suspended for approval. Calls that did not
/// need approval have already produced their results.
#[derive(Debug, Clone)]
pub struct PendingBatch {
    agent: String,
    calls: Vec<ToolCall>,
    results: Vec<Option<ToolResult>>,
    decisions: HashMap<String, ApprovalDecision>,
}

impl PendingBatch {
    pub fn agent(&self) -> &str {
        &self.agent
    }

    /// Suspended calls still waiting for a decision, in call order.
    pub fn interruptions(&self) -> Vec<Interruption> {
        self.calls
            .iter()
            .zip(&self.results)
            .filter(|(call, result)| result.is_none() && !self.decisions.contains_key(&call.id))
            .map(|(call, _)| Interruption {
                call_id: call.id.clone(),
                tool: call.tool.clone(),
                parameters: call.parameters.clone(),
                session_id: call.session_id.clone(),
                agent: self.agent.clone(),
            })
            .collect()
    }

    /// Records a decision; false when the call of `session_id` is not
    /// suspended here. Call ids are only unique within one session.
    pub fn decide(&mut self, session_id: &str, call_id: &str, decision: ApprovalDecision) -> bool {
        let suspended = self.calls.iter().zip(&self.results).any(|(call, result)| {
            call.session_id == session_id && call.id == call_id && result.is_none()
        });
        if suspended {
            self.decisions.insert(call_id.to_string(), decision);
        }
        suspended
    }
}

#[derive(Debug, Clone)]
pub enum BatchOutcome {
    /// One result per call, in call order.
    Completed(Vec<ToolResult>),
    Interrupted(PendingBatch),
}

/// What the caller allows for one batch.
pub struct BatchScope<'a> {
    pub run_id: &'a str,
    pub agent: &'a str,
    /// Concrete tool names the owning agent may call.
    pub permitted_tools: &'a [String],
    pub nested: Option<&'a dyn NestedAgentRunner>,
}

// ---------------------------------------------------------------------------
// Sandbox
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ToolExecutionSandbox {
    registry: Arc<ToolRegistry>,
    policy: Arc<SandboxPolicy>,
    hooks: Arc<HookExecutor>,
    hosted: Option<Arc<dyn HostedToolBackend>>,
    transport: Option<Arc<dyn ExternalToolTransport>>,
    audit: AuditLog,
}

impl ToolExecutionSandbox {
    pub fn new(registry: Arc<ToolRegistry>, policy: SandboxPolicy, audit: AuditLog) -> Self {
        Self {
            registry,
            policy: Arc::new(policy),
            hooks: Arc::new(HookExecutor::default()),
            hosted: None,
            transport: None,
            audit,
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<HookExecutor>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_hosted_backend(mut self, backend: Arc<dyn HostedToolBackend>) -> Self {
        self.hosted = Some(backend);
        self
    }

    pub fn with_external_transport(mut self, transport: Arc<dyn ExternalToolTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Runs every call that does not need approval concurrently. If any call
    /// needs approval the batch comes back interrupted with those calls
    /// suspended.
    pub async fn execute_batch(
        &self,
        scope: &BatchScope<'_>,
        calls: Vec<ToolCall>,
        cancel: &CancellationToken,
    ) -> BatchOutcome {
        for call in &calls {
            self.audit.record(
                scope.run_id,
                "tool.requested",
                json!({
                    "agent": scope.agent,
                    "session_id": call.session_id,
                    "call_id": call.id,
                    "tool": call.tool,
                    "parameters": call.parameters,
                    "needs_approval": call.needs_approval
                }),
            );
        }

        let suspended = calls
            .iter()
            .map(|call| call.needs_approval && !self.policy.is_pre_approved(&call.tool))
            .collect::<Vec<bool>>();

        let runnable = calls
            .iter()
            .zip(&suspended)
            .filter(|(_, suspended)| !**suspended)
            .map(|(call, _)| self.execute_one(scope, call, cancel));
        let mut finished = join_all(runnable).await.into_iter();

        let results = suspended
            .iter()
            .map(|suspended| if *suspended { None } else { finished.next() })
            .collect::<Vec<Option<ToolResult>>>();

        let pending = PendingBatch {
            agent: scope.agent.to_string(),
            calls,
            results,
            decisions: HashMap::new(),
        };
        self.settle(scope, pending)
    }

    /// Applies recorded decisions: approved calls run, rejected calls yield an
    /// `approval_rejected` result. Undecided calls stay suspended.
    pub async fn resume_batch(
        &self,
        scope: &BatchScope<'_>,
        mut pending: PendingBatch,
        cancel: &CancellationToken,
    ) -> BatchOutcome {
        let mut approved = Vec::<usize>::new();
        for (index, call) in pending.calls.iter().enumerate() {
            if pending.results[index].is_some() {
                continue;
            }
            let Some(decision) = pending.decisions.get(&call.id) else {
                continue;
            };
            self.audit.record(
                scope.run_id,
                "tool.approval",
                json!({
                    "agent": scope.agent,
                    "call_id": call.id,
                    "tool": call.tool,
                    "decision": match decision {
                        ApprovalDecision::Approve => "approved",
                        ApprovalDecision::Reject { .. } => "rejected",
                    }
                }),
            );
            match decision {
                ApprovalDecision::Approve => approved.push(index),
                ApprovalDecision::Reject { reason } => {
                    tracing::info!(
                        call_id = %call.id,
                        tool = %call.tool,
                        "Tool call rejected by approver"
                    );
                    let result = ToolResult::failed(call, ToolError::rejected(reason.clone()));
                    self.record_result(scope, call, &result);
                    pending.results[index] = Some(result);
                }
            }
        }

        let executions = approved
            .iter()
            .map(|index| self.execute_one(scope, &pending.calls[*index], cancel));
        let finished = join_all(executions).await;
        for (index, result) in approved.into_iter().zip(finished) {
            pending.results[index] = Some(result);
        }
        for call in &pending.calls {
            pending.decisions.remove(&call.id);
        }

        self.settle(scope, pending)
    }

    fn settle(&self, scope: &BatchScope<'_>, pending: PendingBatch) -> BatchOutcome {
        if pending.results.iter().all(Option::is_some) {
            return BatchOutcome::Completed(pending.results.into_iter().flatten().collect());
        }
        for interruption in pending.interruptions() {
            tracing::info!(
                call_id = %interruption.call_id,
                tool = %interruption.tool,
                agent = %scope.agent,
                "Tool call awaiting approval"
            );
            self.audit.record(
                scope.run_id,
                "tool.interrupted",
                json!({
                    "agent": scope.agent,
                    "session_id": interruption.session_id,
                    "call_id": interruption.call_id,
                    "tool": interruption.tool
                }),
            );
        }
        BatchOutcome::Interrupted(pending)
    }

    async fn execute_one(
        &self,
        scope: &BatchScope<'_>,
        call: &ToolCall,
        cancel: &CancellationToken,
    ) -> ToolResult {
        let result = match self.run_checked(scope, call, cancel).await {
            Ok(data) => ToolResult::ok(call, data),
            Err(err) => ToolResult::failed(call, err),
        };
        self.record_result(scope, call, &result);
        result
    }

    fn record_result(&self, scope: &BatchScope<'_>, call: &ToolCall, result: &ToolResult) {
        match &result.error {
            None => {
                tracing::debug!(call_id = %call.id, tool = %call.tool, "Tool call succeeded");
                self.audit.record(
                    scope.run_id,
                    "tool.succeeded",
                    json!({
                        "agent": scope.agent,
                        "call_id": call.id,
                        "tool": call.tool,
                        "result": result.data
                    }),
                );
            }
            Some(err) => {
                tracing::warn!(
                    call_id = %call.id,
                    tool = %call.tool,
                    code = err.code,
                    error = %err.message,
                    "Tool call failed"
                );
                self.audit.record(
                    scope.run_id,
                    "tool.failed",
                    json!({
                        "agent": scope.agent,
                        "call_id": call.id,
                        "tool": call.tool,
                        "code": err.code,
                        "error": err.message
                    }),
                );
            }
        }
    }

    async fn run_checked(
        &self,
        scope: &BatchScope<'_>,
        call: &ToolCall,
        cancel: &CancellationToken,
    ) -> Result<Value, ToolError> {
        if !scope.permitted_tools.iter().any(|name| name == &call.tool) {
            return Err(ToolError::new(
                "not_permitted",
                format!("agent '{}' may not call tool '{}'", scope.agent, call.tool),
            ));
        }
        let tool = self
            .registry
            .get(&call.tool)
            .ok_or_else(|| ToolError::not_found(&call.tool))?;

        if let Err(errors) = validate_against_schema(&tool.spec().parameters, &call.parameters) {
            return Err(ToolError::invalid_args(errors.join("; ")));
        }
        self.policy.check_payload("parameters", &call.parameters)?;
        self.policy.check_parameters(&call.parameters)?;
        if let Tool::ExternalProtocol { endpoint, .. } = tool {
            self.policy.check_host(endpoint)?;
        }

        let event = HookEvent::for_tool(scope.run_id, scope.agent, &call.tool, &call.parameters);
        if let Some(reason) = self.hooks.run_pre_tool(&event).await {
            return Err(ToolError::new("denied_by_hook", reason));
        }

        let data = self.run_bounded(scope, tool, call, cancel).await?;
        self.policy.check_payload("result", &data)?;

        if !self.hooks.is_empty() {
            self.hooks
                .run(HookPoint::PostTool, &event.with_response(data.clone()))
                .await;
        }
        Ok(data)
    }

    /// Timeout-bounded dispatch. After cancellation the call gets the grace
    /// period to finish before it is recorded as cancelled.
    async fn run_bounded(
        &self,
        scope: &BatchScope<'_>,
        tool: &Tool,
        call: &ToolCall,
        cancel: &CancellationToken,
    ) -> Result<Value, ToolError> {
        let dispatch = self.dispatch(scope, tool, call);
        tokio::pin!(dispatch);

        let bounded = tokio::select! {
            result = tokio::time::timeout(self.policy.tool_timeout, &mut dispatch) => Some(result),
            _ = cancel.cancelled() => None,
        };
        match bounded {
            Some(Ok(result)) => result,
            Some(Err(_)) => Err(ToolError::new(
                "timeout",
                format!(
                    "tool '{}' exceeded {}ms",
                    call.tool,
                    self.policy.tool_timeout.as_millis()
                ),
            )),
            None => match tokio::time::timeout(self.policy.cancel_grace, &mut dispatch).await {
                Ok(result) => result,
                Err(_) => Err(ToolError::new(
                    "cancelled",
                    format!("tool '{}' did not finish after cancellation", call.tool),
                )),
            },
        }
    }

    async fn dispatch(
        &self,
        scope: &BatchScope<'_>,
        tool: &Tool,
        call: &ToolCall,
    ) -> Result<Value, ToolError> {
        match tool {
            Tool::Function { handler, .. } => handler.call(call.parameters.clone()).await,
            Tool::Hosted { capability, .. } => match &self.hosted {
                Some(backend) => backend.execute(capability, &call.parameters).await,
                None => Err(ToolError::new(
                    "unavailable",
                    format!("no hosted backend configured for capability '{capability}'"),
                )),
            },
            Tool::Agent { agent, .. } => {
                let Some(runner) = scope.nested else {
                    return Err(ToolError::new(
                        "unavailable",
                        format!("agent tool '{}' cannot run outside a workflow", call.tool),
                    ));
                };
                let input = call
                    .parameters
                    .get("input")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let output = runner.run_agent(agent, input).await?;
                Ok(json!({ "agent": agent, "output": output }))
            }
            Tool::ExternalProtocol {
                endpoint,
                remote_name,
                ..
            } => match &self.transport {
                Some(transport) => {
                    transport
                        .invoke(endpoint, remote_name, &call.parameters)
                        .await
                }
                None => Err(ToolError::new(
                    "unavailable",
                    format!("no external transport configured for '{endpoint}'"),
                )),
            },
        }
    }
}
