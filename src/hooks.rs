use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::context::ResolvedAgentConfig;
use crate::handoff::{HandoffHook, HandoffRequest};
use crate::tool_policy::matches_wildcard;

// ---------------------------------------------------------------------------
// Hook lifecycle points
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPoint {
    RunStarted,
    AgentActivated,
    PreTool,
    PostTool,
    RunFinished,
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookPoint::RunStarted => write!(f, "run_started"),
            HookPoint::AgentActivated => write!(f, "agent_activated"),
            HookPoint::PreTool => write!(f, "pre_tool"),
            HookPoint::PostTool => write!(f, "post_tool"),
            HookPoint::RunFinished => write!(f, "run_finished"),
        }
    }
}

impl HookPoint {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "run_started" => Some(HookPoint::RunStarted),
            "agent_activated" => Some(HookPoint::AgentActivated),
            "pre_tool" => Some(HookPoint::PreTool),
            "post_tool" => Some(HookPoint::PostTool),
            "run_finished" => Some(HookPoint::RunFinished),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Hook configuration (lives in the profiles TOML)
// ---------------------------------------------------------------------------

const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MAX_OUTPUT: usize = 10_240;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(deny_unknown_fields)]
pub struct HookConfig {
    pub command: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_output")]
    pub max_output: usize,
    /// Glob matcher for pre_tool / post_tool scoping (e.g. "fs_*", "execute_bash").
    /// For agent_activated it matches the activated agent's name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matcher: Option<String>,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}
fn default_max_output() -> usize {
    DEFAULT_MAX_OUTPUT
}

// ---------------------------------------------------------------------------
// Hook execution result
// ---------------------------------------------------------------------------

/// Exit code 2 from a pre_tool hook denies the tool call.
pub const HOOK_EXIT_BLOCK: i32 = 2;

#[derive(Debug, Clone)]
pub struct HookResult {
    pub hook_point: HookPoint,
    pub command: String,
    pub exit_code: i32,
    pub output: String,
    pub duration: Duration,
}

impl HookResult {
    pub fn is_block(&self) -> bool {
        self.hook_point == HookPoint::PreTool && self.exit_code == HOOK_EXIT_BLOCK
    }
}

/// JSON document written to the hook's stdin.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HookEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_response: Option<Value>,
}

impl HookEvent {
    pub fn for_run(run_id: &str, agent: Option<&str>, text: Option<&str>) -> Self {
        Self {
            run_id: Some(run_id.to_string()),
            agent: agent.map(str::to_string),
            text: text.map(str::to_string),
            ..Self::default()
        }
    }

    pub fn for_tool(run_id: &str, agent: &str, tool: &str, input: &Value) -> Self {
        Self {
            run_id: Some(run_id.to_string()),
            agent: Some(agent.to_string()),
            tool_name: Some(tool.to_string()),
            tool_input: Some(input.clone()),
            ..Self::default()
        }
    }

    pub fn with_response(mut self, response: Value) -> Self {
        self.tool_response = Some(response);
        self
    }

    fn matcher_subject(&self, point: HookPoint) -> Option<&str> {
        match point {
            HookPoint::PreTool | HookPoint::PostTool => self.tool_name.as_deref(),
            HookPoint::AgentActivated => self.agent.as_deref(),
            HookPoint::RunStarted | HookPoint::RunFinished => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Hook executor
// ---------------------------------------------------------------------------

/// Runs operator-configured shell commands at lifecycle points.
#[derive(Debug, Default)]
pub struct HookExecutor {
    hooks: HashMap<HookPoint, Vec<HookConfig>>,
}

impl HookExecutor {
    pub fn new(hooks: HashMap<HookPoint, Vec<HookConfig>>) -> Self {
        Self { hooks }
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.values().all(|v| v.is_empty())
    }

    /// Run all hooks registered for the given point. Returns results in order.
    pub async fn run(&self, point: HookPoint, event: &HookEvent) -> Vec<HookResult> {
        let Some(hooks) = self.hooks.get(&point) else {
            return Vec::new();
        };

        let mut results = Vec::new();
        for hook in hooks {
            if !hook_matches(hook, event.matcher_subject(point)) {
                continue;
            }
            let result = run_single_hook(point, hook, event).await;
            tracing::info!(
                hook_point = %point,
                command = %hook.command,
                exit_code = result.exit_code,
                duration_ms = result.duration.as_millis() as u64,
                blocked = result.is_block(),
                "Hook executed"
            );
            results.push(result);
        }
        results
    }

    /// Runs pre_tool hooks; the first blocking hook's output is returned as
    /// the denial reason.
    pub async fn run_pre_tool(&self, event: &HookEvent) -> Option<String> {
        self.run(HookPoint::PreTool, event)
            .await
            .into_iter()
            .find(HookResult::is_block)
            .map(|result| {
                let reason = result.output.trim();
                if reason.is_empty() {
                    format!("blocked by hook '{}'", result.command)
                } else {
                    reason.to_string()
                }
            })
    }
}

#[async_trait]
impl HandoffHook for HookExecutor {
    async fn before_activation(
        &self,
        run_id: &str,
        request: &HandoffRequest,
        target: &ResolvedAgentConfig,
    ) {
        let mut event = HookEvent::for_run(run_id, Some(&target.name), None);
        event.tool_input = Some(request.payload.clone());
        self.run(HookPoint::AgentActivated, &event).await;
    }
}

fn hook_matches(hook: &HookConfig, subject: Option<&str>) -> bool {
    let Some(pattern) = hook.matcher.as_deref() else {
        return true;
    };
    let Some(subject) = subject else {
        return true;
    };
    matches_wildcard(pattern, subject)
}

// ---------------------------------------------------------------------------
// Single hook execution
// ---------------------------------------------------------------------------

async fn run_single_hook(point: HookPoint, hook: &HookConfig, event: &HookEvent) -> HookResult {
    let start = Instant::now();
    let timeout = Duration::from_millis(hook.timeout_ms);

    let mut input = serde_json::to_value(event).unwrap_or_else(|_| json!({}));
    input["hook_point"] = Value::String(point.to_string());
    let json_input = serde_json::to_string(&input).unwrap_or_default();

    let command_future = async {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(&hook.command)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            use tokio::io::AsyncWriteExt;
            let _ = stdin.write_all(json_input.as_bytes()).await;
            let _ = stdin.shutdown().await;
        }
        child.wait_with_output().await
    };

    let (exit_code, output) = match tokio::time::timeout(timeout, command_future).await {
        Ok(Ok(output)) => {
            let exit_code = output.status.code().unwrap_or(-1);
            let raw = if exit_code == 0 {
                String::from_utf8_lossy(&output.stdout)
            } else {
                String::from_utf8_lossy(&output.stderr)
            };
            let truncated = if raw.chars().count() > hook.max_output {
                format!(
                    "{}... truncated",
                    raw.chars().take(hook.max_output).collect::<String>()
                )
            } else {
                raw.to_string()
            };
            (exit_code, truncated)
        }
        Ok(Err(err)) => (-1, format!("failed to execute: {err}")),
        Err(_) => (-1, format!("timed out after {}ms", hook.timeout_ms)),
    };

    HookResult {
        hook_point: point,
        command: hook.command.clone(),
        exit_code,
        output,
        duration: start.elapsed(),
    }
}

// ---------------------------------------------------------------------------
// Parse hooks from profile TOML structure
// ---------------------------------------------------------------------------

/// Parse a hooks table from a profile. Expected TOML shape:
/// ```toml
/// [[profiles.default.hooks.pre_tool]]
/// command = "./scripts/check-tool.sh"
/// matcher = "execute_*"
/// ```
pub fn parse_hooks_map(
    raw: &HashMap<String, Vec<HookConfig>>,
) -> HashMap<HookPoint, Vec<HookConfig>> {
    let mut map = HashMap::new();
    for (key, hooks) in raw {
        let Some(point) = HookPoint::parse(key) else {
            tracing::warn!(hook_point = %key, "Unknown hook point; skipping");
            continue;
        };
        map.insert(point, hooks.clone());
    }
    map
}
