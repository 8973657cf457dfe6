use std::fmt;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

pub const REDACTED: &str = "[REDACTED]";

/// Field names whose values are always redacted before an audit write.
pub const DEFAULT_REDACT_FIELDS: &[&str] = &[
    "password",
    "secret",
    "token",
    "api_key",
    "apikey",
    "authorization",
    "credential",
    "private_key",
];

// ---------------------------------------------------------------------------
// Workflow error taxonomy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Error)]
pub enum WorkflowError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("routing error: {0}")]
    Routing(String),

    #[error("guardrail '{guardrail}' blocked {stage}: {reason}")]
    GuardrailViolation {
        guardrail: String,
        stage: String,
        reason: String,
    },

    #[error("tool '{tool}' failed: {error}")]
    ToolExecution { tool: String, error: ToolError },

    #[error("reasoning service error: {message}")]
    ReasoningService { message: String, retryable: bool },

    #[error("maximum turns exceeded ({limit} {scope})")]
    MaxTurnsExceeded { limit: u32, scope: String },

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("approval rejected for call '{call_id}': {reason}")]
    ApprovalRejected { call_id: String, reason: String },

    #[error("invalid session transition for '{session_id}': {from} -> {to}")]
    InvalidTransition {
        session_id: String,
        from: String,
        to: String,
    },

    #[error("run cancelled")]
    Cancelled,
}

impl WorkflowError {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowError::Configuration(_) => "configuration_error",
            WorkflowError::Routing(_) => "routing_error",
            WorkflowError::GuardrailViolation { .. } => "guardrail_violation",
            WorkflowError::ToolExecution { .. } => "tool_execution_error",
            WorkflowError::ReasoningService { .. } => "reasoning_service_error",
            WorkflowError::MaxTurnsExceeded { .. } => "max_turns_exceeded",
            WorkflowError::Timeout(_) => "timeout",
            WorkflowError::ApprovalRejected { .. } => "approval_rejected",
            WorkflowError::InvalidTransition { .. } => "invalid_transition",
            WorkflowError::Cancelled => "cancelled",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WorkflowError::ReasoningService {
                retryable: true,
                ..
            }
        )
    }
}

// ---------------------------------------------------------------------------
// Per-call tool failures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolError {
    pub code: &'static str,
    pub message: String,
}

impl ToolError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::new("invalid_args", message)
    }

    pub fn not_found(tool: &str) -> Self {
        Self::new("not_found", format!("tool '{tool}' is not registered"))
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::new("approval_rejected", reason)
    }

    pub fn is_rejection(&self) -> bool {
        self.code == "approval_rejected"
    }
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ToolError {}

// ---------------------------------------------------------------------------
// CLI error categories
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Provider,
    Routing,
    Tooling,
    Input,
    Internal,
}

impl ErrorCategory {
    pub fn code(self) -> &'static str {
        match self {
            ErrorCategory::Configuration => "CONFIG",
            ErrorCategory::Provider => "PROVIDER",
            ErrorCategory::Routing => "ROUTING",
            ErrorCategory::Tooling => "TOOLING",
            ErrorCategory::Input => "INPUT",
            ErrorCategory::Internal => "INTERNAL",
        }
    }

    pub fn hint(self) -> &'static str {
        match self {
            ErrorCategory::Configuration => {
                "Run agent-relay validate --config <file> and fix the reported definition issues."
            }
            ErrorCategory::Provider => {
                "Set provider credentials (for example OPENAI_API_KEY) or run with --provider ollama."
            }
            ErrorCategory::Routing => {
                "Declare the handoff target in the origin agent's handoffs list."
            }
            ErrorCategory::Tooling => {
                "Review tool and sandbox settings and retry with RUST_LOG=info for tool logs."
            }
            ErrorCategory::Input => "Run agent-relay --help and correct command arguments.",
            ErrorCategory::Internal => {
                "Retry with RUST_LOG=debug. If it persists, capture logs and open an issue."
            }
        }
    }

    /// Process exit code used when a command fails in this category.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorCategory::Configuration | ErrorCategory::Input => 2,
            _ => 1,
        }
    }
}

pub fn categorize_error(err: &anyhow::Error) -> ErrorCategory {
    if let Some(workflow) = err.downcast_ref::<WorkflowError>() {
        return match workflow {
            WorkflowError::Configuration(_) => ErrorCategory::Configuration,
            WorkflowError::Routing(_) => ErrorCategory::Routing,
            WorkflowError::ToolExecution { .. } => ErrorCategory::Tooling,
            WorkflowError::ReasoningService { .. } => ErrorCategory::Provider,
            _ => ErrorCategory::Internal,
        };
    }

    let msg = format!("{err:#}").to_ascii_lowercase();

    if msg.contains("workflow definition")
        || msg.contains("configuration")
        || msg.contains("profile")
    {
        return ErrorCategory::Configuration;
    }

    if msg.contains("api_key") || msg.contains("provider") {
        return ErrorCategory::Provider;
    }

    if msg.contains("invalid value")
        || msg.contains("unknown argument")
        || msg.contains("failed to read input")
    {
        return ErrorCategory::Input;
    }

    if msg.contains("tool") || msg.contains("hook") {
        return ErrorCategory::Tooling;
    }

    ErrorCategory::Internal
}

pub fn format_cli_error(err: &anyhow::Error, show_sensitive_config: bool) -> String {
    let category = categorize_error(err);
    let rendered_error = render_error_message(err, show_sensitive_config);
    format!(
        "[{}] {}\nHint: {}",
        category.code(),
        rendered_error,
        category.hint()
    )
}

pub fn render_error_message(err: &anyhow::Error, show_sensitive_config: bool) -> String {
    let text = format!("{err:#}");
    if show_sensitive_config {
        text
    } else {
        redact_sensitive_text(&text)
    }
}

// ---------------------------------------------------------------------------
// Credential redaction
// ---------------------------------------------------------------------------

pub fn redact_sensitive_text(text: &str) -> String {
    let text = redact_sqlite_urls(text);
    let text = redact_bearer_tokens(&text);
    let text = redact_key_like_tokens(&text);
    redact_assignments(&text, DEFAULT_REDACT_FIELDS)
}

fn token_end(remainder: &str) -> usize {
    remainder
        .find(|ch: char| {
            ch.is_whitespace()
                || matches!(
                    ch,
                    '"' | '\'' | '(' | ')' | '[' | ']' | '{' | '}' | ',' | ';'
                )
        })
        .unwrap_or(remainder.len())
}

pub fn redact_sqlite_urls(text: &str) -> String {
    const SQLITE_PREFIX: &str = "sqlite:";
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0usize;

    while let Some(offset) = text[cursor..].find(SQLITE_PREFIX) {
        let start = cursor + offset;
        out.push_str(&text[cursor..start]);
        let end = token_end(&text[start..]);
        if text[start..].starts_with("sqlite://") {
            out.push_str("sqlite://");
        } else {
            out.push_str(SQLITE_PREFIX);
        }
        out.push_str(REDACTED);
        cursor = start + end;
    }

    out.push_str(&text[cursor..]);
    out
}

/// Replaces the credential following `Bearer ` (case-insensitive).
pub fn redact_bearer_tokens(text: &str) -> String {
    const BEARER: &str = "bearer ";
    let lower = text.to_ascii_lowercase();
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0usize;

    while let Some(offset) = lower[cursor..].find(BEARER) {
        let value_start = cursor + offset + BEARER.len();
        out.push_str(&text[cursor..value_start]);
        let end = token_end(&text[value_start..]);
        if end > 0 {
            out.push_str(REDACTED);
        }
        cursor = value_start + end;
    }

    out.push_str(&text[cursor..]);
    out
}

/// Replaces `sk-...` style API keys.
pub fn redact_key_like_tokens(text: &str) -> String {
    text.split_inclusive(char::is_whitespace)
        .map(|chunk| {
            let word = chunk.trim_end();
            let trailing = &chunk[word.len()..];
            let bare = word.trim_matches(|ch: char| matches!(ch, '"' | '\'' | ',' | ';'));
            if bare.len() >= 20 && (bare.starts_with("sk-") || bare.starts_with("sk_")) {
                format!("{}{}", word.replace(bare, REDACTED), trailing)
            } else {
                chunk.to_string()
            }
        })
        .collect()
}

/// Replaces values in `name=value` / `name: value` pairs whose name looks sensitive.
pub fn redact_assignments(text: &str, fields: &[&str]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0usize;
    let bytes = text.as_bytes();

    for (idx, ch) in text.char_indices() {
        if idx < cursor || !(ch == '=' || ch == ':') {
            continue;
        }
        let key_start = text[..idx]
            .rfind(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
            .map(|pos| pos + 1)
            .unwrap_or(0);
        let key = &text[key_start..idx];
        if key.is_empty() || !is_sensitive_field(key, fields) {
            continue;
        }
        let mut value_start = idx + 1;
        while value_start < bytes.len() && bytes[value_start] == b' ' {
            value_start += 1;
        }
        let end = token_end(&text[value_start..]);
        if end == 0 || text[value_start..].starts_with("//") {
            continue;
        }
        out.push_str(&text[cursor..value_start]);
        out.push_str(REDACTED);
        cursor = value_start + end;
    }

    out.push_str(&text[cursor..]);
    out
}

pub fn is_sensitive_field<S: AsRef<str>>(name: &str, fields: &[S]) -> bool {
    let normalized = name.to_ascii_lowercase().replace('-', "_");
    let compact = normalized.replace('_', "");
    fields.iter().any(|field| {
        let field = field.as_ref().to_ascii_lowercase().replace('-', "_");
        !field.is_empty() && (normalized.contains(&field) || compact.contains(&field.replace('_', "")))
    })
}

/// Redacts credential-looking fields and free-text secrets inside a JSON value.
pub fn redact_json_value<S: AsRef<str>>(value: &Value, fields: &[S]) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, inner)| {
                    let redacted = if is_sensitive_field(key, fields) && !inner.is_null() {
                        Value::String(REDACTED.to_string())
                    } else {
                        redact_json_value(inner, fields)
                    };
                    (key.clone(), redacted)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| redact_json_value(item, fields))
                .collect(),
        ),
        Value::String(text) => Value::String(redact_sensitive_text(text)),
        other => other.clone(),
    }
}
