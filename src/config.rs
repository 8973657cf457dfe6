use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::audit::AuditLog;
use crate::cli::*;
use crate::context::RuntimeContext;
use crate::guardrail::{GuardrailRegistry, default_guardrail_terms};
use crate::hooks::{HookConfig, HookExecutor, parse_hooks_map};
use crate::reasoning::RetryPolicy;
use crate::sandbox::{DEFAULT_MAX_PAYLOAD_BYTES, SandboxPolicy};
use crate::tools::ToolRegistry;

pub const DEFAULT_AUDIT_PATH: &str = ".agent-relay/audit/events.jsonl";
pub const DEFAULT_MAX_INPUT_CHARS: usize = 32_000;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub profile: String,
    pub config_path: String,
    pub provider: Provider,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub api_key_env: Option<String>,
    pub request_timeout_secs: u64,
    pub show_sensitive_config: bool,
    pub retry_attempts: u32,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    pub tool_timeout_secs: u64,
    pub cancel_grace_ms: u64,
    pub max_payload_bytes: usize,
    pub workspace_root: String,
    pub allowed_paths: Vec<String>,
    pub allowed_hosts: Vec<String>,
    pub deny_tools: Vec<String>,
    pub approve_tools: Vec<String>,
    pub audit_enabled: bool,
    pub audit_path: String,
    pub redact_fields: Vec<String>,
    pub guardrail_terms: Vec<String>,
    pub guardrail_redact_replacement: String,
    pub max_input_chars: usize,
    pub hooks: HashMap<String, Vec<HookConfig>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfilesFile {
    #[serde(default)]
    pub profiles: HashMap<String, ProfileConfig>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileConfig {
    pub provider: Option<Provider>,
    pub model: Option<String>,
    pub base_url: Option<String>,
    /// Env var holding the API key, when not the provider's standard one.
    pub api_key_env: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub retry_attempts: Option<u32>,
    pub retry_initial_backoff_ms: Option<u64>,
    pub retry_max_backoff_ms: Option<u64>,
    pub tool_timeout_secs: Option<u64>,
    pub cancel_grace_ms: Option<u64>,
    pub max_payload_bytes: Option<usize>,
    pub workspace_root: Option<String>,
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    #[serde(default)]
    pub deny_tools: Vec<String>,
    #[serde(default)]
    pub approve_tools: Vec<String>,
    pub audit_enabled: Option<bool>,
    pub audit_path: Option<String>,
    #[serde(default)]
    pub redact_fields: Vec<String>,
    #[serde(default)]
    pub guardrail_terms: Vec<String>,
    pub guardrail_redact_replacement: Option<String>,
    pub max_input_chars: Option<usize>,
    #[serde(default)]
    pub hooks: HashMap<String, Vec<HookConfig>>,
}

pub fn load_profiles(config_path: &str) -> Result<ProfilesFile> {
    let path = Path::new(config_path);
    if !path.exists() {
        return Ok(ProfilesFile::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read profile config file at '{}'", path.display()))?;
    toml::from_str::<ProfilesFile>(&content).with_context(|| {
        format!(
            "invalid profile configuration in '{}'. Check field names and value types.",
            path.display()
        )
    })
}

fn merge_unique_names(first: &[String], second: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::<String>::new();
    let mut merged = Vec::<String>::new();

    for name in first.iter().chain(second.iter()) {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_string()) {
            merged.push(trimmed.to_string());
        }
    }

    merged
}

/// Merges CLI flags over the selected profile over built-in defaults.
pub fn resolve_runtime_config(cli: &Cli, profiles: &ProfilesFile) -> Result<RuntimeConfig> {
    let selected = cli.profile.trim();
    if selected.is_empty() {
        return Err(anyhow::anyhow!(
            "profile name cannot be empty. Set --profile <name>."
        ));
    }

    let profile = if selected == "default" && !profiles.profiles.contains_key("default") {
        ProfileConfig::default()
    } else {
        profiles.profiles.get(selected).cloned().ok_or_else(|| {
            let mut names = profiles.profiles.keys().cloned().collect::<Vec<String>>();
            names.sort();
            if names.is_empty() {
                anyhow::anyhow!(
                    "profile '{}' not found in '{}'. No profiles are defined yet.",
                    selected,
                    cli.config_path
                )
            } else {
                anyhow::anyhow!(
                    "profile '{}' not found in '{}'. Available profiles: {}",
                    selected,
                    cli.config_path,
                    names.join(", ")
                )
            }
        })?
    };

    let provider = if cli.provider != Provider::Auto {
        cli.provider
    } else {
        profile.provider.unwrap_or(Provider::Auto)
    };

    let guardrail_terms = {
        let merged = merge_unique_names(&profile.guardrail_terms, &cli.guardrail_term);
        if merged.is_empty() {
            default_guardrail_terms()
        } else {
            merged
        }
    };

    let retry_initial_backoff_ms = profile.retry_initial_backoff_ms.unwrap_or(500);

    Ok(RuntimeConfig {
        profile: selected.to_string(),
        config_path: cli.config_path.clone(),
        provider,
        model: cli.model.clone().or(profile.model),
        base_url: cli.base_url.clone().or(profile.base_url),
        api_key_env: profile.api_key_env,
        request_timeout_secs: profile.request_timeout_secs.unwrap_or(120).max(1),
        show_sensitive_config: cli.show_sensitive_config,
        retry_attempts: cli
            .retry_attempts
            .or(profile.retry_attempts)
            .unwrap_or(3)
            .max(1),
        retry_initial_backoff_ms,
        retry_max_backoff_ms: profile
            .retry_max_backoff_ms
            .unwrap_or(8_000)
            .max(retry_initial_backoff_ms),
        tool_timeout_secs: cli
            .tool_timeout_secs
            .or(profile.tool_timeout_secs)
            .unwrap_or(30)
            .max(1),
        cancel_grace_ms: profile.cancel_grace_ms.unwrap_or(2_000),
        max_payload_bytes: cli
            .max_payload_bytes
            .or(profile.max_payload_bytes)
            .unwrap_or(DEFAULT_MAX_PAYLOAD_BYTES),
        workspace_root: cli
            .workspace_root
            .clone()
            .or(profile.workspace_root)
            .unwrap_or_else(|| ".".to_string()),
        allowed_paths: merge_unique_names(&profile.allowed_paths, &cli.allowed_path),
        allowed_hosts: merge_unique_names(&profile.allowed_hosts, &cli.allowed_host),
        deny_tools: merge_unique_names(&profile.deny_tools, &cli.deny_tool),
        approve_tools: profile.approve_tools,
        audit_enabled: cli
            .audit_enabled
            .or(profile.audit_enabled)
            .unwrap_or(true),
        audit_path: cli
            .audit_path
            .clone()
            .or(profile.audit_path)
            .unwrap_or_else(|| DEFAULT_AUDIT_PATH.to_string()),
        redact_fields: profile.redact_fields,
        guardrail_terms,
        guardrail_redact_replacement: cli
            .guardrail_redact_replacement
            .clone()
            .or(profile.guardrail_redact_replacement)
            .unwrap_or_else(|| "[REDACTED]".to_string()),
        max_input_chars: profile.max_input_chars.unwrap_or(DEFAULT_MAX_INPUT_CHARS),
        hooks: profile.hooks,
    })
}

// ---------------------------------------------------------------------------
// Engine collaborators built from the resolved config
// ---------------------------------------------------------------------------

pub fn build_retry_policy(cfg: &RuntimeConfig) -> RetryPolicy {
    RetryPolicy {
        max_attempts: cfg.retry_attempts,
        initial_backoff: Duration::from_millis(cfg.retry_initial_backoff_ms),
        max_backoff: Duration::from_millis(cfg.retry_max_backoff_ms),
        ..RetryPolicy::default()
    }
}

/// `approve_tools` from the CLI are appended to the profile's pre-approved list.
pub fn build_sandbox_policy(cfg: &RuntimeConfig, approve_tools: &[String]) -> SandboxPolicy {
    SandboxPolicy {
        workspace_root: PathBuf::from(&cfg.workspace_root),
        allowed_paths: cfg.allowed_paths.iter().map(PathBuf::from).collect(),
        allowed_hosts: cfg.allowed_hosts.clone(),
        max_payload_bytes: cfg.max_payload_bytes,
        tool_timeout: Duration::from_secs(cfg.tool_timeout_secs),
        cancel_grace: Duration::from_millis(cfg.cancel_grace_ms),
        pre_approved_tools: merge_unique_names(&cfg.approve_tools, approve_tools),
    }
}

pub fn build_audit_log(cfg: &RuntimeConfig) -> AuditLog {
    if !cfg.audit_enabled {
        return AuditLog::disabled();
    }
    AuditLog::to_file(&cfg.audit_path).with_redact_fields(&cfg.redact_fields)
}

pub fn build_guardrail_registry(cfg: &RuntimeConfig) -> GuardrailRegistry {
    GuardrailRegistry::with_builtins(
        cfg.guardrail_terms.clone(),
        &cfg.guardrail_redact_replacement,
        cfg.max_input_chars,
    )
}

pub fn build_tool_registry(cfg: &RuntimeConfig) -> ToolRegistry {
    ToolRegistry::with_builtins(Path::new(&cfg.workspace_root))
}

pub fn build_hook_executor(cfg: &RuntimeConfig) -> HookExecutor {
    HookExecutor::new(parse_hooks_map(&cfg.hooks))
}

pub fn build_runtime_context(cfg: &RuntimeConfig, vars: Vec<(String, String)>) -> RuntimeContext {
    let mut ctx = RuntimeContext::new()
        .with_deny_tools(cfg.deny_tools.clone())
        .with_default_model(cfg.model.clone());
    for (key, value) in vars {
        ctx = ctx.with_var(key, value);
    }
    ctx
}

pub fn display_base_url(cfg: &RuntimeConfig) -> String {
    let Some(url) = cfg.base_url.as_deref() else {
        return "<provider-default>".to_string();
    };
    if cfg.show_sensitive_config {
        url.to_string()
    } else {
        crate::error::redact_sensitive_text(url)
    }
}
