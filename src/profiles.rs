use anyhow::Result;

use crate::config::{ProfilesFile, RuntimeConfig, display_base_url};

fn list_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "<none>".to_string()
    } else {
        items.join(", ")
    }
}

pub fn run_profiles_list(profiles: &ProfilesFile, cfg: &RuntimeConfig) -> Result<()> {
    let mut names = profiles.profiles.keys().cloned().collect::<Vec<String>>();
    if !names.iter().any(|name| name == "default") {
        names.push("default".to_string());
    }
    names.sort();

    println!("Configured profiles (active='{}'):", cfg.profile);
    for name in names {
        let marker = if name == cfg.profile { "*" } else { " " };
        let source = if profiles.profiles.contains_key(&name) {
            "configured"
        } else {
            "implicit"
        };
        println!("{marker} {name} ({source})");
    }

    Ok(())
}

pub fn run_profiles_show(cfg: &RuntimeConfig) -> Result<()> {
    println!("Active profile: {}", cfg.profile);
    println!("Config path: {}", cfg.config_path);
    println!("Provider: {:?}", cfg.provider);
    println!(
        "Model: {}",
        cfg.model.as_deref().unwrap_or("<provider-default>")
    );
    println!("Base URL: {}", display_base_url(cfg));
    println!(
        "API key env: {}",
        cfg.api_key_env.as_deref().unwrap_or("<provider-default>")
    );
    println!("Request timeout (secs): {}", cfg.request_timeout_secs);
    println!(
        "Retry: attempts={} initial_backoff_ms={} max_backoff_ms={}",
        cfg.retry_attempts, cfg.retry_initial_backoff_ms, cfg.retry_max_backoff_ms
    );
    println!("Tool timeout (secs): {}", cfg.tool_timeout_secs);
    println!("Cancel grace (ms): {}", cfg.cancel_grace_ms);
    println!("Max payload bytes: {}", cfg.max_payload_bytes);
    println!("Workspace root: {}", cfg.workspace_root);
    println!(
        "Allowed paths: {}",
        if cfg.allowed_paths.is_empty() {
            "<unrestricted within workspace>".to_string()
        } else {
            cfg.allowed_paths.join(", ")
        }
    );
    println!(
        "Allowed hosts: {}",
        if cfg.allowed_hosts.is_empty() {
            "<none, outbound denied>".to_string()
        } else {
            cfg.allowed_hosts.join(", ")
        }
    );
    println!("Denied tools: {}", list_or_none(&cfg.deny_tools));
    println!("Pre-approved tools: {}", list_or_none(&cfg.approve_tools));
    println!("Audit enabled: {}", cfg.audit_enabled);
    println!("Audit path: {}", cfg.audit_path);
    println!("Extra redact fields: {}", list_or_none(&cfg.redact_fields));
    println!(
        "Guardrails: terms={} redact_replacement={} max_input_chars={}",
        cfg.guardrail_terms.len(),
        cfg.guardrail_redact_replacement,
        cfg.max_input_chars
    );
    let mut hook_points = cfg.hooks.keys().cloned().collect::<Vec<String>>();
    hook_points.sort();
    println!("Hooks: {}", list_or_none(&hook_points));
    Ok(())
}
