use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use agent_relay::approval::prompt_for_approvals;
use agent_relay::audit::run_audit_report;
use agent_relay::cli::*;
use agent_relay::config::*;
use agent_relay::definition::WorkflowDefinition;
use agent_relay::engine::{INTERRUPTED_EXIT_CODE, RunOutcome, WorkflowEngine};
use agent_relay::error::{categorize_error, format_cli_error};
use agent_relay::profiles::{run_profiles_list, run_profiles_show};
use agent_relay::provider::resolve_reasoning_client;
use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let show_sensitive = cli.show_sensitive_config;
    match run_cli(cli).await {
        Ok(code) => {
            if code != 0 {
                std::process::exit(code);
            }
        }
        Err(err) => {
            let category = categorize_error(&err);
            eprintln!("{}", format_cli_error(&err, show_sensitive));
            tracing::error!(category = %category.code(), error = %err, "command failed");
            std::process::exit(category.exit_code());
        }
    }

    Ok(())
}

async fn run_cli(cli: Cli) -> Result<i32> {
    init_tracing(&cli.log_filter)?;
    let profiles = load_profiles(&cli.config_path)?;
    let cfg = resolve_runtime_config(&cli, &profiles)?;
    tracing::debug!(command = %command_label(&cli.command), profile = %cfg.profile, "Dispatching command");

    match cli.command {
        Commands::Run {
            config,
            input,
            approve_tool,
            vars,
            interactive,
        } => {
            let vars = parse_key_values(&vars)?;
            run_workflow(&cfg, &config, &input, &approve_tool, vars, interactive).await
        }
        Commands::Validate { config } => {
            run_validate(&cfg, &config)?;
            Ok(0)
        }
        Commands::Audit { command } => match command {
            AuditCommands::Report { path, limit } => {
                let path = path.unwrap_or_else(|| cfg.audit_path.clone());
                run_audit_report(Path::new(&path), limit)?;
                Ok(0)
            }
        },
        Commands::Profiles { command } => {
            match command {
                ProfileCommands::List => run_profiles_list(&profiles, &cfg)?,
                ProfileCommands::Show => run_profiles_show(&cfg)?,
            }
            Ok(0)
        }
    }
}

fn load_definition(path: &str) -> Result<WorkflowDefinition> {
    WorkflowDefinition::from_path(Path::new(path))
        .with_context(|| format!("failed to load workflow definition '{path}'"))
}

fn run_validate(cfg: &RuntimeConfig, path: &str) -> Result<()> {
    let definition = load_definition(path)?;
    let report = definition.validate(&build_tool_registry(cfg), &build_guardrail_registry(cfg));
    if report.is_valid() {
        println!(
            "Workflow '{path}' is valid: {} agents, entry point '{}', pattern {}",
            definition.agents.len(),
            definition.entry_point(),
            definition.workflow.pattern.label()
        );
        return Ok(());
    }
    for issue in &report.issues {
        eprintln!("- {issue}");
    }
    report.into_result()?;
    Ok(())
}

async fn run_workflow(
    cfg: &RuntimeConfig,
    path: &str,
    input: &str,
    approve_tools: &[String],
    vars: Vec<(String, String)>,
    interactive: bool,
) -> Result<i32> {
    let definition = Arc::new(load_definition(path)?);
    let (client, provider, model_name) = resolve_reasoning_client(cfg)?;
    tracing::info!(provider = ?provider, model = %model_name, "Using reasoning provider");

    let engine = WorkflowEngine::builder(client)
        .tools(build_tool_registry(cfg))
        .guardrails(build_guardrail_registry(cfg))
        .sandbox_policy(build_sandbox_policy(cfg, approve_tools))
        .retry_policy(build_retry_policy(cfg))
        .audit(build_audit_log(cfg))
        .hooks(build_hook_executor(cfg))
        .runtime_context(build_runtime_context(cfg, vars))
        .build();

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received; cancelling workflow run");
                cancel.cancel();
            }
        }
    });

    let mut outcome = engine
        .run_with_cancellation(definition, input, cancel.clone())
        .await?;
    let mut trusted = HashSet::<String>::new();

    loop {
        match outcome {
            RunOutcome::Finished(result) => {
                println!("{}", serde_json::to_string_pretty(&result)?);
                return Ok(result.status.exit_code());
            }
            RunOutcome::Interrupted(mut run) => {
                if !interactive {
                    let report = json!({
                        "run_id": run.run_id(),
                        "status": "interrupted",
                        "turns_used": run.turns_used(),
                        "interruptions": run.interruptions(),
                        "trace": run.trace(),
                    });
                    println!("{}", serde_json::to_string_pretty(&report)?);
                    return Ok(INTERRUPTED_EXIT_CODE);
                }
                prompt_for_approvals(&mut run, &mut trusted).await?;
                outcome = engine
                    .resume_with_cancellation(run, cancel.clone())
                    .await;
            }
        }
    }
}

fn init_tracing(log_filter: &str) -> Result<()> {
    let level = log_filter
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_env_filter(log_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {e}"))
}
