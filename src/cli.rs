use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Auto,
    Openai,
    Deepseek,
    Groq,
    Ollama,
}

#[derive(Debug, Subcommand)]
pub enum ProfileCommands {
    #[command(about = "List configured profiles and highlight the active profile")]
    List,
    #[command(about = "Show the active profile's resolved runtime settings")]
    Show,
}

#[derive(Debug, Subcommand)]
pub enum AuditCommands {
    #[command(about = "Summarize audit events from a JSONL log")]
    Report {
        #[arg(long)]
        path: Option<String>,
        #[arg(long, default_value_t = 5000)]
        limit: usize,
    },
}

const CLI_EXAMPLES: &str = "Examples:\n\
  agent-relay validate --config workflows/support.yaml\n\
  agent-relay run --config workflows/support.yaml --input \"My invoice is wrong\"\n\
  agent-relay --provider ollama --model llama3.1 run --config triage.toml --input \"Summarize the repo\"\n\
  agent-relay run --config triage.toml --input \"Check disk usage\" --interactive\n\
  agent-relay run --config triage.toml --input \"Clean the build dir\" --approve-tool execute_bash\n\
  agent-relay run --config triage.toml --input \"Hi\" --var customer=acme\n\
  agent-relay --allowed-host api.example.com run --config remote-tools.yaml --input \"Look up order 42\"\n\
  agent-relay audit report --limit 2000\n\
  agent-relay profiles show\n\
\n\
Exit codes:\n\
  0 completed, 1 failed, 2 configuration or usage error, 3 max turns exceeded,\n\
  4 guardrail blocked, 5 interrupted (pending approvals).";

#[derive(Debug, Parser)]
#[command(name = "agent-relay")]
#[command(about = "Multi-agent workflow runner with sandboxed tools, handoffs and guardrails")]
#[command(after_long_help = CLI_EXAMPLES)]
pub struct Cli {
    #[arg(long, env = "AGENT_RELAY_PROVIDER", value_enum, default_value_t = Provider::Auto)]
    pub provider: Provider,

    #[arg(long, env = "AGENT_RELAY_MODEL")]
    pub model: Option<String>,

    #[arg(long, env = "AGENT_RELAY_BASE_URL")]
    pub base_url: Option<String>,

    #[arg(long, env = "AGENT_RELAY_PROFILE", default_value = "default")]
    pub profile: String,

    #[arg(long, env = "AGENT_RELAY_CONFIG", default_value = ".agent-relay/config.toml")]
    pub config_path: String,

    #[arg(long, env = "AGENT_RELAY_SHOW_SENSITIVE_CONFIG", default_value_t = false)]
    pub show_sensitive_config: bool,

    #[arg(long, env = "AGENT_RELAY_RETRY_ATTEMPTS")]
    pub retry_attempts: Option<u32>,

    #[arg(long, env = "AGENT_RELAY_TOOL_TIMEOUT_SECS")]
    pub tool_timeout_secs: Option<u64>,

    #[arg(long, env = "AGENT_RELAY_MAX_PAYLOAD_BYTES")]
    pub max_payload_bytes: Option<usize>,

    #[arg(long, env = "AGENT_RELAY_WORKSPACE_ROOT")]
    pub workspace_root: Option<String>,

    #[arg(long, env = "AGENT_RELAY_ALLOWED_PATH")]
    pub allowed_path: Vec<String>,

    #[arg(long, env = "AGENT_RELAY_ALLOWED_HOST")]
    pub allowed_host: Vec<String>,

    #[arg(long, env = "AGENT_RELAY_DENY_TOOL")]
    pub deny_tool: Vec<String>,

    #[arg(long, env = "AGENT_RELAY_AUDIT_ENABLED", action = clap::ArgAction::Set)]
    pub audit_enabled: Option<bool>,

    #[arg(long, env = "AGENT_RELAY_AUDIT_PATH")]
    pub audit_path: Option<String>,

    #[arg(long, env = "AGENT_RELAY_GUARDRAIL_TERM")]
    pub guardrail_term: Vec<String>,

    #[arg(long, env = "AGENT_RELAY_GUARDRAIL_REDACT_REPLACEMENT")]
    pub guardrail_redact_replacement: Option<String>,

    #[arg(long, env = "RUST_LOG", default_value = "error")]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Run a workflow definition against an input and print the result as JSON")]
    Run {
        #[arg(long)]
        config: String,
        #[arg(long)]
        input: String,
        /// Pre-approve a tool (repeatable, `*` wildcards allowed).
        #[arg(long)]
        approve_tool: Vec<String>,
        /// Instruction template variables as key=value.
        #[arg(long = "var")]
        vars: Vec<String>,
        /// Prompt on stderr for pending approvals instead of exiting interrupted.
        #[arg(long, default_value_t = false)]
        interactive: bool,
    },
    #[command(about = "Validate a workflow definition without executing it")]
    Validate {
        #[arg(long)]
        config: String,
    },
    #[command(about = "Audit log utilities and reporting")]
    Audit {
        #[command(subcommand)]
        command: AuditCommands,
    },
    #[command(about = "Inspect profile configuration and active resolved profile state")]
    Profiles {
        #[command(subcommand)]
        command: ProfileCommands,
    },
}

pub fn command_label(command: &Commands) -> String {
    match command {
        Commands::Run { .. } => "run".to_string(),
        Commands::Validate { .. } => "validate".to_string(),
        Commands::Audit { command } => match command {
            AuditCommands::Report { .. } => "audit.report".to_string(),
        },
        Commands::Profiles { command } => match command {
            ProfileCommands::List => "profiles.list".to_string(),
            ProfileCommands::Show => "profiles.show".to_string(),
        },
    }
}

/// Parses repeated `key=value` flags.
pub fn parse_key_values(raw: &[String]) -> anyhow::Result<Vec<(String, String)>> {
    raw.iter()
        .map(|entry| {
            let (key, value) = entry.split_once('=').ok_or_else(|| {
                anyhow::anyhow!("invalid --var '{entry}'. Expected key=value")
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(anyhow::anyhow!("invalid --var '{entry}'. Key cannot be empty"));
            }
            Ok((key.to_string(), value.to_string()))
        })
        .collect()
}
