use std::collections::HashSet;
use std::io::{self, Write};

use anyhow::Result;
use serde_json::Value;

use crate::engine::InterruptedRun;
use crate::sandbox::Interruption;

const BOLD: &str = "\x1b[1m";
const CYAN: &str = "\x1b[36m";
const DIM: &str = "\x1b[2m";
const GREEN: &str = "\x1b[32m";
const RESET: &str = "\x1b[0m";

const MAX_ARGS_PREVIEW: usize = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalAnswer {
    Approve,
    /// Approve and stop asking about this tool for the rest of the run.
    Trust,
    Reject,
}

pub fn parse_approval_answer(input: &str) -> ApprovalAnswer {
    match input.trim().to_lowercase().as_str() {
        "y" | "yes" => ApprovalAnswer::Approve,
        "t" | "trust" => ApprovalAnswer::Trust,
        _ => ApprovalAnswer::Reject,
    }
}

fn format_tool_args(args: &Value) -> String {
    let pretty = serde_json::to_string_pretty(args).unwrap_or_else(|_| args.to_string());
    if pretty.chars().count() > MAX_ARGS_PREVIEW {
        let head = pretty.chars().take(MAX_ARGS_PREVIEW).collect::<String>();
        format!("{head}...")
    } else {
        pretty
    }
}

/// One-screen summary of a suspended call.
pub fn format_interruption(interruption: &Interruption) -> String {
    if interruption.tool == "execute_bash" {
        let cmd = interruption
            .parameters
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or("?");
        return format!(
            "{DIM}[{}]{RESET} {BOLD}{CYAN}${RESET} {cmd}\n",
            interruption.agent
        );
    }
    format!(
        "{DIM}[{}]{RESET} {BOLD}{CYAN}{}{RESET} {DIM}{}{RESET}\n",
        interruption.agent,
        interruption.tool,
        format_tool_args(&interruption.parameters)
    )
}

/// Applies one answer per pending call. Tools in `trusted` are approved
/// without asking; a `Trust` answer adds the tool to it.
pub fn decide_interruptions<F>(run: &mut InterruptedRun, trusted: &mut HashSet<String>, mut ask: F)
where
    F: FnMut(&Interruption) -> ApprovalAnswer,
{
    for interruption in run.interruptions() {
        let answer = if trusted.contains(&interruption.tool) {
            ApprovalAnswer::Approve
        } else {
            ask(&interruption)
        };
        match answer {
            ApprovalAnswer::Trust => {
                trusted.insert(interruption.tool.clone());
                run.approve(&interruption);
            }
            ApprovalAnswer::Approve => {
                run.approve(&interruption);
            }
            ApprovalAnswer::Reject => {
                run.reject(&interruption, "denied by operator");
            }
        }
    }
}

async fn read_answer() -> Result<ApprovalAnswer> {
    let line = tokio::task::spawn_blocking(|| -> io::Result<String> {
        let mut buf = String::new();
        io::stdin().read_line(&mut buf)?;
        Ok(buf)
    })
    .await??;
    Ok(parse_approval_answer(&line))
}

/// Prompts on stderr for every pending call of `run`.
pub async fn prompt_for_approvals(
    run: &mut InterruptedRun,
    trusted: &mut HashSet<String>,
) -> Result<()> {
    let mut answers = Vec::new();
    for interruption in run.interruptions() {
        if trusted.contains(&interruption.tool) {
            continue;
        }
        eprint!("{}", format_interruption(&interruption));
        eprintln!(
            "{DIM}Allow this call? Use '{GREEN}t{DIM}' to trust this tool for the run. [{GREEN}y{DIM}/{GREEN}n{DIM}/{GREEN}t{DIM}]:{RESET}"
        );
        eprint!("{BOLD}> {RESET}");
        let _ = io::stderr().flush();

        let answer = read_answer().await?;
        if answer == ApprovalAnswer::Reject {
            eprintln!("  {DIM}Tool call denied.{RESET}");
        }
        if answer == ApprovalAnswer::Trust {
            trusted.insert(interruption.tool.clone());
        }
        answers.push((interruption.call_id, answer));
    }

    decide_interruptions(run, trusted, |interruption| {
        answers
            .iter()
            .find(|(id, _)| *id == interruption.call_id)
            .map(|(_, answer)| *answer)
            .unwrap_or(ApprovalAnswer::Reject)
    });
    Ok(())
}
