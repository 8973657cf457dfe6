use std::time::Duration;

use serde_json::{Value, json};

use super::fs_read::usize_arg;
use crate::error::ToolError;

pub const EXECUTE_BASH_DEFAULT_TIMEOUT_SECS: u64 = 20;
pub const EXECUTE_BASH_MAX_TIMEOUT_SECS: u64 = 120;
pub const EXECUTE_BASH_DEFAULT_MAX_OUTPUT_CHARS: usize = 8000;
pub const EXECUTE_BASH_MAX_OUTPUT_CHARS_LIMIT: usize = 20000;

/// Commands that are refused outright, approved or not.
pub const EXECUTE_BASH_DENIED_PATTERNS: &[&str] = &[
    "rm -rf", "mkfs", "shutdown", "reboot", "poweroff", "halt", ":(){", "dd if=",
];

/// Shell constructs that can smuggle writes past the read-only check.
pub const DANGEROUS_PATTERNS: &[&str] = &[
    "<(", "$(", "`", ">", "&&", "||", "&", ";", "\n", "\r", "IFS",
];

pub const READONLY_COMMANDS: &[&str] = &[
    "ls", "cat", "echo", "pwd", "which", "head", "tail", "find", "grep", "rg", "wc", "stat",
    "file", "diff", "sort", "uniq", "cut", "uname", "whoami", "date", "df", "du", "realpath",
    "dirname", "basename", "sha256sum", "jq",
];

pub const READONLY_GIT_SUBCOMMANDS: &[&str] = &[
    "status", "diff", "log", "show", "blame", "branch", "tag", "remote", "rev-parse",
    "ls-files", "ls-tree", "cat-file", "describe", "stash",
];

const GIT_MUTATING_SHORT_FLAGS: &str = "dDmMcCfu";

const GIT_MUTATING_LONG_FLAGS: &[&str] = &[
    "delete", "move", "copy", "force", "set-upstream-to", "unset-upstream", "edit-description",
    "create-reflog", "track", "annotate", "sign", "message", "file",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteBashRequest {
    pub command: String,
    pub timeout_secs: u64,
    pub max_output_chars: usize,
}

pub fn execute_bash_parameters() -> Value {
    json!({
        "type": "object",
        "properties": {
            "command": { "type": "string", "minLength": 1 },
            "timeout_secs": { "type": "integer", "minimum": 1, "maximum": EXECUTE_BASH_MAX_TIMEOUT_SECS },
            "max_output_chars": { "type": "integer", "minimum": 128, "maximum": EXECUTE_BASH_MAX_OUTPUT_CHARS_LIMIT }
        },
        "required": ["command"]
    })
}

pub fn parse_execute_bash_request(args: &Value) -> Result<ExecuteBashRequest, ToolError> {
    let command = args
        .get("command")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    if command.is_empty() {
        return Err(ToolError::invalid_args(
            "'command' is required for execute_bash",
        ));
    }

    let timeout_secs = usize_arg(
        args,
        "timeout_secs",
        EXECUTE_BASH_DEFAULT_TIMEOUT_SECS as usize,
        1,
        EXECUTE_BASH_MAX_TIMEOUT_SECS as usize,
    )? as u64;

    Ok(ExecuteBashRequest {
        command: command.to_string(),
        timeout_secs,
        max_output_chars: usize_arg(
            args,
            "max_output_chars",
            EXECUTE_BASH_DEFAULT_MAX_OUTPUT_CHARS,
            128,
            EXECUTE_BASH_MAX_OUTPUT_CHARS_LIMIT,
        )?,
    })
}

pub fn matched_denied_pattern(command: &str) -> Option<&'static str> {
    let normalized = command.trim().to_ascii_lowercase();
    EXECUTE_BASH_DENIED_PATTERNS
        .iter()
        .copied()
        .find(|pattern| normalized.contains(pattern))
}

fn is_read_only_git(args: &[&str]) -> bool {
    let Some(sub) = args.get(1) else {
        return false;
    };
    if !READONLY_GIT_SUBCOMMANDS.contains(sub) {
        return false;
    }
    match *sub {
        "stash" => matches!(args.get(2).copied(), Some("list" | "show")),
        "branch" | "tag" | "remote" => is_listing_form(&args[2..]),
        _ => true,
    }
}

/// `git branch|tag|remote` with flags only, none of which create, delete,
/// rename or retarget anything.
fn is_listing_form(args: &[&str]) -> bool {
    args.iter().all(|arg| {
        if let Some(long) = arg.strip_prefix("--") {
            let name = long.split('=').next().unwrap_or(long);
            !name.is_empty() && !GIT_MUTATING_LONG_FLAGS.contains(&name)
        } else if let Some(short) = arg.strip_prefix('-') {
            !short.is_empty() && !short.chars().any(|c| GIT_MUTATING_SHORT_FLAGS.contains(c))
        } else {
            false
        }
    })
}

fn writes_sort_output(args: &[&str]) -> bool {
    args.iter().skip(1).any(|arg| {
        if let Some(long) = arg.strip_prefix("--") {
            long == "output" || long.starts_with("output=")
        } else if let Some(short) = arg.strip_prefix('-') {
            short.contains('o')
        } else {
            false
        }
    })
}

/// `uniq [opts] [input [output]]`; a second operand is an output file.
fn writes_uniq_output(args: &[&str]) -> bool {
    let mut operands = 0;
    let mut rest = args.iter().skip(1);
    while let Some(arg) = rest.next() {
        if matches!(*arg, "-f" | "-s" | "-w") {
            rest.next();
        } else if *arg == "-" || !arg.starts_with('-') {
            operands += 1;
        }
    }
    operands > 1
}

fn is_read_only_segment(args: &[&str]) -> bool {
    let Some(cmd) = args.first() else {
        return false;
    };
    match *cmd {
        "git" => is_read_only_git(args),
        "find" => !args.iter().any(|arg| {
            ["-exec", "-delete", "-ok", "-fprint", "-fls"]
                .iter()
                .any(|flag| arg.contains(flag))
        }),
        "grep" => !args.iter().any(|arg| *arg == "-P" || *arg == "--perl-regexp"),
        "sort" => !writes_sort_output(args),
        "uniq" => !writes_uniq_output(args),
        other => READONLY_COMMANDS.contains(&other),
    }
}

/// True when every command of a (possibly piped) shell line is side-effect free.
pub fn is_read_only_command(command: &str) -> bool {
    let trimmed = command.trim();
    if trimmed.is_empty() || matched_denied_pattern(trimmed).is_some() {
        return false;
    }
    let Some(words) = shlex::split(trimmed) else {
        return false;
    };
    if words
        .iter()
        .any(|word| DANGEROUS_PATTERNS.iter().any(|pattern| word.contains(pattern)))
    {
        return false;
    }
    if words.iter().any(|word| word != "|" && word.contains('|')) {
        return false;
    }

    let refs = words.iter().map(String::as_str).collect::<Vec<&str>>();
    refs.split(|word| *word == "|")
        .all(|segment| !segment.is_empty() && is_read_only_segment(segment))
}

pub fn truncate_text(text: &str, max_chars: usize) -> (String, bool) {
    let mut iter = text.chars();
    let truncated = iter.by_ref().take(max_chars).collect::<String>();
    let was_truncated = iter.next().is_some();
    (truncated, was_truncated)
}

pub async fn execute_bash(args: &Value) -> Result<Value, ToolError> {
    let request = parse_execute_bash_request(args)?;
    if let Some(pattern) = matched_denied_pattern(&request.command) {
        return Err(ToolError::new(
            "denied_command",
            format!("execute_bash refused command containing blocked pattern '{pattern}'"),
        ));
    }

    let child = tokio::process::Command::new("sh")
        .arg("-lc")
        .arg(&request.command)
        .kill_on_drop(true)
        .output();
    let output = match tokio::time::timeout(Duration::from_secs(request.timeout_secs), child).await
    {
        Ok(Ok(output)) => output,
        Ok(Err(_)) => {
            return Err(ToolError::new(
                "io_error",
                "failed to launch shell command",
            ));
        }
        Err(_) => {
            return Err(ToolError::new(
                "timeout",
                format!("command timed out after {}s", request.timeout_secs),
            ));
        }
    };

    let (stdout, stdout_truncated) =
        truncate_text(&String::from_utf8_lossy(&output.stdout), request.max_output_chars);
    let (stderr, stderr_truncated) =
        truncate_text(&String::from_utf8_lossy(&output.stderr), request.max_output_chars);

    if !output.status.success() {
        return Err(ToolError::new(
            "command_failed",
            format!(
                "command exited with {}: {}",
                output.status,
                stderr.trim()
            ),
        ));
    }

    Ok(json!({
        "command": request.command,
        "exit_code": output.status.code().unwrap_or(0),
        "stdout": stdout,
        "stderr": stderr,
        "stdout_truncated": stdout_truncated,
        "stderr_truncated": stderr_truncated
    }))
}
