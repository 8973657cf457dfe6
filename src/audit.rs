use std::collections::{BTreeSet, HashMap};
use std::fs::OpenOptions;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde_json::{Value, json};

use crate::error::{DEFAULT_REDACT_FIELDS, redact_json_value};

pub fn unix_ms_now() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

#[derive(Debug, Clone)]
enum AuditSink {
    Disabled,
    File {
        path: PathBuf,
        file_lock: Arc<Mutex<()>>,
    },
    Memory(Arc<Mutex<Vec<Value>>>),
}

/// Append-only audit trail shared by every run of an engine.
///
/// Records are JSON objects (one per line for the file sink). Credential
/// redaction is applied to the payload before anything is written.
#[derive(Debug, Clone)]
pub struct AuditLog {
    sink: AuditSink,
    redact_fields: Arc<Vec<String>>,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::disabled()
    }
}

impl AuditLog {
    pub fn disabled() -> Self {
        Self {
            sink: AuditSink::Disabled,
            redact_fields: Arc::new(default_redact_fields()),
        }
    }

    pub fn to_file(path: impl Into<PathBuf>) -> Self {
        Self {
            sink: AuditSink::File {
                path: path.into(),
                file_lock: Arc::new(Mutex::new(())),
            },
            redact_fields: Arc::new(default_redact_fields()),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            sink: AuditSink::Memory(Arc::new(Mutex::new(Vec::new()))),
            redact_fields: Arc::new(default_redact_fields()),
        }
    }

    /// Adds field names to the redaction list (defaults are always kept).
    pub fn with_redact_fields(mut self, extra: &[String]) -> Self {
        let mut fields = default_redact_fields();
        for field in extra {
            let trimmed = field.trim();
            if !trimmed.is_empty() && !fields.iter().any(|existing| existing == trimmed) {
                fields.push(trimmed.to_string());
            }
        }
        self.redact_fields = Arc::new(fields);
        self
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self.sink, AuditSink::Disabled)
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.sink {
            AuditSink::File { path, .. } => Some(path.as_path()),
            _ => None,
        }
    }

    pub fn record(&self, run_id: &str, event: &str, payload: Value) {
        if !self.is_enabled() {
            return;
        }

        let ts = unix_ms_now();
        let mut record = serde_json::Map::new();
        record.insert("ts_unix_ms".to_string(), json!(ts));
        record.insert(
            "ts".to_string(),
            json!(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
        );
        record.insert("event".to_string(), json!(event));
        record.insert("run_id".to_string(), json!(run_id));

        let redacted = redact_json_value(&payload, self.redact_fields.as_slice());
        if let Some(map) = redacted.as_object() {
            for (key, value) in map {
                record.insert(key.clone(), value.clone());
            }
        } else if !redacted.is_null() {
            record.insert("payload".to_string(), redacted);
        }

        let value = Value::Object(record);
        match &self.sink {
            AuditSink::Disabled => {}
            AuditSink::Memory(events) => {
                events.lock().unwrap_or_else(|e| e.into_inner()).push(value);
            }
            AuditSink::File { path, file_lock } => {
                if let Err(err) = append_event_line(path, file_lock, &value) {
                    tracing::warn!(
                        event = event,
                        path = %path.display(),
                        error = %err,
                        "audit write failed"
                    );
                }
            }
        }
    }

    /// Snapshot of recorded events; only the in-memory sink retains them.
    pub fn events(&self) -> Vec<Value> {
        match &self.sink {
            AuditSink::Memory(events) => events.lock().unwrap_or_else(|e| e.into_inner()).clone(),
            _ => Vec::new(),
        }
    }

    pub fn events_named(&self, event: &str) -> Vec<Value> {
        self.events()
            .into_iter()
            .filter(|record| record.get("event").and_then(Value::as_str) == Some(event))
            .collect()
    }
}

fn default_redact_fields() -> Vec<String> {
    DEFAULT_REDACT_FIELDS
        .iter()
        .map(|field| field.to_string())
        .collect()
}

fn append_event_line(path: &Path, file_lock: &Mutex<()>, value: &Value) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create audit directory '{}'", parent.display()))?;
    }

    let _guard = file_lock.lock().unwrap_or_else(|e| e.into_inner());

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open audit path '{}'", path.display()))?;

    let mut line = serde_json::to_vec(value).context("failed to serialize audit event")?;
    line.push(b'\n');
    file.write_all(&line)
        .context("failed to write audit event line")
}

// ---------------------------------------------------------------------------
// Audit report
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct AuditSummary {
    pub total_lines: usize,
    pub parsed_events: usize,
    pub parse_errors: usize,
    pub unique_runs: BTreeSet<String>,
    pub event_counts: HashMap<String, usize>,
    pub status_counts: HashMap<String, usize>,
    pub runs_interrupted: usize,
    pub tool_requested: usize,
    pub tool_succeeded: usize,
    pub tool_failed: usize,
    pub tool_interrupted: usize,
    pub reasoning_retries: usize,
    pub handoffs: usize,
    pub guardrail_blocks: usize,
    pub last_event_ts_unix_ms: Option<u128>,
}

pub fn summarize_audit_lines(lines: Vec<String>, limit: usize) -> AuditSummary {
    let mut summary = AuditSummary::default();
    let max_events = limit.max(1);
    summary.total_lines = lines.len();

    for line in lines.into_iter().rev().take(max_events) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let Ok(parsed) = serde_json::from_str::<Value>(line) else {
            summary.parse_errors += 1;
            continue;
        };
        summary.parsed_events += 1;

        if let Some(run_id) = parsed.get("run_id").and_then(Value::as_str)
            && !run_id.is_empty()
        {
            summary.unique_runs.insert(run_id.to_string());
        }

        if let Some(ts) = parsed.get("ts_unix_ms").and_then(Value::as_u64) {
            let ts = ts as u128;
            summary.last_event_ts_unix_ms = Some(
                summary
                    .last_event_ts_unix_ms
                    .map_or(ts, |existing| existing.max(ts)),
            );
        }

        let event = parsed
            .get("event")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if !event.is_empty() {
            *summary.event_counts.entry(event.to_string()).or_insert(0) += 1;
        }

        match event {
            "run.finished" => {
                let status = parsed
                    .get("status")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                *summary.status_counts.entry(status.to_string()).or_insert(0) += 1;
            }
            "run.interrupted" => summary.runs_interrupted += 1,
            "tool.requested" => summary.tool_requested += 1,
            "tool.succeeded" => summary.tool_succeeded += 1,
            "tool.failed" => summary.tool_failed += 1,
            "tool.interrupted" => summary.tool_interrupted += 1,
            "reasoning.retry" => summary.reasoning_retries += 1,
            "handoff.routed" => summary.handoffs += 1,
            "guardrail.blocked" => summary.guardrail_blocks += 1,
            _ => {}
        }
    }

    summary
}

pub fn run_audit_report(path: &Path, limit: usize) -> Result<()> {
    if !path.exists() {
        println!("No audit log found at '{}'.", path.display());
        return Ok(());
    }

    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open audit log '{}'", path.display()))?;
    let lines = io::BufReader::new(file)
        .lines()
        .collect::<std::result::Result<Vec<String>, std::io::Error>>()
        .with_context(|| format!("failed to read audit log '{}'", path.display()))?;

    let summary = summarize_audit_lines(lines, limit);
    let mut statuses = summary.status_counts.iter().collect::<Vec<_>>();
    statuses.sort_by_key(|(name, count)| (std::cmp::Reverse(**count), (*name).clone()));

    println!("Audit report");
    println!("Path: {}", path.display());
    println!("Lines in file: {}", summary.total_lines);
    println!(
        "Events analyzed: {} (parse_errors={})",
        summary.parsed_events, summary.parse_errors
    );
    println!("Unique runs: {}", summary.unique_runs.len());
    if statuses.is_empty() {
        println!("Run outcomes: <none>");
    } else {
        let rendered = statuses
            .iter()
            .map(|(status, count)| format!("{status}={count}"))
            .collect::<Vec<_>>()
            .join(" ");
        println!("Run outcomes: {rendered} interrupted={}", summary.runs_interrupted);
    }
    println!(
        "Tool lifecycle: requested={} succeeded={} failed={} interrupted={}",
        summary.tool_requested, summary.tool_succeeded, summary.tool_failed, summary.tool_interrupted
    );
    println!(
        "Reasoning retries: {} | Handoffs: {} | Guardrail blocks: {}",
        summary.reasoning_retries, summary.handoffs, summary.guardrail_blocks
    );

    if let Some(last_ts) = summary.last_event_ts_unix_ms {
        println!("Last event ts_unix_ms: {last_ts}");
    }

    Ok(())
}
