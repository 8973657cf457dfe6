use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::audit::AuditLog;

pub const DEFAULT_GUARDRAIL_TERMS: &[&str] = &[
    "password",
    "secret",
    "api key",
    "api_key",
    "private key",
    "access token",
    "ssn",
    "social security",
];

pub const SENSITIVE_TERMS_GUARDRAIL: &str = "sensitive_terms";
pub const REDACT_TERMS_GUARDRAIL: &str = "redact_terms";
pub const MAX_LENGTH_GUARDRAIL: &str = "max_length";
pub const JSON_OUTPUT_GUARDRAIL: &str = "json_output";

pub fn default_guardrail_terms() -> Vec<String> {
    DEFAULT_GUARDRAIL_TERMS
        .iter()
        .map(|term| term.to_string())
        .collect::<Vec<String>>()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailStage {
    Input,
    Output,
}

impl fmt::Display for GuardrailStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardrailStage::Input => write!(f, "input"),
            GuardrailStage::Output => write!(f, "output"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardrailVerdict {
    pub allowed: bool,
    pub modified: Option<String>,
    pub reason: Option<String>,
}

impl GuardrailVerdict {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            modified: None,
            reason: None,
        }
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            modified: None,
            reason: Some(reason.into()),
        }
    }

    pub fn sanitize(payload: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            modified: Some(payload.into()),
            reason: Some(reason.into()),
        }
    }
}

/// Independent validator applied to a run's input or output text.
pub trait Guardrail: Send + Sync {
    fn name(&self) -> &str;

    fn applies_to(&self, _stage: GuardrailStage) -> bool {
        true
    }

    fn check(&self, stage: GuardrailStage, payload: &str) -> GuardrailVerdict;
}

// ---------------------------------------------------------------------------
// Term matching
// ---------------------------------------------------------------------------

pub fn contains_guardrail_terms(text: &str, terms: &[String]) -> Vec<String> {
    let lower = text.to_ascii_lowercase();
    terms
        .iter()
        .map(|term| term.trim().to_ascii_lowercase())
        .filter(|term| !term.is_empty() && lower.contains(term.as_str()))
        .collect::<BTreeSet<String>>()
        .into_iter()
        .collect()
}

pub fn replace_case_insensitive(input: &str, needle: &str, replacement: &str) -> String {
    if needle.is_empty() {
        return input.to_string();
    }

    let input_lower = input.to_ascii_lowercase();
    let needle_lower = needle.to_ascii_lowercase();
    let mut out = String::with_capacity(input.len());
    let mut last = 0usize;

    for (start, _) in input_lower.match_indices(&needle_lower) {
        if start < last {
            continue;
        }
        out.push_str(&input[last..start]);
        out.push_str(replacement);
        last = start + needle_lower.len();
    }

    out.push_str(&input[last..]);
    out
}

pub fn redact_guardrail_terms(text: &str, hits: &[String], replacement: &str) -> String {
    hits.iter().fold(text.to_string(), |acc, hit| {
        replace_case_insensitive(&acc, hit, replacement)
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TermMode {
    Block,
    Redact,
    Observe,
}

/// Matches configured terms case-insensitively, then blocks, redacts or only logs.
#[derive(Debug, Clone)]
pub struct TermGuardrail {
    name: String,
    terms: Vec<String>,
    mode: TermMode,
    replacement: String,
}

impl TermGuardrail {
    pub fn new(name: impl Into<String>, terms: Vec<String>, mode: TermMode) -> Self {
        Self {
            name: name.into(),
            terms,
            mode,
            replacement: "[REDACTED]".to_string(),
        }
    }

    pub fn with_replacement(mut self, replacement: impl Into<String>) -> Self {
        self.replacement = replacement.into();
        self
    }
}

impl Guardrail for TermGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, stage: GuardrailStage, payload: &str) -> GuardrailVerdict {
        let hits = contains_guardrail_terms(payload, &self.terms);
        if hits.is_empty() {
            return GuardrailVerdict::allow();
        }
        match self.mode {
            TermMode::Block => {
                GuardrailVerdict::block(format!("matched terms: {}", hits.join(", ")))
            }
            TermMode::Redact => GuardrailVerdict::sanitize(
                redact_guardrail_terms(payload, &hits, &self.replacement),
                format!("redacted {} term(s)", hits.len()),
            ),
            TermMode::Observe => {
                tracing::warn!(
                    guardrail = %self.name,
                    stage = %stage,
                    hit_count = hits.len(),
                    "Guardrail observed content matches"
                );
                GuardrailVerdict::allow()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct MaxLengthGuardrail {
    max_chars: usize,
}

impl MaxLengthGuardrail {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }
}

impl Guardrail for MaxLengthGuardrail {
    fn name(&self) -> &str {
        MAX_LENGTH_GUARDRAIL
    }

    fn check(&self, _stage: GuardrailStage, payload: &str) -> GuardrailVerdict {
        let length = payload.chars().count();
        if self.max_chars > 0 && length > self.max_chars {
            return GuardrailVerdict::block(format!(
                "payload exceeds maximum length ({length} chars > {} limit)",
                self.max_chars
            ));
        }
        GuardrailVerdict::allow()
    }
}

#[derive(Debug, Clone, Default)]
pub struct JsonOutputGuardrail;

impl Guardrail for JsonOutputGuardrail {
    fn name(&self) -> &str {
        JSON_OUTPUT_GUARDRAIL
    }

    fn applies_to(&self, stage: GuardrailStage) -> bool {
        stage == GuardrailStage::Output
    }

    fn check(&self, _stage: GuardrailStage, payload: &str) -> GuardrailVerdict {
        match serde_json::from_str::<serde_json::Value>(payload.trim()) {
            Ok(_) => GuardrailVerdict::allow(),
            Err(err) => GuardrailVerdict::block(format!("output is not valid JSON: {err}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry and checker
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct GuardrailRegistry {
    guardrails: HashMap<String, Arc<dyn Guardrail>>,
}

impl fmt::Debug for GuardrailRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardrailRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl GuardrailRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `sensitive_terms`, `redact_terms`, `max_length` and `json_output`.
    pub fn with_builtins(terms: Vec<String>, replacement: &str, max_chars: usize) -> Self {
        let mut registry = Self::new();
        registry.register(TermGuardrail::new(
            SENSITIVE_TERMS_GUARDRAIL,
            terms.clone(),
            TermMode::Block,
        ));
        registry.register(
            TermGuardrail::new(REDACT_TERMS_GUARDRAIL, terms, TermMode::Redact)
                .with_replacement(replacement),
        );
        registry.register(MaxLengthGuardrail::new(max_chars));
        registry.register(JsonOutputGuardrail);
        registry
    }

    pub fn register(&mut self, guardrail: impl Guardrail + 'static) {
        self.guardrails
            .insert(guardrail.name().to_string(), Arc::new(guardrail));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Guardrail>> {
        self.guardrails.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.guardrails.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names = self.guardrails.keys().cloned().collect::<Vec<String>>();
        names.sort();
        names
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardrailOutcome {
    /// Payload to continue with; differs from the input when sanitized.
    Passed(String),
    Blocked { guardrail: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct GuardrailChecker {
    registry: Arc<GuardrailRegistry>,
    audit: AuditLog,
}

impl GuardrailChecker {
    pub fn new(registry: Arc<GuardrailRegistry>, audit: AuditLog) -> Self {
        Self { registry, audit }
    }

    pub fn registry(&self) -> &GuardrailRegistry {
        &self.registry
    }

    /// Runs the named guardrails in order. The first violation short-circuits;
    /// a sanitizing verdict replaces the payload seen by later guardrails.
    pub fn check(
        &self,
        run_id: &str,
        agent: &str,
        stage: GuardrailStage,
        names: &[String],
        payload: &str,
    ) -> GuardrailOutcome {
        let mut current = payload.to_string();

        for name in names {
            let Some(guardrail) = self.registry.get(name) else {
                tracing::warn!(guardrail = %name, agent = %agent, "Unknown guardrail; skipping");
                continue;
            };
            if !guardrail.applies_to(stage) {
                continue;
            }

            let verdict = guardrail.check(stage, &current);
            if !verdict.allowed {
                let reason = verdict
                    .reason
                    .unwrap_or_else(|| "blocked by guardrail".to_string());
                tracing::warn!(
                    guardrail = %name,
                    agent = %agent,
                    stage = %stage,
                    "Guardrail blocked content"
                );
                self.audit.record(
                    run_id,
                    "guardrail.blocked",
                    json!({ "guardrail": name, "agent": agent, "stage": stage, "reason": reason }),
                );
                return GuardrailOutcome::Blocked {
                    guardrail: name.clone(),
                    reason,
                };
            }

            if let Some(modified) = verdict.modified {
                tracing::warn!(
                    guardrail = %name,
                    agent = %agent,
                    stage = %stage,
                    "Guardrail sanitized content"
                );
                self.audit.record(
                    run_id,
                    "guardrail.sanitized",
                    json!({ "guardrail": name, "agent": agent, "stage": stage, "reason": verdict.reason }),
                );
                current = modified;
            }
        }

        GuardrailOutcome::Passed(current)
    }
}
