use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditLog, unix_ms_now};
use crate::context::{RuntimeContext, resolve};
use crate::definition::{WorkflowDefinition, WorkflowPattern};
use crate::error::{ToolError, WorkflowError};
use crate::guardrail::{GuardrailChecker, GuardrailOutcome, GuardrailRegistry, GuardrailStage};
use crate::handoff::HandoffRouter;
use crate::hooks::{HookEvent, HookExecutor, HookPoint};
use crate::reasoning::{Message, ReasoningCaller, ReasoningClient, RetryPolicy};
use crate::sandbox::{
    ApprovalDecision, BatchOutcome, BatchScope, ExternalToolTransport, HostedToolBackend,
    Interruption, NestedAgentRunner, PendingBatch, SandboxPolicy, ToolExecutionSandbox,
};
use crate::session::{AgentSession, SessionTrace, StepOutcome};
use crate::tools::ToolRegistry;

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Completed,
    Failed,
    MaxTurnsExceeded,
    GuardrailBlocked,
}

impl WorkflowStatus {
    pub fn label(self) -> &'static str {
        match self {
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::MaxTurnsExceeded => "max_turns_exceeded",
            WorkflowStatus::GuardrailBlocked => "guardrail_blocked",
        }
    }

    pub fn exit_code(self) -> i32 {
        match self {
            WorkflowStatus::Completed => 0,
            WorkflowStatus::Failed => 1,
            WorkflowStatus::MaxTurnsExceeded => 3,
            WorkflowStatus::GuardrailBlocked => 4,
        }
    }
}

/// Exit code for a run that stopped on pending approvals.
pub const INTERRUPTED_EXIT_CODE: i32 = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowResult {
    pub run_id: String,
    pub status: WorkflowStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_session: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_agent: Option<String>,
    /// Turn number of the last session in control.
    pub turn: u32,
    /// Reasoning calls charged against the workflow budget.
    pub turns_used: u32,
    pub trace: Vec<SessionTrace>,
}

impl WorkflowResult {
    pub fn is_completed(&self) -> bool {
        self.status == WorkflowStatus::Completed
    }
}

#[derive(Debug)]
pub enum RunOutcome {
    Finished(WorkflowResult),
    Interrupted(InterruptedRun),
}

impl RunOutcome {
    pub fn finished(self) -> Option<WorkflowResult> {
        match self {
            RunOutcome::Finished(result) => Some(result),
            RunOutcome::Interrupted(_) => None,
        }
    }

    pub fn interrupted(self) -> Option<InterruptedRun> {
        match self {
            RunOutcome::Interrupted(run) => Some(run),
            RunOutcome::Finished(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Lanes
// ---------------------------------------------------------------------------

/// One independent chain of sessions. A handoff-chain run has a single lane;
/// sequential and parallel runs have one lane per listed agent.
#[derive(Debug, Clone)]
struct Lane {
    root: String,
    input: Option<String>,
    sessions: Vec<AgentSession>,
    pending: Option<PendingBatch>,
    output: Option<String>,
}

impl Lane {
    fn new(root: String, input: Option<String>) -> Self {
        Self {
            root,
            input,
            sessions: Vec::new(),
            pending: None,
            output: None,
        }
    }

    fn is_done(&self) -> bool {
        self.output.is_some()
    }

    fn fail_current(&mut self, reason: &str) {
        if let Some(session) = self.sessions.last_mut() {
            session.fail(reason);
        }
    }
}

#[derive(Debug, Clone)]
struct RunFailure {
    status: WorkflowStatus,
    reason: String,
    error_kind: Option<String>,
}

enum LaneResult {
    Finished(String),
    Interrupted,
    Failed(RunFailure),
}

enum DriveResult {
    Finished(String),
    Interrupted,
    Failed(RunFailure),
}

/// Shared per-workflow count of reasoning calls.
#[derive(Debug)]
struct TurnBudget {
    limit: u32,
    used: AtomicU32,
}

impl TurnBudget {
    fn new(limit: u32, used: u32) -> Self {
        Self {
            limit,
            used: AtomicU32::new(used),
        }
    }

    fn try_consume(&self) -> bool {
        self.used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                (used < self.limit).then_some(used + 1)
            })
            .is_ok()
    }

    fn used(&self) -> u32 {
        self.used.load(Ordering::SeqCst)
    }
}

struct RunState {
    run_id: String,
    definition: Arc<WorkflowDefinition>,
    budget: TurnBudget,
    cancel: CancellationToken,
    timed_out: Arc<AtomicBool>,
    next_session: AtomicU32,
}

impl RunState {
    fn next_session_id(&self) -> String {
        let seq = self.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-s{seq}", self.run_id)
    }

    fn stop_failure(&self) -> RunFailure {
        if self.timed_out.load(Ordering::SeqCst) {
            RunFailure {
                status: WorkflowStatus::Failed,
                reason: "timeout".to_string(),
                error_kind: Some("timeout".to_string()),
            }
        } else {
            RunFailure {
                status: WorkflowStatus::Failed,
                reason: "cancelled".to_string(),
                error_kind: Some("cancelled".to_string()),
            }
        }
    }

    fn classify(&self, err: &WorkflowError) -> RunFailure {
        match err {
            WorkflowError::Cancelled | WorkflowError::Timeout(_) => self.stop_failure(),
            WorkflowError::MaxTurnsExceeded { .. } => RunFailure {
                status: WorkflowStatus::MaxTurnsExceeded,
                reason: err.to_string(),
                error_kind: Some(err.kind().to_string()),
            },
            WorkflowError::GuardrailViolation { .. } => RunFailure {
                status: WorkflowStatus::GuardrailBlocked,
                reason: err.to_string(),
                error_kind: Some(err.kind().to_string()),
            },
            _ => RunFailure {
                status: WorkflowStatus::Failed,
                reason: err.to_string(),
                error_kind: Some(err.kind().to_string()),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Interrupted runs
// ---------------------------------------------------------------------------

/// A run paused on tool calls that need an external decision.
#[derive(Debug)]
pub struct InterruptedRun {
    run_id: String,
    definition: Arc<WorkflowDefinition>,
    lanes: Vec<Lane>,
    turns_used: u32,
    next_session: u32,
    elapsed: Duration,
}

impl InterruptedRun {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn turns_used(&self) -> u32 {
        self.turns_used
    }

    /// Suspended calls without a decision yet.
    pub fn interruptions(&self) -> Vec<Interruption> {
        self.lanes
            .iter()
            .filter_map(|lane| lane.pending.as_ref())
            .flat_map(PendingBatch::interruptions)
            .collect()
    }

    pub fn approve(&mut self, interruption: &Interruption) -> bool {
        self.decide(interruption, ApprovalDecision::Approve)
    }

    pub fn reject(&mut self, interruption: &Interruption, reason: impl Into<String>) -> bool {
        self.decide(
            interruption,
            ApprovalDecision::Reject {
                reason: reason.into(),
            },
        )
    }

    pub fn approve_all(&mut self) {
        for interruption in self.interruptions() {
            self.approve(&interruption);
        }
    }

    fn decide(&mut self, interruption: &Interruption, decision: ApprovalDecision) -> bool {
        self.lanes
            .iter_mut()
            .filter_map(|lane| lane.pending.as_mut())
            .any(|pending| {
                pending.decide(&interruption.session_id, &interruption.call_id, decision.clone())
            })
    }

    pub fn trace(&self) -> Vec<SessionTrace> {
        self.lanes
            .iter()
            .flat_map(|lane| lane.sessions.iter().map(AgentSession::trace))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

static RUN_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_run_id() -> String {
    let seq = RUN_COUNTER.fetch_add(1, Ordering::SeqCst) + 1;
    format!("run-{}-{}-{seq}", unix_ms_now(), std::process::id())
}

struct EngineInner {
    caller: ReasoningCaller,
    tools: Arc<ToolRegistry>,
    guardrails: GuardrailChecker,
    sandbox: ToolExecutionSandbox,
    router: HandoffRouter,
    hooks: Arc<HookExecutor>,
    audit: AuditLog,
    context: RuntimeContext,
}

/// Runs workflow definitions. Cheap to clone; all clones share the same
/// immutable registries and audit sink.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

pub struct WorkflowEngineBuilder {
    client: Arc<dyn ReasoningClient>,
    tools: ToolRegistry,
    guardrails: GuardrailRegistry,
    policy: SandboxPolicy,
    retry: RetryPolicy,
    audit: AuditLog,
    hooks: HookExecutor,
    context: RuntimeContext,
    router: Option<HandoffRouter>,
    hosted: Option<Arc<dyn HostedToolBackend>>,
    transport: Option<Arc<dyn ExternalToolTransport>>,
}

impl WorkflowEngineBuilder {
    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn guardrails(mut self, guardrails: GuardrailRegistry) -> Self {
        self.guardrails = guardrails;
        self
    }

    pub fn sandbox_policy(mut self, policy: SandboxPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn audit(mut self, audit: AuditLog) -> Self {
        self.audit = audit;
        self
    }

    pub fn hooks(mut self, hooks: HookExecutor) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn runtime_context(mut self, context: RuntimeContext) -> Self {
        self.context = context;
        self
    }

    /// Replaces the default router; its audit sink is kept as configured.
    pub fn router(mut self, router: HandoffRouter) -> Self {
        self.router = Some(router);
        self
    }

    pub fn hosted_backend(mut self, backend: Arc<dyn HostedToolBackend>) -> Self {
        self.hosted = Some(backend);
        self
    }

    pub fn external_transport(mut self, transport: Arc<dyn ExternalToolTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn build(self) -> WorkflowEngine {
        let tools = Arc::new(self.tools);
        let hooks = Arc::new(self.hooks);

        let mut sandbox = ToolExecutionSandbox::new(tools.clone(), self.policy, self.audit.clone())
            .with_hooks(hooks.clone());
        if let Some(backend) = self.hosted {
            sandbox = sandbox.with_hosted_backend(backend);
        }
        if let Some(transport) = self.transport {
            sandbox = sandbox.with_external_transport(transport);
        }

        let mut router = self
            .router
            .unwrap_or_else(|| HandoffRouter::new(self.audit.clone()));
        if !hooks.is_empty() {
            router = router.with_hook(hooks.clone());
        }

        WorkflowEngine {
            inner: Arc::new(EngineInner {
                caller: ReasoningCaller::new(self.client, self.retry, self.audit.clone()),
                tools,
                guardrails: GuardrailChecker::new(Arc::new(self.guardrails), self.audit.clone()),
                sandbox,
                router,
                hooks,
                audit: self.audit,
                context: self.context,
            }),
        }
    }
}

impl WorkflowEngine {
    pub fn builder(client: Arc<dyn ReasoningClient>) -> WorkflowEngineBuilder {
        WorkflowEngineBuilder {
            client,
            tools: ToolRegistry::new(),
            guardrails: GuardrailRegistry::new(),
            policy: SandboxPolicy::default(),
            retry: RetryPolicy::default(),
            audit: AuditLog::disabled(),
            hooks: HookExecutor::default(),
            context: RuntimeContext::default(),
            router: None,
            hosted: None,
            transport: None,
        }
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.inner.tools
    }

    pub fn guardrails(&self) -> &GuardrailRegistry {
        self.inner.guardrails.registry()
    }

    pub fn audit(&self) -> &AuditLog {
        &self.inner.audit
    }

    /// Definition-only validation against this engine's registries.
    pub fn validate(&self, definition: &WorkflowDefinition) -> Result<(), WorkflowError> {
        definition
            .validate(&self.inner.tools, self.inner.guardrails.registry())
            .into_result()
    }

    pub async fn run(
        &self,
        definition: Arc<WorkflowDefinition>,
        input: &str,
    ) -> Result<RunOutcome, WorkflowError> {
        self.run_with_cancellation(definition, input, CancellationToken::new())
            .await
    }

    /// Like `run`, stopping with status `failed` (reason `cancelled`) once
    /// `cancel` fires.
    pub async fn run_with_cancellation(
        &self,
        definition: Arc<WorkflowDefinition>,
        input: &str,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, WorkflowError> {
        self.validate(&definition)?;

        let run_id = next_run_id();
        let pattern = definition.workflow.pattern;
        tracing::info!(
            run_id = %run_id,
            entry_point = %definition.entry_point(),
            pattern = pattern.label(),
            max_turns = definition.workflow.max_turns,
            "Workflow run started"
        );
        self.inner.audit.record(
            &run_id,
            "run.started",
            json!({
                "entry_point": definition.entry_point(),
                "pattern": pattern.label(),
                "max_turns": definition.workflow.max_turns,
                "timeout_seconds": definition.workflow.timeout_seconds,
                "input_chars": input.chars().count()
            }),
        );
        self.inner
            .hooks
            .run(
                HookPoint::RunStarted,
                &HookEvent::for_run(&run_id, Some(definition.entry_point()), Some(input)),
            )
            .await;

        let roots = definition.lane_roots();
        let lanes = roots
            .into_iter()
            .enumerate()
            .map(|(index, root)| {
                let lane_input = match pattern {
                    WorkflowPattern::Sequential if index > 0 => None,
                    _ => Some(input.to_string()),
                };
                Lane::new(root, lane_input)
            })
            .collect::<Vec<Lane>>();

        let interrupted = InterruptedRun {
            run_id,
            definition,
            lanes,
            turns_used: 0,
            next_session: 0,
            elapsed: Duration::ZERO,
        };
        Ok(self.continue_run(interrupted, cancel).await)
    }

    /// Continues an interrupted run with the decisions recorded on it.
    pub async fn resume(&self, run: InterruptedRun) -> RunOutcome {
        self.resume_with_cancellation(run, CancellationToken::new())
            .await
    }

    pub async fn resume_with_cancellation(
        &self,
        run: InterruptedRun,
        cancel: CancellationToken,
    ) -> RunOutcome {
        tracing::info!(run_id = %run.run_id, "Workflow run resumed");
        self.continue_run(run, cancel).await
    }

    async fn continue_run(&self, saved: InterruptedRun, cancel: CancellationToken) -> RunOutcome {
        let InterruptedRun {
            run_id,
            definition,
            mut lanes,
            turns_used,
            next_session,
            elapsed,
        } = saved;

        let timeout = Duration::from_secs(definition.workflow.timeout_seconds);
        let remaining = timeout.saturating_sub(elapsed);
        let run = RunState {
            run_id,
            budget: TurnBudget::new(definition.workflow.max_turns, turns_used),
            definition,
            cancel: cancel.child_token(),
            timed_out: Arc::new(AtomicBool::new(false)),
            next_session: AtomicU32::new(next_session),
        };

        let watchdog = tokio::spawn({
            let token = run.cancel.clone();
            let flag = run.timed_out.clone();
            async move {
                tokio::time::sleep(remaining).await;
                flag.store(true, Ordering::SeqCst);
                token.cancel();
            }
        });
        let started = Instant::now();
        let driven = self.drive(&run, &mut lanes).await;
        watchdog.abort();
        let elapsed = elapsed + started.elapsed();

        match driven {
            DriveResult::Interrupted => {
                let interrupted = InterruptedRun {
                    run_id: run.run_id.clone(),
                    definition: run.definition.clone(),
                    lanes,
                    turns_used: run.budget.used(),
                    next_session: run.next_session.load(Ordering::SeqCst),
                    elapsed,
                };
                let pending = interrupted
                    .interruptions()
                    .into_iter()
                    .map(|interruption| interruption.call_id)
                    .collect::<Vec<String>>();
                tracing::info!(
                    run_id = %run.run_id,
                    pending = pending.len(),
                    "Workflow run interrupted for approval"
                );
                self.inner.audit.record(
                    &run.run_id,
                    "run.interrupted",
                    json!({ "pending": pending, "turns_used": run.budget.used() }),
                );
                RunOutcome::Interrupted(interrupted)
            }
            DriveResult::Finished(output) => {
                RunOutcome::Finished(self.finish(&run, &lanes, Ok(output)).await)
            }
            DriveResult::Failed(failure) => {
                for lane in &mut lanes {
                    lane.fail_current(&failure.reason);
                }
                RunOutcome::Finished(self.finish(&run, &lanes, Err(failure)).await)
            }
        }
    }

    async fn finish(
        &self,
        run: &RunState,
        lanes: &[Lane],
        outcome: Result<String, RunFailure>,
    ) -> WorkflowResult {
        let trace = lanes
            .iter()
            .flat_map(|lane| lane.sessions.iter().map(AgentSession::trace))
            .collect::<Vec<SessionTrace>>();
        let last = lanes.iter().rev().find_map(|lane| lane.sessions.last());

        let (status, output, reason, error_kind) = match outcome {
            Ok(output) => (WorkflowStatus::Completed, Some(output), None, None),
            Err(failure) => (
                failure.status,
                None,
                Some(failure.reason),
                failure.error_kind,
            ),
        };

        let result = WorkflowResult {
            run_id: run.run_id.clone(),
            status,
            output,
            reason,
            error_kind,
            last_session: last.map(|session| session.id.clone()),
            last_agent: last.map(|session| session.agent().to_string()),
            turn: last.map(AgentSession::turns).unwrap_or(0),
            turns_used: run.budget.used(),
            trace,
        };

        tracing::info!(
            run_id = %result.run_id,
            status = result.status.label(),
            turns_used = result.turns_used,
            sessions = result.trace.len(),
            "Workflow run finished"
        );
        self.inner.audit.record(
            &result.run_id,
            "run.finished",
            json!({
                "status": result.status.label(),
                "reason": result.reason,
                "error_kind": result.error_kind,
                "turns_used": result.turns_used,
                "sessions": result.trace.len(),
                "last_session": result.last_session
            }),
        );
        self.inner
            .hooks
            .run(
                HookPoint::RunFinished,
                &HookEvent::for_run(
                    &result.run_id,
                    result.last_agent.as_deref(),
                    result.output.as_deref().or(result.reason.as_deref()),
                ),
            )
            .await;

        result
    }

    async fn drive(&self, run: &RunState, lanes: &mut [Lane]) -> DriveResult {
        match run.definition.workflow.pattern {
            WorkflowPattern::HandoffChain | WorkflowPattern::Sequential => {
                let mut previous: Option<String> = None;
                for lane in lanes.iter_mut() {
                    if let Some(output) = &lane.output {
                        previous = Some(output.clone());
                        continue;
                    }
                    if lane.input.is_none() {
                        lane.input = previous.take();
                    }
                    match self.drive_lane(run, lane, None).await {
                        LaneResult::Finished(output) => previous = Some(output),
                        LaneResult::Interrupted => return DriveResult::Interrupted,
                        LaneResult::Failed(failure) => return DriveResult::Failed(failure),
                    }
                }
                DriveResult::Finished(previous.unwrap_or_default())
            }
            WorkflowPattern::Parallel => {
                let branches = lanes
                    .iter_mut()
                    .filter(|lane| !lane.is_done())
                    .map(|lane| self.drive_lane(run, lane, None));
                let results = join_all(branches).await;

                let mut interrupted = false;
                for result in results {
                    match result {
                        LaneResult::Failed(failure) => return DriveResult::Failed(failure),
                        LaneResult::Interrupted => interrupted = true,
                        LaneResult::Finished(_) => {}
                    }
                }
                if interrupted {
                    return DriveResult::Interrupted;
                }

                let outputs = lanes
                    .iter()
                    .map(|lane| {
                        (
                            lane.root.clone(),
                            Value::String(lane.output.clone().unwrap_or_default()),
                        )
                    })
                    .collect::<BTreeMap<String, Value>>();
                DriveResult::Finished(Value::Object(outputs.into_iter().collect()).to_string())
            }
        }
    }

    fn activate(&self, run: &RunState, lane: &mut Lane, session: AgentSession, nested: bool) {
        tracing::info!(
            run_id = %run.run_id,
            session_id = %session.id,
            agent = %session.agent(),
            nested = nested,
            "Session activated"
        );
        self.inner.audit.record(
            &run.run_id,
            "session.activated",
            json!({
                "session_id": session.id,
                "agent": session.agent(),
                "nested": nested,
                "history": session.history.len()
            }),
        );
        lane.sessions.push(session);
    }

    /// Drives one lane until its agent chain produces a final output, stops on
    /// an interruption, or fails.
    async fn drive_lane(
        &self,
        run: &RunState,
        lane: &mut Lane,
        nested_depth: Option<u32>,
    ) -> LaneResult {
        let inner = &self.inner;

        if lane.sessions.is_empty() {
            let input = lane.input.clone().unwrap_or_default();
            let Some(root) = run.definition.agent(&lane.root) else {
                return LaneResult::Failed(RunFailure {
                    status: WorkflowStatus::Failed,
                    reason: format!("agent '{}' is not defined", lane.root),
                    error_kind: Some("configuration_error".to_string()),
                });
            };
            let config = resolve(root, &inner.context, &inner.tools);
            let input = match inner.guardrails.check(
                &run.run_id,
                &config.name,
                GuardrailStage::Input,
                &config.guardrails,
                &input,
            ) {
                GuardrailOutcome::Passed(input) => input,
                GuardrailOutcome::Blocked { guardrail, reason } => {
                    return LaneResult::Failed(run.classify(&WorkflowError::GuardrailViolation {
                        guardrail,
                        stage: GuardrailStage::Input.to_string(),
                        reason,
                    }));
                }
            };
            if nested_depth.is_none() {
                inner
                    .hooks
                    .run(
                        HookPoint::AgentActivated,
                        &HookEvent::for_run(&run.run_id, Some(&config.name), Some(&input)),
                    )
                    .await;
            }
            let session = AgentSession::new(run.next_session_id(), config, vec![Message::user(input)]);
            self.activate(run, lane, session, nested_depth.is_some());
        }

        let nested = NestedRun {
            engine: self,
            run,
            depth: nested_depth.map_or(1, |depth| depth + 1),
        };

        loop {
            if let Some(pending) = lane.pending.take() {
                let Some(session) = lane.sessions.last_mut() else {
                    return LaneResult::Failed(internal_failure("lane has no session"));
                };
                let scope = BatchScope {
                    run_id: &run.run_id,
                    agent: &session.config.name,
                    permitted_tools: &session.config.tools,
                    nested: Some(&nested),
                };
                match inner.sandbox.resume_batch(&scope, pending, &run.cancel).await {
                    BatchOutcome::Completed(results) => {
                        if let Err(err) = session.record_tool_results(&results) {
                            return LaneResult::Failed(run.classify(&err));
                        }
                    }
                    BatchOutcome::Interrupted(pending) => {
                        lane.pending = Some(pending);
                        return LaneResult::Interrupted;
                    }
                }
            }

            if run.cancel.is_cancelled() {
                return LaneResult::Failed(run.stop_failure());
            }
            let Some(session) = lane.sessions.last() else {
                return LaneResult::Failed(internal_failure("lane has no session"));
            };
            if let Err(err) = session.check_turn_limit() {
                return LaneResult::Failed(run.classify(&err));
            }
            if !run.budget.try_consume() {
                let limit = run.definition.workflow.max_turns;
                tracing::warn!(run_id = %run.run_id, limit = limit, "Workflow turn budget exhausted");
                return LaneResult::Failed(run.classify(&WorkflowError::MaxTurnsExceeded {
                    limit,
                    scope: "turns for the workflow".to_string(),
                }));
            }

            let Some(session) = lane.sessions.last_mut() else {
                return LaneResult::Failed(internal_failure("lane has no session"));
            };
            let outcome = session
                .step(&inner.caller, &inner.tools, &run.run_id, &run.cancel)
                .await;

            match outcome {
                StepOutcome::FinalOutput(text) => {
                    let checked = inner.guardrails.check(
                        &run.run_id,
                        session.agent(),
                        GuardrailStage::Output,
                        &session.config.guardrails,
                        &text,
                    );
                    let output = match checked {
                        GuardrailOutcome::Passed(output) => output,
                        GuardrailOutcome::Blocked { guardrail, reason } => {
                            return LaneResult::Failed(run.classify(
                                &WorkflowError::GuardrailViolation {
                                    guardrail,
                                    stage: GuardrailStage::Output.to_string(),
                                    reason,
                                },
                            ));
                        }
                    };
                    if let Err(err) = session.complete(text) {
                        return LaneResult::Failed(run.classify(&err));
                    }
                    lane.output = Some(output.clone());
                    return LaneResult::Finished(output);
                }
                StepOutcome::ToolCallsPending(calls) => {
                    let scope = BatchScope {
                        run_id: &run.run_id,
                        agent: &session.config.name,
                        permitted_tools: &session.config.tools,
                        nested: Some(&nested),
                    };
                    match inner.sandbox.execute_batch(&scope, calls, &run.cancel).await {
                        BatchOutcome::Completed(results) => {
                            if let Err(err) = session.record_tool_results(&results) {
                                return LaneResult::Failed(run.classify(&err));
                            }
                        }
                        BatchOutcome::Interrupted(pending) => {
                            if let Err(err) = session.await_approval() {
                                return LaneResult::Failed(run.classify(&err));
                            }
                            lane.pending = Some(pending);
                            return LaneResult::Interrupted;
                        }
                    }
                }
                StepOutcome::HandoffRequested(request) => {
                    if nested_depth.is_some() {
                        return LaneResult::Failed(run.classify(&WorkflowError::Routing(format!(
                            "agent '{}' cannot hand off while running as a tool",
                            request.from_agent
                        ))));
                    }
                    let routed = inner
                        .router
                        .route(
                            &run.run_id,
                            &run.definition,
                            session,
                            &request,
                            &inner.context,
                            &inner.tools,
                            run.next_session_id(),
                        )
                        .await;
                    let next = match routed {
                        Ok(next) => next,
                        Err(err) => return LaneResult::Failed(run.classify(&err)),
                    };
                    if let Err(err) = session.mark_handed_off(&request.target) {
                        return LaneResult::Failed(run.classify(&err));
                    }
                    self.activate(run, lane, next, false);
                }
                StepOutcome::Error(err) => return LaneResult::Failed(run.classify(&err)),
            }
        }
    }
}

fn internal_failure(reason: &str) -> RunFailure {
    RunFailure {
        status: WorkflowStatus::Failed,
        reason: reason.to_string(),
        error_kind: Some("internal".to_string()),
    }
}

/// Agent-as-tool execution: a fresh lane rooted at the target agent that
/// shares the parent's turn budget and cancellation.
struct NestedRun<'a> {
    engine: &'a WorkflowEngine,
    run: &'a RunState,
    depth: u32,
}

#[async_trait]
impl NestedAgentRunner for NestedRun<'_> {
    async fn run_agent(&self, agent: &str, input: String) -> Result<String, ToolError> {
        let mut lane = Lane::new(agent.to_string(), Some(input));
        let result = self
            .engine
            .drive_lane(self.run, &mut lane, Some(self.depth))
            .await;
        match result {
            LaneResult::Finished(output) => Ok(output),
            LaneResult::Interrupted => {
                lane.fail_current("approval required");
                Err(ToolError::new(
                    "approval_required",
                    format!("agent '{agent}' requested a tool that needs approval"),
                ))
            }
            LaneResult::Failed(failure) => {
                lane.fail_current(&failure.reason);
                Err(ToolError::new("agent_failed", failure.reason))
            }
        }
    }
}
