//! Agent run orchestrator.
//!
//! Drives one [`AgentRun`] through plan → policy → approval → execute until a
//! terminal status. The orchestrator is a pure coordinator: every durable
//! effect goes through the gateway, every observable effect through the bus,
//! and every suspension point honors both the cancel token and the run
//! deadline.
//!
//! Decision order after each phase is fixed: deadline, then step budget, then
//! produced output, then blocked-without-output (which yields a deterministic
//! clarification so the user always hears back), then another plan call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::approval::{ApprovalError, ApprovalOutcome};
use crate::gateway::Gateway;
use crate::llm::{normalize, ChatTurn, PlanOutcome, PlanRequest, Role, ToolDescriptor};
use crate::policy::{evaluate_tool, ToolDecision};
use crate::tools::{ToolPermission, ToolSpec};
use crate::types::{
    AgentRun, ChatMessage, Direction, EventKind, RunError, RunErrorKind, RunStatus,
};

/// Cooperative cancellation flag, observed at every suspension point.
#[derive(Debug, Default)]
pub struct CancelToken {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    /// Fresh, un-canceled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Whether cancellation was requested.
    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Resolve once cancellation is requested.
    pub async fn cancelled(&self) {
        while !self.is_canceled() {
            // Register with the notifier before re-checking the flag, so a
            // cancel between check and await cannot be missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_canceled() {
                return;
            }
            notified.await;
        }
    }
}

/// Registered handle for a spawned orchestrator task.
#[derive(Debug)]
pub struct RunHandle {
    /// Cancellation entry point.
    pub token: Arc<CancelToken>,
    /// Task handle, abortable after the shutdown grace period.
    pub join: JoinHandle<()>,
}

/// Result of racing a future against cancellation and the run deadline.
enum Raced<T> {
    Done(T),
    Canceled,
    DeadlineExpired,
}

async fn race<F, T>(token: &CancelToken, deadline: DateTime<Utc>, fut: F) -> Raced<T>
where
    F: std::future::Future<Output = T>,
{
    let remaining = deadline
        .signed_duration_since(Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO);
    tokio::select! {
        _ = token.cancelled() => Raced::Canceled,
        _ = tokio::time::sleep(remaining) => Raced::DeadlineExpired,
        out = fut => Raced::Done(out),
    }
}

/// Spawn the orchestrator task for a freshly persisted run.
///
/// The task idles on the returned latch until the caller has registered the
/// handle, so its end-of-life deregistration can never race the insert.
pub(crate) fn spawn(gateway: Gateway, run: AgentRun) -> (RunHandle, tokio::sync::oneshot::Sender<()>) {
    let token = Arc::new(CancelToken::new());
    let task_token = Arc::clone(&token);
    let run_id = run.run_id;
    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        // A dropped latch still lets the run proceed.
        let _ = ready_rx.await;
        drive(gateway.clone(), run, task_token).await;
        gateway.deregister_run(run_id);
    });
    (RunHandle { token, join }, ready_tx)
}

/// Terminal disposition decided by the state machine.
struct Terminal {
    status: RunStatus,
    output: Option<String>,
    error: Option<RunError>,
    summary: String,
}

impl Terminal {
    fn completed(output: Option<String>, summary: &str) -> Self {
        Self {
            status: RunStatus::Completed,
            output,
            error: None,
            summary: summary.to_owned(),
        }
    }

    fn failed(kind: RunErrorKind, message: &str) -> Self {
        Self {
            status: RunStatus::Failed,
            output: None,
            error: Some(RunError {
                kind,
                message: message.to_owned(),
            }),
            summary: message.to_owned(),
        }
    }

    fn canceled() -> Self {
        Self {
            status: RunStatus::Canceled,
            output: None,
            error: Some(RunError {
                kind: RunErrorKind::Canceled,
                message: "canceled by operator".to_owned(),
            }),
            summary: "canceled by operator".to_owned(),
        }
    }

    fn timed_out() -> Self {
        Self {
            status: RunStatus::TimedOut,
            output: None,
            error: Some(RunError {
                kind: RunErrorKind::RunTimeout,
                message: "run deadline expired".to_owned(),
            }),
            summary: "run deadline expired".to_owned(),
        }
    }
}

/// Drive the run to its terminal event.
async fn drive(gateway: Gateway, run: AgentRun, token: Arc<CancelToken>) {
    let run_id = run.run_id;
    info!(%run_id, chat = %run.chat_id, "run started");

    let terminal = match drive_inner(&gateway, &run, &token).await {
        Ok(terminal) => terminal,
        Err(err) => {
            error!(%run_id, error = %err, "run failed internally");
            Terminal::failed(RunErrorKind::Internal, "internal error")
        }
    };

    gateway
        .finalize_run(
            run_id,
            terminal.status,
            terminal.output.as_deref(),
            terminal.error.as_ref(),
            &terminal.summary,
        )
        .await;
}

async fn drive_inner(
    gateway: &Gateway,
    run: &AgentRun,
    token: &CancelToken,
) -> anyhow::Result<Terminal> {
    let run_id = run.run_id;

    // build_context
    gateway
        .publish(
            EventKind::RunProgress,
            Some(run_id),
            Some(run.channel_id.clone()),
            json!({ "run_id": run_id, "step": 0, "phase": "start" }),
        )
        .await;

    let history = gateway.run_history(&run.chat_id).await?;
    let mut transcript = transcript_from_history(&history);
    if transcript.is_empty() {
        // A run is always anchored to at least its own prompt.
        transcript.push(ChatTurn {
            role: Role::User,
            content: "(no prompt)".to_owned(),
        });
    }

    let mut step: u32 = 0;
    let mut blocked_reason: Option<String> = None;

    loop {
        // decide: deadline, then step budget, then blocked-without-output.
        if token.is_canceled() {
            return Ok(Terminal::canceled());
        }
        if Utc::now() >= run.deadline {
            return Ok(Terminal::timed_out());
        }
        if step >= run.max_steps {
            return Ok(Terminal::failed(
                RunErrorKind::StepLimit,
                "step limit reached",
            ));
        }
        if let Some(reason) = blocked_reason.take() {
            return Ok(clarify(gateway, run, &reason).await);
        }

        // plan
        step = step.saturating_add(1);
        gateway
            .mark_run(run_id, RunStatus::Planning, step)
            .await?;

        let request = PlanRequest {
            system: system_prompt(run),
            transcript: transcript.clone(),
            tools: tool_descriptors(gateway),
        };
        let llm = gateway.llm();
        let planned = match race(token, run.deadline, llm.plan(&request)).await {
            Raced::Canceled => return Ok(Terminal::canceled()),
            Raced::DeadlineExpired => return Ok(Terminal::timed_out()),
            Raced::Done(result) => result,
        };

        gateway
            .publish(
                EventKind::RunProgress,
                Some(run_id),
                Some(run.channel_id.clone()),
                json!({ "run_id": run_id, "step": step, "phase": "plan_end" }),
            )
            .await;

        let outcome = match planned {
            Ok(completion) => normalize(completion),
            Err(err) => {
                // Retries and the circuit breaker already ran inside the
                // resilient client; whatever reaches here is final.
                warn!(%run_id, error = %err, "planner unavailable");
                return Ok(Terminal::failed(
                    RunErrorKind::LlmUnavailable,
                    "language model unavailable",
                ));
            }
        };

        match outcome {
            PlanOutcome::Text(text) => {
                gateway
                    .publish(
                        EventKind::RunOutput,
                        Some(run_id),
                        Some(run.channel_id.clone()),
                        json!({ "run_id": run_id, "text": text }),
                    )
                    .await;
                return Ok(Terminal::completed(Some(text), "completed"));
            }
            PlanOutcome::Abstain => {
                blocked_reason = Some("the model declined to answer".to_owned());
            }
            PlanOutcome::Tool {
                name,
                args,
                note,
                discarded,
            } => {
                if discarded > 0 {
                    gateway
                        .publish(
                            EventKind::RunProgress,
                            Some(run_id),
                            Some(run.channel_id.clone()),
                            json!({
                                "run_id": run_id,
                                "step": step,
                                "phase": "multi_tool_discarded",
                                "discarded": discarded,
                            }),
                        )
                        .await;
                }
                if let Some(note) = note {
                    transcript.push(ChatTurn {
                        role: Role::Assistant,
                        content: note,
                    });
                }

                // policy_check
                let policy = gateway.policy_snapshot();
                let registry = gateway.registry_snapshot();
                match evaluate_tool(&policy, &registry, &name, &args) {
                    ToolDecision::Deny(reason) => {
                        gateway
                            .publish(
                                EventKind::SecurityBlocked,
                                Some(run_id),
                                Some(run.channel_id.clone()),
                                json!({
                                    "run_id": run_id,
                                    "reason": reason.as_str(),
                                    "tool": name,
                                }),
                            )
                            .await;
                        blocked_reason =
                            Some(format!("tool {name} was blocked ({})", reason.as_str()));
                    }
                    ToolDecision::ApprovalRequired => {
                        let Some(spec) = registry.get(&name).cloned() else {
                            // evaluate_tool verified existence; losing the
                            // spec here means a reload raced us.
                            blocked_reason = Some(format!("tool {name} disappeared"));
                            continue;
                        };
                        match await_approval(gateway, run, token, &spec, &args, step).await? {
                            ApprovalStep::Execute => {
                                if let Some(terminal) = execute_tool(
                                    gateway,
                                    run,
                                    token,
                                    &spec,
                                    &args,
                                    step,
                                    &mut transcript,
                                )
                                .await?
                                {
                                    return Ok(terminal);
                                }
                            }
                            ApprovalStep::Blocked(reason) => blocked_reason = Some(reason),
                            ApprovalStep::Terminal(terminal) => return Ok(terminal),
                        }
                    }
                    ToolDecision::Allow => {
                        let Some(spec) = registry.get(&name).cloned() else {
                            blocked_reason = Some(format!("tool {name} disappeared"));
                            continue;
                        };
                        if let Some(terminal) = execute_tool(
                            gateway,
                            run,
                            token,
                            &spec,
                            &args,
                            step,
                            &mut transcript,
                        )
                        .await?
                        {
                            return Ok(terminal);
                        }
                    }
                }
            }
        }
    }
}

/// What the approval rendezvous decided.
enum ApprovalStep {
    Execute,
    Blocked(String),
    Terminal(Terminal),
}

async fn await_approval(
    gateway: &Gateway,
    run: &AgentRun,
    token: &CancelToken,
    spec: &ToolSpec,
    args: &serde_json::Value,
    step: u32,
) -> anyhow::Result<ApprovalStep> {
    let run_id = run.run_id;
    gateway
        .mark_run(run_id, RunStatus::AwaitingApproval, step)
        .await?;

    let window = Utc::now()
        .checked_add_signed(chrono::TimeDelta::seconds(
            i64::try_from(gateway.limits().approval_timeout_s).unwrap_or(i64::MAX),
        ))
        .unwrap_or(run.deadline);
    let deadline = window.min(run.deadline);

    let waiter = match gateway
        .approvals()
        .open(run_id, &spec.name, args.clone(), deadline)
    {
        Ok(waiter) => waiter,
        // Single-flight per run makes a busy slot unreachable in practice.
        Err(ApprovalError::AlreadyPending(_) | ApprovalError::NotFound(_)) => {
            return Ok(ApprovalStep::Blocked("approval slot busy".to_owned()));
        }
    };

    gateway
        .publish(
            EventKind::RunToolCall,
            Some(run_id),
            Some(run.channel_id.clone()),
            json!({
                "run_id": run_id,
                "tool": spec.name,
                "args": args,
                "approval_required": true,
            }),
        )
        .await;
    gateway
        .publish(
            EventKind::ApprovalRequired,
            Some(run_id),
            Some(run.channel_id.clone()),
            json!({
                "run_id": run_id,
                "tool": spec.name,
                "args": args,
                "deadline": deadline.to_rfc3339(),
            }),
        )
        .await;

    // The broker's own timer owns the deadline; cancellation still needs the
    // race so a canceled run does not linger in awaiting_approval.
    let outcome = tokio::select! {
        _ = token.cancelled() => return Ok(ApprovalStep::Terminal(Terminal::canceled())),
        outcome = waiter.wait() => outcome,
    };

    match outcome {
        ApprovalOutcome::Granted { by } => {
            info!(%run_id, tool = %spec.name, granted_by = %by, "approval granted");
            Ok(ApprovalStep::Execute)
        }
        ApprovalOutcome::Denied { reason } => {
            gateway
                .publish(
                    EventKind::SecurityBlocked,
                    Some(run_id),
                    Some(run.channel_id.clone()),
                    json!({
                        "run_id": run_id,
                        "reason": "approval_denied",
                        "tool": spec.name,
                        "detail": reason,
                    }),
                )
                .await;
            Ok(ApprovalStep::Blocked(format!(
                "approval for {} was denied: {reason}",
                spec.name
            )))
        }
        ApprovalOutcome::TimedOut => Ok(ApprovalStep::Terminal(Terminal::failed(
            RunErrorKind::ApprovalTimeout,
            "approval window expired",
        ))),
    }
}

/// Invoke a tool. Returns a terminal disposition for non-retriable failures,
/// `None` to continue planning.
async fn execute_tool(
    gateway: &Gateway,
    run: &AgentRun,
    token: &CancelToken,
    spec: &ToolSpec,
    args: &serde_json::Value,
    step: u32,
    transcript: &mut Vec<ChatTurn>,
) -> anyhow::Result<Option<Terminal>> {
    let run_id = run.run_id;
    gateway.mark_run(run_id, RunStatus::ToolExec, step).await?;

    gateway
        .publish(
            EventKind::RunToolCall,
            Some(run_id),
            Some(run.channel_id.clone()),
            json!({
                "run_id": run_id,
                "tool": spec.name,
                "args": args,
                "approval_required": false,
            }),
        )
        .await;

    let tool_timeout = Duration::from_secs(gateway.limits().tool_timeout_s);
    // Read tools get one retry; write tools never do.
    let attempts: u32 = if spec.permission == ToolPermission::Read {
        2
    } else {
        1
    };

    let mut last_error = String::new();
    let mut result: Option<serde_json::Value> = None;
    for attempt in 1..=attempts {
        let invoked = race(
            token,
            run.deadline,
            tokio::time::timeout(tool_timeout, spec.handler.invoke(args)),
        )
        .await;
        match invoked {
            Raced::Canceled => return Ok(Some(Terminal::canceled())),
            Raced::DeadlineExpired => return Ok(Some(Terminal::timed_out())),
            Raced::Done(Ok(Ok(value))) => {
                result = Some(value);
                break;
            }
            Raced::Done(Ok(Err(err))) => {
                last_error = err.to_string();
                warn!(%run_id, tool = %spec.name, attempt, error = %last_error, "tool failed");
            }
            Raced::Done(Err(_)) => {
                last_error = format!("timed out after {}s", tool_timeout.as_secs());
                warn!(%run_id, tool = %spec.name, attempt, "tool timed out");
            }
        }
    }

    let ok = result.is_some();
    gateway.metrics().record_tool_call(ok);
    gateway
        .publish(
            EventKind::RunProgress,
            Some(run_id),
            Some(run.channel_id.clone()),
            json!({ "run_id": run_id, "step": step, "phase": "tool_result", "ok": ok }),
        )
        .await;

    match result {
        Some(value) => {
            transcript.push(ChatTurn {
                role: Role::Assistant,
                content: format!("[tool {} returned] {value}", spec.name),
            });
            Ok(None)
        }
        None if spec.permission == ToolPermission::Write => Ok(Some(Terminal::failed(
            RunErrorKind::ToolFailed,
            &format!("write tool {} failed: {last_error}", spec.name),
        ))),
        None => {
            transcript.push(ChatTurn {
                role: Role::Assistant,
                content: format!("[tool {} failed] {last_error}", spec.name),
            });
            Ok(None)
        }
    }
}

/// The blocked-without-output fallback: the user always gets a response.
async fn clarify(gateway: &Gateway, run: &AgentRun, reason: &str) -> Terminal {
    let text = format!("I could not complete that request: {reason}.");
    gateway
        .publish(
            EventKind::RunOutput,
            Some(run.run_id),
            Some(run.channel_id.clone()),
            json!({ "run_id": run.run_id, "text": text }),
        )
        .await;
    Terminal::completed(Some(text), reason)
}

fn transcript_from_history(history: &[ChatMessage]) -> Vec<ChatTurn> {
    history
        .iter()
        .map(|message| ChatTurn {
            role: match message.direction {
                Direction::Inbound => Role::User,
                Direction::Outbound => Role::Assistant,
            },
            content: message.text.clone(),
        })
        .collect()
}

fn system_prompt(run: &AgentRun) -> String {
    format!(
        "You are an assistant operating through a gated tool runtime. \
         Conversation {} on channel {}. Use a tool when it helps; otherwise \
         answer in plain text.",
        run.chat_id, run.channel_id
    )
}

fn tool_descriptors(gateway: &Gateway) -> Vec<ToolDescriptor> {
    let policy = gateway.policy_snapshot();
    let registry = gateway.registry_snapshot();
    registry
        .list()
        .into_iter()
        .filter(|spec| policy.tool_allowlist.get(&spec.name) == Some(&true))
        .map(|spec| ToolDescriptor {
            name: spec.name.clone(),
            description: spec.description.clone(),
            parameter_schema: spec.parameter_schema.clone(),
        })
        .collect()
}
