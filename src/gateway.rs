//! Gateway core: the single authority.
//!
//! Every persisted entity, every run, and every published event goes through
//! this component. The control plane and the orchestrator both hold a
//! [`Gateway`] handle; neither touches the store or the bus directly for
//! writes. That concentration is what makes agent behavior auditable: there
//! is exactly one place where state changes happen.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::approval::{ApprovalBroker, ApprovalError};
use crate::bus::{EventBus, EventFilter, Subscription};
use crate::config::{hash_api_key, Config, PolicyConfig, PolicyDiff, RunLimits};
use crate::llm::ResilientClient;
use crate::metrics::Metrics;
use crate::policy::{evaluate_inbound, InboundDecision};
use crate::ratelimit::{Admission, RateLimiter};
use crate::run::{self, RunHandle};
use crate::store::{Store, StoreError};
use crate::tools::ToolRegistry;
use crate::types::{
    AgentRun, Channel, ChannelStatus, Chat, ChatMessage, Direction, Event, EventKind, Principal,
    RunError, RunStatus,
};

/// Grace period for orchestrators to unwind during shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Control-plane-facing errors; `kind` matches the wire error codes.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Bad or missing client key.
    #[error("authentication failed")]
    Unauthenticated,
    /// Principal or channel over its admission budget.
    #[error("rate limited, retry after {retry_after:.3}s")]
    RateLimited {
        /// Seconds until a token refills.
        retry_after: f64,
    },
    /// Malformed or unacceptable request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Policy denied the operation.
    #[error("policy denied: {0}")]
    PolicyDenied(String),
    /// Everything else; details stay in the logs.
    #[error("internal error")]
    Internal(String),
}

impl GatewayError {
    /// Wire error code for responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::RateLimited { .. } => "rate_limited",
            Self::InvalidRequest(_) => "invalid_request",
            Self::NotFound(_) => "not_found",
            Self::PolicyDenied(_) => "policy_denied",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        warn!(error = %err, "store operation failed");
        Self::Internal(err.to_string())
    }
}

/// Tool listing entry for `config.get`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSummary {
    /// Namespaced name.
    pub name: String,
    /// Permission class.
    pub permission: &'static str,
    /// Planner-facing description.
    pub description: String,
}

/// One `doctor.audit` finding.
#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    /// `"critical"`, `"warning"`, or `"info"`.
    pub severity: &'static str,
    /// Stable machine-readable code.
    pub code: &'static str,
    /// Human-readable detail.
    pub message: String,
}

/// Health report for `GET /healthz`.
#[derive(Debug, Clone, Serialize)]
pub struct Health {
    /// `"ok"` or `"degraded"`.
    pub status: &'static str,
    /// Individual check results.
    pub checks: serde_json::Value,
}

struct Inner {
    config: Config,
    policy: RwLock<PolicyConfig>,
    registry: RwLock<Arc<ToolRegistry>>,
    store: Store,
    bus: EventBus,
    approvals: ApprovalBroker,
    principal_limiter: RateLimiter,
    channel_limiter: RateLimiter,
    llm: Arc<ResilientClient>,
    metrics: Arc<Metrics>,
    runs: Mutex<HashMap<Uuid, RunHandle>>,
    shutting_down: AtomicBool,
}

/// Handle to the gateway core. Cheap to clone.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("instance_id", &self.inner.config.instance_id)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Assemble the gateway from its collaborators.
    pub fn new(
        config: Config,
        store: Store,
        registry: ToolRegistry,
        llm: Arc<ResilientClient>,
    ) -> Self {
        let policy = config.policy.clone();
        let principal_limiter = RateLimiter::new(config.rate);
        let channel_limiter = RateLimiter::new(config.rate);
        Self {
            inner: Arc::new(Inner {
                config,
                policy: RwLock::new(policy),
                registry: RwLock::new(Arc::new(registry)),
                store,
                bus: EventBus::new(),
                approvals: ApprovalBroker::new(),
                principal_limiter,
                channel_limiter,
                llm,
                metrics: Arc::new(Metrics::new()),
                runs: Mutex::new(HashMap::new()),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Load persisted policy and seed the channel table. Called once at
    /// startup, before the control plane accepts connections.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] if the store is unusable.
    pub async fn bootstrap(&self) -> Result<(), GatewayError> {
        if let Some(persisted) = self.inner.store.load_policy().await? {
            info!("loaded persisted policy");
            *write_lock(&self.inner.policy) = persisted;
        }

        for seed in &self.inner.config.channels {
            let existing = self.inner.store.get_channel(&seed.channel_id).await?;
            let channel = Channel {
                channel_id: seed.channel_id.clone(),
                kind: seed.kind,
                status: ChannelStatus::Offline,
                last_seen: existing.and_then(|c| c.last_seen),
            };
            self.inner.store.upsert_channel(&channel).await?;
        }
        info!(channels = self.inner.config.channels.len(), "gateway bootstrapped");
        Ok(())
    }

    // -- identity and admission ---------------------------------------------

    /// Instance identifier reported in `res:hello`.
    pub fn instance_id(&self) -> &str {
        &self.inner.config.instance_id
    }

    /// Heartbeat interval for the control plane.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.inner.config.ping_interval_s)
    }

    /// Idle window before a silent socket is closed.
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.inner.config.ping_timeout_s)
    }

    /// Authenticate a client key against the configured principals.
    ///
    /// The comparison hashes the presented key and compares digests in
    /// constant time against every principal, so neither key length nor
    /// match position leaks through timing.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Unauthenticated`] when no principal matches.
    pub fn authenticate(&self, client_key: &str) -> Result<Principal, GatewayError> {
        let presented = hash_api_key(client_key);
        let mut matched: Option<Principal> = None;
        for principal in &self.inner.config.principals {
            let equal: bool = presented
                .as_bytes()
                .ct_eq(principal.api_key_hash.as_bytes())
                .into();
            if equal {
                matched = Some(principal.clone());
            }
        }
        matched.ok_or(GatewayError::Unauthenticated)
    }

    /// Admit one control-plane request for a principal.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::RateLimited`] when the bucket is empty.
    pub fn admit(&self, principal_id: &str) -> Result<(), GatewayError> {
        match self.inner.principal_limiter.admit(principal_id) {
            Admission::Allowed => Ok(()),
            Admission::Denied { retry_after } => {
                self.inner.metrics.record_rate_limit_denial();
                Err(GatewayError::RateLimited { retry_after })
            }
        }
    }

    // -- events --------------------------------------------------------------

    /// Publish an event: sequence it, persist it, count it.
    ///
    /// Persist failures are logged, not propagated, so the live stream is
    /// never interrupted by a repository hiccup.
    pub(crate) async fn publish(
        &self,
        kind: EventKind,
        run_id: Option<Uuid>,
        channel_id: Option<String>,
        payload: serde_json::Value,
    ) -> u64 {
        let event = self.inner.bus.publish(kind, run_id, channel_id, payload);
        self.inner.metrics.record_event_published();
        if let Err(err) = self.inner.store.append_event(&event).await {
            warn!(seq = event.seq, error = %err, "failed to persist event");
        }
        event.seq
    }

    /// Subscribe to the live event stream.
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.inner.bus.subscribe(filter)
    }

    /// Drop a live subscription.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        self.inner.bus.unsubscribe(subscription);
    }

    /// Highest sequence number assigned so far.
    pub fn current_seq(&self) -> u64 {
        self.inner.bus.next_seq().saturating_sub(1)
    }

    /// Persisted events with `seq > after_seq`, for retroactive replay.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] on store failure.
    pub async fn events_after(
        &self,
        after_seq: u64,
        limit: u32,
    ) -> Result<Vec<Event>, GatewayError> {
        Ok(self.inner.store.events_after(after_seq, limit).await?)
    }

    /// Persisted events for a run with `seq > after_seq`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] on store failure.
    pub async fn run_events_after(
        &self,
        run_id: Uuid,
        after_seq: u64,
    ) -> Result<Vec<Event>, GatewayError> {
        Ok(self.inner.store.events_for_run_after(run_id, after_seq).await?)
    }

    // -- channels and messages ----------------------------------------------

    /// The single entry point for adapter status updates.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NotFound`] for an unknown channel.
    pub async fn update_channel_status(
        &self,
        channel_id: &str,
        status: ChannelStatus,
    ) -> Result<(), GatewayError> {
        let now = Utc::now();
        let found = self
            .inner
            .store
            .set_channel_status(channel_id, status, now)
            .await?;
        if !found {
            return Err(GatewayError::NotFound(format!("channel {channel_id}")));
        }
        self.publish(
            EventKind::ChannelStatus,
            None,
            Some(channel_id.to_owned()),
            json!({ "channel_id": channel_id, "status": status.as_str() }),
        )
        .await;
        Ok(())
    }

    /// All channels.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] on store failure.
    pub async fn list_channels(&self) -> Result<Vec<Channel>, GatewayError> {
        Ok(self.inner.store.list_channels().await?)
    }

    /// Chats, optionally restricted to a channel.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] on store failure.
    pub async fn list_chats(&self, channel_id: Option<&str>) -> Result<Vec<Chat>, GatewayError> {
        Ok(self.inner.store.list_chats(channel_id).await?)
    }

    /// Newest `limit` messages of a chat, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] on store failure.
    pub async fn list_messages(
        &self,
        chat_id: &str,
        limit: u32,
    ) -> Result<Vec<ChatMessage>, GatewayError> {
        Ok(self.inner.store.list_messages(chat_id, limit).await?)
    }

    /// Accept an inbound channel message: throttle, sanitize, authorize,
    /// persist, announce.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PolicyDenied`] (also observable as a
    /// `security.blocked` event) when the sender is not admitted, plus the
    /// usual throttle/validation errors.
    pub async fn ingest_inbound(
        &self,
        envelope: crate::types::InboundEnvelope,
    ) -> Result<ChatMessage, GatewayError> {
        let channel = self.inner.store.get_channel(&envelope.channel_id).await?;

        if let Admission::Denied { retry_after } =
            self.inner.channel_limiter.admit(&envelope.channel_id)
        {
            self.inner.metrics.record_rate_limit_denial();
            return Err(GatewayError::RateLimited { retry_after });
        }

        let text = sanitize_text(&envelope.text, self.inner.config.max_message_bytes);
        if text.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "message empty after sanitization".to_owned(),
            ));
        }

        let is_group = envelope.chat_id.starts_with("group");
        let decision = {
            let policy = read_lock(&self.inner.policy);
            evaluate_inbound(&policy, channel.as_ref(), &envelope.sender_id, is_group)
        };
        if let InboundDecision::Deny(reason) = decision {
            self.publish(
                EventKind::SecurityBlocked,
                None,
                Some(envelope.channel_id.clone()),
                json!({
                    "reason": reason.as_str(),
                    "channel_id": envelope.channel_id,
                    "sender_id": envelope.sender_id,
                }),
            )
            .await;
            return Err(GatewayError::PolicyDenied(reason.as_str().to_owned()));
        }

        self.inner
            .store
            .ensure_chat(&envelope.chat_id, &envelope.channel_id, &envelope.chat_id)
            .await?;

        let message = ChatMessage {
            message_id: Uuid::new_v4().to_string(),
            chat_id: envelope.chat_id,
            direction: Direction::Inbound,
            sender_id: envelope.sender_id,
            text,
            ts: Utc::now(),
        };
        self.inner.store.insert_message(&message).await?;

        let message_json = serde_json::to_value(&message).unwrap_or_default();
        self.publish(
            EventKind::MessageInbound,
            None,
            Some(envelope.channel_id),
            json!({ "message": message_json }),
        )
        .await;

        Ok(message)
    }

    // -- runs ----------------------------------------------------------------

    /// Persist a run in `pending`, spawn its orchestrator, return the id.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] for unknown channels, empty prompts, or a
    /// shutting-down gateway.
    pub async fn start_run(
        &self,
        chat_id: &str,
        channel_id: &str,
        requested_by: &str,
        prompt: &str,
    ) -> Result<Uuid, GatewayError> {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err(GatewayError::InvalidRequest(
                "gateway is shutting down".to_owned(),
            ));
        }

        if self.inner.store.get_channel(channel_id).await?.is_none() {
            return Err(GatewayError::NotFound(format!("channel {channel_id}")));
        }

        let prompt = sanitize_text(prompt, self.inner.config.max_message_bytes);
        if prompt.is_empty() {
            return Err(GatewayError::InvalidRequest("empty prompt".to_owned()));
        }

        self.inner
            .store
            .ensure_chat(chat_id, channel_id, chat_id)
            .await?;
        self.inner
            .store
            .insert_message(&ChatMessage {
                message_id: Uuid::new_v4().to_string(),
                chat_id: chat_id.to_owned(),
                direction: Direction::Inbound,
                sender_id: requested_by.to_owned(),
                text: prompt,
                ts: Utc::now(),
            })
            .await?;

        let now = Utc::now();
        let limits = self.inner.config.limits;
        let run = AgentRun {
            run_id: Uuid::new_v4(),
            chat_id: chat_id.to_owned(),
            channel_id: channel_id.to_owned(),
            requested_by: requested_by.to_owned(),
            status: RunStatus::Pending,
            step: 0,
            max_steps: limits.max_steps,
            deadline: now
                .checked_add_signed(chrono::TimeDelta::seconds(
                    i64::try_from(limits.timeout_s).unwrap_or(i64::MAX),
                ))
                .unwrap_or(now),
            output_text: None,
            error: None,
            created_at: now,
            ended_at: None,
        };
        self.inner.store.insert_run(&run).await?;

        let run_id = run.run_id;
        let (handle, ready) = run::spawn(self.clone(), run);
        lock(&self.inner.runs).insert(run_id, handle);
        let _ = ready.send(());

        info!(%run_id, chat = chat_id, requested_by, "run started");
        Ok(run_id)
    }

    /// Request cancellation of a live run. Terminal runs are a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NotFound`] for an unknown run id.
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<(), GatewayError> {
        if let Some(handle) = lock(&self.inner.runs).get(&run_id) {
            handle.token.cancel();
            return Ok(());
        }
        match self.inner.store.get_run(run_id).await? {
            Some(_) => Ok(()),
            None => Err(GatewayError::NotFound(format!("run {run_id}"))),
        }
    }

    /// Load a run row.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NotFound`] for an unknown run id.
    pub async fn get_run(&self, run_id: Uuid) -> Result<AgentRun, GatewayError> {
        self.inner
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("run {run_id}")))
    }

    /// Number of live orchestrator tasks.
    pub fn active_run_count(&self) -> usize {
        lock(&self.inner.runs).len()
    }

    // -- approvals -----------------------------------------------------------

    /// Grant the pending approval of a run.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NotFound`] when no approval is pending.
    pub fn grant_approval(&self, run_id: Uuid, by_principal: &str) -> Result<(), GatewayError> {
        let pending = self.inner.approvals.get_pending(run_id);
        match self.inner.approvals.grant(run_id, by_principal) {
            Ok(()) => {
                if let Some(pending) = pending {
                    let waited = Utc::now()
                        .signed_duration_since(pending.requested_at)
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    self.inner
                        .metrics
                        .observe_approval_latency(waited.as_secs_f64());
                }
                Ok(())
            }
            Err(ApprovalError::NotFound(_)) | Err(ApprovalError::AlreadyPending(_)) => Err(
                GatewayError::NotFound(format!("no pending approval for run {run_id}")),
            ),
        }
    }

    /// Deny the pending approval of a run.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NotFound`] when no approval is pending.
    pub fn deny_approval(
        &self,
        run_id: Uuid,
        by_principal: &str,
    ) -> Result<(), GatewayError> {
        self.inner
            .approvals
            .deny(run_id, &format!("denied by {by_principal}"))
            .map_err(|_| GatewayError::NotFound(format!("no pending approval for run {run_id}")))
    }

    // -- config --------------------------------------------------------------

    /// Current policy plus the tool catalog.
    pub fn get_config(&self) -> (PolicyConfig, Vec<ToolSummary>) {
        let policy = read_lock(&self.inner.policy).clone();
        let registry = self.registry_snapshot();
        let tools = registry
            .list()
            .into_iter()
            .map(|spec| ToolSummary {
                name: spec.name.clone(),
                permission: spec.permission.as_str(),
                description: spec.description.clone(),
            })
            .collect();
        (policy, tools)
    }

    /// Merge a policy diff, persist the result, and return it.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] when persistence fails; the in-memory policy
    /// is already updated at that point and will be retried on next save.
    pub async fn set_config(&self, diff: PolicyDiff) -> Result<PolicyConfig, GatewayError> {
        let merged = {
            let mut policy = write_lock(&self.inner.policy);
            policy.merge(diff);
            policy.clone()
        };
        self.inner.store.save_policy(&merged).await?;
        info!("policy updated");
        Ok(merged)
    }

    /// Swap in a freshly built tool registry.
    pub fn reload_tools(&self, registry: ToolRegistry) {
        *write_lock(&self.inner.registry) = Arc::new(registry);
        info!("tool registry reloaded");
    }

    // -- diagnostics ---------------------------------------------------------

    /// Run the self-audit and return findings, worst first.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] on store failure.
    pub async fn audit(&self) -> Result<Vec<Finding>, GatewayError> {
        let mut findings = Vec::new();

        let orphaned = self.inner.store.count_terminal_without_ended().await?;
        if orphaned > 0 {
            findings.push(Finding {
                severity: "critical",
                code: "terminal_run_missing_ended_at",
                message: format!("{orphaned} terminal run(s) have no ended_at"),
            });
        }

        {
            let policy = read_lock(&self.inner.policy);
            let registry = self.registry_snapshot();
            for (tool, allowed) in &policy.tool_allowlist {
                if *allowed && registry.get(tool).is_none() {
                    findings.push(Finding {
                        severity: "warning",
                        code: "allowlisted_tool_missing",
                        message: format!("tool {tool} is allowlisted but not registered"),
                    });
                }
            }
            for (channel, senders) in &policy.channel_allowlist {
                if senders.is_empty() {
                    findings.push(Finding {
                        severity: "info",
                        code: "channel_denies_all",
                        message: format!("channel {channel} has an empty allowlist"),
                    });
                }
            }
        }

        let cutoff = Utc::now()
            .checked_sub_signed(chrono::TimeDelta::seconds(
                i64::try_from(self.inner.config.limits.timeout_s.saturating_mul(2))
                    .unwrap_or(i64::MAX),
            ))
            .unwrap_or_else(Utc::now);
        for run_id in self.inner.store.list_stale_runs(cutoff).await? {
            findings.push(Finding {
                severity: "warning",
                code: "stale_run",
                message: format!("run {run_id} is non-terminal past twice the run timeout"),
            });
        }

        if self.inner.config.principals.is_empty() {
            findings.push(Finding {
                severity: "warning",
                code: "no_api_keys",
                message: "no API keys configured; nobody can authenticate".to_owned(),
            });
        }

        Ok(findings)
    }

    /// Health report for `/healthz`.
    pub async fn health(&self) -> Health {
        let store_ok = self.inner.store.ping().await.is_ok();
        let circuit_open = self.inner.llm.circuit_open();
        let status = if store_ok && !circuit_open {
            "ok"
        } else {
            "degraded"
        };
        Health {
            status,
            checks: json!({
                "store": if store_ok { "ok" } else { "unreachable" },
                "llm_provider": self.inner.llm.provider_name(),
                "llm_circuit": if circuit_open { "open" } else { "closed" },
                "active_runs": self.active_run_count(),
            }),
        }
    }

    /// Prometheus text exposition for `/metrics`.
    pub fn metrics_text(&self) -> String {
        self.inner.metrics.render(
            self.inner.bus.lag_count(),
            u64::try_from(self.inner.bus.subscriber_count()).unwrap_or(u64::MAX),
        )
    }

    /// Cancel every live run, wait up to [`SHUTDOWN_GRACE`], then abort
    /// stragglers.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::Release);
        let tokens: Vec<_> = lock(&self.inner.runs)
            .values()
            .map(|handle| Arc::clone(&handle.token))
            .collect();
        info!(runs = tokens.len(), "shutdown: canceling live runs");
        for token in tokens {
            token.cancel();
        }

        let deadline = tokio::time::Instant::now()
            .checked_add(SHUTDOWN_GRACE)
            .unwrap_or_else(tokio::time::Instant::now);
        while tokio::time::Instant::now() < deadline {
            if lock(&self.inner.runs).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let stragglers: Vec<_> = lock(&self.inner.runs).drain().collect();
        for (run_id, handle) in stragglers {
            warn!(%run_id, "force-aborting run past the grace period");
            handle.join.abort();
        }
    }

    // -- orchestrator-facing internals --------------------------------------

    /// Run budgets and timeouts.
    pub fn limits(&self) -> RunLimits {
        self.inner.config.limits
    }

    /// Snapshot of the current policy.
    pub fn policy_snapshot(&self) -> PolicyConfig {
        read_lock(&self.inner.policy).clone()
    }

    /// Snapshot of the current registry.
    pub fn registry_snapshot(&self) -> Arc<ToolRegistry> {
        read_lock(&self.inner.registry).clone()
    }

    /// The resilient LLM client.
    pub fn llm(&self) -> Arc<ResilientClient> {
        Arc::clone(&self.inner.llm)
    }

    /// The approval broker.
    pub fn approvals(&self) -> &ApprovalBroker {
        &self.inner.approvals
    }

    /// The metrics registry.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    /// Chat history for run context, bounded by the configured window.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] on store failure.
    pub async fn run_history(&self, chat_id: &str) -> Result<Vec<ChatMessage>, GatewayError> {
        Ok(self
            .inner
            .store
            .list_messages(chat_id, self.inner.config.limits.history_limit)
            .await?)
    }

    /// Record a non-terminal status/step change.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] on store failure.
    pub async fn mark_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        step: u32,
    ) -> Result<(), GatewayError> {
        self.inner
            .store
            .update_run_progress(run_id, status, step)
            .await?;
        Ok(())
    }

    /// Record the terminal transition and emit the terminal event. After this
    /// returns, no further events carry this run id.
    pub async fn finalize_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        output_text: Option<&str>,
        error: Option<&RunError>,
        summary: &str,
    ) {
        let ended_at = Utc::now();
        if let Err(err) = self
            .inner
            .store
            .finalize_run(run_id, status, output_text, error, ended_at)
            .await
        {
            warn!(%run_id, error = %err, "failed to persist terminal run state");
        }

        let mut payload = json!({
            "run_id": run_id,
            "status": status.as_str(),
            "summary": summary,
        });
        if let Some(text) = output_text {
            payload["output_text"] = json!(text);
        }
        if let Some(error) = error {
            payload["error"] = json!({ "kind": error.kind.as_str(), "message": error.message });
        }
        self.publish(EventKind::RunCompleted, Some(run_id), None, payload)
            .await;

        self.inner.metrics.record_run_terminal(status);
        info!(%run_id, status = status.as_str(), "run finalized");
    }

    /// Remove a finished run's handle from the cancellation table.
    pub(crate) fn deregister_run(&self, run_id: Uuid) {
        lock(&self.inner.runs).remove(&run_id);
    }
}

/// Strip control characters (keeping newline and tab), trim, and cap length
/// at a UTF-8 boundary.
fn sanitize_text(raw: &str, max_bytes: usize) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();
    let trimmed = cleaned.trim();
    if trimmed.len() <= max_bytes {
        return trimmed.to_owned();
    }
    let mut cut = max_bytes;
    while cut > 0 && !trimmed.is_char_boundary(cut) {
        cut = cut.saturating_sub(1);
    }
    trimmed[..cut].trim_end().to_owned()
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn read_lock<T>(rwlock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match rwlock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_lock<T>(rwlock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match rwlock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
