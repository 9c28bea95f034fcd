//! Core domain types shared across the gateway.
//!
//! Enum string forms are the ones persisted in SQLite and sent on the wire,
//! so every enum here carries an `as_str`/`parse` pair rather than relying on
//! `Debug` formatting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Error returned when a persisted or wire string does not map to an enum.
#[derive(Debug, Error)]
#[error("unknown {field}: {value}")]
pub struct InvalidEnum {
    /// Which field failed to parse.
    pub field: &'static str,
    /// The offending value.
    pub value: String,
}

// ---------------------------------------------------------------------------
// Principals
// ---------------------------------------------------------------------------

/// An authenticated control-plane client.
///
/// The raw API key never leaves the config loader; only its SHA-256 hex
/// digest is retained here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    /// Stable identifier, e.g. `"op"`.
    pub principal_id: String,
    /// Role labels. Currently informational; every principal is an operator.
    pub roles: Vec<String>,
    /// SHA-256 hex digest of the API key.
    pub api_key_hash: String,
}

// ---------------------------------------------------------------------------
// Channels, chats, messages
// ---------------------------------------------------------------------------

/// Transport family behind a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Embedded web chat widget.
    WebChat,
    /// Telegram bot transport.
    Telegram,
    /// WhatsApp bridge transport.
    WhatsApp,
}

impl ChannelKind {
    /// String form stored in SQLite and sent on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebChat => "webchat",
            Self::Telegram => "telegram",
            Self::WhatsApp => "whatsapp",
        }
    }

    /// Parse from the stored string form.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidEnum`] if the value is not a recognised kind.
    pub fn parse(s: &str) -> Result<Self, InvalidEnum> {
        match s {
            "webchat" => Ok(Self::WebChat),
            "telegram" => Ok(Self::Telegram),
            "whatsapp" => Ok(Self::WhatsApp),
            other => Err(InvalidEnum {
                field: "channel kind",
                value: other.to_owned(),
            }),
        }
    }
}

/// Liveness of a channel transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    /// Adapter not connected.
    Offline,
    /// Adapter is establishing its transport.
    Connecting,
    /// Adapter healthy.
    Online,
    /// Adapter connected but erroring.
    Degraded,
}

impl ChannelStatus {
    /// String form stored in SQLite and sent on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Connecting => "connecting",
            Self::Online => "online",
            Self::Degraded => "degraded",
        }
    }

    /// Parse from the stored string form.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidEnum`] if the value is not a recognised status.
    pub fn parse(s: &str) -> Result<Self, InvalidEnum> {
        match s {
            "offline" => Ok(Self::Offline),
            "connecting" => Ok(Self::Connecting),
            "online" => Ok(Self::Online),
            "degraded" => Ok(Self::Degraded),
            other => Err(InvalidEnum {
                field: "channel status",
                value: other.to_owned(),
            }),
        }
    }
}

/// A logical inbound source, created at startup from configuration.
///
/// Status is mutated exclusively through the gateway's single status-update
/// entry point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    /// Unique channel identifier, e.g. `"wc"`.
    pub channel_id: String,
    /// Transport family.
    pub kind: ChannelKind,
    /// Current liveness.
    pub status: ChannelStatus,
    /// Last time the adapter reported in.
    pub last_seen: Option<DateTime<Utc>>,
}

/// A conversation anchored to a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    /// Unique chat identifier.
    pub chat_id: String,
    /// Owning channel; always references an existing channel row.
    pub channel_id: String,
    /// Display title.
    pub title: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Direction of a message relative to the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// From a channel into the gateway.
    Inbound,
    /// From the gateway out to a channel.
    Outbound,
}

impl Direction {
    /// String form stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    /// Parse from the stored string form.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidEnum`] if the value is not a recognised direction.
    pub fn parse(s: &str) -> Result<Self, InvalidEnum> {
        match s {
            "inbound" => Ok(Self::Inbound),
            "outbound" => Ok(Self::Outbound),
            other => Err(InvalidEnum {
                field: "direction",
                value: other.to_owned(),
            }),
        }
    }
}

/// An atomic utterance. Immutable after insertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Unique message identifier.
    pub message_id: String,
    /// Owning chat.
    pub chat_id: String,
    /// Inbound or outbound.
    pub direction: Direction,
    /// Sender identifier within the channel.
    pub sender_id: String,
    /// Sanitized text body.
    pub text: String,
    /// Message timestamp.
    pub ts: DateTime<Utc>,
}

/// Normalized inbound message as delivered by a channel adapter,
/// before sanitization and policy evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEnvelope {
    /// Source channel.
    pub channel_id: String,
    /// Conversation identifier within the channel.
    pub chat_id: String,
    /// Sender identifier within the channel.
    pub sender_id: String,
    /// Raw text body.
    pub text: String,
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

/// Lifecycle state of an agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Persisted, orchestrator not yet started.
    Pending,
    /// Orchestrator is building context or calling the LLM.
    Planning,
    /// Blocked on a human approval decision.
    AwaitingApproval,
    /// A tool handler is executing.
    ToolExec,
    /// Terminal: produced output normally.
    Completed,
    /// Terminal: failed with a recorded error.
    Failed,
    /// Terminal: canceled by an operator.
    Canceled,
    /// Terminal: run deadline expired.
    TimedOut,
}

impl RunStatus {
    /// Whether this status ends the run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Canceled | Self::TimedOut
        )
    }

    /// String form stored in SQLite and sent on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Planning => "planning",
            Self::AwaitingApproval => "awaiting_approval",
            Self::ToolExec => "tool_exec",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::TimedOut => "timed_out",
        }
    }

    /// Parse from the stored string form.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidEnum`] if the value is not a recognised status.
    pub fn parse(s: &str) -> Result<Self, InvalidEnum> {
        match s {
            "pending" => Ok(Self::Pending),
            "planning" => Ok(Self::Planning),
            "awaiting_approval" => Ok(Self::AwaitingApproval),
            "tool_exec" => Ok(Self::ToolExec),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            "timed_out" => Ok(Self::TimedOut),
            other => Err(InvalidEnum {
                field: "run status",
                value: other.to_owned(),
            }),
        }
    }
}

/// Classified failure cause recorded on a terminal run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunErrorKind {
    /// A required approval was not granted within its window.
    ApprovalTimeout,
    /// The run hit `max_steps` plan calls.
    StepLimit,
    /// The run deadline expired.
    RunTimeout,
    /// Canceled by an operator.
    Canceled,
    /// The LLM provider was unreachable or the circuit is open.
    LlmUnavailable,
    /// A write tool handler failed.
    ToolFailed,
    /// Unexpected internal error.
    Internal,
}

impl RunErrorKind {
    /// String form stored in SQLite and sent on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApprovalTimeout => "approval_timeout",
            Self::StepLimit => "step_limit",
            Self::RunTimeout => "run_timeout",
            Self::Canceled => "canceled",
            Self::LlmUnavailable => "llm_unavailable",
            Self::ToolFailed => "tool_failed",
            Self::Internal => "internal",
        }
    }

    /// Parse from the stored string form.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidEnum`] if the value is not a recognised kind.
    pub fn parse(s: &str) -> Result<Self, InvalidEnum> {
        match s {
            "approval_timeout" => Ok(Self::ApprovalTimeout),
            "step_limit" => Ok(Self::StepLimit),
            "run_timeout" => Ok(Self::RunTimeout),
            "canceled" => Ok(Self::Canceled),
            "llm_unavailable" => Ok(Self::LlmUnavailable),
            "tool_failed" => Ok(Self::ToolFailed),
            "internal" => Ok(Self::Internal),
            other => Err(InvalidEnum {
                field: "run error kind",
                value: other.to_owned(),
            }),
        }
    }
}

/// Failure cause plus human-readable detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunError {
    /// Classified cause.
    pub kind: RunErrorKind,
    /// Detail message, safe to show to clients.
    pub message: String,
}

/// One invocation of the agent loop bound to a chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    /// Unique run identifier.
    pub run_id: Uuid,
    /// Conversation the run is anchored to.
    pub chat_id: String,
    /// Channel the conversation belongs to.
    pub channel_id: String,
    /// Principal that started the run.
    pub requested_by: String,
    /// Current lifecycle state.
    pub status: RunStatus,
    /// Plan calls consumed so far; never exceeds `max_steps`.
    pub step: u32,
    /// Plan-call budget.
    pub max_steps: u32,
    /// Absolute wall-clock deadline.
    pub deadline: DateTime<Utc>,
    /// Final output text, when the run produced one.
    pub output_text: Option<String>,
    /// Failure cause, when the run ended abnormally.
    pub error: Option<RunError>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Set exactly when `status` is terminal.
    pub ended_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Classification of a bus event. Serialized in dotted form, e.g.
/// `"run.progress"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// A channel changed liveness.
    #[serde(rename = "channel.status")]
    ChannelStatus,
    /// An inbound message was accepted and persisted.
    #[serde(rename = "message.inbound")]
    MessageInbound,
    /// Orchestrator phase marker.
    #[serde(rename = "run.progress")]
    RunProgress,
    /// The orchestrator is invoking (or requesting approval for) a tool.
    #[serde(rename = "run.tool_call")]
    RunToolCall,
    /// The run produced user-visible output.
    #[serde(rename = "run.output")]
    RunOutput,
    /// Terminal event; exactly one per run.
    #[serde(rename = "run.completed")]
    RunCompleted,
    /// Policy denied something observable.
    #[serde(rename = "security.blocked")]
    SecurityBlocked,
    /// A write tool is waiting on a human decision.
    #[serde(rename = "approval.required")]
    ApprovalRequired,
}

impl EventKind {
    /// Dotted string form used for persistence and prefix filtering.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChannelStatus => "channel.status",
            Self::MessageInbound => "message.inbound",
            Self::RunProgress => "run.progress",
            Self::RunToolCall => "run.tool_call",
            Self::RunOutput => "run.output",
            Self::RunCompleted => "run.completed",
            Self::SecurityBlocked => "security.blocked",
            Self::ApprovalRequired => "approval.required",
        }
    }

    /// Parse from the dotted string form.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidEnum`] if the value is not a recognised kind.
    pub fn parse(s: &str) -> Result<Self, InvalidEnum> {
        match s {
            "channel.status" => Ok(Self::ChannelStatus),
            "message.inbound" => Ok(Self::MessageInbound),
            "run.progress" => Ok(Self::RunProgress),
            "run.tool_call" => Ok(Self::RunToolCall),
            "run.output" => Ok(Self::RunOutput),
            "run.completed" => Ok(Self::RunCompleted),
            "security.blocked" => Ok(Self::SecurityBlocked),
            "approval.required" => Ok(Self::ApprovalRequired),
            other => Err(InvalidEnum {
                field: "event kind",
                value: other.to_owned(),
            }),
        }
    }
}

/// Immutable record in the process-wide monotonic event sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Strictly increasing, gap-free sequence number.
    pub seq: u64,
    /// Event classification.
    pub kind: EventKind,
    /// Publication timestamp.
    pub ts: DateTime<Utc>,
    /// Run correlation, when the event belongs to a run.
    pub run_id: Option<Uuid>,
    /// Channel correlation, when the event belongs to a channel.
    pub channel_id: Option<String>,
    /// Structured payload.
    pub payload: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Approvals
// ---------------------------------------------------------------------------

/// A write-tool invocation waiting on a human decision.
///
/// At most one pending approval exists per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingApproval {
    /// Run that is blocked.
    pub run_id: Uuid,
    /// Tool awaiting authorization.
    pub tool_name: String,
    /// Arguments the tool will be invoked with.
    pub args: serde_json::Value,
    /// When the approval was opened.
    pub requested_at: DateTime<Utc>,
    /// When the approval times out.
    pub deadline: DateTime<Utc>,
}
