//! Control-plane wire protocol.
//!
//! Every frame is a JSON envelope `{type, id, ts, payload}`. `type` carries a
//! `req:` / `res:` / `evt:` prefix; `id` correlates a response to its request
//! and is `evt_<seq>` for pushes. Responses always carry `ok` and, on
//! failure, `error: {kind, message}` inside the payload.

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::config::PolicyDiff;
use crate::types::Event;

/// Frame decode failures, all mapped to `invalid_request` on the wire.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Not a JSON object with the envelope fields.
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// Envelope was fine but `type` is not in the catalog.
    #[error("unknown request type: {0}")]
    UnknownType(String),
}

/// Decoded request envelope.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    id: String,
    #[serde(default)]
    payload: Value,
}

/// `req:hello` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct HelloPayload {
    /// API key presented by the client.
    pub client_key: String,
    /// Replay persisted events with `seq` greater than this before streaming.
    #[serde(default)]
    pub after_seq: Option<u64>,
}

/// `req:agent.run` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentRunPayload {
    /// Target chat.
    pub chat_id: String,
    /// Target channel.
    pub channel_id: String,
    /// Overrides the authenticated principal as the recorded requester.
    #[serde(default)]
    pub requested_by: Option<String>,
    /// The instruction driving the run.
    pub prompt: String,
}

/// Parsed client request.
#[derive(Debug, Clone)]
pub enum Request {
    /// Authentication handshake.
    Hello(HelloPayload),
    /// List channels.
    ChannelsList,
    /// List chats, optionally per channel.
    ChatList {
        /// Restrict to one channel.
        channel_id: Option<String>,
    },
    /// Page through a chat's messages.
    ChatMessages {
        /// Target chat.
        chat_id: String,
        /// Newest `limit` messages, capped server-side.
        limit: Option<u32>,
    },
    /// Start an agent run.
    AgentRun(AgentRunPayload),
    /// Replay a run's events then follow live.
    RunsTail {
        /// Target run.
        run_id: Uuid,
        /// Replay events with `seq` greater than this.
        after_seq: Option<u64>,
    },
    /// Fetch a run row.
    RunsGet {
        /// Target run.
        run_id: Uuid,
    },
    /// Cancel a live run.
    RunsCancel {
        /// Target run.
        run_id: Uuid,
    },
    /// Read policy and tool catalog.
    ConfigGet,
    /// Merge a policy diff.
    ConfigSet(PolicyDiff),
    /// Grant the pending approval of a run.
    ApprovalGrant {
        /// Target run.
        run_id: Uuid,
    },
    /// Deny the pending approval of a run.
    ApprovalDeny {
        /// Target run.
        run_id: Uuid,
    },
    /// Run the self-audit.
    DoctorAudit,
}

impl Request {
    /// Bare request name (without the `req:` prefix), echoed in responses.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::ChannelsList => "channels.list",
            Self::ChatList { .. } => "chat.list",
            Self::ChatMessages { .. } => "chat.messages",
            Self::AgentRun(_) => "agent.run",
            Self::RunsTail { .. } => "runs.tail",
            Self::RunsGet { .. } => "runs.get",
            Self::RunsCancel { .. } => "runs.cancel",
            Self::ConfigGet => "config.get",
            Self::ConfigSet(_) => "config.set",
            Self::ApprovalGrant { .. } => "approval.grant",
            Self::ApprovalDeny { .. } => "approval.deny",
            Self::DoctorAudit => "doctor.audit",
        }
    }
}

#[derive(Debug, Deserialize)]
struct RunIdPayload {
    run_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct RunsTailPayload {
    run_id: Uuid,
    #[serde(default)]
    after_seq: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ChatListPayload {
    #[serde(default)]
    channel_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessagesPayload {
    chat_id: String,
    #[serde(default)]
    limit: Option<u32>,
}

/// Parse one text frame into `(frame id, request)`.
///
/// # Errors
///
/// Returns [`FrameError`] for malformed JSON, a missing `req:` prefix, an
/// unknown type, or a payload that does not match the request's shape.
pub fn parse_frame(text: &str) -> Result<(String, Request), FrameError> {
    let envelope: Envelope =
        serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))?;

    let Some(name) = envelope.kind.strip_prefix("req:") else {
        return Err(FrameError::UnknownType(envelope.kind));
    };

    let payload = envelope.payload;
    let request = match name {
        "hello" => Request::Hello(decode(payload)?),
        "channels.list" => Request::ChannelsList,
        "chat.list" => {
            let p: ChatListPayload = decode(payload)?;
            Request::ChatList {
                channel_id: p.channel_id,
            }
        }
        "chat.messages" => {
            let p: ChatMessagesPayload = decode(payload)?;
            Request::ChatMessages {
                chat_id: p.chat_id,
                limit: p.limit,
            }
        }
        "agent.run" => Request::AgentRun(decode(payload)?),
        "runs.tail" => {
            let p: RunsTailPayload = decode(payload)?;
            Request::RunsTail {
                run_id: p.run_id,
                after_seq: p.after_seq,
            }
        }
        "runs.get" => {
            let p: RunIdPayload = decode(payload)?;
            Request::RunsGet { run_id: p.run_id }
        }
        "runs.cancel" => {
            let p: RunIdPayload = decode(payload)?;
            Request::RunsCancel { run_id: p.run_id }
        }
        "config.get" => Request::ConfigGet,
        "config.set" => Request::ConfigSet(decode(payload)?),
        "approval.grant" => {
            let p: RunIdPayload = decode(payload)?;
            Request::ApprovalGrant { run_id: p.run_id }
        }
        "approval.deny" => {
            let p: RunIdPayload = decode(payload)?;
            Request::ApprovalDeny { run_id: p.run_id }
        }
        "doctor.audit" => Request::DoctorAudit,
        other => return Err(FrameError::UnknownType(format!("req:{other}"))),
    };

    Ok((envelope.id, request))
}

fn decode<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T, FrameError> {
    serde_json::from_value(payload).map_err(|e| FrameError::Malformed(e.to_string()))
}

fn envelope(kind: String, id: String, payload: Value) -> String {
    json!({
        "type": kind,
        "id": id,
        "ts": Utc::now().to_rfc3339(),
        "payload": payload,
    })
    .to_string()
}

/// Build a success response frame. `payload` must be a JSON object; `ok: true`
/// is merged in.
pub fn response(id: &str, name: &str, payload: Value) -> String {
    let mut payload = if payload.is_object() {
        payload
    } else {
        json!({})
    };
    if let Some(map) = payload.as_object_mut() {
        map.insert("ok".to_owned(), json!(true));
    }
    envelope(format!("res:{name}"), id.to_owned(), payload)
}

/// Build a failure response frame with a wire error code.
pub fn error_response(id: &str, name: &str, kind: &str, message: &str) -> String {
    envelope(
        format!("res:{name}"),
        id.to_owned(),
        json!({
            "ok": false,
            "error": { "kind": kind, "message": message },
        }),
    )
}

/// Build a server-push event frame. `seq`, `run_id`, and `channel_id` are
/// merged into the payload so every push is self-describing.
pub fn event_frame(event: &Event) -> String {
    let mut payload = if event.payload.is_object() {
        event.payload.clone()
    } else {
        json!({ "value": event.payload })
    };
    if let Some(map) = payload.as_object_mut() {
        map.insert("seq".to_owned(), json!(event.seq));
        if let Some(run_id) = event.run_id {
            map.entry("run_id".to_owned()).or_insert_with(|| json!(run_id));
        }
        if let Some(channel_id) = &event.channel_id {
            map.entry("channel_id".to_owned())
                .or_insert_with(|| json!(channel_id));
        }
    }
    envelope(
        format!("evt:{}", event.kind.as_str()),
        format!("evt_{}", event.seq),
        payload,
    )
}
