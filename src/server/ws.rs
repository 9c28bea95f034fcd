//! WebSocket control-plane endpoint.
//!
//! Connection lifecycle: accept, require `req:hello` as the first frame,
//! authenticate, then serve requests concurrently while pumping bus events to
//! the socket. Text frames only: a binary frame closes the socket with
//! code 1003. Heartbeat pings go out on the configured interval; a socket
//! silent past the ping timeout is closed.

use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bus::EventFilter;
use crate::gateway::{Gateway, GatewayError};
use crate::server::protocol::{
    error_response, event_frame, parse_frame, response, FrameError, Request,
};
use crate::types::Principal;

/// How long a fresh socket gets to present `req:hello`.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Cap on retroactive events replayed at hello.
const HELLO_REPLAY_LIMIT: u32 = 1_000;

/// Outbound frame buffer per socket.
const OUTBOUND_BUFFER: usize = 256;

/// HTTP handler for `GET /ws`.
pub async fn ws_handler(ws: WebSocketUpgrade, State(gateway): State<Gateway>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, gateway))
}

/// Drive one operator connection to completion.
async fn handle_socket(socket: WebSocket, gateway: Gateway) {
    let (mut sink, mut stream) = socket.split();

    // Phase 1: hello.
    let Some(principal) = handshake(&gateway, &mut sink, &mut stream).await else {
        let _ = sink.close().await;
        return;
    };
    info!(principal = %principal.principal_id, "operator connected");

    // Phase 2: subscribed steady state. A writer task owns the sink so
    // concurrently dispatched requests can respond out of order.
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if sink.send(frame).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let subscription = gateway.subscribe(EventFilter::all());
    let mut ping_timer = tokio::time::interval(gateway.ping_interval());
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let ping_timeout = gateway.ping_timeout();
    let mut last_heard = Instant::now();

    loop {
        tokio::select! {
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        last_heard = Instant::now();
                        dispatch_text(&gateway, &principal, text.as_str(), &out_tx).await;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        let _ = out_tx
                            .send(Message::Close(Some(CloseFrame {
                                code: close_code::UNSUPPORTED,
                                reason: "text frames only".into(),
                            })))
                            .await;
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_heard = Instant::now();
                        let _ = out_tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_heard = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(error = %e, "socket receive error");
                        break;
                    }
                }
            }
            event = subscription.recv() => {
                match event {
                    Some(event) => {
                        let _ = out_tx.send(Message::Text(event_frame(&event).into())).await;
                    }
                    None => break,
                }
            }
            _ = ping_timer.tick() => {
                if last_heard.elapsed() > ping_timeout {
                    warn!(principal = %principal.principal_id, "heartbeat timeout, closing socket");
                    break;
                }
                let _ = out_tx.send(Message::Ping(Vec::new().into())).await;
            }
        }
    }

    gateway.unsubscribe(&subscription);
    drop(out_tx);
    let _ = writer.await;
    info!(principal = %principal.principal_id, "operator disconnected");
}

/// Await and validate `req:hello`. Returns the authenticated principal, or
/// `None` after sending the failure response.
async fn handshake(
    gateway: &Gateway,
    sink: &mut SplitSink<WebSocket, Message>,
    stream: &mut SplitStream<WebSocket>,
) -> Option<Principal> {
    let first = tokio::time::timeout(HELLO_TIMEOUT, stream.next()).await;
    let text = match first {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(Some(Ok(Message::Binary(_)))) => {
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::UNSUPPORTED,
                    reason: "text frames only".into(),
                })))
                .await;
            return None;
        }
        _ => return None,
    };

    let (id, request) = match parse_frame(text.as_str()) {
        Ok(parsed) => parsed,
        Err(err) => {
            let _ = sink
                .send(Message::Text(
                    error_response("", "hello", "invalid_request", &err.to_string()).into(),
                ))
                .await;
            return None;
        }
    };

    let Request::Hello(hello) = request else {
        let _ = sink
            .send(Message::Text(
                error_response(&id, "hello", "invalid_request", "hello must come first").into(),
            ))
            .await;
        return None;
    };

    let principal = match gateway.authenticate(&hello.client_key) {
        Ok(principal) => principal,
        Err(err) => {
            let _ = sink
                .send(Message::Text(
                    error_response(&id, "hello", err.kind(), &err.to_string()).into(),
                ))
                .await;
            return None;
        }
    };

    if let Err(err) = gateway.admit(&principal.principal_id) {
        let _ = sink
            .send(Message::Text(
                error_response(&id, "hello", err.kind(), &err.to_string()).into(),
            ))
            .await;
        return None;
    }

    let welcome = response(
        &id,
        "hello",
        json!({
            "server": "agentgate",
            "version": env!("CARGO_PKG_VERSION"),
            "instance_id": gateway.instance_id(),
            "features": ["runs", "approvals", "events", "doctor"],
        }),
    );
    if sink.send(Message::Text(welcome.into())).await.is_err() {
        return None;
    }

    // Retroactive catch-up: everything persisted after the client's watermark.
    if let Some(after_seq) = hello.after_seq {
        match gateway.events_after(after_seq, HELLO_REPLAY_LIMIT).await {
            Ok(events) => {
                for event in &events {
                    if sink
                        .send(Message::Text(event_frame(event).into()))
                        .await
                        .is_err()
                    {
                        return None;
                    }
                }
            }
            Err(err) => warn!(error = %err, "hello replay failed"),
        }
    }

    Some(principal)
}

/// Parse and dispatch one request frame. Responses flow through `out_tx`.
async fn dispatch_text(
    gateway: &Gateway,
    principal: &Principal,
    text: &str,
    out_tx: &mpsc::Sender<Message>,
) {
    let (id, request) = match parse_frame(text) {
        Ok(parsed) => parsed,
        Err(err) => {
            let name = match &err {
                FrameError::UnknownType(kind) => {
                    kind.strip_prefix("req:").unwrap_or(kind).to_owned()
                }
                FrameError::Malformed(_) => "unknown".to_owned(),
            };
            let _ = out_tx
                .send(Message::Text(
                    error_response("", &name, "invalid_request", &err.to_string()).into(),
                ))
                .await;
            return;
        }
    };

    // Requests are served concurrently; each gets its own task and answers
    // through the shared writer.
    let gateway = gateway.clone();
    let principal = principal.clone();
    let out_tx = out_tx.clone();
    tokio::spawn(async move {
        let name = request.name();
        let frame = match handle_request(&gateway, &principal, &id, request, &out_tx).await {
            Ok(frame) => frame,
            Err(err) => {
                let mut frame = error_response(&id, name, err.kind(), &err.to_string());
                if let GatewayError::RateLimited { retry_after } = err {
                    // Patch retry_after into the error object for clients
                    // that want to back off precisely.
                    if let Ok(mut value) = serde_json::from_str::<serde_json::Value>(&frame) {
                        value["payload"]["error"]["retry_after"] = json!(retry_after);
                        frame = value.to_string();
                    }
                }
                frame
            }
        };
        let _ = out_tx.send(Message::Text(frame.into())).await;
    });
}

async fn handle_request(
    gateway: &Gateway,
    principal: &Principal,
    id: &str,
    request: Request,
    out_tx: &mpsc::Sender<Message>,
) -> Result<String, GatewayError> {
    // Per-principal admission applies to every request after hello.
    gateway.admit(&principal.principal_id)?;

    let name = request.name();
    match request {
        Request::Hello(_) => Err(GatewayError::InvalidRequest(
            "already authenticated".to_owned(),
        )),
        Request::ChannelsList => {
            let channels = gateway.list_channels().await?;
            let channels: Vec<_> = channels
                .iter()
                .map(|c| {
                    json!({
                        "id": c.channel_id,
                        "kind": c.kind.as_str(),
                        "status": c.status.as_str(),
                        "last_seen": c.last_seen.map(|t| t.to_rfc3339()),
                    })
                })
                .collect();
            Ok(response(id, name, json!({ "channels": channels })))
        }
        Request::ChatList { channel_id } => {
            let chats = gateway.list_chats(channel_id.as_deref()).await?;
            Ok(response(id, name, json!({ "chats": chats })))
        }
        Request::ChatMessages { chat_id, limit } => {
            let messages = gateway
                .list_messages(&chat_id, limit.unwrap_or(50))
                .await?;
            Ok(response(id, name, json!({ "messages": messages })))
        }
        Request::AgentRun(payload) => {
            let requested_by = payload
                .requested_by
                .unwrap_or_else(|| principal.principal_id.clone());
            let run_id = gateway
                .start_run(
                    &payload.chat_id,
                    &payload.channel_id,
                    &requested_by,
                    &payload.prompt,
                )
                .await?;
            Ok(response(id, name, json!({ "run_id": run_id })))
        }
        Request::RunsTail { run_id, after_seq } => {
            // Latch join: the live subscription has been attached since
            // hello, so replay the persisted prefix up to the current
            // watermark as push frames; anything newer arrives live.
            let watermark = gateway.current_seq();
            let events = gateway
                .run_events_after(run_id, after_seq.unwrap_or(0))
                .await?;
            let mut replayed: u64 = 0;
            for event in events.iter().filter(|e| e.seq <= watermark) {
                let _ = out_tx
                    .send(Message::Text(event_frame(event).into()))
                    .await;
                replayed = replayed.saturating_add(1);
            }
            Ok(response(
                id,
                name,
                json!({ "run_id": run_id, "watermark": watermark, "replayed": replayed }),
            ))
        }
        Request::RunsGet { run_id } => {
            let run = gateway.get_run(run_id).await?;
            Ok(response(id, name, json!({ "run": run })))
        }
        Request::RunsCancel { run_id } => {
            gateway.cancel_run(run_id).await?;
            Ok(response(id, name, json!({ "canceled": true })))
        }
        Request::ConfigGet => {
            let (policy, tools) = gateway.get_config();
            Ok(response(id, name, json!({ "policy": policy, "tools": tools })))
        }
        Request::ConfigSet(diff) => {
            let merged = gateway.set_config(diff).await?;
            Ok(response(
                id,
                name,
                json!({ "applied": true, "policy": merged }),
            ))
        }
        Request::ApprovalGrant { run_id } => {
            gateway.grant_approval(run_id, &principal.principal_id)?;
            Ok(response(id, name, json!({ "granted": true })))
        }
        Request::ApprovalDeny { run_id } => {
            gateway.deny_approval(run_id, &principal.principal_id)?;
            Ok(response(id, name, json!({ "denied": true })))
        }
        Request::DoctorAudit => {
            let findings = gateway.audit().await?;
            Ok(response(id, name, json!({ "findings": findings })))
        }
    }
}
