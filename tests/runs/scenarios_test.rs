//! End-to-end run scenarios against an in-memory gateway.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use agentgate::llm::{EchoClient, LlmError};
use agentgate::types::{EventKind, RunErrorKind, RunStatus};

use super::harness::{
    collect_run_events, gateway_with, subscribe_all, test_config, text, tool_call, ScriptedClient,
};

fn kinds(events: &[agentgate::types::Event]) -> Vec<EventKind> {
    events.iter().map(|e| e.kind).collect()
}

// S1: echo run, no tools.
#[tokio::test]
async fn test_echo_run_without_tools() {
    let gateway = gateway_with(test_config(), Arc::new(EchoClient)).await;
    let subscription = subscribe_all(&gateway);

    let run_id = gateway
        .start_run("c1", "wc", "op", "hi")
        .await
        .expect("start run");
    let events = collect_run_events(&subscription, run_id).await;

    let kinds = kinds(&events);
    assert!(kinds.contains(&EventKind::RunProgress));
    assert!(kinds.contains(&EventKind::RunOutput));
    assert_eq!(*kinds.last().expect("terminal"), EventKind::RunCompleted);

    let phases: Vec<&str> = events
        .iter()
        .filter(|e| e.kind == EventKind::RunProgress)
        .filter_map(|e| e.payload["phase"].as_str())
        .collect();
    assert_eq!(phases, vec!["start", "plan_end"]);

    let output = events
        .iter()
        .find(|e| e.kind == EventKind::RunOutput)
        .expect("output event");
    assert!(output.payload["text"].as_str().expect("text").contains("hi"));

    let terminal = events.last().expect("terminal");
    assert_eq!(terminal.payload["status"], "completed");

    let run = gateway.get_run(run_id).await.expect("run row");
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.ended_at.is_some());
    assert!(run.output_text.expect("output").contains("hi"));
}

// S2: read tool run.
#[tokio::test]
async fn test_read_tool_run() {
    let mut config = test_config();
    config.policy.tool_allowlist.insert("math.sum".to_owned(), true);

    let client = ScriptedClient::new(vec![
        Ok(tool_call("math.sum", json!({ "values": [1, 2] }))),
        Ok(text("The sum is 3.")),
    ]);
    let gateway = gateway_with(config, client).await;
    let subscription = subscribe_all(&gateway);

    let run_id = gateway
        .start_run("c1", "wc", "op", "sum 1 and 2")
        .await
        .expect("start run");
    let events = collect_run_events(&subscription, run_id).await;

    let call = events
        .iter()
        .find(|e| e.kind == EventKind::RunToolCall)
        .expect("tool call event");
    assert_eq!(call.payload["tool"], "math.sum");
    assert_eq!(call.payload["approval_required"], false);

    let result = events
        .iter()
        .find(|e| {
            e.kind == EventKind::RunProgress && e.payload["phase"] == "tool_result"
        })
        .expect("tool result progress");
    assert_eq!(result.payload["ok"], true);

    let output = events
        .iter()
        .find(|e| e.kind == EventKind::RunOutput)
        .expect("output event");
    assert!(output.payload["text"].as_str().expect("text").contains('3'));

    assert_eq!(events.last().expect("terminal").payload["status"], "completed");
}

// S3: write tool requiring approval, granted in time.
#[tokio::test]
async fn test_write_tool_approval_granted() {
    let mut config = test_config();
    config
        .policy
        .tool_allowlist
        .insert("email.send".to_owned(), true);

    let client = ScriptedClient::new(vec![
        Ok(tool_call("email.send", json!({ "to": "user@example.com" }))),
        Ok(text("Email queued.")),
    ]);
    let gateway = gateway_with(config, client).await;
    let subscription = subscribe_all(&gateway);

    let run_id = gateway
        .start_run("c1", "wc", "op", "email the report")
        .await
        .expect("start run");

    // Pull events, granting as soon as the approval is announced.
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), subscription.recv())
            .await
            .expect("event wait")
            .expect("bus open");
        if event.run_id != Some(run_id) {
            continue;
        }
        let kind = event.kind;
        events.push(event);
        match kind {
            EventKind::ApprovalRequired => {
                gateway.grant_approval(run_id, "op").expect("grant");
            }
            EventKind::RunCompleted => break,
            _ => {}
        }
    }

    let calls: Vec<bool> = events
        .iter()
        .filter(|e| e.kind == EventKind::RunToolCall)
        .map(|e| e.payload["approval_required"].as_bool().expect("flag"))
        .collect();
    // The gated announcement comes strictly before the execution one.
    assert_eq!(calls, vec![true, false]);

    assert_eq!(events.last().expect("terminal").payload["status"], "completed");
    let run = gateway.get_run(run_id).await.expect("run row");
    assert_eq!(run.status, RunStatus::Completed);
}

// S4: approval never granted.
#[tokio::test]
async fn test_write_tool_approval_timeout() {
    let mut config = test_config();
    config
        .policy
        .tool_allowlist
        .insert("email.send".to_owned(), true);
    config.limits.approval_timeout_s = 1;

    let client = ScriptedClient::new(vec![Ok(tool_call(
        "email.send",
        json!({ "to": "user@example.com" }),
    ))]);
    let gateway = gateway_with(config, client).await;
    let subscription = subscribe_all(&gateway);

    let run_id = gateway
        .start_run("c1", "wc", "op", "email the report")
        .await
        .expect("start run");
    let events = collect_run_events(&subscription, run_id).await;

    let terminal = events.last().expect("terminal");
    assert_eq!(terminal.payload["status"], "failed");
    assert_eq!(terminal.payload["error"]["kind"], "approval_timeout");

    let run = gateway.get_run(run_id).await.expect("run row");
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(
        run.error.expect("error").kind,
        RunErrorKind::ApprovalTimeout
    );
}

// S5: tool outside the allowlist.
#[tokio::test]
async fn test_policy_denied_tool_yields_clarification() {
    let config = test_config(); // empty allowlist
    let client = ScriptedClient::new(vec![Ok(tool_call("dangerous.drop", json!({})))]);
    let gateway = gateway_with(config, client).await;
    let subscription = subscribe_all(&gateway);

    let run_id = gateway
        .start_run("c1", "wc", "op", "drop the tables")
        .await
        .expect("start run");
    let events = collect_run_events(&subscription, run_id).await;

    let blocked = events
        .iter()
        .find(|e| e.kind == EventKind::SecurityBlocked)
        .expect("blocked event");
    assert_eq!(blocked.payload["reason"], "tool_not_allowlisted");
    assert_eq!(blocked.payload["tool"], "dangerous.drop");

    // The user still hears back, and the run completes normally.
    let blocked_pos = events
        .iter()
        .position(|e| e.kind == EventKind::SecurityBlocked)
        .expect("blocked position");
    let output_pos = events
        .iter()
        .position(|e| e.kind == EventKind::RunOutput)
        .expect("output position");
    assert!(blocked_pos < output_pos);
    assert_eq!(events.last().expect("terminal").payload["status"], "completed");
}

// S6: the planner never stops calling tools.
#[tokio::test]
async fn test_step_limit_exhaustion() {
    let mut config = test_config();
    config.policy.tool_allowlist.insert("math.sum".to_owned(), true);
    config.limits.max_steps = 2;

    let client = ScriptedClient::new(vec![
        Ok(tool_call("math.sum", json!({ "values": [1] }))),
        Ok(tool_call("math.sum", json!({ "values": [2] }))),
        // Never reached: the budget runs out first.
        Ok(tool_call("math.sum", json!({ "values": [3] }))),
    ]);
    let gateway = gateway_with(config, client).await;
    let subscription = subscribe_all(&gateway);

    let run_id = gateway
        .start_run("c1", "wc", "op", "keep summing")
        .await
        .expect("start run");
    let events = collect_run_events(&subscription, run_id).await;

    let tool_calls = events
        .iter()
        .filter(|e| e.kind == EventKind::RunToolCall)
        .count();
    assert_eq!(tool_calls, 2);

    let terminal = events.last().expect("terminal");
    assert_eq!(terminal.payload["status"], "failed");
    assert_eq!(terminal.payload["error"]["kind"], "step_limit");
}

// Planner failure after retries surfaces as llm_unavailable.
#[tokio::test]
async fn test_llm_failure_fails_run() {
    let client = ScriptedClient::new(vec![
        Err(LlmError::Transport("down".to_owned())),
        Err(LlmError::Transport("down".to_owned())),
        Err(LlmError::Transport("down".to_owned())),
    ]);
    let gateway = gateway_with(test_config(), client).await;
    let subscription = subscribe_all(&gateway);

    let run_id = gateway
        .start_run("c1", "wc", "op", "hello?")
        .await
        .expect("start run");
    let events = collect_run_events(&subscription, run_id).await;

    let terminal = events.last().expect("terminal");
    assert_eq!(terminal.payload["status"], "failed");
    assert_eq!(terminal.payload["error"]["kind"], "llm_unavailable");
}

// A failing write tool (pre-approved away) finalizes the run.
#[tokio::test]
async fn test_write_tool_failure_is_terminal() {
    let mut config = test_config();
    config
        .policy
        .tool_allowlist
        .insert("email.broken".to_owned(), true);
    config.policy.require_approval_for_write = false;

    let client = ScriptedClient::new(vec![Ok(tool_call("email.broken", json!({})))]);
    let gateway = gateway_with(config, client).await;
    let subscription = subscribe_all(&gateway);

    let run_id = gateway
        .start_run("c1", "wc", "op", "send it")
        .await
        .expect("start run");
    let events = collect_run_events(&subscription, run_id).await;

    let result = events
        .iter()
        .find(|e| e.kind == EventKind::RunProgress && e.payload["phase"] == "tool_result")
        .expect("tool result");
    assert_eq!(result.payload["ok"], false);

    let terminal = events.last().expect("terminal");
    assert_eq!(terminal.payload["status"], "failed");
    assert_eq!(terminal.payload["error"]["kind"], "tool_failed");
}
