//! Durability across process restarts, simulated by reopening the store.

use chrono::Utc;
use tempfile::TempDir;
use uuid::Uuid;

use agentgate::config::PolicyConfig;
use agentgate::store::Store;
use agentgate::types::{
    AgentRun, Channel, ChannelKind, ChannelStatus, Event, EventKind, RunStatus,
};

fn sample_run() -> AgentRun {
    AgentRun {
        run_id: Uuid::new_v4(),
        chat_id: "c1".to_owned(),
        channel_id: "wc".to_owned(),
        requested_by: "op".to_owned(),
        status: RunStatus::Pending,
        step: 0,
        max_steps: 20,
        deadline: Utc::now()
            .checked_add_signed(chrono::TimeDelta::seconds(300))
            .expect("deadline"),
        output_text: None,
        error: None,
        created_at: Utc::now(),
        ended_at: None,
    }
}

#[tokio::test]
async fn test_policy_survives_restart() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("gateway.db");

    {
        let store = Store::open(&path, 2).await.expect("open");
        let mut policy = PolicyConfig::default();
        policy.tool_allowlist.insert("math.sum".to_owned(), true);
        policy.require_approval_for_write = false;
        store.save_policy(&policy).await.expect("save");
    }

    let store = Store::open(&path, 2).await.expect("reopen");
    let policy = store.load_policy().await.expect("load").expect("present");
    assert_eq!(policy.tool_allowlist.get("math.sum"), Some(&true));
    assert!(!policy.require_approval_for_write);
}

#[tokio::test]
async fn test_runs_and_events_survive_restart() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("gateway.db");
    let run = sample_run();

    {
        let store = Store::open(&path, 2).await.expect("open");
        store
            .upsert_channel(&Channel {
                channel_id: "wc".to_owned(),
                kind: ChannelKind::WebChat,
                status: ChannelStatus::Online,
                last_seen: Some(Utc::now()),
            })
            .await
            .expect("channel");
        store.insert_run(&run).await.expect("run");
        for seq in 1..=3_u64 {
            store
                .append_event(&Event {
                    seq,
                    kind: EventKind::RunProgress,
                    ts: Utc::now(),
                    run_id: Some(run.run_id),
                    channel_id: None,
                    payload: serde_json::json!({ "seq": seq }),
                })
                .await
                .expect("event");
        }
    }

    let store = Store::open(&path, 2).await.expect("reopen");
    let loaded = store.get_run(run.run_id).await.expect("get").expect("row");
    assert_eq!(loaded.status, RunStatus::Pending);
    assert_eq!(loaded.chat_id, "c1");

    let events = store
        .events_for_run_after(run.run_id, 0)
        .await
        .expect("events");
    assert_eq!(events.len(), 3);
    assert!(events.windows(2).all(|p| p[1].seq > p[0].seq));

    let channels = store.list_channels().await.expect("channels");
    assert_eq!(channels.len(), 1);
    assert_eq!(channels[0].kind, ChannelKind::WebChat);
}
