//! Shared fixtures for run-level integration tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use agentgate::bus::{EventFilter, Subscription};
use agentgate::config::{
    parse_api_keys, BreakerConfig, ChannelSeed, Config, LlmConfig, PolicyConfig, RateConfig,
    RunLimits,
};
use agentgate::gateway::Gateway;
use agentgate::llm::{Completion, LlmClient, LlmError, PlanRequest, ResilientClient, ToolCallRequest};
use agentgate::store::Store;
use agentgate::tools::{ToolError, ToolHandler, ToolPermission, ToolRegistry, ToolSpec};
use agentgate::types::{ChannelKind, Event, EventKind};

/// Base configuration: generous limits, echo provider, one webchat channel.
pub fn test_config() -> Config {
    Config {
        host: "127.0.0.1".to_owned(),
        port: 0,
        instance_id: "test".to_owned(),
        principals: parse_api_keys("op:secret").expect("test keys"),
        policy: PolicyConfig::default(),
        rate: RateConfig {
            rps: 1_000.0,
            burst: 1_000,
        },
        limits: RunLimits {
            max_steps: 20,
            timeout_s: 300,
            tool_timeout_s: 5,
            approval_timeout_s: 300,
            llm_timeout_s: 5,
            history_limit: 50,
        },
        llm: LlmConfig {
            provider: "echo".to_owned(),
            api_key: None,
            model: "none".to_owned(),
        },
        breaker: BreakerConfig {
            threshold: 5,
            cooldown_s: 30,
        },
        data_dir: std::path::PathBuf::from("."),
        channels: vec![ChannelSeed {
            channel_id: "wc".to_owned(),
            kind: ChannelKind::WebChat,
        }],
        ping_interval_s: 20,
        ping_timeout_s: 60,
        max_message_bytes: 8_192,
    }
}

/// LLM stub that replays a fixed script of completions, then echoes.
pub struct ScriptedClient {
    script: Mutex<VecDeque<Result<Completion, LlmError>>>,
}

impl ScriptedClient {
    pub fn new(script: Vec<Result<Completion, LlmError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
        })
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    async fn plan(&self, request: &PlanRequest) -> Result<Completion, LlmError> {
        let next = self.script.lock().expect("script lock").pop_front();
        match next {
            Some(result) => result,
            None => {
                let last = request
                    .transcript
                    .last()
                    .map(|t| t.content.clone())
                    .unwrap_or_default();
                Ok(text(&format!("Echo: {last}")))
            }
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// LLM stub that never answers; used to exercise cancellation.
pub struct StalledClient;

#[async_trait]
impl LlmClient for StalledClient {
    async fn plan(&self, _request: &PlanRequest) -> Result<Completion, LlmError> {
        tokio::time::sleep(Duration::from_secs(3_600)).await;
        Ok(Completion::default())
    }

    fn name(&self) -> &'static str {
        "stalled"
    }
}

/// A text-only completion.
pub fn text(content: &str) -> Completion {
    Completion {
        text: Some(content.to_owned()),
        tool_calls: Vec::new(),
    }
}

/// A single-tool completion.
pub fn tool_call(name: &str, args: serde_json::Value) -> Completion {
    Completion {
        text: None,
        tool_calls: vec![ToolCallRequest {
            name: name.to_owned(),
            args,
        }],
    }
}

struct FixedTool {
    output: serde_json::Value,
}

#[async_trait]
impl ToolHandler for FixedTool {
    async fn invoke(&self, _args: &serde_json::Value) -> Result<serde_json::Value, ToolError> {
        Ok(self.output.clone())
    }
}

struct FailingTool;

#[async_trait]
impl ToolHandler for FailingTool {
    async fn invoke(&self, _args: &serde_json::Value) -> Result<serde_json::Value, ToolError> {
        Err(ToolError::Failed("deliberate failure".to_owned()))
    }
}

/// Registry with a read tool (`math.sum` returning `{result: 3}`), a write
/// tool (`email.send`), and a failing write tool (`email.broken`).
pub fn test_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry
        .register(ToolSpec {
            name: "math.sum".to_owned(),
            description: "sum numbers".to_owned(),
            permission: ToolPermission::Read,
            parameter_schema: json!({ "type": "object" }),
            handler: Arc::new(FixedTool {
                output: json!({ "result": 3 }),
            }),
        })
        .expect("register math.sum");
    registry
        .register(ToolSpec {
            name: "email.send".to_owned(),
            description: "send email".to_owned(),
            permission: ToolPermission::Write,
            parameter_schema: json!({ "type": "object" }),
            handler: Arc::new(FixedTool {
                output: json!({ "queued": true }),
            }),
        })
        .expect("register email.send");
    registry
        .register(ToolSpec {
            name: "email.broken".to_owned(),
            description: "always fails".to_owned(),
            permission: ToolPermission::Write,
            parameter_schema: json!({ "type": "object" }),
            handler: Arc::new(FailingTool),
        })
        .expect("register email.broken");
    registry
}

/// Assemble a bootstrapped gateway over an in-memory store.
pub async fn gateway_with(config: Config, client: Arc<dyn LlmClient>) -> Gateway {
    let store = Store::open_in_memory().await.expect("store");
    let llm = Arc::new(ResilientClient::new(
        client,
        Duration::from_secs(config.limits.llm_timeout_s),
        config.breaker,
    ));
    let gateway = Gateway::new(config, store, test_registry(), llm);
    gateway.bootstrap().await.expect("bootstrap");
    gateway
}

/// Collect a run's events until (and including) its terminal event.
pub async fn collect_run_events(subscription: &Subscription, run_id: uuid::Uuid) -> Vec<Event> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), subscription.recv())
            .await
            .expect("timed out waiting for run events")
            .expect("bus closed");
        if event.run_id != Some(run_id) {
            continue;
        }
        let terminal = event.kind == EventKind::RunCompleted;
        events.push(event);
        if terminal {
            return events;
        }
    }
}

/// Subscribe to everything.
pub fn subscribe_all(gateway: &Gateway) -> Subscription {
    gateway.subscribe(EventFilter::all())
}
