//! LLM provider abstraction.
//!
//! Providers return a raw [`Completion`]; the orchestrator consumes the
//! normalized [`PlanOutcome`], a closed sum, never an untyped blob inspected
//! at runtime. The [`ResilientClient`] wrapper owns the reliability story:
//! per-call timeout, exponential backoff with jitter, and a circuit breaker
//! that fails fast while the provider is known-bad.

pub mod anthropic;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{BreakerConfig, LlmConfig};

/// Initial retry delay.
const BACKOFF_INITIAL: Duration = Duration::from_millis(250);
/// Multiplier between retry delays.
const BACKOFF_FACTOR: u32 = 2;
/// Total attempts per plan call.
const MAX_ATTEMPTS: u32 = 3;

/// Role of a transcript turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// End-user or channel message.
    User,
    /// Prior model output.
    Assistant,
}

/// One turn of the conversation shipped to the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    /// Who said it.
    pub role: Role,
    /// Plain-text content.
    pub content: String,
}

/// Tool surface advertised to the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Namespaced tool name.
    pub name: String,
    /// Description shown to the model.
    pub description: String,
    /// JSON Schema for the arguments.
    pub parameter_schema: serde_json::Value,
}

/// A planning request: system context, transcript, and available tools.
#[derive(Debug, Clone)]
pub struct PlanRequest {
    /// System prompt.
    pub system: String,
    /// Conversation so far, oldest first.
    pub transcript: Vec<ChatTurn>,
    /// Tools the model may call.
    pub tools: Vec<ToolDescriptor>,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallRequest {
    /// Namespaced tool name.
    pub name: String,
    /// JSON arguments.
    pub args: serde_json::Value,
}

/// Raw provider output before normalization.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    /// Concatenated text blocks, if any.
    pub text: Option<String>,
    /// Tool calls in the order the model emitted them.
    pub tool_calls: Vec<ToolCallRequest>,
}

/// Normalized planner verdict consumed by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanOutcome {
    /// The model answered in text.
    Text(String),
    /// The model wants a tool invoked.
    Tool {
        /// Namespaced tool name.
        name: String,
        /// JSON arguments.
        args: serde_json::Value,
        /// Text the model emitted alongside the call, kept as a transient
        /// transcript note.
        note: Option<String>,
        /// How many extra tool calls were discarded.
        discarded: usize,
    },
    /// The model declined to answer.
    Abstain,
}

/// Collapse a raw completion into the planner sum type.
///
/// Tie-breaks: a tool call wins over text (the text becomes a note); extra
/// tool calls beyond the first are discarded and counted.
pub fn normalize(completion: Completion) -> PlanOutcome {
    let text = completion
        .text
        .map(|t| t.trim().to_owned())
        .filter(|t| !t.is_empty());

    let mut calls = completion.tool_calls.into_iter();
    if let Some(first) = calls.next() {
        return PlanOutcome::Tool {
            name: first.name,
            args: first.args,
            note: text,
            discarded: calls.count(),
        };
    }

    match text {
        Some(t) => PlanOutcome::Text(t),
        None => PlanOutcome::Abstain,
    }
}

/// Provider failures.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Network-level failure or non-success HTTP status.
    #[error("llm transport error: {0}")]
    Transport(String),
    /// The call exceeded the configured timeout.
    #[error("llm call timed out")]
    Timeout,
    /// The provider answered with something unparseable.
    #[error("llm protocol error: {0}")]
    Protocol(String),
    /// The circuit breaker is open.
    #[error("llm circuit open")]
    CircuitOpen,
}

/// A planning backend.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Produce a completion for the request.
    async fn plan(&self, request: &PlanRequest) -> Result<Completion, LlmError>;

    /// Short provider name for logs and health checks.
    fn name(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// Echo client
// ---------------------------------------------------------------------------

/// Deterministic offline client used when no provider key is configured.
///
/// Echoes the newest user turn, which keeps the whole control plane usable
/// (and end-to-end testable) without network access.
#[derive(Debug, Default)]
pub struct EchoClient;

#[async_trait]
impl LlmClient for EchoClient {
    async fn plan(&self, request: &PlanRequest) -> Result<Completion, LlmError> {
        let last_user = request
            .transcript
            .iter()
            .rev()
            .find(|turn| turn.role == Role::User)
            .map(|turn| turn.content.as_str())
            .unwrap_or("(empty)");
        Ok(Completion {
            text: Some(format!("Echo: {last_user}")),
            tool_calls: Vec::new(),
        })
    }

    fn name(&self) -> &'static str {
        "echo"
    }
}

/// Build the configured provider, falling back to [`EchoClient`] when no API
/// key is present.
pub fn build_client(config: &LlmConfig) -> Arc<dyn LlmClient> {
    match (config.provider.as_str(), &config.api_key) {
        ("anthropic", Some(key)) => Arc::new(anthropic::AnthropicClient::new(
            key.clone(),
            config.model.clone(),
        )),
        (provider, _) => {
            info!(provider, "no usable LLM credentials, using echo client");
            Arc::new(EchoClient)
        }
    }
}

// ---------------------------------------------------------------------------
// Resilient wrapper
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Reliability wrapper: timeout, retry with jittered exponential backoff, and
/// a consecutive-failure circuit breaker.
pub struct ResilientClient {
    inner: Arc<dyn LlmClient>,
    call_timeout: Duration,
    breaker: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl std::fmt::Debug for ResilientClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientClient")
            .field("provider", &self.inner.name())
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl ResilientClient {
    /// Wrap a provider with the given per-call timeout and breaker tuning.
    pub fn new(inner: Arc<dyn LlmClient>, call_timeout: Duration, breaker: BreakerConfig) -> Self {
        Self {
            inner,
            call_timeout,
            breaker,
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// Whether the circuit is currently open.
    pub fn circuit_open(&self) -> bool {
        let state = lock(&self.state);
        match state.opened_at {
            Some(at) => at.elapsed() < Duration::from_secs(self.breaker.cooldown_s),
            None => false,
        }
    }

    /// Provider name, for health checks.
    pub fn provider_name(&self) -> &'static str {
        self.inner.name()
    }

    /// Plan with retries. Transient failures back off 250 ms, ×2, up to three
    /// attempts with ±20% jitter; an open circuit fails immediately.
    ///
    /// # Errors
    ///
    /// Returns the final attempt's error, or [`LlmError::CircuitOpen`].
    pub async fn plan(&self, request: &PlanRequest) -> Result<Completion, LlmError> {
        if self.circuit_open() {
            return Err(LlmError::CircuitOpen);
        }

        let mut delay = BACKOFF_INITIAL;
        let mut attempt: u32 = 1;
        loop {
            let result = tokio::time::timeout(self.call_timeout, self.inner.plan(request)).await;
            match result {
                Ok(Ok(completion)) => {
                    let mut state = lock(&self.state);
                    state.consecutive_failures = 0;
                    state.opened_at = None;
                    return Ok(completion);
                }
                Ok(Err(err)) if attempt >= MAX_ATTEMPTS => {
                    self.record_failure();
                    return Err(err);
                }
                Err(_) if attempt >= MAX_ATTEMPTS => {
                    self.record_failure();
                    return Err(LlmError::Timeout);
                }
                Ok(Err(err)) => {
                    warn!(attempt, error = %err, "llm call failed, retrying");
                }
                Err(_) => {
                    warn!(attempt, "llm call timed out, retrying");
                }
            }

            tokio::time::sleep(jittered(delay)).await;
            delay = delay.saturating_mul(BACKOFF_FACTOR);
            attempt = attempt.saturating_add(1);
        }
    }

    fn record_failure(&self) {
        let mut state = lock(&self.state);
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if state.consecutive_failures >= self.breaker.threshold {
            if state.opened_at.is_none() {
                warn!(
                    failures = state.consecutive_failures,
                    cooldown_s = self.breaker.cooldown_s,
                    "llm circuit opened"
                );
            }
            state.opened_at = Some(Instant::now());
        }
    }
}

/// Apply ±20% jitter to a delay.
fn jittered(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8_f64..=1.2_f64);
    delay.mul_f64(factor)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;

    use super::*;

    #[test]
    fn test_normalize_text_only() {
        let outcome = normalize(Completion {
            text: Some("hello".to_owned()),
            tool_calls: Vec::new(),
        });
        assert_eq!(outcome, PlanOutcome::Text("hello".to_owned()));
    }

    #[test]
    fn test_normalize_empty_is_abstain() {
        assert_eq!(normalize(Completion::default()), PlanOutcome::Abstain);
        let outcome = normalize(Completion {
            text: Some("   ".to_owned()),
            tool_calls: Vec::new(),
        });
        assert_eq!(outcome, PlanOutcome::Abstain);
    }

    #[test]
    fn test_normalize_tool_wins_over_text() {
        let outcome = normalize(Completion {
            text: Some("let me check".to_owned()),
            tool_calls: vec![ToolCallRequest {
                name: "math.sum".to_owned(),
                args: json!({ "values": [1, 2] }),
            }],
        });
        match outcome {
            PlanOutcome::Tool { name, note, discarded, .. } => {
                assert_eq!(name, "math.sum");
                assert_eq!(note.as_deref(), Some("let me check"));
                assert_eq!(discarded, 0);
            }
            other => panic!("expected tool outcome, got {other:?}"),
        }
    }

    #[test]
    fn test_normalize_takes_first_tool_and_counts_discards() {
        let outcome = normalize(Completion {
            text: None,
            tool_calls: vec![
                ToolCallRequest {
                    name: "math.sum".to_owned(),
                    args: json!({}),
                },
                ToolCallRequest {
                    name: "time.now".to_owned(),
                    args: json!({}),
                },
                ToolCallRequest {
                    name: "email.send".to_owned(),
                    args: json!({}),
                },
            ],
        });
        match outcome {
            PlanOutcome::Tool { name, discarded, .. } => {
                assert_eq!(name, "math.sum");
                assert_eq!(discarded, 2);
            }
            other => panic!("expected tool outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_echo_client_echoes_last_user_turn() {
        let client = EchoClient;
        let completion = client
            .plan(&PlanRequest {
                system: String::new(),
                transcript: vec![
                    ChatTurn {
                        role: Role::User,
                        content: "hi".to_owned(),
                    },
                    ChatTurn {
                        role: Role::Assistant,
                        content: "hello".to_owned(),
                    },
                ],
                tools: Vec::new(),
            })
            .await
            .expect("plan");
        assert_eq!(completion.text.as_deref(), Some("Echo: hi"));
    }

    struct FlakyClient {
        failures_before_success: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl LlmClient for FlakyClient {
        async fn plan(&self, _request: &PlanRequest) -> Result<Completion, LlmError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                Err(LlmError::Transport("boom".to_owned()))
            } else {
                Ok(Completion {
                    text: Some("ok".to_owned()),
                    tool_calls: Vec::new(),
                })
            }
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    fn request() -> PlanRequest {
        PlanRequest {
            system: String::new(),
            transcript: Vec::new(),
            tools: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_resilient_retries_transient_failures() {
        let client = ResilientClient::new(
            Arc::new(FlakyClient {
                failures_before_success: 2,
                calls: AtomicU32::new(0),
            }),
            Duration::from_secs(5),
            BreakerConfig {
                threshold: 5,
                cooldown_s: 30,
            },
        );
        let completion = client.plan(&request()).await.expect("plan after retries");
        assert_eq!(completion.text.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn test_resilient_gives_up_after_three_attempts() {
        let inner = Arc::new(FlakyClient {
            failures_before_success: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let client = ResilientClient::new(
            Arc::clone(&inner) as Arc<dyn LlmClient>,
            Duration::from_secs(5),
            BreakerConfig {
                threshold: 5,
                cooldown_s: 30,
            },
        );
        let result = client.plan(&request()).await;
        assert!(matches!(result, Err(LlmError::Transport(_))));
        assert_eq!(inner.calls.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_circuit_opens_after_threshold() {
        let inner = Arc::new(FlakyClient {
            failures_before_success: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let client = ResilientClient::new(
            Arc::clone(&inner) as Arc<dyn LlmClient>,
            Duration::from_secs(5),
            BreakerConfig {
                threshold: 1,
                cooldown_s: 60,
            },
        );

        assert!(client.plan(&request()).await.is_err());
        assert!(client.circuit_open());

        // Second call fails fast without touching the provider.
        let calls_before = inner.calls.load(Ordering::SeqCst);
        let result = client.plan(&request()).await;
        assert!(matches!(result, Err(LlmError::CircuitOpen)));
        assert_eq!(inner.calls.load(Ordering::SeqCst), calls_before);
    }
}
