//! Configuration loading and validation.
//!
//! All runtime configuration arrives through the environment (prefix
//! `AGENTGATE_`), loaded once at startup. The policy block is special: it can
//! be mutated at runtime through `config.set` on the control plane, and the
//! merged result is persisted so it survives restarts.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::{ChannelKind, Principal};

/// Default WebSocket/HTTP bind host.
const DEFAULT_HOST: &str = "127.0.0.1";
/// Default WebSocket/HTTP bind port.
const DEFAULT_PORT: u16 = 8787;
/// Default plan-call budget per run.
const DEFAULT_MAX_STEPS: u32 = 20;
/// Default per-run wall-clock timeout in seconds.
const DEFAULT_RUN_TIMEOUT_S: u64 = 300;
/// Default per-tool-call timeout in seconds.
const DEFAULT_TOOL_TIMEOUT_S: u64 = 30;
/// Default approval window in seconds.
const DEFAULT_APPROVAL_TIMEOUT_S: u64 = 300;
/// Default per-LLM-call timeout in seconds.
const DEFAULT_LLM_TIMEOUT_S: u64 = 60;
/// Default token refill rate per principal, tokens/second.
const DEFAULT_RATE_RPS: f64 = 5.0;
/// Default bucket capacity per principal.
const DEFAULT_RATE_BURST: u32 = 10;
/// Default consecutive-failure threshold before the LLM circuit opens.
const DEFAULT_BREAKER_THRESHOLD: u32 = 5;
/// Default circuit-open cooldown in seconds.
const DEFAULT_BREAKER_COOLDOWN_S: u64 = 30;
/// Default heartbeat interval in seconds.
const DEFAULT_PING_INTERVAL_S: u64 = 20;
/// Default idle window before a silent socket is closed, in seconds.
const DEFAULT_PING_TIMEOUT_S: u64 = 60;
/// Default chat-history window loaded into a run's context.
const DEFAULT_HISTORY_LIMIT: u32 = 50;
/// Default cap on sanitized inbound message length, in bytes.
const DEFAULT_MAX_MESSAGE_BYTES: usize = 8_192;

/// Scope default for chats without an allowlist verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopePolicy {
    /// Admit by default.
    Allow,
    /// Reject by default.
    Deny,
}

/// Authorization configuration, mutable at runtime via `config.set`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Permitted sender ids per channel. An empty set denies every sender.
    #[serde(default)]
    pub channel_allowlist: BTreeMap<String, BTreeSet<String>>,
    /// Tools the planner may invoke. Absent or `false` means denied.
    #[serde(default)]
    pub tool_allowlist: BTreeMap<String, bool>,
    /// Whether write tools require a human approval before executing.
    #[serde(default = "default_true")]
    pub require_approval_for_write: bool,
    /// Default verdict for direct chats.
    #[serde(default = "default_allow")]
    pub dm_policy: ScopePolicy,
    /// Default verdict for group chats.
    #[serde(default = "default_deny")]
    pub group_policy: ScopePolicy,
}

fn default_true() -> bool {
    true
}

fn default_allow() -> ScopePolicy {
    ScopePolicy::Allow
}

fn default_deny() -> ScopePolicy {
    ScopePolicy::Deny
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            channel_allowlist: BTreeMap::new(),
            tool_allowlist: BTreeMap::new(),
            require_approval_for_write: true,
            dm_policy: ScopePolicy::Allow,
            group_policy: ScopePolicy::Deny,
        }
    }
}

/// Partial policy update carried by `config.set`. Absent fields are left
/// untouched; present fields replace the corresponding block wholesale.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyDiff {
    /// Replacement channel allowlist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowlist: Option<BTreeMap<String, BTreeSet<String>>>,
    /// Replacement tool allowlist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_allow: Option<BTreeMap<String, bool>>,
    /// Replacement direct-chat default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dm_policy: Option<ScopePolicy>,
    /// Replacement group-chat default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_policy: Option<ScopePolicy>,
    /// Replacement write-approval flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_approval_for_write: Option<bool>,
}

impl PolicyConfig {
    /// Apply a partial update, replacing only the blocks the diff carries.
    pub fn merge(&mut self, diff: PolicyDiff) {
        if let Some(allowlist) = diff.allowlist {
            self.channel_allowlist = allowlist;
        }
        if let Some(tools) = diff.tool_allow {
            self.tool_allowlist = tools;
        }
        if let Some(dm) = diff.dm_policy {
            self.dm_policy = dm;
        }
        if let Some(group) = diff.group_policy {
            self.group_policy = group;
        }
        if let Some(require) = diff.require_approval_for_write {
            self.require_approval_for_write = require;
        }
    }
}

/// Rate limiter tuning.
#[derive(Debug, Clone, Copy)]
pub struct RateConfig {
    /// Token refill rate, tokens per second.
    pub rps: f64,
    /// Bucket capacity.
    pub burst: u32,
}

/// Per-run budgets and timeouts, all in seconds unless noted.
#[derive(Debug, Clone, Copy)]
pub struct RunLimits {
    /// Plan-call budget per run.
    pub max_steps: u32,
    /// Wall-clock timeout per run.
    pub timeout_s: u64,
    /// Timeout per tool invocation.
    pub tool_timeout_s: u64,
    /// Approval window per write tool.
    pub approval_timeout_s: u64,
    /// Timeout per LLM call.
    pub llm_timeout_s: u64,
    /// Chat-history window loaded into context.
    pub history_limit: u32,
}

/// LLM provider selection.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Provider name: `"anthropic"` or `"echo"`.
    pub provider: String,
    /// Provider API key; absent means the deterministic echo client.
    pub api_key: Option<String>,
    /// Model identifier passed to the provider.
    pub model: String,
}

/// Circuit breaker tuning for the LLM adapter.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub threshold: u32,
    /// Seconds the circuit stays open.
    pub cooldown_s: u64,
}

/// A channel to create at startup.
#[derive(Debug, Clone)]
pub struct ChannelSeed {
    /// Channel identifier, unique across the gateway.
    pub channel_id: String,
    /// Transport family.
    pub kind: ChannelKind,
}

/// Complete gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Instance identifier reported in `res:hello`.
    pub instance_id: String,
    /// Authenticated principals, keys already hashed.
    pub principals: Vec<Principal>,
    /// Initial policy; superseded by a persisted policy row when present.
    pub policy: PolicyConfig,
    /// Rate limiter tuning.
    pub rate: RateConfig,
    /// Run budgets and timeouts.
    pub limits: RunLimits,
    /// LLM provider selection.
    pub llm: LlmConfig,
    /// Circuit breaker tuning.
    pub breaker: BreakerConfig,
    /// Data directory holding the SQLite database and logs.
    pub data_dir: PathBuf,
    /// Channels created at startup.
    pub channels: Vec<ChannelSeed>,
    /// Heartbeat interval in seconds.
    pub ping_interval_s: u64,
    /// Idle window before a silent socket is closed, in seconds.
    pub ping_timeout_s: u64,
    /// Cap on sanitized inbound message length, in bytes.
    pub max_message_bytes: usize,
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable was present but unparseable.
    #[error("invalid {key}: {detail}")]
    Invalid {
        /// Environment variable name.
        key: &'static str,
        /// What was wrong with it.
        detail: String,
    },
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// Every variable has a default except `AGENTGATE_API_KEYS`, which
    /// defaults to empty (no principal can authenticate until keys are set).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a present variable fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env_or("AGENTGATE_HOST", DEFAULT_HOST);
        let port = parse_env("AGENTGATE_PORT", DEFAULT_PORT)?;
        let instance_id = env_or("AGENTGATE_INSTANCE_ID", "agentgate-dev");

        let principals = parse_api_keys(&env_or("AGENTGATE_API_KEYS", ""))
            .map_err(|detail| ConfigError::Invalid {
                key: "AGENTGATE_API_KEYS",
                detail,
            })?;

        let channels = parse_channels(&env_or("AGENTGATE_CHANNELS", "wc:webchat"))
            .map_err(|detail| ConfigError::Invalid {
                key: "AGENTGATE_CHANNELS",
                detail,
            })?;

        let mut policy = PolicyConfig {
            channel_allowlist: parse_channel_allowlist(&env_or("AGENTGATE_CHANNEL_ALLOWLIST", "")),
            tool_allowlist: parse_tool_allowlist(&env_or("AGENTGATE_TOOL_ALLOWLIST", "")),
            require_approval_for_write: parse_env("AGENTGATE_REQUIRE_APPROVAL_FOR_WRITE", true)?,
            ..PolicyConfig::default()
        };
        if let Some(dm) = parse_scope_policy(&env_or("AGENTGATE_DM_POLICY", "allow")) {
            policy.dm_policy = dm;
        }
        if let Some(group) = parse_scope_policy(&env_or("AGENTGATE_GROUP_POLICY", "deny")) {
            policy.group_policy = group;
        }

        Ok(Self {
            host,
            port,
            instance_id,
            principals,
            policy,
            rate: RateConfig {
                rps: parse_env("AGENTGATE_RATE_RPS", DEFAULT_RATE_RPS)?,
                burst: parse_env("AGENTGATE_RATE_BURST", DEFAULT_RATE_BURST)?,
            },
            limits: RunLimits {
                max_steps: parse_env("AGENTGATE_MAX_STEPS", DEFAULT_MAX_STEPS)?,
                timeout_s: parse_env("AGENTGATE_RUN_TIMEOUT_S", DEFAULT_RUN_TIMEOUT_S)?,
                tool_timeout_s: parse_env("AGENTGATE_TOOL_TIMEOUT_S", DEFAULT_TOOL_TIMEOUT_S)?,
                approval_timeout_s: parse_env(
                    "AGENTGATE_APPROVAL_TIMEOUT_S",
                    DEFAULT_APPROVAL_TIMEOUT_S,
                )?,
                llm_timeout_s: parse_env("AGENTGATE_LLM_TIMEOUT_S", DEFAULT_LLM_TIMEOUT_S)?,
                history_limit: parse_env("AGENTGATE_HISTORY_LIMIT", DEFAULT_HISTORY_LIMIT)?,
            },
            llm: LlmConfig {
                provider: env_or("AGENTGATE_LLM_PROVIDER", "anthropic"),
                api_key: std::env::var("AGENTGATE_LLM_API_KEY").ok().filter(|k| !k.is_empty()),
                model: env_or("AGENTGATE_LLM_MODEL", "claude-sonnet-4-20250514"),
            },
            breaker: BreakerConfig {
                threshold: parse_env("AGENTGATE_BREAKER_THRESHOLD", DEFAULT_BREAKER_THRESHOLD)?,
                cooldown_s: parse_env("AGENTGATE_BREAKER_COOLDOWN_S", DEFAULT_BREAKER_COOLDOWN_S)?,
            },
            data_dir: PathBuf::from(env_or("AGENTGATE_DATA_DIR", "./data")),
            channels,
            ping_interval_s: parse_env("AGENTGATE_PING_INTERVAL_S", DEFAULT_PING_INTERVAL_S)?,
            ping_timeout_s: parse_env("AGENTGATE_PING_TIMEOUT_S", DEFAULT_PING_TIMEOUT_S)?,
            max_message_bytes: parse_env("AGENTGATE_MAX_MESSAGE_BYTES", DEFAULT_MAX_MESSAGE_BYTES)?,
        })
    }
}

/// SHA-256 hex digest of an API key, the only form the process retains.
pub fn hash_api_key(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Parse helpers
// ---------------------------------------------------------------------------

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            detail: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

/// Parse `"op:secret1,admin:secret2"` into hashed principals.
///
/// # Errors
///
/// Returns a description of the malformed entry.
pub fn parse_api_keys(raw: &str) -> Result<Vec<Principal>, String> {
    let mut principals = Vec::new();
    for entry in raw.split(',').filter(|e| !e.trim().is_empty()) {
        let (id, key) = entry
            .trim()
            .split_once(':')
            .ok_or_else(|| format!("expected <principal>:<key>, got {entry:?}"))?;
        if id.is_empty() || key.is_empty() {
            return Err(format!("empty principal or key in {entry:?}"));
        }
        principals.push(Principal {
            principal_id: id.to_owned(),
            roles: vec!["operator".to_owned()],
            api_key_hash: hash_api_key(key),
        });
    }
    Ok(principals)
}

/// Parse `"wc:webchat,tg:telegram"` into channel seeds.
///
/// # Errors
///
/// Returns a description of the malformed entry.
pub fn parse_channels(raw: &str) -> Result<Vec<ChannelSeed>, String> {
    let mut seeds = Vec::new();
    for entry in raw.split(',').filter(|e| !e.trim().is_empty()) {
        let (id, kind) = entry
            .trim()
            .split_once(':')
            .ok_or_else(|| format!("expected <id>:<kind>, got {entry:?}"))?;
        let kind = ChannelKind::parse(kind).map_err(|e| e.to_string())?;
        seeds.push(ChannelSeed {
            channel_id: id.to_owned(),
            kind,
        });
    }
    Ok(seeds)
}

/// Parse `"wc=alice|bob;tg=carol"` into the channel allowlist map.
/// Malformed entries are skipped.
pub fn parse_channel_allowlist(raw: &str) -> BTreeMap<String, BTreeSet<String>> {
    let mut map = BTreeMap::new();
    for entry in raw.split(';').filter(|e| !e.trim().is_empty()) {
        if let Some((channel, senders)) = entry.trim().split_once('=') {
            let set: BTreeSet<String> = senders
                .split('|')
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect();
            map.insert(channel.to_owned(), set);
        }
    }
    map
}

/// Parse `"math.sum,time.now"` into the tool allowlist map.
pub fn parse_tool_allowlist(raw: &str) -> BTreeMap<String, bool> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| (t.to_owned(), true))
        .collect()
}

fn parse_scope_policy(raw: &str) -> Option<ScopePolicy> {
    match raw.to_lowercase().as_str() {
        "allow" => Some(ScopePolicy::Allow),
        "deny" => Some(ScopePolicy::Deny),
        _ => None,
    }
}
