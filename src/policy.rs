//! Deny-by-default authorization.
//!
//! Two gates live here: the tool gate consulted by the orchestrator before
//! every invocation, and the inbound gate consulted by the gateway before a
//! channel message is accepted. Both are pure functions over the current
//! [`PolicyConfig`]; all mutable policy state lives with the gateway.

use serde_json::Value;
use tracing::debug;

use crate::config::{PolicyConfig, ScopePolicy};
use crate::tools::{ToolPermission, ToolRegistry};
use crate::types::Channel;

/// Why a tool invocation was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolDenyReason {
    /// Not present (or `false`) in the tool allowlist.
    ToolNotAllowlisted,
    /// Allowlisted but absent from the registry.
    ToolMissing,
}

impl ToolDenyReason {
    /// Wire/reporting code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToolNotAllowlisted => "tool_not_allowlisted",
            Self::ToolMissing => "tool_missing",
        }
    }
}

/// Verdict on a (principal, tool, args) triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolDecision {
    /// Proceed immediately.
    Allow,
    /// Proceed only after a human grant.
    ApprovalRequired,
    /// Do not proceed.
    Deny(ToolDenyReason),
}

/// Evaluate a tool invocation against policy and the registry.
///
/// Order matters: allowlist first, existence second, approval class last;
/// a tool that is both unlisted and missing reports `tool_not_allowlisted`.
pub fn evaluate_tool(
    policy: &PolicyConfig,
    registry: &ToolRegistry,
    tool_name: &str,
    _args: &Value,
) -> ToolDecision {
    if policy.tool_allowlist.get(tool_name) != Some(&true) {
        debug!(tool = tool_name, "tool not allowlisted");
        return ToolDecision::Deny(ToolDenyReason::ToolNotAllowlisted);
    }

    let Some(spec) = registry.get(tool_name) else {
        debug!(tool = tool_name, "tool allowlisted but not registered");
        return ToolDecision::Deny(ToolDenyReason::ToolMissing);
    };

    if spec.permission == ToolPermission::Write && policy.require_approval_for_write {
        return ToolDecision::ApprovalRequired;
    }

    ToolDecision::Allow
}

/// Why an inbound message was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundDenyReason {
    /// The channel is not known to the gateway.
    ChannelUnknown,
    /// The sender is not permitted on this channel.
    SenderNotAllowlisted,
}

impl InboundDenyReason {
    /// Wire/reporting code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChannelUnknown => "channel_unknown",
            Self::SenderNotAllowlisted => "sender_not_allowlisted",
        }
    }
}

/// Verdict on an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundDecision {
    /// Accept and persist.
    Allow,
    /// Reject; observable as a `security.blocked` event.
    Deny(InboundDenyReason),
}

/// Evaluate an inbound (channel, sender) pair.
///
/// A channel with an allowlist entry admits exactly the listed senders; an
/// empty set admits nobody. A channel without an entry falls back to the
/// direct/group scope default.
pub fn evaluate_inbound(
    policy: &PolicyConfig,
    channel: Option<&Channel>,
    sender_id: &str,
    is_group: bool,
) -> InboundDecision {
    let Some(channel) = channel else {
        return InboundDecision::Deny(InboundDenyReason::ChannelUnknown);
    };

    if let Some(allowed) = policy.channel_allowlist.get(&channel.channel_id) {
        if allowed.contains(sender_id) {
            return InboundDecision::Allow;
        }
        debug!(
            channel = %channel.channel_id,
            sender = sender_id,
            "sender not in channel allowlist"
        );
        return InboundDecision::Deny(InboundDenyReason::SenderNotAllowlisted);
    }

    let scope_default = if is_group {
        policy.group_policy
    } else {
        policy.dm_policy
    };
    match scope_default {
        ScopePolicy::Allow => InboundDecision::Allow,
        ScopePolicy::Deny => InboundDecision::Deny(InboundDenyReason::SenderNotAllowlisted),
    }
}
