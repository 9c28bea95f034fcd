//! Built-in tools registered at startup.
//!
//! Deliberately small: a pair of read tools exercising the happy path and one
//! write tool exercising the approval gate. Real deployments register their
//! own specs alongside these.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use super::{RegistryError, ToolError, ToolHandler, ToolPermission, ToolRegistry, ToolSpec};

/// `math.sum`: add a list of numbers.
struct SumTool;

#[async_trait]
impl ToolHandler for SumTool {
    async fn invoke(&self, args: &serde_json::Value) -> Result<serde_json::Value, ToolError> {
        let values = args
            .get("values")
            .and_then(|v| v.as_array())
            .ok_or_else(|| ToolError::InvalidArgs("expected a `values` array".to_owned()))?;

        let mut sum = 0.0_f64;
        for value in values {
            let n = value
                .as_f64()
                .ok_or_else(|| ToolError::InvalidArgs(format!("not a number: {value}")))?;
            sum += n;
        }
        Ok(json!({ "result": sum }))
    }
}

/// `time.now`: current UTC time.
struct NowTool;

#[async_trait]
impl ToolHandler for NowTool {
    async fn invoke(&self, _args: &serde_json::Value) -> Result<serde_json::Value, ToolError> {
        Ok(json!({ "now": Utc::now().to_rfc3339() }))
    }
}

/// `email.send`: queue an outbound email. Write-class, so approval-gated
/// under the default policy.
///
/// The builtin does not talk to a mail relay; it validates and acknowledges,
/// leaving delivery to the embedding process.
struct EmailSendTool;

#[async_trait]
impl ToolHandler for EmailSendTool {
    async fn invoke(&self, args: &serde_json::Value) -> Result<serde_json::Value, ToolError> {
        let to = args
            .get("to")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ToolError::InvalidArgs("expected a non-empty `to`".to_owned()))?;
        let subject = args.get("subject").and_then(|v| v.as_str()).unwrap_or("");
        Ok(json!({ "queued": true, "to": to, "subject": subject }))
    }
}

/// Build a registry holding every built-in tool.
///
/// # Errors
///
/// Returns [`RegistryError`] on duplicate names, which would indicate a bug
/// in this module.
pub fn builtin_registry() -> Result<ToolRegistry, RegistryError> {
    let mut registry = ToolRegistry::new();

    registry.register(ToolSpec {
        name: "math.sum".to_owned(),
        description: "Add a list of numbers and return the total.".to_owned(),
        permission: ToolPermission::Read,
        parameter_schema: json!({
            "type": "object",
            "properties": {
                "values": { "type": "array", "items": { "type": "number" } }
            },
            "required": ["values"]
        }),
        handler: Arc::new(SumTool),
    })?;

    registry.register(ToolSpec {
        name: "time.now".to_owned(),
        description: "Current UTC time in RFC 3339 form.".to_owned(),
        permission: ToolPermission::Read,
        parameter_schema: json!({ "type": "object", "properties": {} }),
        handler: Arc::new(NowTool),
    })?;

    registry.register(ToolSpec {
        name: "email.send".to_owned(),
        description: "Queue an outbound email.".to_owned(),
        permission: ToolPermission::Write,
        parameter_schema: json!({
            "type": "object",
            "properties": {
                "to": { "type": "string" },
                "subject": { "type": "string" },
                "body": { "type": "string" }
            },
            "required": ["to"]
        }),
        handler: Arc::new(EmailSendTool),
    })?;

    Ok(registry)
}
