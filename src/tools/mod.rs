//! Tool catalog: specs, handlers, and the registry.
//!
//! A tool is a namespaced, typed callable with a permission class. The
//! registry is populated at startup (builtins plus anything the embedding
//! process registers) and is immutable afterwards; runtime reload is done by
//! building a fresh registry and swapping the shared pointer, which only the
//! gateway does.

pub mod builtin;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::InvalidEnum;

/// Permission class of a tool. `Write` tools are approval-gated by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolPermission {
    /// Observes state; safe to retry.
    Read,
    /// Mutates external state; never auto-retried.
    Write,
}

impl ToolPermission {
    /// String form stored and reported on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }

    /// Parse from the stored string form.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidEnum`] if the value is not a recognised permission.
    pub fn parse(s: &str) -> Result<Self, InvalidEnum> {
        match s {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            other => Err(InvalidEnum {
                field: "tool permission",
                value: other.to_owned(),
            }),
        }
    }
}

/// Error returned by a tool handler.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The arguments did not match the tool's schema.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    /// The handler ran and failed.
    #[error("{0}")]
    Failed(String),
}

/// An invocable tool implementation.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Execute the tool against JSON arguments, returning a JSON result.
    async fn invoke(&self, args: &serde_json::Value) -> Result<serde_json::Value, ToolError>;
}

/// A registered tool: identity, contract, and invocation handle.
#[derive(Clone)]
pub struct ToolSpec {
    /// Namespaced name, e.g. `"math.sum"`.
    pub name: String,
    /// Description shown to the planner.
    pub description: String,
    /// Permission class.
    pub permission: ToolPermission,
    /// JSON Schema for the tool's arguments.
    pub parameter_schema: serde_json::Value,
    /// The implementation.
    pub handler: Arc<dyn ToolHandler>,
}

impl std::fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSpec")
            .field("name", &self.name)
            .field("permission", &self.permission)
            .finish_non_exhaustive()
    }
}

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A tool with this name already exists.
    #[error("duplicate tool name: {0}")]
    Duplicate(String),
}

/// Immutable-after-startup tool catalog.
///
/// Kept in a `BTreeMap` so listings are deterministic.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, ToolSpec>,
}

impl ToolRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Names are unique.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Duplicate`] if the name is taken.
    pub fn register(&mut self, spec: ToolSpec) -> Result<(), RegistryError> {
        if self.tools.contains_key(&spec.name) {
            return Err(RegistryError::Duplicate(spec.name));
        }
        self.tools.insert(spec.name.clone(), spec);
        Ok(())
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name)
    }

    /// All registered tools in name order.
    pub fn list(&self) -> Vec<&ToolSpec> {
        self.tools.values().collect()
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
