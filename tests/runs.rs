//! Integration tests for the run orchestrator and gateway core.

#[path = "runs/harness.rs"]
mod harness;
#[path = "runs/lifecycle_test.rs"]
mod lifecycle_test;
#[path = "runs/scenarios_test.rs"]
mod scenarios_test;
