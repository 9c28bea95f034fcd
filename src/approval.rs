//! Human-in-the-loop approval rendezvous.
//!
//! When the orchestrator hits a write tool that needs a human grant, it opens
//! an approval keyed by its run id and suspends on the returned waiter. The
//! gateway resolves the slot on `approval.grant`, or a timer resolves it at
//! the deadline, whichever comes first consumes the one-shot slot. A second
//! `open` for the same run fails; a grant after resolution reports not-found.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;

use crate::types::PendingApproval;

/// Final decision on a pending approval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    /// A principal granted the invocation.
    Granted {
        /// Who granted it.
        by: String,
    },
    /// A principal (or policy) denied the invocation.
    Denied {
        /// Why.
        reason: String,
    },
    /// The deadline passed with no decision.
    TimedOut,
}

/// Broker errors.
#[derive(Debug, Error)]
pub enum ApprovalError {
    /// No pending approval for this run (never opened, or already resolved).
    #[error("no pending approval for run {0}")]
    NotFound(Uuid),
    /// The run already has a pending approval.
    #[error("run {0} already has a pending approval")]
    AlreadyPending(Uuid),
}

struct Entry {
    request: PendingApproval,
    sender: oneshot::Sender<ApprovalOutcome>,
}

/// One-shot approval rendezvous keyed by run id. Cheap to clone.
#[derive(Clone, Default)]
pub struct ApprovalBroker {
    pending: Arc<Mutex<HashMap<Uuid, Entry>>>,
}

impl std::fmt::Debug for ApprovalBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalBroker")
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl ApprovalBroker {
    /// Empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an approval slot for a run and start its deadline timer.
    ///
    /// The timer fires at `deadline` whether or not anyone is waiting, so an
    /// abandoned waiter cannot leave a slot pinned forever.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::AlreadyPending`] if the run already has an
    /// open slot.
    pub fn open(
        &self,
        run_id: Uuid,
        tool_name: &str,
        args: serde_json::Value,
        deadline: DateTime<Utc>,
    ) -> Result<ApprovalWaiter, ApprovalError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.pending);
            if pending.contains_key(&run_id) {
                return Err(ApprovalError::AlreadyPending(run_id));
            }
            pending.insert(
                run_id,
                Entry {
                    request: PendingApproval {
                        run_id,
                        tool_name: tool_name.to_owned(),
                        args,
                        requested_at: Utc::now(),
                        deadline,
                    },
                    sender: tx,
                },
            );
        }

        info!(%run_id, tool = tool_name, %deadline, "approval opened");

        let broker = self.clone();
        tokio::spawn(async move {
            let wait = deadline
                .signed_duration_since(Utc::now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);
            tokio::time::sleep(wait).await;
            if broker.resolve(run_id, ApprovalOutcome::TimedOut).is_ok() {
                warn!(%run_id, "approval timed out");
            }
        });

        Ok(ApprovalWaiter { rx })
    }

    /// Grant a pending approval.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::NotFound`] if the slot is absent or already
    /// consumed.
    pub fn grant(&self, run_id: Uuid, by_principal: &str) -> Result<(), ApprovalError> {
        self.resolve(
            run_id,
            ApprovalOutcome::Granted {
                by: by_principal.to_owned(),
            },
        )
    }

    /// Deny a pending approval.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::NotFound`] if the slot is absent or already
    /// consumed.
    pub fn deny(&self, run_id: Uuid, reason: &str) -> Result<(), ApprovalError> {
        self.resolve(
            run_id,
            ApprovalOutcome::Denied {
                reason: reason.to_owned(),
            },
        )
    }

    fn resolve(&self, run_id: Uuid, outcome: ApprovalOutcome) -> Result<(), ApprovalError> {
        let entry = lock(&self.pending)
            .remove(&run_id)
            .ok_or(ApprovalError::NotFound(run_id))?;

        info!(
            %run_id,
            tool = %entry.request.tool_name,
            outcome = ?outcome,
            "approval resolved"
        );

        // If the waiter is gone (run canceled), the send is a no-op.
        let _ = entry.sender.send(outcome);
        Ok(())
    }

    /// The pending request for a run, if any.
    pub fn get_pending(&self, run_id: Uuid) -> Option<PendingApproval> {
        lock(&self.pending).get(&run_id).map(|e| e.request.clone())
    }

    /// All pending requests, for status surfaces.
    pub fn list_pending(&self) -> Vec<PendingApproval> {
        lock(&self.pending).values().map(|e| e.request.clone()).collect()
    }

    /// Number of open slots.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Consumer half of an approval slot.
#[derive(Debug)]
pub struct ApprovalWaiter {
    rx: oneshot::Receiver<ApprovalOutcome>,
}

impl ApprovalWaiter {
    /// Suspend until the slot resolves.
    pub async fn wait(self) -> ApprovalOutcome {
        self.rx.await.unwrap_or(ApprovalOutcome::TimedOut)
    }
}
