//! Claim reconciliation for the NodeAllocationState driver
//!
//! The [`ReconciliationEngine`] watches ResourceClaims and dispatches each one
//! to a [`ReconcileCallbacks`] implementation; [`NasDriver`] is the
//! implementation that binds claims to devices in the node's
//! NodeAllocationState.

mod claim_state;
mod driver;
mod engine;
mod finalizer;

pub use claim_state::{ClaimState, ClaimTracker, InvalidTransition};
pub use driver::NasDriver;
pub use engine::{classify_claim, ReconciliationEngine};
pub use finalizer::{ClaimFinalizers, KubeClaimFinalizers, CLAIM_FINALIZER};

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use kube::runtime::controller::Action;

use crate::crd::AllocatedDevices;
use crate::error::{OperatorError, Result};

/// What the engine asks the driver to do with a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClaimOperation {
    Prepare,
    Unprepare,
}

impl fmt::Display for ClaimOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClaimOperation::Prepare => f.write_str("prepare"),
            ClaimOperation::Unprepare => f.write_str("unprepare"),
        }
    }
}

/// A single unit of work derived from a ResourceClaim event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRequest {
    pub uid: String,
    pub namespace: String,
    pub name: String,
    pub operation: ClaimOperation,
}

/// Driver logic invoked by the engine. Implementations must be idempotent:
/// the engine delivers at least once.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait ReconcileCallbacks: Send + Sync {
    /// Bind devices to the claim and persist the binding.
    async fn on_prepare(&self, claim: &ClaimRequest) -> Result<AllocatedDevices>;

    /// Remove the claim's binding. Succeeds without writing when nothing is bound.
    async fn on_unprepare(&self, claim: &ClaimRequest) -> Result<()>;

    /// UIDs of the claims currently bound on this node.
    async fn on_list(&self) -> Result<Vec<String>>;
}

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Consecutive failures per claim, for exponential requeue delays.
#[derive(Debug, Default)]
pub struct FailureBackoff {
    failures: Mutex<HashMap<String, u32>>,
}

impl FailureBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a failure for `key` and return the delay before the next try.
    pub fn record_failure(&self, key: &str) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let count = failures.entry(key.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        backoff_for(*count)
    }

    pub fn reset(&self, key: &str) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    /// Number of keys with outstanding failures.
    pub fn len(&self) -> usize {
        self.failures.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn backoff_for(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    BACKOFF_BASE.saturating_mul(1 << exp).min(BACKOFF_MAX)
}

/// Requeue decision for a failed reconciliation of `key`.
///
/// Terminal errors wait for the object to change and drop the key's
/// failure count; everything else is requeued with a per-key exponential
/// delay.
pub fn error_policy_backoff(backoff: &FailureBackoff, key: &str, error: &OperatorError) -> Action {
    if error.is_terminal() {
        backoff.reset(key);
        return Action::await_change();
    }
    Action::requeue(backoff.record_failure(key))
}
