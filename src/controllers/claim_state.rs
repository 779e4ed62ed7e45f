//! Per-claim lifecycle tracking.
//!
//! ```text
//! Unseen ──prepare──▶ PrepareRequested ──ok──▶ Prepared
//!                          ▲                      │
//!                       prepare               unprepare
//!                          │                      ▼
//!                      Released ◀──ok── UnprepareRequested
//! ```
//!
//! A failed callback leaves the claim where it is; the engine redelivers the
//! event. A claim reads as `Unseen` again only after the engine forgets it
//! once the claim is deleted.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use super::ClaimOperation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClaimState {
    Unseen,
    PrepareRequested,
    Prepared,
    UnprepareRequested,
    Released,
}

impl ClaimState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimState::Unseen => "unseen",
            ClaimState::PrepareRequested => "prepare_requested",
            ClaimState::Prepared => "prepared",
            ClaimState::UnprepareRequested => "unprepare_requested",
            ClaimState::Released => "released",
        }
    }

    /// State after the engine delivers `op`.
    pub fn on_request(self, op: ClaimOperation) -> Result<ClaimState, InvalidTransition> {
        use ClaimState::*;
        match (self, op) {
            (Unseen | PrepareRequested | Released, ClaimOperation::Prepare) => Ok(PrepareRequested),
            // Redelivery of an already prepared claim; the callback is a no-op.
            (Prepared, ClaimOperation::Prepare) => Ok(Prepared),
            (PrepareRequested | Prepared | UnprepareRequested, ClaimOperation::Unprepare) => {
                Ok(UnprepareRequested)
            }
            // Nothing bound, so the unprepare is a no-op success.
            (Unseen | Released, ClaimOperation::Unprepare) => Ok(Released),
            (UnprepareRequested, ClaimOperation::Prepare) => Err(InvalidTransition {
                from: self,
                operation: op,
            }),
        }
    }

    /// State after the callback for `op` succeeded.
    pub fn on_success(self, op: ClaimOperation) -> ClaimState {
        match op {
            ClaimOperation::Prepare => ClaimState::Prepared,
            ClaimOperation::Unprepare => ClaimState::Released,
        }
    }
}

impl fmt::Display for ClaimState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: ClaimState,
    pub operation: ClaimOperation,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot {} a claim in state {}", self.operation, self.from)
    }
}

/// Claim states for the lifetime of the process.
#[derive(Debug, Default)]
pub struct ClaimTracker {
    states: Mutex<HashMap<String, ClaimState>>,
}

impl ClaimTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, uid: &str) -> ClaimState {
        self.lock().get(uid).copied().unwrap_or(ClaimState::Unseen)
    }

    /// Mark claims found bound in the allocation record at startup.
    pub fn seed_prepared<I>(&self, uids: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut states = self.lock();
        for uid in uids {
            states.insert(uid, ClaimState::Prepared);
        }
    }

    /// Record delivery of `op` for `uid` and return the new state.
    pub fn request(&self, uid: &str, op: ClaimOperation) -> Result<ClaimState, InvalidTransition> {
        let mut states = self.lock();
        let current = states.get(uid).copied().unwrap_or(ClaimState::Unseen);
        let next = current.on_request(op)?;
        states.insert(uid.to_string(), next);
        Ok(next)
    }

    pub fn complete(&self, uid: &str, op: ClaimOperation) -> ClaimState {
        let mut states = self.lock();
        let current = states.get(uid).copied().unwrap_or(ClaimState::Unseen);
        let next = current.on_success(op);
        states.insert(uid.to_string(), next);
        next
    }

    /// Drop `uid` once its claim is gone; it reads as `Unseen` afterwards.
    pub fn forget(&self, uid: &str) {
        self.lock().remove(uid);
    }

    /// Number of claims currently tracked.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of claims per state, excluding `Unseen`.
    pub fn counts(&self) -> Vec<(ClaimState, usize)> {
        let states = self.lock();
        [
            ClaimState::PrepareRequested,
            ClaimState::Prepared,
            ClaimState::UnprepareRequested,
            ClaimState::Released,
        ]
        .into_iter()
        .map(|s| (s, states.values().filter(|v| **v == s).count()))
        .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ClaimState>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }
}
