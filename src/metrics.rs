//! Controller counters and their Prometheus text exposition.
//!
//! Counters are plain atomics bumped on the reconcile path; the diagnostics
//! server renders them on demand together with the claim tracker's gauge.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::controllers::{ClaimOperation, ClaimState};

#[derive(Debug, Default)]
pub struct ControllerMetrics {
    pub prepares_total: AtomicU64,
    pub unprepares_total: AtomicU64,
    pub reconcile_errors_total: AtomicU64,
    pub terminal_errors_total: AtomicU64,
    pub conflicts_total: AtomicU64,
    pub record_writes_total: AtomicU64,
}

impl ControllerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, op: ClaimOperation) {
        match op {
            ClaimOperation::Prepare => self.prepares_total.fetch_add(1, Ordering::Relaxed),
            ClaimOperation::Unprepare => self.unprepares_total.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_error(&self, terminal: bool) {
        self.reconcile_errors_total.fetch_add(1, Ordering::Relaxed);
        if terminal {
            self.terminal_errors_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_conflict(&self) {
        self.conflicts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self) {
        self.record_writes_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Prometheus text format, version 0.0.4.
    pub fn to_prometheus(&self, claims: &[(ClaimState, usize)]) -> String {
        let mut out = String::new();
        let counters = [
            (
                "nas_controller_claim_prepares_total",
                "Claims successfully prepared",
                &self.prepares_total,
            ),
            (
                "nas_controller_claim_unprepares_total",
                "Claims successfully unprepared",
                &self.unprepares_total,
            ),
            (
                "nas_controller_reconcile_errors_total",
                "Failed claim reconciliations",
                &self.reconcile_errors_total,
            ),
            (
                "nas_controller_terminal_errors_total",
                "Claim reconciliations that failed permanently",
                &self.terminal_errors_total,
            ),
            (
                "nas_controller_conflicts_total",
                "Conditional writes rejected by a resourceVersion conflict",
                &self.conflicts_total,
            ),
            (
                "nas_controller_record_writes_total",
                "Successful writes to the NodeAllocationState",
                &self.record_writes_total,
            ),
        ];
        for (name, help, value) in counters {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} counter", name);
            let _ = writeln!(out, "{} {}", name, value.load(Ordering::Relaxed));
        }

        let _ = writeln!(out, "# HELP nas_controller_claims Tracked claims by lifecycle state");
        let _ = writeln!(out, "# TYPE nas_controller_claims gauge");
        for (state, count) in claims {
            let _ = writeln!(out, "nas_controller_claims{{state=\"{}\"}} {}", state, count);
        }
        out
    }
}
