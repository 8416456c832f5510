//! Readiness gate
//!
//! Two process-wide atomics (`running`, `ready`) plus an in-flight request
//! counter. Admission checks read `ready`; a negative check is the
//! caller's cue to respond `service_unavailable`. The in-flight counter is
//! acquired/released through `InFlightGuard`, an RAII guard so the count
//! is released on every exit path (early return, panic unwind, `?`).

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

/// Process-wide readiness state. One instance is expected to be wrapped in
/// an `Arc` and shared across the node; it has no interior synchronization
/// beyond its atomics, so cloning the `Arc` is the sharing mechanism.
#[derive(Debug)]
pub struct ReadinessGate {
    running: AtomicBool,
    ready: AtomicBool,
    active_requests: AtomicI64,
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessGate {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            ready: AtomicBool::new(false),
            active_requests: AtomicI64::new(0),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Flips ready true. Called after initial sync completes, or after
    /// standalone mode is declared (spec 4.15 / 4.14).
    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Graceful shutdown: `running` goes false first so background loops
    /// observe it and stop; `ready` follows so admission checks start
    /// rejecting new requests immediately.
    pub fn begin_shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.ready.store(false, Ordering::SeqCst);
    }

    pub fn active_requests(&self) -> i64 {
        self.active_requests.load(Ordering::SeqCst)
    }

    /// Admission check: `Some(guard)` if the node is ready to serve, `None`
    /// if the caller should respond `service_unavailable`.
    pub fn admit(self: &std::sync::Arc<Self>) -> Option<InFlightGuard> {
        if !self.is_ready() {
            return None;
        }
        self.active_requests.fetch_add(1, Ordering::SeqCst);
        Some(InFlightGuard {
            gate: self.clone(),
        })
    }
}

/// RAII guard released on drop, guaranteeing the in-flight counter never
/// leaks past an early return, a `?`, or a panic.
pub struct InFlightGuard {
    gate: std::sync::Arc<ReadinessGate>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.gate.active_requests.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn not_ready_until_set() {
        let gate = Arc::new(ReadinessGate::new());
        assert!(!gate.is_ready());
        assert!(gate.admit().is_none());
        gate.set_ready();
        assert!(gate.is_ready());
        assert!(gate.admit().is_some());
    }

    #[test]
    fn in_flight_guard_releases_on_drop() {
        let gate = Arc::new(ReadinessGate::new());
        gate.set_ready();
        {
            let _g1 = gate.admit().unwrap();
            let _g2 = gate.admit().unwrap();
            assert_eq!(gate.active_requests(), 2);
        }
        assert_eq!(gate.active_requests(), 0);
    }

    #[test]
    fn shutdown_flips_both_flags() {
        let gate = Arc::new(ReadinessGate::new());
        gate.set_ready();
        gate.begin_shutdown();
        assert!(!gate.is_running());
        assert!(!gate.is_ready());
        assert!(gate.admit().is_none());
    }
}
