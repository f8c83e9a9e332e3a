//! Operation gate serializing every render engine invocation
//!
//! The engine keeps process-wide state and is not reentrant, so at most one
//! operation may hold the gate at any instant. Holders get an
//! [`OperationPermit`] that releases the gate when dropped, which covers
//! early returns and error paths alike.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, trace};

use super::error::{RenderError, Result};

/// What to do when the gate is already held.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WaitPolicy {
    /// Block until the current holder releases.
    Wait,
    /// Return [`Outcome::InProgress`] without blocking.
    ReturnIfBusy,
    /// Fail with [`RenderError::OperationInProgress`].
    ThrowIfBusy,
}

impl WaitPolicy {
    pub const WAIT: i32 = 0;
    pub const RETURN_IF_BUSY: i32 = 1;
    pub const THROW_IF_BUSY: i32 = 2;
}

impl TryFrom<i32> for WaitPolicy {
    type Error = RenderError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            Self::WAIT => Ok(Self::Wait),
            Self::RETURN_IF_BUSY => Ok(Self::ReturnIfBusy),
            Self::THROW_IF_BUSY => Ok(Self::ThrowIfBusy),
            other => Err(RenderError::InvalidArgument(format!(
                "unknown wait policy: {other}"
            ))),
        }
    }
}

/// Result of an operation that may have been skipped because the gate was busy.
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub enum Outcome<T> {
    Completed(T),
    /// Another operation held the gate and the caller chose not to wait.
    InProgress,
}

impl<T> Outcome<T> {
    #[must_use]
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::InProgress)
    }

    #[must_use]
    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            Self::InProgress => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Self::Completed(value) => Outcome::Completed(f(value)),
            Self::InProgress => Outcome::InProgress,
        }
    }
}

#[derive(Debug, Default)]
struct GateState {
    busy: bool,
    holder: Option<String>,
    completed_ops: u64,
}

/// Mutual exclusion primitive with caller-selectable wait policy.
#[derive(Debug, Default)]
pub struct OperationGate {
    state: Mutex<GateState>,
    finished: Condvar,
}

impl OperationGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquires the gate under `policy`. `caller` names the requester in
    /// diagnostics.
    pub fn acquire(&self, policy: WaitPolicy, caller: &str) -> Result<Outcome<OperationPermit<'_>>> {
        let mut state = self.lock();

        if state.busy {
            match policy {
                WaitPolicy::ReturnIfBusy => {
                    trace!("{caller}: gate busy (held by {:?}), skipping", state.holder);
                    return Ok(Outcome::InProgress);
                }
                WaitPolicy::ThrowIfBusy => {
                    debug!("{caller}: gate busy (held by {:?})", state.holder);
                    return Err(RenderError::OperationInProgress {
                        caller: caller.to_string(),
                    });
                }
                WaitPolicy::Wait => {
                    trace!("{caller}: waiting for {:?}", state.holder);
                    while state.busy {
                        state = self
                            .finished
                            .wait(state)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                }
            }
        }

        state.busy = true;
        state.holder = Some(caller.to_string());
        trace!("{caller}: gate acquired");

        Ok(Outcome::Completed(OperationPermit {
            gate: self,
            caller: caller.to_string(),
        }))
    }

    /// Applies `policy` without taking the gate.
    ///
    /// Returns `Ok(true)` once the gate is observed idle. Another caller may
    /// still win the race to acquire it afterwards.
    pub fn check(&self, policy: WaitPolicy, caller: &str) -> Result<bool> {
        if !self.is_busy() {
            return Ok(true);
        }
        match policy {
            WaitPolicy::ReturnIfBusy => Ok(false),
            WaitPolicy::ThrowIfBusy => Err(RenderError::OperationInProgress {
                caller: caller.to_string(),
            }),
            WaitPolicy::Wait => {
                self.wait_idle();
                Ok(true)
            }
        }
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.lock().busy
    }

    /// Name of the current holder, if any.
    #[must_use]
    pub fn holder(&self) -> Option<String> {
        self.lock().holder.clone()
    }

    /// Number of operations that have released the gate so far.
    #[must_use]
    pub fn completed_operations(&self) -> u64 {
        self.lock().completed_ops
    }

    /// Blocks until the gate is idle.
    pub fn wait_idle(&self) {
        let mut state = self.lock();
        while state.busy {
            state = self
                .finished
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Blocks until the gate is idle or `timeout` elapses. Returns true if idle.
    pub fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        let state = self.lock();
        let (state, _) = self
            .finished
            .wait_timeout_while(state, timeout, |s| s.busy)
            .unwrap_or_else(PoisonError::into_inner);
        !state.busy
    }

    fn release(&self, caller: &str) {
        let mut state = self.lock();
        state.busy = false;
        state.holder = None;
        state.completed_ops += 1;
        drop(state);
        trace!("{caller}: gate released");
        self.finished.notify_all();
    }
}

/// Proof of holding the gate. Dropping it releases the gate and wakes waiters.
#[derive(Debug)]
#[must_use = "the gate is released as soon as the permit is dropped"]
pub struct OperationPermit<'a> {
    gate: &'a OperationGate,
    caller: String,
}

impl OperationPermit<'_> {
    #[must_use]
    pub fn caller(&self) -> &str {
        &self.caller
    }
}

impl Drop for OperationPermit<'_> {
    fn drop(&mut self) {
        self.gate.release(&self.caller);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Instant;

    use super::*;

    #[test]
    fn concurrent_waiters_never_overlap() {
        let gate = Arc::new(OperationGate::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let gate = Arc::clone(&gate);
                let inside = Arc::clone(&inside);
                let max_seen = Arc::clone(&max_seen);
                thread::spawn(move || {
                    for _ in 0..20 {
                        let permit = gate
                            .acquire(WaitPolicy::Wait, &format!("worker-{i}"))
                            .unwrap()
                            .completed()
                            .unwrap();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                        drop(permit);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(gate.completed_operations(), 160);
        assert!(!gate.is_busy());
    }

    #[test]
    fn return_if_busy_does_not_block() {
        let gate = OperationGate::new();
        let _permit = gate.acquire(WaitPolicy::Wait, "holder").unwrap();

        let started = Instant::now();
        let outcome = gate.acquire(WaitPolicy::ReturnIfBusy, "probe").unwrap();

        assert!(outcome.is_in_progress());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(gate.holder().as_deref(), Some("holder"));
    }

    #[test]
    fn throw_if_busy_reports_caller() {
        let gate = OperationGate::new();
        let _permit = gate.acquire(WaitPolicy::Wait, "holder").unwrap();

        let err = gate.acquire(WaitPolicy::ThrowIfBusy, "impatient").unwrap_err();
        match err {
            RenderError::OperationInProgress { caller } => assert_eq!(caller, "impatient"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn dropping_permit_releases_gate() {
        let gate = OperationGate::new();
        {
            let _permit = gate.acquire(WaitPolicy::ThrowIfBusy, "scoped").unwrap();
            assert!(gate.is_busy());
        }
        assert!(!gate.is_busy());
        assert!(gate.acquire(WaitPolicy::ThrowIfBusy, "next").is_ok());
    }

    #[test]
    fn permit_released_on_error_path() {
        fn failing(gate: &OperationGate) -> Result<()> {
            let _permit = gate.acquire(WaitPolicy::Wait, "failing")?;
            Err(RenderError::EngineError { code: -100 })
        }

        let gate = OperationGate::new();
        assert!(failing(&gate).is_err());
        assert!(!gate.is_busy());
    }

    #[test]
    fn waiter_resumes_after_release() {
        let gate = Arc::new(OperationGate::new());
        let permit = gate.acquire(WaitPolicy::Wait, "first").unwrap();

        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                let acquired = gate.acquire(WaitPolicy::Wait, "second").unwrap();
                assert!(!acquired.is_in_progress());
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert!(gate.is_busy());
        drop(permit);
        waiter.join().unwrap();
        assert!(!gate.is_busy());
    }

    #[test]
    fn wait_idle_timeout_expires_while_held() {
        let gate = OperationGate::new();
        let _permit = gate.acquire(WaitPolicy::Wait, "holder").unwrap();
        assert!(!gate.wait_idle_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn check_applies_policy_without_acquiring() {
        let gate = OperationGate::new();
        assert!(gate.check(WaitPolicy::ThrowIfBusy, "idle").unwrap());
        assert!(!gate.is_busy());

        let _permit = gate.acquire(WaitPolicy::Wait, "holder").unwrap();
        assert!(!gate.check(WaitPolicy::ReturnIfBusy, "probe").unwrap());
        assert!(gate.check(WaitPolicy::ThrowIfBusy, "probe").is_err());
    }

    #[test]
    fn raw_policy_codes_are_validated() {
        assert_eq!(WaitPolicy::try_from(0).unwrap(), WaitPolicy::Wait);
        assert_eq!(WaitPolicy::try_from(1).unwrap(), WaitPolicy::ReturnIfBusy);
        assert_eq!(WaitPolicy::try_from(2).unwrap(), WaitPolicy::ThrowIfBusy);
        assert!(matches!(
            WaitPolicy::try_from(7),
            Err(RenderError::InvalidArgument(_))
        ));
    }
}
