//! Readiness detection for fortls.
//!
//! fortls has no structured "analysis complete" event; readiness is
//! inferred from free-text `window/logMessage` / `window/showMessage`
//! notifications, with a bounded timeout as the guaranteed fallback. The
//! tri-state transition is single-assignment: the first producer (marker
//! handler, timer, or forced shutdown) wins and later signals are no-ops.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, warn};

/// How long to wait for a readiness marker before proceeding anyway.
/// Fixed by design, not a per-call knob.
pub const READY_TIMEOUT: Duration = Duration::from_secs(3);

/// Heuristic marker match, isolated so the substring set can be swapped
/// without touching the wait logic.
#[must_use]
pub fn is_ready_signal(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("parsing complete") || lower.contains("ready")
}

/// Terminal readiness outcome for one session. Monotonic: exactly one
/// transition out of `NotStarted` ever happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadinessState {
    NotStarted = 0,
    /// A recognized marker arrived in a server notification.
    SignalObserved = 1,
    /// No marker within the window; the session proceeds as if ready.
    TimedOutFallback = 2,
}

impl ReadinessState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::SignalObserved,
            2 => Self::TimedOutFallback,
            _ => Self::NotStarted,
        }
    }
}

/// Shared readiness flags for one session.
///
/// The notification handler and the timeout timer race to `mark()`; waiters
/// block on `wait()`. The auxiliary flags mirror the tri-state so feature
/// gating and analysis gating can be queried independently.
#[derive(Debug, Default)]
pub struct ReadinessFlags {
    state: AtomicU8,
    notify: Notify,
    server_ready: AtomicBool,
    completions_available: AtomicBool,
    analysis_complete: AtomicBool,
}

impl ReadinessFlags {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attempt the terminal transition. First caller wins; returns whether
    /// this call performed it. Passing `NotStarted` is a no-op.
    pub fn mark(&self, terminal: ReadinessState) -> bool {
        if terminal == ReadinessState::NotStarted {
            return false;
        }
        let transitioned = self
            .state
            .compare_exchange(
                ReadinessState::NotStarted as u8,
                terminal as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if transitioned {
            self.server_ready.store(true, Ordering::Release);
            self.completions_available.store(true, Ordering::Release);
            self.analysis_complete.store(true, Ordering::Release);
            self.notify.notify_waiters();
        }
        transitioned
    }

    #[must_use]
    pub fn state(&self) -> ReadinessState {
        ReadinessState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.server_ready.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn completions_available(&self) -> bool {
        self.completions_available.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn analysis_complete(&self) -> bool {
        self.analysis_complete.load(Ordering::Acquire)
    }

    /// Feed one free-text notification message through the marker heuristic.
    pub fn observe_message(&self, text: &str) {
        if is_ready_signal(text) && self.mark(ReadinessState::SignalObserved) {
            debug!("fortls readiness marker observed: {text:?}");
        }
    }

    /// Wait for the terminal transition, forcing `TimedOutFallback` if
    /// nothing arrives within `timeout`. Returns the terminal state and
    /// never blocks past the timeout.
    pub async fn wait(&self, timeout: Duration) -> ReadinessState {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        let _ = notified.as_mut().enable();

        // Checked after registering for wakeups, so a transition between
        // the two cannot be missed.
        let current = self.state();
        if current != ReadinessState::NotStarted {
            return current;
        }

        tokio::select! {
            () = &mut notified => {}
            () = tokio::time::sleep(timeout) => {
                if self.mark(ReadinessState::TimedOutFallback) {
                    warn!(
                        "no readiness marker from fortls within {timeout:?}, proceeding anyway"
                    );
                }
            }
        }
        self.state()
    }

    /// Force-release any in-flight `wait()`, e.g. on shutdown. No-op if a
    /// terminal state was already reached.
    pub fn force_release(&self) {
        self.mark(ReadinessState::TimedOutFallback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn marker_matching_is_case_insensitive_substring() {
        assert!(is_ready_signal("Parsing complete for project heat_sim"));
        assert!(is_ready_signal("fortls READY"));
        assert!(is_ready_signal("server ready to accept requests"));
        assert!(!is_ready_signal("indexing 42 files"));
        assert!(!is_ready_signal(""));
    }

    #[test]
    fn first_mark_wins_and_later_marks_are_noops() {
        let flags = ReadinessFlags::new();
        assert_eq!(flags.state(), ReadinessState::NotStarted);

        assert!(flags.mark(ReadinessState::SignalObserved));
        assert_eq!(flags.state(), ReadinessState::SignalObserved);

        // The losing producer's signal must not re-transition.
        assert!(!flags.mark(ReadinessState::TimedOutFallback));
        assert!(!flags.mark(ReadinessState::SignalObserved));
        assert_eq!(flags.state(), ReadinessState::SignalObserved);
    }

    #[test]
    fn mark_not_started_is_rejected() {
        let flags = ReadinessFlags::new();
        assert!(!flags.mark(ReadinessState::NotStarted));
        assert_eq!(flags.state(), ReadinessState::NotStarted);
        assert!(!flags.is_ready());
    }

    #[test]
    fn auxiliary_flags_set_on_either_transition() {
        let observed = ReadinessFlags::new();
        observed.mark(ReadinessState::SignalObserved);
        assert!(observed.is_ready());
        assert!(observed.completions_available());
        assert!(observed.analysis_complete());

        let fallback = ReadinessFlags::new();
        fallback.mark(ReadinessState::TimedOutFallback);
        assert!(fallback.is_ready());
        assert!(fallback.completions_available());
        assert!(fallback.analysis_complete());
    }

    #[test]
    fn observe_message_ignores_unrelated_text() {
        let flags = ReadinessFlags::new();
        flags.observe_message("parsing file 3 of 120");
        assert_eq!(flags.state(), ReadinessState::NotStarted);

        flags.observe_message("Parsing complete");
        assert_eq!(flags.state(), ReadinessState::SignalObserved);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_into_fallback() {
        let flags = ReadinessFlags::new();
        let state = flags.wait(READY_TIMEOUT).await;
        assert_eq!(state, ReadinessState::TimedOutFallback);
        assert!(flags.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_returns_early_on_marker() {
        let flags = ReadinessFlags::new();
        let waiter = flags.clone();
        let handle = tokio::spawn(async move { waiter.wait(READY_TIMEOUT).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        flags.observe_message("parsing complete for project heat_sim");

        let state = handle.await.unwrap();
        assert_eq!(state, ReadinessState::SignalObserved);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_after_terminal_state_returns_immediately() {
        let flags = ReadinessFlags::new();
        flags.mark(ReadinessState::SignalObserved);
        // With paused time this would hang if the wait slept.
        assert_eq!(
            flags.wait(READY_TIMEOUT).await,
            ReadinessState::SignalObserved
        );
    }

    #[tokio::test(start_paused = true)]
    async fn late_timer_does_not_overwrite_observed_signal() {
        let flags = ReadinessFlags::new();
        flags.mark(ReadinessState::SignalObserved);
        tokio::time::sleep(READY_TIMEOUT * 2).await;
        assert_eq!(flags.state(), ReadinessState::SignalObserved);
    }

    #[tokio::test(start_paused = true)]
    async fn force_release_unblocks_waiter() {
        let flags = ReadinessFlags::new();
        let waiter = flags.clone();
        let handle = tokio::spawn(async move { waiter.wait(READY_TIMEOUT).await });

        tokio::task::yield_now().await;
        flags.force_release();

        assert_eq!(handle.await.unwrap(), ReadinessState::TimedOutFallback);
    }

    #[tokio::test]
    async fn wait_never_blocks_past_timeout_in_real_time() {
        let flags = ReadinessFlags::new();
        let start = Instant::now();
        let state = flags.wait(Duration::from_millis(80)).await;
        assert_eq!(state, ReadinessState::TimedOutFallback);
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn concurrent_producers_perform_exactly_one_transition() {
        let flags = ReadinessFlags::new();
        let mut handles = Vec::new();
        for i in 0..8 {
            let f = flags.clone();
            let terminal = if i % 2 == 0 {
                ReadinessState::SignalObserved
            } else {
                ReadinessState::TimedOutFallback
            };
            handles.push(tokio::spawn(async move { f.mark(terminal) }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_ne!(flags.state(), ReadinessState::NotStarted);
    }
}
