//! Admission control for profile lookups.
//!
//! Two pauses gate every dispatch: an escalating per-handle backoff and a
//! process-wide circuit breaker raised by any rejection. Both are plain
//! predicates over `now`; nothing has to fire to lift them.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};

use crate::protocol::{BackoffReport, Handle};

/// Per-handle escalation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffState {
    /// Consecutive rejections, saturating at the sequence length.
    pub failure_count: usize,
    pub backoff_until: i64,
}

/// Process-wide pause raised by any rejection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlobalCircuitState {
    pub paused_until: i64,
}

pub struct RateController {
    sequence_ms: Vec<i64>,
    global_cooldown_ms: i64,
    backoffs: HashMap<Handle, BackoffState>,
    circuit: GlobalCircuitState,
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

impl RateController {
    /// `sequence` must be non-empty; an empty one falls back to a single minute.
    pub fn new(sequence: &[Duration], global_cooldown: Duration) -> Self {
        let mut sequence_ms: Vec<i64> = sequence.iter().copied().map(duration_ms).collect();
        if sequence_ms.is_empty() {
            sequence_ms.push(60_000);
        }
        Self {
            sequence_ms,
            global_cooldown_ms: duration_ms(global_cooldown),
            backoffs: HashMap::new(),
            circuit: GlobalCircuitState::default(),
        }
    }

    pub fn is_globally_paused(&self, now: i64) -> bool {
        now < self.circuit.paused_until
    }

    pub fn is_handle_paused(&self, handle: &str, now: i64) -> bool {
        self.backoffs
            .get(handle)
            .is_some_and(|state| now < state.backoff_until)
    }

    /// The only gate in front of a lookup.
    pub fn admit(&self, handle: &str, now: i64) -> bool {
        !self.is_globally_paused(now) && !self.is_handle_paused(handle, now)
    }

    pub fn on_rejected(&mut self, handle: &str, now: i64) {
        let max_count = self.sequence_ms.len();
        let state = self
            .backoffs
            .entry(handle.to_string())
            .or_insert(BackoffState {
                failure_count: 0,
                backoff_until: now,
            });
        state.failure_count = (state.failure_count + 1).min(max_count);
        let delay = self.sequence_ms[state.failure_count - 1];
        state.backoff_until = now.saturating_add(delay);

        self.circuit.paused_until = self
            .circuit
            .paused_until
            .max(now.saturating_add(self.global_cooldown_ms));
    }

    pub fn on_succeeded(&mut self, handle: &str) {
        self.backoffs.remove(handle);
    }

    pub fn backoff_state(&self, handle: &str) -> Option<BackoffState> {
        self.backoffs.get(handle).copied()
    }

    #[cfg(test)]
    pub fn circuit_state(&self) -> GlobalCircuitState {
        self.circuit
    }

    pub fn global_pause_remaining_ms(&self, now: i64) -> i64 {
        self.circuit.paused_until.saturating_sub(now).max(0)
    }

    /// Handles still waiting out a backoff, longest wait first.
    pub fn active_backoffs(&self, now: i64) -> Vec<BackoffReport> {
        let mut reports: Vec<BackoffReport> = self
            .backoffs
            .iter()
            .filter(|(_, state)| now < state.backoff_until)
            .map(|(handle, state)| BackoffReport {
                handle: handle.clone(),
                seconds_remaining: ceil_seconds(state.backoff_until - now),
            })
            .collect();
        reports.sort_by(|left, right| {
            right
                .seconds_remaining
                .cmp(&left.seconds_remaining)
                .then_with(|| left.handle.cmp(&right.handle))
        });
        reports
    }
}

pub fn ceil_seconds(remaining_ms: i64) -> u64 {
    if remaining_ms <= 0 {
        return 0;
    }
    (remaining_ms as u64).div_ceil(1_000)
}

/// Proactive cap on lookups per window, independent of rejection signals.
pub struct DispatchQuota {
    limiter: DefaultDirectRateLimiter,
}

impl DispatchQuota {
    pub fn new(requests: u32, window: Duration) -> Self {
        let burst = NonZeroU32::new(requests).unwrap_or(NonZeroU32::MIN);
        let replenish = window
            .checked_div(burst.get())
            .filter(|period| !period.is_zero())
            .unwrap_or(Duration::from_millis(1));
        let quota = Quota::with_period(replenish)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
            .allow_burst(burst);
        Self {
            limiter: RateLimiter::direct(quota),
        }
    }

    /// Consumes one slot when available.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{ceil_seconds, DispatchQuota, RateController};

    fn controller() -> RateController {
        let sequence: Vec<Duration> = [60, 120, 300, 600, 900]
            .into_iter()
            .map(Duration::from_secs)
            .collect();
        RateController::new(&sequence, Duration::from_secs(30))
    }

    #[test]
    fn test_backoff_escalates_along_sequence_and_saturates() {
        let mut rate = controller();
        let expected = [60_000, 120_000, 300_000, 600_000, 900_000, 900_000, 900_000];
        let mut previous = 0;
        for (index, delay) in expected.iter().enumerate() {
            let now = 1_000_000 * (index as i64 + 1);
            rate.on_rejected("bob", now);
            let state = rate.backoff_state("bob").expect("bob should have backoff");
            assert_eq!(state.backoff_until - now, *delay);
            assert!(state.backoff_until - now >= previous);
            assert!(state.failure_count <= 5);
            previous = state.backoff_until - now;
        }
    }

    #[test]
    fn test_success_resets_escalation_to_first_step() {
        let mut rate = controller();
        rate.on_rejected("bob", 0);
        rate.on_rejected("bob", 0);
        rate.on_succeeded("bob");
        assert!(rate.backoff_state("bob").is_none());
        assert!(!rate.is_handle_paused("bob", 0));

        rate.on_rejected("bob", 500_000);
        let state = rate.backoff_state("bob").expect("bob should have backoff");
        assert_eq!(state.failure_count, 1);
        assert_eq!(state.backoff_until, 560_000);
    }

    #[test]
    fn test_rejection_pauses_every_handle_until_cooldown_ends() {
        let mut rate = controller();
        rate.on_rejected("bob", 10_000);

        assert_eq!(rate.circuit_state().paused_until, 40_000);
        assert!(!rate.admit("carol", 11_000));
        assert!(!rate.admit("dave", 39_999));
        assert!(rate.admit("carol", 40_000));
        assert!(!rate.admit("bob", 40_000));
        assert!(rate.admit("bob", 70_000));
    }

    #[test]
    fn test_global_pause_never_moves_backwards() {
        let mut rate = controller();
        rate.on_rejected("bob", 100_000);
        rate.on_rejected("carol", 90_000);
        assert_eq!(rate.circuit_state().paused_until, 130_000);
        assert_eq!(rate.global_pause_remaining_ms(125_000), 5_000);
        assert_eq!(rate.global_pause_remaining_ms(200_000), 0);
    }

    #[test]
    fn test_active_backoffs_reports_only_pending_handles() {
        let mut rate = controller();
        rate.on_rejected("bob", 0);
        rate.on_rejected("carol", 0);
        rate.on_rejected("carol", 0);

        let reports = rate.active_backoffs(59_500);
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].handle, "carol");
        assert_eq!(reports[0].seconds_remaining, 61);
        assert_eq!(reports[1].handle, "bob");
        assert_eq!(reports[1].seconds_remaining, 1);

        let later = rate.active_backoffs(60_000);
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].handle, "carol");
    }

    #[test]
    fn test_ceil_seconds_rounds_up_partial_seconds() {
        assert_eq!(ceil_seconds(0), 0);
        assert_eq!(ceil_seconds(-5), 0);
        assert_eq!(ceil_seconds(1), 1);
        assert_eq!(ceil_seconds(30_000), 30);
        assert_eq!(ceil_seconds(30_001), 31);
    }

    #[test]
    fn test_dispatch_quota_allows_burst_then_refuses() {
        let quota = DispatchQuota::new(2, Duration::from_secs(3_600));
        assert!(quota.try_acquire());
        assert!(quota.try_acquire());
        assert!(!quota.try_acquire());
    }
}
