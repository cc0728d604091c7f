//! Reconnection timing and the re-entrancy guard
//!
//! Retry cadence starts at `initial_delay`, grows by `step` after every failed
//! attempt and is capped at `max_delay`. The guard makes sure only one
//! reconnect sequence runs at a time even when several failure signals arrive
//! in the same loop iteration.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

/// Reconnection timing configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect tick
    pub initial_delay: Duration,
    /// Added to the delay after each failed attempt
    pub step: Duration,
    /// Upper bound on the delay
    pub max_delay: Duration,
    /// How long an initial `connect` may take before a reconnect is forced
    pub connect_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            step: Duration::from_secs(2),
            max_delay: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(20),
        }
    }
}

impl ReconnectPolicy {
    /// Delay following `current`
    pub fn next_delay(&self, current: Duration) -> Duration {
        self.cap(current.saturating_add(self.step))
    }

    /// Delay before tick `attempt` (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let growth = self.step.saturating_mul(attempt.saturating_sub(1));
        self.cap(self.initial_delay.saturating_add(growth))
    }

    /// Initial delay, already capped
    pub fn first_delay(&self) -> Duration {
        self.cap(self.initial_delay)
    }

    fn cap(&self, delay: Duration) -> Duration {
        delay.min(self.max_delay)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.initial_delay.is_zero() {
            return Err("initial reconnect delay must be greater than 0".to_string());
        }
        if self.max_delay < self.initial_delay {
            return Err("max reconnect delay must not be below the initial delay".to_string());
        }
        if self.connect_timeout.is_zero() {
            return Err("connect timeout must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Atomic "reconnecting" flag plus a count of completed sequences
#[derive(Debug, Default)]
pub struct ReconnectGuard {
    active: AtomicBool,
    completed: AtomicU32,
}

impl ReconnectGuard {
    /// Check-and-set; returns false if a sequence is already running
    pub fn try_begin(&self) -> bool {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Mark the running sequence as finished; returns false if none was running
    pub fn finish(&self) -> bool {
        let was_active = self.active.swap(false, Ordering::AcqRel);
        if was_active {
            self.completed.fetch_add(1, Ordering::Relaxed);
        }
        was_active
    }

    /// Drop the flag without counting a successful reconnect
    pub fn abandon(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Number of reconnect sequences that ended in a connection
    pub fn completed(&self) -> u32 {
        self.completed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_policy() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.initial_delay, Duration::from_secs(2));
        assert_eq!(policy.step, Duration::from_secs(2));
        assert_eq!(policy.max_delay, Duration::from_secs(20));
        assert_eq!(policy.connect_timeout, Duration::from_secs(20));
    }

    #[test]
    fn test_delay_sequence() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (1..=12)
            .map(|attempt| policy.delay_for_attempt(attempt).as_secs())
            .collect();

        assert_eq!(delays, vec![2, 4, 6, 8, 10, 12, 14, 16, 18, 20, 20, 20]);
    }

    #[test]
    fn test_next_delay_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.next_delay(Duration::from_secs(2)), Duration::from_secs(4));
        assert_eq!(policy.next_delay(Duration::from_secs(18)), Duration::from_secs(20));
        assert_eq!(policy.next_delay(Duration::from_secs(20)), Duration::from_secs(20));
    }

    #[test]
    fn test_validate() {
        assert!(ReconnectPolicy::default().validate().is_ok());

        let zero_initial = ReconnectPolicy {
            initial_delay: Duration::ZERO,
            ..Default::default()
        };
        assert!(zero_initial.validate().is_err());

        let inverted = ReconnectPolicy {
            initial_delay: Duration::from_secs(30),
            ..Default::default()
        };
        assert!(inverted.validate().is_err());

        let no_timeout = ReconnectPolicy {
            connect_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(no_timeout.validate().is_err());
    }

    #[test]
    fn test_guard_is_exclusive() {
        let guard = ReconnectGuard::default();

        assert!(guard.try_begin());
        assert!(!guard.try_begin());
        assert!(guard.is_active());

        assert!(guard.finish());
        assert!(!guard.is_active());
        assert_eq!(guard.completed(), 1);

        assert!(!guard.finish());
        assert_eq!(guard.completed(), 1);
    }

    #[test]
    fn test_guard_abandon_does_not_count() {
        let guard = ReconnectGuard::default();
        assert!(guard.try_begin());
        guard.abandon();
        assert!(!guard.is_active());
        assert_eq!(guard.completed(), 0);
        assert!(guard.try_begin());
    }

    proptest! {
        #[test]
        fn prop_delay_grows_by_step_and_never_exceeds_cap(attempts in 1u32..200) {
            let policy = ReconnectPolicy::default();
            let mut delay = policy.first_delay();
            prop_assert_eq!(delay, Duration::from_secs(2));

            for _ in 1..attempts {
                let next = policy.next_delay(delay);
                prop_assert!(next <= Duration::from_secs(20));
                prop_assert!(next == delay + Duration::from_secs(2) || next == Duration::from_secs(20));
                delay = next;
            }
        }
    }
}
