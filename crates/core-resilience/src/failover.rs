//! Failover Controller: active/passive selection between two targets
//!
//! Each target has its own sliding-window failure counter. Once the count
//! for the target being used reaches the threshold, the first caller to
//! observe it swaps the roles with a single compare-and-swap. Concurrent
//! callers that saw the same state lose the race and leave the roles alone.
//!
//! Tripping does not clear counters. Whether the controller ever returns to
//! the primary is governed by [`FailbackPolicy`] or an explicit [`reset`].
//!
//! [`reset`]: FailoverController::reset
//!
//! # Example
//!
//! ```
//! use busguard_core_resilience::failover::{FailoverConfig, FailoverController, Target};
//! use std::time::Duration;
//!
//! let controller = FailoverController::new(FailoverConfig {
//!     exception_threshold: 1,
//!     sliding_duration: Duration::from_secs(30),
//!     ..Default::default()
//! });
//!
//! assert_eq!(controller.active(), Target::Primary);
//! controller.record_failure();
//! if controller.should_failover() {
//!     controller.trip();
//! }
//! assert_eq!(controller.active(), Target::Secondary);
//! ```

use crate::sliding_window::SlidingWindowCounter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tracing::{info, warn};

const PRIMARY: u8 = 0;
const SECONDARY: u8 = 1;

/// One of the two configured backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    Primary,
    Secondary,
}

impl Target {
    /// The other target
    pub fn other(self) -> Self {
        match self {
            Target::Primary => Target::Secondary,
            Target::Secondary => Target::Primary,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Target::Primary => PRIMARY,
            Target::Secondary => SECONDARY,
        }
    }

    fn from_u8(raw: u8) -> Self {
        if raw == SECONDARY {
            Target::Secondary
        } else {
            Target::Primary
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Primary => write!(f, "primary"),
            Target::Secondary => write!(f, "secondary"),
        }
    }
}

/// When a tripped controller may return to the primary on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailbackPolicy {
    /// Stay on the secondary until [`FailoverController::reset`]
    #[default]
    Never,
    /// Return to the primary once this long has passed since the trip
    After(Duration),
}

/// Failover configuration
#[derive(Debug, Clone, PartialEq)]
pub struct FailoverConfig {
    /// Failures within the window that trigger a trip
    pub exception_threshold: usize,

    /// Width of the failure window
    pub sliding_duration: Duration,

    pub failback: FailbackPolicy,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            exception_threshold: 5,
            sliding_duration: Duration::from_secs(60),
            failback: FailbackPolicy::Never,
        }
    }
}

/// Point-in-time view of the controller
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailoverSnapshot {
    pub active: Target,
    pub passive: Target,
    pub primary_failures: usize,
    pub secondary_failures: usize,
    pub trips: u64,
    pub tripped_at: Option<SystemTime>,
}

/// Thread-safe active/passive selector
#[derive(Debug)]
pub struct FailoverController {
    config: FailoverConfig,
    active: AtomicU8,
    primary_failures: SlidingWindowCounter,
    secondary_failures: SlidingWindowCounter,
    /// Monotonic instant for fail-back timing, wall clock for reporting.
    /// Every write to `active` happens under this lock, so the timestamp is
    /// set exactly when the secondary is active.
    tripped_at: Mutex<Option<(Instant, SystemTime)>>,
    trips: AtomicU64,
}

impl FailoverController {
    pub fn new(config: FailoverConfig) -> Self {
        let config = FailoverConfig {
            exception_threshold: config.exception_threshold.max(1),
            ..config
        };

        Self {
            primary_failures: SlidingWindowCounter::new(config.sliding_duration),
            secondary_failures: SlidingWindowCounter::new(config.sliding_duration),
            config,
            active: AtomicU8::new(PRIMARY),
            tripped_at: Mutex::new(None),
            trips: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &FailoverConfig {
        &self.config
    }

    /// The target new work should go to
    pub fn active(&self) -> Target {
        let current = Target::from_u8(self.active.load(Ordering::Acquire));
        if current == Target::Secondary && self.fail_back_if_due() {
            return Target::from_u8(self.active.load(Ordering::Acquire));
        }
        current
    }

    /// The target not currently in use
    pub fn passive(&self) -> Target {
        self.active().other()
    }

    /// Record a failure against the active target. Returns the unpruned
    /// size of that target's window.
    pub fn record_failure(&self) -> usize {
        self.record_failure_for(self.active())
    }

    /// Record a failure against a specific target
    pub fn record_failure_for(&self, target: Target) -> usize {
        self.counter(target).increment()
    }

    /// Whether the active target has reached the failure threshold
    pub fn should_failover(&self) -> bool {
        self.should_failover_for(self.active())
    }

    /// Whether `target` has reached the failure threshold
    pub fn should_failover_for(&self, target: Target) -> bool {
        self.counter(target).get_count() >= self.config.exception_threshold
    }

    /// Swap roles if the active target is still `observed`.
    ///
    /// Of any number of callers that observed the same state, exactly one
    /// gets true.
    pub fn trip_from(&self, observed: Target) -> bool {
        let swapped = {
            let mut tripped_at = self.tripped_at.lock();
            let swapped = self
                .active
                .compare_exchange(
                    observed.as_u8(),
                    observed.other().as_u8(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok();
            if swapped {
                *tripped_at = match observed.other() {
                    Target::Secondary => Some((Instant::now(), SystemTime::now())),
                    Target::Primary => None,
                };
            }
            swapped
        };

        if swapped {
            let trips = self.trips.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                from = %observed,
                to = %observed.other(),
                failures = self.counter(observed).get_count(),
                threshold = self.config.exception_threshold,
                trips,
                "failover tripped"
            );
        }

        swapped
    }

    /// Swap roles from whatever is active now
    pub fn trip(&self) -> bool {
        self.trip_from(Target::from_u8(self.active.load(Ordering::Acquire)))
    }

    /// Return to the primary. Returns true if the roles changed.
    pub fn reset(&self) -> bool {
        let previous = {
            let mut tripped_at = self.tripped_at.lock();
            *tripped_at = None;
            self.active.swap(PRIMARY, Ordering::AcqRel)
        };
        if previous != PRIMARY {
            info!("failover reset to primary");
            true
        } else {
            false
        }
    }

    /// Wall-clock time of the most recent trip, if the controller is tripped
    pub fn tripped_at(&self) -> Option<SystemTime> {
        self.tripped_at.lock().map(|(_, wall)| wall)
    }

    /// Windowed failure count for `target`
    pub fn failure_count(&self, target: Target) -> usize {
        self.counter(target).get_count()
    }

    /// Total trips since construction
    pub fn trips(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> FailoverSnapshot {
        let active = self.active();
        FailoverSnapshot {
            active,
            passive: active.other(),
            primary_failures: self.primary_failures.get_count(),
            secondary_failures: self.secondary_failures.get_count(),
            trips: self.trips(),
            tripped_at: self.tripped_at(),
        }
    }

    fn counter(&self, target: Target) -> &SlidingWindowCounter {
        match target {
            Target::Primary => &self.primary_failures,
            Target::Secondary => &self.secondary_failures,
        }
    }

    // Checked and applied under one lock so a newer trip is never undone early
    fn fail_back_if_due(&self) -> bool {
        let FailbackPolicy::After(after) = self.config.failback else {
            return false;
        };

        let mut tripped_at = self.tripped_at.lock();
        let due = tripped_at.is_some_and(|(instant, _)| instant.elapsed() >= after);
        if !due {
            return false;
        }

        let swapped = self
            .active
            .compare_exchange(SECONDARY, PRIMARY, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            *tripped_at = None;
            info!("failback window elapsed, returning to primary");
        }
        swapped
    }
}

impl Default for FailoverController {
    fn default() -> Self {
        Self::new(FailoverConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn controller(threshold: usize, window_secs: u64) -> FailoverController {
        FailoverController::new(FailoverConfig {
            exception_threshold: threshold,
            sliding_duration: Duration::from_secs(window_secs),
            ..Default::default()
        })
    }

    #[test]
    fn test_starts_on_primary() {
        let controller = FailoverController::default();
        assert_eq!(controller.active(), Target::Primary);
        assert_eq!(controller.passive(), Target::Secondary);
        assert!(controller.tripped_at().is_none());
    }

    #[tokio::test]
    async fn test_threshold_one_trips_on_first_failure() {
        let controller = controller(1, 30);

        controller.record_failure();
        assert!(controller.should_failover());
        assert!(controller.trip());

        assert_eq!(controller.active(), Target::Secondary);
        assert_eq!(controller.passive(), Target::Primary);
        assert!(controller.tripped_at().is_some());
        assert_eq!(controller.trips(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_do_not_trip() {
        let controller = controller(2, 5);

        controller.record_failure();
        tokio::time::advance(Duration::from_secs(5)).await;
        controller.record_failure();

        assert!(!controller.should_failover());
        assert_eq!(controller.active(), Target::Primary);
    }

    #[tokio::test]
    async fn test_concurrent_trippers_flip_once() {
        let controller = Arc::new(controller(1, 30));
        controller.record_failure();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let controller = Arc::clone(&controller);
                tokio::spawn(async move { controller.trip_from(Target::Primary) })
            })
            .collect();

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(controller.active(), Target::Secondary);
        assert_eq!(controller.trips(), 1);
    }

    #[tokio::test]
    async fn test_trip_keeps_counters() {
        let controller = controller(1, 30);
        controller.record_failure();
        controller.trip();

        assert_eq!(controller.failure_count(Target::Primary), 1);
        assert_eq!(controller.failure_count(Target::Secondary), 0);
        // Secondary has its own, still empty, window
        assert!(!controller.should_failover());
    }

    #[tokio::test]
    async fn test_failure_attributed_to_explicit_target() {
        let controller = controller(2, 30);
        controller.record_failure_for(Target::Secondary);
        controller.record_failure_for(Target::Secondary);

        assert!(!controller.should_failover());
        assert!(controller.should_failover_for(Target::Secondary));
        assert_eq!(controller.failure_count(Target::Primary), 0);
    }

    #[tokio::test]
    async fn test_stale_trip_is_rejected() {
        let controller = controller(1, 30);
        assert!(controller.trip_from(Target::Primary));
        // A caller that still believes primary is active loses
        assert!(!controller.trip_from(Target::Primary));
        assert_eq!(controller.active(), Target::Secondary);
    }

    #[tokio::test]
    async fn test_reset_returns_to_primary() {
        let controller = controller(1, 30);
        controller.trip();

        assert!(controller.reset());
        assert_eq!(controller.active(), Target::Primary);
        assert!(controller.tripped_at().is_none());
        assert!(!controller.reset());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failback_after_delay() {
        let controller = FailoverController::new(FailoverConfig {
            exception_threshold: 1,
            sliding_duration: Duration::from_secs(30),
            failback: FailbackPolicy::After(Duration::from_secs(60)),
        });
        controller.trip();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(controller.active(), Target::Secondary);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(controller.active(), Target::Primary);
        assert!(controller.tripped_at().is_none());
    }

    #[test]
    fn test_trip_timestamp_matches_active_target_under_contention() {
        let controller = Arc::new(controller(1, 30));

        for _ in 0..50 {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let controller = Arc::clone(&controller);
                    std::thread::spawn(move || match i % 3 {
                        0 => {
                            controller.trip_from(Target::Primary);
                        }
                        1 => {
                            controller.trip_from(Target::Secondary);
                        }
                        _ => {
                            controller.reset();
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            let snapshot = controller.snapshot();
            assert_eq!(
                snapshot.active == Target::Secondary,
                snapshot.tripped_at.is_some()
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_fails_back_by_default() {
        let controller = controller(1, 30);
        controller.trip();

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(controller.active(), Target::Secondary);
    }

    #[test]
    fn test_zero_threshold_is_clamped() {
        let controller = controller(0, 30);
        assert_eq!(controller.config().exception_threshold, 1);
        assert!(!controller.should_failover());
    }

    #[tokio::test]
    async fn test_snapshot() {
        let controller = controller(1, 30);
        controller.record_failure();
        controller.trip();

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.active, Target::Secondary);
        assert_eq!(snapshot.passive, Target::Primary);
        assert_eq!(snapshot.primary_failures, 1);
        assert_eq!(snapshot.secondary_failures, 0);
        assert_eq!(snapshot.trips, 1);
        assert!(snapshot.tripped_at.is_some());
    }

    #[test]
    fn test_target_display() {
        assert_eq!(Target::Primary.to_string(), "primary");
        assert_eq!(Target::Secondary.other(), Target::Primary);
    }
}
