//! Sliding Window Counter: "how many hits in the last W seconds"
//!
//! Writers never contend with each other: each `increment` pushes a timestamp
//! onto an unbounded multi-producer lane. Readers fold the lane into an
//! ordered buffer and prune expired entries from the front. Pruning is lazy
//! and only happens on read.
//!
//! Under concurrent writers the buffer is not strictly chronological (a thread
//! can read the clock, get preempted, and enqueue after a later timestamp).
//! Pruning stops at the first live entry, so a read may briefly over-count by
//! the entries racing at the window boundary. Long-run counts are exact.
//!
//! # Example
//!
//! ```
//! use busguard_core_resilience::sliding_window::SlidingWindowCounter;
//! use std::time::Duration;
//!
//! let counter = SlidingWindowCounter::new(Duration::from_secs(30));
//! counter.increment();
//! counter.increment();
//! assert_eq!(counter.get_count(), 2);
//! assert!(counter.reset());
//! assert_eq!(counter.get_count(), 0);
//! ```

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Thread-safe counter of hit timestamps within a trailing time window
#[derive(Debug)]
pub struct SlidingWindowCounter {
    window: Duration,
    /// Lock-free append lane shared by all writers
    tx: Sender<Instant>,
    rx: Receiver<Instant>,
    /// Entries already folded out of the lane, oldest first
    settled: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowCounter {
    /// Create a counter over the given trailing window
    pub fn new(window: Duration) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            window,
            tx,
            rx,
            settled: Mutex::new(VecDeque::new()),
        }
    }

    /// Width of the trailing window
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record a hit at "now".
    ///
    /// Returns the number of entries held, which is an upper bound on the
    /// windowed count because nothing has been pruned yet.
    pub fn increment(&self) -> usize {
        // Both ends live in `self`, so the channel can never be disconnected.
        let _ = self.tx.send(Instant::now());
        self.rx.len() + self.settled.lock().len()
    }

    /// Prune entries older than `now - window` and return what remains
    pub fn get_count(&self) -> usize {
        let now = Instant::now();
        let mut settled = self.settled.lock();
        settled.extend(self.rx.try_iter());

        while let Some(oldest) = settled.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                settled.pop_front();
            } else {
                break;
            }
        }

        settled.len()
    }

    /// Drop every entry. Returns true if the counter is empty afterwards.
    pub fn reset(&self) -> bool {
        let mut settled = self.settled.lock();
        for _ in self.rx.try_iter() {}
        settled.clear();
        settled.is_empty() && self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_window() {
        let counter = SlidingWindowCounter::new(Duration::from_secs(3));

        counter.increment();
        counter.increment();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(counter.get_count(), 2);

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(counter.get_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_expiry_keeps_recent_hits() {
        let counter = SlidingWindowCounter::new(Duration::from_secs(5));

        counter.increment();
        tokio::time::advance(Duration::from_secs(3)).await;
        counter.increment();
        counter.increment();

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(counter.get_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_increment_returns_unpruned_size() {
        let counter = SlidingWindowCounter::new(Duration::from_secs(1));

        assert_eq!(counter.increment(), 1);
        tokio::time::advance(Duration::from_secs(2)).await;
        // Stale entry is still held until the next read
        assert_eq!(counter.increment(), 2);
        assert_eq!(counter.get_count(), 1);
    }

    #[test]
    fn test_reset_clears_everything() {
        let counter = SlidingWindowCounter::new(Duration::from_secs(60));
        for _ in 0..5 {
            counter.increment();
        }
        counter.get_count();
        counter.increment();

        assert!(counter.reset());
        assert_eq!(counter.get_count(), 0);
    }

    #[test]
    fn test_reset_on_empty_counter() {
        let counter = SlidingWindowCounter::new(Duration::from_secs(1));
        assert!(counter.reset());
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let counter = Arc::new(SlidingWindowCounter::new(Duration::from_secs(600)));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        counter.increment();
                    }
                })
            })
            .collect();

        for handle in threads {
            handle.join().unwrap();
        }

        assert_eq!(counter.get_count(), 2000);
    }
}
