use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Requests counted in the window after this decision.
    pub in_window: u32,
    pub limit: u32,
}

/// Checks between sweeps of idle requesters.
const PRUNE_EVERY: u64 = 256;

/// Per-requester sliding window. The window for one requester is updated
/// under its map shard lock, so concurrent checks never both pass the Nth slot.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    window: Duration,
    hits: DashMap<String, VecDeque<OffsetDateTime>>,
    checks: AtomicU64,
}

impl SlidingWindowLimiter {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            hits: DashMap::new(),
            checks: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Admits and counts the request when fewer than `limit` requests from
    /// `requester` fall inside the window. Refused requests are not counted.
    #[must_use]
    pub fn check_and_record(&self, requester: &str, limit: u32) -> RateDecision {
        self.check_and_record_at(requester, limit, OffsetDateTime::now_utc())
    }

    /// Every `PRUNE_EVERY` checks, requesters whose window has emptied are
    /// dropped before the check runs.
    #[must_use]
    pub fn check_and_record_at(&self, requester: &str, limit: u32, now: OffsetDateTime) -> RateDecision {
        if self.checks.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY == PRUNE_EVERY - 1 {
            self.cleanup_at(now);
        }
        let cutoff = now - self.window;
        let mut entry = self.hits.entry(requester.to_string()).or_default();
        while entry.front().is_some_and(|seen| *seen <= cutoff) {
            entry.pop_front();
        }

        let in_window = u32::try_from(entry.len()).unwrap_or(u32::MAX);
        if in_window >= limit {
            return RateDecision {
                allowed: false,
                in_window,
                limit,
            };
        }

        entry.push_back(now);
        RateDecision {
            allowed: true,
            in_window: in_window + 1,
            limit,
        }
    }

    /// Counts a request that was admitted earlier, e.g. one replayed from the audit ledger.
    pub fn record_at(&self, requester: &str, at: OffsetDateTime) {
        let mut entry = self.hits.entry(requester.to_string()).or_default();
        let position = entry.partition_point(|seen| *seen <= at);
        entry.insert(position, at);
    }

    /// Gives back a slot taken by `check_and_record_at` at `at`, for an attempt
    /// that was never completed. Returns whether a matching hit was found.
    pub fn release_at(&self, requester: &str, at: OffsetDateTime) -> bool {
        let Some(mut entry) = self.hits.get_mut(requester) else {
            return false;
        };
        match entry.iter().rposition(|seen| *seen == at) {
            Some(position) => entry.remove(position).is_some(),
            None => false,
        }
    }

    /// Requests from `requester` counted inside the window ending at `now`.
    #[must_use]
    pub fn in_window_at(&self, requester: &str, now: OffsetDateTime) -> u32 {
        let cutoff = now - self.window;
        self.hits.get(requester).map_or(0, |hits| {
            u32::try_from(hits.iter().filter(|seen| **seen > cutoff).count()).unwrap_or(u32::MAX)
        })
    }

    /// Drops requesters with no hits inside the window.
    pub fn cleanup_at(&self, now: OffsetDateTime) {
        let cutoff = now - self.window;
        self.hits
            .retain(|_, hits| hits.back().is_some_and(|latest| *latest > cutoff));
    }

    #[must_use]
    pub fn tracked_requesters(&self) -> usize {
        self.hits.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread;

    use super::*;

    const HOUR: Duration = Duration::from_secs(3_600);

    // Test IDs: TRL-001
    #[test]
    fn nth_request_passes_and_next_is_refused() {
        let limiter = SlidingWindowLimiter::new(HOUR);
        let now = OffsetDateTime::now_utc();
        for index in 1..=10 {
            let decision = limiter.check_and_record_at("alice", 10, now);
            assert!(decision.allowed, "request {index} should pass");
            assert_eq!(decision.in_window, index);
        }
        let refused = limiter.check_and_record_at("alice", 10, now);
        assert!(!refused.allowed);
        assert_eq!(refused.in_window, 10);

        assert!(limiter.check_and_record_at("bob", 10, now).allowed);
    }

    // Test IDs: TRL-002
    #[test]
    fn window_slides_forward() {
        let limiter = SlidingWindowLimiter::new(HOUR);
        let start = OffsetDateTime::now_utc();
        assert!(limiter.check_and_record_at("alice", 2, start).allowed);
        assert!(limiter
            .check_and_record_at("alice", 2, start + time::Duration::minutes(30))
            .allowed);
        assert!(!limiter
            .check_and_record_at("alice", 2, start + time::Duration::minutes(59))
            .allowed);
        assert!(limiter
            .check_and_record_at("alice", 2, start + time::Duration::minutes(61))
            .allowed);

        limiter.cleanup_at(start + time::Duration::hours(3));
        assert_eq!(limiter.tracked_requesters(), 0);
    }

    // Test IDs: TRL-003
    #[test]
    fn concurrent_checks_never_exceed_limit() {
        let limiter = Arc::new(SlidingWindowLimiter::new(HOUR));
        let allowed = Arc::new(AtomicU32::new(0));
        let now = OffsetDateTime::now_utc();

        let handles = (0..16)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let allowed = Arc::clone(&allowed);
                thread::spawn(move || {
                    for _ in 0..10 {
                        if limiter.check_and_record_at("shared", 25, now).allowed {
                            allowed.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            if handle.join().is_err() {
                panic!("limiter thread panicked");
            }
        }
        assert_eq!(allowed.load(Ordering::SeqCst), 25);
    }

    // Test IDs: TRL-005
    #[test]
    fn replayed_hits_count_against_the_window() {
        let limiter = SlidingWindowLimiter::new(HOUR);
        let now = OffsetDateTime::now_utc();
        limiter.record_at("alice", now - time::Duration::minutes(10));
        limiter.record_at("alice", now - time::Duration::minutes(20));
        limiter.record_at("alice", now - time::Duration::hours(2));
        let decision = limiter.check_and_record_at("alice", 3, now);
        assert!(decision.allowed);
        assert_eq!(decision.in_window, 3);
        assert!(!limiter.check_and_record_at("alice", 3, now).allowed);
    }

    // Test IDs: TRL-004
    #[test]
    fn zero_limit_refuses_everything() {
        let limiter = SlidingWindowLimiter::new(HOUR);
        assert!(!limiter.check_and_record("alice", 0).allowed);
    }

    // Test IDs: TRL-006
    #[test]
    fn released_slot_can_be_taken_again() {
        let limiter = SlidingWindowLimiter::new(HOUR);
        let now = OffsetDateTime::now_utc();
        assert!(limiter.check_and_record_at("alice", 1, now).allowed);
        assert_eq!(limiter.in_window_at("alice", now), 1);

        assert!(limiter.release_at("alice", now));
        assert_eq!(limiter.in_window_at("alice", now), 0);
        assert!(!limiter.release_at("alice", now));
        assert!(!limiter.release_at("bob", now));

        assert!(limiter.check_and_record_at("alice", 1, now).allowed);
        assert!(!limiter.check_and_record_at("alice", 1, now).allowed);
    }

    // Test IDs: TRL-007
    #[test]
    fn idle_requesters_are_pruned_during_checks() {
        let limiter = SlidingWindowLimiter::new(HOUR);
        let start = OffsetDateTime::now_utc();
        for index in 0..100 {
            assert!(limiter.check_and_record_at(&format!("visitor-{index}"), 1, start).allowed);
        }
        assert_eq!(limiter.tracked_requesters(), 100);

        let later = start + time::Duration::hours(2);
        for _ in 0..PRUNE_EVERY {
            let _ = limiter.check_and_record_at("steady", u32::MAX, later);
        }
        assert_eq!(limiter.tracked_requesters(), 1);
        assert_eq!(limiter.in_window_at("steady", later), u32::try_from(PRUNE_EVERY).unwrap_or(u32::MAX));
    }
}
