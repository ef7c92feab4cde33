//! Per-host politeness tracker
//!
//! Two invariants, both process-wide: at most one in-flight poll per
//! host, and consecutive polls of the same host are spaced by at least
//! the configured minimum, measured from poll completion.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

pub struct HostPoliteness {
    min_delay: Duration,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    last_completed: HashMap<String, Instant>,
    in_flight: HashSet<String>,
}

impl HostPoliteness {
    pub fn new(min_delay: Duration) -> Self {
        Self {
            min_delay,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Try to claim the host for one poll. Returns `None` on success, or
    /// the remaining wait when the host is busy or still cooling down.
    pub fn try_acquire(&self, host: &str) -> Option<Duration> {
        let mut inner = self.inner.lock();

        if inner.in_flight.contains(host) {
            // Busy; caller should retry on a later tick.
            return Some(self.min_delay);
        }

        if let Some(last) = inner.last_completed.get(host) {
            let elapsed = last.elapsed();
            if elapsed < self.min_delay {
                return Some(self.min_delay - elapsed);
            }
        }

        inner.in_flight.insert(host.to_string());
        None
    }

    /// Release the host and start its cooldown clock.
    pub fn release(&self, host: &str) {
        let mut inner = self.inner.lock();
        inner.in_flight.remove(host);
        inner.last_completed.insert(host.to_string(), Instant::now());
    }

    /// Drop completion entries older than `max_age` so a long-running
    /// process does not accumulate one entry per host ever seen.
    pub fn evict_stale(&self, max_age: Duration) {
        let mut inner = self.inner.lock();
        inner.last_completed.retain(|_, t| t.elapsed() < max_age);
    }

    #[cfg(test)]
    pub fn in_flight_count(&self) -> usize {
        self.inner.lock().in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_blocked_while_in_flight() {
        let p = HostPoliteness::new(Duration::from_secs(2));
        assert!(p.try_acquire("h1").is_none());
        assert!(p.try_acquire("h1").is_some());
        // A different host is unaffected.
        assert!(p.try_acquire("h2").is_none());
    }

    #[test]
    fn cooldown_applies_after_release() {
        let p = HostPoliteness::new(Duration::from_secs(2));
        assert!(p.try_acquire("h1").is_none());
        p.release("h1");

        let wait = p.try_acquire("h1").expect("must be cooling down");
        assert!(wait <= Duration::from_secs(2));
        assert!(wait > Duration::from_millis(1500));
    }

    #[test]
    fn zero_delay_allows_immediate_reacquire() {
        let p = HostPoliteness::new(Duration::ZERO);
        assert!(p.try_acquire("h1").is_none());
        p.release("h1");
        assert!(p.try_acquire("h1").is_none());
        assert_eq!(p.in_flight_count(), 1);
    }

    #[test]
    fn evict_keeps_fresh_entries() {
        let p = HostPoliteness::new(Duration::from_secs(2));
        assert!(p.try_acquire("h1").is_none());
        p.release("h1");
        p.evict_stale(Duration::from_secs(3600));
        // Entry is fresh, cooldown still holds.
        assert!(p.try_acquire("h1").is_some());
    }
}
