use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Something that can block the current thread.
///
/// Production code uses [`ThreadSleeper`]; tests swap in a recorder so retry
/// timing can be asserted without actually waiting.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            thread::sleep(duration);
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Minimum spacing between two requests leaving the process
    pub min_interval: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Default)]
struct RateLimiterState {
    /// Time of the most recently reserved slot
    last_reserved: Option<Instant>,
    /// Slots handed out so far
    granted: u64,
    /// Sum of all waits handed out
    total_wait: Duration,
    /// Number of times the schedule was pushed back
    push_backs: u32,
}

/// Process-wide request gate.
///
/// Every caller reserves a slot at least `min_interval` after the previous
/// one under a short lock, then sleeps outside it so other threads can keep
/// reserving.
#[derive(Clone)]
pub struct GlobalRateLimiter {
    config: RateLimiterConfig,
    state: Arc<Mutex<RateLimiterState>>,
    sleeper: Arc<dyn Sleeper>,
}

impl GlobalRateLimiter {
    pub fn new() -> Self {
        Self::with_config(RateLimiterConfig::default())
    }

    pub fn with_config(config: RateLimiterConfig) -> Self {
        Self::with_sleeper(config, Arc::new(ThreadSleeper))
    }

    pub fn with_sleeper(config: RateLimiterConfig, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(RateLimiterState::default())),
            sleeper,
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.config.min_interval
    }

    /// Reserve the next slot and return its instant.
    pub fn reserve(&self) -> Instant {
        let now = Instant::now();
        let mut state = self.state.lock();

        let slot = match state.last_reserved {
            Some(last) => (last + self.config.min_interval).max(now),
            None => now,
        };

        state.last_reserved = Some(slot);
        state.granted += 1;
        state.total_wait += slot.saturating_duration_since(now);
        slot
    }

    /// Reserve the next slot and return how long the caller must wait for it.
    pub fn reserve_slot(&self) -> Duration {
        self.reserve().saturating_duration_since(Instant::now())
    }

    /// Reserve a slot and sleep until it arrives.
    pub fn wait(&self) -> Duration {
        let wait = self.reserve_slot();
        if !wait.is_zero() {
            debug!(wait_ms = wait.as_millis() as u64, "Rate limiter waiting");
            self.sleeper.sleep(wait);
        }
        wait
    }

    /// Push the schedule `backoff` into the future for every thread.
    ///
    /// Never moves the schedule earlier than it already is.
    pub fn push_back(&self, backoff: Duration) {
        let future = Instant::now() + backoff;
        let mut state = self.state.lock();

        let moved = match state.last_reserved {
            Some(last) if last >= future => false,
            _ => {
                state.last_reserved = Some(future);
                true
            }
        };

        if moved {
            state.push_backs += 1;
            warn!(backoff_secs = backoff.as_secs_f64(), "Rate limiter pushed back for all threads");
        }
    }

    pub fn get_stats(&self) -> RateLimiterStats {
        let state = self.state.lock();
        RateLimiterStats {
            granted: state.granted,
            total_wait: state.total_wait,
            push_backs: state.push_backs,
        }
    }
}

impl Default for GlobalRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters describing how much the gate has throttled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterStats {
    pub granted: u64,
    pub total_wait: Duration,
    pub push_backs: u32,
}

impl RateLimiterStats {
    pub fn format_stats(&self) -> String {
        format!(
            "Requests: {} | Waited: {:.1}s | Push-backs: {}",
            self.granted,
            self.total_wait.as_secs_f64(),
            self.push_backs
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Records requested sleeps instead of blocking.
    #[derive(Default)]
    pub(crate) struct RecordingSleeper {
        pub sleeps: Mutex<Vec<Duration>>,
    }

    impl RecordingSleeper {
        pub(crate) fn recorded(&self) -> Vec<Duration> {
            self.sleeps.lock().clone()
        }
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) {
            self.sleeps.lock().push(duration);
        }
    }

    fn limiter(ms: u64) -> GlobalRateLimiter {
        GlobalRateLimiter::with_config(RateLimiterConfig {
            min_interval: Duration::from_millis(ms),
        })
    }

    #[test]
    fn test_first_request_is_immediate() {
        let limiter = limiter(500);
        assert_eq!(limiter.reserve_slot(), Duration::ZERO);
        assert!(limiter.reserve_slot() > Duration::from_millis(400));
    }

    #[test]
    fn test_concurrent_slots_are_spaced() {
        let limiter = limiter(50);
        let interval = limiter.min_interval();

        for threads in [2usize, 5, 16] {
            let limiter = limiter.clone();
            let mut slots: Vec<Instant> = thread::scope(|scope| {
                let handles: Vec<_> = (0..threads)
                    .map(|_| scope.spawn(|| limiter.reserve()))
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });

            slots.sort();
            for pair in slots.windows(2) {
                assert!(pair[1] - pair[0] >= interval, "slots closer than {interval:?}");
            }
        }
    }

    #[test]
    fn test_wait_goes_through_sleeper() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let limiter = GlobalRateLimiter::with_sleeper(
            RateLimiterConfig {
                min_interval: Duration::from_millis(100),
            },
            sleeper.clone(),
        );

        limiter.wait();
        limiter.wait();
        limiter.wait();

        let sleeps = sleeper.recorded();
        assert_eq!(sleeps.len(), 2);
        assert!(sleeps[1] > sleeps[0]);
        assert_eq!(limiter.get_stats().granted, 3);
    }

    #[test]
    fn test_real_wait_spacing() {
        let limiter = limiter(20);
        let start = Instant::now();

        thread::scope(|scope| {
            for _ in 0..5 {
                scope.spawn(|| limiter.wait());
            }
        });

        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn test_push_back_only_moves_forward() {
        let limiter = limiter(10);
        limiter.push_back(Duration::from_secs(30));
        let long_wait = limiter.reserve_slot();
        assert!(long_wait >= Duration::from_secs(29));

        limiter.push_back(Duration::from_secs(1));
        let next = limiter.reserve_slot();
        assert!(next > long_wait);
        assert_eq!(limiter.get_stats().push_backs, 1);
    }
}
