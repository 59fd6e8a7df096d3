//! Rate-limit circuit breaker.
//!
//! A burst of rate-limit signals inside a short window engages a single
//! global flag; the owner then stops every session. The breaker itself
//! only counts and flips the flag.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use burstcast_core::config::BreakerConfig;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct SignalWindow {
    count: u32,
    last: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    window: Duration,
    cooldown: Duration,
    signals: Mutex<SignalWindow>,
    engaged: AtomicBool,
    trips: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            threshold: config.threshold.max(1),
            window: Duration::from_secs(config.window_secs),
            cooldown: Duration::from_secs(config.cooldown_secs),
            signals: Mutex::new(SignalWindow::default()),
            engaged: AtomicBool::new(false),
            trips: AtomicU64::new(0),
        }
    }

    /// Count one signal. Returns `true` when it completes a burst; the count
    /// starts over afterwards.
    pub fn record_signal(&self) -> bool {
        let mut signals = match self.signals.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();
        let in_window = signals
            .last
            .is_some_and(|last| now.duration_since(last) <= self.window);
        signals.count = if in_window { signals.count + 1 } else { 1 };
        signals.last = Some(now);

        if signals.count >= self.threshold {
            signals.count = 0;
            true
        } else {
            false
        }
    }

    /// Flip the emergency flag. Only one caller wins per trip.
    pub fn try_engage(&self) -> bool {
        let won = self
            .engaged
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.trips.fetch_add(1, Ordering::Relaxed);
        }
        won
    }

    pub fn release(&self) {
        self.engaged.store(false, Ordering::Release);
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::Acquire)
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Times the breaker has tripped since start.
    pub fn trips(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }
}
