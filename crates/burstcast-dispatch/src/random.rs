//! Injectable randomness for round counts, delays, jitter and shuffling.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

/// Source of uniformly distributed integers.
pub trait RandomSource: Send + Sync {
    /// Uniform value in `lo..=hi`. Returns `lo` when `hi <= lo`.
    fn range(&self, lo: u64, hi: u64) -> u64;
}

/// Thread-local OS-seeded generator. Every call uses the calling thread's own
/// generator, so concurrent sessions never contend on a shared lock.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn range(&self, lo: u64, hi: u64) -> u64 {
        if hi <= lo {
            return lo;
        }
        rand::thread_rng().gen_range(lo..=hi)
    }
}

/// Replays a fixed sequence of raw values, wrapping around; each value is
/// folded into the requested range. Used to make orderings reproducible.
#[derive(Debug)]
pub struct SequenceRandom {
    values: Mutex<Vec<u64>>,
    cursor: AtomicUsize,
}

impl SequenceRandom {
    pub fn new(values: Vec<u64>) -> Self {
        Self {
            values: Mutex::new(if values.is_empty() { vec![0] } else { values }),
            cursor: AtomicUsize::new(0),
        }
    }
}

impl RandomSource for SequenceRandom {
    fn range(&self, lo: u64, hi: u64) -> u64 {
        if hi <= lo {
            return lo;
        }
        let raw = {
            let values = match self.values.lock() {
                Ok(v) => v,
                Err(poisoned) => poisoned.into_inner(),
            };
            let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % values.len();
            values[idx]
        };
        let span = hi - lo + 1;
        lo + raw % span
    }
}

/// Fisher–Yates shuffle driven by `rng`.
pub fn shuffle<T>(rng: &dyn RandomSource, items: &mut [T]) {
    for i in (1..items.len()).rev() {
        let j = rng.range(0, i as u64) as usize;
        items.swap(i, j);
    }
}
