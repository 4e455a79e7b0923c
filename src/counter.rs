//! Shared counter observed by every worker of a thread batch.
//!
//! The default discipline is a plain load followed by a store: two workers
//! that read the same value both write `value + 1` and one increment is lost.
//! The interleaving is the point. `Atomic` is the alternative for callers
//! that need an exact total.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;

/// How `increment` synchronizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterDiscipline {
    /// Separate read and write; concurrent increments can be lost
    #[default]
    Unsynchronized,
    /// Single read-modify-write
    Atomic,
}

impl fmt::Display for CounterDiscipline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsynchronized => f.write_str("unsynchronized"),
            Self::Atomic => f.write_str("atomic"),
        }
    }
}

impl FromStr for CounterDiscipline {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unsynchronized" => Ok(Self::Unsynchronized),
            "atomic" => Ok(Self::Atomic),
            other => Err(format!("unknown counter discipline `{}`", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SharedCounter {
    value: Arc<AtomicI64>,
    discipline: CounterDiscipline,
}

impl SharedCounter {
    pub fn new(seed: i64, discipline: CounterDiscipline) -> Self {
        Self {
            value: Arc::new(AtomicI64::new(seed)),
            discipline,
        }
    }

    /// Add one and return the value observed before the increment.
    pub fn increment(&self) -> i64 {
        match self.discipline {
            CounterDiscipline::Unsynchronized => {
                let seen = self.value.load(Ordering::Relaxed);
                // Widen the window between read and write so interleavings
                // surface even on a single core.
                thread::yield_now();
                self.value.store(seen + 1, Ordering::Relaxed);
                seen
            }
            CounterDiscipline::Atomic => self.value.fetch_add(1, Ordering::SeqCst),
        }
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }

    pub fn discipline(&self) -> CounterDiscipline {
        self.discipline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hammer(counter: &SharedCounter, threads: usize, per_thread: usize) {
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..per_thread {
                        counter.increment();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_single_worker_observes_sequence() {
        for discipline in [CounterDiscipline::Unsynchronized, CounterDiscipline::Atomic] {
            let counter = SharedCounter::new(10, discipline);
            let seen: Vec<i64> = (0..5).map(|_| counter.increment()).collect();
            assert_eq!(seen, vec![10, 11, 12, 13, 14]);
            assert_eq!(counter.get(), 15);
        }
    }

    #[test]
    fn test_atomic_total_is_exact() {
        let counter = SharedCounter::new(0, CounterDiscipline::Atomic);
        hammer(&counter, 8, 500);
        assert_eq!(counter.get(), 4000);
    }

    #[test]
    fn test_unsynchronized_never_exceeds_total() {
        let counter = SharedCounter::new(0, CounterDiscipline::Unsynchronized);
        hammer(&counter, 8, 500);
        let total = counter.get();
        assert!(total <= 4000, "counter overshot: {}", total);
        assert!(total > 0);
    }

    #[test]
    fn test_clones_share_storage() {
        let counter = SharedCounter::new(0, CounterDiscipline::Atomic);
        let other = counter.clone();
        other.increment();
        assert_eq!(counter.get(), 1);
    }

    #[test]
    fn test_discipline_parse() {
        assert_eq!("atomic".parse::<CounterDiscipline>().unwrap(), CounterDiscipline::Atomic);
        assert_eq!(
            CounterDiscipline::Unsynchronized.to_string().parse::<CounterDiscipline>().unwrap(),
            CounterDiscipline::Unsynchronized
        );
        assert!("locked".parse::<CounterDiscipline>().is_err());
    }
}
