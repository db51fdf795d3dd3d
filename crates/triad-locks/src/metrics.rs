//! Bounded in-memory ring for lock diagnostics.
//!
//! The lock manager must never log through a sink that itself takes a lock
//! (that is how the original system deadlocked its own logger). Records
//! accumulate here and are drained by whoever owns a safe output path.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;

use triad_core::constants::LOCK_METRICS_RING_CAPACITY;

use crate::LockMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockEvent {
    Acquired,
    Contended,
    StaleReleased,
    DeadlockSuspected,
    Timeout,
}

impl LockEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Acquired => "acquired",
            Self::Contended => "contended",
            Self::StaleReleased => "stale_released",
            Self::DeadlockSuspected => "deadlock_suspected",
            Self::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LockMetric {
    pub event: LockEvent,
    pub path: PathBuf,
    pub attempt: u32,
    pub wait_s: f64,
    pub elapsed_s: f64,
    pub mode: LockMode,
    pub detail: String,
}

/// Fixed-capacity ring; oldest records are dropped first.
pub struct MetricsRing {
    inner: Mutex<VecDeque<LockMetric>>,
    capacity: usize,
}

impl MetricsRing {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, metric: LockMetric) {
        let mut ring = self.inner.lock().expect("metrics ring poisoned");
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(metric);
    }

    /// Take everything currently buffered.
    pub fn drain(&self) -> Vec<LockMetric> {
        let mut ring = self.inner.lock().expect("metrics ring poisoned");
        ring.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("metrics ring poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MetricsRing {
    fn default() -> Self {
        Self::with_capacity(LOCK_METRICS_RING_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(event: LockEvent, attempt: u32) -> LockMetric {
        LockMetric {
            event,
            path: PathBuf::from("/tmp/x.lock"),
            attempt,
            wait_s: 0.0,
            elapsed_s: 0.0,
            mode: LockMode::Exclusive,
            detail: String::new(),
        }
    }

    #[test]
    fn ring_drops_oldest_at_capacity() {
        let ring = MetricsRing::with_capacity(3);
        for i in 0..5 {
            ring.push(metric(LockEvent::Contended, i));
        }
        let drained = ring.drain();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0].attempt, 2);
        assert_eq!(drained[2].attempt, 4);
        assert!(ring.is_empty());
    }
}
