//! Per-key rate limiters over flock-protected JSON bucket files.
//!
//! Three strategies: token bucket, sliding window, fixed window. Buckets
//! live under `<state_dir>/rate-limits/<key>.json` and are read-modify-
//! written under an exclusive advisory lock, so limits hold across every
//! process on the host.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use triad_core::types::{Timestamp, TraceId};
use triad_core::TriadError;
use triad_locks::{LockManager, LockMode};

#[derive(Debug, Clone, PartialEq)]
pub enum RateStrategy {
    /// `capacity` tokens, refilled at `refill_per_sec`.
    TokenBucket { capacity: f64, refill_per_sec: f64 },
    /// At most `limit` calls in any trailing `window_secs` span.
    SlidingWindow { limit: usize, window_secs: i64 },
    /// At most `limit` calls per aligned `window_secs` window.
    FixedWindow { limit: u64, window_secs: i64 },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Bucket {
    #[serde(default)]
    tokens: f64,
    #[serde(default)]
    last_refill: Timestamp,
    #[serde(default)]
    window_start: Timestamp,
    #[serde(default)]
    count: u64,
    #[serde(default)]
    timestamps: Vec<Timestamp>,
    #[serde(default)]
    initialized: bool,
}

pub struct RateLimiter {
    dir: PathBuf,
    locks_dir: PathBuf,
    locks: LockManager,
}

impl RateLimiter {
    pub fn new(state_dir: &std::path::Path, locks: LockManager) -> Result<Self, TriadError> {
        let dir = state_dir.join(triad_core::constants::RATE_LIMITS_DIR);
        let locks_dir = state_dir.join(triad_core::constants::LOCKS_DIR);
        std::fs::create_dir_all(&dir)?;
        std::fs::create_dir_all(&locks_dir)?;
        Ok(Self {
            dir,
            locks_dir,
            locks,
        })
    }

    /// Admit or reject one call for `key` under `strategy`.
    pub fn check(
        &self,
        key: &str,
        strategy: &RateStrategy,
        trace: &TraceId,
        now: Timestamp,
    ) -> Result<(), TriadError> {
        let bucket_path = self.dir.join(format!("{key}.json"));
        let lock_path = self.locks_dir.join(format!("rate-{key}.lock"));
        let _guard = self.locks.acquire(&lock_path, LockMode::Exclusive, trace)?;

        let mut bucket: Bucket = match std::fs::read_to_string(&bucket_path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
            Err(_) => Bucket::default(),
        };

        let admitted = match strategy {
            RateStrategy::TokenBucket {
                capacity,
                refill_per_sec,
            } => {
                if !bucket.initialized {
                    bucket.tokens = *capacity;
                    bucket.last_refill = now;
                    bucket.initialized = true;
                }
                let elapsed = (now - bucket.last_refill).max(0) as f64;
                bucket.tokens = (bucket.tokens + elapsed * refill_per_sec).min(*capacity);
                bucket.last_refill = now;
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    true
                } else {
                    false
                }
            }
            RateStrategy::SlidingWindow { limit, window_secs } => {
                bucket.timestamps.retain(|t| now - *t < *window_secs);
                if bucket.timestamps.len() < *limit {
                    bucket.timestamps.push(now);
                    true
                } else {
                    false
                }
            }
            RateStrategy::FixedWindow { limit, window_secs } => {
                let window = now - now.rem_euclid(*window_secs);
                if bucket.window_start != window {
                    bucket.window_start = window;
                    bucket.count = 0;
                }
                if bucket.count < *limit {
                    bucket.count += 1;
                    true
                } else {
                    false
                }
            }
        };

        let text = serde_json::to_string(&bucket)
            .map_err(|e| TriadError::Serialization(e.to_string()))?;
        std::fs::write(&bucket_path, text)?;

        if admitted {
            Ok(())
        } else {
            Err(TriadError::RateLimited { key: key.into() })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> (tempfile::TempDir, RateLimiter) {
        let dir = tempfile::tempdir().unwrap();
        let limiter = RateLimiter::new(dir.path(), LockManager::default()).unwrap();
        (dir, limiter)
    }

    #[test]
    fn token_bucket_exhausts_and_refills() {
        let (_dir, limiter) = limiter();
        let strategy = RateStrategy::TokenBucket {
            capacity: 2.0,
            refill_per_sec: 1.0,
        };
        let trace = TraceId::generate();

        assert!(limiter.check("codex", &strategy, &trace, 100).is_ok());
        assert!(limiter.check("codex", &strategy, &trace, 100).is_ok());
        assert!(matches!(
            limiter.check("codex", &strategy, &trace, 100),
            Err(TriadError::RateLimited { .. })
        ));
        // One second later one token is back.
        assert!(limiter.check("codex", &strategy, &trace, 101).is_ok());
    }

    #[test]
    fn sliding_window_prunes_old_calls() {
        let (_dir, limiter) = limiter();
        let strategy = RateStrategy::SlidingWindow {
            limit: 2,
            window_secs: 10,
        };
        let trace = TraceId::generate();

        assert!(limiter.check("claude", &strategy, &trace, 100).is_ok());
        assert!(limiter.check("claude", &strategy, &trace, 105).is_ok());
        assert!(limiter.check("claude", &strategy, &trace, 106).is_err());
        // t=110: the call at t=100 ages out.
        assert!(limiter.check("claude", &strategy, &trace, 110).is_ok());
    }

    #[test]
    fn fixed_window_resets_on_boundary() {
        let (_dir, limiter) = limiter();
        let strategy = RateStrategy::FixedWindow {
            limit: 2,
            window_secs: 60,
        };
        let trace = TraceId::generate();

        assert!(limiter.check("gemini", &strategy, &trace, 100).is_ok());
        assert!(limiter.check("gemini", &strategy, &trace, 110).is_ok());
        assert!(limiter.check("gemini", &strategy, &trace, 115).is_err());
        // Next aligned window (120) starts fresh.
        assert!(limiter.check("gemini", &strategy, &trace, 121).is_ok());
    }

    #[test]
    fn keys_are_independent() {
        let (_dir, limiter) = limiter();
        let strategy = RateStrategy::FixedWindow {
            limit: 1,
            window_secs: 60,
        };
        let trace = TraceId::generate();
        assert!(limiter.check("a", &strategy, &trace, 100).is_ok());
        assert!(limiter.check("b", &strategy, &trace, 100).is_ok());
        assert!(limiter.check("a", &strategy, &trace, 101).is_err());
    }
}
