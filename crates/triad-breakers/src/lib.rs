//! Outbound-call gates: per-delegate circuit breakers, the daily cost
//! breaker, and per-key rate limiters.
//!
//! State that must survive a crashed process or a locked database lives in
//! flat files under the state directory (`breakers/*.state`,
//! `rate-limits/*.json`, `costs/*.json`); the SQL `breakers` table is a
//! mirror for health queries.

pub mod circuit;
pub mod cost;
pub mod rate;

pub use circuit::{Admission, BreakerSet};
pub use cost::CostTracker;
pub use rate::{RateLimiter, RateStrategy};
