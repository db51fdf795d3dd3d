//! The five-way health snapshot persisted to `health.json` on every tick.

use serde::{Deserialize, Serialize};

use triad_core::types::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Critical,
}

impl HealthLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseCheck {
    pub present: bool,
    pub integrity_ok: bool,
    pub wal_mode: bool,
    pub level: HealthLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerCheck {
    pub open_models: Vec<String>,
    pub tracked_models: usize,
    pub level: HealthLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerCheck {
    pub active: u64,
    pub stale: Vec<String>,
    pub level: HealthLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueCheck {
    pub depth: u64,
    pub stuck: u64,
    pub failed_retryable: u64,
    pub level: HealthLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostCheck {
    pub daily_spend_usd: f64,
    pub budget_usd: Option<f64>,
    pub paused: bool,
    pub level: HealthLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub ts: Timestamp,
    pub overall: HealthLevel,
    pub database: DatabaseCheck,
    pub breakers: BreakerCheck,
    pub workers: WorkerCheck,
    pub queue: QueueCheck,
    pub cost: CostCheck,
}

impl HealthSnapshot {
    /// Critical dominates; degraded next; healthy only when every subcheck is.
    pub fn roll_up(levels: [HealthLevel; 5]) -> HealthLevel {
        levels.into_iter().max().unwrap_or(HealthLevel::Healthy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roll_up_prefers_worst() {
        use HealthLevel::*;
        assert_eq!(HealthSnapshot::roll_up([Healthy; 5]), Healthy);
        assert_eq!(
            HealthSnapshot::roll_up([Healthy, Degraded, Healthy, Healthy, Healthy]),
            Degraded
        );
        assert_eq!(
            HealthSnapshot::roll_up([Healthy, Degraded, Critical, Healthy, Healthy]),
            Critical
        );
    }
}
