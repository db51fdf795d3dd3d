//! Boot-time configuration.
//!
//! One YAML file, deserialized into a typed tree with serde defaults, then
//! overlaid with environment variables mirroring the YAML keys, then
//! validated. The resulting `Config` is immutable and threaded through the
//! kernel by handle; nothing re-reads configuration after boot.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use triad_core::constants::{
    BREAKER_COOLDOWN_SECS, BREAKER_FAILURE_THRESHOLD, CONSENSUS_APPROVAL_THRESHOLD,
    CONSENSUS_MIN_CONFIDENCE, CONSENSUS_REJECT_CONFIDENCE, CONSENSUS_TIMEOUT_SECS,
    COST_MARGIN_PCT, COST_RESERVE_USD, DELEGATE_MAX_CONCURRENT, DELEGATE_TIMEOUT_SECS,
    ESCALATE_HIGH_AFTER_SECS, ESCALATE_LOW_AFTER_SECS, ESCALATE_MEDIUM_AFTER_SECS,
    HEALING_INTERVAL_SECS, LOCK_BACKOFF_INITIAL_SECS, LOCK_BACKOFF_MAX_SECS,
    LOCK_DEADLOCK_WARN_SECS, LOCK_STALE_TIMEOUT_SECS, SQLITE_MAX_RETRIES,
    SQLITE_RETRY_DELAY_MS,
};
use triad_core::TriadError;

// ── Per-model settings ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// HTTP endpoint the delegate adapter posts to.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_delegate_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: None,
            timeout_seconds: DELEGATE_TIMEOUT_SECS,
            max_concurrent: DELEGATE_MAX_CONCURRENT,
        }
    }
}

// ── Cost limits ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenRates {
    #[serde(default)]
    pub input: f64,
    #[serde(default)]
    pub output: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostLimits {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub daily_budget_usd: f64,
    #[serde(default = "default_margin_pct")]
    pub margin_pct: f64,
    #[serde(default = "default_reserve_usd")]
    pub reserve_usd: f64,
    /// USD per 1000 tokens, keyed by model nickname.
    #[serde(default)]
    pub per_1k_tokens: BTreeMap<String, TokenRates>,
}

impl Default for CostLimits {
    fn default() -> Self {
        Self {
            enabled: false,
            daily_budget_usd: 0.0,
            margin_pct: COST_MARGIN_PCT,
            reserve_usd: COST_RESERVE_USD,
            per_1k_tokens: BTreeMap::new(),
        }
    }
}

// ── Consensus ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    #[serde(default = "default_approval_threshold")]
    pub approval_threshold: u32,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_reject_confidence")]
    pub reject_confidence: f64,
    #[serde(default = "default_consensus_timeout")]
    pub timeout_seconds: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            approval_threshold: CONSENSUS_APPROVAL_THRESHOLD,
            min_confidence: CONSENSUS_MIN_CONFIDENCE,
            reject_confidence: CONSENSUS_REJECT_CONFIDENCE,
            timeout_seconds: CONSENSUS_TIMEOUT_SECS,
        }
    }
}

// ── Priority escalation ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    #[serde(default = "default_low_after")]
    pub low_after_seconds: i64,
    #[serde(default = "default_medium_after")]
    pub medium_after_seconds: i64,
    #[serde(default = "default_high_after")]
    pub high_after_seconds: i64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            low_after_seconds: ESCALATE_LOW_AFTER_SECS,
            medium_after_seconds: ESCALATE_MEDIUM_AFTER_SECS,
            high_after_seconds: ESCALATE_HIGH_AFTER_SECS,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriorityConfig {
    #[serde(default)]
    pub escalation: EscalationConfig,
}

// ── Locks ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocksConfig {
    #[serde(default = "default_backoff_initial")]
    pub backoff_initial: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max: u64,
    #[serde(default = "default_lock_stale")]
    pub stale_timeout_seconds: i64,
    #[serde(default = "default_true")]
    pub auto_release_stale: bool,
    #[serde(default = "default_deadlock_warn")]
    pub deadlock_warn_seconds: i64,
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            backoff_initial: LOCK_BACKOFF_INITIAL_SECS,
            backoff_max: LOCK_BACKOFF_MAX_SECS,
            stale_timeout_seconds: LOCK_STALE_TIMEOUT_SECS,
            auto_release_stale: true,
            deadlock_warn_seconds: LOCK_DEADLOCK_WARN_SECS,
        }
    }
}

// ── Store / healing / breakers ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteConfig {
    #[serde(default = "default_sqlite_retries")]
    pub max_retries: u32,
    /// Initial retry delay in milliseconds.
    #[serde(default = "default_sqlite_delay")]
    pub retry_delay: u64,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            max_retries: SQLITE_MAX_RETRIES,
            retry_delay: SQLITE_RETRY_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingConfig {
    #[serde(default = "default_healing_interval")]
    pub interval_seconds: u64,
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            interval_seconds: HEALING_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown")]
    pub cooldown_seconds: i64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: BREAKER_FAILURE_THRESHOLD,
            cooldown_seconds: BREAKER_COOLDOWN_SECS,
        }
    }
}

// ── Config root ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub models: BTreeMap<String, ModelConfig>,
    /// review_type → model roster. Falls back to the built-in default map
    /// for review types not listed here.
    #[serde(default)]
    pub routing: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub cost_limits: CostLimits,
    #[serde(default)]
    pub consensus: ConsensusConfig,
    #[serde(default)]
    pub priority: PriorityConfig,
    #[serde(default)]
    pub locks: LocksConfig,
    #[serde(default)]
    pub sqlite: SqliteConfig,
    #[serde(default)]
    pub healing: HealingConfig,
    #[serde(default)]
    pub breakers: BreakerConfig,
}

impl Config {
    /// Load from `path` (YAML), apply environment overrides, validate.
    pub fn load(path: &Path) -> Result<Self, TriadError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| TriadError::Config(format!("reading {}: {e}", path.display())))?;
        let mut cfg: Config = serde_yaml::from_str(&text)
            .map_err(|e| TriadError::Config(format!("parsing {}: {e}", path.display())))?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Resolve the configuration file location: `CONFIG_FILE` env or the
    /// given fallback. Missing file + no env ⇒ defaults.
    pub fn load_or_default(fallback: Option<&Path>) -> Result<Self, TriadError> {
        let env_path = std::env::var("CONFIG_FILE").ok().map(PathBuf::from);
        let path = env_path.or_else(|| fallback.map(Path::to_path_buf));
        match path {
            Some(p) if p.exists() => Self::load(&p),
            Some(p) => {
                warn!(path = %p.display(), "config file not found, using defaults");
                let mut cfg = Config::default();
                cfg.apply_env_overrides();
                cfg.validate()?;
                Ok(cfg)
            }
            None => {
                let mut cfg = Config::default();
                cfg.apply_env_overrides();
                cfg.validate()?;
                Ok(cfg)
            }
        }
    }

    /// Environment variables mirror the YAML keys, uppercased with
    /// underscores (e.g. `CONSENSUS_TIMEOUT_SECONDS`,
    /// `COST_LIMITS_DAILY_BUDGET_USD`). Only scalar leaves are mirrored.
    fn apply_env_overrides(&mut self) {
        env_override("CONSENSUS_APPROVAL_THRESHOLD", &mut self.consensus.approval_threshold);
        env_override("CONSENSUS_MIN_CONFIDENCE", &mut self.consensus.min_confidence);
        env_override("CONSENSUS_REJECT_CONFIDENCE", &mut self.consensus.reject_confidence);
        env_override("CONSENSUS_TIMEOUT_SECONDS", &mut self.consensus.timeout_seconds);

        env_override("COST_LIMITS_ENABLED", &mut self.cost_limits.enabled);
        env_override("COST_LIMITS_DAILY_BUDGET_USD", &mut self.cost_limits.daily_budget_usd);
        env_override("COST_LIMITS_MARGIN_PCT", &mut self.cost_limits.margin_pct);
        env_override("COST_LIMITS_RESERVE_USD", &mut self.cost_limits.reserve_usd);

        env_override("PRIORITY_ESCALATION_LOW_AFTER_SECONDS", &mut self.priority.escalation.low_after_seconds);
        env_override("PRIORITY_ESCALATION_MEDIUM_AFTER_SECONDS", &mut self.priority.escalation.medium_after_seconds);
        env_override("PRIORITY_ESCALATION_HIGH_AFTER_SECONDS", &mut self.priority.escalation.high_after_seconds);

        env_override("LOCKS_BACKOFF_INITIAL", &mut self.locks.backoff_initial);
        env_override("LOCKS_BACKOFF_MAX", &mut self.locks.backoff_max);
        env_override("LOCKS_STALE_TIMEOUT_SECONDS", &mut self.locks.stale_timeout_seconds);
        env_override("LOCKS_AUTO_RELEASE_STALE", &mut self.locks.auto_release_stale);
        env_override("LOCKS_DEADLOCK_WARN_SECONDS", &mut self.locks.deadlock_warn_seconds);

        env_override("SQLITE_MAX_RETRIES", &mut self.sqlite.max_retries);
        env_override("SQLITE_RETRY_DELAY", &mut self.sqlite.retry_delay);

        env_override("HEALING_INTERVAL_SECONDS", &mut self.healing.interval_seconds);

        env_override("BREAKERS_FAILURE_THRESHOLD", &mut self.breakers.failure_threshold);
        env_override("BREAKERS_COOLDOWN_SECONDS", &mut self.breakers.cooldown_seconds);
    }

    pub fn validate(&self) -> Result<(), TriadError> {
        if self.consensus.approval_threshold == 0 {
            return Err(TriadError::Config(
                "consensus.approval_threshold must be >= 1".into(),
            ));
        }
        for (name, v) in [
            ("consensus.min_confidence", self.consensus.min_confidence),
            ("consensus.reject_confidence", self.consensus.reject_confidence),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(TriadError::Config(format!("{name} must be in [0,1], got {v}")));
            }
        }
        if self.cost_limits.enabled {
            if self.cost_limits.daily_budget_usd <= 0.0 {
                return Err(TriadError::Config(
                    "cost_limits.daily_budget_usd must be > 0 when enabled".into(),
                ));
            }
            if !(0.0..1.0).contains(&self.cost_limits.margin_pct) {
                return Err(TriadError::Config(
                    "cost_limits.margin_pct must be in [0,1)".into(),
                ));
            }
            if self.cost_limits.reserve_usd < 0.0 {
                return Err(TriadError::Config(
                    "cost_limits.reserve_usd must be >= 0".into(),
                ));
            }
        }
        let enabled = self.enabled_models();
        if !self.models.is_empty() && enabled.len() < 2 {
            return Err(TriadError::Config(format!(
                "at least 2 enabled delegates required, got {}",
                enabled.len()
            )));
        }
        for (review_type, roster) in &self.routing {
            if roster.is_empty() {
                return Err(TriadError::Config(format!(
                    "routing.{review_type} must name at least one model"
                )));
            }
            if !self.models.is_empty() {
                for m in roster {
                    if !enabled.contains(m) {
                        return Err(TriadError::Config(format!(
                            "routing.{review_type} references disabled or unknown model {m}"
                        )));
                    }
                }
            }
        }
        if self.locks.backoff_initial == 0 || self.locks.backoff_max < self.locks.backoff_initial {
            return Err(TriadError::Config(
                "locks backoff bounds must satisfy 0 < initial <= max".into(),
            ));
        }
        Ok(())
    }

    pub fn enabled_models(&self) -> Vec<String> {
        self.models
            .iter()
            .filter(|(_, m)| m.enabled)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Resolve the state directory: `STATE_DIR` env wins, then the CLI value.
pub fn resolve_state_dir(cli: &Path) -> PathBuf {
    match std::env::var("STATE_DIR") {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v),
        _ => cli.to_path_buf(),
    }
}

fn env_override<T: std::str::FromStr>(key: &str, slot: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse::<T>() {
            Ok(v) => *slot = v,
            Err(_) => warn!(key, value = %raw, "ignoring unparseable env override"),
        }
    }
}

// serde default helpers
fn default_true() -> bool { true }
fn default_delegate_timeout() -> u64 { DELEGATE_TIMEOUT_SECS }
fn default_max_concurrent() -> u32 { DELEGATE_MAX_CONCURRENT }
fn default_margin_pct() -> f64 { COST_MARGIN_PCT }
fn default_reserve_usd() -> f64 { COST_RESERVE_USD }
fn default_approval_threshold() -> u32 { CONSENSUS_APPROVAL_THRESHOLD }
fn default_min_confidence() -> f64 { CONSENSUS_MIN_CONFIDENCE }
fn default_reject_confidence() -> f64 { CONSENSUS_REJECT_CONFIDENCE }
fn default_consensus_timeout() -> u64 { CONSENSUS_TIMEOUT_SECS }
fn default_low_after() -> i64 { ESCALATE_LOW_AFTER_SECS }
fn default_medium_after() -> i64 { ESCALATE_MEDIUM_AFTER_SECS }
fn default_high_after() -> i64 { ESCALATE_HIGH_AFTER_SECS }
fn default_backoff_initial() -> u64 { LOCK_BACKOFF_INITIAL_SECS }
fn default_backoff_max() -> u64 { LOCK_BACKOFF_MAX_SECS }
fn default_lock_stale() -> i64 { LOCK_STALE_TIMEOUT_SECS }
fn default_deadlock_warn() -> i64 { LOCK_DEADLOCK_WARN_SECS }
fn default_sqlite_retries() -> u32 { SQLITE_MAX_RETRIES }
fn default_sqlite_delay() -> u64 { SQLITE_RETRY_DELAY_MS }
fn default_healing_interval() -> u64 { HEALING_INTERVAL_SECS }
fn default_failure_threshold() -> u32 { BREAKER_FAILURE_THRESHOLD }
fn default_cooldown() -> i64 { BREAKER_COOLDOWN_SECS }

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
models:
  claude: { endpoint: "http://127.0.0.1:9001/review", timeout_seconds: 90 }
  codex:  { endpoint: "http://127.0.0.1:9002/review" }
  gemini: { endpoint: "http://127.0.0.1:9003/review", enabled: true }
routing:
  SECURITY: [claude, codex]
cost_limits:
  enabled: true
  daily_budget_usd: 10.0
consensus:
  approval_threshold: 2
"#;

    #[test]
    fn parses_sample_and_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("triad.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(SAMPLE.as_bytes()).unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.models["claude"].timeout_seconds, 90);
        assert_eq!(cfg.models["codex"].timeout_seconds, DELEGATE_TIMEOUT_SECS);
        assert_eq!(cfg.consensus.min_confidence, CONSENSUS_MIN_CONFIDENCE);
        assert_eq!(cfg.cost_limits.margin_pct, COST_MARGIN_PCT);
        assert_eq!(cfg.routing["SECURITY"], vec!["claude", "codex"]);
        assert_eq!(cfg.enabled_models(), vec!["claude", "codex", "gemini"]);
    }

    #[test]
    fn rejects_budget_without_amount() {
        let cfg: Config = serde_yaml::from_str("cost_limits: { enabled: true }").unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_roster_naming_unknown_model() {
        let cfg: Config = serde_yaml::from_str(
            r#"
models:
  claude: {}
  codex: {}
routing:
  SECURITY: [claude, mystery]
"#,
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_single_delegate_roster() {
        let cfg: Config = serde_yaml::from_str(
            r#"
models:
  claude: {}
  codex: { enabled: false }
"#,
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }
}
