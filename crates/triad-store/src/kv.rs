//! The `state` key-value table, including the global pause flag.
//!
//! The pause flag gates new claims only; running tasks are never killed by a
//! pause. Both the operator (via RPC) and the cost breaker set it.

use rusqlite::{params, OptionalExtension};

use triad_core::constants::{KV_PAUSED, KV_PAUSE_REASON};
use triad_core::TriadError;

use crate::db::Store;

/// Rows are keyed (file_path, key); kernel-global flags use this sentinel.
const KERNEL_SCOPE: &str = "kernel";

impl Store {
    pub fn kv_set(&self, scope: &str, key: &str, value: &str) -> Result<(), TriadError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO state (file_path, key, value) VALUES (?1, ?2, ?3) \
                 ON CONFLICT (file_path, key) DO UPDATE SET value = excluded.value",
                params![scope, key, value],
            )?;
            Ok(())
        })
    }

    pub fn kv_get(&self, scope: &str, key: &str) -> Result<Option<String>, TriadError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM state WHERE file_path = ?1 AND key = ?2",
                params![scope, key],
                |row| row.get(0),
            )
            .optional()
        })
    }

    pub fn kv_delete(&self, scope: &str, key: &str) -> Result<(), TriadError> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM state WHERE file_path = ?1 AND key = ?2",
                params![scope, key],
            )?;
            Ok(())
        })
    }

    // ── Pause flag ───────────────────────────────────────────────────────────

    pub fn set_paused(&self, reason: &str) -> Result<(), TriadError> {
        self.kv_set(KERNEL_SCOPE, KV_PAUSED, "1")?;
        self.kv_set(KERNEL_SCOPE, KV_PAUSE_REASON, reason)
    }

    pub fn clear_paused(&self) -> Result<(), TriadError> {
        self.kv_delete(KERNEL_SCOPE, KV_PAUSED)?;
        self.kv_delete(KERNEL_SCOPE, KV_PAUSE_REASON)
    }

    pub fn is_paused(&self) -> Result<bool, TriadError> {
        Ok(self.kv_get(KERNEL_SCOPE, KV_PAUSED)?.is_some())
    }

    pub fn pause_reason(&self) -> Result<Option<String>, TriadError> {
        self.kv_get(KERNEL_SCOPE, KV_PAUSE_REASON)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        assert!(!store.is_paused().unwrap());

        store.set_paused("budget_guardrail").unwrap();
        assert!(store.is_paused().unwrap());
        assert_eq!(store.pause_reason().unwrap().as_deref(), Some("budget_guardrail"));

        store.clear_paused().unwrap();
        assert!(!store.is_paused().unwrap());
        assert!(store.pause_reason().unwrap().is_none());
    }

    #[test]
    fn kv_upsert_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.kv_set("costs/totals.json", "version", "1").unwrap();
        store.kv_set("costs/totals.json", "version", "2").unwrap();
        assert_eq!(
            store.kv_get("costs/totals.json", "version").unwrap().as_deref(),
            Some("2")
        );
    }
}
