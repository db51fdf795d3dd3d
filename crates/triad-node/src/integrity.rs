//! Startup binary-integrity baseline.
//!
//! On first boot the node hashes its own executable into
//! `<state_dir>/binary-hashes.baseline` (key=value lines, blake3 hex).
//! Later boots compare; a mismatch is an integrity violation and the node
//! refuses to start unless the operator explicitly accepts the change,
//! which rewrites the baseline.

use std::path::Path;

use tracing::{info, warn};

use triad_core::checksum::file_digest;
use triad_core::constants::BASELINE_FILE;
use triad_core::event::{EventKind, NewEvent};
use triad_core::types::TraceId;
use triad_core::TriadError;
use triad_store::Store;

pub fn verify_binary_baseline(
    state_dir: &Path,
    store: &Store,
    accept_changes: bool,
    trace: &TraceId,
) -> Result<(), TriadError> {
    let exe = std::env::current_exe()?;
    let name = exe
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "triad-node".to_string());
    let digest = file_digest(&exe)?;
    let baseline_path = state_dir.join(BASELINE_FILE);

    let recorded = std::fs::read_to_string(&baseline_path)
        .ok()
        .and_then(|text| {
            text.lines()
                .find_map(|line| line.strip_prefix(&format!("{name}=")).map(str::to_string))
        });

    match recorded {
        None => {
            std::fs::write(&baseline_path, format!("{name}={digest}\n"))?;
            info!(binary = %name, "recorded binary integrity baseline");
            Ok(())
        }
        Some(expected) if expected == digest => Ok(()),
        Some(expected) => {
            let ev = NewEvent::system(EventKind::IntegrityViolation, trace.clone()).with_payload(
                serde_json::json!({
                    "binary": name,
                    "expected": expected,
                    "actual": digest,
                    "accepted": accept_changes,
                }),
            );
            let _ = store.append_event(&ev, chrono::Utc::now().timestamp());

            if accept_changes {
                std::fs::write(&baseline_path, format!("{name}={digest}\n"))?;
                warn!(binary = %name, "binary changed; baseline rewritten by operator request");
                Ok(())
            } else {
                Err(TriadError::Integrity(format!(
                    "binary {name} does not match recorded baseline"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_boot_writes_then_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let trace = TraceId::generate();

        verify_binary_baseline(dir.path(), &store, false, &trace).unwrap();
        assert!(dir.path().join(BASELINE_FILE).exists());
        // Second boot with the same binary passes.
        verify_binary_baseline(dir.path(), &store, false, &trace).unwrap();
    }

    #[test]
    fn tampered_baseline_refuses_boot_unless_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let trace = TraceId::generate();

        verify_binary_baseline(dir.path(), &store, false, &trace).unwrap();

        // Corrupt the recorded digest.
        let baseline = dir.path().join(BASELINE_FILE);
        let text = std::fs::read_to_string(&baseline).unwrap();
        let (name, _) = text.trim().split_once('=').unwrap();
        std::fs::write(&baseline, format!("{name}=deadbeef\n")).unwrap();

        assert!(matches!(
            verify_binary_baseline(dir.path(), &store, false, &trace),
            Err(TriadError::Integrity(_))
        ));

        // Operator accepts; baseline is rewritten and boot proceeds.
        verify_binary_baseline(dir.path(), &store, true, &trace).unwrap();
        verify_binary_baseline(dir.path(), &store, false, &trace).unwrap();

        // The violation left an audit event.
        let events = store.events_after(0, 100).unwrap();
        assert!(events.iter().any(|e| e.kind == "INTEGRITY_VIOLATION"));
    }
}
