//! blake3 digests for payload replay detection and the startup binary
//! integrity baseline.

use std::io::Read;
use std::path::Path;

/// Hex blake3 digest of a task payload.
pub fn payload_checksum(payload: &str) -> String {
    blake3::hash(payload.as_bytes()).to_hex().to_string()
}

/// Hex blake3 digest of a file's contents, streamed.
pub fn file_digest(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_checksum_is_deterministic() {
        assert_eq!(payload_checksum("write foo()"), payload_checksum("write foo()"));
        assert_ne!(payload_checksum("write foo()"), payload_checksum("write bar()"));
    }

    #[test]
    fn file_digest_matches_payload_digest() {
        let dir = std::env::temp_dir().join("triad_checksum_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("payload.txt");
        std::fs::write(&path, "write foo()").unwrap();
        assert_eq!(file_digest(&path).unwrap(), payload_checksum("write foo()"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
