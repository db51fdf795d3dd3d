//! Database path validation.
//!
//! The database must live directly inside the configured state directory.
//! Symlinked files or parents, and any path that escapes the state directory
//! after canonicalization, are integrity errors: the store refuses to open
//! rather than follow the link.

use std::path::{Component, Path, PathBuf};

use triad_core::constants::DB_FILE_NAME;
use triad_core::TriadError;

/// Validate and return the database file path under `state_dir`.
pub fn validate_db_path(state_dir: &Path) -> Result<PathBuf, TriadError> {
    if state_dir
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(TriadError::Integrity(format!(
            "state directory {} contains path traversal",
            state_dir.display()
        )));
    }

    let canon_state = state_dir.canonicalize().map_err(|e| {
        TriadError::Integrity(format!(
            "cannot canonicalize state directory {}: {e}",
            state_dir.display()
        ))
    })?;

    let db_path = state_dir.join(DB_FILE_NAME);

    // The final component must not be a symlink. symlink_metadata does not
    // follow the link, which is the point.
    if let Ok(meta) = std::fs::symlink_metadata(&db_path) {
        if meta.file_type().is_symlink() {
            return Err(TriadError::Integrity(format!(
                "database path {} is a symlink",
                db_path.display()
            )));
        }
    }

    // Nor may the immediate parent.
    if let Some(parent) = db_path.parent() {
        if let Ok(meta) = std::fs::symlink_metadata(parent) {
            if meta.file_type().is_symlink() {
                return Err(TriadError::Integrity(format!(
                    "database parent directory {} is a symlink",
                    parent.display()
                )));
            }
        }
        let canon_parent = parent.canonicalize().map_err(|e| {
            TriadError::Integrity(format!(
                "cannot canonicalize {}: {e}",
                parent.display()
            ))
        })?;
        if !canon_parent.starts_with(&canon_state) {
            return Err(TriadError::Integrity(format!(
                "database path {} resolves outside the state directory",
                db_path.display()
            )));
        }
    }

    Ok(db_path)
}

/// Tighten permissions: 600 on the database file, 700 on the state dir.
#[cfg(unix)]
pub fn apply_permissions(state_dir: &Path, db_path: &Path) -> Result<(), TriadError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(state_dir, std::fs::Permissions::from_mode(0o700))?;
    if db_path.exists() {
        std::fs::set_permissions(db_path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn apply_permissions(_state_dir: &Path, _db_path: &Path) -> Result<(), TriadError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_state_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = validate_db_path(dir.path()).unwrap();
        assert!(path.ends_with(DB_FILE_NAME));
    }

    #[test]
    fn rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let sneaky = dir.path().join("..").join("elsewhere");
        assert!(matches!(
            validate_db_path(&sneaky),
            Err(TriadError::Integrity(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn rejects_symlinked_db_file() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let target = outside.path().join("victim.db");
        std::fs::write(&target, b"").unwrap();
        std::os::unix::fs::symlink(&target, dir.path().join(DB_FILE_NAME)).unwrap();
        assert!(matches!(
            validate_db_path(dir.path()),
            Err(TriadError::Integrity(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn rejects_symlinked_state_dir() {
        let real = tempfile::tempdir().unwrap();
        let holder = tempfile::tempdir().unwrap();
        let link = holder.path().join("state");
        std::os::unix::fs::symlink(real.path(), &link).unwrap();
        assert!(matches!(
            validate_db_path(&link),
            Err(TriadError::Integrity(_))
        ));
    }
}
