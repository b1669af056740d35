//! C-Store: typed certificate/key artifact I/O
//!
//! Reads are uninterpreted bytes. Writes are atomic against concurrent
//! readers (write to a `.tmp` sibling, then rename over the destination) and
//! carry permission bits as restrictive as the platform allows.

use std::path::Path;

use crate::error::{AgentError, Result};

/// Mode bits used for certificate (and CRL) files
pub const CERT_MODE: u32 = 0o644;
/// Mode bits used for private key files
pub const KEY_MODE: u32 = 0o600;

/// Read the raw bytes at `path`. Returns `AgentError::Io` on any failure,
/// including not-found.
pub fn read(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| {
        AgentError::Io(std::io::Error::new(
            e.kind(),
            format!("reading {}: {e}", path.display()),
        ))
    })
}

/// Write `bytes` to `path` with certificate permissions (0644), atomically.
pub fn write_cert(path: &Path, bytes: &[u8]) -> Result<()> {
    write_atomic(path, bytes, CERT_MODE)
}

/// Write `bytes` to `path` with key permissions (0600), atomically.
pub fn write_key(path: &Path, bytes: &[u8]) -> Result<()> {
    write_atomic(path, bytes, KEY_MODE)
}

fn write_atomic(path: &Path, bytes: &[u8], mode: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = tmp_sibling(path);
    std::fs::write(&tmp_path, bytes)?;
    set_permissions(&tmp_path, mode);
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

fn tmp_sibling(path: &Path) -> std::path::PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    std::path::PathBuf::from(os)
}

#[cfg(unix)]
fn set_permissions(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)) {
        tracing::warn!(path = %path.display(), error = %e, "failed to set file permissions");
    }
}

#[cfg(not(unix))]
fn set_permissions(path: &Path, _mode: u32) {
    tracing::warn!(
        path = %path.display(),
        "platform cannot enforce unix permission bits; continuing"
    );
}

/// Path of the backup sidecar for `path`
pub fn backup_path(path: &Path) -> std::path::PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".backup");
    std::path::PathBuf::from(os)
}

/// Copy `path` to `path.backup` before a mutating operation.
pub fn backup(path: &Path) -> Result<()> {
    std::fs::copy(path, backup_path(path))?;
    Ok(())
}

/// Restore `path.backup` over `path` on rollback.
pub fn restore(path: &Path) -> Result<()> {
    std::fs::copy(backup_path(path), path)?;
    Ok(())
}

/// Remove the backup sidecar for `path`, if present.
pub fn discard_backup(path: &Path) -> Result<()> {
    let backup = backup_path(path);
    match std::fs::remove_file(&backup) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_then_read_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/cert.pem");
        write_cert(&path, b"hello").unwrap();
        assert_eq!(read(&path).unwrap(), b"hello");
    }

    #[test]
    fn test_write_cert_is_atomic_no_tmp_left_behind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cert.pem");
        write_cert(&path, b"one").unwrap();
        write_cert(&path, b"two").unwrap();
        assert!(!tmp_sibling(&path).exists());
        assert_eq!(read(&path).unwrap(), b"two");
    }

    #[test]
    fn test_backup_and_restore() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cert.pem");
        write_cert(&path, b"original").unwrap();
        backup(&path).unwrap();
        write_cert(&path, b"mutated").unwrap();
        restore(&path).unwrap();
        assert_eq!(read(&path).unwrap(), b"original");
    }

    #[test]
    fn test_discard_backup_missing_is_ok() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cert.pem");
        assert!(discard_backup(&path).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_key_mode_is_0600() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = dir.path().join("key.pem");
        write_key(&path, b"secret").unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, KEY_MODE);
    }
}
