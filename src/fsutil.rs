//! File helpers shared by the components that persist state

use crate::error::{RelayError, RelayResult};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Ensure a directory exists, creating it if necessary
pub async fn ensure_directory_exists(path: &Path) -> RelayResult<()> {
    if !path.exists() {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| RelayError::Config(format!("Failed to create directory {:?}: {}", path, e)))?;
        info!("Created directory: {:?}", path);
    }
    Ok(())
}

/// Write a file atomically (temp file in the same directory, then rename)
/// with the given permissions.
pub async fn write_atomic(path: &Path, content: &[u8], permissions: u32) -> RelayResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_directory_exists(parent).await?;
        }
    }

    let tmp = temp_path(path);
    tokio::fs::write(&tmp, content)
        .await
        .map_err(|e| RelayError::Config(format!("Failed to write {:?}: {}", tmp, e)))?;

    let perms = std::fs::Permissions::from_mode(permissions);
    if let Err(e) = tokio::fs::set_permissions(&tmp, perms).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(RelayError::Config(format!("Failed to set permissions on {:?}: {}", tmp, e)));
    }

    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(RelayError::Config(format!("Failed to move {:?} into place: {}", path, e)));
    }

    debug!("Wrote {:?} with permissions {:o}", path, permissions);
    Ok(())
}

/// Read a file, mapping a missing file to `Ok(None)`
pub async fn read_optional(path: &Path) -> RelayResult<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Delete a file if it exists
pub async fn delete_if_exists(path: &Path) -> RelayResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!("Deleted file: {:?}", path);
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".tmp{}", std::process::id()));
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_atomic_sets_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("secret.key");

        write_atomic(&path, b"data", 0o600).await.unwrap();

        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        assert_eq!(std::fs::read(&path).unwrap(), b"data");

        // No temp file left behind
        let entries: Vec<_> = std::fs::read_dir(path.parent().unwrap()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_read_optional_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");

        assert!(read_optional(&path).await.unwrap().is_none());
        delete_if_exists(&path).await.unwrap();

        tokio::fs::write(&path, b"x").await.unwrap();
        assert_eq!(read_optional(&path).await.unwrap(), Some(b"x".to_vec()));
        delete_if_exists(&path).await.unwrap();
        assert!(!path.exists());
    }
}
