//! Disk plumbing for task inputs and outputs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use wuild_core::{CompressionInfo, WuildError, WuildResult};

/// How many times an atomic rename is retried, and how long between
/// attempts. Tolerates transient file locking (antivirus, Windows).
const RENAME_ATTEMPTS: u32 = 50;
const RENAME_RETRY_DELAY: Duration = Duration::from_millis(100);

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "out".to_string());
    name.push_str(&format!(".tmp{}", std::process::id()));
    path.with_file_name(name)
}

/// Write `data` next to `path` and atomically rename it into place, with
/// bounded retry on the rename.
pub async fn write_file_atomic(path: &Path, data: &[u8]) -> WuildResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let staging = temp_sibling(path);
    tokio::fs::write(&staging, data).await?;

    let mut last_error = None;
    for attempt in 0..RENAME_ATTEMPTS {
        match tokio::fs::rename(&staging, path).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                if attempt + 1 < RENAME_ATTEMPTS {
                    debug!(
                        "rename {} -> {} failed (attempt {}): {e}",
                        staging.display(),
                        path.display(),
                        attempt + 1
                    );
                    tokio::time::sleep(RENAME_RETRY_DELAY).await;
                }
                last_error = Some(e);
            }
        }
    }
    let _ = tokio::fs::remove_file(&staging).await;
    Err(WuildError::Io(last_error.expect("attempts > 0")))
}

/// Write a payload that is compressed per `compression`, decompressing it
/// onto disk.
pub async fn write_compressed_payload(
    path: &Path,
    payload: &[u8],
    compression: &CompressionInfo,
) -> WuildResult<()> {
    let plain = compression.decompress(payload)?;
    write_file_atomic(path, &plain).await
}

/// Read a file and compress its contents per `compression`.
pub async fn read_compressed_payload(
    path: &Path,
    compression: &CompressionInfo,
) -> WuildResult<Vec<u8>> {
    let plain = tokio::fs::read(path).await?;
    compression.compress(&plain)
}
