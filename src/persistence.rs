/// Persistence layer: restartable state snapshots.
///
/// The entire [`MemoryState`] is one serialized blob. Saves are atomic:
/// serialize, write to a temp file, fsync, rename over the previous
/// snapshot. Readers therefore see the pre-write or post-write state and
/// never a partial one.
///
/// Each snapshot carries a CRC32 checksum header so corruption is detected
/// on load rather than deserialized into nonsense. A corrupt snapshot is
/// never deleted: it is moved aside for offline inspection, a marker line
/// is appended to `corruption.log`, and the caller starts fresh.
///
/// # Layout
///
/// ```text
/// <state dir>/
/// ├── state.json                 # checksum line + JSON body
/// ├── state.json.tmp             # in-flight write (transient)
/// ├── state.corrupt-<ms>.json    # quarantined corrupt blobs
/// └── corruption.log             # one line per quarantine
/// ```
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::error::{MemoryError, MemoryResult};
use crate::state::{MemoryState, FORMAT_VERSION};

/// Primary snapshot file name.
pub const STATE_FILE: &str = "state.json";

/// Marker file listing quarantined blobs.
pub const CORRUPTION_LOG: &str = "corruption.log";

const CHECKSUM_PREFIX: &str = "crc32:";

/// Serialize a state into the on-disk snapshot format.
///
/// Kept separate from the disk write so the engine can serialize under its
/// writer lock and flush outside it.
pub fn encode(state: &MemoryState) -> MemoryResult<Vec<u8>> {
    let body = serde_json::to_vec(state)?;
    let checksum = crc32fast::hash(&body);
    let mut blob = format!("{CHECKSUM_PREFIX}{checksum:08x}\n").into_bytes();
    blob.extend_from_slice(&body);
    Ok(blob)
}

/// Write an encoded snapshot atomically into the state directory.
pub async fn write_blob(dir: &Path, blob: &[u8]) -> MemoryResult<()> {
    fs::create_dir_all(dir)
        .await
        .map_err(|e| MemoryError::StorageError(format!("failed to create state dir: {e}")))?;

    let final_path = dir.join(STATE_FILE);
    let temp_path = dir.join(format!("{STATE_FILE}.tmp"));

    let mut file = fs::File::create(&temp_path)
        .await
        .map_err(|e| MemoryError::StorageError(format!("failed to create snapshot temp: {e}")))?;
    file.write_all(blob)
        .await
        .map_err(|e| MemoryError::StorageError(format!("failed to write snapshot: {e}")))?;
    file.sync_data()
        .await
        .map_err(|e| MemoryError::StorageError(format!("failed to sync snapshot: {e}")))?;
    drop(file);

    fs::rename(&temp_path, &final_path)
        .await
        .map_err(|e| MemoryError::StorageError(format!("failed to rename snapshot: {e}")))?;
    Ok(())
}

/// Serialize and atomically persist a state.
pub async fn save(state: &MemoryState, dir: &Path) -> MemoryResult<()> {
    let blob = encode(state)?;
    write_blob(dir, &blob).await?;
    info!(bytes = blob.len(), dir = %dir.display(), "snapshot saved");
    Ok(())
}

/// Load the snapshot from the state directory.
///
/// Returns `Ok(None)` when no snapshot exists, and also when the snapshot
/// is corrupt; in the corrupt case the blob is quarantined first so the
/// caller can safely initialize a fresh state. A snapshot with an unknown
/// format version is an error, not corruption: it is left untouched for a
/// newer engine.
pub async fn load(dir: &Path, now_ms: u64) -> MemoryResult<Option<MemoryState>> {
    let path = dir.join(STATE_FILE);
    let bytes = match fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(MemoryError::StorageError(format!(
                "failed to read snapshot: {e}"
            )))
        }
    };

    match decode(&bytes) {
        Ok(state) => Ok(Some(state)),
        Err(MemoryError::StorageError(reason)) if reason.starts_with("unsupported format") => {
            Err(MemoryError::StorageError(reason))
        }
        Err(e) => {
            let quarantined = quarantine(dir, &path, now_ms, &e.to_string()).await?;
            warn!(
                quarantined = %quarantined.display(),
                error = %e,
                "snapshot corrupt, starting fresh"
            );
            Ok(None)
        }
    }
}

fn decode(bytes: &[u8]) -> MemoryResult<MemoryState> {
    let newline = bytes
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| MemoryError::StorageError("snapshot missing checksum header".to_string()))?;
    let header = std::str::from_utf8(&bytes[..newline])
        .map_err(|_| MemoryError::StorageError("snapshot header not UTF-8".to_string()))?;
    let expected = header
        .strip_prefix(CHECKSUM_PREFIX)
        .ok_or_else(|| MemoryError::StorageError("snapshot missing checksum prefix".to_string()))?;
    let body = &bytes[newline + 1..];
    let actual = format!("{:08x}", crc32fast::hash(body));
    if expected != actual {
        return Err(MemoryError::StorageError(format!(
            "snapshot checksum mismatch (expected {expected}, computed {actual})"
        )));
    }
    // Check the version before committing to the full schema, so a newer
    // format is rejected rather than quarantined as corruption.
    let raw: serde_json::Value = serde_json::from_slice(body)?;
    let version = raw
        .get("formatVersion")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| MemoryError::StorageError("snapshot missing formatVersion".to_string()))?;
    if version != FORMAT_VERSION as u64 {
        return Err(MemoryError::StorageError(format!(
            "unsupported format version {version} (engine supports {FORMAT_VERSION})"
        )));
    }
    let state: MemoryState = serde_json::from_value(raw)?;
    Ok(state)
}

/// Move a corrupt blob aside and record it in the corruption log.
async fn quarantine(
    dir: &Path,
    path: &Path,
    now_ms: u64,
    reason: &str,
) -> MemoryResult<PathBuf> {
    let quarantine_path = dir.join(format!("state.corrupt-{now_ms}.json"));
    fs::rename(path, &quarantine_path)
        .await
        .map_err(|e| MemoryError::StorageError(format!("failed to quarantine snapshot: {e}")))?;

    let log_path = dir.join(CORRUPTION_LOG);
    let line = format!(
        "{now_ms} quarantined {} ({reason})\n",
        quarantine_path.display()
    );
    let mut log = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .await
        .map_err(|e| MemoryError::StorageError(format!("failed to open corruption log: {e}")))?;
    log.write_all(line.as_bytes())
        .await
        .map_err(|e| MemoryError::StorageError(format!("failed to write corruption log: {e}")))?;
    Ok(quarantine_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ItemType, Ttl};
    use tempfile::TempDir;

    fn sample_state() -> MemoryState {
        let mut state = MemoryState::new(1_000);
        state
            .graph
            .create_item(
                ItemType::new(ItemType::FACT).unwrap(),
                "persisted fact",
                vec!["tag".to_string()],
                0.8,
                Ttl::Days90,
                None,
                1_000,
            )
            .unwrap();
        state.note_changes(1);
        state
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let state = sample_state();
        save(&state, dir.path()).await.unwrap();

        let loaded = load(dir.path(), 2_000).await.unwrap().unwrap();
        assert_eq!(loaded.id, state.id);
        assert_eq!(loaded.graph.item_count(), 1);
        assert_eq!(loaded.policy.version_count(), 3);
        // Canonical comparison of the whole state via re-encoding
        assert_eq!(encode(&loaded).unwrap(), encode(&state).unwrap());
    }

    #[tokio::test]
    async fn test_load_missing_returns_none() {
        let dir = TempDir::new().unwrap();
        assert!(load(dir.path(), 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_quarantined() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(STATE_FILE), b"crc32:deadbeef\n{not json")
            .await
            .unwrap();

        let loaded = load(dir.path(), 5_000).await.unwrap();
        assert!(loaded.is_none());

        // The corrupt blob was preserved, not deleted
        let quarantined = dir.path().join("state.corrupt-5000.json");
        assert!(quarantined.exists());
        assert!(!dir.path().join(STATE_FILE).exists());

        let log = std::fs::read_to_string(dir.path().join(CORRUPTION_LOG)).unwrap();
        assert!(log.contains("state.corrupt-5000.json"));
    }

    #[tokio::test]
    async fn test_truncated_snapshot_is_corruption() {
        let dir = TempDir::new().unwrap();
        let state = sample_state();
        save(&state, dir.path()).await.unwrap();

        // Chop the file in half: checksum no longer matches
        let path = dir.path().join(STATE_FILE);
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        assert!(load(dir.path(), 9_000).await.unwrap().is_none());
        assert!(dir.path().join("state.corrupt-9000.json").exists());
    }

    #[tokio::test]
    async fn test_unknown_format_version_rejected_not_quarantined() {
        let dir = TempDir::new().unwrap();
        let mut state = sample_state();
        state.format_version = 99;
        save(&state, dir.path()).await.unwrap();

        let err = load(dir.path(), 0).await;
        assert!(err.is_err());
        // The blob stays in place for a newer engine
        assert!(dir.path().join(STATE_FILE).exists());
    }

    #[tokio::test]
    async fn test_save_overwrites_atomically() {
        let dir = TempDir::new().unwrap();
        let first = sample_state();
        save(&first, dir.path()).await.unwrap();
        let second = sample_state();
        save(&second, dir.path()).await.unwrap();

        let loaded = load(dir.path(), 0).await.unwrap().unwrap();
        assert_eq!(loaded.id, second.id);
        // No leftover temp file
        assert!(!dir.path().join(format!("{STATE_FILE}.tmp")).exists());
    }
}
