//! Atomic state-file persistence.
//!
//! Every mutable state file (`tasks.json`, `live-metrics.json`, the
//! governor snapshot) is rewritten via a temp file followed by an atomic
//! rename; the rename is the serialisation point. A crash can lose the
//! last unflushed mutation but never corrupts the file.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

use crate::domain::errors::{EngineError, EngineResult};

/// Serialise `value` as pretty JSON and atomically replace `path`.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> EngineResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes)
}

/// Atomically replace `path` with `bytes` (temp file + rename).
pub fn write_atomic(path: &Path, bytes: &[u8]) -> EngineResult<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| Path::new(".").to_path_buf(), Path::to_path_buf);
    std::fs::create_dir_all(&parent)?;

    let file_name = path
        .file_name()
        .ok_or_else(|| EngineError::State(format!("invalid state path: {}", path.display())))?;
    let tmp = parent.join(format!(
        ".{}.tmp.{}",
        file_name.to_string_lossy(),
        std::process::id()
    ));

    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Load a JSON state file, returning `None` when it does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> EngineResult<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => {
            let value = serde_json::from_slice(&bytes).map_err(|e| {
                EngineError::State(format!("corrupt state file {}: {e}", path.display()))
            })?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Append one JSON line to an append-only `.jsonl` file.
pub fn append_jsonl<T: Serialize>(path: &Path, value: &T) -> EngineResult<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(&line)?;
    Ok(())
}
