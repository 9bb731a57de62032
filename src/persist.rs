// =============================================================================
// Atomic JSON persistence helper
// =============================================================================
//
// Every persisted-state file in this service (positions, trades, failure
// count, safe mode, operation mode) uses the same write-then-rename pattern.
// This module generalizes it into one place instead of repeating it per file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};

/// Load a JSON document from `path`. Returns `Ok(None)` if the file does not
/// exist (a fresh install); returns an error only for unreadable or malformed
/// content, leaving the caller free to decide whether that's fatal.
pub fn load<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<Option<T>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let value: T = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(value))
}

/// Persist `value` to `path` atomically: write to a unique temp sibling, then
/// rename over the target. The temp name embeds a random suffix so that
/// concurrent operator commands writing the same path never collide.
pub fn save_atomic<T: Serialize>(path: impl AsRef<Path>, value: &T) -> Result<()> {
    let path = path.as_ref();
    let content =
        serde_json::to_string_pretty(value).context("failed to serialise value to JSON")?;

    let tmp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4()));

    std::fs::write(&tmp_path, &content)
        .with_context(|| format!("failed to write tmp file {}", tmp_path.display()))?;

    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename tmp file to {}", path.display()))?;

    Ok(())
}
