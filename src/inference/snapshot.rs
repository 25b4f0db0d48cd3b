//! Best-effort on-disk copy of the latest result

use std::path::Path;

use super::InferenceResult;

/// Write the result as pretty JSON, replacing the previous file atomically
///
/// Callers treat failures as non-fatal: the in-memory result store stays
/// authoritative.
pub async fn write_snapshot(path: &Path, result: &InferenceResult) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let json = serde_json::to_vec_pretty(result)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await
}
