use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use vigil_core::PipelineRun;

/// `run-<owner>_<name>-<number>-<created>.json`
pub fn snapshot_name(run: &PipelineRun) -> String {
    format!(
        "run-{}-{}-{}.json",
        run.change.repo.replace('/', "_"),
        run.change.number,
        run.created_at.format("%Y%m%dT%H%M%SZ")
    )
}

/// Write the finished run as pretty JSON under `<data_dir>/runs/`.
pub fn write_snapshot(data_dir: &Path, run: &PipelineRun) -> Result<PathBuf> {
    let dir = data_dir.join("runs");
    std::fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let path = dir.join(snapshot_name(run));
    let body = serde_json::to_string_pretty(run)?;
    std::fs::write(&path, body).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}
