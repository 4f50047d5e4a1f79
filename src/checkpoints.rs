//! Checkpoint artifact naming rules shared by both sides of the link.

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Suffix of a serialized weights checkpoint.
pub const WEIGHTS_EXTENSION: &str = "weights";
/// Suffix of a training progress chart.
pub const CHART_EXTENSION: &str = "png";

/// Whether a file is deleted locally once its upload is confirmed.
///
/// Weights blobs are transient: the host's copy becomes the canonical one.
/// Charts stay on the trainer and are re-uploaded when rewritten.
pub fn is_transient(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext == WEIGHTS_EXTENSION)
}

/// Find the most recently written `.weights` file in `dir`, if any.
pub fn find_latest_weights(dir: &Path) -> io::Result<Option<PathBuf>> {
    if !dir.exists() {
        return Ok(None);
    }
    let mut latest: Option<(SystemTime, PathBuf)> = None;
    for dir_entry in std::fs::read_dir(dir)? {
        let dir_entry = dir_entry?;
        let path = dir_entry.path();
        if !is_transient(&path) {
            continue;
        }
        let modified = dir_entry.metadata()?.modified()?;
        let newer = latest
            .as_ref()
            .is_none_or(|(current, _)| modified > *current);
        if newer {
            latest = Some((modified, path));
        }
    }
    Ok(latest.map(|(_, path)| path))
}
