//! Trainer-side dataset pull and checkpoint bootstrap.
//!
//! One sync pass asks the host for its canonical listing, diffs it against
//! the local dataset directory by annotation-file existence, coalesces the
//! missing indices into contiguous range batches and fetches each batch as a
//! flat archive. Passes are idempotent: a completed dataset produces an empty
//! plan and no fetches. A failed batch is logged and skipped so one bad range
//! cannot starve the rest of the pass; only a missing listing aborts.

use std::fs;
use std::path::PathBuf;

use tracing::{info, warn};

use crate::archive::{self, ArchiveError};
use crate::checkpoints;
use crate::config::SyncConfig;
use crate::listing::{self, DataSource, Listing};
use crate::transport::{self, DownloadOptions, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("the server returned an empty listing response")]
    MissingListing,
    #[error("data source '{0}' must be acquired by an external collaborator")]
    UnsupportedSource(String),
}

/// A contiguous, inclusive index range to fetch in one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Batch {
    pub from: u32,
    pub to: u32,
}

impl Batch {
    /// Item count of the inclusive range.
    pub fn count(&self) -> usize {
        (self.to - self.from + 1) as usize
    }
}

/// Progress of an ongoing sync pass, reported after each batch.
#[derive(Debug, Clone, Copy)]
pub struct PullProgress {
    /// Items obtained so far in this pass.
    pub obtained: usize,
    /// Items the pass set out to obtain.
    pub total_missing: usize,
}

/// Outcome of one completed sync pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullReport {
    /// Items the host listed.
    pub listed: usize,
    /// Items missing locally at the start of the pass.
    pub missing: usize,
    /// Items obtained by this pass.
    pub obtained: usize,
    /// Batches that failed and were skipped.
    pub failed_batches: usize,
}

/// Coalesce sorted missing indices into inclusive ranges of at most
/// `max_batch` items each.
pub fn plan_batches(missing: &[u32], max_batch: usize) -> Vec<Batch> {
    let max_batch = max_batch.max(1) as u32;
    let mut batches = Vec::new();
    let mut iter = missing.iter().copied();
    let Some(first) = iter.next() else {
        return batches;
    };
    let mut from = first;
    let mut to = first;
    for index in iter {
        if index == to + 1 && index - from < max_batch - 1 {
            to = index;
        } else {
            batches.push(Batch { from, to });
            from = index;
            to = index;
        }
    }
    batches.push(Batch { from, to });
    batches
}

/// Run one sync pass against `config.server`.
pub fn sync(
    config: &SyncConfig,
    mut progress: Option<&mut dyn FnMut(&PullProgress)>,
) -> Result<PullReport, SyncError> {
    fs::create_dir_all(&config.dataset_dir)?;

    let listing_url = format!("{}/get_data_source", config.server);
    let body = transport::download_to_vec(&listing_url)?.ok_or(SyncError::MissingListing)?;
    let listing = Listing::parse(&String::from_utf8_lossy(&body));
    if let DataSource::OpenImages { query } = &listing.source {
        return Err(SyncError::UnsupportedSource(format!("open_images,{query}")));
    }

    let mut missing = Vec::new();
    for entry in &listing.entries {
        if !listing::annotation_path(&config.dataset_dir, &entry.item_id).exists() {
            missing.push(entry.index);
        }
    }
    missing.sort_unstable();
    let total_missing = missing.len();
    info!(
        "dataset has {} items on the server, {} missing locally",
        listing.entries.len(),
        total_missing
    );

    let batches = plan_batches(&missing, config.batch_size);
    let scratch = tempfile::tempdir()?;
    let mut obtained = 0usize;
    let mut failed_batches = 0usize;
    for batch in &batches {
        match fetch_batch(config, batch, &scratch) {
            Ok(()) => obtained += batch.count(),
            Err(err) => {
                warn!(
                    "failed to obtain items {}..={}: {err}",
                    batch.from, batch.to
                );
                failed_batches += 1;
            }
        }
        if let Some(callback) = progress.as_deref_mut() {
            callback(&PullProgress {
                obtained,
                total_missing,
            });
        }
    }

    Ok(PullReport {
        listed: listing.entries.len(),
        missing: total_missing,
        obtained,
        failed_batches,
    })
}

fn fetch_batch(
    config: &SyncConfig,
    batch: &Batch,
    scratch: &tempfile::TempDir,
) -> Result<(), SyncError> {
    let url = format!(
        "{}/get_images?from={}&to={}",
        config.server, batch.from, batch.to
    );
    let zip_path = scratch
        .path()
        .join(format!("batch_{}_{}.zip", batch.from, batch.to));
    let options = DownloadOptions {
        overwrite: true,
        silent: true,
    };
    transport::download_to_file(&url, &zip_path, &options, None)?;
    let summary = archive::unpack(&zip_path, &config.dataset_dir)?;
    if summary.skipped > 0 {
        warn!(
            "{} corrupt entries skipped while unpacking items {}..={}",
            summary.skipped, batch.from, batch.to
        );
    }
    fs::remove_file(&zip_path)?;
    Ok(())
}

/// Fetch the host's latest checkpoint into `config.weights_dir`.
///
/// `Ok(None)` means the host has no checkpoint yet and training starts from
/// scratch.
pub fn fetch_latest_weights(config: &SyncConfig) -> Result<Option<PathBuf>, SyncError> {
    fs::create_dir_all(&config.weights_dir)?;
    let url = format!("{}/latest_weights", config.server);
    let Some(body) = transport::download_to_vec(&url)? else {
        info!("the server has no weights yet, starting fresh");
        return Ok(None);
    };
    let scratch = tempfile::tempdir()?;
    let zip_path = scratch.path().join("latest_weights.zip");
    fs::write(&zip_path, &body)?;
    archive::unpack(&zip_path, &config.weights_dir)?;
    let latest = checkpoints::find_latest_weights(&config.weights_dir)?;
    if let Some(path) = &latest {
        info!("resuming from '{}'", path.display());
    }
    Ok(latest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_coalesces_contiguous_runs() {
        let missing = [1, 2, 3, 7, 8, 100, 101, 102];
        let batches = plan_batches(&missing, 100);
        assert_eq!(
            batches,
            vec![
                Batch { from: 1, to: 3 },
                Batch { from: 7, to: 8 },
                Batch { from: 100, to: 102 },
            ]
        );
    }

    #[test]
    fn plan_splits_runs_at_the_batch_cap() {
        let missing: Vec<u32> = (1..=250).collect();
        let batches = plan_batches(&missing, 100);
        assert_eq!(
            batches,
            vec![
                Batch { from: 1, to: 100 },
                Batch { from: 101, to: 200 },
                Batch { from: 201, to: 250 },
            ]
        );
    }

    #[test]
    fn plan_handles_empty_and_singleton_input() {
        assert!(plan_batches(&[], 100).is_empty());
        assert_eq!(plan_batches(&[42], 100), vec![Batch { from: 42, to: 42 }]);
    }

    #[test]
    fn plan_never_merges_across_gaps() {
        let batches = plan_batches(&[0, 2, 4], 100);
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|batch| batch.count() == 1));
    }

    #[test]
    fn batch_count_is_inclusive() {
        assert_eq!(Batch { from: 5, to: 5 }.count(), 1);
        assert_eq!(Batch { from: 1, to: 100 }.count(), 100);
    }
}
