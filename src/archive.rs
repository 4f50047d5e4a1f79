//! Flat zip container used as the unit of bulk transfer.
//!
//! Packing stores every input by base name only, so the archive namespace is
//! flat and later inputs with the same base name win. Unpacking keeps going
//! past corrupted entries; only failing to open or walk the archive itself is
//! fatal.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use tracing::warn;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("zip error: {0}")]
    Zip(String),
    #[error("source has no usable file name: {0}")]
    BadSourceName(PathBuf),
}

/// Counts reported by [`unpack`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnpackSummary {
    pub extracted: usize,
    pub skipped: usize,
}

/// Pack `sources` into `dest_zip`, each stored under its base name.
///
/// Any single file that cannot be read fails the whole pack.
pub fn pack(dest_zip: &Path, sources: &[PathBuf]) -> Result<(), ArchiveError> {
    let file = File::create(dest_zip)?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for source in sources {
        let name = source
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| ArchiveError::BadSourceName(source.clone()))?;
        writer
            .start_file(name, options)
            .map_err(|err| ArchiveError::Zip(err.to_string()))?;
        let mut reader = File::open(source)?;
        std::io::copy(&mut reader, &mut writer)?;
    }
    writer
        .finish()
        .map_err(|err| ArchiveError::Zip(err.to_string()))?;
    Ok(())
}

/// Extract `zip_path` under `dest_dir`, overwriting same-named files.
///
/// Entries that cannot be read are logged and skipped; the rest of the
/// archive is still extracted.
pub fn unpack(zip_path: &Path, dest_dir: &Path) -> Result<UnpackSummary, ArchiveError> {
    let file = File::open(zip_path)?;
    let mut archive = ZipArchive::new(file).map_err(|err| ArchiveError::Zip(err.to_string()))?;
    fs::create_dir_all(dest_dir)?;

    let mut summary = UnpackSummary::default();
    for index in 0..archive.len() {
        let mut entry = match archive.by_index(index) {
            Ok(entry) => entry,
            Err(err) => {
                warn!("skipping unreadable archive entry {index}: {err}");
                summary.skipped += 1;
                continue;
            }
        };
        let Some(relative) = entry.enclosed_name() else {
            warn!("skipping archive entry with unsafe name '{}'", entry.name());
            summary.skipped += 1;
            continue;
        };
        let outpath = dest_dir.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&outpath)?;
            continue;
        }
        if let Some(parent) = outpath.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut outfile = File::create(&outpath)?;
        match std::io::copy(&mut entry, &mut outfile) {
            Ok(_) => summary.extracted += 1,
            Err(err) => {
                warn!("skipping corrupted archive entry '{}': {err}", entry.name());
                drop(outfile);
                let _ = fs::remove_file(&outpath);
                summary.skipped += 1;
            }
        }
    }
    Ok(summary)
}
