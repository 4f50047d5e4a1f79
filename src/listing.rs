//! Canonical listing wire format and dataset directory enumeration.
//!
//! The listing is a plain-text payload: one source marker line, then one
//! `index:item_id` line per item. Indices are assigned by enumeration order
//! at request time and are only meaningful for the lifetime of one listing
//! snapshot; a dataset directory that mutates between the listing call and a
//! range fetch can silently shift them. That limitation is inherited from the
//! wire contract and deliberately not remedied here.

use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;

/// Marker line for a directory-backed dataset.
pub const SOURCE_IMAGES_LIST: &str = "images_list";
/// Marker prefix for an externally acquired open-images dataset.
pub const SOURCE_OPEN_IMAGES_PREFIX: &str = "open_images,";

/// Where the host's data comes from, as announced on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataSource {
    /// Items are served straight from the host's dataset directory.
    ImagesList,
    /// Items come from an open-images query resolved outside this crate.
    OpenImages { query: String },
}

/// One `(index, item_id)` pair of the canonical listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub index: u32,
    pub item_id: String,
}

/// An immutable listing snapshot, valid for one sync pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub source: DataSource,
    pub entries: Vec<ListingEntry>,
}

impl Listing {
    /// Parse a listing payload. Malformed entry lines are skipped with a
    /// warning; everything else is kept.
    pub fn parse(text: &str) -> Self {
        let mut source = DataSource::ImagesList;
        let mut entries = Vec::new();
        for (line_index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line_index == 0 {
                if line == SOURCE_IMAGES_LIST {
                    continue;
                }
                if let Some(query) = line.strip_prefix(SOURCE_OPEN_IMAGES_PREFIX) {
                    source = DataSource::OpenImages {
                        query: query.to_string(),
                    };
                    continue;
                }
            }
            match parse_entry(line) {
                Some(entry) => entries.push(entry),
                None => warn!("skipping malformed listing line '{line}'"),
            }
        }
        Self { source, entries }
    }

    /// Render the listing in its wire format.
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        match &self.source {
            DataSource::ImagesList => out.push_str(SOURCE_IMAGES_LIST),
            DataSource::OpenImages { query } => {
                out.push_str(SOURCE_OPEN_IMAGES_PREFIX);
                out.push_str(query);
            }
        }
        for entry in &self.entries {
            out.push('\n');
            out.push_str(&format!("{}:{}", entry.index, entry.item_id));
        }
        out
    }
}

fn parse_entry(line: &str) -> Option<ListingEntry> {
    let (index, item_id) = line.split_once(':')?;
    let index = index.trim().parse::<u32>().ok()?;
    let item_id = item_id.trim();
    if item_id.is_empty() {
        return None;
    }
    Some(ListingEntry {
        index,
        item_id: item_id.to_string(),
    })
}

/// Enumerate the annotation files of `dir` in filesystem order, assigning
/// each a zero-based index. This order is the de facto index contract for
/// range fetches against the same snapshot.
pub fn enumerate_annotations(dir: &Path) -> io::Result<Vec<ListingEntry>> {
    let mut entries = Vec::new();
    let mut index = 0u32;
    for dir_entry in std::fs::read_dir(dir)? {
        let path = dir_entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("txt") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        entries.push(ListingEntry {
            index,
            item_id: stem.to_string(),
        });
        index += 1;
    }
    Ok(entries)
}

/// Path of the annotation file for `item_id` inside `dir`.
pub fn annotation_path(dir: &Path, item_id: &str) -> PathBuf {
    dir.join(format!("{item_id}.txt"))
}

/// Find the image belonging to an annotation file: same stem, `.png` or
/// `.jpg`, same directory.
pub fn find_related_image(annotation_path: &Path) -> Option<PathBuf> {
    for extension in ["png", "jpg"] {
        let candidate = annotation_path.with_extension(extension);
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}
