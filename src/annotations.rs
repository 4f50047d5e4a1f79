//! YOLO annotation parsing and item loading.
//!
//! An item is one training sample: a `<id>.txt` annotation with one bounding
//! box per line (`class_id x y w h`, coordinates normalized to `[0,1]`) plus
//! a same-named image in the same directory. A present annotation whose image
//! cannot be found is a load error, not an absent item.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::listing::find_related_image;

#[derive(Debug, thiserror::Error)]
pub enum AnnotationError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no related image for '{0}' (expected same stem with .png or .jpg)")]
    MissingImage(PathBuf),
    #[error("failed to parse line {line} of '{path}'")]
    BadLine { path: PathBuf, line: usize },
}

/// One bounding box of an annotation file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Annotation {
    pub class_id: u32,
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl Annotation {
    /// Parse one `class_id x y w h` line. Coordinates must be in `[0,1]`.
    pub fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let class_id = fields.next()?.parse::<u32>().ok()?;
        let mut coords = [0f32; 4];
        for slot in &mut coords {
            let value = fields.next()?.parse::<f32>().ok()?;
            if !(0.0..=1.0).contains(&value) {
                return None;
            }
            *slot = value;
        }
        if fields.next().is_some() {
            return None;
        }
        let [x, y, w, h] = coords;
        Some(Self { class_id, x, y, w, h })
    }
}

/// A fully loaded training sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub annotation_path: PathBuf,
    pub image_path: PathBuf,
    pub boxes: Vec<Annotation>,
}

impl Item {
    /// Load one item from its annotation file. Any unparsable line or a
    /// missing related image fails the load.
    pub fn load(annotation_path: &Path) -> Result<Self, AnnotationError> {
        let image_path = find_related_image(annotation_path)
            .ok_or_else(|| AnnotationError::MissingImage(annotation_path.to_path_buf()))?;
        let text = fs::read_to_string(annotation_path)?;
        let mut boxes = Vec::new();
        for (line_index, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let annotation =
                Annotation::parse(line).ok_or_else(|| AnnotationError::BadLine {
                    path: annotation_path.to_path_buf(),
                    line: line_index + 1,
                })?;
            boxes.push(annotation);
        }
        Ok(Self {
            annotation_path: annotation_path.to_path_buf(),
            image_path,
            boxes,
        })
    }
}

/// Load every item of a flat dataset directory, skipping items that fail to
/// load with a warning.
pub fn load_items(dir: &Path) -> Result<Vec<Item>, AnnotationError> {
    let mut items = Vec::new();
    for dir_entry in fs::read_dir(dir)? {
        let path = dir_entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("txt") {
            continue;
        }
        match Item::load(&path) {
            Ok(item) => items.push(item),
            Err(err) => warn!("skipping '{}': {err}", path.display()),
        }
    }
    Ok(items)
}

/// Highest class id plus one across all items, zero for an empty set.
pub fn class_count(items: &[Item]) -> u32 {
    items
        .iter()
        .flat_map(|item| item.boxes.iter())
        .map(|annotation| annotation.class_id + 1)
        .max()
        .unwrap_or(0)
}
