//! Dataset and checkpoint synchronization over HTTP for remote training.
//!
//! One machine (the data host) owns the annotated dataset and archives every
//! checkpoint; the other (the trainer) mirrors the dataset before training
//! and ships checkpoints back while it runs. All transfers are plain blocking
//! HTTP; durability comes from temp-then-rename writes and idempotent sync
//! passes rather than from any session state.

/// YOLO annotation parsing and item loading.
pub mod annotations;
/// Flat zip packing and unpacking.
pub mod archive;
/// Checkpoint naming rules shared by both sides.
pub mod checkpoints;
/// Trainer-side configuration.
pub mod config;
/// Listing wire format and dataset enumeration.
pub mod listing;
/// Tracing setup with per-launch log files.
pub mod logging;
/// Multipart form encoding and parsing.
pub mod multipart;
/// Dataset pull and checkpoint bootstrap.
pub mod puller;
/// Data-host HTTP endpoint.
pub mod server;
/// Blocking HTTP transfer helpers.
pub mod transport;
/// Checkpoint upload watcher.
pub mod watcher;
