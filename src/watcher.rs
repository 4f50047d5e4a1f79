//! Checkpoint watcher: polls the weights directory and uploads finished
//! artifacts to the data host.
//!
//! Training writes checkpoints in place, so a file observed mid-write must
//! not be shipped. The watcher debounces by stability: a file is uploaded
//! only once its content has gone unmodified for a full stability window,
//! and any observed rewrite restarts that clock. Uploaded `.weights` files
//! are deleted locally (the host's copy becomes canonical); charts are kept
//! and re-uploaded whenever they change.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, SystemTime};

use tracing::{info, warn};

use crate::checkpoints;
use crate::config::SyncConfig;
use crate::transport;

/// Multipart field name the host expects uploads under.
const UPLOAD_FIELD: &str = "data";

#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("server address '{0}' is not an http url")]
    InvalidServer(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// What to watch and where to ship it.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub server: String,
    /// Directory scanned for `.weights` checkpoints.
    pub watch_dir: PathBuf,
    /// Chart file watched alongside the directory.
    pub chart_path: Option<PathBuf>,
    pub poll_interval: Duration,
    pub stability_window: Duration,
}

impl WatcherConfig {
    pub fn from_sync(config: &SyncConfig) -> Self {
        Self {
            server: config.server.clone(),
            watch_dir: config.weights_dir.clone(),
            chart_path: config.chart_path.clone(),
            poll_interval: config.poll_interval(),
            stability_window: config.stability_window(),
        }
    }
}

struct WatchEntry {
    last_write: SystemTime,
    /// When the current content was first observed.
    stable_since: SystemTime,
    notified: bool,
}

/// Pure debounce bookkeeping, separated from the polling thread so the
/// timing rules can be exercised with synthetic clocks.
struct WatchState {
    entries: HashMap<PathBuf, WatchEntry>,
    stability_window: Duration,
}

impl WatchState {
    fn new(stability_window: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            stability_window,
        }
    }

    /// Record one observation of `path`. Returns true when the file is due
    /// for upload: stable for a full window and not yet shipped.
    fn observe(&mut self, path: &Path, modified: SystemTime, now: SystemTime) -> bool {
        let entry = self
            .entries
            .entry(path.to_path_buf())
            .or_insert(WatchEntry {
                last_write: modified,
                stable_since: now,
                notified: false,
            });
        if entry.last_write != modified {
            // rewritten since the last poll, restart the clock
            entry.last_write = modified;
            entry.stable_since = now;
            entry.notified = false;
        }
        let stable_for = now
            .duration_since(entry.stable_since)
            .unwrap_or(Duration::ZERO);
        !entry.notified && stable_for >= self.stability_window
    }

    fn mark_notified(&mut self, path: &Path) {
        if let Some(entry) = self.entries.get_mut(path) {
            entry.notified = true;
        }
    }

    fn forget(&mut self, path: &Path) {
        self.entries.remove(path);
    }

    /// Drop state for files that vanished from the watched set.
    fn retain_seen(&mut self, seen: &HashSet<PathBuf>) {
        self.entries.retain(|path, _| seen.contains(path));
    }
}

/// Background watcher thread. Stops (and joins) on drop.
#[derive(Debug)]
pub struct ProgressWatcher {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ProgressWatcher {
    /// Validate the config and spawn the polling thread.
    pub fn start(config: WatcherConfig) -> Result<Self, WatcherError> {
        if !config.server.starts_with("http") {
            return Err(WatcherError::InvalidServer(config.server));
        }
        fs::create_dir_all(&config.watch_dir)?;
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("progress-watch".to_string())
            .spawn(move || {
                info!(
                    "watching '{}' for finished checkpoints",
                    config.watch_dir.display()
                );
                let mut state = WatchState::new(config.stability_window);
                while !thread_stop.load(Ordering::Relaxed) {
                    poll_once(&config, &mut state);
                    thread::sleep(config.poll_interval);
                }
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Signal the polling thread and wait for it to finish its current pass.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ProgressWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll_once(config: &WatcherConfig, state: &mut WatchState) {
    let mut seen = HashSet::new();
    for (path, modified) in scan(config) {
        seen.insert(path.clone());
        if state.observe(&path, modified, SystemTime::now()) {
            upload_artifact(config, state, &path);
        }
    }
    state.retain_seen(&seen);
}

/// Current watched files and their mtimes. Files that fail to stat are
/// silently skipped until the next poll.
fn scan(config: &WatcherConfig) -> Vec<(PathBuf, SystemTime)> {
    let mut found = Vec::new();
    if let Ok(dir_entries) = fs::read_dir(&config.watch_dir) {
        for dir_entry in dir_entries.flatten() {
            let path = dir_entry.path();
            if !checkpoints::is_transient(&path) {
                continue;
            }
            if let Ok(modified) = dir_entry.metadata().and_then(|meta| meta.modified()) {
                found.push((path, modified));
            }
        }
    }
    if let Some(chart) = &config.chart_path {
        if let Ok(modified) = fs::metadata(chart).and_then(|meta| meta.modified()) {
            found.push((chart.clone(), modified));
        }
    }
    found
}

fn upload_artifact(config: &WatcherConfig, state: &mut WatchState, path: &Path) {
    let url = format!("{}/upload", config.server);
    match transport::upload(&url, path, UPLOAD_FIELD) {
        Ok(()) => {
            state.mark_notified(path);
            if checkpoints::is_transient(path) {
                match fs::remove_file(path) {
                    Ok(()) => {
                        state.forget(path);
                        info!("uploaded and removed '{}'", path.display());
                    }
                    Err(err) => {
                        warn!("uploaded '{}' but failed to remove it: {err}", path.display());
                    }
                }
            } else {
                info!("uploaded '{}'", path.display());
            }
        }
        // the entry stays un-notified, so the next poll retries
        Err(err) => warn!("failed to upload '{}': {err}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(base: SystemTime, secs: u64) -> SystemTime {
        base + Duration::from_secs(secs)
    }

    #[test]
    fn a_rewrite_restarts_the_stability_clock() {
        let base = SystemTime::UNIX_EPOCH;
        let mut state = WatchState::new(Duration::from_secs(10));
        let path = Path::new("model_100.weights");

        // created at t=0, rewritten at t=5
        assert!(!state.observe(path, at(base, 0), at(base, 0)));
        assert!(!state.observe(path, at(base, 5), at(base, 5)));
        // t=10 would have been due without the rewrite
        assert!(!state.observe(path, at(base, 5), at(base, 10)));
        assert!(!state.observe(path, at(base, 5), at(base, 12)));
        // stable since t=5, due at t=15
        assert!(state.observe(path, at(base, 5), at(base, 15)));
    }

    #[test]
    fn notified_files_do_not_trigger_again_until_rewritten() {
        let base = SystemTime::UNIX_EPOCH;
        let mut state = WatchState::new(Duration::from_secs(10));
        let path = Path::new("chart.png");

        assert!(!state.observe(path, at(base, 0), at(base, 0)));
        assert!(state.observe(path, at(base, 0), at(base, 10)));
        state.mark_notified(path);
        assert!(!state.observe(path, at(base, 0), at(base, 60)));

        // a new write re-arms the entry
        assert!(!state.observe(path, at(base, 61), at(base, 61)));
        assert!(state.observe(path, at(base, 61), at(base, 71)));
    }

    #[test]
    fn forgotten_files_start_over_when_they_reappear() {
        let base = SystemTime::UNIX_EPOCH;
        let mut state = WatchState::new(Duration::from_secs(10));
        let path = Path::new("model_200.weights");

        assert!(!state.observe(path, at(base, 0), at(base, 0)));
        state.forget(path);
        // same mtime, but the entry was dropped so the clock restarts
        assert!(!state.observe(path, at(base, 0), at(base, 12)));
        assert!(state.observe(path, at(base, 0), at(base, 22)));
    }

    #[test]
    fn vanished_files_are_pruned() {
        let base = SystemTime::UNIX_EPOCH;
        let mut state = WatchState::new(Duration::from_secs(10));
        let kept = Path::new("kept.weights");
        let gone = Path::new("gone.weights");
        state.observe(kept, at(base, 0), at(base, 0));
        state.observe(gone, at(base, 0), at(base, 0));

        let mut seen = HashSet::new();
        seen.insert(kept.to_path_buf());
        state.retain_seen(&seen);
        assert!(state.entries.contains_key(kept));
        assert!(!state.entries.contains_key(gone));
    }

    #[test]
    fn zero_window_is_due_immediately() {
        let base = SystemTime::UNIX_EPOCH;
        let mut state = WatchState::new(Duration::ZERO);
        assert!(state.observe(Path::new("a.weights"), base, base));
    }
}
