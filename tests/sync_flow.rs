//! End-to-end exercises of the trainer/host synchronization loop against a
//! real in-process data server.

use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::tempdir;
use trainlink::config::SyncConfig;
use trainlink::puller;
use trainlink::server::{DataServer, LIVENESS_BODY, ServerConfig};
use trainlink::transport::{self, TransportError};
use trainlink::watcher::{ProgressWatcher, WatcherConfig};

fn start_host(root: &Path) -> (DataServer, String) {
    let config = ServerConfig::new(
        "127.0.0.1:0",
        root.join("dataset"),
        root.join("weights"),
        root.join("chart.png"),
    );
    let server = DataServer::start(config).unwrap();
    let url = format!("http://127.0.0.1:{}", server.port());
    (server, url)
}

fn seed_item(dataset_dir: &Path, item_id: &str) {
    fs::create_dir_all(dataset_dir).unwrap();
    fs::write(
        dataset_dir.join(format!("{item_id}.txt")),
        "0 0.5 0.5 0.1 0.1\n",
    )
    .unwrap();
    fs::write(dataset_dir.join(format!("{item_id}.jpg")), item_id.as_bytes()).unwrap();
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}

#[test]
fn liveness_endpoint_answers() {
    let host_root = tempdir().unwrap();
    let (_server, url) = start_host(host_root.path());
    let body = transport::download_to_vec(&format!("{url}/test"))
        .unwrap()
        .unwrap();
    assert_eq!(String::from_utf8_lossy(&body), LIVENESS_BODY);
}

#[test]
fn full_sync_obtains_everything_and_is_idempotent() {
    let host_root = tempdir().unwrap();
    seed_item(&host_root.path().join("dataset"), "cat_001");
    seed_item(&host_root.path().join("dataset"), "cat_002");
    seed_item(&host_root.path().join("dataset"), "cat_003");
    let (_server, url) = start_host(host_root.path());

    let trainer_root = tempdir().unwrap();
    let config = SyncConfig::new(
        url.as_str(),
        trainer_root.path().join("dataset"),
        trainer_root.path().join("weights"),
    );

    let report = puller::sync(&config, None).unwrap();
    assert_eq!(report.listed, 3);
    assert_eq!(report.missing, 3);
    assert_eq!(report.obtained, 3);
    assert_eq!(report.failed_batches, 0);
    for item_id in ["cat_001", "cat_002", "cat_003"] {
        assert!(config.dataset_dir.join(format!("{item_id}.txt")).exists());
        assert!(config.dataset_dir.join(format!("{item_id}.jpg")).exists());
    }

    // a second pass finds nothing missing and fetches nothing
    let report = puller::sync(&config, None).unwrap();
    assert_eq!(report.missing, 0);
    assert_eq!(report.obtained, 0);
    assert_eq!(report.failed_batches, 0);
}

#[test]
fn sync_fetches_only_what_is_missing() {
    let host_root = tempdir().unwrap();
    seed_item(&host_root.path().join("dataset"), "item_a");
    seed_item(&host_root.path().join("dataset"), "item_b");
    seed_item(&host_root.path().join("dataset"), "item_c");
    let (_server, url) = start_host(host_root.path());

    let trainer_root = tempdir().unwrap();
    let config = SyncConfig::new(
        url.as_str(),
        trainer_root.path().join("dataset"),
        trainer_root.path().join("weights"),
    );
    // one item is already present locally
    seed_item(&config.dataset_dir, "item_b");

    let mut snapshots = Vec::new();
    let mut on_progress =
        |progress: &puller::PullProgress| snapshots.push(progress.obtained);
    let report = puller::sync(&config, Some(&mut on_progress)).unwrap();
    assert_eq!(report.missing, 2);
    assert_eq!(report.obtained, 2);
    assert_eq!(snapshots.last(), Some(&2));
}

#[test]
fn latest_weights_starts_fresh_then_resumes_after_upload() {
    let host_root = tempdir().unwrap();
    let (_server, url) = start_host(host_root.path());

    let trainer_root = tempdir().unwrap();
    let config = SyncConfig::new(
        url.as_str(),
        trainer_root.path().join("dataset"),
        trainer_root.path().join("weights"),
    );

    // nothing uploaded yet: fresh start, not an error
    assert_eq!(puller::fetch_latest_weights(&config).unwrap(), None);

    let checkpoint = trainer_root.path().join("model_100.weights");
    fs::write(&checkpoint, b"checkpoint-bytes").unwrap();
    transport::upload(&format!("{url}/upload"), &checkpoint, "data").unwrap();
    assert!(host_root.path().join("weights/model_100.weights").exists());

    let resumed = puller::fetch_latest_weights(&config).unwrap().unwrap();
    assert_eq!(resumed, config.weights_dir.join("model_100.weights"));
    assert_eq!(fs::read(&resumed).unwrap(), b"checkpoint-bytes");
}

#[test]
fn uploaded_charts_land_at_the_configured_chart_path() {
    let host_root = tempdir().unwrap();
    let (_server, url) = start_host(host_root.path());

    let trainer_root = tempdir().unwrap();
    let chart = trainer_root.path().join("chart.png");
    fs::write(&chart, b"png-bytes").unwrap();
    transport::upload(&format!("{url}/upload"), &chart, "data").unwrap();

    assert_eq!(
        fs::read(host_root.path().join("chart.png")).unwrap(),
        b"png-bytes"
    );
}

#[test]
fn get_images_rejects_bad_parameters() {
    let host_root = tempdir().unwrap();
    let (_server, url) = start_host(host_root.path());

    let err = transport::download_to_vec(&format!("{url}/get_images?from=a&to=b")).unwrap_err();
    assert!(matches!(err, TransportError::Status(400)));

    let err = transport::download_to_vec(&format!("{url}/get_images")).unwrap_err();
    assert!(matches!(err, TransportError::Status(400)));
}

#[test]
fn watcher_ships_weights_and_keeps_charts() {
    let host_root = tempdir().unwrap();
    let (_server, url) = start_host(host_root.path());

    let trainer_root = tempdir().unwrap();
    let watch_dir = trainer_root.path().join("weights");
    fs::create_dir_all(&watch_dir).unwrap();
    let checkpoint = watch_dir.join("model_200.weights");
    fs::write(&checkpoint, b"done-training").unwrap();
    let chart = trainer_root.path().join("chart.png");
    fs::write(&chart, b"chart-bytes").unwrap();

    let mut watcher = ProgressWatcher::start(WatcherConfig {
        server: url,
        watch_dir: watch_dir.clone(),
        chart_path: Some(chart.clone()),
        poll_interval: Duration::from_millis(50),
        stability_window: Duration::ZERO,
    })
    .unwrap();

    let host_checkpoint = host_root.path().join("weights/model_200.weights");
    assert!(wait_until(Duration::from_secs(5), || host_checkpoint.exists()));
    assert!(wait_until(Duration::from_secs(5), || !checkpoint.exists()));
    let host_chart = host_root.path().join("chart.png");
    assert!(wait_until(Duration::from_secs(5), || host_chart.exists()));
    watcher.stop();

    // the transient checkpoint was consumed, the chart was not
    assert_eq!(fs::read(&host_checkpoint).unwrap(), b"done-training");
    assert!(!checkpoint.exists());
    assert!(chart.exists());
    assert_eq!(fs::read(&host_chart).unwrap(), b"chart-bytes");
}

#[test]
fn watcher_refuses_a_non_http_server() {
    let trainer_root = tempdir().unwrap();
    let err = ProgressWatcher::start(WatcherConfig {
        server: "192.168.1.3:8086".to_string(),
        watch_dir: trainer_root.path().join("weights"),
        chart_path: None,
        poll_interval: Duration::from_millis(50),
        stability_window: Duration::ZERO,
    })
    .unwrap_err();
    assert!(matches!(
        err,
        trainlink::watcher::WatcherError::InvalidServer(_)
    ));
}
