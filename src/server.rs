//! Data-host HTTP endpoint.
//!
//! Serves the canonical listing, ranged item batches and the latest
//! checkpoint, and accepts checkpoint/chart uploads from the trainer. The
//! server holds no cross-request state beyond the filesystem: every request
//! re-enumerates what it needs. A small fixed pool of worker threads shares
//! one accept queue; handlers for different requests may run concurrently,
//! and racing reads/writes on the same file are resolved only by the atomic
//! rename discipline of the writers.

use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use serde::Deserialize;
use tiny_http::Method;
use tracing::{info, warn};

use crate::archive;
use crate::checkpoints::{self, CHART_EXTENSION, WEIGHTS_EXTENSION};
use crate::listing::{self, DataSource, Listing};
use crate::multipart;

/// Body of the `/test` liveness endpoint.
pub const LIVENESS_BODY: &str = "If you see this, the server is running";

const DEFAULT_BIND: &str = "0.0.0.0:8086";
const DEFAULT_WORKERS: usize = 2;

type HttpResponse = tiny_http::Response<Cursor<Vec<u8>>>;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind http server: {0}")]
    Bind(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Host-side configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address, e.g. `0.0.0.0:8086`. Port 0 picks a free port.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Flat directory of `<id>.txt` + `<id>.jpg|.png` items.
    pub dataset_dir: PathBuf,
    /// Directory receiving uploaded `.weights` checkpoints.
    pub weights_dir: PathBuf,
    /// Fixed path receiving the uploaded training chart.
    pub chart_path: PathBuf,
    /// Overrides the announced data source, e.g. `open_images,Cat`.
    #[serde(default)]
    pub data_source: Option<String>,
    /// Worker thread count.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

impl ServerConfig {
    pub fn new(
        bind: impl Into<String>,
        dataset_dir: impl Into<PathBuf>,
        weights_dir: impl Into<PathBuf>,
        chart_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            bind: bind.into(),
            dataset_dir: dataset_dir.into(),
            weights_dir: weights_dir.into(),
            chart_path: chart_path.into(),
            data_source: None,
            workers: DEFAULT_WORKERS,
        }
    }
}

/// A running data server. Stops (and joins its workers) on drop.
pub struct DataServer {
    server: Arc<tiny_http::Server>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl DataServer {
    /// Bind the listen address and spawn the worker pool.
    pub fn start(config: ServerConfig) -> Result<Self, ServerError> {
        fs::create_dir_all(&config.dataset_dir)?;
        fs::create_dir_all(&config.weights_dir)?;
        let server = tiny_http::Server::http(config.bind.as_str())
            .map_err(|err| ServerError::Bind(err.to_string()))?;
        let server = Arc::new(server);
        let config = Arc::new(config);
        let workers = (0..config.workers.max(1))
            .map(|_| {
                let server = Arc::clone(&server);
                let config = Arc::clone(&config);
                thread::spawn(move || worker_loop(&server, &config))
            })
            .collect();
        if let Some(addr) = server.server_addr().to_ip() {
            info!("server listening on {addr}");
        }
        Ok(Self { server, workers })
    }

    /// Port the server actually bound (useful when binding port 0).
    pub fn port(&self) -> u16 {
        self.server
            .server_addr()
            .to_ip()
            .map(|addr| addr.port())
            .unwrap_or(0)
    }

    /// Unblock the accept queue and join every worker.
    pub fn stop(&mut self) {
        self.server.unblock();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for DataServer {
    fn drop(&mut self) {
        self.stop();
        info!("server closed");
    }
}

fn worker_loop(server: &tiny_http::Server, config: &ServerConfig) {
    loop {
        match server.recv() {
            Ok(request) => handle_request(config, request),
            // recv only fails once the server was unblocked for shutdown
            Err(_) => break,
        }
    }
}

fn handle_request(config: &ServerConfig, mut request: tiny_http::Request) {
    let url = request.url().to_string();
    let (path, query) = match url.split_once('?') {
        Some((path, query)) => (path, query),
        None => (url.as_str(), ""),
    };
    let response = match (request.method().clone(), path) {
        (Method::Get, "/test") => text_response(200, LIVENESS_BODY),
        (Method::Get, "/get_data_source") => handle_data_source(config),
        (Method::Get, "/get_images") => handle_get_images(config, query),
        (Method::Get, "/latest_weights") => handle_latest_weights(config),
        (Method::Post, "/upload") => handle_upload(config, &mut request),
        (method, path) => {
            warn!("unhandled request {method} {path}");
            text_response(404, "Error: unknown endpoint")
        }
    };
    if let Err(err) = request.respond(response) {
        warn!("failed to send response: {err}");
    }
}

fn handle_data_source(config: &ServerConfig) -> HttpResponse {
    if let Some(source) = &config.data_source {
        if let Some(query) = source.strip_prefix(listing::SOURCE_OPEN_IMAGES_PREFIX) {
            let listing = Listing {
                source: DataSource::OpenImages {
                    query: query.to_string(),
                },
                entries: Vec::new(),
            };
            return text_response(200, &listing.to_wire());
        }
    }
    match listing::enumerate_annotations(&config.dataset_dir) {
        Ok(entries) => {
            let listing = Listing {
                source: DataSource::ImagesList,
                entries,
            };
            text_response(200, &listing.to_wire())
        }
        Err(err) => {
            warn!("failed to enumerate dataset: {err}");
            text_response(500, "Error: failed to enumerate the dataset directory")
        }
    }
}

fn handle_get_images(config: &ServerConfig, query: &str) -> HttpResponse {
    let Some(from_raw) = query_param(query, "from") else {
        return text_response(
            400,
            "Error: missing 'from' param. this param must contain the starting index of the \
             images range you'd like to obtain. (the first column of '/get_data_source')",
        );
    };
    let Some(to_raw) = query_param(query, "to") else {
        return text_response(
            400,
            "Error: missing 'to' param. this param must contain the ending index of the \
             images range you'd like to obtain. (the first column of '/get_data_source')",
        );
    };
    let Ok(from) = from_raw.parse::<u32>() else {
        return text_response(400, &format!("Error: failed to parse '{from_raw}' to int"));
    };
    let Ok(to) = to_raw.parse::<u32>() else {
        return text_response(400, &format!("Error: failed to parse '{to_raw}' to int"));
    };

    let entries = match listing::enumerate_annotations(&config.dataset_dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!("failed to enumerate dataset: {err}");
            return text_response(500, "Error: failed to enumerate the dataset directory");
        }
    };
    let mut files_to_send = Vec::new();
    for entry in entries {
        if entry.index < from {
            continue;
        }
        if entry.index > to {
            break;
        }
        let annotation = listing::annotation_path(&config.dataset_dir, &entry.item_id);
        match listing::find_related_image(&annotation) {
            Some(image) => {
                files_to_send.push(annotation);
                files_to_send.push(image);
            }
            None => {
                warn!(
                    "Warning: Failed to find related image to '{}'",
                    annotation.display()
                );
            }
        }
    }
    zip_files_response(&files_to_send)
}

fn handle_latest_weights(config: &ServerConfig) -> HttpResponse {
    match checkpoints::find_latest_weights(&config.weights_dir) {
        Ok(Some(path)) => zip_files_response(&[path]),
        // 204 tells the trainer "no checkpoint uploaded yet, start fresh"
        Ok(None) => tiny_http::Response::from_data(Vec::new()).with_status_code(204),
        Err(err) => {
            warn!("failed to inspect weights directory: {err}");
            text_response(500, "Error: failed to inspect the weights directory")
        }
    }
}

fn handle_upload(config: &ServerConfig, request: &mut tiny_http::Request) -> HttpResponse {
    let content_type = request
        .headers()
        .iter()
        .find(|header| header.field.equiv("Content-Type"))
        .map(|header| header.value.as_str().to_string());
    let Some(content_type) = content_type else {
        return text_response(400, "Error: upload requires a multipart content type");
    };
    let mut body = Vec::new();
    if let Err(err) = request.as_reader().read_to_end(&mut body) {
        warn!("failed to read upload body: {err}");
        return text_response(400, "Error: failed to read request body");
    }
    let parts = match multipart::parse(&content_type, &body) {
        Ok(parts) => parts,
        Err(err) => {
            warn!("rejecting upload: {err}");
            return text_response(400, "Error: malformed multipart body");
        }
    };
    let mut stored_any = false;
    for part in parts {
        let Some(filename) = part.filename.as_deref() else {
            warn!("ignoring upload part '{}' without a filename", part.name);
            continue;
        };
        info!(
            "/upload invoked with name: '{}', filename: '{}', num bytes: {}",
            part.name,
            filename,
            part.data.len()
        );
        if let Err(err) = store_artifact(config, filename, &part.data) {
            warn!("failed to store '{filename}': {err}");
        } else {
            stored_any = true;
        }
    }
    if !stored_any {
        warn!("Received post request, but not handled.");
    }
    text_response(200, "Content received")
}

/// Route an uploaded file by suffix and write it through a temp-then-rename
/// so readers never observe a half-written artifact.
fn store_artifact(config: &ServerConfig, filename: &str, data: &[u8]) -> std::io::Result<()> {
    let Some(base) = Path::new(filename).file_name().and_then(|name| name.to_str()) else {
        warn!("dropping upload with unusable filename '{filename}'");
        return Ok(());
    };
    let dest = if base.ends_with(&format!(".{WEIGHTS_EXTENSION}")) {
        config.weights_dir.join(base)
    } else if base.ends_with(&format!(".{CHART_EXTENSION}")) {
        config.chart_path.clone()
    } else {
        info!("don't know what to do with '{base}', dropping it");
        return Ok(());
    };
    write_atomic(&dest, data)?;
    info!("'{}' written.", dest.display());
    Ok(())
}

fn write_atomic(dest: &Path, data: &[u8]) -> std::io::Result<()> {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(data)?;
    temp.persist(dest).map_err(|err| err.error)?;
    Ok(())
}

fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then_some(value)
    })
}

fn text_response(status: u16, body: &str) -> HttpResponse {
    tiny_http::Response::from_string(body).with_status_code(status)
}

fn zip_files_response(files: &[PathBuf]) -> HttpResponse {
    let temp = match tempfile::NamedTempFile::new() {
        Ok(temp) => temp,
        Err(err) => {
            warn!("failed to create scratch archive: {err}");
            return text_response(500, "Error: failed to zip images of given range");
        }
    };
    if let Err(err) = archive::pack(temp.path(), files) {
        warn!("failed to pack archive: {err}");
        return text_response(500, "Error: failed to zip images of given range");
    }
    let bytes = match fs::read(temp.path()) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!("failed to read scratch archive: {err}");
            return text_response(500, "Error: failed to zip images of given range");
        }
    };
    let mut response = tiny_http::Response::from_data(bytes);
    if let Ok(header) = "Content-Type: application/zip".parse::<tiny_http::Header>() {
        response = response.with_header(header);
    }
    response
}
