//! Blocking HTTP transfers between the trainer and the data host.
//!
//! Downloads go through a temporary sibling file and an atomic rename so a
//! reader never observes partial content. A 204 response is reported as
//! [`DownloadOutcome::NoContent`] rather than an error; every other non-2xx
//! status is a hard failure. Nothing here retries — retry policy belongs to
//! the caller.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::multipart;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Minimum interval between two progress log lines for one transfer.
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("http error: {0}")]
    Http(String),
    #[error("server returned status {0}")]
    Status(u16),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("destination already exists: {0}")]
    DestinationExists(PathBuf),
    #[error("not an uploadable file: {0}")]
    NotAFile(PathBuf),
}

/// Observational transfer progress carried through a callback, never stored.
#[derive(Debug, Clone, Copy)]
pub struct TransferProgress {
    /// Bytes written to the destination so far.
    pub bytes_written: u64,
    /// Expected total, when the server sent a `Content-Length`.
    pub total: Option<u64>,
    /// Bytes received so far, mirroring `bytes_written` for streamed bodies.
    pub now: Option<u64>,
}

/// Outcome of a download that completed without a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// The body was written out; carries the number of bytes transferred.
    Complete(u64),
    /// The server answered 204 "no data yet"; the destination was not touched.
    NoContent,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DownloadOptions {
    /// Replace an existing destination file instead of failing.
    pub overwrite: bool,
    /// Downgrade progress log lines to debug level.
    pub silent: bool,
}

/// Return a shared HTTP agent with consistent timeouts.
pub(crate) fn agent() -> &'static ureq::Agent {
    static AGENT: OnceLock<ureq::Agent> = OnceLock::new();
    AGENT.get_or_init(|| {
        ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout_read(READ_TIMEOUT)
            .timeout_write(WRITE_TIMEOUT)
            .build()
    })
}

/// Download `url` into `dest`, writing through a temporary sibling path.
///
/// On success the temporary file is renamed over `dest`. On failure the
/// partial temporary file is removed and `dest` is left untouched (when
/// `overwrite` was requested the prior file has already been deleted).
pub fn download_to_file(
    url: &str,
    dest: &Path,
    options: &DownloadOptions,
    mut progress: Option<&mut dyn FnMut(&TransferProgress)>,
) -> Result<DownloadOutcome, TransportError> {
    let temp_path = temp_sibling(dest);
    if temp_path.exists() {
        fs::remove_file(&temp_path)?;
    }
    if dest.exists() {
        if !options.overwrite {
            return Err(TransportError::DestinationExists(dest.to_path_buf()));
        }
        fs::remove_file(dest)?;
    }
    if let Some(parent) = dest.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let response = match agent().get(url).call() {
        Ok(response) => response,
        Err(ureq::Error::Status(code, _)) => return Err(TransportError::Status(code)),
        Err(err) => return Err(TransportError::Http(err.to_string())),
    };
    if response.status() == 204 {
        return Ok(DownloadOutcome::NoContent);
    }

    let total = content_length(&response);
    let mut file = File::create(&temp_path)?;
    let copied = copy_body(url, response, &mut file, total, options.silent, progress.as_mut());
    drop(file);
    let bytes = match copied {
        Ok(bytes) => bytes,
        Err(err) => {
            let _ = fs::remove_file(&temp_path);
            return Err(err.into());
        }
    };
    fs::rename(&temp_path, dest)?;
    Ok(DownloadOutcome::Complete(bytes))
}

/// Download `url` into memory. Returns `None` when the server answered 204.
pub fn download_to_vec(url: &str) -> Result<Option<Vec<u8>>, TransportError> {
    let response = match agent().get(url).call() {
        Ok(response) => response,
        Err(ureq::Error::Status(code, _)) => return Err(TransportError::Status(code)),
        Err(err) => return Err(TransportError::Http(err.to_string())),
    };
    if response.status() == 204 {
        return Ok(None);
    }
    let mut bytes = Vec::new();
    response.into_reader().read_to_end(&mut bytes)?;
    Ok(Some(bytes))
}

/// Upload one file as a single multipart POST. No chunking, no resume.
pub fn upload(url: &str, file_path: &Path, field_name: &str) -> Result<(), TransportError> {
    if !file_path.is_file() {
        return Err(TransportError::NotAFile(file_path.to_path_buf()));
    }
    let filename = file_path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| TransportError::NotAFile(file_path.to_path_buf()))?;
    let data = fs::read(file_path)?;
    let form = multipart::encode(field_name, filename, &data);
    match agent()
        .post(url)
        .set("Content-Type", &form.content_type)
        .send_bytes(&form.body)
    {
        Ok(_) => {
            debug!(url, filename, bytes = data.len(), "upload complete");
            Ok(())
        }
        Err(ureq::Error::Status(code, _)) => Err(TransportError::Status(code)),
        Err(err) => Err(TransportError::Http(err.to_string())),
    }
}

fn copy_body(
    url: &str,
    response: ureq::Response,
    writer: &mut impl Write,
    total: Option<u64>,
    silent: bool,
    mut progress: Option<&mut &mut dyn FnMut(&TransferProgress)>,
) -> Result<u64, std::io::Error> {
    let mut reader = response.into_reader();
    let mut buf = [0u8; 64 * 1024];
    let mut bytes_written: u64 = 0;
    let mut last_logged: Option<Instant> = None;
    loop {
        let read = reader.read(&mut buf)?;
        if read == 0 {
            break;
        }
        writer.write_all(&buf[..read])?;
        bytes_written += read as u64;
        let snapshot = TransferProgress {
            bytes_written,
            total,
            now: Some(bytes_written),
        };
        if let Some(callback) = progress.as_mut() {
            callback(&snapshot);
        }
        let due = last_logged.is_none_or(|at| at.elapsed() >= PROGRESS_LOG_INTERVAL);
        if due {
            last_logged = Some(Instant::now());
            log_progress(url, &snapshot, silent);
        }
    }
    Ok(bytes_written)
}

fn log_progress(url: &str, progress: &TransferProgress, silent: bool) {
    let mb = progress.bytes_written / 1_000_000;
    match progress.total {
        Some(total) if total > 0 => {
            let percent = progress.bytes_written as f64 / total as f64 * 100.0;
            if silent {
                debug!(url, "downloaded {mb} mb ({percent:.0}%)");
            } else {
                info!(url, "downloaded {mb} mb ({percent:.0}%)");
            }
        }
        _ => {
            if silent {
                debug!(url, "downloaded {mb} mb");
            } else {
                info!(url, "downloaded {mb} mb");
            }
        }
    }
}

fn content_length(response: &ureq::Response) -> Option<u64> {
    let header = response.header("Content-Length")?;
    match header.parse::<u64>() {
        Ok(length) => Some(length),
        Err(_) => {
            warn!("ignoring unparsable Content-Length '{header}'");
            None
        }
    }
}

fn temp_sibling(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| OsString::from("download"));
    name.push(".part");
    dest.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;
    use tempfile::tempdir;

    fn serve_once(response: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf);
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{}", addr)
    }

    /// Serve one request and hand its raw bytes (headers + body) to the test.
    fn serve_once_capturing(response: String) -> (String, mpsc::Receiver<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut captured = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    let read = stream.read(&mut buf).unwrap_or(0);
                    if read == 0 {
                        break;
                    }
                    captured.extend_from_slice(&buf[..read]);
                    if request_is_complete(&captured) {
                        break;
                    }
                }
                let _ = stream.write_all(response.as_bytes());
                let _ = tx.send(captured);
            }
        });
        (format!("http://{}", addr), rx)
    }

    fn request_is_complete(bytes: &[u8]) -> bool {
        let Some(header_end) = bytes.windows(4).position(|w| w == b"\r\n\r\n") else {
            return false;
        };
        let headers = String::from_utf8_lossy(&bytes[..header_end]);
        let content_length = headers
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())?
            })
            .unwrap_or(0);
        bytes.len() >= header_end + 4 + content_length
    }

    #[test]
    fn download_to_vec_returns_body() {
        let url = serve_once("HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello".into());
        let bytes = download_to_vec(&url).unwrap();
        assert_eq!(bytes, Some(b"hello".to_vec()));
    }

    #[test]
    fn download_to_vec_classifies_204_as_no_data() {
        let url = serve_once("HTTP/1.1 204 No Content\r\n\r\n".into());
        let bytes = download_to_vec(&url).unwrap();
        assert_eq!(bytes, None);
    }

    #[test]
    fn download_to_vec_fails_on_error_status() {
        let url = serve_once("HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n".into());
        let err = download_to_vec(&url).unwrap_err();
        assert!(matches!(err, TransportError::Status(500)));
    }

    #[test]
    fn download_to_file_writes_atomically() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("payload.bin");
        let url = serve_once("HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\ndata".into());
        let outcome =
            download_to_file(&url, &dest, &DownloadOptions::default(), None).unwrap();
        assert_eq!(outcome, DownloadOutcome::Complete(4));
        assert_eq!(std::fs::read(&dest).unwrap(), b"data");
        assert!(!temp_sibling(&dest).exists());
    }

    #[test]
    fn download_to_file_refuses_existing_dest_without_overwrite() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("payload.bin");
        std::fs::write(&dest, b"old").unwrap();
        let url = serve_once("HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nnew".into());
        let err =
            download_to_file(&url, &dest, &DownloadOptions::default(), None).unwrap_err();
        assert!(matches!(err, TransportError::DestinationExists(_)));
        assert_eq!(std::fs::read(&dest).unwrap(), b"old");
    }

    #[test]
    fn download_to_file_overwrites_when_requested() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("payload.bin");
        std::fs::write(&dest, b"old").unwrap();
        let url = serve_once("HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nnew".into());
        let options = DownloadOptions {
            overwrite: true,
            silent: true,
        };
        download_to_file(&url, &dest, &options, None).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"new");
    }

    #[test]
    fn download_to_file_reports_progress() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("payload.bin");
        let url = serve_once("HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\ndata".into());
        let mut seen = Vec::new();
        let mut callback = |progress: &TransferProgress| seen.push(progress.bytes_written);
        download_to_file(&url, &dest, &DownloadOptions::default(), Some(&mut callback)).unwrap();
        assert_eq!(seen.last(), Some(&4));
    }

    #[test]
    fn upload_sends_multipart_body() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model_10.weights");
        std::fs::write(&path, b"weights-bytes").unwrap();
        let (url, rx) =
            serve_once_capturing("HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".into());
        upload(&url, &path, "data").unwrap();
        let request = rx.recv().unwrap();
        let text = String::from_utf8_lossy(&request);
        assert!(text.contains("POST / HTTP/1.1"));
        assert!(text.contains("multipart/form-data; boundary="));
        assert!(text.contains("name=\"data\""));
        assert!(text.contains("filename=\"model_10.weights\""));
        assert!(text.contains("weights-bytes"));
    }

    #[test]
    fn upload_rejects_missing_file() {
        let dir = tempdir().unwrap();
        let err = upload(
            "http://127.0.0.1:9/upload",
            &dir.path().join("absent.weights"),
            "data",
        )
        .unwrap_err();
        assert!(matches!(err, TransportError::NotAFile(_)));
    }

    #[test]
    fn upload_rejects_directory() {
        let dir = tempdir().unwrap();
        let err = upload("http://127.0.0.1:9/upload", dir.path(), "data").unwrap_err();
        assert!(matches!(err, TransportError::NotAFile(_)));
    }
}
