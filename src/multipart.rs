//! Minimal `multipart/form-data` encoding and parsing.
//!
//! One shared implementation serves both sides of the wire: the trainer's
//! uploader encodes with [`encode`] and the data host's `/upload` handler
//! decodes with [`parse`].

use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, thiserror::Error)]
pub enum MultipartError {
    #[error("missing multipart boundary in content type '{0}'")]
    MissingBoundary(String),
    #[error("malformed multipart body: {0}")]
    Malformed(&'static str),
}

/// A ready-to-send form body plus its `Content-Type` header value.
#[derive(Debug, Clone)]
pub struct EncodedForm {
    pub content_type: String,
    pub body: Vec<u8>,
}

/// One decoded part of a multipart body.
#[derive(Debug, Clone)]
pub struct Part {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

/// Encode a single file part as a complete multipart body.
pub fn encode(field_name: &str, filename: &str, data: &[u8]) -> EncodedForm {
    let boundary = fresh_boundary();
    let mut body = Vec::with_capacity(data.len() + 256);
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{field_name}\"; filename=\"{filename}\"\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    EncodedForm {
        content_type: format!("multipart/form-data; boundary={boundary}"),
        body,
    }
}

/// Decode every part of a multipart body.
pub fn parse(content_type: &str, body: &[u8]) -> Result<Vec<Part>, MultipartError> {
    let boundary = boundary_from_content_type(content_type)
        .ok_or_else(|| MultipartError::MissingBoundary(content_type.to_string()))?;
    let delimiter = format!("--{boundary}");
    let delimiter = delimiter.as_bytes();

    let mut parts = Vec::new();
    let mut pos = find(body, delimiter, 0).ok_or(MultipartError::Malformed("no opening boundary"))?
        + delimiter.len();
    loop {
        if body[pos..].starts_with(b"--") {
            break;
        }
        if !body[pos..].starts_with(b"\r\n") {
            return Err(MultipartError::Malformed("boundary not followed by CRLF"));
        }
        pos += 2;
        let header_end = find(body, b"\r\n\r\n", pos)
            .ok_or(MultipartError::Malformed("part without header terminator"))?;
        let headers = std::str::from_utf8(&body[pos..header_end])
            .map_err(|_| MultipartError::Malformed("part headers are not utf-8"))?;
        let data_start = header_end + 4;
        let next = find(body, delimiter, data_start)
            .ok_or(MultipartError::Malformed("unterminated part"))?;
        if next < data_start + 2 || &body[next - 2..next] != b"\r\n" {
            return Err(MultipartError::Malformed("part data not CRLF-terminated"));
        }
        parts.push(build_part(headers, body[data_start..next - 2].to_vec())?);
        pos = next + delimiter.len();
    }
    Ok(parts)
}

/// Extract the boundary token from a `Content-Type` header value.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    for param in content_type.split(';').map(str::trim) {
        if let Some(value) = param.strip_prefix("boundary=") {
            let value = value.trim_matches('"');
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

fn build_part(headers: &str, data: Vec<u8>) -> Result<Part, MultipartError> {
    let mut name = None;
    let mut filename = None;
    let mut content_type = None;
    for line in headers.lines() {
        let Some((header, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if header.eq_ignore_ascii_case("content-disposition") {
            for param in value.split(';').map(str::trim) {
                if let Some(v) = param.strip_prefix("name=") {
                    name = Some(v.trim_matches('"').to_string());
                } else if let Some(v) = param.strip_prefix("filename=") {
                    filename = Some(v.trim_matches('"').to_string());
                }
            }
        } else if header.eq_ignore_ascii_case("content-type") {
            content_type = Some(value.to_string());
        }
    }
    let name = name.ok_or(MultipartError::Malformed("part without a field name"))?;
    Ok(Part {
        name,
        filename,
        content_type,
        data,
    })
}

fn fresh_boundary() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or(0);
    format!("trainlink-{nanos:032x}")
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|offset| from + offset)
}
