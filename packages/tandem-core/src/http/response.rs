//! Response-head construction and canned responses.

use std::fmt::Write as _;
use std::path::Path;

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

use crate::error::{ErrorBody, TandemError};

/// Status line plus headers. Every response is `Connection: close`.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    status: u16,
    headers: Vec<(&'static str, String)>,
}

impl ResponseHead {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn content_type(self, mime: &str) -> Self {
        self.header("Content-Type", mime)
    }

    pub fn content_length(self, len: u64) -> Self {
        self.header("Content-Length", len.to_string())
    }

    pub fn encode(&self) -> Bytes {
        let mut head = format!("HTTP/1.0 {} {}\r\n", self.status, reason_phrase(self.status));
        for (name, value) in &self.headers {
            let _ = write!(head, "{name}: {value}\r\n");
        }
        head.push_str("Connection: close\r\n\r\n");
        Bytes::from(head)
    }
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        206 => "Partial Content",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        416 => "Range Not Satisfiable",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

/// Content type for a static file, by extension.
pub fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("txt") => "text/plain; charset=utf-8",
        Some("mp3") => "audio/mpeg",
        Some("flac") => "audio/flac",
        Some("wav") => "audio/wav",
        _ => "application/octet-stream",
    }
}

/// Complete response (head and body) in one buffer.
pub fn with_body(head: ResponseHead, body: &[u8]) -> Bytes {
    let head = head.content_length(body.len() as u64).encode();
    let mut out = BytesMut::with_capacity(head.len() + body.len());
    out.put_slice(&head);
    out.put_slice(body);
    out.freeze()
}

/// JSON response. Serialization failure becomes a 500.
pub fn json<T: Serialize>(status: u16, value: &T) -> Bytes {
    match serde_json::to_vec(value) {
        Ok(body) => with_body(
            ResponseHead::new(status).content_type("application/json"),
            &body,
        ),
        Err(e) => error(&TandemError::Internal(e.to_string())),
    }
}

/// JSON error body with the error's status code.
pub fn error(err: &TandemError) -> Bytes {
    let body = ErrorBody::from(err);
    let json = serde_json::to_vec(&body).unwrap_or_default();
    with_body(
        ResponseHead::new(err.http_status()).content_type("application/json"),
        &json,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(response: &Bytes) -> (String, Vec<u8>) {
        let text = std::str::from_utf8(response).unwrap();
        let (head, body) = text.split_once("\r\n\r\n").unwrap();
        (head.to_string(), body.as_bytes().to_vec())
    }

    #[test]
    fn head_lists_headers_then_connection_close() {
        let head = ResponseHead::new(206)
            .content_type("audio/mpeg")
            .header("Content-Range", "bytes 10-19/20")
            .encode();
        assert_eq!(
            std::str::from_utf8(&head).unwrap(),
            "HTTP/1.0 206 Partial Content\r\n\
             Content-Type: audio/mpeg\r\n\
             Content-Range: bytes 10-19/20\r\n\
             Connection: close\r\n\r\n"
        );
    }

    #[test]
    fn json_sets_length_and_type() {
        let response = json(200, &serde_json::json!({ "ok": true }));
        let (head, body) = split(&response);
        assert!(head.starts_with("HTTP/1.0 200 OK"));
        assert!(head.contains("Content-Type: application/json"));
        assert!(head.contains(&format!("Content-Length: {}", body.len())));
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["ok"], true);
    }

    #[test]
    fn error_body_carries_code_and_status() {
        let response = error(&TandemError::GroupNotFound("den".into()));
        let (head, body) = split(&response);
        assert!(head.starts_with("HTTP/1.0 404 Not Found"));
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"], "group_not_found");
        assert_eq!(value["status"], 404);
        assert_eq!(value["message"], "Group not found: den");
    }

    #[test]
    fn mime_by_extension() {
        assert_eq!(mime_for(Path::new("index.HTML")), "text/html; charset=utf-8");
        assert_eq!(mime_for(Path::new("a/b.mp3")), "audio/mpeg");
        assert_eq!(mime_for(Path::new("noext")), "application/octet-stream");
    }
}
