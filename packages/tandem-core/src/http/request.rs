//! Incremental HTTP/1.x request-head parser.
//!
//! Only the request line and headers are parsed; request bodies are not
//! supported (every route is a `GET`).

use std::borrow::Cow;

use percent_encoding::percent_decode_str;

use crate::protocol_constants::HTTP_MAX_REQUEST_HEAD;

/// A parsed request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    /// Percent-decoded path without the query string.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub version: String,
}

impl Request {
    /// First value of a query parameter.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// First value of a header (ASCII case-insensitive name).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Byte range requested by a `Range: bytes=start-[end]` header.
    ///
    /// Suffix ranges (`bytes=-N`) and multi-range requests are not supported
    /// and read as no range at all.
    pub fn byte_range(&self) -> Option<(u64, Option<u64>)> {
        let spec = self.header("range")?.trim();
        let spec = spec
            .get(..6)
            .filter(|unit| unit.eq_ignore_ascii_case("bytes="))
            .map(|_| &spec[6..])?;
        if spec.contains(',') {
            return None;
        }
        let (start, end) = spec.split_once('-')?;
        let start = start.trim().parse().ok()?;
        let end = match end.trim() {
            "" => None,
            end => Some(end.parse::<u64>().ok().filter(|&e| e >= start)?),
        };
        Some((start, end))
    }
}

/// Result of feeding bytes to the parser.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseStatus {
    /// The head is not complete yet.
    Incomplete,
    Complete(Request),
    /// The head is syntactically invalid.
    Invalid(&'static str),
    /// The head exceeds the size limit without terminating.
    TooLarge,
}

/// Accumulates bytes until a complete request head is available.
#[derive(Debug, Default)]
pub struct RequestParser {
    buf: Vec<u8>,
    done: bool,
}

impl RequestParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes and tries to parse. After a terminal status, further
    /// input is ignored and reported as [`ParseStatus::Incomplete`].
    pub fn push(&mut self, bytes: &[u8]) -> ParseStatus {
        if self.done {
            return ParseStatus::Incomplete;
        }
        self.buf.extend_from_slice(bytes);

        let Some(end) = find_head_end(&self.buf) else {
            if self.buf.len() > HTTP_MAX_REQUEST_HEAD {
                self.done = true;
                return ParseStatus::TooLarge;
            }
            return ParseStatus::Incomplete;
        };
        self.done = true;
        if end > HTTP_MAX_REQUEST_HEAD {
            return ParseStatus::TooLarge;
        }

        let Ok(head) = std::str::from_utf8(&self.buf[..end]) else {
            return ParseStatus::Invalid("request head is not UTF-8");
        };
        match parse_head(head) {
            Ok(request) => ParseStatus::Complete(request),
            Err(reason) => ParseStatus::Invalid(reason),
        }
    }
}

/// Index just before the blank line ending the head.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .or_else(|| buf.windows(2).position(|w| w == b"\n\n"))
}

fn parse_head(head: &str) -> Result<Request, &'static str> {
    let mut lines = head.lines();
    let request_line = lines.next().ok_or("empty request")?;

    let mut parts = request_line.split_ascii_whitespace();
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err("malformed request line");
    };
    if !version.starts_with("HTTP/") {
        return Err("unsupported protocol");
    }
    if !target.starts_with('/') {
        return Err("request target must be an absolute path");
    }

    let (raw_path, raw_query) = target.split_once('?').unwrap_or((target, ""));
    let path = percent_decode_str(raw_path)
        .decode_utf8()
        .map_err(|_| "path is not UTF-8")?;
    let query = url::form_urlencoded::parse(raw_query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let mut headers = Vec::new();
    for line in lines {
        let (name, value) = line.split_once(':').ok_or("malformed header")?;
        let name = name.trim();
        if name.is_empty() {
            return Err("malformed header");
        }
        headers.push((name.to_string(), value.trim().to_string()));
    }

    Ok(Request {
        method: method.to_string(),
        path: Cow::into_owned(path),
        query,
        headers,
        version: version.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Request {
        match RequestParser::new().push(raw.as_bytes()) {
            ParseStatus::Complete(request) => request,
            other => panic!("expected complete request, got {other:?}"),
        }
    }

    #[test]
    fn parses_split_request_head() {
        let mut parser = RequestParser::new();
        assert_eq!(parser.push(b"GET /status?player=00%3A04"), ParseStatus::Incomplete);
        assert_eq!(parser.push(b" HTTP/1.0\r\nHost: x\r\n"), ParseStatus::Incomplete);
        let ParseStatus::Complete(request) = parser.push(b"\r\n") else {
            panic!("expected complete request");
        };
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/status");
        assert_eq!(request.query_param("player"), Some("00:04"));
        assert_eq!(request.header("HOST"), Some("x"));
        assert_eq!(request.version, "HTTP/1.0");
    }

    #[test]
    fn decodes_path_and_query() {
        let request = parse("GET /html/My%20Page.html?group=living+room HTTP/1.1\r\n\r\n");
        assert_eq!(request.path, "/html/My Page.html");
        assert_eq!(request.query_param("group"), Some("living room"));
        assert_eq!(request.query_param("missing"), None);
    }

    #[test]
    fn accepts_bare_newlines() {
        let request = parse("GET / HTTP/1.0\nRange: bytes=10-\n\n");
        assert_eq!(request.byte_range(), Some((10, None)));
    }

    #[test]
    fn rejects_malformed_heads() {
        for raw in [
            "GET\r\n\r\n",
            "GET / FTP/1.0\r\n\r\n",
            "GET relative HTTP/1.0\r\n\r\n",
            "GET / HTTP/1.0\r\nno colon here\r\n\r\n",
        ] {
            assert!(
                matches!(RequestParser::new().push(raw.as_bytes()), ParseStatus::Invalid(_)),
                "{raw:?}"
            );
        }
    }

    #[test]
    fn oversized_head_is_rejected() {
        let mut parser = RequestParser::new();
        let filler = vec![b'a'; HTTP_MAX_REQUEST_HEAD + 1];
        assert_eq!(parser.push(&filler), ParseStatus::TooLarge);
        // Terminal: nothing after that is parsed.
        assert_eq!(parser.push(b"\r\n\r\n"), ParseStatus::Incomplete);
    }

    #[test]
    fn byte_ranges() {
        let with_range = |value: &str| {
            parse(&format!("GET /stream.mp3 HTTP/1.0\r\nRange: {value}\r\n\r\n")).byte_range()
        };
        assert_eq!(with_range("bytes=100-"), Some((100, None)));
        assert_eq!(with_range("bytes=100-199"), Some((100, Some(199))));
        assert_eq!(with_range("BYTES=5-"), Some((5, None)));
        assert_eq!(with_range("bytes=-500"), None);
        assert_eq!(with_range("bytes=0-1,5-6"), None);
        assert_eq!(with_range("bytes=9-3"), None);
        assert_eq!(with_range("items=1-"), None);
    }
}
