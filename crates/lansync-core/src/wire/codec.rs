//! Framing codec for LanSync requests and responses.
//!
//! Wire format (HTTP/1.1 subset):
//! ```text
//! <METHOD> <path>[?<query>] HTTP/1.1\r\n
//! <Name>: <value>\r\n
//! ...
//! \r\n
//! <body: Content-Length bytes>
//! ```
//!
//! The parsers are tolerant of partial reads: they return [`Parse::Incomplete`]
//! until the header block and the declared body are fully buffered, so the
//! caller can keep accumulating bytes from the socket.  Size limits are
//! enforced while accumulating so a peer cannot grow the buffer without bound.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::wire::message::{Headers, Method, StatusCode, WireRequest, WireResponse};

/// Largest accepted header block (request line + headers), in bytes.
pub const MAX_HEADER_SIZE: usize = 16 * 1024;

/// Largest accepted frame (headers + body), in bytes.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Largest accepted response frame on the consumer side.  Data pages carry up
/// to the maximum page of records, so responses get a larger allowance than
/// requests.
pub const MAX_RESPONSE_SIZE: usize = 64 * 1024 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Errors produced while parsing a frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// The header block exceeds [`MAX_HEADER_SIZE`].
    #[error("header block exceeds {limit} bytes")]
    HeaderTooLarge { limit: usize },

    /// The declared body would push the frame past the size limit.
    #[error("message of {declared} bytes exceeds limit of {limit}")]
    MessageTooLarge { declared: usize, limit: usize },

    /// The request line is not `<METHOD> <target> HTTP/1.x`.
    #[error("malformed request line: {0:?}")]
    MalformedRequestLine(String),

    /// The status line is not `HTTP/1.x <code> <reason>`.
    #[error("malformed status line: {0:?}")]
    MalformedStatusLine(String),

    /// A header line has no colon or an empty name.
    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),

    /// `Content-Length` is not a non-negative integer.
    #[error("invalid content-length: {0:?}")]
    InvalidContentLength(String),

    /// Chunked or any other transfer encoding.
    #[error("transfer-encoding is not supported")]
    UnsupportedTransferEncoding,

    /// Non-UTF-8 header bytes or an invalid percent escape.
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),
}

/// Outcome of feeding a buffer to a parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parse<T> {
    /// A full frame was decoded from the first `consumed` bytes.
    Complete { value: T, consumed: usize },
    /// More bytes are needed.
    Incomplete,
}

impl<T> Parse<T> {
    pub fn is_complete(&self) -> bool {
        matches!(self, Parse::Complete { .. })
    }
}

// ── Request side ──────────────────────────────────────────────────────────────

/// Parses one request from the beginning of `buf`.
///
/// # Errors
///
/// Returns [`WireError`] when the bytes can never form a valid request, or
/// when a size limit is exceeded.
///
/// # Examples
///
/// ```rust
/// use lansync_core::wire::{parse_request, Parse, Method};
///
/// let raw = b"GET /health/data?type=steps&limit=2 HTTP/1.1\r\nAuthorization: Bearer t\r\n\r\n";
/// let Parse::Complete { value, consumed } = parse_request(raw).unwrap() else {
///     panic!("frame should be complete");
/// };
/// assert_eq!(value.method, Method::Get);
/// assert_eq!(value.query_param("type"), Some("steps"));
/// assert_eq!(value.headers.bearer_token(), Some("t"));
/// assert_eq!(consumed, raw.len());
/// ```
pub fn parse_request(buf: &[u8]) -> Result<Parse<WireRequest>, WireError> {
    let Some((head, body_start)) = split_head(buf)? else {
        return Ok(Parse::Incomplete);
    };

    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let (method, target) = parse_request_line(request_line)?;
    let headers = parse_header_lines(lines)?;

    let (raw_path, raw_query) = match target.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (target, None),
    };
    let path = percent_decode(raw_path)?;
    let query = match raw_query {
        Some(q) => parse_query(q)?,
        None => BTreeMap::new(),
    };

    let body_len = declared_length(&headers)?.unwrap_or(0);
    check_frame_size(body_start, body_len, MAX_MESSAGE_SIZE)?;

    let frame_end = body_start + body_len;
    if buf.len() < frame_end {
        return Ok(Parse::Incomplete);
    }

    let body = (body_len > 0).then(|| buf[body_start..frame_end].to_vec());
    Ok(Parse::Complete {
        value: WireRequest {
            method,
            path,
            query,
            headers,
            body,
        },
        consumed: frame_end,
    })
}

/// Serializes a request frame.
///
/// Query parameters are percent-encoded in key order.  `Content-Length` and
/// `Connection: close` are always written by the codec and override any
/// caller-supplied value.
pub fn encode_request(req: &WireRequest) -> Vec<u8> {
    let mut target = req.path.clone();
    if !req.query.is_empty() {
        let query = req
            .query
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        target.push('?');
        target.push_str(&query);
    }

    let body = req.body.as_deref().unwrap_or_default();
    let mut out = format!("{} {} HTTP/1.1\r\n", req.method, target).into_bytes();
    write_headers(&mut out, &req.headers, body.len());
    out.extend_from_slice(body);
    out
}

// ── Response side ─────────────────────────────────────────────────────────────

/// Serializes a response frame.
///
/// # Examples
///
/// ```rust
/// use lansync_core::wire::{encode_response, StatusCode, WireResponse};
///
/// let bytes = encode_response(&WireResponse::error(StatusCode::NOT_FOUND, "nope"));
/// assert!(bytes.starts_with(b"HTTP/1.1 404 Not Found\r\n"));
/// ```
pub fn encode_response(resp: &WireResponse) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 {}\r\n", resp.status).into_bytes();
    write_headers(&mut out, &resp.headers, resp.body.len());
    out.extend_from_slice(&resp.body);
    out
}

/// Parses one response from the beginning of `buf`.
///
/// When the response carries no `Content-Length`, the body extends to the end
/// of the stream; pass `at_eof = true` once the peer has closed.
///
/// # Errors
///
/// Returns [`WireError`] for malformed frames or frames above
/// [`MAX_RESPONSE_SIZE`].
pub fn parse_response(buf: &[u8], at_eof: bool) -> Result<Parse<WireResponse>, WireError> {
    let Some((head, body_start)) = split_head(buf)? else {
        return Ok(Parse::Incomplete);
    };

    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let status = parse_status_line(status_line)?;
    let headers = parse_header_lines(lines)?;

    let frame_end = match declared_length(&headers)? {
        Some(len) => {
            check_frame_size(body_start, len, MAX_RESPONSE_SIZE)?;
            body_start + len
        }
        None if at_eof => buf.len(),
        None => {
            check_frame_size(body_start, buf.len() - body_start, MAX_RESPONSE_SIZE)?;
            return Ok(Parse::Incomplete);
        }
    };

    if buf.len() < frame_end {
        return Ok(Parse::Incomplete);
    }

    Ok(Parse::Complete {
        value: WireResponse {
            status,
            headers,
            body: buf[body_start..frame_end].to_vec(),
        },
        consumed: frame_end,
    })
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Locates the header terminator and returns the header block as text along
/// with the offset at which the body begins.
fn split_head(buf: &[u8]) -> Result<Option<(&str, usize)>, WireError> {
    let Some(pos) = find_subslice(buf, HEADER_TERMINATOR) else {
        if buf.len() > MAX_HEADER_SIZE {
            return Err(WireError::HeaderTooLarge {
                limit: MAX_HEADER_SIZE,
            });
        }
        return Ok(None);
    };
    if pos > MAX_HEADER_SIZE {
        return Err(WireError::HeaderTooLarge {
            limit: MAX_HEADER_SIZE,
        });
    }
    let head = std::str::from_utf8(&buf[..pos])
        .map_err(|e| WireError::InvalidEncoding(format!("header block is not UTF-8: {e}")))?;
    Ok(Some((head, pos + HEADER_TERMINATOR.len())))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn parse_request_line(line: &str) -> Result<(Method, &str), WireError> {
    let mut parts = line.split(' ').filter(|p| !p.is_empty());
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(WireError::MalformedRequestLine(line.to_string()));
    };
    if !version.starts_with("HTTP/1.") || !target.starts_with('/') {
        return Err(WireError::MalformedRequestLine(line.to_string()));
    }
    Ok((Method::parse(method), target))
}

fn parse_status_line(line: &str) -> Result<StatusCode, WireError> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    let code = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(WireError::MalformedStatusLine(line.to_string()));
    }
    code.parse::<u16>()
        .ok()
        .filter(|c| (100..600).contains(c))
        .map(StatusCode)
        .ok_or_else(|| WireError::MalformedStatusLine(line.to_string()))
}

fn parse_header_lines<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Headers, WireError> {
    let mut headers = Headers::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| WireError::MalformedHeader(line.to_string()))?;
        let name = name.trim();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(WireError::MalformedHeader(line.to_string()));
        }
        headers.insert(name, value.trim());
    }
    Ok(headers)
}

fn declared_length(headers: &Headers) -> Result<Option<usize>, WireError> {
    if headers.contains("transfer-encoding") {
        return Err(WireError::UnsupportedTransferEncoding);
    }
    headers
        .get("content-length")
        .map(|raw| {
            raw.parse::<usize>()
                .map_err(|_| WireError::InvalidContentLength(raw.to_string()))
        })
        .transpose()
}

fn check_frame_size(body_start: usize, body_len: usize, limit: usize) -> Result<(), WireError> {
    let declared = body_start.saturating_add(body_len);
    if declared > limit {
        return Err(WireError::MessageTooLarge { declared, limit });
    }
    Ok(())
}

fn parse_query(raw: &str) -> Result<BTreeMap<String, String>, WireError> {
    let mut query = BTreeMap::new();
    for pair in raw.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        query.insert(form_decode(key)?, form_decode(value)?);
    }
    Ok(query)
}

fn form_decode(raw: &str) -> Result<String, WireError> {
    percent_decode(&raw.replace('+', " "))
}

fn percent_decode(raw: &str) -> Result<String, WireError> {
    urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .map_err(|e| WireError::InvalidEncoding(format!("bad percent escape in {raw:?}: {e}")))
}

fn write_headers(out: &mut Vec<u8>, headers: &Headers, body_len: usize) {
    for (name, value) in headers.iter() {
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("connection") {
            continue;
        }
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    out.extend_from_slice(format!("Content-Length: {body_len}\r\n").as_bytes());
    out.extend_from_slice(b"Connection: close\r\n\r\n");
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn complete<T>(parsed: Parse<T>) -> (T, usize) {
        match parsed {
            Parse::Complete { value, consumed } => (value, consumed),
            Parse::Incomplete => panic!("expected a complete frame"),
        }
    }

    #[test]
    fn test_parse_request_without_terminator_is_incomplete() {
        // Arrange
        let raw = b"GET /status HTTP/1.1\r\nHost: x\r\n";

        // Act
        let result = parse_request(raw).unwrap();

        // Assert
        assert_eq!(result, Parse::Incomplete);
    }

    #[test]
    fn test_parse_request_waits_for_full_body() {
        let raw = b"POST /api/v1/pair HTTP/1.1\r\nContent-Length: 17\r\n\r\n{\"code\":\"48";
        assert_eq!(parse_request(raw).unwrap(), Parse::Incomplete);
    }

    #[test]
    fn test_parse_request_reads_body_and_reports_consumed() {
        // Arrange
        let raw = b"POST /api/v1/pair HTTP/1.1\r\nContent-Length: 17\r\n\r\n{\"code\":\"482913\"}";

        // Act
        let (req, consumed) = complete(parse_request(raw).unwrap());

        // Assert
        assert_eq!(req.method, Method::Post);
        assert_eq!(req.path, "/api/v1/pair");
        assert_eq!(req.body.as_deref(), Some(&b"{\"code\":\"482913\"}"[..]));
        assert_eq!(consumed, raw.len());
    }

    #[test]
    fn test_parse_request_decodes_query_parameters() {
        let raw = b"GET /health/data?type=heart%20rate&offset=10&note=a+b&flag HTTP/1.1\r\n\r\n";
        let (req, _) = complete(parse_request(raw).unwrap());
        assert_eq!(req.path, "/health/data");
        assert_eq!(req.query_param("type"), Some("heart rate"));
        assert_eq!(req.query_param("offset"), Some("10"));
        assert_eq!(req.query_param("note"), Some("a b"));
        assert_eq!(req.query_param("flag"), Some(""));
    }

    #[test]
    fn test_parse_request_without_body_has_none() {
        let (req, _) = complete(parse_request(b"GET /status HTTP/1.1\r\n\r\n").unwrap());
        assert!(req.body.is_none());
        assert!(req.query.is_empty());
    }

    #[test]
    fn test_parse_request_rejects_bad_request_line() {
        let result = parse_request(b"GARBAGE\r\n\r\n");
        assert!(matches!(result, Err(WireError::MalformedRequestLine(_))));
    }

    #[test]
    fn test_parse_request_rejects_relative_target() {
        let result = parse_request(b"GET status HTTP/1.1\r\n\r\n");
        assert!(matches!(result, Err(WireError::MalformedRequestLine(_))));
    }

    #[test]
    fn test_parse_request_rejects_header_without_colon() {
        let result = parse_request(b"GET /status HTTP/1.1\r\nbroken header\r\n\r\n");
        assert!(matches!(result, Err(WireError::MalformedHeader(_))));
    }

    #[test]
    fn test_parse_request_rejects_non_numeric_content_length() {
        let result = parse_request(b"POST /x HTTP/1.1\r\nContent-Length: ten\r\n\r\n");
        assert_eq!(
            result,
            Err(WireError::InvalidContentLength("ten".to_string()))
        );
    }

    #[test]
    fn test_parse_request_rejects_chunked_encoding() {
        let result = parse_request(b"POST /x HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n");
        assert_eq!(result, Err(WireError::UnsupportedTransferEncoding));
    }

    #[test]
    fn test_parse_request_rejects_oversized_declared_body() {
        let raw = format!(
            "POST /x HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
            MAX_MESSAGE_SIZE
        );
        let result = parse_request(raw.as_bytes());
        assert!(matches!(result, Err(WireError::MessageTooLarge { .. })));
    }

    #[test]
    fn test_parse_request_rejects_unterminated_oversized_headers() {
        let mut raw = b"GET /status HTTP/1.1\r\nX-Pad: ".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_HEADER_SIZE));
        let result = parse_request(&raw);
        assert_eq!(
            result,
            Err(WireError::HeaderTooLarge {
                limit: MAX_HEADER_SIZE
            })
        );
    }

    #[test]
    fn test_encode_response_writes_length_and_close() {
        // Arrange
        let resp = WireResponse::json(StatusCode::OK, &serde_json::json!({"ok": true}));

        // Act
        let bytes = encode_response(&resp);
        let text = String::from_utf8(bytes).unwrap();

        // Assert
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 11\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\n{\"ok\":true}"));
    }

    #[test]
    fn test_encode_response_ignores_caller_content_length() {
        let mut resp = WireResponse::new(StatusCode::OK);
        resp.headers.insert("Content-Length", "999");
        resp.body = b"abc".to_vec();
        let text = String::from_utf8(encode_response(&resp)).unwrap();
        assert!(text.contains("Content-Length: 3\r\n"));
        assert!(!text.contains("999"));
    }

    #[test]
    fn test_encoded_request_parses_back_with_same_query() {
        // Arrange
        let req = WireRequest::get("/health/data")
            .with_query("type", "heart rate")
            .with_query("offset", 0)
            .with_bearer("tok");

        // Act
        let bytes = encode_request(&req);
        let (parsed, _) = complete(parse_request(&bytes).unwrap());

        // Assert
        assert_eq!(parsed.query, req.query);
        assert_eq!(parsed.headers.bearer_token(), Some("tok"));
    }

    #[test]
    fn test_parse_response_reads_declared_body() {
        let raw = b"HTTP/1.1 401 Unauthorized\r\nContent-Length: 2\r\n\r\n{}";
        let (resp, consumed) = complete(parse_response(raw, false).unwrap());
        assert_eq!(resp.status, StatusCode::UNAUTHORIZED);
        assert_eq!(resp.body, b"{}");
        assert_eq!(consumed, raw.len());
    }

    #[test]
    fn test_parse_response_without_length_reads_to_eof() {
        let raw = b"HTTP/1.1 200 OK\r\n\r\nhello";
        assert_eq!(parse_response(raw, false).unwrap(), Parse::Incomplete);
        let (resp, _) = complete(parse_response(raw, true).unwrap());
        assert_eq!(resp.body, b"hello");
    }

    #[test]
    fn test_parse_response_rejects_bad_status_line() {
        let result = parse_response(b"HTTP/1.1 abc Nope\r\n\r\n", true);
        assert!(matches!(result, Err(WireError::MalformedStatusLine(_))));
    }
}
