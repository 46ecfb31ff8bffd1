//! Integration tests for request framing under partial reads.
//!
//! # Purpose
//!
//! A TLS stream hands the server bytes in arbitrary slices.  These tests feed
//! the codec the same frame in progressively larger prefixes, the way the
//! connection handler accumulates its buffer, and verify that the parser
//! reports `Incomplete` until the last byte arrives and then produces exactly
//! one request.

use lansync_core::wire::{encode_request, parse_request, Method, Parse, WireRequest};

/// Feeding every prefix of a frame must yield `Incomplete` for all proper
/// prefixes and `Complete` only for the full frame.
#[test]
fn test_prefixes_are_incomplete_until_last_byte() {
    // Arrange: a POST with a JSON body, so both the header terminator and the
    // body length matter.
    let req = WireRequest::post("/api/v1/pair")
        .with_json(&serde_json::json!({"code": "482913"}))
        .unwrap();
    let frame = encode_request(&req);

    // Act / Assert
    for end in 0..frame.len() {
        let parsed = parse_request(&frame[..end]).expect("prefix must not be an error");
        assert_eq!(parsed, Parse::Incomplete, "prefix of {end} bytes");
    }
    match parse_request(&frame).unwrap() {
        Parse::Complete { value, consumed } => {
            assert_eq!(value.method, Method::Post);
            assert_eq!(value.body, req.body);
            assert_eq!(consumed, frame.len());
        }
        Parse::Incomplete => panic!("full frame must parse"),
    }
}

/// Bytes after the declared body are not part of the request; `consumed`
/// tells the caller where the frame ended.
#[test]
fn test_trailing_bytes_are_not_consumed() {
    let mut frame = b"GET /status HTTP/1.1\r\n\r\n".to_vec();
    let frame_len = frame.len();
    frame.extend_from_slice(b"GET /extra HTTP/1.1\r\n\r\n");

    let Parse::Complete { value, consumed } = parse_request(&frame).unwrap() else {
        panic!("first frame must parse");
    };
    assert_eq!(value.path, "/status");
    assert_eq!(consumed, frame_len);
}

/// Header names are looked up case-insensitively, which is what the
/// `Authorization: Bearer` convention relies on.
#[test]
fn test_bearer_header_survives_any_case() {
    let raw = b"GET /health/types HTTP/1.1\r\nauthorization: bearer 0123abcd\r\n\r\n";
    let Parse::Complete { value, .. } = parse_request(raw).unwrap() else {
        panic!("frame must parse");
    };
    assert_eq!(value.headers.bearer_token(), Some("0123abcd"));
}
