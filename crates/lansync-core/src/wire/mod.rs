//! Wire module containing request/response types and the framing codec.
//!
//! One request travels per connection.  The server reads until
//! [`codec::parse_request`] reports a complete frame, answers with a single
//! response, and closes.  There is no keep-alive and no chunked encoding.

pub mod codec;
pub mod message;

pub use codec::{encode_request, encode_response, parse_request, parse_response, Parse, WireError};
pub use message::{Headers, Method, StatusCode, WireRequest, WireResponse};
