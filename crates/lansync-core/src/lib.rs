//! # lansync-core
//!
//! Shared library for LanSync containing the request/response wire codec,
//! the out-of-band credential bundle codec, certificate fingerprints, and the
//! LAN discovery datagrams.
//!
//! This crate is used by both the holder and consumer applications.
//! It has zero dependencies on sockets, TLS stacks, or the async runtime.
//!
//! # Architecture overview (for beginners)
//!
//! LanSync copies a large structured dataset from one installation (the
//! *holder*) to another (the *consumer*) on the same local network.  Trust is
//! bootstrapped by a human: the holder displays a short-lived credential
//! bundle, the consumer scans or types it, and from then on every request is
//! authenticated with a bearer token over a TLS channel pinned to the
//! holder's certificate.
//!
//! This crate (`lansync-core`) is the shared foundation.  It defines:
//!
//! - **`wire`** – How requests and responses travel over the TLS stream.  A
//!   minimal HTTP/1.1-shaped frame: request line, header block, and a body
//!   whose length is always known up front.
//!
//! - **`bundle`** – The pairing bundle (host, port, fingerprint, code,
//!   expiry) and its deterministic, displayable string encoding.
//!
//! - **`discovery`** – The UDP datagrams the holder and consumer exchange to
//!   find each other without manual IP configuration.
//!
//! - **`api`** – Route paths, paging limits, and the JSON bodies carried on
//!   each endpoint.

pub mod api;
pub mod bundle;
pub mod clock;
pub mod discovery;
pub mod fingerprint;
pub mod wire;

// Re-export the most-used types at the crate root so callers can write
// `lansync_core::WireRequest` instead of `lansync_core::wire::message::WireRequest`.
pub use bundle::{BundleError, CredentialBundle};
pub use clock::{Clock, ManualClock, SystemClock};
pub use discovery::{DiscoveryMessage, SERVICE_TYPE};
pub use fingerprint::{Fingerprint, FingerprintError};
pub use wire::codec::{encode_request, encode_response, parse_request, parse_response, Parse, WireError};
pub use wire::message::{Headers, Method, StatusCode, WireRequest, WireResponse};
