//! Infrastructure layer for the consumer.
//!
//! Contains OS-facing adapters: UDP discovery, the pinned TLS transport, and
//! the pairing record on disk.

pub mod network;
pub mod storage;
