//! Infrastructure layer for the holder.
//!
//! Contains OS-facing adapters: the TLS identity on disk, network sockets,
//! and file-system storage.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `lansync_core`, but MUST NOT be imported by the `application` layer.

pub mod identity;
pub mod network;
pub mod storage;
