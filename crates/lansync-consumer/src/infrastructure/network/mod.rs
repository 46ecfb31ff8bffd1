//! Network adapters for the consumer.
//!
//! - **`discovery`** – Finds holders: UDP queries, TCP probes, and the
//!   browser task that keeps the list.
//! - **`tls`** – The pinned TLS connector and the request transport built on
//!   it.

pub mod discovery;
pub mod tls;
