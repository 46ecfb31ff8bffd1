//! Application layer use cases for the holder.
//!
//! # What is the "application" layer? (for beginners)
//!
//! The application layer holds the rules of the holder without knowing how
//! bytes reach it.  Nothing here opens a socket or a file directly; storage
//! and the dataset are reached through traits, so tests can drive every rule
//! in memory.
//!
//! # Sub-modules
//!
//! - **`credentials`** – Pairing codes, session tokens, and the device
//!   registry.  The security-critical part of the holder.
//!
//! - **`router`** – Maps each request to its endpoint handler and enforces
//!   the token and lock checks.
//!
//! - **`sharing`** – Packages a fresh code into the bundle the operator
//!   displays.
//!
//! - **`data_source`**, **`lock`**, **`audit`** – The seams to the on-device
//!   dataset, the device lock state, and the audit trail.

pub mod audit;
pub mod credentials;
pub mod data_source;
pub mod lock;
pub mod router;
pub mod sharing;
