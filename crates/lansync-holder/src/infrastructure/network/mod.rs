//! Network infrastructure for the holder.
//!
//! # Sub-modules
//!
//! - **`server`** – The TLS transport server.  Accepts connections, reads one
//!   request each, hands it to the router, and writes the response back.
//!   Tracks every open connection so `stop()` can cut them all.
//!
//! - **`advertiser`** – Answers UDP discovery queries so consumers on the
//!   same network can find the server without typing an IP address.
//!
//! - **`local_addr`** – Chooses which of the machine's addresses goes into
//!   the credential bundle.

pub mod advertiser;
pub mod local_addr;
pub mod server;
