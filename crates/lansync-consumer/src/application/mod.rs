//! Application layer use cases for the consumer.
//!
//! - **`sync_client`** – Pairing with a holder and paging through its data.
//!   The network is reached through the [`sync_client::Transport`] trait so
//!   every rule can be tested against a mock.

pub mod sync_client;
