//! Atomic key-value storage for payment-channel state.
//!
//! Several daemon processes share one store and use it to update channel
//! records consistently. Each module focuses on a concrete responsibility:
//!
//! - [`config`] reads the JSON settings for the client and the store node.
//! - [`protocol`] is the JSON line protocol between clients and nodes.
//! - [`node`] runs a store node: the worker owning the key space, its
//!   listeners, lease expiry and the on-disk snapshot.
//! - [`client`] talks to a node: reads, writes, compare-and-swap,
//!   transactions, lease sessions and the distributed mutex.
//! - [`channel`] stores typed payment-channel records through the client.
//! - [`cli`] parses the command line of the `channel-storage` binary.
//!
//! Integration tests start real nodes on ephemeral ports and drive them
//! through this crate's public API.

pub mod channel;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod node;
pub mod protocol;
