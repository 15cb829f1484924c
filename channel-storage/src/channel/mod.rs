//! Payment-channel records stored through [`crate::client::StorageClient`].
//!
//! Every version of a channel lives under its own key,
//! `/payment-channel/<id>/<nonce>`, with both numbers zero-padded to 20
//! digits so that byte order of keys equals numeric order.

mod storage;
mod tracking;

pub use storage::{AtomicChannelStorage, PaymentChannelStorage};
pub use tracking::TrackingStorage;

use std::{fmt, time::SystemTime};

use bincode::Options;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

const KEY_PREFIX: &str = "/payment-channel/";

/// Identifies one version of one payment channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PaymentChannelKey {
    pub id: u64,
    pub nonce: u64,
}

impl PaymentChannelKey {
    pub fn new(id: u64, nonce: u64) -> Self {
        Self { id, nonce }
    }

    pub fn to_storage_key(&self) -> String {
        format!("{}{:020}", channel_prefix(self.id), self.nonce)
    }

    /// Inverse of [`to_storage_key`](Self::to_storage_key); `None` for keys
    /// outside the channel namespace.
    pub fn from_storage_key(key: &[u8]) -> Option<Self> {
        let key = std::str::from_utf8(key).ok()?;
        let (id, nonce) = key.strip_prefix(KEY_PREFIX)?.split_once('/')?;
        if id.len() != 20 || nonce.len() != 20 {
            return None;
        }
        Some(Self {
            id: id.parse().ok()?,
            nonce: nonce.parse().ok()?,
        })
    }
}

impl fmt::Display for PaymentChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{id: {}, nonce: {}}}", self.id, self.nonce)
    }
}

/// Common prefix of every stored version of channel `id`.
pub fn channel_prefix(id: u64) -> String {
    format!("{KEY_PREFIX}{id:020}/")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentChannelState {
    Open,
    Closed,
    /// A state defined by the caller.
    Custom(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentChannelData {
    pub state: PaymentChannelState,
    /// Public key of the party paying into the channel.
    pub sender: Vec<u8>,
    pub full_amount: BigUint,
    pub expiration: SystemTime,
    pub authorized_amount: BigUint,
    pub signature: Option<Vec<u8>>,
}

impl PaymentChannelData {
    /// Deterministic binary encoding; equal records encode to equal bytes.
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        record_codec().serialize(self)
    }

    /// Bytes left over after a complete record are an error.
    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        record_codec().deserialize(bytes)
    }
}

fn record_codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}
