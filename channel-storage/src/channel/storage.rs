use async_trait::async_trait;
use tracing::debug;

use super::{PaymentChannelData, PaymentChannelKey, channel_prefix};
use crate::{client::StorageClient, error::StorageError};

/// Typed access to stored payment-channel records.
///
/// A record that exists but cannot be decoded is reported as
/// [`StorageError::Corrupted`], never as absent.
#[async_trait]
pub trait PaymentChannelStorage: Send + Sync {
    async fn get(&self, key: &PaymentChannelKey)
    -> Result<Option<PaymentChannelData>, StorageError>;

    async fn put(&self, key: &PaymentChannelKey, data: &PaymentChannelData)
    -> Result<(), StorageError>;

    /// Stores `data` only if no record exists under `key`.
    async fn put_if_absent(
        &self,
        key: &PaymentChannelKey,
        data: &PaymentChannelData,
    ) -> Result<bool, StorageError>;

    /// Replaces the record iff it still encodes to exactly `expected`.
    async fn compare_and_swap(
        &self,
        key: &PaymentChannelKey,
        expected: &PaymentChannelData,
        new: &PaymentChannelData,
    ) -> Result<bool, StorageError>;

    async fn delete(&self, key: &PaymentChannelKey) -> Result<(), StorageError>;

    /// Every stored version of channel `id`, ascending by nonce.
    async fn channel_versions(
        &self,
        id: u64,
    ) -> Result<Vec<(PaymentChannelKey, PaymentChannelData)>, StorageError>;
}

/// [`PaymentChannelStorage`] backed by a [`StorageClient`].
#[derive(Clone)]
pub struct AtomicChannelStorage {
    client: StorageClient,
}

impl AtomicChannelStorage {
    pub fn new(client: StorageClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &StorageClient {
        &self.client
    }
}

#[async_trait]
impl PaymentChannelStorage for AtomicChannelStorage {
    async fn get(
        &self,
        key: &PaymentChannelKey,
    ) -> Result<Option<PaymentChannelData>, StorageError> {
        let storage_key = key.to_storage_key();
        match self.client.get(&storage_key).await? {
            Some(bytes) => decode(&storage_key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        key: &PaymentChannelKey,
        data: &PaymentChannelData,
    ) -> Result<(), StorageError> {
        let storage_key = key.to_storage_key();
        let bytes = encode(&storage_key, data)?;
        self.client.put(&storage_key, bytes).await
    }

    async fn put_if_absent(
        &self,
        key: &PaymentChannelKey,
        data: &PaymentChannelData,
    ) -> Result<bool, StorageError> {
        let storage_key = key.to_storage_key();
        let bytes = encode(&storage_key, data)?;
        self.client.put_if_absent(&storage_key, bytes).await
    }

    async fn compare_and_swap(
        &self,
        key: &PaymentChannelKey,
        expected: &PaymentChannelData,
        new: &PaymentChannelData,
    ) -> Result<bool, StorageError> {
        let storage_key = key.to_storage_key();
        let expected = encode(&storage_key, expected)?;
        let new = encode(&storage_key, new)?;

        let swapped = self
            .client
            .compare_and_swap(&storage_key, expected, new)
            .await?;
        if !swapped {
            debug!(channel = %key, "channel record changed concurrently");
        }
        Ok(swapped)
    }

    async fn delete(&self, key: &PaymentChannelKey) -> Result<(), StorageError> {
        self.client.delete(key.to_storage_key()).await
    }

    async fn channel_versions(
        &self,
        id: u64,
    ) -> Result<Vec<(PaymentChannelKey, PaymentChannelData)>, StorageError> {
        let entries = self.client.range(channel_prefix(id)).await?;
        let mut versions = Vec::with_capacity(entries.len());

        for kv in entries {
            let storage_key = String::from_utf8_lossy(&kv.key).into_owned();
            // Anything under the prefix that is not a version key is skipped.
            let Some(key) = PaymentChannelKey::from_storage_key(&kv.key) else {
                debug!(key = %storage_key, "ignoring foreign key under channel prefix");
                continue;
            };
            versions.push((key, decode(&storage_key, &kv.value)?));
        }
        Ok(versions)
    }
}

fn encode(storage_key: &str, data: &PaymentChannelData) -> Result<Vec<u8>, StorageError> {
    data.encode().map_err(|source| StorageError::Encoding {
        key: storage_key.to_string(),
        source,
    })
}

fn decode(storage_key: &str, bytes: &[u8]) -> Result<PaymentChannelData, StorageError> {
    PaymentChannelData::decode(bytes).map_err(|source| StorageError::Corrupted {
        key: storage_key.to_string(),
        source,
    })
}
