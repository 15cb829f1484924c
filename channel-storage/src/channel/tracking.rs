use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use super::{PaymentChannelData, PaymentChannelKey, PaymentChannelStorage};
use crate::error::StorageError;

/// Remembers every key written through it so the records can be removed
/// again with [`clear`](Self::clear). Meant for tests sharing one store.
pub struct TrackingStorage<S> {
    inner: S,
    written: Mutex<Vec<PaymentChannelKey>>,
}

impl<S: PaymentChannelStorage> TrackingStorage<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            written: Mutex::new(Vec::new()),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Keys written so far, in write order, without duplicates.
    pub fn recorded_keys(&self) -> Vec<PaymentChannelKey> {
        self.written().clone()
    }

    /// Deletes every recorded key and forgets it. Keys whose delete failed
    /// stay recorded.
    pub async fn clear(&self) -> Result<(), StorageError> {
        let keys = std::mem::take(&mut *self.written());
        let mut failed = Vec::new();
        let mut first_error = None;

        for key in keys {
            if let Err(err) = self.inner.delete(&key).await {
                failed.push(key);
                first_error.get_or_insert(err);
            }
        }

        debug!(remaining = failed.len(), "tracked channel records cleared");
        self.written().extend(failed);
        first_error.map_or(Ok(()), Err)
    }

    fn record(&self, key: &PaymentChannelKey) {
        let mut written = self.written();
        if !written.contains(key) {
            written.push(*key);
        }
    }

    fn written(&self) -> MutexGuard<'_, Vec<PaymentChannelKey>> {
        self.written.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl<S: PaymentChannelStorage> PaymentChannelStorage for TrackingStorage<S> {
    async fn get(
        &self,
        key: &PaymentChannelKey,
    ) -> Result<Option<PaymentChannelData>, StorageError> {
        self.inner.get(key).await
    }

    async fn put(
        &self,
        key: &PaymentChannelKey,
        data: &PaymentChannelData,
    ) -> Result<(), StorageError> {
        self.record(key);
        self.inner.put(key, data).await
    }

    async fn put_if_absent(
        &self,
        key: &PaymentChannelKey,
        data: &PaymentChannelData,
    ) -> Result<bool, StorageError> {
        self.record(key);
        self.inner.put_if_absent(key, data).await
    }

    async fn compare_and_swap(
        &self,
        key: &PaymentChannelKey,
        expected: &PaymentChannelData,
        new: &PaymentChannelData,
    ) -> Result<bool, StorageError> {
        self.record(key);
        self.inner.compare_and_swap(key, expected, new).await
    }

    async fn delete(&self, key: &PaymentChannelKey) -> Result<(), StorageError> {
        self.inner.delete(key).await
    }

    async fn channel_versions(
        &self,
        id: u64,
    ) -> Result<Vec<(PaymentChannelKey, PaymentChannelData)>, StorageError> {
        self.inner.channel_versions(id).await
    }
}
