use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::domain::{DeviceId, ServiceId};
use storage::{BatchTransaction, Storage};

/// Opens the single transaction a batch runs inside.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;
}

/// Writes a batch may perform. Dropping without `commit` discards them.
#[async_trait]
pub trait StoreTransaction: Send {
    async fn increment_delivery_receipt_count(
        &mut self,
        sent_timestamp: i64,
        recipient: ServiceId,
        receipt_time: DateTime<Utc>,
    ) -> Result<bool>;
    async fn delete_send_log_entries(
        &mut self,
        sent_timestamp: i64,
        recipient: ServiceId,
        recipient_device: DeviceId,
    ) -> Result<u64>;
    async fn put_protocol_record(&mut self, namespace: &str, key: &str, value: &[u8])
        -> Result<()>;
    async fn delete_protocol_record(&mut self, namespace: &str, key: &str) -> Result<()>;
    async fn commit(self: Box<Self>) -> Result<()>;
}

#[async_trait]
impl MessageStore for Storage {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        Ok(Box::new(self.begin_batch().await?))
    }
}

#[async_trait]
impl StoreTransaction for BatchTransaction {
    async fn increment_delivery_receipt_count(
        &mut self,
        sent_timestamp: i64,
        recipient: ServiceId,
        receipt_time: DateTime<Utc>,
    ) -> Result<bool> {
        BatchTransaction::increment_delivery_receipt_count(
            self,
            sent_timestamp,
            recipient,
            receipt_time,
        )
        .await
    }

    async fn delete_send_log_entries(
        &mut self,
        sent_timestamp: i64,
        recipient: ServiceId,
        recipient_device: DeviceId,
    ) -> Result<u64> {
        BatchTransaction::delete_send_log_entries(self, sent_timestamp, recipient, recipient_device)
            .await
    }

    async fn put_protocol_record(
        &mut self,
        namespace: &str,
        key: &str,
        value: &[u8],
    ) -> Result<()> {
        BatchTransaction::put_protocol_record(self, namespace, key, value).await
    }

    async fn delete_protocol_record(&mut self, namespace: &str, key: &str) -> Result<()> {
        BatchTransaction::delete_protocol_record(self, namespace, key).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        BatchTransaction::commit(*self).await
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
