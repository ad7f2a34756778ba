use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite, Transaction,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::debug;

use shared::domain::{DeviceId, ServiceId};

const MEMORY_DATABASE_URL: &str = "sqlite::memory:";

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceiptState {
    pub delivery_receipt_count: i64,
    pub last_receipt_at: Option<DateTime<Utc>>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid sqlite url '{database_url}'"))?
            .create_if_missing(true);
        // Every in-memory connection is its own database, so keep exactly one.
        let max_connections = if database_url == MEMORY_DATABASE_URL {
            1
        } else {
            5
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open sqlite database '{database_url}'"))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run storage migrations")?;
        Ok(Self { pool })
    }

    pub async fn in_memory() -> Result<Self> {
        Self::new(MEMORY_DATABASE_URL).await
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Opens the single transaction an inbound batch is processed under.
    pub async fn begin_batch(&self) -> Result<BatchTransaction> {
        let tx = self
            .pool
            .begin()
            .await
            .context("failed to begin batch transaction")?;
        Ok(BatchTransaction { tx })
    }

    pub async fn record_sent_message(
        &self,
        sent_timestamp: i64,
        recipient: ServiceId,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO sent_messages (sent_timestamp, recipient_service_id)
             VALUES (?, ?)
             ON CONFLICT(sent_timestamp, recipient_service_id) DO NOTHING",
        )
        .bind(sent_timestamp)
        .bind(recipient.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delivery_receipt_state(
        &self,
        sent_timestamp: i64,
        recipient: ServiceId,
    ) -> Result<Option<DeliveryReceiptState>> {
        let row = sqlx::query(
            "SELECT delivery_receipt_count, last_receipt_at
             FROM sent_messages
             WHERE sent_timestamp = ? AND recipient_service_id = ?",
        )
        .bind(sent_timestamp)
        .bind(recipient.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| DeliveryReceiptState {
            delivery_receipt_count: row.get::<i64, _>("delivery_receipt_count"),
            last_receipt_at: row.get::<Option<DateTime<Utc>>, _>("last_receipt_at"),
        }))
    }

    pub async fn insert_send_log_entry(
        &self,
        sent_timestamp: i64,
        recipient: ServiceId,
        recipient_device: DeviceId,
        content: &[u8],
    ) -> Result<i64> {
        let rec = sqlx::query(
            "INSERT INTO message_send_log (sent_timestamp, recipient_service_id, recipient_device, content)
             VALUES (?, ?, ?, ?)
             RETURNING id",
        )
        .bind(sent_timestamp)
        .bind(recipient.to_string())
        .bind(recipient_device.0)
        .bind(content)
        .fetch_one(&self.pool)
        .await?;
        Ok(rec.get::<i64, _>(0))
    }

    pub async fn send_log_entry_count(
        &self,
        sent_timestamp: i64,
        recipient: ServiceId,
        recipient_device: DeviceId,
    ) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM message_send_log
             WHERE sent_timestamp = ? AND recipient_service_id = ? AND recipient_device = ?",
        )
        .bind(sent_timestamp)
        .bind(recipient.to_string())
        .bind(recipient_device.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn load_protocol_record(
        &self,
        namespace: &str,
        record_key: &str,
    ) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query(
            "SELECT record_value FROM protocol_records WHERE namespace = ? AND record_key = ?",
        )
        .bind(namespace)
        .bind(record_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get::<Vec<u8>, _>(0)))
    }
}

/// Wraps one open SQLite transaction. Dropping it without `commit` rolls back.
pub struct BatchTransaction {
    tx: Transaction<'static, Sqlite>,
}

impl BatchTransaction {
    /// Returns false when no sent message matches the receipt.
    pub async fn increment_delivery_receipt_count(
        &mut self,
        sent_timestamp: i64,
        recipient: ServiceId,
        receipt_time: DateTime<Utc>,
    ) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE sent_messages
             SET delivery_receipt_count = delivery_receipt_count + 1,
                 last_receipt_at = ?
             WHERE sent_timestamp = ? AND recipient_service_id = ?",
        )
        .bind(receipt_time)
        .bind(sent_timestamp)
        .bind(recipient.to_string())
        .execute(&mut *self.tx)
        .await
        .context("failed to increment delivery receipt count")?
        .rows_affected();
        if updated == 0 {
            debug!(
                sent_timestamp,
                recipient = %recipient,
                "storage: delivery receipt for unknown sent message"
            );
        }
        Ok(updated > 0)
    }

    pub async fn delete_send_log_entries(
        &mut self,
        sent_timestamp: i64,
        recipient: ServiceId,
        recipient_device: DeviceId,
    ) -> Result<u64> {
        let deleted = sqlx::query(
            "DELETE FROM message_send_log
             WHERE sent_timestamp = ? AND recipient_service_id = ? AND recipient_device = ?",
        )
        .bind(sent_timestamp)
        .bind(recipient.to_string())
        .bind(recipient_device.0)
        .execute(&mut *self.tx)
        .await
        .context("failed to delete send log entries")?
        .rows_affected();
        Ok(deleted)
    }

    pub async fn put_protocol_record(
        &mut self,
        namespace: &str,
        record_key: &str,
        record_value: &[u8],
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO protocol_records (namespace, record_key, record_value, updated_at)
             VALUES (?, ?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(namespace, record_key) DO UPDATE SET
                record_value = excluded.record_value,
                updated_at = CURRENT_TIMESTAMP",
        )
        .bind(namespace)
        .bind(record_key)
        .bind(record_value)
        .execute(&mut *self.tx)
        .await
        .with_context(|| format!("failed to write protocol record {namespace}/{record_key}"))?;
        Ok(())
    }

    pub async fn delete_protocol_record(&mut self, namespace: &str, record_key: &str) -> Result<()> {
        sqlx::query("DELETE FROM protocol_records WHERE namespace = ? AND record_key = ?")
            .bind(namespace)
            .bind(record_key)
            .execute(&mut *self.tx)
            .await
            .with_context(|| {
                format!("failed to delete protocol record {namespace}/{record_key}")
            })?;
        Ok(())
    }

    pub async fn commit(self) -> Result<()> {
        self.tx
            .commit()
            .await
            .context("failed to commit batch transaction")
    }

    pub async fn rollback(self) -> Result<()> {
        self.tx
            .rollback()
            .await
            .context("failed to roll back batch transaction")
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == MEMORY_DATABASE_URL || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
