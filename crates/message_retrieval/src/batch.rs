//! Transactional decrypt-and-acknowledge for one batch of envelopes.
//!
//! A batch runs under the group-processing lock and the session lock, taken in
//! that order, inside a single store transaction. Envelopes are acknowledged
//! to the server only after that transaction commits, in arrival order, so a
//! failed commit leaves the whole batch queued server-side for redelivery.

use std::{sync::Arc, time::Instant};

use anyhow::Context;
use chrono::Utc;
use shared::domain::{Envelope, EnvelopeType};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::{
    decrypt::{DecryptionOutcome, Decryptor, MessageState, ProtocolStoreBuffer},
    error::{RetrievalError, RetrievalResult},
    jobs::{FollowUpJob, JobScheduler},
    store::{MessageStore, StoreTransaction},
    transport::MessageTransport,
};

/// The two coarse locks shared with other subsystems that touch group or session state.
#[derive(Debug, Default)]
pub struct ProcessingLocks {
    group: Mutex<()>,
    session: Mutex<()>,
}

/// Holds both locks. Fields drop in order, so the session lock is released first.
pub struct ProcessingGuard<'a> {
    _session: MutexGuard<'a, ()>,
    _group: MutexGuard<'a, ()>,
}

impl ProcessingLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Group lock, then session lock. There is no way to take them the other way round.
    pub async fn acquire(&self) -> ProcessingGuard<'_> {
        let group = self.group.lock().await;
        let session = self.session.lock().await;
        ProcessingGuard {
            _session: session,
            _group: group,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeOutcome {
    /// `matched` is false when no sent message corresponded to the receipt.
    Receipt { matched: bool },
    InvalidReceiptSender,
    Decrypted,
    DecryptionFailed(MessageState),
    Ignored,
    UnsupportedType(EnvelopeType),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub follow_up_operations: Vec<FollowUpJob>,
    /// One entry per envelope, in arrival order.
    pub outcomes: Vec<EnvelopeOutcome>,
}

pub struct MessageBatchProcessor {
    store: Arc<dyn MessageStore>,
    decryptor: Arc<dyn Decryptor>,
    scheduler: Arc<dyn JobScheduler>,
    locks: Arc<ProcessingLocks>,
}

impl MessageBatchProcessor {
    pub fn new(
        store: Arc<dyn MessageStore>,
        decryptor: Arc<dyn Decryptor>,
        scheduler: Arc<dyn JobScheduler>,
        locks: Arc<ProcessingLocks>,
    ) -> Self {
        Self {
            store,
            decryptor,
            scheduler,
            locks,
        }
    }

    pub fn locks(&self) -> Arc<ProcessingLocks> {
        Arc::clone(&self.locks)
    }

    pub async fn process(
        &self,
        transport: &dyn MessageTransport,
        envelopes: &[Envelope],
    ) -> RetrievalResult<BatchResult> {
        if envelopes.is_empty() {
            return Ok(BatchResult::default());
        }
        info!(count = envelopes.len(), "batch: retrieved envelopes");
        let started = Instant::now();

        let result = {
            let _locks = self.locks.acquire().await;
            self.run_transaction(envelopes)
                .await
                .map_err(RetrievalError::StorageTransaction)?
        };

        if !result.follow_up_operations.is_empty() {
            debug!(
                jobs = result.follow_up_operations.len(),
                "batch: scheduling follow-up operations"
            );
            self.scheduler
                .apply_follow_ups(result.follow_up_operations.clone());
        }

        for envelope in envelopes {
            transport
                .send_ack(envelope)
                .await
                .map_err(RetrievalError::Ack)?;
        }

        let elapsed = started.elapsed();
        debug!(
            count = envelopes.len(),
            duration_ms = elapsed.as_millis() as u64,
            per_message_ms = elapsed.as_secs_f64() * 1_000.0 / envelopes.len() as f64,
            "batch: decrypted envelopes"
        );
        Ok(result)
    }

    async fn run_transaction(&self, envelopes: &[Envelope]) -> anyhow::Result<BatchResult> {
        let mut tx = self
            .store
            .begin()
            .await
            .context("failed to open batch transaction")?;
        let mut buffer = ProtocolStoreBuffer::new();
        let mut result = BatchResult::default();

        for envelope in envelopes {
            let outcome = self
                .process_envelope(tx.as_mut(), &mut buffer, envelope, &mut result.follow_up_operations)
                .await?;
            result.outcomes.push(outcome);
        }

        let flushed = buffer.flush_to_disk(tx.as_mut()).await?;
        if flushed > 0 {
            debug!(records = flushed, "batch: flushed protocol store");
        }
        tx.commit().await?;
        Ok(result)
    }

    async fn process_envelope(
        &self,
        tx: &mut dyn StoreTransaction,
        buffer: &mut ProtocolStoreBuffer,
        envelope: &Envelope,
        follow_ups: &mut Vec<FollowUpJob>,
    ) -> anyhow::Result<EnvelopeOutcome> {
        if envelope.envelope_type == EnvelopeType::ServerDeliveryReceipt {
            return process_receipt(tx, envelope).await;
        }
        if !envelope.envelope_type.is_decryptable() {
            warn!(
                envelope_type = ?envelope.envelope_type,
                timestamp = envelope.timestamp,
                "batch: received envelope of unknown type"
            );
            return Ok(EnvelopeOutcome::UnsupportedType(envelope.envelope_type));
        }

        debug!(
            timestamp = envelope.timestamp,
            urgent = envelope.urgent,
            queue_latency_ms = envelope.server_queue_latency().num_milliseconds(),
            "batch: decrypting envelope"
        );
        let decrypted = self.decryptor.decrypt(buffer, envelope).await;
        follow_ups.extend(decrypted.follow_ups);

        let outcome = match decrypted.outcome {
            DecryptionOutcome::Success(message) => {
                follow_ups.push(FollowUpJob::ProcessMessage {
                    sender: message.sender,
                    sender_device: message.sender_device,
                    timestamp: message.timestamp,
                    server_guid: message.server_guid,
                    plaintext: message.plaintext,
                });
                EnvelopeOutcome::Decrypted
            }
            DecryptionOutcome::Error(failure) => {
                warn!(
                    state = ?failure.state,
                    timestamp = failure.timestamp,
                    sender = ?failure.sender.map(|s| s.to_string()),
                    "batch: decryption failed"
                );
                follow_ups.push(FollowUpJob::ProcessMessageError {
                    state: failure.state,
                    sender: failure.sender,
                    sender_device: failure.sender_device,
                    group_id: failure.group_id,
                    timestamp: failure.timestamp,
                });
                EnvelopeOutcome::DecryptionFailed(failure.state)
            }
            DecryptionOutcome::Ignore => EnvelopeOutcome::Ignored,
        };
        Ok(outcome)
    }
}

async fn process_receipt(
    tx: &mut dyn StoreTransaction,
    envelope: &Envelope,
) -> anyhow::Result<EnvelopeOutcome> {
    let Some(sender) = envelope.source() else {
        warn!(
            timestamp = envelope.timestamp,
            "batch: invalid envelope source service id on receipt"
        );
        return Ok(EnvelopeOutcome::InvalidReceiptSender);
    };

    info!(
        sender = %sender,
        device = ?envelope.source_device.map(|d| d.0),
        timestamp = envelope.timestamp,
        "batch: received server receipt"
    );
    let matched = tx
        .increment_delivery_receipt_count(envelope.timestamp, sender, Utc::now())
        .await?;
    if let Some(device) = envelope.source_device {
        tx.delete_send_log_entries(envelope.timestamp, sender, device)
            .await?;
    }
    Ok(EnvelopeOutcome::Receipt { matched })
}

#[cfg(test)]
#[path = "tests/batch_tests.rs"]
mod tests;
