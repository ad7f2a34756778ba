use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::domain::{DeviceId, Envelope, ServiceId};

use crate::{jobs::FollowUpJob, store::StoreTransaction};

/// Why a decryptable envelope could not be turned into a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    DecryptionError,
    InvalidVersion,
    LegacyMessage,
    UnsupportedDataMessage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedMessage {
    pub sender: Option<ServiceId>,
    pub sender_device: Option<DeviceId>,
    pub timestamp: i64,
    pub server_guid: Option<String>,
    pub plaintext: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptionFailure {
    pub state: MessageState,
    pub sender: Option<ServiceId>,
    pub sender_device: Option<DeviceId>,
    pub group_id: Option<String>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptionOutcome {
    Success(DecryptedMessage),
    Error(DecryptionFailure),
    Ignore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptionResult {
    pub outcome: DecryptionOutcome,
    /// Work the decryptor itself wants run, ahead of any processing job.
    pub follow_ups: Vec<FollowUpJob>,
}

impl DecryptionResult {
    pub fn success(message: DecryptedMessage) -> Self {
        Self {
            outcome: DecryptionOutcome::Success(message),
            follow_ups: Vec::new(),
        }
    }

    pub fn error(failure: DecryptionFailure) -> Self {
        Self {
            outcome: DecryptionOutcome::Error(failure),
            follow_ups: Vec::new(),
        }
    }

    pub fn ignore() -> Self {
        Self {
            outcome: DecryptionOutcome::Ignore,
            follow_ups: Vec::new(),
        }
    }

    pub fn with_follow_ups(mut self, follow_ups: Vec<FollowUpJob>) -> Self {
        self.follow_ups = follow_ups;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolMutation {
    Put {
        namespace: String,
        key: String,
        value: Vec<u8>,
    },
    Delete {
        namespace: String,
        key: String,
    },
}

/// Protocol-store writes staged by the decryptor during one batch.
#[derive(Debug, Default)]
pub struct ProtocolStoreBuffer {
    pending: Vec<ProtocolMutation>,
}

impl ProtocolStoreBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, namespace: impl Into<String>, key: impl Into<String>, value: Vec<u8>) {
        self.pending.push(ProtocolMutation::Put {
            namespace: namespace.into(),
            key: key.into(),
            value,
        });
    }

    pub fn delete(&mut self, namespace: impl Into<String>, key: impl Into<String>) {
        self.pending.push(ProtocolMutation::Delete {
            namespace: namespace.into(),
            key: key.into(),
        });
    }

    /// Applies staged writes in order inside `tx`; returns how many were written.
    pub async fn flush_to_disk(&mut self, tx: &mut dyn StoreTransaction) -> Result<usize> {
        let mutations = std::mem::take(&mut self.pending);
        let count = mutations.len();
        for mutation in mutations {
            match mutation {
                ProtocolMutation::Put {
                    namespace,
                    key,
                    value,
                } => tx.put_protocol_record(&namespace, &key, &value).await?,
                ProtocolMutation::Delete { namespace, key } => {
                    tx.delete_protocol_record(&namespace, &key).await?
                }
            }
        }
        Ok(count)
    }
}

#[async_trait]
pub trait Decryptor: Send + Sync {
    async fn decrypt(&self, buffer: &mut ProtocolStoreBuffer, envelope: &Envelope)
        -> DecryptionResult;
}

/// Treats envelope content as already-plaintext. Used by the simulator.
pub struct PassthroughDecryptor;

#[async_trait]
impl Decryptor for PassthroughDecryptor {
    async fn decrypt(
        &self,
        _buffer: &mut ProtocolStoreBuffer,
        envelope: &Envelope,
    ) -> DecryptionResult {
        DecryptionResult::success(DecryptedMessage {
            sender: envelope.source(),
            sender_device: envelope.source_device,
            timestamp: envelope.timestamp,
            server_guid: envelope.server_guid.clone(),
            plaintext: envelope.content.clone(),
        })
    }
}
