use serde::{Deserialize, Serialize};
use shared::domain::{DeviceId, ServiceId};
use tokio::sync::mpsc;
use tracing::warn;

use crate::decrypt::MessageState;

/// Deferred work produced while processing a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum FollowUpJob {
    ProcessMessage {
        sender: Option<ServiceId>,
        sender_device: Option<DeviceId>,
        timestamp: i64,
        server_guid: Option<String>,
        plaintext: Vec<u8>,
    },
    ProcessMessageError {
        state: MessageState,
        sender: Option<ServiceId>,
        sender_device: Option<DeviceId>,
        group_id: Option<String>,
        timestamp: i64,
    },
    /// Anything else a decryptor asks for, e.g. session resets or retry receipts.
    Deferred {
        name: String,
        payload: serde_json::Value,
    },
}

/// External work queue that takes ownership of follow-up jobs.
pub trait JobScheduler: Send + Sync {
    fn apply_follow_ups(&self, jobs: Vec<FollowUpJob>);
}

pub struct ChannelJobScheduler {
    jobs: mpsc::UnboundedSender<FollowUpJob>,
}

impl ChannelJobScheduler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FollowUpJob>) {
        let (jobs, rx) = mpsc::unbounded_channel();
        (Self { jobs }, rx)
    }
}

impl JobScheduler for ChannelJobScheduler {
    fn apply_follow_ups(&self, jobs: Vec<FollowUpJob>) {
        for job in jobs {
            if self.jobs.send(job).is_err() {
                warn!("batch: follow-up queue closed; dropping job");
                return;
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/jobs_tests.rs"]
mod tests;
