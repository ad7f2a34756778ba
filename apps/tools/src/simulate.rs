//! In-process stand-ins for the realtime socket and the OS connectivity service.

use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use message_retrieval::{
    network::{NetworkCapabilities, NetworkHandle},
    ConnectivityMonitor, MessageTransport, NetworkCallback,
};
use parking_lot::Mutex;
use shared::{
    domain::{DeviceId, Envelope, EnvelopeType, ServiceId},
    error::TransportError,
    protocol::{ConnectionState, MessageBatch},
};
use tokio::sync::{broadcast, watch};
use tracing::info;

pub struct SimulatedTransport {
    state: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<ConnectionState>,
    queue: Mutex<VecDeque<Envelope>>,
    drained_sent: Mutex<bool>,
    keep_alive_tokens: Mutex<HashSet<String>>,
    acked: Mutex<usize>,
}

impl SimulatedTransport {
    pub fn new(envelopes: Vec<Envelope>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (transitions, _) = broadcast::channel(16);
        Self {
            state,
            transitions,
            queue: Mutex::new(envelopes.into()),
            drained_sent: Mutex::new(false),
            keep_alive_tokens: Mutex::new(HashSet::new()),
            acked: Mutex::new(0),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        if self.state.send_replace(state) != state {
            let _ = self.transitions.send(state);
        }
    }

    pub fn acked(&self) -> usize {
        *self.acked.lock()
    }
}

#[async_trait]
impl MessageTransport for SimulatedTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.set_state(ConnectionState::Connecting);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.set_state(ConnectionState::Connected);
        *self.drained_sent.lock() = false;
        info!("sim: socket connected");
        Ok(())
    }

    async fn disconnect(&self) {
        self.set_state(ConnectionState::Disconnected);
    }

    fn state_snapshot(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn subscribe_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.transitions.subscribe()
    }

    async fn read_batch(
        &self,
        timeout: Duration,
        max_count: usize,
    ) -> Result<MessageBatch, TransportError> {
        let mut state = self.state.subscribe();
        if !state.borrow_and_update().is_connected() {
            return Err(TransportError::unavailable("socket closed"));
        }

        let batch = {
            let mut queue = self.queue.lock();
            let take = queue.len().min(max_count);
            let items: Vec<Envelope> = queue.drain(..take).collect();
            let mut drained_sent = self.drained_sent.lock();
            if !items.is_empty() || !*drained_sent {
                *drained_sent = queue.is_empty();
                Some(MessageBatch::new(!queue.is_empty(), items))
            } else {
                None
            }
        };
        if let Some(batch) = batch {
            return Ok(batch);
        }

        tokio::select! {
            _ = state.wait_for(|s| !s.is_connected()) => {
                Err(TransportError::unavailable("socket closed during read"))
            }
            _ = tokio::time::sleep(timeout) => Err(TransportError::Timeout),
        }
    }

    async fn send_ack(&self, _envelope: &Envelope) -> Result<(), TransportError> {
        *self.acked.lock() += 1;
        Ok(())
    }

    fn register_keep_alive_token(&self, token: &str) {
        self.keep_alive_tokens.lock().insert(token.to_string());
    }

    fn remove_keep_alive_token(&self, token: &str) {
        self.keep_alive_tokens.lock().remove(token);
    }

    fn should_send_keep_alives(&self) -> bool {
        !self.keep_alive_tokens.lock().is_empty()
    }
}

/// Reports a single validated interface as soon as a callback registers.
pub struct SimulatedMonitor;

const SIMULATED_WIFI: NetworkHandle = NetworkHandle(1);

impl ConnectivityMonitor for SimulatedMonitor {
    fn register_callback(&self, callback: Arc<dyn NetworkCallback>) -> anyhow::Result<()> {
        callback.on_capabilities_changed(
            SIMULATED_WIFI,
            NetworkCapabilities {
                validated: true,
                on_vpn: false,
            },
        );
        Ok(())
    }

    fn unregister_callback(&self, _callback: &Arc<dyn NetworkCallback>) {}
}

/// Every fourth envelope is a delivery receipt for a message in `sent`.
pub fn generate_envelopes(count: usize, sender: ServiceId, sent: &[i64]) -> Vec<Envelope> {
    (0..count)
        .map(|i| {
            let timestamp = 1_700_000_000_000 + i as i64;
            let receipt_for = sent.get(i / 4).copied().filter(|_| i % 4 == 3);
            Envelope {
                envelope_type: if receipt_for.is_some() {
                    EnvelopeType::ServerDeliveryReceipt
                } else {
                    EnvelopeType::Ciphertext
                },
                timestamp: receipt_for.unwrap_or(timestamp),
                source_service_id: Some(sender.to_string()),
                source_device: Some(DeviceId(1)),
                server_timestamp: timestamp,
                server_delivered_timestamp: timestamp + 40,
                urgent: true,
                server_guid: Some(format!("sim-{i}")),
                content: format!("simulated message {i}").into_bytes(),
            }
        })
        .collect()
}
