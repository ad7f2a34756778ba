use serde::{Deserialize, Serialize};

use crate::domain::Envelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Result of one bounded read against the realtime transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBatch {
    /// False once the server has signalled that its queue is empty.
    pub has_more: bool,
    pub items: Vec<Envelope>,
}

impl MessageBatch {
    pub fn new(has_more: bool, items: Vec<Envelope>) -> Self {
        Self { has_more, items }
    }

    /// The server's "queue empty" marker with nothing attached.
    pub fn drained() -> Self {
        Self {
            has_more: false,
            items: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
