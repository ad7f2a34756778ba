use std::time::Duration;

use async_trait::async_trait;
use shared::{
    domain::Envelope,
    error::TransportError,
    protocol::{ConnectionState, MessageBatch},
};
use tokio::sync::broadcast;

/// Authenticated realtime pipe the retrieval loop reads envelopes from.
///
/// `disconnect` may be called from any task and must interrupt a pending
/// `read_batch` with [`TransportError::Unavailable`].
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;
    async fn disconnect(&self);
    fn state_snapshot(&self) -> ConnectionState;
    /// Every state change in order, from the moment of subscription.
    fn subscribe_state(&self) -> broadcast::Receiver<ConnectionState>;

    /// Waits up to `timeout` for at most `max_count` envelopes.
    async fn read_batch(
        &self,
        timeout: Duration,
        max_count: usize,
    ) -> Result<MessageBatch, TransportError>;
    async fn send_ack(&self, envelope: &Envelope) -> Result<(), TransportError>;

    fn register_keep_alive_token(&self, token: &str);
    fn remove_keep_alive_token(&self, token: &str);
    /// True while any keep-alive token is registered.
    fn should_send_keep_alives(&self) -> bool;
}
