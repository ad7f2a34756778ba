//! The long-lived retrieval loop.
//!
//! One spawned task owns the transport: it waits until a connection is needed,
//! connects, reads batches and hands them to the [`MessageBatchProcessor`].
//! Lifecycle, network and transport changes never call into that task; small
//! forwarder tasks turn them into a wake-up on a single-permit [`Notify`], so
//! any burst of signals collapses into one re-evaluation.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Instant,
};

use parking_lot::Mutex;
use shared::{error::FailureKind, protocol::ConnectionState};
use tokio::{
    sync::{
        broadcast::{self, error::RecvError},
        watch, Notify,
    },
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    backoff::{exponential_backoff, SleepTimer},
    batch::MessageBatchProcessor,
    config::RetrievalConfig,
    drained::{DecryptionDrainedFlag, DrainedListener, DrainedListenerId},
    error::RetrievalResult,
    lifecycle::AppLifecycleTracker,
    necessity::{is_connection_needed, AccountStatus, NecessityInputs},
    network::NetworkStateAggregator,
    transport::MessageTransport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorPhase {
    Idle,
    Connecting,
    Reading,
    Terminated,
}

/// Collaborators the supervisor is built from.
pub struct SupervisorDeps {
    pub transport: Arc<dyn MessageTransport>,
    pub lifecycle: Arc<AppLifecycleTracker>,
    pub network: Arc<NetworkStateAggregator>,
    pub account: Arc<dyn AccountStatus>,
    pub processor: Arc<MessageBatchProcessor>,
    pub sleep_timer: Arc<dyn SleepTimer>,
}

struct Shared {
    config: RetrievalConfig,
    transport: Arc<dyn MessageTransport>,
    lifecycle: Arc<AppLifecycleTracker>,
    network: Arc<NetworkStateAggregator>,
    account: Arc<dyn AccountStatus>,
    processor: Arc<MessageBatchProcessor>,
    sleep_timer: Arc<dyn SleepTimer>,
    wake: Notify,
    terminated: AtomicBool,
    attempts: AtomicU32,
    drained: DecryptionDrainedFlag,
    phase: watch::Sender<SupervisorPhase>,
}

pub struct ConnectionSupervisor {
    shared: Arc<Shared>,
    retrieval: Mutex<Option<JoinHandle<()>>>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionSupervisor {
    pub fn new(config: RetrievalConfig, deps: SupervisorDeps) -> Self {
        let (phase, _) = watch::channel(SupervisorPhase::Idle);
        Self {
            shared: Arc::new(Shared {
                config,
                transport: deps.transport,
                lifecycle: deps.lifecycle,
                network: deps.network,
                account: deps.account,
                processor: deps.processor,
                sleep_timer: deps.sleep_timer,
                wake: Notify::new(),
                terminated: AtomicBool::new(false),
                attempts: AtomicU32::new(0),
                drained: DecryptionDrainedFlag::new(),
                phase,
            }),
            retrieval: Mutex::new(None),
            forwarders: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the retrieval loop and its signal forwarders. Later calls are no-ops.
    pub fn start(&self) {
        let mut retrieval = self.retrieval.lock();
        if retrieval.is_some() || self.shared.terminated.load(Ordering::SeqCst) {
            return;
        }
        info!("retrieval: starting");
        self.shared.network.register();

        let mut forwarders = self.forwarders.lock();
        forwarders.push(tokio::spawn(forward_lifecycle(Arc::clone(&self.shared))));
        forwarders.push(tokio::spawn(forward_network(Arc::clone(&self.shared))));
        let transitions = self.shared.transport.subscribe_state();
        forwarders.push(tokio::spawn(forward_transport_state(
            Arc::clone(&self.shared),
            transitions,
        )));
        *retrieval = Some(tokio::spawn(Arc::clone(&self.shared).run()));
    }

    pub fn register_keep_alive_token(&self, token: &str) {
        self.shared.transport.register_keep_alive_token(token);
        self.shared.wake();
    }

    pub fn remove_keep_alive_token(&self, token: &str) {
        self.shared.transport.remove_keep_alive_token(token);
        self.shared.wake();
    }

    pub fn add_decryption_drained_listener(&self, listener: DrainedListener) -> DrainedListenerId {
        self.shared.drained.add_listener(listener)
    }

    pub fn remove_decryption_drained_listener(&self, id: DrainedListenerId) -> bool {
        self.shared.drained.remove_listener(id)
    }

    pub fn is_decryption_drained(&self) -> bool {
        self.shared.drained.is_drained()
    }

    pub fn notify_registration_state_changed(&self) {
        debug!("retrieval: registration state changed");
        self.shared.wake();
    }

    pub fn attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> SupervisorPhase {
        *self.shared.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SupervisorPhase> {
        self.shared.phase.subscribe()
    }

    /// Stops the loop after the current iteration. Safe to call more than once.
    pub async fn terminate(&self) {
        if self.shared.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!("retrieval: beginning termination");
        self.shared.transport.disconnect().await;
        self.shared.wake();
        for forwarder in self.forwarders.lock().drain(..) {
            forwarder.abort();
        }
        self.shared.network.unregister();
        if self.retrieval.lock().is_none() {
            self.shared.set_phase(SupervisorPhase::Terminated);
        }
    }

    /// Waits for the retrieval loop to exit.
    pub async fn join(&self) {
        let handle = self.retrieval.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                if err.is_panic() {
                    warn!(error = %err, "retrieval: loop panicked");
                }
            }
        }
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        self.shared.terminated.store(true, Ordering::SeqCst);
        for forwarder in self.forwarders.get_mut().drain(..) {
            forwarder.abort();
        }
        if let Some(retrieval) = self.retrieval.get_mut().take() {
            retrieval.abort();
        }
    }
}

impl Shared {
    fn wake(&self) {
        self.wake.notify_one();
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    fn has_network(&self) -> bool {
        self.network.current().has_internet()
    }

    fn is_connection_needed(&self) -> bool {
        let inputs = NecessityInputs::collect(
            self.account.as_ref(),
            self.lifecycle.current(),
            self.has_network(),
            Instant::now(),
        );
        is_connection_needed(&inputs, &self.config)
    }

    /// An already-open socket, or one kept alive by a token, is used even when not needed.
    fn is_connection_available(&self) -> bool {
        self.account.is_registered()
            && (self.transport.state_snapshot().is_connected()
                || (self.transport.should_send_keep_alives() && self.has_network()))
    }

    fn set_phase(&self, phase: SupervisorPhase) {
        self.phase.send_if_modified(|current| {
            if *current == phase {
                return false;
            }
            debug!(from = ?*current, to = ?phase, "retrieval: phase changed");
            *current = phase;
            true
        });
    }

    async fn run(self: Arc<Self>) {
        while !self.is_terminated() {
            let attempts = self.attempts.load(Ordering::SeqCst);
            if attempts > 0 {
                let delay = exponential_backoff(attempts, self.config.backoff_cap());
                warn!(
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    "retrieval: failed connection attempts; backing off"
                );
                self.sleep_timer.sleep(delay).await;
            }

            self.wait_for_connection_necessary().await;
            if self.is_terminated() {
                break;
            }

            info!("retrieval: making connection");
            self.set_phase(SupervisorPhase::Connecting);
            if let Err(err) = self.connect_and_read().await {
                let attempts = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(attempts, error = %err, "retrieval: connection failed");
            }

            info!("retrieval: disconnecting");
            self.transport.disconnect().await;
            self.drained.reset();
            self.set_phase(SupervisorPhase::Idle);
        }
        self.set_phase(SupervisorPhase::Terminated);
        warn!("retrieval: terminated");
    }

    async fn wait_for_connection_necessary(&self) {
        while !self.is_terminated()
            && !self.is_connection_needed()
            && !self.is_connection_available()
        {
            debug!("retrieval: waiting for a connection to become necessary");
            self.wake.notified().await;
        }
    }

    async fn connect_and_read(&self) -> RetrievalResult<()> {
        self.transport.connect().await?;

        while !self.is_terminated() {
            let needed = self.is_connection_needed();
            if !needed && !self.is_connection_available() {
                break;
            }
            if needed {
                self.transport
                    .register_keep_alive_token(&self.config.keep_alive_token);
            } else {
                self.transport
                    .remove_keep_alive_token(&self.config.keep_alive_token);
            }

            self.set_phase(SupervisorPhase::Reading);
            let Err(err) = self.read_once().await else {
                continue;
            };
            match err.kind() {
                FailureKind::Unavailable => {
                    if self.is_terminated()
                        || !(self.is_connection_needed() || self.is_connection_available())
                    {
                        break;
                    }
                    info!(error = %err, "retrieval: pipe unexpectedly unavailable; reconnecting");
                    self.drained.reset();
                    self.set_phase(SupervisorPhase::Connecting);
                    self.transport.connect().await?;
                }
                FailureKind::Timeout => {
                    debug!("retrieval: application level read timeout");
                    self.attempts.store(0, Ordering::SeqCst);
                }
                FailureKind::Generic => return Err(err),
            }
        }
        Ok(())
    }

    async fn read_once(&self) -> RetrievalResult<()> {
        let timeout = self.config.read_timeout(self.account.is_censored());
        let batch = self
            .transport
            .read_batch(timeout, self.config.batch_size)
            .await?;

        if !self.account.can_process_messages() {
            if !batch.is_empty() {
                warn!(
                    count = batch.len(),
                    "retrieval: dropping envelopes until restore decision is made"
                );
            }
            self.attempts.store(0, Ordering::SeqCst);
            return Ok(());
        }

        self.processor
            .process(self.transport.as_ref(), &batch.items)
            .await?;
        self.attempts.store(0, Ordering::SeqCst);
        if !batch.has_more {
            self.drained.mark_drained();
        }
        Ok(())
    }
}

async fn forward_lifecycle(shared: Arc<Shared>) {
    let mut app = shared.lifecycle.subscribe();
    while app.changed().await.is_ok() {
        shared.wake();
    }
}

async fn forward_network(shared: Arc<Shared>) {
    let mut network = shared.network.subscribe();
    while network.changed().await.is_ok() {
        let state = *network.borrow_and_update();
        if !state.has_internet() {
            warn!(%state, "retrieval: lost network connection; resetting drained state");
            shared.drained.reset();
            shared.transport.disconnect().await;
        }
        shared.wake();
    }
}

async fn forward_transport_state(
    shared: Arc<Shared>,
    mut transitions: broadcast::Receiver<ConnectionState>,
) {
    loop {
        match transitions.recv().await {
            Ok(state) => {
                debug!(?state, "retrieval: transport state");
                if state.is_connected() {
                    shared.wake();
                } else {
                    shared.drained.reset();
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "retrieval: missed transport state changes; resetting drained state");
                shared.drained.reset();
                shared.wake();
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
#[path = "tests/supervisor_tests.rs"]
mod tests;
