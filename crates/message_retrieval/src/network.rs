//! Aggregation of per-interface OS connectivity callbacks into one verdict.
//!
//! The host registers an [`AggregationCallback`] with the OS through a
//! [`ConnectivityMonitor`]. Callbacks arrive on platform threads, mutate the
//! interface map under a mutex, and push the recomputed aggregate into an
//! unbounded channel. A single tokio task drains that channel and publishes a
//! deduplicated [`ConnectivityState`] on a watch channel.
//!
//! Losing a VPN interface does not recompute. Always-on VPNs with a kill switch
//! can leave the underlying network reporting "up" while traffic is dropped, and
//! the OS does not report that through the ordinary callbacks, so the whole
//! subscription is torn down and registered again to get a fresh picture.

use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, error, info, warn};

use crate::config::RetrievalConfig;

/// Opaque identifier the OS hands out for one network interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkHandle(pub u64);

impl fmt::Display for NetworkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "network#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkCapabilities {
    pub validated: bool,
    pub on_vpn: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkProperties {
    pub http_proxy: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkState {
    pub available: bool,
    pub validated: bool,
    pub blocked: bool,
    pub on_vpn: bool,
    pub http_proxy: Option<String>,
}

impl NetworkState {
    pub const DOWN: NetworkState = NetworkState {
        available: false,
        validated: false,
        blocked: false,
        on_vpn: false,
        http_proxy: None,
    };

    pub fn is_reachable(&self) -> bool {
        self.validated && !self.blocked
    }

    fn rank(&self) -> u8 {
        if self.is_reachable() && self.on_vpn {
            3
        } else if self.is_reachable() {
            2
        } else if self.blocked {
            1
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    #[default]
    Offline,
    Online,
    OnlineVpn,
    Blocked,
    BlockedVpn,
}

impl ConnectivityState {
    /// True if traffic is expected to reach the internet.
    pub fn has_internet(&self) -> bool {
        matches!(self, ConnectivityState::Online | ConnectivityState::OnlineVpn)
    }

    fn from_network_state(state: &NetworkState) -> Self {
        match (state.is_reachable(), state.blocked, state.on_vpn) {
            (true, _, true) => ConnectivityState::OnlineVpn,
            (true, _, false) => ConnectivityState::Online,
            (false, true, true) => ConnectivityState::BlockedVpn,
            (false, true, false) => ConnectivityState::Blocked,
            (false, false, _) => ConnectivityState::Offline,
        }
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectivityState::Offline => "OFFLINE",
            ConnectivityState::Online => "ONLINE",
            ConnectivityState::OnlineVpn => "ONLINE_VPN",
            ConnectivityState::Blocked => "BLOCKED",
            ConnectivityState::BlockedVpn => "BLOCKED_VPN",
        };
        f.write_str(label)
    }
}

/// Computes the aggregate verdict for a set of live interfaces.
///
/// A VPN interface only counts as validated while some non-VPN interface is
/// live next to it. Equal ranks prefer the VPN entry so the result does not
/// depend on map iteration order.
pub fn aggregate(networks: &HashMap<NetworkHandle, NetworkState>) -> ConnectivityState {
    let has_underlying_network = networks.values().any(|state| !state.on_vpn);
    networks
        .values()
        .map(|state| NetworkState {
            validated: state.validated && (has_underlying_network || !state.on_vpn),
            ..state.clone()
        })
        .max_by_key(|state| (state.rank(), state.on_vpn))
        .map(|best| ConnectivityState::from_network_state(&best))
        .unwrap_or_default()
}

/// Per-interface callbacks delivered by the host OS.
pub trait NetworkCallback: Send + Sync {
    fn on_capabilities_changed(&self, handle: NetworkHandle, capabilities: NetworkCapabilities);
    fn on_link_properties_changed(&self, handle: NetworkHandle, properties: LinkProperties);
    fn on_blocked_status_changed(&self, handle: NetworkHandle, blocked: bool);
    fn on_lost(&self, handle: NetworkHandle);
}

/// Host platform hook that (un)registers callbacks with the OS.
pub trait ConnectivityMonitor: Send + Sync {
    fn register_callback(&self, callback: Arc<dyn NetworkCallback>) -> anyhow::Result<()>;
    fn unregister_callback(&self, callback: &Arc<dyn NetworkCallback>);
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AggregatorSignal {
    State(ConnectivityState),
    Stale(&'static str),
}

/// The callback registered with the OS for one subscription.
pub struct AggregationCallback {
    networks: Mutex<HashMap<NetworkHandle, NetworkState>>,
    signals: mpsc::UnboundedSender<AggregatorSignal>,
}

impl AggregationCallback {
    fn new(signals: mpsc::UnboundedSender<AggregatorSignal>) -> Self {
        Self {
            networks: Mutex::new(HashMap::new()),
            signals,
        }
    }

    /// Runs `mutate` under the map lock and publishes its signal before releasing it,
    /// so signals leave in the same order as the mutations that produced them.
    fn update(
        &self,
        mutate: impl FnOnce(&mut HashMap<NetworkHandle, NetworkState>) -> Option<AggregatorSignal>,
    ) {
        let mut networks = self.networks.lock();
        let Some(signal) = mutate(&mut networks) else {
            return;
        };
        if self.signals.send(signal).is_err() {
            debug!("network: dropping callback after subscription closed");
        }
    }
}

impl NetworkCallback for AggregationCallback {
    fn on_capabilities_changed(&self, handle: NetworkHandle, capabilities: NetworkCapabilities) {
        debug!(
            %handle,
            validated = capabilities.validated,
            vpn = capabilities.on_vpn,
            "network: capabilities changed"
        );
        self.update(|networks| {
            let entry = networks.entry(handle).or_insert(NetworkState {
                available: true,
                ..NetworkState::DOWN
            });
            entry.validated = capabilities.validated;
            entry.on_vpn = capabilities.on_vpn;
            Some(AggregatorSignal::State(aggregate(networks)))
        });
    }

    fn on_link_properties_changed(&self, handle: NetworkHandle, properties: LinkProperties) {
        self.update(|networks| {
            let entry = networks.get_mut(&handle)?;
            entry.http_proxy = properties.http_proxy;
            Some(AggregatorSignal::State(aggregate(networks)))
        });
    }

    fn on_blocked_status_changed(&self, handle: NetworkHandle, blocked: bool) {
        debug!(%handle, blocked, "network: blocked status changed");
        self.update(|networks| {
            let entry = networks.get_mut(&handle)?;
            entry.blocked = blocked;
            Some(AggregatorSignal::State(aggregate(networks)))
        });
    }

    fn on_lost(&self, handle: NetworkHandle) {
        debug!(%handle, "network: lost");
        self.update(|networks| match networks.remove(&handle) {
            Some(removed) if removed.on_vpn => Some(AggregatorSignal::Stale("VPN loss")),
            _ => Some(AggregatorSignal::State(aggregate(networks))),
        });
    }
}

type ActiveCallback = Arc<Mutex<Option<Arc<dyn NetworkCallback>>>>;

pub struct NetworkStateAggregator {
    monitor: Arc<dyn ConnectivityMonitor>,
    config: RetrievalConfig,
    state: watch::Sender<ConnectivityState>,
    active_callback: ActiveCallback,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkStateAggregator {
    pub fn new(monitor: Arc<dyn ConnectivityMonitor>, config: RetrievalConfig) -> Self {
        let (state, _) = watch::channel(ConnectivityState::Offline);
        Self {
            monitor,
            config,
            state,
            active_callback: Arc::new(Mutex::new(None)),
            listener: Mutex::new(None),
        }
    }

    /// Starts observing the OS. Calling it again while registered is a no-op.
    pub fn register(&self) {
        let mut listener = self.listener.lock();
        if listener.is_some() {
            return;
        }
        let task = SubscriptionTask {
            monitor: Arc::clone(&self.monitor),
            resubscribe_attempts: self.config.network_resubscribe_attempts,
            resubscribe_delay: self.config.network_resubscribe_delay(),
            published: self.state.clone(),
            active_callback: Arc::clone(&self.active_callback),
        };
        *listener = Some(tokio::spawn(task.run()));
    }

    pub fn unregister(&self) {
        let Some(handle) = self.listener.lock().take() else {
            return;
        };
        handle.abort();
        if let Some(callback) = self.active_callback.lock().take() {
            self.monitor.unregister_callback(&callback);
        }
        debug!("network: unregistered");
    }

    pub fn is_registered(&self) -> bool {
        self.listener.lock().is_some()
    }

    pub fn current(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state.subscribe()
    }

    /// Current state first, then every distinct change.
    pub fn stream(&self) -> WatchStream<ConnectivityState> {
        WatchStream::new(self.state.subscribe())
    }
}

impl Drop for NetworkStateAggregator {
    fn drop(&mut self) {
        self.unregister();
    }
}

struct SubscriptionTask {
    monitor: Arc<dyn ConnectivityMonitor>,
    resubscribe_attempts: u32,
    resubscribe_delay: std::time::Duration,
    published: watch::Sender<ConnectivityState>,
    active_callback: ActiveCallback,
}

impl SubscriptionTask {
    async fn run(self) {
        let mut failures: u32 = 0;
        loop {
            let (signals_tx, mut signals_rx) = mpsc::unbounded_channel();
            let callback: Arc<dyn NetworkCallback> =
                Arc::new(AggregationCallback::new(signals_tx));

            if let Err(err) = self.monitor.register_callback(Arc::clone(&callback)) {
                failures += 1;
                if failures > self.resubscribe_attempts {
                    error!(
                        failures,
                        error = %err,
                        "network: giving up on registering connectivity callback"
                    );
                    return;
                }
                warn!(
                    failures,
                    error = %err,
                    "network: failed to register connectivity callback; retrying"
                );
                tokio::time::sleep(self.resubscribe_delay).await;
                continue;
            }
            failures = 0;
            *self.active_callback.lock() = Some(Arc::clone(&callback));

            let reason = loop {
                match signals_rx.recv().await {
                    Some(AggregatorSignal::State(state)) => self.publish(state),
                    Some(AggregatorSignal::Stale(reason)) => break reason,
                    None => break "callback dropped",
                }
            };

            if let Some(stale) = self.active_callback.lock().take() {
                self.monitor.unregister_callback(&stale);
            }
            info!(reason, "network: re-registering connectivity callback");
        }
    }

    fn publish(&self, state: ConnectivityState) {
        self.published.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            info!("network: internet reachability {} -> {}", current, state);
            *current = state;
            true
        });
    }
}

#[cfg(test)]
#[path = "tests/network_tests.rs"]
mod tests;
