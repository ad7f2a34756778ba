use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Instant,
};

use tracing::debug;

use crate::{config::RetrievalConfig, lifecycle::AppState};

/// Account and endpoint facts owned by the host application.
pub trait AccountStatus: Send + Sync {
    fn is_registered(&self) -> bool;
    fn is_push_available(&self) -> bool;
    /// Whether the active endpoint is believed to be censored.
    fn is_censored(&self) -> bool;
    /// False while a restore decision is pending; batches are then read and dropped.
    fn can_process_messages(&self) -> bool;
}

/// Settable [`AccountStatus`] for hosts that push flag changes in.
#[derive(Debug)]
pub struct AccountFlags {
    registered: AtomicBool,
    push_available: AtomicBool,
    censored: AtomicBool,
    can_process_messages: AtomicBool,
}

impl AccountFlags {
    pub fn new(registered: bool, push_available: bool) -> Self {
        Self {
            registered: AtomicBool::new(registered),
            push_available: AtomicBool::new(push_available),
            censored: AtomicBool::new(false),
            can_process_messages: AtomicBool::new(true),
        }
    }

    pub fn set_registered(&self, value: bool) {
        self.registered.store(value, Ordering::SeqCst);
    }

    pub fn set_push_available(&self, value: bool) {
        self.push_available.store(value, Ordering::SeqCst);
    }

    pub fn set_censored(&self, value: bool) {
        self.censored.store(value, Ordering::SeqCst);
    }

    pub fn set_can_process_messages(&self, value: bool) {
        self.can_process_messages.store(value, Ordering::SeqCst);
    }
}

impl Default for AccountFlags {
    fn default() -> Self {
        Self::new(true, true)
    }
}

impl AccountStatus for AccountFlags {
    fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    fn is_push_available(&self) -> bool {
        self.push_available.load(Ordering::SeqCst)
    }

    fn is_censored(&self) -> bool {
        self.censored.load(Ordering::SeqCst)
    }

    fn can_process_messages(&self) -> bool {
        self.can_process_messages.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NecessityInputs {
    pub registered: bool,
    pub push_available: bool,
    pub has_network: bool,
    pub censored: bool,
    pub app: AppState,
    pub now: Instant,
}

impl NecessityInputs {
    pub fn collect(
        account: &dyn AccountStatus,
        app: AppState,
        has_network: bool,
        now: Instant,
    ) -> Self {
        Self {
            registered: account.is_registered(),
            push_available: account.is_push_available(),
            has_network,
            censored: account.is_censored(),
            app,
            now,
        }
    }
}

/// Decides whether a realtime connection is needed right now.
pub fn is_connection_needed(inputs: &NecessityInputs, config: &RetrievalConfig) -> bool {
    let idle = inputs.app.idle_duration(inputs.now);
    let within_background_window = idle < config.max_background_time(inputs.censored);
    let needed = inputs.registered
        && (inputs.app.is_foreground || within_background_window || !inputs.push_available)
        && inputs.has_network;

    debug!(
        needed,
        has_network = inputs.has_network,
        foreground = inputs.app.is_foreground,
        idle_ms = idle.as_millis() as u64,
        push_available = inputs.push_available,
        registered = inputs.registered,
        censored = inputs.censored,
        "retrieval: connection necessity evaluated"
    );
    needed
}

#[cfg(test)]
#[path = "tests/necessity_tests.rs"]
mod tests;
