use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppState {
    pub is_foreground: bool,
    pub last_interaction_time: Instant,
}

impl AppState {
    /// Zero while foregrounded, otherwise time since the app was backgrounded.
    pub fn idle_duration(&self, now: Instant) -> Duration {
        if self.is_foreground {
            Duration::ZERO
        } else {
            now.saturating_duration_since(self.last_interaction_time)
        }
    }
}

/// Tracks foreground/background transitions of the host application.
///
/// Every transition is published to subscribers; the retrieval loop turns that
/// into a wake-up rather than being called directly.
pub struct AppLifecycleTracker {
    state: watch::Sender<AppState>,
}

impl AppLifecycleTracker {
    pub fn new() -> Self {
        let (state, _) = watch::channel(AppState {
            is_foreground: false,
            last_interaction_time: Instant::now(),
        });
        Self { state }
    }

    pub fn on_foreground(&self) {
        debug!("lifecycle: app foregrounded");
        self.state.send_modify(|state| state.is_foreground = true);
    }

    pub fn on_background(&self) {
        self.on_background_at(Instant::now());
    }

    pub fn on_background_at(&self, at: Instant) {
        debug!("lifecycle: app backgrounded");
        self.state.send_modify(|state| {
            state.is_foreground = false;
            state.last_interaction_time = at;
        });
    }

    pub fn current(&self) -> AppState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<AppState> {
        self.state.subscribe()
    }
}

impl Default for AppLifecycleTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "tests/lifecycle_tests.rs"]
mod tests;
