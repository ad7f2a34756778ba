pub mod backoff;
pub mod batch;
pub mod config;
pub mod decrypt;
pub mod drained;
pub mod error;
pub mod jobs;
pub mod lifecycle;
pub mod necessity;
pub mod network;
pub mod store;
pub mod supervisor;
pub mod transport;

pub use backoff::{exponential_backoff, SleepTimer, TokioSleepTimer};
pub use batch::{BatchResult, EnvelopeOutcome, MessageBatchProcessor, ProcessingLocks};
pub use config::{load_config, RetrievalConfig};
pub use decrypt::{
    DecryptionOutcome, DecryptionResult, Decryptor, MessageState, PassthroughDecryptor,
    ProtocolStoreBuffer,
};
pub use drained::{DecryptionDrainedFlag, DrainedListener, DrainedListenerId};
pub use error::{RetrievalError, RetrievalResult};
pub use jobs::{ChannelJobScheduler, FollowUpJob, JobScheduler};
pub use lifecycle::{AppLifecycleTracker, AppState};
pub use necessity::{is_connection_needed, AccountFlags, AccountStatus, NecessityInputs};
pub use network::{
    ConnectivityMonitor, ConnectivityState, NetworkCallback, NetworkStateAggregator,
};
pub use store::{MessageStore, StoreTransaction};
pub use supervisor::{ConnectionSupervisor, SupervisorDeps, SupervisorPhase};
pub use transport::MessageTransport;

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
