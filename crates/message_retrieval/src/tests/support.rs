//! Hand-written fakes for the injected collaborators.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use shared::{
    domain::{DeviceId, Envelope, EnvelopeType, ServiceId},
    error::TransportError,
    protocol::{ConnectionState, MessageBatch},
};
use tokio::sync::{broadcast, watch};

use crate::{
    backoff::SleepTimer,
    decrypt::{DecryptionResult, Decryptor, PassthroughDecryptor, ProtocolStoreBuffer},
    jobs::{FollowUpJob, JobScheduler},
    network::{ConnectivityMonitor, NetworkCallback},
    store::{MessageStore, StoreTransaction},
    transport::MessageTransport,
};

pub const SENDER: &str = "8c4c8e54-0c2b-4a3c-a3a0-0d6d7e2f9a11";

pub fn sender() -> ServiceId {
    ServiceId::parse_or_none(SENDER).expect("valid sender")
}

pub fn envelope(envelope_type: EnvelopeType, timestamp: i64) -> Envelope {
    Envelope {
        envelope_type,
        timestamp,
        source_service_id: Some(SENDER.into()),
        source_device: Some(DeviceId(1)),
        server_timestamp: timestamp + 10,
        server_delivered_timestamp: timestamp + 25,
        urgent: true,
        server_guid: Some(format!("guid-{timestamp}")),
        content: format!("body-{timestamp}").into_bytes(),
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

/// Cross-fake record of externally visible side effects, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Commit,
    Schedule(usize),
    Ack(i64),
}

pub type EventLog = Arc<Mutex<Vec<Event>>>;

pub enum ReadStep {
    Batch(MessageBatch),
    Fail(TransportError),
}

pub struct FakeTransport {
    state: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<ConnectionState>,
    script: Mutex<VecDeque<ReadStep>>,
    connect_results: Mutex<VecDeque<Result<(), TransportError>>>,
    ack_failure: Mutex<Option<TransportError>>,
    keep_alive_tokens: Mutex<HashSet<String>>,
    pub acks: Mutex<Vec<i64>>,
    pub reads: AtomicUsize,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    events: EventLog,
}

impl FakeTransport {
    pub fn new(events: EventLog) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (transitions, _) = broadcast::channel(16);
        Self {
            state,
            transitions,
            script: Mutex::new(VecDeque::new()),
            connect_results: Mutex::new(VecDeque::new()),
            ack_failure: Mutex::new(None),
            keep_alive_tokens: Mutex::new(HashSet::new()),
            acks: Mutex::new(Vec::new()),
            reads: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            events,
        }
    }

    fn set_state(&self, state: ConnectionState) {
        if self.state.send_replace(state) != state {
            let _ = self.transitions.send(state);
        }
    }

    pub fn push_read(&self, step: ReadStep) {
        self.script.lock().push_back(step);
    }

    pub fn push_connect_result(&self, result: Result<(), TransportError>) {
        self.connect_results.lock().push_back(result);
    }

    pub fn fail_acks_with(&self, err: TransportError) {
        *self.ack_failure.lock() = Some(err);
    }

    pub fn has_keep_alive_token(&self, token: &str) -> bool {
        self.keep_alive_tokens.lock().contains(token)
    }

    pub fn acked(&self) -> Vec<i64> {
        self.acks.lock().clone()
    }
}

#[async_trait]
impl MessageTransport for FakeTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let result = self.connect_results.lock().pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            self.set_state(ConnectionState::Connected);
        }
        result
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
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
        self.reads.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.subscribe();
        if !state.borrow_and_update().is_connected() {
            return Err(TransportError::unavailable("not connected"));
        }
        let next = self.script.lock().pop_front();
        match next {
            Some(ReadStep::Batch(mut batch)) => {
                batch.items.truncate(max_count);
                Ok(batch)
            }
            Some(ReadStep::Fail(err)) => Err(err),
            None => {
                tokio::select! {
                    _ = state.wait_for(|s| !s.is_connected()) => {
                        Err(TransportError::unavailable("disconnected during read"))
                    }
                    _ = tokio::time::sleep(timeout) => Err(TransportError::Timeout),
                }
            }
        }
    }

    async fn send_ack(&self, envelope: &Envelope) -> Result<(), TransportError> {
        if let Some(err) = self.ack_failure.lock().clone() {
            return Err(err);
        }
        self.acks.lock().push(envelope.timestamp);
        self.events.lock().push(Event::Ack(envelope.timestamp));
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

#[derive(Debug, Default)]
pub struct StoreContents {
    pub receipts: Vec<(i64, ServiceId)>,
    pub deleted_send_logs: Vec<(i64, ServiceId, DeviceId)>,
    pub protocol_records: HashMap<(String, String), Vec<u8>>,
    pub begins: usize,
    pub commits: usize,
}

pub struct FakeStore {
    pub contents: Arc<Mutex<StoreContents>>,
    known_sent: HashSet<(i64, ServiceId)>,
    commit_failures: Arc<AtomicU32>,
    events: EventLog,
}

impl FakeStore {
    pub fn new(events: EventLog) -> Self {
        Self {
            contents: Arc::new(Mutex::new(StoreContents::default())),
            known_sent: HashSet::new(),
            commit_failures: Arc::new(AtomicU32::new(0)),
            events,
        }
    }

    pub fn with_sent_message(mut self, timestamp: i64, recipient: ServiceId) -> Self {
        self.known_sent.insert((timestamp, recipient));
        self
    }

    /// The next `times` commits fail.
    pub fn fail_commits(&self, times: u32) {
        self.commit_failures.store(times, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct StagedWrites {
    receipts: Vec<(i64, ServiceId)>,
    deleted_send_logs: Vec<(i64, ServiceId, DeviceId)>,
    puts: Vec<(String, String, Vec<u8>)>,
    deletes: Vec<(String, String)>,
}

pub struct FakeTransaction {
    staged: StagedWrites,
    known_sent: HashSet<(i64, ServiceId)>,
    contents: Arc<Mutex<StoreContents>>,
    commit_failures: Arc<AtomicU32>,
    events: EventLog,
}

#[async_trait]
impl MessageStore for FakeStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        self.contents.lock().begins += 1;
        Ok(Box::new(FakeTransaction {
            staged: StagedWrites::default(),
            known_sent: self.known_sent.clone(),
            contents: Arc::clone(&self.contents),
            commit_failures: Arc::clone(&self.commit_failures),
            events: Arc::clone(&self.events),
        }))
    }
}

#[async_trait]
impl StoreTransaction for FakeTransaction {
    async fn increment_delivery_receipt_count(
        &mut self,
        sent_timestamp: i64,
        recipient: ServiceId,
        _receipt_time: DateTime<Utc>,
    ) -> Result<bool> {
        self.staged.receipts.push((sent_timestamp, recipient));
        Ok(self.known_sent.contains(&(sent_timestamp, recipient)))
    }

    async fn delete_send_log_entries(
        &mut self,
        sent_timestamp: i64,
        recipient: ServiceId,
        recipient_device: DeviceId,
    ) -> Result<u64> {
        self.staged
            .deleted_send_logs
            .push((sent_timestamp, recipient, recipient_device));
        Ok(1)
    }

    async fn put_protocol_record(
        &mut self,
        namespace: &str,
        key: &str,
        value: &[u8],
    ) -> Result<()> {
        self.staged
            .puts
            .push((namespace.to_string(), key.to_string(), value.to_vec()));
        Ok(())
    }

    async fn delete_protocol_record(&mut self, namespace: &str, key: &str) -> Result<()> {
        self.staged
            .deletes
            .push((namespace.to_string(), key.to_string()));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let FakeTransaction {
            staged,
            contents,
            commit_failures,
            events,
            ..
        } = *self;
        let remaining = commit_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            commit_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(anyhow!("database disk image is malformed"));
        }
        let mut contents = contents.lock();
        contents.receipts.extend(staged.receipts);
        contents.deleted_send_logs.extend(staged.deleted_send_logs);
        for (namespace, key, value) in staged.puts {
            contents.protocol_records.insert((namespace, key), value);
        }
        for key in staged.deletes {
            contents.protocol_records.remove(&key);
        }
        contents.commits += 1;
        events.lock().push(Event::Commit);
        Ok(())
    }
}

/// Decrypts by envelope timestamp; anything unscripted passes through.
#[derive(Default)]
pub struct ScriptedDecryptor {
    results: Mutex<HashMap<i64, DecryptionResult>>,
    pub decrypted: Mutex<Vec<i64>>,
}

impl ScriptedDecryptor {
    pub fn with_result(self, timestamp: i64, result: DecryptionResult) -> Self {
        self.results.lock().insert(timestamp, result);
        self
    }
}

#[async_trait]
impl Decryptor for ScriptedDecryptor {
    async fn decrypt(
        &self,
        buffer: &mut ProtocolStoreBuffer,
        envelope: &Envelope,
    ) -> DecryptionResult {
        self.decrypted.lock().push(envelope.timestamp);
        buffer.put(
            "session",
            format!("{}.{}", SENDER, envelope.timestamp),
            envelope.content.clone(),
        );
        let scripted = self.results.lock().remove(&envelope.timestamp);
        match scripted {
            Some(result) => result,
            None => PassthroughDecryptor.decrypt(buffer, envelope).await,
        }
    }
}

pub struct RecordingScheduler {
    pub jobs: Mutex<Vec<FollowUpJob>>,
    events: EventLog,
}

impl RecordingScheduler {
    pub fn new(events: EventLog) -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            events,
        }
    }
}

impl JobScheduler for RecordingScheduler {
    fn apply_follow_ups(&self, jobs: Vec<FollowUpJob>) {
        self.events.lock().push(Event::Schedule(jobs.len()));
        self.jobs.lock().extend(jobs);
    }
}

#[derive(Default)]
pub struct RecordingSleepTimer {
    pub sleeps: Mutex<Vec<Duration>>,
}

#[async_trait]
impl SleepTimer for RecordingSleepTimer {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
        tokio::task::yield_now().await;
    }
}

#[derive(Default)]
pub struct FakeMonitor {
    pub registered: Mutex<Vec<Arc<dyn NetworkCallback>>>,
    pub registrations: AtomicUsize,
    pub unregistrations: AtomicUsize,
    failures_remaining: AtomicU32,
}

impl FakeMonitor {
    pub fn failing(times: u32) -> Self {
        let monitor = Self::default();
        monitor.failures_remaining.store(times, Ordering::SeqCst);
        monitor
    }

    pub fn active(&self) -> Arc<dyn NetworkCallback> {
        self.registered
            .lock()
            .last()
            .cloned()
            .expect("a callback is registered")
    }
}

impl ConnectivityMonitor for FakeMonitor {
    fn register_callback(&self, callback: Arc<dyn NetworkCallback>) -> Result<()> {
        self.registrations.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("connectivity service not ready");
        }
        self.registered.lock().push(callback);
        Ok(())
    }

    fn unregister_callback(&self, callback: &Arc<dyn NetworkCallback>) {
        self.unregistrations.fetch_add(1, Ordering::SeqCst);
        self.registered
            .lock()
            .retain(|existing| !Arc::ptr_eq(existing, callback));
    }
}
