//! Persistence contract (spec §4.5 step 8, §5, §6): the engine never talks
//! to storage directly. It builds records and enqueues them on a bounded
//! channel; a dedicated writer task drains the channel and dispatches each
//! record to the host-supplied repository that owns it.
//!
//! Grounded on `rama-http`'s `traffic_writer::request::RequestWriterInspector`:
//! a bounded `tokio::sync::mpsc` channel feeding a single consumer task
//! spawned once, wrapped in a `tracing::trace_root_span!(..., otel.kind =
//! "consumer")` span.

use std::time::SystemTime;

use bytes::Bytes;
use tokio::sync::mpsc::{Receiver, Sender, channel};
use tracing::Instrument;

use crate::error::{ErrorContext, OpaqueError};
use crate::id::TxId;

/// Capacity of the persistence channel (spec §5: "bounded (capacity 10)
/// single-consumer queue; producers block when full").
pub const CHANNEL_CAPACITY: usize = 10;

#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub id: TxId,
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub at: SystemTime,
}

#[derive(Debug, Clone)]
pub struct ResponseRecord {
    pub id: TxId,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub content_type: String,
    pub at: SystemTime,
}

#[derive(Debug, Clone)]
pub struct LaunchpadLink {
    pub request_id: TxId,
    pub launchpad_id: TxId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub at: SystemTime,
}

/// Traffic repository: the request/response halves of a transaction.
pub trait TrafficRepository: Send + Sync + 'static {
    fn insert_request(&self, record: RequestRecord) -> impl Future<Output = Result<(), OpaqueError>> + Send + '_;
    fn insert_response(&self, record: ResponseRecord) -> impl Future<Output = Result<(), OpaqueError>> + Send + '_;
}

/// Links a persisted request back to the launchpad replay that produced it.
pub trait LaunchpadRepository: Send + Sync + 'static {
    fn link(&self, link: LaunchpadLink) -> impl Future<Output = Result<(), OpaqueError>> + Send + '_;
}

/// Structured log sink (distinct from `tracing`'s own output -- this is the
/// operator-facing audit log, not process diagnostics).
pub trait LogRepository: Send + Sync + 'static {
    fn insert(&self, entry: LogEntry) -> impl Future<Output = Result<(), OpaqueError>> + Send + '_;
}

/// The waypoint override map's backing store (spec §4.6 consults this
/// indirectly through [`crate::waypoint::Waypoints::sync`]).
pub trait WaypointRepository: Send + Sync + 'static {
    fn load_all(&self) -> impl Future<Output = Result<Vec<(String, String)>, OpaqueError>> + Send + '_;
}

/// Opaque per-extension configuration, read at extension (re)load and
/// written back when the operator edits it through the host UI.
pub trait ExtensionConfigRepository: Send + Sync + 'static {
    fn read(&self, extension_id: &str) -> impl Future<Output = Result<Option<serde_json::Value>, OpaqueError>> + Send + '_;
    fn write(&self, extension_id: &str, value: serde_json::Value) -> impl Future<Output = Result<(), OpaqueError>> + Send + '_;
}

/// Coarse operational counters (requests seen, drops, interceptions) the
/// host surfaces to operators; the core only increments, never reads back.
pub trait StatsRepository: Send + Sync + 'static {
    fn increment(&self, counter: &'static str) -> impl Future<Output = Result<(), OpaqueError>> + Send + '_;
}

/// One record the writer task knows how to dispatch.
pub enum PersistenceItem {
    Request(RequestRecord),
    Response(ResponseRecord),
    LaunchpadLink(LaunchpadLink),
    Log(LogEntry),
    StatsIncrement(&'static str),
}

/// The bundle of repositories a host must supply to run the persistence
/// writer task. Spec §4.5 step 8 names "traffic", "launchpad"; §4.9/§10
/// (log, stats) round out the bundle the writer dispatches against.
pub trait Repositories: Send + Sync + 'static {
    type Traffic: TrafficRepository;
    type Launchpad: LaunchpadRepository;
    type Log: LogRepository;
    type Stats: StatsRepository;

    fn traffic(&self) -> &Self::Traffic;
    fn launchpad(&self) -> &Self::Launchpad;
    fn log(&self) -> &Self::Log;
    fn stats(&self) -> &Self::Stats;
}

/// A handle producers enqueue onto; cheap to clone, backpressures once the
/// channel is full (spec §5).
#[derive(Clone)]
pub struct PersistenceHandle(Sender<PersistenceItem>);

impl PersistenceHandle {
    pub async fn enqueue(&self, item: PersistenceItem) -> Result<(), OpaqueError> {
        self.0
            .send(item)
            .await
            .context("enqueue persistence item: writer task is gone")
    }
}

/// Spawn the single writer task that drains the persistence channel and
/// dispatches each item to the repository that owns it (spec §5: "a
/// dedicated writer task drains it and dispatches to the correct
/// repository").
pub fn spawn_writer<R>(repos: R) -> PersistenceHandle
where
    R: Repositories,
{
    let (tx, rx) = channel(CHANNEL_CAPACITY);
    let span = tracing::trace_span!("persistence_writer", otel.kind = "consumer");
    tokio::spawn(drain(repos, rx).instrument(span));
    PersistenceHandle(tx)
}

async fn drain<R>(repos: R, mut rx: Receiver<PersistenceItem>)
where
    R: Repositories,
{
    while let Some(item) = rx.recv().await {
        let result = match item {
            PersistenceItem::Request(record) => repos.traffic().insert_request(record).await,
            PersistenceItem::Response(record) => repos.traffic().insert_response(record).await,
            PersistenceItem::LaunchpadLink(link) => repos.launchpad().link(link).await,
            PersistenceItem::Log(entry) => repos.log().insert(entry).await,
            PersistenceItem::StatsIncrement(counter) => repos.stats().increment(counter).await,
        };
        if let Err(err) = result {
            tracing::error!(error = %err, "persistence write failed");
        }
    }
    tracing::debug!("persistence writer exiting: all handles dropped");
}
