//! Process-wide SSE broadcast hub.
//!
//! Every registered connection receives every broadcast frame. Subscriptions
//! are recorded for diagnostics but never used to select recipients; browsers
//! filter by scope themselves.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use lace_core::events::StreamEvent;
use lace_core::ids::{ConnectionId, ProjectId, SessionId, ThreadId};
use lace_telemetry::MetricsRecorder;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{SendError, StreamError};
use crate::frame::{self, FrameId};
use crate::sink::EventSink;

static GLOBAL: OnceLock<Arc<EventStreamManager>> = OnceLock::new();

/// What a client said it is interested in. Recorded, not enforced.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    #[serde(default)]
    pub sessions: Vec<SessionId>,
    #[serde(default)]
    pub projects: Vec<ProjectId>,
    #[serde(default)]
    pub threads: Vec<ThreadId>,
}

impl Subscription {
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty() && self.projects.is_empty() && self.threads.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct ManagerConfig {
    pub max_connections: usize,
    pub replay_buffer: usize,
    pub retry_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            replay_buffer: 500,
            retry_ms: 3000,
        }
    }
}

/// Result of one fan-out, mostly for logging and tests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub event_id: Option<FrameId>,
    pub delivered: usize,
    pub dropped: usize,
}

struct Connection {
    id: ConnectionId,
    sink: Box<dyn EventSink>,
    subscription: Option<Subscription>,
    closed: AtomicBool,
}

impl Connection {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.sink.close();
        }
    }
}

/// Id assignment plus recent history for `Last-Event-ID` replay.
struct Sequencer {
    last_seq: u64,
    history: VecDeque<(u64, Bytes)>,
}

impl Sequencer {
    fn next_id(&mut self) -> FrameId {
        self.last_seq += 1;
        FrameId {
            millis: Utc::now().timestamp_millis(),
            seq: self.last_seq,
        }
    }

    fn remember(&mut self, seq: u64, frame: Bytes, capacity: usize) {
        if capacity == 0 {
            return;
        }
        while self.history.len() >= capacity {
            self.history.pop_front();
        }
        self.history.push_back((seq, frame));
    }

    fn since(&self, seq: u64) -> impl Iterator<Item = &Bytes> {
        self.history
            .iter()
            .filter(move |(s, _)| *s > seq)
            .map(|(_, frame)| frame)
    }
}

pub struct EventStreamManager {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    sequencer: Mutex<Sequencer>,
    config: ManagerConfig,
    metrics: Arc<MetricsRecorder>,
}

impl EventStreamManager {
    pub fn new(config: ManagerConfig, metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            connections: DashMap::new(),
            sequencer: Mutex::new(Sequencer {
                last_seq: 0,
                history: VecDeque::with_capacity(config.replay_buffer),
            }),
            config,
            metrics,
        }
    }

    /// The process-wide instance. Created with defaults on first use unless
    /// [`install_global`](Self::install_global) ran earlier.
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(|| {
            Arc::new(Self::new(
                ManagerConfig::default(),
                Arc::new(MetricsRecorder::new()),
            ))
        }))
    }

    /// Make `manager` the process-wide instance. Fails (returning it) if one
    /// already exists.
    pub fn install_global(manager: Arc<Self>) -> Result<(), Arc<Self>> {
        GLOBAL.set(manager)
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &MetricsRecorder {
        &self.metrics
    }

    /// Register a sink and send it the connection-confirmation frame.
    ///
    /// A failing confirmation write is returned to the caller, the sink is
    /// closed and nothing is registered.
    pub fn add_connection(
        &self,
        sink: Box<dyn EventSink>,
        subscription: Option<Subscription>,
    ) -> Result<ConnectionId, StreamError> {
        self.resume_connection(sink, subscription, None)
    }

    /// Like [`add_connection`](Self::add_connection), then replays buffered
    /// frames newer than `last_event_id`. Registration happens under the
    /// broadcast lock so the client sees neither a gap nor a duplicate.
    ///
    /// The sink must accept `replay_buffer + 1` frames without draining, or a
    /// client resuming from an old id is rejected.
    pub fn resume_connection(
        &self,
        sink: Box<dyn EventSink>,
        subscription: Option<Subscription>,
        last_event_id: Option<&str>,
    ) -> Result<ConnectionId, StreamError> {
        let id = ConnectionId::new();
        let confirmation = frame::connection_frame(&id, self.config.retry_ms)?;

        // Insertions only happen under this lock, so the limit holds.
        let sequencer = self.sequencer.lock();
        let limit = self.config.max_connections;
        if self.connections.len() >= limit {
            drop(sequencer);
            tracing::warn!(limit, "Rejecting SSE connection, limit reached");
            return Err(StreamError::CapacityExceeded { limit });
        }

        if let Err(e) = sink.enqueue(confirmation) {
            sink.error(&e.to_string());
            sink.close();
            return Err(e.into());
        }

        let resume_from = last_event_id.and_then(|raw| match raw.parse::<FrameId>() {
            Ok(frame_id) => Some(frame_id.seq),
            Err(_) => {
                tracing::debug!(last_event_id = raw, "Ignoring unparseable Last-Event-ID");
                None
            }
        });
        let mut replayed = 0usize;
        if let Some(seq) = resume_from {
            for frame in sequencer.since(seq) {
                if let Err(e) = sink.enqueue(frame.clone()) {
                    sink.error(&e.to_string());
                    sink.close();
                    return Err(e.into());
                }
                replayed += 1;
            }
        }

        let connection = Arc::new(Connection {
            id: id.clone(),
            sink,
            subscription,
            closed: AtomicBool::new(false),
        });
        self.connections.insert(id.clone(), connection);
        drop(sequencer);

        self.metrics
            .gauge_set("sse.connections.active", self.connections.len() as f64);
        tracing::info!(connection_id = %id, replayed, "SSE connection registered");
        Ok(id)
    }

    /// Close and forget a connection. Unknown IDs are ignored.
    pub fn remove_connection(&self, id: &ConnectionId) {
        if self.detach(id) {
            tracing::info!(connection_id = %id, "SSE connection removed");
        }
    }

    /// Send `event` to every connection. Never fails; connections whose sink
    /// rejects the frame are closed and removed.
    pub fn broadcast(&self, event: &StreamEvent) -> BroadcastOutcome {
        let mut sequencer = self.sequencer.lock();
        let event_id = sequencer.next_id();
        let frame = match frame::event_frame(event_id, event) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(event_id = %event_id, error = %e, "Failed to format SSE frame");
                return BroadcastOutcome {
                    event_id: None,
                    delivered: 0,
                    dropped: 0,
                };
            }
        };
        sequencer.remember(event_id.seq, frame.clone(), self.config.replay_buffer);

        let targets: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut delivered = 0;
        let mut dropped = 0;
        for connection in &targets {
            match connection.sink.enqueue(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    dropped += 1;
                    self.drop_failed(connection, &e);
                }
            }
        }
        drop(sequencer);

        self.metrics.counter_inc("sse.broadcasts", 1);
        self.metrics
            .counter_inc("sse.frames.delivered", delivered as u64);
        self.metrics
            .histogram_observe("sse.broadcast.fanout", targets.len() as f64);
        tracing::debug!(
            event_id = %event_id,
            event_type = ?event.event_type,
            delivered,
            dropped,
            "Broadcast SSE event"
        );

        BroadcastOutcome {
            event_id: Some(event_id),
            delivered,
            dropped,
        }
    }

    /// Close and remove every connection.
    pub fn cleanup(&self) {
        let ids: Vec<ConnectionId> = self.connection_ids();
        let count = ids.len();
        for id in ids {
            self.detach(&id);
        }
        if count > 0 {
            tracing::info!(closed = count, "Closed all SSE connections");
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    pub fn subscription(&self, id: &ConnectionId) -> Option<Subscription> {
        self.connections
            .get(id)
            .and_then(|c| c.subscription.clone())
    }

    fn drop_failed(&self, connection: &Connection, error: &SendError) {
        tracing::warn!(
            connection_id = %connection.id,
            error = %error,
            "SSE write failed, dropping connection"
        );
        connection.sink.error(&error.to_string());
        if self.detach(&connection.id) {
            self.metrics.counter_inc("sse.connections.dropped", 1);
        }
    }

    /// Remove from the registry and close. Returns whether it was present.
    fn detach(&self, id: &ConnectionId) -> bool {
        match self.connections.remove(id) {
            Some((_, connection)) => {
                connection.close();
                self.metrics
                    .gauge_set("sse.connections.active", self.connections.len() as f64);
                true
            }
            None => false,
        }
    }
}
