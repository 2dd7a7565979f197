//! Connection table shared by capture threads and the idle sweeper.

use core::time::Duration;
use dashmap::DashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;
use tracing::{debug, trace};

use super::reassembler::{ConnectionState, StreamReassembler};
use crate::http::RequestEvent;
use crate::packet::{Direction, FlowKey, Segment};
use crate::sink::EventSink;

type Flow = Arc<Mutex<StreamReassembler>>;

/// Routes segments to per-connection reassemblers and retires connections
/// once they close or go idle.
///
/// Segments of different connections are processed in parallel. Segments of
/// the same connection are serialized by that connection's lock, and its
/// events reach the sink in the order they were completed.
pub struct Coordinator {
    flows: DashMap<FlowKey, Flow>,
    sink: Arc<dyn EventSink>,
    max_pending_bytes: usize,
}

impl Coordinator {
    pub fn new(sink: Arc<dyn EventSink>, max_pending_bytes: usize) -> Self {
        Self {
            flows: DashMap::new(),
            sink,
            max_pending_bytes,
        }
    }

    /// Process one segment sent from `key.source()` to `key.destination()`.
    ///
    /// `direction` only decides which endpoint is the client when the segment
    /// opens a new connection. Later segments are oriented against the client
    /// endpoint recorded at that point.
    pub fn submit(&self, key: FlowKey, direction: Direction, segment: &Segment) {
        loop {
            let flow = self.flow(key, direction, segment);
            let mut stream = lock(&flow);
            if stream.is_retired() {
                // Lost a race with a retirement; the next lookup starts a fresh connection
                drop(stream);
                self.flows.remove_if(&key, |_, v| Arc::ptr_eq(v, &flow));
                continue;
            }

            let direction = if key.source() == stream.client() {
                Direction::ClientToServer
            } else {
                Direction::ServerToClient
            };
            let mut events = Vec::new();
            stream.feed(direction, segment);
            stream.pull_available_bytes(direction, &mut events);
            if stream.state() == ConnectionState::Closed {
                stream.pull_available_bytes(direction.reverse(), &mut events);
            }
            self.emit(&events);

            if stream.is_retired() {
                debug!(%key, "connection closed");
                self.flows.remove_if(&key, |_, v| Arc::ptr_eq(v, &flow));
            }
            return;
        }
    }

    /// Force-flush and drop every connection idle for longer than
    /// `idle_timeout` as of `now`. Returns the number of connections evicted.
    pub fn sweep(&self, idle_timeout: Duration, now: SystemTime) -> usize {
        let mut evicted = 0;
        for (key, flow) in self.snapshot() {
            let mut stream = lock(&flow);
            if stream.is_retired() || !stream.is_idle(idle_timeout, now) {
                continue;
            }

            let mut events = Vec::new();
            stream.force_flush(&mut events);
            self.emit(&events);
            if self.flows.remove_if(&key, |_, v| Arc::ptr_eq(v, &flow)).is_some() {
                evicted += 1;
                trace!(%key, "evicted idle connection");
            }
        }

        if evicted > 0 {
            debug!(evicted, remaining = self.flows.len(), "swept idle connections");
        }
        evicted
    }

    /// Force-flush and drop every connection, e.g. at shutdown.
    pub fn flush_all(&self) {
        let flows = self.snapshot();
        let count = flows.len();
        for (key, flow) in flows {
            let mut stream = lock(&flow);
            let mut events = Vec::new();
            stream.force_flush(&mut events);
            self.emit(&events);
            self.flows.remove_if(&key, |_, v| Arc::ptr_eq(v, &flow));
        }
        debug!(count, "flushed all connections");
    }

    /// Number of tracked connections.
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Look up or create the connection for `key`. The map shard lock is
    /// released before the caller locks the connection.
    fn flow(&self, key: FlowKey, direction: Direction, segment: &Segment) -> Flow {
        self.flows
            .entry(key)
            .or_insert_with(|| {
                let (client, server) = match direction {
                    Direction::ClientToServer => (key.source(), key.destination()),
                    Direction::ServerToClient => (key.destination(), key.source()),
                };
                trace!(%client, %server, "tracking new connection");
                Arc::new(Mutex::new(StreamReassembler::new(
                    client,
                    server,
                    segment,
                    self.max_pending_bytes,
                )))
            })
            .clone()
    }

    fn snapshot(&self) -> Vec<(FlowKey, Flow)> {
        self.flows
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect()
    }

    fn emit(&self, events: &[RequestEvent]) {
        for event in events {
            self.sink.emit(event);
        }
    }
}

fn lock(flow: &Mutex<StreamReassembler>) -> MutexGuard<'_, StreamReassembler> {
    flow.lock().unwrap_or_else(PoisonError::into_inner)
}
