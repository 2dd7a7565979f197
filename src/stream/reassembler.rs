//! Per-connection reassembly state machine.

use core::net::SocketAddr;
use core::time::Duration;
use std::time::SystemTime;
use tracing::debug;

use super::buffer::SegmentBuffer;
use crate::http::{HttpRequestExtractor, RequestEvent};
use crate::packet::{Direction, Segment};

/// Lifecycle of a tracked connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// First segment was a SYN; handshake not yet complete.
    SynSeen,
    Established,
    /// One direction has sent FIN.
    HalfClosed,
    /// Both directions sent FIN, a RST was seen, or the connection was flushed.
    Closed,
}

/// Reassembles both directions of one TCP connection and feeds the ordered
/// bytes to an HTTP request extractor.
#[derive(Debug)]
pub struct StreamReassembler {
    client: SocketAddr,
    server: SocketAddr,
    state: ConnectionState,
    buffers: [SegmentBuffer; 2],
    /// End-of-stream already signalled per direction.
    ended: [bool; 2],
    extractor: HttpRequestExtractor,
    last_activity: SystemTime,
}

impl StreamReassembler {
    pub fn new(
        client: SocketAddr,
        server: SocketAddr,
        first: &Segment,
        max_pending_bytes: usize,
    ) -> Self {
        let state = if first.flags.syn {
            ConnectionState::SynSeen
        } else {
            ConnectionState::Established
        };

        Self {
            client,
            server,
            state,
            buffers: [
                SegmentBuffer::new(max_pending_bytes),
                SegmentBuffer::new(max_pending_bytes),
            ],
            ended: [false; 2],
            extractor: HttpRequestExtractor::new(client, server),
            last_activity: first.timestamp,
        }
    }

    /// Route a segment to the buffer of its direction and advance the state
    /// machine from its flags.
    pub fn feed(&mut self, direction: Direction, segment: &Segment) {
        self.last_activity = self.last_activity.max(segment.timestamp);
        if self.is_retired() {
            return;
        }

        if segment.flags.rst {
            debug!(client = %self.client, server = %self.server, "connection reset");
            for buffer in &mut self.buffers {
                buffer.close();
            }
            self.state = ConnectionState::Closed;
            return;
        }

        let index = direction.index();
        self.buffers[index].insert(segment);

        if self.state == ConnectionState::SynSeen
            && (!segment.flags.syn || !segment.payload.is_empty())
        {
            self.state = ConnectionState::Established;
        }

        if segment.flags.fin && self.state != ConnectionState::Closed {
            self.state = if self.buffers[direction.reverse().index()].fin_seen() {
                ConnectionState::Closed
            } else {
                ConnectionState::HalfClosed
            };
        }
    }

    /// Deliver whatever became contiguous in `direction` to the extractor,
    /// signalling end-of-stream once the direction can deliver nothing more.
    pub fn pull_available_bytes(&mut self, direction: Direction, events: &mut Vec<RequestEvent>) {
        let index = direction.index();
        if self.ended[index] {
            return;
        }

        let bytes = self.buffers[index].drain();
        if !bytes.is_empty() {
            self.extractor
                .on_bytes(direction, &bytes, self.last_activity, events);
        }

        if self.buffers[index].is_finished() {
            if self.buffers[index].is_desynced() {
                debug!(
                    client = %self.client,
                    server = %self.server,
                    ?direction,
                    "abandoning desynced direction"
                );
            }
            self.end_direction(direction);
        }
    }

    /// Finalize both directions without waiting for FIN or RST.
    pub fn force_flush(&mut self, events: &mut Vec<RequestEvent>) {
        for direction in [Direction::ClientToServer, Direction::ServerToClient] {
            self.pull_available_bytes(direction, events);
            self.buffers[direction.index()].close();
            self.end_direction(direction);
        }
        self.state = ConnectionState::Closed;
    }

    fn end_direction(&mut self, direction: Direction) {
        let index = direction.index();
        if self.ended[index] {
            return;
        }
        self.ended[index] = true;
        self.extractor.on_end_of_stream(direction);

        let stats = self.buffers[index].stats();
        debug!(
            client = %self.client,
            server = %self.server,
            ?direction,
            segments = stats.segments,
            retransmissions = stats.retransmissions,
            out_of_order = stats.out_of_order,
            bytes = stats.bytes_delivered,
            "direction finished"
        );
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn last_activity(&self) -> SystemTime {
        self.last_activity
    }

    /// No activity for longer than `threshold` as of `now`.
    pub fn is_idle(&self, threshold: Duration, now: SystemTime) -> bool {
        now.duration_since(self.last_activity)
            .is_ok_and(|idle| idle > threshold)
    }

    /// Closed and fully drained; the connection can be dropped.
    pub fn is_retired(&self) -> bool {
        self.state == ConnectionState::Closed && self.ended.iter().all(|ended| *ended)
    }

    /// Bytes held behind gaps in both directions.
    pub fn pending_bytes(&self) -> usize {
        self.buffers.iter().map(SegmentBuffer::pending_bytes).sum()
    }

    pub fn client(&self) -> SocketAddr {
        self.client
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }
}
