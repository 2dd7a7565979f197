//! Per-direction TCP segment buffer.
//!
//! This module provides the `SegmentBuffer` struct which holds the segments of
//! one direction of a connection until they can be delivered in order.
//!
//! Sequence numbers are unwrapped into 64-bit stream offsets measured from the
//! first byte of the direction, so ordering survives 32-bit wraparound.
//! Overlapping retransmissions keep the bytes that were stored first: a new
//! segment only ever fills holes between bytes already held.

use std::collections::BTreeMap;
use tracing::{debug, trace};

use crate::packet::Segment;

pub(crate) const DEFAULT_MAX_PENDING_BYTES: usize = 1024 * 1024;

/// Counters describing what a buffer has seen.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BufferStats {
    pub segments: u64,
    pub retransmissions: u64,
    pub out_of_order: u64,
    pub bytes_delivered: u64,
}

/// Reorders the segments of one direction into a contiguous byte sequence
#[derive(Debug)]
pub struct SegmentBuffer {
    /// Sequence number of the next byte to deliver, once known.
    next_seq: Option<u32>,
    /// Stream offset of the next byte to deliver.
    delivered: u64,
    /// Undeliverable ranges keyed by stream offset. Never overlapping.
    pending: BTreeMap<u64, Vec<u8>>,
    pending_bytes: usize,
    max_pending_bytes: usize,
    /// Stream offset just past the last byte, fixed by a FIN.
    end: Option<u64>,
    desynced: bool,
    closed: bool,
    stats: BufferStats,
}

impl SegmentBuffer {
    pub fn new(max_pending_bytes: usize) -> Self {
        Self {
            next_seq: None,
            delivered: 0,
            pending: BTreeMap::new(),
            pending_bytes: 0,
            max_pending_bytes,
            end: None,
            desynced: false,
            closed: false,
            stats: BufferStats::default(),
        }
    }

    /// Accept a segment travelling in this buffer's direction.
    pub fn insert(&mut self, segment: &Segment) {
        if self.closed || self.desynced {
            return;
        }

        // A SYN occupies one sequence number ahead of the data
        let seq = if segment.flags.syn {
            segment.seq.wrapping_add(1)
        } else {
            segment.seq
        };

        let next_seq = match self.next_seq {
            Some(next_seq) => next_seq,
            None if segment.flags.syn || segment.flags.fin || !segment.payload.is_empty() => {
                self.next_seq = Some(seq);
                seq
            }
            None => return,
        };

        let delivered = i128::from(self.delivered);
        let seg_start = delivered + i128::from(seq_delta(seq, next_seq));
        let seg_end = seg_start + i128::from(segment.payload.len() as u64);

        if segment.flags.fin && self.end.is_none() {
            self.end = u64::try_from(seg_end.max(delivered)).ok();
        }

        if segment.payload.is_empty() {
            return;
        }
        self.stats.segments += 1;

        if seg_end <= delivered {
            self.stats.retransmissions += 1;
            trace!(seq, len = segment.payload.len(), "dropping retransmitted segment");
            return;
        }

        // Bytes already delivered are never delivered again
        let skip = usize::try_from(delivered - seg_start).unwrap_or(0);
        let mut data = &segment.payload[skip..];
        let start = u64::try_from(seg_start.max(delivered)).unwrap_or(self.delivered);
        let mut end = start + data.len() as u64;

        if let Some(limit) = self.end {
            if start >= limit {
                trace!(seq, "dropping data beyond FIN");
                return;
            }
            if end > limit {
                data = &data[..offset_index(limit - start)];
                end = limit;
            }
        }

        if start > self.delivered {
            self.stats.out_of_order += 1;
        }

        let holes = self.holes(start, end);
        if holes.is_empty() {
            self.stats.retransmissions += 1;
            return;
        }

        let added = offset_index(holes.iter().map(|(from, to)| to - from).sum());
        if start > self.delivered
            && self.pending_bytes.saturating_add(added) > self.max_pending_bytes
        {
            self.desync();
            return;
        }

        for (from, to) in holes {
            let range = offset_index(from - start)..offset_index(to - start);
            self.pending.insert(from, data[range].to_vec());
        }
        self.pending_bytes += added;
    }

    /// Remove and return the contiguous bytes available at the cursor.
    pub fn drain(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() != self.delivered {
                break;
            }
            let data = entry.remove();
            self.pending_bytes -= data.len();
            self.delivered += data.len() as u64;
            if out.is_empty() {
                out = data;
            } else {
                out.extend_from_slice(&data);
            }
        }

        if !out.is_empty() {
            self.stats.bytes_delivered += out.len() as u64;
            if let Some(next_seq) = self.next_seq.as_mut() {
                *next_seq = next_seq.wrapping_add(wrapping_len(out.len()));
            }
        }
        out
    }

    /// Stop accepting data and drop anything still waiting behind a gap.
    pub fn close(&mut self) {
        if !self.pending.is_empty() {
            debug!(
                dropped = self.pending_bytes,
                "closing direction with undelivered bytes"
            );
        }
        self.pending.clear();
        self.pending_bytes = 0;
        self.closed = true;
    }

    fn desync(&mut self) {
        debug!(
            pending = self.pending_bytes,
            max = self.max_pending_bytes,
            "pending bytes over budget, direction desynced"
        );
        self.pending.clear();
        self.pending_bytes = 0;
        self.desynced = true;
    }

    /// Missing sub-ranges of `[start, end)` not covered by stored segments.
    fn holes(&self, start: u64, end: u64) -> Vec<(u64, u64)> {
        let mut holes = Vec::new();
        let mut cursor = start;

        if let Some((&offset, data)) = self.pending.range(..start).next_back() {
            cursor = cursor.max(offset + data.len() as u64);
        }
        for (&offset, data) in self.pending.range(start..end) {
            if offset > cursor {
                holes.push((cursor, offset));
            }
            cursor = cursor.max(offset + data.len() as u64);
        }
        if cursor < end {
            holes.push((cursor, end));
        }
        holes
    }

    /// A FIN has been seen for this direction.
    pub fn fin_seen(&self) -> bool {
        self.end.is_some()
    }

    /// No more bytes will ever be delivered.
    pub fn is_finished(&self) -> bool {
        self.closed || self.desynced || self.end.is_some_and(|end| self.delivered >= end)
    }

    pub fn is_desynced(&self) -> bool {
        self.desynced
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    pub fn stats(&self) -> BufferStats {
        self.stats
    }
}

/// Signed distance from `base` to `seq` in sequence space.
#[allow(clippy::cast_possible_wrap)]
fn seq_delta(seq: u32, base: u32) -> i32 {
    seq.wrapping_sub(base) as i32
}

fn offset_index(offset: u64) -> usize {
    usize::try_from(offset).unwrap_or(usize::MAX)
}

#[allow(clippy::cast_possible_truncation)]
fn wrapping_len(len: usize) -> u32 {
    len as u32
}
