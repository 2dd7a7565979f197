//! TCP stream reassembly.
//!
//! This module provides functionality for reassembling TCP streams from
//! individual segments. Each connection gets a `StreamReassembler` holding one
//! `SegmentBuffer` per direction; the `Coordinator` owns all of them and
//! evicts connections that go idle.

mod buffer;
mod coordinator;
mod reassembler;
mod sweeper;

pub use buffer::{BufferStats, SegmentBuffer};
pub(crate) use buffer::DEFAULT_MAX_PENDING_BYTES;
pub use coordinator::Coordinator;
pub use reassembler::{ConnectionState, StreamReassembler};
pub use sweeper::{SweepPolicy, Sweeper};
