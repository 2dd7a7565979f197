use core::time::Duration;
use std::path::PathBuf;

use crate::packet::PortFilter;
use crate::stream::{DEFAULT_MAX_PENDING_BYTES, SweepPolicy};

pub const DEFAULT_SNAPLEN: i32 = 1600;
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Where frames come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureSource {
    /// Live capture. An empty list selects interfaces automatically.
    Live { interfaces: Vec<String> },
    /// Replay of a capture file.
    Offline(PathBuf),
}

/// Runtime settings for [`crate::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub source: CaptureSource,
    pub snaplen: i32,
    pub ports: PortFilter,
    /// BPF expression applied to every capture.
    pub filter: String,
    pub sweep: SweepPolicy,
    pub max_pending_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        let ports = PortFilter::default();
        Self {
            source: CaptureSource::Live {
                interfaces: Vec::new(),
            },
            snaplen: DEFAULT_SNAPLEN,
            filter: ports.bpf_expression(),
            ports,
            sweep: SweepPolicy {
                interval: DEFAULT_SWEEP_INTERVAL,
                idle_timeout: DEFAULT_SWEEP_INTERVAL * 2,
            },
            max_pending_bytes: DEFAULT_MAX_PENDING_BYTES,
        }
    }
}
