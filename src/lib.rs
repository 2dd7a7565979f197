#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![deny(unreachable_pub)]
#![deny(clippy::correctness)]
#![deny(clippy::suspicious)]
#![deny(clippy::style)]
#![deny(clippy::complexity)]
#![deny(clippy::perf)]
#![deny(clippy::pedantic)]
#![deny(clippy::std_instead_of_core)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]

pub mod capture;
pub mod cli;
pub mod config;
pub mod devices;
pub mod error;
pub mod http;
pub mod packet;
pub mod sink;
pub mod stream;

use anyhow::bail;
use core::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use tracing::{error, info};

use capture::{FrameSource, LiveCapture, OfflineCapture};
use config::{CaptureSource, Config};
use sink::EventSink;
use stream::{Coordinator, Sweeper};

/// Capture, reassemble and report until every capture loop has ended or
/// `running` is cleared.
///
/// Live captures run one thread per interface and a sweeper thread evicting
/// idle connections on the wall clock. A capture file is replayed on the
/// calling thread and swept on its own timestamps. Whatever is still tracked
/// at the end is flushed to `sink`, also when capturing failed.
pub fn run(
    config: &Config,
    sink: Arc<dyn EventSink>,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let coordinator = Arc::new(Coordinator::new(sink, config.max_pending_bytes));

    let result = match &config.source {
        CaptureSource::Offline(path) => {
            let source = OfflineCapture {
                path: path.clone(),
                filter: config.filter.clone(),
                running,
            };
            source
                .run(&coordinator, &config.ports, Some(config.sweep))
                .map(|stats| {
                    info!(
                        frames = stats.frames,
                        segments = stats.segments,
                        undecodable = stats.undecodable,
                        "Capture file done"
                    );
                })
        }
        CaptureSource::Live { interfaces } => {
            let interfaces = if interfaces.is_empty() {
                devices::monitored_devices()?
            } else {
                interfaces.clone()
            };
            let sweeper = Sweeper::spawn(Arc::clone(&coordinator), config.sweep)?;
            let result = run_live(config, &coordinator, interfaces, &running);
            sweeper.stop();
            result
        }
    };

    info!(connections = coordinator.len(), "Flushing remaining connections");
    coordinator.flush_all();
    result
}

fn run_live(
    config: &Config,
    coordinator: &Arc<Coordinator>,
    interfaces: Vec<String>,
    running: &Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let mut handles = Vec::new();
    for device in interfaces {
        let source = LiveCapture {
            device: device.clone(),
            snaplen: config.snaplen,
            filter: config.filter.clone(),
            running: Arc::clone(running),
        };
        let coordinator = Arc::clone(coordinator);
        let ports = config.ports.clone();
        let handle = thread::Builder::new()
            .name(format!("capture-{device}"))
            .spawn(move || source.run(&coordinator, &ports, None))?;
        handles.push((device, handle));
    }

    let mut succeeded = 0;
    let total = handles.len();
    for (device, handle) in handles {
        match handle.join() {
            Ok(Ok(stats)) => {
                succeeded += 1;
                info!(
                    device = %device,
                    frames = stats.frames,
                    segments = stats.segments,
                    undecodable = stats.undecodable,
                    "Capture ended"
                );
            }
            Ok(Err(e)) => error!(device = %device, "Capture failed: {e:?}"),
            Err(_) => error!(device = %device, "Capture thread panicked"),
        }
    }

    if succeeded == 0 {
        bail!("Every capture loop failed ({total} devices)");
    }
    Ok(())
}
