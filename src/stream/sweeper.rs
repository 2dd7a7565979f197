use core::time::Duration;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::SystemTime;
use tracing::{debug, warn};

use super::coordinator::Coordinator;

/// How often idle connections are looked for, and how long a connection may
/// go without traffic before it is evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepPolicy {
    pub interval: Duration,
    pub idle_timeout: Duration,
}

/// Background thread evicting idle connections on the wall clock.
#[derive(Debug)]
pub struct Sweeper {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl Sweeper {
    pub fn spawn(coordinator: Arc<Coordinator>, policy: SweepPolicy) -> anyhow::Result<Self> {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("sweeper".to_owned())
            .spawn(move || {
                loop {
                    match stopped.recv_timeout(policy.interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            coordinator.sweep(policy.idle_timeout, SystemTime::now());
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("Sweeper stopped");
            })?;

        Ok(Self { stop, handle })
    }

    /// Signal the thread and wait for it to finish its current sweep.
    pub fn stop(self) {
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            warn!("Sweeper thread panicked");
        }
    }
}
