//! Destinations for extracted requests.

use std::io::{self, Write};
use std::sync::mpsc::Sender;
use tracing::warn;

use crate::http::RequestEvent;

/// Receives every extracted request. Called from capture and sweeper threads.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &RequestEvent);
}

/// Writes the human readable block report to stdout, one blank line between
/// requests.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextSink;

impl EventSink for TextSink {
    fn emit(&self, event: &RequestEvent) {
        let mut stdout = io::stdout().lock();
        if let Err(e) = writeln!(stdout, "{event}\n") {
            warn!("Failed to write request: {e:?}");
        }
    }
}

/// Writes one JSON object per line to stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSink;

impl EventSink for JsonSink {
    fn emit(&self, event: &RequestEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to serialize request: {e:?}");
                return;
            }
        };
        let mut stdout = io::stdout().lock();
        if let Err(e) = writeln!(stdout, "{line}") {
            warn!("Failed to write request: {e:?}");
        }
    }
}

impl EventSink for Sender<RequestEvent> {
    fn emit(&self, event: &RequestEvent) {
        // Receiver may already be gone
        let _ = self.send(event.clone());
    }
}
