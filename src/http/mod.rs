//! HTTP request extraction.
//!
//! This module provides the push-based HTTP/1.x request parser that runs on
//! top of reassembled TCP streams, and the event type it reports.

mod event;
mod parser;

pub use event::{BodySize, RequestEvent};
pub use parser::HttpRequestExtractor;
