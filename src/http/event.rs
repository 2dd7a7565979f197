use core::fmt;
use core::net::SocketAddr;
use serde::{Serialize, Serializer};
use std::time::{SystemTime, UNIX_EPOCH};

/// Size of a request body.
///
/// Bodies framed with chunked transfer-encoding are not decoded and report
/// `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum BodySize {
    Known(u64),
    Unknown,
}

impl fmt::Display for BodySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodySize::Known(n) => write!(f, "{n}"),
            BodySize::Unknown => f.write_str("unknown"),
        }
    }
}

/// One completed HTTP request seen on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestEvent {
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub method: String,
    pub target: String,
    pub host: Option<String>,
    pub body_size: BodySize,
    #[serde(serialize_with = "unix_seconds")]
    pub timestamp: SystemTime,
}

fn unix_seconds<S: Serializer>(ts: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
    let secs = ts
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default();
    serializer.serialize_f64(secs)
}

impl fmt::Display for RequestEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "SrcIP: {}", self.source.ip())?;
        writeln!(f, "SrcPort: {}", self.source.port())?;
        writeln!(f, "DstIP: {}", self.destination.ip())?;
        writeln!(f, "DstPort: {}", self.destination.port())?;
        writeln!(f, "ReqSize: {}", self.body_size)?;
        writeln!(f, "Method: {}", self.method)?;
        write!(f, "Url: {}", self.target)
    }
}
