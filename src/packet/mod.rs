//! Packet decoding and TCP flow identification.
//!
//! This module turns captured frames into TCP segments, names the connection
//! each segment belongs to, and decides which side of it is the client.

mod decode;
mod filter;
mod flow_key;
mod segment;

pub use decode::{DecodedSegment, LinkType, decode_frame};
pub use filter::{DEFAULT_PORTS, PortFilter};
pub use flow_key::FlowKey;
pub use segment::{Direction, Segment, TcpFlags};
