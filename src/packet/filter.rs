//! Server port selection.
//!
//! The configured port set decides both what the capture filter lets through
//! and which side of a connection is the client sending requests.

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeSet;

use crate::error::Error;

use super::{Direction, TcpFlags};

pub const DEFAULT_PORTS: [u16; 4] = [80, 8080, 443, 10029];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortFilter {
    ports: BTreeSet<u16>,
}

impl PortFilter {
    pub fn new(ports: impl IntoIterator<Item = u16>) -> Result<Self, Error> {
        let ports: BTreeSet<u16> = ports.into_iter().collect();
        if ports.is_empty() {
            return Err(Error::EmptyPortList);
        }
        Ok(Self { ports })
    }

    pub fn contains(&self, port: u16) -> bool {
        self.ports.contains(&port)
    }

    /// BPF expression selecting TCP traffic towards any of the ports.
    pub fn bpf_expression(&self) -> String {
        let clauses: Vec<String> = self
            .ports
            .iter()
            .map(|port| format!("dst port {port}"))
            .collect();
        format!("tcp and ({})", clauses.join(" or "))
    }

    /// Classify a segment by its ports.
    ///
    /// A destination port in the set means the sender is the client. Failing
    /// that, a source port in the set means the sender is the server. When
    /// neither matches, a SYN+ACK comes from the server and anything else is
    /// assumed to come from the client.
    pub fn direction(&self, src_port: u16, dst_port: u16, flags: TcpFlags) -> Direction {
        if self.contains(dst_port) {
            Direction::ClientToServer
        } else if self.contains(src_port) {
            Direction::ServerToClient
        } else if flags.syn && flags.ack {
            Direction::ServerToClient
        } else {
            Direction::ClientToServer
        }
    }
}

impl Default for PortFilter {
    fn default() -> Self {
        Self {
            ports: DEFAULT_PORTS.into_iter().collect(),
        }
    }
}

impl FromStr for PortFilter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ports = s
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| p.parse::<u16>().map_err(|_| Error::InvalidPort(p.to_owned())))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(ports)
    }
}

impl fmt::Display for PortFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ports: Vec<String> = self.ports.iter().map(ToString::to_string).collect();
        f.write_str(&ports.join(","))
    }
}
