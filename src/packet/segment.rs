use std::time::SystemTime;

/// Which way a segment travels within its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    pub const fn reverse(self) -> Self {
        match self {
            Direction::ClientToServer => Direction::ServerToClient,
            Direction::ServerToClient => Direction::ClientToServer,
        }
    }

    pub(crate) const fn index(self) -> usize {
        match self {
            Direction::ClientToServer => 0,
            Direction::ServerToClient => 1,
        }
    }
}

const FIN: u8 = 0x01;
const SYN: u8 = 0x02;
const RST: u8 = 0x04;
const ACK: u8 = 0x10;

/// The TCP control flags the reassembler cares about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
    pub ack: bool,
}

impl TcpFlags {
    /// Decode from the flags byte of a TCP header (offset 13).
    pub const fn from_bits(bits: u8) -> Self {
        Self {
            syn: bits & SYN != 0,
            fin: bits & FIN != 0,
            rst: bits & RST != 0,
            ack: bits & ACK != 0,
        }
    }

    pub const fn syn() -> Self {
        Self::from_bits(SYN)
    }

    pub const fn ack() -> Self {
        Self::from_bits(ACK)
    }

    pub const fn fin_ack() -> Self {
        Self::from_bits(FIN | ACK)
    }

    pub const fn rst() -> Self {
        Self::from_bits(RST)
    }
}

/// One captured TCP segment: sequence number, flags, payload and capture time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub seq: u32,
    pub flags: TcpFlags,
    pub payload: Vec<u8>,
    pub timestamp: SystemTime,
}

impl Segment {
    pub fn new(
        seq: u32,
        flags: TcpFlags,
        payload: impl Into<Vec<u8>>,
        timestamp: SystemTime,
    ) -> Self {
        Self {
            seq,
            flags,
            payload: payload.into(),
            timestamp,
        }
    }
}
