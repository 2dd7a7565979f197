use core::fmt::Debug;
use core::fmt::Display;

pub enum Error {
    PCap(pcap::Error),
    NoDeviceFound,
    UnsupportedLinkType(i32),
    InvalidPort(String),
    EmptyPortList,
    InvalidInterval,
}

impl core::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::PCap(e) => write!(f, "PCap error: {e:?}"),
            Error::NoDeviceFound => write!(f, "No device found"),
            Error::UnsupportedLinkType(dlt) => write!(f, "Unsupported link type: {dlt}"),
            Error::InvalidPort(p) => write!(f, "Invalid port: {p}"),
            Error::EmptyPortList => write!(f, "Port list is empty"),
            Error::InvalidInterval => write!(f, "Sweep interval and idle timeout must be non-zero"),
        }
    }
}

impl From<pcap::Error> for Error {
    fn from(e: pcap::Error) -> Self {
        Error::PCap(e)
    }
}
