use clap::Parser;
use core::time::Duration;
use std::path::PathBuf;

use crate::config::{CaptureSource, Config, DEFAULT_SNAPLEN};
use crate::error::Error;
use crate::packet::PortFilter;
use crate::stream::{DEFAULT_MAX_PENDING_BYTES, SweepPolicy};

/// Passively capture TCP traffic and print the HTTP requests it carries.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Maximum captured frame length
    #[arg(short, long, default_value_t = DEFAULT_SNAPLEN)]
    pub snaplen: i32,

    /// Comma separated server ports
    #[arg(short, long, default_value = "80,8080,443,10029")]
    pub ports: String,

    /// Raw BPF expression, overriding the one derived from the ports
    #[arg(short, long)]
    pub filter: Option<String>,

    /// Interface to monitor; may be repeated. Defaults to every non-loopback
    /// interface with an address
    #[arg(short, long = "interface")]
    pub interfaces: Vec<String>,

    /// Read frames from a capture file instead of live interfaces
    #[arg(short, long, conflicts_with = "interfaces")]
    pub read: Option<PathBuf>,

    /// Seconds between idle connection sweeps
    #[arg(long, default_value_t = 60)]
    pub sweep_interval_secs: u64,

    /// Seconds without traffic before a connection is evicted. Defaults to
    /// twice the sweep interval
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,

    /// Out-of-order bytes buffered per direction before giving up on it
    #[arg(long, default_value_t = DEFAULT_MAX_PENDING_BYTES)]
    pub max_pending_bytes: usize,

    /// Print one JSON object per request instead of the text report
    #[arg(long)]
    pub json: bool,
}

impl Cli {
    pub fn into_config(self) -> Result<Config, Error> {
        let ports: PortFilter = self.ports.parse()?;
        let interval = Duration::from_secs(self.sweep_interval_secs);
        let idle_timeout = self
            .idle_timeout_secs
            .map_or(interval * 2, Duration::from_secs);
        if interval.is_zero() || idle_timeout.is_zero() {
            return Err(Error::InvalidInterval);
        }

        let source = match self.read {
            Some(path) => CaptureSource::Offline(path),
            None => CaptureSource::Live {
                interfaces: self.interfaces,
            },
        };

        Ok(Config {
            source,
            snaplen: self.snaplen,
            filter: self.filter.unwrap_or_else(|| ports.bpf_expression()),
            ports,
            sweep: SweepPolicy {
                interval,
                idle_timeout,
            },
            max_pending_bytes: self.max_pending_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(core::iter::once("http-tap").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults_match_config_default() {
        assert_eq!(parse(&[]).into_config().unwrap(), Config::default());
    }

    #[test]
    fn test_all_options() {
        let config = parse(&[
            "-s",
            "65535",
            "-p",
            "8000,9000",
            "-i",
            "eth0",
            "--interface",
            "eth1",
            "--sweep-interval-secs",
            "5",
            "--max-pending-bytes",
            "4096",
        ])
        .into_config()
        .unwrap();

        assert_eq!(config.snaplen, 65535);
        assert_eq!(
            config.filter,
            "tcp and (dst port 8000 or dst port 9000)"
        );
        assert_eq!(
            config.source,
            CaptureSource::Live {
                interfaces: vec!["eth0".to_owned(), "eth1".to_owned()]
            }
        );
        assert_eq!(config.sweep.interval, Duration::from_secs(5));
        assert_eq!(config.sweep.idle_timeout, Duration::from_secs(10));
        assert_eq!(config.max_pending_bytes, 4096);
    }

    #[test]
    fn test_filter_override_and_offline_source() {
        let config = parse(&["-f", "tcp port 80", "-r", "trace.pcap", "--idle-timeout-secs", "30"])
            .into_config()
            .unwrap();
        assert_eq!(config.filter, "tcp port 80");
        assert_eq!(config.source, CaptureSource::Offline(PathBuf::from("trace.pcap")));
        assert_eq!(config.sweep.idle_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_read_conflicts_with_interface() {
        assert!(Cli::try_parse_from(["http-tap", "-r", "a.pcap", "-i", "eth0"]).is_err());
    }

    #[rstest]
    #[case(&["--sweep-interval-secs", "0"])]
    #[case(&["--idle-timeout-secs", "0"])]
    fn test_zero_interval_is_rejected(#[case] args: &[&str]) {
        assert!(matches!(parse(args).into_config(), Err(Error::InvalidInterval)));
    }

    #[test]
    fn test_invalid_ports_are_rejected() {
        assert!(matches!(
            parse(&["-p", "80,abc"]).into_config(),
            Err(Error::InvalidPort(p)) if p == "abc"
        ));
    }
}
