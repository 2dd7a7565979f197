//! Packet capture front end.
//!
//! A `FrameSource` produces raw link-layer frames. The trait's default `run`
//! owns the processing loop: decode each frame, classify its direction and
//! hand the segment to the shared `Coordinator`.

use anyhow::Context;
use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use pcap::{Activated, Capture};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, trace};

use crate::error::Error;
use crate::packet::{FlowKey, LinkType, PortFilter, decode_frame};
use crate::stream::{Coordinator, SweepPolicy};

/// One captured link-layer frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub timestamp: SystemTime,
}

/// Frames of one source. A read error is yielded once and ends the stream.
pub type Frames = Box<dyn Iterator<Item = Result<Frame, Error>>>;

/// Counters for one capture loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames: u64,
    pub segments: u64,
    pub undecodable: u64,
}

/// Implementors provide the frames; the trait provides the loop that feeds
/// them through reassembly.
pub trait FrameSource {
    /// Open the source and return its link type with an iterator of frames.
    fn frames(&self) -> anyhow::Result<(LinkType, Frames)>;

    /// Feed every frame to `coordinator` until the source ends. A read error
    /// stops the loop and is returned.
    ///
    /// With `clock_sweep` set, idle connections are also swept using frame
    /// timestamps as the clock.
    fn run(
        &self,
        coordinator: &Coordinator,
        ports: &PortFilter,
        clock_sweep: Option<SweepPolicy>,
    ) -> anyhow::Result<CaptureStats> {
        let (link, frames) = self.frames()?;
        let mut stats = CaptureStats::default();
        let mut next_sweep: Option<SystemTime> = None;

        for frame in frames {
            let frame =
                frame.with_context(|| format!("Capture failed after {} frames", stats.frames))?;
            stats.frames += 1;

            if let Some(policy) = clock_sweep {
                match next_sweep {
                    Some(due) if frame.timestamp >= due => {
                        coordinator.sweep(policy.idle_timeout, frame.timestamp);
                        next_sweep = Some(frame.timestamp + policy.interval);
                    }
                    Some(_) => {}
                    None => next_sweep = Some(frame.timestamp + policy.interval),
                }
            }

            let Some(decoded) = decode_frame(link, &frame.data, frame.timestamp) else {
                stats.undecodable += 1;
                trace!(len = frame.data.len(), "Dropping undecodable frame");
                continue;
            };
            stats.segments += 1;

            // Only consulted when the segment opens a connection
            let direction = ports.direction(
                decoded.source.port(),
                decoded.destination.port(),
                decoded.segment.flags,
            );
            coordinator.submit(
                FlowKey::new(decoded.source, decoded.destination),
                direction,
                &decoded.segment,
            );
        }

        Ok(stats)
    }
}

/// Live capture on one network interface. Runs until `running` is cleared or
/// the device fails.
#[derive(Debug, Clone)]
pub struct LiveCapture {
    pub device: String,
    pub snaplen: i32,
    pub filter: String,
    pub running: Arc<AtomicBool>,
}

impl FrameSource for LiveCapture {
    fn frames(&self) -> anyhow::Result<(LinkType, Frames)> {
        info!(device = %self.device, filter = %self.filter, "Monitoring device");

        let mut cap = Capture::from_device(self.device.as_str())
            .map_err(Error::PCap)?
            .promisc(true)
            .snaplen(self.snaplen)
            .timeout(100) // Short timeout so the stop flag is polled promptly
            .buffer_size(1_000_000)
            .open()
            .map_err(Error::PCap)
            .with_context(|| format!("Failed to open device {}", self.device))?;
        cap.filter(&self.filter, true)
            .map_err(Error::PCap)
            .with_context(|| format!("Invalid capture filter: {}", self.filter))?;

        let link = link_type(&cap)?;
        let frames = packets(cap, self.device.clone(), Arc::clone(&self.running));
        Ok((link, frames))
    }
}

/// Replay of a capture file. Stops early when `running` is cleared.
#[derive(Debug, Clone)]
pub struct OfflineCapture {
    pub path: PathBuf,
    pub filter: String,
    pub running: Arc<AtomicBool>,
}

impl FrameSource for OfflineCapture {
    fn frames(&self) -> anyhow::Result<(LinkType, Frames)> {
        info!(path = %self.path.display(), filter = %self.filter, "Reading capture file");

        let mut cap = Capture::from_file(&self.path)
            .map_err(Error::PCap)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        cap.filter(&self.filter, true)
            .map_err(Error::PCap)
            .with_context(|| format!("Invalid capture filter: {}", self.filter))?;

        let link = link_type(&cap)?;
        let name = self.path.display().to_string();
        Ok((link, packets(cap, name, Arc::clone(&self.running))))
    }
}

fn link_type<T: Activated + ?Sized>(cap: &Capture<T>) -> anyhow::Result<LinkType> {
    let dlt = cap.get_datalink().0;
    Ok(LinkType::from_dlt(dlt).ok_or(Error::UnsupportedLinkType(dlt))?)
}

/// Drive a pcap handle as an iterator. Timeouts are retried. End of file or a
/// cleared `running` flag end the iterator; any other error is yielded once
/// and then ends it.
fn packets<T: Activated + ?Sized + 'static>(
    mut cap: Capture<T>,
    name: String,
    running: Arc<AtomicBool>,
) -> Frames {
    let mut failed = false;
    let iter = core::iter::from_fn(move || {
        if failed {
            return None;
        }
        loop {
            if !running.load(Ordering::SeqCst) {
                debug!(source = %name, "Capture stopped");
                return None;
            }
            match cap.next_packet() {
                Ok(packet) => {
                    let ts = packet.header.ts;
                    return Some(Ok(Frame {
                        data: packet.data.to_vec(),
                        timestamp: packet_time(ts.tv_sec, ts.tv_usec),
                    }));
                }
                Err(pcap::Error::TimeoutExpired) => {}
                Err(pcap::Error::NoMorePackets) => {
                    debug!(source = %name, "End of capture");
                    return None;
                }
                Err(e) => {
                    failed = true;
                    return Some(Err(Error::PCap(e)));
                }
            }
        }
    });

    Box::new(iter)
}

fn packet_time(secs: impl TryInto<u64>, micros: impl TryInto<u64>) -> SystemTime {
    let secs = secs.try_into().unwrap_or_default();
    let micros = micros.try_into().unwrap_or_default();
    UNIX_EPOCH + Duration::from_secs(secs) + Duration::from_micros(micros)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::mpsc;

    struct DummySource {
        frames: Vec<Frame>,
        fail_at_end: bool,
    }

    impl DummySource {
        fn new(frames: Vec<Frame>) -> Self {
            Self {
                frames,
                fail_at_end: false,
            }
        }
    }

    impl FrameSource for DummySource {
        fn frames(&self) -> anyhow::Result<(LinkType, Frames)> {
            let failure = self.fail_at_end.then(|| {
                Err(Error::PCap(pcap::Error::PcapError(
                    "device went away".to_owned(),
                )))
            });
            let frames = self.frames.clone().into_iter().map(Ok).chain(failure);
            Ok((LinkType::RawIp, Box::new(frames)))
        }
    }

    /// Classic pcap file with Ethernet framing around each IPv4 packet,
    /// one second apart starting at t=100.
    fn write_capture_file(name: &str, packets: &[Vec<u8>]) -> PathBuf {
        let mut file = Vec::new();
        file.extend_from_slice(&0xa1b2_c3d4_u32.to_le_bytes());
        file.extend_from_slice(&2_u16.to_le_bytes());
        file.extend_from_slice(&4_u16.to_le_bytes());
        file.extend_from_slice(&[0; 8]);
        file.extend_from_slice(&65_535_u32.to_le_bytes());
        file.extend_from_slice(&1_u32.to_le_bytes());

        for (secs, packet) in (100_u32..).zip(packets) {
            let mut frame = vec![0x02, 0, 0, 0, 0, 0x01, 0x02, 0, 0, 0, 0, 0x02, 0x08, 0x00];
            frame.extend_from_slice(packet);
            let len = u32::try_from(frame.len()).unwrap();
            file.extend_from_slice(&secs.to_le_bytes());
            file.extend_from_slice(&0_u32.to_le_bytes());
            file.extend_from_slice(&len.to_le_bytes());
            file.extend_from_slice(&len.to_le_bytes());
            file.extend_from_slice(&frame);
        }

        let path =
            std::env::temp_dir().join(format!("http-tap-{}-{name}.pcap", std::process::id()));
        fs::write(&path, file).unwrap();
        path
    }

    /// IPv4 + TCP with no options, `192.168.1.100:src_port -> 10.0.0.1:dst_port`.
    fn ipv4_tcp(src_port: u16, dst_port: u16, seq: u32, flags: u8, payload: &[u8]) -> Vec<u8> {
        let total_len = u16::try_from(40 + payload.len()).unwrap();
        let mut packet = vec![0x45, 0x00];
        packet.extend_from_slice(&total_len.to_be_bytes());
        packet.extend_from_slice(&[0, 0, 0x40, 0x00, 64, 6, 0, 0]);
        packet.extend_from_slice(&[192, 168, 1, 100, 10, 0, 0, 1]);
        packet.extend_from_slice(&src_port.to_be_bytes());
        packet.extend_from_slice(&dst_port.to_be_bytes());
        packet.extend_from_slice(&seq.to_be_bytes());
        packet.extend_from_slice(&[0, 0, 0, 0, 0x50, flags, 0xff, 0xff, 0, 0, 0, 0]);
        packet.extend_from_slice(payload);
        packet
    }

    fn frame(data: Vec<u8>, secs: u64) -> Frame {
        Frame {
            data,
            timestamp: UNIX_EPOCH + Duration::from_secs(secs),
        }
    }

    #[test]
    fn test_packet_time() {
        assert_eq!(
            packet_time(2_i64, 500_000_i64),
            UNIX_EPOCH + Duration::from_millis(2_500)
        );
        assert_eq!(packet_time(-1_i64, -1_i64), UNIX_EPOCH);
    }

    #[test]
    fn test_run_feeds_coordinator() {
        let (tx, rx) = mpsc::channel();
        let coordinator = Coordinator::new(Arc::new(tx), 1024);
        let source = DummySource::new(vec![
            frame(ipv4_tcp(40000, 80, 1, 0x18, b"GET /hello HTTP/1.1\r\n\r\n"), 1),
            frame(vec![0x60, 0x00], 1),
        ]);

        let stats = source
            .run(&coordinator, &PortFilter::default(), None)
            .unwrap();
        assert_eq!(
            stats,
            CaptureStats {
                frames: 2,
                segments: 1,
                undecodable: 1,
            }
        );

        let event = rx.try_recv().unwrap();
        assert_eq!(event.target, "/hello");
        assert_eq!(event.source.port(), 40000);
        assert_eq!(event.destination.port(), 80);
    }

    #[test]
    fn test_run_sweeps_on_capture_clock() {
        let (tx, _rx) = mpsc::channel();
        let coordinator = Coordinator::new(Arc::new(tx), 1024);
        let policy = SweepPolicy {
            interval: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(20),
        };

        let source = DummySource::new(vec![
            frame(ipv4_tcp(40001, 80, 1, 0x18, b"GET /a HTTP/1.1\r\n"), 100),
            frame(ipv4_tcp(40002, 80, 1, 0x18, b"GET /b HTTP/1.1\r\n"), 115),
            // Far enough ahead for the first connection to be idle
            frame(ipv4_tcp(40003, 80, 1, 0x18, b"GET /c HTTP/1.1\r\n"), 125),
        ]);

        source
            .run(&coordinator, &PortFilter::default(), Some(policy))
            .unwrap();
        assert_eq!(coordinator.len(), 2);
    }

    #[test]
    fn test_read_error_ends_run_with_error() {
        let (tx, rx) = mpsc::channel();
        let coordinator = Coordinator::new(Arc::new(tx), 1024);
        let source = DummySource {
            frames: vec![frame(
                ipv4_tcp(40004, 80, 1, 0x18, b"GET /x HTTP/1.1\r\n\r\n"),
                1,
            )],
            fail_at_end: true,
        };

        let err = source
            .run(&coordinator, &PortFilter::default(), None)
            .unwrap_err();
        assert!(format!("{err:?}").contains("device went away"));
        assert_eq!(rx.try_recv().unwrap().target, "/x");
    }

    #[test]
    fn test_offline_capture_reads_file() {
        let path = write_capture_file(
            "read",
            &[
                ipv4_tcp(40005, 80, 1, 0x18, b"GET /file HTTP/1.1\r\n\r\n"),
                // Not towards a server port, dropped by the filter
                ipv4_tcp(80, 40005, 1, 0x18, b"HTTP/1.1 200 OK\r\n\r\n"),
            ],
        );
        let (tx, rx) = mpsc::channel();
        let coordinator = Coordinator::new(Arc::new(tx), 1024);
        let source = OfflineCapture {
            path: path.clone(),
            filter: PortFilter::default().bpf_expression(),
            running: Arc::new(AtomicBool::new(true)),
        };

        let stats = source
            .run(&coordinator, &PortFilter::default(), None)
            .unwrap();
        fs::remove_file(path).unwrap();

        assert_eq!(stats.frames, 1);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.target, "/file");
        assert_eq!(event.timestamp, UNIX_EPOCH + Duration::from_secs(100));
    }

    #[test]
    fn test_cleared_running_flag_stops_capture() {
        let path = write_capture_file(
            "stopped",
            &[ipv4_tcp(40006, 80, 1, 0x18, b"GET /never HTTP/1.1\r\n\r\n")],
        );
        let (tx, rx) = mpsc::channel();
        let coordinator = Coordinator::new(Arc::new(tx), 1024);
        let source = OfflineCapture {
            path: path.clone(),
            filter: PortFilter::default().bpf_expression(),
            running: Arc::new(AtomicBool::new(false)),
        };

        let stats = source
            .run(&coordinator, &PortFilter::default(), None)
            .unwrap();
        fs::remove_file(path).unwrap();

        assert_eq!(stats, CaptureStats::default());
        assert!(rx.try_recv().is_err());
    }
}
