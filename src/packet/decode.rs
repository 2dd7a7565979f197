//! Frame decoding
//!
//! Turns a captured link-layer frame into the flow endpoints and the TCP
//! segment it carries. Supports Ethernet (with one optional VLAN tag), Linux
//! cooked capture, BSD loopback and raw IP link types, carrying IPv4 or IPv6.
//!
//! Anything that is not a complete, unfragmented TCP segment yields `None`;
//! callers drop those frames.

use core::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::SystemTime;

use super::{Segment, TcpFlags};

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const ETHERTYPE_VLAN: u16 = 0x8100;
const IPPROTO_TCP: u8 = 6;

const ETHERNET_HEADER_LEN: usize = 14;
const VLAN_TAG_LEN: usize = 4;
const LINUX_SLL_HEADER_LEN: usize = 16;
const NULL_HEADER_LEN: usize = 4;
const IPV4_MIN_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const TCP_MIN_HEADER_LEN: usize = 20;

/// Link-layer framing of captured packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    RawIp,
    LinuxSll,
    Null,
}

impl LinkType {
    /// Map a pcap data link type number to a supported framing.
    pub fn from_dlt(dlt: i32) -> Option<Self> {
        match dlt {
            0 => Some(LinkType::Null),
            1 => Some(LinkType::Ethernet),
            12 | 14 | 101 | 228 | 229 => Some(LinkType::RawIp),
            113 => Some(LinkType::LinuxSll),
            _ => None,
        }
    }
}

/// A TCP segment together with the endpoints it travelled between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedSegment {
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub segment: Segment,
}

/// Decode a captured frame.
pub fn decode_frame(
    link: LinkType,
    frame: &[u8],
    timestamp: SystemTime,
) -> Option<DecodedSegment> {
    let (src_ip, dst_ip, tcp) = match link {
        LinkType::Ethernet => from_ethernet_frame(frame)?,
        LinkType::LinuxSll => from_linux_sll_frame(frame)?,
        LinkType::Null => from_ip_packet(frame.get(NULL_HEADER_LEN..)?)?,
        LinkType::RawIp => from_ip_packet(frame)?,
    };

    let header = TcpHeader::parse(tcp)?;
    Some(DecodedSegment {
        source: SocketAddr::new(src_ip, header.src_port),
        destination: SocketAddr::new(dst_ip, header.dst_port),
        segment: Segment::new(header.seq, header.flags, header.payload, timestamp),
    })
}

type IpPayload<'a> = (IpAddr, IpAddr, &'a [u8]);

/// Ethernet header: [6 bytes dst MAC][6 bytes src MAC][2 bytes EtherType]
fn from_ethernet_frame(frame: &[u8]) -> Option<IpPayload<'_>> {
    if frame.len() < ETHERNET_HEADER_LEN {
        return None;
    }

    let mut ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    let mut offset = ETHERNET_HEADER_LEN;

    if ethertype == ETHERTYPE_VLAN {
        let tag = frame.get(offset..offset + VLAN_TAG_LEN)?;
        ethertype = u16::from_be_bytes([tag[2], tag[3]]);
        offset += VLAN_TAG_LEN;
    }

    from_ethertype(ethertype, &frame[offset..])
}

/// Linux cooked capture: protocol type in the last two header bytes.
fn from_linux_sll_frame(frame: &[u8]) -> Option<IpPayload<'_>> {
    if frame.len() < LINUX_SLL_HEADER_LEN {
        return None;
    }
    let protocol = u16::from_be_bytes([frame[14], frame[15]]);
    from_ethertype(protocol, &frame[LINUX_SLL_HEADER_LEN..])
}

fn from_ethertype(ethertype: u16, packet: &[u8]) -> Option<IpPayload<'_>> {
    match ethertype {
        ETHERTYPE_IPV4 => from_ipv4_packet(packet),
        ETHERTYPE_IPV6 => from_ipv6_packet(packet),
        _ => None,
    }
}

/// Raw IP packet, version taken from the first nibble.
fn from_ip_packet(packet: &[u8]) -> Option<IpPayload<'_>> {
    match packet.first()? >> 4 {
        4 => from_ipv4_packet(packet),
        6 => from_ipv6_packet(packet),
        _ => None,
    }
}

fn from_ipv4_packet(packet: &[u8]) -> Option<IpPayload<'_>> {
    if packet.len() < IPV4_MIN_HEADER_LEN || packet[0] >> 4 != 4 {
        return None;
    }

    if packet[9] != IPPROTO_TCP {
        return None;
    }

    // Fragments are not reassembled: skip anything with MF set or an offset
    let fragment = u16::from_be_bytes([packet[6], packet[7]]);
    if fragment & 0x3FFF != 0 {
        return None;
    }

    let ihl = usize::from(packet[0] & 0x0F) * 4;
    let total_len = usize::from(u16::from_be_bytes([packet[2], packet[3]]));
    if ihl < IPV4_MIN_HEADER_LEN || total_len < ihl {
        return None;
    }

    // Trim link-layer padding beyond the IP total length
    let packet = &packet[..total_len.min(packet.len())];
    let tcp = packet.get(ihl..)?;

    let src_ip = IpAddr::V4(Ipv4Addr::new(
        packet[12], packet[13], packet[14], packet[15],
    ));
    let dst_ip = IpAddr::V4(Ipv4Addr::new(
        packet[16], packet[17], packet[18], packet[19],
    ));

    Some((src_ip, dst_ip, tcp))
}

fn from_ipv6_packet(packet: &[u8]) -> Option<IpPayload<'_>> {
    if packet.len() < IPV6_HEADER_LEN || packet[0] >> 4 != 6 {
        return None;
    }

    // Extension headers are not walked; only TCP directly after the fixed header
    if packet[6] != IPPROTO_TCP {
        return None;
    }

    let payload_len = usize::from(u16::from_be_bytes([packet[4], packet[5]]));
    let end = (IPV6_HEADER_LEN + payload_len).min(packet.len());

    let mut src = [0u8; 16];
    src.copy_from_slice(&packet[8..24]);
    let mut dst = [0u8; 16];
    dst.copy_from_slice(&packet[24..40]);

    Some((
        IpAddr::V6(Ipv6Addr::from(src)),
        IpAddr::V6(Ipv6Addr::from(dst)),
        &packet[IPV6_HEADER_LEN..end],
    ))
}

struct TcpHeader<'a> {
    src_port: u16,
    dst_port: u16,
    seq: u32,
    flags: TcpFlags,
    payload: &'a [u8],
}

impl<'a> TcpHeader<'a> {
    fn parse(tcp: &'a [u8]) -> Option<Self> {
        if tcp.len() < TCP_MIN_HEADER_LEN {
            return None;
        }

        let data_offset = usize::from(tcp[12] >> 4) * 4;
        if data_offset < TCP_MIN_HEADER_LEN || data_offset > tcp.len() {
            return None;
        }

        Some(Self {
            src_port: u16::from_be_bytes([tcp[0], tcp[1]]),
            dst_port: u16::from_be_bytes([tcp[2], tcp[3]]),
            seq: u32::from_be_bytes([tcp[4], tcp[5], tcp[6], tcp[7]]),
            flags: TcpFlags::from_bits(tcp[13]),
            payload: &tcp[data_offset..],
        })
    }
}
