//! Frame decoding.
//!
//! [`PacketParser`] turns a raw captured frame plus a datalink hint into a
//! fully populated [`Packet`] descriptor in a single pass: link layer, tag
//! stacks (802.1Q/802.1ad, PPPoE, MPLS, TRILL), L3 with IPv4 fragmentation
//! and IPv6 extension headers, then L4 with a TCP option walk.
//!
//! The parser never reads past the captured buffer. On any length or
//! protocol failure the descriptor is returned with `ip_version == 0` and
//! the `unknown_packets` counter is incremented; the caller skips flow
//! processing for such packets.

pub mod packet;
pub mod topports;

use self::packet::Packet;
use self::topports::TopPorts;
use crate::memory::packet_block::{Datalink, PacketSlot};
use crate::protocols::packet::ethernet::{
    Ethernet, VlanTag, ETHERTYPE_8021AD, ETHERTYPE_8021Q, ETHERTYPE_IPV4, ETHERTYPE_IPV6,
    ETHERTYPE_MPLS_MC, ETHERTYPE_MPLS_UC, ETHERTYPE_PPPOE_SESSION, ETHERTYPE_TRILL,
    MPLS_ENTRY_SIZE, PPP_IPV4, PPP_IPV6, TAG_SIZE,
};
use crate::protocols::packet::icmp::{ICMPV6_PROTOCOL, ICMP_PROTOCOL};
use crate::protocols::packet::ipv4::Ipv4;
use crate::protocols::packet::ipv6::{self, Ipv6, Ipv6Ext, Ipv6Fragment};
use crate::protocols::packet::tcp::{Tcp, TCP_PROTOCOL};
use crate::protocols::packet::udp::{Udp, UDP_PROTOCOL};
use crate::protocols::packet::{PacketParseError, ParseResult};
use crate::utils::{extract_bits, Timeval};

use std::collections::HashMap;

use byteorder::{BigEndian, ByteOrder};

/// Upper bound on popped tag-stack layers. Deeper stacks are decoded
/// best-effort up to the bound.
const MAX_TAG_LAYERS: usize = 10;

/// Linux cooked capture pseudo-header size.
const SLL_HDR_SIZE: usize = 16;

/// PPPoE session header (6 bytes) plus the PPP protocol field.
const PPPOE_HDR_SIZE: usize = 8;

/// Per-worker parser counters, published through telemetry.
#[derive(Debug, Default, Clone)]
pub struct ParserStats {
    pub seen_packets: u64,
    pub unknown_packets: u64,
    pub vlan_packets: u64,
    pub mpls_packets: u64,
    pub pppoe_packets: u64,
    pub trill_packets: u64,
    pub ipv4_packets: u64,
    pub ipv6_packets: u64,
    pub tcp_packets: u64,
    pub udp_packets: u64,
}

/// Per-VLAN traffic counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct VlanCounters {
    pub packets: u64,
    pub bytes: u64,
}

/// Decodes frames into packet descriptors and keeps parser telemetry.
pub struct PacketParser {
    pub stats: ParserStats,
    pub top_ports: TopPorts,
    vlans: HashMap<u16, VlanCounters>,
}

impl PacketParser {
    pub fn new(top_ports_count: usize) -> Self {
        PacketParser {
            stats: ParserStats::default(),
            top_ports: TopPorts::new(top_ports_count),
            vlans: HashMap::new(),
        }
    }

    /// Parses one input slot into a descriptor borrowing the slot's buffer.
    pub fn parse<'a>(&mut self, slot: &'a PacketSlot) -> Packet<'a> {
        self.parse_frame(slot.data(), slot.wire_len, slot.ts, slot.datalink)
    }

    /// Parses a raw frame. The descriptor borrows `frame`.
    pub fn parse_frame<'a>(
        &mut self,
        frame: &'a [u8],
        wire_len: usize,
        ts: Timeval,
        datalink: Datalink,
    ) -> Packet<'a> {
        let mut pkt = Packet::unparsed(frame, wire_len, ts);
        self.stats.seen_packets += 1;

        if decode(&mut pkt, datalink, &mut self.stats).is_err() {
            self.stats.unknown_packets += 1;
            pkt.ip_version = 0;
            return pkt;
        }

        match pkt.ip_version {
            4 => self.stats.ipv4_packets += 1,
            6 => self.stats.ipv6_packets += 1,
            _ => {}
        }
        match pkt.ip_proto {
            TCP_PROTOCOL => {
                self.stats.tcp_packets += 1;
                self.top_ports.increment_tcp(pkt.dst_port);
            }
            UDP_PROTOCOL => {
                self.stats.udp_packets += 1;
                self.top_ports.increment_udp(pkt.dst_port);
            }
            _ => {}
        }
        let vlan = self.vlans.entry(pkt.vlan_id).or_default();
        vlan.packets += 1;
        vlan.bytes += wire_len as u64;

        pkt
    }

    /// Per-VLAN packet/byte counters observed so far.
    pub fn vlan_counters(&self) -> &HashMap<u16, VlanCounters> {
        &self.vlans
    }
}

impl Default for PacketParser {
    fn default() -> Self {
        PacketParser::new(topports::DEFAULT_TOP_PORTS)
    }
}

#[inline]
fn slice_from(frame: &[u8], offset: usize) -> ParseResult<&[u8]> {
    frame.get(offset..).ok_or(PacketParseError::Truncated)
}

fn decode<'a>(pkt: &mut Packet<'a>, datalink: Datalink, stats: &mut ParserStats) -> ParseResult<()> {
    let frame = pkt.packet;
    let mut offset;
    let mut ethertype;

    match datalink {
        Datalink::En10mb => {
            let eth = Ethernet::parse(frame)?;
            pkt.dst_mac = eth.dst();
            pkt.src_mac = eth.src();
            ethertype = eth.ether_type();
            offset = eth.header_len();
        }
        Datalink::LinuxSll => {
            if frame.len() < SLL_HDR_SIZE {
                return Err(PacketParseError::Truncated);
            }
            ethertype = BigEndian::read_u16(&frame[14..16]);
            offset = SLL_HDR_SIZE;
        }
        Datalink::Raw => {
            ethertype = ethertype_from_nibble(frame)?;
            offset = 0;
        }
    }

    let mut saw_vlan = false;
    let mut saw_mpls = false;
    let mut saw_pppoe = false;
    let mut saw_trill = false;

    let mut layers = 0;
    while layers < MAX_TAG_LAYERS {
        match ethertype {
            ETHERTYPE_8021Q | ETHERTYPE_8021AD => {
                let tag = VlanTag::parse(slice_from(frame, offset)?)?;
                if pkt.vlan_id == 0 {
                    pkt.vlan_id = tag.vlan_id();
                } else if pkt.vlan_id2 == 0 {
                    pkt.vlan_id2 = tag.vlan_id();
                }
                ethertype = tag.ether_type();
                offset += TAG_SIZE;
                saw_vlan = true;
            }
            ETHERTYPE_PPPOE_SESSION => {
                let hdr = slice_from(frame, offset)?;
                if hdr.len() < PPPOE_HDR_SIZE {
                    return Err(PacketParseError::Truncated);
                }
                // code != 0 marks discovery-stage traffic with no payload
                if hdr[1] != 0 {
                    return Err(PacketParseError::InvalidProtocol);
                }
                ethertype = match BigEndian::read_u16(&hdr[6..8]) {
                    PPP_IPV4 => ETHERTYPE_IPV4,
                    PPP_IPV6 => ETHERTYPE_IPV6,
                    _ => return Err(PacketParseError::InvalidProtocol),
                };
                offset += PPPOE_HDR_SIZE;
                saw_pppoe = true;
            }
            ETHERTYPE_MPLS_UC | ETHERTYPE_MPLS_MC => {
                loop {
                    let entry_bytes = slice_from(frame, offset)?;
                    if entry_bytes.len() < MPLS_ENTRY_SIZE {
                        return Err(PacketParseError::Truncated);
                    }
                    let entry = BigEndian::read_u32(entry_bytes);
                    if pkt.mpls_top_label == 0 {
                        pkt.mpls_top_label = entry;
                    }
                    offset += MPLS_ENTRY_SIZE;
                    layers += 1;
                    // bottom-of-stack bit
                    if extract_bits(entry, 8, 1) == 1 || layers >= MAX_TAG_LAYERS {
                        break;
                    }
                }
                // MPLS carries no next-protocol field; infer from the nibble
                ethertype = ethertype_from_nibble(slice_from(frame, offset)?)?;
                saw_mpls = true;
            }
            ETHERTYPE_TRILL => {
                let hdr = slice_from(frame, offset)?;
                if hdr.len() < 6 {
                    return Err(PacketParseError::Truncated);
                }
                let flags = BigEndian::read_u16(&hdr[0..2]);
                let op_len = extract_bits(flags as u32, 6, 5) as usize;
                offset += 6 + op_len * 4;
                // the TRILL payload is a full inner Ethernet frame
                let eth = Ethernet::parse(slice_from(frame, offset)?)?;
                pkt.dst_mac = eth.dst();
                pkt.src_mac = eth.src();
                ethertype = eth.ether_type();
                offset += eth.header_len();
                saw_trill = true;
            }
            _ => break,
        }
        layers += 1;
    }

    pkt.ethertype = ethertype;
    if saw_vlan {
        stats.vlan_packets += 1;
    }
    if saw_mpls {
        stats.mpls_packets += 1;
    }
    if saw_pppoe {
        stats.pppoe_packets += 1;
    }
    if saw_trill {
        stats.trill_packets += 1;
    }

    match ethertype {
        ETHERTYPE_IPV4 => parse_ipv4(pkt, offset),
        ETHERTYPE_IPV6 => parse_ipv6(pkt, offset),
        _ => Err(PacketParseError::InvalidProtocol),
    }
}

/// Infers IPv4 vs IPv6 from the version nibble of raw IP data.
fn ethertype_from_nibble(data: &[u8]) -> ParseResult<u16> {
    match data.first().map(|b| b >> 4) {
        Some(4) => Ok(ETHERTYPE_IPV4),
        Some(6) => Ok(ETHERTYPE_IPV6),
        _ => Err(PacketParseError::InvalidProtocol),
    }
}

fn parse_ipv4<'a>(pkt: &mut Packet<'a>, offset: usize) -> ParseResult<()> {
    let frame: &'a [u8] = pkt.packet;
    let ip = Ipv4::parse(slice_from(frame, offset)?)?;

    pkt.ip_version = 4;
    pkt.ip_proto = ip.protocol();
    pkt.ip_ttl = ip.time_to_live();
    pkt.ip_tos = ip.type_of_service();
    pkt.ip_flags = ip.flags();
    pkt.ip_len = ip.total_length();
    pkt.ip_payload_len = ip.total_length().saturating_sub(ip.header_len() as u16);
    pkt.src_ip = ip.src_addr().into();
    pkt.dst_ip = ip.dst_addr().into();
    pkt.frag_id = ip.identification() as u32;
    pkt.frag_off = ip.fragment_offset();
    pkt.more_fragments = ip.mf();

    let l4_off = offset + ip.header_len();
    let wire_end = offset + ip.total_length() as usize;
    let cap_end = frame.len().min(wire_end);
    let l4 = &frame[l4_off.min(cap_end)..cap_end];

    if pkt.frag_off > 0 {
        // later fragment, no L4 header on the wire
        pkt.payload = l4;
        pkt.payload_len_wire = pkt.ip_payload_len as usize;
        return Ok(());
    }
    parse_l4(pkt, l4)
}

fn parse_ipv6<'a>(pkt: &mut Packet<'a>, offset: usize) -> ParseResult<()> {
    let frame: &'a [u8] = pkt.packet;
    let ip = Ipv6::parse(slice_from(frame, offset)?)?;

    pkt.ip_version = 6;
    pkt.ip_ttl = ip.hop_limit();
    pkt.ip_tos = ip.traffic_class();
    pkt.ip_len = ip.payload_length().saturating_add(ip.header_len() as u16);
    pkt.src_ip = ip.src_addr().into();
    pkt.dst_ip = ip.dst_addr().into();

    let mut next = ip.next_header();
    let mut ext_off = offset + ip.header_len();
    let mut ext_total = 0usize;
    while ipv6::is_extension(next) && ext_total < u16::MAX as usize {
        if next == ipv6::EXT_FRAGMENT {
            let frag = Ipv6Fragment::parse(slice_from(frame, ext_off)?)?;
            pkt.frag_off = frag.fragment_offset();
            pkt.more_fragments = frag.more_fragments();
            pkt.frag_id = frag.identification();
            next = frag.next_header();
            ext_off += ipv6::FRAGMENT_EXT_SIZE;
            ext_total += ipv6::FRAGMENT_EXT_SIZE;
            if pkt.frag_off > 0 {
                break;
            }
        } else {
            let ext = Ipv6Ext::parse(slice_from(frame, ext_off)?)?;
            next = ext.next_header();
            ext_off += ext.header_len();
            ext_total += ext.header_len();
        }
    }

    pkt.ip_proto = next;
    pkt.ip_payload_len = ip.payload_length().saturating_sub(ext_total as u16);

    let wire_end = offset + ip.header_len() + ip.payload_length() as usize;
    let cap_end = frame.len().min(wire_end);
    let l4 = &frame[ext_off.min(cap_end)..cap_end];

    if pkt.frag_off > 0 {
        pkt.payload = l4;
        pkt.payload_len_wire = pkt.ip_payload_len as usize;
        return Ok(());
    }
    parse_l4(pkt, l4)
}

fn parse_l4<'a>(pkt: &mut Packet<'a>, l4: &'a [u8]) -> ParseResult<()> {
    let wire_l4 = pkt.ip_payload_len as usize;
    match pkt.ip_proto {
        TCP_PROTOCOL => {
            let tcp = Tcp::parse(l4)?;
            pkt.src_port = tcp.src_port();
            pkt.dst_port = tcp.dst_port();
            pkt.tcp_seq = tcp.seq_no();
            pkt.tcp_ack = tcp.ack_no();
            pkt.tcp_flags = tcp.flags();
            pkt.tcp_window = tcp.window();
            let (options, mss) = tcp.options();
            pkt.tcp_options = options;
            pkt.tcp_mss = mss.unwrap_or(0);
            let hdr = tcp.header_len();
            pkt.payload = &l4[hdr.min(l4.len())..];
            pkt.payload_len_wire = wire_l4.saturating_sub(hdr);
        }
        UDP_PROTOCOL => {
            let udp = Udp::parse(l4)?;
            pkt.src_port = udp.src_port();
            pkt.dst_port = udp.dst_port();
            let hdr = udp.header_len();
            pkt.payload = &l4[hdr.min(l4.len())..];
            pkt.payload_len_wire = wire_l4.saturating_sub(hdr);
        }
        ICMP_PROTOCOL | ICMPV6_PROTOCOL => {
            // type and code stay in the first two payload bytes
            pkt.payload = l4;
            pkt.payload_len_wire = wire_l4;
        }
        _ => {
            // SCTP and anything else: ports stay zero, payload is the L3 payload
            pkt.payload = l4;
            pkt.payload_len_wire = wire_l4;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::Timeval;

    fn eth_frame(ethertype: u16, l3: &[u8]) -> Vec<u8> {
        let mut f = Vec::new();
        f.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x01]); // dst
        f.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x02]); // src
        f.extend_from_slice(&ethertype.to_be_bytes());
        f.extend_from_slice(l3);
        f
    }

    fn ipv4_header(proto: u8, payload_len: u16, src: [u8; 4], dst: [u8; 4]) -> Vec<u8> {
        let mut h = vec![0u8; 20];
        h[0] = 0x45;
        BigEndian::write_u16(&mut h[2..4], 20 + payload_len);
        h[8] = 64;
        h[9] = proto;
        h[12..16].copy_from_slice(&src);
        h[16..20].copy_from_slice(&dst);
        h
    }

    fn udp_datagram(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let mut d = vec![0u8; 8];
        BigEndian::write_u16(&mut d[0..2], src_port);
        BigEndian::write_u16(&mut d[2..4], dst_port);
        BigEndian::write_u16(&mut d[4..6], 8 + payload.len() as u16);
        d.extend_from_slice(payload);
        d
    }

    fn parse(frame: &[u8]) -> (PacketParser, Packet<'_>) {
        let mut parser = PacketParser::default();
        let pkt = parser.parse_frame(frame, frame.len(), Timeval::new(1, 0), Datalink::En10mb);
        (parser, pkt)
    }

    #[test]
    fn core_parse_udp_over_ethernet() {
        let udp = udp_datagram(53, 33333, b"abcd");
        let mut l3 = ipv4_header(17, udp.len() as u16, [10, 0, 0, 1], [10, 0, 0, 2]);
        l3.extend_from_slice(&udp);
        let frame = eth_frame(ETHERTYPE_IPV4, &l3);

        let (parser, pkt) = parse(&frame);
        assert!(pkt.is_parsed());
        assert_eq!(pkt.ip_version, 4);
        assert_eq!(pkt.ip_proto, 17);
        assert_eq!((pkt.src_port, pkt.dst_port), (53, 33333));
        assert_eq!(pkt.payload, b"abcd");
        assert_eq!(pkt.payload_len_wire, 4);
        assert_eq!(pkt.ip_len, 32);
        assert_eq!(pkt.ip_payload_len, 12);
        assert_eq!(parser.stats.udp_packets, 1);
        assert_eq!(parser.stats.ipv4_packets, 1);
    }

    #[test]
    fn core_parse_qinq_records_both_tags() {
        let udp = udp_datagram(1, 2, b"");
        let mut l3 = ipv4_header(17, udp.len() as u16, [1, 1, 1, 1], [2, 2, 2, 2]);
        l3.extend_from_slice(&udp);
        let mut tagged = Vec::new();
        tagged.extend_from_slice(&[0x00, 0x64]); // outer TCI, vlan 100
        tagged.extend_from_slice(&ETHERTYPE_8021Q.to_be_bytes());
        tagged.extend_from_slice(&[0x00, 0xC8]); // inner TCI, vlan 200
        tagged.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        tagged.extend_from_slice(&l3);
        let frame = eth_frame(ETHERTYPE_8021AD, &tagged);

        let (parser, pkt) = parse(&frame);
        assert!(pkt.is_parsed());
        assert_eq!(pkt.vlan_id, 100);
        assert_eq!(pkt.vlan_id2, 200);
        assert_eq!(parser.stats.vlan_packets, 1);
    }

    #[test]
    fn core_parse_mpls_top_label() {
        let udp = udp_datagram(1, 2, b"");
        let mut l3 = ipv4_header(17, udp.len() as u16, [1, 1, 1, 1], [2, 2, 2, 2]);
        l3.extend_from_slice(&udp);
        let mut stacked = Vec::new();
        // two-entry stack: top label 0xABCDE (not BoS), bottom label 5 (BoS)
        stacked.extend_from_slice(&((0xABCDEu32 << 12) | 0x40).to_be_bytes());
        stacked.extend_from_slice(&((5u32 << 12) | (1 << 8) | 0x40).to_be_bytes());
        stacked.extend_from_slice(&l3);
        let frame = eth_frame(ETHERTYPE_MPLS_UC, &stacked);

        let (parser, pkt) = parse(&frame);
        assert!(pkt.is_parsed());
        assert_eq!(extract_bits(pkt.mpls_top_label, 12, 20), 0xABCDE);
        assert_eq!(parser.stats.mpls_packets, 1);
    }

    #[test]
    fn core_parse_fragment_has_no_ports() {
        // non-first fragment: frag_off > 0, raw IP payload
        let mut l3 = ipv4_header(17, 20, [10, 0, 0, 1], [10, 0, 0, 2]);
        BigEndian::write_u16(&mut l3[6..8], 185);
        l3.extend_from_slice(&[0u8; 20]);
        let frame = eth_frame(ETHERTYPE_IPV4, &l3);

        let (_, pkt) = parse(&frame);
        assert!(pkt.is_parsed());
        assert!(pkt.is_fragment());
        assert_eq!(pkt.frag_off, 185);
        assert_eq!((pkt.src_port, pkt.dst_port), (0, 0));
        assert_eq!(pkt.payload_len(), 20);
    }

    #[test]
    fn core_parse_truncated_header_is_unknown() {
        let l3 = ipv4_header(6, 40, [1, 1, 1, 1], [2, 2, 2, 2]);
        // claims TCP but captures only the IP header
        let frame = eth_frame(ETHERTYPE_IPV4, &l3);
        let (parser, pkt) = parse(&frame);
        assert_eq!(pkt.ip_version, 0);
        assert_eq!(parser.stats.unknown_packets, 1);
        assert_eq!(parser.stats.seen_packets, 1);
    }

    #[test]
    fn core_parse_is_deterministic() {
        let udp = udp_datagram(53, 33333, b"abcd");
        let mut l3 = ipv4_header(17, udp.len() as u16, [10, 0, 0, 1], [10, 0, 0, 2]);
        l3.extend_from_slice(&udp);
        let frame = eth_frame(ETHERTYPE_IPV4, &l3);

        let mut parser = PacketParser::default();
        let a = parser.parse_frame(&frame, frame.len(), Timeval::new(1, 0), Datalink::En10mb);
        let fmt_a = format!("{:?}", a);
        drop(a);
        let b = parser.parse_frame(&frame, frame.len(), Timeval::new(1, 0), Datalink::En10mb);
        assert_eq!(fmt_a, format!("{:?}", b));
    }

    #[test]
    fn core_parse_ipv6_extension_walk() {
        let udp = udp_datagram(5353, 5353, b"x");
        let mut v6 = vec![0u8; 40];
        v6[0] = 0x60;
        BigEndian::write_u16(&mut v6[4..6], (8 + udp.len()) as u16);
        v6[6] = ipv6::EXT_DESTINATION;
        v6[7] = 64;
        v6[8] = 0xfd;
        v6[24] = 0xfd;
        // destination options ext: next = UDP, len = 0 (8 bytes)
        let mut ext = vec![0u8; 8];
        ext[0] = UDP_PROTOCOL;
        v6.extend_from_slice(&ext);
        v6.extend_from_slice(&udp);
        let frame = eth_frame(ETHERTYPE_IPV6, &v6);

        let (_, pkt) = parse(&frame);
        assert!(pkt.is_parsed());
        assert_eq!(pkt.ip_version, 6);
        assert_eq!(pkt.ip_proto, UDP_PROTOCOL);
        assert_eq!((pkt.src_port, pkt.dst_port), (5353, 5353));
        assert_eq!(pkt.payload, b"x");
    }
}
