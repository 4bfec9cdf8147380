//! The per-packet descriptor.

use crate::utils::Timeval;

use std::net::{IpAddr, Ipv4Addr};

use pnet::datalink::MacAddr;

/// A parsed packet descriptor.
///
/// One descriptor is produced per captured frame and carries every field the
/// flow cache and process plugins consume. The `packet` and `payload`
/// windows borrow from the input slot's buffer and are valid only for the
/// duration of one pipeline pass; plugin hooks must not retain them past the
/// hook return.
///
/// A descriptor with `ip_version == 0` failed to parse and must be skipped
/// by flow processing.
#[derive(Debug, Clone)]
pub struct Packet<'a> {
    /// Capture timestamp.
    pub ts: Timeval,

    /// Source MAC address of the outermost Ethernet header.
    pub src_mac: MacAddr,
    /// Destination MAC address of the outermost Ethernet header.
    pub dst_mac: MacAddr,
    /// EtherType after the tag stack, host order.
    pub ethertype: u16,

    /// Outer VLAN ID; `0` when untagged.
    pub vlan_id: u16,
    /// Inner VLAN ID for QinQ frames; `0` when absent.
    pub vlan_id2: u16,
    /// Topmost MPLS label stack entry: 20-bit label, 3-bit TC, 1-bit BoS,
    /// 8-bit TTL. `0` when no MPLS stack was present.
    pub mpls_top_label: u32,

    /// IP version, `4` or `6`; `0` marks an unparsed packet.
    pub ip_version: u8,
    /// L4 protocol number.
    pub ip_proto: u8,
    /// TTL (IPv4) or hop limit (IPv6).
    pub ip_ttl: u8,
    /// Type of service / traffic class.
    pub ip_tos: u8,
    /// IPv4 header flags (3 bits); `0` for IPv6.
    pub ip_flags: u8,
    /// L3 length including the IP header.
    pub ip_len: u16,
    /// L4-and-up length (L3 payload after the IP and extension headers).
    pub ip_payload_len: u16,
    /// Source IP address.
    pub src_ip: IpAddr,
    /// Destination IP address.
    pub dst_ip: IpAddr,

    /// Source transport port, host order; `0` when the protocol has none.
    pub src_port: u16,
    /// Destination transport port, host order.
    pub dst_port: u16,

    /// TCP flags byte.
    pub tcp_flags: u8,
    /// TCP receive window.
    pub tcp_window: u16,
    /// TCP MSS from the option list; `0` when absent.
    pub tcp_mss: u16,
    /// Bitmap of TCP option kinds present (bit k = kind k, kinds < 64).
    pub tcp_options: u64,
    /// TCP sequence number.
    pub tcp_seq: u32,
    /// TCP acknowledgment number.
    pub tcp_ack: u32,

    /// IP fragment identification.
    pub frag_id: u32,
    /// Fragment offset in units of 8 bytes.
    pub frag_off: u16,
    /// More-fragments flag.
    pub more_fragments: bool,

    /// Captured frame bytes.
    pub packet: &'a [u8],
    /// Frame length on the wire (>= `packet.len()` under truncation).
    pub packet_len_wire: usize,
    /// Captured L7 payload window (after the L4 header).
    pub payload: &'a [u8],
    /// L7 payload length on the wire.
    pub payload_len_wire: usize,

    /// `true` if this packet travels in the flow's canonical direction.
    /// Written by the flow cache during lookup.
    pub source_pkt: bool,

    /// Optional hardware-supplied metadata window.
    pub custom: Option<&'a [u8]>,
}

impl<'a> Packet<'a> {
    /// An unparsed descriptor over `frame`; `ip_version` is `0`.
    pub fn unparsed(frame: &'a [u8], wire_len: usize, ts: Timeval) -> Self {
        Packet {
            ts,
            src_mac: MacAddr::zero(),
            dst_mac: MacAddr::zero(),
            ethertype: 0,
            vlan_id: 0,
            vlan_id2: 0,
            mpls_top_label: 0,
            ip_version: 0,
            ip_proto: 0,
            ip_ttl: 0,
            ip_tos: 0,
            ip_flags: 0,
            ip_len: 0,
            ip_payload_len: 0,
            src_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dst_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            src_port: 0,
            dst_port: 0,
            tcp_flags: 0,
            tcp_window: 0,
            tcp_mss: 0,
            tcp_options: 0,
            tcp_seq: 0,
            tcp_ack: 0,
            frag_id: 0,
            frag_off: 0,
            more_fragments: false,
            packet: frame,
            packet_len_wire: wire_len,
            payload: &frame[0..0],
            payload_len_wire: 0,
            source_pkt: true,
            custom: None,
        }
    }

    /// Captured frame length.
    #[inline]
    pub fn packet_len(&self) -> usize {
        self.packet.len()
    }

    /// Captured payload length.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// `true` once L3 decoding succeeded.
    #[inline]
    pub fn is_parsed(&self) -> bool {
        self.ip_version != 0
    }

    /// `true` when any fragmentation field is set.
    #[inline]
    pub fn is_fragment(&self) -> bool {
        self.frag_off != 0 || self.more_fragments
    }
}
