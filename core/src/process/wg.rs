//! WireGuard tunnel detection.
//!
//! Tracks the four WireGuard message types over UDP payloads, remembering
//! the sender/receiver peer indices. A handshake initiation naming a new
//! peer flushes the flow and reinserts the packet as the first of a new
//! flow. Confidence is 100, demoted to 1 when the payload also matches a
//! plausible DNS query header.

use crate::export::template::{field, TemplateField, CESNET_PEN};
use crate::flowtable::flow::Flow;
use crate::parser::packet::Packet;
use crate::process::{FlowAction, FlowExt, PluginId, ProcessPlugin};
use crate::protocols::packet::udp::UDP_PROTOCOL;

use std::any::Any;

use byteorder::{ByteOrder, LittleEndian};

// Message types.
const PKTTYPE_INIT_TO_RESP: u8 = 0x01;
const PKTTYPE_RESP_TO_INIT: u8 = 0x02;
const PKTTYPE_COOKIE_REPLY: u8 = 0x03;
const PKTTYPE_TRANSPORT_DATA: u8 = 0x04;

// Exact (or minimum, for data) payload lengths per message type.
const PKTLEN_INIT_TO_RESP: usize = 148;
const PKTLEN_RESP_TO_INIT: usize = 92;
const PKTLEN_COOKIE_REPLY: usize = 64;
const PKTLEN_MIN_TRANSPORT_DATA: usize = 32;

const TEMPLATE: &[TemplateField] = &[
    field(CESNET_PEN, 1085, 1), // WG_CONF_LEVEL
    field(CESNET_PEN, 1086, 4), // WG_SRC_PEER
    field(CESNET_PEN, 1087, 4), // WG_DST_PEER
];

#[derive(Debug, Default)]
pub struct WgExt {
    /// Confidence 0..=100.
    pub possible_wg: u8,
    pub src_peer: u32,
    pub dst_peer: u32,
}

impl FlowExt for WgExt {
    fn fill_ipfix(&self, buf: &mut [u8]) -> Option<usize> {
        if buf.len() < 9 {
            return None;
        }
        buf[0] = self.possible_wg;
        // peer indices are little-endian on the wire and exported verbatim
        LittleEndian::write_u32(&mut buf[1..5], self.src_peer);
        LittleEndian::write_u32(&mut buf[5..9], self.dst_peer);
        Some(9)
    }

    fn get_text(&self) -> String {
        format!(
            "wgconf={},wgsrcpeer={},wgdstpeer={}",
            self.possible_wg, self.src_peer, self.dst_peer
        )
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub struct WgPlugin {
    id: PluginId,
    flow_flush: bool,
    total: u64,
    identified: u64,
}

impl WgPlugin {
    pub fn new(id: PluginId) -> Self {
        WgPlugin {
            id,
            flow_flush: false,
            total: 0,
            identified: 0,
        }
    }

    /// Parses one UDP payload as a WireGuard message into `ext`.
    ///
    /// Sets `self.flow_flush` when a handshake initiation names a peer
    /// other than the one tracked so far.
    fn parse_wg(&mut self, data: &[u8], source_pkt: bool, ext: &mut WgExt) -> bool {
        self.total += 1;

        // the smallest valid message is transport data: 16 header bytes
        // plus 16 bytes of (empty) data authentication
        if data.len() < PKTLEN_MIN_TRANSPORT_DATA {
            return false;
        }
        let pkt_type = data[0];
        if !(PKTTYPE_INIT_TO_RESP..=PKTTYPE_TRANSPORT_DATA).contains(&pkt_type) {
            return false;
        }
        // the three bytes after the type are reserved zeros
        if data[1] != 0 || data[2] != 0 || data[3] != 0 {
            return false;
        }

        match pkt_type {
            PKTTYPE_INIT_TO_RESP => {
                if data.len() != PKTLEN_INIT_TO_RESP {
                    return false;
                }
                let new_peer = LittleEndian::read_u32(&data[4..8]);
                let tracked = if source_pkt { ext.src_peer } else { ext.dst_peer };
                if tracked != 0 && tracked != new_peer {
                    self.flow_flush = true;
                    return false;
                }
                if source_pkt {
                    ext.src_peer = new_peer;
                } else {
                    ext.dst_peer = new_peer;
                }
            }
            PKTTYPE_RESP_TO_INIT => {
                if data.len() != PKTLEN_RESP_TO_INIT {
                    return false;
                }
                ext.src_peer = LittleEndian::read_u32(&data[4..8]);
                ext.dst_peer = LittleEndian::read_u32(&data[8..12]);
                if !source_pkt {
                    std::mem::swap(&mut ext.src_peer, &mut ext.dst_peer);
                }
            }
            PKTTYPE_COOKIE_REPLY => {
                if data.len() != PKTLEN_COOKIE_REPLY {
                    return false;
                }
                let receiver = LittleEndian::read_u32(&data[4..8]);
                if source_pkt {
                    ext.dst_peer = receiver;
                } else {
                    ext.src_peer = receiver;
                }
            }
            _ => {
                // transport data is zero-padded to a multiple of 16
                if data.len() % 16 != 0 {
                    return false;
                }
                let receiver = LittleEndian::read_u32(&data[4..8]);
                if source_pkt {
                    ext.dst_peer = receiver;
                } else {
                    ext.src_peer = receiver;
                }
            }
        }

        // a small DNS query has the same shape: transaction ID 1..=4 with
        // zeroed flags and one question
        const DNS_QUERY_MASK: [u8; 4] = [0x00, 0x01, 0x00, 0x00];
        ext.possible_wg = if data[4..8] == DNS_QUERY_MASK { 1 } else { 100 };
        self.identified += 1;
        true
    }
}

impl ProcessPlugin for WgPlugin {
    fn name(&self) -> &'static str {
        "wg"
    }

    fn id(&self) -> PluginId {
        self.id
    }

    fn ipfix_template(&self) -> &'static [TemplateField] {
        TEMPLATE
    }

    fn post_create(&mut self, flow: &mut Flow, pkt: &Packet) -> FlowAction {
        if pkt.ip_proto != UDP_PROTOCOL {
            return FlowAction::NoData;
        }
        let mut ext = WgExt::default();
        self.flow_flush = false;
        if self.parse_wg(pkt.payload, pkt.source_pkt, &mut ext) {
            flow.add_extension(self.id, Box::new(ext));
        }
        FlowAction::Continue
    }

    fn pre_update(&mut self, flow: &mut Flow, pkt: &Packet) -> FlowAction {
        self.flow_flush = false;
        if let Some(ext) = flow.ext_mut::<WgExt>(self.id) {
            if ext.possible_wg > 0 {
                let parsed = self.parse_wg(pkt.payload, pkt.source_pkt, ext);
                if self.flow_flush {
                    self.flow_flush = false;
                    return FlowAction::FlushWithReinsert;
                }
                if !parsed {
                    ext.possible_wg = 0;
                }
            }
        }
        FlowAction::Continue
    }

    fn finish(&mut self, print_stats: bool) {
        if print_stats {
            log::info!(
                "wg plugin stats: identified {}, total {}",
                self.identified,
                self.total
            );
        }
    }
}
