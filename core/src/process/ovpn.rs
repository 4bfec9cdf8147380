//! OpenVPN detection.
//!
//! Follows the OpenVPN control-channel opcode sequence (hard reset, TLS
//! hellos, acks, data) as a small state machine per flow, filtering out
//! RTP-like payloads, and scores the flow 0..=100 at export time.

use crate::export::template::{field, TemplateField, CESNET_PEN};
use crate::flowtable::flow::Flow;
use crate::parser::packet::Packet;
use crate::process::{FlowAction, FlowExt, PluginId, ProcessPlugin};
use crate::protocols::packet::tcp::TCP_PROTOCOL;
use crate::protocols::packet::udp::UDP_PROTOCOL;

use std::any::Any;
use std::net::IpAddr;

// Opcodes (high 5 bits of the first header byte).
const P_CONTROL_HARD_RESET_CLIENT_V1: u8 = 1;
const P_CONTROL_HARD_RESET_SERVER_V1: u8 = 2;
const P_CONTROL_SOFT_RESET_V1: u8 = 3;
const P_CONTROL_V1: u8 = 4;
const P_ACK_V1: u8 = 5;
const P_DATA_V1: u8 = 6;
const P_CONTROL_HARD_RESET_CLIENT_V2: u8 = 7;
const P_CONTROL_HARD_RESET_SERVER_V2: u8 = 8;
const P_DATA_V2: u8 = 9;
const P_CONTROL_HARD_RESET_CLIENT_V3: u8 = 10;

// Detection state.
const STATUS_NULL: u8 = 0;
const STATUS_RESET_CLIENT: u8 = 1;
const STATUS_RESET_SERVER: u8 = 2;
const STATUS_ACK: u8 = 3;
const STATUS_CLIENT_HELLO: u8 = 4;
const STATUS_SERVER_HELLO: u8 = 5;
const STATUS_CONTROL_ACK: u8 = 6;
const STATUS_DATA: u8 = 7;

/// Opcode byte offset within the L7 payload.
const UDP_OPCODE_INDEX: usize = 0;
const TCP_OPCODE_INDEX: usize = 2;

/// Payloads above this size count toward the data-packet ratio.
const MIN_DATA_PACKET_SIZE: usize = 500;
/// Packets needed before the full-confidence rule applies.
const MIN_PCKT_THRESHOLD: u32 = 20;
/// Flows at or below this packet count are dropped at export.
const MIN_PCKT_EXPORT_THRESHOLD: u32 = 5;
/// Data-to-large packet ratio for the partial-confidence rule.
const DATA_PCKT_THRESHOLD: f64 = 0.6;
/// Consecutive invalid transitions that reset the state machine.
const INVALID_PCKT_THRESHOLD: i32 = 4;

const RTP_HEADER_MIN_SIZE: usize = 12;

const TEMPLATE: &[TemplateField] = &[
    field(CESNET_PEN, 1090, 1), // OVPN_CONF_LEVEL
];

#[derive(Debug, Default)]
pub struct OvpnExt {
    /// Confidence 0..=100, filled at export.
    pub possible_vpn: u8,
    large_pkt_cnt: u32,
    data_pkt_cnt: u32,
    invalid_pkt_cnt: i32,
    status: u8,
    client_ip: Option<IpAddr>,
}

impl FlowExt for OvpnExt {
    fn fill_ipfix(&self, buf: &mut [u8]) -> Option<usize> {
        if buf.is_empty() {
            return None;
        }
        buf[0] = self.possible_vpn;
        Some(1)
    }

    fn get_text(&self) -> String {
        format!("ovpnconf={}", self.possible_vpn)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// `true` when the payload could be an RTP packet (version 2, payload type
/// outside the RTCP conflict range).
fn check_valid_rtp_header(pkt: &Packet) -> bool {
    if pkt.ip_proto != UDP_PROTOCOL || pkt.payload_len() < RTP_HEADER_MIN_SIZE {
        return false;
    }
    let version = pkt.payload[0] >> 6;
    if version != 2 {
        return false;
    }
    let payload_type = pkt.payload[1] & 0x7F;
    !(72..=95).contains(&payload_type)
}

fn check_ssl_client_hello(payload: &[u8], opcode_index: usize) -> bool {
    (payload.len() > opcode_index + 19
        && payload[opcode_index + 14] == 0x16
        && payload[opcode_index + 19] == 0x01)
        || (payload.len() > opcode_index + 47
            && payload[opcode_index + 42] == 0x16
            && payload[opcode_index + 47] == 0x01)
}

fn check_ssl_server_hello(payload: &[u8], opcode_index: usize) -> bool {
    (payload.len() > opcode_index + 31
        && payload[opcode_index + 26] == 0x16
        && payload[opcode_index + 31] == 0x02)
        || (payload.len() > opcode_index + 59
            && payload[opcode_index + 54] == 0x16
            && payload[opcode_index + 59] == 0x02)
}

pub struct OvpnPlugin {
    id: PluginId,
}

impl OvpnPlugin {
    pub fn new(id: PluginId) -> Self {
        OvpnPlugin { id }
    }

    fn update_record(ext: &mut OvpnExt, pkt: &Packet) {
        let opcode_index = match pkt.ip_proto {
            UDP_PROTOCOL => {
                if pkt.payload_len() == 0 {
                    return;
                }
                UDP_OPCODE_INDEX
            }
            TCP_PROTOCOL => {
                if pkt.payload_len() < TCP_OPCODE_INDEX + 1 {
                    return;
                }
                TCP_OPCODE_INDEX
            }
            _ => return,
        };
        let opcode = pkt.payload[opcode_index] >> 3;

        match opcode {
            P_CONTROL_HARD_RESET_CLIENT_V1
            | P_CONTROL_HARD_RESET_CLIENT_V2
            | P_CONTROL_HARD_RESET_CLIENT_V3 => {
                // client to server
                ext.status = STATUS_RESET_CLIENT;
                ext.invalid_pkt_cnt = -1;
                ext.client_ip = Some(pkt.src_ip);
            }
            P_CONTROL_HARD_RESET_SERVER_V1 | P_CONTROL_HARD_RESET_SERVER_V2 => {
                if ext.status == STATUS_RESET_CLIENT && ext.client_ip == Some(pkt.dst_ip) {
                    // server to client
                    ext.status = STATUS_RESET_SERVER;
                    ext.invalid_pkt_cnt = -1;
                } else {
                    ext.invalid_pkt_cnt += 1;
                    if ext.invalid_pkt_cnt == INVALID_PCKT_THRESHOLD {
                        ext.status = STATUS_NULL;
                    }
                }
            }
            P_CONTROL_SOFT_RESET_V1 => {}
            P_CONTROL_V1 => {
                if ext.status == STATUS_ACK
                    && ext.client_ip == Some(pkt.src_ip)
                    && check_ssl_client_hello(pkt.payload, opcode_index)
                {
                    ext.status = STATUS_CLIENT_HELLO;
                    ext.invalid_pkt_cnt = -1;
                } else if ext.status == STATUS_CLIENT_HELLO
                    && ext.client_ip == Some(pkt.dst_ip)
                    && check_ssl_server_hello(pkt.payload, opcode_index)
                {
                    ext.status = STATUS_SERVER_HELLO;
                    ext.invalid_pkt_cnt = -1;
                } else if ext.status == STATUS_SERVER_HELLO || ext.status == STATUS_CONTROL_ACK {
                    ext.status = STATUS_CONTROL_ACK;
                    ext.invalid_pkt_cnt = -1;
                } else {
                    ext.invalid_pkt_cnt += 1;
                    if ext.invalid_pkt_cnt == INVALID_PCKT_THRESHOLD {
                        ext.status = STATUS_NULL;
                    }
                }
            }
            P_ACK_V1 => {
                if ext.status == STATUS_RESET_SERVER && ext.client_ip == Some(pkt.src_ip) {
                    ext.status = STATUS_ACK;
                    ext.invalid_pkt_cnt = -1;
                } else if ext.status == STATUS_SERVER_HELLO || ext.status == STATUS_CONTROL_ACK {
                    ext.status = STATUS_CONTROL_ACK;
                    ext.invalid_pkt_cnt = -1;
                }
            }
            P_DATA_V1 | P_DATA_V2 => {
                if ext.status == STATUS_CONTROL_ACK || ext.status == STATUS_DATA {
                    ext.status = STATUS_DATA;
                    ext.invalid_pkt_cnt = -1;
                }
                if pkt.payload_len_wire > MIN_DATA_PACKET_SIZE && !check_valid_rtp_header(pkt) {
                    ext.data_pkt_cnt += 1;
                }
            }
            _ => {}
        }

        if pkt.payload_len_wire > MIN_DATA_PACKET_SIZE && !check_valid_rtp_header(pkt) {
            ext.large_pkt_cnt += 1;
        }

        if ext.invalid_pkt_cnt >= INVALID_PCKT_THRESHOLD {
            ext.status = STATUS_NULL;
            ext.invalid_pkt_cnt = -1;
        }
        ext.invalid_pkt_cnt += 1;
    }
}

impl ProcessPlugin for OvpnPlugin {
    fn name(&self) -> &'static str {
        "ovpn"
    }

    fn id(&self) -> PluginId {
        self.id
    }

    fn ipfix_template(&self) -> &'static [TemplateField] {
        TEMPLATE
    }

    fn post_create(&mut self, flow: &mut Flow, pkt: &Packet) -> FlowAction {
        let mut ext = OvpnExt::default();
        Self::update_record(&mut ext, pkt);
        flow.add_extension(self.id, Box::new(ext));
        FlowAction::Continue
    }

    fn pre_update(&mut self, flow: &mut Flow, pkt: &Packet) -> FlowAction {
        if let Some(ext) = flow.ext_mut::<OvpnExt>(self.id) {
            Self::update_record(ext, pkt);
        }
        FlowAction::Continue
    }

    fn pre_export(&mut self, flow: &mut Flow) {
        let packets = flow.packets();
        // short flows are usually port scans
        if packets <= MIN_PCKT_EXPORT_THRESHOLD {
            flow.remove_extension(self.id);
            return;
        }
        if let Some(ext) = flow.ext_mut::<OvpnExt>(self.id) {
            if packets > MIN_PCKT_THRESHOLD && ext.status == STATUS_DATA {
                ext.possible_vpn = 100;
            } else if ext.large_pkt_cnt > MIN_PCKT_THRESHOLD
                && (ext.data_pkt_cnt as f64 / ext.large_pkt_cnt as f64) >= DATA_PCKT_THRESHOLD
            {
                ext.possible_vpn =
                    ((ext.data_pkt_cnt as f64 / ext.large_pkt_cnt as f64) * 80.0) as u8;
            }
        }
    }
}
