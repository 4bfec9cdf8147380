//! Extended basic fields: TTL, IP flags, TCP window, options, MSS, SYN size.

use crate::export::template::{field, TemplateField, CESNET_PEN};
use crate::flowtable::flow::Flow;
use crate::parser::packet::Packet;
use crate::process::{FlowAction, FlowExt, PluginId, ProcessPlugin};
use crate::protocols::packet::tcp::SYN;

use std::any::Any;

use byteorder::{BigEndian, ByteOrder};

const TEMPLATE: &[TemplateField] = &[
    field(CESNET_PEN, 1001, 1), // IP_TTL
    field(CESNET_PEN, 1002, 1), // IP_TTL_REV
    field(CESNET_PEN, 1003, 1), // IP_FLG
    field(CESNET_PEN, 1004, 1), // IP_FLG_REV
    field(CESNET_PEN, 1005, 2), // TCP_WIN
    field(CESNET_PEN, 1006, 2), // TCP_WIN_REV
    field(CESNET_PEN, 1007, 8), // TCP_OPT
    field(CESNET_PEN, 1008, 8), // TCP_OPT_REV
    field(CESNET_PEN, 1009, 2), // TCP_MSS
    field(CESNET_PEN, 1010, 2), // TCP_MSS_REV
    field(CESNET_PEN, 1011, 2), // TCP_SYN_SIZE
];

const RECORD_SIZE: usize = 1 + 1 + 1 + 1 + 2 + 2 + 8 + 8 + 2 + 2 + 2;

/// Per-flow record; index 0 is the canonical direction, 1 the reverse.
#[derive(Debug, Default)]
pub struct BasicPlusExt {
    pub ip_ttl: [u8; 2],
    pub ip_flg: [u8; 2],
    pub tcp_win: [u16; 2],
    pub tcp_opt: [u64; 2],
    pub tcp_mss: [u16; 2],
    pub tcp_syn_size: u16,
    dst_filled: bool,
}

impl FlowExt for BasicPlusExt {
    fn fill_ipfix(&self, buf: &mut [u8]) -> Option<usize> {
        if buf.len() < RECORD_SIZE {
            return None;
        }
        buf[0] = self.ip_ttl[0];
        buf[1] = self.ip_ttl[1];
        buf[2] = self.ip_flg[0];
        buf[3] = self.ip_flg[1];
        BigEndian::write_u16(&mut buf[4..6], self.tcp_win[0]);
        BigEndian::write_u16(&mut buf[6..8], self.tcp_win[1]);
        BigEndian::write_u64(&mut buf[8..16], self.tcp_opt[0]);
        BigEndian::write_u64(&mut buf[16..24], self.tcp_opt[1]);
        BigEndian::write_u16(&mut buf[24..26], self.tcp_mss[0]);
        BigEndian::write_u16(&mut buf[26..28], self.tcp_mss[1]);
        BigEndian::write_u16(&mut buf[28..30], self.tcp_syn_size);
        Some(RECORD_SIZE)
    }

    fn get_text(&self) -> String {
        format!(
            "sttl={},dttl={},sflg={},dflg={},stcpw={},dtcpw={},stcpo={},dtcpo={},\
             stcpm={},dtcpm={},tcpsynsize={}",
            self.ip_ttl[0],
            self.ip_ttl[1],
            self.ip_flg[0],
            self.ip_flg[1],
            self.tcp_win[0],
            self.tcp_win[1],
            self.tcp_opt[0],
            self.tcp_opt[1],
            self.tcp_mss[0],
            self.tcp_mss[1],
            self.tcp_syn_size
        )
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Records first-seen L3/L4 characteristics per direction.
pub struct BasicPlusPlugin {
    id: PluginId,
}

impl BasicPlusPlugin {
    pub fn new(id: PluginId) -> Self {
        BasicPlusPlugin { id }
    }
}

impl ProcessPlugin for BasicPlusPlugin {
    fn name(&self) -> &'static str {
        "basicplus"
    }

    fn id(&self) -> PluginId {
        self.id
    }

    fn ipfix_template(&self) -> &'static [TemplateField] {
        TEMPLATE
    }

    fn post_create(&mut self, flow: &mut Flow, pkt: &Packet) -> FlowAction {
        let mut ext = BasicPlusExt {
            ip_ttl: [pkt.ip_ttl, 0],
            ip_flg: [pkt.ip_flags, 0],
            tcp_win: [pkt.tcp_window, 0],
            tcp_opt: [pkt.tcp_options, 0],
            tcp_mss: [pkt.tcp_mss, 0],
            tcp_syn_size: 0,
            dst_filled: false,
        };
        if pkt.tcp_flags == SYN {
            ext.tcp_syn_size = pkt.ip_len;
        }
        flow.add_extension(self.id, Box::new(ext));
        FlowAction::Continue
    }

    fn pre_update(&mut self, flow: &mut Flow, pkt: &Packet) -> FlowAction {
        let dir = usize::from(!pkt.source_pkt);
        let ip_ttl = pkt.ip_ttl;
        if let Some(ext) = flow.ext_mut::<BasicPlusExt>(self.id) {
            if ext.ip_ttl[dir] < ip_ttl {
                ext.ip_ttl[dir] = ip_ttl;
            }
            if dir == 1 && !ext.dst_filled {
                ext.ip_ttl[1] = pkt.ip_ttl;
                ext.ip_flg[1] = pkt.ip_flags;
                ext.tcp_win[1] = pkt.tcp_window;
                ext.tcp_opt[1] = pkt.tcp_options;
                ext.tcp_mss[1] = pkt.tcp_mss;
                ext.dst_filled = true;
            }
        }
        FlowAction::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::Timeval;

    fn tcp_packet(source: bool, ttl: u8, window: u16, flags: u8) -> Packet<'static> {
        let mut pkt = Packet::unparsed(&[], 64, Timeval::new(1, 0));
        pkt.ip_version = 4;
        pkt.ip_proto = 6;
        pkt.ip_len = 64;
        pkt.ip_ttl = ttl;
        pkt.tcp_window = window;
        pkt.tcp_flags = flags;
        pkt.source_pkt = source;
        pkt
    }

    #[test]
    fn core_basicplus_fills_directions() {
        let mut plugin = BasicPlusPlugin::new(0);
        let syn = tcp_packet(true, 64, 29200, SYN);
        let mut flow = Flow::new(&syn, 0);
        plugin.post_create(&mut flow, &syn);

        let ext = flow.ext::<BasicPlusExt>(0).unwrap();
        assert_eq!(ext.ip_ttl[0], 64);
        assert_eq!(ext.tcp_syn_size, 64);

        let synack = tcp_packet(false, 128, 65535, SYN | 0x10);
        flow.update(&synack, false);
        plugin.pre_update(&mut flow, &synack);
        let ext = flow.ext::<BasicPlusExt>(0).unwrap();
        assert_eq!(ext.ip_ttl[1], 128);
        assert_eq!(ext.tcp_win[1], 65535);

        // reverse fields only fill once
        let later = tcp_packet(false, 200, 100, 0x10);
        plugin.pre_update(&mut flow, &later);
        let ext = flow.ext::<BasicPlusExt>(0).unwrap();
        assert_eq!(ext.tcp_win[1], 65535);
        assert_eq!(ext.ip_ttl[1], 200); // but larger TTL still tracked
    }

    #[test]
    fn core_basicplus_ipfix_size() {
        let ext = BasicPlusExt::default();
        let mut buf = [0u8; 64];
        assert_eq!(ext.fill_ipfix(&mut buf), Some(RECORD_SIZE));
        assert!(ext.fill_ipfix(&mut buf[..RECORD_SIZE - 1]).is_none());
    }
}
