//! ICMP type and code extraction.

use crate::export::template::{field, TemplateField, CESNET_PEN};
use crate::flowtable::flow::Flow;
use crate::parser::packet::Packet;
use crate::process::{FlowAction, FlowExt, PluginId, ProcessPlugin};
use crate::protocols::packet::icmp::{ICMPV6_PROTOCOL, ICMP_PROTOCOL};

use std::any::Any;

use byteorder::{BigEndian, ByteOrder};

const TEMPLATE: &[TemplateField] = &[
    field(CESNET_PEN, 1035, 2), // L4_ICMP_TYPE_CODE
];

#[derive(Debug, Default)]
pub struct IcmpExt {
    /// Type in the high byte, code in the low byte.
    pub type_code: u16,
}

impl IcmpExt {
    #[inline]
    pub fn icmp_type(&self) -> u8 {
        (self.type_code >> 8) as u8
    }

    #[inline]
    pub fn icmp_code(&self) -> u8 {
        self.type_code as u8
    }
}

impl FlowExt for IcmpExt {
    fn fill_ipfix(&self, buf: &mut [u8]) -> Option<usize> {
        if buf.len() < 2 {
            return None;
        }
        BigEndian::write_u16(&mut buf[0..2], self.type_code);
        Some(2)
    }

    fn get_text(&self) -> String {
        format!("icmptype={},icmpcode={}", self.icmp_type(), self.icmp_code())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub struct IcmpPlugin {
    id: PluginId,
}

impl IcmpPlugin {
    pub fn new(id: PluginId) -> Self {
        IcmpPlugin { id }
    }
}

impl ProcessPlugin for IcmpPlugin {
    fn name(&self) -> &'static str {
        "icmp"
    }

    fn id(&self) -> PluginId {
        self.id
    }

    fn ipfix_template(&self) -> &'static [TemplateField] {
        TEMPLATE
    }

    fn post_create(&mut self, flow: &mut Flow, pkt: &Packet) -> FlowAction {
        if pkt.ip_proto != ICMP_PROTOCOL && pkt.ip_proto != ICMPV6_PROTOCOL {
            return FlowAction::NoData;
        }
        // type and code are the first two payload bytes, network order
        if pkt.payload_len() < 2 {
            return FlowAction::Continue;
        }
        let ext = IcmpExt {
            type_code: BigEndian::read_u16(&pkt.payload[0..2]),
        };
        flow.add_extension(self.id, Box::new(ext));
        FlowAction::NoData
    }

    fn post_update(&mut self, flow: &mut Flow, pkt: &Packet) -> FlowAction {
        // first packet was too short to carry type/code; retry
        if flow.has_extension(self.id) || pkt.payload_len() < 2 {
            return FlowAction::Continue;
        }
        let ext = IcmpExt {
            type_code: BigEndian::read_u16(&pkt.payload[0..2]),
        };
        flow.add_extension(self.id, Box::new(ext));
        FlowAction::NoData
    }
}
