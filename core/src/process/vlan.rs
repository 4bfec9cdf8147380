//! Exports the outer VLAN ID of a flow.

use crate::export::template::{field, TemplateField, CESNET_PEN};
use crate::flowtable::flow::Flow;
use crate::parser::packet::Packet;
use crate::process::{FlowAction, FlowExt, PluginId, ProcessPlugin};

use std::any::Any;

use byteorder::{BigEndian, ByteOrder};

const TEMPLATE: &[TemplateField] = &[
    field(CESNET_PEN, 1020, 2), // VLAN_ID
];

#[derive(Debug, Default)]
pub struct VlanExt {
    /// Host byte order.
    pub vlan_id: u16,
}

impl FlowExt for VlanExt {
    fn fill_ipfix(&self, buf: &mut [u8]) -> Option<usize> {
        if buf.len() < 2 {
            return None;
        }
        BigEndian::write_u16(&mut buf[0..2], self.vlan_id);
        Some(2)
    }

    fn get_text(&self) -> String {
        format!("vlan_id=\"{}\"", self.vlan_id)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub struct VlanPlugin {
    id: PluginId,
}

impl VlanPlugin {
    pub fn new(id: PluginId) -> Self {
        VlanPlugin { id }
    }
}

impl ProcessPlugin for VlanPlugin {
    fn name(&self) -> &'static str {
        "vlan"
    }

    fn id(&self) -> PluginId {
        self.id
    }

    fn ipfix_template(&self) -> &'static [TemplateField] {
        TEMPLATE
    }

    fn post_create(&mut self, flow: &mut Flow, pkt: &Packet) -> FlowAction {
        flow.add_extension(self.id, Box::new(VlanExt { vlan_id: pkt.vlan_id }));
        // the tag never changes within a flow
        FlowAction::NoData
    }
}
