//! Exports the outer and inner VLAN IDs of QinQ traffic.

use crate::export::template::{field, TemplateField, CESNET_PEN};
use crate::flowtable::flow::Flow;
use crate::parser::packet::Packet;
use crate::process::{FlowAction, FlowExt, PluginId, ProcessPlugin};

use std::any::Any;

use byteorder::{BigEndian, ByteOrder};

const TEMPLATE: &[TemplateField] = &[
    field(CESNET_PEN, 1021, 2), // QINQ_VLAN_ID
    field(CESNET_PEN, 1022, 2), // QINQ_VLAN_ID_INNER
];

#[derive(Debug, Default)]
pub struct QinQExt {
    pub vlan_id: u16,
    pub vlan_id2: u16,
}

impl FlowExt for QinQExt {
    fn fill_ipfix(&self, buf: &mut [u8]) -> Option<usize> {
        if buf.len() < 4 {
            return None;
        }
        BigEndian::write_u16(&mut buf[0..2], self.vlan_id);
        BigEndian::write_u16(&mut buf[2..4], self.vlan_id2);
        Some(4)
    }

    fn get_text(&self) -> String {
        format!("vlan_id=\"{}\",vlan_id_inner=\"{}\"", self.vlan_id, self.vlan_id2)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub struct QinQPlugin {
    id: PluginId,
}

impl QinQPlugin {
    pub fn new(id: PluginId) -> Self {
        QinQPlugin { id }
    }
}

impl ProcessPlugin for QinQPlugin {
    fn name(&self) -> &'static str {
        "qinq"
    }

    fn id(&self) -> PluginId {
        self.id
    }

    fn ipfix_template(&self) -> &'static [TemplateField] {
        TEMPLATE
    }

    fn post_create(&mut self, flow: &mut Flow, pkt: &Packet) -> FlowAction {
        flow.add_extension(
            self.id,
            Box::new(QinQExt {
                vlan_id: pkt.vlan_id,
                vlan_id2: pkt.vlan_id2,
            }),
        );
        FlowAction::NoData
    }
}
