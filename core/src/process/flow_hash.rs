//! Exports the cache fingerprint as a stable flow identifier.

use crate::export::template::{field, TemplateField, CESNET_PEN};
use crate::flowtable::flow::Flow;
use crate::parser::packet::Packet;
use crate::process::{FlowAction, FlowExt, PluginId, ProcessPlugin};

use std::any::Any;

use byteorder::{BigEndian, ByteOrder};

const TEMPLATE: &[TemplateField] = &[
    field(CESNET_PEN, 1030, 8), // FLOW_ID
];

#[derive(Debug, Default)]
pub struct FlowHashExt {
    /// Host byte order.
    pub flow_hash: u64,
}

impl FlowExt for FlowHashExt {
    fn fill_ipfix(&self, buf: &mut [u8]) -> Option<usize> {
        if buf.len() < 8 {
            return None;
        }
        BigEndian::write_u64(&mut buf[0..8], self.flow_hash);
        Some(8)
    }

    fn get_text(&self) -> String {
        format!("flow_id=\"{:x}\"", self.flow_hash)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub struct FlowHashPlugin {
    id: PluginId,
}

impl FlowHashPlugin {
    pub fn new(id: PluginId) -> Self {
        FlowHashPlugin { id }
    }
}

impl ProcessPlugin for FlowHashPlugin {
    fn name(&self) -> &'static str {
        "flow_hash"
    }

    fn id(&self) -> PluginId {
        self.id
    }

    fn ipfix_template(&self) -> &'static [TemplateField] {
        TEMPLATE
    }

    fn post_create(&mut self, flow: &mut Flow, _pkt: &Packet) -> FlowAction {
        let ext = FlowHashExt {
            flow_hash: flow.flow_hash,
        };
        flow.add_extension(self.id, Box::new(ext));
        FlowAction::NoData
    }
}
