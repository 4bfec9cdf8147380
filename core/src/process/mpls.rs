//! Exports the topmost MPLS label stack entry of a flow.

use crate::export::template::{field, TemplateField, CESNET_PEN, VAR_LEN};
use crate::flowtable::flow::Flow;
use crate::parser::packet::Packet;
use crate::process::{FlowAction, FlowExt, PluginId, ProcessPlugin};

use std::any::Any;

/// Top label stack section: label, TC, bottom-of-stack (3 bytes on the wire).
const LABEL_SECTION_LENGTH: usize = 3;

const TEMPLATE: &[TemplateField] = &[
    field(CESNET_PEN, 1025, VAR_LEN), // MPLS_TOP_LABEL_STACK_SECTION
];

#[derive(Debug, Default)]
pub struct MplsExt {
    /// From MSb to LSb: 20-bit label, 3-bit TC, 1-bit bottom-of-stack,
    /// 8-bit TTL.
    pub mpls: u32,
}

impl FlowExt for MplsExt {
    fn fill_ipfix(&self, buf: &mut [u8]) -> Option<usize> {
        if buf.len() < LABEL_SECTION_LENGTH + 1 {
            return None;
        }
        buf[0] = LABEL_SECTION_LENGTH as u8;
        buf[1..4].copy_from_slice(&self.mpls.to_be_bytes()[..LABEL_SECTION_LENGTH]);
        Some(LABEL_SECTION_LENGTH + 1)
    }

    fn get_text(&self) -> String {
        format!("mpls_label_1=\"{}\"", self.mpls >> 8)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub struct MplsPlugin {
    id: PluginId,
}

impl MplsPlugin {
    pub fn new(id: PluginId) -> Self {
        MplsPlugin { id }
    }
}

impl ProcessPlugin for MplsPlugin {
    fn name(&self) -> &'static str {
        "mpls"
    }

    fn id(&self) -> PluginId {
        self.id
    }

    fn ipfix_template(&self) -> &'static [TemplateField] {
        TEMPLATE
    }

    fn post_create(&mut self, flow: &mut Flow, pkt: &Packet) -> FlowAction {
        if pkt.mpls_top_label != 0 {
            flow.add_extension(self.id, Box::new(MplsExt { mpls: pkt.mpls_top_label }));
        }
        FlowAction::NoData
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_mpls_ipfix_top_three_bytes() {
        let ext = MplsExt { mpls: 0xABCDE140 };
        let mut buf = [0u8; 8];
        assert_eq!(ext.fill_ipfix(&mut buf), Some(4));
        assert_eq!(buf[0], 3);
        assert_eq!(&buf[1..4], &[0xAB, 0xCD, 0xE1]);
    }
}
