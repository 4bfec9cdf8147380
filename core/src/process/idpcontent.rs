//! Initial data-plane content: the first payload bytes of each direction.

use crate::export::template::{field, TemplateField, CESNET_PEN, VAR_LEN};
use crate::flowtable::flow::Flow;
use crate::parser::packet::Packet;
use crate::process::{FlowAction, FlowExt, PluginId, ProcessPlugin};

use std::any::Any;

/// Exported bytes per direction.
pub const IDPCONTENT_SIZE: usize = 100;

const TEMPLATE: &[TemplateField] = &[
    field(CESNET_PEN, 1040, VAR_LEN), // IDP_CONTENT
    field(CESNET_PEN, 1041, VAR_LEN), // IDP_CONTENT_REV
];

#[derive(Debug)]
pub struct IdpContentExt {
    /// Captured prefix per direction; index 0 canonical, 1 reverse.
    size: [u8; 2],
    data: [[u8; IDPCONTENT_SIZE]; 2],
    filled: [bool; 2],
}

impl Default for IdpContentExt {
    fn default() -> Self {
        IdpContentExt {
            size: [0; 2],
            data: [[0; IDPCONTENT_SIZE]; 2],
            filled: [false; 2],
        }
    }
}

impl IdpContentExt {
    pub fn content(&self, dir: usize) -> &[u8] {
        &self.data[dir][..self.size[dir] as usize]
    }
}

impl FlowExt for IdpContentExt {
    fn fill_ipfix(&self, buf: &mut [u8]) -> Option<usize> {
        let need = 2 + self.size[0] as usize + self.size[1] as usize;
        if buf.len() < need {
            return None;
        }
        let mut off = 0;
        for dir in 0..2 {
            let n = self.size[dir] as usize;
            buf[off] = self.size[dir];
            buf[off + 1..off + 1 + n].copy_from_slice(&self.data[dir][..n]);
            off += 1 + n;
        }
        Some(off)
    }

    fn get_text(&self) -> String {
        format!(
            "idpsrc=\"{}\",idpdst=\"{}\"",
            hex::encode(self.content(0)),
            hex::encode(self.content(1))
        )
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Stores the first non-empty payload of each direction, once.
pub struct IdpContentPlugin {
    id: PluginId,
}

impl IdpContentPlugin {
    pub fn new(id: PluginId) -> Self {
        IdpContentPlugin { id }
    }

    fn update_record(&self, ext: &mut IdpContentExt, pkt: &Packet) {
        let dir = usize::from(!pkt.source_pkt);
        if !ext.filled[dir] && pkt.payload_len() > 0 {
            let n = pkt.payload_len().min(IDPCONTENT_SIZE);
            ext.data[dir][..n].copy_from_slice(&pkt.payload[..n]);
            ext.size[dir] = n as u8;
            ext.filled[dir] = true;
        }
    }
}

impl ProcessPlugin for IdpContentPlugin {
    fn name(&self) -> &'static str {
        "idpcontent"
    }

    fn id(&self) -> PluginId {
        self.id
    }

    fn ipfix_template(&self) -> &'static [TemplateField] {
        TEMPLATE
    }

    fn post_create(&mut self, flow: &mut Flow, pkt: &Packet) -> FlowAction {
        let mut ext = IdpContentExt::default();
        self.update_record(&mut ext, pkt);
        flow.add_extension(self.id, Box::new(ext));
        FlowAction::Continue
    }

    fn post_update(&mut self, flow: &mut Flow, pkt: &Packet) -> FlowAction {
        let id = self.id;
        if let Some(ext) = flow.ext_mut::<IdpContentExt>(id) {
            let dir = usize::from(!pkt.source_pkt);
            if !ext.filled[dir] && pkt.payload_len() > 0 {
                let n = pkt.payload_len().min(IDPCONTENT_SIZE);
                ext.data[dir][..n].copy_from_slice(&pkt.payload[..n]);
                ext.size[dir] = n as u8;
                ext.filled[dir] = true;
            }
        }
        FlowAction::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::Timeval;

    fn payload_packet(source: bool, payload: &'static [u8]) -> Packet<'static> {
        let mut pkt = Packet::unparsed(payload, payload.len(), Timeval::new(1, 0));
        pkt.ip_version = 4;
        pkt.payload = payload;
        pkt.source_pkt = source;
        pkt
    }

    #[test]
    fn core_idpcontent_first_payload_per_direction() {
        let mut plugin = IdpContentPlugin::new(0);
        let first = payload_packet(true, b"hello");
        let mut flow = Flow::new(&first, 0);
        plugin.post_create(&mut flow, &first);

        plugin.post_update(&mut flow, &payload_packet(true, b"ignored"));
        plugin.post_update(&mut flow, &payload_packet(false, b"world"));

        let ext = flow.ext::<IdpContentExt>(0).unwrap();
        assert_eq!(ext.content(0), b"hello");
        assert_eq!(ext.content(1), b"world");

        let mut buf = [0u8; 256];
        let n = ext.fill_ipfix(&mut buf).unwrap();
        assert_eq!(n, 2 + 5 + 5);
        assert_eq!(buf[0], 5);
        assert_eq!(&buf[1..6], b"hello");
    }
}
