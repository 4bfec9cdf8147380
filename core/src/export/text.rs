//! Line-oriented text output.
//!
//! Renders each completed flow as one `key=value,...` line: the base flow
//! fields followed by each resident extension's `get_text()` in plugin
//! registration order. Intended for debugging and tests; the wire output
//! is [IPFIX](crate::export::ipfix).

use crate::flowtable::flow::Flow;
use crate::flowtable::{ExportReason, FlowExporter};
use crate::process::{PluginId, PluginRegistry};

use std::io::Write;

/// Writes flows as text lines to an arbitrary writer.
pub struct TextExporter<W: Write> {
    writer: W,
    plugin_ids: Vec<PluginId>,
    pub records: u64,
}

impl<W: Write> TextExporter<W> {
    pub fn new(writer: W, registry: &PluginRegistry) -> Self {
        TextExporter {
            writer,
            plugin_ids: registry.iter().map(|p| p.id()).collect(),
            records: 0,
        }
    }

    fn reason_str(reason: ExportReason) -> &'static str {
        match reason {
            ExportReason::ActiveTimeout => "active",
            ExportReason::InactiveTimeout => "inactive",
            ExportReason::Evicted => "evicted",
            ExportReason::Plugin => "plugin",
            ExportReason::Forced => "forced",
        }
    }

    fn format_flow(flow: &Flow, reason: ExportReason, plugin_ids: &[PluginId]) -> String {
        let mut line = format!(
            "first={},last={},proto={},src={},sport={},dst={},dport={},\
             spkts={},dpkts={},sbytes={},dbytes={},stcpflg={:#04x},dtcpflg={:#04x},\
             srcmac={},dstmac={},vlan={},flowhash={:#018x},end={}",
            flow.time_first,
            flow.time_last,
            flow.key.proto,
            flow.key.src_ip,
            flow.key.src_port,
            flow.key.dst_ip,
            flow.key.dst_port,
            flow.src_packets,
            flow.dst_packets,
            flow.src_bytes,
            flow.dst_bytes,
            flow.src_tcp_flags,
            flow.dst_tcp_flags,
            flow.src_mac,
            flow.dst_mac,
            flow.key.vlan_id,
            flow.flow_hash,
            Self::reason_str(reason),
        );
        for id in plugin_ids {
            if let Some(ext) = flow.get_extension(*id) {
                line.push(',');
                line.push_str(&ext.get_text());
            }
        }
        line
    }
}

impl<W: Write + Send> FlowExporter for TextExporter<W> {
    fn export(&mut self, flow: &Flow, reason: ExportReason) {
        let line = Self::format_flow(flow, reason, &self.plugin_ids);
        if let Err(e) = writeln!(self.writer, "{}", line) {
            log::warn!("text output write failed: {}", e);
            return;
        }
        self.records += 1;
    }

    fn flush(&mut self) {
        let _ = self.writer.flush();
    }
}
