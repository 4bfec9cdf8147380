//! SYN/SYN-ACK/ACK sequence detector for encapsulated tunnels.
//!
//! Watches small packets (60..=150 bytes of L3 payload) for the length and
//! timing signature of TCP handshakes carried inside an encrypted tunnel:
//! a packet slightly larger than a recent opposite-direction packet that
//! itself matched a recent "SYN-sized" packet. Repeated matches mark the
//! flow as a possible tunnel.

use crate::export::template::{field, TemplateField, CESNET_PEN};
use crate::flowtable::flow::Flow;
use crate::parser::packet::Packet;
use crate::process::{FlowAction, FlowExt, PluginId, ProcessPlugin};
use crate::utils::Timeval;

use std::any::Any;

/// Smallest tracked L3 payload.
const MIN_PKT_SIZE: usize = 60;
/// Largest tracked L3 payload.
const MAX_PKT_SIZE: usize = 150;
/// One slot per tracked length.
const PKT_TABLE_SIZE: usize = MAX_PKT_SIZE - MIN_PKT_SIZE + 1;
/// Entries older than this no longer match (microseconds).
const MAX_TIME_WINDOW_US: i64 = 3_000_000;

/// Length tolerance when matching a SYN-ACK against a recorded SYN.
const SYN_LOOKUP_WINDOW: usize = 10;
/// Length tolerance when matching an ACK against a recorded SYN-ACK.
const SYN_ACK_LOOKUP_WINDOW: usize = 12;

/// Suspect lengths kept for the unique-ratio check.
const SYN_RECORDS_NUM: usize = 100;

const MIN_PKT_IN_FLOW: u32 = 30;
const MIN_NUM_SUSPECTS: u64 = 3;
const MIN_SUSPECTS_RATIO: f64 = 2500.0;

const LOW_NUM_SUSPECTS_THRESHOLD: u64 = 15;
const MID_NUM_SUSPECTS_THRESHOLD: u64 = 40;
const LOW_NUM_SUSPECTS_MAX_RATIO: f64 = 0.6;
const MID_NUM_SUSPECTS_MAX_RATIO: f64 = 0.4;
const HIGH_NUM_SUSPECTS_MAX_RATIO: f64 = 0.2;

const TEMPLATE: &[TemplateField] = &[
    field(CESNET_PEN, 1095, 1), // SSA_CONF_LEVEL
];

/// Per-length, per-direction last-seen timestamps.
#[derive(Debug, Clone, Copy)]
struct PktTable {
    entries: [[Option<Timeval>; 2]; PKT_TABLE_SIZE],
}

impl Default for PktTable {
    fn default() -> Self {
        PktTable {
            entries: [[None; 2]; PKT_TABLE_SIZE],
        }
    }
}

impl PktTable {
    fn clear(&mut self) {
        self.entries = [[None; 2]; PKT_TABLE_SIZE];
    }

    #[inline]
    fn index_of(len: usize) -> Option<usize> {
        if (MIN_PKT_SIZE..=MAX_PKT_SIZE).contains(&len) {
            Some(len - MIN_PKT_SIZE)
        } else {
            None
        }
    }

    fn update_entry(&mut self, len: usize, dir: usize, ts: Timeval) {
        if let Some(idx) = Self::index_of(len) {
            self.entries[idx][dir] = Some(ts);
        }
    }

    /// Looks for an entry within `down_by` length slots below `len`, in
    /// direction `dir`, recent relative to `ts`.
    fn has_similar_recent(&self, len: usize, down_by: usize, dir: usize, ts: Timeval) -> bool {
        let idx = match Self::index_of(len) {
            Some(idx) => idx,
            None => return false,
        };
        for i in 0..=down_by.min(idx) {
            if let Some(seen) = self.entries[idx - i][dir] {
                if (ts - seen).as_micros() <= MAX_TIME_WINDOW_US {
                    return true;
                }
            }
        }
        false
    }
}

#[derive(Debug, Default)]
pub struct SsaDetectorExt {
    /// Confidence 0..=100, filled at export.
    pub possible_tunnel: u8,
    suspects: u64,
    suspect_lengths: Vec<u16>,
    syn_table: PktTable,
    syn_ack_table: PktTable,
}

impl FlowExt for SsaDetectorExt {
    fn fill_ipfix(&self, buf: &mut [u8]) -> Option<usize> {
        if buf.is_empty() {
            return None;
        }
        buf[0] = self.possible_tunnel;
        Some(1)
    }

    fn get_text(&self) -> String {
        format!("ssaconf={}", self.possible_tunnel)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub struct SsaDetectorPlugin {
    id: PluginId,
}

impl SsaDetectorPlugin {
    pub fn new(id: PluginId) -> Self {
        SsaDetectorPlugin { id }
    }

    fn update_record(ext: &mut SsaDetectorExt, pkt: &Packet) {
        let len = pkt.ip_payload_len as usize;
        if PktTable::index_of(len).is_none() {
            return;
        }
        let dir = usize::from(!pkt.source_pkt);
        let rev = 1 - dir;

        // an ACK-sized packet shortly after an opposite-direction SYN-ACK
        // completes a handshake signature
        if ext
            .syn_ack_table
            .has_similar_recent(len, SYN_ACK_LOOKUP_WINDOW, rev, pkt.ts)
        {
            ext.syn_table.clear();
            ext.syn_ack_table.clear();
            ext.suspects += 1;
            if ext.suspect_lengths.len() < SYN_RECORDS_NUM {
                ext.suspect_lengths.push(len as u16);
            }
            return;
        }

        // a SYN-ACK-sized packet needs a recent opposite-direction SYN
        if ext
            .syn_table
            .has_similar_recent(len, SYN_LOOKUP_WINDOW, rev, pkt.ts)
        {
            ext.syn_ack_table.update_entry(len, dir, pkt.ts);
        }

        ext.syn_table.update_entry(len, dir, pkt.ts);
    }
}

impl ProcessPlugin for SsaDetectorPlugin {
    fn name(&self) -> &'static str {
        "ssadetector"
    }

    fn id(&self) -> PluginId {
        self.id
    }

    fn ipfix_template(&self) -> &'static [TemplateField] {
        TEMPLATE
    }

    fn post_create(&mut self, flow: &mut Flow, pkt: &Packet) -> FlowAction {
        let mut ext = SsaDetectorExt::default();
        Self::update_record(&mut ext, pkt);
        flow.add_extension(self.id, Box::new(ext));
        FlowAction::Continue
    }

    fn post_update(&mut self, flow: &mut Flow, pkt: &Packet) -> FlowAction {
        if let Some(ext) = flow.ext_mut::<SsaDetectorExt>(self.id) {
            Self::update_record(ext, pkt);
        }
        FlowAction::Continue
    }

    fn pre_export(&mut self, flow: &mut Flow) {
        let packets = flow.packets();
        let remove = match flow.ext_mut::<SsaDetectorExt>(self.id) {
            None => return,
            Some(ext) => {
                if packets <= MIN_PKT_IN_FLOW
                    || ext.suspects < MIN_NUM_SUSPECTS
                    || packets as f64 / ext.suspects as f64 > MIN_SUSPECTS_RATIO
                {
                    true
                } else {
                    let mut lengths = ext.suspect_lengths.clone();
                    lengths.sort_unstable();
                    lengths.dedup();
                    let unique_ratio = lengths.len() as f64 / ext.suspect_lengths.len() as f64;

                    if (ext.suspects < LOW_NUM_SUSPECTS_THRESHOLD
                        && unique_ratio > LOW_NUM_SUSPECTS_MAX_RATIO)
                        || (ext.suspects < MID_NUM_SUSPECTS_THRESHOLD
                            && unique_ratio > MID_NUM_SUSPECTS_MAX_RATIO)
                        || unique_ratio > HIGH_NUM_SUSPECTS_MAX_RATIO
                    {
                        true
                    } else {
                        ext.possible_tunnel = 100;
                        false
                    }
                }
            }
        };
        if remove {
            flow.remove_extension(self.id);
        }
    }
}
