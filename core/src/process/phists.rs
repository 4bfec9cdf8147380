//! Packet size and inter-arrival time histograms.
//!
//! Two 8-bin logarithmic histograms per direction: payload sizes in bytes
//! and inter-arrival times in nanoseconds. Bin 0 absorbs values below 16;
//! bin `k` (1..7) covers `[2^(k+3), 2^(k+4))`; bin 7 absorbs the tail.
//! Increments saturate at `u32::MAX`.

use crate::export::basiclist::IpfixBasicList;
use crate::export::template::{field, TemplateField, CESNET_PEN, VAR_LEN};
use crate::flowtable::flow::Flow;
use crate::parser::packet::Packet;
use crate::process::{FlowAction, FlowExt, PluginId, ProcessPlugin};
use crate::protocols::packet::tcp::SYN;
use crate::utils::options::PluginSpec;

use std::any::Any;

/// Bins per histogram.
pub const HISTOGRAM_SIZE: usize = 8;

const ID_SIZES: u16 = 1060; // S_PHISTS_SIZES / D_PHISTS_SIZES
const ID_SIZES_REV: u16 = 1061;
const ID_IPT: u16 = 1062; // S_PHISTS_IPT / D_PHISTS_IPT
const ID_IPT_REV: u16 = 1063;

const TEMPLATE: &[TemplateField] = &[
    field(CESNET_PEN, ID_SIZES, VAR_LEN),
    field(CESNET_PEN, ID_SIZES_REV, VAR_LEN),
    field(CESNET_PEN, ID_IPT, VAR_LEN),
    field(CESNET_PEN, ID_IPT_REV, VAR_LEN),
];

/// Histogram bin for `value`: `clamp(floor(log2 v) - 3, 0, 7)`, with
/// values below 16 landing in bin 0.
#[inline]
pub fn hist_bin(value: u32) -> usize {
    if value < 16 {
        return 0;
    }
    let log2 = 31 - value.leading_zeros() as usize;
    (log2 - 3).min(HISTOGRAM_SIZE - 1)
}

#[derive(Debug, Default)]
pub struct PhistsExt {
    /// Packet size histograms; index 0 canonical, 1 reverse.
    pub size_hist: [[u32; HISTOGRAM_SIZE]; 2],
    /// Inter-arrival time histograms (nanoseconds).
    pub ipt_hist: [[u32; HISTOGRAM_SIZE]; 2],
    last_ts_ns: [Option<i64>; 2],
}

#[inline]
fn saturating_bump(counter: &mut u32) {
    *counter = counter.saturating_add(1);
}

impl FlowExt for PhistsExt {
    fn fill_ipfix(&self, buf: &mut [u8]) -> Option<usize> {
        let list = IpfixBasicList::default();
        let need = IpfixBasicList::list_size(HISTOGRAM_SIZE, 4) * 4;
        if buf.len() < need {
            return None;
        }
        let mut off = list.fill_u32(buf, &self.size_hist[0], ID_SIZES)?;
        off += list.fill_u32(&mut buf[off..], &self.size_hist[1], ID_SIZES_REV)?;
        off += list.fill_u32(&mut buf[off..], &self.ipt_hist[0], ID_IPT)?;
        off += list.fill_u32(&mut buf[off..], &self.ipt_hist[1], ID_IPT_REV)?;
        Some(off)
    }

    fn get_text(&self) -> String {
        let fmt = |h: &[u32; HISTOGRAM_SIZE]| {
            h.iter().map(|v| v.to_string()).collect::<Vec<_>>().join("|")
        };
        format!(
            "sphistssizes={},dphistssizes={},sphistsipt={},dphistsipt={}",
            fmt(&self.size_hist[0]),
            fmt(&self.size_hist[1]),
            fmt(&self.ipt_hist[0]),
            fmt(&self.ipt_hist[1])
        )
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Builds the per-direction histograms.
///
/// Option `includezeroes` counts zero-payload packets as well.
pub struct PhistsPlugin {
    id: PluginId,
    include_zeroes: bool,
}

impl PhistsPlugin {
    pub fn new(id: PluginId, spec: &PluginSpec) -> Self {
        PhistsPlugin {
            id,
            include_zeroes: spec.flag("includezeroes"),
        }
    }

    fn update_record(&self, ext: &mut PhistsExt, pkt: &Packet) {
        if pkt.payload_len_wire == 0 && !self.include_zeroes {
            return;
        }
        let dir = usize::from(!pkt.source_pkt);
        saturating_bump(&mut ext.size_hist[dir][hist_bin(pkt.payload_len_wire as u32)]);

        let now_ns = pkt.ts.as_nanos();
        match ext.last_ts_ns[dir] {
            None => ext.last_ts_ns[dir] = Some(now_ns),
            Some(last) => {
                let diff = (now_ns - last).max(0);
                ext.last_ts_ns[dir] = Some(now_ns);
                saturating_bump(&mut ext.ipt_hist[dir][hist_bin(diff.min(u32::MAX as i64) as u32)]);
            }
        }
    }
}

impl ProcessPlugin for PhistsPlugin {
    fn name(&self) -> &'static str {
        "phists"
    }

    fn id(&self) -> PluginId {
        self.id
    }

    fn ipfix_template(&self) -> &'static [TemplateField] {
        TEMPLATE
    }

    fn post_create(&mut self, flow: &mut Flow, pkt: &Packet) -> FlowAction {
        let mut ext = PhistsExt::default();
        self.update_record(&mut ext, pkt);
        flow.add_extension(self.id, Box::new(ext));
        FlowAction::Continue
    }

    fn post_update(&mut self, flow: &mut Flow, pkt: &Packet) -> FlowAction {
        if let Some(ext) = flow.ext_mut::<PhistsExt>(self.id) {
            self.update_record(ext, pkt);
        }
        FlowAction::Continue
    }

    fn pre_export(&mut self, flow: &mut Flow) {
        // single-packet SYN flows are usually port scans
        let flags = flow.src_tcp_flags | flow.dst_tcp_flags;
        if flow.packets() <= 1 && (flags & SYN) != 0 {
            flow.remove_extension(self.id);
        }
    }
}
