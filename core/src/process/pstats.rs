//! Per-packet sequence statistics (sizes, flags, timestamps, directions).

use crate::export::basiclist::IpfixBasicList;
use crate::export::template::{field, TemplateField, CESNET_PEN, VAR_LEN};
use crate::flowtable::flow::Flow;
use crate::parser::packet::Packet;
use crate::process::{FlowAction, FlowExt, PluginId, ProcessPlugin};
use crate::protocols::packet::tcp::{SYN, TCP_PROTOCOL};
use crate::utils::options::PluginSpec;
use crate::utils::Timeval;

use std::any::Any;

/// Packets recorded per flow.
pub const PSTATS_MAXELEMCOUNT: usize = 30;

/// Flows at or below this packet count with SYN set are dropped at export
/// (usually port scans).
const PSTATS_MINLEN: u32 = 1;

// Cesnet-assigned element IDs for the four basic lists.
const ID_PKT_SIZES: u16 = 1013;
const ID_PKT_TIMESTAMPS: u16 = 1014;
const ID_PKT_FLAGS: u16 = 1015;
const ID_PKT_DIRECTIONS: u16 = 1016;

const TEMPLATE: &[TemplateField] = &[
    field(CESNET_PEN, ID_PKT_SIZES, VAR_LEN),
    field(CESNET_PEN, ID_PKT_TIMESTAMPS, VAR_LEN),
    field(CESNET_PEN, ID_PKT_FLAGS, VAR_LEN),
    field(CESNET_PEN, ID_PKT_DIRECTIONS, VAR_LEN),
];

/// Per-flow packet sequence record.
#[derive(Debug)]
pub struct PstatsExt {
    pub pkt_sizes: [u16; PSTATS_MAXELEMCOUNT],
    pub pkt_tcp_flags: [u8; PSTATS_MAXELEMCOUNT],
    pub pkt_timestamps: [Timeval; PSTATS_MAXELEMCOUNT],
    /// `1` = canonical direction, `-1` = reverse.
    pub pkt_dirs: [i8; PSTATS_MAXELEMCOUNT],
    pub pkt_count: usize,
    // duplicate detection state, per direction
    tcp_seq: [u32; 2],
    tcp_ack: [u32; 2],
    tcp_len: [u16; 2],
    tcp_flg: [u8; 2],
}

impl Default for PstatsExt {
    fn default() -> Self {
        PstatsExt {
            pkt_sizes: [0; PSTATS_MAXELEMCOUNT],
            pkt_tcp_flags: [0; PSTATS_MAXELEMCOUNT],
            pkt_timestamps: [Timeval::default(); PSTATS_MAXELEMCOUNT],
            pkt_dirs: [0; PSTATS_MAXELEMCOUNT],
            pkt_count: 0,
            tcp_seq: [0; 2],
            tcp_ack: [0; 2],
            tcp_len: [0; 2],
            tcp_flg: [0; 2],
        }
    }
}

impl FlowExt for PstatsExt {
    fn fill_ipfix(&self, buf: &mut [u8]) -> Option<usize> {
        let list = IpfixBasicList::default();
        let n = self.pkt_count;
        let need = IpfixBasicList::list_size(n, 2)
            + IpfixBasicList::list_size(n, 8)
            + IpfixBasicList::list_size(n, 1) * 2;
        if buf.len() < need {
            return None;
        }
        let mut off = list.fill_u16(buf, &self.pkt_sizes[..n], ID_PKT_SIZES)?;
        off += list.fill_timevals(&mut buf[off..], &self.pkt_timestamps[..n], ID_PKT_TIMESTAMPS)?;
        off += list.fill_u8(&mut buf[off..], &self.pkt_tcp_flags[..n], ID_PKT_FLAGS)?;
        off += list.fill_i8(&mut buf[off..], &self.pkt_dirs[..n], ID_PKT_DIRECTIONS)?;
        Some(off)
    }

    fn get_text(&self) -> String {
        let n = self.pkt_count;
        let join = |it: Vec<String>| it.join("|");
        format!(
            "ppisizes={},ppitimes={},ppiflags={},ppidirs={}",
            join(self.pkt_sizes[..n].iter().map(|v| v.to_string()).collect()),
            join(self.pkt_timestamps[..n].iter().map(|v| v.to_string()).collect()),
            join(self.pkt_tcp_flags[..n].iter().map(|v| v.to_string()).collect()),
            join(self.pkt_dirs[..n].iter().map(|v| v.to_string()).collect()),
        )
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// `true` when `curr` wrapped around relative to `prev`.
#[inline]
fn seq_overflowed(curr: u32, prev: u32) -> bool {
    (curr as i64) - (prev as i64) < -4_252_017_623
}

/// Records the first packets of a flow as parallel arrays.
///
/// Options: `includezeroes` keeps zero-payload packets, `skipdup` drops
/// retransmitted TCP packets.
pub struct PstatsPlugin {
    id: PluginId,
    use_zeroes: bool,
    skip_dup_pkts: bool,
}

impl PstatsPlugin {
    pub fn new(id: PluginId, spec: &PluginSpec) -> Self {
        PstatsPlugin {
            id,
            use_zeroes: spec.flag("includezeroes"),
            skip_dup_pkts: spec.flag("skipdup"),
        }
    }

    fn update_record(&self, ext: &mut PstatsExt, pkt: &Packet) {
        let dir = usize::from(!pkt.source_pkt);
        if self.skip_dup_pkts && pkt.ip_proto == TCP_PROTOCOL {
            let seq_susp = (pkt.tcp_seq <= ext.tcp_seq[dir]
                && !seq_overflowed(pkt.tcp_seq, ext.tcp_seq[dir]))
                || (pkt.tcp_seq > ext.tcp_seq[dir] && seq_overflowed(pkt.tcp_seq, ext.tcp_seq[dir]));
            let ack_susp = (pkt.tcp_ack <= ext.tcp_ack[dir]
                && !seq_overflowed(pkt.tcp_ack, ext.tcp_ack[dir]))
                || (pkt.tcp_ack > ext.tcp_ack[dir] && seq_overflowed(pkt.tcp_ack, ext.tcp_ack[dir]));
            if seq_susp
                && ack_susp
                && pkt.payload_len() as u16 == ext.tcp_len[dir]
                && pkt.tcp_flags == ext.tcp_flg[dir]
                && ext.pkt_count != 0
            {
                return;
            }
        }
        ext.tcp_seq[dir] = pkt.tcp_seq;
        ext.tcp_ack[dir] = pkt.tcp_ack;
        ext.tcp_len[dir] = pkt.payload_len() as u16;
        ext.tcp_flg[dir] = pkt.tcp_flags;

        if pkt.payload_len_wire == 0 && !self.use_zeroes {
            return;
        }

        if ext.pkt_count < PSTATS_MAXELEMCOUNT {
            let i = ext.pkt_count;
            ext.pkt_sizes[i] = pkt.payload_len_wire as u16;
            ext.pkt_tcp_flags[i] = pkt.tcp_flags;
            ext.pkt_timestamps[i] = pkt.ts;
            ext.pkt_dirs[i] = if pkt.source_pkt { 1 } else { -1 };
            ext.pkt_count += 1;
        }
    }
}

impl ProcessPlugin for PstatsPlugin {
    fn name(&self) -> &'static str {
        "pstats"
    }

    fn id(&self) -> PluginId {
        self.id
    }

    fn ipfix_template(&self) -> &'static [TemplateField] {
        TEMPLATE
    }

    fn post_create(&mut self, flow: &mut Flow, pkt: &Packet) -> FlowAction {
        let mut ext = PstatsExt::default();
        self.update_record(&mut ext, pkt);
        flow.add_extension(self.id, Box::new(ext));
        FlowAction::Continue
    }

    fn post_update(&mut self, flow: &mut Flow, pkt: &Packet) -> FlowAction {
        if let Some(ext) = flow.ext_mut::<PstatsExt>(self.id) {
            self.update_record(ext, pkt);
        }
        FlowAction::Continue
    }

    fn pre_export(&mut self, flow: &mut Flow) {
        // single-packet SYN flows are usually port scans
        let packets = flow.packets();
        let flags = flow.src_tcp_flags | flow.dst_tcp_flags;
        if packets <= PSTATS_MINLEN && (flags & SYN) != 0 {
            flow.remove_extension(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::basiclist::RECORD_HDR_SIZE;
    use crate::utils::Timeval;

    fn packet(source: bool, payload_wire: usize, flags: u8, ts: Timeval) -> Packet<'static> {
        let mut pkt = Packet::unparsed(&[], 64, ts);
        pkt.ip_version = 4;
        pkt.ip_proto = TCP_PROTOCOL;
        pkt.ip_len = 64;
        pkt.tcp_flags = flags;
        pkt.payload_len_wire = payload_wire;
        pkt.source_pkt = source;
        pkt
    }

    fn spec(s: &str) -> PluginSpec {
        PluginSpec::parse(s).unwrap()
    }

    #[test]
    fn core_pstats_records_directions_and_caps() {
        let mut plugin = PstatsPlugin::new(0, &spec("pstats"));
        let first = packet(true, 100, 0x18, Timeval::new(1, 0));
        let mut flow = Flow::new(&first, 0);
        plugin.post_create(&mut flow, &first);

        for i in 0..40 {
            let pkt = packet(i % 2 == 0, 100 + i, 0x10, Timeval::new(2 + i as i64, 0));
            flow.update(&pkt, pkt.source_pkt);
            plugin.post_update(&mut flow, &pkt);
        }

        let ext = flow.ext::<PstatsExt>(0).unwrap();
        assert_eq!(ext.pkt_count, PSTATS_MAXELEMCOUNT);
        assert_eq!(ext.pkt_dirs[0], 1);
        assert_eq!(ext.pkt_dirs[2], -1);
        assert_eq!(ext.pkt_sizes[0], 100);
    }

    #[test]
    fn core_pstats_skips_zero_payload_by_default() {
        let mut plugin = PstatsPlugin::new(0, &spec("pstats"));
        let first = packet(true, 0, SYN, Timeval::new(1, 0));
        let mut flow = Flow::new(&first, 0);
        plugin.post_create(&mut flow, &first);
        assert_eq!(flow.ext::<PstatsExt>(0).unwrap().pkt_count, 0);

        let mut plugin = PstatsPlugin::new(0, &spec("pstats:includezeroes"));
        let mut flow = Flow::new(&first, 0);
        plugin.post_create(&mut flow, &first);
        assert_eq!(flow.ext::<PstatsExt>(0).unwrap().pkt_count, 1);
    }

    #[test]
    fn core_pstats_skipdup_drops_retransmission() {
        let mut plugin = PstatsPlugin::new(0, &spec("pstats:skipdup"));
        let mut first = packet(true, 100, 0x18, Timeval::new(1, 0));
        first.tcp_seq = 1000;
        first.tcp_ack = 500;
        let mut flow = Flow::new(&first, 0);
        plugin.post_create(&mut flow, &first);

        // identical seq/ack/len/flags: retransmission
        let mut dup = packet(true, 100, 0x18, Timeval::new(1, 10));
        dup.tcp_seq = 1000;
        dup.tcp_ack = 500;
        flow.update(&dup, true);
        plugin.post_update(&mut flow, &dup);

        assert_eq!(flow.ext::<PstatsExt>(0).unwrap().pkt_count, 1);
    }

    #[test]
    fn core_pstats_scan_suppression() {
        let mut plugin = PstatsPlugin::new(0, &spec("pstats"));
        let first = packet(true, 0, SYN, Timeval::new(1, 0));
        let mut flow = Flow::new(&first, 0);
        plugin.post_create(&mut flow, &first);
        plugin.pre_export(&mut flow);
        assert!(!flow.has_extension(0));
    }

    #[test]
    fn core_pstats_basiclist_sizes() {
        let mut ext = PstatsExt::default();
        ext.pkt_sizes[0] = 1400;
        ext.pkt_timestamps[0] = Timeval::new(1, 0);
        ext.pkt_dirs[0] = 1;
        ext.pkt_count = 1;

        let mut buf = [0u8; 256];
        let n = ext.fill_ipfix(&mut buf).unwrap();
        assert_eq!(n, (RECORD_HDR_SIZE + 2) + (RECORD_HDR_SIZE + 8) + (RECORD_HDR_SIZE + 1) * 2);
        assert_eq!(buf[0], 0xFF);
    }
}
