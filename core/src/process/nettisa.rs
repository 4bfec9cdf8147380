//! NetTiSA streaming time-series statistics.
//!
//! Maintains running moments over on-wire payload sizes and inter-arrival
//! times, finalized at export into mean, deviation, kurtosis, and timing
//! dispersion features.

use crate::export::template::{field, TemplateField, CESNET_PEN};
use crate::flowtable::flow::Flow;
use crate::parser::packet::Packet;
use crate::process::{FlowAction, FlowExt, PluginId, ProcessPlugin};

use std::any::Any;

use byteorder::{BigEndian, ByteOrder};

const TEMPLATE: &[TemplateField] = &[
    field(CESNET_PEN, 1070, 4),  // NTS_MEAN
    field(CESNET_PEN, 1071, 2),  // NTS_MIN
    field(CESNET_PEN, 1072, 2),  // NTS_MAX
    field(CESNET_PEN, 1073, 4),  // NTS_STDEV
    field(CESNET_PEN, 1074, 4),  // NTS_KURTOSIS
    field(CESNET_PEN, 1075, 4),  // NTS_ROOT_MEAN_SQUARE
    field(CESNET_PEN, 1076, 4),  // NTS_AVERAGE_DISPERSION
    field(CESNET_PEN, 1077, 4),  // NTS_MEAN_SCALED_TIME
    field(CESNET_PEN, 1078, 4),  // NTS_MEAN_DIFFTIMES
    field(CESNET_PEN, 1079, 4),  // NTS_MIN_DIFFTIMES
    field(CESNET_PEN, 1080, 4),  // NTS_MAX_DIFFTIMES
    field(CESNET_PEN, 1081, 4),  // NTS_TIME_DISTRIBUTION
    field(CESNET_PEN, 1082, 4),  // NTS_SWITCHING_RATIO
];

const RECORD_SIZE: usize = 4 * 11 + 2 * 2;

#[derive(Debug)]
pub struct NettisaExt {
    pub mean: f32,
    pub min: u16,
    pub max: u16,
    pub stdev: f32,
    pub kurtosis: f32,
    pub root_mean_square: f32,
    pub average_dispersion: f32,
    pub mean_scaled_time: f32,
    pub mean_difftimes: f32,
    pub min_difftimes: f32,
    pub max_difftimes: f32,
    pub time_distribution: f32,
    pub switching_ratio: f32,
    prev_payload: u16,
    prev_time_us: i64,
}

impl Default for NettisaExt {
    fn default() -> Self {
        NettisaExt {
            mean: 0.0,
            min: u16::MAX,
            max: 0,
            stdev: 0.0,
            kurtosis: 0.0,
            root_mean_square: 0.0,
            average_dispersion: 0.0,
            mean_scaled_time: 0.0,
            mean_difftimes: 0.0,
            min_difftimes: f32::MAX,
            max_difftimes: 0.0,
            time_distribution: 0.0,
            switching_ratio: 0.0,
            prev_payload: 0,
            prev_time_us: 0,
        }
    }
}

impl FlowExt for NettisaExt {
    fn fill_ipfix(&self, buf: &mut [u8]) -> Option<usize> {
        if buf.len() < RECORD_SIZE {
            return None;
        }
        let mut off = 0;
        let mut put_f32 = |buf: &mut [u8], off: &mut usize, v: f32| {
            buf[*off..*off + 4].copy_from_slice(&v.to_be_bytes());
            *off += 4;
        };
        put_f32(buf, &mut off, self.mean);
        BigEndian::write_u16(&mut buf[off..off + 2], self.min);
        BigEndian::write_u16(&mut buf[off + 2..off + 4], self.max);
        off += 4;
        put_f32(buf, &mut off, self.stdev);
        put_f32(buf, &mut off, self.kurtosis);
        put_f32(buf, &mut off, self.root_mean_square);
        put_f32(buf, &mut off, self.average_dispersion);
        put_f32(buf, &mut off, self.mean_scaled_time);
        put_f32(buf, &mut off, self.mean_difftimes);
        put_f32(buf, &mut off, self.min_difftimes);
        put_f32(buf, &mut off, self.max_difftimes);
        put_f32(buf, &mut off, self.time_distribution);
        put_f32(buf, &mut off, self.switching_ratio);
        Some(off)
    }

    fn get_text(&self) -> String {
        format!(
            "ntsmean={},ntsmin={},ntsmax={},ntsstdev={},ntskurtosis={},ntsrms={},\
             ntsavgdisp={},ntsmeanscaledtime={},ntsmeandiff={},ntsmindiff={},\
             ntsmaxdiff={},ntstimedist={},ntsswitchratio={}",
            self.mean,
            self.min,
            self.max,
            self.stdev,
            self.kurtosis,
            self.root_mean_square,
            self.average_dispersion,
            self.mean_scaled_time,
            self.mean_difftimes,
            self.min_difftimes,
            self.max_difftimes,
            self.time_distribution,
            self.switching_ratio
        )
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub struct NettisaPlugin {
    id: PluginId,
}

impl NettisaPlugin {
    pub fn new(id: PluginId) -> Self {
        NettisaPlugin { id }
    }

    fn update_record(ext: &mut NettisaExt, pkt: &Packet, n: f32, time_first_us: i64) {
        let size = pkt.payload_len_wire as f32;
        let variation = size - ext.mean;
        let now_us = pkt.ts.as_micros();
        let diff_time = (now_us - ext.prev_time_us) as f32;
        ext.prev_time_us = now_us;

        ext.mean += variation / n;
        ext.min = ext.min.min(pkt.payload_len_wire as u16);
        ext.max = ext.max.max(pkt.payload_len_wire as u16);
        ext.stdev += variation * variation;
        ext.root_mean_square += size * size;
        ext.average_dispersion += variation.abs();
        ext.kurtosis += variation.powi(4);
        ext.mean_scaled_time += ((now_us - time_first_us) as f32 - ext.mean_scaled_time) / n;
        ext.mean_difftimes += (diff_time - ext.mean_difftimes) / n;
        ext.min_difftimes = ext.min_difftimes.min(diff_time);
        ext.max_difftimes = ext.max_difftimes.max(diff_time);
        ext.time_distribution += (ext.mean_difftimes - diff_time).abs();
        if ext.prev_payload != pkt.packet_len_wire as u16 {
            ext.switching_ratio += 1.0;
            ext.prev_payload = pkt.packet_len_wire as u16;
        }
    }
}

impl ProcessPlugin for NettisaPlugin {
    fn name(&self) -> &'static str {
        "nettisa"
    }

    fn id(&self) -> PluginId {
        self.id
    }

    fn ipfix_template(&self) -> &'static [TemplateField] {
        TEMPLATE
    }

    fn post_create(&mut self, flow: &mut Flow, pkt: &Packet) -> FlowAction {
        let mut ext = NettisaExt {
            prev_time_us: pkt.ts.as_micros(),
            ..Default::default()
        };
        Self::update_record(&mut ext, pkt, flow.packets() as f32, flow.time_first.as_micros());
        flow.add_extension(self.id, Box::new(ext));
        FlowAction::Continue
    }

    fn post_update(&mut self, flow: &mut Flow, pkt: &Packet) -> FlowAction {
        let n = flow.packets() as f32;
        let time_first_us = flow.time_first.as_micros();
        if let Some(ext) = flow.ext_mut::<NettisaExt>(self.id) {
            Self::update_record(ext, pkt, n, time_first_us);
        }
        FlowAction::Continue
    }

    fn pre_export(&mut self, flow: &mut Flow) {
        let n = flow.packets() as f32;
        if let Some(ext) = flow.ext_mut::<NettisaExt>(self.id) {
            if n < 2.0 {
                return;
            }
            ext.switching_ratio /= (n - 1.0) / 2.0;
            ext.stdev = (ext.stdev / n).sqrt();
            ext.root_mean_square = (ext.root_mean_square / n).sqrt();
            ext.average_dispersion /= n;
            let stdev4 = ext.stdev.powi(4);
            ext.kurtosis = if stdev4 > 0.0 {
                ext.kurtosis / (n * stdev4)
            } else {
                0.0
            };
            let spread = ext.max_difftimes - ext.min_difftimes;
            ext.time_distribution = if spread > 0.0 {
                (ext.time_distribution / (n - 1.0)) / spread
            } else {
                0.0
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::Timeval;

    fn packet(wire: usize, ts: Timeval) -> Packet<'static> {
        let mut pkt = Packet::unparsed(&[], wire, ts);
        pkt.ip_version = 4;
        pkt.ip_len = wire as u16;
        pkt.payload_len_wire = wire;
        pkt.packet_len_wire = wire + 14;
        pkt.source_pkt = true;
        pkt
    }

    #[test]
    fn core_nettisa_mean_min_max() {
        let mut plugin = NettisaPlugin::new(0);
        let p1 = packet(100, Timeval::new(1, 0));
        let mut flow = Flow::new(&p1, 0);
        plugin.post_create(&mut flow, &p1);

        let p2 = packet(300, Timeval::new(1, 500_000));
        flow.update(&p2, true);
        plugin.post_update(&mut flow, &p2);

        let ext = flow.ext::<NettisaExt>(0).unwrap();
        assert_eq!(ext.min, 100);
        assert_eq!(ext.max, 300);
        assert!((ext.mean - 200.0).abs() < 1e-3);
        assert!((ext.mean_difftimes - 250_000.0).abs() < 1.0);
    }

    #[test]
    fn core_nettisa_export_finalizes_without_nan() {
        let mut plugin = NettisaPlugin::new(0);
        let p1 = packet(100, Timeval::new(1, 0));
        let mut flow = Flow::new(&p1, 0);
        plugin.post_create(&mut flow, &p1);
        for i in 1..5 {
            let p = packet(100 + i * 50, Timeval::new(1, (i as i64) * 1000));
            flow.update(&p, true);
            plugin.post_update(&mut flow, &p);
        }
        plugin.pre_export(&mut flow);
        let ext = flow.ext::<NettisaExt>(0).unwrap();
        assert!(ext.stdev.is_finite());
        assert!(ext.kurtosis.is_finite());
        assert!(ext.time_distribution.is_finite());
        assert!(ext.switching_ratio.is_finite());
    }
}
