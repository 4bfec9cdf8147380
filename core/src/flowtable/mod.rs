//! Flow cache and lifecycle management.
//!
//! One `FlowCache` is maintained per worker. The cache is a fixed-capacity
//! table of `bucket_count` buckets ("lines") of `line_size` slots each.
//! Slot 0 of a line is most recently used; collisions evict the LRU tail.
//! Lookup is symmetric: a packet matches a flow stored in either
//! orientation, and the canonical direction is fixed by the first packet.
//!
//! Around each update the cache drives the process-plugin hook points and
//! interprets their [`FlowAction`] results, including the
//! flush-with-reinsert path where the current packet becomes the first
//! packet of a replacement flow.

pub mod flow;

use self::flow::{Flow, FlowKey};
use crate::process::{FlowAction, PluginRegistry};
use crate::parser::packet::Packet;
use crate::utils::Timeval;

/// Why a flow left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportReason {
    /// `active_timeout` elapsed since `time_first`.
    ActiveTimeout,
    /// `inactive_timeout` elapsed since `time_last`.
    InactiveTimeout,
    /// The flow was the LRU tail of a full bucket when a new flow collided
    /// into it.
    Evicted,
    /// A plugin returned `Flush` or `FlushWithReinsert`.
    Plugin,
    /// Cache shutdown (`flush_all`).
    Forced,
}

/// Receives completed flows from the cache.
///
/// The flow reference is valid only for the duration of the call; the
/// cache destroys the flow (and its extension records) on return.
pub trait FlowExporter {
    fn export(&mut self, flow: &Flow, reason: ExportReason);

    /// Flushes any batched output (end of burst / shutdown).
    fn flush(&mut self) {}
}

/// Optional hardware-offload collaborator. Operations are best-effort; the
/// cache never depends on their success.
pub trait OffloadController {
    fn create_record(&mut self, flow_hash: u64, ts: Timeval);
    fn export_record(&mut self, flow_hash: u64);
}

/// Flow cache sizing and timeout options.
#[derive(Debug, Clone, Copy)]
pub struct FlowCacheConfig {
    /// Total flow capacity; rounded up to a power of two.
    pub cache_size: usize,
    /// Slots per bucket; rounded up to a power of two.
    pub line_size: usize,
    /// Maximum flow lifetime measured from `time_first`.
    pub active_timeout: Timeval,
    /// Maximum idle time measured from `time_last`.
    pub inactive_timeout: Timeval,
}

impl Default for FlowCacheConfig {
    fn default() -> Self {
        FlowCacheConfig {
            cache_size: 1 << 17,
            line_size: 16,
            active_timeout: Timeval::new(300, 0),
            inactive_timeout: Timeval::new(30, 0),
        }
    }
}

/// Per-cache counters, published through telemetry.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlowCacheStats {
    pub hits: u64,
    pub new_flows: u64,
    pub exported: u64,
    pub evicted: u64,
    pub active_timeouts: u64,
    pub inactive_timeouts: u64,
    pub plugin_flushes: u64,
    /// Packets skipped because the parser marked them unknown.
    pub skipped: u64,
}

/// The per-worker flow table.
pub struct FlowCache {
    /// Flat slot array; line `b` occupies `b * line_size ..`.
    flows: Vec<Option<Flow>>,
    line_count: usize,
    line_size: usize,
    /// `64 - log2(line_count)`: a fingerprint's top bits select the line.
    shift: u32,
    active_timeout: Timeval,
    inactive_timeout: Timeval,
    sweep_cursor: usize,
    plugins: PluginRegistry,
    exporter: Box<dyn FlowExporter>,
    offload: Option<Box<dyn OffloadController>>,
    pub stats: FlowCacheStats,
}

impl FlowCache {
    pub fn new(
        config: FlowCacheConfig,
        plugins: PluginRegistry,
        exporter: Box<dyn FlowExporter>,
    ) -> Self {
        assert!(
            plugins.len() <= 64,
            "plugin IDs are tracked in 64-bit masks"
        );
        let line_size = config.line_size.next_power_of_two();
        let line_count = (config.cache_size.max(line_size) / line_size).next_power_of_two();
        FlowCache {
            flows: (0..line_count * line_size).map(|_| None).collect(),
            line_count,
            line_size,
            shift: 64 - line_count.trailing_zeros(),
            active_timeout: config.active_timeout,
            inactive_timeout: config.inactive_timeout,
            sweep_cursor: 0,
            plugins,
            exporter,
            offload: None,
            stats: FlowCacheStats::default(),
        }
    }

    /// Attaches an optional hardware-offload controller.
    pub fn set_offload(&mut self, offload: Box<dyn OffloadController>) {
        self.offload = Some(offload);
    }

    /// Number of resident flows.
    pub fn len(&self) -> usize {
        self.flows.iter().filter(|f| f.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.iter().all(|f| f.is_none())
    }

    /// Capacity in flows.
    pub fn capacity(&self) -> usize {
        self.flows.len()
    }

    #[inline]
    fn line_of(&self, fingerprint: u64) -> usize {
        if self.shift == 64 {
            return 0;
        }
        ((fingerprint >> self.shift) as usize) * self.line_size
    }

    /// Scans the line holding `fingerprint` for a slot whose stored
    /// fingerprint and key both match.
    fn find(&self, fingerprint: u64, key: &FlowKey) -> Option<usize> {
        let start = self.line_of(fingerprint);
        for idx in start..start + self.line_size {
            if let Some(flow) = &self.flows[idx] {
                if flow.flow_hash == fingerprint && flow.key == *key {
                    return Some(idx);
                }
            }
        }
        None
    }

    /// Installs or updates the flow for `pkt`, invoking plugin hooks.
    ///
    /// Sets `pkt.source_pkt` according to the matched direction. May export
    /// one or more flows (eviction, plugin flush).
    pub fn put(&mut self, pkt: &mut Packet) {
        if !pkt.is_parsed() {
            self.stats.skipped += 1;
            return;
        }

        let key = FlowKey::from_packet(pkt);
        let fp_fwd = key.fingerprint();

        if let Some(idx) = self.find(fp_fwd, &key) {
            pkt.source_pkt = true;
            self.stats.hits += 1;
            let head = self.promote(idx);
            self.update_flow(head, pkt);
            return;
        }

        let rev = key.reversed();
        let fp_rev = rev.fingerprint();
        if let Some(idx) = self.find(fp_rev, &rev) {
            pkt.source_pkt = false;
            self.stats.hits += 1;
            let head = self.promote(idx);
            self.update_flow(head, pkt);
            return;
        }

        // no match: the new flow takes slot 0 of the forward line
        pkt.source_pkt = true;
        let head = self.make_room(fp_fwd);
        self.create_flow(head, pkt, fp_fwd);
    }

    /// Moves the slot at `idx` to the head of its line, shifting newer
    /// slots down by one. Returns the head index.
    fn promote(&mut self, idx: usize) -> usize {
        let start = idx - idx % self.line_size;
        self.flows[start..=idx].rotate_right(1);
        start
    }

    /// Frees slot 0 of the line selected by `fingerprint`, exporting the
    /// LRU tail if the line is full. Returns the head index.
    fn make_room(&mut self, fingerprint: u64) -> usize {
        let start = self.line_of(fingerprint);
        let end = start + self.line_size;
        let free = (start..end).find(|&i| self.flows[i].is_none());
        let last = match free {
            Some(i) => i,
            None => {
                self.stats.evicted += 1;
                self.export_slot(end - 1, ExportReason::Evicted);
                end - 1
            }
        };
        self.flows[start..=last].rotate_right(1);
        start
    }

    /// Initializes a flow from its first packet at `idx` and runs the
    /// `post_create` sweep.
    fn create_flow(&mut self, idx: usize, pkt: &mut Packet, fingerprint: u64) {
        self.stats.new_flows += 1;
        self.flows[idx] = Some(Flow::new(pkt, fingerprint));
        if let Some(offload) = self.offload.as_mut() {
            offload.create_record(fingerprint, pkt.ts);
        }

        let flow = self.flows[idx].as_mut().expect("slot just filled");
        let mut flush = false;
        for plugin in self.plugins.iter_mut() {
            if flow.is_no_data(plugin.id()) {
                continue;
            }
            match plugin.post_create(flow, pkt) {
                FlowAction::Continue => {}
                FlowAction::NoData => flow.set_no_data(plugin.id()),
                // a reinsert of the very packet that created the flow
                // degenerates to a plain flush
                FlowAction::Flush | FlowAction::FlushWithReinsert => {
                    flush = true;
                    break;
                }
            }
        }
        if flush {
            self.stats.plugin_flushes += 1;
            self.export_slot(idx, ExportReason::Plugin);
        }
    }

    /// Runs the update sequence on the flow at `idx`: `pre_update` sweep,
    /// accumulators, `post_update` sweep.
    fn update_flow(&mut self, idx: usize, pkt: &mut Packet) {
        let flow = self.flows[idx].as_mut().expect("occupied slot");
        let mut action = FlowAction::Continue;
        for plugin in self.plugins.iter_mut() {
            if flow.is_no_data(plugin.id()) {
                continue;
            }
            match plugin.pre_update(flow, pkt) {
                FlowAction::Continue => {}
                FlowAction::NoData => flow.set_no_data(plugin.id()),
                other => {
                    action = other;
                    break;
                }
            }
        }
        match action {
            // exported without the current packet's contribution
            FlowAction::Flush => {
                self.stats.plugin_flushes += 1;
                self.export_slot(idx, ExportReason::Plugin);
                return;
            }
            // the current packet becomes the first packet of a new flow
            FlowAction::FlushWithReinsert => {
                self.stats.plugin_flushes += 1;
                self.export_slot(idx, ExportReason::Plugin);
                let fingerprint = FlowKey::from_packet(pkt).fingerprint();
                pkt.source_pkt = true;
                self.create_flow(idx, pkt, fingerprint);
                return;
            }
            _ => {}
        }

        let flow = self.flows[idx].as_mut().expect("occupied slot");
        flow.update(pkt, pkt.source_pkt);

        let mut action = FlowAction::Continue;
        for plugin in self.plugins.iter_mut() {
            if flow.is_no_data(plugin.id()) {
                continue;
            }
            match plugin.post_update(flow, pkt) {
                FlowAction::Continue => {}
                FlowAction::NoData => flow.set_no_data(plugin.id()),
                other => {
                    action = other;
                    break;
                }
            }
        }
        match action {
            // the packet counts toward the flushed flow
            FlowAction::Flush => {
                self.stats.plugin_flushes += 1;
                self.export_slot(idx, ExportReason::Plugin);
            }
            FlowAction::FlushWithReinsert => {
                self.stats.plugin_flushes += 1;
                self.export_slot(idx, ExportReason::Plugin);
                let fingerprint = FlowKey::from_packet(pkt).fingerprint();
                pkt.source_pkt = true;
                self.create_flow(idx, pkt, fingerprint);
            }
            _ => {}
        }
    }

    /// Runs `pre_export` hooks, hands the flow to the exporter, and clears
    /// the slot. The extension chain is destroyed with the flow.
    fn export_slot(&mut self, idx: usize, reason: ExportReason) {
        {
            let flow = self.flows[idx].as_mut().expect("occupied slot");
            for plugin in self.plugins.iter_mut() {
                plugin.pre_export(flow);
            }
        }
        let flow = self.flows[idx].take().expect("occupied slot");
        if let Some(offload) = self.offload.as_mut() {
            offload.export_record(flow.flow_hash);
        }
        self.exporter.export(&flow, reason);
        self.stats.exported += 1;
    }

    /// Scans one bucket (advancing a round-robin cursor) and exports flows
    /// whose active or inactive timeout elapsed at `now`. Within the
    /// bucket, oldest `time_last` first. Returns the number exported.
    pub fn export_expired(&mut self, now: Timeval) -> usize {
        let start = self.sweep_cursor * self.line_size;
        self.sweep_cursor = (self.sweep_cursor + 1) % self.line_count;

        let mut expired: Vec<(Timeval, usize, ExportReason)> = Vec::new();
        for idx in start..start + self.line_size {
            if let Some(flow) = &self.flows[idx] {
                if now - flow.time_last > self.inactive_timeout {
                    expired.push((flow.time_last, idx, ExportReason::InactiveTimeout));
                } else if now - flow.time_first > self.active_timeout {
                    expired.push((flow.time_last, idx, ExportReason::ActiveTimeout));
                }
            }
        }
        expired.sort_by_key(|(time_last, _, _)| *time_last);

        let count = expired.len();
        for (_, idx, reason) in expired {
            match reason {
                ExportReason::ActiveTimeout => self.stats.active_timeouts += 1,
                ExportReason::InactiveTimeout => self.stats.inactive_timeouts += 1,
                _ => {}
            }
            self.export_slot(idx, reason);
        }
        count
    }

    /// Runs `export_expired` once per bucket so the whole table is swept.
    pub fn sweep_all(&mut self, now: Timeval) -> usize {
        (0..self.line_count).map(|_| self.export_expired(now)).sum()
    }

    /// Exports every resident flow (shutdown) and flushes the exporter.
    pub fn flush_all(&mut self) {
        for idx in 0..self.flows.len() {
            if self.flows[idx].is_some() {
                self.export_slot(idx, ExportReason::Forced);
            }
        }
        self.exporter.flush();
    }

    /// Flushes the exporter's batched output.
    pub fn flush_output(&mut self) {
        self.exporter.flush();
    }

    /// The worker-owned plugin set.
    pub fn plugins_mut(&mut self) -> &mut PluginRegistry {
        &mut self.plugins
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }
}
