//! Runtime counters exposed as a filesystem-like tree.
//!
//! Workers register named counters under slash-separated paths
//! (`worker0/parser/ipv4_packets`, `worker0/cache/exported`, ...) and
//! update them with relaxed atomics; the snapshot path is read-only and
//! tolerates stale values. No locks are taken on the hot path.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A single shared counter.
#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    #[inline]
    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Registry of counters, shared between workers and the snapshot reader.
#[derive(Clone, Default)]
pub struct TelemetryTree {
    nodes: Arc<Mutex<BTreeMap<String, Counter>>>,
}

impl TelemetryTree {
    pub fn new() -> Self {
        TelemetryTree::default()
    }

    /// Registers (or returns the existing) counter at `path`.
    /// Registration happens at worker startup, not on the hot path.
    pub fn counter(&self, path: &str) -> Counter {
        let mut nodes = self.nodes.lock().unwrap();
        nodes.entry(path.to_string()).or_default().clone()
    }

    /// Point-in-time copy of the whole tree, sorted by path.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        let nodes = self.nodes.lock().unwrap();
        nodes.iter().map(|(k, v)| (k.clone(), v.get())).collect()
    }

    /// Counters under `prefix` (a directory listing).
    pub fn list(&self, prefix: &str) -> BTreeMap<String, u64> {
        let nodes = self.nodes.lock().unwrap();
        nodes
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.get()))
            .collect()
    }
}

/// Counter set published by one worker.
#[derive(Clone)]
pub struct WorkerTelemetry {
    pub parser_seen: Counter,
    pub parser_unknown: Counter,
    pub parser_ipv4: Counter,
    pub parser_ipv6: Counter,
    pub parser_tcp: Counter,
    pub parser_udp: Counter,
    pub parser_vlan: Counter,
    pub parser_mpls: Counter,
    pub parser_pppoe: Counter,
    pub parser_trill: Counter,
    pub cache_hits: Counter,
    pub cache_new_flows: Counter,
    pub cache_exported: Counter,
    pub cache_evicted: Counter,
    pub cache_active_timeouts: Counter,
    pub cache_inactive_timeouts: Counter,
    pub frag_fragmented: Counter,
    pub frag_fragments: Counter,
    pub frag_unmatched: Counter,
    pub export_records: Counter,
    pub export_dropped: Counter,
}

impl WorkerTelemetry {
    /// Registers the worker's counters under `workerN/...`.
    pub fn register(tree: &TelemetryTree, worker: usize) -> Self {
        let path = |leaf: &str| format!("worker{}/{}", worker, leaf);
        WorkerTelemetry {
            parser_seen: tree.counter(&path("parser/seen_packets")),
            parser_unknown: tree.counter(&path("parser/unknown_packets")),
            parser_ipv4: tree.counter(&path("parser/ipv4_packets")),
            parser_ipv6: tree.counter(&path("parser/ipv6_packets")),
            parser_tcp: tree.counter(&path("parser/tcp_packets")),
            parser_udp: tree.counter(&path("parser/udp_packets")),
            parser_vlan: tree.counter(&path("parser/vlan_packets")),
            parser_mpls: tree.counter(&path("parser/mpls_packets")),
            parser_pppoe: tree.counter(&path("parser/pppoe_packets")),
            parser_trill: tree.counter(&path("parser/trill_packets")),
            cache_hits: tree.counter(&path("cache/hits")),
            cache_new_flows: tree.counter(&path("cache/new_flows")),
            cache_exported: tree.counter(&path("cache/exported")),
            cache_evicted: tree.counter(&path("cache/evicted")),
            cache_active_timeouts: tree.counter(&path("cache/active_timeouts")),
            cache_inactive_timeouts: tree.counter(&path("cache/inactive_timeouts")),
            frag_fragmented: tree.counter(&path("frag/fragmented")),
            frag_fragments: tree.counter(&path("frag/fragments")),
            frag_unmatched: tree.counter(&path("frag/unmatched")),
            export_records: tree.counter(&path("export/records")),
            export_dropped: tree.counter(&path("export/dropped")),
        }
    }

    /// Publishes the latest per-worker stats.
    pub fn publish(
        &self,
        parser: &crate::parser::ParserStats,
        cache: &crate::flowtable::FlowCacheStats,
        frag: &crate::fragcache::FragCacheStats,
    ) {
        self.parser_seen.set(parser.seen_packets);
        self.parser_unknown.set(parser.unknown_packets);
        self.parser_ipv4.set(parser.ipv4_packets);
        self.parser_ipv6.set(parser.ipv6_packets);
        self.parser_tcp.set(parser.tcp_packets);
        self.parser_udp.set(parser.udp_packets);
        self.parser_vlan.set(parser.vlan_packets);
        self.parser_mpls.set(parser.mpls_packets);
        self.parser_pppoe.set(parser.pppoe_packets);
        self.parser_trill.set(parser.trill_packets);
        self.cache_hits.set(cache.hits);
        self.cache_new_flows.set(cache.new_flows);
        self.cache_exported.set(cache.exported);
        self.cache_evicted.set(cache.evicted);
        self.cache_active_timeouts.set(cache.active_timeouts);
        self.cache_inactive_timeouts.set(cache.inactive_timeouts);
        self.frag_fragmented.set(frag.fragmented);
        self.frag_fragments.set(frag.fragments);
        self.frag_unmatched.set(frag.unmatched_fragments);
    }
}
