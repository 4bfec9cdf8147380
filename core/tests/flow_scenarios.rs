//! End-to-end flow scenarios driven through the parser, fragment cache,
//! and flow cache.

use flowmeter_core::export::template::TemplateField;
use flowmeter_core::flowtable::flow::Flow;
use flowmeter_core::flowtable::{ExportReason, FlowCache, FlowCacheConfig, FlowExporter};
use flowmeter_core::fragcache::FragmentCache;
use flowmeter_core::memory::packet_block::Datalink;
use flowmeter_core::parser::PacketParser;
use flowmeter_core::process::{FlowAction, PluginRegistry, ProcessPlugin};
use flowmeter_core::utils::options::PluginSpec;
use flowmeter_core::utils::Timeval;
use flowmeter_core::Packet;

use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use byteorder::{BigEndian, ByteOrder};

/// What the test exporter remembers about an exported flow.
#[derive(Debug, Clone)]
struct ExportedFlow {
    reason: ExportReason,
    src_ip: IpAddr,
    src_port: u16,
    dst_port: u16,
    src_packets: u32,
    dst_packets: u32,
    src_bytes: u64,
    dst_bytes: u64,
    src_tcp_flags: u8,
    dst_tcp_flags: u8,
    src_mac: [u8; 6],
    texts: Vec<String>,
}

#[derive(Default, Clone)]
struct CollectExporter {
    flows: Arc<Mutex<Vec<ExportedFlow>>>,
}

impl CollectExporter {
    fn take(&self) -> Vec<ExportedFlow> {
        self.flows.lock().unwrap().clone()
    }
}

impl FlowExporter for CollectExporter {
    fn export(&mut self, flow: &Flow, reason: ExportReason) {
        let texts = (0..64)
            .filter_map(|id| flow.get_extension(id).map(|e| e.get_text()))
            .collect();
        self.flows.lock().unwrap().push(ExportedFlow {
            reason,
            src_ip: flow.key.src_ip,
            src_port: flow.key.src_port,
            dst_port: flow.key.dst_port,
            src_packets: flow.src_packets,
            dst_packets: flow.dst_packets,
            src_bytes: flow.src_bytes,
            dst_bytes: flow.dst_bytes,
            src_tcp_flags: flow.src_tcp_flags,
            dst_tcp_flags: flow.dst_tcp_flags,
            src_mac: flow.src_mac.octets(),
            texts,
        });
    }
}

fn cache_with(
    config: FlowCacheConfig,
    registry: PluginRegistry,
) -> (FlowCache, CollectExporter) {
    let exporter = CollectExporter::default();
    let cache = FlowCache::new(config, registry, Box::new(exporter.clone()));
    (cache, exporter)
}

fn empty_registry() -> PluginRegistry {
    PluginRegistry::from_specs(&[]).unwrap()
}

/* ---------------------------------- frame builders ---------------------------------- */

const MAC_A: [u8; 6] = [0x02, 0, 0, 0, 0, 0xAA];
const MAC_B: [u8; 6] = [0x02, 0, 0, 0, 0, 0xBB];

struct TcpFrameSpec {
    src: [u8; 4],
    dst: [u8; 4],
    src_port: u16,
    dst_port: u16,
    flags: u8,
    ip_total_len: u16,
    src_mac: [u8; 6],
    dst_mac: [u8; 6],
}

/// Builds an Ethernet/IPv4/TCP frame whose IP total length is
/// `ip_total_len`; payload bytes are zero-filled.
fn tcp_frame(spec: &TcpFrameSpec) -> Vec<u8> {
    let mut f = Vec::new();
    f.extend_from_slice(&spec.dst_mac);
    f.extend_from_slice(&spec.src_mac);
    f.extend_from_slice(&0x0800u16.to_be_bytes());

    let mut ip = vec![0u8; 20];
    ip[0] = 0x45;
    BigEndian::write_u16(&mut ip[2..4], spec.ip_total_len);
    ip[8] = 64;
    ip[9] = 6;
    ip[12..16].copy_from_slice(&spec.src);
    ip[16..20].copy_from_slice(&spec.dst);
    f.extend_from_slice(&ip);

    let mut tcp = vec![0u8; 20];
    BigEndian::write_u16(&mut tcp[0..2], spec.src_port);
    BigEndian::write_u16(&mut tcp[2..4], spec.dst_port);
    tcp[12] = 0x50;
    tcp[13] = spec.flags;
    f.extend_from_slice(&tcp);

    f.resize(14 + spec.ip_total_len as usize, 0);
    f
}

/// Builds an Ethernet/IPv4/UDP frame; `frag` = (id, offset, mf).
fn udp_frame(
    src: [u8; 4],
    dst: [u8; 4],
    ports: Option<(u16, u16)>,
    l3_payload: &[u8],
    frag: Option<(u16, u16, bool)>,
) -> Vec<u8> {
    let mut f = Vec::new();
    f.extend_from_slice(&MAC_B);
    f.extend_from_slice(&MAC_A);
    f.extend_from_slice(&0x0800u16.to_be_bytes());

    let udp_len = if ports.is_some() { 8 } else { 0 };
    let total = 20 + udp_len + l3_payload.len();
    let mut ip = vec![0u8; 20];
    ip[0] = 0x45;
    BigEndian::write_u16(&mut ip[2..4], total as u16);
    if let Some((id, off, mf)) = frag {
        BigEndian::write_u16(&mut ip[4..6], id);
        BigEndian::write_u16(&mut ip[6..8], off | if mf { 0x2000 } else { 0 });
    }
    ip[8] = 64;
    ip[9] = 17;
    ip[12..16].copy_from_slice(&src);
    ip[16..20].copy_from_slice(&dst);
    f.extend_from_slice(&ip);

    if let Some((sp, dp)) = ports {
        let mut udp = vec![0u8; 8];
        BigEndian::write_u16(&mut udp[0..2], sp);
        BigEndian::write_u16(&mut udp[2..4], dp);
        BigEndian::write_u16(&mut udp[4..6], (8 + l3_payload.len()) as u16);
        f.extend_from_slice(&udp);
    }
    f.extend_from_slice(l3_payload);
    f
}

fn parse<'a>(parser: &mut PacketParser, frame: &'a [u8], ts: Timeval) -> Packet<'a> {
    parser.parse_frame(frame, frame.len(), ts, Datalink::En10mb)
}

/* ---------------------------------- scenarios ---------------------------------- */

/// S1: a TCP handshake becomes one flow with direction-split counters.
#[test]
fn scenario_tcp_handshake_flow() {
    let (mut cache, exporter) = cache_with(FlowCacheConfig::default(), empty_registry());
    let mut parser = PacketParser::default();

    let client = [10, 0, 0, 1];
    let server = [10, 0, 0, 2];
    let syn = tcp_frame(&TcpFrameSpec {
        src: client,
        dst: server,
        src_port: 40000,
        dst_port: 80,
        flags: 0x02,
        ip_total_len: 64,
        src_mac: MAC_A,
        dst_mac: MAC_B,
    });
    let synack = tcp_frame(&TcpFrameSpec {
        src: server,
        dst: client,
        src_port: 80,
        dst_port: 40000,
        flags: 0x12,
        ip_total_len: 64,
        src_mac: MAC_B,
        dst_mac: MAC_A,
    });
    let ack = tcp_frame(&TcpFrameSpec {
        src: client,
        dst: server,
        src_port: 40000,
        dst_port: 80,
        flags: 0x10,
        ip_total_len: 52,
        src_mac: MAC_A,
        dst_mac: MAC_B,
    });

    for (frame, usec) in [(&syn, 0), (&synack, 10_000), (&ack, 20_000)] {
        let mut pkt = parse(&mut parser, frame, Timeval::new(0, usec));
        cache.put(&mut pkt);
    }
    cache.flush_all();

    let flows = exporter.take();
    assert_eq!(flows.len(), 1);
    let flow = &flows[0];
    assert_eq!(flow.src_packets, 2);
    assert_eq!(flow.dst_packets, 1);
    assert_eq!(flow.src_bytes, 116);
    assert_eq!(flow.dst_bytes, 64);
    assert_eq!(flow.src_tcp_flags, 0x12);
    assert_eq!(flow.dst_tcp_flags, 0x12);
}

/// S2: a fragmented UDP datagram lands in one flow keyed on the first
/// fragment's ports.
#[test]
fn scenario_fragmented_udp() {
    let (mut cache, exporter) = cache_with(FlowCacheConfig::default(), empty_registry());
    let mut parser = PacketParser::default();
    let mut frag_cache = FragmentCache::default();

    let src = [10, 0, 0, 1];
    let dst = [10, 0, 0, 2];
    // first fragment: UDP header plus 1472 bytes, MF set
    let first = udp_frame(src, dst, Some((53, 33333)), &[0u8; 1472], Some((7, 0, true)));
    // last fragment: no UDP header, offset 185 * 8 = 1480
    let last = udp_frame(src, dst, None, &[0u8; 20], Some((7, 185, false)));

    let mut pkt = parse(&mut parser, &first, Timeval::new(0, 0));
    assert!(frag_cache.cache_packet(&mut pkt));
    cache.put(&mut pkt);

    let mut pkt = parse(&mut parser, &last, Timeval::new(0, 100));
    assert!(frag_cache.cache_packet(&mut pkt));
    assert_eq!((pkt.src_port, pkt.dst_port), (53, 33333));
    cache.put(&mut pkt);

    cache.flush_all();
    let flows = exporter.take();
    assert_eq!(flows.len(), 1);
    let flow = &flows[0];
    assert_eq!((flow.src_port, flow.dst_port), (53, 33333));
    assert_eq!(flow.src_packets + flow.dst_packets, 2);
    // both fragments' IP lengths accumulate in the canonical direction
    assert_eq!(flow.src_bytes, 1500 + 40);

    assert_eq!(frag_cache.stats.fragmented, 1);
    assert_eq!(frag_cache.stats.fragments, 2);
    assert_eq!(frag_cache.stats.unmatched_fragments, 0);
}

/// S3: a DNS query/response pair carries a DNS extension and is flushed by
/// the plugin on the response.
#[test]
fn scenario_bidirectional_dns() {
    let registry =
        PluginRegistry::from_specs(&[PluginSpec::parse("dns").unwrap()]).unwrap();
    let (mut cache, exporter) = cache_with(FlowCacheConfig::default(), registry);
    let mut parser = PacketParser::default();

    let client = [192, 0, 2, 1];
    let server = [192, 0, 2, 53];

    // query for example.com
    let mut query = Vec::new();
    query.extend_from_slice(&0x1234u16.to_be_bytes());
    query.extend_from_slice(&0x0100u16.to_be_bytes());
    query.extend_from_slice(&[0, 1, 0, 0, 0, 0, 0, 0]);
    query.extend_from_slice(b"\x07example\x03com\x00");
    query.extend_from_slice(&[0, 1, 0, 1]);

    // response with answer 1.2.3.4
    let mut response = Vec::new();
    response.extend_from_slice(&0x1234u16.to_be_bytes());
    response.extend_from_slice(&0x8180u16.to_be_bytes());
    response.extend_from_slice(&[0, 1, 0, 1, 0, 0, 0, 0]);
    response.extend_from_slice(b"\x07example\x03com\x00");
    response.extend_from_slice(&[0, 1, 0, 1]);
    response.extend_from_slice(&[0xC0, 0x0C]);
    response.extend_from_slice(&[0, 1, 0, 1]);
    response.extend_from_slice(&60u32.to_be_bytes());
    response.extend_from_slice(&4u16.to_be_bytes());
    response.extend_from_slice(&[1, 2, 3, 4]);

    let query_frame = udp_frame(client, server, Some((40000, 53)), &query, None);
    let response_frame = udp_frame(server, client, Some((53, 40000)), &response, None);

    let mut pkt = parse(&mut parser, &query_frame, Timeval::new(0, 0));
    cache.put(&mut pkt);
    let mut pkt = parse(&mut parser, &response_frame, Timeval::new(0, 1000));
    cache.put(&mut pkt);

    // no flush_all: the DNS plugin must have flushed the flow itself
    let flows = exporter.take();
    assert_eq!(flows.len(), 1);
    let flow = &flows[0];
    assert_eq!(flow.reason, ExportReason::Plugin);
    assert_eq!(flow.src_packets + flow.dst_packets, 2);
    let dns_text = &flow.texts[0];
    assert!(dns_text.contains("qname=\"example.com\""), "{}", dns_text);
    assert!(dns_text.contains("qtype=1"), "{}", dns_text);
    assert!(dns_text.contains("data=\"01020304\""), "{}", dns_text);
}

/// S4: colliding flows evict the oldest slot exactly once, in LRU order.
#[test]
fn scenario_eviction_under_collision() {
    // a single bucket of two slots: every flow collides
    let config = FlowCacheConfig {
        cache_size: 2,
        line_size: 2,
        ..Default::default()
    };
    let (mut cache, exporter) = cache_with(config, empty_registry());
    let mut parser = PacketParser::default();

    let frames: Vec<Vec<u8>> = (1..=4u8)
        .map(|i| {
            tcp_frame(&TcpFrameSpec {
                src: [10, 0, 0, i],
                dst: [10, 0, 1, i],
                src_port: 1000 + i as u16,
                dst_port: 80,
                flags: 0x02,
                ip_total_len: 52,
                src_mac: MAC_A,
                dst_mac: MAC_B,
            })
        })
        .collect();

    for (i, frame) in frames.iter().take(3).enumerate() {
        let mut pkt = parse(&mut parser, frame, Timeval::new(i as i64, 0));
        cache.put(&mut pkt);
    }

    let flows = exporter.take();
    assert_eq!(flows.len(), 1, "exactly one eviction");
    assert_eq!(flows[0].reason, ExportReason::Evicted);
    assert_eq!(flows[0].src_ip, "10.0.0.1".parse::<IpAddr>().unwrap());
    assert_eq!(cache.len(), 2);

    // the next collision evicts the older of the two residents
    let mut pkt = parse(&mut parser, &frames[3], Timeval::new(3, 0));
    cache.put(&mut pkt);
    let flows = exporter.take();
    assert_eq!(flows.len(), 2);
    assert_eq!(flows[1].src_ip, "10.0.0.2".parse::<IpAddr>().unwrap());
}

/// S5: the active timeout splits a long-running flow.
#[test]
fn scenario_active_timeout() {
    let config = FlowCacheConfig {
        cache_size: 16,
        line_size: 4,
        active_timeout: Timeval::new(30, 0),
        inactive_timeout: Timeval::new(300, 0),
    };
    let (mut cache, exporter) = cache_with(config, empty_registry());
    let mut parser = PacketParser::default();

    let frame = tcp_frame(&TcpFrameSpec {
        src: [10, 0, 0, 1],
        dst: [10, 0, 0, 2],
        src_port: 5000,
        dst_port: 80,
        flags: 0x10,
        ip_total_len: 52,
        src_mac: MAC_A,
        dst_mac: MAC_B,
    });

    for sec in 0..36 {
        let now = Timeval::new(sec, 0);
        let mut pkt = parse(&mut parser, &frame, now);
        cache.put(&mut pkt);
        cache.sweep_all(now);
    }
    cache.flush_all();

    let flows = exporter.take();
    assert_eq!(flows.len(), 2);
    assert_eq!(flows[0].reason, ExportReason::ActiveTimeout);
    assert!(
        (30..=32).contains(&flows[0].src_packets),
        "first export covers ~30 packets, got {}",
        flows[0].src_packets
    );
    assert_eq!(flows[0].src_packets + flows[1].src_packets, 36);
    assert_eq!(flows[1].reason, ExportReason::Forced);
}

/// S6: forward and reverse packets of a tuple land in one flow; the
/// canonical direction and source MAC come from the first packet.
#[test]
fn scenario_symmetric_hash() {
    let (mut cache, exporter) = cache_with(FlowCacheConfig::default(), empty_registry());
    let mut parser = PacketParser::default();

    let a_to_b = tcp_frame(&TcpFrameSpec {
        src: [10, 0, 0, 1],
        dst: [10, 0, 0, 2],
        src_port: 1111,
        dst_port: 2222,
        flags: 0x18,
        ip_total_len: 52,
        src_mac: MAC_A,
        dst_mac: MAC_B,
    });
    let b_to_a = tcp_frame(&TcpFrameSpec {
        src: [10, 0, 0, 2],
        dst: [10, 0, 0, 1],
        src_port: 2222,
        dst_port: 1111,
        flags: 0x18,
        ip_total_len: 52,
        src_mac: MAC_B,
        dst_mac: MAC_A,
    });

    for (i, frame) in [&a_to_b, &b_to_a, &b_to_a, &a_to_b].iter().enumerate() {
        let mut pkt = parse(&mut parser, frame, Timeval::new(i as i64, 0));
        cache.put(&mut pkt);
    }
    cache.flush_all();

    let flows = exporter.take();
    assert_eq!(flows.len(), 1);
    let flow = &flows[0];
    assert_eq!(flow.src_packets, 2);
    assert_eq!(flow.dst_packets, 2);
    assert_eq!(flow.src_ip, "10.0.0.1".parse::<IpAddr>().unwrap());
    assert_eq!(flow.src_mac, MAC_A);
}

/* ---------------------------------- plugin actions ---------------------------------- */

/// Returns a fixed action from `pre_update`, once.
struct OneShotPlugin {
    id: usize,
    action: FlowAction,
    fired: bool,
}

impl ProcessPlugin for OneShotPlugin {
    fn name(&self) -> &'static str {
        "oneshot"
    }

    fn id(&self) -> usize {
        self.id
    }

    fn ipfix_template(&self) -> &'static [TemplateField] {
        &[]
    }

    fn pre_update(&mut self, _flow: &mut Flow, _pkt: &Packet) -> FlowAction {
        if self.fired {
            return FlowAction::Continue;
        }
        self.fired = true;
        self.action
    }
}

/// A plugin returning FLUSH_WITH_REINSERT causes the old flow to be
/// exported and the packet to seed a new flow in canonical direction.
#[test]
fn flush_with_reinsert_starts_new_flow() {
    let mut registry = PluginRegistry::new();
    registry.register(|id| {
        Box::new(OneShotPlugin {
            id,
            action: FlowAction::FlushWithReinsert,
            fired: false,
        })
    });
    let (mut cache, exporter) = cache_with(FlowCacheConfig::default(), registry);
    let mut parser = PacketParser::default();

    let a_to_b = tcp_frame(&TcpFrameSpec {
        src: [10, 0, 0, 1],
        dst: [10, 0, 0, 2],
        src_port: 1111,
        dst_port: 2222,
        flags: 0x18,
        ip_total_len: 52,
        src_mac: MAC_A,
        dst_mac: MAC_B,
    });
    let b_to_a = tcp_frame(&TcpFrameSpec {
        src: [10, 0, 0, 2],
        dst: [10, 0, 0, 1],
        src_port: 2222,
        dst_port: 1111,
        flags: 0x18,
        ip_total_len: 52,
        src_mac: MAC_B,
        dst_mac: MAC_A,
    });

    let mut pkt = parse(&mut parser, &a_to_b, Timeval::new(0, 0));
    cache.put(&mut pkt);
    // the reverse packet triggers the reinsert
    let mut pkt = parse(&mut parser, &b_to_a, Timeval::new(1, 0));
    cache.put(&mut pkt);
    cache.flush_all();

    let flows = exporter.take();
    assert_eq!(flows.len(), 2);
    // old flow: exported with only its first packet
    assert_eq!(flows[0].reason, ExportReason::Plugin);
    assert_eq!(flows[0].src_packets + flows[0].dst_packets, 1);
    assert_eq!(flows[0].src_ip, "10.0.0.1".parse::<IpAddr>().unwrap());
    // new flow: exactly the reinserted packet, canonicalized to it
    assert_eq!(flows[1].src_packets + flows[1].dst_packets, 1);
    assert_eq!(flows[1].src_ip, "10.0.0.2".parse::<IpAddr>().unwrap());
}

/// A plugin returning FLUSH from pre_update exports the flow without the
/// current packet's contribution.
#[test]
fn flush_from_pre_update_excludes_packet() {
    let mut registry = PluginRegistry::new();
    registry.register(|id| {
        Box::new(OneShotPlugin {
            id,
            action: FlowAction::Flush,
            fired: false,
        })
    });
    let (mut cache, exporter) = cache_with(FlowCacheConfig::default(), registry);
    let mut parser = PacketParser::default();

    let frame = tcp_frame(&TcpFrameSpec {
        src: [10, 0, 0, 1],
        dst: [10, 0, 0, 2],
        src_port: 1111,
        dst_port: 2222,
        flags: 0x18,
        ip_total_len: 52,
        src_mac: MAC_A,
        dst_mac: MAC_B,
    });

    let mut pkt = parse(&mut parser, &frame, Timeval::new(0, 0));
    cache.put(&mut pkt);
    let mut pkt = parse(&mut parser, &frame, Timeval::new(1, 0));
    cache.put(&mut pkt);
    cache.flush_all();

    let flows = exporter.take();
    assert_eq!(flows[0].reason, ExportReason::Plugin);
    assert_eq!(flows[0].src_packets, 1);
}
