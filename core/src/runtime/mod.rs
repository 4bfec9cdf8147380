//! Worker threads and runtime lifecycle.
//!
//! One worker thread is spawned per input source. Each worker owns its
//! packet parser, fragment cache, flow cache, plugin set, and exporter
//! output; no flow state is shared between workers (the input stage must
//! shard flows symmetrically, e.g. via symmetric RSS). A shutdown signal
//! flips an atomic flag; workers finish their current packet block, drain
//! their flow cache, flush partial messages, and exit.

use crate::config::{OutputConfig, OutputProtocol, RuntimeConfig};
use crate::export::ipfix::{IpfixExporter, IpfixExporterConfig, TcpSink, UdpSink};
use crate::export::text::TextExporter;
use crate::flowtable::{FlowCache, FlowExporter};
use crate::fragcache::FragmentCache;
use crate::memory::packet_block::{InputResult, PacketBlock, PacketSource};
use crate::parser::PacketParser;
use crate::process::PluginRegistry;
use crate::telemetry::{TelemetryTree, WorkerTelemetry};
use crate::utils::Timeval;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use crossbeam_channel::tick;

/// Timeout sweep period while the input is idle.
const SWEEP_PERIOD: Duration = Duration::from_millis(100);

/// The meter runtime: spawns and joins the workers.
pub struct Runtime {
    config: RuntimeConfig,
    sources: Vec<Box<dyn PacketSource>>,
    telemetry: TelemetryTree,
    shutdown: Arc<AtomicBool>,
}

impl Runtime {
    /// Creates a runtime from a configuration and one input source per
    /// worker.
    pub fn new(config: RuntimeConfig, sources: Vec<Box<dyn PacketSource>>) -> Result<Self> {
        if sources.len() != config.workers {
            bail!(
                "{} input sources provided for {} workers",
                sources.len(),
                config.workers
            );
        }
        // fail early on bad plugin specifications
        let specs = config.plugin_specs()?;
        PluginRegistry::from_specs(&specs)?;

        Ok(Runtime {
            config,
            sources,
            telemetry: TelemetryTree::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The flag workers poll; setting it requests a graceful drain.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// The shared counter tree.
    pub fn telemetry(&self) -> TelemetryTree {
        self.telemetry.clone()
    }

    /// Runs all workers until their sources are exhausted or a shutdown is
    /// requested. Blocks the calling thread.
    pub fn run(mut self) {
        let shutdown = self.shutdown.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            log::info!("shutdown requested");
            shutdown.store(true, Ordering::Relaxed);
        }) {
            log::warn!("signal handler not installed: {}", e);
        }

        let config = &self.config;
        let telemetry = &self.telemetry;
        let shutdown = &self.shutdown;
        let sources: Vec<_> = self.sources.drain(..).collect();

        thread::scope(|scope| {
            for (worker_id, source) in sources.into_iter().enumerate() {
                scope.spawn(move || {
                    if let Err(e) = run_worker(worker_id, config, source, telemetry, shutdown) {
                        log::error!("worker {} failed: {:#}", worker_id, e);
                        shutdown.store(true, Ordering::Relaxed);
                    }
                });
            }
        });
        log::info!("all workers finished");
    }
}

/// Builds the configured exporter for one worker.
fn build_exporter(
    output: &OutputConfig,
    registry: &PluginRegistry,
) -> Result<Box<dyn FlowExporter>> {
    let ipfix_config = IpfixExporterConfig {
        mtu: output.mtu,
        odid: output.odid,
        template_refresh: Timeval::new(output.template_refresh as i64, 0),
    };
    let templates = IpfixExporter::plugin_templates(registry);
    match output.protocol {
        OutputProtocol::Udp => {
            let sink = UdpSink::connect((output.host.as_str(), output.port))
                .context("UDP exporter socket")?;
            Ok(Box::new(IpfixExporter::new(ipfix_config, templates, Box::new(sink))))
        }
        OutputProtocol::Tcp => {
            let addr = format!("{}:{}", output.host, output.port);
            let sink = TcpSink::connect(&addr);
            Ok(Box::new(IpfixExporter::new(ipfix_config, templates, Box::new(sink))))
        }
        OutputProtocol::Text => Ok(Box::new(TextExporter::new(std::io::stdout(), registry))),
    }
}

/// One worker: input loop, parse, fragment handling, flow cache, sweep.
fn run_worker(
    worker_id: usize,
    config: &RuntimeConfig,
    mut source: Box<dyn PacketSource>,
    telemetry: &TelemetryTree,
    shutdown: &AtomicBool,
) -> Result<()> {
    let specs = config.plugin_specs()?;
    let registry = PluginRegistry::from_specs(&specs)?;
    let exporter = build_exporter(&config.output, &registry)?;
    let mut cache = FlowCache::new((&config.cache).into(), registry, exporter);
    let mut frag = (!config.frag.disable).then(|| {
        FragmentCache::new(
            config.frag.buckets,
            Timeval::new(config.frag.timeout as i64, 0),
        )
    });
    let mut parser = PacketParser::default();
    let counters = WorkerTelemetry::register(telemetry, worker_id);
    let ticker = tick(SWEEP_PERIOD);

    let mut block = PacketBlock::default();
    let mut last_ts = Timeval::default();

    log::info!("worker {} started", worker_id);
    while !shutdown.load(Ordering::Relaxed) {
        block.clear();
        match source.next_block(&mut block)? {
            InputResult::Parsed => {
                for slot in block.slots() {
                    let mut pkt = parser.parse(slot);
                    if !pkt.is_parsed() {
                        continue;
                    }
                    last_ts = pkt.ts;
                    if let Some(frag) = frag.as_mut() {
                        frag.cache_packet(&mut pkt);
                    }
                    cache.put(&mut pkt);
                }
                cache.export_expired(last_ts);
            }
            InputResult::NotParsed => {}
            InputResult::Timeout => {
                cache.export_expired(last_ts);
                cache.flush_output();
            }
            InputResult::Eof => break,
        }

        if ticker.try_recv().is_ok() {
            cache.export_expired(last_ts);
            let frag_stats = frag.as_ref().map(|f| f.stats).unwrap_or_default();
            counters.publish(&parser.stats, &cache.stats, &frag_stats);
        }
    }

    // graceful drain: no flow is silently lost
    cache.flush_all();
    let frag_stats = frag.as_ref().map(|f| f.stats).unwrap_or_default();
    counters.publish(&parser.stats, &cache.stats, &frag_stats);
    cache.plugins_mut().finish(config.print_stats);
    if config.print_stats {
        for port in parser.top_ports.top_ports() {
            log::info!("worker {} top port: {}", worker_id, port.to_string());
        }
    }
    log::info!(
        "worker {} finished: {} packets, {} flows, {} exported",
        worker_id,
        parser.stats.seen_packets,
        cache.stats.new_flows,
        cache.stats.exported
    );
    Ok(())
}
