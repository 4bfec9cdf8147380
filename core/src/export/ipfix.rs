//! IPFIX (RFC 7011) flow export.
//!
//! The exporter maintains one template per combination of IP version and
//! contributing plugin extensions. Template IDs start at 256; the template
//! set is sent when a new template is derived, republished on a periodic
//! interval, and re-sent after a TCP reconnect. Data records are batched
//! into messages up to the configured MTU and flushed on overflow, on
//! cache flush, and at shutdown.

use crate::export::template::{
    base_record_len, TemplateField, BASE_TEMPLATE_V4, BASE_TEMPLATE_V6, IANA_PEN,
};
use crate::flowtable::flow::Flow;
use crate::flowtable::{ExportReason, FlowExporter};
use crate::process::{PluginId, PluginRegistry};
use crate::utils::Timeval;

use std::collections::{HashMap, VecDeque};
use std::io::{self, Write};
use std::net::{IpAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};

/// IPFIX message header version.
const IPFIX_VERSION: u16 = 10;
/// IPFIX message header size.
const MSG_HDR_SIZE: usize = 16;
/// Set header size.
const SET_HDR_SIZE: usize = 4;
/// Set ID of the template set.
const TEMPLATE_SET_ID: u16 = 2;
/// First data-set template ID.
const FIRST_TEMPLATE_ID: u16 = 256;

/// Default message size limit.
pub const DEFAULT_MTU: usize = 1400;
/// Default template republish interval.
pub const DEFAULT_TEMPLATE_REFRESH: Timeval = Timeval::new(300, 0);

/// Exporter counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExportStats {
    pub records: u64,
    pub messages: u64,
    pub bytes: u64,
    /// Records dropped after a second `fill_ipfix` failure.
    pub dropped: u64,
    /// Messages that could not be handed to the transport.
    pub send_errors: u64,
}

/// Transport for finished IPFIX messages.
pub trait MessageSink: Send {
    fn send(&mut self, msg: &[u8]) -> io::Result<()>;

    /// Returns `true` once after a (re)connect; the exporter responds by
    /// republishing its template set.
    fn take_needs_templates(&mut self) -> bool {
        false
    }
}

/// Best-effort UDP transport.
pub struct UdpSink {
    socket: UdpSocket,
}

impl UdpSink {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.connect(addr)?;
        Ok(UdpSink { socket })
    }
}

impl MessageSink for UdpSink {
    fn send(&mut self, msg: &[u8]) -> io::Result<()> {
        self.socket.send(msg).map(|_| ())
    }
}

/// Maximum messages buffered while a TCP collector is unreachable.
const MAX_PENDING: usize = 256;
/// Reconnect backoff cap.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// TCP transport with exponential-backoff reconnect.
///
/// While disconnected, messages are buffered up to a bounded queue;
/// overflow drops the oldest message. Backoff doubles from 1 s and is
/// capped at 30 s.
pub struct TcpSink {
    addr: String,
    stream: Option<TcpStream>,
    backoff: Duration,
    next_retry: Option<Instant>,
    pending: VecDeque<Vec<u8>>,
    needs_templates: bool,
}

impl TcpSink {
    pub fn connect(addr: &str) -> Self {
        let mut sink = TcpSink {
            addr: addr.to_string(),
            stream: None,
            backoff: Duration::from_secs(1),
            next_retry: None,
            pending: VecDeque::new(),
            needs_templates: false,
        };
        sink.try_connect();
        sink
    }

    fn try_connect(&mut self) {
        match TcpStream::connect(&self.addr) {
            Ok(stream) => {
                log::info!("connected to IPFIX collector at {}", self.addr);
                self.stream = Some(stream);
                self.backoff = Duration::from_secs(1);
                self.next_retry = None;
                self.needs_templates = true;
            }
            Err(e) => {
                log::warn!(
                    "IPFIX collector {} unreachable ({}), retrying in {:?}",
                    self.addr,
                    e,
                    self.backoff
                );
                self.next_retry = Some(Instant::now() + self.backoff);
                self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
                self.stream = None;
            }
        }
    }

    fn disconnected(&mut self) {
        log::warn!("IPFIX collector {} connection lost", self.addr);
        self.stream = None;
        self.next_retry = Some(Instant::now() + self.backoff);
        self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
    }

    fn queue(&mut self, msg: &[u8]) {
        if self.pending.len() == MAX_PENDING {
            self.pending.pop_front();
        }
        self.pending.push_back(msg.to_vec());
    }
}

impl TcpSink {
    fn write_one(&mut self, buf: &[u8]) -> bool {
        match self.stream.as_mut() {
            Some(stream) => stream.write_all(buf).is_ok(),
            None => false,
        }
    }
}

impl MessageSink for TcpSink {
    fn send(&mut self, msg: &[u8]) -> io::Result<()> {
        if self.stream.is_none() {
            let due = self.next_retry.map(|t| Instant::now() >= t).unwrap_or(true);
            if due {
                self.try_connect();
            }
        }
        if self.stream.is_none() {
            self.queue(msg);
            return Ok(());
        }

        // drain buffered messages first to preserve ordering
        while let Some(buffered) = self.pending.pop_front() {
            if !self.write_one(&buffered) {
                self.pending.push_front(buffered);
                self.disconnected();
                self.queue(msg);
                return Ok(());
            }
        }
        if !self.write_one(msg) {
            self.disconnected();
            self.queue(msg);
        }
        Ok(())
    }

    fn take_needs_templates(&mut self) -> bool {
        std::mem::take(&mut self.needs_templates)
    }
}

/// In-memory transport used by tests and embeddings that consume messages
/// directly.
#[derive(Default, Clone)]
pub struct BufferSink {
    pub messages: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MessageSink for BufferSink {
    fn send(&mut self, msg: &[u8]) -> io::Result<()> {
        self.messages.lock().unwrap().push(msg.to_vec());
        Ok(())
    }
}

/// Exporter options.
#[derive(Debug, Clone)]
pub struct IpfixExporterConfig {
    /// Message size limit (UDP path MTU or the chosen TCP batch size).
    pub mtu: usize,
    /// Observation domain ID carried in every message header.
    pub odid: u32,
    /// Template republish interval.
    pub template_refresh: Timeval,
}

impl Default for IpfixExporterConfig {
    fn default() -> Self {
        IpfixExporterConfig {
            mtu: DEFAULT_MTU,
            odid: 1,
            template_refresh: DEFAULT_TEMPLATE_REFRESH,
        }
    }
}

/// Serializes flows into IPFIX messages and hands them to a transport.
pub struct IpfixExporter {
    sink: Box<dyn MessageSink>,
    config: IpfixExporterConfig,
    /// Per-plugin template descriptors in registration order.
    plugin_templates: Vec<(PluginId, &'static [TemplateField])>,
    /// `(ip version, extension mask)` to template ID.
    template_ids: HashMap<(u8, u64), u16>,
    /// All derived templates in derivation order, for (re)publication.
    templates: Vec<(u16, Vec<TemplateField>)>,
    next_template_id: u16,
    templates_dirty: bool,
    last_template_publish: Timeval,

    msg: Vec<u8>,
    set_start: Option<usize>,
    cur_set_id: u16,
    records_in_msg: u32,
    seq: u32,
    last_ts: Timeval,

    pub stats: ExportStats,
}

impl IpfixExporter {
    pub fn new(
        config: IpfixExporterConfig,
        plugin_templates: Vec<(PluginId, &'static [TemplateField])>,
        sink: Box<dyn MessageSink>,
    ) -> Self {
        let mut exporter = IpfixExporter {
            sink,
            config,
            plugin_templates,
            template_ids: HashMap::new(),
            templates: Vec::new(),
            next_template_id: FIRST_TEMPLATE_ID,
            templates_dirty: false,
            last_template_publish: Timeval::default(),
            msg: Vec::new(),
            set_start: None,
            cur_set_id: 0,
            records_in_msg: 0,
            seq: 0,
            last_ts: Timeval::default(),
            stats: ExportStats::default(),
        };
        exporter.begin_message();
        exporter
    }

    /// Collects template descriptors from a plugin registry.
    pub fn plugin_templates(registry: &PluginRegistry) -> Vec<(PluginId, &'static [TemplateField])> {
        registry.iter().map(|p| (p.id(), p.ipfix_template())).collect()
    }

    fn begin_message(&mut self) {
        self.msg.clear();
        self.msg.resize(MSG_HDR_SIZE, 0);
        self.set_start = None;
        self.cur_set_id = 0;
        self.records_in_msg = 0;
    }

    fn close_set(&mut self) {
        if let Some(start) = self.set_start.take() {
            let len = (self.msg.len() - start) as u16;
            BigEndian::write_u16(&mut self.msg[start + 2..start + 4], len);
        }
    }

    fn open_set(&mut self, set_id: u16) {
        self.close_set();
        self.set_start = Some(self.msg.len());
        self.cur_set_id = set_id;
        let mut hdr = [0u8; SET_HDR_SIZE];
        BigEndian::write_u16(&mut hdr[0..2], set_id);
        self.msg.extend_from_slice(&hdr);
    }

    /// Finalizes and sends the current message, if it carries any sets.
    fn finalize_and_send(&mut self) {
        self.close_set();
        if self.msg.len() == MSG_HDR_SIZE {
            return;
        }
        let msg_len = self.msg.len() as u16;
        BigEndian::write_u16(&mut self.msg[0..2], IPFIX_VERSION);
        BigEndian::write_u16(&mut self.msg[2..4], msg_len);
        BigEndian::write_u32(&mut self.msg[4..8], self.last_ts.sec as u32);
        BigEndian::write_u32(&mut self.msg[8..12], self.seq);
        BigEndian::write_u32(&mut self.msg[12..16], self.config.odid);

        let msg = std::mem::take(&mut self.msg);
        match self.sink.send(&msg) {
            Ok(()) => {
                self.stats.messages += 1;
                self.stats.bytes += msg.len() as u64;
            }
            Err(e) => {
                self.stats.send_errors += 1;
                log::warn!("IPFIX message send failed: {}", e);
            }
        }
        self.seq = self.seq.wrapping_add(self.records_in_msg);
        self.begin_message();
    }

    /// Returns the template ID for `flow`, deriving a new template if this
    /// plugin combination has not been seen before.
    fn template_for(&mut self, flow: &Flow) -> u16 {
        let key = (flow.key.ip_version, flow.extension_mask());
        if let Some(&id) = self.template_ids.get(&key) {
            return id;
        }
        let base = match flow.key.ip_version {
            6 => BASE_TEMPLATE_V6,
            _ => BASE_TEMPLATE_V4,
        };
        let mut fields: Vec<TemplateField> = base.to_vec();
        for (plugin_id, tmpl) in &self.plugin_templates {
            if flow.has_extension(*plugin_id) {
                fields.extend_from_slice(tmpl);
            }
        }
        let id = self.next_template_id;
        self.next_template_id += 1;
        self.template_ids.insert(key, id);
        self.templates.push((id, fields));
        self.templates_dirty = true;
        id
    }

    /// Writes the full template set into the current message.
    fn publish_templates(&mut self) {
        if self.templates.is_empty() {
            return;
        }
        let mut set: Vec<u8> = Vec::new();
        for (id, fields) in &self.templates {
            let mut hdr = [0u8; 4];
            BigEndian::write_u16(&mut hdr[0..2], *id);
            BigEndian::write_u16(&mut hdr[2..4], fields.len() as u16);
            set.extend_from_slice(&hdr);
            for f in fields {
                let mut fld = [0u8; 4];
                let id_field = if f.pen == IANA_PEN { f.id } else { f.id | 0x8000 };
                BigEndian::write_u16(&mut fld[0..2], id_field);
                BigEndian::write_u16(&mut fld[2..4], f.len);
                set.extend_from_slice(&fld);
                if f.pen != IANA_PEN {
                    let mut pen = [0u8; 4];
                    BigEndian::write_u32(&mut pen, f.pen);
                    set.extend_from_slice(&pen);
                }
            }
        }

        if self.msg.len() + SET_HDR_SIZE + set.len() > self.config.mtu {
            self.finalize_and_send();
        }
        self.open_set(TEMPLATE_SET_ID);
        self.msg.extend_from_slice(&set);
        self.close_set();

        self.templates_dirty = false;
        self.last_template_publish = self.last_ts;
    }

    /// Appends one data record; `false` means "no room in this message".
    fn try_append(&mut self, flow: &Flow, template_id: u16) -> bool {
        let saved_len = self.msg.len();
        let saved_set = self.set_start;
        let saved_set_id = self.cur_set_id;

        if self.set_start.is_none() || self.cur_set_id != template_id {
            self.open_set(template_id);
        }
        let start = self.msg.len();
        if start >= self.config.mtu {
            self.rollback(saved_len, saved_set, saved_set_id);
            return false;
        }
        self.msg.resize(self.config.mtu, 0);

        let written = (|| {
            let buf = &mut self.msg[start..];
            let mut off = write_base(flow, buf)?;
            for (plugin_id, _) in &self.plugin_templates {
                if let Some(ext) = flow.get_extension(*plugin_id) {
                    off += ext.fill_ipfix(&mut buf[off..])?;
                }
            }
            Some(off)
        })();

        match written {
            Some(n) => {
                self.msg.truncate(start + n);
                true
            }
            None => {
                self.rollback(saved_len, saved_set, saved_set_id);
                false
            }
        }
    }

    fn rollback(&mut self, len: usize, set_start: Option<usize>, set_id: u16) {
        self.msg.truncate(len);
        self.set_start = set_start;
        self.cur_set_id = set_id;
    }
}

impl FlowExporter for IpfixExporter {
    fn export(&mut self, flow: &Flow, _reason: ExportReason) {
        self.last_ts = flow.time_last;

        if self.sink.take_needs_templates() {
            self.templates_dirty = true;
        }
        if self.last_ts - self.last_template_publish > self.config.template_refresh {
            self.templates_dirty = !self.templates.is_empty();
            self.last_template_publish = self.last_ts;
        }

        let template_id = self.template_for(flow);
        if self.templates_dirty {
            self.publish_templates();
        }

        if !self.try_append(flow, template_id) {
            // no room: flush and retry once with an empty message
            self.finalize_and_send();
            if !self.try_append(flow, template_id) {
                self.stats.dropped += 1;
                log::warn!(
                    "flow record larger than message limit ({} B), dropped",
                    self.config.mtu
                );
                return;
            }
        }
        self.records_in_msg += 1;
        self.stats.records += 1;
    }

    fn flush(&mut self) {
        self.finalize_and_send();
    }
}

/// Serializes the base flow fields in template order.
fn write_base(flow: &Flow, buf: &mut [u8]) -> Option<usize> {
    let need = base_record_len(flow.key.ip_version);
    if buf.len() < need {
        return None;
    }
    let mut off = 0;
    let mut put_u64 = |buf: &mut [u8], off: &mut usize, v: u64| {
        BigEndian::write_u64(&mut buf[*off..*off + 8], v);
        *off += 8;
    };
    put_u64(buf, &mut off, flow.src_bytes);
    put_u64(buf, &mut off, flow.dst_bytes);
    put_u64(buf, &mut off, flow.src_packets as u64);
    put_u64(buf, &mut off, flow.dst_packets as u64);
    put_u64(buf, &mut off, flow.time_first.as_millis());
    put_u64(buf, &mut off, flow.time_last.as_millis());
    buf[off] = flow.key.proto;
    buf[off + 1] = flow.src_tcp_flags;
    buf[off + 2] = flow.dst_tcp_flags;
    off += 3;
    BigEndian::write_u16(&mut buf[off..off + 2], flow.key.src_port);
    BigEndian::write_u16(&mut buf[off + 2..off + 4], flow.key.dst_port);
    off += 4;
    off += write_ip(&mut buf[off..], flow.key.src_ip);
    off += write_ip(&mut buf[off..], flow.key.dst_ip);
    BigEndian::write_u16(&mut buf[off..off + 2], flow.key.vlan_id);
    off += 2;
    buf[off..off + 6].copy_from_slice(&flow.src_mac.octets());
    buf[off + 6..off + 12].copy_from_slice(&flow.dst_mac.octets());
    off += 12;
    debug_assert_eq!(off, need);
    Some(off)
}

fn write_ip(buf: &mut [u8], ip: IpAddr) -> usize {
    match ip {
        IpAddr::V4(v4) => {
            buf[..4].copy_from_slice(&v4.octets());
            4
        }
        IpAddr::V6(v6) => {
            buf[..16].copy_from_slice(&v6.octets());
            16
        }
    }
}
