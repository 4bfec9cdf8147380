//! DNS traffic analysis.
//!
//! Parses DNS messages on port 53 (UDP and TCP, including the TCP length
//! prefix), keeping the first question, the first answer's payload, and the
//! OPT pseudo-record fields. A successfully parsed response flushes the
//! flow. The wire parser here is shared with the passive DNS plugin.

use crate::export::template::{field, TemplateField, CESNET_PEN, VAR_LEN};
use crate::flowtable::flow::Flow;
use crate::parser::packet::Packet;
use crate::process::{FlowAction, FlowExt, PluginId, ProcessPlugin};
use crate::protocols::packet::tcp::TCP_PROTOCOL;

use std::any::Any;

use byteorder::{BigEndian, ByteOrder};

/// Well-known DNS port.
pub const DNS_PORT: u16 = 53;

/// Longest stored question name.
const MAX_QNAME: usize = 128;
/// Longest stored answer payload.
const MAX_RDATA: usize = 160;

// Record types the plugins interpret.
pub(crate) const TYPE_A: u16 = 1;
pub(crate) const TYPE_NS: u16 = 2;
pub(crate) const TYPE_CNAME: u16 = 5;
pub(crate) const TYPE_PTR: u16 = 12;
pub(crate) const TYPE_TXT: u16 = 16;
pub(crate) const TYPE_AAAA: u16 = 28;
pub(crate) const TYPE_OPT: u16 = 41;

const TEMPLATE: &[TemplateField] = &[
    field(CESNET_PEN, 1045, 2),       // DNS_ANSWERS
    field(CESNET_PEN, 1046, 1),       // DNS_RCODE
    field(CESNET_PEN, 1047, 2),       // DNS_QTYPE
    field(CESNET_PEN, 1048, 2),       // DNS_CLASS
    field(CESNET_PEN, 1049, 4),       // DNS_RR_TTL
    field(CESNET_PEN, 1050, 2),       // DNS_RLENGTH
    field(CESNET_PEN, 1051, 2),       // DNS_PSIZE
    field(CESNET_PEN, 1052, 1),       // DNS_DO
    field(CESNET_PEN, 1053, 2),       // DNS_ID
    field(CESNET_PEN, 1054, VAR_LEN), // DNS_NAME
    field(CESNET_PEN, 1055, VAR_LEN), // DNS_RDATA
];

/// One parsed question.
#[derive(Debug, Clone)]
pub(crate) struct DnsQuestion {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// One parsed resource record with its payload already interpreted:
/// A/AAAA carry the raw address bytes, name-valued types carry the decoded
/// name, everything else the raw rdata (truncated).
#[derive(Debug, Clone)]
pub(crate) struct DnsRecord {
    pub name: String,
    pub rtype: u16,
    pub rclass: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

/// A parsed DNS message, reduced to the fields the plugins keep.
#[derive(Debug, Clone, Default)]
pub(crate) struct DnsMessage {
    pub id: u16,
    pub is_response: bool,
    pub rcode: u8,
    pub answer_count: u16,
    pub question: Option<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    /// OPT pseudo-record: (requestor payload size, DNSSEC-OK bit).
    pub opt: Option<(u16, u8)>,
}

/// Decodes a (possibly compressed) domain name starting at `pos`.
///
/// Returns the dotted name and the offset just past the name in the
/// original (non-pointer) byte stream. Pointer loops are cut off by a jump
/// budget; a label walk that leaves the message fails the parse.
fn read_name(data: &[u8], pos: usize) -> Option<(String, usize)> {
    let mut name = String::new();
    let mut cursor = pos;
    let mut end_after_jump = None;
    let mut jumps = 0;

    loop {
        let len = *data.get(cursor)? as usize;
        if len == 0 {
            cursor += 1;
            break;
        }
        if len & 0xC0 == 0xC0 {
            let ptr = (((len & 0x3F) << 8) | *data.get(cursor + 1)? as usize) & 0x3FFF;
            if end_after_jump.is_none() {
                end_after_jump = Some(cursor + 2);
            }
            jumps += 1;
            if jumps > 32 || ptr >= data.len() {
                return None;
            }
            cursor = ptr;
            continue;
        }
        if len > 63 {
            return None;
        }
        let label = data.get(cursor + 1..cursor + 1 + len)?;
        if !name.is_empty() {
            name.push('.');
        }
        for b in label {
            name.push(char::from(*b));
        }
        if name.len() > 255 {
            return None;
        }
        cursor += 1 + len;
    }
    Some((name, end_after_jump.unwrap_or(cursor)))
}

fn read_record(data: &[u8], pos: usize) -> Option<(DnsRecord, usize)> {
    let (name, mut cursor) = read_name(data, pos)?;
    let fixed = data.get(cursor..cursor + 10)?;
    let rtype = BigEndian::read_u16(&fixed[0..2]);
    let rclass = BigEndian::read_u16(&fixed[2..4]);
    let ttl = BigEndian::read_u32(&fixed[4..8]);
    let rdlength = BigEndian::read_u16(&fixed[8..10]) as usize;
    cursor += 10;
    let rdata_raw = data.get(cursor..cursor + rdlength)?;

    let rdata = match rtype {
        TYPE_A | TYPE_AAAA => rdata_raw.to_vec(),
        TYPE_NS | TYPE_CNAME | TYPE_PTR => {
            let (target, _) = read_name(data, cursor)?;
            target.into_bytes()
        }
        TYPE_TXT => {
            // character strings, first length byte stripped
            match rdata_raw.split_first() {
                Some((n, rest)) => rest.get(..(*n as usize).min(rest.len()))?.to_vec(),
                None => Vec::new(),
            }
        }
        _ => rdata_raw.to_vec(),
    };
    let mut rdata = rdata;
    rdata.truncate(MAX_RDATA);

    Some((
        DnsRecord {
            name,
            rtype,
            rclass,
            ttl,
            rdata,
        },
        cursor + rdlength,
    ))
}

/// Parses a DNS message from an L7 payload. `tcp` strips the RFC 1035
/// two-byte length prefix first.
pub(crate) fn parse_dns(payload: &[u8], tcp: bool) -> Option<DnsMessage> {
    let data = if tcp {
        let len = BigEndian::read_u16(payload.get(0..2)?) as usize;
        let rest = payload.get(2..)?;
        rest.get(..len.min(rest.len()))?
    } else {
        payload
    };

    let hdr = data.get(0..12)?;
    let flags = BigEndian::read_u16(&hdr[2..4]);
    let mut msg = DnsMessage {
        id: BigEndian::read_u16(&hdr[0..2]),
        is_response: flags & 0x8000 != 0,
        rcode: (flags & 0x000F) as u8,
        answer_count: BigEndian::read_u16(&hdr[6..8]),
        ..Default::default()
    };
    let qdcount = BigEndian::read_u16(&hdr[4..6]);
    let nscount = BigEndian::read_u16(&hdr[8..10]);
    let arcount = BigEndian::read_u16(&hdr[10..12]);

    let mut cursor = 12;
    for i in 0..qdcount {
        let (mut name, next) = read_name(data, cursor)?;
        let fixed = data.get(next..next + 4)?;
        if i == 0 {
            name.truncate(MAX_QNAME);
            msg.question = Some(DnsQuestion {
                name,
                qtype: BigEndian::read_u16(&fixed[0..2]),
                qclass: BigEndian::read_u16(&fixed[2..4]),
            });
        }
        cursor = next + 4;
    }

    for _ in 0..msg.answer_count {
        let (record, next) = read_record(data, cursor)?;
        msg.answers.push(record);
        cursor = next;
    }

    // authority records are skipped, additionals scanned for OPT
    for _ in 0..nscount {
        let (_, next) = read_record(data, cursor)?;
        cursor = next;
    }
    for _ in 0..arcount {
        let (record, next) = read_record(data, cursor)?;
        if record.rtype == TYPE_OPT && msg.opt.is_none() {
            // OPT reuses the class field as the requestor payload size and
            // TTL bit 15 as the DNSSEC-OK flag
            msg.opt = Some((record.rclass, ((record.ttl >> 15) & 1) as u8));
        }
        cursor = next;
    }

    Some(msg)
}

/// Per-flow DNS record.
#[derive(Debug, Default)]
pub struct DnsExt {
    pub id: u16,
    pub answers: u16,
    pub rcode: u8,
    pub qname: String,
    pub qtype: u16,
    pub qclass: u16,
    pub rr_ttl: u32,
    pub rdata: Vec<u8>,
    pub psize: u16,
    pub dns_do: u8,
}

impl DnsExt {
    fn store(&mut self, msg: &DnsMessage) {
        self.id = msg.id;
        self.answers = msg.answer_count;
        self.rcode = msg.rcode;
        if let Some(q) = &msg.question {
            self.qname = q.name.clone();
            self.qtype = q.qtype;
            self.qclass = q.qclass;
        }
        if let Some(answer) = msg.answers.first() {
            self.rr_ttl = answer.ttl;
            self.rdata = answer.rdata.clone();
        }
        if let Some((psize, dns_do)) = msg.opt {
            self.psize = psize;
            self.dns_do = dns_do;
        }
    }
}

impl FlowExt for DnsExt {
    fn fill_ipfix(&self, buf: &mut [u8]) -> Option<usize> {
        let qname = self.qname.as_bytes();
        let need = 20 + qname.len() + self.rdata.len();
        if buf.len() < need {
            return None;
        }
        BigEndian::write_u16(&mut buf[0..2], self.answers);
        buf[2] = self.rcode;
        BigEndian::write_u16(&mut buf[3..5], self.qtype);
        BigEndian::write_u16(&mut buf[5..7], self.qclass);
        BigEndian::write_u32(&mut buf[7..11], self.rr_ttl);
        BigEndian::write_u16(&mut buf[11..13], self.rdata.len() as u16);
        BigEndian::write_u16(&mut buf[13..15], self.psize);
        buf[15] = self.dns_do;
        BigEndian::write_u16(&mut buf[16..18], self.id);
        buf[18] = qname.len() as u8;
        buf[19..19 + qname.len()].copy_from_slice(qname);
        buf[19 + qname.len()] = self.rdata.len() as u8;
        buf[20 + qname.len()..need].copy_from_slice(&self.rdata);
        Some(need)
    }

    fn get_text(&self) -> String {
        format!(
            "dnsid={},answers={},rcode={},qname=\"{}\",qtype={},qclass={},rrttl={},\
             rlength={},data=\"{}\",psize={},dnsdo={}",
            self.id,
            self.answers,
            self.rcode,
            self.qname,
            self.qtype,
            self.qclass,
            self.rr_ttl,
            self.rdata.len(),
            hex::encode(&self.rdata),
            self.psize,
            self.dns_do
        )
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Extracts DNS fields from port-53 flows.
pub struct DnsPlugin {
    id: PluginId,
    queries: u64,
    responses: u64,
    total: u64,
}

impl DnsPlugin {
    pub fn new(id: PluginId) -> Self {
        DnsPlugin {
            id,
            queries: 0,
            responses: 0,
            total: 0,
        }
    }

    /// Parses `pkt` into `ext`; returns `true` for a parsed response.
    fn process(&mut self, ext: &mut DnsExt, pkt: &Packet) -> bool {
        self.total += 1;
        let tcp = pkt.ip_proto == TCP_PROTOCOL;
        match parse_dns(pkt.payload, tcp) {
            Some(msg) => {
                ext.store(&msg);
                if msg.is_response {
                    self.responses += 1;
                } else {
                    self.queries += 1;
                }
                msg.is_response
            }
            None => false,
        }
    }
}

impl ProcessPlugin for DnsPlugin {
    fn name(&self) -> &'static str {
        "dns"
    }

    fn id(&self) -> PluginId {
        self.id
    }

    fn ipfix_template(&self) -> &'static [TemplateField] {
        TEMPLATE
    }

    fn post_create(&mut self, flow: &mut Flow, pkt: &Packet) -> FlowAction {
        if pkt.src_port != DNS_PORT && pkt.dst_port != DNS_PORT {
            return FlowAction::NoData;
        }
        let mut ext = DnsExt::default();
        self.process(&mut ext, pkt);
        flow.add_extension(self.id, Box::new(ext));
        FlowAction::Continue
    }

    fn post_update(&mut self, flow: &mut Flow, pkt: &Packet) -> FlowAction {
        let mut response = false;
        if let Some(ext) = flow.ext_mut::<DnsExt>(self.id) {
            response = self.process(ext, pkt);
        }
        if response {
            // the transaction is complete
            FlowAction::Flush
        } else {
            FlowAction::Continue
        }
    }

    fn finish(&mut self, print_stats: bool) {
        if print_stats {
            log::info!(
                "dns plugin stats: queries {}, responses {}, total {}",
                self.queries,
                self.responses,
                self.total
            );
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds a response for `example.com` A -> 1.2.3.4 with an OPT RR.
    pub(crate) fn dns_response() -> Vec<u8> {
        let mut m = Vec::new();
        m.extend_from_slice(&0x1234u16.to_be_bytes()); // id
        m.extend_from_slice(&0x8180u16.to_be_bytes()); // QR=1, RD, RA
        m.extend_from_slice(&1u16.to_be_bytes()); // qdcount
        m.extend_from_slice(&1u16.to_be_bytes()); // ancount
        m.extend_from_slice(&0u16.to_be_bytes()); // nscount
        m.extend_from_slice(&1u16.to_be_bytes()); // arcount
        // question: example.com A IN
        m.extend_from_slice(b"\x07example\x03com\x00");
        m.extend_from_slice(&TYPE_A.to_be_bytes());
        m.extend_from_slice(&1u16.to_be_bytes());
        // answer: pointer to offset 12, A, IN, ttl 60, 1.2.3.4
        m.extend_from_slice(&[0xC0, 0x0C]);
        m.extend_from_slice(&TYPE_A.to_be_bytes());
        m.extend_from_slice(&1u16.to_be_bytes());
        m.extend_from_slice(&60u32.to_be_bytes());
        m.extend_from_slice(&4u16.to_be_bytes());
        m.extend_from_slice(&[1, 2, 3, 4]);
        // additional: OPT, payload size 4096, DO set
        m.push(0); // root name
        m.extend_from_slice(&TYPE_OPT.to_be_bytes());
        m.extend_from_slice(&4096u16.to_be_bytes());
        m.extend_from_slice(&0x0000_8000u32.to_be_bytes());
        m.extend_from_slice(&0u16.to_be_bytes());
        m
    }

    fn dns_query() -> Vec<u8> {
        let mut m = Vec::new();
        m.extend_from_slice(&0x1234u16.to_be_bytes());
        m.extend_from_slice(&0x0100u16.to_be_bytes()); // RD
        m.extend_from_slice(&1u16.to_be_bytes());
        m.extend_from_slice(&0u16.to_be_bytes());
        m.extend_from_slice(&0u16.to_be_bytes());
        m.extend_from_slice(&0u16.to_be_bytes());
        m.extend_from_slice(b"\x07example\x03com\x00");
        m.extend_from_slice(&TYPE_A.to_be_bytes());
        m.extend_from_slice(&1u16.to_be_bytes());
        m
    }

    #[test]
    fn core_dns_parses_query() {
        let msg = parse_dns(&dns_query(), false).unwrap();
        assert!(!msg.is_response);
        assert_eq!(msg.id, 0x1234);
        let q = msg.question.unwrap();
        assert_eq!(q.name, "example.com");
        assert_eq!(q.qtype, TYPE_A);
        assert_eq!(q.qclass, 1);
    }

    #[test]
    fn core_dns_parses_response_with_opt() {
        let msg = parse_dns(&dns_response(), false).unwrap();
        assert!(msg.is_response);
        assert_eq!(msg.answer_count, 1);
        let answer = &msg.answers[0];
        assert_eq!(answer.name, "example.com");
        assert_eq!(answer.rtype, TYPE_A);
        assert_eq!(answer.ttl, 60);
        assert_eq!(answer.rdata, vec![1, 2, 3, 4]);
        assert_eq!(msg.opt, Some((4096, 1)));
    }

    #[test]
    fn core_dns_tcp_length_prefix() {
        let inner = dns_query();
        let mut framed = (inner.len() as u16).to_be_bytes().to_vec();
        framed.extend_from_slice(&inner);
        let msg = parse_dns(&framed, true).unwrap();
        assert_eq!(msg.question.unwrap().name, "example.com");
    }

    #[test]
    fn core_dns_rejects_label_loop() {
        let mut m = dns_query();
        // question name replaced by a self-pointing compression pointer
        m.truncate(12);
        m.extend_from_slice(&[0xC0, 0x0C]);
        m.extend_from_slice(&TYPE_A.to_be_bytes());
        m.extend_from_slice(&1u16.to_be_bytes());
        assert!(parse_dns(&m, false).is_none());
    }

    #[test]
    fn core_dns_ipfix_layout() {
        let mut ext = DnsExt::default();
        ext.qname = "example.com".into();
        ext.rdata = vec![1, 2, 3, 4];
        ext.answers = 1;
        ext.id = 7;

        let mut buf = [0u8; 256];
        let n = ext.fill_ipfix(&mut buf).unwrap();
        assert_eq!(n, 20 + 11 + 4);
        assert_eq!(BigEndian::read_u16(&buf[0..2]), 1);
        assert_eq!(buf[18] as usize, 11);
        assert_eq!(&buf[19..30], b"example.com");
        assert_eq!(buf[30], 4);
    }
}
