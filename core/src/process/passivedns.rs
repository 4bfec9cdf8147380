//! Passive DNS collection: A, AAAA and PTR answers.
//!
//! Keeps the last interpreted answer of a DNS response, resolving PTR names
//! back into addresses by undoing the `in-addr.arpa` / `ip6.arpa`
//! encodings. One parsed response completes the flow.

use crate::export::template::{field, TemplateField, CESNET_PEN, VAR_LEN};
use crate::flowtable::flow::Flow;
use crate::parser::packet::Packet;
use crate::process::dns::{parse_dns, DNS_PORT, TYPE_A, TYPE_AAAA, TYPE_PTR};
use crate::process::{FlowAction, FlowExt, PluginId, ProcessPlugin};
use crate::protocols::packet::tcp::TCP_PROTOCOL;

use std::any::Any;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use byteorder::{BigEndian, ByteOrder};

/// Longest stored record name.
const MAX_NAME: usize = 128;

const TEMPLATE: &[TemplateField] = &[
    field(CESNET_PEN, 1056, 2),       // DNS_ID
    field(CESNET_PEN, 1057, 2),       // DNS_ATYPE
    field(CESNET_PEN, 1058, 4),       // DNS_RR_TTL
    field(CESNET_PEN, 1059, VAR_LEN), // DNS_IP
    field(CESNET_PEN, 1064, VAR_LEN), // DNS_NAME
];

/// Reverses an `in-addr.arpa` / `ip6.arpa` PTR name into the address it
/// describes.
pub(crate) fn ip_from_ptr_name(name: &str) -> Option<IpAddr> {
    let name = name.to_ascii_lowercase();
    let name = name.strip_suffix('.').unwrap_or(&name);

    if let Some(prefix) = name.strip_suffix(".in-addr.arpa") {
        let mut octets: Vec<u8> = Vec::with_capacity(4);
        for part in prefix.split('.') {
            octets.push(part.parse().ok()?);
        }
        if octets.len() != 4 {
            return None;
        }
        return Some(IpAddr::V4(Ipv4Addr::new(
            octets[3], octets[2], octets[1], octets[0],
        )));
    }

    if let Some(prefix) = name.strip_suffix(".ip6.arpa") {
        // 32 reversed nibbles separated by dots
        let mut nibbles: Vec<u8> = Vec::with_capacity(32);
        for part in prefix.split('.') {
            if part.len() != 1 {
                return None;
            }
            nibbles.push(u8::from_str_radix(part, 16).ok()?);
        }
        if nibbles.len() != 32 {
            return None;
        }
        let mut addr = [0u8; 16];
        for (i, pair) in nibbles.rchunks(2).enumerate() {
            // reversed order: the last nibble is the most significant
            addr[i] = (pair[1] << 4) | pair[0];
        }
        return Some(IpAddr::V6(Ipv6Addr::from(addr)));
    }

    None
}

/// Per-flow passive DNS record.
#[derive(Debug, Default)]
pub struct PassiveDnsExt {
    pub id: u16,
    pub atype: u16,
    pub name: String,
    pub rr_ttl: u32,
    pub ip: Option<IpAddr>,
}

impl FlowExt for PassiveDnsExt {
    fn fill_ipfix(&self, buf: &mut [u8]) -> Option<usize> {
        let name = self.name.as_bytes();
        let ip_len = match self.ip {
            Some(IpAddr::V4(_)) => 4,
            Some(IpAddr::V6(_)) => 16,
            None => 0,
        };
        let need = 2 + 2 + 4 + 1 + ip_len + 1 + name.len();
        if buf.len() < need {
            return None;
        }
        BigEndian::write_u16(&mut buf[0..2], self.id);
        BigEndian::write_u16(&mut buf[2..4], self.atype);
        BigEndian::write_u32(&mut buf[4..8], self.rr_ttl);
        let mut off = 8;
        buf[off] = ip_len as u8;
        off += 1;
        match self.ip {
            Some(IpAddr::V4(v4)) => buf[off..off + 4].copy_from_slice(&v4.octets()),
            Some(IpAddr::V6(v6)) => buf[off..off + 16].copy_from_slice(&v6.octets()),
            None => {}
        }
        off += ip_len;
        buf[off] = name.len() as u8;
        buf[off + 1..off + 1 + name.len()].copy_from_slice(name);
        Some(need)
    }

    fn get_text(&self) -> String {
        format!(
            "dnsid={},atype={},aname=\"{}\",rrttl={},ip={}",
            self.id,
            self.atype,
            self.name,
            self.rr_ttl,
            self.ip.map(|ip| ip.to_string()).unwrap_or_default()
        )
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub struct PassiveDnsPlugin {
    id: PluginId,
    parsed: u64,
}

impl PassiveDnsPlugin {
    pub fn new(id: PluginId) -> Self {
        PassiveDnsPlugin { id, parsed: 0 }
    }

    /// Parses a response packet into `ext`; returns `true` on success.
    fn process(&mut self, ext: &mut PassiveDnsExt, pkt: &Packet) -> bool {
        let tcp = pkt.ip_proto == TCP_PROTOCOL;
        let msg = match parse_dns(pkt.payload, tcp) {
            Some(msg) if msg.is_response => msg,
            _ => return false,
        };
        ext.id = msg.id;
        for answer in &msg.answers {
            match answer.rtype {
                TYPE_A | TYPE_AAAA | TYPE_PTR => {
                    ext.name = answer.name.chars().take(MAX_NAME).collect();
                    ext.rr_ttl = answer.ttl;
                    ext.atype = answer.rtype;
                }
                _ => continue,
            }
            match answer.rtype {
                TYPE_A if answer.rdata.len() == 4 => {
                    let mut a = [0u8; 4];
                    a.copy_from_slice(&answer.rdata);
                    ext.ip = Some(IpAddr::V4(Ipv4Addr::from(a)));
                }
                TYPE_AAAA if answer.rdata.len() == 16 => {
                    let mut a = [0u8; 16];
                    a.copy_from_slice(&answer.rdata);
                    ext.ip = Some(IpAddr::V6(Ipv6Addr::from(a)));
                }
                TYPE_PTR => {
                    if let Some(ip) = ip_from_ptr_name(&answer.name) {
                        ext.ip = Some(ip);
                    }
                }
                _ => {}
            }
        }
        self.parsed += 1;
        true
    }
}

impl ProcessPlugin for PassiveDnsPlugin {
    fn name(&self) -> &'static str {
        "passivedns"
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
        let mut ext = PassiveDnsExt::default();
        if pkt.src_port == DNS_PORT {
            self.process(&mut ext, pkt);
        }
        flow.add_extension(self.id, Box::new(ext));
        FlowAction::Continue
    }

    fn post_update(&mut self, flow: &mut Flow, pkt: &Packet) -> FlowAction {
        // only the server side carries answers
        if pkt.src_port != DNS_PORT {
            return FlowAction::Continue;
        }
        let mut done = false;
        if let Some(ext) = flow.ext_mut::<PassiveDnsExt>(self.id) {
            done = self.process(ext, pkt);
        }
        if done {
            // one matched response completes the flow
            FlowAction::Flush
        } else {
            FlowAction::Continue
        }
    }

    fn finish(&mut self, print_stats: bool) {
        if print_stats {
            log::info!("passivedns plugin stats: parsed responses {}", self.parsed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_passivedns_ptr_ipv4() {
        assert_eq!(
            ip_from_ptr_name("4.3.2.1.in-addr.arpa"),
            Some("1.2.3.4".parse().unwrap())
        );
        assert_eq!(
            ip_from_ptr_name("4.3.2.1.IN-ADDR.ARPA."),
            Some("1.2.3.4".parse().unwrap())
        );
        assert_eq!(ip_from_ptr_name("3.2.1.in-addr.arpa"), None);
        assert_eq!(ip_from_ptr_name("example.com"), None);
    }

    #[test]
    fn core_passivedns_ptr_ipv6() {
        // 2001:db8::1
        let name = "1.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.8.b.d.0.1.0.0.2.ip6.arpa";
        assert_eq!(ip_from_ptr_name(name), Some("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn core_passivedns_stores_a_record() {
        let payload = crate::process::dns::tests::dns_response();
        let mut plugin = PassiveDnsPlugin::new(0);
        let mut ext = PassiveDnsExt::default();
        let mut pkt = Packet::unparsed(&payload, payload.len(), crate::utils::Timeval::new(1, 0));
        pkt.ip_version = 4;
        pkt.ip_proto = 17;
        pkt.payload = &payload;
        assert!(plugin.process(&mut ext, &pkt));
        assert_eq!(ext.atype, TYPE_A);
        assert_eq!(ext.name, "example.com");
        assert_eq!(ext.ip, Some("1.2.3.4".parse().unwrap()));
    }
}
