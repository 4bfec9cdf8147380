//! Flow keys and flow records.

use crate::parser::packet::Packet;
use crate::process::{FlowExt, PluginId};
use crate::utils::Timeval;

use std::net::IpAddr;

use pnet::datalink::MacAddr;
use xxhash_rust::xxh64::xxh64;

/// The canonical 5-tuple plus VLAN context identifying a bidirectional flow.
///
/// The stored orientation is fixed by the first packet of the flow; reverse
/// packets are matched by looking up the swapped key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowKey {
    pub ip_version: u8,
    pub proto: u8,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub vlan_id: u16,
}

impl FlowKey {
    /// Builds the key in the packet's own orientation.
    pub fn from_packet(pkt: &Packet) -> Self {
        FlowKey {
            ip_version: pkt.ip_version,
            proto: pkt.ip_proto,
            src_ip: pkt.src_ip,
            dst_ip: pkt.dst_ip,
            src_port: pkt.src_port,
            dst_port: pkt.dst_port,
            vlan_id: pkt.vlan_id,
        }
    }

    /// The same flow seen from the opposite direction.
    pub fn reversed(&self) -> Self {
        FlowKey {
            ip_version: self.ip_version,
            proto: self.proto,
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
            vlan_id: self.vlan_id,
        }
    }

    /// 64-bit XXH fingerprint of this key orientation, used for bucket
    /// selection and quick slot comparison.
    pub fn fingerprint(&self) -> u64 {
        let mut bytes = [0u8; 40];
        bytes[0] = self.ip_version;
        bytes[1] = self.proto;
        bytes[2..4].copy_from_slice(&self.vlan_id.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.src_port.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.dst_port.to_le_bytes());
        write_ip(&mut bytes[8..24], self.src_ip);
        write_ip(&mut bytes[24..40], self.dst_ip);
        xxh64(&bytes, 0)
    }
}

fn write_ip(out: &mut [u8], ip: IpAddr) {
    match ip {
        IpAddr::V4(v4) => out[..4].copy_from_slice(&v4.octets()),
        IpAddr::V6(v6) => out[..16].copy_from_slice(&v6.octets()),
    }
}

/// A bidirectional flow record.
///
/// `src_*` counters reflect packets in the canonical direction (fixed by
/// the first packet and never flipped); `dst_*` the reverse. Extension
/// records are owned by the flow, indexed by plugin ID, and destroyed with
/// it.
#[derive(Debug)]
pub struct Flow {
    /// Key in canonical forward orientation.
    pub key: FlowKey,
    /// Fingerprint of the canonical key, stable across the flow's life.
    pub flow_hash: u64,

    pub time_first: Timeval,
    pub time_last: Timeval,

    pub src_packets: u32,
    pub dst_packets: u32,
    pub src_bytes: u64,
    pub dst_bytes: u64,

    pub src_tcp_flags: u8,
    pub dst_tcp_flags: u8,

    /// Source MAC of the first canonical-direction packet.
    pub src_mac: MacAddr,
    /// Source MAC of the first reverse-direction packet (the destination
    /// endpoint); taken from the first packet's destination MAC until a
    /// reverse packet is seen.
    pub dst_mac: MacAddr,
    dst_mac_filled: bool,

    exts: Vec<Option<Box<dyn FlowExt>>>,
    /// Plugins that declined further packets of this flow.
    no_data: u64,
}

impl Flow {
    /// Creates a flow from its first packet. The packet's orientation
    /// becomes the canonical direction.
    pub fn new(pkt: &Packet, fingerprint: u64) -> Self {
        let mut flow = Flow {
            key: FlowKey::from_packet(pkt),
            flow_hash: fingerprint,
            time_first: pkt.ts,
            time_last: pkt.ts,
            src_packets: 0,
            dst_packets: 0,
            src_bytes: 0,
            dst_bytes: 0,
            src_tcp_flags: 0,
            dst_tcp_flags: 0,
            src_mac: pkt.src_mac,
            dst_mac: pkt.dst_mac,
            dst_mac_filled: false,
            exts: Vec::new(),
            no_data: 0,
        };
        flow.update(pkt, true);
        flow
    }

    /// Applies one packet's accumulators. Counters never decrease.
    pub fn update(&mut self, pkt: &Packet, source_pkt: bool) {
        self.time_last = pkt.ts;
        if source_pkt {
            self.src_packets += 1;
            self.src_bytes += pkt.ip_len as u64;
            self.src_tcp_flags |= pkt.tcp_flags;
        } else {
            self.dst_packets += 1;
            self.dst_bytes += pkt.ip_len as u64;
            self.dst_tcp_flags |= pkt.tcp_flags;
            if !self.dst_mac_filled {
                self.dst_mac = pkt.src_mac;
                self.dst_mac_filled = true;
            }
        }
    }

    /// Total packets in both directions.
    #[inline]
    pub fn packets(&self) -> u32 {
        self.src_packets + self.dst_packets
    }

    /// Links `ext` onto the flow under plugin `id`, replacing any previous
    /// record with the same tag.
    ///
    /// Panics on an extension ID outside the registrable range; that is a
    /// plugin contract violation and aborts the worker.
    pub fn add_extension(&mut self, id: PluginId, ext: Box<dyn FlowExt>) {
        assert!(id < 64, "unknown extension ID {}", id);
        if self.exts.len() <= id {
            self.exts.resize_with(id + 1, || None);
        }
        self.exts[id] = Some(ext);
    }

    /// Removes (and destroys) the extension tagged `id`.
    pub fn remove_extension(&mut self, id: PluginId) {
        if let Some(slot) = self.exts.get_mut(id) {
            *slot = None;
        }
    }

    #[inline]
    pub fn has_extension(&self, id: PluginId) -> bool {
        matches!(self.exts.get(id), Some(Some(_)))
    }

    /// The extension tagged `id`, as the serialization trait.
    pub fn get_extension(&self, id: PluginId) -> Option<&dyn FlowExt> {
        self.exts.get(id).and_then(|e| e.as_deref())
    }

    /// Downcast accessor for a plugin's own record type.
    pub fn ext<T: 'static>(&self, id: PluginId) -> Option<&T> {
        self.get_extension(id).and_then(|e| e.as_any().downcast_ref())
    }

    /// Mutable downcast accessor for a plugin's own record type.
    pub fn ext_mut<T: 'static>(&mut self, id: PluginId) -> Option<&mut T> {
        self.exts
            .get_mut(id)
            .and_then(|e| e.as_deref_mut())
            .and_then(|e| e.as_any_mut().downcast_mut())
    }

    /// Bitmask of plugin IDs with a resident extension; selects the IPFIX
    /// template for this flow.
    pub fn extension_mask(&self) -> u64 {
        let mut mask = 0;
        for (id, ext) in self.exts.iter().enumerate() {
            if ext.is_some() {
                mask |= 1 << id;
            }
        }
        mask
    }

    /// Marks plugin `id` as declining further packets of this flow.
    #[inline]
    pub fn set_no_data(&mut self, id: PluginId) {
        self.no_data |= 1 << id;
    }

    #[inline]
    pub fn is_no_data(&self, id: PluginId) -> bool {
        self.no_data & (1 << id) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::Timeval;

    use std::any::Any;

    #[derive(Debug, Default)]
    struct TestExt(u32);

    impl FlowExt for TestExt {
        fn fill_ipfix(&self, _buf: &mut [u8]) -> Option<usize> {
            Some(0)
        }
        fn get_text(&self) -> String {
            String::new()
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn packet(src_port: u16, dst_port: u16, ts: Timeval) -> Packet<'static> {
        let mut pkt = Packet::unparsed(&[], 64, ts);
        pkt.ip_version = 4;
        pkt.ip_proto = 6;
        pkt.ip_len = 64;
        pkt.src_ip = "192.0.2.1".parse().unwrap();
        pkt.dst_ip = "192.0.2.2".parse().unwrap();
        pkt.src_port = src_port;
        pkt.dst_port = dst_port;
        pkt
    }

    #[test]
    fn core_key_symmetry() {
        let pkt = packet(1000, 80, Timeval::new(1, 0));
        let key = FlowKey::from_packet(&pkt);
        assert_eq!(key.reversed().reversed(), key);
        assert_ne!(key.fingerprint(), key.reversed().fingerprint());
    }

    #[test]
    fn core_flow_counters_split_by_direction() {
        let first = packet(1000, 80, Timeval::new(1, 0));
        let mut flow = Flow::new(&first, FlowKey::from_packet(&first).fingerprint());
        assert_eq!((flow.src_packets, flow.dst_packets), (1, 0));

        flow.update(&packet(80, 1000, Timeval::new(2, 0)), false);
        assert_eq!((flow.src_packets, flow.dst_packets), (1, 1));
        assert_eq!(flow.src_bytes, 64);
        assert_eq!(flow.dst_bytes, 64);
        assert!(flow.time_first <= flow.time_last);
    }

    #[test]
    fn core_flow_extension_slots() {
        let pkt = packet(1, 2, Timeval::new(1, 0));
        let mut flow = Flow::new(&pkt, 0);
        assert!(!flow.has_extension(3));

        flow.add_extension(3, Box::new(TestExt(7)));
        assert!(flow.has_extension(3));
        assert_eq!(flow.ext::<TestExt>(3).unwrap().0, 7);
        assert_eq!(flow.extension_mask(), 1 << 3);

        flow.ext_mut::<TestExt>(3).unwrap().0 = 9;
        assert_eq!(flow.ext::<TestExt>(3).unwrap().0, 9);

        flow.remove_extension(3);
        assert!(!flow.has_extension(3));
        assert_eq!(flow.extension_mask(), 0);
    }
}
