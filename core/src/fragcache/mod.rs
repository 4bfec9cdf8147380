//! Fragment reassembly cache.
//!
//! Later IP fragments arrive without an L4 header, so their transport ports
//! cannot be parsed. The cache remembers `(ip version, VLAN, fragment id,
//! src IP, dst IP) -> (src port, dst port, timestamp)` from each first
//! fragment and imputes the ports into later fragments of the same datagram.
//!
//! The table is a fixed array of small FIFO rings: pushing into a full
//! bucket overwrites the oldest entry, and lookups scan newest-first so the
//! most recently inserted match wins. Entries older than the timeout are
//! treated as absent.

use crate::parser::packet::Packet;
use crate::utils::Timeval;

use std::net::IpAddr;

use xxhash_rust::xxh64::xxh64;

/// Default number of buckets; prime for better key spread.
pub const DEFAULT_BUCKET_COUNT: usize = 10007;

/// Entries per bucket; must be a power of two.
const BUCKET_SIZE: usize = 1 << 2;

/// Default entry timeout.
pub const DEFAULT_TIMEOUT: Timeval = Timeval::new(3, 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FragKey {
    ipv: u8,
    vlan_id: u16,
    frag_id: u32,
    src_ip: IpAddr,
    dst_ip: IpAddr,
}

impl FragKey {
    fn from_packet(pkt: &Packet) -> Self {
        FragKey {
            ipv: pkt.ip_version,
            vlan_id: pkt.vlan_id,
            frag_id: pkt.frag_id,
            src_ip: pkt.src_ip,
            dst_ip: pkt.dst_ip,
        }
    }

    fn hash(&self) -> u64 {
        let mut bytes = [0u8; 40];
        bytes[0] = self.ipv;
        bytes[2..4].copy_from_slice(&self.vlan_id.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.frag_id.to_le_bytes());
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

#[derive(Debug, Clone, Copy)]
struct FragValue {
    src_port: u16,
    dst_port: u16,
    ts: Timeval,
}

#[derive(Debug, Clone, Copy)]
struct Item {
    key: FragKey,
    value: FragValue,
}

/// Fixed-size circular buffer with FIFO overwrite.
struct Bucket {
    read: usize,
    count: usize,
    buffer: [Option<Item>; BUCKET_SIZE],
}

impl Bucket {
    fn new() -> Self {
        Bucket {
            read: 0,
            count: 0,
            buffer: [None; BUCKET_SIZE],
        }
    }

    #[inline]
    fn mod_size(v: usize) -> usize {
        v & (BUCKET_SIZE - 1)
    }

    fn push(&mut self, item: Item) {
        self.buffer[Self::mod_size(self.read + self.count)] = Some(item);
        if self.count == BUCKET_SIZE {
            self.read = Self::mod_size(self.read + 1);
        } else {
            self.count += 1;
        }
    }

    /// Newest-first scan; the first key match wins.
    fn get(&self, key: &FragKey) -> Option<&FragValue> {
        let mut n = self.count;
        while n > 0 {
            n -= 1;
            if let Some(item) = &self.buffer[Self::mod_size(self.read + n)] {
                if item.key == *key {
                    return Some(&item.value);
                }
            }
        }
        None
    }
}

/// Counters kept by the fragment cache.
#[derive(Debug, Default, Clone, Copy)]
pub struct FragCacheStats {
    /// Packets that were not fragmented at all.
    pub not_fragmented: u64,
    /// Datagrams whose first fragment was seen.
    pub fragmented: u64,
    /// Total fragments across all fragmented datagrams.
    pub fragments: u64,
    /// Later fragments with no usable first-fragment entry.
    pub unmatched_fragments: u64,
}

/// The fragment cache.
pub struct FragmentCache {
    buckets: Vec<Bucket>,
    timeout: Timeval,
    pub stats: FragCacheStats,
}

impl FragmentCache {
    pub fn new(bucket_count: usize, timeout: Timeval) -> Self {
        FragmentCache {
            buckets: (0..bucket_count).map(|_| Bucket::new()).collect(),
            timeout,
            stats: FragCacheStats::default(),
        }
    }

    /// Examines `pkt` for fragmentation and returns `true` if it is a
    /// fragment.
    ///
    /// The first fragment (`frag_off == 0 && more_fragments`) is cached;
    /// later fragments get `src_port`/`dst_port` filled in from the cache
    /// when a first-fragment entry exists within the timeout.
    pub fn cache_packet(&mut self, pkt: &mut Packet) -> bool {
        if pkt.frag_off == 0 {
            if !pkt.more_fragments {
                self.stats.not_fragmented += 1;
                return false;
            }
            self.stats.fragmented += 1;
            self.stats.fragments += 1;
            self.add_packet(pkt);
            return true;
        }

        self.stats.fragments += 1;
        if !self.fill_info(pkt) {
            self.stats.unmatched_fragments += 1;
        }
        true
    }

    fn bucket_index(&self, key: &FragKey) -> usize {
        (key.hash() % self.buckets.len() as u64) as usize
    }

    fn add_packet(&mut self, pkt: &Packet) {
        let key = FragKey::from_packet(pkt);
        let value = FragValue {
            src_port: pkt.src_port,
            dst_port: pkt.dst_port,
            ts: pkt.ts,
        };
        let index = self.bucket_index(&key);
        self.buckets[index].push(Item { key, value });
    }

    fn fill_info(&self, pkt: &mut Packet) -> bool {
        let key = FragKey::from_packet(pkt);
        let index = self.bucket_index(&key);
        match self.buckets[index].get(&key) {
            Some(value) if pkt.ts - value.ts < self.timeout => {
                pkt.src_port = value.src_port;
                pkt.dst_port = value.dst_port;
                true
            }
            _ => false,
        }
    }
}

impl Default for FragmentCache {
    fn default() -> Self {
        FragmentCache::new(DEFAULT_BUCKET_COUNT, DEFAULT_TIMEOUT)
    }
}
