//! The input contract between packet sources and the meter core.

use crate::utils::Timeval;

use anyhow::Result;

/// Default number of packet slots in a block.
pub const DEFAULT_BLOCK_SIZE: usize = 32;

/// Default per-slot buffer capacity in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 1600;

/// Link layer of a captured frame, as reported by the capture API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datalink {
    /// Ethernet II (`DLT_EN10MB`).
    En10mb,
    /// Linux cooked capture (`DLT_LINUX_SLL`): 16-byte pseudo header.
    LinuxSll,
    /// Raw IP: first nibble selects IPv4 or IPv6.
    Raw,
}

/// Result of one input poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputResult {
    /// At least one packet was written into the block.
    Parsed,
    /// The source produced data the core cannot use; the block is empty.
    NotParsed,
    /// No data arrived within the source's poll interval.
    Timeout,
    /// The source is exhausted (end of capture file).
    Eof,
}

/// One fixed-capacity packet slot.
///
/// The input writes raw bytes into `buffer` and records the on-wire length
/// (which may exceed the captured length when the capture was truncated by
/// the snap length).
#[derive(Debug)]
pub struct PacketSlot {
    buffer: Vec<u8>,
    /// Bytes of `buffer` that hold captured data.
    pub captured_len: usize,
    /// Frame length on the wire.
    pub wire_len: usize,
    /// Capture timestamp.
    pub ts: Timeval,
    /// Link layer of this frame.
    pub datalink: Datalink,
}

impl PacketSlot {
    fn new(buffer_size: usize) -> Self {
        PacketSlot {
            buffer: vec![0; buffer_size],
            captured_len: 0,
            wire_len: 0,
            ts: Timeval::default(),
            datalink: Datalink::En10mb,
        }
    }

    /// Slot buffer capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Captured frame bytes.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.captured_len]
    }

    /// Copies `frame` into the slot, truncating to the buffer capacity, and
    /// records lengths and metadata.
    pub fn fill(&mut self, frame: &[u8], wire_len: usize, ts: Timeval, datalink: Datalink) {
        let n = frame.len().min(self.buffer.len());
        self.buffer[..n].copy_from_slice(&frame[..n]);
        self.captured_len = n;
        self.wire_len = wire_len;
        self.ts = ts;
        self.datalink = datalink;
    }
}

/// A burst of captured packets handed from the input stage to a worker.
///
/// The block owns its slot buffers; parsers borrow slot data for the
/// duration of one pipeline pass and must not retain references past it.
#[derive(Debug)]
pub struct PacketBlock {
    slots: Vec<PacketSlot>,
    /// Number of valid slots, `0..=slots.len()`.
    pub count: usize,
}

impl PacketBlock {
    /// Creates a block of `block_size` slots of `buffer_size` bytes each.
    pub fn new(block_size: usize, buffer_size: usize) -> Self {
        PacketBlock {
            slots: (0..block_size).map(|_| PacketSlot::new(buffer_size)).collect(),
            count: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Valid slots of the block.
    #[inline]
    pub fn slots(&self) -> &[PacketSlot] {
        &self.slots[..self.count]
    }

    /// Resets the block for the next input burst.
    #[inline]
    pub fn clear(&mut self) {
        self.count = 0;
    }

    /// Returns the next free slot for the input to fill, or `None` if the
    /// block is full. The caller commits the slot by incrementing `count`.
    #[inline]
    pub fn next_free(&mut self) -> Option<&mut PacketSlot> {
        let idx = self.count;
        self.slots.get_mut(idx)
    }

    /// Appends a frame to the block. Convenience for sources that copy.
    pub fn push(&mut self, frame: &[u8], wire_len: usize, ts: Timeval, datalink: Datalink) -> bool {
        let idx = self.count;
        match self.slots.get_mut(idx) {
            Some(slot) => {
                slot.fill(frame, wire_len, ts, datalink);
                self.count += 1;
                true
            }
            None => false,
        }
    }
}

impl Default for PacketBlock {
    fn default() -> Self {
        PacketBlock::new(DEFAULT_BLOCK_SIZE, DEFAULT_BUFFER_SIZE)
    }
}

/// A source of packet blocks.
///
/// Implemented by the embedding application (pcap reader, AF_PACKET socket,
/// DPDK ring, ...). Each worker owns exactly one source; `next_block` blocks
/// until data or a poll timeout.
pub trait PacketSource: Send {
    /// Fills `block` with the next burst of packets.
    fn next_block(&mut self, block: &mut PacketBlock) -> Result<InputResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_block_fill_and_truncate() {
        let mut block = PacketBlock::new(2, 8);
        assert!(block.push(&[1; 20], 20, Timeval::new(1, 0), Datalink::En10mb));
        assert!(block.push(&[2; 4], 4, Timeval::new(1, 1), Datalink::Raw));
        assert!(!block.push(&[3; 4], 4, Timeval::new(1, 2), Datalink::Raw));

        let slots = block.slots();
        assert_eq!(slots.len(), 2);
        // captured length never exceeds the slot capacity
        assert_eq!(slots[0].captured_len, 8);
        assert_eq!(slots[0].wire_len, 20);
        assert_eq!(slots[1].data(), &[2; 4]);

        block.clear();
        assert_eq!(block.slots().len(), 0);
    }
}
