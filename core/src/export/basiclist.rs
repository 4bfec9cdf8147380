//! IPFIX basic-list encoding (RFC 6313).
//!
//! Lists of primitives inside a single record use the basicList construct:
//! `0xFF | length(u16) | semantic=0x03 | field_id(u16, enterprise bit set) |
//! element_len(u16) | enterprise_number(u32) | elements`, everything in
//! network byte order.

use crate::export::template::CESNET_PEN;
use crate::utils::Timeval;

use byteorder::{BigEndian, ByteOrder};

/// Variable-length flag byte: the list length is carried in the following
/// 16-bit field.
const FLAG: u8 = 255;

/// "allOf" list semantic.
const SEMANTIC: u8 = 3;

/// Size of the basicList header counted by the embedded length field.
pub const HDR_SIZE: usize = 9;

/// Total on-wire overhead of one basic list (flag + length + header).
pub const RECORD_HDR_SIZE: usize = 12;

/// Encodes basic lists under one enterprise number.
#[derive(Debug, Clone, Copy)]
pub struct IpfixBasicList {
    pub enterprise_num: u32,
}

impl Default for IpfixBasicList {
    fn default() -> Self {
        IpfixBasicList {
            enterprise_num: CESNET_PEN,
        }
    }
}

impl IpfixBasicList {
    /// On-wire size of a list of `count` elements of `element_len` bytes.
    pub const fn list_size(count: usize, element_len: usize) -> usize {
        RECORD_HDR_SIZE + count * element_len
    }

    fn fill_header(
        &self,
        buf: &mut [u8],
        count: usize,
        element_len: usize,
        field_id: u16,
    ) -> Option<usize> {
        if buf.len() < Self::list_size(count, element_len) {
            return None;
        }
        buf[0] = FLAG;
        BigEndian::write_u16(&mut buf[1..3], (HDR_SIZE + count * element_len) as u16);
        buf[3] = SEMANTIC;
        BigEndian::write_u16(&mut buf[4..6], (1 << 15) | field_id);
        BigEndian::write_u16(&mut buf[6..8], element_len as u16);
        BigEndian::write_u32(&mut buf[8..12], self.enterprise_num);
        Some(RECORD_HDR_SIZE)
    }

    /// Writes a list of `u16` values; returns the bytes written or `None`
    /// when `buf` is too small.
    pub fn fill_u16(&self, buf: &mut [u8], values: &[u16], field_id: u16) -> Option<usize> {
        let mut off = self.fill_header(buf, values.len(), 2, field_id)?;
        for v in values {
            BigEndian::write_u16(&mut buf[off..off + 2], *v);
            off += 2;
        }
        Some(off)
    }

    /// Writes a list of `u32` values.
    pub fn fill_u32(&self, buf: &mut [u8], values: &[u32], field_id: u16) -> Option<usize> {
        let mut off = self.fill_header(buf, values.len(), 4, field_id)?;
        for v in values {
            BigEndian::write_u32(&mut buf[off..off + 4], *v);
            off += 4;
        }
        Some(off)
    }

    /// Writes a list of `u8` values.
    pub fn fill_u8(&self, buf: &mut [u8], values: &[u8], field_id: u16) -> Option<usize> {
        let off = self.fill_header(buf, values.len(), 1, field_id)?;
        buf[off..off + values.len()].copy_from_slice(values);
        Some(off + values.len())
    }

    /// Writes a list of `i8` values.
    pub fn fill_i8(&self, buf: &mut [u8], values: &[i8], field_id: u16) -> Option<usize> {
        let off = self.fill_header(buf, values.len(), 1, field_id)?;
        for (dst, v) in buf[off..off + values.len()].iter_mut().zip(values) {
            *dst = *v as u8;
        }
        Some(off + values.len())
    }

    /// Writes timestamps as 64-bit milliseconds since the epoch.
    pub fn fill_timevals(&self, buf: &mut [u8], values: &[Timeval], field_id: u16) -> Option<usize> {
        let mut off = self.fill_header(buf, values.len(), 8, field_id)?;
        for v in values {
            BigEndian::write_u64(&mut buf[off..off + 8], v.as_millis());
            off += 8;
        }
        Some(off)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_basiclist_u16_layout() {
        let list = IpfixBasicList::default();
        let values = [1u16, 2, 0xBEEF];
        let mut buf = [0u8; 64];
        let n = list.fill_u16(&mut buf, &values, 1013).unwrap();

        assert_eq!(n, RECORD_HDR_SIZE + 2 * values.len());
        assert_eq!(buf[0], 0xFF);
        assert_eq!(
            BigEndian::read_u16(&buf[1..3]) as usize,
            HDR_SIZE + 2 * values.len()
        );
        assert_eq!(buf[3], 3);
        assert_eq!(BigEndian::read_u16(&buf[4..6]), (1 << 15) | 1013);
        assert_eq!(BigEndian::read_u16(&buf[6..8]), 2);
        assert_eq!(BigEndian::read_u32(&buf[8..12]), CESNET_PEN);
        assert_eq!(BigEndian::read_u16(&buf[12..14]), 1);
        assert_eq!(BigEndian::read_u16(&buf[16..18]), 0xBEEF);
    }

    #[test]
    fn core_basiclist_no_room() {
        let list = IpfixBasicList::default();
        let mut buf = [0u8; 13];
        assert!(list.fill_u16(&mut buf, &[1, 2], 1013).is_none());
    }

    #[test]
    fn core_basiclist_timestamps_in_ms() {
        let list = IpfixBasicList::default();
        let mut buf = [0u8; 32];
        let n = list
            .fill_timevals(&mut buf, &[Timeval::new(2, 3000)], 1014)
            .unwrap();
        assert_eq!(n, RECORD_HDR_SIZE + 8);
        assert_eq!(BigEndian::read_u64(&buf[12..20]), 2003);
    }
}
