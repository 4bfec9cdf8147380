//! UDP header view.

use crate::protocols::packet::{PacketParseError, ParseResult};

use byteorder::{BigEndian, ByteOrder};

/// UDP assigned protocol number.
pub const UDP_PROTOCOL: u8 = 17;

/// UDP header size.
pub const HDR_SIZE: usize = 8;

/// A UDP header.
#[derive(Debug)]
pub struct Udp<'a> {
    data: &'a [u8],
}

impl<'a> Udp<'a> {
    /// Parses the header at the start of `data`.
    pub fn parse(data: &'a [u8]) -> ParseResult<Self> {
        if data.len() < HDR_SIZE {
            return Err(PacketParseError::Truncated);
        }
        Ok(Udp { data })
    }

    /// Returns the sending port.
    #[inline]
    pub fn src_port(&self) -> u16 {
        BigEndian::read_u16(&self.data[0..2])
    }

    /// Returns the receiving port.
    #[inline]
    pub fn dst_port(&self) -> u16 {
        BigEndian::read_u16(&self.data[2..4])
    }

    /// Returns the datagram length, header included.
    #[inline]
    pub fn length(&self) -> u16 {
        BigEndian::read_u16(&self.data[4..6])
    }

    #[inline]
    pub fn header_len(&self) -> usize {
        HDR_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_udp_fields() {
        let mut h = vec![0u8; 8];
        BigEndian::write_u16(&mut h[0..2], 53);
        BigEndian::write_u16(&mut h[2..4], 33333);
        BigEndian::write_u16(&mut h[4..6], 120);
        let udp = Udp::parse(&h).unwrap();
        assert_eq!(udp.src_port(), 53);
        assert_eq!(udp.dst_port(), 33333);
        assert_eq!(udp.length(), 120);
        assert!(Udp::parse(&h[..7]).is_err());
    }
}
