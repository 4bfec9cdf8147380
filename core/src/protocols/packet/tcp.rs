//! TCP header view and option walk.

use crate::protocols::packet::{PacketParseError, ParseResult};

use byteorder::{BigEndian, ByteOrder};

/// TCP assigned protocol number.
pub const TCP_PROTOCOL: u8 = 6;

// TCP flags.
pub const CWR: u8 = 0b1000_0000;
pub const ECE: u8 = 0b0100_0000;
pub const URG: u8 = 0b0010_0000;
pub const ACK: u8 = 0b0001_0000;
pub const PSH: u8 = 0b0000_1000;
pub const RST: u8 = 0b0000_0100;
pub const SYN: u8 = 0b0000_0010;
pub const FIN: u8 = 0b0000_0001;

/// Minimum TCP header size (data offset = 5).
pub const MIN_HDR_SIZE: usize = 20;

// TCP option kinds.
pub const OPT_END: u8 = 0;
pub const OPT_NOP: u8 = 1;
pub const OPT_MSS: u8 = 2;

/// A TCP header.
#[derive(Debug)]
pub struct Tcp<'a> {
    data: &'a [u8],
}

impl<'a> Tcp<'a> {
    /// Parses the header at the start of `data`, validating that the data
    /// offset fits within the captured bytes.
    pub fn parse(data: &'a [u8]) -> ParseResult<Self> {
        if data.len() < MIN_HDR_SIZE {
            return Err(PacketParseError::Truncated);
        }
        let v = Tcp { data };
        if v.data_offset() < 5 {
            return Err(PacketParseError::InvalidProtocol);
        }
        if v.header_len() > data.len() {
            return Err(PacketParseError::Truncated);
        }
        Ok(v)
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

    /// Returns the sequence number.
    #[inline]
    pub fn seq_no(&self) -> u32 {
        BigEndian::read_u32(&self.data[4..8])
    }

    /// Returns the acknowledgment number.
    #[inline]
    pub fn ack_no(&self) -> u32 {
        BigEndian::read_u32(&self.data[8..12])
    }

    /// Returns the header length in 32-bit words.
    #[inline]
    pub fn data_offset(&self) -> u8 {
        (self.data[12] & 0xF0) >> 4
    }

    /// Returns the 8-bit TCP flags.
    #[inline]
    pub fn flags(&self) -> u8 {
        self.data[13]
    }

    /// Returns the receive window size.
    #[inline]
    pub fn window(&self) -> u16 {
        BigEndian::read_u16(&self.data[14..16])
    }

    /// Header length in bytes, options included.
    #[inline]
    pub fn header_len(&self) -> usize {
        (self.data_offset() as usize) << 2
    }

    /// Walks the option list, returning a bitmap of option kinds present
    /// (bit `k` set when option kind `k < 64` occurs) and the MSS value if
    /// an MSS option was found. The walk stops at End-of-Options, a
    /// malformed length, or the end of the header.
    pub fn options(&self) -> (u64, Option<u16>) {
        let mut kinds: u64 = 0;
        let mut mss = None;
        let opts = &self.data[MIN_HDR_SIZE..self.header_len()];
        let mut i = 0;
        while i < opts.len() {
            let kind = opts[i];
            if kind < 64 {
                kinds |= 1 << kind;
            }
            match kind {
                OPT_END => break,
                OPT_NOP => i += 1,
                _ => {
                    if i + 1 >= opts.len() {
                        break;
                    }
                    let len = opts[i + 1] as usize;
                    if len < 2 || i + len > opts.len() {
                        break;
                    }
                    if kind == OPT_MSS && len == 4 {
                        mss = Some(BigEndian::read_u16(&opts[i + 2..i + 4]));
                    }
                    i += len;
                }
            }
        }
        (kinds, mss)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_tcp_fields_and_options() {
        let mut h = vec![0u8; 28];
        BigEndian::write_u16(&mut h[0..2], 443);
        BigEndian::write_u16(&mut h[2..4], 51000);
        BigEndian::write_u32(&mut h[4..8], 1000);
        BigEndian::write_u32(&mut h[8..12], 2000);
        h[12] = 0x70; // data offset 7 -> 28 bytes
        h[13] = SYN | ACK;
        BigEndian::write_u16(&mut h[14..16], 65535);
        // options: MSS 1460, NOP, NOP, SACK-permitted (kind 4, len 2)
        h[20..24].copy_from_slice(&[OPT_MSS, 4, 0x05, 0xB4]);
        h[24] = OPT_NOP;
        h[25] = OPT_NOP;
        h[26] = 4;
        h[27] = 2;

        let tcp = Tcp::parse(&h).unwrap();
        assert_eq!(tcp.src_port(), 443);
        assert_eq!(tcp.dst_port(), 51000);
        assert_eq!(tcp.seq_no(), 1000);
        assert_eq!(tcp.ack_no(), 2000);
        assert_eq!(tcp.flags(), SYN | ACK);
        assert_eq!(tcp.window(), 65535);
        assert_eq!(tcp.header_len(), 28);

        let (kinds, mss) = tcp.options();
        assert_eq!(mss, Some(1460));
        assert_eq!(kinds, (1 << OPT_MSS) | (1 << OPT_NOP) | (1 << 4));
    }

    #[test]
    fn core_tcp_truncated_options() {
        let mut h = vec![0u8; 20];
        h[12] = 0x80; // claims 32-byte header, only 20 captured
        assert_eq!(Tcp::parse(&h).unwrap_err(), PacketParseError::Truncated);
    }
}
