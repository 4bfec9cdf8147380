//! Packet header views.
//!
//! The structure of this module follows the per-protocol file split used by
//! packet frameworks such as [pnet::packet](https://docs.rs/pnet/latest/pnet/packet/index.html):
//! one module per header type, each exposing a read-only view plus the
//! protocol's assigned numbers.

pub mod ethernet;
pub mod icmp;
pub mod ipv4;
pub mod ipv6;
pub mod tcp;
pub mod udp;

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PacketParseError {
    #[error("invalid protocol")]
    InvalidProtocol,

    #[error("header extends past captured data")]
    Truncated,
}

pub(crate) type ParseResult<T> = Result<T, PacketParseError>;
