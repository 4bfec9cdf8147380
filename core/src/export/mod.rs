//! Flow record output.
//!
//! The primary output is IPFIX over UDP or TCP ([`ipfix`]); a line-oriented
//! text form ([`text`]) exists for debugging. Both consume flows through
//! the [`FlowExporter`](crate::flowtable::FlowExporter) trait the flow
//! cache drives.

pub mod basiclist;
pub mod ipfix;
pub mod template;
pub mod text;
