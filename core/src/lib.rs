// #![warn(missing_docs)]

//! A flow meter for high speed network traffic on commodity hardware.
//!
//! Flowmeter consumes captured frames from an input stage, decodes L2-L4
//! headers into per-packet descriptors, aggregates packets into bidirectional
//! flows keyed on the 5-tuple plus VLAN context, enriches flows through a set
//! of process plugins, and emits completed flow records as IPFIX (RFC 7011)
//! messages over UDP or TCP.
//!
//! The crate is organized around a share-nothing worker model: each worker
//! owns its input queue, packet parser, fragment cache, flow cache, and
//! exporter output. Flows are sharded onto workers by the input stage
//! (symmetric RSS or equivalent), so no flow state is shared across threads.
//! Plugins are instanced per worker and hold no cross-worker state.

pub mod config;
pub mod export;
pub mod flowtable;
pub mod fragcache;
pub mod memory;
pub mod parser;
pub mod process;
pub mod protocols;
pub mod runtime;
pub mod telemetry;
pub mod utils;

pub use self::flowtable::flow::{Flow, FlowKey};
pub use self::flowtable::{ExportReason, FlowCache};
pub use self::memory::packet_block::{InputResult, PacketBlock, PacketSource};
pub use self::parser::packet::Packet;
pub use self::process::{FlowAction, PluginRegistry, ProcessPlugin};
pub use self::runtime::Runtime;
pub use self::utils::Timeval;
