//! Types for parsing packet-level network protocols.
//!
//! Every type in [`packet`] is a zero-copy view over a captured frame: a
//! borrowed byte slice plus typed accessors that decode fields with explicit
//! byte-order reads. Views validate their fixed-header length once at parse
//! time and never read past the captured buffer.

pub mod packet;
