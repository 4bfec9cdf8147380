//! IPFIX template field descriptors.

/// Marker length for variable-length information elements.
pub const VAR_LEN: u16 = 0xFFFF;

/// IANA-registered information elements carry no enterprise number.
pub const IANA_PEN: u32 = 0;

/// Cesnet private enterprise number, used for vendor fields and basic
/// lists.
pub const CESNET_PEN: u32 = 8057;

/// IANA "reverse information element" private enterprise number
/// (RFC 5103).
pub const REVERSE_PEN: u32 = 29305;

/// One ordered field of an IPFIX template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplateField {
    /// Private enterprise number; `0` for IANA elements.
    pub pen: u32,
    /// Information element identifier (without the enterprise bit).
    pub id: u16,
    /// Field length in bytes, or [`VAR_LEN`].
    pub len: u16,
}

/// Shorthand constructor used by the static template tables.
pub const fn field(pen: u32, id: u16, len: u16) -> TemplateField {
    TemplateField { pen, id, len }
}

// IANA information element IDs used by the base flow record.
pub const IE_OCTET_DELTA_COUNT: u16 = 1;
pub const IE_PACKET_DELTA_COUNT: u16 = 2;
pub const IE_PROTOCOL_IDENTIFIER: u16 = 4;
pub const IE_TCP_CONTROL_BITS: u16 = 6;
pub const IE_SOURCE_TRANSPORT_PORT: u16 = 7;
pub const IE_SOURCE_IPV4_ADDRESS: u16 = 8;
pub const IE_DESTINATION_TRANSPORT_PORT: u16 = 11;
pub const IE_DESTINATION_IPV4_ADDRESS: u16 = 12;
pub const IE_SOURCE_IPV6_ADDRESS: u16 = 27;
pub const IE_DESTINATION_IPV6_ADDRESS: u16 = 28;
pub const IE_VLAN_ID: u16 = 58;
pub const IE_SOURCE_MAC: u16 = 56;
pub const IE_DESTINATION_MAC: u16 = 80;
pub const IE_FLOW_START_MSEC: u16 = 152;
pub const IE_FLOW_END_MSEC: u16 = 153;

/// Base template for IPv4 flows; every data record starts with these
/// fields in this order, followed by the contributing plugin extensions in
/// registration order.
pub const BASE_TEMPLATE_V4: &[TemplateField] = &[
    field(IANA_PEN, IE_OCTET_DELTA_COUNT, 8),
    field(REVERSE_PEN, IE_OCTET_DELTA_COUNT, 8),
    field(IANA_PEN, IE_PACKET_DELTA_COUNT, 8),
    field(REVERSE_PEN, IE_PACKET_DELTA_COUNT, 8),
    field(IANA_PEN, IE_FLOW_START_MSEC, 8),
    field(IANA_PEN, IE_FLOW_END_MSEC, 8),
    field(IANA_PEN, IE_PROTOCOL_IDENTIFIER, 1),
    field(IANA_PEN, IE_TCP_CONTROL_BITS, 1),
    field(REVERSE_PEN, IE_TCP_CONTROL_BITS, 1),
    field(IANA_PEN, IE_SOURCE_TRANSPORT_PORT, 2),
    field(IANA_PEN, IE_DESTINATION_TRANSPORT_PORT, 2),
    field(IANA_PEN, IE_SOURCE_IPV4_ADDRESS, 4),
    field(IANA_PEN, IE_DESTINATION_IPV4_ADDRESS, 4),
    field(IANA_PEN, IE_VLAN_ID, 2),
    field(IANA_PEN, IE_SOURCE_MAC, 6),
    field(IANA_PEN, IE_DESTINATION_MAC, 6),
];

/// Base template for IPv6 flows.
pub const BASE_TEMPLATE_V6: &[TemplateField] = &[
    field(IANA_PEN, IE_OCTET_DELTA_COUNT, 8),
    field(REVERSE_PEN, IE_OCTET_DELTA_COUNT, 8),
    field(IANA_PEN, IE_PACKET_DELTA_COUNT, 8),
    field(REVERSE_PEN, IE_PACKET_DELTA_COUNT, 8),
    field(IANA_PEN, IE_FLOW_START_MSEC, 8),
    field(IANA_PEN, IE_FLOW_END_MSEC, 8),
    field(IANA_PEN, IE_PROTOCOL_IDENTIFIER, 1),
    field(IANA_PEN, IE_TCP_CONTROL_BITS, 1),
    field(REVERSE_PEN, IE_TCP_CONTROL_BITS, 1),
    field(IANA_PEN, IE_SOURCE_TRANSPORT_PORT, 2),
    field(IANA_PEN, IE_DESTINATION_TRANSPORT_PORT, 2),
    field(IANA_PEN, IE_SOURCE_IPV6_ADDRESS, 16),
    field(IANA_PEN, IE_DESTINATION_IPV6_ADDRESS, 16),
    field(IANA_PEN, IE_VLAN_ID, 2),
    field(IANA_PEN, IE_SOURCE_MAC, 6),
    field(IANA_PEN, IE_DESTINATION_MAC, 6),
];

/// Fixed on-wire size of the base record.
pub const fn base_record_len(ip_version: u8) -> usize {
    match ip_version {
        6 => 8 * 4 + 8 * 2 + 3 + 2 * 2 + 16 * 2 + 2 + 6 * 2,
        _ => 8 * 4 + 8 * 2 + 3 + 2 * 2 + 4 * 2 + 2 + 6 * 2,
    }
}
