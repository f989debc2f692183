//! Module containing network level header structs for pieces of the protocol
//!
//! Every struct here maps byte-for-byte onto the wire encoding defined by
//! RFC 7296 (and RFC 7383 for the fragment header); parsing is a
//! [zerocopy] reinterpretation of a prefix of the receive buffer.

use zerocopy::network_endian::{U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::params::{FLAG_INITIATOR, FLAG_PAYLOAD_CRITICAL, FLAG_RESPONSE};

/// The fixed 28-octet IKE header starting every message
///
/// ```text
///                          1                   2                   3
///      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                       IKE SA Initiator's SPI                  |
///     |                                                               |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                       IKE SA Responder's SPI                  |
///     |                                                               |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |  Next Payload | MjVer | MnVer | Exchange Type |     Flags     |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                          Message ID                           |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                            Length                             |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone, PartialEq)]
#[repr(C, packed)]
pub struct Header {
    /// SPI chosen by the original initiator; never zero
    pub initiator_spi: U64,
    /// SPI chosen by the responder; zero in the first message of an
    /// initial exchange (including repeats carrying a cookie)
    pub responder_spi: U64,
    /// Type of the first payload following this header
    pub next_payload: u8,
    /// Major and minor version in 4 bits each, 0x20 for IKEv2
    pub version: u8,
    /// Type of the exchange this message belongs to
    pub exchange_type: u8,
    /// Flag bits, see [FLAG_INITIATOR], [crate::params::FLAG_VERSION]
    /// and [FLAG_RESPONSE]
    pub flags: u8,
    /// Sequence number of this message within the SA
    pub message_id: U32,
    /// Length in octets of the whole message including this header
    pub length: U32,
}

impl Header {
    /// Whether the sender claims to be the original initiator of the SA
    pub fn sent_by_initiator(&self) -> bool {
        self.flags & FLAG_INITIATOR == FLAG_INITIATOR
    }

    /// Whether this message is a response
    pub fn is_response(&self) -> bool {
        self.flags & FLAG_RESPONSE == FLAG_RESPONSE
    }
}

/// The generic header starting every payload
///
/// ```text
///                          1                   2                   3
///      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     | Next Payload  |C|  RESERVED   |         Payload Length        |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// For the Encrypted payload the Next Payload field names the first
/// payload *inside* the ciphertext rather than a following outer payload.
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct GenericPayloadHeader {
    /// Type of the next payload in the chain
    pub next_payload: u8,
    /// Critical bit plus reserved bits; the reserved bits must be sent as
    /// zero and ignored on receipt
    pub critical: u8,
    /// Length in octets of the current payload, including this header
    pub payload_length: U16,
}

impl GenericPayloadHeader {
    /// Whether the critical bit is set
    pub fn is_critical(&self) -> bool {
        self.critical & FLAG_PAYLOAD_CRITICAL == FLAG_PAYLOAD_CRITICAL
    }
}

/// Extra header carried by an Encrypted Fragment payload (RFC 7383)
/// between the generic header and the IV
///
/// ```text
///                          1                   2                   3
///      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |        Fragment Number        |        Total Fragments        |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Fragment Number counts from 1. Only fragment 1 carries a meaningful
/// inner next-payload value in its generic header; all later fragments
/// must carry zero there.
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct SkfHeader {
    /// Index of this fragment, starting at 1
    pub fragment_number: U16,
    /// Total number of fragments the message was split into
    pub total_fragments: U16,
}

/// Protocol header for notify payloads
///
/// ```text
///                          1                   2                   3
///      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |  Protocol ID  |   SPI Size    |      Notify Message Type      |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     ~                Security Parameter Index (SPI)                 ~
///     ~                       Notification Data                       ~
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Neither the SPI nor the notification data is part of the header. The
/// notification data is type specific and its size must be preserved
/// verbatim when a notification is echoed back.
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct NotifyHeader {
    /// Type of the SA the notification concerns, or zero when the SPI
    /// field is empty
    pub protocol_id: u8,
    /// Length in octets of the SPI field, zero for IKE-SA notifications
    pub spi_size: u8,
    /// The notification type; error types are below 16384, status types
    /// at or above it
    pub notify_message_type: U16,
}

impl NotifyHeader {
    /// Whether this notification reports an error
    pub fn is_error(&self) -> bool {
        self.notify_message_type.get() < 16384
    }
}

/// Protocol header for delete payloads
///
/// ```text
///                          1                   2                   3
///      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |  Protocol ID  |   SPI Size    |          Num of SPIs          |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     ~              Security Parameter Index(es) (SPI)               ~
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct DeleteHeader {
    /// Type of the SAs being deleted
    pub protocol_id: u8,
    /// Length in octets of a single SPI, zero when deleting the IKE SA
    pub spi_size: u8,
    /// Number of SPIs in the payload body
    pub num_spis: U16,
}

/// Protocol header for identification payloads (IDi and IDr)
///
/// The three reserved octets must be sent as zero and ignored.
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct IdHeader {
    /// Type of the identification data, see [crate::params::IdType]
    pub id_type: u8,
    /// Reserved, must be zero
    pub reserved: [u8; 3],
}

/// Protocol header for the authentication payload
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct AuthHeader {
    /// Method of authentication used, see [crate::params::AuthMethod]
    pub auth_method: u8,
    /// Reserved, must be zero
    pub reserved: [u8; 3],
}

/// Protocol header for key exchange payloads
///
/// The group number must match a Diffie-Hellman group proposed in the SA
/// payload sent in the same message.
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct KeyExchangeHeader {
    /// Diffie-Hellman group the key exchange data belongs to
    pub dh_group_num: U16,
    /// Ignored but must be set to 0
    pub reserved: U16,
}

/// Protocol header for TSi/TSr payloads, followed by `num_ts` individual
/// selectors
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct TrafficSelectorsHeader {
    /// Number of selector substructures that follow
    pub num_ts: u8,
    /// Reserved, must be zero
    pub reserved: [u8; 3],
}

/// One traffic selector substructure inside a TSi/TSr payload
///
/// ```text
///                          1                   2                   3
///      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |   TS Type     |IP Protocol ID*|       Selector Length         |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |           Start Port*         |           End Port*           |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     ~                         Starting Address*                     ~
///     ~                         Ending Address*                       ~
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// The addresses are 4 octets each for type 7 and 16 octets each for
/// type 8; they are not part of this struct.
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct TrafficSelectorHeader {
    /// Kind of selector, see [crate::params::TsType]
    pub ts_type: u8,
    /// IP protocol this selector is limited to, or zero for all
    pub ip_protocol_id: u8,
    /// Length in octets of this substructure including the header
    pub selector_length: U16,
    /// First port of the selected range
    pub start_port: U16,
    /// Last port of the selected range
    pub end_port: U16,
}

/// Protocol header for a Proposal inside an SA payload
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct ProposalHeader {
    /// 2 when another proposal follows, 0 for the last one
    pub last_substruct: u8,
    /// Reserved, must be zero and must be ignored on receipt
    pub reserved: u8,
    /// Length in octets of the current Proposal, including the header itself
    pub proposal_length: U16,
    /// Number of this Proposal inside the SA payload, counting from 1
    pub proposal_num: u8,
    /// Identifier for the protocol inside the Proposal
    pub protocol_id: u8,
    /// Size in octets of the SPI carried behind the header
    pub spi_size: u8,
    /// Number of transform substructures in the body
    pub num_transforms: u8,
}

/// Protocol header for a Transform inside a Proposal
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct TransformHeader {
    /// 3 when another transform follows, 0 for the last one
    pub last_substruct: u8,
    /// Reserved, must be zero and must be ignored on receipt
    pub reserved: u8,
    /// Length in octets of the current Transform, including the header itself
    pub transform_length: U16,
    /// Type of transformation found in the body of this payload
    pub transform_type: u8,
    /// Reserved, must be zero and must be ignored on receipt
    pub reserved2: u8,
    /// Identifier of the concrete algorithm, scoped by the transform type
    pub transform_id: U16,
}

/// Protocol field for attributes of a Transform
///
/// Only the fixed-length TV form (top bit of the type set) is understood
/// here; the sole attribute in common use is the key length.
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct AttributeHeader {
    /// Type of the attribute, with the format flag in the top bit
    pub attribute_type: U16,
    /// Fixed-length attribute value (TV form) or length of the value that
    /// follows (TLV form)
    pub attribute_value: U16,
}

/// Flag in [AttributeHeader::attribute_type] selecting the fixed-length form
pub const FLAG_ATTRIBUTE_FORMAT: u16 = 0x8000;

impl AttributeHeader {
    /// Determine whether the fixed-length TV variant is used or the
    /// variable-length TLV variant
    pub fn is_fixed_length(&self) -> bool {
        self.attribute_type.get() & FLAG_ATTRIBUTE_FORMAT == FLAG_ATTRIBUTE_FORMAT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::FromBytes;

    #[test]
    fn header_is_28_octets() {
        assert_eq!(std::mem::size_of::<Header>(), crate::IKE_HEADER_SIZE);
        assert_eq!(std::mem::size_of::<GenericPayloadHeader>(), 4);
        assert_eq!(std::mem::size_of::<SkfHeader>(), 4);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn header_flags() {
        let buff = [
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, // initiator SPI
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // responder SPI
            0x21, // next payload
            0x20, // version
            0x22, // exchange type
            0x08, // flags: initiator, request
            0x00, 0x00, 0x00, 0x00, // message ID
            0x00, 0x00, 0x00, 0x1c, // length
        ];
        let header = Header::ref_from_prefix(&buff).unwrap();
        assert!(header.sent_by_initiator());
        assert!(!header.is_response());
        assert_eq!(header.length.get(), 28);
    }
}
