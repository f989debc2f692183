//! Typed representations of the payload bodies a message can carry
//!
//! These are the high-level structs the [crate::parser] produces and the
//! [crate::generator] consumes. Bodies that this subsystem never inspects
//! beyond their boundaries (certificates, configuration attributes) are
//! kept as raw octet vectors.

use std::net::IpAddr;

use crate::params::{
    AuthMethod, IdType, NotifyError, NotifyStatus, PayloadType, SecurityProtocol, TransformType,
    TsType,
};

/// One decoded payload: its wire type plus the typed body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadDigest {
    /// Wire type of this payload
    pub ty: PayloadType,
    /// Decoded body
    pub body: PayloadBody,
}

/// The body of a single payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadBody {
    /// SA payload: the list of proposals offered or the one accepted
    SecurityAssociation(SecurityAssociation),
    /// KE payload: DH group number plus public value
    KeyExchange(KeyExchange),
    /// Ni/Nr payload: the raw nonce octets
    Nonce(Vec<u8>),
    /// N payload
    Notify(Notification),
    /// D payload
    Delete(DeletePayload),
    /// V payload: opaque vendor identifier
    VendorId(Vec<u8>),
    /// IDi payload
    IdInitiator(Identity),
    /// IDr payload
    IdResponder(Identity),
    /// CERT payload: encoding octet plus certificate data, kept opaque
    Certificate(Vec<u8>),
    /// CERTREQ payload, kept opaque
    CertificateRequest(Vec<u8>),
    /// AUTH payload
    Authentication(Authentication),
    /// TSi payload
    TrafficSelectorsInitiator(Vec<TrafficSelector>),
    /// TSr payload
    TrafficSelectorsResponder(Vec<TrafficSelector>),
    /// CP payload, kept opaque
    Configuration(Vec<u8>),
    /// SK payload: IV || ciphertext || ICV, still encrypted
    Encrypted(SkEnvelope),
    /// SKF payload: one fragment of an encrypted message, still encrypted
    EncryptedFragment(SkfEnvelope),
    /// A payload this subsystem tolerates but does not interpret
    Generic(Vec<u8>),
}

/// An SA payload: a list of proposals
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SecurityAssociation {
    /// The proposals in offer order
    pub proposals: Vec<Proposal>,
}

/// One proposal inside an SA payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    /// Position of this proposal, counting from 1
    pub number: u8,
    /// Protocol the proposal negotiates keys for
    pub protocol: SecurityProtocol,
    /// SPI of the sending entity; empty in an initial IKE negotiation
    pub spi: Vec<u8>,
    /// The transforms offered for this proposal
    pub transforms: Vec<Transform>,
}

/// A single transform inside a proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transform {
    /// Which algorithm slot this transform fills
    pub kind: TransformType,
    /// Algorithm identifier, scoped by `kind`
    pub id: u16,
    /// Optional key length attribute in bits
    pub key_length: Option<u16>,
}

/// A KE payload body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyExchange {
    /// DH group the public value belongs to
    pub dh_group: u16,
    /// The sender's public value
    pub data: Vec<u8>,
}

/// An N payload body
///
/// The type is kept as the raw wire value so unrecognized status types
/// can be carried around (and ignored) without loss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Protocol of the SA the notification concerns
    pub protocol: SecurityProtocol,
    /// SPI of that SA, when one is attached
    pub spi: Option<Vec<u8>>,
    /// The raw notify message type
    pub code: u16,
    /// Type-specific notification data, echoed back verbatim when needed
    pub data: Vec<u8>,
}

impl Notification {
    /// The error this notification reports, if it is a known error type
    pub fn error(&self) -> Option<NotifyError> {
        NotifyError::try_from(self.code).ok()
    }

    /// The status this notification reports, if it is a known status type
    pub fn status(&self) -> Option<NotifyStatus> {
        NotifyStatus::try_from(self.code).ok()
    }
}

/// A D payload body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletePayload {
    /// Protocol of the SAs being deleted
    pub protocol: SecurityProtocol,
    /// The SPIs being deleted; empty when the IKE SA itself is deleted
    pub spis: Vec<Vec<u8>>,
}

/// An IDi/IDr payload body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Kind of the identification data
    pub id_type: IdType,
    /// The identification data itself
    pub data: Vec<u8>,
}

/// An AUTH payload body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authentication {
    /// Authentication method the data was produced with
    pub method: AuthMethod,
    /// The authentication data (signature or MAC)
    pub data: Vec<u8>,
}

/// One traffic selector of a TSi/TSr payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficSelector {
    /// Address family of the range
    pub ts_type: TsType,
    /// IP protocol the selector is limited to, or zero for any
    pub protocol: u8,
    /// First selected port
    pub start_port: u16,
    /// Last selected port
    pub end_port: u16,
    /// First address of the selected range
    pub start_addr: IpAddr,
    /// Last address of the selected range
    pub end_addr: IpAddr,
}

/// The still-encrypted content of an SK payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkEnvelope {
    /// Type of the first payload inside the ciphertext, taken from the
    /// SK payload's generic header
    pub first_payload: u8,
    /// IV || ciphertext || ICV, with AEAD-specific boundaries
    pub data: Vec<u8>,
}

/// The still-encrypted content of one SKF fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkfEnvelope {
    /// Inner next-payload value; meaningful only on fragment 1, zero on
    /// all later fragments
    pub first_payload: u8,
    /// Index of this fragment, counting from 1
    pub number: u16,
    /// Total number of fragments
    pub total: u16,
    /// IV || ciphertext || ICV of this fragment
    pub data: Vec<u8>,
}
