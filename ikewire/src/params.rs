//! IKEv2 parameters and their parsers as defined in the IANA IKEv2 list
//! found at https://www.iana.org/assignments/ikev2-parameters/ikev2-parameters.xhtml

use strum::{Display, EnumIter};

/// Flag bit signalling that the sender is the original initiator of the SA
pub const FLAG_INITIATOR: u8 = 0b0000_1000;
/// Flag bit signalling that the sender can speak a higher major version
pub const FLAG_VERSION: u8 = 0b0001_0000;
/// Flag bit signalling that this message is a response to a message with the same ID
pub const FLAG_RESPONSE: u8 = 0b0010_0000;

/// Bit inside the second octet of a generic payload header marking the
/// payload as critical: a receiver that does not understand a critical
/// payload must reject the whole message.
pub const FLAG_PAYLOAD_CRITICAL: u8 = 0b1000_0000;

/// When parsing a parameter from its wire value, there are several
/// "regions" in the definitions that can't be covered by Rust enums.
/// Typically the last regions of a parameter registry are unassigned
/// and/or reserved for private use.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum UnparseableParameter {
    /// The parameter is reserved and must not be used, as it may conflict with older standards
    Reserved,
    /// The parameter has no recognized meaning by any known standard
    Unassigned,
    /// The parameter is reserved for Private Use by proprietary implementations
    /// and not part of a standard
    PrivateUse,
    /// The parameter can not reach the value this resolves to,
    /// as such the packet where it originates from must be invalid
    OutOfRange,
}

/// Type of the exchange being used
///
/// This constrains the payloads sent in each message of an exchange.
/// Values 0-33 are reserved, 45-239 are currently unassigned and
/// 240-255 reserved for private use. Also see [UnparseableParameter].
#[derive(Debug, Display, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Hash)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum ExchangeType {
    // RFC 7296
    IkeSaInit = 34,
    // RFC 7296
    IkeAuth = 35,
    // RFC 7296
    CreateChildSa = 36,
    // RFC 7296
    Informational = 37,
    // RFC 5723
    IkeSessionResume = 38,
    // RFC 9242
    IkeIntermediate = 43,
    // RFC 9370
    IkeFollowupKeyExchange = 44,
}

impl TryFrom<u8> for ExchangeType {
    type Error = UnparseableParameter;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0..=33 => Err(UnparseableParameter::Reserved),
            34 => Ok(ExchangeType::IkeSaInit),
            35 => Ok(ExchangeType::IkeAuth),
            36 => Ok(ExchangeType::CreateChildSa),
            37 => Ok(ExchangeType::Informational),
            38 => Ok(ExchangeType::IkeSessionResume),
            39..=42 => Err(UnparseableParameter::Unassigned),
            43 => Ok(ExchangeType::IkeIntermediate),
            44 => Ok(ExchangeType::IkeFollowupKeyExchange),
            45..=239 => Err(UnparseableParameter::Unassigned),
            240..=255 => Err(UnparseableParameter::PrivateUse),
        }
    }
}

/// Type of a payload inside a message
///
/// Values 1-32 are reserved (they collide with IKEv1), 55-127 are
/// currently unassigned and 128-255 reserved for private use.
/// Also see [UnparseableParameter].
#[derive(Debug, Display, EnumIter, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Hash)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum PayloadType {
    // RFC 7296
    NoNextPayload = 0,
    // RFC 7296
    SecurityAssociation = 33,
    // RFC 7296
    KeyExchange = 34,
    // RFC 7296
    IdentificationInitiator = 35,
    // RFC 7296
    IdentificationResponder = 36,
    // RFC 7296
    Certificate = 37,
    // RFC 7296
    CertificateRequest = 38,
    // RFC 7296
    Authentication = 39,
    // RFC 7296
    Nonce = 40,
    // RFC 7296
    Notify = 41,
    // RFC 7296
    Delete = 42,
    // RFC 7296
    VendorId = 43,
    // RFC 7296
    TrafficSelectorInitiator = 44,
    // RFC 7296
    TrafficSelectorResponder = 45,
    // RFC 7296
    Encrypted = 46,
    // RFC 7296
    Configuration = 47,
    // RFC 7296
    ExtensibleAuthentication = 48,
    // RFC 7383
    EncryptedFragment = 53,
}

impl TryFrom<u8> for PayloadType {
    type Error = UnparseableParameter;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PayloadType::NoNextPayload),
            1..=32 => Err(UnparseableParameter::Reserved),
            33 => Ok(PayloadType::SecurityAssociation),
            34 => Ok(PayloadType::KeyExchange),
            35 => Ok(PayloadType::IdentificationInitiator),
            36 => Ok(PayloadType::IdentificationResponder),
            37 => Ok(PayloadType::Certificate),
            38 => Ok(PayloadType::CertificateRequest),
            39 => Ok(PayloadType::Authentication),
            40 => Ok(PayloadType::Nonce),
            41 => Ok(PayloadType::Notify),
            42 => Ok(PayloadType::Delete),
            43 => Ok(PayloadType::VendorId),
            44 => Ok(PayloadType::TrafficSelectorInitiator),
            45 => Ok(PayloadType::TrafficSelectorResponder),
            46 => Ok(PayloadType::Encrypted),
            47 => Ok(PayloadType::Configuration),
            48 => Ok(PayloadType::ExtensibleAuthentication),
            49..=52 => Err(UnparseableParameter::Unassigned),
            53 => Ok(PayloadType::EncryptedFragment),
            54 => Err(UnparseableParameter::Unassigned),
            55..=127 => Err(UnparseableParameter::Unassigned),
            128..=255 => Err(UnparseableParameter::PrivateUse),
        }
    }
}

/// Protocol identifier carried by SA proposals, Notify and Delete payloads
///
/// For a notification or deletion concerning the IKE SA itself the SPI
/// field is empty and this field is sent as zero.
#[derive(Debug, Display, Ord, PartialOrd, Eq, PartialEq, Copy, Clone)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum SecurityProtocol {
    Reserved = 0,
    InternetKeyExchange = 1,
    AuthenticationHeader = 2,
    EncapsulatingSecurityPayload = 3,
}

impl TryFrom<u8> for SecurityProtocol {
    type Error = UnparseableParameter;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SecurityProtocol::Reserved),
            1 => Ok(SecurityProtocol::InternetKeyExchange),
            2 => Ok(SecurityProtocol::AuthenticationHeader),
            3 => Ok(SecurityProtocol::EncapsulatingSecurityPayload),
            4..=200 => Err(UnparseableParameter::Unassigned),
            201..=255 => Err(UnparseableParameter::PrivateUse),
        }
    }
}

/// Type of the transform inside an SA proposal
///
/// Value 0 is reserved, 6-240 are unassigned here and 241-255 reserved
/// for private use.
#[derive(Debug, Display, Ord, PartialOrd, Eq, PartialEq, Copy, Clone)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum TransformType {
    EncryptionAlgorithm = 1,
    PseudoRandomFunction = 2,
    IntegrityAlgorithm = 3,
    KeyExchangeMethod = 4,
    SequenceNumber = 5,
}

impl TryFrom<u8> for TransformType {
    type Error = UnparseableParameter;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Err(UnparseableParameter::Reserved),
            1 => Ok(TransformType::EncryptionAlgorithm),
            2 => Ok(TransformType::PseudoRandomFunction),
            3 => Ok(TransformType::IntegrityAlgorithm),
            4 => Ok(TransformType::KeyExchangeMethod),
            5 => Ok(TransformType::SequenceNumber),
            6..=240 => Err(UnparseableParameter::Unassigned),
            241..=255 => Err(UnparseableParameter::PrivateUse),
        }
    }
}

/// Type of an identity carried in an Identification payload
#[derive(Debug, Display, Ord, PartialOrd, Eq, PartialEq, Copy, Clone)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum IdType {
    Ipv4Addr = 1,
    Fqdn = 2,
    Rfc822Addr = 3,
    Ipv6Addr = 5,
    DerAsn1Dn = 9,
    DerAsn1Gn = 10,
    KeyId = 11,
    FcName = 12,
    Null = 13,
}

impl TryFrom<u8> for IdType {
    type Error = UnparseableParameter;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Err(UnparseableParameter::Reserved),
            1 => Ok(IdType::Ipv4Addr),
            2 => Ok(IdType::Fqdn),
            3 => Ok(IdType::Rfc822Addr),
            4 => Err(UnparseableParameter::Unassigned),
            5 => Ok(IdType::Ipv6Addr),
            6..=8 => Err(UnparseableParameter::Reserved),
            9 => Ok(IdType::DerAsn1Dn),
            10 => Ok(IdType::DerAsn1Gn),
            11 => Ok(IdType::KeyId),
            12 => Ok(IdType::FcName),
            13 => Ok(IdType::Null),
            14..=200 => Err(UnparseableParameter::Unassigned),
            201..=255 => Err(UnparseableParameter::PrivateUse),
        }
    }
}

/// Type of authentication method being used in an Authentication payload
///
/// Value 0 is reserved, values 4-8 and 15-200 are unassigned and
/// values 201-255 are reserved for private use.
#[derive(Debug, Display, Clone, Ord, PartialOrd, Eq, PartialEq, Copy)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum AuthMethod {
    RsaDigitalSignature = 1,
    SharedKeyMic = 2,
    DssDigitalSignature = 3,
    EcdsaSha256 = 9,  // with P-256 curve
    EcdsaSha384 = 10, // with P-384 curve
    EcdsaSha512 = 11, // with P-521 curve
    GenericSecurePassword = 12,
    NullAuthentication = 13,
    DigitalSignature = 14,
}

impl TryFrom<u8> for AuthMethod {
    type Error = UnparseableParameter;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Err(UnparseableParameter::Reserved),
            1 => Ok(AuthMethod::RsaDigitalSignature),
            2 => Ok(AuthMethod::SharedKeyMic),
            3 => Ok(AuthMethod::DssDigitalSignature),
            4..=8 => Err(UnparseableParameter::Unassigned),
            9 => Ok(AuthMethod::EcdsaSha256),
            10 => Ok(AuthMethod::EcdsaSha384),
            11 => Ok(AuthMethod::EcdsaSha512),
            12 => Ok(AuthMethod::GenericSecurePassword),
            13 => Ok(AuthMethod::NullAuthentication),
            14 => Ok(AuthMethod::DigitalSignature),
            15..=200 => Err(UnparseableParameter::Unassigned),
            201..=255 => Err(UnparseableParameter::PrivateUse),
        }
    }
}

/// Type of a single traffic selector inside a TSi/TSr payload
#[derive(Debug, Display, Ord, PartialOrd, Eq, PartialEq, Copy, Clone)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum TsType {
    Ipv4AddrRange = 7,
    Ipv6AddrRange = 8,
}

impl TryFrom<u8> for TsType {
    type Error = UnparseableParameter;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0..=6 => Err(UnparseableParameter::Reserved),
            7 => Ok(TsType::Ipv4AddrRange),
            8 => Ok(TsType::Ipv6AddrRange),
            9..=240 => Err(UnparseableParameter::Unassigned),
            241..=255 => Err(UnparseableParameter::PrivateUse),
        }
    }
}

/// Error notification types (1-16383)
///
/// An implementation receiving an error type it does not recognize in a
/// response must assume the corresponding request failed entirely;
/// unrecognized error types in a request must be ignored and logged.
#[derive(Debug, Display, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Hash)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum NotifyError {
    UnsupportedCriticalPayload = 1,
    InvalidIkeSpi = 4,
    InvalidMajorVersion = 5,
    InvalidSyntax = 7,
    InvalidMessageId = 9,
    InvalidSpi = 11,
    NoProposalChosen = 14,
    InvalidKePayload = 17,
    AuthenticationFailed = 24,
    SinglePairRequired = 34,
    NoAdditionalSas = 35,
    InternalAddressFailure = 36,
    FailedCpRequired = 37,
    TsUnacceptable = 38,
    InvalidSelectors = 39,
    TemporaryFailure = 43,
    ChildSaNotFound = 44,
}

impl TryFrom<u16> for NotifyError {
    type Error = UnparseableParameter;

    fn try_from(value: u16) -> Result<Self, UnparseableParameter> {
        match value {
            1 => Ok(NotifyError::UnsupportedCriticalPayload),
            4 => Ok(NotifyError::InvalidIkeSpi),
            5 => Ok(NotifyError::InvalidMajorVersion),
            7 => Ok(NotifyError::InvalidSyntax),
            9 => Ok(NotifyError::InvalidMessageId),
            11 => Ok(NotifyError::InvalidSpi),
            14 => Ok(NotifyError::NoProposalChosen),
            17 => Ok(NotifyError::InvalidKePayload),
            24 => Ok(NotifyError::AuthenticationFailed),
            34 => Ok(NotifyError::SinglePairRequired),
            35 => Ok(NotifyError::NoAdditionalSas),
            36 => Ok(NotifyError::InternalAddressFailure),
            37 => Ok(NotifyError::FailedCpRequired),
            38 => Ok(NotifyError::TsUnacceptable),
            39 => Ok(NotifyError::InvalidSelectors),
            43 => Ok(NotifyError::TemporaryFailure),
            44 => Ok(NotifyError::ChildSaNotFound),
            0 | 2..=3 | 6 | 8 | 10 | 12..=13 | 15..=16 | 18..=23 | 25..=33 | 40..=42 => {
                Err(UnparseableParameter::Reserved)
            }
            45..=8191 => Err(UnparseableParameter::Unassigned),
            8192..=16383 => Err(UnparseableParameter::PrivateUse),
            16384..=65535 => Err(UnparseableParameter::OutOfRange),
        }
    }
}

impl NotifyError {
    /// The wire value of this notification type
    pub fn code(self) -> u16 {
        self as u16
    }
}

/// Status notification types (16384 and above)
///
/// Status types may be added to any message and must be ignored when not
/// recognized; they indicate capabilities and negotiate non-cryptographic
/// parameters.
#[derive(Debug, Display, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Hash)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum NotifyStatus {
    InitialContact = 16384,
    SetWindowSize = 16385,
    AdditionalTsPossible = 16386,
    IpcompSupported = 16387,
    NatDetectionSourceIp = 16388,
    NatDetectionDestinationIp = 16389,
    Cookie = 16390,
    UseTransportMode = 16391,
    RekeySa = 16393,
    // RFC 7383
    FragmentationSupported = 16430,
    // RFC 7427
    SignatureHashAlgorithms = 16431,
}

impl TryFrom<u16> for NotifyStatus {
    type Error = UnparseableParameter;

    fn try_from(value: u16) -> Result<Self, UnparseableParameter> {
        match value {
            0..=16383 => Err(UnparseableParameter::OutOfRange),
            16384 => Ok(NotifyStatus::InitialContact),
            16385 => Ok(NotifyStatus::SetWindowSize),
            16386 => Ok(NotifyStatus::AdditionalTsPossible),
            16387 => Ok(NotifyStatus::IpcompSupported),
            16388 => Ok(NotifyStatus::NatDetectionSourceIp),
            16389 => Ok(NotifyStatus::NatDetectionDestinationIp),
            16390 => Ok(NotifyStatus::Cookie),
            16391 => Ok(NotifyStatus::UseTransportMode),
            16392 => Err(UnparseableParameter::Unassigned),
            16393 => Ok(NotifyStatus::RekeySa),
            16430 => Ok(NotifyStatus::FragmentationSupported),
            16431 => Ok(NotifyStatus::SignatureHashAlgorithms),
            16394..=16429 | 16432..=40959 => Err(UnparseableParameter::Unassigned),
            40960..=65535 => Err(UnparseableParameter::PrivateUse),
        }
    }
}

impl NotifyStatus {
    /// The wire value of this notification type
    pub fn code(self) -> u16 {
        self as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_code_ranges() {
        assert!(NotifyError::try_from(16384).is_err());
        assert!(NotifyStatus::try_from(16383).is_err());
        assert_eq!(NotifyError::try_from(7), Ok(NotifyError::InvalidSyntax));
        assert_eq!(NotifyStatus::try_from(16390), Ok(NotifyStatus::Cookie));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn payload_type_round_trip() {
        for raw in [0u8, 33, 41, 46, 53] {
            let ty = PayloadType::try_from(raw).unwrap();
            assert_eq!(ty as u8, raw);
        }
        assert_eq!(PayloadType::try_from(1), Err(UnparseableParameter::Reserved));
        assert_eq!(PayloadType::try_from(99), Err(UnparseableParameter::Unassigned));
        assert_eq!(PayloadType::try_from(200), Err(UnparseableParameter::PrivateUse));
    }
}
