//! Parser functionality to convert network-level bytes into payload structs
//!
//! [parse_header] checks and reinterprets the fixed IKE header;
//! [decode_payloads] walks a next-payload chain into a [crate::digest]
//! collection. Individual payload bodies are decoded by the `body` module.

pub(crate) mod body;
mod digest;

pub use digest::{decode_payloads, Chains, PayloadSummary, MAX_PAYLOAD_DIGESTS};

use thiserror::Error;
use zerocopy::FromBytes;

use crate::header::Header;
use crate::params::UnparseableParameter;
use crate::IKE_V2_VERSION_VALUE;

/// Failure while parsing a packet or payload from its network-level byte
/// representation
#[derive(Debug, Error, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ParserError {
    #[error("Buffer too small to parse the structure")]
    BufferTooSmall,
    #[error("Wrong protocol, expected IKEv2")]
    WrongProtocol,
    #[error("Parameter could not be parsed: {0:#?}")]
    UnparseableParameter(UnparseableParameter),
    #[error("Payload length points outside its buffer")]
    LengthOutOfBounds,
    #[error("Proposal numbering doesn't start at 1")]
    InvalidProposalNumberingStart,
    #[error("Proposal numbering doesn't increment by 1")]
    InvalidProposalNumbering,
    #[error("Field combination violates the protocol")]
    ProtocolViolation,
}

impl From<UnparseableParameter> for ParserError {
    fn from(value: UnparseableParameter) -> Self {
        Self::UnparseableParameter(value)
    }
}

/// Check version and length of a raw datagram and reinterpret its prefix
/// as the fixed IKE header
pub fn parse_header(buf: &[u8]) -> Result<&Header, ParserError> {
    let header = Header::ref_from_prefix(buf).ok_or(ParserError::BufferTooSmall)?;
    if header.version != IKE_V2_VERSION_VALUE {
        return Err(ParserError::WrongProtocol);
    }
    if header.length.get() as usize != buf.len() {
        log::warn!("Buffer length does not match header length");
    }
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_wrong_version() {
        let mut buff = vec![0u8; 28];
        buff[17] = 0x10; // IKEv1
        buff[27] = 28;
        assert_eq!(parse_header(&buff), Err(ParserError::WrongProtocol));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn accept_v2_header() {
        let mut buff = vec![0u8; 28];
        buff[17] = 0x20;
        buff[27] = 28;
        let header = parse_header(&buff).unwrap();
        assert_eq!(header.message_id.get(), 0);
    }
}
