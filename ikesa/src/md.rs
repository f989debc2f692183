//! The message digest: one parsed inbound message
//!
//! A [MessageDigest] is created from the raw datagram as soon as the
//! fixed header checks out; the payload chains are decoded lazily, first
//! the cleartext chain when a transition shows interest and later the
//! encrypted chain once the SK payload is decrypted.

use std::net::SocketAddr;

use ikewire::params::{ExchangeType, FLAG_INITIATOR, FLAG_RESPONSE};
use ikewire::parser::{self, Chains, ParserError, PayloadSummary};
use ikewire::IKE_HEADER_SIZE;

use crate::sa::{SerialNo, SpiPair, State};

/// The header fields the demultiplexer keys on, in host order
#[derive(Debug, Clone, Copy)]
pub struct HeaderFields {
    /// SPI pair from the header
    pub spis: SpiPair,
    /// Exchange this message belongs to
    pub exchange: ExchangeType,
    /// Raw flag octet
    pub flags: u8,
    /// Sequence number within the SA
    pub message_id: u32,
    /// Type of the first payload behind the header
    pub first_payload: u8,
}

/// One parsed inbound message
#[derive(Debug)]
pub struct MessageDigest {
    /// The raw datagram as received
    pub raw: Vec<u8>,
    /// Where it came from
    pub sender: SocketAddr,
    /// The decoded fixed header
    pub hdr: HeaderFields,
    /// All decoded payloads, cleartext and (once decrypted) inner ones
    pub chains: Chains,
    /// What the cleartext chain walk saw
    pub message_payloads: PayloadSummary,
    /// What the encrypted chain walk saw, once the SK payload is open
    pub encrypted_payloads: PayloadSummary,
    /// State the selected transition starts from
    pub from_state: Option<State>,
    /// Index of the selected transition in [crate::transitions::TRANSITIONS]
    pub transition: Option<usize>,
    /// SA the message resolved to
    pub sa: Option<SerialNo>,
}

impl MessageDigest {
    /// Parse the fixed header of a datagram
    pub fn parse(raw: Vec<u8>, sender: SocketAddr) -> Result<Self, ParserError> {
        let header = parser::parse_header(&raw)?;
        let hdr = HeaderFields {
            spis: SpiPair {
                initiator: header.initiator_spi.get(),
                responder: header.responder_spi.get(),
            },
            exchange: ExchangeType::try_from(header.exchange_type)?,
            flags: header.flags,
            message_id: header.message_id.get(),
            first_payload: header.next_payload,
        };
        Ok(Self {
            raw,
            sender,
            hdr,
            chains: Chains::default(),
            message_payloads: PayloadSummary::default(),
            encrypted_payloads: PayloadSummary::default(),
            from_state: None,
            transition: None,
            sa: None,
        })
    }

    /// Whether the message is a response
    pub fn is_response(&self) -> bool {
        self.hdr.flags & FLAG_RESPONSE == FLAG_RESPONSE
    }

    /// Whether the message is a request
    pub fn is_request(&self) -> bool {
        !self.is_response()
    }

    /// Whether the sender claims to be the original initiator
    pub fn sent_by_initiator(&self) -> bool {
        self.hdr.flags & FLAG_INITIATOR == FLAG_INITIATOR
    }

    /// Decode the cleartext payload area behind the fixed header
    pub fn parse_cleartext_payloads(&mut self) {
        let first = self.hdr.first_payload;
        let body = self.raw[IKE_HEADER_SIZE..].to_vec();
        self.message_payloads = parser::decode_payloads(&body, first, &mut self.chains);
    }

    /// Decode recovered plaintext into the encrypted-payload chain
    pub fn parse_encrypted_payloads(&mut self, first: u8, plaintext: &[u8]) {
        self.encrypted_payloads = parser::decode_payloads(plaintext, first, &mut self.chains);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ikewire::generator::MessageBuilder;
    use ikewire::params::PayloadType;
    use ikewire::set::PayloadSet;

    fn sender() -> SocketAddr {
        "192.0.2.7:500".parse().unwrap_or_else(|_| unreachable!())
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn parse_and_classify_roles() {
        let raw = MessageBuilder::new(ExchangeType::IkeSaInit, 0)
            .spis(0xaa01, 0)
            .initiator(true)
            .payload(PayloadType::Nonce, vec![0x13; 32])
            .build()
            .unwrap();

        let mut md = MessageDigest::parse(raw, sender()).unwrap();
        assert!(md.is_request());
        assert!(md.sent_by_initiator());
        assert_eq!(md.hdr.message_id, 0);
        assert_eq!(md.hdr.spis.responder, 0);

        md.parse_cleartext_payloads();
        assert!(md.message_payloads.ok());
        assert_eq!(md.message_payloads.present, PayloadSet::NONCE);
    }

    #[test]
    fn reject_non_ike() {
        let raw = vec![0u8; 27];
        assert!(MessageDigest::parse(raw, sender()).is_err());
    }
}
