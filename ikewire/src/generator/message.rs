//! Assembly of whole IKEv2 datagrams

use zerocopy::network_endian::{U32, U64};
use zerocopy::AsBytes;

use crate::generator::GeneratorError;
use crate::header::{GenericPayloadHeader, Header, SkfHeader};
use crate::params::{ExchangeType, PayloadType, FLAG_INITIATOR, FLAG_RESPONSE};
use crate::{IKE_HEADER_SIZE, IKE_V2_VERSION_VALUE};

/// Rough per-payload size used to pre-allocate the output buffer
const ESTIMATED_PAYLOAD_LENGTH: usize = 48;

struct RawPayload {
    ty: PayloadType,
    /// Override of the generic header's next-payload field; used by the
    /// SK and SKF payloads whose field names the first payload inside
    /// the ciphertext instead of a following outer payload
    inner_np: Option<u8>,
    body: Vec<u8>,
}

/// Builder assembling one outbound message from header fields and
/// already-encoded payload bodies
///
/// The next-payload chain and all length fields are computed in
/// [MessageBuilder::build]; callers only name the payload types in the
/// order they should appear.
pub struct MessageBuilder {
    initiator_spi: u64,
    responder_spi: u64,
    exchange_type: ExchangeType,
    initiator: bool,
    response: bool,
    message_id: u32,
    payloads: Vec<RawPayload>,
}

impl MessageBuilder {
    /// Start a message of the given exchange with the given sequence number
    pub fn new(exchange_type: ExchangeType, message_id: u32) -> Self {
        Self {
            initiator_spi: 0,
            responder_spi: 0,
            exchange_type,
            initiator: false,
            response: false,
            message_id,
            payloads: vec![],
        }
    }

    /// Set both SPI header fields
    pub fn spis(mut self, initiator: u64, responder: u64) -> Self {
        self.initiator_spi = initiator;
        self.responder_spi = responder;
        self
    }

    /// Set the initiator flag: the sender is the original initiator of the SA
    pub fn initiator(mut self, initiator: bool) -> Self {
        self.initiator = initiator;
        self
    }

    /// Set the response flag: this message answers a request with the same ID
    pub fn response(mut self, response: bool) -> Self {
        self.response = response;
        self
    }

    /// Append a payload with an already-encoded body
    pub fn payload(mut self, ty: PayloadType, body: Vec<u8>) -> Self {
        self.payloads.push(RawPayload {
            ty,
            inner_np: None,
            body,
        });
        self
    }

    /// Append the SK payload; `first_inner` is the type of the first
    /// payload inside the ciphertext and `blob` is IV || ciphertext || ICV
    pub fn sk_payload(mut self, first_inner: PayloadType, blob: Vec<u8>) -> Self {
        self.payloads.push(RawPayload {
            ty: PayloadType::Encrypted,
            inner_np: Some(first_inner as u8),
            body: blob,
        });
        self
    }

    /// Append one SKF fragment; only fragment 1 carries a first-inner
    /// payload type, all others must pass `None`
    pub fn skf_payload(
        mut self,
        first_inner: Option<PayloadType>,
        number: u16,
        total: u16,
        blob: Vec<u8>,
    ) -> Self {
        let skf = SkfHeader {
            fragment_number: number.into(),
            total_fragments: total.into(),
        };
        let mut body = skf.as_bytes().to_vec();
        body.extend(blob);
        self.payloads.push(RawPayload {
            ty: PayloadType::EncryptedFragment,
            inner_np: Some(first_inner.map(|ty| ty as u8).unwrap_or(0)),
            body,
        });
        self
    }

    /// Encode the message
    pub fn build(self) -> Result<Vec<u8>, GeneratorError> {
        if self.payloads.len() >= 255 {
            return Err(GeneratorError::TooManyPayloads);
        }

        let mut payloads = Vec::with_capacity(ESTIMATED_PAYLOAD_LENGTH * self.payloads.len());
        for (i, payload) in self.payloads.iter().enumerate() {
            let total = size_of::<GenericPayloadHeader>() + payload.body.len();
            if total > u16::MAX as usize {
                return Err(GeneratorError::PayloadTooLarge);
            }
            let next_payload = match payload.inner_np {
                Some(np) => np,
                None => self
                    .payloads
                    .get(i + 1)
                    .map(|next| next.ty as u8)
                    .unwrap_or(PayloadType::NoNextPayload as u8),
            };
            let generic = GenericPayloadHeader {
                next_payload,
                critical: 0,
                payload_length: (total as u16).into(),
            };
            payloads.extend_from_slice(generic.as_bytes());
            payloads.extend_from_slice(&payload.body);
        }

        let packet_length = (IKE_HEADER_SIZE + payloads.len()) as u32;
        let header = Header {
            initiator_spi: U64::from(self.initiator_spi),
            responder_spi: U64::from(self.responder_spi),
            next_payload: self
                .payloads
                .first()
                .map(|p| p.ty as u8)
                .unwrap_or(PayloadType::NoNextPayload as u8),
            version: IKE_V2_VERSION_VALUE,
            exchange_type: self.exchange_type as u8,
            flags: (if self.initiator { FLAG_INITIATOR } else { 0 })
                | (if self.response { FLAG_RESPONSE } else { 0 }),
            message_id: U32::from(self.message_id),
            length: U32::from(packet_length),
        };

        let mut packet = Vec::with_capacity(packet_length as usize);
        packet.extend_from_slice(header.as_bytes());
        packet.extend(payloads);
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{decode_payloads, parse_header, Chains};
    use crate::set::PayloadSet;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn empty_message() {
        let packet = MessageBuilder::new(ExchangeType::Informational, 0x3b9ac9ff)
            .spis(1337133713371337, 301030307)
            .response(true)
            .build()
            .unwrap();
        assert_eq!(
            packet,
            vec![
                0x00, 0x04, 0xc0, 0x1d, 0xb4, 0x00, 0xb0, 0xc9, // initiator
                0x00, 0x00, 0x00, 0x00, 0x11, 0xf1, 0x5b, 0xa3, // responder
                0x00, // next payload
                0x20, // version
                0x25, // exchange type
                0x20, // flags
                0x3b, 0x9a, 0xc9, 0xff, // message ID
                0x00, 0x00, 0x00, 0x1c, // length
            ]
        );
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn round_trip_presence() {
        let packet = MessageBuilder::new(ExchangeType::IkeSaInit, 0)
            .spis(0xaa01, 0)
            .initiator(true)
            .payload(PayloadType::Nonce, vec![0x13; 32])
            .payload(PayloadType::VendorId, vec![0x42])
            .build()
            .unwrap();

        let header = parse_header(&packet).unwrap();
        assert!(header.sent_by_initiator());
        assert!(!header.is_response());

        let mut chains = Chains::default();
        let summary = decode_payloads(&packet[28..], header.next_payload, &mut chains);
        assert!(summary.ok());
        assert_eq!(summary.present, PayloadSet::NONCE | PayloadSet::V);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn sk_payload_carries_inner_type() {
        let packet = MessageBuilder::new(ExchangeType::IkeAuth, 1)
            .spis(0xaa01, 0xbb02)
            .response(true)
            .sk_payload(PayloadType::IdentificationResponder, vec![0u8; 16])
            .build()
            .unwrap();

        let header = parse_header(&packet).unwrap();
        let mut chains = Chains::default();
        let summary = decode_payloads(&packet[28..], header.next_payload, &mut chains);
        assert!(summary.ok());
        let sk = chains.sk().unwrap();
        assert_eq!(sk.first_payload, PayloadType::IdentificationResponder as u8);
        assert_eq!(sk.data.len(), 16);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn skf_fragment_round_trip() {
        let packet = MessageBuilder::new(ExchangeType::IkeAuth, 1)
            .spis(0xaa01, 0xbb02)
            .initiator(true)
            .skf_payload(None, 2, 3, vec![0xcc; 8])
            .build()
            .unwrap();

        let header = parse_header(&packet).unwrap();
        let mut chains = Chains::default();
        let summary = decode_payloads(&packet[28..], header.next_payload, &mut chains);
        assert!(summary.ok());
        let skf = chains.skf().unwrap();
        assert_eq!((skf.number, skf.total), (2, 3));
        assert_eq!(skf.first_payload, 0);
    }
}
