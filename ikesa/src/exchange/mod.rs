//! Per-exchange transition handlers and shared message-building helpers
//!
//! Each submodule carries the processors one exchange type needs; the
//! helpers here are the pieces they share: SA construction, nonce
//! acceptance, proposal defaults and the packet builders the dispatcher
//! uses for notifications and SK envelopes.

pub mod create_child;
pub mod ike_auth;
pub mod ike_sa_init;
pub mod informational;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use zerocopy::AsBytes;

use ikewire::generator::{GeneratorError, MessageBuilder};
use ikewire::header::GenericPayloadHeader;
use ikewire::params::{ExchangeType, PayloadType, SecurityProtocol, TransformType};
use ikewire::parser::Chains;
use ikewire::payload::{PayloadBody, Proposal, SecurityAssociation, Transform};

use crate::config::Connection;
use crate::msgid::MsgidCounters;
use crate::sa::{Sa, SaRole, SerialNo, SpiPair, State};

/// Plaintext size above which an outbound SK message is fragmented
pub const FRAGMENT_THRESHOLD: usize = 1200;

/// Nonces must be at least 128 bits and at most 256 octets (RFC 7296 2.10)
pub const MINIMUM_NONCE_SIZE: usize = 16;
/// Upper bound on accepted nonce sizes
pub const MAXIMUM_NONCE_SIZE: usize = 256;

/// Construct a fresh SA record with empty negotiation state
#[allow(clippy::too_many_arguments)]
pub(crate) fn new_sa(
    serial: SerialNo,
    role: SaRole,
    state: State,
    connection: Arc<Connection>,
    spis: SpiPair,
    remote: SocketAddr,
    window: u32,
) -> Sa {
    Sa {
        serial,
        parent: None,
        role,
        state,
        connection,
        spis,
        rekey_spis: None,
        remote,
        msgid: MsgidCounters::default(),
        exchange_msgid: None,
        window,
        skeyseed_computed: false,
        keys: None,
        nonce_mine: vec![],
        nonce_peer: vec![],
        ke_group: 0,
        ke_public_mine: vec![],
        ke_peer: vec![],
        cookie_to_echo: None,
        rfrags: None,
        seen_fragmentation_vid: false,
        respond_with_fragments: false,
        recorded: vec![],
        suspended: None,
        offloaded: None,
        send_next: VecDeque::new(),
        ts: None,
        ipsec_spis: None,
        ipcomp_cpi: None,
        retransmit: None,
        timer_generation: 0,
    }
}

/// The first nonce payload of a message, if any
pub(crate) fn nonce_of(chains: &Chains) -> Option<Vec<u8>> {
    chains
        .first(PayloadType::Nonce)
        .and_then(|pd| match &pd.body {
            PayloadBody::Nonce(nonce) => Some(nonce.clone()),
            _ => None,
        })
}

/// Accept a received nonce, checking the RFC 7296 size bounds
pub(crate) fn accept_nonce(chains: &Chains) -> Result<Vec<u8>, ()> {
    let nonce = nonce_of(chains).ok_or(())?;
    if nonce.len() < MINIMUM_NONCE_SIZE || nonce.len() > MAXIMUM_NONCE_SIZE {
        tracing::warn!(
            "nonce length {} not between {MINIMUM_NONCE_SIZE} and {MAXIMUM_NONCE_SIZE}",
            nonce.len()
        );
        return Err(());
    }
    Ok(nonce)
}

/// The SA payload of a message, if any
pub(crate) fn sa_payload_of(chains: &Chains) -> Option<&SecurityAssociation> {
    chains
        .first(PayloadType::SecurityAssociation)
        .and_then(|pd| match &pd.body {
            PayloadBody::SecurityAssociation(sa) => Some(sa),
            _ => None,
        })
}

/// The default IKE proposal offered and accepted by this host
pub(crate) fn default_ike_proposal(spi: Vec<u8>) -> Proposal {
    Proposal {
        number: 1,
        protocol: SecurityProtocol::InternetKeyExchange,
        spi,
        transforms: vec![
            Transform {
                kind: TransformType::EncryptionAlgorithm,
                id: 20, // AES-GCM-16
                key_length: Some(256),
            },
            Transform {
                kind: TransformType::PseudoRandomFunction,
                id: 5, // HMAC-SHA2-256
                key_length: None,
            },
            Transform {
                kind: TransformType::KeyExchangeMethod,
                id: 31, // curve25519
                key_length: None,
            },
        ],
    }
}

/// The default ESP proposal for child SAs
pub(crate) fn default_esp_proposal(spi: Vec<u8>) -> Proposal {
    Proposal {
        number: 1,
        protocol: SecurityProtocol::EncapsulatingSecurityPayload,
        spi,
        transforms: vec![
            Transform {
                kind: TransformType::EncryptionAlgorithm,
                id: 20, // AES-GCM-16
                key_length: Some(256),
            },
            Transform {
                kind: TransformType::SequenceNumber,
                id: 0,
                key_length: None,
            },
        ],
    }
}

/// The AUTH payload method matching a configured policy
pub(crate) fn auth_method_for(authby: crate::config::AuthBy) -> ikewire::params::AuthMethod {
    use ikewire::params::AuthMethod;
    match authby {
        crate::config::AuthBy::Rsasig => AuthMethod::RsaDigitalSignature,
        crate::config::AuthBy::Psk => AuthMethod::SharedKeyMic,
        crate::config::AuthBy::Null => AuthMethod::NullAuthentication,
        crate::config::AuthBy::Ecdsa => AuthMethod::EcdsaSha256,
        crate::config::AuthBy::Never => AuthMethod::SharedKeyMic,
    }
}

/// The all-traffic IPv4 selector list used until narrowing is configured
pub(crate) fn wildcard_selectors() -> Vec<ikewire::payload::TrafficSelector> {
    vec![ikewire::payload::TrafficSelector {
        ts_type: ikewire::params::TsType::Ipv4AddrRange,
        protocol: 0,
        start_port: 0,
        end_port: u16::MAX,
        start_addr: std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
        end_addr: std::net::IpAddr::V4(std::net::Ipv4Addr::BROADCAST),
    }]
}

/// Chain already-encoded payload bodies into one plaintext blob
///
/// Returns the type of the first payload (for the SK envelope's inner
/// next-payload field) and the encoded chain.
pub(crate) fn encode_payload_chain(payloads: &[(PayloadType, Vec<u8>)]) -> (PayloadType, Vec<u8>) {
    let first = payloads
        .first()
        .map(|(ty, _)| *ty)
        .unwrap_or(PayloadType::NoNextPayload);

    let mut out = vec![];
    for (i, (_, body)) in payloads.iter().enumerate() {
        let next_payload = payloads
            .get(i + 1)
            .map(|(ty, _)| *ty as u8)
            .unwrap_or(PayloadType::NoNextPayload as u8);
        let header = GenericPayloadHeader {
            next_payload,
            critical: 0,
            payload_length: ((size_of::<GenericPayloadHeader>() + body.len()) as u16).into(),
        };
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(body);
    }
    (first, out)
}

/// Build an outermost-notification response (IKE_SA_INIT errors, cookie
/// challenges, INVALID_IKE_SPI answers)
///
/// The inbound SPIs are echoed; notification data sizes are preserved
/// verbatim.
pub(crate) fn build_notification_response(
    spis: SpiPair,
    exchange_type: ExchangeType,
    message_id: u32,
    initiator_flag: bool,
    code: u16,
    data: &[u8],
) -> Result<Vec<u8>, GeneratorError> {
    let body = ikewire::generator::encode_notify(SecurityProtocol::Reserved, None, code, data);
    MessageBuilder::new(exchange_type, message_id)
        .spis(spis.initiator, spis.responder)
        .initiator(initiator_flag)
        .response(true)
        .payload(PayloadType::Notify, body)
        .build()
}

/// Build a complete datagram around one sealed SK payload
#[allow(clippy::too_many_arguments)]
pub(crate) fn build_sk_packet(
    spis: SpiPair,
    exchange_type: ExchangeType,
    message_id: u32,
    initiator_flag: bool,
    response: bool,
    first_inner: PayloadType,
    blob: Vec<u8>,
) -> Result<Vec<u8>, GeneratorError> {
    MessageBuilder::new(exchange_type, message_id)
        .spis(spis.initiator, spis.responder)
        .initiator(initiator_flag)
        .response(response)
        .sk_payload(first_inner, blob)
        .build()
}

/// Build a complete datagram around one sealed SKF fragment
#[allow(clippy::too_many_arguments)]
pub(crate) fn build_skf_packet(
    spis: SpiPair,
    exchange_type: ExchangeType,
    message_id: u32,
    initiator_flag: bool,
    response: bool,
    first_inner: Option<PayloadType>,
    number: u16,
    total: u16,
    blob: Vec<u8>,
) -> Result<Vec<u8>, GeneratorError> {
    MessageBuilder::new(exchange_type, message_id)
        .spis(spis.initiator, spis.responder)
        .initiator(initiator_flag)
        .response(response)
        .skf_payload(first_inner, number, total, blob)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ikewire::parser::decode_payloads;

    #[test]
    fn payload_chain_links_types() {
        let payloads = vec![
            (PayloadType::IdentificationInitiator, vec![2, 0, 0, 0, 0x61]),
            (PayloadType::Nonce, vec![0x13; 16]),
        ];
        let (first, chain) = encode_payload_chain(&payloads);
        assert_eq!(first, PayloadType::IdentificationInitiator);

        let mut chains = Chains::default();
        let summary = decode_payloads(&chain, first as u8, &mut chains);
        assert!(summary.ok());
        assert!(summary.present.contains(PayloadType::IdentificationInitiator));
        assert!(summary.present.contains(PayloadType::Nonce));
    }

    #[test]
    fn empty_chain_has_no_first() {
        let (first, chain) = encode_payload_chain(&[]);
        assert_eq!(first, PayloadType::NoNextPayload);
        assert!(chain.is_empty());
    }
}
