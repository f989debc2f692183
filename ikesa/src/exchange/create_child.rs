//! CREATE_CHILD_SA processors
//!
//! One exchange, three jobs: negotiate an additional IPsec SA, rekey an
//! IPsec SA, or rekey the IKE SA itself. The dispatcher has already
//! resolved (or allocated) the child the exchange runs on; rekey-IKE
//! children are emancipated by the completion engine once their
//! transition succeeds.

use rand::RngCore;
use tracing::debug;

use ikewire::generator::{encode_key_exchange, encode_security_association, encode_traffic_selectors};
use ikewire::params::{ExchangeType, NotifyError, PayloadType, SecurityProtocol};
use ikewire::payload::{PayloadBody, SecurityAssociation, TrafficSelector};

use crate::complete::Outcome;
use crate::dispatch::Demux;
use crate::exchange;
use crate::md::MessageDigest;
use crate::sa::{fresh_spi, SerialNo, SpiPair};

fn selectors_of(md: &MessageDigest, ty: PayloadType) -> Option<Vec<TrafficSelector>> {
    md.chains.first(ty).and_then(|pd| match &pd.body {
        PayloadBody::TrafficSelectorsInitiator(ts) => Some(ts.clone()),
        PayloadBody::TrafficSelectorsResponder(ts) => Some(ts.clone()),
        _ => None,
    })
}

/// The 8-octet IKE SPI offered in a rekey-IKE proposal
fn rekey_ike_spi(offer: &SecurityAssociation) -> Option<u64> {
    offer
        .proposals
        .iter()
        .find(|p| p.protocol == SecurityProtocol::InternetKeyExchange)
        .and_then(|p| <[u8; 8]>::try_from(p.spi.as_slice()).ok())
        .map(u64::from_be_bytes)
}

fn esp_spi(offer: &SecurityAssociation) -> Option<Vec<u8>> {
    offer
        .proposals
        .iter()
        .find(|p| p.protocol == SecurityProtocol::EncapsulatingSecurityPayload)
        .map(|p| p.spi.clone())
}

/// Respond to a CREATE_CHILD_SA negotiating a fresh (or rekeyed) IPsec SA
pub fn respond_to_request(
    demux: &mut Demux,
    sa: Option<SerialNo>,
    md: &mut MessageDigest,
) -> Outcome {
    let Some(child) = sa else {
        return Outcome::InternalError;
    };
    let Some(ike) = demux.table.ike_of(child) else {
        return Outcome::InternalError;
    };

    if exchange::accept_nonce(&md.chains).is_err() {
        return Outcome::Fail(Some(NotifyError::InvalidSyntax));
    }
    let Some(offer) = exchange::sa_payload_of(&md.chains) else {
        return Outcome::Fail(Some(NotifyError::InvalidSyntax));
    };
    let Some(peer_spi) = esp_spi(offer) else {
        return Outcome::Fail(Some(NotifyError::NoProposalChosen));
    };
    let (Some(tsi), Some(tsr)) = (
        selectors_of(md, PayloadType::TrafficSelectorInitiator),
        selectors_of(md, PayloadType::TrafficSelectorResponder),
    ) else {
        return Outcome::Fail(Some(NotifyError::InvalidSyntax));
    };
    if tsi.is_empty() || tsr.is_empty() {
        return Outcome::Fail(Some(NotifyError::TsUnacceptable));
    }

    let mut nonce_mine = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce_mine);
    let mut mine_spi = vec![0u8; 4];
    rand::thread_rng().fill_bytes(&mut mine_spi);

    if let Some(child_sa) = demux.table.get_mut(child) {
        child_sa.ts = Some((tsr.clone(), tsi.clone()));
        child_sa.ipsec_spis = Some((mine_spi.clone(), peer_spi));
        child_sa.nonce_mine = nonce_mine.clone();
    }

    let Ok(sa_body) = encode_security_association(&SecurityAssociation {
        proposals: vec![exchange::default_esp_proposal(mine_spi)],
    }) else {
        return Outcome::InternalError;
    };
    let payloads = vec![
        (PayloadType::SecurityAssociation, sa_body),
        (PayloadType::Nonce, nonce_mine),
        (PayloadType::TrafficSelectorInitiator, encode_traffic_selectors(&tsi)),
        (PayloadType::TrafficSelectorResponder, encode_traffic_selectors(&tsr)),
    ];
    let packets = demux.seal_message(
        ike,
        ExchangeType::CreateChildSa,
        md.hdr.message_id,
        true,
        payloads,
    );
    if packets.is_empty() {
        return Outcome::InternalError;
    }
    demux.record_response(ike, packets);
    Outcome::Ok
}

/// Process the reply to a CREATE_CHILD_SA we initiated for an IPsec SA
pub fn process_child_response(
    demux: &mut Demux,
    sa: Option<SerialNo>,
    md: &mut MessageDigest,
) -> Outcome {
    let Some(child) = sa else {
        return Outcome::InternalError;
    };

    if exchange::accept_nonce(&md.chains).is_err() {
        return Outcome::Fatal;
    }
    let Some(offer) = exchange::sa_payload_of(&md.chains) else {
        return Outcome::Fatal;
    };
    let Some(peer_spi) = esp_spi(offer) else {
        // the responder may have declined with a notification instead
        if let Some(error) = md.chains.notifications().find_map(|n| n.error()) {
            demux.log_sa(child, &format!("CREATE_CHILD_SA declined: {error}"));
            return Outcome::Drop;
        }
        return Outcome::Fatal;
    };
    let (Some(tsi), Some(tsr)) = (
        selectors_of(md, PayloadType::TrafficSelectorInitiator),
        selectors_of(md, PayloadType::TrafficSelectorResponder),
    ) else {
        return Outcome::Fatal;
    };

    if let Some(child_sa) = demux.table.get_mut(child) {
        child_sa.ts = Some((tsi, tsr));
        if let Some((mine, _)) = child_sa.ipsec_spis.take() {
            child_sa.ipsec_spis = Some((mine, peer_spi));
        }
    }
    Outcome::Ok
}

/// Respond to a CREATE_CHILD_SA rekeying the IKE SA itself
///
/// On success the completion engine emancipates this child into the new
/// IKE SA carrying the SPI pair agreed here.
pub fn respond_to_ike_rekey(
    demux: &mut Demux,
    sa: Option<SerialNo>,
    md: &mut MessageDigest,
) -> Outcome {
    let Some(child) = sa else {
        return Outcome::InternalError;
    };
    let Some(ike) = demux.table.ike_of(child) else {
        return Outcome::InternalError;
    };

    if exchange::accept_nonce(&md.chains).is_err() {
        return Outcome::Fail(Some(NotifyError::InvalidSyntax));
    }
    let Some(offer) = exchange::sa_payload_of(&md.chains) else {
        return Outcome::Fail(Some(NotifyError::InvalidSyntax));
    };
    let Some(peer_new_spi) = rekey_ike_spi(offer) else {
        return Outcome::Fail(Some(NotifyError::NoProposalChosen));
    };

    let new_spis = SpiPair {
        initiator: peer_new_spi,
        responder: fresh_spi(),
    };
    debug!(
        "rekeying IKE SA {ike}: new SPIs {:016x}/{:016x}",
        new_spis.initiator, new_spis.responder
    );

    let mut nonce_mine = vec![0u8; 32];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut nonce_mine);
    let group = demux.table.get(ike).map(|sa| sa.ke_group).unwrap_or(31);
    let mut ke_public = vec![0u8; 32];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut ke_public);

    let peer_nonce = exchange::nonce_of(&md.chains).unwrap_or_default();
    let peer_ke = md
        .chains
        .first(PayloadType::KeyExchange)
        .and_then(|pd| match &pd.body {
            PayloadBody::KeyExchange(ke) => Some(ke.data.clone()),
            _ => None,
        })
        .unwrap_or_default();
    if let Some(child_sa) = demux.table.get_mut(child) {
        child_sa.rekey_spis = Some(new_spis);
        child_sa.nonce_mine = nonce_mine.clone();
        child_sa.nonce_peer = peer_nonce.clone();
        child_sa.ke_peer = peer_ke.clone();
    }
    // fresh keys for the successor SA; until the worker returns, the
    // emancipated SA is busy and drops inbound traffic
    demux.queue_offload(
        child,
        crate::crypto::CryptoRequest::DeriveSkeyseed {
            spis: new_spis,
            nonce_i: peer_nonce,
            nonce_r: nonce_mine.clone(),
            ke_data: peer_ke,
        },
    );

    let Ok(sa_body) = encode_security_association(&SecurityAssociation {
        proposals: vec![exchange::default_ike_proposal(
            new_spis.responder.to_be_bytes().to_vec(),
        )],
    }) else {
        return Outcome::InternalError;
    };
    let payloads = vec![
        (PayloadType::SecurityAssociation, sa_body),
        (PayloadType::Nonce, nonce_mine),
        (PayloadType::KeyExchange, encode_key_exchange(group, &ke_public)),
    ];
    let packets = demux.seal_message(
        ike,
        ExchangeType::CreateChildSa,
        md.hdr.message_id,
        true,
        payloads,
    );
    if packets.is_empty() {
        return Outcome::InternalError;
    }
    demux.record_response(ike, packets);
    Outcome::Ok
}

/// Process the reply to an IKE rekey we initiated
pub fn process_ike_rekey_response(
    demux: &mut Demux,
    sa: Option<SerialNo>,
    md: &mut MessageDigest,
) -> Outcome {
    let Some(child) = sa else {
        return Outcome::InternalError;
    };

    if exchange::accept_nonce(&md.chains).is_err() {
        return Outcome::Fatal;
    }
    let Some(offer) = exchange::sa_payload_of(&md.chains) else {
        return Outcome::Fatal;
    };
    let Some(peer_new_spi) = rekey_ike_spi(offer) else {
        return Outcome::Fatal;
    };

    let peer_nonce = exchange::nonce_of(&md.chains).unwrap_or_default();
    let peer_ke = md
        .chains
        .first(PayloadType::KeyExchange)
        .and_then(|pd| match &pd.body {
            PayloadBody::KeyExchange(ke) => Some(ke.data.clone()),
            _ => None,
        })
        .unwrap_or_default();
    let (spis, nonce_mine) = {
        let Some(child_sa) = demux.table.get_mut(child) else {
            return Outcome::InternalError;
        };
        if let Some(spis) = child_sa.rekey_spis.as_mut() {
            spis.responder = peer_new_spi;
        }
        child_sa.nonce_peer = peer_nonce.clone();
        child_sa.ke_peer = peer_ke.clone();
        (
            child_sa.rekey_spis.unwrap_or_default(),
            child_sa.nonce_mine.clone(),
        )
    };
    demux.queue_offload(
        child,
        crate::crypto::CryptoRequest::DeriveSkeyseed {
            spis,
            nonce_i: nonce_mine,
            nonce_r: peer_nonce,
            ke_data: peer_ke,
        },
    );
    Outcome::Ok
}
