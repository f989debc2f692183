//! IKE_SA_INIT processors
//!
//! The initial exchange runs in the clear: SAi/SAr pick the algorithms,
//! KEi/KEr carry the Diffie-Hellman publics and Ni/Nr the nonces. The
//! responder allocates its SA here; the initiator learns the responder
//! SPI and, after deriving SKEYSEED, moves on to IKE_AUTH.

use std::sync::Arc;

use rand::RngCore;
use tracing::{debug, info, warn};

use ikewire::generator::{encode_key_exchange, encode_notify, encode_security_association};
use ikewire::params::{
    ExchangeType, NotifyError, NotifyStatus, PayloadType, SecurityProtocol,
};
use ikewire::payload::{PayloadBody, SecurityAssociation};

use crate::complete::Outcome;
use crate::crypto::CryptoRequest;
use crate::dispatch::Demux;
use crate::exchange;
use crate::md::MessageDigest;
use crate::sa::{fresh_spi, SaRole, SerialNo, SpiPair, State};

/// Pick the IKE proposal this host accepts out of the peer's offer
fn select_ike_proposal(offer: &SecurityAssociation) -> Option<(u8, u16)> {
    for proposal in &offer.proposals {
        if proposal.protocol != SecurityProtocol::InternetKeyExchange {
            continue;
        }
        let has_encryption = proposal
            .transforms
            .iter()
            .any(|t| t.kind == ikewire::params::TransformType::EncryptionAlgorithm);
        if !has_encryption {
            continue;
        }
        let group = proposal
            .transforms
            .iter()
            .find(|t| t.kind == ikewire::params::TransformType::KeyExchangeMethod)
            .map(|t| t.id)
            .unwrap_or(31);
        return Some((proposal.number, group));
    }
    None
}

/// Whether the message advertises RFC 7383 fragmentation support
fn peer_supports_fragmentation(md: &MessageDigest) -> bool {
    md.chains
        .contains_notification(NotifyStatus::FragmentationSupported.code())
}

/// Respond to an IKE_SA_INIT request: allocate the responder SA and
/// record the SAr/KEr/Nr reply
pub fn respond_to_request(
    demux: &mut Demux,
    sa: Option<SerialNo>,
    md: &mut MessageDigest,
) -> Outcome {
    if sa.is_some() {
        // duplicates are answered by the retransmit logic, never here
        debug!("IKE_SA_INIT request reached the responder twice; ignoring");
        return Outcome::Ignore;
    }

    let Some(connection) = demux.connections.default_responder() else {
        warn!("no connection accepts inbound IKE_SA_INIT");
        return Outcome::Fail(Some(NotifyError::NoProposalChosen));
    };

    let Ok(peer_nonce) = exchange::accept_nonce(&md.chains) else {
        return Outcome::Fail(Some(NotifyError::InvalidSyntax));
    };
    let Some(offer) = exchange::sa_payload_of(&md.chains) else {
        return Outcome::Fail(Some(NotifyError::InvalidSyntax));
    };
    let Some((_, group)) = select_ike_proposal(offer) else {
        return Outcome::Fail(Some(NotifyError::NoProposalChosen));
    };

    let Some(ke) = md.chains.first(PayloadType::KeyExchange).and_then(|pd| {
        match &pd.body {
            PayloadBody::KeyExchange(ke) => Some(ke.clone()),
            _ => None,
        }
    }) else {
        return Outcome::Fail(Some(NotifyError::InvalidSyntax));
    };
    if ke.dh_group != group {
        // tell the peer which group we want; the data is the 16-bit
        // group number
        demux.send_notification_response_from_md(
            md,
            NotifyError::InvalidKePayload.code(),
            &group.to_be_bytes(),
        );
        return Outcome::Fail(None);
    }

    let mut nonce_mine = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce_mine);
    let mut ke_public = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut ke_public);

    let spis = SpiPair {
        initiator: md.hdr.spis.initiator,
        responder: fresh_spi(),
    };
    let remote = md.sender;
    let window = connection.window;
    let fragmentation = peer_supports_fragmentation(md);
    let allow_fragmentation = connection.allow_fragmentation;

    let serial = demux.table.insert(|serial| {
        let mut sa = exchange::new_sa(
            serial,
            SaRole::Responder,
            State::ParentR0,
            Arc::clone(&connection),
            spis,
            remote,
            window,
        );
        sa.nonce_peer = peer_nonce;
        sa.nonce_mine = nonce_mine.clone();
        sa.ke_group = group;
        sa.ke_peer = ke.data.clone();
        sa.ke_public_mine = ke_public.clone();
        sa.seen_fragmentation_vid = fragmentation;
        sa
    });
    md.sa = Some(serial);
    info!(serial = %serial, connection = %connection.name, "responding to IKE_SA_INIT");

    let Ok(sa_body) = encode_security_association(&SecurityAssociation {
        proposals: vec![exchange::default_ike_proposal(vec![])],
    }) else {
        return Outcome::InternalError;
    };

    let mut builder = ikewire::generator::MessageBuilder::new(ExchangeType::IkeSaInit, 0)
        .spis(spis.initiator, spis.responder)
        .initiator(false)
        .response(true)
        .payload(PayloadType::SecurityAssociation, sa_body)
        .payload(PayloadType::KeyExchange, encode_key_exchange(group, &ke_public))
        .payload(PayloadType::Nonce, nonce_mine);
    if allow_fragmentation {
        builder = builder.payload(
            PayloadType::Notify,
            encode_notify(
                SecurityProtocol::Reserved,
                None,
                NotifyStatus::FragmentationSupported.code(),
                &[],
            ),
        );
    }
    let Ok(packet) = builder.build() else {
        return Outcome::InternalError;
    };
    demux.record_response(serial, vec![packet]);
    Outcome::Ok
}

/// Process the IKE_SA_INIT reply: derive SKEYSEED (asynchronously), then
/// record the IKE_AUTH request
pub fn process_response(
    demux: &mut Demux,
    sa: Option<SerialNo>,
    md: &mut MessageDigest,
) -> Outcome {
    let Some(serial) = sa else {
        return Outcome::InternalError;
    };

    let skeyseed_computed = demux
        .table
        .get(serial)
        .map(|sa| sa.skeyseed_computed)
        .unwrap_or(false);

    if !skeyseed_computed {
        let Ok(peer_nonce) = exchange::accept_nonce(&md.chains) else {
            return Outcome::Fatal;
        };
        let Some(ke) = md.chains.first(PayloadType::KeyExchange).and_then(|pd| {
            match &pd.body {
                PayloadBody::KeyExchange(ke) => Some(ke.clone()),
                _ => None,
            }
        }) else {
            return Outcome::Fatal;
        };
        let fragmentation = peer_supports_fragmentation(md);

        let Some(sa_mut) = demux.table.get_mut(serial) else {
            return Outcome::InternalError;
        };
        sa_mut.nonce_peer = peer_nonce;
        sa_mut.ke_peer = ke.data;
        sa_mut.seen_fragmentation_vid &= fragmentation;

        let request = CryptoRequest::DeriveSkeyseed {
            spis: sa_mut.spis,
            nonce_i: sa_mut.nonce_mine.clone(),
            nonce_r: sa_mut.nonce_peer.clone(),
            ke_data: sa_mut.ke_peer.clone(),
        };
        demux.queue_offload(serial, request);
        return Outcome::Suspend;
    }

    // resumed with keys in hand: initiate IKE_AUTH
    let (msgid, local_id, authby, mine_spi) = {
        let Some(sa) = demux.table.get(serial) else {
            return Outcome::InternalError;
        };
        let mut spi = vec![0u8; 4];
        rand::thread_rng().fill_bytes(&mut spi);
        (
            sa.msgid.next_use,
            sa.connection.name.clone().into_bytes(),
            sa.connection.authby,
            spi,
        )
    };

    let Ok(sa_body) = encode_security_association(&SecurityAssociation {
        proposals: vec![exchange::default_esp_proposal(mine_spi.clone())],
    }) else {
        return Outcome::InternalError;
    };
    let auth_data = demux
        .table
        .get(serial)
        .and_then(|sa| sa.keys.as_ref())
        .map(|keys| keys.sk_pi.clone())
        .unwrap_or_default();

    let payloads = vec![
        (
            PayloadType::IdentificationInitiator,
            ikewire::generator::encode_identity(ikewire::params::IdType::Fqdn, &local_id),
        ),
        (
            PayloadType::Authentication,
            ikewire::generator::encode_auth(exchange::auth_method_for(authby), &auth_data),
        ),
        (PayloadType::SecurityAssociation, sa_body),
        (
            PayloadType::TrafficSelectorInitiator,
            ikewire::generator::encode_traffic_selectors(&exchange::wildcard_selectors()),
        ),
        (
            PayloadType::TrafficSelectorResponder,
            ikewire::generator::encode_traffic_selectors(&exchange::wildcard_selectors()),
        ),
    ];

    let packets = demux.seal_message(serial, ExchangeType::IkeAuth, msgid, false, payloads);
    if packets.is_empty() {
        return Outcome::InternalError;
    }
    if let Some(sa) = demux.table.get_mut(serial) {
        sa.ipsec_spis = Some((mine_spi, vec![]));
    }
    demux.record_request(serial, packets);
    Outcome::Ok
}

/// Process an error notification answering our IKE_SA_INIT request
///
/// COOKIE and INVALID_KE_PAYLOAD restart the exchange from scratch with
/// the demanded parameters; any other error ends the attempt.
pub fn process_response_notification(
    demux: &mut Demux,
    sa: Option<SerialNo>,
    md: &mut MessageDigest,
) -> Outcome {
    let Some(serial) = sa else {
        return Outcome::InternalError;
    };

    let cookie = md
        .chains
        .notifications()
        .find(|n| n.status() == Some(NotifyStatus::Cookie))
        .map(|n| n.data.clone());
    if let Some(cookie) = cookie {
        debug!("responder demands a cookie of {} octets; restarting", cookie.len());
        if let Some(sa) = demux.table.get_mut(serial) {
            sa.cookie_to_echo = Some(cookie);
        }
        // The repeated request must look like a shiny new init to the
        // counter bookkeeping: drop the response flag so `last_acked`
        // stays untouched and the real reply is still accepted.
        md.hdr.flags &= !ikewire::params::FLAG_RESPONSE;
        return restart_init_request(demux, serial);
    }

    let bad_ke = md
        .chains
        .notifications()
        .find(|n| n.error() == Some(NotifyError::InvalidKePayload))
        .map(|n| n.data.clone());
    if let Some(data) = bad_ke {
        let group = data
            .first()
            .zip(data.get(1))
            .map(|(hi, lo)| u16::from_be_bytes([*hi, *lo]));
        if let (Some(group), Some(sa)) = (group, demux.table.get_mut(serial)) {
            debug!("responder wants DH group {group}; restarting");
            sa.ke_group = group;
        }
        md.hdr.flags &= !ikewire::params::FLAG_RESPONSE;
        return restart_init_request(demux, serial);
    }

    if let Some(error) = md.chains.notifications().find_map(|n| n.error()) {
        demux.log_sa(serial, &format!("IKE_SA_INIT failed: {error}"));
        return Outcome::Fatal;
    }

    // status notifications alone mean nothing here
    Outcome::Ignore
}

/// Reset the Message-ID counters and re-record the IKE_SA_INIT request,
/// including whatever cookie the responder demanded
fn restart_init_request(demux: &mut Demux, serial: SerialNo) -> Outcome {
    let Some(sa) = demux.table.get_mut(serial) else {
        return Outcome::InternalError;
    };
    debug!("restarting Message ID of state {serial}");
    sa.msgid.restart();
    sa.state = State::ParentI0;

    let packet = build_init_request(
        sa.spis.initiator,
        sa.ke_group,
        &sa.ke_public_mine,
        &sa.nonce_mine,
        sa.cookie_to_echo.as_deref(),
        sa.connection.allow_fragmentation,
    );
    match packet {
        Some(packet) => {
            demux.record_request(serial, vec![packet]);
            Outcome::Ok
        }
        None => Outcome::InternalError,
    }
}

/// Encode a fresh IKE_SA_INIT request; the echoed cookie, when present,
/// leads the payload chain
pub(crate) fn build_init_request(
    spi_i: u64,
    group: u16,
    ke_public: &[u8],
    nonce: &[u8],
    cookie: Option<&[u8]>,
    advertise_fragmentation: bool,
) -> Option<Vec<u8>> {
    let sa_body = encode_security_association(&SecurityAssociation {
        proposals: vec![exchange::default_ike_proposal(vec![])],
    })
    .ok()?;

    let mut builder = ikewire::generator::MessageBuilder::new(ExchangeType::IkeSaInit, 0)
        .spis(spi_i, 0)
        .initiator(true)
        .response(false);
    if let Some(cookie) = cookie {
        builder = builder.payload(
            PayloadType::Notify,
            encode_notify(
                SecurityProtocol::Reserved,
                None,
                NotifyStatus::Cookie.code(),
                cookie,
            ),
        );
    }
    builder = builder
        .payload(PayloadType::SecurityAssociation, sa_body)
        .payload(PayloadType::KeyExchange, encode_key_exchange(group, ke_public))
        .payload(PayloadType::Nonce, nonce.to_vec());
    if advertise_fragmentation {
        builder = builder.payload(
            PayloadType::Notify,
            encode_notify(
                SecurityProtocol::Reserved,
                None,
                NotifyStatus::FragmentationSupported.code(),
                &[],
            ),
        );
    }
    builder.build().ok()
}
