//! IKE_AUTH processors
//!
//! The second exchange runs inside SK: identities are declared, the AUTH
//! payload proves them, and the first child SA is negotiated alongside.
//! The responder side has an extra wrinkle: the request usually arrives
//! before SKEYSEED exists, so the first matching transition only starts
//! the derivation and suspends.

use std::sync::Arc;

use rand::RngCore;
use tracing::{debug, info, warn};

use ikewire::generator::{
    encode_auth, encode_identity, encode_notify, encode_security_association,
    encode_traffic_selectors,
};
use ikewire::params::{
    ExchangeType, IdType, NotifyError, NotifyStatus, PayloadType, SecurityProtocol,
};
use ikewire::payload::{PayloadBody, SecurityAssociation, TrafficSelector};

use crate::complete::Outcome;
use crate::config::AuthBy;
use crate::crypto::CryptoRequest;
use crate::dispatch::Demux;
use crate::exchange;
use crate::ident;
use crate::md::MessageDigest;
use crate::sa::{SaRole, SerialNo, State};

/// The traffic selectors of a message, by direction
fn selectors_of(md: &MessageDigest, ty: PayloadType) -> Option<Vec<TrafficSelector>> {
    md.chains.first(ty).and_then(|pd| match &pd.body {
        PayloadBody::TrafficSelectorsInitiator(ts) => Some(ts.clone()),
        PayloadBody::TrafficSelectorsResponder(ts) => Some(ts.clone()),
        _ => None,
    })
}

/// The auth method the peer used
fn auth_method_of(md: &MessageDigest) -> Option<AuthBy> {
    md.chains
        .first(PayloadType::Authentication)
        .and_then(|pd| match &pd.body {
            PayloadBody::Authentication(auth) => Some(AuthBy::from_auth_method(auth.method)),
            _ => None,
        })
}

/// The peer's ESP SPI out of its SA payload
fn peer_esp_spi(offer: &SecurityAssociation) -> Option<Vec<u8>> {
    offer
        .proposals
        .iter()
        .find(|p| p.protocol == SecurityProtocol::EncapsulatingSecurityPayload)
        .map(|p| p.spi.clone())
}

/// First IKE_AUTH transition on the responder: the SK payload cannot be
/// opened yet, kick off the SKEYSEED derivation and suspend
pub fn respond_no_skeyseed(
    demux: &mut Demux,
    sa: Option<SerialNo>,
    _md: &mut MessageDigest,
) -> Outcome {
    let Some(serial) = sa else {
        return Outcome::InternalError;
    };
    let Some(sa) = demux.table.get(serial) else {
        return Outcome::InternalError;
    };
    debug!("computing SKEYSEED for {serial} before the IKE_AUTH request can be read");
    let request = CryptoRequest::DeriveSkeyseed {
        spis: sa.spis,
        // the peer is the original initiator here
        nonce_i: sa.nonce_peer.clone(),
        nonce_r: sa.nonce_mine.clone(),
        ke_data: sa.ke_peer.clone(),
    };
    demux.queue_offload(serial, request);
    Outcome::Suspend
}

/// Responder: process the decrypted IKE_AUTH request, establish the IKE
/// SA and its first child, record the reply
pub fn respond_to_request(
    demux: &mut Demux,
    sa: Option<SerialNo>,
    md: &mut MessageDigest,
) -> Outcome {
    let Some(serial) = sa else {
        return Outcome::InternalError;
    };

    if ident::decode_peer_identity(demux, serial, md, false).is_err() {
        return Outcome::Fail(Some(NotifyError::AuthenticationFailed));
    }

    let (connection, expected_authby) = {
        let Some(sa) = demux.table.get(serial) else {
            return Outcome::InternalError;
        };
        (Arc::clone(&sa.connection), sa.connection.authby)
    };
    match auth_method_of(md) {
        Some(authby) if authby == expected_authby => {}
        _ => {
            demux.log_sa(serial, "peer used an unacceptable authentication method");
            return Outcome::Fail(Some(NotifyError::AuthenticationFailed));
        }
    }

    let Some(offer) = exchange::sa_payload_of(&md.chains) else {
        return Outcome::Fail(Some(NotifyError::InvalidSyntax));
    };
    let Some(peer_spi) = peer_esp_spi(offer) else {
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

    let ipcomp = connection.compress
        && md
            .chains
            .contains_notification(NotifyStatus::IpcompSupported.code());

    // the IKE SA is authenticated now
    let (spis, remote, window, msgid) = {
        let Some(sa) = demux.table.get_mut(serial) else {
            return Outcome::InternalError;
        };
        sa.state = State::ParentR2;
        (sa.spis, sa.remote, sa.window, md.hdr.message_id)
    };
    demux.mark_ike_established(serial);
    info!(serial = %serial, connection = %connection.name, "IKE SA established");

    let mut mine_spi = vec![0u8; 4];
    rand::thread_rng().fill_bytes(&mut mine_spi);

    let child = demux.table.insert(|child_serial| {
        let mut child = exchange::new_sa(
            child_serial,
            SaRole::Responder,
            State::IpsecR,
            Arc::clone(&connection),
            spis,
            remote,
            window,
        );
        child.parent = Some(serial);
        child.exchange_msgid = Some(msgid);
        child.ts = Some((tsr.clone(), tsi.clone()));
        child.ipsec_spis = Some((mine_spi.clone(), peer_spi));
        child.ipcomp_cpi = ipcomp.then(|| child_serial.0 as u16 | 0x4000);
        child
    });
    md.sa = Some(child);

    let Ok(sa_body) = encode_security_association(&SecurityAssociation {
        proposals: vec![exchange::default_esp_proposal(mine_spi)],
    }) else {
        return Outcome::InternalError;
    };
    let auth_data = demux
        .table
        .get(serial)
        .and_then(|sa| sa.keys.as_ref())
        .map(|keys| keys.sk_pr.clone())
        .unwrap_or_default();

    let mut payloads = vec![
        (
            PayloadType::IdentificationResponder,
            encode_identity(IdType::Fqdn, connection.name.as_bytes()),
        ),
        (
            PayloadType::Authentication,
            encode_auth(exchange::auth_method_for(expected_authby), &auth_data),
        ),
        (PayloadType::SecurityAssociation, sa_body),
        (
            PayloadType::TrafficSelectorInitiator,
            encode_traffic_selectors(&tsi),
        ),
        (
            PayloadType::TrafficSelectorResponder,
            encode_traffic_selectors(&tsr),
        ),
    ];
    if let Some(cpi) = demux.table.get(child).and_then(|c| c.ipcomp_cpi) {
        let mut data = cpi.to_be_bytes().to_vec();
        data.push(2); // DEFLATE
        payloads.push((
            PayloadType::Notify,
            encode_notify(
                SecurityProtocol::Reserved,
                None,
                NotifyStatus::IpcompSupported.code(),
                &data,
            ),
        ));
    }

    let packets = demux.seal_message(serial, ExchangeType::IkeAuth, msgid, true, payloads);
    if packets.is_empty() {
        return Outcome::InternalError;
    }
    demux.record_response(serial, packets);
    Outcome::Ok
}

/// Initiator: process the IKE_AUTH response, establishing the IKE SA and
/// the first child
pub fn process_response(
    demux: &mut Demux,
    sa: Option<SerialNo>,
    md: &mut MessageDigest,
) -> Outcome {
    let Some(serial) = sa else {
        return Outcome::InternalError;
    };

    if ident::decode_peer_identity(demux, serial, md, true).is_err() {
        demux.log_sa(serial, "responder identity did not match the connection");
        return Outcome::Fatal;
    }
    let expected_authby = demux
        .table
        .get(serial)
        .map(|sa| sa.connection.authby)
        .unwrap_or(AuthBy::Never);
    match auth_method_of(md) {
        Some(authby) if authby == expected_authby => {}
        _ => {
            demux.log_sa(serial, "responder used an unacceptable authentication method");
            return Outcome::Fatal;
        }
    }

    let Some(offer) = exchange::sa_payload_of(&md.chains) else {
        return Outcome::Fatal;
    };
    let Some(peer_spi) = peer_esp_spi(offer) else {
        return Outcome::Fatal;
    };
    let (Some(tsi), Some(tsr)) = (
        selectors_of(md, PayloadType::TrafficSelectorInitiator),
        selectors_of(md, PayloadType::TrafficSelectorResponder),
    ) else {
        return Outcome::Fatal;
    };

    let (connection, spis, remote, window, mine_spi) = {
        let Some(sa) = demux.table.get_mut(serial) else {
            return Outcome::InternalError;
        };
        sa.state = State::ParentI3;
        let mine = sa
            .ipsec_spis
            .take()
            .map(|(mine, _)| mine)
            .unwrap_or_default();
        (
            Arc::clone(&sa.connection),
            sa.spis,
            sa.remote,
            sa.window,
            mine,
        )
    };
    demux.mark_ike_established(serial);
    info!(serial = %serial, connection = %connection.name, "IKE SA established");

    let msgid = md.hdr.message_id;
    let child = demux.table.insert(|child_serial| {
        let mut child = exchange::new_sa(
            child_serial,
            SaRole::Initiator,
            State::IpsecI,
            connection,
            spis,
            remote,
            window,
        );
        child.parent = Some(serial);
        child.exchange_msgid = Some(msgid);
        child.ts = Some((tsi, tsr));
        child.ipsec_spis = Some((mine_spi, peer_spi));
        child
    });
    md.sa = Some(child);
    Outcome::Ok
}

/// Initiator: the AUTH reply carried the failure notification this row
/// was selected for
pub fn process_failure_notification(
    demux: &mut Demux,
    sa: Option<SerialNo>,
    md: &mut MessageDigest,
) -> Outcome {
    let code = md
        .chains
        .notifications()
        .find_map(|n| n.error())
        .map(|e| e.to_string())
        .unwrap_or_else(|| "unknown".into());
    if let Some(serial) = sa {
        demux.log_sa(serial, &format!("IKE_AUTH failed with {code}"));
    }
    Outcome::Fatal
}

/// Initiator: the AUTH reply carried notifications this table knows no
/// specific row for
pub fn process_unknown_notification(
    demux: &mut Demux,
    sa: Option<SerialNo>,
    md: &mut MessageDigest,
) -> Outcome {
    if let Some(error) = md.chains.notifications().find_map(|n| n.error()) {
        // an unrecognized error in a response fails the whole request
        if let Some(serial) = sa {
            demux.log_sa(serial, &format!("IKE_AUTH failed with {error}"));
        }
        return Outcome::Fatal;
    }
    warn!("ignoring IKE_AUTH response carrying only unknown status notifications");
    Outcome::Ignore
}
