//! The peer-identity resolver
//!
//! During IKE_AUTH each side declares who it is. The initiator committed
//! to a connection when it started and never switches; the responder
//! starts on a default connection and may discover, once the peer's
//! identity is on the table, that a more specific template was meant.
//! Switching re-runs the checks under the new connection, with a depth
//! cap against pathological template chains.

use tracing::{debug, info, warn};

use ikewire::params::{IdType, PayloadType};
use ikewire::payload::{Identity, PayloadBody};

use crate::config::AuthBy;
use crate::dispatch::Demux;
use crate::md::MessageDigest;
use crate::sa::SerialNo;

/// Cap on connection switches while decoding one peer identity
const MAX_REFINEMENT_DEPTH: usize = 10;

/// Why identity decoding failed
#[derive(Debug, PartialEq, Eq)]
pub enum IdentityError {
    /// The message carries no usable ID payload
    Missing,
    /// The declared identity does not satisfy any acceptable connection
    Mismatch,
    /// Template refinement kept switching without settling
    Confusion,
}

fn declared_identity(md: &MessageDigest, initiator: bool) -> Option<Identity> {
    let ty = if initiator {
        PayloadType::IdentificationResponder
    } else {
        PayloadType::IdentificationInitiator
    };
    md.chains.first(ty).and_then(|pd| match &pd.body {
        PayloadBody::IdInitiator(id) | PayloadBody::IdResponder(id) => Some(id.clone()),
        _ => None,
    })
}

/// The IDr payload of a request: the identity the initiator thinks we
/// have ("you Tarzan, me Jane")
fn tarzan_identity(md: &MessageDigest) -> Option<Identity> {
    md.chains
        .first(PayloadType::IdentificationResponder)
        .and_then(|pd| match &pd.body {
            PayloadBody::IdResponder(id) => Some(id.clone()),
            _ => None,
        })
}

fn peer_authby(md: &MessageDigest) -> AuthBy {
    md.chains
        .first(PayloadType::Authentication)
        .and_then(|pd| match &pd.body {
            PayloadBody::Authentication(auth) => Some(AuthBy::from_auth_method(auth.method)),
            _ => None,
        })
        .unwrap_or(AuthBy::Never)
}

/// Extract the peer's declared identity and settle which connection the
/// SA runs under
///
/// `initiator` selects which ID payload carries the peer's declaration
/// (IDr when we initiated, IDi when we respond) and whether connection
/// switching is allowed at all.
pub fn decode_peer_identity(
    demux: &mut Demux,
    ike: SerialNo,
    md: &MessageDigest,
    initiator: bool,
) -> Result<(), IdentityError> {
    let Some(peer_id) = declared_identity(md, initiator) else {
        warn!("no peer ID payload in IKE_AUTH");
        return Err(IdentityError::Missing);
    };

    for depth in 0..MAX_REFINEMENT_DEPTH {
        let Some(sa) = demux.table.get(ike) else {
            return Err(IdentityError::Missing);
        };
        let connection = &sa.connection;
        let opportunistic = connection.opportunistic;

        let matches = connection
            .peer_id
            .as_ref()
            .map(|pattern| pattern.matches(peer_id.id_type, &peer_id.data))
            .unwrap_or(true);

        if matches {
            if !opportunistic {
                info!(
                    serial = %ike,
                    connection = %connection.name,
                    "peer ID is {}: {:?}",
                    peer_id.id_type,
                    String::from_utf8_lossy(&peer_id.data)
                );
            }
            return Ok(());
        }

        if initiator {
            // we must not switch horses: an explicit initiation carries
            // the user's intent
            warn!(
                serial = %ike,
                "we require the peer to declare a different ID, but it declares {:?}",
                String::from_utf8_lossy(&peer_id.data)
            );
            return Err(IdentityError::Mismatch);
        }

        let authby = peer_authby(md);

        // a declined ID_NULL wildcard: only acceptable when our policy
        // embraces null authentication
        if peer_id.id_type == IdType::Null
            || tarzan_identity(md).map(|id| id.id_type) == Some(IdType::Null)
        {
            if authby == AuthBy::Null && connection.authby == AuthBy::Null {
                debug!("peer wants ID_NULL and the connection allows it");
                return Ok(());
            }
            return Err(IdentityError::Mismatch);
        }

        let refined = demux
            .connections
            .refine(connection, peer_id.id_type, &peer_id.data, authby);
        match refined {
            Some(better) => {
                info!(
                    serial = %ike,
                    "switched from \"{}\" to \"{}\"",
                    connection.name, better.name
                );
                if let Some(sa) = demux.table.get_mut(ike) {
                    sa.connection = better;
                }
                // redo from scratch so the checks run under the new
                // connection
                debug!("retrying identity decode at depth {}", depth + 1);
                continue;
            }
            None => {
                warn!(
                    serial = %ike,
                    "peer ID mismatched and no better connection found"
                );
                return Err(IdentityError::Mismatch);
            }
        }
    }

    warn!("decoding peer ID failed due to confusion");
    Err(IdentityError::Confusion)
}
