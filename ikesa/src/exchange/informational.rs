//! INFORMATIONAL processors
//!
//! One handler covers requests and responses on established IKE SAs:
//! Delete payloads tear down children or the whole IKE SA, empty
//! requests serve as liveness probes, and an empty response acknowledges
//! whatever we sent. Deleting the IKE SA itself needs care: the reply
//! must leave before the state (and its recorded-message slot) goes away.

use tracing::{debug, info};

use ikewire::generator::encode_delete;
use ikewire::params::{ExchangeType, PayloadType, SecurityProtocol};
use ikewire::payload::{DeletePayload, PayloadBody};

use crate::complete::Outcome;
use crate::dispatch::Demux;
use crate::md::MessageDigest;
use crate::sa::{SerialNo, State};

fn delete_payloads(md: &MessageDigest) -> Vec<DeletePayload> {
    md.chains
        .iter(PayloadType::Delete)
        .filter_map(|pd| match &pd.body {
            PayloadBody::Delete(d) => Some(d.clone()),
            _ => None,
        })
        .collect()
}

/// Process an INFORMATIONAL message on an established IKE SA
pub fn process(demux: &mut Demux, sa: Option<SerialNo>, md: &mut MessageDigest) -> Outcome {
    let Some(serial) = sa else {
        return Outcome::InternalError;
    };
    let Some(ike) = demux.table.ike_of(serial) else {
        return Outcome::InternalError;
    };

    if md.is_response() {
        let state = demux.table.get(ike).map(|sa| sa.state);
        if state == Some(State::IkeSaDel) {
            // the peer acknowledged our delete
            info!("IKE SA {ike} deleted by mutual agreement");
            demux.delete_sa_tree(ike);
            md.sa = None;
        }
        return Outcome::Ok;
    }

    let deletes = delete_payloads(md);
    let delete_ike = deletes
        .iter()
        .any(|d| d.protocol == SecurityProtocol::InternetKeyExchange);

    // tear down the children named by ESP/AH deletes, answering with our
    // own SPIs for them
    let mut answered_spis: Vec<Vec<u8>> = vec![];
    for delete in &deletes {
        if delete.protocol == SecurityProtocol::InternetKeyExchange {
            continue;
        }
        for spi in &delete.spis {
            let victim = demux.table.children_of(ike).into_iter().find(|&child| {
                demux
                    .table
                    .get(child)
                    .and_then(|sa| sa.ipsec_spis.as_ref())
                    .is_some_and(|(mine, peer)| peer == spi || mine == spi)
            });
            if let Some(child) = victim {
                if let Some(mine) = demux
                    .table
                    .get(child)
                    .and_then(|sa| sa.ipsec_spis.as_ref())
                    .map(|(mine, _)| mine.clone())
                {
                    answered_spis.push(mine);
                }
                debug!("deleting child SA {child} on peer request");
                demux.delete_sa_tree(child);
            }
        }
    }

    let mut payloads = vec![];
    if delete_ike {
        payloads.push((
            PayloadType::Delete,
            encode_delete(SecurityProtocol::InternetKeyExchange, &[]),
        ));
    } else if !answered_spis.is_empty() {
        payloads.push((
            PayloadType::Delete,
            encode_delete(SecurityProtocol::EncapsulatingSecurityPayload, &answered_spis),
        ));
    }

    let msgid = md.hdr.message_id;
    let packets = demux.seal_message(ike, ExchangeType::Informational, msgid, true, payloads);
    if packets.is_empty() {
        return Outcome::InternalError;
    }

    let in_delete_state = demux.table.get(ike).map(|sa| sa.state) == Some(State::IkeSaDel);
    if delete_ike || in_delete_state {
        // the SA is about to disappear; transmit and account for the
        // reply now instead of leaving it to the completion engine
        let dest = demux
            .table
            .get(ike)
            .map(|sa| sa.remote);
        if let Some(dest) = dest {
            for packet in &packets {
                demux.push_packet(dest, packet.clone());
            }
        }
        if let Some(sa) = demux.table.get_mut(ike) {
            sa.msgid.on_request_received(msgid);
            sa.msgid.on_response_sent(msgid);
        }
        info!("IKE SA {ike} deleted on peer request");
        demux.delete_sa_tree(ike);
        md.sa = None;
        return Outcome::Ok;
    }

    demux.record_response(ike, packets);
    Outcome::Ok
}
