//! End-to-end exchange scenarios driving the dispatcher
//!
//! Every test plays the peer: it crafts datagrams with the wire
//! generator, feeds them through [Demux::process_packet], pumps queued
//! crypto work synchronously and asserts on the table and the outbox.
//! The deterministic [NullCrypto] backend keeps the "ciphertext" legible.

#![allow(clippy::unwrap_used)]

use std::net::SocketAddr;
use std::sync::Arc;

use ikewire::generator::{
    encode_auth, encode_delete, encode_identity, encode_key_exchange,
    encode_security_association, encode_traffic_selectors, MessageBuilder,
};
use ikewire::params::{
    AuthMethod, ExchangeType, IdType, NotifyError, NotifyStatus, PayloadType, SecurityProtocol,
};
use ikewire::parser::{decode_payloads, parse_header, Chains, PayloadSummary};
use ikewire::payload::SecurityAssociation;
use ikewire::set::PayloadSet;

use crate::config::{Connection, ConnectionStore};
use crate::crypto::NullCrypto;
use crate::dispatch::{Demux, OutPacket};
use crate::exchange;
use crate::sa::{SaRole, SerialNo, SpiPair, State};

const SPI_I: u64 = 0xaa01;

fn peer() -> SocketAddr {
    "192.0.2.1:500".parse().unwrap()
}

fn demux() -> Demux {
    let store = ConnectionStore::new(vec![Connection {
        name: "default".into(),
        ..Connection::default()
    }]);
    Demux::new(store, Arc::new(NullCrypto))
}

/// Run queued worker computations synchronously and resume their SAs
fn pump(demux: &mut Demux) {
    let crypto = Arc::clone(&demux.crypto);
    for offload in demux.drain_offloads() {
        let result = crypto.offload(offload.request);
        demux.resume(offload.serial, offload.ticket, result);
    }
}

fn init_request(spi_i: u64, cookie: Option<&[u8]>) -> Vec<u8> {
    exchange::ike_sa_init::build_init_request(spi_i, 31, &[0xab; 32], &[0x13; 32], cookie, true)
        .unwrap()
}

/// Decode one outbound packet into header fields plus payload chains
fn decode(packet: &[u8]) -> (ikewire::header::Header, Chains, PayloadSummary) {
    let header = *parse_header(packet).unwrap();
    let mut chains = Chains::default();
    let summary = decode_payloads(&packet[28..], header.next_payload, &mut chains);
    (header, chains, summary)
}

fn only_packet(outbox: Vec<OutPacket>) -> Vec<u8> {
    assert_eq!(outbox.len(), 1, "expected exactly one outbound packet");
    outbox.into_iter().next().unwrap().data
}

/// The plaintext payload chain of an IKE_AUTH request
fn auth_request_payloads() -> Vec<(PayloadType, Vec<u8>)> {
    let sa_body = encode_security_association(&SecurityAssociation {
        proposals: vec![exchange::default_esp_proposal(vec![0xe5, 0x00, 0x00, 0x01])],
    })
    .unwrap();
    vec![
        (
            PayloadType::IdentificationInitiator,
            encode_identity(IdType::Fqdn, b"peer.example.org"),
        ),
        (
            PayloadType::Authentication,
            encode_auth(AuthMethod::SharedKeyMic, &[0u8; 32]),
        ),
        (PayloadType::SecurityAssociation, sa_body),
        (
            PayloadType::TrafficSelectorInitiator,
            encode_traffic_selectors(&exchange::wildcard_selectors()),
        ),
        (
            PayloadType::TrafficSelectorResponder,
            encode_traffic_selectors(&exchange::wildcard_selectors()),
        ),
    ]
}

/// Drive a demux through S1, returning the responder serial and its SPIs
fn establish_responder_r1(demux: &mut Demux) -> (SerialNo, SpiPair) {
    demux.process_packet(init_request(SPI_I, None), peer());
    let response = only_packet(demux.drain_outbox());
    let (header, _, _) = decode(&response);
    let serial = demux.table.find_by_initiator_spi(SPI_I).unwrap();
    (
        serial,
        SpiPair {
            initiator: SPI_I,
            responder: header.responder_spi.get(),
        },
    )
}

/// Drive a demux through S1 plus a fragmented IKE_AUTH, returning the
/// established IKE SA
fn establish_responder_r2(demux: &mut Demux) -> (SerialNo, SpiPair) {
    let (serial, spis) = establish_responder_r1(demux);

    let (first, plaintext) = exchange::encode_payload_chain(&auth_request_payloads());
    let packets = fragment_request(spis, ExchangeType::IkeAuth, 1, first, &plaintext, 3);
    // deliberately out of order
    demux.process_packet(packets[1].clone(), peer());
    demux.process_packet(packets[0].clone(), peer());
    demux.process_packet(packets[2].clone(), peer());
    assert!(demux.drain_outbox().is_empty(), "no reply before SKEYSEED");
    pump(demux);
    let _ = demux.drain_outbox();
    assert_eq!(demux.table.get(serial).unwrap().state, State::ParentR2);
    (serial, spis)
}

/// Split a plaintext into `total` SKF fragments of one request
fn fragment_request(
    spis: SpiPair,
    exchange_type: ExchangeType,
    msgid: u32,
    first: PayloadType,
    plaintext: &[u8],
    total: u16,
) -> Vec<Vec<u8>> {
    let size = plaintext.len().div_ceil(total as usize);
    plaintext
        .chunks(size)
        .enumerate()
        .map(|(i, chunk)| {
            let number = i as u16 + 1;
            MessageBuilder::new(exchange_type, msgid)
                .spis(spis.initiator, spis.responder)
                .initiator(true)
                .skf_payload((number == 1).then_some(first), number, total, chunk.to_vec())
                .build()
                .unwrap()
        })
        .collect()
}

/// One unfragmented SK request from the peer (the "initiator" side)
fn sk_request(
    spis: SpiPair,
    exchange_type: ExchangeType,
    msgid: u32,
    payloads: &[(PayloadType, Vec<u8>)],
) -> Vec<u8> {
    let (first, plaintext) = exchange::encode_payload_chain(payloads);
    MessageBuilder::new(exchange_type, msgid)
        .spis(spis.initiator, spis.responder)
        .initiator(true)
        .sk_payload(first, plaintext)
        .build()
        .unwrap()
}

#[test]
fn s1_ike_sa_init_happy_path() {
    let mut demux = demux();
    demux.process_packet(init_request(SPI_I, None), peer());

    let response = only_packet(demux.drain_outbox());
    let (header, _, summary) = decode(&response);
    assert!(header.is_response());
    assert!(!header.sent_by_initiator());
    assert_eq!(header.initiator_spi.get(), SPI_I);
    assert_ne!(header.responder_spi.get(), 0);
    assert_eq!(header.message_id.get(), 0);
    assert!(summary.ok());
    for expected in [PayloadSet::SA, PayloadSet::KE, PayloadSet::NONCE] {
        assert_eq!(summary.present & expected, expected);
    }

    let serial = demux.table.find_by_initiator_spi(SPI_I).unwrap();
    let sa = demux.table.get(serial).unwrap();
    assert_eq!(sa.state, State::ParentR1);
    assert_eq!(sa.role, SaRole::Responder);
    assert_eq!(sa.msgid.last_received, Some(0));
    assert_eq!(sa.msgid.last_replied, Some(0));
}

#[test]
fn s2_stateless_cookie_gate() {
    let mut demux = demux();
    demux.half_open_limit = 0;

    demux.process_packet(init_request(SPI_I, None), peer());
    assert!(demux.table.find_by_initiator_spi(SPI_I).is_none(), "no SA allocated");

    let challenge = only_packet(demux.drain_outbox());
    let (header, chains, _) = decode(&challenge);
    assert!(header.is_response());
    assert_eq!(header.initiator_spi.get(), SPI_I);
    assert_eq!(header.responder_spi.get(), 0);
    let cookie = chains
        .notifications()
        .find(|n| n.code == NotifyStatus::Cookie.code())
        .map(|n| n.data.clone())
        .unwrap();
    assert!(!cookie.is_empty());

    // the repeated request carrying the cookie passes the gate
    demux.process_packet(init_request(SPI_I, Some(&cookie)), peer());
    let response = only_packet(demux.drain_outbox());
    let (header, _, summary) = decode(&response);
    assert_ne!(header.responder_spi.get(), 0);
    assert!(summary.present.contains(PayloadType::SecurityAssociation));
    assert!(demux.table.find_by_initiator_spi(SPI_I).is_some());
}

#[test]
fn s3_unknown_critical_payload() {
    let mut demux = demux();

    // empty SA_INIT request, then splice in an unknown critical payload
    // of type 99
    let mut packet = MessageBuilder::new(ExchangeType::IkeSaInit, 0)
        .spis(SPI_I, 0)
        .initiator(true)
        .build()
        .unwrap();
    packet[16] = 99; // header next-payload
    packet.extend_from_slice(&[0x00, 0x80, 0x00, 0x06, 0xde, 0xad]);
    let total = packet.len() as u32;
    packet[24..28].copy_from_slice(&total.to_be_bytes());

    demux.process_packet(packet, peer());
    assert!(demux.table.find_by_initiator_spi(SPI_I).is_none(), "no SA allocated");

    let response = only_packet(demux.drain_outbox());
    let (header, chains, _) = decode(&response);
    assert!(header.is_response());
    let n = chains
        .notifications()
        .find(|n| n.code == NotifyError::UnsupportedCriticalPayload.code())
        .unwrap();
    // exactly one octet: the offending payload type
    assert_eq!(n.data, vec![99]);
}

#[test]
fn s4_fragmented_auth_runs_handler_once() {
    let mut demux = demux();
    let (serial, spis) = establish_responder_r1(&mut demux);

    let (first, plaintext) = exchange::encode_payload_chain(&auth_request_payloads());
    let packets = fragment_request(spis, ExchangeType::IkeAuth, 1, first, &plaintext, 3);
    demux.process_packet(packets[1].clone(), peer());
    demux.process_packet(packets[0].clone(), peer());
    assert!(demux.drain_outbox().is_empty(), "reassembly incomplete");

    demux.process_packet(packets[2].clone(), peer());
    // complete: the no-SKEYSEED transition suspended and offloaded
    assert!(demux.table.get(serial).unwrap().is_busy());
    pump(&mut demux);

    let response = only_packet(demux.drain_outbox());
    let (header, chains, summary) = decode(&response);
    assert!(header.is_response());
    assert_eq!(header.message_id.get(), 1);
    assert!(summary.present.contains(PayloadType::Encrypted));
    assert!(chains.sk().is_some());

    let ike = demux.table.get(serial).unwrap();
    assert_eq!(ike.state, State::ParentR2);
    assert_eq!(ike.msgid.last_received, Some(1));
    assert_eq!(ike.msgid.last_replied, Some(1));

    // exactly one child established by exactly one handler run
    let children = demux.table.children_of(serial);
    assert_eq!(children.len(), 1);
    assert_eq!(
        demux.table.get(children[0]).unwrap().state,
        State::IpsecR
    );
}

#[test]
fn s5_retransmitted_request_replays_cached_response() {
    let mut demux = demux();
    demux.process_packet(init_request(SPI_I, None), peer());
    let first_response = only_packet(demux.drain_outbox());
    let serial = demux.table.find_by_initiator_spi(SPI_I).unwrap();
    let counters_before = demux.table.get(serial).unwrap().msgid;

    // identical retransmit: handler not invoked, bit-identical replay
    demux.process_packet(init_request(SPI_I, None), peer());
    let second_response = only_packet(demux.drain_outbox());
    assert_eq!(first_response, second_response);

    let sa = demux.table.get(serial).unwrap();
    assert_eq!(sa.msgid, counters_before);
    assert_eq!(sa.state, State::ParentR1);
    assert_eq!(
        demux.table.iter().count(),
        1,
        "retransmit must not create a second SA"
    );
}

#[test]
fn s5_fragmented_retransmit_replays_on_first_fragment_only() {
    let mut demux = demux();
    let (_, spis) = establish_responder_r2(&mut demux);

    let (first, plaintext) = exchange::encode_payload_chain(&auth_request_payloads());
    let packets = fragment_request(spis, ExchangeType::IkeAuth, 1, first, &plaintext, 3);

    // a retransmitted non-first fragment is dropped quietly
    demux.process_packet(packets[1].clone(), peer());
    assert!(demux.drain_outbox().is_empty());

    // the retransmitted first fragment triggers the replay
    demux.process_packet(packets[0].clone(), peer());
    assert_eq!(demux.drain_outbox().len(), 1);
}

#[test]
fn s6_old_response_is_dropped() {
    let mut demux = demux();
    let serial = demux.initiate_ike_sa("default", peer()).unwrap();
    let _ = demux.drain_outbox();
    {
        let sa = demux.table.get_mut(serial).unwrap();
        sa.state = State::ParentI3;
        sa.skeyseed_computed = true;
        sa.keys = Some(crate::crypto::SkeyMaterial::default());
        sa.spis.responder = 0xbb02;
        sa.msgid.next_use = 6;
        sa.msgid.last_acked = Some(5);
    }
    let spis = demux.table.get(serial).unwrap().spis;

    // a response to message 3, long since acknowledged
    let stale = MessageBuilder::new(ExchangeType::Informational, 3)
        .spis(spis.initiator, spis.responder)
        .response(true)
        .sk_payload(PayloadType::NoNextPayload, vec![])
        .build()
        .unwrap();
    demux.process_packet(stale, peer());

    assert!(demux.drain_outbox().is_empty());
    let sa = demux.table.get(serial).unwrap();
    assert_eq!(sa.msgid.last_acked, Some(5));
    assert_eq!(sa.state, State::ParentI3);
}

#[test]
fn initiator_full_establishment() {
    let mut demux = demux();
    let serial = demux.initiate_ike_sa("default", peer()).unwrap();

    // the SA_INIT request leaves immediately
    let request = only_packet(demux.drain_outbox());
    let (header, _, summary) = decode(&request);
    assert!(header.sent_by_initiator());
    assert!(!header.is_response());
    assert_eq!(header.responder_spi.get(), 0);
    assert_eq!(header.message_id.get(), 0);
    assert!(summary.present.contains(PayloadType::KeyExchange));
    assert_eq!(demux.table.get(serial).unwrap().state, State::ParentI1);

    // the responder replies with SAr, KEr, Nr
    let spi_i = header.initiator_spi.get();
    let sa_body = encode_security_association(&SecurityAssociation {
        proposals: vec![exchange::default_ike_proposal(vec![])],
    })
    .unwrap();
    let reply = MessageBuilder::new(ExchangeType::IkeSaInit, 0)
        .spis(spi_i, 0xbb02)
        .response(true)
        .payload(PayloadType::SecurityAssociation, sa_body)
        .payload(PayloadType::KeyExchange, encode_key_exchange(31, &[0xcd; 32]))
        .payload(PayloadType::Nonce, vec![0x37; 32])
        .build()
        .unwrap();
    demux.process_packet(reply, peer());

    // SKEYSEED derivation runs on a worker, then IKE_AUTH goes out
    assert!(demux.table.get(serial).unwrap().is_busy());
    pump(&mut demux);
    let auth_request = only_packet(demux.drain_outbox());
    let (header, _, summary) = decode(&auth_request);
    assert_eq!(header.message_id.get(), 1);
    assert!(!header.is_response());
    assert!(summary.present.contains(PayloadType::Encrypted));

    let sa = demux.table.get(serial).unwrap();
    assert_eq!(sa.state, State::ParentI2);
    assert_eq!(sa.spis.responder, 0xbb02);
    assert_eq!(sa.msgid.next_use, 2);
    assert_eq!(sa.msgid.last_acked, Some(0));
    // window invariant
    assert!(sa.msgid.unacknowledged() <= sa.window);

    // the AUTH response establishes the IKE SA and the first child
    let sa_body = encode_security_association(&SecurityAssociation {
        proposals: vec![exchange::default_esp_proposal(vec![0xe5, 0, 0, 2])],
    })
    .unwrap();
    let payloads = vec![
        (
            PayloadType::IdentificationResponder,
            encode_identity(IdType::Fqdn, b"gateway.example.org"),
        ),
        (
            PayloadType::Authentication,
            encode_auth(AuthMethod::SharedKeyMic, &[0u8; 32]),
        ),
        (PayloadType::SecurityAssociation, sa_body),
        (
            PayloadType::TrafficSelectorInitiator,
            encode_traffic_selectors(&exchange::wildcard_selectors()),
        ),
        (
            PayloadType::TrafficSelectorResponder,
            encode_traffic_selectors(&exchange::wildcard_selectors()),
        ),
    ];
    let (first, plaintext) = exchange::encode_payload_chain(&payloads);
    let auth_reply = MessageBuilder::new(ExchangeType::IkeAuth, 1)
        .spis(spi_i, 0xbb02)
        .response(true)
        .sk_payload(first, plaintext)
        .build()
        .unwrap();
    demux.process_packet(auth_reply, peer());

    let sa = demux.table.get(serial).unwrap();
    assert_eq!(sa.state, State::ParentI3);
    assert_eq!(sa.msgid.last_acked, Some(1));
    let children = demux.table.children_of(serial);
    assert_eq!(children.len(), 1);
    let child = demux.table.get(children[0]).unwrap();
    assert_eq!(child.state, State::IpsecI);
    assert_eq!(child.role, SaRole::Initiator);
    assert_eq!(child.exchange_msgid, Some(1));
}

#[test]
fn corrupt_sk_payload_is_ignored() {
    let mut demux = demux();
    let (serial, spis) = establish_responder_r2(&mut demux);

    // NullCrypto treats a BAD! prefix as an integrity failure
    let corrupt = MessageBuilder::new(ExchangeType::Informational, 2)
        .spis(spis.initiator, spis.responder)
        .initiator(true)
        .sk_payload(PayloadType::NoNextPayload, b"BAD!corrupted".to_vec())
        .build()
        .unwrap();
    demux.process_packet(corrupt, peer());

    // no response leaks the failure, nothing changed
    assert!(demux.drain_outbox().is_empty());
    let sa = demux.table.get(serial).unwrap();
    assert_eq!(sa.state, State::ParentR2);
    assert_eq!(sa.msgid.last_received, Some(1));
}

#[test]
fn informational_delete_tears_down_the_tree() {
    let mut demux = demux();
    let (serial, spis) = establish_responder_r2(&mut demux);
    assert_eq!(demux.table.children_of(serial).len(), 1);

    let delete = sk_request(
        spis,
        ExchangeType::Informational,
        2,
        &[(
            PayloadType::Delete,
            encode_delete(SecurityProtocol::InternetKeyExchange, &[]),
        )],
    );
    demux.process_packet(delete, peer());

    // the empty reply left before the SA went away
    let response = only_packet(demux.drain_outbox());
    let (header, _, summary) = decode(&response);
    assert!(header.is_response());
    assert_eq!(header.message_id.get(), 2);
    assert!(summary.present.contains(PayloadType::Encrypted));

    assert!(demux.table.get(serial).is_none());
    assert_eq!(demux.table.iter().count(), 0);
}

#[test]
fn create_child_request_allocates_and_answers() {
    let mut demux = demux();
    let (serial, spis) = establish_responder_r2(&mut demux);

    let sa_body = encode_security_association(&SecurityAssociation {
        proposals: vec![exchange::default_esp_proposal(vec![0xe5, 0, 0, 9])],
    })
    .unwrap();
    let request = sk_request(
        spis,
        ExchangeType::CreateChildSa,
        2,
        &[
            (PayloadType::SecurityAssociation, sa_body),
            (PayloadType::Nonce, vec![0x55; 32]),
            (
                PayloadType::TrafficSelectorInitiator,
                encode_traffic_selectors(&exchange::wildcard_selectors()),
            ),
            (
                PayloadType::TrafficSelectorResponder,
                encode_traffic_selectors(&exchange::wildcard_selectors()),
            ),
        ],
    );
    demux.process_packet(request.clone(), peer());

    let response = only_packet(demux.drain_outbox());
    let (header, _, _) = decode(&response);
    assert!(header.is_response());
    assert_eq!(header.message_id.get(), 2);

    // the initial child plus the fresh one
    let children = demux.table.children_of(serial);
    assert_eq!(children.len(), 2);
    let fresh = children
        .iter()
        .find(|&&c| demux.table.get(c).unwrap().exchange_msgid == Some(2))
        .copied()
        .unwrap();
    assert_eq!(demux.table.get(fresh).unwrap().state, State::IpsecR);

    // a retransmit of the request replays the recorded response
    demux.process_packet(request, peer());
    let replay = only_packet(demux.drain_outbox());
    assert_eq!(replay, response);
    assert_eq!(demux.table.children_of(serial).len(), 2);
}

#[test]
fn ike_rekey_emancipates_the_child() {
    let mut demux = demux();
    let (serial, spis) = establish_responder_r2(&mut demux);
    let first_child = demux.table.children_of(serial)[0];

    let sa_body = encode_security_association(&SecurityAssociation {
        proposals: vec![exchange::default_ike_proposal(
            0xcc03u64.to_be_bytes().to_vec(),
        )],
    })
    .unwrap();
    let request = sk_request(
        spis,
        ExchangeType::CreateChildSa,
        2,
        &[
            (PayloadType::SecurityAssociation, sa_body),
            (PayloadType::Nonce, vec![0x77; 32]),
            (PayloadType::KeyExchange, encode_key_exchange(31, &[0xef; 32])),
        ],
    );
    demux.process_packet(request, peer());

    let response = only_packet(demux.drain_outbox());
    let (header, _, _) = decode(&response);
    assert!(header.is_response());

    // the rekey child became an IKE SA of its own
    let successor = demux
        .table
        .iter()
        .find(|sa| !sa.is_child() && sa.serial != serial)
        .map(|sa| sa.serial)
        .unwrap();
    let new_ike = demux.table.get(successor).unwrap();
    assert_eq!(new_ike.state, State::ParentR2);
    assert_eq!(new_ike.spis.initiator, 0xcc03);
    assert_ne!(new_ike.spis.responder, 0);
    assert_eq!(new_ike.msgid.next_use, 0);
    assert_eq!(new_ike.msgid.last_received, None);

    // the old parent's children migrated to the successor
    assert_eq!(
        demux.table.get(first_child).unwrap().parent,
        Some(successor)
    );
    assert!(demux.table.children_of(serial).is_empty());
}

#[test]
fn busy_sa_drops_messages() {
    let mut demux = demux();
    let (serial, spis) = establish_responder_r1(&mut demux);

    let (first, plaintext) = exchange::encode_payload_chain(&auth_request_payloads());
    let auth = MessageBuilder::new(ExchangeType::IkeAuth, 1)
        .spis(spis.initiator, spis.responder)
        .initiator(true)
        .sk_payload(first, plaintext)
        .build()
        .unwrap();
    demux.process_packet(auth.clone(), peer());
    assert!(demux.table.get(serial).unwrap().is_busy());

    // a second copy while suspended is dropped outright
    demux.process_packet(auth, peer());
    assert!(demux.drain_outbox().is_empty());

    pump(&mut demux);
    // exactly one reply for the one surviving copy
    assert_eq!(demux.drain_outbox().len(), 1);
    assert_eq!(demux.table.get(serial).unwrap().state, State::ParentR2);
}

#[test]
fn unexpected_payloads_fail_with_invalid_syntax() {
    let mut demux = demux();

    // an IKE_SA_INIT request missing KE and nonce entirely
    let sa_body = encode_security_association(&SecurityAssociation {
        proposals: vec![exchange::default_ike_proposal(vec![])],
    })
    .unwrap();
    let request = MessageBuilder::new(ExchangeType::IkeSaInit, 0)
        .spis(SPI_I, 0)
        .initiator(true)
        .payload(PayloadType::SecurityAssociation, sa_body)
        .build()
        .unwrap();
    demux.process_packet(request, peer());

    let response = only_packet(demux.drain_outbox());
    let (_, chains, _) = decode(&response);
    assert!(chains.contains_notification(NotifyError::InvalidSyntax.code()));
    assert!(demux.table.find_by_initiator_spi(SPI_I).is_none());
}

#[test]
fn cookie_restart_on_initiator_side() {
    let mut demux = demux();
    let serial = demux.initiate_ike_sa("default", peer()).unwrap();
    let request = only_packet(demux.drain_outbox());
    let (header, _, _) = decode(&request);
    let spi_i = header.initiator_spi.get();

    // the responder demands a cookie
    let challenge = MessageBuilder::new(ExchangeType::IkeSaInit, 0)
        .spis(spi_i, 0)
        .response(true)
        .payload(
            PayloadType::Notify,
            ikewire::generator::encode_notify(
                SecurityProtocol::Reserved,
                None,
                NotifyStatus::Cookie.code(),
                b"such-cookie",
            ),
        )
        .build()
        .unwrap();
    demux.process_packet(challenge, peer());

    // the repeated request leads with the echoed cookie
    let repeated = only_packet(demux.drain_outbox());
    let (header, chains, summary) = decode(&repeated);
    assert_eq!(header.message_id.get(), 0);
    assert!(!header.is_response());
    let cookie = chains
        .notifications()
        .find(|n| n.code == NotifyStatus::Cookie.code())
        .unwrap();
    assert_eq!(cookie.data, b"such-cookie");
    assert!(summary.present.contains(PayloadType::KeyExchange));

    let sa = demux.table.get(serial).unwrap();
    assert_eq!(sa.state, State::ParentI1);
    assert_eq!(sa.msgid.next_use, 1);
    assert_eq!(sa.msgid.last_acked, None);
}

#[test]
fn responses_to_unknown_spis_are_dropped() {
    let mut demux = demux();
    let reply = MessageBuilder::new(ExchangeType::Informational, 7)
        .spis(0xdead, 0xbeef)
        .response(true)
        .sk_payload(PayloadType::NoNextPayload, vec![])
        .build()
        .unwrap();
    demux.process_packet(reply, peer());
    assert!(demux.drain_outbox().is_empty());
    assert_eq!(demux.table.iter().count(), 0);
}
