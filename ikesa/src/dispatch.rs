//! The dispatcher: demultiplexing inbound messages onto SA transitions
//!
//! [Demux::process_packet] resolves a datagram to an SA (or decides one
//! must be created or challenged), weeds out retransmits and replays, and
//! hands the message to [Demux::process_state_packet] which scans the
//! transition table, drives reassembly and decryption, invokes the
//! matching handler and completes with its outcome.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, instrument, trace, warn};

use ikewire::params::{ExchangeType, NotifyError, NotifyStatus, PayloadType};

use crate::classify::{verify_payloads, PayloadErrors};
use crate::complete::Outcome;
use crate::config::ConnectionStore;
use crate::cookie::CookieJar;
use crate::crypto::{CryptoBackend, CryptoRequest, CryptoResult};
use crate::exchange;
use crate::frag::{FragmentBuffer, FragmentCheck};
use crate::md::MessageDigest;
use crate::msgid::{classify_request, RetransmitDisposition};
use crate::sa::{OffloadTicket, SaRole, SerialNo, State};
use crate::timer::TimerQueue;
use crate::transitions::{SmfFlags, TransitionIndex, TRANSITIONS};

/// One datagram waiting for the transport to send it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutPacket {
    /// Destination endpoint
    pub dest: SocketAddr,
    /// The encoded message
    pub data: Vec<u8>,
}

/// A computation waiting for a worker thread
#[derive(Debug)]
pub struct PendingOffload {
    /// SA the result belongs to
    pub serial: SerialNo,
    /// Ticket the completion must echo
    pub ticket: OffloadTicket,
    /// The work itself
    pub request: CryptoRequest,
}

/// Default cap on half-open IKE SAs before cookies are demanded
pub const DEFAULT_HALF_OPEN_LIMIT: usize = 50;

/// The demultiplexer and state machine
///
/// Owns the SA table, the transition index, the timer queue and the
/// outbound queues. All methods run on the event loop; nothing in here
/// is shared across threads.
pub struct Demux {
    /// Every SA, keyed by serial number
    pub table: crate::sa::SaTable,
    /// Configured connections
    pub connections: ConnectionStore,
    /// The cryptographic backend
    pub crypto: Arc<dyn CryptoBackend>,
    /// Rotating stateless-cookie secrets
    pub cookies: CookieJar,
    /// Pending timers
    pub timers: TimerQueue,
    /// Half-open SA count beyond which cookies are demanded
    pub half_open_limit: usize,
    index: TransitionIndex,
    outbox: Vec<OutPacket>,
    offloads: Vec<PendingOffload>,
    next_ticket: u64,
}

impl Demux {
    /// Build a demultiplexer over the given configuration and backend
    pub fn new(connections: ConnectionStore, crypto: Arc<dyn CryptoBackend>) -> Self {
        Self {
            table: crate::sa::SaTable::default(),
            connections,
            crypto,
            cookies: CookieJar::new(),
            timers: TimerQueue::default(),
            half_open_limit: DEFAULT_HALF_OPEN_LIMIT,
            index: TransitionIndex::new(),
            outbox: vec![],
            offloads: vec![],
            next_ticket: 0,
        }
    }

    /// Packets recorded since the last drain, oldest first
    pub fn drain_outbox(&mut self) -> Vec<OutPacket> {
        std::mem::take(&mut self.outbox)
    }

    /// Worker-pool requests queued since the last drain
    pub fn drain_offloads(&mut self) -> Vec<PendingOffload> {
        std::mem::take(&mut self.offloads)
    }

    pub(crate) fn push_packet(&mut self, dest: SocketAddr, data: Vec<u8>) {
        self.outbox.push(OutPacket { dest, data });
    }

    /// Queue a computation for the worker pool and mark the SA busy
    pub(crate) fn queue_offload(&mut self, serial: SerialNo, request: CryptoRequest) {
        self.next_ticket += 1;
        let ticket = OffloadTicket {
            id: self.next_ticket,
        };
        if let Some(sa) = self.table.get_mut(serial) {
            sa.offloaded = Some(ticket);
        }
        self.offloads.push(PendingOffload {
            serial,
            ticket,
            request,
        });
    }

    /// Process one inbound datagram
    #[instrument(skip_all, fields(sender = %sender))]
    pub fn process_packet(&mut self, raw: Vec<u8>, sender: SocketAddr) {
        let mut md = match MessageDigest::parse(raw, sender) {
            Ok(md) => md,
            Err(err) => {
                debug!("dropping unparseable datagram: {err}");
                return;
            }
        };

        let ix = md.hdr.exchange;
        let sent_by_initiator = md.sent_by_initiator();
        trace!(
            "receiving an IKEv2 {} {ix}",
            if md.is_response() { "response" } else { "request" },
        );

        let sa = if ix == ExchangeType::IkeSaInit {
            // The message ID of the initial exchange is always zero
            if md.hdr.message_id != 0 {
                debug!("dropping IKE_SA_INIT message containing non-zero message ID");
                return;
            }
            if md.is_request() {
                if !sent_by_initiator {
                    debug!("dropping IKE_SA_INIT request with conflicting initiator flag");
                    return;
                }
                if md.hdr.spis.responder != 0 {
                    debug!("dropping IKE_SA_INIT request with non-zero responder SPI");
                    return;
                }
                let existing = self.table.find_by_initiator_spi(md.hdr.spis.initiator);
                match existing {
                    Some(serial) => {
                        // the duplicate logic below decides what to do
                        debug!("received what looks like a duplicate IKE_SA_INIT for {serial}");
                        Some(serial)
                    }
                    None => {
                        // Parse now: the cookie equation needs the nonce,
                        // so the whole chain gets decoded either way.
                        md.parse_cleartext_payloads();
                        if let Some(code) = md.message_payloads.n {
                            let data = md.message_payloads.data.clone();
                            self.send_notification_response_from_md(&md, code.code(), &data);
                            return;
                        }
                        if !self.initiator_passed_cookie_gate(&md) {
                            return;
                        }
                        None
                    }
                }
            } else {
                if sent_by_initiator {
                    debug!("dropping IKE_SA_INIT response with conflicting initiator flag");
                    return;
                }
                let Some(serial) = self.table.find_by_initiator_spi(md.hdr.spis.initiator) else {
                    debug!("no matching state for IKE_SA_INIT response; discarding packet");
                    return;
                };
                let Some(sa) = self.table.get_mut(serial) else {
                    return;
                };
                if sa.msgid.last_acked.is_some() {
                    debug!("already processed IKE_SA_INIT response for {serial}");
                    return;
                }
                // the responder chose its SPI; adopt it
                if md.hdr.spis.responder != 0 {
                    sa.spis.responder = md.hdr.spis.responder;
                }
                Some(serial)
            }
        } else if md.is_request() {
            let Some(serial) = self.table.find_ike(md.hdr.spis) else {
                debug!("{ix} message request has no corresponding IKE SA");
                return;
            };
            Some(serial)
        } else {
            // A response: find the IKE SA or the child that initiated
            // the request with this message ID.
            let Some(ike) = self.table.find_ike(md.hdr.spis) else {
                debug!("{ix} message response has no matching IKE SA");
                return;
            };
            match self.table.child_with_msgid(ike, md.hdr.message_id) {
                Some(child) => Some(child),
                None => {
                    let Some(sa) = self.table.get(ike) else {
                        return;
                    };
                    if sa.msgid.response_is_old(md.hdr.message_id) {
                        debug!(
                            "dropping retransmitted response with msgid {} from peer, already processed {:?}",
                            md.hdr.message_id, sa.msgid.last_acked
                        );
                        return;
                    }
                    if sa.msgid.response_is_unasked(md.hdr.message_id) {
                        debug!(
                            "dropping unasked response with msgid {} from peer (next to use is {})",
                            md.hdr.message_id, sa.msgid.next_use
                        );
                        return;
                    }
                    Some(ike)
                }
            }
        };

        // Check the SA's role against the I(nitiator) flag in the header
        if let Some(serial) = sa {
            let Some(ike) = self.table.ike_of(serial).and_then(|ike| self.table.get(ike)) else {
                warn!("lost IKE SA for {serial}; dropping packet");
                return;
            };
            match ike.role {
                SaRole::Initiator if sent_by_initiator => {
                    debug!("IKE SA initiator received a message with the initiator flag set");
                    return;
                }
                SaRole::Responder if !sent_by_initiator => {
                    debug!("IKE SA responder received a message with the initiator flag clear");
                    return;
                }
                _ => {}
            }

            // An SA busy with a suspended transition or an outstanding
            // worker ticket processes nothing else
            if self.table.get(serial).is_some_and(|sa| sa.is_busy()) {
                debug!("{serial} is busy; dropping packet");
                return;
            }

            if md.is_request() && self.processed_retransmit(serial, &mut md) {
                return;
            }
        }

        self.process_state_packet(sa, md);
    }

    /// Handle a duplicate inbound request, re-sending the recorded reply
    /// when allowed; returns whether the message is consumed
    fn processed_retransmit(&mut self, serial: SerialNo, md: &mut MessageDigest) -> bool {
        let Some(ike) = self.table.ike_of(serial) else {
            return false;
        };
        let msgid = md.hdr.message_id;
        let is_duplicate = self
            .table
            .get(ike)
            .and_then(|sa| sa.msgid.last_received)
            .is_some_and(|last| msgid <= last);
        if !is_duplicate {
            return false;
        }

        // Only the first fragment of a duplicate triggers a resend
        let first_fragment = if md.hdr.first_payload == PayloadType::EncryptedFragment as u8 {
            if !md.message_payloads.parsed {
                md.parse_cleartext_payloads();
            }
            md.chains.skf().map(|skf| skf.number == 1).unwrap_or(false)
        } else {
            true
        };

        let child_working = self.table.child_with_msgid(ike, msgid).is_some();
        let Some(sa) = self.table.get(ike) else {
            return false;
        };
        match classify_request(sa, msgid, first_fragment, child_working) {
            RetransmitDisposition::Fresh => false,
            RetransmitDisposition::Drop => true,
            RetransmitDisposition::Replay => {
                self.send_recorded(ike);
                true
            }
        }
    }

    /// The stateless-cookie gate (RFC 7296 2.6)
    ///
    /// Returns whether a responder SA may be allocated for this
    /// IKE_SA_INIT request. Under flood, challenges the initiator and
    /// consumes the message.
    fn initiator_passed_cookie_gate(&mut self, md: &MessageDigest) -> bool {
        if self.table.half_open_count() < self.half_open_limit {
            return true;
        }

        let nonce = exchange::nonce_of(&md.chains).unwrap_or_default();
        let spi_i = md.hdr.spis.initiator;

        // a valid echoed cookie must be the first payload
        let echoed = md.chains.notifications().find(|n| {
            NotifyStatus::try_from(n.code) == Ok(NotifyStatus::Cookie)
        });
        if let Some(n) = echoed {
            let crypto = Arc::clone(&self.crypto);
            if self.cookies.check(crypto.as_ref(), spi_i, &nonce, &n.data) {
                return true;
            }
            debug!("IKE_SA_INIT request carries a stale cookie; challenging again");
        } else {
            debug!("overloaded with half-open IKE SAs; demanding cookies");
        }

        let crypto = Arc::clone(&self.crypto);
        let cookie = self.cookies.compute(crypto.as_ref(), spi_i, &nonce);
        self.send_notification_response_from_md(md, NotifyStatus::Cookie.code(), &cookie);
        false
    }

    /// Scan the transition table and run the matching transition
    pub(crate) fn process_state_packet(&mut self, sa: Option<SerialNo>, mut md: MessageDigest) {
        let from_state = sa
            .and_then(|serial| self.table.get(serial))
            .map(|sa| sa.state)
            .unwrap_or(State::ParentR0);
        let ix = md.hdr.exchange;
        debug!(
            "{} in state {from_state}",
            sa.map(|s| s.to_string()).unwrap_or_else(|| "no SA".into())
        );

        let mut message_payload_status: Option<PayloadErrors> = None;
        let mut encrypted_payload_status: Option<PayloadErrors> = None;

        // CREATE_CHILD_SA tolerates a from-state mismatch and pivots to
        // whatever child state the matching row names
        let candidates: Vec<usize> = if ix == ExchangeType::CreateChildSa {
            (0..TRANSITIONS.len()).collect()
        } else {
            self.index.for_state(from_state).to_vec()
        };

        let mut selected = None;
        for i in candidates {
            let t = &TRANSITIONS[i];
            if t.recv_exchange != Some(ix) {
                continue;
            }
            if ix != ExchangeType::CreateChildSa && t.from != from_state {
                continue;
            }
            if t.flags.contains(SmfFlags::IKE_I_SET) && !md.sent_by_initiator() {
                continue;
            }
            if t.flags.contains(SmfFlags::IKE_I_CLEAR) && md.sent_by_initiator() {
                continue;
            }
            if t.flags.contains(SmfFlags::MSG_R_SET) && !md.is_response() {
                continue;
            }
            if t.flags.contains(SmfFlags::MSG_R_CLEAR) && md.is_response() {
                continue;
            }

            // A transition looks interested; parse the cleartext chain
            // on first need.
            if !md.message_payloads.parsed {
                trace!("unpacking cleartext payloads for '{}'", t.story);
                md.parse_cleartext_payloads();
                if let Some(code) = md.message_payloads.n {
                    // Only an IKE_SA_INIT request gets an answer; any
                    // other request may only be answered after the SK
                    // payload verified, so those are dropped.
                    if ix == ExchangeType::IkeSaInit && md.is_request() {
                        let data = md.message_payloads.data.clone();
                        self.send_notification_response_from_md(&md, code.code(), &data);
                    }
                    self.complete_transition(sa, Some(md), Outcome::Fail(None));
                    return;
                }
            }

            let errors = verify_payloads(&md.chains, &md.message_payloads, &t.message_payloads);
            if errors.bad() {
                message_payload_status = Some(errors);
                continue;
            }

            // Without an SK requirement the match is complete
            if !t.message_payloads.required.contains(PayloadType::Encrypted) {
                selected = Some(i);
                break;
            }

            // SK payloads require state
            let Some(serial) = sa else {
                continue;
            };

            if !md.encrypted_payloads.parsed {
                // Fragmented? Collect until complete. (When SKEYSEED had
                // to be computed first, this code re-runs with all
                // fragments already present.)
                if md.message_payloads.present.contains(PayloadType::EncryptedFragment) {
                    let have_all = self
                        .table
                        .get(serial)
                        .and_then(|sa| sa.rfrags.as_ref())
                        .is_some_and(FragmentBuffer::complete);
                    if have_all {
                        trace!("already have all fragments, skipping collection");
                    } else if !self.collect_fragment(serial, &md) {
                        return;
                    }
                }

                // Rows tagged NO_SKEYSEED match exactly while the
                // SKEYSEED is still missing; the SK payload stays closed.
                if t.flags.contains(SmfFlags::NO_SKEYSEED) {
                    let computed = self
                        .table
                        .get(serial)
                        .map(|sa| sa.skeyseed_computed)
                        .unwrap_or(false);
                    if computed {
                        continue;
                    }
                    selected = Some(i);
                    break;
                }

                // Decrypt, checking integrity. Anything lacking
                // integrity is dropped without leaking the failure.
                match self.decrypt_sk(serial, &md) {
                    Err(()) => {
                        debug!("encrypted payload seems to be corrupt; dropping packet");
                        self.complete_transition(sa, Some(md), Outcome::Ignore);
                        return;
                    }
                    Ok((first, plaintext)) => {
                        md.parse_encrypted_payloads(first, &plaintext);
                    }
                }
                if let Some(code) = md.encrypted_payloads.n {
                    if md.is_request() {
                        let data = md.encrypted_payloads.data.clone();
                        if let Some(ike) = self.table.ike_of(serial) {
                            self.send_notification_response_from_sa(ike, &md, code.code(), &data);
                        }
                    }
                    self.complete_transition(sa, Some(md), Outcome::Fatal);
                    return;
                }
            }

            let errors = verify_payloads(&md.chains, &md.encrypted_payloads, &t.encrypted_payloads);
            if errors.bad() {
                encrypted_payload_status = Some(errors);
                continue;
            }

            selected = Some(i);
            break;
        }

        let Some(selected) = selected else {
            // no useful transition; keep the closest classifier error
            if let Some(errors) = encrypted_payload_status.or(message_payload_status) {
                self.log_payload_errors(sa, &md, &errors);
                self.complete_transition(
                    sa,
                    Some(md),
                    Outcome::Fail(Some(NotifyError::InvalidSyntax)),
                );
            } else if md.is_request() {
                // we are the responder; return something
                match sa.and_then(|serial| self.table.ike_of(serial)) {
                    Some(ike) => self.send_notification_response_from_sa(
                        ike,
                        &md,
                        NotifyError::InvalidIkeSpi.code(),
                        &[],
                    ),
                    None => self.send_notification_response_from_md(
                        &md,
                        NotifyError::InvalidIkeSpi.code(),
                        &[],
                    ),
                }
            }
            return;
        };

        debug!("selected state transition '{}'", TRANSITIONS[selected].story);
        md.from_state = Some(TRANSITIONS[selected].from);
        md.transition = Some(selected);
        md.sa = sa;

        // pivot CREATE_CHILD_SA onto the child running the exchange
        let mut target = sa;
        if ix == ExchangeType::CreateChildSa {
            let Some(serial) = sa else {
                return;
            };
            let Some(ike) = self.table.ike_of(serial) else {
                return;
            };
            self.update_msgid_counters(ike, Some(&md));
            match self.resolve_child(ike, selected, &md) {
                None => {
                    self.complete_transition(sa, Some(md), Outcome::Fail(None));
                    return;
                }
                Some(child) => {
                    debug!("switching from parent {ike} to child {child}");
                    md.sa = Some(child);
                    md.from_state = Some(TRANSITIONS[selected].from);
                    target = Some(child);
                }
            }
        }

        let handler = TRANSITIONS[selected].handler;
        let outcome = handler(self, target, &mut md);

        // the handler may have pointed md.sa at a newly created SA, a
        // child, or cleared it after deleting the state
        let completed = md.sa;
        self.complete_transition(completed, Some(md), outcome);
    }

    /// Find or allocate the child SA a CREATE_CHILD_SA exchange runs on
    fn resolve_child(&mut self, ike: SerialNo, row: usize, md: &MessageDigest) -> Option<SerialNo> {
        let t = &TRANSITIONS[row];
        let msgid = md.hdr.message_id;

        if md.is_request() {
            if self.table.child_with_msgid(ike, msgid).is_some() {
                debug!("CREATE_CHILD_SA request retransmission ignored");
                return None;
            }
            let (connection, spis, remote, window) = {
                let parent = self.table.get(ike)?;
                (
                    Arc::clone(&parent.connection),
                    parent.spis,
                    parent.remote,
                    parent.window,
                )
            };
            let child = self.table.insert(|serial| {
                exchange::new_sa(
                    serial,
                    SaRole::Responder,
                    t.from,
                    connection,
                    spis,
                    remote,
                    window,
                )
            });
            if let Some(sa) = self.table.get_mut(child) {
                sa.parent = Some(ike);
                sa.exchange_msgid = Some(msgid);
            }
            debug!(
                "allocated child {child} for inbound CREATE_CHILD_SA (state {})",
                t.from
            );
            Some(child)
        } else {
            let child = self.table.child_with_msgid(ike, msgid)?;
            let sa = self.table.get(child)?;
            // The response must land on the child that initiated; its
            // stored role says so, the state enum is not consulted.
            if sa.role != SaRole::Initiator {
                debug!("child {child} did not initiate message {msgid}; rejecting response");
                return None;
            }
            if sa.is_busy() {
                debug!("child {child} is busy processing; dropping message");
                return None;
            }
            Some(child)
        }
    }

    /// Collect one SKF fragment; returns whether the set completed
    fn collect_fragment(&mut self, serial: SerialNo, md: &MessageDigest) -> bool {
        let Some(skf) = md.chains.skf() else {
            return false;
        };
        let allowed = self.table.get(serial).is_some_and(|sa| {
            sa.connection.allow_fragmentation && sa.seen_fragmentation_vid
        });
        if !allowed {
            debug!("discarding encrypted fragment: fragmentation not negotiated");
            return false;
        }

        let Some(sa) = self.table.get_mut(serial) else {
            return false;
        };

        // once the peer fragments, respond using fragments as well,
        // without waiting for a retransmit
        if !sa.respond_with_fragments {
            sa.respond_with_fragments = true;
            debug!("peer fragments; responding with fragments from now on");
        }

        match FragmentBuffer::check(sa.rfrags.as_ref(), skf) {
            FragmentCheck::Reject => false,
            FragmentCheck::Restart => {
                sa.rfrags = Some(FragmentBuffer::new(skf.total));
                sa.rfrags
                    .as_mut()
                    .map(|frags| frags.collect(skf))
                    .unwrap_or(false)
            }
            FragmentCheck::Accept => {
                let frags = sa
                    .rfrags
                    .get_or_insert_with(|| FragmentBuffer::new(skf.total));
                frags.collect(skf)
            }
        }
    }

    /// Open the SK payload (or the completed fragment set), returning the
    /// inner first-payload type and the recovered plaintext
    fn decrypt_sk(&mut self, serial: SerialNo, md: &MessageDigest) -> Result<(u8, Vec<u8>), ()> {
        let Some(sa) = self.table.get(serial) else {
            return Err(());
        };
        let Some(keys) = sa.keys.as_ref() else {
            debug!("{serial} has no keys to open the SK payload");
            return Err(());
        };
        let from_initiator = md.sent_by_initiator();

        if let Some(sk) = md.chains.sk() {
            let plaintext = self
                .crypto
                .open(keys, from_initiator, &sk.data)
                .map_err(|_| ())?;
            return Ok((sk.first_payload, plaintext));
        }

        // fragmented: open each fragment and splice the plaintexts
        let Some(frags) = sa.rfrags.as_ref() else {
            return Err(());
        };
        let Some(in_order) = frags.in_order() else {
            return Err(());
        };
        let mut plaintext = vec![];
        for frag in in_order {
            plaintext.extend(
                self.crypto
                    .open(keys, from_initiator, &frag.cipher)
                    .map_err(|_| ())?,
            );
        }
        let first = frags.first_payload;

        // the buffer has served its purpose
        if let Some(sa) = self.table.get_mut(serial) {
            sa.rfrags = None;
        }
        Ok((first, plaintext))
    }

    /// Re-enter a suspended transition with a worker result
    ///
    /// Serial numbers are never reused, so a completion for a deleted SA
    /// simply finds nothing and is ignored.
    pub fn resume(&mut self, serial: SerialNo, ticket: OffloadTicket, result: CryptoResult) {
        let Some(sa) = self.table.get_mut(serial) else {
            debug!("dropping crypto completion for deleted SA {serial}");
            return;
        };
        if sa.offloaded != Some(ticket) {
            debug!("dropping stale crypto completion for {serial}");
            return;
        }
        sa.offloaded = None;

        match result {
            CryptoResult::Skeyseed(keys) => {
                sa.keys = Some(keys);
                sa.skeyseed_computed = true;
                debug!("{serial} SKEYSEED derived");
            }
            CryptoResult::DhShared(shared) => {
                debug!("{serial} DH shared secret of {} octets ready", shared.len());
            }
        }

        if let Some(suspended) = sa.suspended.take() {
            debug!(
                "resuming suspended transition '{}' of {serial}",
                TRANSITIONS[suspended.transition].story
            );
            self.process_state_packet(Some(serial), suspended.md);
        }
    }

    fn log_payload_errors(&self, sa: Option<SerialNo>, md: &MessageDigest, errors: &PayloadErrors) {
        // quiet for opportunistic connections (and absent SAs)
        let quiet = sa
            .and_then(|serial| self.table.get(serial))
            .map(|sa| sa.connection.opportunistic)
            .unwrap_or(true);
        if quiet {
            debug!("dropping unexpected {} message; {errors}", md.hdr.exchange);
        } else {
            warn!(
                "dropping unexpected {} message; message payloads: {}; encrypted payloads: {}; {errors}",
                md.hdr.exchange, md.message_payloads.present, md.encrypted_payloads.present
            );
        }
    }

    /// Answer a message that has (or deserves) no SA with an outermost
    /// notification; the SPIs are echoed from the inbound header
    pub(crate) fn send_notification_response_from_md(
        &mut self,
        md: &MessageDigest,
        code: u16,
        data: &[u8],
    ) {
        let packet = exchange::build_notification_response(
            md.hdr.spis,
            md.hdr.exchange,
            md.hdr.message_id,
            false,
            code,
            data,
        );
        match packet {
            Ok(packet) => self.push_packet(md.sender, packet),
            Err(err) => warn!("failed to build notification response: {err}"),
        }
    }

    /// Answer from an existing IKE SA, inside SK when keys exist
    pub(crate) fn send_notification_response_from_sa(
        &mut self,
        ike: SerialNo,
        md: &MessageDigest,
        code: u16,
        data: &[u8],
    ) {
        let Some(sa) = self.table.get(ike) else {
            return;
        };
        let initiator_flag = sa.role == SaRole::Initiator;
        let dest = sa.remote;

        let packet = if sa.keys.is_some() {
            let body = ikewire::generator::encode_notify(
                ikewire::params::SecurityProtocol::Reserved,
                None,
                code,
                data,
            );
            self.seal_message(
                ike,
                md.hdr.exchange,
                md.hdr.message_id,
                true,
                vec![(PayloadType::Notify, body)],
            )
        } else {
            exchange::build_notification_response(
                sa.spis,
                md.hdr.exchange,
                md.hdr.message_id,
                initiator_flag,
                code,
                data,
            )
            .map(|p| vec![p])
            .unwrap_or_default()
        };
        for p in packet {
            self.push_packet(dest, p);
        }
    }

    /// Protect a payload chain into one or more SK/SKF datagrams
    ///
    /// Splits into fragments when the peer negotiated fragmentation and
    /// the plaintext is large (or the peer already fragments itself).
    pub(crate) fn seal_message(
        &mut self,
        ike: SerialNo,
        exchange_type: ExchangeType,
        message_id: u32,
        response: bool,
        payloads: Vec<(PayloadType, Vec<u8>)>,
    ) -> Vec<Vec<u8>> {
        let Some(sa) = self.table.get(ike) else {
            return vec![];
        };
        let Some(keys) = sa.keys.as_ref() else {
            warn!("{ike} cannot seal a message without keys");
            return vec![];
        };
        let from_initiator = sa.role == SaRole::Initiator;
        let (first, plaintext) = exchange::encode_payload_chain(&payloads);

        let fragment = sa.respond_with_fragments
            && sa.seen_fragmentation_vid
            && plaintext.len() > exchange::FRAGMENT_THRESHOLD;

        let mut packets = vec![];
        if fragment {
            let chunks: Vec<&[u8]> = plaintext.chunks(exchange::FRAGMENT_THRESHOLD).collect();
            let total = chunks.len() as u16;
            for (i, chunk) in chunks.iter().enumerate() {
                let number = i as u16 + 1;
                let blob = self.crypto.seal(keys, from_initiator, chunk);
                let built = exchange::build_skf_packet(
                    sa.spis,
                    exchange_type,
                    message_id,
                    from_initiator,
                    response,
                    (number == 1).then_some(first),
                    number,
                    total,
                    blob,
                );
                match built {
                    Ok(p) => packets.push(p),
                    Err(err) => warn!("failed to build fragment {number}: {err}"),
                }
            }
        } else {
            let blob = self.crypto.seal(keys, from_initiator, &plaintext);
            let built = exchange::build_sk_packet(
                sa.spis,
                exchange_type,
                message_id,
                from_initiator,
                response,
                first,
                blob,
            );
            match built {
                Ok(p) => packets.push(p),
                Err(err) => warn!("failed to build SK message: {err}"),
            }
        }
        packets
    }

    /// Record an outbound request on the owning IKE SA and advance
    /// `next_use`
    pub(crate) fn record_request(&mut self, ike: SerialNo, packets: Vec<Vec<u8>>) {
        if let Some(sa) = self.table.get_mut(ike) {
            sa.recorded = packets;
            sa.msgid.on_request_sent();
        }
    }

    /// Record an outbound response on the owning IKE SA
    pub(crate) fn record_response(&mut self, ike: SerialNo, packets: Vec<Vec<u8>>) {
        if let Some(sa) = self.table.get_mut(ike) {
            sa.recorded = packets;
        }
    }
}

/// Failure starting an exchange
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum InitiateError {
    #[error("no connection named {0}")]
    UnknownConnection(String),
    #[error("SA {0} not found")]
    UnknownSa(SerialNo),
    #[error("SA {0} is not in a state to start this exchange")]
    WrongState(SerialNo),
    #[error("could not encode the request")]
    Encoding,
}

/// Locally driven actions: initiations and timer firings
impl Demux {
    /// Start a new IKE SA towards `remote` under the named connection
    pub fn initiate_ike_sa(
        &mut self,
        connection: &str,
        remote: SocketAddr,
    ) -> Result<SerialNo, InitiateError> {
        use rand::RngCore;

        let conn = self
            .connections
            .by_name(connection)
            .ok_or_else(|| InitiateError::UnknownConnection(connection.into()))?;

        let mut nonce = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut nonce);
        let mut ke_public = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut ke_public);

        let spis = crate::sa::SpiPair {
            initiator: crate::sa::fresh_spi(),
            responder: 0,
        };
        let window = conn.window;
        let allow_fragmentation = conn.allow_fragmentation;
        let serial = self.table.insert(|serial| {
            let mut sa = exchange::new_sa(
                serial,
                SaRole::Initiator,
                State::ParentI0,
                conn,
                spis,
                remote,
                window,
            );
            sa.nonce_mine = nonce.clone();
            sa.ke_group = 31;
            sa.ke_public_mine = ke_public.clone();
            sa.seen_fragmentation_vid = allow_fragmentation;
            sa
        });

        let packet = exchange::ike_sa_init::build_init_request(
            spis.initiator,
            31,
            &ke_public,
            &nonce,
            None,
            allow_fragmentation,
        )
        .ok_or(InitiateError::Encoding)?;

        self.record_request(serial, vec![packet]);
        self.complete_initiation(serial, State::ParentI0)?;
        Ok(serial)
    }

    /// Ask for the IKE SA (and everything under it) to be torn down via
    /// an INFORMATIONAL Delete exchange
    pub fn initiate_delete(&mut self, ike: SerialNo) -> Result<(), InitiateError> {
        let msgid = self
            .table
            .get(ike)
            .ok_or(InitiateError::UnknownSa(ike))?
            .msgid
            .next_use;
        let body = ikewire::generator::encode_delete(
            ikewire::params::SecurityProtocol::InternetKeyExchange,
            &[],
        );
        let packets = self.seal_message(
            ike,
            ExchangeType::Informational,
            msgid,
            false,
            vec![(PayloadType::Delete, body)],
        );
        if packets.is_empty() {
            return Err(InitiateError::Encoding);
        }
        if let Some(sa) = self.table.get_mut(ike) {
            sa.state = State::IkeSaDel;
        }
        self.record_request(ike, packets);
        self.send_recorded(ike);
        self.schedule_timeout(ike, crate::timer::TimeoutEvent::Retransmit);
        Ok(())
    }

    /// Send an empty INFORMATIONAL request probing the peer's liveness
    pub fn initiate_liveness_probe(&mut self, ike: SerialNo) -> Result<(), InitiateError> {
        let msgid = self
            .table
            .get(ike)
            .ok_or(InitiateError::UnknownSa(ike))?
            .msgid
            .next_use;
        let packets = self.seal_message(ike, ExchangeType::Informational, msgid, false, vec![]);
        if packets.is_empty() {
            return Err(InitiateError::Encoding);
        }
        self.record_request(ike, packets);
        self.send_recorded(ike);
        self.schedule_timeout(ike, crate::timer::TimeoutEvent::Retransmit);
        Ok(())
    }

    /// Create the child that will rekey the given IKE SA and send (or
    /// queue) its CREATE_CHILD_SA request
    pub fn initiate_ike_rekey(&mut self, ike: SerialNo) -> Result<SerialNo, InitiateError> {
        let (connection, spis, remote, window) = {
            let sa = self.table.get(ike).ok_or(InitiateError::UnknownSa(ike))?;
            if !sa.state.is_ike_established() {
                return Err(InitiateError::WrongState(ike));
            }
            (
                Arc::clone(&sa.connection),
                sa.spis,
                sa.remote,
                sa.window,
            )
        };
        let child = self.table.insert(|serial| {
            let mut sa = exchange::new_sa(
                serial,
                SaRole::Initiator,
                State::RekeyIkeI0,
                connection,
                spis,
                remote,
                window,
            );
            sa.parent = Some(ike);
            sa.rekey_spis = Some(crate::sa::SpiPair {
                initiator: crate::sa::fresh_spi(),
                responder: 0,
            });
            sa
        });
        self.initiate_child_exchange(child)?;
        Ok(child)
    }

    /// Create a child negotiating an additional IPsec SA and send (or
    /// queue) its CREATE_CHILD_SA request
    pub fn initiate_child_sa(&mut self, ike: SerialNo) -> Result<SerialNo, InitiateError> {
        let (connection, spis, remote, window) = {
            let sa = self.table.get(ike).ok_or(InitiateError::UnknownSa(ike))?;
            if !sa.state.is_ike_established() {
                return Err(InitiateError::WrongState(ike));
            }
            (
                Arc::clone(&sa.connection),
                sa.spis,
                sa.remote,
                sa.window,
            )
        };
        let child = self.table.insert(|serial| {
            let mut sa = exchange::new_sa(
                serial,
                SaRole::Initiator,
                State::CreateI0,
                connection,
                spis,
                remote,
                window,
            );
            sa.parent = Some(ike);
            sa
        });
        self.initiate_child_exchange(child)?;
        Ok(child)
    }

    /// Send a queued or fresh child exchange if the window permits,
    /// otherwise park the child on the send-next queue
    pub(crate) fn initiate_child_exchange(&mut self, child: SerialNo) -> Result<(), InitiateError> {
        use rand::RngCore;

        let ike = self
            .table
            .ike_of(child)
            .ok_or(InitiateError::UnknownSa(child))?;

        // window full? wait for a response to free a slot
        let window_full = {
            let sa = self.table.get(ike).ok_or(InitiateError::UnknownSa(ike))?;
            sa.msgid.unacknowledged() >= sa.window
        };
        if window_full {
            debug!("window full on {ike}; parking {child} on the send-next queue");
            if let Some(sa) = self.table.get_mut(ike) {
                sa.send_next.push_back(child);
            }
            return Ok(());
        }

        let state = self
            .table
            .get(child)
            .ok_or(InitiateError::UnknownSa(child))?
            .state;
        let msgid = self
            .table
            .get(ike)
            .ok_or(InitiateError::UnknownSa(ike))?
            .msgid
            .next_use;

        let mut nonce = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut nonce);

        let (next_state, payloads) = match state {
            State::CreateI0 | State::RekeyChildI0 => {
                let mut esp_spi = vec![0u8; 4];
                rand::thread_rng().fill_bytes(&mut esp_spi);
                let sa_body = ikewire::generator::encode_security_association(
                    &ikewire::payload::SecurityAssociation {
                        proposals: vec![exchange::default_esp_proposal(esp_spi.clone())],
                    },
                )
                .map_err(|_| InitiateError::Encoding)?;
                if let Some(sa) = self.table.get_mut(child) {
                    sa.nonce_mine = nonce.clone();
                    sa.ipsec_spis = Some((esp_spi, vec![]));
                }
                let next = if state == State::CreateI0 {
                    State::CreateI
                } else {
                    State::RekeyChildI
                };
                (
                    next,
                    vec![
                        (PayloadType::SecurityAssociation, sa_body),
                        (PayloadType::Nonce, nonce),
                        (
                            PayloadType::TrafficSelectorInitiator,
                            ikewire::generator::encode_traffic_selectors(
                                &exchange::wildcard_selectors(),
                            ),
                        ),
                        (
                            PayloadType::TrafficSelectorResponder,
                            ikewire::generator::encode_traffic_selectors(
                                &exchange::wildcard_selectors(),
                            ),
                        ),
                    ],
                )
            }
            State::RekeyIkeI0 => {
                let new_spi = self
                    .table
                    .get(child)
                    .and_then(|sa| sa.rekey_spis)
                    .map(|spis| spis.initiator)
                    .unwrap_or_else(crate::sa::fresh_spi);
                let sa_body = ikewire::generator::encode_security_association(
                    &ikewire::payload::SecurityAssociation {
                        proposals: vec![exchange::default_ike_proposal(
                            new_spi.to_be_bytes().to_vec(),
                        )],
                    },
                )
                .map_err(|_| InitiateError::Encoding)?;
                let mut ke_public = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut ke_public);
                let group = self.table.get(ike).map(|sa| sa.ke_group).unwrap_or(31);
                if let Some(sa) = self.table.get_mut(child) {
                    sa.nonce_mine = nonce.clone();
                    sa.ke_public_mine = ke_public.clone();
                    sa.ke_group = group;
                }
                (
                    State::RekeyIkeI,
                    vec![
                        (PayloadType::SecurityAssociation, sa_body),
                        (PayloadType::Nonce, nonce),
                        (
                            PayloadType::KeyExchange,
                            ikewire::generator::encode_key_exchange(group, &ke_public),
                        ),
                    ],
                )
            }
            _ => return Err(InitiateError::WrongState(child)),
        };

        let packets = self.seal_message(ike, ExchangeType::CreateChildSa, msgid, false, payloads);
        if packets.is_empty() {
            return Err(InitiateError::Encoding);
        }
        if let Some(sa) = self.table.get_mut(child) {
            sa.exchange_msgid = Some(msgid);
            sa.state = next_state;
        }
        self.record_request(ike, packets);
        self.send_recorded(ike);
        self.schedule_timeout(ike, crate::timer::TimeoutEvent::Retransmit);
        Ok(())
    }

    /// Finish a locally started transition: advance the state, transmit
    /// the recorded request and start its retransmission timer
    fn complete_initiation(&mut self, serial: SerialNo, from: State) -> Result<(), InitiateError> {
        let row = self
            .index
            .initiate_from(from)
            .ok_or(InitiateError::WrongState(serial))?;
        let to = TRANSITIONS[row].to;
        if let Some(sa) = self.table.get_mut(serial) {
            sa.state = to;
        }
        debug!(
            "initiated '{}'; {serial} now in state {to}",
            TRANSITIONS[row].story
        );
        self.send_recorded(serial);
        self.schedule_timeout(serial, TRANSITIONS[row].timeout);
        Ok(())
    }

    /// React to a fired timer
    ///
    /// Stale firings (the SA re-armed or died since scheduling) are
    /// recognized by the generation counter and dropped.
    pub fn handle_timer(
        &mut self,
        serial: SerialNo,
        generation: u64,
        event: crate::timer::TimerEvent,
    ) {
        use crate::timer::TimerEvent;

        let Some(sa) = self.table.get(serial) else {
            return;
        };
        if sa.timer_generation != generation {
            trace!("dropping stale {event:?} timer for {serial}");
            return;
        }
        let is_child = sa.is_child();

        match event {
            TimerEvent::Retransmit => self.handle_retransmit_timer(serial, generation),
            TimerEvent::SaReplace => {
                if is_child {
                    debug!("replacing child SA {serial}");
                    let ike = self.table.ike_of(serial);
                    self.delete_sa_tree(serial);
                    if let Some(ike) = ike {
                        let _ = self.initiate_child_sa(ike);
                    }
                } else {
                    debug!("replacing IKE SA {serial} via rekey");
                    let _ = self.initiate_ike_rekey(serial);
                }
            }
            TimerEvent::SoDiscard => {
                self.log_sa(serial, "discarding SA the peer never completed");
                self.delete_sa_tree(serial);
            }
            TimerEvent::Liveness => {
                let ike = self.table.ike_of(serial);
                if let Some(ike) = ike {
                    let _ = self.initiate_liveness_probe(ike);
                }
            }
            TimerEvent::SendNextIke => {
                let _ = self.initiate_child_exchange(serial);
            }
        }
    }

    fn handle_retransmit_timer(&mut self, serial: SerialNo, generation: u64) {
        let Some(sa) = self.table.get(serial) else {
            return;
        };
        let Some(state) = sa.retransmit else {
            return;
        };
        let timeout = sa.connection.retransmit_timeout();
        let cap = sa.connection.retransmit_cap();
        let elapsed = state.elapsed + state.interval;

        if elapsed >= timeout {
            self.log_sa(serial, "giving up after repeated retransmissions");
            self.complete_transition(Some(serial), None, Outcome::Fatal);
            return;
        }

        debug!("retransmitting request of {serial} (elapsed {elapsed:?})");
        self.send_recorded(serial);

        let next = crate::timer::back_off(state.interval, cap);
        if let Some(sa) = self.table.get_mut(serial) {
            sa.retransmit = Some(crate::sa::RetransmitState {
                interval: next,
                elapsed,
            });
        }
        self.timers
            .schedule(serial, generation, crate::timer::TimerEvent::Retransmit, next);
    }
}
