//! Security association objects and the table resolving messages to them
//!
//! Both IKE SAs and child SAs are [Sa] records; a child references its
//! parent by serial number only, so deleting a parent can never leave a
//! dangling pointer behind. A parent's children are found by filtering
//! the table, never by a stored list.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use rand::Rng;
use tracing::debug;

use ikewire::payload::TrafficSelector;

use crate::config::Connection;
use crate::crypto::SkeyMaterial;
use crate::frag::FragmentBuffer;
use crate::md::MessageDigest;
use crate::msgid::MsgidCounters;

/// Identifier of one SA, unique for the lifetime of the process
///
/// Serial numbers are never reused, which lets worker-pool completions
/// detect that the SA they belong to is gone.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SerialNo(pub u64);

impl fmt::Display for SerialNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which end of the SA this host is
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum SaRole {
    Initiator,
    Responder,
}

/// The finite states of the IKEv2 machine
///
/// Parent states belong to IKE SAs, the create/rekey and IPsec states to
/// child SAs (with the IKE-rekey states belonging to the child that will
/// become an IKE SA on success).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
#[allow(missing_docs)]
pub enum State {
    ParentI0,
    ParentI1,
    ParentI2,
    ParentI3,
    ParentR0,
    ParentR1,
    ParentR2,
    CreateI0,
    CreateI,
    CreateR,
    RekeyIkeI0,
    RekeyIkeI,
    RekeyIkeR,
    RekeyChildI0,
    RekeyChildI,
    RekeyChildR,
    IpsecI,
    IpsecR,
    IkeSaDel,
    ChildSaDel,
}

impl State {
    /// Whether an IKE SA in this state counts against the half-open flood
    /// limit
    pub fn is_half_open(self) -> bool {
        matches!(self, State::ParentI1 | State::ParentR0 | State::ParentR1)
    }

    /// Whether this is a state of an established child SA
    pub fn is_child_established(self) -> bool {
        matches!(self, State::IpsecI | State::IpsecR)
    }

    /// Whether this is a state of an established IKE SA
    pub fn is_ike_established(self) -> bool {
        matches!(self, State::ParentI3 | State::ParentR2 | State::IkeSaDel)
    }
}

/// The two 64-bit SPIs naming an IKE SA on the wire
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct SpiPair {
    /// SPI chosen by the original initiator
    pub initiator: u64,
    /// SPI chosen by the responder; zero until the responder replied
    pub responder: u64,
}

/// A transition suspended while a worker computes
///
/// The message digest that triggered the transition is stashed here; the
/// completion event re-enters the dispatcher with it.
#[derive(Debug)]
pub struct Suspended {
    /// The stashed inbound message
    pub md: MessageDigest,
    /// Index into [crate::transitions::TRANSITIONS] of the suspended row
    pub transition: usize,
}

/// An outstanding worker-pool computation
///
/// Distinct from [Suspended]: an SA is busy when either is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffloadTicket {
    /// Ticket number the completion must echo
    pub id: u64,
}

/// Retransmission bookkeeping for the last sent request
#[derive(Debug, Clone, Copy)]
pub struct RetransmitState {
    /// Interval the next back-off step will wait
    pub interval: std::time::Duration,
    /// Time spent retransmitting so far
    pub elapsed: std::time::Duration,
}

/// One security association, IKE or child
#[derive(Debug)]
pub struct Sa {
    /// Process-unique identifier
    pub serial: SerialNo,
    /// Serial of the parent IKE SA; `None` on IKE SAs themselves
    pub parent: Option<SerialNo>,
    /// Which end of the negotiation this host is
    pub role: SaRole,
    /// Current finite state
    pub state: State,
    /// Policy this SA negotiates under
    pub connection: Arc<Connection>,
    /// SPI pair naming the IKE SA on the wire
    pub spis: SpiPair,
    /// Fresh SPI pair negotiated by an in-flight IKE rekey
    pub rekey_spis: Option<SpiPair>,
    /// Peer endpoint
    pub remote: SocketAddr,
    /// Message-ID sequencing counters (meaningful on IKE SAs)
    pub msgid: MsgidCounters,
    /// For child SAs: the message ID of the exchange that negotiates them
    pub exchange_msgid: Option<u32>,
    /// In-flight request concurrency limit
    pub window: u32,
    /// Whether SKEYSEED has been derived for this IKE SA
    pub skeyseed_computed: bool,
    /// Keying material protecting SK payloads, once derived
    pub keys: Option<SkeyMaterial>,
    /// Nonce we sent
    pub nonce_mine: Vec<u8>,
    /// Nonce the peer sent
    pub nonce_peer: Vec<u8>,
    /// Diffie-Hellman group this SA negotiates with
    pub ke_group: u16,
    /// Our Diffie-Hellman public value
    pub ke_public_mine: Vec<u8>,
    /// The peer's Diffie-Hellman public value
    pub ke_peer: Vec<u8>,
    /// Cookie the responder demanded; echoed in the repeated IKE_SA_INIT
    pub cookie_to_echo: Option<Vec<u8>>,
    /// Reassembly buffer for inbound SKF fragments
    pub rfrags: Option<FragmentBuffer>,
    /// Peer advertised support for RFC 7383 fragmentation
    pub seen_fragmentation_vid: bool,
    /// Peer actually sent fragments; reply using fragments from now on
    pub respond_with_fragments: bool,
    /// The last message this SA transmitted (one entry per fragment);
    /// re-sent on retransmission timers and on duplicate requests
    pub recorded: Vec<Vec<u8>>,
    /// Transition waiting for an asynchronous crypto completion
    pub suspended: Option<Suspended>,
    /// Outstanding worker-pool ticket
    pub offloaded: Option<OffloadTicket>,
    /// Children waiting for an outbound Message-ID slot
    pub send_next: VecDeque<SerialNo>,
    /// Negotiated traffic selectors (child SAs)
    pub ts: Option<(Vec<TrafficSelector>, Vec<TrafficSelector>)>,
    /// IPsec SPIs of a child SA: ours, then the peer's
    pub ipsec_spis: Option<(Vec<u8>, Vec<u8>)>,
    /// IPcomp CPI when compression was negotiated (child SAs)
    pub ipcomp_cpi: Option<u16>,
    /// Retransmission state of the last request we sent
    pub retransmit: Option<RetransmitState>,
    /// Monotonic counter invalidating stale timers for this SA
    pub timer_generation: u64,
}

impl Sa {
    /// Whether this SA is a child SA
    pub fn is_child(&self) -> bool {
        self.parent.is_some()
    }

    /// Whether a transition is in flight; events that would mutate the SA
    /// are dropped while busy
    ///
    /// The two indicators are deliberately separate: a transition can be
    /// suspended without a worker ticket (waiting on a peer) and a worker
    /// can run without a stashed message (initiator-side derivations).
    pub fn is_busy(&self) -> bool {
        self.suspended.is_some() || self.offloaded.is_some()
    }
}

/// Generate a fresh nonzero SPI
pub fn fresh_spi() -> u64 {
    let mut rng = rand::thread_rng();
    loop {
        let spi: u64 = rng.gen();
        if spi != 0 {
            return spi;
        }
    }
}

/// The table owning every SA, keyed by serial number
///
/// The table is owned by the event loop and never shared across threads.
#[derive(Debug, Default)]
pub struct SaTable {
    by_serial: BTreeMap<SerialNo, Sa>,
    next_serial: u64,
}

impl SaTable {
    /// Insert a freshly built SA under the next serial number
    pub fn insert(&mut self, build: impl FnOnce(SerialNo) -> Sa) -> SerialNo {
        self.next_serial += 1;
        let serial = SerialNo(self.next_serial);
        let sa = build(serial);
        self.by_serial.insert(serial, sa);
        serial
    }

    /// Borrow an SA
    pub fn get(&self, serial: SerialNo) -> Option<&Sa> {
        self.by_serial.get(&serial)
    }

    /// Mutably borrow an SA
    pub fn get_mut(&mut self, serial: SerialNo) -> Option<&mut Sa> {
        self.by_serial.get_mut(&serial)
    }

    /// Remove an SA, returning it
    pub fn remove(&mut self, serial: SerialNo) -> Option<Sa> {
        self.by_serial.remove(&serial)
    }

    /// Serial of the IKE SA an SA belongs to: itself when it is one,
    /// its parent otherwise
    pub fn ike_of(&self, serial: SerialNo) -> Option<SerialNo> {
        let sa = self.get(serial)?;
        match sa.parent {
            None => Some(serial),
            Some(parent) => self.get(parent).map(|_| parent),
        }
    }

    /// Find an IKE SA by initiator SPI only
    ///
    /// Used for IKE_SA_INIT in both directions, where the responder SPI
    /// is still unknown.
    pub fn find_by_initiator_spi(&self, spi_i: u64) -> Option<SerialNo> {
        self.by_serial
            .values()
            .find(|sa| !sa.is_child() && sa.spis.initiator == spi_i)
            .map(|sa| sa.serial)
    }

    /// Find an IKE SA by full SPI pair
    pub fn find_ike(&self, spis: SpiPair) -> Option<SerialNo> {
        self.by_serial
            .values()
            .find(|sa| {
                !sa.is_child()
                    && sa.spis.initiator == spis.initiator
                    && sa.spis.responder == spis.responder
            })
            .map(|sa| sa.serial)
    }

    /// Find the child SA that runs the exchange with the given message ID
    /// under the given IKE SA
    ///
    /// Lookups key on `(parent, msgid)` alone; the caller decides from
    /// the message role whether the child it found makes sense.
    pub fn child_with_msgid(&self, ike: SerialNo, msgid: u32) -> Option<SerialNo> {
        let found = self
            .by_serial
            .values()
            .rev()
            .find(|sa| sa.parent == Some(ike) && sa.exchange_msgid == Some(msgid))
            .map(|sa| sa.serial);
        if found.is_none() {
            debug!("no child of {ike} matches message id {msgid}");
        }
        found
    }

    /// All children of an IKE SA, oldest first
    pub fn children_of(&self, ike: SerialNo) -> Vec<SerialNo> {
        self.by_serial
            .values()
            .filter(|sa| sa.parent == Some(ike))
            .map(|sa| sa.serial)
            .collect()
    }

    /// Number of IKE SAs currently counting against the flood limit
    pub fn half_open_count(&self) -> usize {
        self.by_serial
            .values()
            .filter(|sa| !sa.is_child() && sa.state.is_half_open())
            .count()
    }

    /// Iterate over all SAs
    pub fn iter(&self) -> impl Iterator<Item = &Sa> {
        self.by_serial.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msgid::MsgidCounters;

    fn blank_sa(serial: SerialNo, spis: SpiPair) -> Sa {
        Sa {
            serial,
            parent: None,
            role: SaRole::Responder,
            state: State::ParentR1,
            connection: Arc::new(Connection::default()),
            spis,
            rekey_spis: None,
            remote: "192.0.2.1:500".parse().unwrap_or_else(|_| unreachable!()),
            msgid: MsgidCounters::default(),
            exchange_msgid: None,
            window: 1,
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

    #[test]
    fn lookup_by_spi() {
        let mut table = SaTable::default();
        let spis = SpiPair {
            initiator: 0xaa01,
            responder: 0xbb02,
        };
        let serial = table.insert(|serial| blank_sa(serial, spis));

        assert_eq!(table.find_by_initiator_spi(0xaa01), Some(serial));
        assert_eq!(table.find_ike(spis), Some(serial));
        assert_eq!(
            table.find_ike(SpiPair {
                initiator: 0xaa01,
                responder: 0,
            }),
            None
        );
    }

    #[test]
    fn child_lookup_keys_on_parent_and_msgid() {
        let mut table = SaTable::default();
        let ike = table.insert(|serial| blank_sa(serial, SpiPair::default()));
        let child = table.insert(|serial| {
            let mut sa = blank_sa(serial, SpiPair::default());
            sa.parent = Some(ike);
            sa.exchange_msgid = Some(2);
            sa
        });

        assert_eq!(table.child_with_msgid(ike, 2), Some(child));
        assert_eq!(table.child_with_msgid(ike, 3), None);
        assert_eq!(table.ike_of(child), Some(ike));
        assert_eq!(table.children_of(ike), vec![child]);
    }

    #[test]
    fn half_open_counting() {
        let mut table = SaTable::default();
        table.insert(|serial| blank_sa(serial, SpiPair::default()));
        let established = table.insert(|serial| {
            let mut sa = blank_sa(serial, SpiPair::default());
            sa.state = State::ParentR2;
            sa
        });
        assert_eq!(table.half_open_count(), 1);
        assert!(table.get(established).is_some_and(|sa| !sa.state.is_half_open()));
    }
}
