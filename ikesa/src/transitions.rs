//! The state-transition table
//!
//! Every way the machine may react to a message (or initiate one) is a
//! row here: from-state, next state, exchange, flag constraints, expected
//! payload sets, handler and the timeout scheduled on success. The table
//! is constant; [TransitionIndex] derives the per-state view once at
//! startup and nothing is ever patched afterwards.

use std::collections::HashMap;

use ikewire::params::{ExchangeType, NotifyError};
use ikewire::set::PayloadSet;

use crate::classify::ExpectedPayloads;
use crate::complete::Outcome;
use crate::dispatch::Demux;
use crate::exchange;
use crate::md::MessageDigest;
use crate::sa::{SerialNo, State};
use crate::timer::TimeoutEvent;

/// A transition's handler: `(sa, md) -> outcome`
///
/// `sa` is `None` exactly when the responder processes the very first
/// IKE_SA_INIT request; the handler allocates the SA in that case.
pub type Handler = fn(&mut Demux, Option<SerialNo>, &mut MessageDigest) -> Outcome;

/// Constraint flags of one transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmfFlags(u16);

#[allow(missing_docs)]
impl SmfFlags {
    pub const NONE: SmfFlags = SmfFlags(0);
    /// The inbound message must have the I(nitiator) flag set
    pub const IKE_I_SET: SmfFlags = SmfFlags(1 << 0);
    /// The inbound message must have the I(nitiator) flag clear
    pub const IKE_I_CLEAR: SmfFlags = SmfFlags(1 << 1);
    /// The inbound message must have the R(esponse) flag set
    pub const MSG_R_SET: SmfFlags = SmfFlags(1 << 2);
    /// The inbound message must have the R(esponse) flag clear
    pub const MSG_R_CLEAR: SmfFlags = SmfFlags(1 << 3);
    /// A reply recorded by the handler is transmitted on success
    pub const SEND: SmfFlags = SmfFlags(1 << 4);
    /// Row only matches while SKEYSEED has not been computed yet; the
    /// SK payload stays encrypted and the handler starts the derivation
    pub const NO_SKEYSEED: SmfFlags = SmfFlags(1 << 5);

    /// Combine two flag sets
    pub const fn union(self, other: SmfFlags) -> SmfFlags {
        SmfFlags(self.0 | other.0)
    }

    /// Whether all of `other` is set in `self`
    pub const fn contains(self, other: SmfFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// One row of the state machine
#[derive(Debug, Clone, Copy)]
pub struct Microcode {
    /// Human-readable description used in logs
    pub story: &'static str,
    /// State the transition starts from
    pub from: State,
    /// State reached on success
    pub to: State,
    /// Exchange type of the message this row processes; `None` marks
    /// rows describing locally initiated sends, which never match an
    /// inbound message
    pub recv_exchange: Option<ExchangeType>,
    /// Flag constraints and processing options
    pub flags: SmfFlags,
    /// Expectations on the cleartext payloads
    pub message_payloads: ExpectedPayloads,
    /// Expectations on the payloads inside SK
    pub encrypted_payloads: ExpectedPayloads,
    /// The processor invoked once the row matches
    pub handler: Handler,
    /// Timeout scheduled when the transition succeeds
    pub timeout: TimeoutEvent,
}

/// Handler of initiate-only rows; the dispatcher never invokes it
fn no_processor(_: &mut Demux, _: Option<SerialNo>, _: &mut MessageDigest) -> Outcome {
    Outcome::InternalError
}

const BASE: Microcode = Microcode {
    story: "",
    from: State::ParentI0,
    to: State::ParentI0,
    recv_exchange: None,
    flags: SmfFlags::NONE,
    message_payloads: ExpectedPayloads::none(),
    encrypted_payloads: ExpectedPayloads::none(),
    handler: no_processor,
    timeout: TimeoutEvent::Null,
};

const SK_ONLY: ExpectedPayloads = ExpectedPayloads::of(PayloadSet::SK, PayloadSet::EMPTY);

/// The complete transition table, scanned in order; the first matching
/// row wins
pub static TRANSITIONS: &[Microcode] = &[
    // no state:   --> CREATE_CHILD IKE Rekey request
    // HDR, SK {SA, Ni, KEi} -->
    Microcode {
        story: "initiate CREATE_CHILD_SA IKE rekey",
        from: State::RekeyIkeI0,
        to: State::RekeyIkeI,
        flags: SmfFlags::SEND,
        timeout: TimeoutEvent::Retransmit,
        ..BASE
    },
    // no state:   --> CREATE_CHILD IPsec rekey request
    // HDR, SK {N(REKEY_SA), SA, Ni, [KEi,] TSi, TSr} -->
    Microcode {
        story: "initiate CREATE_CHILD_SA IPsec rekey",
        from: State::RekeyChildI0,
        to: State::RekeyChildI,
        flags: SmfFlags::SEND,
        timeout: TimeoutEvent::Retransmit,
        ..BASE
    },
    // no state:   --> CREATE_CHILD IPsec request
    // HDR, SK {SA, Ni, [KEi,] TSi, TSr} -->
    Microcode {
        story: "initiate CREATE_CHILD_SA IPsec SA",
        from: State::CreateI0,
        to: State::CreateI,
        flags: SmfFlags::SEND,
        timeout: TimeoutEvent::Retransmit,
        ..BASE
    },
    // no state:   --> I1
    // HDR, SAi1, KEi, Ni -->
    Microcode {
        story: "initiate IKE_SA_INIT",
        from: State::ParentI0,
        to: State::ParentI1,
        flags: SmfFlags::SEND,
        timeout: TimeoutEvent::Retransmit,
        ..BASE
    },
    // I1: processing an error notification means either restarting with
    // a cookie/new KE or giving up; the state does not advance here
    //                      <-- HDR, N
    Microcode {
        story: "initiator: process SA_INIT reply notification",
        from: State::ParentI1,
        to: State::ParentI1,
        recv_exchange: Some(ExchangeType::IkeSaInit),
        flags: SmfFlags::IKE_I_CLEAR.union(SmfFlags::MSG_R_SET).union(SmfFlags::SEND),
        message_payloads: ExpectedPayloads::of(PayloadSet::N, PayloadSet::EMPTY),
        timeout: TimeoutEvent::Retain,
        handler: exchange::ike_sa_init::process_response_notification,
        ..BASE
    },
    // I1 --> I2
    //                      <-- HDR, SAr1, KEr, Nr, [CERTREQ]
    // HDR, SK {IDi, [CERT,] [CERTREQ,] [IDr,] AUTH, SAi2, TSi, TSr} -->
    Microcode {
        story: "initiator: process IKE_SA_INIT reply, initiate IKE_AUTH",
        from: State::ParentI1,
        to: State::ParentI2,
        recv_exchange: Some(ExchangeType::IkeSaInit),
        flags: SmfFlags::IKE_I_CLEAR.union(SmfFlags::MSG_R_SET).union(SmfFlags::SEND),
        message_payloads: ExpectedPayloads::of(
            PayloadSet::SA.union(PayloadSet::KE).union(PayloadSet::NONCE),
            PayloadSet::CERTREQ,
        ),
        timeout: TimeoutEvent::Retransmit,
        handler: exchange::ike_sa_init::process_response,
        ..BASE
    },
    // I2: the AUTH reply may carry a failure notification instead of the
    // negotiated SA
    Microcode {
        story: "initiator: process INVALID_SYNTAX AUTH notification",
        from: State::ParentI2,
        to: State::ParentI2,
        recv_exchange: Some(ExchangeType::IkeAuth),
        flags: SmfFlags::IKE_I_CLEAR.union(SmfFlags::MSG_R_SET),
        message_payloads: SK_ONLY,
        encrypted_payloads: ExpectedPayloads::of(PayloadSet::N, PayloadSet::EMPTY)
            .with_notification(NotifyError::InvalidSyntax),
        handler: exchange::ike_auth::process_failure_notification,
        ..BASE
    },
    Microcode {
        story: "initiator: process AUTHENTICATION_FAILED AUTH notification",
        from: State::ParentI2,
        to: State::ParentI2,
        recv_exchange: Some(ExchangeType::IkeAuth),
        flags: SmfFlags::IKE_I_CLEAR.union(SmfFlags::MSG_R_SET),
        message_payloads: SK_ONLY,
        encrypted_payloads: ExpectedPayloads::of(PayloadSet::N, PayloadSet::EMPTY)
            .with_notification(NotifyError::AuthenticationFailed),
        handler: exchange::ike_auth::process_failure_notification,
        ..BASE
    },
    Microcode {
        story: "initiator: process UNSUPPORTED_CRITICAL_PAYLOAD AUTH notification",
        from: State::ParentI2,
        to: State::ParentI2,
        recv_exchange: Some(ExchangeType::IkeAuth),
        flags: SmfFlags::IKE_I_CLEAR.union(SmfFlags::MSG_R_SET),
        message_payloads: SK_ONLY,
        encrypted_payloads: ExpectedPayloads::of(PayloadSet::N, PayloadSet::EMPTY)
            .with_notification(NotifyError::UnsupportedCriticalPayload),
        handler: exchange::ike_auth::process_failure_notification,
        ..BASE
    },
    // I2 --> established
    //                      <-- HDR, SK {IDr, [CERT,] AUTH, SAr2, TSi, TSr}
    Microcode {
        story: "initiator: process IKE_AUTH response",
        from: State::ParentI2,
        to: State::IpsecI,
        recv_exchange: Some(ExchangeType::IkeAuth),
        flags: SmfFlags::IKE_I_CLEAR.union(SmfFlags::MSG_R_SET),
        message_payloads: SK_ONLY,
        encrypted_payloads: ExpectedPayloads::of(
            PayloadSet::IDR
                .union(PayloadSet::AUTH)
                .union(PayloadSet::SA)
                .union(PayloadSet::TSI)
                .union(PayloadSet::TSR),
            PayloadSet::CERT.union(PayloadSet::CP),
        ),
        timeout: TimeoutEvent::SaReplace,
        handler: exchange::ike_auth::process_response,
        ..BASE
    },
    Microcode {
        story: "initiator: process IKE_AUTH response with unknown notification",
        from: State::ParentI2,
        to: State::ParentI2,
        recv_exchange: Some(ExchangeType::IkeAuth),
        flags: SmfFlags::IKE_I_CLEAR.union(SmfFlags::MSG_R_SET),
        message_payloads: SK_ONLY,
        encrypted_payloads: ExpectedPayloads::of(PayloadSet::N, PayloadSet::EMPTY),
        handler: exchange::ike_auth::process_unknown_notification,
        ..BASE
    },
    // no state: I1 --> R1
    //                <-- HDR, SAi1, KEi, Ni
    // HDR, SAr1, KEr, Nr, [CERTREQ] -->
    Microcode {
        story: "respond to IKE_SA_INIT",
        from: State::ParentR0,
        to: State::ParentR1,
        recv_exchange: Some(ExchangeType::IkeSaInit),
        flags: SmfFlags::IKE_I_SET.union(SmfFlags::MSG_R_CLEAR).union(SmfFlags::SEND),
        message_payloads: ExpectedPayloads::of(
            PayloadSet::SA.union(PayloadSet::KE).union(PayloadSet::NONCE),
            PayloadSet::EMPTY,
        ),
        timeout: TimeoutEvent::SoDiscard,
        handler: exchange::ike_sa_init::respond_to_request,
        ..BASE
    },
    // R1: the AUTH request arrives before the DH answer triggered the
    // SKEYSEED derivation; the SK payload cannot be opened yet
    Microcode {
        story: "responder: process IKE_AUTH request (no SKEYSEED)",
        from: State::ParentR1,
        to: State::ParentR1,
        recv_exchange: Some(ExchangeType::IkeAuth),
        flags: SmfFlags::IKE_I_SET
            .union(SmfFlags::MSG_R_CLEAR)
            .union(SmfFlags::SEND)
            .union(SmfFlags::NO_SKEYSEED),
        message_payloads: SK_ONLY,
        timeout: TimeoutEvent::SaReplace,
        handler: exchange::ike_auth::respond_no_skeyseed,
        ..BASE
    },
    // R1 --> established
    //                  <-- HDR, SK {IDi, [CERT,] [CERTREQ,] [IDr,] AUTH, SAi2, TSi, TSr}
    // HDR, SK {IDr, [CERT,] AUTH, SAr2, TSi, TSr} -->
    Microcode {
        story: "responder: process IKE_AUTH request",
        from: State::ParentR1,
        to: State::IpsecR,
        recv_exchange: Some(ExchangeType::IkeAuth),
        flags: SmfFlags::IKE_I_SET.union(SmfFlags::MSG_R_CLEAR).union(SmfFlags::SEND),
        message_payloads: SK_ONLY,
        encrypted_payloads: ExpectedPayloads::of(
            PayloadSet::IDI
                .union(PayloadSet::AUTH)
                .union(PayloadSet::SA)
                .union(PayloadSet::TSI)
                .union(PayloadSet::TSR),
            PayloadSet::CERT
                .union(PayloadSet::CERTREQ)
                .union(PayloadSet::IDR)
                .union(PayloadSet::CP),
        ),
        timeout: TimeoutEvent::SaReplace,
        handler: exchange::ike_auth::respond_to_request,
        ..BASE
    },
    // CREATE_CHILD_SA to rekey the IKE SA
    // HDR, SK {SA, Ni, KEi} -->
    //          <-- HDR, SK {SA, Nr, KEr}
    Microcode {
        story: "respond to CREATE_CHILD_SA IKE rekey",
        from: State::RekeyIkeR,
        to: State::ParentR2,
        recv_exchange: Some(ExchangeType::CreateChildSa),
        flags: SmfFlags::MSG_R_CLEAR.union(SmfFlags::SEND),
        message_payloads: SK_ONLY,
        encrypted_payloads: ExpectedPayloads::of(
            PayloadSet::SA.union(PayloadSet::NONCE).union(PayloadSet::KE),
            PayloadSet::N,
        ),
        timeout: TimeoutEvent::SaReplace,
        handler: exchange::create_child::respond_to_ike_rekey,
        ..BASE
    },
    Microcode {
        story: "process CREATE_CHILD_SA IKE rekey response",
        from: State::RekeyIkeI,
        to: State::ParentI3,
        recv_exchange: Some(ExchangeType::CreateChildSa),
        flags: SmfFlags::MSG_R_SET,
        message_payloads: SK_ONLY,
        encrypted_payloads: ExpectedPayloads::of(
            PayloadSet::SA.union(PayloadSet::NONCE).union(PayloadSet::KE),
            PayloadSet::N,
        ),
        timeout: TimeoutEvent::SaReplace,
        handler: exchange::create_child::process_ike_rekey_response,
        ..BASE
    },
    Microcode {
        story: "process CREATE_CHILD_SA IPsec SA response",
        from: State::CreateI,
        to: State::IpsecI,
        recv_exchange: Some(ExchangeType::CreateChildSa),
        flags: SmfFlags::MSG_R_SET,
        message_payloads: SK_ONLY,
        encrypted_payloads: ExpectedPayloads::of(
            PayloadSet::SA
                .union(PayloadSet::NONCE)
                .union(PayloadSet::TSI)
                .union(PayloadSet::TSR),
            PayloadSet::KE.union(PayloadSet::N),
        ),
        timeout: TimeoutEvent::SaReplace,
        handler: exchange::create_child::process_child_response,
        ..BASE
    },
    Microcode {
        story: "respond to CREATE_CHILD_SA IPsec SA request",
        from: State::CreateR,
        to: State::IpsecR,
        recv_exchange: Some(ExchangeType::CreateChildSa),
        flags: SmfFlags::MSG_R_CLEAR.union(SmfFlags::SEND),
        message_payloads: SK_ONLY,
        encrypted_payloads: ExpectedPayloads::of(
            PayloadSet::SA
                .union(PayloadSet::NONCE)
                .union(PayloadSet::TSI)
                .union(PayloadSet::TSR),
            PayloadSet::KE.union(PayloadSet::N),
        ),
        timeout: TimeoutEvent::SaReplace,
        handler: exchange::create_child::respond_to_request,
        ..BASE
    },
    // INFORMATIONAL, RFC 7296 1.4
    // HDR, SK {[N,] [D,] [CP,] ...}  -->
    //   <--  HDR, SK {[N,] [D,] [CP], ...}
    Microcode {
        story: "I3: process INFORMATIONAL request",
        from: State::ParentI3,
        to: State::ParentI3,
        recv_exchange: Some(ExchangeType::Informational),
        flags: SmfFlags::IKE_I_CLEAR.union(SmfFlags::MSG_R_CLEAR).union(SmfFlags::SEND),
        message_payloads: SK_ONLY,
        encrypted_payloads: ExpectedPayloads::of(
            PayloadSet::EMPTY,
            PayloadSet::N.union(PayloadSet::D).union(PayloadSet::CP),
        ),
        timeout: TimeoutEvent::Retain,
        handler: exchange::informational::process,
        ..BASE
    },
    Microcode {
        story: "I3: process INFORMATIONAL response",
        from: State::ParentI3,
        to: State::ParentI3,
        recv_exchange: Some(ExchangeType::Informational),
        flags: SmfFlags::IKE_I_CLEAR.union(SmfFlags::MSG_R_SET),
        message_payloads: SK_ONLY,
        encrypted_payloads: ExpectedPayloads::of(
            PayloadSet::EMPTY,
            PayloadSet::N.union(PayloadSet::D).union(PayloadSet::CP),
        ),
        timeout: TimeoutEvent::Retain,
        handler: exchange::informational::process,
        ..BASE
    },
    Microcode {
        story: "R2: process INFORMATIONAL request",
        from: State::ParentR2,
        to: State::ParentR2,
        recv_exchange: Some(ExchangeType::Informational),
        flags: SmfFlags::IKE_I_SET.union(SmfFlags::MSG_R_CLEAR).union(SmfFlags::SEND),
        message_payloads: SK_ONLY,
        encrypted_payloads: ExpectedPayloads::of(
            PayloadSet::EMPTY,
            PayloadSet::N.union(PayloadSet::D).union(PayloadSet::CP),
        ),
        timeout: TimeoutEvent::Retain,
        handler: exchange::informational::process,
        ..BASE
    },
    Microcode {
        story: "R2: process INFORMATIONAL response",
        from: State::ParentR2,
        to: State::ParentR2,
        recv_exchange: Some(ExchangeType::Informational),
        flags: SmfFlags::IKE_I_SET.union(SmfFlags::MSG_R_SET),
        message_payloads: SK_ONLY,
        encrypted_payloads: ExpectedPayloads::of(
            PayloadSet::EMPTY,
            PayloadSet::N.union(PayloadSet::D).union(PayloadSet::CP),
        ),
        timeout: TimeoutEvent::Retain,
        handler: exchange::informational::process,
        ..BASE
    },
    Microcode {
        story: "IKE_SA_DEL: process INFORMATIONAL",
        from: State::IkeSaDel,
        to: State::IkeSaDel,
        recv_exchange: Some(ExchangeType::Informational),
        message_payloads: SK_ONLY,
        encrypted_payloads: ExpectedPayloads::of(
            PayloadSet::EMPTY,
            PayloadSet::N.union(PayloadSet::D).union(PayloadSet::CP),
        ),
        timeout: TimeoutEvent::Retain,
        handler: exchange::informational::process,
        ..BASE
    },
];

/// The from-state index over [TRANSITIONS], built once at startup
#[derive(Debug, Default)]
pub struct TransitionIndex {
    by_state: HashMap<State, Vec<usize>>,
}

impl TransitionIndex {
    /// Build the index; row order within one state is table order
    pub fn new() -> Self {
        let mut by_state: HashMap<State, Vec<usize>> = HashMap::new();
        for (i, t) in TRANSITIONS.iter().enumerate() {
            by_state.entry(t.from).or_default().push(i);
        }
        Self { by_state }
    }

    /// Rows starting from the given state, in table order
    pub fn for_state(&self, state: State) -> &[usize] {
        self.by_state.get(&state).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The initiate row leaving the given start state, if one exists
    pub fn initiate_from(&self, state: State) -> Option<usize> {
        self.for_state(state)
            .iter()
            .copied()
            .find(|&i| TRANSITIONS[i].recv_exchange.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn inbound_rows_constrain_exchange_and_roles() {
        for t in TRANSITIONS {
            let Some(exchange) = t.recv_exchange else {
                // initiate-only rows must send and retransmit
                assert!(t.flags.contains(SmfFlags::SEND), "{}", t.story);
                assert_eq!(t.timeout, TimeoutEvent::Retransmit, "{}", t.story);
                continue;
            };
            // encrypted expectations imply an SK expectation
            if t.encrypted_payloads != ExpectedPayloads::none() {
                assert!(
                    t.message_payloads.required.contains(ikewire::params::PayloadType::Encrypted),
                    "{}",
                    t.story
                );
            }
            // only IKE_AUTH may be processed without SKEYSEED
            if t.flags.contains(SmfFlags::NO_SKEYSEED) {
                assert_eq!(exchange, ExchangeType::IkeAuth, "{}", t.story);
            }
            // a row cannot demand a flag both set and clear
            assert!(
                !(t.flags.contains(SmfFlags::IKE_I_SET) && t.flags.contains(SmfFlags::IKE_I_CLEAR)),
                "{}",
                t.story
            );
            assert!(
                !(t.flags.contains(SmfFlags::MSG_R_SET) && t.flags.contains(SmfFlags::MSG_R_CLEAR)),
                "{}",
                t.story
            );
        }
    }

    #[test]
    fn index_preserves_table_order() {
        let index = TransitionIndex::new();
        for state in State::iter() {
            let rows = index.for_state(state);
            assert!(rows.windows(2).all(|w| w[0] < w[1]), "{state}");
        }
    }

    #[test]
    fn initiate_rows_exist_for_start_states() {
        let index = TransitionIndex::new();
        for state in [
            State::ParentI0,
            State::CreateI0,
            State::RekeyIkeI0,
            State::RekeyChildI0,
        ] {
            assert!(index.initiate_from(state).is_some(), "{state}");
        }
        assert!(index.initiate_from(State::ParentR0).is_none());
    }
}
