//! The completion engine
//!
//! Whatever a handler returns lands here: the outcome is one of seven
//! dispositions, each with its own bookkeeping. Success advances the
//! state, transmits a recorded reply, updates the Message-ID counters and
//! schedules the transition's timeout; the failure modes range from a
//! silent drop to a notification plus teardown.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use ikewire::params::{ExchangeType, NotifyError};

use crate::dispatch::Demux;
use crate::md::MessageDigest;
use crate::msgid;
use crate::sa::{SerialNo, State, Suspended};
use crate::timer::{TimeoutEvent, TimerEvent};
use crate::transitions::{SmfFlags, TRANSITIONS};

/// How long a responder waits for the peer to finish an exchange before
/// discarding the SA
pub const MAXIMUM_RESPONDER_WAIT: Duration = Duration::from_secs(60);

/// Default interval until an established SA is replaced
pub const SA_REPLACE_DELAY: Duration = Duration::from_secs(3600);

/// Lower clamp on the liveness delay
pub const MIN_LIVENESS: Duration = Duration::from_secs(1);

/// What a transition handler decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Advance the state, send any recorded reply, schedule the timeout
    Ok,
    /// Awaiting asynchronous work; stash the message, do not advance
    Suspend,
    /// Silently drop the message; state unchanged
    Ignore,
    /// Delete the SA without a notification
    Drop,
    /// Log, then delete the SA
    Fatal,
    /// Log with diagnostic, preserve the SA for debugging, do not advance
    InternalError,
    /// The transition failed; if we are the responder, answer with the
    /// given notification
    Fail(Option<NotifyError>),
}

impl Demux {
    /// Route a handler outcome
    ///
    /// `sa` is the SA the transition ran against (handlers may have
    /// pointed `md.sa` at a newly created or child SA; callers pass that
    /// resolved serial). `md` is consumed: a suspension stores it inside
    /// the SA.
    pub(crate) fn complete_transition(
        &mut self,
        sa: Option<SerialNo>,
        md: Option<MessageDigest>,
        outcome: Outcome,
    ) {
        let from_state = sa
            .and_then(|serial| self.table.get(serial))
            .map(|sa| sa.state);
        debug!(
            "complete state transition from {} with {outcome:?}",
            from_state.map(|s| s.to_string()).unwrap_or_else(|| "no state".into()),
        );

        match outcome {
            Outcome::Suspend => {
                let Some(serial) = sa else {
                    warn!("cannot suspend a transition without a state");
                    return;
                };
                match md {
                    Some(md) => self.suspend_transition(serial, md),
                    // initiations have no inbound message; the offload
                    // ticket alone keeps the SA busy
                    None => debug!("suspending initiation of {serial}"),
                }
            }
            Outcome::Ignore => {}
            Outcome::Ok => match sa {
                None => debug!("transition succeeded but no state object remains"),
                Some(serial) => self.success_transition(serial, md),
            },
            Outcome::InternalError => {
                error!(
                    "state transition function for {} had internal error",
                    from_state.map(|s| s.to_string()).unwrap_or_default()
                );
            }
            Outcome::Drop => {
                if let Some(serial) = sa {
                    self.delete_sa_tree(serial);
                }
            }
            Outcome::Fatal => {
                if let Some(serial) = sa {
                    self.log_sa(serial, "encountered fatal error");
                    self.delete_sa_tree(serial);
                }
            }
            Outcome::Fail(notification) => {
                self.fail_transition(sa, md.as_ref(), notification);
            }
        }
    }

    /// Store the inbound message inside the SA for the duration of the
    /// asynchronous work
    pub(crate) fn suspend_transition(&mut self, serial: SerialNo, md: MessageDigest) {
        let transition = md.transition.unwrap_or_default();
        if let Some(sa) = self.table.get_mut(serial) {
            if sa.suspended.is_some() {
                warn!("SA {serial} already holds a suspended transition; dropping message");
                return;
            }
            debug!(
                "suspending transition '{}' of {serial}",
                TRANSITIONS[transition].story
            );
            sa.suspended = Some(Suspended { md, transition });
        }
    }

    fn fail_transition(
        &mut self,
        sa: Option<SerialNo>,
        md: Option<&MessageDigest>,
        notification: Option<NotifyError>,
    ) {
        if let Some(code) = notification {
            self.log_sa_opt(sa, &format!("transition failed: {code}"));
            // Only the responder sends a notification
            if md.is_some_and(|md| md.is_request()) {
                if let Some(md) = md {
                    match sa.and_then(|serial| self.table.ike_of(serial)) {
                        None => self.send_notification_response_from_md(md, code.code(), &[]),
                        Some(ike) => {
                            self.send_notification_response_from_sa(ike, md, code.code(), &[]);
                            if md.hdr.exchange == ExchangeType::IkeSaInit {
                                if let Some(serial) = sa {
                                    self.delete_sa_tree(serial);
                                }
                            } else if let Some(serial) = sa {
                                debug!("forcing {serial} to a discard event");
                                self.schedule_timeout(serial, TimeoutEvent::SoDiscard);
                            }
                        }
                    }
                }
            }
        } else {
            self.log_sa_opt(sa, "transition failed");
            // An unanswerable IKE_SA_INIT failure leaves no usable SA
            if md.is_some_and(|md| md.hdr.exchange == ExchangeType::IkeSaInit) {
                if let Some(serial) = sa {
                    self.delete_sa_tree(serial);
                }
            }
        }
    }

    /// Advance the state machine after a successful transition
    fn success_transition(&mut self, serial: SerialNo, md: Option<MessageDigest>) {
        let Some(transition) = md
            .as_ref()
            .and_then(|md| md.transition)
        else {
            debug!("successful transition of {serial} without a message");
            return;
        };
        let row = &TRANSITIONS[transition];
        let from_state = md
            .as_ref()
            .and_then(|md| md.from_state)
            .unwrap_or(row.from);

        if from_state != row.to {
            debug!("transition from state {from_state} to state {}", row.to);
        }

        // resolve the sending IKE SA before emancipation can change who
        // the parent is; the recorded reply lives on the old parent
        let send_from = self.table.ike_of(serial);

        // A processed response retires the answered request's
        // retransmission; the pending timer finds the slot empty and
        // does nothing. The generation stays put so timers armed by the
        // handler survive.
        if md.as_ref().is_some_and(|md| md.is_response()) {
            if let Some(ike) = send_from {
                if let Some(sa) = self.table.get_mut(ike) {
                    sa.retransmit = None;
                }
            }
        }

        if matches!(from_state, State::RekeyIkeR | State::RekeyIkeI) {
            self.update_msgid_counters(serial, md.as_ref());
            self.emancipate(serial, row.to);
        } else {
            if let Some(sa) = self.table.get_mut(serial) {
                sa.state = row.to;
            }
            self.update_msgid_counters(serial, md.as_ref());
        }

        self.log_progress(serial);

        // transmit the recorded reply
        if row.flags.contains(SmfFlags::SEND) {
            if let Some(ike) = send_from {
                self.send_recorded(ike);
                if let Some(md) = md.as_ref() {
                    if md.is_request() {
                        let msgid = md.hdr.message_id;
                        if let Some(sa) = self.table.get_mut(ike) {
                            sa.msgid.on_response_sent(msgid);
                        }
                    }
                }
            }
        }

        match row.timeout {
            TimeoutEvent::Retain => {}
            TimeoutEvent::Null => {
                debug!("transition '{}' has unspecified timeout event", row.story);
            }
            other => self.schedule_timeout(serial, other),
        }

        // liveness checks start once a child SA is established
        if let Some(sa) = self.table.get(serial) {
            if sa.state != from_state && sa.state.is_child_established() {
                if let Some(delay) = sa.connection.dpd_delay_ms {
                    let delay = Duration::from_millis(delay).max(MIN_LIVENESS);
                    let generation = sa.timer_generation;
                    debug!("dpd enabled, scheduling liveness checks for {serial}");
                    self.timers
                        .schedule(serial, generation, TimerEvent::Liveness, delay);
                }
            }
        }
    }

    /// Update the Message-ID counters of the owning IKE SA after a
    /// transition processed `md`
    pub(crate) fn update_msgid_counters(&mut self, serial: SerialNo, md: Option<&MessageDigest>) {
        let Some(ike) = self.table.ike_of(serial) else {
            debug!("current processor deleted the state, nothing to update");
            return;
        };
        if let Some(md) = md {
            let msgid = md.hdr.message_id;
            if let Some(sa) = self.table.get_mut(ike) {
                if md.is_response() {
                    sa.msgid.on_response_processed(msgid);
                } else {
                    sa.msgid.on_request_received(msgid);
                }
            }
        }

        // a freed window slot lets the next queued child send
        if let Some(sa) = self.table.get_mut(ike) {
            if let Some(next) = msgid::release_window_slot(sa) {
                let generation = self
                    .table
                    .get(next)
                    .map(|sa| sa.timer_generation)
                    .unwrap_or_default();
                self.timers
                    .schedule(next, generation, TimerEvent::SendNextIke, Duration::ZERO);
            }
        }
    }

    /// Turn a successfully rekeyed IKE-rekey child into the new IKE SA
    ///
    /// The child stops being a child, takes over the freshly negotiated
    /// SPIs, inherits the old parent's children and restarts its
    /// Message-ID counters.
    pub(crate) fn emancipate(&mut self, serial: SerialNo, next_state: State) {
        let Some(sa) = self.table.get(serial) else {
            return;
        };
        let Some(old_parent) = sa.parent else {
            warn!("cannot emancipate {serial}: not a child");
            return;
        };

        let children = self.table.children_of(old_parent);
        if let Some(sa) = self.table.get_mut(serial) {
            sa.parent = None;
            sa.msgid.restart();
            if let Some(spis) = sa.rekey_spis.take() {
                sa.spis = spis;
            }
            sa.state = next_state;
            sa.skeyseed_computed = true;
        }
        for child in children {
            if child == serial {
                continue;
            }
            if let Some(sa) = self.table.get_mut(child) {
                sa.parent = Some(serial);
            }
        }
        self.log_sa(serial, "emancipated to replace its IKE SA");
    }

    /// An IKE SA finished authenticating: retire whatever half-open
    /// timer it carried and arm its replacement timer
    pub(crate) fn mark_ike_established(&mut self, ike: SerialNo) {
        if let Some(sa) = self.table.get_mut(ike) {
            sa.retransmit = None;
            sa.timer_generation += 1;
        }
        self.schedule_timeout(ike, TimeoutEvent::SaReplace);
    }

    /// Schedule the lifecycle timeout named by a transition
    pub(crate) fn schedule_timeout(&mut self, serial: SerialNo, timeout: TimeoutEvent) {
        let Some(sa) = self.table.get_mut(serial) else {
            return;
        };
        sa.timer_generation += 1;
        let generation = sa.timer_generation;

        match timeout {
            TimeoutEvent::Retransmit => {
                let interval = sa.connection.retransmit_interval();
                sa.retransmit = Some(crate::sa::RetransmitState {
                    interval,
                    elapsed: Duration::ZERO,
                });
                debug!("scheduling retransmit of {serial} in {interval:?}");
                self.timers
                    .schedule(serial, generation, TimerEvent::Retransmit, interval);
            }
            TimeoutEvent::SaReplace => {
                self.timers
                    .schedule(serial, generation, TimerEvent::SaReplace, SA_REPLACE_DELAY);
            }
            TimeoutEvent::SoDiscard => {
                self.timers.schedule(
                    serial,
                    generation,
                    TimerEvent::SoDiscard,
                    MAXIMUM_RESPONDER_WAIT,
                );
            }
            TimeoutEvent::Retain | TimeoutEvent::Null => {}
        }
    }

    /// Transmit the recorded message of the given IKE SA (every fragment
    /// of it)
    pub(crate) fn send_recorded(&mut self, serial: SerialNo) {
        let Some(sa) = self.table.get(serial) else {
            return;
        };
        let dest = sa.remote;
        let packets = sa.recorded.clone();
        if packets.is_empty() {
            warn!("{serial} has no recorded message to transmit");
            return;
        }
        for packet in packets {
            self.push_packet(dest, packet);
        }
    }

    /// Delete an SA and, when it is an IKE SA, everything underneath it
    ///
    /// Timers die by generation mismatch; a suspended message and any
    /// outstanding worker ticket are discarded with the SA.
    pub(crate) fn delete_sa_tree(&mut self, serial: SerialNo) {
        for child in self.table.children_of(serial) {
            if self.table.remove(child).is_some() {
                debug!("deleted child SA {child} of {serial}");
            }
        }
        if let Some(sa) = self.table.remove(serial) {
            info!(
                serial = %serial,
                connection = %sa.connection.name,
                "deleted SA in state {}",
                sa.state
            );
        }
    }

    fn log_progress(&self, serial: SerialNo) {
        let Some(sa) = self.table.get(serial) else {
            return;
        };
        if sa.connection.opportunistic {
            debug!(serial = %serial, connection = %sa.connection.name, "reached {}", sa.state);
            return;
        }
        if sa.state.is_child_established() {
            let detail = sa
                .ts
                .as_ref()
                .map(|(ours, theirs)| {
                    format!(" [{} selectors] -> [{} selectors]", ours.len(), theirs.len())
                })
                .unwrap_or_default();
            info!(
                serial = %serial,
                connection = %sa.connection.name,
                "negotiated connection{detail}"
            );
        } else if sa.state.is_ike_established() {
            info!(serial = %serial, connection = %sa.connection.name, "IKE SA established");
        } else {
            debug!(serial = %serial, connection = %sa.connection.name, "reached {}", sa.state);
        }
    }

    pub(crate) fn log_sa(&self, serial: SerialNo, what: &str) {
        let connection = self
            .table
            .get(serial)
            .map(|sa| sa.connection.name.clone())
            .unwrap_or_default();
        warn!(serial = %serial, connection = %connection, "{what}");
    }

    fn log_sa_opt(&self, sa: Option<SerialNo>, what: &str) {
        match sa {
            Some(serial) => self.log_sa(serial, what),
            None => warn!("{what}"),
        }
    }
}
