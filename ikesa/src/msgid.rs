//! Message-ID sequencing
//!
//! IKEv2 message IDs are plain sequence numbers: requests carry the next
//! unused ID, responses echo the request's ID, and retransmission is
//! entirely the requester's burden. The counters here are the whole
//! replay story; nothing about the message ID enters the cryptography.

use tracing::{debug, trace};

use crate::sa::{Sa, SerialNo};

/// Per-IKE-SA message-ID counters
///
/// `next_use`/`last_acked` sequence the requests this host sends;
/// `last_received`/`last_replied` sequence the requests the peer sends.
/// The `Option`s start out `None` meaning "nothing seen yet".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsgidCounters {
    /// Next Message-ID to use for a fresh outbound request
    pub next_use: u32,
    /// Highest Message-ID whose response we have processed
    pub last_acked: Option<u32>,
    /// Highest inbound request Message-ID seen
    pub last_received: Option<u32>,
    /// Highest inbound request Message-ID we have answered
    pub last_replied: Option<u32>,
}

impl MsgidCounters {
    /// Number of requests currently in flight
    pub fn unacknowledged(&self) -> u32 {
        match self.last_acked {
            None => self.next_use,
            Some(acked) => self.next_use - acked - 1,
        }
    }

    /// Whether an inbound response should be dropped as an old duplicate
    pub fn response_is_old(&self, msgid: u32) -> bool {
        self.last_acked.is_some_and(|acked| msgid <= acked)
    }

    /// Whether an inbound response answers a request never sent
    pub fn response_is_unasked(&self, msgid: u32) -> bool {
        msgid >= self.next_use
    }

    /// Record a sent request
    pub fn on_request_sent(&mut self) {
        self.next_use += 1;
    }

    /// Record a processed response
    pub fn on_response_processed(&mut self, msgid: u32) {
        match self.last_acked {
            None => self.last_acked = Some(msgid),
            Some(acked) if msgid > acked => self.last_acked = Some(msgid),
            Some(_) => {}
        }
    }

    /// Record a processed inbound request
    pub fn on_request_received(&mut self, msgid: u32) {
        match self.last_received {
            None => self.last_received = Some(msgid),
            Some(received) if msgid > received => self.last_received = Some(msgid),
            Some(_) => {}
        }
    }

    /// Record a sent response
    pub fn on_response_sent(&mut self, msgid: u32) {
        match self.last_replied {
            None => self.last_replied = Some(msgid),
            Some(replied) if msgid > replied => self.last_replied = Some(msgid),
            Some(_) => {}
        }
    }

    /// Reset everything, used when an initiator restarts IKE_SA_INIT
    /// after a COOKIE or INVALID_KE_PAYLOAD round trip
    pub fn restart(&mut self) {
        *self = MsgidCounters::default();
    }
}

/// What the retransmit check decided about an inbound request
#[derive(Debug, PartialEq, Eq)]
pub enum RetransmitDisposition {
    /// Fresh request, process it
    Fresh,
    /// Old or in-progress duplicate, drop silently
    Drop,
    /// Duplicate of the last answered request: re-send the recorded reply
    Replay,
}

/// Classify an inbound request against the responder-side counters
///
/// `child_working` is whether some state-machine instance is already
/// processing this message ID; `first_fragment` is whether the duplicate
/// arrived as SKF fragment number 1 (or unfragmented) — only that one
/// triggers a replay, later fragments of a duplicate are dropped.
pub fn classify_request(
    ike: &Sa,
    msgid: u32,
    first_fragment: bool,
    child_working: bool,
) -> RetransmitDisposition {
    let Some(last_received) = ike.msgid.last_received else {
        return RetransmitDisposition::Fresh;
    };

    if msgid < last_received {
        debug!("received too old retransmit: {msgid} < {last_received}");
        return RetransmitDisposition::Drop;
    }
    if msgid > last_received {
        return RetransmitDisposition::Fresh;
    }

    // Same ID as the newest request seen but no answer recorded yet:
    // drop while another instance works on it, otherwise process the
    // message after all.
    if ike.msgid.last_replied != Some(last_received) {
        if child_working {
            debug!(
                "cannot retransmit response for message ID {msgid}, last replied {:?}; \
                 another instance is working on it",
                ike.msgid.last_replied
            );
            return RetransmitDisposition::Drop;
        }
        return RetransmitDisposition::Fresh;
    }

    if ike.recorded.is_empty() {
        debug!("retransmission for message ID {msgid} but no stored packet to retransmit");
        return RetransmitDisposition::Drop;
    }

    if first_fragment {
        trace!("retransmitting response for message ID {msgid}");
        RetransmitDisposition::Replay
    } else {
        trace!("ignoring retransmit of non-first fragment for message ID {msgid}");
        RetransmitDisposition::Drop
    }
}

/// Pop one waiter off the IKE SA's send-next queue if the window has room
///
/// Returns the serial that may now send, to be posted as an event by the
/// caller.
pub fn release_window_slot(ike: &mut Sa) -> Option<SerialNo> {
    if ike.msgid.unacknowledged() < ike.window {
        let next = ike.send_next.pop_front();
        if let Some(serial) = next {
            debug!(
                "{serial} may send next using parent {}, next message id {}",
                ike.serial, ike.msgid.next_use
            );
        }
        next
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_arithmetic() {
        let mut counters = MsgidCounters::default();
        assert_eq!(counters.unacknowledged(), 0);

        counters.on_request_sent();
        assert_eq!(counters.next_use, 1);
        assert_eq!(counters.unacknowledged(), 1);

        counters.on_response_processed(0);
        assert_eq!(counters.last_acked, Some(0));
        assert_eq!(counters.unacknowledged(), 0);

        counters.on_request_sent();
        counters.on_response_processed(1);
        assert_eq!(counters.unacknowledged(), 0);
    }

    #[test]
    fn response_replay_checks() {
        let counters = MsgidCounters {
            next_use: 6,
            last_acked: Some(5),
            ..MsgidCounters::default()
        };
        assert!(counters.response_is_old(3));
        assert!(counters.response_is_old(5));
        assert!(!counters.response_is_old(6));
        assert!(counters.response_is_unasked(6));
        assert!(!counters.response_is_unasked(5));
    }

    #[test]
    fn lower_ids_never_regress_counters() {
        let mut counters = MsgidCounters::default();
        counters.on_request_received(4);
        counters.on_request_received(2);
        assert_eq!(counters.last_received, Some(4));

        counters.on_response_sent(4);
        counters.on_response_sent(1);
        assert_eq!(counters.last_replied, Some(4));
    }

    #[test]
    fn restart_clears_everything() {
        let mut counters = MsgidCounters {
            next_use: 3,
            last_acked: Some(2),
            last_received: Some(1),
            last_replied: Some(1),
        };
        counters.restart();
        assert_eq!(counters, MsgidCounters::default());
    }
}
