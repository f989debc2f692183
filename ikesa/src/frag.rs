//! Reassembly of encrypted fragments (RFC 7383)
//!
//! Fragments arrive in any order and each one is individually protected;
//! the buffer stores the still-encrypted chunks until the set is complete
//! and the dispatcher decrypts them in fragment order.

use tracing::debug;

use ikewire::payload::SkfEnvelope;

/// Upper bound on the total-fragments field this host accepts
pub const MAX_FRAGMENTS: u16 = 16;

/// One stored fragment: the still-encrypted IV || ciphertext || ICV
#[derive(Debug, Clone)]
pub struct Fragment {
    /// The encrypted blob exactly as it arrived
    pub cipher: Vec<u8>,
}

/// Per-SA reassembly buffer for one fragmented inbound message
#[derive(Debug)]
pub struct FragmentBuffer {
    /// Total announced by the first accepted fragment
    pub total: u16,
    /// Number of distinct fragments stored so far
    pub count: u16,
    /// Inner next-payload type recorded off fragment number 1
    pub first_payload: u8,
    /// Slot per fragment number; index 0 is unused
    frags: Vec<Option<Fragment>>,
}

/// What [FragmentBuffer::check] decided about an arriving fragment
#[derive(Debug, PartialEq, Eq)]
pub enum FragmentCheck {
    /// Store the fragment
    Accept,
    /// Store the fragment after discarding everything collected so far
    /// (the peer restarted with a larger total)
    Restart,
    /// Drop the fragment
    Reject,
}

impl FragmentBuffer {
    /// Create an empty buffer sized for `total` fragments
    pub fn new(total: u16) -> Self {
        Self {
            total,
            count: 0,
            first_payload: 0,
            frags: vec![None; total as usize + 1],
        }
    }

    /// Validate an arriving fragment's metadata against RFC 7383 rules
    /// and the current buffer contents
    pub fn check(buffer: Option<&FragmentBuffer>, skf: &SkfEnvelope) -> FragmentCheck {
        // fragment number counts from 1, must not exceed the total, the
        // total is capped, and exactly fragment 1 carries the inner
        // next-payload type
        let metadata_ok = skf.number != 0
            && skf.number <= skf.total
            && skf.total <= MAX_FRAGMENTS
            && ((skf.number == 1) != (skf.first_payload == 0));
        if !metadata_ok {
            debug!("ignoring invalid encrypted fragment");
            return FragmentCheck::Reject;
        }

        let Some(buffer) = buffer else {
            return FragmentCheck::Accept;
        };

        if skf.total != buffer.total {
            // The only honest reason for a changed total is the peer
            // ratcheting its packet size down, which makes the total grow.
            return if skf.total > buffer.total {
                debug!("discarding saved fragments because this fragment has larger total");
                FragmentCheck::Restart
            } else {
                debug!("ignoring odd encrypted fragment (total shrank)");
                FragmentCheck::Reject
            };
        }

        if buffer.frags[skf.number as usize].is_some() {
            debug!("ignoring repeated encrypted fragment {}", skf.number);
            return FragmentCheck::Reject;
        }

        FragmentCheck::Accept
    }

    /// Store an accepted fragment; returns whether the set is complete
    pub fn collect(&mut self, skf: &SkfEnvelope) -> bool {
        if self.frags[skf.number as usize].is_some() {
            return self.count == self.total;
        }
        self.frags[skf.number as usize] = Some(Fragment {
            cipher: skf.data.clone(),
        });
        if skf.number == 1 {
            self.first_payload = skf.first_payload;
        }
        self.count += 1;
        self.count == self.total
    }

    /// Whether every fragment has arrived
    pub fn complete(&self) -> bool {
        self.count == self.total
    }

    /// The stored encrypted chunks in fragment order; `None` until complete
    pub fn in_order(&self) -> Option<Vec<&Fragment>> {
        self.frags[1..].iter().map(|f| f.as_ref()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skf(number: u16, total: u16, data: &[u8]) -> SkfEnvelope {
        SkfEnvelope {
            first_payload: if number == 1 { 35 } else { 0 },
            number,
            total,
            data: data.to_vec(),
        }
    }

    #[test]
    fn out_of_order_completion() {
        let mut buffer = FragmentBuffer::new(3);
        for (number, data) in [(2u16, b"bb"), (1, b"aa"), (3, b"cc")] {
            let fragment = skf(number, 3, data);
            assert_eq!(FragmentBuffer::check(Some(&buffer), &fragment), FragmentCheck::Accept);
            let complete = buffer.collect(&fragment);
            assert_eq!(complete, number == 3);
        }
        assert!(buffer.complete());
        assert_eq!(buffer.first_payload, 35);

        let chunks: Vec<_> = buffer
            .in_order()
            .unwrap_or_default()
            .iter()
            .map(|f| f.cipher.clone())
            .collect();
        assert_eq!(chunks, vec![b"aa".to_vec(), b"bb".to_vec(), b"cc".to_vec()]);
    }

    #[test]
    fn duplicate_is_idempotent() {
        let mut buffer = FragmentBuffer::new(2);
        let fragment = skf(1, 2, b"aa");
        assert!(!buffer.collect(&fragment));
        assert_eq!(
            FragmentBuffer::check(Some(&buffer), &fragment),
            FragmentCheck::Reject
        );
        // collecting anyway must not bump the count
        assert!(!buffer.collect(&fragment));
        assert_eq!(buffer.count, 1);
    }

    #[test]
    fn metadata_rules() {
        // number 0
        assert_eq!(FragmentBuffer::check(None, &skf(0, 2, b"")), FragmentCheck::Reject);
        // number above total
        assert_eq!(FragmentBuffer::check(None, &skf(3, 2, b"")), FragmentCheck::Reject);
        // total above cap
        assert_eq!(
            FragmentBuffer::check(None, &skf(1, MAX_FRAGMENTS + 1, b"")),
            FragmentCheck::Reject
        );
        // non-first fragment carrying an inner next-payload
        let bad = SkfEnvelope {
            first_payload: 35,
            number: 2,
            total: 2,
            data: vec![],
        };
        assert_eq!(FragmentBuffer::check(None, &bad), FragmentCheck::Reject);
        // first fragment carrying none
        let bad = SkfEnvelope {
            first_payload: 0,
            number: 1,
            total: 2,
            data: vec![],
        };
        assert_eq!(FragmentBuffer::check(None, &bad), FragmentCheck::Reject);
    }

    #[test]
    fn total_change_rules() {
        let mut buffer = FragmentBuffer::new(2);
        buffer.collect(&skf(1, 2, b"aa"));

        // larger total restarts collection
        assert_eq!(
            FragmentBuffer::check(Some(&buffer), &skf(2, 3, b"xx")),
            FragmentCheck::Restart
        );
        // smaller total is dropped
        assert_eq!(
            FragmentBuffer::check(Some(&buffer), &skf(1, 1, b"yy")),
            FragmentCheck::Reject
        );
    }
}
