//! Comparison of observed payloads against a transition's expectations
//!
//! The classifier is pure: it looks at a [PayloadSummary] and the decoded
//! notification chain and produces a structured mismatch report, mutating
//! nothing. The dispatcher keeps the "closest" report of all candidate
//! transitions for the eventual error log.

use std::fmt;

use itertools::Itertools;

use ikewire::params::NotifyError;
use ikewire::parser::{Chains, PayloadSummary};
use ikewire::set::PayloadSet;

/// What one transition expects a message (or its encrypted interior) to
/// carry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpectedPayloads {
    /// Payload types that must all appear
    pub required: PayloadSet,
    /// Payload types tolerated beyond the required ones
    pub optional: PayloadSet,
    /// A notification code that must appear among the N payloads
    pub notification: Option<NotifyError>,
}

impl ExpectedPayloads {
    /// Expect nothing in particular
    pub const fn none() -> Self {
        Self {
            required: PayloadSet::EMPTY,
            optional: PayloadSet::EMPTY,
            notification: None,
        }
    }

    /// Expect the given required and optional sets
    pub const fn of(required: PayloadSet, optional: PayloadSet) -> Self {
        Self {
            required,
            optional,
            notification: None,
        }
    }

    /// Additionally require a notification code
    pub const fn with_notification(self, notification: NotifyError) -> Self {
        Self {
            notification: Some(notification),
            ..self
        }
    }
}

/// The structured mismatch report of one classification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PayloadErrors {
    /// Required payloads that did not appear
    pub missing: PayloadSet,
    /// Payloads that appeared without being required, optional or
    /// allowed everywhere
    pub unexpected: PayloadSet,
    /// Non-repeatable payloads that appeared more than once
    pub excessive: PayloadSet,
    /// Required notification that did not appear
    pub missing_notification: Option<NotifyError>,
}

impl PayloadErrors {
    /// Whether anything mismatched
    pub fn bad(&self) -> bool {
        !self.missing.is_empty()
            || !self.unexpected.is_empty()
            || !self.excessive.is_empty()
            || self.missing_notification.is_some()
    }
}

impl fmt::Display for PayloadErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = vec![];
        if !self.missing.is_empty() {
            parts.push(format!("missing payloads: {}", self.missing));
        }
        if !self.unexpected.is_empty() {
            parts.push(format!("unexpected payloads: {}", self.unexpected));
        }
        if !self.excessive.is_empty() {
            parts.push(format!("excessive payloads: {}", self.excessive));
        }
        if let Some(n) = self.missing_notification {
            parts.push(format!("missing notification {n}"));
        }
        write!(f, "{}", parts.iter().join("; "))
    }
}

/// Compare what a chain walk saw against a transition's expectations
pub fn verify_payloads(
    chains: &Chains,
    summary: &PayloadSummary,
    expected: &ExpectedPayloads,
) -> PayloadErrors {
    // Convert SKF onto SK for the comparison, but only when it stands
    // alone: a fragmented message satisfies an SK expectation.
    let mut seen = summary.present;
    if seen.intersection(PayloadSet::SKF.union(PayloadSet::SK)) == PayloadSet::SKF {
        seen = seen.difference(PayloadSet::SKF).union(PayloadSet::SK);
    }

    let mut errors = PayloadErrors {
        excessive: summary.repeated.difference(PayloadSet::REPEATABLE),
        missing: expected.required.difference(seen),
        unexpected: seen
            .difference(expected.required)
            .difference(expected.optional)
            .difference(PayloadSet::EVERYWHERE),
        missing_notification: None,
    };

    if let Some(required) = expected.notification {
        if !chains.contains_notification(required.code()) {
            errors.missing_notification = Some(required);
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use ikewire::parser::decode_payloads;

    fn summary_of(present: PayloadSet, repeated: PayloadSet) -> PayloadSummary {
        PayloadSummary {
            parsed: true,
            present,
            repeated,
            n: None,
            data: vec![],
        }
    }

    #[test]
    fn missing_and_unexpected() {
        let expected = ExpectedPayloads::of(
            PayloadSet::SA.union(PayloadSet::KE).union(PayloadSet::NONCE),
            PayloadSet::CERTREQ,
        );
        let summary = summary_of(PayloadSet::SA | PayloadSet::TSI, PayloadSet::EMPTY);
        let errors = verify_payloads(&Chains::default(), &summary, &expected);
        assert!(errors.bad());
        assert_eq!(errors.missing, PayloadSet::KE | PayloadSet::NONCE);
        assert_eq!(errors.unexpected, PayloadSet::TSI);
        assert_eq!(errors.excessive, PayloadSet::EMPTY);
    }

    #[test]
    fn everywhere_payloads_tolerated() {
        let expected = ExpectedPayloads::of(PayloadSet::SA, PayloadSet::EMPTY);
        let summary = summary_of(
            PayloadSet::SA | PayloadSet::N | PayloadSet::V,
            PayloadSet::EMPTY,
        );
        let errors = verify_payloads(&Chains::default(), &summary, &expected);
        assert!(!errors.bad());
    }

    #[test]
    fn lone_skf_counts_as_sk() {
        let expected = ExpectedPayloads::of(PayloadSet::SK, PayloadSet::EMPTY);
        let summary = summary_of(PayloadSet::SKF, PayloadSet::EMPTY);
        let errors = verify_payloads(&Chains::default(), &summary, &expected);
        assert!(!errors.bad());
    }

    #[test]
    fn repeated_nonce_is_excessive() {
        let expected = ExpectedPayloads::of(PayloadSet::NONCE, PayloadSet::EMPTY);
        let summary = summary_of(PayloadSet::NONCE, PayloadSet::NONCE);
        let errors = verify_payloads(&Chains::default(), &summary, &expected);
        assert!(errors.bad());
        assert_eq!(errors.excessive, PayloadSet::NONCE);
    }

    #[test]
    fn required_notification_checked_in_chain() {
        let expected = ExpectedPayloads::of(PayloadSet::N, PayloadSet::EMPTY)
            .with_notification(NotifyError::AuthenticationFailed);

        // N(AUTHENTICATION_FAILED) as the only payload
        let body = vec![
            0x00, 0x00, 0x00, 0x08, // generic header
            0x00, 0x00, 0x00, 0x18, // notify: protocol 0, no SPI, type 24
        ];
        let mut chains = Chains::default();
        let summary = decode_payloads(&body, 41, &mut chains);
        let errors = verify_payloads(&chains, &summary, &expected);
        assert!(!errors.bad());

        // same message, different required notification
        let expected =
            ExpectedPayloads::of(PayloadSet::N, PayloadSet::EMPTY)
                .with_notification(NotifyError::InvalidSyntax);
        let errors = verify_payloads(&chains, &summary, &expected);
        assert_eq!(errors.missing_notification, Some(NotifyError::InvalidSyntax));
    }

    #[test]
    fn classifier_is_idempotent() {
        let expected = ExpectedPayloads::of(PayloadSet::SA, PayloadSet::KE);
        let summary = summary_of(PayloadSet::SA | PayloadSet::TSR, PayloadSet::EMPTY);
        let first = verify_payloads(&Chains::default(), &summary, &expected);
        let second = verify_payloads(&Chains::default(), &summary, &expected);
        assert_eq!(first, second);
    }
}
