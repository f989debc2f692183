//! Bitsets over payload types
//!
//! State machines describe which payloads a message must or may carry as
//! sets of payload types. Since all assigned payload type values are below
//! 64, a set is a plain `u64` with one bit per wire value.

use std::fmt;
use std::ops::{BitAnd, BitOr, Not};

use strum::IntoEnumIterator;

use crate::params::PayloadType;

/// A set of [PayloadType] values
///
/// The constructors are `const fn` so expected-payload sets can be written
/// as constants inside static transition tables.
#[derive(Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PayloadSet(u64);

#[allow(missing_docs)]
impl PayloadSet {
    pub const EMPTY: PayloadSet = PayloadSet(0);

    pub const SA: PayloadSet = PayloadSet::of(PayloadType::SecurityAssociation);
    pub const KE: PayloadSet = PayloadSet::of(PayloadType::KeyExchange);
    pub const IDI: PayloadSet = PayloadSet::of(PayloadType::IdentificationInitiator);
    pub const IDR: PayloadSet = PayloadSet::of(PayloadType::IdentificationResponder);
    pub const CERT: PayloadSet = PayloadSet::of(PayloadType::Certificate);
    pub const CERTREQ: PayloadSet = PayloadSet::of(PayloadType::CertificateRequest);
    pub const AUTH: PayloadSet = PayloadSet::of(PayloadType::Authentication);
    pub const NONCE: PayloadSet = PayloadSet::of(PayloadType::Nonce);
    pub const N: PayloadSet = PayloadSet::of(PayloadType::Notify);
    pub const D: PayloadSet = PayloadSet::of(PayloadType::Delete);
    pub const V: PayloadSet = PayloadSet::of(PayloadType::VendorId);
    pub const TSI: PayloadSet = PayloadSet::of(PayloadType::TrafficSelectorInitiator);
    pub const TSR: PayloadSet = PayloadSet::of(PayloadType::TrafficSelectorResponder);
    pub const SK: PayloadSet = PayloadSet::of(PayloadType::Encrypted);
    pub const CP: PayloadSet = PayloadSet::of(PayloadType::Configuration);
    pub const SKF: PayloadSet = PayloadSet::of(PayloadType::EncryptedFragment);

    /// Payload types that may appear in any message without being listed
    /// in the expected sets
    pub const EVERYWHERE: PayloadSet = PayloadSet::N.union(PayloadSet::V);

    /// Payload types of which more than one instance may legally appear
    pub const REPEATABLE: PayloadSet = PayloadSet::N
        .union(PayloadSet::D)
        .union(PayloadSet::CP)
        .union(PayloadSet::V)
        .union(PayloadSet::CERT)
        .union(PayloadSet::CERTREQ);

    /// Set containing a single payload type
    pub const fn of(ty: PayloadType) -> PayloadSet {
        PayloadSet(1 << (ty as u8))
    }

    /// Union of two sets, usable in constant expressions
    pub const fn union(self, other: PayloadSet) -> PayloadSet {
        PayloadSet(self.0 | other.0)
    }

    /// Intersection of two sets, usable in constant expressions
    pub const fn intersection(self, other: PayloadSet) -> PayloadSet {
        PayloadSet(self.0 & other.0)
    }

    /// The elements of `self` that are not in `other`
    pub const fn difference(self, other: PayloadSet) -> PayloadSet {
        PayloadSet(self.0 & !other.0)
    }

    /// Whether no payload type is in the set
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether the given payload type is in the set
    pub const fn contains(self, ty: PayloadType) -> bool {
        self.0 & (1 << (ty as u8)) != 0
    }

    /// Add a payload type, returning whether it was already present
    pub fn insert(&mut self, ty: PayloadType) -> bool {
        let present = self.contains(ty);
        self.0 |= 1 << (ty as u8);
        present
    }
}

impl BitOr for PayloadSet {
    type Output = PayloadSet;

    fn bitor(self, rhs: PayloadSet) -> PayloadSet {
        self.union(rhs)
    }
}

impl BitAnd for PayloadSet {
    type Output = PayloadSet;

    fn bitand(self, rhs: PayloadSet) -> PayloadSet {
        self.intersection(rhs)
    }
}

impl Not for PayloadSet {
    type Output = PayloadSet;

    fn not(self) -> PayloadSet {
        PayloadSet(!self.0)
    }
}

impl fmt::Debug for PayloadSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PayloadSet({self})")
    }
}

impl fmt::Display for PayloadSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for ty in PayloadType::iter() {
            if self.contains(ty) && ty != PayloadType::NoNextPayload {
                if !first {
                    write!(f, "+")?;
                }
                write!(f, "{ty}")?;
                first = false;
            }
        }
        if first {
            write!(f, "none")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_operations() {
        let s = PayloadSet::SA | PayloadSet::KE | PayloadSet::NONCE;
        assert!(s.contains(PayloadType::SecurityAssociation));
        assert!(!s.contains(PayloadType::Notify));
        assert_eq!(s.difference(PayloadSet::KE), PayloadSet::SA | PayloadSet::NONCE);
        assert!(PayloadSet::EMPTY.is_empty());
        assert_eq!(s & PayloadSet::KE, PayloadSet::KE);
    }

    #[test]
    fn insert_reports_repeats() {
        let mut s = PayloadSet::EMPTY;
        assert!(!s.insert(PayloadType::Notify));
        assert!(s.insert(PayloadType::Notify));
    }

    #[test]
    fn display_names() {
        let s = PayloadSet::SA | PayloadSet::N;
        let shown = s.to_string();
        assert!(shown.contains("SecurityAssociation"));
        assert!(shown.contains("Notify"));
    }
}
