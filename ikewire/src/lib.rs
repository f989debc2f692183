//! # ikewire
//!
//! Wire-level definitions, parser and generator for IKEv2 (RFC 7296)
//! including the encrypted-fragment payload of RFC 7383.
//!
//! The crate is split the same way the protocol is: [header] holds the
//! fixed network structs, [params] the IANA-registered parameter values,
//! [payload] the typed payload bodies, [parser] the byte-to-struct
//! direction and [generator] the struct-to-byte direction. [set] carries
//! the payload-type bitsets used by state machines to describe which
//! payloads a message may carry.

#![warn(missing_docs, clippy::unwrap_used, clippy::expect_used)]

pub mod header;
pub mod params;
pub mod parser;
pub mod payload;
pub mod set;

pub mod generator;

pub use zerocopy;

/// Constant value of the version field in IKEv2 headers, as
/// <major>.<minor> in 4 bits each, where <major> is 2 and <minor> is 0.
pub const IKE_V2_VERSION_VALUE: u8 = 0b0010_0000;

/// Size in octets of the fixed IKE header
pub const IKE_HEADER_SIZE: usize = 28;

/// Size in octets of an IKE SPI ("cookie" in older documents)
pub const IKE_SPI_SIZE: usize = 8;
