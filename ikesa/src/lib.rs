//! # ikesa
//!
//! An IKEv2 (RFC 7296) control-plane demultiplexer and SA state machine.
//!
//! The [dispatch::Demux] is the heart: it resolves inbound messages to
//! security associations, selects a transition out of the static
//! [transitions::TRANSITIONS] table, drives decryption and fragment
//! reassembly, invokes the transition's handler and routes its outcome.
//! The [server] module wraps it all in a single-threaded tokio event loop
//! with a worker-pool seam for the expensive cryptography.
//!
//! Cryptographic primitives themselves are not implemented here; they
//! enter through the [crypto::CryptoBackend] trait.

#![warn(missing_docs, clippy::unwrap_used, clippy::expect_used)]

pub mod classify;
pub mod complete;
pub mod config;
pub mod cookie;
pub mod crypto;
pub mod dispatch;
pub mod exchange;
pub mod frag;
pub mod ident;
pub mod md;
pub mod msgid;
pub mod sa;
pub mod server;
pub mod timer;
pub mod transitions;

#[cfg(test)]
mod tests;

pub use dispatch::Demux;
pub use sa::SerialNo;
