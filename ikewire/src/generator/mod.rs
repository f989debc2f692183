//! Conversion of high-level payload structs into network-encoded bytes
//!
//! [message::MessageBuilder] assembles whole datagrams; the [payload]
//! module encodes the individual payload bodies it is fed.

mod message;
mod payload;

pub use message::MessageBuilder;
pub use payload::{
    encode_auth, encode_delete, encode_identity, encode_key_exchange, encode_notify,
    encode_security_association, encode_skf_body, encode_traffic_selectors,
};

use thiserror::Error;

/// Failure while encoding payloads into their network-level representation
#[derive(Debug, Error, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum GeneratorError {
    #[error("A message must carry fewer than 255 payloads")]
    TooManyPayloads,
    #[error("Payload body exceeds the 16-bit length field")]
    PayloadTooLarge,
    #[error("A proposal must carry fewer than 256 transforms")]
    TooManyTransforms,
}
