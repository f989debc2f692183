//! The next-payload chain walk
//!
//! [decode_payloads] turns one payload area (the cleartext area behind the
//! IKE header, or the plaintext recovered from an SK payload) into a
//! [Chains] collection plus a [PayloadSummary] describing what was seen.
//!
//! Unknown payload types are tolerated when their critical bit is clear
//! and fatal when it is set; in the latter case the summary carries the
//! offending type as one octet of notification data so a responder can
//! echo it back.

use log::warn;
use zerocopy::FromBytes;

use crate::header::GenericPayloadHeader;
use crate::params::{NotifyError, PayloadType};
use crate::parser::body;
use crate::payload::{Notification, PayloadBody, PayloadDigest, SkEnvelope, SkfEnvelope};
use crate::set::PayloadSet;

/// Cap on the number of payloads decoded out of a single message
pub const MAX_PAYLOAD_DIGESTS: usize = 40;

/// All payloads decoded from one message, in arrival order
///
/// Within one payload type the iteration order equals the order the
/// payloads appeared on the wire.
#[derive(Debug, Default, Clone)]
pub struct Chains {
    digests: Vec<PayloadDigest>,
}

impl Chains {
    /// The first payload of the given type, if any arrived
    pub fn first(&self, ty: PayloadType) -> Option<&PayloadDigest> {
        self.digests.iter().find(|pd| pd.ty == ty)
    }

    /// All payloads of the given type in arrival order
    pub fn iter(&self, ty: PayloadType) -> impl Iterator<Item = &PayloadDigest> {
        self.digests.iter().filter(move |pd| pd.ty == ty)
    }

    /// All decoded notifications in arrival order
    pub fn notifications(&self) -> impl Iterator<Item = &Notification> {
        self.digests.iter().filter_map(|pd| match &pd.body {
            PayloadBody::Notify(n) => Some(n),
            _ => None,
        })
    }

    /// Whether a notification with the given raw code arrived
    pub fn contains_notification(&self, code: u16) -> bool {
        self.notifications().any(|n| n.code == code)
    }

    /// The SK envelope, if the message carried one
    pub fn sk(&self) -> Option<&SkEnvelope> {
        self.digests.iter().find_map(|pd| match &pd.body {
            PayloadBody::Encrypted(sk) => Some(sk),
            _ => None,
        })
    }

    /// The SKF envelope, if the message carried one
    pub fn skf(&self) -> Option<&SkfEnvelope> {
        self.digests.iter().find_map(|pd| match &pd.body {
            PayloadBody::EncryptedFragment(skf) => Some(skf),
            _ => None,
        })
    }

    /// Number of decoded payloads across all types
    pub fn len(&self) -> usize {
        self.digests.len()
    }

    /// Whether nothing has been decoded yet
    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }
}

/// What one chain walk saw, in the shape expected-payload verification needs
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PayloadSummary {
    /// Whether the walk ran at all (summaries start out blank)
    pub parsed: bool,
    /// The payload types that appeared at least once
    pub present: PayloadSet,
    /// The payload types that appeared more than once
    pub repeated: PayloadSet,
    /// Error the walk ended with, if any
    pub n: Option<NotifyError>,
    /// Notification data belonging to `n`, echoed back verbatim
    pub data: Vec<u8>,
}

impl PayloadSummary {
    /// Whether the walk completed without error
    pub fn ok(&self) -> bool {
        self.parsed && self.n.is_none()
    }
}

/// Split one payload area into payloads, appending to `chains`
///
/// `first` is the raw next-payload discriminator naming the first payload
/// (from the IKE header, or from the SK payload's generic header when
/// walking recovered plaintext). The walk ends at the NONE discriminator,
/// after an SK/SKF payload (whose inner next-payload refers into the
/// ciphertext, not to another outer payload), or on the first error.
pub fn decode_payloads(buf: &[u8], first: u8, chains: &mut Chains) -> PayloadSummary {
    let mut summary = PayloadSummary {
        parsed: true,
        ..PayloadSummary::default()
    };

    let mut np = first;
    let mut offset = 0;

    while np != PayloadType::NoNextPayload as u8 {
        if chains.digests.len() >= MAX_PAYLOAD_DIGESTS {
            warn!("more than {MAX_PAYLOAD_DIGESTS} payloads in message; ignored");
            summary.n = Some(NotifyError::InvalidSyntax);
            break;
        }

        let Some(header) = GenericPayloadHeader::ref_from_prefix(&buf[offset..]) else {
            warn!("malformed payload in packet");
            summary.n = Some(NotifyError::InvalidSyntax);
            break;
        };
        let total = header.payload_length.get() as usize;
        if total < size_of::<GenericPayloadHeader>() || offset + total > buf.len() {
            warn!("payload length field points outside the message");
            summary.n = Some(NotifyError::InvalidSyntax);
            break;
        }
        let payload_buf = &buf[offset + size_of::<GenericPayloadHeader>()..offset + total];

        let Ok(ty) = PayloadType::try_from(np) else {
            // This payload is unknown to us. RFC 7296 2.5 says that if
            // the payload has the Critical Bit, we should be upset but
            // if it does not, we should just ignore it.
            if header.is_critical() {
                warn!("message contained an unknown critical payload type ({np})");
                summary.n = Some(NotifyError::UnsupportedCriticalPayload);
                summary.data = vec![np];
                break;
            }
            warn!("non-critical payload of unknown type ({np}) ignored");
            np = header.next_payload;
            offset += total;
            continue;
        };

        let body = match parse_body(ty, header.next_payload, payload_buf) {
            Ok(body) => body,
            Err(err) => {
                warn!("malformed {ty} payload in packet: {err}");
                summary.n = Some(NotifyError::InvalidSyntax);
                break;
            }
        };

        if summary.present.insert(ty) {
            summary.repeated.insert(ty);
        }
        chains.digests.push(PayloadDigest { ty, body });

        // The Encrypted payload must be the last one of the message and
        // its next-payload field names the first payload inside the
        // ciphertext, so the outer walk stops here.
        np = match ty {
            PayloadType::Encrypted | PayloadType::EncryptedFragment => {
                PayloadType::NoNextPayload as u8
            }
            _ => header.next_payload,
        };
        offset += total;
    }

    summary
}

fn parse_body(
    ty: PayloadType,
    next_payload: u8,
    buf: &[u8],
) -> Result<PayloadBody, crate::parser::ParserError> {
    Ok(match ty {
        PayloadType::SecurityAssociation => {
            PayloadBody::SecurityAssociation(body::parse_sa(buf)?)
        }
        PayloadType::KeyExchange => PayloadBody::KeyExchange(body::parse_ke(buf)?),
        PayloadType::IdentificationInitiator => PayloadBody::IdInitiator(body::parse_id(buf)?),
        PayloadType::IdentificationResponder => PayloadBody::IdResponder(body::parse_id(buf)?),
        PayloadType::Certificate => PayloadBody::Certificate(buf.to_vec()),
        PayloadType::CertificateRequest => PayloadBody::CertificateRequest(buf.to_vec()),
        PayloadType::Authentication => PayloadBody::Authentication(body::parse_auth(buf)?),
        PayloadType::Nonce => PayloadBody::Nonce(buf.to_vec()),
        PayloadType::Notify => PayloadBody::Notify(body::parse_notify(buf)?),
        PayloadType::Delete => PayloadBody::Delete(body::parse_delete(buf)?),
        PayloadType::VendorId => PayloadBody::VendorId(buf.to_vec()),
        PayloadType::TrafficSelectorInitiator => {
            PayloadBody::TrafficSelectorsInitiator(body::parse_traffic_selectors(buf)?)
        }
        PayloadType::TrafficSelectorResponder => {
            PayloadBody::TrafficSelectorsResponder(body::parse_traffic_selectors(buf)?)
        }
        PayloadType::Configuration => PayloadBody::Configuration(buf.to_vec()),
        PayloadType::Encrypted => PayloadBody::Encrypted(body::parse_sk(next_payload, buf)),
        PayloadType::EncryptedFragment => {
            PayloadBody::EncryptedFragment(body::parse_skf(next_payload, buf)?)
        }
        PayloadType::ExtensibleAuthentication | PayloadType::NoNextPayload => {
            PayloadBody::Generic(buf.to_vec())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generic(next: u8, critical: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![next, critical, 0, (4 + body.len()) as u8];
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn empty_chain() {
        let mut chains = Chains::default();
        let summary = decode_payloads(&[], 0, &mut chains);
        assert!(summary.ok());
        assert!(summary.present.is_empty());
        assert!(chains.is_empty());
    }

    #[test]
    fn nonce_then_vendor() {
        let mut buf = generic(43, 0, &[0x13; 16]); // Nonce, next=VendorId
        buf[0] = 43;
        let mut rest = generic(0, 0, &[0x42]); // VendorId, next=NONE
        buf.append(&mut rest);

        let mut chains = Chains::default();
        let summary = decode_payloads(&buf, 40, &mut chains);
        assert!(summary.ok());
        assert!(summary.present.contains(PayloadType::Nonce));
        assert!(summary.present.contains(PayloadType::VendorId));
        assert!(summary.repeated.is_empty());
        assert_eq!(chains.len(), 2);
    }

    #[test]
    fn unknown_critical_payload_aborts() {
        // unknown type 99 with critical bit, followed by nothing
        let buf = generic(0, 0x80, &[0xaa, 0xbb]);
        let mut chains = Chains::default();
        let summary = decode_payloads(&buf, 99, &mut chains);
        assert_eq!(summary.n, Some(NotifyError::UnsupportedCriticalPayload));
        assert_eq!(summary.data, vec![99]);
    }

    #[test]
    fn unknown_noncritical_payload_is_skipped() {
        let mut buf = generic(40, 0, &[0xaa, 0xbb]); // unknown 99 -> Nonce
        let mut rest = generic(0, 0, &[0x13; 16]);
        buf.append(&mut rest);

        let mut chains = Chains::default();
        let summary = decode_payloads(&buf, 99, &mut chains);
        assert!(summary.ok());
        assert!(summary.present.contains(PayloadType::Nonce));
        assert_eq!(chains.len(), 1);
    }

    #[test]
    fn repeated_notify_sets_bit() {
        let mut buf = generic(41, 0, &[0x00, 0x00, 0x40, 0x00]); // N -> N
        let mut rest = generic(0, 0, &[0x00, 0x00, 0x40, 0x00]);
        buf.append(&mut rest);

        let mut chains = Chains::default();
        let summary = decode_payloads(&buf, 41, &mut chains);
        assert!(summary.ok());
        assert!(summary.repeated.contains(PayloadType::Notify));
        assert_eq!(chains.notifications().count(), 2);
    }

    #[test]
    fn sk_terminates_outer_chain() {
        // SK payload whose generic next-payload names the first inner
        // payload; nothing after it is decoded
        let buf = generic(35, 0, &[0x01, 0x02, 0x03, 0x04]);
        let mut chains = Chains::default();
        let summary = decode_payloads(&buf, 46, &mut chains);
        assert!(summary.ok());
        assert!(summary.present.contains(PayloadType::Encrypted));
        #[allow(clippy::unwrap_used)]
        let sk = chains.sk().unwrap();
        assert_eq!(sk.first_payload, 35);
        assert_eq!(sk.data, vec![0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn truncated_payload_is_invalid_syntax() {
        let buf = vec![0x00, 0x00, 0x00, 0xff]; // claims 255 octets
        let mut chains = Chains::default();
        let summary = decode_payloads(&buf, 40, &mut chains);
        assert_eq!(summary.n, Some(NotifyError::InvalidSyntax));
    }
}
