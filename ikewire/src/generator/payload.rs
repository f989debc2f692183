//! Encoders for the individual payload bodies
//!
//! Each function returns the payload body without its generic header;
//! [super::MessageBuilder] prepends that when assembling the message.

use zerocopy::AsBytes;

use crate::generator::GeneratorError;
use crate::header::{
    AttributeHeader, AuthHeader, DeleteHeader, IdHeader, KeyExchangeHeader, NotifyHeader,
    ProposalHeader, SkfHeader, TrafficSelectorHeader, TrafficSelectorsHeader, TransformHeader,
    FLAG_ATTRIBUTE_FORMAT,
};
use crate::params::{AuthMethod, IdType, SecurityProtocol};
use crate::payload::{SecurityAssociation, TrafficSelector};

/// Attribute type value of the key length attribute, without the format flag
const ATTRIBUTE_KEY_LENGTH: u16 = 14;

/// Encode an N payload body
///
/// The notification data is emitted verbatim; when echoing a received
/// notification back its data size must be preserved exactly.
pub fn encode_notify(
    protocol: SecurityProtocol,
    spi: Option<&[u8]>,
    code: u16,
    data: &[u8],
) -> Vec<u8> {
    let header = NotifyHeader {
        protocol_id: protocol as u8,
        spi_size: spi.map(|s| s.len() as u8).unwrap_or(0),
        notify_message_type: code.into(),
    };
    let mut out = header.as_bytes().to_vec();
    if let Some(spi) = spi {
        out.extend_from_slice(spi);
    }
    out.extend_from_slice(data);
    out
}

/// Encode a KE payload body
pub fn encode_key_exchange(dh_group: u16, data: &[u8]) -> Vec<u8> {
    let header = KeyExchangeHeader {
        dh_group_num: dh_group.into(),
        reserved: 0.into(),
    };
    let mut out = header.as_bytes().to_vec();
    out.extend_from_slice(data);
    out
}

/// Encode an IDi/IDr payload body
pub fn encode_identity(id_type: IdType, data: &[u8]) -> Vec<u8> {
    let header = IdHeader {
        id_type: id_type as u8,
        reserved: [0; 3],
    };
    let mut out = header.as_bytes().to_vec();
    out.extend_from_slice(data);
    out
}

/// Encode an AUTH payload body
pub fn encode_auth(method: AuthMethod, data: &[u8]) -> Vec<u8> {
    let header = AuthHeader {
        auth_method: method as u8,
        reserved: [0; 3],
    };
    let mut out = header.as_bytes().to_vec();
    out.extend_from_slice(data);
    out
}

/// Encode a D payload body; all SPIs must share one size
pub fn encode_delete(protocol: SecurityProtocol, spis: &[Vec<u8>]) -> Vec<u8> {
    let header = DeleteHeader {
        protocol_id: protocol as u8,
        spi_size: spis.first().map(|s| s.len() as u8).unwrap_or(0),
        num_spis: (spis.len() as u16).into(),
    };
    let mut out = header.as_bytes().to_vec();
    for spi in spis {
        out.extend_from_slice(spi);
    }
    out
}

/// Encode a TSi/TSr payload body
pub fn encode_traffic_selectors(selectors: &[TrafficSelector]) -> Vec<u8> {
    let header = TrafficSelectorsHeader {
        num_ts: selectors.len() as u8,
        reserved: [0; 3],
    };
    let mut out = header.as_bytes().to_vec();
    for ts in selectors {
        let addr_len = match ts.start_addr {
            std::net::IpAddr::V4(_) => 4,
            std::net::IpAddr::V6(_) => 16,
        };
        let selector = TrafficSelectorHeader {
            ts_type: ts.ts_type as u8,
            ip_protocol_id: ts.protocol,
            selector_length: ((size_of::<TrafficSelectorHeader>() + 2 * addr_len) as u16).into(),
            start_port: ts.start_port.into(),
            end_port: ts.end_port.into(),
        };
        out.extend_from_slice(selector.as_bytes());
        match (ts.start_addr, ts.end_addr) {
            (std::net::IpAddr::V4(start), std::net::IpAddr::V4(end)) => {
                out.extend_from_slice(&start.octets());
                out.extend_from_slice(&end.octets());
            }
            (std::net::IpAddr::V6(start), std::net::IpAddr::V6(end)) => {
                out.extend_from_slice(&start.octets());
                out.extend_from_slice(&end.octets());
            }
            _ => {
                // mixed families cannot be encoded; emit the start twice
                // rather than a torn selector
                match ts.start_addr {
                    std::net::IpAddr::V4(start) => {
                        out.extend_from_slice(&start.octets());
                        out.extend_from_slice(&start.octets());
                    }
                    std::net::IpAddr::V6(start) => {
                        out.extend_from_slice(&start.octets());
                        out.extend_from_slice(&start.octets());
                    }
                }
            }
        }
    }
    out
}

/// Encode an SA payload body
pub fn encode_security_association(
    sa: &SecurityAssociation,
) -> Result<Vec<u8>, GeneratorError> {
    let mut out = vec![];
    for (i, proposal) in sa.proposals.iter().enumerate() {
        if proposal.transforms.len() > 255 {
            return Err(GeneratorError::TooManyTransforms);
        }

        let mut transforms = vec![];
        for (j, transform) in proposal.transforms.iter().enumerate() {
            let mut attributes = vec![];
            if let Some(key_length) = transform.key_length {
                let attr = AttributeHeader {
                    attribute_type: (FLAG_ATTRIBUTE_FORMAT | ATTRIBUTE_KEY_LENGTH).into(),
                    attribute_value: key_length.into(),
                };
                attributes.extend_from_slice(attr.as_bytes());
            }
            let header = TransformHeader {
                last_substruct: if j + 1 == proposal.transforms.len() { 0 } else { 3 },
                reserved: 0,
                transform_length: ((size_of::<TransformHeader>() + attributes.len()) as u16)
                    .into(),
                transform_type: transform.kind as u8,
                reserved2: 0,
                transform_id: transform.id.into(),
            };
            transforms.extend_from_slice(header.as_bytes());
            transforms.extend(attributes);
        }

        let total = size_of::<ProposalHeader>() + proposal.spi.len() + transforms.len();
        if total > u16::MAX as usize {
            return Err(GeneratorError::PayloadTooLarge);
        }
        let header = ProposalHeader {
            last_substruct: if i + 1 == sa.proposals.len() { 0 } else { 2 },
            reserved: 0,
            proposal_length: (total as u16).into(),
            proposal_num: proposal.number,
            protocol_id: proposal.protocol as u8,
            spi_size: proposal.spi.len() as u8,
            num_transforms: proposal.transforms.len() as u8,
        };
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&proposal.spi);
        out.extend(transforms);
    }
    Ok(out)
}

/// Encode the body of one SKF fragment (header plus encrypted blob),
/// for callers that split ciphertext themselves
pub fn encode_skf_body(number: u16, total: u16, blob: &[u8]) -> Vec<u8> {
    let header = SkfHeader {
        fragment_number: number.into(),
        total_fragments: total.into(),
    };
    let mut out = header.as_bytes().to_vec();
    out.extend_from_slice(blob);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{NotifyError, TransformType, TsType};
    use crate::parser::ParserError;
    use crate::payload::{Proposal, Transform};

    #[test]
    fn notify_data_is_verbatim() {
        let body = encode_notify(
            SecurityProtocol::Reserved,
            None,
            NotifyError::UnsupportedCriticalPayload.code(),
            &[99],
        );
        assert_eq!(body, vec![0x00, 0x00, 0x00, 0x01, 0x63]);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn sa_round_trip() {
        let sa = SecurityAssociation {
            proposals: vec![Proposal {
                number: 1,
                protocol: SecurityProtocol::InternetKeyExchange,
                spi: vec![],
                transforms: vec![
                    Transform {
                        kind: TransformType::EncryptionAlgorithm,
                        id: 20,
                        key_length: Some(256),
                    },
                    Transform {
                        kind: TransformType::PseudoRandomFunction,
                        id: 5,
                        key_length: None,
                    },
                ],
            }],
        };
        let body = encode_security_association(&sa).unwrap();
        let parsed = crate::parser::body::parse_sa(&body).unwrap();
        assert_eq!(sa, parsed);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn ts_round_trip() {
        let selectors = vec![TrafficSelector {
            ts_type: TsType::Ipv4AddrRange,
            protocol: 17,
            start_port: 0,
            end_port: 65535,
            start_addr: "192.0.2.0".parse().unwrap(),
            end_addr: "192.0.2.255".parse().unwrap(),
        }];
        let body = encode_traffic_selectors(&selectors);
        let parsed = crate::parser::body::parse_traffic_selectors(&body).unwrap();
        assert_eq!(selectors, parsed);
    }

    #[test]
    fn delete_ike_sa_is_empty() {
        let body = encode_delete(SecurityProtocol::Reserved, &[]);
        assert_eq!(body, vec![0x00, 0x00, 0x00, 0x00]);
        let parsed: Result<_, ParserError> = crate::parser::body::parse_delete(&body);
        assert!(parsed.is_ok());
    }
}
