//! Decoders for the individual payload bodies
//!
//! Each function receives the payload body without its generic header and
//! returns the typed struct from [crate::payload]. Structural integrity
//! is checked against the length information carried inside the body;
//! trailing octets beyond a substructure are an error, leading octets
//! short of a header are [ParserError::BufferTooSmall].

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use zerocopy::FromBytes;

use crate::header::{
    AttributeHeader, AuthHeader, DeleteHeader, IdHeader, KeyExchangeHeader, NotifyHeader,
    ProposalHeader, SkfHeader, TrafficSelectorHeader, TrafficSelectorsHeader, TransformHeader,
};
use crate::params::{
    AuthMethod, IdType, SecurityProtocol, TransformType, TsType,
};
use crate::parser::ParserError;
use crate::payload::{
    Authentication, DeletePayload, Identity, KeyExchange, Notification, Proposal,
    SecurityAssociation, SkEnvelope, SkfEnvelope, TrafficSelector, Transform,
};

/// Attribute type value of the key length attribute, without the format flag
const ATTRIBUTE_KEY_LENGTH: u16 = 14;

pub(crate) fn parse_sa(buf: &[u8]) -> Result<SecurityAssociation, ParserError> {
    let mut proposals = vec![];
    let mut offset = 0;

    while offset < buf.len() {
        let header =
            ProposalHeader::ref_from_prefix(&buf[offset..]).ok_or(ParserError::BufferTooSmall)?;
        let total = header.proposal_length.get() as usize;
        if total < size_of::<ProposalHeader>() || offset + total > buf.len() {
            return Err(ParserError::LengthOutOfBounds);
        }

        // Proposal numbering starts at 1 and increments by 1
        if proposals.is_empty() {
            if header.proposal_num != 1 {
                return Err(ParserError::InvalidProposalNumberingStart);
            }
        } else if header.proposal_num as usize != proposals.len() + 1 {
            return Err(ParserError::InvalidProposalNumbering);
        }

        let spi_len = header.spi_size as usize;
        let body_start = offset + size_of::<ProposalHeader>();
        if body_start + spi_len > offset + total {
            return Err(ParserError::LengthOutOfBounds);
        }
        let spi = buf[body_start..body_start + spi_len].to_vec();
        let transforms = parse_transforms(
            &buf[body_start + spi_len..offset + total],
            header.num_transforms,
        )?;

        proposals.push(Proposal {
            number: header.proposal_num,
            protocol: SecurityProtocol::try_from(header.protocol_id)?,
            spi,
            transforms,
        });

        if header.last_substruct == 0 {
            break;
        }
        offset += total;
    }

    Ok(SecurityAssociation { proposals })
}

fn parse_transforms(buf: &[u8], expected: u8) -> Result<Vec<Transform>, ParserError> {
    let mut transforms = vec![];
    let mut offset = 0;

    while offset < buf.len() {
        let header =
            TransformHeader::ref_from_prefix(&buf[offset..]).ok_or(ParserError::BufferTooSmall)?;
        let total = header.transform_length.get() as usize;
        if total < size_of::<TransformHeader>() || offset + total > buf.len() {
            return Err(ParserError::LengthOutOfBounds);
        }

        let mut key_length = None;
        let mut attr_offset = offset + size_of::<TransformHeader>();
        while attr_offset < offset + total {
            let attr = AttributeHeader::ref_from_prefix(&buf[attr_offset..])
                .ok_or(ParserError::BufferTooSmall)?;
            if attr.is_fixed_length() {
                if attr.attribute_type.get() & 0x7fff == ATTRIBUTE_KEY_LENGTH {
                    key_length = Some(attr.attribute_value.get());
                }
                attr_offset += size_of::<AttributeHeader>();
            } else {
                // TLV form: the value field is the length of the data
                attr_offset +=
                    size_of::<AttributeHeader>() + attr.attribute_value.get() as usize;
            }
        }

        transforms.push(Transform {
            kind: TransformType::try_from(header.transform_type)?,
            id: header.transform_id.get(),
            key_length,
        });

        if header.last_substruct == 0 {
            break;
        }
        offset += total;
    }

    if transforms.len() != expected as usize {
        log::warn!(
            "Proposal announced {expected} transforms but carried {}",
            transforms.len()
        );
    }
    Ok(transforms)
}

pub(crate) fn parse_ke(buf: &[u8]) -> Result<KeyExchange, ParserError> {
    let header = KeyExchangeHeader::ref_from_prefix(buf).ok_or(ParserError::BufferTooSmall)?;
    Ok(KeyExchange {
        dh_group: header.dh_group_num.get(),
        data: buf[size_of::<KeyExchangeHeader>()..].to_vec(),
    })
}

pub(crate) fn parse_notify(buf: &[u8]) -> Result<Notification, ParserError> {
    let header = NotifyHeader::ref_from_prefix(buf).ok_or(ParserError::BufferTooSmall)?;
    let spi_size = header.spi_size as usize;
    let protocol = SecurityProtocol::try_from(header.protocol_id)?;

    if spi_size > 0 && protocol == SecurityProtocol::InternetKeyExchange {
        // It is not legal to have both an SPI and use IKE
        return Err(ParserError::ProtocolViolation);
    } else if spi_size == 0 && protocol != SecurityProtocol::Reserved {
        // If the SPI is not sent, the protocol ID must be 0
        return Err(ParserError::ProtocolViolation);
    }

    if size_of::<NotifyHeader>() + spi_size > buf.len() {
        return Err(ParserError::LengthOutOfBounds);
    }
    let spi = (spi_size > 0)
        .then(|| buf[size_of::<NotifyHeader>()..size_of::<NotifyHeader>() + spi_size].to_vec());

    Ok(Notification {
        protocol,
        spi,
        code: header.notify_message_type.get(),
        data: buf[size_of::<NotifyHeader>() + spi_size..].to_vec(),
    })
}

pub(crate) fn parse_delete(buf: &[u8]) -> Result<DeletePayload, ParserError> {
    let header = DeleteHeader::ref_from_prefix(buf).ok_or(ParserError::BufferTooSmall)?;
    let spi_size = header.spi_size as usize;
    let count = header.num_spis.get() as usize;
    let body = &buf[size_of::<DeleteHeader>()..];
    if body.len() < spi_size * count {
        return Err(ParserError::LengthOutOfBounds);
    }

    let spis = (0..count)
        .map(|i| body[i * spi_size..(i + 1) * spi_size].to_vec())
        .collect();
    Ok(DeletePayload {
        protocol: SecurityProtocol::try_from(header.protocol_id)?,
        spis,
    })
}

pub(crate) fn parse_id(buf: &[u8]) -> Result<Identity, ParserError> {
    let header = IdHeader::ref_from_prefix(buf).ok_or(ParserError::BufferTooSmall)?;
    Ok(Identity {
        id_type: IdType::try_from(header.id_type)?,
        data: buf[size_of::<IdHeader>()..].to_vec(),
    })
}

pub(crate) fn parse_auth(buf: &[u8]) -> Result<Authentication, ParserError> {
    let header = AuthHeader::ref_from_prefix(buf).ok_or(ParserError::BufferTooSmall)?;
    Ok(Authentication {
        method: AuthMethod::try_from(header.auth_method)?,
        data: buf[size_of::<AuthHeader>()..].to_vec(),
    })
}

pub(crate) fn parse_traffic_selectors(buf: &[u8]) -> Result<Vec<TrafficSelector>, ParserError> {
    let header =
        TrafficSelectorsHeader::ref_from_prefix(buf).ok_or(ParserError::BufferTooSmall)?;
    let mut selectors = vec![];
    let mut offset = size_of::<TrafficSelectorsHeader>();

    for _ in 0..header.num_ts {
        let ts = TrafficSelectorHeader::ref_from_prefix(&buf[offset..])
            .ok_or(ParserError::BufferTooSmall)?;
        let total = ts.selector_length.get() as usize;
        if total < size_of::<TrafficSelectorHeader>() || offset + total > buf.len() {
            return Err(ParserError::LengthOutOfBounds);
        }
        let ts_type = TsType::try_from(ts.ts_type)?;
        let addrs = &buf[offset + size_of::<TrafficSelectorHeader>()..offset + total];
        let (start_addr, end_addr) = parse_address_range(ts_type, addrs)?;

        selectors.push(TrafficSelector {
            ts_type,
            protocol: ts.ip_protocol_id,
            start_port: ts.start_port.get(),
            end_port: ts.end_port.get(),
            start_addr,
            end_addr,
        });
        offset += total;
    }

    Ok(selectors)
}

fn parse_address_range(ts_type: TsType, buf: &[u8]) -> Result<(IpAddr, IpAddr), ParserError> {
    match ts_type {
        TsType::Ipv4AddrRange => {
            let octets: &[u8; 8] = buf.try_into().map_err(|_| ParserError::LengthOutOfBounds)?;
            let start: [u8; 4] = octets[..4].try_into().unwrap_or_default();
            let end: [u8; 4] = octets[4..].try_into().unwrap_or_default();
            Ok((
                IpAddr::V4(Ipv4Addr::from(start)),
                IpAddr::V4(Ipv4Addr::from(end)),
            ))
        }
        TsType::Ipv6AddrRange => {
            let octets: &[u8; 32] = buf.try_into().map_err(|_| ParserError::LengthOutOfBounds)?;
            let start: [u8; 16] = octets[..16].try_into().unwrap_or_default();
            let end: [u8; 16] = octets[16..].try_into().unwrap_or_default();
            Ok((
                IpAddr::V6(Ipv6Addr::from(start)),
                IpAddr::V6(Ipv6Addr::from(end)),
            ))
        }
    }
}

pub(crate) fn parse_sk(first_payload: u8, buf: &[u8]) -> SkEnvelope {
    SkEnvelope {
        first_payload,
        data: buf.to_vec(),
    }
}

pub(crate) fn parse_skf(first_payload: u8, buf: &[u8]) -> Result<SkfEnvelope, ParserError> {
    let header = SkfHeader::ref_from_prefix(buf).ok_or(ParserError::BufferTooSmall)?;
    Ok(SkfEnvelope {
        first_payload,
        number: header.fragment_number.get(),
        total: header.total_fragments.get(),
        data: buf[size_of::<SkfHeader>()..].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn parse_notify_with_data() {
        let buff = vec![
            0x00, // protocol: none
            0x00, // SPI size
            0x00, 0x01, // type: UNSUPPORTED_CRITICAL_PAYLOAD
            0x63, // data: offending payload type 99
        ];
        let n = parse_notify(&buff).unwrap();
        assert_eq!(n.code, 1);
        assert_eq!(n.data, vec![0x63]);
        assert_eq!(n.spi, None);
    }

    #[test]
    fn reject_notify_spi_for_ike() {
        let buff = vec![
            0x01, // protocol: IKE
            0x04, // SPI size
            0x00, 0x0e, // type
            0xaa, 0xbb, 0xcc, 0xdd, // SPI
        ];
        assert_eq!(parse_notify(&buff), Err(ParserError::ProtocolViolation));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn parse_sa_single_proposal() {
        let buff = vec![
            0x00, 0x00, 0x00, 0x14, // proposal header: last, length 20
            0x01, 0x01, 0x00, 0x01, // num 1, IKE, no SPI, 1 transform
            0x00, 0x00, 0x00, 0x0c, // transform header: last, length 12
            0x01, 0x00, 0x00, 0x14, // encryption, AES-GCM-16
            0x80, 0x0e, 0x01, 0x00, // key length attribute: 256
        ];
        let sa = parse_sa(&buff).unwrap();
        assert_eq!(sa.proposals.len(), 1);
        let prop = &sa.proposals[0];
        assert_eq!(prop.protocol, SecurityProtocol::InternetKeyExchange);
        assert_eq!(prop.transforms.len(), 1);
        assert_eq!(prop.transforms[0].id, 20);
        assert_eq!(prop.transforms[0].key_length, Some(256));
    }

    #[test]
    fn reject_sa_bad_numbering() {
        let buff = vec![
            0x00, 0x00, 0x00, 0x08, // proposal header: last, length 8
            0x02, 0x01, 0x00, 0x00, // num 2 -- must start at 1
        ];
        assert_eq!(
            parse_sa(&buff),
            Err(ParserError::InvalidProposalNumberingStart)
        );
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn parse_ts_v4_range() {
        let buff = vec![
            0x01, 0x00, 0x00, 0x00, // 1 selector
            0x07, 0x06, 0x00, 0x10, // IPv4, TCP, length 16
            0x00, 0x00, 0x01, 0xf4, // ports 0..500
            0x0a, 0x00, 0x00, 0x01, // 10.0.0.1
            0x0a, 0x00, 0x00, 0xff, // 10.0.0.255
        ];
        let ts = parse_traffic_selectors(&buff).unwrap();
        assert_eq!(ts.len(), 1);
        assert_eq!(ts[0].protocol, 6);
        assert_eq!(ts[0].end_port, 500);
        assert_eq!(ts[0].start_addr, "10.0.0.1".parse::<IpAddr>().unwrap());
    }
}
