//! A/AAAA lookups over the tunnel, encoded with hickory-proto

use std::net::IpAddr;

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData};
use hickory_proto::ProtoError;
use thiserror::Error;

pub use hickory_proto::rr::RecordType;

#[derive(Debug, Error)]
pub enum DnsError {
    #[error("Invalid host name: {0}")]
    InvalidName(String),

    #[error("Malformed DNS message: {0}")]
    Malformed(#[from] ProtoError),

    #[error("DNS response truncated")]
    Truncated,

    #[error("DNS packet is not a response")]
    NotResponse,

    #[error("DNS server returned {0}")]
    ServerFailure(ResponseCode),
}

/// Encode a recursive query for `host`
pub fn build_query(host: &str, record: RecordType, id: u16) -> Result<Vec<u8>, DnsError> {
    let trimmed = host.trim();
    if trimmed.trim_end_matches('.').is_empty() {
        return Err(DnsError::InvalidName(host.to_string()));
    }
    let name = Name::from_ascii(trimmed).map_err(|_| DnsError::InvalidName(host.to_string()))?;

    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, record));

    Ok(message.to_vec()?)
}

/// Decode the addresses of type `record` from a reply to query `id`.
///
/// `None` means the datagram answers some other query and should be
/// skipped. NXDOMAIN yields an empty list.
pub fn parse_response(
    packet: &[u8],
    id: u16,
    record: RecordType,
) -> Result<Option<Vec<IpAddr>>, DnsError> {
    let message = Message::from_vec(packet)?;
    if message.id() != id {
        return Ok(None);
    }

    if message.message_type() != MessageType::Response {
        return Err(DnsError::NotResponse);
    }
    if message.truncated() {
        return Err(DnsError::Truncated);
    }
    match message.response_code() {
        ResponseCode::NoError => {}
        ResponseCode::NXDomain => return Ok(Some(Vec::new())),
        rcode => return Err(DnsError::ServerFailure(rcode)),
    }

    let mut addresses = Vec::new();
    for answer in message.answers() {
        // CNAMEs and other records are skipped; the server already chased them
        let addr = match (record, answer.data()) {
            (RecordType::A, RData::A(a)) => IpAddr::V4(a.0),
            (RecordType::AAAA, RData::AAAA(aaaa)) => IpAddr::V6(aaaa.0),
            _ => continue,
        };
        if !addresses.contains(&addr) {
            addresses.push(addr);
        }
    }

    Ok(Some(addresses))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::str::FromStr;

    use hickory_proto::rr::rdata::{A, AAAA, CNAME};
    use hickory_proto::rr::Record;

    /// Build the reply to `query` carrying `answers`
    pub(crate) fn response_for(query: &[u8], rcode: ResponseCode, answers: Vec<RData>) -> Vec<u8> {
        let query = Message::from_vec(query).unwrap();
        let name = query.queries()[0].name().clone();

        let mut message = Message::new();
        message
            .set_id(query.id())
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .set_recursion_available(true)
            .set_response_code(rcode);
        for q in query.queries() {
            message.add_query(q.clone());
        }
        for rdata in answers {
            message.add_answer(Record::from_rdata(name.clone(), 300, rdata));
        }
        message.to_vec().unwrap()
    }

    /// Address record data for `ip`
    pub(crate) fn address(ip: IpAddr) -> RData {
        match ip {
            IpAddr::V4(v4) => RData::A(A(v4)),
            IpAddr::V6(v6) => RData::AAAA(AAAA(v6)),
        }
    }

    #[test]
    fn test_build_query() {
        let query = build_query("example.com.", RecordType::A, 0x1234).unwrap();
        let message = Message::from_vec(&query).unwrap();

        assert_eq!(message.id(), 0x1234);
        assert_eq!(message.message_type(), MessageType::Query);
        assert!(message.recursion_desired());
        assert_eq!(message.queries().len(), 1);
        assert_eq!(message.queries()[0].query_type(), RecordType::A);
        assert_eq!(
            message.queries()[0].name(),
            &Name::from_str("example.com.").unwrap()
        );
    }

    #[test]
    fn test_build_query_rejects_bad_names() {
        assert!(matches!(
            build_query("", RecordType::A, 1),
            Err(DnsError::InvalidName(_))
        ));
        assert!(matches!(
            build_query(" . ", RecordType::A, 1),
            Err(DnsError::InvalidName(_))
        ));
        assert!(matches!(
            build_query(&"x".repeat(64), RecordType::AAAA, 1),
            Err(DnsError::InvalidName(_))
        ));
    }

    #[test]
    fn test_parse_answers_skipping_cname() {
        let query = build_query("www.example.com", RecordType::A, 7).unwrap();
        let response = response_for(
            &query,
            ResponseCode::NoError,
            vec![
                RData::CNAME(CNAME(Name::from_str("cdn.example.com.").unwrap())),
                address("93.184.216.34".parse().unwrap()),
                address("93.184.216.35".parse().unwrap()),
                address("93.184.216.34".parse().unwrap()),
            ],
        );

        let addrs = parse_response(&response, 7, RecordType::A).unwrap().unwrap();
        assert_eq!(
            addrs,
            vec![
                IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
                IpAddr::V4(Ipv4Addr::new(93, 184, 216, 35)),
            ]
        );
    }

    #[test]
    fn test_parse_aaaa_ignores_other_family() {
        let query = build_query("example.com", RecordType::AAAA, 9).unwrap();
        let v6: Ipv6Addr = "2606:2800:220:1::1".parse().unwrap();
        let response = response_for(
            &query,
            ResponseCode::NoError,
            vec![address("192.0.2.1".parse().unwrap()), address(IpAddr::V6(v6))],
        );

        let addrs = parse_response(&response, 9, RecordType::AAAA).unwrap().unwrap();
        assert_eq!(addrs, vec![IpAddr::V6(v6)]);
    }

    #[test]
    fn test_nxdomain_is_empty() {
        let query = build_query("missing.example", RecordType::A, 3).unwrap();
        let response = response_for(&query, ResponseCode::NXDomain, vec![]);
        assert_eq!(
            parse_response(&response, 3, RecordType::A).unwrap(),
            Some(Vec::<IpAddr>::new())
        );
    }

    #[test]
    fn test_reply_to_other_query_is_skipped() {
        let query = build_query("example.com", RecordType::A, 3).unwrap();
        let response = response_for(&query, ResponseCode::NoError, vec![]);
        assert!(parse_response(&response, 4, RecordType::A).unwrap().is_none());
    }

    #[test]
    fn test_parse_errors() {
        let query = build_query("example.com", RecordType::A, 3).unwrap();

        assert!(matches!(
            parse_response(&query, 3, RecordType::A),
            Err(DnsError::NotResponse)
        ));
        assert!(matches!(
            parse_response(&response_for(&query, ResponseCode::ServFail, vec![]), 3, RecordType::A),
            Err(DnsError::ServerFailure(ResponseCode::ServFail))
        ));
        assert!(matches!(
            parse_response(&[0, 3], 3, RecordType::A),
            Err(DnsError::Malformed(_))
        ));

        let mut truncated = Message::from_vec(&response_for(&query, ResponseCode::NoError, vec![])).unwrap();
        truncated.set_truncated(true);
        assert!(matches!(
            parse_response(&truncated.to_vec().unwrap(), 3, RecordType::A),
            Err(DnsError::Truncated)
        ));
    }
}
