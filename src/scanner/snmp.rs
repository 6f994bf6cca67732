//! A minimal SNMPv2c GetRequest codec, BER encoded.
use thiserror::Error;

/// sysDescr.0
pub const SYS_DESCR: &[u32] = &[1, 3, 6, 1, 2, 1, 1, 1, 0];

const VERSION_2C: i64 = 1;

const INTEGER: u8 = 0x02;
const OCTET_STRING: u8 = 0x04;
const NULL: u8 = 0x05;
const OBJECT_IDENTIFIER: u8 = 0x06;
const SEQUENCE: u8 = 0x30;
const GET_REQUEST: u8 = 0xa0;
const GET_RESPONSE: u8 = 0xa2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SnmpError {
    #[error("packet truncated")]
    Truncated,
    #[error("expected tag {expected:#04x}, found {found:#04x}")]
    UnexpectedTag { expected: u8, found: u8 },
    #[error("answer to request {0}, not ours")]
    RequestId(i64),
    #[error("agent reported error status {0}")]
    Status(i64),
}

fn encode_len(len: usize, out: &mut Vec<u8>) {
    if len < 0x80 {
        out.push(len as u8);
        return;
    }
    let bytes = len.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    out.push(0x80 | (bytes.len() - skip) as u8);
    out.extend_from_slice(&bytes[skip..]);
}

fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 4);
    out.push(tag);
    encode_len(content.len(), &mut out);
    out.extend_from_slice(content);
    out
}

fn integer(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    // Drop redundant sign bytes, keep at least one.
    let mut start = 0;
    while start < bytes.len() - 1 {
        let (b, next) = (bytes[start], bytes[start + 1]);
        if (b == 0x00 && next & 0x80 == 0) || (b == 0xff && next & 0x80 != 0) {
            start += 1;
        } else {
            break;
        }
    }
    tlv(INTEGER, &bytes[start..])
}

fn object_identifier(oid: &[u32]) -> Vec<u8> {
    let mut content = Vec::new();
    if let [first, second, rest @ ..] = oid {
        content.push((first * 40 + second) as u8);
        for &arc in rest {
            let mut groups = vec![(arc & 0x7f) as u8];
            let mut n = arc >> 7;
            while n > 0 {
                groups.push((n & 0x7f) as u8 | 0x80);
                n >>= 7;
            }
            content.extend(groups.iter().rev());
        }
    }
    tlv(OBJECT_IDENTIFIER, &content)
}

/// Encodes a v2c GetRequest for a single `oid`.
pub fn get_request(community: &str, request_id: i32, oid: &[u32]) -> Vec<u8> {
    let varbind = tlv(SEQUENCE, &[object_identifier(oid), tlv(NULL, &[])].concat());
    let pdu = [
        integer(i64::from(request_id)),
        integer(0),
        integer(0),
        tlv(SEQUENCE, &varbind),
    ]
    .concat();
    let message = [
        integer(VERSION_2C),
        tlv(OCTET_STRING, community.as_bytes()),
        tlv(GET_REQUEST, &pdu),
    ]
    .concat();

    tlv(SEQUENCE, &message)
}

/// Splits the first TLV off `buf`, returning tag, content and the rest.
fn read_tlv(buf: &[u8]) -> Result<(u8, &[u8], &[u8]), SnmpError> {
    let (&tag, buf) = buf.split_first().ok_or(SnmpError::Truncated)?;
    let (&first, mut buf) = buf.split_first().ok_or(SnmpError::Truncated)?;

    let len = if first & 0x80 == 0 {
        usize::from(first)
    } else {
        let count = usize::from(first & 0x7f);
        if count == 0 || count > std::mem::size_of::<usize>() || buf.len() < count {
            return Err(SnmpError::Truncated);
        }
        let (len_bytes, rest) = buf.split_at(count);
        buf = rest;
        len_bytes
            .iter()
            .fold(0usize, |acc, &b| (acc << 8) | usize::from(b))
    };

    if buf.len() < len {
        return Err(SnmpError::Truncated);
    }
    let (content, rest) = buf.split_at(len);
    Ok((tag, content, rest))
}

fn expect_tlv(buf: &[u8], expected: u8) -> Result<(&[u8], &[u8]), SnmpError> {
    let (found, content, rest) = read_tlv(buf)?;
    if found != expected {
        return Err(SnmpError::UnexpectedTag { expected, found });
    }
    Ok((content, rest))
}

fn read_integer(buf: &[u8]) -> Result<(i64, &[u8]), SnmpError> {
    let (content, rest) = expect_tlv(buf, INTEGER)?;
    if content.is_empty() || content.len() > 8 {
        return Err(SnmpError::Truncated);
    }
    let sign = if content[0] & 0x80 == 0 { 0 } else { -1 };
    let value = content
        .iter()
        .fold(sign, |acc: i64, &b| (acc << 8) | i64::from(b));
    Ok((value, rest))
}

/// Decodes a GetResponse to `request_id`, returning the first octet
/// string value bound in it.
pub fn parse_get_response(packet: &[u8], request_id: i32) -> Result<Option<String>, SnmpError> {
    let (message, _) = expect_tlv(packet, SEQUENCE)?;
    let (_version, message) = read_integer(message)?;
    let (_community, message) = expect_tlv(message, OCTET_STRING)?;
    let (pdu, _) = expect_tlv(message, GET_RESPONSE)?;

    let (id, pdu) = read_integer(pdu)?;
    if id != i64::from(request_id) {
        return Err(SnmpError::RequestId(id));
    }
    let (status, pdu) = read_integer(pdu)?;
    let (_index, pdu) = read_integer(pdu)?;
    if status != 0 {
        return Err(SnmpError::Status(status));
    }

    let (mut varbinds, _) = expect_tlv(pdu, SEQUENCE)?;
    while !varbinds.is_empty() {
        let (varbind, rest) = expect_tlv(varbinds, SEQUENCE)?;
        varbinds = rest;

        let (_oid, value) = expect_tlv(varbind, OBJECT_IDENTIFIER)?;
        let (tag, content, _) = read_tlv(value)?;
        if tag == OCTET_STRING {
            return Ok(Some(String::from_utf8_lossy(content).into_owned()));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// What an agent would answer to a sysDescr query.
    fn response(request_id: i32, status: i64, value: &[u8]) -> Vec<u8> {
        let varbind = tlv(
            SEQUENCE,
            &[object_identifier(SYS_DESCR), tlv(OCTET_STRING, value)].concat(),
        );
        let pdu = [
            integer(i64::from(request_id)),
            integer(status),
            integer(0),
            tlv(SEQUENCE, &varbind),
        ]
        .concat();
        tlv(
            SEQUENCE,
            &[
                integer(VERSION_2C),
                tlv(OCTET_STRING, b"public"),
                tlv(GET_RESPONSE, &pdu),
            ]
            .concat(),
        )
    }

    #[test]
    fn request_matches_reference_encoding() {
        let packet = get_request("public", 1234, SYS_DESCR);
        let expected = [
            0x30, 0x27, // message
            0x02, 0x01, 0x01, // version 2c
            0x04, 0x06, b'p', b'u', b'b', b'l', b'i', b'c', // community
            0xa0, 0x1a, // GetRequest
            0x02, 0x02, 0x04, 0xd2, // request id
            0x02, 0x01, 0x00, // error status
            0x02, 0x01, 0x00, // error index
            0x30, 0x0e, 0x30, 0x0c, // varbinds
            0x06, 0x08, 0x2b, 0x06, 0x01, 0x02, 0x01, 0x01, 0x01, 0x00, // sysDescr.0
            0x05, 0x00, // NULL
        ];
        assert_eq!(packet, expected);
    }

    #[test]
    fn integers_use_minimal_encoding() {
        assert_eq!(integer(0), [INTEGER, 1, 0]);
        assert_eq!(integer(128), [INTEGER, 2, 0x00, 0x80]);
        assert_eq!(integer(-1), [INTEGER, 1, 0xff]);
        assert_eq!(integer(-129), [INTEGER, 2, 0xff, 0x7f]);
    }

    #[test]
    fn large_oid_arcs_and_long_lengths() {
        assert_eq!(
            object_identifier(&[1, 3, 6, 1, 4, 1, 311]),
            [OBJECT_IDENTIFIER, 7, 0x2b, 6, 1, 4, 1, 0x82, 0x37]
        );

        let descr = "x".repeat(300);
        let packet = response(-7, 0, descr.as_bytes());
        assert_eq!(parse_get_response(&packet, -7), Ok(Some(descr)));
    }

    #[test]
    fn parses_sys_descr() {
        let packet = response(42, 0, b"Linux gw 5.10.0 #1 SMP armv7l");
        assert_eq!(
            parse_get_response(&packet, 42),
            Ok(Some("Linux gw 5.10.0 #1 SMP armv7l".to_owned()))
        );
    }

    #[test]
    fn rejects_foreign_and_failed_answers() {
        let packet = response(42, 0, b"whatever");
        assert_eq!(parse_get_response(&packet, 43), Err(SnmpError::RequestId(42)));

        let packet = response(42, 2, b"");
        assert_eq!(parse_get_response(&packet, 42), Err(SnmpError::Status(2)));

        for len in 0..packet.len() {
            assert!(parse_get_response(&packet[..len], 42).is_err());
        }
    }
}
