//! Minimal DNS message reader (RFC 1035) for correlating names with
//! resolved addresses. Only the question name and A/AAAA answers matter.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub const DNS_PORT: u16 = 53;

const HEADER_LEN: usize = 12;
const QR_FLAG: u16 = 0x8000;
const TYPE_A: u16 = 1;
const TYPE_AAAA: u16 = 28;
const MAX_POINTER_JUMPS: usize = 10;
const MAX_NAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DnsMessage {
    pub is_response: bool,
    /// Name of the first question, dotted, without a trailing dot.
    pub query_name: String,
    pub answer_ips: Vec<IpAddr>,
}

/// Parse a DNS message. `None` when the header, questions or answer
/// records are malformed.
pub fn parse(data: &[u8]) -> Option<DnsMessage> {
    if data.len() < HEADER_LEN {
        return None;
    }
    let flags = u16::from_be_bytes([data[2], data[3]]);
    let qd_count = u16::from_be_bytes([data[4], data[5]]);
    let an_count = u16::from_be_bytes([data[6], data[7]]);

    let mut message = DnsMessage {
        is_response: flags & QR_FLAG != 0,
        ..Default::default()
    };

    let mut offset = HEADER_LEN;
    for i in 0..qd_count {
        let name = read_name(data, &mut offset)?;
        // QTYPE + QCLASS
        if offset + 4 > data.len() {
            return None;
        }
        offset += 4;
        if i == 0 {
            message.query_name = name;
        }
    }

    for _ in 0..an_count {
        read_name(data, &mut offset)?;
        // TYPE(2) CLASS(2) TTL(4) RDLENGTH(2)
        if offset + 10 > data.len() {
            return None;
        }
        let rtype = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let rdlength = u16::from_be_bytes([data[offset + 8], data[offset + 9]]) as usize;
        offset += 10;
        let rdata = data.get(offset..offset + rdlength)?;
        offset += rdlength;

        match (rtype, rdata.len()) {
            (TYPE_A, 4) => {
                let octets: [u8; 4] = rdata.try_into().ok()?;
                message.answer_ips.push(IpAddr::V4(Ipv4Addr::from(octets)));
            }
            (TYPE_AAAA, 16) => {
                let octets: [u8; 16] = rdata.try_into().ok()?;
                message.answer_ips.push(IpAddr::V6(Ipv6Addr::from(octets)));
            }
            _ => {}
        }
    }

    Some(message)
}

/// Read a possibly compressed name starting at `offset`, advancing it past
/// the name as it appears in place.
fn read_name(data: &[u8], offset: &mut usize) -> Option<String> {
    let mut name = String::new();
    let mut pos = *offset;
    let mut resume_at = None;
    let mut jumps = 0;

    loop {
        let len = *data.get(pos)? as usize;

        if len == 0 {
            pos += 1;
            break;
        }

        if len & 0xC0 == 0xC0 {
            let low = *data.get(pos + 1)? as usize;
            if resume_at.is_none() {
                resume_at = Some(pos + 2);
            }
            jumps += 1;
            if jumps > MAX_POINTER_JUMPS {
                return None;
            }
            pos = ((len & 0x3F) << 8) | low;
            continue;
        }

        if len > MAX_LABEL_LEN {
            return None;
        }
        let label = data.get(pos + 1..pos + 1 + len)?;
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(&String::from_utf8_lossy(label));
        if name.len() > MAX_NAME_LEN {
            return None;
        }
        pos += 1 + len;
    }

    *offset = resume_at.unwrap_or(pos);
    Some(name)
}
