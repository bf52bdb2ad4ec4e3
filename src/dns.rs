//! DNS message parsing and construction.
//!
//! Only the parts of RFC 1035 a forwarding proxy needs: the header, a
//! single question, and the answer section of upstream replies. Names
//! inside answer rdata are expanded so records can be re-encoded into a
//! fresh message without dangling compression pointers.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::DecodeError;

const HEADER_LEN: usize = 12;

/// Largest message accepted from clients or sent back to them.
pub const MAX_MESSAGE_SIZE: usize = 512;

const MAX_NAME_LEN: usize = 255;
const MAX_POINTER_HOPS: usize = 32;

pub const TYPE_A: u16 = 1;
pub const TYPE_NS: u16 = 2;
pub const TYPE_CNAME: u16 = 5;
pub const TYPE_SOA: u16 = 6;
pub const TYPE_PTR: u16 = 12;
pub const TYPE_MX: u16 = 15;
pub const TYPE_TXT: u16 = 16;
pub const TYPE_AAAA: u16 = 28;

pub const CLASS_IN: u16 = 1;

pub const RCODE_NOERROR: u8 = 0;
pub const RCODE_SERVFAIL: u8 = 2;
pub const RCODE_NXDOMAIN: u8 = 3;
pub const RCODE_REFUSED: u8 = 5;

const FLAG_QR: u16 = 0x8000;
const OPCODE_MASK: u16 = 0x7800;
const FLAG_TC: u16 = 0x0200;
const FLAG_RD: u16 = 0x0100;
const FLAG_RA: u16 = 0x0080;
const RCODE_MASK: u16 = 0x000F;

/// Canonical form of a domain name: lower-case, no trailing dot.
pub fn canonical_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// Record type wrapper for display purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordType(pub u16);

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            TYPE_A => f.write_str("A"),
            TYPE_NS => f.write_str("NS"),
            TYPE_CNAME => f.write_str("CNAME"),
            TYPE_SOA => f.write_str("SOA"),
            TYPE_PTR => f.write_str("PTR"),
            TYPE_MX => f.write_str("MX"),
            TYPE_TXT => f.write_str("TXT"),
            TYPE_AAAA => f.write_str("AAAA"),
            other => write!(f, "TYPE{other}"),
        }
    }
}

/// Normalized `(name, type, class)` triple used to index the cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    name: String,
    qtype: u16,
    qclass: u16,
}

impl QueryKey {
    /// Key for an `IN` class question.
    pub fn new(name: &str, qtype: u16) -> Self {
        Self::with_class(name, qtype, CLASS_IN)
    }

    pub fn with_class(name: &str, qtype: u16, qclass: u16) -> Self {
        Self {
            name: canonical_name(name),
            qtype,
            qclass,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn qtype(&self) -> u16 {
        self.qtype
    }

    pub fn qclass(&self) -> u16 {
        self.qclass
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, RecordType(self.qtype))?;
        if self.qclass != CLASS_IN {
            write!(f, "/CLASS{}", self.qclass)?;
        }
        Ok(())
    }
}

/// A parsed client query.
#[derive(Debug, Clone)]
pub struct DnsQuery {
    pub id: u16,
    pub flags: u16,
    /// Queried name in canonical form.
    pub domain: String,
    pub qtype: u16,
    pub qclass: u16,
    /// Question section exactly as the client sent it.
    question: Vec<u8>,
}

impl DnsQuery {
    /// Parse a DNS query from raw bytes.
    pub fn parse(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(DecodeError::Oversized {
                len: data.len(),
                limit: MAX_MESSAGE_SIZE,
            });
        }
        if data.len() < HEADER_LEN {
            return Err(DecodeError::TooShort(data.len()));
        }

        let id = read_u16(data, 0);
        let flags = read_u16(data, 2);
        if flags & FLAG_QR != 0 {
            return Err(DecodeError::NotAQuery);
        }
        let opcode = ((flags & OPCODE_MASK) >> 11) as u8;
        if opcode != 0 {
            return Err(DecodeError::UnsupportedOpcode(opcode));
        }
        let qdcount = read_u16(data, 4);
        if qdcount != 1 {
            return Err(DecodeError::QuestionCount(qdcount));
        }

        let (domain, pos) = read_name(data, HEADER_LEN)?;
        if pos + 4 > data.len() {
            return Err(DecodeError::Truncated(pos));
        }
        let qtype = read_u16(data, pos);
        let qclass = read_u16(data, pos + 2);

        Ok(Self {
            id,
            flags,
            domain: canonical_name(&domain),
            qtype,
            qclass,
            question: data[HEADER_LEN..pos + 4].to_vec(),
        })
    }

    pub fn key(&self) -> QueryKey {
        QueryKey {
            name: self.domain.clone(),
            qtype: self.qtype,
            qclass: self.qclass,
        }
    }

    /// Recursive query for the same question under a fresh transaction id.
    pub fn upstream_message(&self, id: u16) -> Vec<u8> {
        let mut data = Vec::with_capacity(HEADER_LEN + self.question.len());
        data.extend_from_slice(&id.to_be_bytes());
        data.extend_from_slice(&FLAG_RD.to_be_bytes());
        data.extend_from_slice(&1u16.to_be_bytes());
        data.extend_from_slice(&[0; 6]); // ANCOUNT, NSCOUNT, ARCOUNT
        data.extend_from_slice(&self.question);
        data
    }

    /// Successful response carrying `answers`.
    pub fn answer(&self, answers: &[DnsRecord]) -> Vec<u8> {
        self.response(RCODE_NOERROR, answers, false)
    }

    /// Successful response whose answer set is known to be incomplete.
    /// The TC bit is always set.
    pub fn truncated_answer(&self, answers: &[DnsRecord]) -> Vec<u8> {
        self.response(RCODE_NOERROR, answers, true)
    }

    /// SERVFAIL response with an empty answer section.
    pub fn server_failure(&self) -> Vec<u8> {
        self.response(RCODE_SERVFAIL, &[], false)
    }

    /// Encode a response that echoes the client's id and question.
    ///
    /// Answers that would push the message past [`MAX_MESSAGE_SIZE`] are
    /// dropped and the TC bit is set.
    fn response(&self, rcode: u8, answers: &[DnsRecord], truncated: bool) -> Vec<u8> {
        let mut flags = FLAG_QR
            | FLAG_RA
            | (self.flags & (OPCODE_MASK | FLAG_RD))
            | (u16::from(rcode) & RCODE_MASK);
        if truncated {
            flags |= FLAG_TC;
        }

        let mut data = Vec::with_capacity(MAX_MESSAGE_SIZE);
        data.extend_from_slice(&self.id.to_be_bytes());
        data.extend_from_slice(&[0x00, 0x00]); // flags, patched below
        data.extend_from_slice(&1u16.to_be_bytes());
        data.extend_from_slice(&[0x00, 0x00]); // ANCOUNT, patched below
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]); // NSCOUNT, ARCOUNT
        data.extend_from_slice(&self.question);

        let mut written: u16 = 0;
        let mut record = Vec::new();
        for answer in answers {
            record.clear();
            answer.encode(&mut record, &self.domain);
            if data.len() + record.len() > MAX_MESSAGE_SIZE {
                flags |= FLAG_TC;
                break;
            }
            data.extend_from_slice(&record);
            written += 1;
        }

        data[2..4].copy_from_slice(&flags.to_be_bytes());
        data[6..8].copy_from_slice(&written.to_be_bytes());
        data
    }
}

/// A DNS resource record with name-bearing rdata stored uncompressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: String,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl DnsRecord {
    pub fn a(name: &str, addr: Ipv4Addr, ttl: u32) -> Self {
        Self {
            name: name.to_string(),
            rtype: TYPE_A,
            class: CLASS_IN,
            ttl,
            rdata: addr.octets().to_vec(),
        }
    }

    pub fn aaaa(name: &str, addr: Ipv6Addr, ttl: u32) -> Self {
        Self {
            name: name.to_string(),
            rtype: TYPE_AAAA,
            class: CLASS_IN,
            ttl,
            rdata: addr.octets().to_vec(),
        }
    }

    pub fn cname(name: &str, target: &str, ttl: u32) -> Self {
        let mut rdata = Vec::with_capacity(target.len() + 2);
        encode_name(&mut rdata, target);
        Self {
            name: name.to_string(),
            rtype: TYPE_CNAME,
            class: CLASS_IN,
            ttl,
            rdata,
        }
    }

    /// The address carried by an A or AAAA record.
    pub fn address(&self) -> Option<IpAddr> {
        match self.rtype {
            TYPE_A => {
                let octets: [u8; 4] = self.rdata.as_slice().try_into().ok()?;
                Some(IpAddr::V4(Ipv4Addr::from(octets)))
            }
            TYPE_AAAA => {
                let octets: [u8; 16] = self.rdata.as_slice().try_into().ok()?;
                Some(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            _ => None,
        }
    }

    fn encode(&self, buf: &mut Vec<u8>, question_domain: &str) {
        // Owner names matching the question point back at offset 12.
        if canonical_name(&self.name) == question_domain {
            buf.extend_from_slice(&[0xC0, 0x0C]);
        } else {
            encode_name(buf, &self.name);
        }
        buf.extend_from_slice(&self.rtype.to_be_bytes());
        buf.extend_from_slice(&self.class.to_be_bytes());
        buf.extend_from_slice(&self.ttl.to_be_bytes());
        buf.extend_from_slice(&(self.rdata.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.rdata);
    }
}

/// Minimum TTL across a set of records, if any.
pub fn min_ttl(records: &[DnsRecord]) -> Option<u32> {
    records.iter().map(|r| r.ttl).min()
}

/// The parts of an upstream reply the proxy cares about.
#[derive(Debug, Clone)]
pub struct DnsReply {
    pub id: u16,
    pub rcode: u8,
    pub truncated: bool,
    pub answers: Vec<DnsRecord>,
}

impl DnsReply {
    /// Parse an upstream response.
    ///
    /// A reply with the TC bit set keeps whatever complete answers it
    /// carries instead of failing on the cut-off tail.
    pub fn parse(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < HEADER_LEN {
            return Err(DecodeError::TooShort(data.len()));
        }

        let id = read_u16(data, 0);
        let flags = read_u16(data, 2);
        if flags & FLAG_QR == 0 {
            return Err(DecodeError::NotAResponse);
        }
        let truncated = flags & FLAG_TC != 0;
        let rcode = (flags & RCODE_MASK) as u8;
        let qdcount = read_u16(data, 4);
        let ancount = read_u16(data, 6);

        let mut pos = HEADER_LEN;
        for _ in 0..qdcount {
            let (_, next) = read_name(data, pos)?;
            pos = next + 4;
            if pos > data.len() {
                return Err(DecodeError::Truncated(next));
            }
        }

        let mut answers = Vec::with_capacity(ancount as usize);
        for _ in 0..ancount {
            let (record, next) = match read_record(data, pos) {
                Ok(parsed) => parsed,
                Err(DecodeError::Truncated(_) | DecodeError::BadName(_)) if truncated => break,
                Err(e) => return Err(e),
            };
            pos = next;
            answers.push(record);
        }

        Ok(Self {
            id,
            rcode,
            truncated,
            answers,
        })
    }
}

/// Build a standard recursive query.
pub fn build_query(id: u16, domain: &str, qtype: u16) -> Vec<u8> {
    let mut packet = Vec::with_capacity(HEADER_LEN + domain.len() + 6);

    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&FLAG_RD.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes()); // Questions: 1
    packet.extend_from_slice(&[0x00; 6]); // Answer, Authority, Additional RRs

    encode_name(&mut packet, domain);
    packet.extend_from_slice(&qtype.to_be_bytes());
    packet.extend_from_slice(&CLASS_IN.to_be_bytes());

    packet
}

/// Transaction id of a raw message.
pub fn message_id(data: &[u8]) -> Option<u16> {
    (data.len() >= 2).then(|| read_u16(data, 0))
}

fn read_u16(data: &[u8], pos: usize) -> u16 {
    u16::from_be_bytes([data[pos], data[pos + 1]])
}

fn read_record(data: &[u8], pos: usize) -> Result<(DnsRecord, usize), DecodeError> {
    let (name, pos) = read_name(data, pos)?;
    if pos + 10 > data.len() {
        return Err(DecodeError::Truncated(pos));
    }

    let rtype = read_u16(data, pos);
    let class = read_u16(data, pos + 2);
    let ttl = u32::from_be_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]]);
    let rdlength = read_u16(data, pos + 8) as usize;

    let start = pos + 10;
    let end = start + rdlength;
    if end > data.len() {
        return Err(DecodeError::Truncated(start));
    }

    let rdata = expand_rdata(data, rtype, start, end)?;

    Ok((
        DnsRecord {
            name,
            rtype,
            class,
            ttl,
            rdata,
        },
        end,
    ))
}

/// Copy rdata, expanding any compressed names it contains.
fn expand_rdata(data: &[u8], rtype: u16, start: usize, end: usize) -> Result<Vec<u8>, DecodeError> {
    let raw = &data[start..end];
    let mut out = Vec::with_capacity(raw.len());

    match rtype {
        TYPE_NS | TYPE_CNAME | TYPE_PTR => {
            let (target, _) = read_name(data, start)?;
            encode_name(&mut out, &target);
        }
        TYPE_MX => {
            if raw.len() < 3 {
                return Err(DecodeError::BadName(start));
            }
            out.extend_from_slice(&raw[..2]);
            let (exchange, _) = read_name(data, start + 2)?;
            encode_name(&mut out, &exchange);
        }
        TYPE_SOA => {
            let (mname, pos) = read_name(data, start)?;
            let (rname, pos) = read_name(data, pos)?;
            if pos + 20 > end {
                return Err(DecodeError::Truncated(pos));
            }
            encode_name(&mut out, &mname);
            encode_name(&mut out, &rname);
            out.extend_from_slice(&data[pos..pos + 20]);
        }
        _ => out.extend_from_slice(raw),
    }

    Ok(out)
}

/// Read a possibly compressed name, returning it and the offset just
/// past its encoding at `start`.
fn read_name(data: &[u8], start: usize) -> Result<(String, usize), DecodeError> {
    let mut name = String::new();
    let mut pos = start;
    let mut end = None;
    let mut hops = 0;

    loop {
        let len = *data.get(pos).ok_or(DecodeError::Truncated(pos))? as usize;
        match len & 0xC0 {
            0x00 if len == 0 => {
                pos += 1;
                break;
            }
            0x00 => {
                let label = data
                    .get(pos + 1..pos + 1 + len)
                    .ok_or(DecodeError::Truncated(pos))?;
                let label = std::str::from_utf8(label).map_err(|_| DecodeError::BadName(pos))?;
                if !name.is_empty() {
                    name.push('.');
                }
                name.push_str(label);
                if name.len() > MAX_NAME_LEN {
                    return Err(DecodeError::BadName(start));
                }
                pos += 1 + len;
            }
            0xC0 => {
                let low = *data.get(pos + 1).ok_or(DecodeError::Truncated(pos))? as usize;
                let target = ((len & 0x3F) << 8) | low;
                // Pointers must go strictly backwards.
                if target >= pos || hops >= MAX_POINTER_HOPS {
                    return Err(DecodeError::BadName(pos));
                }
                end.get_or_insert(pos + 2);
                hops += 1;
                pos = target;
            }
            _ => return Err(DecodeError::BadName(pos)),
        }
    }

    Ok((name, end.unwrap_or(pos)))
}

fn encode_name(buf: &mut Vec<u8>, name: &str) {
    let name = name.trim_end_matches('.');
    if !name.is_empty() {
        for label in name.split('.') {
            buf.push(label.len() as u8);
            buf.extend_from_slice(label.as_bytes());
        }
    }
    buf.push(0);
}
