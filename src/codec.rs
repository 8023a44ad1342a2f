use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;

use crate::types::{RecordType, ResourceRecord};

const CLASS_IN: u16 = 1;
/// Compression pointer chains longer than this are treated as hostile input.
const MAX_POINTER_JUMPS: u32 = 5;

/// Why a response was rejected. The nonzero-rcode variants abort decoding
/// before any record is parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("response truncated: read past end of packet")]
    BufferUnderrun,
    #[error("compression pointer chain exceeded {MAX_POINTER_JUMPS} jumps")]
    TooManyPointerJumps,
    #[error("server could not interpret the query")]
    FormatError,
    #[error("server failure")]
    ServerFailure,
    #[error("authoritative name error: domain does not exist")]
    NameError,
    #[error("query kind not implemented by server")]
    NotImplemented,
    #[error("server refused the query")]
    Refused,
    #[error("unrecognized response code {0}")]
    UnrecognizedRcode(u8),
}

/// Header flag bits relevant to resolution.
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderFlags {
    pub response: bool,
    pub authoritative: bool,
    pub truncated: bool,
    pub recursion_desired: bool,
    pub recursion_available: bool,
}

impl HeaderFlags {
    fn from_word(word: u16) -> Self {
        Self {
            response: word & 0x8000 != 0,
            authoritative: word & 0x0400 != 0,
            truncated: word & 0x0200 != 0,
            recursion_desired: word & 0x0100 != 0,
            recursion_available: word & 0x0080 != 0,
        }
    }
}

#[allow(dead_code)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// A fully decoded response message.
#[derive(Debug, PartialEq)]
pub struct DecodedPacket {
    pub id: u16,
    pub flags: HeaderFlags,
    pub opcode: u8,
    pub question: Question,
    pub answers: Vec<ResourceRecord>,
    pub authorities: Vec<ResourceRecord>,
    pub additionals: Vec<ResourceRecord>,
}

/// Checked cursor over an immutable packet. All reads are bounds-checked and
/// fail with `BufferUnderrun` instead of walking off the end.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    #[inline]
    fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    #[inline]
    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    #[inline]
    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(n).ok_or(DecodeError::BufferUnderrun)?;
        let bytes = self.buf.get(self.pos..end).ok_or(DecodeError::BufferUnderrun)?;
        self.pos = end;
        Ok(bytes)
    }

    #[inline]
    fn byte_at(&self, offset: usize) -> Result<u8, DecodeError> {
        self.buf.get(offset).copied().ok_or(DecodeError::BufferUnderrun)
    }

    /// Reads a possibly compressed domain name. Label bytes advance the
    /// cursor; the first pointer commits the cursor past its two bytes, and
    /// everything after it is read by absolute offset without moving the
    /// cursor again. Pointer chains are followed transitively up to the jump
    /// guard.
    fn read_name(&mut self) -> Result<String, DecodeError> {
        let mut name = String::new();
        let mut at = self.pos;
        let mut jumped = false;
        let mut jumps_left = MAX_POINTER_JUMPS;

        loop {
            let len = self.byte_at(at)?;

            if len == 0 {
                if !jumped {
                    self.pos = at + 1;
                }
                break;
            }

            if len & 0xC0 == 0xC0 {
                let low = self.byte_at(at + 1)?;
                if !jumped {
                    self.pos = at + 2;
                    jumped = true;
                }
                at = ((len as usize & 0x3F) << 8) | low as usize;
                jumps_left -= 1;
                if jumps_left == 0 {
                    return Err(DecodeError::TooManyPointerJumps);
                }
                continue;
            }

            let start = at + 1;
            let end = start.checked_add(len as usize).ok_or(DecodeError::BufferUnderrun)?;
            let label = self.buf.get(start..end).ok_or(DecodeError::BufferUnderrun)?;
            if !name.is_empty() {
                name.push('.');
            }
            for &b in label {
                name.push(b as char);
            }
            at = end;
            if !jumped {
                self.pos = at;
            }
        }

        Ok(name)
    }
}

/// Builds a non-recursive query for `hostname`/`rtype` and returns it with
/// its transaction id. The input is trimmed and empty labels are skipped, so
/// a trailing dot encodes cleanly.
pub fn encode_query(hostname: &str, rtype: RecordType) -> (Vec<u8>, u16) {
    let hostname = hostname.trim();
    let id: u16 = rand::random();

    let mut packet = Vec::with_capacity(12 + hostname.len() + 6);
    packet.extend_from_slice(&id.to_be_bytes());
    // flags all zero: standard query, recursion not desired
    packet.extend_from_slice(&[0, 0]);
    packet.extend_from_slice(&1u16.to_be_bytes());
    packet.extend_from_slice(&[0, 0, 0, 0, 0, 0]);

    for label in hostname.split('.').filter(|label| !label.is_empty()) {
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);
    packet.extend_from_slice(&rtype.code().to_be_bytes());
    packet.extend_from_slice(&CLASS_IN.to_be_bytes());

    (packet, id)
}

/// Decodes a response datagram. A nonzero rcode maps to its error variant
/// before any record is touched.
pub fn decode_response(packet: &[u8]) -> Result<DecodedPacket, DecodeError> {
    let mut cur = Cursor::new(packet);

    let id = cur.read_u16()?;
    let flags_word = cur.read_u16()?;
    let flags = HeaderFlags::from_word(flags_word);
    let opcode = ((flags_word >> 11) & 0xF) as u8;
    let rcode = (flags_word & 0xF) as u8;
    let _qd_count = cur.read_u16()?;
    let an_count = cur.read_u16()?;
    let ns_count = cur.read_u16()?;
    let ar_count = cur.read_u16()?;

    match rcode {
        0 => {}
        1 => return Err(DecodeError::FormatError),
        2 => return Err(DecodeError::ServerFailure),
        3 => return Err(DecodeError::NameError),
        4 => return Err(DecodeError::NotImplemented),
        5 => return Err(DecodeError::Refused),
        other => return Err(DecodeError::UnrecognizedRcode(other)),
    }

    let question = Question {
        name: cur.read_name()?,
        qtype: cur.read_u16()?,
        qclass: cur.read_u16()?,
    };

    let answers = read_records(&mut cur, an_count)?;
    let authorities = read_records(&mut cur, ns_count)?;
    let additionals = read_records(&mut cur, ar_count)?;

    Ok(DecodedPacket {
        id,
        flags,
        opcode,
        question,
        answers,
        authorities,
        additionals,
    })
}

fn read_records(cur: &mut Cursor<'_>, count: u16) -> Result<Vec<ResourceRecord>, DecodeError> {
    let mut records = Vec::with_capacity(count as usize);

    for _ in 0..count {
        let host = cur.read_name()?;
        let type_code = cur.read_u16()?;
        let rtype = RecordType::from_code(type_code);
        let class = cur.read_u16()?;
        let ttl = cur.read_u32()? as u64;
        // RDLENGTH is advisory here: payloads are parsed by type, not skipped.
        let _rd_length = cur.read_u16()?;

        if rtype == RecordType::MX {
            let _preference = cur.read_u16()?;
        }

        let record = if rtype == RecordType::A && class == CLASS_IN {
            let b = cur.read_bytes(4)?;
            let addr = IpAddr::V4(Ipv4Addr::new(b[0], b[1], b[2], b[3]));
            ResourceRecord::address_record(&host, type_code, ttl, addr)
        } else if rtype == RecordType::AAAA && class == CLASS_IN {
            let b = cur.read_bytes(16)?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(b);
            ResourceRecord::address_record(&host, type_code, ttl, IpAddr::V6(Ipv6Addr::from(octets)))
        } else {
            // NS, CNAME, MX exchange and SOA's leading name all decode as a
            // single name; SOA's trailing fields are not consumed.
            let text = cur.read_name()?;
            ResourceRecord::text_record(&host, type_code, ttl, text)
        };

        records.push(record);
    }

    Ok(records)
}
