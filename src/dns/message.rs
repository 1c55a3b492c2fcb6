// Minimal DNS message codec for the tunnel transport
//
// Implements just enough of RFC 1035 to:
// - Build TXT queries carrying an EDNS(0) OPT record
// - Parse responses, following name compression pointers
// - Decode TXT character-strings

use super::{DnsError, DomainName, Result, MAX_LABEL_LEN};
use bytes::{Buf, BufMut, BytesMut};
use std::io::Cursor;

pub const RR_TYPE_TXT: u16 = 16;
pub const RR_TYPE_OPT: u16 = 41;
pub const CLASS_IN: u16 = 1;

/// Standard query, recursion desired
pub const FLAGS_QUERY: u16 = 0x0100;
const FLAG_QR: u16 = 0x8000;
const RCODE_MASK: u16 = 0x000f;

/// UDP payload size advertised in the OPT record
pub const EDNS_UDP_PAYLOAD: u16 = 4096;

/// Upper bound on compression pointers followed while reading one name
const MAX_POINTER_HOPS: usize = 64;

/// DNS message header (12 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsHeader {
    pub id: u16,
    pub flags: u16,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl DnsHeader {
    fn parse(buf: &mut Cursor<&[u8]>) -> Result<Self> {
        if buf.remaining() < 12 {
            return Err(DnsError::InvalidMessage("Header too short".into()));
        }

        Ok(Self {
            id: buf.get_u16(),
            flags: buf.get_u16(),
            qdcount: buf.get_u16(),
            ancount: buf.get_u16(),
            nscount: buf.get_u16(),
            arcount: buf.get_u16(),
        })
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u16(self.id);
        buf.put_u16(self.flags);
        buf.put_u16(self.qdcount);
        buf.put_u16(self.ancount);
        buf.put_u16(self.nscount);
        buf.put_u16(self.arcount);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub name: DomainName,
    pub qtype: u16,
    pub qclass: u16,
}

impl DnsQuestion {
    fn parse(msg: &[u8], buf: &mut Cursor<&[u8]>) -> Result<Self> {
        let name = read_name(msg, buf)?;
        if buf.remaining() < 4 {
            return Err(DnsError::InvalidMessage("Question too short".into()));
        }
        Ok(Self {
            name,
            qtype: buf.get_u16(),
            qclass: buf.get_u16(),
        })
    }

    fn write(&self, buf: &mut BytesMut) {
        write_name(&self.name, buf);
        buf.put_u16(self.qtype);
        buf.put_u16(self.qclass);
    }
}

/// DNS resource record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: DomainName,
    pub rtype: u16,
    pub rclass: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl DnsRecord {
    /// EDNS(0) pseudo-record advertising a larger UDP payload size.
    pub fn edns0_opt() -> Self {
        Self {
            name: DomainName::default(),
            rtype: RR_TYPE_OPT,
            rclass: EDNS_UDP_PAYLOAD,
            ttl: 0,
            rdata: Vec::new(),
        }
    }

    pub fn new_txt(name: DomainName, payload: &[u8], ttl: u32) -> Self {
        Self {
            name,
            rtype: RR_TYPE_TXT,
            rclass: CLASS_IN,
            ttl,
            rdata: encode_txt(payload),
        }
    }

    fn parse(msg: &[u8], buf: &mut Cursor<&[u8]>) -> Result<Self> {
        let name = read_name(msg, buf)?;

        if buf.remaining() < 10 {
            return Err(DnsError::InvalidMessage("Record too short".into()));
        }

        let rtype = buf.get_u16();
        let rclass = buf.get_u16();
        let ttl = buf.get_u32();
        let rdlen = buf.get_u16() as usize;

        if buf.remaining() < rdlen {
            return Err(DnsError::InvalidMessage("Truncated record data".into()));
        }

        let mut rdata = vec![0u8; rdlen];
        buf.copy_to_slice(&mut rdata);

        Ok(Self {
            name,
            rtype,
            rclass,
            ttl,
            rdata,
        })
    }

    fn write(&self, buf: &mut BytesMut) {
        write_name(&self.name, buf);
        buf.put_u16(self.rtype);
        buf.put_u16(self.rclass);
        buf.put_u32(self.ttl);
        buf.put_u16(self.rdata.len() as u16);
        buf.put_slice(&self.rdata);
    }
}

/// DNS message (complete query or response)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsMessage {
    pub id: u16,
    pub flags: u16,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub authority: Vec<DnsRecord>,
    pub additional: Vec<DnsRecord>,
}

impl DnsMessage {
    /// TXT query for `name` with an EDNS(0) OPT record.
    pub fn new_txt_query(id: u16, name: DomainName) -> Self {
        Self {
            id,
            flags: FLAGS_QUERY,
            questions: vec![DnsQuestion {
                name,
                qtype: RR_TYPE_TXT,
                qclass: CLASS_IN,
            }],
            answers: Vec::new(),
            authority: Vec::new(),
            additional: vec![DnsRecord::edns0_opt()],
        }
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_QR != 0
    }

    pub fn rcode(&self) -> u16 {
        self.flags & RCODE_MASK
    }

    /// Parse a DNS message from wire format.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let header = DnsHeader::parse(&mut cursor)?;

        let mut questions = Vec::with_capacity(header.qdcount.min(16) as usize);
        for _ in 0..header.qdcount {
            questions.push(DnsQuestion::parse(data, &mut cursor)?);
        }

        let mut sections: [Vec<DnsRecord>; 3] = Default::default();
        let counts = [header.ancount, header.nscount, header.arcount];
        for (section, count) in sections.iter_mut().zip(counts) {
            for _ in 0..count {
                section.push(DnsRecord::parse(data, &mut cursor)?);
            }
        }
        let [answers, authority, additional] = sections;

        if cursor.has_remaining() {
            return Err(DnsError::InvalidMessage("Trailing bytes after message".into()));
        }

        Ok(Self {
            id: header.id,
            flags: header.flags,
            questions,
            answers,
            authority,
            additional,
        })
    }

    /// Serialize to wire format, without name compression.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(512);

        DnsHeader {
            id: self.id,
            flags: self.flags,
            qdcount: self.questions.len() as u16,
            ancount: self.answers.len() as u16,
            nscount: self.authority.len() as u16,
            arcount: self.additional.len() as u16,
        }
        .write(&mut buf);

        for q in &self.questions {
            q.write(&mut buf);
        }
        for rr in self
            .answers
            .iter()
            .chain(&self.authority)
            .chain(&self.additional)
        {
            rr.write(&mut buf);
        }

        buf.to_vec()
    }
}

/// Encode bytes as a sequence of TXT character-strings.
pub fn encode_txt(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + payload.len() / 255 + 1);
    let mut chunks = payload.chunks(255).peekable();
    if chunks.peek().is_none() {
        out.push(0);
    }
    for chunk in chunks {
        out.push(chunk.len() as u8);
        out.extend_from_slice(chunk);
    }
    out
}

/// Concatenate the character-strings of TXT RDATA.
pub fn decode_txt(rdata: &[u8]) -> Result<Vec<u8>> {
    let mut result = Vec::with_capacity(rdata.len());
    let mut cursor = Cursor::new(rdata);

    while cursor.has_remaining() {
        let len = cursor.get_u8() as usize;
        if cursor.remaining() < len {
            return Err(DnsError::InvalidMessage("Truncated TXT data".into()));
        }
        let start = cursor.position() as usize;
        result.extend_from_slice(&rdata[start..start + len]);
        cursor.advance(len);
    }

    Ok(result)
}

/// Read a possibly-compressed name; `msg` is the whole message so pointers
/// can be resolved.
fn read_name(msg: &[u8], buf: &mut Cursor<&[u8]>) -> Result<DomainName> {
    let mut labels = Vec::new();
    let mut pos = buf.position() as usize;
    // where the cursor resumes once the first pointer has been followed
    let mut resume: Option<usize> = None;
    let mut hops = 0;

    loop {
        let len = *msg
            .get(pos)
            .ok_or_else(|| DnsError::InvalidMessage("Truncated domain name".into()))?
            as usize;
        pos += 1;

        match len & 0xc0 {
            0x00 => {
                if len == 0 {
                    break;
                }
                if len > MAX_LABEL_LEN || pos + len > msg.len() {
                    return Err(DnsError::InvalidMessage("Truncated label".into()));
                }
                labels.push(msg[pos..pos + len].to_vec());
                pos += len;
            }
            0xc0 => {
                let low = *msg
                    .get(pos)
                    .ok_or_else(|| DnsError::InvalidMessage("Truncated pointer".into()))?
                    as usize;
                pos += 1;
                hops += 1;
                if hops > MAX_POINTER_HOPS {
                    return Err(DnsError::InvalidMessage("Too many compression pointers".into()));
                }
                resume.get_or_insert(pos);
                pos = ((len & 0x3f) << 8) | low;
            }
            _ => {
                return Err(DnsError::InvalidMessage(format!(
                    "Reserved label type 0x{:02x}",
                    len
                )))
            }
        }
    }

    buf.set_position(resume.unwrap_or(pos) as u64);
    DomainName::from_labels(labels).map_err(|e| DnsError::InvalidMessage(e.to_string()))
}

fn write_name(name: &DomainName, buf: &mut BytesMut) {
    for label in name.labels() {
        buf.put_u8(label.len() as u8);
        buf.put_slice(label);
    }
    buf.put_u8(0);
}
