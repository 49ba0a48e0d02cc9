//! RFC 1035 message wire format: construction of outgoing queries and
//! decoding of incoming answers, including bounded-loop label-pointer
//! compression (spec §4.C, §9 "Cyclic structure").
//!
//! This is a from-scratch wire codec: its shape — a `ToFromNetworkOrder`-
//! style split between header, question and RR sections, with label
//! decoding driven by an explicit position cursor rather than recursive
//! descent — follows the pattern in
//! `examples/dandyvica-dnsquery/src/rfc1035.rs`.

use super::record::{QType, Record, ResourceRecord};
use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder};

const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 255;
const MAX_POINTER_HOPS: usize = 50;

#[derive(Debug, Clone)]
pub struct Question {
    pub name: String,
    pub qtype: QType,
    pub qclass: u16,
}

#[derive(Debug, Clone)]
pub struct Header {
    pub id: u16,
    pub flags: u16,
    pub qd_count: u16,
    pub an_count: u16,
    pub ns_count: u16,
    pub ar_count: u16,
}

impl Header {
    pub fn rcode(&self) -> u8 {
        (self.flags & 0x000f) as u8
    }
    pub fn is_response(&self) -> bool {
        self.flags & 0x8000 != 0
    }
    pub fn truncated(&self) -> bool {
        self.flags & 0x0200 != 0
    }
    pub fn authentic_data(&self) -> bool {
        self.flags & 0x0020 != 0
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub header: Header,
    pub question: Question,
    pub answers: Vec<ResourceRecord>,
}

/// EDNS0 OPT "extended RCODE and flags" word (RFC 6891 §6.1.3): extended
/// RCODE (high 8 bits, always 0 here) + version (next 8 bits, 0) + flags
/// (low 16 bits). Bit 15 of the flags is the DNSSEC OK (DO) bit (spec §3,
/// §4.C): set it so authoritative/recursive servers return RRSIG/DS/NSEC
/// records and the resolver can read `Header::authentic_data`.
const EDNS0_FLAGS_DO: u32 = 0x0000_8000;

/// Builds a query message for `(name, qtype, qclass=IN, id)` with an EDNS0
/// OPT RR in the additional section advertising a 4096-octet UDP payload
/// size (kept for forward compatibility per spec §4.C/§6, even over TCP)
/// and the DO bit set to request DNSSEC records.
pub fn build_query(name: &str, qtype: QType, id: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);

    // Header
    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(&0x0100u16.to_be_bytes()); // RD=1
    buf.extend_from_slice(&1u16.to_be_bytes()); // qdcount
    buf.extend_from_slice(&0u16.to_be_bytes()); // ancount
    buf.extend_from_slice(&0u16.to_be_bytes()); // nscount
    buf.extend_from_slice(&1u16.to_be_bytes()); // arcount (OPT)

    encode_name(name, &mut buf);
    buf.extend_from_slice(&qtype.to_u16().to_be_bytes());
    buf.extend_from_slice(&1u16.to_be_bytes()); // IN

    // OPT RR: name=root, type=41, udp payload=4096, ttl(ext-rcode/flags)=DO, rdlen=0
    buf.push(0);
    buf.extend_from_slice(&41u16.to_be_bytes());
    buf.extend_from_slice(&4096u16.to_be_bytes());
    buf.extend_from_slice(&EDNS0_FLAGS_DO.to_be_bytes());
    buf.extend_from_slice(&0u16.to_be_bytes());

    buf
}

fn encode_name(name: &str, buf: &mut Vec<u8>) {
    let name = name.strip_suffix('.').unwrap_or(name);
    if !name.is_empty() {
        for label in name.split('.') {
            let bytes = label.as_bytes();
            buf.push(bytes.len() as u8);
            buf.extend_from_slice(bytes);
        }
    }
    buf.push(0);
}

/// Parses a complete DNS message, validating it against the question that
/// was issued. Returns `Err` (treated by the resolver as `bogus`) on any
/// framing violation: oversized labels/names, a pointer loop, or a
/// question-section mismatch.
pub fn parse_message(buf: &[u8], expected_id: u16, expected_name: &str, expected_qtype: QType) -> Result<Message> {
    if buf.len() < 12 {
        return Err(Error::Dns("message shorter than header".into()));
    }
    let header = Header {
        id: BigEndian::read_u16(&buf[0..2]),
        flags: BigEndian::read_u16(&buf[2..4]),
        qd_count: BigEndian::read_u16(&buf[4..6]),
        an_count: BigEndian::read_u16(&buf[6..8]),
        ns_count: BigEndian::read_u16(&buf[8..10]),
        ar_count: BigEndian::read_u16(&buf[10..12]),
    };

    if header.id != expected_id {
        return Err(Error::Dns("transaction id mismatch".into()));
    }

    let mut pos = 12usize;
    if header.qd_count < 1 {
        return Err(Error::Dns("missing question section".into()));
    }
    let (qname, next) = decode_name(buf, pos)?;
    pos = next;
    if pos + 4 > buf.len() {
        return Err(Error::Dns("truncated question".into()));
    }
    let qtype_raw = BigEndian::read_u16(&buf[pos..pos + 2]);
    let qclass = BigEndian::read_u16(&buf[pos + 2..pos + 4]);
    pos += 4;

    let qtype = QType::from_u16(qtype_raw).unwrap_or(QType::Any);
    let expected_ascii = expected_name.strip_suffix('.').unwrap_or(expected_name);
    let got_ascii = qname.strip_suffix('.').unwrap_or(&qname);
    if !expected_ascii.eq_ignore_ascii_case(got_ascii) || qtype != expected_qtype {
        return Err(Error::Dns("question section mismatch".into()));
    }

    let question = Question {
        name: qname,
        qtype,
        qclass,
    };

    let mut answers = Vec::new();
    for _ in 0..header.an_count {
        let (rr, next) = decode_rr(buf, pos)?;
        pos = next;
        if let Some(rr) = rr {
            answers.push(rr);
        }
    }

    Ok(Message {
        header,
        question,
        answers,
    })
}

/// Decodes a domain name starting at `pos`, following compression pointers
/// under two independent bounds (hop count and cumulative bytes visited) so
/// that a malicious or corrupt pointer chain cannot recurse or loop
/// forever (spec §9).
fn decode_name(buf: &[u8], start: usize) -> Result<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = start;
    let mut hops = 0usize;
    let mut bytes_visited = 0usize;
    let mut end_pos: Option<usize> = None;

    loop {
        if pos >= buf.len() {
            return Err(Error::Dns("name runs past end of message".into()));
        }
        let b = buf[pos];

        if b == 0 {
            if end_pos.is_none() {
                end_pos = Some(pos + 1);
            }
            break;
        }

        if b & 0xc0 == 0xc0 {
            if pos + 1 >= buf.len() {
                return Err(Error::Dns("truncated pointer".into()));
            }
            hops += 1;
            if hops > MAX_POINTER_HOPS || bytes_visited > buf.len() {
                return Err(Error::Dns("pointer loop".into()));
            }
            if end_pos.is_none() {
                end_pos = Some(pos + 2);
            }
            let ptr = (((b as u16) & 0x3f) << 8) | buf[pos + 1] as u16;
            pos = ptr as usize;
            continue;
        }

        if b & 0xc0 != 0 {
            return Err(Error::Dns("reserved label type".into()));
        }

        let len = b as usize;
        if len > MAX_LABEL_LEN {
            return Err(Error::Dns("label too long".into()));
        }
        if pos + 1 + len > buf.len() {
            return Err(Error::Dns("label runs past end of message".into()));
        }
        let label = std::str::from_utf8(&buf[pos + 1..pos + 1 + len])
            .map_err(|_| Error::Dns("non-utf8 label".into()))?;
        labels.push(label.to_string());
        bytes_visited += 1 + len;
        pos += 1 + len;

        if labels.iter().map(|l| l.len() + 1).sum::<usize>() > MAX_NAME_LEN {
            return Err(Error::Dns("name too long".into()));
        }
    }

    let mut name = labels.join(".");
    name.push('.');
    Ok((name, end_pos.unwrap()))
}

/// Decodes one resource record. Returns `None` for the record value itself
/// only for the OPT pseudo-RR in the additional section (handled by the
/// resolver separately); here we just skip OPT/unsupported rdata shapes
/// that don't map onto spec §3's record-type sum.
fn decode_rr(buf: &[u8], pos: usize) -> Result<(Option<ResourceRecord>, usize)> {
    let (name, mut pos) = decode_name(buf, pos)?;
    if pos + 10 > buf.len() {
        return Err(Error::Dns("truncated RR header".into()));
    }
    let rtype = BigEndian::read_u16(&buf[pos..pos + 2]);
    let _class = BigEndian::read_u16(&buf[pos + 2..pos + 4]);
    let ttl = BigEndian::read_u32(&buf[pos + 4..pos + 8]);
    let rdlen = BigEndian::read_u16(&buf[pos + 8..pos + 10]) as usize;
    pos += 10;
    if pos + rdlen > buf.len() {
        return Err(Error::Dns("truncated rdata".into()));
    }
    let rdata = &buf[pos..pos + rdlen];
    let next = pos + rdlen;

    let record = match QType::from_u16(rtype) {
        Some(QType::A) if rdata.len() == 4 => {
            Record::A(std::net::Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]))
        }
        Some(QType::Aaaa) if rdata.len() == 16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(rdata);
            Record::Aaaa(std::net::Ipv6Addr::from(octets))
        }
        Some(QType::Cname) => {
            let (n, _) = decode_name(buf, pos)?;
            Record::Cname(n)
        }
        Some(QType::Ptr) => {
            let (n, _) = decode_name(buf, pos)?;
            Record::Ptr(n)
        }
        Some(QType::Mx) if rdata.len() >= 2 => {
            let preference = BigEndian::read_u16(&rdata[0..2]);
            let (exchange, _) = decode_name(buf, pos + 2)?;
            Record::Mx { preference, exchange }
        }
        Some(QType::Txt) => {
            let mut s = String::new();
            let mut i = 0;
            while i < rdata.len() {
                let len = rdata[i] as usize;
                i += 1;
                if i + len > rdata.len() {
                    break;
                }
                s.push_str(&String::from_utf8_lossy(&rdata[i..i + len]));
                i += len;
            }
            Record::Txt(s)
        }
        Some(QType::Tlsa) if rdata.len() >= 3 => Record::Tlsa {
            cert_usage: rdata[0],
            selector: rdata[1],
            matching_type: rdata[2],
            assoc_data: rdata[3..].to_vec(),
        },
        _ => Record::Other { qtype: rtype },
    };

    Ok((Some(ResourceRecord { name, ttl, record }), next))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_a_response(id: u16, name: &str, ip: [u8; 4]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&id.to_be_bytes());
        buf.extend_from_slice(&0x8180u16.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        encode_name(name, &mut buf);
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes());
        // answer, using a pointer back to offset 12 for the name
        buf.extend_from_slice(&0xc00cu16.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&300u32.to_be_bytes());
        buf.extend_from_slice(&4u16.to_be_bytes());
        buf.extend_from_slice(&ip);
        buf
    }

    #[test]
    fn builds_and_parses_a_query_round_trip() {
        let query = build_query("example.com", QType::A, 0x1234);
        assert_eq!(&query[0..2], &0x1234u16.to_be_bytes());

        let resp = build_a_response(0x1234, "example.com", [93, 184, 216, 34]);
        let msg = parse_message(&resp, 0x1234, "example.com", QType::A).unwrap();
        assert_eq!(msg.answers.len(), 1);
        match &msg.answers[0].record {
            Record::A(ip) => assert_eq!(*ip, std::net::Ipv4Addr::new(93, 184, 216, 34)),
            _ => panic!("wrong record type"),
        }
    }

    #[test]
    fn query_opt_record_sets_do_bit() {
        let query = build_query("example.com", QType::A, 0x1234);
        // OPT RR is the last 11 bytes: name(1) + type(2) + class(2) + ttl(4) + rdlen(2).
        let opt = &query[query.len() - 11..];
        assert_eq!(&opt[1..3], &41u16.to_be_bytes(), "OPT type");
        let ext_rcode_and_flags = BigEndian::read_u32(&opt[5..9]);
        assert_eq!(ext_rcode_and_flags & EDNS0_FLAGS_DO, EDNS0_FLAGS_DO, "DO bit must be set");
    }

    #[test]
    fn rejects_id_mismatch() {
        let resp = build_a_response(0xaaaa, "example.com", [1, 2, 3, 4]);
        assert!(parse_message(&resp, 0xbbbb, "example.com", QType::A).is_err());
    }

    #[test]
    fn rejects_question_mismatch() {
        let resp = build_a_response(0x1234, "example.com", [1, 2, 3, 4]);
        assert!(parse_message(&resp, 0x1234, "other.example", QType::A).is_err());
    }

    #[test]
    fn rejects_pointer_loop() {
        // A name at offset 12 that points right back to itself.
        let mut buf = vec![0u8; 14];
        buf[12] = 0xc0;
        buf[13] = 12;
        assert!(decode_name(&buf, 12).is_err());
    }

    #[test]
    fn rejects_oversized_label() {
        let mut buf = vec![0u8; 70];
        buf[0] = 64; // > 63
        assert!(decode_name(&buf, 0).is_err());
    }
}
