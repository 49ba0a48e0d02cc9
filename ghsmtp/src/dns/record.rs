//! Typed DNS record variants (spec §3 "DNS record types"): a sum type over
//! record shapes, not an inheritance hierarchy (spec §9).

use std::net::{Ipv4Addr, Ipv6Addr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QType {
    A,
    Aaaa,
    Cname,
    Ptr,
    Mx,
    Txt,
    Tlsa,
    Any,
}

impl QType {
    pub fn to_u16(self) -> u16 {
        match self {
            QType::A => 1,
            QType::Cname => 5,
            QType::Ptr => 12,
            QType::Mx => 15,
            QType::Txt => 16,
            QType::Aaaa => 28,
            QType::Tlsa => 52,
            QType::Any => 255,
        }
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            1 => QType::A,
            5 => QType::Cname,
            12 => QType::Ptr,
            15 => QType::Mx,
            16 => QType::Txt,
            28 => QType::Aaaa,
            52 => QType::Tlsa,
            255 => QType::Any,
            _ => return None,
        })
    }
}

/// One DNS resource record, decoded into a concrete variant.
#[derive(Debug, Clone)]
pub enum Record {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Cname(String),
    Ptr(String),
    Mx { preference: u16, exchange: String },
    Txt(String),
    Tlsa {
        cert_usage: u8,
        selector: u8,
        matching_type: u8,
        assoc_data: Vec<u8>,
    },
    /// Any record type not in the supported set above; carried so callers
    /// can still see `ancount` without the resolver choking on it.
    Other { qtype: u16 },
}

impl Record {
    pub fn qtype(&self) -> Option<QType> {
        match self {
            Record::A(_) => Some(QType::A),
            Record::Aaaa(_) => Some(QType::Aaaa),
            Record::Cname(_) => Some(QType::Cname),
            Record::Ptr(_) => Some(QType::Ptr),
            Record::Mx { .. } => Some(QType::Mx),
            Record::Txt(_) => Some(QType::Txt),
            Record::Tlsa { .. } => Some(QType::Tlsa),
            Record::Other { .. } => None,
        }
    }

    /// Human-readable presentation form, per §4.C `get_strings` helper:
    /// A/AAAA as presentation form, CNAME/PTR as names, MX as exchange,
    /// TXT as concatenated content.
    pub fn as_string(&self) -> String {
        match self {
            Record::A(a) => a.to_string(),
            Record::Aaaa(a) => a.to_string(),
            Record::Cname(n) | Record::Ptr(n) => n.clone(),
            Record::Mx { exchange, .. } => exchange.clone(),
            Record::Txt(s) => s.clone(),
            Record::Tlsa { .. } => String::new(),
            Record::Other { .. } => String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResourceRecord {
    pub name: String,
    pub ttl: u32,
    pub record: Record,
}
