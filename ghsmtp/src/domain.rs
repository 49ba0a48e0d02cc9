//! Domain & IP utilities (spec §4.A).
//!
//! A [`Domain`] keeps both the ASCII (IDNA A-label) and UTF-8 (U-label)
//! representations; equality and hashing always compare the ASCII form,
//! case-insensitively, with any trailing dot elided.

use crate::error::{Error, Result};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

#[derive(Debug, Clone)]
pub struct Domain {
    ascii: String,
    utf8: String,
}

impl Domain {
    /// Parses either an ASCII or a UTF-8 domain string, or an address
    /// literal (`[1.2.3.4]`, `[IPv6:::1]`), storing both representations.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = strip_trailing_dot(input);
        if trimmed.is_empty() {
            return Err(Error::InvalidDomain("empty domain".into()));
        }

        if is_address_literal(trimmed) {
            return Ok(Self {
                ascii: trimmed.to_string(),
                utf8: trimmed.to_string(),
            });
        }

        let ascii = idna::domain_to_ascii(trimmed)
            .map_err(|e| Error::InvalidDomain(format!("{trimmed}: {e:?}")))?;
        let utf8 = idna::domain_to_unicode(trimmed).0;
        Ok(Self { ascii, utf8 })
    }

    pub fn ascii(&self) -> &str {
        &self.ascii
    }

    pub fn utf8(&self) -> &str {
        &self.utf8
    }

    pub fn is_address_literal(&self) -> bool {
        is_address_literal(&self.ascii)
    }

    /// The literal IP address, if this domain is an address literal.
    pub fn literal_addr(&self) -> Option<IpAddr> {
        address_literal_to_ip(&self.ascii)
    }

    pub fn label_count(&self) -> usize {
        if self.is_address_literal() {
            1
        } else {
            self.ascii.split('.').filter(|l| !l.is_empty()).count()
        }
    }
}

impl PartialEq for Domain {
    fn eq(&self, other: &Self) -> bool {
        self.ascii.eq_ignore_ascii_case(&other.ascii)
    }
}
impl Eq for Domain {}

impl std::hash::Hash for Domain {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ascii.to_ascii_lowercase().hash(state);
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ascii)
    }
}

fn strip_trailing_dot(s: &str) -> &str {
    s.strip_suffix('.').unwrap_or(s)
}

pub fn is_address_literal(s: &str) -> bool {
    s.starts_with('[') && s.ends_with(']')
}

fn address_literal_to_ip(s: &str) -> Option<IpAddr> {
    let inner = s.strip_prefix('[')?.strip_suffix(']')?;
    if let Some(v6) = inner.strip_prefix("IPv6:") {
        v6.parse::<Ipv6Addr>().ok().map(IpAddr::V6)
    } else {
        inner.parse::<Ipv4Addr>().ok().map(IpAddr::V4)
    }
}

pub fn is_ipv4_literal(s: &str) -> bool {
    s.parse::<Ipv4Addr>().is_ok()
}

pub fn is_ipv6_literal(s: &str) -> bool {
    s.parse::<Ipv6Addr>().is_ok()
}

/// Renders an IP address as an SMTP/RFC 5321 address literal:
/// `[a.b.c.d]` or `[IPv6:...]`.
pub fn to_address_literal(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => format!("[{v4}]"),
        IpAddr::V6(v6) => format!("[IPv6:{v6}]"),
    }
}

/// The reverse-DNS query name for `addr`: `d.c.b.a.in-addr.arpa.` for IPv4,
/// nibble-reversed `ip6.arpa.` for IPv6 (spec §4.A, testable property 8).
pub fn reverse(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.{}.in-addr.arpa.", o[3], o[2], o[1], o[0])
        }
        IpAddr::V6(v6) => {
            let mut labels = String::new();
            for byte in v6.octets().iter().rev() {
                labels.push_str(&format!("{:x}.{:x}.", byte & 0xf, byte >> 4));
            }
            labels.push_str("ip6.arpa.");
            labels
        }
    }
}

/// RFC 1918 + IPv4-mapped private ranges, and the IPv6 table decided in
/// SPEC_FULL.md's resolved Open Question: loopback, link-local, ULA,
/// IPv4-mapped (delegates), NAT64 (not private), and the documentation
/// prefix (treated as private).
pub fn is_private(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            if v6.is_loopback() || v6.is_unspecified() {
                return true;
            }
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_private(IpAddr::V4(mapped));
            }
            let seg = v6.segments();
            // fe80::/10
            if (seg[0] & 0xffc0) == 0xfe80 {
                return true;
            }
            // fc00::/7 (ULA)
            if (seg[0] & 0xfe00) == 0xfc00 {
                return true;
            }
            // 2001:db8::/32 (documentation)
            if seg[0] == 0x2001 && seg[1] == 0x0db8 {
                return true;
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverse_ipv4() {
        let a: IpAddr = "192.0.2.1".parse().unwrap();
        assert_eq!(reverse(a), "1.2.0.192.in-addr.arpa.");
    }

    #[test]
    fn reverse_ipv6() {
        let a: IpAddr = "2001:db8::1".parse().unwrap();
        let r = reverse(a);
        assert!(r.ends_with("ip6.arpa."));
        assert!(r.starts_with("1.0.0.0."));
    }

    #[test]
    fn address_literal_round_trip() {
        let a: IpAddr = "203.0.113.9".parse().unwrap();
        let lit = to_address_literal(a);
        assert_eq!(lit, "[203.0.113.9]");
        let d = Domain::parse(&lit).unwrap();
        assert!(d.is_address_literal());
        assert_eq!(d.literal_addr(), Some(a));
    }

    #[test]
    fn ipv6_literal_round_trip() {
        let a: IpAddr = "::1".parse().unwrap();
        let lit = to_address_literal(a);
        assert_eq!(lit, "[IPv6:::1]");
        let d = Domain::parse(&lit).unwrap();
        assert_eq!(d.literal_addr(), Some(a));
    }

    #[test]
    fn idna_round_trip() {
        let d = Domain::parse("xn--nxasmq6b.example").unwrap();
        assert_eq!(d.ascii(), "xn--nxasmq6b.example");
    }

    #[test]
    fn equality_is_case_insensitive_and_ignores_trailing_dot() {
        let a = Domain::parse("Example.COM.").unwrap();
        let b = Domain::parse("example.com").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn private_ranges() {
        assert!(is_private("10.0.0.1".parse().unwrap()));
        assert!(is_private("127.0.0.1".parse().unwrap()));
        assert!(is_private("fe80::1".parse().unwrap()));
        assert!(is_private("fc00::1".parse().unwrap()));
        assert!(!is_private("8.8.8.8".parse().unwrap()));
        assert!(!is_private("2606:4700:4700::1111".parse().unwrap()));
    }
}
