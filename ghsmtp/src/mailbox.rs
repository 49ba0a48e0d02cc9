//! Mailbox parser (spec §4.B): RFC 5321 `Mailbox` (wire) and RFC 5322
//! `addr-spec` (headers) grammars, both admitting UTF-8 atoms for
//! SMTPUTF8/EAI.

use crate::domain::Domain;
use crate::error::{Error, Result};
use std::fmt;

const MAX_LOCAL_PART: usize = 64;
const MAX_DOMAIN: usize = 255;

#[derive(Debug, Clone)]
pub enum LocalPart {
    DotAtom(String),
    Quoted(String),
}

impl LocalPart {
    pub fn as_str(&self) -> &str {
        match self {
            LocalPart::DotAtom(s) | LocalPart::Quoted(s) => s,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Mailbox {
    pub local_part: LocalPart,
    pub domain: Domain,
}

impl Mailbox {
    /// Parses `local@domain`, accepting either grammar (the wire form is a
    /// strict subset of the header form so one parser covers both, as the
    /// two differ mainly in which obsolete header productions are legal —
    /// not modeled here since nothing upstream emits them).
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        let at = find_unquoted_at(input)
            .ok_or_else(|| Error::InvalidMailbox(format!("missing '@': {input}")))?;

        let (local_raw, domain_raw) = (&input[..at], &input[at + 1..]);
        if local_raw.is_empty() || domain_raw.is_empty() {
            return Err(Error::InvalidMailbox(input.to_string()));
        }

        let local_part = parse_local_part(local_raw)?;
        if local_part.as_str().len() > MAX_LOCAL_PART {
            return Err(Error::InvalidMailbox(format!("local-part too long: {input}")));
        }

        if domain_raw.len() > MAX_DOMAIN {
            return Err(Error::InvalidMailbox(format!("domain too long: {input}")));
        }
        let domain = Domain::parse(domain_raw).map_err(|_| Error::InvalidMailbox(input.to_string()))?;

        Ok(Self { local_part, domain })
    }

    /// `local@domain`, quoting the local-part if it requires it.
    pub fn format(&self) -> String {
        match &self.local_part {
            LocalPart::DotAtom(s) => format!("{s}@{}", self.domain.ascii()),
            LocalPart::Quoted(s) => format!("\"{s}\"@{}", self.domain.ascii()),
        }
    }
}

impl fmt::Display for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format())
    }
}

fn find_unquoted_at(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut in_quotes = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => in_quotes = !in_quotes,
            b'@' if !in_quotes => return Some(i),
            b'\\' if in_quotes => i += 1,
            _ => {}
        }
        i += 1;
    }
    None
}

fn parse_local_part(s: &str) -> Result<LocalPart> {
    if s.starts_with('"') && s.ends_with('"') && s.len() >= 2 {
        let inner = &s[1..s.len() - 1];
        if inner.contains('"') && !inner.contains("\\\"") {
            return Err(Error::InvalidMailbox(s.to_string()));
        }
        return Ok(LocalPart::Quoted(inner.to_string()));
    }

    if is_dot_atom(s) {
        Ok(LocalPart::DotAtom(s.to_string()))
    } else {
        Err(Error::InvalidMailbox(s.to_string()))
    }
}

/// dot-atom: one or more atext runs separated by single dots, no leading,
/// trailing, or doubled dots. atext admits UTF-8 (EAI) beyond US-ASCII.
fn is_dot_atom(s: &str) -> bool {
    if s.is_empty() || s.starts_with('.') || s.ends_with('.') || s.contains("..") {
        return false;
    }
    s.chars().all(|c| is_atext(c) || c == '.')
}

fn is_atext(c: char) -> bool {
    if c.is_ascii() {
        c.is_ascii_alphanumeric() || "!#$%&'*+-/=?^_`{|}~".contains(c)
    } else {
        // SMTPUTF8/EAI: any non-ASCII codepoint is permitted as atext.
        !c.is_control()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_mailbox() {
        let m = Mailbox::parse("alice@example.com").unwrap();
        assert_eq!(m.local_part.as_str(), "alice");
        assert_eq!(m.domain.ascii(), "example.com");
    }

    #[test]
    fn parses_quoted_local_part() {
        let m = Mailbox::parse("\"a b\"@example.com").unwrap();
        assert_eq!(m.local_part.as_str(), "a b");
        assert!(matches!(m.local_part, LocalPart::Quoted(_)));
    }

    #[test]
    fn rejects_double_dot() {
        assert!(Mailbox::parse("a..b@example.com").is_err());
    }

    #[test]
    fn rejects_missing_at() {
        assert!(Mailbox::parse("not-an-email").is_err());
    }

    #[test]
    fn enforces_length_limits() {
        let long_local = "a".repeat(65);
        assert!(Mailbox::parse(&format!("{long_local}@example.com")).is_err());
    }

    #[test]
    fn round_trip() {
        let m = Mailbox::parse("bob.smith@example.com").unwrap();
        let formatted = m.format();
        let reparsed = Mailbox::parse(&formatted).unwrap();
        assert_eq!(m.format(), reparsed.format());
    }

    #[test]
    fn smtputf8_local_part() {
        let m = Mailbox::parse("üser@example.com").unwrap();
        assert_eq!(m.local_part.as_str(), "üser");
    }

    #[test]
    fn address_literal_domain() {
        let m = Mailbox::parse("postmaster@[203.0.113.1]").unwrap();
        assert!(m.domain.is_address_literal());
    }
}
