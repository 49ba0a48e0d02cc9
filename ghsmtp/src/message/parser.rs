//! RFC 5322 message parsing (spec §4.F): splits headers from body, unfolds
//! continuation lines, then offers structured views over specific headers
//! (`address-list`, `Received-SPF:`, `Authentication-Results:`).
//!
//! Header parsing operates on the fully captured header block in one pass,
//! unlike the streaming SMTP/DNS parsers (spec §9).

use std::fmt;

/// One header field, preserving the order it was seen in. Names are never
/// deduplicated: multiple `Received:` lines are legal and order-significant
/// (spec §9).
#[derive(Debug, Clone)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn name_matches(&self, other: &str) -> bool {
        self.name.eq_ignore_ascii_case(other)
    }
}

#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub headers: Vec<Header>,
    pub body: Vec<u8>,
}

impl ParsedMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name_matches(name))
            .map(|h| h.value.as_str())
    }

    pub fn headers_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.headers
            .iter()
            .filter(move |h| h.name_matches(name))
            .map(|h| h.value.as_str())
    }
}

/// Splits `raw` on the first CRLFCRLF (or bare LFLF, tolerated the same way
/// the SMTP layer tolerates bare LF) into a header block and body, then
/// unfolds continuation lines (leading SP/TAB) before field splitting.
pub fn parse(raw: &[u8]) -> ParsedMessage {
    let (header_block, body) = split_header_body(raw);
    let headers = parse_headers(header_block);
    ParsedMessage {
        headers,
        body: body.to_vec(),
    }
}

fn split_header_body(raw: &[u8]) -> (&[u8], &[u8]) {
    if let Some(pos) = find_subslice(raw, b"\r\n\r\n") {
        return (&raw[..pos], &raw[pos + 4..]);
    }
    if let Some(pos) = find_subslice(raw, b"\n\n") {
        return (&raw[..pos], &raw[pos + 2..]);
    }
    (raw, &[])
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn parse_headers(block: &[u8]) -> Vec<Header> {
    let text = String::from_utf8_lossy(block);
    let mut unfolded: Vec<String> = Vec::new();

    for raw_line in text.split("\r\n").flat_map(|l| l.split('\n')) {
        if (raw_line.starts_with(' ') || raw_line.starts_with('\t')) && !unfolded.is_empty() {
            let last = unfolded.last_mut().unwrap();
            last.push(' ');
            last.push_str(raw_line.trim_start());
        } else if !raw_line.is_empty() {
            unfolded.push(raw_line.to_string());
        }
    }

    unfolded
        .into_iter()
        .filter_map(|line| {
            let colon = line.find(':')?;
            let name = line[..colon].trim().to_string();
            let value = line[colon + 1..].trim().to_string();
            if name.is_empty() {
                None
            } else {
                Some(Header { name, value })
            }
        })
        .collect()
}

/// One address from an `address-list` header (`From:`, `To:`, `Cc:`, and
/// resent variants). Display-name is kept verbatim for re-emission;
/// `mailbox` is left as a raw `addr-spec` string for `mailbox::Mailbox` to
/// parse, since display names may contain characters that would otherwise
/// need re-escaping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub display_name: Option<String>,
    pub addr_spec: String,
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.display_name {
            Some(name) => write!(f, "{name} <{}>", self.addr_spec),
            None => write!(f, "{}", self.addr_spec),
        }
    }
}

/// Parses a comma-separated `address-list`. Group syntax (`name: a,b;`) is
/// flattened to its member mailboxes; an empty group (`name:;`) yields none.
pub fn parse_address_list(value: &str) -> Vec<Address> {
    let mut out = Vec::new();
    for entry in split_top_level(value, ',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        if let Some(colon) = entry.find(':') {
            if entry.ends_with(';') {
                let members = &entry[colon + 1..entry.len() - 1];
                out.extend(parse_address_list(members));
                continue;
            }
        }
        if let Some(addr) = parse_one_address(entry) {
            out.push(addr);
        }
    }
    out
}

fn parse_one_address(entry: &str) -> Option<Address> {
    if let Some(open) = entry.find('<') {
        let close = entry.rfind('>')?;
        if close <= open {
            return None;
        }
        let addr_spec = entry[open + 1..close].trim().to_string();
        let display = entry[..open].trim().trim_matches('"').trim();
        let display_name = if display.is_empty() {
            None
        } else {
            Some(display.to_string())
        };
        Some(Address {
            display_name,
            addr_spec,
        })
    } else {
        let addr_spec = entry.trim().to_string();
        if addr_spec.is_empty() {
            None
        } else {
            Some(Address {
                display_name: None,
                addr_spec,
            })
        }
    }
}

/// Splits on `sep` but not inside `"..."` or `<...>`.
fn split_top_level(s: &str, sep: char) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth_angle = 0i32;
    let mut in_quotes = false;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => depth_angle += 1,
            '>' if !in_quotes => depth_angle -= 1,
            c if c == sep && !in_quotes && depth_angle == 0 => {
                out.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    out.push(&s[start..]);
    out
}

/// `Received-SPF:` header value, per spec §4.F's recognised key set.
#[derive(Debug, Clone, Default)]
pub struct ReceivedSpf {
    pub result: String,
    pub client_ip: Option<String>,
    pub envelope_from: Option<String>,
    pub helo: Option<String>,
    pub identity: Option<String>,
    pub receiver: Option<String>,
    pub mechanism: Option<String>,
    pub problem: Option<String>,
}

/// Parses `<result> (<comment>) key=value key=value ...` leniently: any
/// token before the first `key=value` pair is taken as the result, anything
/// unparsable is skipped rather than failing the whole header (spec §4.F:
/// "forgiving on `Received:` lines").
pub fn parse_received_spf(value: &str) -> ReceivedSpf {
    let mut out = ReceivedSpf::default();
    let mut first = true;

    for token in value.split_whitespace() {
        if let Some((key, val)) = token.split_once('=') {
            let val = val.trim_matches(|c| c == '"' || c == ';').to_string();
            match key.to_ascii_lowercase().as_str() {
                "client-ip" => out.client_ip = Some(val),
                "envelope-from" => out.envelope_from = Some(val),
                "helo" => out.helo = Some(val),
                "identity" => out.identity = Some(val),
                "receiver" => out.receiver = Some(val),
                "mechanism" => out.mechanism = Some(val),
                "problem" => out.problem = Some(val),
                _ => {}
            }
            first = false;
        } else if first {
            out.result = token.trim_end_matches(|c: char| !c.is_alphanumeric()).to_string();
            first = false;
        }
    }
    out
}

/// One `method=result` pair from an `Authentication-Results:` header (RFC
/// 8601), e.g. `spf=pass` or `dkim=fail (bad signature)`.
#[derive(Debug, Clone)]
pub struct AuthResult {
    pub method: String,
    pub result: String,
}

#[derive(Debug, Clone)]
pub struct AuthenticationResults {
    pub authserv_id: String,
    pub results: Vec<AuthResult>,
}

/// Parses `authserv-id; method=result (comment) [props]; method=result ...`.
/// Comments in parentheses and `prop.type=value` qualifiers are ignored.
pub fn parse_authentication_results(value: &str) -> AuthenticationResults {
    let parts = split_top_level_semicolon(value);
    let authserv_id = parts.first().map(|s| s.trim().to_string()).unwrap_or_default();

    let mut results = Vec::new();
    for part in parts.iter().skip(1) {
        let part = strip_comments(part).trim().to_string();
        if part.is_empty() || part.eq_ignore_ascii_case("none") {
            continue;
        }
        let first_token = part.split_whitespace().next().unwrap_or("");
        if let Some((method, result)) = first_token.split_once('=') {
            results.push(AuthResult {
                method: method.to_string(),
                result: result.to_string(),
            });
        }
    }

    AuthenticationResults {
        authserv_id,
        results,
    }
}

fn split_top_level_semicolon(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ';' if depth == 0 => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&s[start..]);
    out
}

fn strip_comments(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut depth = 0i32;
    for c in s.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_headers_and_body() {
        let raw = b"From: a@example.com\r\nSubject: hi\r\n\r\nbody line\r\n";
        let msg = parse(raw);
        assert_eq!(msg.header("from"), Some("a@example.com"));
        assert_eq!(msg.header("Subject"), Some("hi"));
        assert_eq!(msg.body, b"body line\r\n");
    }

    #[test]
    fn unfolds_continuation_lines() {
        let raw = b"Subject: hello\r\n world\r\n\r\nbody";
        let msg = parse(raw);
        assert_eq!(msg.header("subject"), Some("hello world"));
    }

    #[test]
    fn preserves_duplicate_received_headers_in_order() {
        let raw = b"Received: from a\r\nReceived: from b\r\n\r\nbody";
        let msg = parse(raw);
        let received: Vec<_> = msg.headers_named("received").collect();
        assert_eq!(received, vec!["from a", "from b"]);
    }

    #[test]
    fn parses_address_list_with_display_names() {
        let addrs = parse_address_list("\"Alice\" <alice@example.com>, bob@example.org");
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[0].display_name.as_deref(), Some("Alice"));
        assert_eq!(addrs[0].addr_spec, "alice@example.com");
        assert_eq!(addrs[1].addr_spec, "bob@example.org");
    }

    #[test]
    fn parses_received_spf_fields() {
        let spf = parse_received_spf(
            "pass (mybox.example.com: domain of a@example.net designates 1.2.3.4 as permitted sender) client-ip=1.2.3.4; envelope-from=\"a@example.net\"; helo=mail.example.net;",
        );
        assert_eq!(spf.result, "pass");
        assert_eq!(spf.client_ip.as_deref(), Some("1.2.3.4"));
        assert_eq!(spf.envelope_from.as_deref(), Some("a@example.net"));
        assert_eq!(spf.helo.as_deref(), Some("mail.example.net"));
    }

    #[test]
    fn parses_authentication_results() {
        let ar = parse_authentication_results(
            "mx.example.com; spf=pass smtp.mailfrom=example.net; dkim=fail (bad signature) header.d=example.net",
        );
        assert_eq!(ar.authserv_id, "mx.example.com");
        assert_eq!(ar.results.len(), 2);
        assert_eq!(ar.results[0].method, "spf");
        assert_eq!(ar.results[0].result, "pass");
        assert_eq!(ar.results[1].method, "dkim");
        assert_eq!(ar.results[1].result, "fail");
    }
}
