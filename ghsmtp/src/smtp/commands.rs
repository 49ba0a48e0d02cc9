//! Command-line parsing for the receive state machine (spec §4.J).

#[derive(Debug, Clone, PartialEq)]
pub enum BodyType {
    SevenBit,
    EightBitMime,
    BinaryMime,
}

#[derive(Debug, Clone, Default)]
pub struct MailParams {
    pub body: Option<BodyType>,
    pub smtputf8: bool,
    pub size: Option<usize>,
}

#[derive(Debug, Clone)]
pub enum Command {
    Ehlo(String),
    Helo(String),
    MailFrom { reverse_path: String, params: MailParams },
    RcptTo { forward_path: String },
    Data,
    Bdat { size: usize, last: bool },
    StartTls,
    Rset,
    Noop,
    Vrfy(String),
    Help,
    Quit,
    Unknown(String),
}

/// Parses one command line (already stripped of its CRLF terminator).
pub fn parse(line: &[u8]) -> Command {
    let line = String::from_utf8_lossy(line);
    let line = line.trim_end();
    let (verb, rest) = match line.split_once(' ') {
        Some((v, r)) => (v, r.trim()),
        None => (line, ""),
    };

    match verb.to_ascii_uppercase().as_str() {
        "EHLO" => Command::Ehlo(rest.to_string()),
        "HELO" => Command::Helo(rest.to_string()),
        "MAIL" => parse_mail(rest),
        "RCPT" => parse_rcpt(rest),
        "DATA" => Command::Data,
        "BDAT" => parse_bdat(rest),
        "STARTTLS" => Command::StartTls,
        "RSET" => Command::Rset,
        "NOOP" => Command::Noop,
        "VRFY" => Command::Vrfy(rest.to_string()),
        "HELP" => Command::Help,
        "QUIT" => Command::Quit,
        _ => Command::Unknown(line.to_string()),
    }
}

fn parse_mail(rest: &str) -> Command {
    let rest = rest.strip_prefix("FROM:").or_else(|| rest.strip_prefix("from:")).unwrap_or(rest).trim();
    let (path, param_str) = split_path_and_params(rest);
    let mut params = MailParams::default();
    for tok in param_str.split_whitespace() {
        let (key, val) = tok.split_once('=').unwrap_or((tok, ""));
        match key.to_ascii_uppercase().as_str() {
            "BODY" => {
                params.body = match val.to_ascii_uppercase().as_str() {
                    "7BIT" => Some(BodyType::SevenBit),
                    "8BITMIME" => Some(BodyType::EightBitMime),
                    "BINARYMIME" => Some(BodyType::BinaryMime),
                    _ => None,
                };
            }
            "SMTPUTF8" => params.smtputf8 = true,
            "SIZE" => params.size = val.parse().ok(),
            _ => {}
        }
    }
    Command::MailFrom {
        reverse_path: path,
        params,
    }
}

fn parse_rcpt(rest: &str) -> Command {
    let rest = rest.strip_prefix("TO:").or_else(|| rest.strip_prefix("to:")).unwrap_or(rest).trim();
    let (path, _params) = split_path_and_params(rest);
    Command::RcptTo { forward_path: path }
}

/// Splits `<path> PARAM=VAL PARAM2` on the closing `>` of the path, or on
/// the first space if there's no angle-bracket form (lenient, some clients
/// omit brackets for `<>`).
fn split_path_and_params(s: &str) -> (String, &str) {
    if let Some(rest) = s.strip_prefix('<') {
        if let Some(end) = rest.find('>') {
            return (format!("<{}>", &rest[..end]), rest[end + 1..].trim());
        }
    }
    match s.split_once(' ') {
        Some((p, r)) => (p.to_string(), r.trim()),
        None => (s.to_string(), ""),
    }
}

fn parse_bdat(rest: &str) -> Command {
    let mut parts = rest.split_whitespace();
    let size = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let last = parts.next().map(|s| s.eq_ignore_ascii_case("LAST")).unwrap_or(false);
    Command::Bdat { size, last }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ehlo() {
        assert!(matches!(parse(b"EHLO example.com"), Command::Ehlo(d) if d == "example.com"));
    }

    #[test]
    fn parses_mail_from_with_params() {
        match parse(b"MAIL FROM:<a@b.com> BODY=8BITMIME SIZE=1000 SMTPUTF8") {
            Command::MailFrom { reverse_path, params } => {
                assert_eq!(reverse_path, "<a@b.com>");
                assert_eq!(params.body, Some(BodyType::EightBitMime));
                assert_eq!(params.size, Some(1000));
                assert!(params.smtputf8);
            }
            _ => panic!("expected MailFrom"),
        }
    }

    #[test]
    fn parses_null_reverse_path() {
        match parse(b"MAIL FROM:<>") {
            Command::MailFrom { reverse_path, .. } => assert_eq!(reverse_path, "<>"),
            _ => panic!("expected MailFrom"),
        }
    }

    #[test]
    fn parses_rcpt_to() {
        match parse(b"RCPT TO:<b@c.com>") {
            Command::RcptTo { forward_path } => assert_eq!(forward_path, "<b@c.com>"),
            _ => panic!("expected RcptTo"),
        }
    }

    #[test]
    fn parses_bdat_last() {
        assert!(matches!(parse(b"BDAT 100 LAST"), Command::Bdat { size: 100, last: true }));
        assert!(matches!(parse(b"BDAT 100"), Command::Bdat { size: 100, last: false }));
    }

    #[test]
    fn unknown_verb() {
        assert!(matches!(parse(b"FROBNICATE"), Command::Unknown(_)));
    }
}
