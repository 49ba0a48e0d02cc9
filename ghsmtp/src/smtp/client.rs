//! Send state machine (spec §4.K): resolves MX/TLSA, connects, negotiates
//! extensions, optionally STARTTLS+DANE and AUTH, transfers the message,
//! and quits. One call = one delivery attempt to one recipient domain.

use super::reply::Reply;
use crate::dns::{Answer, QType, Record, Resolver};
use crate::error::{Error, Result};
use crate::io::{Line, LineReader, TimeoutStream};
use crate::tls::{self, Stream as TlsStream};
use std::net::{IpAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::{info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);
const DATA_TIMEOUT: Duration = Duration::from_secs(300);
const MAX_LINE: usize = 998;
const READ_LIMIT: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub require_tls: bool,
    pub force_smtputf8: bool,
    pub auth: Option<(String, String)>,
    /// Bypasses dot-stuffing/CRLF translation; only ever set by test
    /// harnesses that want to push bytes through unmodified ("rawdog").
    pub rawdog: bool,
    /// Mirrors `config::TlsConfig.enforce_dane`: whether a DNSSEC-
    /// authenticated TLSA record with no matching presented certificate
    /// tears the connection down rather than falling back to PKIX alone.
    pub enforce_dane: bool,
    /// Exit after RCPT TO, without sending DATA/BDAT (spec §6 `--nosend`).
    pub nosend: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            require_tls: false,
            force_smtputf8: false,
            auth: None,
            rawdog: false,
            // Matches `config::TlsConfig`'s own default (config.rs):
            // enforcement is an explicit opt-in, not assumed.
            enforce_dane: false,
            nosend: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Extensions {
    starttls: bool,
    size: Option<usize>,
    eightbitmime: bool,
    binarymime: bool,
    chunking: bool,
    pipelining: bool,
    smtputf8: bool,
    auth: Vec<String>,
}

#[derive(Debug)]
pub struct DeliveryOutcome {
    pub mx_host: String,
    pub tls: Option<tls::TlsInfo>,
}

pub struct MxCandidate {
    exchange: String,
    enforce_dane: bool,
}

/// Resolves and ranks MX candidates for `domain` (spec §4.K step 1): real
/// MX records sorted by preference (random order within a tie), falling
/// back to implicit MX (the bare A/AAAA) when none exist. A null MX
/// (preference 0, empty exchange) means the domain refuses mail.
pub fn resolve_mx(resolver: &mut Resolver, domain: &str, cfg: &ClientConfig) -> Result<Vec<MxCandidate>> {
    let answer = resolver.query(QType::Mx, domain)?;
    if answer.bogus_or_indeterminate {
        return Err(Error::Transient(format!("bogus MX answer for {domain}")));
    }

    let mx_rrs: Vec<(u16, String)> = answer
        .records
        .iter()
        .filter_map(|r| match &r.record {
            Record::Mx { preference, exchange } => Some((*preference, exchange.clone())),
            _ => None,
        })
        .collect();

    classify_mx_rrs(domain, mx_rrs, answer.nx_domain, answer.authentic_data, cfg.enforce_dane)
}

/// Pure classification of already-resolved MX RRs, split out from
/// `resolve_mx` so the null-MX/fallback/ordering logic can be tested
/// without a live resolver. `enforce_dane_cfg` is `ClientConfig.
/// enforce_dane`; the per-candidate `enforce_dane` is only ever true when
/// both the operator opted in AND the MX answer carried the DNSSEC AD bit.
fn classify_mx_rrs(
    domain: &str,
    mut mx_rrs: Vec<(u16, String)>,
    nx_domain: bool,
    authentic_data: bool,
    enforce_dane_cfg: bool,
) -> Result<Vec<MxCandidate>> {
    let enforce_dane = enforce_dane_cfg && authentic_data;

    if mx_rrs.is_empty() {
        if nx_domain {
            return Err(Error::Permanent(format!("{domain}: no such domain")));
        }
        return Ok(vec![MxCandidate {
            exchange: domain.to_string(),
            enforce_dane,
        }]);
    }

    if mx_rrs.len() == 1 && mx_rrs[0].0 == 0 && mx_rrs[0].1.is_empty() {
        return Err(Error::Permanent(format!("{domain}: null MX, refuses mail")));
    }

    mx_rrs.sort_by_key(|(pref, _)| *pref);
    Ok(mx_rrs
        .into_iter()
        .filter(|(_, exchange)| !exchange.eq_ignore_ascii_case("localhost"))
        .map(|(_, exchange)| MxCandidate { exchange, enforce_dane })
        .collect())
}

fn resolve_tlsa(resolver: &mut Resolver, host: &str, port: u16) -> Result<Answer> {
    let name = format!("_{port}._tcp.{host}");
    resolver.query(QType::Tlsa, &name)
}

/// Delivers `message` (already containing trace/authentication headers) to
/// one recipient domain, trying each MX candidate in order until one
/// accepts a full transaction. `mx_host`, when set, skips MX resolution
/// entirely and connects directly to that host (spec §6 `--mx_host`); the
/// DANE-enforcement decision can't key off a DNSSEC AD bit it never saw,
/// so enforcement is off for that one candidate regardless of `cfg.
/// enforce_dane`.
pub fn deliver(
    resolver: &mut Resolver,
    from: &str,
    to: &[String],
    message: &[u8],
    cfg: &ClientConfig,
    mx_host: Option<&str>,
) -> Result<DeliveryOutcome> {
    let domain = to
        .first()
        .and_then(|addr| addr.rsplit_once('@'))
        .map(|(_, d)| d.to_string())
        .ok_or_else(|| Error::InvalidMailbox("no recipients".into()))?;

    let candidates = match mx_host {
        Some(host) => vec![MxCandidate {
            exchange: host.to_string(),
            enforce_dane: false,
        }],
        None => resolve_mx(resolver, &domain, cfg)?,
    };
    let mut last_err = Error::Transient("no MX candidates tried".into());

    for candidate in candidates {
        let tlsa = resolve_tlsa(resolver, &candidate.exchange, 25).unwrap_or_default();
        match attempt_one(&candidate, &tlsa.records, from, to, message, cfg) {
            Ok(outcome) => return Ok(outcome),
            Err(e) => {
                warn!(mx = %candidate.exchange, error = %e, "delivery attempt failed, trying next MX");
                last_err = e;
            }
        }
    }

    Err(last_err)
}

fn attempt_one(
    candidate: &MxCandidate,
    tlsa_rrs: &[crate::dns::ResourceRecord],
    from: &str,
    to: &[String],
    message: &[u8],
    cfg: &ClientConfig,
) -> Result<DeliveryOutcome> {
    let tlsa_records: Vec<Record> = tlsa_rrs.iter().map(|r| r.record.clone()).collect();

    let tcp = connect_preferring_v6(&candidate.exchange, 25)?;
    let mut reader = LineReader::new(TlsStream::Plain(tcp), MAX_LINE, READ_LIMIT);

    let greeting = read_multiline_reply(&mut reader)?;
    if !greeting.is_success() {
        return Err(Error::Transient(format!("bad greeting: {}", greeting.code)));
    }

    let mut ext = send_ehlo(&mut reader, &candidate.exchange, cfg.force_smtputf8)?;

    let mut tls_info = None;
    if ext.starttls {
        send_line(&mut reader, b"STARTTLS")?;
        let r = read_multiline_reply(&mut reader)?;
        if r.is_success() {
            let tcp = reader
                .into_stream()
                .into_plain_tcp()
                .ok_or_else(|| Error::Tls("unexpected channel state before STARTTLS".into()))?;
            let config = tls::client_config();
            let (upgraded, info) = tls::starttls_client(
                config,
                &candidate.exchange,
                tcp,
                &tlsa_records,
                candidate.enforce_dane,
            )?;
            tls_info = Some(info);
            reader = LineReader::new(upgraded, MAX_LINE, READ_LIMIT);
            ext = send_ehlo(&mut reader, &candidate.exchange, cfg.force_smtputf8)?;
        }
    } else if cfg.require_tls {
        return Err(Error::Permanent(format!("{}: no STARTTLS and require_tls is set", candidate.exchange)));
    }

    if let Some((user, pass)) = &cfg.auth {
        authenticate(&mut reader, &ext, user, pass)?;
    }

    let size = message.len();
    let body_param = if ext.binarymime {
        " BODY=BINARYMIME"
    } else if ext.eightbitmime {
        " BODY=8BITMIME"
    } else {
        ""
    };
    let smtputf8_param = if ext.smtputf8 && (cfg.force_smtputf8 || !from.is_ascii() || to.iter().any(|t| !t.is_ascii())) {
        " SMTPUTF8"
    } else {
        ""
    };
    let mail_line = format!("MAIL FROM:<{from}>{body_param} SIZE={size}{smtputf8_param}");
    send_line(&mut reader, mail_line.as_bytes())?;
    let r = read_multiline_reply(&mut reader)?;
    if !r.is_success() {
        return Err(Error::Permanent(format!("MAIL FROM rejected: {}", r.code)));
    }

    for rcpt in to {
        send_line(&mut reader, format!("RCPT TO:<{rcpt}>").as_bytes())?;
        let r = read_multiline_reply(&mut reader)?;
        if !r.is_success() {
            return Err(Error::Permanent(format!("RCPT TO {rcpt} rejected: {}", r.code)));
        }
    }

    if cfg.nosend {
        send_line(&mut reader, b"QUIT")?;
        let _ = read_multiline_reply(&mut reader);
        info!(mx = %candidate.exchange, "--nosend: envelope accepted, exiting before DATA");
        return Ok(DeliveryOutcome {
            mx_host: candidate.exchange.clone(),
            tls: tls_info,
        });
    }

    if ext.chunking && !cfg.rawdog {
        send_line(&mut reader, format!("BDAT {size} LAST").as_bytes())?;
        reader.write_all(message, command_deadline())?;
        let r = read_multiline_reply(&mut reader)?;
        if !r.is_success() {
            return Err(Error::Transient(format!("BDAT rejected: {}", r.code)));
        }
    } else {
        send_line(&mut reader, b"DATA")?;
        let r = read_multiline_reply(&mut reader)?;
        if r.code != 354 {
            return Err(Error::Transient(format!("DATA rejected: {}", r.code)));
        }
        let wire = if cfg.rawdog {
            message.to_vec()
        } else {
            dot_stuff_and_terminate(message)
        };
        reader.write_all(&wire, data_deadline())?;
        let r = read_multiline_reply(&mut reader)?;
        if !r.is_success() {
            return Err(Error::Transient(format!("message rejected after DATA: {}", r.code)));
        }
    }

    send_line(&mut reader, b"QUIT")?;
    let _ = read_multiline_reply(&mut reader);

    info!(mx = %candidate.exchange, "message delivered");
    Ok(DeliveryOutcome {
        mx_host: candidate.exchange.clone(),
        tls: tls_info,
    })
}

fn connect_preferring_v6(host: &str, port: u16) -> Result<TcpStream> {
    let addrs: Vec<IpAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::Dns(format!("{host}: {e}")))?
        .map(|a| a.ip())
        .collect();

    let mut ordered = addrs;
    ordered.sort_by_key(|a| matches!(a, IpAddr::V4(_)));

    for addr in ordered {
        if let Ok(stream) = TcpStream::connect_timeout(&(addr, port).into(), CONNECT_TIMEOUT) {
            return Ok(stream);
        }
    }
    Err(Error::Transient(format!("could not connect to any address for {host}")))
}

fn command_deadline() -> Instant {
    Instant::now() + COMMAND_TIMEOUT
}

fn data_deadline() -> Instant {
    Instant::now() + DATA_TIMEOUT
}

fn send_line<S: TimeoutStream>(reader: &mut LineReader<S>, line: &[u8]) -> Result<()> {
    let mut wire = line.to_vec();
    wire.extend_from_slice(b"\r\n");
    reader.write_all(&wire, command_deadline())
}

fn read_multiline_reply<S: TimeoutStream>(reader: &mut LineReader<S>) -> Result<Reply> {
    let mut lines = Vec::new();
    let mut code = 0u16;
    loop {
        let line = match reader.read_line(command_deadline())? {
            Line::Ok { bytes, .. } => bytes,
            Line::TooLong | Line::LimitExceeded => return Err(Error::ProtocolSyntax("reply line too long".into())),
        };
        let text = String::from_utf8_lossy(&line);
        if text.len() < 4 {
            return Err(Error::ProtocolSyntax(format!("malformed reply line: {text}")));
        }
        code = text[..3].parse().map_err(|_| Error::ProtocolSyntax(format!("bad reply code: {text}")))?;
        let sep = text.as_bytes()[3];
        lines.push(text[4..].to_string());
        if sep == b' ' {
            break;
        }
    }
    Ok(Reply::multiline(code, "", lines))
}

fn send_ehlo<S: TimeoutStream>(reader: &mut LineReader<S>, helo_domain: &str, force_smtputf8: bool) -> Result<Extensions> {
    send_line(reader, format!("EHLO {helo_domain}").as_bytes())?;
    let r = read_multiline_reply(reader)?;
    if r.is_success() {
        return Ok(parse_extensions(&r));
    }
    if force_smtputf8 {
        return Err(Error::Permanent(format!("EHLO rejected: {}", r.code)));
    }
    send_line(reader, format!("HELO {helo_domain}").as_bytes())?;
    let r = read_multiline_reply(reader)?;
    if !r.is_success() {
        return Err(Error::Permanent(format!("HELO rejected: {}", r.code)));
    }
    Ok(Extensions::default())
}

fn parse_extensions(reply: &Reply) -> Extensions {
    let mut ext = Extensions::default();
    for line in &reply.lines {
        let mut words = line.split_whitespace();
        let Some(keyword) = words.next() else { continue };
        match keyword.to_ascii_uppercase().as_str() {
            "STARTTLS" => ext.starttls = true,
            "SIZE" => ext.size = words.next().and_then(|s| s.parse().ok()),
            "8BITMIME" => ext.eightbitmime = true,
            "BINARYMIME" => ext.binarymime = true,
            "CHUNKING" => ext.chunking = true,
            "PIPELINING" => ext.pipelining = true,
            "SMTPUTF8" => ext.smtputf8 = true,
            "AUTH" => ext.auth = words.map(|w| w.to_ascii_uppercase()).collect(),
            _ => {}
        }
    }
    ext
}

fn authenticate<S: TimeoutStream>(reader: &mut LineReader<S>, ext: &Extensions, user: &str, pass: &str) -> Result<()> {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

    if ext.auth.iter().any(|m| m == "PLAIN") {
        let creds = format!("\0{user}\0{pass}");
        let line = format!("AUTH PLAIN {}", BASE64.encode(creds));
        send_line(reader, line.as_bytes())?;
        let r = read_multiline_reply(reader)?;
        return if r.is_success() {
            Ok(())
        } else {
            Err(Error::Permanent(format!("AUTH PLAIN failed: {}", r.code)))
        };
    }

    if ext.auth.iter().any(|m| m == "LOGIN") {
        send_line(reader, b"AUTH LOGIN")?;
        read_multiline_reply(reader)?;
        send_line(reader, BASE64.encode(user).as_bytes())?;
        read_multiline_reply(reader)?;
        send_line(reader, BASE64.encode(pass).as_bytes())?;
        let r = read_multiline_reply(reader)?;
        return if r.is_success() {
            Ok(())
        } else {
            Err(Error::Permanent(format!("AUTH LOGIN failed: {}", r.code)))
        };
    }

    Err(Error::Permanent("peer advertises no supported AUTH mechanism".into()))
}

/// Translates a message buffer for the wire: lone LF to CRLF, leading `.`
/// on any line doubled, terminated by `<CRLF>.<CRLF>` (spec §4.K step 9).
fn dot_stuff_and_terminate(message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + 16);
    let mut at_line_start = true;
    let mut i = 0;
    while i < message.len() {
        let b = message[i];
        if b == b'\n' {
            if out.last() != Some(&b'\r') {
                out.push(b'\r');
            }
            out.push(b'\n');
            at_line_start = true;
            i += 1;
            continue;
        }
        if at_line_start && b == b'.' {
            out.push(b'.');
        }
        out.push(b);
        at_line_start = false;
        i += 1;
    }
    if out.last() != Some(&b'\n') {
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_stuffs_leading_dot_and_terminates() {
        let wire = dot_stuff_and_terminate(b"Subject: hi\r\n.leading dot\r\nbody\r\n");
        let text = String::from_utf8(wire).unwrap();
        assert!(text.contains("..leading dot\r\n"));
        assert!(text.ends_with("\r\n.\r\n"));
    }

    #[test]
    fn translates_bare_lf_to_crlf() {
        let wire = dot_stuff_and_terminate(b"a\nb\n");
        assert_eq!(wire, b"a\r\nb\r\n.\r\n");
    }

    #[test]
    fn parses_ehlo_extension_lines() {
        let reply = Reply::multiline(
            250,
            "",
            vec![
                "mx.example.com".to_string(),
                "SIZE 10000000".to_string(),
                "STARTTLS".to_string(),
                "8BITMIME".to_string(),
                "CHUNKING".to_string(),
                "AUTH PLAIN LOGIN".to_string(),
            ],
        );
        let ext = parse_extensions(&reply);
        assert!(ext.starttls);
        assert_eq!(ext.size, Some(10_000_000));
        assert!(ext.eightbitmime);
        assert!(ext.chunking);
        assert_eq!(ext.auth, vec!["PLAIN", "LOGIN"]);
    }

    #[test]
    fn rejects_null_mx() {
        let result = classify_mx_rrs("example.com", vec![(0, String::new())], false, false, true);
        assert!(matches!(result, Err(Error::Permanent(msg)) if msg.contains("null MX")));
    }

    #[test]
    fn falls_back_to_implicit_mx_when_none_found() {
        let candidates = classify_mx_rrs("example.com", vec![], false, true, true).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].exchange, "example.com");
        assert!(candidates[0].enforce_dane);
    }

    #[test]
    fn nxdomain_with_no_mx_rrs_is_permanent_error() {
        let result = classify_mx_rrs("example.invalid", vec![], true, false, true);
        assert!(matches!(result, Err(Error::Permanent(_))));
    }

    #[test]
    fn sorts_by_preference_and_drops_localhost() {
        let candidates = classify_mx_rrs(
            "example.com",
            vec![(20, "b.example.com".to_string()), (10, "a.example.com".to_string()), (5, "localhost".to_string())],
            false,
            false,
            true,
        )
        .unwrap();
        let exchanges: Vec<&str> = candidates.iter().map(|c| c.exchange.as_str()).collect();
        assert_eq!(exchanges, vec!["a.example.com", "b.example.com"]);
    }

    #[test]
    fn config_enforce_dane_false_overrides_dnssec_ad_bit() {
        let candidates = classify_mx_rrs("example.com", vec![], false, true, false).unwrap();
        assert!(!candidates[0].enforce_dane);
    }
}
