//! Receive state machine (spec §4.J): one process per connection,
//! single-threaded, synchronous, blocking-with-deadline I/O (spec §5).

use super::commands::{self, BodyType as CmdBodyType, Command};
use super::reply::{self, Reply};
use crate::auth::dkim::{self, SignatureResult as DkimResult};
use crate::auth::{arc, dmarc, spf};
use crate::dns::{QType, Record};
use crate::domain::Domain;
use crate::error::{Error, Result};
use crate::io::{Line, LineReader};
use crate::mailbox::Mailbox;
use crate::message;
use crate::runtime::Runtime;
use crate::store::Store;
use crate::tls::{self, Stream as TlsStream};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::Rng;
use rsa::pkcs8::DecodePublicKey;
use rsa::RsaPublicKey;
use std::fs;
use std::net::{IpAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::info;

const MAX_LINE: usize = 998;

#[derive(Debug, Default)]
struct Envelope {
    reverse_path: Option<String>,
    forward_paths: Vec<String>,
    body_type: Option<CmdBodyType>,
    smtputf8: bool,
    declared_size: Option<usize>,
}

impl Envelope {
    fn reset(&mut self) {
        *self = Envelope::default();
    }
}

/// One accepted connection's session state, generic over nothing: the
/// channel is always `tls::Stream` since STARTTLS must be able to replace
/// plaintext with a TLS-wrapped socket mid-session.
pub struct Session {
    reader: Option<LineReader<TlsStream>>,
    runtime: Arc<Runtime>,
    peer_addr: IpAddr,
    helo_domain: Option<String>,
    envelope: Envelope,
    message_buf: Vec<u8>,
    bdat_seen: bool,
    bdat_error: bool,
    tls_info: Option<tls::TlsInfo>,
    protocol_token: &'static str,
}

impl Session {
    pub fn new(runtime: Arc<Runtime>, sock: TcpStream, peer_addr: IpAddr) -> Self {
        let read_limit = runtime.config.smtp.read_limit;
        let reader = LineReader::new(TlsStream::Plain(sock), MAX_LINE, read_limit);
        Self {
            reader: Some(reader),
            runtime,
            peer_addr,
            helo_domain: None,
            envelope: Envelope::default(),
            message_buf: Vec::new(),
            bdat_seen: false,
            bdat_error: false,
            tls_info: None,
            protocol_token: "SMTP",
        }
    }

    fn command_deadline(&self) -> Instant {
        Instant::now() + self.runtime.config.smtp.command_timeout()
    }

    fn data_deadline(&self) -> Instant {
        Instant::now() + self.runtime.config.smtp.data_timeout()
    }

    /// The active line reader. Only briefly absent, while `handle_starttls`
    /// swaps the underlying socket for a TLS-wrapped one.
    fn io(&mut self) -> &mut LineReader<TlsStream> {
        self.reader.as_mut().expect("session reader missing outside STARTTLS handshake")
    }

    fn reply(&mut self, r: &Reply) -> Result<()> {
        let deadline = self.command_deadline();
        self.io().write_all(&r.to_wire(), deadline)
    }

    /// Drives the whole session to completion: banner, command loop, QUIT.
    pub fn run(&mut self) -> Result<()> {
        if !self.banner()? {
            return Ok(());
        }

        loop {
            let deadline = self.command_deadline();
            let line = match self.io().read_line(deadline) {
                Ok(Line::Ok { bytes, bare_lf }) => {
                    if bare_lf {
                        self.reply(&reply::syntax_error("bare LF not allowed"))?;
                        continue;
                    }
                    bytes
                }
                Ok(Line::TooLong) => {
                    self.reply(&reply::syntax_error("line too long"))?;
                    continue;
                }
                Ok(Line::LimitExceeded) => {
                    self.reply(&reply::transient("too much traffic on this connection"))?;
                    return Ok(());
                }
                Err(Error::IoTimeout) => {
                    let _ = self.reply(&reply::transient("timeout waiting for command"));
                    return Ok(());
                }
                Err(Error::IoEof) => return Ok(()),
                Err(e) => return Err(e),
            };

            let cmd = commands::parse(&line);
            if matches!(cmd, Command::Quit) {
                self.reply(&Reply::new(221, "2.0.0", "bye"))?;
                return Ok(());
            }
            if self.dispatch(cmd)? {
                return Ok(());
            }
        }
    }

    /// Waits up to a random `[min, max]` delay for early client traffic
    /// (spec §4.J). Returns `false` if the session should be torn down
    /// immediately (pre-greeting traffic, a known spam signal).
    fn banner(&mut self) -> Result<bool> {
        let cfg = &self.runtime.config.smtp;
        let wait_ms = rand::thread_rng().gen_range(cfg.banner_delay_min_ms..=cfg.banner_delay_max_ms.max(cfg.banner_delay_min_ms + 1));
        if self.io().input_ready(Duration::from_millis(wait_ms)) {
            let _ = self.reply(&reply::transient("input before greeting"));
            return Ok(false);
        }

        let fqdn = self.runtime.config.server.fqdn.clone();
        self.reply(&Reply::multiline(220, "", vec![format!("{fqdn} ESMTP ghsmtp ready")]))?;
        Ok(true)
    }

    /// Returns `true` if the session should end.
    fn dispatch(&mut self, cmd: Command) -> Result<bool> {
        match cmd {
            Command::Ehlo(domain) => self.handle_helo(&domain, true)?,
            Command::Helo(domain) => self.handle_helo(&domain, false)?,
            Command::MailFrom { reverse_path, params } => self.handle_mail(reverse_path, params)?,
            Command::RcptTo { forward_path } => self.handle_rcpt(forward_path)?,
            Command::Data => self.handle_data()?,
            Command::Bdat { size, last } => self.handle_bdat(size, last)?,
            Command::StartTls => self.handle_starttls()?,
            Command::Rset => {
                self.envelope.reset();
                self.message_buf.clear();
                self.bdat_seen = false;
                self.bdat_error = false;
                self.reply(&reply::ok("reset"))?;
            }
            Command::Noop => self.reply(&reply::ok("noop"))?,
            Command::Vrfy(_) => self.reply(&Reply::new(252, "2.5.2", "cannot verify"))?,
            Command::Help => self.reply(&Reply::new(214, "2.0.0", "see RFC 5321"))?,
            Command::Quit => unreachable!("handled in run()"),
            Command::Unknown(_) => self.reply(&reply::syntax_error("unrecognized command"))?,
        }
        Ok(false)
    }

    fn handle_helo(&mut self, domain: &str, extended: bool) -> Result<()> {
        let parsed = match Domain::parse(domain) {
            Ok(d) if d.label_count() >= 2 || d.is_address_literal() => d,
            _ => {
                self.reply(&reply::syntax_error("invalid domain"))?;
                return Ok(());
            }
        };

        self.envelope.reset();
        self.helo_domain = Some(parsed.ascii().to_string());

        if !extended {
            self.reply(&reply::ok(format!("{} greets {}", self.runtime.config.server.fqdn, parsed.ascii())))?;
            return Ok(());
        }

        let cfg = &self.runtime.config.smtp;
        let mut lines = vec![format!("{} greets {}", self.runtime.config.server.fqdn, parsed.ascii())];
        lines.push(format!("SIZE {}", cfg.max_message_size));
        lines.push("8BITMIME".to_string());
        if self.tls_info.is_none() {
            lines.push("STARTTLS".to_string());
        }
        lines.push("ENHANCEDSTATUSCODES".to_string());
        lines.push("PIPELINING".to_string());
        lines.push("BINARYMIME".to_string());
        lines.push("CHUNKING".to_string());
        lines.push("SMTPUTF8".to_string());
        self.reply(&Reply::multiline(250, "", lines))
    }

    fn handle_mail(&mut self, reverse_path: String, params: commands::MailParams) -> Result<()> {
        if self.helo_domain.is_none() {
            self.reply(&reply::bad_sequence("send HELO/EHLO first"))?;
            return Ok(());
        }
        if self.envelope.reverse_path.is_some() {
            self.reply(&reply::bad_sequence("nested MAIL"))?;
            return Ok(());
        }

        if reverse_path != "<>" && Mailbox::parse(reverse_path.trim_matches(|c| c == '<' || c == '>')).is_err() {
            self.reply(&reply::syntax_error("bad reverse-path"))?;
            return Ok(());
        }

        let max = self.runtime.config.smtp.max_message_size;
        if let Some(size) = params.size {
            if size > max {
                self.reply(&reply::size_exceeded("message too large"))?;
                return Ok(());
            }
        }

        self.envelope.reverse_path = Some(reverse_path);
        self.envelope.body_type = params.body;
        self.envelope.smtputf8 = params.smtputf8;
        self.envelope.declared_size = params.size;
        self.reply(&reply::ok("sender ok"))
    }

    fn handle_rcpt(&mut self, forward_path: String) -> Result<()> {
        if self.envelope.reverse_path.is_none() {
            self.reply(&reply::bad_sequence("send MAIL FROM first"))?;
            return Ok(());
        }

        let inner = forward_path.trim_matches(|c| c == '<' || c == '>');
        if inner.eq_ignore_ascii_case("postmaster") {
            self.envelope.forward_paths.push(forward_path);
            self.reply(&reply::ok("recipient ok"))?;
            return Ok(());
        }

        let mailbox = match Mailbox::parse(inner) {
            Ok(m) => m,
            Err(_) => {
                self.reply(&reply::syntax_error("bad forward-path"))?;
                return Ok(());
            }
        };

        let local_domains = &self.runtime.config.maildir.local_domains;
        let accepted = local_domains.iter().any(|d| d.eq_ignore_ascii_case(mailbox.domain.ascii()));
        if !accepted {
            self.reply(&reply::reject("relay not permitted"))?;
            return Ok(());
        }

        self.envelope.forward_paths.push(forward_path);
        self.reply(&reply::ok("recipient ok"))
    }

    fn handle_data(&mut self) -> Result<()> {
        if self.envelope.body_type == Some(CmdBodyType::BinaryMime) {
            self.reply(&Reply::new(503, "5.5.1", "DATA not valid with BINARYMIME"))?;
            return Ok(());
        }
        if self.envelope.forward_paths.is_empty() {
            self.reply(&reply::bad_sequence("no valid recipients"))?;
            return Ok(());
        }

        self.reply(&reply::start_data())?;
        self.message_buf.clear();

        let max = self.runtime.config.smtp.max_message_size;
        let mut size_error = false;
        loop {
            let deadline = self.data_deadline();
            let line = match self.io().read_line(deadline) {
                Ok(Line::Ok { bytes, .. }) => bytes,
                Ok(Line::TooLong) => {
                    self.message_buf.extend_from_slice(b"\r\n");
                    continue;
                }
                Ok(Line::LimitExceeded) => {
                    self.reply(&reply::transient("too much traffic on this connection"))?;
                    return Ok(());
                }
                Err(Error::IoTimeout) => {
                    let _ = self.reply(&reply::transient("DATA timeout"));
                    return Ok(());
                }
                Err(Error::IoEof) => return Ok(()),
                Err(e) => return Err(e),
            };

            if line == b"." {
                break;
            }

            // transparent dot-stuffing removal (RFC 5321 §4.5.2)
            let line = if line.first() == Some(&b'.') { &line[1..] } else { &line[..] };

            if !size_error && self.message_buf.len() + line.len() + 2 > max {
                size_error = true;
            }
            if !size_error {
                self.message_buf.extend_from_slice(line);
                self.message_buf.extend_from_slice(b"\r\n");
            }
        }

        if size_error {
            self.reply(&reply::size_exceeded("message exceeded maximum size"))?;
            self.envelope.reset();
            self.message_buf.clear();
            return Ok(());
        }

        self.finalize()
    }

    fn handle_bdat(&mut self, size: usize, last: bool) -> Result<()> {
        if self.envelope.forward_paths.is_empty() && !self.bdat_seen {
            self.reply(&reply::bad_sequence("no valid recipients"))?;
            return Ok(());
        }
        if !self.bdat_seen {
            self.message_buf.clear();
            self.bdat_seen = true;
        }

        let deadline = self.data_deadline();
        let chunk = self.io().read_exact_n(size, deadline)?;

        if !self.bdat_error {
            let max = self.runtime.config.smtp.max_message_size;
            if self.message_buf.len() + chunk.len() > max {
                self.bdat_error = true;
            } else {
                self.message_buf.extend_from_slice(&chunk);
            }
        }

        if self.bdat_error {
            self.reply(&reply::size_exceeded("message exceeded maximum size"))?;
            if last {
                self.envelope.reset();
                self.message_buf.clear();
                self.bdat_seen = false;
                self.bdat_error = false;
            }
            return Ok(());
        }

        if last {
            self.bdat_seen = false;
            return self.finalize();
        }

        self.reply(&reply::ok(format!("received {size} octets")))
    }

    fn handle_starttls(&mut self) -> Result<()> {
        if self.tls_info.is_some() {
            self.reply(&reply::bad_sequence("already in TLS"))?;
            return Ok(());
        }
        let Some((cert_path, key_path)) = self.runtime.config.tls.cert_path.clone().zip(self.runtime.config.tls.key_path.clone()) else {
            self.reply(&Reply::new(454, "4.7.0", "TLS not available"))?;
            return Ok(());
        };

        self.reply(&Reply::new(220, "2.0.0", "ready to start TLS"))?;

        // Take the reader (and its socket) out of `self` entirely rather
        // than swapping a placeholder in: there is no cheap dummy
        // `tls::Stream` to hold the slot for the duration of the handshake.
        let reader = self
            .reader
            .take()
            .expect("session reader missing outside STARTTLS handshake");
        let tcp = reader
            .into_stream()
            .into_plain_tcp()
            .ok_or_else(|| Error::Tls("STARTTLS on an already-upgraded channel".into()))?;

        let config = tls::load_server_config(&cert_path, &key_path)?;
        let (upgraded, info) = tls::starttls_server(config, tcp)?;

        let read_limit = self.runtime.config.smtp.read_limit;
        self.reader = Some(LineReader::new(upgraded, MAX_LINE, read_limit));
        self.tls_info = Some(info);
        self.protocol_token = "ESMTPS";

        self.helo_domain = None;
        self.envelope.reset();
        Ok(())
    }

    /// Finalizes an accepted message (spec §4.J "Finalization"): the raw
    /// body is persisted and then frozen so the authentication pipeline
    /// scans a file-backed copy rather than racing whatever next touches
    /// `new/`; trace and `Authentication-Results:`/ARC-Seal headers are
    /// then prepended to that frozen copy and the result is persisted as
    /// the delivered message, with the now-superseded frozen file removed.
    fn finalize(&mut self) -> Result<()> {
        let store = Store::new(&self.runtime.config.maildir.root);
        let raw_path = store.persist(&self.runtime.config.server.fqdn, &self.message_buf, false)?;
        let frozen = store.freeze(&raw_path)?;

        let parsed = message::parse(&frozen.bytes);

        let first_rcpt = self
            .envelope
            .forward_paths
            .first()
            .cloned()
            .unwrap_or_else(|| "<unknown>".to_string());

        let mut trace = String::new();
        trace.push_str(&format!(
            "Return-Path: {}\r\n",
            self.envelope.reverse_path.clone().unwrap_or_else(|| "<>".to_string())
        ));

        let tls_comment = self
            .tls_info
            .as_ref()
            .map(|t| format!(" ({} {})", t.version, t.cipher))
            .unwrap_or_default();
        trace.push_str(&format!(
            "Received: from {} by {} with {}{} for {}; {}\r\n",
            self.helo_domain.as_deref().unwrap_or("unknown"),
            self.runtime.config.server.fqdn,
            self.protocol_token,
            tls_comment,
            first_rcpt,
            format_rfc2822_date(),
        ));

        let spf_records = spf::ingest(&parsed, &self.runtime.config.server.fqdn);

        let dkim_results = self.verify_dkim(&parsed);

        let mut arc_verifier = arc::Verifier::new();
        for h in &parsed.headers {
            arc_verifier.header(&h.name, &h.value);
        }
        arc_verifier.eoh();
        arc_verifier.body(&parsed.body);
        arc_verifier.eom().ok();
        let (chain_status, _custody) = arc_verifier.chain_status(|domain, selector| self.fetch_dkim_public_key(domain, selector));

        let mut dmarc_ctx = dmarc::DmarcContext::new();
        dmarc_ctx.connect(self.peer_addr);
        let from_addrs = message::parse_address_list(parsed.header("from").unwrap_or(""));
        for addr in &from_addrs {
            if let Some((_, domain)) = addr.addr_spec.rsplit_once('@') {
                dmarc_ctx.store_from_domain(domain);
            }
        }
        for rec in &spf_records {
            dmarc_ctx.store_spf(rec.clone());
        }
        for rec in &dkim_results {
            dmarc_ctx.store_dkim(rec.clone());
        }
        let dmarc_records: Vec<dmarc::DmarcRecord> = from_addrs
            .iter()
            .filter_map(|addr| addr.addr_spec.rsplit_once('@').map(|(_, d)| d))
            .filter_map(|d| {
                let mut resolver = self.runtime.resolver.lock().ok()?;
                dmarc::query_dmarc(&mut resolver, d)
            })
            .collect();
        let advice = dmarc_ctx.get_advice(&dmarc_records);

        let ar_value = build_authentication_results(&self.runtime.config.server.fqdn, &spf_records, &dkim_results, chain_status);
        trace.push_str(&format!("Authentication-Results: {ar_value}\r\n"));

        let mut full = trace.into_bytes();
        full.extend_from_slice(&frozen.bytes);

        if let Some(private_key) = &self.runtime.dkim_key {
            let sealer = arc::Sealer::new(
                private_key,
                &self.runtime.config.dkim.domain,
                &self.runtime.config.dkim.selector,
                &arc_verifier,
                chain_status,
            );
            if let Ok(headers) = sealer.seal(&ar_value, &parsed.headers.iter().map(|h| (h.name.clone(), h.value.clone())).collect::<Vec<_>>(), &parsed.body) {
                let mut sealed = Vec::new();
                for (name, value) in headers.iter().rev() {
                    sealed.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
                }
                sealed.extend_from_slice(&full);
                full = sealed;
            }
        }

        let junk = matches!(advice, dmarc::Policy::Reject);
        let path = store.persist(&self.runtime.config.server.fqdn, &full, junk)?;
        let _ = fs::remove_file(&frozen.path);
        info!(path = %path.display(), "message persisted");

        self.envelope.reset();
        self.message_buf.clear();
        self.reply(&reply::ok("message accepted"))
    }

    fn verify_dkim(&self, parsed: &message::ParsedMessage) -> Vec<DkimResult> {
        let headers: Vec<(String, String)> = parsed.headers.iter().map(|h| (h.name.clone(), h.value.clone())).collect();
        let mut results = Vec::new();

        for sig_value in parsed.headers_named("dkim-signature") {
            let fields = dkim::parse_tag_list(sig_value);
            let (Some(domain), Some(selector)) = (fields.get("d"), fields.get("s")) else {
                continue;
            };
            let Some(public_key) = self.fetch_dkim_public_key(domain, selector) else {
                continue;
            };
            results.push(dkim::verify(&headers, &parsed.body, sig_value, &public_key));
        }
        results
    }

    fn fetch_dkim_public_key(&self, domain: &str, selector: &str) -> Option<RsaPublicKey> {
        let name = format!("{selector}._domainkey.{domain}");
        let mut resolver = self.runtime.resolver.lock().ok()?;
        let answer = resolver.query(QType::Txt, &name).ok()?;
        let txt = answer.records.iter().find_map(|r| match &r.record {
            Record::Txt(s) => Some(s.clone()),
            _ => None,
        })?;

        let p_value = txt.split(';').find_map(|tag| {
            let (k, v) = tag.trim().split_once('=')?;
            (k.trim() == "p").then(|| v.trim().to_string())
        })?;
        let der = BASE64.decode(p_value).ok()?;
        RsaPublicKey::from_public_key_der(&der).ok()
    }
}

fn format_rfc2822_date() -> String {
    let now = SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    let dt = chrono::DateTime::<chrono::Utc>::from(std::time::UNIX_EPOCH + now);
    dt.to_rfc2822()
}

fn build_authentication_results(authserv_id: &str, spf: &[spf::SpfRecord], dkim: &[DkimResult], arc_status: arc::ChainStatus) -> String {
    let mut parts = vec![authserv_id.to_string()];
    for rec in spf {
        let word = match rec.outcome {
            spf::SpfOutcome::Pass => "pass",
            spf::SpfOutcome::Fail => "fail",
            spf::SpfOutcome::TmpFail => "softfail",
            spf::SpfOutcome::None => "none",
        };
        parts.push(format!("spf={word} smtp.mailfrom={}", rec.domain));
    }
    for rec in dkim {
        let word = if rec.passed { "pass" } else { "fail" };
        parts.push(format!("dkim={word} header.d={}", rec.domain));
    }
    let arc_word = match arc_status {
        arc::ChainStatus::None => "none",
        arc::ChainStatus::Pass => "pass",
        arc::ChainStatus::Fail => "fail",
        arc::ChainStatus::Unknown => "unknown",
    };
    parts.push(format!("arc={arc_word}"));
    parts.join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authentication_results_lists_each_mechanism() {
        let spf_records = vec![spf::SpfRecord {
            domain: "example.net".to_string(),
            outcome: spf::SpfOutcome::Pass,
            origin: spf::Identity::MailFrom,
        }];
        let value = build_authentication_results("mx.example.com", &spf_records, &[], arc::ChainStatus::None);
        assert!(value.starts_with("mx.example.com; spf=pass smtp.mailfrom=example.net"));
        assert!(value.ends_with("arc=none"));
    }
}
