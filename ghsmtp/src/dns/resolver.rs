//! Stub resolver (spec §4.C): one persistent connection, 2-byte
//! length-prefixed framing, to the first configured nameserver that
//! answers — plain TCP, or DNS-over-TLS (RFC 7858) when `DnsConfig.
//! use_tls` is set, reusing `tls::client_config()`'s PKIX-validating
//! `rustls::ClientConfig` the same way the send engine's outbound
//! STARTTLS does. Synchronous, deadline-bounded, single-threaded per
//! spec §5 — no async runtime, unlike `utils/dns.rs`'s
//! `trust_dns_resolver`-backed approach elsewhere in this codebase.

use super::message::{build_query, parse_message};
use super::record::{QType, Record, ResourceRecord};
use crate::config::DnsConfig;
use crate::domain::reverse;
use crate::error::{Error, Result};
use crate::tls;
use byteorder::{BigEndian, ByteOrder};
use rand::seq::SliceRandom;
use rand::Rng;
use std::io::{Read, Write};
use std::net::{IpAddr, TcpStream};
use std::time::Duration;

const DOT_PORT: u16 = 853;

/// A nameserver connection, either plain TCP or DNS-over-TLS.
enum Conn {
    Plain(TcpStream),
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
}

impl Read for Conn {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Conn::Plain(s) => s.read(buf),
            Conn::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Conn {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Conn::Plain(s) => s.write(buf),
            Conn::Tls(s) => s.write(buf),
        }
    }
    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Conn::Plain(s) => s.flush(),
            Conn::Tls(s) => s.flush(),
        }
    }
}

#[derive(Debug, Default)]
pub struct Answer {
    pub nx_domain: bool,
    pub bogus_or_indeterminate: bool,
    pub authentic_data: bool,
    pub has_record: bool,
    pub records: Vec<ResourceRecord>,
}

impl Answer {
    fn bogus() -> Self {
        Self {
            bogus_or_indeterminate: true,
            ..Default::default()
        }
    }
}

pub struct Resolver {
    nameservers: Vec<String>,
    use_tls: bool,
    timeout: Duration,
    conn: Option<Conn>,
    conn_server: Option<String>,
}

impl Resolver {
    pub fn new(cfg: DnsConfig) -> Self {
        Self {
            nameservers: cfg.nameservers,
            use_tls: cfg.use_tls,
            timeout: Duration::from_secs(cfg.timeout_secs.max(1)),
            conn: None,
            conn_server: None,
        }
    }

    fn connect_one(&self, server: &str) -> Result<Conn> {
        if !self.use_tls {
            let stream = TcpStream::connect(server).map_err(|e| Error::Dns(e.to_string()))?;
            stream.set_read_timeout(Some(self.timeout)).ok();
            stream.set_write_timeout(Some(self.timeout)).ok();
            return Ok(Conn::Plain(stream));
        }

        let host = server.rsplit_once(':').map(|(h, _)| h).unwrap_or(server);
        let addr = if server.contains(':') && !host.contains(':') {
            format!("{host}:{DOT_PORT}")
        } else {
            server.to_string()
        };
        let stream = TcpStream::connect(&addr).map_err(|e| Error::Dns(e.to_string()))?;
        stream.set_read_timeout(Some(self.timeout)).ok();
        stream.set_write_timeout(Some(self.timeout)).ok();

        let name = rustls::ServerName::try_from(host)
            .map_err(|_| Error::InvalidDomain(host.to_string()))?;
        let conn = rustls::ClientConnection::new(tls::client_config(), name)
            .map_err(|e| Error::Dns(format!("DoT handshake setup: {e}")))?;
        let mut tls_stream = rustls::StreamOwned::new(conn, stream);
        tls_stream
            .flush()
            .map_err(|e| Error::Dns(format!("DoT handshake: {e}")))?;
        Ok(Conn::Tls(Box::new(tls_stream)))
    }

    fn ensure_connected(&mut self) -> Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        let mut order = self.nameservers.clone();
        order.shuffle(&mut rand::thread_rng());
        for server in &order {
            if let Ok(conn) = self.connect_one(server) {
                self.conn = Some(conn);
                self.conn_server = Some(server.clone());
                return Ok(());
            }
        }
        Err(Error::Dns("no nameserver reachable".into()))
    }

    fn send_and_receive(&mut self, wire: &[u8]) -> Result<Vec<u8>> {
        self.ensure_connected()?;
        match self.send_and_receive_once(wire) {
            Ok(buf) => Ok(buf),
            Err(_) => {
                // single reconnect attempt to the next nameserver
                self.conn = None;
                self.ensure_connected()?;
                self.send_and_receive_once(wire)
            }
        }
    }

    fn send_and_receive_once(&mut self, wire: &[u8]) -> Result<Vec<u8>> {
        let stream = self
            .conn
            .as_mut()
            .ok_or_else(|| Error::Dns("not connected".into()))?;

        let mut framed = Vec::with_capacity(wire.len() + 2);
        framed.extend_from_slice(&(wire.len() as u16).to_be_bytes());
        framed.extend_from_slice(wire);
        stream.write_all(&framed)?;

        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf)?;
        let len = BigEndian::read_u16(&len_buf) as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body)?;
        Ok(body)
    }

    /// `query(rr_type, name) -> Answer` (spec §4.C).
    pub fn query(&mut self, qtype: QType, name: &str) -> Result<Answer> {
        let id: u16 = rand::thread_rng().gen();
        let wire = build_query(name, qtype, id);

        let raw = match self.send_and_receive(&wire) {
            Ok(raw) => raw,
            Err(_) => return Ok(Answer::bogus()),
        };

        let msg = match parse_message(&raw, id, name, qtype) {
            Ok(msg) => msg,
            Err(_) => return Ok(Answer::bogus()),
        };

        if msg.header.truncated() {
            return Ok(Answer::bogus());
        }

        let rcode = msg.header.rcode();
        if rcode == 3 {
            return Ok(Answer {
                nx_domain: true,
                authentic_data: msg.header.authentic_data(),
                ..Default::default()
            });
        }
        if rcode != 0 {
            return Ok(Answer::bogus());
        }

        Ok(Answer {
            nx_domain: false,
            bogus_or_indeterminate: false,
            authentic_data: msg.header.authentic_data(),
            has_record: !msg.answers.is_empty(),
            records: msg.answers,
        })
    }

    /// Human-readable strings per record type (§4.C `get_strings`).
    pub fn get_strings(&mut self, qtype: QType, name: &str) -> Result<Vec<String>> {
        let answer = self.query(qtype, name)?;
        Ok(answer.records.iter().map(|r| r.record.as_string()).collect())
    }

    /// Forward-confirmed reverse DNS (§4.C `fcrdns`): resolve the PTRs of
    /// the reversed address, keep only those whose forward A/AAAA lookup
    /// contains `addr`, sorted shortest-name-first.
    pub fn fcrdns(&mut self, addr: IpAddr) -> Result<Vec<String>> {
        let ptr_name = reverse(addr);
        let answer = self.query(QType::Ptr, &ptr_name)?;
        let mut confirmed = Vec::new();

        for rr in &answer.records {
            if let Record::Ptr(host) = &rr.record {
                let fwd_type = match addr {
                    IpAddr::V4(_) => QType::A,
                    IpAddr::V6(_) => QType::Aaaa,
                };
                if let Ok(fwd) = self.query(fwd_type, host) {
                    let matches = fwd.records.iter().any(|r| match &r.record {
                        Record::A(a) => IpAddr::V4(*a) == addr,
                        Record::Aaaa(a) => IpAddr::V6(*a) == addr,
                        _ => false,
                    });
                    if matches {
                        confirmed.push(host.clone());
                    }
                }
            }
        }

        confirmed.sort_by_key(|h| h.len());
        Ok(confirmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolver_without_nameservers_is_bogus() {
        let cfg = DnsConfig {
            nameservers: vec!["127.0.0.1:1".to_string()], // nothing listens here
            use_tls: false,
            timeout_secs: 1,
        };
        let mut r = Resolver::new(cfg);
        let answer = r.query(QType::A, "example.com").unwrap();
        assert!(answer.bogus_or_indeterminate);
    }

    #[test]
    fn dot_resolver_with_unreachable_nameserver_is_bogus() {
        // No TLS handshake ever happens (nothing listens here), but this
        // exercises the `use_tls` connect path rather than the plain one.
        let cfg = DnsConfig {
            nameservers: vec!["127.0.0.1:1".to_string()],
            use_tls: true,
            timeout_secs: 1,
        };
        let mut r = Resolver::new(cfg);
        let answer = r.query(QType::A, "example.com").unwrap();
        assert!(answer.bogus_or_indeterminate);
    }
}
