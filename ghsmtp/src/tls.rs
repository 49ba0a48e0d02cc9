//! STARTTLS channel (spec §4.D): synchronous TLS over an already-connected
//! socket. `security/tls.rs` elsewhere in this codebase builds the same
//! `rustls` `ServerConfig` but hands the handshake to
//! `tokio_rustls::TlsAcceptor`; here the blocking `rustls::Connection`
//! state machine is driven directly, since the whole engine is
//! single-threaded synchronous I/O (spec §5).

use crate::dns::Record;
use crate::error::{Error, Result};
use crate::io::TimeoutStream;
use rustls_pemfile::{certs, pkcs8_private_keys};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Either side of a STARTTLS upgrade, kept behind one type so `smtp::session`
/// and `smtp::client` can treat plaintext and TLS uniformly once negotiated.
pub enum Stream {
    Plain(TcpStream),
    Server(rustls::StreamOwned<rustls::ServerConnection, TcpStream>),
    Client(rustls::StreamOwned<rustls::ClientConnection, TcpStream>),
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Stream::Plain(s) => s.read(buf),
            Stream::Server(s) => s.read(buf),
            Stream::Client(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Stream::Plain(s) => s.write(buf),
            Stream::Server(s) => s.write(buf),
            Stream::Client(s) => s.write(buf),
        }
    }
    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Plain(s) => s.flush(),
            Stream::Server(s) => s.flush(),
            Stream::Client(s) => s.flush(),
        }
    }
}

impl TimeoutStream for Stream {
    fn set_timeouts(&self, dur: Duration) -> std::io::Result<()> {
        let sock = match self {
            Stream::Plain(s) => s,
            Stream::Server(s) => &s.sock,
            Stream::Client(s) => &s.sock,
        };
        sock.set_read_timeout(Some(dur))?;
        sock.set_write_timeout(Some(dur))
    }
    fn peek(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let sock = match self {
            Stream::Plain(s) => s,
            Stream::Server(s) => &s.sock,
            Stream::Client(s) => &s.sock,
        };
        sock.peek(buf)
    }
}

impl Stream {
    /// Unwraps a not-yet-upgraded channel back to its raw socket, for the
    /// STARTTLS handshake (spec §4.J/§4.K), which needs to hand the `TcpStream`
    /// to `rustls::StreamOwned::new` directly. `None` once already upgraded.
    pub fn into_plain_tcp(self) -> Option<TcpStream> {
        match self {
            Stream::Plain(s) => Some(s),
            _ => None,
        }
    }
}

/// Negotiated-channel summary, folded into the trace header (spec §4.J) and
/// exposed to the DANE-enforcement decision in `smtp::client`.
#[derive(Debug, Clone)]
pub struct TlsInfo {
    pub cipher: String,
    pub version: String,
    pub peer_verified: bool,
    pub dane_verified: bool,
}

/// Loads a cert chain + key pair from PEM files, producing a `ServerConfig`.
/// Mirrors `TlsConfig::from_pem_files`'s shape elsewhere in this codebase,
/// minus the `Arc` caching wrapper: the config is built once at startup and
/// the `Arc` is handed around from there.
pub fn load_server_config(cert_path: &str, key_path: &str) -> Result<Arc<rustls::ServerConfig>> {
    info!("loading TLS certificate from {cert_path}");

    let cert_file =
        File::open(cert_path).map_err(|e| Error::Tls(format!("opening certificate file: {e}")))?;
    let mut cert_reader = BufReader::new(cert_file);
    let cert_chain = certs(&mut cert_reader)
        .map_err(|e| Error::Tls(format!("reading certificates: {e}")))?
        .into_iter()
        .map(rustls::Certificate)
        .collect::<Vec<_>>();
    if cert_chain.is_empty() {
        return Err(Error::Tls("no certificates found in file".into()));
    }

    let key_file =
        File::open(key_path).map_err(|e| Error::Tls(format!("opening key file: {e}")))?;
    let mut key_reader = BufReader::new(key_file);
    let mut keys = pkcs8_private_keys(&mut key_reader)
        .map_err(|e| Error::Tls(format!("reading private keys: {e}")))?;
    if keys.is_empty() {
        return Err(Error::Tls("no private key found in file".into()));
    }
    let private_key = rustls::PrivateKey(keys.remove(0));

    let config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)
        .map_err(|e| Error::Tls(format!("building server config: {e}")))?;

    debug!("TLS server configuration ready");
    Ok(Arc::new(config))
}

/// Builds a PKIX-validating `ClientConfig` against the Mozilla root store
/// shipped by `webpki-roots` (grounded via wudi-mail-server/crates/smtp),
/// used for the send engine's outbound STARTTLS (spec §4.K).
pub fn client_config() -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.0.iter().map(|ta| {
        rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));
    let config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Arc::new(config)
}

/// Upgrades an accepted connection in place (spec §4.J STARTTLS): the
/// session state resets to pre-EHLO on success, handled by the caller.
pub fn starttls_server(config: Arc<rustls::ServerConfig>, sock: TcpStream) -> Result<(Stream, TlsInfo)> {
    let conn = rustls::ServerConnection::new(config).map_err(|e| Error::Tls(e.to_string()))?;
    let mut tls = rustls::StreamOwned::new(conn, sock);
    // force the handshake: a zero-length write drives `complete_io` until
    // the connection either finishes the handshake or errors.
    tls.flush().map_err(|e| Error::Tls(format!("handshake: {e}")))?;

    let info = tls_info(&tls.conn);
    Ok((Stream::Server(tls), info))
}

/// Upgrades an outbound connection (spec §4.K): PKIX path validation runs
/// during the handshake via `config`; DANE/TLSA is then checked against the
/// leaf certificate presented, per RFC 6698/7671. If `enforce_dane` is set
/// and at least one usable TLSA RR was found but none matched, the
/// connection is torn down even though PKIX succeeded.
pub fn starttls_client(
    config: Arc<rustls::ClientConfig>,
    server_name: &str,
    sock: TcpStream,
    tlsa_rrs: &[Record],
    enforce_dane: bool,
) -> Result<(Stream, TlsInfo)> {
    let name = rustls::ServerName::try_from(server_name)
        .map_err(|_| Error::InvalidDomain(server_name.to_string()))?;
    let conn =
        rustls::ClientConnection::new(config, name).map_err(|e| Error::Tls(e.to_string()))?;
    let mut tls = rustls::StreamOwned::new(conn, sock);
    tls.flush().map_err(|e| Error::Tls(format!("handshake: {e}")))?;

    let mut info = tls_info(&tls.conn);

    let usable: Vec<_> = tlsa_rrs
        .iter()
        .filter(|r| matches!(r, Record::Tlsa { .. }))
        .collect();
    if !usable.is_empty() {
        let leaf = tls
            .conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .ok_or_else(|| Error::Tls("no peer certificate presented".into()))?;
        info.dane_verified = usable.iter().any(|rr| dane_matches(rr, &leaf.0));
        if enforce_dane && !info.dane_verified {
            return Err(Error::Permanent(
                "DANE: no TLSA record matched presented certificate".into(),
            ));
        }
    }

    Ok((Stream::Client(tls), info))
}

/// RFC 6698 §2.1 comparison: selector picks full cert (0) vs SPKI (1);
/// matching_type picks exact match (0), SHA-256 (1), or SHA-512 (2, not
/// supported here — treated as non-matching per the conservative default).
fn dane_matches(rr: &Record, der: &[u8]) -> bool {
    let Record::Tlsa {
        selector,
        matching_type,
        assoc_data,
        ..
    } = rr
    else {
        return false;
    };

    let candidate: Vec<u8> = match selector {
        1 => match x509_parser::certificate::X509Certificate::from_der(der) {
            Ok((_, cert)) => cert.public_key().raw.to_vec(),
            Err(_) => return false,
        },
        _ => der.to_vec(),
    };

    match matching_type {
        0 => &candidate == assoc_data,
        1 => {
            let digest = Sha256::digest(&candidate);
            digest.as_slice() == assoc_data.as_slice()
        }
        _ => {
            warn!("unsupported DANE matching_type {matching_type}, treating as non-match");
            false
        }
    }
}

fn tls_info<C>(conn: &C) -> TlsInfo
where
    C: rustls::ConnectionCommon<rustls::CommonState> + ?Sized,
{
    let version = conn
        .protocol_version()
        .map(|v| format!("{v:?}"))
        .unwrap_or_else(|| "unknown".into());
    let cipher = conn
        .negotiated_cipher_suite()
        .map(|c| format!("{:?}", c.suite()))
        .unwrap_or_else(|| "unknown".into());
    TlsInfo {
        cipher,
        version,
        peer_verified: conn.peer_certificates().is_some(),
        dane_verified: false,
    }
}

/// Self-signed cert generation for development/test setups lacking a real
/// certificate.
pub fn generate_self_signed_cert(domain: &str, cert_out: &str, key_out: &str) -> Result<()> {
    use rcgen::{CertificateParams, DistinguishedName};

    let mut params = CertificateParams::default();
    params.distinguished_name = DistinguishedName::new();
    params.subject_alt_names = vec![rcgen::SanType::DnsName(domain.to_string())];

    let cert = rcgen::Certificate::from_params(params)
        .map_err(|e| Error::Tls(format!("generating certificate: {e}")))?;

    std::fs::write(
        cert_out,
        cert.serialize_pem()
            .map_err(|e| Error::Tls(format!("serializing certificate: {e}")))?,
    )?;
    std::fs::write(key_out, cert.serialize_private_key_pem())?;
    info!("generated self-signed certificate for {domain}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_self_signed_cert_and_loads_it() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");

        generate_self_signed_cert(
            "test.local",
            cert_path.to_str().unwrap(),
            key_path.to_str().unwrap(),
        )
        .unwrap();

        let cert_pem = std::fs::read_to_string(&cert_path).unwrap();
        assert!(cert_pem.contains("BEGIN CERTIFICATE"));

        let config = load_server_config(cert_path.to_str().unwrap(), key_path.to_str().unwrap());
        assert!(config.is_ok());
    }

    #[test]
    fn dane_matches_full_cert_by_sha256() {
        let der = b"fake certificate bytes for test purposes only".to_vec();
        let digest = Sha256::digest(&der);
        let rr = Record::Tlsa {
            cert_usage: 3,
            selector: 0,
            matching_type: 1,
            assoc_data: digest.to_vec(),
        };
        assert!(dane_matches(&rr, &der));
    }

    #[test]
    fn dane_rejects_mismatched_hash() {
        let der = b"fake certificate bytes".to_vec();
        let rr = Record::Tlsa {
            cert_usage: 3,
            selector: 0,
            matching_type: 1,
            assoc_data: vec![0u8; 32],
        };
        assert!(!dane_matches(&rr, &der));
    }
}
