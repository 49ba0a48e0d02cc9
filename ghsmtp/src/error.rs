//! Error types shared by the receive engine, the send engine, and the
//! authentication pipeline.
//!
//! Every component returns `Result<T>` with values from this single enum
//! rather than letting exceptions (panics) cross component boundaries. The
//! receive state machine maps a variant onto a reply code; the send state
//! machine maps it onto a retry-or-abort decision via `is_transient`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed command or header (RFC 5321/5322 grammar violation).
    #[error("protocol syntax error: {0}")]
    ProtocolSyntax(String),

    /// Command arrived out of the session's state-machine order (e.g. RCPT
    /// before MAIL).
    #[error("protocol order error: {0}")]
    ProtocolOrder(String),

    /// Policy-based rejection: blocklist, relay-denied, unknown recipient.
    #[error("policy reject: {0}")]
    PolicyReject(String),

    /// A size limit (message, line, header block) was exceeded.
    #[error("size limit exceeded: {0}")]
    Size(String),

    /// Recoverable failure: DNS came back bogus, TLS handshake failed for a
    /// reason that might not recur, a deadline expired.
    #[error("transient error: {0}")]
    Transient(String),

    /// Unrecoverable failure for this attempt: DANE mismatch with
    /// enforcement on, authentication failure.
    #[error("permanent error: {0}")]
    Permanent(String),

    /// The peer closed the stream.
    #[error("unexpected end of stream")]
    IoEof,

    /// A deadline expired while waiting on I/O.
    #[error("I/O deadline exceeded")]
    IoTimeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("DNS error: {0}")]
    Dns(String),

    #[error("DKIM error: {0}")]
    Dkim(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid mailbox: {0}")]
    InvalidMailbox(String),

    #[error("invalid domain: {0}")]
    InvalidDomain(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the send engine should try the next MX/address rather than
    /// giving up on the whole delivery attempt. Mirrors spec §7's
    /// per-error-kind propagation rules.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Transient(_) | Error::IoTimeout | Error::IoEof | Error::Dns(_)
        )
    }

    /// The best-effort SMTP reply code a receive session should emit for
    /// this error, independent of any specific command handler.
    pub fn reply_code(&self) -> u16 {
        match self {
            Error::ProtocolSyntax(_) => 500,
            Error::ProtocolOrder(_) => 503,
            Error::PolicyReject(_) => 550,
            Error::Size(_) => 552,
            Error::Transient(_) | Error::IoTimeout | Error::Dns(_) => 421,
            Error::Permanent(_) | Error::Tls(_) | Error::Dkim(_) => 550,
            Error::IoEof => 421,
            Error::Io(_) => 421,
            Error::Config(_) => 421,
            Error::InvalidMailbox(_) | Error::InvalidDomain(_) => 501,
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}
