//! ghsmtp: an SMTP receive daemon, SMTP submission/relay client, and the
//! shared authentication/DNS/TLS core they both sit on.
//!
//! # Modules
//!
//! - [`config`]: layered configuration (defaults, TOML file, environment)
//! - [`error`]: the single error enum crossing component boundaries
//! - [`runtime`]: shared per-process context (config, DKIM key, resolver)
//! - [`domain`]: domain name / address-literal handling
//! - [`mailbox`]: RFC 5321 reverse-path / forward-path parsing
//! - [`dns`]: stub resolver over TCP, wire codec, typed records
//! - [`io`]: deadline-bounded socket I/O and line buffering
//! - [`tls`]: STARTTLS, PKIX + DANE/TLSA verification
//! - [`message`]: header/body parsing
//! - [`auth`]: SPF ingestion, DKIM sign/verify, ARC, DMARC
//! - [`smtp`]: the receive session and send client state machines
//! - [`store`]: Maildir-style atomic delivery

pub mod auth;
pub mod config;
pub mod dns;
pub mod domain;
pub mod error;
pub mod io;
pub mod mailbox;
pub mod message;
pub mod runtime;
pub mod smtp;
pub mod store;
pub mod tls;

pub use config::Config;
pub use error::{Error, Result};
pub use runtime::Runtime;
