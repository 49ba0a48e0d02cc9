//! The `Runtime` context: everything a component needs that would otherwise
//! live as a file-scope singleton (per spec §9 "Avoiding global state").
//!
//! Configuration, DKIM key material and the DNS resolver's nameserver list
//! are all read once at process start and handed down by reference, rather
//! than reached for through `lazy_static`-style globals.

use crate::config::Config;
use crate::dns::Resolver;
use crate::error::Result;
use rsa::pkcs8::DecodePrivateKey;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::RsaPrivateKey;
use std::sync::Mutex;

pub struct Runtime {
    pub config: Config,
    pub dkim_key: Option<RsaPrivateKey>,
    pub resolver: Mutex<Resolver>,
}

impl Runtime {
    pub fn new(config: Config) -> Result<Self> {
        let dkim_key = match &config.dkim.private_key_path {
            Some(path) => Some(load_private_key(path)?),
            None => None,
        };
        let resolver = Resolver::new(config.dns.clone());
        Ok(Self {
            config,
            dkim_key,
            resolver: Mutex::new(resolver),
        })
    }
}

fn load_private_key(path: &str) -> Result<RsaPrivateKey> {
    let pem = std::fs::read_to_string(path)?;
    RsaPrivateKey::from_pkcs8_pem(&pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&pem))
        .map_err(|e| crate::error::Error::Config(format!("invalid DKIM private key: {e}")))
}
