//! Configuration layer: compiled-in defaults, overridable by a TOML file and
//! then by `GHSMTP_`-prefixed environment variables, following the layering
//! approach of the `config` crate.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub smtp: SmtpConfig,
    pub dns: DnsConfig,
    pub tls: TlsConfig,
    pub dkim: DkimConfig,
    pub maildir: MaildirConfig,
    pub logging: LoggingConfig,
}

/// Server identity, per §4.J's EHLO/Received-header requirements and §6's
/// `GHSMTP_SERVER_ID` environment fallback.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub domain: String,
    pub fqdn: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SmtpConfig {
    pub listen_addr: String,
    pub max_message_size: usize,
    pub read_limit: usize,
    pub command_timeout_secs: u64,
    pub data_timeout_secs: u64,
    /// Lower/upper bound, in milliseconds, of the pre-banner random delay
    /// used to detect clients that speak before being greeted (§4.J).
    pub banner_delay_min_ms: u64,
    pub banner_delay_max_ms: u64,
}

impl SmtpConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn data_timeout(&self) -> Duration {
        Duration::from_secs(self.data_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DnsConfig {
    pub nameservers: Vec<String>,
    pub use_tls: bool,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
    pub enforce_dane: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DkimConfig {
    pub private_key_path: Option<String>,
    pub selector: String,
    pub domain: String,
    /// Overrides the fixed signed-header list of §4.H. `None` preserves the
    /// spec's default set (see `auth::dkim::DEFAULT_SIGNED_HEADERS`).
    pub signed_headers: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MaildirConfig {
    pub root: String,
    /// Recipient domains accepted for local delivery; RCPT TO to any other
    /// domain is relay-denied (§4.J).
    pub local_domains: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Config {
    /// Loads configuration layered: compiled-in defaults, then an optional
    /// file, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            if path.exists() {
                builder = builder.add_source(config::File::from(path));
            }
        }

        let builder = builder.add_source(
            config::Environment::with_prefix("GHSMTP")
                .separator("_")
                .try_parsing(true),
        );

        let settings = builder.build()?;
        let mut cfg: Config = settings.try_deserialize()?;

        if let Ok(fqdn) = std::env::var("GHSMTP_SERVER_ID") {
            cfg.server.fqdn = fqdn;
        }
        if let Ok(root) = std::env::var("MAILDIR") {
            cfg.maildir.root = root;
        }

        Ok(cfg)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.as_ref().display())))?;
        toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))
    }
}

impl Default for Config {
    fn default() -> Self {
        let fqdn = gethostname::gethostname()
            .into_string()
            .unwrap_or_else(|_| "localhost".to_string());
        Self {
            server: ServerConfig {
                domain: "localhost".to_string(),
                fqdn,
            },
            smtp: SmtpConfig {
                listen_addr: "0.0.0.0:2525".to_string(),
                max_message_size: 10 * 1024 * 1024,
                read_limit: 50 * 1024 * 1024,
                command_timeout_secs: 300,
                data_timeout_secs: 600,
                banner_delay_min_ms: 500,
                banner_delay_max_ms: 10_000,
            },
            dns: DnsConfig {
                nameservers: vec!["127.0.0.1:53".to_string()],
                use_tls: false,
                timeout_secs: 5,
            },
            tls: TlsConfig {
                cert_path: None,
                key_path: None,
                enforce_dane: false,
            },
            dkim: DkimConfig {
                private_key_path: None,
                selector: "default".to_string(),
                domain: "localhost".to_string(),
                signed_headers: None,
            },
            maildir: MaildirConfig {
                root: "/tmp/maildir".to_string(),
                local_domains: vec!["localhost".to_string()],
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_self_consistent() {
        let cfg = Config::default();
        assert!(cfg.smtp.max_message_size > 0);
        assert!(cfg.smtp.read_limit >= cfg.smtp.max_message_size);
        assert_eq!(cfg.dkim.selector, "default");
    }

    #[test]
    fn loads_toml_file_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            [server]
            domain = "example.com"
            fqdn = "mail.example.com"

            [smtp]
            listen_addr = "0.0.0.0:25"
            max_message_size = 1000
            read_limit = 2000
            command_timeout_secs = 60
            data_timeout_secs = 120
            banner_delay_min_ms = 500
            banner_delay_max_ms = 10000

            [dns]
            nameservers = ["1.1.1.1:53"]
            use_tls = false
            timeout_secs = 5

            [tls]
            enforce_dane = true

            [dkim]
            selector = "sel1"
            domain = "example.com"

            [maildir]
            root = "/var/mail/example.com"
            local_domains = ["example.com"]

            [logging]
            level = "debug"
            format = "json"
            "#,
        )
        .unwrap();

        let cfg = Config::load(Some(&path)).unwrap();
        assert_eq!(cfg.server.domain, "example.com");
        assert_eq!(cfg.smtp.max_message_size, 1000);
        assert!(cfg.tls.enforce_dane);
    }
}
