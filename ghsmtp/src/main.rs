use ghsmtp::config::Config;
use ghsmtp::runtime::Runtime;
use ghsmtp::smtp::Session;
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = if std::path::Path::new("config.toml").exists() {
        Config::from_file("config.toml")?
    } else {
        Config::load(None)?
    };

    init_logging(&config.logging);

    info!(listen_addr = %config.smtp.listen_addr, fqdn = %config.server.fqdn, "starting ghsmtp");

    let runtime = Arc::new(Runtime::new(config)?);
    let listener = TcpListener::bind(&runtime.config.smtp.listen_addr)?;

    for incoming in listener.incoming() {
        let stream = match incoming {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };

        let peer_addr = match stream.peer_addr() {
            Ok(a) => a.ip(),
            Err(e) => {
                warn!(error = %e, "could not read peer address");
                continue;
            }
        };

        let runtime = Arc::clone(&runtime);
        thread::spawn(move || {
            let mut session = Session::new(runtime, stream, peer_addr);
            if let Err(e) = session.run() {
                error!(peer = %peer_addr, error = %e, "session ended with error");
            }
        });
    }

    Ok(())
}

/// Builds on the `FmtSubscriber` setup used elsewhere in this codebase,
/// reading the level/format from config instead of a hardcoded
/// `Level::DEBUG`.
fn init_logging(cfg: &ghsmtp::config::LoggingConfig) {
    let filter = EnvFilter::try_new(&cfg.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    let result = if cfg.format == "json" {
        subscriber.json().try_init()
    } else {
        subscriber.pretty().try_init()
    };

    if let Err(e) = result {
        eprintln!("failed to install tracing subscriber: {e}");
    }
}
