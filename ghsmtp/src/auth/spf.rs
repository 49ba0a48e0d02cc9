//! SPF ingester (spec §4.G): does not speak SPF to DNS; consumes
//! `Received-SPF:` trace headers already present on the message (added by a
//! prior hop, or by this server's own check when acting as a border MTA),
//! whose `receiver` comment matches the configured server identity.
//!
//! Result-enum shape grounded on `utils/spf.rs`/`authentication/spf.rs`
//! elsewhere in this codebase, rewired to ingest rather than query.

use crate::message::{parse_received_spf, ParsedMessage};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpfOutcome {
    Pass,
    Fail,
    TmpFail,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    MailFrom,
    Helo,
}

#[derive(Debug, Clone)]
pub struct SpfRecord {
    pub domain: String,
    pub outcome: SpfOutcome,
    pub origin: Identity,
}

/// Maps the raw SPF result word onto a DMARC-ready outcome (spec §4.G).
fn map_outcome(result: &str) -> SpfOutcome {
    match result.to_ascii_lowercase().as_str() {
        "pass" => SpfOutcome::Pass,
        "fail" => SpfOutcome::Fail,
        "softfail" => SpfOutcome::TmpFail,
        _ => SpfOutcome::None,
    }
}

/// Extracts and deduplicates `(domain, outcome, origin)` triples from every
/// `Received-SPF:` header whose `receiver` field matches `server_identity`
/// (case-insensitive). Headers with an unparsable domain are skipped.
pub fn ingest(msg: &ParsedMessage, server_identity: &str) -> Vec<SpfRecord> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for value in msg.headers_named("received-spf") {
        let parsed = parse_received_spf(value);

        if let Some(receiver) = &parsed.receiver {
            if !receiver.eq_ignore_ascii_case(server_identity) {
                continue;
            }
        }

        let (domain, origin) = match (&parsed.envelope_from, &parsed.helo) {
            (Some(from), _) => (domain_of(from), Identity::MailFrom),
            (None, Some(helo)) => (helo.clone(), Identity::Helo),
            _ => continue,
        };
        let domain = match domain {
            Some(d) => d,
            None => continue,
        };

        if !seen.insert(domain.to_ascii_lowercase()) {
            continue;
        }

        out.push(SpfRecord {
            domain,
            outcome: map_outcome(&parsed.result),
            origin,
        });
    }

    out
}

fn domain_of(mail_from: &str) -> Option<String> {
    let addr = mail_from.trim_matches(|c| c == '<' || c == '>' || c == '"');
    addr.rsplit_once('@').map(|(_, d)| d.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::parse;

    #[test]
    fn ingests_pass_from_mailfrom() {
        let raw = b"Received-SPF: pass (mx.example.com: domain of a@example.net designates 1.2.3.4 as permitted sender) client-ip=1.2.3.4; envelope-from=\"a@example.net\"; helo=mail.example.net; receiver=mx.example.com;\r\n\r\nbody";
        let msg = parse(raw);
        let records = ingest(&msg, "mx.example.com");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].domain, "example.net");
        assert_eq!(records[0].outcome, SpfOutcome::Pass);
        assert_eq!(records[0].origin, Identity::MailFrom);
    }

    #[test]
    fn skips_headers_for_other_receivers() {
        let raw = b"Received-SPF: pass client-ip=1.2.3.4; envelope-from=a@example.net; receiver=somewhere-else.example;\r\n\r\nbody";
        let msg = parse(raw);
        assert!(ingest(&msg, "mx.example.com").is_empty());
    }

    #[test]
    fn dedups_same_domain() {
        let raw = b"Received-SPF: pass envelope-from=a@example.net; receiver=mx.example.com;\r\nReceived-SPF: fail envelope-from=b@example.net; receiver=mx.example.com;\r\n\r\nbody";
        let msg = parse(raw);
        let records = ingest(&msg, "mx.example.com");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, SpfOutcome::Pass);
    }

    #[test]
    fn maps_softfail_to_tmpfail() {
        assert_eq!(map_outcome("SoftFail"), SpfOutcome::TmpFail);
        assert_eq!(map_outcome("neutral"), SpfOutcome::None);
    }
}
