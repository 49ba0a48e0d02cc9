//! Message authentication: SPF ingestion, DKIM sign/verify, ARC, DMARC
//! (spec §4.G-§4.I).

pub mod arc;
pub mod dkim;
pub mod dmarc;
pub mod spf;

pub use arc::{ChainStatus, Sealer as ArcSealer, Verifier as ArcVerifier};
pub use dkim::{Signer as DkimSigner, SignatureResult as DkimSignatureResult};
pub use dmarc::{query_dmarc, Alignment as DmarcAlignment, DmarcContext, DmarcRecord, Policy as DmarcPolicy};
pub use spf::{Identity as SpfIdentity, SpfOutcome, SpfRecord};
