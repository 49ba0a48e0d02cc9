//! DNS resolver (spec §4.C): TCP message framing, question/answer
//! correlation, label compression, typed record extraction, reverse
//! lookups, FCrDNS.

pub mod message;
pub mod record;
pub mod resolver;

pub use record::{QType, Record, ResourceRecord};
pub use resolver::{Answer, Resolver};
