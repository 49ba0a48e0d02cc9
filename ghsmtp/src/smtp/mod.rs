//! SMTP protocol layer: receive session state machine, send/submission
//! client state machine, reply formatting, and command parsing shared by
//! both directions (spec §4.J/§4.K).

pub mod client;
pub mod commands;
pub mod reply;
pub mod session;

pub use client::{deliver, resolve_mx, ClientConfig, DeliveryOutcome};
pub use commands::{BodyType, Command, MailParams};
pub use reply::Reply;
pub use session::Session;
