//! RFC 5322 message parsing (spec §4.F): header/body split plus the
//! structured sub-grammars the authentication pipeline consumes.

pub mod parser;

pub use parser::{
    parse, parse_address_list, parse_authentication_results, parse_received_spf, Address,
    AuthResult, AuthenticationResults, Header, ParsedMessage, ReceivedSpf,
};
