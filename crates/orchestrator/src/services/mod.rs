pub mod message_parser;
pub mod source_verifier;

pub use message_parser::MessageParser;
pub use source_verifier::{HttpSourceVerifier, SourceVerifier, Verification};
