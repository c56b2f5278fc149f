pub mod auth;
pub mod builder;
pub mod dialog;
pub mod message;
pub mod parse;
pub mod register;
pub mod sdp;
pub mod uri;

use thiserror::Error;

pub use builder::{reason_phrase, response_from_request, SipRequestBuilder, SipResponseBuilder};
pub use dialog::{Dialog, DialogRole};
pub use message::{HeaderAccess, SipHeader, SipMessage, SipMethod, SipRequest, SipResponse};
pub use parse::parse_sip_message;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SipParseError {
    #[error("message is not valid UTF-8")]
    NotUtf8,
    #[error("invalid start line: {0}")]
    StartLine(String),
    #[error("invalid header line: {0:?}")]
    Header(String),
}

pub const USER_AGENT: &str = "voicehub/0.1";
pub const ALLOW: &str = "INVITE, ACK, BYE, CANCEL, OPTIONS";

pub fn generate_tag() -> String {
    use rand::Rng;
    format!("{:x}", rand::thread_rng().gen::<u64>())
}

pub fn generate_branch() -> String {
    use rand::Rng;
    format!("z9hG4bK-{:x}", rand::thread_rng().gen::<u64>())
}

pub fn generate_call_id(host: &str) -> String {
    format!("{}@{}", uuid::Uuid::new_v4().simple(), host)
}
