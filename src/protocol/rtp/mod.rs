pub mod codec;
pub mod dtmf;
pub mod packet;
pub mod rx;
pub mod stream;

pub use codec::{Codec, UnsupportedPayload};
pub use packet::{parse_rtp_packet, RtpPacket, RtpParseError};
