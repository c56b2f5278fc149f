pub mod rtp;
pub mod sip;
