use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;

use crate::media::{Framer, SessionRecorder};
use crate::protocol::rtp::rx::RtpReceiver;
use crate::protocol::rtp::stream::RtpSender;
use crate::protocol::rtp::Codec;
use crate::protocol::sip::{Dialog, SipRequest, SipResponse};

pub const T1: Duration = Duration::from_millis(500);
pub const T2: Duration = Duration::from_secs(4);
/// 64 * T1: how long an INVITE transaction may wait for its final answer or ACK.
pub const TRANSACTION_TIMEOUT: Duration = Duration::from_secs(32);
pub const HANGUP_TIMEOUT: Duration = Duration::from_secs(4);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Ringing,
    Connecting,
    Confirmed,
    Disconnecting,
}

/// Negotiated media of a call.
pub struct Media {
    pub remote: SocketAddr,
    pub rx: RtpReceiver,
    pub tx: RtpSender,
}

impl Media {
    pub fn new(remote: SocketAddr, codec: Codec, dtmf_pt: u8) -> Self {
        Self {
            remote,
            rx: RtpReceiver::new(remote, codec, dtmf_pt),
            tx: RtpSender::new(codec),
        }
    }
}

/// 2xx retransmission schedule of an answered INVITE, doubling from T1 up to T2.
#[derive(Debug)]
pub struct Retransmit {
    next_at: Instant,
    interval: Duration,
    deadline: Instant,
}

impl Retransmit {
    pub fn new(now: Instant) -> Self {
        Self {
            next_at: now + T1,
            interval: T1,
            deadline: now + TRANSACTION_TIMEOUT,
        }
    }

    /// True when the response should be sent again now.
    pub fn poll(&mut self, now: Instant) -> bool {
        if now < self.next_at {
            return false;
        }
        self.interval = (self.interval * 2).min(T2);
        self.next_at = now + self.interval;
        true
    }

    pub fn expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

/// Client side of an INVITE we sent.
#[derive(Debug)]
pub struct OutgoingInvite {
    pub request: SipRequest,
    pub cseq: u32,
    pub auth_tried: bool,
    pub deadline: Instant,
}

/// The single call VIO may hold, from first INVITE to disconnect.
pub struct Call {
    pub phase: CallPhase,
    pub dialog: Dialog,
    pub remote_uri: String,
    /// The INVITE we answer, for UAS calls.
    pub invite: Option<SipRequest>,
    pub last_response: Option<SipResponse>,
    /// Our SDP, offered or answered, reused for re-INVITEs.
    pub local_sdp: Option<String>,
    pub retransmit: Option<Retransmit>,
    pub outgoing: Option<OutgoingInvite>,
    pub connecting_sent: bool,
    pub media: Option<Media>,
    pub recorder: Option<SessionRecorder>,
    pub framer: Framer,
    pub hangup_deadline: Option<Instant>,
}

impl Call {
    pub fn new(dialog: Dialog, remote_uri: String, samples_per_frame: usize) -> Self {
        Self {
            phase: CallPhase::Ringing,
            dialog,
            remote_uri,
            invite: None,
            last_response: None,
            local_sdp: None,
            retransmit: None,
            outgoing: None,
            connecting_sent: false,
            media: None,
            recorder: None,
            framer: Framer::new(samples_per_frame),
            hangup_deadline: None,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.phase == CallPhase::Confirmed
    }

    /// User part of the remote URI, used to name the session directory.
    pub fn remote_user(&self) -> &str {
        self.remote_uri
            .strip_prefix("sip:")
            .and_then(|rest| rest.split('@').next())
            .unwrap_or("unknown")
    }
}
