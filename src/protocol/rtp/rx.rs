use std::net::SocketAddr;

use log::{debug, warn};

use super::codec::Codec;
use super::dtmf::{DtmfDetector, TelephoneEventReceiver};
use super::packet::parse_rtp_packet;

const MAX_REORDER: u16 = 50;

/// Drops duplicates and packets that arrive behind the highest accepted sequence number.
#[derive(Debug, Default)]
pub struct SequenceWindow {
    highest: Option<u16>,
}

impl SequenceWindow {
    pub fn accept(&mut self, seq: u16) -> bool {
        let Some(highest) = self.highest else {
            self.highest = Some(seq);
            return true;
        };
        let forward = seq.wrapping_sub(highest);
        if forward == 0 {
            return false;
        }
        if forward < 0x8000 {
            self.highest = Some(seq);
            return true;
        }
        if highest.wrapping_sub(seq) <= MAX_REORDER {
            return false;
        }
        // far behind: the sender restarted its sequence
        self.highest = Some(seq);
        true
    }
}

/// Decoded result of one accepted packet.
#[derive(Debug, Default, PartialEq)]
pub struct Received {
    pub samples: Vec<i16>,
    pub digit: Option<char>,
}

/// Inbound media path of one call: peer filter, sequence window, G.711 decode and DTMF.
pub struct RtpReceiver {
    peer: SocketAddr,
    codec: Codec,
    dtmf_pt: u8,
    window: SequenceWindow,
    events: TelephoneEventReceiver,
    inband: DtmfDetector,
}

impl RtpReceiver {
    pub fn new(peer: SocketAddr, codec: Codec, dtmf_pt: u8) -> Self {
        Self {
            peer,
            codec,
            dtmf_pt,
            window: SequenceWindow::default(),
            events: TelephoneEventReceiver::default(),
            inband: DtmfDetector::new(),
        }
    }

    pub fn handle(&mut self, src: SocketAddr, buf: &[u8]) -> Option<Received> {
        if src.ip() != self.peer.ip() {
            debug!("[rtp recv] ignoring packet from unexpected {}", src);
            return None;
        }
        let pkt = match parse_rtp_packet(buf) {
            Ok(pkt) => pkt,
            Err(e) => {
                warn!("[rtp recv] parse error from {}: {}", src, e);
                return None;
            }
        };
        if !self.window.accept(pkt.sequence_number) {
            warn!(
                "[rtp recv] drop late/dup seq={} from {}",
                pkt.sequence_number, src
            );
            return None;
        }
        if pkt.payload_type == self.dtmf_pt {
            return Some(Received {
                samples: Vec::new(),
                digit: self.events.ingest(pkt.timestamp, &pkt.payload),
            });
        }
        if pkt.payload_type != self.codec.payload_type() {
            warn!(
                "[rtp recv] unexpected payload type {} (negotiated {})",
                pkt.payload_type,
                self.codec.encoding_name()
            );
            return None;
        }
        let samples = self.codec.decode(&pkt.payload);
        let digit = self.inband.ingest(&samples);
        Some(Received { samples, digit })
    }
}
