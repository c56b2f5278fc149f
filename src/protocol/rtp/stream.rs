use rand::Rng;

use super::codec::Codec;
use super::packet::RtpPacket;

/// Outbound stream state: random SSRC, sequence and timestamp advancing per packet.
#[derive(Debug)]
pub struct RtpSender {
    codec: Codec,
    ssrc: u32,
    seq: u16,
    ts: u32,
    first: bool,
}

impl RtpSender {
    pub fn new(codec: Codec) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            codec,
            ssrc: rng.gen(),
            seq: rng.gen(),
            ts: rng.gen(),
            first: true,
        }
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Encodes `samples` into the next packet of the stream.
    pub fn packetize(&mut self, samples: &[i16]) -> RtpPacket {
        let mut pkt = RtpPacket::new(
            self.codec.payload_type(),
            self.seq,
            self.ts,
            self.ssrc,
            self.codec.encode(samples),
        );
        pkt.marker = self.first;
        self.first = false;
        self.seq = self.seq.wrapping_add(1);
        self.ts = self.ts.wrapping_add(samples.len() as u32);
        pkt
    }
}
