use std::fmt::Write;
use std::net::{IpAddr, SocketAddr};

use crate::protocol::rtp::codec::Codec;

pub const TELEPHONE_EVENT_PT: u8 = 101;

/// The audio part of a remote SDP body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub connection_ip: String,
    pub audio_port: u16,
    pub payload_types: Vec<u8>,
    pub telephone_event: Option<u8>,
}

impl SessionDescription {
    pub fn parse(body: &str) -> Option<Self> {
        let mut session_ip = None;
        let mut media_ip = None;
        let mut audio = None;
        let mut telephone_event = None;
        let mut in_audio = false;

        for line in body.lines().map(str::trim) {
            if let Some(rest) = line.strip_prefix("c=") {
                // c=IN IP4 192.0.2.1
                let ip = rest.split_whitespace().nth(2).map(str::to_string);
                if in_audio {
                    media_ip = ip;
                } else {
                    session_ip = ip;
                }
            } else if let Some(rest) = line.strip_prefix("m=") {
                let mut parts = rest.split_whitespace();
                in_audio = parts.next() == Some("audio");
                if in_audio && audio.is_none() {
                    let port = parts.next()?.parse::<u16>().ok()?;
                    let _proto = parts.next();
                    let pts = parts.filter_map(|p| p.parse::<u8>().ok()).collect::<Vec<_>>();
                    audio = Some((port, pts));
                }
            } else if let Some(rest) = line.strip_prefix("a=rtpmap:") {
                if in_audio {
                    let (pt, encoding) = rest.split_once(' ')?;
                    if encoding
                        .to_ascii_lowercase()
                        .starts_with("telephone-event/8000")
                    {
                        telephone_event = pt.trim().parse::<u8>().ok();
                    }
                }
            }
        }

        let (audio_port, payload_types) = audio?;
        Some(Self {
            connection_ip: media_ip.or(session_ip)?,
            audio_port,
            payload_types,
            telephone_event,
        })
    }

    /// First offered codec we can speak, in offer order.
    pub fn negotiate(&self) -> Option<Codec> {
        self.payload_types
            .iter()
            .find_map(|pt| Codec::from_payload_type(*pt).ok())
    }

    pub fn rtp_addr(&self) -> Option<SocketAddr> {
        let ip: IpAddr = self.connection_ip.parse().ok()?;
        Some(SocketAddr::new(ip, self.audio_port))
    }
}

/// Offer for outgoing calls: PCMU, PCMA and telephone-event.
pub fn build_offer(ip: &str, port: u16, session_id: u64) -> String {
    render(
        ip,
        port,
        session_id,
        &[Codec::Pcmu, Codec::Pcma],
        TELEPHONE_EVENT_PT,
    )
}

/// Answer carrying the single negotiated codec plus telephone-event.
pub fn build_answer(ip: &str, port: u16, session_id: u64, codec: Codec, dtmf_pt: u8) -> String {
    render(ip, port, session_id, &[codec], dtmf_pt)
}

fn render(ip: &str, port: u16, session_id: u64, codecs: &[Codec], dtmf_pt: u8) -> String {
    let mut pts = codecs
        .iter()
        .map(|c| c.payload_type().to_string())
        .collect::<Vec<_>>();
    pts.push(dtmf_pt.to_string());

    let mut out = String::new();
    let _ = write!(out, "v=0\r\n");
    let _ = write!(out, "o=voicehub {0} {0} IN IP4 {1}\r\n", session_id, ip);
    let _ = write!(out, "s=voicehub\r\n");
    let _ = write!(out, "c=IN IP4 {}\r\n", ip);
    let _ = write!(out, "t=0 0\r\n");
    let _ = write!(out, "m=audio {} RTP/AVP {}\r\n", port, pts.join(" "));
    for codec in codecs {
        let _ = write!(
            out,
            "a=rtpmap:{} {}/8000\r\n",
            codec.payload_type(),
            codec.encoding_name()
        );
    }
    let _ = write!(out, "a=rtpmap:{} telephone-event/8000\r\n", dtmf_pt);
    let _ = write!(out, "a=fmtp:{} 0-15\r\n", dtmf_pt);
    let _ = write!(out, "a=ptime:20\r\n");
    let _ = write!(out, "a=sendrecv\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\no=- 1 1 IN IP4 10.0.0.2\r\ns=-\r\nc=IN IP4 10.0.0.2\r\nt=0 0\r\n\
m=audio 40000 RTP/AVP 18 8 0 96\r\na=rtpmap:18 G729/8000\r\na=rtpmap:8 PCMA/8000\r\n\
a=rtpmap:96 telephone-event/8000\r\n";

    #[test]
    fn negotiates_first_supported_codec() {
        let sdp = SessionDescription::parse(OFFER).unwrap();
        assert_eq!(sdp.negotiate(), Some(Codec::Pcma));
        assert_eq!(sdp.telephone_event, Some(96));
        assert_eq!(sdp.rtp_addr(), Some("10.0.0.2:40000".parse().unwrap()));
    }

    #[test]
    fn no_common_codec() {
        let sdp = SessionDescription::parse(&OFFER.replace(" 8 0 96", " 96")).unwrap();
        assert_eq!(sdp.negotiate(), None);
    }

    #[test]
    fn offer_round_trips_through_parser() {
        let sdp = SessionDescription::parse(&build_offer("127.0.0.1", 10000, 7)).unwrap();
        assert_eq!(sdp.payload_types, vec![0, 8, 101]);
        assert_eq!(sdp.telephone_event, Some(101));
    }
}
