use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use tempfile::tempdir;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use voicehub::config::{
    AsrConfig, AudioConfig, Config, HubConfig, PowerVadConfig, TtsConfig, VadConfig, VioConfig,
};
use voicehub::pipeline::{control_pair, StageLink, VioCommand, VioEvent, AUDIO_CHANNEL_CAPACITY};
use voicehub::protocol::rtp::{parse_rtp_packet, Codec, RtpPacket};
use voicehub::protocol::sip::{parse_sip_message, HeaderAccess, SipMessage, SipResponse};
use voicehub::service::vio::Vio;

type TestResult = Result<(), Box<dyn std::error::Error>>;

const WAIT: Duration = Duration::from_secs(5);

fn config(sessions_dir: PathBuf) -> Config {
    Config {
        audio: AudioConfig {
            sample_rate: 8000,
            samples_per_frame: 160,
        },
        hub: HubConfig {
            main_loop_sleep_time: Duration::from_millis(10),
            last_period_max_num_calls: 50,
            last_period_max_total_time: Duration::from_secs(3 * 60 * 60),
            last_period_max_num_short_calls: 15,
            blacklist_for: Duration::from_secs(7200),
            limit_reached_message: "Limit reached.".to_string(),
            hard_time_limit: Duration::from_secs(900),
            hard_turn_limit: 120,
            input_timeout: Duration::from_secs(10),
            call_db: sessions_dir.join("call_db.json"),
            period: Duration::from_secs(24 * 60 * 60),
            short_call_threshold: Duration::from_secs(5),
            call_back_uri: None,
            call_back_uri_subs: Vec::new(),
            wait_time_before_calling_back: None,
            ncalls: 0,
        },
        vio: VioConfig {
            sip_bind_ip: "127.0.0.1".to_string(),
            sip_port: 0,
            rtp_port: 0,
            local_ip: "127.0.0.1".to_string(),
            advertised_ip: "127.0.0.1".to_string(),
            domain: "example.com".to_string(),
            user: "voicehub".to_string(),
            password: None,
            registrar: None,
            register_expires: 3600,
            allowed_phone_numbers: None,
            forbidden_phone_numbers: None,
            allowed_users: None,
            forbidden_users: None,
            allowed_hosts: None,
            forbidden_hosts: None,
            reject_calls: false,
            sessions_dir,
        },
        vad: VadConfig {
            decision_frames_speech: 15,
            decision_frames_sil: 40,
            decision_speech_threshold: 0.7,
            decision_non_speech_threshold: 0.1,
            speech_buffer_frames: 35,
            power: PowerVadConfig {
                threshold: 300.0,
                threshold_multiplier: 1.0,
                adaptation_frames: 30,
            },
        },
        asr: AsrConfig {
            command: None,
            timeout: Duration::from_secs(10),
        },
        tts: TtsConfig {
            command: None,
            timeout: Duration::from_secs(10),
        },
    }
}

/// The far end of the line: a bare SIP endpoint with its own RTP socket.
struct Phone {
    sip: UdpSocket,
    rtp: UdpSocket,
    hub_sip: SocketAddr,
}

impl Phone {
    async fn connect(hub_sip: SocketAddr) -> std::io::Result<Self> {
        Ok(Self {
            sip: UdpSocket::bind("127.0.0.1:0").await?,
            rtp: UdpSocket::bind("127.0.0.1:0").await?,
            hub_sip,
        })
    }

    fn sip_port(&self) -> u16 {
        self.sip.local_addr().map(|a| a.port()).unwrap_or_default()
    }

    fn invite(&self, call_id: &str) -> String {
        let rtp_port = self.rtp.local_addr().map(|a| a.port()).unwrap_or_default();
        let sdp = format!(
            "v=0\r\no=phone 1 1 IN IP4 127.0.0.1\r\ns=-\r\nc=IN IP4 127.0.0.1\r\nt=0 0\r\n\
             m=audio {} RTP/AVP 0 101\r\na=rtpmap:0 PCMU/8000\r\n\
             a=rtpmap:101 telephone-event/8000\r\n",
            rtp_port
        );
        format!(
            "INVITE sip:voicehub@127.0.0.1 SIP/2.0\r\n\
             Via: SIP/2.0/UDP 127.0.0.1:{port};branch=z9hG4bK-{call_id}-1\r\n\
             Max-Forwards: 70\r\n\
             From: <sip:1000@127.0.0.1>;tag=phone\r\n\
             To: <sip:voicehub@127.0.0.1>\r\n\
             Call-ID: {call_id}\r\n\
             CSeq: 1 INVITE\r\n\
             Contact: <sip:1000@127.0.0.1:{port}>\r\n\
             Content-Type: application/sdp\r\n\
             Content-Length: {len}\r\n\r\n{sdp}",
            port = self.sip_port(),
            call_id = call_id,
            len = sdp.len(),
            sdp = sdp
        )
    }

    fn in_dialog(&self, method: &str, cseq: u32, call_id: &str, to_tag: &str) -> String {
        format!(
            "{method} sip:voicehub@127.0.0.1 SIP/2.0\r\n\
             Via: SIP/2.0/UDP 127.0.0.1:{port};branch=z9hG4bK-{call_id}-{cseq}\r\n\
             Max-Forwards: 70\r\n\
             From: <sip:1000@127.0.0.1>;tag=phone\r\n\
             To: <sip:voicehub@127.0.0.1>;tag={to_tag}\r\n\
             Call-ID: {call_id}\r\n\
             CSeq: {cseq} {method}\r\n\
             Content-Length: 0\r\n\r\n",
            method = method,
            port = self.sip_port(),
            call_id = call_id,
            cseq = cseq,
            to_tag = to_tag
        )
    }

    async fn send(&self, msg: &str) -> std::io::Result<()> {
        self.sip.send_to(msg.as_bytes(), self.hub_sip).await?;
        Ok(())
    }

    async fn response(&self) -> Result<SipResponse, Box<dyn std::error::Error>> {
        let mut buf = vec![0u8; 65_535];
        let (n, _) = tokio::time::timeout(WAIT, self.sip.recv_from(&mut buf)).await??;
        match parse_sip_message(&buf[..n])? {
            SipMessage::Response(resp) => Ok(resp),
            SipMessage::Request(req) => Err(format!("expected a response, got {}", req.method).into()),
        }
    }
}

async fn event(
    link: &mut StageLink<VioCommand, VioEvent>,
    wanted: impl Fn(&VioEvent) -> bool,
) -> Result<VioEvent, Box<dyn std::error::Error>> {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let ev = tokio::time::timeout_at(deadline, link.events.recv())
            .await?
            .ok_or("vio is gone")?;
        if wanted(&ev) {
            return Ok(ev);
        }
    }
}

#[tokio::test]
async fn incoming_call_lifecycle_over_udp() -> TestResult {
    let temp = tempdir()?;
    let sessions_dir = temp.path().join("sessions");
    let cfg = config(sessions_dir.clone());

    let vio = Vio::bind(&cfg).await?;
    let hub_sip = vio.sip_addr()?;
    let hub_rtp = vio.rtp_addr()?;
    let (mut link, ctl) = control_pair("vio");
    let (audio_tx, mut audio_rx) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);
    let (_play_tx, play_rx) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);
    let close = CancellationToken::new();
    let task = tokio::spawn(vio.run(ctl, audio_tx, play_rx, close.clone()));

    let phone = Phone::connect(hub_sip).await?;
    phone.send(&phone.invite("call-1")).await?;
    assert_eq!(phone.response().await?.status_code, 100);
    assert_eq!(phone.response().await?.status_code, 180);
    let ok = phone.response().await?;
    assert_eq!(ok.status_code, 200);
    assert!(ok.body_str().contains("m=audio"));
    let to_tag = ok.to_tag().ok_or("200 OK without To tag")?.to_string();

    event(&mut link, |ev| matches!(ev, VioEvent::IncomingCall { .. })).await?;
    event(&mut link, |ev| matches!(ev, VioEvent::CallConnecting { .. })).await?;

    phone
        .send(&phone.in_dialog("ACK", 1, "call-1", &to_tag))
        .await?;
    let confirmed = event(&mut link, |ev| matches!(ev, VioEvent::CallConfirmed { .. })).await?;
    let VioEvent::CallConfirmed {
        remote_uri,
        session_dir,
    } = confirmed
    else {
        unreachable!();
    };
    assert_eq!(remote_uri, "sip:1000@127.0.0.1");
    let session_dir = session_dir.ok_or("no session directory")?;
    assert!(session_dir.starts_with(&sessions_dir));

    // the line carries silence while nothing is played
    let mut buf = vec![0u8; 2048];
    let (n, src) = tokio::time::timeout(WAIT, phone.rtp.recv_from(&mut buf)).await??;
    assert_eq!(src.port(), hub_rtp.port());
    let pkt = parse_rtp_packet(&buf[..n])?;
    assert_eq!(pkt.payload_type, Codec::Pcmu.payload_type());
    assert_eq!(pkt.payload.len(), 160);

    let speech = Codec::Pcmu.encode(&[1000i16; 160]);
    let packet = RtpPacket::new(0, 1, 0, 0x1234, speech).to_bytes();
    phone.rtp.send_to(&packet, hub_rtp).await?;
    let frame = tokio::time::timeout(WAIT, audio_rx.recv())
        .await?
        .ok_or("no captured audio")?;
    assert_eq!(frame.len(), 160);

    phone
        .send(&phone.in_dialog("BYE", 2, "call-1", &to_tag))
        .await?;
    assert_eq!(phone.response().await?.status_code, 200);
    let disconnected =
        event(&mut link, |ev| matches!(ev, VioEvent::CallDisconnected { .. })).await?;
    assert_eq!(
        disconnected,
        VioEvent::CallDisconnected {
            remote_uri: "sip:1000@127.0.0.1".to_string(),
            code: "200".to_string(),
        }
    );
    assert!(session_dir.join("transcript.jsonl").exists());

    close.cancel();
    tokio::time::timeout(WAIT, task).await???;
    Ok(())
}

#[tokio::test]
async fn blacklisted_caller_gets_busy() -> TestResult {
    let temp = tempdir()?;
    let cfg = config(temp.path().join("sessions"));
    let vio = Vio::bind(&cfg).await?;
    let hub_sip = vio.sip_addr()?;
    let (mut link, ctl) = control_pair("vio");
    let (audio_tx, _audio_rx) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);
    let (_play_tx, play_rx) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);
    let close = CancellationToken::new();
    let task = tokio::spawn(vio.run(ctl, audio_tx, play_rx, close.clone()));

    link.send(VioCommand::BlackList {
        remote_uri: "sip:1000@127.0.0.1".to_string(),
        expire: SystemTime::now() + Duration::from_secs(60),
    });
    let phone = Phone::connect(hub_sip).await?;
    phone.send(&phone.invite("call-2")).await?;
    assert_eq!(phone.response().await?.status_code, 100);
    assert_eq!(phone.response().await?.status_code, 486);
    let rejected = event(&mut link, |ev| {
        matches!(ev, VioEvent::RejectedCallFromBlacklistedUri { .. })
    })
    .await?;
    assert_eq!(
        rejected,
        VioEvent::RejectedCallFromBlacklistedUri {
            remote_uri: "sip:1000@127.0.0.1".to_string()
        }
    );

    link.send(VioCommand::MakeCall {
        destination: "123abc".to_string(),
    });
    let blocked = event(&mut link, |ev| matches!(ev, VioEvent::BlockedUri { .. })).await?;
    assert_eq!(
        blocked,
        VioEvent::BlockedUri {
            remote_uri: "123abc".to_string()
        }
    );

    link.send(VioCommand::Stop);
    tokio::time::timeout(WAIT, task).await???;
    Ok(())
}
