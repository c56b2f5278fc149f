//! VoIP I/O stage: one SIP account, at most one call, RTP in both directions.
//!
//! A single task owns both UDP sockets, the call and the play queue. Captured audio leaves
//! as frames towards VAD; audio from TTS is played on a frame clock so utterance
//! notifications can be tied to the samples that actually went out.

pub mod blacklist;
pub mod call;
pub mod destination;
pub mod playback;
mod signaling;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde_json::json;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{Receiver, Sender, UnboundedReceiver};
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::media::SessionRecorder;
use crate::protocol::sip::auth::Credentials;
use crate::protocol::sip::register::{RegisterClient, RegistrarConfig};
use crate::service::pipeline::{drain, Emitter, PlayMsg, StageCtl, VioCommand, VioEvent};
use crate::shared::config::{AudioConfig, Config, VioConfig};
use crate::shared::entities::Frame;
use crate::shared::utils::unix_now;

pub use blacklist::Blacklist;
pub use call::{Call, CallPhase};
pub use destination::{Destination, DestinationPolicy};
pub use playback::{Marker, PlayQueue, PlayStep};

const SIP_TIMER_INTERVAL: Duration = Duration::from_millis(100);
const SIP_RECV_BUFFER: usize = 65_535;
const RTP_RECV_BUFFER: usize = 2048;

/// Bound SIP and RTP sockets, ready to run as the VIO stage.
pub struct Vio {
    vio: VioConfig,
    audio: AudioConfig,
    sip: UdpSocket,
    rtp: UdpSocket,
    registrar: Option<SocketAddr>,
    policy: DestinationPolicy,
}

impl Vio {
    /// Binds both sockets and resolves the registrar. Failures here are fatal at start-up.
    pub async fn bind(cfg: &Config) -> Result<Self> {
        let vio = cfg.vio.clone();
        let sip = UdpSocket::bind((vio.sip_bind_ip.as_str(), vio.sip_port))
            .await
            .with_context(|| format!("bind SIP socket {}:{}", vio.sip_bind_ip, vio.sip_port))?;
        let rtp = UdpSocket::bind((vio.sip_bind_ip.as_str(), vio.rtp_port))
            .await
            .with_context(|| format!("bind RTP socket {}:{}", vio.sip_bind_ip, vio.rtp_port))?;
        let registrar = match vio.registrar.as_deref() {
            Some(raw) => Some(resolve(raw, 5060).await?),
            None => None,
        };
        let policy = DestinationPolicy::from_config(&vio)?;
        log::info!(
            "[vio] SIP on {} RTP on {}",
            sip.local_addr()?,
            rtp.local_addr()?
        );
        Ok(Self {
            vio,
            audio: cfg.audio.clone(),
            sip,
            rtp,
            registrar,
            policy,
        })
    }

    pub fn sip_addr(&self) -> std::io::Result<SocketAddr> {
        self.sip.local_addr()
    }

    pub fn rtp_addr(&self) -> std::io::Result<SocketAddr> {
        self.rtp.local_addr()
    }

    pub async fn run(
        self,
        ctl: StageCtl<VioCommand, VioEvent>,
        audio_out: Sender<Frame>,
        play_rx: Receiver<PlayMsg>,
        close: CancellationToken,
    ) -> Result<()> {
        let (commands, events) = ctl.into_parts();
        let agent = UserAgent::new(self, events, audio_out)?;
        agent.run(commands, play_rx, close).await
    }
}

/// Resolves `host[:port]`.
async fn resolve(raw: &str, default_port: u16) -> Result<SocketAddr> {
    let target = if raw.contains(':') {
        raw.to_string()
    } else {
        format!("{}:{}", raw, default_port)
    };
    let addr = lookup_host(target.as_str())
        .await
        .with_context(|| format!("resolve {}", target))?
        .next();
    addr.ok_or_else(|| anyhow!("no address for {}", target))
}

pub(crate) struct UserAgent {
    cfg: VioConfig,
    audio: AudioConfig,
    sip: Arc<UdpSocket>,
    rtp: Arc<UdpSocket>,
    rtp_port: u16,
    contact: String,
    via_sent_by: String,
    local_aor: String,
    registrar: Option<SocketAddr>,
    register: Option<RegisterClient>,
    credentials: Option<Credentials>,
    policy: DestinationPolicy,
    blacklist: Blacklist,
    call: Option<Call>,
    play: PlayQueue,
    events: Emitter<VioEvent>,
    audio_out: Sender<Frame>,
    sdp_session_id: u64,
}

impl UserAgent {
    fn new(vio: Vio, events: Emitter<VioEvent>, audio_out: Sender<Frame>) -> Result<Self> {
        let sip_port = vio.sip.local_addr()?.port();
        let rtp_port = vio.rtp.local_addr()?.port();
        let cfg = vio.vio;
        let contact = format!("sip:{}@{}:{}", cfg.user, cfg.advertised_ip, sip_port);
        let via_sent_by = format!("{}:{}", cfg.advertised_ip, sip_port);
        let domain = if cfg.domain.is_empty() {
            cfg.advertised_ip.clone()
        } else {
            cfg.domain.clone()
        };
        let local_aor = format!("sip:{}@{}", cfg.user, domain);
        let register = vio.registrar.map(|addr| {
            RegisterClient::new(RegistrarConfig {
                addr,
                domain: domain.clone(),
                user: cfg.user.clone(),
                password: cfg.password.clone(),
                contact_host: cfg.advertised_ip.clone(),
                contact_port: sip_port,
                expires: cfg.register_expires,
            })
        });
        let credentials = cfg.password.clone().map(|password| Credentials {
            username: cfg.user.clone(),
            password,
        });
        Ok(Self {
            audio: vio.audio,
            sip: Arc::new(vio.sip),
            rtp: Arc::new(vio.rtp),
            rtp_port,
            contact,
            via_sent_by,
            local_aor,
            registrar: vio.registrar,
            register,
            credentials,
            policy: vio.policy,
            blacklist: Blacklist::default(),
            call: None,
            play: PlayQueue::default(),
            events,
            audio_out,
            sdp_session_id: rand::random::<u32>() as u64,
            cfg,
        })
    }

    async fn run(
        mut self,
        mut commands: UnboundedReceiver<VioCommand>,
        mut play_rx: Receiver<PlayMsg>,
        close: CancellationToken,
    ) -> Result<()> {
        let sip = self.sip.clone();
        let rtp = self.rtp.clone();
        let mut sip_buf = vec![0u8; SIP_RECV_BUFFER];
        let mut rtp_buf = vec![0u8; RTP_RECV_BUFFER];

        let mut frame_tick = interval(self.audio.frame_duration());
        frame_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sip_tick = interval(SIP_TIMER_INTERVAL);
        sip_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        self.start_registration().await;

        let result = loop {
            tokio::select! {
                biased;
                _ = close.cancelled() => break Ok(()),
                cmd = commands.recv() => {
                    let Some(cmd) = cmd else { break Ok(()) };
                    if !self.on_command(cmd, &mut play_rx).await {
                        break Ok(());
                    }
                }
                _ = frame_tick.tick() => self.on_frame_tick().await,
                res = sip.recv_from(&mut sip_buf) => match res {
                    Ok((n, src)) => self.on_sip_datagram(&sip_buf[..n], src).await,
                    Err(e) => log::warn!("[vio] SIP recv error: {}", e),
                },
                res = rtp.recv_from(&mut rtp_buf) => match res {
                    Ok((n, src)) => self.on_rtp(&rtp_buf[..n], src),
                    Err(e) => log::debug!("[vio] RTP recv error: {}", e),
                },
                msg = play_rx.recv(), if self.play.wants_more() => match msg {
                    Some(msg) => self.on_play(msg),
                    None => {
                        log::debug!("[vio] play channel closed");
                        break Ok(());
                    }
                },
                _ = sip_tick.tick() => {
                    if let Err(e) = self.on_sip_timer().await {
                        break Err(e);
                    }
                }
            }
        };
        self.shutdown().await;
        result
    }

    async fn on_command(&mut self, cmd: VioCommand, play_rx: &mut Receiver<PlayMsg>) -> bool {
        match cmd {
            VioCommand::Stop => {
                drain(play_rx);
                return false;
            }
            VioCommand::Flush => {
                let dropped = drain(play_rx) + self.play.clear();
                if let Some(call) = self.call.as_mut() {
                    call.framer.clear();
                    if let Some(rec) = call.recorder.as_mut() {
                        rec.end_all_utterances();
                    }
                }
                log::debug!("[vio] flushed ({} queued messages dropped)", dropped);
                self.events.emit(VioEvent::Flushed);
            }
            VioCommand::FlushOut => {
                let dropped = drain(play_rx) + self.play.clear();
                if let Some(rec) = self.call.as_mut().and_then(|c| c.recorder.as_mut()) {
                    rec.end_all_utterances();
                }
                log::debug!("[vio] output flushed ({} queued messages dropped)", dropped);
                self.events.emit(VioEvent::FlushedOut);
            }
            VioCommand::MakeCall { destination } => self.make_call(&destination).await,
            VioCommand::Hangup => self.hangup().await,
            VioCommand::BlackList { remote_uri, expire } => {
                self.blacklist.prune(std::time::SystemTime::now());
                self.blacklist.insert(&remote_uri, expire);
                log::info!(
                    "[vio] blacklisted {} until {}",
                    remote_uri,
                    humantime::format_rfc3339_seconds(expire)
                );
            }
            VioCommand::Transfer { destination } => {
                log::info!("[vio] transfer to {} requested, not supported", destination);
            }
            VioCommand::LogAsrHyp { fname, hyp } => {
                let text = hyp.best_text();
                self.log_transcript(json!({
                    "ts": unix_now(),
                    "speaker": "user",
                    "fname": fname,
                    "text": text,
                    "hyp": hyp,
                }));
            }
            VioCommand::LogText { text, user_id } => self.log_transcript(json!({
                "ts": unix_now(),
                "speaker": "system",
                "userId": user_id,
                "text": text,
            })),
        }
        true
    }

    fn log_transcript(&mut self, entry: serde_json::Value) {
        match self.call.as_mut().and_then(|c| c.recorder.as_mut()) {
            Some(rec) => rec.log_transcript(&entry),
            None => log::debug!("[vio] no session for transcript entry"),
        }
    }

    fn on_play(&mut self, msg: PlayMsg) {
        if !self.call.as_ref().is_some_and(Call::is_confirmed) {
            log::debug!("[vio] no confirmed call, dropping play message");
            return;
        }
        self.play.push(msg);
    }

    async fn on_frame_tick(&mut self) {
        let spf = self.audio.samples_per_frame;
        let Some(call) = self.call.as_mut().filter(|c| c.is_confirmed()) else {
            return;
        };
        let Some(media) = call.media.as_mut() else {
            return;
        };
        let step = self.play.next();
        let frame = step
            .frame
            .clone()
            .unwrap_or_else(|| Frame::silence(spf));
        let packet = media.tx.packetize(frame.samples()).to_bytes();
        let remote = media.remote;

        if let Some(rec) = call.recorder.as_mut() {
            apply_markers(rec, &step.before);
            rec.push_played(frame.samples());
            apply_markers(rec, &step.after);
        }

        if let Err(e) = self.rtp.send_to(&packet, remote).await {
            log::warn!("[vio] RTP send to {} failed: {}", remote, e);
            self.finish_call("---");
            return;
        }
        for marker in self.play.played(frame.len()) {
            self.events.emit(match marker {
                Marker::Start { user_id, fname, .. } => {
                    VioEvent::PlayUtteranceStart { user_id, fname }
                }
                Marker::End { user_id, fname, .. } => VioEvent::PlayUtteranceEnd { user_id, fname },
            });
        }
    }

    fn on_rtp(&mut self, buf: &[u8], src: SocketAddr) {
        let Some(call) = self.call.as_mut().filter(|c| c.is_confirmed()) else {
            return;
        };
        let Some(media) = call.media.as_mut() else {
            return;
        };
        let Some(received) = media.rx.handle(src, buf) else {
            return;
        };
        if let Some(digit) = received.digit {
            log::info!("[vio] DTMF digit {}", digit);
            self.events.emit(VioEvent::DtmfDigit { digit });
        }
        if received.samples.is_empty() {
            return;
        }
        if let Some(rec) = call.recorder.as_mut() {
            rec.push_recorded(&received.samples);
        }
        for frame in call.framer.push(&received.samples) {
            match self.audio_out.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => log::debug!("[vio] VAD is behind, frame dropped"),
                Err(TrySendError::Closed(_)) => return,
            }
        }
    }

    /// Marks the current call confirmed, opens its session directory and tells the Hub.
    fn confirm_call(&mut self) {
        let sessions_dir = self.cfg.sessions_dir.clone();
        let sample_rate = self.audio.sample_rate;
        let Some(call) = self.call.as_mut() else {
            return;
        };
        call.phase = CallPhase::Confirmed;
        call.retransmit = None;
        call.recorder = match SessionRecorder::create(
            &sessions_dir,
            call.remote_user(),
            &call.remote_uri,
            sample_rate,
        ) {
            Ok(rec) => Some(rec),
            Err(e) => {
                log::warn!("[vio] session recording disabled: {:#}", e);
                None
            }
        };
        let session_dir = call.recorder.as_ref().map(|r| r.dir().to_path_buf());
        let remote_uri = call.remote_uri.clone();
        self.play.clear();
        log::info!("[vio] call with {} confirmed", remote_uri);
        self.events.emit(VioEvent::CallConfirmed {
            remote_uri,
            session_dir,
        });
    }

    /// Drops the call and everything queued for it, then reports the disconnect.
    fn finish_call(&mut self, code: &str) {
        let Some(mut call) = self.call.take() else {
            return;
        };
        self.play.clear();
        if let Some(rec) = call.recorder.take() {
            match rec.finish() {
                Ok(dir) => log::info!("[vio] session saved to {}", dir.display()),
                Err(e) => log::warn!("[vio] session finalize failed: {:#}", e),
            }
        }
        log::info!(
            "[vio] call with {} disconnected code={}",
            call.remote_uri,
            code
        );
        self.events.emit(VioEvent::CallDisconnected {
            remote_uri: call.remote_uri,
            code: code.to_string(),
        });
    }

    async fn shutdown(&mut self) {
        if self.call.as_ref().is_some_and(|c| {
            matches!(c.phase, CallPhase::Confirmed | CallPhase::Connecting)
        }) {
            self.send_bye(Instant::now()).await;
        }
        self.finish_call("---");
    }
}

fn apply_markers(rec: &mut SessionRecorder, markers: &[Marker]) {
    for marker in markers {
        match marker {
            Marker::Start {
                fname, log: true, ..
            } => rec.begin_utterance(fname),
            Marker::End { fname, .. } => rec.end_utterance(fname),
            Marker::Start { .. } => {}
        }
    }
}
