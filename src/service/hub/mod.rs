//! The Hub: owns the call, reacts to every stage's events and drives flushes, barge-in,
//! input timeouts, hang-ups and admission control.

pub mod call;
pub mod calldb;
pub mod session_log;

use std::path::PathBuf;
use std::time::SystemTime;

use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::service::pipeline::{
    AsrEvent, DmCommand, DmEvent, NlgEvent, SluEvent, StageCommand, StageLink, TtsEvent,
    TtsText, VadCommand, VadEvent, VioCommand, VioEvent,
};
use crate::shared::config::HubConfig;
use crate::shared::entities::DialogueAct;

pub use call::CallState;
pub use calldb::{CallDb, CallRow, UriStats};
pub use session_log::SessionLog;

/// The system must have been speaking this long before user speech counts as barge-in.
const BARGE_IN_GUARD: Duration = Duration::from_millis(20);
/// Quiet time after the last prompt and the last DM act before a pending hang-up goes out.
const HANGUP_DELAY: Duration = Duration::from_secs(2);
/// DM quiet time required before the hub exits after its last call.
const EXIT_DELAY: Duration = Duration::from_secs(5);

/// The Hub's ends of every stage link, plus the DM → Hub → NLG act path and the
/// Hub's own line into TTS.
pub struct HubLinks {
    pub vio: StageLink<VioCommand, VioEvent>,
    pub vad: StageLink<VadCommand, VadEvent>,
    pub asr: StageLink<StageCommand, AsrEvent>,
    pub slu: StageLink<StageCommand, SluEvent>,
    pub dm: StageLink<DmCommand, DmEvent>,
    pub nlg: StageLink<StageCommand, NlgEvent>,
    pub tts: StageLink<StageCommand, TtsEvent>,
    pub dm_acts: Receiver<DialogueAct>,
    pub nlg_in: Sender<DialogueAct>,
    pub tts_in: Sender<TtsText>,
}

pub struct Hub {
    cfg: HubConfig,
    links: HubLinks,
    call_db: CallDb,
    call: Option<CallState>,
    session: Option<SessionLog>,
    outstanding_act: Option<DialogueAct>,
    last_dm_activity: Option<Instant>,
    call_back: Option<(Instant, String)>,
    ended_calls: u32,
}

impl Hub {
    pub fn new(cfg: HubConfig, links: HubLinks, call_db: CallDb) -> Self {
        Self {
            cfg,
            links,
            call_db,
            call: None,
            session: None,
            outstanding_act: None,
            last_dm_activity: None,
            call_back: None,
            ended_calls: 0,
        }
    }

    /// Runs until `close` fires, a stage goes away, or the configured number of calls is done.
    /// Only the last case stops the stages from here.
    pub async fn run(mut self, close: CancellationToken) -> Result<()> {
        let mut tick = interval(self.cfg.main_loop_sleep_time);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        log::info!("[hub] running");

        loop {
            tokio::select! {
                biased;
                _ = close.cancelled() => return Ok(()),
                _ = tick.tick() => {
                    if self.on_tick(Instant::now()) {
                        break;
                    }
                }
                ev = self.links.vio.events.recv() => self.on_vio(ev.ok_or_else(|| gone("vio"))?),
                ev = self.links.vad.events.recv() => self.on_vad(ev.ok_or_else(|| gone("vad"))?),
                ev = self.links.asr.events.recv() => self.on_asr(ev.ok_or_else(|| gone("asr"))?),
                ev = self.links.slu.events.recv() => self.on_slu(ev.ok_or_else(|| gone("slu"))?),
                ev = self.links.dm.events.recv() => self.on_dm(ev.ok_or_else(|| gone("dm"))?),
                act = self.links.dm_acts.recv() => {
                    self.on_dm_act(act.ok_or_else(|| gone("dm"))?)
                }
                ev = self.links.nlg.events.recv() => self.on_nlg(ev.ok_or_else(|| gone("nlg"))?),
                ev = self.links.tts.events.recv() => self.on_tts(ev.ok_or_else(|| gone("tts"))?),
            }
        }

        log::info!("[hub] {} calls done, stopping", self.ended_calls);
        self.links.vio.send(VioCommand::Stop);
        self.links.vad.send(VadCommand::Stop);
        self.links.asr.send(StageCommand::Stop);
        self.links.slu.send(StageCommand::Stop);
        self.links.dm.send(DmCommand::Stop);
        self.links.nlg.send(StageCommand::Stop);
        self.links.tts.send(StageCommand::Stop);
        Ok(())
    }

    fn on_vio(&mut self, ev: VioEvent) {
        log::debug!("[hub] vio: {:?}", ev);
        let now = Instant::now();
        match ev {
            VioEvent::IncomingCall { remote_uri } => {
                log::info!("[hub] incoming call from {}", remote_uri)
            }
            VioEvent::RejectedCall { remote_uri } => {
                log::info!("[hub] call with {} was rejected", remote_uri);
                if let Some(wait) = self.cfg.wait_time_before_calling_back {
                    let destination = call_back_destination(&self.cfg, &remote_uri);
                    log::info!("[hub] calling {} back in {:?}", destination, wait);
                    self.call_back = Some((now + wait, destination));
                }
            }
            VioEvent::RejectedCallFromBlacklistedUri { remote_uri } => {
                let stats = self.uri_stats(&remote_uri);
                log::info!(
                    "{}",
                    stats.report(
                        &format!("Rejected incoming call from blacklisted URI: {}", remote_uri),
                        Some("CALL REJECTED"),
                    )
                );
            }
            VioEvent::BlockedUri { remote_uri } => {
                log::warn!("[hub] {} is not an allowed destination", remote_uri)
            }
            VioEvent::CallConnecting { remote_uri } => {
                log::info!("[hub] connecting call with {}", remote_uri)
            }
            VioEvent::CallConfirmed {
                remote_uri,
                session_dir,
            } => self.on_call_confirmed(remote_uri, session_dir, now),
            VioEvent::CallDisconnected { remote_uri, code } => {
                self.on_call_disconnected(remote_uri, code)
            }
            VioEvent::PlayUtteranceStart { fname, .. } => {
                if let Some(call) = self.call.as_mut() {
                    call.system_speaking = true;
                    call.system_last_speech = Some(now);
                }
                note(&mut self.session, "play_start", json!({ "fname": fname }));
            }
            VioEvent::PlayUtteranceEnd { fname, .. } => {
                if let Some(call) = self.call.as_mut() {
                    call.system_speaking = false;
                    call.system_last_speech = Some(now);
                }
                note(&mut self.session, "play_end", json!({ "fname": fname }));
            }
            VioEvent::DtmfDigit { digit } => {
                log::info!("[hub] DTMF {}", digit);
                note(&mut self.session, "dtmf", json!({ "digit": digit.to_string() }));
            }
            VioEvent::Flushed => {
                self.links.vad.send(VadCommand::Flush);
            }
            VioEvent::FlushedOut => {
                if let Some(act) = self.outstanding_act.take() {
                    log::debug!("[hub] dispatching held act {}", act);
                    self.dispatch(act);
                }
            }
        }
    }

    fn on_call_confirmed(
        &mut self,
        remote_uri: String,
        session_dir: Option<PathBuf>,
        now: Instant,
    ) {
        let stats = self.uri_stats(&remote_uri);
        let over_limit = self.over_limits(&stats);

        self.session = session_dir.as_deref().and_then(|dir| {
            SessionLog::open(dir)
                .map_err(|e| log::warn!("[hub] session log disabled: {}", e))
                .ok()
        });
        note(
            &mut self.session,
            "session_start",
            json!({ "remote_uri": remote_uri }),
        );
        self.links.vad.send(VadCommand::SessionDir(session_dir));

        let verdict = if over_limit {
            self.call = Some(CallState::over_limit(remote_uri.clone(), now));
            note(&mut self.session, "turn", json!({ "speaker": "system" }));
            let mut text = TtsText::new(self.cfg.limit_reached_message.clone());
            text.log = true;
            if let Err(e) = self.links.tts_in.try_send(text) {
                log::warn!("[hub] limit message not sent: {}", e);
            }
            self.links.vio.send(VioCommand::BlackList {
                remote_uri: remote_uri.clone(),
                expire: SystemTime::now() + self.cfg.blacklist_for,
            });
            "CALL REJECTED"
        } else {
            self.call = Some(CallState::accepted(remote_uri.clone(), now));
            self.links.dm.send(DmCommand::NewDialogue);
            "CALL ACCEPTED"
        };
        log::info!(
            "{}",
            stats.report(
                &format!("Incoming call from :          {}", remote_uri),
                Some(verdict)
            )
        );
        note(
            &mut self.session,
            "admission",
            json!({
                "verdict": verdict,
                "period_calls": stats.period_calls,
                "period_time": stats.period_time.as_secs_f64(),
                "period_short_calls": stats.period_short_calls,
            }),
        );

        if let Err(e) = self.call_db.track_confirmed_call(&remote_uri) {
            log::warn!("[calldb] cannot record call from {}: {}", remote_uri, e);
        }
    }

    fn on_call_disconnected(&mut self, remote_uri: String, code: String) {
        // drop whatever the pipeline still holds for this call
        self.links.vio.send(VioCommand::Flush);

        note(&mut self.session, "session_end", json!({ "code": code }));
        self.session = None;
        self.links.vad.send(VadCommand::SessionDir(None));

        if let Err(e) = self.call_db.track_disconnected_call(&remote_uri) {
            log::warn!("[calldb] cannot complete call from {}: {}", remote_uri, e);
        }
        if let Some(call) = self.call.take() {
            log::info!(
                "[hub] call with {} ended after {:?} code={}",
                remote_uri,
                call.started_at.elapsed(),
                code
            );
        }
        self.outstanding_act = None;
        self.ended_calls += 1;
        self.links.dm.send(DmCommand::PrepareNewDialogue);
    }

    fn on_vad(&mut self, ev: VadEvent) {
        log::debug!("[hub] vad: {:?}", ev);
        let now = Instant::now();
        match ev {
            VadEvent::SpeechStart { fname } => {
                note(&mut self.session, "speech_start", json!({ "fname": fname }));
                let Some(call) = self.call.as_mut() else { return };
                call.user_speaking = true;
                if call.system_speaking && call.since_system_speech(now) > BARGE_IN_GUARD {
                    log::info!("[hub] user barge-in");
                    self.interrupt_system("user", now);
                }
            }
            VadEvent::SpeechEnd { fname } => {
                note(&mut self.session, "speech_end", json!({ "fname": fname }));
                if let Some(call) = self.call.as_mut() {
                    call.user_speaking = false;
                    call.user_last_speech = now;
                }
            }
            VadEvent::Flushed => {
                self.links.asr.send(StageCommand::Flush);
            }
        }
    }

    fn on_asr(&mut self, ev: AsrEvent) {
        match ev {
            AsrEvent::Hypothesis { fname, hyp } => {
                note(
                    &mut self.session,
                    "asr_hyp",
                    json!({ "fname": fname, "text": hyp.best_text() }),
                );
                self.links.vio.send(VioCommand::LogAsrHyp { fname, hyp });
            }
            AsrEvent::AsrStart { fname } => log::debug!("[hub] asr started on {}", fname),
            AsrEvent::AsrEnd { fname } => log::debug!("[hub] asr done with {}", fname),
            AsrEvent::Flushed => {
                self.links.slu.send(StageCommand::Flush);
            }
        }
    }

    fn on_slu(&mut self, ev: SluEvent) {
        match ev {
            SluEvent::Flushed => {
                self.links.dm.send(DmCommand::Flush);
                self.links.dm.send(DmCommand::EndDialogue);
            }
        }
    }

    fn on_dm(&mut self, ev: DmEvent) {
        log::debug!("[hub] dm: {:?}", ev);
        match ev {
            DmEvent::Hangup => self.request_hangup("dm"),
            DmEvent::Flushed => {
                self.links.nlg.send(StageCommand::Flush);
            }
        }
    }

    fn on_dm_act(&mut self, act: DialogueAct) {
        let now = Instant::now();
        self.last_dm_activity = Some(now);
        if let Some(call) = self.call.as_mut() {
            call.count_turn();
        }
        if act.is_silence() {
            return;
        }
        note(
            &mut self.session,
            "dialogue_act",
            json!({ "act": act.to_string() }),
        );

        let speaking = self
            .call
            .as_ref()
            .is_some_and(|c| c.system_speaking && c.since_system_speech(now) > BARGE_IN_GUARD);
        if speaking {
            // the new act waits until the output side is empty
            self.interrupt_system("system", now);
            self.outstanding_act = Some(act);
        } else {
            self.dispatch(act);
        }
    }

    fn on_nlg(&mut self, ev: NlgEvent) {
        match ev {
            NlgEvent::Text(text) => {
                note(&mut self.session, "turn", json!({ "speaker": "system" }));
                note(&mut self.session, "system_text", json!({ "text": text.text }));
                self.links.vio.send(VioCommand::LogText {
                    text: text.text,
                    user_id: text.user_id,
                });
            }
            NlgEvent::Hangup => self.request_hangup("nlg"),
            NlgEvent::Flushed => {
                self.links.tts.send(StageCommand::Flush);
            }
        }
    }

    fn on_tts(&mut self, ev: TtsEvent) {
        match ev {
            TtsEvent::TtsStart { text } => log::debug!("[hub] tts started ({} chars)", text.len()),
            TtsEvent::TtsEnd => log::debug!("[hub] tts done"),
            TtsEvent::Hangup => self.request_hangup("tts"),
            TtsEvent::Flushed => {
                self.links.vio.send(VioCommand::FlushOut);
            }
        }
    }

    /// Soft hang-up: goes out once the system is quiet, see `on_tick`.
    fn request_hangup(&mut self, by: &str) {
        if let Some(call) = self.call.as_mut() {
            call.hangup_pending = true;
            note(&mut self.session, "hangup_requested", json!({ "by": by }));
        }
    }

    /// Periodic checks. Returns true once the hub should exit.
    fn on_tick(&mut self, now: Instant) -> bool {
        if self.call_back.as_ref().is_some_and(|(at, _)| *at <= now) {
            if let Some((_, destination)) = self.call_back.take() {
                log::info!("[hub] calling back {}", destination);
                self.links.vio.send(VioCommand::MakeCall { destination });
            }
        }

        let dm_quiet_for =
            |d: Duration| self.last_dm_activity.map_or(true, |t| now.duration_since(t) > d);
        let dm_settled = dm_quiet_for(HANGUP_DELAY);
        let dm_done = dm_quiet_for(EXIT_DELAY);

        if let Some(call) = self.call.as_mut() {
            if let Some(silence_time) = call.input_timeout(now, self.cfg.input_timeout) {
                call.user_last_timeout = now;
                log::info!("[hub] input timeout after {:?}", silence_time);
                note(
                    &mut self.session,
                    "timeout",
                    json!({ "silence_time": silence_time.as_secs_f64() }),
                );
                self.links.dm.send(DmCommand::Timeout { silence_time });
            }

            if call.hangup_pending
                && dm_settled
                && !call.system_speaking
                && call.since_system_speech(now) > HANGUP_DELAY
            {
                call.hangup_pending = false;
                log::info!("[hub] hanging up {}", call.remote_uri);
                note(&mut self.session, "hangup", json!({ "reason": "requested" }));
                self.links.vio.send(VioCommand::Hangup);
            }

            if call.over_hard_limits(now, self.cfg.hard_time_limit, self.cfg.hard_turn_limit) {
                call.turns = None;
                log::warn!("[hub] hard limits reached, hanging up {}", call.remote_uri);
                note(&mut self.session, "hangup", json!({ "reason": "hard_limit" }));
                self.links.vio.send(VioCommand::Hangup);
            }
        }

        self.cfg.ncalls != 0
            && self.call.is_none()
            && dm_done
            && self.ended_calls >= self.cfg.ncalls
    }

    /// Cuts the system short: the flush runs NLG → TTS → VIO output.
    fn interrupt_system(&mut self, who: &str, now: Instant) {
        note(&mut self.session, "barge_in", json!({ "who": who }));
        self.links.nlg.send(StageCommand::Flush);
        if let Some(call) = self.call.as_mut() {
            call.system_speaking = false;
            call.system_last_speech = Some(now);
        }
    }

    fn dispatch(&self, act: DialogueAct) {
        match self.links.nlg_in.try_send(act) {
            Ok(()) => {}
            Err(TrySendError::Full(act)) => log::warn!("[hub] NLG is behind, {} dropped", act),
            Err(TrySendError::Closed(_)) => log::debug!("[hub] NLG is gone"),
        }
    }

    fn uri_stats(&self, remote_uri: &str) -> UriStats {
        self.call_db.get_uri_stats(remote_uri).unwrap_or_else(|e| {
            log::warn!("[calldb] no statistics for {}: {}", remote_uri, e);
            UriStats::default()
        })
    }

    /// The call being admitted counts towards the period, so the ceiling-th call of a
    /// period already hears the limit message.
    fn over_limits(&self, stats: &UriStats) -> bool {
        stats.period_calls + 1 >= self.cfg.last_period_max_num_calls
            || stats.period_time > self.cfg.last_period_max_total_time
            || stats.period_short_calls > self.cfg.last_period_max_num_short_calls
    }
}

fn gone(stage: &str) -> anyhow::Error {
    anyhow!("{} stage is gone", stage)
}

fn note(session: &mut Option<SessionLog>, event: &str, fields: Value) {
    if let Some(log) = session.as_mut() {
        log.event(event, fields);
    }
}

/// Rewritten `remote_uri` when substitutions are configured, else the fixed call-back URI,
/// else the caller itself.
pub fn call_back_destination(cfg: &HubConfig, remote_uri: &str) -> String {
    if !cfg.call_back_uri_subs.is_empty() {
        return cfg
            .call_back_uri_subs
            .iter()
            .fold(remote_uri.to_string(), |uri, (pattern, replacement)| {
                pattern.replace_all(&uri, replacement.as_str()).into_owned()
            });
    }
    cfg.call_back_uri
        .clone()
        .unwrap_or_else(|| remote_uri.to_string())
}
