use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tempfile::{tempdir, TempDir};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use voicehub::ai::{KeywordSlu, RuleDialoguePolicy, TemplateNlg, ToneTts};
use voicehub::config::{AudioConfig, HubConfig, PowerVadConfig, VadConfig};
use voicehub::entities::{AsrHypothesis, Frame, NBestList};
use voicehub::hub::{CallDb, Hub, HubLinks};
use voicehub::pipeline::{
    control_pair, PlayMsg, StageCtl, StageIo, VioCommand, VioEvent, AUDIO_CHANNEL_CAPACITY,
    DATA_CHANNEL_CAPACITY,
};
use voicehub::ports::{AiFuture, AsrError, AsrPort};
use voicehub::logging;
use voicehub::service::{asr, dm, nlg, slu, tts, vad};

type TestResult = Result<(), Box<dyn std::error::Error>>;

const CALLER: &str = "sip:1000@pbx.example.com";
const WAIT: Duration = Duration::from_secs(120);

/// Recognizes every utterance as the same words.
struct ScriptedAsr(&'static str);

impl AsrPort for ScriptedAsr {
    fn recognize(
        &self,
        _frames: Vec<Frame>,
        _sample_rate: u32,
    ) -> AiFuture<Result<AsrHypothesis, AsrError>> {
        let words: Vec<String> = self.0.split_whitespace().map(String::from).collect();
        Box::pin(async move {
            let mut nbest = NBestList::new();
            nbest.add(1.0, words);
            Ok(AsrHypothesis::NBest(nbest))
        })
    }
}

/// Every stage but VIO running for real, with the test standing in for the phone line.
struct Line {
    vio: StageCtl<VioCommand, VioEvent>,
    mic: Sender<Frame>,
    speaker: Receiver<PlayMsg>,
    played: Vec<String>,
    hub: JoinHandle<anyhow::Result<()>>,
    close: CancellationToken,
    db_path: PathBuf,
    session_dir: PathBuf,
    _temp: TempDir,
}

fn audio() -> AudioConfig {
    AudioConfig {
        sample_rate: 8000,
        samples_per_frame: 160,
    }
}

fn hub_config(db: &Path) -> HubConfig {
    HubConfig {
        main_loop_sleep_time: Duration::from_millis(10),
        last_period_max_num_calls: 50,
        last_period_max_total_time: Duration::from_secs(3 * 60 * 60),
        last_period_max_num_short_calls: 15,
        blacklist_for: Duration::from_secs(2 * 60 * 60),
        limit_reached_message: "You have reached the limit of calls. Goodbye.".to_string(),
        hard_time_limit: Duration::from_secs(15 * 60),
        hard_turn_limit: 120,
        input_timeout: Duration::from_secs(10),
        call_db: db.to_path_buf(),
        period: Duration::from_secs(24 * 60 * 60),
        short_call_threshold: Duration::from_secs(5),
        call_back_uri: None,
        call_back_uri_subs: Vec::new(),
        wait_time_before_calling_back: None,
        ncalls: 0,
    }
}

fn vad_config() -> VadConfig {
    VadConfig {
        decision_frames_speech: 5,
        decision_frames_sil: 10,
        decision_speech_threshold: 0.7,
        decision_non_speech_threshold: 0.1,
        speech_buffer_frames: 5,
        power: PowerVadConfig {
            threshold: 300.0,
            threshold_multiplier: 1.0,
            adaptation_frames: 0,
        },
    }
}

fn init_logging(temp: &Path) {
    let log_dir = env::var("E2E_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| temp.join("logs"));
    env::set_var("LOG_MODE", "file");
    env::set_var("LOG_DIR", log_dir.to_string_lossy().as_ref());
    env::set_var("RUST_LOG", "info");
    logging::init();
}

impl Line {
    fn start(
        configure: impl FnOnce(&mut HubConfig),
        heard: &'static str,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let temp = tempdir()?;
        init_logging(temp.path());
        let db_path = temp.path().join("call_db.json");
        let session_dir = temp.path().join("session");
        std::fs::create_dir_all(&session_dir)?;
        let mut cfg = hub_config(&db_path);
        configure(&mut cfg);

        let close = CancellationToken::new();
        let (vio_link, vio) = control_pair("vio");
        let (vad_link, vad_ctl) = control_pair("vad");
        let (asr_link, asr_ctl) = control_pair("asr");
        let (slu_link, slu_ctl) = control_pair("slu");
        let (dm_link, dm_ctl) = control_pair("dm");
        let (nlg_link, nlg_ctl) = control_pair("nlg");
        let (tts_link, tts_ctl) = control_pair("tts");

        let (mic, rec_rx) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);
        let (speech_tx, speech_rx) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);
        let (asr_tx, asr_rx) = mpsc::channel(DATA_CHANNEL_CAPACITY);
        let (slu_tx, slu_rx) = mpsc::channel(DATA_CHANNEL_CAPACITY);
        let (dm_tx, dm_rx) = mpsc::channel(DATA_CHANNEL_CAPACITY);
        let (nlg_tx, nlg_rx) = mpsc::channel(DATA_CHANNEL_CAPACITY);
        let (tts_tx, tts_rx) = mpsc::channel(DATA_CHANNEL_CAPACITY);
        let (play_tx, speaker) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);

        tokio::spawn(vad::run(
            vad_config(),
            audio(),
            StageIo {
                ctl: vad_ctl,
                input: rec_rx,
                output: speech_tx,
            },
            close.clone(),
        ));
        tokio::spawn(asr::run(
            Arc::new(ScriptedAsr(heard)),
            8000,
            Duration::from_secs(5),
            StageIo {
                ctl: asr_ctl,
                input: speech_rx,
                output: asr_tx,
            },
            close.clone(),
        ));
        tokio::spawn(slu::run(
            Arc::new(KeywordSlu),
            StageIo {
                ctl: slu_ctl,
                input: asr_rx,
                output: slu_tx,
            },
            close.clone(),
        ));
        tokio::spawn(dm::run(
            Box::new(RuleDialoguePolicy::default()),
            StageIo {
                ctl: dm_ctl,
                input: slu_rx,
                output: dm_tx,
            },
            close.clone(),
        ));
        tokio::spawn(nlg::run(
            Arc::new(TemplateNlg),
            StageIo {
                ctl: nlg_ctl,
                input: nlg_rx,
                output: tts_tx.clone(),
            },
            close.clone(),
        ));
        tokio::spawn(tts::run(
            Arc::new(ToneTts::default()),
            audio(),
            Duration::from_secs(5),
            StageIo {
                ctl: tts_ctl,
                input: tts_rx,
                output: play_tx,
            },
            close.clone(),
        ));

        let links = HubLinks {
            vio: vio_link,
            vad: vad_link,
            asr: asr_link,
            slu: slu_link,
            dm: dm_link,
            nlg: nlg_link,
            tts: tts_link,
            dm_acts: dm_rx,
            nlg_in: nlg_tx,
            tts_in: tts_tx,
        };
        let call_db = CallDb::new(&cfg);
        let hub = tokio::spawn(Hub::new(cfg, links, call_db).run(close.clone()));

        Ok(Self {
            vio,
            mic,
            speaker,
            played: Vec::new(),
            hub,
            close,
            db_path,
            session_dir,
            _temp: temp,
        })
    }

    fn answer(&self) {
        self.vio.emit(VioEvent::CallConfirmed {
            remote_uri: CALLER.to_string(),
            session_dir: Some(self.session_dir.clone()),
        });
    }

    fn hang_up(&self) {
        self.vio.emit(VioEvent::CallDisconnected {
            remote_uri: CALLER.to_string(),
            code: "200".to_string(),
        });
    }

    /// Plays whatever TTS sends and reports it back, until the Hub issues a command `done`
    /// accepts. Returns every command seen on the way.
    async fn play_until(
        &mut self,
        done: impl Fn(&VioCommand) -> bool,
    ) -> Result<Vec<VioCommand>, Box<dyn std::error::Error>> {
        let mut seen = Vec::new();
        let deadline = Instant::now() + WAIT;
        loop {
            tokio::select! {
                cmd = self.vio.commands.recv() => {
                    let cmd = cmd.ok_or("hub is gone")?;
                    if cmd == VioCommand::Flush {
                        self.vio.emit(VioEvent::Flushed);
                    }
                    let finished = done(&cmd);
                    seen.push(cmd);
                    if finished {
                        return Ok(seen);
                    }
                }
                msg = self.speaker.recv() => match msg.ok_or("tts is gone")? {
                    PlayMsg::UtteranceStart { user_id, fname, .. } => {
                        self.played.push(fname.clone());
                        self.vio.emit(VioEvent::PlayUtteranceStart { user_id, fname });
                    }
                    PlayMsg::UtteranceEnd { user_id, fname, .. } => {
                        self.vio.emit(VioEvent::PlayUtteranceEnd { user_id, fname });
                    }
                    PlayMsg::Frame(_) => {}
                },
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(format!("no matching command within {:?}, saw {:?}", WAIT, seen).into());
                }
            }
        }
    }

    /// Plays one whole utterance.
    async fn play_one(&mut self) -> Result<usize, Box<dyn std::error::Error>> {
        let mut frames = 0;
        loop {
            let msg = tokio::time::timeout(WAIT, self.speaker.recv())
                .await?
                .ok_or("tts is gone")?;
            match msg {
                PlayMsg::UtteranceStart { user_id, fname, .. } => {
                    self.played.push(fname.clone());
                    self.vio.emit(VioEvent::PlayUtteranceStart { user_id, fname });
                }
                PlayMsg::Frame(_) => frames += 1,
                PlayMsg::UtteranceEnd { user_id, fname, .. } => {
                    self.vio.emit(VioEvent::PlayUtteranceEnd { user_id, fname });
                    return Ok(frames);
                }
            }
        }
    }

    async fn say_something(&self) -> Result<(), Box<dyn std::error::Error>> {
        for _ in 0..12 {
            self.mic.send(loud_frame()).await?;
        }
        for _ in 0..15 {
            self.mic.send(Frame::silence(160)).await?;
        }
        Ok(())
    }

    fn session_events(&self) -> Result<Vec<Value>, Box<dyn std::error::Error>> {
        let raw = std::fs::read_to_string(self.session_dir.join("session.jsonl"))?;
        let mut events = Vec::new();
        for line in raw.lines() {
            events.push(serde_json::from_str(line)?);
        }
        Ok(events)
    }
}

fn loud_frame() -> Frame {
    Frame::new(
        (0..160)
            .map(|i| if i % 2 == 0 { 10_000 } else { -10_000 })
            .collect(),
    )
}

fn has_event(events: &[Value], name: &str) -> bool {
    events.iter().any(|e| e["event"] == name)
}

#[tokio::test(start_paused = true)]
async fn silent_caller_is_asked_to_leave_and_hub_exits() -> TestResult {
    let mut line = Line::start(|cfg| cfg.ncalls = 1, "")?;
    line.answer();

    let greeting_frames = line.play_one().await?;
    assert!(greeting_frames > 0);
    let greeted_at = Instant::now();

    let seen = line.play_until(|cmd| *cmd == VioCommand::Hangup).await?;
    let waited = greeted_at.elapsed();
    assert!(waited > Duration::from_secs(10), "hung up after {:?}", waited);
    assert!(waited <= Duration::from_secs(20), "hung up after {:?}", waited);
    assert!(seen.iter().any(
        |cmd| matches!(cmd, VioCommand::LogText { text, .. } if text == "Goodbye.")
    ));
    assert_eq!(line.played.len(), 2);

    line.hang_up();
    line.play_until(|cmd| *cmd == VioCommand::FlushOut).await?;

    tokio::time::timeout(WAIT, &mut line.hub).await???;

    let events = line.session_events()?;
    for name in ["session_start", "admission", "timeout", "hangup", "session_end"] {
        assert!(has_event(&events, name), "missing {} in {:?}", name, events);
    }

    let stats = CallDb::new(&hub_config(&line.db_path)).get_uri_stats(CALLER)?;
    assert_eq!(stats.total_calls, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn caller_saying_goodbye_is_hung_up() -> TestResult {
    let mut line = Line::start(|_| {}, "goodbye")?;
    line.answer();
    line.play_one().await?;

    line.say_something().await?;
    let seen = line.play_until(|cmd| *cmd == VioCommand::Hangup).await?;
    assert!(seen.iter().any(
        |cmd| matches!(cmd, VioCommand::LogAsrHyp { hyp, .. } if hyp.best_text() == "goodbye")
    ));
    assert_eq!(line.played.len(), 2);

    let events = line.session_events()?;
    assert!(has_event(&events, "speech_start"));
    assert!(events
        .iter()
        .any(|e| e["event"] == "hangup_requested" && e["by"] == "dm"));
    assert!(std::fs::read_dir(&line.session_dir)?
        .filter_map(Result::ok)
        .any(|entry| entry.file_name().to_string_lossy().starts_with("vad-")));

    line.close.cancel();
    tokio::time::timeout(WAIT, &mut line.hub).await???;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn speech_over_the_greeting_cuts_it_short() -> TestResult {
    let mut line = Line::start(|_| {}, "help")?;
    line.answer();

    loop {
        let msg = tokio::time::timeout(WAIT, line.speaker.recv())
            .await?
            .ok_or("tts is gone")?;
        if let PlayMsg::UtteranceStart { user_id, fname, .. } = msg {
            line.vio.emit(VioEvent::PlayUtteranceStart { user_id, fname });
            break;
        }
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    // the rest of the greeting stays queued on the speaker, so the system is still talking
    for _ in 0..12 {
        line.mic.send(loud_frame()).await?;
    }
    let flushed_out = tokio::time::timeout(WAIT, async {
        while let Some(cmd) = line.vio.commands.recv().await {
            if cmd == VioCommand::FlushOut {
                return true;
            }
        }
        false
    })
    .await?;
    assert!(flushed_out, "hub is gone");

    let events = line.session_events()?;
    assert!(events
        .iter()
        .any(|e| e["event"] == "barge_in" && e["who"] == "user"));

    line.close.cancel();
    tokio::time::timeout(WAIT, &mut line.hub).await???;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn caller_over_the_limit_hears_message_and_is_blacklisted() -> TestResult {
    let mut line = Line::start(|cfg| cfg.last_period_max_num_calls = 2, "")?;
    let db = CallDb::new(&hub_config(&line.db_path));
    let now = voicehub::utils::unix_now();
    db.track_confirmed_call_at(CALLER, now - 120.0)?;
    db.track_disconnected_call_at(CALLER, now - 60.0)?;

    line.answer();
    let seen = line.play_until(|cmd| *cmd == VioCommand::Hangup).await?;
    assert!(seen.iter().any(
        |cmd| matches!(cmd, VioCommand::BlackList { remote_uri, .. } if remote_uri == CALLER)
    ));
    // no greeting, only the limit message
    assert_eq!(line.played.len(), 1);
    assert!(!seen
        .iter()
        .any(|cmd| matches!(cmd, VioCommand::LogText { .. })));

    let events = line.session_events()?;
    assert!(events
        .iter()
        .any(|e| e["event"] == "admission" && e["verdict"] == "CALL REJECTED"));

    line.close.cancel();
    tokio::time::timeout(WAIT, &mut line.hub).await???;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn long_call_hits_hard_time_limit() -> TestResult {
    let mut line = Line::start(
        |cfg| {
            cfg.hard_time_limit = Duration::from_secs(30);
            cfg.input_timeout = Duration::from_secs(3600);
        },
        "",
    )?;
    let answered_at = Instant::now();
    line.answer();

    line.play_until(|cmd| *cmd == VioCommand::Hangup).await?;
    let waited = answered_at.elapsed();
    assert!(waited > Duration::from_secs(30), "hung up after {:?}", waited);
    assert!(waited < Duration::from_secs(32), "hung up after {:?}", waited);

    let events = line.session_events()?;
    assert!(events
        .iter()
        .any(|e| e["event"] == "hangup" && e["reason"] == "hard_limit"));

    line.close.cancel();
    tokio::time::timeout(WAIT, &mut line.hub).await???;
    Ok(())
}
