//! Stage wiring: channel capacities, command links and the process-wide `run`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::mpsc::{self, Receiver, Sender, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::service::ai;
use crate::service::hub::{CallDb, Hub, HubLinks};
use crate::service::vio::Vio;
use crate::service::{asr, dm, nlg, slu, tts, vad};
use crate::shared::config::Config;
use crate::shared::ports::{AiFuture, AsrPort, DialoguePolicy, NlgPort, SluPort, TtsPort};

pub mod messages;

pub use messages::*;

/// Frames in flight between two audio stages.
pub const AUDIO_CHANNEL_CAPACITY: usize = 8;
/// Hypotheses, acts or texts in flight between two stages.
pub const DATA_CHANNEL_CAPACITY: usize = 16;

const STAGE_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Hub side of a stage's command channel.
pub struct StageLink<C, E> {
    name: &'static str,
    commands: UnboundedSender<C>,
    pub events: UnboundedReceiver<E>,
}

impl<C, E> StageLink<C, E> {
    /// Returns false when the stage has already gone away.
    pub fn send(&self, cmd: C) -> bool {
        if self.commands.send(cmd).is_err() {
            log::warn!("[hub] {} stage is gone, command dropped", self.name);
            return false;
        }
        true
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Sending half of a stage's event channel.
pub struct Emitter<E>(UnboundedSender<E>);

impl<E> Clone for Emitter<E> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<E> Emitter<E> {
    pub fn emit(&self, ev: E) {
        // the hub only goes away during shutdown
        let _ = self.0.send(ev);
    }
}

/// Stage side of a stage's command channel.
pub struct StageCtl<C, E> {
    pub commands: UnboundedReceiver<C>,
    events: Emitter<E>,
}

impl<C, E> StageCtl<C, E> {
    pub fn emit(&self, ev: E) {
        self.events.emit(ev);
    }

    pub fn emitter(&self) -> Emitter<E> {
        self.events.clone()
    }

    pub fn into_parts(self) -> (UnboundedReceiver<C>, Emitter<E>) {
        (self.commands, self.events)
    }
}

pub fn control_pair<C, E>(name: &'static str) -> (StageLink<C, E>, StageCtl<C, E>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (ev_tx, ev_rx) = mpsc::unbounded_channel();
    (
        StageLink {
            name,
            commands: cmd_tx,
            events: ev_rx,
        },
        StageCtl {
            commands: cmd_rx,
            events: Emitter(ev_tx),
        },
    )
}

/// Everything one stage task owns: its command link plus data-in and data-out.
pub struct StageIo<C, E, I, O> {
    pub ctl: StageCtl<C, E>,
    pub input: Receiver<I>,
    pub output: Sender<O>,
}

/// Discards whatever is queued on a data-in channel without waiting.
pub fn drain<T>(rx: &mut Receiver<T>) -> usize {
    let mut dropped = 0;
    while rx.try_recv().is_ok() {
        dropped += 1;
    }
    dropped
}

/// Awaits the backend call a stage has in flight; never resolves while there is none.
pub async fn in_flight<T>(job: &mut Option<AiFuture<T>>) -> T {
    match job.as_mut() {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

/// Recognizer, parser, policy, generator and synthesizer behind the stage shells.
pub struct Backends {
    pub asr: Arc<dyn AsrPort>,
    pub slu: Arc<dyn SluPort>,
    pub policy: Box<dyn DialoguePolicy>,
    pub nlg: Arc<dyn NlgPort>,
    pub tts: Arc<dyn TtsPort>,
}

impl Backends {
    pub fn from_config(cfg: &Config) -> Self {
        let tts: Arc<dyn TtsPort> = match cfg.tts.command.clone() {
            Some(command) => Arc::new(ai::CommandTts::new(command)),
            None => Arc::new(ai::ToneTts::default()),
        };
        Self {
            asr: Arc::new(ai::CommandAsr::new(cfg.asr.command.clone())),
            slu: Arc::new(ai::KeywordSlu),
            policy: Box::new(ai::RuleDialoguePolicy::default()),
            nlg: Arc::new(ai::TemplateNlg),
            tts,
        }
    }
}

/// Binds the VIO, spawns every stage and runs the Hub until it exits or `close` fires.
///
/// A stage failure cancels `close`, which ends the Hub loop, and becomes the result of `run`.
/// Stages get one second each to release their resources once the Hub has returned.
pub async fn run(cfg: Config, backends: Backends, close: CancellationToken) -> Result<()> {
    let vio = Vio::bind(&cfg).await?;
    let call_db = CallDb::new(&cfg.hub);

    let (vio_link, vio_ctl) = control_pair("vio");
    let (vad_link, vad_ctl) = control_pair("vad");
    let (asr_link, asr_ctl) = control_pair("asr");
    let (slu_link, slu_ctl) = control_pair("slu");
    let (dm_link, dm_ctl) = control_pair("dm");
    let (nlg_link, nlg_ctl) = control_pair("nlg");
    let (tts_link, tts_ctl) = control_pair("tts");

    let (rec_tx, rec_rx) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);
    let (speech_tx, speech_rx) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);
    let (asr_tx, asr_rx) = mpsc::channel(DATA_CHANNEL_CAPACITY);
    let (slu_tx, slu_rx) = mpsc::channel(DATA_CHANNEL_CAPACITY);
    let (dm_tx, dm_rx) = mpsc::channel(DATA_CHANNEL_CAPACITY);
    let (nlg_tx, nlg_rx) = mpsc::channel(DATA_CHANNEL_CAPACITY);
    let (tts_tx, tts_rx) = mpsc::channel(DATA_CHANNEL_CAPACITY);
    let (play_tx, play_rx) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);

    let audio = cfg.audio.clone();
    let handles = vec![
        spawn_stage(
            "vio",
            close.clone(),
            vio.run(vio_ctl, rec_tx, play_rx, close.clone()),
        ),
        spawn_stage(
            "vad",
            close.clone(),
            vad::run(
                cfg.vad.clone(),
                audio.clone(),
                StageIo {
                    ctl: vad_ctl,
                    input: rec_rx,
                    output: speech_tx,
                },
                close.clone(),
            ),
        ),
        spawn_stage(
            "asr",
            close.clone(),
            asr::run(
                backends.asr,
                audio.sample_rate,
                cfg.asr.timeout,
                StageIo {
                    ctl: asr_ctl,
                    input: speech_rx,
                    output: asr_tx,
                },
                close.clone(),
            ),
        ),
        spawn_stage(
            "slu",
            close.clone(),
            slu::run(
                backends.slu,
                StageIo {
                    ctl: slu_ctl,
                    input: asr_rx,
                    output: slu_tx,
                },
                close.clone(),
            ),
        ),
        spawn_stage(
            "dm",
            close.clone(),
            dm::run(
                backends.policy,
                StageIo {
                    ctl: dm_ctl,
                    input: slu_rx,
                    output: dm_tx,
                },
                close.clone(),
            ),
        ),
        spawn_stage(
            "nlg",
            close.clone(),
            nlg::run(
                backends.nlg,
                StageIo {
                    ctl: nlg_ctl,
                    input: nlg_rx,
                    output: tts_tx.clone(),
                },
                close.clone(),
            ),
        ),
        spawn_stage(
            "tts",
            close.clone(),
            tts::run(
                backends.tts,
                audio.clone(),
                cfg.tts.timeout,
                StageIo {
                    ctl: tts_ctl,
                    input: tts_rx,
                    output: play_tx,
                },
                close.clone(),
            ),
        ),
    ];

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
    let hub = Hub::new(cfg.hub.clone(), links, call_db);
    let result = hub.run(close.clone()).await;

    close.cancel();
    let stages = join_stages(handles).await;
    result.and(stages)
}

fn spawn_stage<F>(name: &'static str, close: CancellationToken, fut: F) -> StageHandle
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let handle = tokio::spawn(async move {
        let outcome = fut.await;
        match &outcome {
            Ok(()) => log::debug!("[{}] stage exited", name),
            Err(err) => {
                log::error!("[{}] stage failed: {:#}", name, err);
                close.cancel();
            }
        }
        outcome.with_context(|| format!("{} stage failed", name))
    });
    (name, handle)
}

type StageHandle = (&'static str, JoinHandle<Result<()>>);

/// Waits for every stage and returns the first failure.
async fn join_stages(handles: Vec<StageHandle>) -> Result<()> {
    let mut first: Result<()> = Ok(());
    for (name, handle) in handles {
        let outcome = match tokio::time::timeout(STAGE_JOIN_TIMEOUT, handle).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => Err(anyhow!("{} stage panicked: {}", name, err)),
            Err(_) => {
                log::warn!("[{}] stage did not stop within {:?}", name, STAGE_JOIN_TIMEOUT);
                Ok(())
            }
        };
        if first.is_ok() {
            first = outcome;
        }
    }
    first
}
