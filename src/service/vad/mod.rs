//! Voice activity detection stage.
//!
//! Classifies every captured frame, smooths the decisions with [`SpeechDetector`] and forwards
//! only speech (plus its pre-roll) to ASR, bracketed by `speech_start`/`speech_end`.

pub mod detector;
pub mod power;

use std::collections::VecDeque;
use std::path::PathBuf;

use anyhow::Result;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

use crate::media::{self, WavSink};
use crate::service::pipeline::{drain, AudioMsg, StageCtl, StageIo, VadCommand, VadEvent};
use crate::shared::config::{AudioConfig, VadConfig};
use crate::shared::entities::Frame;
use crate::shared::utils::file_stamp;

pub use detector::{FrameClassifier, SpeechDetector, Step, Transition};
pub use power::PowerVad;

type VadIo = StageIo<VadCommand, VadEvent, Frame, AudioMsg>;

pub async fn run(
    cfg: VadConfig,
    audio: AudioConfig,
    io: VadIo,
    close: CancellationToken,
) -> Result<()> {
    let classifier = PowerVad::new(cfg.power.clone());
    VadStage::new(&cfg, audio.sample_rate, Box::new(classifier))
        .run(io, close)
        .await
}

struct Utterance {
    fname: String,
    wav: Option<WavSink>,
}

pub struct VadStage {
    detector: SpeechDetector,
    classifier: Box<dyn FrameClassifier>,
    sample_rate: u32,
    session_dir: Option<PathBuf>,
    current: Option<Utterance>,
    last_fname: Option<String>,
    fname_seq: u32,
    backlog: VecDeque<AudioMsg>,
}

impl VadStage {
    pub fn new(cfg: &VadConfig, sample_rate: u32, classifier: Box<dyn FrameClassifier>) -> Self {
        Self {
            detector: SpeechDetector::new(cfg),
            classifier,
            sample_rate,
            session_dir: None,
            current: None,
            last_fname: None,
            fname_seq: 0,
            backlog: VecDeque::new(),
        }
    }

    pub async fn run(mut self, mut io: VadIo, close: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                biased;
                _ = close.cancelled() => break,
                cmd = io.ctl.commands.recv() => match cmd {
                    None | Some(VadCommand::Stop) => {
                        drain(&mut io.input);
                        self.end_utterance(&io.ctl);
                        self.pump(&io.output);
                        break;
                    }
                    Some(VadCommand::Flush) => {
                        let start_unsent = self
                            .current
                            .as_ref()
                            .is_some_and(|u| self.unsent_start(&u.fname));
                        let dropped = drain(&mut io.input) + self.backlog.len();
                        self.backlog.clear();
                        self.end_utterance(&io.ctl);
                        if start_unsent {
                            // ASR never heard this utterance begin
                            self.backlog.clear();
                        }
                        self.detector.reset();
                        if !self.pump(&io.output) {
                            break;
                        }
                        log::debug!("[vad] flushed ({} frames dropped)", dropped);
                        io.ctl.emit(VadEvent::Flushed);
                    }
                    Some(VadCommand::SessionDir(dir)) => {
                        if dir.is_some() {
                            self.classifier.reset();
                        }
                        self.session_dir = dir;
                    }
                },
                permit = io.output.reserve(), if !self.backlog.is_empty() => {
                    let Ok(permit) = permit else { break };
                    if let Some(msg) = self.backlog.pop_front() {
                        permit.send(msg);
                    }
                }
                frame = io.input.recv() => {
                    let Some(frame) = frame else { break };
                    self.on_frame(frame, &io.ctl);
                    if !self.pump(&io.output) {
                        break;
                    }
                }
            }
        }
        self.close_wav();
        Ok(())
    }

    fn on_frame(&mut self, frame: Frame, ctl: &StageCtl<VadCommand, VadEvent>) {
        let decision = self.classifier.decide(&frame);
        let Step { transition, frames } = self.detector.push(frame, decision);

        if transition == Some(Transition::Start) {
            let fname = self.next_fname();
            log::info!("[vad] speech start {}", fname);
            let wav = self.open_wav(&fname);
            self.current = Some(Utterance {
                fname: fname.clone(),
                wav,
            });
            ctl.emit(VadEvent::SpeechStart {
                fname: fname.clone(),
            });
            self.backlog.push_back(AudioMsg::SpeechStart { fname });
        }

        for frame in frames {
            self.write_wav(&frame);
            self.backlog.push_back(AudioMsg::Frame(frame));
        }

        if transition == Some(Transition::End) {
            self.end_utterance(ctl);
        }
    }

    /// Closes the open utterance, if any.
    fn end_utterance(&mut self, ctl: &StageCtl<VadCommand, VadEvent>) {
        let Some(utterance) = self.current.take() else {
            return;
        };
        log::info!("[vad] speech end {}", utterance.fname);
        if let Some(wav) = utterance.wav {
            if let Err(err) = wav.finalize() {
                log::warn!("[vad] failed to finalize {}: {}", utterance.fname, err);
            }
        }
        ctl.emit(VadEvent::SpeechEnd {
            fname: utterance.fname.clone(),
        });
        self.backlog.push_back(AudioMsg::SpeechEnd {
            fname: utterance.fname,
        });
    }

    fn unsent_start(&self, fname: &str) -> bool {
        self.backlog
            .iter()
            .any(|msg| matches!(msg, AudioMsg::SpeechStart { fname: f } if f == fname))
    }

    /// Hands as much of the backlog to ASR as fits without waiting. Returns false once ASR has
    /// gone away.
    fn pump(&mut self, output: &Sender<AudioMsg>) -> bool {
        while let Some(msg) = self.backlog.pop_front() {
            match output.try_send(msg) {
                Ok(()) => {}
                Err(TrySendError::Full(msg)) => {
                    self.backlog.push_front(msg);
                    return true;
                }
                Err(TrySendError::Closed(_)) => return false,
            }
        }
        true
    }

    fn next_fname(&mut self) -> String {
        let mut fname = format!("vad-{}.wav", file_stamp());
        if self.last_fname.as_deref() == Some(fname.as_str()) {
            self.fname_seq += 1;
            fname = format!("vad-{}-{}.wav", file_stamp(), self.fname_seq);
        }
        self.last_fname = Some(fname.clone());
        fname
    }

    fn open_wav(&self, fname: &str) -> Option<WavSink> {
        let dir = self.session_dir.as_ref()?;
        match media::create_wav(&dir.join(fname), self.sample_rate) {
            Ok(wav) => Some(wav),
            Err(err) => {
                log::warn!("[vad] cannot record {}: {}", fname, err);
                None
            }
        }
    }

    fn write_wav(&mut self, frame: &Frame) {
        let Some(utterance) = self.current.as_mut() else {
            return;
        };
        let Some(wav) = utterance.wav.as_mut() else {
            return;
        };
        let failed = frame
            .samples()
            .iter()
            .any(|&s| wav.write_sample(s).is_err());
        if failed {
            log::warn!("[vad] write failed, dropping recording {}", utterance.fname);
            utterance.wav = None;
        }
    }

    fn close_wav(&mut self) {
        if let Some(Utterance {
            wav: Some(wav),
            fname,
        }) = self.current.take()
        {
            if let Err(err) = wav.finalize() {
                log::warn!("[vad] failed to finalize {}: {}", fname, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::service::asr;
    use crate::service::pipeline::{control_pair, AUDIO_CHANNEL_CAPACITY, DATA_CHANNEL_CAPACITY};
    use crate::shared::config::test_support::test_config;
    use crate::shared::entities::AsrHypothesis;
    use crate::shared::ports::{AiFuture, AsrError, AsrPort};
    use tokio::sync::mpsc;

    /// Classifies frames by their first sample: non-zero is speech.
    struct MarkerClassifier;

    impl FrameClassifier for MarkerClassifier {
        fn decide(&mut self, frame: &Frame) -> f32 {
            if frame.samples()[0] != 0 {
                1.0
            } else {
                0.0
            }
        }
    }

    struct Harness {
        link: crate::service::pipeline::StageLink<VadCommand, VadEvent>,
        frames: mpsc::Sender<Frame>,
        out: mpsc::Receiver<AudioMsg>,
        close: CancellationToken,
        handle: tokio::task::JoinHandle<Result<()>>,
    }

    fn start() -> Harness {
        let cfg = test_config();
        let (link, ctl) = control_pair("vad");
        let (frames, input) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);
        let (output, out) = mpsc::channel(64);
        let close = CancellationToken::new();
        let stage = VadStage::new(&cfg.vad, 8000, Box::new(MarkerClassifier));
        let handle = tokio::spawn(stage.run(StageIo { ctl, input, output }, close.clone()));
        Harness {
            link,
            frames,
            out,
            close,
            handle,
        }
    }

    fn speech(tag: i16) -> Frame {
        Frame::new(vec![tag; 160])
    }

    async fn next(out: &mut mpsc::Receiver<AudioMsg>) -> AudioMsg {
        out.recv().await.unwrap()
    }

    #[tokio::test]
    async fn brackets_speech_and_writes_utterance() {
        let mut h = start();
        let dir = tempfile::tempdir().unwrap();
        h.link
            .send(VadCommand::SessionDir(Some(dir.path().to_path_buf())));
        for tag in [0, 0, 1, 2, 3] {
            h.frames.send(speech(tag)).await.unwrap();
        }
        for _ in 0..5 {
            h.frames.send(speech(0)).await.unwrap();
        }

        let AudioMsg::SpeechStart { fname } = next(&mut h.out).await else {
            panic!("expected speech start");
        };
        let mut tags = Vec::new();
        loop {
            match next(&mut h.out).await {
                AudioMsg::Frame(f) => tags.push(f.samples()[0]),
                AudioMsg::SpeechEnd { fname: end } => {
                    assert_eq!(end, fname);
                    break;
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        // four pre-roll frames arrive with the transition
        assert_eq!(&tags[..5], &[0, 0, 1, 2, 3]);
        assert_eq!(tags.len(), 9);

        assert_eq!(
            h.link.events.recv().await,
            Some(VadEvent::SpeechStart {
                fname: fname.clone()
            })
        );
        assert_eq!(
            h.link.events.recv().await,
            Some(VadEvent::SpeechEnd {
                fname: fname.clone()
            })
        );
        let samples = hound::WavReader::open(dir.path().join(&fname))
            .unwrap()
            .len();
        assert_eq!(samples as usize, tags.len() * 160);

        h.close.cancel();
        h.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn flush_closes_open_utterance_and_acks() {
        let mut h = start();
        for tag in [1, 1, 1] {
            h.frames.send(speech(tag)).await.unwrap();
        }
        let AudioMsg::SpeechStart { fname } = next(&mut h.out).await else {
            panic!("expected speech start");
        };
        assert!(matches!(h.link.events.recv().await, Some(VadEvent::SpeechStart { .. })));

        h.link.send(VadCommand::Flush);
        assert_eq!(
            h.link.events.recv().await,
            Some(VadEvent::SpeechEnd {
                fname: fname.clone()
            })
        );
        assert_eq!(h.link.events.recv().await, Some(VadEvent::Flushed));
        let mut saw_end = false;
        while let Ok(msg) = h.out.try_recv() {
            if msg == (AudioMsg::SpeechEnd { fname: fname.clone() }) {
                saw_end = true;
            }
        }
        assert!(saw_end);
    }

    #[tokio::test]
    async fn flush_twice_on_idle_stage_acks_twice() {
        let mut h = start();
        h.link.send(VadCommand::Flush);
        h.link.send(VadCommand::Flush);
        assert_eq!(h.link.events.recv().await, Some(VadEvent::Flushed));
        assert_eq!(h.link.events.recv().await, Some(VadEvent::Flushed));
        assert!(h.out.try_recv().is_err());
    }

    /// Takes five seconds per utterance.
    struct SlowAsr;

    impl AsrPort for SlowAsr {
        fn recognize(
            &self,
            _frames: Vec<Frame>,
            _sample_rate: u32,
        ) -> AiFuture<Result<AsrHypothesis, AsrError>> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(AsrHypothesis::silence())
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_up_with_capture_while_asr_is_busy() {
        let cfg = test_config();
        let (mut vad, vad_ctl) = control_pair("vad");
        let (_asr, asr_ctl) = control_pair("asr");
        let (frames, input) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);
        let (to_asr, asr_input) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);
        let (hyps, _hyps_rx) = mpsc::channel(DATA_CHANNEL_CAPACITY);
        let close = CancellationToken::new();
        let stage = VadStage::new(&cfg.vad, 8000, Box::new(MarkerClassifier));
        tokio::spawn(stage.run(
            StageIo {
                ctl: vad_ctl,
                input,
                output: to_asr,
            },
            close.clone(),
        ));
        tokio::spawn(asr::run(
            Arc::new(SlowAsr),
            8000,
            Duration::from_secs(10),
            StageIo {
                ctl: asr_ctl,
                input: asr_input,
                output: hyps,
            },
            close.clone(),
        ));

        for tag in [1, 1, 1, 1, 0, 0, 0, 0, 0, 0] {
            frames.send(speech(tag)).await.unwrap();
        }
        loop {
            if let Some(VadEvent::SpeechEnd { .. }) = vad.events.recv().await {
                break;
            }
        }

        // capture keeps its 20 ms pace while the first utterance is recognized
        let mut accepted = 0;
        for _ in 0..40 {
            if frames.try_send(speech(1)).is_ok() {
                accepted += 1;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(accepted, 40);

        vad.send(VadCommand::Flush);
        let flushed = tokio::time::timeout(Duration::from_secs(1), async {
            while let Some(ev) = vad.events.recv().await {
                if ev == VadEvent::Flushed {
                    return true;
                }
            }
            false
        })
        .await;
        assert!(matches!(flushed, Ok(true)), "vad did not act on flush");
        close.cancel();
    }

    #[tokio::test]
    async fn stop_exits() {
        let h = start();
        h.link.send(VadCommand::Stop);
        h.handle.await.unwrap().unwrap();
    }
}
