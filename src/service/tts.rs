//! TTS stage shell.
//!
//! Every text becomes one atomic group on the play channel: `utterance_start`, frames of exactly
//! `samples_per_frame`, `utterance_end`. The group is sent message by message so a flush can
//! still cut it short; VIO drops whatever part of it already went out on `flush_out`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::media::frames_from_samples;
use crate::service::pipeline::{drain, in_flight, PlayMsg, StageCommand, StageIo, TtsEvent, TtsText};
use crate::shared::config::AudioConfig;
use crate::shared::ports::{AiFuture, TtsPort};
use crate::shared::utils::file_stamp;

type TtsIo = StageIo<StageCommand, TtsEvent, TtsText, PlayMsg>;

pub async fn run(
    port: Arc<dyn TtsPort>,
    audio: AudioConfig,
    timeout: Duration,
    mut io: TtsIo,
    close: CancellationToken,
) -> Result<()> {
    let mut job: Option<AiFuture<(TtsText, Option<Vec<i16>>)>> = None;
    let mut pending: VecDeque<PlayMsg> = VecDeque::new();
    let mut speaking = false;

    loop {
        tokio::select! {
            biased;
            _ = close.cancelled() => break,
            cmd = io.ctl.commands.recv() => match cmd {
                None | Some(StageCommand::Stop) => {
                    drain(&mut io.input);
                    break;
                }
                Some(StageCommand::Flush) => {
                    let dropped = drain(&mut io.input);
                    job = None;
                    pending.clear();
                    speaking = false;
                    log::debug!("[tts] flushed ({} texts dropped)", dropped);
                    io.ctl.emit(TtsEvent::Flushed);
                }
            },
            permit = io.output.reserve(), if !pending.is_empty() => {
                let Ok(permit) = permit else { break };
                if let Some(msg) = pending.pop_front() {
                    permit.send(msg);
                }
                if pending.is_empty() && speaking {
                    speaking = false;
                    io.ctl.emit(TtsEvent::TtsEnd);
                }
            }
            (text, samples) = in_flight(&mut job) => {
                job = None;
                match samples {
                    Some(samples) => pending.extend(utterance(text, &samples, audio.samples_per_frame)),
                    None => {
                        speaking = false;
                        io.ctl.emit(TtsEvent::TtsEnd);
                        io.ctl.emit(TtsEvent::Hangup);
                    }
                }
            }
            // the next text waits until the current group is fully out
            text = io.input.recv(), if job.is_none() && pending.is_empty() => {
                let Some(text) = text else { break };
                log::info!("[tts] synthesizing {} chars", text.text.chars().count());
                io.ctl.emit(TtsEvent::TtsStart {
                    text: text.text.clone(),
                });
                speaking = true;
                job = Some(synthesize(port.clone(), text, audio.sample_rate, timeout));
            }
        }
    }
    Ok(())
}

/// `None` when every sentence failed.
fn synthesize(
    port: Arc<dyn TtsPort>,
    text: TtsText,
    sample_rate: u32,
    timeout: Duration,
) -> AiFuture<(TtsText, Option<Vec<i16>>)> {
    Box::pin(async move {
        let mut samples = Vec::new();
        let mut spoken = 0;
        let sentences = split_sentences(&text.text);
        let total = sentences.len();
        for sentence in sentences {
            match tokio::time::timeout(timeout, port.synthesize(sentence, sample_rate)).await {
                Ok(Ok(mut wav)) => {
                    trim_trailing_silence(&mut wav);
                    samples.extend_from_slice(&wav);
                    spoken += 1;
                }
                Ok(Err(err)) => log::warn!("[tts] synthesis failed: {}", err),
                Err(_) => log::warn!("[tts] synthesis timed out after {:?}", timeout),
            }
        }
        let samples = (total == 0 || spoken > 0).then_some(samples);
        (text, samples)
    })
}

fn utterance(text: TtsText, samples: &[i16], samples_per_frame: usize) -> Vec<PlayMsg> {
    let fname = format!("tts-{}.wav", file_stamp());
    let frames = frames_from_samples(samples, samples_per_frame);
    let mut group = Vec::with_capacity(frames.len() + 2);
    group.push(PlayMsg::UtteranceStart {
        user_id: text.user_id.clone(),
        fname: fname.clone(),
        log: text.log,
    });
    group.extend(frames.into_iter().map(PlayMsg::Frame));
    group.push(PlayMsg::UtteranceEnd {
        user_id: text.user_id,
        fname,
        log: text.log,
    });
    group
}

/// Splits at `.`, `!` and `?`, keeping the punctuation with its sentence.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        current.push(c);
        let boundary = matches!(c, '.' | '!' | '?')
            && chars.peek().map_or(true, |next| next.is_whitespace());
        if boundary {
            push_sentence(&mut sentences, &mut current);
        }
    }
    push_sentence(&mut sentences, &mut current);
    sentences
}

fn push_sentence(sentences: &mut Vec<String>, current: &mut String) {
    let sentence = current.trim();
    if !sentence.is_empty() {
        sentences.push(sentence.to_string());
    }
    current.clear();
}

pub fn trim_trailing_silence(samples: &mut Vec<i16>) {
    let end = samples
        .iter()
        .rposition(|&s| s != 0)
        .map_or(0, |last| last + 1);
    samples.truncate(end);
}
