//! ASR stage shell: collects the frames of one utterance and hands them to the recognizer.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::service::pipeline::{drain, AsrEvent, AudioMsg, StageCommand, StageIo};
use crate::shared::entities::{AsrHypothesis, Frame};
use crate::shared::ports::AsrPort;
use crate::shared::utils::mask_pii;

type AsrIo = StageIo<StageCommand, AsrEvent, AudioMsg, AsrHypothesis>;

struct Utterance {
    fname: String,
    frames: Vec<Frame>,
}

struct Recognition {
    fname: String,
    handle: JoinHandle<AsrHypothesis>,
}

pub async fn run(
    port: Arc<dyn AsrPort>,
    sample_rate: u32,
    timeout: Duration,
    mut io: AsrIo,
    close: CancellationToken,
) -> Result<()> {
    let mut current: Option<Utterance> = None;
    let mut job: Option<Recognition> = None;
    // utterances that ended while an earlier one was being recognized
    let mut queued: VecDeque<Utterance> = VecDeque::new();

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
                    if let Some(job) = job.take() {
                        log::debug!("[asr] recognition of {} aborted", job.fname);
                        job.handle.abort();
                    }
                    current = None;
                    queued.clear();
                    log::debug!("[asr] flushed ({} messages dropped)", dropped);
                    io.ctl.emit(AsrEvent::Flushed);
                }
            },
            (fname, hyp) = finished(&mut job) => {
                job = queued
                    .pop_front()
                    .map(|next| recognize(port.clone(), next, sample_rate, timeout));
                let text = hyp.best_text();
                log::info!("[asr] {} recognized {}", fname, mask_pii(&text));
                log::debug!("[asr] {} text={:?}", fname, text);
                if io.output.send(hyp.clone()).await.is_err() {
                    break;
                }
                io.ctl.emit(AsrEvent::Hypothesis {
                    fname: fname.clone(),
                    hyp,
                });
                io.ctl.emit(AsrEvent::AsrEnd { fname });
            }
            msg = io.input.recv() => {
                let Some(msg) = msg else { break };
                match msg {
                    AudioMsg::SpeechStart { fname } => {
                        if let Some(open) = current.take() {
                            log::warn!("[asr] speech start {} inside {}, resetting", fname, open.fname);
                        }
                        io.ctl.emit(AsrEvent::AsrStart {
                            fname: fname.clone(),
                        });
                        current = Some(Utterance {
                            fname,
                            frames: Vec::new(),
                        });
                    }
                    AudioMsg::Frame(frame) => match current.as_mut() {
                        Some(utterance) => utterance.frames.push(frame),
                        None => log::debug!("[asr] frame outside an utterance dropped"),
                    },
                    AudioMsg::SpeechEnd { fname } => match current.take() {
                        // one recognition at a time keeps hypotheses in speech order
                        Some(utterance) if utterance.fname == fname => {
                            if job.is_some() {
                                queued.push_back(utterance);
                            } else {
                                job = Some(recognize(port.clone(), utterance, sample_rate, timeout));
                            }
                        }
                        Some(utterance) => log::warn!(
                            "[asr] speech end {} does not match {}, resetting",
                            fname,
                            utterance.fname
                        ),
                        None => log::warn!("[asr] speech end {} without speech start", fname),
                    },
                }
            }
        }
    }

    if let Some(job) = job.take() {
        job.handle.abort();
    }
    Ok(())
}

fn recognize(
    port: Arc<dyn AsrPort>,
    utterance: Utterance,
    sample_rate: u32,
    timeout: Duration,
) -> Recognition {
    let Utterance { fname, frames } = utterance;
    let label = fname.clone();
    let handle = tokio::spawn(async move {
        match tokio::time::timeout(timeout, port.recognize(frames, sample_rate)).await {
            Ok(Ok(hyp)) => hyp,
            Ok(Err(err)) => {
                log::warn!("[asr] recognition of {} failed: {}", label, err);
                AsrHypothesis::silence()
            }
            Err(_) => {
                log::warn!("[asr] recognition of {} timed out after {:?}", label, timeout);
                AsrHypothesis::silence()
            }
        }
    });
    Recognition { fname, handle }
}

/// Resolves when the running recognition finishes; never resolves when there is none.
async fn finished(job: &mut Option<Recognition>) -> (String, AsrHypothesis) {
    let Some(running) = job.as_mut() else {
        return std::future::pending().await;
    };
    let hyp = match (&mut running.handle).await {
        Ok(hyp) => hyp,
        Err(err) => {
            log::warn!("[asr] recognizer task failed: {}", err);
            AsrHypothesis::silence()
        }
    };
    (running.fname.clone(), hyp)
}
