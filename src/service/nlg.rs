//! NLG stage shell: one text per dialogue act, sent to TTS and echoed to the Hub.

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::service::pipeline::{drain, in_flight, NlgEvent, StageCommand, StageIo, TtsText};
use crate::shared::entities::DialogueAct;
use crate::shared::ports::{AiFuture, NlgPort};

type NlgIo = StageIo<StageCommand, NlgEvent, DialogueAct, TtsText>;

pub async fn run(port: Arc<dyn NlgPort>, mut io: NlgIo, close: CancellationToken) -> Result<()> {
    let mut job: Option<AiFuture<Rendered>> = None;

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
                    let dropped = drain(&mut io.input) + usize::from(job.take().is_some());
                    log::debug!("[nlg] flushed ({} acts dropped)", dropped);
                    io.ctl.emit(NlgEvent::Flushed);
                }
            },
            rendered = in_flight(&mut job) => {
                job = None;
                let text = match rendered {
                    Rendered::Text(text) => TtsText::new(text),
                    Rendered::Nothing => continue,
                    Rendered::Failed => {
                        io.ctl.emit(NlgEvent::Hangup);
                        continue;
                    }
                };
                if io.output.send(text.clone()).await.is_err() {
                    break;
                }
                io.ctl.emit(NlgEvent::Text(text));
            }
            act = io.input.recv(), if job.is_none() => {
                let Some(act) = act else { break };
                job = Some(generate(port.as_ref(), act));
            }
        }
    }
    Ok(())
}

enum Rendered {
    Text(String),
    Nothing,
    Failed,
}

fn generate(port: &dyn NlgPort, act: DialogueAct) -> AiFuture<Rendered> {
    let label = act.to_string();
    let generating = port.generate(act);
    Box::pin(async move {
        match generating.await {
            Ok(text) if text.trim().is_empty() => {
                log::debug!("[nlg] {} renders to nothing", label);
                Rendered::Nothing
            }
            Ok(text) => Rendered::Text(text),
            Err(err) => {
                log::warn!("[nlg] cannot render {}: {}", label, err);
                Rendered::Failed
            }
        }
    })
}
