//! DM stage shell around a synchronous [`DialoguePolicy`].

use anyhow::Result;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

use crate::service::pipeline::{drain, DmCommand, DmEvent, StageCtl, StageIo};
use crate::shared::entities::{DialogueAct, SluHypothesis};
use crate::shared::ports::DialoguePolicy;

type DmIo = StageIo<DmCommand, DmEvent, SluHypothesis, DialogueAct>;

pub async fn run(
    mut policy: Box<dyn DialoguePolicy>,
    mut io: DmIo,
    close: CancellationToken,
) -> Result<()> {
    let mut active = false;

    loop {
        tokio::select! {
            biased;
            _ = close.cancelled() => break,
            cmd = io.ctl.commands.recv() => {
                let act = match cmd {
                    None | Some(DmCommand::Stop) => {
                        drain(&mut io.input);
                        break;
                    }
                    Some(DmCommand::Flush) => {
                        let dropped = drain(&mut io.input);
                        log::debug!("[dm] flushed ({} hypotheses dropped)", dropped);
                        io.ctl.emit(DmEvent::Flushed);
                        None
                    }
                    Some(DmCommand::NewDialogue) => {
                        if active {
                            policy.end_dialogue();
                        }
                        active = true;
                        log::info!("[dm] new dialogue");
                        Some(policy.new_dialogue())
                    }
                    Some(DmCommand::EndDialogue) | Some(DmCommand::PrepareNewDialogue) => {
                        if active {
                            log::info!("[dm] dialogue ended");
                            policy.end_dialogue();
                            active = false;
                        }
                        drain(&mut io.input);
                        None
                    }
                    Some(DmCommand::Timeout { silence_time }) if active => {
                        log::debug!("[dm] input timeout after {:?}", silence_time);
                        Some(policy.on_timeout(silence_time))
                    }
                    Some(DmCommand::Timeout { .. }) => None,
                };
                if let Some(act) = act {
                    if !emit_act(act, &io.output, &io.ctl).await {
                        break;
                    }
                }
            }
            hyp = io.input.recv() => {
                let Some(hyp) = hyp else { break };
                if !active {
                    log::debug!("[dm] input outside a dialogue dropped");
                    continue;
                }
                let act = policy.on_input(&hyp);
                if !emit_act(act, &io.output, &io.ctl).await {
                    break;
                }
            }
        }
    }

    if active {
        policy.end_dialogue();
    }
    Ok(())
}

/// Sends `act` downstream; a `bye()` also asks the Hub to hang up. False once NLG is gone.
async fn emit_act(
    act: DialogueAct,
    output: &Sender<DialogueAct>,
    ctl: &StageCtl<DmCommand, DmEvent>,
) -> bool {
    let bye = act.has_act_type("bye");
    if !act.is_silence() {
        log::info!("[dm] act {}", act);
    }
    if output.send(act).await.is_err() {
        return false;
    }
    if bye {
        ctl.emit(DmEvent::Hangup);
    }
    true
}
