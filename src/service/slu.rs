//! SLU stage shell. One SLU hypothesis out for every ASR hypothesis in, in the same shape.

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::service::pipeline::{drain, in_flight, SluEvent, StageCommand, StageIo};
use crate::shared::entities::{
    AsrHypothesis, ConfusionNetwork, DialogueAct, DialogueActItem, NBestList, SluHypothesis,
};
use crate::shared::ports::{AiFuture, SluPort};

type SluIo = StageIo<StageCommand, SluEvent, AsrHypothesis, SluHypothesis>;

pub async fn run(port: Arc<dyn SluPort>, mut io: SluIo, close: CancellationToken) -> Result<()> {
    let mut job: Option<AiFuture<SluHypothesis>> = None;

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
                    log::debug!("[slu] flushed ({} hypotheses dropped)", dropped);
                    io.ctl.emit(SluEvent::Flushed);
                }
            },
            hyp = in_flight(&mut job) => {
                job = None;
                log::debug!("[slu] best act {}", hyp.best_act());
                if io.output.send(hyp).await.is_err() {
                    break;
                }
            }
            hyp = io.input.recv(), if job.is_none() => {
                let Some(hyp) = hyp else { break };
                job = Some(parse(port.as_ref(), hyp));
            }
        }
    }
    Ok(())
}

fn parse(port: &dyn SluPort, hyp: AsrHypothesis) -> AiFuture<SluHypothesis> {
    let fallback = null_hypothesis(&hyp);
    let parsing = port.parse(hyp);
    Box::pin(async move {
        match parsing.await {
            Ok(parsed) if same_shape(&parsed, &fallback) => parsed,
            Ok(_) => {
                log::warn!("[slu] parser changed the hypothesis shape, using null()");
                fallback
            }
            Err(err) => {
                log::warn!("[slu] parsing failed: {}", err);
                fallback
            }
        }
    })
}

/// `null()` with certainty, shaped like `hyp`.
fn null_hypothesis(hyp: &AsrHypothesis) -> SluHypothesis {
    match hyp {
        AsrHypothesis::NBest(_) => {
            let mut nb = NBestList::new();
            nb.add(1.0, DialogueAct::single("null"));
            SluHypothesis::NBest(nb)
        }
        AsrHypothesis::ConfusionNetwork(_) => {
            let mut cn = ConfusionNetwork::new();
            cn.push_position(vec![(1.0, DialogueActItem::new("null"))]);
            SluHypothesis::ConfusionNetwork(cn)
        }
    }
}

fn same_shape(a: &SluHypothesis, b: &SluHypothesis) -> bool {
    std::mem::discriminant(a) == std::mem::discriminant(b)
}
