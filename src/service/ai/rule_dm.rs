use std::time::Duration;

use crate::shared::entities::{DialogueAct, SluHypothesis};
use crate::shared::ports::DialoguePolicy;

/// Small hand-written policy: greet, answer goodbyes, repeat on request, hang up when idle.
#[derive(Debug, Clone, Default)]
pub struct RuleDialoguePolicy {
    patience: u32,
    timeouts: u32,
    last: Option<DialogueAct>,
}

impl RuleDialoguePolicy {
    /// Asks `reqmore()` on `patience` consecutive timeouts before saying goodbye.
    pub fn with_patience(patience: u32) -> Self {
        Self {
            patience,
            ..Self::default()
        }
    }

    fn remember(&mut self, act: DialogueAct) -> DialogueAct {
        self.last = Some(act.clone());
        act
    }
}

impl DialoguePolicy for RuleDialoguePolicy {
    fn new_dialogue(&mut self) -> DialogueAct {
        self.timeouts = 0;
        self.remember(DialogueAct::single("hello"))
    }

    fn end_dialogue(&mut self) {
        self.timeouts = 0;
        self.last = None;
    }

    fn on_input(&mut self, hyp: &SluHypothesis) -> DialogueAct {
        let act = hyp.best_act();
        let meaningful = act
            .items
            .iter()
            .any(|i| i.act_type != "null" && i.act_type != "silence");
        if !meaningful {
            return DialogueAct::silence();
        }
        self.timeouts = 0;
        if act.has_act_type("bye") {
            return self.remember(DialogueAct::single("bye"));
        }
        if act.has_act_type("repeat") {
            if let Some(last) = self.last.clone() {
                return last;
            }
        }
        self.remember(DialogueAct::single("notunderstood"))
    }

    fn on_timeout(&mut self, silence_time: Duration) -> DialogueAct {
        self.timeouts += 1;
        if self.timeouts > self.patience {
            log::debug!("[dm] giving up after {:?} of silence", silence_time);
            return self.remember(DialogueAct::single("bye"));
        }
        self.remember(DialogueAct::single("reqmore"))
    }
}
