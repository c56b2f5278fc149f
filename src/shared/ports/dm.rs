use std::time::Duration;

use crate::shared::entities::{DialogueAct, SluHypothesis};

/// Dialogue policy driven by the DM task. Owned by a single task, so it may keep state freely.
pub trait DialoguePolicy: Send {
    fn new_dialogue(&mut self) -> DialogueAct;
    fn end_dialogue(&mut self);
    fn on_input(&mut self, hyp: &SluHypothesis) -> DialogueAct;
    fn on_timeout(&mut self, silence_time: Duration) -> DialogueAct;
}
