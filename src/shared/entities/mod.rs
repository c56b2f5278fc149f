pub mod dialogue_act;
pub mod frame;
pub mod hypothesis;

pub use dialogue_act::{DialogueAct, DialogueActItem};
pub use frame::Frame;
pub use hypothesis::{AsrHypothesis, ConfusionNetwork, NBestList, SluHypothesis};
