use crate::shared::entities::{AsrHypothesis, Frame};
use crate::shared::error::ai::AsrError;

use super::AiFuture;

pub trait AsrPort: Send + Sync {
    /// Recognizes one complete utterance given as frames at `sample_rate`.
    fn recognize(
        &self,
        frames: Vec<Frame>,
        sample_rate: u32,
    ) -> AiFuture<Result<AsrHypothesis, AsrError>>;
}
