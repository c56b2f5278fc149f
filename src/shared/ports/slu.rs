use crate::shared::entities::{AsrHypothesis, SluHypothesis};
use crate::shared::error::ai::SluError;

use super::AiFuture;

pub trait SluPort: Send + Sync {
    /// Must return the same shape (n-best or confusion network) it was given.
    fn parse(&self, hyp: AsrHypothesis) -> AiFuture<Result<SluHypothesis, SluError>>;
}
