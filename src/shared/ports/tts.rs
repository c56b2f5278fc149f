use crate::shared::error::ai::TtsError;

use super::AiFuture;

pub trait TtsPort: Send + Sync {
    /// Synthesizes one sentence to mono PCM at `sample_rate`.
    fn synthesize(&self, text: String, sample_rate: u32) -> AiFuture<Result<Vec<i16>, TtsError>>;
}
