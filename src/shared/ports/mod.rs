use std::future::Future;
use std::pin::Pin;

pub mod asr;
pub mod dm;
pub mod nlg;
pub mod slu;
pub mod tts;

pub use asr::AsrPort;
pub use dm::DialoguePolicy;
pub use nlg::NlgPort;
pub use slu::SluPort;
pub use tts::TtsPort;

pub use crate::shared::error::ai::{AsrError, NlgError, SluError, TtsError};

pub type AiFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
