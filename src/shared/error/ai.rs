use thiserror::Error;

#[derive(Debug, Error)]
pub enum AsrError {
    #[error("Recognition failed: {0}")]
    RecognitionFailed(String),
    #[error("No recognizer configured")]
    NotConfigured,
    #[error("Audio too short")]
    AudioTooShort,
    #[error("Timeout")]
    Timeout,
}

#[derive(Debug, Error)]
pub enum SluError {
    #[error("Parsing failed: {0}")]
    ParseFailed(String),
}

#[derive(Debug, Error)]
pub enum NlgError {
    #[error("No template for dialogue act: {0}")]
    NoTemplate(String),
}

#[derive(Debug, Error)]
pub enum TtsError {
    #[error("Synthesis failed: {0}")]
    SynthesisFailed(String),
    #[error("Audio format invalid: {0}")]
    InvalidFormat(String),
    #[error("Timeout")]
    Timeout,
}
