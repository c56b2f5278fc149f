pub mod ai;
pub mod asr;
pub mod dm;
pub mod hub;
pub mod nlg;
pub mod pipeline;
pub mod slu;
pub mod tts;
pub mod vad;
pub mod vio;
