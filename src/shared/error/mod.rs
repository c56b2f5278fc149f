pub mod ai;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid regex in {key}: {source}")]
    InvalidRegex {
        key: String,
        #[source]
        source: regex::Error,
    },
    #[error("speech threshold {up} must be greater than non-speech threshold {down}")]
    Hysteresis { up: f32, down: f32 },
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
    #[error("missing required setting {0}")]
    Missing(&'static str),
}

#[derive(Debug, Error)]
pub enum CallDbError {
    #[error("call db io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("call db lock failed on {path}: {source}")]
    Lock {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("call db encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}
