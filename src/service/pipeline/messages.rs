//! Messages carried between stages and the Hub.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use crate::shared::entities::{AsrHypothesis, Frame};

/// VAD → ASR data channel. Frames between a start and its end belong to that utterance.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioMsg {
    SpeechStart { fname: String },
    Frame(Frame),
    SpeechEnd { fname: String },
}

/// TTS → VIO play channel. A start, its frames and its end form one atomic group.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayMsg {
    UtteranceStart {
        user_id: Option<String>,
        fname: String,
        log: bool,
    },
    Frame(Frame),
    UtteranceEnd {
        user_id: Option<String>,
        fname: String,
        log: bool,
    },
}

/// Text to synthesize, from NLG or from the Hub itself.
#[derive(Debug, Clone, PartialEq)]
pub struct TtsText {
    pub text: String,
    pub user_id: Option<String>,
    pub log: bool,
}

impl TtsText {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            user_id: None,
            log: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum VioCommand {
    Stop,
    Flush,
    FlushOut,
    MakeCall { destination: String },
    Hangup,
    BlackList { remote_uri: String, expire: SystemTime },
    Transfer { destination: String },
    LogAsrHyp { fname: String, hyp: AsrHypothesis },
    LogText { text: String, user_id: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum VioEvent {
    IncomingCall { remote_uri: String },
    RejectedCall { remote_uri: String },
    RejectedCallFromBlacklistedUri { remote_uri: String },
    BlockedUri { remote_uri: String },
    CallConnecting { remote_uri: String },
    CallConfirmed {
        remote_uri: String,
        session_dir: Option<PathBuf>,
    },
    CallDisconnected { remote_uri: String, code: String },
    PlayUtteranceStart { user_id: Option<String>, fname: String },
    PlayUtteranceEnd { user_id: Option<String>, fname: String },
    DtmfDigit { digit: char },
    Flushed,
    FlushedOut,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VadCommand {
    Stop,
    Flush,
    /// Directory where detected utterances are written; `None` stops writing.
    SessionDir(Option<PathBuf>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum VadEvent {
    SpeechStart { fname: String },
    SpeechEnd { fname: String },
    Flushed,
}

/// Commands shared by the stages that only know how to stop and flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageCommand {
    Stop,
    Flush,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AsrEvent {
    AsrStart { fname: String },
    Hypothesis { fname: String, hyp: AsrHypothesis },
    AsrEnd { fname: String },
    Flushed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SluEvent {
    Flushed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DmCommand {
    Stop,
    Flush,
    NewDialogue,
    EndDialogue,
    PrepareNewDialogue,
    Timeout { silence_time: Duration },
}

#[derive(Debug, Clone, PartialEq)]
pub enum DmEvent {
    Hangup,
    Flushed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NlgEvent {
    Text(TtsText),
    /// The generator failed; the system cannot answer.
    Hangup,
    Flushed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TtsEvent {
    TtsStart { text: String },
    TtsEnd,
    /// No sentence of a text could be synthesized.
    Hangup,
    Flushed,
}
