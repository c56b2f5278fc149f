//! Default backends behind the stage ports.
//! - ASR and TTS can delegate to external programs (`ASR_COMMAND` / `TTS_COMMAND`).
//! - SLU, DM and NLG are small built-in rule sets, enough for a runnable hub.

mod command_asr;
mod keyword_slu;
mod rule_dm;
mod template_nlg;
mod tts;

pub use command_asr::CommandAsr;
pub use keyword_slu::KeywordSlu;
pub use rule_dm::RuleDialoguePolicy;
pub use template_nlg::TemplateNlg;
pub use tts::{CommandTts, ToneTts};

use tokio::process::Command;

/// Builds a process from a whitespace-separated command line; `None` when it is blank.
fn command_line(line: &str) -> Option<Command> {
    let mut parts = line.split_whitespace();
    let mut cmd = Command::new(parts.next()?);
    cmd.args(parts).kill_on_drop(true);
    Some(cmd)
}

fn scratch_wav(prefix: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("{}-{}.wav", prefix, uuid::Uuid::new_v4()))
}
