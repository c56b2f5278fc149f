use std::process::Stdio;

use crate::media::write_wav;
use crate::shared::entities::{AsrHypothesis, Frame, NBestList};
use crate::shared::ports::{AiFuture, AsrError, AsrPort};

use super::{command_line, scratch_wav};

/// Runs `ASR_COMMAND <wav>` per utterance and takes the 1-best transcript from stdout.
#[derive(Debug, Clone)]
pub struct CommandAsr {
    command: Option<String>,
}

impl CommandAsr {
    pub fn new(command: Option<String>) -> Self {
        Self { command }
    }
}

impl AsrPort for CommandAsr {
    fn recognize(
        &self,
        frames: Vec<Frame>,
        sample_rate: u32,
    ) -> AiFuture<Result<AsrHypothesis, AsrError>> {
        let command = self.command.clone();
        Box::pin(async move {
            let mut cmd = command
                .as_deref()
                .and_then(command_line)
                .ok_or(AsrError::NotConfigured)?;
            if frames.is_empty() {
                return Err(AsrError::AudioTooShort);
            }
            let samples: Vec<i16> = frames
                .iter()
                .flat_map(|f| f.samples().iter().copied())
                .collect();
            let path = scratch_wav("voicehub-asr");
            write_wav(&path, sample_rate, &samples)
                .map_err(|e| AsrError::RecognitionFailed(format!("{:#}", e)))?;

            let output = cmd
                .arg(&path)
                .stdin(Stdio::null())
                .output()
                .await;
            if let Err(e) = tokio::fs::remove_file(&path).await {
                log::debug!("[asr] cannot remove {}: {}", path.display(), e);
            }
            let output = output.map_err(|e| AsrError::RecognitionFailed(e.to_string()))?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(AsrError::RecognitionFailed(format!(
                    "recognizer exited with {}: {}",
                    output.status,
                    stderr.trim()
                )));
            }
            Ok(hypothesis_from_text(&String::from_utf8_lossy(&output.stdout)))
        })
    }
}

/// One-entry n-best list of the lower-cased words; silence when there are none.
pub(crate) fn hypothesis_from_text(text: &str) -> AsrHypothesis {
    let words: Vec<String> = text
        .split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| c.is_ascii_punctuation())
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect();
    if words.is_empty() {
        return AsrHypothesis::silence();
    }
    let mut nb = NBestList::new();
    nb.add(1.0, words);
    AsrHypothesis::NBest(nb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_is_normalized() {
        let hyp = hypothesis_from_text("  Hello, World!\n");
        assert_eq!(hyp.best_words(), vec!["hello", "world"]);
        assert_eq!(hypothesis_from_text(" \n"), AsrHypothesis::silence());
    }

    #[tokio::test]
    async fn unconfigured_recognizer_fails() {
        let asr = CommandAsr::new(None);
        let res = asr.recognize(vec![Frame::silence(160)], 8000).await;
        assert!(matches!(res, Err(AsrError::NotConfigured)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_command_with_wav_argument() {
        let asr = CommandAsr::new(Some("echo yes please".into()));
        let hyp = asr
            .recognize(vec![Frame::silence(160)], 8000)
            .await
            .unwrap();
        let words = hyp.best_words();
        assert_eq!(&words[..2], &["yes", "please"]);
        assert!(words[2].ends_with(".wav"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_is_an_error() {
        let asr = CommandAsr::new(Some("false".into()));
        let res = asr.recognize(vec![Frame::silence(160)], 8000).await;
        assert!(matches!(res, Err(AsrError::RecognitionFailed(_))));
    }
}
