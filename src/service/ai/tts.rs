use std::f32::consts::PI;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;

use crate::media::read_wav_8k;
use crate::shared::ports::{AiFuture, TtsError, TtsPort};

use super::{command_line, scratch_wav};

/// Stand-in synthesizer: one short beep per word, pitched by word length.
#[derive(Debug, Clone)]
pub struct ToneTts {
    pub tone: std::time::Duration,
    pub gap: std::time::Duration,
    pub amplitude: f32,
}

impl Default for ToneTts {
    fn default() -> Self {
        Self {
            tone: std::time::Duration::from_millis(120),
            gap: std::time::Duration::from_millis(60),
            amplitude: 6000.0,
        }
    }
}

impl ToneTts {
    fn render(&self, text: &str, sample_rate: u32) -> Vec<i16> {
        let tone_len = duration_samples(self.tone, sample_rate);
        let gap_len = duration_samples(self.gap, sample_rate);
        let mut samples = Vec::new();
        for word in text.split_whitespace() {
            let freq = 300.0 + 40.0 * word.chars().count().min(20) as f32;
            samples.extend((0..tone_len).map(|n| {
                let t = n as f32 / sample_rate as f32;
                (self.amplitude * (2.0 * PI * freq * t).sin()) as i16
            }));
            samples.extend(std::iter::repeat(0).take(gap_len));
        }
        samples
    }
}

fn duration_samples(d: std::time::Duration, sample_rate: u32) -> usize {
    (d.as_micros() * u128::from(sample_rate) / 1_000_000) as usize
}

impl TtsPort for ToneTts {
    fn synthesize(&self, text: String, sample_rate: u32) -> AiFuture<Result<Vec<i16>, TtsError>> {
        let samples = self.render(&text, sample_rate);
        Box::pin(async move { Ok(samples) })
    }
}

/// Runs `TTS_COMMAND <out.wav>` with the sentence on stdin and reads back the WAV it wrote.
#[derive(Debug, Clone)]
pub struct CommandTts {
    command: String,
}

impl CommandTts {
    pub fn new(command: String) -> Self {
        Self { command }
    }
}

impl TtsPort for CommandTts {
    fn synthesize(&self, text: String, sample_rate: u32) -> AiFuture<Result<Vec<i16>, TtsError>> {
        let command = self.command.clone();
        Box::pin(async move {
            if sample_rate != 8000 {
                return Err(TtsError::InvalidFormat(format!(
                    "output must be 8000 Hz, asked for {}",
                    sample_rate
                )));
            }
            let mut cmd = command_line(&command)
                .ok_or_else(|| TtsError::SynthesisFailed("empty TTS command".into()))?;
            let path = scratch_wav("voicehub-tts");
            let result = run_synthesizer(&mut cmd, &path, &text).await;
            if let Err(e) = tokio::fs::remove_file(&path).await {
                log::debug!("[tts] cannot remove {}: {}", path.display(), e);
            }
            result
        })
    }
}

async fn run_synthesizer(
    cmd: &mut tokio::process::Command,
    path: &std::path::Path,
    text: &str,
) -> Result<Vec<i16>, TtsError> {
    let mut child = cmd
        .arg(path)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| TtsError::SynthesisFailed(e.to_string()))?;
    if let Some(mut stdin) = child.stdin.take() {
        // a synthesizer that takes no input may close stdin early
        if let Err(e) = stdin.write_all(text.as_bytes()).await {
            log::debug!("[tts] synthesizer stdin: {}", e);
        }
    }
    let output = child
        .wait_with_output()
        .await
        .map_err(|e| TtsError::SynthesisFailed(e.to_string()))?;
    if !output.status.success() {
        return Err(TtsError::SynthesisFailed(format!(
            "synthesizer exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || read_wav_8k(&path))
        .await
        .map_err(|e| TtsError::SynthesisFailed(e.to_string()))?
        .map_err(|e| TtsError::InvalidFormat(format!("{:#}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn one_tone_per_word() {
        let tts = ToneTts::default();
        let samples = tts.synthesize("three short words".into(), 8000).await.unwrap();
        // 120 ms tone + 60 ms gap per word at 8 kHz
        assert_eq!(samples.len(), 3 * (960 + 480));
        assert!(samples[..960].iter().any(|&s| s != 0));
        assert!(samples[960..1440].iter().all(|&s| s == 0));
        assert!(tts.synthesize("".into(), 8000).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn command_rejects_other_rates() {
        let tts = CommandTts::new("true".into());
        assert!(matches!(
            tts.synthesize("hi".into(), 16000).await,
            Err(TtsError::InvalidFormat(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_failure_and_missing_wav_are_errors() {
        assert!(matches!(
            CommandTts::new("false".into())
                .synthesize("hi".into(), 8000)
                .await,
            Err(TtsError::SynthesisFailed(_))
        ));
        // succeeds without writing the file
        assert!(matches!(
            CommandTts::new("true".into())
                .synthesize("hi".into(), 8000)
                .await,
            Err(TtsError::InvalidFormat(_))
        ));
    }
}
