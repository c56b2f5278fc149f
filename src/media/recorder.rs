use std::collections::HashMap;
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use serde::Serialize;

use super::{create_wav, WavSink};
use crate::shared::utils::file_stamp;

/// Per-call recordings and transcript kept by VIO in `<sessions_dir>/<stamp>-<user>`.
///
/// Write failures are logged and the affected writer is dropped; the call goes on.
pub struct SessionRecorder {
    dir: PathBuf,
    stamp: String,
    remote_uri: String,
    sample_rate: u32,
    recorded: Option<WavSink>,
    played: Option<WavSink>,
    utterances: HashMap<String, WavSink>,
    transcript: Option<BufWriter<File>>,
    started_at: SystemTime,
    recorded_samples: u64,
    played_samples: u64,
    utterance_files: Vec<String>,
}

impl SessionRecorder {
    pub fn create(
        sessions_dir: &Path,
        user: &str,
        remote_uri: &str,
        sample_rate: u32,
    ) -> Result<Self> {
        let stamp = file_stamp();
        let safe_user: String = user
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '+' { c } else { '_' })
            .collect();
        let dir = sessions_dir.join(format!("{}-{}", stamp, safe_user));
        create_dir_all(&dir).with_context(|| format!("create session dir {}", dir.display()))?;
        let recorded = create_wav(&dir.join(format!("all-{}.recorded.wav", stamp)), sample_rate)?;
        let played = create_wav(&dir.join(format!("all-{}.played.wav", stamp)), sample_rate)?;
        let transcript = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("transcript.jsonl"))?;
        Ok(Self {
            dir,
            stamp,
            remote_uri: remote_uri.to_string(),
            sample_rate,
            recorded: Some(recorded),
            played: Some(played),
            utterances: HashMap::new(),
            transcript: Some(BufWriter::new(transcript)),
            started_at: SystemTime::now(),
            recorded_samples: 0,
            played_samples: 0,
            utterance_files: Vec::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn push_recorded(&mut self, samples: &[i16]) {
        self.recorded_samples += samples.len() as u64;
        write_samples(&mut self.recorded, samples, "recorded");
    }

    pub fn push_played(&mut self, samples: &[i16]) {
        self.played_samples += samples.len() as u64;
        write_samples(&mut self.played, samples, "played");
        let mut failed = Vec::new();
        for (fname, writer) in self.utterances.iter_mut() {
            if samples.iter().try_for_each(|&s| writer.write_sample(s)).is_err() {
                failed.push(fname.clone());
            }
        }
        for fname in failed {
            log::warn!("[vio] dropping utterance recording {}", fname);
            self.utterances.remove(&fname);
        }
    }

    /// Starts copying played audio into `<dir>/<fname>`.
    pub fn begin_utterance(&mut self, fname: &str) {
        match create_wav(&self.dir.join(fname), self.sample_rate) {
            Ok(writer) => {
                self.utterances.insert(fname.to_string(), writer);
                self.utterance_files.push(fname.to_string());
            }
            Err(e) => log::warn!("[vio] cannot record utterance {}: {:#}", fname, e),
        }
    }

    pub fn end_utterance(&mut self, fname: &str) {
        if let Some(writer) = self.utterances.remove(fname) {
            if let Err(e) = writer.finalize() {
                log::warn!("[vio] finalize utterance {} failed: {}", fname, e);
            }
        }
    }

    /// Closes every open utterance file, as after a flush.
    pub fn end_all_utterances(&mut self) {
        let names: Vec<String> = self.utterances.keys().cloned().collect();
        for fname in names {
            self.end_utterance(&fname);
        }
    }

    pub fn log_transcript<T: Serialize>(&mut self, entry: &T) {
        let Some(out) = self.transcript.as_mut() else {
            return;
        };
        let result = serde_json::to_string(entry)
            .map_err(std::io::Error::from)
            .and_then(|line| writeln!(out, "{}", line))
            .and_then(|_| out.flush());
        if let Err(e) = result {
            log::warn!("[vio] transcript write failed: {}", e);
            self.transcript = None;
        }
    }

    /// Finalizes every file and writes `meta.json`.
    pub fn finish(mut self) -> Result<PathBuf> {
        self.end_all_utterances();
        if let Some(w) = self.recorded.take() {
            w.finalize()?;
        }
        if let Some(w) = self.played.take() {
            w.finalize()?;
        }
        if let Some(mut t) = self.transcript.take() {
            t.flush()?;
        }
        self.write_meta()?;
        Ok(self.dir)
    }

    fn write_meta(&self) -> Result<()> {
        #[derive(Serialize)]
        struct MetaFiles<'a> {
            recorded: String,
            played: String,
            transcript: &'a str,
            utterances: &'a [String],
        }
        #[allow(non_snake_case)]
        #[derive(Serialize)]
        struct Meta<'a> {
            remoteUri: &'a str,
            recordingStartedAt: String,
            sampleRate: u32,
            recordedDurationSec: f64,
            playedDurationSec: f64,
            files: MetaFiles<'a>,
        }
        let meta = Meta {
            remoteUri: &self.remote_uri,
            recordingStartedAt: humantime::format_rfc3339(self.started_at).to_string(),
            sampleRate: self.sample_rate,
            recordedDurationSec: self.recorded_samples as f64 / self.sample_rate as f64,
            playedDurationSec: self.played_samples as f64 / self.sample_rate as f64,
            files: MetaFiles {
                recorded: format!("all-{}.recorded.wav", self.stamp),
                played: format!("all-{}.played.wav", self.stamp),
                transcript: "transcript.jsonl",
                utterances: &self.utterance_files,
            },
        };
        let file = File::create(self.dir.join("meta.json"))?;
        serde_json::to_writer_pretty(file, &meta)?;
        Ok(())
    }
}

fn write_samples(writer: &mut Option<WavSink>, samples: &[i16], what: &str) {
    let Some(w) = writer.as_mut() else {
        return;
    };
    if let Err(e) = samples.iter().try_for_each(|&s| w.write_sample(s)) {
        log::warn!("[vio] {} recording stopped: {}", what, e);
        *writer = None;
    }
}
