pub mod framer;
pub mod recorder;

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use anyhow::{bail, Result};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

pub use framer::{frames_from_samples, Framer};
pub use recorder::SessionRecorder;

pub type WavSink = WavWriter<BufWriter<File>>;

pub fn mono16_spec(sample_rate: u32) -> WavSpec {
    WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    }
}

pub fn create_wav(path: &Path, sample_rate: u32) -> Result<WavSink> {
    Ok(WavWriter::create(path, mono16_spec(sample_rate))?)
}

pub fn write_wav(path: &Path, sample_rate: u32, samples: &[i16]) -> Result<()> {
    let mut writer = create_wav(path, sample_rate)?;
    for &s in samples {
        writer.write_sample(s)?;
    }
    writer.finalize()?;
    Ok(())
}

/// Reads a 16-bit mono WAV, decimating 24 kHz input by 3 to reach 8 kHz.
pub fn read_wav_8k(path: &Path) -> Result<Vec<i16>> {
    let mut reader = WavReader::open(path)?;
    let spec = reader.spec();
    if spec.channels != 1 || spec.bits_per_sample != 16 || spec.sample_format != SampleFormat::Int
    {
        bail!(
            "unsupported wav format: channels={} bits={} format={:?}",
            spec.channels,
            spec.bits_per_sample,
            spec.sample_format
        );
    }
    let samples = reader.samples::<i16>().collect::<Result<Vec<_>, _>>()?;
    match spec.sample_rate {
        8000 => Ok(samples),
        24000 => Ok(samples.into_iter().step_by(3).collect()),
        other => bail!("unsupported sample rate {} Hz", other),
    }
}
