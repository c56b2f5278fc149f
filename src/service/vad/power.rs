use crate::shared::config::PowerVadConfig;
use crate::shared::entities::Frame;

use super::detector::FrameClassifier;

/// Energy classifier. The threshold starts at the configured floor and, during the first
/// `adaptation_frames` frames of a line, rises to the mean background energy.
#[derive(Debug)]
pub struct PowerVad {
    cfg: PowerVadConfig,
    threshold: f32,
    background_sum: f32,
    adapted_frames: u32,
}

impl PowerVad {
    pub fn new(cfg: PowerVadConfig) -> Self {
        Self {
            threshold: cfg.threshold,
            cfg,
            background_sum: 0.0,
            adapted_frames: 0,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

pub fn frame_energy(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    (sum_sq.sqrt() / samples.len() as f64) as f32
}

impl FrameClassifier for PowerVad {
    fn decide(&mut self, frame: &Frame) -> f32 {
        let energy = frame_energy(frame.samples());
        if self.adapted_frames < self.cfg.adaptation_frames {
            self.adapted_frames += 1;
            self.background_sum += energy;
            let background = self.background_sum / self.adapted_frames as f32;
            self.threshold = self.cfg.threshold.max(background);
            return 0.0;
        }
        if energy > self.cfg.threshold_multiplier * self.threshold {
            1.0
        } else {
            0.0
        }
    }

    fn reset(&mut self) {
        self.threshold = self.cfg.threshold;
        self.background_sum = 0.0;
        self.adapted_frames = 0;
    }
}
