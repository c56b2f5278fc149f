use std::collections::VecDeque;

use crate::shared::config::VadConfig;
use crate::shared::entities::Frame;

/// Per-frame raw speech decision in `[0, 1]`.
pub trait FrameClassifier: Send {
    fn decide(&mut self, frame: &Frame) -> f32;

    /// Forgets anything learned about the current line, e.g. at the start of a call.
    fn reset(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Start,
    End,
}

/// Outcome of one frame: an optional state change plus the frames to forward.
#[derive(Debug, Default)]
pub struct Step {
    pub transition: Option<Transition>,
    pub frames: Vec<Frame>,
}

/// Fixed-length window of raw decisions, zero-filled when created or reset.
#[derive(Debug)]
struct DecisionWindow {
    values: VecDeque<f32>,
}

impl DecisionWindow {
    fn new(len: usize) -> Self {
        Self {
            values: std::iter::repeat(0.0).take(len.max(1)).collect(),
        }
    }

    fn push(&mut self, d: f32) {
        self.values.pop_front();
        self.values.push_back(d);
    }

    fn mean(&self) -> f32 {
        self.values.iter().sum::<f32>() / self.values.len() as f32
    }

    fn reset(&mut self) {
        self.values.iter_mut().for_each(|v| *v = 0.0);
    }
}

/// Hysteresis over two smoothing windows with a pre-roll buffer.
///
/// Silence turns into speech once the speech window's mean exceeds the upper threshold, and
/// speech turns back into silence once the silence window's mean drops under the lower one.
/// While silent the last `speech_buffer_frames` frames are kept so the start of an utterance
/// is not clipped.
#[derive(Debug)]
pub struct SpeechDetector {
    speech_window: DecisionWindow,
    sil_window: DecisionWindow,
    up: f32,
    down: f32,
    preroll: VecDeque<Frame>,
    preroll_cap: usize,
    in_speech: bool,
}

impl SpeechDetector {
    pub fn new(cfg: &VadConfig) -> Self {
        let preroll_cap = cfg.speech_buffer_frames.max(1);
        Self {
            speech_window: DecisionWindow::new(cfg.decision_frames_speech),
            sil_window: DecisionWindow::new(cfg.decision_frames_sil),
            up: cfg.decision_speech_threshold,
            down: cfg.decision_non_speech_threshold,
            preroll: VecDeque::with_capacity(preroll_cap + 1),
            preroll_cap,
            in_speech: false,
        }
    }

    pub fn in_speech(&self) -> bool {
        self.in_speech
    }

    pub fn push(&mut self, frame: Frame, decision: f32) -> Step {
        self.speech_window.push(decision);
        self.sil_window.push(decision);

        self.preroll.push_back(frame);
        while self.preroll.len() > self.preroll_cap {
            self.preroll.pop_front();
        }

        let transition = if !self.in_speech && self.speech_window.mean() > self.up {
            self.in_speech = true;
            Some(Transition::Start)
        } else if self.in_speech && self.sil_window.mean() < self.down {
            self.in_speech = false;
            Some(Transition::End)
        } else {
            None
        };

        let frames = if self.in_speech {
            self.preroll.drain(..).collect()
        } else {
            Vec::new()
        };
        Step { transition, frames }
    }

    pub fn reset(&mut self) {
        self.speech_window.reset();
        self.sil_window.reset();
        self.preroll.clear();
        self.in_speech = false;
    }
}
