use crate::shared::entities::Frame;

/// Regroups an arbitrary sample stream into frames of exactly `samples_per_frame`.
#[derive(Debug)]
pub struct Framer {
    samples_per_frame: usize,
    pending: Vec<i16>,
}

impl Framer {
    pub fn new(samples_per_frame: usize) -> Self {
        Self {
            samples_per_frame,
            pending: Vec::with_capacity(samples_per_frame * 2),
        }
    }

    pub fn push(&mut self, samples: &[i16]) -> Vec<Frame> {
        self.pending.extend_from_slice(samples);
        let whole = self.pending.len() / self.samples_per_frame * self.samples_per_frame;
        let frames = self.pending[..whole]
            .chunks_exact(self.samples_per_frame)
            .map(|c| Frame::new(c.to_vec()))
            .collect();
        self.pending.drain(..whole);
        frames
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Cuts a finished signal into frames, zero-padding the last one.
pub fn frames_from_samples(samples: &[i16], samples_per_frame: usize) -> Vec<Frame> {
    samples
        .chunks(samples_per_frame)
        .map(|c| {
            let mut v = c.to_vec();
            v.resize(samples_per_frame, 0);
            Frame::new(v)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framer_carries_remainder() {
        let mut framer = Framer::new(160);
        assert!(framer.push(&[1; 100]).is_empty());
        let frames = framer.push(&[2; 240]);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.len() == 160));
        assert_eq!(frames[0].samples()[99], 1);
        assert_eq!(frames[0].samples()[100], 2);
        assert!(framer.push(&[]).is_empty());
    }

    #[test]
    fn last_frame_is_padded() {
        let frames = frames_from_samples(&[7; 170], 160);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].samples()[9], 7);
        assert_eq!(frames[1].samples()[10], 0);
    }
}
