use std::sync::Arc;

/// Immutable block of signed 16-bit mono PCM.
///
/// A frame is the transport unit of every audio channel. Cloning aliases the
/// sample buffer, so frames move between stages without copying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    samples: Arc<[i16]>,
}

impl Frame {
    pub fn new(samples: Vec<i16>) -> Self {
        Self {
            samples: samples.into(),
        }
    }

    pub fn silence(len: usize) -> Self {
        Self::new(vec![0; len])
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl From<Vec<i16>> for Frame {
    fn from(samples: Vec<i16>) -> Self {
        Self::new(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_aliases_samples() {
        let a = Frame::new(vec![1, 2, 3]);
        let b = a.clone();
        assert!(std::ptr::eq(a.samples().as_ptr(), b.samples().as_ptr()));
        assert_eq!(b.len(), 3);
    }
}
