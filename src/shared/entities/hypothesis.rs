use serde::Serialize;

use super::dialogue_act::{DialogueAct, DialogueActItem};

/// Token used by recognizers for an utterance with no recognizable words.
pub const SILENCE_TOKEN: &str = "_silence_";

/// Ordered `(probability, value)` alternatives, best first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NBestList<T> {
    pub items: Vec<(f32, T)>,
}

impl<T: PartialEq> NBestList<T> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Adds `value`, merging probability mass into an existing equal entry.
    pub fn add(&mut self, prob: f32, value: T) {
        if let Some(slot) = self.items.iter_mut().find(|(_, v)| *v == value) {
            slot.0 += prob;
        } else {
            self.items.push((prob, value));
        }
    }

    /// Sorts best first and rescales the probabilities to sum to 1.
    pub fn normalize(&mut self) {
        self.items
            .sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        let total: f32 = self.items.iter().map(|(p, _)| *p).sum();
        if total > 0.0 {
            for (p, _) in &mut self.items {
                *p /= total;
            }
        }
    }

    /// Drops alternatives below `min_prob`, always keeping the best one.
    pub fn prune(&mut self, min_prob: f32) {
        self.normalize();
        let mut first = true;
        self.items.retain(|(p, _)| {
            let keep = first || *p >= min_prob;
            first = false;
            keep
        });
        self.normalize();
    }

    pub fn best(&self) -> Option<&T> {
        self.items
            .iter()
            .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(_, v)| v)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T: PartialEq> Default for NBestList<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Sequence of positions, each a set of alternatives whose probabilities sum to 1.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfusionNetwork<T> {
    pub positions: Vec<Vec<(f32, T)>>,
}

impl<T: Clone> ConfusionNetwork<T> {
    pub fn new() -> Self {
        Self {
            positions: Vec::new(),
        }
    }

    pub fn push_position(&mut self, mut alternatives: Vec<(f32, T)>) {
        normalize_position(&mut alternatives);
        self.positions.push(alternatives);
    }

    pub fn normalize(&mut self) {
        for pos in &mut self.positions {
            normalize_position(pos);
        }
    }

    /// Drops alternatives below `min_prob` inside each position, keeping each position's best.
    pub fn prune(&mut self, min_prob: f32) {
        for pos in &mut self.positions {
            normalize_position(pos);
            let best = pos.first().cloned();
            pos.retain(|(p, _)| *p >= min_prob);
            if pos.is_empty() {
                pos.extend(best);
            }
            normalize_position(pos);
        }
    }

    /// The highest-probability alternative of every position, in order.
    pub fn best_sequence(&self) -> Vec<T> {
        self.positions
            .iter()
            .filter_map(|pos| {
                pos.iter()
                    .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
                    .map(|(_, v)| v.clone())
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

impl<T: Clone> Default for ConfusionNetwork<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_position<T>(pos: &mut [(f32, T)]) {
    pos.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    let total: f32 = pos.iter().map(|(p, _)| *p).sum();
    if total > 0.0 {
        for (p, _) in pos.iter_mut() {
            *p /= total;
        }
    }
}

/// Output of the recognizer: an n-best list of word sequences or a word confusion network.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AsrHypothesis {
    NBest(NBestList<Vec<String>>),
    ConfusionNetwork(ConfusionNetwork<String>),
}

impl AsrHypothesis {
    /// One-position network holding only the silence token.
    pub fn silence() -> Self {
        let mut cn = ConfusionNetwork::new();
        cn.push_position(vec![(1.0, SILENCE_TOKEN.to_string())]);
        Self::ConfusionNetwork(cn)
    }

    /// Best word sequence with silence tokens removed.
    pub fn best_words(&self) -> Vec<String> {
        let words = match self {
            Self::NBest(nb) => nb.best().cloned().unwrap_or_default(),
            Self::ConfusionNetwork(cn) => cn.best_sequence(),
        };
        words
            .into_iter()
            .filter(|w| w != SILENCE_TOKEN && !w.is_empty())
            .collect()
    }

    pub fn best_text(&self) -> String {
        self.best_words().join(" ")
    }
}

/// Output of SLU, shaped like the ASR hypothesis it was parsed from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SluHypothesis {
    NBest(NBestList<DialogueAct>),
    ConfusionNetwork(ConfusionNetwork<DialogueActItem>),
}

impl SluHypothesis {
    /// Collapses the hypothesis into its single most likely dialogue act.
    pub fn best_act(&self) -> DialogueAct {
        match self {
            Self::NBest(nb) => {
                let mut da = nb.best().cloned().unwrap_or_default();
                da.confidence = nb.items.first().map(|(p, _)| *p);
                da
            }
            Self::ConfusionNetwork(cn) => DialogueAct::new(cn.best_sequence()),
        }
    }
}
