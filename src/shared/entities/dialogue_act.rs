use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

/// One `(act-type, slot, value)` triple, e.g. `inform(food="chinese")`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DialogueActItem {
    pub act_type: String,
    pub slot: Option<String>,
    pub value: Option<String>,
}

impl DialogueActItem {
    pub fn new(act_type: impl Into<String>) -> Self {
        Self {
            act_type: act_type.into(),
            slot: None,
            value: None,
        }
    }

    pub fn with_slot(act_type: impl Into<String>, slot: impl Into<String>) -> Self {
        Self {
            act_type: act_type.into(),
            slot: Some(slot.into()),
            value: None,
        }
    }

    pub fn with_value(
        act_type: impl Into<String>,
        slot: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            act_type: act_type.into(),
            slot: Some(slot.into()),
            value: Some(value.into()),
        }
    }
}

impl fmt::Display for DialogueActItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.slot, &self.value) {
            (Some(slot), Some(value)) => write!(f, "{}({}=\"{}\")", self.act_type, slot, value),
            (Some(slot), None) => write!(f, "{}({})", self.act_type, slot),
            _ => write!(f, "{}()", self.act_type),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed dialogue act item: {0:?}")]
pub struct DialogueActParseError(pub String);

impl FromStr for DialogueActItem {
    type Err = DialogueActParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (act_type, rest) = s
            .split_once('(')
            .ok_or_else(|| DialogueActParseError(s.to_string()))?;
        let inner = rest
            .strip_suffix(')')
            .ok_or_else(|| DialogueActParseError(s.to_string()))?;
        let act_type = act_type.trim();
        if act_type.is_empty() {
            return Err(DialogueActParseError(s.to_string()));
        }
        let inner = inner.trim();
        if inner.is_empty() {
            return Ok(Self::new(act_type));
        }
        match inner.split_once('=') {
            Some((slot, value)) => Ok(Self::with_value(
                act_type,
                slot.trim(),
                value.trim().trim_matches('"'),
            )),
            None => Ok(Self::with_slot(act_type, inner)),
        }
    }
}

/// A set of dialogue act items with an optional confidence.
///
/// Items keep insertion order and duplicates are dropped on [`DialogueAct::push`].
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct DialogueAct {
    pub items: Vec<DialogueActItem>,
    pub confidence: Option<f32>,
}

impl DialogueAct {
    pub fn new(items: Vec<DialogueActItem>) -> Self {
        let mut act = Self::default();
        for item in items {
            act.push(item);
        }
        act
    }

    pub fn single(act_type: &str) -> Self {
        Self::new(vec![DialogueActItem::new(act_type)])
    }

    pub fn silence() -> Self {
        Self::single("silence")
    }

    pub fn push(&mut self, item: DialogueActItem) {
        if !self.items.contains(&item) {
            self.items.push(item);
        }
    }

    pub fn has_act_type(&self, act_type: &str) -> bool {
        self.items.iter().any(|i| i.act_type == act_type)
    }

    /// `true` for the heartbeat act `silence()`, which carries no content.
    pub fn is_silence(&self) -> bool {
        self.items.len() == 1 && self.items[0] == DialogueActItem::new("silence")
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl fmt::Display for DialogueAct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, item) in self.items.iter().enumerate() {
            if i > 0 {
                f.write_str("&")?;
            }
            write!(f, "{}", item)?;
        }
        Ok(())
    }
}

impl FromStr for DialogueAct {
    type Err = DialogueActParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let items = s
            .split('&')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(items))
    }
}
