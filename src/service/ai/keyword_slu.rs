use crate::shared::entities::{
    AsrHypothesis, ConfusionNetwork, DialogueAct, DialogueActItem, NBestList, SluHypothesis,
};
use crate::shared::ports::{AiFuture, SluError, SluPort};

/// Spots a handful of keywords; everything else parses to `null()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordSlu;

impl SluPort for KeywordSlu {
    fn parse(&self, hyp: AsrHypothesis) -> AiFuture<Result<SluHypothesis, SluError>> {
        Box::pin(async move { Ok(parse_hypothesis(&hyp)) })
    }
}

fn parse_hypothesis(hyp: &AsrHypothesis) -> SluHypothesis {
    match hyp {
        AsrHypothesis::NBest(words) => {
            let mut nb = NBestList::new();
            for (prob, sentence) in &words.items {
                nb.add(*prob, parse_words(sentence));
            }
            if nb.is_empty() {
                nb.add(1.0, DialogueAct::single("null"));
            }
            nb.normalize();
            SluHypothesis::NBest(nb)
        }
        AsrHypothesis::ConfusionNetwork(words) => {
            let mut cn = ConfusionNetwork::new();
            let mut prev_best: Option<&str> = None;
            for position in &words.positions {
                let mut alternatives: Vec<(f32, DialogueActItem)> = Vec::new();
                for (prob, word) in position {
                    let Some(item) = keyword(word, prev_best) else { continue };
                    match alternatives.iter_mut().find(|(_, i)| *i == item) {
                        Some(slot) => slot.0 += prob,
                        None => alternatives.push((*prob, item)),
                    }
                }
                prev_best = position.first().map(|(_, w)| w.as_str());
                if alternatives.is_empty() {
                    continue;
                }
                let covered: f32 = alternatives.iter().map(|(p, _)| p).sum();
                if covered < 1.0 {
                    alternatives.push((1.0 - covered, DialogueActItem::new("null")));
                }
                cn.push_position(alternatives);
            }
            if cn.is_empty() {
                cn.push_position(vec![(1.0, DialogueActItem::new("null"))]);
            }
            SluHypothesis::ConfusionNetwork(cn)
        }
    }
}

fn parse_words(words: &[String]) -> DialogueAct {
    let mut act = DialogueAct::default();
    let mut prev: Option<&str> = None;
    for word in words {
        if let Some(item) = keyword(word, prev) {
            act.push(item);
        }
        prev = Some(word.as_str());
    }
    if act.is_empty() {
        act.push(DialogueActItem::new("null"));
    }
    act
}

/// Maps one word, looking at the word before it for "thank you".
fn keyword(word: &str, prev: Option<&str>) -> Option<DialogueActItem> {
    let act_type = match word.to_lowercase().as_str() {
        "hello" | "hi" | "hey" => "hello",
        "bye" | "goodbye" => "bye",
        "thanks" => "thankyou",
        "you" if prev.is_some_and(|p| p.eq_ignore_ascii_case("thank")) => "thankyou",
        "yes" | "yeah" | "yep" => "affirm",
        "no" | "nope" => "negate",
        "repeat" | "again" => "repeat",
        "help" => "help",
        "restart" => "restart",
        _ => return None,
    };
    Some(DialogueActItem::new(act_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nbest(alternatives: &[(f32, &str)]) -> AsrHypothesis {
        let mut nb = NBestList::new();
        for (p, text) in alternatives {
            nb.add(*p, text.split_whitespace().map(String::from).collect());
        }
        AsrHypothesis::NBest(nb)
    }

    #[tokio::test]
    async fn nbest_words_become_acts() {
        let parsed = KeywordSlu
            .parse(nbest(&[(0.7, "thank you goodbye"), (0.3, "tank you")]))
            .await
            .unwrap();
        let SluHypothesis::NBest(nb) = parsed else {
            panic!("shape changed");
        };
        assert_eq!(nb.items.len(), 2);
        assert_eq!(nb.items[0].1.to_string(), "thankyou()&bye()");
        assert_eq!(nb.items[1].1, DialogueAct::single("null"));
    }

    #[tokio::test]
    async fn silence_network_parses_to_null() {
        let parsed = KeywordSlu.parse(AsrHypothesis::silence()).await.unwrap();
        assert!(matches!(parsed, SluHypothesis::ConfusionNetwork(_)));
        assert_eq!(parsed.best_act(), DialogueAct::single("null"));
    }

    #[tokio::test]
    async fn network_keeps_keyword_positions() {
        let mut cn = ConfusionNetwork::new();
        cn.push_position(vec![(0.8, "um".to_string()), (0.2, "oh".to_string())]);
        cn.push_position(vec![(0.6, "yes".to_string()), (0.4, "less".to_string())]);
        let parsed = KeywordSlu
            .parse(AsrHypothesis::ConfusionNetwork(cn))
            .await
            .unwrap();
        let SluHypothesis::ConfusionNetwork(out) = &parsed else {
            panic!("shape changed");
        };
        assert_eq!(out.positions.len(), 1);
        assert_eq!(parsed.best_act(), DialogueAct::single("affirm"));
    }
}
