use crate::shared::entities::{DialogueAct, DialogueActItem};
use crate::shared::ports::{AiFuture, NlgError, NlgPort};

const TEMPLATES: &[(&str, &str)] = &[
    ("hello", "Hello. How can I help you?"),
    ("bye", "Goodbye."),
    ("thankyou", "You are welcome."),
    ("notunderstood", "Sorry, I did not understand that."),
    ("reqmore", "Are you still there?"),
    ("help", "You can say goodbye to end the call."),
    ("affirm", "Yes."),
    ("negate", "No."),
    ("silence", ""),
];

/// Renders every item of an act from a fixed table and joins the pieces.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateNlg;

impl NlgPort for TemplateNlg {
    fn generate(&self, act: DialogueAct) -> AiFuture<Result<String, NlgError>> {
        Box::pin(async move { render(&act) })
    }
}

fn render(act: &DialogueAct) -> Result<String, NlgError> {
    let mut pieces = Vec::with_capacity(act.items.len());
    for item in &act.items {
        let text = template(item).ok_or_else(|| NlgError::NoTemplate(act.to_string()))?;
        if !text.is_empty() {
            pieces.push(text);
        }
    }
    Ok(pieces.join(" "))
}

fn template(item: &DialogueActItem) -> Option<String> {
    if let (Some(slot), Some(value)) = (&item.slot, &item.value) {
        if item.act_type == "inform" {
            return Some(format!("The {} is {}.", slot, value));
        }
    }
    TEMPLATES
        .iter()
        .find(|(act_type, _)| *act_type == item.act_type)
        .map(|(_, text)| text.to_string())
}
