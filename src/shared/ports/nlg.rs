use crate::shared::entities::DialogueAct;
use crate::shared::error::ai::NlgError;

use super::AiFuture;

pub trait NlgPort: Send + Sync {
    fn generate(&self, act: DialogueAct) -> AiFuture<Result<String, NlgError>>;
}
