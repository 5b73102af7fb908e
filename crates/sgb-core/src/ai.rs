use async_trait::async_trait;

use crate::Result;

/// Who is asking, for prompt shaping and provider-side attribution.
#[derive(Clone, Debug, Default)]
pub struct UserContext {
    pub actor: String,
    pub actor_name: Option<String>,
    pub group_name: Option<String>,
}

/// Port for the AI text-completion collaborator.
///
/// Failures here are always recoverable: callers substitute the configured
/// fallback reply instead of surfacing an error to the sender.
#[async_trait]
pub trait CompletionPort: Send + Sync {
    async fn complete(&self, prompt: &str, ctx: &UserContext) -> Result<String>;
}

/// No-backend implementation used when no AI endpoint is configured.
pub struct NoCompletion;

#[async_trait]
impl CompletionPort for NoCompletion {
    async fn complete(&self, _prompt: &str, _ctx: &UserContext) -> Result<String> {
        Err(crate::Error::External(
            "no completion backend configured".to_string(),
        ))
    }
}
