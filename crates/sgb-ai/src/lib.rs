//! AI completion adapter (OpenAI-compatible chat endpoint).
//!
//! The daemon treats this collaborator as best-effort: any failure here is
//! recoverable and the caller substitutes a fallback reply.

use async_trait::async_trait;
use serde_json::json;

use sgb_core::{
    ai::{CompletionPort, UserContext},
    errors::Error,
    Result,
};

const MAX_COMPLETION_TOKENS: u32 = 512;

#[derive(Clone, Debug)]
pub struct AiClient {
    api_url: String,
    api_key: Option<String>,
    model: String,
    http: reqwest::Client,
}

impl AiClient {
    pub fn new(api_url: impl Into<String>, api_key: Option<String>, model: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("reqwest client build");
        Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            http,
        }
    }

    fn system_prompt(ctx: &UserContext) -> String {
        let mut prompt = String::from(
            "You are a concise assistant for a Signal community. \
             Answer in a few sentences of plain text; no markup.",
        );
        if let Some(name) = &ctx.actor_name {
            prompt.push_str(&format!(" The user goes by {name}."));
        }
        if let Some(group) = &ctx.group_name {
            prompt.push_str(&format!(" The conversation happens in the group {group}."));
        }
        prompt
    }
}

#[async_trait]
impl CompletionPort for AiClient {
    async fn complete(&self, prompt: &str, ctx: &UserContext) -> Result<String> {
        let body = json!({
            "model": self.model,
            "max_tokens": MAX_COMPLETION_TOKENS,
            "messages": [
                { "role": "system", "content": Self::system_prompt(ctx) },
                { "role": "user", "content": prompt },
            ],
        });

        let mut req = self
            .http
            .post(format!("{}/v1/chat/completions", self.api_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| Error::External(format!("completion request error: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::External(format!(
                "completion failed: {status} {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        let v: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| Error::External(format!("completion json error: {e}")))?;

        let text = v
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim()
            .to_string();

        if text.is_empty() {
            return Err(Error::External(
                "completion returned empty text".to_string(),
            ));
        }

        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slash_is_stripped_from_the_endpoint() {
        let c = AiClient::new("https://api.example.org/", None, "test-model");
        assert_eq!(c.api_url, "https://api.example.org");
    }

    #[test]
    fn system_prompt_mentions_known_context() {
        let ctx = UserContext {
            actor: "+491700000001".to_string(),
            actor_name: Some("Ada".to_string()),
            group_name: Some("Rust Hackers".to_string()),
        };
        let p = AiClient::system_prompt(&ctx);
        assert!(p.contains("Ada"));
        assert!(p.contains("Rust Hackers"));
    }
}
