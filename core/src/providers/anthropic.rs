use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};

use super::http::{join_url, send_json};
use super::{
    normalise_role, AdapterSpec, ChatMessage, Completion, CompletionOptions, ProviderAdapter,
    ProviderKind,
};
use crate::errors::{AiError, AiResult};

pub const DEFAULT_ANTHROPIC_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
/// The messages API rejects requests without an explicit output budget.
const DEFAULT_MAX_TOKENS: u32 = 1024;

pub struct AnthropicAdapter {
    client: Client,
    base_url: String,
    api_key: SecretString,
    model: String,
    timeout: Duration,
}

impl AnthropicAdapter {
    pub fn build(client: &Client, mut spec: AdapterSpec) -> AiResult<Arc<dyn ProviderAdapter>> {
        Ok(Arc::new(Self {
            client: client.clone(),
            base_url: spec
                .endpoint
                .clone()
                .unwrap_or_else(|| DEFAULT_ANTHROPIC_URL.to_string()),
            model: spec.model_or_default()?,
            api_key: spec.required_credential()?,
            timeout: spec.timeout,
        }))
    }

    fn payload(&self, messages: &[ChatMessage], options: &CompletionOptions) -> AiResult<Value> {
        let mut system_prompt = String::new();
        let mut turns = Vec::new();
        for msg in messages {
            match normalise_role(&msg.role) {
                "system" => {
                    if !system_prompt.is_empty() {
                        system_prompt.push_str("\n\n");
                    }
                    system_prompt.push_str(&msg.content);
                }
                role => turns.push(json!({
                    "role": role,
                    "content": [{"type": "text", "text": msg.content}],
                })),
            }
        }
        if turns.is_empty() {
            return Err(AiError::InvalidRequest(
                "Anthropic needs at least one user or assistant message".into(),
            ));
        }

        let mut payload = json!({
            "model": self.model,
            "max_tokens": options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": turns,
            "temperature": options.temperature.unwrap_or(CompletionOptions::DEFAULT_TEMPERATURE),
        });
        if !system_prompt.is_empty() {
            payload["system"] = Value::String(system_prompt);
        }
        if let Some(top_p) = options.top_p {
            payload["top_p"] = json!(top_p);
        }
        Ok(payload)
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> AiResult<Completion> {
        let payload = self.payload(messages, options)?;
        let request = self
            .client
            .post(join_url(&self.base_url, "v1/messages"))
            .timeout(self.timeout)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&payload);
        let body = send_json(request, &self.base_url, &self.model).await?;
        parse_response(&body)
    }
}

fn parse_response(body: &Value) -> AiResult<Completion> {
    let blocks = body
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| AiError::ProviderError {
            status: None,
            message: "response carried no content blocks".into(),
        })?;
    let content = blocks
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("");
    let tokens_used = body.get("usage").and_then(|usage| {
        let input = usage.get("input_tokens").and_then(Value::as_u64);
        let output = usage.get("output_tokens").and_then(Value::as_u64);
        match (input, output) {
            (None, None) => None,
            (i, o) => Some(i.unwrap_or(0) + o.unwrap_or(0)),
        }
    });
    Ok(Completion {
        content,
        tokens_used,
    })
}
