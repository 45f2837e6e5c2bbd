use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};

use super::http::{join_url, send_json};
use super::{
    normalise_messages, AdapterSpec, ChatMessage, Completion, CompletionOptions, ProviderAdapter,
    ProviderKind,
};
use crate::errors::{AiError, AiResult};

pub const DEFAULT_OPENAI_URL: &str = "https://api.openai.com";

/// Chat-completions adapter for OpenAI and hosted APIs that copy its shape.
pub struct OpenAiAdapter {
    client: Client,
    kind: ProviderKind,
    base_url: String,
    api_key: SecretString,
    model: String,
    timeout: Duration,
}

impl OpenAiAdapter {
    pub fn build(client: &Client, mut spec: AdapterSpec) -> AiResult<Arc<dyn ProviderAdapter>> {
        let base_url = match spec.kind {
            ProviderKind::HostedGeneric => spec.required_endpoint()?,
            _ => spec
                .endpoint
                .clone()
                .unwrap_or_else(|| DEFAULT_OPENAI_URL.to_string()),
        };
        Ok(Arc::new(Self {
            client: client.clone(),
            kind: spec.kind,
            model: spec.model_or_default()?,
            api_key: spec.required_credential()?,
            base_url,
            timeout: spec.timeout,
        }))
    }

    /// `https://api.openai.com` and `https://host/api/v1` both resolve to the
    /// chat completions route.
    fn completions_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            base.to_string()
        } else if base.ends_with("/v1") {
            join_url(base, "chat/completions")
        } else {
            join_url(base, "v1/chat/completions")
        }
    }

    fn payload(&self, messages: &[ChatMessage], options: &CompletionOptions) -> Value {
        let mut payload = json!({
            "model": self.model,
            "messages": normalise_messages(messages),
            "temperature": options.temperature.unwrap_or(CompletionOptions::DEFAULT_TEMPERATURE),
        });
        if let Some(top_p) = options.top_p {
            payload["top_p"] = json!(top_p);
        }
        if let Some(max_tokens) = options.max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }
        payload
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> AiResult<Completion> {
        if messages.is_empty() {
            return Err(AiError::InvalidRequest("no messages to complete".into()));
        }
        let url = self.completions_url();
        let request = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .bearer_auth(self.api_key.expose_secret())
            .json(&self.payload(messages, options));
        let body = send_json(request, &self.base_url, &self.model).await?;
        parse_response(&body)
    }
}

fn parse_response(body: &Value) -> AiResult<Completion> {
    let content = body
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .and_then(|msg| msg.get("content"))
        .and_then(|val| val.as_str())
        .ok_or_else(|| AiError::ProviderError {
            status: None,
            message: "response carried no choices".into(),
        })?
        .to_string();
    Ok(Completion {
        content,
        tokens_used: extract_usage(body),
    })
}

fn extract_usage(body: &Value) -> Option<u64> {
    let usage = body.get("usage")?;
    usage.get("total_tokens").and_then(Value::as_u64).or_else(|| {
        let prompt = usage.get("prompt_tokens").and_then(Value::as_u64);
        let completion = usage.get("completion_tokens").and_then(Value::as_u64);
        match (prompt, completion) {
            (None, None) => None,
            (p, c) => Some(p.unwrap_or(0) + c.unwrap_or(0)),
        }
    })
}
