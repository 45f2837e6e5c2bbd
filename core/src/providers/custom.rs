use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use secrecy::{ExposeSecret, SecretString};

use super::http::{join_url, send_json};
use super::ollama::{chat_payload, parse_chat_body};
use super::{AdapterSpec, ChatMessage, Completion, CompletionOptions, ProviderAdapter, ProviderKind};
use crate::errors::{AiError, AiResult};

/// Caller-supplied endpoint that accepts the local chat request shape.
/// No model listing or pulling.
pub struct CustomEndpointAdapter {
    client: Client,
    url: String,
    credential: Option<SecretString>,
    model: String,
    timeout: Duration,
}

impl CustomEndpointAdapter {
    pub fn build(client: &Client, spec: AdapterSpec) -> AiResult<Arc<dyn ProviderAdapter>> {
        let endpoint = spec.required_endpoint()?;
        let model = spec.model_or_default()?;
        let credential = spec
            .credential
            .filter(|secret| !secret.expose_secret().trim().is_empty());
        Ok(Arc::new(Self {
            client: client.clone(),
            url: chat_url(&endpoint)?,
            credential,
            model,
            timeout: spec.timeout,
        }))
    }
}

/// A bare host gets the local chat route appended; an endpoint that already
/// names a path is used verbatim.
fn chat_url(endpoint: &str) -> AiResult<String> {
    let parsed = Url::parse(endpoint)
        .map_err(|err| AiError::InvalidConfig(format!("invalid endpoint {endpoint}: {err}")))?;
    if parsed.path().trim_matches('/').is_empty() {
        Ok(join_url(endpoint, "api/chat"))
    } else {
        Ok(endpoint.to_string())
    }
}

#[async_trait]
impl ProviderAdapter for CustomEndpointAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Custom
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
        let mut request = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&chat_payload(&self.model, messages, options));
        if let Some(secret) = &self.credential {
            request = request.bearer_auth(secret.expose_secret());
        }
        let body = send_json(request, &self.url, &self.model).await?;
        parse_chat_body(&body, &self.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn spec(endpoint: &str, credential: Option<&str>) -> AdapterSpec {
        AdapterSpec::new(ProviderKind::Custom, Duration::from_secs(5))
            .credential(credential.map(|c| SecretString::from(c.to_string())))
            .endpoint(Some(endpoint.to_string()))
    }

    #[test]
    fn chat_url_keeps_explicit_paths() {
        assert_eq!(chat_url("http://gpu-box:8080").unwrap(), "http://gpu-box:8080/api/chat");
        assert_eq!(
            chat_url("http://gpu-box:8080/v1/generate").unwrap(),
            "http://gpu-box:8080/v1/generate"
        );
        assert!(matches!(chat_url("not a url"), Err(AiError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn posts_to_explicit_path_with_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/inference/chat"))
            .and(header("Authorization", "Bearer team-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "from custom"}}],
                "usage": {"total_tokens": 17}
            })))
            .mount(&server)
            .await;

        let adapter = CustomEndpointAdapter::build(
            &Client::new(),
            spec(&format!("{}/inference/chat", server.uri()), Some("team-token")),
        )
        .unwrap();
        assert!(adapter.model_host().is_none());
        assert_eq!(adapter.model(), "custom");
        let completion = adapter
            .complete(&[ChatMessage::user("hi")], &CompletionOptions::default())
            .await
            .unwrap();
        assert_eq!(completion.content, "from custom");
        assert_eq!(completion.tokens_used, Some(17));
    }

    #[test]
    fn endpoint_is_required() {
        let spec = AdapterSpec::new(ProviderKind::Custom, Duration::from_secs(1));
        assert!(matches!(
            CustomEndpointAdapter::build(&Client::new(), spec).err().unwrap(),
            AiError::InvalidConfig(_)
        ));
    }
}
