//! Pre-flight checks for a candidate configuration.
//!
//! Hosted backends get a single tiny completion. The local runtime is probed
//! in two phases so "daemon not running" and "model not pulled" produce
//! different advice.

use std::future::Future;
use std::time::Duration;

use reqwest::Client;
use secrecy::SecretString;
use serde::Serialize;

use crate::config::TimeoutConfig;
use crate::errors::{AiError, AiResult};
use crate::providers::{
    provider_info, AdapterRegistry, AdapterSpec, ChatMessage, CompletionOptions, OllamaAdapter,
    ProviderAdapter, ProviderKind,
};
use crate::registry::validate_provider_fields;

const PROBE_PROMPT: &str = "Hello";
const PROBE_MAX_TOKENS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionReport {
    pub ok: bool,
    pub message: String,
}

impl ConnectionReport {
    fn passed(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

#[derive(Clone)]
pub struct ConnectionTester {
    client: Client,
    adapters: AdapterRegistry,
    timeouts: TimeoutConfig,
}

impl ConnectionTester {
    pub fn new(client: Client, adapters: AdapterRegistry, timeouts: TimeoutConfig) -> Self {
        Self {
            client,
            adapters,
            timeouts,
        }
    }

    /// Never fails; every problem ends up in the report message.
    pub async fn test(
        &self,
        kind: ProviderKind,
        credential: &str,
        model: Option<&str>,
        endpoint: Option<&str>,
    ) -> ConnectionReport {
        let endpoint = match validate_provider_fields(kind, credential, endpoint) {
            Ok(endpoint) => endpoint,
            Err(err) => return ConnectionReport::failed(err.to_string()),
        };
        let model = model.map(str::trim).filter(|m| !m.is_empty());
        let report = if kind.is_local() {
            self.test_local(model, endpoint).await
        } else {
            self.test_hosted(kind, credential, model, endpoint).await
        };
        log::info!(
            target: "ai.tester",
            "connection test for {kind}: ok={} ({})",
            report.ok,
            report.message
        );
        report
    }

    async fn test_hosted(
        &self,
        kind: ProviderKind,
        credential: &str,
        model: Option<&str>,
        endpoint: Option<String>,
    ) -> ConnectionReport {
        let deadline = self.timeouts.test_hosted();
        let model = model.or(test_model(kind)).map(str::to_string);
        let credential = Some(credential.trim())
            .filter(|c| !c.is_empty())
            .map(|c| SecretString::from(c.to_string()));
        let spec = AdapterSpec::new(kind, deadline)
            .credential(credential)
            .model(model)
            .endpoint(endpoint);
        let adapter = match self.adapters.build(&self.client, spec) {
            Ok(adapter) => adapter,
            Err(err) => return ConnectionReport::failed(err.to_string()),
        };

        let messages = [ChatMessage::user(PROBE_PROMPT)];
        let options = CompletionOptions::with_max_tokens(PROBE_MAX_TOKENS);
        let probe = adapter.complete(&messages, &options);
        let name = display_name(kind);
        match within(deadline, probe).await {
            Ok(_) => ConnectionReport::passed(format!(
                "Connected to {name} using model '{}'",
                adapter.model()
            )),
            Err(err) => ConnectionReport::failed(hosted_failure(name, deadline, &err)),
        }
    }

    async fn test_local(&self, model: Option<&str>, endpoint: Option<String>) -> ConnectionReport {
        let liveness = self.timeouts.liveness();
        let probe_deadline = self.timeouts.generation_probe();
        let spec = AdapterSpec::new(ProviderKind::Ollama, probe_deadline)
            .model(model.map(str::to_string))
            .endpoint(endpoint);
        let adapter = match OllamaAdapter::from_spec(&self.client, spec) {
            Ok(adapter) => adapter,
            Err(err) => return ConnectionReport::failed(err.to_string()),
        };
        let base = adapter.base_url().to_string();
        let model = adapter.model().to_string();

        match within(liveness, adapter.tags(liveness)).await {
            Ok(tags) => {
                let listed = tags
                    .iter()
                    .any(|tag| tag == &model || tag.split(':').next() == Some(model.as_str()));
                log::debug!(
                    target: "ai.tester",
                    "Ollama at {base} lists {} models; '{model}' present: {listed}",
                    tags.len()
                );
            }
            Err(err) => {
                log::debug!(target: "ai.tester", "liveness probe failed: {err}");
                return ConnectionReport::failed(format!(
                    "Ollama server not running at {base}. Start it with `ollama serve` and try again."
                ));
            }
        }

        let messages = [ChatMessage::user(PROBE_PROMPT)];
        let options = CompletionOptions::with_max_tokens(PROBE_MAX_TOKENS);
        let probe = adapter.complete_within(&messages, &options, probe_deadline);
        match within(probe_deadline, probe).await {
            Ok(_) => ConnectionReport::passed(format!(
                "Ollama is running at {base} and model '{model}' responded"
            )),
            Err(AiError::ModelNotAvailable { .. }) => ConnectionReport::failed(format!(
                "Model '{model}' is not pulled on {base}. Pull it first: `ollama pull {model}`"
            )),
            Err(AiError::Timeout) => ConnectionReport::failed(format!(
                "Ollama at {base} did not answer within {}s; the model may still be loading",
                probe_deadline.as_secs()
            )),
            Err(err) => ConnectionReport::failed(format!("Ollama connection failed: {err}")),
        }
    }
}

/// Models that answer a five-token probe cheaply.
fn test_model(kind: ProviderKind) -> Option<&'static str> {
    match kind {
        ProviderKind::OpenAi => Some("gpt-3.5-turbo"),
        ProviderKind::Anthropic => Some("claude-3-haiku-20240307"),
        _ => None,
    }
}

fn display_name(kind: ProviderKind) -> &'static str {
    provider_info(kind).display_name
}

fn hosted_failure(name: &str, deadline: Duration, err: &AiError) -> String {
    match err {
        AiError::ProviderAuthError(detail) => {
            format!("Authentication with {name} failed: check the API key ({detail})")
        }
        AiError::Timeout => format!("{name} did not answer within {}s", deadline.as_secs()),
        AiError::ProviderUnreachable(target) => format!("Could not reach {name} at {target}"),
        AiError::ModelNotAvailable { model } => {
            format!("Model '{model}' is not available on {name}")
        }
        other => format!("Connection to {name} failed: {other}"),
    }
}

/// Outer deadline guard on top of the per-request reqwest timeout.
async fn within<T>(deadline: Duration, fut: impl Future<Output = AiResult<T>>) -> AiResult<T> {
    tokio::time::timeout(deadline, fut)
        .await
        .unwrap_or(Err(AiError::Timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Instant;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn tester() -> ConnectionTester {
        let timeouts = TimeoutConfig {
            test_hosted_secs: 1,
            liveness_secs: 1,
            generation_probe_secs: 2,
            ..TimeoutConfig::default()
        };
        ConnectionTester::new(Client::new(), AdapterRegistry::standard(), timeouts)
    }

    fn closed_port_url() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("http://127.0.0.1:{port}")
    }

    #[tokio::test]
    async fn hosted_probe_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "Hi"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let report = tester()
            .test(ProviderKind::OpenAi, "sk-test", None, Some(&server.uri()))
            .await;
        assert!(report.ok, "{}", report.message);
        assert!(report.message.contains("gpt-3.5-turbo"));
    }

    #[tokio::test]
    async fn hosted_auth_failure_mentions_api_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": {"message": "invalid x-api-key"}
            })))
            .mount(&server)
            .await;

        let report = tester()
            .test(ProviderKind::Anthropic, "sk-bad", None, Some(&server.uri()))
            .await;
        assert!(!report.ok);
        assert!(report.message.contains("check the API key"));
    }

    #[tokio::test]
    async fn hosted_probe_is_bounded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let started = Instant::now();
        let report = tester()
            .test(ProviderKind::OpenAi, "sk-test", Some("gpt-4o"), Some(&server.uri()))
            .await;
        assert!(!report.ok);
        assert!(report.message.contains("did not answer"));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn validation_failure_skips_network() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let report = tester()
            .test(ProviderKind::OpenAi, "   ", None, Some(&server.uri()))
            .await;
        assert!(!report.ok);
        assert!(report.message.contains("API key"));

        let report = tester()
            .test(ProviderKind::Custom, "", None, Some("not a url"))
            .await;
        assert!(!report.ok);
    }

    #[tokio::test]
    async fn hosted_generic_without_model_fails_before_network() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let report = tester()
            .test(ProviderKind::HostedGeneric, "sk-test", None, Some(&server.uri()))
            .await;
        assert!(!report.ok);
        assert!(report.message.contains("model"), "{}", report.message);
    }

    #[tokio::test]
    async fn custom_endpoint_probe_succeeds_without_credential() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "message": {"role": "assistant", "content": "ok"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let report = tester()
            .test(ProviderKind::Custom, "", Some("llama-local"), Some(&server.uri()))
            .await;
        assert!(report.ok, "{}", report.message);
        assert!(report.message.contains("llama-local"));
    }

    #[tokio::test]
    async fn local_daemon_not_running() {
        let endpoint = closed_port_url();
        let started = Instant::now();
        let report = tester()
            .test(ProviderKind::Ollama, "", None, Some(&endpoint))
            .await;
        assert!(!report.ok);
        assert!(report.message.contains("not running"), "{}", report.message);
        assert!(report.message.contains(&endpoint));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn failed_liveness_skips_generation_probe() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let report = tester()
            .test(ProviderKind::Ollama, "", None, Some(&server.uri()))
            .await;
        assert!(report.message.contains("not running"));
    }

    #[tokio::test]
    async fn local_model_missing_names_the_model() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "models": [{"name": "mistral:latest"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": "model \"llama3.2\" not found, try pulling it first"
            })))
            .mount(&server)
            .await;

        let report = tester()
            .test(ProviderKind::Ollama, "", None, Some(&server.uri()))
            .await;
        assert!(!report.ok);
        assert!(report.message.contains("llama3.2"));
        assert!(report.message.contains("ollama pull llama3.2"));
        assert!(!report.message.contains("not running"));
    }

    #[tokio::test]
    async fn local_success_names_the_model() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "models": [{"name": "phi3:latest"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "message": {"role": "assistant", "content": "Hi"},
                "done": true
            })))
            .mount(&server)
            .await;

        let report = tester()
            .test(ProviderKind::Ollama, "", Some("phi3"), Some(&server.uri()))
            .await;
        assert!(report.ok, "{}", report.message);
        assert!(report.message.contains("phi3"));
    }
}
