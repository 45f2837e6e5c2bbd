//! Adapter for a locally hosted Ollama daemon.
//!
//! Local inference is slow and the daemon may be up without the requested
//! model, so this adapter carries a longer deadline than the hosted ones and
//! exposes model listing and pulling through [`LocalModelHost`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use super::http::{error_detail, join_url, send_json, transport_error};
use super::{
    normalise_messages, AdapterSpec, ChatMessage, Completion, CompletionOptions, LocalModelHost,
    ProviderAdapter, ProviderKind,
};
use crate::errors::{AiError, AiResult};

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

#[derive(Clone)]
pub struct OllamaAdapter {
    client: Client,
    base_url: String,
    model: String,
    timeout: Duration,
    list_timeout: Duration,
    pull_timeout: Duration,
}

impl OllamaAdapter {
    pub fn build(client: &Client, spec: AdapterSpec) -> AiResult<Arc<dyn ProviderAdapter>> {
        Ok(Arc::new(Self::from_spec(client, spec)?))
    }

    pub fn from_spec(client: &Client, spec: AdapterSpec) -> AiResult<Self> {
        Ok(Self {
            client: client.clone(),
            base_url: spec
                .endpoint
                .clone()
                .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string()),
            model: spec.model_or_default()?,
            timeout: spec.timeout,
            list_timeout: spec.list_timeout,
            pull_timeout: spec.pull_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET /api/tags` with an explicit deadline; doubles as a liveness probe.
    pub async fn tags(&self, timeout: Duration) -> AiResult<Vec<String>> {
        let request = self
            .client
            .get(join_url(&self.base_url, "api/tags"))
            .timeout(timeout);
        let body = send_json(request, &self.base_url, &self.model).await?;
        Ok(body
            .get("models")
            .and_then(Value::as_array)
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Same as [`ProviderAdapter::complete`] but with a caller-chosen deadline.
    pub async fn complete_within(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
        timeout: Duration,
    ) -> AiResult<Completion> {
        if messages.is_empty() {
            return Err(AiError::InvalidRequest("no messages to complete".into()));
        }
        let request = self
            .client
            .post(join_url(&self.base_url, "api/chat"))
            .timeout(timeout)
            .json(&chat_payload(&self.model, messages, options));
        let body = send_json(request, &self.base_url, &self.model).await?;
        parse_chat_body(&body, &self.model)
    }
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> AiResult<Completion> {
        self.complete_within(messages, options, self.timeout).await
    }

    fn model_host(&self) -> Option<&dyn LocalModelHost> {
        Some(self)
    }
}

#[async_trait]
impl LocalModelHost for OllamaAdapter {
    async fn list_models(&self) -> AiResult<Vec<String>> {
        self.tags(self.list_timeout).await
    }

    fn pull_model(&self, name: &str) -> PullHandle {
        let model = name.to_string();
        log::info!(target: "ai.ollama", "pulling model {model} from {}", self.base_url);
        let task = tokio::spawn(run_pull(
            self.client.clone(),
            self.base_url.clone(),
            model.clone(),
            self.pull_timeout,
        ));
        PullHandle { model, task }
    }
}

async fn run_pull(
    client: Client,
    base_url: String,
    model: String,
    timeout: Duration,
) -> AiResult<PullOutcome> {
    let request = client
        .post(join_url(&base_url, "api/pull"))
        .timeout(timeout)
        .json(&json!({ "name": model, "stream": false }));
    let response = request
        .send()
        .await
        .map_err(|err| transport_error(err, &base_url))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|err| transport_error(err, &base_url))?;
    let parsed: Option<Value> = serde_json::from_str(&body).ok();
    let reported_error = parsed
        .as_ref()
        .and_then(|v| v.get("error"))
        .and_then(Value::as_str)
        .map(str::to_string);

    if !status.is_success() || reported_error.is_some() {
        let detail = reported_error.unwrap_or_else(|| error_detail(&body));
        log::warn!(target: "ai.ollama", "pull of {model} failed: {detail}");
        return Err(failure_from_detail(&model, status.as_u16(), detail));
    }
    let final_status = parsed
        .as_ref()
        .and_then(|v| v.get("status"))
        .and_then(Value::as_str)
        .unwrap_or("success")
        .to_string();
    log::info!(target: "ai.ollama", "pull of {model} finished: {final_status}");
    Ok(PullOutcome {
        model,
        status: final_status,
    })
}

fn failure_from_detail(model: &str, status: u16, detail: String) -> AiError {
    let lowered = detail.to_lowercase();
    if status == 404 || lowered.contains("does not exist") || lowered.contains("not found") {
        AiError::ModelNotAvailable {
            model: model.to_string(),
        }
    } else {
        AiError::ProviderError {
            status: Some(status),
            message: detail,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PullOutcome {
    pub model: String,
    pub status: String,
}

/// Handle to a background model download.
///
/// Dropping the handle detaches the download; [`PullHandle::cancel`] aborts
/// it. Completions against models that are already present are unaffected
/// either way.
#[derive(Debug)]
pub struct PullHandle {
    model: String,
    task: JoinHandle<AiResult<PullOutcome>>,
}

impl PullHandle {
    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn cancel(&self) {
        log::info!(target: "ai.ollama", "cancelling pull of {}", self.model);
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Resolves to the outcome; a cancelled pull yields [`AiError::Cancelled`]
    /// and an elapsed deadline [`AiError::Timeout`].
    pub async fn wait(self) -> AiResult<PullOutcome> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(err.into()),
        }
    }
}

/// Ollama-native chat body, shared with the custom endpoint adapter.
pub(crate) fn chat_payload(
    model: &str,
    messages: &[ChatMessage],
    options: &CompletionOptions,
) -> Value {
    json!({
        "model": model,
        "messages": normalise_messages(messages),
        "stream": false,
        "options": {
            "temperature": options.temperature.unwrap_or(CompletionOptions::DEFAULT_TEMPERATURE),
            "top_p": options.top_p.unwrap_or(CompletionOptions::DEFAULT_TOP_P),
            "num_predict": options.max_tokens.unwrap_or(CompletionOptions::DEFAULT_MAX_TOKENS),
        }
    })
}

/// Accepts the native chat shape, the generate shape and the OpenAI shape,
/// since custom servers answer with any of them.
pub(crate) fn parse_chat_body(body: &Value, model: &str) -> AiResult<Completion> {
    if let Some(error) = body.get("error").and_then(Value::as_str) {
        return Err(failure_from_detail(model, 200, error.to_string()));
    }
    let content = body
        .get("message")
        .and_then(|m| m.get("content"))
        .or_else(|| body.get("response"))
        .or_else(|| {
            body.get("choices")
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("message"))
                .and_then(|m| m.get("content"))
        })
        .and_then(Value::as_str)
        .ok_or_else(|| AiError::ProviderError {
            status: None,
            message: "response carried no message content".into(),
        })?
        .to_string();

    let prompt = body.get("prompt_eval_count").and_then(Value::as_u64);
    let eval = body.get("eval_count").and_then(Value::as_u64);
    let tokens_used = match (prompt, eval) {
        (None, None) => body
            .get("usage")
            .and_then(|u| u.get("total_tokens"))
            .and_then(Value::as_u64),
        (p, e) => Some(p.unwrap_or(0) + e.unwrap_or(0)),
    };
    Ok(Completion {
        content,
        tokens_used,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(endpoint: &str) -> OllamaAdapter {
        let mut spec = AdapterSpec::new(ProviderKind::Ollama, Duration::from_secs(5))
            .model(Some("llama3.2".into()))
            .endpoint(Some(endpoint.to_string()));
        spec.pull_timeout = Duration::from_secs(2);
        OllamaAdapter::from_spec(&Client::new(), spec).unwrap()
    }

    #[tokio::test]
    async fn chat_sends_native_shape_and_counts_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(json!({
                "model": "llama3.2",
                "stream": false,
                "messages": [
                    {"role": "system", "content": "Be calm."},
                    {"role": "user", "content": "Hello"}
                ],
                "options": {"num_predict": 64}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "llama3.2",
                "message": {"role": "assistant", "content": "Hi"},
                "done": true,
                "prompt_eval_count": 9,
                "eval_count": 3
            })))
            .mount(&server)
            .await;

        let completion = adapter(&server.uri())
            .complete(
                &[ChatMessage::system("Be calm."), ChatMessage::user("Hello")],
                &CompletionOptions::with_max_tokens(64),
            )
            .await
            .unwrap();
        assert_eq!(completion.content, "Hi");
        assert_eq!(completion.tokens_used, Some(12));
    }

    #[tokio::test]
    async fn missing_model_maps_to_model_not_available() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": "model \"llama3.2\" not found, try pulling it first"
            })))
            .mount(&server)
            .await;

        let err = adapter(&server.uri())
            .complete(&[ChatMessage::user("Hello")], &CompletionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AiError::ModelNotAvailable { ref model } if model == "llama3.2"));
    }

    #[tokio::test]
    async fn nothing_listening_is_unreachable() {
        // Bind then drop to get a port with no listener.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let err = adapter(&format!("http://127.0.0.1:{port}"))
            .complete(&[ChatMessage::user("Hello")], &CompletionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AiError::ProviderUnreachable(_)), "{err:?}");
    }

    #[tokio::test]
    async fn slow_server_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"message": {"content": "late"}}))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;
        let err = adapter(&server.uri())
            .complete_within(
                &[ChatMessage::user("Hello")],
                &CompletionOptions::default(),
                Duration::from_millis(200),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AiError::Timeout));
    }

    #[tokio::test]
    async fn lists_model_names() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "models": [{"name": "llama3.2:latest"}, {"name": "mistral:7b"}]
            })))
            .mount(&server)
            .await;
        let adapter = adapter(&server.uri());
        let models = adapter.model_host().unwrap().list_models().await.unwrap();
        assert_eq!(models, vec!["llama3.2:latest", "mistral:7b"]);
    }

    #[tokio::test]
    async fn pull_reports_success_and_unknown_models() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/pull"))
            .and(body_partial_json(json!({"name": "phi3"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "success"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/pull"))
            .and(body_partial_json(json!({"name": "nope"})))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "error": "pull model manifest: file does not exist"
            })))
            .mount(&server)
            .await;

        let adapter = adapter(&server.uri());
        let host = adapter.model_host().unwrap();
        let handle = host.pull_model("phi3");
        while !handle.is_finished() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome.status, "success");
        let err = host.pull_model("nope").wait().await.unwrap_err();
        assert!(matches!(err, AiError::ModelNotAvailable { ref model } if model == "nope"));
    }

    #[tokio::test]
    async fn pull_timeout_and_cancellation_are_distinct() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/pull"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"status": "success"}))
                    .set_delay(Duration::from_secs(10)),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"message": {"content": "still here"}})),
            )
            .mount(&server)
            .await;

        let adapter = adapter(&server.uri());
        let host = adapter.model_host().unwrap();

        let timed_out = host.pull_model("big-model").wait().await.unwrap_err();
        assert!(matches!(timed_out, AiError::Timeout));

        let handle = host.pull_model("big-model");
        assert!(!handle.is_finished());
        let completion = adapter
            .complete(&[ChatMessage::user("hi")], &CompletionOptions::default())
            .await
            .unwrap();
        assert_eq!(completion.content, "still here");
        assert!(!handle.is_finished());
        handle.cancel();
        assert!(matches!(handle.wait().await, Err(AiError::Cancelled)));
    }
}
