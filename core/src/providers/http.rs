//! Transport plumbing shared by every adapter: one place that turns reqwest
//! failures and HTTP statuses into the [`AiError`] taxonomy.

use reqwest::{RequestBuilder, StatusCode};
use serde_json::Value;

use crate::errors::AiError;

const MAX_DETAIL_CHARS: usize = 300;

pub(crate) fn transport_error(err: reqwest::Error, endpoint: &str) -> AiError {
    if err.is_timeout() {
        AiError::Timeout
    } else if err.is_connect() {
        AiError::ProviderUnreachable(format!("cannot connect to {endpoint}"))
    } else if err.is_decode() {
        AiError::ProviderError {
            status: err.status().map(|s| s.as_u16()),
            message: format!("undecodable response from {endpoint}"),
        }
    } else {
        AiError::ProviderError {
            status: err.status().map(|s| s.as_u16()),
            message: err.without_url().to_string(),
        }
    }
}

pub(crate) fn status_error(status: StatusCode, body: &str, model: &str) -> AiError {
    let detail = error_detail(body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AiError::ProviderAuthError(detail),
        StatusCode::NOT_FOUND => AiError::ModelNotAvailable {
            model: model.to_string(),
        },
        other => AiError::ProviderError {
            status: Some(other.as_u16()),
            message: detail,
        },
    }
}

/// Send the request and decode a JSON body, mapping every failure.
pub(crate) async fn send_json(
    request: RequestBuilder,
    endpoint: &str,
    model: &str,
) -> Result<Value, AiError> {
    let response = request
        .send()
        .await
        .map_err(|err| transport_error(err, endpoint))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|err| transport_error(err, endpoint))?;
    if !status.is_success() {
        log::debug!(target: "ai.providers", "{endpoint} answered {status}");
        return Err(status_error(status, &body, model));
    }
    serde_json::from_str(&body).map_err(|err| AiError::ProviderError {
        status: Some(status.as_u16()),
        message: format!("invalid JSON from {endpoint}: {err}"),
    })
}

/// Pull the human readable part out of a provider error body. Handles
/// `{"error": {"message": ..}}`, `{"error": ".."}` and plain text.
pub(crate) fn error_detail(body: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let message = parsed.as_ref().and_then(|value| {
        let error = value.get("error")?;
        error
            .get("message")
            .and_then(Value::as_str)
            .or_else(|| error.as_str())
            .map(str::to_string)
    });
    let text = message.unwrap_or_else(|| body.trim().to_string());
    if text.is_empty() {
        return "empty response body".to_string();
    }
    text.chars().take(MAX_DETAIL_CHARS).collect()
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
