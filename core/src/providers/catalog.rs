use serde::Serialize;

use super::ProviderKind;

/// Static metadata shown to users when they pick a provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderInfo {
    pub kind: ProviderKind,
    pub display_name: &'static str,
    pub description: &'static str,
    pub suggested_models: &'static [&'static str],
    pub default_model: Option<&'static str>,
    pub default_endpoint: Option<&'static str>,
    pub requires_credential: bool,
    pub requires_endpoint: bool,
}

pub static SUPPORTED_PROVIDERS: &[ProviderInfo] = &[
    ProviderInfo {
        kind: ProviderKind::OpenAi,
        display_name: "OpenAI",
        description: "GPT-4o and other OpenAI chat models",
        suggested_models: &["gpt-4o", "gpt-4o-mini", "gpt-4-turbo", "gpt-3.5-turbo"],
        default_model: Some("gpt-4o-mini"),
        default_endpoint: Some("https://api.openai.com"),
        requires_credential: true,
        requires_endpoint: false,
    },
    ProviderInfo {
        kind: ProviderKind::Anthropic,
        display_name: "Anthropic",
        description: "Claude models for careful reasoning",
        suggested_models: &[
            "claude-3-5-sonnet-20241022",
            "claude-3-opus-20240229",
            "claude-3-haiku-20240307",
        ],
        default_model: Some("claude-3-haiku-20240307"),
        default_endpoint: Some("https://api.anthropic.com"),
        requires_credential: true,
        requires_endpoint: false,
    },
    ProviderInfo {
        kind: ProviderKind::HostedGeneric,
        display_name: "Hosted (OpenAI compatible)",
        description: "Any hosted API exposing an OpenAI-style chat completions endpoint",
        suggested_models: &[],
        default_model: None,
        default_endpoint: None,
        requires_credential: true,
        requires_endpoint: true,
    },
    ProviderInfo {
        kind: ProviderKind::Ollama,
        display_name: "Ollama (Local LLM)",
        description: "Models running on your own hardware; no API costs, data stays local",
        suggested_models: &[
            "llama3.2", "llama3.1", "mistral", "phi3", "gemma", "qwen", "tinyllama",
        ],
        default_model: Some("llama3.2"),
        default_endpoint: Some(super::DEFAULT_OLLAMA_URL),
        requires_credential: false,
        requires_endpoint: false,
    },
    ProviderInfo {
        kind: ProviderKind::Custom,
        display_name: "Custom API",
        description: "Self-hosted endpoint accepting the local chat request shape",
        suggested_models: &["custom"],
        default_model: Some("custom"),
        default_endpoint: None,
        requires_credential: false,
        requires_endpoint: true,
    },
];

pub fn provider_info(kind: ProviderKind) -> &'static ProviderInfo {
    SUPPORTED_PROVIDERS
        .iter()
        .find(|info| info.kind == kind)
        .unwrap_or(&SUPPORTED_PROVIDERS[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_matches_kind_requirements() {
        for kind in ProviderKind::ALL {
            let info = provider_info(kind);
            assert_eq!(info.kind, kind);
            assert_eq!(info.requires_credential, kind.requires_credential());
            assert_eq!(info.requires_endpoint, kind.requires_endpoint());
        }
    }
}
