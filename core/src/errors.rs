use thiserror::Error;

/// Error catalogue for the provider subsystem. Every variant carries a stable
/// code and a short explanation so the surrounding application can show
/// something actionable without parsing messages.
#[derive(Debug, Error)]
pub enum AiError {
    #[error("Provider configuration not found")] ConfigNotFound,
    #[error("No AI provider is configured for this owner")] NoConfiguration,
    #[error("Stored credential could not be decrypted")] DecryptionFailure,
    #[error("Provider unreachable: {0}")] ProviderUnreachable(String),
    #[error("Provider rejected the credential: {0}")] ProviderAuthError(String),
    #[error("Model '{model}' is not available")] ModelNotAvailable { model: String },
    #[error("Provider request timed out")] Timeout,
    #[error("Provider error ({}): {message}", status_label(.status))]
    ProviderError { status: Option<u16>, message: String },
    #[error("Unsupported provider: {0}")] UnsupportedProvider(String),
    #[error("Invalid provider configuration: {0}")] InvalidConfig(String),
    #[error("Invalid completion request: {0}")] InvalidRequest(String),
    #[error("Owner already has {0} provider configurations")] ConfigLimitReached(usize),
    #[error("Operation cancelled")] Cancelled,
    #[error("Encryption key file error: {0}")] KeyFile(String),
    #[error("Credential could not be encrypted: {0}")] Encryption(String),
    #[error("Storage error: {0}")] Storage(String),
}

impl AiError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigNotFound => "AI-1001",
            Self::NoConfiguration => "AI-1002",
            Self::InvalidConfig(_) => "AI-1003",
            Self::ConfigLimitReached(_) => "AI-1004",
            Self::InvalidRequest(_) => "AI-1005",
            Self::DecryptionFailure => "SEC-1001",
            Self::KeyFile(_) => "SEC-1002",
            Self::Encryption(_) => "SEC-1003",
            Self::ProviderUnreachable(_) => "AI-2001",
            Self::ProviderAuthError(_) => "AI-2002",
            Self::ModelNotAvailable { .. } => "AI-2003",
            Self::Timeout => "AI-2004",
            Self::ProviderError { .. } => "AI-2005",
            Self::UnsupportedProvider(_) => "AI-2006",
            Self::Cancelled => "AI-2007",
            Self::Storage(_) => "DB-1001",
        }
    }

    pub fn explain(&self) -> &'static str {
        match self {
            Self::ConfigNotFound => "No provider configuration exists for the requested ID.",
            Self::NoConfiguration => "The owner has no active default provider configuration.",
            Self::InvalidConfig(_) => "The provider configuration failed validation.",
            Self::ConfigLimitReached(_) => "The owner reached the maximum number of saved configurations.",
            Self::InvalidRequest(_) => "The completion request cannot be expressed for this provider.",
            Self::DecryptionFailure => {
                "The credential was tampered with or encrypted under a different key file."
            }
            Self::KeyFile(_) => "The encryption key file could not be read or created.",
            Self::Encryption(_) => "The secure random source or cipher failed while sealing a credential.",
            Self::ProviderUnreachable(_) => "The provider endpoint refused or dropped the connection.",
            Self::ProviderAuthError(_) => "The provider rejected the API key.",
            Self::ModelNotAvailable { .. } => "The requested model does not exist on the provider.",
            Self::Timeout => "The provider did not answer before the deadline.",
            Self::ProviderError { .. } => "The provider returned an unexpected response.",
            Self::UnsupportedProvider(_) => "No adapter is registered for the stored provider kind.",
            Self::Cancelled => "The long-running operation was cancelled by the caller.",
            Self::Storage(_) => "The application could not access the SQLite database.",
        }
    }
}

impl From<rusqlite::Error> for AiError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<r2d2::Error> for AiError {
    fn from(err: r2d2::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<tokio::task::JoinError> for AiError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            Self::Cancelled
        } else {
            Self::Storage(format!("background task failed: {err}"))
        }
    }
}

pub type AiResult<T> = Result<T, AiError>;

fn status_label(status: &Option<u16>) -> String {
    match status {
        Some(code) => code.to_string(),
        None => "no status".to_string(),
    }
}
