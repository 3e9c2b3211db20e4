use std::path::PathBuf;

/// Core error types for switchyard.
#[derive(Debug, thiserror::Error)]
pub enum SwitchyardError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors raised by a backend call, either when the call is issued or while
/// its element stream is being consumed.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Stream interrupted: {0}")]
    Stream(String),

    #[error("Circuit open for backend {0}")]
    CircuitOpen(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("No API key configured for provider")]
    NoApiKey,

    #[error("{0}")]
    Other(String),
}

/// Lookup failures from the backend/model registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Backend not found: {0}")]
    BackendNotFound(String),

    #[error("Model not found: {backend}/{model}")]
    ModelNotFound { backend: String, model: String },
}

impl RegistryError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RegistryError::BackendNotFound(_) | RegistryError::ModelNotFound { .. }
        )
    }
}

impl From<RegistryError> for ProviderError {
    fn from(err: RegistryError) -> Self {
        ProviderError::ModelNotFound(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SwitchyardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_error_converts_to_model_not_found() {
        let err: ProviderError = RegistryError::ModelNotFound {
            backend: "openai".into(),
            model: "gpt-9".into(),
        }
        .into();
        match err {
            ProviderError::ModelNotFound(msg) => assert_eq!(msg, "Model not found: openai/gpt-9"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_error_display() {
        let err = ProviderError::Api {
            status: 529,
            message: "overloaded".into(),
        };
        assert_eq!(err.to_string(), "API error (529): overloaded");
        assert_eq!(
            ProviderError::CircuitOpen("anthropic".into()).to_string(),
            "Circuit open for backend anthropic"
        );
    }
}
