use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ResilienceConfig;
use crate::equivalence::EquivalenceResolver;
use crate::error::ProviderError;
use crate::model::ModelRef;

/// Failure taxonomy driving the fallback decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Network,
    Server,
    RateLimit,
    Overload,
    CircuitOpen,
    Auth,
    ModelNotFound,
    MidStream,
    MalformedRequest,
    Cancelled,
    Unknown,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Network => "network",
            ErrorClass::Server => "server",
            ErrorClass::RateLimit => "rate_limit",
            ErrorClass::Overload => "overload",
            ErrorClass::CircuitOpen => "circuit_open",
            ErrorClass::Auth => "auth",
            ErrorClass::ModelNotFound => "model_not_found",
            ErrorClass::MidStream => "mid_stream",
            ErrorClass::MalformedRequest => "malformed_request",
            ErrorClass::Cancelled => "cancelled",
            ErrorClass::Unknown => "unknown",
        }
    }

    /// Whether this failure ends the request outright.
    pub fn is_fatal(self, config: &ResilienceConfig) -> bool {
        match self {
            ErrorClass::MalformedRequest | ErrorClass::Cancelled => true,
            ErrorClass::Auth => !config.fallback_on_auth,
            _ => false,
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify an HTTP status and its body.
pub fn classify_status(status: u16, message: &str) -> ErrorClass {
    match status {
        400 | 413 | 422 => ErrorClass::MalformedRequest,
        401 | 403 => ErrorClass::Auth,
        404 => ErrorClass::ModelNotFound,
        408 => ErrorClass::Network,
        429 => ErrorClass::RateLimit,
        503 | 529 => ErrorClass::Overload,
        500..=599 if message.to_lowercase().contains("overloaded") => ErrorClass::Overload,
        500..=599 => ErrorClass::Server,
        _ => ErrorClass::Unknown,
    }
}

/// Classify an error raised when a call is issued.
pub fn classify(err: &ProviderError) -> ErrorClass {
    match err {
        ProviderError::Http(e) => {
            if e.is_timeout() || e.is_connect() {
                ErrorClass::Network
            } else if let Some(status) = e.status() {
                classify_status(status.as_u16(), &e.to_string())
            } else {
                ErrorClass::Network
            }
        }
        ProviderError::Api { status, message } => classify_status(*status, message),
        ProviderError::Parse(_) => ErrorClass::Server,
        ProviderError::Network(_) => ErrorClass::Network,
        ProviderError::Stream(_) => ErrorClass::MidStream,
        ProviderError::CircuitOpen(_) => ErrorClass::CircuitOpen,
        ProviderError::ModelNotFound(_) => ErrorClass::ModelNotFound,
        ProviderError::InvalidRequest(_) => ErrorClass::MalformedRequest,
        ProviderError::Cancelled => ErrorClass::Cancelled,
        ProviderError::NoApiKey => ErrorClass::Auth,
        ProviderError::Other(_) => ErrorClass::Unknown,
    }
}

/// Classify an error raised while consuming an established stream. Anything
/// not fatal on its own counts as a mid-stream break.
pub fn classify_mid_stream(err: &ProviderError) -> ErrorClass {
    match classify(err) {
        c @ (ErrorClass::Cancelled | ErrorClass::MalformedRequest | ErrorClass::Auth) => c,
        _ => ErrorClass::MidStream,
    }
}

/// Decides whether and where a failed request goes next.
pub struct FallbackPolicy {
    resolver: Arc<EquivalenceResolver>,
}

impl FallbackPolicy {
    pub fn new(resolver: Arc<EquivalenceResolver>) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &Arc<EquivalenceResolver> {
        &self.resolver
    }

    pub async fn resolve(
        &self,
        model: &ModelRef,
        err: &ProviderError,
        trail: &[String],
        config: &ResilienceConfig,
    ) -> Option<ModelRef> {
        self.resolve_class(model, classify(err), trail, config).await
    }

    /// Next model to try after a failure of class `class`, or `None` when
    /// the request should stop.
    pub async fn resolve_class(
        &self,
        model: &ModelRef,
        class: ErrorClass,
        trail: &[String],
        config: &ResilienceConfig,
    ) -> Option<ModelRef> {
        if class.is_fatal(config) {
            debug!("Not falling back from {}: {} is fatal", model, class);
            return None;
        }
        if trail.len() >= config.max_attempts as usize {
            debug!("Not falling back from {}: {} attempts used", model, trail.len());
            return None;
        }

        let mut exclude: Vec<String> = Vec::new();
        for entry in trail {
            if let Some(r) = ModelRef::parse(entry) {
                if !exclude.contains(&r.backend_id) {
                    exclude.push(r.backend_id);
                }
            }
        }
        if !exclude.contains(&model.backend_id) {
            exclude.push(model.backend_id.clone());
        }

        let next = self
            .resolver
            .find_fallback(model, &exclude, &config.preferred_backends)
            .await;
        match &next {
            Some(r) => info!("Falling back from {} to {} after {}", model, r, class),
            None => debug!("No equivalent for {} outside {:?}", model, exclude),
        }
        next
    }
}
