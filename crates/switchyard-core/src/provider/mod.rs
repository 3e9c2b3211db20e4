pub mod openai_compat;
pub mod registry;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::model::ModelDescriptor;
use crate::normalize::NormalizedRequest;
use crate::types::StreamEvent;

pub use registry::{BackendInfo, ModelRegistry, StaticRegistry};

/// Element stream returned by a backend call. An `Err` item means the
/// stream broke after it was established.
pub type CompletionStream = BoxStream<'static, Result<StreamEvent, ProviderError>>;

/// Everything a backend needs for one call.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub model: ModelDescriptor,
    pub request: NormalizedRequest,
    pub session_id: String,
}

/// A remote completion endpoint.
///
/// `stream` fails with an error when the call cannot be established;
/// failures after that surface as `Err` items on the returned stream.
#[async_trait]
pub trait LanguageBackend: Send + Sync {
    /// Backend id as used in `backend/model` references.
    fn id(&self) -> &str;

    async fn stream(
        &self,
        request: BackendRequest,
        cancel: CancellationToken,
    ) -> Result<CompletionStream, ProviderError>;
}

/// Backends addressable by id.
#[derive(Clone, Default)]
pub struct BackendPool {
    backends: Arc<DashMap<String, Arc<dyn LanguageBackend>>>,
}

impl BackendPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, backend: Arc<dyn LanguageBackend>) {
        let id = backend.id().to_string();
        if self.backends.insert(id.clone(), backend).is_some() {
            tracing::debug!("Replaced backend {}", id);
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn LanguageBackend>> {
        self.backends.get(id).map(|b| Arc::clone(b.value()))
    }

    pub fn remove(&self, id: &str) -> bool {
        self.backends.remove(id).is_some()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.backends.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    struct Echo(&'static str);

    #[async_trait]
    impl LanguageBackend for Echo {
        fn id(&self) -> &str {
            self.0
        }

        async fn stream(
            &self,
            _request: BackendRequest,
            _cancel: CancellationToken,
        ) -> Result<CompletionStream, ProviderError> {
            Ok(futures::stream::iter(vec![Ok(StreamEvent::TextDelta { text: self.0.into() })]).boxed())
        }
    }

    #[test]
    fn test_pool_register_and_get() {
        let pool = BackendPool::new();
        pool.register(Arc::new(Echo("anthropic")));
        pool.register(Arc::new(Echo("openai")));

        assert_eq!(pool.len(), 2);
        assert_eq!(pool.ids(), vec!["anthropic", "openai"]);
        assert_eq!(pool.get("openai").unwrap().id(), "openai");
        assert!(pool.get("google").is_none());

        assert!(pool.remove("openai"));
        assert!(!pool.remove("openai"));
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_pool_dispatch() {
        let pool = BackendPool::new();
        pool.register(Arc::new(Echo("xai")));
        let backend = pool.get("xai").unwrap();
        let req = BackendRequest {
            model: ModelDescriptor::new("xai", "grok-4", crate::model::BackendFamily::Xai),
            request: NormalizedRequest::default(),
            session_id: "s".into(),
        };
        let items: Vec<_> = backend
            .stream(req, CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(items.len(), 1);
    }
}
