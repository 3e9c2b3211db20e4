use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, RegistryError};
use crate::model::ModelDescriptor;

/// A backend and the model ids it currently hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendInfo {
    pub id: String,
    pub models: Vec<String>,
}

/// Source of truth for which backends exist and what they serve.
#[async_trait]
pub trait ModelRegistry: Send + Sync {
    /// Backends in a stable order, each with its hosted model ids.
    async fn list(&self) -> Vec<BackendInfo>;

    async fn get_model(&self, backend: &str, model: &str) -> Result<ModelDescriptor, RegistryError>;
}

/// In-memory registry. Ordering follows insertion order.
#[derive(Default)]
pub struct StaticRegistry {
    models: RwLock<Vec<ModelDescriptor>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_models(models: impl IntoIterator<Item = ModelDescriptor>) -> Self {
        let registry = Self::new();
        for m in models {
            registry.insert(m);
        }
        registry
    }

    /// Add a model, replacing any entry with the same backend and id.
    pub fn insert(&self, model: ModelDescriptor) {
        let mut models = self.models.write().unwrap_or_else(|e| e.into_inner());
        match models
            .iter_mut()
            .find(|m| m.backend_id == model.backend_id && m.id == model.id)
        {
            Some(existing) => *existing = model,
            None => models.push(model),
        }
    }

    pub fn remove(&self, backend: &str, model: &str) -> bool {
        let mut models = self.models.write().unwrap_or_else(|e| e.into_inner());
        let before = models.len();
        models.retain(|m| !(m.backend_id == backend && m.id == model));
        models.len() != before
    }

    /// Load descriptors from a JSON array file.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()).into());
        }
        let content = std::fs::read_to_string(path)?;
        let models: Vec<ModelDescriptor> = serde_json::from_str(&content)?;
        Ok(Self::with_models(models))
    }
}

#[async_trait]
impl ModelRegistry for StaticRegistry {
    async fn list(&self) -> Vec<BackendInfo> {
        let models = self.models.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<BackendInfo> = Vec::new();
        for m in models.iter() {
            match out.iter_mut().find(|b| b.id == m.backend_id) {
                Some(info) => info.models.push(m.id.clone()),
                None => out.push(BackendInfo {
                    id: m.backend_id.clone(),
                    models: vec![m.id.clone()],
                }),
            }
        }
        out
    }

    async fn get_model(&self, backend: &str, model: &str) -> Result<ModelDescriptor, RegistryError> {
        let models = self.models.read().unwrap_or_else(|e| e.into_inner());
        if !models.iter().any(|m| m.backend_id == backend) {
            return Err(RegistryError::BackendNotFound(backend.to_string()));
        }
        models
            .iter()
            .find(|m| m.backend_id == backend && m.id == model)
            .cloned()
            .ok_or_else(|| RegistryError::ModelNotFound {
                backend: backend.to_string(),
                model: model.to_string(),
            })
    }
}
