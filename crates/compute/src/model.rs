//! Model configuration store seam.
//!
//! The store that maps embedding models to their chunk-size hints lives
//! outside this system; actors only need the lookup contract. Lookup misses
//! and failures are non-fatal: the actor falls back to fixed defaults.

use std::collections::HashMap;

use async_trait::async_trait;

/// Chunk-size hints for an embedding model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelConfig {
  pub expected_chunk_size: u32,
  pub maximum_chunk_size: u32,
  pub display_name: String,
}

#[derive(Debug, thiserror::Error)]
#[error("model store error: {0}")]
pub struct ModelStoreError(pub String);

/// Lookup of per-tenant embedding-model configuration.
#[async_trait]
pub trait ModelStore: Send + Sync {
  async fn get_model(&self, model_id: &str, tenant_id: &str) -> Result<Option<ModelConfig>, ModelStoreError>;
}

/// In-memory model store for tests and single-tenant deployments.
#[derive(Debug, Default)]
pub struct StaticModelStore {
  models: HashMap<(String, String), ModelConfig>,
}

impl StaticModelStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&mut self, model_id: &str, tenant_id: &str, config: ModelConfig) {
    self.models.insert((model_id.to_string(), tenant_id.to_string()), config);
  }
}

#[async_trait]
impl ModelStore for StaticModelStore {
  async fn get_model(&self, model_id: &str, tenant_id: &str) -> Result<Option<ModelConfig>, ModelStoreError> {
    Ok(self.models.get(&(model_id.to_string(), tenant_id.to_string())).cloned())
  }
}
