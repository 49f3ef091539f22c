//! Backend configuration and the backend factory.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::backend::BackendStorage;
use crate::error::{StorageError, StorageResult};
use crate::local::LocalBackend;
use crate::memory::MemoryBackend;
use crate::obscure;
use crate::sanitized::SanitizedStorage;
use crate::storage::Storage;

/// Backend kind for a local directory.
pub const KIND_LOCAL: &str = "local";
/// Backend kind for an in-process map.
pub const KIND_MEMORY: &str = "memory";

/// Parameter names whose values are obscured at rest.
pub const SECRET_PARAMS: &[&str] = &["password", "pass", "secret_access_key", "key", "token"];

/// Where a backend lives and how to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend kind, e.g. `"local"`.
    pub kind: String,
    /// Root location within the backend.
    pub root: String,
    /// Backend-specific parameters.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::memory()
    }
}

impl BackendConfig {
    /// A local directory backend.
    pub fn local(root: impl Into<String>) -> Self {
        Self {
            kind: KIND_LOCAL.to_string(),
            root: root.into(),
            params: BTreeMap::new(),
        }
    }

    /// An in-memory backend.
    pub fn memory() -> Self {
        Self {
            kind: KIND_MEMORY.to_string(),
            root: String::new(),
            params: BTreeMap::new(),
        }
    }

    /// Adds a parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Whether a parameter carries a secret.
    pub fn is_secret(key: &str) -> bool {
        SECRET_PARAMS.contains(&key)
    }

    /// A copy with every secret parameter obscured.
    pub fn obscured(&self) -> Self {
        let params = self
            .params
            .iter()
            .map(|(key, value)| {
                let value = if Self::is_secret(key) {
                    obscure::obscure(value)
                } else {
                    value.clone()
                };
                (key.clone(), value)
            })
            .collect();
        Self {
            params,
            ..self.clone()
        }
    }

    /// A copy with every secret parameter revealed.
    pub fn revealed(&self) -> StorageResult<Self> {
        let mut params = BTreeMap::new();
        for (key, value) in &self.params {
            let value = if Self::is_secret(key) {
                obscure::reveal(value)
                    .map_err(|err| StorageError::Config(format!("parameter {key}: {err}")))?
            } else {
                value.clone()
            };
            params.insert(key.clone(), value);
        }
        Ok(Self {
            params,
            ..self.clone()
        })
    }

    /// Kind, root and params flattened into one map; the input to cache identity.
    pub fn effective_params(&self) -> BTreeMap<String, String> {
        let mut all = self.params.clone();
        all.insert("type".to_string(), self.kind.clone());
        all.insert("root".to_string(), self.root.clone());
        all
    }
}

/// Opens the backend described by `config`, confined beneath `base_path`.
pub fn open_backend(config: &BackendConfig, base_path: &str) -> StorageResult<Arc<dyn Storage>> {
    let raw: Arc<dyn Storage> = match config.kind.as_str() {
        KIND_LOCAL => {
            let backend = LocalBackend::new(&config.root).map_err(|err| {
                StorageError::Config(format!("local backend root {:?}: {err}", config.root))
            })?;
            Arc::new(BackendStorage::new(backend))
        }
        KIND_MEMORY => Arc::new(BackendStorage::new(MemoryBackend::new())),
        other => {
            return Err(StorageError::Config(format!(
                "unsupported backend kind {other:?}"
            )))
        }
    };
    info!(kind = %config.kind, root = %config.root, base_path, "opened backend");
    SanitizedStorage::wrap(base_path, raw)
}
