//! Composition of a complete storage stack from a [`StackConfig`].
//!
//! Layers from the inside out: the backend, then either the
//! content-addressable layer confined beneath the base path or the base path
//! confinement alone, then optional stream encryption.

use std::sync::Arc;

use stowage_reduce::SafetyLevel;
use stowage_storage::{
    create_encryptor, describe_stack, open_backend, EncryptedStorage, SanitizedStorage, Storage,
    StorageError, StorageResult,
};
use tracing::{error, info};

use crate::cas::CasStorage;
use crate::config::StackConfig;
use crate::maintenance::MaintenanceReport;

/// A built stack plus a typed handle on its content-addressable layer
pub struct Stack {
    storage: Arc<dyn Storage>,
    cas: Option<Arc<CasStorage>>,
    maintenance: bool,
    safety: SafetyLevel,
}

impl Stack {
    /// The outermost layer
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// The content-addressable layer, when configured
    pub fn cas(&self) -> Option<&Arc<CasStorage>> {
        self.cas.as_ref()
    }

    /// Layer names from the outside in
    pub fn describe(&self) -> Vec<&'static str> {
        describe_stack(self.storage.as_ref())
    }

    /// Run maintenance if it was requested. Failures are logged and returned.
    pub async fn finalize(self) -> StorageResult<Option<MaintenanceReport>> {
        if !self.maintenance {
            return Ok(None);
        }
        let Some(cas) = &self.cas else {
            info!("maintenance requested without a content-addressable layer, skipping");
            return Ok(None);
        };
        match cas.run_maintenance(self.safety).await {
            Ok(report) => {
                info!(
                    reclaimed = report.reclaim.reclaimed,
                    swept = report.stats.chunks_swept,
                    compacted = report.stats.deltas_compacted,
                    "maintenance done"
                );
                Ok(Some(report))
            }
            Err(e) => {
                error!(error = %e, "maintenance failed");
                Err(e)
            }
        }
    }
}

/// Builds [`Stack`]s
#[derive(Debug, Clone)]
pub struct StackBuilder {
    config: StackConfig,
}

impl StackBuilder {
    /// Builder for `config`
    pub fn new(config: StackConfig) -> Self {
        Self { config }
    }

    /// Builder for the process environment
    pub fn from_env() -> StorageResult<Self> {
        Ok(Self::new(StackConfig::from_env()?))
    }

    /// The configuration being built
    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    /// Compose the layers over `backend`.
    pub async fn build(&self, backend: Arc<dyn Storage>) -> StorageResult<Stack> {
        let config = &self.config;
        let base = config.base_path.as_str();

        let (confined, cas) = match &config.cas {
            Some(cas_config) => {
                let cas = Arc::new(CasStorage::connect(cas_config, backend, base).await?);
                let layer: Arc<dyn Storage> = cas.clone();
                (SanitizedStorage::wrap(base, layer)?, Some(cas))
            }
            None => (SanitizedStorage::wrap(base, backend)?, None),
        };

        let storage = match &config.encryption {
            Some(enc) => {
                let encryptor = create_encryptor(&enc.algorithm, enc.passphrase.as_bytes())
                    .map_err(|e| StorageError::Config(format!("encryption: {e}")))?;
                EncryptedStorage::wrap(encryptor, confined)?
            }
            None => confined,
        };

        let stack = Stack {
            storage,
            cas,
            maintenance: config.maintenance,
            safety: config.safety,
        };
        info!(layers = ?stack.describe(), base = %base, "storage stack ready");
        Ok(stack)
    }

    /// Open the configured backend and compose the layers over it.
    pub async fn build_default(&self) -> StorageResult<Stack> {
        let backend = open_backend(&self.config.backend.revealed()?, "")?;
        self.build(backend).await
    }
}
