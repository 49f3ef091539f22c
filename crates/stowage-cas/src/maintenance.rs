//! Maintenance trigger over an arbitrary stack.

use stowage_reduce::{MaintenanceStats, SafetyLevel};
use stowage_storage::{describe_stack, find_layer, Storage, StorageError, StorageResult};

use crate::cas::{CasStorage, ReclaimReport};

/// Outcome of a maintenance run
#[derive(Debug, Clone)]
pub struct MaintenanceReport {
    /// Shadows reclaimed before the engine ran
    pub reclaim: ReclaimReport,
    /// Engine statistics
    pub stats: MaintenanceStats,
}

/// The content-addressable layer of `storage`, wherever it sits in the stack.
pub fn find_cas(storage: &dyn Storage) -> StorageResult<&CasStorage> {
    find_layer::<CasStorage>(storage).ok_or_else(|| StorageError::TypeMismatch {
        expected: "cas",
        found: describe_stack(storage).join(" -> "),
    })
}

/// Run maintenance on the stack `storage`. Fails with
/// [`StorageError::TypeMismatch`] when the stack has no content-addressable
/// layer.
pub async fn run_maintenance(storage: &dyn Storage, safety: SafetyLevel) -> StorageResult<MaintenanceReport> {
    find_cas(storage)?.run_maintenance(safety).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use stowage_reduce::MaintenanceMode;
    use stowage_storage::{BackendStorage, ErrorKind, MemoryBackend, SanitizedStorage, Source};

    use crate::config::CasConfig;

    #[tokio::test]
    async fn non_cas_stack_is_a_type_mismatch() {
        let backend: Arc<dyn Storage> = Arc::new(BackendStorage::new(MemoryBackend::new()));
        let stack = SanitizedStorage::wrap("data", backend).unwrap();
        let err = run_maintenance(stack.as_ref(), SafetyLevel::Full).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
        assert!(err.to_string().contains("sanitized -> memory"));
    }

    #[tokio::test]
    async fn finds_cas_beneath_wrappers() {
        let backend: Arc<dyn Storage> = Arc::new(BackendStorage::new(MemoryBackend::new()));
        let mut config = CasConfig::new("repo");
        config.disable_cache = true;
        let cas = CasStorage::connect(&config, backend, "").await.unwrap();
        let stack = SanitizedStorage::wrap("data", Arc::new(cas)).unwrap();
        stack.push(Source::from_bytes(&b"abc"[..]), "f").await.unwrap();
        stack.push(Source::from_bytes(&b"abcd"[..]), "f").await.unwrap();

        let report = run_maintenance(stack.as_ref(), SafetyLevel::None).await.unwrap();
        assert_eq!(report.reclaim.reclaimed, 0);
        assert_eq!(report.stats.mode, MaintenanceMode::Full);

        let mut out = Vec::new();
        stack.pull("f", &mut out).await.unwrap();
        assert_eq!(out, b"abcd");
    }
}
