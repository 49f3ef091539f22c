//! Maintenance trigger over complete stacks

use std::sync::Arc;

use parking_lot::Mutex;
use stowage_cas::record::{meta_path, shadow_meta_path};
use stowage_cas::{run_maintenance, CasConfig, SafetyLevel, StackBuilder, StackConfig};
use stowage_reduce::MaintenanceMode;
use stowage_storage::{ErrorKind, Source, Storage};

use crate::harness::{cas_with, memory_backend, plain_cas, pull_all, sample, FaultyStorage};

fn cas_stack_config(safety: SafetyLevel) -> StackConfig {
    let mut cas = CasConfig::new("repo");
    cas.disable_cache = true;
    StackConfig {
        base_path: "data".to_string(),
        cas: Some(cas),
        maintenance: true,
        safety,
        ..StackConfig::default()
    }
}

#[tokio::test]
async fn test_plain_stack_is_type_mismatch() {
    let (_, backend) = memory_backend();
    let stack = StackBuilder::new(StackConfig::default())
        .build(backend)
        .await
        .unwrap();
    let err = run_maintenance(stack.storage().as_ref(), SafetyLevel::Full)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TypeMismatch);
}

#[tokio::test]
async fn test_overwrite_then_sweep() {
    let (_, backend) = memory_backend();
    let stack = StackBuilder::new(cas_stack_config(SafetyLevel::None))
        .build(backend)
        .await
        .unwrap();
    let storage = stack.storage().clone();
    storage
        .push(Source::from_bytes(sample(60_000, 1)), "f")
        .await
        .unwrap();
    let latest = sample(60_000, 2);
    storage
        .push(Source::from_bytes(latest.clone()), "f")
        .await
        .unwrap();

    let report = stack.finalize().await.unwrap().unwrap();
    assert_eq!(report.stats.mode, MaintenanceMode::Full);
    assert!(report.stats.chunks_swept > 0);
    assert_eq!(report.stats.chunks_kept_young, 0);
    assert_eq!(pull_all(storage.as_ref(), "f").await.unwrap(), latest);
}

#[tokio::test]
async fn test_full_safety_keeps_young_chunks() {
    let (_, backend) = memory_backend();
    let stack = StackBuilder::new(cas_stack_config(SafetyLevel::Full))
        .build(backend)
        .await
        .unwrap();
    let storage = stack.storage().clone();
    storage
        .push(Source::from_bytes(sample(60_000, 3)), "f")
        .await
        .unwrap();
    storage
        .push(Source::from_bytes(sample(60_000, 4)), "f")
        .await
        .unwrap();
    let report = run_maintenance(storage.as_ref(), SafetyLevel::Full)
        .await
        .unwrap();
    assert_eq!(report.stats.chunks_swept, 0);
    assert!(report.stats.chunks_kept_young > 0);
}

#[tokio::test]
async fn test_maintenance_reclaims_leaked_shadows() {
    let (_, backend) = memory_backend();
    let cas = plain_cas(backend).await;
    cas.push(Source::from_bytes(&b"live"[..]), "a/f").await.unwrap();

    let mut record = Vec::new();
    cas.sidecar().pull(&meta_path("a/f"), &mut record).await.unwrap();
    cas.sidecar()
        .push(Source::from_bytes(record), &shadow_meta_path("a/f"))
        .await
        .unwrap();

    let report = cas.run_maintenance(SafetyLevel::None).await.unwrap();
    assert_eq!(report.reclaim.reclaimed, 1);
    assert!(report.reclaim.soft_errors.is_empty());
    assert_eq!(pull_all(&cas, "a/f").await.unwrap(), b"live");
    assert!(cas.sidecar().stat(&shadow_meta_path("a/f")).await.is_err());
}

#[tokio::test]
async fn test_maintenance_disabled_does_nothing() {
    let (_, backend) = memory_backend();
    let mut config = cas_stack_config(SafetyLevel::None);
    config.maintenance = false;
    let stack = StackBuilder::new(config).build(backend).await.unwrap();
    assert!(stack.finalize().await.unwrap().is_none());
}

#[tokio::test]
async fn test_failed_index_compaction_keeps_chunks_usable() {
    let (_, backend) = memory_backend();
    let armed = Arc::new(Mutex::new(false));
    let fault = armed.clone();
    let cas = cas_with(
        backend.clone(),
        "repo",
        move |engine| FaultyStorage::wrap(engine, fault, |p| p.starts_with("indexes/")),
        |sidecar| sidecar,
    )
    .await;
    let content = sample(60_000, 11);
    cas.push(Source::from_bytes(content.clone()), "a").await.unwrap();
    cas.remove("a", false).await.unwrap();

    *armed.lock() = true;
    assert!(cas.run_maintenance(SafetyLevel::None).await.is_err());
    *armed.lock() = false;
    drop(cas);

    let reopened = plain_cas(backend).await;
    reopened
        .push(Source::from_bytes(content.clone()), "b")
        .await
        .unwrap();
    assert_eq!(pull_all(&reopened, "b").await.unwrap(), content);
}
