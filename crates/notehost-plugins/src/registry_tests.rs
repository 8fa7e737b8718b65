//! Lifecycle state machine tests

use notehost_core::config::{EventsConfig, ValidatorConfig};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use crate::audit::{AuditRecord, MemoryAuditSink};
use crate::cache::{ArtifactCache, ArtifactRecord};
use crate::events::{EventBus, EventKind, PluginEvent};
use crate::handle::HandleFactory;
use crate::model::PluginStatus;
use crate::permissions::{GrantLog, Permission};
use crate::registry::{LifecycleError, PluginRegistry, RegistryParts};
use crate::store::PluginStore;
use crate::testing::{StubFactory, ZipBuilder, sample_archive, sample_metadata};
use crate::validator::SecurityValidator;
use crate::verdicts::VerdictLog;

struct Fixture {
    tmp: TempDir,
    registry: Arc<PluginRegistry>,
    cache: Arc<ArtifactCache>,
    verdicts: Arc<VerdictLog>,
    grants: Arc<GrantLog>,
    bus: Arc<EventBus>,
    audit: Arc<MemoryAuditSink>,
}

fn open_registry(tmp: &Path, factory: Arc<dyn HandleFactory>, audit: Arc<MemoryAuditSink>) -> Fixture {
    open_registry_with_store(tmp, PluginStore::open(&tmp.join("plugins.json")), factory, audit)
}

fn open_registry_with_store(
    tmp: &Path,
    store: PluginStore,
    factory: Arc<dyn HandleFactory>,
    audit: Arc<MemoryAuditSink>,
) -> Fixture {
    let cache = Arc::new(ArtifactCache::open(&tmp.join("cache")).unwrap());
    let verdicts = Arc::new(VerdictLog::open(&tmp.join("verdicts.jsonl")).unwrap());
    let grants = Arc::new(GrantLog::open(&tmp.join("grants.jsonl")).unwrap());
    let bus = Arc::new(EventBus::new(&EventsConfig::default()));
    bus.start();

    let registry = PluginRegistry::open(RegistryParts {
        verdicts: verdicts.clone(),
        grants: grants.clone(),
        cache: cache.clone(),
        store,
        bus: bus.clone(),
        factory,
        audit: audit.clone(),
    })
    .unwrap();

    Fixture {
        tmp: TempDir::new().unwrap(),
        registry,
        cache,
        verdicts,
        grants,
        bus,
        audit,
    }
}

fn fixture(factory: Arc<dyn HandleFactory>) -> (TempDir, Fixture) {
    let dir = TempDir::new().unwrap();
    let fx = open_registry(dir.path(), factory, Arc::new(MemoryAuditSink::new()));
    (dir, fx)
}

fn cache_archive(fx: &Fixture, bytes: Vec<u8>) -> ArtifactRecord {
    let source = fx.tmp.path().join(format!("{}.zip", uuid::Uuid::new_v4()));
    std::fs::write(&source, bytes).unwrap();
    fx.cache.import_local(&source).unwrap()
}

/// Cache an archive and record its verdict
fn admit(fx: &Fixture, bytes: Vec<u8>) -> ArtifactRecord {
    let artifact = cache_archive(fx, bytes);
    let verdict = SecurityValidator::new(ValidatorConfig::default()).validate(&artifact);
    fx.verdicts.append(verdict).unwrap();
    artifact
}

fn install(fx: &Fixture, id: &str) -> ArtifactRecord {
    let artifact = admit(fx, sample_archive(id));
    fx.registry.register(&artifact, sample_metadata(id)).unwrap();
    artifact
}

#[tokio::test]
async fn test_register_requires_verdict() {
    let (_dir, fx) = fixture(Arc::new(StubFactory::new()));
    let artifact = cache_archive(&fx, sample_archive("unvetted"));

    let err = fx
        .registry
        .register(&artifact, sample_metadata("unvetted"))
        .unwrap_err();
    assert!(matches!(err, LifecycleError::ValidationFailed { .. }));
    assert!(fx.registry.get("unvetted").is_none());
}

#[tokio::test]
async fn test_register_rejects_failed_verdict() {
    let (_dir, fx) = fixture(Arc::new(StubFactory::new()));
    let bytes = ZipBuilder::new()
        .file("plugin.toml", crate::testing::sample_manifest("evil").as_bytes())
        .file("../../evil.sh", b"rm -rf /")
        .build();
    let artifact = admit(&fx, bytes);

    match fx.registry.register(&artifact, sample_metadata("evil")) {
        Err(LifecycleError::ValidationFailed { sha256, reasons }) => {
            assert_eq!(sha256, artifact.sha256);
            assert!(!reasons.is_empty());
        }
        other => panic!("expected ValidationFailed, got {:?}", other.map(|i| i.id)),
    }
    assert!(fx.registry.list().is_empty());
}

#[tokio::test]
async fn test_register_and_duplicate() {
    let (_dir, fx) = fixture(Arc::new(StubFactory::new()));
    let artifact = install(&fx, "word-count");

    let info = fx.registry.get("word-count").unwrap();
    assert_eq!(info.status, PluginStatus::Registered);
    assert_eq!(info.checksum, artifact.sha256);
    assert_eq!(fx.cache.ref_count(&artifact.sha256), 1);

    let err = fx
        .registry
        .register(&artifact, sample_metadata("word-count"))
        .unwrap_err();
    assert!(matches!(err, LifecycleError::DuplicateId(id) if id == "word-count"));
}

#[tokio::test]
async fn test_malformed_metadata_rejected() {
    let (_dir, fx) = fixture(Arc::new(StubFactory::new()));
    let artifact = admit(&fx, sample_archive("ok"));
    let mut metadata = sample_metadata("ok");
    metadata.version = "latest".to_string();

    let err = fx.registry.register(&artifact, metadata).unwrap_err();
    assert!(matches!(err, LifecycleError::MalformedMetadata(_)));
}

#[tokio::test]
async fn test_activate_is_idempotent() {
    let factory = Arc::new(StubFactory::new());
    let (_dir, fx) = fixture(factory.clone());
    install(&fx, "inbox");

    let first = fx.registry.activate("inbox").await.unwrap();
    assert_eq!(first.status, PluginStatus::Active);
    let second = fx.registry.activate("inbox").await.unwrap();
    assert_eq!(second.status, PluginStatus::Active);

    assert_eq!(factory.created(), 1);
    assert_eq!(fx.bus.listener_count("note.created"), 1);
}

#[tokio::test]
async fn test_events_reach_active_queue_plugin() {
    let (_dir, fx) = fixture(Arc::new(StubFactory::new()));
    install(&fx, "inbox");
    fx.registry.activate("inbox").await.unwrap();

    let mut rx = fx.registry.take_queue("inbox").unwrap().unwrap();
    assert!(fx.registry.take_queue("inbox").unwrap().is_none());

    let report = fx
        .bus
        .publish(&PluginEvent::new(EventKind::NoteCreated, "test"))
        .await;
    assert_eq!(report.delivered, 1);
    assert_eq!(rx.recv().await.unwrap().event_type(), "note.created");
}

#[tokio::test]
async fn test_deactivate_detaches_listeners() {
    let (_dir, fx) = fixture(Arc::new(StubFactory::new()));
    install(&fx, "inbox");

    let err = fx.registry.deactivate("inbox").await.unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::IllegalTransition { status: PluginStatus::Registered, .. }
    ));

    fx.registry.activate("inbox").await.unwrap();
    let info = fx.registry.deactivate("inbox").await.unwrap();
    assert_eq!(info.status, PluginStatus::Inactive);
    assert_eq!(fx.bus.listener_count("note.created"), 0);

    // Second deactivate is a no-op
    let again = fx.registry.deactivate("inbox").await.unwrap();
    assert_eq!(again.status, PluginStatus::Inactive);

    let reactivated = fx.registry.activate("inbox").await.unwrap();
    assert_eq!(reactivated.status, PluginStatus::Active);
}

#[tokio::test]
async fn test_load_failure_moves_to_error() {
    let (_dir, fx) = fixture(Arc::new(StubFactory::failing("module did not compile")));
    install(&fx, "broken");

    let err = fx.registry.activate("broken").await.unwrap_err();
    assert!(matches!(err, LifecycleError::LoadFailed { .. }));

    let info = fx.registry.get("broken").unwrap();
    assert_eq!(info.status, PluginStatus::Error);
    assert!(info.last_error.unwrap().contains("module did not compile"));
    assert_eq!(fx.bus.listener_count("note.created"), 0);

    let err = fx.registry.activate("broken").await.unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::IllegalTransition { status: PluginStatus::Error, .. }
    ));

    let reset = fx.registry.reset("broken").unwrap();
    assert_eq!(reset.status, PluginStatus::Inactive);
    assert!(reset.last_error.is_none());
}

#[tokio::test]
async fn test_runtime_fault_moves_to_error() {
    let factory = Arc::new(StubFactory::new());
    let (_dir, fx) = fixture(factory.clone());
    install(&fx, "flaky");
    fx.registry.activate("flaky").await.unwrap();

    factory.fault("listener panicked");

    let mut status = None;
    for _ in 0..50 {
        status = fx.registry.status("flaky");
        if status == Some(PluginStatus::Error) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, Some(PluginStatus::Error));

    let info = fx.registry.get("flaky").unwrap();
    assert_eq!(info.last_error.as_deref(), Some("listener panicked"));
    assert_eq!(fx.bus.listener_count("note.created"), 0);
    assert!(
        fx.audit
            .records()
            .iter()
            .any(|r| matches!(r, AuditRecord::Fault { plugin_id, .. } if plugin_id == "flaky"))
    );
}

#[tokio::test]
async fn test_fault_ignored_when_not_active() {
    let (_dir, fx) = fixture(Arc::new(StubFactory::new()));
    install(&fx, "idle");
    assert!(!fx.registry.report_fault("idle", "late fault").await.unwrap());
    assert_eq!(fx.registry.status("idle"), Some(PluginStatus::Registered));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_transition_rejected() {
    let (_dir, fx) = fixture(Arc::new(StubFactory::slow(Duration::from_millis(300))));
    install(&fx, "slow");

    let registry = fx.registry.clone();
    let activation = tokio::spawn(async move { registry.activate("slow").await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = fx.registry.activate("slow").await.unwrap_err();
    assert!(matches!(err, LifecycleError::ConcurrentTransition(_)));
    let err = fx.registry.unregister("slow").unwrap_err();
    assert!(matches!(err, LifecycleError::ConcurrentTransition(_)));

    let info = activation.await.unwrap().unwrap();
    assert_eq!(info.status, PluginStatus::Active);
}

#[tokio::test]
async fn test_unregister_revokes_grants_and_collects_artifact() {
    let (_dir, fx) = fixture(Arc::new(StubFactory::new()));
    let artifact = install(&fx, "exporter");
    fx.registry
        .grant_permission("exporter", Permission::NotesRead, "admin")
        .unwrap();
    fx.registry
        .grant_permission("exporter", Permission::NotesWrite, "admin")
        .unwrap();

    fx.registry.activate("exporter").await.unwrap();
    let err = fx.registry.unregister("exporter").unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::IllegalTransition { status: PluginStatus::Active, .. }
    ));
    fx.registry.deactivate("exporter").await.unwrap();

    let removed = fx.registry.unregister("exporter").unwrap();
    assert_eq!(removed.id, "exporter");
    assert!(fx.registry.get("exporter").is_none());
    assert!(!fx.grants.has("exporter", Permission::NotesRead));
    assert!(fx.grants.granted("exporter").is_empty());
    assert!(!artifact.local_path.exists());

    let revocations = fx
        .audit
        .records()
        .into_iter()
        .filter(|r| matches!(r, AuditRecord::Grant { revoked: true, .. }))
        .count();
    assert_eq!(revocations, 2);
}

#[tokio::test]
async fn test_shared_artifact_survives_first_unregister() {
    let (_dir, fx) = fixture(Arc::new(StubFactory::new()));
    let artifact = admit(&fx, sample_archive("twin"));
    fx.registry.register(&artifact, sample_metadata("twin-a")).unwrap();
    fx.registry.register(&artifact, sample_metadata("twin-b")).unwrap();

    fx.registry.unregister("twin-a").unwrap();
    assert!(artifact.local_path.exists());
    fx.registry.unregister("twin-b").unwrap();
    assert!(!artifact.local_path.exists());
}

#[tokio::test]
async fn test_unregistered_slot_cannot_be_activated() {
    let factory = Arc::new(StubFactory::new());
    let (_dir, fx) = fixture(factory.clone());
    install(&fx, "stale");

    let slot = fx.registry.slot("stale").unwrap();
    fx.registry.unregister("stale").unwrap();

    let err = fx.registry.activate_slot("stale", slot).await.unwrap_err();
    assert!(matches!(err, LifecycleError::NotFound(id) if id == "stale"));
    assert_eq!(factory.created(), 0);
    assert_eq!(fx.bus.listener_count("note.created"), 0);
    assert!(fx.registry.get("stale").is_none());
}

#[tokio::test]
async fn test_unregister_waits_out_activation() {
    let factory = Arc::new(StubFactory::slow(Duration::from_millis(200)));
    let (_dir, fx) = fixture(factory.clone());
    install(&fx, "racer");

    let registry = fx.registry.clone();
    let activation = tokio::spawn(async move { registry.activate("racer").await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(fx.registry.unregister("racer").is_err());
    activation.await.unwrap().unwrap();
    assert_eq!(fx.registry.status("racer"), Some(PluginStatus::Active));
    assert_eq!(fx.bus.listener_count("note.created"), 1);
}

#[tokio::test]
async fn test_register_rolled_back_when_table_write_fails() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"not a directory").unwrap();
    let fx = open_registry_with_store(
        dir.path(),
        PluginStore::open(&blocker.join("plugins.json")),
        Arc::new(StubFactory::new()),
        Arc::new(MemoryAuditSink::new()),
    );
    let artifact = admit(&fx, sample_archive("unsaved"));

    let err = fx
        .registry
        .register(&artifact, sample_metadata("unsaved"))
        .unwrap_err();
    assert!(matches!(err, LifecycleError::Storage(_)));
    assert!(fx.registry.get("unsaved").is_none());
    assert_eq!(fx.cache.ref_count(&artifact.sha256), 0);
    assert!(
        !fx.audit
            .records()
            .iter()
            .any(|r| matches!(r, AuditRecord::Transition { plugin_id, .. } if plugin_id == "unsaved"))
    );
}

#[tokio::test]
async fn test_grant_requires_registered_plugin() {
    let (_dir, fx) = fixture(Arc::new(StubFactory::new()));
    let err = fx
        .registry
        .grant_permission("ghost", Permission::NotesRead, "admin")
        .unwrap_err();
    assert!(matches!(err, LifecycleError::NotFound(_)));
}

#[tokio::test]
async fn test_restart_restores_active_as_inactive() {
    let dir = TempDir::new().unwrap();
    let sha256 = {
        let fx = open_registry(dir.path(), Arc::new(StubFactory::new()), Arc::new(MemoryAuditSink::new()));
        let artifact = install(&fx, "persisted");
        fx.registry.activate("persisted").await.unwrap();
        artifact.sha256
    };

    let fx = open_registry(dir.path(), Arc::new(StubFactory::new()), Arc::new(MemoryAuditSink::new()));
    let info = fx.registry.get("persisted").unwrap();
    assert_eq!(info.status, PluginStatus::Inactive);
    assert_eq!(fx.cache.ref_count(&sha256), 1);

    let info = fx.registry.activate("persisted").await.unwrap();
    assert_eq!(info.status, PluginStatus::Active);
}

#[tokio::test]
async fn test_transitions_are_audited() {
    let (_dir, fx) = fixture(Arc::new(StubFactory::new()));
    install(&fx, "audited");
    fx.registry.activate("audited").await.unwrap();
    fx.registry.deactivate("audited").await.unwrap();

    let operations: Vec<String> = fx
        .audit
        .records()
        .into_iter()
        .filter_map(|r| match r {
            AuditRecord::Transition { operation, .. } => Some(operation),
            _ => None,
        })
        .collect();
    assert_eq!(operations, vec!["register", "activate", "deactivate"]);
}
