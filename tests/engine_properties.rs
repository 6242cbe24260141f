//! Cross-component properties of the engine: rollback fidelity, idempotent
//! service control, per-key serialization, grant expiry, journal
//! persistence across restarts, and the audit trail.

use std::sync::Arc;
use std::time::Duration;

use sysgate_lib::audit::{self, AuditQuery, AuditStore};
use sysgate_lib::elevation::StaticElevator;
use sysgate_lib::engine::{MutationEngine, MutationOutcome, OperationRequest, ServiceOp};
use sysgate_lib::error::SysgateError;
use sysgate_lib::journal::{EntryStatus, JournalEntry, ResourceState, RollbackJournal};
use sysgate_lib::permissions::{
    AlwaysAllow, DefaultPermissionService, Operation, PermissionRecord, PermissionService,
    PermissionStore,
};
use sysgate_lib::resource::RegistryLocation;
use sysgate_lib::runtime::mock::{MockMutator, MutatorCall};
use sysgate_lib::runtime::{RegistryValue, ServiceState};

fn open_permissions() -> Arc<dyn PermissionService> {
    let service = DefaultPermissionService::new(PermissionStore::in_memory());
    for pattern in ["registry:*", "service:*"] {
        service
            .grant(PermissionRecord::new(pattern, [Operation::Read, Operation::Write], None))
            .unwrap();
    }
    Arc::new(service)
}

fn engine(mock: Arc<MockMutator>) -> MutationEngine {
    MutationEngine::builder(open_permissions(), mock)
        .elevator(Arc::new(StaticElevator::elevated()))
        .build()
}

fn applied(outcome: MutationOutcome) -> JournalEntry {
    match outcome {
        MutationOutcome::Applied { entry } => entry,
        other => panic!("expected an applied entry, got {:?}", other),
    }
}

// =========================================================================
// Rollback fidelity
// =========================================================================

#[tokio::test]
async fn registry_rollback_restores_existing_value() {
    let location = RegistryLocation::parse("HKLM\\Software\\Vendor", "Mode").unwrap();
    let mock = Arc::new(MockMutator::new().with_registry_value(
        "HKLM\\Software\\Vendor",
        "Mode",
        RegistryValue::DWord(1),
    ));
    let engine = engine(mock.clone());

    let entry = applied(
        engine
            .apply(OperationRequest::registry_set(
                "HKLM\\Software\\Vendor",
                "Mode",
                RegistryValue::DWord(2),
            ))
            .await
            .unwrap(),
    );
    assert_eq!(entry.prior_state, ResourceState::Registry(RegistryValue::DWord(1)));
    assert_eq!(mock.registry_value(&location), Some(RegistryValue::DWord(2)));

    engine.rollback(entry.id).await.unwrap();
    assert_eq!(mock.registry_value(&location), Some(RegistryValue::DWord(1)));
}

#[tokio::test]
async fn registry_delete_rolls_back_to_original_value() {
    let location = RegistryLocation::parse("HKCU\\Environment", "PATHEXT").unwrap();
    let original = RegistryValue::ExpandString("%PATHEXT%;.PY".into());
    let mock = Arc::new(MockMutator::new().with_registry_value(
        "HKCU\\Environment",
        "PATHEXT",
        original.clone(),
    ));
    let engine = engine(mock.clone());

    let entry = applied(
        engine
            .apply(OperationRequest::registry_delete("HKCU\\Environment", "PATHEXT"))
            .await
            .unwrap(),
    );
    assert_eq!(entry.new_state, ResourceState::Absent);
    assert_eq!(mock.registry_value(&location), None);

    engine.rollback(entry.id).await.unwrap();
    assert_eq!(mock.registry_value(&location), Some(original));
}

#[tokio::test]
async fn second_rollback_is_rejected_without_side_effects() {
    let mock = Arc::new(MockMutator::new());
    let engine = engine(mock.clone());
    let entry = applied(
        engine
            .apply(OperationRequest::registry_set("HKCU\\A", "v", RegistryValue::DWord(7)))
            .await
            .unwrap(),
    );
    engine.rollback(entry.id).await.unwrap();
    let mutations = mock.mutation_count();

    let err = engine.rollback(entry.id).await.unwrap_err();
    assert!(matches!(err, SysgateError::AlreadyRolledBack(id) if id == entry.id));
    assert_eq!(mock.mutation_count(), mutations);
    assert_eq!(engine.journal().get(entry.id).unwrap().status, EntryStatus::RolledBack);
}

// =========================================================================
// Service idempotence
// =========================================================================

#[tokio::test]
async fn repeated_start_and_stop_have_single_side_effect() {
    let mock = Arc::new(MockMutator::new().with_service("Spooler", ServiceState::Stopped));
    let engine = engine(mock.clone());

    applied(engine.apply(OperationRequest::service("Spooler", ServiceOp::Start)).await.unwrap());
    let again = engine.apply(OperationRequest::service("Spooler", ServiceOp::Start)).await.unwrap();
    assert!(matches!(again, MutationOutcome::Unchanged { .. }));
    assert_eq!(mock.call_count(&MutatorCall::StartService("Spooler".into())), 1);

    applied(engine.apply(OperationRequest::service("spooler", ServiceOp::Stop)).await.unwrap());
    let again = engine.apply(OperationRequest::service("Spooler", ServiceOp::Stop)).await.unwrap();
    assert!(matches!(again, MutationOutcome::Unchanged { .. }));
    assert_eq!(mock.service("Spooler"), Some(ServiceState::Stopped));
    assert_eq!(engine.journal().len(), 2);
}

#[tokio::test]
async fn service_rollback_restores_prior_state() {
    let mock = Arc::new(MockMutator::new().with_service("wuauserv", ServiceState::Running));
    let engine = engine(mock.clone());
    let entry = applied(
        engine
            .apply(OperationRequest::service("wuauserv", ServiceOp::Stop))
            .await
            .unwrap(),
    );
    assert_eq!(mock.service("wuauserv"), Some(ServiceState::Stopped));
    engine.rollback(entry.id).await.unwrap();
    assert_eq!(mock.service("wuauserv"), Some(ServiceState::Running));
}

#[tokio::test]
async fn missing_service_is_not_found() {
    let engine = engine(Arc::new(MockMutator::new()));
    let err = engine
        .apply(OperationRequest::service("NoSuchService", ServiceOp::Start))
        .await
        .unwrap_err();
    assert!(matches!(err, SysgateError::ResourceNotFound(_)), "got {:?}", err);
    assert!(engine.journal().is_empty());
}

// =========================================================================
// Per-key serialization
// =========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writes_to_one_key_are_serialized() {
    let mock = Arc::new(MockMutator::new().with_delay(Duration::from_millis(50)));
    let engine = Arc::new(engine(mock.clone()));

    // Same value addressed through two spellings of the key
    let first = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .apply(OperationRequest::registry_set(
                    "HKEY_CURRENT_USER\\Software\\Race",
                    "Value",
                    RegistryValue::DWord(1),
                ))
                .await
        })
    };
    let second = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .apply(OperationRequest::registry_set(
                    "hkcu\\software\\race",
                    "value",
                    RegistryValue::DWord(2),
                ))
                .await
        })
    };
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    let entries = engine.journal().entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].prior_state, ResourceState::Absent);
    assert_eq!(entries[1].prior_state, entries[0].new_state);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn different_keys_proceed_in_parallel() {
    let delay = Duration::from_millis(200);
    let mock = Arc::new(MockMutator::new().with_delay(delay));
    let engine = Arc::new(engine(mock));

    let started = std::time::Instant::now();
    let tasks: Vec<_> = (0..4)
        .map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .apply(OperationRequest::registry_set(
                        "HKCU\\Software\\Parallel",
                        &format!("v{}", i),
                        RegistryValue::DWord(i),
                    ))
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert!(started.elapsed() < delay * 3, "took {:?}", started.elapsed());
}

// =========================================================================
// Grant expiry
// =========================================================================

#[tokio::test]
async fn expired_grant_behaves_as_absent() {
    let service = DefaultPermissionService::new(PermissionStore::in_memory());
    service
        .grant(PermissionRecord::new("HKCU\\Software\\Test", [Operation::Write], Some(0)))
        .unwrap();
    let mock = Arc::new(MockMutator::new());
    let engine = MutationEngine::builder(Arc::new(service), mock.clone())
        .elevator(Arc::new(StaticElevator::elevated()))
        .build();

    let err = engine
        .apply(OperationRequest::registry_set("HKCU\\Software\\Test", "v", RegistryValue::DWord(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, SysgateError::PermissionDenied(_)));
    assert!(engine.permissions().list().is_empty());
    assert_eq!(mock.mutation_count(), 0);
}

#[tokio::test]
async fn prompt_answer_is_remembered() {
    let service: Arc<dyn PermissionService> =
        Arc::new(DefaultPermissionService::new(PermissionStore::in_memory()));
    let engine = MutationEngine::builder(service.clone(), Arc::new(MockMutator::new()))
        .prompt(Arc::new(AlwaysAllow))
        .elevator(Arc::new(StaticElevator::elevated()))
        .build();

    engine
        .apply(OperationRequest::registry_set("HKCU\\Software\\Test", "v", RegistryValue::DWord(1)))
        .await
        .unwrap();
    let key = sysgate_lib::resource::ResourceKey::registry("HKCU\\Software\\Test", "v").unwrap();
    assert!(service.has_permission(&key, Operation::Write));
    assert!(!service.has_permission(&key, Operation::Elevate));
}

// =========================================================================
// Persistence
// =========================================================================

#[tokio::test]
async fn journal_survives_restart_and_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("journal.json");
    let location = RegistryLocation::parse("HKCU\\Software\\Test", "v").unwrap();
    let mock = Arc::new(MockMutator::new());

    let entry_id = {
        let engine = MutationEngine::builder(open_permissions(), mock.clone())
            .journal(Arc::new(RollbackJournal::load(&path, 50)))
            .elevator(Arc::new(StaticElevator::elevated()))
            .build();
        let entry = applied(
            engine
                .apply(OperationRequest::registry_set(
                    "HKCU\\Software\\Test",
                    "v",
                    RegistryValue::String("v1".into()),
                ))
                .await
                .unwrap(),
        );
        entry.id
    };

    let engine = MutationEngine::builder(open_permissions(), mock.clone())
        .journal(Arc::new(RollbackJournal::load(&path, 50)))
        .elevator(Arc::new(StaticElevator::elevated()))
        .build();
    assert!(engine.journal().get(entry_id).unwrap().is_applied());
    engine.rollback(entry_id).await.unwrap();
    assert_eq!(mock.registry_value(&location), None);

    let reloaded = RollbackJournal::load(&path, 50);
    assert_eq!(reloaded.get(entry_id).unwrap().status, EntryStatus::RolledBack);
}

// =========================================================================
// Audit trail
// =========================================================================

#[tokio::test]
async fn mutations_and_denials_are_audited() {
    let store = Arc::new(AuditStore::in_memory().unwrap());
    let (writer, drain) = audit::writer::create(store.clone(), Duration::from_secs(3600));
    let drain = tokio::spawn(drain);

    let service = DefaultPermissionService::new(PermissionStore::in_memory());
    service
        .grant(PermissionRecord::new("registry:HKCU\\Software\\Test", [Operation::Write], None))
        .unwrap();
    let engine = MutationEngine::builder(Arc::new(service), Arc::new(MockMutator::new()))
        .elevator(Arc::new(StaticElevator::elevated()))
        .audit(writer)
        .build();

    engine
        .apply(OperationRequest::registry_set("HKCU\\Software\\Test", "v", RegistryValue::DWord(1)))
        .await
        .unwrap();
    engine
        .apply(OperationRequest::registry_set("HKCU\\Software\\Other", "v", RegistryValue::DWord(1)))
        .await
        .unwrap_err();

    drop(engine);
    drain.await.unwrap();

    let sets = store
        .query(&AuditQuery {
            action: Some("registry.set".into()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(sets.len(), 2);
    assert!(sets.iter().any(|r| r.result == "success"
        && r.subject.as_deref() == Some("registry:HKCU\\Software\\Test\\v")));
    assert!(sets.iter().any(|r| r.result == "failure"
        && r.subject.as_deref() == Some("registry:HKCU\\Software\\Other\\v")));

    let decisions = store
        .query(&AuditQuery {
            action: Some("gate.authorize".into()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(decisions.len(), 2);
}
