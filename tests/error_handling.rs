//! Error handling and edge case tests.

use persub::{
    Access, AckOutcome, AllowAll, Authorizer, Checkpoint, CheckpointStore, ConnectionRequest,
    CreateOutcome, DeleteOutcome, EngineConfig, EventData, EventLog, InMemoryLog,
    MemoryCheckpointStore, NackAction, Operation, Position, Principal, ReplayOutcome,
    RetryPolicy, RoleAuthorizer, StatsOutcome, StatsScope, SubscriptionConfig, SubscriptionError, SubscriptionKey,
    SubscriptionRegistry, SubscriptionStatus, UpdateOutcome,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn manual_registry(log: Arc<InMemoryLog>) -> SubscriptionRegistry {
    SubscriptionRegistry::new(
        log,
        Arc::new(MemoryCheckpointStore::new()),
        Arc::new(AllowAll),
        EngineConfig::manual(),
    )
}

fn admin() -> Principal {
    Principal::new("admin").with_roles(vec!["$admins".into()])
}

fn key() -> SubscriptionKey {
    SubscriptionKey::new("orders", "billing")
}

// --- Management Outcomes ---

#[test]
fn test_create_duplicate() {
    let registry = manual_registry(Arc::new(InMemoryLog::new()));
    registry.create(key(), SubscriptionConfig::default(), &admin());
    assert_eq!(
        registry.create(key(), SubscriptionConfig::default(), &admin()),
        CreateOutcome::AlreadyExists
    );
}

#[test]
fn test_keys_are_case_sensitive() {
    let registry = manual_registry(Arc::new(InMemoryLog::new()));
    registry.create(key(), SubscriptionConfig::default(), &admin());
    assert!(matches!(
        registry.create(
            SubscriptionKey::new("orders", "Billing"),
            SubscriptionConfig::default(),
            &admin()
        ),
        CreateOutcome::Success { .. }
    ));
}

#[test]
fn test_unknown_key() {
    let registry = manual_registry(Arc::new(InMemoryLog::new()));
    assert_eq!(
        registry.update(&key(), SubscriptionConfig::default(), &admin()),
        UpdateOutcome::DoesNotExist
    );
    assert_eq!(registry.delete(&key(), &admin()), DeleteOutcome::DoesNotExist);
    assert_eq!(
        registry.replay_parked(&key(), &admin()),
        ReplayOutcome::DoesNotExist
    );
    assert_eq!(
        registry.stats(&StatsScope::Subscription(key()), &admin()),
        StatsOutcome::NotFound
    );
    assert_eq!(registry.ack(&key(), &[]), AckOutcome::DoesNotExist);
    assert_eq!(
        registry.nack(&key(), &[], NackAction::Skip),
        AckOutcome::DoesNotExist
    );
}

#[test]
fn test_invalid_config_rejected() {
    let registry = manual_registry(Arc::new(InMemoryLog::new()));
    let config = SubscriptionConfig {
        buffer_size: 0,
        ..Default::default()
    };
    assert!(matches!(
        registry.create(key(), config.clone(), &admin()),
        CreateOutcome::InvalidArgument(_)
    ));
    assert_eq!(registry.subscription_count(), 0);

    registry.create(key(), SubscriptionConfig::default(), &admin());
    assert!(matches!(
        registry.update(&key(), config, &admin()),
        UpdateOutcome::InvalidArgument(_)
    ));
}

#[test]
fn test_config_from_bad_json() {
    let err = SubscriptionConfig::from_json(br#"{"bufferSize": "lots"}"#).unwrap_err();
    assert!(matches!(err, SubscriptionError::InvalidArgument(_)));
}

#[test]
fn test_recreate_after_delete_starts_fresh() {
    let log = Arc::new(InMemoryLog::new());
    log.append("orders", vec![EventData::raw("e", vec![])])
        .unwrap();
    let registry = manual_registry(log);
    registry.create(key(), SubscriptionConfig::default(), &admin());
    let consumer = registry
        .attach(&key(), ConnectionRequest::new("u", "a", 1), &admin())
        .unwrap();
    let delivery = consumer.recv().unwrap();
    registry.ack(&key(), &[delivery.event.event_id()]);

    assert_eq!(registry.delete(&key(), &admin()), DeleteOutcome::Success);
    assert!(consumer.recv().is_err());

    registry.create(key(), SubscriptionConfig::default(), &admin());
    let again = registry
        .attach(&key(), ConnectionRequest::new("u", "a", 1), &admin())
        .unwrap();
    assert_eq!(again.recv().unwrap().event.position().0, 0);
}

// --- Authorization ---

#[test]
fn test_access_denied() {
    let registry = SubscriptionRegistry::new(
        Arc::new(InMemoryLog::new()),
        Arc::new(MemoryCheckpointStore::new()),
        Arc::new(RoleAuthorizer::new("$admins")),
        EngineConfig::manual(),
    );
    let guest = Principal::new("guest");

    assert_eq!(
        registry.create(key(), SubscriptionConfig::default(), &guest),
        CreateOutcome::AccessDenied
    );
    registry.create(key(), SubscriptionConfig::default(), &admin());
    assert_eq!(
        registry.update(&key(), SubscriptionConfig::default(), &guest),
        UpdateOutcome::AccessDenied
    );
    assert_eq!(registry.delete(&key(), &guest), DeleteOutcome::AccessDenied);
    assert_eq!(
        registry.replay_parked(&key(), &guest),
        ReplayOutcome::AccessDenied
    );
    assert_eq!(registry.subscription_count(), 1);
}

struct DenyStream(&'static str);

impl Authorizer for DenyStream {
    fn check(&self, _: &Principal, _: Operation, target: Option<&str>) -> Access {
        if target == Some(self.0) {
            Access::Denied
        } else {
            Access::Allowed
        }
    }
}

#[test]
fn test_attach_denied_is_error() {
    let registry = SubscriptionRegistry::new(
        Arc::new(InMemoryLog::new()),
        Arc::new(MemoryCheckpointStore::new()),
        Arc::new(DenyStream("secrets")),
        EngineConfig::manual(),
    );
    let err = registry
        .attach(
            &SubscriptionKey::new("secrets", "g"),
            ConnectionRequest::new("u", "a", 1),
            &admin(),
        )
        .unwrap_err();
    assert!(matches!(err, SubscriptionError::AccessDenied { .. }));

    let err = registry
        .attach(&key(), ConnectionRequest::new("u", "a", 1), &admin())
        .unwrap_err();
    assert!(matches!(err, SubscriptionError::NotFound(_)));
    assert_eq!(
        registry.stats(&StatsScope::Stream("secrets".into()), &admin()),
        StatsOutcome::AccessDenied
    );
}

// --- Collaborator Failures ---

#[test]
fn test_log_failure_reports_unavailable() {
    let log = Arc::new(InMemoryLog::new());
    log.append("orders", vec![EventData::raw("e", vec![])])
        .unwrap();
    log.fail_next_reads(1);
    let registry = manual_registry(log);
    registry.create(key(), SubscriptionConfig::default(), &admin());

    let stats = registry
        .stats(&StatsScope::Subscription(key()), &admin())
        .into_stats()
        .unwrap();
    assert_eq!(stats[0].status, SubscriptionStatus::Unavailable);

    registry.tick();
    let stats = registry
        .stats(&StatsScope::Subscription(key()), &admin())
        .into_stats()
        .unwrap();
    assert_eq!(stats[0].status, SubscriptionStatus::CatchingUp);
    assert_eq!(stats[0].read_buffer_count, 1);
}

#[test]
fn test_failed_park_keeps_message() {
    let log = Arc::new(InMemoryLog::new());
    log.append("orders", vec![EventData::raw("e", vec![])])
        .unwrap();
    let registry = manual_registry(log.clone());
    registry.create(key(), SubscriptionConfig::default(), &admin());
    let consumer = registry
        .attach(&key(), ConnectionRequest::new("u", "a", 1), &admin())
        .unwrap();
    let delivery = consumer.recv().unwrap();

    log.fail_next_appends(1);
    registry.nack(&key(), &[delivery.event.event_id()], NackAction::Park);

    let again = consumer.try_recv().unwrap();
    assert_eq!(again.event.event_id(), delivery.event.event_id());
    assert_eq!(log.stream_len(&key().parked_stream()), 0);
}

/// Checkpoint store that can be switched into failing.
#[derive(Default)]
struct FlakyCheckpoints {
    inner: MemoryCheckpointStore,
    failing: AtomicBool,
}

impl CheckpointStore for FlakyCheckpoints {
    fn load(&self, key: &SubscriptionKey) -> persub::Result<Option<Checkpoint>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SubscriptionError::Io(std::io::Error::other("disk gone")));
        }
        self.inner.load(key)
    }

    fn persist(&self, key: &SubscriptionKey, checkpoint: Checkpoint) -> persub::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SubscriptionError::Io(std::io::Error::other("disk gone")));
        }
        self.inner.persist(key, checkpoint)
    }

    fn remove(&self, key: &SubscriptionKey) -> persub::Result<()> {
        self.inner.remove(key)
    }
}

#[test]
fn test_checkpoint_failure_keeps_delivering() {
    let log = Arc::new(InMemoryLog::new());
    log.append(
        "orders",
        (0..4).map(|_| EventData::raw("e", vec![])).collect(),
    )
    .unwrap();
    let checkpoints = Arc::new(FlakyCheckpoints::default());
    checkpoints.failing.store(true, Ordering::SeqCst);
    let registry = SubscriptionRegistry::new(
        log,
        checkpoints.clone(),
        Arc::new(AllowAll),
        EngineConfig::manual(),
    );
    let config = SubscriptionConfig {
        min_check_point_count: 1,
        ..Default::default()
    };
    registry.create(key(), config, &admin());

    // Initialization cannot load the checkpoint yet.
    assert_eq!(
        registry.stats(&StatsScope::Subscription(key()), &admin()),
        StatsOutcome::NotReady
    );
    assert!(matches!(
        registry.replay_parked(&key(), &admin()),
        ReplayOutcome::Unavailable(_)
    ));

    checkpoints.failing.store(false, Ordering::SeqCst);
    registry.tick();
    let consumer = registry
        .attach(&key(), ConnectionRequest::new("u", "a", 10), &admin())
        .unwrap();
    let deliveries = consumer.drain();
    assert_eq!(deliveries.len(), 4);

    checkpoints.failing.store(true, Ordering::SeqCst);
    registry.ack(&key(), &[deliveries[0].event.event_id()]);
    assert!(checkpoints.inner.load(&key()).unwrap().is_none());

    checkpoints.failing.store(false, Ordering::SeqCst);
    registry.ack(&key(), &[deliveries[1].event.event_id()]);
    assert_eq!(
        checkpoints.inner.load(&key()).unwrap().unwrap().position.0,
        1
    );
}

#[test]
fn test_read_backoff_does_not_block_callers() {
    let log = Arc::new(InMemoryLog::new());
    log.append("orders", vec![EventData::raw("e", vec![])])
        .unwrap();
    log.fail_next_reads(2);
    let registry = SubscriptionRegistry::new(
        log,
        Arc::new(MemoryCheckpointStore::new()),
        Arc::new(AllowAll),
        EngineConfig {
            read_retry: RetryPolicy {
                attempts: 2,
                initial_backoff: Duration::from_secs(10),
                max_backoff: Duration::from_secs(60),
            },
            ..EngineConfig::manual()
        },
    );
    let base = Instant::now();
    registry.create(key(), SubscriptionConfig::default(), &admin());

    registry.tick_at(base + Duration::from_secs(11));
    let status = |registry: &SubscriptionRegistry| {
        registry
            .stats(&StatsScope::Subscription(key()), &admin())
            .into_stats()
            .unwrap()[0]
            .status
    };
    assert_eq!(status(&registry), SubscriptionStatus::Unavailable);
    // The delays are waited out by later ticks, not by sleeping.
    assert!(base.elapsed() < Duration::from_secs(5));

    registry.tick_at(base + Duration::from_secs(40));
    assert_eq!(status(&registry), SubscriptionStatus::CatchingUp);
}

// --- Concurrent Management ---

#[test]
fn test_concurrent_create_admits_one() {
    let registry = manual_registry(Arc::new(InMemoryLog::new()));

    let outcomes: Vec<CreateOutcome> = thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| s.spawn(|| registry.create(key(), SubscriptionConfig::default(), &admin())))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let created = outcomes
        .iter()
        .filter(|o| matches!(o, CreateOutcome::Success { .. }))
        .count();
    assert_eq!(created, 1);
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == CreateOutcome::AlreadyExists)
            .count(),
        7
    );
    assert_eq!(registry.subscription_count(), 1);
}

#[test]
fn test_create_racing_delete_never_resumes_old_checkpoint() {
    let log = Arc::new(InMemoryLog::new());
    log.append(
        "orders",
        (0..10).map(|_| EventData::raw("e", vec![])).collect(),
    )
    .unwrap();
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let registry = SubscriptionRegistry::new(
        log,
        checkpoints.clone(),
        Arc::new(AllowAll),
        EngineConfig::manual(),
    );

    for _ in 0..50 {
        registry.create(key(), SubscriptionConfig::default(), &admin());
        checkpoints.persist(&key(), Checkpoint::at(Position(7))).unwrap();

        let (deleted, created) = thread::scope(|s| {
            let delete = s.spawn(|| registry.delete(&key(), &admin()));
            let create =
                s.spawn(|| registry.create(key(), SubscriptionConfig::default(), &admin()));
            (delete.join().unwrap(), create.join().unwrap())
        });
        assert_eq!(deleted, DeleteOutcome::Success);

        if let StatsOutcome::Success(stats) =
            registry.stats(&StatsScope::Subscription(key()), &admin())
        {
            assert!(matches!(created, CreateOutcome::Success { .. }));
            assert_eq!(stats[0].last_checkpointed_event_number, None);
            assert_eq!(stats[0].read_buffer_count, 10);
        }
        registry.delete(&key(), &admin());
    }
    assert_eq!(registry.subscription_count(), 0);
}
