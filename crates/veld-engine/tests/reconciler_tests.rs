//! End-to-end reconciliation tests against an in-memory mock provider.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use veld_engine::{
    CancelFlag, EngineBuilder, EngineError, EngineResult, MemoryRecordStore, Reconciler,
    RecordStore, ServiceRecord, ServiceRecordDraft,
};
use veld_provider::{
    CircuitBreakerConfig, CreateLeaf, DeleteLeaf, LeafClient, LeafKind, LeafPayload, ObservedLeaf,
    ProviderDirectory, ProviderError, ProviderId, ProviderResult, ReadLeaf, RetryConfig,
    UpdateLeaf,
};

/// One call into the mock provider: operation, kind, identifier.
type Call = (&'static str, LeafKind, String);

/// Shared state behind every mock leaf client.
#[derive(Default)]
struct MockState {
    resources: Mutex<HashMap<String, ObservedLeaf>>,
    calls: Mutex<Vec<Call>>,
    fail_create: Mutex<Option<LeafKind>>,
    fail_create_transient: Mutex<Option<LeafKind>>,
    fail_delete: Mutex<Option<LeafKind>>,
    /// Flip the flag once a leaf of this kind has been created.
    cancel_after: Mutex<Option<(LeafKind, CancelFlag)>>,
    next_id: AtomicUsize,
}

impl MockState {
    fn log(&self, op: &'static str, kind: LeafKind, id: impl Into<String>) {
        self.calls.lock().unwrap().push((op, kind, id.into()));
    }

    fn calls_since(&self, mark: usize) -> Vec<Call> {
        self.calls.lock().unwrap()[mark..].to_vec()
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn live_kinds(&self) -> Vec<LeafKind> {
        let mut kinds: Vec<LeafKind> = self
            .resources
            .lock()
            .unwrap()
            .values()
            .map(|o| o.payload.kind())
            .collect();
        kinds.sort();
        kinds
    }

    fn live_payload(&self, kind: LeafKind) -> Option<LeafPayload> {
        self.resources
            .lock()
            .unwrap()
            .values()
            .find(|o| o.payload.kind() == kind)
            .map(|o| o.payload.clone())
    }
}

struct MockClient {
    kind: LeafKind,
    state: Arc<MockState>,
}

#[async_trait]
impl CreateLeaf for MockClient {
    async fn create(&self, payload: &LeafPayload) -> ProviderResult<ObservedLeaf> {
        let name = payload.name().unwrap_or("listener").to_string();
        self.state.log("create", self.kind, name.clone());

        if *self.state.fail_create.lock().unwrap() == Some(self.kind) {
            return Err(ProviderError::operation_failed("injected create failure"));
        }
        if *self.state.fail_create_transient.lock().unwrap() == Some(self.kind) {
            return Err(ProviderError::Unavailable {
                message: "injected outage".into(),
            });
        }

        let id = format!(
            "{}-{}",
            self.kind,
            self.state.next_id.fetch_add(1, Ordering::SeqCst)
        );

        // Fill in the fields only the provider knows.
        let mut payload = payload.clone();
        match &mut payload {
            LeafPayload::LoadBalancer(spec) => {
                spec.dns_name = Some(format!("{name}.lb.test"));
            }
            LeafPayload::ImageRepository(spec) => {
                spec.repository_uri = Some(format!("registry.test/{name}"));
            }
            _ => {}
        }

        let observed = ObservedLeaf {
            provider_id: ProviderId::new(id.clone()),
            payload,
        };
        self.state
            .resources
            .lock()
            .unwrap()
            .insert(id, observed.clone());

        if let Some((kind, flag)) = &*self.state.cancel_after.lock().unwrap() {
            if *kind == self.kind {
                flag.cancel();
            }
        }
        Ok(observed)
    }
}

#[async_trait]
impl ReadLeaf for MockClient {
    async fn read(&self, id: &ProviderId) -> ProviderResult<Option<ObservedLeaf>> {
        Ok(self.state.resources.lock().unwrap().get(id.as_str()).cloned())
    }

    async fn list(&self) -> ProviderResult<Vec<ObservedLeaf>> {
        Ok(self
            .state
            .resources
            .lock()
            .unwrap()
            .values()
            .filter(|o| o.payload.kind() == self.kind)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl UpdateLeaf for MockClient {
    async fn update(&self, id: &ProviderId, payload: &LeafPayload) -> ProviderResult<ObservedLeaf> {
        self.state.log("update", self.kind, id.to_string());
        let mut resources = self.state.resources.lock().unwrap();
        let entry = resources
            .get_mut(id.as_str())
            .ok_or_else(|| ProviderError::not_found(id.to_string()))?;
        entry.payload = payload.clone();
        Ok(entry.clone())
    }
}

#[async_trait]
impl DeleteLeaf for MockClient {
    async fn delete(&self, id: &ProviderId) -> ProviderResult<()> {
        self.state.log("delete", self.kind, id.to_string());
        if *self.state.fail_delete.lock().unwrap() == Some(self.kind) {
            return Err(ProviderError::DependencyViolation {
                message: "injected delete failure".into(),
            });
        }
        self.state
            .resources
            .lock()
            .unwrap()
            .remove(id.as_str())
            .map(|_| ())
            .ok_or_else(|| ProviderError::not_found(id.to_string()))
    }
}

struct MockProvider {
    state: Arc<MockState>,
}

impl ProviderDirectory for MockProvider {
    fn client(&self, kind: LeafKind) -> Option<Arc<dyn LeafClient>> {
        Some(Arc::new(MockClient {
            kind,
            state: Arc::clone(&self.state),
        }))
    }
}

fn record(name: &str, port: u16, replicas: u32) -> ServiceRecord {
    ServiceRecordDraft {
        app_name: name.into(),
        app_port: port,
        desired_count: Some(replicas),
        ..Default::default()
    }
    .build()
    .unwrap()
}

fn setup() -> (Reconciler, Arc<MemoryRecordStore>, Arc<MockState>) {
    let state = Arc::new(MockState::default());
    let store = Arc::new(MemoryRecordStore::new());
    let reconciler = EngineBuilder::new()
        .directory(Arc::new(MockProvider {
            state: Arc::clone(&state),
        }))
        .store(Arc::clone(&store) as Arc<dyn RecordStore>)
        .build()
        .unwrap();
    (reconciler, store, state)
}

fn creates(calls: &[Call]) -> Vec<LeafKind> {
    calls
        .iter()
        .filter(|(op, _, _)| *op == "create")
        .map(|(_, kind, _)| *kind)
        .collect()
}

fn deletes(calls: &[Call]) -> Vec<LeafKind> {
    calls
        .iter()
        .filter(|(op, _, _)| *op == "delete")
        .map(|(_, kind, _)| *kind)
        .collect()
}

#[tokio::test]
async fn test_create_pass_provisions_full_pipeline_in_order() {
    let (reconciler, store, state) = setup();
    store.upsert(&record("orders", 8080, 2)).await.unwrap();

    let report = reconciler.run_pass().await.unwrap();

    assert!(report.succeeded(), "failures: {:?}", report.failures);
    assert_eq!(report.created, 1);
    assert_eq!(creates(&state.calls_since(0)), LeafKind::ALL.to_vec());
    assert_eq!(state.live_kinds(), LeafKind::ALL.to_vec());

    // The service leaf references leaves created earlier in the pipeline.
    match state.live_payload(LeafKind::Service).unwrap() {
        LeafPayload::Service(spec) => {
            assert_eq!(spec.replicas, 2);
            assert_eq!(spec.port, 8080);
            assert!(spec.cluster_id.is_some());
            assert!(spec.task_template_id.is_some());
        }
        other => panic!("unexpected payload {other:?}"),
    }

    // The store record carries every provider identifier and the DNS name.
    let stored = store.get("orders").await.unwrap().unwrap();
    assert_eq!(stored.provider_ids.len(), 11);
    assert_eq!(
        stored.load_balancer_dns.as_deref(),
        Some("veld-ecs-orders-lb.lb.test")
    );
}

#[tokio::test]
async fn test_second_pass_is_idempotent() {
    let (reconciler, store, state) = setup();
    store.upsert(&record("orders", 8080, 2)).await.unwrap();

    reconciler.run_pass().await.unwrap();
    let mark = state.call_count();

    let report = reconciler.run_pass().await.unwrap();

    assert!(report.succeeded());
    assert_eq!(report.created, 0);
    assert_eq!(report.in_sync, 1);
    // Reads only: the second pass must not create, update, or delete.
    assert!(state.calls_since(mark).is_empty());
}

#[tokio::test]
async fn test_failed_step_rolls_back_created_leaves_in_reverse() {
    let (reconciler, store, state) = setup();
    store.upsert(&record("orders", 8080, 1)).await.unwrap();
    *state.fail_create.lock().unwrap() = Some(LeafKind::Cluster);

    let report = reconciler.run_pass().await.unwrap();

    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0]
        .error
        .contains("provisioning failed at cluster"));

    // Everything created before the failure is gone again, deleted in
    // reverse creation order.
    assert!(state.live_kinds().is_empty());
    let calls = state.calls_since(0);
    let mut expected_unwind: Vec<LeafKind> = creates(&calls)
        .into_iter()
        .filter(|k| *k != LeafKind::Cluster)
        .collect();
    expected_unwind.reverse();
    assert_eq!(deletes(&calls), expected_unwind);

    // The record survives with no identifiers so a later pass can retry.
    let stored = store.get("orders").await.unwrap().unwrap();
    assert!(stored.provider_ids.is_empty());
}

#[tokio::test]
async fn test_replica_change_takes_narrow_update_path() {
    let (reconciler, store, state) = setup();
    store.upsert(&record("orders", 8080, 2)).await.unwrap();
    reconciler.run_pass().await.unwrap();

    let mut scaled = store.get("orders").await.unwrap().unwrap();
    scaled.desired_count = 5;
    store.upsert(&scaled).await.unwrap();
    let mark = state.call_count();

    let report = reconciler.run_pass().await.unwrap();

    assert!(report.succeeded(), "failures: {:?}", report.failures);
    assert_eq!(report.updated, 1);

    // One new task template, one service update, one deregistration of
    // the old template; nothing else was touched.
    let calls = state.calls_since(mark);
    assert_eq!(creates(&calls), vec![LeafKind::TaskTemplate]);
    let writes: Vec<&Call> = calls.iter().filter(|(op, _, _)| *op != "create").collect();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0].0, "update");
    assert_eq!(writes[0].1, LeafKind::Service);
    assert_eq!(writes[1].0, "delete");
    assert_eq!(writes[1].1, LeafKind::TaskTemplate);

    match state.live_payload(LeafKind::Service).unwrap() {
        LeafPayload::Service(spec) => assert_eq!(spec.replicas, 5),
        other => panic!("unexpected payload {other:?}"),
    }
}

#[tokio::test]
async fn test_port_change_replaces_composite() {
    let (reconciler, store, state) = setup();
    store.upsert(&record("orders", 8080, 1)).await.unwrap();
    reconciler.run_pass().await.unwrap();
    let old_ids: Vec<String> = state
        .resources
        .lock()
        .unwrap()
        .keys()
        .cloned()
        .collect();
    let mark = state.call_count();

    let mut moved = store.get("orders").await.unwrap().unwrap();
    moved.app_port = 9090;
    store.upsert(&moved).await.unwrap();

    let report = reconciler.run_pass().await.unwrap();

    assert!(report.succeeded(), "failures: {:?}", report.failures);
    assert_eq!(report.replaced, 1);

    // Old composite torn down, fresh one built end to end.
    let calls = state.calls_since(mark);
    assert_eq!(deletes(&calls).len(), 11);
    assert_eq!(creates(&calls), LeafKind::ALL.to_vec());
    for id in old_ids {
        assert!(!state.resources.lock().unwrap().contains_key(&id));
    }
    match state.live_payload(LeafKind::Service).unwrap() {
        LeafPayload::Service(spec) => assert_eq!(spec.port, 9090),
        other => panic!("unexpected payload {other:?}"),
    }
}

#[tokio::test]
async fn test_removed_record_tears_down_composite() {
    let (reconciler, store, state) = setup();
    store.upsert(&record("orders", 8080, 1)).await.unwrap();
    reconciler.run_pass().await.unwrap();

    store.delete("orders").await.unwrap();
    let report = reconciler.run_pass().await.unwrap();

    assert!(report.succeeded(), "failures: {:?}", report.failures);
    assert_eq!(report.deleted, 1);
    assert!(state.live_kinds().is_empty());
}

#[tokio::test]
async fn test_stuck_image_repository_does_not_block_teardown() {
    let (reconciler, store, state) = setup();
    store.upsert(&record("orders", 8080, 1)).await.unwrap();
    reconciler.run_pass().await.unwrap();

    store.delete("orders").await.unwrap();
    *state.fail_delete.lock().unwrap() = Some(LeafKind::ImageRepository);

    let report = reconciler.run_pass().await.unwrap();

    assert!(report.succeeded(), "failures: {:?}", report.failures);
    assert_eq!(report.deleted, 1);
    // Only the repository is left behind.
    assert_eq!(state.live_kinds(), vec![LeafKind::ImageRepository]);
}

#[tokio::test]
async fn test_plan_is_read_only() {
    let (reconciler, store, state) = setup();
    store.upsert(&record("orders", 8080, 1)).await.unwrap();

    let plan = reconciler.plan().await.unwrap();

    assert_eq!(plan.actions.len(), 1);
    assert_eq!(plan.actions[0].app_name, "orders");
    // No create/update/delete reached the provider.
    assert!(state.calls_since(0).is_empty());
    assert!(state.live_kinds().is_empty());
}

#[tokio::test]
async fn test_cancelled_pass_executes_nothing() {
    let (reconciler, store, state) = setup();
    store.upsert(&record("orders", 8080, 1)).await.unwrap();

    reconciler.cancel_flag().cancel();
    let report = reconciler.run_pass().await.unwrap();

    assert!(report.cancelled);
    assert_eq!(report.created, 0);
    assert!(state.live_kinds().is_empty());
}

#[tokio::test]
async fn test_cancellation_mid_pipeline_rolls_back_composite() {
    let (reconciler, store, state) = setup();
    store.upsert(&record("orders", 8080, 1)).await.unwrap();
    *state.cancel_after.lock().unwrap() = Some((LeafKind::Cluster, reconciler.cancel_flag()));

    let report = reconciler.run_pass().await.unwrap();

    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].error.contains("cancelled"));

    // Every leaf created up to the cancellation point is gone again,
    // deleted in reverse creation order; the pipeline never went past
    // the cluster step.
    assert!(state.live_kinds().is_empty());
    let calls = state.calls_since(0);
    let created = creates(&calls);
    assert!(!created.contains(&LeafKind::TaskTemplate));
    let mut expected_unwind = created;
    expected_unwind.reverse();
    assert_eq!(deletes(&calls), expected_unwind);

    let stored = store.get("orders").await.unwrap().unwrap();
    assert!(stored.provider_ids.is_empty());
}

/// Store wrapper that rejects the write closing out a rollback, which is
/// the only write that carries no provider identifiers after a failure.
struct RollbackWriteFailingStore {
    inner: Arc<MemoryRecordStore>,
}

#[async_trait]
impl RecordStore for RollbackWriteFailingStore {
    async fn list(&self) -> EngineResult<Vec<ServiceRecord>> {
        self.inner.list().await
    }

    async fn get(&self, app_name: &str) -> EngineResult<Option<ServiceRecord>> {
        self.inner.get(app_name).await
    }

    async fn upsert(&self, record: &ServiceRecord) -> EngineResult<()> {
        if record.provider_ids.is_empty() {
            return Err(EngineError::Store(sqlx::Error::PoolClosed));
        }
        self.inner.upsert(record).await
    }

    async fn delete(&self, app_name: &str) -> EngineResult<bool> {
        self.inner.delete(app_name).await
    }
}

#[tokio::test]
async fn test_step_failure_survives_rollback_bookkeeping_failure() {
    let state = Arc::new(MockState::default());
    let inner = Arc::new(MemoryRecordStore::new());
    inner.upsert(&record("orders", 8080, 1)).await.unwrap();
    let reconciler = EngineBuilder::new()
        .directory(Arc::new(MockProvider {
            state: Arc::clone(&state),
        }))
        .store(Arc::new(RollbackWriteFailingStore {
            inner: Arc::clone(&inner),
        }))
        .build()
        .unwrap();
    *state.fail_create.lock().unwrap() = Some(LeafKind::Cluster);

    let report = reconciler.run_pass().await.unwrap();

    // The failing step is what gets reported, not the failed write of
    // the rollback outcome.
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0]
        .error
        .contains("provisioning failed at cluster"));
    assert!(state.live_kinds().is_empty());
}

#[tokio::test]
async fn test_repeated_transient_failures_trip_the_circuit() {
    let state = Arc::new(MockState::default());
    let store = Arc::new(MemoryRecordStore::new());
    let reconciler = EngineBuilder::new()
        .directory(Arc::new(MockProvider {
            state: Arc::clone(&state),
        }))
        .store(Arc::clone(&store) as Arc<dyn RecordStore>)
        .retry(RetryConfig {
            max_retries: 1,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter: false,
        })
        .circuit_breaker(CircuitBreakerConfig {
            failure_threshold: 2,
            open_duration: Duration::from_secs(60),
            success_threshold: 1,
        })
        .build()
        .unwrap();
    store.upsert(&record("orders", 8080, 1)).await.unwrap();
    *state.fail_create_transient.lock().unwrap() = Some(LeafKind::NetworkBoundary);

    // Two attempts (one retry) push the boundary breaker past its
    // threshold.
    let report = reconciler.run_pass().await.unwrap();
    assert_eq!(report.failures.len(), 1);

    // With the circuit open, the next pass is stopped before a single
    // provider mutation is attempted.
    let mark = state.call_count();
    let err = reconciler.run_pass().await.unwrap_err();
    assert!(err.to_string().contains("circuit breaker open"));
    assert!(state.calls_since(mark).is_empty());
}

#[tokio::test]
async fn test_composite_with_foreign_listener_reference_is_rebuilt() {
    let (reconciler, store, state) = setup();
    store.upsert(&record("orders", 8080, 1)).await.unwrap();
    reconciler.run_pass().await.unwrap();

    // Repoint the live listener at a routing target outside the
    // composite. The group is no longer fully owned and must not be
    // adopted as a valid observation.
    for leaf in state.resources.lock().unwrap().values_mut() {
        if let LeafPayload::Listener(spec) = &mut leaf.payload {
            spec.routing_target_id = Some(ProviderId::new("foreign-target"));
        }
    }

    let report = reconciler.run_pass().await.unwrap();

    assert!(report.succeeded(), "failures: {:?}", report.failures);
    assert_eq!(report.in_sync, 0);
    assert_eq!(report.created, 1);

    // The rebuilt listener references the composite's own target again.
    match state.live_payload(LeafKind::Listener).unwrap() {
        LeafPayload::Listener(spec) => {
            assert_ne!(
                spec.routing_target_id,
                Some(ProviderId::new("foreign-target"))
            );
        }
        other => panic!("unexpected payload {other:?}"),
    }
}

#[tokio::test]
async fn test_independent_composites_converge_in_one_pass() {
    let (reconciler, store, state) = setup();
    store.upsert(&record("orders", 8080, 1)).await.unwrap();
    store.upsert(&record("billing", 3000, 2)).await.unwrap();

    let report = reconciler.run_pass().await.unwrap();

    assert!(report.succeeded(), "failures: {:?}", report.failures);
    assert_eq!(report.created, 2);
    // 22 leaves live: one full pipeline per composite.
    assert_eq!(state.resources.lock().unwrap().len(), 22);

    let second = reconciler.run_pass().await.unwrap();
    assert_eq!(second.in_sync, 2);
}
