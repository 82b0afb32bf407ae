//! Composite provisioning
//!
//! [`CompositeProvisioner`] drives the leaf pipeline for one service
//! record: create walks the plan in order and rolls back on failure, delete
//! tears down in reverse, update takes the narrow path (new task template,
//! repointed service), and replace is delete followed by create.
//!
//! Every provider call goes through the retry executor, and the provider
//! identifier of each created leaf is written back to the record store
//! before the next step runs. A crash mid-pipeline therefore leaves a
//! record whose `provider_ids` tell the next pass exactly which leaves
//! already exist.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use veld_provider::{
    CircuitBreakerSet, LeafClient, LeafKind, LeafPayload, ProviderDirectory, ProviderError,
    ResourceNamer, RetryExecutor,
};

use crate::error::{EngineError, EngineResult, ProvisionError};
use crate::plan::{ProvisionedLeaves, ProvisioningPlan};
use crate::record::ServiceRecord;
use crate::rollback::{RollbackCoordinator, RollbackLedger, RollbackReport};
use crate::store::RecordStore;

/// Cooperative cancellation handle.
///
/// Cancelling does not interrupt the step in flight; the pipeline checks
/// the flag between steps and unwinds what it has created so far.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Creates, updates, and tears down the leaves backing service records.
pub struct CompositeProvisioner {
    directory: Arc<dyn ProviderDirectory>,
    store: Arc<dyn RecordStore>,
    namer: ResourceNamer,
    retry: RetryExecutor,
    breakers: Arc<CircuitBreakerSet>,
    cancel: CancelFlag,
}

impl CompositeProvisioner {
    pub fn new(
        directory: Arc<dyn ProviderDirectory>,
        store: Arc<dyn RecordStore>,
        namer: ResourceNamer,
        retry: RetryExecutor,
        breakers: Arc<CircuitBreakerSet>,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            directory,
            store,
            namer,
            retry,
            breakers,
            cancel,
        }
    }

    fn client(&self, kind: LeafKind) -> EngineResult<Arc<dyn LeafClient>> {
        self.directory
            .client(kind)
            .ok_or(EngineError::UnsupportedLeafKind { kind })
    }

    async fn create_leaf(
        &self,
        client: &Arc<dyn LeafClient>,
        payload: &LeafPayload,
    ) -> Result<veld_provider::ObservedLeaf, ProviderError> {
        self.retry
            .execute_with_circuit_breaker(self.breakers.breaker(payload.kind()), || {
                client.create(payload)
            })
            .await
    }

    /// Provisions every leaf for a record, in dependency order.
    ///
    /// On any step failure the leaves created so far are rolled back in
    /// reverse, and the returned error carries both the step failure and
    /// the rollback outcome. The record written back to the store keeps the
    /// identifiers of leaves the rollback could not delete.
    pub async fn create(&self, record: &ServiceRecord) -> EngineResult<ServiceRecord> {
        let plan = ProvisioningPlan::for_record(record, &self.namer);
        let mut done = ProvisionedLeaves::new();
        let mut ledger = RollbackLedger::new();
        let mut updated = record.clone();

        info!(
            app_name = %record.app_name,
            steps = plan.steps().len(),
            "Provisioning composite"
        );

        for step in plan.steps().iter().copied() {
            if self.cancel.is_cancelled() {
                warn!(app_name = %record.app_name, step = %step, "Cancelled before step, rolling back");
                self.abort(&ledger, &mut updated).await;
                return Err(EngineError::Cancelled);
            }

            let client = match self.client(step) {
                Ok(client) => client,
                Err(err) => {
                    self.abort(&ledger, &mut updated).await;
                    return Err(err);
                }
            };

            let payload = match plan.payload_for(step, &done) {
                Ok(payload) => payload,
                Err(err) => {
                    self.abort(&ledger, &mut updated).await;
                    return Err(err.into());
                }
            };

            match self.create_leaf(&client, &payload).await {
                Ok(observed) => {
                    info!(
                        app_name = %record.app_name,
                        step = %step,
                        provider_id = %observed.provider_id,
                        "Leaf created"
                    );
                    ledger.push(step, observed.provider_id.clone());
                    updated
                        .provider_ids
                        .insert(step, observed.provider_id.clone());
                    done.insert(&observed);
                    if step == LeafKind::LoadBalancer {
                        updated.load_balancer_dns = done.load_balancer_dns().map(String::from);
                    }
                    self.store.upsert(&updated).await?;
                }
                Err(source) => {
                    warn!(
                        app_name = %record.app_name,
                        step = %step,
                        error = %source,
                        "Step failed, rolling back"
                    );
                    let rollback = self.unwind(&ledger, &mut updated).await;
                    return Err(ProvisionError {
                        step,
                        source,
                        rollback,
                    }
                    .into());
                }
            }
        }

        Ok(updated)
    }

    /// Rolls back the ledger and reconciles the record's stored identifiers
    /// with what actually got deleted.
    /// Never fails: the caller is already holding the primary error, and a
    /// bookkeeping failure here must not displace it.
    async fn unwind(&self, ledger: &RollbackLedger, record: &mut ServiceRecord) -> RollbackReport {
        let coordinator = RollbackCoordinator::new(Arc::clone(&self.directory), self.retry.clone());
        let report = coordinator.unwind(ledger).await;

        // Identifiers of leaves the rollback could not delete stay on the
        // record so the next pass can see and retry them.
        let leaked: Vec<LeafKind> = report.failures.iter().map(|f| f.kind).collect();
        record.provider_ids.retain(|kind, _| leaked.contains(kind));
        record.load_balancer_dns = None;
        if let Err(error) = self.store.upsert(record).await {
            warn!(
                app_name = %record.app_name,
                error = %error,
                "Could not persist rollback outcome"
            );
        }
        report
    }

    async fn abort(&self, ledger: &RollbackLedger, record: &mut ServiceRecord) {
        let report = self.unwind(ledger, record).await;
        if !report.fully_unwound() {
            warn!(app_name = %record.app_name, report = %report, "Rollback left resources behind");
        }
    }

    /// Tears down every live leaf of a composite, in reverse dependency
    /// order. Best-effort: failures are reported, not fatal.
    pub async fn delete(&self, record: &ServiceRecord) -> EngineResult<RollbackReport> {
        let mut ledger = RollbackLedger::new();
        // BTreeMap iteration follows the dependency order of the kinds, so
        // pushing in map order reproduces creation order.
        for (kind, provider_id) in &record.provider_ids {
            ledger.push(*kind, provider_id.clone());
        }

        info!(
            app_name = %record.app_name,
            leaves = ledger.len(),
            "Tearing down composite"
        );

        let coordinator = RollbackCoordinator::new(Arc::clone(&self.directory), self.retry.clone());
        Ok(coordinator.unwind(&ledger).await)
    }

    /// Seeds plan references from a live record, fetching the managed
    /// repository's pull URI when the image comes from one.
    async fn seed_references(&self, live: &ServiceRecord) -> EngineResult<ProvisionedLeaves> {
        let mut done = ProvisionedLeaves::new();
        for (kind, provider_id) in &live.provider_ids {
            done.insert_id(*kind, provider_id.clone());
        }

        if live.needs_image_repository() {
            if let Some(repo_id) = live.provider_id(LeafKind::ImageRepository) {
                let client = self.client(LeafKind::ImageRepository)?;
                let observed = self
                    .retry
                    .execute_with_circuit_breaker(
                        self.breakers.breaker(LeafKind::ImageRepository),
                        || client.read(repo_id),
                    )
                    .await?
                    .ok_or_else(|| ProviderError::not_found(repo_id.to_string()))?;
                done.insert(&observed);
            }
        }

        Ok(done)
    }

    /// Applies an in-place change: registers a new task template rendered
    /// from the desired record and repoints the running service at it. No
    /// other leaf is touched.
    pub async fn update(
        &self,
        desired: &ServiceRecord,
        observed: &ServiceRecord,
    ) -> EngineResult<ServiceRecord> {
        let service_id = observed
            .provider_id(LeafKind::Service)
            .cloned()
            .ok_or_else(|| ProviderError::not_found(format!("service leaf of {}", observed.app_name)))?;

        let mut updated = desired.clone();
        updated.provider_ids = observed.provider_ids.clone();
        updated.load_balancer_dns = observed.load_balancer_dns.clone();

        let mut done = self.seed_references(observed).await?;
        let plan = ProvisioningPlan::for_record(&updated, &self.namer);

        let template_client = self.client(LeafKind::TaskTemplate)?;
        let template_payload = plan.payload_for(LeafKind::TaskTemplate, &done)?;
        let new_template = self.create_leaf(&template_client, &template_payload).await?;

        info!(
            app_name = %desired.app_name,
            template_id = %new_template.provider_id,
            "Registered new task template"
        );

        done.insert(&new_template);

        let service_client = self.client(LeafKind::Service)?;
        let service_payload = plan.payload_for(LeafKind::Service, &done)?;
        self.retry
            .execute_with_circuit_breaker(self.breakers.breaker(LeafKind::Service), || {
                service_client.update(&service_id, &service_payload)
            })
            .await?;

        updated
            .provider_ids
            .insert(LeafKind::TaskTemplate, new_template.provider_id.clone());

        // The service no longer references the old template; deregister it
        // so the composite keeps exactly one. Best-effort: a failure here
        // leaves an orphaned template, not a broken service.
        if let Some(old_id) = observed.provider_id(LeafKind::TaskTemplate) {
            if *old_id != new_template.provider_id {
                match self
                    .retry
                    .execute_with_circuit_breaker(
                        self.breakers.breaker(LeafKind::TaskTemplate),
                        || template_client.delete(old_id),
                    )
                    .await
                {
                    Ok(()) | Err(ProviderError::NotFound { .. }) => {}
                    Err(error) => {
                        warn!(
                            app_name = %desired.app_name,
                            template_id = %old_id,
                            error = %error,
                            "Could not deregister old task template"
                        );
                    }
                }
            }
        }

        self.store.upsert(&updated).await?;
        Ok(updated)
    }

    /// Destroys the live composite and provisions a fresh one from the
    /// desired record. The teardown must complete cleanly before anything
    /// new is created; otherwise the pass fails and a later pass retries.
    pub async fn replace(
        &self,
        desired: &ServiceRecord,
        observed: &ServiceRecord,
    ) -> EngineResult<ServiceRecord> {
        let report = self.delete(observed).await?;
        if !report.fully_unwound() {
            return Err(ProviderError::operation_failed(format!(
                "teardown before recreate incomplete: {report}"
            ))
            .into());
        }

        let mut fresh = desired.clone();
        fresh.provider_ids.clear();
        fresh.load_balancer_dns = None;
        self.store.upsert(&fresh).await?;
        self.create(&fresh).await
    }
}
