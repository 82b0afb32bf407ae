//! Reconciliation passes
//!
//! A pass fetches the desired set from the store, rebuilds the observed set
//! from the provider, diffs the two, and converges every diverging record:
//! creates for records with no live composite, teardowns for live
//! composites with no record, in-place updates or full replacements for
//! pairs that disagree. Independent composites converge concurrently up to
//! a configured limit; the leaves of one composite are always sequential.
//!
//! [`Reconciler::plan`] runs the same read-and-diff without touching the
//! provider, for dry runs.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use veld_core::{diff_records, DiffAction, PassId, UpdateKind};
use veld_provider::{
    CircuitBreakerConfig, CircuitBreakerSet, LeafKind, ProviderDirectory, ResourceNamer,
    RetryConfig, RetryExecutor,
};

use crate::error::{EngineError, EngineResult};
use crate::provisioner::{CancelFlag, CompositeProvisioner};
use crate::record::{ServiceMapper, ServiceRecord};
use crate::recognizer::CompositeRecognizer;
use crate::registry::ModuleRegistry;
use crate::store::RecordStore;

/// Reconciler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// How many composites may converge at the same time.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Prefix marking provider resources as engine-managed.
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
}

fn default_max_concurrent() -> usize {
    4
}

fn default_name_prefix() -> String {
    veld_provider::naming::DEFAULT_NAME_PREFIX.to_string()
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            name_prefix: default_name_prefix(),
        }
    }
}

/// One intended convergence action, as reported by a dry run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedAction {
    pub app_name: String,
    pub action: DiffAction,
}

/// Outcome of [`Reconciler::plan`]: what a pass would do, without doing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassPlan {
    pub pass_id: PassId,
    pub actions: Vec<PlannedAction>,
    /// Records already converged.
    pub in_sync: usize,
}

impl PassPlan {
    /// True when a pass would change nothing.
    pub fn is_converged(&self) -> bool {
        self.actions.is_empty()
    }
}

/// One record that failed to converge during a pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassFailure {
    pub app_name: String,
    pub action: DiffAction,
    pub error: String,
}

/// Outcome of one executed pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PassReport {
    pub pass_id: PassId,
    pub created: usize,
    pub deleted: usize,
    pub updated: usize,
    pub replaced: usize,
    pub in_sync: usize,
    pub failures: Vec<PassFailure>,
    /// Whether the pass stopped early because of cancellation.
    pub cancelled: bool,
}

impl PassReport {
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }
}

enum PassTask {
    Create(ServiceRecord),
    Delete(ServiceRecord),
    Update {
        desired: ServiceRecord,
        observed: ServiceRecord,
    },
    Replace {
        desired: ServiceRecord,
        observed: ServiceRecord,
    },
}

impl PassTask {
    fn action(&self) -> DiffAction {
        match self {
            PassTask::Create(_) => DiffAction::Create,
            PassTask::Delete(_) => DiffAction::Delete,
            PassTask::Update { .. } => DiffAction::Update,
            PassTask::Replace { .. } => DiffAction::Replace,
        }
    }

    fn app_name(&self) -> &str {
        match self {
            PassTask::Create(r) | PassTask::Delete(r) => &r.app_name,
            PassTask::Update { desired, .. } | PassTask::Replace { desired, .. } => {
                &desired.app_name
            }
        }
    }
}

/// Drives reconciliation passes over one store and one provider.
pub struct Reconciler {
    store: Arc<dyn RecordStore>,
    recognizer: CompositeRecognizer,
    provisioner: Arc<CompositeProvisioner>,
    config: ReconcilerConfig,
    cancel: CancelFlag,
    module_order: Vec<String>,
}

impl Reconciler {
    /// Handle to cancel running and future passes.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Module initialization order resolved when the engine was built.
    pub fn module_order(&self) -> &[String] {
        &self.module_order
    }

    async fn diff(&self) -> EngineResult<veld_core::RecordDiff<ServiceRecord>> {
        let desired = self.store.list().await?;
        let observed = self.recognizer.observe().await?;
        Ok(diff_records(&ServiceMapper, &desired, &observed))
    }

    /// Computes what a pass would do without executing any of it.
    pub async fn plan(&self) -> EngineResult<PassPlan> {
        let pass_id = PassId::new();
        let diff = self.diff().await?;

        let mut actions = Vec::new();
        for record in &diff.only_desired {
            actions.push(PlannedAction {
                app_name: record.app_name.clone(),
                action: DiffAction::Create,
            });
        }
        for record in &diff.only_observed {
            actions.push(PlannedAction {
                app_name: record.app_name.clone(),
                action: DiffAction::Delete,
            });
        }
        for pair in &diff.changed {
            actions.push(PlannedAction {
                app_name: pair.desired.app_name.clone(),
                action: match pair.kind {
                    UpdateKind::Update => DiffAction::Update,
                    UpdateKind::Replace => DiffAction::Replace,
                },
            });
        }
        actions.sort_by(|a, b| a.app_name.cmp(&b.app_name));

        info!(
            pass_id = %pass_id,
            actions = actions.len(),
            in_sync = diff.in_sync,
            "Pass planned"
        );
        Ok(PassPlan {
            pass_id,
            actions,
            in_sync: diff.in_sync,
        })
    }

    /// Runs one full reconciliation pass.
    pub async fn run_pass(&self) -> EngineResult<PassReport> {
        let pass_id = PassId::new();
        let diff = self.diff().await?;

        let mut tasks = Vec::new();
        for record in diff.only_desired {
            tasks.push(PassTask::Create(record));
        }
        for record in diff.only_observed {
            tasks.push(PassTask::Delete(record));
        }
        for pair in diff.changed {
            tasks.push(match pair.kind {
                UpdateKind::Update => PassTask::Update {
                    desired: pair.desired,
                    observed: pair.observed,
                },
                UpdateKind::Replace => PassTask::Replace {
                    desired: pair.desired,
                    observed: pair.observed,
                },
            });
        }
        tasks.sort_by(|a, b| a.app_name().cmp(b.app_name()));

        info!(
            pass_id = %pass_id,
            tasks = tasks.len(),
            in_sync = diff.in_sync,
            max_concurrent = self.config.max_concurrent,
            "Pass starting"
        );

        let mut report = PassReport {
            pass_id,
            in_sync: diff.in_sync,
            ..Default::default()
        };

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut join_set = JoinSet::new();

        for task in tasks {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let semaphore = Arc::clone(&semaphore);
            let provisioner = Arc::clone(&self.provisioner);
            let app_name = task.app_name().to_string();
            let action = task.action();

            join_set.spawn(async move {
                let permit = semaphore.acquire_owned().await;
                let result = match permit {
                    Ok(_permit) => Self::execute_task(&provisioner, task).await,
                    Err(_) => Err(EngineError::Cancelled),
                };
                (app_name, action, result)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            let (app_name, action, result) = match joined {
                Ok(outcome) => outcome,
                Err(join_error) => {
                    warn!(pass_id = %pass_id, error = %join_error, "Pass task panicked");
                    report.failures.push(PassFailure {
                        app_name: String::new(),
                        action: DiffAction::NoOp,
                        error: join_error.to_string(),
                    });
                    continue;
                }
            };

            match result {
                Ok(()) => match action {
                    DiffAction::Create => report.created += 1,
                    DiffAction::Delete => report.deleted += 1,
                    DiffAction::Update => report.updated += 1,
                    DiffAction::Replace => report.replaced += 1,
                    DiffAction::NoOp => {}
                },
                Err(error) => {
                    warn!(
                        pass_id = %pass_id,
                        app_name = %app_name,
                        action = ?action,
                        error = %error,
                        "Record failed to converge"
                    );
                    report.failures.push(PassFailure {
                        app_name,
                        action,
                        error: error.to_string(),
                    });
                }
            }
        }

        info!(
            pass_id = %pass_id,
            created = report.created,
            deleted = report.deleted,
            updated = report.updated,
            replaced = report.replaced,
            failed = report.failures.len(),
            cancelled = report.cancelled,
            "Pass finished"
        );
        Ok(report)
    }

    async fn execute_task(
        provisioner: &CompositeProvisioner,
        task: PassTask,
    ) -> EngineResult<()> {
        match task {
            PassTask::Create(mut record) => {
                // A record with known identifiers but no recognized live
                // composite is debris from an interrupted run. Clear it out
                // before building fresh.
                if !record.provider_ids.is_empty() {
                    let report = provisioner.delete(&record).await?;
                    if !report.fully_unwound() {
                        return Err(veld_provider::ProviderError::operation_failed(format!(
                            "cleanup of interrupted composite incomplete: {report}"
                        ))
                        .into());
                    }
                    record.provider_ids.clear();
                    record.load_balancer_dns = None;
                }
                provisioner.create(&record).await?;
                Ok(())
            }
            PassTask::Delete(record) => {
                let report = provisioner.delete(&record).await?;
                // An image repository that refuses deletion (it still holds
                // images) does not block removing the composite.
                let blocking: Vec<_> = report
                    .failures
                    .iter()
                    .filter(|f| f.kind != LeafKind::ImageRepository)
                    .collect();
                if blocking.is_empty() {
                    Ok(())
                } else {
                    Err(veld_provider::ProviderError::operation_failed(format!(
                        "teardown incomplete: {report}"
                    ))
                    .into())
                }
            }
            PassTask::Update { desired, observed } => {
                provisioner.update(&desired, &observed).await?;
                Ok(())
            }
            PassTask::Replace { desired, observed } => {
                provisioner.replace(&desired, &observed).await?;
                Ok(())
            }
        }
    }
}

/// Composition root for the engine.
///
/// Wires the store, provider directory, module registry, recognizer, and
/// provisioner into a [`Reconciler`]. Everything the engine touches enters
/// through here; there is no global state.
#[derive(Default)]
pub struct EngineBuilder {
    directory: Option<Arc<dyn ProviderDirectory>>,
    store: Option<Arc<dyn RecordStore>>,
    config: ReconcilerConfig,
    retry: RetryConfig,
    breaker: CircuitBreakerConfig,
    modules: ModuleRegistry,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn directory(mut self, directory: Arc<dyn ProviderDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn circuit_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    /// Replaces the module registry. When none is supplied, the built-in
    /// managed-service module is registered on its own.
    pub fn modules(mut self, modules: ModuleRegistry) -> Self {
        self.modules = modules;
        self
    }

    pub fn build(self) -> EngineResult<Reconciler> {
        let directory = self
            .directory
            .ok_or(EngineError::BuilderIncomplete {
                component: "provider directory",
            })?;
        let store = self.store.ok_or(EngineError::BuilderIncomplete {
            component: "record store",
        })?;

        let mut modules = self.modules;
        if modules.is_empty() {
            modules.register("managed-service", vec![], vec!["service-record".to_string()])?;
        }
        let module_order: Vec<String> = modules
            .init_order()?
            .into_iter()
            .map(|descriptor| descriptor.name.clone())
            .collect();
        info!(order = ?module_order, "Engine modules resolved");

        let namer = ResourceNamer::new(self.config.name_prefix.clone());
        let retry = RetryExecutor::new(self.retry);
        let breakers = Arc::new(CircuitBreakerSet::new(self.breaker));
        let cancel = CancelFlag::new();

        let recognizer = CompositeRecognizer::new(
            Arc::clone(&directory),
            namer.clone(),
            retry.clone(),
            Arc::clone(&breakers),
        );
        let provisioner = Arc::new(CompositeProvisioner::new(
            directory,
            Arc::clone(&store),
            namer,
            retry,
            breakers,
            cancel.clone(),
        ));

        Ok(Reconciler {
            store,
            recognizer,
            provisioner,
            config: self.config,
            cancel,
            module_order,
        })
    }
}
