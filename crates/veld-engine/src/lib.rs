//! Declarative reconciliation engine for composite cloud applications.
//!
//! The engine converges a desired set of [`ServiceRecord`]s against what a
//! provider actually runs. Each record stands for one containerized
//! application backed by a fixed pipeline of leaf resources (network
//! boundary through running service); the engine diffs desired against
//! observed, then creates, updates, replaces, or tears down composites
//! until the two sets agree.
//!
//! # Architecture
//!
//! - [`store`]: where the desired set lives (in-memory or Postgres).
//! - [`recognizer`]: rebuilds observed composites from provider listings
//!   by naming convention, with strict validity checks.
//! - [`plan`] / [`provisioner`]: ordered leaf creation with
//!   forward-referenced identifiers, and compensating rollback on failure.
//! - [`reconciler`]: pass orchestration, diffing, bounded concurrency, and
//!   the [`EngineBuilder`] composition root.

pub mod error;
pub mod plan;
pub mod provisioner;
pub mod recognizer;
pub mod reconciler;
pub mod record;
pub mod registry;
pub mod rollback;
pub mod store;

pub use error::{EngineError, EngineResult, ProvisionError};
pub use plan::{PlanError, ProvisionedLeaves, ProvisioningPlan};
pub use provisioner::{CancelFlag, CompositeProvisioner};
pub use recognizer::CompositeRecognizer;
pub use reconciler::{
    EngineBuilder, PassFailure, PassPlan, PassReport, PlannedAction, Reconciler, ReconcilerConfig,
};
pub use record::{RecordValidationError, ServiceMapper, ServiceRecord, ServiceRecordDraft};
pub use registry::{ModuleDescriptor, ModuleRegistry};
pub use rollback::{LedgerEntry, RollbackCoordinator, RollbackLedger, RollbackReport};
pub use store::{MemoryRecordStore, PgRecordStore, RecordStore};
