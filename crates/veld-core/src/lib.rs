//! # veld-core
//!
//! The record model and diff classification at the heart of veld.
//!
//! A *desired record* is what the operator declared; an *observed record*
//! is what the provider currently reports. This crate defines the traits a
//! record type must implement to participate in reconciliation
//! ([`Record`], [`RecordMapper`]) and the pure classification logic that
//! turns a desired/observed pair into one of the five reconciliation
//! actions ([`classify`], [`DiffAction`]).
//!
//! Everything here is synchronous and side-effect free; provider access
//! and orchestration live in `veld-provider` and `veld-engine`.

pub mod diff;
pub mod ids;
pub mod record;

pub use diff::{classify, diff_records, ChangedPair, DiffAction, RecordDiff};
pub use ids::{ModuleId, ParseIdError, PassId};
pub use record::{Record, RecordMapper, UpdateKind};
