//! Record Abstraction
//!
//! A [`Record`] is one unit of declarative state: something a user wants to
//! exist (the desired set) or something a provider reports as existing (the
//! observed set). The [`RecordMapper`] trait captures how records of one
//! type are keyed, compared, and classified for change.

use serde::{Deserialize, Serialize};

/// How a changed record must be brought in line with its desired state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    /// The live resource can absorb the change in place.
    Update,
    /// The live resource must be destroyed and recreated.
    Replace,
}

/// A unit of declarative state with a stable logical key.
pub trait Record: Clone + Send + Sync + 'static {
    /// Stable logical key identifying this record within its type.
    ///
    /// Two records with the same key are two views of the same logical
    /// resource. The key must not change across passes.
    fn entity_id(&self) -> String;
}

/// Type-specific comparison and classification for one record type.
///
/// Implementations decide which fields participate in equality (only
/// user-controlled fields; provider-populated fields must be ignored so a
/// freshly observed record does not churn against its desired twin) and
/// whether a given divergence is absorbable in place or forces a
/// destroy-and-recreate.
pub trait RecordMapper: Send + Sync {
    /// The record type this mapper governs.
    type Item: Record;

    /// Equality over user-controlled fields only.
    fn equals(&self, desired: &Self::Item, observed: &Self::Item) -> bool;

    /// Classifies a divergence between a desired record and its observed
    /// twin. Only called for pairs where [`Self::equals`] returned false.
    fn update_or_replace(&self, desired: &Self::Item, observed: &Self::Item) -> UpdateKind;
}
