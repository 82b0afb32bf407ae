//! Desired/Observed Diffing
//!
//! [`diff_records`] partitions a desired set and an observed set of records
//! (keyed by [`Record::entity_id`]) into the records only one side has and
//! the pairs both sides have but disagree about. [`classify`] maps a single
//! desired/observed pairing to the action the engine must take.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::record::{Record, RecordMapper, UpdateKind};

/// One action the engine takes to converge a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffAction {
    /// Desired exists, observed does not: bring it into existence.
    Create,
    /// Observed exists, desired does not: remove it.
    Delete,
    /// Both exist and agree: nothing to do.
    NoOp,
    /// Both exist and disagree; the divergence is absorbable in place.
    Update,
    /// Both exist and disagree; the live resource must be recreated.
    Replace,
}

/// A desired record and its observed twin that disagree.
#[derive(Debug, Clone)]
pub struct ChangedPair<R> {
    pub desired: R,
    pub observed: R,
    pub kind: UpdateKind,
}

/// Partition of a desired set against an observed set.
#[derive(Debug, Clone)]
pub struct RecordDiff<R> {
    /// Desired records with no observed twin.
    pub only_desired: Vec<R>,
    /// Observed records with no desired twin.
    pub only_observed: Vec<R>,
    /// Pairs present on both sides that disagree, with their
    /// update-or-replace classification.
    pub changed: Vec<ChangedPair<R>>,
    /// Number of pairs present on both sides that agree.
    pub in_sync: usize,
}

impl<R> RecordDiff<R> {
    /// True when nothing needs to change.
    pub fn is_converged(&self) -> bool {
        self.only_desired.is_empty() && self.only_observed.is_empty() && self.changed.is_empty()
    }
}

/// Classifies a single desired/observed pairing.
///
/// When both sides are present and disagree, `kind` decides between
/// [`DiffAction::Update`] and [`DiffAction::Replace`]. When neither side is
/// present there is nothing to converge.
pub fn classify(present_desired: bool, present_observed: bool, kind: Option<UpdateKind>) -> DiffAction {
    match (present_desired, present_observed) {
        (true, false) => DiffAction::Create,
        (false, true) => DiffAction::Delete,
        (false, false) => DiffAction::NoOp,
        (true, true) => match kind {
            None => DiffAction::NoOp,
            Some(UpdateKind::Update) => DiffAction::Update,
            Some(UpdateKind::Replace) => DiffAction::Replace,
        },
    }
}

/// Diffs a desired set against an observed set using the given mapper.
///
/// Records are paired by [`Record::entity_id`]. Output ordering within each
/// bucket follows the entity-id sort order, so two diffs over the same sets
/// are byte-identical regardless of input ordering.
pub fn diff_records<M: RecordMapper>(
    mapper: &M,
    desired: &[M::Item],
    observed: &[M::Item],
) -> RecordDiff<M::Item> {
    let desired_by_id: BTreeMap<String, &M::Item> =
        desired.iter().map(|r| (r.entity_id(), r)).collect();
    let observed_by_id: BTreeMap<String, &M::Item> =
        observed.iter().map(|r| (r.entity_id(), r)).collect();

    let mut diff = RecordDiff {
        only_desired: Vec::new(),
        only_observed: Vec::new(),
        changed: Vec::new(),
        in_sync: 0,
    };

    for (id, d) in &desired_by_id {
        match observed_by_id.get(id) {
            None => diff.only_desired.push((*d).clone()),
            Some(o) => {
                if mapper.equals(d, o) {
                    diff.in_sync += 1;
                } else {
                    let kind = mapper.update_or_replace(d, o);
                    diff.changed.push(ChangedPair {
                        desired: (*d).clone(),
                        observed: (*o).clone(),
                        kind,
                    });
                }
            }
        }
    }

    for (id, o) in &observed_by_id {
        if !desired_by_id.contains_key(id) {
            diff.only_observed.push((*o).clone());
        }
    }

    diff
}
