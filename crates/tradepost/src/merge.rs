//! Shared versioning rule for shops and waystones.
//!
//! Both entities key on [`Position`] and keep one active version per
//! Position. Given the active versions in some scope and the observations
//! for that scope, [`plan_merge`] decides per Position whether to insert,
//! extend, supersede, ignore or (under the closed-world assumption) prune.
//! Storage is applied by the caller.

use crate::error::{LedgerError, Result};
use crate::types::Position;
use std::collections::{BTreeMap, HashMap};

/// An observation that can be merged into the version history at its Position.
pub trait Observation {
    type Fingerprint: PartialEq;

    fn position(&self) -> &Position;

    /// The state this observation asserts. `None` means it can confirm an
    /// existing record but never found a new one.
    fn fingerprint(&self) -> Option<Self::Fingerprint>;

    /// Whether a differing fingerprint replaces the active version.
    /// Passive sightings return false and only ever extend.
    fn may_supersede(&self) -> bool {
        true
    }
}

/// Decision for one observed Position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// No active version; create one.
    Insert,
    /// Same state as the active version; bump last-seen in place.
    Extend,
    /// Different state; retire the active version and create a new one.
    Supersede,
    /// Nothing to record.
    Ignore,
}

pub fn merge_outcome<O: Observation>(active: Option<&O::Fingerprint>, observed: &O) -> MergeOutcome {
    match (active, observed.fingerprint()) {
        (None, Some(_)) => MergeOutcome::Insert,
        (None, None) => MergeOutcome::Ignore,
        (Some(_), None) => MergeOutcome::Extend,
        (Some(_), Some(_)) if !observed.may_supersede() => MergeOutcome::Extend,
        (Some(current), Some(next)) if *current == next => MergeOutcome::Extend,
        (Some(_), Some(_)) => MergeOutcome::Supersede,
    }
}

/// The active version at a Position, as far as merging is concerned.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveVersion<Id, F> {
    pub id: Id,
    pub position: Position,
    pub fingerprint: F,
    /// Whether a closed-world scan may retire it when unobserved.
    pub prunable: bool,
}

/// Storage actions for one scope, in observation order.
#[derive(Debug)]
pub struct MergePlan<Id, O> {
    pub inserts: Vec<O>,
    pub extends: Vec<(Id, O)>,
    pub supersedes: Vec<(Id, O)>,
    pub prunes: Vec<(Id, Position)>,
    pub ignored: usize,
}

impl<Id, O> Default for MergePlan<Id, O> {
    fn default() -> Self {
        Self {
            inserts: Vec::new(),
            extends: Vec::new(),
            supersedes: Vec::new(),
            prunes: Vec::new(),
            ignored: 0,
        }
    }
}

impl<Id, O> MergePlan<Id, O> {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty()
            && self.extends.is_empty()
            && self.supersedes.is_empty()
            && self.prunes.is_empty()
    }
}

/// Keep the last observation per Position, in order of first appearance.
pub fn last_per_position<O: Observation>(observed: Vec<O>) -> Vec<O> {
    let mut slots: HashMap<Position, usize> = HashMap::new();
    let mut kept: Vec<O> = Vec::with_capacity(observed.len());
    for obs in observed {
        match slots.get(obs.position()) {
            Some(&slot) => kept[slot] = obs,
            None => {
                slots.insert(*obs.position(), kept.len());
                kept.push(obs);
            }
        }
    }
    kept
}

/// Plan the merge of `observed` into `active` for one scope.
///
/// With `closed_world`, every prunable active version whose Position was
/// not observed is retired. Two active versions at one Position is a
/// [`LedgerError::ConsistencyViolation`].
pub fn plan_merge<Id, O>(
    active: Vec<ActiveVersion<Id, O::Fingerprint>>,
    observed: Vec<O>,
    closed_world: bool,
) -> Result<MergePlan<Id, O>>
where
    Id: Copy + std::fmt::Display,
    O: Observation,
{
    let mut by_position: BTreeMap<Position, ActiveVersion<Id, O::Fingerprint>> = BTreeMap::new();
    for version in active {
        let position = version.position;
        if let Some(existing) = by_position.insert(position, version) {
            let duplicate = by_position
                .get(&position)
                .map(|v| v.id.to_string())
                .unwrap_or_default();
            return Err(LedgerError::ConsistencyViolation(format!(
                "Multiple active versions at {}: {} and {}",
                position, existing.id, duplicate
            )));
        }
    }

    let mut plan = MergePlan::default();
    for obs in last_per_position(observed) {
        let current = by_position.remove(obs.position());
        match merge_outcome(current.as_ref().map(|v| &v.fingerprint), &obs) {
            MergeOutcome::Insert => plan.inserts.push(obs),
            MergeOutcome::Ignore => plan.ignored += 1,
            MergeOutcome::Extend => {
                if let Some(version) = current {
                    plan.extends.push((version.id, obs));
                }
            }
            MergeOutcome::Supersede => {
                if let Some(version) = current {
                    plan.supersedes.push((version.id, obs));
                }
            }
        }
    }

    if closed_world {
        plan.prunes = by_position
            .into_values()
            .filter(|v| v.prunable)
            .map(|v| (v.id, v.position))
            .collect();
    }

    Ok(plan)
}
