//! Remap resolver.
//!
//! Workflows reference labware by id. When a workflow is replayed against a different deck,
//! [`analyze`] reports every referenced id that is absent (or present with the wrong type)
//! together with the same-type labware that could stand in for it. [`apply`] substitutes a
//! chosen mapping uniformly through every operation. Nothing is ever mapped automatically.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::error::{AppResult, PipettorError};
use crate::labware::{Deck, LabwareId, LabwareType};
use crate::workflow::Workflow;

/// A referenced id with no matching labware on the deck.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissingLabware {
    pub id: LabwareId,
    /// Type the workflow expects for `id`.
    pub labware_type: LabwareType,
    /// Present labware of the same type, in deck order.
    pub candidates: Vec<LabwareId>,
    /// Indices of the workflow entries referencing this id.
    pub operations: Vec<usize>,
}

/// A referenced id that exists on the deck with a different type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypeConflict {
    pub id: LabwareId,
    pub expected: LabwareType,
    pub found: LabwareType,
    pub candidates: Vec<LabwareId>,
    pub operations: Vec<usize>,
}

/// Everything that keeps a workflow from running on a deck.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RemapReport {
    /// Missing ids grouped by the type the workflow expects.
    pub missing: BTreeMap<LabwareType, Vec<MissingLabware>>,
    pub conflicts: Vec<TypeConflict>,
}

impl RemapReport {
    /// Every id that blocks the operations referencing it.
    pub fn unresolved_ids(&self) -> BTreeSet<LabwareId> {
        self.missing
            .values()
            .flatten()
            .map(|m| m.id.clone())
            .chain(self.conflicts.iter().map(|c| c.id.clone()))
            .collect()
    }

    /// Nothing is missing or conflicting.
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.conflicts.is_empty()
    }

    /// Workflow entry indices blocked by an unresolved id.
    pub fn blocked_operations(&self) -> BTreeSet<usize> {
        self.missing
            .values()
            .flatten()
            .flat_map(|m| m.operations.iter().copied())
            .chain(self.conflicts.iter().flat_map(|c| c.operations.iter().copied()))
            .collect()
    }
}

fn candidates(deck: &Deck, labware_type: LabwareType) -> Vec<LabwareId> {
    deck.of_type(labware_type)
        .into_iter()
        .map(|l| l.id.clone())
        .collect()
}

/// Find every id the workflow references that the deck cannot satisfy.
pub fn analyze(workflow: &Workflow, deck: &Deck) -> RemapReport {
    // id -> (expected type, referencing entries)
    let mut referenced: BTreeMap<LabwareId, (LabwareType, Vec<usize>)> = BTreeMap::new();
    for (index, entry) in workflow.operations.iter().enumerate() {
        for reference in entry.operation.referenced_labware() {
            let (_, operations) = referenced
                .entry(reference.id.clone())
                .or_insert_with(|| (reference.labware_type, Vec::new()));
            if operations.last() != Some(&index) {
                operations.push(index);
            }
        }
    }

    let mut report = RemapReport::default();
    for (id, (expected, operations)) in referenced {
        match deck.labware(&id) {
            Ok(labware) if labware.labware_type() == expected => {}
            Ok(labware) => report.conflicts.push(TypeConflict {
                candidates: candidates(deck, expected),
                found: labware.labware_type(),
                id,
                expected,
                operations,
            }),
            Err(_) => report
                .missing
                .entry(expected)
                .or_default()
                .push(MissingLabware {
                    candidates: candidates(deck, expected),
                    id,
                    labware_type: expected,
                    operations,
                }),
        }
    }

    if !report.is_complete() {
        tracing::info!(
            workflow = %workflow.name,
            unresolved = report.unresolved_ids().len(),
            "Workflow references labware not on the deck"
        );
    }
    report
}

/// Return a copy of `workflow` with every id in `mapping` replaced.
///
/// Each target must be on the deck with the type the workflow expects for the replaced id.
/// Any violation rejects the whole mapping.
pub fn apply(
    workflow: &Workflow,
    deck: &Deck,
    mapping: &BTreeMap<LabwareId, LabwareId>,
) -> AppResult<Workflow> {
    let expected: BTreeMap<&LabwareId, LabwareType> = workflow
        .referenced_labware()
        .into_iter()
        .map(|r| (&r.id, r.labware_type))
        .collect();

    let mut rejected = Vec::new();
    for (old, new) in mapping {
        let compatible = match (expected.get(old), deck.labware(new)) {
            (Some(kind), Ok(target)) => target.labware_type() == *kind,
            _ => false,
        };
        if !compatible {
            tracing::warn!(from = %old, to = %new, "Rejected labware substitution");
            rejected.push(old.clone());
        }
    }
    if !rejected.is_empty() {
        return Err(PipettorError::RemapUnresolved { ids: rejected });
    }

    let mut remapped = workflow.clone();
    for entry in &mut remapped.operations {
        // Only generated descriptions follow the new ids.
        let generated = entry.description == entry.operation.describe();
        entry.operation.remap_ids(mapping);
        if generated {
            entry.description = entry.operation.describe();
        }
    }
    tracing::info!(workflow = %workflow.name, substitutions = mapping.len(), "Workflow remapped");
    Ok(remapped)
}
