//! Operation descriptors.
//!
//! An [`Operation`] is a declarative request. It names labware by id and type, never
//! holds deck state, and is immutable once handed to the validator.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::{PipettorConfig, MAX_BATCH_SIZE};
use crate::labware::{GridPos, LabwareId, LabwareType};

/// A labware reference as stored in operations and workflows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LabwareRef {
    pub id: LabwareId,
    #[serde(rename = "type")]
    pub labware_type: LabwareType,
}

impl LabwareRef {
    pub fn new(id: impl Into<LabwareId>, labware_type: LabwareType) -> Self {
        Self {
            id: id.into(),
            labware_type,
        }
    }
}

impl fmt::Display for LabwareRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.labware_type)
    }
}

/// Planning options shared by the liquid-handling operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferOptions {
    /// Group targets into shared aspirate or dispense cycles.
    #[serde(default = "default_true")]
    pub batch_mode: bool,
    /// Split volumes above the tip capacity into several trips.
    #[serde(default = "default_true")]
    pub multi_trip: bool,
    /// Mix after each dispense.
    #[serde(default)]
    pub mixing: bool,
    /// Fresh tips for every target cycle.
    #[serde(default)]
    pub change_tips: bool,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Where tip changes take fresh tips (and return used ones when the deck has no
    /// dropzone). Defaults to the first pipette holder on the deck.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tip_holder: Option<LabwareRef>,
}

fn default_true() -> bool {
    true
}

fn default_max_batch_size() -> usize {
    MAX_BATCH_SIZE
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            batch_mode: true,
            multi_trip: true,
            mixing: false,
            change_tips: false,
            max_batch_size: MAX_BATCH_SIZE,
            tip_holder: None,
        }
    }
}

impl TransferOptions {
    /// Defaults with the configured batch limit.
    pub fn from_config(config: &PipettorConfig) -> Self {
        Self {
            max_batch_size: config.planning.max_batch_size,
            ..Self::default()
        }
    }

    pub fn with_batch_mode(mut self, enabled: bool) -> Self {
        self.batch_mode = enabled;
        self
    }

    pub fn with_multi_trip(mut self, enabled: bool) -> Self {
        self.multi_trip = enabled;
        self
    }

    pub fn with_mixing(mut self, enabled: bool) -> Self {
        self.mixing = enabled;
        self
    }

    pub fn with_change_tips(mut self, enabled: bool) -> Self {
        self.change_tips = enabled;
        self
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    pub fn with_tip_holder(mut self, holder: LabwareRef) -> Self {
        self.tip_holder = Some(holder);
        self
    }

    /// Whether every target needs its own cycle.
    pub fn forces_single_target(&self) -> bool {
        !self.batch_mode || self.mixing || self.change_tips
    }
}

/// Every operation the engine plans and runs.
///
/// Positions on multi-channel pipettors name the first row of the block the head
/// covers. Volumes are per target well (per channel).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation_type", rename_all = "snake_case")]
pub enum Operation {
    PickTips {
        holder: LabwareRef,
        /// Explicit holder position; autoselected when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        position: Option<GridPos>,
    },
    ReturnTips {
        holder: LabwareRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        position: Option<GridPos>,
    },
    /// Return the attached tips, then pick fresh ones.
    ReplaceTips {
        holder: LabwareRef,
        /// Pick from here instead of `holder`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pick_holder: Option<LabwareRef>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        return_position: Option<GridPos>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pick_position: Option<GridPos>,
    },
    DiscardTips {
        dropzone: LabwareRef,
    },
    /// One source to many destinations.
    AddMedium {
        source: LabwareRef,
        source_position: GridPos,
        destination: LabwareRef,
        destination_positions: Vec<GridPos>,
        volume: f64,
        #[serde(default)]
        options: TransferOptions,
    },
    /// Many sources to one destination.
    RemoveMedium {
        source: LabwareRef,
        source_positions: Vec<GridPos>,
        destination: LabwareRef,
        destination_position: GridPos,
        volume: f64,
        #[serde(default)]
        options: TransferOptions,
    },
    /// Pairwise: `source_positions[i]` → `destination_positions[i]`.
    TransferPlateToPlate {
        source: LabwareRef,
        source_positions: Vec<GridPos>,
        destination: LabwareRef,
        destination_positions: Vec<GridPos>,
        volume: f64,
        #[serde(default)]
        options: TransferOptions,
    },
    /// Exchange medium: remove old medium to `waste`, refill from `medium`.
    RemoveAndAdd {
        plate: LabwareRef,
        plate_positions: Vec<GridPos>,
        waste: LabwareRef,
        waste_position: GridPos,
        medium: LabwareRef,
        medium_position: GridPos,
        volume: f64,
        #[serde(default)]
        options: TransferOptions,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::PickTips { .. } => "pick_tips",
            Operation::ReturnTips { .. } => "return_tips",
            Operation::ReplaceTips { .. } => "replace_tips",
            Operation::DiscardTips { .. } => "discard_tips",
            Operation::AddMedium { .. } => "add_medium",
            Operation::RemoveMedium { .. } => "remove_medium",
            Operation::TransferPlateToPlate { .. } => "transfer_plate_to_plate",
            Operation::RemoveAndAdd { .. } => "remove_and_add",
        }
    }

    /// Liquid-handling operations go through the batch and trip planner.
    pub fn is_liquid_handling(&self) -> bool {
        self.options().is_some()
    }

    pub fn options(&self) -> Option<&TransferOptions> {
        match self {
            Operation::AddMedium { options, .. }
            | Operation::RemoveMedium { options, .. }
            | Operation::TransferPlateToPlate { options, .. }
            | Operation::RemoveAndAdd { options, .. } => Some(options),
            _ => None,
        }
    }

    /// Requested volume per target, for liquid-handling operations.
    pub fn volume(&self) -> Option<f64> {
        match self {
            Operation::AddMedium { volume, .. }
            | Operation::RemoveMedium { volume, .. }
            | Operation::TransferPlateToPlate { volume, .. }
            | Operation::RemoveAndAdd { volume, .. } => Some(*volume),
            _ => None,
        }
    }

    /// Every labware this operation references, in field order.
    pub fn referenced_labware(&self) -> Vec<&LabwareRef> {
        let mut refs = Vec::new();
        match self {
            Operation::PickTips { holder, .. } | Operation::ReturnTips { holder, .. } => {
                refs.push(holder)
            }
            Operation::ReplaceTips {
                holder,
                pick_holder,
                ..
            } => {
                refs.push(holder);
                refs.extend(pick_holder.iter());
            }
            Operation::DiscardTips { dropzone } => refs.push(dropzone),
            Operation::AddMedium {
                source,
                destination,
                ..
            }
            | Operation::RemoveMedium {
                source,
                destination,
                ..
            }
            | Operation::TransferPlateToPlate {
                source,
                destination,
                ..
            } => {
                refs.push(source);
                refs.push(destination);
            }
            Operation::RemoveAndAdd {
                plate,
                waste,
                medium,
                ..
            } => {
                refs.push(plate);
                refs.push(waste);
                refs.push(medium);
            }
        }
        if let Some(holder) = self.options().and_then(|o| o.tip_holder.as_ref()) {
            refs.push(holder);
        }
        refs
    }

    /// Substitute labware ids; ids absent from `mapping` are left alone.
    pub fn remap_ids(&mut self, mapping: &BTreeMap<LabwareId, LabwareId>) {
        for reference in self.references_mut() {
            if let Some(new_id) = mapping.get(&reference.id) {
                reference.id = new_id.clone();
            }
        }
    }

    fn references_mut(&mut self) -> Vec<&mut LabwareRef> {
        let mut refs = Vec::new();
        let options = match self {
            Operation::PickTips { holder, .. } | Operation::ReturnTips { holder, .. } => {
                refs.push(holder);
                None
            }
            Operation::ReplaceTips {
                holder,
                pick_holder,
                ..
            } => {
                refs.push(holder);
                refs.extend(pick_holder.iter_mut());
                None
            }
            Operation::DiscardTips { dropzone } => {
                refs.push(dropzone);
                None
            }
            Operation::AddMedium {
                source,
                destination,
                options,
                ..
            }
            | Operation::RemoveMedium {
                source,
                destination,
                options,
                ..
            }
            | Operation::TransferPlateToPlate {
                source,
                destination,
                options,
                ..
            } => {
                refs.push(source);
                refs.push(destination);
                Some(options)
            }
            Operation::RemoveAndAdd {
                plate,
                waste,
                medium,
                options,
                ..
            } => {
                refs.push(plate);
                refs.push(waste);
                refs.push(medium);
                Some(options)
            }
        };
        if let Some(holder) = options.and_then(|o| o.tip_holder.as_mut()) {
            refs.push(holder);
        }
        refs
    }

    /// One-line summary for logs and workflow listings.
    pub fn describe(&self) -> String {
        match self {
            Operation::PickTips { holder, position } => match position {
                Some(pos) => format!("Pick tips from {} at {pos}", holder.id),
                None => format!("Pick tips from {}", holder.id),
            },
            Operation::ReturnTips { holder, .. } => format!("Return tips to {}", holder.id),
            Operation::ReplaceTips {
                holder,
                pick_holder,
                ..
            } => format!(
                "Replace tips at {} (pick from {})",
                holder.id,
                pick_holder.as_ref().unwrap_or(holder).id
            ),
            Operation::DiscardTips { dropzone } => format!("Discard tips into {}", dropzone.id),
            Operation::AddMedium {
                source,
                destination,
                destination_positions,
                volume,
                ..
            } => format!(
                "Add {volume} µl from {} to {} positions of {}",
                source.id,
                destination_positions.len(),
                destination.id
            ),
            Operation::RemoveMedium {
                source,
                source_positions,
                destination,
                volume,
                ..
            } => format!(
                "Remove {volume} µl from {} positions of {} to {}",
                source_positions.len(),
                source.id,
                destination.id
            ),
            Operation::TransferPlateToPlate {
                source,
                destination,
                source_positions,
                volume,
                ..
            } => format!(
                "Transfer {volume} µl × {} from {} to {}",
                source_positions.len(),
                source.id,
                destination.id
            ),
            Operation::RemoveAndAdd {
                plate,
                plate_positions,
                volume,
                ..
            } => format!(
                "Exchange {volume} µl in {} positions of {}",
                plate_positions.len(),
                plate.id
            ),
        }
    }
}
