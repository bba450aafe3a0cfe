//! Pre-flight validation and tip-holder autoselection.
//!
//! [`Validator::validate`] runs five checks in a fixed order and stops at the first
//! failure:
//!
//! 1. reference resolution (ids exist, types and positions fit the operation)
//! 2. tip state on the pipettor and on explicitly named holders
//! 3. content capacity of every source and destination item
//! 4. per-trip volume against the tip capacity
//! 5. autoselect feasibility for tip picks, returns and tip changes
//!
//! Nothing here mutates the deck or talks to the actuator. Autoselect works on a
//! [`TipLedger`], a private copy of one pipette holder, so the planner can choose
//! holders for a whole operation ahead of execution.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::Serialize;

use crate::engine::planner::tip_change_count;
use crate::error::{AppResult, PipettorError, ValidationFailure, ValidationReason};
use crate::labware::{
    ContentMap, Deck, GridPos, ItemAddress, Labware, LabwareId, LabwareType, VOLUME_TOLERANCE,
};
use crate::operation::{LabwareRef, Operation};
use crate::pipettor::{PipettorState, TIP_VOLUME_TOLERANCE};

/// Which way a tip moves between the head and a holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TipAction {
    Pick,
    Return,
}

impl TipAction {
    /// The holder flag a position needs before this action.
    pub fn required_flag(self) -> bool {
        match self {
            TipAction::Pick => false,
            TipAction::Return => true,
        }
    }

    /// The holder flag after this action.
    pub fn resulting_flag(self) -> bool {
        !self.required_flag()
    }
}

impl fmt::Display for TipAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TipAction::Pick => f.write_str("pick tips"),
            TipAction::Return => f.write_str("return tips"),
        }
    }
}

/// Candidate and excluded holders for one tip action.
///
/// `candidates` lists usable start positions: single holders on a single-channel head,
/// first rows of free blocks on a multi-channel head. `excluded` lists every holder
/// whose flag rules it out.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HolderPartition {
    /// Holder the partition was computed for.
    pub holder: LabwareId,
    /// Whether tips are picked from or returned to the holder.
    pub action: TipAction,
    /// Usable start positions, column-major.
    pub candidates: Vec<GridPos>,
    /// Holders whose flag rules them out.
    pub excluded: Vec<GridPos>,
}

impl HolderPartition {
    /// The position autoselect would use.
    pub fn first(&self) -> Option<GridPos> {
        self.candidates.first().copied()
    }
}

/// Partition the positions of a pipette holder for `action`.
///
/// Positions in `reserved` are never offered, whatever their flag.
pub fn holder_partition(
    labware: &Labware,
    action: TipAction,
    channels: usize,
    reserved: &HashSet<GridPos>,
) -> AppResult<HolderPartition> {
    let layout = labware.layout().filter(|_| labware.is_tip_holder()).ok_or_else(|| {
        ValidationFailure::new(
            labware.id.clone(),
            ValidationReason::WrongType {
                expected: LabwareType::PipetteHolder.to_string(),
                found: labware.labware_type().to_string(),
            },
        )
    })?;

    let usable = |pos: GridPos| {
        !reserved.contains(&pos)
            && labware
                .holder_at(pos)
                .is_some_and(|h| h.has_tip == action.required_flag())
    };

    let excluded = layout
        .positions()
        .filter(|pos| {
            labware
                .holder_at(*pos)
                .is_some_and(|h| h.has_tip != action.required_flag())
        })
        .collect();

    let channels = channels.max(1);
    let mut candidates = Vec::new();
    for column in 0..layout.columns {
        let mut row = 0;
        while row + channels <= layout.rows {
            let start = GridPos::new(column, row);
            if (0..channels).all(|i| usable(start.down(i))) {
                candidates.push(start);
                row += channels;
            } else {
                row += 1;
            }
        }
    }

    Ok(HolderPartition {
        holder: labware.id.clone(),
        action,
        candidates,
        excluded,
    })
}

/// Simulated holder state used to pick and return tips ahead of execution.
///
/// Positions returned to during one operation are never picked from again in the
/// same operation.
#[derive(Debug, Clone)]
pub struct TipLedger {
    holder: Labware,
    channels: usize,
    returned: HashSet<GridPos>,
}

impl TipLedger {
    /// Track claims against a copy of `holder` for a head with `channels` channels.
    pub fn new(holder: &Labware, channels: usize) -> Self {
        Self {
            holder: holder.clone(),
            channels: channels.max(1),
            returned: HashSet::new(),
        }
    }

    /// The holder with every claim so far applied.
    pub fn holder(&self) -> &Labware {
        &self.holder
    }

    /// Choose where to pick fresh tips and mark them taken.
    pub fn take(&mut self) -> AppResult<GridPos> {
        self.claim(TipAction::Pick, None)
    }

    /// Choose where to return the attached tips and mark them stowed.
    pub fn stow(&mut self) -> AppResult<GridPos> {
        let pos = self.claim(TipAction::Return, None)?;
        self.returned.extend((0..self.channels).map(|i| pos.down(i)));
        Ok(pos)
    }

    /// Use an explicit start position for `action`.
    pub fn claim_at(&mut self, action: TipAction, pos: GridPos) -> AppResult<GridPos> {
        let pos = self.claim(action, Some(pos))?;
        if action == TipAction::Return {
            self.returned.extend((0..self.channels).map(|i| pos.down(i)));
        }
        Ok(pos)
    }

    fn claim(&mut self, action: TipAction, explicit: Option<GridPos>) -> AppResult<GridPos> {
        let pos = match explicit {
            Some(pos) => pos,
            None => {
                let reserved = match action {
                    TipAction::Pick => self.returned.clone(),
                    TipAction::Return => HashSet::new(),
                };
                let partition =
                    holder_partition(&self.holder, action, self.channels, &reserved)?;
                match partition.first() {
                    Some(pos) => pos,
                    None => {
                        return Err(insufficient(&self.holder, action, self.channels, &reserved))
                    }
                }
            }
        };
        let id = self.holder.id.clone();
        for i in 0..self.channels {
            let slot = pos.down(i);
            let holder = self
                .holder
                .holder_at_mut(slot)
                .ok_or_else(|| invalid_position(&id, slot))?;
            holder.has_tip = action.resulting_flag();
        }
        Ok(pos)
    }
}

fn insufficient(
    holder: &Labware,
    action: TipAction,
    channels: usize,
    reserved: &HashSet<GridPos>,
) -> PipettorError {
    let available = holder
        .item_positions()
        .into_iter()
        .filter(|pos| !reserved.contains(pos))
        .filter(|pos| {
            holder
                .holder_at(*pos)
                .is_some_and(|h| h.has_tip == action.required_flag())
        })
        .count();
    PipettorError::InsufficientHolders {
        holder: holder.id.clone(),
        action: action.to_string(),
        required: channels,
        available,
    }
}

fn invalid_position(id: &LabwareId, pos: GridPos) -> PipettorError {
    ValidationFailure::new(
        id.clone(),
        ValidationReason::InvalidPosition {
            column: pos.column,
            row: pos.row,
        },
    )
    .into()
}

fn wrong_type(id: &LabwareId, expected: &str, found: LabwareType) -> PipettorError {
    ValidationFailure::new(
        id.clone(),
        ValidationReason::WrongType {
            expected: expected.to_string(),
            found: found.to_string(),
        },
    )
    .into()
}

fn request(id: &LabwareId, message: impl Into<String>) -> PipettorError {
    ValidationFailure::new(id.clone(), ValidationReason::Request(message.into())).into()
}

/// What an operation needs a labware to be.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Role {
    TipHolder,
    Dropzone,
    LiquidContainer,
    Plate,
}

impl Role {
    fn admits(self, labware: &Labware) -> bool {
        match self {
            Role::TipHolder => labware.is_tip_holder(),
            Role::Dropzone => labware.is_dropzone(),
            Role::LiquidContainer => labware.is_liquid_container(),
            Role::Plate => labware.labware_type() == LabwareType::Plate,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Role::TipHolder => "PipetteHolder",
            Role::Dropzone => "TipDropzone",
            Role::LiquidContainer => "Plate or ReservoirHolder",
            Role::Plate => "Plate",
        }
    }
}

/// Per-item volume demand of one operation.
#[derive(Debug, Default)]
struct Demand {
    outgoing: BTreeMap<ItemAddress, f64>,
    incoming: BTreeMap<ItemAddress, f64>,
}

/// Read-only checks against a deck and pipettor snapshot.
pub struct Validator<'a> {
    deck: &'a Deck,
    pipettor: &'a PipettorState,
}

impl<'a> Validator<'a> {
    /// Validate against `deck` and `pipettor` as they are now.
    pub fn new(deck: &'a Deck, pipettor: &'a PipettorState) -> Self {
        Self { deck, pipettor }
    }

    /// Run every pre-flight check in order and log the first rejection.
    pub fn validate(&self, op: &Operation) -> AppResult<()> {
        let result = self
            .check_references(op)
            .and_then(|()| self.check_tip_state(op))
            .and_then(|()| self.check_capacity(op))
            .and_then(|()| self.check_tip_capacity(op))
            .and_then(|()| self.check_autoselect(op));
        if let Err(err) = &result {
            tracing::warn!(operation = op.name(), error = %err, "Validation failed");
        }
        result
    }

    /// Candidate/excluded holders for `action` on a holder of the current deck.
    pub fn partition(&self, holder: &LabwareId, action: TipAction) -> AppResult<HolderPartition> {
        let labware = self.deck.labware(holder)?;
        holder_partition(
            labware,
            action,
            self.pipettor.channel_count(),
            &HashSet::new(),
        )
    }

    /// Resolve a reference and check its recorded type and role.
    pub(crate) fn resolve(&self, reference: &LabwareRef, role: Role) -> AppResult<&'a Labware> {
        let labware = self.deck.labware(&reference.id)?;
        if labware.labware_type() != reference.labware_type {
            return Err(wrong_type(
                &reference.id,
                &reference.labware_type.to_string(),
                labware.labware_type(),
            ));
        }
        if !role.admits(labware) {
            return Err(wrong_type(&reference.id, role.label(), labware.labware_type()));
        }
        Ok(labware)
    }

    /// Tip holder used for tip changes: the explicit one or the first on the deck.
    pub(crate) fn change_holder(&self, op: &Operation) -> AppResult<&'a Labware> {
        match op.options().and_then(|o| o.tip_holder.as_ref()) {
            Some(reference) => self.resolve(reference, Role::TipHolder),
            None => self
                .deck
                .of_type(LabwareType::PipetteHolder)
                .into_iter()
                .next()
                .ok_or_else(|| {
                    request(
                        &op.referenced_labware()
                            .first()
                            .map(|r| r.id.clone())
                            .unwrap_or_else(|| LabwareId::new(self.deck.id.as_str())),
                        "tip changes need a pipette holder on the deck",
                    )
                }),
        }
    }

    fn check_position(&self, labware: &Labware, pos: GridPos) -> AppResult<()> {
        labware
            .channel_items(pos, self.pipettor.channel_count())
            .map(|_| ())
            .ok_or_else(|| invalid_position(&labware.id, pos))
    }

    fn check_holder_position(&self, labware: &Labware, pos: GridPos) -> AppResult<()> {
        let channels = self.pipettor.channel_count();
        if (0..channels).all(|i| labware.holder_at(pos.down(i)).is_some()) {
            Ok(())
        } else {
            Err(invalid_position(&labware.id, pos))
        }
    }

    fn check_request(&self, id: &LabwareId, volume: f64, targets: usize) -> AppResult<()> {
        if !(volume > 0.0 && volume.is_finite()) {
            return Err(request(id, format!("volume must be positive, got {volume}")));
        }
        if targets == 0 {
            return Err(request(id, "no target positions given"));
        }
        Ok(())
    }

    // 1. Reference resolution ------------------------------------------------

    fn check_references(&self, op: &Operation) -> AppResult<()> {
        match op {
            Operation::PickTips { holder, position }
            | Operation::ReturnTips { holder, position } => {
                let labware = self.resolve(holder, Role::TipHolder)?;
                if let Some(pos) = position {
                    self.check_holder_position(labware, *pos)?;
                }
            }
            Operation::ReplaceTips {
                holder,
                pick_holder,
                return_position,
                pick_position,
            } => {
                let labware = self.resolve(holder, Role::TipHolder)?;
                let pick_labware = match pick_holder {
                    Some(reference) => self.resolve(reference, Role::TipHolder)?,
                    None => labware,
                };
                if let Some(pos) = return_position {
                    self.check_holder_position(labware, *pos)?;
                }
                if let Some(pos) = pick_position {
                    self.check_holder_position(pick_labware, *pos)?;
                }
            }
            Operation::DiscardTips { dropzone } => {
                self.resolve(dropzone, Role::Dropzone)?;
            }
            Operation::AddMedium {
                source,
                source_position,
                destination,
                destination_positions,
                volume,
                ..
            } => {
                let src = self.resolve(source, Role::LiquidContainer)?;
                let dst = self.resolve(destination, Role::LiquidContainer)?;
                self.check_request(&destination.id, *volume, destination_positions.len())?;
                self.check_position(src, *source_position)?;
                for pos in destination_positions {
                    self.check_position(dst, *pos)?;
                }
            }
            Operation::RemoveMedium {
                source,
                source_positions,
                destination,
                destination_position,
                volume,
                ..
            } => {
                let src = self.resolve(source, Role::LiquidContainer)?;
                let dst = self.resolve(destination, Role::LiquidContainer)?;
                self.check_request(&source.id, *volume, source_positions.len())?;
                for pos in source_positions {
                    self.check_position(src, *pos)?;
                }
                self.check_position(dst, *destination_position)?;
            }
            Operation::TransferPlateToPlate {
                source,
                source_positions,
                destination,
                destination_positions,
                volume,
                ..
            } => {
                let src = self.resolve(source, Role::Plate)?;
                let dst = self.resolve(destination, Role::Plate)?;
                self.check_request(&source.id, *volume, source_positions.len())?;
                if source_positions.len() != destination_positions.len() {
                    return Err(request(
                        &destination.id,
                        format!(
                            "{} source positions but {} destination positions",
                            source_positions.len(),
                            destination_positions.len()
                        ),
                    ));
                }
                for pos in source_positions {
                    self.check_position(src, *pos)?;
                }
                for pos in destination_positions {
                    self.check_position(dst, *pos)?;
                }
            }
            Operation::RemoveAndAdd {
                plate,
                plate_positions,
                waste,
                waste_position,
                medium,
                medium_position,
                volume,
                ..
            } => {
                let plate_lw = self.resolve(plate, Role::Plate)?;
                let waste_lw = self.resolve(waste, Role::LiquidContainer)?;
                let medium_lw = self.resolve(medium, Role::LiquidContainer)?;
                self.check_request(&plate.id, *volume, plate_positions.len())?;
                for pos in plate_positions {
                    self.check_position(plate_lw, *pos)?;
                }
                self.check_position(waste_lw, *waste_position)?;
                self.check_position(medium_lw, *medium_position)?;
            }
        }
        if let Some(reference) = op.options().and_then(|o| o.tip_holder.as_ref()) {
            self.resolve(reference, Role::TipHolder)?;
        }
        Ok(())
    }

    // 2. Tip state -----------------------------------------------------------

    fn check_tip_state(&self, op: &Operation) -> AppResult<()> {
        let has_tip = self.pipettor.has_tip();
        match op {
            Operation::PickTips { holder, position } => {
                if has_tip {
                    return Err(tip_state(&holder.id, "pipettor already holds tips"));
                }
                if let Some(pos) = position {
                    self.check_holder_flags(&holder.id, *pos, TipAction::Pick)?;
                }
            }
            Operation::ReturnTips { holder, position } => {
                if !has_tip {
                    return Err(tip_state(&holder.id, "pipettor holds no tips to return"));
                }
                if let Some(pos) = position {
                    self.check_holder_flags(&holder.id, *pos, TipAction::Return)?;
                }
            }
            Operation::ReplaceTips {
                holder,
                return_position,
                ..
            } => {
                if !has_tip {
                    return Err(tip_state(&holder.id, "pipettor holds no tips to replace"));
                }
                if let Some(pos) = return_position {
                    self.check_holder_flags(&holder.id, *pos, TipAction::Return)?;
                }
            }
            Operation::DiscardTips { dropzone } => {
                if !has_tip {
                    return Err(tip_state(&dropzone.id, "pipettor holds no tips to discard"));
                }
            }
            _ => {
                let first = op.referenced_labware()[0].id.clone();
                if !has_tip {
                    return Err(tip_state(&first, "liquid handling requires tips"));
                }
                if self.pipettor.held_volume() > VOLUME_TOLERANCE {
                    return Err(tip_state(
                        &first,
                        format!(
                            "tips still hold {:.2} µl; discard them first",
                            self.pipettor.held_volume()
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    fn check_holder_flags(&self, id: &LabwareId, pos: GridPos, action: TipAction) -> AppResult<()> {
        let labware = self.deck.labware(id)?;
        for i in 0..self.pipettor.channel_count() {
            let slot = pos.down(i);
            let holder = labware
                .holder_at(slot)
                .ok_or_else(|| invalid_position(id, slot))?;
            if holder.has_tip != action.required_flag() {
                return Err(tip_state(
                    &holder.id,
                    format!(
                        "cannot {action}: holder has_tip is {}",
                        holder.has_tip
                    ),
                ));
            }
        }
        Ok(())
    }

    // 3. Content capacity ----------------------------------------------------

    fn check_capacity(&self, op: &Operation) -> AppResult<()> {
        let Some(demand) = self.demand(op)? else {
            return Ok(());
        };
        for (address, out) in &demand.outgoing {
            let (item_id, content) = self.content(address)?;
            if !content.can_supply(*out) {
                return Err(ValidationFailure::new(
                    item_id,
                    ValidationReason::Underflow {
                        available: content.total(),
                        requested: *out,
                    },
                )
                .into());
            }
        }
        for (address, incoming) in &demand.incoming {
            let (item_id, content) = self.content(address)?;
            let out = demand.outgoing.get(address).copied().unwrap_or(0.0);
            let current = (content.total() - out).max(0.0);
            if current + incoming > content.capacity() + VOLUME_TOLERANCE {
                return Err(ValidationFailure::new(
                    item_id,
                    ValidationReason::Overflow {
                        capacity: content.capacity(),
                        current,
                        incoming: *incoming,
                    },
                )
                .into());
            }
        }
        Ok(())
    }

    fn content(&self, address: &ItemAddress) -> AppResult<(LabwareId, &'a ContentMap)> {
        let labware = self.deck.labware(&address.labware)?;
        let id = labware
            .item_id(address.position)
            .cloned()
            .ok_or_else(|| invalid_position(&address.labware, address.position))?;
        let content = labware
            .content_at(address.position)
            .ok_or_else(|| invalid_position(&address.labware, address.position))?;
        Ok((id, content))
    }

    fn demand(&self, op: &Operation) -> AppResult<Option<Demand>> {
        let channels = self.pipettor.channel_count();
        let mut demand = Demand::default();
        let add = |map: &mut BTreeMap<ItemAddress, f64>,
                       reference: &LabwareRef,
                       pos: GridPos,
                       per_channel: f64|
         -> AppResult<()> {
            let labware = self.deck.labware(&reference.id)?;
            let items = labware
                .channel_items(pos, channels)
                .ok_or_else(|| invalid_position(&reference.id, pos))?;
            for (item, served) in items {
                *map.entry(ItemAddress::new(&reference.id, item)).or_insert(0.0) +=
                    per_channel * served.len() as f64;
            }
            Ok(())
        };

        match op {
            Operation::AddMedium {
                source,
                source_position,
                destination,
                destination_positions,
                volume,
                ..
            } => {
                let total = volume * destination_positions.len() as f64;
                add(&mut demand.outgoing, source, *source_position, total)?;
                for pos in destination_positions {
                    add(&mut demand.incoming, destination, *pos, *volume)?;
                }
            }
            Operation::RemoveMedium {
                source,
                source_positions,
                destination,
                destination_position,
                volume,
                ..
            } => {
                for pos in source_positions {
                    add(&mut demand.outgoing, source, *pos, *volume)?;
                }
                let total = volume * source_positions.len() as f64;
                add(&mut demand.incoming, destination, *destination_position, total)?;
            }
            Operation::TransferPlateToPlate {
                source,
                source_positions,
                destination,
                destination_positions,
                volume,
                ..
            } => {
                for (src, dst) in source_positions.iter().zip(destination_positions) {
                    add(&mut demand.outgoing, source, *src, *volume)?;
                    add(&mut demand.incoming, destination, *dst, *volume)?;
                }
            }
            Operation::RemoveAndAdd {
                plate,
                plate_positions,
                waste,
                waste_position,
                medium,
                medium_position,
                volume,
                ..
            } => {
                let total = volume * plate_positions.len() as f64;
                for pos in plate_positions {
                    add(&mut demand.outgoing, plate, *pos, *volume)?;
                    add(&mut demand.incoming, plate, *pos, *volume)?;
                }
                add(&mut demand.incoming, waste, *waste_position, total)?;
                add(&mut demand.outgoing, medium, *medium_position, total)?;
            }
            _ => return Ok(None),
        }
        Ok(Some(demand))
    }

    // 4. Tip capacity --------------------------------------------------------

    fn check_tip_capacity(&self, op: &Operation) -> AppResult<()> {
        let (Some(volume), Some(options)) = (op.volume(), op.options()) else {
            return Ok(());
        };
        if !options.multi_trip && volume > self.pipettor.tip_capacity() + TIP_VOLUME_TOLERANCE {
            return Err(ValidationFailure::new(
                op.referenced_labware()[0].id.clone(),
                ValidationReason::ExceedsTipCapacity {
                    requested: volume,
                    capacity: self.pipettor.tip_capacity(),
                },
            )
            .into());
        }
        Ok(())
    }

    // 5. Autoselect feasibility ----------------------------------------------

    fn check_autoselect(&self, op: &Operation) -> AppResult<()> {
        let channels = self.pipettor.channel_count();
        match op {
            Operation::PickTips {
                holder,
                position: None,
            } => {
                TipLedger::new(self.deck.labware(&holder.id)?, channels).take()?;
            }
            Operation::ReturnTips {
                holder,
                position: None,
            } => {
                TipLedger::new(self.deck.labware(&holder.id)?, channels).stow()?;
            }
            Operation::ReplaceTips {
                holder,
                pick_holder,
                return_position,
                pick_position,
            } => {
                let mut ledger = TipLedger::new(self.deck.labware(&holder.id)?, channels);
                match return_position {
                    Some(pos) => ledger.claim_at(TipAction::Return, *pos)?,
                    None => ledger.stow()?,
                };
                if pick_position.is_none() {
                    match pick_holder.as_ref().filter(|p| p.id != holder.id) {
                        Some(other) => {
                            TipLedger::new(self.deck.labware(&other.id)?, channels).take()?;
                        }
                        None => {
                            ledger.take()?;
                        }
                    }
                }
            }
            _ => {
                let changes = tip_change_count(op, self.pipettor);
                if changes > 0 {
                    let holder = self.change_holder(op)?;
                    let mut ledger = TipLedger::new(holder, channels);
                    let dropzone = self.deck.dropzone().is_some();
                    for _ in 0..changes {
                        if !dropzone {
                            ledger.stow()?;
                        }
                        ledger.take()?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn tip_state(id: &LabwareId, message: impl Into<String>) -> PipettorError {
    ValidationFailure::new(id.clone(), ValidationReason::TipState(message.into())).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labware::{Dimensions, GridLayout, IndividualPipetteHolder};

    fn holder(layout: GridLayout, with_tip: &[GridPos]) -> Labware {
        let mut labware = Labware::pipette_holder(
            "tips",
            Dimensions::new(120.0, 80.0, 50.0),
            layout,
            IndividualPipetteHolder::template(Dimensions::new(7.0, 7.0, 45.0), false),
        );
        for pos in with_tip {
            labware = labware.with_tip_flag(*pos, true).unwrap();
        }
        labware
    }

    #[test]
    fn pick_prefers_clear_holders_and_excludes_flagged_ones() {
        let tips = holder(GridLayout::new(2, 1, 9.0, 9.0), &[GridPos::new(1, 0)]);
        let partition = holder_partition(&tips, TipAction::Pick, 1, &HashSet::new()).unwrap();
        assert_eq!(partition.candidates, vec![GridPos::new(0, 0)]);
        assert_eq!(partition.excluded, vec![GridPos::new(1, 0)]);
        assert_eq!(partition.first(), Some(GridPos::new(0, 0)));
    }

    #[test]
    fn multichannel_blocks_do_not_overlap() {
        let tips = holder(GridLayout::new(1, 8, 9.0, 9.0), &[GridPos::new(0, 2)]);
        let partition = holder_partition(&tips, TipAction::Pick, 2, &HashSet::new()).unwrap();
        assert_eq!(
            partition.candidates,
            vec![GridPos::new(0, 0), GridPos::new(0, 3), GridPos::new(0, 5)]
        );
    }

    #[test]
    fn ledger_never_picks_where_it_just_returned() {
        let tips = holder(GridLayout::new(3, 1, 9.0, 9.0), &[GridPos::new(0, 0)]);
        let mut ledger = TipLedger::new(&tips, 1);
        assert_eq!(ledger.stow().unwrap(), GridPos::new(0, 0));
        assert_eq!(ledger.take().unwrap(), GridPos::new(1, 0));
        assert_eq!(ledger.take().unwrap(), GridPos::new(2, 0));
        assert!(matches!(
            ledger.take(),
            Err(PipettorError::InsufficientHolders {
                required: 1,
                available: 0,
                ..
            })
        ));
    }

    #[test]
    fn partition_rejects_non_holders() {
        let zone = Labware::tip_dropzone("bin", Dimensions::new(10.0, 10.0, 5.0), 2.0);
        assert!(holder_partition(&zone, TipAction::Pick, 1, &HashSet::new()).is_err());
    }
}
