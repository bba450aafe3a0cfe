//! Batch & trip planner.
//!
//! Expands a validated [`Operation`] into a [`Plan`] of primitive steps. Liquid handling
//! goes through two stages:
//!
//! - **trips**: a per-target volume above the tip capacity becomes consecutive trips of
//!   full capacity followed by the remainder ([`split_trips`]);
//! - **batches**: trips are grouped so one bulk aspirate feeds several dispenses (or
//!   several aspirates feed one bulk dispense). Group size is bounded by the batch limit
//!   and by how many trips fit in one tip ([`batch_limit`]).
//!
//! Tip changes and mixing are woven into the resulting cycles. Every head height is
//! computed here, so an unreachable Z fails planning, before any device command.

use crate::engine::plan::{
    Action, BatchKind, BatchRecord, Effect, ItemTransfer, Plan, PlannedStep,
};
use crate::engine::validator::{TipAction, TipLedger, Validator};
use crate::error::{AppResult, PipettorError, ValidationFailure, ValidationReason};
use crate::labware::{Deck, GridPos, ItemAddress, Labware, LabwareId};
use crate::operation::{LabwareRef, Operation, TransferOptions};
use crate::pipettor::{PipettorState, TIP_VOLUME_TOLERANCE};

/// Split `volume` into trips of at most `capacity`: full trips first, remainder last.
pub fn split_trips(volume: f64, capacity: f64) -> Vec<f64> {
    if volume <= capacity + TIP_VOLUME_TOLERANCE || capacity <= 0.0 {
        return vec![volume];
    }
    let trips = (volume / capacity).ceil() as usize;
    let mut out = vec![capacity; trips - 1];
    out.push(volume - capacity * (trips - 1) as f64);
    out
}

/// Largest group of trips of `trip_volume` one cycle may serve.
pub fn batch_limit(options: &TransferOptions, trip_volume: f64, capacity: f64) -> usize {
    if options.forces_single_target() || trip_volume <= 0.0 {
        return 1;
    }
    let fit = ((capacity + TIP_VOLUME_TOLERANCE) / trip_volume).floor() as usize;
    options.max_batch_size.min(fit).max(1)
}

/// One trip: `volume` per channel from `from` to `to`; `target` indexes the operation's
/// position list.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trip {
    /// Index into the operation's position list.
    pub target: usize,
    /// Position liquid is drawn from.
    pub from: GridPos,
    /// Position liquid is delivered to.
    pub to: GridPos,
    /// Volume per channel, µl.
    pub volume: f64,
}

/// One aspirate/dispense cycle before it is turned into steps.
#[derive(Debug, Clone, PartialEq)]
pub struct Cycle<'o> {
    /// Leg this cycle belongs to.
    pub kind: BatchKind,
    /// Labware aspirated from.
    pub source: &'o LabwareRef,
    /// Labware dispensed into.
    pub destination: &'o LabwareRef,
    /// Trips served by this cycle, in execution order.
    pub trips: Vec<Trip>,
    /// Mix after each dispense.
    pub mix: bool,
    /// Remove (0) or add (1) leg of a medium exchange; 0 elsewhere.
    pub leg: u8,
}

impl Cycle<'_> {
    /// Cycles with equal keys serve the same target and share tips.
    fn key(&self) -> (u8, usize) {
        (self.leg, self.trips.first().map_or(0, |t| t.target))
    }

    fn bulk(&self) -> f64 {
        self.trips.iter().map(|t| t.volume).sum()
    }
}

fn trips_for(volume: f64, capacity: f64, options: &TransferOptions) -> Vec<f64> {
    if options.multi_trip {
        split_trips(volume, capacity)
    } else {
        vec![volume]
    }
}

fn group<'o>(
    kind: BatchKind,
    source: &'o LabwareRef,
    destination: &'o LabwareRef,
    trips: Vec<Trip>,
    limit: usize,
    mix: bool,
    leg: u8,
) -> Vec<Cycle<'o>> {
    trips
        .chunks(limit.max(1))
        .map(|chunk| Cycle {
            kind,
            source,
            destination,
            trips: chunk.to_vec(),
            mix,
            leg,
        })
        .collect()
}

/// The cycles a liquid-handling operation runs, in order. Empty for tip operations.
pub fn cycles(op: &Operation, tip_capacity: f64) -> Vec<Cycle<'_>> {
    let (Some(volume), Some(options)) = (op.volume(), op.options()) else {
        return Vec::new();
    };
    let per_trip = trips_for(volume, tip_capacity, options);
    let largest = per_trip.iter().copied().fold(0.0, f64::max);
    let limit = batch_limit(options, largest, tip_capacity);

    let expand = |positions: &[GridPos], fixed: GridPos, outward: bool| -> Vec<Trip> {
        positions
            .iter()
            .enumerate()
            .flat_map(|(target, pos)| {
                per_trip.iter().map(move |v| Trip {
                    target,
                    from: if outward { fixed } else { *pos },
                    to: if outward { *pos } else { fixed },
                    volume: *v,
                })
            })
            .collect()
    };

    match op {
        Operation::AddMedium {
            source,
            source_position,
            destination,
            destination_positions,
            ..
        } => group(
            BatchKind::OneToMany,
            source,
            destination,
            expand(destination_positions, *source_position, true),
            limit,
            options.mixing,
            0,
        ),
        Operation::RemoveMedium {
            source,
            source_positions,
            destination,
            destination_position,
            ..
        } => group(
            BatchKind::ManyToOne,
            source,
            destination,
            expand(source_positions, *destination_position, false),
            limit,
            options.mixing,
            0,
        ),
        Operation::TransferPlateToPlate {
            source,
            source_positions,
            destination,
            destination_positions,
            ..
        } => {
            let trips: Vec<Trip> = source_positions
                .iter()
                .zip(destination_positions)
                .enumerate()
                .flat_map(|(target, (from, to))| {
                    per_trip.iter().map(move |v| Trip {
                        target,
                        from: *from,
                        to: *to,
                        volume: *v,
                    })
                })
                .collect();
            group(
                BatchKind::OneToOne,
                source,
                destination,
                trips,
                1,
                options.mixing,
                0,
            )
        }
        Operation::RemoveAndAdd {
            plate,
            plate_positions,
            waste,
            waste_position,
            medium,
            medium_position,
            ..
        } => {
            let mut out = Vec::new();
            for (chunk_index, chunk) in plate_positions.chunks(limit.max(1)).enumerate() {
                let offset = chunk_index * limit.max(1);
                let reindex = |mut trips: Vec<Trip>| {
                    for trip in &mut trips {
                        trip.target += offset;
                    }
                    trips
                };
                out.extend(group(
                    BatchKind::ManyToOne,
                    plate,
                    waste,
                    reindex(expand(chunk, *waste_position, false)),
                    limit,
                    false,
                    0,
                ));
                out.extend(group(
                    BatchKind::OneToMany,
                    medium,
                    plate,
                    reindex(expand(chunk, *medium_position, true)),
                    limit,
                    options.mixing,
                    1,
                ));
            }
            out
        }
        _ => Vec::new(),
    }
}

/// Number of tip changes a liquid-handling operation inserts.
pub(crate) fn tip_change_count(op: &Operation, pipettor: &PipettorState) -> usize {
    if !op.options().is_some_and(|o| o.change_tips) {
        return 0;
    }
    let cycles = cycles(op, pipettor.tip_capacity());
    cycles
        .windows(2)
        .filter(|pair| pair[0].key() != pair[1].key())
        .count()
}

/// Turns operations into plans against a deck and pipettor snapshot.
pub struct Planner<'a> {
    deck: &'a Deck,
    pipettor: &'a PipettorState,
}

impl<'a> Planner<'a> {
    /// Plan against a snapshot of `deck` and `pipettor`; neither is modified.
    pub fn new(deck: &'a Deck, pipettor: &'a PipettorState) -> Self {
        Self { deck, pipettor }
    }

    /// Expand `op` into primitive steps.
    ///
    /// Assumes `op` passed the [`Validator`]. Fails on an unreachable head height or when
    /// the holder cannot supply the tips a tip change needs.
    pub fn plan(&self, op: &Operation) -> AppResult<Plan> {
        let mut builder = Builder {
            deck: self.deck,
            pipettor: self.pipettor,
            has_tip: self.pipettor.has_tip(),
            plan: Plan::new(op.name()),
        };

        match op {
            Operation::PickTips { holder, position } => {
                let mut ledger = builder.ledger(&holder.id)?;
                let pos = match position {
                    Some(pos) => ledger.claim_at(TipAction::Pick, *pos)?,
                    None => ledger.take()?,
                };
                builder.pick(&holder.id, pos)?;
            }
            Operation::ReturnTips { holder, position } => {
                let mut ledger = builder.ledger(&holder.id)?;
                let pos = match position {
                    Some(pos) => ledger.claim_at(TipAction::Return, *pos)?,
                    None => ledger.stow()?,
                };
                builder.stow(&holder.id, pos)?;
            }
            Operation::ReplaceTips {
                holder,
                pick_holder,
                return_position,
                pick_position,
            } => {
                let mut ledger = builder.ledger(&holder.id)?;
                let returned = match return_position {
                    Some(pos) => ledger.claim_at(TipAction::Return, *pos)?,
                    None => ledger.stow()?,
                };
                builder.stow(&holder.id, returned)?;

                let pick_id = pick_holder.as_ref().map_or(&holder.id, |p| &p.id);
                if pick_id != &holder.id {
                    ledger = builder.ledger(pick_id)?;
                }
                let picked = match pick_position {
                    Some(pos) => ledger.claim_at(TipAction::Pick, *pos)?,
                    None => ledger.take()?,
                };
                builder.pick(pick_id, picked)?;
            }
            Operation::DiscardTips { dropzone } => builder.discard(&dropzone.id)?,
            _ => builder.liquid(op)?,
        }

        let plan = builder.plan;
        tracing::info!(
            operation = op.name(),
            steps = plan.len(),
            batches = plan.batches.len(),
            "Plan ready"
        );
        Ok(plan)
    }
}

struct Builder<'a> {
    deck: &'a Deck,
    pipettor: &'a PipettorState,
    /// Tip state as it will be at the current point of the plan.
    has_tip: bool,
    plan: Plan,
}

impl<'a> Builder<'a> {
    fn ledger(&self, holder: &LabwareId) -> AppResult<TipLedger> {
        Ok(TipLedger::new(
            self.deck.labware(holder)?,
            self.pipettor.channel_count(),
        ))
    }

    fn push(&mut self, action: Action) {
        self.plan.steps.push(PlannedStep::motion(action));
    }

    fn push_with(&mut self, action: Action, effect: Effect) {
        self.plan.steps.push(PlannedStep { action, effect });
    }

    /// Head Z for an absolute height above the deck floor.
    fn head_z(&self, id: &LabwareId, bottom: f64, relative: f64) -> AppResult<f64> {
        let mut absolute = bottom + relative;
        if absolute < bottom {
            absolute = bottom + 1.0;
        }
        let tip = if self.has_tip {
            self.pipettor.tip_length()
        } else {
            0.0
        };
        let z = self.deck.range_z - absolute - tip;
        let limit = self.pipettor.z_max();
        if !(0.0..=limit).contains(&z) {
            return Err(ValidationFailure::new(
                id.clone(),
                ValidationReason::AxisLimit {
                    axis: 'Z',
                    target: z,
                    limit,
                },
            )
            .into());
        }
        Ok(z)
    }

    fn item_z(&self, labware: &Labware, pos: GridPos, relative: f64) -> AppResult<f64> {
        let bottom = self.deck.item_bottom(&labware.id, pos)?;
        self.head_z(&labware.id, bottom, relative)
    }

    /// XY for a head spanning `positions`: the midpoint of the first and last.
    fn span_xy(&self, id: &LabwareId, positions: &[GridPos]) -> AppResult<(f64, f64)> {
        let (first, last) = match (positions.first(), positions.last()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => return Err(PipettorError::NotFound(id.clone())),
        };
        let (x1, y1) = self.deck.item_xy(id, first)?;
        let (x2, y2) = self.deck.item_xy(id, last)?;
        Ok(((x1 + x2) / 2.0, (y1 + y2) / 2.0))
    }

    fn block(&self, start: GridPos) -> Vec<GridPos> {
        (0..self.pipettor.channel_count())
            .map(|i| start.down(i))
            .collect()
    }

    fn transfers(
        &self,
        labware: &Labware,
        pos: GridPos,
        volume: f64,
    ) -> AppResult<(Vec<GridPos>, Vec<ItemTransfer>)> {
        let items = labware
            .channel_items(pos, self.pipettor.channel_count())
            .ok_or_else(|| {
                PipettorError::from(ValidationFailure::new(
                    labware.id.clone(),
                    ValidationReason::InvalidPosition {
                        column: pos.column,
                        row: pos.row,
                    },
                ))
            })?;
        let positions = items.iter().map(|(p, _)| *p).collect();
        let transfers = items
            .into_iter()
            .map(|(item, channels)| ItemTransfer {
                item: ItemAddress::new(&labware.id, item),
                channels,
                volume_per_channel: volume,
            })
            .collect();
        Ok((positions, transfers))
    }

    // Tip handling -----------------------------------------------------------

    fn pick(&mut self, holder: &LabwareId, pos: GridPos) -> AppResult<()> {
        let labware = self.deck.labware(holder)?;
        let block = self.block(pos);
        let (x, y) = self.span_xy(holder, &block)?;
        let z_limit = self.item_z(labware, pos, labware.remove_height().unwrap_or(0.0))?;
        let items = block
            .into_iter()
            .map(|p| ItemAddress::new(holder, p))
            .collect();
        self.push(Action::MoveXy { x, y });
        self.push_with(Action::PickTip { z_limit }, Effect::TakeTips(items));
        self.has_tip = true;
        self.push(Action::MoveZ { z: 0.0 });
        Ok(())
    }

    fn stow(&mut self, holder: &LabwareId, pos: GridPos) -> AppResult<()> {
        let labware = self.deck.labware(holder)?;
        let block = self.block(pos);
        let (x, y) = self.span_xy(holder, &block)?;
        let z = self.item_z(labware, pos, labware.add_height().unwrap_or(0.0))?;
        let items = block
            .into_iter()
            .map(|p| ItemAddress::new(holder, p))
            .collect();
        self.push(Action::MoveXy { x, y });
        self.push(Action::MoveZ { z });
        self.push_with(Action::EjectTip, Effect::StowTips(items));
        self.has_tip = false;
        self.push(Action::MoveZ { z: 0.0 });
        Ok(())
    }

    fn discard(&mut self, dropzone: &LabwareId) -> AppResult<()> {
        let labware = self.deck.labware(dropzone)?;
        let (x, y) = self.deck.labware_center(dropzone)?;
        let top = self.deck.labware_top(dropzone)?;
        let z = self.head_z(dropzone, top, labware.drop_height().unwrap_or(0.0))?;
        self.push(Action::MoveXy { x, y });
        self.push(Action::MoveZ { z });
        self.push_with(Action::EjectTip, Effect::DropTips);
        self.has_tip = false;
        self.push(Action::MoveZ { z: 0.0 });
        Ok(())
    }

    // Liquid handling --------------------------------------------------------

    fn aspirate(&mut self, reference: &LabwareRef, pos: GridPos, volume: f64) -> AppResult<()> {
        let labware = self.deck.labware(&reference.id)?;
        let (positions, transfers) = self.transfers(labware, pos, volume)?;
        let (x, y) = self.span_xy(&reference.id, &positions)?;
        let z = self.item_z(labware, pos, labware.remove_height().unwrap_or(0.0))?;
        self.push(Action::MoveXy { x, y });
        if self.pipettor.surface_detection() {
            self.push(Action::MoveToSurface {
                limit: z,
                distance: self.pipettor.surface_distance(),
            });
        } else {
            self.push(Action::MoveZ { z });
        }
        self.push_with(Action::Aspirate { volume }, Effect::Draw(transfers));
        self.push(Action::MoveZ { z: 0.0 });
        Ok(())
    }

    fn dispense(
        &mut self,
        reference: &LabwareRef,
        pos: GridPos,
        volume: f64,
        mix: bool,
    ) -> AppResult<()> {
        let labware = self.deck.labware(&reference.id)?;
        let (positions, transfers) = self.transfers(labware, pos, volume)?;
        let (x, y) = self.span_xy(&reference.id, &positions)?;
        let z = self.item_z(labware, pos, labware.add_height().unwrap_or(0.0))?;
        self.push(Action::MoveXy { x, y });
        self.push(Action::MoveZ { z });
        self.push_with(Action::Dispense { volume }, Effect::Deposit(transfers));
        if mix {
            self.push_with(Action::Aspirate { volume }, Effect::Mix);
            self.push_with(Action::Dispense { volume }, Effect::Mix);
        }
        self.push(Action::MoveZ { z: 0.0 });
        Ok(())
    }

    fn emit(&mut self, cycle: &Cycle<'_>) -> AppResult<()> {
        let Some(first) = cycle.trips.first().copied() else {
            return Ok(());
        };
        let bulk = cycle.bulk();
        match cycle.kind {
            BatchKind::OneToMany => {
                self.aspirate(cycle.source, first.from, bulk)?;
                for trip in &cycle.trips {
                    self.dispense(cycle.destination, trip.to, trip.volume, cycle.mix)?;
                }
            }
            BatchKind::ManyToOne => {
                for trip in &cycle.trips {
                    self.aspirate(cycle.source, trip.from, trip.volume)?;
                }
                self.dispense(cycle.destination, first.to, bulk, cycle.mix)?;
            }
            BatchKind::OneToOne => {
                self.aspirate(cycle.source, first.from, first.volume)?;
                self.dispense(cycle.destination, first.to, first.volume, cycle.mix)?;
            }
        }
        self.plan.batches.push(BatchRecord {
            kind: cycle.kind,
            bulk_volume: bulk,
            target_volumes: cycle.trips.iter().map(|t| t.volume).collect(),
        });
        Ok(())
    }

    fn liquid(&mut self, op: &Operation) -> AppResult<()> {
        let cycles = cycles(op, self.pipettor.tip_capacity());
        let change_tips = op.options().is_some_and(|o| o.change_tips);
        let mut ledger = None;

        for (index, cycle) in cycles.iter().enumerate() {
            if change_tips && index > 0 && cycles[index - 1].key() != cycle.key() {
                if ledger.is_none() {
                    let holder = Validator::new(self.deck, self.pipettor).change_holder(op)?;
                    ledger = Some(TipLedger::new(holder, self.pipettor.channel_count()));
                }
                if let Some(ledger) = ledger.as_mut() {
                    self.change_tips(ledger)?;
                }
            }
            self.emit(cycle)?;
        }
        Ok(())
    }

    fn change_tips(&mut self, ledger: &mut TipLedger) -> AppResult<()> {
        let holder = ledger.holder().id.clone();
        match self.deck.dropzone() {
            Some(zone) => {
                let zone = zone.id.clone();
                self.discard(&zone)?;
            }
            None => {
                let pos = ledger.stow()?;
                self.stow(&holder, pos)?;
            }
        }
        let pos = ledger.take()?;
        self.pick(&holder, pos)
    }
}
