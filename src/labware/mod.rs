//! Labware Model
//!
//! Labware comes in two tiers:
//!
//! - **Low-level** items are individually addressable: [`Well`], [`Reservoir`] and
//!   [`IndividualPipetteHolder`].
//! - **High-level** labware arranges low-level items on a [`Grid`]: plates, pipette
//!   holders and reservoir holders. Stacks and tip dropzones carry no items.
//!
//! [`Labware`] is a closed set of kinds with capability predicates, so the engine never
//! needs open-ended type checks. Operations address labware by [`LabwareId`] and items by
//! [`GridPos`]; child ids are derived as `"{parent}_{column}:{row}"`.
//!
//! Runtime state (content maps and tip flags) is only changed through the crate-private
//! accessors used by the sequencer. Public builders exist for setting up initial state
//! before labware is placed on a [`Deck`].

mod content;
mod deck;
mod grid;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, ValidationFailure, ValidationReason};

pub use content::{ContentMap, VOLUME_TOLERANCE};
pub use deck::{Deck, Located, Point, Slot};
pub use grid::{Grid, GridLayout, GridPos};

/// Default well capacity, µl.
pub const DEFAULT_WELL_CAPACITY: f64 = 1000.0;
/// Default reservoir capacity, µl.
pub const DEFAULT_RESERVOIR_CAPACITY: f64 = 30_000.0;

/// Globally unique labware identifier, stable across save and load.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabwareId(String);

impl LabwareId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh random id with a kind prefix, e.g. `plate_3f2a9c1e`.
    pub fn generate(prefix: &str) -> Self {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{prefix}_{}", &uuid[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Id of the child at `pos`.
    pub fn child(&self, pos: GridPos) -> LabwareId {
        LabwareId(format!("{}_{}", self.0, pos))
    }
}

impl fmt::Display for LabwareId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LabwareId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for LabwareId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&LabwareId> for LabwareId {
    fn from(id: &LabwareId) -> Self {
        id.clone()
    }
}

/// Every labware kind, both tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LabwareType {
    Well,
    IndividualPipetteHolder,
    Reservoir,
    Plate,
    PipetteHolder,
    ReservoirHolder,
    Stack,
    TipDropzone,
}

impl LabwareType {
    pub fn is_low_level(self) -> bool {
        matches!(
            self,
            LabwareType::Well | LabwareType::IndividualPipetteHolder | LabwareType::Reservoir
        )
    }
}

impl fmt::Display for LabwareType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LabwareType::Well => "Well",
            LabwareType::IndividualPipetteHolder => "IndividualPipetteHolder",
            LabwareType::Reservoir => "Reservoir",
            LabwareType::Plate => "Plate",
            LabwareType::PipetteHolder => "PipetteHolder",
            LabwareType::ReservoirHolder => "ReservoirHolder",
            LabwareType::Stack => "Stack",
            LabwareType::TipDropzone => "TipDropzone",
        };
        f.write_str(name)
    }
}

/// Outer size, mm.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Dimensions {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Dimensions {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// Horizontal access offset, mm.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Offset {
    pub x: f64,
    pub y: f64,
}

impl Offset {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// One well of a plate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Well {
    pub id: LabwareId,
    pub size: Dimensions,
    #[serde(default)]
    pub offset: Offset,
    pub content: ContentMap,
}

impl Well {
    /// Template for [`Labware::plate`]; the id is assigned per grid position.
    pub fn template(size: Dimensions, capacity: f64) -> Self {
        Self {
            id: LabwareId::new(""),
            size,
            offset: Offset::default(),
            content: ContentMap::new(capacity),
        }
    }
}

/// One reservoir on a reservoir holder hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservoir {
    pub id: LabwareId,
    pub size: Dimensions,
    #[serde(default)]
    pub offset: Offset,
    pub content: ContentMap,
}

impl Reservoir {
    /// Template for [`Labware::reservoir_holder`]; the id is assigned per hook.
    pub fn template(size: Dimensions, capacity: f64) -> Self {
        Self {
            id: LabwareId::new(""),
            size,
            offset: Offset::default(),
            content: ContentMap::new(capacity),
        }
    }
}

/// One tip position of a pipette holder.
///
/// `has_tip` is the position's tip-state flag: picking requires it clear and sets it,
/// returning requires it set and clears it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndividualPipetteHolder {
    pub id: LabwareId,
    pub size: Dimensions,
    #[serde(default)]
    pub offset: Offset,
    pub has_tip: bool,
}

impl IndividualPipetteHolder {
    /// Template for [`Labware::pipette_holder`]; the id is assigned per grid position.
    pub fn template(size: Dimensions, has_tip: bool) -> Self {
        Self {
            id: LabwareId::new(""),
            size,
            offset: Offset::default(),
            has_tip,
        }
    }
}

/// A grid of wells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plate {
    pub wells: Grid<Well>,
    pub add_height: f64,
    pub remove_height: f64,
}

/// A grid of tip positions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipetteHolder {
    pub holders: Grid<IndividualPipetteHolder>,
    pub add_height: f64,
    pub remove_height: f64,
}

/// A grid of hooks, each optionally carrying a reservoir.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservoirHolder {
    pub reservoirs: Grid<Option<Reservoir>>,
    pub add_height: f64,
    pub remove_height: f64,
    /// Each channel needs its own reservoir; otherwise all channels share one.
    #[serde(default)]
    pub one_reservoir_per_tip: bool,
}

/// Where used tips are dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TipDropzone {
    /// Eject height above the dropzone top, mm.
    pub drop_height: f64,
}

/// Kind-specific part of a [`Labware`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LabwareKind {
    Plate(Plate),
    PipetteHolder(PipetteHolder),
    ReservoirHolder(ReservoirHolder),
    Stack,
    TipDropzone(TipDropzone),
}

/// A top-level labware placed in a deck slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Labware {
    pub id: LabwareId,
    pub size: Dimensions,
    #[serde(default)]
    pub offset: Offset,
    #[serde(default)]
    pub stackable: bool,
    #[serde(flatten)]
    pub kind: LabwareKind,
}

impl Labware {
    fn with_kind(id: LabwareId, size: Dimensions, kind: LabwareKind) -> Self {
        Self {
            id,
            size,
            offset: Offset::default(),
            stackable: false,
            kind,
        }
    }

    /// A plate with `layout` copies of `well`.
    pub fn plate(
        id: impl Into<LabwareId>,
        size: Dimensions,
        layout: GridLayout,
        well: Well,
    ) -> Self {
        let id = id.into();
        let wells = Grid::from_fn(layout, |pos| Well {
            id: id.child(pos),
            ..well.clone()
        });
        Self::with_kind(
            id,
            size,
            LabwareKind::Plate(Plate {
                wells,
                add_height: -3.0,
                remove_height: -10.0,
            }),
        )
    }

    /// A pipette holder with `layout` copies of `holder`.
    pub fn pipette_holder(
        id: impl Into<LabwareId>,
        size: Dimensions,
        layout: GridLayout,
        holder: IndividualPipetteHolder,
    ) -> Self {
        let id = id.into();
        let holders = Grid::from_fn(layout, |pos| IndividualPipetteHolder {
            id: id.child(pos),
            ..holder.clone()
        });
        Self::with_kind(
            id,
            size,
            LabwareKind::PipetteHolder(PipetteHolder {
                holders,
                add_height: 0.0,
                remove_height: 0.0,
            }),
        )
    }

    /// A reservoir holder with a copy of `reservoir` on every hook.
    pub fn reservoir_holder(
        id: impl Into<LabwareId>,
        size: Dimensions,
        layout: GridLayout,
        reservoir: Reservoir,
        one_reservoir_per_tip: bool,
    ) -> Self {
        let id = id.into();
        let reservoirs = Grid::from_fn(layout, |pos| {
            Some(Reservoir {
                id: id.child(pos),
                ..reservoir.clone()
            })
        });
        Self::with_kind(
            id,
            size,
            LabwareKind::ReservoirHolder(ReservoirHolder {
                reservoirs,
                add_height: 0.0,
                remove_height: -45.0,
                one_reservoir_per_tip,
            }),
        )
    }

    pub fn stack(id: impl Into<LabwareId>, size: Dimensions) -> Self {
        Self::with_kind(id.into(), size, LabwareKind::Stack)
    }

    pub fn tip_dropzone(id: impl Into<LabwareId>, size: Dimensions, drop_height: f64) -> Self {
        Self::with_kind(
            id.into(),
            size,
            LabwareKind::TipDropzone(TipDropzone { drop_height }),
        )
    }

    pub fn with_offset(mut self, x: f64, y: f64) -> Self {
        self.offset = Offset::new(x, y);
        self
    }

    pub fn with_stackable(mut self, stackable: bool) -> Self {
        self.stackable = stackable;
        self
    }

    /// Set dispense (`add`) and aspirate/pick (`remove`) heights above the item bottom.
    /// Ignored for kinds without items.
    pub fn with_heights(mut self, add: f64, remove: f64) -> Self {
        match &mut self.kind {
            LabwareKind::Plate(p) => {
                p.add_height = add;
                p.remove_height = remove;
            }
            LabwareKind::PipetteHolder(p) => {
                p.add_height = add;
                p.remove_height = remove;
            }
            LabwareKind::ReservoirHolder(r) => {
                r.add_height = add;
                r.remove_height = remove;
            }
            LabwareKind::Stack | LabwareKind::TipDropzone(_) => {}
        }
        self
    }

    /// Initial content for the item at `pos`.
    pub fn with_content(mut self, pos: GridPos, content_type: &str, volume: f64) -> AppResult<Self> {
        let id = self.id.clone();
        let content = self
            .content_at_mut(pos)
            .ok_or_else(|| invalid_position(&id, pos))?;
        content.add(content_type, volume)?;
        Ok(self)
    }

    /// Initial content for every item.
    pub fn filled_with(mut self, content_type: &str, volume: f64) -> AppResult<Self> {
        let positions: Vec<GridPos> = self.item_positions();
        for pos in positions {
            if self.content_at(pos).is_some() {
                self = self.with_content(pos, content_type, volume)?;
            }
        }
        Ok(self)
    }

    /// Initial tip-state flag for the holder at `pos`.
    pub fn with_tip_flag(mut self, pos: GridPos, has_tip: bool) -> AppResult<Self> {
        let id = self.id.clone();
        let holder = self
            .holder_at_mut(pos)
            .ok_or_else(|| invalid_position(&id, pos))?;
        holder.has_tip = has_tip;
        Ok(self)
    }

    /// Remove the reservoir from a hook.
    pub fn without_reservoir(mut self, pos: GridPos) -> AppResult<Self> {
        let id = self.id.clone();
        let found = self.labware_type();
        let LabwareKind::ReservoirHolder(holder) = &mut self.kind else {
            return Err(ValidationFailure::new(
                id,
                ValidationReason::WrongType {
                    expected: LabwareType::ReservoirHolder.to_string(),
                    found: found.to_string(),
                },
            )
            .into());
        };
        let hook = holder
            .reservoirs
            .get_mut(pos)
            .ok_or_else(|| invalid_position(&id, pos))?;
        *hook = None;
        Ok(self)
    }

    pub fn labware_type(&self) -> LabwareType {
        match self.kind {
            LabwareKind::Plate(_) => LabwareType::Plate,
            LabwareKind::PipetteHolder(_) => LabwareType::PipetteHolder,
            LabwareKind::ReservoirHolder(_) => LabwareType::ReservoirHolder,
            LabwareKind::Stack => LabwareType::Stack,
            LabwareKind::TipDropzone(_) => LabwareType::TipDropzone,
        }
    }

    pub fn is_tip_holder(&self) -> bool {
        matches!(self.kind, LabwareKind::PipetteHolder(_))
    }

    pub fn is_liquid_container(&self) -> bool {
        matches!(
            self.kind,
            LabwareKind::Plate(_) | LabwareKind::ReservoirHolder(_)
        )
    }

    pub fn is_dropzone(&self) -> bool {
        matches!(self.kind, LabwareKind::TipDropzone(_))
    }

    /// True when all channels of a multi-channel head share the item at one position.
    pub fn shares_item_across_channels(&self) -> bool {
        matches!(&self.kind, LabwareKind::ReservoirHolder(r) if !r.one_reservoir_per_tip)
    }

    pub fn layout(&self) -> Option<GridLayout> {
        match &self.kind {
            LabwareKind::Plate(p) => Some(p.wells.layout()),
            LabwareKind::PipetteHolder(p) => Some(p.holders.layout()),
            LabwareKind::ReservoirHolder(r) => Some(r.reservoirs.layout()),
            LabwareKind::Stack | LabwareKind::TipDropzone(_) => None,
        }
    }

    /// Dispense or tip-return height above the item bottom.
    pub fn add_height(&self) -> Option<f64> {
        match &self.kind {
            LabwareKind::Plate(p) => Some(p.add_height),
            LabwareKind::PipetteHolder(p) => Some(p.add_height),
            LabwareKind::ReservoirHolder(r) => Some(r.add_height),
            LabwareKind::Stack | LabwareKind::TipDropzone(_) => None,
        }
    }

    /// Aspirate or tip-pick height above the item bottom.
    pub fn remove_height(&self) -> Option<f64> {
        match &self.kind {
            LabwareKind::Plate(p) => Some(p.remove_height),
            LabwareKind::PipetteHolder(p) => Some(p.remove_height),
            LabwareKind::ReservoirHolder(r) => Some(r.remove_height),
            LabwareKind::Stack | LabwareKind::TipDropzone(_) => None,
        }
    }

    pub fn drop_height(&self) -> Option<f64> {
        match &self.kind {
            LabwareKind::TipDropzone(d) => Some(d.drop_height),
            _ => None,
        }
    }

    /// Positions that carry an item (empty reservoir hooks excluded).
    pub fn item_positions(&self) -> Vec<GridPos> {
        match &self.kind {
            LabwareKind::Plate(p) => p.wells.iter().map(|(pos, _)| pos).collect(),
            LabwareKind::PipetteHolder(p) => p.holders.iter().map(|(pos, _)| pos).collect(),
            LabwareKind::ReservoirHolder(r) => r
                .reservoirs
                .iter()
                .filter(|(_, res)| res.is_some())
                .map(|(pos, _)| pos)
                .collect(),
            LabwareKind::Stack | LabwareKind::TipDropzone(_) => Vec::new(),
        }
    }

    pub fn has_item(&self, pos: GridPos) -> bool {
        self.item_id(pos).is_some()
    }

    /// Id, size and access offset of the item at `pos`.
    fn item_parts(&self, pos: GridPos) -> Option<(&LabwareId, Dimensions, Offset)> {
        match &self.kind {
            LabwareKind::Plate(p) => p.wells.get(pos).map(|w| (&w.id, w.size, w.offset)),
            LabwareKind::PipetteHolder(p) => {
                p.holders.get(pos).map(|h| (&h.id, h.size, h.offset))
            }
            LabwareKind::ReservoirHolder(r) => r
                .reservoirs
                .get(pos)
                .and_then(Option::as_ref)
                .map(|res| (&res.id, res.size, res.offset)),
            LabwareKind::Stack | LabwareKind::TipDropzone(_) => None,
        }
    }

    pub fn item_id(&self, pos: GridPos) -> Option<&LabwareId> {
        self.item_parts(pos).map(|(id, _, _)| id)
    }

    pub fn item_size(&self, pos: GridPos) -> Option<Dimensions> {
        self.item_parts(pos).map(|(_, size, _)| size)
    }

    /// Item center relative to the labware origin, mm.
    pub fn item_center(&self, pos: GridPos) -> Option<(f64, f64)> {
        let layout = self.layout()?;
        let (_, size, offset) = self.item_parts(pos)?;
        let (gx, gy) = layout.offset_of(pos);
        Some((
            self.offset.x + gx + offset.x + size.x / 2.0,
            self.offset.y + gy + offset.y + size.y / 2.0,
        ))
    }

    /// Items a head with `channels` channels touches when lowered at `start`, each with
    /// the channel indices it serves. A shared reservoir serves every channel; otherwise
    /// channel `i` addresses the item `i` rows below `start`.
    pub fn channel_items(&self, start: GridPos, channels: usize) -> Option<Vec<(GridPos, Vec<usize>)>> {
        let channels = channels.max(1);
        if self.shares_item_across_channels() {
            return self
                .has_item(start)
                .then(|| vec![(start, (0..channels).collect())]);
        }
        (0..channels)
            .map(|i| {
                let pos = start.down(i);
                self.has_item(pos).then(|| (pos, vec![i]))
            })
            .collect()
    }

    /// Grid position of a child item by id.
    pub fn child_position(&self, id: &LabwareId) -> Option<GridPos> {
        self.item_positions()
            .into_iter()
            .find(|pos| self.item_id(*pos) == Some(id))
    }

    /// Low-level type of the items this labware carries.
    pub fn child_type(&self) -> Option<LabwareType> {
        match self.kind {
            LabwareKind::Plate(_) => Some(LabwareType::Well),
            LabwareKind::PipetteHolder(_) => Some(LabwareType::IndividualPipetteHolder),
            LabwareKind::ReservoirHolder(_) => Some(LabwareType::Reservoir),
            LabwareKind::Stack | LabwareKind::TipDropzone(_) => None,
        }
    }

    pub fn content_at(&self, pos: GridPos) -> Option<&ContentMap> {
        match &self.kind {
            LabwareKind::Plate(p) => p.wells.get(pos).map(|w| &w.content),
            LabwareKind::ReservoirHolder(r) => r
                .reservoirs
                .get(pos)
                .and_then(Option::as_ref)
                .map(|res| &res.content),
            _ => None,
        }
    }

    pub(crate) fn content_at_mut(&mut self, pos: GridPos) -> Option<&mut ContentMap> {
        match &mut self.kind {
            LabwareKind::Plate(p) => p.wells.get_mut(pos).map(|w| &mut w.content),
            LabwareKind::ReservoirHolder(r) => r
                .reservoirs
                .get_mut(pos)
                .and_then(Option::as_mut)
                .map(|res| &mut res.content),
            _ => None,
        }
    }

    pub fn holder_at(&self, pos: GridPos) -> Option<&IndividualPipetteHolder> {
        match &self.kind {
            LabwareKind::PipetteHolder(p) => p.holders.get(pos),
            _ => None,
        }
    }

    pub(crate) fn holder_at_mut(&mut self, pos: GridPos) -> Option<&mut IndividualPipetteHolder> {
        match &mut self.kind {
            LabwareKind::PipetteHolder(p) => p.holders.get_mut(pos),
            _ => None,
        }
    }

    /// Whether the declared grids match their item counts.
    pub fn is_consistent(&self) -> bool {
        match &self.kind {
            LabwareKind::Plate(p) => p.wells.is_consistent(),
            LabwareKind::PipetteHolder(p) => p.holders.is_consistent(),
            LabwareKind::ReservoirHolder(r) => r.reservoirs.is_consistent(),
            LabwareKind::Stack | LabwareKind::TipDropzone(_) => true,
        }
    }
}

fn invalid_position(id: &LabwareId, pos: GridPos) -> ValidationFailure {
    ValidationFailure::new(
        id.clone(),
        ValidationReason::InvalidPosition {
            column: pos.column,
            row: pos.row,
        },
    )
}

/// A low-level item addressed through its parent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemAddress {
    pub labware: LabwareId,
    pub position: GridPos,
}

impl ItemAddress {
    pub fn new(labware: impl Into<LabwareId>, position: GridPos) -> Self {
        Self {
            labware: labware.into(),
            position,
        }
    }
}

impl fmt::Display for ItemAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.labware, self.position)
    }
}
