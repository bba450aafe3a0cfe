//! Deck and slots.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{GridPos, Labware, LabwareId, LabwareType};
use crate::error::{AppResult, PipettorError, ValidationFailure, ValidationReason};

/// Horizontal deck coordinate, mm.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// A placement position holding at most one top-level labware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    pub id: String,
    pub origin: Point,
    /// Height of the slot floor above the deck reference, mm.
    #[serde(default)]
    pub base_z: f64,
    #[serde(default)]
    pub labware: Option<Labware>,
}

impl Slot {
    pub fn new(id: impl Into<String>, origin: Point) -> Self {
        Self {
            id: id.into(),
            origin,
            base_z: 0.0,
            labware: None,
        }
    }

    pub fn with_base_z(mut self, base_z: f64) -> Self {
        self.base_z = base_z;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.labware.is_none()
    }
}

/// Result of resolving an id on the deck: the top-level labware, its slot, and the child
/// position when the id named an item.
#[derive(Debug, Clone, Copy)]
pub struct Located<'a> {
    pub slot: &'a Slot,
    pub labware: &'a Labware,
    pub position: Option<GridPos>,
}

impl Located<'_> {
    /// Type of whatever the id named.
    pub fn labware_type(&self) -> LabwareType {
        match self.position {
            Some(_) => self
                .labware
                .child_type()
                .unwrap_or_else(|| self.labware.labware_type()),
            None => self.labware.labware_type(),
        }
    }
}

/// The deck: ordered slots and the labware placed in them.
///
/// Placement and removal bump [`Deck::revision`]; an engine bound to an older revision
/// refuses to run until rebound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deck {
    pub id: String,
    /// Height of the Z travel reference above the deck floor, mm.
    pub range_z: f64,
    #[serde(default)]
    slots: Vec<Slot>,
    #[serde(skip)]
    revision: u64,
}

impl Deck {
    pub fn new(id: impl Into<String>, range_z: f64) -> Self {
        Self {
            id: id.into(),
            range_z,
            slots: Vec::new(),
            revision: 0,
        }
    }

    /// Add an empty slot. Slots with labware are accepted as loaded.
    pub fn with_slot(mut self, slot: Slot) -> Self {
        self.slots.push(slot);
        self
    }

    /// Read a deck from a JSON file and check its layout.
    pub fn load_json(path: impl AsRef<Path>) -> AppResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let deck: Deck = serde_json::from_str(&text)?;
        deck.validate_layout()?;
        Ok(deck)
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> AppResult<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// Every placed top-level labware, in slot order.
    pub fn labware_iter(&self) -> impl Iterator<Item = &Labware> {
        self.slots.iter().filter_map(|s| s.labware.as_ref())
    }

    /// Place `labware` in an empty slot.
    pub fn place_labware(&mut self, slot_id: &str, labware: Labware) -> AppResult<()> {
        if self.contains(&labware.id) {
            return Err(ValidationFailure::new(
                labware.id.clone(),
                ValidationReason::Request("labware id already on deck".to_string()),
            )
            .into());
        }
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.id == slot_id)
            .ok_or_else(|| PipettorError::NotFound(LabwareId::new(slot_id)))?;
        if let Some(occupant) = &slot.labware {
            return Err(ValidationFailure::new(
                labware.id.clone(),
                ValidationReason::Request(format!(
                    "slot '{slot_id}' is occupied by '{}'",
                    occupant.id
                )),
            )
            .into());
        }
        tracing::info!(slot = slot_id, labware_id = %labware.id, kind = %labware.labware_type(), "Labware placed");
        slot.labware = Some(labware);
        self.revision += 1;
        Ok(())
    }

    /// Take a labware off the deck.
    pub fn remove_labware(&mut self, id: &LabwareId) -> AppResult<Labware> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.labware.as_ref().is_some_and(|l| &l.id == id))
            .ok_or_else(|| PipettorError::NotFound(id.clone()))?;
        let labware = slot
            .labware
            .take()
            .ok_or_else(|| PipettorError::NotFound(id.clone()))?;
        tracing::info!(slot = %slot.id, labware_id = %id, "Labware removed");
        self.revision += 1;
        Ok(labware)
    }

    /// Resolve a top-level or child item id.
    pub fn locate(&self, id: &LabwareId) -> AppResult<Located<'_>> {
        for slot in &self.slots {
            let Some(labware) = &slot.labware else {
                continue;
            };
            if &labware.id == id {
                return Ok(Located {
                    slot,
                    labware,
                    position: None,
                });
            }
            if id.as_str().starts_with(labware.id.as_str()) {
                if let Some(pos) = labware.child_position(id) {
                    return Ok(Located {
                        slot,
                        labware,
                        position: Some(pos),
                    });
                }
            }
        }
        Err(PipettorError::NotFound(id.clone()))
    }

    /// Top-level labware by id.
    pub fn labware(&self, id: &LabwareId) -> AppResult<&Labware> {
        self.labware_iter()
            .find(|l| &l.id == id)
            .ok_or_else(|| PipettorError::NotFound(id.clone()))
    }

    pub(crate) fn labware_mut(&mut self, id: &LabwareId) -> AppResult<&mut Labware> {
        self.slots
            .iter_mut()
            .filter_map(|s| s.labware.as_mut())
            .find(|l| &l.id == id)
            .ok_or_else(|| PipettorError::NotFound(id.clone()))
    }

    pub fn slot_of(&self, id: &LabwareId) -> AppResult<&Slot> {
        self.slots
            .iter()
            .find(|s| s.labware.as_ref().is_some_and(|l| &l.id == id))
            .ok_or_else(|| PipettorError::NotFound(id.clone()))
    }

    pub fn contains(&self, id: &LabwareId) -> bool {
        self.locate(id).is_ok()
    }

    /// Top-level labware of one type, in slot order.
    pub fn of_type(&self, kind: LabwareType) -> Vec<&Labware> {
        self.labware_iter()
            .filter(|l| l.labware_type() == kind)
            .collect()
    }

    /// First tip dropzone on the deck.
    pub fn dropzone(&self) -> Option<&Labware> {
        self.labware_iter().find(|l| l.is_dropzone())
    }

    /// Absolute XY center of an item.
    pub fn item_xy(&self, id: &LabwareId, pos: GridPos) -> AppResult<(f64, f64)> {
        let slot = self.slot_of(id)?;
        let labware = self.labware(id)?;
        let (x, y) = labware
            .item_center(pos)
            .ok_or_else(|| invalid_position(id, pos))?;
        Ok((slot.origin.x + x, slot.origin.y + y))
    }

    /// Absolute XY center of a labware without items (dropzones, stacks).
    pub fn labware_center(&self, id: &LabwareId) -> AppResult<(f64, f64)> {
        let slot = self.slot_of(id)?;
        let labware = self.labware(id)?;
        Ok((
            slot.origin.x + labware.offset.x + labware.size.x / 2.0,
            slot.origin.y + labware.offset.y + labware.size.y / 2.0,
        ))
    }

    /// Height of an item's bottom above the deck floor.
    pub fn item_bottom(&self, id: &LabwareId, pos: GridPos) -> AppResult<f64> {
        let slot = self.slot_of(id)?;
        let labware = self.labware(id)?;
        let item = labware
            .item_size(pos)
            .ok_or_else(|| invalid_position(id, pos))?;
        Ok(slot.base_z + labware.size.z - item.z)
    }

    /// Height of a labware's top above the deck floor.
    pub fn labware_top(&self, id: &LabwareId) -> AppResult<f64> {
        let slot = self.slot_of(id)?;
        let labware = self.labware(id)?;
        Ok(slot.base_z + labware.size.z)
    }

    /// Check id uniqueness and grid consistency.
    pub fn validate_layout(&self) -> AppResult<()> {
        let mut seen = HashSet::new();
        for labware in self.labware_iter() {
            if !seen.insert(labware.id.clone()) {
                return Err(ValidationFailure::new(
                    labware.id.clone(),
                    ValidationReason::Request("duplicate labware id".to_string()),
                )
                .into());
            }
            if !labware.is_consistent() {
                return Err(ValidationFailure::new(
                    labware.id.clone(),
                    ValidationReason::Request("grid does not match its item count".to_string()),
                )
                .into());
            }
        }
        let mut slots = HashSet::new();
        for slot in &self.slots {
            if !slots.insert(slot.id.as_str()) {
                return Err(PipettorError::Config(format!("duplicate slot id '{}'", slot.id)));
            }
        }
        Ok(())
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labware::{Dimensions, GridLayout, Well};

    fn deck() -> Deck {
        Deck::new("deck", 120.0)
            .with_slot(Slot::new("s1", Point::new(10.0, 20.0)))
            .with_slot(Slot::new("s2", Point::new(150.0, 20.0)).with_base_z(5.0))
    }

    fn plate(id: &str) -> Labware {
        Labware::plate(
            id,
            Dimensions::new(127.0, 85.0, 14.0),
            GridLayout::new(12, 8, 9.0, 9.0),
            Well::template(Dimensions::new(8.0, 8.0, 10.0), 300.0),
        )
    }

    #[test]
    fn placement_bumps_revision_and_rejects_duplicates() {
        let mut deck = deck();
        deck.place_labware("s1", plate("p1")).unwrap();
        assert_eq!(deck.revision(), 1);
        assert!(deck.place_labware("s1", plate("p2")).is_err());
        assert!(deck.place_labware("s2", plate("p1")).is_err());
        assert!(matches!(
            deck.place_labware("nope", plate("p3")),
            Err(PipettorError::NotFound(_))
        ));

        deck.remove_labware(&LabwareId::new("p1")).unwrap();
        assert_eq!(deck.revision(), 2);
        assert!(!deck.contains(&LabwareId::new("p1")));
    }

    #[test]
    fn locate_resolves_children() {
        let mut deck = deck();
        deck.place_labware("s2", plate("p1")).unwrap();
        let found = deck.locate(&LabwareId::new("p1_2:3")).unwrap();
        assert_eq!(found.position, Some(GridPos::new(2, 3)));
        assert_eq!(found.labware_type(), LabwareType::Well);
        assert_eq!(found.slot.id, "s2");
        assert!(matches!(
            deck.locate(&LabwareId::new("p1_20:3")),
            Err(PipettorError::NotFound(_))
        ));
    }

    #[test]
    fn geometry_adds_slot_origin_and_base() {
        let mut deck = deck();
        deck.place_labware("s2", plate("p1")).unwrap();
        let id = LabwareId::new("p1");
        assert_eq!(deck.item_xy(&id, GridPos::new(0, 0)).unwrap(), (154.0, 24.0));
        assert_eq!(deck.item_bottom(&id, GridPos::new(0, 0)).unwrap(), 9.0);
    }

    #[test]
    fn revision_is_not_persisted() {
        let mut deck = deck();
        deck.place_labware("s1", plate("p1")).unwrap();
        let json = serde_json::to_string(&deck).unwrap();
        let back: Deck = serde_json::from_str(&json).unwrap();
        assert_eq!(back.revision(), 0);
        assert!(back.validate_layout().is_ok());
        assert!(back.contains(&LabwareId::new("p1_0:0")));
    }
}
