//! Shared deck builders for the integration tests.
//!
//! Heights are chosen so every item is reachable with 1000 µl tips (90 mm) on a deck with
//! 100 mm of Z travel.

#![allow(dead_code)]

use std::sync::Arc;

use pipettor_plus::hardware::SimulatedPipettor;
use pipettor_plus::labware::{
    ContentMap, Deck, Dimensions, GridLayout, GridPos, IndividualPipetteHolder, Labware,
    LabwareId, LabwareType, Point, Reservoir, Slot, Well,
};
use pipettor_plus::{Engine, LabwareRef, Operation, PipettorConfig, TransferOptions};

pub const PLATE: &str = "plate_1";
pub const DEEP: &str = "deep_1";
pub const TIPS: &str = "tips_1";
pub const RESERVOIRS: &str = "reservoirs_1";
pub const DROPZONE: &str = "dropzone_1";
pub const PER_TIP: &str = "per_tip_1";

/// Medium reservoir hook.
pub const MEDIUM: GridPos = GridPos { column: 0, row: 0 };
/// Waste reservoir hook.
pub const WASTE: GridPos = GridPos { column: 1, row: 0 };

pub fn pos(column: usize, row: usize) -> GridPos {
    GridPos::new(column, row)
}

/// `count` positions in column-major order starting at the top-left well.
pub fn wells(count: usize) -> Vec<GridPos> {
    (0..count).map(|i| pos(i / 8, i % 8)).collect()
}

pub fn plate(id: &str) -> Labware {
    Labware::plate(
        id,
        Dimensions::new(120.0, 80.0, 14.0),
        GridLayout::new(12, 8, 9.0, 9.0),
        Well::template(Dimensions::new(7.0, 7.0, 10.0), 1000.0),
    )
}

pub fn deep_plate(id: &str) -> Labware {
    Labware::plate(
        id,
        Dimensions::new(40.0, 20.0, 14.0),
        GridLayout::new(2, 1, 18.0, 18.0),
        Well::template(Dimensions::new(16.0, 16.0, 10.0), 2000.0),
    )
}

pub fn tips(id: &str) -> Labware {
    Labware::pipette_holder(
        id,
        Dimensions::new(120.0, 80.0, 50.0),
        GridLayout::new(12, 8, 9.0, 9.0),
        IndividualPipetteHolder::template(Dimensions::new(7.0, 7.0, 45.0), false),
    )
}

/// Two shared reservoirs: medium at column 0, empty waste at column 1.
pub fn reservoirs(id: &str) -> Labware {
    Labware::reservoir_holder(
        id,
        Dimensions::new(80.0, 80.0, 40.0),
        GridLayout::new(2, 1, 40.0, 0.0),
        Reservoir::template(Dimensions::new(35.0, 75.0, 38.0), 30_000.0),
        false,
    )
    .with_content(MEDIUM, "medium", 20_000.0)
    .unwrap()
}

/// One medium reservoir per channel row; row `i` holds `fills[i]` µl.
pub fn per_tip_reservoirs(id: &str, fills: [f64; 8]) -> Labware {
    let mut holder = Labware::reservoir_holder(
        id,
        Dimensions::new(20.0, 80.0, 40.0),
        GridLayout::new(1, 8, 9.0, 9.0),
        Reservoir::template(Dimensions::new(8.0, 8.0, 38.0), 2000.0),
        true,
    );
    for (row, fill) in fills.into_iter().enumerate() {
        holder = holder.with_content(pos(0, row), "medium", fill).unwrap();
    }
    holder
}

pub fn dropzone(id: &str) -> Labware {
    Labware::tip_dropzone(id, Dimensions::new(60.0, 60.0, 5.0), 2.0)
}

/// Plate, deep-well plate, tips and reservoirs; no dropzone.
pub fn deck() -> Deck {
    let mut deck = Deck::new("test_deck", 100.0)
        .with_slot(Slot::new("A", Point::new(0.0, 0.0)))
        .with_slot(Slot::new("B", Point::new(130.0, 0.0)))
        .with_slot(Slot::new("C", Point::new(260.0, 0.0)))
        .with_slot(Slot::new("D", Point::new(0.0, 100.0)))
        .with_slot(Slot::new("E", Point::new(130.0, 100.0)));
    deck.place_labware("A", plate(PLATE)).unwrap();
    deck.place_labware("B", tips(TIPS)).unwrap();
    deck.place_labware("C", reservoirs(RESERVOIRS)).unwrap();
    deck.place_labware("D", deep_plate(DEEP)).unwrap();
    deck
}

pub fn deck_with_dropzone() -> Deck {
    let mut deck = deck();
    deck.place_labware("E", dropzone(DROPZONE)).unwrap();
    deck
}

/// Replace a placed labware, keeping its slot.
pub fn replace(deck: &mut Deck, labware: Labware) {
    let slot = deck.slot_of(&labware.id).unwrap().id.clone();
    deck.remove_labware(&labware.id).unwrap();
    deck.place_labware(&slot, labware).unwrap();
}

pub fn config(channels: usize) -> PipettorConfig {
    let mut config = PipettorConfig::default();
    if channels > 1 {
        config.pipettor.multichannel = true;
        config.pipettor.channels_in_multi = channels;
    }
    config
}

pub fn simulator(channels: usize) -> Arc<SimulatedPipettor> {
    Arc::new(SimulatedPipettor::new(channels, 1000.0))
}

/// Connect an engine for `sim`, configured with the same channel count.
pub async fn connect_with(sim: Arc<SimulatedPipettor>, channels: usize, deck: Deck) -> Engine {
    Engine::connect(sim, deck, &config(channels)).await.unwrap()
}

pub async fn connect(channels: usize, deck: Deck) -> (Engine, Arc<SimulatedPipettor>) {
    let sim = simulator(channels);
    let engine = connect_with(sim.clone(), channels, deck).await;
    (engine, sim)
}

pub fn plate_ref() -> LabwareRef {
    LabwareRef::new(PLATE, LabwareType::Plate)
}

pub fn deep_ref() -> LabwareRef {
    LabwareRef::new(DEEP, LabwareType::Plate)
}

pub fn tips_ref() -> LabwareRef {
    LabwareRef::new(TIPS, LabwareType::PipetteHolder)
}

pub fn reservoirs_ref() -> LabwareRef {
    LabwareRef::new(RESERVOIRS, LabwareType::ReservoirHolder)
}

pub fn per_tip_ref() -> LabwareRef {
    LabwareRef::new(PER_TIP, LabwareType::ReservoirHolder)
}

pub fn dropzone_ref() -> LabwareRef {
    LabwareRef::new(DROPZONE, LabwareType::TipDropzone)
}

pub fn pick_tips() -> Operation {
    Operation::PickTips {
        holder: tips_ref(),
        position: None,
    }
}

pub fn add_medium(volume: f64, targets: Vec<GridPos>, options: TransferOptions) -> Operation {
    Operation::AddMedium {
        source: reservoirs_ref(),
        source_position: MEDIUM,
        destination: plate_ref(),
        destination_positions: targets,
        volume,
        options,
    }
}

/// Add medium from the per-tip reservoirs, one row per channel.
pub fn add_from_per_tip(volume: f64, targets: Vec<GridPos>) -> Operation {
    Operation::AddMedium {
        source: per_tip_ref(),
        source_position: pos(0, 0),
        destination: plate_ref(),
        destination_positions: targets,
        volume,
        options: TransferOptions::default(),
    }
}

pub fn remove_medium(
    source: LabwareRef,
    volume: f64,
    sources: Vec<GridPos>,
    options: TransferOptions,
) -> Operation {
    Operation::RemoveMedium {
        source,
        source_positions: sources,
        destination: reservoirs_ref(),
        destination_position: WASTE,
        volume,
        options,
    }
}

pub fn content<'d>(deck: &'d Deck, id: &str, at: GridPos) -> &'d ContentMap {
    deck.labware(&LabwareId::new(id))
        .unwrap()
        .content_at(at)
        .unwrap()
}

pub fn has_tip(deck: &Deck, id: &str, at: GridPos) -> bool {
    deck.labware(&LabwareId::new(id))
        .unwrap()
        .holder_at(at)
        .unwrap()
        .has_tip
}

/// Total liquid on the deck.
pub fn deck_volume(deck: &Deck) -> f64 {
    deck.labware_iter()
        .flat_map(|labware| {
            labware
                .item_positions()
                .into_iter()
                .filter_map(move |p| labware.content_at(p).map(ContentMap::total))
        })
        .sum()
}

pub fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-6,
        "expected {expected}, got {actual}"
    );
}
