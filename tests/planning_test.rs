//! Integration tests for batch and trip planning
//!
//! Plans are produced through the engine after a real pick so the pipettor state the planner
//! sees matches what a user would have at that point.

mod common;

use common::*;
use pipettor_plus::engine::{Action, BatchKind, Effect, TipAction};
use pipettor_plus::labware::{Dimensions, GridLayout, IndividualPipetteHolder, Labware, LabwareId};
use pipettor_plus::{Operation, TransferOptions};

fn count(plan: &pipettor_plus::Plan, wanted: fn(&Action) -> bool) -> usize {
    plan.actions().filter(|a| wanted(a)).count()
}

// ============================================================================
// Batching
// ============================================================================

#[tokio::test]
async fn test_add_medium_batches_by_limit() {
    let (engine, _sim) = connect(1, deck()).await;
    engine.submit(&pick_tips()).await.unwrap();

    let plan = engine
        .plan(&add_medium(190.0, wells(10), TransferOptions::default()))
        .unwrap();

    assert_eq!(plan.batches.len(), 2);
    for batch in &plan.batches {
        assert_eq!(batch.kind, BatchKind::OneToMany);
        assert_close(batch.bulk_volume, 950.0);
        assert_eq!(batch.len(), 5);
    }
    assert_eq!(plan.aspirations(), vec![950.0, 950.0]);
    assert_eq!(plan.dispenses(), vec![190.0; 10]);
    // Two cycles of one aspirate and five dispenses, four steps each.
    assert_eq!(plan.len(), 48);
}

#[tokio::test]
async fn test_batch_size_bounded_by_tip_fit() {
    let (engine, _sim) = connect(1, deck()).await;
    engine.submit(&pick_tips()).await.unwrap();

    // Three trips of 300 fit one 1000 µl tip, even with a larger batch limit.
    let options = TransferOptions::default().with_max_batch_size(8);
    let plan = engine.plan(&add_medium(300.0, wells(7), options)).unwrap();

    let sizes: Vec<usize> = plan.batches.iter().map(|b| b.len()).collect();
    assert_eq!(sizes, vec![3, 3, 1]);
    assert_eq!(plan.aspirations(), vec![900.0, 900.0, 300.0]);
}

#[tokio::test]
async fn test_batch_mode_disabled_gives_one_cycle_per_target() {
    let (engine, _sim) = connect(1, deck()).await;
    engine.submit(&pick_tips()).await.unwrap();

    let options = TransferOptions::default().with_batch_mode(false);
    let plan = engine.plan(&add_medium(100.0, wells(4), options)).unwrap();

    assert_eq!(plan.batches.len(), 4);
    assert_eq!(plan.aspirations(), vec![100.0; 4]);
}

// ============================================================================
// Trips
// ============================================================================

#[tokio::test]
async fn test_remove_medium_splits_into_trips() {
    let mut layout = deck();
    replace(
        &mut layout,
        deep_plate(DEEP)
            .with_content(pos(0, 0), "medium", 1500.0)
            .unwrap(),
    );
    let (engine, _sim) = connect(1, layout).await;
    engine.submit(&pick_tips()).await.unwrap();

    let plan = engine
        .plan(&remove_medium(
            deep_ref(),
            1500.0,
            vec![pos(0, 0)],
            TransferOptions::default(),
        ))
        .unwrap();

    assert_eq!(plan.aspirations(), vec![1000.0, 500.0]);
    assert_eq!(plan.dispenses(), vec![1000.0, 500.0]);
    assert!(plan.batches.iter().all(|b| b.kind == BatchKind::ManyToOne));
}

#[tokio::test]
async fn test_remove_medium_combines_sources_into_one_dispense() {
    let mut layout = deck();
    let mut plate = plate(PLATE);
    for well in wells(3) {
        plate = plate.with_content(well, "medium", 200.0).unwrap();
    }
    replace(&mut layout, plate);
    let (engine, _sim) = connect(1, layout).await;
    engine.submit(&pick_tips()).await.unwrap();

    let plan = engine
        .plan(&remove_medium(
            plate_ref(),
            200.0,
            wells(3),
            TransferOptions::default(),
        ))
        .unwrap();

    assert_eq!(plan.aspirations(), vec![200.0; 3]);
    assert_eq!(plan.dispenses(), vec![600.0]);
}

// ============================================================================
// Holder partition
// ============================================================================

#[tokio::test]
async fn test_holder_partition_splits_by_flag() {
    let holder = Labware::pipette_holder(
        "small_tips",
        Dimensions::new(10.0, 20.0, 50.0),
        GridLayout::new(1, 2, 9.0, 9.0),
        IndividualPipetteHolder::template(Dimensions::new(7.0, 7.0, 45.0), false),
    )
    .with_tip_flag(pos(0, 1), true)
    .unwrap();
    let mut layout = deck();
    layout.place_labware("E", holder).unwrap();
    let (engine, _sim) = connect(1, layout).await;

    let id = LabwareId::new("small_tips");
    let pick = engine.holder_partition(&id, TipAction::Pick).unwrap();
    assert_eq!(pick.candidates, vec![pos(0, 0)]);
    assert_eq!(pick.excluded, vec![pos(0, 1)]);

    let stow = engine.holder_partition(&id, TipAction::Return).unwrap();
    assert_eq!(stow.candidates, vec![pos(0, 1)]);
    assert_eq!(stow.excluded, vec![pos(0, 0)]);
}

// ============================================================================
// Tip changes and mixing
// ============================================================================

#[tokio::test]
async fn test_change_tips_returns_to_holder_without_dropzone() {
    let (engine, _sim) = connect(1, deck()).await;
    engine.submit(&pick_tips()).await.unwrap();

    let options = TransferOptions::default().with_change_tips(true);
    let plan = engine.plan(&add_medium(100.0, wells(3), options)).unwrap();

    // Three single-target cycles (8 steps each) and two return-then-pick changes (7 each).
    assert_eq!(plan.len(), 38);
    assert_eq!(count(&plan, |a| matches!(a, Action::EjectTip)), 2);
    assert_eq!(count(&plan, |a| matches!(a, Action::PickTip { .. })), 2);
    let stowed = plan
        .steps
        .iter()
        .filter(|s| matches!(s.effect, Effect::StowTips(_)))
        .count();
    assert_eq!(stowed, 2);
}

#[tokio::test]
async fn test_change_tips_discards_into_dropzone() {
    let (engine, _sim) = connect(1, deck_with_dropzone()).await;
    engine.submit(&pick_tips()).await.unwrap();

    let options = TransferOptions::default().with_change_tips(true);
    let plan = engine.plan(&add_medium(100.0, wells(3), options)).unwrap();

    let dropped = plan
        .steps
        .iter()
        .filter(|s| matches!(s.effect, Effect::DropTips))
        .count();
    assert_eq!(dropped, 2);
    assert!(!plan
        .steps
        .iter()
        .any(|s| matches!(s.effect, Effect::StowTips(_))));
    assert_eq!(count(&plan, |a| matches!(a, Action::PickTip { .. })), 2);
}

#[tokio::test]
async fn test_no_tip_change_between_trips_of_one_target() {
    let mut layout = deck();
    replace(
        &mut layout,
        deep_plate(DEEP)
            .with_content(pos(0, 0), "medium", 1500.0)
            .unwrap(),
    );
    let (engine, _sim) = connect(1, layout).await;
    engine.submit(&pick_tips()).await.unwrap();

    let options = TransferOptions::default().with_change_tips(true);
    let plan = engine
        .plan(&remove_medium(deep_ref(), 1500.0, vec![pos(0, 0)], options))
        .unwrap();

    assert_eq!(plan.batches.len(), 2);
    assert_eq!(count(&plan, |a| matches!(a, Action::EjectTip)), 0);
}

#[tokio::test]
async fn test_mixing_after_each_dispense() {
    let (engine, _sim) = connect(1, deck()).await;
    engine.submit(&pick_tips()).await.unwrap();

    let options = TransferOptions::default().with_mixing(true);
    let plan = engine.plan(&add_medium(100.0, wells(2), options)).unwrap();

    // Mixing forces single-target cycles: aspirate (4) + dispense with mix (6).
    assert_eq!(plan.batches.len(), 2);
    assert_eq!(plan.len(), 20);
    let mixes = plan
        .steps
        .iter()
        .filter(|s| matches!(s.effect, Effect::Mix))
        .count();
    assert_eq!(mixes, 4);
}

// ============================================================================
// Medium exchange
// ============================================================================

#[tokio::test]
async fn test_remove_and_add_alternates_legs() {
    let mut layout = deck();
    let mut plate = plate(PLATE);
    for well in wells(2) {
        plate = plate.with_content(well, "old", 200.0).unwrap();
    }
    replace(&mut layout, plate);
    let (engine, _sim) = connect(1, layout).await;
    engine.submit(&pick_tips()).await.unwrap();

    let op = Operation::RemoveAndAdd {
        plate: plate_ref(),
        plate_positions: wells(2),
        waste: reservoirs_ref(),
        waste_position: WASTE,
        medium: reservoirs_ref(),
        medium_position: MEDIUM,
        volume: 150.0,
        options: TransferOptions::default(),
    };
    let plan = engine.plan(&op).unwrap();

    let kinds: Vec<BatchKind> = plan.batches.iter().map(|b| b.kind).collect();
    assert_eq!(kinds, vec![BatchKind::ManyToOne, BatchKind::OneToMany]);
    assert_eq!(plan.aspirations(), vec![150.0, 150.0, 300.0]);
    assert_eq!(plan.dispenses(), vec![300.0, 150.0, 150.0]);
}

#[tokio::test]
async fn test_transfer_plate_to_plate_is_pairwise() {
    let mut layout = deck();
    let mut plate = plate(PLATE);
    for well in wells(2) {
        plate = plate.with_content(well, "cells", 100.0).unwrap();
    }
    replace(&mut layout, plate);
    let (engine, _sim) = connect(1, layout).await;
    engine.submit(&pick_tips()).await.unwrap();

    let op = Operation::TransferPlateToPlate {
        source: plate_ref(),
        source_positions: wells(2),
        destination: deep_ref(),
        destination_positions: vec![pos(0, 0), pos(1, 0)],
        volume: 80.0,
        options: TransferOptions::default(),
    };
    let plan = engine.plan(&op).unwrap();

    assert_eq!(plan.batches.len(), 2);
    assert!(plan.batches.iter().all(|b| b.kind == BatchKind::OneToOne));
    assert_eq!(plan.aspirations(), vec![80.0, 80.0]);
}

// ============================================================================
// Tip operations
// ============================================================================

#[tokio::test]
async fn test_tip_operation_step_shapes() {
    let (engine, _sim) = connect(1, deck_with_dropzone()).await;

    let pick = engine.plan(&pick_tips()).unwrap();
    assert_eq!(pick.len(), 3);
    assert!(matches!(pick.steps[1].action, Action::PickTip { .. }));
    assert_eq!(pick.steps[2].action, Action::MoveZ { z: 0.0 });

    engine.submit(&pick_tips()).await.unwrap();
    let ret = engine
        .plan(&Operation::ReturnTips {
            holder: tips_ref(),
            position: None,
        })
        .unwrap();
    assert_eq!(ret.len(), 4);
    assert_eq!(ret.steps[2].action, Action::EjectTip);

    let discard = engine
        .plan(&Operation::DiscardTips {
            dropzone: dropzone_ref(),
        })
        .unwrap();
    assert_eq!(discard.len(), 4);
    assert!(matches!(discard.steps[2].effect, Effect::DropTips));
}

#[tokio::test]
async fn test_planning_does_not_touch_the_device() {
    let (engine, sim) = connect(1, deck()).await;
    engine.submit(&pick_tips()).await.unwrap();
    let before = sim.attempted();

    engine
        .plan(&add_medium(100.0, wells(8), TransferOptions::default()))
        .unwrap();

    assert_eq!(sim.attempted(), before);
}
