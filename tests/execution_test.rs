//! Integration tests for plan execution against the simulator
//!
//! Covers the content model after successful runs and the partial-completion contract when
//! the device fails mid-plan.

mod common;

use common::*;
use pipettor_plus::engine::{Action, EngineState, FailureCause};
use pipettor_plus::hardware::{
    CommErrorCode, ControlErrorCode, ErrorCodes, SimulatedCommand, SimulatedPipettor,
};
use pipettor_plus::{Operation, PipettorError, TransferOptions};
use std::sync::Arc;
use std::time::Duration;

fn slow_simulator() -> Arc<SimulatedPipettor> {
    Arc::new(SimulatedPipettor::new(1, 1000.0).with_latency(Duration::from_millis(20)))
}

// ============================================================================
// Successful runs
// ============================================================================

#[tokio::test]
async fn test_pick_tips_updates_holder_and_device() {
    let (engine, sim) = connect(1, deck()).await;

    let report = engine.submit(&pick_tips()).await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.completed().len(), 3);
    assert!(engine.pipettor_snapshot().unwrap().has_tip());
    assert!(has_tip(&engine.deck_snapshot().unwrap(), TIPS, pos(0, 0)));
    assert!(matches!(
        sim.commands().as_slice(),
        [
            SimulatedCommand::MoveXy { .. },
            SimulatedCommand::PickTip { .. },
            SimulatedCommand::MoveZ { .. }
        ]
    ));
}

#[tokio::test]
async fn test_add_medium_moves_liquid() {
    let (engine, sim) = connect(1, deck()).await;
    engine.submit(&pick_tips()).await.unwrap();

    engine
        .submit(&add_medium(190.0, wells(10), TransferOptions::default()))
        .await
        .unwrap();

    let deck = engine.deck_snapshot().unwrap();
    for well in wells(10) {
        assert_close(content(&deck, PLATE, well).volume_of("medium"), 190.0);
    }
    assert_close(content(&deck, RESERVOIRS, MEDIUM).total(), 20_000.0 - 1900.0);
    assert_close(engine.pipettor_snapshot().unwrap().held_volume(), 0.0);
    assert_close(sim.held_volume(), 0.0);
}

#[tokio::test]
async fn test_liquid_is_conserved_across_operations() {
    let (engine, _sim) = connect(1, deck()).await;
    let initial = deck_volume(&engine.deck_snapshot().unwrap());
    engine.submit(&pick_tips()).await.unwrap();

    engine
        .submit(&add_medium(400.0, wells(6), TransferOptions::default()))
        .await
        .unwrap();
    engine
        .submit(&remove_medium(
            plate_ref(),
            250.0,
            wells(6),
            TransferOptions::default(),
        ))
        .await
        .unwrap();

    let deck = engine.deck_snapshot().unwrap();
    assert_close(deck_volume(&deck), initial);
    assert_close(content(&deck, RESERVOIRS, WASTE).total(), 1500.0);
    assert_close(content(&deck, PLATE, pos(0, 5)).total(), 150.0);
}

#[tokio::test]
async fn test_multi_trip_fills_deep_well() {
    let (engine, _sim) = connect(1, deck()).await;
    engine.submit(&pick_tips()).await.unwrap();

    let op = Operation::AddMedium {
        source: reservoirs_ref(),
        source_position: MEDIUM,
        destination: deep_ref(),
        destination_positions: vec![pos(0, 0), pos(1, 0)],
        volume: 1500.0,
        options: TransferOptions::default(),
    };
    let report = engine.submit(&op).await.unwrap();

    let deck = engine.deck_snapshot().unwrap();
    assert_close(content(&deck, DEEP, pos(0, 0)).total(), 1500.0);
    assert_close(content(&deck, DEEP, pos(1, 0)).total(), 1500.0);
    let aspirations = report
        .completed()
        .iter()
        .filter(|s| matches!(s.action, Action::Aspirate { .. }))
        .count();
    assert_eq!(aspirations, 4);
}

#[tokio::test]
async fn test_trips_just_over_a_third_of_the_tip_run_in_pairs() {
    let (engine, sim) = connect(1, deck()).await;
    engine.submit(&pick_tips()).await.unwrap();

    // Three trips of 333.335 µl would need 1000.005 µl in one tip.
    let report = engine
        .submit(&add_medium(333.335, wells(3), TransferOptions::default()))
        .await
        .unwrap();

    assert!(report.is_success());
    let deck = engine.deck_snapshot().unwrap();
    for well in wells(3) {
        assert_close(content(&deck, PLATE, well).volume_of("medium"), 333.335);
    }
    let aspirated: Vec<f64> = sim
        .commands()
        .iter()
        .filter_map(|c| match c {
            SimulatedCommand::Aspirate { volume } => Some(*volume),
            _ => None,
        })
        .collect();
    assert_eq!(aspirated.len(), 2);
    assert!(aspirated.iter().all(|v| *v <= 1000.0));
    assert_close(sim.held_volume(), 0.0);
}

#[tokio::test]
async fn test_multichannel_add_fills_whole_columns() {
    let (engine, sim) = connect(8, deck()).await;
    engine.submit(&pick_tips()).await.unwrap();

    engine
        .submit(&add_medium(
            100.0,
            vec![pos(0, 0), pos(1, 0)],
            TransferOptions::default(),
        ))
        .await
        .unwrap();

    let deck = engine.deck_snapshot().unwrap();
    for column in 0..2 {
        for row in 0..8 {
            assert_close(content(&deck, PLATE, pos(column, row)).total(), 100.0);
        }
    }
    assert_close(content(&deck, PLATE, pos(2, 0)).total(), 0.0);
    assert_close(content(&deck, RESERVOIRS, MEDIUM).total(), 20_000.0 - 1600.0);
    for row in 0..8 {
        assert!(has_tip(&deck, TIPS, pos(0, row)));
    }
    // Piston volumes are per channel.
    assert!(sim
        .commands()
        .contains(&SimulatedCommand::Aspirate { volume: 200.0 }));
}

#[tokio::test]
async fn test_per_tip_reservoirs_feed_their_own_channel() {
    let mut layout = deck();
    layout
        .place_labware("E", per_tip_reservoirs(PER_TIP, [1000.0; 8]))
        .unwrap();
    let (engine, sim) = connect(8, layout).await;
    engine.submit(&pick_tips()).await.unwrap();

    engine
        .submit(&add_from_per_tip(100.0, vec![pos(0, 0), pos(1, 0)]))
        .await
        .unwrap();

    let deck = engine.deck_snapshot().unwrap();
    for row in 0..8 {
        assert_close(content(&deck, PER_TIP, pos(0, row)).total(), 800.0);
        for column in 0..2 {
            assert_close(content(&deck, PLATE, pos(column, row)).volume_of("medium"), 100.0);
        }
    }
    // The shared reservoir is not touched.
    assert_close(content(&deck, RESERVOIRS, MEDIUM).total(), 20_000.0);
    assert!(sim
        .commands()
        .contains(&SimulatedCommand::Aspirate { volume: 200.0 }));
}

#[tokio::test]
async fn test_remove_and_add_exchanges_medium() {
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
    engine.submit(&op).await.unwrap();

    let deck = engine.deck_snapshot().unwrap();
    for well in wells(2) {
        let well = content(&deck, PLATE, well);
        assert_close(well.volume_of("old"), 50.0);
        assert_close(well.volume_of("medium"), 150.0);
    }
    assert_close(content(&deck, RESERVOIRS, WASTE).volume_of("old"), 300.0);
}

#[tokio::test]
async fn test_discard_tips_leaves_holder_untouched() {
    let (engine, _sim) = connect(1, deck_with_dropzone()).await;
    engine.submit(&pick_tips()).await.unwrap();

    engine
        .submit(&Operation::DiscardTips {
            dropzone: dropzone_ref(),
        })
        .await
        .unwrap();

    assert!(!engine.pipettor_snapshot().unwrap().has_tip());
    assert!(has_tip(&engine.deck_snapshot().unwrap(), TIPS, pos(0, 0)));
}

#[tokio::test]
async fn test_return_tips_clears_holder_flag() {
    let (engine, _sim) = connect(1, deck()).await;
    engine.submit(&pick_tips()).await.unwrap();

    engine
        .submit(&Operation::ReturnTips {
            holder: tips_ref(),
            position: None,
        })
        .await
        .unwrap();

    assert!(!engine.pipettor_snapshot().unwrap().has_tip());
    assert!(!has_tip(&engine.deck_snapshot().unwrap(), TIPS, pos(0, 0)));
}

// ============================================================================
// Partial completion
// ============================================================================

#[tokio::test]
async fn test_hardware_failure_keeps_completed_steps() {
    let codes = ErrorCodes::new(CommErrorCode::ReceiveTimeout, ControlErrorCode::None);
    // Pick takes device commands 0..=2; plan step 6 is the first dispense.
    let sim = Arc::new(SimulatedPipettor::new(1, 1000.0).fail_at(3 + 6, codes));
    let engine = connect_with(sim.clone(), 1, deck()).await;
    engine.submit(&pick_tips()).await.unwrap();

    let err = engine
        .submit(&add_medium(100.0, wells(2), TransferOptions::default()))
        .await
        .unwrap_err();

    let report = err.report().expect("hardware failure carries a report");
    assert!(matches!(err, PipettorError::Hardware(_)));
    assert_eq!(report.total_steps, 12);
    assert_eq!(report.completed().len(), 6);
    assert_eq!(report.not_attempted(), 5);

    let failure = report.failure().unwrap();
    assert_eq!(failure.index, 6);
    assert_eq!(failure.action, Action::Dispense { volume: 100.0 });
    match &failure.cause {
        FailureCause::Device(device) => assert_eq!(device.codes, codes),
        other => panic!("unexpected cause: {other:?}"),
    }

    // The aspiration stays applied; nothing reached the wells.
    let deck = engine.deck_snapshot().unwrap();
    assert_close(content(&deck, RESERVOIRS, MEDIUM).total(), 20_000.0 - 200.0);
    assert_close(content(&deck, PLATE, pos(0, 0)).total(), 0.0);
    assert_close(engine.pipettor_snapshot().unwrap().held_volume(), 200.0);
    assert_eq!(sim.attempted(), 3 + 7);
}

#[tokio::test]
async fn test_failed_tips_still_hold_liquid_block_next_operation() {
    let codes = ErrorCodes::new(CommErrorCode::None, ControlErrorCode::CommunicationError);
    let sim = Arc::new(SimulatedPipettor::new(1, 1000.0).fail_at(3 + 6, codes));
    let engine = connect_with(sim.clone(), 1, deck()).await;
    engine.submit(&pick_tips()).await.unwrap();
    engine
        .submit(&add_medium(100.0, wells(2), TransferOptions::default()))
        .await
        .unwrap_err();
    let attempted = sim.attempted();

    let err = engine
        .submit(&add_medium(100.0, wells(2), TransferOptions::default()))
        .await
        .unwrap_err();

    assert!(err.is_validation());
    assert_eq!(sim.attempted(), attempted);
}

// ============================================================================
// Run control
// ============================================================================

#[tokio::test]
async fn test_abort_stops_plan_and_parks_head() {
    let sim = slow_simulator();
    let engine = connect_with(sim.clone(), 1, deck()).await;
    engine.submit(&pick_tips()).await.unwrap();
    let op = add_medium(100.0, wells(2), TransferOptions::default());

    let (outcome, ()) = tokio::join!(engine.submit(&op), async {
        tokio::task::yield_now().await;
        engine.abort();
    });

    let err = outcome.unwrap_err();
    assert!(matches!(err, PipettorError::Aborted(_)));
    assert!(err.to_string().contains("aborted before step 2"));
    let report = err.report().unwrap();
    assert_eq!(report.aborted_at(), Some(1));
    assert_eq!(report.completed().len(), 1);
    assert_eq!(report.not_attempted(), 11);

    // One plan step, then the park moves.
    assert_eq!(sim.attempted(), 3 + 1 + 2);
    let commands = sim.commands();
    assert_eq!(
        &commands[commands.len() - 2..],
        &[
            SimulatedCommand::MoveZ { z: 0.0 },
            SimulatedCommand::MoveXy { x: 0.0, y: 0.0 }
        ]
    );
    let deck = engine.deck_snapshot().unwrap();
    assert_close(content(&deck, RESERVOIRS, MEDIUM).total(), 20_000.0);
    assert!(engine.pipettor_snapshot().unwrap().has_tip());
    assert_eq!(engine.state(), EngineState::Idle);

    // The abort was consumed; the next run goes through.
    engine.submit(&op).await.unwrap();
}

#[tokio::test]
async fn test_pause_holds_plan_until_resumed() {
    let sim = slow_simulator();
    let engine = connect_with(sim.clone(), 1, deck()).await;
    engine.submit(&pick_tips()).await.unwrap();
    let op = add_medium(100.0, wells(2), TransferOptions::default());

    let (outcome, ()) = tokio::join!(engine.submit(&op), async {
        tokio::task::yield_now().await;
        assert!(engine.pause());
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(engine.is_paused());
        assert!(matches!(engine.state(), EngineState::Paused { ref during } if during.contains("add_medium")));
        let attempted = sim.attempted();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(sim.attempted(), attempted);

        assert!(engine.resume());
    });

    assert!(outcome.unwrap().is_success());
    assert!(!engine.is_paused());
    let deck = engine.deck_snapshot().unwrap();
    for well in wells(2) {
        assert_close(content(&deck, PLATE, well).total(), 100.0);
    }
}
