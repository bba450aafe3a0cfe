//! Property tests for trip decomposition, batch bounds and capacity safety

mod common;

use common::*;
use pipettor_plus::engine::{batch_limit, split_trips, Planner};
use pipettor_plus::{PipettorState, TransferOptions};
use proptest::prelude::*;

const TOLERANCE: f64 = 0.01;

proptest! {
    #[test]
    fn trips_cover_volume_without_exceeding_tip(
        volume in 0.5f64..5000.0,
        capacity in prop::sample::select(vec![200.0f64, 1000.0]),
    ) {
        let trips = split_trips(volume, capacity);

        let total: f64 = trips.iter().sum();
        prop_assert!((total - volume).abs() < 1e-6);
        prop_assert!(trips.iter().all(|t| *t > 0.0 && *t <= capacity + TOLERANCE));
        // Full trips first, remainder last.
        for trip in &trips[..trips.len() - 1] {
            prop_assert!((trip - capacity).abs() < 1e-9);
        }
    }

    #[test]
    fn batch_limit_fits_one_tip(
        trip in 1.0f64..1000.0,
        max_batch in 1usize..12,
        batch_mode in any::<bool>(),
    ) {
        let options = TransferOptions::default()
            .with_batch_mode(batch_mode)
            .with_max_batch_size(max_batch);

        let limit = batch_limit(&options, trip, 1000.0);

        prop_assert!(limit >= 1);
        prop_assert!(limit <= max_batch);
        prop_assert!(limit == 1 || limit as f64 * trip <= 1000.0 + TOLERANCE);
        if !batch_mode {
            prop_assert_eq!(limit, 1);
        }
    }

    #[test]
    fn planned_volumes_are_conserved(
        volume in 1.0f64..1000.0,
        targets in 1usize..=12,
        max_batch in 1usize..8,
    ) {
        let deck = deck();
        let pipettor = PipettorState::new(1, 1000.0, 90.0);
        let options = TransferOptions::default().with_max_batch_size(max_batch);

        let plan = Planner::new(&deck, &pipettor)
            .plan(&add_medium(volume, wells(targets), options))
            .unwrap();

        let aspirated: f64 = plan.aspirations().iter().sum();
        let dispensed: f64 = plan.dispenses().iter().sum();
        let requested = volume * targets as f64;
        prop_assert!((aspirated - requested).abs() < 1e-6);
        prop_assert!((dispensed - requested).abs() < 1e-6);
        prop_assert!(plan.aspirations().iter().all(|v| *v <= 1000.0 + TOLERANCE));
        prop_assert!(plan.batches.iter().all(|b| b.len() <= max_batch));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn executed_operations_never_overfill(
        volume in 50.0f64..1500.0,
        targets in 1usize..=6,
        prefill in 1.0f64..600.0,
    ) {
        tokio_test::block_on(async {
            let mut layout = deck();
            let mut plate = plate(PLATE);
            for well in wells(targets) {
                plate = plate.with_content(well, "old", prefill).unwrap();
            }
            replace(&mut layout, plate);
            let (engine, sim) = connect(1, layout).await;
            engine.submit(&pick_tips()).await.unwrap();
            let attempted = sim.attempted();

            let outcome = engine
                .submit(&add_medium(volume, wells(targets), TransferOptions::default()))
                .await;

            let deck = engine.deck_snapshot().unwrap();
            match outcome {
                Ok(_) => {
                    for well in wells(targets) {
                        let well = content(&deck, PLATE, well);
                        assert!(well.total() <= well.capacity() + TOLERANCE);
                        assert_close(well.volume_of("medium"), volume);
                    }
                }
                Err(err) => {
                    assert!(err.is_validation(), "unexpected error: {err}");
                    assert_eq!(sim.attempted(), attempted);
                    assert!(prefill + volume > 1000.0);
                }
            }
        });
    }
}
