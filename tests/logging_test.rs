//! Structured log output of the engine pipeline

mod common;

use common::*;
use pipettor_plus::engine::TipAction;
use pipettor_plus::hardware::{CommErrorCode, ControlErrorCode, ErrorCodes, SimulatedPipettor};
use pipettor_plus::labware::LabwareId;
use pipettor_plus::TransferOptions;
use std::sync::Arc;
use tracing_test::traced_test;

#[tokio::test]
#[traced_test]
async fn test_rejection_is_logged_with_operation() {
    let (engine, _sim) = connect(1, deck()).await;

    engine
        .submit(&add_medium(100.0, wells(1), TransferOptions::default()))
        .await
        .unwrap_err();

    assert!(logs_contain("Validation failed"));
    assert!(logs_contain("add_medium"));
}

#[tokio::test]
#[traced_test]
async fn test_plan_summary_is_logged() {
    let (engine, _sim) = connect(1, deck()).await;

    engine.submit(&pick_tips()).await.unwrap();

    assert!(logs_contain("Engine ready"));
    assert!(logs_contain("Plan ready"));
}

#[tokio::test]
#[traced_test]
async fn test_device_failure_is_logged_and_not_applied() {
    let codes = ErrorCodes::new(CommErrorCode::ChecksumMismatch, ControlErrorCode::None);
    let sim = Arc::new(SimulatedPipettor::new(1, 1000.0).fail_at(1, codes));
    let engine = connect_with(sim, 1, deck()).await;

    engine.submit(&pick_tips()).await.unwrap_err();

    assert!(logs_contain("Step failed"));
    assert!(logs_contain("pick_tip"));
    assert!(engine
        .holder_partition(&LabwareId::new(TIPS), TipAction::Pick)
        .unwrap()
        .candidates
        .contains(&pos(0, 0)));
}
