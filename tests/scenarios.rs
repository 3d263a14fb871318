//! End-to-end behaviour of the composite actuators over simulated drivers.

use daq_actuators::actuators::{
    AntiBacklashActuator, AntiBacklashConfig, CombinedFixedPositionActuator,
    CombinedFixedPositionConfig, FixedPositionsActuator, FixedPositionsConfig, MultiplexActuator,
    MultiplexConfig, RotationActuator, RotationConfig,
};
use daq_actuators::hardware::{MockActuator, MockCall};
use daq_actuators::{axis_set, position, Actuator, AxisDef, AxisValue, DependencyMap};
use std::collections::BTreeMap;
use std::f64::consts::TAU;
use std::sync::Arc;
use std::time::Duration;

fn mock(name: &str, axes: &[&str], min: f64, max: f64) -> MockActuator {
    let mut builder = MockActuator::builder(name);
    for axis in axes {
        builder = builder.axis(*axis, AxisDef::continuous(min, max));
    }
    builder.build().unwrap()
}

fn deps(entries: &[(&str, &MockActuator)]) -> DependencyMap {
    entries
        .iter()
        .map(|(key, dep)| (key.to_string(), Arc::new((*dep).clone()) as Arc<dyn Actuator>))
        .collect()
}

#[tokio::test]
async fn multiplex_moves_every_dependency() {
    let dep_a = mock("a", &["x"], -10.0, 10.0);
    let dep_b = mock("b", &["y"], -10.0, 10.0);
    dep_b.set_move_delay(Duration::from_millis(50));
    let stage = MultiplexActuator::new(
        "stage",
        "stage",
        deps(&[("x", &dep_a), ("y", &dep_b)]),
        MultiplexConfig::new([("x", "x"), ("y", "y")]),
    )
    .unwrap();

    stage
        .move_abs(position([("x", 1.0), ("y", 2.0)]))
        .unwrap()
        .await
        .unwrap();

    assert_eq!(dep_a.calls(), vec![MockCall::MoveAbs(position([("x", 1.0)]))]);
    assert_eq!(dep_b.calls(), vec![MockCall::MoveAbs(position([("y", 2.0)]))]);
    // The slower dependency was waited for
    assert_eq!(dep_b.position().get()["y"], AxisValue::Float(2.0));
    assert_eq!(stage.position().get(), position([("x", 1.0), ("y", 2.0)]));
}

#[tokio::test]
async fn rotation_takes_the_short_way() {
    let spindle = mock("spindle", &["rz"], -1e4, 1e4);
    spindle.set_position(position([("rz", 0.1)]));
    let rot = RotationActuator::new(
        "rot",
        "rotator",
        deps(&[("rz", &spindle)]),
        RotationConfig::new("rz"),
    )
    .unwrap();

    rot.move_abs(position([("rz", 6.2)])).unwrap().await.unwrap();

    let calls = spindle.calls();
    assert_eq!(calls.len(), 1);
    let MockCall::MoveRel(shift) = &calls[0] else {
        panic!("expected a relative move, got {:?}", calls[0]);
    };
    let shift = shift["rz"].as_f64().unwrap();
    assert!(shift < 0.0);
    assert!(shift.abs() < 6.1);
    assert!((shift - (6.2 - TAU - 0.1)).abs() < 1e-9);
    assert!((rot.position().get()["rz"].as_f64().unwrap() - 6.2).abs() < 1e-9);
}

#[tokio::test]
async fn rotation_rehomes_when_crossing_the_switch() {
    let spindle = MockActuator::builder("spindle")
        .axis("rz", AxisDef::continuous(-1e4, 1e4))
        .at("rz", 0.1)
        .referenceable(true)
        .build()
        .unwrap();
    let rot = RotationActuator::new(
        "rot",
        "rotator",
        deps(&[("rz", &spindle)]),
        RotationConfig::new("rz"),
    )
    .unwrap();

    rot.move_abs(position([("rz", 6.2)])).unwrap().await.unwrap();

    let calls = spindle.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[1], MockCall::Reference(axis_set(["rz"])));
    assert!((rot.position().get()["rz"].as_f64().unwrap() - 6.2).abs() < 1e-9);
}

#[tokio::test]
async fn backlash_overshoot_then_compensation() {
    let stage = mock("stage", &["x"], -10.0, 10.0);
    let bl = AntiBacklashActuator::new(
        "bl",
        "stage",
        deps(&[("stage", &stage)]),
        AntiBacklashConfig {
            backlash: BTreeMap::from([("x".to_string(), 0.01)]),
            ..AntiBacklashConfig::default()
        },
    )
    .unwrap();
    assert!(!bl.is_shifted("x"));

    bl.move_rel(position([("x", -1.0)])).unwrap().await.unwrap();

    assert_eq!(
        stage.calls(),
        vec![
            MockCall::MoveRel(position([("x", -1.01)])),
            MockCall::MoveRel(position([("x", 0.01)])),
        ]
    );
    assert!(!bl.is_shifted("x"));
    assert!((stage.position().get()["x"].as_f64().unwrap() + 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn combined_fixed_position_reports_fallback() {
    let a = mock("a", &["rz"], -10.0, 10.0);
    let b = mock("b", &["rz"], -10.0, 10.0);
    a.set_position(position([("rz", 0.5)]));
    b.set_position(position([("rz", 0.5)]));

    let pol = CombinedFixedPositionActuator::new(
        "pol",
        "pol-analyzer",
        deps(&[("a", &a), ("b", &b)]),
        CombinedFixedPositionConfig::new(
            "pol",
            ["rz", "rz"],
            [("A", [0.0, 0.0]), ("B", [1.0, 1.0])],
            "unknown",
        ),
    )
    .unwrap();
    assert_eq!(pol.position().get(), position([("pol", "unknown")]));

    pol.move_abs(position([("pol", "B")])).unwrap().await.unwrap();
    assert_eq!(pol.position().get(), position([("pol", "B")]));
}

#[tokio::test]
async fn filter_wheel_references_after_a_full_turn() {
    let wheel = MockActuator::builder("wheel")
        .axis("rz", AxisDef::continuous(-1e4, 1e4))
        .referenceable(true)
        .build()
        .unwrap();
    let fw = FixedPositionsActuator::new(
        "fw",
        "filter",
        deps(&[("band", &wheel)]),
        FixedPositionsConfig::new("rz", [0.0, 90.0, 180.0, 270.0]).cyclic(360.0),
    )
    .unwrap();

    for target in [90.0, 180.0, 270.0] {
        fw.move_abs(position([("band", target)])).unwrap().await.unwrap();
    }
    assert_eq!(fw.accumulated_travel(), 270.0);
    assert_eq!(
        wheel.calls().iter().filter(|c| matches!(c, MockCall::Reference(_))).count(),
        1
    );

    // One more quarter turn completes the cycle
    fw.move_abs(position([("band", 0.0)])).unwrap().await.unwrap();
    let calls = wheel.calls();
    assert_eq!(
        calls[4..],
        [
            MockCall::MoveRel(position([("rz", 180.0)])),
            MockCall::Reference(axis_set(["rz"])),
            MockCall::MoveRel(position([("rz", 0.0)])),
        ]
    );
    assert_eq!(fw.accumulated_travel(), 0.0);
    assert_eq!(fw.position().get(), position([("band", 0.0)]));
}
