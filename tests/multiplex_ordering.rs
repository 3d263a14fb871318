//! Requests on one actuator run in submission order.

use daq_actuators::actuators::{MultiplexActuator, MultiplexConfig};
use daq_actuators::hardware::{MockActuator, MockCall};
use daq_actuators::{position, Actuator, AxisDef, DependencyMap};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

fn stage(name: &str, axis: &str, delay_ms: u64) -> MockActuator {
    MockActuator::builder(name)
        .axis(axis, AxisDef::continuous(-10.0, 10.0))
        .move_delay(Duration::from_millis(delay_ms))
        .build()
        .unwrap()
}

#[tokio::test]
async fn queued_moves_keep_their_order() {
    let a = stage("a", "x", 20);
    let b = stage("b", "y", 5);
    let deps: DependencyMap = BTreeMap::from([
        ("x".to_string(), Arc::new(a.clone()) as Arc<dyn Actuator>),
        ("y".to_string(), Arc::new(b.clone()) as Arc<dyn Actuator>),
    ]);
    let config = MultiplexConfig::new([("x", "x"), ("y", "y")]);
    let stage = MultiplexActuator::new("stage", "stage", deps, config).unwrap();

    let futures = vec![
        stage.move_abs(position([("x", 1.0), ("y", 1.0)])).unwrap(),
        stage.move_rel(position([("y", 0.5)])).unwrap(),
        stage.move_abs(position([("x", -2.0)])).unwrap(),
    ];
    for f in futures {
        f.await.unwrap();
    }

    assert_eq!(
        a.calls(),
        vec![
            MockCall::MoveAbs(position([("x", 1.0)])),
            MockCall::MoveAbs(position([("x", -2.0)])),
        ]
    );
    // The relative move only started once the first absolute one was done
    assert_eq!(
        b.calls(),
        vec![
            MockCall::MoveAbs(position([("y", 1.0)])),
            MockCall::MoveRel(position([("y", 0.5)])),
        ]
    );
    assert_eq!(stage.position().get(), position([("x", -2.0), ("y", 1.5)]));
}

#[tokio::test]
async fn failure_does_not_block_later_requests() {
    let a = stage("a", "x", 0);
    let b = stage("b", "y", 0);
    let deps: DependencyMap = BTreeMap::from([
        ("x".to_string(), Arc::new(a.clone()) as Arc<dyn Actuator>),
        ("y".to_string(), Arc::new(b.clone()) as Arc<dyn Actuator>),
    ]);
    let config = MultiplexConfig::new([("x", "x"), ("y", "y")]);
    let stage = MultiplexActuator::new("stage", "stage", deps, config).unwrap();

    a.fail_next_move("encoder error");
    let failed = stage.move_abs(position([("x", 1.0), ("y", 1.0)])).unwrap();
    let next = stage.move_abs(position([("x", 3.0)])).unwrap();

    let err = failed.await.unwrap_err();
    assert!(err.to_string().contains("encoder error"));
    next.await.unwrap();
    assert_eq!(stage.position().get(), position([("x", 3.0), ("y", 1.0)]));
}
