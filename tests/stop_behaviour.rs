//! Stopping: idempotent when idle, cancels what is queued.

use daq_actuators::actuators::{
    AntiBacklashActuator, AntiBacklashConfig, ConvertConfig, ConvertStage, LinearActuator,
    LinearConfig, MultiplexActuator, MultiplexConfig,
};
use daq_actuators::hardware::{MockActuator, MockCall};
use daq_actuators::{position, Actuator, ActuatorError, ActuatorSettings, AxisDef, DependencyMap};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn stage(name: &str) -> MockActuator {
    MockActuator::builder(name)
        .axis("x", AxisDef::continuous(-10.0, 10.0))
        .axis("y", AxisDef::continuous(-10.0, 10.0))
        .build()
        .unwrap()
}

fn single(key: &str, dep: &MockActuator) -> DependencyMap {
    BTreeMap::from([(key.to_string(), Arc::new(dep.clone()) as Arc<dyn Actuator>)])
}

#[tokio::test]
async fn stop_on_idle_actuators_is_harmless() {
    let dep = stage("stage");
    let convert =
        ConvertStage::new("conv", "align", single("s", &dep), ConvertConfig::new("x", "y"));
    let backlash =
        AntiBacklashActuator::new("bl", "stage", single("s", &dep), AntiBacklashConfig::default());
    let mux_config = MultiplexConfig::new([("x", "x")]);
    let multiplex = MultiplexActuator::new("mx", "stage", single("x", &dep), mux_config);
    let actuators: Vec<Box<dyn Actuator>> = vec![
        Box::new(convert.unwrap()),
        Box::new(backlash.unwrap()),
        Box::new(multiplex.unwrap()),
    ];

    for actuator in &actuators {
        let before = actuator.position().get();
        actuator.stop(None).await;
        actuator.stop(None).await;
        assert_eq!(actuator.position().get(), before);
    }
    assert!(dep.calls().iter().all(|c| matches!(c, MockCall::Stop(_))));
}

#[tokio::test]
async fn stop_cancels_queued_moves() {
    let dep = MockActuator::builder("rail")
        .axis("r", AxisDef::continuous(0.0, 10.0))
        .move_delay(Duration::from_millis(50))
        .build()
        .unwrap();
    let lin =
        LinearActuator::new("lin", "focus", single("z", &dep), LinearConfig::new("r")).unwrap();

    let first = lin.move_abs(position([("z", 1.0)])).unwrap();
    let queued = lin.move_abs(position([("z", 2.0)])).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    lin.stop(None).await;

    assert!(first.await.is_ok());
    assert!(matches!(queued.await, Err(ActuatorError::Cancelled)));
    assert!(!dep.calls().contains(&MockCall::MoveAbs(position([("r", 2.0)]))));
}

#[tokio::test]
async fn slow_dependency_stop_is_bounded() {
    let dep = MockActuator::builder("sticky")
        .axis("x", AxisDef::continuous(-1.0, 1.0))
        .axis("y", AxisDef::continuous(-1.0, 1.0))
        .stop_delay(Duration::from_secs(5))
        .build()
        .unwrap();
    let config = ConvertConfig {
        settings: ActuatorSettings {
            stop_timeout_ms: 50,
            ..ActuatorSettings::default()
        },
        ..ConvertConfig::new("x", "y")
    };
    let conv = ConvertStage::new("conv", "align", single("s", &dep), config).unwrap();

    let start = Instant::now();
    conv.stop(None).await;
    assert!(start.elapsed() < Duration::from_secs(2));
}
