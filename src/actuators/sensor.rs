//! Discrete axis whose actual position is read from a separate sensor.
//!
//! The "actuator" dependency performs the moves; the "sensor" dependency
//! reports where the axis really is. When a move does not bring the sensor to
//! the expected value, the axis keeps going by small steps and remembers the
//! extra travel needed, so that later moves are corrected up front.

use super::{new_state, stop_dependencies, Subscriptions};
use crate::axis::{
    check_move_abs, check_move_rel, check_reference, float_of, AxisDef, AxisSet, AxisValue,
    Position, ReferenceMap,
};
use crate::capabilities::{
    take_role, Actuator, ActuatorState, Dependency, DependencyMap, MoveKind, MoveRequest,
};
use crate::config::ActuatorSettings;
use crate::error::{ActuatorError, ActuatorResult};
use crate::executor::{MoveFuture, SerialExecutor, TaskKind};
use crate::observable::Observable;
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// An allowed actuator position and the sensor value observed there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorPosition {
    pub position: f64,
    pub sensor: AxisValue,
}

/// Parameters of a [`CombinedSensorActuator`].
///
/// Dependencies are given by role: "actuator" and "sensor". The exposed axis
/// has the name of the actuator axis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinedSensorConfig {
    pub actuator_axis: String,
    pub sensor_axis: String,
    pub to_sensor: Vec<SensorPosition>,
    #[serde(default)]
    pub settings: ActuatorSettings,
}

impl CombinedSensorConfig {
    pub fn new(
        actuator_axis: impl Into<String>,
        sensor_axis: impl Into<String>,
        to_sensor: impl IntoIterator<Item = (f64, AxisValue)>,
    ) -> Self {
        Self {
            actuator_axis: actuator_axis.into(),
            sensor_axis: sensor_axis.into(),
            to_sensor: to_sensor
                .into_iter()
                .map(|(position, sensor)| SensorPosition { position, sensor })
                .collect(),
            settings: ActuatorSettings::default(),
        }
    }
}

struct Inner {
    name: String,
    role: String,
    axis: String,
    axes: BTreeMap<String, AxisDef>,
    dep: Dependency,
    sensor: Dependency,
    sensor_axis: String,
    to_sensor: Vec<SensorPosition>,
    /// Correction added to every target, in actuator units
    pos_shift: Mutex<f64>,
    position: Observable<Position>,
    referenced: Option<Observable<ReferenceMap>>,
    state: Observable<ActuatorState>,
    executor: SerialExecutor,
    settings: ActuatorSettings,
    subscriptions: Subscriptions,
}

impl Inner {
    fn sensor_value(&self) -> Option<AxisValue> {
        self.sensor.actuator.position().get().get(&self.sensor_axis).cloned()
    }

    fn expected_sensor(&self, target: f64) -> ActuatorResult<&AxisValue> {
        self.to_sensor
            .iter()
            .find(|e| e.position == target)
            .map(|e| &e.sensor)
            .ok_or_else(|| ActuatorError::InvalidArgument(format!("unknown position {target}")))
    }

    fn update_position(&self) {
        let Some(svalue) = self.sensor_value() else {
            return;
        };
        match self.to_sensor.iter().find(|e| e.sensor == svalue) {
            Some(entry) => {
                debug!("{}: reporting position {}", self.name, entry.position);
                self.position.publish(Position::from([(
                    self.axis.clone(),
                    AxisValue::Float(entry.position),
                )]));
            }
            None => error!(
                "{}: no equivalent position known for sensor position {}",
                self.name, svalue
            ),
        }
    }

    async fn do_move_abs(&self, target: f64) -> ActuatorResult<()> {
        let corrected = target + *self.pos_shift.lock();
        let previous = float_of(&self.dep.actuator.position().get(), &self.axis)?;
        debug!("{}: moving axis {} to {} (corrected {})", self.name, self.axis, target, corrected);

        self.dep
            .actuator
            .move_abs(Position::from([(self.axis.clone(), AxisValue::Float(corrected))]))?
            .await?;

        let expected = self.expected_sensor(target)?.clone();
        let mut attempt = 0;
        let mut total_shift = 0.0;
        let result = loop {
            let actual = self.sensor_value();
            if actual.as_ref() == Some(&expected) {
                break Ok(());
            }
            let actual = actual.map_or_else(|| "nothing".to_string(), |v| v.to_string());

            attempt += 1;
            if attempt >= self.settings.convergence_attempts {
                warn!(
                    "{}: failed to reach position {} (={}) even after extra {}, still at {}",
                    self.name, corrected, expected, total_shift, actual
                );
                break Err(convergence_error(target, &actual));
            }
            if corrected == previous {
                // Already supposed to be there, moving further makes no sense
                warn!(
                    "{}: actuator supposedly at position {}, but sensor reports {}",
                    self.name, expected, actual
                );
                break Ok(());
            }

            let shift = (corrected - previous) * self.settings.convergence_step;
            debug!(
                "{}: attempting to reach position {} (={}) by moving an extra {}",
                self.name, corrected, expected, shift
            );
            let moved = match self
                .dep
                .actuator
                .move_rel(Position::from([(self.axis.clone(), AxisValue::Float(shift))]))
            {
                Ok(fut) => fut.await,
                Err(e) => Err(e),
            };
            if let Err(e) = moved {
                warn!("{}: failed to move further ({})", self.name, e);
                break Err(convergence_error(target, &actual));
            }
            total_shift += shift;
        };

        // Keep whatever correction was found, even on failure
        *self.pos_shift.lock() += total_shift;
        result
    }
}

fn convergence_error(target: f64, actual: &str) -> ActuatorError {
    ActuatorError::Io(std::io::Error::other(format!(
        "failed to reach position {target}, sensor reports {actual}"
    )))
}

/// Fixed-position axis verified by a sensor.
#[derive(Clone)]
pub struct CombinedSensorActuator {
    inner: Arc<Inner>,
}

impl CombinedSensorActuator {
    /// # Errors
    ///
    /// `Configuration` if a role is missing, if an axis does not exist, or if
    /// the sensor mapping is inconsistent with either dependency.
    pub fn new(
        name: impl Into<String>,
        role: impl Into<String>,
        mut dependencies: DependencyMap,
        config: CombinedSensorConfig,
    ) -> ActuatorResult<Self> {
        let name = name.into();
        config.settings.validate()?;
        if dependencies.len() != 2 {
            return Err(ActuatorError::config(format!(
                "{name}: CombinedSensorActuator needs precisely two dependencies"
            )));
        }
        let dep = take_role(&mut dependencies, "actuator")?;
        let sensor = take_role(&mut dependencies, "sensor")?;

        let dep_def = dep.axis(&config.actuator_axis)?;
        let sensor_def = sensor.axis(&config.sensor_axis)?;
        if config.to_sensor.is_empty() {
            return Err(ActuatorError::config(format!("{name}: no positions given")));
        }
        for (i, entry) in config.to_sensor.iter().enumerate() {
            if config.to_sensor[..i].iter().any(|e| e.position == entry.position) {
                return Err(ActuatorError::config(format!(
                    "{name}: position {} given twice",
                    entry.position
                )));
            }
            if !dep_def.accepts(&AxisValue::Float(entry.position)) {
                return Err(ActuatorError::config(format!(
                    "{name}: position {} not reachable by '{}'",
                    entry.position,
                    dep.name()
                )));
            }
            if !sensor_def.accepts(&entry.sensor) {
                return Err(ActuatorError::config(format!(
                    "{name}: sensor value {} not reported by '{}'",
                    entry.sensor,
                    sensor.name()
                )));
            }
        }

        let mut def = AxisDef::discrete(config.to_sensor.iter().map(|e| e.position));
        def.unit = dep_def.unit.clone();
        let referenced = dep.is_referenced(&config.actuator_axis).map(|r| {
            Observable::new(
                "referenced",
                ReferenceMap::from([(config.actuator_axis.clone(), r)]),
            )
        });

        let state = new_state();
        let executor = SerialExecutor::new(name.clone(), state.clone())?;
        let inner = Arc::new(Inner {
            name,
            role: role.into(),
            axes: BTreeMap::from([(config.actuator_axis.clone(), def)]),
            axis: config.actuator_axis,
            dep,
            sensor,
            sensor_axis: config.sensor_axis,
            to_sensor: config.to_sensor,
            pos_shift: Mutex::new(0.0),
            position: Observable::new("position", Position::new()),
            referenced,
            state,
            executor,
            settings: config.settings,
            subscriptions: Subscriptions::default(),
        });

        let weak = Arc::downgrade(&inner);
        inner
            .subscriptions
            .watch(inner.sensor.actuator.position(), true, move |_: &Position| {
                if let Some(inner) = weak.upgrade() {
                    inner.update_position();
                }
            });
        // The sensor may not notify on its own: re-read it whenever the actuator moves
        let weak = Arc::downgrade(&inner);
        inner
            .subscriptions
            .watch(inner.dep.actuator.position(), false, move |_: &Position| {
                if let Some(inner) = weak.upgrade() {
                    inner.update_position();
                }
            });
        if let Some(dep_ref) = inner.dep.actuator.referenced() {
            let weak = Arc::downgrade(&inner);
            inner
                .subscriptions
                .watch(dep_ref, false, move |referenced: &ReferenceMap| {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    if let (Some(&r), Some(obs)) =
                        (referenced.get(&inner.axis), &inner.referenced)
                    {
                        obs.publish(ReferenceMap::from([(inner.axis.clone(), r)]));
                    }
                });
        }
        inner.state.publish(ActuatorState::Idle);

        Ok(Self { inner })
    }

    /// Correction currently added to every target.
    pub fn correction(&self) -> f64 {
        *self.inner.pos_shift.lock()
    }
}

#[async_trait]
impl Actuator for CombinedSensorActuator {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn role(&self) -> &str {
        &self.inner.role
    }

    fn axes(&self) -> &BTreeMap<String, AxisDef> {
        &self.inner.axes
    }

    fn position(&self) -> &Observable<Position> {
        &self.inner.position
    }

    fn referenced(&self) -> Option<&Observable<ReferenceMap>> {
        self.inner.referenced.as_ref()
    }

    fn state(&self) -> &Observable<ActuatorState> {
        &self.inner.state
    }

    fn request_move(&self, request: MoveRequest) -> ActuatorResult<MoveFuture> {
        if request.values.is_empty() {
            return Ok(MoveFuture::ready(Ok(())));
        }
        if request.kind == MoveKind::Relative {
            check_move_rel(&self.inner.axes, &request.values)?;
            return Err(ActuatorError::Unsupported(
                "relative move on fixed positions axis".to_string(),
            ));
        }
        check_move_abs(&self.inner.axes, &request.values)?;

        let target = float_of(&request.values, &self.inner.axis)?;
        let inner = Arc::clone(&self.inner);
        Ok(self.inner.executor.submit(TaskKind::Move, None, move |_| {
            async move { inner.do_move_abs(target).await }.boxed()
        }))
    }

    fn reference(&self, axes: AxisSet) -> ActuatorResult<MoveFuture> {
        check_reference(&self.inner.axes, &axes)?;
        if self.inner.referenced.is_none() {
            return Err(ActuatorError::Unsupported(format!(
                "'{}' cannot be referenced",
                self.inner.name
            )));
        }
        if axes.is_empty() {
            return Ok(MoveFuture::ready(Ok(())));
        }
        let inner = Arc::clone(&self.inner);
        Ok(self.inner.executor.submit(TaskKind::Reference, None, move |_| {
            async move {
                debug!("{}: referencing axis {}", inner.name, inner.axis);
                inner
                    .dep
                    .actuator
                    .reference(AxisSet::from([inner.axis.clone()]))?
                    .await
            }
            .boxed()
        }))
    }

    async fn stop(&self, axes: Option<AxisSet>) {
        self.inner.executor.cancel();
        stop_dependencies(
            &self.inner.name,
            vec![(Arc::clone(&self.inner.dep.actuator), axes)],
            self.inner.settings.stop_timeout(),
        )
        .await;
    }

    async fn terminate(&self) {
        self.stop(None).await;
        self.inner.executor.shutdown().await;
        self.inner.subscriptions.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::position;
    use crate::hardware::{MockActuator, MockCall};

    /// A motor and a sensor reading "in" past `threshold`, "out" below 0.5.
    fn rig(threshold: f64) -> (MockActuator, MockActuator) {
        let motor = MockActuator::builder("motor")
            .axis("x", AxisDef::continuous(-10.0, 10.0))
            .build()
            .unwrap();
        let sensor = MockActuator::builder("switch")
            .axis("s", AxisDef::discrete(["out", "in", "between"]))
            .build()
            .unwrap();
        let s = sensor.clone();
        motor.position().subscribe_with(false, move |pos: &Position| {
            let x = pos["x"].as_f64().unwrap_or(0.0);
            let value = if x >= threshold {
                "in"
            } else if x <= 0.5 {
                "out"
            } else {
                "between"
            };
            s.set_position(position([("s", value)]));
        });
        (motor, sensor)
    }

    fn combined(motor: &MockActuator, sensor: &MockActuator) -> CombinedSensorActuator {
        let deps: DependencyMap = BTreeMap::from([
            ("actuator".to_string(), Arc::new(motor.clone()) as Arc<dyn Actuator>),
            ("sensor".to_string(), Arc::new(sensor.clone()) as Arc<dyn Actuator>),
        ]);
        let config = CombinedSensorConfig::new(
            "x",
            "s",
            [(0.0, AxisValue::from("out")), (1.0, AxisValue::from("in"))],
        );
        CombinedSensorActuator::new("shutter", "shutter", deps, config).unwrap()
    }

    #[tokio::test]
    async fn test_position_follows_sensor() {
        let (motor, sensor) = rig(0.9);
        let shutter = combined(&motor, &sensor);
        assert_eq!(shutter.position().get(), position([("x", 0.0)]));

        shutter.move_abs(position([("x", 1.0)])).unwrap().await.unwrap();
        assert_eq!(shutter.position().get(), position([("x", 1.0)]));
        assert_eq!(shutter.correction(), 0.0);
        assert_eq!(motor.calls(), vec![MockCall::MoveAbs(position([("x", 1.0)]))]);
    }

    #[tokio::test]
    async fn test_unknown_sensor_value_not_reported() {
        let (motor, sensor) = rig(0.9);
        let shutter = combined(&motor, &sensor);
        sensor.set_position(position([("s", "between")]));
        assert_eq!(shutter.position().get(), position([("x", 0.0)]));
    }

    #[tokio::test]
    async fn test_correction_is_learned() {
        let (motor, sensor) = rig(1.15);
        let shutter = combined(&motor, &sensor);

        shutter.move_abs(position([("x", 1.0)])).unwrap().await.unwrap();
        let calls = motor.calls();
        assert_eq!(calls.len(), 3);
        assert!(matches!(calls[1], MockCall::MoveRel(_)));
        assert!((shutter.correction() - 0.2).abs() < 1e-9);
        assert_eq!(shutter.position().get(), position([("x", 1.0)]));

        shutter.move_abs(position([("x", 0.0)])).unwrap().await.unwrap();
        motor.clear_calls();
        shutter.move_abs(position([("x", 1.0)])).unwrap().await.unwrap();
        // Reached directly thanks to the correction
        assert_eq!(motor.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_convergence_failure() {
        let (motor, sensor) = rig(9.5);
        let shutter = combined(&motor, &sensor);

        let err = shutter.move_abs(position([("x", 1.0)])).unwrap().await.unwrap_err();
        assert!(matches!(err, ActuatorError::Io(_)));
        // One move, then 9 corrective steps
        assert_eq!(motor.calls().len(), 10);
        assert!((shutter.correction() - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_relative_move_unsupported() {
        let (motor, sensor) = rig(0.9);
        let shutter = combined(&motor, &sensor);
        assert!(matches!(
            shutter.move_rel(position([("x", 1.0)])),
            Err(ActuatorError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_mapping_must_match_sensor() {
        let (motor, sensor) = rig(0.9);
        let deps: DependencyMap = BTreeMap::from([
            ("actuator".to_string(), Arc::new(motor) as Arc<dyn Actuator>),
            ("sensor".to_string(), Arc::new(sensor) as Arc<dyn Actuator>),
        ]);
        let config = CombinedSensorConfig::new("x", "s", [(0.0, AxisValue::from("half"))]);
        assert!(matches!(
            CombinedSensorActuator::new("shutter", "shutter", deps, config),
            Err(ActuatorError::Configuration(_))
        ));
    }
}
