//! Mock Hardware Implementations
//!
//! Provides a simulated multi-axis actuator for testing composite actuators
//! without physical hardware. All waits use `tokio::time::sleep`.
//!
//! # Capabilities
//!
//! - Any number of continuous or discrete axes
//! - Optional speed control (enables the `speed` attribute and simulated
//!   travel time)
//! - Optional referencing (enables the `referenced` attribute)
//! - Fixed per-move delay, to keep a move in flight while a test queues more
//! - Failure injection for moves and references, and rejection of requests
//! - A call log ([`MockCall`]) recording every command in execution order

use crate::axis::{
    check_move_abs, check_move_rel, check_reference, float_of, update_axes, AxisDef, AxisKind,
    AxisSet, AxisValue, Position, ReferenceMap, SpeedMap,
};
use crate::capabilities::{Actuator, ActuatorState, MoveKind, MoveRequest};
use crate::error::{ActuatorError, ActuatorResult};
use crate::executor::{MoveFuture, SerialExecutor, TaskKind};
use crate::observable::Observable;
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::debug;

/// A command received by a [`MockActuator`].
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    MoveRel(Position),
    MoveAbs(Position),
    Reference(AxisSet),
    Stop(Option<AxisSet>),
    SetSpeed(SpeedMap),
}

/// Builder for [`MockActuator`].
#[derive(Debug, Clone)]
pub struct MockActuatorBuilder {
    name: String,
    axes: BTreeMap<String, AxisDef>,
    initial: Position,
    speed: Option<f64>,
    referenced: Option<bool>,
    move_delay: Duration,
    stop_delay: Duration,
}

impl MockActuatorBuilder {
    /// Add an axis.
    pub fn axis(mut self, name: impl Into<String>, def: AxisDef) -> Self {
        self.axes.insert(name.into(), def);
        self
    }

    /// Initial value of an axis (default: 0, or the first choice).
    pub fn at(mut self, axis: impl Into<String>, value: impl Into<AxisValue>) -> Self {
        self.initial.insert(axis.into(), value.into());
        self
    }

    /// Enable speed control with the same speed on every continuous axis.
    pub fn speed(mut self, units_per_sec: f64) -> Self {
        self.speed = Some(units_per_sec);
        self
    }

    /// Enable referencing, with every axis initially (un)referenced.
    pub fn referenceable(mut self, referenced: bool) -> Self {
        self.referenced = Some(referenced);
        self
    }

    /// Fixed time spent in every move and reference.
    pub fn move_delay(mut self, delay: Duration) -> Self {
        self.move_delay = delay;
        self
    }

    /// Time spent handling a stop.
    pub fn stop_delay(mut self, delay: Duration) -> Self {
        self.stop_delay = delay;
        self
    }

    /// Build the mock. Must be called inside a tokio runtime.
    pub fn build(self) -> ActuatorResult<MockActuator> {
        let mut position = Position::new();
        for (name, def) in &self.axes {
            def.validate(name)?;
            let value = match self.initial.get(name) {
                Some(v) => v.clone(),
                None => home_of(def),
            };
            if !def.accepts(&value) {
                return Err(ActuatorError::config(format!(
                    "initial value {value} of '{name}' out of range"
                )));
            }
            position.insert(name.clone(), value);
        }

        let speed = self.speed.map(|s| {
            let map: SpeedMap = self
                .axes
                .iter()
                .filter(|(_, d)| !d.is_discrete())
                .map(|(a, _)| (a.clone(), s))
                .collect();
            Observable::new("speed", map)
        });
        let referenced = self.referenced.map(|r| {
            let map: ReferenceMap = self.axes.keys().map(|a| (a.clone(), r)).collect();
            Observable::new("referenced", map)
        });
        let state = Observable::new("state", ActuatorState::Idle);
        let executor = SerialExecutor::new(self.name.clone(), state.clone())?;

        Ok(MockActuator {
            inner: Arc::new(MockInner {
                name: self.name,
                axes: self.axes,
                position: Observable::new("position", position),
                speed,
                referenced,
                state,
                executor,
                calls: Mutex::new(Vec::new()),
                failures: Mutex::new(Vec::new()),
                reference_failures: Mutex::new(0),
                rejections: Mutex::new(0),
                move_delay: Mutex::new(self.move_delay),
                stop_delay: self.stop_delay,
            }),
        })
    }
}

fn home_of(def: &AxisDef) -> AxisValue {
    match &def.kind {
        AxisKind::Continuous { min, max } => AxisValue::Float(0f64.clamp(*min, *max)),
        AxisKind::Discrete { choices } => choices
            .first()
            .cloned()
            .unwrap_or(AxisValue::Float(0.0)),
    }
}

struct MockInner {
    name: String,
    axes: BTreeMap<String, AxisDef>,
    position: Observable<Position>,
    speed: Option<Observable<SpeedMap>>,
    referenced: Option<Observable<ReferenceMap>>,
    state: Observable<ActuatorState>,
    executor: SerialExecutor,
    calls: Mutex<Vec<MockCall>>,
    failures: Mutex<Vec<String>>,
    reference_failures: Mutex<u32>,
    rejections: Mutex<u32>,
    move_delay: Mutex<Duration>,
    stop_delay: Duration,
}

impl MockInner {
    fn take_failure(&self) -> Option<String> {
        let mut failures = self.failures.lock();
        if failures.is_empty() {
            None
        } else {
            Some(failures.remove(0))
        }
    }

    fn travel_time(&self, travel: f64) -> Duration {
        let mut delay = *self.move_delay.lock();
        if let Some(speed) = &self.speed {
            let slowest = speed.get().values().copied().fold(f64::INFINITY, f64::min);
            if slowest.is_finite() && slowest > 0.0 {
                delay += Duration::from_secs_f64(travel / slowest);
            }
        }
        delay
    }

    async fn do_move(&self, kind: MoveKind, values: Position) -> ActuatorResult<()> {
        self.calls.lock().push(match kind {
            MoveKind::Relative => MockCall::MoveRel(values.clone()),
            MoveKind::Absolute => MockCall::MoveAbs(values.clone()),
        });
        if let Some(msg) = self.take_failure() {
            return Err(anyhow::anyhow!("{}: {}", self.name, msg).into());
        }

        let current = self.position.get();
        let mut target = current.clone();
        let mut travel: f64 = 0.0;
        for (axis, value) in &values {
            let new = match kind {
                MoveKind::Relative => {
                    let shift = value.as_f64().unwrap_or(0.0);
                    travel = travel.max(shift.abs());
                    AxisValue::Float(float_of(&current, axis)? + shift)
                }
                MoveKind::Absolute => {
                    if let (Some(from), Some(to)) =
                        (float_of(&current, axis).ok(), value.as_f64())
                    {
                        travel = travel.max((to - from).abs());
                    }
                    value.clone()
                }
            };
            let accepted = self.axes.get(axis).map(|d| d.accepts(&new)).unwrap_or(false);
            if !accepted {
                return Err(ActuatorError::InvalidArgument(format!(
                    "{}: move of '{axis}' to {new} out of range",
                    self.name
                )));
            }
            target.insert(axis.clone(), new);
        }

        debug!("{}: moving to {:?}", self.name, target);
        sleep(self.travel_time(travel)).await;
        self.position.publish(target);
        Ok(())
    }

    async fn do_reference(&self, axes: AxisSet) -> ActuatorResult<()> {
        self.calls.lock().push(MockCall::Reference(axes.clone()));
        let failed = {
            let mut remaining = self.reference_failures.lock();
            if *remaining > 0 {
                *remaining -= 1;
                true
            } else {
                false
            }
        };
        if failed {
            return Err(anyhow::anyhow!("{}: referencing failed", self.name).into());
        }

        let delay = *self.move_delay.lock();
        sleep(delay).await;
        let mut pos = self.position.get();
        for axis in &axes {
            if let Some(def) = self.axes.get(axis) {
                pos.insert(axis.clone(), home_of(def));
            }
        }
        self.position.publish(pos);
        if let Some(referenced) = &self.referenced {
            let mut map = referenced.get();
            for axis in &axes {
                map.insert(axis.clone(), true);
            }
            referenced.publish(map);
        }
        Ok(())
    }
}

/// Simulated multi-axis actuator.
///
/// Clones share the same device.
///
/// # Example
///
/// ```rust,ignore
/// let stage = MockActuator::builder("stage")
///     .axis("x", AxisDef::continuous(-0.01, 0.01).with_unit("m"))
///     .referenceable(false)
///     .build()?;
/// stage.move_abs(position([("x", 1e-3)]))?.await?;
/// assert_eq!(stage.calls().len(), 1);
/// ```
#[derive(Clone)]
pub struct MockActuator {
    inner: Arc<MockInner>,
}

impl std::fmt::Debug for MockActuator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockActuator")
            .field("name", &self.inner.name)
            .field("position", &self.inner.position.get())
            .finish()
    }
}

impl MockActuator {
    pub fn builder(name: impl Into<String>) -> MockActuatorBuilder {
        MockActuatorBuilder {
            name: name.into(),
            axes: BTreeMap::new(),
            initial: Position::new(),
            speed: None,
            referenced: None,
            move_delay: Duration::ZERO,
            stop_delay: Duration::ZERO,
        }
    }

    /// Commands received so far, in execution order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.inner.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.inner.calls.lock().clear();
    }

    /// Make the next move fail with `message`. Failures queue up.
    pub fn fail_next_move(&self, message: impl Into<String>) {
        self.inner.failures.lock().push(message.into());
    }

    /// Make the next `count` references fail.
    pub fn fail_next_references(&self, count: u32) {
        *self.inner.reference_failures.lock() = count;
    }

    /// Refuse the next `count` move requests before they are queued.
    pub fn reject_next_requests(&self, count: u32) {
        *self.inner.rejections.lock() = count;
    }

    pub fn set_move_delay(&self, delay: Duration) {
        *self.inner.move_delay.lock() = delay;
    }

    /// Change the position as if an external event moved the device.
    pub fn set_position(&self, pos: Position) {
        let mut current = self.inner.position.get();
        current.extend(pos);
        self.inner.position.publish(current);
    }

    /// Change the reference status as if the device lost or gained it.
    pub fn set_referenced(&self, referenced: ReferenceMap) {
        if let Some(obs) = &self.inner.referenced {
            let mut current = obs.get();
            current.extend(referenced);
            obs.publish(current);
        }
    }
}

#[async_trait]
impl Actuator for MockActuator {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn role(&self) -> &str {
        "mock"
    }

    fn axes(&self) -> &BTreeMap<String, AxisDef> {
        &self.inner.axes
    }

    fn position(&self) -> &Observable<Position> {
        &self.inner.position
    }

    fn speed(&self) -> Option<&Observable<SpeedMap>> {
        self.inner.speed.as_ref()
    }

    fn set_speed(&self, speeds: SpeedMap) -> ActuatorResult<SpeedMap> {
        let Some(speed) = &self.inner.speed else {
            return Err(ActuatorError::Unsupported(format!(
                "'{}' has no speed control",
                self.inner.name
            )));
        };
        self.inner.calls.lock().push(MockCall::SetSpeed(speeds.clone()));

        let mut current = speed.get();
        let mut applied = SpeedMap::new();
        for (axis, value) in speeds {
            let def = self
                .inner
                .axes
                .get(&axis)
                .ok_or_else(|| ActuatorError::UnknownAxis(axis.clone()))?;
            let value = match def.speed_range {
                Some((min, max)) => value.clamp(min, max),
                None => value,
            };
            current.insert(axis.clone(), value);
            applied.insert(axis, value);
        }
        speed.publish(current);
        Ok(applied)
    }

    fn referenced(&self) -> Option<&Observable<ReferenceMap>> {
        self.inner.referenced.as_ref()
    }

    fn state(&self) -> &Observable<ActuatorState> {
        &self.inner.state
    }

    fn request_move(&self, request: MoveRequest) -> ActuatorResult<MoveFuture> {
        match request.kind {
            MoveKind::Relative => check_move_rel(&self.inner.axes, &request.values)?,
            MoveKind::Absolute => check_move_abs(&self.inner.axes, &request.values)?,
        }
        if request.values.is_empty() {
            return Ok(MoveFuture::ready(Ok(())));
        }
        {
            let mut remaining = self.inner.rejections.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ActuatorError::InvalidArgument(format!(
                    "{}: request refused",
                    self.inner.name
                )));
            }
        }

        let update = update_axes(&self.inner.axes, &request.values, request.update);
        let inner = Arc::clone(&self.inner);
        let MoveRequest { kind, values, .. } = request;
        Ok(self.inner.executor.submit(TaskKind::Move, update, move |_| {
            async move { inner.do_move(kind, values).await }.boxed()
        }))
    }

    fn reference(&self, axes: AxisSet) -> ActuatorResult<MoveFuture> {
        if self.inner.referenced.is_none() {
            return Err(ActuatorError::Unsupported(format!(
                "'{}' cannot be referenced",
                self.inner.name
            )));
        }
        check_reference(&self.inner.axes, &axes)?;
        if axes.is_empty() {
            return Ok(MoveFuture::ready(Ok(())));
        }

        let inner = Arc::clone(&self.inner);
        Ok(self.inner.executor.submit(TaskKind::Reference, None, move |_| {
            async move { inner.do_reference(axes).await }.boxed()
        }))
    }

    async fn stop(&self, axes: Option<AxisSet>) {
        self.inner.executor.cancel();
        self.inner.calls.lock().push(MockCall::Stop(axes));
        sleep(self.inner.stop_delay).await;
    }

    async fn terminate(&self) {
        self.stop(None).await;
        self.inner.executor.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::{axis_set, position};

    fn stage() -> MockActuator {
        MockActuator::builder("stage")
            .axis("x", AxisDef::continuous(-1.0, 1.0))
            .axis("y", AxisDef::continuous(-1.0, 1.0))
            .referenceable(false)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_mock_moves() {
        let stage = stage();
        stage.move_abs(position([("x", 0.5)])).unwrap().await.unwrap();
        stage.move_rel(position([("x", 0.25), ("y", -0.5)])).unwrap().await.unwrap();

        let pos = stage.position().get();
        assert_eq!(pos["x"], AxisValue::Float(0.75));
        assert_eq!(pos["y"], AxisValue::Float(-0.5));
        assert_eq!(stage.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_mock_out_of_range_fails_async() {
        let stage = stage();
        stage.set_position(position([("x", 0.9)]));
        let result = stage.move_rel(position([("x", 0.5)])).unwrap().await;
        assert!(matches!(result, Err(ActuatorError::InvalidArgument(_))));
        assert_eq!(stage.position().get()["x"], AxisValue::Float(0.9));
    }

    #[tokio::test]
    async fn test_mock_reference() {
        let stage = stage();
        stage.set_position(position([("x", 0.3)]));
        stage.reference(axis_set(["x"])).unwrap().await.unwrap();

        assert_eq!(stage.position().get()["x"], AxisValue::Float(0.0));
        let referenced = stage.referenced().unwrap().get();
        assert_eq!(referenced["x"], true);
        assert_eq!(referenced["y"], false);
    }

    #[tokio::test]
    async fn test_mock_failure_injection() {
        let stage = stage();
        stage.fail_next_move("jammed");
        let err = stage.move_abs(position([("x", 0.5)])).unwrap().await.unwrap_err();
        assert!(err.to_string().contains("jammed"));
        assert!(stage.move_abs(position([("x", 0.5)])).unwrap().await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_mock_delay_changes_during_reference() {
        let stage = stage();
        stage.set_move_delay(Duration::from_millis(300));
        let homing = stage.reference(axis_set(["x"])).unwrap();
        sleep(Duration::from_millis(20)).await;

        let handle = stage.clone();
        let update = tokio::task::spawn_blocking(move || {
            handle.set_move_delay(Duration::ZERO);
        });
        tokio::time::timeout(Duration::from_millis(100), update)
            .await
            .expect("delay update blocked by the running reference")
            .unwrap();
        homing.await.unwrap();
    }

    #[tokio::test]
    async fn test_mock_request_rejection() {
        let stage = stage();
        stage.reject_next_requests(1);
        assert!(matches!(
            stage.move_abs(position([("x", 0.5)])),
            Err(ActuatorError::InvalidArgument(_))
        ));
        assert!(stage.calls().is_empty());
        assert!(stage.move_abs(position([("x", 0.5)])).unwrap().await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_speed_is_clamped() {
        let stage = MockActuator::builder("stage")
            .axis("x", AxisDef::continuous(-1.0, 1.0).with_speed_range(0.1, 10.0))
            .speed(1.0)
            .build()
            .unwrap();
        let applied = stage.set_speed(SpeedMap::from([("x".to_string(), 20.0)])).unwrap();
        assert_eq!(applied["x"], 10.0);
        assert_eq!(stage.speed().unwrap().get()["x"], 10.0);
    }

    #[tokio::test]
    async fn test_mock_without_referencing() {
        let stage = MockActuator::builder("stage")
            .axis("x", AxisDef::continuous(-1.0, 1.0))
            .build()
            .unwrap();
        assert!(stage.referenced().is_none());
        assert!(matches!(
            stage.reference(axis_set(["x"])),
            Err(ActuatorError::Unsupported(_))
        ));
    }
}
