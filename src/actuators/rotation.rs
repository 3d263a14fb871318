//! Axis doing complete turns, reported within `[0, cycle)`.
//!
//! Every move goes the short way round. The dependency is re-homed whenever a
//! move crosses the reference switch and every few moves, so that the error
//! does not accumulate over turns.

use super::{new_state, record_init_failure, stop_dependencies, Subscriptions};
use crate::axis::{
    check_move_abs, check_move_rel, check_reference, float_of, AxisDef, AxisSet, AxisValue,
    Position, ReferenceMap,
};
use crate::capabilities::{
    Actuator, ActuatorState, CorrectionMetadata, Dependency, DependencyMap, MoveKind, MoveRequest,
};
use crate::config::ActuatorSettings;
use crate::cyclic::shortest_cyclic_move;
use crate::error::{ActuatorError, ActuatorResult};
use crate::executor::{MoveFuture, SerialExecutor, TaskKind};
use crate::observable::Observable;
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::f64::consts::TAU;
use std::sync::Arc;
use tracing::{debug, error, info};

fn default_cycle() -> f64 {
    TAU
}

/// Parameters of a [`RotationActuator`].
///
/// The dependency map given to the constructor has a single entry, keyed by
/// the exposed axis name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationConfig {
    /// Axis of the dependency
    pub dependency_axis: String,
    /// Length of a full turn (default 2π)
    #[serde(default = "default_cycle")]
    pub cycle: f64,
    /// Position close to the reference switch, from where referencing starts
    /// (default: 5 % of the cycle)
    #[serde(default)]
    pub ref_start: Option<f64>,
    #[serde(default)]
    pub settings: ActuatorSettings,
}

impl RotationConfig {
    pub fn new(dependency_axis: impl Into<String>) -> Self {
        Self {
            dependency_axis: dependency_axis.into(),
            cycle: default_cycle(),
            ref_start: None,
            settings: ActuatorSettings::default(),
        }
    }

    pub fn with_cycle(mut self, cycle: f64) -> Self {
        self.cycle = cycle;
        self
    }
}

struct Inner {
    name: String,
    role: String,
    axis: String,
    axes: BTreeMap<String, AxisDef>,
    dep: Dependency,
    dep_axis: String,
    cycle: f64,
    ref_start: f64,
    /// Whether the dependency can be re-homed at all
    rehoming: bool,
    /// Mounting offset, folded into every conversion
    offset: Mutex<f64>,
    /// Moves since the last referencing
    move_num: Mutex<u32>,
    position: Observable<Position>,
    referenced: Option<Observable<ReferenceMap>>,
    state: Observable<ActuatorState>,
    executor: SerialExecutor,
    settings: ActuatorSettings,
    subscriptions: Subscriptions,
}

impl Inner {
    fn dep_axes(&self) -> AxisSet {
        AxisSet::from([self.dep_axis.clone()])
    }

    fn raw(&self) -> ActuatorResult<f64> {
        float_of(&self.dep.actuator.position().get(), &self.dep_axis)
    }

    fn update_position(&self, dep_pos: &Position) {
        let Ok(raw) = float_of(dep_pos, &self.dep_axis) else {
            return;
        };
        let p = (raw - *self.offset.lock()).rem_euclid(self.cycle);
        debug!("{}: reporting position {}", self.name, p);
        self.position
            .publish(Position::from([(self.axis.clone(), AxisValue::Float(p))]));
    }

    /// Shortest relative move to `target` and the current raw position.
    fn shortest_move(&self, target: f64) -> ActuatorResult<(f64, f64)> {
        let current = self.raw()?;
        Ok((shortest_cyclic_move(current, target, self.cycle), current))
    }

    async fn move_dep_rel(&self, shift: f64) -> ActuatorResult<()> {
        self.dep
            .actuator
            .move_rel(Position::from([(self.dep_axis.clone(), AxisValue::Float(shift))]))?
            .await
    }

    /// `target` is in exposed coordinates, possibly outside `[0, cycle)`.
    async fn do_move_abs(&self, target: f64) -> ActuatorResult<()> {
        let target = target + *self.offset.lock();
        debug!("{}: moving axis {} (-> {}) to {}", self.name, self.axis, self.dep_axis, target);

        let due = {
            let mut move_num = self.move_num.lock();
            *move_num += 1;
            *move_num >= self.settings.rotation_reference_period
        };
        let (mut shift, current) = self.shortest_move(target)?;

        // The reference switch sits at every multiple of the cycle
        let final_pos = current + shift;
        let pass_ref = (current / self.cycle).floor() != (final_pos / self.cycle).floor();
        if self.rehoming && (pass_ref || due) {
            let (to_start, _) = self.shortest_move(self.ref_start)?;
            info!("{}: re-homing before moving (passing switch: {})", self.name, pass_ref);
            self.move_dep_rel(to_start).await?;
            self.dep.actuator.reference(self.dep_axes())?.await?;
            shift = self.shortest_move(target)?.0;
            *self.move_num.lock() = 0;
        }

        self.move_dep_rel(shift).await
    }

    async fn do_move_rel(&self, shift: f64) -> ActuatorResult<()> {
        let current = self.raw()? - *self.offset.lock();
        self.do_move_abs(current + shift).await
    }

    async fn do_reference(&self) -> ActuatorResult<()> {
        debug!("{}: referencing axis {} (-> {})", self.name, self.axis, self.dep_axis);
        self.dep.actuator.reference(self.dep_axes())?.await?;
        *self.move_num.lock() = 0;
        Ok(())
    }
}

/// Rotation axis unrolled into `[0, cycle)`.
#[derive(Clone)]
pub struct RotationActuator {
    inner: Arc<Inner>,
}

impl RotationActuator {
    /// # Errors
    ///
    /// `Configuration` if there is not exactly one dependency, if it lacks
    /// the axis, if the cycle is not positive or if the reference start lies
    /// outside `[0, cycle]`.
    pub fn new(
        name: impl Into<String>,
        role: impl Into<String>,
        dependencies: DependencyMap,
        config: RotationConfig,
    ) -> ActuatorResult<Self> {
        let name = name.into();
        config.settings.validate()?;
        if dependencies.len() != 1 {
            return Err(ActuatorError::config(format!(
                "{name}: RotationActuator needs precisely one dependency"
            )));
        }
        let Some((axis, actuator)) = dependencies.into_iter().next() else {
            return Err(ActuatorError::config(format!("{name}: no dependency")));
        };
        let cycle = config.cycle;
        if !(cycle.is_finite() && cycle > 0.0) {
            return Err(ActuatorError::config(format!(
                "{name}: cycle needs to be a positive number, got {cycle}"
            )));
        }
        let ref_start = config.ref_start.unwrap_or(cycle * 0.05);
        if !(0.0..=cycle).contains(&ref_start) {
            return Err(ActuatorError::config(format!(
                "{name}: reference start needs to be within 0 and {cycle}, got {ref_start}"
            )));
        }

        let dep = Dependency::new(actuator);
        let mut def = AxisDef::continuous(0.0, cycle);
        def.unit = dep.axis(&config.dependency_axis)?.unit.clone();
        let referenceable = dep.is_referenced(&config.dependency_axis);
        let referenced = referenceable.map(|r| {
            Observable::new("referenced", ReferenceMap::from([(axis.clone(), r)]))
        });

        let state = new_state();
        let executor = SerialExecutor::new(name.clone(), state.clone())?;
        let inner = Arc::new(Inner {
            name,
            role: role.into(),
            axes: BTreeMap::from([(axis.clone(), def)]),
            axis,
            dep,
            dep_axis: config.dependency_axis,
            cycle,
            ref_start,
            rehoming: referenceable.is_some(),
            offset: Mutex::new(0.0),
            move_num: Mutex::new(0),
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
            .watch(inner.dep.actuator.position(), true, move |pos: &Position| {
                if let Some(inner) = weak.upgrade() {
                    inner.update_position(pos);
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
                        (referenced.get(&inner.dep_axis), &inner.referenced)
                    {
                        obs.publish(ReferenceMap::from([(inner.axis.clone(), r)]));
                    }
                });
        }
        inner.state.publish(ActuatorState::Idle);

        let actuator = Self { inner };
        if referenceable == Some(false) {
            info!("{}: dependency not referenced, referencing at init", actuator.inner.name);
            let fut = actuator.reference(AxisSet::from([actuator.inner.axis.clone()]))?;
            let weak = Arc::downgrade(&actuator.inner);
            tokio::spawn(async move {
                if let Err(e) = fut.await {
                    if let Some(inner) = weak.upgrade() {
                        let dep = &inner.dep.actuator;
                        record_init_failure(&inner.name, &inner.state, dep, inner.dep_axes(), &e)
                            .await;
                    }
                }
            });
        }
        Ok(actuator)
    }

    /// Current mounting offset.
    pub fn offset(&self) -> f64 {
        *self.inner.offset.lock()
    }
}

#[async_trait]
impl Actuator for RotationActuator {
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
        match request.kind {
            MoveKind::Relative => check_move_rel(&self.inner.axes, &request.values)?,
            MoveKind::Absolute => check_move_abs(&self.inner.axes, &request.values)?,
        }
        if request.values.is_empty() {
            return Ok(MoveFuture::ready(Ok(())));
        }
        let value = float_of(&request.values, &self.inner.axis)?;
        let kind = request.kind;
        let inner = Arc::clone(&self.inner);
        Ok(self.inner.executor.submit(TaskKind::Move, None, move |_| {
            async move {
                match kind {
                    MoveKind::Relative => inner.do_move_rel(value).await,
                    MoveKind::Absolute => inner.do_move_abs(value).await,
                }
            }
            .boxed()
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
            async move { inner.do_reference().await }.boxed()
        }))
    }

    async fn stop(&self, axes: Option<AxisSet>) {
        self.inner.executor.cancel();
        if axes.is_some_and(|a| !a.contains(&self.inner.axis)) {
            return;
        }
        stop_dependencies(
            &self.inner.name,
            vec![(Arc::clone(&self.inner.dep.actuator), Some(self.inner.dep_axes()))],
            self.inner.settings.stop_timeout(),
        )
        .await;
    }

    async fn terminate(&self) {
        self.stop(None).await;
        self.inner.executor.shutdown().await;
        self.inner.subscriptions.release();
    }

    fn update_metadata(&self, metadata: CorrectionMetadata) -> ActuatorResult<()> {
        if metadata.rotation.is_some() || metadata.scale.is_some() || metadata.translation.is_some()
        {
            return Err(ActuatorError::Unsupported(format!(
                "'{}' only accepts a position offset",
                self.inner.name
            )));
        }
        let Some(offset) = metadata.position_offset else {
            return Ok(());
        };
        let half = self.inner.cycle / 2.0;
        if !(offset.is_finite() && offset.abs() <= half) {
            error!(
                "{}: position offset {} is not allowed, it should be within -{} and +{}",
                self.inner.name, offset, half, half
            );
            return Err(ActuatorError::InvalidArgument(format!(
                "position offset {offset} outside [-{half}, {half}]"
            )));
        }
        *self.inner.offset.lock() = offset;
        self.inner.update_position(&self.inner.dep.actuator.position().get());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::{axis_set, position};
    use crate::hardware::{MockActuator, MockCall};

    fn spindle(referenced: Option<bool>) -> MockActuator {
        let mut builder =
            MockActuator::builder("spindle").axis("rz", AxisDef::continuous(-10_000.0, 10_000.0));
        if let Some(r) = referenced {
            builder = builder.referenceable(r);
        }
        builder.build().unwrap()
    }

    fn rotation(dep: &MockActuator, config: RotationConfig) -> ActuatorResult<RotationActuator> {
        let deps: DependencyMap =
            BTreeMap::from([("rz".to_string(), Arc::new(dep.clone()) as Arc<dyn Actuator>)]);
        RotationActuator::new("rot", "rotator", deps, config)
    }

    #[tokio::test]
    async fn test_position_wraps() {
        let dep = spindle(None);
        let rot = rotation(&dep, RotationConfig::new("rz").with_cycle(360.0)).unwrap();
        dep.set_position(position([("rz", 370.0)]));
        assert_eq!(rot.position().get(), position([("rz", 10.0)]));
        dep.set_position(position([("rz", -90.0)]));
        assert_eq!(rot.position().get(), position([("rz", 270.0)]));
    }

    #[tokio::test]
    async fn test_rehoming_after_several_moves() {
        let dep = spindle(Some(true));
        dep.set_position(position([("rz", 10.0)]));
        let rot = rotation(&dep, RotationConfig::new("rz").with_cycle(360.0)).unwrap();

        for target in [20.0, 30.0, 40.0, 50.0, 60.0] {
            rot.move_abs(position([("rz", target)])).unwrap().await.unwrap();
        }
        let calls = dep.calls();
        assert_eq!(calls.len(), 7);
        assert_eq!(calls[4], MockCall::MoveRel(position([("rz", -32.0)])));
        assert_eq!(calls[5], MockCall::Reference(axis_set(["rz"])));
        assert_eq!(calls[6], MockCall::MoveRel(position([("rz", 60.0)])));
        assert_eq!(rot.position().get(), position([("rz", 60.0)]));
    }

    #[tokio::test]
    async fn test_rehoming_when_passing_switch() {
        let dep = spindle(Some(true));
        dep.set_position(position([("rz", 350.0)]));
        let rot = rotation(&dep, RotationConfig::new("rz").with_cycle(360.0)).unwrap();

        rot.move_abs(position([("rz", 10.0)])).unwrap().await.unwrap();
        let calls = dep.calls();
        assert_eq!(calls[1], MockCall::Reference(axis_set(["rz"])));
        assert_eq!(calls[2], MockCall::MoveRel(position([("rz", 10.0)])));
    }

    #[tokio::test]
    async fn test_relative_move() {
        let dep = spindle(None);
        dep.set_position(position([("rz", 1.0)]));
        let rot = rotation(&dep, RotationConfig::new("rz")).unwrap();
        rot.move_rel(position([("rz", 0.5)])).unwrap().await.unwrap();
        assert_eq!(dep.calls(), vec![MockCall::MoveRel(position([("rz", 0.5)]))]);
    }

    #[tokio::test]
    async fn test_position_offset() {
        let dep = spindle(None);
        dep.set_position(position([("rz", 1.0)]));
        let rot = rotation(&dep, RotationConfig::new("rz")).unwrap();

        rot.update_metadata(CorrectionMetadata {
            position_offset: Some(0.5),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(rot.position().get(), position([("rz", 0.5)]));

        let err = rot.update_metadata(CorrectionMetadata {
            position_offset: Some(4.0),
            ..Default::default()
        });
        assert!(matches!(err, Err(ActuatorError::InvalidArgument(_))));
        assert_eq!(rot.offset(), 0.5);
    }

    #[tokio::test]
    async fn test_invalid_parameters() {
        let dep = spindle(None);
        assert!(rotation(&dep, RotationConfig::new("rz").with_cycle(-1.0)).is_err());
        let config = RotationConfig {
            ref_start: Some(7.0),
            ..RotationConfig::new("rz")
        };
        assert!(matches!(rotation(&dep, config), Err(ActuatorError::Configuration(_))));
    }
}
