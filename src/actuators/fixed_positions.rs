//! Axis restricted to a set of fixed positions, optionally cyclic (e.g. a
//! filter wheel).
//!
//! The exposed position always snaps to the nearest known position. On a
//! cyclic axis moves take the shorter direction; once the travel accumulated
//! since the last referencing reaches a full cycle, the axis is referenced
//! again before completing the move, to get rid of the accumulated error.

use super::{new_state, record_init_failure, stop_dependencies, PausableWatch, Subscriptions};
use crate::axis::{
    check_move_abs, check_move_rel, check_reference, float_of, AxisDef, AxisSet, AxisValue,
    Position, ReferenceMap,
};
use crate::capabilities::{
    Actuator, ActuatorState, Dependency, DependencyMap, MoveKind, MoveRequest,
};
use crate::config::ActuatorSettings;
use crate::cyclic::{distance, find_closest};
use crate::error::{ActuatorError, ActuatorResult};
use crate::executor::{MoveFuture, SerialExecutor, TaskKind};
use crate::observable::Observable;
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// One allowed position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedPosition {
    /// Position of the dependency axis
    pub value: f64,
    /// Human-readable name (e.g. the filter mounted there)
    #[serde(default)]
    pub label: Option<String>,
}

/// Parameters of a [`FixedPositionsActuator`].
///
/// The dependency map given to the constructor has a single entry, keyed by
/// the exposed axis name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixedPositionsConfig {
    /// Axis of the dependency
    pub dependency_axis: String,
    pub positions: Vec<FixedPosition>,
    /// Length of a full turn, if the axis is cyclic
    #[serde(default)]
    pub cycle: Option<f64>,
    #[serde(default)]
    pub settings: ActuatorSettings,
}

impl FixedPositionsConfig {
    pub fn new(
        dependency_axis: impl Into<String>,
        positions: impl IntoIterator<Item = f64>,
    ) -> Self {
        Self {
            dependency_axis: dependency_axis.into(),
            positions: positions
                .into_iter()
                .map(|value| FixedPosition { value, label: None })
                .collect(),
            cycle: None,
            settings: ActuatorSettings::default(),
        }
    }

    pub fn cyclic(mut self, cycle: f64) -> Self {
        self.cycle = Some(cycle);
        self
    }

    fn validate(&self, name: &str) -> ActuatorResult<()> {
        if self.positions.is_empty() {
            return Err(ActuatorError::config(format!("{name}: no positions given")));
        }
        for (i, p) in self.positions.iter().enumerate() {
            if !p.value.is_finite() {
                return Err(ActuatorError::config(format!(
                    "{name}: position {} is not a finite number",
                    p.value
                )));
            }
            if self.positions[..i].iter().any(|q| q.value == p.value) {
                return Err(ActuatorError::config(format!(
                    "{name}: position {} given twice",
                    p.value
                )));
            }
        }
        if let Some(cycle) = self.cycle {
            if !(cycle.is_finite() && cycle > 0.0) {
                return Err(ActuatorError::config(format!(
                    "{name}: cycle must be positive, got {cycle}"
                )));
            }
            if let Some(p) = self.positions.iter().find(|p| !(0.0..cycle).contains(&p.value)) {
                return Err(ActuatorError::config(format!(
                    "{name}: positions must be between 0 and {cycle} (non inclusive), got {}",
                    p.value
                )));
            }
        }
        Ok(())
    }
}

struct Inner {
    name: String,
    role: String,
    axis: String,
    axes: BTreeMap<String, AxisDef>,
    dep: Dependency,
    dep_axis: String,
    positions: Vec<FixedPosition>,
    cycle: Option<f64>,
    /// Distance between the reference switch and the first position
    ref_offset: f64,
    /// Signed travel since the last referencing
    move_sum: Mutex<f64>,
    position: Observable<Position>,
    referenced: Option<Observable<ReferenceMap>>,
    state: Observable<ActuatorState>,
    executor: SerialExecutor,
    settings: ActuatorSettings,
    position_watch: PausableWatch<Position>,
    subscriptions: Subscriptions,
}

impl Inner {
    fn dep_axes(&self) -> AxisSet {
        AxisSet::from([self.dep_axis.clone()])
    }

    fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.positions.iter().map(|p| p.value)
    }

    fn nearest(&self, raw: f64) -> f64 {
        let p = self.cycle.map_or(raw, |c| raw.rem_euclid(c));
        find_closest(p, self.values(), self.cycle).map_or(p, |(v, _)| v)
    }

    fn update_position(&self, dep_pos: &Position) {
        let Ok(raw) = float_of(dep_pos, &self.dep_axis) else {
            return;
        };
        let p = self.cycle.map_or(raw, |c| raw.rem_euclid(c));
        let nearest = self.nearest(raw);
        if distance(p, nearest, self.cycle) > self.settings.snap_warning_tolerance {
            warn!(
                "Reporting axis {} @ {} (known position), while physical axis {} @ {}",
                self.axis, nearest, self.dep_axis, p
            );
        }
        self.position
            .publish(Position::from([(self.axis.clone(), AxisValue::Float(nearest))]));
    }

    async fn do_move_abs(&self, target: f64) -> ActuatorResult<()> {
        debug!("{}: moving axis {} (-> {}) to {}", self.name, self.axis, self.dep_axis, target);
        // Intermediate positions match no known position: don't report them
        let _paused = self.position_watch.pause();

        let Some(cycle) = self.cycle else {
            let pos = Position::from([(self.dep_axis.clone(), AxisValue::Float(target))]);
            return self.dep.actuator.move_abs(pos)?.await;
        };

        let current = float_of(&self.dep.actuator.position().get(), &self.dep_axis)?;
        let forward = (target - current).rem_euclid(cycle);
        let backward = (current - target).rem_euclid(cycle);
        let shift = if forward < backward {
            let full_cycle = {
                let mut move_sum = self.move_sum.lock();
                *move_sum += forward;
                if *move_sum >= cycle {
                    *move_sum = 0.0;
                    true
                } else {
                    false
                }
            };
            if full_cycle {
                // Go to the reference switch, reference, then go from there
                let to_ref = (cycle - current).rem_euclid(cycle) + self.ref_offset;
                info!("{}: full cycle done, referencing again", self.name);
                self.dep
                    .actuator
                    .move_rel(Position::from([(self.dep_axis.clone(), AxisValue::Float(to_ref))]))?
                    .await?;
                self.dep.actuator.reference(self.dep_axes())?.await?;
                target
            } else {
                forward
            }
        } else {
            *self.move_sum.lock() -= backward;
            -backward
        };

        self.dep
            .actuator
            .move_rel(Position::from([(self.dep_axis.clone(), AxisValue::Float(shift))]))?
            .await
    }

    async fn do_reference(&self) -> ActuatorResult<()> {
        debug!("{}: referencing axis {} (-> {})", self.name, self.axis, self.dep_axis);
        self.dep.actuator.reference(self.dep_axes())?.await?;
        *self.move_sum.lock() = 0.0;

        // Homing may end up at an unknown position
        let raw = float_of(&self.dep.actuator.position().get(), &self.dep_axis)?;
        let p = self.cycle.map_or(raw, |c| raw.rem_euclid(c));
        if !self.values().any(|v| v == p) {
            self.do_move_abs(self.nearest(raw)).await?;
        }
        Ok(())
    }
}

/// Axis restricted to predefined positions.
#[derive(Clone)]
pub struct FixedPositionsActuator {
    inner: Arc<Inner>,
}

impl FixedPositionsActuator {
    /// # Errors
    ///
    /// `Configuration` if there is not exactly one dependency, if the
    /// dependency lacks the axis, or if the position table is malformed.
    pub fn new(
        name: impl Into<String>,
        role: impl Into<String>,
        dependencies: DependencyMap,
        config: FixedPositionsConfig,
    ) -> ActuatorResult<Self> {
        let name = name.into();
        config.settings.validate()?;
        config.validate(&name)?;
        if dependencies.len() != 1 {
            return Err(ActuatorError::config(format!(
                "{name}: FixedPositionsActuator needs precisely one dependency"
            )));
        }
        let Some((axis, actuator)) = dependencies.into_iter().next() else {
            return Err(ActuatorError::config(format!("{name}: no dependency")));
        };
        let dep = Dependency::new(actuator);
        let mut def = AxisDef::discrete(config.positions.iter().map(|p| p.value));
        def.unit = dep.axis(&config.dependency_axis)?.unit.clone();

        let referenceable = dep.is_referenced(&config.dependency_axis);
        let referenced = referenceable.map(|r| {
            Observable::new("referenced", ReferenceMap::from([(axis.clone(), r)]))
        });
        let ref_offset = config
            .cycle
            .map_or(0.0, |c| c / config.positions.len() as f64);

        let state = new_state();
        let executor = SerialExecutor::new(name.clone(), state.clone())?;
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let weak = weak.clone();
            Inner {
                name,
                role: role.into(),
                axes: BTreeMap::from([(axis.clone(), def)]),
                axis,
                position_watch: PausableWatch::new(dep.actuator.position(), move |pos: &Position| {
                    if let Some(inner) = weak.upgrade() {
                        inner.update_position(pos);
                    }
                }),
                dep,
                dep_axis: config.dependency_axis,
                positions: config.positions,
                cycle: config.cycle,
                ref_offset,
                move_sum: Mutex::new(0.0),
                position: Observable::new("position", Position::new()),
                referenced,
                state,
                executor,
                settings: config.settings,
                subscriptions: Subscriptions::default(),
            }
        });
        inner.position_watch.resume();
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
        actuator.initialize(referenceable)?;
        Ok(actuator)
    }

    /// Reference if needed (always for a cyclic axis), otherwise go to the
    /// nearest known position.
    fn initialize(&self, referenceable: Option<bool>) -> ActuatorResult<()> {
        let inner = &self.inner;
        let needs_reference = referenceable == Some(false)
            || (inner.cycle.is_some() && referenceable.is_some());
        if needs_reference {
            let fut = self.reference(AxisSet::from([inner.axis.clone()]))?;
            let weak = Arc::downgrade(inner);
            tokio::spawn(async move {
                if let Err(e) = fut.await {
                    if let Some(inner) = weak.upgrade() {
                        let dep = &inner.dep.actuator;
                        record_init_failure(&inner.name, &inner.state, dep, inner.dep_axes(), &e)
                            .await;
                    }
                }
            });
        } else {
            let raw = float_of(&inner.dep.actuator.position().get(), &inner.dep_axis)?;
            let nearest = inner.nearest(raw);
            let target = Position::from([(inner.axis.clone(), AxisValue::Float(nearest))]);
            let _ = self.move_abs(target)?;
        }
        Ok(())
    }

    /// Label of a position, if one was given.
    pub fn label(&self, value: f64) -> Option<&str> {
        self.inner
            .positions
            .iter()
            .find(|p| p.value == value)
            .and_then(|p| p.label.as_deref())
    }

    /// Travel accumulated since the last referencing.
    pub fn accumulated_travel(&self) -> f64 {
        *self.inner.move_sum.lock()
    }
}

#[async_trait]
impl Actuator for FixedPositionsActuator {
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
            async move { inner.do_reference().await }.boxed()
        }))
    }

    async fn stop(&self, axes: Option<AxisSet>) {
        self.inner.executor.cancel();
        if axes.is_some_and(|a| !a.contains(&self.inner.axis)) {
            debug!("{}: no axis of the dependency to stop", self.inner.name);
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
        self.inner.position_watch.release();
        self.inner.subscriptions.release();
    }
}
