//! Single linear axis with an offset, re-homed every few moves.

use super::{new_state, record_init_failure, stop_dependencies, Subscriptions};
use crate::axis::{
    check_move_abs, check_move_rel, check_reference, float_of, AxisDef, AxisSet, AxisValue,
    Position, ReferenceMap,
};
use crate::capabilities::{
    Actuator, ActuatorState, Dependency, DependencyMap, MoveKind, MoveRequest,
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
use tracing::{debug, info, warn};

fn default_ref_period() -> Option<u32> {
    Some(ActuatorSettings::default().linear_reference_period)
}

/// Parameters of a [`LinearActuator`].
///
/// The dependency map given to the constructor has a single entry, keyed by
/// the exposed axis name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearConfig {
    /// Axis of the dependency
    pub dependency_axis: String,
    /// Dependency position of the exposed origin
    #[serde(default)]
    pub offset: f64,
    /// Exposed position from which referencing starts (default: 5 % of the
    /// span, minus the offset)
    #[serde(default)]
    pub ref_start: Option<f64>,
    /// Moves between two referencings, `None` to disable
    #[serde(default = "default_ref_period")]
    pub ref_period: Option<u32>,
    #[serde(default)]
    pub settings: ActuatorSettings,
}

impl LinearConfig {
    pub fn new(dependency_axis: impl Into<String>) -> Self {
        let settings = ActuatorSettings::default();
        Self {
            dependency_axis: dependency_axis.into(),
            offset: 0.0,
            ref_start: None,
            ref_period: Some(settings.linear_reference_period),
            settings,
        }
    }
}

struct Inner {
    name: String,
    role: String,
    axis: String,
    axes: BTreeMap<String, AxisDef>,
    dep: Dependency,
    dep_axis: String,
    offset: f64,
    ref_start: f64,
    ref_period: Option<u32>,
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

    async fn reference_if_needed(&self) -> ActuatorResult<()> {
        let due = {
            let mut move_num = self.move_num.lock();
            *move_num += 1;
            self.ref_period.is_some_and(|period| *move_num > period)
        };
        if !due {
            return Ok(());
        }

        debug!("{}: moving to reference starting position {}", self.name, self.ref_start);
        let start = Position::from([(
            self.dep_axis.clone(),
            AxisValue::Float(self.ref_start + self.offset),
        )]);
        self.dep.actuator.move_abs(start)?.await?;
        debug!("{}: referencing axis {} (-> {})", self.name, self.axis, self.dep_axis);
        self.dep.actuator.reference(self.dep_axes())?.await?;
        *self.move_num.lock() = 0;
        Ok(())
    }

    async fn do_move(&self, kind: MoveKind, values: Position) -> ActuatorResult<()> {
        self.reference_if_needed().await?;
        let v = float_of(&values, &self.axis)?;
        let dep_value = match kind {
            MoveKind::Relative => v,
            MoveKind::Absolute => v + self.offset,
        };
        let request = MoveRequest {
            kind,
            values: Position::from([(self.dep_axis.clone(), AxisValue::Float(dep_value))]),
            update: false,
        };
        self.dep.actuator.request_move(request)?.await
    }

    async fn do_reference(&self) -> ActuatorResult<()> {
        *self.move_num.lock() = 0;
        self.dep.actuator.reference(self.dep_axes())?.await
    }
}

/// Linear axis with an offset, referenced periodically.
#[derive(Clone)]
pub struct LinearActuator {
    inner: Arc<Inner>,
}

impl LinearActuator {
    /// # Errors
    ///
    /// `Configuration` if there is not exactly one dependency, if it lacks
    /// the axis, or if the reference start lies outside the exposed range.
    pub fn new(
        name: impl Into<String>,
        role: impl Into<String>,
        dependencies: DependencyMap,
        config: LinearConfig,
    ) -> ActuatorResult<Self> {
        let name = name.into();
        config.settings.validate()?;
        if dependencies.len() != 1 {
            return Err(ActuatorError::config(format!(
                "{name}: LinearActuator needs precisely one dependency"
            )));
        }
        let Some((axis, actuator)) = dependencies.into_iter().next() else {
            return Err(ActuatorError::config(format!("{name}: no dependency")));
        };
        let dep = Dependency::new(actuator);
        let dep_def = dep.axis(&config.dependency_axis)?;
        let Some((dmin, dmax)) = dep_def.range() else {
            return Err(ActuatorError::config(format!(
                "{name}: dependency axis '{}' must be continuous",
                config.dependency_axis
            )));
        };
        let (min, max) = (dmin - config.offset, dmax - config.offset);
        let mut def = AxisDef::continuous(min, max);
        def.unit = dep_def.unit.clone();

        let ref_start = config
            .ref_start
            .unwrap_or((max - min).abs() * 0.05 - config.offset);
        if !(min <= ref_start && ref_start <= max) {
            return Err(ActuatorError::config(format!(
                "{name}: reference start needs to be between {min} and {max}, got {ref_start}"
            )));
        }

        let referenceable = dep.is_referenced(&config.dependency_axis);
        let ref_period = if referenceable.is_none() && config.ref_period.is_some() {
            warn!(
                "{}: dependency {} cannot be referenced, periodic referencing disabled",
                name,
                dep.name()
            );
            None
        } else {
            config.ref_period
        };

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
            offset: config.offset,
            ref_start,
            ref_period,
            move_num: Mutex::new(0),
            position: Observable::new("position", Position::new()),
            referenced,
            state,
            executor,
            settings: config.settings,
            subscriptions: Subscriptions::default(),
        });
        Self::subscribe(&inner);
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
        } else if referenceable == Some(true) {
            // Start from where the axis already is; counts as a move
            let inner = &actuator.inner;
            let raw = float_of(&inner.dep.actuator.position().get(), &inner.dep_axis)?;
            let current = AxisValue::Float(raw - inner.offset);
            let _ = actuator.move_abs(Position::from([(inner.axis.clone(), current)]))?;
        }
        Ok(actuator)
    }

    fn subscribe(inner: &Arc<Inner>) {
        let weak = Arc::downgrade(inner);
        inner
            .subscriptions
            .watch(inner.dep.actuator.position(), true, move |pos: &Position| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if let Ok(v) = float_of(pos, &inner.dep_axis) {
                    inner.position.publish(Position::from([(
                        inner.axis.clone(),
                        AxisValue::Float(v - inner.offset),
                    )]));
                }
            });

        if let Some(dep_ref) = inner.dep.actuator.referenced() {
            let weak = Arc::downgrade(inner);
            inner
                .subscriptions
                .watch(dep_ref, true, move |referenced: &ReferenceMap| {
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
    }

    /// Moves since the last referencing.
    pub fn moves_since_reference(&self) -> u32 {
        *self.inner.move_num.lock()
    }
}

#[async_trait]
impl Actuator for LinearActuator {
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
        let inner = Arc::clone(&self.inner);
        let MoveRequest { kind, values, .. } = request;
        Ok(self.inner.executor.submit(TaskKind::Move, None, move |_| {
            async move { inner.do_move(kind, values).await }.boxed()
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

    async fn stop(&self, _axes: Option<AxisSet>) {
        self.inner.executor.cancel();
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::{axis_set, position};
    use crate::hardware::{MockActuator, MockCall};

    fn rail(referenced: Option<bool>) -> MockActuator {
        let mut builder = MockActuator::builder("rail").axis("r", AxisDef::continuous(0.0, 10.0));
        if let Some(r) = referenced {
            builder = builder.referenceable(r);
        }
        builder.build().unwrap()
    }

    fn linear(dep: &MockActuator, config: LinearConfig) -> ActuatorResult<LinearActuator> {
        let deps: DependencyMap =
            BTreeMap::from([("z".to_string(), Arc::new(dep.clone()) as Arc<dyn Actuator>)]);
        LinearActuator::new("lin", "focus", deps, config)
    }

    #[tokio::test]
    async fn test_offset_applied() {
        let dep = rail(Some(true));
        let lin = linear(
            &dep,
            LinearConfig {
                offset: 2.0,
                ..LinearConfig::new("r")
            },
        )
        .unwrap();
        assert_eq!(lin.axes()["z"].range(), Some((-2.0, 8.0)));
        assert_eq!(lin.position().get(), position([("z", -2.0)]));

        lin.move_abs(position([("z", 1.0)])).unwrap().await.unwrap();
        lin.move_rel(position([("z", 0.5)])).unwrap().await.unwrap();
        assert_eq!(
            dep.calls(),
            vec![
                MockCall::MoveAbs(position([("r", 0.0)])),
                MockCall::MoveAbs(position([("r", 3.0)])),
                MockCall::MoveRel(position([("r", 0.5)])),
            ]
        );
        assert_eq!(lin.position().get(), position([("z", 1.5)]));
    }

    #[tokio::test]
    async fn test_periodic_referencing() {
        let dep = rail(Some(true));
        let lin = linear(
            &dep,
            LinearConfig {
                ref_start: Some(1.0),
                ref_period: Some(2),
                ..LinearConfig::new("r")
            },
        )
        .unwrap();

        for _ in 0..3 {
            lin.move_rel(position([("z", 1.0)])).unwrap().await.unwrap();
        }
        // The move to the current position at init is the first of the period
        assert_eq!(
            dep.calls(),
            vec![
                MockCall::MoveAbs(position([("r", 0.0)])),
                MockCall::MoveRel(position([("r", 1.0)])),
                MockCall::MoveAbs(position([("r", 1.0)])),
                MockCall::Reference(axis_set(["r"])),
                MockCall::MoveRel(position([("r", 1.0)])),
                MockCall::MoveRel(position([("r", 1.0)])),
            ]
        );
        assert_eq!(lin.moves_since_reference(), 1);
    }

    #[tokio::test]
    async fn test_referenced_dependency_moves_to_current_position() {
        let dep = MockActuator::builder("rail")
            .axis("r", AxisDef::continuous(0.0, 10.0))
            .at("r", 4.0)
            .referenceable(true)
            .build()
            .unwrap();
        let lin = linear(
            &dep,
            LinearConfig {
                offset: 1.0,
                ..LinearConfig::new("r")
            },
        )
        .unwrap();

        lin.move_rel(position([("z", 0.5)])).unwrap().await.unwrap();
        assert_eq!(
            dep.calls(),
            vec![
                MockCall::MoveAbs(position([("r", 4.0)])),
                MockCall::MoveRel(position([("r", 0.5)])),
            ]
        );
        assert_eq!(lin.moves_since_reference(), 2);
        assert_eq!(lin.position().get(), position([("z", 3.5)]));
    }

    #[tokio::test]
    async fn test_reference_at_init_when_unreferenced() {
        let dep = rail(Some(false));
        let lin = linear(&dep, LinearConfig::new("r")).unwrap();
        lin.move_abs(position([("z", 4.0)])).unwrap().await.unwrap();

        assert_eq!(dep.calls()[0], MockCall::Reference(axis_set(["r"])));
        assert_eq!(lin.referenced().unwrap().get()["z"], true);
    }

    #[tokio::test]
    async fn test_ref_start_out_of_range() {
        let dep = rail(Some(true));
        let config = LinearConfig {
            ref_start: Some(20.0),
            ..LinearConfig::new("r")
        };
        assert!(matches!(linear(&dep, config), Err(ActuatorError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_not_referenceable_dependency() {
        let dep = rail(None);
        let lin = linear(&dep, LinearConfig::new("r")).unwrap();
        assert!(lin.referenced().is_none());
        for _ in 0..12 {
            lin.move_abs(position([("z", 1.0)])).unwrap().await.unwrap();
        }
        assert!(!dep.calls().iter().any(|c| matches!(c, MockCall::Reference(_))));
    }
}
