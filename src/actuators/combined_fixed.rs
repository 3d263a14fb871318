//! One discrete axis defined by the joint position of two dependency axes
//! (e.g. two polarization filters rotated together).

use super::{join_moves, new_state, stop_dependencies, PausableWatch, Subscriptions};
use crate::axis::{
    check_move_abs, check_reference, AxisDef, AxisSet, AxisValue, Position, ReferenceMap,
};
use crate::capabilities::{
    Actuator, ActuatorState, Dependency, DependencyMap, MoveKind, MoveRequest,
};
use crate::config::ActuatorSettings;
use crate::cyclic::distance;
use crate::error::{ActuatorError, ActuatorResult};
use crate::executor::{MoveFuture, SerialExecutor, TaskKind};
use crate::observable::Observable;
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Parameters of a [`CombinedFixedPositionActuator`].
///
/// The two dependencies are taken in the order of their roles; every
/// per-dependency list follows that order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinedFixedPositionConfig {
    /// Name of the exposed axis
    pub axis: String,
    /// Axis name in each dependency
    pub dependency_axes: Vec<String>,
    /// Label and position of each dependency axis, in matching order
    pub positions: Vec<(String, Vec<f64>)>,
    /// Label reported when no entry matches
    pub fallback: String,
    /// Absolute tolerance of each dependency (default 0)
    #[serde(default)]
    pub atol: Option<Vec<f64>>,
    /// Cycle of each dependency, `None` for a non-cyclic axis
    #[serde(default)]
    pub cycle: Option<Vec<Option<f64>>>,
    #[serde(default)]
    pub settings: ActuatorSettings,
}

impl CombinedFixedPositionConfig {
    pub fn new(
        axis: impl Into<String>,
        dependency_axes: [&str; 2],
        positions: impl IntoIterator<Item = (&'static str, [f64; 2])>,
        fallback: impl Into<String>,
    ) -> Self {
        Self {
            axis: axis.into(),
            dependency_axes: dependency_axes.iter().map(|a| a.to_string()).collect(),
            positions: positions
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_vec()))
                .collect(),
            fallback: fallback.into(),
            atol: None,
            cycle: None,
            settings: ActuatorSettings::default(),
        }
    }
}

/// A dependency together with the axis driven on it.
struct Member {
    dep: Dependency,
    axis: String,
    atol: f64,
    cycle: Option<f64>,
    watch: PausableWatch<Position>,
}

impl Member {
    fn raw(&self) -> Option<f64> {
        self.dep
            .actuator
            .position()
            .get()
            .get(&self.axis)
            .and_then(AxisValue::as_f64)
    }

    fn axes(&self) -> AxisSet {
        AxisSet::from([self.axis.clone()])
    }
}

struct Inner {
    name: String,
    role: String,
    axis: String,
    axes: BTreeMap<String, AxisDef>,
    members: Vec<Member>,
    table: Vec<(String, Vec<f64>)>,
    fallback: String,
    position: Observable<Position>,
    referenced: Option<Observable<ReferenceMap>>,
    state: Observable<ActuatorState>,
    executor: SerialExecutor,
    settings: ActuatorSettings,
    subscriptions: Subscriptions,
}

impl Inner {
    fn entry(&self, label: &str) -> Option<&[f64]> {
        self.table
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, target)| target.as_slice())
    }

    fn raw_positions(&self) -> Option<Vec<f64>> {
        self.members.iter().map(Member::raw).collect()
    }

    /// First table entry matching the current dependency positions.
    fn matching_label(&self, raw: &[f64]) -> Option<&str> {
        self.table
            .iter()
            .find(|(_, target)| {
                self.members
                    .iter()
                    .zip(raw.iter().zip(target.iter()))
                    .all(|(m, (&cur, &t))| distance(cur, t, m.cycle) <= m.atol)
            })
            .map(|(label, _)| label.as_str())
    }

    fn closest_label(&self, raw: &[f64]) -> Option<&str> {
        self.table
            .iter()
            .map(|(label, target)| {
                let dist: f64 = self
                    .members
                    .iter()
                    .zip(raw.iter().zip(target.iter()))
                    .map(|(m, (&cur, &t))| distance(cur, t, m.cycle))
                    .sum();
                (label, dist)
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(label, _)| label.as_str())
    }

    fn update_position(&self) {
        let Some(raw) = self.raw_positions() else {
            return;
        };
        let label = match self.matching_label(&raw) {
            Some(label) => label.to_string(),
            None => {
                warn!(
                    "{}: current position does not match any known position, reporting {}. Positions of {:?} are {:?}",
                    self.name,
                    self.fallback,
                    self.members.iter().map(|m| m.axis.as_str()).collect::<Vec<_>>(),
                    raw
                );
                self.fallback.clone()
            }
        };
        debug!("{}: reporting position {}", self.name, label);
        self.position
            .publish(Position::from([(self.axis.clone(), AxisValue::Label(label))]));
    }

    fn update_referenced(&self) {
        let Some(obs) = &self.referenced else {
            return;
        };
        let referenced = self
            .members
            .iter()
            .filter_map(|m| m.dep.is_referenced(&m.axis))
            .all(|r| r);
        obs.publish(ReferenceMap::from([(self.axis.clone(), referenced)]));
    }

    /// Move all dependencies to the entry, without pausing the position watch.
    async fn move_members(&self, label: &str) -> ActuatorResult<()> {
        let Some(target) = self.entry(label) else {
            return Err(ActuatorError::InvalidArgument(format!("unknown position '{label}'")));
        };
        debug!("{}: moving axis {} to {} ({:?})", self.name, self.axis, label, target);
        let mut futures = Vec::with_capacity(self.members.len());
        let mut rejected = None;
        for (m, &t) in self.members.iter().zip(target.iter()) {
            match m
                .dep
                .actuator
                .move_abs(Position::from([(m.axis.clone(), AxisValue::Float(t))]))
            {
                Ok(f) => futures.push(f),
                Err(e) => {
                    rejected.get_or_insert(e);
                }
            }
        }
        // Moves already submitted run to completion before reporting
        let result = join_moves(futures).await;
        self.update_position();
        match rejected {
            Some(e) => Err(e),
            None => result,
        }
    }

    async fn do_move_abs(&self, label: String) -> ActuatorResult<()> {
        // Intermediate positions match nothing: don't report the fallback meanwhile
        let _paused: Vec<_> = self.members.iter().map(|m| m.watch.pause()).collect();
        self.move_members(&label).await
    }

    async fn do_reference(&self) -> ActuatorResult<()> {
        let _paused: Vec<_> = self.members.iter().map(|m| m.watch.pause()).collect();

        let mut futures = Vec::new();
        for m in self.members.iter().filter(|m| m.dep.is_referenced(&m.axis).is_some()) {
            futures.push(m.dep.actuator.reference(m.axes())?);
        }
        join_moves(futures).await?;

        let raw = self.raw_positions().ok_or_else(|| {
            ActuatorError::Other(anyhow::anyhow!("dependency position unavailable"))
        })?;
        if self.matching_label(&raw).is_none() {
            // Homing ended up at an unsupported position
            if let Some(label) = self.closest_label(&raw).map(str::to_string) {
                self.move_members(&label).await?;
            }
        }
        Ok(())
    }
}

/// Discrete axis over two dependency axes.
#[derive(Clone)]
pub struct CombinedFixedPositionActuator {
    inner: Arc<Inner>,
}

impl CombinedFixedPositionActuator {
    /// # Errors
    ///
    /// `Configuration` if there are not exactly two dependencies, if the
    /// per-dependency lists have the wrong length, or if a table entry cannot
    /// be reached.
    pub fn new(
        name: impl Into<String>,
        role: impl Into<String>,
        dependencies: DependencyMap,
        config: CombinedFixedPositionConfig,
    ) -> ActuatorResult<Self> {
        let name = name.into();
        config.settings.validate()?;
        let n = dependencies.len();
        if n != 2 {
            return Err(ActuatorError::config(format!(
                "{name}: CombinedFixedPositionActuator needs precisely two dependencies"
            )));
        }
        if config.dependency_axes.len() != n {
            return Err(ActuatorError::config(format!(
                "{name}: needs precisely {n} axis names for dependencies axes"
            )));
        }
        let atol = config.atol.clone().unwrap_or_else(|| vec![0.0; n]);
        let cycle = config.cycle.clone().unwrap_or_else(|| vec![None; n]);
        if atol.len() != n || cycle.len() != n {
            return Err(ActuatorError::config(format!(
                "{name}: atol and cycle need precisely {n} values"
            )));
        }
        if let Some(c) = cycle.iter().flatten().find(|c| !(c.is_finite() && **c > 0.0)) {
            return Err(ActuatorError::config(format!("{name}: invalid cycle {c}")));
        }
        if config.positions.is_empty() {
            return Err(ActuatorError::config(format!("{name}: no positions given")));
        }
        for (i, (label, _)) in config.positions.iter().enumerate() {
            if config.positions[..i].iter().any(|(l, _)| l == label) {
                return Err(ActuatorError::config(format!("{name}: duplicate position {label}")));
            }
        }

        let mut deps = Vec::with_capacity(n);
        // Roles in sorted order
        for (i, dep) in dependencies.into_values().map(Dependency::new).enumerate() {
            let def = dep.axis(&config.dependency_axes[i])?;
            for (label, target) in &config.positions {
                let Some(&t) = target.get(i).filter(|_| target.len() == n) else {
                    return Err(ActuatorError::config(format!(
                        "{name}: position {label} needs precisely {n} entries, got {target:?}"
                    )));
                };
                if !def.accepts(&AxisValue::Float(t)) {
                    return Err(ActuatorError::config(format!(
                        "{name}: position {t} of {label} is out of range for '{}'",
                        dep.name()
                    )));
                }
            }
            deps.push(dep);
        }

        let mut choices: Vec<String> = config.positions.iter().map(|(l, _)| l.clone()).collect();
        if !choices.contains(&config.fallback) {
            choices.push(config.fallback.clone());
        }
        let referenceable = deps
            .iter()
            .zip(&config.dependency_axes)
            .any(|(d, a)| d.is_referenced(a).is_some());

        let state = new_state();
        let executor = SerialExecutor::new(name.clone(), state.clone())?;
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let members = deps
                .into_iter()
                .zip(config.dependency_axes)
                .zip(atol.into_iter().zip(cycle))
                .map(|((dep, axis), (atol, cycle))| {
                    let weak = weak.clone();
                    Member {
                        watch: PausableWatch::new(dep.actuator.position(), move |_: &Position| {
                            if let Some(inner) = weak.upgrade() {
                                inner.update_position();
                            }
                        }),
                        dep,
                        axis,
                        atol,
                        cycle,
                    }
                })
                .collect();
            Inner {
                name,
                role: role.into(),
                axes: BTreeMap::from([(config.axis.clone(), AxisDef::discrete(choices))]),
                axis: config.axis,
                members,
                table: config.positions,
                fallback: config.fallback,
                position: Observable::new("position", Position::new()),
                referenced: referenceable
                    .then(|| Observable::new("referenced", ReferenceMap::new())),
                state,
                executor,
                settings: config.settings,
                subscriptions: Subscriptions::default(),
            }
        });

        for m in &inner.members {
            m.watch.resume();
            if let Some(dep_ref) = m.dep.actuator.referenced() {
                let weak = Arc::downgrade(&inner);
                inner.subscriptions.watch(dep_ref, false, move |_: &ReferenceMap| {
                    if let Some(inner) = weak.upgrade() {
                        inner.update_referenced();
                    }
                });
            }
        }
        inner.update_referenced();
        inner.state.publish(ActuatorState::Idle);

        Ok(Self { inner })
    }
}

#[async_trait]
impl Actuator for CombinedFixedPositionActuator {
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
            return Err(ActuatorError::Unsupported(
                "relative move on combined fixed positions axis".to_string(),
            ));
        }
        check_move_abs(&self.inner.axes, &request.values)?;

        let label = match request.values.get(&self.inner.axis) {
            Some(AxisValue::Label(l)) => l.clone(),
            Some(other) => {
                return Err(ActuatorError::InvalidArgument(format!("unknown position {other}")))
            }
            None => return Err(ActuatorError::UnknownAxis(self.inner.axis.clone())),
        };
        if self.inner.entry(&label).is_none() {
            return Err(ActuatorError::InvalidArgument(format!(
                "not allowed to move to fallback position {label}"
            )));
        }

        let inner = Arc::clone(&self.inner);
        Ok(self.inner.executor.submit(TaskKind::Move, None, move |_| {
            async move { inner.do_move_abs(label).await }.boxed()
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
        if let Some(axes) = &axes {
            if !axes.contains(&self.inner.axis) {
                warn!("{}: trying to stop without any existing axis", self.inner.name);
                return;
            }
        }
        let targets = self
            .inner
            .members
            .iter()
            .map(|m| (Arc::clone(&m.dep.actuator), Some(m.axes())))
            .collect();
        stop_dependencies(&self.inner.name, targets, self.inner.settings.stop_timeout()).await;
    }

    async fn terminate(&self) {
        self.stop(None).await;
        self.inner.executor.shutdown().await;
        for m in &self.inner.members {
            m.watch.release();
        }
        self.inner.subscriptions.release();
    }
}
