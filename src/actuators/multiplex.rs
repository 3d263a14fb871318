//! Actuator built from axes of several dependencies.
//!
//! Each exposed axis is bound to one axis of one dependency. Moves are split
//! per dependency; with several dependencies a queued task issues all the
//! calls at once and waits for every one of them, with a single dependency
//! requests are forwarded directly.

use super::{join_moves, new_state, record_init_failure, stop_dependencies, Subscriptions};
use crate::axis::{
    check_move_abs, check_move_rel, check_reference, update_axes, AxisDef, AxisSet, Position,
    ReferenceMap, SpeedMap,
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
use std::sync::{Arc, Weak};
use tracing::{debug, error, info};

/// Parameters of a [`MultiplexActuator`].
///
/// The dependency map given to the constructor is keyed by exposed axis name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MultiplexConfig {
    /// Exposed axis → axis of its dependency
    pub axes_map: BTreeMap<String, String>,
    /// Axes to reference at construction, with an optional position to move
    /// to afterwards
    #[serde(default)]
    pub ref_on_init: BTreeMap<String, Option<f64>>,
    #[serde(default)]
    pub settings: ActuatorSettings,
}

impl MultiplexConfig {
    /// Configuration from `(exposed axis, dependency axis)` pairs.
    pub fn new<A, B>(axes_map: impl IntoIterator<Item = (A, B)>) -> Self
    where
        A: Into<String>,
        B: Into<String>,
    {
        Self {
            axes_map: axes_map
                .into_iter()
                .map(|(a, b)| (a.into(), b.into()))
                .collect(),
            ..Self::default()
        }
    }
}

struct Binding {
    dep: Dependency,
    dep_axis: String,
    /// Index in `Inner::groups`
    group: usize,
}

/// A dependency and the exposed axes it serves.
struct Group {
    dep: Dependency,
    /// exposed axis → dependency axis
    axes: BTreeMap<String, String>,
}

struct Inner {
    name: String,
    role: String,
    axes: BTreeMap<String, AxisDef>,
    bindings: BTreeMap<String, Binding>,
    groups: Vec<Group>,
    position: Observable<Position>,
    speed: Option<Observable<SpeedMap>>,
    referenced: Option<Observable<ReferenceMap>>,
    state: Observable<ActuatorState>,
    executor: Option<SerialExecutor>,
    settings: ActuatorSettings,
    snapshot: Mutex<Snapshot>,
    subscriptions: Subscriptions,
}

#[derive(Default)]
struct Snapshot {
    position: Position,
    speed: SpeedMap,
    referenced: ReferenceMap,
}

/// Actuator whose axes are taken from several dependencies.
#[derive(Clone)]
pub struct MultiplexActuator {
    inner: Arc<Inner>,
}

impl MultiplexActuator {
    /// `dependencies` maps each exposed axis to the actuator providing it.
    ///
    /// # Errors
    ///
    /// `Configuration` if the axes of `dependencies` and `axes_map` differ, if
    /// a dependency lacks the mapped axis, or if a `ref_on_init` axis cannot
    /// be referenced.
    pub fn new(
        name: impl Into<String>,
        role: impl Into<String>,
        dependencies: DependencyMap,
        config: MultiplexConfig,
    ) -> ActuatorResult<Self> {
        let name = name.into();
        config.settings.validate()?;
        if !dependencies.keys().eq(config.axes_map.keys()) {
            return Err(ActuatorError::config(format!(
                "{name}: dependencies and axes_map must have the same axes"
            )));
        }

        let mut axes = BTreeMap::new();
        let mut bindings = BTreeMap::new();
        let mut groups: Vec<Group> = Vec::new();
        let mut snapshot = Snapshot::default();

        for (axis, actuator) in dependencies {
            let dep = Dependency::new(actuator);
            let dep_axis = config.axes_map[&axis].clone();
            axes.insert(axis.clone(), dep.axis(&dep_axis)?.clone());

            let dep_pos = dep.actuator.position().get();
            if let Some(v) = dep_pos.get(&dep_axis) {
                snapshot.position.insert(axis.clone(), v.clone());
            }
            if let Some(speed) = dep.actuator.speed() {
                if let Some(v) = speed.get().get(&dep_axis) {
                    snapshot.speed.insert(axis.clone(), *v);
                }
            }
            if let Some(r) = dep.is_referenced(&dep_axis) {
                snapshot.referenced.insert(axis.clone(), r);
            }

            // Grouped by identity: two drivers may share a name
            let group = match groups
                .iter()
                .position(|g| same_actuator(&g.dep.actuator, &dep.actuator))
            {
                Some(i) => i,
                None => {
                    groups.push(Group {
                        dep: dep.clone(),
                        axes: BTreeMap::new(),
                    });
                    groups.len() - 1
                }
            };
            groups[group].axes.insert(axis.clone(), dep_axis.clone());
            bindings.insert(axis, Binding { dep, dep_axis, group });
        }

        for axis in config.ref_on_init.keys() {
            if !snapshot.referenced.contains_key(axis) {
                return Err(ActuatorError::config(format!(
                    "{name}: axis '{axis}' cannot be referenced, while it should be referenced at init"
                )));
            }
        }

        let state = new_state();
        let executor = if groups.len() > 1 {
            Some(SerialExecutor::new(name.clone(), state.clone())?)
        } else {
            None
        };

        let speed = (!snapshot.speed.is_empty())
            .then(|| Observable::new("speed", snapshot.speed.clone()));
        let referenced = (!snapshot.referenced.is_empty())
            .then(|| Observable::new("referenced", snapshot.referenced.clone()));

        let inner = Arc::new(Inner {
            name,
            role: role.into(),
            axes,
            bindings,
            groups,
            position: Observable::new("position", snapshot.position.clone()),
            speed,
            referenced,
            state,
            executor,
            settings: config.settings,
            snapshot: Mutex::new(snapshot),
            subscriptions: Subscriptions::default(),
        });
        Inner::subscribe(&inner);
        inner.state.publish(ActuatorState::Idle);

        let actuator = Self { inner };
        actuator.reference_on_init(config.ref_on_init)?;
        Ok(actuator)
    }

    fn reference_on_init(&self, ref_on_init: BTreeMap<String, Option<f64>>) -> ActuatorResult<()> {
        for (axis, target) in ref_on_init {
            let referenced = self.inner.snapshot.lock().referenced.get(&axis).copied();
            if referenced == Some(false) {
                info!("{}: referencing axis '{}' at init", self.inner.name, axis);
                let fut = self.reference(AxisSet::from([axis.clone()]))?;
                let weak = Arc::downgrade(&self.inner);
                let axis = axis.clone();
                tokio::spawn(async move {
                    if let Err(e) = fut.await {
                        if let Some(inner) = weak.upgrade() {
                            let binding = &inner.bindings[&axis];
                            let dep_axes = AxisSet::from([binding.dep_axis.clone()]);
                            record_init_failure(
                                &inner.name,
                                &inner.state,
                                &binding.dep.actuator,
                                dep_axes,
                                &e,
                            )
                            .await;
                        }
                    }
                });
            }
            // Queued after the referencing, so any client move comes later.
            if let Some(target) = target {
                let _ = self.move_abs(Position::from([(axis, target.into())]))?;
            }
        }
        Ok(())
    }
}

impl Inner {
    fn subscribe(inner: &Arc<Self>) {
        for group in &inner.groups {
            let actuator = &group.dep.actuator;

            let weak = Arc::downgrade(inner);
            let axes = group.axes.clone();
            let dep_name = group.dep.name().to_string();
            inner
                .subscriptions
                .watch(actuator.position(), false, move |pos: &Position| {
                    with_inner(&weak, |inner| {
                        let updated = {
                            let mut snapshot = inner.snapshot.lock();
                            for (axis, dep_axis) in &axes {
                                match pos.get(dep_axis) {
                                    Some(v) => {
                                        snapshot.position.insert(axis.clone(), v.clone());
                                    }
                                    None => error!(
                                        "Dependency {} is not reporting position of axis {}",
                                        dep_name, axis
                                    ),
                                }
                            }
                            snapshot.position.clone()
                        };
                        inner.position.publish(updated);
                    })
                });

            if let (Some(dep_speed), Some(_)) = (actuator.speed(), &inner.speed) {
                let weak = Arc::downgrade(inner);
                let axes = group.axes.clone();
                inner
                    .subscriptions
                    .watch(dep_speed, false, move |speed: &SpeedMap| {
                        with_inner(&weak, |inner| {
                            let updated = {
                                let mut snapshot = inner.snapshot.lock();
                                for (axis, dep_axis) in &axes {
                                    if let Some(v) = speed.get(dep_axis) {
                                        snapshot.speed.insert(axis.clone(), *v);
                                    }
                                }
                                snapshot.speed.clone()
                            };
                            if let Some(obs) = &inner.speed {
                                obs.publish(updated);
                            }
                        })
                    });
            }

            if let (Some(dep_ref), Some(_)) = (actuator.referenced(), &inner.referenced) {
                let weak = Arc::downgrade(inner);
                let axes = group.axes.clone();
                inner
                    .subscriptions
                    .watch(dep_ref, false, move |referenced: &ReferenceMap| {
                        with_inner(&weak, |inner| {
                            let updated = {
                                let mut snapshot = inner.snapshot.lock();
                                for (axis, dep_axis) in &axes {
                                    if let Some(v) = referenced.get(dep_axis) {
                                        snapshot.referenced.insert(axis.clone(), *v);
                                    }
                                }
                                snapshot.referenced.clone()
                            };
                            if let Some(obs) = &inner.referenced {
                                obs.publish(updated);
                            }
                        })
                    });
            }
        }
    }

    /// Split a move or axis set per dependency, in dependency axis names.
    fn split<T: Clone>(
        &self,
        values: &BTreeMap<String, T>,
    ) -> Vec<(Arc<dyn Actuator>, BTreeMap<String, T>)> {
        let mut per_dep: BTreeMap<usize, (Arc<dyn Actuator>, BTreeMap<String, T>)> =
            BTreeMap::new();
        for (axis, value) in values {
            if let Some(binding) = self.bindings.get(axis) {
                per_dep
                    .entry(binding.group)
                    .or_insert_with(|| (Arc::clone(&binding.dep.actuator), BTreeMap::new()))
                    .1
                    .insert(binding.dep_axis.clone(), value.clone());
            }
        }
        per_dep.into_values().collect()
    }

    fn split_axes(&self, axes: &AxisSet) -> Vec<(Arc<dyn Actuator>, AxisSet)> {
        let as_map: BTreeMap<String, ()> = axes.iter().map(|a| (a.clone(), ())).collect();
        self.split(&as_map)
            .into_iter()
            .map(|(dep, m)| (dep, m.into_keys().collect()))
            .collect()
    }
}

fn same_actuator(a: &Arc<dyn Actuator>, b: &Arc<dyn Actuator>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

fn with_inner<F: FnOnce(&Inner)>(weak: &Weak<Inner>, f: F) {
    if let Some(inner) = weak.upgrade() {
        f(&inner);
    }
}

#[async_trait]
impl Actuator for MultiplexActuator {
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
        if let Some(axis) = speeds.keys().find(|a| !speed.get().contains_key(*a)) {
            return Err(ActuatorError::UnknownAxis(axis.clone()));
        }

        let mut applied = SpeedMap::new();
        for (dep, dep_speeds) in self.inner.split(&speeds) {
            let accepted = dep.set_speed(dep_speeds)?;
            for (axis, binding) in &self.inner.bindings {
                if same_actuator(&binding.dep.actuator, &dep) {
                    if let Some(v) = accepted.get(&binding.dep_axis) {
                        if speeds.contains_key(axis) {
                            applied.insert(axis.clone(), *v);
                        }
                    }
                }
            }
        }
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
        debug!("{}: {:?} move {:?}", self.inner.name, request.kind, request.values);

        let Some(executor) = &self.inner.executor else {
            // Single dependency: forward as is
            let Some((dep, values)) = self.inner.split(&request.values).pop() else {
                return Ok(MoveFuture::ready(Ok(())));
            };
            return dep.request_move(MoveRequest { values, ..request });
        };

        let update = update_axes(&self.inner.axes, &request.values, request.update);
        let inner = Arc::clone(&self.inner);
        Ok(executor.submit(TaskKind::Move, update, move |_| {
            async move {
                let mut futures = Vec::new();
                for (dep, values) in inner.split(&request.values) {
                    match dep.request_move(MoveRequest {
                        kind: request.kind,
                        values,
                        update: request.update,
                    }) {
                        Ok(f) => futures.push(f),
                        Err(e) => {
                            join_moves(futures).await.ok();
                            return Err(e);
                        }
                    }
                }
                join_moves(futures).await
            }
            .boxed()
        }))
    }

    fn reference(&self, axes: AxisSet) -> ActuatorResult<MoveFuture> {
        check_reference(&self.inner.axes, &axes)?;
        let referenceable = self.inner.snapshot.lock().referenced.clone();
        if let Some(axis) = axes.iter().find(|a| !referenceable.contains_key(*a)) {
            return Err(ActuatorError::Unsupported(format!(
                "axis '{axis}' of '{}' cannot be referenced",
                self.inner.name
            )));
        }
        if axes.is_empty() {
            return Ok(MoveFuture::ready(Ok(())));
        }

        let Some(executor) = &self.inner.executor else {
            let Some((dep, dep_axes)) = self.inner.split_axes(&axes).pop() else {
                return Ok(MoveFuture::ready(Ok(())));
            };
            return dep.reference(dep_axes);
        };

        let inner = Arc::clone(&self.inner);
        Ok(executor.submit(TaskKind::Reference, None, move |_| {
            async move {
                let mut futures = Vec::new();
                for (dep, dep_axes) in inner.split_axes(&axes) {
                    match dep.reference(dep_axes) {
                        Ok(f) => futures.push(f),
                        Err(e) => {
                            join_moves(futures).await.ok();
                            return Err(e);
                        }
                    }
                }
                join_moves(futures).await
            }
            .boxed()
        }))
    }

    async fn stop(&self, axes: Option<AxisSet>) {
        if let Some(executor) = &self.inner.executor {
            executor.cancel();
        }

        let all: AxisSet = self.inner.axes.keys().cloned().collect();
        let mut requested = axes.unwrap_or_else(|| all.clone());
        let unknown: Vec<_> = requested.difference(&all).cloned().collect();
        if !unknown.is_empty() {
            error!(
                "Attempting to stop unknown axes of '{}': {}",
                self.inner.name,
                unknown.join(", ")
            );
            requested.retain(|a| all.contains(a));
        }

        let targets = self
            .inner
            .split_axes(&requested)
            .into_iter()
            .map(|(dep, dep_axes)| (dep, Some(dep_axes)))
            .collect();
        stop_dependencies(&self.inner.name, targets, self.inner.settings.stop_timeout()).await;
    }

    async fn terminate(&self) {
        self.stop(None).await;
        if let Some(executor) = &self.inner.executor {
            executor.shutdown().await;
        }
        self.inner.subscriptions.release();
    }
}
