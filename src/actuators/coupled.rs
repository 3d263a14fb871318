//! Master stage with a slave stage kept aligned to it.
//!
//! Every move is executed by the master; the slave, seen through a
//! [`ConvertStage`], is then moved to the master's final position, even when
//! the master move failed. The conversion is updated with
//! [`Actuator::update_metadata`].

use super::convert::{ConvertConfig, ConvertStage};
use super::{join_moves, new_state, stop_dependencies, Subscriptions};
use crate::axis::{
    check_move_abs, check_move_rel, check_reference, float_of, AxisDef, AxisSet, AxisValue,
    Position, ReferenceMap,
};
use crate::capabilities::{
    take_role, Actuator, ActuatorState, CorrectionMetadata, Dependency, DependencyMap, MoveKind,
    MoveRequest,
};
use crate::config::ActuatorSettings;
use crate::error::{ActuatorError, ActuatorResult};
use crate::executor::{MoveFuture, SerialExecutor, TaskKind};
use crate::observable::Observable;
use crate::transform::TransformParams;
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Parameters of a [`CoupledStage`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoupledConfig {
    /// Initial conversion from master to slave coordinates
    #[serde(default)]
    pub transform: TransformParams,
    #[serde(default)]
    pub settings: ActuatorSettings,
}

struct Inner {
    name: String,
    role: String,
    axes: BTreeMap<String, AxisDef>,
    master: Dependency,
    slave: Dependency,
    converter: ConvertStage,
    position: Observable<Position>,
    referenced: Option<Observable<ReferenceMap>>,
    state: Observable<ActuatorState>,
    executor: SerialExecutor,
    settings: ActuatorSettings,
    subscriptions: Subscriptions,
}

impl Inner {
    fn update_position(&self) {
        let master = self.master.actuator.position().get();
        let pos: Position = ["x", "y"]
            .iter()
            .filter_map(|a| master.get(*a).map(|v| (a.to_string(), v.clone())))
            .collect();
        self.position.publish(pos);
    }

    /// An axis is referenced iff it is referenced in every referenceable
    /// dependency.
    fn update_referenced(&self) {
        let Some(obs) = &self.referenced else {
            return;
        };
        let mut referenced = ReferenceMap::new();
        for dep in [&self.master, &self.slave] {
            let Some(dep_ref) = dep.actuator.referenced() else {
                continue;
            };
            for (axis, value) in dep_ref.get() {
                if self.axes.contains_key(&axis) {
                    let entry = referenced.entry(axis).or_insert(true);
                    *entry = *entry && value;
                }
            }
        }
        obs.publish(referenced);
    }

    /// Move the slave where the master is.
    async fn resync(&self) -> ActuatorResult<()> {
        let master = self.master.actuator.position().get();
        let target = Position::from([
            ("x".to_string(), AxisValue::Float(float_of(&master, "x")?)),
            ("y".to_string(), AxisValue::Float(float_of(&master, "y")?)),
        ]);
        self.converter.move_abs(target)?.await
    }

    async fn do_move(&self, request: MoveRequest) -> ActuatorResult<()> {
        let moved = match self.master.actuator.request_move(request) {
            Ok(f) => f.await,
            Err(e) => Err(e),
        };
        // Resynchronise even if the master move failed
        let synced = self.resync().await;
        self.update_position();
        moved.and(synced)
    }

    async fn do_reference(&self, axes: AxisSet) -> ActuatorResult<()> {
        let mut futures = Vec::new();
        for dep in [&self.master, &self.slave] {
            let Some(dep_ref) = dep.actuator.referenced() else {
                continue;
            };
            let dep_axes: AxisSet = dep_ref
                .get()
                .into_keys()
                .filter(|a| axes.contains(a))
                .collect();
            if !dep_axes.is_empty() {
                futures.push(dep.actuator.reference(dep_axes)?);
            }
        }
        join_moves(futures).await?;

        self.resync().await?;
        self.update_position();
        Ok(())
    }
}

/// Master stage followed by an aligned slave stage.
#[derive(Clone)]
pub struct CoupledStage {
    inner: Arc<Inner>,
}

impl CoupledStage {
    /// `dependencies` must contain exactly the roles `"master"` and `"slave"`,
    /// each with `x` and `y` axes.
    pub fn new(
        name: impl Into<String>,
        role: impl Into<String>,
        mut dependencies: DependencyMap,
        config: CoupledConfig,
    ) -> ActuatorResult<Self> {
        let name = name.into();
        config.settings.validate()?;
        let master = take_role(&mut dependencies, "master")?;
        let slave = take_role(&mut dependencies, "slave")?;
        if let Some(other) = dependencies.keys().next() {
            return Err(ActuatorError::config(format!(
                "{name}: dependency role must be 'master' or 'slave', got '{other}'"
            )));
        }

        let mut axes = BTreeMap::new();
        for axis in ["x", "y"] {
            slave.axis(axis)?;
            let def = master.axis(axis)?.clone().updatable(false);
            axes.insert(axis.to_string(), def);
        }

        let converter = ConvertStage::new(
            format!("{name}-converter"),
            "align",
            BTreeMap::from([("aligner".to_string(), Arc::clone(&slave.actuator))]),
            ConvertConfig {
                axes: ("x".to_string(), "y".to_string()),
                transform: config.transform,
                settings: config.settings.clone(),
            },
        )?;

        let has_referenced = master.caps.has_referenced || slave.caps.has_referenced;
        let state = new_state();
        let executor = SerialExecutor::new(name.clone(), state.clone())?;
        let inner = Arc::new(Inner {
            name,
            role: role.into(),
            axes,
            master,
            slave,
            converter,
            position: Observable::new("position", Position::new()),
            referenced: has_referenced
                .then(|| Observable::new("referenced", ReferenceMap::new())),
            state,
            executor,
            settings: config.settings,
            subscriptions: Subscriptions::default(),
        });
        inner.update_position();

        for dep in [&inner.master, &inner.slave] {
            if let Some(dep_ref) = dep.actuator.referenced() {
                let weak = Arc::downgrade(&inner);
                inner.subscriptions.watch(dep_ref, true, move |_: &ReferenceMap| {
                    // The value may come from either dependency: recompute all
                    if let Some(inner) = weak.upgrade() {
                        inner.update_referenced();
                    }
                });
            }
        }
        inner.state.publish(ActuatorState::Idle);
        Ok(Self { inner })
    }
}

#[async_trait]
impl Actuator for CoupledStage {
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

    fn request_move(&self, mut request: MoveRequest) -> ActuatorResult<MoveFuture> {
        match request.kind {
            MoveKind::Relative => {
                if request.values.is_empty() {
                    request.values = Position::from([
                        ("x".to_string(), AxisValue::Float(0.0)),
                        ("y".to_string(), AxisValue::Float(0.0)),
                    ]);
                }
                check_move_rel(&self.inner.axes, &request.values)?;
            }
            MoveKind::Absolute => {
                if request.values.is_empty() {
                    request.values = self.inner.position.get();
                }
                check_move_abs(&self.inner.axes, &request.values)?;
            }
        }
        // Exposed axes never accept update moves
        request.update = false;

        let inner = Arc::clone(&self.inner);
        Ok(self.inner.executor.submit(TaskKind::Move, None, move |_| {
            async move { inner.do_move(request).await }.boxed()
        }))
    }

    fn reference(&self, axes: AxisSet) -> ActuatorResult<MoveFuture> {
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
        let converter: Arc<dyn Actuator> = Arc::new(self.inner.converter.clone());
        stop_dependencies(
            &self.inner.name,
            vec![
                (Arc::clone(&self.inner.master.actuator), axes.clone()),
                (converter, axes.clone()),
            ],
            self.inner.settings.stop_timeout(),
        )
        .await;
        let stopped: Vec<String> = match axes {
            Some(a) => a.into_iter().collect(),
            None => self.inner.axes.keys().cloned().collect(),
        };
        info!("{}: stopping all axes: {}", self.inner.name, stopped.join(", "));
    }

    async fn terminate(&self) {
        self.stop(None).await;
        self.inner.executor.shutdown().await;
        self.inner.subscriptions.release();
        self.inner.converter.terminate().await;
    }

    fn update_metadata(&self, metadata: CorrectionMetadata) -> ActuatorResult<()> {
        self.inner.converter.update_metadata(metadata)
    }
}
