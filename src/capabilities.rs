//! Actuator capability trait.
//!
//! [`Actuator`] is the single interface shared by hardware drivers and by the
//! composite actuators of this crate, so composites can be stacked on top of
//! each other. Optional capabilities (speed control, referencing) are exposed
//! as `Option` accessors and probed once with [`Capabilities::probe`].
//!
//! Move and reference requests return immediately with a [`MoveFuture`]:
//! validation errors are returned synchronously, hardware and convergence
//! errors are delivered through the future.
//!
//! # Example
//!
//! ```rust,ignore
//! let fut = stage.move_abs(position([("x", 1e-3)]))?;
//! fut.await?;
//! println!("now at {:?}", stage.position().get());
//! ```

use crate::axis::{AxisDef, AxisSet, Position, ReferenceMap, SpeedMap};
use crate::error::{ActuatorError, ActuatorResult};
use crate::executor::MoveFuture;
use crate::observable::Observable;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Lifecycle state of an actuator.
///
/// `Error` keeps the message of the last failure; it does not block further
/// commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActuatorState {
    Uninitialized,
    Idle,
    Moving,
    Referencing,
    Error(String),
}

/// Relative shift or absolute target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MoveKind {
    Relative,
    Absolute,
}

/// A motion request.
///
/// `update` asks for the move to be treated as an update of the previous one;
/// it is only honoured when every targeted axis has `can_update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveRequest {
    pub kind: MoveKind,
    pub values: Position,
    #[serde(default)]
    pub update: bool,
}

impl MoveRequest {
    pub fn relative(shift: Position) -> Self {
        Self {
            kind: MoveKind::Relative,
            values: shift,
            update: false,
        }
    }

    pub fn absolute(pos: Position) -> Self {
        Self {
            kind: MoveKind::Absolute,
            values: pos,
            update: false,
        }
    }

    /// Mark as an update move.
    pub fn update(mut self) -> Self {
        self.update = true;
        self
    }
}

/// Named corrections accepted by [`Actuator::update_metadata`].
///
/// Only the fields that are set are replaced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorrectionMetadata {
    /// Rotation correction (rad)
    #[serde(default)]
    pub rotation: Option<f64>,
    /// Scale correction `(sx, sy)`
    #[serde(default)]
    pub scale: Option<(f64, f64)>,
    /// Translation correction `(tx, ty)`
    #[serde(default)]
    pub translation: Option<(f64, f64)>,
    /// Position offset of a single axis
    #[serde(default)]
    pub position_offset: Option<f64>,
}

/// Role name → dependency.
pub type DependencyMap = BTreeMap<String, Arc<dyn Actuator>>;

/// A set of motion axes that can be moved, referenced and stopped.
#[async_trait]
pub trait Actuator: Send + Sync {
    /// Unique name of this actuator.
    fn name(&self) -> &str;

    /// Role of this actuator in the system.
    fn role(&self) -> &str;

    /// Axis descriptors.
    fn axes(&self) -> &BTreeMap<String, AxisDef>;

    /// Current position, read-only for clients.
    fn position(&self) -> &Observable<Position>;

    /// Current speed, if the actuator supports speed control.
    fn speed(&self) -> Option<&Observable<SpeedMap>> {
        None
    }

    /// Change the speed of some axes. Returns the speeds actually applied.
    fn set_speed(&self, speeds: SpeedMap) -> ActuatorResult<SpeedMap> {
        let _ = speeds;
        Err(ActuatorError::Unsupported(format!(
            "'{}' has no speed control",
            self.name()
        )))
    }

    /// Reference status, if the actuator supports referencing.
    fn referenced(&self) -> Option<&Observable<ReferenceMap>> {
        None
    }

    /// Lifecycle state.
    fn state(&self) -> &Observable<ActuatorState>;

    /// Queue a move. Returns before the move starts.
    fn request_move(&self, request: MoveRequest) -> ActuatorResult<MoveFuture>;

    /// Queue a relative move.
    fn move_rel(&self, shift: Position) -> ActuatorResult<MoveFuture> {
        self.request_move(MoveRequest::relative(shift))
    }

    /// Queue an absolute move.
    fn move_abs(&self, pos: Position) -> ActuatorResult<MoveFuture> {
        self.request_move(MoveRequest::absolute(pos))
    }

    /// Queue a referencing (homing) of the given axes.
    fn reference(&self, axes: AxisSet) -> ActuatorResult<MoveFuture>;

    /// Cancel queued requests and halt the given axes (all if `None`).
    ///
    /// Best effort: never fails.
    async fn stop(&self, axes: Option<AxisSet>);

    /// Stop, shut the worker down and release dependency subscriptions.
    async fn terminate(&self) {
        self.stop(None).await;
    }

    /// Apply named corrections and recompute the exposed position.
    fn update_metadata(&self, metadata: CorrectionMetadata) -> ActuatorResult<()> {
        let _ = metadata;
        Err(ActuatorError::Unsupported(format!(
            "'{}' has no correction metadata",
            self.name()
        )))
    }
}

/// Optional capabilities of a dependency, probed once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub has_speed: bool,
    pub has_referenced: bool,
}

impl Capabilities {
    pub fn probe(actuator: &dyn Actuator) -> Self {
        Self {
            has_speed: actuator.speed().is_some(),
            has_referenced: actuator.referenced().is_some(),
        }
    }
}

/// A dependency and its cached capabilities.
#[derive(Clone)]
pub struct Dependency {
    pub actuator: Arc<dyn Actuator>,
    pub caps: Capabilities,
}

impl std::fmt::Debug for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dependency")
            .field("name", &self.actuator.name())
            .field("caps", &self.caps)
            .finish()
    }
}

impl Dependency {
    pub fn new(actuator: Arc<dyn Actuator>) -> Self {
        let caps = Capabilities::probe(actuator.as_ref());
        Self { actuator, caps }
    }

    pub fn name(&self) -> &str {
        self.actuator.name()
    }

    /// Descriptor of one of its axes, or a configuration error.
    pub fn axis(&self, axis: &str) -> ActuatorResult<&AxisDef> {
        self.actuator.axes().get(axis).ok_or_else(|| {
            ActuatorError::config(format!(
                "dependency '{}' has no axis '{axis}'",
                self.name()
            ))
        })
    }

    /// Reference status of one axis; `None` if it cannot be referenced.
    pub fn is_referenced(&self, axis: &str) -> Option<bool> {
        self.actuator
            .referenced()
            .and_then(|r| r.get().get(axis).copied())
    }
}

/// Take the dependency with the given role.
pub fn take_role(deps: &mut DependencyMap, role: &str) -> ActuatorResult<Dependency> {
    deps.remove(role)
        .map(Dependency::new)
        .ok_or_else(|| ActuatorError::config(format!("missing dependency with role '{role}'")))
}

/// Take the only dependency of a single-dependency actuator.
pub fn single_dependency(deps: DependencyMap, kind: &str) -> ActuatorResult<Dependency> {
    if deps.len() != 1 {
        return Err(ActuatorError::config(format!(
            "{kind} needs exactly one dependency, got {}",
            deps.len()
        )));
    }
    deps.into_values()
        .next()
        .map(Dependency::new)
        .ok_or_else(|| ActuatorError::config(format!("{kind} needs one dependency")))
}
