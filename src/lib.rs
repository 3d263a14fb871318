//! Composite motion actuators built from independent axis drivers.
//!
//! Hardware drivers expose independent motion axes. This library combines
//! them into higher-level logical actuators: axes gathered from several
//! drivers, converted coordinate frames, backlash compensation, discrete named
//! positions, and wrap-around axes unrolled into a fixed range.
//!
//! Every actuator implements [`Actuator`]. Requests are validated
//! synchronously, then queued on a per-instance [`SerialExecutor`] and
//! resolved through a [`MoveFuture`]. Position, speed and reference status
//! are published as [`Observable`] values.
//!
//! ```rust,ignore
//! let deps: DependencyMap = BTreeMap::from([
//!     ("x".to_string(), Arc::new(stage_a) as Arc<dyn Actuator>),
//!     ("y".to_string(), Arc::new(stage_b) as Arc<dyn Actuator>),
//! ]);
//! let config = MultiplexConfig::new([("x", "x"), ("y", "y")]);
//! let stage = MultiplexActuator::new("stage", "stage", deps, config)?;
//! stage.move_abs(position([("x", 1e-3), ("y", 2e-3)]))?.await?;
//! ```

pub mod actuators;
pub mod axis;
pub mod capabilities;
pub mod config;
pub mod cyclic;
pub mod error;
pub mod executor;
pub mod hardware;
pub mod observable;
pub mod transform;

pub use axis::{
    axis_set, position, AxisDef, AxisKind, AxisSet, AxisValue, Position, ReferenceMap, SpeedMap,
};
pub use capabilities::{
    Actuator, ActuatorState, CorrectionMetadata, DependencyMap, MoveKind, MoveRequest,
};
pub use config::ActuatorSettings;
pub use error::{ActuatorError, ActuatorResult};
pub use executor::{MoveFuture, SerialExecutor, TaskKind};
pub use observable::Observable;
pub use transform::{AffineTransform, TransformParams};
