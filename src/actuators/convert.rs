//! x/y stage seen through an affine conversion.
//!
//! The exposed `x`/`y` axes are converted to two axes of the dependency with
//! [`AffineTransform`]. The conversion can be replaced at any time through
//! [`Actuator::update_metadata`]; the exposed position is then recomputed
//! from the last known dependency position.

use super::{new_state, stop_dependencies, Subscriptions};
use crate::axis::{check_reference, float_of, AxisDef, AxisSet, AxisValue, Position};
use crate::capabilities::{
    single_dependency, Actuator, ActuatorState, CorrectionMetadata, Dependency, DependencyMap,
    MoveKind, MoveRequest,
};
use crate::config::ActuatorSettings;
use crate::error::{ActuatorError, ActuatorResult};
use crate::executor::MoveFuture;
use crate::observable::Observable;
use crate::transform::{AffineTransform, TransformParams};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Parameters of a [`ConvertStage`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvertConfig {
    /// Dependency axes used as x and y
    pub axes: (String, String),
    #[serde(default)]
    pub transform: TransformParams,
    #[serde(default)]
    pub settings: ActuatorSettings,
}

impl ConvertConfig {
    pub fn new(x: impl Into<String>, y: impl Into<String>) -> Self {
        Self {
            axes: (x.into(), y.into()),
            transform: TransformParams::default(),
            settings: ActuatorSettings::default(),
        }
    }

    pub fn with_transform(mut self, transform: TransformParams) -> Self {
        self.transform = transform;
        self
    }
}

struct Inner {
    name: String,
    role: String,
    axes: BTreeMap<String, AxisDef>,
    dep: Dependency,
    dep_x: String,
    dep_y: String,
    transform: Mutex<AffineTransform>,
    position: Observable<Position>,
    state: Observable<ActuatorState>,
    settings: ActuatorSettings,
    subscriptions: Subscriptions,
}

impl Inner {
    fn update_position(&self, dep_pos: &Position) {
        let (Ok(qx), Ok(qy)) = (float_of(dep_pos, &self.dep_x), float_of(dep_pos, &self.dep_y))
        else {
            debug!("{}: dependency position incomplete: {:?}", self.name, dep_pos);
            return;
        };
        let (x, y) = self.transform.lock().from_dependency((qx, qy), true);
        self.position.publish(Position::from([
            ("x".to_string(), AxisValue::Float(x)),
            ("y".to_string(), AxisValue::Float(y)),
        ]));
    }

    fn to_dependency(&self, p: (f64, f64), absolute: bool) -> Position {
        let (qx, qy) = self.transform.lock().to_dependency(p, absolute);
        Position::from([
            (self.dep_x.clone(), AxisValue::Float(qx)),
            (self.dep_y.clone(), AxisValue::Float(qy)),
        ])
    }

    fn coordinate(&self, values: &Position, axis: &str, default: f64) -> ActuatorResult<f64> {
        match values.get(axis) {
            Some(_) => float_of(values, axis),
            None => Ok(default),
        }
    }
}

/// Stage whose x/y axes are an affine conversion of a dependency's axes.
#[derive(Clone)]
pub struct ConvertStage {
    inner: Arc<Inner>,
}

impl ConvertStage {
    pub fn new(
        name: impl Into<String>,
        role: impl Into<String>,
        dependencies: DependencyMap,
        config: ConvertConfig,
    ) -> ActuatorResult<Self> {
        let name = name.into();
        config.settings.validate()?;
        let dep = single_dependency(dependencies, "ConvertStage")?;
        let (dep_x, dep_y) = config.axes;
        let axes = BTreeMap::from([
            ("x".to_string(), dep.axis(&dep_x)?.clone()),
            ("y".to_string(), dep.axis(&dep_y)?.clone()),
        ]);
        let transform = AffineTransform::new(config.transform)?;

        let inner = Arc::new(Inner {
            name,
            role: role.into(),
            axes,
            dep,
            dep_x,
            dep_y,
            transform: Mutex::new(transform),
            position: Observable::new("position", Position::new()),
            state: new_state(),
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
        inner.state.publish(ActuatorState::Idle);
        Ok(Self { inner })
    }

    /// Current conversion parameters.
    pub fn transform(&self) -> TransformParams {
        *self.inner.transform.lock().params()
    }
}

#[async_trait]
impl Actuator for ConvertStage {
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

    fn state(&self) -> &Observable<ActuatorState> {
        &self.inner.state
    }

    fn request_move(&self, request: MoveRequest) -> ActuatorResult<MoveFuture> {
        if let Some(axis) = request.values.keys().find(|a| !self.inner.axes.contains_key(*a)) {
            return Err(ActuatorError::UnknownAxis(axis.clone()));
        }
        let inner = &self.inner;
        let values = match request.kind {
            MoveKind::Relative => {
                let x = inner.coordinate(&request.values, "x", 0.0)?;
                let y = inner.coordinate(&request.values, "y", 0.0)?;
                inner.to_dependency((x, y), false)
            }
            MoveKind::Absolute => {
                // A missing coordinate keeps its current value
                let current = inner.position.get();
                let x = inner.coordinate(&request.values, "x", float_of(&current, "x")?)?;
                let y = inner.coordinate(&request.values, "y", float_of(&current, "y")?)?;
                inner.to_dependency((x, y), true)
            }
        };
        debug!(
            "{}: converted {:?} move from {:?} to {:?}",
            inner.name, request.kind, request.values, values
        );
        inner.dep.actuator.request_move(MoveRequest { values, ..request })
    }

    fn reference(&self, axes: AxisSet) -> ActuatorResult<MoveFuture> {
        check_reference(&self.inner.axes, &axes)?;
        let dep_axes = axes
            .iter()
            .map(|a| {
                if a == "x" {
                    self.inner.dep_x.clone()
                } else {
                    self.inner.dep_y.clone()
                }
            })
            .collect();
        self.inner.dep.actuator.reference(dep_axes)
    }

    async fn stop(&self, _axes: Option<AxisSet>) {
        let dep_axes = AxisSet::from([self.inner.dep_x.clone(), self.inner.dep_y.clone()]);
        stop_dependencies(
            &self.inner.name,
            vec![(Arc::clone(&self.inner.dep.actuator), Some(dep_axes))],
            self.inner.settings.stop_timeout(),
        )
        .await;
    }

    async fn terminate(&self) {
        self.stop(None).await;
        self.inner.subscriptions.release();
    }

    fn update_metadata(&self, metadata: CorrectionMetadata) -> ActuatorResult<()> {
        let inner = &self.inner;
        {
            let mut transform = inner.transform.lock();
            let mut params = *transform.params();
            if let Some(rotation) = metadata.rotation {
                params.rotation = rotation;
            }
            if let Some(scale) = metadata.scale {
                params.scale = scale;
            }
            if let Some(translation) = metadata.translation {
                params.translation = translation;
            }
            *transform = AffineTransform::new(params)
                .map_err(|e| ActuatorError::InvalidArgument(e.to_string()))?;
        }
        inner.update_position(&inner.dep.actuator.position().get());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::position;
    use crate::hardware::{MockActuator, MockCall};
    use std::f64::consts::FRAC_PI_2;

    fn lens() -> MockActuator {
        MockActuator::builder("lens")
            .axis("a", AxisDef::continuous(-10.0, 10.0))
            .axis("b", AxisDef::continuous(-10.0, 10.0))
            .build()
            .unwrap()
    }

    fn convert(dep: &MockActuator, transform: TransformParams) -> ConvertStage {
        let deps: DependencyMap =
            BTreeMap::from([("aligner".to_string(), Arc::new(dep.clone()) as Arc<dyn Actuator>)]);
        let config = ConvertConfig::new("a", "b").with_transform(transform);
        ConvertStage::new("conv", "align", deps, config).unwrap()
    }

    fn approx(pos: &Position, axis: &str, expected: f64) -> bool {
        (float_of(pos, axis).unwrap() - expected).abs() < 1e-9
    }

    #[tokio::test]
    async fn test_position_follows_dependency() {
        let dep = lens();
        dep.set_position(position([("a", 2.0), ("b", 4.0)]));
        let conv = convert(
            &dep,
            TransformParams {
                scale: (2.0, 2.0),
                translation: (1.0, 0.0),
                ..TransformParams::default()
            },
        );
        let pos = conv.position().get();
        assert!(approx(&pos, "x", 0.0));
        assert!(approx(&pos, "y", 2.0));
    }

    #[tokio::test]
    async fn test_partial_absolute_target_keeps_other_axis() {
        let dep = lens();
        let conv = convert(&dep, TransformParams::default());
        conv.move_abs(position([("x", 1.0), ("y", 3.0)])).unwrap().await.unwrap();
        conv.move_abs(position([("x", -1.0)])).unwrap().await.unwrap();

        let pos = conv.position().get();
        assert!(approx(&pos, "x", -1.0));
        assert!(approx(&pos, "y", 3.0));
    }

    #[tokio::test]
    async fn test_relative_move_is_rotated_without_translation() {
        let dep = lens();
        let conv = convert(
            &dep,
            TransformParams {
                rotation: FRAC_PI_2,
                translation: (5.0, 5.0),
                ..TransformParams::default()
            },
        );
        conv.move_rel(position([("x", 1.0)])).unwrap().await.unwrap();
        let MockCall::MoveRel(shift) = &dep.calls()[0] else {
            panic!("expected a relative move");
        };
        assert!(approx(shift, "a", 0.0));
        assert!(approx(shift, "b", 1.0));
    }

    #[tokio::test]
    async fn test_metadata_update_recomputes_position() {
        let dep = lens();
        dep.set_position(position([("a", 1.0), ("b", 1.0)]));
        let conv = convert(&dep, TransformParams::default());

        conv.update_metadata(CorrectionMetadata {
            translation: Some((0.5, -0.5)),
            ..CorrectionMetadata::default()
        })
        .unwrap();
        let pos = conv.position().get();
        assert!(approx(&pos, "x", 0.5));
        assert!(approx(&pos, "y", 1.5));
        assert!(dep.calls().is_empty());

        assert!(conv
            .update_metadata(CorrectionMetadata {
                scale: Some((0.0, 1.0)),
                ..CorrectionMetadata::default()
            })
            .is_err());
    }
}
