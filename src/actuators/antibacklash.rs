//! Backlash compensation: every move finishes in the same direction.
//!
//! For each compensated axis a signed backlash is given. A move against the
//! sign of the backlash overshoots by the backlash amount and the axis is
//! marked as shifted; once the move is over, a relative move of the backlash
//! amount brings it to the target, always arriving in the same direction.
//!
//! When the next queued request is an update move over the same axes, the
//! compensation is left to that request.

use super::{new_state, stop_dependencies};
use crate::axis::{
    check_move_abs, check_move_rel, float_of, update_axes, AxisDef, AxisKind, AxisSet, AxisValue,
    Position, ReferenceMap, SpeedMap,
};
use crate::capabilities::{
    single_dependency, Actuator, ActuatorState, Dependency, DependencyMap, MoveKind, MoveRequest,
};
use crate::config::ActuatorSettings;
use crate::error::{ActuatorError, ActuatorResult};
use crate::executor::{MoveFuture, SerialExecutor, TaskContext, TaskKind};
use crate::observable::Observable;
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Parameters of an [`AntiBacklashActuator`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AntiBacklashConfig {
    /// Axis → signed extra distance. Axes not listed are not compensated.
    pub backlash: BTreeMap<String, f64>,
    #[serde(default)]
    pub settings: ActuatorSettings,
}

struct Inner {
    name: String,
    role: String,
    axes: BTreeMap<String, AxisDef>,
    dep: Dependency,
    backlash: BTreeMap<String, f64>,
    /// Axes which overshot and still need their compensation move
    shifted: Mutex<BTreeMap<String, bool>>,
    state: Observable<ActuatorState>,
    executor: SerialExecutor,
    settings: ActuatorSettings,
}

impl Inner {
    fn is_shifted(&self, axes: &AxisSet) -> bool {
        let shifted = self.shifted.lock();
        axes.iter().any(|a| shifted.get(a).copied().unwrap_or(false))
    }

    async fn do_move_rel(&self, ctx: TaskContext, shift: Position) -> ActuatorResult<()> {
        let mut sub_shift = Position::new();
        {
            let mut shifted = self.shifted.lock();
            for axis in shift.keys() {
                let v = float_of(&shift, axis)?;
                let target = match self.backlash.get(axis) {
                    // Same direction as the compensation: nothing to add
                    Some(&b) if v * b < 0.0 => {
                        let flag = shifted.entry(axis.clone()).or_insert(false);
                        if *flag {
                            v
                        } else {
                            *flag = true;
                            v - b
                        }
                    }
                    _ => v,
                };
                sub_shift.insert(axis.clone(), AxisValue::Float(target));
            }
        }
        let axes = shift.keys().cloned().collect();
        self.move_then_compensate(ctx, MoveRequest::relative(sub_shift), axes)
            .await
    }

    async fn do_move_abs(&self, ctx: TaskContext, pos: Position) -> ActuatorResult<()> {
        let current = self.dep.actuator.position().get();
        let mut sub_pos = Position::new();
        {
            let mut shifted = self.shifted.lock();
            for (axis, value) in &pos {
                let target = match self.backlash.get(axis) {
                    Some(&b) => {
                        let v = float_of(&pos, axis)?;
                        let shift = v - float_of(&current, axis)?;
                        if shift * b >= 0.0 {
                            shifted.insert(axis.clone(), false);
                            AxisValue::Float(v)
                        } else {
                            shifted.insert(axis.clone(), true);
                            AxisValue::Float(v - b)
                        }
                    }
                    None => value.clone(),
                };
                sub_pos.insert(axis.clone(), target);
            }
        }
        let axes = pos.keys().cloned().collect();
        self.move_then_compensate(ctx, MoveRequest::absolute(sub_pos), axes)
            .await
    }

    async fn move_then_compensate(
        &self,
        ctx: TaskContext,
        request: MoveRequest,
        axes: AxisSet,
    ) -> ActuatorResult<()> {
        let mut main = self.dep.actuator.request_move(request)?;
        if !self.is_shifted(&axes) {
            return main.await;
        }

        // A compensation follows: watch for an update move queued meanwhile
        let poll = self.settings.backlash_poll();
        loop {
            let done = match tokio::time::timeout(poll, &mut main).await {
                Ok(result) => {
                    result?;
                    true
                }
                Err(_) => false,
            };

            if let Some(next) = ctx.next_update_axes() {
                if axes.is_subset(&next) {
                    debug!(
                        "{}: ending move early as next move is an update containing {:?}",
                        self.name, axes
                    );
                    return Ok(());
                }
            }
            if done {
                break;
            }
        }

        self.compensate(&axes).await
    }

    async fn compensate(&self, axes: &AxisSet) -> ActuatorResult<()> {
        let mut sub_backlash = Position::new();
        {
            let mut shifted = self.shifted.lock();
            for axis in axes {
                if let (Some(flag), Some(&b)) = (shifted.get_mut(axis), self.backlash.get(axis)) {
                    if *flag {
                        sub_backlash.insert(axis.clone(), AxisValue::Float(b));
                        *flag = false;
                    }
                }
            }
        }
        if sub_backlash.is_empty() {
            return Ok(());
        }
        debug!("{}: running anti-backlash move {:?}", self.name, sub_backlash);
        self.dep.actuator.move_rel(sub_backlash)?.await
    }
}

/// Wrapper ensuring every move of the compensated axes ends in the same
/// direction.
#[derive(Clone)]
pub struct AntiBacklashActuator {
    inner: Arc<Inner>,
}

impl AntiBacklashActuator {
    /// # Errors
    ///
    /// `Configuration` if a backlash entry is not finite, names an axis the
    /// dependency lacks, or is not smaller than the axis span.
    pub fn new(
        name: impl Into<String>,
        role: impl Into<String>,
        dependencies: DependencyMap,
        config: AntiBacklashConfig,
    ) -> ActuatorResult<Self> {
        let name = name.into();
        config.settings.validate()?;
        let dep = single_dependency(dependencies, "AntiBacklashActuator")?;

        for (axis, b) in &config.backlash {
            if !b.is_finite() {
                return Err(ActuatorError::config(format!(
                    "{name}: backlash of '{axis}' must be a finite number, got {b}"
                )));
            }
            dep.axis(axis)?;
        }

        let mut axes = BTreeMap::new();
        for (axis, def) in dep.actuator.axes() {
            let mut def = def.clone().updatable(true);
            if let (Some(&b), AxisKind::Continuous { min, max }) =
                (config.backlash.get(axis), &mut def.kind)
            {
                if b.abs() >= *max - *min {
                    return Err(ActuatorError::config(format!(
                        "{name}: backlash {b} of '{axis}' is not smaller than its range [{min}, {max}]"
                    )));
                }
                // Keep room for the overshoot
                if b > 0.0 {
                    *min += b;
                } else {
                    *max += b;
                }
            }
            axes.insert(axis.clone(), def);
        }

        let shifted = config.backlash.keys().map(|a| (a.clone(), false)).collect();
        let state = new_state();
        let executor = SerialExecutor::new(name.clone(), state.clone())?;
        let inner = Arc::new(Inner {
            name,
            role: role.into(),
            axes,
            dep,
            backlash: config.backlash,
            shifted: Mutex::new(shifted),
            state,
            executor,
            settings: config.settings,
        });
        inner.state.publish(ActuatorState::Idle);
        Ok(Self { inner })
    }

    /// Whether `axis` overshot and still waits for its compensation.
    pub fn is_shifted(&self, axis: &str) -> bool {
        self.inner.shifted.lock().get(axis).copied().unwrap_or(false)
    }
}

#[async_trait]
impl Actuator for AntiBacklashActuator {
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
        self.inner.dep.actuator.position()
    }

    fn speed(&self) -> Option<&Observable<SpeedMap>> {
        self.inner.dep.actuator.speed()
    }

    fn set_speed(&self, speeds: SpeedMap) -> ActuatorResult<SpeedMap> {
        self.inner.dep.actuator.set_speed(speeds)
    }

    fn referenced(&self) -> Option<&Observable<ReferenceMap>> {
        self.inner.dep.actuator.referenced()
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

        let update = update_axes(&self.inner.axes, &request.values, request.update);
        let inner = Arc::clone(&self.inner);
        let MoveRequest { kind, values, .. } = request;
        Ok(self.inner.executor.submit(TaskKind::Move, update, move |ctx| {
            async move {
                match kind {
                    MoveKind::Relative => inner.do_move_rel(ctx, values).await,
                    MoveKind::Absolute => inner.do_move_abs(ctx, values).await,
                }
            }
            .boxed()
        }))
    }

    fn reference(&self, axes: AxisSet) -> ActuatorResult<MoveFuture> {
        self.inner.dep.actuator.reference(axes)
    }

    async fn stop(&self, axes: Option<AxisSet>) {
        self.inner.executor.cancel();
        stop_dependencies(
            &self.inner.name,
            vec![(Arc::clone(&self.inner.dep.actuator), axes)],
            self.inner.settings.stop_timeout(),
        )
        .await;
    }

    async fn terminate(&self) {
        self.stop(None).await;
        self.inner.executor.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::position;
    use crate::hardware::{MockActuator, MockCall};
    use std::time::Duration;

    fn stage() -> MockActuator {
        MockActuator::builder("stage")
            .axis("x", AxisDef::continuous(-5.0, 5.0))
            .axis("y", AxisDef::continuous(-5.0, 5.0))
            .build()
            .unwrap()
    }

    fn wrap(dep: &MockActuator, backlash: &[(&str, f64)]) -> ActuatorResult<AntiBacklashActuator> {
        let deps: DependencyMap =
            BTreeMap::from([("stage".to_string(), Arc::new(dep.clone()) as Arc<dyn Actuator>)]);
        AntiBacklashActuator::new(
            "ab",
            "stage",
            deps,
            AntiBacklashConfig {
                backlash: backlash.iter().map(|(a, b)| (a.to_string(), *b)).collect(),
                ..AntiBacklashConfig::default()
            },
        )
    }

    fn rel_shift(call: &MockCall, axis: &str) -> f64 {
        match call {
            MockCall::MoveRel(shift) => float_of(shift, axis).unwrap(),
            other => panic!("expected a relative move, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_backlash() {
        assert!(wrap(&stage(), &[("x", 10.0)]).is_err());
        assert!(wrap(&stage(), &[("z", 0.1)]).is_err());
        assert!(wrap(&stage(), &[("x", f64::NAN)]).is_err());
    }

    #[tokio::test]
    async fn test_range_restricted() {
        let ab = wrap(&stage(), &[("x", 0.5), ("y", -0.5)]).unwrap();
        assert_eq!(ab.axes()["x"].range(), Some((-4.5, 5.0)));
        assert_eq!(ab.axes()["y"].range(), Some((-5.0, 4.5)));
        assert!(ab.axes()["x"].can_update);
    }

    #[tokio::test]
    async fn test_same_direction_no_compensation() {
        let dep = stage();
        let ab = wrap(&dep, &[("x", 0.01)]).unwrap();
        ab.move_rel(position([("x", 1.0)])).unwrap().await.unwrap();
        ab.move_abs(position([("x", 2.0)])).unwrap().await.unwrap();

        assert_eq!(
            dep.calls(),
            vec![
                MockCall::MoveRel(position([("x", 1.0)])),
                MockCall::MoveAbs(position([("x", 2.0)])),
            ]
        );
        assert!(!ab.is_shifted("x"));
    }

    #[tokio::test]
    async fn test_absolute_against_backlash() {
        let dep = stage();
        let ab = wrap(&dep, &[("x", -0.5)]).unwrap();
        ab.move_abs(position([("x", 1.0)])).unwrap().await.unwrap();

        let calls = dep.calls();
        assert_eq!(calls[0], MockCall::MoveAbs(position([("x", 1.5)])));
        assert!((rel_shift(&calls[1], "x") + 0.5).abs() < 1e-12);
        assert!(!ab.is_shifted("x"));
    }

    #[tokio::test]
    async fn test_compensation_skipped_before_update_move() {
        let dep = stage();
        dep.set_move_delay(Duration::from_millis(50));
        let ab = wrap(&dep, &[("x", 0.1)]).unwrap();

        let first = ab.move_rel(position([("x", -1.0)])).unwrap();
        let second = ab
            .request_move(MoveRequest::relative(position([("x", -0.5)])).update())
            .unwrap();
        first.await.unwrap();
        second.await.unwrap();

        let calls = dep.calls();
        assert_eq!(calls.len(), 3);
        assert!((rel_shift(&calls[0], "x") + 1.1).abs() < 1e-12);
        // Already shifted: no extra overshoot
        assert!((rel_shift(&calls[1], "x") + 0.5).abs() < 1e-12);
        assert!((rel_shift(&calls[2], "x") - 0.1).abs() < 1e-12);
        assert!(!ab.is_shifted("x"));
    }
}
