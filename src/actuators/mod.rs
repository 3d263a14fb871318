//! Composite actuators.
//!
//! Each type wraps one or more dependency actuators and exposes them as a new
//! [`Actuator`]:
//!
//! - [`MultiplexActuator`]: axes taken from several dependencies
//! - [`ConvertStage`]: affine x/y conversion of a dependency
//! - [`CoupledStage`]: master stage followed by a converted slave stage
//! - [`AntiBacklashActuator`]: every move ends in the same direction
//! - [`LinearActuator`]: offset axis re-homed every few moves
//! - [`FixedPositionsActuator`]: discrete, optionally cyclic, positions
//! - [`CombinedSensorActuator`]: moves verified against a second dependency
//! - [`CombinedFixedPositionActuator`]: one discrete axis over two dependencies
//! - [`RotationActuator`]: wrapping axis unrolled into `[0, cycle)`

pub mod antibacklash;
pub mod combined_fixed;
pub mod convert;
pub mod coupled;
pub mod fixed_positions;
pub mod linear;
pub mod multiplex;
pub mod rotation;
pub mod sensor;

pub use antibacklash::{AntiBacklashActuator, AntiBacklashConfig};
pub use combined_fixed::{CombinedFixedPositionActuator, CombinedFixedPositionConfig};
pub use convert::{ConvertConfig, ConvertStage};
pub use coupled::{CoupledConfig, CoupledStage};
pub use fixed_positions::{FixedPositionsActuator, FixedPositionsConfig};
pub use linear::{LinearActuator, LinearConfig};
pub use multiplex::{MultiplexActuator, MultiplexConfig};
pub use rotation::{RotationActuator, RotationConfig};
pub use sensor::{CombinedSensorActuator, CombinedSensorConfig};

use crate::axis::AxisSet;
use crate::capabilities::{Actuator, ActuatorState};
use crate::error::ActuatorResult;
use crate::executor::MoveFuture;
use crate::observable::{ListenerId, Observable};
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{warn, Instrument};

type Unsubscribe = Box<dyn FnOnce() + Send>;

/// Listener registrations on dependency observables, released on terminate.
#[derive(Default)]
pub(crate) struct Subscriptions {
    active: Mutex<Vec<Unsubscribe>>,
}

impl Subscriptions {
    /// Register `listener` on `observable` and remember how to remove it.
    pub(crate) fn watch<T, F>(&self, observable: &Observable<T>, init: bool, listener: F)
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = observable.subscribe_with(init, listener);
        let observable = observable.clone();
        self.active.lock().push(Box::new(move || {
            observable.unsubscribe(id);
        }));
    }

    /// Remove every registered listener.
    pub(crate) fn release(&self) {
        let active: Vec<Unsubscribe> = self.active.lock().drain(..).collect();
        for unsubscribe in active {
            unsubscribe();
        }
    }
}

/// A listener that can be detached while a move is in progress.
///
/// [`PausableWatch::pause`] unsubscribes and returns a guard which
/// re-subscribes (with immediate delivery of the current value) when dropped,
/// whether the move succeeded, failed or was abandoned.
pub(crate) struct PausableWatch<T: Clone + Send + Sync + 'static> {
    observable: Observable<T>,
    listener: Arc<dyn Fn(&T) + Send + Sync>,
    id: Mutex<Option<ListenerId>>,
    closed: AtomicBool,
}

impl<T: Clone + Send + Sync + 'static> PausableWatch<T> {
    /// Not subscribed until [`PausableWatch::resume`] is called.
    pub(crate) fn new<F>(observable: &Observable<T>, listener: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        Self {
            observable: observable.clone(),
            listener: Arc::new(listener),
            id: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Subscribe, delivering the current value right away.
    pub(crate) fn resume(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut id = self.id.lock();
        if id.is_none() {
            let listener = Arc::clone(&self.listener);
            *id = Some(self.observable.subscribe_with(true, move |v| listener(v)));
        }
    }

    pub(crate) fn pause(&self) -> PauseGuard<'_, T> {
        if let Some(id) = self.id.lock().take() {
            self.observable.unsubscribe(id);
        }
        PauseGuard { watch: self }
    }

    /// Unsubscribe for good.
    pub(crate) fn release(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(id) = self.id.lock().take() {
            self.observable.unsubscribe(id);
        }
    }
}

pub(crate) struct PauseGuard<'a, T: Clone + Send + Sync + 'static> {
    watch: &'a PausableWatch<T>,
}

impl<T: Clone + Send + Sync + 'static> Drop for PauseGuard<'_, T> {
    fn drop(&mut self) {
        self.watch.resume();
    }
}

/// Fresh state attribute for a composite actuator.
pub(crate) fn new_state() -> Observable<ActuatorState> {
    Observable::new("state", ActuatorState::Uninitialized)
}

/// Halt several dependencies concurrently, waiting at most `timeout` for each.
///
/// Overruns are logged, never reported.
pub(crate) async fn stop_dependencies(
    owner: &str,
    targets: Vec<(Arc<dyn Actuator>, Option<AxisSet>)>,
    timeout: Duration,
) {
    let span = tracing::info_span!("stop", actuator = %owner);
    async {
        let handles: Vec<_> = targets
            .into_iter()
            .map(|(dep, axes)| {
                let dep_name = dep.name().to_string();
                (dep_name, tokio::spawn(async move { dep.stop(axes).await }))
            })
            .collect();

        for (dep_name, handle) in handles {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Stopping dependency '{}' failed: {}", dep_name, e),
                Err(_) => warn!(
                    "Stopping dependency '{}' of '{}' is taking more than {:?}",
                    dep_name, owner, timeout
                ),
            }
        }
    }
    .instrument(span)
    .await
}

/// Wait for every future, then return the first error.
pub(crate) async fn join_moves(futures: Vec<MoveFuture>) -> ActuatorResult<()> {
    join_all(futures).await.into_iter().collect()
}

/// Record an asynchronous initialization failure: log it, halt the affected
/// dependency axes and expose the error through `state`.
pub(crate) async fn record_init_failure(
    owner: &str,
    state: &Observable<ActuatorState>,
    dep: &Arc<dyn Actuator>,
    axes: AxisSet,
    error: &crate::error::ActuatorError,
) {
    tracing::error!("Initial referencing of '{}' failed: {}", owner, error);
    dep.stop(Some(axes)).await;
    state.publish(ActuatorState::Error(error.to_string()));
}
