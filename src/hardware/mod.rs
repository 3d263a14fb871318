//! Simulated hardware used by the tests and the demo binary.

pub mod mock;

pub use mock::{MockActuator, MockActuatorBuilder, MockCall};
