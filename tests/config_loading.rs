//! Layered loading of actuator settings.

use daq_actuators::{ActuatorError, ActuatorSettings};
use serial_test::serial;
use std::io::Write;
use tempfile::NamedTempFile;

const ENV_KEYS: [&str; 2] = ["DAQ_ACTUATOR_STOP_TIMEOUT_MS", "DAQ_ACTUATOR_CONVERGENCE_STEP"];

fn clear_env() {
    for key in ENV_KEYS {
        std::env::remove_var(key);
    }
}

fn toml_file(content: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
#[serial]
fn defaults_without_sources() {
    clear_env();
    let settings = ActuatorSettings::load(None).unwrap();
    assert_eq!(settings, ActuatorSettings::default());
    assert_eq!(settings.stop_timeout_ms, 1000);
    assert_eq!(settings.convergence_attempts, 10);
}

#[test]
#[serial]
fn file_overrides_defaults() {
    clear_env();
    let file = toml_file("stop_timeout_ms = 250\nrotation_reference_period = 3\n");
    let settings = ActuatorSettings::load(Some(file.path())).unwrap();
    assert_eq!(settings.stop_timeout_ms, 250);
    assert_eq!(settings.rotation_reference_period, 3);
    assert_eq!(settings.backlash_poll_ms, 10);
}

#[test]
#[serial]
fn environment_overrides_file() {
    clear_env();
    let file = toml_file("stop_timeout_ms = 250\n");
    std::env::set_var("DAQ_ACTUATOR_STOP_TIMEOUT_MS", "75");
    let settings = ActuatorSettings::load(Some(file.path()));
    clear_env();
    assert_eq!(settings.unwrap().stop_timeout_ms, 75);
}

#[test]
#[serial]
fn out_of_bounds_value_is_rejected() {
    clear_env();
    std::env::set_var("DAQ_ACTUATOR_CONVERGENCE_STEP", "1.5");
    let result = ActuatorSettings::load(None);
    clear_env();
    assert!(matches!(result, Err(ActuatorError::Configuration(_))));
}

#[test]
#[serial]
fn malformed_file_is_a_load_error() {
    clear_env();
    let file = toml_file("stop_timeout_ms = \"soon\"\n");
    assert!(matches!(
        ActuatorSettings::load(Some(file.path())),
        Err(ActuatorError::ConfigLoad(_))
    ));
}
