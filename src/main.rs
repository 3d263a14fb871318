//! # Actuator simulator
//!
//! Builds simulated axis drivers, wraps them into one of the composite
//! actuators and runs a scripted move, then prints the resulting position as
//! JSON, keyed by attribute name.
//!
//! # Usage
//!
//! ```bash
//! # Two mock stages combined into one x/y actuator
//! actuator_sim multiplex --target 0.001 --target 0.002
//!
//! # Backlash compensation, relative move against the backlash
//! actuator_sim anti-backlash --target -0.001 --relative
//!
//! # Rotation stage, settings from a file, JSON logs
//! actuator_sim rotation --target 6.2 --config actuators.toml --json
//! ```

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use daq_actuators::actuators::{
    AntiBacklashActuator, AntiBacklashConfig, ConvertConfig, ConvertStage, FixedPositionsActuator,
    FixedPositionsConfig, LinearActuator, LinearConfig, MultiplexActuator, MultiplexConfig,
    RotationActuator, RotationConfig,
};
use daq_actuators::hardware::MockActuator;
use daq_actuators::{
    Actuator, ActuatorSettings, AxisDef, AxisValue, DependencyMap, MoveRequest, Position,
    TransformParams,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Variant {
    /// x and y taken from two independent stages
    Multiplex,
    /// x/y stage seen through a rotated frame
    Convert,
    /// x/y stage whose moves always end in the same direction
    AntiBacklash,
    /// Offset linear axis, re-homed periodically
    Linear,
    /// Four-slot filter wheel
    FixedPositions,
    /// Endless rotation axis
    Rotation,
}

/// Run a scripted move on a composite actuator built over simulated drivers
#[derive(Parser, Debug)]
#[command(name = "actuator_sim")]
#[command(version)]
#[command(about = "Composite actuator simulator")]
struct Args {
    /// Composite actuator to build
    #[arg(value_enum)]
    variant: Variant,

    /// Target value of each exposed axis, in axis order (repeat for several axes)
    #[arg(short, long, allow_negative_numbers = true)]
    target: Vec<f64>,

    /// Move relatively instead of absolutely
    #[arg(short, long)]
    relative: bool,

    /// TOML file with actuator settings (DAQ_ACTUATOR_* variables override it)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Simulated travel time of each driver move, in milliseconds
    #[arg(long, default_value_t = 10)]
    delay_ms: u64,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_tracing(args.json);

    let settings = ActuatorSettings::load(args.config.as_deref()).context("loading settings")?;
    let actuator = build(args.variant, settings, Duration::from_millis(args.delay_ms))?;
    info!("Built '{}' with axes {:?}", actuator.name(), actuator.axes().keys());

    if !args.target.is_empty() {
        let axes: Vec<&String> = actuator.axes().keys().collect();
        if args.target.len() > axes.len() {
            bail!(
                "{} targets given, but '{}' has only {} axes",
                args.target.len(),
                actuator.name(),
                axes.len()
            );
        }
        let values: Position = axes
            .into_iter()
            .zip(&args.target)
            .map(|(axis, v)| (axis.clone(), AxisValue::Float(*v)))
            .collect();
        let request = if args.relative {
            MoveRequest::relative(values)
        } else {
            MoveRequest::absolute(values)
        };
        info!("Requesting {:?}", request);
        actuator.request_move(request)?.await?;
    }

    let mut report = serde_json::Map::new();
    let position = actuator.position();
    report.insert(position.name().to_string(), serde_json::to_value(position.get())?);
    if let Some(referenced) = actuator.referenced() {
        report.insert(referenced.name().to_string(), serde_json::to_value(referenced.get())?);
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    actuator.terminate().await;
    Ok(())
}

fn setup_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn stage(name: &str, delay: Duration) -> anyhow::Result<MockActuator> {
    Ok(MockActuator::builder(name)
        .axis("x", AxisDef::continuous(-0.05, 0.05).with_unit("m"))
        .axis("y", AxisDef::continuous(-0.05, 0.05).with_unit("m"))
        .referenceable(true)
        .move_delay(delay)
        .build()?)
}

fn single(axis: &str, dep: MockActuator) -> DependencyMap {
    BTreeMap::from([(axis.to_string(), Arc::new(dep) as Arc<dyn Actuator>)])
}

fn build(
    variant: Variant,
    settings: ActuatorSettings,
    delay: Duration,
) -> anyhow::Result<Arc<dyn Actuator>> {
    let actuator: Arc<dyn Actuator> = match variant {
        Variant::Multiplex => {
            let deps: DependencyMap = BTreeMap::from([
                ("x".to_string(), Arc::new(stage("stage-a", delay)?) as Arc<dyn Actuator>),
                ("y".to_string(), Arc::new(stage("stage-b", delay)?) as Arc<dyn Actuator>),
            ]);
            let config = MultiplexConfig {
                settings,
                ..MultiplexConfig::new([("x", "x"), ("y", "y")])
            };
            Arc::new(MultiplexActuator::new("stage", "stage", deps, config)?)
        }
        Variant::Convert => {
            let config = ConvertConfig {
                settings,
                ..ConvertConfig::new("x", "y")
            }
            .with_transform(TransformParams {
                rotation: std::f64::consts::FRAC_PI_4,
                ..TransformParams::default()
            });
            let deps = single("stage", stage("stage", delay)?);
            Arc::new(ConvertStage::new("stage-rotated", "align", deps, config)?)
        }
        Variant::AntiBacklash => {
            let config = AntiBacklashConfig {
                backlash: BTreeMap::from([("x".to_string(), 1e-4), ("y".to_string(), -1e-4)]),
                settings,
            };
            let deps = single("stage", stage("stage", delay)?);
            Arc::new(AntiBacklashActuator::new("stage-bl", "stage", deps, config)?)
        }
        Variant::Linear => {
            let rail = MockActuator::builder("rail")
                .axis("z", AxisDef::continuous(0.0, 0.1).with_unit("m"))
                .referenceable(false)
                .move_delay(delay)
                .build()?;
            let config = LinearConfig {
                offset: 0.01,
                settings,
                ..LinearConfig::new("z")
            };
            Arc::new(LinearActuator::new("focus", "focus", single("z", rail), config)?)
        }
        Variant::FixedPositions => {
            let wheel = MockActuator::builder("wheel")
                .axis("rz", AxisDef::continuous(-1e4, 1e4).with_unit("rad"))
                .referenceable(false)
                .move_delay(delay)
                .build()?;
            let config = FixedPositionsConfig {
                settings,
                ..FixedPositionsConfig::new("rz", [0.0, 1.5, 3.0, 4.5]).cyclic(6.0)
            };
            let deps = single("band", wheel);
            Arc::new(FixedPositionsActuator::new("filter-wheel", "filter", deps, config)?)
        }
        Variant::Rotation => {
            let spindle = MockActuator::builder("spindle")
                .axis("rz", AxisDef::continuous(-1e4, 1e4).with_unit("rad"))
                .referenceable(false)
                .move_delay(delay)
                .build()?;
            let config = RotationConfig {
                settings,
                ..RotationConfig::new("rz")
            };
            Arc::new(RotationActuator::new("rotator", "rotator", single("rz", spindle), config)?)
        }
    };
    Ok(actuator)
}
