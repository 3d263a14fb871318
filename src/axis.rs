//! Axis descriptors and position maps.
//!
//! An [`AxisDef`] is the static description of one logical axis: either a
//! continuous range or a discrete set of choices, plus a unit, an optional
//! speed range and whether the axis accepts update moves.
//!
//! Positions, shifts and targets are all plain maps from axis name to
//! [`AxisValue`]. The `check_*` helpers implement the synchronous validation
//! every actuator runs before queueing a request.

use crate::error::{ActuatorError, ActuatorResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Value of one axis: a number, or a label for discrete axes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AxisValue {
    Float(f64),
    Label(String),
}

impl AxisValue {
    /// Numeric value, if this is not a label.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AxisValue::Float(v) => Some(*v),
            AxisValue::Label(_) => None,
        }
    }

    /// Label, if this is not a number.
    pub fn as_label(&self) -> Option<&str> {
        match self {
            AxisValue::Float(_) => None,
            AxisValue::Label(l) => Some(l),
        }
    }
}

impl From<f64> for AxisValue {
    fn from(v: f64) -> Self {
        AxisValue::Float(v)
    }
}

impl From<&str> for AxisValue {
    fn from(v: &str) -> Self {
        AxisValue::Label(v.to_string())
    }
}

impl From<String> for AxisValue {
    fn from(v: String) -> Self {
        AxisValue::Label(v)
    }
}

impl fmt::Display for AxisValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AxisValue::Float(v) => write!(f, "{v}"),
            AxisValue::Label(l) => write!(f, "{l}"),
        }
    }
}

/// Axis name → value. Used for positions, shifts and targets.
pub type Position = BTreeMap<String, AxisValue>;
/// Axis name → speed (unit/s).
pub type SpeedMap = BTreeMap<String, f64>;
/// Axis name → referenced flag.
pub type ReferenceMap = BTreeMap<String, bool>;
/// A set of axis names.
pub type AxisSet = BTreeSet<String>;

/// Build a [`Position`] from `(axis, value)` pairs.
///
/// ```rust,ignore
/// let target = position([("x", 1.0), ("y", 2.0)]);
/// ```
pub fn position<K, V, I>(entries: I) -> Position
where
    K: Into<String>,
    V: Into<AxisValue>,
    I: IntoIterator<Item = (K, V)>,
{
    entries
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Build an [`AxisSet`] from axis names.
pub fn axis_set<K, I>(names: I) -> AxisSet
where
    K: Into<String>,
    I: IntoIterator<Item = K>,
{
    names.into_iter().map(Into::into).collect()
}

/// Numeric value of `axis` in `pos`.
pub fn float_of(pos: &Position, axis: &str) -> ActuatorResult<f64> {
    match pos.get(axis) {
        Some(AxisValue::Float(v)) => Ok(*v),
        Some(AxisValue::Label(l)) => Err(ActuatorError::InvalidArgument(format!(
            "axis '{axis}' has non-numeric value '{l}'"
        ))),
        None => Err(ActuatorError::UnknownAxis(axis.to_string())),
    }
}

/// Range or choices of an axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AxisKind {
    Continuous { min: f64, max: f64 },
    Discrete { choices: Vec<AxisValue> },
}

/// Static metadata of one logical axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisDef {
    pub kind: AxisKind,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub speed_range: Option<(f64, f64)>,
    #[serde(default)]
    pub can_update: bool,
}

impl AxisDef {
    /// Continuous axis over `[min, max]`.
    pub fn continuous(min: f64, max: f64) -> Self {
        Self {
            kind: AxisKind::Continuous { min, max },
            unit: None,
            speed_range: None,
            can_update: false,
        }
    }

    /// Discrete axis restricted to `choices`.
    pub fn discrete<V: Into<AxisValue>>(choices: impl IntoIterator<Item = V>) -> Self {
        Self {
            kind: AxisKind::Discrete {
                choices: choices.into_iter().map(Into::into).collect(),
            },
            unit: None,
            speed_range: None,
            can_update: false,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_speed_range(mut self, min: f64, max: f64) -> Self {
        self.speed_range = Some((min, max));
        self
    }

    /// Allow update moves on this axis.
    pub fn updatable(mut self, can_update: bool) -> Self {
        self.can_update = can_update;
        self
    }

    /// Check the descriptor invariants.
    pub fn validate(&self, name: &str) -> ActuatorResult<()> {
        match &self.kind {
            AxisKind::Continuous { min, max } => {
                if min.is_nan() || max.is_nan() || min > max {
                    return Err(ActuatorError::config(format!(
                        "axis '{name}' has invalid range [{min}, {max}]"
                    )));
                }
            }
            AxisKind::Discrete { choices } => {
                if choices.is_empty() {
                    return Err(ActuatorError::config(format!(
                        "axis '{name}' has no choices"
                    )));
                }
            }
        }
        Ok(())
    }

    /// `(min, max)` of a continuous axis.
    pub fn range(&self) -> Option<(f64, f64)> {
        match self.kind {
            AxisKind::Continuous { min, max } => Some((min, max)),
            AxisKind::Discrete { .. } => None,
        }
    }

    /// Choices of a discrete axis.
    pub fn choices(&self) -> Option<&[AxisValue]> {
        match &self.kind {
            AxisKind::Continuous { .. } => None,
            AxisKind::Discrete { choices } => Some(choices),
        }
    }

    pub fn is_discrete(&self) -> bool {
        matches!(self.kind, AxisKind::Discrete { .. })
    }

    /// Whether `value` is an acceptable absolute position for this axis.
    pub fn accepts(&self, value: &AxisValue) -> bool {
        match (&self.kind, value) {
            (AxisKind::Continuous { min, max }, AxisValue::Float(v)) => *min <= *v && *v <= *max,
            (AxisKind::Continuous { .. }, AxisValue::Label(_)) => false,
            (AxisKind::Discrete { choices }, v) => choices.iter().any(|c| c == v),
        }
    }
}

/// Validate a relative move: known axes, numeric finite shifts, no discrete
/// axis, and no shift larger than the axis span.
pub fn check_move_rel(axes: &BTreeMap<String, AxisDef>, shift: &Position) -> ActuatorResult<()> {
    for (name, value) in shift {
        let def = axes
            .get(name)
            .ok_or_else(|| ActuatorError::UnknownAxis(name.clone()))?;
        if def.is_discrete() {
            return Err(ActuatorError::Unsupported(format!(
                "relative move on discrete axis '{name}'"
            )));
        }
        let v = value.as_f64().ok_or_else(|| {
            ActuatorError::InvalidArgument(format!("shift of '{name}' must be a number"))
        })?;
        if !v.is_finite() {
            return Err(ActuatorError::InvalidArgument(format!(
                "shift of '{name}' is not finite"
            )));
        }
        if let Some((min, max)) = def.range() {
            let span = max - min;
            if v.abs() > span {
                return Err(ActuatorError::InvalidArgument(format!(
                    "shift {v} of '{name}' exceeds axis span {span}"
                )));
            }
        }
    }
    Ok(())
}

/// Validate an absolute move: known axes and values within range or choices.
pub fn check_move_abs(axes: &BTreeMap<String, AxisDef>, pos: &Position) -> ActuatorResult<()> {
    for (name, value) in pos {
        let def = axes
            .get(name)
            .ok_or_else(|| ActuatorError::UnknownAxis(name.clone()))?;
        if !def.accepts(value) {
            return Err(ActuatorError::InvalidArgument(format!(
                "position {value} not allowed for axis '{name}'"
            )));
        }
    }
    Ok(())
}

/// Validate a reference request: every axis must exist.
pub fn check_reference(
    axes: &BTreeMap<String, AxisDef>,
    requested: &AxisSet,
) -> ActuatorResult<()> {
    match requested.iter().find(|a| !axes.contains_key(*a)) {
        Some(unknown) => Err(ActuatorError::UnknownAxis(unknown.clone())),
        None => Ok(()),
    }
}

/// Axes of a move that may be treated as an update: all of them if every
/// axis supports it, otherwise none.
pub fn update_axes(
    axes: &BTreeMap<String, AxisDef>,
    moved: &Position,
    update: bool,
) -> Option<AxisSet> {
    if !update || moved.is_empty() {
        return None;
    }
    if moved
        .keys()
        .all(|a| axes.get(a).map(|d| d.can_update).unwrap_or(false))
    {
        Some(moved.keys().cloned().collect())
    } else {
        tracing::warn!(
            "Update move requested on axes {:?} that do not all support it",
            moved.keys().collect::<Vec<_>>()
        );
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn axes() -> BTreeMap<String, AxisDef> {
        BTreeMap::from([
            ("x".to_string(), AxisDef::continuous(-1.0, 1.0).updatable(true)),
            ("fw".to_string(), AxisDef::discrete(["red", "green"])),
        ])
    }

    #[test]
    fn test_relative_on_discrete_is_unsupported() {
        let err = check_move_rel(&axes(), &position([("fw", 1.0)])).unwrap_err();
        assert!(matches!(err, ActuatorError::Unsupported(_)));
    }

    #[test]
    fn test_relative_checks() {
        assert!(check_move_rel(&axes(), &position([("x", -1.5)])).is_ok());
        assert!(check_move_rel(&axes(), &position([("x", 2.5)])).is_err());
        assert!(matches!(
            check_move_rel(&axes(), &position([("z", 0.1)])),
            Err(ActuatorError::UnknownAxis(_))
        ));
    }

    #[test]
    fn test_absolute_checks() {
        assert!(check_move_abs(&axes(), &position([("x", 0.5)])).is_ok());
        assert!(check_move_abs(&axes(), &position([("x", 1.5)])).is_err());
        assert!(check_move_abs(&axes(), &position([("fw", "green")])).is_ok());
        assert!(check_move_abs(&axes(), &position([("fw", "blue")])).is_err());
    }

    #[test]
    fn test_descriptor_validation() {
        assert!(AxisDef::continuous(1.0, 0.0).validate("x").is_err());
        assert!(AxisDef::discrete(Vec::<f64>::new()).validate("x").is_err());
        assert!(AxisDef::discrete([0.0, 90.0]).validate("x").is_ok());
    }

    #[test]
    fn test_update_requires_every_axis() {
        let a = axes();
        assert_eq!(
            update_axes(&a, &position([("x", 0.1)]), true),
            Some(axis_set(["x"]))
        );
        assert_eq!(
            update_axes(&a, &position([("x", AxisValue::from(0.1)), ("fw", AxisValue::from("red"))]), true),
            None
        );
        assert_eq!(update_axes(&a, &position([("x", 0.1)]), false), None);
    }

    #[test]
    fn test_axis_value_serde_untagged() {
        let pos: Position = serde_json::from_str(r#"{"x": 1.5, "fw": "red"}"#).unwrap();
        assert_eq!(pos["x"], AxisValue::Float(1.5));
        assert_eq!(pos["fw"].as_label(), Some("red"));
    }
}
