//! 2D affine conversion between an exposed frame and a dependency frame.
//!
//! ```text
//! dep     = S · R(θ) · (exposed + T)       (T only for absolute positions)
//! exposed = R(−θ) · S⁻¹ · dep − T
//! ```
//!
//! with `S = diag(sx, sy)` and `R(θ)` the counter-clockwise rotation.

use crate::error::{ActuatorError, ActuatorResult};
use serde::{Deserialize, Serialize};

/// Rotation, scale and translation corrections.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransformParams {
    /// Rotation (rad)
    #[serde(default)]
    pub rotation: f64,
    /// Scale factor from exposed to dependency frame
    #[serde(default = "unit_scale")]
    pub scale: (f64, f64),
    /// Offset between the origins, in the exposed frame
    #[serde(default)]
    pub translation: (f64, f64),
}

fn unit_scale() -> (f64, f64) {
    (1.0, 1.0)
}

impl Default for TransformParams {
    fn default() -> Self {
        Self {
            rotation: 0.0,
            scale: unit_scale(),
            translation: (0.0, 0.0),
        }
    }
}

impl TransformParams {
    pub fn validate(&self) -> ActuatorResult<()> {
        let (sx, sy) = self.scale;
        if !(sx.is_finite() && sy.is_finite()) || sx == 0.0 || sy == 0.0 {
            return Err(ActuatorError::config(format!(
                "scale must be finite and non-zero, got ({sx}, {sy})"
            )));
        }
        let (tx, ty) = self.translation;
        if !(self.rotation.is_finite() && tx.is_finite() && ty.is_finite()) {
            return Err(ActuatorError::config("rotation and translation must be finite"));
        }
        Ok(())
    }
}

/// Precomputed matrices for a set of [`TransformParams`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineTransform {
    params: TransformParams,
    to_dep: [[f64; 2]; 2],
    from_dep: [[f64; 2]; 2],
}

impl AffineTransform {
    pub fn new(params: TransformParams) -> ActuatorResult<Self> {
        params.validate()?;
        let (sin, cos) = params.rotation.sin_cos();
        let (sx, sy) = params.scale;
        Ok(Self {
            params,
            to_dep: [[cos * sx, -sin * sx], [sin * sy, cos * sy]],
            from_dep: [[cos / sx, sin / sy], [-sin / sx, cos / sy]],
        })
    }

    pub fn params(&self) -> &TransformParams {
        &self.params
    }

    /// Exposed → dependency. `absolute` applies the translation.
    pub fn to_dependency(&self, p: (f64, f64), absolute: bool) -> (f64, f64) {
        let (mut x, mut y) = p;
        if absolute {
            x += self.params.translation.0;
            y += self.params.translation.1;
        }
        apply(&self.to_dep, (x, y))
    }

    /// Dependency → exposed. `absolute` removes the translation.
    pub fn from_dependency(&self, q: (f64, f64), absolute: bool) -> (f64, f64) {
        let (mut x, mut y) = apply(&self.from_dep, q);
        if absolute {
            x -= self.params.translation.0;
            y -= self.params.translation.1;
        }
        (x, y)
    }
}

fn apply(m: &[[f64; 2]; 2], (x, y): (f64, f64)) -> (f64, f64) {
    (m[0][0] * x + m[0][1] * y, m[1][0] * x + m[1][1] * y)
}
