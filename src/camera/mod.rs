//! Camera model abstraction.
//!
//! Two variants participate in the adjustment:
//!
//! - [`AdjustedCamera`]: a 6-parameter (translation, axis-angle) delta
//!   layered on top of an immutable base sensor. The delta starts at zero
//!   and is what the solver optimises.
//! - [`PinholeCamera`]: full extrinsics plus shared intrinsics
//!   (focal length, optical centre, distortion); the solver optimises the
//!   pose directly and, optionally, multiplicative scales on the intrinsics.
//!
//! The parameter-block ordering of both variants is stable for the lifetime
//! of a solve: `[position (3), axis-angle rotation (3)]`.

pub mod adjusted;
pub mod pinhole;

pub use adjusted::AdjustedCamera;
pub use pinhole::PinholeCamera;

use std::path::Path;

use nalgebra::{Matrix3, Rotation3, Vector2, Vector3};

use crate::error::{AdjustError, AdjustResult};

/// Number of extrinsic parameters per camera (3 translation + 3 axis-angle).
pub const CAMERA_PARAMS_N: usize = 6;

/// Capability interface of an immutable projecting sensor.
///
/// Implementations must be `Send + Sync`: the solver evaluates residuals
/// against them from its thread pool.
pub trait SensorModel: Send + Sync {
    /// Project a geocentric point to a pixel. `None` signals projection
    /// failure (behind-camera, numerical overflow); callers skip the
    /// corresponding residual.
    fn project(&self, xyz: &Vector3<f64>) -> Option<Vector2<f64>>;

    /// Unit viewing ray in world coordinates for a pixel, used when
    /// triangulating tie points. `None` when the pixel cannot be inverted.
    fn pixel_to_vector(&self, pix: &Vector2<f64>) -> Option<Vector3<f64>>;

    /// Camera centre in world coordinates.
    fn center(&self) -> Vector3<f64>;

    /// World-to-camera rotation.
    fn pose(&self) -> Rotation3<f64>;
}

/// A camera participating in the adjustment.
pub enum BaCamera {
    Adjusted(AdjustedCamera),
    Pinhole(PinholeCamera),
}

impl BaCamera {
    pub fn project(&self, xyz: &Vector3<f64>) -> Option<Vector2<f64>> {
        match self {
            BaCamera::Adjusted(cam) => cam.project(xyz),
            BaCamera::Pinhole(cam) => cam.project(xyz),
        }
    }

    pub fn pixel_to_vector(&self, pix: &Vector2<f64>) -> Option<Vector3<f64>> {
        match self {
            BaCamera::Adjusted(cam) => cam.pixel_to_vector(pix),
            BaCamera::Pinhole(cam) => cam.pixel_to_vector(pix),
        }
    }

    pub fn center(&self) -> Vector3<f64> {
        match self {
            BaCamera::Adjusted(cam) => cam.center(),
            BaCamera::Pinhole(cam) => cam.center(),
        }
    }

    pub fn pose(&self) -> Rotation3<f64> {
        match self {
            BaCamera::Adjusted(cam) => cam.pose(),
            BaCamera::Pinhole(cam) => cam.pose(),
        }
    }

    pub fn as_pinhole(&self) -> Option<&PinholeCamera> {
        match self {
            BaCamera::Pinhole(cam) => Some(cam),
            BaCamera::Adjusted(_) => None,
        }
    }

    pub fn as_pinhole_mut(&mut self) -> Option<&mut PinholeCamera> {
        match self {
            BaCamera::Pinhole(cam) => Some(cam),
            BaCamera::Adjusted(_) => None,
        }
    }

    /// Extrinsic parameter vector in the stable block layout.
    pub fn extrinsic_params(&self) -> [f64; CAMERA_PARAMS_N] {
        match self {
            BaCamera::Adjusted(cam) => cam.delta_params(),
            BaCamera::Pinhole(cam) => cam.extrinsic_params(),
        }
    }

    /// Write an optimised extrinsic parameter vector back into the model.
    pub fn set_extrinsic_params(&mut self, params: &[f64]) {
        match self {
            BaCamera::Adjusted(cam) => cam.set_delta_params(params),
            BaCamera::Pinhole(cam) => cam.set_extrinsic_params(params),
        }
    }
}

/// Pixel extent of an image, used for inside-the-image predicates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageBox {
    pub width: f64,
    pub height: f64,
}

impl ImageBox {
    pub fn new(width: usize, height: usize) -> Self {
        ImageBox {
            width: width as f64,
            height: height as f64,
        }
    }

    pub fn contains(&self, pix: &Vector2<f64>) -> bool {
        pix.x.is_finite()
            && pix.y.is_finite()
            && pix.x >= 0.0
            && pix.y >= 0.0
            && pix.x < self.width
            && pix.y < self.height
    }
}

/// A 3D similarity transform applied as `x' = s * R * x + t`.
#[derive(Debug, Clone, PartialEq)]
pub struct Similarity {
    pub rotation: Rotation3<f64>,
    pub translation: Vector3<f64>,
    pub scale: f64,
}

impl Similarity {
    pub fn identity() -> Self {
        Similarity {
            rotation: Rotation3::identity(),
            translation: Vector3::zeros(),
            scale: 1.0,
        }
    }

    pub fn apply(&self, x: &Vector3<f64>) -> Vector3<f64> {
        self.scale * (self.rotation * x) + self.translation
    }

    pub fn inverse(&self) -> Similarity {
        let inv_rot = self.rotation.inverse();
        Similarity {
            rotation: inv_rot,
            translation: -(inv_rot * self.translation) / self.scale,
            scale: 1.0 / self.scale,
        }
    }

    /// Read a pc_align-style 4x4 matrix file: the upper-left 3x3 block is
    /// `s * R` and the last column holds the translation.
    pub fn read_matrix_file<P: AsRef<Path>>(path: P) -> AdjustResult<Self> {
        let text = std::fs::read_to_string(&path)?;
        let vals: Vec<f64> = text
            .split_whitespace()
            .map(|t| t.parse::<f64>())
            .collect::<Result<_, _>>()?;
        if vals.len() != 16 {
            return Err(AdjustError::Io(format!(
                "Expected a 4x4 transform in {}, got {} values",
                path.as_ref().display(),
                vals.len()
            )));
        }
        let m = Matrix3::new(
            vals[0], vals[1], vals[2], vals[4], vals[5], vals[6], vals[8], vals[9], vals[10],
        );
        let scale = m.determinant().cbrt();
        if !scale.is_finite() || scale <= 0.0 {
            return Err(AdjustError::Io(format!(
                "Transform in {} is not a positive similarity (det = {})",
                path.as_ref().display(),
                m.determinant()
            )));
        }
        let rotation = Rotation3::from_matrix(&(m / scale));
        Ok(Similarity {
            rotation,
            translation: Vector3::new(vals[3], vals[7], vals[11]),
            scale,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_similarity_inverse_round_trip() {
        let sim = Similarity {
            rotation: Rotation3::from_euler_angles(0.1, -0.4, 1.2),
            translation: Vector3::new(10.0, -5.0, 3.0),
            scale: 1.7,
        };
        let inv = sim.inverse();
        let x = Vector3::new(100.0, 200.0, -50.0);
        let back = inv.apply(&sim.apply(&x));
        assert!((back - x).norm() < 1e-9);
    }

    #[test]
    fn test_image_box() {
        let b = ImageBox::new(1024, 768);
        assert!(b.contains(&Vector2::new(0.0, 0.0)));
        assert!(b.contains(&Vector2::new(1023.5, 767.5)));
        assert!(!b.contains(&Vector2::new(1024.0, 10.0)));
        assert!(!b.contains(&Vector2::new(-0.1, 10.0)));
        assert!(!b.contains(&Vector2::new(f64::NAN, 10.0)));
    }
}
