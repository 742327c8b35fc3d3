//! The generic adjustable camera: a rigid delta on top of a base sensor.
//!
//! The base projection stays immutable; the adjustment rotates the camera
//! about its own centre by an axis-angle delta and shifts it by a
//! translation. Both start at zero so an unadjusted camera projects exactly
//! like its base. The `.adjust` file holds the two 3-vectors, one per line.

use std::path::Path;
use std::sync::Arc;

use nalgebra::{Rotation3, Vector2, Vector3};

use crate::camera::{CAMERA_PARAMS_N, SensorModel};
use crate::error::{AdjustError, AdjustResult};

/// A base sensor with a (translation, axis-angle) adjustment composed on top.
#[derive(Clone)]
pub struct AdjustedCamera {
    base: Arc<dyn SensorModel>,
    translation: Vector3<f64>,
    axis_angle: Vector3<f64>,
}

impl AdjustedCamera {
    pub fn new(base: Arc<dyn SensorModel>) -> Self {
        AdjustedCamera {
            base,
            translation: Vector3::zeros(),
            axis_angle: Vector3::zeros(),
        }
    }

    pub fn base(&self) -> &Arc<dyn SensorModel> {
        &self.base
    }

    /// The adjustment as a flat parameter vector `[translation, axis-angle]`.
    pub fn delta_params(&self) -> [f64; CAMERA_PARAMS_N] {
        [
            self.translation.x,
            self.translation.y,
            self.translation.z,
            self.axis_angle.x,
            self.axis_angle.y,
            self.axis_angle.z,
        ]
    }

    pub fn set_delta_params(&mut self, params: &[f64]) {
        assert!(params.len() >= CAMERA_PARAMS_N);
        self.translation = Vector3::new(params[0], params[1], params[2]);
        self.axis_angle = Vector3::new(params[3], params[4], params[5]);
    }

    /// Write the adjustment to a `.adjust` text file.
    pub fn write_adjust<P: AsRef<Path>>(&self, path: P) -> AdjustResult<()> {
        let out = format!(
            "{:.17} {:.17} {:.17}\n{:.17} {:.17} {:.17}\n",
            self.translation.x,
            self.translation.y,
            self.translation.z,
            self.axis_angle.x,
            self.axis_angle.y,
            self.axis_angle.z
        );
        std::fs::write(path, out)?;
        Ok(())
    }

    /// Read an adjustment from a `.adjust` text file into this camera.
    pub fn read_adjust<P: AsRef<Path>>(&mut self, path: P) -> AdjustResult<()> {
        let text = std::fs::read_to_string(&path)?;
        let vals: Vec<f64> = text
            .split_whitespace()
            .map(|t| t.parse::<f64>())
            .collect::<Result<_, _>>()?;
        if vals.len() != CAMERA_PARAMS_N {
            return Err(AdjustError::Io(format!(
                "Expected {} adjustment values in {}, got {}",
                CAMERA_PARAMS_N,
                path.as_ref().display(),
                vals.len()
            )));
        }
        self.set_delta_params(&vals);
        Ok(())
    }

    /// Compose a world-frame similarity into the adjustment, keeping the
    /// base sensor untouched. The adjusted centre maps to
    /// `s*R*(c0 + t) + T` and the delta rotation picks up `R`.
    pub fn apply_transform(&mut self, sim: &crate::camera::Similarity) {
        let c0 = self.base.center();
        let new_center = sim.apply(&(c0 + self.translation));
        self.translation = new_center - c0;
        let delta = sim.rotation * Rotation3::new(self.axis_angle);
        self.axis_angle = delta.scaled_axis();
    }

    /// World point as seen by the adjusted camera, expressed in the base
    /// camera's original frame.
    fn unadjust_point(&self, xyz: &Vector3<f64>) -> Vector3<f64> {
        let c0 = self.base.center();
        let delta_rot = Rotation3::new(self.axis_angle);
        delta_rot.inverse() * (xyz - c0 - self.translation) + c0
    }
}

impl SensorModel for AdjustedCamera {
    fn project(&self, xyz: &Vector3<f64>) -> Option<Vector2<f64>> {
        self.base.project(&self.unadjust_point(xyz))
    }

    fn pixel_to_vector(&self, pix: &Vector2<f64>) -> Option<Vector3<f64>> {
        // A ray the base camera sees along d leaves the adjusted camera
        // rotated by the delta.
        let d0 = self.base.pixel_to_vector(pix)?;
        Some(Rotation3::new(self.axis_angle) * d0)
    }

    fn center(&self) -> Vector3<f64> {
        self.base.center() + self.translation
    }

    fn pose(&self) -> Rotation3<f64> {
        self.base.pose() * Rotation3::new(self.axis_angle).inverse()
    }
}

/// Project through an adjusted camera given a raw delta-parameter slice.
pub fn project_adjusted(
    base: &Arc<dyn SensorModel>,
    delta: &[f64],
    xyz: &Vector3<f64>,
) -> Option<Vector2<f64>> {
    let c0 = base.center();
    let translation = Vector3::new(delta[0], delta[1], delta[2]);
    let delta_rot = Rotation3::new(Vector3::new(delta[3], delta[4], delta[5]));
    base.project(&(delta_rot.inverse() * (xyz - c0 - translation) + c0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::PinholeCamera;

    fn base_camera() -> Arc<dyn SensorModel> {
        Arc::new(PinholeCamera::new(
            Vector3::new(0.0, 0.0, 0.0),
            Rotation3::identity(),
            1000.0,
            Vector2::new(512.0, 512.0),
            &[],
        ))
    }

    #[test]
    fn test_zero_delta_matches_base() {
        let base = base_camera();
        let adjusted = AdjustedCamera::new(base.clone());
        let x = Vector3::new(0.5, -0.25, 10.0);
        assert_eq!(adjusted.project(&x), base.project(&x));
    }

    #[test]
    fn test_translation_shifts_center() {
        let mut adjusted = AdjustedCamera::new(base_camera());
        adjusted.set_delta_params(&[1.0, 2.0, 3.0, 0.0, 0.0, 0.0]);
        assert!((adjusted.center() - Vector3::new(1.0, 2.0, 3.0)).norm() < 1e-12);
        // A translated camera sees a translated world identically.
        let x = Vector3::new(0.5, -0.25, 10.0);
        let shifted = x + Vector3::new(1.0, 2.0, 3.0);
        assert!(
            (adjusted.project(&shifted).unwrap() - base_camera().project(&x).unwrap()).norm()
                < 1e-9
        );
    }

    #[test]
    fn test_adjust_file_round_trip() {
        let mut adjusted = AdjustedCamera::new(base_camera());
        adjusted.set_delta_params(&[0.1, -0.2, 0.3, 0.01, 0.02, -0.03]);
        let dir = std::env::temp_dir().join("apogee_adjust_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("cam.adjust");
        adjusted.write_adjust(&path).unwrap();

        let mut other = AdjustedCamera::new(base_camera());
        other.read_adjust(&path).unwrap();
        let a = adjusted.delta_params();
        let b = other.delta_params();
        for i in 0..CAMERA_PARAMS_N {
            assert!((a[i] - b[i]).abs() < 1e-15);
        }
    }
}
