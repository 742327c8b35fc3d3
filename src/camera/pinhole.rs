//! Pinhole camera model with radial distortion and `.tsai` serialisation.
//!
//! The intrinsic layout is `[f, cx, cy, k1, k2, ...]`: one focal length,
//! two optical-centre coordinates, and however many distortion coefficients
//! the model carries. Intrinsics are shared across all pinhole cameras in a
//! run; the solver optimises multiplicative scales on them, so the final
//! value of an intrinsic is `initial * scale`. An intrinsic that starts at
//! exactly zero therefore stays at zero no matter what scale the solver
//! finds.

use std::fmt::Write as _;
use std::path::Path;

use nalgebra::{Matrix3, Rotation3, Vector2, Vector3};

use crate::camera::{CAMERA_PARAMS_N, SensorModel, Similarity};
use crate::error::{AdjustError, AdjustResult};

/// Number of focal-length intrinsics.
pub const FOCAL_PARAMS_N: usize = 1;
/// Number of optical-centre intrinsics.
pub const CENTER_PARAMS_N: usize = 2;

/// A pinhole camera: world-frame centre, world-to-camera rotation, and
/// intrinsics `[f, cx, cy, distortion...]`.
#[derive(Debug, Clone, PartialEq)]
pub struct PinholeCamera {
    center: Vector3<f64>,
    rotation: Rotation3<f64>,
    intrinsics: Vec<f64>,
}

impl PinholeCamera {
    pub fn new(
        center: Vector3<f64>,
        rotation: Rotation3<f64>,
        focal_length: f64,
        optical_center: Vector2<f64>,
        distortion: &[f64],
    ) -> Self {
        let mut intrinsics = vec![focal_length, optical_center.x, optical_center.y];
        intrinsics.extend_from_slice(distortion);
        PinholeCamera {
            center,
            rotation,
            intrinsics,
        }
    }

    pub fn focal_length(&self) -> f64 {
        self.intrinsics[0]
    }

    pub fn optical_center(&self) -> Vector2<f64> {
        Vector2::new(self.intrinsics[1], self.intrinsics[2])
    }

    pub fn distortion(&self) -> &[f64] {
        &self.intrinsics[FOCAL_PARAMS_N + CENTER_PARAMS_N..]
    }

    pub fn num_distortion_params(&self) -> usize {
        self.intrinsics.len() - FOCAL_PARAMS_N - CENTER_PARAMS_N
    }

    /// Full intrinsic vector `[f, cx, cy, distortion...]`.
    pub fn intrinsics(&self) -> &[f64] {
        &self.intrinsics
    }

    pub fn set_intrinsics(&mut self, intrinsics: &[f64]) {
        assert!(intrinsics.len() >= FOCAL_PARAMS_N + CENTER_PARAMS_N);
        self.intrinsics = intrinsics.to_vec();
    }

    /// Extrinsics in the stable `[position, axis-angle]` layout.
    pub fn extrinsic_params(&self) -> [f64; CAMERA_PARAMS_N] {
        let aa = self.rotation.scaled_axis();
        [
            self.center.x,
            self.center.y,
            self.center.z,
            aa.x,
            aa.y,
            aa.z,
        ]
    }

    pub fn set_extrinsic_params(&mut self, params: &[f64]) {
        assert!(params.len() >= CAMERA_PARAMS_N);
        self.center = Vector3::new(params[0], params[1], params[2]);
        self.rotation = Rotation3::new(Vector3::new(params[3], params[4], params[5]));
    }

    /// Apply a world-frame similarity: the centre maps to `s*R*c + t` and
    /// the world-to-camera rotation composes with the inverse rotation so
    /// viewing rays keep hitting the same (transformed) scene.
    pub fn apply_transform(&mut self, sim: &Similarity) {
        self.center = sim.apply(&self.center);
        self.rotation = self.rotation * sim.rotation.inverse();
    }

    /// Write a `.tsai` camera file.
    pub fn write_tsai<P: AsRef<Path>>(&self, path: P) -> AdjustResult<()> {
        let f = self.focal_length();
        let c = self.optical_center();
        let r = self.rotation.matrix();
        let mut out = String::new();
        let _ = writeln!(out, "VERSION_4");
        let _ = writeln!(out, "PINHOLE");
        let _ = writeln!(out, "fu = {f:.17}");
        let _ = writeln!(out, "fv = {f:.17}");
        let _ = writeln!(out, "cu = {:.17}", c.x);
        let _ = writeln!(out, "cv = {:.17}", c.y);
        let _ = writeln!(out, "u_direction = 1 0 0");
        let _ = writeln!(out, "v_direction = 0 1 0");
        let _ = writeln!(out, "w_direction = 0 0 1");
        let _ = writeln!(
            out,
            "C = {:.17} {:.17} {:.17}",
            self.center.x, self.center.y, self.center.z
        );
        let _ = write!(out, "R =");
        for i in 0..3 {
            for j in 0..3 {
                let _ = write!(out, " {:.17}", r[(i, j)]);
            }
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "TSAI");
        for (i, k) in self.distortion().iter().enumerate() {
            let _ = writeln!(out, "k{} = {k:.17}", i + 1);
        }
        std::fs::write(path, out)?;
        Ok(())
    }

    /// Read a `.tsai` camera file written by [`PinholeCamera::write_tsai`].
    pub fn read_tsai<P: AsRef<Path>>(path: P) -> AdjustResult<Self> {
        let text = std::fs::read_to_string(&path)?;
        let mut f = None;
        let mut cu = None;
        let mut cv = None;
        let mut center = None;
        let mut rot = None;
        let mut distortion = Vec::new();

        for line in text.lines() {
            let Some((key, rest)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let vals: Vec<f64> = rest
                .split_whitespace()
                .map(|t| t.parse::<f64>())
                .collect::<Result<_, _>>()?;
            match key {
                "fu" => f = vals.first().copied(),
                "cu" => cu = vals.first().copied(),
                "cv" => cv = vals.first().copied(),
                "C" if vals.len() == 3 => center = Some(Vector3::new(vals[0], vals[1], vals[2])),
                "R" if vals.len() == 9 => {
                    rot = Some(Matrix3::new(
                        vals[0], vals[1], vals[2], vals[3], vals[4], vals[5], vals[6], vals[7],
                        vals[8],
                    ))
                }
                k if k.starts_with('k') => distortion.extend(vals),
                _ => {}
            }
        }

        let (Some(f), Some(cu), Some(cv), Some(center), Some(rot)) = (f, cu, cv, center, rot)
        else {
            return Err(AdjustError::Io(format!(
                "Incomplete .tsai camera file: {}",
                path.as_ref().display()
            )));
        };
        Ok(PinholeCamera::new(
            center,
            Rotation3::from_matrix(&rot),
            f,
            Vector2::new(cu, cv),
            &distortion,
        ))
    }
}

impl SensorModel for PinholeCamera {
    fn project(&self, xyz: &Vector3<f64>) -> Option<Vector2<f64>> {
        let params = self.extrinsic_params();
        project_pinhole(&params, &self.intrinsics, xyz)
    }

    fn pixel_to_vector(&self, pix: &Vector2<f64>) -> Option<Vector3<f64>> {
        let f = self.focal_length();
        if f.abs() < 1e-12 || !pix.x.is_finite() || !pix.y.is_finite() {
            return None;
        }
        let c = self.optical_center();
        let xn0 = (pix.x - c.x) / f;
        let yn0 = (pix.y - c.y) / f;

        // Fixed-point undistortion; converges fast for mild radial terms.
        let mut xn = xn0;
        let mut yn = yn0;
        for _ in 0..5 {
            let r2 = xn * xn + yn * yn;
            let mut radial = 1.0;
            let mut r_pow = r2;
            for &k in self.distortion() {
                radial += k * r_pow;
                r_pow *= r2;
            }
            if radial.abs() < 1e-12 {
                return None;
            }
            xn = xn0 / radial;
            yn = yn0 / radial;
        }

        let dir_cam = Vector3::new(xn, yn, 1.0).normalize();
        Some(self.rotation.inverse() * dir_cam)
    }

    fn center(&self) -> Vector3<f64> {
        self.center
    }

    fn pose(&self) -> Rotation3<f64> {
        self.rotation
    }
}

/// Project through a pinhole model given raw parameter slices.
///
/// `extrinsics` is `[position (3), axis-angle (3)]` and `intrinsics` is
/// `[f, cx, cy, distortion...]`. This is the residual-evaluation hot path;
/// it builds no camera object.
pub fn project_pinhole(
    extrinsics: &[f64],
    intrinsics: &[f64],
    xyz: &Vector3<f64>,
) -> Option<Vector2<f64>> {
    let center = Vector3::new(extrinsics[0], extrinsics[1], extrinsics[2]);
    let rotation = Rotation3::new(Vector3::new(extrinsics[3], extrinsics[4], extrinsics[5]));
    let p_cam = rotation * (xyz - center);

    if p_cam.z <= 1e-12 {
        return None; // behind the camera
    }
    let xn = p_cam.x / p_cam.z;
    let yn = p_cam.y / p_cam.z;

    let r2 = xn * xn + yn * yn;
    let mut radial = 1.0;
    let mut r_pow = r2;
    for &k in &intrinsics[FOCAL_PARAMS_N + CENTER_PARAMS_N..] {
        radial += k * r_pow;
        r_pow *= r2;
    }

    let f = intrinsics[0];
    let pix = Vector2::new(
        f * xn * radial + intrinsics[1],
        f * yn * radial + intrinsics[2],
    );
    if pix.x.is_finite() && pix.y.is_finite() {
        Some(pix)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_camera() -> PinholeCamera {
        PinholeCamera::new(
            Vector3::new(0.0, 0.0, 0.0),
            Rotation3::identity(),
            1000.0,
            Vector2::new(512.0, 512.0),
            &[],
        )
    }

    #[test]
    fn test_project_on_axis() {
        let cam = test_camera();
        let pix = cam.project(&Vector3::new(0.0, 0.0, 10.0)).unwrap();
        assert!((pix - Vector2::new(512.0, 512.0)).norm() < 1e-12);
    }

    #[test]
    fn test_project_off_axis() {
        let cam = test_camera();
        let pix = cam.project(&Vector3::new(1.0, -2.0, 10.0)).unwrap();
        assert!((pix - Vector2::new(612.0, 312.0)).norm() < 1e-12);
    }

    #[test]
    fn test_behind_camera_fails() {
        let cam = test_camera();
        assert!(cam.project(&Vector3::new(0.0, 0.0, -1.0)).is_none());
    }

    #[test]
    fn test_distortion_pushes_outward() {
        let mut cam = test_camera();
        cam.set_intrinsics(&[1000.0, 512.0, 512.0, 0.1]);
        let undistorted = test_camera()
            .project(&Vector3::new(1.0, 0.0, 10.0))
            .unwrap();
        let distorted = cam.project(&Vector3::new(1.0, 0.0, 10.0)).unwrap();
        assert!(distorted.x > undistorted.x);
    }

    #[test]
    fn test_apply_transform_keeps_projection() {
        // Transforming the camera and the scene by the same similarity must
        // leave pixels unchanged.
        let mut cam = PinholeCamera::new(
            Vector3::new(5.0, -3.0, 2.0),
            Rotation3::from_euler_angles(0.1, 0.2, -0.3),
            1000.0,
            Vector2::new(512.0, 512.0),
            &[0.01, -0.001],
        );
        let sim = Similarity {
            rotation: Rotation3::from_euler_angles(0.3, -0.1, 0.8),
            translation: Vector3::new(100.0, 50.0, -20.0),
            scale: 1.3,
        };
        let x = Vector3::new(6.0, -2.0, 12.0);
        let before = cam.project(&x).unwrap();
        cam.apply_transform(&sim);
        let after = cam.project(&sim.apply(&x)).unwrap();
        assert!((before - after).norm() < 1e-9);
    }

    #[test]
    fn test_extrinsic_round_trip() {
        let cam = PinholeCamera::new(
            Vector3::new(1.0, 2.0, 3.0),
            Rotation3::from_euler_angles(0.4, -0.2, 0.9),
            800.0,
            Vector2::new(400.0, 300.0),
            &[],
        );
        let params = cam.extrinsic_params();
        let mut other = test_camera();
        other.set_extrinsic_params(&params);
        assert!((other.center() - cam.center()).norm() < 1e-12);
        assert!((other.pose().matrix() - cam.pose().matrix()).norm() < 1e-12);
    }

    #[test]
    fn test_tsai_round_trip() {
        let cam = PinholeCamera::new(
            Vector3::new(1.0e6, -2.0e6, 3.0e6),
            Rotation3::from_euler_angles(0.4, -0.2, 0.9),
            800.5,
            Vector2::new(400.25, 300.75),
            &[0.01, -0.002],
        );
        let dir = std::env::temp_dir().join("apogee_tsai_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("cam.tsai");
        cam.write_tsai(&path).unwrap();
        let back = PinholeCamera::read_tsai(&path).unwrap();
        assert!((back.center() - cam.center()).norm() < 1e-6);
        assert!((back.focal_length() - cam.focal_length()).abs() < 1e-9);
        assert_eq!(back.distortion().len(), 2);
    }
}
