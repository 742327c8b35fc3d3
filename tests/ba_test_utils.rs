//! Shared helpers for the bundle adjustment integration tests.

#![allow(dead_code)]

use std::path::PathBuf;

use nalgebra::{Rotation3, Vector2, Vector3};

use apogee_adjust::camera::pinhole::PinholeCamera;
use apogee_adjust::camera::BaCamera;
use apogee_adjust::cnet::{ControlNetwork, Observation, PointKind, TiePoint};

/// Deterministic pseudo-random stream in [-1, 1].
pub struct TestRng {
    state: u64,
}

impl TestRng {
    pub fn new(seed: u64) -> Self {
        TestRng {
            state: seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407),
        }
    }

    pub fn next(&mut self) -> f64 {
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        ((self.state >> 11) as f64 / (1u64 << 53) as f64) * 2.0 - 1.0
    }
}

/// A pinhole camera at `center` looking down +Z with f = 1000, c = (512, 512).
pub fn test_camera(center: Vector3<f64>) -> PinholeCamera {
    PinholeCamera::new(
        center,
        Rotation3::identity(),
        1000.0,
        Vector2::new(512.0, 512.0),
        &[],
    )
}

/// Scene points in front of the cameras: xy within ±2 m, depth 8-12 m.
pub fn generate_scene_points(n: usize, seed: u64) -> Vec<Vector3<f64>> {
    let mut rng = TestRng::new(seed);
    (0..n)
        .map(|_| {
            Vector3::new(
                2.0 * rng.next(),
                2.0 * rng.next(),
                10.0 + 2.0 * rng.next(),
            )
        })
        .collect()
}

/// Build a control network where every point is observed by every camera.
/// Points whose projection fails in any camera are skipped.
pub fn build_network(
    cameras: &[BaCamera],
    points: &[Vector3<f64>],
    gcp_indices: &[usize],
) -> ControlNetwork {
    let mut cnet = ControlNetwork::default();
    for (ipt, point) in points.iter().enumerate() {
        let mut observations = Vec::new();
        for (icam, camera) in cameras.iter().enumerate() {
            let Some(pixel) = camera.project(point) else {
                observations.clear();
                break;
            };
            observations.push(Observation::new(icam, pixel, Vector2::new(1.0, 1.0)));
        }
        if observations.is_empty() {
            continue;
        }
        let kind = if gcp_indices.contains(&ipt) {
            PointKind::Gcp
        } else {
            PointKind::Tie
        };
        cnet.add_point(TiePoint {
            position: *point,
            sigma: Vector3::new(1.0, 1.0, 1.0),
            kind,
            observations,
        })
        .expect("network point");
    }
    cnet
}

/// A unique output prefix under the temp directory.
pub fn temp_prefix(name: &str) -> String {
    let dir = std::env::temp_dir().join(format!("apogee_it_{name}"));
    std::fs::create_dir_all(&dir).expect("temp dir");
    dir.join("run").to_string_lossy().into_owned()
}

/// Image and camera file name lists for the run config.
pub fn fake_file_lists(n: usize) -> (Vec<PathBuf>, Vec<PathBuf>) {
    let images = (0..n).map(|i| PathBuf::from(format!("image_{i}.tif"))).collect();
    let cams = (0..n).map(|i| PathBuf::from(format!("camera_{i}.tsai"))).collect();
    (images, cams)
}
