//! The control network: tie points, their image observations, and GCPs.
//!
//! Construction triangulates every matched interest-point pair, keeps the
//! points whose rays meet at a sufficient angle, and merges observations of
//! the same feature seen from additional cameras. Ground control points are
//! appended afterwards from `.gcp` text files with their known geocentric
//! positions and per-axis sigmas.

pub mod matches;

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use nalgebra::{Vector2, Vector3};
use tracing::{info, warn};

use crate::camera::BaCamera;
use crate::error::{AdjustError, AdjustResult};
use crate::geodesy::Datum;
use matches::{Ip, read_match_file};

/// One 2D observation of a tie point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub camera: usize,
    pub pixel: Vector2<f64>,
    pub sigma: Vector2<f64>,
}

impl Observation {
    /// Build an observation, coercing a NaN sigma to (1, 1).
    pub fn new(camera: usize, pixel: Vector2<f64>, sigma: Vector2<f64>) -> Self {
        let sigma = if sigma.x.is_nan() || sigma.y.is_nan() {
            Vector2::new(1.0, 1.0)
        } else {
            sigma
        };
        Observation {
            camera,
            pixel,
            sigma,
        }
    }
}

/// Whether a point is a free tie point or an anchored ground control point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointKind {
    Tie,
    Gcp,
}

/// A 3D point with its observations.
///
/// Positions are geocentric Cartesian metres. For GCPs, `sigma` holds the
/// per-axis standard deviations in the order they appear in the `.gcp` file
/// (latitude, longitude, height); the XYZ anchor uses them positionally.
#[derive(Debug, Clone)]
pub struct TiePoint {
    pub position: Vector3<f64>,
    pub sigma: Vector3<f64>,
    pub kind: PointKind,
    pub observations: Vec<Observation>,
}

impl TiePoint {
    pub fn is_gcp(&self) -> bool {
        self.kind == PointKind::Gcp
    }

    /// The observation this point has in a given camera, if any.
    pub fn observation_in(&self, camera: usize) -> Option<&Observation> {
        self.observations.iter().find(|o| o.camera == camera)
    }
}

/// The graph of tie points and their observations across cameras.
#[derive(Debug, Clone, Default)]
pub struct ControlNetwork {
    pub points: Vec<TiePoint>,
}

impl ControlNetwork {
    pub fn num_points(&self) -> usize {
        self.points.len()
    }

    pub fn num_gcp(&self) -> usize {
        self.points.iter().filter(|p| p.is_gcp()).count()
    }

    /// Add a point; rejects the zero-observation case.
    pub fn add_point(&mut self, point: TiePoint) -> AdjustResult<usize> {
        if point.observations.is_empty() {
            return Err(AdjustError::Network(
                "A tie point with zero observations is not added".to_string(),
            ));
        }
        for obs in &point.observations {
            if !obs.sigma.x.is_finite() || obs.sigma.x <= 0.0 || obs.sigma.y <= 0.0 {
                return Err(AdjustError::Network(format!(
                    "Observation sigma must be finite and positive, got {:?}",
                    obs.sigma
                )));
            }
        }
        self.points.push(point);
        Ok(self.points.len() - 1)
    }
}

/// Optional triangulation filters applied while building the network.
#[derive(Debug, Clone, Default)]
pub struct TriangulationFilter {
    /// Keep only points whose height above datum lies in `[min, max]`.
    pub elevation_limit: Option<(f64, f64)>,
    /// Keep only points inside `(lon_min, lat_min, lon_max, lat_max)`.
    pub lon_lat_limit: Option<(f64, f64, f64, f64)>,
}

impl TriangulationFilter {
    fn accepts(&self, xyz: &Vector3<f64>, datum: &Datum) -> bool {
        if self.elevation_limit.is_none() && self.lon_lat_limit.is_none() {
            return true;
        }
        if !datum.is_specified() {
            return true;
        }
        let llh = datum.cartesian_to_geodetic(xyz);
        if let Some((lo, hi)) = self.elevation_limit {
            if llh.z < lo || llh.z > hi {
                return false;
            }
        }
        if let Some((lon0, lat0, lon1, lat1)) = self.lon_lat_limit {
            if llh.x < lon0 || llh.x > lon1 || llh.y < lat0 || llh.y > lat1 {
                return false;
            }
        }
        true
    }
}

/// Midpoint triangulation of two world-frame rays.
///
/// Returns the midpoint of the closest-approach segment and the ray angle in
/// degrees; `None` for near-parallel rays or intersections behind a camera.
pub fn triangulate_rays(
    origin1: &Vector3<f64>,
    dir1: &Vector3<f64>,
    origin2: &Vector3<f64>,
    dir2: &Vector3<f64>,
) -> Option<(Vector3<f64>, f64)> {
    let w = origin1 - origin2;
    let b = dir1.dot(dir2);
    let d = dir1.dot(&w);
    let e = dir2.dot(&w);
    let denom = 1.0 - b * b;
    if denom.abs() < 1e-14 {
        return None;
    }
    let t = (b * e - d) / denom;
    let s = (e - b * d) / denom;
    if t <= 0.0 || s <= 0.0 {
        return None;
    }
    let p1 = origin1 + t * dir1;
    let p2 = origin2 + s * dir2;
    let angle = dir1.dot(dir2).clamp(-1.0, 1.0).acos().to_degrees();
    Some(((p1 + p2) / 2.0, angle))
}

/// Triangulate a point from its observations using the current cameras.
///
/// Averages the midpoints of every observation pair whose rays meet at an
/// angle of at least `min_angle_deg`. Returns `None` (the zero position in
/// the original) when no pair qualifies.
pub fn triangulate_point(
    observations: &[Observation],
    cameras: &[BaCamera],
    min_angle_deg: f64,
) -> Option<Vector3<f64>> {
    let mut sum = Vector3::zeros();
    let mut count = 0usize;
    for (a, obs1) in observations.iter().enumerate() {
        let Some(d1) = cameras[obs1.camera].pixel_to_vector(&obs1.pixel) else {
            continue;
        };
        let o1 = cameras[obs1.camera].center();
        for obs2 in observations.iter().skip(a + 1) {
            let Some(d2) = cameras[obs2.camera].pixel_to_vector(&obs2.pixel) else {
                continue;
            };
            let o2 = cameras[obs2.camera].center();
            if let Some((mid, angle)) = triangulate_rays(&o1, &d1, &o2, &d2) {
                if angle >= min_angle_deg {
                    sum += mid;
                    count += 1;
                }
            }
        }
    }
    if count == 0 { None } else { Some(sum / count as f64) }
}

fn feature_key(camera: usize, ip: &Ip) -> (usize, u64, u64) {
    (camera, ip.x.to_bits(), ip.y.to_bits())
}

/// Build the control network from binary match files.
///
/// Pairs with fewer than `min_matches` interest points are skipped.
/// Observations from additional cameras seeing the same feature are merged
/// by feature identity (camera index and exact pixel).
pub fn build_control_network(
    cameras: &[BaCamera],
    match_files: &BTreeMap<(usize, usize), PathBuf>,
    min_matches: usize,
    min_triangulation_angle: f64,
    filter: &TriangulationFilter,
    datum: &Datum,
) -> AdjustResult<ControlNetwork> {
    let mut key_to_point: HashMap<(usize, u64, u64), usize> = HashMap::new();
    let mut raw_points: Vec<Vec<Observation>> = Vec::new();

    for (&(icam, jcam), path) in match_files {
        let (left, right) = match read_match_file(path) {
            Ok(pair) => pair,
            Err(e) => {
                warn!("Skipping match file {}: {e}", path.display());
                continue;
            }
        };
        if left.len() < min_matches {
            warn!(
                "Skipping pair ({icam}, {jcam}): {} matches below the minimum of {min_matches}",
                left.len()
            );
            continue;
        }

        for (lip, rip) in left.iter().zip(right.iter()) {
            let lobs = Observation::new(
                icam,
                Vector2::new(lip.x, lip.y),
                Vector2::new(lip.sx, lip.sy),
            );
            let robs = Observation::new(
                jcam,
                Vector2::new(rip.x, rip.y),
                Vector2::new(rip.sx, rip.sy),
            );
            let lkey = feature_key(icam, lip);
            let rkey = feature_key(jcam, rip);

            let pid = match (key_to_point.get(&lkey), key_to_point.get(&rkey)) {
                (Some(&p), _) => p,
                (None, Some(&p)) => p,
                (None, None) => {
                    raw_points.push(Vec::new());
                    raw_points.len() - 1
                }
            };
            if raw_points[pid].iter().all(|o| o.camera != icam) {
                raw_points[pid].push(lobs);
            }
            if raw_points[pid].iter().all(|o| o.camera != jcam) {
                raw_points[pid].push(robs);
            }
            key_to_point.insert(lkey, pid);
            key_to_point.insert(rkey, pid);
        }
    }

    let mut cnet = ControlNetwork::default();
    let mut dropped_angle = 0usize;
    let mut dropped_filter = 0usize;
    for observations in raw_points {
        if observations.len() < 2 {
            continue;
        }
        let Some(position) = triangulate_point(&observations, cameras, min_triangulation_angle)
        else {
            dropped_angle += 1;
            continue;
        };
        if !filter.accepts(&position, datum) {
            dropped_filter += 1;
            continue;
        }
        cnet.add_point(TiePoint {
            position,
            sigma: Vector3::new(1.0, 1.0, 1.0),
            kind: PointKind::Tie,
            observations,
        })?;
    }

    info!(
        "Built control network with {} tie points ({} dropped by triangulation angle, {} by filters)",
        cnet.num_points(),
        dropped_angle,
        dropped_filter
    );
    Ok(cnet)
}

/// Append ground control points from `.gcp` text files.
///
/// Each line is `id lat lon height sigma_lat sigma_lon sigma_height`
/// followed by one or more `image x y sigma_x sigma_y` groups. Commas are
/// treated as whitespace. Non-positive sigmas are coerced to 1.
pub fn add_ground_control_points(
    cnet: &mut ControlNetwork,
    image_files: &[PathBuf],
    gcp_files: &[PathBuf],
    datum: &Datum,
) -> AdjustResult<()> {
    if gcp_files.is_empty() {
        return Ok(());
    }
    if !datum.is_specified() {
        return Err(AdjustError::Argument(
            "When ground control points are used, the datum must be specified".to_string(),
        ));
    }

    for gcp_file in gcp_files {
        let text = std::fs::read_to_string(gcp_file)?;
        for (lineno, line) in text.lines().enumerate() {
            let cleaned = line.replace(',', " ");
            let toks: Vec<&str> = cleaned.split_whitespace().collect();
            if toks.is_empty() || toks[0].starts_with('#') {
                continue;
            }
            if toks.len() < 7 || (toks.len() - 7) % 5 != 0 {
                return Err(AdjustError::Io(format!(
                    "Malformed GCP line {} in {}",
                    lineno + 1,
                    gcp_file.display()
                )));
            }
            let lat: f64 = toks[1].parse()?;
            let lon: f64 = toks[2].parse()?;
            let height: f64 = toks[3].parse()?;
            let mut sigma = Vector3::new(
                toks[4].parse::<f64>()?,
                toks[5].parse::<f64>()?,
                toks[6].parse::<f64>()?,
            );
            for s in sigma.iter_mut() {
                if *s <= 0.0 {
                    *s = 1.0;
                }
            }

            let mut observations = Vec::new();
            for group in toks[7..].chunks(5) {
                let name = group[0];
                let Some(camera) = image_files.iter().position(|img| {
                    img.to_string_lossy() == name
                        || img.file_name().map(|f| f.to_string_lossy() == name) == Some(true)
                }) else {
                    warn!(
                        "GCP measure references unknown image {name} ({}:{})",
                        gcp_file.display(),
                        lineno + 1
                    );
                    continue;
                };
                observations.push(Observation::new(
                    camera,
                    Vector2::new(group[1].parse()?, group[2].parse()?),
                    Vector2::new(group[3].parse()?, group[4].parse()?),
                ));
            }
            if observations.is_empty() {
                warn!(
                    "Skipping GCP with no usable image measures ({}:{})",
                    gcp_file.display(),
                    lineno + 1
                );
                continue;
            }

            let position = datum.geodetic_to_cartesian(&Vector3::new(lon, lat, height));
            cnet.add_point(TiePoint {
                position,
                sigma,
                kind: PointKind::Gcp,
                observations,
            })?;
        }
    }

    info!("Loaded {} ground control points", cnet.num_gcp());
    Ok(())
}

/// Save the whole network in the GCP text format so it can be inspected.
pub fn save_cnet_as_csv<P: AsRef<Path>>(
    cnet: &ControlNetwork,
    image_files: &[PathBuf],
    datum: &Datum,
    path: P,
) -> AdjustResult<()> {
    if !datum.is_specified() {
        return Err(AdjustError::Argument(
            "No datum was specified; cannot save control network as csv".to_string(),
        ));
    }
    info!("Writing: {}", path.as_ref().display());

    let mut out = String::new();
    for (count, point) in cnet.points.iter().enumerate() {
        let llh = datum.cartesian_to_geodetic(&point.position);
        // File order is lat lon height.
        let _ = write!(
            out,
            "{count} {:.17} {:.17} {:.17} {} {} {}",
            llh.y, llh.x, llh.z, point.sigma.x, point.sigma.y, point.sigma.z
        );
        for obs in &point.observations {
            let _ = write!(
                out,
                " {} {:.17} {:.17} {} {}",
                image_files[obs.camera].display(),
                obs.pixel.x,
                obs.pixel.y,
                obs.sigma.x,
                obs.sigma.y
            );
        }
        let _ = writeln!(out);
    }
    std::fs::write(path, out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::PinholeCamera;
    use nalgebra::Rotation3;

    fn stereo_cameras() -> Vec<BaCamera> {
        // Two cameras one metre apart looking down +Z.
        let left = PinholeCamera::new(
            Vector3::new(0.0, 0.0, 0.0),
            Rotation3::identity(),
            1000.0,
            Vector2::new(512.0, 512.0),
            &[],
        );
        let right = PinholeCamera::new(
            Vector3::new(1.0, 0.0, 0.0),
            Rotation3::identity(),
            1000.0,
            Vector2::new(512.0, 512.0),
            &[],
        );
        vec![BaCamera::Pinhole(left), BaCamera::Pinhole(right)]
    }

    #[test]
    fn test_triangulate_known_point() {
        let cameras = stereo_cameras();
        let x = Vector3::new(0.3, -0.2, 10.0);
        let obs: Vec<Observation> = (0..2)
            .map(|i| {
                Observation::new(
                    i,
                    cameras[i].project(&x).unwrap(),
                    Vector2::new(1.0, 1.0),
                )
            })
            .collect();
        let tri = triangulate_point(&obs, &cameras, 0.1).unwrap();
        assert!((tri - x).norm() < 1e-6);
    }

    #[test]
    fn test_triangulation_angle_threshold() {
        let cameras = stereo_cameras();
        let x = Vector3::new(0.3, -0.2, 10.0);
        let obs: Vec<Observation> = (0..2)
            .map(|i| {
                Observation::new(
                    i,
                    cameras[i].project(&x).unwrap(),
                    Vector2::new(1.0, 1.0),
                )
            })
            .collect();
        // Baseline 1 m at 10 m depth is about 5.7 degrees.
        assert!(triangulate_point(&obs, &cameras, 45.0).is_none());
    }

    #[test]
    fn test_nan_sigma_coerced() {
        let obs = Observation::new(
            0,
            Vector2::new(10.0, 20.0),
            Vector2::new(f64::NAN, f64::NAN),
        );
        assert_eq!(obs.sigma, Vector2::new(1.0, 1.0));
    }

    #[test]
    fn test_zero_observation_point_rejected() {
        let mut cnet = ControlNetwork::default();
        let err = cnet.add_point(TiePoint {
            position: Vector3::zeros(),
            sigma: Vector3::new(1.0, 1.0, 1.0),
            kind: PointKind::Tie,
            observations: vec![],
        });
        assert!(err.is_err());
    }

    #[test]
    fn test_build_merges_shared_features() {
        use matches::{Ip, write_match_file};

        let cameras = stereo_cameras();
        let x = Vector3::new(0.3, -0.2, 10.0);
        let p0 = cameras[0].project(&x).unwrap();
        let p1 = cameras[1].project(&x).unwrap();

        let dir = std::env::temp_dir().join("apogee_cnet_test");
        std::fs::create_dir_all(&dir).unwrap();
        let m01 = dir.join("a__b.match");
        write_match_file(
            &m01,
            &[Ip::new(p0.x, p0.y)],
            &[Ip::new(p1.x, p1.y)],
        )
        .unwrap();

        let mut match_files = BTreeMap::new();
        match_files.insert((0usize, 1usize), m01);

        let cnet = build_control_network(
            &cameras,
            &match_files,
            1,
            0.1,
            &TriangulationFilter::default(),
            &Datum::default(),
        )
        .unwrap();
        assert_eq!(cnet.num_points(), 1);
        assert_eq!(cnet.points[0].observations.len(), 2);
        assert!((cnet.points[0].position - x).norm() < 1e-6);
    }

    #[test]
    fn test_gcp_parsing() {
        let datum = Datum::well_known("WGS_1984").unwrap();
        let dir = std::env::temp_dir().join("apogee_gcp_test");
        std::fs::create_dir_all(&dir).unwrap();
        let gcp_path = dir.join("points.gcp");
        std::fs::write(
            &gcp_path,
            "0 37.5 -122.2 100.0 1e-5 1e-5 1.0 left.tif 100.5 200.5 1 1 right.tif 110.5 210.5 1 1\n",
        )
        .unwrap();

        let mut cnet = ControlNetwork::default();
        add_ground_control_points(
            &mut cnet,
            &[PathBuf::from("left.tif"), PathBuf::from("right.tif")],
            &[gcp_path],
            &datum,
        )
        .unwrap();
        assert_eq!(cnet.num_gcp(), 1);
        let gcp = &cnet.points[0];
        assert_eq!(gcp.observations.len(), 2);
        let llh = datum.cartesian_to_geodetic(&gcp.position);
        assert!((llh.x - -122.2).abs() < 1e-9);
        assert!((llh.y - 37.5).abs() < 1e-9);
        assert!((llh.z - 100.0).abs() < 1e-6);
    }
}
