//! Rigid initial alignment of cameras to an external geodetic frame.
//!
//! Pinhole cameras built from arbitrary local frames must be brought into
//! the datum frame before optimisation. Two sources drive the fit: known
//! camera positions from a CSV file, or triangulated GCPs. Both reduce to a
//! closed-form least-squares 3D similarity (Umeyama) between two point
//! sets, applied to every camera and every non-GCP tie point.

use std::path::{Path, PathBuf};

use nalgebra::{Matrix3, Rotation3, Vector3};
use tracing::{info, warn};

use crate::camera::{BaCamera, Similarity};
use crate::cnet::{ControlNetwork, triangulate_point};
use crate::error::{AdjustError, AdjustResult};
use crate::geodesy::Datum;

const MIN_NUM_MATCHES: usize = 3;

/// Closed-form least-squares similarity (scale, rotation, translation)
/// mapping `src` onto `dst`.
pub fn umeyama_alignment(src: &[Vector3<f64>], dst: &[Vector3<f64>]) -> AdjustResult<Similarity> {
    if src.len() != dst.len() {
        return Err(AdjustError::Logic(
            "Source and destination point sets differ in length".to_string(),
        ));
    }
    if src.len() < MIN_NUM_MATCHES {
        return Err(AdjustError::Network(format!(
            "At least {MIN_NUM_MATCHES} point pairs are required for a similarity fit"
        )));
    }
    let n = src.len() as f64;

    let mu_src: Vector3<f64> = src.iter().sum::<Vector3<f64>>() / n;
    let mu_dst: Vector3<f64> = dst.iter().sum::<Vector3<f64>>() / n;

    let mut sigma2_src = 0.0;
    let mut cov = Matrix3::zeros();
    for (s, d) in src.iter().zip(dst.iter()) {
        let sc = s - mu_src;
        let dc = d - mu_dst;
        sigma2_src += sc.norm_squared();
        cov += dc * sc.transpose();
    }
    sigma2_src /= n;
    cov /= n;
    if sigma2_src < 1e-30 {
        return Err(AdjustError::Network(
            "Degenerate point set: zero spread in the source points".to_string(),
        ));
    }

    let svd = cov.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Err(AdjustError::Solver(
            "SVD failed while fitting the similarity transform".to_string(),
        ));
    };
    // Reflection correction keeps the result in SO(3).
    let mut s_diag = Vector3::new(1.0, 1.0, 1.0);
    if (u.determinant() * v_t.determinant()) < 0.0 {
        s_diag.z = -1.0;
    }
    let rotation_matrix = u * Matrix3::from_diagonal(&s_diag) * v_t;
    let scale = svd.singular_values.dot(&s_diag) / sigma2_src;
    if !scale.is_finite() || scale <= 0.0 {
        return Err(AdjustError::Solver(format!(
            "Similarity fit produced a non-positive scale: {scale}"
        )));
    }
    let rotation = Rotation3::from_matrix_unchecked(rotation_matrix);
    let translation = mu_dst - scale * (rotation * mu_src);

    Ok(Similarity {
        rotation,
        translation,
        scale,
    })
}

/// Apply a similarity to every camera and every non-GCP tie point.
pub fn apply_rigid_transform(
    cameras: &mut [BaCamera],
    cnet: &mut ControlNetwork,
    sim: &Similarity,
) {
    for camera in cameras.iter_mut() {
        match camera {
            BaCamera::Pinhole(cam) => cam.apply_transform(sim),
            BaCamera::Adjusted(cam) => cam.apply_transform(sim),
        }
    }
    for point in cnet.points.iter_mut() {
        if point.is_gcp() {
            continue; // ground control stays in the datum frame
        }
        point.position = sim.apply(&point.position);
    }
}

/// Which columns of a camera-position CSV hold which fields.
///
/// Parsed from strings like `"1:file 2:lat 3:lon 4:height_above_datum"` or
/// `"1:file 2:x 3:y 4:z"`; column numbers are 1-based.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CsvFormat {
    pub file: Option<usize>,
    pub lat: Option<usize>,
    pub lon: Option<usize>,
    pub height: Option<usize>,
    pub x: Option<usize>,
    pub y: Option<usize>,
    pub z: Option<usize>,
}

impl CsvFormat {
    pub fn parse(text: &str) -> AdjustResult<Self> {
        let mut format = CsvFormat::default();
        for tok in text.split_whitespace() {
            let Some((col, name)) = tok.split_once(':') else {
                return Err(AdjustError::Argument(format!(
                    "Malformed csv-format entry: {tok}"
                )));
            };
            let col: usize = col.parse().map_err(|_| {
                AdjustError::Argument(format!("Malformed csv-format column: {tok}"))
            })?;
            if col == 0 {
                return Err(AdjustError::Argument(
                    "csv-format columns are 1-based".to_string(),
                ));
            }
            let slot = match name {
                "file" => &mut format.file,
                "lat" => &mut format.lat,
                "lon" => &mut format.lon,
                "height_above_datum" => &mut format.height,
                "x" => &mut format.x,
                "y" => &mut format.y,
                "z" => &mut format.z,
                other => {
                    return Err(AdjustError::Argument(format!(
                        "Unknown csv-format field: {other}"
                    )));
                }
            };
            *slot = Some(col - 1);
        }
        if format.file.is_none() {
            return Err(AdjustError::Argument(
                "csv-format must name a file column".to_string(),
            ));
        }
        let llh = format.lat.is_some() && format.lon.is_some() && format.height.is_some();
        let xyz = format.x.is_some() && format.y.is_some() && format.z.is_some();
        if !llh && !xyz {
            return Err(AdjustError::Argument(
                "csv-format must name either lat/lon/height_above_datum or x/y/z columns"
                    .to_string(),
            ));
        }
        Ok(format)
    }

    /// Convert one CSV record to a geocentric position.
    pub fn record_to_cartesian(
        &self,
        record: &csv::StringRecord,
        datum: &Datum,
    ) -> AdjustResult<Vector3<f64>> {
        let get = |col: Option<usize>| -> AdjustResult<f64> {
            let col = col.ok_or_else(|| {
                AdjustError::Logic("csv-format column missing after validation".to_string())
            })?;
            let field = record.get(col).ok_or_else(|| {
                AdjustError::Io(format!("CSV record has no column {}", col + 1))
            })?;
            Ok(field.trim().parse::<f64>()?)
        };
        if self.x.is_some() {
            Ok(Vector3::new(get(self.x)?, get(self.y)?, get(self.z)?))
        } else {
            let llh = Vector3::new(get(self.lon)?, get(self.lat)?, get(self.height)?);
            Ok(datum.geodetic_to_cartesian(&llh))
        }
    }
}

/// Look up an estimated geocentric position for each input camera.
///
/// A CSV record matches an image when its `file` field is a substring of
/// the image path. Cameras with no match get the zero vector.
pub fn load_estimated_camera_positions<P: AsRef<Path>>(
    path: P,
    format: &CsvFormat,
    datum: &Datum,
    image_files: &[PathBuf],
) -> AdjustResult<Vec<Vector3<f64>>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .comment(Some(b'#'))
        .from_path(path.as_ref())?;

    let mut records: Vec<(String, Vector3<f64>)> = Vec::new();
    for record in reader.records() {
        let record = record?;
        let Some(file_col) = format.file else {
            return Err(AdjustError::Logic(
                "csv-format column missing after validation".to_string(),
            ));
        };
        let Some(file_field) = record.get(file_col) else {
            continue;
        };
        let position = format.record_to_cartesian(&record, datum)?;
        records.push((file_field.to_string(), position));
    }

    let mut estimated = Vec::with_capacity(image_files.len());
    for image in image_files {
        let image_name = image.to_string_lossy();
        let hit = records
            .iter()
            .find(|(field, _)| !field.is_empty() && image_name.contains(field.as_str()));
        match hit {
            Some((_, position)) => estimated.push(*position),
            None => {
                warn!(
                    "Camera file {} not found in camera position file.",
                    image.display()
                );
                estimated.push(Vector3::zeros());
            }
        }
    }
    Ok(estimated)
}

/// Initialise pinhole cameras from estimated camera positions.
///
/// Fits a similarity from the current camera centres to the CSV positions
/// and applies it to every camera and non-GCP tie point.
pub fn init_cameras_from_positions(
    cameras: &mut [BaCamera],
    cnet: &mut ControlNetwork,
    estimated: &[Vector3<f64>],
) -> AdjustResult<Similarity> {
    info!("Initializing camera positions from input file...");
    if estimated.len() != cameras.len() {
        return Err(AdjustError::Logic(
            "Expected one estimated position per camera".to_string(),
        ));
    }
    info!("Num cameras: {}", cameras.len());

    let mut src = Vec::new();
    let mut dst = Vec::new();
    for (camera, est) in cameras.iter().zip(estimated.iter()) {
        if *est == Vector3::zeros() {
            continue;
        }
        src.push(camera.center());
        dst.push(*est);
    }
    info!("Number of matches found: {}", src.len());
    if src.len() < MIN_NUM_MATCHES {
        return Err(AdjustError::Network(format!(
            "At least {MIN_NUM_MATCHES} camera position matches are required to initialize sensor models"
        )));
    }

    let sim = umeyama_alignment(&src, &dst)?;
    apply_rigid_transform(cameras, cnet, &sim);
    Ok(sim)
}

/// Initialise pinhole cameras from GCP triangulations.
///
/// Each GCP is triangulated with the current cameras; those failing to
/// triangulate are rejected. The similarity maps the triangulated positions
/// onto the known GCP positions.
pub fn init_cameras_from_gcp(
    cameras: &mut [BaCamera],
    cnet: &mut ControlNetwork,
) -> AdjustResult<Similarity> {
    info!("Initializing camera positions from ground control points...");

    let mut src = Vec::new();
    let mut dst = Vec::new();
    let mut num_gcp = 0usize;
    for point in cnet.points.iter().filter(|p| p.is_gcp()) {
        num_gcp += 1;
        // A big minimum angle here could throw away valid points.
        let Some(triangulated) = triangulate_point(&point.observations, cameras, 0.0) else {
            info!("Discarding GCP that fails to triangulate");
            continue;
        };
        if triangulated == Vector3::zeros() || point.position == Vector3::zeros() {
            continue;
        }
        src.push(triangulated);
        dst.push(point.position);
    }
    if src.len() < MIN_NUM_MATCHES {
        info!("Num GCP       = {num_gcp}");
        info!("Num valid GCP = {}", src.len());
        return Err(AdjustError::Network(
            "Not enough valid GCPs for affine initalization".to_string(),
        ));
    }

    let sim = umeyama_alignment(&src, &dst)?;
    apply_rigid_transform(cameras, cnet, &sim);
    Ok(sim)
}

/// Warn when the GCPs sit far from the triangulated tie points; the usual
/// cause is swapped lat/lon columns in the GCP file.
pub fn check_gcp_dists(cameras: &[BaCamera], cnet: &ControlNetwork) {
    let mut gcp_sum = Vector3::zeros();
    let mut gcp_count = 0.0;
    let mut ip_sum = Vector3::zeros();
    let mut ip_count = 0.0;
    for point in &cnet.points {
        if point.is_gcp() {
            gcp_sum += point.position;
            gcp_count += 1.0;
        } else if let Some(triangulated) = triangulate_point(&point.observations, cameras, 0.0) {
            ip_sum += triangulated;
            ip_count += 1.0;
        }
    }
    if gcp_count == 0.0 || ip_count == 0.0 {
        return;
    }
    let dist = (ip_sum / ip_count - gcp_sum / gcp_count).norm();
    if dist > 100_000.0 {
        warn!(
            "GCPs are over 100 KM from the other points. Are your lat/lon GCP coordinates swapped?"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_sim() -> Similarity {
        Similarity {
            rotation: Rotation3::from_euler_angles(0.2, -0.5, 1.1),
            translation: Vector3::new(10.0, -20.0, 5.0),
            scale: 1.1,
        }
    }

    #[test]
    fn test_umeyama_recovers_similarity() {
        let sim = make_sim();
        let src: Vec<Vector3<f64>> = vec![
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(1.0, 2.0, 3.0),
        ];
        let dst: Vec<Vector3<f64>> = src.iter().map(|p| sim.apply(p)).collect();
        let fit = umeyama_alignment(&src, &dst).unwrap();
        assert!((fit.scale - sim.scale).abs() < 1e-9);
        assert!((fit.translation - sim.translation).norm() < 1e-8);
        assert!(
            (fit.rotation.matrix() - sim.rotation.matrix()).norm() < 1e-9,
            "rotation mismatch"
        );
    }

    #[test]
    fn test_umeyama_requires_three_points() {
        let src = vec![Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0)];
        let dst = src.clone();
        assert!(umeyama_alignment(&src, &dst).is_err());
    }

    #[test]
    fn test_csv_format_parse() {
        let f = CsvFormat::parse("1:file 2:lat 3:lon 4:height_above_datum").unwrap();
        assert_eq!(f.file, Some(0));
        assert_eq!(f.lat, Some(1));
        assert_eq!(f.height, Some(3));
        assert!(CsvFormat::parse("1:file 2:northing").is_err());
        assert!(CsvFormat::parse("1:lat 2:lon 3:height_above_datum").is_err());
    }

    #[test]
    fn test_load_positions_substring_match() {
        let datum = Datum::well_known("WGS_1984").unwrap();
        let format = CsvFormat::parse("1:file 2:x 3:y 4:z").unwrap();
        let dir = std::env::temp_dir().join("apogee_align_test");
        std::fs::create_dir_all(&dir).unwrap();
        let csv_path = dir.join("positions.csv");
        std::fs::write(&csv_path, "img_001,1.0,2.0,3.0\nimg_002,4.0,5.0,6.0\n").unwrap();

        let images = vec![
            PathBuf::from("data/run_img_002.tif"),
            PathBuf::from("data/other.tif"),
        ];
        let estimated =
            load_estimated_camera_positions(&csv_path, &format, &datum, &images).unwrap();
        assert_eq!(estimated[0], Vector3::new(4.0, 5.0, 6.0));
        assert_eq!(estimated[1], Vector3::zeros());
    }
}
