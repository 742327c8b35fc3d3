//! Match transfer from map-projected imagery back to raw cameras.
//!
//! When matching on the raw images fails (wildly different illumination,
//! hand-picked points), matches can be made on map-projected versions
//! instead. These utilities move such matches back to the raw images by
//! sampling the shared DEM at each map-pixel's lon/lat, elevating to
//! geocentric, and forward-projecting into the corresponding raw camera.
//! Points whose DEM sample is invalid are dropped.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use nalgebra::{Vector2, Vector3};
use tracing::{info, warn};

use crate::camera::BaCamera;
use crate::cnet::matches::{Ip, match_filename, read_match_file, write_match_file};
use crate::dem::{DemGrid, GeoTransform};
use crate::error::{AdjustError, AdjustResult};
use crate::geodesy::Datum;

/// Move one map-projected pixel into a raw camera.
///
/// Map pixel -> lon/lat (image georef) -> DEM height -> geocentric ->
/// camera projection. `None` when the DEM sample is invalid or the
/// projection fails.
pub fn map_pixel_to_cam_pixel(
    pix: &Vector2<f64>,
    image_georef: &GeoTransform,
    dem: &DemGrid,
    datum: &Datum,
    camera: &BaCamera,
) -> Option<Vector2<f64>> {
    let ll = image_georef.pixel_to_lonlat(pix);
    let height = dem.sample_lonlat(&ll)?;
    let xyz = datum.geodetic_to_cartesian(&Vector3::new(ll.x, ll.y, height));
    camera.project(&xyz)
}

/// Convert matches made between map-projected images into matches between
/// the raw images, overwriting the raw match files.
pub fn matches_from_mapprojected(
    map_images: &[PathBuf],
    map_georefs: &[GeoTransform],
    dem: &DemGrid,
    datum: &Datum,
    cameras: &[BaCamera],
    raw_images: &[PathBuf],
    out_prefix: &str,
) -> AdjustResult<()> {
    if map_images.len() != cameras.len() {
        return Err(AdjustError::Argument(
            "Expecting as many input cameras as map-projected images".to_string(),
        ));
    }
    for i in 0..map_images.len() {
        for j in i + 1..map_images.len() {
            let map_match = match_filename(out_prefix, &map_images[i], &map_images[j]);
            if !map_match.exists() {
                warn!("Missing: {}", map_match.display());
                continue;
            }
            info!("Reading: {}", map_match.display());
            let (ip1, ip2) = read_match_file(&map_match)?;

            let mut ip1_cam = Vec::new();
            let mut ip2_cam = Vec::new();
            for (p1, p2) in ip1.iter().zip(ip2.iter()) {
                let Some(cam_pix1) = map_pixel_to_cam_pixel(
                    &Vector2::new(p1.x, p1.y),
                    &map_georefs[i],
                    dem,
                    datum,
                    &cameras[i],
                ) else {
                    continue;
                };
                let Some(cam_pix2) = map_pixel_to_cam_pixel(
                    &Vector2::new(p2.x, p2.y),
                    &map_georefs[j],
                    dem,
                    datum,
                    &cameras[j],
                ) else {
                    continue;
                };
                ip1_cam.push(Ip {
                    x: cam_pix1.x,
                    y: cam_pix1.y,
                    sx: p1.sx,
                    sy: p1.sy,
                });
                ip2_cam.push(Ip {
                    x: cam_pix2.x,
                    y: cam_pix2.y,
                    sx: p2.sx,
                    sy: p2.sy,
                });
            }

            info!("Saving {} matches.", ip1_cam.len());
            let raw_match = match_filename(out_prefix, &raw_images[i], &raw_images[j]);
            info!("Writing: {}", raw_match.display());
            write_match_file(&raw_match, &ip1_cam, &ip2_cam)?;
        }
    }
    Ok(())
}

/// Create GCPs from matches between map-projected images and the DEM they
/// were projected onto, plus raw match files for every image pair.
///
/// Returns the path of the `.gcp` file written under the output prefix.
#[allow(clippy::too_many_arguments)]
pub fn gcp_from_mapprojected(
    map_images: &[PathBuf],
    map_georefs: &[GeoTransform],
    dem_file: &Path,
    dem: &DemGrid,
    datum: &Datum,
    cameras: &[BaCamera],
    raw_images: &[PathBuf],
    out_prefix: &str,
) -> AdjustResult<PathBuf> {
    let num_images = map_images.len();
    if num_images != cameras.len() {
        return Err(AdjustError::Argument(
            "Expecting as many input cameras as map-projected images".to_string(),
        ));
    }

    // One match file per map image, against the DEM; the DEM-side interest
    // points must agree across files.
    let mut image_ips: Vec<Vec<Ip>> = Vec::with_capacity(num_images);
    let mut dem_ips: Option<Vec<Ip>> = None;
    for map_image in map_images {
        let path = match_filename(out_prefix, map_image, &dem_file.to_path_buf());
        if !path.exists() {
            return Err(AdjustError::Argument(format!(
                "Missing: {}",
                path.display()
            )));
        }
        info!("Reading: {}", path.display());
        let (ip1, ip2) = read_match_file(&path)?;
        if let Some(existing) = &dem_ips {
            if existing.len() != ip2.len() {
                return Err(AdjustError::Argument(
                    "All match files must have the same number of IP".to_string(),
                ));
            }
        }
        image_ips.push(ip1);
        dem_ips = Some(ip2);
    }
    let dem_ips = dem_ips
        .ok_or_else(|| AdjustError::Argument("No map-projected images given".to_string()))?;

    let joined = map_images
        .iter()
        .map(|p| {
            p.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default()
        })
        .collect::<Vec<_>>()
        .join("__");
    let gcp_path = PathBuf::from(format!("{out_prefix}-{joined}.gcp"));

    let mut cam_matches = image_ips.clone();
    let mut out = String::new();
    let mut pts_count = 0usize;
    for (p, dem_ip) in dem_ips.iter().enumerate() {
        let dem_pixel = Vector2::new(dem_ip.x, dem_ip.y);
        let lonlat = dem.georef().pixel_to_lonlat(&dem_pixel);
        let Some(height) = dem.sample_pixel(&dem_pixel) else {
            info!("Skipping pixel outside of DEM: {dem_pixel:?}");
            continue;
        };

        let mut line = String::new();
        let _ = write!(
            line,
            "{pts_count}, {}, {}, {height}, 1, 1, 1",
            lonlat.y, lonlat.x
        );
        let mut num_measures = 0usize;
        for i in 0..num_images {
            let ip = image_ips[i][p];
            let Some(cam_pix) = map_pixel_to_cam_pixel(
                &Vector2::new(ip.x, ip.y),
                &map_georefs[i],
                dem,
                datum,
                &cameras[i],
            ) else {
                continue;
            };
            cam_matches[i][p] = Ip {
                x: cam_pix.x,
                y: cam_pix.y,
                sx: 1.0,
                sy: 1.0,
            };
            let _ = write!(
                line,
                ", {}, {}, {}, 1, 1",
                raw_images[i].display(),
                cam_pix.x,
                cam_pix.y
            );
            num_measures += 1;
        }
        if num_measures == 0 {
            continue;
        }
        let _ = writeln!(out, "{line}");
        pts_count += 1;
    }

    info!("Writing: {}", gcp_path.display());
    std::fs::write(&gcp_path, out)?;

    // Also write raw match files for every pair; i == i is useful when only
    // one image was given.
    for i in 0..num_images {
        for j in i..num_images {
            let path = match_filename(out_prefix, &raw_images[i], &raw_images[j]);
            info!("Writing: {}", path.display());
            write_match_file(&path, &cam_matches[i], &cam_matches[j])?;
        }
    }

    Ok(gcp_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::PinholeCamera;
    use nalgebra::Rotation3;

    #[test]
    fn test_map_pixel_round_trip_through_camera() {
        let datum = Datum::well_known("WGS_1984").unwrap();
        // A flat DEM at height 0 around (0, 0).
        let georef = GeoTransform {
            x0: -0.01,
            dx: 0.0001,
            y0: 0.01,
            dy: -0.0001,
        };
        let dem = DemGrid::new(201, 201, -9999.0, vec![0.0; 201 * 201], georef).unwrap();

        // A camera 1 km above the datum surface at (0, 0), looking straight
        // down the +X (radial) axis.
        let ground = datum.geodetic_to_cartesian(&Vector3::new(0.0, 0.0, 0.0));
        let center = datum.geodetic_to_cartesian(&Vector3::new(0.0, 0.0, 1000.0));
        // World-to-camera: camera z axis points from the camera to the ground.
        let rotation = Rotation3::rotation_between(&(ground - center), &Vector3::z())
            .unwrap_or_else(Rotation3::identity);
        let camera = BaCamera::Pinhole(PinholeCamera::new(
            center,
            rotation,
            1000.0,
            Vector2::new(512.0, 512.0),
            &[],
        ));

        // The DEM centre pixel maps to lonlat (0,0), height 0, and must
        // land near the optical centre.
        let pix = map_pixel_to_cam_pixel(
            &Vector2::new(100.0, 100.0),
            dem.georef(),
            &dem,
            &datum,
            &camera,
        )
        .unwrap();
        assert!((pix - Vector2::new(512.0, 512.0)).norm() < 1e-6);
    }
}
