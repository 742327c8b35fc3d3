//! Residual logs, ground point maps, and KML output.
//!
//! The log writers walk the residual vector in exactly the order the graph
//! builder emitted it: reprojection blocks camera-major, then GCP anchors,
//! camera priors, rotation/translation priors, and disparity-terrain
//! residuals. An index mismatch at the end is an invariant violation, not
//! an I/O problem.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::Path;

use nalgebra::Vector2;
use tracing::{info, warn};

use crate::ba::graph::{BaModel, BaState, PIXEL_SIZE, POINT_PARAMS_N, ResidualGraph, ResidualKind};
use crate::ba::outliers::compute_mean_point_residuals;
use crate::camera::CAMERA_PARAMS_N;
use crate::cnet::ControlNetwork;
use crate::error::{AdjustError, AdjustResult};
use crate::geodesy::Datum;

pub const KML_ICON_PLAIN: &str =
    "http://maps.google.com/mapfiles/kml/shapes/placemark_circle.png";
pub const KML_ICON_HIGHLIGHT: &str =
    "http://maps.google.com/mapfiles/kml/shapes/placemark_circle_highlight.png";

/// Everything the log writers need besides the parameter state.
pub struct ReportContext<'a> {
    pub graph: &'a ResidualGraph,
    pub model: &'a BaModel,
    pub cnet: &'a ControlNetwork,
    pub outliers: &'a BTreeSet<usize>,
    pub camera_labels: &'a [String],
}

/// Write the residual log files for one evaluation.
///
/// Produces `<prefix>_averages.txt`, `<prefix>_raw_pixels.txt`,
/// `<prefix>_raw_gcp.txt`, `<prefix>_raw_cameras.txt`, the reference
/// terrain file when terrain residuals exist, and the
/// `<prefix>_pointmap_point_log.csv` ground map.
pub fn write_residual_logs(
    prefix: &str,
    apply_loss: bool,
    ctx: &ReportContext<'_>,
    state: &BaState,
) -> AdjustResult<()> {
    let residuals = ctx.graph.evaluate_residuals(ctx.model, state, apply_loss)?;
    ctx.graph.verify_residual_count(residuals.len())?;

    let averages_path = format!("{prefix}_averages.txt");
    let raw_pixels_path = format!("{prefix}_raw_pixels.txt");
    let raw_gcp_path = format!("{prefix}_raw_gcp.txt");
    let raw_cams_path = format!("{prefix}_raw_cameras.txt");
    let reference_path = format!("{prefix}_reference_terrain.txt");

    info!("Writing: {averages_path}");
    info!("Writing: {raw_pixels_path}");
    info!("Writing: {raw_gcp_path}");
    info!("Writing: {raw_cams_path}");

    let mut averages = String::new();
    let mut raw_pixels = String::new();
    let mut raw_gcp = String::new();
    let mut raw_cams = String::new();
    let mut reference = String::new();

    let num_cameras = ctx.graph.cam_residual_counts.len();
    let mut index = 0usize;

    // Reprojection residuals, averaged per camera.
    let _ = writeln!(averages, "Mean residual error and point count for cameras:");
    for icam in 0..num_cameras {
        let count = ctx.graph.cam_residual_counts[icam];
        let _ = writeln!(raw_pixels, "{}, {}", ctx.camera_labels[icam], count);
        let mut mean = 0.0;
        for _ in 0..count {
            let ex = residuals[index];
            let ey = residuals[index + 1];
            index += PIXEL_SIZE;
            mean += ex.abs() + ey.abs();
            let _ = writeln!(raw_pixels, "{ex:.17}, {ey:.17}");
        }
        mean /= count.max(1) as f64;
        let _ = writeln!(averages, "{}, {mean:.17}, {count}", ctx.camera_labels[icam]);
    }

    // GCP residuals.
    if ctx.graph.num_gcp_residuals > 0 {
        let _ = writeln!(averages, "GCP residual errors:");
        for i in 0..ctx.graph.num_gcp_residuals {
            let mut mean = 0.0;
            let _ = write!(raw_gcp, "{i}");
            for _ in 0..POINT_PARAMS_N {
                mean += residuals[index].abs();
                let _ = write!(raw_gcp, ", {:.17}", residuals[index]);
                index += 1;
            }
            mean /= POINT_PARAMS_N as f64;
            let _ = writeln!(raw_gcp);
            let _ = writeln!(averages, "{i}, {mean:.17}");
        }
    }

    // Camera prior residuals: one section per active prior kind.
    let has_camera_prior = ctx
        .graph
        .blocks
        .iter()
        .any(|b| matches!(b.kind, ResidualKind::CameraPrior { .. }));
    let has_rot_trans = ctx
        .graph
        .blocks
        .iter()
        .any(|b| matches!(b.kind, ResidualKind::RotTransPrior { .. }));
    let num_prior_passes = usize::from(has_camera_prior) + usize::from(has_rot_trans);
    let part_size = CAMERA_PARAMS_N / 2;
    for _ in 0..num_prior_passes {
        let _ = writeln!(
            averages,
            "Camera weight position and orientation residual errors:"
        );
        for icam in 0..num_cameras {
            let _ = write!(raw_cams, "{}", ctx.camera_labels[icam]);
            let mut mean_position = 0.0;
            let mut mean_rotation = 0.0;
            for q in 0..CAMERA_PARAMS_N {
                let v = residuals[index];
                index += 1;
                if q < part_size {
                    mean_position += v.abs();
                } else {
                    mean_rotation += v.abs();
                }
                let _ = write!(raw_cams, ", {v:.17}");
            }
            let _ = writeln!(raw_cams);
            mean_position /= part_size as f64;
            mean_rotation /= part_size as f64;
            let _ = writeln!(
                averages,
                "{}, {mean_position:.17}, {mean_rotation:.17}",
                ctx.camera_labels[icam]
            );
        }
    }

    // Reference terrain residuals.
    if !ctx.graph.reference_points.is_empty() {
        info!("Writing: {reference_path}");
        let _ = writeln!(averages, "reference terrain residual errors:");
        let _ = writeln!(reference, "# lon, lat, height_above_datum, pixel_error_norm");
        for (i, xyz) in ctx.graph.reference_points.iter().enumerate() {
            let llh = ctx.model.datum.cartesian_to_geodetic(xyz);
            let err =
                Vector2::new(residuals[index], residuals[index + 1]).norm();
            index += PIXEL_SIZE;
            let _ = writeln!(reference, "{}, {}, {}, {err}", llh.x, llh.y, llh.z);
            let _ = writeln!(averages, "{i}, {err}");
        }
    }

    if index != residuals.len() {
        return Err(AdjustError::Logic(format!(
            "Have {} residuals but iterated through {index}",
            residuals.len()
        )));
    }

    std::fs::write(&averages_path, averages)?;
    std::fs::write(&raw_pixels_path, raw_pixels)?;
    if ctx.graph.num_gcp_residuals > 0 {
        std::fs::write(&raw_gcp_path, raw_gcp)?;
    }
    std::fs::write(&raw_cams_path, raw_cams)?;
    if !ctx.graph.reference_points.is_empty() {
        std::fs::write(&reference_path, reference)?;
    }

    write_residual_map(&format!("{prefix}_pointmap"), ctx, state, &residuals)?;
    Ok(())
}

/// Write the per-point ground map: mean residual at each surviving point.
fn write_residual_map(
    prefix: &str,
    ctx: &ReportContext<'_>,
    state: &BaState,
    residuals: &[f64],
) -> AdjustResult<()> {
    let output_path = format!("{prefix}_point_log.csv");
    if !ctx.model.datum.is_specified() {
        warn!("No datum specified, can't write file: {output_path}");
        return Ok(());
    }

    let num_points = ctx.cnet.num_points();
    let (mean_residuals, num_observations) =
        compute_mean_point_residuals(ctx.graph, num_points, residuals, ctx.outliers);

    info!("Writing: {output_path}");
    let mut out = String::new();
    let _ = writeln!(out, "# lon, lat, height_above_datum, mean_residual, num_observations");
    for ipt in 0..num_points {
        if ctx.outliers.contains(&ipt) || num_observations[ipt] == 0 {
            continue;
        }
        let llh = ctx.model.datum.cartesian_to_geodetic(&state.point(ipt));
        let _ = writeln!(
            out,
            "{:.17}, {:.17}, {:.17}, {:.17}, {}",
            llh.x, llh.y, llh.z, mean_residuals[ipt], num_observations[ipt]
        );
    }
    std::fs::write(output_path, out)?;
    Ok(())
}

/// Write a KML scatter of every skip-th surviving point.
///
/// The skip is chosen so at least 20 points appear.
pub fn record_points_to_kml<P: AsRef<Path>>(
    path: P,
    datum: &Datum,
    state: &BaState,
    num_points: usize,
    outliers: &BTreeSet<usize>,
    name: &str,
    icon: &str,
) -> AdjustResult<()> {
    let path = path.as_ref();
    if !datum.is_specified() {
        warn!("No datum specified, can't write file: {}", path.display());
        return Ok(());
    }

    const MIN_KML_POINTS: usize = 20;
    let mut skip = 30usize;
    if num_points / skip < MIN_KML_POINTS {
        skip = num_points / MIN_KML_POINTS;
    }
    skip = skip.max(1);

    info!("Writing: {}", path.display());
    let mut out = String::new();
    let _ = writeln!(out, "<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
    let _ = writeln!(out, "<kml xmlns=\"http://www.opengis.net/kml/2.2\">");
    let _ = writeln!(out, "<Document>");
    let _ = writeln!(out, "  <name>{name}</name>");
    for (id, scale) in [("point", 1.0), ("point_highlight", 1.1)] {
        let _ = writeln!(out, "  <Style id=\"{id}\">");
        let _ = writeln!(out, "    <IconStyle>");
        let _ = writeln!(out, "      <scale>{scale}</scale>");
        let _ = writeln!(out, "      <Icon><href>{icon}</href></Icon>");
        let _ = writeln!(out, "    </IconStyle>");
        let _ = writeln!(out, "    <LabelStyle><scale>0</scale></LabelStyle>");
        let _ = writeln!(out, "  </Style>");
    }
    let _ = writeln!(out, "  <StyleMap id=\"point_placemark\">");
    let _ = writeln!(
        out,
        "    <Pair><key>normal</key><styleUrl>#point</styleUrl></Pair>"
    );
    let _ = writeln!(
        out,
        "    <Pair><key>highlight</key><styleUrl>#point_highlight</styleUrl></Pair>"
    );
    let _ = writeln!(out, "  </StyleMap>");

    let mut ipt = 0;
    while ipt < num_points {
        if !outliers.contains(&ipt) {
            let llh = datum.cartesian_to_geodetic(&state.point(ipt));
            let _ = writeln!(out, "  <Placemark>");
            let _ = writeln!(out, "    <styleUrl>#point_placemark</styleUrl>");
            let _ = writeln!(out, "    <Point>");
            let _ = writeln!(out, "      <extrude>1</extrude>");
            let _ = writeln!(out, "      <altitudeMode>absolute</altitudeMode>");
            let _ = writeln!(
                out,
                "      <coordinates>{},{},{}</coordinates>",
                llh.x, llh.y, llh.z
            );
            let _ = writeln!(out, "    </Point>");
            let _ = writeln!(out, "  </Placemark>");
        }
        ipt += skip;
    }
    let _ = writeln!(out, "</Document>");
    let _ = writeln!(out, "</kml>");
    std::fs::write(path, out)?;
    Ok(())
}

/// Log the before/after positions of the optimised GCPs.
pub fn log_gcp_stats(
    cnet: &ControlNetwork,
    state: &BaState,
    outliers: &BTreeSet<usize>,
    datum: &Datum,
) {
    if cnet.num_gcp() == 0 {
        return;
    }
    info!("input_gcp optimized_gcp diff");
    for (ipt, point) in cnet.points.iter().enumerate() {
        if !point.is_gcp() || outliers.contains(&ipt) {
            continue;
        }
        let input = point.position;
        let optimized = state.point(ipt);
        info!("xyz: {:?} {:?} {:?}", input, optimized, input - optimized);
        if datum.is_specified() {
            let input_llh = datum.cartesian_to_geodetic(&input);
            let opt_llh = datum.cartesian_to_geodetic(&optimized);
            info!(
                "llh: {:?} {:?} {:?}",
                input_llh,
                opt_llh,
                input_llh - opt_llh
            );
        }
    }
}
