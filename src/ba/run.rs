//! The pass loop: build, solve, report, reject outliers, repeat.
//!
//! Inputs are constructed once before the loop. Each pass snapshots the
//! parameter vectors on entry and restores them on re-entry, so every pass
//! optimises from the same starting point but with a larger outlier set.
//! At the end the final parameters are written back into the camera models
//! and to per-camera files under the output prefix.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::camera::{BaCamera, CAMERA_PARAMS_N};
use crate::cnet::ControlNetwork;
use crate::error::{AdjustError, AdjustResult};
use crate::geodesy::Datum;
use crate::report;

use super::graph::{
    BaModel, BaState, CameraMode, GraphOptions, TerrainConstraint, build_residual_graph,
};
use super::outliers::{
    RemoveOutliersByDispParams, RemoveOutliersParams, compute_mean_point_residuals,
    remove_outlier_matches, update_outliers,
};
use super::solver::{SolveStatus, SolverOptions, solve_pass};

/// Everything a bundle adjustment run needs beyond the cameras and network.
pub struct RunConfig {
    pub out_prefix: String,
    pub image_files: Vec<PathBuf>,
    pub camera_files: Vec<PathBuf>,
    pub datum: Datum,
    pub graph: GraphOptions,
    pub num_passes: usize,
    pub remove_outliers_params: RemoveOutliersParams,
    pub remove_outliers_by_disp_params: RemoveOutliersByDispParams,
    pub min_matches: usize,
    pub max_iterations: usize,
    pub parameter_tolerance: f64,
    pub num_threads: usize,
    pub match_files: BTreeMap<(usize, usize), PathBuf>,
    pub terrain: Option<Arc<TerrainConstraint>>,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            out_prefix: String::new(),
            image_files: Vec::new(),
            camera_files: Vec::new(),
            datum: Datum::default(),
            graph: GraphOptions::default(),
            num_passes: 1,
            remove_outliers_params: (75.0, 3.0, 2.0, 3.0),
            remove_outliers_by_disp_params: (90.0, 3.0),
            min_matches: 30,
            max_iterations: 1000,
            parameter_tolerance: 1e-8,
            num_threads: 1,
            match_files: BTreeMap::new(),
            terrain: None,
        }
    }
}

/// Build the projection model from the camera variants; mixing variants in
/// one run is a logic error.
fn build_model(cameras: &[BaCamera], datum: &Datum) -> AdjustResult<BaModel> {
    if cameras.is_empty() {
        return Err(AdjustError::Argument("Zero cameras provided".to_string()));
    }
    let all_pinhole = cameras.iter().all(|c| matches!(c, BaCamera::Pinhole(_)));
    let all_adjusted = cameras.iter().all(|c| matches!(c, BaCamera::Adjusted(_)));
    let mode = if all_pinhole {
        let first = cameras[0]
            .as_pinhole()
            .ok_or_else(|| AdjustError::Logic("Expected a pinhole camera".to_string()))?;
        // Intrinsics are shared across all pinhole cameras in a run.
        for (icam, camera) in cameras.iter().enumerate().skip(1) {
            if let Some(pinhole) = camera.as_pinhole() {
                if pinhole.intrinsics() != first.intrinsics() {
                    warn!(
                        "Camera {icam} has different intrinsics than camera 0; using camera 0's for all"
                    );
                }
            }
        }
        CameraMode::Pinhole {
            initial_intrinsics: first.intrinsics().to_vec(),
        }
    } else if all_adjusted {
        let bases = cameras
            .iter()
            .map(|c| match c {
                BaCamera::Adjusted(cam) => cam.base().clone(),
                BaCamera::Pinhole(_) => unreachable!(),
            })
            .collect();
        CameraMode::Adjusted { bases }
    } else {
        return Err(AdjustError::Argument(
            "Cannot mix adjustable and pinhole cameras in one run".to_string(),
        ));
    };
    Ok(BaModel {
        mode,
        datum: datum.clone(),
        num_cameras: cameras.len(),
    })
}

fn initial_state(cameras: &[BaCamera], cnet: &ControlNetwork, model: &BaModel) -> BaState {
    let mut camera_params = Vec::with_capacity(cameras.len() * CAMERA_PARAMS_N);
    for camera in cameras {
        camera_params.extend_from_slice(&camera.extrinsic_params());
    }
    let mut points = Vec::with_capacity(cnet.num_points() * 3);
    for point in &cnet.points {
        points.extend_from_slice(&[point.position.x, point.position.y, point.position.z]);
    }
    BaState {
        cameras: camera_params,
        intrinsics: vec![1.0; model.num_intrinsic_params()],
        points,
    }
}

/// Output file for one camera: `<prefix>-<image stem>-<camera stem>` plus
/// the variant extension.
pub fn bundle_adjust_file_name(
    prefix: &str,
    image: &PathBuf,
    camera: &PathBuf,
    extension: &str,
) -> PathBuf {
    let stem = |p: &PathBuf| {
        p.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    };
    let image_stem = stem(image);
    let camera_stem = stem(camera);
    if camera_stem.is_empty() {
        PathBuf::from(format!("{prefix}-{image_stem}.{extension}"))
    } else {
        PathBuf::from(format!("{prefix}-{image_stem}-{camera_stem}.{extension}"))
    }
}

fn write_camera_files(cameras: &[BaCamera], cfg: &RunConfig) -> AdjustResult<()> {
    for (icam, camera) in cameras.iter().enumerate() {
        let camera_file = cfg
            .camera_files
            .get(icam)
            .cloned()
            .unwrap_or_default();
        match camera {
            BaCamera::Adjusted(cam) => {
                let path = bundle_adjust_file_name(
                    &cfg.out_prefix,
                    &cfg.image_files[icam],
                    &camera_file,
                    "adjust",
                );
                info!("Writing: {}", path.display());
                cam.write_adjust(&path)?;
            }
            BaCamera::Pinhole(cam) => {
                let path = bundle_adjust_file_name(
                    &cfg.out_prefix,
                    &cfg.image_files[icam],
                    &camera_file,
                    "tsai",
                );
                info!("Writing: {}", path.display());
                cam.write_tsai(&path)?;
            }
        }
    }
    Ok(())
}

/// What a finished run leaves behind besides the updated camera models.
pub struct RunOutcome {
    /// Tie points flagged across all passes
    pub outliers: BTreeSet<usize>,
    /// Final parameter vectors of the last pass
    pub state: BaState,
}

/// Run the full multi-pass bundle adjustment, mutating the cameras in place.
pub fn run_bundle_adjust(
    cameras: &mut [BaCamera],
    cnet: &ControlNetwork,
    cfg: &RunConfig,
) -> AdjustResult<RunOutcome> {
    if cfg.num_passes == 0 {
        return Err(AdjustError::Argument(
            "Expecting at least one bundle adjust pass".to_string(),
        ));
    }
    let model = build_model(cameras, &cfg.datum)?;
    let num_cameras = model.num_cameras;
    let num_points = cnet.num_points();

    let mut state = initial_state(cameras, cnet, &model);
    let orig_state = state.clone();

    let solver_options = SolverOptions::from_problem_size(
        num_cameras,
        cfg.max_iterations,
        cfg.parameter_tolerance,
        cfg.num_threads,
    );
    info!("Linear solver: {}", solver_options.linear_solver);

    let camera_labels: Vec<String> = (0..num_cameras)
        .map(|icam| {
            let from_camera = cfg.camera_files.get(icam).map(|p| p.display().to_string());
            match from_camera {
                Some(name) if !name.is_empty() => name,
                _ => cfg
                    .image_files
                    .get(icam)
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| format!("camera_{icam}")),
            }
        })
        .collect();

    let mut outliers: BTreeSet<usize> = BTreeSet::new();

    for pass in 0..cfg.num_passes {
        if cfg.num_passes > 1 {
            info!("Bundle adjust pass: {pass}");
            // Each pass optimises from the original inputs, sans outliers.
            state = orig_state.clone();
        }
        let last_pass = pass == cfg.num_passes - 1;

        let graph = build_residual_graph(
            &model,
            cnet,
            &mut state,
            &orig_state.cameras,
            &outliers,
            &cfg.graph,
            cfg.terrain.clone(),
        )?;
        if !graph.reference_points.is_empty() {
            info!(
                "Found {} reference points in range.",
                graph.reference_points.len()
            );
        }

        let ctx = report::ReportContext {
            graph: &graph,
            model: &model,
            cnet,
            outliers: &outliers,
            camera_labels: &camera_labels,
        };

        if pass == 0 {
            info!("Writing initial condition files...");
            let prefix = format!("{}-initial_residuals_loss_function", cfg.out_prefix);
            report::write_residual_logs(&prefix, true, &ctx, &state)?;
            let prefix = format!("{}-initial_residuals_no_loss_function", cfg.out_prefix);
            report::write_residual_logs(&prefix, false, &ctx, &state)?;
            report::record_points_to_kml(
                &format!("{}-initial_points.kml", cfg.out_prefix),
                &cfg.datum,
                &state,
                num_points,
                &outliers,
                "initial_points",
                report::KML_ICON_PLAIN,
            )?;
        }

        info!("Starting the solver...");
        let summary = solve_pass(&graph, &model, &mut state, &solver_options)?;
        info!("\n{summary}");
        if summary.status == SolveStatus::NoConvergence {
            // Clarify, so the user does not think the pass failed.
            info!("Found a valid solution, but did not reach the actual minimum.");
        }
        if summary.status.is_failure() {
            return Err(AdjustError::Solver(format!(
                "Solver failed: {}",
                summary.status
            )));
        }

        if cfg.graph.solve_intrinsics {
            info!("Final scaled intrinsics:");
            info!(
                "{}",
                state
                    .intrinsics
                    .iter()
                    .map(|s| format!("{s}"))
                    .collect::<Vec<_>>()
                    .join(" ")
            );
        }

        info!("Writing final condition log files...");
        let prefix = format!("{}-final_residuals_loss_function", cfg.out_prefix);
        report::write_residual_logs(&prefix, true, &ctx, &state)?;
        let prefix = format!("{}-final_residuals_no_loss_function", cfg.out_prefix);
        report::write_residual_logs(&prefix, false, &ctx, &state)?;
        report::record_points_to_kml(
            &format!("{}-final_points.kml", cfg.out_prefix),
            &cfg.datum,
            &state,
            num_points,
            &outliers,
            "final_points",
            report::KML_ICON_HIGHLIGHT,
        )?;

        report::log_gcp_stats(cnet, &state, &outliers, &cfg.datum);

        let mut num_new_outliers = 0;
        if !last_pass {
            let residuals = graph.evaluate_residuals(&model, &state, false)?;
            graph.verify_residual_count(residuals.len())?;
            let (mean_residuals, _) =
                compute_mean_point_residuals(&graph, num_points, &residuals, &outliers);
            num_new_outliers = update_outliers(
                cnet,
                &mean_residuals,
                &mut outliers,
                cfg.remove_outliers_params,
            );
            if cfg.num_passes > 1 && num_new_outliers > 0 {
                remove_outlier_matches(
                    cnet,
                    &outliers,
                    &cfg.match_files,
                    cfg.remove_outliers_by_disp_params,
                )?;
            }
        }

        let num_points_remaining = num_points - outliers.len();
        if cfg.num_passes > 1 && num_points_remaining < cfg.min_matches {
            // With a single pass no outlier filtering happened, so this
            // check would only punish GCP-only runs.
            return Err(AdjustError::Network(
                "Too few points remain after filtering".to_string(),
            ));
        }

        if !last_pass && num_new_outliers == 0 {
            info!("No new outliers removed. No more passes are needed.");
            break;
        }
    }

    // Write the optimised parameters back into the camera models.
    for (icam, camera) in cameras.iter_mut().enumerate() {
        camera.set_extrinsic_params(state.camera_block(icam));
    }
    if let CameraMode::Pinhole { initial_intrinsics } = &model.mode {
        let final_intrinsics: Vec<f64> = initial_intrinsics
            .iter()
            .zip(state.intrinsics.iter())
            .map(|(v, s)| v * s)
            .collect();
        for camera in cameras.iter_mut() {
            if let Some(pinhole) = camera.as_pinhole_mut() {
                pinhole.set_intrinsics(&final_intrinsics);
            }
        }
    }

    write_camera_files(cameras, cfg)?;

    if outliers.len() == num_points && num_points > 0 {
        warn!("Every point was flagged as an outlier; the solution is unconstrained.");
    }
    Ok(RunOutcome { outliers, state })
}
