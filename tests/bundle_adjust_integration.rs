//! End-to-end bundle adjustment scenarios on synthetic data.
//!
//! These tests exercise the whole pipeline: network construction, residual
//! graph, solver driver, outlier rejection, and the residual-vector
//! ordering the report writers rely on.

// Allow expect() in test code
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use std::collections::BTreeSet;

use nalgebra::{Rotation3, Vector2, Vector3};

use apogee_adjust::align::apply_rigid_transform;
use apogee_adjust::ba::graph::{
    BaModel, BaState, CameraMode, ResidualKind, build_residual_graph,
};
use apogee_adjust::ba::run::{RunConfig, run_bundle_adjust};
use apogee_adjust::ba::{GraphOptions, LossKind, SolverOptions};
use apogee_adjust::camera::pinhole::project_pinhole;
use apogee_adjust::camera::{BaCamera, Similarity};
use apogee_adjust::cnet::{Observation, PointKind, TiePoint};
use apogee_adjust::geodesy::Datum;

mod ba_test_utils;
use ba_test_utils::*;

fn state_from(cameras: &[BaCamera], cnet: &apogee_adjust::cnet::ControlNetwork) -> BaState {
    let mut camera_params = Vec::new();
    for cam in cameras {
        camera_params.extend_from_slice(&cam.extrinsic_params());
    }
    let mut points = Vec::new();
    for p in &cnet.points {
        points.extend_from_slice(&[p.position.x, p.position.y, p.position.z]);
    }
    BaState {
        cameras: camera_params,
        intrinsics: vec![1.0; 3],
        points,
    }
}

fn pinhole_model(cameras: &[BaCamera], datum: Datum) -> BaModel {
    let intrinsics = cameras[0].as_pinhole().unwrap().intrinsics().to_vec();
    BaModel {
        mode: CameraMode::Pinhole {
            initial_intrinsics: intrinsics,
        },
        datum,
        num_cameras: cameras.len(),
    }
}

/// Two-camera planar synthetic: perturb one camera translation by a metre,
/// anchor the gauge with a fixed camera and three held GCPs, and expect the
/// truth back.
#[test]
fn test_two_camera_recovery() {
    let truth_centers = [Vector3::new(0.0, 0.0, 0.0), Vector3::new(1.0, 0.0, 0.0)];
    let mut cameras: Vec<BaCamera> = truth_centers
        .iter()
        .map(|c| BaCamera::Pinhole(test_camera(*c)))
        .collect();
    let points = generate_scene_points(50, 42);
    let cnet = build_network(&cameras, &points, &[0, 1, 2]);
    assert_eq!(cnet.num_points(), 50);

    // Perturb the second camera's translation by 1 m.
    if let Some(cam) = cameras[1].as_pinhole_mut() {
        let mut params = cam.extrinsic_params();
        params[0] += 0.6;
        params[1] -= 0.5;
        params[2] += 0.62;
        cam.set_extrinsic_params(&params);
    }

    let (image_files, camera_files) = fake_file_lists(2);
    let cfg = RunConfig {
        out_prefix: temp_prefix("two_camera"),
        image_files,
        camera_files,
        graph: GraphOptions {
            loss: LossKind::L2,
            camera_weight: 0.0,
            fix_gcp_xyz: true,
            fixed_camera_indices: [0].into_iter().collect(),
            ..GraphOptions::default()
        },
        max_iterations: 100,
        ..RunConfig::default()
    };
    let outcome = run_bundle_adjust(&mut cameras, &cnet, &cfg).expect("run");

    let recovered = cameras[1].center();
    assert!(
        (recovered - truth_centers[1]).norm() < 1e-4,
        "camera translation off by {}",
        (recovered - truth_centers[1]).norm()
    );

    // Reprojection residuals of the final solution are numerical noise.
    for (ipt, point) in cnet.points.iter().enumerate() {
        let final_point = outcome.state.point(ipt);
        for obs in &point.observations {
            let reproj = cameras[obs.camera].project(&final_point).expect("projection");
            assert!(
                (reproj - obs.pixel).norm() < 1e-6,
                "residual {} at point {ipt}",
                (reproj - obs.pixel).norm()
            );
        }
    }
}

/// Outlier rejection: 10% gross outliers in a 200-point scene are all
/// flagged after three passes and nothing else is.
#[test]
fn test_outlier_rejection_three_passes() {
    let cameras: Vec<BaCamera> = [Vector3::new(0.0, 0.0, 0.0), Vector3::new(1.0, 0.0, 0.0)]
        .iter()
        .map(|c| BaCamera::Pinhole(test_camera(*c)))
        .collect();
    let points = generate_scene_points(200, 7);
    let mut cnet = build_network(&cameras, &points, &[]);
    assert_eq!(cnet.num_points(), 200);

    // Corrupt every 10th point's first observation by about 50 pixels.
    let injected: Vec<usize> = (0..200).step_by(10).collect();
    for &ipt in &injected {
        cnet.points[ipt].observations[0].pixel += Vector2::new(50.0, 0.0);
    }

    let (image_files, camera_files) = fake_file_lists(2);
    let mut cameras_run: Vec<BaCamera> = cameras;
    let cfg = RunConfig {
        out_prefix: temp_prefix("outliers"),
        image_files,
        camera_files,
        graph: GraphOptions {
            loss: LossKind::L2,
            camera_weight: 0.0,
            fixed_camera_indices: [0, 1].into_iter().collect(),
            ..GraphOptions::default()
        },
        num_passes: 3,
        remove_outliers_params: (75.0, 3.0, 2.0, 3.0),
        min_matches: 30,
        max_iterations: 20,
        ..RunConfig::default()
    };
    let outcome = run_bundle_adjust(&mut cameras_run, &cnet, &cfg).expect("run");

    assert!(
        outcome.outliers.len() >= 18 && outcome.outliers.len() <= 25,
        "outlier count {} outside [18, 25]",
        outcome.outliers.len()
    );
    for ipt in &injected {
        assert!(
            outcome.outliers.contains(ipt),
            "injected outlier {ipt} not flagged"
        );
    }
}

/// With a single pass no outlier rejection happens, whatever the residuals.
#[test]
fn test_single_pass_keeps_outliers() {
    let cameras: Vec<BaCamera> = [Vector3::new(0.0, 0.0, 0.0), Vector3::new(1.0, 0.0, 0.0)]
        .iter()
        .map(|c| BaCamera::Pinhole(test_camera(*c)))
        .collect();
    let points = generate_scene_points(40, 3);
    let mut cnet = build_network(&cameras, &points, &[]);
    cnet.points[5].observations[0].pixel += Vector2::new(80.0, 0.0);

    let (image_files, camera_files) = fake_file_lists(2);
    let mut cameras_run = cameras;
    let cfg = RunConfig {
        out_prefix: temp_prefix("single_pass"),
        image_files,
        camera_files,
        graph: GraphOptions {
            loss: LossKind::L2,
            camera_weight: 0.0,
            fixed_camera_indices: [0, 1].into_iter().collect(),
            ..GraphOptions::default()
        },
        num_passes: 1,
        max_iterations: 10,
        ..RunConfig::default()
    };
    let outcome = run_bundle_adjust(&mut cameras_run, &cnet, &cfg).expect("run");
    assert!(outcome.outliers.is_empty());
}

/// Solver sizing follows the camera count.
#[test]
fn test_solver_options_by_problem_size() {
    use apogee_adjust::ba::LinearSolverKind;

    let expectations = [
        (50, LinearSolverKind::DenseSchur),
        (1000, LinearSolverKind::SparseSchur),
        (
            5000,
            LinearSolverKind::IterativeSchur {
                explicit_schur: true,
            },
        ),
        (
            10000,
            LinearSolverKind::IterativeSchur {
                explicit_schur: false,
            },
        ),
    ];
    for (num_cameras, expected) in expectations {
        let options = SolverOptions::from_problem_size(num_cameras, 500, 1e-8, 1);
        assert_eq!(options.linear_solver, expected, "{num_cameras} cameras");
        assert_eq!(options.gradient_tolerance, 1e-16);
        assert_eq!(options.function_tolerance, 1e-16);
        assert_eq!(options.max_consecutive_invalid_steps, 100);
    }
}

/// Residual-vector ordering: 3 cameras x 10 observations, 2 GCPs, camera
/// prior on, nothing else: 60 + 6 + 18 = 84 entries in that order.
#[test]
fn test_residual_ordering() {
    let cameras: Vec<BaCamera> = [
        Vector3::new(0.0, 0.0, 0.0),
        Vector3::new(1.0, 0.0, 0.0),
        Vector3::new(2.0, 0.0, 0.0),
    ]
    .iter()
    .map(|c| BaCamera::Pinhole(test_camera(*c)))
    .collect();
    let points = generate_scene_points(10, 11);
    let cnet = build_network(&cameras, &points, &[0, 1]);
    assert_eq!(cnet.num_points(), 10);

    let model = pinhole_model(&cameras, Datum::default());
    let mut state = state_from(&cameras, &cnet);
    let orig_cameras = state.cameras.clone();
    let options = GraphOptions {
        loss: LossKind::L2,
        camera_weight: 1.0,
        ..GraphOptions::default()
    };
    let graph = build_residual_graph(
        &model,
        &cnet,
        &mut state,
        &orig_cameras,
        &BTreeSet::new(),
        &options,
        None,
    )
    .expect("graph");

    assert_eq!(graph.total_residuals, 84);
    let residuals = graph
        .evaluate_residuals(&model, &state, false)
        .expect("residuals");
    assert_eq!(residuals.len(), 84);
    graph.verify_residual_count(residuals.len()).expect("count");

    // Kind order: all reprojection blocks, then GCP anchors, then priors.
    let mut phase = 0;
    for spec in &graph.blocks {
        let this_phase = match spec.kind {
            ResidualKind::Reprojection { .. } => 0,
            ResidualKind::GcpXyz { .. } | ResidualKind::GcpLlh { .. } => 1,
            ResidualKind::CameraPrior { .. } => 2,
            ResidualKind::RotTransPrior { .. } => 3,
            ResidualKind::DisparityTerrain { .. } => 4,
        };
        assert!(this_phase >= phase, "residual blocks out of order");
        phase = this_phase;
    }
    assert_eq!(graph.cam_residual_counts, vec![10, 10, 10]);
    assert_eq!(graph.num_gcp_residuals, 2);
}

/// LLH GCP error: a 1 m northward displacement produces a larger residual
/// than a 1 m eastward one, in the exact ratio of the local geodetic
/// derivatives.
#[test]
fn test_llh_gcp_error_anisotropy() {
    let datum = Datum::well_known("WGS_1984").unwrap();
    let llh0 = Vector3::new(0.0, 37.0, 0.0);
    let gcp_xyz = datum.geodetic_to_cartesian(&llh0);

    // Local east/north directions from numeric differences.
    let d = 1e-4;
    let east_dir = (datum.geodetic_to_cartesian(&Vector3::new(llh0.x + d, llh0.y, llh0.z))
        - gcp_xyz)
        .normalize();
    let north_dir = (datum.geodetic_to_cartesian(&Vector3::new(llh0.x, llh0.y + d, llh0.z))
        - gcp_xyz)
        .normalize();
    // Degrees of latitude per metre north, and of longitude per metre east.
    let dlat_per_m = (datum.cartesian_to_geodetic(&(gcp_xyz + north_dir)).y - llh0.y).abs();
    let dlon_per_m = (datum.cartesian_to_geodetic(&(gcp_xyz + east_dir)).x - llh0.x).abs();
    let expected_ratio = dlat_per_m / dlon_per_m;

    let camera = BaCamera::Pinhole(test_camera(gcp_xyz - Vector3::new(0.0, 0.0, 10.0)));
    let pixel = Vector2::new(512.0, 512.0);
    let mut cnet = apogee_adjust::cnet::ControlNetwork::default();
    cnet.add_point(TiePoint {
        position: gcp_xyz,
        sigma: Vector3::new(1e-5, 1e-5, 1.0),
        kind: PointKind::Gcp,
        observations: vec![Observation::new(0, pixel, Vector2::new(1.0, 1.0))],
    })
    .unwrap();

    let cameras = vec![camera];
    let model = pinhole_model(&cameras, datum.clone());
    let mut state = state_from(&cameras, &cnet);
    let orig_cameras = state.cameras.clone();
    let options = GraphOptions {
        loss: LossKind::L2,
        camera_weight: 0.0,
        use_llh_error: true,
        ..GraphOptions::default()
    };
    let graph = build_residual_graph(
        &model,
        &cnet,
        &mut state,
        &orig_cameras,
        &BTreeSet::new(),
        &options,
        None,
    )
    .unwrap();

    let gcp_rows = 2..5; // after the single reprojection block
    let mut norms = Vec::new();
    for dir in [north_dir, east_dir] {
        let mut displaced = state.clone();
        displaced.set_point(0, &(gcp_xyz + dir));
        let residuals = graph.evaluate_residuals(&model, &displaced, false).unwrap();
        let r: f64 = residuals[gcp_rows.clone()]
            .iter()
            .map(|v| v * v)
            .sum::<f64>()
            .sqrt();
        norms.push(r);
    }
    let ratio = norms[0] / norms[1];
    assert!(
        (ratio - expected_ratio).abs() / expected_ratio < 1e-2,
        "ratio {ratio} vs expected {expected_ratio}"
    );
    assert!(ratio > 1.0);
}

/// Applying a similarity and then its inverse restores cameras and points
/// to within 1e-9 per coordinate.
#[test]
fn test_similarity_round_trip_on_scene() {
    let mut cameras: Vec<BaCamera> = [Vector3::new(0.0, 0.0, 0.0), Vector3::new(1.0, 0.0, 0.0)]
        .iter()
        .map(|c| BaCamera::Pinhole(test_camera(*c)))
        .collect();
    let points = generate_scene_points(20, 9);
    let mut cnet = build_network(&cameras, &points, &[]);

    let original_centers: Vec<Vector3<f64>> = cameras.iter().map(|c| c.center()).collect();
    let original_points: Vec<Vector3<f64>> = cnet.points.iter().map(|p| p.position).collect();

    let sim = Similarity {
        rotation: Rotation3::from_euler_angles(0.3, -0.2, 0.7),
        translation: Vector3::new(100.0, -50.0, 20.0),
        scale: 1.1,
    };
    apply_rigid_transform(&mut cameras, &mut cnet, &sim);
    apply_rigid_transform(&mut cameras, &mut cnet, &sim.inverse());

    for (camera, original) in cameras.iter().zip(&original_centers) {
        let diff = camera.center() - original;
        assert!(diff.abs().max() < 1e-9, "camera centre moved by {diff:?}");
    }
    for (point, original) in cnet.points.iter().zip(&original_points) {
        let diff = point.position - original;
        assert!(diff.abs().max() < 1e-9, "point moved by {diff:?}");
    }
}

/// Intrinsic scales multiply the initial intrinsics, and solving for the
/// focal length recovers a 2% error through the scale.
#[test]
fn test_intrinsic_scale_reconstruction() {
    // The scale applies multiplicatively in projection.
    let extrinsics = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
    let xyz = Vector3::new(0.5, -0.3, 10.0);
    let scaled = project_pinhole(&extrinsics, &[1100.0, 512.0, 512.0], &xyz).unwrap();
    let model = BaModel {
        mode: CameraMode::Pinhole {
            initial_intrinsics: vec![1000.0, 512.0, 512.0],
        },
        datum: Datum::default(),
        num_cameras: 1,
    };
    let via_scale = model
        .project(0, &extrinsics, &[1.1, 1.0, 1.0], &xyz)
        .unwrap();
    assert!((scaled - via_scale).norm() < 1e-12);

    // End to end: observations made with f = 1000, initial cameras carry
    // f = 1020, cameras and points held, focal floats.
    let truth_cameras: Vec<BaCamera> = [Vector3::new(0.0, 0.0, 0.0), Vector3::new(1.0, 0.0, 0.0)]
        .iter()
        .map(|c| BaCamera::Pinhole(test_camera(*c)))
        .collect();
    let points = generate_scene_points(20, 5);
    let gcps: Vec<usize> = (0..20).collect();
    let cnet = build_network(&truth_cameras, &points, &gcps);

    let mut cameras: Vec<BaCamera> = truth_cameras;
    for camera in cameras.iter_mut() {
        if let Some(pinhole) = camera.as_pinhole_mut() {
            pinhole.set_intrinsics(&[1020.0, 512.0, 512.0]);
        }
    }

    let (image_files, camera_files) = fake_file_lists(2);
    let cfg = RunConfig {
        out_prefix: temp_prefix("intrinsics"),
        image_files,
        camera_files,
        datum: Datum::well_known("WGS_1984").unwrap(),
        graph: GraphOptions {
            loss: LossKind::L2,
            camera_weight: 0.0,
            solve_intrinsics: true,
            intrinsics_to_float: apogee_adjust::ba::IntrinsicsToFloat::parse("focal_length")
                .unwrap(),
            fix_gcp_xyz: true,
            fixed_camera_indices: [0, 1].into_iter().collect(),
            ..GraphOptions::default()
        },
        max_iterations: 100,
        ..RunConfig::default()
    };
    let outcome = run_bundle_adjust(&mut cameras, &cnet, &cfg).expect("run");

    let focal_scale = outcome.state.intrinsics[0];
    let final_f = cameras[0].as_pinhole().unwrap().focal_length();
    // final = initial * scale, for every camera sharing the intrinsics.
    assert!((final_f - 1020.0 * focal_scale).abs() < 1e-9);
    assert!(
        (final_f - 1000.0).abs() < 0.1,
        "recovered focal length {final_f}"
    );
    for camera in &cameras {
        assert_eq!(camera.as_pinhole().unwrap().focal_length(), final_f);
    }
}

/// Camera extrinsic blocks keep their layout across a graph rebuild.
#[test]
fn test_stable_block_ordering_across_passes() {
    let cameras: Vec<BaCamera> = [Vector3::new(0.0, 0.0, 0.0), Vector3::new(1.0, 0.0, 0.0)]
        .iter()
        .map(|c| BaCamera::Pinhole(test_camera(*c)))
        .collect();
    let points = generate_scene_points(10, 21);
    let cnet = build_network(&cameras, &points, &[]);
    let model = pinhole_model(&cameras, Datum::default());
    let mut state = state_from(&cameras, &cnet);
    let orig = state.cameras.clone();

    let options = GraphOptions {
        loss: LossKind::L2,
        camera_weight: 0.0,
        ..GraphOptions::default()
    };
    let graph1 = build_residual_graph(
        &model,
        &cnet,
        &mut state,
        &orig,
        &BTreeSet::new(),
        &options,
        None,
    )
    .unwrap();
    let outliers: BTreeSet<usize> = [3usize].into_iter().collect();
    let graph2 = build_residual_graph(
        &model,
        &cnet,
        &mut state,
        &orig,
        &outliers,
        &options,
        None,
    )
    .unwrap();

    // The outlier point is dropped from both cameras: four residual rows.
    assert_eq!(graph1.total_residuals, 40);
    assert_eq!(graph2.total_residuals, 36);
    assert_eq!(graph2.cam_residual_counts, vec![9, 9]);
}
