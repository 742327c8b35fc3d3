//! The residual graph: cost terms over parameter blocks, described as data.
//!
//! The builder walks the control network once per pass and emits residual
//! blocks in a fixed order: reprojection terms (camera-major, then per
//! observation), GCP anchors, camera priors, rotation/translation priors,
//! and disparity-terrain terms. The residual vector produced by evaluation
//! is ordered exactly by insertion order; the report writers depend on it.
//!
//! The graph never owns parameter values. It references blocks of the three
//! flat arrays in [`BaState`] by [`BlockId`] and hands the whole structure
//! to the solver driver, which is the only writer of those arrays.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use nalgebra::{DMatrix, DVector, Vector2, Vector3};
use rayon::prelude::*;

use crate::camera::adjusted::project_adjusted;
use crate::camera::pinhole::{CENTER_PARAMS_N, FOCAL_PARAMS_N, project_pinhole};
use crate::camera::{CAMERA_PARAMS_N, ImageBox, SensorModel};
use crate::cnet::ControlNetwork;
use crate::dem::{DemGrid, DisparityMap};
use crate::error::{AdjustError, AdjustResult};
use crate::geodesy::Datum;

use super::loss::{Corrector, Loss, LossKind};

/// Residual size of one pixel observation.
pub const PIXEL_SIZE: usize = 2;
/// Parameter count of one 3D point block.
pub const POINT_PARAMS_N: usize = 3;

/// Relative step for central-difference Jacobians.
const NUMERIC_DIFF_STEP: f64 = 1e-6;

/// How cameras in the run project: a delta over immutable base sensors, or
/// pinhole poses with shared intrinsics.
pub enum CameraMode {
    Adjusted { bases: Vec<Arc<dyn SensorModel>> },
    Pinhole { initial_intrinsics: Vec<f64> },
}

/// Projection context shared by all residual evaluations of a run.
pub struct BaModel {
    pub mode: CameraMode,
    pub datum: Datum,
    pub num_cameras: usize,
}

impl BaModel {
    pub fn num_intrinsic_params(&self) -> usize {
        match &self.mode {
            CameraMode::Adjusted { .. } => 0,
            CameraMode::Pinhole { initial_intrinsics } => initial_intrinsics.len(),
        }
    }

    pub fn num_distortion_params(&self) -> usize {
        self.num_intrinsic_params()
            .saturating_sub(FOCAL_PARAMS_N + CENTER_PARAMS_N)
    }

    /// Project a world point through camera `icam` given raw extrinsic
    /// parameters and (for pinhole) intrinsic scales.
    pub fn project(
        &self,
        icam: usize,
        cam_params: &[f64],
        intr_scales: &[f64],
        xyz: &Vector3<f64>,
    ) -> Option<Vector2<f64>> {
        match &self.mode {
            CameraMode::Adjusted { bases } => project_adjusted(&bases[icam], cam_params, xyz),
            CameraMode::Pinhole { initial_intrinsics } => {
                let effective: Vec<f64> = initial_intrinsics
                    .iter()
                    .zip(intr_scales.iter())
                    .map(|(v, s)| v * s)
                    .collect();
                project_pinhole(cam_params, &effective, xyz)
            }
        }
    }
}

/// The three flat parameter arrays the solver owns during a pass.
#[derive(Debug, Clone, PartialEq)]
pub struct BaState {
    /// `num_cameras * CAMERA_PARAMS_N` extrinsic parameters
    pub cameras: Vec<f64>,
    /// Multiplicative intrinsic scales (empty in adjusted mode)
    pub intrinsics: Vec<f64>,
    /// `num_points * 3` geocentric coordinates
    pub points: Vec<f64>,
}

impl BaState {
    pub fn camera_block(&self, icam: usize) -> &[f64] {
        &self.cameras[icam * CAMERA_PARAMS_N..(icam + 1) * CAMERA_PARAMS_N]
    }

    pub fn point_block(&self, ipt: usize) -> &[f64] {
        &self.points[ipt * POINT_PARAMS_N..(ipt + 1) * POINT_PARAMS_N]
    }

    pub fn point(&self, ipt: usize) -> Vector3<f64> {
        let b = self.point_block(ipt);
        Vector3::new(b[0], b[1], b[2])
    }

    pub fn set_point(&mut self, ipt: usize, xyz: &Vector3<f64>) {
        let b = &mut self.points[ipt * POINT_PARAMS_N..(ipt + 1) * POINT_PARAMS_N];
        b[0] = xyz.x;
        b[1] = xyz.y;
        b[2] = xyz.z;
    }
}

/// A parameter block the residual graph can reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BlockId {
    Camera(usize),
    ScaleFocal,
    ScaleCenter,
    ScaleDistortion,
    Point(usize),
}

impl BlockId {
    pub fn dim(&self, model: &BaModel) -> usize {
        match self {
            BlockId::Camera(_) => CAMERA_PARAMS_N,
            BlockId::ScaleFocal => FOCAL_PARAMS_N,
            BlockId::ScaleCenter => CENTER_PARAMS_N,
            BlockId::ScaleDistortion => model.num_distortion_params(),
            BlockId::Point(_) => POINT_PARAMS_N,
        }
    }
}

/// One cost term of the graph.
#[derive(Debug, Clone)]
pub enum ResidualKind {
    Reprojection {
        camera: usize,
        point: usize,
        observed: Vector2<f64>,
        sigma: Vector2<f64>,
    },
    GcpXyz {
        point: usize,
        observed: Vector3<f64>,
        sigma: Vector3<f64>,
    },
    GcpLlh {
        point: usize,
        /// Anchor position as (lon, lat, height)
        observed_llh: Vector3<f64>,
        /// Sigmas in (lon, lat, height) order
        sigma: Vector3<f64>,
    },
    CameraPrior {
        camera: usize,
        original: [f64; CAMERA_PARAMS_N],
        weight: f64,
    },
    RotTransPrior {
        camera: usize,
        original: [f64; CAMERA_PARAMS_N],
        rotation_weight: f64,
        translation_weight: f64,
    },
    DisparityTerrain {
        left_camera: usize,
        right_camera: usize,
        pair: usize,
        xyz: Vector3<f64>,
    },
}

/// A residual block: its term, its residual rows, and the parameter blocks
/// it reads.
#[derive(Debug, Clone)]
pub struct ResidualBlockSpec {
    pub kind: ResidualKind,
    pub row: usize,
    pub dim: usize,
    pub blocks: Vec<BlockId>,
    /// Whether the run's robust loss applies (trivial loss otherwise)
    pub robust: bool,
}

/// Which intrinsic subgroups float when solving intrinsics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntrinsicsToFloat {
    pub focal_length: bool,
    pub optical_center: bool,
    pub distortion_params: bool,
}

impl IntrinsicsToFloat {
    /// All subgroups float when the list is empty, as in the original tool.
    pub fn all() -> Self {
        IntrinsicsToFloat {
            focal_length: true,
            optical_center: true,
            distortion_params: true,
        }
    }

    /// Parse a space-separated subgroup list.
    pub fn parse(text: &str) -> AdjustResult<Self> {
        if text.trim().is_empty() {
            return Ok(Self::all());
        }
        let mut out = IntrinsicsToFloat::default();
        for tok in text.split_whitespace() {
            match tok {
                "focal_length" => out.focal_length = true,
                "optical_center" => out.optical_center = true,
                "distortion_params" => out.distortion_params = true,
                other => {
                    return Err(AdjustError::Argument(format!(
                        "Unknown intrinsic subgroup: {other}"
                    )));
                }
            }
        }
        Ok(out)
    }
}

/// Options controlling what the builder emits.
#[derive(Clone)]
pub struct GraphOptions {
    pub loss: LossKind,
    pub robust_threshold: f64,
    pub overlap_exponent: f64,
    pub camera_weight: f64,
    pub rotation_weight: f64,
    pub translation_weight: f64,
    pub solve_intrinsics: bool,
    pub intrinsics_to_float: IntrinsicsToFloat,
    pub use_llh_error: bool,
    pub fix_gcp_xyz: bool,
    pub fixed_camera_indices: BTreeSet<usize>,
    pub heights_from_dem: Option<Arc<DemGrid>>,
    pub max_disp_error: f64,
}

impl Default for GraphOptions {
    fn default() -> Self {
        GraphOptions {
            loss: LossKind::Cauchy,
            robust_threshold: 0.5,
            overlap_exponent: 0.0,
            camera_weight: 0.0,
            rotation_weight: 0.0,
            translation_weight: 0.0,
            solve_intrinsics: false,
            intrinsics_to_float: IntrinsicsToFloat::all(),
            use_llh_error: false,
            fix_gcp_xyz: false,
            fixed_camera_indices: BTreeSet::new(),
            heights_from_dem: None,
            max_disp_error: -1.0,
        }
    }
}

/// Reference terrain inputs: geocentric points, one disparity per camera
/// pair, and the image extents for inside-the-image predicates.
pub struct TerrainConstraint {
    pub points: Vec<Vector3<f64>>,
    pub disparities: Vec<DisparityMap>,
    pub image_boxes: Vec<ImageBox>,
}

/// The assembled residual graph of one pass.
pub struct ResidualGraph {
    pub blocks: Vec<ResidualBlockSpec>,
    pub total_residuals: usize,
    pub constant: HashSet<BlockId>,
    pub cam_residual_counts: Vec<usize>,
    pub num_gcp_residuals: usize,
    /// Reference points accepted by the pre-optimisation predicates, in
    /// residual order (one entry per disparity-terrain block).
    pub reference_points: Vec<Vector3<f64>>,
    pub loss: LossKind,
    pub robust_threshold: f64,
    terrain: Option<Arc<TerrainConstraint>>,
}

/// Build the residual graph for one pass.
///
/// Points in `outliers` are skipped entirely: they contribute no residuals
/// and their blocks are never referenced, so the solver cannot move them.
/// The heights-from-DEM fixup mutates `state` in place before the blocks
/// referencing those points are emitted.
pub fn build_residual_graph(
    model: &BaModel,
    cnet: &ControlNetwork,
    state: &mut BaState,
    orig_cameras: &[f64],
    outliers: &BTreeSet<usize>,
    options: &GraphOptions,
    terrain: Option<Arc<TerrainConstraint>>,
) -> AdjustResult<ResidualGraph> {
    let num_cameras = model.num_cameras;
    let mut blocks = Vec::new();
    let mut constant: HashSet<BlockId> = HashSet::new();
    let mut row = 0usize;

    // Intrinsic scale blocks participate only when floating intrinsics.
    let mut intr_blocks: Vec<BlockId> = Vec::new();
    if options.solve_intrinsics {
        if model.num_intrinsic_params() == 0 {
            return Err(AdjustError::Argument(
                "Cannot solve intrinsics without pinhole cameras".to_string(),
            ));
        }
        intr_blocks.push(BlockId::ScaleFocal);
        intr_blocks.push(BlockId::ScaleCenter);
        if model.num_distortion_params() > 0 {
            intr_blocks.push(BlockId::ScaleDistortion);
        }
        let float = options.intrinsics_to_float;
        if !float.focal_length {
            constant.insert(BlockId::ScaleFocal);
        }
        if !float.optical_center {
            constant.insert(BlockId::ScaleCenter);
        }
        if !float.distortion_params {
            constant.insert(BlockId::ScaleDistortion);
        }
    }

    for &icam in &options.fixed_camera_indices {
        if icam >= num_cameras {
            return Err(AdjustError::Argument(format!(
                "The camera index to keep fixed {icam} is out of bounds"
            )));
        }
        constant.insert(BlockId::Camera(icam));
    }

    // Camera-major observation view, points in index order per camera.
    let mut cam_obs: Vec<Vec<(usize, usize)>> = vec![Vec::new(); num_cameras];
    for (ipt, point) in cnet.points.iter().enumerate() {
        for (iobs, obs) in point.observations.iter().enumerate() {
            if obs.camera >= num_cameras {
                return Err(AdjustError::Logic(format!(
                    "Observation references camera {} but only {} cameras exist",
                    obs.camera, num_cameras
                )));
            }
            cam_obs[obs.camera].push((ipt, iobs));
        }
    }

    // How many times each surviving point is observed (multi-view weighting).
    let mut obs_counts = vec![0usize; cnet.num_points()];
    if options.overlap_exponent > 0.0 {
        for (ipt, point) in cnet.points.iter().enumerate() {
            if !outliers.contains(&ipt) {
                obs_counts[ipt] = point.observations.len();
            }
        }
    }

    // 1. Reprojection residuals, camera-major.
    let mut cam_residual_counts = vec![0usize; num_cameras];
    let mut heights_done: HashSet<usize> = HashSet::new();
    for icam in 0..num_cameras {
        for &(ipt, iobs) in &cam_obs[icam] {
            if outliers.contains(&ipt) {
                continue;
            }
            let point = &cnet.points[ipt];
            let obs = &point.observations[iobs];

            let mut sigma = obs.sigma;
            if sigma.x.is_nan() || sigma.y.is_nan() {
                sigma = Vector2::new(1.0, 1.0);
            }
            let p = options.overlap_exponent;
            if p > 0.0 && obs_counts[ipt] > 1 {
                // Up-weight points seen in more images.
                sigma /= ((obs_counts[ipt] - 1) as f64).powf(p);
            }

            let mut spec_blocks = vec![BlockId::Camera(icam), BlockId::Point(ipt)];
            spec_blocks.extend_from_slice(&intr_blocks);
            blocks.push(ResidualBlockSpec {
                kind: ResidualKind::Reprojection {
                    camera: icam,
                    point: ipt,
                    observed: obs.pixel,
                    sigma,
                },
                row,
                dim: PIXEL_SIZE,
                blocks: spec_blocks,
                robust: true,
            });
            row += PIXEL_SIZE;
            cam_residual_counts[icam] += 1;

            if let Some(dem) = &options.heights_from_dem {
                // Non-GCP points take the DEM height and become constant:
                // the cameras must conform to them.
                if !point.is_gcp() && heights_done.insert(ipt) {
                    let mut llh = model.datum.cartesian_to_geodetic(&state.point(ipt));
                    if let Some(height) = dem.sample_lonlat(&Vector2::new(llh.x, llh.y)) {
                        llh.z = height;
                        let xyz = model.datum.geodetic_to_cartesian(&llh);
                        state.set_point(ipt, &xyz);
                    }
                    constant.insert(BlockId::Point(ipt));
                }
            }
        }
    }

    // 2. GCP anchors, point-index order.
    let mut num_gcp_residuals = 0usize;
    for (ipt, point) in cnet.points.iter().enumerate() {
        if !point.is_gcp() || outliers.contains(&ipt) {
            continue;
        }
        let kind = if options.use_llh_error {
            // The .gcp file carries sigmas as (lat, lon, height); the
            // geodetic residual works in (lon, lat, height).
            let sigma = Vector3::new(point.sigma.y, point.sigma.x, point.sigma.z);
            ResidualKind::GcpLlh {
                point: ipt,
                observed_llh: model.datum.cartesian_to_geodetic(&point.position),
                sigma,
            }
        } else {
            ResidualKind::GcpXyz {
                point: ipt,
                observed: point.position,
                sigma: point.sigma,
            }
        };
        blocks.push(ResidualBlockSpec {
            kind,
            row,
            dim: POINT_PARAMS_N,
            blocks: vec![BlockId::Point(ipt)],
            robust: false,
        });
        row += POINT_PARAMS_N;
        num_gcp_residuals += 1;
        if options.fix_gcp_xyz {
            constant.insert(BlockId::Point(ipt));
        }
    }

    // 3. Camera priors.
    if options.camera_weight > 0.0 {
        for icam in 0..num_cameras {
            let mut original = [0.0; CAMERA_PARAMS_N];
            original
                .copy_from_slice(&orig_cameras[icam * CAMERA_PARAMS_N..(icam + 1) * CAMERA_PARAMS_N]);
            blocks.push(ResidualBlockSpec {
                kind: ResidualKind::CameraPrior {
                    camera: icam,
                    original,
                    weight: options.camera_weight,
                },
                row,
                dim: CAMERA_PARAMS_N,
                blocks: vec![BlockId::Camera(icam)],
                robust: false,
            });
            row += CAMERA_PARAMS_N;
        }
    }

    // 4. Rotation/translation priors.
    if options.rotation_weight > 0.0 || options.translation_weight > 0.0 {
        for icam in 0..num_cameras {
            let mut original = [0.0; CAMERA_PARAMS_N];
            original
                .copy_from_slice(&orig_cameras[icam * CAMERA_PARAMS_N..(icam + 1) * CAMERA_PARAMS_N]);
            blocks.push(ResidualBlockSpec {
                kind: ResidualKind::RotTransPrior {
                    camera: icam,
                    original,
                    rotation_weight: options.rotation_weight,
                    translation_weight: options.translation_weight,
                },
                row,
                dim: CAMERA_PARAMS_N,
                blocks: vec![BlockId::Camera(icam)],
                robust: false,
            });
            row += CAMERA_PARAMS_N;
        }
    }

    // 5. Disparity-terrain residuals: even cameras pair with their
    // successor, one disparity raster per pair.
    let mut reference_points = Vec::new();
    if let Some(terrain) = &terrain {
        if num_cameras % 2 != 0 {
            return Err(AdjustError::Argument(
                "A reference terrain can only be used with an even number of cameras".to_string(),
            ));
        }
        if 2 * terrain.disparities.len() != num_cameras {
            return Err(AdjustError::Argument(
                "Expecting one disparity for each pair of images".to_string(),
            ));
        }
        if terrain.image_boxes.len() != num_cameras {
            return Err(AdjustError::Argument(
                "Expecting one image extent for each camera".to_string(),
            ));
        }
        if options.max_disp_error <= 0.0 {
            return Err(AdjustError::Argument(
                "Must specify --max-disp-error in pixels as a positive value".to_string(),
            ));
        }

        for xyz in &terrain.points {
            for pair in 0..num_cameras / 2 {
                let left = 2 * pair;
                let right = left + 1;

                let Some(left_pred) =
                    model.project(left, state.camera_block(left), &state.intrinsics, xyz)
                else {
                    continue;
                };
                if !terrain.image_boxes[left].contains(&left_pred) {
                    continue;
                }
                let Some(right_pred) =
                    model.project(right, state.camera_block(right), &state.intrinsics, xyz)
                else {
                    continue;
                };
                if !terrain.image_boxes[right].contains(&right_pred) {
                    continue;
                }
                let Some(disp) = terrain.disparities[pair].sample_pixel(&left_pred) else {
                    continue;
                };
                let transported = left_pred + disp;
                if !terrain.image_boxes[right].contains(&transported) {
                    continue;
                }
                if (transported - right_pred).norm() > options.max_disp_error {
                    // Too far from where it should be before optimisation.
                    continue;
                }

                reference_points.push(*xyz);
                let mut spec_blocks = vec![BlockId::Camera(left), BlockId::Camera(right)];
                spec_blocks.extend_from_slice(&intr_blocks);
                blocks.push(ResidualBlockSpec {
                    kind: ResidualKind::DisparityTerrain {
                        left_camera: left,
                        right_camera: right,
                        pair,
                        xyz: *xyz,
                    },
                    row,
                    dim: PIXEL_SIZE,
                    blocks: spec_blocks,
                    robust: true,
                });
                row += PIXEL_SIZE;
            }
        }
    }

    Ok(ResidualGraph {
        blocks,
        total_residuals: row,
        constant,
        cam_residual_counts,
        num_gcp_residuals,
        reference_points,
        loss: options.loss,
        robust_threshold: options.robust_threshold,
        terrain,
    })
}

/// A residual block linearised at the current state.
pub struct LinearizedBlock {
    pub row: usize,
    /// Loss-corrected residual
    pub residual: DVector<f64>,
    /// Loss-corrected Jacobians of the free blocks only
    pub jacobians: Vec<(BlockId, DMatrix<f64>)>,
    /// Robustified cost contribution `0.5 * rho(||r||^2)`
    pub cost: f64,
}

impl ResidualGraph {
    fn make_loss(&self) -> AdjustResult<Option<Box<dyn Loss>>> {
        self.loss.make(self.robust_threshold)
    }

    /// Evaluate one block's raw residual given explicit block values.
    ///
    /// `values[k]` holds the parameters of `spec.blocks[k]`; anything a term
    /// needs beyond its declared blocks (constant intrinsic scales, the
    /// terrain rasters) comes from `state` and the graph itself. Numerical
    /// failures evaluate to zero and are thereby dropped from the cost.
    fn evaluate_spec(
        &self,
        spec: &ResidualBlockSpec,
        model: &BaModel,
        state: &BaState,
        values: &[Vec<f64>],
    ) -> DVector<f64> {
        // Intrinsic scales: state values overridden by any scale blocks
        // this spec carries.
        let scales_for = |spec: &ResidualBlockSpec| -> Vec<f64> {
            let mut scales = state.intrinsics.clone();
            for (k, b) in spec.blocks.iter().enumerate() {
                match b {
                    BlockId::ScaleFocal => scales[0] = values[k][0],
                    BlockId::ScaleCenter => {
                        scales[1] = values[k][0];
                        scales[2] = values[k][1];
                    }
                    BlockId::ScaleDistortion => {
                        scales[FOCAL_PARAMS_N + CENTER_PARAMS_N..].copy_from_slice(&values[k]);
                    }
                    _ => {}
                }
            }
            scales
        };

        match &spec.kind {
            ResidualKind::Reprojection {
                camera,
                observed,
                sigma,
                ..
            } => {
                let cam = &values[0];
                let pt = &values[1];
                let xyz = Vector3::new(pt[0], pt[1], pt[2]);
                let scales = scales_for(spec);
                match model.project(*camera, cam, &scales, &xyz) {
                    Some(pred) => DVector::from_vec(vec![
                        (pred.x - observed.x) / sigma.x,
                        (pred.y - observed.y) / sigma.y,
                    ]),
                    None => DVector::zeros(PIXEL_SIZE),
                }
            }
            ResidualKind::GcpXyz {
                observed, sigma, ..
            } => {
                let pt = &values[0];
                DVector::from_vec(vec![
                    (pt[0] - observed.x) / sigma.x,
                    (pt[1] - observed.y) / sigma.y,
                    (pt[2] - observed.z) / sigma.z,
                ])
            }
            ResidualKind::GcpLlh {
                observed_llh,
                sigma,
                ..
            } => {
                let pt = &values[0];
                let llh = model
                    .datum
                    .cartesian_to_geodetic(&Vector3::new(pt[0], pt[1], pt[2]));
                DVector::from_vec(vec![
                    (llh.x - observed_llh.x) / sigma.x,
                    (llh.y - observed_llh.y) / sigma.y,
                    (llh.z - observed_llh.z) / sigma.z,
                ])
            }
            ResidualKind::CameraPrior {
                original, weight, ..
            } => {
                let cam = &values[0];
                DVector::from_iterator(
                    CAMERA_PARAMS_N,
                    (0..CAMERA_PARAMS_N).map(|q| weight * (cam[q] - original[q])),
                )
            }
            ResidualKind::RotTransPrior {
                original,
                rotation_weight,
                translation_weight,
                ..
            } => {
                let cam = &values[0];
                let half = CAMERA_PARAMS_N / 2;
                DVector::from_iterator(
                    CAMERA_PARAMS_N,
                    (0..CAMERA_PARAMS_N).map(|q| {
                        let w = if q < half {
                            translation_weight
                        } else {
                            rotation_weight
                        };
                        w * (cam[q] - original[q])
                    }),
                )
            }
            ResidualKind::DisparityTerrain {
                left_camera,
                right_camera,
                pair,
                xyz,
            } => {
                let Some(terrain) = &self.terrain else {
                    return DVector::zeros(PIXEL_SIZE);
                };
                let scales = scales_for(spec);
                let Some(left_pred) = model.project(*left_camera, &values[0], &scales, xyz) else {
                    return DVector::zeros(PIXEL_SIZE);
                };
                let Some(disp) = terrain.disparities[*pair].sample_pixel(&left_pred) else {
                    return DVector::zeros(PIXEL_SIZE);
                };
                let Some(right_pred) = model.project(*right_camera, &values[1], &scales, xyz)
                else {
                    return DVector::zeros(PIXEL_SIZE);
                };
                let transported = left_pred + disp;
                DVector::from_vec(vec![
                    right_pred.x - transported.x,
                    right_pred.y - transported.y,
                ])
            }
        }
    }

    fn block_values(&self, spec: &ResidualBlockSpec, state: &BaState) -> Vec<Vec<f64>> {
        spec.blocks
            .iter()
            .map(|b| match b {
                BlockId::Camera(icam) => state.camera_block(*icam).to_vec(),
                BlockId::Point(ipt) => state.point_block(*ipt).to_vec(),
                BlockId::ScaleFocal => state.intrinsics[..FOCAL_PARAMS_N].to_vec(),
                BlockId::ScaleCenter => {
                    state.intrinsics[FOCAL_PARAMS_N..FOCAL_PARAMS_N + CENTER_PARAMS_N].to_vec()
                }
                BlockId::ScaleDistortion => {
                    state.intrinsics[FOCAL_PARAMS_N + CENTER_PARAMS_N..].to_vec()
                }
            })
            .collect()
    }

    /// Raw (loss-free) residual of one block at the current state.
    pub fn evaluate_block(
        &self,
        spec: &ResidualBlockSpec,
        model: &BaModel,
        state: &BaState,
    ) -> DVector<f64> {
        let values = self.block_values(spec, state);
        self.evaluate_spec(spec, model, state, &values)
    }

    /// Evaluate the full residual vector in insertion order.
    ///
    /// With `apply_loss` the robust blocks are rescaled by the corrector, as
    /// the solver sees them; without it the raw reprojection pixels come
    /// back, which is what outlier statistics need.
    pub fn evaluate_residuals(
        &self,
        model: &BaModel,
        state: &BaState,
        apply_loss: bool,
    ) -> AdjustResult<Vec<f64>> {
        let loss = self.make_loss()?;
        let pieces: Vec<(usize, DVector<f64>)> = self
            .blocks
            .par_iter()
            .map(|spec| {
                let mut r = self.evaluate_block(spec, model, state);
                if apply_loss && spec.robust {
                    if let Some(loss) = &loss {
                        let s = r.norm_squared();
                        let corrector = Corrector::new(s, &loss.evaluate(s));
                        corrector.correct_residuals(&mut r);
                    }
                }
                (spec.row, r)
            })
            .collect();

        let mut residuals = vec![0.0; self.total_residuals];
        for (row, r) in pieces {
            residuals[row..row + r.len()].copy_from_slice(r.as_slice());
        }
        Ok(residuals)
    }

    /// Robustified total cost `0.5 * sum rho(||r||^2)` at the current state.
    pub fn evaluate_cost(&self, model: &BaModel, state: &BaState) -> AdjustResult<f64> {
        let loss = self.make_loss()?;
        Ok(self
            .blocks
            .par_iter()
            .map(|spec| {
                let r = self.evaluate_block(spec, model, state);
                let s = r.norm_squared();
                if spec.robust {
                    if let Some(loss) = &loss {
                        return 0.5 * loss.evaluate(s)[0];
                    }
                }
                0.5 * s
            })
            .sum())
    }

    /// Linearise every block at the current state: corrected residuals and
    /// central-difference Jacobians of the free parameter blocks.
    pub fn linearize(&self, model: &BaModel, state: &BaState) -> AdjustResult<Vec<LinearizedBlock>> {
        let loss = self.make_loss()?;
        Ok(self
            .blocks
            .par_iter()
            .map(|spec| {
                let mut values = self.block_values(spec, state);
                let mut residual = self.evaluate_spec(spec, model, state, &values);

                let mut jacobians = Vec::new();
                for (k, block) in spec.blocks.iter().enumerate() {
                    if self.constant.contains(block) {
                        continue;
                    }
                    let bdim = block.dim(model);
                    let mut jac = DMatrix::zeros(spec.dim, bdim);
                    for q in 0..bdim {
                        let x = values[k][q];
                        let h = NUMERIC_DIFF_STEP * x.abs().max(1.0);
                        values[k][q] = x + h;
                        let plus = self.evaluate_spec(spec, model, state, &values);
                        values[k][q] = x - h;
                        let minus = self.evaluate_spec(spec, model, state, &values);
                        values[k][q] = x;
                        let col = (plus - minus) / (2.0 * h);
                        jac.set_column(q, &col);
                    }
                    jacobians.push((*block, jac));
                }

                let s = residual.norm_squared();
                let mut cost = 0.5 * s;
                if spec.robust {
                    if let Some(loss) = &loss {
                        let rho = loss.evaluate(s);
                        cost = 0.5 * rho[0];
                        let corrector = Corrector::new(s, &rho);
                        for (_, jac) in jacobians.iter_mut() {
                            corrector.correct_jacobian(&residual, jac);
                        }
                        corrector.correct_residuals(&mut residual);
                    }
                }

                LinearizedBlock {
                    row: spec.row,
                    residual,
                    jacobians,
                    cost,
                }
            })
            .collect())
    }

    /// Check the residual vector length against the counts the builder
    /// recorded; a mismatch is a logic-invariant violation.
    pub fn verify_residual_count(&self, num_residuals: usize) -> AdjustResult<()> {
        let mut expected = self.num_gcp_residuals * POINT_PARAMS_N;
        for &count in &self.cam_residual_counts {
            expected += count * PIXEL_SIZE;
        }
        let num_cameras = self.cam_residual_counts.len();
        let has_camera_prior = self
            .blocks
            .iter()
            .any(|b| matches!(b.kind, ResidualKind::CameraPrior { .. }));
        let has_rot_trans = self
            .blocks
            .iter()
            .any(|b| matches!(b.kind, ResidualKind::RotTransPrior { .. }));
        if has_camera_prior {
            expected += num_cameras * CAMERA_PARAMS_N;
        }
        if has_rot_trans {
            expected += num_cameras * CAMERA_PARAMS_N;
        }
        expected += self.reference_points.len() * PIXEL_SIZE;

        if expected != num_residuals {
            return Err(AdjustError::Logic(format!(
                "Expected {expected} residuals but instead got {num_residuals}"
            )));
        }
        Ok(())
    }
}
