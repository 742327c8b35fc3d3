//! The nonlinear solver driver: Levenberg-Marquardt over the residual graph.
//!
//! The driver owns the three parameter arrays for the duration of a pass.
//! Each iteration linearises the graph, assembles the eliminated normal
//! equations, and tries damped steps until one reduces the robustified
//! cost. Damping follows the step-quality rule: good steps shrink it by up
//! to a factor of three, rejected steps double it.
//!
//! Running out of iterations is not a failure: the driver reports it as a
//! valid solution that did not reach the minimum, matching how the rest of
//! the pipeline treats non-convergence.

use std::fmt;
use std::time::Instant;

use nalgebra::{DVector, Vector3};

use crate::error::{AdjustError, AdjustResult};

use super::graph::{BaModel, BaState, BlockId, ResidualGraph};
use super::schur::{BlockLayout, LinearSolverKind, SchurSystem, build_layout, select_linear_solver};

/// Solver configuration derived from the problem size and user flags.
#[derive(Debug, Clone)]
pub struct SolverOptions {
    pub linear_solver: LinearSolverKind,
    pub gradient_tolerance: f64,
    pub function_tolerance: f64,
    pub parameter_tolerance: f64,
    pub max_iterations: usize,
    pub max_consecutive_invalid_steps: usize,
    pub num_threads: usize,
}

impl SolverOptions {
    /// Build the options the way the pass loop does: tight gradient and
    /// function tolerances, solver strategy from the camera count, and an
    /// invalid-step allowance that scales with the iteration budget.
    pub fn from_problem_size(
        num_cameras: usize,
        max_iterations: usize,
        parameter_tolerance: f64,
        num_threads: usize,
    ) -> Self {
        SolverOptions {
            linear_solver: select_linear_solver(num_cameras),
            gradient_tolerance: 1e-16,
            function_tolerance: 1e-16,
            parameter_tolerance,
            max_iterations,
            max_consecutive_invalid_steps: 5.max(max_iterations / 5),
            // 0 lets the pool pick the hardware default.
            num_threads,
        }
    }
}

/// How a solve ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SolveStatus {
    GradientToleranceReached,
    FunctionToleranceReached,
    ParameterToleranceReached,
    /// Iteration budget exhausted; the solution is valid but not a minimum.
    NoConvergence,
    NumericalFailure,
}

impl SolveStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, SolveStatus::NumericalFailure)
    }
}

impl fmt::Display for SolveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolveStatus::GradientToleranceReached => write!(f, "Gradient tolerance reached"),
            SolveStatus::FunctionToleranceReached => write!(f, "Function tolerance reached"),
            SolveStatus::ParameterToleranceReached => write!(f, "Parameter tolerance reached"),
            SolveStatus::NoConvergence => write!(f, "Maximum iterations reached"),
            SolveStatus::NumericalFailure => write!(f, "Numerical failure"),
        }
    }
}

/// Statistics of one solve.
#[derive(Debug, Clone)]
pub struct SolveSummary {
    pub status: SolveStatus,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub iterations: usize,
    pub successful_steps: usize,
    pub unsuccessful_steps: usize,
    pub final_gradient_norm: f64,
    pub elapsed: std::time::Duration,
}

impl fmt::Display for SolveSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Initial cost:       {:.6e}", self.initial_cost)?;
        writeln!(f, "Final cost:         {:.6e}", self.final_cost)?;
        writeln!(f, "Iterations:         {}", self.iterations)?;
        writeln!(
            f,
            "Steps:              {} successful, {} unsuccessful",
            self.successful_steps, self.unsuccessful_steps
        )?;
        writeln!(f, "Final gradient:     {:.6e}", self.final_gradient_norm)?;
        writeln!(f, "Termination:        {}", self.status)?;
        write!(f, "Time:               {:?}", self.elapsed)
    }
}

fn apply_step(state: &mut BaState, layout: &BlockLayout, dc: &DVector<f64>, dp: &[Vector3<f64>]) {
    for info in &layout.cam_blocks {
        let seg = dc.rows(info.offset, info.dim);
        match info.id {
            BlockId::Camera(icam) => {
                let base = icam * crate::camera::CAMERA_PARAMS_N;
                for q in 0..info.dim {
                    state.cameras[base + q] += seg[q];
                }
            }
            BlockId::ScaleFocal => state.intrinsics[0] += seg[0],
            BlockId::ScaleCenter => {
                state.intrinsics[1] += seg[0];
                state.intrinsics[2] += seg[1];
            }
            BlockId::ScaleDistortion => {
                let start = state.intrinsics.len() - info.dim;
                for q in 0..info.dim {
                    state.intrinsics[start + q] += seg[q];
                }
            }
            BlockId::Point(_) => unreachable!("points are eliminated, not camera-group blocks"),
        }
    }
    for (slot, &ipt) in layout.points.iter().enumerate() {
        let base = ipt * super::graph::POINT_PARAMS_N;
        state.points[base] += dp[slot].x;
        state.points[base + 1] += dp[slot].y;
        state.points[base + 2] += dp[slot].z;
    }
}

fn active_param_norm(state: &BaState, layout: &BlockLayout) -> f64 {
    let mut sq = 0.0;
    for info in &layout.cam_blocks {
        match info.id {
            BlockId::Camera(icam) => {
                for v in state.camera_block(icam) {
                    sq += v * v;
                }
            }
            BlockId::ScaleFocal | BlockId::ScaleCenter | BlockId::ScaleDistortion => {}
            BlockId::Point(_) => {}
        }
    }
    for v in &state.intrinsics {
        sq += v * v;
    }
    for &ipt in &layout.points {
        for v in state.point_block(ipt) {
            sq += v * v;
        }
    }
    sq.sqrt()
}

/// Run Levenberg-Marquardt on the graph, mutating `state` in place.
pub fn solve_pass(
    graph: &ResidualGraph,
    model: &BaModel,
    state: &mut BaState,
    options: &SolverOptions,
) -> AdjustResult<SolveSummary> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.num_threads)
        .build()
        .map_err(|e| AdjustError::Solver(format!("Failed to build thread pool: {e}")))?;
    pool.install(|| solve_inner(graph, model, state, options))
}

fn solve_inner(
    graph: &ResidualGraph,
    model: &BaModel,
    state: &mut BaState,
    options: &SolverOptions,
) -> AdjustResult<SolveSummary> {
    const DAMPING_INITIAL: f64 = 1e-4;
    const DAMPING_MIN: f64 = 1e-12;
    const DAMPING_MAX: f64 = 1e12;

    let start = Instant::now();
    let layout = build_layout(graph, model);
    let initial_cost = graph.evaluate_cost(model, state)?;

    let mut summary = SolveSummary {
        status: SolveStatus::NoConvergence,
        initial_cost,
        final_cost: initial_cost,
        iterations: 0,
        successful_steps: 0,
        unsuccessful_steps: 0,
        final_gradient_norm: f64::NAN,
        elapsed: start.elapsed(),
    };

    if graph.blocks.is_empty() || (layout.cam_dim == 0 && layout.points.is_empty()) {
        // Nothing to optimise; report the evaluation as converged.
        summary.status = SolveStatus::FunctionToleranceReached;
        summary.elapsed = start.elapsed();
        return Ok(summary);
    }

    let mut cost = initial_cost;
    let mut damping = DAMPING_INITIAL;
    let mut invalid_streak = 0usize;

    'outer: for iteration in 0..options.max_iterations {
        summary.iterations = iteration + 1;

        let linearized = graph.linearize(model, state)?;
        let system = SchurSystem::assemble(&layout, &linearized);
        let gradient_norm = system.gradient_max_norm();
        summary.final_gradient_norm = gradient_norm;
        if gradient_norm < options.gradient_tolerance {
            summary.status = SolveStatus::GradientToleranceReached;
            break;
        }

        // Try damped steps against this linearisation until one is accepted
        // or the damping runs out of room.
        loop {
            let Some((dc, dp)) = system.solve(damping, options.linear_solver) else {
                summary.unsuccessful_steps += 1;
                invalid_streak += 1;
                damping = (damping * 10.0).min(DAMPING_MAX);
                if invalid_streak > options.max_consecutive_invalid_steps {
                    summary.status = SolveStatus::NumericalFailure;
                    break 'outer;
                }
                continue;
            };

            let mut candidate = state.clone();
            apply_step(&mut candidate, &layout, &dc, &dp);
            let new_cost = graph.evaluate_cost(model, &candidate)?;

            if !new_cost.is_finite() {
                summary.unsuccessful_steps += 1;
                invalid_streak += 1;
                damping = (damping * 10.0).min(DAMPING_MAX);
                if invalid_streak > options.max_consecutive_invalid_steps {
                    summary.status = SolveStatus::NumericalFailure;
                    break 'outer;
                }
                continue;
            }

            // Step quality: actual vs. model-predicted reduction.
            let (h_dc, h_dp) = system.apply_hessian(&dc, &dp);
            let mut quad = h_dc.dot(&dc);
            for (h, d) in h_dp.iter().zip(dp.iter()) {
                quad += h.dot(d);
            }
            let predicted = -system.gradient_dot(&dc, &dp) - 0.5 * quad;
            let rho = if predicted.abs() < 1e-15 {
                if cost - new_cost > 0.0 { 1.0 } else { 0.0 }
            } else {
                (cost - new_cost) / predicted
            };

            if rho > 0.0 && new_cost < cost {
                let cost_change = cost - new_cost;
                *state = candidate;
                cost = new_cost;
                summary.successful_steps += 1;
                invalid_streak = 0;

                let tmp = 2.0 * rho - 1.0;
                damping *= (1.0_f64 / 3.0).max(1.0 - tmp * tmp * tmp);
                damping = damping.max(DAMPING_MIN);

                let mut step_sq = dc.norm_squared();
                for d in &dp {
                    step_sq += d.norm_squared();
                }
                let step_norm = step_sq.sqrt();
                let x_norm = active_param_norm(state, &layout);

                if cost_change <= options.function_tolerance * cost.max(f64::MIN_POSITIVE) {
                    summary.status = SolveStatus::FunctionToleranceReached;
                    break 'outer;
                }
                if step_norm
                    <= options.parameter_tolerance * (x_norm + options.parameter_tolerance)
                {
                    summary.status = SolveStatus::ParameterToleranceReached;
                    break 'outer;
                }
                break;
            }

            summary.unsuccessful_steps += 1;
            damping *= 2.0;
            if damping >= DAMPING_MAX {
                // No downhill direction left at maximum damping.
                summary.status = SolveStatus::NoConvergence;
                break 'outer;
            }
        }
    }

    summary.final_cost = cost;
    summary.elapsed = start.elapsed();
    Ok(summary)
}
