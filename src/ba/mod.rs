//! Bundle adjustment core: residual graph, robust losses, solver driver,
//! and the multi-pass outlier rejection loop.

pub mod graph;
pub mod loss;
pub mod outliers;
pub mod run;
pub mod schur;
pub mod solver;

pub use graph::{
    BaModel, BaState, CameraMode, GraphOptions, IntrinsicsToFloat, ResidualGraph,
    TerrainConstraint, build_residual_graph,
};
pub use loss::LossKind;
pub use outliers::{RemoveOutliersByDispParams, RemoveOutliersParams, find_outlier_brackets};
pub use schur::{LinearSolverKind, select_linear_solver};
pub use solver::{SolveStatus, SolveSummary, SolverOptions, solve_pass};
