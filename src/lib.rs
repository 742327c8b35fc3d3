//! # Apogee Adjust
//!
//! A Rust library for photogrammetric bundle adjustment: the joint nonlinear
//! refinement of camera extrinsics (and optionally shared pinhole intrinsics)
//! together with the 3D coordinates of tie points, given 2D image
//! observations, optional ground control points, and optional constraints
//! tying the solution to a reference terrain through stereo disparities.
//!
//! ## Features
//!
//! - **Heterogeneous residual graph**: reprojection terms with per-observation
//!   robust losses, soft camera priors, GCP anchors, and disparity-terrain
//!   constraints over per-camera, shared-intrinsic and per-point blocks
//! - **Size-aware linear solvers**: dense, sparse and iterative (explicit or
//!   implicit) Schur-complement solvers selected from the camera count
//! - **Multi-pass outlier rejection**: percentile-bracket rejection that
//!   re-linearises between passes while never touching GCPs
//! - **Rigid initial alignment**: closed-form similarity fit from estimated
//!   camera positions or GCP triangulations
//!
//! ## Modules
//!
//! - [`geodesy`]: datum and geodetic/Cartesian conversions
//! - [`dem`]: interpolated DEM and disparity rasters
//! - [`camera`]: the camera model abstraction (adjusted and pinhole variants)
//! - [`cnet`]: the control network of tie points and observations
//! - [`ba`]: residual graph, robust losses, solver driver, outlier loop
//! - [`align`]: rigid-alignment initialiser
//! - [`report`]: residual logs, point maps, KML output
//! - [`transfer`]: map-projection match transfer utilities

pub mod align;
pub mod ba;
pub mod camera;
pub mod cnet;
pub mod dem;
pub mod error;
pub mod geodesy;
pub mod logger;
pub mod report;
pub mod transfer;

pub use ba::run::{RunConfig, RunOutcome, run_bundle_adjust};
pub use error::{AdjustError, AdjustResult};
pub use logger::init_logger;
