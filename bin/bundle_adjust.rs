//! Bundle Adjustment Binary
//!
//! Jointly refines camera models and triangulated tie points from binary
//! match files, optional ground control points, and optional reference
//! terrain constraints.
//!
//! # Usage
//! ```bash
//! # Two images with pinhole cameras and a GCP file
//! bundle_adjust left.tif right.tif left.tsai right.tsai points.gcp \
//!     -o run/out --datum WGS_1984 --create-pinhole-cameras
//!
//! # Multi-pass outlier rejection with a Huber loss
//! bundle_adjust *.tif *.tsai -o run/out \
//!     --cost-function huber --num-passes 3 \
//!     --remove-outliers-params "75.0 3.0 2.0 3.0"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use nalgebra::{Vector2, Vector3};
use tracing::{error, info, warn};

use apogee_adjust::align::{
    CsvFormat, check_gcp_dists, init_cameras_from_gcp, init_cameras_from_positions,
    load_estimated_camera_positions,
};
use apogee_adjust::ba::{GraphOptions, IntrinsicsToFloat, LossKind, TerrainConstraint};
use apogee_adjust::ba::run::{RunConfig, run_bundle_adjust};
use apogee_adjust::camera::adjusted::AdjustedCamera;
use apogee_adjust::camera::pinhole::PinholeCamera;
use apogee_adjust::camera::{BaCamera, ImageBox, Similarity};
use apogee_adjust::cnet::matches::match_filename;
use apogee_adjust::cnet::{
    TriangulationFilter, add_ground_control_points, build_control_network, save_cnet_as_csv,
};
use apogee_adjust::dem::{DemGrid, DisparityMap, GeoTransform};
use apogee_adjust::error::{AdjustError, AdjustResult};
use apogee_adjust::geodesy::Datum;
use apogee_adjust::init_logger;
use apogee_adjust::transfer;

/// Bundle adjustment over images, cameras, and optional ground control
#[derive(Parser)]
#[command(name = "bundle_adjust")]
#[command(about = "Bundle adjustment over images, cameras, and ground control points")]
struct Args {
    /// Input images, cameras, and optional .gcp files, intermixed
    #[arg(value_name = "FILES", required = true)]
    input_files: Vec<PathBuf>,

    /// Prefix for output filenames
    #[arg(short = 'o', long, value_name = "PREFIX")]
    output_prefix: String,

    /// Solver family: ceres, robustsparse, robustref, sparse, ref
    #[arg(long, default_value = "ceres")]
    bundle_adjuster: String,

    /// Robust cost function: cauchy, pseudohuber, huber, l1, l2
    #[arg(long, default_value = "cauchy")]
    cost_function: String,

    /// Threshold for the robust cost functions
    #[arg(long, default_value_t = 0.5)]
    robust_threshold: f64,

    /// Weight tying cameras to their input values
    #[arg(long, default_value_t = 1.0)]
    camera_weight: f64,

    /// Weight penalizing rotation away from the input values
    #[arg(long, default_value_t = 0.0)]
    rotation_weight: f64,

    /// Weight penalizing translation away from the input values
    #[arg(long, default_value_t = 0.0)]
    translation_weight: f64,

    /// Weight multi-view points with (n-1)^exponent
    #[arg(long, default_value_t = 0.0)]
    overlap_exponent: f64,

    /// Match each image only against this many subsequent ones (0 = all)
    #[arg(long, default_value_t = 0)]
    overlap_limit: usize,

    /// File listing image pairs expected to overlap, one pair per line
    #[arg(long)]
    overlap_list: Option<PathBuf>,

    /// Number of bundle adjustment passes (outliers removed between passes)
    #[arg(long, default_value_t = 1)]
    num_passes: usize,

    /// Outlier thresholds: "pct factor err1 err2"
    #[arg(long, default_value = "75.0 3.0 2.0 3.0", value_name = "'pct factor err1 err2'")]
    remove_outliers_params: String,

    /// Disparity-bracket outlier thresholds: "pct factor"
    #[arg(long, default_value = "90.0 3.0", value_name = "'pct factor'")]
    remove_outliers_by_disparity_params: String,

    /// Minimum matches per image pair
    #[arg(long, default_value_t = 30)]
    min_matches: usize,

    /// Minimum ray angle (degrees) for valid triangulation
    #[arg(long, default_value_t = 0.1)]
    min_triangulation_angle: f64,

    /// Datum: WGS_1984, D_MOON, D_MARS, MOLA, NAD83, WGS72, NAD27
    #[arg(long)]
    datum: Option<String>,

    /// Explicit datum semi-major axis in meters
    #[arg(long, default_value_t = 0.0)]
    semi_major_axis: f64,

    /// Explicit datum semi-minor axis in meters
    #[arg(long, default_value_t = 0.0)]
    semi_minor_axis: f64,

    /// Apply adjustments directly to pinhole cameras, writing .tsai files
    #[arg(long)]
    create_pinhole_cameras: bool,

    /// Optimize intrinsic camera parameters (pinhole only)
    #[arg(long)]
    solve_intrinsics: bool,

    /// Subset of intrinsics to float: focal_length, optical_center,
    /// distortion_params
    #[arg(long, default_value = "")]
    intrinsics_to_float: String,

    /// CSV file with estimated camera positions
    #[arg(long)]
    camera_positions: Option<PathBuf>,

    /// Column layout of input CSV files, e.g. "1:file 2:lat 3:lon
    /// 4:height_above_datum"
    #[arg(long, default_value = "")]
    csv_format: String,

    /// PROJ.4 string for projected CSV input (not supported)
    #[arg(long, default_value = "")]
    csv_proj4: String,

    /// 4x4 rotation + translation transform applied before optimization
    #[arg(long)]
    initial_transform: Option<PathBuf>,

    /// Prefix to read initial .adjust files from
    #[arg(long)]
    input_adjustments_prefix: Option<String>,

    /// Reference terrain (ESRI ASCII DEM or CSV) constraining intrinsics
    #[arg(long)]
    reference_terrain: Option<PathBuf>,

    /// Disparity files, one per camera pair, space separated
    #[arg(long, default_value = "")]
    disparity_list: String,

    /// Maximum disparity-transport error in pixels for reference points
    #[arg(long, default_value_t = -1.0)]
    max_disp_error: f64,

    /// Maximum number of reference terrain points to use
    #[arg(long, default_value_t = 100_000_000)]
    max_num_reference_points: usize,

    /// Image extent "width height" shared by all images (reference terrain)
    #[arg(long, default_value = "")]
    image_size: String,

    /// Do not float highly accurate GCPs
    #[arg(long)]
    fix_gcp_xyz: bool,

    /// Interpret GCP sigmas as lat/lon/height rather than x/y/z
    #[arg(long)]
    use_lon_lat_height_gcp_error: bool,

    /// Indices of cameras to keep fixed, space separated
    #[arg(long, default_value = "")]
    fixed_camera_indices: String,

    /// Maximum number of solver iterations
    #[arg(long, default_value_t = 1000)]
    max_iterations: usize,

    /// Smaller values yield more iterations
    #[arg(long, default_value_t = 1e-8)]
    parameter_tolerance: f64,

    /// Solver threads (0 = hardware default)
    #[arg(long, default_value_t = 0)]
    num_threads: usize,

    /// Stereo session type; "isis" forces single-threaded evaluation
    #[arg(short = 't', long, default_value = "")]
    session_type: String,

    /// Save the control network in the GCP text format
    #[arg(long)]
    save_cnet_as_csv: bool,

    /// Expected elevation range "min max" for triangulated points
    #[arg(long, default_value = "")]
    elevation_limit: String,

    /// Lon-lat box "lon_min lat_min lon_max lat_max" for triangulated points
    #[arg(long, default_value = "")]
    lon_lat_limit: String,

    /// Skip matching cameras farther apart than this distance in meters
    #[arg(long, default_value_t = -1.0)]
    position_filter_dist: f64,

    /// Map-projected images plus their DEM, for match transfer
    #[arg(long, default_value = "")]
    mapprojected_data: String,

    /// Map-projected images plus their DEM, for GCP creation
    #[arg(long, default_value = "")]
    gcp_data: String,

    /// Replace tie-point heights with this DEM's and fix them
    #[arg(long)]
    heights_from_dem: Option<PathBuf>,
}

fn parse_floats(text: &str, expected: usize, what: &str) -> AdjustResult<Vec<f64>> {
    let vals: Vec<f64> = text
        .split_whitespace()
        .map(|t| t.parse::<f64>())
        .collect::<Result<_, _>>()
        .map_err(|e| AdjustError::Argument(format!("Malformed {what}: {e}")))?;
    if vals.len() != expected {
        return Err(AdjustError::Argument(format!(
            "Expected {expected} values for {what}, got {}",
            vals.len()
        )));
    }
    Ok(vals)
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .map(|e| e.eq_ignore_ascii_case(ext))
        .unwrap_or(false)
}

/// Split the positional inputs into images, cameras, and GCP files.
fn separate_inputs(inputs: &[PathBuf]) -> (Vec<PathBuf>, Vec<PathBuf>, Vec<PathBuf>) {
    let mut images = Vec::new();
    let mut cameras = Vec::new();
    let mut gcps = Vec::new();
    for input in inputs {
        if has_extension(input, "gcp") {
            gcps.push(input.clone());
        } else if has_extension(input, "tsai") {
            cameras.push(input.clone());
        } else {
            images.push(input.clone());
        }
    }
    (images, cameras, gcps)
}

fn resolve_datum(args: &Args, gcp_files: &[PathBuf]) -> AdjustResult<Datum> {
    if let Some(name) = &args.datum {
        let datum = Datum::well_known(name)?;
        info!("Will use datum: {datum}");
        return Ok(datum);
    }
    if args.semi_major_axis > 0.0 && args.semi_minor_axis > 0.0 {
        let datum = Datum::from_semi_axes(
            "User Specified Datum",
            args.semi_major_axis,
            args.semi_minor_axis,
        )?;
        info!("Will use datum: {datum}");
        return Ok(datum);
    }
    if !gcp_files.is_empty() || args.camera_positions.is_some() {
        return Err(AdjustError::Argument(
            "When ground control points or a camera position file are used, the datum must be specified".to_string(),
        ));
    }
    Ok(Datum::default())
}

/// Load the per-image cameras: pinhole models applied directly, or base
/// sensors wrapped in zero adjustments.
fn load_cameras(
    image_files: &[PathBuf],
    camera_files: &[PathBuf],
    args: &Args,
) -> AdjustResult<Vec<BaCamera>> {
    let mut cameras = Vec::with_capacity(image_files.len());
    for (icam, camera_file) in camera_files.iter().enumerate() {
        let pinhole = PinholeCamera::read_tsai(camera_file)?;
        if args.create_pinhole_cameras {
            cameras.push(BaCamera::Pinhole(pinhole));
        } else {
            let mut adjusted = AdjustedCamera::new(Arc::new(pinhole));
            if let Some(prefix) = &args.input_adjustments_prefix {
                let path = apogee_adjust::ba::run::bundle_adjust_file_name(
                    prefix,
                    &image_files[icam],
                    camera_file,
                    "adjust",
                );
                adjusted.read_adjust(&path)?;
            }
            cameras.push(BaCamera::Adjusted(adjusted));
        }
    }
    Ok(cameras)
}

/// Parse a "img1 img2 ... dem" list and load the georefs and the DEM.
fn load_mapprojected_inputs(
    list: &str,
) -> AdjustResult<(Vec<PathBuf>, Vec<GeoTransform>, PathBuf, DemGrid)> {
    let mut files: Vec<PathBuf> = list.split_whitespace().map(PathBuf::from).collect();
    let Some(dem_file) = files.pop() else {
        return Err(AdjustError::Argument(
            "Expecting map-projected images followed by a DEM".to_string(),
        ));
    };
    let dem = DemGrid::read_esri_ascii(&dem_file)?;
    let mut georefs = Vec::with_capacity(files.len());
    for file in &files {
        // Georeference sidecar: "<image>.geo" with "x0 dx y0 dy".
        let geo_path = PathBuf::from(format!("{}.geo", file.display()));
        info!("Reading georef from {}", geo_path.display());
        georefs.push(GeoTransform::read_from_file(&geo_path)?);
    }
    Ok((files, georefs, dem_file, dem))
}

/// Load the reference terrain points, capped and optionally box-filtered.
fn load_reference_terrain(
    path: &Path,
    args: &Args,
    datum: &Datum,
    csv_format: Option<&CsvFormat>,
    lon_lat_limit: Option<(f64, f64, f64, f64)>,
) -> AdjustResult<Vec<Vector3<f64>>> {
    info!(
        "Loading at most {} points from {}",
        args.max_num_reference_points,
        path.display()
    );
    let mut points = Vec::new();
    if has_extension(path, "csv") {
        let format = csv_format.ok_or_else(|| {
            AdjustError::Argument(
                "When using a csv reference terrain, must specify the csv-format".to_string(),
            )
        })?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .comment(Some(b'#'))
            .from_path(path)?;
        for record in reader.records() {
            let record = record?;
            points.push(format.record_to_cartesian(&record, datum)?);
        }
    } else {
        let dem = DemGrid::read_esri_ascii(path)?;
        for row in 0..dem.rows() {
            for col in 0..dem.cols() {
                let pix = Vector2::new(col as f64, row as f64);
                let Some(height) = dem.sample_pixel(&pix) else {
                    continue;
                };
                let ll = dem.georef().pixel_to_lonlat(&pix);
                points.push(datum.geodetic_to_cartesian(&Vector3::new(ll.x, ll.y, height)));
            }
        }
    }

    if let Some((lon0, lat0, lon1, lat1)) = lon_lat_limit {
        points.retain(|xyz| {
            let llh = datum.cartesian_to_geodetic(xyz);
            llh.x >= lon0 && llh.x <= lon1 && llh.y >= lat0 && llh.y <= lat1
        });
    }

    if points.len() > args.max_num_reference_points {
        let stride = points.len().div_ceil(args.max_num_reference_points);
        points = points.into_iter().step_by(stride).collect();
    }
    Ok(points)
}

fn run(args: Args) -> AdjustResult<()> {
    // --- Argument validation -------------------------------------------------
    let ba_type = args.bundle_adjuster.to_ascii_lowercase();
    match ba_type.as_str() {
        "ceres" => {}
        "robustsparse" | "robustref" | "sparse" | "ref" => {
            info!(
                "Solver family '{}' is served by the primary driver.",
                args.bundle_adjuster
            );
        }
        other => {
            return Err(AdjustError::Argument(format!(
                "Unknown bundle adjustment version: {other}. Options are: [Ceres, RobustSparse, RobustRef, Sparse, Ref]"
            )));
        }
    }
    let loss = LossKind::parse(&args.cost_function)?;

    if args.camera_weight < 0.0 {
        return Err(AdjustError::Argument(
            "The camera weight must be non-negative".to_string(),
        ));
    }
    if args.rotation_weight < 0.0 || args.translation_weight < 0.0 {
        return Err(AdjustError::Argument(
            "The rotation and translation weights must be non-negative".to_string(),
        ));
    }
    if args.solve_intrinsics && !args.create_pinhole_cameras {
        return Err(AdjustError::Argument(
            "Solving for intrinsic parameters is only supported with pinhole cameras".to_string(),
        ));
    }
    if !args.intrinsics_to_float.trim().is_empty() && !args.solve_intrinsics {
        return Err(AdjustError::Argument(
            "To float only certain intrinsics, the option --solve-intrinsics must be on"
                .to_string(),
        ));
    }
    if args.overlap_list.is_some() && args.overlap_limit > 0 {
        return Err(AdjustError::Argument(
            "Cannot specify both the overlap limit and the overlap list".to_string(),
        ));
    }
    if args.camera_positions.is_some() && args.csv_format.trim().is_empty() {
        return Err(AdjustError::Argument(
            "When using a camera position file, the csv-format option must be set".to_string(),
        ));
    }
    if !args.csv_proj4.trim().is_empty() {
        return Err(AdjustError::Argument(
            "Projected CSV input (--csv-proj4) is not supported".to_string(),
        ));
    }
    if args.create_pinhole_cameras && args.input_adjustments_prefix.is_some() {
        return Err(AdjustError::Argument(
            "Cannot use initial adjustments with pinhole cameras. Read the cameras directly"
                .to_string(),
        ));
    }
    if args.output_prefix.is_empty() {
        return Err(AdjustError::Argument("Missing output prefix".to_string()));
    }

    let remove_outliers = parse_floats(&args.remove_outliers_params, 4, "remove-outliers-params")?;
    let remove_by_disp = parse_floats(
        &args.remove_outliers_by_disparity_params,
        2,
        "remove-outliers-by-disparity-params",
    )?;
    let elevation_limit = if args.elevation_limit.trim().is_empty() {
        None
    } else {
        let v = parse_floats(&args.elevation_limit, 2, "elevation-limit")?;
        Some((v[0].min(v[1]), v[0].max(v[1])))
    };
    let lon_lat_limit = if args.lon_lat_limit.trim().is_empty() {
        None
    } else {
        let v = parse_floats(&args.lon_lat_limit, 4, "lon-lat-limit")?;
        Some((v[0].min(v[2]), v[1].min(v[3]), v[0].max(v[2]), v[1].max(v[3])))
    };

    let mut fixed_camera_indices = std::collections::BTreeSet::new();
    for tok in args.fixed_camera_indices.split_whitespace() {
        let val: usize = tok.parse().map_err(|_| {
            AdjustError::Argument(format!("Malformed fixed camera index: {tok}"))
        })?;
        fixed_camera_indices.insert(val);
    }

    // --- Inputs --------------------------------------------------------------
    let (image_files, camera_files, gcp_files) = separate_inputs(&args.input_files);
    info!("Found {} GCP files on the command line.", gcp_files.len());
    if image_files.is_empty() {
        return Err(AdjustError::Argument("Missing input image files".to_string()));
    }
    if image_files.len() != camera_files.len() {
        return Err(AdjustError::Argument(format!(
            "Must have as many cameras as images: detected {} images and {} cameras",
            image_files.len(),
            camera_files.len()
        )));
    }
    // Duplicate camera names would make the outputs overwrite each other.
    for i in 0..camera_files.len() {
        for j in i + 1..camera_files.len() {
            if image_files[i].file_stem() == image_files[j].file_stem()
                && camera_files[i].file_stem() == camera_files[j].file_stem()
            {
                return Err(AdjustError::Argument(
                    "All camera model files must have unique names".to_string(),
                ));
            }
        }
    }

    let num_images = image_files.len();
    let datum = resolve_datum(&args, &gcp_files)?;

    if let Some(parent) = Path::new(&args.output_prefix).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut cameras = load_cameras(&image_files, &camera_files, &args)?;

    // --- Map-projection utilities -------------------------------------------
    if !args.mapprojected_data.trim().is_empty() {
        let (map_images, georefs, _, dem) = load_mapprojected_inputs(&args.mapprojected_data)?;
        transfer::matches_from_mapprojected(
            &map_images,
            &georefs,
            &dem,
            &datum,
            &cameras,
            &image_files,
            &args.output_prefix,
        )?;
    }
    if !args.gcp_data.trim().is_empty() {
        let (map_images, georefs, dem_file, dem) = load_mapprojected_inputs(&args.gcp_data)?;
        transfer::gcp_from_mapprojected(
            &map_images,
            &georefs,
            &dem_file,
            &dem,
            &datum,
            &cameras,
            &image_files,
            &args.output_prefix,
        )?;
        return Ok(());
    }

    // --- Estimated camera positions -----------------------------------------
    let csv_format = if args.csv_format.trim().is_empty() {
        None
    } else {
        Some(CsvFormat::parse(&args.csv_format)?)
    };
    let estimated_positions = match (&args.camera_positions, &csv_format) {
        (Some(path), Some(format)) => Some(load_estimated_camera_positions(
            path,
            format,
            &datum,
            &image_files,
        )?),
        _ => None,
    };

    // --- Pair generation and match files ------------------------------------
    let overlap_limit = if args.overlap_limit == 0 {
        num_images
    } else {
        args.overlap_limit
    };
    let mut overlap_list: std::collections::HashSet<(String, String)> =
        std::collections::HashSet::new();
    if let Some(list_file) = &args.overlap_list {
        let text = std::fs::read_to_string(list_file)?;
        let mut toks = text.split_whitespace();
        while let (Some(a), Some(b)) = (toks.next(), toks.next()) {
            // Insert both orderings; the list is undirected.
            overlap_list.insert((a.to_string(), b.to_string()));
            overlap_list.insert((b.to_string(), a.to_string()));
        }
    }

    let mut match_files: BTreeMap<(usize, usize), PathBuf> = BTreeMap::new();
    for i in 0..num_images {
        for j in (i + 1)..num_images.min(i + 1 + overlap_limit) {
            if !overlap_list.is_empty() {
                let pair = (
                    image_files[i].display().to_string(),
                    image_files[j].display().to_string(),
                );
                if !overlap_list.contains(&pair) {
                    continue;
                }
            }
            if let (Some(positions), true) = (&estimated_positions, args.position_filter_dist > 0.0)
            {
                let a = positions[i];
                let b = positions[j];
                if a != Vector3::zeros()
                    && b != Vector3::zeros()
                    && (a - b).norm() > args.position_filter_dist
                {
                    info!(
                        "Skipping pair ({i}, {j}) with camera distance {}",
                        (a - b).norm()
                    );
                    continue;
                }
            }
            let path = match_filename(&args.output_prefix, &image_files[i], &image_files[j]);
            if path.exists() {
                match_files.insert((i, j), path);
            } else {
                warn!("Missing match file: {}", path.display());
            }
        }
    }

    // --- Control network -----------------------------------------------------
    let filter = TriangulationFilter {
        elevation_limit,
        lon_lat_limit,
    };
    let mut cnet = build_control_network(
        &cameras,
        &match_files,
        args.min_matches,
        args.min_triangulation_angle,
        &filter,
        &datum,
    )?;
    if cnet.num_points() == 0 && !gcp_files.is_empty() {
        warn!("Failed to build a control network from matches. Will continue with ground control points.");
    }
    add_ground_control_points(&mut cnet, &image_files, &gcp_files, &datum)?;
    if cnet.num_points() == 0 {
        return Err(AdjustError::Network(
            "The control network is empty: no matches and no ground control points".to_string(),
        ));
    }
    if args.save_cnet_as_csv {
        save_cnet_as_csv(
            &cnet,
            &image_files,
            &datum,
            format!("{}-cnet.csv", args.output_prefix),
        )?;
    }

    // --- Rigid alignment -----------------------------------------------------
    if args.create_pinhole_cameras {
        if let Some(estimated) = &estimated_positions {
            init_cameras_from_positions(&mut cameras, &mut cnet, estimated)?;
        } else if !gcp_files.is_empty() {
            init_cameras_from_gcp(&mut cameras, &mut cnet)?;
        }
    }
    if !gcp_files.is_empty() {
        check_gcp_dists(&cameras, &cnet);
    }

    if let Some(path) = &args.initial_transform {
        let sim = Similarity::read_matrix_file(path)?;
        info!(
            "Applying initial transform (scale {}, translation {:?})",
            sim.scale, sim.translation
        );
        apogee_adjust::align::apply_rigid_transform(&mut cameras, &mut cnet, &sim);
    }

    // --- Reference terrain ----------------------------------------------------
    let terrain = match &args.reference_terrain {
        None => None,
        Some(path) => {
            if !datum.is_specified() {
                return Err(AdjustError::Argument(
                    "When using a reference terrain, must specify the datum".to_string(),
                ));
            }
            if args.disparity_list.trim().is_empty() {
                return Err(AdjustError::Argument(
                    "When using a reference terrain, must specify a list of disparities"
                        .to_string(),
                ));
            }
            let points =
                load_reference_terrain(path, &args, &datum, csv_format.as_ref(), lon_lat_limit)?;
            let mut disparities = Vec::new();
            for disp_file in args.disparity_list.split_whitespace() {
                info!("Reading: {disp_file}");
                disparities.push(DisparityMap::read_binary(disp_file)?);
            }
            let size = parse_floats(&args.image_size, 2, "image-size").map_err(|_| {
                AdjustError::Argument(
                    "A reference terrain needs --image-size \"width height\"".to_string(),
                )
            })?;
            let image_boxes = vec![ImageBox::new(size[0] as usize, size[1] as usize); num_images];
            info!("Setting up the error to the reference terrain.");
            Some(Arc::new(TerrainConstraint {
                points,
                disparities,
                image_boxes,
            }))
        }
    };

    // --- Graph options and the run -------------------------------------------
    let heights_from_dem = match &args.heights_from_dem {
        None => None,
        Some(path) => {
            if !datum.is_specified() {
                return Err(AdjustError::Argument(
                    "When using heights from a DEM, must specify the datum".to_string(),
                ));
            }
            info!("Loading DEM: {}", path.display());
            Some(Arc::new(DemGrid::read_esri_ascii(path)?))
        }
    };

    let num_threads = if args.session_type.eq_ignore_ascii_case("isis") {
        // ISIS projection routines are not reentrant.
        1
    } else {
        args.num_threads
    };

    let cfg = RunConfig {
        out_prefix: args.output_prefix.clone(),
        image_files,
        camera_files,
        datum,
        graph: GraphOptions {
            loss,
            robust_threshold: args.robust_threshold,
            overlap_exponent: args.overlap_exponent,
            camera_weight: args.camera_weight,
            rotation_weight: args.rotation_weight,
            translation_weight: args.translation_weight,
            solve_intrinsics: args.solve_intrinsics,
            intrinsics_to_float: IntrinsicsToFloat::parse(&args.intrinsics_to_float)?,
            use_llh_error: args.use_lon_lat_height_gcp_error,
            fix_gcp_xyz: args.fix_gcp_xyz,
            fixed_camera_indices,
            heights_from_dem,
            max_disp_error: args.max_disp_error,
        },
        num_passes: args.num_passes,
        remove_outliers_params: (
            remove_outliers[0],
            remove_outliers[1],
            remove_outliers[2],
            remove_outliers[3],
        ),
        remove_outliers_by_disp_params: (remove_by_disp[0], remove_by_disp[1]),
        min_matches: args.min_matches,
        max_iterations: args.max_iterations,
        parameter_tolerance: args.parameter_tolerance,
        num_threads,
        match_files,
        terrain,
    };

    run_bundle_adjust(&mut cameras, &cnet, &cfg)?;
    Ok(())
}

fn main() {
    init_logger();
    let args = Args::parse();
    if let Err(e) = run(args) {
        error!("{e}");
        std::process::exit(1);
    }
}
