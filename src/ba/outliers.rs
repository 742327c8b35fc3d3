//! Multi-pass outlier flagging from loss-free reprojection residuals.
//!
//! Between passes the driver evaluates raw residuals, averages them per
//! point, and flags points beyond a widened percentile bracket. GCPs are
//! never flagged and the outlier set only ever grows. Surviving matches are
//! written back over the original match files, additionally filtered by a
//! disparity bracket.

use std::collections::BTreeSet;
use std::path::PathBuf;

use tracing::info;

use crate::cnet::matches::{Ip, read_match_file, write_match_file};
use crate::cnet::ControlNetwork;
use crate::error::AdjustResult;

use super::graph::{ResidualGraph, ResidualKind};

/// Outlier-removal thresholds `(pct, factor, err1, err2)`.
pub type RemoveOutliersParams = (f64, f64, f64, f64);

/// Disparity-bracket thresholds `(pct, factor)`.
pub type RemoveOutliersByDispParams = (f64, f64);

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = p.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = idx.floor() as usize;
    let hi = idx.ceil() as usize;
    let frac = idx - lo as f64;
    sorted[lo] * (1.0 - frac) + sorted[hi] * frac
}

/// Percentile bracket `[b, e]` widened by `factor` times its own width.
///
/// `pct` is the lower-tail fraction; the upper percentile is its mirror.
pub fn find_outlier_brackets(values: &[f64], pct: f64, factor: f64) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mut b = percentile(&sorted, pct);
    let mut e = percentile(&sorted, 1.0 - pct);
    let width = e - b;
    b -= factor * width;
    e += factor * width;
    (b, e)
}

/// Per-point mean reprojection residual `( |ex| + |ey| ) / 2` and
/// observation counts from a loss-free residual vector.
///
/// Outlier points get NaN means so downstream writers skip them.
pub fn compute_mean_point_residuals(
    graph: &ResidualGraph,
    num_points: usize,
    residuals: &[f64],
    outliers: &BTreeSet<usize>,
) -> (Vec<f64>, Vec<usize>) {
    let mut mean = vec![0.0f64; num_points];
    let mut count = vec![0usize; num_points];
    for spec in &graph.blocks {
        if let ResidualKind::Reprojection { point, .. } = spec.kind {
            let ex = residuals[spec.row];
            let ey = residuals[spec.row + 1];
            mean[point] += (ex.abs() + ey.abs()) / 2.0;
            count[point] += 1;
        }
    }
    for ipt in 0..num_points {
        if outliers.contains(&ipt) || count[ipt] == 0 {
            mean[ipt] = f64::NAN;
        } else {
            mean[ipt] /= count[ipt] as f64;
        }
    }
    (mean, count)
}

/// Flag new outliers from per-point mean residuals.
///
/// Returns the number of points added to the set. GCPs are never flagged,
/// and the clamp `e = min(max(e, err1), err2)` keeps the cutoff from
/// rejecting small pixel errors or tolerating large ones.
pub fn update_outliers(
    cnet: &ControlNetwork,
    mean_residuals: &[f64],
    outliers: &mut BTreeSet<usize>,
    params: RemoveOutliersParams,
) -> usize {
    info!("Removing pixel outliers in preparation for another solver attempt.");
    let (p0, factor, err1, err2) = params;

    let mut actual_residuals = Vec::new();
    for (ipt, point) in cnet.points.iter().enumerate() {
        if outliers.contains(&ipt) || point.is_gcp() || mean_residuals[ipt].is_nan() {
            continue;
        }
        actual_residuals.push(mean_residuals[ipt]);
    }

    let pct = 1.0 - p0 / 100.0;
    let (b, mut e) = find_outlier_brackets(&actual_residuals, pct, factor);
    info!("Outlier statistics: b = {b}, e = {e}.");

    // The brackets alone can be too aggressive; pixel residuals start at 0,
    // so only the upper cutoff matters and it is clamped to [err1, err2].
    e = e.max(err1).min(err2);
    info!("Removing as outliers points with mean reprojection error > {e}.");

    let mut num_new = 0usize;
    for (ipt, point) in cnet.points.iter().enumerate() {
        if outliers.contains(&ipt) || point.is_gcp() || mean_residuals[ipt].is_nan() {
            continue;
        }
        if mean_residuals[ipt] > e {
            outliers.insert(ipt);
            num_new += 1;
        }
    }

    info!(
        "Removed {num_new} outliers by reprojection error, now have {} points remaining.",
        cnet.num_points() - outliers.len()
    );
    num_new
}

/// Keep only interest-point pairs whose disparity lies inside the widened
/// percentile bracket, per axis.
pub fn filter_ip_by_disparity(pct: f64, factor: f64, left: &mut Vec<Ip>, right: &mut Vec<Ip>) {
    if left.is_empty() {
        return;
    }
    let dx: Vec<f64> = left.iter().zip(right.iter()).map(|(l, r)| r.x - l.x).collect();
    let dy: Vec<f64> = left.iter().zip(right.iter()).map(|(l, r)| r.y - l.y).collect();
    let tail = 1.0 - pct / 100.0;
    let (bx, ex) = find_outlier_brackets(&dx, tail, factor);
    let (by, ey) = find_outlier_brackets(&dy, tail, factor);

    let keep: Vec<bool> = dx
        .iter()
        .zip(dy.iter())
        .map(|(&x, &y)| x >= bx && x <= ex && y >= by && y <= ey)
        .collect();
    let mut idx = 0;
    left.retain(|_| {
        let k = keep[idx];
        idx += 1;
        k
    });
    idx = 0;
    right.retain(|_| {
        let k = keep[idx];
        idx += 1;
        k
    });
}

/// Rewrite the match files with only the surviving matches.
///
/// For each pair, matches are kept when their point is not an outlier and
/// the pair of pixels is still present in the original file, then filtered
/// once more by the disparity bracket.
pub fn remove_outlier_matches(
    cnet: &ControlNetwork,
    outliers: &BTreeSet<usize>,
    match_files: &std::collections::BTreeMap<(usize, usize), PathBuf>,
    disp_params: RemoveOutliersByDispParams,
) -> AdjustResult<()> {
    for (&(left_cam, right_cam), path) in match_files {
        let Ok((orig_left, orig_right)) = read_match_file(path) else {
            continue;
        };
        let lookup: std::collections::HashMap<(u64, u64), (u64, u64)> = orig_left
            .iter()
            .zip(orig_right.iter())
            .map(|(l, r)| {
                (
                    (l.x.to_bits(), l.y.to_bits()),
                    (r.x.to_bits(), r.y.to_bits()),
                )
            })
            .collect();

        let mut left_ip = Vec::new();
        let mut right_ip = Vec::new();
        for (ipt, point) in cnet.points.iter().enumerate() {
            if point.is_gcp() || outliers.contains(&ipt) {
                continue;
            }
            let (Some(lobs), Some(robs)) = (
                point.observation_in(left_cam),
                point.observation_in(right_cam),
            ) else {
                continue;
            };
            // Only keep matches that were there originally.
            let lkey = (lobs.pixel.x.to_bits(), lobs.pixel.y.to_bits());
            let rkey = (robs.pixel.x.to_bits(), robs.pixel.y.to_bits());
            if lookup.get(&lkey) != Some(&rkey) {
                continue;
            }
            left_ip.push(Ip {
                x: lobs.pixel.x,
                y: lobs.pixel.y,
                sx: lobs.sigma.x,
                sy: lobs.sigma.y,
            });
            right_ip.push(Ip {
                x: robs.pixel.x,
                y: robs.pixel.y,
                sx: robs.sigma.x,
                sy: robs.sigma.y,
            });
        }

        filter_ip_by_disparity(disp_params.0, disp_params.1, &mut left_ip, &mut right_ip);

        info!("Writing: {}", path.display());
        write_match_file(path, &left_ip, &right_ip)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_brackets_of_uniform_data() {
        let values: Vec<f64> = (0..101).map(|i| i as f64).collect();
        let (b, e) = find_outlier_brackets(&values, 0.25, 0.0);
        assert!((b - 25.0).abs() < 1e-9);
        assert!((e - 75.0).abs() < 1e-9);
        let (b, e) = find_outlier_brackets(&values, 0.25, 1.0);
        assert!((b - -25.0).abs() < 1e-9);
        assert!((e - 125.0).abs() < 1e-9);
    }

    #[test]
    fn test_brackets_empty() {
        assert_eq!(find_outlier_brackets(&[], 0.25, 3.0), (0.0, 0.0));
    }

    #[test]
    fn test_disparity_filter_drops_gross_outlier() {
        let mut left: Vec<Ip> = (0..20).map(|i| Ip::new(i as f64, 0.0)).collect();
        let mut right: Vec<Ip> = (0..20).map(|i| Ip::new(i as f64 + 5.0, 0.0)).collect();
        // One grossly different disparity.
        right[10].x = 500.0;
        filter_ip_by_disparity(90.0, 3.0, &mut left, &mut right);
        assert_eq!(left.len(), 19);
        assert!(left.iter().all(|ip| ip.x != 10.0));
    }

    #[test]
    fn test_update_outliers_never_flags_gcp() {
        use crate::cnet::{Observation, PointKind, TiePoint};
        use nalgebra::{Vector2, Vector3};

        let mut cnet = ControlNetwork::default();
        for i in 0..4 {
            cnet.add_point(TiePoint {
                position: Vector3::zeros(),
                sigma: Vector3::new(1.0, 1.0, 1.0),
                kind: if i == 3 { PointKind::Gcp } else { PointKind::Tie },
                observations: vec![Observation::new(
                    0,
                    Vector2::zeros(),
                    Vector2::new(1.0, 1.0),
                )],
            })
            .unwrap();
        }
        // Point 2 and the GCP have huge residuals.
        let mean = vec![0.1, 0.2, 50.0, 50.0];
        let mut outliers = BTreeSet::new();
        let added = update_outliers(&cnet, &mean, &mut outliers, (75.0, 3.0, 2.0, 3.0));
        assert_eq!(added, 1);
        assert!(outliers.contains(&2));
        assert!(!outliers.contains(&3));
    }
}
