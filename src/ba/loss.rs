//! Robust loss functions and the residual/Jacobian corrector.
//!
//! A loss function transforms the squared residual norm `s = ||r||²` into a
//! robust cost `ρ(s)` that limits the influence of outlier observations.
//! Each implementation evaluates `[ρ(s), ρ'(s), ρ''(s)]`; the [`Corrector`]
//! turns those derivatives into the residual and Jacobian rescaling that
//! makes the reweighted problem look like plain least squares to the solver.
//!
//! Reprojection and disparity-terrain residuals go through the run's robust
//! loss; GCP anchors and camera priors always use the trivial (L2) loss so
//! control information is never discounted.

use crate::error::{AdjustError, AdjustResult};

/// Trait for robust loss functions.
///
/// `evaluate` returns `[ρ(s), ρ'(s), ρ''(s)]` at the squared residual norm
/// `s`. Near zero every loss behaves like least squares: `ρ(0) = 0`,
/// `ρ'(0) = 1`.
pub trait Loss: Send + Sync {
    fn evaluate(&self, s: f64) -> [f64; 3];
}

/// Which robust loss a run uses for its measurement residuals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LossKind {
    /// Plain least squares (trivial loss)
    L2,
    /// Quadratic for inliers, linear for outliers
    Huber,
    /// Logarithmic growth, aggressive outlier suppression
    #[default]
    Cauchy,
    /// Smooth L1 (pseudo-Huber)
    SoftL1,
}

impl LossKind {
    /// Parse a CLI cost-function name. `pseudohuber` and `l1` both map to
    /// the smooth-L1 loss.
    pub fn parse(name: &str) -> AdjustResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "l2" => Ok(LossKind::L2),
            "huber" => Ok(LossKind::Huber),
            "cauchy" => Ok(LossKind::Cauchy),
            "l1" | "pseudohuber" => Ok(LossKind::SoftL1),
            other => Err(AdjustError::Argument(format!(
                "Unknown cost function: {other}. Options are: Cauchy, PseudoHuber, Huber, L1, L2."
            ))),
        }
    }

    /// Instantiate the loss; `None` is the trivial loss.
    pub fn make(&self, threshold: f64) -> AdjustResult<Option<Box<dyn Loss>>> {
        match self {
            LossKind::L2 => Ok(None),
            LossKind::Huber => Ok(Some(Box::new(HuberLoss::new(threshold)?))),
            LossKind::Cauchy => Ok(Some(Box::new(CauchyLoss::new(threshold)?))),
            LossKind::SoftL1 => Ok(Some(Box::new(SoftL1Loss::new(threshold)?))),
        }
    }
}

fn check_scale(scale: f64) -> AdjustResult<()> {
    if scale <= 0.0 || !scale.is_finite() {
        return Err(AdjustError::Argument(
            "Robust threshold must be positive".to_string(),
        ));
    }
    Ok(())
}

/// Huber loss: `ρ(s) = s` for `s ≤ δ²`, `2δ√s − δ²` beyond.
#[derive(Debug, Clone)]
pub struct HuberLoss {
    scale: f64,
    scale2: f64,
}

impl HuberLoss {
    pub fn new(scale: f64) -> AdjustResult<Self> {
        check_scale(scale)?;
        Ok(HuberLoss {
            scale,
            scale2: scale * scale,
        })
    }
}

impl Loss for HuberLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        if s > self.scale2 {
            let r = s.sqrt();
            let rho1 = (self.scale / r).max(f64::MIN);
            [2.0 * self.scale * r - self.scale2, rho1, -rho1 / (2.0 * s)]
        } else {
            [s, 1.0, 0.0]
        }
    }
}

/// Cauchy (Lorentzian) loss: `ρ(s) = δ² log(1 + s/δ²)`.
#[derive(Debug, Clone)]
pub struct CauchyLoss {
    scale2: f64,
    c: f64,
}

impl CauchyLoss {
    pub fn new(scale: f64) -> AdjustResult<Self> {
        check_scale(scale)?;
        let scale2 = scale * scale;
        Ok(CauchyLoss {
            scale2,
            c: 1.0 / scale2,
        })
    }
}

impl Loss for CauchyLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        let sum = 1.0 + s * self.c;
        let inv = 1.0 / sum;
        [
            self.scale2 * sum.ln(),
            inv.max(f64::MIN),
            -self.c * (inv * inv),
        ]
    }
}

/// Smooth-L1 (pseudo-Huber) loss: `ρ(s) = 2δ²(√(1 + s/δ²) − 1)`.
#[derive(Debug, Clone)]
pub struct SoftL1Loss {
    scale2: f64,
    c: f64,
}

impl SoftL1Loss {
    pub fn new(scale: f64) -> AdjustResult<Self> {
        check_scale(scale)?;
        let scale2 = scale * scale;
        Ok(SoftL1Loss {
            scale2,
            c: 1.0 / scale2,
        })
    }
}

impl Loss for SoftL1Loss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        let sum = 1.0 + s * self.c;
        let tmp = sum.sqrt();
        let rho1 = (1.0 / tmp).max(f64::MIN);
        [
            2.0 * self.scale2 * (tmp - 1.0),
            rho1,
            -(self.c * rho1) / (2.0 * sum),
        ]
    }
}

/// Rescales residuals and Jacobians so a robustified term can be handled by
/// a plain least-squares step.
///
/// With `α` solving `½α² − α = ρ''/ρ' · s`, the corrected residual is
/// `√ρ'/(1−α) · r` and the corrected Jacobian is
/// `√ρ' (J − α/s · r rᵀ J)`.
#[derive(Debug, Clone, Copy)]
pub struct Corrector {
    residual_scaling: f64,
    alpha_sq_norm: f64,
    sqrt_rho1: f64,
}

impl Corrector {
    pub fn new(s: f64, rho: &[f64; 3]) -> Self {
        let sqrt_rho1 = rho[1].max(f64::MIN).sqrt();
        if s == 0.0 || rho[2] <= 0.0 {
            return Corrector {
                residual_scaling: sqrt_rho1,
                alpha_sq_norm: 0.0,
                sqrt_rho1,
            };
        }
        let d = 1.0 + 2.0 * s * rho[2] / rho[1];
        let alpha = 1.0 - d.max(0.0).sqrt();
        Corrector {
            residual_scaling: sqrt_rho1 / (1.0 - alpha),
            alpha_sq_norm: alpha / s,
            sqrt_rho1,
        }
    }

    /// The factor applied to residuals on loss-applied evaluation.
    pub fn residual_scaling(&self) -> f64 {
        self.residual_scaling
    }

    pub fn correct_residuals(&self, residual: &mut nalgebra::DVector<f64>) {
        *residual *= self.residual_scaling;
    }

    pub fn correct_jacobian(
        &self,
        residual: &nalgebra::DVector<f64>,
        jacobian: &mut nalgebra::DMatrix<f64>,
    ) {
        if self.alpha_sq_norm == 0.0 {
            *jacobian *= self.sqrt_rho1;
            return;
        }
        let rt_j = residual.transpose() * &*jacobian;
        for i in 0..jacobian.nrows() {
            for j in 0..jacobian.ncols() {
                jacobian[(i, j)] =
                    self.sqrt_rho1 * (jacobian[(i, j)] - self.alpha_sq_norm * residual[i] * rt_j[j]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_huber_inlier_region() {
        let huber = HuberLoss::new(1.345).unwrap();
        let [rho, rho1, rho2] = huber.evaluate(0.5);
        assert_eq!(rho, 0.5);
        assert_eq!(rho1, 1.0);
        assert_eq!(rho2, 0.0);
    }

    #[test]
    fn test_huber_outlier_region() {
        let huber = HuberLoss::new(1.0).unwrap();
        let [rho, rho1, _] = huber.evaluate(4.0);
        assert!((rho - 3.0).abs() < 1e-12); // 2*1*2 - 1
        assert!((rho1 - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_cauchy_downweights() {
        let cauchy = CauchyLoss::new(1.0).unwrap();
        let [rho, rho1, _] = cauchy.evaluate(100.0);
        assert!(rho < 100.0);
        assert!(rho1 < 0.05);
    }

    #[test]
    fn test_soft_l1_matches_pseudo_huber() {
        let loss = SoftL1Loss::new(2.0).unwrap();
        let s = 9.0;
        let [rho, _, _] = loss.evaluate(s);
        let expected = 2.0 * 4.0 * ((1.0_f64 + s / 4.0).sqrt() - 1.0);
        assert!((rho - expected).abs() < 1e-12);
    }

    #[test]
    fn test_losses_match_l2_near_zero() {
        for kind in [LossKind::Huber, LossKind::Cauchy, LossKind::SoftL1] {
            let loss = kind.make(1.0).unwrap().unwrap();
            let [rho, rho1, _] = loss.evaluate(1e-8);
            assert!((rho - 1e-8).abs() < 1e-12);
            assert!((rho1 - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_parse_names() {
        assert_eq!(LossKind::parse("Cauchy").unwrap(), LossKind::Cauchy);
        assert_eq!(LossKind::parse("pseudohuber").unwrap(), LossKind::SoftL1);
        assert_eq!(LossKind::parse("l1").unwrap(), LossKind::SoftL1);
        assert_eq!(LossKind::parse("L2").unwrap(), LossKind::L2);
        assert!(LossKind::parse("tukey").is_err());
    }

    #[test]
    fn test_corrector_trivial_for_l2_shape() {
        // With rho = [s, 1, 0] the corrector is the identity.
        let r0 = nalgebra::DVector::from_vec(vec![3.0, -4.0]);
        let s = r0.norm_squared();
        let corr = Corrector::new(s, &[s, 1.0, 0.0]);
        let mut r = r0.clone();
        corr.correct_residuals(&mut r);
        assert!((r - r0).norm() < 1e-15);
    }

    #[test]
    fn test_corrector_scales_down_outliers() {
        let huber = HuberLoss::new(1.0).unwrap();
        let r0 = nalgebra::DVector::from_vec(vec![3.0, -4.0]); // ||r|| = 5
        let s = r0.norm_squared();
        let rho = huber.evaluate(s);
        let corr = Corrector::new(s, &rho);
        let mut r = r0.clone();
        corr.correct_residuals(&mut r);
        // In the outlier region rho'' < 0, so the corrector reduces to the
        // sqrt(rho') rescaling.
        assert!((r.norm_squared() - rho[1] * s).abs() < 1e-12);
        assert!(r.norm() < r0.norm());
    }
}
