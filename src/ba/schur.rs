//! Schur-complement linear solvers for the bundle adjustment step.
//!
//! The normal equations of a bundle adjustment step have an arrow shape:
//! point blocks are 3x3 and coupled to cameras only through their own
//! observations. Eliminating the point block yields the reduced camera
//! system `S = H_cc - H_cp H_pp^-1 H_pc`, which is what actually gets
//! solved. Four strategies cover the size range:
//!
//! 1. `DenseSchur` - form S densely, Cholesky (small camera counts)
//! 2. `SparseSchur` - form S sparse, direct sparse Cholesky
//! 3. `IterativeSchur` (explicit) - PCG on the formed S, Schur-Jacobi
//!    preconditioner
//! 4. `IterativeSchur` (implicit) - PCG applying S through its factors
//!    without ever forming it

use std::collections::HashMap;

use faer::linalg::solvers::Solve;
use faer::sparse::{SparseColMat, Triplet};
use faer::{Mat, Side};
use nalgebra::{DMatrix, DVector, Matrix3, Vector3};

use super::graph::{BaModel, BlockId, LinearizedBlock, ResidualGraph};

/// Linear solver strategy, selected from the camera count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinearSolverKind {
    DenseSchur,
    SparseSchur,
    IterativeSchur { explicit_schur: bool },
}

impl std::fmt::Display for LinearSolverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinearSolverKind::DenseSchur => write!(f, "DENSE_SCHUR"),
            LinearSolverKind::SparseSchur => write!(f, "SPARSE_SCHUR"),
            LinearSolverKind::IterativeSchur { explicit_schur } => write!(
                f,
                "ITERATIVE_SCHUR ({} Schur complement)",
                if *explicit_schur { "explicit" } else { "implicit" }
            ),
        }
    }
}

/// Pick the solver strategy for a problem size.
pub fn select_linear_solver(num_cameras: usize) -> LinearSolverKind {
    let mut kind = LinearSolverKind::SparseSchur;
    if num_cameras < 100 {
        kind = LinearSolverKind::DenseSchur;
    }
    if num_cameras > 3500 {
        // Explicit Schur complement helps in this size range.
        kind = LinearSolverKind::IterativeSchur {
            explicit_schur: true,
        };
    }
    if num_cameras > 7000 {
        kind = LinearSolverKind::IterativeSchur {
            explicit_schur: false,
        };
    }
    kind
}

/// One free block of the reduced (camera) group.
#[derive(Debug, Clone, Copy)]
pub struct CamBlockInfo {
    pub id: BlockId,
    pub offset: usize,
    pub dim: usize,
}

/// Column layout of the step: free camera-group blocks (cameras first, then
/// intrinsic scale groups) and the elimination slots of the free points.
pub struct BlockLayout {
    pub cam_blocks: Vec<CamBlockInfo>,
    pub cam_index: HashMap<BlockId, usize>,
    pub cam_dim: usize,
    pub point_slots: HashMap<usize, usize>,
    pub points: Vec<usize>,
}

/// Collect the free parameter blocks referenced by the graph.
pub fn build_layout(graph: &ResidualGraph, model: &BaModel) -> BlockLayout {
    let mut cam_ids: Vec<BlockId> = Vec::new();
    let mut point_ids: Vec<usize> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for spec in &graph.blocks {
        for block in &spec.blocks {
            if graph.constant.contains(block) || !seen.insert(*block) {
                continue;
            }
            match block {
                BlockId::Point(ipt) => point_ids.push(*ipt),
                other => cam_ids.push(*other),
            }
        }
    }
    cam_ids.sort();
    point_ids.sort();

    let mut cam_blocks = Vec::with_capacity(cam_ids.len());
    let mut cam_index = HashMap::new();
    let mut offset = 0usize;
    for id in cam_ids {
        let dim = id.dim(model);
        cam_index.insert(id, cam_blocks.len());
        cam_blocks.push(CamBlockInfo { id, offset, dim });
        offset += dim;
    }
    let point_slots = point_ids
        .iter()
        .enumerate()
        .map(|(slot, &ipt)| (ipt, slot))
        .collect();

    BlockLayout {
        cam_blocks,
        cam_index,
        cam_dim: offset,
        point_slots,
        points: point_ids,
    }
}

/// The assembled (undamped) normal equations in eliminated form.
pub struct SchurSystem {
    pub cam_dim: usize,
    /// Camera-group Hessian blocks, keyed `(bi, bj)` with `bi <= bj`
    hcc: HashMap<(usize, usize), DMatrix<f64>>,
    gc: DVector<f64>,
    /// Per point slot: `H_pp`, gradient, and camera coupling blocks
    point_w: Vec<Matrix3<f64>>,
    point_g: Vec<Vector3<f64>>,
    point_e: Vec<Vec<(usize, DMatrix<f64>)>>,
    cam_dims: Vec<usize>,
    cam_offsets: Vec<usize>,
}

const MIN_DIAGONAL: f64 = 1e-6;
const MAX_DIAGONAL: f64 = 1e32;
const CG_TOLERANCE: f64 = 1e-6;

impl SchurSystem {
    /// Accumulate the linearised blocks into the eliminated structure.
    pub fn assemble(layout: &BlockLayout, linearized: &[LinearizedBlock]) -> Self {
        let npts = layout.points.len();
        let mut system = SchurSystem {
            cam_dim: layout.cam_dim,
            hcc: HashMap::new(),
            gc: DVector::zeros(layout.cam_dim),
            point_w: vec![Matrix3::zeros(); npts],
            point_g: vec![Vector3::zeros(); npts],
            point_e: vec![Vec::new(); npts],
            cam_dims: layout.cam_blocks.iter().map(|b| b.dim).collect(),
            cam_offsets: layout.cam_blocks.iter().map(|b| b.offset).collect(),
        };

        for lin in linearized {
            // Split this block's Jacobians into camera-group entries and at
            // most one point entry.
            let mut cams: Vec<(usize, &DMatrix<f64>)> = Vec::new();
            let mut point: Option<(usize, &DMatrix<f64>)> = None;
            for (id, jac) in &lin.jacobians {
                match id {
                    BlockId::Point(ipt) => {
                        if let Some(&slot) = layout.point_slots.get(ipt) {
                            point = Some((slot, jac));
                        }
                    }
                    other => {
                        if let Some(&bi) = layout.cam_index.get(other) {
                            cams.push((bi, jac));
                        }
                    }
                }
            }

            for (ai, (bi, ja)) in cams.iter().enumerate() {
                let gi = ja.transpose() * &lin.residual;
                let off = system.cam_offsets[*bi];
                for q in 0..gi.len() {
                    system.gc[off + q] += gi[q];
                }
                for (bj, jb) in cams.iter().skip(ai) {
                    let (lo, hi, contrib) = if bi <= bj {
                        (*bi, *bj, ja.transpose() * *jb)
                    } else {
                        (*bj, *bi, jb.transpose() * *ja)
                    };
                    let entry = system
                        .hcc
                        .entry((lo, hi))
                        .or_insert_with(|| {
                            DMatrix::zeros(system.cam_dims[lo], system.cam_dims[hi])
                        });
                    *entry += contrib;
                }
            }

            if let Some((slot, jp)) = point {
                let w: DMatrix<f64> = jp.transpose() * jp;
                system.point_w[slot] += Matrix3::from_fn(|i, j| w[(i, j)]);
                let gp = jp.transpose() * &lin.residual;
                system.point_g[slot] += Vector3::new(gp[0], gp[1], gp[2]);
                for (bi, ja) in &cams {
                    let e: DMatrix<f64> = ja.transpose() * jp;
                    if let Some((_, existing)) = system.point_e[slot]
                        .iter_mut()
                        .find(|(b, _)| b == bi)
                    {
                        *existing += e;
                    } else {
                        system.point_e[slot].push((*bi, e));
                    }
                }
            }
        }
        system
    }

    /// Infinity norm of the full gradient, for convergence checks.
    pub fn gradient_max_norm(&self) -> f64 {
        let mut max = self.gc.iter().fold(0.0f64, |m, v| m.max(v.abs()));
        for g in &self.point_g {
            max = max.max(g.abs().max());
        }
        max
    }

    fn damped_diag(m: &DMatrix<f64>, lambda: f64) -> DMatrix<f64> {
        let mut out = m.clone();
        for q in 0..m.nrows().min(m.ncols()) {
            let d = m[(q, q)].clamp(MIN_DIAGONAL, MAX_DIAGONAL);
            out[(q, q)] += lambda * d;
        }
        out
    }

    fn damped_w_inverses(&self, lambda: f64) -> Option<Vec<Matrix3<f64>>> {
        let mut out = Vec::with_capacity(self.point_w.len());
        for w in &self.point_w {
            let mut damped = *w;
            for q in 0..3 {
                let d = w[(q, q)].clamp(MIN_DIAGONAL, MAX_DIAGONAL);
                damped[(q, q)] += lambda * d;
            }
            out.push(damped.try_inverse()?);
        }
        Some(out)
    }

    /// The damped camera-group diagonal block `bi`, after elimination.
    fn schur_diag_block(
        &self,
        bi: usize,
        lambda: f64,
        w_inv: &[Matrix3<f64>],
    ) -> DMatrix<f64> {
        let dim = self.cam_dims[bi];
        let mut block = match self.hcc.get(&(bi, bi)) {
            Some(h) => Self::damped_diag(h, lambda),
            None => DMatrix::zeros(dim, dim),
        };
        for (slot, entries) in self.point_e.iter().enumerate() {
            if let Some((_, e)) = entries.iter().find(|(b, _)| *b == bi) {
                let winv = DMatrix::from_fn(3, 3, |i, j| w_inv[slot][(i, j)]);
                block -= e * &winv * e.transpose();
            }
        }
        block
    }

    /// Form the reduced system blocks `S = H_cc - E W^-1 E^T` (damped).
    fn schur_blocks(
        &self,
        lambda: f64,
        w_inv: &[Matrix3<f64>],
    ) -> HashMap<(usize, usize), DMatrix<f64>> {
        let mut s: HashMap<(usize, usize), DMatrix<f64>> = HashMap::new();
        for (&(bi, bj), h) in &self.hcc {
            let v = if bi == bj {
                Self::damped_diag(h, lambda)
            } else {
                h.clone()
            };
            s.insert((bi, bj), v);
        }
        for (slot, entries) in self.point_e.iter().enumerate() {
            let winv = DMatrix::from_fn(3, 3, |i, j| w_inv[slot][(i, j)]);
            for (ai, (bi, ea)) in entries.iter().enumerate() {
                for (bj, eb) in entries.iter().skip(ai) {
                    let (lo, hi, contrib) = if bi <= bj {
                        (*bi, *bj, ea * &winv * eb.transpose())
                    } else {
                        (*bj, *bi, eb * &winv * ea.transpose())
                    };
                    let entry = s.entry((lo, hi)).or_insert_with(|| {
                        DMatrix::zeros(self.cam_dims[lo], self.cam_dims[hi])
                    });
                    *entry -= contrib;
                }
            }
        }
        s
    }

    /// Reduced right-hand side `-(g_c - E W^-1 g_p)`.
    fn schur_rhs(&self, w_inv: &[Matrix3<f64>]) -> DVector<f64> {
        let mut rhs = -self.gc.clone();
        for (slot, entries) in self.point_e.iter().enumerate() {
            let wg = w_inv[slot] * self.point_g[slot];
            let wg = DVector::from_vec(vec![wg.x, wg.y, wg.z]);
            for (bi, e) in entries {
                let contrib = e * &wg;
                let off = self.cam_offsets[*bi];
                for q in 0..contrib.len() {
                    rhs[off + q] += contrib[q];
                }
            }
        }
        rhs
    }

    fn back_substitute(
        &self,
        dc: &DVector<f64>,
        w_inv: &[Matrix3<f64>],
    ) -> Vec<Vector3<f64>> {
        let mut dp = Vec::with_capacity(self.point_w.len());
        for (slot, entries) in self.point_e.iter().enumerate() {
            let mut rhs = -self.point_g[slot];
            for (bi, e) in entries {
                let off = self.cam_offsets[*bi];
                let dc_block = dc.rows(off, self.cam_dims[*bi]);
                let et_dc = e.transpose() * dc_block;
                rhs -= Vector3::new(et_dc[0], et_dc[1], et_dc[2]);
            }
            dp.push(w_inv[slot] * rhs);
        }
        dp
    }

    /// Apply the undamped Hessian to a step, for predicted-reduction checks.
    pub fn apply_hessian(
        &self,
        dc: &DVector<f64>,
        dp: &[Vector3<f64>],
    ) -> (DVector<f64>, Vec<Vector3<f64>>) {
        let mut out_c = DVector::zeros(self.cam_dim);
        for (&(bi, bj), h) in &self.hcc {
            let (oi, oj) = (self.cam_offsets[bi], self.cam_offsets[bj]);
            let (di, dj) = (self.cam_dims[bi], self.cam_dims[bj]);
            let contrib = h * dc.rows(oj, dj);
            for q in 0..di {
                out_c[oi + q] += contrib[q];
            }
            if bi != bj {
                let contrib_t = h.transpose() * dc.rows(oi, di);
                for q in 0..dj {
                    out_c[oj + q] += contrib_t[q];
                }
            }
        }
        let mut out_p: Vec<Vector3<f64>> =
            self.point_w.iter().zip(dp).map(|(w, d)| w * d).collect();
        for (slot, entries) in self.point_e.iter().enumerate() {
            for (bi, e) in entries {
                let off = self.cam_offsets[*bi];
                let di = self.cam_dims[*bi];
                let dp_vec = DVector::from_vec(vec![dp[slot].x, dp[slot].y, dp[slot].z]);
                let contrib = e * &dp_vec;
                for q in 0..di {
                    out_c[off + q] += contrib[q];
                }
                let et_dc = e.transpose() * dc.rows(off, di);
                out_p[slot] += Vector3::new(et_dc[0], et_dc[1], et_dc[2]);
            }
        }
        (out_c, out_p)
    }

    /// Gradient dotted with a step, for predicted-reduction checks.
    pub fn gradient_dot(&self, dc: &DVector<f64>, dp: &[Vector3<f64>]) -> f64 {
        let mut dot = self.gc.dot(dc);
        for (g, d) in self.point_g.iter().zip(dp) {
            dot += g.dot(d);
        }
        dot
    }

    /// Solve the damped step `(H + lambda D) delta = -g` with the requested
    /// strategy. `None` signals a numerically failed factorisation; the
    /// caller raises the damping and retries.
    pub fn solve(
        &self,
        lambda: f64,
        kind: LinearSolverKind,
    ) -> Option<(DVector<f64>, Vec<Vector3<f64>>)> {
        let w_inv = self.damped_w_inverses(lambda)?;
        let rhs = self.schur_rhs(&w_inv);

        let dc = if self.cam_dim == 0 {
            DVector::zeros(0)
        } else {
            match kind {
                LinearSolverKind::DenseSchur => {
                    let s_blocks = self.schur_blocks(lambda, &w_inv);
                    let mut s = DMatrix::zeros(self.cam_dim, self.cam_dim);
                    for (&(bi, bj), block) in &s_blocks {
                        let (oi, oj) = (self.cam_offsets[bi], self.cam_offsets[bj]);
                        for i in 0..block.nrows() {
                            for j in 0..block.ncols() {
                                s[(oi + i, oj + j)] = block[(i, j)];
                                if bi != bj {
                                    s[(oj + j, oi + i)] = block[(i, j)];
                                }
                            }
                        }
                    }
                    s.cholesky().map(|chol| chol.solve(&rhs))?
                }
                LinearSolverKind::SparseSchur => {
                    let s_blocks = self.schur_blocks(lambda, &w_inv);
                    self.solve_sparse_direct(&s_blocks, &rhs)?
                }
                LinearSolverKind::IterativeSchur { explicit_schur } => {
                    let solution = if explicit_schur {
                        let s_blocks = self.schur_blocks(lambda, &w_inv);
                        let precond = self.block_jacobi(&s_blocks)?;
                        self.pcg(
                            |x| Self::apply_blocks(&s_blocks, &self.cam_offsets, x),
                            &precond,
                            &rhs,
                        )
                    } else {
                        // Implicit: apply S through its factors. The
                        // Schur-Jacobi preconditioner still needs the
                        // diagonal blocks, which are cheap to form.
                        let mut diag = HashMap::new();
                        for bi in 0..self.cam_dims.len() {
                            diag.insert((bi, bi), self.schur_diag_block(bi, lambda, &w_inv));
                        }
                        let precond = self.block_jacobi(&diag)?;
                        self.pcg(|x| self.apply_schur_implicit(x, lambda, &w_inv), &precond, &rhs)
                    };
                    solution?
                }
            }
        };

        let dp = self.back_substitute(&dc, &w_inv);
        Some((dc, dp))
    }

    fn solve_sparse_direct(
        &self,
        s_blocks: &HashMap<(usize, usize), DMatrix<f64>>,
        rhs: &DVector<f64>,
    ) -> Option<DVector<f64>> {
        let n = self.cam_dim;
        let mut triplets: Vec<Triplet<usize, usize, f64>> = Vec::new();
        for (&(bi, bj), block) in s_blocks {
            let (oi, oj) = (self.cam_offsets[bi], self.cam_offsets[bj]);
            for i in 0..block.nrows() {
                for j in 0..block.ncols() {
                    let v = block[(i, j)];
                    if v != 0.0 {
                        triplets.push(Triplet::new(oi + i, oj + j, v));
                        if bi != bj {
                            triplets.push(Triplet::new(oj + j, oi + i, v));
                        }
                    }
                }
            }
        }
        let s = SparseColMat::try_new_from_triplets(n, n, &triplets).ok()?;
        let llt = s.as_ref().sp_cholesky(Side::Lower).ok()?;
        let mut rhs_mat = Mat::zeros(n, 1);
        for i in 0..n {
            rhs_mat[(i, 0)] = rhs[i];
        }
        let sol = llt.solve(&rhs_mat);
        Some(DVector::from_fn(n, |i, _| sol[(i, 0)]))
    }

    fn apply_blocks(
        blocks: &HashMap<(usize, usize), DMatrix<f64>>,
        offsets: &[usize],
        x: &DVector<f64>,
    ) -> DVector<f64> {
        let mut y = DVector::zeros(x.len());
        for (&(bi, bj), block) in blocks {
            let (oi, oj) = (offsets[bi], offsets[bj]);
            let contrib = block * x.rows(oj, block.ncols());
            for q in 0..block.nrows() {
                y[oi + q] += contrib[q];
            }
            if bi != bj {
                let contrib_t = block.transpose() * x.rows(oi, block.nrows());
                for q in 0..block.ncols() {
                    y[oj + q] += contrib_t[q];
                }
            }
        }
        y
    }

    /// `S x` without forming S: `H_cc x - E (W^-1 (E^T x))` with damping.
    fn apply_schur_implicit(
        &self,
        x: &DVector<f64>,
        lambda: f64,
        w_inv: &[Matrix3<f64>],
    ) -> DVector<f64> {
        let mut y = DVector::zeros(x.len());
        for (&(bi, bj), h) in &self.hcc {
            let damped;
            let block = if bi == bj {
                damped = Self::damped_diag(h, lambda);
                &damped
            } else {
                h
            };
            let (oi, oj) = (self.cam_offsets[bi], self.cam_offsets[bj]);
            let contrib = block * x.rows(oj, block.ncols());
            for q in 0..block.nrows() {
                y[oi + q] += contrib[q];
            }
            if bi != bj {
                let contrib_t = block.transpose() * x.rows(oi, block.nrows());
                for q in 0..block.ncols() {
                    y[oj + q] += contrib_t[q];
                }
            }
        }
        for (slot, entries) in self.point_e.iter().enumerate() {
            let mut etx = Vector3::zeros();
            for (bi, e) in entries {
                let off = self.cam_offsets[*bi];
                let v = e.transpose() * x.rows(off, self.cam_dims[*bi]);
                etx += Vector3::new(v[0], v[1], v[2]);
            }
            let w = w_inv[slot] * etx;
            let w = DVector::from_vec(vec![w.x, w.y, w.z]);
            for (bi, e) in entries {
                let off = self.cam_offsets[*bi];
                let contrib = e * &w;
                for q in 0..contrib.len() {
                    y[off + q] -= contrib[q];
                }
            }
        }
        y
    }

    /// Inverted diagonal blocks (the Schur-Jacobi preconditioner).
    fn block_jacobi(
        &self,
        s_blocks: &HashMap<(usize, usize), DMatrix<f64>>,
    ) -> Option<Vec<DMatrix<f64>>> {
        let mut inv = Vec::with_capacity(self.cam_dims.len());
        for bi in 0..self.cam_dims.len() {
            match s_blocks.get(&(bi, bi)) {
                Some(block) => inv.push(block.clone().try_inverse()?),
                None => inv.push(DMatrix::identity(self.cam_dims[bi], self.cam_dims[bi])),
            }
        }
        Some(inv)
    }

    fn apply_precond(&self, inv_blocks: &[DMatrix<f64>], r: &DVector<f64>) -> DVector<f64> {
        let mut z = DVector::zeros(r.len());
        for (bi, inv) in inv_blocks.iter().enumerate() {
            let off = self.cam_offsets[bi];
            let zi = inv * r.rows(off, self.cam_dims[bi]);
            for q in 0..zi.len() {
                z[off + q] = zi[q];
            }
        }
        z
    }

    /// Preconditioned conjugate gradients on the reduced system.
    fn pcg<F>(&self, op: F, precond: &[DMatrix<f64>], rhs: &DVector<f64>) -> Option<DVector<f64>>
    where
        F: Fn(&DVector<f64>) -> DVector<f64>,
    {
        let n = rhs.len();
        let max_iterations = n.min(500).max(10);
        let rhs_norm = rhs.norm();
        if rhs_norm == 0.0 {
            return Some(DVector::zeros(n));
        }

        let mut x = DVector::zeros(n);
        let mut r = rhs.clone();
        let mut z = self.apply_precond(precond, &r);
        let mut p = z.clone();
        let mut rz = r.dot(&z);

        for _ in 0..max_iterations {
            let ap = op(&p);
            let pap = p.dot(&ap);
            if !pap.is_finite() || pap.abs() < 1e-300 {
                return None;
            }
            let alpha = rz / pap;
            x += alpha * &p;
            r -= alpha * &ap;
            if r.norm() <= CG_TOLERANCE * rhs_norm {
                break;
            }
            z = self.apply_precond(precond, &r);
            let rz_new = r.dot(&z);
            let beta = rz_new / rz;
            rz = rz_new;
            p = &z + beta * &p;
        }
        if x.iter().all(|v| v.is_finite()) {
            Some(x)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DMatrix;

    #[test]
    fn test_solver_selection_by_size() {
        assert_eq!(select_linear_solver(50), LinearSolverKind::DenseSchur);
        assert_eq!(select_linear_solver(99), LinearSolverKind::DenseSchur);
        assert_eq!(select_linear_solver(100), LinearSolverKind::SparseSchur);
        assert_eq!(select_linear_solver(1000), LinearSolverKind::SparseSchur);
        assert_eq!(select_linear_solver(3500), LinearSolverKind::SparseSchur);
        assert_eq!(
            select_linear_solver(5000),
            LinearSolverKind::IterativeSchur {
                explicit_schur: true
            }
        );
        assert_eq!(
            select_linear_solver(10000),
            LinearSolverKind::IterativeSchur {
                explicit_schur: false
            }
        );
    }

    /// Build a tiny two-block system directly and check all four strategies
    /// agree on the solution of `H d = -g`.
    fn toy_system() -> SchurSystem {
        let mut hcc = HashMap::new();
        hcc.insert(
            (0usize, 0usize),
            DMatrix::from_diagonal_element(2, 2, 4.0),
        );
        let e = DMatrix::from_row_slice(2, 3, &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
        SchurSystem {
            cam_dim: 2,
            hcc,
            gc: DVector::from_vec(vec![1.0, -2.0]),
            point_w: vec![Matrix3::from_diagonal_element(5.0)],
            point_g: vec![Vector3::new(0.5, 0.5, -1.0)],
            point_e: vec![vec![(0usize, e)]],
            cam_dims: vec![2],
            cam_offsets: vec![0],
        }
    }

    #[test]
    fn test_strategies_agree() {
        let system = toy_system();
        let kinds = [
            LinearSolverKind::DenseSchur,
            LinearSolverKind::SparseSchur,
            LinearSolverKind::IterativeSchur {
                explicit_schur: true,
            },
            LinearSolverKind::IterativeSchur {
                explicit_schur: false,
            },
        ];
        let (dc0, dp0) = system.solve(0.0, kinds[0]).unwrap();
        for kind in &kinds[1..] {
            let (dc, dp) = system.solve(0.0, *kind).unwrap();
            assert!((dc.clone() - dc0.clone()).norm() < 1e-8, "{kind} disagrees");
            for (a, b) in dp.iter().zip(dp0.iter()) {
                assert!((a - b).norm() < 1e-8);
            }
        }
        // The solution satisfies the full normal equations.
        let (hc, hp) = system.apply_hessian(&dc0, &dp0);
        assert!((hc + system.gc.clone()).norm() < 1e-8);
        for (slot, hpv) in hp.iter().enumerate() {
            assert!((hpv + system.point_g[slot]).norm() < 1e-8);
        }
    }

    #[test]
    fn test_damping_shrinks_step() {
        let system = toy_system();
        let (dc0, _) = system.solve(0.0, LinearSolverKind::DenseSchur).unwrap();
        let (dc1, _) = system.solve(10.0, LinearSolverKind::DenseSchur).unwrap();
        assert!(dc1.norm() < dc0.norm());
    }
}
