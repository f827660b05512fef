//! faer-backed dense linear algebra over `ndarray` views.
//!
//! The GLM layers work in `ndarray` types end to end; this module is the
//! only place that crosses into `faer` for the decompositions (SVD for
//! pseudo-inverses and rank/condition diagnostics, Cholesky for the small
//! SPD systems of the heteroscedastic test). Views borrow when the memory
//! order allows and copy otherwise, so callers never worry about layout.

use dyn_stack::{MemBuffer, MemStack};
use faer::diag::{Diag, DiagRef};
use faer::linalg::solvers::{self, Solve};
use faer::linalg::svd::{self, ComputeSvdVectors};
use faer::{get_global_parallelism, Mat, MatRef, Side};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinalgError {
    #[error("SVD failed to converge")]
    SvdNoConvergence,
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(solvers::LltError),
}

fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

fn diag_to_array(diag: DiagRef<'_, f64>) -> Array1<f64> {
    let col = diag.column_vector().as_mat();
    Array1::from_shape_fn(col.nrows(), |i| col[(i, 0)])
}

enum FaerStorage<'a> {
    Borrowed(MatRef<'a, f64>),
    Owned(Mat<f64>),
}

/// Borrow-or-copy adaptor from an `ndarray` matrix to a faer view.
pub struct FaerArrayView<'a> {
    storage: FaerStorage<'a>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let storage = if let Some(slice) = array.as_slice_memory_order() {
            if array.is_standard_layout() {
                FaerStorage::Borrowed(MatRef::from_row_major_slice(
                    slice,
                    array.nrows(),
                    array.ncols(),
                ))
            } else if array.t().is_standard_layout() {
                FaerStorage::Borrowed(MatRef::from_column_major_slice(
                    slice,
                    array.nrows(),
                    array.ncols(),
                ))
            } else {
                let (rows, cols) = array.dim();
                FaerStorage::Owned(Mat::from_fn(rows, cols, |i, j| array[(i, j)]))
            }
        } else {
            let (rows, cols) = array.dim();
            FaerStorage::Owned(Mat::from_fn(rows, cols, |i, j| array[(i, j)]))
        };
        Self { storage }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        match &self.storage {
            FaerStorage::Borrowed(view) => *view,
            FaerStorage::Owned(mat) => mat.as_ref(),
        }
    }
}

/// Full SVD: `(U, S, Vᵀ)` with square `U` (m×m) and `Vᵀ` (n×n).
pub fn svd_parts<S: Data<Elem = f64>>(
    array: &ArrayBase<S, Ix2>,
) -> Result<(Array2<f64>, Array1<f64>, Array2<f64>), LinalgError> {
    let view = FaerArrayView::new(array);
    let mat = view.as_ref();
    let (rows, cols) = mat.shape();

    let mut singular = Diag::<f64>::zeros(rows.min(cols));
    let mut u = Mat::<f64>::zeros(rows, rows);
    let mut v = Mat::<f64>::zeros(cols, cols);

    let par = get_global_parallelism();
    let mut mem = MemBuffer::new(svd::svd_scratch::<f64>(
        rows,
        cols,
        ComputeSvdVectors::Full,
        ComputeSvdVectors::Full,
        par,
        Default::default(),
    ));
    let mut stack = MemStack::new(&mut mem);
    svd::svd(
        mat,
        singular.as_mut(),
        Some(u.as_mut()),
        Some(v.as_mut()),
        par,
        &mut stack,
        Default::default(),
    )
    .map_err(|_| LinalgError::SvdNoConvergence)?;

    let vt = {
        let v_ref = v.as_ref();
        Array2::from_shape_fn((v_ref.ncols(), v_ref.nrows()), |(i, j)| v_ref[(j, i)])
    };
    Ok((mat_to_array(u.as_ref()), diag_to_array(singular.as_ref()), vt))
}

/// Singular values only.
pub fn singular_values<S: Data<Elem = f64>>(
    array: &ArrayBase<S, Ix2>,
) -> Result<Array1<f64>, LinalgError> {
    let view = FaerArrayView::new(array);
    let mat = view.as_ref();
    let (rows, cols) = mat.shape();
    let mut singular = Diag::<f64>::zeros(rows.min(cols));
    let par = get_global_parallelism();
    let mut mem = MemBuffer::new(svd::svd_scratch::<f64>(
        rows,
        cols,
        ComputeSvdVectors::No,
        ComputeSvdVectors::No,
        par,
        Default::default(),
    ));
    let mut stack = MemStack::new(&mut mem);
    svd::svd(
        mat,
        singular.as_mut(),
        None,
        None,
        par,
        &mut stack,
        Default::default(),
    )
    .map_err(|_| LinalgError::SvdNoConvergence)?;
    Ok(diag_to_array(singular.as_ref()))
}

fn rank_tolerance(shape: (usize, usize), s_max: f64) -> f64 {
    shape.0.max(shape.1) as f64 * f64::EPSILON * s_max
}

/// Moore–Penrose pseudo-inverse via SVD with the usual `max(m,n)·ε·σ_max`
/// cutoff on singular values.
pub fn pinv<S: Data<Elem = f64>>(array: &ArrayBase<S, Ix2>) -> Result<Array2<f64>, LinalgError> {
    let (rows, cols) = array.dim();
    if rows == 0 || cols == 0 {
        return Ok(Array2::zeros((cols, rows)));
    }
    let (u, s, vt) = svd_parts(array)?;
    let s_max = s.iter().cloned().fold(0.0_f64, f64::max);
    let tol = rank_tolerance((rows, cols), s_max);

    // A⁺ = V · diag(1/σ) · Uᵀ over the singular values above the cutoff.
    let mut out = Array2::<f64>::zeros((cols, rows));
    for (k, &sigma) in s.iter().enumerate() {
        if sigma <= tol {
            continue;
        }
        let inv = 1.0 / sigma;
        let v_col = vt.row(k);
        let u_col = u.column(k);
        for i in 0..cols {
            let vi = v_col[i] * inv;
            for j in 0..rows {
                out[[i, j]] += vi * u_col[j];
            }
        }
    }
    Ok(out)
}

/// Numerical rank and 2-norm condition number of a matrix.
pub fn rank_and_condition<S: Data<Elem = f64>>(
    array: &ArrayBase<S, Ix2>,
) -> Result<(usize, f64), LinalgError> {
    let s = singular_values(array)?;
    if s.is_empty() {
        return Ok((0, 1.0));
    }
    let s_max = s.iter().cloned().fold(0.0_f64, f64::max);
    let s_min = s.iter().cloned().fold(f64::INFINITY, f64::min);
    let tol = rank_tolerance(array.dim(), s_max);
    let rank = s.iter().filter(|&&v| v > tol).count();
    let cond = if s_min > 0.0 { s_max / s_min } else { f64::INFINITY };
    Ok((rank, cond))
}

/// Least squares `argmin_B ‖A·B − Y‖` for every column of `Y` at once,
/// through the pseudo-inverse. One decomposition per call regardless of the
/// number of right-hand sides.
pub fn lstsq<S1: Data<Elem = f64>, S2: Data<Elem = f64>>(
    a: &ArrayBase<S1, Ix2>,
    y: &ArrayBase<S2, Ix2>,
) -> Result<Array2<f64>, LinalgError> {
    Ok(pinv(a)?.dot(y))
}

/// Cholesky factor of an SPD matrix, retained for repeated solves.
pub struct CholeskyFactor {
    factor: solvers::Llt<f64>,
}

impl CholeskyFactor {
    pub fn solve_mat(&self, rhs: &Array2<f64>) -> Array2<f64> {
        let rhs_view = FaerArrayView::new(rhs);
        let sol = self.factor.solve(rhs_view.as_ref());
        mat_to_array(sol.as_ref())
    }
}

/// Factors an SPD `ndarray` matrix with faer's LLᵀ.
pub fn cholesky<S: Data<Elem = f64>>(
    array: &ArrayBase<S, Ix2>,
) -> Result<CholeskyFactor, LinalgError> {
    let view = FaerArrayView::new(array);
    let factor = view
        .as_ref()
        .llt(Side::Lower)
        .map_err(LinalgError::Cholesky)?;
    Ok(CholeskyFactor { factor })
}
