//! Voxel-wise GLM test kernel.
//!
//! For a hypothesis expressed as a contrast matrix `C` over the design
//! `D`, the design is split with the Beckmann/Smith partition into tested
//! columns `X = D·C⁺` and nuisance columns `Z` spanning the null space of
//! `C`. Inference follows the Freedman–Lane scheme: the statistic — for
//! the observed data and for every permutation — is computed on the
//! nuisance-residualized data `P·R_z·Y`, so nuisance effects cannot leak
//! into the permutation null.
//!
//! Two statistics are available: the classical F assuming a shared
//! residual variance, and a Welch-style G that re-weights by per-group
//! residual variances when the variance-group structure says the sites
//! cannot be pooled.
//!
//! Everything is voxel-vectorized: one pseudo-inverse per call, matrix
//! products over the full (n × V) data block, and only the small per-voxel
//! weighted systems of the G statistic are solved individually.

use std::sync::{Arc, Mutex};

use ahash::AHasher;
use ndarray::{Array1, Array2, Axis};
use std::hash::Hasher;
use thiserror::Error;

use crate::linalg::{self, LinalgError};
use crate::shuffle::Shuffle;

/// Condition numbers above this draw a warning; the fit still proceeds.
const CONDITION_WARN: f64 = 1e8;

/// Bounded size of the per-hypothesis partition memo.
const PARTITION_CACHE_CAP: usize = 8;

#[derive(Error, Debug)]
pub enum GlmError {
    #[error("design matrix is rank deficient (rank {rank} of {columns} columns)")]
    RankDeficient { rank: usize, columns: usize },
    #[error("data has {found} rows but the design has {expected}")]
    DataRowMismatch { found: usize, expected: usize },
    #[error("contrast has {found} columns but the design has {expected}")]
    ContrastWidthMismatch { found: usize, expected: usize },
    #[error("contrast matrix has rank 0")]
    NullContrast,
    #[error("variance groups cover {found} subjects, expected {expected}")]
    VarianceGroupMismatch { found: usize, expected: usize },
    #[error("shuffle permutes {found} subjects, expected {expected}")]
    ShuffleLengthMismatch { found: usize, expected: usize },
    #[error(transparent)]
    Linalg(#[from] LinalgError),
}

/// Design partition for one (design, contrast) pair. Immutable once built;
/// shared across permutation workers.
#[derive(Debug)]
pub struct Partition {
    /// Tested columns, `D·C⁺` (n × rank-related width).
    pub x: Array2<f64>,
    /// Nuisance columns spanning null(C) in design space.
    pub z: Array2<f64>,
    /// Projector onto the nuisance span.
    pub hz: Array2<f64>,
    /// Residual-forming matrix `I − H_z`.
    pub rz: Array2<f64>,
}

/// A testable contrast with its partition memo.
#[derive(Debug)]
pub struct Hypothesis {
    matrix: Array2<f64>,
    pub index: usize,
    pub name: String,
    rank: usize,
    multi_row: bool,
    cache: Mutex<Vec<(u64, Arc<Partition>)>>,
}

impl Hypothesis {
    /// Multi-row contrast: an F-style hypothesis.
    pub fn new(contrast: Array2<f64>, index: usize) -> Result<Self, GlmError> {
        let name = format!("F{index}");
        Self::with_name(contrast, index, name)
    }

    /// Single-row contrast: a t-style hypothesis.
    pub fn from_row(contrast: Array1<f64>, index: usize) -> Result<Self, GlmError> {
        let name = format!("t{index}");
        let matrix = contrast.insert_axis(Axis(0));
        Self::with_name(matrix, index, name)
    }

    pub fn with_name(
        contrast: Array2<f64>,
        index: usize,
        name: impl Into<String>,
    ) -> Result<Self, GlmError> {
        let (rank, _) = linalg::rank_and_condition(&contrast)?;
        if rank == 0 {
            return Err(GlmError::NullContrast);
        }
        Ok(Hypothesis {
            multi_row: contrast.nrows() > 1,
            matrix: contrast,
            index,
            name: name.into(),
            rank,
            cache: Mutex::new(Vec::new()),
        })
    }

    pub fn contrast(&self) -> &Array2<f64> {
        &self.matrix
    }

    /// Number of design columns the contrast addresses.
    pub fn cols(&self) -> usize {
        self.matrix.ncols()
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// True for multi-row (F) hypotheses.
    pub fn is_f(&self) -> bool {
        self.multi_row
    }

    /// Beckmann/Smith partition of a design for this contrast, memoized on
    /// the design's fingerprint. The memo is bounded; unrelated designs
    /// evict the oldest entry.
    pub fn partition(&self, design: &Array2<f64>) -> Result<Arc<Partition>, GlmError> {
        if design.ncols() != self.matrix.ncols() {
            return Err(GlmError::ContrastWidthMismatch {
                found: self.matrix.ncols(),
                expected: design.ncols(),
            });
        }
        let key = fingerprint(design);
        {
            let cache = self.cache.lock().unwrap();
            if let Some((_, partition)) = cache.iter().find(|(k, _)| *k == key) {
                return Ok(Arc::clone(partition));
            }
        }
        let partition = Arc::new(self.compute_partition(design)?);
        let mut cache = self.cache.lock().unwrap();
        if cache.len() >= PARTITION_CACHE_CAP {
            cache.remove(0);
        }
        cache.push((key, Arc::clone(&partition)));
        Ok(partition)
    }

    fn compute_partition(&self, design: &Array2<f64>) -> Result<Partition, GlmError> {
        let n = design.nrows();
        let p = design.ncols();

        let c_pinv = linalg::pinv(&self.matrix)?; // p × c
        let x = design.dot(&c_pinv);

        // Null-space basis of C from the trailing right-singular vectors.
        let nullity = p - self.rank;
        let z = if nullity == 0 {
            Array2::<f64>::zeros((n, 0))
        } else {
            let (_, _, vt) = linalg::svd_parts(&self.matrix)?;
            let mut basis = Array2::<f64>::zeros((p, nullity));
            for (col, row) in (self.rank..p).enumerate() {
                basis.column_mut(col).assign(&vt.row(row));
            }
            design.dot(&basis)
        };

        let (hz, rz) = if z.ncols() == 0 {
            (Array2::zeros((n, n)), Array2::eye(n))
        } else {
            let hz = z.dot(&linalg::pinv(&z)?);
            let rz = Array2::eye(n) - &hz;
            (hz, rz)
        };

        Ok(Partition { x, z, hz, rz })
    }
}

/// Contrast testing all site dummies of the two-stage/inference design
/// `[intercept, site dummies (k−1), covariates]`.
pub fn create_site_contrast(n_sites: usize, n_covariates: usize) -> Hypothesis {
    let p = 1 + (n_sites - 1) + n_covariates;
    let rows = n_sites - 1;
    if rows == 1 {
        let mut contrast = Array1::<f64>::zeros(p);
        contrast[1] = 1.0;
        let mut hypothesis = Hypothesis::from_row(contrast, 0)
            .expect("a unit contrast row always has rank 1");
        hypothesis.name = "site_effect".to_string();
        hypothesis
    } else {
        let mut contrast = Array2::<f64>::zeros((rows, p));
        for row in 0..rows {
            contrast[[row, 1 + row]] = 1.0;
        }
        let mut hypothesis = Hypothesis::new(contrast, 0)
            .expect("distinct unit contrast rows are full rank");
        hypothesis.name = "site_effect".to_string();
        hypothesis
    }
}

fn fingerprint(design: &Array2<f64>) -> u64 {
    let mut hasher = AHasher::default();
    hasher.write_usize(design.nrows());
    hasher.write_usize(design.ncols());
    for &value in design.iter() {
        hasher.write_u64(value.to_bits());
    }
    hasher.finish()
}

/// Per-hypothesis output of one evaluation.
#[derive(Debug, Clone)]
pub struct TestOutput {
    pub name: String,
    /// F or G value per voxel.
    pub statistic: Array1<f64>,
    /// `C·β̂` for rank-1 contrasts.
    pub effect_size: Option<Array1<f64>>,
    /// Standard error of the rank-1 effect.
    pub std_error: Option<Array1<f64>>,
}

fn column_sum_squares(data: &Array2<f64>) -> Array1<f64> {
    data.map_axis(Axis(0), |col| col.iter().map(|v| v * v).sum())
}

fn apply_shuffle(data: &Array2<f64>, shuffle: Option<&Shuffle>) -> Result<Array2<f64>, GlmError> {
    match shuffle {
        None => Ok(data.clone()),
        Some(shuffle) => {
            if shuffle.order.len() != data.nrows() {
                return Err(GlmError::ShuffleLengthMismatch {
                    found: shuffle.order.len(),
                    expected: data.nrows(),
                });
            }
            let mut out = Array2::zeros(data.raw_dim());
            for (row, &source) in shuffle.order.iter().enumerate() {
                out.row_mut(row).assign(&data.row(source));
            }
            Ok(out)
        }
    }
}

/// Shared state of both fixed-design tests.
#[derive(Debug)]
struct FitState {
    design: Array2<f64>,
    pinv_design: Array2<f64>,
    rank_design: usize,
    hypotheses: Vec<Hypothesis>,
    partitions: Vec<Arc<Partition>>,
    /// Per hypothesis: `R_z·Y`, the nuisance-residualized data.
    residualized: Vec<Array2<f64>>,
    /// Per hypothesis: pinv of the nuisance block (empty matrix when the
    /// contrast spans the whole design).
    pinv_z: Vec<Array2<f64>>,
    n: usize,
}

impl FitState {
    fn new(
        data: Array2<f64>,
        design: Array2<f64>,
        hypotheses: Vec<Hypothesis>,
    ) -> Result<Self, GlmError> {
        let n = design.nrows();
        if data.nrows() != n {
            return Err(GlmError::DataRowMismatch {
                found: data.nrows(),
                expected: n,
            });
        }
        let (rank, cond) = linalg::rank_and_condition(&design)?;
        if rank < design.ncols() {
            return Err(GlmError::RankDeficient {
                rank,
                columns: design.ncols(),
            });
        }
        if cond > CONDITION_WARN {
            log::warn!(
                "design condition number {cond:.2e} exceeds {CONDITION_WARN:.0e}; \
                 estimates may be unstable"
            );
        }

        let pinv_design = linalg::pinv(&design)?;
        let mut partitions = Vec::with_capacity(hypotheses.len());
        let mut residualized = Vec::with_capacity(hypotheses.len());
        let mut pinv_z = Vec::with_capacity(hypotheses.len());
        for hypothesis in &hypotheses {
            let partition = hypothesis.partition(&design)?;
            residualized.push(partition.rz.dot(&data));
            pinv_z.push(if partition.z.ncols() == 0 {
                Array2::zeros((0, n))
            } else {
                linalg::pinv(&partition.z)?
            });
            partitions.push(partition);
        }
        Ok(FitState {
            design,
            pinv_design,
            rank_design: rank,
            hypotheses,
            partitions,
            residualized,
            pinv_z,
            n,
        })
    }

    /// Full- and reduced-model sums of squared errors on already-permuted
    /// data, plus the full-model coefficients.
    fn sse_pair(
        &self,
        idx: usize,
        permuted: &Array2<f64>,
    ) -> (Array2<f64>, Array2<f64>, Array1<f64>, Array1<f64>) {
        let betas = self.pinv_design.dot(permuted);
        let residuals = permuted - &self.design.dot(&betas);
        let sse = column_sum_squares(&residuals);

        let partition = &self.partitions[idx];
        let sse0 = if partition.z.ncols() == 0 {
            column_sum_squares(permuted)
        } else {
            let betas_z = self.pinv_z[idx].dot(permuted);
            let residuals_z = permuted - &partition.z.dot(&betas_z);
            column_sum_squares(&residuals_z)
        };
        (betas, residuals, sse, sse0)
    }

    fn effect_and_error(
        &self,
        hypothesis: &Hypothesis,
        betas: &Array2<f64>,
        sse: &Array1<f64>,
    ) -> (Option<Array1<f64>>, Option<Array1<f64>>) {
        if hypothesis.is_f() || hypothesis.rank() != 1 {
            return (None, None);
        }
        let contrast = hypothesis.contrast();
        let effect = contrast.dot(betas).index_axis(Axis(0), 0).to_owned();
        // Var(C·β̂) = σ̂² · ‖C·D⁺‖², with σ̂² the residual variance.
        let c_pinv = contrast.dot(&self.pinv_design);
        let scale: f64 = c_pinv.row(0).iter().map(|v| v * v).sum();
        let dof = (self.n - self.rank_design).max(1) as f64;
        let std_error = sse.mapv(|s| (s / dof * scale).sqrt());
        (Some(effect), Some(std_error))
    }
}

/// Homoscedastic fixed-design test: the classical partitioned F.
#[derive(Debug)]
pub struct TestFixedHomoscedastic {
    state: FitState,
}

impl TestFixedHomoscedastic {
    pub fn new(
        data: Array2<f64>,
        design: Array2<f64>,
        hypotheses: Vec<Hypothesis>,
    ) -> Result<Self, GlmError> {
        Ok(TestFixedHomoscedastic {
            state: FitState::new(data, design, hypotheses)?,
        })
    }

    /// Full-model coefficients on the identity shuffle's residualized data
    /// for the first hypothesis.
    pub fn solve_betas(&self) -> Array2<f64> {
        self.state.pinv_design.dot(&self.state.residualized[0])
    }

    /// Residuals of the full model for the first hypothesis.
    pub fn residuals(&self) -> Array2<f64> {
        let permuted = &self.state.residualized[0];
        let betas = self.state.pinv_design.dot(permuted);
        permuted - &self.state.design.dot(&betas)
    }

    /// Evaluates every hypothesis; `None` is the identity shuffle.
    pub fn run(&self, shuffle: Option<&Shuffle>) -> Result<Vec<TestOutput>, GlmError> {
        let mut outputs = Vec::with_capacity(self.state.hypotheses.len());
        for (idx, hypothesis) in self.state.hypotheses.iter().enumerate() {
            let permuted = apply_shuffle(&self.state.residualized[idx], shuffle)?;
            let (betas, _residuals, sse, sse0) = self.state.sse_pair(idx, &permuted);

            let rank_c = hypothesis.rank() as f64;
            let dof = (self.state.n - self.state.rank_design).max(1) as f64;
            let statistic = Array1::from_shape_fn(sse.len(), |v| {
                let numerator = (sse0[v] - sse[v]).max(0.0) / rank_c;
                let denominator = sse[v] / dof;
                let f = numerator / denominator;
                if f.is_nan() { 0.0 } else { f }
            });

            let (effect_size, std_error) = self.state.effect_and_error(hypothesis, &betas, &sse);
            outputs.push(TestOutput {
                name: hypothesis.name.clone(),
                statistic,
                effect_size,
                std_error,
            });
        }
        Ok(outputs)
    }
}

/// Heteroscedastic fixed-design test: Welch-style G over variance groups.
pub struct TestFixedHeteroscedastic {
    state: FitState,
    /// Subject positions per variance group.
    group_positions: Vec<Vec<usize>>,
    /// Per-group residual degrees of freedom `n_g − Σ_{i∈g} H_ii`.
    group_dof: Vec<f64>,
    /// Per-group Gram blocks `M_gᵀ·M_g`.
    group_gram: Vec<Array2<f64>>,
}

impl TestFixedHeteroscedastic {
    pub fn new(
        data: Array2<f64>,
        design: Array2<f64>,
        hypotheses: Vec<Hypothesis>,
        variance_groups: &[usize],
    ) -> Result<Self, GlmError> {
        if variance_groups.len() != design.nrows() {
            return Err(GlmError::VarianceGroupMismatch {
                found: variance_groups.len(),
                expected: design.nrows(),
            });
        }
        let state = FitState::new(data, design, hypotheses)?;

        let mut labels: Vec<usize> = Vec::new();
        let mut group_positions: Vec<Vec<usize>> = Vec::new();
        for (position, &label) in variance_groups.iter().enumerate() {
            match labels.iter().position(|&seen| seen == label) {
                Some(slot) => group_positions[slot].push(position),
                None => {
                    labels.push(label);
                    group_positions.push(vec![position]);
                }
            }
        }

        // Leverage per subject, H = D·D⁺; each group's dof subtracts the
        // leverage it spends on the model.
        let hat = state.design.dot(&state.pinv_design);
        let group_dof: Vec<f64> = group_positions
            .iter()
            .map(|positions| {
                let leverage: f64 = positions.iter().map(|&i| hat[[i, i]]).sum();
                (positions.len() as f64 - leverage).max(1e-6)
            })
            .collect();

        let p = state.design.ncols();
        let group_gram: Vec<Array2<f64>> = group_positions
            .iter()
            .map(|positions| {
                let mut gram = Array2::<f64>::zeros((p, p));
                for &i in positions {
                    let row = state.design.row(i);
                    for a in 0..p {
                        for b in 0..p {
                            gram[[a, b]] += row[a] * row[b];
                        }
                    }
                }
                gram
            })
            .collect();

        Ok(TestFixedHeteroscedastic {
            state,
            group_positions,
            group_dof,
            group_gram,
        })
    }

    pub fn run(&self, shuffle: Option<&Shuffle>) -> Result<Vec<TestOutput>, GlmError> {
        let p = self.state.design.ncols();
        let n_groups = self.group_positions.len();
        let mut outputs = Vec::with_capacity(self.state.hypotheses.len());

        for (idx, hypothesis) in self.state.hypotheses.iter().enumerate() {
            let permuted = apply_shuffle(&self.state.residualized[idx], shuffle)?;
            let (_betas, residuals, _sse, _sse0) = self.state.sse_pair(idx, &permuted);
            let n_voxels = permuted.ncols();

            // Per-group residual energy and cross-products with the design.
            let mut group_sse = Array2::<f64>::zeros((n_groups, n_voxels));
            for (g, positions) in self.group_positions.iter().enumerate() {
                for &i in positions {
                    for v in 0..n_voxels {
                        let r = residuals[[i, v]];
                        group_sse[[g, v]] += r * r;
                    }
                }
            }
            let mut group_xty: Vec<Array2<f64>> = Vec::with_capacity(n_groups);
            for positions in &self.group_positions {
                let mut xty = Array2::<f64>::zeros((p, n_voxels));
                for &i in positions {
                    let row = self.state.design.row(i);
                    for a in 0..p {
                        let coeff = row[a];
                        if coeff == 0.0 {
                            continue;
                        }
                        for v in 0..n_voxels {
                            xty[[a, v]] += coeff * permuted[[i, v]];
                        }
                    }
                }
                group_xty.push(xty);
            }

            let contrast = hypothesis.contrast();
            let s = hypothesis.rank() as f64;
            let welch_scale = 2.0 * (s - 1.0) / (s * (s + 2.0));

            let mut statistic = Array1::<f64>::zeros(n_voxels);
            for v in 0..n_voxels {
                // Weighted normal equations for this voxel.
                let mut weights = vec![0.0; n_groups];
                let mut weight_sum = 0.0;
                for g in 0..n_groups {
                    let w = self.group_dof[g] / group_sse[[g, v]].max(1e-12);
                    weights[g] = w;
                    weight_sum += w;
                }

                let mut system = Array2::<f64>::zeros((p, p));
                let mut rhs = Array2::<f64>::zeros((p, 1));
                for g in 0..n_groups {
                    let w = weights[g];
                    system.scaled_add(w, &self.group_gram[g]);
                    for a in 0..p {
                        rhs[[a, 0]] += w * group_xty[g][[a, v]];
                    }
                }

                let solved = match linalg::cholesky(&system) {
                    Ok(factor) => {
                        let beta_w = factor.solve_mat(&rhs);
                        let ct = contrast.t().to_owned();
                        let inv_ct = factor.solve_mat(&ct);
                        Some((beta_w, inv_ct))
                    }
                    Err(_) => None,
                };
                let (beta_w, inv_ct) = match solved {
                    Some(pair) => pair,
                    None => {
                        statistic[v] = 0.0;
                        continue;
                    }
                };

                // num = (Cβ)ᵀ [C S⁻¹ Cᵀ]⁻¹ (Cβ)
                let c_beta = contrast.dot(&beta_w); // c × 1
                let middle = contrast.dot(&inv_ct); // c × c
                let middle_pinv = match linalg::pinv(&middle) {
                    Ok(m) => m,
                    Err(_) => {
                        statistic[v] = 0.0;
                        continue;
                    }
                };
                let num = c_beta.t().dot(&middle_pinv.dot(&c_beta))[[0, 0]];

                let mut correction = 0.0;
                for g in 0..n_groups {
                    let frac = 1.0 - weights[g] / weight_sum;
                    correction += frac * frac / self.group_dof[g];
                }
                let denominator = 1.0 + welch_scale * correction;
                let g_stat = num / (s * denominator);
                statistic[v] = if g_stat.is_finite() { g_stat } else { 0.0 };
            }

            outputs.push(TestOutput {
                name: hypothesis.name.clone(),
                statistic,
                effect_size: None,
                std_error: None,
            });
        }
        Ok(outputs)
    }
}
