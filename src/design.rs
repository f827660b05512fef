//! Design matrix construction for harmonization and inference.
//!
//! Two parameterizations share the covariate machinery:
//!
//! - the **inference / two-stage** design `[intercept, site dummies (k−1),
//!   covariates]`, where the lexicographically first site is the implicit
//!   reference (its rows are all-zero across the site block);
//! - the **RISH-GLM** design with one indicator column per site and *no*
//!   intercept, so each site's β is directly the site-conditional mean and
//!   no site is privileged.
//!
//! Covariates are always z-scored; the means and standard deviations used
//! are returned so a fitted model can standardize new subjects identically.
//! Column order is deterministic: sites sorted lexicographically, then
//! covariate names sorted lexicographically.

use std::collections::BTreeMap;

use ndarray::{Array1, Array2};
use thiserror::Error;

use crate::linalg;

/// Standard deviations below this are treated as constant covariates.
const CONSTANT_STD_EPS: f64 = 1e-12;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DesignError {
    #[error("no subjects given; a design matrix needs at least one row")]
    EmptySubjects,
    #[error("covariate '{name}' has {found} values, expected {expected}")]
    CovariateLengthMismatch {
        name: String,
        found: usize,
        expected: usize,
    },
    #[error("covariate '{name}' contains a non-finite value at row {row}")]
    NonFiniteCovariate { name: String, row: usize },
}

/// A design matrix together with the bookkeeping needed to reproduce it.
#[derive(Debug, Clone)]
pub struct Design {
    /// n × p, rows in subject order.
    pub matrix: Array2<f64>,
    /// Column names, aligned with `matrix` columns.
    pub column_names: Vec<String>,
    /// Site label → column index of that site's dummy/indicator. For the
    /// two-stage design the reference site maps to `None`.
    pub site_columns: BTreeMap<String, Option<usize>>,
    /// Covariate means used for z-scoring, keyed by covariate name.
    pub cov_means: BTreeMap<String, f64>,
    /// Covariate standard deviations (1.0 for constant covariates).
    pub cov_stds: BTreeMap<String, f64>,
}

impl Design {
    pub fn n_subjects(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn n_columns(&self) -> usize {
        self.matrix.ncols()
    }
}

/// Z-scores each covariate vector; constant covariates get σ = 1 so they
/// standardize to all-zeros instead of NaN.
pub fn standardize_covariates(
    covariates: &BTreeMap<String, Vec<f64>>,
) -> (BTreeMap<String, Vec<f64>>, BTreeMap<String, f64>, BTreeMap<String, f64>) {
    let mut scored = BTreeMap::new();
    let mut means = BTreeMap::new();
    let mut stds = BTreeMap::new();
    for (name, values) in covariates {
        let n = values.len().max(1) as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
        let std = var.sqrt();
        let std = if std.abs() < CONSTANT_STD_EPS { 1.0 } else { std };
        scored.insert(
            name.clone(),
            values.iter().map(|v| (v - mean) / std).collect(),
        );
        means.insert(name.clone(), mean);
        stds.insert(name.clone(), std);
    }
    (scored, means, stds)
}

fn validate(
    site_labels: &[String],
    covariates: Option<&BTreeMap<String, Vec<f64>>>,
) -> Result<(), DesignError> {
    if site_labels.is_empty() {
        return Err(DesignError::EmptySubjects);
    }
    if let Some(covs) = covariates {
        for (name, values) in covs {
            if values.len() != site_labels.len() {
                return Err(DesignError::CovariateLengthMismatch {
                    name: name.clone(),
                    found: values.len(),
                    expected: site_labels.len(),
                });
            }
            if let Some(row) = values.iter().position(|v| !v.is_finite()) {
                return Err(DesignError::NonFiniteCovariate {
                    name: name.clone(),
                    row,
                });
            }
        }
    }
    Ok(())
}

fn sorted_sites(site_labels: &[String]) -> Vec<String> {
    let mut sites: Vec<String> = site_labels.to_vec();
    sites.sort();
    sites.dedup();
    sites
}

fn covariate_block(
    covariates: Option<&BTreeMap<String, Vec<f64>>>,
    standardize: bool,
) -> (Vec<(String, Vec<f64>)>, BTreeMap<String, f64>, BTreeMap<String, f64>) {
    match covariates {
        Some(covs) if !covs.is_empty() => {
            if standardize {
                let (scored, means, stds) = standardize_covariates(covs);
                (scored.into_iter().collect(), means, stds)
            } else {
                let columns = covs.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                (columns, BTreeMap::new(), BTreeMap::new())
            }
        }
        _ => (Vec::new(), BTreeMap::new(), BTreeMap::new()),
    }
}

/// Inference / two-stage design: `[intercept, site dummies (k−1), sorted
/// z-scored covariates]`. The lexicographically first site is the
/// reference and carries no column.
pub fn build_design_matrix(
    site_labels: &[String],
    covariates: Option<&BTreeMap<String, Vec<f64>>>,
    standardize: bool,
) -> Result<Design, DesignError> {
    validate(site_labels, covariates)?;
    let n = site_labels.len();
    let sites = sorted_sites(site_labels);
    let (cov_cols, cov_means, cov_stds) = covariate_block(covariates, standardize);

    let p = 1 + sites.len().saturating_sub(1) + cov_cols.len();
    let mut matrix = Array2::<f64>::zeros((n, p));
    let mut column_names = Vec::with_capacity(p);
    let mut site_columns = BTreeMap::new();

    matrix.column_mut(0).fill(1.0);
    column_names.push("intercept".to_string());

    site_columns.insert(sites[0].clone(), None);
    for (offset, site) in sites.iter().skip(1).enumerate() {
        let col = 1 + offset;
        column_names.push(format!("site_{site}"));
        site_columns.insert(site.clone(), Some(col));
        for (row, label) in site_labels.iter().enumerate() {
            if label == site {
                matrix[[row, col]] = 1.0;
            }
        }
    }

    let cov_start = 1 + sites.len() - 1;
    for (j, (name, values)) in cov_cols.iter().enumerate() {
        column_names.push(name.clone());
        for (row, &v) in values.iter().enumerate() {
            matrix[[row, cov_start + j]] = v;
        }
    }

    Ok(Design {
        matrix,
        column_names,
        site_columns,
        cov_means,
        cov_stds,
    })
}

/// RISH-GLM design: one indicator column per site (no intercept), then
/// sorted z-scored covariates. Every row has exactly one 1 in the site
/// block.
pub fn build_site_design(
    site_labels: &[String],
    covariates: Option<&BTreeMap<String, Vec<f64>>>,
) -> Result<Design, DesignError> {
    validate(site_labels, covariates)?;
    let n = site_labels.len();
    let sites = sorted_sites(site_labels);
    let (cov_cols, cov_means, cov_stds) = covariate_block(covariates, true);

    let p = sites.len() + cov_cols.len();
    let mut matrix = Array2::<f64>::zeros((n, p));
    let mut column_names = Vec::with_capacity(p);
    let mut site_columns = BTreeMap::new();

    for (col, site) in sites.iter().enumerate() {
        column_names.push(format!("site_{site}"));
        site_columns.insert(site.clone(), Some(col));
        for (row, label) in site_labels.iter().enumerate() {
            if label == site {
                matrix[[row, col]] = 1.0;
            }
        }
    }

    for (j, (name, values)) in cov_cols.iter().enumerate() {
        column_names.push(name.clone());
        for (row, &v) in values.iter().enumerate() {
            matrix[[row, sites.len() + j]] = v;
        }
    }

    Ok(Design {
        matrix,
        column_names,
        site_columns,
        cov_means,
        cov_stds,
    })
}

/// Numerical rank and condition number of a design, for collinearity
/// checks before fitting.
pub fn check_design(design: &Array2<f64>) -> Result<(usize, f64), linalg::LinalgError> {
    linalg::rank_and_condition(design)
}

/// Z-scores one subject's raw covariate values with stored means and
/// standard deviations, in the given covariate-name order. Names missing
/// from the subject map contribute z = 0 (the population mean).
pub fn standardize_subject(
    names: &[String],
    raw: &BTreeMap<String, f64>,
    means: &BTreeMap<String, f64>,
    stds: &BTreeMap<String, f64>,
) -> Array1<f64> {
    Array1::from_iter(names.iter().map(|name| {
        match (raw.get(name), means.get(name), stds.get(name)) {
            (Some(&value), Some(&mean), Some(&std)) => (value - mean) / std,
            _ => 0.0,
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn labels(groups: &[(&str, usize)]) -> Vec<String> {
        groups.iter()
            .flat_map(|&(site, count)| std::iter::repeat(site.to_string()).take(count))
            .collect()
    }

    #[test]
    fn two_sites_two_stage() {
        let design = build_design_matrix(&labels(&[("A", 3), ("B", 3)]), None, true).unwrap();
        assert_eq!(design.matrix.dim(), (6, 2));
        assert_eq!(design.column_names, vec!["intercept", "site_B"]);
        assert_eq!(design.site_columns["A"], None);
        assert_eq!(design.site_columns["B"], Some(1));
        for row in 0..3 {
            assert_eq!(design.matrix[[row, 1]], 0.0);
        }
        for row in 3..6 {
            assert_eq!(design.matrix[[row, 1]], 1.0);
        }
    }

    #[test]
    fn three_sites_two_stage() {
        let design = build_design_matrix(&labels(&[("X", 2), ("Y", 2), ("Z", 2)]), None, true)
            .unwrap();
        assert_eq!(design.matrix.dim(), (6, 3));
        assert_eq!(design.column_names, vec!["intercept", "site_Y", "site_Z"]);
    }

    #[test]
    fn covariates_sorted_and_standardized() {
        let mut covs = BTreeMap::new();
        covs.insert("zebra".to_string(), vec![1.0, 2.0, 3.0, 4.0]);
        covs.insert("age".to_string(), vec![20.0, 30.0, 40.0, 50.0]);
        let design =
            build_design_matrix(&labels(&[("A", 2), ("B", 2)]), Some(&covs), true).unwrap();
        assert_eq!(
            design.column_names,
            vec!["intercept", "site_B", "age", "zebra"]
        );
        let age = design.matrix.column(2);
        let mean = age.sum() / 4.0;
        let std = (age.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / 4.0).sqrt();
        assert!(mean.abs() < 1e-10);
        assert!((std - 1.0).abs() < 0.1);
        assert_abs_diff_eq!(design.cov_means["age"], 35.0, epsilon = 1e-12);
    }

    #[test]
    fn site_design_has_no_intercept_and_one_hot_rows() {
        let design = build_site_design(&labels(&[("A", 3), ("B", 2)]), None).unwrap();
        assert_eq!(design.matrix.dim(), (5, 2));
        assert_eq!(design.column_names, vec!["site_A", "site_B"]);
        for j in 0..design.matrix.ncols() {
            let column = design.matrix.column(j);
            assert!(column.iter().any(|&v| v != 1.0), "column {j} is an intercept");
        }
        for row in design.matrix.rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn site_design_interleaved_labels() {
        let raw: Vec<String> = ["X", "Y", "X", "Z", "Y", "Z"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let design = build_site_design(&raw, None).unwrap();
        assert_eq!(design.column_names, vec!["site_X", "site_Y", "site_Z"]);
        assert_eq!(design.site_columns["X"], Some(0));
        assert_eq!(design.site_columns["Z"], Some(2));
        assert_eq!(design.matrix[[3, 2]], 1.0);
        assert_eq!(design.matrix[[3, 0]], 0.0);
    }

    #[test]
    fn constant_covariate_gets_unit_std() {
        let mut covs = BTreeMap::new();
        covs.insert("group".to_string(), vec![1.0, 1.0, 1.0]);
        let design = build_site_design(&labels(&[("A", 2), ("B", 1)]), Some(&covs)).unwrap();
        assert_eq!(design.cov_stds["group"], 1.0);
        assert!(design.matrix.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn length_mismatch_rejected() {
        let mut covs = BTreeMap::new();
        covs.insert("age".to_string(), vec![30.0, 40.0]);
        let err = build_site_design(&labels(&[("A", 2), ("B", 1)]), Some(&covs)).unwrap_err();
        assert!(matches!(
            err,
            DesignError::CovariateLengthMismatch {
                found: 2,
                expected: 3,
                ..
            }
        ));
    }

    #[test]
    fn empty_subjects_rejected() {
        assert!(matches!(
            build_design_matrix(&[], None, true),
            Err(DesignError::EmptySubjects)
        ));
    }

    #[test]
    fn subject_standardization_uses_stored_moments() {
        let names = vec!["age".to_string(), "sex".to_string()];
        let mut raw = BTreeMap::new();
        raw.insert("age".to_string(), 45.0);
        raw.insert("sex".to_string(), 1.0);
        let mut means = BTreeMap::new();
        means.insert("age".to_string(), 35.0);
        means.insert("sex".to_string(), 0.5);
        let mut stds = BTreeMap::new();
        stds.insert("age".to_string(), 10.0);
        stds.insert("sex".to_string(), 0.5);
        let z = standardize_subject(&names, &raw, &means, &stds);
        assert_abs_diff_eq!(z[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(z[1], 1.0, epsilon = 1e-12);
    }
}
