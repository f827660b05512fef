//! Two-stage covariate model: adjust, then average.
//!
//! Stage one regresses covariates out of the reference site's RISH maps,
//! voxel by voxel, with the design `[1, z-covariates]`. Stage two averages
//! the adjusted maps into a covariate-free reference template. A new
//! subject is adjusted with the stored slopes before scale maps are
//! computed against that template, so covariate effects never masquerade
//! as scanner effects.
//!
//! Adjustment subtracts only the covariate slopes, `Y − Σⱼ βⱼ·zⱼ`; the
//! intercept stays in the data. Subtracting it too would re-center every
//! subject at zero and destroy the energy scale the harmonization is
//! trying to match.

use std::collections::BTreeMap;

use ndarray::Array2;
use thiserror::Error;

use crate::design::{self, DesignError};
use crate::linalg::{self, LinalgError};
use crate::rish::RishFeatures;
use crate::volume::{Volume, VolumeError};

#[derive(Error, Debug)]
pub enum CovariateError {
    #[error("two-stage fitting needs at least 2 reference subjects, got {0}")]
    InsufficientSubjects(usize),
    #[error("subject {subject} is missing RISH order {order}")]
    MissingOrder { subject: usize, order: usize },
    #[error(transparent)]
    Design(#[from] DesignError),
    #[error(transparent)]
    Linalg(#[from] LinalgError),
    #[error(transparent)]
    Volume(#[from] VolumeError),
}

/// Fitted two-stage model: per-order intercept and per-(order, covariate)
/// slope images, plus the standardization moments. Immutable once fitted.
#[derive(Debug, Clone)]
pub struct CovariateModel {
    pub covariate_names: Vec<String>,
    pub orders: Vec<usize>,
    pub cov_means: BTreeMap<String, f64>,
    pub cov_stds: BTreeMap<String, f64>,
    /// (order, covariate name) → slope image.
    pub betas: BTreeMap<(usize, String), Volume>,
    /// order → intercept image.
    pub intercepts: BTreeMap<usize, Volume>,
    pub mask: Option<Volume>,
    pub n_subjects: usize,
}

impl CovariateModel {
    /// Removes the stored covariate slopes from one subject's RISH maps.
    /// Orders without a fitted slope pass through untouched.
    pub fn adjust(
        &self,
        rish: &RishFeatures,
        raw_covariates: &BTreeMap<String, f64>,
    ) -> Result<RishFeatures, CovariateError> {
        let z = design::standardize_subject(
            &self.covariate_names,
            raw_covariates,
            &self.cov_means,
            &self.cov_stds,
        );
        let mut adjusted = RishFeatures::new();
        for (&l, map) in rish {
            let mut out = map.clone();
            for (j, name) in self.covariate_names.iter().enumerate() {
                if let Some(beta) = self.betas.get(&(l, name.clone())) {
                    out.add_scaled(beta, -z[j])?;
                }
            }
            adjusted.insert(l, out);
        }
        Ok(adjusted)
    }
}

/// Fits covariate slopes on the reference site's stacked RISH maps.
///
/// One least-squares solve per order covers every voxel at once: the
/// masked voxels of all subjects are stacked into an (n × V) matrix and
/// regressed on `[1, z-covariates]`.
pub fn fit_covariate_model(
    subject_rish: &[RishFeatures],
    covariates: &BTreeMap<String, Vec<f64>>,
    mask: Option<&Volume>,
) -> Result<CovariateModel, CovariateError> {
    let n = subject_rish.len();
    if n < 2 {
        return Err(CovariateError::InsufficientSubjects(n));
    }
    for (name, values) in covariates {
        if values.len() != n {
            return Err(CovariateError::Design(DesignError::CovariateLengthMismatch {
                name: name.clone(),
                found: values.len(),
                expected: n,
            }));
        }
    }

    let (scored, cov_means, cov_stds) = design::standardize_covariates(covariates);
    let covariate_names: Vec<String> = scored.keys().cloned().collect();
    let orders: Vec<usize> = subject_rish[0].keys().copied().collect();

    // Design [1, z₁ … z_q], shared by every order.
    let p = 1 + covariate_names.len();
    let mut x = Array2::<f64>::zeros((n, p));
    x.column_mut(0).fill(1.0);
    for (j, name) in covariate_names.iter().enumerate() {
        for (row, &v) in scored[name].iter().enumerate() {
            x[[row, 1 + j]] = v;
        }
    }

    log::info!(
        "fitting two-stage covariate model: {} subjects, {} covariates, orders {:?}",
        n,
        covariate_names.len(),
        orders
    );

    let mut betas = BTreeMap::new();
    let mut intercepts = BTreeMap::new();
    for &l in &orders {
        let reference_map = subject_rish[0]
            .get(&l)
            .ok_or(CovariateError::MissingOrder { subject: 0, order: l })?;
        let mut rows: Vec<Vec<f64>> = Vec::with_capacity(n);
        for (subject, rish) in subject_rish.iter().enumerate() {
            let map = rish
                .get(&l)
                .ok_or(CovariateError::MissingOrder { subject, order: l })?;
            rows.push(map.masked_values(mask));
        }
        let n_voxels = rows[0].len();
        let mut y = Array2::<f64>::zeros((n, n_voxels));
        for (i, row) in rows.iter().enumerate() {
            for (v, &value) in row.iter().enumerate() {
                y[[i, v]] = value;
            }
        }

        let solution = linalg::lstsq(&x, &y)?;
        let intercept_row: Vec<f64> = solution.row(0).to_vec();
        intercepts.insert(
            l,
            Volume::from_masked_values(&intercept_row, mask, reference_map),
        );
        for (j, name) in covariate_names.iter().enumerate() {
            let beta_row: Vec<f64> = solution.row(1 + j).to_vec();
            betas.insert(
                (l, name.clone()),
                Volume::from_masked_values(&beta_row, mask, reference_map),
            );
        }
    }

    Ok(CovariateModel {
        covariate_names,
        orders,
        cov_means,
        cov_stds,
        betas,
        intercepts,
        mask: mask.cloned(),
        n_subjects: n,
    })
}

/// Averages covariate-adjusted reference RISH maps into the template the
/// scale maps are computed against.
pub fn build_adjusted_template(
    model: &CovariateModel,
    subject_rish: &[RishFeatures],
    raw_covariates: &[BTreeMap<String, f64>],
) -> Result<RishFeatures, CovariateError> {
    let n = subject_rish.len();
    if n < 2 {
        return Err(CovariateError::InsufficientSubjects(n));
    }
    let mut adjusted: Vec<RishFeatures> = Vec::with_capacity(n);
    for (rish, covs) in subject_rish.iter().zip(raw_covariates.iter()) {
        adjusted.push(model.adjust(rish, covs)?);
    }
    let mut template = RishFeatures::new();
    for &l in &model.orders {
        let maps: Vec<Volume> = adjusted
            .iter()
            .enumerate()
            .map(|(subject, rish)| {
                rish.get(&l)
                    .cloned()
                    .ok_or(CovariateError::MissingOrder { subject, order: l })
            })
            .collect::<Result<_, _>>()?;
        template.insert(l, Volume::mean_of(&maps)?);
    }
    Ok(template)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::Geometry;
    use approx::assert_abs_diff_eq;
    use ndarray::Array3;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn flat_rish(l_values: &[(usize, f64)]) -> RishFeatures {
        let mut rish = RishFeatures::new();
        for &(l, value) in l_values {
            rish.insert(
                l,
                Volume::new(Array3::from_elem((3, 3, 3), value), Geometry::unit()),
            );
        }
        rish
    }

    #[test]
    fn too_few_subjects_rejected() {
        let covs = BTreeMap::new();
        let err = fit_covariate_model(&[flat_rish(&[(0, 1.0)])], &covs, None).unwrap_err();
        assert!(matches!(err, CovariateError::InsufficientSubjects(1)));
    }

    #[test]
    fn recovers_linear_age_effect() {
        let mut rng = StdRng::seed_from_u64(42);
        let noise = Normal::new(0.0, 0.01).unwrap();
        let ages: Vec<f64> = (0..20).map(|i| 20.0 + 2.5 * i as f64).collect();
        // RISH = 5.0 + 0.02·age + noise, constant across the grid.
        let subjects: Vec<RishFeatures> = ages
            .iter()
            .map(|&age| flat_rish(&[(0, 5.0 + 0.02 * age + noise.sample(&mut rng))]))
            .collect();
        let mut covs = BTreeMap::new();
        covs.insert("age".to_string(), ages.clone());

        let model = fit_covariate_model(&subjects, &covs, None).unwrap();

        // Slope is stored per z-unit of age: 0.02·σ_age.
        let sigma = model.cov_stds["age"];
        let slope = model.betas[&(0, "age".to_string())].data[[1, 1, 1]];
        assert_abs_diff_eq!(slope, 0.02 * sigma, epsilon = 5e-3);

        // Adjusting a subject at the mean age is (nearly) the identity.
        let mean_age = model.cov_means["age"];
        let mut raw = BTreeMap::new();
        raw.insert("age".to_string(), mean_age);
        let rish = flat_rish(&[(0, 6.0)]);
        let adjusted = model.adjust(&rish, &raw).unwrap();
        assert_abs_diff_eq!(adjusted[&0].data[[0, 0, 0]], 6.0, epsilon = 1e-9);

        // An old subject is adjusted downward, toward the mean-age value.
        raw.insert("age".to_string(), mean_age + 2.0 * sigma);
        let adjusted = model.adjust(&rish, &raw).unwrap();
        assert!(adjusted[&0].data[[0, 0, 0]] < 6.0 - 0.5 * 0.02 * sigma);
    }

    #[test]
    fn intercept_is_not_subtracted() {
        let subjects = vec![flat_rish(&[(0, 2.0)]), flat_rish(&[(0, 4.0)])];
        let covs = BTreeMap::new();
        let model = fit_covariate_model(&subjects, &covs, None).unwrap();
        // With no covariates, adjustment must be the exact identity even
        // though the fitted intercept is 3.0.
        assert_abs_diff_eq!(
            model.intercepts[&0].data[[0, 0, 0]],
            3.0,
            epsilon = 1e-10
        );
        let rish = flat_rish(&[(0, 4.0)]);
        let adjusted = model.adjust(&rish, &BTreeMap::new()).unwrap();
        assert_abs_diff_eq!(adjusted[&0].data[[2, 2, 2]], 4.0, epsilon = 1e-12);
    }

    #[test]
    fn template_averages_adjusted_subjects() {
        let subjects = vec![
            flat_rish(&[(0, 1.0), (2, 0.5)]),
            flat_rish(&[(0, 3.0), (2, 1.5)]),
        ];
        let covs = BTreeMap::new();
        let model = fit_covariate_model(&subjects, &covs, None).unwrap();
        let raw = vec![BTreeMap::new(), BTreeMap::new()];
        let template = build_adjusted_template(&model, &subjects, &raw).unwrap();
        assert_abs_diff_eq!(template[&0].data[[0, 0, 0]], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(template[&2].data[[0, 0, 0]], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn masked_fit_leaves_outside_voxels_zero() {
        let subjects = vec![flat_rish(&[(0, 2.0)]), flat_rish(&[(0, 4.0)])];
        let mut mask = Volume::new(Array3::zeros((3, 3, 3)), Geometry::unit());
        mask.data[[0, 0, 0]] = 1.0;
        let model = fit_covariate_model(&subjects, &BTreeMap::new(), Some(&mask)).unwrap();
        assert_abs_diff_eq!(
            model.intercepts[&0].data[[0, 0, 0]],
            3.0,
            epsilon = 1e-10
        );
        assert_eq!(model.intercepts[&0].data[[2, 2, 2]], 0.0);
    }
}
