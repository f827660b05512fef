//! Voxel-wise permutation testing for residual site effects.
//!
//! The driver wires the pieces together: build the inference design and
//! site contrast, fit the partitioned GLM, generate the permutation null
//! under the exchangeability blocks, convert to permutation p-values,
//! control FDR, and attach effect sizes. Permutations are independent, so
//! the null distribution is filled by a rayon fan-out gathered by shuffle
//! index; the fitted test is immutable and shared by reference.

use std::collections::BTreeMap;

use ndarray::{Array1, Array2};
use rayon::prelude::*;
use thiserror::Error;

use crate::design::{self, DesignError};
use crate::fdr::{self, FdrMethod, FdrOutcome, Tail};
use crate::glm::{self, GlmError, TestFixedHeteroscedastic, TestFixedHomoscedastic};
use crate::shuffle::{Shuffle, ShuffleError, Shuffler};

#[derive(Error, Debug)]
pub enum SiteEffectError {
    #[error("data has {rows} rows but {labels} site labels were given")]
    LabelCountMismatch { rows: usize, labels: usize },
    #[error("site-effect testing needs at least two sites, got {0}")]
    SingleSite(usize),
    #[error(transparent)]
    Design(#[from] DesignError),
    #[error(transparent)]
    Glm(#[from] GlmError),
    #[error(transparent)]
    Shuffle(#[from] ShuffleError),
}

/// Statistic family for the site test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VarianceModel {
    /// Pooled residual variance (F statistic).
    #[default]
    Homoscedastic,
    /// Per-site variance groups (Welch-style G statistic).
    Heteroscedastic,
}

#[derive(Debug, Clone)]
pub struct SiteEffectOptions {
    pub n_permutations: usize,
    pub seed: u64,
    pub alpha: f64,
    pub fdr_method: FdrMethod,
    pub tail: Tail,
    pub variance_model: VarianceModel,
    /// Optional exchangeability blocks; permutation never crosses one.
    pub exchangeability_blocks: Option<Vec<usize>>,
}

impl Default for SiteEffectOptions {
    fn default() -> Self {
        SiteEffectOptions {
            n_permutations: 1000,
            seed: 42,
            alpha: 0.05,
            fdr_method: FdrMethod::default(),
            tail: Tail::default(),
            variance_model: VarianceModel::default(),
            exchangeability_blocks: None,
        }
    }
}

/// Full output of a site-effect analysis.
#[derive(Debug, Clone)]
pub struct SiteEffectReport {
    pub statistic: Array1<f64>,
    pub p_values: Array1<f64>,
    pub fdr: FdrOutcome,
    pub eta_squared: Array1<f64>,
    pub cohens_f: Array1<f64>,
    pub n_permutations: usize,
    /// Effect size of the site contrast, for two-site (rank-1) tests.
    pub effect_size: Option<Array1<f64>>,
}

impl SiteEffectReport {
    /// Fraction of voxels surviving FDR.
    pub fn significant_fraction(&self) -> f64 {
        if self.fdr.significant.is_empty() {
            return 0.0;
        }
        let hits = self.fdr.significant.iter().filter(|&&s| s).count();
        hits as f64 / self.fdr.significant.len() as f64
    }
}

enum SiteTest {
    Homoscedastic(TestFixedHomoscedastic),
    Heteroscedastic(TestFixedHeteroscedastic),
}

impl SiteTest {
    fn run(&self, shuffle: Option<&Shuffle>) -> Result<Vec<glm::TestOutput>, GlmError> {
        match self {
            SiteTest::Homoscedastic(test) => test.run(shuffle),
            SiteTest::Heteroscedastic(test) => test.run(shuffle),
        }
    }
}

/// Tests every voxel for a residual site effect with Freedman–Lane
/// permutation and FDR control.
///
/// `data` is subjects × voxels, rows aligned with `site_labels` and the
/// covariate vectors.
pub fn site_effect_analysis(
    data: &Array2<f64>,
    site_labels: &[String],
    covariates: Option<&BTreeMap<String, Vec<f64>>>,
    options: &SiteEffectOptions,
) -> Result<SiteEffectReport, SiteEffectError> {
    let n = data.nrows();
    if site_labels.len() != n {
        return Err(SiteEffectError::LabelCountMismatch {
            rows: n,
            labels: site_labels.len(),
        });
    }
    let design = design::build_design_matrix(site_labels, covariates, true)?;
    let n_sites = design.site_columns.len();
    if n_sites < 2 {
        return Err(SiteEffectError::SingleSite(n_sites));
    }
    let n_covariates = design.cov_means.len();
    let hypothesis = glm::create_site_contrast(n_sites, n_covariates);

    let test = match options.variance_model {
        VarianceModel::Homoscedastic => SiteTest::Homoscedastic(TestFixedHomoscedastic::new(
            data.clone(),
            design.matrix.clone(),
            vec![hypothesis],
        )?),
        VarianceModel::Heteroscedastic => {
            // Variance groups follow the site partition.
            let site_order: Vec<&String> = design.site_columns.keys().collect();
            let groups: Vec<usize> = site_labels
                .iter()
                .map(|label| {
                    site_order
                        .iter()
                        .position(|site| *site == label)
                        .expect("every label appears in the design's site map")
                })
                .collect();
            SiteTest::Heteroscedastic(TestFixedHeteroscedastic::new(
                data.clone(),
                design.matrix.clone(),
                vec![hypothesis],
                &groups,
            )?)
        }
    };

    let observed = test.run(None)?;
    let statistic = observed[0].statistic.clone();
    let effect_size = observed[0].effect_size.clone();

    // Shuffle 0 is the identity; the null keeps the remaining shuffles,
    // gathered by index so worker scheduling cannot reorder them.
    let shuffler = Shuffler::new(
        n,
        options.n_permutations + 1,
        options.exchangeability_blocks.as_deref(),
        options.seed,
    )?;
    let shuffles: Vec<Shuffle> = shuffler.skip(1).collect();
    log::info!(
        "site-effect permutation null: {} permutations over {} subjects",
        shuffles.len(),
        n
    );
    let null_rows: Vec<Array1<f64>> = shuffles
        .par_iter()
        .map(|shuffle| test.run(Some(shuffle)).map(|outputs| outputs[0].statistic.clone()))
        .collect::<Result<_, _>>()?;

    let mut null_distribution = Array2::<f64>::zeros((null_rows.len(), statistic.len()));
    for (row, values) in null_rows.iter().enumerate() {
        null_distribution.row_mut(row).assign(values);
    }

    let p_values = fdr::permutation_p_values(&statistic, &null_distribution, options.tail);
    let fdr_outcome = fdr::fdr_correction(&p_values, options.alpha, options.fdr_method);

    let eta_squared = fdr::partial_eta_squared(data, site_labels);
    let cohens_f = fdr::cohens_f(&eta_squared);

    Ok(SiteEffectReport {
        statistic,
        p_values,
        fdr: fdr_outcome,
        eta_squared,
        cohens_f,
        n_permutations: null_rows.len(),
        effect_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn two_site_data(
        n_per_site: usize,
        n_voxels: usize,
        shift: f64,
        seed: u64,
    ) -> (Array2<f64>, Vec<String>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let noise = Normal::new(0.0, 1.0).unwrap();
        let data = Array2::from_shape_fn((2 * n_per_site, n_voxels), |(i, _)| {
            let offset = if i >= n_per_site { shift } else { 0.0 };
            offset + noise.sample(&mut rng)
        });
        let mut labels = vec!["A".to_string(); n_per_site];
        labels.extend(vec!["B".to_string(); n_per_site]);
        (data, labels)
    }

    fn quick_options(n_permutations: usize) -> SiteEffectOptions {
        SiteEffectOptions {
            n_permutations,
            seed: 42,
            ..SiteEffectOptions::default()
        }
    }

    #[test]
    fn null_data_stays_mostly_insignificant() {
        let (data, labels) = two_site_data(30, 100, 0.0, 42);
        let report =
            site_effect_analysis(&data, &labels, None, &quick_options(200)).unwrap();
        assert!(
            report.significant_fraction() < 0.15,
            "null fraction {}",
            report.significant_fraction()
        );
    }

    #[test]
    fn strong_site_effect_is_detected() {
        let (data, labels) = two_site_data(30, 50, 1.5, 42);
        let report =
            site_effect_analysis(&data, &labels, None, &quick_options(200)).unwrap();
        assert!(
            report.significant_fraction() > 0.5,
            "detected fraction {}",
            report.significant_fraction()
        );
        assert!(report.eta_squared.mean().unwrap() > 0.2);
        assert!(report.effect_size.is_some());
    }

    #[test]
    fn heteroscedastic_variant_runs_clean() {
        let (data, labels) = two_site_data(20, 30, 1.0, 7);
        let options = SiteEffectOptions {
            variance_model: VarianceModel::Heteroscedastic,
            ..quick_options(100)
        };
        let report = site_effect_analysis(&data, &labels, None, &options).unwrap();
        assert!(report.statistic.iter().all(|v| v.is_finite()));
        assert_eq!(report.n_permutations, 100);
    }

    #[test]
    fn exchangeability_blocks_are_honored() {
        let (data, labels) = two_site_data(5, 10, 0.5, 3);
        // Sex-matched pairs: permutation stays within each half.
        let blocks: Vec<usize> = (0..10).map(|i| usize::from(i % 2 == 0)).collect();
        let options = SiteEffectOptions {
            exchangeability_blocks: Some(blocks),
            ..quick_options(50)
        };
        let report = site_effect_analysis(&data, &labels, None, &options).unwrap();
        assert_eq!(report.n_permutations, 50);
    }

    #[test]
    fn single_site_is_rejected() {
        let (data, _) = two_site_data(5, 4, 0.0, 1);
        let labels = vec!["only".to_string(); 10];
        assert!(matches!(
            site_effect_analysis(&data, &labels, None, &quick_options(10)),
            Err(SiteEffectError::SingleSite(1))
        ));
    }
}
