//! RISH-GLM: joint estimation of site means and covariate slopes.
//!
//! Instead of adjusting the reference site first and averaging (the
//! two-stage route), a single GLM per order is fitted across *all* subjects
//! of *all* sites, with one indicator column per site and no intercept.
//! Each site's β is then the site-conditional mean RISH at the population
//! mean of the covariates (covariates are z-scored, so z = 0 is the mean),
//! and the scale map for a target site is the voxelwise ratio of the
//! reference site's β to the target site's β. Because the covariates sit
//! in the same model, covariate imbalance across sites cannot bias the
//! ratio.

use std::collections::BTreeMap;

use ndarray::Array2;
use thiserror::Error;

use crate::design::{self, Design, DesignError};
use crate::linalg::{self, LinalgError};
use crate::rish::RishFeatures;
use crate::scale::{self, ScaleError, ScaleMapOptions};
use crate::volume::{Volume, VolumeError};

/// Floor applied to the target-site β before the ratio.
const BETA_FLOOR: f64 = 1e-6;

#[derive(Error, Debug)]
pub enum RishGlmError {
    #[error("site '{0}' is not part of the fitted model")]
    UnknownSite(String),
    #[error("subject {subject} is missing RISH order {order}")]
    MissingOrder { subject: usize, order: usize },
    #[error("site and subject counts disagree: {labels} labels for {subjects} subjects")]
    LabelCountMismatch { labels: usize, subjects: usize },
    #[error("the site design is rank deficient (rank {rank} of {columns} columns)")]
    RankDeficient { rank: usize, columns: usize },
    #[error(transparent)]
    Design(#[from] DesignError),
    #[error(transparent)]
    Linalg(#[from] LinalgError),
    #[error(transparent)]
    Volume(#[from] VolumeError),
    #[error(transparent)]
    Scale(#[from] ScaleError),
}

/// Fitted joint model: one β image per (order, site). Immutable after fit.
#[derive(Debug, Clone)]
pub struct RishGlmModel {
    pub site_names: Vec<String>,
    pub covariate_names: Vec<String>,
    pub orders: Vec<usize>,
    pub design_columns: Vec<String>,
    pub cov_means: BTreeMap<String, f64>,
    pub cov_stds: BTreeMap<String, f64>,
    /// (order, site name) → β image.
    pub site_betas: BTreeMap<(usize, String), Volume>,
    pub n_subjects: usize,
    pub n_per_site: BTreeMap<String, usize>,
    pub mask: Option<Volume>,
}

impl RishGlmModel {
    /// Per-order β ratio `β_ref / max(β_target, ε)` pushed through the
    /// standard scale-map pipeline (√, smooth, clip, mask).
    pub fn scale_maps(
        &self,
        target_site: &str,
        reference_site: &str,
        options: &ScaleMapOptions,
    ) -> Result<BTreeMap<usize, Volume>, RishGlmError> {
        for site in [target_site, reference_site] {
            if !self.site_names.iter().any(|s| s == site) {
                return Err(RishGlmError::UnknownSite(site.to_string()));
            }
        }
        let mut reference = RishFeatures::new();
        let mut target = RishFeatures::new();
        for &l in &self.orders {
            reference.insert(l, self.beta(l, reference_site)?.clone());
            target.insert(l, self.beta(l, target_site)?.clone());
        }
        let options = ScaleMapOptions {
            eps: BETA_FLOOR,
            ..options.clone()
        };
        Ok(scale::compute_scale_maps(
            &reference,
            &target,
            self.mask.as_ref(),
            &options,
        )?)
    }

    fn beta(&self, l: usize, site: &str) -> Result<&Volume, RishGlmError> {
        self.site_betas
            .get(&(l, site.to_string()))
            .ok_or_else(|| RishGlmError::UnknownSite(site.to_string()))
    }
}

/// Fits the joint model: per order, stack all subjects' masked RISH voxels
/// into (n × V) and solve against the k-indicator + covariate design in
/// one pass.
pub fn fit_rish_glm(
    subject_rish: &[RishFeatures],
    site_labels: &[String],
    covariates: Option<&BTreeMap<String, Vec<f64>>>,
    mask: Option<&Volume>,
) -> Result<RishGlmModel, RishGlmError> {
    if site_labels.len() != subject_rish.len() {
        return Err(RishGlmError::LabelCountMismatch {
            labels: site_labels.len(),
            subjects: subject_rish.len(),
        });
    }
    let design: Design = design::build_site_design(site_labels, covariates)?;
    let (rank, cond) = design::check_design(&design.matrix)?;
    if rank < design.n_columns() {
        return Err(RishGlmError::RankDeficient {
            rank,
            columns: design.n_columns(),
        });
    }
    if cond > 1e8 {
        log::warn!("site design condition number {cond:.2e}; estimates may be unstable");
    }

    let site_names: Vec<String> = design
        .site_columns
        .keys()
        .cloned()
        .collect();
    let covariate_names: Vec<String> = design.cov_means.keys().cloned().collect();
    let orders: Vec<usize> = subject_rish[0].keys().copied().collect();
    let n = subject_rish.len();

    let mut n_per_site = BTreeMap::new();
    for label in site_labels {
        *n_per_site.entry(label.clone()).or_insert(0usize) += 1;
    }

    log::info!(
        "fitting RISH-GLM: {} subjects across {} sites, {} covariates, orders {:?}",
        n,
        site_names.len(),
        covariate_names.len(),
        orders
    );

    let mut site_betas = BTreeMap::new();
    for &l in &orders {
        let reference_map = subject_rish[0]
            .get(&l)
            .ok_or(RishGlmError::MissingOrder { subject: 0, order: l })?;
        let mut rows: Vec<Vec<f64>> = Vec::with_capacity(n);
        for (subject, rish) in subject_rish.iter().enumerate() {
            let map = rish
                .get(&l)
                .ok_or(RishGlmError::MissingOrder { subject, order: l })?;
            rows.push(map.masked_values(mask));
        }
        let n_voxels = rows[0].len();
        let mut y = Array2::<f64>::zeros((n, n_voxels));
        for (i, row) in rows.iter().enumerate() {
            for (v, &value) in row.iter().enumerate() {
                y[[i, v]] = value;
            }
        }

        let betas = linalg::lstsq(&design.matrix, &y)?;
        for site in &site_names {
            let col = design.site_columns[site]
                .expect("site designs always carry a column per site");
            let beta_row: Vec<f64> = betas.row(col).to_vec();
            site_betas.insert(
                (l, site.clone()),
                Volume::from_masked_values(&beta_row, mask, reference_map),
            );
        }
    }

    Ok(RishGlmModel {
        site_names,
        covariate_names,
        orders,
        design_columns: design.column_names,
        cov_means: design.cov_means,
        cov_stds: design.cov_stds,
        site_betas,
        n_subjects: n,
        n_per_site,
        mask: mask.cloned(),
    })
}
