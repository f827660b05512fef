//! SH rescaling and the template-based harmonizer.
//!
//! Rescaling is the last step of the pipeline: for each even order `l`,
//! the 2l+1 coefficients are multiplied by that order's scale map
//! (broadcast across m) and the scaled blocks are concatenated back in
//! ascending order, so the output layout matches the input volume for
//! volume. An order without a scale map is a hard error; silently passing
//! coefficients through would leave them at the wrong site's energy.
//!
//! `Harmonizer` is the two-stage front end: build a RISH template from the
//! reference site, then harmonize target subjects against it. It refuses
//! to harmonize before a template exists.

use std::collections::BTreeMap;

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use thiserror::Error;

use crate::covariates::{self, CovariateError, CovariateModel};
use crate::rish::{self, RishError, RishFeatures};
use crate::scale::{self, ScaleError, ScaleMapOptions};
use crate::sh::{self, ShError};
use crate::volume::{ShImage, Volume, VolumeError};

#[derive(Error, Debug)]
pub enum HarmonizeError {
    #[error("no scale map for order {0}")]
    MissingScale(usize),
    #[error("image carries {image_volumes} SH volumes but lmax {lmax} implies {expected}")]
    LmaxMismatch {
        lmax: usize,
        image_volumes: usize,
        expected: usize,
    },
    #[error("harmonizer has no template yet; build one before harmonizing")]
    NotFitted,
    #[error(transparent)]
    Sh(#[from] ShError),
    #[error(transparent)]
    Rish(#[from] RishError),
    #[error(transparent)]
    Scale(#[from] ScaleError),
    #[error(transparent)]
    Volume(#[from] VolumeError),
    #[error(transparent)]
    Covariate(#[from] CovariateError),
}

/// Multiplies each order's coefficients by its scale map and reassembles
/// the image in order-ascending layout.
///
/// `lmax` defaults to the image's own order. Every order `l ≤ lmax` must
/// have a scale map.
pub fn rescale_sh(
    sh_image: &ShImage,
    scale_maps: &BTreeMap<usize, Volume>,
    lmax: Option<usize>,
) -> Result<ShImage, HarmonizeError> {
    let lmax = match lmax {
        Some(l) => l,
        None => sh::infer_lmax(sh_image.n_volumes())?,
    };
    let index = sh::sh_index(lmax)?;
    if index.n_volumes() != sh_image.n_volumes() {
        return Err(HarmonizeError::LmaxMismatch {
            lmax,
            image_volumes: sh_image.n_volumes(),
            expected: index.n_volumes(),
        });
    }

    let mut out = sh_image.clone();
    for (l, start, end) in index.iter() {
        let scale = scale_maps.get(&l).ok_or(HarmonizeError::MissingScale(l))?;
        out.scale_volumes(start, end, scale)?;
    }
    Ok(out)
}

/// Results of harmonizing one subject.
#[derive(Debug, Clone)]
pub struct HarmonizedSubject {
    pub harmonized_sh: ShImage,
    pub scale_maps: BTreeMap<usize, Volume>,
    pub target_rish: RishFeatures,
}

/// Two-stage harmonizer: reference template first, targets after.
///
/// With covariates, fitting regresses them out of the reference RISH
/// before averaging, and each target subject is adjusted with the stored
/// slopes before its scale maps are computed.
pub struct Harmonizer {
    lmax: usize,
    options: ScaleMapOptions,
    /// Worker count for per-subject extraction; rayon's global pool when
    /// unset.
    nthreads: Option<usize>,
    template: Option<RishFeatures>,
    covariate_model: Option<CovariateModel>,
}

impl Harmonizer {
    pub fn new(lmax: usize, options: ScaleMapOptions) -> Result<Self, HarmonizeError> {
        sh::sh_index(lmax)?;
        Ok(Harmonizer {
            lmax,
            options,
            nthreads: None,
            template: None,
            covariate_model: None,
        })
    }

    pub fn with_threads(mut self, nthreads: usize) -> Self {
        self.nthreads = Some(nthreads);
        self
    }

    pub fn template(&self) -> Option<&RishFeatures> {
        self.template.as_ref()
    }

    /// Averages reference-site RISH into the template. Per-subject
    /// extraction is independent and runs on the rayon pool.
    pub fn create_template(
        &mut self,
        reference_sh: &[ShImage],
        masks: Option<&[Volume]>,
        covariates: Option<&BTreeMap<String, Vec<f64>>>,
    ) -> Result<(), HarmonizeError> {
        let progress = ProgressBar::new(reference_sh.len() as u64).with_style(
            ProgressStyle::with_template("extracting RISH {pos}/{len} {bar:30}")
                .expect("static template string parses"),
        );
        let lmax = self.lmax;
        let extract = || -> Result<Vec<RishFeatures>, RishError> {
            reference_sh
                .par_iter()
                .enumerate()
                .map(|(i, sh_image)| {
                    let mask = masks.map(|m| &m[i]);
                    let rish = rish::extract_rish(sh_image, mask, Some(lmax));
                    progress.inc(1);
                    rish
                })
                .collect()
        };
        let rish_per_subject = match self.nthreads {
            Some(nthreads) => ThreadPoolBuilder::new()
                .num_threads(nthreads)
                .build()
                .expect("harmonization thread pool initialization should succeed")
                .install(extract),
            None => extract(),
        }?;
        progress.finish_and_clear();

        let template = match covariates {
            Some(covs) if !covs.is_empty() => {
                let mask = masks.and_then(|m| m.first());
                let model = covariates::fit_covariate_model(&rish_per_subject, covs, mask)?;
                let raw: Vec<BTreeMap<String, f64>> = (0..reference_sh.len())
                    .map(|i| {
                        covs.iter()
                            .map(|(name, values)| (name.clone(), values[i]))
                            .collect()
                    })
                    .collect();
                let template =
                    covariates::build_adjusted_template(&model, &rish_per_subject, &raw)?;
                self.covariate_model = Some(model);
                template
            }
            _ => {
                if rish_per_subject.len() < 2 {
                    return Err(HarmonizeError::Covariate(
                        CovariateError::InsufficientSubjects(rish_per_subject.len()),
                    ));
                }
                let orders: Vec<usize> = rish_per_subject[0].keys().copied().collect();
                let mut template = RishFeatures::new();
                for &l in &orders {
                    let maps: Vec<Volume> = rish_per_subject
                        .iter()
                        .filter_map(|r| r.get(&l).cloned())
                        .collect();
                    template.insert(l, Volume::mean_of(&maps)?);
                }
                template
            }
        };

        log::info!(
            "built RISH template from {} reference subjects (lmax {})",
            reference_sh.len(),
            self.lmax
        );
        self.template = Some(template);
        Ok(())
    }

    /// Harmonizes one target subject against the fitted template.
    pub fn harmonize(
        &self,
        target_sh: &ShImage,
        target_mask: Option<&Volume>,
        target_covariates: Option<&BTreeMap<String, f64>>,
    ) -> Result<HarmonizedSubject, HarmonizeError> {
        let template = self.template.as_ref().ok_or(HarmonizeError::NotFitted)?;

        let target_rish = rish::extract_rish(target_sh, target_mask, Some(self.lmax))?;
        let adjusted = match (&self.covariate_model, target_covariates) {
            (Some(model), Some(raw)) => model.adjust(&target_rish, raw)?,
            (Some(model), None) => model.adjust(&target_rish, &BTreeMap::new())?,
            (None, _) => target_rish.clone(),
        };

        let scale_maps =
            scale::compute_scale_maps(template, &adjusted, target_mask, &self.options)?;
        let harmonized_sh = rescale_sh(target_sh, &scale_maps, Some(self.lmax))?;

        Ok(HarmonizedSubject {
            harmonized_sh,
            scale_maps,
            target_rish,
        })
    }
}
