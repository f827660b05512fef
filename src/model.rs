//! Persisted harmonization models.
//!
//! A fitted model is one JSON file plus a directory of β images. The JSON
//! carries a `kind` tag — `two_stage` or `rish_glm` — and every image path
//! in it is stored *relative to the JSON's directory*, so a model
//! directory can be moved or mounted elsewhere and still load; paths are
//! resolved to absolute on load.
//!
//! Both variants answer the same question through `scale_maps`: given a
//! target (a subject's RISH for the two-stage model, a site name for
//! RISH-GLM), what per-order multipliers bring it to the reference?
//! For the two-stage model the reference template is the fitted intercept
//! map — with centered covariates, the intercept is exactly the
//! covariate-adjusted reference mean.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::covariates::CovariateModel;
use crate::image_io::{self, ImageIoError};
use crate::rish::RishFeatures;
use crate::rish_glm::{RishGlmError, RishGlmModel};
use crate::scale::{self, ScaleError, ScaleMapOptions};
use crate::volume::Volume;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("failed to read model file '{path}': {detail}")]
    Read { path: PathBuf, detail: String },
    #[error("failed to write model file '{path}': {detail}")]
    Write { path: PathBuf, detail: String },
    #[error("model mismatch: {0}")]
    ModelMismatch(String),
    #[error(transparent)]
    Image(#[from] ImageIoError),
    #[error(transparent)]
    RishGlm(#[from] RishGlmError),
    #[error(transparent)]
    Scale(#[from] ScaleError),
}

/// Serializes/deserializes `BTreeMap<usize, String>` through string keys.
///
/// serde's internally-tagged enum deserialization (`#[serde(tag = "kind")]`)
/// buffers content before dispatching to the variant, and that buffered
/// form loses the numeric-string-key special case serde_json normally
/// applies — so a plain `BTreeMap<usize, _>` field fails to deserialize
/// with "invalid type: string, expected usize" even though the JSON on
/// disk (object keys are always strings) is unchanged either way.
mod usize_key_map {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<usize, String>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let as_strings: BTreeMap<String, &String> =
            map.iter().map(|(k, v)| (k.to_string(), v)).collect();
        as_strings.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<usize, String>, D::Error> {
        let as_strings = BTreeMap::<String, String>::deserialize(deserializer)?;
        as_strings
            .into_iter()
            .map(|(k, v)| {
                k.parse::<usize>()
                    .map(|k| (k, v))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

/// On-disk form. Field names and the `kind` tag are part of the format.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ModelRecord {
    TwoStage {
        covariate_names: Vec<String>,
        orders: Vec<usize>,
        means: BTreeMap<String, f64>,
        stds: BTreeMap<String, f64>,
        n_subjects: usize,
        /// "{l}_{covariate}" → relative image path.
        beta_paths: BTreeMap<String, String>,
        #[serde(with = "usize_key_map")]
        intercept_paths: BTreeMap<usize, String>,
        mask_path: Option<String>,
    },
    RishGlm {
        site_names: Vec<String>,
        reference_site: String,
        covariate_names: Vec<String>,
        orders: Vec<usize>,
        means: BTreeMap<String, f64>,
        stds: BTreeMap<String, f64>,
        n_subjects: usize,
        n_per_site: BTreeMap<String, usize>,
        design_columns: Vec<String>,
        /// "{l}_site_{site}" → relative image path.
        beta_paths: BTreeMap<String, String>,
        mask_path: Option<String>,
    },
}

/// A fitted model ready to produce scale maps. Immutable after fit/load.
#[derive(Debug, Clone)]
pub enum HarmonizationModel {
    TwoStage(CovariateModel),
    RishGlm {
        model: RishGlmModel,
        reference_site: String,
    },
}

impl HarmonizationModel {
    pub fn orders(&self) -> &[usize] {
        match self {
            HarmonizationModel::TwoStage(model) => &model.orders,
            HarmonizationModel::RishGlm { model, .. } => &model.orders,
        }
    }

    /// Scale maps toward the model's reference.
    ///
    /// - Two-stage: needs the target subject's RISH (and, if the model was
    ///   fitted with covariates, the subject's raw covariate values).
    /// - RISH-GLM: needs the target site name.
    pub fn scale_maps(
        &self,
        target_rish: Option<&RishFeatures>,
        target_site: Option<&str>,
        covariates: Option<&BTreeMap<String, f64>>,
        options: &ScaleMapOptions,
    ) -> Result<BTreeMap<usize, Volume>, ModelError> {
        match self {
            HarmonizationModel::TwoStage(model) => {
                let rish = target_rish.ok_or_else(|| {
                    ModelError::ModelMismatch(
                        "two-stage models need the target subject's RISH maps".to_string(),
                    )
                })?;
                let got: Vec<usize> = rish.keys().copied().collect();
                if got != model.orders {
                    return Err(ModelError::ModelMismatch(format!(
                        "target orders {:?} differ from fitted orders {:?}",
                        got, model.orders
                    )));
                }
                let empty = BTreeMap::new();
                let raw = covariates.unwrap_or(&empty);
                let adjusted = model.adjust(rish, raw).map_err(|e| {
                    ModelError::ModelMismatch(format!("covariate adjustment failed: {e}"))
                })?;
                // Intercept ≡ covariate-adjusted reference template.
                let mut template = RishFeatures::new();
                for (&l, intercept) in &model.intercepts {
                    template.insert(l, intercept.clone());
                }
                Ok(scale::compute_scale_maps(
                    &template,
                    &adjusted,
                    model.mask.as_ref(),
                    options,
                )?)
            }
            HarmonizationModel::RishGlm {
                model,
                reference_site,
            } => {
                let site = target_site.ok_or_else(|| {
                    ModelError::ModelMismatch(
                        "RISH-GLM models need the target site name".to_string(),
                    )
                })?;
                Ok(model.scale_maps(site, reference_site, options)?)
            }
        }
    }
}

fn relative_beta_name(l: usize, term: &str) -> String {
    format!("beta_{term}_l{l}.nii.gz")
}

fn write_json(path: &Path, record: &ModelRecord) -> Result<(), ModelError> {
    let text = serde_json::to_string_pretty(record).map_err(|e| ModelError::Write {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    std::fs::write(path, text).map_err(|e| ModelError::Write {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })
}

/// Saves a fitted model: β images beside the JSON, paths stored relative.
pub fn save_model(model: &HarmonizationModel, json_path: &Path) -> Result<(), ModelError> {
    let dir = match json_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(|e| ModelError::Write {
        path: json_path.to_path_buf(),
        detail: e.to_string(),
    })?;

    let record = match model {
        HarmonizationModel::TwoStage(model) => {
            let mut beta_paths = BTreeMap::new();
            for ((l, name), volume) in &model.betas {
                let rel = relative_beta_name(*l, name);
                image_io::write_volume(&dir.join(&rel), volume)?;
                beta_paths.insert(format!("{l}_{name}"), rel);
            }
            let mut intercept_paths = BTreeMap::new();
            for (&l, volume) in &model.intercepts {
                let rel = format!("intercept_l{l}.nii.gz");
                image_io::write_volume(&dir.join(&rel), volume)?;
                intercept_paths.insert(l, rel);
            }
            let mask_path = match &model.mask {
                Some(mask) => {
                    let rel = "mask.nii.gz".to_string();
                    image_io::write_volume(&dir.join(&rel), mask)?;
                    Some(rel)
                }
                None => None,
            };
            ModelRecord::TwoStage {
                covariate_names: model.covariate_names.clone(),
                orders: model.orders.clone(),
                means: model.cov_means.clone(),
                stds: model.cov_stds.clone(),
                n_subjects: model.n_subjects,
                beta_paths,
                intercept_paths,
                mask_path,
            }
        }
        HarmonizationModel::RishGlm {
            model,
            reference_site,
        } => {
            let mut beta_paths = BTreeMap::new();
            for ((l, site), volume) in &model.site_betas {
                let rel = relative_beta_name(*l, &format!("site_{site}"));
                image_io::write_volume(&dir.join(&rel), volume)?;
                beta_paths.insert(format!("{l}_site_{site}"), rel);
            }
            let mask_path = match &model.mask {
                Some(mask) => {
                    let rel = "mask.nii.gz".to_string();
                    image_io::write_volume(&dir.join(&rel), mask)?;
                    Some(rel)
                }
                None => None,
            };
            ModelRecord::RishGlm {
                site_names: model.site_names.clone(),
                reference_site: reference_site.clone(),
                covariate_names: model.covariate_names.clone(),
                orders: model.orders.clone(),
                means: model.cov_means.clone(),
                stds: model.cov_stds.clone(),
                n_subjects: model.n_subjects,
                n_per_site: model.n_per_site.clone(),
                design_columns: model.design_columns.clone(),
                beta_paths,
                mask_path,
            }
        }
    };
    write_json(json_path, &record)?;
    log::info!("saved harmonization model to '{}'", json_path.display());
    Ok(())
}

/// Loads a model, resolving every stored path against the JSON's directory
/// and reading the images back in.
pub fn load_model(json_path: &Path) -> Result<HarmonizationModel, ModelError> {
    let text = std::fs::read_to_string(json_path).map_err(|e| ModelError::Read {
        path: json_path.to_path_buf(),
        detail: e.to_string(),
    })?;
    let record: ModelRecord = serde_json::from_str(&text).map_err(|e| ModelError::Read {
        path: json_path.to_path_buf(),
        detail: e.to_string(),
    })?;
    let dir = json_path.parent().unwrap_or_else(|| Path::new("."));

    match record {
        ModelRecord::TwoStage {
            covariate_names,
            orders,
            means,
            stds,
            n_subjects,
            beta_paths,
            intercept_paths,
            mask_path,
        } => {
            let mut betas = BTreeMap::new();
            for (key, rel) in &beta_paths {
                let (l, name) = parse_beta_key(key, json_path)?;
                betas.insert((l, name), image_io::read_volume(&dir.join(rel))?);
            }
            let mut intercepts = BTreeMap::new();
            for (&l, rel) in &intercept_paths {
                intercepts.insert(l, image_io::read_volume(&dir.join(rel))?);
            }
            let mask = mask_path
                .map(|rel| image_io::read_volume(&dir.join(rel)))
                .transpose()?;
            Ok(HarmonizationModel::TwoStage(CovariateModel {
                covariate_names,
                orders,
                cov_means: means,
                cov_stds: stds,
                betas,
                intercepts,
                mask,
                n_subjects,
            }))
        }
        ModelRecord::RishGlm {
            site_names,
            reference_site,
            covariate_names,
            orders,
            means,
            stds,
            n_subjects,
            n_per_site,
            design_columns,
            beta_paths,
            mask_path,
        } => {
            let mut site_betas = BTreeMap::new();
            for (key, rel) in &beta_paths {
                let (l, term) = parse_beta_key(key, json_path)?;
                let site = term.strip_prefix("site_").unwrap_or(&term).to_string();
                site_betas.insert((l, site), image_io::read_volume(&dir.join(rel))?);
            }
            let mask = mask_path
                .map(|rel| image_io::read_volume(&dir.join(rel)))
                .transpose()?;
            Ok(HarmonizationModel::RishGlm {
                model: RishGlmModel {
                    site_names,
                    covariate_names,
                    orders,
                    design_columns,
                    cov_means: means,
                    cov_stds: stds,
                    site_betas,
                    n_subjects,
                    n_per_site,
                    mask,
                },
                reference_site,
            })
        }
    }
}

fn parse_beta_key(key: &str, json_path: &Path) -> Result<(usize, String), ModelError> {
    let (l_part, term) = key.split_once('_').ok_or_else(|| ModelError::Read {
        path: json_path.to_path_buf(),
        detail: format!("malformed beta key '{key}'"),
    })?;
    let l = l_part.parse::<usize>().map_err(|_| ModelError::Read {
        path: json_path.to_path_buf(),
        detail: format!("malformed beta key '{key}'"),
    })?;
    Ok((l, term.to_string()))
}
