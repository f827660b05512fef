//! Harmonization of diffusion-MRI spherical harmonic (SH) images across
//! scanners, using rotationally invariant SH (RISH) features.
//!
//! The crate equalizes, per voxel and per SH order, the rotational energy of
//! an SH signal to a reference site, optionally conditioning on subject
//! covariates, and provides voxel-wise permutation inference on residual
//! site differences.
//!
//! # Modules
//! - `sh`: SH order ↔ volume-index bookkeeping
//! - `volume`: in-memory 3-D/4-D voxel images and their calc primitives
//! - `image_io`: NIfTI persistence for the crate's own artifacts
//! - `rish`: per-order RISH energy extraction
//! - `design`: site/covariate design matrices
//! - `covariates`: two-stage covariate model (adjust-then-average)
//! - `rish_glm`: joint site+covariate GLM (RISH-GLM)
//! - `scale`: scale-map construction (ratio, smoothing, clipping)
//! - `harmonize`: SH rescaling and the template-based harmonizer
//! - `glm`: partitioned-GLM test kernel (F and G statistics, Freedman–Lane)
//! - `shuffle`: exchangeability-block-aware permutation generation
//! - `fdr`: FDR control, permutation p-values, effect sizes
//! - `site_effects`: end-to-end permutation site-effect analysis
//! - `model`: persisted harmonization models
//! - `tables`: participants tables and site manifests

pub mod covariates;
pub mod design;
pub mod fdr;
pub mod glm;
pub mod harmonize;
pub mod image_io;
pub mod linalg;
pub mod model;
pub mod rish;
pub mod rish_glm;
pub mod scale;
pub mod sh;
pub mod shuffle;
pub mod site_effects;
pub mod tables;
pub mod volume;
