//! Scale-map construction.
//!
//! A scale map equalizes a target subject's per-order RISH energy to a
//! reference. The per-voxel pipeline is fixed: ε-floored ratio of
//! reference to target, optional square root, Gaussian smoothing, clipping,
//! masking. Smoothing happens *after* the ratio so that low-signal ratio
//! instability is suppressed rather than spread; clipping is a safety rail
//! against pathological mismatch, not a tuning knob.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::rish::RishFeatures;
use crate::volume::{Volume, VolumeError};

#[derive(Error, Debug)]
pub enum ScaleError {
    #[error(transparent)]
    Volume(#[from] VolumeError),
    #[error("target RISH lacks order {0} present in the reference")]
    MissingTargetOrder(usize),
}

/// How the energy ratio becomes a coefficient multiplier.
///
/// RISH energy is quadratic in the coefficients, so equalizing energy
/// calls for scaling coefficients by √(ratio); multiplying by the raw
/// ratio replicates the behavior of pipelines that apply the ratio
/// directly to the coefficients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScaleMode {
    #[default]
    SqrtRatio,
    Ratio,
}

#[derive(Debug, Clone)]
pub struct ScaleMapOptions {
    /// Floor applied to the denominator of the ratio.
    pub eps: f64,
    /// Gaussian smoothing FWHM in mm; non-positive disables smoothing.
    pub smoothing_fwhm: f64,
    /// Clip range applied after smoothing.
    pub clip_range: (f64, f64),
    pub mode: ScaleMode,
}

impl Default for ScaleMapOptions {
    fn default() -> Self {
        ScaleMapOptions {
            eps: 1e-6,
            smoothing_fwhm: 3.0,
            clip_range: (0.5, 2.0),
            mode: ScaleMode::default(),
        }
    }
}

/// Builds one scale map per order from reference and target RISH features.
///
/// Orders are taken from the reference; a target missing one of them is an
/// error rather than a silently passed-through order.
pub fn compute_scale_maps(
    reference: &RishFeatures,
    target: &RishFeatures,
    mask: Option<&Volume>,
    options: &ScaleMapOptions,
) -> Result<BTreeMap<usize, Volume>, ScaleError> {
    let mut maps = BTreeMap::new();
    for (&l, ref_map) in reference {
        let tar_map = target
            .get(&l)
            .ok_or(ScaleError::MissingTargetOrder(l))?;
        maps.insert(l, scale_map_from_pair(ref_map, tar_map, mask, options)?);
    }
    Ok(maps)
}

/// The per-order pipeline on a single (reference, target) pair of energy
/// images.
pub fn scale_map_from_pair(
    reference: &Volume,
    target: &Volume,
    mask: Option<&Volume>,
    options: &ScaleMapOptions,
) -> Result<Volume, ScaleError> {
    let mut map = reference.ratio(target, options.eps)?;
    if options.mode == ScaleMode::SqrtRatio {
        map.mapv_inplace(|v| v.max(0.0).sqrt());
    }
    let mut map = map.gaussian_smooth_mm(options.smoothing_fwhm);
    let (lo, hi) = options.clip_range;
    map.clip(lo, hi);
    if let Some(mask) = mask {
        map.apply_mask(mask)?;
    }
    Ok(map)
}
