//! RISH feature extraction.
//!
//! The rotationally invariant SH feature of order `l` is the per-voxel
//! energy `R_l(v) = Σ_m c_{lm}(v)²` over that order's `2l+1` coefficients.
//! Extraction slices each order's volume range, squares and sums along the
//! coefficient axis, and masks the result; it never reorders orders and
//! never touches the voxel grid.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::sh::{self, ShError};
use crate::volume::{ShImage, Volume, VolumeError};

#[derive(Error, Debug)]
pub enum RishError {
    #[error(transparent)]
    Sh(#[from] ShError),
    #[error(transparent)]
    Volume(#[from] VolumeError),
    #[error("requested lmax {requested} exceeds the image's lmax {available}")]
    LmaxExceedsImage { requested: usize, available: usize },
}

/// Per-order RISH maps, keyed by even order `l` in ascending order.
pub type RishFeatures = BTreeMap<usize, Volume>;

/// Extracts one energy image per even order `l ≤ lmax`.
///
/// `lmax` defaults to the image's own order as inferred from its volume
/// count; an image whose volume count is not a triangular number is
/// rejected. Voxels outside the mask are zeroed.
pub fn extract_rish(
    sh_image: &ShImage,
    mask: Option<&Volume>,
    lmax: Option<usize>,
) -> Result<RishFeatures, RishError> {
    let image_lmax = sh::infer_lmax(sh_image.n_volumes())?;
    let lmax = match lmax {
        Some(requested) => {
            if requested > image_lmax {
                return Err(RishError::LmaxExceedsImage {
                    requested,
                    available: image_lmax,
                });
            }
            requested
        }
        None => image_lmax,
    };

    let index = sh::sh_index(lmax)?;
    let mut features = BTreeMap::new();
    for (l, start, end) in index.iter() {
        let mut energy = sh_image.sum_squares(start, end);
        if let Some(mask) = mask {
            energy.apply_mask(mask)?;
        }
        features.insert(l, energy);
    }
    Ok(features)
}
