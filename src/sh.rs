//! Spherical harmonic order bookkeeping.
//!
//! An even-order SH image stores, along its last axis, the coefficients of
//! every even order `l` in `0..=lmax`, each order occupying exactly `2l+1`
//! consecutive volumes. `ShIndex` is the immutable map from an order to its
//! half-open volume range; everything downstream (RISH extraction, scale
//! application) slices through it rather than recomputing offsets.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShError {
    #[error("lmax must be even, got {0}")]
    InvalidLmax(usize),
    #[error(
        "{0} volumes do not correspond to an even-order SH series; \
         expected a triangular count (lmax+1)(lmax+2)/2 such as 1, 6, 15, 28, 45"
    )]
    InvalidVolumeCount(usize),
}

/// Immutable order → volume-range map for an even-order SH series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShIndex {
    lmax: usize,
    n_volumes: usize,
    /// `(l, start, end)` per even order, ascending in `l`. End is exclusive.
    ranges: Vec<(usize, usize, usize)>,
}

impl ShIndex {
    pub fn lmax(&self) -> usize {
        self.lmax
    }

    /// Total number of volumes, `(lmax+1)(lmax+2)/2`.
    pub fn n_volumes(&self) -> usize {
        self.n_volumes
    }

    /// Even orders in ascending sequence.
    pub fn orders(&self) -> impl Iterator<Item = usize> + '_ {
        self.ranges.iter().map(|&(l, _, _)| l)
    }

    /// Half-open volume range `[start, end)` for order `l`, if present.
    pub fn range(&self, l: usize) -> Option<(usize, usize)> {
        self.ranges
            .iter()
            .find(|&&(order, _, _)| order == l)
            .map(|&(_, start, end)| (start, end))
    }

    /// Number of coefficients for order `l`: `2l+1`.
    pub fn n_coeffs(&self, l: usize) -> Option<usize> {
        self.range(l).map(|(start, end)| end - start)
    }

    /// `(order, start, end)` triples in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, usize)> + '_ {
        self.ranges.iter().copied()
    }
}

/// Builds the order → volume-range map for an even `lmax`.
///
/// Order `l` occupies volumes `[start, start + 2l+1)`, orders packed in
/// ascending sequence with no gaps, so the ranges tile `[0, n_volumes)`.
pub fn sh_index(lmax: usize) -> Result<ShIndex, ShError> {
    if lmax % 2 != 0 {
        return Err(ShError::InvalidLmax(lmax));
    }
    let mut ranges = Vec::with_capacity(lmax / 2 + 1);
    let mut start = 0;
    for l in (0..=lmax).step_by(2) {
        let count = 2 * l + 1;
        ranges.push((l, start, start + count));
        start += count;
    }
    debug_assert_eq!(start, (lmax + 1) * (lmax + 2) / 2);
    Ok(ShIndex {
        lmax,
        n_volumes: start,
        ranges,
    })
}

/// Recovers `lmax` from a volume count, inverting `N = (lmax+1)(lmax+2)/2`.
///
/// Only exact triangular counts of an even series are accepted; anything
/// else is a malformed SH image.
pub fn infer_lmax(n_volumes: usize) -> Result<usize, ShError> {
    let mut total = 0;
    for l in (0..).step_by(2) {
        total += 2 * l + 1;
        if total == n_volumes {
            return Ok(l);
        }
        if total > n_volumes {
            break;
        }
    }
    Err(ShError::InvalidVolumeCount(n_volumes))
}
