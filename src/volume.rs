//! In-memory voxel images.
//!
//! The harmonization core operates on two image shapes: `Volume`, a 3-D
//! scalar field (RISH maps, scale maps, β maps, masks), and `ShImage`, a
//! 4-D field whose last axis is the SH coefficient axis. Both carry the
//! acquisition geometry so millimetre-based operations (Gaussian smoothing)
//! and grid-compatibility checks stay honest.
//!
//! All voxelwise arithmetic here is exact and allocation-light; the
//! numerical safeguards (ε-floored ratios, clipping) are normalization, not
//! error paths.

use ndarray::{Array3, Array4, Axis, Zip};
use thiserror::Error;

/// FWHM → σ conversion factor, 2√(2 ln 2).
const FWHM_TO_SIGMA: f64 = 2.354_820_045_030_949_3;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VolumeError {
    #[error("image shapes differ: {0:?} vs {1:?}")]
    ShapeMismatch(Vec<usize>, Vec<usize>),
    #[error("voxel grids share a shape but differ in geometry (voxel size or affine)")]
    GeometryMismatch,
    #[error("cannot average an empty list of images")]
    EmptyMean,
}

/// Voxel grid geometry: per-axis spacing in mm plus the 4×4 affine
/// (row-major) mapping voxel indices to scanner coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    pub voxel_size: [f64; 3],
    pub affine: [f64; 16],
}

impl Geometry {
    /// Unit-spacing geometry with an identity affine.
    pub fn unit() -> Self {
        let mut affine = [0.0; 16];
        affine[0] = 1.0;
        affine[5] = 1.0;
        affine[10] = 1.0;
        affine[15] = 1.0;
        Geometry {
            voxel_size: [1.0; 3],
            affine,
        }
    }

    fn close_to(&self, other: &Geometry) -> bool {
        let spacing_ok = self
            .voxel_size
            .iter()
            .zip(other.voxel_size.iter())
            .all(|(a, b)| (a - b).abs() < 1e-6);
        let affine_ok = self
            .affine
            .iter()
            .zip(other.affine.iter())
            .all(|(a, b)| (a - b).abs() < 1e-4);
        spacing_ok && affine_ok
    }
}

/// 3-D scalar image.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    pub geometry: Geometry,
    pub data: Array3<f64>,
}

/// 4-D SH coefficient image; axis 3 is the SH axis.
#[derive(Debug, Clone, PartialEq)]
pub struct ShImage {
    pub geometry: Geometry,
    pub data: Array4<f64>,
}

impl Volume {
    pub fn new(data: Array3<f64>, geometry: Geometry) -> Self {
        Volume { geometry, data }
    }

    pub fn zeros_like(other: &Volume) -> Self {
        Volume {
            geometry: other.geometry.clone(),
            data: Array3::zeros(other.data.raw_dim()),
        }
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        let s = self.data.shape();
        (s[0], s[1], s[2])
    }

    fn check_compatible(&self, other: &Volume) -> Result<(), VolumeError> {
        if self.data.shape() != other.data.shape() {
            return Err(VolumeError::ShapeMismatch(
                self.data.shape().to_vec(),
                other.data.shape().to_vec(),
            ));
        }
        if !self.geometry.close_to(&other.geometry) {
            return Err(VolumeError::GeometryMismatch);
        }
        Ok(())
    }

    /// Voxelwise product.
    pub fn multiply(&self, other: &Volume) -> Result<Volume, VolumeError> {
        self.check_compatible(other)?;
        Ok(Volume {
            geometry: self.geometry.clone(),
            data: &self.data * &other.data,
        })
    }

    /// Voxelwise difference `self − other`.
    pub fn subtract(&self, other: &Volume) -> Result<Volume, VolumeError> {
        self.check_compatible(other)?;
        Ok(Volume {
            geometry: self.geometry.clone(),
            data: &self.data - &other.data,
        })
    }

    /// Voxelwise ratio with an ε floor on the denominator.
    pub fn ratio(&self, denom: &Volume, eps: f64) -> Result<Volume, VolumeError> {
        self.check_compatible(denom)?;
        let mut out = self.data.clone();
        Zip::from(&mut out).and(&denom.data).for_each(|num, &den| {
            *num /= den.max(eps);
        });
        Ok(Volume {
            geometry: self.geometry.clone(),
            data: out,
        })
    }

    /// Adds `scale * other` into `self` in place.
    pub fn add_scaled(&mut self, other: &Volume, scale: f64) -> Result<(), VolumeError> {
        self.check_compatible(other)?;
        Zip::from(&mut self.data)
            .and(&other.data)
            .for_each(|a, &b| *a += scale * b);
        Ok(())
    }

    pub fn mapv_inplace<F: Fn(f64) -> f64>(&mut self, f: F) {
        self.data.mapv_inplace(f);
    }

    /// Clamps every voxel to `[lo, hi]`.
    pub fn clip(&mut self, lo: f64, hi: f64) {
        self.data.mapv_inplace(|v| v.clamp(lo, hi));
    }

    /// Zeros every voxel where the mask is not positive.
    pub fn apply_mask(&mut self, mask: &Volume) -> Result<(), VolumeError> {
        self.check_compatible(mask)?;
        Zip::from(&mut self.data).and(&mask.data).for_each(|v, &m| {
            if m <= 0.0 {
                *v = 0.0;
            }
        });
        Ok(())
    }

    /// Voxelwise mean of a non-empty set of grid-compatible images.
    pub fn mean_of(images: &[Volume]) -> Result<Volume, VolumeError> {
        let first = images.first().ok_or(VolumeError::EmptyMean)?;
        let mut acc = Volume::zeros_like(first);
        for img in images {
            acc.add_scaled(img, 1.0)?;
        }
        let scale = 1.0 / images.len() as f64;
        acc.data.mapv_inplace(|v| v * scale);
        Ok(acc)
    }

    /// Separable Gaussian smoothing with the kernel width given as FWHM in
    /// millimetres. σ per axis is FWHM/(2√(2 ln 2)) divided by the voxel
    /// spacing; the kernel is truncated at 4σ and renormalized at the
    /// borders so masked-edge voxels do not darken. A non-positive FWHM is
    /// the identity.
    pub fn gaussian_smooth_mm(&self, fwhm_mm: f64) -> Volume {
        if fwhm_mm <= 0.0 {
            return self.clone();
        }
        let mut data = self.data.clone();
        for axis in 0..3 {
            let spacing = self.geometry.voxel_size[axis].abs().max(1e-12);
            let sigma_vox = fwhm_mm / FWHM_TO_SIGMA / spacing;
            if sigma_vox < 1e-3 {
                continue;
            }
            let kernel = gaussian_kernel(sigma_vox);
            data = convolve_along_axis(&data, axis, &kernel);
        }
        Volume {
            geometry: self.geometry.clone(),
            data,
        }
    }

    /// Flattened voxel values at the mask's positive voxels (all voxels
    /// when no mask is given), in row-major scan order.
    pub fn masked_values(&self, mask: Option<&Volume>) -> Vec<f64> {
        match mask {
            Some(mask) => self
                .data
                .iter()
                .zip(mask.data.iter())
                .filter(|(_, &m)| m > 0.0)
                .map(|(&v, _)| v)
                .collect(),
            None => self.data.iter().copied().collect(),
        }
    }

    /// Rebuilds a volume from `masked_values` output: values are scattered
    /// back to the mask's positive voxels, zero elsewhere.
    pub fn from_masked_values(
        values: &[f64],
        mask: Option<&Volume>,
        reference: &Volume,
    ) -> Volume {
        let mut out = Volume::zeros_like(reference);
        match mask {
            Some(mask) => {
                let mut it = values.iter();
                Zip::from(&mut out.data).and(&mask.data).for_each(|v, &m| {
                    if m > 0.0 {
                        *v = it.next().copied().unwrap_or(0.0);
                    }
                });
            }
            None => {
                for (dst, &src) in out.data.iter_mut().zip(values.iter()) {
                    *dst = src;
                }
            }
        }
        out
    }
}

fn gaussian_kernel(sigma: f64) -> Vec<f64> {
    let radius = (4.0 * sigma).ceil() as usize;
    let mut kernel = Vec::with_capacity(2 * radius + 1);
    for offset in -(radius as isize)..=(radius as isize) {
        let x = offset as f64;
        kernel.push((-0.5 * x * x / (sigma * sigma)).exp());
    }
    let total: f64 = kernel.iter().sum();
    for w in &mut kernel {
        *w /= total;
    }
    kernel
}

fn convolve_along_axis(data: &Array3<f64>, axis: usize, kernel: &[f64]) -> Array3<f64> {
    let radius = kernel.len() / 2;
    let len = data.shape()[axis];
    let mut out = data.clone();
    for (in_lane, mut out_lane) in data
        .lanes(Axis(axis))
        .into_iter()
        .zip(out.lanes_mut(Axis(axis)))
    {
        for i in 0..len {
            let mut acc = 0.0;
            let mut weight = 0.0;
            for (k, &w) in kernel.iter().enumerate() {
                let j = i as isize + k as isize - radius as isize;
                if j >= 0 && (j as usize) < len {
                    acc += w * in_lane[j as usize];
                    weight += w;
                }
            }
            out_lane[i] = if weight > 0.0 { acc / weight } else { 0.0 };
        }
    }
    out
}

impl ShImage {
    pub fn new(data: Array4<f64>, geometry: Geometry) -> Self {
        ShImage { geometry, data }
    }

    /// Number of volumes along the SH axis.
    pub fn n_volumes(&self) -> usize {
        self.data.shape()[3]
    }

    pub fn grid_shape(&self) -> (usize, usize, usize) {
        let s = self.data.shape();
        (s[0], s[1], s[2])
    }

    /// Copies the half-open volume range `[start, end)` into a new image.
    pub fn slice_volumes(&self, start: usize, end: usize) -> ShImage {
        let data = self
            .data
            .slice(ndarray::s![.., .., .., start..end])
            .to_owned();
        ShImage {
            geometry: self.geometry.clone(),
            data,
        }
    }

    /// Sum of squared coefficients over the given volume range — the energy
    /// image of one SH order.
    pub fn sum_squares(&self, start: usize, end: usize) -> Volume {
        let slab = self.data.slice(ndarray::s![.., .., .., start..end]);
        let data = slab.map_axis(Axis(3), |coeffs| coeffs.iter().map(|c| c * c).sum());
        Volume {
            geometry: self.geometry.clone(),
            data,
        }
    }

    /// Multiplies every volume in `[start, end)` by the scalar image,
    /// broadcasting across the SH axis, writing in place.
    pub fn scale_volumes(
        &mut self,
        start: usize,
        end: usize,
        scale: &Volume,
    ) -> Result<(), VolumeError> {
        let grid: Vec<usize> = self.data.shape()[..3].to_vec();
        if grid != scale.data.shape() {
            return Err(VolumeError::ShapeMismatch(
                grid,
                scale.data.shape().to_vec(),
            ));
        }
        if !self.geometry.close_to(&scale.geometry) {
            return Err(VolumeError::GeometryMismatch);
        }
        for vol in start..end {
            let mut slab = self.data.slice_mut(ndarray::s![.., .., .., vol]);
            Zip::from(&mut slab).and(&scale.data).for_each(|c, &s| *c *= s);
        }
        Ok(())
    }
}
