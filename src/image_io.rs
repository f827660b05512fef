//! NIfTI-1 persistence for the crate's own artifacts.
//!
//! β maps, scale maps and harmonized SH images are stored as `.nii` /
//! `.nii.gz`. Reading goes through the `nifti` crate; writing assembles the
//! 348-byte NIfTI-1 header directly and emits float32 data, gzip-compressed
//! when the file name asks for it. Every failure carries the offending path.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use ndarray::{Array3, Array4, ArrayD};
use nifti::volume::ndarray::IntoNdArray;
use nifti::{InMemNiftiObject, NiftiHeader, NiftiObject};
use thiserror::Error;

use crate::volume::{Geometry, ShImage, Volume};

#[derive(Error, Debug)]
pub enum ImageIoError {
    #[error("failed to read image '{path}': {detail}")]
    Read { path: PathBuf, detail: String },
    #[error("failed to write image '{path}': {detail}")]
    Write { path: PathBuf, detail: String },
    #[error("image '{path}' has {found} dimensions, expected {expected}")]
    WrongDimensionality {
        path: PathBuf,
        found: usize,
        expected: usize,
    },
}

fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

fn load_object(path: &Path) -> Result<InMemNiftiObject, ImageIoError> {
    let bytes = std::fs::read(path).map_err(|e| ImageIoError::Read {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    let result = if is_gzip(&bytes) {
        InMemNiftiObject::from_reader(GzDecoder::new(Cursor::new(&bytes)))
    } else {
        InMemNiftiObject::from_reader(Cursor::new(&bytes))
    };
    result.map_err(|e| ImageIoError::Read {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })
}

/// Geometry from the header: sform when present, voxel-scaled identity
/// otherwise.
fn geometry_from_header(header: &NiftiHeader) -> Geometry {
    let vs = [
        header.pixdim[1] as f64,
        header.pixdim[2] as f64,
        header.pixdim[3] as f64,
    ];
    if header.sform_code > 0 {
        let x = &header.srow_x;
        let y = &header.srow_y;
        let z = &header.srow_z;
        Geometry {
            voxel_size: vs,
            affine: [
                x[0] as f64, x[1] as f64, x[2] as f64, x[3] as f64,
                y[0] as f64, y[1] as f64, y[2] as f64, y[3] as f64,
                z[0] as f64, z[1] as f64, z[2] as f64, z[3] as f64,
                0.0, 0.0, 0.0, 1.0,
            ],
        }
    } else {
        Geometry {
            voxel_size: vs,
            affine: [
                vs[0], 0.0, 0.0, 0.0,
                0.0, vs[1], 0.0, 0.0,
                0.0, 0.0, vs[2], 0.0,
                0.0, 0.0, 0.0, 1.0,
            ],
        }
    }
}

fn to_array(path: &Path, obj: InMemNiftiObject) -> Result<(ArrayD<f64>, Geometry), ImageIoError> {
    let geometry = geometry_from_header(obj.header());
    let array = obj
        .into_volume()
        .into_ndarray::<f64>()
        .map_err(|e| ImageIoError::Read {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
    Ok((array, geometry))
}

/// Reads a 3-D scalar image.
pub fn read_volume(path: &Path) -> Result<Volume, ImageIoError> {
    let (array, geometry) = to_array(path, load_object(path)?)?;
    // A trailing singleton SH axis still counts as 3-D.
    let array = if array.ndim() == 4 && array.shape()[3] == 1 {
        array.index_axis_move(ndarray::Axis(3), 0)
    } else {
        array
    };
    let ndim = array.ndim();
    let data: Array3<f64> = array
        .into_dimensionality()
        .map_err(|_| ImageIoError::WrongDimensionality {
            path: path.to_path_buf(),
            found: ndim,
            expected: 3,
        })?;
    Ok(Volume::new(data, geometry))
}

/// Reads a 4-D SH coefficient image.
pub fn read_sh_image(path: &Path) -> Result<ShImage, ImageIoError> {
    let (array, geometry) = to_array(path, load_object(path)?)?;
    // Accept a 3-D file as an lmax-0 image with a single coefficient.
    let array = if array.ndim() == 3 {
        array.insert_axis(ndarray::Axis(3))
    } else {
        array
    };
    let ndim = array.ndim();
    let data: Array4<f64> = array
        .into_dimensionality()
        .map_err(|_| ImageIoError::WrongDimensionality {
            path: path.to_path_buf(),
            found: ndim,
            expected: 4,
        })?;
    Ok(ShImage::new(data, geometry))
}

/// Assembles a NIfTI-1 single-file image: 348-byte header, 4-byte extension
/// sentinel, float32 payload in x-fastest order.
fn encode_nifti(dims: &[usize], geometry: &Geometry, data: &[f64]) -> Vec<u8> {
    let mut header = [0u8; 348];

    header[0..4].copy_from_slice(&348i32.to_le_bytes());

    let mut dim = [1i16; 8];
    dim[0] = dims.len() as i16;
    for (i, &d) in dims.iter().enumerate() {
        dim[i + 1] = d as i16;
    }
    for (i, &d) in dim.iter().enumerate() {
        let offset = 40 + i * 2;
        header[offset..offset + 2].copy_from_slice(&d.to_le_bytes());
    }

    // datatype 16 = FLOAT32, bitpix 32
    header[70..72].copy_from_slice(&16i16.to_le_bytes());
    header[72..74].copy_from_slice(&32i16.to_le_bytes());

    let pixdim: [f32; 8] = [
        1.0,
        geometry.voxel_size[0] as f32,
        geometry.voxel_size[1] as f32,
        geometry.voxel_size[2] as f32,
        1.0,
        1.0,
        1.0,
        1.0,
    ];
    for (i, &p) in pixdim.iter().enumerate() {
        let offset = 76 + i * 4;
        header[offset..offset + 4].copy_from_slice(&p.to_le_bytes());
    }

    // vox_offset = 352, scl_slope = 1, scl_inter = 0
    header[108..112].copy_from_slice(&352.0f32.to_le_bytes());
    header[112..116].copy_from_slice(&1.0f32.to_le_bytes());
    header[116..120].copy_from_slice(&0.0f32.to_le_bytes());

    // sform only
    header[254..256].copy_from_slice(&1i16.to_le_bytes());
    for row in 0..3 {
        for col in 0..4 {
            let offset = 280 + row * 16 + col * 4;
            let value = geometry.affine[row * 4 + col] as f32;
            header[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        }
    }

    header[344..348].copy_from_slice(b"n+1\0");

    let mut buffer = Vec::with_capacity(352 + data.len() * 4);
    buffer.extend_from_slice(&header);
    buffer.extend_from_slice(&[0u8; 4]);
    for &v in data {
        buffer.extend_from_slice(&(v as f32).to_le_bytes());
    }
    buffer
}

fn write_bytes(path: &Path, bytes: Vec<u8>) -> Result<(), ImageIoError> {
    let bytes = if path.to_string_lossy().ends_with(".nii.gz") {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&bytes)
            .and_then(|_| encoder.finish())
            .map_err(|e| ImageIoError::Write {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?
    } else {
        bytes
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| ImageIoError::Write {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;
        }
    }
    std::fs::write(path, bytes).map_err(|e| ImageIoError::Write {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })
}

/// Writes a 3-D scalar image; `.nii.gz` suffix selects gzip.
pub fn write_volume(path: &Path, volume: &Volume) -> Result<(), ImageIoError> {
    let (nx, ny, nz) = volume.shape();
    let mut flat = Vec::with_capacity(nx * ny * nz);
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                flat.push(volume.data[[x, y, z]]);
            }
        }
    }
    write_bytes(path, encode_nifti(&[nx, ny, nz], &volume.geometry, &flat))
}

/// Writes a 4-D SH image; `.nii.gz` suffix selects gzip.
pub fn write_sh_image(path: &Path, image: &ShImage) -> Result<(), ImageIoError> {
    let (nx, ny, nz) = image.grid_shape();
    let nv = image.n_volumes();
    let mut flat = Vec::with_capacity(nx * ny * nz * nv);
    for v in 0..nv {
        for z in 0..nz {
            for y in 0..ny {
                for x in 0..nx {
                    flat.push(image.data[[x, y, z, v]]);
                }
            }
        }
    }
    write_bytes(path, encode_nifti(&[nx, ny, nz, nv], &image.geometry, &flat))
}
