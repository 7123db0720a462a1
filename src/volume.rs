/*!
# Volumes
4-D NIfTI scans (x, y, z, t) and the transforms that map them to and from the canonical cubic
frames the denoising model runs on.

```no_run
# use ganlab::{result::Result, volume::{self, Volume}};
# fn main() -> Result<()> {
let scan = Volume::load("scan.nii.gz")?;
let padded = volume::pad(scan.data().view(), [[9, 9], [5, 4], [9, 9]]);
let mut frames = volume::to_frames(padded, 64)?;
volume::normalize(&mut frames, 40_000.);
# Ok(())
# }
```
*/
use crate::result::Result;
use anyhow::Context;
use ndarray::{s, Array4, ArrayView4, Axis, Ix4};
use nifti::{writer::WriterOptions, IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Volume shape errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VolumeError {
    /// The volume is not 3-D or 4-D.
    #[error("expected a volume (x, y, z, t), found shape {0:?}")]
    Rank(Vec<usize>),
    /// The padded frame is not a cube of the expected size.
    #[error("padded frames are {found:?}, expected {expected}^3")]
    Frame {
        /// The spatial shape after padding.
        found: [usize; 3],
        /// The expected edge length.
        expected: usize,
    },
}

/// A 4-D scan and the header it was read with.
#[derive(Debug, Clone)]
pub struct Volume {
    data: Array4<f32>,
    header: NiftiHeader,
}

impl Volume {
    /// Creates a volume from `data` (x, y, z, t) and a reference `header`.
    pub fn new(data: Array4<f32>, header: NiftiHeader) -> Self {
        Self { data, header }
    }
    /// Reads a NIfTI file, optionally gzip compressed.
    ///
    /// 3-D volumes get a time axis of length 1.
    ///
    /// **Errors**
    /// - The file could not be read.
    /// - The volume is not 3-D or 4-D ([`VolumeError::Rank`]).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let object = ReaderOptions::new()
            .read_file(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let header = object.header().clone();
        let data = object.into_volume().into_ndarray::<f32>()?;
        let data = match data.ndim() {
            3 => data.insert_axis(Axis(3)),
            4 => data,
            _ => return Err(VolumeError::Rank(data.shape().to_vec()).into()),
        };
        let data = data
            .into_dimensionality::<Ix4>()
            .map_err(|_| VolumeError::Rank(vec![]))?;
        debug!(path = %path.display(), shape = ?data.shape(), "loaded volume");
        Ok(Self { data, header })
    }
    /// Writes a NIfTI file, gzip compressed if the path ends with ".gz".
    ///
    /// The header is copied from the source, apart from the fields describing the shape and
    /// the type of the data.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let data = self.data.as_standard_layout();
        WriterOptions::new(path)
            .reference_header(&self.header)
            .write_nifti(&data)
            .with_context(|| format!("failed to write {}", path.display()))?;
        debug!(path = %path.display(), shape = ?self.data.shape(), "saved volume");
        Ok(())
    }
    /// The data, (x, y, z, t).
    pub fn data(&self) -> &Array4<f32> {
        &self.data
    }
    /// Moves out the data.
    pub fn into_data(self) -> Array4<f32> {
        self.data
    }
    /// The header.
    pub fn header(&self) -> &NiftiHeader {
        &self.header
    }
    /// A volume with `data` and the same header.
    pub fn with_data(&self, data: Array4<f32>) -> Self {
        Self {
            data,
            header: self.header.clone(),
        }
    }
    /// The voxel to world transform, the rows srow_x, srow_y and srow_z of the header.
    pub fn affine(&self) -> [[f32; 4]; 4] {
        [
            self.header.srow_x,
            self.header.srow_y,
            self.header.srow_z,
            [0., 0., 0., 1.],
        ]
    }
}

/// Zero pads the spatial axes by (before, after) per axis.
pub fn pad(data: ArrayView4<f32>, padding: [[usize; 2]; 3]) -> Array4<f32> {
    let (x, y, z, t) = data.dim();
    let [[x0, x1], [y0, y1], [z0, z1]] = padding;
    let mut padded = Array4::zeros((x0 + x + x1, y0 + y + y1, z0 + z + z1, t));
    padded
        .slice_mut(s![x0..x0 + x, y0..y0 + y, z0..z0 + z, ..])
        .assign(&data);
    padded
}

/// Moves the time axis to the front, (x, y, z, t) -> (t, x, y, z).
///
/// **Errors**
/// - The spatial shape is not `frame` ^ 3 ([`VolumeError::Frame`]).
pub fn to_frames(data: Array4<f32>, frame: usize) -> Result<Array4<f32>, VolumeError> {
    let (x, y, z, _) = data.dim();
    if [x, y, z] != [frame; 3] {
        return Err(VolumeError::Frame {
            found: [x, y, z],
            expected: frame,
        });
    }
    Ok(data.permuted_axes([3, 0, 1, 2]))
}

/// Moves the time axis back to the end, (t, x, y, z) -> (x, y, z, t).
pub fn from_frames(frames: Array4<f32>) -> Array4<f32> {
    frames.permuted_axes([1, 2, 3, 0])
}

/// Divides by `scale`.
pub fn normalize(data: &mut Array4<f32>, scale: f32) {
    data.par_mapv_inplace(|x| x / scale);
}

/// Multiplies by `scale`.
pub fn unnormalize(data: &mut Array4<f32>, scale: f32) {
    data.par_mapv_inplace(|x| x * scale);
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn scan(shape: (usize, usize, usize, usize)) -> Array4<f32> {
        Array4::from_shape_fn(shape, |(x, y, z, t)| {
            (1 + x + 100 * y + 10_000 * z) as f32 + 0.5 * t as f32
        })
    }

    #[test]
    fn canonical_frames() -> Result<()> {
        let data = scan((46, 55, 46, 3));
        let padded = pad(data.view(), [[9, 9], [5, 4], [9, 9]]);
        assert_eq!(padded.dim(), (64, 64, 64, 3));
        assert_eq!(padded[[9, 5, 9, 0]], data[[0, 0, 0, 0]]);
        assert_eq!(padded[[54, 59, 54, 2]], data[[45, 54, 45, 2]]);
        assert_eq!(padded[[8, 5, 9, 0]], 0.);
        assert_eq!(padded[[9, 4, 9, 0]], 0.);
        assert_eq!(padded[[9, 60, 9, 0]], 0.);
        let frames = to_frames(padded.clone(), 64)?;
        assert_eq!(frames.dim(), (3, 64, 64, 64));
        assert_eq!(frames[[2, 10, 20, 30]], padded[[10, 20, 30, 2]]);
        assert_eq!(from_frames(frames), padded);
        Ok(())
    }

    #[test]
    fn wrong_frame() {
        let padded = pad(scan((40, 55, 46, 1)).view(), [[9, 9], [5, 4], [9, 9]]);
        assert_eq!(
            to_frames(padded, 64).unwrap_err(),
            VolumeError::Frame {
                found: [58, 64, 64],
                expected: 64
            }
        );
    }

    #[test]
    fn scale_inverse() {
        let original = scan((3, 4, 5, 2));
        let mut data = original.clone();
        normalize(&mut data, 40_000.);
        assert!(data.iter().all(|x| x.abs() <= 1.5));
        unnormalize(&mut data, 40_000.);
        for (a, b) in data.iter().zip(original.iter()) {
            assert_relative_eq!(a, b, max_relative = 1e-6);
        }
    }

    #[test]
    fn save_load() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("scan.nii.gz");
        let mut header = NiftiHeader::default();
        header.srow_x = [2., 0., 0., -90.];
        header.srow_y = [0., 2., 0., -126.];
        header.srow_z = [0., 0., 2., -72.];
        header.sform_code = 1;
        let volume = Volume::new(scan((4, 5, 6, 2)), header);
        volume.save(&path)?;
        let loaded = Volume::load(&path)?;
        assert_eq!(loaded.data(), volume.data());
        assert_eq!(loaded.affine(), volume.affine());
        assert_eq!(loaded.affine()[1][3], -126.);
        Ok(())
    }
}
