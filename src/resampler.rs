//! Nearest-neighbour reslicing of label maps onto the grid of a source series.

use nalgebra::{Matrix3, Vector3};
use ndarray::{Array3, ShapeError};
use rayon::prelude::*;
use thiserror::Error;

use crate::volume::{Geometry, Volume, VolumeError};

#[derive(Debug, Error)]
pub enum ResampleError {
    #[error("Source grid has a singular index-to-physical transform")]
    DegenerateGeometry,

    #[error(transparent)]
    Shape(#[from] ShapeError),

    #[error(transparent)]
    Volume(#[from] VolumeError),
}

/// Reslices label volumes onto another grid.
pub struct Resampler;

impl Resampler {
    /// Nearest-neighbour resampling of `volume` onto `reference`.
    ///
    /// Voxels of the reference grid falling outside the source extent are
    /// set to `T::default()`. Values are copied, never blended, so the output
    /// only holds values of the input plus the fill value.
    pub fn resample_nearest<T>(
        volume: &Volume<T>,
        reference: &Geometry,
    ) -> Result<Volume<T>, ResampleError>
    where
        T: Copy + Default + Send + Sync,
    {
        let (linear, offset) = Self::index_transform(volume.geometry(), reference)?;
        let (depth, height, width) = volume.dim();
        let source_size = [width, height, depth];
        let source = volume.data();

        // one task per output row, x fastest within a row
        let (out_depth, out_height, out_width) = reference.dim();
        let values: Vec<T> = (0..out_depth * out_height)
            .into_par_iter()
            .flat_map(|row| {
                let (z, y) = (row / out_height, row % out_height);
                (0..out_width)
                    .map(|x| {
                        let continuous =
                            linear * Vector3::new(x as f64, y as f64, z as f64) + offset;
                        Self::nearest_index(&continuous, source_size)
                            .map_or_else(T::default, |[sx, sy, sz]| source[[sz, sy, sx]])
                    })
                    .collect::<Vec<T>>()
            })
            .collect();

        let output = Array3::from_shape_vec(reference.dim(), values)?;
        Ok(Volume::new(output, reference.clone())?)
    }

    /// Affine map from reference indices to continuous source indices.
    fn index_transform(
        source: &Geometry,
        reference: &Geometry,
    ) -> Result<(Matrix3<f64>, Vector3<f64>), ResampleError> {
        let source_inverse = source
            .index_to_physical_matrix()
            .try_inverse()
            .ok_or(ResampleError::DegenerateGeometry)?;
        let linear = source_inverse * reference.index_to_physical_matrix();
        let offset = source_inverse * (reference.origin - source.origin);
        Ok((linear, offset))
    }

    /// Rounds half up; a point is inside when its continuous index lies in
    /// `[-0.5, size - 0.5)` on every axis.
    #[inline]
    fn nearest_index(continuous: &Vector3<f64>, size: [usize; 3]) -> Option<[usize; 3]> {
        let mut index = [0usize; 3];
        for axis in 0..3 {
            let rounded = (continuous[axis] + 0.5).floor();
            if !(rounded >= 0.0 && rounded < size[axis] as f64) {
                return None;
            }
            index[axis] = rounded as usize;
        }
        Some(index)
    }
}
