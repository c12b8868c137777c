use std::collections::BTreeSet;

use nalgebra::{Matrix3, Vector3};
use ndarray::Array3;
use ndarray::ArrayView2;
use ndarray::s;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("Voxel array has shape {data:?} but the geometry describes {geometry:?}")]
    ShapeMismatch {
        data: (usize, usize, usize),
        geometry: (usize, usize, usize),
    },
}

/// Placement of a voxel grid in the DICOM patient coordinate system (LPS).
///
/// A continuous index `i = (x, y, z)` maps to the physical point
/// `origin + direction * diag(spacing) * i`.
#[derive(Clone, Debug, PartialEq)]
pub struct Geometry {
    /// Physical position of the centre of voxel (0, 0, 0), in millimetres.
    pub origin: Vector3<f64>,
    /// Voxel size along (x, y, z).
    pub spacing: Vector3<f64>,
    /// Direction cosines, one column per index axis.
    pub direction: Matrix3<f64>,
    /// Number of voxels along (x, y, z).
    pub size: [usize; 3],
}

impl Geometry {
    pub fn new(
        origin: Vector3<f64>,
        spacing: Vector3<f64>,
        direction: Matrix3<f64>,
        size: [usize; 3],
    ) -> Self {
        Self {
            origin,
            spacing,
            direction,
            size,
        }
    }

    /// Unit spacing, zero origin and identity directions.
    pub fn identity(size: [usize; 3]) -> Self {
        Self::new(
            Vector3::zeros(),
            Vector3::new(1.0, 1.0, 1.0),
            Matrix3::identity(),
            size,
        )
    }

    /// Array shape matching this grid (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        (self.size[2], self.size[1], self.size[0])
    }

    /// Matrix taking an index offset to a physical offset.
    pub fn index_to_physical_matrix(&self) -> Matrix3<f64> {
        self.direction * Matrix3::from_diagonal(&self.spacing)
    }

    pub fn index_to_physical(&self, index: Vector3<f64>) -> Vector3<f64> {
        self.origin + self.index_to_physical_matrix() * index
    }

    /// Continuous index of a physical point, `None` for a degenerate grid.
    pub fn physical_to_index(&self, point: Vector3<f64>) -> Option<Vector3<f64>> {
        let inverse = self.index_to_physical_matrix().try_inverse()?;
        Some(inverse * (point - self.origin))
    }

    /// Unit vector along which slices are stacked.
    pub fn slice_normal(&self) -> Vector3<f64> {
        self.direction.column(2).into_owned()
    }

    /// Whether both grids share size and, within `tolerance`, origin, spacing
    /// and directions.
    pub fn approx_eq(&self, other: &Geometry, tolerance: f64) -> bool {
        self.size == other.size
            && (self.origin - other.origin).amax() <= tolerance
            && (self.spacing - other.spacing).amax() <= tolerance
            && (self.direction - other.direction).amax() <= tolerance
    }
}

/// A voxel array placed on a [`Geometry`]. Data is stored as
/// (depth, height, width), i.e. `[z, y, x]`.
#[derive(Clone, Debug)]
pub struct Volume<T = u16> {
    data: Array3<T>,
    geometry: Geometry,
}

impl<T> Volume<T> {
    pub fn new(data: Array3<T>, geometry: Geometry) -> Result<Self, VolumeError> {
        if data.dim() != geometry.dim() {
            return Err(VolumeError::ShapeMismatch {
                data: data.dim(),
                geometry: geometry.dim(),
            });
        }
        Ok(Self { data, geometry })
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Get a reference to the underlying data
    pub fn data(&self) -> &Array3<T> {
        &self.data
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Slice `index` along the stacking axis.
    pub fn get_slice(&self, index: usize) -> Option<ArrayView2<'_, T>> {
        if index >= self.dim().0 {
            return None;
        }
        Some(self.data.slice(s![index, .., ..]))
    }
}

impl<T: Copy + Ord> Volume<T> {
    /// Distinct voxel values, in ascending order.
    pub fn labels(&self) -> BTreeSet<T> {
        self.data.iter().copied().collect()
    }
}
