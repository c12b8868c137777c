//! NIfTI-1 label maps.

use std::path::Path;

use nalgebra::{Matrix3, Vector3};
use ndarray::Array3;
use nifti::{NiftiHeader, NiftiObject, NiftiVolume, RandomAccessNiftiVolume, ReaderOptions};

use super::{ReadVolumeError, to_label};
use crate::volume::{Geometry, Volume};

pub(crate) fn read_nifti(path: &Path) -> Result<Volume<u16>, ReadVolumeError> {
    let object = ReaderOptions::new().read_file(path)?;
    let header = object.header();
    let volume = object.volume();

    let dim = volume.dim();
    let extra = dim.iter().skip(3).any(|&extent| extent > 1);
    if dim.len() < 3 || extra {
        return Err(ReadVolumeError::InvalidHeader {
            path: path.to_path_buf(),
            message: format!("expected a 3D volume, found dimensions {dim:?}"),
        });
    }
    let (width, height, depth) = (dim[0], dim[1], dim[2]);

    let mut coords = vec![0u16; dim.len()];
    let mut labels = Vec::with_capacity(width as usize * height as usize * depth as usize);
    for z in 0..depth {
        for y in 0..height {
            for x in 0..width {
                coords[0] = x;
                coords[1] = y;
                coords[2] = z;
                labels.push(to_label(path, volume.get_f64(&coords)?)?);
            }
        }
    }

    let size = [width as usize, height as usize, depth as usize];
    let geometry = geometry_from_header(path, header, size)?;
    let data = Array3::from_shape_vec((size[2], size[1], size[0]), labels).map_err(|err| {
        ReadVolumeError::InvalidHeader {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    })?;
    Ok(Volume::new(data, geometry)?)
}

/// Voxel-to-world transform in LPS. The sform wins over the qform; files with
/// neither fall back to a scaled identity.
fn geometry_from_header(
    path: &Path,
    header: &NiftiHeader,
    size: [usize; 3],
) -> Result<Geometry, ReadVolumeError> {
    let (affine, origin) = if header.sform_code > 0 {
        let rows = [header.srow_x, header.srow_y, header.srow_z];
        let affine = Matrix3::from_fn(|r, c| rows[r][c] as f64);
        let origin = Vector3::new(rows[0][3] as f64, rows[1][3] as f64, rows[2][3] as f64);
        (affine, origin)
    } else if header.qform_code > 0 {
        qform_affine(header)
    } else {
        let pixdim = |axis: usize| match header.pixdim[axis] as f64 {
            spacing if spacing > 0.0 => spacing,
            _ => 1.0,
        };
        (
            Matrix3::from_diagonal(&Vector3::new(pixdim(1), pixdim(2), pixdim(3))),
            Vector3::zeros(),
        )
    };

    // NIfTI world coordinates are RAS.
    let ras_to_lps = Matrix3::from_diagonal(&Vector3::new(-1.0, -1.0, 1.0));
    let affine = ras_to_lps * affine;
    let origin = ras_to_lps * origin;

    let spacing = Vector3::new(
        affine.column(0).norm(),
        affine.column(1).norm(),
        affine.column(2).norm(),
    );
    if spacing.iter().any(|s| *s == 0.0) {
        return Err(ReadVolumeError::InvalidHeader {
            path: path.to_path_buf(),
            message: "degenerate voxel-to-world transform".into(),
        });
    }
    let direction = Matrix3::from_columns(&[
        affine.column(0) / spacing.x,
        affine.column(1) / spacing.y,
        affine.column(2) / spacing.z,
    ]);
    Ok(Geometry::new(origin, spacing, direction, size))
}

fn qform_affine(header: &NiftiHeader) -> (Matrix3<f64>, Vector3<f64>) {
    let (b, c, d) = (
        header.quatern_b as f64,
        header.quatern_c as f64,
        header.quatern_d as f64,
    );
    let a = (1.0 - b * b - c * c - d * d).max(0.0).sqrt();
    let rotation = Matrix3::new(
        a * a + b * b - c * c - d * d,
        2.0 * (b * c - a * d),
        2.0 * (b * d + a * c),
        2.0 * (b * c + a * d),
        a * a + c * c - b * b - d * d,
        2.0 * (c * d - a * b),
        2.0 * (b * d - a * c),
        2.0 * (c * d + a * b),
        a * a + d * d - b * b - c * c,
    );
    let qfac = if header.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
    let scale = Vector3::new(
        header.pixdim[1] as f64,
        header.pixdim[2] as f64,
        header.pixdim[3] as f64 * qfac,
    );
    let origin = Vector3::new(
        header.quatern_x as f64,
        header.quatern_y as f64,
        header.quatern_z as f64,
    );
    (rotation * Matrix3::from_diagonal(&scale), origin)
}
