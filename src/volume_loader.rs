use crate::{
    enums::SortBy,
    volume::Geometry,
};

use dicom::core::Tag;
use dicom::object::{InMemDicomObject, OpenFileOptions};
use dicom_dictionary_std::tags;
use nalgebra::{Matrix3, Vector3};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Tolerance used when comparing direction cosines of different slices.
const ORIENTATION_TOLERANCE: f64 = 1e-4;

#[derive(Debug, Error)]
pub enum VolumeLoaderError {
    #[error("No valid DICOM images found")]
    NoValidImages,

    #[error("Inconsistent image dimensions")]
    InconsistentDimensions,

    #[error("Slices do not share a common image orientation")]
    InconsistentOrientation,

    #[error("Image orientation does not describe two independent axes")]
    DegenerateOrientation,

    #[error("Missing spacing information")]
    MissingSpacing,

    #[error("Missing {attribute} in {}", path.display())]
    MissingAttribute {
        attribute: &'static str,
        path: PathBuf,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),
}

/// The attributes of one slice needed to place it in space and to reference
/// it from a derived object.
#[derive(Clone, Debug)]
pub struct SliceHeader {
    pub path: PathBuf,
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    pub instance_number: Option<i32>,
    pub rows: Option<u16>,
    pub columns: Option<u16>,
    pub image_position: Option<Vector3<f64>>,
    pub image_orientation: Option<[f64; 6]>,
    pub pixel_spacing: Option<(f64, f64)>,
    pub slice_thickness: Option<f64>,
    pub spacing_between_slices: Option<f64>,
}

impl SliceHeader {
    pub fn from_object(path: impl Into<PathBuf>, dicom_object: &InMemDicomObject) -> Self {
        let image_orientation = read_floats(dicom_object, tags::IMAGE_ORIENTATION_PATIENT)
            .filter(|values| values.len() == 6)
            .map(|values| {
                let mut orientation = [0.0; 6];
                orientation.copy_from_slice(&values);
                orientation
            });

        Self {
            path: path.into(),
            sop_class_uid: read_string(dicom_object, tags::SOP_CLASS_UID).unwrap_or_default(),
            sop_instance_uid: read_string(dicom_object, tags::SOP_INSTANCE_UID)
                .unwrap_or_default(),
            instance_number: dicom_object
                .element(tags::INSTANCE_NUMBER)
                .ok()
                .and_then(|element| element.to_int::<i32>().ok()),
            rows: read_u16(dicom_object, tags::ROWS),
            columns: read_u16(dicom_object, tags::COLUMNS),
            image_position: read_floats(dicom_object, tags::IMAGE_POSITION_PATIENT)
                .filter(|values| values.len() == 3)
                .map(|values| Vector3::new(values[0], values[1], values[2])),
            image_orientation,
            pixel_spacing: read_floats(dicom_object, tags::PIXEL_SPACING)
                .filter(|values| values.len() == 2)
                .map(|values| (values[0], values[1])),
            slice_thickness: read_floats(dicom_object, tags::SLICE_THICKNESS)
                .and_then(|values| values.first().copied()),
            spacing_between_slices: read_floats(dicom_object, tags::SPACING_BETWEEN_SLICES)
                .and_then(|values| values.first().copied()),
        }
    }

    /// Unit normal of the image plane.
    pub fn normal(&self) -> Option<Vector3<f64>> {
        self.axes().map(|(_, _, normal)| normal)
    }

    /// Unit vectors along the image rows and columns, and their cross product.
    fn axes(&self) -> Option<(Vector3<f64>, Vector3<f64>, Vector3<f64>)> {
        let orientation = self.image_orientation?;
        let row = Vector3::new(orientation[0], orientation[1], orientation[2]);
        let column = Vector3::new(orientation[3], orientation[4], orientation[5]);
        let normal = row.cross(&column);
        if row.norm() == 0.0 || column.norm() == 0.0 || normal.norm() < ORIENTATION_TOLERANCE {
            return None;
        }
        Some((row.normalize(), column.normalize(), normal.normalize()))
    }
}

pub struct VolumeLoader;

impl VolumeLoader {
    /// Read the header of a DICOM file, stopping before the pixel data.
    pub fn read_header(path: impl AsRef<Path>) -> Result<InMemDicomObject, VolumeLoaderError> {
        let dicom_object = OpenFileOptions::new()
            .read_until(tags::PIXEL_DATA)
            .open_file(path.as_ref())?;
        Ok(dicom_object.into_inner())
    }

    pub fn sort_slices(slices: &mut [SliceHeader], sort_by: SortBy) {
        match sort_by {
            SortBy::ImagePositionPatient => {
                let Some((_, _, normal)) = slices.iter().find_map(SliceHeader::axes) else {
                    return;
                };
                slices.sort_by(|a, b| {
                    let a = a.image_position.map(|position| position.dot(&normal));
                    let b = b.image_position.map(|position| position.dot(&normal));
                    a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
                });
            }
            SortBy::InstanceNumber => slices.sort_by_key(|slice| slice.instance_number),
            SortBy::None => {}
        }
    }

    /// Grid covered by the slices, taken in the given order.
    ///
    /// The first slice gives the origin, the image orientation gives the x
    /// and y directions and the stacking direction runs from the first to the
    /// last slice.
    pub fn geometry_from_slices(slices: &[SliceHeader]) -> Result<Geometry, VolumeLoaderError> {
        let first = slices.first().ok_or(VolumeLoaderError::NoValidImages)?;

        Self::validate_dimensions(slices)?;
        let (row, column, normal) = first
            .axes()
            .ok_or(VolumeLoaderError::DegenerateOrientation)?;
        Self::validate_orientation(slices)?;

        let positions = slices
            .iter()
            .map(|slice| {
                slice
                    .image_position
                    .ok_or_else(|| VolumeLoaderError::MissingAttribute {
                        attribute: "ImagePositionPatient",
                        path: slice.path.clone(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let (row_spacing, column_spacing) =
            Self::get_spacing(slices).ok_or(VolumeLoaderError::MissingSpacing)?;

        let (slice_direction, slice_spacing) = if positions.len() > 1 {
            let step = (positions[positions.len() - 1] - positions[0]).dot(&normal)
                / (positions.len() - 1) as f64;
            if step < 0.0 {
                (-normal, -step)
            } else {
                (normal, step)
            }
        } else {
            let spacing = first
                .spacing_between_slices
                .or(first.slice_thickness)
                .unwrap_or(1.0);
            (normal, spacing)
        };

        let rows = first.rows.unwrap_or_default() as usize;
        let columns = first.columns.unwrap_or_default() as usize;

        Ok(Geometry::new(
            positions[0],
            // PixelSpacing holds (between rows, between columns) = (y, x)
            Vector3::new(column_spacing, row_spacing, slice_spacing.max(f64::EPSILON)),
            Matrix3::from_columns(&[row, column, slice_direction]),
            [columns, rows, slices.len()],
        ))
    }

    fn validate_dimensions(slices: &[SliceHeader]) -> Result<(), VolumeLoaderError> {
        let first_dim = (slices[0].rows, slices[0].columns);
        if first_dim.0.is_none() || first_dim.1.is_none() {
            return Err(VolumeLoaderError::MissingAttribute {
                attribute: "Rows/Columns",
                path: slices[0].path.clone(),
            });
        }
        if slices
            .iter()
            .any(|slice| (slice.rows, slice.columns) != first_dim)
        {
            return Err(VolumeLoaderError::InconsistentDimensions);
        }
        Ok(())
    }

    fn validate_orientation(slices: &[SliceHeader]) -> Result<(), VolumeLoaderError> {
        let Some(reference) = slices[0].image_orientation else {
            return Err(VolumeLoaderError::DegenerateOrientation);
        };
        let consistent = slices.iter().all(|slice| {
            slice.image_orientation.is_some_and(|orientation| {
                orientation
                    .iter()
                    .zip(reference.iter())
                    .all(|(a, b)| (a - b).abs() <= ORIENTATION_TOLERANCE)
            })
        });
        if consistent {
            Ok(())
        } else {
            Err(VolumeLoaderError::InconsistentOrientation)
        }
    }

    fn get_spacing(slices: &[SliceHeader]) -> Option<(f64, f64)> {
        slices.iter().find_map(|slice| slice.pixel_spacing)
    }
}

fn read_floats(dicom_object: &InMemDicomObject, tag: Tag) -> Option<Vec<f64>> {
    dicom_object.element(tag).ok()?.to_multi_float64().ok()
}

fn read_u16(dicom_object: &InMemDicomObject, tag: Tag) -> Option<u16> {
    dicom_object.element(tag).ok()?.to_int::<u16>().ok()
}

pub(crate) fn read_string(dicom_object: &InMemDicomObject, tag: Tag) -> Option<String> {
    dicom_object
        .element_opt(tag)
        .ok()
        .flatten()
        .and_then(|element| element.to_str().ok())
        .map(|value| value.trim_end_matches(['\0', ' ']).trim().to_string())
        .filter(|value| !value.is_empty())
}
