//! Research-format label maps (NRRD, NIfTI) and the files holding them.

mod nii;
mod nrrd;

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::volume::{Volume, VolumeError};

/// Suffix of the DICOM-SEG files written next to the segmentations.
pub const SEG_SUFFIX: &str = ".SEG.dcm";

#[derive(Debug, Error)]
pub enum ReadVolumeError {
    #[error("Unsupported segmentation file format: {}", .0.display())]
    UnsupportedFormat(PathBuf),

    #[error("Invalid header in {}: {message}", path.display())]
    InvalidHeader { path: PathBuf, message: String },

    #[error("Voxel data of {} is truncated: expected {expected} bytes, found {found}", path.display())]
    Truncated {
        path: PathBuf,
        expected: usize,
        found: usize,
    },

    #[error("Value {value} in {} is not a label (expected an integer in 0..=65535)", path.display())]
    InvalidLabel { path: PathBuf, value: f64 },

    #[error("NIfTI error: {0}")]
    Nifti(#[from] nifti::NiftiError),

    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentationFormat {
    Nrrd,
    Nifti,
}

impl SegmentationFormat {
    /// Detect the format from the file name: `.nrrd`, `.nii` or `.nii.gz`.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if name.ends_with(".nrrd") {
            Some(Self::Nrrd)
        } else if name.ends_with(".nii") || name.ends_with(".nii.gz") {
            Some(Self::Nifti)
        } else {
            None
        }
    }
}

/// A label map on disk. Voxels are only read by [`SegmentationFile::load`].
#[derive(Clone, Debug)]
pub struct SegmentationFile {
    path: PathBuf,
    stem: String,
    format: SegmentationFormat,
}

impl SegmentationFile {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, ReadVolumeError> {
        let path = path.into();
        let format = SegmentationFormat::from_path(&path)
            .ok_or_else(|| ReadVolumeError::UnsupportedFormat(path.clone()))?;
        let stem = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .ok_or_else(|| ReadVolumeError::UnsupportedFormat(path.clone()))?;
        Ok(Self { path, stem, format })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name without its last extension (`Patient1_CT.seg.nrrd` gives
    /// `Patient1_CT.seg`).
    pub fn stem(&self) -> &str {
        &self.stem
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.stem.clone())
    }

    /// `<folder>/<stem>_<association_index>.SEG.dcm`
    pub fn output_path(&self, folder: &Path, association_index: usize) -> PathBuf {
        folder.join(format!("{}_{association_index}{SEG_SUFFIX}", self.stem))
    }

    pub fn load(&self) -> Result<Volume<u16>, ReadVolumeError> {
        log::debug!("Loading label map {}", self.path.display());
        match self.format {
            SegmentationFormat::Nrrd => nrrd::read_nrrd(&self.path),
            SegmentationFormat::Nifti => nii::read_nifti(&self.path),
        }
    }
}

/// Whether a file name belongs to `patient_id`: the ID must occur in the name
/// and must not be followed by a digit, so that `Patient1` does not claim
/// `Patient12_CT.nrrd`.
pub fn filename_matches_patient(file_name: &str, patient_id: &str) -> bool {
    if patient_id.is_empty() {
        return false;
    }
    let Some(start) = file_name.find(patient_id) else {
        return false;
    };
    !file_name[start + patient_id.len()..]
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_digit())
}

pub fn is_seg_output(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(SEG_SUFFIX))
}

pub(crate) fn to_label(path: &Path, value: f64) -> Result<u16, ReadVolumeError> {
    if value.fract() == 0.0 && (0.0..=u16::MAX as f64).contains(&value) {
        Ok(value as u16)
    } else {
        Err(ReadVolumeError::InvalidLabel {
            path: path.to_path_buf(),
            value,
        })
    }
}
