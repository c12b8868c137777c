//! DICOM-SEG creation: metadata template, frame encoding and persistence.

mod multiclass;
mod template;

pub use multiclass::{EncodeOptions, MultiClassWriter};
pub use template::{AlgorithmType, Code, SegmentAttributes, Template, TemplateError, rgb_to_dicom_lab};

use std::fs;
use std::path::{Path, PathBuf};

use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
use dicom_dictionary_std::{tags, uids};
use thiserror::Error;

use crate::series::ImageSeries;
use crate::uid::UidGenerator;
use crate::volume::Volume;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error(
        "Segmentation grid {segmentation:?} does not match the source series {series:?} (slices, rows, columns)"
    )]
    GridMismatch {
        segmentation: (usize, usize, usize),
        series: (usize, usize, usize),
    },

    #[error("Segmentation slice {slice} lies {offset} mm along the slice normal, where the source series has no image")]
    UnmatchedSlice { slice: usize, offset: f64 },

    #[error("Label {0} is not declared in the metadata template")]
    UndeclaredSegment(u16),

    #[error("Segmentation has no frame to encode")]
    EmptySegmentation,

    #[error("Source series has no {0}")]
    MissingSourceAttribute(&'static str),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("Cannot build file meta group: {0}")]
    FileMeta(String),

    #[error("DICOM write error: {0}")]
    Write(#[from] dicom::object::WriteError),

    #[error("Cannot persist {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Identity of a persisted segmentation object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegOutput {
    pub path: PathBuf,
    pub sop_instance_uid: String,
    pub series_instance_uid: String,
}

/// Turns label volumes into DICOM-SEG files. Every object it produces gets a
/// SOPInstanceUID and a SeriesInstanceUID never handed out before by this
/// encoder.
#[derive(Debug)]
pub struct SegEncoder {
    template: Template,
    options: EncodeOptions,
    uids: UidGenerator,
}

impl SegEncoder {
    pub fn new(template: Template, options: EncodeOptions) -> Self {
        Self {
            template,
            options,
            uids: UidGenerator::new(),
        }
    }

    /// Encode `segmentation` against `source` and stamp fresh identifiers.
    pub fn encode(
        &mut self,
        segmentation: &Volume<u16>,
        source: &ImageSeries,
    ) -> Result<InMemDicomObject, EncodeError> {
        let mut dataset = MultiClassWriter::new(&self.template, self.options)
            .write(segmentation, source)?;
        dataset.put(DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(self.uids.next_uid()),
        ));
        dataset.put(DataElement::new(
            tags::SERIES_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(self.uids.next_uid()),
        ));
        Ok(dataset)
    }

    /// Encode and persist to `path`.
    pub fn write(
        &mut self,
        segmentation: &Volume<u16>,
        source: &ImageSeries,
        path: &Path,
    ) -> Result<SegOutput, EncodeError> {
        let dataset = self.encode(segmentation, source)?;
        let uid = |tag| {
            dataset
                .element(tag)
                .ok()
                .and_then(|element| element.to_str().ok())
                .map(|value| value.trim_end_matches('\0').to_string())
                .unwrap_or_default()
        };
        let output = SegOutput {
            path: path.to_path_buf(),
            sop_instance_uid: uid(tags::SOP_INSTANCE_UID),
            series_instance_uid: uid(tags::SERIES_INSTANCE_UID),
        };
        save(dataset, path)?;
        Ok(output)
    }
}

/// Serialize `dataset` as Explicit VR Little Endian and move it into place
/// in one rename, so `path` never holds a partial file.
pub fn save(dataset: InMemDicomObject, path: &Path) -> Result<(), EncodeError> {
    let sop_instance_uid = dataset
        .element(tags::SOP_INSTANCE_UID)
        .ok()
        .and_then(|element| element.to_str().ok())
        .map(|value| value.trim_end_matches('\0').to_string())
        .ok_or(EncodeError::MissingSourceAttribute("SOPInstanceUID"))?;

    let file = dataset
        .with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
                .media_storage_sop_class_uid(uids::SEGMENTATION_STORAGE)
                .media_storage_sop_instance_uid(sop_instance_uid),
        )
        .map_err(|err| EncodeError::FileMeta(err.to_string()))?;
    let mut bytes = Vec::new();
    file.write_all(&mut bytes)?;

    let io_error = |source| EncodeError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let partial = path.with_file_name(format!(".{file_name}.part"));
    if let Err(err) = fs::write(&partial, &bytes).and_then(|()| fs::rename(&partial, path)) {
        let _ = fs::remove_file(&partial);
        return Err(io_error(err));
    }
    log::info!("DICOM SEG file saved with path {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn dataset() -> InMemDicomObject {
        InMemDicomObject::from_element_iter([
            DataElement::new(tags::SOP_CLASS_UID, VR::UI, uids::SEGMENTATION_STORAGE),
            DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, "1.2.826.0.1.3680043.8.498.99"),
            DataElement::new(tags::MODALITY, VR::CS, "SEG"),
        ])
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn saves_through_a_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mask_0.SEG.dcm");

        save(dataset(), &path).unwrap();
        assert_eq!(entries(dir.path()), vec!["mask_0.SEG.dcm"]);
    }

    #[test]
    fn failed_rename_leaves_no_partial_file() {
        let dir = tempdir().unwrap();
        // a non-empty directory cannot be replaced by a file
        let path = dir.path().join("mask_0.SEG.dcm");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("keep"), b"").unwrap();

        assert!(matches!(save(dataset(), &path), Err(EncodeError::Io { .. })));
        assert_eq!(entries(dir.path()), vec!["mask_0.SEG.dcm"]);
        assert_eq!(entries(&path), vec!["keep"]);
    }

    #[test]
    fn failed_write_leaves_no_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing").join("mask_0.SEG.dcm");

        assert!(matches!(save(dataset(), &path), Err(EncodeError::Io { .. })));
        assert!(entries(dir.path()).is_empty());
    }
}
