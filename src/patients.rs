//! Patient folders under a common root and the multi-patient conversion run.

use std::fs;
use std::path::{Path, PathBuf};

use dicom_dictionary_std::tags;
use thiserror::Error;
use walkdir::WalkDir;

use crate::association::SelectionProvider;
use crate::seg::{SegEncoder, SegOutput, Template, TemplateError};
use crate::segmentation::filename_matches_patient;
use crate::series::SeriesIndexError;
use crate::volume_loader::{VolumeLoader, read_string};
use crate::writer::{DicomSegWriter, WriterConfig, WriterError};

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("Cannot list patients in {}: {source}", path.display())]
    Listing {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Conversion of {} failed: {source}", patient.display())]
    Patient {
        patient: PathBuf,
        source: WriterError,
    },
}

/// Names of the per-patient subfolders.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatientsLayout {
    pub images_folder: String,
    pub segmentations_folder: String,
}

impl Default for PatientsLayout {
    fn default() -> Self {
        Self {
            images_folder: "images".to_string(),
            segmentations_folder: "segmentations".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatientFolder {
    pub root: PathBuf,
    pub images: PathBuf,
    pub segmentations: PathBuf,
}

impl PatientFolder {
    pub fn new(root: impl Into<PathBuf>, layout: &PatientsLayout) -> Self {
        let root = root.into();
        Self {
            images: root.join(&layout.images_folder),
            segmentations: root.join(&layout.segmentations_folder),
            root,
        }
    }

    /// PatientID of the first readable DICOM file under `dir`, in file name
    /// order.
    pub fn patient_id_in(dir: &Path) -> Option<String> {
        WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .find_map(|entry| {
                let header = VolumeLoader::read_header(entry.path()).ok()?;
                read_string(&header, tags::PATIENT_ID)
            })
    }

    /// PatientID found in the images folder, or anywhere in the patient
    /// folder when there is no images folder yet.
    pub fn patient_id(&self) -> Option<String> {
        if self.images.is_dir() {
            Self::patient_id_in(&self.images)
        } else {
            Self::patient_id_in(&self.root)
        }
    }

    pub fn writer(&self, config: WriterConfig) -> DicomSegWriter {
        DicomSegWriter::new(&self.images, &self.segmentations, config)
    }
}

/// Patient subdirectories of a root folder, in name order. Folders are
/// built as the iterator advances; restart by creating a new one.
#[derive(Debug)]
pub struct PatientFolders {
    entries: std::vec::IntoIter<PathBuf>,
    layout: PatientsLayout,
}

impl PatientFolders {
    pub fn new(root: impl AsRef<Path>, layout: PatientsLayout) -> std::io::Result<Self> {
        let mut entries = fs::read_dir(root.as_ref())?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect::<Vec<_>>();
        entries.sort();
        Ok(Self {
            entries: entries.into_iter(),
            layout,
        })
    }
}

impl Iterator for PatientFolders {
    type Item = PatientFolder;

    fn next(&mut self) -> Option<Self::Item> {
        self.entries
            .next()
            .map(|path| PatientFolder::new(path, &self.layout))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.entries.size_hint()
    }
}

/// Decides which segmentation files of a shared folder belong to a patient.
#[derive(Clone, Debug)]
pub struct SegmentationFilenameMatcher {
    patient_id: String,
}

impl SegmentationFilenameMatcher {
    pub fn new(patient_id: impl Into<String>) -> Self {
        Self {
            patient_id: patient_id.into(),
        }
    }

    pub fn matches(&self, file_name: &str) -> bool {
        filename_matches_patient(file_name, &self.patient_id)
    }

    /// Files of `dir` whose names designate the patient, sorted.
    pub fn matching_files(&self, dir: &Path) -> std::io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let matches = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| self.matches(name));
            if path.is_file() && matches {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

/// Outcome of [`convert_patients`].
#[derive(Debug, Default)]
pub struct RunSummary {
    /// Patients whose conversion ran to completion.
    pub converted: Vec<PathBuf>,
    /// Patients left out, with the reason.
    pub skipped: Vec<(PathBuf, String)>,
    pub outputs: Vec<SegOutput>,
}

/// Convert every patient folder under `root`.
///
/// The template is loaded before the first patient. Patients whose images
/// folder holds no series, or series of several patients, are logged and
/// skipped; any other failure stops the run.
pub fn convert_patients<P>(
    root: &Path,
    layout: &PatientsLayout,
    template_path: &Path,
    config: WriterConfig,
    provider: &mut P,
) -> Result<RunSummary, ConvertError>
where
    P: SelectionProvider + ?Sized,
{
    let template = Template::from_file(template_path)?;
    let mut encoder = SegEncoder::new(template, config.encode);
    let patients =
        PatientFolders::new(root, layout.clone()).map_err(|source| ConvertError::Listing {
            path: root.to_path_buf(),
            source,
        })?;

    let mut summary = RunSummary::default();
    for patient in patients {
        if !patient.images.is_dir() || !patient.segmentations.is_dir() {
            log::warn!(
                "Skipping {}: expected {} and {} folders",
                patient.root.display(),
                layout.images_folder,
                layout.segmentations_folder
            );
            summary
                .skipped
                .push((patient.root.clone(), "missing images or segmentations folder".into()));
            continue;
        }

        log::info!("Converting patient folder {}", patient.root.display());
        match patient.writer(config).write(&mut encoder, provider) {
            Ok(outputs) => {
                summary.outputs.extend(outputs);
                summary.converted.push(patient.root);
            }
            Err(WriterError::SeriesIndex(
                err @ (SeriesIndexError::NoSeriesFound(_)
                | SeriesIndexError::MultiPatientInconsistency { .. }),
            )) => {
                log::error!("{err}");
                summary.skipped.push((patient.root, err.to_string()));
            }
            Err(source) => {
                return Err(ConvertError::Patient {
                    patient: patient.root,
                    source,
                });
            }
        }
    }

    log::info!(
        "Wrote {} DICOM SEG files for {} patients ({} skipped)",
        summary.outputs.len(),
        summary.converted.len(),
        summary.skipped.len()
    );
    Ok(summary)
}
