//! Rearranging patient folders into and out of the `images/` +
//! `segmentations/` working layout.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use dicom_dictionary_std::tags;
use thiserror::Error;

use crate::enums::{ImagesFolderStructure, SegmentationFilesLocation};
use crate::patients::{PatientFolder, PatientFolders, PatientsLayout, SegmentationFilenameMatcher};
use crate::volume_loader::{VolumeLoader, read_string};

#[derive(Debug, Error)]
pub enum StructureError {
    #[error("Images structure '{images}' with segmentations location '{segmentations}' is not supported")]
    Unsupported {
        images: ImagesFolderStructure,
        segmentations: SegmentationFilesLocation,
    },

    #[error("Directory {} is not empty after its files were moved", .0.display())]
    NonEmptyDirectory(PathBuf),

    #[error("Expected folder {} does not exist", .0.display())]
    MissingFolder(PathBuf),

    #[error("No DICOM file with a PatientID in {}", .0.display())]
    NoPatientId(PathBuf),

    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StructureError + '_ {
    move |source| StructureError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Clone, Debug)]
pub struct StructureConfig {
    pub images_structure: ImagesFolderStructure,
    pub segmentations_location: SegmentationFilesLocation,
    pub layout: PatientsLayout,
}

/// Moves patient data between one of the supported folder conventions and
/// the working layout where each patient folder holds an images folder and
/// a segmentations folder.
///
/// | images structure | segmentations | `structure` | `destructure` |
/// |---|---|---|---|
/// | all in one | in each patient folder | nothing to do | flatten both folders |
/// | all in one | all in one folder | move images, copy matching segmentations | flatten both folders |
/// | study/series hierarchy | all in one folder | flatten hierarchy, then as above | flatten, rebuild hierarchy |
/// | study/series hierarchy | in each patient folder | unsupported | unsupported |
#[derive(Clone, Debug)]
pub struct FolderStructurer {
    patients_root: PathBuf,
    config: StructureConfig,
}

impl FolderStructurer {
    pub fn new(patients_root: impl Into<PathBuf>, config: StructureConfig) -> Self {
        Self {
            patients_root: patients_root.into(),
            config,
        }
    }

    fn check_supported(&self) -> Result<(), StructureError> {
        match (
            self.config.images_structure,
            self.config.segmentations_location,
        ) {
            (
                images @ ImagesFolderStructure::PatientStudySeriesInstanceHierarchy,
                segmentations @ SegmentationFilesLocation::InEachPatientFolder,
            ) => Err(StructureError::Unsupported {
                images,
                segmentations,
            }),
            _ => Ok(()),
        }
    }

    fn patients(&self) -> Result<PatientFolders, StructureError> {
        PatientFolders::new(&self.patients_root, self.config.layout.clone())
            .map_err(io_error(&self.patients_root))
    }

    /// Bring every patient folder into the working layout.
    pub fn structure(&self, segmentations_root: &Path) -> Result<(), StructureError> {
        self.check_supported()?;
        if self.config.segmentations_location == SegmentationFilesLocation::InEachPatientFolder {
            log::info!("Patient folders already follow the working layout");
            return Ok(());
        }
        if self.config.images_structure
            == ImagesFolderStructure::PatientStudySeriesInstanceHierarchy
        {
            self.destructure_images()?;
        }
        self.structure_segmentations(segmentations_root)
    }

    /// Undo [`FolderStructurer::structure`]. Segmentation files (and any DICOM
    /// SEG written next to them) end up in the patient folder, or are removed
    /// with `delete_segmentations`.
    pub fn destructure(&self, delete_segmentations: bool) -> Result<(), StructureError> {
        self.check_supported()?;
        self.destructure_segmentations(delete_segmentations)?;
        if self.config.images_structure
            == ImagesFolderStructure::PatientStudySeriesInstanceHierarchy
        {
            self.structure_images()?;
        }
        Ok(())
    }

    fn structure_segmentations(&self, segmentations_root: &Path) -> Result<(), StructureError> {
        if !segmentations_root.is_dir() {
            return Err(StructureError::MissingFolder(segmentations_root.to_path_buf()));
        }
        for patient in self.patients()? {
            let patient_id = PatientFolder::patient_id_in(&patient.root)
                .ok_or_else(|| StructureError::NoPatientId(patient.root.clone()))?;

            let entries = sorted_entries(&patient.root)?;
            fs::create_dir(&patient.images).map_err(io_error(&patient.images))?;
            for entry in entries {
                move_into(&entry, &patient.images)?;
            }

            fs::create_dir(&patient.segmentations).map_err(io_error(&patient.segmentations))?;
            let matcher = SegmentationFilenameMatcher::new(&patient_id);
            let files = matcher
                .matching_files(segmentations_root)
                .map_err(io_error(segmentations_root))?;
            for file in &files {
                if let Some(name) = file.file_name() {
                    let target = patient.segmentations.join(name);
                    fs::copy(file, &target).map_err(io_error(&target))?;
                }
            }
            log::info!(
                "Structured {} (patient {patient_id}, {} segmentation files)",
                patient.root.display(),
                files.len()
            );
        }
        Ok(())
    }

    fn destructure_segmentations(&self, delete_segmentations: bool) -> Result<(), StructureError> {
        for patient in self.patients()? {
            if !patient.segmentations.is_dir() {
                return Err(StructureError::MissingFolder(patient.segmentations));
            }
            if delete_segmentations {
                fs::remove_dir_all(&patient.segmentations)
                    .map_err(io_error(&patient.segmentations))?;
            } else {
                flatten_into_parent(&patient.segmentations)?;
            }

            if !patient.images.is_dir() {
                return Err(StructureError::MissingFolder(patient.images));
            }
            flatten_into_parent(&patient.images)?;
            log::info!("Destructured {}", patient.root.display());
        }
        Ok(())
    }

    /// Sort the DICOM files of each patient folder into `study<n>/series<m>`.
    fn structure_images(&self) -> Result<(), StructureError> {
        for patient in self.patients()? {
            let mut studies: HashMap<String, usize> = HashMap::new();
            let mut series: HashMap<String, usize> = HashMap::new();

            for path in sorted_entries(&patient.root)? {
                if !path.is_file() {
                    continue;
                }
                let header = match VolumeLoader::read_header(&path) {
                    Ok(header) => header,
                    Err(err) => {
                        log::debug!("Leaving {} in place: {err}", path.display());
                        continue;
                    }
                };
                let study_uid = read_string(&header, tags::STUDY_INSTANCE_UID).unwrap_or_default();
                let series_uid = read_string(&header, tags::SERIES_INSTANCE_UID).unwrap_or_default();

                let next_study = studies.len() + 1;
                let study = *studies.entry(study_uid).or_insert(next_study);
                let next_series = series.len() + 1;
                let series_number = *series.entry(series_uid).or_insert(next_series);

                let folder = patient
                    .root
                    .join(format!("study{study}"))
                    .join(format!("series{series_number}"));
                fs::create_dir_all(&folder).map_err(io_error(&folder))?;
                move_into(&path, &folder)?;
            }
            log::info!(
                "Rebuilt {} studies and {} series in {}",
                studies.len(),
                series.len(),
                patient.root.display()
            );
        }
        Ok(())
    }

    /// Flatten `study*/series*/` into the patient folder, renaming the files
    /// `IM0`, `IM1`, ...
    fn destructure_images(&self) -> Result<(), StructureError> {
        for patient in self.patients()? {
            let mut file_index = 0;
            for study in sorted_entries(&patient.root)? {
                if !study.is_dir() {
                    continue;
                }
                for series in sorted_entries(&study)? {
                    if !series.is_dir() {
                        continue;
                    }
                    for file in sorted_entries(&series)? {
                        if !file.is_file() {
                            continue;
                        }
                        let target = patient.root.join(format!("IM{file_index}"));
                        if target.exists() {
                            return Err(StructureError::Io {
                                path: target,
                                source: std::io::ErrorKind::AlreadyExists.into(),
                            });
                        }
                        fs::rename(&file, &target).map_err(io_error(&file))?;
                        file_index += 1;
                    }
                    remove_empty_dir(&series)?;
                }
                remove_empty_dir(&study)?;
            }
            log::debug!(
                "Flattened {file_index} files into {}",
                patient.root.display()
            );
        }
        Ok(())
    }
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, StructureError> {
    let mut entries = fs::read_dir(dir)
        .map_err(io_error(dir))?
        .map(|entry| entry.map(|entry| entry.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_error(dir))?;
    entries.sort();
    Ok(entries)
}

fn move_into(path: &Path, folder: &Path) -> Result<(), StructureError> {
    let Some(name) = path.file_name() else {
        return Ok(());
    };
    fs::rename(path, folder.join(name)).map_err(io_error(path))
}

/// Move the content of `dir` one level up and remove it.
fn flatten_into_parent(dir: &Path) -> Result<(), StructureError> {
    let parent = dir
        .parent()
        .ok_or_else(|| StructureError::MissingFolder(dir.to_path_buf()))?;
    for entry in sorted_entries(dir)? {
        move_into(&entry, parent)?;
    }
    remove_empty_dir(dir)
}

fn remove_empty_dir(dir: &Path) -> Result<(), StructureError> {
    if fs::read_dir(dir).map_err(io_error(dir))?.next().is_some() {
        return Err(StructureError::NonEmptyDirectory(dir.to_path_buf()));
    }
    fs::remove_dir(dir).map_err(io_error(dir))
}
