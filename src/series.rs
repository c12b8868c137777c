//! Discovery of the image series stored in a patient's DICOM folder.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use dicom::object::InMemDicomObject;
use dicom_dictionary_std::tags;
use thiserror::Error;

use crate::enums::SortBy;
use crate::volume::Geometry;
use crate::volume_loader::{SliceHeader, VolumeLoader, VolumeLoaderError, read_string};

#[derive(Debug, Error)]
pub enum SeriesIndexError {
    #[error("Given directory {} does not contain a DICOM series", .0.display())]
    NoSeriesFound(PathBuf),

    #[error(
        "All DICOM files in {} must belong to the same patient, found patient IDs {patient_ids:?}",
        folder.display()
    )]
    MultiPatientInconsistency {
        folder: PathBuf,
        patient_ids: BTreeSet<String>,
    },

    #[error("Cannot list {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// The slices of one series, in stacking order, with the header of the first
/// file read for it. Only patient, study and series attributes are taken from
/// that header.
#[derive(Clone, Debug)]
pub struct ImageSeries {
    pub series_instance_uid: String,
    pub patient_id: String,
    pub series_description: String,
    pub series_number: Option<i32>,
    pub slices: Vec<SliceHeader>,
    pub first_header: InMemDicomObject,
}

impl ImageSeries {
    /// Voxel grid spanned by the slices.
    pub fn geometry(&self) -> Result<Geometry, VolumeLoaderError> {
        VolumeLoader::geometry_from_slices(&self.slices)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SeriesIndexer {
    sort_by: SortBy,
}

impl SeriesIndexer {
    pub fn new(sort_by: SortBy) -> Self {
        Self { sort_by }
    }

    /// Group the DICOM files of `folder` by SeriesInstanceUID.
    ///
    /// Files that cannot be parsed as DICOM are skipped. Series come back
    /// ordered by SeriesNumber, then SeriesInstanceUID.
    ///
    /// # Errors
    ///
    /// Returns [`SeriesIndexError::NoSeriesFound`] when nothing could be
    /// indexed and [`SeriesIndexError::MultiPatientInconsistency`] when the
    /// series do not all belong to the same patient.
    pub fn index_directory(&self, folder: &Path) -> Result<Vec<ImageSeries>, SeriesIndexError> {
        let mut paths: Vec<_> = fs::read_dir(folder)
            .map_err(|source| SeriesIndexError::Io {
                path: folder.to_path_buf(),
                source,
            })?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        paths.sort();

        let mut grouped: BTreeMap<String, (Vec<SliceHeader>, InMemDicomObject)> = BTreeMap::new();
        for path in paths {
            let header = match VolumeLoader::read_header(&path) {
                Ok(header) => header,
                Err(err) => {
                    log::debug!("Skipping {}: {err}", path.display());
                    continue;
                }
            };
            let Some(series_uid) = read_string(&header, tags::SERIES_INSTANCE_UID) else {
                log::debug!("Skipping {}: no SeriesInstanceUID", path.display());
                continue;
            };
            let slice = SliceHeader::from_object(&path, &header);
            grouped
                .entry(series_uid)
                .or_insert_with(|| (Vec::new(), header))
                .0
                .push(slice);
        }

        let mut series_list = Vec::with_capacity(grouped.len());
        for (series_instance_uid, (mut slices, first_header)) in grouped {
            VolumeLoader::sort_slices(&mut slices, self.sort_by);
            series_list.push(ImageSeries {
                patient_id: read_string(&first_header, tags::PATIENT_ID).unwrap_or_default(),
                series_description: read_string(&first_header, tags::SERIES_DESCRIPTION)
                    .unwrap_or_default(),
                series_number: first_header
                    .element(tags::SERIES_NUMBER)
                    .ok()
                    .and_then(|element| element.to_int::<i32>().ok()),
                series_instance_uid,
                slices,
                first_header,
            });
        }

        if series_list.is_empty() {
            return Err(SeriesIndexError::NoSeriesFound(folder.to_path_buf()));
        }

        let patient_ids: BTreeSet<String> = series_list
            .iter()
            .map(|series| series.patient_id.clone())
            .collect();
        if patient_ids.len() != 1 {
            return Err(SeriesIndexError::MultiPatientInconsistency {
                folder: folder.to_path_buf(),
                patient_ids,
            });
        }

        series_list.sort_by(|a, b| {
            (a.series_number.unwrap_or(i32::MAX), &a.series_instance_uid)
                .cmp(&(b.series_number.unwrap_or(i32::MAX), &b.series_instance_uid))
        });

        log::info!(
            "Indexed {} series in {}",
            series_list.len(),
            folder.display()
        );
        Ok(series_list)
    }
}
