//! Per-patient conversion loop: associate, resample, encode, persist, clean up.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::association::{AssociationResolver, PromptError, SelectionProvider};
use crate::enums::SortBy;
use crate::resampler::{ResampleError, Resampler};
use crate::seg::{EncodeError, EncodeOptions, SegEncoder, SegOutput};
use crate::segmentation::{ReadVolumeError, SegmentationFile, SegmentationFormat, is_seg_output};
use crate::series::{ImageSeries, SeriesIndexError, SeriesIndexer};
use crate::volume_loader::VolumeLoaderError;

#[derive(Debug, Error)]
pub enum WriterError {
    #[error(transparent)]
    SeriesIndex(#[from] SeriesIndexError),

    #[error("Association aborted: {0}")]
    Prompt(#[from] PromptError),

    #[error("Cannot read segmentation: {0}")]
    ReadVolume(#[from] ReadVolumeError),

    #[error("Cannot build the source series grid: {0}")]
    SourceGeometry(#[from] VolumeLoaderError),

    #[error("Resampling failed: {0}")]
    Resample(#[from] ResampleError),

    #[error("Encoding failed: {0}")]
    Encode(#[from] EncodeError),

    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Behaviour of a conversion run.
#[derive(Clone, Copy, Debug, Default)]
pub struct WriterConfig {
    /// Reslice each segmentation onto its source series grid before encoding.
    pub resample: bool,
    /// Remove the segmentation file once all its associations are written.
    pub delete_source: bool,
    /// Offer to associate a segmentation with more than one series.
    pub multi_association: bool,
    pub encode: EncodeOptions,
    pub sort_by: SortBy,
}

/// Converts the segmentation files of one folder against the DICOM series
/// of another.
#[derive(Clone, Debug)]
pub struct DicomSegWriter {
    images_dir: PathBuf,
    segmentations_dir: PathBuf,
    config: WriterConfig,
}

impl DicomSegWriter {
    pub fn new(
        images_dir: impl Into<PathBuf>,
        segmentations_dir: impl Into<PathBuf>,
        config: WriterConfig,
    ) -> Self {
        Self {
            images_dir: images_dir.into(),
            segmentations_dir: segmentations_dir.into(),
            config,
        }
    }

    /// Label map files of the segmentations folder, sorted by name.
    pub fn segmentation_files(&self) -> Result<Vec<SegmentationFile>, WriterError> {
        let io_error = |source| WriterError::Io {
            path: self.segmentations_dir.clone(),
            source,
        };
        let mut paths = fs::read_dir(&self.segmentations_dir)
            .map_err(io_error)?
            .map(|entry| entry.map(|entry| entry.path()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(io_error)?;
        paths.sort();

        let mut files = Vec::new();
        for path in paths {
            if !path.is_file() {
                continue;
            }
            if is_seg_output(&path) {
                log::debug!("Skipping existing DICOM SEG {}", path.display());
                continue;
            }
            if SegmentationFormat::from_path(&path).is_none() {
                log::info!("Skipping {}: not a NRRD or NIfTI file", path.display());
                continue;
            }
            files.push(SegmentationFile::new(path)?);
        }
        Ok(files)
    }

    pub fn index_series(&self) -> Result<Vec<ImageSeries>, SeriesIndexError> {
        SeriesIndexer::new(self.config.sort_by).index_directory(&self.images_dir)
    }

    /// Convert every segmentation file, returning the written objects in
    /// order.
    ///
    /// The image folder is indexed once, before any segmentation is read. A
    /// segmentation file is only deleted after all of its associations were
    /// written, so a failure leaves it in place.
    pub fn write<P>(
        &self,
        encoder: &mut SegEncoder,
        provider: &mut P,
    ) -> Result<Vec<SegOutput>, WriterError>
    where
        P: SelectionProvider + ?Sized,
    {
        let series = self.index_series()?;
        let files = self.segmentation_files()?;
        if files.is_empty() {
            log::warn!(
                "No segmentation file found in {}",
                self.segmentations_dir.display()
            );
        }

        let mut outputs = Vec::new();
        for file in &files {
            outputs.extend(self.write_segmentation(file, &series, encoder, provider)?);
        }
        Ok(outputs)
    }

    fn write_segmentation<P>(
        &self,
        file: &SegmentationFile,
        series: &[ImageSeries],
        encoder: &mut SegEncoder,
        provider: &mut P,
    ) -> Result<Vec<SegOutput>, WriterError>
    where
        P: SelectionProvider + ?Sized,
    {
        let mut resolver = AssociationResolver::new(series, provider);
        let mut outputs = Vec::new();
        let mut association_index = 0;
        loop {
            let source = resolver.resolve(&file.file_name())?;
            let mut segmentation = file.load()?;
            if self.config.resample {
                let reference = source.geometry()?;
                log::debug!(
                    "Resampling {} onto series {}",
                    file.file_name(),
                    source.series_instance_uid
                );
                segmentation = Resampler::resample_nearest(&segmentation, &reference)?;
            }

            let path = file.output_path(&self.segmentations_dir, association_index);
            outputs.push(encoder.write(&segmentation, source, &path)?);

            if !(self.config.multi_association && resolver.add_another()?) {
                break;
            }
            association_index += 1;
        }

        if self.config.delete_source {
            remove_source(file.path())?;
        }
        Ok(outputs)
    }
}

fn remove_source(path: &Path) -> Result<(), WriterError> {
    fs::remove_file(path).map_err(|source| WriterError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    log::info!("Deleted segmentation file {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn lists_only_label_maps_sorted_by_name() {
        let scratch = tempdir().unwrap();
        let dir = scratch.path();
        fs::create_dir_all(dir.join("nested.nrrd")).unwrap();
        for name in [
            "b.nii.gz",
            "a.seg.nrrd",
            "a.seg_0.SEG.dcm",
            "notes.txt",
            ".a.seg_1.SEG.dcm.part",
        ] {
            fs::write(dir.join(name), b"").unwrap();
        }

        let writer = DicomSegWriter::new(dir.join("images"), dir, WriterConfig::default());
        let names: Vec<String> = writer
            .segmentation_files()
            .unwrap()
            .iter()
            .map(SegmentationFile::file_name)
            .collect();
        assert_eq!(names, vec!["a.seg.nrrd", "b.nii.gz"]);
    }
}
