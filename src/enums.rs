use std::fmt;

use clap::ValueEnum;

/// Order in which the slices of a series are arranged.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum SortBy {
    /// Position of each slice along the normal of the image plane.
    #[default]
    ImagePositionPatient,
    InstanceNumber,
    /// Keep the directory listing order.
    None,
}

/// How the DICOM files of a patient are laid out on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ImagesFolderStructure {
    /// Every instance of the patient sits directly in one folder.
    AllInOne,
    /// `studyN/seriesM/<instances>` below the patient folder.
    #[value(name = "hierarchy")]
    PatientStudySeriesInstanceHierarchy,
}

/// Where the research segmentation files live.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum SegmentationFilesLocation {
    /// A single folder holds the segmentations of every patient.
    AllInOneFolder,
    /// Each patient folder has its own segmentations folder.
    InEachPatientFolder,
}

impl fmt::Display for ImagesFolderStructure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllInOne => f.write_str("All In One"),
            Self::PatientStudySeriesInstanceHierarchy => {
                f.write_str("Patient-Study-Series-Instance Hierarchy")
            }
        }
    }
}

impl fmt::Display for SegmentationFilesLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllInOneFolder => f.write_str("All In One Folder"),
            Self::InEachPatientFolder => f.write_str("In Each Patient Folder"),
        }
    }
}
