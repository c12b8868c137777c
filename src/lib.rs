//! # DICOM-SEG conversion library
//!
//! This crate turns volumetric label maps stored in research formats (NRRD,
//! NIfTI) into DICOM Segmentation objects that point back to the image series
//! they were drawn on.

//!
//! This library is part of the dicom-rs ecosystem and leverages its
//! components to read the source series and to write the segmentation
//! objects. For every segmentation file of a patient:
//!  - the source series is chosen among the series of the patient's images
//!    folder, interactively or through a scripted [`SelectionProvider`]
//!  - the label map is optionally resampled onto the grid of that series
//!    (nearest neighbour, in parallel using rayon)
//!  - a multi-class DICOM-SEG is encoded from a dcmqi metadata template,
//!    with freshly generated identifiers, and written next to the source
//!
//!  Segmentations are assumed to have the following attributes:
//!   - Integer labels between 0 and 65535, 0 being the background
//!   - One 3D volume per file (no time series)
//!   - Geometry expressed in LPS (DICOM) or RAS (NIfTI, most NRRD files)
//!
//! # Roadmap
//!
//!  - Fractional segmentations
//!  - Detached NRRD headers
//!  - Compressed transfer syntaxes for the output
//!
//! # Examples
//!
//! ## Converting the segmentations of one patient
//!
//! Index the DICOM series of `Patient1/images`, associate every label map of
//! `Patient1/segmentations` with the first series, resample it onto that
//! series and write the DICOM-SEG files.
//!
//! ```no_run
//! # use segvolume::{DicomSegWriter, ScriptedSelections, SegEncoder, Template, WriterConfig};
//! let template = Template::from_file("metainfo.json").expect("should have loaded the template");
//! let config = WriterConfig {
//!     resample: true,
//!     ..WriterConfig::default()
//! };
//! let mut encoder = SegEncoder::new(template, config.encode);
//! let writer = DicomSegWriter::new("Patient1/images", "Patient1/segmentations", config);
//! let outputs = writer
//!     .write(&mut encoder, &mut ScriptedSelections::always(0, 16))
//!     .expect("should have written the DICOM-SEG files");
//! for output in outputs {
//!     println!("{} {}", output.path.display(), output.sop_instance_uid);
//! }
//! ```

pub mod association;
pub mod enums;
pub mod patients;
pub mod resampler;
pub mod seg;
pub mod segmentation;
pub mod series;
pub mod structure;
pub mod uid;
pub mod volume;
pub mod volume_loader;
pub mod writer;

pub use association::{ConsolePrompt, ScriptedSelections, SelectionProvider};
pub use enums::{ImagesFolderStructure, SegmentationFilesLocation, SortBy};
pub use patients::{PatientsLayout, RunSummary, convert_patients};
pub use seg::{EncodeOptions, SegEncoder, SegOutput, Template};
pub use structure::{FolderStructurer, StructureConfig};
pub use volume::{Geometry, Volume};
pub use writer::{DicomSegWriter, WriterConfig};
