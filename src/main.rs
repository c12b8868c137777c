use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use segvolume::{
    ConsolePrompt, EncodeOptions, FolderStructurer, ImagesFolderStructure, PatientsLayout,
    SegmentationFilesLocation, SortBy, StructureConfig, WriterConfig, convert_patients,
};

#[derive(Parser)]
#[command(name = "segvolume")]
#[command(about = "Convert NRRD/NIfTI segmentations into DICOM-SEG files linked to their source series")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a DICOM-SEG for every segmentation file of every patient
    Convert(ConvertArgs),
    /// Rearrange patient folders into the images/segmentations layout
    Structure(StructureArgs),
    /// Restore the original folder layout
    Destructure(DestructureArgs),
}

#[derive(Args)]
struct LayoutArgs {
    /// Name of the folder holding a patient's DICOM files
    #[arg(long, default_value = "images")]
    images_folder: String,

    /// Name of the folder holding a patient's segmentation files
    #[arg(long, default_value = "segmentations")]
    segmentations_folder: String,
}

impl LayoutArgs {
    fn layout(&self) -> PatientsLayout {
        PatientsLayout {
            images_folder: self.images_folder.clone(),
            segmentations_folder: self.segmentations_folder.clone(),
        }
    }
}

#[derive(Args)]
struct ConvertArgs {
    /// Folder containing one subfolder per patient
    #[arg(value_name = "PATIENTS_ROOT")]
    patients_root: PathBuf,

    /// dcmqi meta-information JSON describing the segments
    #[arg(long, value_name = "JSON")]
    template: PathBuf,

    /// Resample each segmentation onto its source series grid
    #[arg(long)]
    resample: bool,

    /// Delete each segmentation file once its DICOM-SEG files are written. USE WITH CAUTION!
    #[arg(long)]
    delete_segmentations: bool,

    /// Offer to associate a segmentation with several series
    #[arg(long)]
    multi_association: bool,

    /// Crop frames to the bounding box of the labelled voxels
    #[arg(long)]
    inplane_cropping: bool,

    /// Omit frames without voxels of their segment
    #[arg(long)]
    skip_empty_slices: bool,

    /// Drop labels missing from the template instead of failing
    #[arg(long)]
    skip_missing_segments: bool,

    /// Slice order within a series
    #[arg(long, value_enum, default_value_t = SortBy::ImagePositionPatient)]
    sort_by: SortBy,

    #[command(flatten)]
    layout: LayoutArgs,
}

#[derive(Args)]
struct StructureArgs {
    /// Folder containing one subfolder per patient
    #[arg(value_name = "PATIENTS_ROOT")]
    patients_root: PathBuf,

    /// Folder holding the segmentation files of all patients
    #[arg(long, value_name = "DIR")]
    segmentations_root: PathBuf,

    #[arg(long, value_enum)]
    images_structure: ImagesFolderStructure,

    #[arg(long, value_enum)]
    segmentations_location: SegmentationFilesLocation,

    #[command(flatten)]
    layout: LayoutArgs,
}

#[derive(Args)]
struct DestructureArgs {
    /// Folder containing one subfolder per patient
    #[arg(value_name = "PATIENTS_ROOT")]
    patients_root: PathBuf,

    #[arg(long, value_enum)]
    images_structure: ImagesFolderStructure,

    #[arg(long, value_enum)]
    segmentations_location: SegmentationFilesLocation,

    /// Remove the segmentations folders instead of flattening them. USE WITH CAUTION!
    #[arg(long)]
    delete_segmentations: bool,

    #[command(flatten)]
    layout: LayoutArgs,
}

fn main() -> Result<()> {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_timestamp_secs()
        .try_init();

    match Cli::parse().command {
        Command::Convert(args) => convert(args),
        Command::Structure(args) => {
            let structurer = FolderStructurer::new(
                &args.patients_root,
                StructureConfig {
                    images_structure: args.images_structure,
                    segmentations_location: args.segmentations_location,
                    layout: args.layout.layout(),
                },
            );
            structurer
                .structure(&args.segmentations_root)
                .with_context(|| format!("Failed to structure {}", args.patients_root.display()))
        }
        Command::Destructure(args) => {
            let structurer = FolderStructurer::new(
                &args.patients_root,
                StructureConfig {
                    images_structure: args.images_structure,
                    segmentations_location: args.segmentations_location,
                    layout: args.layout.layout(),
                },
            );
            structurer
                .destructure(args.delete_segmentations)
                .with_context(|| format!("Failed to destructure {}", args.patients_root.display()))
        }
    }
}

fn convert(args: ConvertArgs) -> Result<()> {
    let config = WriterConfig {
        resample: args.resample,
        delete_source: args.delete_segmentations,
        multi_association: args.multi_association,
        encode: EncodeOptions {
            inplane_cropping: args.inplane_cropping,
            skip_empty_slices: args.skip_empty_slices,
            skip_missing_segments: args.skip_missing_segments,
        },
        sort_by: args.sort_by,
    };

    let summary = convert_patients(
        &args.patients_root,
        &args.layout.layout(),
        &args.template,
        config,
        &mut ConsolePrompt::stdio(),
    )
    .with_context(|| format!("Failed to convert {}", args.patients_root.display()))?;

    for (patient, reason) in &summary.skipped {
        log::warn!("Skipped {}: {reason}", patient.display());
    }
    println!(
        "{} DICOM SEG files written for {} patients",
        summary.outputs.len(),
        summary.converted.len()
    );
    Ok(())
}
