#![allow(dead_code)]

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use dicom::core::{DataElement, PrimitiveValue, VR, dicom_value};
use dicom::object::{FileMetaTableBuilder, InMemDicomObject, OpenFileOptions};
use dicom_dictionary_std::{tags, uids};
use flate2::{Compression, write::GzEncoder};
use tempfile::TempDir;

pub const STUDY_UID: &str = "1.2.826.0.1.3680043.8.498.1";
pub const FRAME_OF_REFERENCE_UID: &str = "1.2.826.0.1.3680043.8.498.2";

pub const TEMPLATE: &str = r#"{
    "ContentCreatorName": "Reader1",
    "SeriesDescription": "Liver segmentation",
    "SeriesNumber": "300",
    "InstanceNumber": "1",
    "segmentAttributes": [[
        {
            "labelID": 1,
            "SegmentLabel": "Liver",
            "SegmentAlgorithmType": "MANUAL",
            "SegmentedPropertyCategoryCodeSequence": {
                "CodeValue": "123037004",
                "CodingSchemeDesignator": "SCT",
                "CodeMeaning": "Anatomical Structure"
            },
            "SegmentedPropertyTypeCodeSequence": {
                "CodeValue": "10200004",
                "CodingSchemeDesignator": "SCT",
                "CodeMeaning": "Liver"
            },
            "recommendedDisplayRGBValue": [221, 130, 101]
        },
        {
            "labelID": 2,
            "SegmentLabel": "Tumor",
            "SegmentAlgorithmType": "SEMIAUTOMATIC",
            "SegmentAlgorithmName": "GrowCut",
            "SegmentedPropertyCategoryCodeSequence": {
                "CodeValue": "49755003",
                "CodingSchemeDesignator": "SCT",
                "CodeMeaning": "Morphologically Altered Structure"
            },
            "SegmentedPropertyTypeCodeSequence": {
                "CodeValue": "108369006",
                "CodingSchemeDesignator": "SCT",
                "CodeMeaning": "Neoplasm"
            }
        }
    ]]
}"#;

/// Removed with everything in it when dropped.
pub fn scratch_dir(prefix: &str) -> TempDir {
    tempfile::Builder::new()
        .prefix(&format!("segvolume_{prefix}_"))
        .tempdir()
        .unwrap()
}

pub fn write_template(dir: &Path) -> PathBuf {
    let path = dir.join("metainfo.json");
    fs::write(&path, TEMPLATE).unwrap();
    path
}

/// Grid of a synthetic axial series.
#[derive(Clone, Debug)]
pub struct SeriesSpec {
    pub patient_id: String,
    pub series_uid: String,
    pub description: String,
    pub series_number: i32,
    pub sop_class_uid: &'static str,
    pub rows: u16,
    pub columns: u16,
    pub slices: usize,
    pub spacing: f64,
    pub origin: [f64; 3],
}

impl SeriesSpec {
    pub fn ct(patient_id: &str, series_uid: &str) -> Self {
        Self {
            patient_id: patient_id.into(),
            series_uid: series_uid.into(),
            description: "CT abdomen".into(),
            series_number: 2,
            sop_class_uid: uids::CT_IMAGE_STORAGE,
            rows: 4,
            columns: 4,
            slices: 4,
            spacing: 1.0,
            origin: [0.0, 0.0, 0.0],
        }
    }

    /// Coarser grid over the same extent as [`SeriesSpec::ct`].
    pub fn pet(patient_id: &str, series_uid: &str) -> Self {
        Self {
            description: "PET WB".into(),
            series_number: 3,
            sop_class_uid: uids::POSITRON_EMISSION_TOMOGRAPHY_IMAGE_STORAGE,
            rows: 2,
            columns: 2,
            slices: 2,
            spacing: 2.0,
            origin: [0.5, 0.5, 0.5],
            ..Self::ct(patient_id, series_uid)
        }
    }
}

fn decimals(values: &[f64]) -> PrimitiveValue {
    PrimitiveValue::Strs(values.iter().map(|value| value.to_string()).collect())
}

/// Write one file per slice into `dir`, shuffled relative to their
/// positions so that indexing has to sort them.
pub fn write_series(dir: &Path, spec: &SeriesSpec) -> Vec<PathBuf> {
    fs::create_dir_all(dir).unwrap();
    let mut paths = Vec::with_capacity(spec.slices);
    for slice in (0..spec.slices).rev() {
        let sop_instance_uid = format!("{}.{}", spec.series_uid, slice + 1);
        let z = spec.origin[2] + slice as f64 * spec.spacing;
        let object = InMemDicomObject::from_element_iter([
            DataElement::new(tags::SOP_CLASS_UID, VR::UI, spec.sop_class_uid),
            DataElement::new(
                tags::SOP_INSTANCE_UID,
                VR::UI,
                PrimitiveValue::from(sop_instance_uid.clone()),
            ),
            DataElement::new(tags::PATIENT_NAME, VR::PN, "Doe^Jane"),
            DataElement::new(tags::PATIENT_ID, VR::LO, PrimitiveValue::from(spec.patient_id.clone())),
            DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, STUDY_UID),
            DataElement::new(
                tags::SERIES_INSTANCE_UID,
                VR::UI,
                PrimitiveValue::from(spec.series_uid.clone()),
            ),
            DataElement::new(tags::FRAME_OF_REFERENCE_UID, VR::UI, FRAME_OF_REFERENCE_UID),
            DataElement::new(tags::MODALITY, VR::CS, "CT"),
            DataElement::new(
                tags::SERIES_DESCRIPTION,
                VR::LO,
                PrimitiveValue::from(spec.description.clone()),
            ),
            DataElement::new(
                tags::SERIES_NUMBER,
                VR::IS,
                PrimitiveValue::from(spec.series_number.to_string()),
            ),
            DataElement::new(
                tags::INSTANCE_NUMBER,
                VR::IS,
                PrimitiveValue::from((slice + 1).to_string()),
            ),
            DataElement::new(
                tags::IMAGE_POSITION_PATIENT,
                VR::DS,
                decimals(&[spec.origin[0], spec.origin[1], z]),
            ),
            DataElement::new(
                tags::IMAGE_ORIENTATION_PATIENT,
                VR::DS,
                decimals(&[1.0, 0.0, 0.0, 0.0, 1.0, 0.0]),
            ),
            DataElement::new(tags::PIXEL_SPACING, VR::DS, decimals(&[spec.spacing, spec.spacing])),
            DataElement::new(tags::SLICE_THICKNESS, VR::DS, decimals(&[spec.spacing])),
            DataElement::new(tags::ROWS, VR::US, dicom_value!(U16, [spec.rows])),
            DataElement::new(tags::COLUMNS, VR::US, dicom_value!(U16, [spec.columns])),
            DataElement::new(tags::SAMPLES_PER_PIXEL, VR::US, dicom_value!(U16, [1])),
            DataElement::new(tags::PHOTOMETRIC_INTERPRETATION, VR::CS, "MONOCHROME2"),
            DataElement::new(tags::BITS_ALLOCATED, VR::US, dicom_value!(U16, [16])),
            DataElement::new(tags::BITS_STORED, VR::US, dicom_value!(U16, [16])),
            DataElement::new(tags::HIGH_BIT, VR::US, dicom_value!(U16, [15])),
            DataElement::new(tags::PIXEL_REPRESENTATION, VR::US, dicom_value!(U16, [0])),
            DataElement::new(
                tags::PIXEL_DATA,
                VR::OW,
                PrimitiveValue::U16(vec![0u16; spec.rows as usize * spec.columns as usize].into()),
            ),
        ]);
        let file = object
            .with_meta(
                FileMetaTableBuilder::new()
                    .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
                    .media_storage_sop_class_uid(spec.sop_class_uid)
                    .media_storage_sop_instance_uid(sop_instance_uid),
            )
            .unwrap();
        let path = dir.join(format!("{}_{}.dcm", spec.description.replace(' ', "_"), spec.slices - slice));
        file.write_to_file(&path).unwrap();
        paths.push(path);
    }
    paths
}

/// Raw little-endian `unsigned short` NRRD in LPS with an axis-aligned grid.
/// `labels` is in x-fastest order.
pub fn write_nrrd(path: &Path, sizes: [usize; 3], spacing: f64, origin: [f64; 3], labels: &[u16]) {
    let directions = [[spacing, 0.0, 0.0], [0.0, spacing, 0.0], [0.0, 0.0, spacing]];
    write_nrrd_oriented(path, sizes, directions, origin, labels);
}

/// Same as [`write_nrrd`] with explicit LPS space directions, one per axis.
pub fn write_nrrd_oriented(
    path: &Path,
    sizes: [usize; 3],
    directions: [[f64; 3]; 3],
    origin: [f64; 3],
    labels: &[u16],
) {
    assert_eq!(labels.len(), sizes.iter().product::<usize>());
    let directions: Vec<String> = directions
        .iter()
        .map(|[x, y, z]| format!("({x},{y},{z})"))
        .collect();
    let mut contents = format!(
        "NRRD0004\n\
         type: unsigned short\n\
         dimension: 3\n\
         space: left-posterior-superior\n\
         sizes: {} {} {}\n\
         space directions: {}\n\
         kinds: domain domain domain\n\
         endian: little\n\
         encoding: raw\n\
         space origin: ({},{},{})\n\n",
        sizes[0],
        sizes[1],
        sizes[2],
        directions.join(" "),
        origin[0],
        origin[1],
        origin[2]
    )
    .into_bytes();
    for label in labels {
        contents.extend_from_slice(&label.to_le_bytes());
    }
    fs::write(path, contents).unwrap();
}

/// Where a NIfTI file keeps its voxel-to-world transform.
#[derive(Clone, Copy, Debug)]
pub enum NiftiTransform {
    Sform,
    Qform,
}

/// Single-file NIfTI-1 `uint16` volume with unit spacing at the RAS origin,
/// which is the grid of [`SeriesSpec::ct`] once brought into LPS. Paths
/// ending in `.gz` are compressed.
pub fn write_nifti(path: &Path, sizes: [usize; 3], transform: NiftiTransform, labels: &[u16]) {
    assert_eq!(labels.len(), sizes.iter().product::<usize>());
    fn put(header: &mut [u8], offset: usize, bytes: &[u8]) {
        header[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
    fn put_f32s(header: &mut [u8], offset: usize, values: &[f32]) {
        for (i, value) in values.iter().enumerate() {
            put(header, offset + 4 * i, &value.to_le_bytes());
        }
    }

    let mut header = vec![0u8; 348];
    put(&mut header, 0, &348i32.to_le_bytes());
    let dim = [3, sizes[0] as i16, sizes[1] as i16, sizes[2] as i16, 1, 1, 1, 1];
    for (i, extent) in dim.iter().enumerate() {
        put(&mut header, 40 + 2 * i, &extent.to_le_bytes());
    }
    // uint16, 16 bits per voxel
    put(&mut header, 70, &512i16.to_le_bytes());
    put(&mut header, 72, &16i16.to_le_bytes());
    put_f32s(&mut header, 76, &[1.0; 8]);
    // vox_offset, scl_slope
    put_f32s(&mut header, 108, &[352.0, 1.0]);
    match transform {
        NiftiTransform::Sform => {
            put(&mut header, 254, &1i16.to_le_bytes());
            put_f32s(&mut header, 280, &[-1.0, 0.0, 0.0, 0.0]);
            put_f32s(&mut header, 296, &[0.0, -1.0, 0.0, 0.0]);
            put_f32s(&mut header, 312, &[0.0, 0.0, 1.0, 0.0]);
        }
        NiftiTransform::Qform => {
            // a half turn around z: quatern (b, c, d) = (0, 0, 1)
            put(&mut header, 252, &1i16.to_le_bytes());
            put_f32s(&mut header, 256, &[0.0, 0.0, 1.0]);
        }
    }
    put(&mut header, 344, b"n+1\0");

    let mut contents = header;
    contents.extend_from_slice(&[0u8; 4]);
    for label in labels {
        contents.extend_from_slice(&label.to_le_bytes());
    }
    if path.extension().is_some_and(|extension| extension == "gz") {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&contents).unwrap();
        contents = encoder.finish().unwrap();
    }
    fs::write(path, contents).unwrap();
}

/// A 4x4x4 label map on the grid of [`SeriesSpec::ct`]: liver everywhere on
/// the two lower slices, a tumor voxel on the third.
pub fn ct_labels() -> Vec<u16> {
    let mut labels = vec![0u16; 64];
    labels[..32].fill(1);
    labels[32 + 5] = 2;
    labels
}

pub fn open_seg(path: &Path) -> InMemDicomObject {
    OpenFileOptions::new().open_file(path).unwrap().into_inner()
}

pub fn string(object: &InMemDicomObject, tag: dicom::core::Tag) -> String {
    object
        .element(tag)
        .unwrap()
        .to_str()
        .unwrap()
        .trim_end_matches(['\0', ' '])
        .to_string()
}

pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

fn frame_item(seg: &InMemDicomObject, frame: usize) -> &InMemDicomObject {
    &seg.element(tags::PER_FRAME_FUNCTIONAL_GROUPS_SEQUENCE)
        .unwrap()
        .items()
        .unwrap()[frame]
}

/// ImagePositionPatient of every frame.
pub fn frame_positions(seg: &InMemDicomObject) -> Vec<Vec<f64>> {
    let frames = seg
        .element(tags::PER_FRAME_FUNCTIONAL_GROUPS_SEQUENCE)
        .unwrap()
        .items()
        .unwrap();
    frames
        .iter()
        .map(|frame| {
            frame.element(tags::PLANE_POSITION_SEQUENCE).unwrap().items().unwrap()[0]
                .element(tags::IMAGE_POSITION_PATIENT)
                .unwrap()
                .to_multi_float64()
                .unwrap()
        })
        .collect()
}

/// SOP Instance UID of the source image a frame was derived from.
pub fn frame_source_instance(seg: &InMemDicomObject, frame: usize) -> String {
    let derivation = &frame_item(seg, frame)
        .element(tags::DERIVATION_IMAGE_SEQUENCE)
        .unwrap()
        .items()
        .unwrap()[0];
    let source_image = &derivation
        .element(tags::SOURCE_IMAGE_SEQUENCE)
        .unwrap()
        .items()
        .unwrap()[0];
    string(source_image, tags::REFERENCED_SOP_INSTANCE_UID)
}

pub fn pixel_bytes(seg: &InMemDicomObject) -> Vec<u8> {
    seg.element(tags::PIXEL_DATA).unwrap().to_bytes().unwrap().into_owned()
}
