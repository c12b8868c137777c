//! Encoding of a multi-class label volume into binary segmentation frames.

use std::collections::BTreeSet;

use dicom::core::{DataElement, PrimitiveValue, Tag, VR, dicom_value};
use dicom::object::InMemDicomObject;
use dicom::object::mem::InMemElement;
use dicom_dictionary_std::{tags, uids};
use nalgebra::Vector3;
use ndarray::s;

use super::EncodeError;
use super::template::{Code, Template, sequence};
use crate::series::ImageSeries;
use crate::uid::generate_uid;
use crate::volume::Volume;
use crate::volume_loader::SliceHeader;

/// Tags taken over from the source series so the segmentation lands in the
/// same patient, study and frame of reference.
const COPIED_FROM_SOURCE: &[Tag] = &[
    tags::SPECIFIC_CHARACTER_SET,
    tags::PATIENT_NAME,
    tags::PATIENT_ID,
    tags::PATIENT_BIRTH_DATE,
    tags::PATIENT_SEX,
    tags::PATIENT_AGE,
    tags::STUDY_INSTANCE_UID,
    tags::STUDY_DATE,
    tags::STUDY_TIME,
    tags::STUDY_ID,
    tags::STUDY_DESCRIPTION,
    tags::ACCESSION_NUMBER,
    tags::REFERRING_PHYSICIAN_NAME,
    tags::FRAME_OF_REFERENCE_UID,
    tags::POSITION_REFERENCE_INDICATOR,
    tags::INSTITUTION_NAME,
];

/// Type 2 attributes written empty when the source does not have them.
const REQUIRED_EMPTY: &[(Tag, VR)] = &[
    (tags::PATIENT_NAME, VR::PN),
    (tags::PATIENT_ID, VR::LO),
    (tags::PATIENT_BIRTH_DATE, VR::DA),
    (tags::PATIENT_SEX, VR::CS),
    (tags::STUDY_DATE, VR::DA),
    (tags::STUDY_TIME, VR::TM),
    (tags::STUDY_ID, VR::SH),
    (tags::ACCESSION_NUMBER, VR::SH),
    (tags::REFERRING_PHYSICIAN_NAME, VR::PN),
    (tags::POSITION_REFERENCE_INDICATOR, VR::LO),
];

/// Independently toggleable encoding behaviours.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EncodeOptions {
    /// Reduce Rows/Columns to the in-plane bounding box of the labelled voxels.
    pub inplane_cropping: bool,
    /// Omit frames holding no voxel of their segment.
    pub skip_empty_slices: bool,
    /// Drop labels the template does not declare instead of failing.
    pub skip_missing_segments: bool,
}

/// In-plane window `[x0, x1] x [y0, y1]`, inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Window {
    x0: usize,
    x1: usize,
    y0: usize,
    y1: usize,
}

impl Window {
    fn columns(&self) -> usize {
        self.x1 - self.x0 + 1
    }

    fn rows(&self) -> usize {
        self.y1 - self.y0 + 1
    }
}

/// Largest distance, in millimetres along the slice normal, between a
/// segmentation slice and the source image it is drawn on.
const SLICE_POSITION_TOLERANCE: f64 = 1e-2;

/// Frame of segment `label` on segmentation slice `slice`, drawn on
/// `source.slices[source_slice]`.
#[derive(Clone, Copy, Debug)]
struct Frame {
    label: u16,
    slice: usize,
    source_slice: usize,
}

/// Positions of the source images along their common slice normal.
struct SourcePositions {
    normal: Vector3<f64>,
    offsets: Vec<f64>,
}

impl SourcePositions {
    fn new(source: &ImageSeries) -> Result<Self, EncodeError> {
        let normal = source
            .slices
            .iter()
            .find_map(SliceHeader::normal)
            .ok_or(EncodeError::MissingSourceAttribute("ImageOrientationPatient"))?;
        let offsets = source
            .slices
            .iter()
            .map(|slice| {
                slice
                    .image_position
                    .map(|position| position.dot(&normal))
                    .ok_or(EncodeError::MissingSourceAttribute("ImagePositionPatient"))
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { normal, offsets })
    }

    /// Index of the source image at the position of segmentation slice `slice`.
    fn matching(&self, segmentation: &Volume<u16>, slice: usize) -> Result<usize, EncodeError> {
        let offset = segmentation
            .geometry()
            .index_to_physical(Vector3::new(0.0, 0.0, slice as f64))
            .dot(&self.normal);
        self.offsets
            .iter()
            .position(|source| (source - offset).abs() <= SLICE_POSITION_TOLERANCE)
            .ok_or(EncodeError::UnmatchedSlice { slice, offset })
    }
}

/// Builds a BINARY segmentation dataset, one frame per (segment, slice).
pub struct MultiClassWriter<'a> {
    template: &'a Template,
    options: EncodeOptions,
}

impl<'a> MultiClassWriter<'a> {
    pub fn new(template: &'a Template, options: EncodeOptions) -> Self {
        Self { template, options }
    }

    /// Encode `segmentation` against the images of `source`.
    ///
    /// Frame positions and orientation are taken from the segmentation's own
    /// geometry. Each frame references the source image lying at the same
    /// position along the slice normal, whatever the stacking direction of
    /// either grid.
    pub fn write(
        &self,
        segmentation: &Volume<u16>,
        source: &ImageSeries,
    ) -> Result<InMemDicomObject, EncodeError> {
        let (depth, height, width) = segmentation.dim();
        let source_dim = source_dim(source);
        if source_dim != (depth, height, width) {
            return Err(EncodeError::GridMismatch {
                segmentation: (depth, height, width),
                series: source_dim,
            });
        }

        let labels = self.written_labels(segmentation)?;
        let window = self.window(segmentation, &labels)?;
        let positions = SourcePositions::new(source)?;
        let mut source_slices = vec![None; depth];

        let data = segmentation.data();
        let mut frames = Vec::new();
        let mut bits = BitPacker::with_capacity(
            labels.len() * depth * window.rows() * window.columns(),
        );
        for &label in &labels {
            for slice in 0..depth {
                let plane = data.slice(s![slice, window.y0..=window.y1, window.x0..=window.x1]);
                if self.options.skip_empty_slices && !plane.iter().any(|&v| v == label) {
                    continue;
                }
                let source_slice = match source_slices[slice] {
                    Some(index) => index,
                    None => {
                        let index = positions.matching(segmentation, slice)?;
                        source_slices[slice] = Some(index);
                        index
                    }
                };
                frames.push(Frame {
                    label,
                    slice,
                    source_slice,
                });
                bits.extend(plane.iter().map(|&v| v == label));
            }
        }
        if frames.is_empty() {
            return Err(EncodeError::EmptySegmentation);
        }
        log::debug!(
            "Encoding {} frames of {}x{} for segments {:?}",
            frames.len(),
            window.rows(),
            window.columns(),
            labels
        );

        let mut dataset = self.base_dataset(source)?;
        dataset.put(DataElement::new(tags::ROWS, VR::US, dicom_value!(U16, [window.rows() as u16])));
        dataset.put(DataElement::new(
            tags::COLUMNS,
            VR::US,
            dicom_value!(U16, [window.columns() as u16]),
        ));
        dataset.put(DataElement::new(
            tags::NUMBER_OF_FRAMES,
            VR::IS,
            PrimitiveValue::from(frames.len().to_string()),
        ));

        let segments = labels
            .iter()
            .filter_map(|&label| self.template.segment(label))
            .map(|segment| segment.to_item())
            .collect::<Result<Vec<_>, _>>()?;
        dataset.put(sequence(tags::SEGMENT_SEQUENCE, segments));

        dataset.put(shared_functional_groups(segmentation, source));
        dataset.put(per_frame_functional_groups(
            &frames,
            segmentation,
            source,
            window,
        ));
        dataset.put(DataElement::new(
            tags::PIXEL_DATA,
            VR::OB,
            PrimitiveValue::U8(bits.finish().into()),
        ));
        Ok(dataset)
    }

    /// Labels to encode, ascending. Undeclared labels fail or are dropped.
    fn written_labels(&self, segmentation: &Volume<u16>) -> Result<Vec<u16>, EncodeError> {
        let mut labels = Vec::new();
        for label in segmentation.labels().into_iter().filter(|&label| label != 0) {
            if self.template.segment(label).is_some() {
                labels.push(label);
            } else if self.options.skip_missing_segments {
                log::warn!("Label {label} is not declared in the metadata template, skipping it");
            } else {
                return Err(EncodeError::UndeclaredSegment(label));
            }
        }
        if labels.is_empty() {
            return Err(EncodeError::EmptySegmentation);
        }
        Ok(labels)
    }

    fn window(&self, segmentation: &Volume<u16>, labels: &[u16]) -> Result<Window, EncodeError> {
        let (_, height, width) = segmentation.dim();
        if !self.options.inplane_cropping {
            return Ok(Window {
                x0: 0,
                x1: width - 1,
                y0: 0,
                y1: height - 1,
            });
        }

        let labels: BTreeSet<u16> = labels.iter().copied().collect();
        let mut window: Option<Window> = None;
        for ((_, y, x), value) in segmentation.data().indexed_iter() {
            if !labels.contains(value) {
                continue;
            }
            window = Some(match window {
                None => Window {
                    x0: x,
                    x1: x,
                    y0: y,
                    y1: y,
                },
                Some(w) => Window {
                    x0: w.x0.min(x),
                    x1: w.x1.max(x),
                    y0: w.y0.min(y),
                    y1: w.y1.max(y),
                },
            });
        }
        window.ok_or(EncodeError::EmptySegmentation)
    }

    fn base_dataset(&self, source: &ImageSeries) -> Result<InMemDicomObject, EncodeError> {
        let template = self.template;
        let now = chrono::Local::now();
        let date = now.format("%Y%m%d").to_string();
        let time = now.format("%H%M%S").to_string();

        let mut dataset = InMemDicomObject::from_element_iter([
            DataElement::new(tags::SOP_CLASS_UID, VR::UI, uids::SEGMENTATION_STORAGE),
            DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from(generate_uid())),
            DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, PrimitiveValue::from(generate_uid())),
            DataElement::new(tags::MODALITY, VR::CS, "SEG"),
            DataElement::new(
                tags::SERIES_NUMBER,
                VR::IS,
                PrimitiveValue::from(template.series_number.clone()),
            ),
            DataElement::new(
                tags::SERIES_DESCRIPTION,
                VR::LO,
                PrimitiveValue::from(template.series_description.clone()),
            ),
            DataElement::new(
                tags::INSTANCE_NUMBER,
                VR::IS,
                PrimitiveValue::from(template.instance_number.clone()),
            ),
            DataElement::new(tags::SERIES_DATE, VR::DA, PrimitiveValue::from(date.clone())),
            DataElement::new(tags::SERIES_TIME, VR::TM, PrimitiveValue::from(time.clone())),
            DataElement::new(tags::CONTENT_DATE, VR::DA, PrimitiveValue::from(date)),
            DataElement::new(tags::CONTENT_TIME, VR::TM, PrimitiveValue::from(time)),
            DataElement::new(
                tags::CONTENT_LABEL,
                VR::CS,
                PrimitiveValue::from(template.content_label.clone()),
            ),
            DataElement::new(
                tags::CONTENT_DESCRIPTION,
                VR::LO,
                PrimitiveValue::from(template.content_description.clone()),
            ),
            DataElement::new(
                tags::CONTENT_CREATOR_NAME,
                VR::PN,
                PrimitiveValue::from(template.content_creator_name.clone()),
            ),
            DataElement::new(tags::MANUFACTURER, VR::LO, env!("CARGO_PKG_NAME")),
            DataElement::new(tags::MANUFACTURER_MODEL_NAME, VR::LO, env!("CARGO_PKG_NAME")),
            DataElement::new(tags::DEVICE_SERIAL_NUMBER, VR::LO, "1"),
            DataElement::new(tags::SOFTWARE_VERSIONS, VR::LO, env!("CARGO_PKG_VERSION")),
            DataElement::new(tags::IMAGE_TYPE, VR::CS, dicom_value!(Strs, ["DERIVED", "PRIMARY"])),
            DataElement::new(tags::SAMPLES_PER_PIXEL, VR::US, dicom_value!(U16, [1])),
            DataElement::new(tags::PHOTOMETRIC_INTERPRETATION, VR::CS, "MONOCHROME2"),
            DataElement::new(tags::BITS_ALLOCATED, VR::US, dicom_value!(U16, [1])),
            DataElement::new(tags::BITS_STORED, VR::US, dicom_value!(U16, [1])),
            DataElement::new(tags::HIGH_BIT, VR::US, dicom_value!(U16, [0])),
            DataElement::new(tags::PIXEL_REPRESENTATION, VR::US, dicom_value!(U16, [0])),
            DataElement::new(tags::LOSSY_IMAGE_COMPRESSION, VR::CS, "00"),
            DataElement::new(tags::SEGMENTATION_TYPE, VR::CS, "BINARY"),
        ]);

        let optional = [
            (tags::BODY_PART_EXAMINED, VR::CS, &template.body_part_examined),
            (tags::CLINICAL_TRIAL_SERIES_ID, VR::LO, &template.clinical_trial_series_id),
            (
                tags::CLINICAL_TRIAL_TIME_POINT_ID,
                VR::LO,
                &template.clinical_trial_time_point_id,
            ),
            (
                tags::CLINICAL_TRIAL_COORDINATING_CENTER_NAME,
                VR::LO,
                &template.clinical_trial_coordinating_center_name,
            ),
        ];
        for (tag, vr, value) in optional {
            if let Some(value) = value {
                dataset.put(DataElement::new(tag, vr, PrimitiveValue::from(value.clone())));
            }
        }

        let header = &source.first_header;
        for &tag in COPIED_FROM_SOURCE {
            if let Ok(Some(element)) = header.element_opt(tag) {
                dataset.put(element.clone());
            }
        }
        for &(tag, vr) in REQUIRED_EMPTY {
            if dataset.element_opt(tag).ok().flatten().is_none() {
                dataset.put(DataElement::new(tag, vr, PrimitiveValue::Empty));
            }
        }
        if dataset.element_opt(tags::FRAME_OF_REFERENCE_UID).ok().flatten().is_none() {
            return Err(EncodeError::MissingSourceAttribute("FrameOfReferenceUID"));
        }
        if dataset.element_opt(tags::STUDY_INSTANCE_UID).ok().flatten().is_none() {
            return Err(EncodeError::MissingSourceAttribute("StudyInstanceUID"));
        }

        dataset.put(referenced_series(source));
        for element in dimension_organization() {
            dataset.put(element);
        }
        Ok(dataset)
    }
}

fn source_dim(source: &ImageSeries) -> (usize, usize, usize) {
    let first = source.slices.first();
    (
        source.slices.len(),
        first.and_then(|slice| slice.rows).unwrap_or_default() as usize,
        first.and_then(|slice| slice.columns).unwrap_or_default() as usize,
    )
}

fn referenced_series(source: &ImageSeries) -> InMemElement {
    let instances = source
        .slices
        .iter()
        .map(|slice| {
            InMemDicomObject::from_element_iter([
                DataElement::new(
                    tags::REFERENCED_SOP_CLASS_UID,
                    VR::UI,
                    slice.sop_class_uid.as_str(),
                ),
                DataElement::new(
                    tags::REFERENCED_SOP_INSTANCE_UID,
                    VR::UI,
                    slice.sop_instance_uid.as_str(),
                ),
            ])
        })
        .collect();
    let item = InMemDicomObject::from_element_iter([
        DataElement::new(
            tags::SERIES_INSTANCE_UID,
            VR::UI,
            source.series_instance_uid.as_str(),
        ),
        sequence(tags::REFERENCED_INSTANCE_SEQUENCE, instances),
    ]);
    sequence(tags::REFERENCED_SERIES_SEQUENCE, vec![item])
}

/// Segment first, then position along the stack.
fn dimension_organization() -> [InMemElement; 2] {
    let organization_uid = generate_uid();
    let index = |pointer: Tag, group: Tag, label: &str| {
        InMemDicomObject::from_element_iter([
            DataElement::new(
                tags::DIMENSION_ORGANIZATION_UID,
                VR::UI,
                PrimitiveValue::from(organization_uid.clone()),
            ),
            DataElement::new(tags::DIMENSION_INDEX_POINTER, VR::AT, dicom_value!(Tags, [pointer])),
            DataElement::new(tags::FUNCTIONAL_GROUP_POINTER, VR::AT, dicom_value!(Tags, [group])),
            DataElement::new(
                tags::DIMENSION_DESCRIPTION_LABEL,
                VR::LO,
                PrimitiveValue::from(label.to_string()),
            ),
        ])
    };
    let indices = vec![
        index(
            tags::REFERENCED_SEGMENT_NUMBER,
            tags::SEGMENT_IDENTIFICATION_SEQUENCE,
            "ReferencedSegmentNumber",
        ),
        index(
            tags::IMAGE_POSITION_PATIENT,
            tags::PLANE_POSITION_SEQUENCE,
            "ImagePositionPatient",
        ),
    ];
    let organization = InMemDicomObject::from_element_iter([DataElement::new(
        tags::DIMENSION_ORGANIZATION_UID,
        VR::UI,
        PrimitiveValue::from(organization_uid.clone()),
    )]);
    [
        sequence(tags::DIMENSION_ORGANIZATION_SEQUENCE, vec![organization]),
        sequence(tags::DIMENSION_INDEX_SEQUENCE, indices),
    ]
}

fn shared_functional_groups(segmentation: &Volume<u16>, source: &ImageSeries) -> InMemElement {
    let geometry = segmentation.geometry();
    let thickness = source
        .slices
        .first()
        .and_then(|slice| slice.slice_thickness)
        .unwrap_or(geometry.spacing.z);

    let measures = InMemDicomObject::from_element_iter([
        DataElement::new(
            tags::PIXEL_SPACING,
            VR::DS,
            decimal_strings(&[geometry.spacing.y, geometry.spacing.x]),
        ),
        DataElement::new(tags::SLICE_THICKNESS, VR::DS, decimal_strings(&[thickness])),
        DataElement::new(
            tags::SPACING_BETWEEN_SLICES,
            VR::DS,
            decimal_strings(&[geometry.spacing.z]),
        ),
    ]);
    let row = geometry.direction.column(0);
    let column = geometry.direction.column(1);
    let orientation = InMemDicomObject::from_element_iter([DataElement::new(
        tags::IMAGE_ORIENTATION_PATIENT,
        VR::DS,
        decimal_strings(&[row.x, row.y, row.z, column.x, column.y, column.z]),
    )]);

    let group = InMemDicomObject::from_element_iter([
        sequence(tags::PIXEL_MEASURES_SEQUENCE, vec![measures]),
        sequence(tags::PLANE_ORIENTATION_SEQUENCE, vec![orientation]),
    ]);
    sequence(tags::SHARED_FUNCTIONAL_GROUPS_SEQUENCE, vec![group])
}

fn per_frame_functional_groups(
    frames: &[Frame],
    segmentation: &Volume<u16>,
    source: &ImageSeries,
    window: Window,
) -> InMemElement {
    let geometry = segmentation.geometry();
    let source_purpose = Code::new(
        "121322",
        "DCM",
        "Source image for image processing operation",
    );
    let derivation = Code::new("113076", "DCM", "Segmentation");

    let items = frames
        .iter()
        .map(|frame| {
            let slice = &source.slices[frame.source_slice];
            let source_image = InMemDicomObject::from_element_iter([
                DataElement::new(
                    tags::REFERENCED_SOP_CLASS_UID,
                    VR::UI,
                    slice.sop_class_uid.as_str(),
                ),
                DataElement::new(
                    tags::REFERENCED_SOP_INSTANCE_UID,
                    VR::UI,
                    slice.sop_instance_uid.as_str(),
                ),
                source_purpose.to_sequence(tags::PURPOSE_OF_REFERENCE_CODE_SEQUENCE),
            ]);
            let derivation_image = InMemDicomObject::from_element_iter([
                sequence(tags::SOURCE_IMAGE_SEQUENCE, vec![source_image]),
                derivation.to_sequence(tags::DERIVATION_CODE_SEQUENCE),
            ]);

            let frame_content = InMemDicomObject::from_element_iter([DataElement::new(
                tags::DIMENSION_INDEX_VALUES,
                VR::UL,
                dicom_value!(U32, [frame.label as u32, frame.slice as u32 + 1]),
            )]);

            let position = geometry.index_to_physical(Vector3::new(
                window.x0 as f64,
                window.y0 as f64,
                frame.slice as f64,
            ));
            let plane_position = InMemDicomObject::from_element_iter([DataElement::new(
                tags::IMAGE_POSITION_PATIENT,
                VR::DS,
                decimal_strings(&[position.x, position.y, position.z]),
            )]);

            let identification = InMemDicomObject::from_element_iter([DataElement::new(
                tags::REFERENCED_SEGMENT_NUMBER,
                VR::US,
                dicom_value!(U16, [frame.label]),
            )]);

            InMemDicomObject::from_element_iter([
                sequence(tags::DERIVATION_IMAGE_SEQUENCE, vec![derivation_image]),
                sequence(tags::FRAME_CONTENT_SEQUENCE, vec![frame_content]),
                sequence(tags::PLANE_POSITION_SEQUENCE, vec![plane_position]),
                sequence(tags::SEGMENT_IDENTIFICATION_SEQUENCE, vec![identification]),
            ])
        })
        .collect();
    sequence(tags::PER_FRAME_FUNCTIONAL_GROUPS_SEQUENCE, items)
}

fn decimal_strings(values: &[f64]) -> PrimitiveValue {
    PrimitiveValue::Strs(values.iter().map(|&v| format_decimal(v)).collect())
}

/// Shortest representation of `value` fitting the 16 characters of a DS.
pub(crate) fn format_decimal(value: f64) -> String {
    let value = if value == 0.0 { 0.0 } else { value };
    let plain = value.to_string();
    if plain.len() <= 16 {
        return plain;
    }
    for precision in (1..=15).rev() {
        let fixed = format!("{value:.precision$}");
        let fixed = fixed.trim_end_matches('0').trim_end_matches('.');
        if fixed.len() <= 16 && fixed != "0" && fixed != "-0" {
            return fixed.to_string();
        }
    }
    format!("{value:.6e}")
}

/// Packs booleans into bytes, least significant bit first, across frame
/// boundaries.
pub(crate) struct BitPacker {
    bytes: Vec<u8>,
    len: usize,
}

impl BitPacker {
    pub(crate) fn with_capacity(bits: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(bits.div_ceil(8) + 1),
            len: 0,
        }
    }

    pub(crate) fn push(&mut self, bit: bool) {
        if self.len % 8 == 0 {
            self.bytes.push(0);
        }
        if bit {
            if let Some(byte) = self.bytes.last_mut() {
                *byte |= 1 << (self.len % 8);
            }
        }
        self.len += 1;
    }

    /// Packed bytes, padded to an even length.
    pub(crate) fn finish(mut self) -> Vec<u8> {
        if self.bytes.len() % 2 == 1 {
            self.bytes.push(0);
        }
        self.bytes
    }
}

impl Extend<bool> for BitPacker {
    fn extend<I: IntoIterator<Item = bool>>(&mut self, bits: I) {
        for bit in bits {
            self.push(bit);
        }
    }
}
