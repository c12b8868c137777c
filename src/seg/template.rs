//! dcmqi meta-information JSON describing the series and its segments.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use dicom::core::value::DataSetSequence;
use dicom::core::{DataElement, PrimitiveValue, Tag, VR, dicom_value};
use dicom::object::InMemDicomObject;
use dicom::object::mem::InMemElement;
use dicom_dictionary_std::tags;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Cannot read metadata template {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed metadata template: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Expected a single segmentAttributes group, found {0}")]
    SegmentGroups(usize),

    #[error("Metadata template declares no segment")]
    NoSegments,

    #[error("labelID 0 is reserved for the background")]
    BackgroundLabel,

    #[error("labelID {0} is declared more than once")]
    DuplicateLabel(u16),

    #[error("Unknown SegmentAlgorithmType {0:?}, expected AUTOMATIC, SEMIAUTOMATIC or MANUAL")]
    UnknownAlgorithmType(String),

    #[error("Segment {0} is {1} but has no SegmentAlgorithmName")]
    MissingAlgorithmName(u16, AlgorithmType),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlgorithmType {
    Automatic,
    SemiAutomatic,
    Manual,
}

impl FromStr for AlgorithmType {
    type Err = TemplateError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "AUTOMATIC" => Ok(Self::Automatic),
            "SEMIAUTOMATIC" => Ok(Self::SemiAutomatic),
            "MANUAL" => Ok(Self::Manual),
            other => Err(TemplateError::UnknownAlgorithmType(other.to_string())),
        }
    }
}

impl fmt::Display for AlgorithmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Automatic => "AUTOMATIC",
            Self::SemiAutomatic => "SEMIAUTOMATIC",
            Self::Manual => "MANUAL",
        })
    }
}

/// A coded concept (`CodeValue`, `CodingSchemeDesignator`, `CodeMeaning`).
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct Code {
    #[serde(rename = "CodeValue")]
    pub value: String,
    #[serde(rename = "CodingSchemeDesignator")]
    pub scheme: String,
    #[serde(rename = "CodeMeaning")]
    pub meaning: String,
}

impl Code {
    pub fn new(value: &str, scheme: &str, meaning: &str) -> Self {
        Self {
            value: value.to_string(),
            scheme: scheme.to_string(),
            meaning: meaning.to_string(),
        }
    }

    pub fn to_item(&self) -> InMemDicomObject {
        InMemDicomObject::from_element_iter([
            DataElement::new(tags::CODE_VALUE, VR::SH, self.value.as_str()),
            DataElement::new(tags::CODING_SCHEME_DESIGNATOR, VR::SH, self.scheme.as_str()),
            DataElement::new(tags::CODE_MEANING, VR::LO, self.meaning.as_str()),
        ])
    }

    /// Sequence element holding this code as its only item.
    pub fn to_sequence(&self, tag: Tag) -> InMemElement {
        sequence(tag, vec![self.to_item()])
    }
}

pub(crate) fn sequence(tag: Tag, items: Vec<InMemDicomObject>) -> InMemElement {
    DataElement::new(tag, VR::SQ, DataSetSequence::from(items))
}

/// One entry of `segmentAttributes`.
#[derive(Clone, Debug, Deserialize)]
pub struct SegmentAttributes {
    #[serde(rename = "labelID")]
    pub label_id: u16,
    #[serde(rename = "SegmentLabel")]
    pub label: String,
    #[serde(rename = "SegmentDescription", default)]
    pub description: Option<String>,
    #[serde(rename = "SegmentAlgorithmType")]
    algorithm_type: String,
    #[serde(rename = "SegmentAlgorithmName", default)]
    pub algorithm_name: Option<String>,
    #[serde(rename = "SegmentedPropertyCategoryCodeSequence")]
    pub category: Code,
    #[serde(rename = "SegmentedPropertyTypeCodeSequence")]
    pub property_type: Code,
    #[serde(rename = "SegmentedPropertyTypeModifierCodeSequence", default)]
    pub property_type_modifier: Option<Code>,
    #[serde(rename = "AnatomicRegionSequence", default)]
    pub anatomic_region: Option<Code>,
    #[serde(rename = "AnatomicRegionModifierSequence", default)]
    pub anatomic_region_modifier: Option<Code>,
    #[serde(rename = "recommendedDisplayRGBValue", default)]
    pub recommended_display_rgb: Option<[u8; 3]>,
    #[serde(rename = "TrackingIdentifier", default)]
    pub tracking_identifier: Option<String>,
    #[serde(rename = "TrackingUniqueIdentifier", default)]
    pub tracking_unique_identifier: Option<String>,
}

impl SegmentAttributes {
    pub fn algorithm_type(&self) -> Result<AlgorithmType, TemplateError> {
        self.algorithm_type.parse()
    }

    /// Item of the SegmentSequence.
    pub fn to_item(&self) -> Result<InMemDicomObject, TemplateError> {
        let algorithm_type = self.algorithm_type()?;
        let mut item = InMemDicomObject::from_element_iter([
            DataElement::new(tags::SEGMENT_NUMBER, VR::US, dicom_value!(U16, [self.label_id])),
            DataElement::new(tags::SEGMENT_LABEL, VR::LO, self.label.as_str()),
            DataElement::new(
                tags::SEGMENT_ALGORITHM_TYPE,
                VR::CS,
                PrimitiveValue::from(algorithm_type.to_string()),
            ),
            self.category
                .to_sequence(tags::SEGMENTED_PROPERTY_CATEGORY_CODE_SEQUENCE),
        ]);

        let mut property_type = self.property_type.to_item();
        if let Some(modifier) = &self.property_type_modifier {
            property_type.put(modifier.to_sequence(tags::SEGMENTED_PROPERTY_TYPE_MODIFIER_CODE_SEQUENCE));
        }
        item.put(sequence(
            tags::SEGMENTED_PROPERTY_TYPE_CODE_SEQUENCE,
            vec![property_type],
        ));

        if let Some(region) = &self.anatomic_region {
            let mut region = region.to_item();
            if let Some(modifier) = &self.anatomic_region_modifier {
                region.put(modifier.to_sequence(tags::ANATOMIC_REGION_MODIFIER_SEQUENCE));
            }
            item.put(sequence(tags::ANATOMIC_REGION_SEQUENCE, vec![region]));
        }
        if let Some(description) = &self.description {
            item.put(DataElement::new(
                tags::SEGMENT_DESCRIPTION,
                VR::ST,
                description.as_str(),
            ));
        }
        if let Some(name) = &self.algorithm_name {
            item.put(DataElement::new(
                tags::SEGMENT_ALGORITHM_NAME,
                VR::LO,
                name.as_str(),
            ));
        }
        if let Some(rgb) = self.recommended_display_rgb {
            item.put(DataElement::new(
                tags::RECOMMENDED_DISPLAY_CIE_LAB_VALUE,
                VR::US,
                PrimitiveValue::U16(rgb_to_dicom_lab(rgb).to_vec().into()),
            ));
        }
        if let Some(id) = &self.tracking_identifier {
            item.put(DataElement::new(tags::TRACKING_ID, VR::UT, id.as_str()));
        }
        if let Some(uid) = &self.tracking_unique_identifier {
            item.put(DataElement::new(tags::TRACKING_UID, VR::UI, uid.as_str()));
        }
        Ok(item)
    }
}

/// Integers are sometimes written as JSON strings in dcmqi files.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum Number {
    Int(i64),
    Text(String),
}

impl Number {
    fn to_is(&self) -> String {
        match self {
            Self::Int(value) => value.to_string(),
            Self::Text(text) => text.trim().to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawTemplate {
    #[serde(rename = "ContentCreatorName", default)]
    content_creator_name: Option<String>,
    #[serde(rename = "ClinicalTrialSeriesID", default)]
    clinical_trial_series_id: Option<String>,
    #[serde(rename = "ClinicalTrialTimePointID", default)]
    clinical_trial_time_point_id: Option<String>,
    #[serde(rename = "ClinicalTrialCoordinatingCenterName", default)]
    clinical_trial_coordinating_center_name: Option<String>,
    #[serde(rename = "SeriesDescription", default)]
    series_description: Option<String>,
    #[serde(rename = "SeriesNumber", default)]
    series_number: Option<Number>,
    #[serde(rename = "InstanceNumber", default)]
    instance_number: Option<Number>,
    #[serde(rename = "BodyPartExamined", default)]
    body_part_examined: Option<String>,
    #[serde(rename = "ContentLabel", default)]
    content_label: Option<String>,
    #[serde(rename = "ContentDescription", default)]
    content_description: Option<String>,
    #[serde(rename = "segmentAttributes")]
    segment_attributes: Vec<Vec<SegmentAttributes>>,
}

/// Validated series-level metadata and segment descriptions.
#[derive(Clone, Debug)]
pub struct Template {
    pub content_creator_name: String,
    pub clinical_trial_series_id: Option<String>,
    pub clinical_trial_time_point_id: Option<String>,
    pub clinical_trial_coordinating_center_name: Option<String>,
    pub series_description: String,
    pub series_number: String,
    pub instance_number: String,
    pub body_part_examined: Option<String>,
    pub content_label: String,
    pub content_description: String,
    segments: Vec<SegmentAttributes>,
}

impl Template {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TemplateError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| TemplateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let template = text.parse()?;
        log::info!("Loaded metadata template {}", path.display());
        Ok(template)
    }

    /// Segments ordered by label.
    pub fn segments(&self) -> &[SegmentAttributes] {
        &self.segments
    }

    pub fn segment(&self, label: u16) -> Option<&SegmentAttributes> {
        self.segments
            .binary_search_by_key(&label, |segment| segment.label_id)
            .ok()
            .map(|index| &self.segments[index])
    }

    fn validate(raw: RawTemplate) -> Result<Self, TemplateError> {
        let group_count = raw.segment_attributes.len();
        let Some(mut segments) = raw.segment_attributes.into_iter().next() else {
            return Err(TemplateError::NoSegments);
        };
        if group_count > 1 {
            return Err(TemplateError::SegmentGroups(group_count));
        }
        if segments.is_empty() {
            return Err(TemplateError::NoSegments);
        }

        let mut seen = BTreeSet::new();
        for segment in &segments {
            if segment.label_id == 0 {
                return Err(TemplateError::BackgroundLabel);
            }
            if !seen.insert(segment.label_id) {
                return Err(TemplateError::DuplicateLabel(segment.label_id));
            }
            let algorithm_type = segment.algorithm_type()?;
            let named = segment
                .algorithm_name
                .as_deref()
                .is_some_and(|name| !name.trim().is_empty());
            if algorithm_type != AlgorithmType::Manual && !named {
                return Err(TemplateError::MissingAlgorithmName(
                    segment.label_id,
                    algorithm_type,
                ));
            }
        }
        segments.sort_by_key(|segment| segment.label_id);

        Ok(Self {
            content_creator_name: raw.content_creator_name.unwrap_or_default(),
            clinical_trial_series_id: raw.clinical_trial_series_id,
            clinical_trial_time_point_id: raw.clinical_trial_time_point_id,
            clinical_trial_coordinating_center_name: raw.clinical_trial_coordinating_center_name,
            series_description: raw
                .series_description
                .unwrap_or_else(|| "Segmentation".to_string()),
            series_number: raw
                .series_number
                .map(|number| number.to_is())
                .unwrap_or_else(|| "300".to_string()),
            instance_number: raw
                .instance_number
                .map(|number| number.to_is())
                .unwrap_or_else(|| "1".to_string()),
            body_part_examined: raw.body_part_examined,
            content_label: raw
                .content_label
                .unwrap_or_else(|| "SEGMENTATION".to_string()),
            content_description: raw.content_description.unwrap_or_default(),
            segments,
        })
    }
}

impl FromStr for Template {
    type Err = TemplateError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        Self::validate(serde_json::from_str(text)?)
    }
}

/// sRGB colour to CIELab (D65), scaled to the unsigned 16-bit range DICOM
/// uses for RecommendedDisplayCIELabValue.
pub fn rgb_to_dicom_lab(rgb: [u8; 3]) -> [u16; 3] {
    const WHITE: [f64; 3] = [0.950_47, 1.0, 1.088_83];

    let linear = rgb.map(|channel| {
        let c = channel as f64 / 255.0;
        if c <= 0.040_45 {
            c / 12.92
        } else {
            ((c + 0.055) / 1.055).powf(2.4)
        }
    });
    let xyz = [
        0.412_456_4 * linear[0] + 0.357_576_1 * linear[1] + 0.180_437_5 * linear[2],
        0.212_672_9 * linear[0] + 0.715_152_2 * linear[1] + 0.072_175_0 * linear[2],
        0.019_333_9 * linear[0] + 0.119_192_0 * linear[1] + 0.950_304_1 * linear[2],
    ];

    let f = |t: f64| {
        const DELTA: f64 = 6.0 / 29.0;
        if t > DELTA.powi(3) {
            t.cbrt()
        } else {
            t / (3.0 * DELTA * DELTA) + 4.0 / 29.0
        }
    };
    let [fx, fy, fz] = [
        f(xyz[0] / WHITE[0]),
        f(xyz[1] / WHITE[1]),
        f(xyz[2] / WHITE[2]),
    ];
    let l = 116.0 * fy - 16.0;
    let a = 500.0 * (fx - fy);
    let b = 200.0 * (fy - fz);

    let scale = |value: f64, low: f64, high: f64| {
        ((value - low) / (high - low) * 65535.0)
            .round()
            .clamp(0.0, 65535.0) as u16
    };
    [
        scale(l, 0.0, 100.0),
        scale(a, -128.0, 127.0),
        scale(b, -128.0, 127.0),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIVER: &str = r#"{
        "ContentCreatorName": "Reader1",
        "ClinicalTrialSeriesID": "Session1",
        "ClinicalTrialTimePointID": "1",
        "SeriesDescription": "Segmentation",
        "SeriesNumber": "300",
        "InstanceNumber": 1,
        "BodyPartExamined": "ABDOMEN",
        "segmentAttributes": [[
            {
                "labelID": 2,
                "SegmentDescription": "Tumor",
                "SegmentLabel": "Tumor",
                "SegmentAlgorithmType": "SEMIAUTOMATIC",
                "SegmentAlgorithmName": "Slicer",
                "SegmentedPropertyCategoryCodeSequence": {
                    "CodeValue": "49755003",
                    "CodingSchemeDesignator": "SCT",
                    "CodeMeaning": "Morphologically Altered Structure"
                },
                "SegmentedPropertyTypeCodeSequence": {
                    "CodeValue": "108369006",
                    "CodingSchemeDesignator": "SCT",
                    "CodeMeaning": "Neoplasm"
                },
                "recommendedDisplayRGBValue": [255, 0, 0]
            },
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
                "AnatomicRegionSequence": {
                    "CodeValue": "818981001",
                    "CodingSchemeDesignator": "SCT",
                    "CodeMeaning": "Abdomen"
                }
            }
        ]]
    }"#;

    #[test]
    fn parses_dcmqi_metainfo() {
        let template: Template = LIVER.parse().unwrap();
        assert_eq!(template.series_number, "300");
        assert_eq!(template.instance_number, "1");
        assert_eq!(template.content_creator_name, "Reader1");
        let labels: Vec<u16> = template.segments().iter().map(|s| s.label_id).collect();
        assert_eq!(labels, vec![1, 2]);
        assert_eq!(template.segment(2).unwrap().label, "Tumor");
        assert!(template.segment(3).is_none());
    }

    #[test]
    fn segment_item_carries_codes() {
        let template: Template = LIVER.parse().unwrap();
        let item = template.segment(1).unwrap().to_item().unwrap();
        assert_eq!(
            item.element(tags::SEGMENT_ALGORITHM_TYPE).unwrap().to_str().unwrap(),
            "MANUAL"
        );
        let region = item.element(tags::ANATOMIC_REGION_SEQUENCE).unwrap();
        let region = &region.items().unwrap()[0];
        assert_eq!(
            region.element(tags::CODE_VALUE).unwrap().to_str().unwrap(),
            "818981001"
        );
        assert!(item.element(tags::RECOMMENDED_DISPLAY_CIE_LAB_VALUE).is_err());

        let tumor = template.segment(2).unwrap().to_item().unwrap();
        let lab = tumor
            .element(tags::RECOMMENDED_DISPLAY_CIE_LAB_VALUE)
            .unwrap()
            .to_multi_int::<u16>()
            .unwrap();
        assert_eq!(lab, rgb_to_dicom_lab([255, 0, 0]).to_vec());
    }

    fn with_segments(segments: &str) -> Result<Template, TemplateError> {
        format!(r#"{{ "segmentAttributes": {segments} }}"#).parse()
    }

    fn segment(label: u16, algorithm: &str, name: Option<&str>) -> String {
        let name = name
            .map(|name| format!(r#""SegmentAlgorithmName": "{name}","#))
            .unwrap_or_default();
        format!(
            r#"{{ "labelID": {label}, "SegmentLabel": "s{label}", {name}
                "SegmentAlgorithmType": "{algorithm}",
                "SegmentedPropertyCategoryCodeSequence": {{ "CodeValue": "1", "CodingSchemeDesignator": "SCT", "CodeMeaning": "c" }},
                "SegmentedPropertyTypeCodeSequence": {{ "CodeValue": "2", "CodingSchemeDesignator": "SCT", "CodeMeaning": "t" }} }}"#
        )
    }

    #[test]
    fn rejects_invalid_templates() {
        assert!(matches!("{".parse::<Template>(), Err(TemplateError::Json(_))));
        assert!(matches!(
            r#"{ "SeriesDescription": "x" }"#.parse::<Template>(),
            Err(TemplateError::Json(_))
        ));
        assert!(matches!(with_segments("[]"), Err(TemplateError::NoSegments)));
        assert!(matches!(with_segments("[[]]"), Err(TemplateError::NoSegments)));

        let manual = segment(1, "MANUAL", None);
        assert!(matches!(
            with_segments(&format!("[[{manual}], [{manual}]]")),
            Err(TemplateError::SegmentGroups(2))
        ));
        assert!(matches!(
            with_segments(&format!("[[{manual}, {manual}]]")),
            Err(TemplateError::DuplicateLabel(1))
        ));
        assert!(matches!(
            with_segments(&format!("[[{}]]", segment(0, "MANUAL", None))),
            Err(TemplateError::BackgroundLabel)
        ));
        assert!(matches!(
            with_segments(&format!("[[{}]]", segment(1, "GUESSED", None))),
            Err(TemplateError::UnknownAlgorithmType(_))
        ));
        assert!(matches!(
            with_segments(&format!("[[{}]]", segment(1, "AUTOMATIC", None))),
            Err(TemplateError::MissingAlgorithmName(1, AlgorithmType::Automatic))
        ));
        assert!(with_segments(&format!("[[{}]]", segment(1, "AUTOMATIC", Some("nnU-Net")))).is_ok());
    }

    #[test]
    fn converts_white_and_black_to_lab() {
        let white = rgb_to_dicom_lab([255, 255, 255]);
        assert_eq!(white[0], 65535);
        assert!(white[1].abs_diff(32896) <= 1);
        assert!(white[2].abs_diff(32896) <= 1);
        assert_eq!(rgb_to_dicom_lab([0, 0, 0]), [0, 32896, 32896]);
    }

    #[test]
    fn red_has_positive_a() {
        let red = rgb_to_dicom_lab([255, 0, 0]);
        assert!(red[1] > 32896 + 10_000);
        assert!(red[0] > 30_000 && red[0] < 40_000);
    }
}
