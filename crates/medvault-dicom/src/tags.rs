//! DICOM标签原语与各层级主标签登记表

use medvault_core::ResourceLevel;
use serde::{Deserialize, Serialize};

/// DICOM标签，(group, element) 二元组
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DicomTag {
    pub group: u16,
    pub element: u16,
}

impl DicomTag {
    pub const fn new(group: u16, element: u16) -> Self {
        DicomTag { group, element }
    }

    /// 解析 "gggg,eeee" 或 8位十六进制形式
    pub fn parse(value: &str) -> Option<Self> {
        let cleaned = value.trim();
        let (g, e) = match cleaned.split_once(',') {
            Some((g, e)) => (g.trim(), e.trim()),
            None if cleaned.len() == 8 => (&cleaned[..4], &cleaned[4..]),
            None => return None,
        };
        let group = u16::from_str_radix(g, 16).ok()?;
        let element = u16::from_str_radix(e, 16).ok()?;
        Some(DicomTag::new(group, element))
    }
}

impl std::fmt::Display for DicomTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04x},{:04x}", self.group, self.element)
    }
}

pub const PATIENT_ID: DicomTag = DicomTag::new(0x0010, 0x0020);
pub const PATIENT_NAME: DicomTag = DicomTag::new(0x0010, 0x0010);
pub const PATIENT_BIRTH_DATE: DicomTag = DicomTag::new(0x0010, 0x0030);
pub const PATIENT_SEX: DicomTag = DicomTag::new(0x0010, 0x0040);

pub const STUDY_INSTANCE_UID: DicomTag = DicomTag::new(0x0020, 0x000d);
pub const ACCESSION_NUMBER: DicomTag = DicomTag::new(0x0008, 0x0050);
pub const STUDY_DATE: DicomTag = DicomTag::new(0x0008, 0x0020);
pub const STUDY_TIME: DicomTag = DicomTag::new(0x0008, 0x0030);
pub const STUDY_DESCRIPTION: DicomTag = DicomTag::new(0x0008, 0x1030);
pub const REFERRING_PHYSICIAN_NAME: DicomTag = DicomTag::new(0x0008, 0x0090);

pub const SERIES_INSTANCE_UID: DicomTag = DicomTag::new(0x0020, 0x000e);
pub const SERIES_NUMBER: DicomTag = DicomTag::new(0x0020, 0x0011);
pub const MODALITY: DicomTag = DicomTag::new(0x0008, 0x0060);
pub const MANUFACTURER: DicomTag = DicomTag::new(0x0008, 0x0070);
pub const STATION_NAME: DicomTag = DicomTag::new(0x0008, 0x1010);
pub const SERIES_DESCRIPTION: DicomTag = DicomTag::new(0x0008, 0x103e);
pub const BODY_PART_EXAMINED: DicomTag = DicomTag::new(0x0018, 0x0015);
pub const SEQUENCE_NAME: DicomTag = DicomTag::new(0x0018, 0x0024);
pub const PROTOCOL_NAME: DicomTag = DicomTag::new(0x0018, 0x1030);
pub const SERIES_DATE: DicomTag = DicomTag::new(0x0008, 0x0021);
pub const SERIES_TIME: DicomTag = DicomTag::new(0x0008, 0x0031);

pub const SOP_INSTANCE_UID: DicomTag = DicomTag::new(0x0008, 0x0018);
pub const INSTANCE_NUMBER: DicomTag = DicomTag::new(0x0020, 0x0013);
pub const IMAGE_INDEX: DicomTag = DicomTag::new(0x0054, 0x1330);
pub const NUMBER_OF_FRAMES: DicomTag = DicomTag::new(0x0028, 0x0008);
pub const ACQUISITION_NUMBER: DicomTag = DicomTag::new(0x0020, 0x0012);

pub const SPECIFIC_CHARACTER_SET: DicomTag = DicomTag::new(0x0008, 0x0005);

// 系列期望实例数的来源标签
pub const NUMBER_OF_SLICES: DicomTag = DicomTag::new(0x0054, 0x0081);
pub const IMAGES_IN_ACQUISITION: DicomTag = DicomTag::new(0x0020, 0x1002);
pub const CARDIAC_NUMBER_OF_IMAGES: DicomTag = DicomTag::new(0x0018, 0x1090);

const PATIENT_MAIN_TAGS: &[DicomTag] = &[
    PATIENT_ID,
    PATIENT_NAME,
    PATIENT_BIRTH_DATE,
    PATIENT_SEX,
];

const STUDY_MAIN_TAGS: &[DicomTag] = &[
    STUDY_INSTANCE_UID,
    ACCESSION_NUMBER,
    STUDY_DATE,
    STUDY_TIME,
    STUDY_DESCRIPTION,
    REFERRING_PHYSICIAN_NAME,
];

const SERIES_MAIN_TAGS: &[DicomTag] = &[
    SERIES_INSTANCE_UID,
    SERIES_NUMBER,
    MODALITY,
    MANUFACTURER,
    STATION_NAME,
    SERIES_DESCRIPTION,
    BODY_PART_EXAMINED,
    SEQUENCE_NAME,
    PROTOCOL_NAME,
    SERIES_DATE,
    SERIES_TIME,
];

const INSTANCE_MAIN_TAGS: &[DicomTag] = &[
    SOP_INSTANCE_UID,
    INSTANCE_NUMBER,
    IMAGE_INDEX,
    NUMBER_OF_FRAMES,
    ACQUISITION_NUMBER,
];

/// 某层级的主标签集合
pub fn main_tags(level: ResourceLevel) -> &'static [DicomTag] {
    match level {
        ResourceLevel::Patient => PATIENT_MAIN_TAGS,
        ResourceLevel::Study => STUDY_MAIN_TAGS,
        ResourceLevel::Series => SERIES_MAIN_TAGS,
        ResourceLevel::Instance => INSTANCE_MAIN_TAGS,
    }
}

/// 某层级自身携带的标识符标签（主标签中被提升为可等值检索的子集）
pub fn identifier_tags(level: ResourceLevel) -> &'static [DicomTag] {
    match level {
        ResourceLevel::Patient => &[PATIENT_ID],
        ResourceLevel::Study => &[STUDY_INSTANCE_UID, ACCESSION_NUMBER],
        ResourceLevel::Series => &[SERIES_INSTANCE_UID],
        ResourceLevel::Instance => &[SOP_INSTANCE_UID],
    }
}

/// 标识符索引中该层级可检索的标签。检查层额外收录 PatientID，
/// 使限定到检查及以下层级的查询仍能按患者身份过滤。
pub fn lookup_identifier_tags(level: ResourceLevel) -> &'static [DicomTag] {
    match level {
        ResourceLevel::Patient => &[PATIENT_ID],
        ResourceLevel::Study => &[STUDY_INSTANCE_UID, ACCESSION_NUMBER, PATIENT_ID],
        ResourceLevel::Series => &[SERIES_INSTANCE_UID],
        ResourceLevel::Instance => &[SOP_INSTANCE_UID],
    }
}

/// 标签是否属于某层级的主标签
pub fn is_main_tag(tag: DicomTag, level: ResourceLevel) -> bool {
    main_tags(level).contains(&tag)
}
