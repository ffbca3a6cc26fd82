//! 扁平DICOM标签映射
//!
//! 叶子值统一归一化为UTF-8字符串；二进制或超长的值以Null占位。
//! 序列不进入用于索引的扁平映射。

use crate::tags::{self, DicomTag};
use medvault_core::ResourceLevel;
use std::collections::BTreeMap;

/// 归一化后的叶子值
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DicomValue {
    String(String),
    Null,
}

impl DicomValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            DicomValue::String(s) => Some(s.as_str()),
            DicomValue::Null => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, DicomValue::Null)
    }
}

/// 按标签排序的扁平映射
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DicomMap {
    values: BTreeMap<DicomTag, DicomValue>,
}

impl DicomMap {
    pub fn new() -> Self {
        DicomMap::default()
    }

    pub fn set(&mut self, tag: DicomTag, value: DicomValue) {
        self.values.insert(tag, value);
    }

    pub fn set_string(&mut self, tag: DicomTag, value: impl Into<String>) {
        self.values.insert(tag, DicomValue::String(value.into()));
    }

    pub fn get(&self, tag: DicomTag) -> Option<&DicomValue> {
        self.values.get(&tag)
    }

    /// 非空字符串值；Null或缺失返回None
    pub fn value_str(&self, tag: DicomTag) -> Option<&str> {
        self.values.get(&tag).and_then(|v| v.as_str())
    }

    pub fn has(&self, tag: DicomTag) -> bool {
        self.values.contains_key(&tag)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DicomTag, &DicomValue)> {
        self.values.iter()
    }

    /// 限定到某层级的主标签，缺失的标签直接不出现在结果中
    pub fn extract(&self, level: ResourceLevel) -> DicomMap {
        let mut result = DicomMap::new();
        for tag in tags::main_tags(level) {
            if let Some(value) = self.values.get(tag) {
                result.set(*tag, value.clone());
            }
        }
        result
    }
}

impl FromIterator<(DicomTag, DicomValue)> for DicomMap {
    fn from_iter<T: IntoIterator<Item = (DicomTag, DicomValue)>>(iter: T) -> Self {
        DicomMap {
            values: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DicomMap {
        let mut map = DicomMap::new();
        map.set_string(tags::PATIENT_ID, "P1");
        map.set_string(tags::PATIENT_NAME, "DOE^JOHN");
        map.set_string(tags::STUDY_INSTANCE_UID, "1.2.3");
        map.set_string(tags::MODALITY, "CT");
        map.set(tags::NUMBER_OF_FRAMES, DicomValue::Null);
        map
    }

    #[test]
    fn test_extract_restricts_to_level() {
        let map = sample();
        let patient = map.extract(ResourceLevel::Patient);
        assert_eq!(patient.value_str(tags::PATIENT_ID), Some("P1"));
        assert!(!patient.has(tags::STUDY_INSTANCE_UID));
        assert!(!patient.has(tags::MODALITY));

        let series = map.extract(ResourceLevel::Series);
        assert_eq!(series.value_str(tags::MODALITY), Some("CT"));
        assert_eq!(series.len(), 1);
    }

    #[test]
    fn test_extract_never_fails_on_missing_tags() {
        let empty = DicomMap::new();
        assert!(empty.extract(ResourceLevel::Instance).is_empty());
    }

    #[test]
    fn test_extract_equals_summary_intersection() {
        // extract(m, L) 与「m ∩ main_tags(L)」一致
        let map = sample();
        let extracted = map.extract(ResourceLevel::Patient);
        let expected: DicomMap = map
            .iter()
            .filter(|(tag, _)| tags::is_main_tag(**tag, ResourceLevel::Patient))
            .map(|(tag, value)| (*tag, value.clone()))
            .collect();
        assert_eq!(extracted, expected);
    }

    #[test]
    fn test_null_values_are_absent_strings() {
        let map = sample();
        assert!(map.has(tags::NUMBER_OF_FRAMES));
        assert_eq!(map.value_str(tags::NUMBER_OF_FRAMES), None);
    }
}
