//! DICOM字节流的解析、序列化与摘要
//!
//! 字节级解析由 `dicom-object` 承担，这里只做归档核心需要的桥接：
//! 去前导码、叶子值归一化、以及无文件头数据集的补全。

use crate::encoding::{self, DicomEncoding};
use crate::map::{DicomMap, DicomValue};
use crate::tags::DicomTag;
use dicom_core::header::Header;
use dicom_core::{PrimitiveValue, Tag, VR};
use dicom_dictionary_std::uids;
use dicom_object::mem::InMemElement;
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
use medvault_core::{ArchiveError, Result};

/// 已解析的DICOM数据集（文件元信息 + 数据集）
pub type Dataset = dicom_object::DefaultDicomObject;

/// 进入索引摘要的值长度上限，超过的值以Null占位
const MAX_SUMMARY_VALUE_LENGTH: usize = 256;

/// 解析DICOM字节流，接受带或不带128字节前导码的Part-10流
pub fn parse(bytes: &[u8]) -> Result<Dataset> {
    dicom_object::from_reader(strip_preamble(bytes))
        .map_err(|e| ArchiveError::bad_file_format(format!("cannot parse DICOM stream: {e}")))
}

/// 序列化数据集，保留其原始传输语法
pub fn serialize(dataset: &Dataset) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    dataset
        .write_all(&mut bytes)
        .map_err(|e| ArchiveError::internal(format!("cannot serialize DICOM dataset: {e}")))?;
    Ok(bytes)
}

/// 为裸数据集补全文件元信息，传输语法取显式VR小端
pub fn with_default_meta(object: InMemDicomObject) -> Result<Dataset> {
    let sop_class = element_str(&object, Tag(0x0008, 0x0016))
        .unwrap_or_else(|| uids::SECONDARY_CAPTURE_IMAGE_STORAGE.to_string());
    let sop_instance = element_str(&object, Tag(0x0008, 0x0018))
        .unwrap_or_else(|| "2.25.0.0".to_string());

    object
        .with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
                .media_storage_sop_class_uid(sop_class)
                .media_storage_sop_instance_uid(sop_instance),
        )
        .map_err(|e| ArchiveError::bad_file_format(format!("cannot build file meta: {e}")))
}

fn element_str(object: &InMemDicomObject, tag: Tag) -> Option<String> {
    object
        .element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches([' ', '\0']).to_string())
}

fn strip_preamble(bytes: &[u8]) -> &[u8] {
    if bytes.len() > 132 && &bytes[128..132] == b"DICM" {
        &bytes[128..]
    } else {
        bytes
    }
}

/// 将数据集的叶子元素扁平化为标签映射
///
/// 像素数据与序列不会进入摘要；二进制VR与超长值以Null占位。
pub fn summarize(dataset: &Dataset, default_encoding: &str) -> DicomMap {
    let charset = encoding::detect_encoding(dataset, default_encoding);
    let mut map = DicomMap::new();

    for tag in dataset.tags() {
        if tag.group() == 0x7fe0 {
            continue;
        }
        let Ok(element) = dataset.element(tag) else {
            continue;
        };
        let key = DicomTag::new(tag.group(), tag.element());
        match decode_element_text(element, charset) {
            ElementText::Sequence => {}
            ElementText::Null => map.set(key, DicomValue::Null),
            ElementText::Text(s) => {
                if s.len() > MAX_SUMMARY_VALUE_LENGTH {
                    map.set(key, DicomValue::Null);
                } else {
                    map.set(key, DicomValue::String(s));
                }
            }
        }
    }

    map
}

/// 叶子元素的归一化结果
pub(crate) enum ElementText {
    /// 序列，不属于叶子
    Sequence,
    /// 二进制或不可解码
    Null,
    Text(String),
}

pub(crate) fn decode_element_text(element: &InMemElement, charset: DicomEncoding) -> ElementText {
    match element.vr() {
        VR::SQ => ElementText::Sequence,
        VR::OB | VR::OW | VR::OF | VR::OD | VR::OL | VR::UN => ElementText::Null,
        VR::AT => match element.value().primitive() {
            Some(PrimitiveValue::Tags(tags)) => {
                let rendered: Vec<String> = tags
                    .iter()
                    .map(|t| format!("{:04x},{:04x}", t.group(), t.element()))
                    .collect();
                ElementText::Text(rendered.join("\\"))
            }
            _ => ElementText::Null,
        },
        _ => {
            if element.value().items().is_some() {
                // 像素序列等封装值
                return ElementText::Null;
            }
            let text = match element.to_str() {
                Ok(s) => s.to_string(),
                Err(_) => match element.value().to_bytes() {
                    Ok(bytes) => charset.decode(&bytes),
                    Err(_) => return ElementText::Null,
                },
            };
            ElementText::Text(text.trim_end_matches([' ', '\0']).to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags;
    use dicom_core::{dicom_value, DataElement};
    use dicom_dictionary_std::tags as dict;

    fn sample_dataset() -> Dataset {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(
            dict::SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, "1.2.3.4.5"),
        ));
        obj.put(DataElement::new(
            dict::PATIENT_ID,
            VR::LO,
            dicom_value!(Str, "P1"),
        ));
        obj.put(DataElement::new(
            dict::PATIENT_NAME,
            VR::PN,
            dicom_value!(Str, "DOE^JOHN"),
        ));
        obj.put(DataElement::new(
            dict::STUDY_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, "1.2.3"),
        ));
        obj.put(DataElement::new(
            dict::SERIES_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, "1.2.3.4"),
        ));
        obj.put(DataElement::new(
            dict::MODALITY,
            VR::CS,
            dicom_value!(Str, "CT"),
        ));
        obj.put(DataElement::new(
            dict::INSTANCE_NUMBER,
            VR::IS,
            dicom_value!(Str, "7"),
        ));
        with_default_meta(obj).unwrap()
    }

    #[test]
    fn test_serialize_parse_round_trip() {
        // parse(serialize(d)) 应当与 d 一致（忽略非语义的封装差异）
        let dataset = sample_dataset();
        let bytes = serialize(&dataset).unwrap();
        let reparsed = parse(&bytes).unwrap();

        let before = summarize(&dataset, "ISO_IR 100");
        let after = summarize(&reparsed, "ISO_IR 100");
        assert_eq!(before, after);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = parse(b"this is not dicom at all").unwrap_err();
        assert!(matches!(err, ArchiveError::BadFileFormat(_)));
    }

    #[test]
    fn test_parse_accepts_preamble() {
        let dataset = sample_dataset();
        let bytes = serialize(&dataset).unwrap();
        let mut with_preamble = vec![0u8; 128];
        with_preamble.extend_from_slice(&bytes);
        let reparsed = parse(&with_preamble).unwrap();
        assert_eq!(
            summarize(&reparsed, "ISO_IR 100").value_str(tags::PATIENT_ID),
            Some("P1")
        );
    }

    #[test]
    fn test_summarize_values() {
        let map = summarize(&sample_dataset(), "ISO_IR 100");
        assert_eq!(map.value_str(tags::PATIENT_ID), Some("P1"));
        assert_eq!(map.value_str(tags::MODALITY), Some("CT"));
        assert_eq!(map.value_str(tags::INSTANCE_NUMBER), Some("7"));
        assert_eq!(map.value_str(tags::SOP_INSTANCE_UID), Some("1.2.3.4.5"));
    }

    #[test]
    fn test_summarize_skips_binary_values() {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(
            dict::SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, "1.2.9"),
        ));
        obj.put(DataElement::new(
            Tag(0x0029, 0x0010),
            VR::UN,
            dicom_value!(U8, [0, 1, 2, 3]),
        ));
        let dataset = with_default_meta(obj).unwrap();
        let map = summarize(&dataset, "ISO_IR 100");
        assert_eq!(map.value_str(DicomTag::new(0x0029, 0x0010)), None);
        assert!(map.has(DicomTag::new(0x0029, 0x0010)));
    }
}
