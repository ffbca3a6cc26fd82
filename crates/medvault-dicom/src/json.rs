//! 规范JSON投影
//!
//! Full 形式逐标签给出 `{Name, Type, Value}`；Simple 以标签名为键，
//! Short 以 "gggg,eeee" 为键。Simple 与 Short 都由 Full 派生，
//! 保证三种形式覆盖同一标签集合。

use crate::encoding::{self, DicomEncoding};
use crate::parser::{decode_element_text, Dataset, ElementText};
use dicom_core::dictionary::{DataDictionary, DataDictionaryEntry};
use dicom_core::header::Header;
use dicom_core::Tag;
use dicom_dictionary_std::StandardDataDictionary;
use dicom_object::mem::InMemElement;
use dicom_object::InMemDicomObject;
use serde_json::{json, Map, Value};

/// JSON投影形式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonFormat {
    Full,
    Simple,
    Short,
}

/// 数据集的JSON投影
///
/// `max_string_len` 为字符串值的长度上限，超过的值标记为 TooLong；
/// 0 表示不限制。
pub fn to_json(dataset: &Dataset, format: JsonFormat, max_string_len: usize) -> Value {
    let full = full_projection(dataset, max_string_len);
    match format {
        JsonFormat::Full => full,
        JsonFormat::Simple => simplify(&full),
        JsonFormat::Short => shorten(&full),
    }
}

fn full_projection(dataset: &Dataset, max_string_len: usize) -> Value {
    // 投影沿用摘要相同的字符集回退策略
    let charset = encoding::detect_encoding(dataset, "ISO_IR 100");
    let mut target = Map::new();
    for tag in dataset.tags() {
        if let Ok(element) = dataset.element(tag) {
            let creator = creator_tag(tag)
                .and_then(|ct| dataset.element(ct).ok())
                .and_then(element_text);
            project_element(&mut target, element, creator, charset, max_string_len);
        }
    }
    Value::Object(target)
}

fn project_element(
    target: &mut Map<String, Value>,
    element: &InMemElement,
    private_creator: Option<String>,
    charset: DicomEncoding,
    max_string_len: usize,
) {
    let tag = element.tag();
    let key = format!("{:04x},{:04x}", tag.group(), tag.element());
    let name = tag_name(tag);

    let mut node = match decode_element_text(element, charset) {
        ElementText::Sequence => {
            let items: Vec<Value> = element
                .value()
                .items()
                .map(|items| {
                    items
                        .iter()
                        .map(|item| project_item(item, charset, max_string_len))
                        .collect()
                })
                .unwrap_or_default();
            json!({ "Name": name, "Type": "Sequence", "Value": items })
        }
        ElementText::Null => json!({ "Name": name, "Type": "Null", "Value": Value::Null }),
        ElementText::Text(s) => {
            if max_string_len > 0 && s.len() > max_string_len {
                json!({ "Name": name, "Type": "TooLong", "Value": Value::Null })
            } else {
                json!({ "Name": name, "Type": "String", "Value": s })
            }
        }
    };

    if let (Some(creator), Some(object)) = (private_creator, node.as_object_mut()) {
        object.insert("PrivateCreator".to_string(), json!(creator));
    }

    target.insert(key, node);
}

fn project_item(item: &InMemDicomObject, charset: DicomEncoding, max_string_len: usize) -> Value {
    let mut map = Map::new();
    for element in item {
        let creator = creator_tag(element.tag())
            .and_then(|ct| item.element(ct).ok())
            .and_then(element_text);
        project_element(&mut map, element, creator, charset, max_string_len);
    }
    Value::Object(map)
}

/// 私有标签（奇数组号，元素 >= 0x1000）对应的创建者元素 (gggg,00xx)
fn creator_tag(tag: Tag) -> Option<Tag> {
    let block = tag.element() >> 8;
    if tag.group() % 2 == 1 && (0x10..=0xff).contains(&block) {
        Some(Tag(tag.group(), block))
    } else {
        None
    }
}

fn element_text(element: &InMemElement) -> Option<String> {
    element
        .to_str()
        .ok()
        .map(|s| s.trim_end_matches([' ', '\0']).to_string())
        .filter(|s| !s.is_empty())
}

fn tag_name(tag: Tag) -> String {
    StandardDataDictionary
        .by_tag(tag)
        .map(|entry| entry.alias().to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}

/// 标签的字典名，未知标签为 "Unknown"
pub fn display_name(tag: crate::tags::DicomTag) -> String {
    tag_name(Tag(tag.group, tag.element))
}

/// Full投影化简为以标签名为键的映射
pub fn simplify(full: &Value) -> Value {
    convert(full, true)
}

/// Full投影化简为以 "gggg,eeee" 为键的映射
pub fn shorten(full: &Value) -> Value {
    convert(full, false)
}

fn convert(full: &Value, by_name: bool) -> Value {
    let Some(entries) = full.as_object() else {
        return Value::Object(Map::new());
    };

    let mut result = Map::new();
    for (tag_key, node) in entries {
        let key = if by_name {
            node.get("Name")
                .and_then(Value::as_str)
                .unwrap_or(tag_key)
                .to_string()
        } else {
            tag_key.clone()
        };

        let value = match node.get("Type").and_then(Value::as_str) {
            Some("String") => node.get("Value").cloned().unwrap_or(Value::Null),
            Some("Sequence") => {
                let items = node
                    .get("Value")
                    .and_then(Value::as_array)
                    .map(|items| items.iter().map(|item| convert(item, by_name)).collect())
                    .unwrap_or_default();
                Value::Array(items)
            }
            _ => Value::Null,
        };

        result.insert(key, value);
    }
    Value::Object(result)
}
