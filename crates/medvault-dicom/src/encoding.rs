//! DICOM字符集检测与回退解码
//!
//! Specific Character Set (0008,0005) 决定源字符集；无法识别时回退到
//! 配置的缺省字符集，仍无法解码时退化为ASCII剥离。

use crate::parser::Dataset;
use crate::tags;
use dicom_core::Tag;
use dicom_encoding::text::{SpecificCharacterSet, TextCodec};
use tracing::warn;

/// 归档核心支持的字符集
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DicomEncoding {
    Ascii,
    Utf8,
    Latin1,
    Latin2,
    Latin3,
    Latin4,
    Latin5,
    Cyrillic,
    Arabic,
    Greek,
    Hebrew,
    Japanese,
    Thai,
}

impl DicomEncoding {
    /// DICOM定义的字符集代号
    pub fn dicom_code(self) -> &'static str {
        match self {
            DicomEncoding::Ascii => "ISO_IR 6",
            DicomEncoding::Utf8 => "ISO_IR 192",
            DicomEncoding::Latin1 => "ISO_IR 100",
            DicomEncoding::Latin2 => "ISO_IR 101",
            DicomEncoding::Latin3 => "ISO_IR 109",
            DicomEncoding::Latin4 => "ISO_IR 110",
            DicomEncoding::Latin5 => "ISO_IR 148",
            DicomEncoding::Cyrillic => "ISO_IR 144",
            DicomEncoding::Arabic => "ISO_IR 127",
            DicomEncoding::Greek => "ISO_IR 126",
            DicomEncoding::Hebrew => "ISO_IR 138",
            DicomEncoding::Japanese => "ISO_IR 13",
            DicomEncoding::Thai => "ISO_IR 166",
        }
    }

    /// 从DICOM代号解析；未识别返回None
    pub fn from_dicom_code(code: &str) -> Option<Self> {
        match code.trim() {
            "" | "ISO_IR 6" | "ISO 2022 IR 6" => Some(DicomEncoding::Ascii),
            "ISO_IR 192" => Some(DicomEncoding::Utf8),
            "ISO_IR 100" | "ISO 2022 IR 100" => Some(DicomEncoding::Latin1),
            "ISO_IR 101" | "ISO 2022 IR 101" => Some(DicomEncoding::Latin2),
            "ISO_IR 109" | "ISO 2022 IR 109" => Some(DicomEncoding::Latin3),
            "ISO_IR 110" | "ISO 2022 IR 110" => Some(DicomEncoding::Latin4),
            "ISO_IR 148" | "ISO 2022 IR 148" => Some(DicomEncoding::Latin5),
            "ISO_IR 144" | "ISO 2022 IR 144" => Some(DicomEncoding::Cyrillic),
            "ISO_IR 127" | "ISO 2022 IR 127" => Some(DicomEncoding::Arabic),
            "ISO_IR 126" | "ISO 2022 IR 126" => Some(DicomEncoding::Greek),
            "ISO_IR 138" | "ISO 2022 IR 138" => Some(DicomEncoding::Hebrew),
            "ISO_IR 13" | "ISO 2022 IR 13" => Some(DicomEncoding::Japanese),
            "ISO_IR 166" | "ISO 2022 IR 166" => Some(DicomEncoding::Thai),
            _ => None,
        }
    }

    /// 对原始字节做字符集解码，失败时剥离非ASCII字节
    pub fn decode(self, bytes: &[u8]) -> String {
        if let Some(codec) = SpecificCharacterSet::from_code(self.dicom_code()) {
            if let Ok(decoded) = codec.decode(bytes) {
                return decoded;
            }
        }
        strip_to_ascii(bytes)
    }
}

/// 保守回退：丢弃非ASCII字节
fn strip_to_ascii(bytes: &[u8]) -> String {
    bytes
        .iter()
        .filter(|b| b.is_ascii() && **b != 0)
        .map(|b| *b as char)
        .collect()
}

/// 从数据集的 (0008,0005) 推断字符集
///
/// 值缺失或无法识别时回退到 `default`（仍无法识别则为ASCII）并记录告警。
pub fn detect_encoding(dataset: &Dataset, default: &str) -> DicomEncoding {
    let declared = dataset
        .element(Tag(
            tags::SPECIFIC_CHARACTER_SET.group,
            tags::SPECIFIC_CHARACTER_SET.element,
        ))
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim().to_string());

    match declared {
        Some(code) => match DicomEncoding::from_dicom_code(&code) {
            Some(encoding) => encoding,
            None => {
                warn!(
                    "unsupported Specific Character Set '{}', falling back to '{}'",
                    code, default
                );
                fallback(default)
            }
        },
        None => {
            warn!(
                "Specific Character Set (0008,0005) is absent, falling back to '{}'",
                default
            );
            fallback(default)
        }
    }
}

fn fallback(default: &str) -> DicomEncoding {
    DicomEncoding::from_dicom_code(default).unwrap_or_else(|| {
        warn!(
            "default character set '{}' is not recognized, using ASCII",
            default
        );
        DicomEncoding::Ascii
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip() {
        for encoding in [
            DicomEncoding::Ascii,
            DicomEncoding::Utf8,
            DicomEncoding::Latin1,
            DicomEncoding::Cyrillic,
        ] {
            assert_eq!(
                DicomEncoding::from_dicom_code(encoding.dicom_code()),
                Some(encoding)
            );
        }
    }

    #[test]
    fn test_unknown_code_is_none() {
        assert_eq!(DicomEncoding::from_dicom_code("KOI-8"), None);
    }

    #[test]
    fn test_latin1_decode() {
        // 0xE9 是Latin-1的 'é'
        let decoded = DicomEncoding::Latin1.decode(&[0x61, 0xE9, 0x62]);
        assert_eq!(decoded, "aéb");
    }

    #[test]
    fn test_ascii_strip_fallback() {
        assert_eq!(strip_to_ascii(&[0x61, 0xFF, 0x62, 0x00]), "ab");
    }
}
