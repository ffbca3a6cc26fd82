//! 实例身份与确定性指纹
//!
//! 四个DICOM标识符共同确定一个实例的归档身份；任一缺失即判定
//! 字节流不可入库。指纹是标识符串联后的SHA-1摘要，按5组8位
//! 十六进制呈现，用于日志与幂等性诊断。

use crate::map::DicomMap;
use crate::tags;
use medvault_core::{ArchiveError, Result};
use sha1::{Digest, Sha1};

/// 实例的四个必需标识符
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceIdentity {
    pub patient_id: String,
    pub study_uid: String,
    pub series_uid: String,
    pub sop_uid: String,
}

impl InstanceIdentity {
    /// 从标签摘要提取身份，任一标识符缺失返回 `InexistentTag`
    pub fn from_map(summary: &DicomMap) -> Result<Self> {
        let mut missing = Vec::new();

        let patient_id = required(summary, tags::PATIENT_ID, "PatientID", &mut missing);
        let study_uid = required(
            summary,
            tags::STUDY_INSTANCE_UID,
            "StudyInstanceUID",
            &mut missing,
        );
        let series_uid = required(
            summary,
            tags::SERIES_INSTANCE_UID,
            "SeriesInstanceUID",
            &mut missing,
        );
        let sop_uid = required(
            summary,
            tags::SOP_INSTANCE_UID,
            "SOPInstanceUID",
            &mut missing,
        );

        if !missing.is_empty() {
            return Err(ArchiveError::InexistentTag(missing.join(", ")));
        }

        Ok(InstanceIdentity {
            patient_id: patient_id.unwrap(),
            study_uid: study_uid.unwrap(),
            series_uid: series_uid.unwrap(),
            sop_uid: sop_uid.unwrap(),
        })
    }

    /// 实例指纹：SHA-1(PatientID|StudyUID|SeriesUID|SOPUID)
    pub fn fingerprint(&self) -> String {
        let joined = format!(
            "{}|{}|{}|{}",
            self.patient_id, self.study_uid, self.series_uid, self.sop_uid
        );
        let digest = Sha1::digest(joined.as_bytes());
        format_digest(&digest)
    }
}

fn required(
    summary: &DicomMap,
    tag: crate::tags::DicomTag,
    name: &'static str,
    missing: &mut Vec<&'static str>,
) -> Option<String> {
    match summary.value_str(tag) {
        Some(value) if !value.is_empty() => Some(value.to_string()),
        _ => {
            missing.push(name);
            None
        }
    }
}

/// 20字节摘要 → 40个十六进制字符，按8字符分5组
fn format_digest(digest: &[u8]) -> String {
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex.as_bytes()
        .chunks(8)
        .map(|chunk| std::str::from_utf8(chunk).unwrap())
        .collect::<Vec<_>>()
        .join("-")
}
