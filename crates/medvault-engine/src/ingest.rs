//! 入库流水线
//!
//! 端到端的存储路径：补全 → 身份校验 → 过滤 → 写Blob → 索引事务
//! → 提交后分发。提交前的任何失败都会清掉已写入的Blob，不留孤儿。

use crate::context::ArchiveContext;
use medvault_core::{
    ArchiveError, ContentType, RequestOrigin, Result, StoreOutcome, StoreStatus,
};
use medvault_dicom::hasher::InstanceIdentity;
use medvault_dicom::json::{self, JsonFormat};
use medvault_dicom::map::DicomMap;
use medvault_dicom::parser::{self, Dataset};
use medvault_dicom::tags;
use medvault_index::InstanceToIndex;
use serde_json::Value;
use tracing::{debug, info, warn};

/// 入库请求
///
/// 字节流与已解析数据集至少给出其一；摘要与JSON投影可由调用方
/// 预先算好（如修改/匿名化路径），缺失时在流水线内补全。
pub struct StoreRequest {
    bytes: Option<Vec<u8>>,
    dataset: Option<Dataset>,
    summary: Option<DicomMap>,
    json: Option<Value>,
    origin: RequestOrigin,
}

impl StoreRequest {
    pub fn from_bytes(bytes: Vec<u8>, origin: RequestOrigin) -> Self {
        StoreRequest {
            bytes: Some(bytes),
            dataset: None,
            summary: None,
            json: None,
            origin,
        }
    }

    pub fn from_dataset(dataset: Dataset, origin: RequestOrigin) -> Self {
        StoreRequest {
            bytes: None,
            dataset: Some(dataset),
            summary: None,
            json: None,
            origin,
        }
    }

    /// 携带预先算好的摘要
    pub fn with_summary(mut self, summary: DicomMap) -> Self {
        self.summary = Some(summary);
        self
    }

    /// 携带预先算好的完整JSON投影
    pub fn with_json(mut self, json: Value) -> Self {
        self.json = Some(json);
        self
    }
}

impl ArchiveContext {
    /// 存储一个DICOM实例
    ///
    /// 幂等：同样的字节流重复入库返回 `AlreadyStored`，持久状态
    /// 只有实例的 LastUpdate 元数据被刷新。
    pub async fn store(&self, request: StoreRequest) -> Result<StoreOutcome> {
        let StoreRequest {
            bytes,
            dataset,
            summary,
            json,
            origin,
        } = request;

        // 1. 补全缺失的信息
        let (bytes, mut dataset) = match (bytes, dataset) {
            (Some(b), d) => (b, d),
            (None, Some(d)) => (parser::serialize(&d)?, Some(d)),
            (None, None) => {
                return Err(ArchiveError::BadRequest(
                    "store request carries neither bytes nor a parsed dataset".to_string(),
                ))
            }
        };
        if dataset.is_none() && (summary.is_none() || json.is_none()) {
            dataset = Some(parser::parse(&bytes)?);
        }
        let summary = match summary {
            Some(s) => s,
            None => parser::summarize(
                dataset.as_ref().expect("dataset ensured above"),
                &self.config().default_encoding,
            ),
        };
        let full_json = match json {
            Some(j) => j,
            None => json::to_json(
                dataset.as_ref().expect("dataset ensured above"),
                JsonFormat::Full,
                self.config().max_json_string_len,
            ),
        };

        // 2-3. 身份推导与必需标签校验
        let identity = match InstanceIdentity::from_map(&summary) {
            Ok(identity) => identity,
            Err(e) => {
                log_missing_required_tag(&summary);
                return Err(e);
            }
        };
        debug!("incoming instance fingerprint {}", identity.fingerprint());

        // 4. 过滤
        let simplified = json::simplify(&full_json);
        if !self.bus().filter_incoming(&simplified, &origin)? {
            info!("an incoming instance has been discarded by the filter");
            return Ok(StoreOutcome {
                status: StoreStatus::FilteredOut,
                public_id: identity.sop_uid,
            });
        }

        // 5. 写入两个附件
        let dicom_info = self.storage().write(&bytes, ContentType::Dicom).await?;
        let json_bytes = serde_json::to_vec(&full_json)
            .map_err(|e| ArchiveError::internal(e.to_string()))?;
        let json_info = self
            .storage()
            .write(&json_bytes, ContentType::DicomAsJson)
            .await?;

        // 6. 索引事务
        let to_index = InstanceToIndex {
            identity,
            summary: summary.clone(),
            attachments: vec![dicom_info.clone(), json_info.clone()],
            remote_aet: origin.remote_aet.clone(),
        };
        let report = match self
            .index()
            .store_instance(&to_index, &self.quotas())
            .await
        {
            Ok(report) => report,
            Err(e) => {
                // 事务失败：清掉刚写入的Blob
                let _ = self.storage().remove(&dicom_info.uuid).await;
                let _ = self.storage().remove(&json_info.uuid).await;
                return Err(e);
            }
        };

        match report.status {
            StoreStatus::AlreadyStored => {
                let _ = self.storage().remove(&dicom_info.uuid).await;
                let _ = self.storage().remove(&json_info.uuid).await;
                info!("instance {} already stored", report.instance_public_id);
                Ok(StoreOutcome {
                    status: StoreStatus::AlreadyStored,
                    public_id: report.instance_public_id,
                })
            }
            StoreStatus::Success => {
                // 7. 提交后：回收的Blob、缓存失效、事件分发
                for attachment in &report.recycled_attachments {
                    let _ = self.storage().remove(&attachment.uuid).await;
                }
                for public_id in &report.recycled_instances {
                    self.cache().invalidate(public_id).await;
                }
                for change in report.changes {
                    self.dispatcher().publish(change).await;
                }
                self.bus()
                    .dispatch_stored(&report.instance_public_id, &summary, &simplified);
                info!("new instance stored: {}", report.instance_public_id);
                Ok(StoreOutcome {
                    status: StoreStatus::Success,
                    public_id: report.instance_public_id,
                })
            }
            StoreStatus::FilteredOut => {
                Err(ArchiveError::internal("index reported an impossible status"))
            }
        }
    }
}

/// 身份校验失败时的结构化日志：点名缺失的标签，列出已有的标签
fn log_missing_required_tag(summary: &DicomMap) {
    let mut present = Vec::new();
    let mut missing = Vec::new();
    for (tag, name) in [
        (tags::PATIENT_ID, "PatientID"),
        (tags::STUDY_INSTANCE_UID, "StudyInstanceUID"),
        (tags::SERIES_INSTANCE_UID, "SeriesInstanceUID"),
        (tags::SOP_INSTANCE_UID, "SOPInstanceUID"),
    ] {
        match summary.value_str(tag) {
            Some(value) if !value.is_empty() => present.push(format!("{name}={value}")),
            _ => missing.push(name),
        }
    }
    warn!(
        "store rejected, missing required tags: {}; present tags: {}",
        missing.join(", "),
        if present.is_empty() {
            "none".to_string()
        } else {
            present.join(", ")
        }
    );
}
