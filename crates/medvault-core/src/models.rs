//! 核心数据模型定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 资源层级，构成 患者 → 检查 → 系列 → 实例 的四级树
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceLevel {
    Patient,
    Study,
    Series,
    Instance,
}

impl ResourceLevel {
    /// 数据库中的层级编码
    pub fn code(self) -> i64 {
        match self {
            ResourceLevel::Patient => 1,
            ResourceLevel::Study => 2,
            ResourceLevel::Series => 3,
            ResourceLevel::Instance => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(ResourceLevel::Patient),
            2 => Some(ResourceLevel::Study),
            3 => Some(ResourceLevel::Series),
            4 => Some(ResourceLevel::Instance),
            _ => None,
        }
    }

    pub fn parent(self) -> Option<Self> {
        match self {
            ResourceLevel::Patient => None,
            ResourceLevel::Study => Some(ResourceLevel::Patient),
            ResourceLevel::Series => Some(ResourceLevel::Study),
            ResourceLevel::Instance => Some(ResourceLevel::Series),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceLevel::Patient => "Patient",
            ResourceLevel::Study => "Study",
            ResourceLevel::Series => "Series",
            ResourceLevel::Instance => "Instance",
        }
    }
}

impl std::fmt::Display for ResourceLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 变更日志的事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    NewPatient,
    NewStudy,
    NewSeries,
    NewInstance,
    NewChildInstance,
    StablePatient,
    StableStudy,
    StableSeries,
    CompletedSeries,
    Deleted,
}

impl ChangeKind {
    pub fn code(self) -> i64 {
        match self {
            ChangeKind::NewPatient => 1,
            ChangeKind::NewStudy => 2,
            ChangeKind::NewSeries => 3,
            ChangeKind::NewInstance => 4,
            ChangeKind::NewChildInstance => 5,
            ChangeKind::StablePatient => 6,
            ChangeKind::StableStudy => 7,
            ChangeKind::StableSeries => 8,
            ChangeKind::CompletedSeries => 9,
            ChangeKind::Deleted => 10,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(ChangeKind::NewPatient),
            2 => Some(ChangeKind::NewStudy),
            3 => Some(ChangeKind::NewSeries),
            4 => Some(ChangeKind::NewInstance),
            5 => Some(ChangeKind::NewChildInstance),
            6 => Some(ChangeKind::StablePatient),
            7 => Some(ChangeKind::StableStudy),
            8 => Some(ChangeKind::StableSeries),
            9 => Some(ChangeKind::CompletedSeries),
            10 => Some(ChangeKind::Deleted),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::NewPatient => "NewPatient",
            ChangeKind::NewStudy => "NewStudy",
            ChangeKind::NewSeries => "NewSeries",
            ChangeKind::NewInstance => "NewInstance",
            ChangeKind::NewChildInstance => "NewChildInstance",
            ChangeKind::StablePatient => "StablePatient",
            ChangeKind::StableStudy => "StableStudy",
            ChangeKind::StableSeries => "StableSeries",
            ChangeKind::CompletedSeries => "CompletedSeries",
            ChangeKind::Deleted => "Deleted",
        }
    }
}

/// 变更日志记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub seq: u64,
    pub kind: ChangeKind,
    pub level: ResourceLevel,
    pub public_id: String,
    pub timestamp: DateTime<Utc>,
}

/// 资源元数据类型，预留 >= 1024 的编号给用户自定义类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataKind {
    LastUpdate,
    IndexInSeries,
    ReceptionDate,
    RemoteAet,
    ModifiedFrom,
    AnonymizedFrom,
    ExpectedInstanceCount,
    User(u16),
}

impl MetadataKind {
    pub fn code(self) -> i64 {
        match self {
            MetadataKind::LastUpdate => 1,
            MetadataKind::IndexInSeries => 2,
            MetadataKind::ReceptionDate => 3,
            MetadataKind::RemoteAet => 4,
            MetadataKind::ModifiedFrom => 5,
            MetadataKind::AnonymizedFrom => 6,
            MetadataKind::ExpectedInstanceCount => 7,
            MetadataKind::User(n) => 1024 + n as i64,
        }
    }
}

/// 附件内容类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentType {
    Dicom,
    DicomAsJson,
}

impl ContentType {
    pub fn code(self) -> i64 {
        match self {
            ContentType::Dicom => 1,
            ContentType::DicomAsJson => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(ContentType::Dicom),
            2 => Some(ContentType::DicomAsJson),
            _ => None,
        }
    }
}

/// 附件压缩方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionKind {
    None,
    Zlib,
}

impl CompressionKind {
    pub fn code(self) -> i64 {
        match self {
            CompressionKind::None => 0,
            CompressionKind::Zlib => 1,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(CompressionKind::None),
            1 => Some(CompressionKind::Zlib),
            _ => None,
        }
    }
}

/// 已写入的附件描述，由存储访问器产生，由索引持有
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentInfo {
    pub uuid: String,
    pub content_type: ContentType,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub compression: CompressionKind,
    pub uncompressed_md5: Option<String>,
    pub compressed_md5: Option<String>,
}

/// 入库操作的结果状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreStatus {
    Success,
    AlreadyStored,
    FilteredOut,
}

/// 入库操作的返回值
#[derive(Debug, Clone)]
pub struct StoreOutcome {
    pub status: StoreStatus,
    pub public_id: String,
}

/// 入库请求的来源信息
#[derive(Debug, Clone, Default)]
pub struct RequestOrigin {
    /// 远端AE标题，来自DICOM协议时非空
    pub remote_aet: String,
    /// 请求来源描述 (dicom / http / plugin ...)
    pub source: String,
}

impl RequestOrigin {
    pub fn dicom(remote_aet: impl Into<String>) -> Self {
        RequestOrigin {
            remote_aet: remote_aet.into(),
            source: "dicom".to_string(),
        }
    }

    pub fn http() -> Self {
        RequestOrigin {
            remote_aet: String::new(),
            source: "http".to_string(),
        }
    }
}

/// 全局统计计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalCounters {
    pub compressed_total: u64,
    pub uncompressed_total: u64,
    pub patient_count: u64,
    pub study_count: u64,
    pub series_count: u64,
    pub instance_count: u64,
}

/// 级联删除的结果报告
#[derive(Debug, Clone)]
pub struct DeletionReport {
    /// 删除后仍然存活的最高层祖先
    pub remaining_ancestor: Option<(ResourceLevel, String)>,
    /// 待从Blob存储移除的附件
    pub deleted_attachments: Vec<AttachmentInfo>,
    /// 被级联删除的实例公开ID，用于缓存失效
    pub deleted_instances: Vec<String>,
    /// 本次删除写入的变更记录
    pub change: ChangeRecord,
}

/// 系列的完整性状态，依据期望实例数与已收实例序号推断
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeriesStatus {
    Complete,
    Missing,
    Inconsistent,
    Unknown,
}

impl SeriesStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SeriesStatus::Complete => "Complete",
            SeriesStatus::Missing => "Missing",
            SeriesStatus::Inconsistent => "Inconsistent",
            SeriesStatus::Unknown => "Unknown",
        }
    }
}

/// 导出审计记录，转发到远端节点时写入
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedResource {
    pub seq: u64,
    pub level: ResourceLevel,
    pub public_id: String,
    pub remote_aet: String,
    pub patient_id: String,
    pub study_uid: String,
    pub series_uid: String,
    pub instance_uid: String,
    pub timestamp: DateTime<Utc>,
}
