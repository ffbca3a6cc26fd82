//! 配置管理
//!
//! 配置文件的加载由外部协作方完成，这里只定义归档核心的配置结构。

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 归档核心完整配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Blob存储根目录
    pub storage_root: PathBuf,
    /// 索引数据库文件路径，None 表示内存库
    #[serde(default)]
    pub index_path: Option<PathBuf>,
    /// 本机AE标题
    #[serde(default = "default_local_aet")]
    pub local_aet: String,
    /// 是否对附件启用Zlib压缩
    #[serde(default)]
    pub compression: bool,
    /// 是否为附件记录MD5摘要
    #[serde(default = "default_true")]
    pub store_md5: bool,
    /// 最大患者数量，0 表示不限制
    #[serde(default)]
    pub max_patient_count: u64,
    /// 最大存储大小（压缩后字节数），0 表示不限制
    #[serde(default)]
    pub max_storage_size: u64,
    /// 已解析实例缓存的容量
    #[serde(default = "default_cache_capacity")]
    pub dicom_cache_capacity: usize,
    /// 并行任务链上限
    #[serde(default = "default_job_limit")]
    pub job_limit: usize,
    /// 任务队列引用的实例总大小上限（字节）
    #[serde(default = "default_job_queue_bytes")]
    pub job_queue_size_limit: u64,
    /// 空闲DICOM连接的关闭延迟（秒）
    #[serde(default = "default_close_delay")]
    pub peer_close_delay_secs: u64,
    /// 缺省字符集，Specific Character Set 无法识别时使用
    #[serde(default = "default_encoding")]
    pub default_encoding: String,
    /// JSON投影中字符串值的长度上限，0 表示不限制
    #[serde(default = "default_json_string_len")]
    pub max_json_string_len: usize,
}

fn default_local_aet() -> String {
    "MEDVAULT".to_string()
}

fn default_true() -> bool {
    true
}

fn default_cache_capacity() -> usize {
    2
}

fn default_job_limit() -> usize {
    10
}

fn default_job_queue_bytes() -> u64 {
    // 1 GiB
    1024 * 1024 * 1024
}

fn default_close_delay() -> u64 {
    5
}

fn default_encoding() -> String {
    "ISO_IR 100".to_string()
}

fn default_json_string_len() -> usize {
    256
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        ArchiveConfig {
            storage_root: PathBuf::from("./data/storage"),
            index_path: None,
            local_aet: default_local_aet(),
            compression: false,
            store_md5: true,
            max_patient_count: 0,
            max_storage_size: 0,
            dicom_cache_capacity: default_cache_capacity(),
            job_limit: default_job_limit(),
            job_queue_size_limit: default_job_queue_bytes(),
            peer_close_delay_secs: default_close_delay(),
            default_encoding: default_encoding(),
            max_json_string_len: default_json_string_len(),
        }
    }
}
