//! 错误定义模块

use thiserror::Error;

/// 归档系统统一错误类型
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("DICOM流格式错误: {0}")]
    BadFileFormat(String),

    #[error("缺少必需的DICOM标签: {0}")]
    InexistentTag(String),

    #[error("资源不存在: {0}")]
    InexistentItem(String),

    #[error("文件不存在: {0}")]
    InexistentFile(String),

    #[error("文件内容损坏: {0}")]
    CorruptedFile(String),

    #[error("存储空间已满，无法回收")]
    FullStorage,

    #[error("数据库错误: {0}")]
    Database(String),

    #[error("网络协议错误: {0}")]
    NetworkProtocol(String),

    #[error("无效请求: {0}")]
    BadRequest(String),

    #[error("未授权: {0}")]
    Unauthorized(String),

    #[error("未实现: {0}")]
    NotImplemented(String),

    #[error("系统内部错误: {0}")]
    InternalError(String),

    #[error("操作已取消")]
    Cancelled,
}

impl ArchiveError {
    pub fn bad_file_format(message: impl Into<String>) -> Self {
        ArchiveError::BadFileFormat(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ArchiveError::InternalError(message.into())
    }
}

impl From<std::io::Error> for ArchiveError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => ArchiveError::InexistentFile(e.to_string()),
            _ => ArchiveError::InternalError(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for ArchiveError {
    fn from(e: serde_json::Error) -> Self {
        ArchiveError::CorruptedFile(e.to_string())
    }
}

/// 归档系统统一结果类型
pub type Result<T> = std::result::Result<T, ArchiveError>;
