//! 通用工具函数

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

/// 生成36字符的随机标识符，用于患者公开ID与附件ID
pub fn generate_uuid() -> String {
    Uuid::new_v4().to_string()
}

/// 校验是否为36字符的连字符UUID
pub fn is_uuid(value: &str) -> bool {
    Uuid::parse_str(value).is_ok() && value.len() == 36
}

/// 当前时刻的ISO-8601字符串（UTC，秒精度）
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// 格式化任意时间点为ISO-8601字符串
pub fn to_iso8601(instant: &DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Secs, true)
}
