//! # MedVault DICOM
//!
//! DICOM数据模型：标签与映射原语、字符集处理、规范JSON投影，
//! 以及基于 `dicom-object` 的解析与序列化桥接。

pub mod encoding;
pub mod hasher;
pub mod json;
pub mod map;
pub mod parser;
pub mod tags;

pub use encoding::DicomEncoding;
pub use hasher::InstanceIdentity;
pub use json::JsonFormat;
pub use map::{DicomMap, DicomValue};
pub use parser::Dataset;
pub use tags::DicomTag;
