//! # MedVault Core
//!
//! 影像归档系统的核心模块，提供基础数据结构、错误定义和通用工具。

pub mod config;
pub mod error;
pub mod models;
pub mod utils;

pub use config::ArchiveConfig;
pub use error::{ArchiveError, Result};
pub use models::*;
