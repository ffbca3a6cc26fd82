//! # MedVault Index
//!
//! 四级层级（患者 → 检查 → 系列 → 实例）的事务性关系索引，
//! 基于SQLite单写者引擎，同时承载变更日志与回收顺序。

pub mod changes;
pub mod connection;
pub mod store;

pub use connection::IndexConnection;
pub use store::{IndexStore, InstanceToIndex, RecyclingQuotas, StoreReport};
