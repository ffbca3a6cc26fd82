//! # MedVault Engine
//!
//! 归档核心的编排层：入库流水线、监听者总线、已解析实例缓存、
//! 结构化检索引擎、远端节点连接池，以及把它们拼装起来的
//! `ArchiveContext` 上下文句柄。

pub mod cache;
pub mod context;
pub mod ingest;
pub mod listener;
pub mod lookup;
pub mod peers;

pub use cache::{DatasetProvider, DicomCache};
pub use context::ArchiveContext;
pub use ingest::StoreRequest;
pub use listener::{ArchiveListener, ListenerBus};
pub use lookup::{Constraint, Predicate, Query};
pub use peers::{PeerConfig, PeerPool, PeerTransport, PeerTransportFactory, StorePeerCommand};
