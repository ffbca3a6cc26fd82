//! # MedVault Storage
//!
//! 以内容地址（36字符UUID）组织的Blob存储，以及带可选压缩与MD5
//! 摘要的存储访问器。

pub mod accessor;
pub mod area;
pub mod compression;

pub use accessor::StorageAccessor;
pub use area::{BlobStore, FilesystemBlobStore};
