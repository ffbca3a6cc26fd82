//! Blob存储区
//!
//! 文件按 `<aa>/<bb>/<uuid>` 两级扇出存放，aa、bb 取UUID的前两个
//! 十六进制字节对。写入先落到同目录的临时文件再重命名，保证不会
//! 暴露半写的Blob。

use async_trait::async_trait;
use medvault_core::{ArchiveError, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Blob存储协作方接口：put 成功返回即保证持久
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, uuid: &str, data: &[u8]) -> Result<()>;
    async fn get(&self, uuid: &str) -> Result<Vec<u8>>;
    async fn delete(&self, uuid: &str) -> Result<()>;
}

/// 本地文件系统实现
pub struct FilesystemBlobStore {
    root: PathBuf,
}

impl FilesystemBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FilesystemBlobStore { root: root.into() }
    }

    fn blob_path(&self, uuid: &str) -> Result<PathBuf> {
        if uuid.len() < 4 || uuid.contains('/') || uuid.contains('\\') || uuid.contains("..") {
            return Err(ArchiveError::BadRequest(format!("invalid blob id: {uuid}")));
        }
        Ok(self.root.join(&uuid[0..2]).join(&uuid[2..4]).join(uuid))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl BlobStore for FilesystemBlobStore {
    async fn put(&self, uuid: &str, data: &[u8]) -> Result<()> {
        let path = self.blob_path(uuid)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // 先写临时文件再原子重命名
        let staging = path.with_extension("tmp");
        tokio::fs::write(&staging, data).await?;
        tokio::fs::rename(&staging, &path).await?;

        debug!("stored blob {} ({} bytes)", uuid, data.len());
        Ok(())
    }

    async fn get(&self, uuid: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(uuid)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ArchiveError::InexistentFile(uuid.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, uuid: &str) -> Result<()> {
        let path = self.blob_path(uuid)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!("removed blob {}", uuid);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
