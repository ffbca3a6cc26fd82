//! 存储访问器
//!
//! 在Blob存储区之上实现压缩与MD5记账。读取时按附件记录的压缩
//! 方式还原，调用方拿到的 `AttachmentInfo` 即是索引中的附件行。

use crate::area::BlobStore;
use crate::compression;
use md5::{Digest, Md5};
use medvault_core::utils::generate_uuid;
use medvault_core::{ArchiveError, AttachmentInfo, CompressionKind, ContentType, Result};
use std::sync::Arc;

/// 带压缩策略的存储访问器
pub struct StorageAccessor {
    store: Arc<dyn BlobStore>,
    compression: CompressionKind,
    store_md5: bool,
}

impl StorageAccessor {
    pub fn new(store: Arc<dyn BlobStore>, compression: CompressionKind, store_md5: bool) -> Self {
        StorageAccessor {
            store,
            compression,
            store_md5,
        }
    }

    /// 写入一个附件，返回描述其尺寸与摘要的附件信息
    ///
    /// 同样的字节写两次会得到两个不同的UUID，去重不是这里的职责。
    pub async fn write(&self, data: &[u8], content_type: ContentType) -> Result<AttachmentInfo> {
        let uuid = generate_uuid();
        let uncompressed_md5 = self.store_md5.then(|| hex_md5(data));

        match self.compression {
            CompressionKind::None => {
                self.store.put(&uuid, data).await?;
                Ok(AttachmentInfo {
                    uuid,
                    content_type,
                    compressed_size: data.len() as u64,
                    uncompressed_size: data.len() as u64,
                    compression: CompressionKind::None,
                    compressed_md5: uncompressed_md5.clone(),
                    uncompressed_md5,
                })
            }
            CompressionKind::Zlib => {
                let packed = compression::compress(data)?;
                let compressed_md5 = self.store_md5.then(|| hex_md5(&packed));
                self.store.put(&uuid, &packed).await?;
                Ok(AttachmentInfo {
                    uuid,
                    content_type,
                    compressed_size: packed.len() as u64,
                    uncompressed_size: data.len() as u64,
                    compression: CompressionKind::Zlib,
                    uncompressed_md5,
                    compressed_md5,
                })
            }
        }
    }

    /// 读取附件内容
    ///
    /// `decompress` 为真时无论磁盘形态如何都返回未压缩的字节。
    pub async fn read(&self, attachment: &AttachmentInfo, decompress: bool) -> Result<Vec<u8>> {
        let raw = self.store.get(&attachment.uuid).await?;
        match (attachment.compression, decompress) {
            (CompressionKind::None, _) | (CompressionKind::Zlib, false) => Ok(raw),
            (CompressionKind::Zlib, true) => {
                let data = compression::decompress(&raw)?;
                if data.len() as u64 != attachment.uncompressed_size {
                    return Err(ArchiveError::CorruptedFile(format!(
                        "attachment {} does not match its recorded size",
                        attachment.uuid
                    )));
                }
                Ok(data)
            }
        }
    }

    /// 删除附件对应的Blob
    pub async fn remove(&self, uuid: &str) -> Result<()> {
        self.store.delete(uuid).await
    }
}

fn hex_md5(data: &[u8]) -> String {
    let digest = Md5::digest(data);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
