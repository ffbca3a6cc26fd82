//! Zlib压缩编解码
//!
//! 磁盘格式：8字节头 `[compressed_size u32 LE, uncompressed_size u32 LE]`
//! 紧跟Zlib流。compressed_size 不含头部自身。

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use medvault_core::{ArchiveError, Result};
use std::io::{Read, Write};

const HEADER_LEN: usize = 8;

/// 压缩并封装头部
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| ArchiveError::internal(format!("zlib compression failed: {e}")))?;
    let stream = encoder
        .finish()
        .map_err(|e| ArchiveError::internal(format!("zlib compression failed: {e}")))?;

    let mut payload = Vec::with_capacity(HEADER_LEN + stream.len());
    payload.extend_from_slice(&(stream.len() as u32).to_le_bytes());
    payload.extend_from_slice(&(data.len() as u32).to_le_bytes());
    payload.extend_from_slice(&stream);
    Ok(payload)
}

/// 解析头部并解压，任何不一致都判定为损坏
pub fn decompress(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() < HEADER_LEN {
        return Err(ArchiveError::CorruptedFile(
            "zlib payload shorter than its header".to_string(),
        ));
    }

    let compressed_size = u32::from_le_bytes(payload[0..4].try_into().unwrap()) as usize;
    let uncompressed_size = u32::from_le_bytes(payload[4..8].try_into().unwrap()) as usize;

    if payload.len() - HEADER_LEN != compressed_size {
        return Err(ArchiveError::CorruptedFile(format!(
            "zlib payload size mismatch: header says {}, found {}",
            compressed_size,
            payload.len() - HEADER_LEN
        )));
    }

    let mut decoder = ZlibDecoder::new(&payload[HEADER_LEN..]);
    let mut data = Vec::with_capacity(uncompressed_size);
    decoder
        .read_to_end(&mut data)
        .map_err(|e| ArchiveError::CorruptedFile(format!("zlib stream rejected: {e}")))?;

    if data.len() != uncompressed_size {
        return Err(ArchiveError::CorruptedFile(format!(
            "uncompressed size mismatch: header says {}, got {}",
            uncompressed_size,
            data.len()
        )));
    }

    Ok(data)
}
