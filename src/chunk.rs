//! 파일과 청크 정의
//!
//! - FileDescriptor: 전송 대상 파일 메타데이터
//! - ChunkMessage: 파일의 고정 크기 바이트 구간 (청크 인덱스로 조립)
//! - FileAssembly: 수신측 파일 단위 조립 버퍼

use std::collections::BTreeMap;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;

use crate::{Error, Result};

/// 파일 인덱스 (전송 세션 내 순번)
pub type FileIndex = u32;

/// 청크 인덱스 (파일 내 순번)
pub type ChunkIndex = u32;

/// 기본 MIME 타입
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// 파일 크기 기준 청크 수 (올림)
pub fn total_chunks(size: u64, chunk_size: usize) -> u32 {
    if chunk_size == 0 {
        return 0;
    }
    size.div_ceil(chunk_size as u64) as u32
}

/// 청크가 담당하는 바이트 구간 `[i*C, min((i+1)*C, size))`
pub fn chunk_range(chunk_index: ChunkIndex, size: u64, chunk_size: usize) -> Range<u64> {
    let start = (chunk_index as u64 * chunk_size as u64).min(size);
    let end = (start + chunk_size as u64).min(size);
    start..end
}

/// 경로의 디렉터리 부분 ("/a/b/c.txt" -> "/a/b", "/c.txt" -> "/")
pub fn directory_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// 확장자 기반 MIME 추정
pub fn guess_mime_type(name: &str) -> &'static str {
    let ext = match name.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => return DEFAULT_MIME_TYPE,
    };

    match ext.as_str() {
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => DEFAULT_MIME_TYPE,
    }
}

/// 파일 메타데이터
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    /// 파일 이름
    pub name: String,

    /// MIME 타입
    pub mime_type: String,

    /// 파일 크기 (바이트)
    pub size: u64,

    /// 디렉터리 문맥을 포함한 경로 (없으면 "/name")
    pub path: String,

    /// 총 청크 수 = ceil(size / chunk_size)
    pub total_chunks: u32,
}

impl FileDescriptor {
    pub fn new(name: impl Into<String>, size: u64, chunk_size: usize) -> Self {
        let name = name.into();
        Self {
            mime_type: guess_mime_type(&name).to_string(),
            path: format!("/{}", name),
            total_chunks: total_chunks(size, chunk_size),
            name,
            size,
        }
    }

    /// 디렉터리 문맥 경로 지정
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.path = if path.starts_with('/') {
            path
        } else {
            format!("/{}", path)
        };
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    /// 경로의 디렉터리 부분
    pub fn directory(&self) -> &str {
        directory_of(&self.path)
    }
}

/// 청크 메시지
///
/// 불변식: `0 <= chunk_index < total_chunks`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMessage {
    pub file_index: FileIndex,
    pub chunk_index: ChunkIndex,
    pub total_chunks: u32,
    pub data: Bytes,
}

/// 송신 파일의 데이터 원천
#[derive(Debug, Clone)]
pub enum FileSource {
    /// 메모리 버퍼
    Memory(Bytes),

    /// 디스크 파일 (청크 단위로 읽음)
    Disk(PathBuf),
}

/// 송신 대상 파일
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub descriptor: FileDescriptor,

    /// 수정 시각 (ms since epoch)
    pub last_modified: u64,

    pub source: FileSource,
}

impl OutgoingFile {
    /// 메모리 데이터로 생성
    pub fn from_bytes(name: impl Into<String>, data: impl Into<Bytes>, chunk_size: usize) -> Self {
        let data = data.into();
        Self {
            descriptor: FileDescriptor::new(name, data.len() as u64, chunk_size),
            last_modified: now_millis(),
            source: FileSource::Memory(data),
        }
    }

    /// 디스크 파일로 생성
    ///
    /// `relative`가 있으면 그 경로를 디렉터리 문맥으로 사용
    pub async fn open(path: &Path, relative: Option<&str>, chunk_size: usize) -> Result<Self> {
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("일반 파일이 아님: {}", path.display()),
            )));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());

        let last_modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let mut descriptor = FileDescriptor::new(name, metadata.len(), chunk_size);
        if let Some(relative) = relative {
            descriptor = descriptor.with_path(relative);
        }

        Ok(Self {
            descriptor,
            last_modified,
            source: FileSource::Disk(path.to_path_buf()),
        })
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.descriptor = self.descriptor.with_path(path);
        self
    }

    /// 청크 리더 생성
    pub async fn reader(&self, chunk_size: usize) -> Result<ChunkReader> {
        let source = match &self.source {
            FileSource::Memory(data) => ReaderSource::Memory(data.clone()),
            FileSource::Disk(path) => ReaderSource::Disk(tokio::fs::File::open(path).await?),
        };

        Ok(ChunkReader {
            source,
            size: self.descriptor.size,
            chunk_size,
            next_index: 0,
            total_chunks: total_chunks(self.descriptor.size, chunk_size),
        })
    }
}

enum ReaderSource {
    Memory(Bytes),
    Disk(tokio::fs::File),
}

/// 파일을 청크 순서대로 읽는 리더
pub struct ChunkReader {
    source: ReaderSource,
    size: u64,
    chunk_size: usize,
    next_index: ChunkIndex,
    total_chunks: u32,
}

impl ChunkReader {
    /// 다음 청크 (모두 읽었으면 None)
    pub async fn next_chunk(&mut self) -> Result<Option<(ChunkIndex, Bytes)>> {
        if self.next_index >= self.total_chunks {
            return Ok(None);
        }

        let index = self.next_index;
        let range = chunk_range(index, self.size, self.chunk_size);

        let data = match &mut self.source {
            ReaderSource::Memory(data) => {
                let start = range.start as usize;
                let end = (range.end as usize).min(data.len());
                if start > end {
                    return Err(Error::Transfer(format!(
                        "버퍼 크기 부족: chunk={}, len={}",
                        index,
                        data.len()
                    )));
                }
                data.slice(start..end)
            }
            ReaderSource::Disk(file) => {
                let mut buf = BytesMut::zeroed((range.end - range.start) as usize);
                file.read_exact(&mut buf).await?;
                buf.freeze()
            }
        };

        if data.len() as u64 != range.end - range.start {
            return Err(Error::Transfer(format!(
                "청크 길이 불일치: chunk={}, expected={}, got={}",
                index,
                range.end - range.start,
                data.len()
            )));
        }

        self.next_index += 1;
        Ok(Some((index, data)))
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }
}

/// 조립 완료된 수신 파일
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub descriptor: FileDescriptor,
    pub data: Bytes,
}

impl ReceivedFile {
    pub fn directory(&self) -> &str {
        self.descriptor.directory()
    }
}

/// 파일 조립 버퍼 (수신측)
///
/// 진행 중인 파일만 청크 맵을 보유하고, 완료 후에는 최종 버퍼만 남음
#[derive(Debug)]
pub struct FileAssembly {
    pub descriptor: FileDescriptor,

    /// chunk_index -> 데이터
    chunks: BTreeMap<ChunkIndex, Bytes>,

    /// 생성 시간
    pub created_at: Instant,
}

impl FileAssembly {
    pub fn new(descriptor: FileDescriptor) -> Self {
        Self {
            descriptor,
            chunks: BTreeMap::new(),
            created_at: Instant::now(),
        }
    }

    /// 청크 삽입
    ///
    /// 새 인덱스면 true, 중복(덮어쓰기)이거나 범위 밖이면 false
    pub fn insert_chunk(&mut self, chunk_index: ChunkIndex, data: Bytes) -> bool {
        if chunk_index >= self.descriptor.total_chunks {
            return false;
        }
        self.chunks.insert(chunk_index, data).is_none()
    }

    /// 완료 여부 확인
    pub fn is_complete(&self) -> bool {
        self.chunks.len() as u32 >= self.descriptor.total_chunks
    }

    pub fn received_count(&self) -> u32 {
        self.chunks.len() as u32
    }

    /// 누락된 청크 인덱스 목록
    pub fn missing_chunk_ids(&self) -> Vec<ChunkIndex> {
        (0..self.descriptor.total_chunks)
            .filter(|idx| !self.chunks.contains_key(idx))
            .collect()
    }

    /// 인덱스 순서로 이어 붙여 완성 파일 생성
    pub fn into_file(self) -> Result<ReceivedFile> {
        let mut data = BytesMut::with_capacity(self.descriptor.size as usize);
        for chunk in self.chunks.into_values() {
            data.extend_from_slice(&chunk);
        }

        if data.len() as u64 != self.descriptor.size {
            return Err(Error::Transfer(format!(
                "파일 크기 불일치: {} (expected {}, got {})",
                self.descriptor.name,
                self.descriptor.size,
                data.len()
            )));
        }

        Ok(ReceivedFile {
            descriptor: self.descriptor,
            data: data.freeze(),
        })
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_CHUNK_SIZE;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_total_chunks_is_ceiling() {
        let kb = 1024u64;
        assert_eq!(total_chunks(0, DEFAULT_CHUNK_SIZE), 0);
        assert_eq!(total_chunks(1, DEFAULT_CHUNK_SIZE), 1);
        assert_eq!(total_chunks(10 * kb, DEFAULT_CHUNK_SIZE), 1);
        assert_eq!(total_chunks(64 * kb, DEFAULT_CHUNK_SIZE), 1);
        assert_eq!(total_chunks(64 * kb + 1, DEFAULT_CHUNK_SIZE), 2);
        assert_eq!(total_chunks(70 * kb, DEFAULT_CHUNK_SIZE), 2);
        assert_eq!(total_chunks(130 * kb, DEFAULT_CHUNK_SIZE), 3);
    }

    #[test]
    fn test_chunk_range_covers_file() {
        assert_eq!(chunk_range(0, 250, 100), 0..100);
        assert_eq!(chunk_range(2, 250, 100), 200..250);
        assert_eq!(chunk_range(3, 250, 100), 250..250);
    }

    #[test]
    fn test_descriptor_defaults() {
        let desc = FileDescriptor::new("photo.JPG", 10, 4);
        assert_eq!(desc.path, "/photo.JPG");
        assert_eq!(desc.mime_type, "image/jpeg");
        assert_eq!(desc.total_chunks, 3);
        assert_eq!(desc.directory(), "/");

        let nested = desc.with_path("album/2024/photo.JPG");
        assert_eq!(nested.path, "/album/2024/photo.JPG");
        assert_eq!(nested.directory(), "/album/2024");
        assert_eq!(FileDescriptor::new("README", 0, 4).mime_type, DEFAULT_MIME_TYPE);
    }

    #[tokio::test]
    async fn test_reader_splits_memory_file() {
        let data = pattern(250);
        let file = OutgoingFile::from_bytes("a.bin", data.clone(), 100);
        let mut reader = file.reader(100).await.unwrap();

        let mut lens = Vec::new();
        let mut joined = Vec::new();
        while let Some((idx, chunk)) = reader.next_chunk().await.unwrap() {
            assert_eq!(idx as usize, lens.len());
            lens.push(chunk.len());
            joined.extend_from_slice(&chunk);
        }

        assert_eq!(lens, vec![100, 100, 50]);
        assert_eq!(joined, data);
    }

    #[tokio::test]
    async fn test_reader_reads_disk_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.bin");
        let data = pattern(1000);
        std::fs::write(&path, &data).unwrap();

        let file = OutgoingFile::open(&path, Some("docs/disk.bin"), 300).await.unwrap();
        assert_eq!(file.descriptor.size, 1000);
        assert_eq!(file.descriptor.path, "/docs/disk.bin");
        assert_eq!(file.descriptor.total_chunks, 4);

        let mut reader = file.reader(300).await.unwrap();
        let mut joined = Vec::new();
        while let Some((_, chunk)) = reader.next_chunk().await.unwrap() {
            joined.extend_from_slice(&chunk);
        }
        assert_eq!(joined, data);
    }

    #[tokio::test]
    async fn test_reader_fails_when_file_shrinks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shrink.bin");
        std::fs::write(&path, pattern(500)).unwrap();

        let file = OutgoingFile::open(&path, None, 200).await.unwrap();
        std::fs::write(&path, pattern(100)).unwrap();

        let mut reader = file.reader(200).await.unwrap();
        let mut failed = false;
        loop {
            match reader.next_chunk().await {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => {
                    failed = true;
                    break;
                }
            }
        }
        assert!(failed);
    }

    #[test]
    fn test_assembly_out_of_order() {
        let data = pattern(250);
        let desc = FileDescriptor::new("x.bin", 250, 100);
        let mut assembly = FileAssembly::new(desc);

        assert!(assembly.insert_chunk(2, Bytes::copy_from_slice(&data[200..250])));
        assert!(assembly.insert_chunk(0, Bytes::copy_from_slice(&data[0..100])));
        assert_eq!(assembly.missing_chunk_ids(), vec![1]);
        assert!(!assembly.is_complete());

        // 중복은 덮어쓰기
        assert!(!assembly.insert_chunk(0, Bytes::copy_from_slice(&data[0..100])));
        // 범위 밖은 무시
        assert!(!assembly.insert_chunk(3, Bytes::from_static(b"zz")));

        assert!(assembly.insert_chunk(1, Bytes::copy_from_slice(&data[100..200])));
        assert!(assembly.is_complete());

        let file = assembly.into_file().unwrap();
        assert_eq!(file.data.as_ref(), data.as_slice());
    }

    #[test]
    fn test_assembly_rejects_size_mismatch() {
        let desc = FileDescriptor::new("short.bin", 150, 100);
        let mut assembly = FileAssembly::new(desc);
        assembly.insert_chunk(0, Bytes::from(vec![0u8; 100]));
        assembly.insert_chunk(1, Bytes::from(vec![0u8; 10]));

        assert!(matches!(assembly.into_file(), Err(Error::Transfer(_))));
    }
}
