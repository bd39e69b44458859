//! 청크 전송 디코더 (수신측)
//!
//! file_index별 조립 버퍼를 관리하고, 완료된 파일을 디렉터리별로 묶어 넘김.
//! 멈춘 청크에 대한 타임아웃이나 재요청은 없음 (전송 계층이 신뢰성 보장)
//!
//! 상대가 알려준 크기는 조립 버퍼를 잡기 전에 로컬 설정으로 검증함:
//! - 파일 크기와 누적 크기는 `max_transfer_size` 이하
//! - `total_chunks == ceil(file_size / chunk_size)`
//! - 각 청크 길이는 `chunk_range`와 일치

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, trace};

use crate::chunk::{chunk_range, total_chunks, ChunkIndex, FileAssembly, FileDescriptor, FileIndex, ReceivedFile};
use crate::message::{FileInfoMessage, Message};
use crate::progress::{ProgressSnapshot, ProgressTracker};
use crate::stats::TransferStats;
use crate::error::ValidationError;
use crate::{Config, Error, Result};

/// 메시지 처리 결과
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeEvent {
    /// 새 파일 시작
    FileStarted(FileIndex),

    /// 청크 저장
    ChunkStored {
        file_index: FileIndex,
        chunk_index: ChunkIndex,
    },

    /// 파일 조립 완료
    FileCompleted(FileIndex),

    /// 진행률 갱신
    Progress(ProgressSnapshot),

    /// 전송 완료
    Complete,

    /// 무시된 메시지 (알 수 없는 파일, 범위 밖 청크)
    Ignored,
}

/// 같은 디렉터리에 속한 완료 파일 묶음
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileGroup {
    pub directory: String,
    pub files: Vec<ReceivedFile>,
}

/// 청크 전송 디코더
#[derive(Debug)]
pub struct TransferDecoder {
    /// 진행 중인 파일
    files: HashMap<FileIndex, FileAssembly>,

    /// 완료된 파일 (file_index 순)
    completed: BTreeMap<FileIndex, ReceivedFile>,

    total_files: Option<u32>,

    /// 지금까지 file-info로 알려진 크기 합
    announced_bytes: u64,

    chunk_size: usize,
    max_transfer_size: u64,
    tracker: ProgressTracker,
    stats: TransferStats,
    finished: bool,
}

impl TransferDecoder {
    pub fn new(config: &Config) -> Self {
        Self {
            files: HashMap::new(),
            completed: BTreeMap::new(),
            total_files: None,
            announced_bytes: 0,
            chunk_size: config.chunk_size,
            max_transfer_size: config.max_transfer_size,
            tracker: ProgressTracker::new(),
            stats: TransferStats::new(),
            finished: false,
        }
    }

    /// 전송 메시지 처리
    ///
    /// `transfer-error`는 `Error::Transfer`로 돌려줌
    pub fn handle(&mut self, message: Message) -> Result<DecodeEvent> {
        match message {
            Message::FileInfo(info) => self.on_file_info(info),
            Message::FileChunk(chunk) => {
                let file_index = chunk.file_index;
                let chunk_index = chunk.chunk_index;

                let assembly = match self.files.get_mut(&file_index) {
                    Some(assembly) => assembly,
                    None => {
                        trace!("chunk for unknown file {} ignored", file_index);
                        self.stats.ignored_chunks += 1;
                        return Ok(DecodeEvent::Ignored);
                    }
                };

                if chunk_index >= assembly.descriptor.total_chunks {
                    self.stats.ignored_chunks += 1;
                    return Ok(DecodeEvent::Ignored);
                }

                let len = chunk.data.len();
                let range = chunk_range(chunk_index, assembly.descriptor.size, self.chunk_size);
                if len as u64 != range.end - range.start {
                    return Err(Error::Transfer(format!(
                        "청크 길이 불일치: file={}, chunk={}, expected={}, got={}",
                        file_index,
                        chunk_index,
                        range.end - range.start,
                        len
                    )));
                }

                if !assembly.insert_chunk(chunk_index, chunk.data) {
                    self.stats.duplicate_chunks += 1;
                }
                self.stats.record_chunk(len);

                if assembly.is_complete() {
                    self.complete_file(file_index)?;
                    return Ok(DecodeEvent::FileCompleted(file_index));
                }

                Ok(DecodeEvent::ChunkStored {
                    file_index,
                    chunk_index,
                })
            }
            Message::ProgressUpdate(update) => {
                self.stats.progress_updates += 1;
                Ok(DecodeEvent::Progress(self.tracker.apply(&update).clone()))
            }
            Message::TransferComplete => {
                self.finished = true;
                self.tracker.complete();
                debug!("Transfer complete: {}", self.stats.summary());
                Ok(DecodeEvent::Complete)
            }
            Message::TransferError(err) => Err(Error::Transfer(err.message)),
            other => Err(Error::UnexpectedMessage {
                expected: "transfer message".to_string(),
                got: other.type_name().to_string(),
            }),
        }
    }

    fn on_file_info(&mut self, info: FileInfoMessage) -> Result<DecodeEvent> {
        let file_index = info.file_index;

        // 진행 중이거나 완료된 파일은 다시 시작하지 않음
        if self.files.contains_key(&file_index) || self.completed.contains_key(&file_index) {
            debug!("repeated file-info for file {} ignored", file_index);
            return Ok(DecodeEvent::Ignored);
        }

        let announced = self.announced_bytes.saturating_add(info.file_size);
        if info.file_size > self.max_transfer_size || announced > self.max_transfer_size {
            return Err(ValidationError::TransferTooLarge {
                size: announced,
                limit: self.max_transfer_size,
            }
            .into());
        }

        let expected_chunks = total_chunks(info.file_size, self.chunk_size);
        if info.total_chunks != expected_chunks {
            return Err(Error::Transfer(format!(
                "청크 수 불일치: file={}, size={}, expected={}, got={}",
                file_index, info.file_size, expected_chunks, info.total_chunks
            )));
        }
        self.announced_bytes = announced;

        let descriptor = FileDescriptor {
            name: info.file_name,
            mime_type: info.file_type,
            size: info.file_size,
            path: info.file_path,
            total_chunks: info.total_chunks,
        };

        debug!(
            "receiving file {}/{}: {} ({} bytes, {} chunks)",
            file_index + 1,
            info.total_files,
            descriptor.name,
            descriptor.size,
            descriptor.total_chunks
        );

        self.total_files = Some(info.total_files);
        self.stats.total_files = info.total_files as u64;
        self.files.insert(file_index, FileAssembly::new(descriptor));

        // 빈 파일은 청크 없이 바로 완료
        if info.total_chunks == 0 {
            self.complete_file(file_index)?;
            return Ok(DecodeEvent::FileCompleted(file_index));
        }

        Ok(DecodeEvent::FileStarted(file_index))
    }

    fn complete_file(&mut self, file_index: FileIndex) -> Result<()> {
        if let Some(assembly) = self.files.remove(&file_index) {
            let file = assembly.into_file()?;
            debug!("file {} assembled: {}", file_index, file.descriptor.path);
            self.completed.insert(file_index, file);
            self.stats.completed_files += 1;
        }
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn progress(&self) -> &ProgressSnapshot {
        self.tracker.snapshot()
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    pub fn total_files(&self) -> Option<u32> {
        self.total_files
    }

    /// 완료된 파일 (file_index 순)
    pub fn completed_files(&self) -> impl Iterator<Item = &ReceivedFile> {
        self.completed.values()
    }

    /// 진행 중인 파일과 누락 청크
    pub fn pending(&self) -> Vec<(FileIndex, Vec<ChunkIndex>)> {
        let mut pending: Vec<_> = self
            .files
            .iter()
            .map(|(idx, assembly)| (*idx, assembly.missing_chunk_ids()))
            .collect();
        pending.sort_by_key(|(idx, _)| *idx);
        pending
    }

    /// 완료 파일을 디렉터리별로 묶음
    ///
    /// 묶음 순서는 각 디렉터리의 첫 파일 인덱스 순
    pub fn into_groups(self) -> Vec<FileGroup> {
        let mut groups: Vec<FileGroup> = Vec::new();
        for file in self.completed.into_values() {
            let directory = file.directory().to_string();
            match groups.iter_mut().find(|g| g.directory == directory) {
                Some(group) => group.files.push(file),
                None => groups.push(FileGroup {
                    directory,
                    files: vec![file],
                }),
            }
        }
        groups
    }
}
