//! 진행률 계산
//!
//! 값은 모두 백분율 (0.0 ~ 100.0)

use crate::chunk::{ChunkIndex, FileIndex};
use crate::message::ProgressUpdateMessage;

/// transfer-complete 이전에 표시할 수 있는 최대 전체 진행률
pub const PRE_COMPLETION_CAP: f64 = 99.0;

/// 파일 진행률 = (chunk + 1) / total_chunks
pub fn file_progress(chunk_index: ChunkIndex, total_chunks: u32) -> f64 {
    if total_chunks == 0 {
        return 100.0;
    }
    ((chunk_index as f64 + 1.0) / total_chunks as f64 * 100.0).min(100.0)
}

/// 전체 진행률 = (완료 파일 수 + 현재 파일 비율) / 전체 파일 수
pub fn overall_progress(file_index: FileIndex, total_files: u32, file_progress: f64) -> f64 {
    if total_files == 0 {
        return 100.0;
    }
    let completed = file_index as f64;
    ((completed + file_progress / 100.0) / total_files as f64 * 100.0).min(100.0)
}

/// 진행률 메시지 전송 여부 (every번째 청크와 파일의 마지막 청크)
pub fn should_report(chunk_index: ChunkIndex, total_chunks: u32, every: u32) -> bool {
    let position = chunk_index + 1;
    position == total_chunks || (every > 0 && position % every == 0)
}

/// 수신측 진행률 스냅샷
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressSnapshot {
    pub file_index: Option<FileIndex>,
    pub file_name: String,
    pub file_progress: f64,
    pub overall_progress: f64,
    pub completed: bool,
}

/// 수신측 진행률 추적기
///
/// 파일 안에서는 감소하지 않고, 전체 100%는 완료 처리 뒤에만 나옴
#[derive(Debug, Default)]
pub struct ProgressTracker {
    snapshot: ProgressSnapshot,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 진행률 메시지 반영
    pub fn apply(&mut self, update: &ProgressUpdateMessage) -> &ProgressSnapshot {
        if self.snapshot.completed {
            return &self.snapshot;
        }

        let same_file = self.snapshot.file_index == Some(update.file_index);
        let file_progress = update.file_progress.clamp(0.0, 100.0);

        self.snapshot.file_progress = if same_file {
            self.snapshot.file_progress.max(file_progress)
        } else {
            file_progress
        };
        self.snapshot.file_index = Some(update.file_index);
        self.snapshot.file_name = update.file_name.clone();

        let overall = update.overall_progress.clamp(0.0, PRE_COMPLETION_CAP);
        self.snapshot.overall_progress = self.snapshot.overall_progress.max(overall);

        &self.snapshot
    }

    /// 전송 완료 처리
    pub fn complete(&mut self) -> &ProgressSnapshot {
        self.snapshot.file_progress = 100.0;
        self.snapshot.overall_progress = 100.0;
        self.snapshot.completed = true;
        &self.snapshot
    }

    pub fn snapshot(&self) -> &ProgressSnapshot {
        &self.snapshot
    }
}
