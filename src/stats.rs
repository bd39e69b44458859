//! 전송 통계

use std::time::{Duration, Instant};

/// 전체 전송 통계
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 총 파일 수
    pub total_files: u64,

    /// 완료된 파일 수
    pub completed_files: u64,

    /// 총 전송 바이트 (청크 데이터 기준)
    pub total_bytes: u64,

    /// 총 청크 수
    pub total_chunks: u64,

    /// 중복 수신 청크 수
    pub duplicate_chunks: u64,

    /// 무시된 청크 수 (알 수 없는 파일 인덱스 등)
    pub ignored_chunks: u64,

    /// 진행률 메시지 수
    pub progress_updates: u64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_files: 0,
            completed_files: 0,
            total_bytes: 0,
            total_chunks: 0,
            duplicate_chunks: 0,
            ignored_chunks: 0,
            progress_updates: 0,
        }
    }

    /// 청크 기록
    pub fn record_chunk(&mut self, size: usize) {
        self.total_chunks += 1;
        self.total_bytes += size as u64;
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 전체 처리율 (bytes/sec)
    pub fn overall_throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.total_bytes as f64 / elapsed
    }

    /// 중복 비율
    pub fn duplicate_ratio(&self) -> f64 {
        if self.total_chunks == 0 {
            return 0.0;
        }
        self.duplicate_chunks as f64 / self.total_chunks as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Files: {}/{} | Chunks: {} | Bytes: {} | Throughput: {:.2} MB/s | Duplicates: {:.2}%",
            self.elapsed().as_secs_f64(),
            self.completed_files,
            self.total_files,
            self.total_chunks,
            self.total_bytes,
            self.overall_throughput() / 1_000_000.0,
            self.duplicate_ratio() * 100.0,
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}
