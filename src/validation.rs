//! 전송 전 로컬 검증
//!
//! - 전송 한 건의 크기 한도 (설정값 하나)
//! - 일일 전송량 한도
//!
//! 검증은 네트워크 I/O 이전에 끝나며, 실패하면 아무것도 보내지 않음

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::chunk::{FileDescriptor, OutgoingFile};
use crate::error::ValidationError;
use crate::message::FileListEntry;
use crate::{Config, Result};

const SECS_PER_DAY: u64 = 86_400;

fn day_index(now: SystemTime) -> u64 {
    now.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() / SECS_PER_DAY)
        .unwrap_or(0)
}

/// 일일 전송량 한도 (UTC 날짜 기준으로 초기화)
#[derive(Debug, Clone)]
pub struct DailyQuota {
    limit: u64,
    used: u64,
    day: u64,
}

impl DailyQuota {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            used: 0,
            day: day_index(SystemTime::now()),
        }
    }

    /// 남은 용량
    pub fn remaining(&self, now: SystemTime) -> u64 {
        if day_index(now) != self.day {
            return self.limit;
        }
        self.limit.saturating_sub(self.used)
    }

    /// 한도 확인만 함
    pub fn check(&self, bytes: u64, now: SystemTime) -> std::result::Result<(), ValidationError> {
        let remaining = self.remaining(now);
        if bytes > remaining {
            return Err(ValidationError::DailyQuotaExceeded {
                requested: bytes,
                remaining,
            });
        }
        Ok(())
    }

    /// 한도 확인 후 사용량 기록
    pub fn consume(&mut self, bytes: u64, now: SystemTime) -> std::result::Result<(), ValidationError> {
        self.check(bytes, now)?;

        let today = day_index(now);
        if today != self.day {
            self.day = today;
            self.used = 0;
        }
        self.used += bytes;
        Ok(())
    }
}

/// 검증을 통과한 전송 목록
#[derive(Debug, Clone)]
pub struct TransferOffer {
    files: Vec<OutgoingFile>,
    total_size: u64,
}

impl TransferOffer {
    /// 크기 한도 검증
    pub fn prepare(files: Vec<OutgoingFile>, config: &Config) -> Result<Self> {
        if files.is_empty() {
            return Err(ValidationError::EmptyOffer.into());
        }

        let total_size: u64 = files.iter().map(|f| f.descriptor.size).sum();
        if total_size > config.max_transfer_size {
            debug!(
                "offer rejected: {} bytes > limit {} bytes",
                total_size, config.max_transfer_size
            );
            return Err(ValidationError::TransferTooLarge {
                size: total_size,
                limit: config.max_transfer_size,
            }
            .into());
        }

        Ok(Self { files, total_size })
    }

    /// 크기 한도 + 일일 한도 검증
    pub fn prepare_with_quota(
        files: Vec<OutgoingFile>,
        config: &Config,
        quota: &mut DailyQuota,
    ) -> Result<Self> {
        let offer = Self::prepare(files, config)?;
        quota.consume(offer.total_size, SystemTime::now())?;
        Ok(offer)
    }

    pub fn files(&self) -> &[OutgoingFile] {
        &self.files
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn descriptors(&self) -> Vec<FileDescriptor> {
        self.files.iter().map(|f| f.descriptor.clone()).collect()
    }

    /// 권한 승인 메시지용 파일 목록
    pub fn file_list(&self) -> Vec<FileListEntry> {
        self.files
            .iter()
            .map(|f| FileListEntry {
                name: f.descriptor.name.clone(),
                mime_type: f.descriptor.mime_type.clone(),
                size: f.descriptor.size,
                last_modified: f.last_modified,
                path: f.descriptor.path.clone(),
            })
            .collect()
    }
}
