//! 수신 완료 전송 대기열
//!
//! 도착 순서(FIFO)를 지키며, 완료 처리된 항목은 유예 시간 뒤 제거됨.
//! 항목을 지우면 파일 버퍼도 함께 해제됨

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::chunk::ReceivedFile;
use crate::{Error, Result};

/// 항목 묶는 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueGrouping {
    /// 보낸 사람당 한 항목 (대기 중인 항목에 이어 붙임)
    BySender,

    /// 전송당 한 항목
    ByTransfer,
}

/// 항목 상태 (앞으로만 진행)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QueueStatus {
    Waiting,
    Downloading,
    Completed,
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueStatus::Waiting => write!(f, "waiting"),
            QueueStatus::Downloading => write!(f, "downloading"),
            QueueStatus::Completed => write!(f, "completed"),
        }
    }
}

/// 대기열 항목
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: u64,
    pub sender_name: String,
    pub files: Vec<ReceivedFile>,

    /// 도착 시각
    pub timestamp: Instant,

    pub status: QueueStatus,

    /// 완료 처리 시각
    pub completed_at: Option<Instant>,
}

impl QueueEntry {
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.descriptor.size).sum()
    }
}

/// 여러 태스크가 함께 쓰는 대기열
pub type SharedTransferQueue = Arc<Mutex<TransferQueue>>;

/// 전송 대기열
#[derive(Debug)]
pub struct TransferQueue {
    grouping: QueueGrouping,
    grace: Duration,
    entries: Vec<QueueEntry>,
    next_id: u64,
}

impl TransferQueue {
    pub fn new(grouping: QueueGrouping, grace: Duration) -> Self {
        Self {
            grouping,
            grace,
            entries: Vec::new(),
            next_id: 1,
        }
    }

    pub fn shared(self) -> SharedTransferQueue {
        Arc::new(Mutex::new(self))
    }

    pub fn grouping(&self) -> QueueGrouping {
        self.grouping
    }

    /// 완료 전송 추가 후 항목 ID 반환
    pub fn enqueue(&mut self, sender_name: impl Into<String>, files: Vec<ReceivedFile>, now: Instant) -> u64 {
        let sender_name = sender_name.into();

        if self.grouping == QueueGrouping::BySender {
            if let Some(entry) = self
                .entries
                .iter_mut()
                .find(|e| e.sender_name == sender_name && e.status == QueueStatus::Waiting)
            {
                debug!("appending {} files to queue entry {}", files.len(), entry.id);
                entry.files.extend(files);
                return entry.id;
            }
        }

        let id = self.next_id;
        self.next_id += 1;

        // 도착 시각 순서 유지
        let position = self.entries.partition_point(|e| e.timestamp <= now);
        self.entries.insert(
            position,
            QueueEntry {
                id,
                sender_name,
                files,
                timestamp: now,
                status: QueueStatus::Waiting,
                completed_at: None,
            },
        );
        id
    }

    /// 상태 변경 (뒤로 돌아가는 전이는 거부)
    pub fn set_status(&mut self, id: u64, status: QueueStatus, now: Instant) -> Result<()> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(Error::UnknownQueueEntry(id))?;

        if status < entry.status {
            return Err(Error::InvalidTransition {
                from: entry.status.to_string(),
                to: status.to_string(),
            });
        }

        if status == QueueStatus::Completed && entry.completed_at.is_none() {
            entry.completed_at = Some(now);
        }
        entry.status = status;
        Ok(())
    }

    pub fn remove(&mut self, id: u64) -> Option<QueueEntry> {
        let position = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(position))
    }

    /// 유예 시간이 지난 완료 항목 제거
    pub fn purge_expired(&mut self, now: Instant) -> Vec<u64> {
        let grace = self.grace;
        let mut removed = Vec::new();
        self.entries.retain(|entry| {
            let expired = entry
                .completed_at
                .map(|at| now.saturating_duration_since(at) >= grace)
                .unwrap_or(false);
            if expired {
                removed.push(entry.id);
            }
            !expired
        });
        removed
    }

    pub fn get(&self, id: u64) -> Option<&QueueEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// 도착 순서대로 모든 항목
    pub fn entries(&self) -> &[QueueEntry] {
        &self.entries
    }

    /// 가장 먼저 도착한 대기 항목
    pub fn next_waiting(&self) -> Option<&QueueEntry> {
        self.entries.iter().find(|e| e.status == QueueStatus::Waiting)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    use crate::chunk::FileDescriptor;

    fn file(name: &str, len: usize) -> ReceivedFile {
        ReceivedFile {
            descriptor: FileDescriptor::new(name, len as u64, 64),
            data: Bytes::from(vec![0u8; len]),
        }
    }

    #[test]
    fn test_fifo_by_transfer() {
        let start = Instant::now();
        let mut queue = TransferQueue::new(QueueGrouping::ByTransfer, Duration::from_secs(5));

        let first = queue.enqueue("alice", vec![file("a", 1)], start);
        let second = queue.enqueue("alice", vec![file("b", 2)], start + Duration::from_secs(1));
        // 늦게 기록된 이른 도착도 순서대로 들어감
        let early = queue.enqueue("bob", vec![file("c", 3)], start + Duration::from_millis(500));

        let order: Vec<u64> = queue.entries().iter().map(|e| e.id).collect();
        assert_eq!(order, vec![first, early, second]);
        assert_eq!(queue.next_waiting().unwrap().id, first);
    }

    #[test]
    fn test_by_sender_appends_to_waiting_entry() {
        let now = Instant::now();
        let mut queue = TransferQueue::new(QueueGrouping::BySender, Duration::from_secs(5));

        let id = queue.enqueue("alice", vec![file("a", 10)], now);
        assert_eq!(queue.enqueue("alice", vec![file("b", 20)], now), id);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get(id).unwrap().total_size(), 30);

        // 진행 중인 항목에는 붙이지 않음
        queue.set_status(id, QueueStatus::Downloading, now).unwrap();
        let next = queue.enqueue("alice", vec![file("c", 5)], now);
        assert_ne!(next, id);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_status_only_moves_forward() {
        let now = Instant::now();
        let mut queue = TransferQueue::new(QueueGrouping::ByTransfer, Duration::from_secs(5));
        let id = queue.enqueue("alice", vec![file("a", 1)], now);

        queue.set_status(id, QueueStatus::Downloading, now).unwrap();
        assert!(matches!(
            queue.set_status(id, QueueStatus::Waiting, now),
            Err(Error::InvalidTransition { .. })
        ));
        queue.set_status(id, QueueStatus::Completed, now).unwrap();
        assert!(matches!(
            queue.set_status(99, QueueStatus::Completed, now),
            Err(Error::UnknownQueueEntry(99))
        ));
    }

    #[test]
    fn test_purge_after_grace() {
        let now = Instant::now();
        let mut queue = TransferQueue::new(QueueGrouping::ByTransfer, Duration::from_secs(5));
        let done = queue.enqueue("alice", vec![file("a", 1)], now);
        let waiting = queue.enqueue("bob", vec![file("b", 1)], now);
        queue.set_status(done, QueueStatus::Completed, now).unwrap();

        assert!(queue.purge_expired(now + Duration::from_secs(4)).is_empty());
        assert_eq!(queue.purge_expired(now + Duration::from_secs(5)), vec![done]);
        assert!(queue.get(done).is_none());
        assert!(queue.get(waiting).is_some());

        assert!(queue.remove(waiting).is_some());
        assert!(queue.is_empty());
    }
}
