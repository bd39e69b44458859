//! 청크 전송 인코더 (송신측)
//!
//! 파일 목록을 순서가 정해진 메시지 스트림으로 바꿈:
//! `file-info` → `file-chunk` × total_chunks → ... → `transfer-complete`
//!
//! 청크 사이에 고정 지연을 넣는 단순 스로틀만 있고,
//! 채널 버퍼 상태를 보는 흐름 제어는 없음

use tracing::{debug, info, warn};

use crate::chunk::{total_chunks, ChunkMessage, OutgoingFile};
use crate::connection::ConnectionHandle;
use crate::message::{FileInfoMessage, Message, ProgressUpdateMessage};
use crate::progress::{file_progress, overall_progress, should_report};
use crate::stats::TransferStats;
use crate::{Config, Error, Result};

/// 파일 읽기 실패는 전송 에러로 분류
fn read_error(e: Error) -> Error {
    match e {
        Error::Transfer(_) => e,
        other => Error::Transfer(format!("파일 읽기 실패: {}", other)),
    }
}

/// 청크 전송 인코더
pub struct TransferEncoder {
    config: Config,
    stats: TransferStats,
}

impl TransferEncoder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            stats: TransferStats::new(),
        }
    }

    /// 파일 목록 전송
    ///
    /// 에러가 나면 루프를 멈추고 `transfer-error`를 보낸 뒤 세션을 포기함.
    /// 부분 재전송은 하지 않음
    pub async fn send_files(&mut self, conn: &ConnectionHandle, files: &[OutgoingFile]) -> Result<()> {
        self.stats = TransferStats::new();

        match self.send_all(conn, files).await {
            Ok(()) => {
                info!("Transfer to {} complete: {}", conn.peer(), self.stats.summary());
                Ok(())
            }
            Err(e) => {
                warn!("전송 중단 ({}): {}", conn.peer(), e);
                // 연결이 이미 끊겼으면 알림도 실패함
                let _ = conn.send(Message::transfer_error(e.to_string())).await;
                Err(e)
            }
        }
    }

    async fn send_all(&mut self, conn: &ConnectionHandle, files: &[OutgoingFile]) -> Result<()> {
        self.config.validate()?;
        let chunk_size = self.config.chunk_size;
        let interval = self.config.chunk_interval();
        let total_files = files.len() as u32;
        let mut first_chunk = true;

        self.stats.total_files = total_files as u64;

        for (index, file) in files.iter().enumerate() {
            let file_index = index as u32;
            let descriptor = &file.descriptor;
            let file_chunks = total_chunks(descriptor.size, chunk_size);

            conn.send(Message::FileInfo(FileInfoMessage {
                file_index,
                file_name: descriptor.name.clone(),
                file_type: descriptor.mime_type.clone(),
                file_size: descriptor.size,
                file_path: descriptor.path.clone(),
                total_chunks: file_chunks,
                total_files,
            }))
            .await?;

            let mut reader = file.reader(chunk_size).await.map_err(read_error)?;

            while let Some((chunk_index, data)) = reader.next_chunk().await.map_err(read_error)? {
                // 전송 간격
                if !first_chunk && !interval.is_zero() {
                    tokio::time::sleep(interval).await;
                }
                first_chunk = false;

                let len = data.len();
                conn.send(Message::FileChunk(ChunkMessage {
                    file_index,
                    chunk_index,
                    total_chunks: file_chunks,
                    data,
                }))
                .await?;
                self.stats.record_chunk(len);

                if should_report(chunk_index, file_chunks, self.config.progress_every_chunks) {
                    let file_pct = file_progress(chunk_index, file_chunks);
                    conn.send(Message::ProgressUpdate(ProgressUpdateMessage {
                        file_index,
                        file_name: descriptor.name.clone(),
                        current_chunk: chunk_index + 1,
                        total_chunks: file_chunks,
                        file_progress: file_pct,
                        overall_progress: overall_progress(file_index, total_files, file_pct),
                    }))
                    .await?;
                    self.stats.progress_updates += 1;
                }
            }

            self.stats.completed_files += 1;
            debug!(
                "파일 {} 전송 완료: {} ({} bytes, {} 청크)",
                file_index, descriptor.name, descriptor.size, file_chunks
            );
        }

        conn.send(Message::TransferComplete).await?;
        Ok(())
    }

    /// 통계 반환
    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }
}
