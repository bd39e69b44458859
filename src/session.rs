//! 전송 세션
//!
//! (연결, 방향) 하나당 세션 하나.
//! 수신 세션은 디코더 상태를 독점하고, 완료/에러/연결 종료 시 함께 사라짐

use std::fmt;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::chunk::ReceivedFile;
use crate::connection::{connect_with_timeout, Connection, Connector};
use crate::decoder::{DecodeEvent, TransferDecoder};
use crate::handshake::{Approver, PermissionRequester, PermissionResponder};
use crate::message::{FileListEntry, Message};
use crate::peer::PeerId;
use crate::progress::ProgressSnapshot;
use crate::sink::{save_groups, FileSink, SaveReport};
use crate::stats::TransferStats;
use crate::validation::TransferOffer;
use crate::{Config, Error, Result};

/// 사용자에게 보이는 전송 상태
#[derive(Debug, Clone, PartialEq)]
pub enum TransferStatus {
    Idle,
    Pending,
    Granted,
    Denied,
    Transferring,
    Completed,
    Error(String),
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStatus::Idle => write!(f, "Idle"),
            TransferStatus::Pending => write!(f, "Waiting for permission"),
            TransferStatus::Granted => write!(f, "Permission granted"),
            TransferStatus::Denied => write!(f, "Request denied by holder"),
            TransferStatus::Transferring => write!(f, "Transferring files"),
            TransferStatus::Completed => write!(f, "Transfer completed"),
            TransferStatus::Error(e) => write!(f, "Transfer failed: {}", e),
        }
    }
}

/// 수신 세션 결과
#[derive(Debug)]
pub struct ReceiveOutcome {
    pub peer: PeerId,

    /// 승인 시 받은 파일 목록
    pub file_list: Vec<FileListEntry>,

    /// 조립 완료된 파일 (file_index 순)
    pub files: Vec<ReceivedFile>,

    pub report: SaveReport,
    pub stats: TransferStats,
}

/// 수신 세션 (요청자측)
pub struct ReceiveSession {
    config: Config,
    status: watch::Sender<TransferStatus>,
    progress: watch::Sender<ProgressSnapshot>,
}

impl ReceiveSession {
    pub fn new(config: Config) -> Self {
        let (status, _) = watch::channel(TransferStatus::Idle);
        let (progress, _) = watch::channel(ProgressSnapshot::default());
        Self {
            config,
            status,
            progress,
        }
    }

    /// 상태 구독
    pub fn status(&self) -> watch::Receiver<TransferStatus> {
        self.status.subscribe()
    }

    /// 진행률 구독
    pub fn progress(&self) -> watch::Receiver<ProgressSnapshot> {
        self.progress.subscribe()
    }

    pub fn current_status(&self) -> TransferStatus {
        self.status.borrow().clone()
    }

    fn set_status(&self, status: TransferStatus) {
        self.status.send_replace(status);
    }

    /// 피어에 연결한 뒤 수신
    pub async fn connect_and_run<C: Connector, S: FileSink>(
        &self,
        connector: &C,
        peer: &PeerId,
        sink: &S,
    ) -> Result<ReceiveOutcome> {
        self.set_status(TransferStatus::Pending);
        let mut conn = match connect_with_timeout(connector, peer, self.config.connect_timeout()).await {
            Ok(conn) => conn,
            Err(e) => {
                self.set_status(TransferStatus::Error(e.to_string()));
                return Err(e);
            }
        };
        self.run(&mut conn, sink).await
    }

    /// 권한 요청 → 수신 → 저장
    ///
    /// 거절되면 `Denied` 상태로 `PermissionDenied`를 돌려주며 받은 파일은 없음.
    /// 저장에 실패한 파일이 하나라도 있으면 `Error` 상태로 끝남
    pub async fn run<S: FileSink>(&self, conn: &mut Connection, sink: &S) -> Result<ReceiveOutcome> {
        self.set_status(TransferStatus::Pending);

        let result = self.receive(conn, sink).await;
        conn.close();

        match &result {
            Ok(outcome) => {
                info!(
                    "Received {} files from {}: {}",
                    outcome.files.len(),
                    outcome.peer,
                    outcome.stats.summary()
                );
                self.set_status(TransferStatus::Completed);
            }
            Err(Error::PermissionDenied) => self.set_status(TransferStatus::Denied),
            Err(e) => {
                warn!("수신 실패 ({}): {}", conn.peer(), e);
                self.set_status(TransferStatus::Error(e.to_string()));
            }
        }
        result
    }

    async fn receive<S: FileSink>(&self, conn: &mut Connection, sink: &S) -> Result<ReceiveOutcome> {
        match tokio::time::timeout(self.config.connect_timeout(), conn.wait_open()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::ConnectTimeout {
                    peer: conn.peer().clone(),
                })
            }
        }

        let mut requester = PermissionRequester::new(self.config.permission_timeout());
        requester.request_access(&conn.handle()).await?;
        let granted = requester.await_response(conn).await?;
        self.set_status(TransferStatus::Granted);
        info!(
            "{} granted access to {} files",
            conn.peer(),
            granted.file_count
        );

        self.set_status(TransferStatus::Transferring);
        let mut decoder = TransferDecoder::new(&self.config);
        loop {
            let message = conn.next_message().await?;
            match decoder.handle(message)? {
                DecodeEvent::Progress(snapshot) => {
                    self.progress.send_replace(snapshot);
                }
                DecodeEvent::Complete => break,
                _ => {}
            }
        }

        self.progress.send_replace(decoder.progress().clone());
        let stats = decoder.stats().clone();
        let groups = decoder.into_groups();
        let report = save_groups(sink, &groups).await;
        if !report.is_success() {
            let failed: Vec<&str> = report.failed.iter().map(|(path, _)| path.as_str()).collect();
            return Err(Error::Transfer(format!(
                "{}/{} files could not be saved: {}",
                report.failed.len(),
                report.saved_files + report.failed.len(),
                failed.join(", ")
            )));
        }

        Ok(ReceiveOutcome {
            peer: conn.peer().clone(),
            file_list: granted.file_list,
            files: groups.into_iter().flat_map(|g| g.files).collect(),
            report,
            stats,
        })
    }
}

/// 송신 세션 결과
#[derive(Debug)]
pub struct ServeOutcome {
    pub peer: PeerId,
    pub approved: bool,

    /// 승인 시 전송 통계
    pub stats: Option<TransferStats>,
}

/// 송신 세션 (보유자측)
pub struct ServeSession {
    config: Config,
    offer: TransferOffer,
}

impl ServeSession {
    pub fn new(config: Config, offer: TransferOffer) -> Self {
        Self { config, offer }
    }

    pub fn offer(&self) -> &TransferOffer {
        &self.offer
    }

    /// 요청 대기 후 응답
    pub async fn run<A: Approver>(&self, conn: &mut Connection, approver: &A) -> Result<ServeOutcome> {
        let first = conn.next_message().await?;
        self.serve_request(conn, first, approver).await
    }

    /// 이미 읽은 첫 메시지로 응답
    pub async fn serve_request<A: Approver>(
        &self,
        conn: &mut Connection,
        first: Message,
        approver: &A,
    ) -> Result<ServeOutcome> {
        let mut responder = PermissionResponder::new();
        responder.on_request(&first)?;

        let approved = approver.approve(conn.peer(), &self.offer).await;
        let result = responder
            .respond(&conn.handle(), approved, &self.offer, &self.config)
            .await;
        conn.close();

        Ok(ServeOutcome {
            peer: conn.peer().clone(),
            approved,
            stats: result?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::chunk::OutgoingFile;
    use crate::connection::ConnectionEvent;
    use crate::memory::{self, MemoryNetwork};
    use crate::sink::{FsSink, MemorySink};

    const KB: usize = 1024;

    fn peer(id: &str) -> PeerId {
        PeerId::parse(id).unwrap()
    }

    fn test_config() -> Config {
        Config {
            chunk_interval_us: 0,
            ..Config::default()
        }
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(13).wrapping_add(seed)).collect()
    }

    fn three_files(config: &Config) -> (TransferOffer, Vec<Vec<u8>>) {
        let data = vec![pattern(10 * KB, 1), pattern(70 * KB, 2), pattern(130 * KB, 3)];
        let files = vec![
            OutgoingFile::from_bytes("small.bin", data[0].clone(), config.chunk_size),
            OutgoingFile::from_bytes("medium.bin", data[1].clone(), config.chunk_size).with_path("set/medium.bin"),
            OutgoingFile::from_bytes("large.bin", data[2].clone(), config.chunk_size).with_path("set/large.bin"),
        ];
        (TransferOffer::prepare(files, config).unwrap(), data)
    }

    #[test]
    fn test_status_display_is_distinct() {
        let statuses = [
            TransferStatus::Idle,
            TransferStatus::Pending,
            TransferStatus::Granted,
            TransferStatus::Denied,
            TransferStatus::Transferring,
            TransferStatus::Completed,
            TransferStatus::Error("boom".to_string()),
        ];
        let mut texts: Vec<String> = statuses.iter().map(|s| s.to_string()).collect();
        texts.sort();
        texts.dedup();
        assert_eq!(texts.len(), statuses.len());
    }

    #[tokio::test]
    async fn test_three_file_transfer_end_to_end() {
        let config = test_config();
        let (offer, data) = three_files(&config);
        let (mut requester_conn, mut holder_conn) = memory::pair(peer("REQST"), peer("HOLDR"), 64);

        let serve = ServeSession::new(config.clone(), offer);
        let holder = tokio::spawn(async move { serve.run(&mut holder_conn, &true).await });

        let session = ReceiveSession::new(config);
        let progress = session.progress();
        let sink = MemorySink::with_directory_save();
        let outcome = session.run(&mut requester_conn, &sink).await.unwrap();

        let served = holder.await.unwrap().unwrap();
        assert!(served.approved);
        assert_eq!(served.stats.unwrap().total_chunks, 6);

        assert_eq!(session.current_status(), TransferStatus::Completed);
        assert_eq!(outcome.file_list.len(), 3);
        assert_eq!(outcome.files.len(), 3);
        assert_eq!(outcome.files[0].data.as_ref(), data[0].as_slice());
        assert_eq!(outcome.files[1].data.as_ref(), data[1].as_slice());
        assert_eq!(outcome.files[2].data.as_ref(), data[2].as_slice());
        assert_eq!(outcome.files[1].directory(), "/set");

        // "/" 묶음과 "/set" 묶음
        assert_eq!(outcome.report.directory_saves, 2);
        assert_eq!(sink.saved().len(), 3);

        let last = progress.borrow().clone();
        assert!(last.completed);
        assert_eq!(last.overall_progress, 100.0);
    }

    #[tokio::test]
    async fn test_denied_request_leaves_nothing() {
        let config = test_config();
        let (offer, _) = three_files(&config);
        let (mut requester_conn, mut holder_conn) = memory::pair(peer("REQST"), peer("HOLDR"), 64);

        let serve = ServeSession::new(config.clone(), offer);
        let holder = tokio::spawn(async move { serve.run(&mut holder_conn, &false).await });

        let session = ReceiveSession::new(config);
        let sink = MemorySink::new();
        let result = session.run(&mut requester_conn, &sink).await;

        assert!(matches!(result, Err(Error::PermissionDenied)));
        assert_eq!(session.current_status(), TransferStatus::Denied);
        assert!(sink.saved().is_empty());

        let served = holder.await.unwrap().unwrap();
        assert!(!served.approved);
        assert!(served.stats.is_none());
    }

    #[tokio::test]
    async fn test_close_mid_transfer_abandons_session() {
        let config = test_config();
        let (mut requester_conn, mut holder_conn) = memory::pair(peer("REQST"), peer("HOLDR"), 64);

        let holder = tokio::spawn(async move {
            holder_conn.wait_open().await.unwrap();
            assert_eq!(holder_conn.next_message().await.unwrap(), Message::RequestPermission);
            holder_conn
                .send(Message::PermissionGranted(crate::message::PermissionGrantedMessage {
                    file_count: 1,
                    file_list: Vec::new(),
                }))
                .await
                .unwrap();
            holder_conn
                .send(Message::FileInfo(crate::message::FileInfoMessage {
                    file_index: 0,
                    file_name: "cut.bin".to_string(),
                    file_type: "application/octet-stream".to_string(),
                    file_size: 200 * KB as u64,
                    file_path: "/cut.bin".to_string(),
                    total_chunks: 4,
                    total_files: 1,
                }))
                .await
                .unwrap();
            holder_conn.close();
        });

        let session = ReceiveSession::new(config);
        let sink = MemorySink::new();
        let result = session.run(&mut requester_conn, &sink).await;
        holder.await.unwrap();

        assert!(matches!(result, Err(Error::ConnectionClosed)));
        assert!(matches!(session.current_status(), TransferStatus::Error(_)));
        assert!(sink.saved().is_empty());
    }

    #[tokio::test]
    async fn test_connect_and_run_unknown_peer() {
        let network = MemoryNetwork::new();
        let connector = network.connector(peer("REQST"));
        let session = ReceiveSession::new(test_config());

        let result = session
            .connect_and_run(&connector, &peer("GHOST"), &MemorySink::new())
            .await;
        assert!(matches!(result, Err(Error::PeerUnavailable { .. })));
        assert!(matches!(session.current_status(), TransferStatus::Error(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_never_arrives() {
        let config = test_config();
        let (handle, _outgoing) = crate::connection::outgoing_channel(peer("HOLDR"), 8);
        let (events_tx, events_rx) = tokio::sync::mpsc::channel::<ConnectionEvent>(8);
        let mut conn = Connection::new(handle, events_rx);

        let session = ReceiveSession::new(config.clone());
        let start = tokio::time::Instant::now();
        let result = session.run(&mut conn, &MemorySink::new()).await;

        assert!(matches!(result, Err(Error::ConnectTimeout { .. })));
        assert!(start.elapsed() >= Duration::from_millis(config.connect_timeout_ms));
        drop(events_tx);
    }

    #[tokio::test]
    async fn test_unsaved_files_end_in_error() {
        let config = test_config();
        let files = vec![OutgoingFile::from_bytes("escape.txt", b"outside".to_vec(), config.chunk_size)
            .with_path("../../escape.txt")];
        let offer = TransferOffer::prepare(files, &config).unwrap();
        let (mut requester_conn, mut holder_conn) = memory::pair(peer("REQST"), peer("HOLDR"), 64);

        let serve = ServeSession::new(config.clone(), offer);
        let holder = tokio::spawn(async move { serve.run(&mut holder_conn, &true).await });

        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("inbox");
        let session = ReceiveSession::new(config);
        let result = session.run(&mut requester_conn, &FsSink::new(&root)).await;
        holder.await.unwrap().unwrap();

        assert!(matches!(result, Err(Error::Transfer(ref m)) if m.contains("escape.txt")));
        assert!(matches!(session.current_status(), TransferStatus::Error(_)));
        assert!(!dir.path().join("escape.txt").exists());
    }
}
