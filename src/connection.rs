//! 연결 추상화
//!
//! 두 피어 사이의 순서 보장, 신뢰성 있는 양방향 메시지 채널.
//! 실제 채널 수립(랑데부/시그널링)은 `Connector` 구현체가 담당함

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};

use crate::message::Message;
use crate::peer::PeerId;
use crate::{Error, Result};

/// 연결 이벤트
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// 채널 수립 완료
    Open,

    /// 메시지 수신 (보낸 순서대로)
    Data(Message),

    /// 상대가 연결을 닫음
    Close,

    /// 채널 에러 (이후 이벤트 없음)
    Error(String),
}

/// 송신 핸들
///
/// 복제해서 여러 태스크가 같은 연결로 보낼 수 있음
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    peer: PeerId,
    outgoing: mpsc::Sender<Message>,
    shutdown: Arc<Notify>,
    closed: Arc<AtomicBool>,
}

impl ConnectionHandle {
    /// 상대 피어 ID
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// 메시지 전송
    pub async fn send(&self, message: Message) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        self.outgoing
            .send(message)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// 연결 종료
    ///
    /// 이미 큐에 들어간 메시지는 먼저 내보낸 뒤 닫힘
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shutdown.notify_one();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.outgoing.is_closed()
    }
}

/// 송신 큐의 소비측 (전송 계층 구현용)
pub struct Outgoing {
    rx: mpsc::Receiver<Message>,
    shutdown: Arc<Notify>,
}

impl Outgoing {
    /// 다음 송신 메시지 (닫혔으면 None)
    pub async fn recv(&mut self) -> Option<Message> {
        tokio::select! {
            biased;
            message = self.rx.recv() => message,
            _ = self.shutdown.notified() => None,
        }
    }
}

/// 송신 핸들과 소비측 생성
pub fn outgoing_channel(peer: PeerId, capacity: usize) -> (ConnectionHandle, Outgoing) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let shutdown = Arc::new(Notify::new());

    let handle = ConnectionHandle {
        peer,
        outgoing: tx,
        shutdown: shutdown.clone(),
        closed: Arc::new(AtomicBool::new(false)),
    };

    (handle, Outgoing { rx, shutdown })
}

/// 연결
///
/// 한 세션에만 속하며, 닫힌 연결은 재사용하지 않고 버림
#[derive(Debug)]
pub struct Connection {
    handle: ConnectionHandle,
    events: mpsc::Receiver<ConnectionEvent>,
    pending: VecDeque<Message>,
    opened: bool,
}

impl Connection {
    pub fn new(handle: ConnectionHandle, events: mpsc::Receiver<ConnectionEvent>) -> Self {
        Self {
            handle,
            events,
            pending: VecDeque::new(),
            opened: false,
        }
    }

    pub fn peer(&self) -> &PeerId {
        self.handle.peer()
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    pub async fn send(&self, message: Message) -> Result<()> {
        self.handle.send(message).await
    }

    pub fn close(&self) {
        self.handle.close();
    }

    pub fn is_open(&self) -> bool {
        self.opened && !self.handle.is_closed()
    }

    /// 다음 원시 이벤트
    pub async fn next_event(&mut self) -> ConnectionEvent {
        if let Some(message) = self.pending.pop_front() {
            return ConnectionEvent::Data(message);
        }
        let event = self.events.recv().await.unwrap_or(ConnectionEvent::Close);
        if matches!(event, ConnectionEvent::Open | ConnectionEvent::Data(_)) {
            self.opened = true;
        }
        event
    }

    /// Open 이벤트까지 대기
    pub async fn wait_open(&mut self) -> Result<()> {
        if self.opened {
            return Ok(());
        }
        loop {
            match self.events.recv().await.unwrap_or(ConnectionEvent::Close) {
                ConnectionEvent::Open => {
                    self.opened = true;
                    return Ok(());
                }
                ConnectionEvent::Data(message) => {
                    // Open 없이 데이터가 먼저 오면 열린 것으로 간주
                    self.opened = true;
                    self.pending.push_back(message);
                    return Ok(());
                }
                ConnectionEvent::Close => return Err(Error::ConnectionClosed),
                ConnectionEvent::Error(e) => return Err(Error::Channel(e)),
            }
        }
    }

    /// 다음 데이터 메시지
    ///
    /// Close는 `ConnectionClosed`, Error는 `Channel` 에러로 바뀜
    pub async fn next_message(&mut self) -> Result<Message> {
        loop {
            match self.next_event().await {
                ConnectionEvent::Open => continue,
                ConnectionEvent::Data(message) => return Ok(message),
                ConnectionEvent::Close => return Err(Error::ConnectionClosed),
                ConnectionEvent::Error(e) => return Err(Error::Channel(e)),
            }
        }
    }
}

/// 채널 수립 협력자 (피어 ID -> 살아있는 연결)
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, peer: &PeerId) -> impl Future<Output = Result<Connection>> + Send;
}

/// 수립 타임아웃을 적용한 연결
///
/// 기한 안에 Open까지 도달하지 못하면 `ConnectTimeout`
pub async fn connect_with_timeout<C: Connector>(
    connector: &C,
    peer: &PeerId,
    timeout: Duration,
) -> Result<Connection> {
    let attempt = async {
        let mut connection = connector.connect(peer).await?;
        connection.wait_open().await?;
        Ok(connection)
    };

    match tokio::time::timeout(timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(Error::ConnectTimeout { peer: peer.clone() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str) -> PeerId {
        PeerId::parse(id).unwrap()
    }

    #[tokio::test]
    async fn test_close_flushes_queued_messages() {
        let (handle, mut outgoing) = outgoing_channel(peer("AAAAA"), 8);
        handle.send(Message::RequestPermission).await.unwrap();
        handle.send(Message::TransferComplete).await.unwrap();
        handle.close();

        assert_eq!(outgoing.recv().await, Some(Message::RequestPermission));
        assert_eq!(outgoing.recv().await, Some(Message::TransferComplete));
        assert_eq!(outgoing.recv().await, None);
        assert!(matches!(
            handle.send(Message::PermissionDenied).await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_next_message_skips_open_and_maps_close() {
        let (handle, _outgoing) = outgoing_channel(peer("BBBBB"), 8);
        let (tx, rx) = mpsc::channel(8);
        let mut connection = Connection::new(handle, rx);

        tx.send(ConnectionEvent::Open).await.unwrap();
        tx.send(ConnectionEvent::Data(Message::PermissionDenied)).await.unwrap();
        tx.send(ConnectionEvent::Close).await.unwrap();

        connection.wait_open().await.unwrap();
        assert!(connection.is_open());
        assert_eq!(connection.next_message().await.unwrap(), Message::PermissionDenied);
        assert!(matches!(
            connection.next_message().await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_data_before_open_is_kept() {
        let (handle, _outgoing) = outgoing_channel(peer("CCCCC"), 8);
        let (tx, rx) = mpsc::channel(8);
        let mut connection = Connection::new(handle, rx);

        tx.send(ConnectionEvent::Data(Message::TransferComplete)).await.unwrap();
        connection.wait_open().await.unwrap();
        assert_eq!(connection.next_message().await.unwrap(), Message::TransferComplete);
    }

    #[tokio::test]
    async fn test_error_event_maps_to_channel_error() {
        let (handle, _outgoing) = outgoing_channel(peer("DDDDD"), 8);
        let (tx, rx) = mpsc::channel(8);
        let mut connection = Connection::new(handle, rx);

        tx.send(ConnectionEvent::Error("reset".into())).await.unwrap();
        assert!(matches!(connection.wait_open().await, Err(Error::Channel(_))));
    }
}
