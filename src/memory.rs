//! 프로세스 내부 랑데부 네트워크
//!
//! 같은 프로세스의 피어끼리 채널로 연결함 (로컬 루프백, 테스트용)

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::connection::{outgoing_channel, Connection, ConnectionEvent, Connector, Outgoing};
use crate::peer::PeerId;
use crate::{Error, Result};

/// 기본 채널 용량
const DEFAULT_CAPACITY: usize = 1024;

/// 연결된 두 끝점 생성
///
/// 반환값은 (a측 연결, b측 연결). a측 연결의 상대는 b
pub fn pair(a: PeerId, b: PeerId, capacity: usize) -> (Connection, Connection) {
    let capacity = capacity.max(2);
    let (a_events_tx, a_events_rx) = mpsc::channel(capacity);
    let (b_events_tx, b_events_rx) = mpsc::channel(capacity);

    let (a_handle, a_outgoing) = outgoing_channel(b, capacity);
    let (b_handle, b_outgoing) = outgoing_channel(a, capacity);

    // 새 채널이라 용량이 남아 있음
    let _ = a_events_tx.try_send(ConnectionEvent::Open);
    let _ = b_events_tx.try_send(ConnectionEvent::Open);

    tokio::spawn(pump(a_outgoing, b_events_tx));
    tokio::spawn(pump(b_outgoing, a_events_tx));

    (
        Connection::new(a_handle, a_events_rx),
        Connection::new(b_handle, b_events_rx),
    )
}

/// 한쪽 송신 큐를 상대 이벤트로 전달
async fn pump(mut outgoing: Outgoing, remote: mpsc::Sender<ConnectionEvent>) {
    while let Some(message) = outgoing.recv().await {
        if remote.send(ConnectionEvent::Data(message)).await.is_err() {
            return;
        }
    }
    let _ = remote.send(ConnectionEvent::Close).await;
}

/// 메모리 네트워크 (피어 ID -> 수신 대기열)
#[derive(Clone)]
pub struct MemoryNetwork {
    listeners: Arc<DashMap<PeerId, mpsc::Sender<Connection>>>,
    capacity: usize,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            listeners: Arc::new(DashMap::new()),
            capacity,
        }
    }

    /// 피어 등록 (이전 등록은 대체됨)
    pub fn listen(&self, peer: PeerId) -> MemoryListener {
        let (tx, rx) = mpsc::channel(64);
        self.listeners.insert(peer.clone(), tx);
        MemoryListener { peer, incoming: rx }
    }

    /// 피어 등록 해제 (오프라인 전환)
    pub fn disconnect(&self, peer: &PeerId) {
        self.listeners.remove(peer);
    }

    pub fn is_listening(&self, peer: &PeerId) -> bool {
        self.listeners.contains_key(peer)
    }

    pub fn connector(&self, local: PeerId) -> MemoryConnector {
        MemoryConnector {
            local,
            network: self.clone(),
        }
    }
}

/// 수신 대기열
pub struct MemoryListener {
    peer: PeerId,
    incoming: mpsc::Receiver<Connection>,
}

impl MemoryListener {
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// 다음 수신 연결 (네트워크에서 해제되면 None)
    pub async fn accept(&mut self) -> Option<Connection> {
        self.incoming.recv().await
    }
}

/// 메모리 네트워크 연결기
#[derive(Clone)]
pub struct MemoryConnector {
    local: PeerId,
    network: MemoryNetwork,
}

impl MemoryConnector {
    pub fn local(&self) -> &PeerId {
        &self.local
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, peer: &PeerId) -> impl std::future::Future<Output = Result<Connection>> + Send {
        let peer = peer.clone();
        let local = self.local.clone();
        let network = self.network.clone();

        async move {
            let listener = network
                .listeners
                .get(&peer)
                .map(|entry| entry.value().clone())
                .ok_or_else(|| Error::PeerUnavailable { peer: peer.clone() })?;

            let (local_side, remote_side) = pair(local, peer.clone(), network.capacity);
            if listener.send(remote_side).await.is_err() {
                debug!("listener dropped: {}", peer);
                return Err(Error::PeerUnavailable { peer });
            }

            Ok(local_side)
        }
    }
}
