//! TCP 전송 계층
//!
//! 프레임: `len(u32 LE) | crc32(u32 LE) | message bytes`
//! 연결 직후 다이얼한 쪽이 자기 피어 ID를 먼저 보냄.
//! 수신측은 accept와 헬로 읽기를 나눠서, 헬로는 연결별 태스크에서 기한 안에 읽음

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::connection::{outgoing_channel, Connection, ConnectionEvent, Connector};
use crate::message::Message;
use crate::peer::PeerId;
use crate::{Error, Result};

/// 최대 프레임 크기
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024; // 4MB

/// 프레임 쓰기
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    let bytes = message.to_bytes()?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge {
            len: bytes.len(),
            max_size: MAX_FRAME_SIZE,
        });
    }

    let crc = crc32fast::hash(&bytes);
    writer.write_u32_le(bytes.len() as u32).await?;
    writer.write_u32_le(crc).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// 프레임 읽기 (프레임 경계에서 EOF면 None)
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Message>> {
    let len = match reader.read_u32_le().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if len > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge {
            len,
            max_size: MAX_FRAME_SIZE,
        });
    }

    let expected = reader.read_u32_le().await?;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;

    let got = crc32fast::hash(&buf);
    if got != expected {
        return Err(Error::CrcMismatch { expected, got });
    }

    Message::from_bytes(&buf).map(Some)
}

async fn write_hello(stream: &mut TcpStream, local: &PeerId) -> Result<()> {
    let id = local.as_str().as_bytes();
    stream.write_u8(id.len() as u8).await?;
    stream.write_all(id).await?;
    Ok(())
}

async fn read_hello(stream: &mut TcpStream) -> Result<PeerId> {
    let len = stream.read_u8().await? as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    PeerId::parse(&String::from_utf8_lossy(&buf))
}

/// TCP 스트림을 연결로 감쌈 (읽기/쓰기 태스크 생성)
fn spawn_connection(stream: TcpStream, peer: PeerId, capacity: usize) -> Connection {
    let (mut read_half, mut write_half) = stream.into_split();
    let (events_tx, events_rx) = mpsc::channel(capacity.max(2));
    let (handle, mut outgoing) = outgoing_channel(peer.clone(), capacity);

    let _ = events_tx.try_send(ConnectionEvent::Open);

    // 수신 태스크
    let reader_peer = peer.clone();
    tokio::spawn(async move {
        loop {
            let event = match read_frame(&mut read_half).await {
                Ok(Some(message)) => ConnectionEvent::Data(message),
                Ok(None) => {
                    let _ = events_tx.send(ConnectionEvent::Close).await;
                    break;
                }
                Err(e) => {
                    warn!("프레임 수신 에러 ({}): {}", reader_peer, e);
                    let _ = events_tx.send(ConnectionEvent::Error(e.to_string())).await;
                    break;
                }
            };
            if events_tx.send(event).await.is_err() {
                break;
            }
        }
    });

    // 송신 태스크
    tokio::spawn(async move {
        while let Some(message) = outgoing.recv().await {
            if let Err(e) = write_frame(&mut write_half, &message).await {
                warn!("프레임 송신 에러 ({}): {}", peer, e);
                break;
            }
        }
        let _ = write_half.shutdown().await;
        debug!("connection writer closed: {}", peer);
    });

    Connection::new(handle, events_rx)
}

/// 주소록 기반 TCP 연결기
///
/// 피어 ID -> 소켓 주소 매핑이 랑데부 역할을 대신함
#[derive(Clone)]
pub struct TcpConnector {
    local: PeerId,
    address_book: Arc<DashMap<PeerId, SocketAddr>>,
    capacity: usize,
}

impl TcpConnector {
    pub fn new(local: PeerId, capacity: usize) -> Self {
        Self {
            local,
            address_book: Arc::new(DashMap::new()),
            capacity,
        }
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    /// 주소록 등록
    pub fn add_peer(&self, peer: PeerId, addr: SocketAddr) {
        self.address_book.insert(peer, addr);
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.address_book.iter().map(|e| e.key().clone()).collect()
    }
}

impl Connector for TcpConnector {
    fn connect(&self, peer: &PeerId) -> impl std::future::Future<Output = Result<Connection>> + Send {
        let peer = peer.clone();
        let local = self.local.clone();
        let capacity = self.capacity;
        let addr = self.address_book.get(&peer).map(|e| *e.value());

        async move {
            let addr = addr.ok_or_else(|| Error::PeerUnavailable { peer: peer.clone() })?;
            let mut stream = TcpStream::connect(addr).await.map_err(|e| {
                debug!("dial {} ({}) failed: {}", peer, addr, e);
                Error::PeerUnavailable { peer: peer.clone() }
            })?;
            stream.set_nodelay(true)?;
            write_hello(&mut stream, &local).await?;

            Ok(spawn_connection(stream, peer, capacity))
        }
    }
}

/// TCP 수신 대기
pub struct TcpTransportListener {
    listener: TcpListener,
    local: PeerId,
    capacity: usize,
}

impl TcpTransportListener {
    pub async fn bind(addr: SocketAddr, local: PeerId, capacity: usize) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("PeerDrop listener {} bound on {}", local, listener.local_addr()?);
        Ok(Self {
            listener,
            local,
            capacity,
        })
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// 다음 수신 소켓
    ///
    /// 여기서 나는 에러는 리스너 자체의 IO 에러뿐임
    pub async fn accept(&self) -> Result<IncomingConnection> {
        let (stream, addr) = self.listener.accept().await?;
        Ok(IncomingConnection {
            stream,
            addr,
            capacity: self.capacity,
        })
    }
}

/// 헬로를 아직 받지 않은 수신 소켓
pub struct IncomingConnection {
    stream: TcpStream,
    addr: SocketAddr,
    capacity: usize,
}

impl IncomingConnection {
    pub fn remote_addr(&self) -> SocketAddr {
        self.addr
    }

    /// 헬로를 읽고 연결로 전환
    ///
    /// 기한 초과, EOF, 잘못된 피어 ID는 모두 `HandshakeRejected` (연결 하나만 거부)
    pub async fn handshake(mut self, deadline: Duration) -> Result<Connection> {
        let addr = self.addr;
        let hello = async {
            self.stream.set_nodelay(true)?;
            read_hello(&mut self.stream).await
        };
        let peer = match tokio::time::timeout(deadline, hello).await {
            Ok(Ok(peer)) => peer,
            Ok(Err(e)) => return Err(Error::HandshakeRejected(format!("{}: {}", addr, e))),
            Err(_) => return Err(Error::HandshakeRejected(format!("{}: 헬로 대기 시간 초과", addr))),
        };

        debug!("incoming connection from {} ({})", peer, addr);
        Ok(spawn_connection(self.stream, peer, self.capacity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    use crate::chunk::ChunkMessage;

    fn peer(id: &str) -> PeerId {
        PeerId::parse(id).unwrap()
    }

    #[tokio::test]
    async fn test_frame_crc_mismatch() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Message::announcement("bob")).await.unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;

        let mut reader = buf.as_slice();
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(Error::CrcMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_frame_eof_is_none() {
        let mut reader: &[u8] = &[];
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tcp_connection_end_to_end() {
        let listener = TcpTransportListener::bind("127.0.0.1:0".parse().unwrap(), peer("HHHHH"), 64)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let connector = TcpConnector::new(peer("RRRRR"), 64);
        connector.add_peer(peer("HHHHH"), addr);

        let accept = tokio::spawn(async move {
            let incoming = listener.accept().await?;
            incoming.handshake(Duration::from_secs(5)).await
        });
        let mut dialed = connector.connect(&peer("HHHHH")).await.unwrap();
        let mut accepted = accept.await.unwrap().unwrap();

        assert_eq!(accepted.peer(), &peer("RRRRR"));
        dialed.wait_open().await.unwrap();

        let chunk = Message::FileChunk(ChunkMessage {
            file_index: 0,
            chunk_index: 0,
            total_chunks: 1,
            data: Bytes::from(vec![7u8; 70_000]),
        });
        dialed.send(Message::RequestPermission).await.unwrap();
        dialed.send(chunk.clone()).await.unwrap();
        dialed.close();

        assert_eq!(accepted.next_message().await.unwrap(), Message::RequestPermission);
        assert_eq!(accepted.next_message().await.unwrap(), chunk);
        assert!(matches!(
            accepted.next_message().await,
            Err(Error::ConnectionClosed)
        ));

        accepted.send(Message::PermissionDenied).await.unwrap();
        assert_eq!(dialed.next_message().await.unwrap(), Message::PermissionDenied);
    }

    #[tokio::test]
    async fn test_unknown_address_is_unavailable() {
        let connector = TcpConnector::new(peer("RRRRR"), 8);
        assert!(matches!(
            connector.connect(&peer("NOONE")).await,
            Err(Error::PeerUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_silent_client_does_not_block_accept() {
        let listener = TcpTransportListener::bind("127.0.0.1:0".parse().unwrap(), peer("HHHHH"), 16)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let _silent = TcpStream::connect(addr).await.unwrap();
        let stalled = listener.accept().await.unwrap();
        let stalled = tokio::spawn(stalled.handshake(Duration::from_millis(200)));

        let connector = TcpConnector::new(peer("RRRRR"), 16);
        connector.add_peer(peer("HHHHH"), addr);
        let _dialed = connector.connect(&peer("HHHHH")).await.unwrap();

        let incoming = tokio::time::timeout(Duration::from_secs(3), listener.accept())
            .await
            .unwrap()
            .unwrap();
        let accepted = incoming.handshake(Duration::from_secs(3)).await.unwrap();
        assert_eq!(accepted.peer(), &peer("RRRRR"));

        let rejected = stalled.await.unwrap();
        assert!(matches!(rejected, Err(Error::HandshakeRejected(_))));
    }

    #[tokio::test]
    async fn test_dropped_client_is_not_a_network_failure() {
        let listener = TcpTransportListener::bind("127.0.0.1:0".parse().unwrap(), peer("HHHHH"), 16)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        drop(TcpStream::connect(addr).await.unwrap());
        let incoming = listener.accept().await.unwrap();
        let err = incoming.handshake(Duration::from_secs(3)).await.unwrap_err();

        assert!(matches!(err, Error::HandshakeRejected(_)));
        assert!(!err.is_connection_error());
    }
}
