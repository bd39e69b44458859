//! # PeerDrop
//!
//! 중앙 파일 서버 없이 피어끼리 직접 파일을 주고받는 전송 프로토콜
//!
//! ## 핵심 특징
//! - **권한 핸드셰이크**: 보유자가 승인해야 전송 시작, 거절은 종료 상태
//! - **청크 전송**: 파일을 고정 크기 청크로 나눠 보내고 인덱스로 조립
//! - **경로 보존**: 디렉터리 문맥을 유지한 다중 파일 묶음 전송
//! - **진행률**: 파일/전체 진행률, 완료 전에는 100%를 보이지 않음
//! - **Presence gossip**: announce / scan / prune 세 타이머로 접속 피어 추정
//! - **수신 대기열**: 완료된 전송을 도착 순서대로 보관

pub mod chunk;
pub mod config;
pub mod connection;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod handshake;
pub mod memory;
pub mod message;
pub mod peer;
pub mod presence;
pub mod progress;
pub mod queue;
pub mod registry;
pub mod session;
pub mod sink;
pub mod stats;
pub mod transport;
pub mod validation;

pub use chunk::{ChunkMessage, FileDescriptor, OutgoingFile, ReceivedFile};
pub use config::Config;
pub use connection::{Connection, ConnectionEvent, ConnectionHandle, Connector};
pub use decoder::TransferDecoder;
pub use encoder::TransferEncoder;
pub use error::{Error, Result, ValidationError};
pub use handshake::{Approver, FnApprover, PermissionRequester, PermissionResponder};
pub use message::Message;
pub use peer::PeerId;
pub use presence::{PresenceGossip, PresenceRecord, PresenceTable};
pub use queue::{QueueGrouping, QueueStatus, TransferQueue};
pub use registry::ConnectionRegistry;
pub use session::{ReceiveSession, ServeSession, TransferStatus};
pub use sink::{FileSink, FsSink};
pub use stats::TransferStats;
pub use validation::TransferOffer;

/// 프로토콜 버전
pub const PROTOCOL_VERSION: u8 = 1;

/// 기본 청크 크기 (바이트)
pub const DEFAULT_CHUNK_SIZE: usize = 65536; // 64KB

/// 기본 전송 크기 한도 (바이트)
pub const DEFAULT_MAX_TRANSFER_SIZE: u64 = 2 * 1024 * 1024 * 1024; // 2GB

/// 매직 넘버 (프레임 식별용)
pub const MAGIC_NUMBER: u32 = 0x50445250; // "PDRP"
