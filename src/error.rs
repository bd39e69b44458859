//! 에러 타입 정의

use thiserror::Error;

use crate::peer::PeerId;

/// 전송 시작 전 로컬 검증 에러
///
/// 네트워크 시도 이전에 걸러지며 상대에게 아무것도 보내지 않음
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("전송할 파일이 없음")]
    EmptyOffer,

    #[error("전송 크기 초과: {size} bytes (최대 {limit} bytes)")]
    TransferTooLarge { size: u64, limit: u64 },

    #[error("일일 전송량 초과: 요청 {requested} bytes, 남은 용량 {remaining} bytes")]
    DailyQuotaExceeded { requested: u64, remaining: u64 },
}

/// PeerDrop 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("유효하지 않은 매직 넘버: expected {expected:08X}, got {got:08X}")]
    InvalidMagicNumber { expected: u32, got: u32 },

    #[error("유효하지 않은 프로토콜 버전: expected {expected}, got {got}")]
    InvalidVersion { expected: u8, got: u8 },

    #[error("CRC 불일치: expected {expected:08X}, got {got:08X}")]
    CrcMismatch { expected: u32, got: u32 },

    #[error("프레임 크기 초과: {len} bytes (최대 {max_size} bytes)")]
    FrameTooLarge { len: usize, max_size: usize },

    #[error("유효하지 않은 피어 ID: {0:?}")]
    InvalidPeerId(String),

    #[error("피어에 연결할 수 없음: {peer}")]
    PeerUnavailable { peer: PeerId },

    #[error("연결 수립 타임아웃: {peer}")]
    ConnectTimeout { peer: PeerId },

    #[error("연결 종료")]
    ConnectionClosed,

    #[error("채널 에러: {0}")]
    Channel(String),

    #[error("전송 권한 거부됨")]
    PermissionDenied,

    #[error("권한 요청 응답 없음 (타임아웃)")]
    PermissionTimeout,

    #[error("전송 에러: {0}")]
    Transfer(String),

    #[error("검증 실패: {0}")]
    Validation(#[from] ValidationError),

    #[error("잘못된 상태 전이: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("메시지 타입 불일치: expected {expected}, got {got}")]
    UnexpectedMessage { expected: String, got: String },

    #[error("잘못된 설정: {0}")]
    InvalidConfig(String),

    #[error("수신 연결 거부: {0}")]
    HandshakeRejected(String),

    #[error("큐 항목 없음: {0}")]
    UnknownQueueEntry(u64),
}

impl Error {
    /// 네트워크 계열 에러 여부
    ///
    /// 상위 계층은 이 분류로 로컬 ID 재생성 여부를 판단함
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::PeerUnavailable { .. }
                | Error::ConnectTimeout { .. }
                | Error::ConnectionClosed
                | Error::Channel(_)
                | Error::CrcMismatch { .. }
                | Error::InvalidMagicNumber { .. }
                | Error::InvalidVersion { .. }
                | Error::FrameTooLarge { .. }
        )
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_classification() {
        assert!(Error::ConnectionClosed.is_connection_error());
        assert!(Error::Channel("reset".into()).is_connection_error());
        assert!(!Error::PermissionDenied.is_connection_error());
        assert!(!Error::Transfer("read failed".into()).is_connection_error());
        assert!(!Error::from(ValidationError::EmptyOffer).is_connection_error());
        assert!(!Error::HandshakeRejected("eof".into()).is_connection_error());
        assert!(!Error::InvalidConfig("chunk_size".into()).is_connection_error());
    }
}
