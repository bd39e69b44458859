//! 프로토콜 메시지 정의
//!
//! 연결 위에서 오가는 메시지는 닫힌 enum 하나로 표현하고,
//! 디코딩 시 `MessageType`으로 빠짐없이 분기함

use serde::{Deserialize, Serialize};

use crate::chunk::{ChunkMessage, FileIndex};
use crate::{Error, Result, MAGIC_NUMBER, PROTOCOL_VERSION};

/// 메시지 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// 전송 권한 요청 (요청자 → 보유자)
    RequestPermission = 1,

    /// 권한 승인 + 파일 목록 (보유자 → 요청자)
    PermissionGranted = 2,

    /// 권한 거부 (보유자 → 요청자)
    PermissionDenied = 3,

    /// 파일 메타데이터
    FileInfo = 4,

    /// 데이터 청크
    FileChunk = 5,

    /// 진행률 보고
    ProgressUpdate = 6,

    /// 전송 완료 표시
    TransferComplete = 7,

    /// 전송 중단 알림
    TransferError = 8,

    /// presence gossip 알림
    DeviceAnnouncement = 9,
}

impl MessageType {
    /// 메시지 타입 태그 (kebab-case)
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::RequestPermission => "request-permission",
            MessageType::PermissionGranted => "permission-granted",
            MessageType::PermissionDenied => "permission-denied",
            MessageType::FileInfo => "file-info",
            MessageType::FileChunk => "file-chunk",
            MessageType::ProgressUpdate => "progress-update",
            MessageType::TransferComplete => "transfer-complete",
            MessageType::TransferError => "transfer-error",
            MessageType::DeviceAnnouncement => "device-announcement",
        }
    }
}

/// 메시지 헤더
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHeader {
    /// 매직 넘버
    pub magic: u32,

    /// 프로토콜 버전
    pub version: u8,

    /// 메시지 타입
    pub msg_type: MessageType,

    /// 메시지 길이 (헤더 제외)
    pub payload_len: u32,
}

impl MessageHeader {
    pub fn new(msg_type: MessageType, payload_len: u32) -> Self {
        Self {
            magic: MAGIC_NUMBER,
            version: PROTOCOL_VERSION,
            msg_type,
            payload_len,
        }
    }
}

/// 권한 승인 시 함께 보내는 파일 항목
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileListEntry {
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    /// ms since epoch
    pub last_modified: u64,
    pub path: String,
}

/// 권한 승인 메시지
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionGrantedMessage {
    pub file_count: u32,
    pub file_list: Vec<FileListEntry>,
}

/// 파일 시작 메시지
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfoMessage {
    pub file_index: FileIndex,
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
    pub file_path: String,
    pub total_chunks: u32,
    pub total_files: u32,
}

/// 진행률 메시지
///
/// 진행률 값은 백분율 (0.0 ~ 100.0)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdateMessage {
    pub file_index: FileIndex,
    pub file_name: String,
    pub current_chunk: u32,
    pub total_chunks: u32,
    pub file_progress: f64,
    pub overall_progress: f64,
}

/// 전송 에러 메시지
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferErrorMessage {
    pub message: String,
}

/// presence 알림 메시지
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAnnouncementMessage {
    pub username: String,
}

/// 통합 메시지 enum
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    RequestPermission,
    PermissionGranted(PermissionGrantedMessage),
    PermissionDenied,
    FileInfo(FileInfoMessage),
    FileChunk(ChunkMessage),
    ProgressUpdate(ProgressUpdateMessage),
    TransferComplete,
    TransferError(TransferErrorMessage),
    DeviceAnnouncement(DeviceAnnouncementMessage),
}

impl Message {
    /// 메시지 타입 반환
    pub fn msg_type(&self) -> MessageType {
        match self {
            Message::RequestPermission => MessageType::RequestPermission,
            Message::PermissionGranted(_) => MessageType::PermissionGranted,
            Message::PermissionDenied => MessageType::PermissionDenied,
            Message::FileInfo(_) => MessageType::FileInfo,
            Message::FileChunk(_) => MessageType::FileChunk,
            Message::ProgressUpdate(_) => MessageType::ProgressUpdate,
            Message::TransferComplete => MessageType::TransferComplete,
            Message::TransferError(_) => MessageType::TransferError,
            Message::DeviceAnnouncement(_) => MessageType::DeviceAnnouncement,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.msg_type().as_str()
    }

    pub fn transfer_error(message: impl Into<String>) -> Self {
        Message::TransferError(TransferErrorMessage {
            message: message.into(),
        })
    }

    pub fn announcement(username: impl Into<String>) -> Self {
        Message::DeviceAnnouncement(DeviceAnnouncementMessage {
            username: username.into(),
        })
    }

    /// 바이트로 직렬화 (헤더 + 페이로드)
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let payload = match self {
            Message::RequestPermission
            | Message::PermissionDenied
            | Message::TransferComplete => Vec::new(),
            Message::PermissionGranted(msg) => bincode::serialize(msg)?,
            Message::FileInfo(msg) => bincode::serialize(msg)?,
            Message::FileChunk(msg) => bincode::serialize(msg)?,
            Message::ProgressUpdate(msg) => bincode::serialize(msg)?,
            Message::TransferError(msg) => bincode::serialize(msg)?,
            Message::DeviceAnnouncement(msg) => bincode::serialize(msg)?,
        };

        let header = MessageHeader::new(self.msg_type(), payload.len() as u32);
        let header_bytes = bincode::serialize(&header)?;

        let mut buf = Vec::with_capacity(header_bytes.len() + payload.len());
        buf.extend_from_slice(&header_bytes);
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// 바이트에서 역직렬화
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header: MessageHeader = bincode::deserialize(bytes)?;

        if header.magic != MAGIC_NUMBER {
            return Err(Error::InvalidMagicNumber {
                expected: MAGIC_NUMBER,
                got: header.magic,
            });
        }
        if header.version != PROTOCOL_VERSION {
            return Err(Error::InvalidVersion {
                expected: PROTOCOL_VERSION,
                got: header.version,
            });
        }

        // 헤더 직렬화 크기로 페이로드 시작 위치 확인
        let header_size = bincode::serialized_size(&header)? as usize;
        let payload = &bytes[header_size.min(bytes.len())..];
        if payload.len() != header.payload_len as usize {
            return Err(Error::Transfer(format!(
                "페이로드 길이 불일치: {} (expected {}, got {})",
                header.msg_type.as_str(),
                header.payload_len,
                payload.len()
            )));
        }

        let message = match header.msg_type {
            MessageType::RequestPermission => Message::RequestPermission,
            MessageType::PermissionGranted => Message::PermissionGranted(bincode::deserialize(payload)?),
            MessageType::PermissionDenied => Message::PermissionDenied,
            MessageType::FileInfo => Message::FileInfo(bincode::deserialize(payload)?),
            MessageType::FileChunk => Message::FileChunk(bincode::deserialize(payload)?),
            MessageType::ProgressUpdate => Message::ProgressUpdate(bincode::deserialize(payload)?),
            MessageType::TransferComplete => Message::TransferComplete,
            MessageType::TransferError => Message::TransferError(bincode::deserialize(payload)?),
            MessageType::DeviceAnnouncement => {
                Message::DeviceAnnouncement(bincode::deserialize(payload)?)
            }
        };

        Ok(message)
    }
}
