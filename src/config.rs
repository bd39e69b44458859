//! 프로토콜 설정

use std::time::Duration;

use crate::peer::PeerId;
use crate::transport::MAX_FRAME_SIZE;
use crate::{Error, Result, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_TRANSFER_SIZE};

/// 청크 프레임의 헤더/인덱스 여유분 (바이트)
const CHUNK_FRAME_OVERHEAD: usize = 1024;

/// 한 프레임에 들어가는 최대 청크 크기
pub const MAX_CHUNK_SIZE: usize = MAX_FRAME_SIZE - CHUNK_FRAME_OVERHEAD;

/// PeerDrop 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 청크 크기 (바이트)
    pub chunk_size: usize,

    /// 청크 전송 간격 (마이크로초)
    /// 0이면 최대 속도로 전송
    pub chunk_interval_us: u64,

    /// 진행률 메시지 주기 (청크 수)
    /// 파일의 마지막 청크에서는 항상 전송
    pub progress_every_chunks: u32,

    /// 전송 한 건의 최대 크기 (바이트)
    pub max_transfer_size: u64,

    /// 일일 전송 한도 (바이트, None이면 무제한)
    pub daily_quota: Option<u64>,

    /// 연결 수립 타임아웃 (밀리초)
    pub connect_timeout_ms: u64,

    /// 권한 요청 응답 대기 타임아웃 (밀리초)
    pub permission_timeout_ms: u64,

    /// announce 주기 (밀리초)
    pub announce_interval_ms: u64,

    /// scan 주기 (밀리초)
    pub scan_interval_ms: u64,

    /// prune 주기 (밀리초)
    pub prune_interval_ms: u64,

    /// presence 레코드 유효 시간 (밀리초)
    pub presence_ttl_ms: u64,

    /// announce 응답 대기 시간 (밀리초)
    pub announce_reply_timeout_ms: u64,

    /// 탐색 부트스트랩용 고정 피어 목록
    pub rendezvous_peers: Vec<PeerId>,

    /// 완료된 큐 항목 보존 시간 (밀리초)
    pub queue_grace_ms: u64,

    /// 연결별 이벤트 버퍼 크기
    pub event_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_interval_us: 1_000,            // 1ms
            progress_every_chunks: 10,
            max_transfer_size: DEFAULT_MAX_TRANSFER_SIZE,
            daily_quota: None,
            connect_timeout_ms: 10_000,          // 10초
            permission_timeout_ms: 15_000,       // 15초
            announce_interval_ms: 30_000,        // 30초
            scan_interval_ms: 60_000,            // 60초
            prune_interval_ms: 30_000,           // 30초
            presence_ttl_ms: 180_000,            // 180초
            announce_reply_timeout_ms: 3_000,
            rendezvous_peers: Vec::new(),
            queue_grace_ms: 5_000,
            event_buffer_size: 256,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 설정 검증
    ///
    /// 청크 하나가 프레임 하나에 들어가야 함
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk_size는 0보다 커야 함".to_string()));
        }
        if self.chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::InvalidConfig(format!(
                "chunk_size {} bytes가 프레임 한도를 넘음 (최대 {} bytes)",
                self.chunk_size, MAX_CHUNK_SIZE
            )));
        }
        Ok(())
    }

    /// 파일 크기 기준 청크 수 계산
    pub fn chunks_for(&self, size: u64) -> u32 {
        crate::chunk::total_chunks(size, self.chunk_size)
    }

    pub fn chunk_interval(&self) -> Duration {
        Duration::from_micros(self.chunk_interval_us)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn permission_timeout(&self) -> Duration {
        Duration::from_millis(self.permission_timeout_ms)
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.prune_interval_ms)
    }

    pub fn presence_ttl(&self) -> Duration {
        Duration::from_millis(self.presence_ttl_ms)
    }

    pub fn announce_reply_timeout(&self) -> Duration {
        Duration::from_millis(self.announce_reply_timeout_ms)
    }

    pub fn queue_grace(&self) -> Duration {
        Duration::from_millis(self.queue_grace_ms)
    }

    /// LAN 전용 설정
    pub fn lan() -> Self {
        Self {
            chunk_interval_us: 0,                // 최대 속도
            connect_timeout_ms: 5_000,
            announce_interval_ms: 15_000,
            scan_interval_ms: 30_000,
            ..Self::default()
        }
    }

    /// 저대역/저장형 경로용 설정
    ///
    /// 전송 한도를 50MB로 낮추고 청크 간격을 늘림
    pub fn constrained() -> Self {
        Self {
            chunk_interval_us: 5_000,            // 5ms
            max_transfer_size: 50 * 1024 * 1024, // 50MB
            daily_quota: Some(500 * 1024 * 1024),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let config = Config::default();
        assert_eq!(config.chunk_size, 65_536);
        assert_eq!(config.presence_ttl(), Duration::from_secs(180));
        assert_eq!(config.announce_interval(), Duration::from_secs(30));
        assert_eq!(config.scan_interval(), Duration::from_secs(60));
        assert_eq!(config.permission_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn test_presets_share_single_size_limit() {
        assert_eq!(Config::constrained().max_transfer_size, 50 * 1024 * 1024);
        assert_eq!(Config::lan().max_transfer_size, DEFAULT_MAX_TRANSFER_SIZE);
        assert_eq!(Config::lan().chunk_interval(), Duration::ZERO);
    }

    #[test]
    fn test_chunk_size_must_fit_frame() {
        assert!(Config::default().validate().is_ok());
        assert!(Config::constrained().validate().is_ok());

        let zero = Config {
            chunk_size: 0,
            ..Config::default()
        };
        assert!(matches!(zero.validate(), Err(Error::InvalidConfig(_))));

        let huge = Config {
            chunk_size: MAX_FRAME_SIZE,
            ..Config::default()
        };
        assert!(matches!(huge.validate(), Err(Error::InvalidConfig(_))));

        let edge = Config {
            chunk_size: MAX_CHUNK_SIZE,
            ..Config::default()
        };
        assert!(edge.validate().is_ok());
    }
}
