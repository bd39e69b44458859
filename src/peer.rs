//! 피어 식별자
//!
//! 연결 수립 계층에서 엔드포인트를 가리키는 고정 길이 영숫자 토큰

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// 피어 ID 길이 (문자 수)
pub const PEER_ID_LEN: usize = 5;

const PEER_ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// 피어 ID
///
/// 세션에 할당된 뒤에는 바뀌지 않음. 역직렬화도 `parse`와 같은 검증을 거침
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub struct PeerId(String);

impl PeerId {
    /// 문자열 검증 후 생성
    pub fn parse(value: &str) -> Result<Self> {
        if value.len() != PEER_ID_LEN || !value.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(Error::InvalidPeerId(value.to_string()));
        }
        Ok(Self(value.to_string()))
    }

    /// 무작위 ID 생성 (대문자 + 숫자)
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let id = (0..PEER_ID_LEN)
            .map(|_| PEER_ID_ALPHABET[rng.gen_range(0..PEER_ID_ALPHABET.len())] as char)
            .collect();
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PeerId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl FromStr for PeerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_validates_length_and_charset() {
        assert!(PeerId::parse("AAAAA").is_ok());
        assert!(PeerId::parse("ab12Z").is_ok());
        assert!(PeerId::parse("AAAA").is_err());
        assert!(PeerId::parse("AAAAAA").is_err());
        assert!(PeerId::parse("AA-AA").is_err());
    }

    #[test]
    fn test_generate_is_valid() {
        for _ in 0..32 {
            let id = PeerId::generate();
            assert_eq!(id.as_str().len(), PEER_ID_LEN);
            assert!(PeerId::parse(id.as_str()).is_ok());
        }
    }

    #[test]
    fn test_deserialize_validates() {
        let valid = bincode::serialize(&"AB12C".to_string()).unwrap();
        assert_eq!(bincode::deserialize::<PeerId>(&valid).unwrap().as_str(), "AB12C");

        for bad in ["", "TOOLONG", "AB-CD"] {
            let bytes = bincode::serialize(&bad.to_string()).unwrap();
            assert!(bincode::deserialize::<PeerId>(&bytes).is_err());
        }
    }
}
