//! 연결 레지스트리
//!
//! 피어 ID별 살아있는 연결 핸들을 소유하는 테이블.
//! 사용하는 쪽은 전역 조회 대신 항상 이 테이블에서 키로 꺼내 씀

use dashmap::DashMap;
use tracing::debug;

use crate::connection::ConnectionHandle;
use crate::peer::PeerId;

/// 연결 레지스트리
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<PeerId, ConnectionHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 연결 등록
    ///
    /// 같은 피어의 이전 연결은 닫고 버림 (재사용하지 않음)
    pub fn insert(&self, handle: ConnectionHandle) {
        let peer = handle.peer().clone();
        if let Some(previous) = self.connections.insert(peer.clone(), handle) {
            debug!("replacing connection to {}", peer);
            previous.close();
        }
    }

    pub fn get(&self, peer: &PeerId) -> Option<ConnectionHandle> {
        self.connections
            .get(peer)
            .filter(|entry| !entry.value().is_closed())
            .map(|entry| entry.value().clone())
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.get(peer).is_some()
    }

    /// 연결 제거 후 닫기
    pub fn remove(&self, peer: &PeerId) -> bool {
        match self.connections.remove(peer) {
            Some((_, handle)) => {
                handle.close();
                true
            }
            None => false,
        }
    }

    /// 닫힌 연결 정리
    pub fn prune_closed(&self) -> usize {
        let before = self.connections.len();
        self.connections.retain(|_, handle| !handle.is_closed());
        before - self.connections.len()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// 모든 연결 닫기
    pub fn close_all(&self) {
        for entry in self.connections.iter() {
            entry.value().close();
        }
        self.connections.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::outgoing_channel;

    fn peer(id: &str) -> PeerId {
        PeerId::parse(id).unwrap()
    }

    #[test]
    fn test_insert_replaces_and_closes_previous() {
        let registry = ConnectionRegistry::new();
        let (first, _out1) = outgoing_channel(peer("AAAAA"), 4);
        let (second, _out2) = outgoing_channel(peer("AAAAA"), 4);

        registry.insert(first.clone());
        registry.insert(second);

        assert!(first.is_closed());
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&peer("AAAAA")));
    }

    #[test]
    fn test_remove_and_prune() {
        let registry = ConnectionRegistry::new();
        let (a, _out_a) = outgoing_channel(peer("AAAAA"), 4);
        let (b, _out_b) = outgoing_channel(peer("BBBBB"), 4);
        registry.insert(a.clone());
        registry.insert(b.clone());

        assert!(registry.remove(&peer("AAAAA")));
        assert!(a.is_closed());
        assert!(!registry.remove(&peer("AAAAA")));

        b.close();
        assert!(registry.get(&peer("BBBBB")).is_none());
        assert_eq!(registry.prune_closed(), 1);
        assert!(registry.is_empty());
    }
}
