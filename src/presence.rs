//! Presence gossip
//!
//! 중앙 서버 없이 "누가 접속해 있는가"를 추정하는 최선 노력 프로토콜.
//!
//! - announce: 아는 피어 + 랑데부 목록에 `device-announcement` 전송
//! - scan: 같은 대상에 다이얼해서 열리면 last_seen 갱신 (새 피어 발견용)
//! - prune: `now - last_seen > ttl`인 레코드 제거 (leave 메시지 없음)
//!
//! 세 주기는 각각 별도 타이머로 동작함

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use crate::connection::{connect_with_timeout, Connection, Connector};
use crate::message::{DeviceAnnouncementMessage, Message};
use crate::peer::PeerId;
use crate::{Config, Error, Result};

/// 피어 접속 기록
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRecord {
    pub peer_id: PeerId,

    /// 알림으로 받은 사용자 이름 (scan으로만 본 피어는 None)
    pub username: Option<String>,

    pub last_seen: Instant,
}

/// 접속 기록 테이블
///
/// 피어 ID 기준 upsert, username/last_seen은 마지막 쓰기가 이김
pub struct PresenceTable {
    records: DashMap<PeerId, PresenceRecord>,
    updates: watch::Sender<Vec<PresenceRecord>>,
}

impl Default for PresenceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceTable {
    pub fn new() -> Self {
        let (updates, _) = watch::channel(Vec::new());
        Self {
            records: DashMap::new(),
            updates,
        }
    }

    /// 기록 추가/갱신
    ///
    /// username이 None이면 기존 이름 유지
    pub fn upsert(&self, peer_id: PeerId, username: Option<String>, now: Instant) {
        self.records
            .entry(peer_id.clone())
            .and_modify(|record| {
                record.last_seen = now;
                if username.is_some() {
                    record.username = username.clone();
                }
            })
            .or_insert_with(|| PresenceRecord {
                peer_id,
                username: username.clone(),
                last_seen: now,
            });
        self.publish();
    }

    /// 연결이 열린 것만 기록
    pub fn touch(&self, peer_id: &PeerId, now: Instant) {
        self.upsert(peer_id.clone(), None, now);
    }

    /// 오래된 기록 제거 후 제거된 피어 반환
    pub fn prune(&self, now: Instant, ttl: Duration) -> Vec<PeerId> {
        let mut removed = Vec::new();
        self.records.retain(|peer, record| {
            let stale = now.saturating_duration_since(record.last_seen) > ttl;
            if stale {
                removed.push(peer.clone());
            }
            !stale
        });

        if !removed.is_empty() {
            self.publish();
        }
        removed
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<PresenceRecord> {
        self.records.get(peer_id).map(|r| r.value().clone())
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.records.contains_key(peer_id)
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.records.iter().map(|r| r.key().clone()).collect()
    }

    /// 접속 중인 피어 목록 (ID 순)
    pub fn online(&self) -> Vec<PresenceRecord> {
        let mut online: Vec<_> = self.records.iter().map(|r| r.value().clone()).collect();
        online.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        online
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// 목록 변경 구독 (UI용)
    pub fn subscribe(&self) -> watch::Receiver<Vec<PresenceRecord>> {
        self.updates.subscribe()
    }

    fn publish(&self) {
        self.updates.send_replace(self.online());
    }
}

/// 다이얼 결과
///
/// 최선 노력이라 호출자는 집계 로그 외에는 버림
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialOutcome {
    /// 알림 전송 (상대 응답 수신 여부)
    Announced { peer: PeerId, replied: bool },

    /// 연결만 확인 (사용자 이름 없음)
    Reached(PeerId),

    /// 연결 실패
    Unreachable { peer: PeerId, reason: String },
}

impl DialOutcome {
    pub fn is_reachable(&self) -> bool {
        !matches!(self, DialOutcome::Unreachable { .. })
    }
}

#[derive(Debug, Clone, Copy)]
struct DialTiming {
    connect_timeout: Duration,
    reply_timeout: Duration,
}

/// 다이얼 하나
async fn dial<C: Connector>(
    connector: Arc<C>,
    table: Arc<PresenceTable>,
    peer: PeerId,
    username: Option<String>,
    register_on_open: bool,
    timing: DialTiming,
) -> DialOutcome {
    let mut conn = match connect_with_timeout(connector.as_ref(), &peer, timing.connect_timeout).await {
        Ok(conn) => conn,
        Err(e) => {
            trace!("dial {} failed: {}", peer, e);
            return DialOutcome::Unreachable {
                peer,
                reason: e.to_string(),
            };
        }
    };

    if register_on_open {
        table.touch(&peer, Instant::now());
    }

    let username = match username {
        Some(name) => name,
        None => {
            conn.close();
            return DialOutcome::Reached(peer);
        }
    };

    if let Err(e) = conn.send(Message::announcement(username)).await {
        conn.close();
        return DialOutcome::Unreachable {
            peer,
            reason: e.to_string(),
        };
    }

    let replied = match tokio::time::timeout(timing.reply_timeout, conn.next_message()).await {
        Ok(Ok(Message::DeviceAnnouncement(reply))) => {
            table.upsert(peer.clone(), Some(reply.username), Instant::now());
            true
        }
        _ => false,
    };
    conn.close();

    DialOutcome::Announced { peer, replied }
}

/// Presence gossip
pub struct PresenceGossip<C: Connector> {
    local: PeerId,
    username: Option<String>,
    config: Config,
    connector: Arc<C>,
    table: Arc<PresenceTable>,
}

impl<C: Connector> Clone for PresenceGossip<C> {
    fn clone(&self) -> Self {
        Self {
            local: self.local.clone(),
            username: self.username.clone(),
            config: self.config.clone(),
            connector: self.connector.clone(),
            table: self.table.clone(),
        }
    }
}

impl<C: Connector> PresenceGossip<C> {
    pub fn new(local: PeerId, username: Option<String>, config: Config, connector: C) -> Self {
        Self {
            local,
            username,
            config,
            connector: Arc::new(connector),
            table: Arc::new(PresenceTable::new()),
        }
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    pub fn table(&self) -> Arc<PresenceTable> {
        self.table.clone()
    }

    /// 다이얼 대상: 아는 피어 + 랑데부 목록 (자기 자신 제외)
    pub fn targets(&self) -> Vec<PeerId> {
        let mut targets: BTreeSet<PeerId> = self.table.peers().into_iter().collect();
        targets.extend(self.config.rendezvous_peers.iter().cloned());
        targets.remove(&self.local);
        targets.into_iter().collect()
    }

    fn timing(&self) -> DialTiming {
        DialTiming {
            connect_timeout: self.config.connect_timeout(),
            reply_timeout: self.config.announce_reply_timeout(),
        }
    }

    /// 대상마다 독립 태스크로 다이얼
    async fn dial_all(&self, username: Option<String>, register_on_open: bool) -> Vec<DialOutcome> {
        let mut dials = JoinSet::new();
        for peer in self.targets() {
            dials.spawn(dial(
                self.connector.clone(),
                self.table.clone(),
                peer,
                username.clone(),
                register_on_open,
                self.timing(),
            ));
        }

        let mut outcomes = Vec::with_capacity(dials.len());
        while let Some(joined) = dials.join_next().await {
            if let Ok(outcome) = joined {
                outcomes.push(outcome);
            }
        }
        outcomes
    }

    /// announce 한 바퀴
    ///
    /// 사용자 이름이 없으면 아무것도 하지 않음
    pub async fn announce_sweep(&self) -> Vec<DialOutcome> {
        if self.username.is_none() {
            trace!("announce skipped: no username");
            return Vec::new();
        }
        let outcomes = self.dial_all(self.username.clone(), false).await;
        debug!(
            "announce sweep: {}/{} reachable",
            outcomes.iter().filter(|o| o.is_reachable()).count(),
            outcomes.len()
        );
        outcomes
    }

    /// scan 한 바퀴 (열린 연결마다 last_seen 갱신)
    pub async fn scan(&self) -> Vec<DialOutcome> {
        let outcomes = self.dial_all(self.username.clone(), true).await;
        debug!(
            "scan: {}/{} reachable, {} online",
            outcomes.iter().filter(|o| o.is_reachable()).count(),
            outcomes.len(),
            self.table.len()
        );
        outcomes
    }

    /// prune 한 바퀴
    pub fn prune_sweep(&self) -> Vec<PeerId> {
        let removed = self.table.prune(Instant::now(), self.config.presence_ttl());
        if !removed.is_empty() {
            info!("pruned {} stale peers", removed.len());
        }
        removed
    }

    /// 수신 알림 처리
    ///
    /// 보낸 쪽을 기록하고, 사용자 이름이 있으면 같은 연결로 응답함.
    /// 응답에는 다시 응답하지 않음
    pub async fn handle_announcement(&self, conn: &Connection, announcement: DeviceAnnouncementMessage) {
        self.table
            .upsert(conn.peer().clone(), Some(announcement.username), Instant::now());

        if let Some(username) = &self.username {
            if let Err(e) = conn.send(Message::announcement(username.clone())).await {
                trace!("announcement reply to {} failed: {}", conn.peer(), e);
            }
        }
    }

    /// 수신 연결 처리 (첫 메시지가 알림이어야 함)
    pub async fn handle_incoming(&self, mut conn: Connection) -> Result<()> {
        let first = tokio::time::timeout(self.config.announce_reply_timeout(), conn.next_message())
            .await
            .map_err(|_| Error::ConnectTimeout {
                peer: conn.peer().clone(),
            })?;

        let result = match first {
            Ok(Message::DeviceAnnouncement(announcement)) => {
                self.handle_announcement(&conn, announcement).await;
                Ok(())
            }
            Ok(other) => Err(Error::UnexpectedMessage {
                expected: "device-announcement".to_string(),
                got: other.type_name().to_string(),
            }),
            Err(e) => Err(e),
        };
        conn.close();
        result
    }

    /// 세 타이머를 백그라운드로 실행
    pub fn spawn(&self) -> GossipHandle {
        let (shutdown, _) = watch::channel(false);
        let mut tasks = Vec::with_capacity(3);

        let gossip = self.clone();
        tasks.push(spawn_timer(self.config.announce_interval(), shutdown.subscribe(), move || {
            let gossip = gossip.clone();
            async move {
                let _ = gossip.announce_sweep().await;
            }
        }));

        let gossip = self.clone();
        tasks.push(spawn_timer(self.config.scan_interval(), shutdown.subscribe(), move || {
            let gossip = gossip.clone();
            async move {
                let _ = gossip.scan().await;
            }
        }));

        let gossip = self.clone();
        tasks.push(spawn_timer(self.config.prune_interval(), shutdown.subscribe(), move || {
            let gossip = gossip.clone();
            async move {
                let _ = gossip.prune_sweep();
            }
        }));

        GossipHandle { shutdown, tasks }
    }
}

/// 주기 작업 하나
fn spawn_timer<F, Fut>(period: Duration, mut shutdown: watch::Receiver<bool>, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => tick().await,
            }
        }
    })
}

/// 백그라운드 gossip 핸들
///
/// 드롭하면 타이머도 멈춤
pub struct GossipHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl GossipHandle {
    /// 타이머 정지 후 종료 대기
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}
