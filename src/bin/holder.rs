//! PeerDrop 보유자 (송신측)
//!
//! 파일을 들고 TCP로 대기하다가 권한 요청에 응답하고 파일을 전송함.
//! presence 알림에도 응답함
//!
//! 사용법:
//!   cargo run --release --bin peerdrop-holder -- [OPTIONS]
//!
//! 예시:
//!   # 파일 두 개 공유, 자동 승인
//!   cargo run --release --bin peerdrop-holder -- -f report.pdf -f photos/ --name alice
//!
//!   # 요청마다 터미널에서 승인
//!   cargo run --release --bin peerdrop-holder -- -f data.bin --interactive

use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use peerdrop::chunk::OutgoingFile;
use peerdrop::presence::PresenceGossip;
use peerdrop::transport::{IncomingConnection, TcpConnector, TcpTransportListener};
use peerdrop::validation::DailyQuota;
use peerdrop::{
    Approver, Config, ConnectionRegistry, Message, PeerId, ServeSession, TransferOffer,
};

/// 리스너 accept가 연속으로 이만큼 실패하면 ID를 새로 만들고 다시 바인드
///
/// 헬로를 못 보낸 개별 연결은 세지 않음
const MAX_ACCEPT_FAILURES: u32 = 3;

/// 보유자 설정
struct HolderConfig {
    bind_addr: SocketAddr,
    peer_id: Option<PeerId>,
    username: Option<String>,
    files: Vec<PathBuf>,
    approval: ApprovalMode,
    peers: Vec<(PeerId, SocketAddr)>,
    config: Config,
}

#[derive(Clone, Copy)]
enum ApprovalMode {
    Auto(bool),
    Interactive,
}

impl Default for HolderConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            peer_id: None,
            username: None,
            files: Vec::new(),
            approval: ApprovalMode::Auto(true),
            peers: Vec::new(),
            config: Config::default(),
        }
    }
}

fn value<T: FromStr>(args: &[String], i: usize, flag: &str) -> Result<T, String> {
    args.get(i + 1)
        .ok_or_else(|| format!("{} 값 필요", flag))?
        .parse()
        .map_err(|_| format!("{} 값이 올바르지 않음: {}", flag, args[i + 1]))
}

/// `ID=ADDR` 형식
fn parse_peer(entry: &str) -> Result<(PeerId, SocketAddr), String> {
    let (id, addr) = entry
        .split_once('=')
        .ok_or_else(|| format!("--peer 형식은 ID=ADDR: {}", entry))?;
    let id = PeerId::parse(id).map_err(|e| e.to_string())?;
    let addr = addr.parse().map_err(|_| format!("유효한 주소 필요: {}", addr))?;
    Ok((id, addr))
}

fn parse_args() -> Result<HolderConfig, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut holder = HolderConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                holder.bind_addr = value(&args, i, "--bind")?;
                i += 1;
            }
            "--id" => {
                let id: String = value(&args, i, "--id")?;
                holder.peer_id = Some(PeerId::parse(&id).map_err(|e| e.to_string())?);
                i += 1;
            }
            "--name" | "-n" => {
                holder.username = Some(value(&args, i, "--name")?);
                i += 1;
            }
            "--file" | "-f" => {
                holder.files.push(value(&args, i, "--file")?);
                i += 1;
            }
            "--peer" | "-p" => {
                let entry: String = value(&args, i, "--peer")?;
                holder.peers.push(parse_peer(&entry)?);
                i += 1;
            }
            "--deny" => holder.approval = ApprovalMode::Auto(false),
            "--interactive" | "-i" => holder.approval = ApprovalMode::Interactive,
            "--lan" => holder.config = Config::lan(),
            "--constrained" => holder.config = Config::constrained(),
            "--chunk-interval-us" => {
                holder.config.chunk_interval_us = value(&args, i, "--chunk-interval-us")?;
                i += 1;
            }
            "--max-size" => {
                holder.config.max_transfer_size = value(&args, i, "--max-size")?;
                i += 1;
            }
            "--help" | "-h" => {
                println!(
                    r#"PeerDrop Holder - 파일 보유자

권한 요청에 응답하고 승인된 요청자에게 파일을 청크 단위로 전송

사용법:
  cargo run --release --bin peerdrop-holder -- [OPTIONS]

옵션:
  -b, --bind <ADDR>          바인드 주소 (기본: 0.0.0.0:9000)
      --id <ID>              로컬 피어 ID (기본: 무작위 5자)
  -n, --name <NAME>          presence 알림에 쓸 사용자 이름
  -f, --file <PATH>          공유할 파일 또는 디렉터리 (여러 번 지정 가능)
  -p, --peer <ID=ADDR>       알고 있는 피어 주소 (gossip 대상)
      --deny                 모든 요청 거절
  -i, --interactive          요청마다 터미널에서 승인
      --lan                  LAN 프리셋 (전송 간격 없음)
      --constrained          제한 프리셋 (50MB 한도, 일일 한도)
      --chunk-interval-us <N> 청크 전송 간격 마이크로초 (기본: 1000)
      --max-size <BYTES>     전송 한 건 최대 크기 (기본: 2GB)
  -h, --help                 이 도움말 출력

로그 레벨은 RUST_LOG 환경 변수로 조정
"#
                );
                std::process::exit(0);
            }
            other => warn!("알 수 없는 옵션 무시: {}", other),
        }
        i += 1;
    }

    Ok(holder)
}

/// 디렉터리는 하위 파일을 모두 담고, 경로는 디렉터리 이름부터 시작
async fn collect_files(paths: &[PathBuf], chunk_size: usize) -> peerdrop::Result<Vec<OutgoingFile>> {
    let mut files = Vec::new();

    for path in paths {
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_dir() {
            files.push(OutgoingFile::open(path, None, chunk_size).await?);
            continue;
        }

        let base = path.parent().unwrap_or_else(|| Path::new(""));
        let mut pending = vec![path.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let entry_path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(entry_path);
                    continue;
                }
                let relative = entry_path
                    .strip_prefix(base)
                    .unwrap_or(&entry_path)
                    .to_string_lossy()
                    .replace('\\', "/");
                files.push(OutgoingFile::open(&entry_path, Some(&relative), chunk_size).await?);
            }
        }
    }

    Ok(files)
}

/// 승인 결정
enum Approval {
    Fixed(bool),
    Interactive(Mutex<Lines<BufReader<Stdin>>>),
}

impl Approver for Approval {
    fn approve(&self, peer: &PeerId, offer: &TransferOffer) -> impl Future<Output = bool> + Send {
        let peer = peer.clone();
        let file_count = offer.files().len();
        let total_size = offer.total_size();

        async move {
            match self {
                Approval::Fixed(decision) => *decision,
                Approval::Interactive(lines) => {
                    let mut lines = lines.lock().await;
                    println!(
                        "{} wants {} files ({} bytes). Allow? [y/N]",
                        peer, file_count, total_size
                    );
                    matches!(
                        lines.next_line().await,
                        Ok(Some(answer)) if answer.trim().eq_ignore_ascii_case("y")
                    )
                }
            }
        }
    }
}

/// 연결 하나 처리 (헬로 → 첫 메시지로 분기)
async fn handle_connection(
    incoming: IncomingConnection,
    session: Arc<ServeSession>,
    approval: Arc<Approval>,
    gossip: PresenceGossip<TcpConnector>,
    registry: Arc<ConnectionRegistry>,
    hello_timeout: Duration,
    first_message_timeout: Duration,
) {
    let remote = incoming.remote_addr();
    let mut conn = match incoming.handshake(hello_timeout).await {
        Ok(conn) => conn,
        Err(e) => {
            debug!("incoming connection from {} rejected: {}", remote, e);
            return;
        }
    };
    let peer = conn.peer().clone();
    registry.insert(conn.handle());

    match tokio::time::timeout(first_message_timeout, conn.next_message()).await {
        Ok(Ok(Message::DeviceAnnouncement(announcement))) => {
            debug!("announcement from {} ({})", peer, announcement.username);
            gossip.handle_announcement(&conn, announcement).await;
            conn.close();
        }
        Ok(Ok(first @ Message::RequestPermission)) => {
            info!("Transfer request from {}", peer);
            match session.serve_request(&mut conn, first, approval.as_ref()).await {
                Ok(outcome) if outcome.approved => match outcome.stats {
                    Some(stats) => info!("Served {}: {}", peer, stats.summary()),
                    None => info!("Served {}", peer),
                },
                Ok(_) => info!("Request from {} denied", peer),
                Err(e) => warn!("전송 실패 ({}): {}", peer, e),
            }
        }
        Ok(Ok(other)) => {
            warn!("{}: 예상하지 못한 첫 메시지 {}", peer, other.type_name());
            conn.close();
        }
        Ok(Err(e)) => debug!("{} closed before first message: {}", peer, e),
        Err(_) => {
            debug!("{} sent nothing, closing", peer);
            conn.close();
        }
    }

    registry.prune_closed();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정 (RUST_LOG 우선)
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let holder = parse_args()?;
    let config = holder.config.clone();

    info!("PeerDrop Holder starting...");
    info!("Chunk size: {} bytes", config.chunk_size);
    info!("Chunk interval: {} us", config.chunk_interval_us);
    info!("Max transfer size: {} bytes", config.max_transfer_size);

    // 네트워크 이전에 검증
    config.validate()?;
    let files = collect_files(&holder.files, config.chunk_size).await?;
    let offer = match config.daily_quota {
        Some(limit) => TransferOffer::prepare_with_quota(files, &config, &mut DailyQuota::new(limit))?,
        None => TransferOffer::prepare(files, &config)?,
    };
    for file in offer.files() {
        info!("  {} ({} bytes)", file.descriptor.path, file.descriptor.size);
    }
    info!("Offering {} files, {} bytes", offer.files().len(), offer.total_size());

    let session = Arc::new(ServeSession::new(config.clone(), offer));
    let approval = Arc::new(match holder.approval {
        ApprovalMode::Auto(decision) => Approval::Fixed(decision),
        ApprovalMode::Interactive => {
            Approval::Interactive(Mutex::new(BufReader::new(tokio::io::stdin()).lines()))
        }
    });
    let registry = Arc::new(ConnectionRegistry::new());
    let mut local = holder.peer_id.clone().unwrap_or_else(PeerId::generate);

    loop {
        let connector = TcpConnector::new(local.clone(), config.event_buffer_size);
        for (peer, addr) in &holder.peers {
            connector.add_peer(peer.clone(), *addr);
        }

        let gossip = PresenceGossip::new(local.clone(), holder.username.clone(), config.clone(), connector);
        let gossip_handle = gossip.spawn();

        let listener = TcpTransportListener::bind(holder.bind_addr, local.clone(), config.event_buffer_size).await?;
        info!("Holder {} listening on {}", local, listener.local_addr()?);

        let mut failures = 0u32;
        loop {
            match listener.accept().await {
                Ok(incoming) => {
                    failures = 0;
                    tokio::spawn(handle_connection(
                        incoming,
                        session.clone(),
                        approval.clone(),
                        gossip.clone(),
                        registry.clone(),
                        config.connect_timeout(),
                        config.permission_timeout(),
                    ));
                }
                Err(e) if e.is_connection_error() => {
                    failures += 1;
                    warn!("accept 실패 ({}/{}): {}", failures, MAX_ACCEPT_FAILURES, e);
                    if failures >= MAX_ACCEPT_FAILURES {
                        break;
                    }
                }
                Err(e) => debug!("incoming connection rejected: {}", e),
            }
        }

        // 네트워크 계열 장애: 새 ID로 다시 시작
        gossip_handle.shutdown().await;
        registry.close_all();
        drop(listener);

        local = PeerId::generate();
        warn!("Regenerated local identity: {}", local);
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}
