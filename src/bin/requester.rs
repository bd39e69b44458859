//! PeerDrop 요청자 (수신측)
//!
//! 피어 ID로 보유자에 연결해 권한을 요청하고, 받은 파일을 디렉터리 구조대로 저장함
//!
//! 사용법:
//!   cargo run --release --bin peerdrop-requester -- [OPTIONS]
//!
//! 예시:
//!   # 보유자 ABCDE에게 요청
//!   cargo run --release --bin peerdrop-requester -- --holder ABCDE=127.0.0.1:9000 -o received
//!
//!   # 요청 전에 접속 중인 피어 확인
//!   cargo run --release --bin peerdrop-requester -- --holder ABCDE=127.0.0.1:9000 --scan --name bob

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use tokio::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use peerdrop::presence::PresenceGossip;
use peerdrop::queue::QueueStatus;
use peerdrop::transport::TcpConnector;
use peerdrop::{Config, FsSink, PeerId, QueueGrouping, ReceiveSession, TransferQueue};

/// 요청자 설정
struct RequesterConfig {
    holder: Option<(PeerId, SocketAddr)>,
    peer_id: Option<PeerId>,
    username: Option<String>,
    output_dir: PathBuf,
    scan: bool,
    peers: Vec<(PeerId, SocketAddr)>,
    config: Config,
}

impl Default for RequesterConfig {
    fn default() -> Self {
        Self {
            holder: None,
            peer_id: None,
            username: None,
            output_dir: PathBuf::from("received"),
            scan: false,
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
        .ok_or_else(|| format!("피어 형식은 ID=ADDR: {}", entry))?;
    let id = PeerId::parse(id).map_err(|e| e.to_string())?;
    let addr = addr.parse().map_err(|_| format!("유효한 주소 필요: {}", addr))?;
    Ok((id, addr))
}

fn parse_args() -> Result<RequesterConfig, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut requester = RequesterConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--holder" | "-s" => {
                let entry: String = value(&args, i, "--holder")?;
                requester.holder = Some(parse_peer(&entry)?);
                i += 1;
            }
            "--id" => {
                let id: String = value(&args, i, "--id")?;
                requester.peer_id = Some(PeerId::parse(&id).map_err(|e| e.to_string())?);
                i += 1;
            }
            "--name" | "-n" => {
                requester.username = Some(value(&args, i, "--name")?);
                i += 1;
            }
            "--output" | "-o" => {
                requester.output_dir = value(&args, i, "--output")?;
                i += 1;
            }
            "--peer" | "-p" => {
                let entry: String = value(&args, i, "--peer")?;
                requester.peers.push(parse_peer(&entry)?);
                i += 1;
            }
            "--scan" => requester.scan = true,
            "--permission-timeout-ms" => {
                requester.config.permission_timeout_ms = value(&args, i, "--permission-timeout-ms")?;
                i += 1;
            }
            "--max-size" => {
                requester.config.max_transfer_size = value(&args, i, "--max-size")?;
                i += 1;
            }
            "--connect-timeout-ms" => {
                requester.config.connect_timeout_ms = value(&args, i, "--connect-timeout-ms")?;
                i += 1;
            }
            "--help" | "-h" => {
                println!(
                    r#"PeerDrop Requester - 파일 요청자

보유자에게 전송 권한을 요청하고 받은 파일을 저장

사용법:
  cargo run --release --bin peerdrop-requester -- [OPTIONS]

옵션:
  -s, --holder <ID=ADDR>           보유자 피어 ID와 주소 (필수)
      --id <ID>                    로컬 피어 ID (기본: 무작위 5자)
  -n, --name <NAME>                presence 알림에 쓸 사용자 이름
  -o, --output <DIR>               저장 디렉터리 (기본: ./received)
  -p, --peer <ID=ADDR>             scan 대상 피어 (여러 번 지정 가능)
      --scan                       요청 전에 presence scan 한 번 실행
      --connect-timeout-ms <N>     연결 수립 타임아웃 (기본: 10000)
      --permission-timeout-ms <N>  권한 응답 타임아웃 (기본: 15000)
      --max-size <BYTES>           받을 전송 한 건 최대 크기 (기본: 2GB)
  -h, --help                       이 도움말 출력

로그 레벨은 RUST_LOG 환경 변수로 조정
"#
                );
                std::process::exit(0);
            }
            other => warn!("알 수 없는 옵션 무시: {}", other),
        }
        i += 1;
    }

    Ok(requester)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정 (RUST_LOG 우선)
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let requester = parse_args()?;
    let config = requester.config.clone();
    config.validate()?;
    let (holder, holder_addr) = requester.holder.clone().ok_or("--holder ID=ADDR 필요")?;
    let local = requester.peer_id.clone().unwrap_or_else(PeerId::generate);

    info!("PeerDrop Requester {} starting...", local);
    info!("Holder: {} ({})", holder, holder_addr);
    info!("Output directory: {:?}", requester.output_dir);

    let connector = TcpConnector::new(local.clone(), config.event_buffer_size);
    connector.add_peer(holder.clone(), holder_addr);
    for (peer, addr) in &requester.peers {
        connector.add_peer(peer.clone(), *addr);
    }

    if requester.scan {
        let mut scan_config = config.clone();
        scan_config.rendezvous_peers = connector.peers();
        let gossip = PresenceGossip::new(local.clone(), requester.username.clone(), scan_config, connector.clone());
        gossip.scan().await;

        let online = gossip.table().online();
        info!("{} peers online", online.len());
        for record in online {
            info!(
                "  {} {}",
                record.peer_id,
                record.username.as_deref().unwrap_or("(anonymous)")
            );
        }
    }

    let session = ReceiveSession::new(config.clone());

    // 상태/진행률 출력
    let mut status = session.status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = status.borrow().clone();
            info!("Status: {}", current);
        }
    });
    let mut progress = session.progress();
    tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let p = progress.borrow().clone();
            info!(
                "Progress: {} {:.1}% (overall {:.1}%)",
                p.file_name, p.file_progress, p.overall_progress
            );
        }
    });

    let sink = FsSink::new(&requester.output_dir);
    let outcome = match session.connect_and_run(&connector, &holder, &sink).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!("{}", session.current_status());
            return Err(e.into());
        }
    };

    let total_bytes: u64 = outcome.files.iter().map(|f| f.descriptor.size).sum();
    info!("Transfer complete!");
    info!("  Files: {}", outcome.files.len());
    info!("  Bytes: {}", total_bytes);
    info!("  {}", outcome.stats.summary());
    for (path, reason) in &outcome.report.failed {
        warn!("  저장 실패 {}: {}", path, reason);
    }

    // 완료 전송은 대기열로
    let queue = TransferQueue::new(QueueGrouping::ByTransfer, config.queue_grace()).shared();
    let now = Instant::now();
    let id = queue.lock().enqueue(holder.to_string(), outcome.files, now);
    {
        let mut queue = queue.lock();
        queue.set_status(id, QueueStatus::Downloading, now)?;
        queue.set_status(id, QueueStatus::Completed, now)?;
        for entry in queue.entries() {
            info!(
                "Queue #{} from {}: {} files, {} bytes [{}]",
                entry.id,
                entry.sender_name,
                entry.files.len(),
                entry.total_size(),
                entry.status
            );
        }
    }

    tokio::time::sleep(config.queue_grace()).await;
    let purged = queue.lock().purge_expired(Instant::now());
    info!("Released {} queue entries", purged.len());

    Ok(())
}
