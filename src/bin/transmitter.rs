//! RFT 송신 프로세스
//!
//! outbox의 `*.bin` 컨테이너를 순서대로 링크로 전송하고, 확인된 파일은
//! `*.bin.sent`로 이름을 바꿈. 선택적으로 원본 이미지를 먼저 암호화
//!
//! 사용법:
//!   rft-transmitter --peer 192.168.0.20:7000 --outbox ./outbox
//!
//! 예시:
//!   # 원본 png 암호화 후 전송
//!   rft-transmitter --peer 10.0.0.2:7000 --source-dir ./images \
//!       --key ./key.txt --encrypt-cmd "python3 /opt/encryption.py"

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rft::collaborator::{Collaborator, EncryptStage};
use rft::{Config, Ledger, Mode, Sender, UdpLink};

/// 모드 미지정 시 프리셋
const DEFAULT_MODE: Mode = Mode::Fast;

/// RFT 송신자
#[derive(Parser, Debug)]
#[command(name = "rft-transmitter")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 운용 모드 (기본: fast, 설정 파일의 mode보다 우선)
    #[arg(long, value_enum, env = "RFT_MODE")]
    mode: Option<Mode>,

    /// 설정 파일 (TOML). 적힌 항목만 모드 프리셋을 덮어씀
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 로컬 바인드 주소
    #[arg(short, long, default_value = "0.0.0.0:7001")]
    bind: SocketAddr,

    /// 수신측 주소
    #[arg(short, long)]
    peer: SocketAddr,

    /// 전송 대기 컨테이너 디렉터리
    #[arg(short, long, default_value = "outbox")]
    outbox: PathBuf,

    /// 전송 완료 ledger (기본: <outbox>/sent_hashes.txt)
    #[arg(long)]
    ledger: Option<PathBuf>,

    /// 암호화 명령 (source, key, container 인자가 덧붙음)
    #[arg(long, requires = "source_dir", requires = "key")]
    encrypt_cmd: Option<String>,

    /// 원본 디렉터리
    #[arg(long)]
    source_dir: Option<PathBuf>,

    /// 원본 확장자
    #[arg(long, default_value = "png")]
    source_ext: String,

    /// 키 파일
    #[arg(long)]
    key: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load(path, args.mode, DEFAULT_MODE)?,
        None => Config::for_mode(args.mode.unwrap_or(DEFAULT_MODE)),
    };

    info!("RFT transmitter starting...");
    info!("Mode: {}", config.mode);
    info!("Bind address: {}, peer: {}", args.bind, args.peer);
    info!("Outbox: {:?}", args.outbox);

    let link = UdpLink::bind(args.bind, args.peer).await?;
    let ledger_path = args
        .ledger
        .clone()
        .unwrap_or_else(|| args.outbox.join("sent_hashes.txt"));
    let ledger = Ledger::open(ledger_path)?;

    let mut sender = Sender::new(config, link, &args.outbox, ledger)?;

    if let (Some(line), Some(source_dir), Some(key)) = (&args.encrypt_cmd, &args.source_dir, &args.key) {
        let collaborator = Collaborator::from_command_line(line).ok_or("empty --encrypt-cmd")?;
        info!("Encrypt stage: {:?} -> {:?}", source_dir, args.outbox);
        sender = sender.with_encrypt_stage(EncryptStage {
            collaborator,
            source_dir: source_dir.clone(),
            key_path: key.clone(),
            extension: args.source_ext.clone(),
        });
    }

    tokio::select! {
        _ = sender.run() => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted, exiting"),
    }

    info!("{}", sender.stats());
    Ok(())
}
