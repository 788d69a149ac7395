//! RFT 수신 프로세스
//!
//! 링크에서 전송을 받아 MD5 검증 후 `received_<unix>_<hash8>.bin`으로
//! 저장하고, 선택적으로 복호화 프로그램에 넘김
//!
//! 사용법:
//!   rft-receiver --peer 192.168.0.10:7001 --recv-dir ./received
//!
//! 예시:
//!   rft-receiver --peer 10.0.0.1:7001 --decrypt-cmd "python3 /opt/decryption.py" \
//!       --key ./key.txt --decrypt-dir ./decrypted

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rft::collaborator::{Collaborator, DecryptStage};
use rft::{Config, Ledger, Mode, Receiver, UdpLink};

/// 모드 미지정 시 프리셋
const DEFAULT_MODE: Mode = Mode::Robust;

/// RFT 수신자
#[derive(Parser, Debug)]
#[command(name = "rft-receiver")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 운용 모드 (기본: robust, 설정 파일의 mode보다 우선)
    #[arg(long, value_enum, env = "RFT_MODE")]
    mode: Option<Mode>,

    /// 설정 파일 (TOML). 적힌 항목만 모드 프리셋을 덮어씀
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 로컬 바인드 주소
    #[arg(short, long, default_value = "0.0.0.0:7000")]
    bind: SocketAddr,

    /// 송신측 주소
    #[arg(short, long)]
    peer: SocketAddr,

    /// 수신 파일 저장 디렉터리
    #[arg(short, long, default_value = "received")]
    recv_dir: PathBuf,

    /// 수신 완료 ledger (기본: <recv-dir>/received_hashes.txt)
    #[arg(long)]
    ledger: Option<PathBuf>,

    /// 복호화 명령 (artifact, output_dir, key 인자가 덧붙음)
    #[arg(long, requires = "key")]
    decrypt_cmd: Option<String>,

    /// 복호화 출력 디렉터리
    #[arg(long, default_value = "decrypted")]
    decrypt_dir: PathBuf,

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

    info!("RFT receiver starting...");
    info!("Mode: {}", config.mode);
    info!("Bind address: {}, peer: {}", args.bind, args.peer);
    info!("Receive dir: {:?}", args.recv_dir);

    let link = UdpLink::bind(args.bind, args.peer).await?;
    let ledger_path = args
        .ledger
        .clone()
        .unwrap_or_else(|| args.recv_dir.join("received_hashes.txt"));
    let ledger = Ledger::open(ledger_path)?;

    let mut receiver = Receiver::new(config, link, &args.recv_dir, ledger)?;

    if let (Some(line), Some(key)) = (&args.decrypt_cmd, &args.key) {
        let collaborator = Collaborator::from_command_line(line).ok_or("empty --decrypt-cmd")?;
        info!("Decrypt stage: -> {:?}", args.decrypt_dir);
        receiver = receiver.with_decrypt_stage(DecryptStage {
            collaborator,
            output_dir: args.decrypt_dir.clone(),
            key_path: key.clone(),
        });
    }

    tokio::select! {
        _ = receiver.run() => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted, exiting"),
    }

    info!("{}", receiver.stats());
    Ok(())
}
