//! 송신자
//!
//! - Header 반복 전송 (ACK 없음, 중복이 유일한 손실 대책)
//! - 청크 순차 전송, 청크별 제한된 재시도 + 선형 backoff
//! - EOF 후 Status 대기: OK / NACK(요청 청크만 재전송) / 그 외는 포기
//! - 감독 루프: outbox 스캔, ledger로 재전송 방지, 파일별 실패는 로그만

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::chunk;
use crate::collaborator::EncryptStage;
use crate::digest::ContentHash;
use crate::frame::{Frame, Header, Status};
use crate::ledger::Ledger;
use crate::link::{Link, LinkMode};
use crate::stats::TransferStats;
use crate::{Config, Error, Result, MAX_CHUNK_PAYLOAD};

/// 전송 대상 컨테이너 확장자
pub const CONTAINER_SUFFIX: &str = ".bin";

/// 전송 완료 마커 접미어 (`x.bin` -> `x.bin.sent`)
pub const SENT_SUFFIX: &str = ".sent";

/// 파일 하나의 전송 상태
#[derive(Debug)]
pub struct SenderTransfer {
    content_hash: ContentHash,
    total_bytes: u32,
    chunks: Vec<Bytes>,
    nack_round: u32,
}

impl SenderTransfer {
    /// 데이터를 청크로 분할하고 해시 계산
    pub fn new(data: Bytes, config: &Config) -> Result<Self> {
        let max = config.max_transfer_bytes.min(u32::MAX as usize);
        if data.len() > max {
            return Err(Error::PayloadTooLarge {
                len: data.len(),
                max,
            });
        }

        Ok(Self {
            content_hash: ContentHash::of(&data),
            total_bytes: data.len() as u32,
            chunks: chunk::split(&data, MAX_CHUNK_PAYLOAD),
            nack_round: 0,
        })
    }

    pub fn header(&self) -> Header {
        Header {
            total_bytes: self.total_bytes,
            total_chunks: self.total_chunks(),
            content_hash: self.content_hash,
        }
    }

    pub fn total_chunks(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub fn content_hash(&self) -> ContentHash {
        self.content_hash
    }

    pub fn nack_round(&self) -> u32 {
        self.nack_round
    }

    /// seq 청크의 Data 패킷 (범위 밖이면 `None`)
    fn data_packet(&self, seq: u32) -> Result<Option<Vec<u8>>> {
        match self.chunks.get(seq as usize) {
            Some(payload) => Ok(Some(Frame::data(seq, payload.clone())?.encode()?)),
            None => Ok(None),
        }
    }
}

/// 포기 사유
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbandonReason {
    /// Status 대기 타임아웃
    StatusTimeout,

    /// 수신측 FAIL
    ReceiverFailed,

    /// 알 수 없는 Status 문자열
    Unrecognized(String),

    /// NACK 라운드 상한 초과
    NackRoundsExhausted,
}

/// 전송 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Delivered {
        content_hash: ContentHash,
        nack_rounds: u32,
    },
    Abandoned {
        content_hash: ContentHash,
        reason: AbandonReason,
    },
}

impl TransferOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, TransferOutcome::Delivered { .. })
    }
}

/// 송신 세션 상태
#[derive(Debug)]
enum SenderState {
    SendHeader,
    SendChunks,
    SendEof,
    AwaitStatus,
    Retransmit(Vec<u32>),
    Done,
    Abandoned(AbandonReason),
}

/// 쓰기 재시도 정책 종류
#[derive(Debug, Clone, Copy)]
enum WriteKind {
    Chunk,
    Retransmit,
}

/// 송신 세션 (파일 하나)
pub struct SenderSession<'a, L: Link> {
    link: &'a mut L,
    config: &'a Config,
    stats: &'a mut TransferStats,
    transfer: SenderTransfer,
}

impl<'a, L: Link> SenderSession<'a, L> {
    pub fn new(
        link: &'a mut L,
        config: &'a Config,
        stats: &'a mut TransferStats,
        transfer: SenderTransfer,
    ) -> Self {
        Self {
            link,
            config,
            stats,
            transfer,
        }
    }

    /// 종료 상태까지 실행
    ///
    /// 링크 모드 전환 실패 같은 에러만 `Err`. 프로토콜상 실패는 `Abandoned`
    pub async fn run(mut self) -> Result<TransferOutcome> {
        let mut state = SenderState::SendHeader;

        loop {
            state = match state {
                SenderState::SendHeader => {
                    self.link.set_mode(LinkMode::Transmit).await?;
                    self.send_header().await?;
                    SenderState::SendChunks
                }
                SenderState::SendChunks => {
                    self.send_chunks().await?;
                    SenderState::SendEof
                }
                SenderState::SendEof => {
                    self.send_eof().await?;
                    SenderState::AwaitStatus
                }
                SenderState::AwaitStatus => self.await_status().await?,
                SenderState::Retransmit(seqs) => self.retransmit(&seqs).await?,
                SenderState::Done => {
                    return Ok(TransferOutcome::Delivered {
                        content_hash: self.transfer.content_hash,
                        nack_rounds: self.transfer.nack_round,
                    });
                }
                SenderState::Abandoned(reason) => {
                    return Ok(TransferOutcome::Abandoned {
                        content_hash: self.transfer.content_hash,
                        reason,
                    });
                }
            };
        }
    }

    async fn send_header(&mut self) -> Result<()> {
        let packet = Frame::Header(self.transfer.header()).encode()?;

        for i in 0..self.config.header_repeats {
            let ok = self.write_once(&packet).await;
            debug!("header write #{} success={}", i + 1, ok);
            tokio::time::sleep(self.config.header_pause()).await;
        }
        Ok(())
    }

    async fn send_chunks(&mut self) -> Result<()> {
        let total = self.transfer.total_chunks();

        for seq in 0..total {
            if let Some(packet) = self.transfer.data_packet(seq)? {
                if !self.write_with_retry(&packet, WriteKind::Chunk).await {
                    // 여기서는 포기하지 않음, 누락은 NACK 루프가 복구
                    warn!("Chunk {} failed after retries", seq);
                }
            }

            if seq > 0 && seq % 1000 == 0 {
                info!("sent chunk {}/{}", seq, total);
            }
            tokio::time::sleep(self.config.inter_chunk_pause()).await;
        }
        Ok(())
    }

    async fn send_eof(&mut self) -> Result<()> {
        let packet = Frame::Eof.encode()?;
        let ok = self.write_once(&packet).await;
        debug!("sent EOF (success={})", ok);
        Ok(())
    }

    async fn await_status(&mut self) -> Result<SenderState> {
        self.link.set_mode(LinkMode::Listen).await?;
        tokio::time::sleep(self.config.listen_startup()).await;

        let deadline = Instant::now() + self.config.status_timeout();
        let Some(status) = self.next_status(deadline).await? else {
            warn!("no status received (timeout)");
            return Ok(SenderState::Abandoned(AbandonReason::StatusTimeout));
        };

        info!("Got STATUS: {}", status.to_text());
        match status {
            Status::Ok => Ok(SenderState::Done),
            Status::Fail => Ok(SenderState::Abandoned(AbandonReason::ReceiverFailed)),
            Status::Other(text) => Ok(SenderState::Abandoned(AbandonReason::Unrecognized(text))),
            Status::Nack(seqs) => self.collect_nack_batch(seqs).await,
        }
    }

    /// NACK 배치의 나머지 프레임 수집
    ///
    /// `nack_batch_gap` 동안 새 프레임이 없으면 배치 끝
    async fn collect_nack_batch(&mut self, first: Vec<u32>) -> Result<SenderState> {
        let mut requested: BTreeSet<u32> = first.into_iter().collect();

        loop {
            let deadline = Instant::now() + self.config.nack_batch_gap();
            match self.next_status(deadline).await? {
                None => break,
                Some(Status::Nack(more)) => requested.extend(more),
                Some(Status::Ok) => return Ok(SenderState::Done),
                Some(Status::Fail) => {
                    return Ok(SenderState::Abandoned(AbandonReason::ReceiverFailed))
                }
                Some(Status::Other(text)) => {
                    return Ok(SenderState::Abandoned(AbandonReason::Unrecognized(text)))
                }
            }
        }

        Ok(SenderState::Retransmit(requested.into_iter().collect()))
    }

    /// deadline까지 Status 프레임 하나 대기, 다른 프레임은 버림
    async fn next_status(&mut self, deadline: Instant) -> Result<Option<Status>> {
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let Some(packet) = self.link.try_receive(deadline - now).await? else {
                return Ok(None);
            };
            self.stats.frames_received += 1;

            match Frame::decode(&packet) {
                Ok(Frame::Status(status)) => return Ok(Some(status)),
                Ok(frame) => debug!("non-status packet ignored: {:?}", frame.kind()),
                Err(e) => {
                    self.stats.frames_dropped += 1;
                    warn!("잘못된 프레임 버림: {}", e);
                }
            }
        }
    }

    async fn retransmit(&mut self, seqs: &[u32]) -> Result<SenderState> {
        if self.transfer.nack_round >= self.config.sender_max_nack_rounds {
            warn!(
                "NACK 라운드 상한 초과 ({}), 전송 포기",
                self.config.sender_max_nack_rounds
            );
            return Ok(SenderState::Abandoned(AbandonReason::NackRoundsExhausted));
        }

        self.transfer.nack_round += 1;
        self.stats.record_nack_round();
        info!(
            "NACK round {}: {} missing",
            self.transfer.nack_round,
            seqs.len()
        );

        self.link.set_mode(LinkMode::Transmit).await?;
        for &seq in seqs {
            let Some(packet) = self.transfer.data_packet(seq)? else {
                debug!("범위 밖 seq 무시: {}", seq);
                continue;
            };

            if self.write_with_retry(&packet, WriteKind::Retransmit).await {
                self.stats.chunks_retransmitted += 1;
            } else {
                warn!(
                    "retransmit seq {} failed after {} attempts",
                    seq, self.config.retransmit_retry_limit
                );
            }
            tokio::time::sleep(self.config.inter_chunk_pause()).await;
        }

        Ok(SenderState::SendEof)
    }

    /// 한 번만 쓰기
    async fn write_once(&mut self, packet: &[u8]) -> bool {
        match self.link.send(packet).await {
            Ok(()) => {
                self.stats.frames_sent += 1;
                true
            }
            Err(e) => {
                self.stats.write_failures += 1;
                debug!("write failed: {}", e);
                false
            }
        }
    }

    /// 제한된 재시도 + 선형 backoff
    async fn write_with_retry(&mut self, packet: &[u8], kind: WriteKind) -> bool {
        let config = self.config;
        let limit = match kind {
            WriteKind::Chunk => config.chunk_retry_limit,
            WriteKind::Retransmit => config.retransmit_retry_limit,
        }
        .max(1);

        for attempt in 0..limit {
            if self.write_once(packet).await {
                return true;
            }

            let backoff = match kind {
                WriteKind::Chunk => config.chunk_backoff(attempt),
                WriteKind::Retransmit => config.retransmit_backoff(attempt),
            };
            tokio::time::sleep(backoff).await;
        }

        self.stats.frames_given_up += 1;
        false
    }
}

/// 스캔 한 번의 결과
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    /// 새로 전달된 파일 수
    pub delivered: usize,

    /// ledger에 이미 있어 건너뛴 파일 수
    pub already_sent: usize,

    /// 포기한 파일 수 (다음 스캔에서 재시도)
    pub abandoned: usize,

    /// 에러로 처리하지 못한 파일 수
    pub errors: usize,
}

impl ScanReport {
    pub fn attempted(&self) -> usize {
        self.delivered + self.abandoned + self.errors
    }
}

/// 파일 하나 처리 결과
enum Candidate {
    Delivered,
    AlreadySent,
    Abandoned,
}

/// 송신 감독 루프
pub struct Sender<L: Link> {
    config: Config,
    link: L,
    ledger: Ledger,
    outbox: PathBuf,
    encrypt: Option<EncryptStage>,
    stats: TransferStats,
}

impl<L: Link> Sender<L> {
    /// 송신자 생성
    ///
    /// outbox의 기존 `.bin.sent` 마커 해시를 ledger에 반영
    pub fn new(config: Config, link: L, outbox: impl Into<PathBuf>, mut ledger: Ledger) -> Result<Self> {
        let outbox = outbox.into();
        std::fs::create_dir_all(&outbox)?;

        let marker_suffix = format!("{}{}", CONTAINER_SUFFIX, SENT_SUFFIX);
        ledger.reconcile_markers(&outbox, &marker_suffix)?;
        info!("loaded {} sent hashes", ledger.len());

        Ok(Self {
            config,
            link,
            ledger,
            outbox,
            encrypt: None,
            stats: TransferStats::new(),
        })
    }

    /// 전송 전 암호화 단계 설정
    pub fn with_encrypt_stage(mut self, stage: EncryptStage) -> Self {
        self.encrypt = Some(stage);
        self
    }

    /// 무한 루프: 스캔, heartbeat, 대기
    pub async fn run(&mut self) {
        info!(
            "transmitter started: mode={}, outbox={:?}",
            self.config.mode, self.outbox
        );
        let mut last_heartbeat = Instant::now();

        loop {
            match self.scan_once().await {
                Ok(report) if report.attempted() > 0 => info!("scan: {:?}", report),
                Ok(_) => {}
                Err(e) => warn!("main loop exception: {}", e),
            }

            if last_heartbeat.elapsed() >= self.config.heartbeat_interval() {
                info!("heartbeat - running; {}", self.stats);
                last_heartbeat = Instant::now();
            }

            tokio::time::sleep(self.config.scan_interval()).await;
        }
    }

    /// outbox 한 번 스캔
    ///
    /// 파일별 에러는 로그만 남기고 다음 파일로 진행
    pub async fn scan_once(&mut self) -> Result<ScanReport> {
        std::fs::create_dir_all(&self.outbox)?;

        if let Some(stage) = &self.encrypt {
            if let Err(e) = stage.refresh(&self.outbox).await {
                warn!("encrypt error: {}", e);
            }
        }

        let mut report = ScanReport::default();
        for path in self.candidates()? {
            match self.process(&path).await {
                Ok(Candidate::Delivered) => report.delivered += 1,
                Ok(Candidate::AlreadySent) => report.already_sent += 1,
                Ok(Candidate::Abandoned) => report.abandoned += 1,
                Err(e) => {
                    report.errors += 1;
                    warn!("send_file exception for {:?}: {}", path, e);
                }
            }
        }

        Ok(report)
    }

    /// 메모리 데이터 전송 (ledger/마커 처리 없음)
    pub async fn send_bytes(&mut self, data: Bytes) -> Result<TransferOutcome> {
        let transfer = SenderTransfer::new(data, &self.config)?;
        let outcome =
            SenderSession::new(&mut self.link, &self.config, &mut self.stats, transfer)
                .run()
                .await?;

        if outcome.is_delivered() {
            self.stats.transfers_delivered += 1;
        } else {
            self.stats.transfers_abandoned += 1;
        }
        Ok(outcome)
    }

    /// 전송 대기 파일 목록 (`*.bin`, 이름순)
    fn candidates(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.outbox)? {
            let path = entry?.path();
            let is_container = path
                .file_name()
                .and_then(|name| name.to_str())
                .map_or(false, |name| name.ends_with(CONTAINER_SUFFIX));
            if is_container && path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    async fn process(&mut self, path: &Path) -> Result<Candidate> {
        let data = Bytes::from(std::fs::read(path)?);
        let len = data.len();
        let transfer = SenderTransfer::new(data, &self.config)?;
        let hash = transfer.content_hash();

        if self.ledger.contains(&hash) {
            info!("skipping already-confirmed {:?}", path.file_name());
            mark_sent(path);
            return Ok(Candidate::AlreadySent);
        }

        info!(
            "Sending {:?}: {} bytes, {} chunks, md5={}",
            path.file_name(),
            len,
            transfer.total_chunks(),
            hash
        );

        let outcome =
            SenderSession::new(&mut self.link, &self.config, &mut self.stats, transfer)
                .run()
                .await?;

        match outcome {
            TransferOutcome::Delivered { nack_rounds, .. } => {
                mark_sent(path);
                self.ledger.record(hash)?;
                self.stats.transfers_delivered += 1;
                self.stats.bytes_delivered += len as u64;
                info!(
                    "Sent {:?} OK after {} NACK rounds",
                    path.file_name(),
                    nack_rounds
                );
                Ok(Candidate::Delivered)
            }
            TransferOutcome::Abandoned { reason, .. } => {
                self.stats.transfers_abandoned += 1;
                warn!(
                    "Did not confirm {:?}, final status={:?}",
                    path.file_name(),
                    reason
                );
                Ok(Candidate::Abandoned)
            }
        }
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// `x.bin` -> `x.bin.sent`
pub fn sent_marker(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(SENT_SUFFIX);
    PathBuf::from(name)
}

/// 전송 완료 마커로 이름 변경
///
/// 원본이 이미 없으면 아무것도 안 함. 오래된 마커는 새 내용으로 교체
fn mark_sent(path: &Path) {
    if !path.exists() {
        debug!("already renamed: {:?}", path.file_name());
        return;
    }

    let marker = sent_marker(path);
    match std::fs::rename(path, &marker) {
        Ok(()) => info!("moved {:?} -> {:?}", path.file_name(), marker.file_name()),
        Err(e) => warn!("rename error {:?}: {}", path, e),
    }
}
