//! 수신자
//!
//! - Header로 세션 시작 (항상 하나, 새 Header가 오면 교체)
//! - 청크 조립, EOF 후 grace 동안 조용하면 누락 청크 NACK
//! - 전부 모이면 MD5 검증, 불일치면 전체 재요청
//! - NACK 라운드 상한을 넘거나 너무 오래 조용하면 FAIL 후 포기
//! - 완료 시 원자적으로 저장 → ledger 기록 → OK → 복호화 단계

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::chunk::{ChunkAssembly, Insert};
use crate::collaborator::DecryptStage;
use crate::digest::ContentHash;
use crate::frame::{Frame, Header, Status};
use crate::ledger::Ledger;
use crate::link::{Link, LinkMode};
use crate::stats::TransferStats;
use crate::{chunk_count, Config, Result};

/// 세션 포기 원인
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonCause {
    /// NACK 라운드 상한
    NackRoundsExhausted,

    /// 세션이 너무 오래 조용함
    Idle,
}

/// 세션 평가 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// 계속 수집
    Pending,

    /// 완료 + 검증된 데이터
    Complete(Bytes),

    /// 재전송 요청할 seq 목록 (오름차순)
    Retransmit(Vec<u32>),

    /// 포기 (FAIL 전송)
    Abandon(AbandonCause),
}

/// 진행 중인 수신 세션
#[derive(Debug)]
pub struct ReceiverSession {
    header: Header,
    assembly: ChunkAssembly,
    eof_seen: bool,
    last_activity: Instant,
    nack_round: u32,
}

impl ReceiverSession {
    pub fn new(header: Header, now: Instant) -> Self {
        Self {
            assembly: ChunkAssembly::new(header.total_chunks),
            header,
            eof_seen: false,
            last_activity: now,
            nack_round: 0,
        }
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn nack_round(&self) -> u32 {
        self.nack_round
    }

    pub fn eof_seen(&self) -> bool {
        self.eof_seen
    }

    pub fn received(&self) -> usize {
        self.assembly.received()
    }

    /// Data/Eof 반영. Data면 삽입 결과 반환
    ///
    /// Header와 Status는 여기서 다루지 않음
    pub fn on_frame(&mut self, frame: Frame, now: Instant) -> Option<Insert> {
        match frame {
            Frame::Data { seq, payload } => {
                let insert = self.assembly.insert(seq, payload);
                if insert != Insert::OutOfRange {
                    self.last_activity = now;
                }
                Some(insert)
            }
            Frame::Eof => {
                self.eof_seen = true;
                self.last_activity = now;
                None
            }
            Frame::Header(_) | Frame::Status(_) => None,
        }
    }

    /// 손상 프레임도 링크가 살아 있다는 신호
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// 다음 판정 시각 (EOF grace 만료 또는 idle 만료)
    pub fn next_deadline(&self, config: &Config) -> Instant {
        let idle = self.last_activity + config.session_timeout() + Duration::from_millis(1);
        if self.eof_seen {
            let grace = self.last_activity + config.eof_grace() + Duration::from_millis(1);
            grace.min(idle)
        } else {
            idle
        }
    }

    /// 현재 상태 판정
    pub fn evaluate(&mut self, now: Instant, config: &Config) -> Verdict {
        if self.assembly.is_complete() {
            if let Some(data) = self.assembly.assemble(self.header.total_bytes as usize) {
                if ContentHash::of(&data) == self.header.content_hash {
                    return Verdict::Complete(data);
                }
            }

            // 어느 청크가 깨졌는지 알 수 없으므로 전부 다시 받음
            warn!(
                "all chunks present but MD5 mismatch (expected {}), requesting full retransmit",
                self.header.content_hash
            );
            self.assembly.clear();
            let all = (0..self.header.total_chunks).collect();
            return self.request(all, now, config);
        }

        let idle = now.saturating_duration_since(self.last_activity);
        if self.eof_seen && idle > config.eof_grace() {
            let missing = self.assembly.missing();
            info!(
                "missing {} of {} chunks, requesting retransmit",
                missing.len(),
                self.header.total_chunks
            );
            return self.request(missing, now, config);
        }

        if idle > config.session_timeout() {
            return Verdict::Abandon(AbandonCause::Idle);
        }

        Verdict::Pending
    }

    fn request(&mut self, mut seqs: Vec<u32>, now: Instant, config: &Config) -> Verdict {
        if self.nack_round >= config.receiver_max_nack_rounds {
            return Verdict::Abandon(AbandonCause::NackRoundsExhausted);
        }

        self.nack_round += 1;
        self.eof_seen = false;
        self.last_activity = now;
        seqs.truncate(config.max_nack_entries);
        Verdict::Retransmit(seqs)
    }
}

/// Header 타당성 검사, 문제가 있으면 사유
pub fn header_problem(header: &Header, config: &Config) -> Option<String> {
    let total_bytes = header.total_bytes as usize;
    if total_bytes > config.max_transfer_bytes {
        return Some(format!(
            "total_bytes {} exceeds limit {}",
            total_bytes, config.max_transfer_bytes
        ));
    }

    let expected = chunk_count(total_bytes);
    if header.total_chunks as usize != expected {
        return Some(format!(
            "total_chunks {} inconsistent with {} bytes (expected {})",
            header.total_chunks, total_bytes, expected
        ));
    }

    None
}

/// 세션 종료 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// 새 파일 저장
    Delivered {
        path: PathBuf,
        content_hash: ContentHash,
    },

    /// 이미 받은 파일 (저장 없이 OK)
    Duplicate { content_hash: ContentHash },

    /// FAIL 후 포기
    Abandoned {
        content_hash: ContentHash,
        cause: AbandonCause,
    },
}

/// 수신 감독 루프
pub struct Receiver<L: Link> {
    config: Config,
    link: L,
    ledger: Ledger,
    output_dir: PathBuf,
    decrypt: Option<DecryptStage>,
    session: Option<ReceiverSession>,
    stats: TransferStats,
    listening: bool,
    last_waiting_log: Option<Instant>,
}

impl<L: Link> Receiver<L> {
    pub fn new(config: Config, link: L, output_dir: impl Into<PathBuf>, ledger: Ledger) -> Result<Self> {
        let output_dir = output_dir.into();
        std::fs::create_dir_all(&output_dir)?;

        Ok(Self {
            config,
            link,
            ledger,
            output_dir,
            decrypt: None,
            session: None,
            stats: TransferStats::new(),
            listening: false,
            last_waiting_log: None,
        })
    }

    /// 수신 후 복호화 단계 설정
    pub fn with_decrypt_stage(mut self, stage: DecryptStage) -> Self {
        self.decrypt = Some(stage);
        self
    }

    /// 무한 루프. 에러가 나면 세션을 버리고 Listen으로 돌아감
    pub async fn run(&mut self) {
        info!(
            "receiver started: mode={}, output={:?}",
            self.config.mode, self.output_dir
        );

        loop {
            match self.step().await {
                Ok(Some(outcome)) => debug!("session finished: {:?}", outcome),
                Ok(None) => {}
                Err(e) => {
                    warn!("Error: {}", e);
                    self.session = None;
                    self.listening = false;
                    tokio::time::sleep(self.config.listen_startup()).await;
                }
            }
        }
    }

    /// 한 번 폴링하고 필요하면 Status 전송
    ///
    /// 세션이 끝난 경우에만 `Some`
    pub async fn step(&mut self) -> Result<Option<SessionOutcome>> {
        if !self.listening {
            self.link.set_mode(LinkMode::Listen).await?;
            self.listening = true;
        }

        if self.session.is_none() {
            self.await_header().await?;
            return Ok(None);
        }

        self.collect().await
    }

    async fn await_header(&mut self) -> Result<()> {
        let now = Instant::now();
        let due = self
            .last_waiting_log
            .map_or(true, |at| now.duration_since(at) >= self.config.waiting_log_interval());
        if due {
            info!("waiting for header... ({})", self.stats);
            self.last_waiting_log = Some(now);
        }

        let Some(packet) = self.link.try_receive(self.config.header_wait()).await? else {
            return Ok(());
        };
        self.stats.frames_received += 1;

        match Frame::decode(&packet) {
            Ok(Frame::Header(header)) => self.begin(header),
            Ok(frame) => debug!("no session, {:?} frame ignored", frame.kind()),
            Err(e) => {
                self.stats.frames_dropped += 1;
                warn!("잘못된 프레임 버림: {}", e);
            }
        }
        Ok(())
    }

    /// 새 세션 시작 (진행 중인 세션은 교체)
    fn begin(&mut self, header: Header) {
        if let Some(problem) = header_problem(&header, &self.config) {
            warn!("header rejected: {}", problem);
            return;
        }

        match &self.session {
            Some(current) if current.header == header && current.received() == 0 => {
                debug!("header repeat");
                return;
            }
            Some(current) => warn!(
                "new header replaces transfer {} ({}/{} chunks)",
                current.header.content_hash,
                current.received(),
                current.header.total_chunks
            ),
            None => {}
        }

        info!(
            "Receiving {} chunks ({} bytes), md5={}",
            header.total_chunks, header.total_bytes, header.content_hash
        );
        self.session = Some(ReceiverSession::new(header, Instant::now()));
    }

    async fn collect(&mut self) -> Result<Option<SessionOutcome>> {
        let wait = match &self.session {
            Some(session) => session
                .next_deadline(&self.config)
                .saturating_duration_since(Instant::now())
                .min(self.config.poll_timeout()),
            None => return Ok(None),
        };

        let packet = self.link.try_receive(wait).await?;
        let now = Instant::now();

        if let Some(packet) = packet {
            self.stats.frames_received += 1;
            match Frame::decode(&packet) {
                Ok(Frame::Header(header)) => {
                    self.begin(header);
                    return Ok(None);
                }
                Ok(frame) => self.absorb(frame, now),
                Err(e) => {
                    self.stats.frames_dropped += 1;
                    warn!("잘못된 프레임 버림: {}", e);
                    if let Some(session) = self.session.as_mut() {
                        session.touch(now);
                    }
                }
            }
        }

        let Some(session) = self.session.as_mut() else {
            return Ok(None);
        };
        let verdict = session.evaluate(now, &self.config);
        let header = *session.header();

        match verdict {
            Verdict::Pending => Ok(None),
            Verdict::Complete(data) => {
                self.session = None;
                self.complete(data).await.map(Some)
            }
            Verdict::Retransmit(seqs) => {
                self.stats.record_nack_round();
                self.send_statuses(Status::nack_batches(&seqs)).await?;
                Ok(None)
            }
            Verdict::Abandon(cause) => {
                self.session = None;
                self.stats.transfers_abandoned += 1;
                warn!("Giving up on {}: {:?}", header.content_hash, cause);
                self.send_statuses(vec![Status::Fail]).await?;
                Ok(Some(SessionOutcome::Abandoned {
                    content_hash: header.content_hash,
                    cause,
                }))
            }
        }
    }

    fn absorb(&mut self, frame: Frame, now: Instant) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        match session.on_frame(frame, now) {
            Some(Insert::Duplicate) => self.stats.duplicate_chunks += 1,
            Some(Insert::OutOfRange) => {
                self.stats.frames_dropped += 1;
                warn!("범위 밖 seq 버림 (total {})", session.header.total_chunks);
            }
            Some(Insert::New) | None => {}
        }
    }

    async fn complete(&mut self, data: Bytes) -> Result<SessionOutcome> {
        let content_hash = ContentHash::of(&data);

        if self.ledger.contains(&content_hash) {
            info!("Duplicate file detected ({}), skipping save/decrypt", content_hash);
            self.stats.transfers_duplicate += 1;
            self.send_statuses(vec![Status::Ok]).await?;
            return Ok(SessionOutcome::Duplicate { content_hash });
        }

        let path = write_artifact(&self.output_dir, &data, &content_hash)?;
        self.ledger.record(content_hash)?;
        self.stats.transfers_delivered += 1;
        self.stats.bytes_delivered += data.len() as u64;
        info!("MD5 OK, saved {:?} ({} bytes)", path.file_name(), data.len());

        self.send_statuses(vec![Status::Ok]).await?;

        if let Some(stage) = &self.decrypt {
            stage.hand_off(&path).await;
        }

        Ok(SessionOutcome::Delivered { path, content_hash })
    }

    /// Status 프레임 전송 후 Listen 복귀
    ///
    /// 프레임별로 재시도. ACK 못 받은 프레임은 로그만 남김
    async fn send_statuses(&mut self, statuses: Vec<Status>) -> Result<()> {
        self.listening = false;
        self.link.set_mode(LinkMode::Transmit).await?;

        let limit = self.config.status_retry_limit.max(1);

        for status in statuses {
            let packet = Frame::Status(status.clone()).encode()?;
            let mut sent = false;

            for attempt in 0..limit {
                match self.link.send(&packet).await {
                    Ok(()) => {
                        self.stats.frames_sent += 1;
                        sent = true;
                        break;
                    }
                    Err(e) => {
                        self.stats.write_failures += 1;
                        debug!("status write attempt {} failed: {}", attempt + 1, e);
                        tokio::time::sleep(self.config.status_backoff(attempt)).await;
                    }
                }
            }

            if sent {
                info!("send_status msg='{}'", status.to_text());
            } else {
                self.stats.frames_given_up += 1;
                warn!(
                    "status '{}' not acknowledged after {} attempts",
                    status.to_text(),
                    limit
                );
            }
        }

        self.link.set_mode(LinkMode::Listen).await?;
        self.listening = true;
        Ok(())
    }

    pub fn session(&self) -> Option<&ReceiverSession> {
        self.session.as_ref()
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

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

/// `received_<unix>_<hash8>.bin`으로 원자적 저장 (`.part`에 쓰고 rename)
fn write_artifact(dir: &Path, data: &[u8], hash: &ContentHash) -> Result<PathBuf> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let name = format!("received_{}_{}.bin", timestamp, hash.short());
    let path = dir.join(&name);
    let partial = dir.join(format!("{}.part", name));

    std::fs::write(&partial, data)?;
    std::fs::rename(&partial, &path)?;
    Ok(path)
}
