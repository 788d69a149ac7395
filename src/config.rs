//! 프로토콜 설정

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Result;

/// 운용 모드
///
/// 와이어 프로토콜은 같고 페이싱, 재시도 횟수, 타임아웃만 달라짐
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// 고속/근거리 (2Mbps, PA max)
    Fast,

    /// 장거리/안정 (1Mbps, 긴 페이싱)
    Robust,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Fast => f.write_str("fast"),
            Mode::Robust => f.write_str("robust"),
        }
    }
}

/// RFT 프로토콜 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 운용 모드 (로그 표시용)
    pub mode: Mode,

    /// Header 프레임 반복 전송 횟수 (ACK 없음, 중복만이 손실 대책)
    pub header_repeats: u32,

    /// Header 반복 사이 간격 (밀리초)
    pub header_pause_ms: u64,

    /// 청크 1회 전송당 최대 쓰기 시도
    pub chunk_retry_limit: u32,

    /// 청크 재시도 backoff 기준값 (밀리초), base * (1 + attempt/2)
    pub chunk_backoff_ms: u64,

    /// 청크 사이 간격 (마이크로초)
    pub inter_chunk_pause_us: u64,

    /// NACK 재전송 시 청크당 최대 쓰기 시도
    pub retransmit_retry_limit: u32,

    /// 재전송 backoff 기준값 (밀리초), base * (attempt + 1)
    pub retransmit_backoff_ms: u64,

    /// Status 대기 타임아웃 (밀리초)
    pub status_timeout_ms: u64,

    /// listen 모드 전환 후 안정화 대기 (밀리초)
    pub listen_startup_ms: u64,

    /// NACK 배치 수집 시 프레임 간 최대 간격 (밀리초)
    pub nack_batch_gap_ms: u64,

    /// 송신측 NACK 라운드 상한
    pub sender_max_nack_rounds: u32,

    /// 수신측 NACK 라운드 상한
    pub receiver_max_nack_rounds: u32,

    /// EOF 이후 무활동 grace (밀리초)
    pub eof_grace_ms: u64,

    /// 수집 중 poll 타임아웃 (밀리초)
    pub poll_timeout_ms: u64,

    /// 대기 상태에서 Header poll 타임아웃 (밀리초)
    pub header_wait_ms: u64,

    /// 수집 세션 무활동 타임아웃 (밀리초)
    pub session_timeout_ms: u64,

    /// Status 프레임 최대 쓰기 시도
    pub status_retry_limit: u32,

    /// Status 재시도 backoff 기준값 (밀리초)
    pub status_backoff_ms: u64,

    /// NACK 라운드당 요청할 최대 seq 수
    pub max_nack_entries: usize,

    /// 허용 최대 전송 크기 (바이트)
    pub max_transfer_bytes: usize,

    /// 송신 디렉터리 스캔 주기 (밀리초)
    pub scan_interval_ms: u64,

    /// heartbeat 로그 주기 (밀리초)
    pub heartbeat_interval_ms: u64,

    /// "waiting for header" 로그 주기 (밀리초)
    pub waiting_log_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self::fast()
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 모드별 프리셋
    pub fn for_mode(mode: Mode) -> Self {
        match mode {
            Mode::Fast => Self::fast(),
            Mode::Robust => Self::robust(),
        }
    }

    /// 고속/근거리 설정
    pub fn fast() -> Self {
        Self {
            mode: Mode::Fast,
            header_repeats: 3,
            header_pause_ms: 10,
            chunk_retry_limit: 6,
            chunk_backoff_ms: 2,
            inter_chunk_pause_us: 500,       // 0.5ms
            retransmit_retry_limit: 4,
            retransmit_backoff_ms: 10,
            status_timeout_ms: 3000,
            listen_startup_ms: 20,
            nack_batch_gap_ms: 150,
            sender_max_nack_rounds: 10,
            receiver_max_nack_rounds: 3,
            eof_grace_ms: 2000,
            poll_timeout_ms: 1000,
            header_wait_ms: 2000,
            session_timeout_ms: 30_000,
            status_retry_limit: 5,
            status_backoff_ms: 10,
            max_nack_entries: 512,
            max_transfer_bytes: 16 * 1024 * 1024, // 16MB
            scan_interval_ms: 1000,
            heartbeat_interval_ms: 30_000,
            waiting_log_interval_ms: 10_000,
        }
    }

    /// 장거리/안정 설정
    pub fn robust() -> Self {
        Self {
            mode: Mode::Robust,
            inter_chunk_pause_us: 2000,      // 2ms
            nack_batch_gap_ms: 250,
            session_timeout_ms: 60_000,
            status_retry_limit: 8,
            status_backoff_ms: 15,
            ..Self::fast()
        }
    }

    /// TOML 파일에서 로드
    ///
    /// 모드 우선순위: `mode_override` > 파일의 `mode` > `default_mode`
    pub fn load(path: &Path, mode_override: Option<Mode>, default_mode: Mode) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_with_mode(&text, mode_override, default_mode)
    }

    /// TOML 문자열 파싱 (없는 항목은 `mode` 프리셋 값)
    pub fn from_toml(text: &str) -> Result<Self> {
        Self::from_toml_with_mode(text, None, Mode::Fast)
    }

    /// 모드 프리셋 위에 파일에 적힌 항목만 덮어씀
    pub fn from_toml_with_mode(
        text: &str,
        mode_override: Option<Mode>,
        default_mode: Mode,
    ) -> Result<Self> {
        let overlay: toml::Table = text.parse()?;

        let mode = match (mode_override, overlay.get("mode")) {
            (Some(mode), _) => mode,
            (None, Some(value)) => value.clone().try_into()?,
            (None, None) => default_mode,
        };

        let mut merged = toml::Table::try_from(Self::for_mode(mode))?;
        merged.extend(overlay);
        merged.insert("mode".to_string(), toml::Value::try_from(mode)?);

        Ok(toml::Value::Table(merged).try_into()?)
    }

    /// 청크 재시도 backoff (선형 증가)
    pub fn chunk_backoff(&self, attempt: u32) -> Duration {
        // base=2: 2ms, 3ms, 4ms, ...
        Duration::from_millis(self.chunk_backoff_ms * (2 + attempt as u64) / 2)
    }

    /// 재전송 backoff (선형 증가)
    pub fn retransmit_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retransmit_backoff_ms * (attempt as u64 + 1))
    }

    /// Status 쓰기 backoff (선형 증가)
    pub fn status_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.status_backoff_ms * (attempt as u64 + 1))
    }

    pub fn header_pause(&self) -> Duration {
        Duration::from_millis(self.header_pause_ms)
    }

    pub fn inter_chunk_pause(&self) -> Duration {
        Duration::from_micros(self.inter_chunk_pause_us)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }

    pub fn listen_startup(&self) -> Duration {
        Duration::from_millis(self.listen_startup_ms)
    }

    pub fn nack_batch_gap(&self) -> Duration {
        Duration::from_millis(self.nack_batch_gap_ms)
    }

    pub fn eof_grace(&self) -> Duration {
        Duration::from_millis(self.eof_grace_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn header_wait(&self) -> Duration {
        Duration::from_millis(self.header_wait_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn waiting_log_interval(&self) -> Duration {
        Duration::from_millis(self.waiting_log_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_robust_paces_slower_than_fast() {
        let fast = Config::fast();
        let robust = Config::robust();

        assert!(robust.inter_chunk_pause() > fast.inter_chunk_pause());
        assert_eq!(robust.sender_max_nack_rounds, 10);
        assert_eq!(robust.receiver_max_nack_rounds, 3);
        assert_eq!(Config::for_mode(Mode::Robust).mode, Mode::Robust);
    }

    #[test]
    fn test_chunk_backoff_is_linear() {
        let config = Config::fast();

        assert_eq!(config.chunk_backoff(0), Duration::from_millis(2));
        assert_eq!(config.chunk_backoff(2), Duration::from_millis(4));
        assert_eq!(config.retransmit_backoff(3), Duration::from_millis(40));
    }

    #[test]
    fn test_partial_toml_keeps_mode_preset() {
        let config = Config::from_toml("mode = \"robust\"\neof_grace_ms = 500\n").unwrap();
        let robust = Config::robust();

        assert_eq!(config.mode, Mode::Robust);
        assert_eq!(config.eof_grace(), Duration::from_millis(500));
        assert_eq!(config.header_repeats, 3);
        assert_eq!(config.inter_chunk_pause_us, robust.inter_chunk_pause_us);
        assert_eq!(config.session_timeout_ms, robust.session_timeout_ms);
        assert_eq!(config.status_retry_limit, robust.status_retry_limit);
    }

    #[test]
    fn test_toml_without_mode_uses_fast() {
        let config = Config::from_toml("nack_batch_gap_ms = 90\n").unwrap();

        assert_eq!(config.mode, Mode::Fast);
        assert_eq!(config.nack_batch_gap_ms, 90);
        assert_eq!(config.inter_chunk_pause_us, Config::fast().inter_chunk_pause_us);
    }

    #[test]
    fn test_mode_override_beats_file() {
        let text = "mode = \"fast\"\nheader_repeats = 5\n";
        let config = Config::from_toml_with_mode(text, Some(Mode::Robust), Mode::Fast).unwrap();

        assert_eq!(config.mode, Mode::Robust);
        assert_eq!(config.header_repeats, 5);
        assert_eq!(config.inter_chunk_pause_us, Config::robust().inter_chunk_pause_us);
        assert_eq!(config.session_timeout_ms, Config::robust().session_timeout_ms);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rft.toml");
        std::fs::write(&path, "mode = \"robust\"\n").unwrap();

        let config = Config::load(&path, None, Mode::Fast).unwrap();
        assert_eq!(config.inter_chunk_pause_us, Config::robust().inter_chunk_pause_us);

        std::fs::write(&path, "header_repeats = 4\n").unwrap();
        let config = Config::load(&path, None, Mode::Robust).unwrap();
        assert_eq!(config.mode, Mode::Robust);
        assert_eq!(config.header_repeats, 4);

        assert!(Config::load(&dir.path().join("missing.toml"), None, Mode::Fast).is_err());
    }

    #[test]
    fn test_invalid_toml_is_error() {
        assert!(Config::from_toml("header_repeats = \"three\"").is_err());
    }
}
