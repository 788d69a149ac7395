//! 전송 통계

use std::fmt;
use std::time::{Duration, Instant};

/// 역할별 누적 전송 통계
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 링크에 쓴 프레임 수 (ACK 받은 것만)
    pub frames_sent: u64,

    /// ACK 없이 끝난 쓰기 시도 수
    pub write_failures: u64,

    /// 재시도를 모두 소진한 프레임 수
    pub frames_given_up: u64,

    /// 수신한 프레임 수
    pub frames_received: u64,

    /// 디코딩 실패로 버린 프레임 수
    pub frames_dropped: u64,

    /// NACK으로 재전송한 청크 수
    pub chunks_retransmitted: u64,

    /// 중복 수신 청크 수
    pub duplicate_chunks: u64,

    /// NACK 라운드 수 (송신: 처리, 수신: 요청)
    pub nack_rounds: u64,

    /// 완료된 전송 수
    pub transfers_delivered: u64,

    /// 이미 ledger에 있던 전송 수
    pub transfers_duplicate: u64,

    /// 포기한 전송 수
    pub transfers_abandoned: u64,

    /// 전달한 총 바이트
    pub bytes_delivered: u64,

    /// 마지막 NACK 시간
    pub last_nack_time: Option<Instant>,

    /// 시작 시간
    pub start_time: Instant,
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            frames_sent: 0,
            write_failures: 0,
            frames_given_up: 0,
            frames_received: 0,
            frames_dropped: 0,
            chunks_retransmitted: 0,
            duplicate_chunks: 0,
            nack_rounds: 0,
            transfers_delivered: 0,
            transfers_duplicate: 0,
            transfers_abandoned: 0,
            bytes_delivered: 0,
            last_nack_time: None,
            start_time: Instant::now(),
        }
    }

    /// NACK 라운드 기록
    pub fn record_nack_round(&mut self) {
        self.nack_rounds += 1;
        self.last_nack_time = Some(Instant::now());
    }

    /// 쓰기 실패율 (0.0 ~ 1.0)
    pub fn write_failure_rate(&self) -> f64 {
        let attempts = self.frames_sent + self.write_failures;
        if attempts == 0 {
            return 0.0;
        }
        self.write_failures as f64 / attempts as f64
    }

    /// 가동 시간
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}

impl fmt::Display for TransferStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "delivered={} duplicate={} abandoned={} bytes={} frames_tx={} frames_rx={} \
             write_fail={:.1}% dropped={} nack_rounds={} retransmitted={} uptime={}s",
            self.transfers_delivered,
            self.transfers_duplicate,
            self.transfers_abandoned,
            self.bytes_delivered,
            self.frames_sent,
            self.frames_received,
            self.write_failure_rate() * 100.0,
            self.frames_dropped,
            self.nack_rounds,
            self.chunks_retransmitted,
            self.uptime().as_secs(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_failure_rate() {
        let mut stats = TransferStats::new();
        assert_eq!(stats.write_failure_rate(), 0.0);

        stats.frames_sent = 3;
        stats.write_failures = 1;
        assert!((stats.write_failure_rate() - 0.25).abs() < f64::EPSILON);

        stats.record_nack_round();
        assert_eq!(stats.nack_rounds, 1);
        assert!(stats.last_nack_time.is_some());
        assert!(stats.to_string().contains("nack_rounds=1"));
    }
}
