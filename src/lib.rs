//! # RFT (Radio File Transfer)
//!
//! 32바이트 패킷 half-duplex 무선 링크 위의 NACK 기반 파일 전송 프로토콜
//!
//! ## 핵심 특징
//! - **고정 크기 프레임**: Header / Data / Eof / Status 네 종류, 모두 `MAX_PAYLOAD` 이하
//! - **NACK 기반**: 수신측이 누락 청크만 요청, 해시 불일치 시 전체 재요청
//! - **EOF grace**: EOF 이후 일정 시간 조용하면 누락 판정
//! - **무결성 검증**: 헤더에 실린 MD5와 조립 결과 비교
//! - **Ledger**: 전송/수신 완료 해시를 파일에 기록, 재시작 후에도 중복 전달 없음
//! - **단일 전송**: 프로세스당 한 번에 하나의 전송만 진행

pub mod chunk;
pub mod collaborator;
pub mod config;
pub mod digest;
pub mod error;
pub mod frame;
pub mod ledger;
pub mod link;
pub mod receiver;
pub mod sender;
pub mod sim;
pub mod stats;

pub use chunk::{ChunkAssembly, Insert};
pub use config::{Config, Mode};
pub use digest::ContentHash;
pub use error::{Error, Result};
pub use frame::{Frame, FrameError, Header, Status};
pub use ledger::Ledger;
pub use link::{Link, LinkMode, UdpLink};
pub use receiver::{Receiver, ReceiverSession, SessionOutcome};
pub use sender::{Sender, SenderSession, SenderTransfer, TransferOutcome};
pub use stats::TransferStats;

/// 링크 최대 페이로드 (바이트, nRF24 기준)
pub const MAX_PAYLOAD: usize = 32;

/// Data 프레임 오버헤드: tag(1) + seq(4) + len(2)
pub const DATA_OVERHEAD: usize = 1 + 4 + 2;

/// Data 프레임 하나에 실리는 최대 청크 크기
pub const MAX_CHUNK_PAYLOAD: usize = MAX_PAYLOAD - DATA_OVERHEAD;

/// Header 프레임 크기: tag(1) + total_bytes(4) + total_chunks(4) + hash(16)
pub const HEADER_LEN: usize = 1 + 4 + 4 + 16;

/// `total_bytes` 바이트를 나누는 데 필요한 청크 수
pub fn chunk_count(total_bytes: usize) -> usize {
    (total_bytes + MAX_CHUNK_PAYLOAD - 1) / MAX_CHUNK_PAYLOAD
}
