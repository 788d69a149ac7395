//! 에러 타입 정의

use thiserror::Error;

use crate::frame::FrameError;
use crate::link::LinkMode;

/// RFT 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("프레임 에러: {0}")]
    Frame(#[from] FrameError),

    #[error("설정 파싱 에러: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("설정 직렬화 에러: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    /// 링크 레벨 쓰기 실패 (auto-ack 타임아웃)
    #[error("ACK 없음")]
    NotAcknowledged,

    #[error("링크 모드 불일치: expected {expected:?}, got {actual:?}")]
    WrongMode { expected: LinkMode, actual: LinkMode },

    #[error("패킷 크기 초과: {len} > {max}")]
    PacketTooLarge { len: usize, max: usize },

    #[error("전송 크기 초과: {len} bytes (최대 {max})")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("링크 종료")]
    LinkClosed,

    #[error("유효하지 않은 해시: {0}")]
    InvalidHash(String),

    #[error("외부 프로그램 실패: {program} ({status})")]
    Collaborator { program: String, status: String },
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
