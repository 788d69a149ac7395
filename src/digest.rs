//! 내용 해시 (MD5)
//!
//! 무결성 검증과 ledger 키로 사용. ledger에는 소문자 hex로 기록

use std::fmt;
use std::str::FromStr;

use md5::{Digest, Md5};

use crate::Error;

/// 16바이트 MD5 다이제스트
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 16]);

impl ContentHash {
    /// 데이터의 해시 계산
    pub fn of(data: &[u8]) -> Self {
        let digest = Md5::digest(data);
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// 소문자 hex
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// 로그/파일명용 앞 8자리
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl FromStr for ContentHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(s.trim(), &mut bytes)
            .map_err(|_| Error::InvalidHash(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}
