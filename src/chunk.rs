//! 청크 분할과 조립
//!
//! - 송신측: 파일을 `MAX_CHUNK_PAYLOAD` 크기 청크로 순서대로 분할
//! - 수신측: seq 순서와 무관하게 도착한 청크를 슬롯에 채우고 누락 목록 계산

use bytes::{Bytes, BytesMut};

/// 데이터를 `chunk_size` 단위 청크로 분할
///
/// 청크 수는 `ceil(len / chunk_size)`, 마지막 청크만 짧을 수 있음
pub fn split(data: &Bytes, chunk_size: usize) -> Vec<Bytes> {
    let mut chunks = Vec::with_capacity((data.len() + chunk_size - 1) / chunk_size);
    let mut offset = 0;

    while offset < data.len() {
        let end = (offset + chunk_size).min(data.len());
        chunks.push(data.slice(offset..end));
        offset = end;
    }

    chunks
}

/// 청크 삽입 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    /// 새 청크
    New,

    /// 이미 받은 seq, 새 내용으로 덮어씀
    Duplicate,

    /// seq가 total_chunks 이상
    OutOfRange,
}

/// 수신측 청크 조립 버퍼
///
/// seq 인덱스 슬롯. 누락 seq는 "빈 바이트"가 아니라 `None`으로 남음
#[derive(Debug)]
pub struct ChunkAssembly {
    slots: Vec<Option<Bytes>>,
    received: usize,
}

impl ChunkAssembly {
    pub fn new(total_chunks: u32) -> Self {
        Self {
            slots: vec![None; total_chunks as usize],
            received: 0,
        }
    }

    /// 청크 삽입
    pub fn insert(&mut self, seq: u32, payload: Bytes) -> Insert {
        let Some(slot) = self.slots.get_mut(seq as usize) else {
            return Insert::OutOfRange;
        };

        let previous = slot.replace(payload);
        if previous.is_some() {
            Insert::Duplicate
        } else {
            self.received += 1;
            Insert::New
        }
    }

    pub fn total_chunks(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn received(&self) -> usize {
        self.received
    }

    /// 모든 seq가 채워졌는지 (개수가 아니라 누락 없음 기준)
    pub fn is_complete(&self) -> bool {
        self.received == self.slots.len()
    }

    /// 누락된 seq 목록 (오름차순)
    pub fn missing(&self) -> Vec<u32> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(seq, _)| seq as u32)
            .collect()
    }

    /// seq 순서로 이어 붙여 `total_bytes`로 자르거나 0으로 채움
    ///
    /// 누락이 있으면 `None`
    pub fn assemble(&self, total_bytes: usize) -> Option<Bytes> {
        if !self.is_complete() {
            return None;
        }

        let mut data = BytesMut::with_capacity(total_bytes);
        for payload in self.slots.iter().flatten() {
            data.extend_from_slice(payload);
        }
        data.resize(total_bytes, 0);

        Some(data.freeze())
    }

    /// 모든 슬롯 비우기 (전체 재요청 전)
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.received = 0;
    }
}
