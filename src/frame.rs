//! 와이어 프레임 정의
//!
//! 모든 프레임은 `MAX_PAYLOAD` 이하이며 첫 바이트가 태그:
//!
//! | tag  | 종류   | 나머지                                                  |
//! |------|--------|---------------------------------------------------------|
//! | 0x01 | Header | total_bytes:u32 LE, total_chunks:u32 LE, content_hash:16 |
//! | 0x02 | Data   | seq:u32 LE, len:u16 LE, payload:len                     |
//! | 0x03 | Eof    | 없음                                                    |
//! | 0x04 | Status | ASCII: `OK` / `NACK,<seq>{,<seq>}*` / `FAIL`            |
//!
//! 디코딩 실패는 치명적이지 않음. 호출측이 로그 후 프레임을 버림

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::digest::ContentHash;
use crate::{DATA_OVERHEAD, HEADER_LEN, MAX_CHUNK_PAYLOAD, MAX_PAYLOAD};

/// 프레임 타입 (첫 바이트)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Header = 0x01,
    Data = 0x02,
    Eof = 0x03,
    Status = 0x04,
}

impl FrameType {
    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(FrameType::Header),
            0x02 => Some(FrameType::Data),
            0x03 => Some(FrameType::Eof),
            0x04 => Some(FrameType::Status),
            _ => None,
        }
    }
}

/// 프레임 인코딩/디코딩 에러
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("빈 버퍼")]
    Empty,

    #[error("알 수 없는 태그: {0:#04x}")]
    UnknownTag(u8),

    #[error("{kind:?} 프레임 길이 부족: {len} < {min}")]
    Truncated { kind: FrameType, len: usize, min: usize },

    #[error("{kind:?} 프레임 길이 불일치: expected {expected}, got {len}")]
    BadLength {
        kind: FrameType,
        expected: usize,
        len: usize,
    },

    #[error("Data 길이 필드 불일치: declared {declared}, actual {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("프레임 크기 초과: {len} > {max}")]
    Oversized { len: usize, max: usize },

    #[error("Status 텍스트가 ASCII가 아님")]
    NonAscii,
}

/// 전송 시작 헤더
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// 전체 바이트 수
    pub total_bytes: u32,

    /// 전체 청크 수
    pub total_chunks: u32,

    /// 전체 내용의 MD5
    pub content_hash: ContentHash,
}

/// 수신측 응답
///
/// 와이어 상에서는 자유 형식 ASCII, 코덱 경계에서 타입으로 변환
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    /// 수신 및 검증 완료
    Ok,

    /// 재전송 요청 seq 목록
    Nack(Vec<u32>),

    /// 수신측 포기
    Fail,

    /// 알 수 없는 문자열 (송신측은 종료 상태로 취급)
    Other(String),
}

/// "NACK," 접두어
const NACK_PREFIX: &str = "NACK,";

/// Status 프레임 하나에 담을 수 있는 텍스트 길이
const STATUS_TEXT_MAX: usize = MAX_PAYLOAD - 1;

impl Status {
    /// 상태 문자열 파싱 (접두어 매칭)
    pub fn parse(text: &str) -> Self {
        if text.starts_with("OK") {
            Status::Ok
        } else if text.starts_with("NACK") {
            let seqs = text
                .split(',')
                .skip(1)
                .filter(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
                .filter_map(|part| part.parse::<u32>().ok())
                .collect();
            Status::Nack(seqs)
        } else if text.starts_with("FAIL") {
            Status::Fail
        } else {
            Status::Other(text.to_string())
        }
    }

    /// 와이어 텍스트
    pub fn to_text(&self) -> String {
        match self {
            Status::Ok => "OK".to_string(),
            Status::Fail => "FAIL".to_string(),
            Status::Other(text) => text.clone(),
            Status::Nack(seqs) => {
                let csv: Vec<String> = seqs.iter().map(|s| s.to_string()).collect();
                format!("{}{}", NACK_PREFIX, csv.join(","))
            }
        }
    }

    /// 누락 seq 목록을 프레임 크기에 맞는 NACK 배치로 분할
    ///
    /// 각 Status 프레임은 `MAX_PAYLOAD` 이하. 빈 목록이면 빈 NACK 하나
    pub fn nack_batches(seqs: &[u32]) -> Vec<Status> {
        let budget = STATUS_TEXT_MAX - NACK_PREFIX.len();
        let mut batches = Vec::new();
        let mut current: Vec<u32> = Vec::new();
        let mut used = 0usize;

        for &seq in seqs {
            let width = decimal_width(seq);
            let needed = if current.is_empty() { width } else { width + 1 };

            if used + needed > budget {
                batches.push(Status::Nack(std::mem::take(&mut current)));
                used = 0;
            }

            used += if current.is_empty() { width } else { width + 1 };
            current.push(seq);
        }

        if !current.is_empty() || batches.is_empty() {
            batches.push(Status::Nack(current));
        }

        batches
    }
}

fn decimal_width(mut n: u32) -> usize {
    let mut width = 1;
    while n >= 10 {
        n /= 10;
        width += 1;
    }
    width
}

/// 링크 프레임
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Header(Header),

    /// 청크. 와이어의 len 필드는 `payload.len()`에서 나옴
    Data { seq: u32, payload: Bytes },

    Eof,

    Status(Status),
}

impl Frame {
    /// Data 프레임 생성 (청크 크기 검증)
    pub fn data(seq: u32, payload: Bytes) -> Result<Self, FrameError> {
        if payload.len() > MAX_CHUNK_PAYLOAD {
            return Err(FrameError::Oversized {
                len: payload.len() + DATA_OVERHEAD,
                max: MAX_PAYLOAD,
            });
        }
        Ok(Frame::Data { seq, payload })
    }

    /// 프레임 타입 반환
    pub fn kind(&self) -> FrameType {
        match self {
            Frame::Header(_) => FrameType::Header,
            Frame::Data { .. } => FrameType::Data,
            Frame::Eof => FrameType::Eof,
            Frame::Status(_) => FrameType::Status,
        }
    }

    /// 바이트로 직렬화
    ///
    /// `MAX_PAYLOAD`를 넘는 프레임은 만들지 않음
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let mut buf = BytesMut::with_capacity(MAX_PAYLOAD);

        match self {
            Frame::Header(header) => {
                buf.put_u8(FrameType::Header as u8);
                buf.put_u32_le(header.total_bytes);
                buf.put_u32_le(header.total_chunks);
                buf.put_slice(header.content_hash.as_bytes());
            }
            Frame::Data { seq, payload } => {
                if payload.len() > MAX_CHUNK_PAYLOAD {
                    return Err(FrameError::Oversized {
                        len: payload.len() + DATA_OVERHEAD,
                        max: MAX_PAYLOAD,
                    });
                }
                buf.put_u8(FrameType::Data as u8);
                buf.put_u32_le(*seq);
                buf.put_u16_le(payload.len() as u16);
                buf.put_slice(payload);
            }
            Frame::Eof => {
                buf.put_u8(FrameType::Eof as u8);
            }
            Frame::Status(status) => {
                let text = status.to_text();
                if !text.is_ascii() {
                    return Err(FrameError::NonAscii);
                }
                if text.len() > STATUS_TEXT_MAX {
                    return Err(FrameError::Oversized {
                        len: text.len() + 1,
                        max: MAX_PAYLOAD,
                    });
                }
                buf.put_u8(FrameType::Status as u8);
                buf.put_slice(text.as_bytes());
            }
        }

        Ok(buf.to_vec())
    }

    /// 바이트에서 역직렬화
    ///
    /// 잘린 버퍼, 길이 불일치 버퍼는 모두 에러. 패닉 없음
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let (&tag, mut rest) = bytes.split_first().ok_or(FrameError::Empty)?;

        if bytes.len() > MAX_PAYLOAD {
            return Err(FrameError::Oversized {
                len: bytes.len(),
                max: MAX_PAYLOAD,
            });
        }

        let kind = FrameType::from_tag(tag).ok_or(FrameError::UnknownTag(tag))?;

        match kind {
            FrameType::Header => {
                exact_len(kind, bytes.len(), HEADER_LEN)?;
                let total_bytes = rest.get_u32_le();
                let total_chunks = rest.get_u32_le();
                let mut hash = [0u8; 16];
                rest.copy_to_slice(&mut hash);

                Ok(Frame::Header(Header {
                    total_bytes,
                    total_chunks,
                    content_hash: ContentHash::from_bytes(hash),
                }))
            }
            FrameType::Data => {
                if bytes.len() < DATA_OVERHEAD {
                    return Err(FrameError::Truncated {
                        kind,
                        len: bytes.len(),
                        min: DATA_OVERHEAD,
                    });
                }
                let seq = rest.get_u32_le();
                let declared = rest.get_u16_le() as usize;
                if declared != rest.len() {
                    return Err(FrameError::LengthMismatch {
                        declared,
                        actual: rest.len(),
                    });
                }

                Ok(Frame::Data {
                    seq,
                    payload: Bytes::copy_from_slice(rest),
                })
            }
            FrameType::Eof => {
                exact_len(kind, bytes.len(), 1)?;
                Ok(Frame::Eof)
            }
            FrameType::Status => {
                let text = std::str::from_utf8(rest)
                    .ok()
                    .filter(|text| text.is_ascii())
                    .ok_or(FrameError::NonAscii)?;
                Ok(Frame::Status(Status::parse(text)))
            }
        }
    }
}

fn exact_len(kind: FrameType, len: usize, expected: usize) -> Result<(), FrameError> {
    if len < expected {
        return Err(FrameError::Truncated {
            kind,
            len,
            min: expected,
        });
    }
    if len > expected {
        return Err(FrameError::BadLength {
            kind,
            expected,
            len,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> Header {
        Header {
            total_bytes: 61,
            total_chunks: 3,
            content_hash: ContentHash::of(&[7u8; 61]),
        }
    }

    #[test]
    fn test_header_wire_layout() {
        let bytes = Frame::Header(sample_header()).encode().unwrap();

        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(bytes[0], 0x01);
        assert_eq!(&bytes[1..5], &61u32.to_le_bytes());
        assert_eq!(&bytes[5..9], &3u32.to_le_bytes());
        assert_eq!(&bytes[9..25], sample_header().content_hash.as_bytes());
        assert_eq!(Frame::decode(&bytes).unwrap(), Frame::Header(sample_header()));
    }

    #[test]
    fn test_data_wire_layout() {
        let frame = Frame::data(258, Bytes::from_static(b"abc")).unwrap();
        let bytes = frame.encode().unwrap();

        assert_eq!(bytes, vec![0x02, 0x02, 0x01, 0, 0, 3, 0, b'a', b'b', b'c']);
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_full_chunk_fits_max_payload() {
        let frame = Frame::data(0, Bytes::from(vec![0xAA; MAX_CHUNK_PAYLOAD])).unwrap();
        assert_eq!(frame.encode().unwrap().len(), MAX_PAYLOAD);

        assert!(Frame::data(0, Bytes::from(vec![0xAA; MAX_CHUNK_PAYLOAD + 1])).is_err());
        let oversized = Frame::Data {
            seq: 0,
            payload: Bytes::from(vec![0xAA; MAX_CHUNK_PAYLOAD + 1]),
        };
        assert!(matches!(oversized.encode(), Err(FrameError::Oversized { .. })));
    }

    #[test]
    fn test_eof_and_status_encoding() {
        assert_eq!(Frame::Eof.encode().unwrap(), vec![0x03]);
        assert_eq!(Frame::Status(Status::Ok).encode().unwrap(), b"\x04OK".to_vec());
        assert_eq!(
            Frame::Status(Status::Nack(vec![3, 7])).encode().unwrap(),
            b"\x04NACK,3,7".to_vec()
        );
        assert_eq!(Frame::Status(Status::Fail).encode().unwrap(), b"\x04FAIL".to_vec());
    }

    #[test]
    fn test_truncated_buffers_are_errors() {
        let header = Frame::Header(sample_header()).encode().unwrap();
        for len in 1..HEADER_LEN {
            assert!(
                matches!(Frame::decode(&header[..len]), Err(FrameError::Truncated { .. })),
                "header truncated to {len}"
            );
        }

        let data = Frame::data(9, Bytes::from_static(b"hello")).unwrap().encode().unwrap();
        for len in 1..DATA_OVERHEAD {
            assert!(matches!(
                Frame::decode(&data[..len]),
                Err(FrameError::Truncated { .. })
            ));
        }
        for len in DATA_OVERHEAD..data.len() {
            assert!(matches!(
                Frame::decode(&data[..len]),
                Err(FrameError::LengthMismatch { .. })
            ));
        }

        assert_eq!(Frame::decode(&[]), Err(FrameError::Empty));
    }

    #[test]
    fn test_length_inconsistent_buffers_are_errors() {
        let mut data = Frame::data(1, Bytes::from_static(b"xy")).unwrap().encode().unwrap();
        data.push(b'z');
        assert_eq!(
            Frame::decode(&data),
            Err(FrameError::LengthMismatch { declared: 2, actual: 3 })
        );

        let mut header = Frame::Header(sample_header()).encode().unwrap();
        header.push(0);
        assert!(matches!(Frame::decode(&header), Err(FrameError::BadLength { .. })));

        assert!(matches!(Frame::decode(&[0x03, 0x00]), Err(FrameError::BadLength { .. })));
        assert_eq!(Frame::decode(&[0x09, 1, 2]), Err(FrameError::UnknownTag(0x09)));
        assert!(matches!(Frame::decode(&[0x02; 40]), Err(FrameError::Oversized { .. })));
        assert_eq!(Frame::decode(&[0x04, b'O', 0xC3]), Err(FrameError::NonAscii));
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(Status::parse("OK"), Status::Ok);
        assert_eq!(Status::parse("NACK,3,7"), Status::Nack(vec![3, 7]));
        assert_eq!(Status::parse("NACK,1,+2,x,,40"), Status::Nack(vec![1, 40]));
        assert_eq!(Status::parse("NACK,"), Status::Nack(vec![]));
        assert_eq!(Status::parse("FAIL"), Status::Fail);
        assert_eq!(Status::parse("BUSY"), Status::Other("BUSY".into()));
        assert_eq!(Status::parse(""), Status::Other(String::new()));
    }

    #[test]
    fn test_nack_batches_fit_frames() {
        let seqs: Vec<u32> = (0..300).collect();
        let batches = Status::nack_batches(&seqs);

        assert!(batches.len() > 1);

        let mut joined = Vec::new();
        for batch in &batches {
            let bytes = Frame::Status(batch.clone()).encode().unwrap();
            assert!(bytes.len() <= MAX_PAYLOAD);
            if let Status::Nack(part) = batch {
                joined.extend_from_slice(part);
            }
        }
        assert_eq!(joined, seqs);

        assert_eq!(Status::nack_batches(&[3, 7]), vec![Status::Nack(vec![3, 7])]);
        assert_eq!(Status::nack_batches(&[]), vec![Status::Nack(vec![])]);
        assert_eq!(
            Status::nack_batches(&[u32::MAX, u32::MAX, u32::MAX]).len(),
            2
        );
    }
}
