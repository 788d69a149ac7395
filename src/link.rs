//! 링크 추상화
//!
//! 무선 링크는 프로세스 전체에서 하나뿐인 half-duplex 자원.
//! 송신(Transmit)과 수신(Listen) 중 한 모드에만 있고, 모드 전환이 양방향
//! 트래픽 사이의 유일한 동기화 수단. 세션은 이 trait만 보고 동작하므로
//! 실제 무선 드라이버, UDP, 시뮬레이션 링크를 갈아끼울 수 있음

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::{Error, Result, MAX_PAYLOAD};

/// 링크 모드
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    Transmit,
    Listen,
}

/// 패킷 송수신 능력
///
/// - `send`: `Transmit` 모드에서 패킷 하나 쓰기. 상대가 ACK하지 않으면
///   `Error::NotAcknowledged`
/// - `try_receive`: `Listen` 모드에서 최대 `timeout`까지 대기, 없으면 `None`
/// - `set_mode`: 모드 전환
pub trait Link {
    fn send(&mut self, packet: &[u8]) -> impl Future<Output = Result<()>> + Send;

    fn try_receive(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;

    fn set_mode(&mut self, mode: LinkMode) -> impl Future<Output = Result<()>> + Send;
}

/// 모드 확인 헬퍼
pub(crate) fn ensure_mode(expected: LinkMode, actual: LinkMode) -> Result<()> {
    if expected != actual {
        return Err(Error::WrongMode { expected, actual });
    }
    Ok(())
}

/// 패킷 크기 확인 헬퍼
pub(crate) fn ensure_fits(packet: &[u8]) -> Result<()> {
    if packet.len() > MAX_PAYLOAD {
        return Err(Error::PacketTooLarge {
            len: packet.len(),
            max: MAX_PAYLOAD,
        });
    }
    Ok(())
}

/// UDP 데이터그램으로 무선 링크를 흉내내는 개발용 링크
///
/// 패킷 크기 제한과 half-duplex 모드 규칙은 그대로 지킴.
/// 링크 레벨 ACK는 없어서 `send`는 소켓 에러가 아니면 성공
pub struct UdpLink {
    socket: UdpSocket,
    peer: SocketAddr,
    mode: LinkMode,
    buf: Vec<u8>,
}

impl UdpLink {
    /// 소켓 바인딩, Listen 모드로 시작
    pub async fn bind(local: SocketAddr, peer: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        info!("UDP link bound on {}, peer: {}", socket.local_addr()?, peer);

        Ok(Self {
            socket,
            peer,
            mode: LinkMode::Listen,
            buf: vec![0u8; 2048],
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

impl Link for UdpLink {
    async fn send(&mut self, packet: &[u8]) -> Result<()> {
        ensure_mode(LinkMode::Transmit, self.mode)?;
        ensure_fits(packet)?;

        self.socket.send_to(packet, self.peer).await?;
        Ok(())
    }

    async fn try_receive(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        ensure_mode(LinkMode::Listen, self.mode)?;
        let deadline = Instant::now() + timeout;

        loop {
            let received =
                tokio::time::timeout_at(deadline, self.socket.recv_from(&mut self.buf)).await;

            match received {
                Ok(Ok((len, addr))) if addr == self.peer => {
                    return Ok(Some(self.buf[..len].to_vec()));
                }
                Ok(Ok((_, addr))) => {
                    debug!("알 수 없는 주소에서 패킷 무시: {}", addr);
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Ok(None),
            }
        }
    }

    async fn set_mode(&mut self, mode: LinkMode) -> Result<()> {
        self.mode = mode;
        Ok(())
    }
}
