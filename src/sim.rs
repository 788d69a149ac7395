//! 시뮬레이션 링크
//!
//! - `SimLink`: 메모리 채널로 연결된 half-duplex 링크 한 쌍. 상대가 Listen
//!   모드가 아니면 쓰기가 ACK되지 않음. 손실은 결정적 fault plan이나
//!   시드 고정 랜덤 손실로 주입
//! - `ScriptLink`: 보낸 패킷을 기록하고 정해진 응답을 돌려주는 단방향 스크립트 링크

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;

use crate::frame::Frame;
use crate::link::{ensure_fits, ensure_mode, Link, LinkMode};
use crate::{Error, Result};

/// 패킷 하나의 운명
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// 전달 + ACK
    Deliver,

    /// 유실 (ACK 없음)
    Lose,

    /// 전달됐지만 ACK 유실 (송신측은 실패로 보고 재시도 -> 중복 수신)
    LoseAck,
}

type FaultPlan = Box<dyn FnMut(&[u8]) -> Delivery + Send>;

/// 메모리 채널 기반 half-duplex 링크
pub struct SimLink {
    mode: Arc<Mutex<LinkMode>>,
    peer_mode: Arc<Mutex<LinkMode>>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    fault: Option<FaultPlan>,
    loss: Option<(StdRng, f64)>,
    delivered: Arc<Mutex<Vec<Vec<u8>>>>,
}

/// 서로 연결된 링크 한 쌍 (둘 다 Listen 모드로 시작)
pub fn pair() -> (SimLink, SimLink) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    let a_mode = Arc::new(Mutex::new(LinkMode::Listen));
    let b_mode = Arc::new(Mutex::new(LinkMode::Listen));

    let a = SimLink::new(a_mode.clone(), b_mode.clone(), a_tx, a_rx);
    let b = SimLink::new(b_mode, a_mode, b_tx, b_rx);
    (a, b)
}

impl SimLink {
    fn new(
        mode: Arc<Mutex<LinkMode>>,
        peer_mode: Arc<Mutex<LinkMode>>,
        tx: mpsc::UnboundedSender<Vec<u8>>,
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Self {
        Self {
            mode,
            peer_mode,
            tx,
            rx,
            fault: None,
            loss: None,
            delivered: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// 이 링크에서 나가는 패킷에 fault plan 적용
    pub fn with_fault<F>(mut self, plan: F) -> Self
    where
        F: FnMut(&[u8]) -> Delivery + Send + 'static,
    {
        self.fault = Some(Box::new(plan));
        self
    }

    /// 나가는 패킷을 확률 `rate`로 유실 (시드 고정)
    pub fn with_random_loss(mut self, rate: f64, seed: u64) -> Self {
        self.loss = Some((StdRng::seed_from_u64(seed), rate.clamp(0.0, 1.0)));
        self
    }

    /// 상대에게 실제로 전달된 패킷 기록
    pub fn delivered(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        self.delivered.clone()
    }

    pub fn mode(&self) -> LinkMode {
        *self.mode.lock()
    }

    fn verdict(&mut self, packet: &[u8]) -> Delivery {
        if let Some(plan) = self.fault.as_mut() {
            let verdict = plan(packet);
            if verdict != Delivery::Deliver {
                return verdict;
            }
        }
        if let Some((rng, rate)) = self.loss.as_mut() {
            if rng.gen_bool(*rate) {
                return Delivery::Lose;
            }
        }
        Delivery::Deliver
    }

    fn deliver(&self, packet: &[u8]) -> Result<()> {
        self.tx
            .send(packet.to_vec())
            .map_err(|_| Error::LinkClosed)?;
        self.delivered.lock().push(packet.to_vec());
        Ok(())
    }
}

impl Link for SimLink {
    async fn send(&mut self, packet: &[u8]) -> Result<()> {
        ensure_mode(LinkMode::Transmit, self.mode())?;
        ensure_fits(packet)?;

        // 상대가 송신 중이면 수신기가 꺼져 있음
        let peer_listening = *self.peer_mode.lock() == LinkMode::Listen;
        if !peer_listening {
            return Err(Error::NotAcknowledged);
        }

        match self.verdict(packet) {
            Delivery::Deliver => self.deliver(packet),
            Delivery::Lose => Err(Error::NotAcknowledged),
            Delivery::LoseAck => {
                self.deliver(packet)?;
                Err(Error::NotAcknowledged)
            }
        }
    }

    async fn try_receive(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        ensure_mode(LinkMode::Listen, self.mode())?;

        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(packet)) => Ok(Some(packet)),
            Ok(None) => Err(Error::LinkClosed),
            Err(_) => Ok(None),
        }
    }

    async fn set_mode(&mut self, mode: LinkMode) -> Result<()> {
        *self.mode.lock() = mode;
        Ok(())
    }
}

type ListenScript = Box<dyn FnMut(&[Vec<u8>]) -> Vec<Vec<u8>> + Send>;
type WriteScript = Box<dyn FnMut(&[u8]) -> bool + Send>;

/// 스크립트 링크
///
/// Listen으로 전환될 때마다 지금까지 보낸 패킷을 보고 응답을 만들어 inbox에 넣음
pub struct ScriptLink {
    mode: LinkMode,
    sent: Vec<Vec<u8>>,
    write_attempts: usize,
    inbox: VecDeque<Vec<u8>>,
    on_listen: Option<ListenScript>,
    accept_write: Option<WriteScript>,
}

impl Default for ScriptLink {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptLink {
    pub fn new() -> Self {
        Self {
            mode: LinkMode::Listen,
            sent: Vec::new(),
            write_attempts: 0,
            inbox: VecDeque::new(),
            on_listen: None,
            accept_write: None,
        }
    }

    /// Listen 전환 시 응답 생성기
    pub fn on_listen<F>(mut self, script: F) -> Self
    where
        F: FnMut(&[Vec<u8>]) -> Vec<Vec<u8>> + Send + 'static,
    {
        self.on_listen = Some(Box::new(script));
        self
    }

    /// 쓰기 ACK 여부 결정기 (`false`면 `NotAcknowledged`)
    pub fn accept_writes<F>(mut self, script: F) -> Self
    where
        F: FnMut(&[u8]) -> bool + Send + 'static,
    {
        self.accept_write = Some(Box::new(script));
        self
    }

    /// 수신 대기열에 패킷 추가
    pub fn push_inbound(&mut self, packet: Vec<u8>) {
        self.inbox.push_back(packet);
    }

    /// ACK된 패킷
    pub fn sent(&self) -> &[Vec<u8>] {
        &self.sent
    }

    /// ACK된 패킷을 디코딩한 프레임
    pub fn sent_frames(&self) -> Vec<Frame> {
        self.sent
            .iter()
            .filter_map(|packet| Frame::decode(packet).ok())
            .collect()
    }

    /// ACK 여부와 무관한 쓰기 시도 수
    pub fn write_attempts(&self) -> usize {
        self.write_attempts
    }

    pub fn mode(&self) -> LinkMode {
        self.mode
    }
}

impl Link for ScriptLink {
    async fn send(&mut self, packet: &[u8]) -> Result<()> {
        ensure_mode(LinkMode::Transmit, self.mode)?;
        ensure_fits(packet)?;
        self.write_attempts += 1;

        let accepted = self.accept_write.as_mut().map_or(true, |accept| accept(packet));
        if !accepted {
            return Err(Error::NotAcknowledged);
        }

        self.sent.push(packet.to_vec());
        Ok(())
    }

    async fn try_receive(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        ensure_mode(LinkMode::Listen, self.mode)?;

        match self.inbox.pop_front() {
            Some(packet) => Ok(Some(packet)),
            None => {
                tokio::time::sleep(timeout).await;
                Ok(None)
            }
        }
    }

    async fn set_mode(&mut self, mode: LinkMode) -> Result<()> {
        let entering_listen = mode == LinkMode::Listen && self.mode != LinkMode::Listen;
        self.mode = mode;

        if entering_listen {
            if let Some(script) = self.on_listen.as_mut() {
                let replies = script(&self.sent);
                self.inbox.extend(replies);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sim_pair_half_duplex() {
        let (mut a, mut b) = pair();

        a.set_mode(LinkMode::Transmit).await.unwrap();
        b.set_mode(LinkMode::Transmit).await.unwrap();
        assert!(matches!(a.send(b"\x03").await, Err(Error::NotAcknowledged)));

        b.set_mode(LinkMode::Listen).await.unwrap();
        a.send(b"\x03").await.unwrap();
        assert_eq!(
            b.try_receive(Duration::from_millis(10)).await.unwrap(),
            Some(vec![0x03])
        );
        assert_eq!(b.try_receive(Duration::from_millis(10)).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sim_fault_plan() {
        let (a, mut b) = pair();
        let mut calls = 0;
        let mut a = a.with_fault(move |_| {
            calls += 1;
            match calls {
                1 => Delivery::Lose,
                2 => Delivery::LoseAck,
                _ => Delivery::Deliver,
            }
        });

        a.set_mode(LinkMode::Transmit).await.unwrap();
        assert!(a.send(b"\x03").await.is_err());
        assert!(a.send(b"\x03").await.is_err());
        assert!(a.send(b"\x03").await.is_ok());

        assert_eq!(a.delivered().lock().len(), 2);
        assert!(b.try_receive(Duration::from_millis(1)).await.unwrap().is_some());
        assert!(b.try_receive(Duration::from_millis(1)).await.unwrap().is_some());
        assert!(b.try_receive(Duration::from_millis(1)).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_script_link_replies_on_listen() {
        let mut link = ScriptLink::new().on_listen(|sent| vec![vec![0x04, b'0' + sent.len() as u8]]);

        link.set_mode(LinkMode::Transmit).await.unwrap();
        link.send(b"\x03").await.unwrap();
        link.set_mode(LinkMode::Listen).await.unwrap();

        assert_eq!(
            link.try_receive(Duration::from_secs(1)).await.unwrap(),
            Some(vec![0x04, b'1'])
        );
        assert_eq!(link.sent_frames(), vec![Frame::Eof]);
    }
}
