//! 시뮬레이션 링크 위에서 실제 Sender / Receiver를 돌리는 종단 간 테스트

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tempfile::TempDir;

use rft::receiver::AbandonCause;
use rft::sender::{AbandonReason, TransferOutcome};
use rft::sim::{self, Delivery, SimLink};
use rft::{Config, ContentHash, Frame, Ledger, Receiver, Sender, SessionOutcome};

struct Harness {
    dir: TempDir,
}

impl Harness {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn outbox(&self) -> PathBuf {
        self.dir.path().join("outbox")
    }

    fn recv_dir(&self) -> PathBuf {
        self.dir.path().join("received")
    }

    fn sender(&self, link: SimLink) -> Sender<SimLink> {
        let ledger = Ledger::open(self.dir.path().join("sent_hashes.txt")).unwrap();
        Sender::new(Config::fast(), link, self.outbox(), ledger).unwrap()
    }

    fn receiver(&self, link: SimLink) -> Receiver<SimLink> {
        let ledger = Ledger::open(self.dir.path().join("received_hashes.txt")).unwrap();
        Receiver::new(Config::fast(), link, self.recv_dir(), ledger).unwrap()
    }

    fn stage(&self, name: &str, data: &Bytes) {
        std::fs::create_dir_all(self.outbox()).unwrap();
        std::fs::write(self.outbox().join(name), data).unwrap();
    }

    fn artifacts(&self) -> Vec<PathBuf> {
        list(&self.recv_dir())
    }
}

fn list(dir: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    paths.sort();
    paths
}

fn payload(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i * 31 % 256) as u8).collect::<Vec<u8>>())
}

async fn receive_one(receiver: &mut Receiver<SimLink>) -> SessionOutcome {
    loop {
        if let Some(outcome) = receiver.step().await.unwrap() {
            return outcome;
        }
    }
}

/// 지정한 seq의 Data 프레임을 처음 `drops`번 유실
fn drop_chunks(seqs: &'static [u32], drops: usize) -> impl FnMut(&[u8]) -> Delivery + Send {
    let mut attempts: HashMap<u32, usize> = HashMap::new();
    move |packet| match Frame::decode(packet) {
        Ok(Frame::Data { seq, .. }) if seqs.contains(&seq) => {
            let count = attempts.entry(seq).or_insert(0);
            *count += 1;
            if *count <= drops {
                Delivery::Lose
            } else {
                Delivery::Deliver
            }
        }
        _ => Delivery::Deliver,
    }
}

#[tokio::test(start_paused = true)]
async fn test_clean_transfer() {
    let harness = Harness::new();
    let data = payload(1000);
    harness.stage("photo.bin", &data);

    let (tx_link, rx_link) = sim::pair();
    let mut sender = harness.sender(tx_link);
    let mut receiver = harness.receiver(rx_link);

    let (report, outcome) = tokio::join!(sender.scan_once(), receive_one(&mut receiver));

    assert_eq!(report.unwrap().delivered, 1);
    let SessionOutcome::Delivered { path, content_hash } = outcome else {
        panic!("expected delivery, got {:?}", outcome);
    };
    assert_eq!(std::fs::read(&path).unwrap(), data.to_vec());
    assert_eq!(content_hash, ContentHash::of(&data));

    let name = path.file_name().unwrap().to_str().unwrap().to_string();
    assert!(name.starts_with("received_"));
    assert!(name.ends_with(&format!("_{}.bin", content_hash.short())));

    assert!(harness.outbox().join("photo.bin.sent").exists());
    assert!(!harness.outbox().join("photo.bin").exists());
    assert!(sender.ledger().contains(&content_hash));
    assert!(receiver.ledger().contains(&content_hash));
    assert_eq!(receiver.stats().nack_rounds, 0);
}

#[tokio::test(start_paused = true)]
async fn test_lost_chunks_recovered_by_single_nack() {
    let harness = Harness::new();
    let data = payload(250);
    harness.stage("a.bin", &data);

    let (tx_link, rx_link) = sim::pair();
    let retry_limit = Config::fast().chunk_retry_limit as usize;
    let tx_link = tx_link.with_fault(drop_chunks(&[3, 7], retry_limit));
    let mut sender = harness.sender(tx_link);
    let mut receiver = harness.receiver(rx_link);

    let (report, outcome) = tokio::join!(sender.scan_once(), receive_one(&mut receiver));

    assert_eq!(report.unwrap().delivered, 1);
    assert!(matches!(outcome, SessionOutcome::Delivered { .. }));
    assert_eq!(receiver.stats().nack_rounds, 1);
    assert_eq!(sender.stats().nack_rounds, 1);
    assert_eq!(sender.stats().chunks_retransmitted, 2);
    assert_eq!(sender.stats().frames_given_up, 2);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_content_delivered_once() {
    let harness = Harness::new();
    let data = payload(120);

    let (tx_link, rx_link) = sim::pair();
    let mut sender = harness.sender(tx_link);
    let mut receiver = harness.receiver(rx_link);

    let (first, outcome) = tokio::join!(sender.send_bytes(data.clone()), receive_one(&mut receiver));
    assert!(first.unwrap().is_delivered());
    assert!(matches!(outcome, SessionOutcome::Delivered { .. }));

    let (second, outcome) = tokio::join!(sender.send_bytes(data.clone()), receive_one(&mut receiver));
    assert!(second.unwrap().is_delivered());
    assert_eq!(
        outcome,
        SessionOutcome::Duplicate {
            content_hash: ContentHash::of(&data)
        }
    );

    assert_eq!(harness.artifacts().len(), 1);
    assert_eq!(receiver.stats().transfers_duplicate, 1);
}

#[tokio::test(start_paused = true)]
async fn test_lost_headers_tolerated() {
    let harness = Harness::new();
    let data = payload(80);

    let (tx_link, rx_link) = sim::pair();
    let mut headers = 0;
    let tx_link = tx_link.with_fault(move |packet| match Frame::decode(packet) {
        Ok(Frame::Header(_)) => {
            headers += 1;
            if headers < 3 {
                Delivery::Lose
            } else {
                Delivery::Deliver
            }
        }
        _ => Delivery::Deliver,
    });
    let mut sender = harness.sender(tx_link);
    let mut receiver = harness.receiver(rx_link);

    let (result, outcome) = tokio::join!(sender.send_bytes(data.clone()), receive_one(&mut receiver));

    assert!(result.unwrap().is_delivered());
    let SessionOutcome::Delivered { path, .. } = outcome else {
        panic!("expected delivery, got {:?}", outcome);
    };
    assert_eq!(std::fs::read(path).unwrap(), data.to_vec());
}

#[tokio::test(start_paused = true)]
async fn test_permanently_lost_chunk_abandoned() {
    let harness = Harness::new();
    let data = payload(100);
    harness.stage("b.bin", &data);

    let (tx_link, rx_link) = sim::pair();
    let tx_link = tx_link.with_fault(drop_chunks(&[2], usize::MAX));
    let mut sender = harness.sender(tx_link);
    let mut receiver = harness.receiver(rx_link);

    let (report, outcome) = tokio::join!(sender.scan_once(), receive_one(&mut receiver));

    assert_eq!(report.unwrap().abandoned, 1);
    assert_eq!(
        outcome,
        SessionOutcome::Abandoned {
            content_hash: ContentHash::of(&data),
            cause: AbandonCause::NackRoundsExhausted,
        }
    );
    assert_eq!(receiver.stats().nack_rounds, 3);
    assert_eq!(sender.stats().nack_rounds, 3);

    // 확인받지 못한 파일은 다음 스캔을 위해 그대로 남음
    assert!(harness.outbox().join("b.bin").exists());
    assert!(sender.ledger().is_empty());
    assert!(harness.artifacts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_random_loss_transfer() {
    let harness = Harness::new();
    let data = payload(2000);

    let (tx_link, rx_link) = sim::pair();
    let tx_link = tx_link.with_random_loss(0.1, 42);
    let mut sender = harness.sender(tx_link);
    let mut receiver = harness.receiver(rx_link);

    let (result, outcome) = tokio::join!(sender.send_bytes(data.clone()), receive_one(&mut receiver));

    assert!(result.unwrap().is_delivered());
    let SessionOutcome::Delivered { path, .. } = outcome else {
        panic!("expected delivery, got {:?}", outcome);
    };
    assert_eq!(std::fs::read(path).unwrap(), data.to_vec());
    assert!(sender.stats().write_failures > 0);
}

#[tokio::test(start_paused = true)]
async fn test_receiver_silence_times_out_sender() {
    let harness = Harness::new();
    let (tx_link, _rx_link) = sim::pair();
    let mut sender = harness.sender(tx_link);

    let outcome = sender.send_bytes(payload(50)).await.unwrap();

    assert_eq!(
        outcome,
        TransferOutcome::Abandoned {
            content_hash: ContentHash::of(&payload(50)),
            reason: AbandonReason::StatusTimeout,
        }
    );
}
