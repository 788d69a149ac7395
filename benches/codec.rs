use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

use rft::chunk::{self, ChunkAssembly};
use rft::{ContentHash, Frame, Header, Status, MAX_CHUNK_PAYLOAD};

fn frame_codec(c: &mut Criterion) {
    let data = Frame::Data {
        seq: 123_456,
        payload: Bytes::from(vec![0x5Au8; MAX_CHUNK_PAYLOAD]),
    };
    let header = Frame::Header(Header {
        total_bytes: 1_000_000,
        total_chunks: 40_000,
        content_hash: ContentHash::of(b"bench"),
    });
    let nack = Frame::Status(Status::Nack(vec![3, 17, 1024, 99_999]));

    let data_packet = data.encode().unwrap();
    let nack_packet = nack.encode().unwrap();

    c.bench_function("encode data", |b| b.iter(|| black_box(&data).encode()));
    c.bench_function("encode header", |b| b.iter(|| black_box(&header).encode()));
    c.bench_function("decode data", |b| b.iter(|| Frame::decode(black_box(&data_packet))));
    c.bench_function("decode nack", |b| b.iter(|| Frame::decode(black_box(&nack_packet))));
}

fn assembly(c: &mut Criterion) {
    let file = Bytes::from((0..64 * 1024).map(|i| (i % 251) as u8).collect::<Vec<u8>>());
    let chunks = chunk::split(&file, MAX_CHUNK_PAYLOAD);

    c.bench_function("assemble 64KiB reversed", |b| {
        b.iter(|| {
            let mut assembly = ChunkAssembly::new(chunks.len() as u32);
            for (seq, chunk) in chunks.iter().enumerate().rev() {
                assembly.insert(seq as u32, chunk.clone());
            }
            assembly.assemble(file.len())
        })
    });

    c.bench_function("missing set 64KiB half", |b| {
        let mut assembly = ChunkAssembly::new(chunks.len() as u32);
        for (seq, chunk) in chunks.iter().enumerate().step_by(2) {
            assembly.insert(seq as u32, chunk.clone());
        }
        b.iter(|| black_box(&assembly).missing())
    });

    c.bench_function("md5 64KiB", |b| b.iter(|| ContentHash::of(black_box(&file))));
}

criterion_group!(benches, frame_codec, assembly);
criterion_main!(benches);
