//! Parallel encode/decode equivalence: worker pools of any size must produce
//! bit-identical files and identical decoded streams.

use std::io::Cursor;
use std::sync::Arc;

use bgzf2::{Reader, ThreadPool, Writer};

fn payload(len: usize) -> Vec<u8> {
    // Mildly compressible deterministic noise
    let mut state = 0x2545F4914F6CDD1Du64;
    (0..len)
        .map(|i| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            if i % 5 == 0 {
                (state >> 56) as u8
            } else {
                (i % 251) as u8
            }
        })
        .collect()
}

fn encode(payload: &[u8], block_size: usize, level: i32, workers: usize) -> Vec<u8> {
    let mut writer = Writer::<Vec<u8>>::builder()
        .block_size(block_size)
        .level(level)
        .build(Vec::new())
        .unwrap();
    if workers > 0 {
        writer
            .attach_thread_pool(Arc::new(ThreadPool::new(workers)), 0)
            .unwrap();
    }
    writer.write(payload, true).unwrap();
    writer.into_inner().unwrap()
}

fn decode(file: Vec<u8>, workers: usize) -> Vec<u8> {
    let mut reader = Reader::new(Cursor::new(file));
    if workers > 0 {
        reader
            .attach_thread_pool(Arc::new(ThreadPool::new(workers)), 0)
            .unwrap();
    }
    let mut out = Vec::new();
    std::io::Read::read_to_end(&mut reader, &mut out).unwrap();
    out
}

#[test]
fn encoded_files_are_bit_identical_across_worker_counts() {
    let data = payload(4 << 20);
    let reference = encode(&data, 256_000, 5, 0);
    for workers in [1, 2, 8] {
        let file = encode(&data, 256_000, 5, workers);
        assert_eq!(
            file, reference,
            "parallel encode with {workers} workers diverged from sequential output"
        );
    }
}

#[test]
fn decoded_streams_match_across_worker_counts() {
    let data = payload(2 << 20);
    let file = encode(&data, 65_536, 3, 4);
    for workers in [0, 1, 2, 8] {
        assert_eq!(
            decode(file.clone(), workers),
            data,
            "parallel decode with {workers} workers corrupted the stream"
        );
    }
}

#[test]
fn parallel_encode_to_parallel_decode() {
    let data = payload(1 << 20);
    let file = encode(&data, 10_000, 2, 8);
    assert_eq!(decode(file, 8), data);
}

#[test]
fn parallel_round_trip_with_small_queue() {
    // A queue depth of one serialises the pipeline without deadlocking
    let data = payload(500_000);
    let mut writer = Writer::<Vec<u8>>::builder()
        .block_size(8192)
        .level(1)
        .build(Vec::new())
        .unwrap();
    writer
        .attach_thread_pool(Arc::new(ThreadPool::new(4)), 1)
        .unwrap();
    writer.write(&data, true).unwrap();
    let file = writer.into_inner().unwrap();

    let mut reader = Reader::new(Cursor::new(file));
    reader
        .attach_thread_pool(Arc::new(ThreadPool::new(4)), 1)
        .unwrap();
    let mut out = Vec::new();
    std::io::Read::read_to_end(&mut reader, &mut out).unwrap();
    assert_eq!(out, data);
}

#[test]
fn shared_pool_across_encoder_and_decoder() {
    let pool = Arc::new(ThreadPool::new(4));
    let data = payload(800_000);

    let mut writer = Writer::<Vec<u8>>::builder()
        .block_size(16_384)
        .build(Vec::new())
        .unwrap();
    writer.attach_thread_pool(pool.clone(), 0).unwrap();
    writer.write(&data, true).unwrap();
    let file = writer.into_inner().unwrap();

    let mut reader = Reader::new(Cursor::new(file));
    reader.attach_thread_pool(pool, 0).unwrap();
    let mut out = Vec::new();
    std::io::Read::read_to_end(&mut reader, &mut out).unwrap();
    assert_eq!(out, data);
}

#[test]
fn parallel_seeks_interleaved_with_reads() {
    let data = payload(1 << 20);
    let file = encode(&data, 4096, 1, 4);

    let mut reader = Reader::new(Cursor::new(file));
    reader
        .attach_thread_pool(Arc::new(ThreadPool::new(4)), 0)
        .unwrap();

    for &upos in &[0u64, 700_000, 12_345, 1_000_000, 524_287] {
        reader.seek(upos).unwrap();
        let want = &data[upos as usize..(upos as usize + 256).min(data.len())];
        let mut out = vec![0u8; want.len()];
        assert_eq!(reader.read(&mut out).unwrap(), want.len(), "at {upos}");
        assert_eq!(out.as_slice(), want, "at {upos}");
    }
}

#[test]
fn dropping_an_active_parallel_reader_is_clean() {
    let data = payload(1 << 20);
    let file = encode(&data, 4096, 1, 2);

    let mut reader = Reader::new(Cursor::new(file));
    reader
        .attach_thread_pool(Arc::new(ThreadPool::new(2)), 0)
        .unwrap();
    // Consume only part of the stream, then drop mid-flight
    let mut out = vec![0u8; 100_000];
    assert_eq!(reader.read(&mut out).unwrap(), 100_000);
    drop(reader);
}
