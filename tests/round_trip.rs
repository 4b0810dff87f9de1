//! End-to-end write/read round trips over block-size and level grids, plus
//! compatibility of the produced files with a stock Zstd decoder.

use std::io::Cursor;

use bgzf2::{EofStatus, Reader, SeekableIndex, Writer};

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 7 + 13) % 251) as u8).collect()
}

fn build(payload: &[u8], block_size: usize, level: i32) -> Vec<u8> {
    let mut writer = Writer::<Vec<u8>>::builder()
        .block_size(block_size)
        .level(level)
        .build(Vec::new())
        .unwrap();
    writer.write(payload, true).unwrap();
    writer.into_inner().unwrap()
}

fn read_all(file: Vec<u8>) -> Vec<u8> {
    let mut reader = Reader::new(Cursor::new(file));
    let mut out = Vec::new();
    std::io::Read::read_to_end(&mut reader, &mut out).unwrap();
    out
}

#[test]
fn round_trip_across_block_sizes_and_levels() {
    let cases = [
        (1usize, 300usize),
        (7, 5_000),
        (256, 100_000),
        (256_000, 1_000_000),
        (1_000_000, 1_000_000),
    ];
    for (block_size, len) in cases {
        let data = payload(len);
        for level in [1, 5, 11, 19] {
            let file = build(&data, block_size, level);
            assert_eq!(
                read_all(file),
                data,
                "round trip failed for block_size={block_size} level={level}"
            );
        }
    }
}

#[test]
fn tiny_round_trip() {
    let file = build(b"Hello, world!\n", 4, 5);

    let mut reader = Reader::new(Cursor::new(file.clone()));
    let mut out = [0u8; 14];
    assert_eq!(reader.read(&mut out).unwrap(), 14);
    assert_eq!(&out, b"Hello, world!\n");
    assert_eq!(reader.read(&mut [0u8; 1]).unwrap(), 0);

    // 14 bytes over 4-byte blocks: 4 data frames, each with a preface, plus
    // the header frame
    let mut src = Cursor::new(file.clone());
    let index = SeekableIndex::load(&mut src).unwrap();
    assert!(index.len() >= 4);
    let data_frames = index.entries().iter().filter(|e| e.uncomp_sz > 0).count();
    assert_eq!(data_frames, 4);

    // The header frame appears exactly once, at offset zero
    let header_frames = index
        .entries()
        .iter()
        .filter(|e| e.uncomp_sz == 0 && e.comp_sz != 12)
        .count();
    assert_eq!(header_frames, 1);
}

#[test]
fn empty_stream_produces_valid_file() {
    let writer = Writer::<Vec<u8>>::builder().build(Vec::new()).unwrap();
    let file = writer.into_inner().unwrap();

    let mut src = Cursor::new(file.clone());
    let index = SeekableIndex::load(&mut src).unwrap();
    assert_eq!(index.len(), 0);
    assert_eq!(index.total_uncompressed(), 0);

    let mut reader = Reader::new(Cursor::new(file.clone()));
    assert_eq!(reader.check_eof().unwrap(), EofStatus::Present);
    assert_eq!(read_all(file), b"");
}

#[test]
fn unsplittable_oversize_write_is_standalone_frame() {
    let big = payload(10_000);
    let mut writer = Writer::<Vec<u8>>::builder().block_size(100).build(Vec::new()).unwrap();
    writer.write(b"lead", false).unwrap();
    writer.write(&big, false).unwrap();
    writer.write(b"tail", false).unwrap();
    let file = writer.into_inner().unwrap();

    let mut src = Cursor::new(file.clone());
    let index = SeekableIndex::load(&mut src).unwrap();
    let data_sizes: Vec<u32> = index
        .entries()
        .iter()
        .filter(|e| e.uncomp_sz > 0)
        .map(|e| e.uncomp_sz)
        .collect();
    assert_eq!(data_sizes, vec![4, 10_000, 4]);

    let mut expected = b"lead".to_vec();
    expected.extend_from_slice(&big);
    expected.extend_from_slice(b"tail");
    assert_eq!(read_all(file), expected);
}

#[test]
fn produced_files_decode_with_stock_zstd() {
    let data = payload(300_000);
    let file = build(&data, 10_000, 5);

    // A conforming Zstd decoder ignores all the skippable frames and
    // reproduces the raw byte stream
    let mut out = Vec::new();
    zstd::stream::copy_decode(Cursor::new(file), &mut out).unwrap();
    assert_eq!(out, data);
}

#[test]
fn empty_file_decodes_with_stock_zstd() {
    let writer = Writer::<Vec<u8>>::builder().build(Vec::new()).unwrap();
    let file = writer.into_inner().unwrap();
    let mut out = Vec::new();
    zstd::stream::copy_decode(Cursor::new(file), &mut out).unwrap();
    assert!(out.is_empty());
}

#[test]
fn eof_marker_present_on_finished_files() {
    let file = build(&payload(1000), 128, 3);
    let mut reader = Reader::new(Cursor::new(file));
    assert_eq!(reader.check_eof().unwrap(), EofStatus::Present);
}

#[test]
fn index_totals_are_consistent() {
    let data = payload(123_456);
    let file = build(&data, 1234, 4);

    let mut src = Cursor::new(file.clone());
    let index = SeekableIndex::load(&mut src).unwrap();

    let comp_total: u64 = index.entries().iter().map(|e| u64::from(e.comp_sz)).sum();
    let uncomp_total: u64 = index.entries().iter().map(|e| u64::from(e.uncomp_sz)).sum();
    assert_eq!(uncomp_total, data.len() as u64);
    // Compressed sizes cover every frame up to the trailing index
    assert_eq!(comp_total, file.len() as u64 - index.frame_bytes());
}

#[test]
fn write_respects_io_write_trait() {
    let data = payload(50_000);
    let mut writer = Writer::<Vec<u8>>::builder().block_size(4096).build(Vec::new()).unwrap();
    std::io::Write::write_all(&mut writer, &data).unwrap();
    let file = writer.into_inner().unwrap();
    assert_eq!(read_all(file), data);
}
