//! Random access: seek exactness over the seekable index, boundary
//! behaviors, and recovery from corrupted trailing frames.

use std::io::Cursor;

use bgzf2::{EofStatus, Error, Reader, Writer};

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
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

#[test]
fn seek_into_middle() {
    let data = payload(1_000_000);
    let file = build(&data, 1000, 3);

    let mut reader = Reader::new(Cursor::new(file));
    reader.seek(500_123).unwrap();
    let mut out = [0u8; 13];
    assert_eq!(reader.read(&mut out).unwrap(), 13);
    assert_eq!(&out[..], &data[500_123..500_136]);
}

#[test]
fn seek_exactness_at_sampled_offsets() {
    let data = payload(100_000);
    let file = build(&data, 777, 2);
    let mut reader = Reader::new(Cursor::new(file));

    for &upos in &[0u64, 1, 776, 777, 778, 42_424, 99_987, 99_999] {
        reader.seek(upos).unwrap();
        let want = &data[upos as usize..(upos as usize + 13).min(data.len())];
        let mut out = vec![0u8; want.len()];
        assert_eq!(reader.read(&mut out).unwrap(), want.len(), "at {upos}");
        assert_eq!(out.as_slice(), want, "at {upos}");
    }
}

#[test]
fn seek_to_total_length_gives_immediate_eof() {
    let data = payload(10_000);
    let file = build(&data, 512, 1);
    let mut reader = Reader::new(Cursor::new(file));

    reader.seek(10_000).unwrap();
    assert_eq!(reader.read(&mut [0u8; 16]).unwrap(), 0);

    // And the handle is still usable afterwards
    reader.seek(9_999).unwrap();
    let mut out = [0u8; 1];
    assert_eq!(reader.read(&mut out).unwrap(), 1);
    assert_eq!(out[0], data[9_999]);
}

#[test]
fn seek_past_end_fails_with_range() {
    let file = build(&payload(10_000), 512, 1);
    let mut reader = Reader::new(Cursor::new(file));
    assert!(matches!(reader.seek(10_001), Err(Error::Range { .. })));
    assert!(matches!(reader.seek(u64::MAX), Err(Error::Range { .. })));
}

#[test]
fn seek_after_reading_to_eof() {
    let data = payload(30_000);
    let file = build(&data, 1024, 1);
    let mut reader = Reader::new(Cursor::new(file));

    let mut all = Vec::new();
    std::io::Read::read_to_end(&mut reader, &mut all).unwrap();
    assert_eq!(all, data);
    assert_eq!(reader.read(&mut [0u8; 4]).unwrap(), 0);

    reader.seek(0).unwrap();
    let mut out = [0u8; 8];
    assert_eq!(reader.read(&mut out).unwrap(), 8);
    assert_eq!(&out[..], &data[..8]);
}

#[test]
fn corrupt_trailing_magic_disables_random_access() {
    let file = build(&payload(5_000), 256, 1);

    for flip in 1..=4usize {
        let mut corrupt = file.clone();
        let at = corrupt.len() - flip;
        corrupt[at] ^= 0xA5;

        let mut reader = Reader::new(Cursor::new(corrupt));
        assert_eq!(reader.check_eof().unwrap(), EofStatus::Absent);
        assert!(matches!(
            reader.load_seekable_index(),
            Err(Error::NoIndex)
        ));
        assert!(matches!(reader.seek(100), Err(Error::NoIndex)));
    }
}

#[test]
fn sequential_read_still_works_without_index() {
    // Streaming consumption does not need the trailing index at all
    let data = payload(20_000);
    let mut corrupt = build(&data, 1000, 1);
    let len = corrupt.len();
    corrupt[len - 1] ^= 0xFF;

    let mut reader = Reader::new(Cursor::new(corrupt));
    let mut out = Vec::new();
    std::io::Read::read_to_end(&mut reader, &mut out).unwrap();
    assert_eq!(out, data);
}

#[test]
fn seek_on_file_handle() {
    // Same flow against a real file rather than an in-memory cursor
    let data = payload(250_000);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("seek.bgz2");

    let file = std::fs::File::create(&path).unwrap();
    let mut writer = Writer::<std::io::BufWriter<std::fs::File>>::builder()
        .block_size(4096)
        .level(3)
        .build(std::io::BufWriter::new(file))
        .unwrap();
    writer.write(&data, true).unwrap();
    writer.finish().unwrap();

    let file = std::fs::File::open(&path).unwrap();
    let mut reader = Reader::new(std::io::BufReader::new(file));
    assert_eq!(reader.check_eof().unwrap(), EofStatus::Present);
    reader.seek(123_456).unwrap();
    let mut out = [0u8; 64];
    assert_eq!(reader.read(&mut out).unwrap(), 64);
    assert_eq!(&out[..], &data[123_456..123_520]);
}
